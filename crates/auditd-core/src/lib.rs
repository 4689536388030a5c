//! # auditd-core
//!
//! Core types for the auditd governance daemon: the hash-chained audit event
//! model, canonical hashing and chain verification, and the approval request
//! lifecycle.
//!
//! ## Key types
//!
//! - [`AuditEvent`] — immutable, hash-chained governance event
//! - [`ApprovalRequest`] — human-in-the-loop decision gate record
//! - [`ChainStatus`] — aggregate result of a chain verification walk
//!
//! ## Hashing
//!
//! ```rust
//! use auditd_core::{AuditEvent, EventType, compute_event_hash, GENESIS_HASH};
//!
//! let mut event = AuditEvent::new(EventType::ToolExecution);
//! event.event_id = auditd_core::new_event_id(EventType::ToolExecution);
//! event.timestamp = chrono::Utc::now();
//! event.prev_hash = GENESIS_HASH.to_string();
//! event.event_hash = compute_event_hash(&event);
//! assert!(auditd_core::verify_event_hash(&event));
//! ```

pub mod approval;
pub mod event;
pub mod hash;

pub use approval::{
    new_approval_id, ApprovalRequest, ApprovalStatus, NewApproval, DEFAULT_EXPIRY_MINUTES,
};
pub use event::{
    new_check_trace_id, new_event_id, ActionClass, AgentReasoning, ApprovalInfo, AuditEvent,
    DecisionInfo, EventType, OutcomeInfo, PolicyDecisionInfo, SessionInfo, ToolCall, GENESIS_HASH,
};
pub use hash::{
    compute_event_hash, verify_chain, verify_chain_status, verify_event_hash, ChainError,
    ChainStatus,
};
