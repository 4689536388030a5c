//! # auditd-persist
//!
//! Storage for the governance daemon:
//!
//! - hash-chained audit events with indexed queries and chain verification
//! - approval requests with one-shot transitions, long-poll waiters and an
//!   expiration sweep
//! - a fan-out hub that pushes every appended event to live subscribers
//!
//! Two engines are supported behind one API, selected by DSN prefix:
//! embedded SQLite for single-node deployments and PostgreSQL for
//! server-backed ones.

pub mod approval_store;
pub mod backend;
pub mod event_store;
pub mod stream;

pub use approval_store::{ApprovalFilter, ApprovalStore};
pub use backend::{DbPool, SqlValue, StorageError};
pub use event_store::{EventQuery, EventStore};
pub use stream::{StreamHub, StreamSubscription};
