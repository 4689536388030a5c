//! # auditd-api
//!
//! HTTP surface for the governance daemon: audit event append/query/verify,
//! the approval workflow (including the long-poll wait endpoint), and the
//! governance info/explain/check endpoints.
//!
//! All request and response bodies are JSON; errors render as
//! `{"error": "<message>"}` with a matching status code.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod state;
pub mod worker;

pub use error::{ApiError, ApiResult};
pub use routes::api_router;
pub use state::AppState;
