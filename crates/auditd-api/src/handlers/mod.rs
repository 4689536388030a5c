//! HTTP handlers, grouped by surface

pub mod approvals;
pub mod events;
pub mod governance;
