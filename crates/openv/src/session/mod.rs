//! Session management module.
//!
//! Persisted session records, the request-scoped lifecycle service and the
//! background reconciler that keeps records and containers in agreement.

mod models;
mod reconciler;
mod repository;
mod service;

pub use models::{
    CreateSessionRequest, ExecRequest, ExecResponse, SessionRecord, SessionStatus,
    format_timestamp, parse_timestamp,
};
pub use reconciler::{CycleReport, Reconciler, ReconcilerSettings};
pub use repository::{Reset, SessionRepository};
pub use service::{
    DEFAULT_COMMAND, DEFAULT_IMAGE, SessionActivity, SessionService, SessionServiceConfig,
};
