//! Domain records, configuration and audit plumbing shared by the dispatch
//! engine and its persistence layer.

pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use domain::pending::{
    PendingAction, PendingActionKind, PendingActionRequest, PendingActionSummary, PendingPayload,
};
pub use domain::reference::{DomainTag, IssuedReport, ReportId, ReportReference};
pub use domain::session::{HistoryEntry, Role, SessionId, SessionState};
pub use domain::tool::{ToolArguments, ToolCall, ToolContext, ToolEffects, ToolResult};
pub use errors::{ApplicationError, DomainError, InterfaceError};
