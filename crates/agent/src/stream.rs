use serde::Serialize;
use serde_json::Value;

use despacho_core::domain::pending::PendingActionSummary;
use despacho_core::domain::session::SessionId;

use crate::context::ContextInjection;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Reset,
    Confirmed,
    Denied,
    /// The output channel closed mid-turn. Never sent, only returned.
    Cancelled,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Reset => "reset",
            Self::Confirmed => "confirmed",
            Self::Denied => "denied",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Payload of the done marker.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TurnSummary {
    pub session_id: SessionId,
    pub correlation_id: String,
    pub status: TurnStatus,
    pub text: String,
    /// Actions still awaiting confirmation after this turn, in priority order.
    pub pending_actions: Vec<PendingActionSummary>,
    /// Structured data of a turn that ran exactly one tool.
    pub data: Option<Value>,
    pub injections: Vec<ContextInjection>,
}

impl TurnSummary {
    pub fn is_cancelled(&self) -> bool {
        self.status == TurnStatus::Cancelled
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk(String),
    Done(TurnSummary),
}
