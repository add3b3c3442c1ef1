use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::session::SessionId;
use crate::domain::tool::ToolCall;
use crate::errors::DomainError;

/// Kinds of sensitive operations that wait for an explicit confirmation turn.
///
/// Variant order is the resolution priority when several kinds are outstanding
/// for the same session: financial first, then documents, then communication.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingActionKind {
    Payment,
    DocumentRegistration,
    Communication,
}

impl PendingActionKind {
    pub const PRIORITY_ORDER: [PendingActionKind; 3] =
        [Self::Payment, Self::DocumentRegistration, Self::Communication];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::DocumentRegistration => "document_registration",
            Self::Communication => "communication",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::DocumentRegistration => "document registration",
            Self::Communication => "message",
        }
    }
}

impl std::str::FromStr for PendingActionKind {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "payment" => Ok(Self::Payment),
            "document_registration" => Ok(Self::DocumentRegistration),
            "communication" => Ok(Self::Communication),
            other => Err(DomainError::UnknownPendingKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for PendingActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a handler hands back when an operation must be confirmed first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingActionRequest {
    pub kind: PendingActionKind,
    pub payload: PendingPayload,
}

impl PendingActionRequest {
    pub fn new(kind: PendingActionKind, call: ToolCall, summary: impl Into<String>) -> Self {
        Self { kind, payload: PendingPayload { call, summary: summary.into() } }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingPayload {
    /// Replayed through the dispatch registry when the user confirms.
    pub call: ToolCall,
    pub summary: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub session_id: SessionId,
    pub kind: PendingActionKind,
    pub created_at: DateTime<Utc>,
    pub payload: PendingPayload,
}

impl PendingAction {
    pub fn is_expired_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.created_at) > ttl
    }

    pub fn summary(&self) -> PendingActionSummary {
        PendingActionSummary {
            kind: self.kind,
            summary: self.payload.summary.clone(),
            created_at: self.created_at,
        }
    }
}

/// Side-channel view of an outstanding action, sent with the done marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingActionSummary {
    pub kind: PendingActionKind,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{PendingAction, PendingActionKind, PendingPayload};
    use crate::domain::session::SessionId;
    use crate::domain::tool::ToolCall;

    #[test]
    fn priority_order_puts_payment_first() {
        let mut kinds = vec![
            PendingActionKind::Communication,
            PendingActionKind::Payment,
            PendingActionKind::DocumentRegistration,
        ];
        kinds.sort();

        assert_eq!(kinds, PendingActionKind::PRIORITY_ORDER.to_vec());
    }

    #[test]
    fn kind_parses_from_storage_form() {
        for kind in PendingActionKind::PRIORITY_ORDER {
            assert_eq!(kind.as_str().parse::<PendingActionKind>().expect("parse kind"), kind);
        }
        assert!("refund".parse::<PendingActionKind>().is_err());
    }

    #[test]
    fn expiry_is_strictly_after_ttl() {
        let created_at = Utc::now();
        let action = PendingAction {
            session_id: SessionId::from("s-1"),
            kind: PendingActionKind::Payment,
            created_at,
            payload: PendingPayload {
                call: ToolCall::new("execute_payment"),
                summary: "Pay DARF 1234".to_string(),
            },
        };

        let ttl = Duration::seconds(600);
        assert!(!action.is_expired_at(created_at + ttl, ttl));
        assert!(action.is_expired_at(created_at + ttl + Duration::seconds(1), ttl));
    }
}
