use async_trait::async_trait;
use thiserror::Error;

use despacho_core::domain::pending::{PendingAction, PendingActionKind};
use despacho_core::domain::session::{SessionId, SessionState};

pub mod memory;
pub mod pending_action;
pub mod session;

pub use memory::{InMemoryPendingActionRepository, InMemorySessionRepository};
pub use pending_action::SqlPendingActionRepository;
pub use session::SqlSessionRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("session `{session_id}` was modified concurrently (expected version {expected})")]
    VersionConflict { session_id: String, expected: u64 },
}

/// Storage for outstanding pending actions, keyed by `(session_id, kind)`.
///
/// Every method is a single atomic write or read; callers never observe a
/// partially written record.
#[async_trait]
pub trait PendingActionRepository: Send + Sync {
    /// Inserts or replaces the action for its `(session_id, kind)`.
    async fn upsert(&self, action: PendingAction) -> Result<(), RepositoryError>;

    async fn find(
        &self,
        session_id: &SessionId,
        kind: PendingActionKind,
    ) -> Result<Option<PendingAction>, RepositoryError>;

    /// Deletes and returns the action in one step.
    async fn take(
        &self,
        session_id: &SessionId,
        kind: PendingActionKind,
    ) -> Result<Option<PendingAction>, RepositoryError>;

    async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<PendingAction>, RepositoryError>;

    async fn clear_session(&self, session_id: &SessionId) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn load(&self, session_id: &SessionId) -> Result<Option<SessionState>, RepositoryError>;

    /// Persists `state` if the stored version still equals `state.version`
    /// and returns the new version.
    async fn save(&self, state: &SessionState) -> Result<u64, RepositoryError>;
}
