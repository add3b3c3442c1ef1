use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use despacho_core::domain::pending::{
    PendingAction, PendingActionKind, PendingActionRequest, PendingPayload,
};
use despacho_core::domain::session::SessionId;
use despacho_db::repositories::{PendingActionRepository, RepositoryError};

/// Result of looking up one `(session, kind)` slot.
#[derive(Clone, Debug, PartialEq)]
pub enum PendingLookup {
    Outstanding(PendingAction),
    /// The action outlived its TTL and has been removed (implicit deny).
    Expired(PendingAction),
    Absent,
}

/// At most one outstanding action per `(session, kind)`, with expiry.
#[derive(Clone)]
pub struct PendingActionStore {
    repository: Arc<dyn PendingActionRepository>,
    ttl: Duration,
}

impl PendingActionStore {
    pub fn new(repository: Arc<dyn PendingActionRepository>, ttl: Duration) -> Self {
        Self { repository, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Replaces any earlier action of the same kind for the session.
    pub async fn create(
        &self,
        session_id: &SessionId,
        kind: PendingActionKind,
        payload: PendingPayload,
    ) -> Result<PendingAction, RepositoryError> {
        self.create_at(session_id, kind, payload, Utc::now()).await
    }

    pub async fn create_at(
        &self,
        session_id: &SessionId,
        kind: PendingActionKind,
        payload: PendingPayload,
        now: DateTime<Utc>,
    ) -> Result<PendingAction, RepositoryError> {
        let action =
            PendingAction { session_id: session_id.clone(), kind, created_at: now, payload };
        self.repository.upsert(action.clone()).await?;
        info!(
            event_name = "pending.created",
            session_id = %session_id,
            kind = %kind,
            tool = %action.payload.call.name,
            "pending action stored"
        );
        Ok(action)
    }

    pub async fn create_from_request(
        &self,
        session_id: &SessionId,
        request: PendingActionRequest,
    ) -> Result<PendingAction, RepositoryError> {
        self.create(session_id, request.kind, request.payload).await
    }

    pub async fn find(
        &self,
        session_id: &SessionId,
        kind: PendingActionKind,
    ) -> Result<Option<PendingAction>, RepositoryError> {
        match self.lookup_at(session_id, kind, Utc::now()).await? {
            PendingLookup::Outstanding(action) => Ok(Some(action)),
            PendingLookup::Expired(_) | PendingLookup::Absent => Ok(None),
        }
    }

    pub async fn lookup(
        &self,
        session_id: &SessionId,
        kind: PendingActionKind,
    ) -> Result<PendingLookup, RepositoryError> {
        self.lookup_at(session_id, kind, Utc::now()).await
    }

    pub async fn lookup_at(
        &self,
        session_id: &SessionId,
        kind: PendingActionKind,
        now: DateTime<Utc>,
    ) -> Result<PendingLookup, RepositoryError> {
        let Some(action) = self.repository.find(session_id, kind).await? else {
            return Ok(PendingLookup::Absent);
        };

        if !action.is_expired_at(now, self.ttl) {
            return Ok(PendingLookup::Outstanding(action));
        }

        // Only report expiry if this call removed it; a concurrent claim wins.
        match self.repository.take(session_id, kind).await? {
            Some(expired) if expired.created_at == action.created_at => {
                info!(
                    event_name = "pending.expired",
                    session_id = %session_id,
                    kind = %kind,
                    age_secs = now.signed_duration_since(expired.created_at).num_seconds(),
                    "pending action expired"
                );
                Ok(PendingLookup::Expired(expired))
            }
            Some(newer) => {
                // Replaced between the read and the delete; put it back untouched.
                self.repository.upsert(newer.clone()).await?;
                Ok(PendingLookup::Outstanding(newer))
            }
            None => Ok(PendingLookup::Absent),
        }
    }

    /// Removes and returns the action so it can be executed exactly once.
    /// Returns `None` if nothing was outstanding or it had already expired.
    pub async fn claim(
        &self,
        session_id: &SessionId,
        kind: PendingActionKind,
    ) -> Result<Option<PendingAction>, RepositoryError> {
        self.claim_at(session_id, kind, Utc::now()).await
    }

    pub async fn claim_at(
        &self,
        session_id: &SessionId,
        kind: PendingActionKind,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingAction>, RepositoryError> {
        let taken = self.repository.take(session_id, kind).await?;
        Ok(taken.filter(|action| {
            let live = !action.is_expired_at(now, self.ttl);
            if !live {
                debug!(
                    event_name = "pending.claim_expired",
                    session_id = %session_id,
                    kind = %kind,
                    "claimed pending action had already expired"
                );
            }
            live
        }))
    }

    /// Drops the action without executing it. Returns whether one existed.
    pub async fn discard(
        &self,
        session_id: &SessionId,
        kind: PendingActionKind,
    ) -> Result<bool, RepositoryError> {
        Ok(self.repository.take(session_id, kind).await?.is_some())
    }

    /// Live actions for the session in priority order; expired ones are purged.
    pub async fn list_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<PendingAction>, RepositoryError> {
        self.list_session_at(session_id, Utc::now()).await
    }

    pub async fn list_session_at(
        &self,
        session_id: &SessionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingAction>, RepositoryError> {
        let mut live = Vec::new();
        for kind in PendingActionKind::PRIORITY_ORDER {
            if let PendingLookup::Outstanding(action) =
                self.lookup_at(session_id, kind, now).await?
            {
                live.push(action);
            }
        }
        Ok(live)
    }

    pub async fn clear_session(&self, session_id: &SessionId) -> Result<u64, RepositoryError> {
        self.repository.clear_session(session_id).await
    }
}
