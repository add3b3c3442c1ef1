use std::collections::HashMap;

use tokio::sync::RwLock;

use despacho_core::domain::pending::{PendingAction, PendingActionKind};
use despacho_core::domain::session::{SessionId, SessionState};

use super::{PendingActionRepository, RepositoryError, SessionRepository};

#[derive(Default)]
pub struct InMemoryPendingActionRepository {
    actions: RwLock<HashMap<(String, PendingActionKind), PendingAction>>,
}

#[async_trait::async_trait]
impl PendingActionRepository for InMemoryPendingActionRepository {
    async fn upsert(&self, action: PendingAction) -> Result<(), RepositoryError> {
        let mut actions = self.actions.write().await;
        actions.insert((action.session_id.0.clone(), action.kind), action);
        Ok(())
    }

    async fn find(
        &self,
        session_id: &SessionId,
        kind: PendingActionKind,
    ) -> Result<Option<PendingAction>, RepositoryError> {
        let actions = self.actions.read().await;
        Ok(actions.get(&(session_id.0.clone(), kind)).cloned())
    }

    async fn take(
        &self,
        session_id: &SessionId,
        kind: PendingActionKind,
    ) -> Result<Option<PendingAction>, RepositoryError> {
        let mut actions = self.actions.write().await;
        Ok(actions.remove(&(session_id.0.clone(), kind)))
    }

    async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<PendingAction>, RepositoryError> {
        let actions = self.actions.read().await;
        let mut found = actions
            .values()
            .filter(|action| action.session_id == *session_id)
            .cloned()
            .collect::<Vec<_>>();
        found.sort_by_key(|action| action.kind);
        Ok(found)
    }

    async fn clear_session(&self, session_id: &SessionId) -> Result<u64, RepositoryError> {
        let mut actions = self.actions.write().await;
        let before = actions.len();
        actions.retain(|(owner, _), _| owner != &session_id.0);
        Ok((before - actions.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<String, SessionState>>,
}

#[async_trait::async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn load(&self, session_id: &SessionId) -> Result<Option<SessionState>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&session_id.0).cloned())
    }

    async fn save(&self, state: &SessionState) -> Result<u64, RepositoryError> {
        let mut sessions = self.sessions.write().await;
        let stored_version = sessions.get(&state.session_id.0).map(|stored| stored.version);
        if stored_version.unwrap_or(0) != state.version {
            return Err(RepositoryError::VersionConflict {
                session_id: state.session_id.0.clone(),
                expected: state.version,
            });
        }

        let mut next = state.clone();
        next.version = state.version + 1;
        sessions.insert(state.session_id.0.clone(), next);
        Ok(state.version + 1)
    }
}
