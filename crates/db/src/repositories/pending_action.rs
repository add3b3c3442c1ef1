use chrono::{DateTime, Utc};
use sqlx::Row;

use despacho_core::domain::pending::{PendingAction, PendingActionKind, PendingPayload};
use despacho_core::domain::session::SessionId;

use super::{PendingActionRepository, RepositoryError};
use crate::DbPool;

pub struct SqlPendingActionRepository {
    pool: DbPool,
}

impl SqlPendingActionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_pending_action(row: &sqlx::sqlite::SqliteRow) -> Result<PendingAction, RepositoryError> {
    let session_id: String =
        row.try_get("session_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let kind_str: String =
        row.try_get("kind").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let payload_json: String =
        row.try_get("payload_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at_str: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let kind = kind_str
        .parse::<PendingActionKind>()
        .map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let payload = serde_json::from_str::<PendingPayload>(&payload_json)
        .map_err(|e| RepositoryError::Decode(format!("pending payload: {e}")))?;
    // An unreadable timestamp must not make an action look fresh.
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("created_at: {e}")))?;

    Ok(PendingAction { session_id: SessionId(session_id), kind, created_at, payload })
}

#[async_trait::async_trait]
impl PendingActionRepository for SqlPendingActionRepository {
    async fn upsert(&self, action: PendingAction) -> Result<(), RepositoryError> {
        let payload_json = serde_json::to_string(&action.payload)
            .map_err(|e| RepositoryError::Decode(format!("pending payload: {e}")))?;

        sqlx::query(
            "INSERT INTO pending_action (session_id, kind, payload_json, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(session_id, kind) DO UPDATE SET
                 payload_json = excluded.payload_json,
                 created_at = excluded.created_at",
        )
        .bind(&action.session_id.0)
        .bind(action.kind.as_str())
        .bind(payload_json)
        .bind(action.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(
        &self,
        session_id: &SessionId,
        kind: PendingActionKind,
    ) -> Result<Option<PendingAction>, RepositoryError> {
        let row = sqlx::query(
            "SELECT session_id, kind, payload_json, created_at
             FROM pending_action WHERE session_id = ? AND kind = ?",
        )
        .bind(&session_id.0)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_pending_action(r)?)),
            None => Ok(None),
        }
    }

    async fn take(
        &self,
        session_id: &SessionId,
        kind: PendingActionKind,
    ) -> Result<Option<PendingAction>, RepositoryError> {
        let row = sqlx::query(
            "DELETE FROM pending_action WHERE session_id = ? AND kind = ?
             RETURNING session_id, kind, payload_json, created_at",
        )
        .bind(&session_id.0)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_pending_action(r)?)),
            None => Ok(None),
        }
    }

    async fn list_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<PendingAction>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT session_id, kind, payload_json, created_at
             FROM pending_action WHERE session_id = ?",
        )
        .bind(&session_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut actions = rows.iter().map(row_to_pending_action).collect::<Result<Vec<_>, _>>()?;
        actions.sort_by_key(|action| action.kind);
        Ok(actions)
    }

    async fn clear_session(&self, session_id: &SessionId) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM pending_action WHERE session_id = ?")
            .bind(&session_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
