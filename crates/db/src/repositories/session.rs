use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::Row;

use despacho_core::domain::reference::{DomainTag, ReportId, ReportReference};
use despacho_core::domain::session::{HistoryEntry, SessionId, SessionState};

use super::{RepositoryError, SessionRepository};
use crate::DbPool;

const ACTIVE_SLOT: &str = "active";
const VISIBLE_SLOT: &str = "visible";

pub struct SqlSessionRepository {
    pool: DbPool,
}

impl SqlSessionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn decode_err(e: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Decode(e.to_string())
}

fn row_to_reference(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<(String, ReportReference), RepositoryError> {
    let slot: String = row.try_get("slot").map_err(decode_err)?;
    let domain_str: String = row.try_get("domain").map_err(decode_err)?;
    let report_id: String = row.try_get("report_id").map_err(decode_err)?;
    let label: Option<String> = row.try_get("label").map_err(decode_err)?;
    let created_at_str: String = row.try_get("created_at").map_err(decode_err)?;

    let domain = domain_str.parse::<DomainTag>().map_err(decode_err)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("report created_at: {e}")))?;

    Ok((slot, ReportReference { id: ReportId(report_id), domain, created_at, label }))
}

#[async_trait::async_trait]
impl SessionRepository for SqlSessionRepository {
    async fn load(&self, session_id: &SessionId) -> Result<Option<SessionState>, RepositoryError> {
        let row = sqlx::query(
            "SELECT version, history_json FROM session_state WHERE session_id = ?",
        )
        .bind(&session_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let version: i64 = row.try_get("version").map_err(decode_err)?;
        let history_json: String = row.try_get("history_json").map_err(decode_err)?;
        let history = serde_json::from_str::<Vec<HistoryEntry>>(&history_json)
            .map_err(|e| RepositoryError::Decode(format!("history: {e}")))?;

        let reference_rows = sqlx::query(
            "SELECT slot, domain, report_id, label, created_at
             FROM report_reference WHERE session_id = ?",
        )
        .bind(&session_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut active_references = BTreeMap::new();
        let mut visible_references = BTreeMap::new();
        for reference_row in &reference_rows {
            let (slot, reference) = row_to_reference(reference_row)?;
            match slot.as_str() {
                ACTIVE_SLOT => active_references.insert(reference.domain, reference),
                VISIBLE_SLOT => visible_references.insert(reference.domain, reference),
                other => return Err(RepositoryError::Decode(format!("unknown slot `{other}`"))),
            };
        }

        Ok(Some(SessionState {
            session_id: session_id.clone(),
            version: u64::try_from(version).map_err(decode_err)?,
            active_references,
            visible_references,
            history,
        }))
    }

    async fn save(&self, state: &SessionState) -> Result<u64, RepositoryError> {
        let history_json = serde_json::to_string(&state.history)
            .map_err(|e| RepositoryError::Decode(format!("history: {e}")))?;
        let expected = i64::try_from(state.version).map_err(decode_err)?;
        let next_version = state.version + 1;
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;

        let affected = if state.version == 0 {
            sqlx::query(
                "INSERT INTO session_state (session_id, version, history_json, updated_at)
                 VALUES (?, 1, ?, ?)
                 ON CONFLICT(session_id) DO NOTHING",
            )
            .bind(&state.session_id.0)
            .bind(&history_json)
            .bind(&now)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE session_state SET version = version + 1, history_json = ?, updated_at = ?
                 WHERE session_id = ? AND version = ?",
            )
            .bind(&history_json)
            .bind(&now)
            .bind(&state.session_id.0)
            .bind(expected)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        };

        if affected == 0 {
            tx.rollback().await?;
            return Err(RepositoryError::VersionConflict {
                session_id: state.session_id.0.clone(),
                expected: state.version,
            });
        }

        sqlx::query("DELETE FROM report_reference WHERE session_id = ?")
            .bind(&state.session_id.0)
            .execute(&mut *tx)
            .await?;

        let slots = state
            .active_references
            .values()
            .map(|reference| (ACTIVE_SLOT, reference))
            .chain(state.visible_references.values().map(|reference| (VISIBLE_SLOT, reference)));
        for (slot, reference) in slots {
            sqlx::query(
                "INSERT INTO report_reference
                     (session_id, slot, domain, report_id, label, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&state.session_id.0)
            .bind(slot)
            .bind(reference.domain.as_str())
            .bind(&reference.id.0)
            .bind(&reference.label)
            .bind(reference.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(next_version)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use despacho_core::domain::reference::{DomainTag, IssuedReport, ReportReference};
    use despacho_core::domain::session::{HistoryEntry, SessionId, SessionState};

    use super::SqlSessionRepository;
    use crate::repositories::{RepositoryError, SessionRepository};
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn unknown_session_loads_as_none() {
        let repo = SqlSessionRepository::new(setup().await);
        assert!(repo.load(&SessionId::from("missing")).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn references_and_history_survive_a_save() {
        let repo = SqlSessionRepository::new(setup().await);
        let now = Utc::now();
        let mut state = SessionState::new(SessionId::from("s-1"));
        state.record_report(IssuedReport {
            reference: ReportReference::new("rpt-log-1", DomainTag::Logistics, now)
                .with_label("open processes"),
            activate: true,
        });
        state.record_report(IssuedReport {
            reference: ReportReference::new("rpt-fin-1", DomainTag::Finance, now),
            activate: false,
        });
        state.push_history(HistoryEntry::user("list processes", now), 10);
        state.push_history(
            HistoryEntry::assistant("12 open processes [ref:rpt-log-1]", now, Some(DomainTag::Logistics)),
            10,
        );

        let version = repo.save(&state).await.expect("save");
        let loaded = repo.load(&state.session_id).await.expect("load").expect("stored");

        assert_eq!(version, 1);
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.history, state.history);
        assert_eq!(
            loaded.active_reference(DomainTag::Logistics).and_then(|r| r.label.as_deref()),
            Some("open processes")
        );
        assert!(loaded.active_reference(DomainTag::Finance).is_none());
        assert_eq!(
            loaded.visible_reference(DomainTag::Finance).map(|r| r.id.0.as_str()),
            Some("rpt-fin-1")
        );
    }

    #[tokio::test]
    async fn stale_version_is_rejected_and_state_is_kept() {
        let repo = SqlSessionRepository::new(setup().await);
        let mut state = SessionState::new(SessionId::from("s-2"));
        state.push_history(HistoryEntry::user("first", Utc::now()), 10);
        repo.save(&state).await.expect("initial save");

        let mut stale = state.clone();
        stale.push_history(HistoryEntry::user("lost update", Utc::now()), 10);
        let error = repo.save(&stale).await.expect_err("version 0 is stale");
        assert!(matches!(error, RepositoryError::VersionConflict { expected: 0, .. }));

        let mut current = repo.load(&state.session_id).await.expect("load").expect("stored");
        current.push_history(HistoryEntry::user("second", Utc::now()), 10);
        assert_eq!(repo.save(&current).await.expect("save current"), 2);

        let reloaded = repo.load(&state.session_id).await.expect("load").expect("stored");
        let texts = reloaded.history.iter().map(|entry| entry.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn cleared_state_drops_persisted_references() {
        let repo = SqlSessionRepository::new(setup().await);
        let mut state = SessionState::new(SessionId::from("s-3"));
        state.record_report(IssuedReport {
            reference: ReportReference::new(
                "rpt-1",
                DomainTag::Documents,
                Utc::now() - Duration::minutes(5),
            ),
            activate: true,
        });
        repo.save(&state).await.expect("save");

        let mut loaded = repo.load(&state.session_id).await.expect("load").expect("stored");
        loaded.clear();
        repo.save(&loaded).await.expect("save cleared");

        let reloaded = repo.load(&state.session_id).await.expect("load").expect("stored");
        assert!(reloaded.active_references.is_empty());
        assert!(reloaded.visible_references.is_empty());
        assert_eq!(reloaded.version, 2);
    }
}
