use serde_json::json;

use despacho_core::domain::session::SessionId;
use despacho_db::{migrations, SqlPendingActionRepository};
use despacho_db::repositories::PendingActionRepository;

use crate::commands::{load_config, open_pool, runtime, CommandResult, StepError};

/// Outstanding actions of one session, in confirmation priority order.
/// Expired actions are listed with `expired: true`; nothing is deleted.
pub fn list(session: &str) -> CommandResult {
    const COMMAND: &str = "pending.list";
    let config = match load_config(COMMAND) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime(COMMAND) {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };
    let session_id = SessionId::from(session);
    let ttl = config.conversation.pending_action_ttl();

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        let repository = SqlPendingActionRepository::new(pool.clone());
        let actions = repository
            .list_for_session(&session_id)
            .await
            .map_err(|error| ("repository", error.to_string(), 6u8))?;
        pool.close().await;
        Ok::<_, StepError>(actions)
    });

    match result {
        Ok(actions) => {
            let now = chrono::Utc::now();
            let rows: Vec<_> = actions
                .iter()
                .map(|action| {
                    json!({
                        "kind": action.kind.as_str(),
                        "tool": action.payload.call.name,
                        "summary": action.payload.summary,
                        "created_at": action.created_at.to_rfc3339(),
                        "expired": action.is_expired_at(now, ttl),
                    })
                })
                .collect();
            CommandResult::success_with_data(
                COMMAND,
                format!("{} pending action(s) for session `{session}`", rows.len()),
                Some(json!({ "session_id": session, "actions": rows })),
            )
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure(COMMAND, error_class, message, exit_code)
        }
    }
}

/// Deletes every pending action of the session without executing any.
pub fn clear(session: &str) -> CommandResult {
    const COMMAND: &str = "pending.clear";
    let config = match load_config(COMMAND) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime(COMMAND) {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };
    let session_id = SessionId::from(session);

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        let repository = SqlPendingActionRepository::new(pool.clone());
        let cleared = repository
            .clear_session(&session_id)
            .await
            .map_err(|error| ("repository", error.to_string(), 6u8))?;
        pool.close().await;
        Ok::<_, StepError>(cleared)
    });

    match result {
        Ok(cleared) => {
            tracing::info!(
                event_name = "cli.pending.cleared",
                session_id = %session,
                cleared,
                "pending actions cleared by operator"
            );
            CommandResult::success_with_data(
                COMMAND,
                format!("cleared {cleared} pending action(s) for session `{session}`"),
                Some(json!({ "session_id": session, "cleared": cleared })),
            )
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure(COMMAND, error_class, message, exit_code)
        }
    }
}
