//! Per-message orchestration: reset, pending confirmation, precheck rules,
//! model round-trip, context resolution and dispatch, result combination and
//! sanitised streaming. Every failure inside a turn ends up as user-facing
//! text; nothing escapes `handle_turn` as an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use despacho_core::audit::{
    AuditCategory, AuditContext, AuditOutcome, AuditSink, TracingAuditSink,
};
use despacho_core::config::{AppConfig, ConversationConfig};
use despacho_core::domain::pending::{PendingAction, PendingActionKind};
use despacho_core::domain::reference::{DomainTag, IssuedReport};
use despacho_core::domain::session::{HistoryEntry, SessionId, SessionState};
use despacho_core::domain::tool::{ToolCall, ToolContext, ToolResult};
use despacho_core::errors::ApplicationError;
use despacho_db::repositories::{
    InMemoryPendingActionRepository, InMemorySessionRepository, PendingActionRepository,
    RepositoryError, SessionRepository,
};

use crate::confirmation::{ConfirmationMatcher, ConfirmationVerdict};
use crate::context::{ContextInjection, ContextPolicy, ContextResolver};
use crate::conversation::is_reset_command;
use crate::llm::{LlmClient, ModelRequest, ModelResponse};
use crate::pending::{PendingActionStore, PendingLookup};
use crate::precheck::PrecheckRules;
use crate::sanitizer::{BoilerplateSanitizer, Sanitize, StreamingSanitizer};
use crate::stream::{StreamEvent, TurnStatus, TurnSummary};
use crate::tools::{execute_isolated, HandlerGroup, RouteOutcome, ToolDispatchRegistry};

const ACTOR: &str = "conversation-pipeline";
const RESET_TEXT: &str = "Context cleared. Let's start over.";
const MODEL_FAILURE_TEXT: &str =
    "Sorry, I couldn't process that request right now. Please try again in a moment.";
const EMPTY_RESPONSE_TEXT: &str = "Done.";
const STREAM_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid built-in pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<PipelineError> for ApplicationError {
    fn from(value: PipelineError) -> Self {
        match value {
            PipelineError::Pattern(error) => Self::Configuration(error.to_string()),
            PipelineError::Repository(error) => Self::Persistence(error.to_string()),
        }
    }
}

pub struct PipelineBuilder {
    registry: Arc<ToolDispatchRegistry>,
    llm: Arc<dyn LlmClient>,
    sessions: Option<Arc<dyn SessionRepository>>,
    pending: Option<Arc<dyn PendingActionRepository>>,
    audit: Option<Arc<dyn AuditSink>>,
    matcher: Option<ConfirmationMatcher>,
    precheck: Option<PrecheckRules>,
    sanitizer: Option<Arc<dyn Sanitize>>,
    policy: Option<ContextPolicy>,
    fallback: Option<Arc<dyn HandlerGroup>>,
    config: ConversationConfig,
    tool_catalog_limit: usize,
    model_timeout: StdDuration,
}

impl PipelineBuilder {
    pub fn sessions(mut self, repository: Arc<dyn SessionRepository>) -> Self {
        self.sessions = Some(repository);
        self
    }

    pub fn pending_actions(mut self, repository: Arc<dyn PendingActionRepository>) -> Self {
        self.pending = Some(repository);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn matcher(mut self, matcher: ConfirmationMatcher) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn precheck(mut self, rules: PrecheckRules) -> Self {
        self.precheck = Some(rules);
        self
    }

    pub fn sanitizer(mut self, sanitizer: Arc<dyn Sanitize>) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    pub fn context_policy(mut self, policy: ContextPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Receives tool names the registry does not map.
    pub fn legacy_fallback(mut self, handler: Arc<dyn HandlerGroup>) -> Self {
        self.fallback = Some(handler);
        self
    }

    /// Applies the `conversation` section plus the model limits of `llm`.
    pub fn app_config(self, config: &AppConfig) -> Self {
        self.conversation_config(config.conversation.clone())
            .tool_catalog_limit(config.llm.tool_catalog_limit)
            .model_timeout(StdDuration::from_secs(config.llm.timeout_secs))
    }

    pub fn conversation_config(mut self, config: ConversationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tool_catalog_limit(mut self, limit: usize) -> Self {
        self.tool_catalog_limit = limit;
        self
    }

    pub fn model_timeout(mut self, timeout: StdDuration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ConversationPipeline, PipelineError> {
        let precheck = match self.precheck {
            Some(rules) => rules,
            None => PrecheckRules::builtin()?,
        };
        let sanitizer: Arc<dyn Sanitize> = match self.sanitizer {
            Some(sanitizer) => sanitizer,
            None => Arc::new(BoilerplateSanitizer::builtin()?),
        };
        let mut config = self.config;
        if config.stream_holdback_chars < sanitizer.min_holdback() {
            warn!(
                event_name = "stream.holdback_raised",
                configured = config.stream_holdback_chars,
                raised_to = sanitizer.min_holdback(),
                "stream holdback shorter than the longest filtered phrase"
            );
            config.stream_holdback_chars = sanitizer.min_holdback();
        }
        let pending_repository = self
            .pending
            .unwrap_or_else(|| Arc::new(InMemoryPendingActionRepository::default()));

        Ok(ConversationPipeline {
            registry: self.registry,
            llm: self.llm,
            sessions: self
                .sessions
                .unwrap_or_else(|| Arc::new(InMemorySessionRepository::default())),
            pending: PendingActionStore::new(pending_repository, config.pending_action_ttl()),
            resolver: ContextResolver::new(
                self.policy.unwrap_or_default(),
                config.reference_max_age(),
                config.history_scan_limit,
            ),
            matcher: self.matcher.unwrap_or_default(),
            precheck,
            sanitizer,
            audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink)),
            fallback: self.fallback,
            config,
            tool_catalog_limit: self.tool_catalog_limit,
            model_timeout: self.model_timeout,
            gates: Mutex::new(HashMap::new()),
        })
    }
}

/// Mutable bookkeeping for one turn.
struct Turn {
    session_id: SessionId,
    correlation_id: String,
    message: String,
    audit: AuditContext,
    injections: Vec<ContextInjection>,
    reports: Vec<IssuedReport>,
}

impl Turn {
    fn tool_context(&self, confirmed: bool) -> ToolContext {
        let context =
            ToolContext::new(self.session_id.clone(), &self.message, &self.correlation_id);
        if confirmed {
            context.confirmed()
        } else {
            context
        }
    }

    fn reported_domain(&self) -> Option<DomainTag> {
        self.reports.last().map(|issued| issued.reference.domain)
    }

    fn history_markers(&self) -> String {
        self.reports
            .iter()
            .map(|issued| issued.reference.history_marker())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What a turn produced before sanitising and streaming.
struct Reply {
    status: TurnStatus,
    text: String,
    data: Option<Value>,
}

impl Reply {
    fn new(status: TurnStatus, text: impl Into<String>) -> Self {
        Self { status, text: text.into(), data: None }
    }
}

pub struct ConversationPipeline {
    registry: Arc<ToolDispatchRegistry>,
    llm: Arc<dyn LlmClient>,
    sessions: Arc<dyn SessionRepository>,
    pending: PendingActionStore,
    resolver: ContextResolver,
    matcher: ConfirmationMatcher,
    precheck: PrecheckRules,
    sanitizer: Arc<dyn Sanitize>,
    audit: Arc<dyn AuditSink>,
    fallback: Option<Arc<dyn HandlerGroup>>,
    config: ConversationConfig,
    tool_catalog_limit: usize,
    model_timeout: StdDuration,
    gates: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl ConversationPipeline {
    pub fn builder(
        registry: Arc<ToolDispatchRegistry>,
        llm: Arc<dyn LlmClient>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            registry,
            llm,
            sessions: None,
            pending: None,
            audit: None,
            matcher: None,
            precheck: None,
            sanitizer: None,
            policy: None,
            fallback: None,
            config: ConversationConfig::default(),
            tool_catalog_limit: 64,
            model_timeout: StdDuration::from_secs(30),
        }
    }

    pub fn pending_store(&self) -> &PendingActionStore {
        &self.pending
    }

    pub fn registry(&self) -> &ToolDispatchRegistry {
        &self.registry
    }

    /// Runs one turn and streams its output into `output`. Turns of the same
    /// session run strictly one after another.
    ///
    /// If `output` closes mid-turn the remaining work is skipped, no `Done`
    /// is sent and the returned summary has status `Cancelled`.
    pub async fn handle_turn(
        &self,
        session_id: SessionId,
        message: &str,
        output: mpsc::Sender<StreamEvent>,
    ) -> TurnSummary {
        let correlation_id = Uuid::new_v4().to_string();
        let gate = self.gate(&session_id).await;
        let summary = {
            let _serialized = gate.lock().await;
            let mut turn = Turn {
                session_id: session_id.clone(),
                correlation_id: correlation_id.clone(),
                message: message.to_string(),
                audit: AuditContext::new(Some(session_id.clone()), &correlation_id, ACTOR),
                injections: Vec::new(),
                reports: Vec::new(),
            };
            info!(
                event_name = "turn.started",
                correlation_id = %correlation_id,
                session_id = %session_id,
                "conversation turn started"
            );
            self.run_turn(&mut turn, &output).await
        };
        self.release_gate(&session_id, gate).await;
        summary
    }

    /// Runs a turn and collects its chunks; convenient for non-streaming callers.
    pub async fn respond(
        &self,
        session_id: SessionId,
        message: &str,
    ) -> (Vec<String>, TurnSummary) {
        let (sender, mut receiver) = mpsc::channel(STREAM_BUFFER);
        let collect = async move {
            let mut chunks = Vec::new();
            while let Some(event) = receiver.recv().await {
                if let StreamEvent::Chunk(chunk) = event {
                    chunks.push(chunk);
                }
            }
            chunks
        };
        let (summary, chunks) =
            tokio::join!(self.handle_turn(session_id, message, sender), collect);
        (chunks, summary)
    }

    async fn run_turn(&self, turn: &mut Turn, output: &mpsc::Sender<StreamEvent>) -> TurnSummary {
        let reply = match self.process(turn, output).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return self.cancelled(turn).await,
            Err(failure) => {
                error!(
                    event_name = "turn.failed",
                    correlation_id = %turn.correlation_id,
                    session_id = %turn.session_id,
                    error = %failure,
                    "conversation turn failed"
                );
                self.audit.emit(
                    turn.audit
                        .event("turn.failed", AuditCategory::System, AuditOutcome::Failed)
                        .with_metadata("error", failure.to_string()),
                );
                let interface =
                    ApplicationError::from(failure).into_interface(turn.correlation_id.clone());
                Reply::new(TurnStatus::Completed, interface.user_message())
            }
        };
        self.emit(turn, reply, output).await
    }

    /// `Ok(None)` means the output channel closed mid-turn.
    async fn process(
        &self,
        turn: &mut Turn,
        output: &mpsc::Sender<StreamEvent>,
    ) -> Result<Option<Reply>, PipelineError> {
        let mut session = self
            .sessions
            .load(&turn.session_id)
            .await?
            .unwrap_or_else(|| SessionState::new(turn.session_id.clone()));

        if is_reset_command(&turn.message) {
            return self.reset(turn, &mut session).await.map(Some);
        }

        if let Some(reply) = self.resolve_pending(turn, &mut session).await? {
            self.record_exchange(turn, &mut session, &reply.text).await?;
            return Ok(Some(reply));
        }

        let calls = match self.precheck.match_message(&turn.message) {
            Some(matched) => {
                self.audit.emit(
                    turn.audit
                        .event("precheck.matched", AuditCategory::Dispatch, AuditOutcome::Success)
                        .with_metadata("rule", matched.rule.clone()),
                );
                matched.calls
            }
            None => {
                if output.is_closed() {
                    return Ok(None);
                }
                match self.ask_model(turn, &session).await {
                    Ok(response) if response.tool_calls.is_empty() => {
                        let text = response.text.unwrap_or_default();
                        let reply = Reply::new(TurnStatus::Completed, text);
                        self.record_exchange(turn, &mut session, &reply.text).await?;
                        return Ok(Some(reply));
                    }
                    Ok(response) => response.tool_calls,
                    Err(reason) => {
                        warn!(
                            event_name = "model.failed",
                            correlation_id = %turn.correlation_id,
                            session_id = %turn.session_id,
                            error = %reason,
                            "model request failed"
                        );
                        self.audit.emit(
                            turn.audit
                                .event(
                                    "model.failed",
                                    AuditCategory::Dispatch,
                                    AuditOutcome::Failed,
                                )
                                .with_metadata("error", reason),
                        );
                        let reply = Reply::new(TurnStatus::Completed, MODEL_FAILURE_TEXT);
                        self.record_exchange(turn, &mut session, &reply.text).await?;
                        return Ok(Some(reply));
                    }
                }
            }
        };

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let result = self.dispatch(turn, &mut session, call, false).await?;
            results.push(result);
            if output.is_closed() {
                // Effects already committed stay committed; results are dropped.
                self.persist(&mut session, turn, false).await?;
                return Ok(None);
            }
        }

        let (text, data) = combine_results(&results);
        let mut reply = Reply::new(TurnStatus::Completed, text);
        reply.data = data;
        self.record_exchange(turn, &mut session, &reply.text).await?;
        Ok(Some(reply))
    }

    async fn reset(&self, turn: &Turn, session: &mut SessionState) -> Result<Reply, PipelineError> {
        session.clear();
        let cleared = self.pending.clear_session(&turn.session_id).await?;
        self.persist(session, turn, true).await?;
        info!(
            event_name = "session.reset",
            correlation_id = %turn.correlation_id,
            session_id = %turn.session_id,
            cleared_pending = cleared,
            "session context cleared"
        );
        self.audit.emit(
            turn.audit
                .event("session.reset", AuditCategory::Session, AuditOutcome::Success)
                .with_metadata("cleared_pending", cleared.to_string()),
        );
        Ok(Reply::new(TurnStatus::Reset, RESET_TEXT))
    }

    /// Visits outstanding kinds in priority order; the first whose vocabulary
    /// recognises the message consumes it. An expired action only answers the
    /// message when no live kind recognised it.
    async fn resolve_pending(
        &self,
        turn: &mut Turn,
        session: &mut SessionState,
    ) -> Result<Option<Reply>, PipelineError> {
        let mut expired_match = None;
        for kind in PendingActionKind::PRIORITY_ORDER {
            match self.pending.lookup(&turn.session_id, kind).await? {
                PendingLookup::Absent => {}
                PendingLookup::Expired(action) => {
                    self.audit_pending(turn, "pending.expired", &action, AuditOutcome::Rejected);
                    let verdict = self.matcher.classify(&turn.message, kind);
                    if verdict != ConfirmationVerdict::Unknown && expired_match.is_none() {
                        expired_match = Some(kind);
                    }
                }
                PendingLookup::Outstanding(action) => {
                    match self.matcher.classify(&turn.message, kind) {
                        ConfirmationVerdict::Unknown => {}
                        ConfirmationVerdict::Confirm => {
                            return self.confirm(turn, session, kind).await.map(Some);
                        }
                        ConfirmationVerdict::Deny => {
                            self.pending.discard(&turn.session_id, kind).await?;
                            self.audit_pending(
                                turn,
                                "pending.denied",
                                &action,
                                AuditOutcome::Success,
                            );
                            let text = format!(
                                "Okay, the {} was cancelled. Nothing was executed.",
                                kind.label()
                            );
                            return Ok(Some(Reply::new(TurnStatus::Denied, text)));
                        }
                    }
                }
            }
        }

        Ok(expired_match.map(|kind| {
            let text = format!(
                "That {} request expired, so nothing was done. \
                 Please ask again if you still need it.",
                kind.label()
            );
            Reply::new(TurnStatus::Denied, text)
        }))
    }

    async fn confirm(
        &self,
        turn: &mut Turn,
        session: &mut SessionState,
        kind: PendingActionKind,
    ) -> Result<Reply, PipelineError> {
        // Claimed before running: a failure below can never cause a second run.
        let Some(action) = self.pending.claim(&turn.session_id, kind).await? else {
            let text = format!(
                "That {} request is no longer pending, so nothing was done.",
                kind.label()
            );
            return Ok(Reply::new(TurnStatus::Denied, text));
        };
        self.audit_pending(turn, "pending.confirmed", &action, AuditOutcome::Success);

        let result = self.dispatch(turn, session, action.payload.call, true).await?;
        let mut reply = Reply::new(TurnStatus::Confirmed, non_empty(result.response_text));
        reply.data = result.data;
        Ok(reply)
    }

    async fn ask_model(
        &self,
        turn: &Turn,
        session: &SessionState,
    ) -> Result<ModelResponse, String> {
        let request = ModelRequest {
            session_id: turn.session_id.clone(),
            correlation_id: turn.correlation_id.clone(),
            message: turn.message.clone(),
            history: session.history.clone(),
            tools: self.registry.catalog().select(self.tool_catalog_limit),
        };
        match tokio::time::timeout(self.model_timeout, self.llm.complete(&request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(format!("{error:#}")),
            Err(_) => Err(format!("timed out after {}s", self.model_timeout.as_secs())),
        }
    }

    /// Resolves context, routes, and commits the handler's effects before
    /// returning so later calls in the same turn observe them.
    async fn dispatch(
        &self,
        turn: &mut Turn,
        session: &mut SessionState,
        call: ToolCall,
        confirmed: bool,
    ) -> Result<ToolResult, PipelineError> {
        let resolution = self.resolver.resolve(&call.name, &call.arguments, session);
        for injection in &resolution.injections {
            self.audit.emit(
                turn.audit
                    .event("context.injected", AuditCategory::Context, AuditOutcome::Success)
                    .with_metadata("tool", injection.tool.clone())
                    .with_metadata("field", injection.field.clone())
                    .with_metadata("source", injection.source.as_str())
                    .with_metadata("value", injection.value.clone())
                    .with_metadata("domain", injection.domain.as_str())
                    .with_metadata("age_secs", injection.age_secs.to_string()),
            );
        }
        turn.injections.extend(resolution.injections.iter().cloned());

        if let Some(unresolved) = resolution.error {
            info!(
                event_name = "context.unresolved",
                correlation_id = %turn.correlation_id,
                session_id = %turn.session_id,
                tool = %call.name,
                rejected = resolution.rejections.len(),
                "tool call not dispatched: no usable reference"
            );
            self.audit.emit(
                turn.audit
                    .event("context.unresolved", AuditCategory::Context, AuditOutcome::Rejected)
                    .with_metadata("tool", call.name.clone())
                    .with_metadata("rejected_candidates", resolution.rejections.len().to_string()),
            );
            return Ok(ToolResult::failure(unresolved.code(), unresolved.user_message()));
        }

        let call = ToolCall { name: call.name, arguments: resolution.arguments };
        let context = turn.tool_context(confirmed);
        let outcome = self.registry.route(&call, &context).await;
        let outcome_kind = outcome.kind();
        let audit_outcome = match &outcome {
            RouteOutcome::Executed(result) if result.success => AuditOutcome::Success,
            RouteOutcome::Executed(_) | RouteOutcome::Unmapped { .. } => AuditOutcome::Rejected,
            RouteOutcome::HandlerUnavailable { .. } | RouteOutcome::ExecutionFailed { .. } => {
                AuditOutcome::Failed
            }
        };
        self.audit.emit(
            turn.audit
                .event(format!("dispatch.{outcome_kind}"), AuditCategory::Dispatch, audit_outcome)
                .with_metadata("tool", call.name.clone())
                .with_metadata("confirmed", confirmed.to_string()),
        );

        let result = match (outcome, &self.fallback) {
            (RouteOutcome::Unmapped { .. }, Some(fallback)) => {
                info!(
                    event_name = "dispatch.fallback",
                    correlation_id = %turn.correlation_id,
                    session_id = %turn.session_id,
                    tool = %call.name,
                    "unmapped tool sent to legacy fallback"
                );
                match execute_isolated(fallback.clone(), &call, &context).await {
                    Ok(result) => result,
                    Err(failure) => failure.into_result(),
                }
            }
            (outcome, _) => outcome.into_result(),
        };

        self.commit_effects(turn, session, &result).await?;
        Ok(result)
    }

    async fn commit_effects(
        &self,
        turn: &mut Turn,
        session: &mut SessionState,
        result: &ToolResult,
    ) -> Result<(), PipelineError> {
        if let Some(request) = result.effects.pending_action.clone() {
            let action = self.pending.create_from_request(&turn.session_id, request).await?;
            self.audit_pending(turn, "pending.created", &action, AuditOutcome::Success);
        }
        if let Some(issued) = result.effects.report.clone() {
            session.record_report(issued.clone());
            turn.reports.push(issued);
            self.persist(session, turn, false).await?;
        }
        Ok(())
    }

    /// Appends the user message and the sanitised reply to history and saves.
    async fn record_exchange(
        &self,
        turn: &Turn,
        session: &mut SessionState,
        reply_text: &str,
    ) -> Result<(), PipelineError> {
        let reply_text = non_empty(self.sanitizer.sanitize(reply_text).trim().to_string());
        for entry in exchange_entries(turn, &reply_text) {
            session.push_history(entry, self.config.history_retention);
        }
        self.persist_with(session, turn, |fresh| {
            for entry in exchange_entries(turn, &reply_text) {
                fresh.push_history(entry, self.config.history_retention);
            }
        })
        .await
    }

    async fn persist(
        &self,
        session: &mut SessionState,
        turn: &Turn,
        cleared: bool,
    ) -> Result<(), PipelineError> {
        self.persist_with(session, turn, |fresh| {
            if cleared {
                fresh.clear();
            }
        })
        .await
    }

    /// Optimistic save. On a version conflict the stored state is reloaded,
    /// this turn's reports plus `reapply` are replayed onto it, and the save
    /// is retried once.
    async fn persist_with<F>(
        &self,
        session: &mut SessionState,
        turn: &Turn,
        reapply: F,
    ) -> Result<(), PipelineError>
    where
        F: Fn(&mut SessionState),
    {
        match self.sessions.save(session).await {
            Ok(version) => {
                session.version = version;
                Ok(())
            }
            Err(RepositoryError::VersionConflict { expected, .. }) => {
                warn!(
                    event_name = "session.version_conflict",
                    correlation_id = %turn.correlation_id,
                    session_id = %turn.session_id,
                    expected_version = expected,
                    "session changed underneath the turn; replaying onto stored state"
                );
                let mut fresh = self
                    .sessions
                    .load(&turn.session_id)
                    .await?
                    .unwrap_or_else(|| SessionState::new(turn.session_id.clone()));
                for issued in &turn.reports {
                    fresh.record_report(issued.clone());
                }
                reapply(&mut fresh);
                fresh.version = self.sessions.save(&fresh).await?;
                *session = fresh;
                Ok(())
            }
            Err(other) => Err(other.into()),
        }
    }

    async fn emit(
        &self,
        turn: &Turn,
        reply: Reply,
        output: &mpsc::Sender<StreamEvent>,
    ) -> TurnSummary {
        let mut stream =
            StreamingSanitizer::new(self.sanitizer.clone(), self.config.stream_holdback_chars);
        for piece in reply.text.split_inclusive(char::is_whitespace) {
            if let Some(delta) = stream.push(piece) {
                if output.send(StreamEvent::Chunk(delta)).await.is_err() {
                    return self.cancelled(turn).await;
                }
            }
        }
        let sanitized = stream.finish();
        if !sanitized.tail.is_empty()
            && output.send(StreamEvent::Chunk(sanitized.tail)).await.is_err()
        {
            return self.cancelled(turn).await;
        }

        let pending_actions = match self.pending.list_session(&turn.session_id).await {
            Ok(actions) => actions.iter().map(PendingAction::summary).collect(),
            Err(failure) => {
                warn!(
                    event_name = "pending.list_failed",
                    correlation_id = %turn.correlation_id,
                    session_id = %turn.session_id,
                    error = %failure,
                    "could not list outstanding pending actions"
                );
                Vec::new()
            }
        };

        let summary = TurnSummary {
            session_id: turn.session_id.clone(),
            correlation_id: turn.correlation_id.clone(),
            status: reply.status,
            text: sanitized.full,
            pending_actions,
            data: reply.data,
            injections: turn.injections.clone(),
        };
        if output.send(StreamEvent::Done(summary.clone())).await.is_err() {
            return self.cancelled(turn).await;
        }
        info!(
            event_name = "turn.completed",
            correlation_id = %turn.correlation_id,
            session_id = %turn.session_id,
            status = summary.status.as_str(),
            injections = summary.injections.len(),
            pending = summary.pending_actions.len(),
            "conversation turn completed"
        );
        summary
    }

    async fn cancelled(&self, turn: &Turn) -> TurnSummary {
        info!(
            event_name = "turn.cancelled",
            correlation_id = %turn.correlation_id,
            session_id = %turn.session_id,
            "output channel closed; turn cancelled"
        );
        self.audit.emit(turn.audit.event(
            "turn.cancelled",
            AuditCategory::Session,
            AuditOutcome::Rejected,
        ));
        TurnSummary {
            session_id: turn.session_id.clone(),
            correlation_id: turn.correlation_id.clone(),
            status: TurnStatus::Cancelled,
            text: String::new(),
            pending_actions: Vec::new(),
            data: None,
            injections: turn.injections.clone(),
        }
    }

    fn audit_pending(
        &self,
        turn: &Turn,
        event_type: &str,
        action: &PendingAction,
        outcome: AuditOutcome,
    ) {
        info!(
            event_name = event_type,
            correlation_id = %turn.correlation_id,
            session_id = %turn.session_id,
            kind = %action.kind,
            tool = %action.payload.call.name,
            "pending action transition"
        );
        self.audit.emit(
            turn.audit
                .event(event_type, AuditCategory::Confirmation, outcome)
                .with_metadata("kind", action.kind.as_str())
                .with_metadata("tool", action.payload.call.name.clone())
                .with_metadata(
                    "age_secs",
                    Utc::now().signed_duration_since(action.created_at).num_seconds().to_string(),
                ),
        );
    }

    async fn gate(&self, session_id: &SessionId) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().await;
        gates.entry(session_id.clone()).or_default().clone()
    }

    async fn release_gate(&self, session_id: &SessionId, gate: Arc<Mutex<()>>) {
        let mut gates = self.gates.lock().await;
        // One reference held by the map, one by `gate`: nobody else is waiting.
        if Arc::strong_count(&gate) == 2 {
            gates.remove(session_id);
        }
    }
}

fn exchange_entries(turn: &Turn, reply_text: &str) -> [HistoryEntry; 2] {
    let now = Utc::now();
    let markers = turn.history_markers();
    let assistant_text =
        if markers.is_empty() { reply_text.to_string() } else { format!("{reply_text} {markers}") };
    [
        HistoryEntry::user(turn.message.clone(), now),
        HistoryEntry::assistant(assistant_text, now, turn.reported_domain()),
    ]
}

fn non_empty(text: String) -> String {
    if text.trim().is_empty() {
        EMPTY_RESPONSE_TEXT.to_string()
    } else {
        text
    }
}

/// Joins results in call order. A single result carrying data and no text
/// gets its data rendered directly.
pub fn combine_results(results: &[ToolResult]) -> (String, Option<Value>) {
    match results {
        [] => (EMPTY_RESPONSE_TEXT.to_string(), None),
        [single] => {
            let text = if single.response_text.trim().is_empty() {
                single.data.as_ref().map(render_data).unwrap_or_default()
            } else {
                single.response_text.clone()
            };
            (non_empty(text), single.data.clone())
        }
        many => {
            let text = many
                .iter()
                .map(|result| result.response_text.trim())
                .filter(|text| !text.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n");
            (non_empty(text), None)
        }
    }
}

fn render_data(data: &Value) -> String {
    match data {
        Value::Array(rows) => {
            rows.iter().map(|row| format!("- {}", render_row(row))).collect::<Vec<_>>().join("\n")
        }
        Value::Object(_) => render_row(data),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn render_row(row: &Value) -> String {
    match row {
        Value::Object(fields) => fields
            .iter()
            .map(|(key, value)| match value {
                Value::String(text) => format!("{key}: {text}"),
                other => format!("{key}: {other}"),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
