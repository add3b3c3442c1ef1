use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinError;
use tracing::{error, info, warn};

use despacho_core::domain::tool::{ToolArguments, ToolCall, ToolContext, ToolResult};

use crate::catalog::{ToolCatalog, ToolSpec};

/// A family of related tools sharing execution-time resources.
#[async_trait]
pub trait HandlerGroup: Send + Sync {
    async fn execute(
        &self,
        tool_name: &str,
        arguments: &ToolArguments,
        context: &ToolContext,
    ) -> Result<ToolResult, HandlerError>;
}

/// Builds a handler group on first use. A failed `create` is not cached, so
/// the next call retries.
#[async_trait]
pub trait HandlerFactory: Send + Sync {
    fn key(&self) -> &str;
    async fn create(&self) -> anyhow::Result<Arc<dyn HandlerGroup>>;
}

/// Factory for a group that is already constructed.
pub struct ReadyHandler {
    key: String,
    handler: Arc<dyn HandlerGroup>,
}

impl ReadyHandler {
    pub fn new(key: impl Into<String>, handler: Arc<dyn HandlerGroup>) -> Self {
        Self { key: key.into(), handler }
    }
}

#[async_trait]
impl HandlerFactory for ReadyHandler {
    fn key(&self) -> &str {
        &self.key
    }

    async fn create(&self) -> anyhow::Result<Arc<dyn HandlerGroup>> {
        Ok(self.handler.clone())
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("external system failure: {0}")]
    External(String),
    #[error("handler failure: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::External(_) => "external_failure",
            Self::Internal(_) => "execution_failed",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidArguments(detail) => {
                format!("Some information is missing or invalid: {detail}.")
            }
            Self::External(_) | Self::Internal(_) => {
                "Something went wrong while running that operation. Please try again.".to_string()
            }
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool `{tool}` is already routed to group `{existing}`")]
    DuplicateRoute { tool: String, existing: String },
    #[error("tool `{tool}` routes to unregistered group `{group}`")]
    UnknownGroup { tool: String, group: String },
    #[error("handler group `{0}` is registered twice")]
    DuplicateGroup(String),
}

/// Why `handler_for` could not produce a live group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupFailure {
    Unmapped { tool: String },
    Unavailable { tool: String, group: String, reason: String },
}

/// Routing result; the three failure kinds stay distinct for the caller.
#[derive(Clone, Debug, PartialEq)]
pub enum RouteOutcome {
    Executed(ToolResult),
    /// Name not in the routing table. Not supported yet; non-fatal.
    Unmapped { tool: String },
    /// The group failed to initialise. Retried on the next call.
    HandlerUnavailable { tool: String, group: String, reason: String },
    /// The handler ran and failed or panicked.
    ExecutionFailed { tool: String, group: String, code: String, message: String },
}

impl RouteOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Executed(_) => "executed",
            Self::Unmapped { .. } => "unmapped",
            Self::HandlerUnavailable { .. } => "handler_unavailable",
            Self::ExecutionFailed { .. } => "execution_failed",
        }
    }

    /// User-facing result for every outcome.
    pub fn into_result(self) -> ToolResult {
        match self {
            Self::Executed(result) => result,
            Self::Unmapped { tool } => ToolResult::failure(
                "unmapped_tool",
                format!("Sorry, `{tool}` is not supported yet."),
            ),
            Self::HandlerUnavailable { .. } => ToolResult::failure(
                "handler_unavailable",
                "That service is temporarily unavailable. Please try again in a moment.",
            ),
            Self::ExecutionFailed { code, message, .. } => ToolResult::failure(code, message),
        }
    }
}

impl From<LookupFailure> for RouteOutcome {
    fn from(value: LookupFailure) -> Self {
        match value {
            LookupFailure::Unmapped { tool } => Self::Unmapped { tool },
            LookupFailure::Unavailable { tool, group, reason } => {
                Self::HandlerUnavailable { tool, group, reason }
            }
        }
    }
}

struct GroupSlot {
    factory: Arc<dyn HandlerFactory>,
    instance: Mutex<Option<Arc<dyn HandlerGroup>>>,
}

#[derive(Default)]
pub struct RegistryBuilder {
    factories: Vec<Arc<dyn HandlerFactory>>,
    routes: Vec<(String, String)>,
    specs: Vec<ToolSpec>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(mut self, factory: impl HandlerFactory + 'static) -> Self {
        self.factories.push(Arc::new(factory));
        self
    }

    pub fn ready_group(self, key: impl Into<String>, handler: Arc<dyn HandlerGroup>) -> Self {
        self.group(ReadyHandler::new(key, handler))
    }

    /// Routes `tool` to `group` with a bare catalog entry.
    pub fn register(self, tool: impl Into<String>, group: impl Into<String>) -> Self {
        let tool = tool.into();
        let description = tool.replace('_', " ");
        self.register_tool(ToolSpec::new(tool, group, description))
    }

    pub fn register_tool(mut self, spec: ToolSpec) -> Self {
        self.routes.push((spec.name.clone(), spec.group.clone()));
        self.specs.push(spec);
        self
    }

    pub fn build(self) -> Result<ToolDispatchRegistry, RegistryError> {
        let mut groups = BTreeMap::new();
        for factory in self.factories {
            let key = factory.key().to_string();
            if groups.contains_key(&key) {
                return Err(RegistryError::DuplicateGroup(key));
            }
            groups.insert(key, GroupSlot { factory, instance: Mutex::new(None) });
        }

        let mut routes: BTreeMap<String, String> = BTreeMap::new();
        for (tool, group) in self.routes {
            if let Some(existing) = routes.get(&tool) {
                return Err(RegistryError::DuplicateRoute { tool, existing: existing.clone() });
            }
            if !groups.contains_key(&group) {
                return Err(RegistryError::UnknownGroup { tool, group });
            }
            routes.insert(tool, group);
        }

        let mut catalog = ToolCatalog::default();
        for spec in self.specs {
            catalog.push(spec);
        }

        let group_keys: BTreeSet<&str> = routes.values().map(String::as_str).collect();
        info!(
            event_name = "dispatch.registry_built",
            tools = routes.len(),
            groups = groups.len(),
            routed_groups = group_keys.len(),
            "tool dispatch registry built"
        );

        Ok(ToolDispatchRegistry { routes, groups, catalog })
    }
}

/// Deterministic tool name → handler group table with lazy group creation.
pub struct ToolDispatchRegistry {
    routes: BTreeMap<String, String>,
    groups: BTreeMap<String, GroupSlot>,
    catalog: ToolCatalog,
}

impl ToolDispatchRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn contains(&self, tool_name: &str) -> bool {
        self.routes.contains_key(tool_name)
    }

    pub fn group_of(&self, tool_name: &str) -> Option<&str> {
        self.routes.get(tool_name).map(String::as_str)
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Live group for `tool_name`, creating it if needed. Repeated calls
    /// return the same instance once creation succeeded.
    pub async fn handler_for(
        &self,
        tool_name: &str,
    ) -> Result<Arc<dyn HandlerGroup>, LookupFailure> {
        let Some(group) = self.routes.get(tool_name) else {
            return Err(LookupFailure::Unmapped { tool: tool_name.to_string() });
        };
        let Some(slot) = self.groups.get(group) else {
            return Err(LookupFailure::Unavailable {
                tool: tool_name.to_string(),
                group: group.clone(),
                reason: "group not registered".to_string(),
            });
        };

        let mut instance = slot.instance.lock().await;
        if let Some(handler) = instance.as_ref() {
            return Ok(handler.clone());
        }

        match slot.factory.create().await {
            Ok(handler) => {
                info!(
                    event_name = "dispatch.group_initialized",
                    group = %group,
                    "handler group ready"
                );
                *instance = Some(handler.clone());
                Ok(handler)
            }
            Err(error) => Err(LookupFailure::Unavailable {
                tool: tool_name.to_string(),
                group: group.clone(),
                reason: format!("{error:#}"),
            }),
        }
    }

    pub async fn route(&self, call: &ToolCall, context: &ToolContext) -> RouteOutcome {
        let handler = match self.handler_for(&call.name).await {
            Ok(handler) => handler,
            Err(failure) => {
                let outcome = RouteOutcome::from(failure);
                match &outcome {
                    RouteOutcome::Unmapped { tool } => info!(
                        event_name = "dispatch.unmapped",
                        correlation_id = %context.correlation_id,
                        session_id = %context.session_id,
                        tool = %tool,
                        "tool name not mapped to a handler group"
                    ),
                    RouteOutcome::HandlerUnavailable { tool, group, reason } => warn!(
                        event_name = "dispatch.handler_unavailable",
                        correlation_id = %context.correlation_id,
                        session_id = %context.session_id,
                        tool = %tool,
                        group = %group,
                        reason = %reason,
                        "handler group failed to initialise"
                    ),
                    _ => {}
                }
                return outcome;
            }
        };

        let group = self.group_of(&call.name).unwrap_or_default().to_string();
        match execute_isolated(handler, call, context).await {
            Ok(result) => {
                info!(
                    event_name = "dispatch.executed",
                    correlation_id = %context.correlation_id,
                    session_id = %context.session_id,
                    tool = %call.name,
                    group = %group,
                    success = result.success,
                    "tool call executed"
                );
                RouteOutcome::Executed(result)
            }
            Err(IsolatedFailure::Handler(handler_error)) => {
                error!(
                    event_name = "dispatch.execution_failed",
                    correlation_id = %context.correlation_id,
                    session_id = %context.session_id,
                    tool = %call.name,
                    group = %group,
                    error = %handler_error,
                    "tool handler returned an error"
                );
                RouteOutcome::ExecutionFailed {
                    tool: call.name.clone(),
                    group,
                    code: handler_error.code().to_string(),
                    message: handler_error.user_message(),
                }
            }
            Err(IsolatedFailure::Panicked(join_error)) => {
                error!(
                    event_name = "dispatch.execution_failed",
                    correlation_id = %context.correlation_id,
                    session_id = %context.session_id,
                    tool = %call.name,
                    group = %group,
                    error = %join_error,
                    "tool handler panicked"
                );
                RouteOutcome::ExecutionFailed {
                    tool: call.name.clone(),
                    group,
                    code: "execution_failed".to_string(),
                    message: HandlerError::Internal(join_error.to_string()).user_message(),
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum IsolatedFailure {
    Handler(HandlerError),
    Panicked(JoinError),
}

/// Runs the handler on its own task so a panic cannot take the turn down.
pub async fn execute_isolated(
    handler: Arc<dyn HandlerGroup>,
    call: &ToolCall,
    context: &ToolContext,
) -> Result<ToolResult, IsolatedFailure> {
    let tool = call.name.clone();
    let arguments = call.arguments.clone();
    let context = context.clone();
    let joined =
        tokio::spawn(async move { handler.execute(&tool, &arguments, &context).await }).await;

    match joined {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(error)) => Err(IsolatedFailure::Handler(error)),
        Err(join_error) => Err(IsolatedFailure::Panicked(join_error)),
    }
}

impl IsolatedFailure {
    pub fn into_result(self) -> ToolResult {
        match self {
            Self::Handler(error) => ToolResult::failure(error.code(), error.user_message()),
            Self::Panicked(join_error) => {
                let error = HandlerError::Internal(join_error.to_string());
                ToolResult::failure(error.code(), error.user_message())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::anyhow;
    use async_trait::async_trait;

    use despacho_core::domain::session::SessionId;
    use despacho_core::domain::tool::{ToolArguments, ToolCall, ToolContext, ToolResult};

    use super::{
        HandlerError, HandlerFactory, HandlerGroup, RegistryError, RouteOutcome,
        ToolDispatchRegistry,
    };
    use crate::catalog::ToolSpec;

    struct EchoGroup;

    #[async_trait]
    impl HandlerGroup for EchoGroup {
        async fn execute(
            &self,
            tool_name: &str,
            _arguments: &ToolArguments,
            _context: &ToolContext,
        ) -> Result<ToolResult, HandlerError> {
            match tool_name {
                "explode" => panic!("boom"),
                "fail" => Err(HandlerError::External("upstream 503".to_string())),
                other => Ok(ToolResult::ok(format!("ran {other}"))),
            }
        }
    }

    /// Fails the first `failures` creations, then succeeds.
    struct FlakyFactory {
        failures: usize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl HandlerFactory for FlakyFactory {
        fn key(&self) -> &str {
            "flaky"
        }

        async fn create(&self) -> anyhow::Result<Arc<dyn HandlerGroup>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(anyhow!("credentials not yet available"));
            }
            Ok(Arc::new(EchoGroup))
        }
    }

    fn context() -> ToolContext {
        ToolContext::new(SessionId::from("s-1"), "msg", "corr-1")
    }

    fn registry() -> ToolDispatchRegistry {
        ToolDispatchRegistry::builder()
            .ready_group("echo", Arc::new(EchoGroup))
            .register("list_processes", "echo")
            .register("explode", "echo")
            .register("fail", "echo")
            .register_tool(ToolSpec::new("pay_invoice", "echo", "Pay").critical())
            .build()
            .expect("registry builds")
    }

    #[tokio::test]
    async fn handler_for_returns_same_instance() {
        let registry = registry();
        let first = registry.handler_for("list_processes").await.expect("first");
        let second = registry.handler_for("list_processes").await.expect("second");
        let sibling = registry.handler_for("pay_invoice").await.expect("sibling");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &sibling));
    }

    #[tokio::test]
    async fn unmapped_name_is_reported_distinctly() {
        let outcome = registry().route(&ToolCall::new("teleport"), &context()).await;

        assert_eq!(outcome, RouteOutcome::Unmapped { tool: "teleport".to_string() });
        let result = outcome.into_result();
        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("unmapped_tool"));
        assert!(!result.response_text.is_empty());
    }

    #[tokio::test]
    async fn failed_initialisation_is_retried_on_next_call() {
        let registry = ToolDispatchRegistry::builder()
            .group(FlakyFactory { failures: 1, attempts: AtomicUsize::new(0) })
            .register("list_processes", "flaky")
            .build()
            .expect("registry builds");

        let first = registry.route(&ToolCall::new("list_processes"), &context()).await;
        let second = registry.route(&ToolCall::new("list_processes"), &context()).await;

        assert_eq!(first.kind(), "handler_unavailable");
        assert_eq!(second, RouteOutcome::Executed(ToolResult::ok("ran list_processes")));
    }

    #[tokio::test]
    async fn handler_error_and_panic_become_execution_failures() {
        let registry = registry();

        let failed = registry.route(&ToolCall::new("fail"), &context()).await;
        let panicked = registry.route(&ToolCall::new("explode"), &context()).await;
        let after = registry.route(&ToolCall::new("list_processes"), &context()).await;

        assert!(matches!(
            &failed,
            RouteOutcome::ExecutionFailed { code, .. } if code == "external_failure"
        ));
        assert_eq!(panicked.kind(), "execution_failed");
        assert!(!panicked.into_result().response_text.is_empty());
        assert_eq!(after.kind(), "executed");
    }

    #[test]
    fn duplicate_route_fails_construction() {
        let result = ToolDispatchRegistry::builder()
            .ready_group("echo", Arc::new(EchoGroup))
            .ready_group("other", Arc::new(EchoGroup))
            .register("list_processes", "echo")
            .register("list_processes", "other")
            .build();

        assert!(matches!(
            result.err(),
            Some(RegistryError::DuplicateRoute { tool, existing })
                if tool == "list_processes" && existing == "echo"
        ));
    }

    #[test]
    fn unknown_and_duplicate_groups_fail_construction() {
        let unknown = ToolDispatchRegistry::builder().register("list_processes", "missing").build();
        let duplicate = ToolDispatchRegistry::builder()
            .ready_group("echo", Arc::new(EchoGroup))
            .ready_group("echo", Arc::new(EchoGroup))
            .build();

        assert!(matches!(unknown.err(), Some(RegistryError::UnknownGroup { .. })));
        assert_eq!(duplicate.err(), Some(RegistryError::DuplicateGroup("echo".to_string())));
    }

    #[test]
    fn catalog_follows_registration() {
        let registry = registry();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.catalog().len(), 4);
        assert_eq!(registry.group_of("pay_invoice"), Some("echo"));
        assert_eq!(registry.catalog().select(1)[0].name, "pay_invoice");
    }
}
