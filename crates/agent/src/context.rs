//! Fills tool arguments the model left out from the session's report
//! references. Only allowlisted tools accept injection, explicit values are
//! never overwritten, and every candidate passes a staleness and a domain
//! guard before use.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use despacho_core::domain::reference::{DomainTag, ReportReference};
use despacho_core::domain::session::{Role, SessionState};
use despacho_core::domain::tool::{argument_missing, ToolArguments};

const MARKER_OPEN: &str = "[ref:";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextBinding {
    pub domain: DomainTag,
    pub field: String,
}

/// Tool name → (domain, argument key) allowlist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextPolicy {
    bindings: BTreeMap<String, ContextBinding>,
}

impl Default for ContextPolicy {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ContextPolicy {
    pub fn empty() -> Self {
        Self { bindings: BTreeMap::new() }
    }

    pub fn builtin() -> Self {
        let mut policy = Self::empty();
        for tool in ["filter_process_report", "export_process_report", "email_process_report"] {
            policy = policy.with_binding(tool, DomainTag::Logistics, "report_id");
        }
        for tool in ["filter_finance_report", "export_finance_report", "email_finance_report"] {
            policy = policy.with_binding(tool, DomainTag::Finance, "report_id");
        }
        for tool in ["email_document", "register_document"] {
            policy = policy.with_binding(tool, DomainTag::Documents, "document_report_id");
        }
        policy
    }

    pub fn with_binding(
        mut self,
        tool: impl Into<String>,
        domain: DomainTag,
        field: impl Into<String>,
    ) -> Self {
        self.bindings.insert(tool.into(), ContextBinding { domain, field: field.into() });
        self
    }

    pub fn binding(&self, tool: &str) -> Option<&ContextBinding> {
        self.bindings.get(tool)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionSource {
    ActiveReference,
    LastVisibleReference,
    HistoryReference,
}

impl InjectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActiveReference => "active_reference",
            Self::LastVisibleReference => "last_visible_reference",
            Self::HistoryReference => "history_reference",
        }
    }
}

/// One place a reference can come from. Sources are tried in list order.
pub trait ReferenceSource: Send + Sync {
    fn source(&self) -> InjectionSource;
    fn candidate(&self, session: &SessionState, domain: DomainTag) -> Option<ReportReference>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ActiveReferenceSource;

impl ReferenceSource for ActiveReferenceSource {
    fn source(&self) -> InjectionSource {
        InjectionSource::ActiveReference
    }

    fn candidate(&self, session: &SessionState, domain: DomainTag) -> Option<ReportReference> {
        session.active_reference(domain).cloned()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LastVisibleReferenceSource;

impl ReferenceSource for LastVisibleReferenceSource {
    fn source(&self) -> InjectionSource {
        InjectionSource::LastVisibleReference
    }

    fn candidate(&self, session: &SessionState, domain: DomainTag) -> Option<ReportReference> {
        session.visible_reference(domain).cloned()
    }
}

/// Rebuilds a reference from `[ref:<id>]` markers in recent assistant entries
/// tagged with the domain.
#[derive(Clone, Copy, Debug)]
pub struct HistoryReferenceSource {
    scan_limit: usize,
}

impl HistoryReferenceSource {
    pub fn new(scan_limit: usize) -> Self {
        Self { scan_limit }
    }
}

impl ReferenceSource for HistoryReferenceSource {
    fn source(&self) -> InjectionSource {
        InjectionSource::HistoryReference
    }

    fn candidate(&self, session: &SessionState, domain: DomainTag) -> Option<ReportReference> {
        session
            .history
            .iter()
            .rev()
            .take(self.scan_limit)
            .filter(|entry| entry.role == Role::Assistant && entry.domain == Some(domain))
            .find_map(|entry| {
                let tagged = entry.domain?;
                last_marker(&entry.text)
                    .map(|report_id| ReportReference::new(report_id, tagged, entry.at))
            })
    }
}

fn last_marker(text: &str) -> Option<&str> {
    let start = text.rfind(MARKER_OPEN)? + MARKER_OPEN.len();
    let rest = &text[start..];
    let end = rest.find(']')?;
    let id = &rest[..end];
    let valid = !id.is_empty()
        && id.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    valid.then_some(id)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContextInjection {
    pub tool: String,
    pub field: String,
    pub source: InjectionSource,
    pub value: String,
    pub domain: DomainTag,
    pub age_secs: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    Stale { age_secs: i64, max_age_secs: i64 },
    DomainMismatch { found: DomainTag },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CandidateRejection {
    pub source: InjectionSource,
    pub report_id: String,
    pub reason: RejectionReason,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("no active {domain} reference for `{tool}` (field `{field}`); produce one first")]
    NoActiveReference { tool: String, domain: DomainTag, field: String },
}

impl ResolutionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoActiveReference { .. } => "context_unresolved",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::NoActiveReference { domain, .. } => format!(
                "I don't have a recent {domain} report to work on. Please {}, then ask again.",
                domain.producer_hint()
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub arguments: ToolArguments,
    pub injections: Vec<ContextInjection>,
    pub rejections: Vec<CandidateRejection>,
    pub error: Option<ResolutionError>,
}

impl Resolution {
    fn unchanged(arguments: &ToolArguments) -> Self {
        Self {
            arguments: arguments.clone(),
            injections: Vec::new(),
            rejections: Vec::new(),
            error: None,
        }
    }

    pub fn is_dispatchable(&self) -> bool {
        self.error.is_none()
    }
}

pub struct ContextResolver {
    policy: ContextPolicy,
    sources: Vec<Box<dyn ReferenceSource>>,
    max_age: Duration,
}

impl ContextResolver {
    /// Default source order: active, last visible, history.
    pub fn new(policy: ContextPolicy, max_age: Duration, history_scan_limit: usize) -> Self {
        Self::with_sources(
            policy,
            max_age,
            vec![
                Box::new(ActiveReferenceSource),
                Box::new(LastVisibleReferenceSource),
                Box::new(HistoryReferenceSource::new(history_scan_limit)),
            ],
        )
    }

    pub fn with_sources(
        policy: ContextPolicy,
        max_age: Duration,
        sources: Vec<Box<dyn ReferenceSource>>,
    ) -> Self {
        Self { policy, sources, max_age }
    }

    pub fn policy(&self) -> &ContextPolicy {
        &self.policy
    }

    pub fn resolve(
        &self,
        tool_name: &str,
        arguments: &ToolArguments,
        session: &SessionState,
    ) -> Resolution {
        self.resolve_at(tool_name, arguments, session, Utc::now())
    }

    pub fn resolve_at(
        &self,
        tool_name: &str,
        arguments: &ToolArguments,
        session: &SessionState,
        now: DateTime<Utc>,
    ) -> Resolution {
        let Some(binding) = self.policy.binding(tool_name) else {
            return Resolution::unchanged(arguments);
        };
        if !argument_missing(arguments, &binding.field) {
            return Resolution::unchanged(arguments);
        }

        let mut resolution = Resolution::unchanged(arguments);
        for source in &self.sources {
            let Some(candidate) = source.candidate(session, binding.domain) else {
                continue;
            };

            if let Some(reason) = self.reject(&candidate, binding.domain, now) {
                debug!(
                    event_name = "context.candidate_rejected",
                    session_id = %session.session_id,
                    tool = tool_name,
                    source = source.source().as_str(),
                    report_id = %candidate.id,
                    reason = ?reason,
                    "context candidate rejected"
                );
                resolution.rejections.push(CandidateRejection {
                    source: source.source(),
                    report_id: candidate.id.0.clone(),
                    reason,
                });
                continue;
            }

            let injection = ContextInjection {
                tool: tool_name.to_string(),
                field: binding.field.clone(),
                source: source.source(),
                value: candidate.id.0.clone(),
                domain: candidate.domain,
                age_secs: candidate.age_at(now).num_seconds(),
            };
            info!(
                event_name = "context.injected",
                session_id = %session.session_id,
                tool = tool_name,
                field = %injection.field,
                source = injection.source.as_str(),
                value = %injection.value,
                domain = %injection.domain,
                age_secs = injection.age_secs,
                "context value injected"
            );
            resolution.arguments.insert(binding.field.clone(), Value::String(candidate.id.0));
            resolution.injections.push(injection);
            return resolution;
        }

        resolution.error = Some(ResolutionError::NoActiveReference {
            tool: tool_name.to_string(),
            domain: binding.domain,
            field: binding.field.clone(),
        });
        resolution
    }

    fn reject(
        &self,
        candidate: &ReportReference,
        domain: DomainTag,
        now: DateTime<Utc>,
    ) -> Option<RejectionReason> {
        if candidate.domain != domain {
            return Some(RejectionReason::DomainMismatch { found: candidate.domain });
        }
        if candidate.is_stale_at(now, self.max_age) {
            return Some(RejectionReason::Stale {
                age_secs: candidate.age_at(now).num_seconds(),
                max_age_secs: self.max_age.num_seconds(),
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::{json, Value};

    use despacho_core::domain::reference::{DomainTag, IssuedReport, ReportReference};
    use despacho_core::domain::session::{HistoryEntry, SessionId, SessionState};
    use despacho_core::domain::tool::ToolArguments;

    use super::{
        last_marker, ContextPolicy, ContextResolver, InjectionSource, RejectionReason,
        ResolutionError,
    };

    fn resolver() -> ContextResolver {
        ContextResolver::new(ContextPolicy::builtin(), Duration::minutes(30), 20)
    }

    fn session_with_active(id: &str, domain: DomainTag, age: Duration) -> SessionState {
        let mut state = SessionState::new(SessionId::from("s-1"));
        state.record_report(IssuedReport {
            reference: ReportReference::new(id, domain, Utc::now() - age),
            activate: true,
        });
        state
    }

    fn args(value: Value) -> ToolArguments {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn explicit_value_is_never_overwritten() {
        let session = session_with_active("rpt-active", DomainTag::Logistics, Duration::minutes(1));
        let arguments = args(json!({ "report_id": "rpt-explicit", "status": "open" }));

        let resolution = resolver().resolve("filter_process_report", &arguments, &session);

        assert_eq!(resolution.arguments, arguments);
        assert!(resolution.injections.is_empty());
        assert!(resolution.error.is_none());
    }

    #[test]
    fn null_value_is_filled_from_active_reference() {
        let session = session_with_active("rpt-active", DomainTag::Logistics, Duration::minutes(1));
        let arguments = args(json!({ "report_id": null, "status": "open" }));

        let resolution = resolver().resolve("filter_process_report", &arguments, &session);

        assert_eq!(resolution.arguments["report_id"], "rpt-active");
        assert_eq!(resolution.arguments["status"], "open");
        assert_eq!(resolution.injections.len(), 1);
        assert_eq!(resolution.injections[0].source, InjectionSource::ActiveReference);
        assert_eq!(resolution.injections[0].domain, DomainTag::Logistics);
    }

    #[test]
    fn tools_outside_allowlist_are_untouched() {
        let session = session_with_active("rpt-active", DomainTag::Logistics, Duration::minutes(1));
        let arguments = ToolArguments::new();

        let resolution = resolver().resolve("list_processes", &arguments, &session);

        assert!(resolution.arguments.is_empty());
        assert!(resolution.is_dispatchable());
    }

    #[test]
    fn stale_only_candidate_fails_explicitly() {
        let session = session_with_active("rpt-old", DomainTag::Logistics, Duration::minutes(31));

        let resolution =
            resolver().resolve("filter_process_report", &ToolArguments::new(), &session);

        assert!(!resolution.arguments.contains_key("report_id"));
        assert!(matches!(
            resolution.error,
            Some(ResolutionError::NoActiveReference { domain: DomainTag::Logistics, .. })
        ));
        assert!(resolution
            .rejections
            .iter()
            .all(|rejection| matches!(rejection.reason, RejectionReason::Stale { .. })));
        assert!(!resolution.rejections.is_empty());
    }

    #[test]
    fn finance_reference_never_reaches_logistics_tool() {
        let session = session_with_active("rpt-fin", DomainTag::Finance, Duration::minutes(1));

        let logistics =
            resolver().resolve("email_process_report", &ToolArguments::new(), &session);
        let finance = resolver().resolve("email_finance_report", &ToolArguments::new(), &session);

        assert!(logistics.error.is_some());
        assert!(!logistics.arguments.contains_key("report_id"));
        assert_eq!(finance.arguments["report_id"], "rpt-fin");
    }

    #[test]
    fn logistics_reference_never_reaches_finance_tool() {
        let session = session_with_active("rpt-log", DomainTag::Logistics, Duration::minutes(1));

        let resolution =
            resolver().resolve("filter_finance_report", &ToolArguments::new(), &session);

        assert!(resolution.error.is_some());
        assert!(resolution.injections.is_empty());
    }

    #[test]
    fn corrupted_slot_is_caught_by_domain_guard() {
        let mut session = SessionState::new(SessionId::from("s-1"));
        session.active_references.insert(
            DomainTag::Logistics,
            ReportReference::new("rpt-fin", DomainTag::Finance, Utc::now()),
        );

        let resolution =
            resolver().resolve("filter_process_report", &ToolArguments::new(), &session);

        assert!(resolution.error.is_some());
        assert_eq!(
            resolution.rejections[0].reason,
            RejectionReason::DomainMismatch { found: DomainTag::Finance }
        );
    }

    #[test]
    fn falls_through_to_visible_then_history() {
        let now = Utc::now();
        let mut session = session_with_active("rpt-old", DomainTag::Logistics, Duration::hours(2));
        session.visible_references.insert(
            DomainTag::Logistics,
            ReportReference::new("rpt-old", DomainTag::Logistics, now - Duration::hours(2)),
        );
        session.push_history(
            HistoryEntry::assistant(
                "Open processes [ref:rpt-hist-9]",
                now - Duration::minutes(3),
                Some(DomainTag::Logistics),
            ),
            100,
        );

        let resolution =
            resolver().resolve_at("filter_process_report", &ToolArguments::new(), &session, now);

        assert_eq!(resolution.arguments["report_id"], "rpt-hist-9");
        assert_eq!(resolution.injections[0].source, InjectionSource::HistoryReference);
        assert_eq!(resolution.injections[0].age_secs, 180);
        assert_eq!(resolution.rejections.len(), 2);
    }

    #[test]
    fn history_source_ignores_other_domains_and_user_entries() {
        let now = Utc::now();
        let mut session = SessionState::new(SessionId::from("s-1"));
        session.push_history(HistoryEntry::user("use [ref:rpt-user]", now), 100);
        session.push_history(
            HistoryEntry::assistant("Payables [ref:rpt-fin]", now, Some(DomainTag::Finance)),
            100,
        );

        let resolution =
            resolver().resolve_at("filter_process_report", &ToolArguments::new(), &session, now);

        assert!(resolution.error.is_some());
    }

    #[test]
    fn empty_session_reports_actionable_error() {
        let session = SessionState::new(SessionId::from("s-1"));

        let resolution =
            resolver().resolve("filter_process_report", &ToolArguments::new(), &session);
        let error = resolution.error.expect("resolution should fail");

        assert_eq!(error.code(), "context_unresolved");
        assert!(error.user_message().contains("list your processes first"));
    }

    #[test]
    fn marker_parsing_takes_last_well_formed_marker() {
        assert_eq!(last_marker("a [ref:one] b [ref:two]"), Some("two"));
        assert_eq!(last_marker("broken [ref:"), None);
        assert_eq!(last_marker("[ref:bad id]"), None);
        assert_eq!(last_marker("no marker"), None);
    }
}
