use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::pending::PendingActionRequest;
use crate::domain::reference::{IssuedReport, ReportReference};
use crate::domain::session::SessionId;

/// Free-form tool arguments as produced by the model. Handlers validate their own shape.
pub type ToolArguments = Map<String, Value>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: ToolArguments,
}

impl ToolCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), arguments: ToolArguments::new() }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// True when `key` is absent or explicitly null.
    pub fn is_missing(&self, key: &str) -> bool {
        argument_missing(&self.arguments, key)
    }
}

pub fn argument_missing(arguments: &ToolArguments, key: &str) -> bool {
    matches!(arguments.get(key), None | Some(Value::Null))
}

/// Side effects a handler asks the pipeline to commit on its behalf.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolEffects {
    pub pending_action: Option<PendingActionRequest>,
    pub report: Option<IssuedReport>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub response_text: String,
    pub error_code: Option<String>,
    pub data: Option<Value>,
    #[serde(default)]
    pub effects: ToolEffects,
}

impl ToolResult {
    pub fn ok(response_text: impl Into<String>) -> Self {
        Self {
            success: true,
            response_text: response_text.into(),
            error_code: None,
            data: None,
            effects: ToolEffects::default(),
        }
    }

    pub fn failure(error_code: impl Into<String>, response_text: impl Into<String>) -> Self {
        Self {
            success: false,
            response_text: response_text.into(),
            error_code: Some(error_code.into()),
            data: None,
            effects: ToolEffects::default(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_pending_action(mut self, request: PendingActionRequest) -> Self {
        self.effects.pending_action = Some(request);
        self
    }

    /// Records `reference` as the active report of its domain.
    pub fn with_report(mut self, reference: ReportReference) -> Self {
        self.effects.report = Some(IssuedReport { reference, activate: true });
        self
    }

    pub fn with_visible_report(mut self, reference: ReportReference) -> Self {
        self.effects.report = Some(IssuedReport { reference, activate: false });
        self
    }
}

/// Per-call execution context handed to handler groups.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub original_message: String,
    pub correlation_id: String,
    /// Set when the call replays a pending action the user just confirmed.
    pub confirmed: bool,
}

impl ToolContext {
    pub fn new(
        session_id: SessionId,
        original_message: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            original_message: original_message.into(),
            correlation_id: correlation_id.into(),
            confirmed: false,
        }
    }

    pub fn confirmed(mut self) -> Self {
        self.confirmed = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{ToolCall, ToolResult};

    #[test]
    fn null_arguments_count_as_missing() {
        let call = ToolCall::new("filter_process_report")
            .with_argument("report_id", Value::Null)
            .with_argument("status", "open");

        assert!(call.is_missing("report_id"));
        assert!(call.is_missing("limit"));
        assert!(!call.is_missing("status"));
    }

    #[test]
    fn tool_call_deserializes_without_arguments() {
        let call: ToolCall =
            serde_json::from_value(json!({ "name": "daily_summary" })).expect("decode call");

        assert_eq!(call.name, "daily_summary");
        assert!(call.arguments.is_empty());
    }

    #[test]
    fn failure_keeps_user_facing_text() {
        let result = ToolResult::failure("bank_timeout", "The bank did not answer in time.");

        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("bank_timeout"));
        assert!(!result.response_text.is_empty());
    }
}
