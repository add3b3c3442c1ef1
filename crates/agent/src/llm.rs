use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use despacho_core::domain::session::{HistoryEntry, SessionId};
use despacho_core::domain::tool::ToolCall;

use crate::catalog::ToolSpec;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelRequest {
    pub session_id: SessionId,
    pub correlation_id: String,
    pub message: String,
    pub history: Vec<HistoryEntry>,
    /// Already cut down to the provider's tool limit.
    pub tools: Vec<ToolSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub text: Option<String>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self { tool_calls: Vec::new(), text: Some(text.into()) }
    }

    pub fn calls(tool_calls: Vec<ToolCall>) -> Self {
        Self { tool_calls, text: None }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse>;
}
