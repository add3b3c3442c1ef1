use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use despacho_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let llm_api_key = match &config.llm.api_key {
        Some(secret) => redact_token(secret.expose_secret()),
        None => "<unset>".to_string(),
    };
    let fields: Vec<(&str, String, &str)> = vec![
        ("database.url", config.database.url.clone(), "DESPACHO_DATABASE_URL"),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            "DESPACHO_DATABASE_MAX_CONNECTIONS",
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            "DESPACHO_DATABASE_TIMEOUT_SECS",
        ),
        ("llm.provider", format!("{:?}", config.llm.provider), "DESPACHO_LLM_PROVIDER"),
        ("llm.model", config.llm.model.clone(), "DESPACHO_LLM_MODEL"),
        (
            "llm.base_url",
            config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            "DESPACHO_LLM_BASE_URL",
        ),
        ("llm.api_key", llm_api_key, "DESPACHO_LLM_API_KEY"),
        ("llm.timeout_secs", config.llm.timeout_secs.to_string(), "DESPACHO_LLM_TIMEOUT_SECS"),
        ("llm.max_retries", config.llm.max_retries.to_string(), "DESPACHO_LLM_MAX_RETRIES"),
        (
            "llm.tool_catalog_limit",
            config.llm.tool_catalog_limit.to_string(),
            "DESPACHO_LLM_TOOL_CATALOG_LIMIT",
        ),
        (
            "conversation.reference_max_age_secs",
            config.conversation.reference_max_age_secs.to_string(),
            "DESPACHO_CONVERSATION_REFERENCE_MAX_AGE_SECS",
        ),
        (
            "conversation.pending_action_ttl_secs",
            config.conversation.pending_action_ttl_secs.to_string(),
            "DESPACHO_CONVERSATION_PENDING_ACTION_TTL_SECS",
        ),
        (
            "conversation.history_scan_limit",
            config.conversation.history_scan_limit.to_string(),
            "DESPACHO_CONVERSATION_HISTORY_SCAN_LIMIT",
        ),
        (
            "conversation.history_retention",
            config.conversation.history_retention.to_string(),
            "DESPACHO_CONVERSATION_HISTORY_RETENTION",
        ),
        (
            "conversation.stream_holdback_chars",
            config.conversation.stream_holdback_chars.to_string(),
            "DESPACHO_CONVERSATION_STREAM_HOLDBACK_CHARS",
        ),
        ("logging.level", config.logging.level.clone(), "DESPACHO_LOGGING_LEVEL"),
        ("logging.format", format!("{:?}", config.logging.format), "DESPACHO_LOGGING_FORMAT"),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_key) in fields {
        let source =
            field_source(key, Some(env_key), config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key, &value, source));
    }
    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    ["despacho.toml", "config/despacho.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a provider prefix such as `sk-` and hides the rest.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, redact_token};

    #[test]
    fn redaction_never_shows_the_secret_body() {
        assert_eq!(redact_token("sk-live-abcdef"), "sk-***");
        assert_eq!(redact_token("plainsecret"), "<redacted>");
        assert_eq!(redact_token("  "), "<empty>");
    }

    #[test]
    fn nested_keys_are_found_in_the_file_document() {
        let doc: Value = "[conversation]\npending_action_ttl_secs = 60\n".parse().expect("toml");
        assert!(contains_path(&doc, "conversation.pending_action_ttl_secs"));
        assert!(!contains_path(&doc, "conversation.history_retention"));
    }
}
