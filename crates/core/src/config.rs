use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub conversation: ConversationConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Hard limit on how many tool definitions the model accepts per request.
    pub tool_catalog_limit: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationConfig {
    pub reference_max_age_secs: u64,
    pub pending_action_ttl_secs: u64,
    pub history_scan_limit: usize,
    pub history_retention: usize,
    pub stream_holdback_chars: usize,
}

impl ConversationConfig {
    pub fn reference_max_age(&self) -> Duration {
        Duration::seconds(i64::try_from(self.reference_max_age_secs).unwrap_or(i64::MAX))
    }

    pub fn pending_action_ttl(&self) -> Duration {
        Duration::seconds(i64::try_from(self.pending_action_ttl_secs).unwrap_or(i64::MAX))
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            reference_max_age_secs: 1_800,
            pending_action_ttl_secs: 600,
            history_scan_limit: 20,
            history_retention: 100,
            stream_holdback_chars: 80,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub reference_max_age_secs: Option<u64>,
    pub pending_action_ttl_secs: Option<u64>,
    pub stream_holdback_chars: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://despacho.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                max_retries: 2,
                tool_catalog_limit: 64,
            },
            conversation: ConversationConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("despacho.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
            if let Some(tool_catalog_limit) = llm.tool_catalog_limit {
                self.llm.tool_catalog_limit = tool_catalog_limit;
            }
        }

        if let Some(conversation) = patch.conversation {
            if let Some(value) = conversation.reference_max_age_secs {
                self.conversation.reference_max_age_secs = value;
            }
            if let Some(value) = conversation.pending_action_ttl_secs {
                self.conversation.pending_action_ttl_secs = value;
            }
            if let Some(value) = conversation.history_scan_limit {
                self.conversation.history_scan_limit = value;
            }
            if let Some(value) = conversation.history_retention {
                self.conversation.history_retention = value;
            }
            if let Some(value) = conversation.stream_holdback_chars {
                self.conversation.stream_holdback_chars = value;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("DESPACHO_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("DESPACHO_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("DESPACHO_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("DESPACHO_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("DESPACHO_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("DESPACHO_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("DESPACHO_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("DESPACHO_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("DESPACHO_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("DESPACHO_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("DESPACHO_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("DESPACHO_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("DESPACHO_LLM_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("DESPACHO_LLM_TOOL_CATALOG_LIMIT") {
            self.llm.tool_catalog_limit = parse_usize("DESPACHO_LLM_TOOL_CATALOG_LIMIT", &value)?;
        }

        if let Some(value) = read_env("DESPACHO_CONVERSATION_REFERENCE_MAX_AGE_SECS") {
            self.conversation.reference_max_age_secs =
                parse_u64("DESPACHO_CONVERSATION_REFERENCE_MAX_AGE_SECS", &value)?;
        }
        if let Some(value) = read_env("DESPACHO_CONVERSATION_PENDING_ACTION_TTL_SECS") {
            self.conversation.pending_action_ttl_secs =
                parse_u64("DESPACHO_CONVERSATION_PENDING_ACTION_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("DESPACHO_CONVERSATION_HISTORY_SCAN_LIMIT") {
            self.conversation.history_scan_limit =
                parse_usize("DESPACHO_CONVERSATION_HISTORY_SCAN_LIMIT", &value)?;
        }
        if let Some(value) = read_env("DESPACHO_CONVERSATION_HISTORY_RETENTION") {
            self.conversation.history_retention =
                parse_usize("DESPACHO_CONVERSATION_HISTORY_RETENTION", &value)?;
        }
        if let Some(value) = read_env("DESPACHO_CONVERSATION_STREAM_HOLDBACK_CHARS") {
            self.conversation.stream_holdback_chars =
                parse_usize("DESPACHO_CONVERSATION_STREAM_HOLDBACK_CHARS", &value)?;
        }

        let log_level =
            read_env("DESPACHO_LOGGING_LEVEL").or_else(|| read_env("DESPACHO_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("DESPACHO_LOGGING_FORMAT").or_else(|| read_env("DESPACHO_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(value) = overrides.reference_max_age_secs {
            self.conversation.reference_max_age_secs = value;
        }
        if let Some(value) = overrides.pending_action_ttl_secs {
            self.conversation.pending_action_ttl_secs = value;
        }
        if let Some(value) = overrides.stream_holdback_chars {
            self.conversation.stream_holdback_chars = value;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_conversation(&self.conversation)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("despacho.toml"), PathBuf::from("config/despacho.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.tool_catalog_limit == 0 {
        return Err(ConfigError::Validation(
            "llm.tool_catalog_limit must be greater than zero".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_conversation(conversation: &ConversationConfig) -> Result<(), ConfigError> {
    if conversation.reference_max_age_secs == 0 {
        return Err(ConfigError::Validation(
            "conversation.reference_max_age_secs must be greater than zero".to_string(),
        ));
    }

    if conversation.pending_action_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "conversation.pending_action_ttl_secs must be greater than zero".to_string(),
        ));
    }

    if conversation.stream_holdback_chars == 0 {
        return Err(ConfigError::Validation(
            "conversation.stream_holdback_chars must be greater than zero".to_string(),
        ));
    }

    if conversation.history_retention == 0 {
        return Err(ConfigError::Validation(
            "conversation.history_retention must be greater than zero".to_string(),
        ));
    }

    if conversation.history_scan_limit > conversation.history_retention {
        return Err(ConfigError::Validation(format!(
            "conversation.history_scan_limit ({}) cannot exceed conversation.history_retention ({})",
            conversation.history_scan_limit, conversation.history_retention
        )));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    conversation: Option<ConversationPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    tool_catalog_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ConversationPatch {
    reference_max_age_secs: Option<u64>,
    pending_action_ttl_secs: Option<u64>,
    history_scan_limit: Option<usize>,
    history_retention: Option<usize>,
    stream_holdback_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_valid() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.conversation.stream_holdback_chars == 80, "default holdback is 80 chars")?;
        ensure(
            config.conversation.reference_max_age().num_seconds() == 1_800,
            "default reference max age is 30 minutes",
        )?;
        ensure(matches!(config.logging.format, LogFormat::Compact), "default format is compact")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_DESPACHO_LLM_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("despacho.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "anthropic"
api_key = "${TEST_DESPACHO_LLM_KEY}"

[conversation]
reference_max_age_secs = 900
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.llm.provider == LlmProvider::Anthropic, "provider read from file")?;
            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret() == "sk-from-env")
                    == Some(true),
                "api key should be interpolated from environment",
            )?;
            ensure(
                config.conversation.reference_max_age_secs == 900,
                "conversation section read from file",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_DESPACHO_LLM_KEY"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DESPACHO_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("DESPACHO_CONVERSATION_PENDING_ACTION_TTL_SECS", "120");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("despacho.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[conversation]
pending_action_ttl_secs = 300
stream_holdback_chars = 40

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.conversation.pending_action_ttl_secs == 120,
                "env ttl should win over file",
            )?;
            ensure(
                config.conversation.stream_holdback_chars == 40,
                "file holdback should win over default",
            )?;
            Ok(())
        })();

        clear_vars(&["DESPACHO_DATABASE_URL", "DESPACHO_CONVERSATION_PENDING_ACTION_TTL_SECS"]);
        result
    }

    #[test]
    fn hosted_provider_requires_api_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DESPACHO_LLM_PROVIDER", "openai");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("llm.api_key")
            );
            ensure(has_message, "validation failure should mention llm.api_key")
        })();

        clear_vars(&["DESPACHO_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn scan_limit_cannot_exceed_retention() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DESPACHO_CONVERSATION_HISTORY_SCAN_LIMIT", "500");

        let result = (|| -> Result<(), String> {
            let failed = matches!(
                AppConfig::load(LoadOptions::default()),
                Err(ConfigError::Validation(ref message)) if message.contains("history_scan_limit")
            );
            ensure(failed, "scan limit above retention should be rejected")
        })();

        clear_vars(&["DESPACHO_CONVERSATION_HISTORY_SCAN_LIMIT"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DESPACHO_CONVERSATION_STREAM_HOLDBACK_CHARS", "eighty");

        let result = (|| -> Result<(), String> {
            let failed = matches!(
                AppConfig::load(LoadOptions::default()),
                Err(ConfigError::InvalidEnvOverride { ref key, .. })
                    if key == "DESPACHO_CONVERSATION_STREAM_HOLDBACK_CHARS"
            );
            ensure(failed, "non-numeric holdback should be rejected")
        })();

        clear_vars(&["DESPACHO_CONVERSATION_STREAM_HOLDBACK_CHARS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("DESPACHO_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")
        })();

        clear_vars(&["DESPACHO_LLM_API_KEY"]);
        result
    }
}
