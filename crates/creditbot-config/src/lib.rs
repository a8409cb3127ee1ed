use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const ENV_SECRETS_FILE: &str = "CREDITBOT_SECRETS_FILE";
pub const SLACK_BOT_TOKEN: &str = "SLACK_BOT_TOKEN";
pub const LOOKER_CLIENT_ID: &str = "LOOKER_CLIENT_ID";
pub const LOOKER_CLIENT_SECRET: &str = "LOOKER_CLIENT_SECRET";
pub const COMPUTE_API_TOKEN: &str = "COMPUTE_API_TOKEN";
pub const STATE_API_TOKEN: &str = "STATE_API_TOKEN";
pub const SLACK_USER_ID: &str = "SLACK_USER_ID";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
    #[error("secrets file unusable: {0}")]
    Secrets(String),
    #[error("missing required credential: {0}")]
    MissingCredential(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bot: Bot,
    #[serde(default)]
    pub slack: Slack,
    pub bi: Bi,
    pub compute: Compute,
    #[serde(default)]
    pub classifier: Classifier,
    pub state: State,
    pub audit: Audit,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    #[serde(default = "default_bot_name")]
    pub name: String,
    pub channel_id: String,
    #[serde(default)]
    pub bot_user_id: Option<String>,
    #[serde(default)]
    pub operator_user_id: Option<String>,
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slack {
    #[serde(default = "default_slack_api_base")]
    pub api_base: String,
    #[serde(default = "default_slack_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for Slack {
    fn default() -> Self {
        Self {
            api_base: default_slack_api_base(),
            timeout_ms: default_slack_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bi {
    pub base_url: String,
    #[serde(default = "default_bi_domain")]
    pub domain: String,
    #[serde(default = "default_bi_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compute {
    pub endpoint: String,
    #[serde(default = "default_compute_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classifier {
    #[serde(default = "default_keyword")]
    pub keyword: String,
    #[serde(default = "default_qualifiers")]
    pub qualifiers: Vec<String>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            keyword: default_keyword(),
            qualifiers: default_qualifiers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    #[serde(default = "default_state_key")]
    pub key: String,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default)]
    pub fallback_dir: Option<String>,
    #[serde(default)]
    pub primary: Option<PrimaryStore>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryStore {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sqlite_path: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
    #[serde(default)]
    pub immutable_mirror_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub file: Option<String>,
}

/// Credentials and identities resolved once at startup.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub slack_bot_token: String,
    pub bi_client_id: String,
    pub bi_client_secret: String,
    pub compute_token: Option<String>,
    pub state_token: Option<String>,
    pub operator_user_id: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("slack_bot_token", &"<redacted>")
            .field("bi_client_id", &self.bi_client_id)
            .field("bi_client_secret", &"<redacted>")
            .field("compute_token", &self.compute_token.as_ref().map(|_| "<redacted>"))
            .field("state_token", &self.state_token.as_ref().map(|_| "<redacted>"))
            .field("operator_user_id", &self.operator_user_id)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub config: Config,
    pub credentials: Credentials,
}

fn default_bot_name() -> String {
    "CreditBot".to_string()
}

fn default_fetch_limit() -> usize {
    50
}

fn default_poll_interval_ms() -> u64 {
    15 * 60 * 1000
}

fn default_slack_api_base() -> String {
    "https://slack.com/api".to_string()
}

fn default_slack_timeout_ms() -> u64 {
    10_000
}

fn default_bi_domain() -> String {
    "looker.com".to_string()
}

fn default_bi_timeout_ms() -> u64 {
    30_000
}

fn default_compute_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_keyword() -> String {
    "authy".to_string()
}

fn default_qualifiers() -> Vec<String> {
    vec![
        "billable_item_metadata_alex.product".to_string(),
        "billable_items.friendly_name".to_string(),
    ]
}

fn default_state_key() -> String {
    "processed_messages.json".to_string()
}

fn default_max_entries() -> usize {
    1000
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

/// Loads the config file and resolves credentials from the process
/// environment and the secrets file. The only place that reads the ambient
/// environment.
pub fn load_settings(path: &str) -> Result<Settings, ConfigError> {
    let config = load_and_validate(path)?;
    let env: BTreeMap<String, String> = std::env::vars().collect();
    let secrets_path = resolve_setting(
        ENV_SECRETS_FILE,
        &env,
        &BTreeMap::new(),
        config.secrets.file.as_deref(),
    );
    let secrets = load_secrets(secrets_path.as_deref())?;
    let credentials = resolve_credentials(&config, &env, &secrets)?;
    Ok(Settings {
        config,
        credentials,
    })
}

/// Environment first, then the secret backend, then the default. Blank values
/// count as absent.
pub fn resolve_setting(
    name: &str,
    env: &BTreeMap<String, String>,
    secrets: &BTreeMap<String, String>,
    default: Option<&str>,
) -> Option<String> {
    [env.get(name).map(String::as_str), secrets.get(name).map(String::as_str), default]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn load_secrets(path: Option<&str>) -> Result<BTreeMap<String, String>, ConfigError> {
    let Some(path) = path else {
        return Ok(BTreeMap::new());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Secrets(format!("{path}: {e}")))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| ConfigError::Secrets(format!("{path}: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| ConfigError::Secrets(format!("{path}: expected a JSON object")))?;
    Ok(object
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect())
}

pub fn resolve_credentials(
    cfg: &Config,
    env: &BTreeMap<String, String>,
    secrets: &BTreeMap<String, String>,
) -> Result<Credentials, ConfigError> {
    let required = |name: &'static str| {
        resolve_setting(name, env, secrets, None).ok_or(ConfigError::MissingCredential(name))
    };
    Ok(Credentials {
        slack_bot_token: required(SLACK_BOT_TOKEN)?,
        bi_client_id: required(LOOKER_CLIENT_ID)?,
        bi_client_secret: required(LOOKER_CLIENT_SECRET)?,
        compute_token: resolve_setting(COMPUTE_API_TOKEN, env, secrets, None),
        state_token: resolve_setting(STATE_API_TOKEN, env, secrets, None),
        operator_user_id: resolve_setting(
            SLACK_USER_ID,
            env,
            secrets,
            cfg.bot.operator_user_id.as_deref(),
        ),
    })
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.bot.fetch_limit == 0 || cfg.bot.fetch_limit > 1000 {
        return Err(ConfigError::UnsupportedConfig(
            "bot.fetch_limit must be within 1..=1000".to_string(),
        ));
    }
    if cfg.bot.poll_interval_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "bot.poll_interval_ms must be >= 1".to_string(),
        ));
    }
    if cfg.state.max_entries == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "state.max_entries must be >= 1".to_string(),
        ));
    }
    if cfg.classifier.keyword.trim().is_empty() || cfg.classifier.qualifiers.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "classifier requires a keyword and at least one qualifier".to_string(),
        ));
    }
    if cfg.state.primary.is_none() && cfg.state.fallback_dir.is_none() {
        return Err(ConfigError::UnsupportedConfig(
            "state needs a primary store, a fallback_dir, or both".to_string(),
        ));
    }
    if let Some(primary) = &cfg.state.primary {
        let blank = |v: &Option<String>| v.as_ref().map(|v| v.trim().is_empty()).unwrap_or(true);
        match primary.kind.as_str() {
            "memory" => {
                if primary.sqlite_path.is_some() || primary.endpoint.is_some() {
                    return Err(ConfigError::UnsupportedConfig(
                        "state.primary.type=memory takes no sqlite_path or endpoint".to_string(),
                    ));
                }
            }
            "sqlite" => {
                if blank(&primary.sqlite_path) {
                    return Err(ConfigError::UnsupportedConfig(
                        "state.primary.sqlite_path is required when type=sqlite".to_string(),
                    ));
                }
            }
            "http" => {
                if blank(&primary.endpoint) {
                    return Err(ConfigError::UnsupportedConfig(
                        "state.primary.endpoint is required when type=http".to_string(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::UnsupportedConfig(format!(
                    "state.primary.type={other} is not implemented; supported: memory, sqlite, http"
                )));
            }
        }
    }
    Ok(())
}
