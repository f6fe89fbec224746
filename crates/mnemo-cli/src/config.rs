//! Configuration Vault – reads/writes `~/.mnemo/config.toml`.

use mnemo_engine::default_trigger_rules;
use mnemo_types::TriggerRule;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Persisted user configuration stored in `~/.mnemo/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Workspace every command operates on.
    #[serde(default = "default_workspace")]
    pub workspace_id: String,

    /// SQLite file of the local store.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Base URL of an OpenAI-compatible server (Ollama, vLLM, OpenAI …).
    /// Empty disables embeddings, reranking and extraction.
    #[serde(default = "default_llm_url")]
    pub llm_url: String,

    /// Chat model used for extraction and reranking.
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Bearer token for `llm_url` (stored as plain text – the file is
    /// created with owner-only permissions).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,

    /// PostgREST endpoint of the remote database.  Empty runs local-only.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_url: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_api_key: String,

    /// Directory of session transcripts mined by the daemon.
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: String,

    #[serde(default = "default_daemon_interval")]
    pub daemon_interval_secs: u64,

    /// Stale memories forced into every `/context` turn (0 disables).
    #[serde(default = "default_stale_per_turn")]
    pub stale_per_turn: usize,

    #[serde(default = "default_trigger_rules")]
    pub triggers: Vec<TriggerRule>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("workspace_id", &self.workspace_id)
            .field("db_path", &self.db_path)
            .field("llm_url", &self.llm_url)
            .field("model", &self.model)
            .field("embedding_model", &self.embedding_model)
            .field("api_key", redacted(&self.api_key))
            .field("remote_url", &self.remote_url)
            .field("remote_api_key", redacted(&self.remote_api_key))
            .field("sessions_dir", &self.sessions_dir)
            .field("daemon_interval_secs", &self.daemon_interval_secs)
            .field("stale_per_turn", &self.stale_per_turn)
            .field("triggers", &self.triggers.len())
            .finish()
    }
}

fn redacted(secret: &str) -> &'static &'static str {
    if secret.is_empty() { &"<not set>" } else { &"<redacted>" }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn mnemo_dir() -> PathBuf {
    PathBuf::from(home_dir()).join(".mnemo")
}

fn default_workspace() -> String {
    "default".to_string()
}
fn default_db_path() -> String {
    mnemo_dir().join("memory.db").to_string_lossy().into_owned()
}
fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "llama3".to_string()
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_sessions_dir() -> String {
    mnemo_dir().join("sessions").to_string_lossy().into_owned()
}
fn default_daemon_interval() -> u64 {
    300
}
fn default_stale_per_turn() -> usize {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_id: default_workspace(),
            db_path: default_db_path(),
            llm_url: default_llm_url(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            api_key: String::new(),
            remote_url: String::new(),
            remote_api_key: String::new(),
            sessions_dir: default_sessions_dir(),
            daemon_interval_secs: default_daemon_interval(),
            stale_per_turn: default_stale_per_turn(),
            triggers: default_trigger_rules(),
        }
    }
}

/// Return the path to `~/.mnemo/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".mnemo").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// The stored config, or the defaults when there is none.  Environment
/// overrides apply either way.
pub fn load_or_default() -> Result<Config, String> {
    match load()? {
        Some(cfg) => Ok(cfg),
        None => {
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            Ok(cfg)
        }
    }
}

pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `MNEMO_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MNEMO_DB_PATH` | `db_path` |
/// | `MNEMO_WORKSPACE` | `workspace_id` |
/// | `MNEMO_LLM_URL` | `llm_url` |
/// | `MNEMO_MODEL` | `model` |
/// | `MNEMO_REMOTE_URL` | `remote_url` |
/// | `MNEMO_DAEMON_INTERVAL` | `daemon_interval_secs` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("MNEMO_DB_PATH") {
        cfg.db_path = v;
    }
    if let Ok(v) = std::env::var("MNEMO_WORKSPACE")
        && !v.trim().is_empty()
    {
        cfg.workspace_id = v;
    }
    if let Ok(v) = std::env::var("MNEMO_LLM_URL") {
        cfg.llm_url = v;
    }
    if let Ok(v) = std::env::var("MNEMO_MODEL") {
        cfg.model = v;
    }
    if let Ok(v) = std::env::var("MNEMO_REMOTE_URL") {
        cfg.remote_url = v;
    }
    if let Ok(v) = std::env::var("MNEMO_DAEMON_INTERVAL")
        && let Ok(secs) = v.parse::<u64>()
        && secs > 0
    {
        cfg.daemon_interval_secs = secs;
    }
}

/// Save the config to disk, creating `~/.mnemo/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
