//! Runtime configuration: TOML file + environment overrides.
//!
//! Precedence, highest first: environment variable → `config.toml` value →
//! built-in default. Each nested section maps onto exactly the component
//! that owns it, so components receive only the slice of config they need
//! rather than the whole [`Config`].

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Environment variable naming an explicit config file path.
const CONFIG_PATH_ENV: &str = "DEVCLAW_CONFIG_PATH";

/// Application directory qualifier used by [`directories::ProjectDirs`].
const APP_QUALIFIER: (&str, &str, &str) = ("", "devclaw", "devclaw");

/// Top-level runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// C2 Access Manager settings.
    pub access: AccessConfig,
    /// C3 Pairing Manager settings.
    pub pairing: PairingConfig,
    /// C7 Agent Run budgets.
    pub budget: BudgetConfig,
    /// C5 Model Failover provider table.
    pub models: ModelsConfig,
    /// C12 Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// C11 Notification Dispatcher settings.
    pub notifications: NotificationsConfig,
    /// C15 Metrics Collector settings.
    pub metrics: MetricsConfig,
    /// C16 Hook/Webhook Manager settings.
    pub hooks: HooksConfig,
    /// C4 Tool Executor settings.
    pub tools: ToolsConfig,
    /// Filesystem/database paths.
    pub paths: PathsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            access: AccessConfig::default(),
            pairing: PairingConfig::default(),
            budget: BudgetConfig::default(),
            models: ModelsConfig::default(),
            scheduler: SchedulerConfig::default(),
            notifications: NotificationsConfig::default(),
            metrics: MetricsConfig::default(),
            hooks: HooksConfig::default(),
            tools: ToolsConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

/// C2 Access Manager configuration.
///
/// `owners`/`admins`/`blocked_*`/`allowed_*` are config-seeded identity sets,
/// loaded into the store once at startup; everything minted afterward
/// (`grant`, `block_user`, `set_group_policy`) is a runtime mutation on top
/// of this baseline. Identities are `channel:jid` strings, e.g.
/// `"whatsapp:+15551234567"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Behavior for principals with no explicit grant.
    pub default_policy: String,
    /// Identities always resolving to [`crate::types::AccessLevel::Owner`].
    /// Owners cannot be created at runtime via `grant` — only here.
    pub owners: Vec<String>,
    /// Identities seeded with [`crate::types::AccessLevel::Admin`].
    pub admins: Vec<String>,
    /// Groups blocked outright regardless of any user-level grant.
    pub blocked_groups: Vec<String>,
    /// Individual users blocked outright, overriding group allowances.
    pub blocked_users: Vec<String>,
    /// Groups seeded with [`crate::types::AccessLevel::User`].
    pub allowed_groups: Vec<String>,
    /// Individual users seeded with [`crate::types::AccessLevel::User`].
    pub allowed_users: Vec<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            default_policy: "ask".to_owned(),
            owners: Vec::new(),
            admins: Vec::new(),
            blocked_groups: Vec::new(),
            blocked_users: Vec::new(),
            allowed_groups: Vec::new(),
            allowed_users: Vec::new(),
        }
    }
}

/// C3 Pairing Manager configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Token lifetime before a pairing request expires.
    pub token_ttl_secs: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 900,
        }
    }
}

/// C7 Agent Run budget configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Maximum reasoning/tool-call rounds per run.
    pub max_rounds: u32,
    /// Maximum tokens per session.
    pub max_tokens_per_session: u64,
    /// Maximum tokens per calendar day, shared across sessions.
    pub max_tokens_per_day: u64,
    /// Maximum tool calls allowed within a single turn.
    pub max_tool_calls_per_turn: u32,
    /// Maximum wall-clock seconds per run before forced stop.
    pub max_wallclock_secs: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_rounds: 40,
            max_tokens_per_session: 200_000,
            max_tokens_per_day: 2_000_000,
            max_tool_calls_per_turn: 10,
            max_wallclock_secs: 600,
        }
    }
}

/// C5 Model Failover configuration: ordered model list plus cost table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Primary model identifier, e.g. `"anthropic/claude-sonnet-4"`.
    pub primary: String,
    /// Ordered fallback models tried after the primary.
    pub fallbacks: Vec<String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            primary: "anthropic/claude-sonnet-4".to_owned(),
            fallbacks: vec!["anthropic/claude-haiku".to_owned()],
        }
    }
}

/// C12 Scheduler configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Polling interval, in seconds, for checking due jobs.
    pub tick_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
        }
    }
}

/// C11 Notification Dispatcher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Quiet hours start, `HH:MM` 24h local time.
    pub quiet_hours_start: String,
    /// Quiet hours end, `HH:MM` 24h local time.
    pub quiet_hours_end: String,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            quiet_hours_start: "22:00".to_owned(),
            quiet_hours_end: "07:00".to_owned(),
        }
    }
}

/// C15 Metrics Collector configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled.
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// C16 Hook/Webhook Manager configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Per-destination delivery timeout in seconds.
    pub delivery_timeout_secs: u64,
    /// Maximum delivery retries before giving up.
    pub max_retries: u32,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_secs: 10,
            max_retries: 3,
        }
    }
}

/// C4 Tool Executor configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Tool names that bypass `RequireApproval` friction for every caller.
    /// Never bypasses an outright `Deny`.
    pub auto_approve: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            auto_approve: Vec::new(),
        }
    }
}

/// Resolved filesystem locations for state that lives on disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite database file path.
    pub database: PathBuf,
    /// Directory holding the `.env` credentials file.
    pub config_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = default_data_dir();
        Self {
            database: base.join("devclaw.sqlite3"),
            config_dir: base,
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from(APP_QUALIFIER.0, APP_QUALIFIER.1, APP_QUALIFIER.2)
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".devclaw"))
}

/// Resolved runtime paths, ensured to exist on disk.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// SQLite database file.
    pub database: PathBuf,
    /// `.env` credentials file.
    pub env_file: PathBuf,
}

/// Resolve and create runtime directories from the default project dirs.
///
/// # Errors
///
/// Returns an error if the data directory cannot be created.
pub fn runtime_paths() -> anyhow::Result<RuntimePaths> {
    let base = default_data_dir();
    std::fs::create_dir_all(&base)
        .map_err(|e| anyhow::anyhow!("failed to create data dir {}: {e}", base.display()))?;
    Ok(RuntimePaths {
        database: base.join("devclaw.sqlite3"),
        env_file: base.join(".env"),
    })
}

/// Load configuration with full precedence: env vars > TOML file > defaults.
///
/// The TOML file path is `$DEVCLAW_CONFIG_PATH` if set, otherwise
/// `config.toml` in the current directory; a missing file falls back to
/// built-in defaults without error.
///
/// # Errors
///
/// Returns an error if an existing config file cannot be read or parsed,
/// or if an environment override fails to parse as the target type.
pub fn load() -> anyhow::Result<Config> {
    let path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    let mut config = load_from_file(&path)?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

fn load_from_file(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
    toml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))
}

fn apply_env_overrides(config: &mut Config) -> anyhow::Result<()> {
    if let Ok(val) = std::env::var("DEVCLAW_ACCESS_DEFAULT_POLICY") {
        config.access.default_policy = val;
    }
    if let Ok(val) = std::env::var("DEVCLAW_BUDGET_MAX_ROUNDS") {
        config.budget.max_rounds = val
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid DEVCLAW_BUDGET_MAX_ROUNDS: {e}"))?;
    }
    if let Ok(val) = std::env::var("DEVCLAW_MODELS_PRIMARY") {
        config.models.primary = val;
    }
    if let Ok(val) = std::env::var("DEVCLAW_DATABASE_PATH") {
        config.paths.database = PathBuf::from(val);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.access.default_policy, "ask");
        assert!(config.budget.max_rounds > 0);
        assert!(!config.models.primary.is_empty());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_from_file(Path::new("/nonexistent/devclaw-config.toml")).expect("load_from_file should succeed");
        assert_eq!(config.scheduler.tick_interval_secs, 30);
    }
}
