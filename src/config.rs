//! Fleet configuration loading and validation.
//!
//! A fleet file lists the providers to supervise and the engine's runtime
//! settings. YAML is the default format; files ending in `.json` are parsed
//! as JSON. Environment variables are interpolated before parsing.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    /// The file content is not valid YAML/JSON for the schema.
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// The content parsed but violates a constraint.
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Provider Config ─────────────────────────────────────────────────────────

/// How the engine talks to a provider. Providers are always local children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Line-delimited JSON-RPC over the child's stdin/stdout.
    #[default]
    Stdio,
}

/// Launch and supervision settings for one provider.
///
/// Immutable once added to a fleet; changes require remove + re-add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider id.
    pub id: String,
    /// Display name (falls back to the id).
    #[serde(default)]
    pub name: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the process.
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true", alias = "autoStart")]
    pub auto_start: bool,
    #[serde(default = "default_true", alias = "restartOnFailure")]
    pub restart_on_failure: bool,
    #[serde(default = "default_max_restarts", alias = "maxRestarts")]
    pub max_restarts: u32,
    /// Health probe period in milliseconds; 0 disables probing.
    #[serde(default = "default_health_check_interval_ms", alias = "healthCheckInterval")]
    pub health_check_interval_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_max_restarts() -> u32 {
    3
}
fn default_health_check_interval_ms() -> u64 {
    30_000
}

impl ProviderConfig {
    /// A config with the default supervision policy.
    pub fn new(id: &str, command: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            transport: TransportKind::Stdio,
            enabled: true,
            auto_start: true,
            restart_on_failure: true,
            max_restarts: default_max_restarts(),
            health_check_interval_ms: default_health_check_interval_ms(),
        }
    }

    /// Name shown to users.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Health probe period; `None` when probing is disabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0)
            .then(|| Duration::from_millis(self.health_check_interval_ms))
    }

    /// Check required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "provider id must not be empty".into(),
            });
        }
        if self.command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: format!("provider '{}' has no command", self.id),
            });
        }
        Ok(())
    }
}

// ─── Fleet Settings ──────────────────────────────────────────────────────────

/// Engine-wide runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    /// Delay before an automatic restart after a failure or crash.
    pub restart_delay_ms: u64,
    /// Limit for each provider call after the handshake.
    pub request_timeout_ms: u64,
    /// Limit for the initialize handshake.
    pub init_timeout_ms: u64,
    /// Grace period between closing a channel and killing the process.
    pub shutdown_timeout_ms: u64,
    /// Limit for one health probe.
    pub health_check_timeout_ms: u64,
    /// Notification bus buffer size.
    pub event_capacity: usize,
    /// Search result limit when a query does not set one.
    pub search_limit: usize,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            restart_delay_ms: 5_000,
            request_timeout_ms: 30_000,
            init_timeout_ms: 30_000,
            shutdown_timeout_ms: 5_000,
            health_check_timeout_ms: 10_000,
            event_capacity: 1024,
            search_limit: 50,
        }
    }
}

impl FleetSettings {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

// ─── Fleet Config ────────────────────────────────────────────────────────────

/// Top-level fleet file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub settings: FleetSettings,
}

impl FleetConfig {
    /// Validate every provider and reject duplicate ids.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            provider.validate()?;
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::Invalid {
                    reason: format!("duplicate provider id '{}'", provider.id),
                });
            }
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load, interpolate, parse and validate a fleet file.
///
/// Performs environment-variable interpolation on the raw text for
/// `${VAR_NAME}` and `${VAR_NAME:-default}`.
pub fn load_fleet_config(path: &Path) -> Result<FleetConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let config = parse_fleet_config(&raw, is_json)?;

    tracing::info!(
        path = %path.display(),
        providers = config.providers.len(),
        "loaded fleet config"
    );
    Ok(config)
}

/// Parse fleet config text (YAML, or JSON when `is_json`).
pub fn parse_fleet_config(raw: &str, is_json: bool) -> Result<FleetConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);

    let config: FleetConfig = if is_json {
        serde_json::from_str(&interpolated).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })?
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })?
    };

    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__FLEET_TEST_NONEXISTENT_VAR__");
        let input = "${__FLEET_TEST_NONEXISTENT_VAR__:-/fallback/path}";
        assert_eq!(interpolate_env_vars(input), "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__FLEET_TEST_VAR__", "/custom/path");
        let input = "${__FLEET_TEST_VAR__:-/fallback/path}";
        assert_eq!(interpolate_env_vars(input), "/custom/path");
        std::env::remove_var("__FLEET_TEST_VAR__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with $ but no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/providers");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/providers"));
    }

    #[test]
    fn test_provider_defaults_from_yaml() {
        let yaml = r#"
            providers:
              - id: fs
                command: npx
                args: ["-y", "@scope/fs-provider"]
        "#;
        let config = parse_fleet_config(yaml, false).unwrap();
        let fs = &config.providers[0];
        assert!(fs.enabled);
        assert!(fs.auto_start);
        assert!(fs.restart_on_failure);
        assert_eq!(fs.max_restarts, 3);
        assert_eq!(fs.health_check_interval(), Some(Duration::from_secs(30)));
        assert_eq!(fs.transport, TransportKind::Stdio);
        assert_eq!(fs.display_name(), "fs");
        assert_eq!(config.settings, FleetSettings::default());
    }

    #[test]
    fn test_camel_case_aliases_from_json() {
        let json = r#"{
            "providers": [{
                "id": "git",
                "name": "Git",
                "command": "git-provider",
                "autoStart": false,
                "maxRestarts": 1,
                "healthCheckInterval": 0
            }],
            "settings": {"restart_delay_ms": 250}
        }"#;
        let config = parse_fleet_config(json, true).unwrap();
        let git = &config.providers[0];
        assert!(!git.auto_start);
        assert_eq!(git.max_restarts, 1);
        assert_eq!(git.health_check_interval(), None);
        assert_eq!(git.display_name(), "Git");
        assert_eq!(config.settings.restart_delay(), Duration::from_millis(250));
        assert_eq!(config.settings.search_limit, 50);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let yaml = r#"
            providers:
              - { id: fs, command: a }
              - { id: fs, command: b }
        "#;
        let err = parse_fleet_config(yaml, false).unwrap_err();
        assert!(err.to_string().contains("duplicate provider id 'fs'"));
    }

    #[test]
    fn test_missing_command_rejected() {
        let config = ProviderConfig::new("fs", "  ");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
        let config = ProviderConfig::new("", "npx");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fleet.yaml");
        std::fs::write(
            &path,
            "providers:\n  - id: search\n    command: ${__FLEET_TEST_UNSET_CMD__:-search-provider}\n",
        )
        .unwrap();
        let config = load_fleet_config(&path).unwrap();
        assert_eq!(config.providers[0].command, "search-provider");

        let missing = load_fleet_config(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(missing, ConfigError::ReadFailed { .. }));
    }
}
