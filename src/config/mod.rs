use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const INSTANCE_ENV: &str = "DWS_INSTANCE";
pub const LOG_ENV: &str = "DWS_LOG";
pub const DEFAULT_LOG_LEVEL: &str = "warn";
const FALLBACK_INSTANCE: &str = "localhost";
const PROJECT_CONFIG_FILE: &str = ".dws.project.yml";
const LOG_LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

/// Settings after merging user, project and repo layers. Unset keys fall back
/// to the defaults applied by the `resolve_*` helpers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EffectiveConfig {
    pub instance: Option<String>,
    pub lineage_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    instance: Option<String>,
    #[serde(default)]
    lineage_dir: Option<String>,
    #[serde(default)]
    log_level: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    InvalidValue { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{err}"),
            Self::Yaml(err) => write!(f, "{err}"),
            Self::InvalidValue { key, value } => write!(f, "invalid value `{value}` for `{key}`"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Yaml(value)
    }
}

pub fn load_effective_config(
    cwd: &Path,
    repo_config: Option<&Path>,
    user_config: Option<&Path>,
) -> Result<EffectiveConfig, ConfigError> {
    let mut merged = EffectiveConfig::default();

    if let Some(path) = user_config.filter(|path| path.exists()) {
        merge_layer(&mut merged, load_config_file(path)?);
    }

    if let Some(path) = find_nearest_project_config(cwd) {
        merge_layer(&mut merged, load_config_file(&path)?);
    }

    if let Some(path) = repo_config.filter(|path| path.exists()) {
        merge_layer(&mut merged, load_config_file(path)?);
    }

    Ok(merged)
}

pub fn find_nearest_project_config(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(PROJECT_CONFIG_FILE))
        .find(|candidate| candidate.is_file())
}

fn merge_layer(merged: &mut EffectiveConfig, layer: EffectiveConfig) {
    if layer.instance.is_some() {
        merged.instance = layer.instance;
    }
    if layer.lineage_dir.is_some() {
        merged.lineage_dir = layer.lineage_dir;
    }
    if layer.log_level.is_some() {
        merged.log_level = layer.log_level;
    }
}

pub fn load_config_file(path: &Path) -> Result<EffectiveConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

fn parse_config(content: &str) -> Result<EffectiveConfig, ConfigError> {
    if content.trim().is_empty() {
        return Ok(EffectiveConfig::default());
    }
    let raw: Option<RawConfig> = serde_yaml::from_str(content)?;
    let raw = raw.unwrap_or_default();

    let instance = raw.instance.map(|value| value.trim().to_string());
    if let Some(value) = &instance {
        validate_instance(value)?;
    }
    let log_level = raw
        .log_level
        .map(|value| value.trim().to_ascii_lowercase());
    if let Some(value) = &log_level {
        if !LOG_LEVELS.contains(&value.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "log_level",
                value: value.clone(),
            });
        }
    }
    Ok(EffectiveConfig {
        instance,
        lineage_dir: raw.lineage_dir,
        log_level,
    })
}

fn validate_instance(value: &str) -> Result<(), ConfigError> {
    if value.is_empty() || value.starts_with('.') || value.contains(['/', '\\', '\0']) {
        return Err(ConfigError::InvalidValue {
            key: "instance",
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Instance precedence: command line, `DWS_INSTANCE`, config, hostname.
pub fn resolve_instance(
    cli: Option<&str>,
    env: Option<&str>,
    config: &EffectiveConfig,
) -> Result<String, ConfigError> {
    let chosen = cli
        .or(env)
        .map(|value| value.trim().to_string())
        .or_else(|| config.instance.clone())
        .unwrap_or_else(default_instance);
    validate_instance(&chosen)?;
    Ok(chosen)
}

/// The machine hostname, or `localhost` when it cannot be read.
pub fn default_instance() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .map(|name| name.trim().to_string())
        .filter(|name| validate_instance(name).is_ok())
        .unwrap_or_else(|| FALLBACK_INSTANCE.to_string())
}

/// `lineage_dir` relative to `cwd`, with `~` expanded; `<cwd>/.dws/lineage` when unset.
pub fn resolve_lineage_dir(config: &EffectiveConfig, cwd: &Path, home: &Path) -> PathBuf {
    match &config.lineage_dir {
        Some(raw) => {
            let expanded = expand_tilde(raw, home);
            if expanded.is_absolute() {
                expanded
            } else {
                cwd.join(expanded)
            }
        }
        None => cwd.join(".dws").join("lineage"),
    }
}

pub fn resolve_log_level(config: &EffectiveConfig) -> &str {
    config.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
}

pub fn default_repo_config_yaml() -> String {
    r#"# instance: my-workstation
lineage_dir: .dws/lineage
log_level: warn
"#
    .to_string()
}

pub fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(path)
}
