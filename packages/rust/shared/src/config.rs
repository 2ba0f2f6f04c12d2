//! Application and pipeline configuration for Newsloom.
//!
//! User config lives at `~/.newsloom/newsloom.toml`. Each pipeline is
//! described by its own TOML file naming the plugins it wires together.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{NewsloomError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "newsloom.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".newsloom";

// ---------------------------------------------------------------------------
// App config (matching newsloom.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Job manager tuning.
    #[serde(default)]
    pub jobs: JobsConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root directory for generator file outputs.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Path of the libSQL database holding content and jobs.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Tick interval for plugins that don't set their own.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            database_path: default_database_path(),
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_output_dir() -> String {
    "./output".into()
}
fn default_database_path() -> String {
    "~/.newsloom/newsloom.db".into()
}
fn default_interval_secs() -> u64 {
    3600
}

/// `[jobs]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// How long a finished one-time job's engine stays observable.
    #[serde(default = "default_engine_grace_ms")]
    pub engine_grace_ms: u64,

    /// Capacity of the status event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Sweep jobs left running by a previous process at startup.
    #[serde(default = "default_true")]
    pub recover_on_startup: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            engine_grace_ms: default_engine_grace_ms(),
            event_capacity: default_event_capacity(),
            recover_on_startup: true,
        }
    }
}

fn default_engine_grace_ms() -> u64 {
    5_000
}
fn default_event_capacity() -> usize {
    256
}
fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Pipeline config
// ---------------------------------------------------------------------------

/// One pipeline definition: which plugins to load and how to run them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Configuration name. Falls back to the file stem when omitted.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub settings: PipelineSettings,

    #[serde(default)]
    pub storage: Vec<PluginSpec>,

    #[serde(default)]
    pub providers: Vec<PluginSpec>,

    #[serde(default)]
    pub sources: Vec<PluginSpec>,

    #[serde(default)]
    pub enrichers: Vec<PluginSpec>,

    #[serde(default)]
    pub generators: Vec<PluginSpec>,

    #[serde(default)]
    pub exporters: Vec<PluginSpec>,
}

/// `[settings]` section of a pipeline file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Run a single pass instead of ticking continuously.
    #[serde(default)]
    pub run_once: bool,

    #[serde(default)]
    pub only_fetch: bool,

    #[serde(default)]
    pub only_generate: bool,

    /// One interval shared by every plugin. Overrides per-plugin intervals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_interval_secs: Option<u64>,

    /// Token ceiling for generators in a single run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,

    #[serde(default)]
    pub force: bool,
}

/// A `[[sources]]`, `[[generators]]`, etc. entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Constructor name registered in the plugin factory.
    #[serde(rename = "type")]
    pub kind: String,

    /// Instance name, unique within its category.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,

    /// Generators only: name of the single predecessor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,

    /// Plugin-specific parameters. `provider` and `storage` keys name other
    /// plugins and are resolved at load time.
    #[serde(default)]
    pub params: toml::Table,
}

impl PluginSpec {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            interval_secs: None,
            depends_on: None,
            params: toml::Table::new(),
        }
    }

    /// A string parameter, if present.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// Deserialize the params table into a typed struct.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T> {
        toml::Value::Table(self.params.clone())
            .try_into()
            .map_err(|e| {
                NewsloomError::config(format!("invalid params for plugin '{}': {e}", self.name))
            })
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.newsloom/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| NewsloomError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.newsloom/newsloom.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| NewsloomError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| NewsloomError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| NewsloomError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| NewsloomError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| NewsloomError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Parse a pipeline definition from TOML text.
pub fn parse_pipeline_config(content: &str) -> Result<PipelineConfig> {
    let config: PipelineConfig = toml::from_str(content)
        .map_err(|e| NewsloomError::config(format!("failed to parse pipeline config: {e}")))?;
    validate_pipeline_config(&config)?;
    Ok(config)
}

/// Load a pipeline definition, naming it after the file when `name` is unset.
pub fn load_pipeline_config_from(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| NewsloomError::io(path, e))?;

    let mut config: PipelineConfig = toml::from_str(&content)
        .map_err(|e| NewsloomError::config(format!("failed to parse {}: {e}", path.display())))?;

    if config.name.is_empty() {
        config.name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    validate_pipeline_config(&config)?;
    Ok(config)
}

fn validate_pipeline_config(config: &PipelineConfig) -> Result<()> {
    if config.name.trim().is_empty() {
        return Err(NewsloomError::config("pipeline config has no name"));
    }
    if config.settings.only_fetch && config.settings.only_generate {
        return Err(NewsloomError::config(
            "only_fetch and only_generate cannot both be set",
        ));
    }
    if config.settings.global_interval_secs == Some(0) {
        return Err(NewsloomError::config("global_interval_secs must be positive"));
    }

    let categories = [
        ("storage", &config.storage),
        ("providers", &config.providers),
        ("sources", &config.sources),
        ("enrichers", &config.enrichers),
        ("generators", &config.generators),
        ("exporters", &config.exporters),
    ];
    for (category, specs) in categories {
        let mut seen = std::collections::HashSet::new();
        for spec in specs.iter() {
            if spec.name.is_empty() {
                return Err(NewsloomError::config(format!(
                    "a '{}' entry in [[{category}]] has no name",
                    spec.kind
                )));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(NewsloomError::config(format!(
                    "duplicate name '{}' in [[{category}]]",
                    spec.name
                )));
            }
            if spec.interval_secs == Some(0) {
                return Err(NewsloomError::config(format!(
                    "interval_secs for '{}' must be positive",
                    spec.name
                )));
            }
        }
    }
    Ok(())
}
