//! Configuration management.

use crate::engine::{EngineKind, PushMode};
use crate::pipeline::PipelineOptions;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// On-disk layout of `config.toml` and `.streamctl.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    pipeline: PipelineConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct EngineConfig {
    #[serde(default)]
    kind: EngineKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PipelineConfig {
    #[serde(default)]
    push_mode: PushMode,
    #[serde(default = "default_state_timeout_ms")]
    state_timeout_ms: u64,
    #[serde(default = "default_event_buffer")]
    event_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            push_mode: PushMode::default(),
            state_timeout_ms: default_state_timeout_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct LoggingConfig {
    /// Extra plain-text log destination
    log_file: Option<PathBuf>,
    /// Filter directive; RUST_LOG or "info" when unset
    log_level: Option<String>,
}

fn default_state_timeout_ms() -> u64 {
    10_000
}

fn default_event_buffer() -> usize {
    256
}

/// Values given on the command line. They override every other source.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub engine: Option<EngineKind>,
    pub push_mode: Option<PushMode>,
    pub state_timeout_ms: Option<u64>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
}

/// Resolved settings of the command line front end.
#[derive(Debug, Clone)]
pub struct Config {
    /// Engine used to build pipelines
    pub engine: EngineKind,
    /// Options applied to every pipeline
    pub pipeline: PipelineOptions,
    /// Extra plain-text log destination
    pub log_file: Option<PathBuf>,
    /// Filter directive taking precedence over RUST_LOG
    pub log_level: Option<String>,
}

impl Config {
    /// Resolve the settings. Later sources win: built-in defaults, the
    /// user `config.toml` (`~/.config/streamctl/` on Linux), `.streamctl.toml`
    /// in the working directory, `STREAMCTL_*` variables, then `cli`.
    pub fn from_figment(cli: CliOverrides) -> anyhow::Result<Self> {
        let local_config = std::env::current_dir()
            .ok()
            .map(|d| d.join(".streamctl.toml"));
        let user_config = directories::ProjectDirs::from("", "", "streamctl")
            .map(|dirs| dirs.config_dir().join("config.toml"));

        // Priority: defaults < user config < local config < env vars < CLI args
        let mut figment = Figment::new().merge(Serialized::defaults(ConfigFile::default()));

        if let Some(ref path) = user_config {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        if let Some(ref path) = local_config {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        // STREAMCTL_PIPELINE__PUSH_MODE sets pipeline.push_mode
        figment = figment.merge(Env::prefixed("STREAMCTL_").split("__"));

        if let Some(engine) = cli.engine {
            figment = figment.merge(Serialized::default("engine.kind", engine));
        }
        if let Some(push_mode) = cli.push_mode {
            figment = figment.merge(Serialized::default("pipeline.push_mode", push_mode));
        }
        if let Some(timeout) = cli.state_timeout_ms {
            figment = figment.merge(Serialized::default("pipeline.state_timeout_ms", timeout));
        }
        if let Some(ref level) = cli.log_level {
            figment = figment.merge(Serialized::default("logging.log_level", level));
        }
        if let Some(ref file) = cli.log_file {
            figment = figment.merge(Serialized::default("logging.log_file", file));
        }

        let config_file: ConfigFile = figment.extract()?;
        Ok(Self::from(config_file))
    }
}

impl From<ConfigFile> for Config {
    fn from(file: ConfigFile) -> Self {
        Self {
            engine: file.engine.kind,
            pipeline: PipelineOptions {
                push_mode: file.pipeline.push_mode,
                state_timeout: Duration::from_millis(file.pipeline.state_timeout_ms),
                event_buffer: file.pipeline.event_buffer.max(1),
            },
            log_file: file.logging.log_file,
            log_level: file.logging.log_level,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from(ConfigFile::default())
    }
}
