//! Configuration management for shadowcommit
//!
//! This module handles loading, parsing, and validating the display
//! configuration from TOML files: the shared channel pool, every output
//! pipeline, timeouts, hibernation, and logging.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::arbiter::{ChannelId, MAX_CHANNELS};
use crate::error::PipelineId;

/// Main configuration struct containing all pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayConfig {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Commit timeouts
    #[serde(default)]
    pub timing: TimingConfig,

    /// Idle power saving
    #[serde(default)]
    pub hibernation: HibernationConfig,

    /// Log filtering
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Hardware channel pool shared by every pipeline
    #[serde(default = "DisplayConfig::default_channels")]
    pub channels: Vec<ChannelCaps>,

    /// Output pipelines
    #[serde(default = "DisplayConfig::default_pipelines")]
    pub pipelines: Vec<PipelineConfig>,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory diagnostic dumps are written to (none = keep in memory)
    pub dump_dir: Option<PathBuf>,

    /// Number of diagnostic dumps kept per pipeline
    pub max_dumps: usize,

    /// Number of frame records kept per pipeline
    pub history_len: usize,
}

/// Commit timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// How long the worker waits on each acquire fence (milliseconds)
    pub acquire_timeout_ms: u64,

    /// Latch confirmation budget, in refresh periods
    pub latch_timeout_frames: u32,

    /// Writeback frame-done budget (milliseconds)
    pub frame_done_timeout_ms: u64,

    /// Upper bound for draining the queue on blank (milliseconds)
    pub flush_timeout_ms: u64,
}

/// Hibernation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HibernationConfig {
    /// Enter hibernation automatically when idle
    pub enabled: bool,

    /// Idle time before entering hibernation (milliseconds)
    pub idle_timeout_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level ("error", "warn", "info", "debug", "trace")
    pub level: String,

    /// Per-module level overrides, e.g. `"shadowcommit::buffer" = "trace"`
    pub modules: BTreeMap<String, String>,
}

/// Capabilities of one hardware channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelCaps {
    pub id: ChannelId,
    #[serde(default)]
    pub rotation: bool,
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub scaling: bool,
    #[serde(default)]
    pub yuv: bool,
}

impl ChannelCaps {
    /// A channel with every feature
    pub fn full(id: ChannelId) -> Self {
        Self {
            id,
            rotation: true,
            compression: true,
            protected: true,
            scaling: true,
            yuv: true,
        }
    }

    /// A channel that only reads linear RGB at 1:1
    pub fn basic(id: ChannelId) -> Self {
        Self {
            id,
            rotation: false,
            compression: false,
            protected: false,
            scaling: false,
            yuv: false,
        }
    }
}

/// Kind of output a pipeline drives
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    /// Scans out to a panel; paced by vsync
    Display,
    /// Writes the composed frame back to memory; paced by frame-done
    Writeback,
}

/// One output pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub id: PipelineId,

    #[serde(default = "PipelineConfig::default_kind")]
    pub kind: PipelineKind,

    pub width: u32,

    pub height: u32,

    /// Hardware windows (layers) per frame
    pub window_count: usize,

    /// Initial refresh rate (Hz)
    #[serde(default = "PipelineConfig::default_refresh_hz")]
    pub refresh_hz: u32,
}

impl PipelineConfig {
    fn default_kind() -> PipelineKind {
        PipelineKind::Display
    }

    fn default_refresh_hz() -> u32 {
        60
    }

    pub fn display(id: PipelineId, width: u32, height: u32, window_count: usize) -> Self {
        Self {
            id,
            kind: PipelineKind::Display,
            width,
            height,
            window_count,
            refresh_hz: Self::default_refresh_hz(),
        }
    }

    pub fn writeback(id: PipelineId, width: u32, height: u32, window_count: usize) -> Self {
        Self {
            kind: PipelineKind::Writeback,
            ..Self::display(id, width, height, window_count)
        }
    }

    /// One refresh period at the configured rate
    pub fn frame_period(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.refresh_hz.max(1) as u64)
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            dump_dir: None,
            max_dumps: 4,
            history_len: 64,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 300,
            latch_timeout_frames: 4,
            frame_done_timeout_ms: 100,
            flush_timeout_ms: 3000,
        }
    }
}

impl TimingConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn frame_done_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_done_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Latch budget for a pipeline refreshing every `period`
    pub fn latch_timeout(&self, period: Duration) -> Duration {
        period * self.latch_timeout_frames.max(1)
    }
}

impl Default for HibernationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            idle_timeout_ms: 500,
        }
    }
}

impl HibernationConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            modules: BTreeMap::new(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            timing: TimingConfig::default(),
            hibernation: HibernationConfig::default(),
            logging: LoggingConfig::default(),
            channels: Self::default_channels(),
            pipelines: Self::default_pipelines(),
        }
    }
}

impl DisplayConfig {
    fn default_channels() -> Vec<ChannelCaps> {
        vec![
            ChannelCaps::basic(0),
            ChannelCaps::basic(1),
            ChannelCaps::full(2),
            ChannelCaps::full(3),
            ChannelCaps {
                protected: true,
                ..ChannelCaps::basic(4)
            },
            ChannelCaps {
                yuv: true,
                scaling: true,
                ..ChannelCaps::basic(5)
            },
        ]
    }

    fn default_pipelines() -> Vec<PipelineConfig> {
        vec![
            PipelineConfig::display(0, 1080, 2400, 6),
            PipelineConfig::display(1, 1920, 1080, 4),
            PipelineConfig::writeback(2, 1080, 2400, 2),
        ]
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            let rest = path.strip_prefix("~").unwrap_or(path);
            Path::new(&home).join(rest)
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: DisplayConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() || self.channels.len() > MAX_CHANNELS {
            anyhow::bail!(
                "Invalid channel count {}: must be between 1 and {}",
                self.channels.len(),
                MAX_CHANNELS
            );
        }

        let mut channel_ids = BTreeSet::new();
        for channel in &self.channels {
            if channel.id as usize >= MAX_CHANNELS {
                anyhow::bail!("Channel id {} exceeds {}", channel.id, MAX_CHANNELS - 1);
            }
            if !channel_ids.insert(channel.id) {
                anyhow::bail!("Duplicate channel id {}", channel.id);
            }
        }

        if self.pipelines.is_empty() {
            anyhow::bail!("At least one pipeline must be configured");
        }

        let mut pipeline_ids = BTreeSet::new();
        for pipeline in &self.pipelines {
            if !pipeline_ids.insert(pipeline.id) {
                anyhow::bail!("Duplicate pipeline id {}", pipeline.id);
            }
            if pipeline.window_count == 0 || pipeline.window_count > 64 {
                anyhow::bail!(
                    "Pipeline {}: window_count must be between 1 and 64",
                    pipeline.id
                );
            }
            if pipeline.width == 0 || pipeline.height == 0 {
                anyhow::bail!("Pipeline {}: resolution must be non-zero", pipeline.id);
            }
            if pipeline.refresh_hz == 0 || pipeline.refresh_hz > 480 {
                anyhow::bail!(
                    "Pipeline {}: refresh_hz must be between 1 and 480",
                    pipeline.id
                );
            }
        }

        if self.timing.latch_timeout_frames == 0 {
            anyhow::bail!("latch_timeout_frames must be at least 1");
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace", "off"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }
        for (module, level) in &self.logging.modules {
            if !valid_levels.contains(&level.as_str()) {
                anyhow::bail!("Invalid log level for {}: {}", module, level);
            }
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }

    /// Merge a partial configuration into this one
    /// Sections of the partial config that differ from the defaults override this config
    pub fn merge_partial(mut self, partial: DisplayConfig) -> Self {
        let default_config = DisplayConfig::default();

        if partial.general != default_config.general {
            self.general = partial.general;
        }
        if partial.timing != default_config.timing {
            self.timing = partial.timing;
        }
        if partial.hibernation != default_config.hibernation {
            self.hibernation = partial.hibernation;
        }
        if partial.logging != default_config.logging {
            self.logging = partial.logging;
        }
        if partial.channels != default_config.channels {
            self.channels = partial.channels;
        }
        if partial.pipelines != default_config.pipelines {
            self.pipelines = partial.pipelines;
        }

        self
    }

    /// Size of the channel index space (highest channel id plus one)
    pub fn channel_slots(&self) -> usize {
        self.channels
            .iter()
            .map(|c| c.id as usize + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn pipeline(&self, id: PipelineId) -> Option<&PipelineConfig> {
        self.pipelines.iter().find(|p| p.id == id)
    }
}


#[cfg(test)]
mod property_tests;
