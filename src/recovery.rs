//! Fatal-error diagnostics
//!
//! When a pipeline wedges, the commit worker captures a [`DiagnosticDump`]
//! (register image plus pipeline state) and hands it to the
//! [`RecoveryManager`]. Dumps are kept in memory, trimmed to a fixed count,
//! and optionally written as JSON to a dump directory.
//!
//! # Usage
//!
//! ```no_run
//! use shadowcommit::recovery::{DumpConfig, RecoveryManager};
//!
//! let mut recovery = RecoveryManager::new(DumpConfig {
//!     dir: Some("/var/lib/shadowcommit/dumps".into()),
//!     max_dumps: 4,
//! });
//! recovery.init()?;
//! if let Some(dump) = recovery.latest() {
//!     println!("last fatal on pipeline {}: {}", dump.pipeline, dump.error);
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::arbiter::ChannelId;
use crate::config::GeneralConfig;
use crate::error::PipelineId;
use crate::hw::RegisterDump;
use crate::pipeline::{FrameRecord, PipelineStats};
use crate::power::PowerState;

/// State captured when a pipeline enters the fatal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticDump {
    pub id: u64,
    pub pipeline: PipelineId,
    /// Seconds since the epoch
    pub timestamp: u64,
    pub version: String,
    pub error: String,
    pub power: PowerState,
    pub queued: usize,
    pub bound_channels: Vec<ChannelId>,
    pub registers: RegisterDump,
    pub recent_frames: Vec<FrameRecord>,
    pub stats: PipelineStats,
}

impl DiagnosticDump {
    pub fn new(pipeline: PipelineId, error: String, power: PowerState) -> Self {
        Self {
            id: 0,
            pipeline,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: format!("{} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_COMMIT")),
            error,
            power,
            queued: 0,
            bound_channels: Vec::new(),
            registers: RegisterDump::default(),
            recent_frames: Vec::new(),
            stats: PipelineStats::default(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize diagnostic dump")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse diagnostic dump")
    }
}

/// Where and how many dumps are kept
#[derive(Debug, Clone, PartialEq)]
pub struct DumpConfig {
    pub dir: Option<PathBuf>,
    pub max_dumps: usize,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_dumps: 4,
        }
    }
}

impl From<&GeneralConfig> for DumpConfig {
    fn from(general: &GeneralConfig) -> Self {
        Self {
            dir: general.dump_dir.clone(),
            max_dumps: general.max_dumps,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub total_dumps: u64,
    pub dumps_written: u64,
    pub write_failures: u64,
    pub reinits: u64,
}

/// Keeps diagnostic dumps and recovery counters for every pipeline
#[derive(Debug)]
pub struct RecoveryManager {
    config: DumpConfig,
    /// Most recent first
    dumps: VecDeque<DiagnosticDump>,
    next_id: u64,
    stats: RecoveryStats,
}

impl RecoveryManager {
    pub fn new(config: DumpConfig) -> Self {
        Self {
            config,
            dumps: VecDeque::new(),
            next_id: 1,
            stats: RecoveryStats::default(),
        }
    }

    /// Create the dump directory and load dumps left by a previous run
    pub fn init(&mut self) -> Result<()> {
        let Some(dir) = self.config.dir.clone() else {
            return Ok(());
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create dump directory: {}", dir.display()))?;

        let mut loaded = Vec::new();
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("Failed to read dump directory: {}", dir.display()))?
            .flatten()
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match Self::load_dump_file(&path) {
                Ok(dump) => loaded.push(dump),
                Err(e) => warn!("Skipping unreadable dump {}: {:#}", path.display(), e),
            }
        }

        loaded.sort_by(|a, b| b.id.cmp(&a.id));
        loaded.truncate(self.config.max_dumps);
        if let Some(latest) = loaded.first() {
            self.next_id = latest.id + 1;
        }
        self.dumps = loaded.into();

        info!(
            "💾 Recovery manager initialized ({} dumps in {})",
            self.dumps.len(),
            dir.display()
        );
        Ok(())
    }

    fn load_dump_file(path: &Path) -> Result<DiagnosticDump> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        DiagnosticDump::from_json(&contents)
    }

    /// Store a dump, returning its id
    pub fn record(&mut self, mut dump: DiagnosticDump) -> u64 {
        dump.id = self.next_id;
        self.next_id += 1;
        self.stats.total_dumps += 1;

        error!(
            "pipeline {} fatal: {} (dump {}, {} frames queued)",
            dump.pipeline, dump.error, dump.id, dump.queued
        );

        if let Some(dir) = &self.config.dir {
            match Self::write_dump(dir, &dump) {
                Ok(path) => {
                    self.stats.dumps_written += 1;
                    debug!("dump {} written to {}", dump.id, path.display());
                }
                Err(e) => {
                    self.stats.write_failures += 1;
                    warn!("Failed to write dump {}: {:#}", dump.id, e);
                }
            }
        }

        let id = dump.id;
        self.dumps.push_front(dump);
        while self.dumps.len() > self.config.max_dumps.max(1) {
            if let Some(old) = self.dumps.pop_back() {
                self.delete_dump(old.id);
            }
        }
        id
    }

    fn write_dump(dir: &Path, dump: &DiagnosticDump) -> Result<PathBuf> {
        let path = dir.join(format!("dump_{}.json", dump.id));
        fs::write(&path, dump.to_json()?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    fn delete_dump(&self, id: u64) {
        if let Some(dir) = &self.config.dir {
            let path = dir.join(format!("dump_{}.json", id));
            if path.exists() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to delete dump {}: {}", path.display(), e);
                }
            }
        }
    }

    pub fn note_reinit(&mut self, pipeline: PipelineId) {
        self.stats.reinits += 1;
        info!("🔄 pipeline {} re-initialized", pipeline);
    }

    pub fn latest(&self) -> Option<&DiagnosticDump> {
        self.dumps.front()
    }

    pub fn dumps_for(&self, pipeline: PipelineId) -> Vec<DiagnosticDump> {
        self.dumps
            .iter()
            .filter(|d| d.pipeline == pipeline)
            .cloned()
            .collect()
    }

    pub fn dump_count(&self) -> usize {
        self.dumps.len()
    }

    pub fn stats(&self) -> RecoveryStats {
        self.stats.clone()
    }
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new(DumpConfig::default())
    }
}
