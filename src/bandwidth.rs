//! Bandwidth and clock admission
//!
//! The estimator is an external collaborator; this module only sequences
//! its requests. Requirements are raised before a commit is armed and only
//! lowered once the new configuration is confirmed latched.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::arbiter::ChannelId;
use crate::error::{PipelineError, PipelineId, Result};
use crate::frame::Rect;

/// Memory-bus and clock requirement of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BandwidthPlan {
    /// Peak bus traffic, bytes per second
    pub peak: u64,
    pub read: u64,
    pub write: u64,
    /// Required channel clock, kHz
    pub channel_khz: u64,
}

impl BandwidthPlan {
    /// Field-wise maximum of two plans
    pub fn max(&self, other: &BandwidthPlan) -> BandwidthPlan {
        BandwidthPlan {
            peak: self.peak.max(other.peak),
            read: self.read.max(other.read),
            write: self.write.max(other.write),
            channel_khz: self.channel_khz.max(other.channel_khz),
        }
    }
}

/// When a plan is applied relative to the hardware commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    BeforeCommit,
    AfterCommit,
}

/// Data movement of one enabled window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowLoad {
    pub channel: Option<ChannelId>,
    pub src: Rect,
    pub dst: Rect,
    pub bits_per_pixel: u32,
    pub compressed: bool,
    pub rotated: bool,
    /// Writeback output rather than a scanned-out layer
    pub write: bool,
}

/// Panel timing the estimate is computed against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelTiming {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Computes the requirement of a window set
pub trait BandwidthEstimator: Send + Sync {
    fn estimate(&self, windows: &[WindowLoad], timing: &PanelTiming) -> Result<BandwidthPlan>;
}

/// Applies a requirement to the bus and clock governors
pub trait BandwidthController: Send + Sync {
    fn apply(&self, pipeline: PipelineId, plan: &BandwidthPlan, phase: Phase) -> Result<()>;
}

/// Straight byte-count estimator
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearEstimator;

impl BandwidthEstimator for LinearEstimator {
    fn estimate(&self, windows: &[WindowLoad], timing: &PanelTiming) -> Result<BandwidthPlan> {
        if timing.fps == 0 {
            return Err(PipelineError::Estimator("zero refresh rate".into()));
        }
        let fps = timing.fps as u64;
        let mut plan = BandwidthPlan::default();
        for load in windows {
            let mut bytes = load
                .src
                .area()
                .saturating_mul(load.bits_per_pixel as u64)
                .saturating_mul(fps)
                / 8;
            if load.compressed {
                bytes /= 2;
            }
            if load.write {
                plan.write = plan.write.saturating_add(bytes);
            } else {
                plan.read = plan.read.saturating_add(bytes);
            }

            // downscaling fetches more source pixels per output line
            let ratio_x1000 = if load.dst.area() == 0 {
                1000
            } else {
                (load.src.area().saturating_mul(1000) / load.dst.area()).max(1000)
            };
            let pixel_khz = timing.width as u64 * timing.height as u64 * fps / 1000;
            let mut khz = pixel_khz.saturating_mul(ratio_x1000) / 1000;
            if load.rotated {
                khz = khz.saturating_mul(5) / 4;
            }
            plan.channel_khz = plan.channel_khz.max(khz);
        }
        // rotation and partial reads are bursty
        plan.peak = plan.read.saturating_add(plan.write).saturating_mul(3) / 2;
        Ok(plan)
    }
}

/// Per-pipeline sequencer around the estimator and controller
pub struct BandwidthGate {
    pipeline: PipelineId,
    estimator: Arc<dyn BandwidthEstimator>,
    controller: Arc<dyn BandwidthController>,
    current: BandwidthPlan,
    pending: Option<BandwidthPlan>,
}

impl BandwidthGate {
    pub fn new(
        pipeline: PipelineId,
        estimator: Arc<dyn BandwidthEstimator>,
        controller: Arc<dyn BandwidthController>,
    ) -> Self {
        Self {
            pipeline,
            estimator,
            controller,
            current: BandwidthPlan::default(),
            pending: None,
        }
    }

    /// Estimate the next frame. An estimator failure is returned as-is.
    pub fn estimate(&self, windows: &[WindowLoad], timing: &PanelTiming) -> Result<BandwidthPlan> {
        self.estimator.estimate(windows, timing).map_err(|e| match e {
            PipelineError::Estimator(_) => e,
            other => PipelineError::Estimator(other.to_string()),
        })
    }

    /// Raise to cover both the latched and the upcoming frame
    pub fn before_commit(&mut self, plan: BandwidthPlan) {
        let raised = self.current.max(&plan);
        self.apply(&raised, Phase::BeforeCommit);
        self.pending = Some(plan);
    }

    /// Settle on the new frame's requirement once it is latched
    pub fn after_latch(&mut self) {
        if let Some(plan) = self.pending.take() {
            self.apply(&plan, Phase::AfterCommit);
            self.current = plan;
        }
    }

    /// Drop a pre-commit raise for a frame that never latched
    pub fn revert(&mut self) {
        if self.pending.take().is_some() {
            let current = self.current;
            self.apply(&current, Phase::AfterCommit);
        }
    }

    /// Release everything, used when the pipeline powers down
    pub fn release(&mut self) {
        self.pending = None;
        self.current = BandwidthPlan::default();
        self.apply(&BandwidthPlan::default(), Phase::AfterCommit);
    }

    fn apply(&self, plan: &BandwidthPlan, phase: Phase) {
        debug!(
            "pipeline {} bandwidth {:?}: peak={} khz={}",
            self.pipeline, phase, plan.peak, plan.channel_khz
        );
        if let Err(e) = self.controller.apply(self.pipeline, plan, phase) {
            warn!("pipeline {} bandwidth request failed: {}", self.pipeline, e);
        }
    }
}
