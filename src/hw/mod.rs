//! Hardware register layer
//!
//! The commit worker talks to the display controller only through
//! [`RegisterLayer`]. Writes go to the shadow copy of the registers and take
//! effect when the hardware latches them at the next refresh boundary after
//! [`RegisterLayer::arm_latch`].

pub mod sim;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::arbiter::ChannelId;
use crate::error::{PipelineId, Result};
use crate::frame::{BlendMode, Compression, PixelFormat, Rect, RefreshChange, Rotation};
use crate::power::PowerState;
use crate::vsync::VsyncNotifier;

/// Where a hardware window fetches its pixels from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LayerSource {
    Color(u32),
    Dma {
        channel: ChannelId,
        /// Device address of each plane
        addrs: Vec<u64>,
        format: PixelFormat,
        rotation: Rotation,
        compression: Compression,
        protected: bool,
        cursor: bool,
    },
}

/// Register image of one enabled window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRegs {
    pub window: usize,
    pub source: LayerSource,
    pub src: Rect,
    pub dst: Rect,
    pub blend: BlendMode,
    pub plane_alpha: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WritebackRegs {
    pub addr: u64,
    pub rect: Rect,
    pub format: PixelFormat,
}

/// Everything programmed for one commit. Windows not listed are disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRegs {
    pub windows: Vec<WindowRegs>,
    pub update_region: Rect,
    pub writeback: Option<WritebackRegs>,
}

/// Snapshot of a pipeline's registers for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterDump {
    pub pipeline: PipelineId,
    pub registers: BTreeMap<String, u64>,
}

/// Register-level access to the display controller
pub trait RegisterLayer: Send + Sync {
    /// Route the pipeline's vsync and frame-done interrupts to `notifier`
    fn attach(&self, pipeline: PipelineId, notifier: Arc<VsyncNotifier>, period: Duration) -> Result<()>;

    fn detach(&self, pipeline: PipelineId);

    /// Write the shadow registers
    fn program(&self, pipeline: PipelineId, regs: &FrameRegs) -> Result<()>;

    /// Request the shadow registers be latched at the next boundary
    fn arm_latch(&self, pipeline: PipelineId) -> Result<()>;

    /// Whether the most recent arm has taken effect
    fn is_latch_confirmed(&self, pipeline: PipelineId) -> bool;

    /// Move a cursor window in the shadow registers
    fn set_cursor_position(&self, pipeline: PipelineId, window: usize, x: i32, y: i32) -> Result<()>;

    fn set_refresh_rate(&self, pipeline: PipelineId, change: RefreshChange) -> Result<()>;

    fn set_power(&self, pipeline: PipelineId, state: PowerState) -> Result<()>;

    /// Full reset of a wedged pipeline
    fn reset(&self, pipeline: PipelineId) -> Result<()>;

    fn dump(&self, pipeline: PipelineId) -> RegisterDump;
}
