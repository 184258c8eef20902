//! Frame description and validation
//!
//! A frame is an ordered list of window configurations, optionally a
//! writeback target, or a refresh-rate change. Everything here is checked
//! synchronously on submission; nothing that fails validation ever reaches
//! the commit worker.

use serde::{Deserialize, Serialize};

use crate::arbiter::ChannelId;
use crate::buffer::{BufferBinding, BufferHandle};
use crate::config::ChannelCaps;
use crate::error::{PipelineError, Result};
use crate::fence::{Fence, FenceProducer};
use crate::power::HiberBlock;

/// Largest source extent, offset included, a channel can fetch
pub const MAX_SOURCE_EXTENT: u32 = 16384;

/// Integer rectangle in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    /// Whether `self` lies entirely within `0..width, 0..height`
    pub fn fits_in(&self, width: u32, height: u32) -> bool {
        self.x >= 0
            && self.y >= 0
            && self.x as u64 + self.w as u64 <= width as u64
            && self.y as u64 + self.h as u64 <= height as u64
    }

    /// Far corner of a rect anchored at non-negative coordinates
    pub fn extent(&self) -> Option<(u32, u32)> {
        let x = u32::try_from(self.x).ok()?;
        let y = u32::try_from(self.y).ok()?;
        Some((x.checked_add(self.w)?, y.checked_add(self.h)?))
    }
}

/// Pixel layout of a buffer window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Argb8888,
    Xrgb8888,
    Rgb565,
    Argb2101010,
    /// Two-plane 4:2:0, luma then interleaved chroma
    Nv12,
    /// Three-plane 4:2:0
    Yuv420,
}

impl PixelFormat {
    pub fn plane_count(&self) -> usize {
        match self {
            PixelFormat::Nv12 => 2,
            PixelFormat::Yuv420 => 3,
            _ => 1,
        }
    }

    /// Bytes each plane needs for a `w` x `h` source, `None` on overflow
    pub fn plane_sizes(&self, w: u32, h: u32) -> Option<Vec<u64>> {
        let luma = (w as u64).checked_mul(h as u64)?;
        let sizes = match self {
            PixelFormat::Argb8888 | PixelFormat::Xrgb8888 | PixelFormat::Argb2101010 => {
                vec![luma.checked_mul(4)?]
            }
            PixelFormat::Rgb565 => vec![luma.checked_mul(2)?],
            PixelFormat::Nv12 => vec![luma, luma / 2],
            PixelFormat::Yuv420 => vec![luma, luma / 4, luma / 4],
        };
        Some(sizes)
    }

    pub fn bits_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Argb8888 | PixelFormat::Xrgb8888 | PixelFormat::Argb2101010 => 32,
            PixelFormat::Rgb565 => 16,
            PixelFormat::Nv12 | PixelFormat::Yuv420 => 12,
        }
    }

    pub fn is_yuv(&self) -> bool {
        matches!(self, PixelFormat::Nv12 | PixelFormat::Yuv420)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    None,
    Rot90,
    Rot180,
    Rot270,
    FlipX,
    FlipY,
}

impl Rotation {
    pub fn swaps_axes(&self) -> bool {
        matches!(self, Rotation::Rot90 | Rotation::Rot270)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlendMode {
    None,
    #[default]
    Premultiplied,
    Coverage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    None,
    /// Lossless block compression with a header plane
    Afbc,
    Sbwc,
}

/// A buffer-backed window
#[derive(Debug, Clone, PartialEq)]
pub struct BufferWindow {
    pub src: Rect,
    pub dst: Rect,
    pub format: PixelFormat,
    pub rotation: Rotation,
    pub blend: BlendMode,
    pub plane_alpha: u8,
    pub channel: ChannelId,
    pub compression: Compression,
    pub handles: Vec<BufferHandle>,
    pub protected: bool,
    /// Completion the producer signals when the buffer is written
    pub acquire: Option<Fence>,
}

impl BufferWindow {
    /// A plain single-plane ARGB window, source size equal to `dst`
    pub fn simple(channel: ChannelId, dst: Rect, handle: BufferHandle) -> Self {
        Self {
            src: Rect::new(0, 0, dst.w, dst.h),
            dst,
            format: PixelFormat::Argb8888,
            rotation: Rotation::None,
            blend: BlendMode::Premultiplied,
            plane_alpha: 0xff,
            channel,
            compression: Compression::None,
            handles: vec![handle],
            protected: false,
            acquire: None,
        }
    }

    pub fn with_acquire(mut self, acquire: Fence) -> Self {
        self.acquire = Some(acquire);
        self
    }

    pub fn is_scaled(&self) -> bool {
        let (w, h) = if self.rotation.swaps_axes() {
            (self.src.h, self.src.w)
        } else {
            (self.src.w, self.src.h)
        };
        w != self.dst.w || h != self.dst.h
    }
}

/// One compositing layer of a frame
#[derive(Debug, Clone, PartialEq)]
pub enum WindowConfig {
    Disabled,
    /// Solid fill, 0xAARRGGBB
    Color { color: u32, dst: Rect },
    Buffer(BufferWindow),
    /// A buffer window whose position may be moved without a full commit
    Cursor(BufferWindow),
}

impl WindowConfig {
    pub fn buffer(&self) -> Option<&BufferWindow> {
        match self {
            WindowConfig::Buffer(b) | WindowConfig::Cursor(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, WindowConfig::Disabled)
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.buffer().map(|b| b.channel)
    }
}

/// Output target of a writeback pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct WritebackTarget {
    pub rect: Rect,
    pub format: PixelFormat,
    pub handle: BufferHandle,
}

/// Refresh-rate change carried instead of window updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshChange {
    pub fps: u32,
    /// Opaque panel mode tag
    pub mode: u32,
}

/// What a client submits
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameDesc {
    pub windows: Vec<WindowConfig>,
    pub writeback: Option<WritebackTarget>,
    /// Damaged area; `None` means the whole screen
    pub update_region: Option<Rect>,
}

impl FrameDesc {
    pub fn new(windows: Vec<WindowConfig>) -> Self {
        Self {
            windows,
            writeback: None,
            update_region: None,
        }
    }

    pub fn with_writeback(mut self, target: WritebackTarget) -> Self {
        self.writeback = Some(target);
        self
    }

    pub fn with_update_region(mut self, region: Rect) -> Self {
        self.update_region = Some(region);
        self
    }
}

/// Completion handles returned to the submitter
#[derive(Debug, Clone)]
pub struct SubmitFences {
    /// Fires when the frame has been handed to hardware
    pub retire: Fence,
    /// Fires when a writeback buffer holds the frame's contents
    pub readback: Option<Fence>,
}

/// Pipeline limits a frame is validated against
#[derive(Debug, Clone)]
pub struct FrameLimits<'a> {
    pub max_windows: usize,
    pub width: u32,
    pub height: u32,
    pub channels: &'a [ChannelCaps],
    pub writeback: bool,
}

/// Check everything about `desc` that does not need the buffers themselves
pub fn validate(desc: &FrameDesc, limits: &FrameLimits<'_>) -> Result<()> {
    if desc.windows.len() > limits.max_windows {
        return Err(PipelineError::TooManyWindows {
            count: desc.windows.len(),
            max: limits.max_windows,
        });
    }

    let mut used = Vec::new();
    for (index, window) in desc.windows.iter().enumerate() {
        match window {
            WindowConfig::Disabled => {}
            WindowConfig::Color { dst, .. } => check_dst(index, dst, limits)?,
            WindowConfig::Buffer(b) | WindowConfig::Cursor(b) => {
                validate_buffer_window(index, b, limits)?;
                if used.contains(&b.channel) {
                    return Err(PipelineError::InvalidWindow {
                        window: index,
                        reason: format!("channel {} used by two windows", b.channel),
                    });
                }
                used.push(b.channel);
            }
        }
    }

    if let Some(region) = desc.update_region {
        if region.is_empty() || !region.fits_in(limits.width, limits.height) {
            return Err(PipelineError::InvalidWindow {
                window: usize::MAX,
                reason: format!("update region {:?} outside the screen", region),
            });
        }
    }

    if let Some(wb) = &desc.writeback {
        if !limits.writeback {
            return Err(PipelineError::InvalidWindow {
                window: usize::MAX,
                reason: "writeback requested on a display pipeline".into(),
            });
        }
        if wb.rect.is_empty() || !wb.rect.fits_in(limits.width, limits.height) || wb.format.is_yuv() {
            return Err(PipelineError::InvalidWindow {
                window: usize::MAX,
                reason: format!("unsupported writeback target {:?} {:?}", wb.rect, wb.format),
            });
        }
    }

    Ok(())
}

fn check_dst(index: usize, dst: &Rect, limits: &FrameLimits<'_>) -> Result<()> {
    if dst.is_empty() || !dst.fits_in(limits.width, limits.height) {
        return Err(PipelineError::InvalidWindow {
            window: index,
            reason: format!(
                "destination {:?} outside {}x{}",
                dst, limits.width, limits.height
            ),
        });
    }
    Ok(())
}

fn validate_buffer_window(index: usize, b: &BufferWindow, limits: &FrameLimits<'_>) -> Result<()> {
    check_dst(index, &b.dst, limits)?;
    if b.src.is_empty() || b.src.x < 0 || b.src.y < 0 {
        return Err(PipelineError::InvalidWindow {
            window: index,
            reason: format!("empty or negative source {:?}", b.src),
        });
    }
    match b.src.extent() {
        Some((w, h)) if w <= MAX_SOURCE_EXTENT && h <= MAX_SOURCE_EXTENT => {}
        _ => {
            return Err(PipelineError::InvalidWindow {
                window: index,
                reason: format!("source {:?} exceeds {}", b.src, MAX_SOURCE_EXTENT),
            })
        }
    }
    if b.handles.len() != b.format.plane_count() {
        return Err(PipelineError::InvalidWindow {
            window: index,
            reason: format!(
                "{:?} needs {} planes, got {}",
                b.format,
                b.format.plane_count(),
                b.handles.len()
            ),
        });
    }

    let Some(caps) = limits.channels.iter().find(|c| c.id == b.channel) else {
        return Err(PipelineError::InvalidWindow {
            window: index,
            reason: format!("channel {} does not exist", b.channel),
        });
    };
    if b.rotation != Rotation::None && !caps.rotation {
        return Err(unsupported(b.channel, "rotation"));
    }
    if b.compression != Compression::None && !caps.compression {
        return Err(unsupported(b.channel, "compression"));
    }
    if b.protected && !caps.protected {
        return Err(unsupported(b.channel, "protected content"));
    }
    if b.is_scaled() && !caps.scaling {
        return Err(unsupported(b.channel, "scaling"));
    }
    if b.format.is_yuv() && !caps.yuv {
        return Err(unsupported(b.channel, "YUV formats"));
    }
    Ok(())
}

fn unsupported(channel: ChannelId, feature: &'static str) -> PipelineError {
    PipelineError::UnsupportedFeature { channel, feature }
}

/// Ensure each mapped plane is large enough for the window's source extent
pub fn check_plane_sizes(index: usize, b: &BufferWindow, planes: &[BufferBinding]) -> Result<()> {
    // the source rect is an offset into the buffer, so the buffer must
    // cover the rect's far corner
    let required = b
        .src
        .extent()
        .and_then(|(w, h)| b.format.plane_sizes(w, h))
        .ok_or_else(|| PipelineError::InvalidWindow {
            window: index,
            reason: format!("source {:?} has no addressable size", b.src),
        })?;
    for (plane, need) in planes.iter().zip(required) {
        // compressed layouts are never larger than the linear one
        let need = if b.compression == Compression::None {
            need
        } else {
            need / 2
        };
        if plane.size() < need {
            return Err(PipelineError::ResourceMismatch {
                window: index,
                required: need,
                actual: plane.size(),
            });
        }
    }
    Ok(())
}

/// Payload of a queued request
#[derive(Debug)]
pub enum FramePayload {
    Windows {
        windows: Vec<WindowConfig>,
        /// Planes of each window, index-aligned with `windows`
        planes: Vec<Vec<BufferBinding>>,
        writeback: Option<(WritebackTarget, BufferBinding, FenceProducer)>,
        update_region: Option<Rect>,
    },
    Refresh(RefreshChange),
}

/// A validated frame owned by the commit worker
#[derive(Debug)]
pub struct FrameRequest {
    pub seq: u64,
    pub payload: FramePayload,
    pub full_redraw: bool,
    pub retire: FenceProducer,
    /// Keeps the pipeline out of hibernation until the frame completes
    pub(crate) hiber_block: Option<HiberBlock>,
}
