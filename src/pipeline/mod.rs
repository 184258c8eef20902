//! Output pipeline
//!
//! A [`Pipeline`] owns one commit worker thread fed by a FIFO. Submission
//! validates the frame, imports its buffers, and enqueues it; everything
//! that waits on hardware happens on the worker.
//!
//! ```no_run
//! use shadowcommit::buffer::BufferHandle;
//! use shadowcommit::config::DisplayConfig;
//! use shadowcommit::frame::{BufferWindow, FrameDesc, Rect, WindowConfig};
//! use shadowcommit::hw::sim::SimRig;
//! use shadowcommit::pipeline::Pipeline;
//!
//! let config = DisplayConfig::default();
//! let rig = SimRig::new();
//! let pipeline = Pipeline::new(&config.pipelines[0], &config, rig.collaborators(&config))?;
//!
//! let handle = rig.buffers.allocate(64 * 64 * 4);
//! let window = BufferWindow::simple(0, Rect::new(0, 0, 64, 64), handle);
//! let fences = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)]))?;
//! fences.retire.wait(std::time::Duration::from_secs(1));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod shadow;
mod stats;
mod worker;

#[cfg(test)]
mod tests;

pub use stats::{FrameOutcome, FrameRecord, PipelineStats};

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::arbiter::{ChannelId, ResourceArbiter};
use crate::bandwidth::{BandwidthController, BandwidthEstimator};
use crate::buffer::{self, BufferBinding, BufferProvider, DeviceId};
use crate::config::{
    ChannelCaps, DisplayConfig, HibernationConfig, PipelineConfig, PipelineKind, TimingConfig,
};
use crate::error::{PipelineError, PipelineId, Result};
use crate::fence::{Fence, FenceProducer, FenceRegistry, FenceWait};
use crate::frame::{
    self, FrameDesc, FrameLimits, FramePayload, FrameRequest, Rect, RefreshChange, SubmitFences,
};
use crate::hw::RegisterLayer;
use crate::power::{PowerController, PowerState};
use crate::recovery::{DiagnosticDump, RecoveryManager};
use crate::vsync::VsyncNotifier;
use shadow::ShadowGuard;
use stats::FrameHistory;
use worker::{CommitWorker, WorkerMsg};

/// Device id writeback buffers are mapped for, offset by pipeline id
pub const WRITEBACK_DEVICE_BASE: DeviceId = 0x100;

/// What the pipeline drives, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Display { refresh: RefreshChange },
    Writeback,
}

impl OutputKind {
    pub fn from_config(config: &PipelineConfig) -> Self {
        match config.kind {
            PipelineKind::Display => OutputKind::Display {
                refresh: RefreshChange {
                    fps: config.refresh_hz,
                    mode: 0,
                },
            },
            PipelineKind::Writeback => OutputKind::Writeback,
        }
    }

    pub fn is_writeback(&self) -> bool {
        matches!(self, OutputKind::Writeback)
    }
}

/// External collaborators a pipeline commits through
#[derive(Clone)]
pub struct Collaborators {
    pub hw: Arc<dyn RegisterLayer>,
    pub buffers: Arc<dyn BufferProvider>,
    pub estimator: Arc<dyn BandwidthEstimator>,
    pub bandwidth: Arc<dyn BandwidthController>,
    /// Shared by every pipeline of the controller
    pub arbiter: Arc<ResourceArbiter>,
    pub fences: Arc<FenceRegistry>,
    pub recovery: Arc<Mutex<RecoveryManager>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CursorState {
    pub(crate) window: usize,
    pub(crate) dst: Rect,
}

/// State shared between the submission side and the worker
pub(crate) struct PipelineShared {
    pub(crate) id: PipelineId,
    pub(crate) kind: OutputKind,
    pub(crate) screen: Rect,
    pub(crate) deps: Collaborators,
    pub(crate) notifier: Arc<VsyncNotifier>,
    pub(crate) power: Arc<PowerController>,
    pub(crate) shadow: ShadowGuard,
    pub(crate) queued: AtomicUsize,
    pub(crate) fatal: AtomicBool,
    pub(crate) timing: TimingConfig,
    pub(crate) hibernation: HibernationConfig,
    pub(crate) period: Mutex<Duration>,
    pub(crate) cursor: Mutex<Option<CursorState>>,
    pub(crate) stats: Mutex<PipelineStats>,
    pub(crate) history: Mutex<FrameHistory>,
}

impl PipelineShared {
    pub(crate) fn period(&self) -> Duration {
        *self.period.lock()
    }

    pub(crate) fn latch_timeout(&self) -> Duration {
        self.timing.latch_timeout(self.period())
    }

    pub(crate) fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    /// Wait for the armed latch to be confirmed. Returns the vsync sequence
    /// number last observed.
    pub(crate) fn wait_latch(&self, deadline: Instant) -> Result<u64> {
        let hw = &self.deps.hw;
        let mut seen = self.notifier.vsync_seq();
        loop {
            if hw.is_latch_confirmed(self.id) {
                return Ok(seen);
            }
            match self.notifier.wait_vsync_after(seen, deadline) {
                Some(seq) => seen = seq,
                None if hw.is_latch_confirmed(self.id) => return Ok(seen),
                None => return Err(PipelineError::LatchTimeout { pipeline: self.id }),
            }
        }
    }

    pub(crate) fn record(&self, record: FrameRecord) {
        self.history.lock().push(record);
    }

    /// Capture diagnostics and refuse further work until re-initialized
    pub(crate) fn mark_fatal(&self, error: &PipelineError) {
        let mut dump = DiagnosticDump::new(self.id, error.to_string(), self.power.state());
        dump.queued = self.queued.load(Ordering::SeqCst);
        dump.bound_channels = self.deps.arbiter.bound_channels(self.id).iter().collect();
        dump.registers = self.deps.hw.dump(self.id);
        dump.recent_frames = self.history.lock().recent(8);
        dump.stats = self.stats.lock().clone();
        self.deps.recovery.lock().record(dump);
        self.fatal.store(true, Ordering::Release);
    }
}

struct SubmitState {
    tx: Option<Sender<WorkerMsg>>,
    next_seq: u64,
    /// Set while blanking; submissions are answered without queuing
    draining: bool,
}

/// One independently scheduled output
pub struct Pipeline {
    shared: Arc<PipelineShared>,
    channels: Vec<ChannelCaps>,
    max_windows: usize,
    submit: Mutex<SubmitState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Power the pipeline on and start its commit worker
    pub fn new(config: &PipelineConfig, display: &DisplayConfig, deps: Collaborators) -> Result<Self> {
        let id = config.id;
        let kind = OutputKind::from_config(config);
        let period = config.frame_period();
        let notifier = VsyncNotifier::new();

        deps.hw.attach(id, Arc::clone(&notifier), period)?;
        if let Err(e) = deps.hw.set_power(id, PowerState::On) {
            deps.hw.detach(id);
            return Err(e);
        }

        let shared = Arc::new(PipelineShared {
            id,
            kind,
            screen: Rect::new(0, 0, config.width, config.height),
            deps,
            notifier,
            power: PowerController::new(PowerState::On),
            shadow: ShadowGuard::default(),
            queued: AtomicUsize::new(0),
            fatal: AtomicBool::new(false),
            timing: display.timing.clone(),
            hibernation: display.hibernation.clone(),
            period: Mutex::new(period),
            cursor: Mutex::new(None),
            stats: Mutex::new(PipelineStats::default()),
            history: Mutex::new(FrameHistory::new(display.general.history_len)),
        });

        let (tx, rx) = mpsc::channel();
        let refresh = RefreshChange {
            fps: config.refresh_hz,
            mode: 0,
        };
        let worker = CommitWorker::new(Arc::clone(&shared), rx, refresh);
        let handle = match thread::Builder::new()
            .name(format!("commit-worker-{}", id))
            .spawn(move || worker.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                shared.deps.hw.detach(id);
                return Err(PipelineError::Hardware(format!(
                    "failed to spawn commit worker: {}",
                    e
                )));
            }
        };

        info!(
            "🖥️ pipeline {} ({:?}) started: {}x{}, {} windows, {} Hz",
            id, config.kind, config.width, config.height, config.window_count, config.refresh_hz
        );

        Ok(Self {
            shared,
            channels: display.channels.clone(),
            max_windows: config.window_count,
            submit: Mutex::new(SubmitState {
                tx: Some(tx),
                next_seq: 0,
                draining: false,
            }),
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> PipelineId {
        self.shared.id
    }

    pub fn kind(&self) -> OutputKind {
        self.shared.kind
    }

    pub fn power_state(&self) -> PowerState {
        self.shared.power.state()
    }

    pub fn is_fatal(&self) -> bool {
        self.shared.is_fatal()
    }

    /// Requests waiting for the worker
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.stats.lock().clone()
    }

    /// Processed requests, oldest first
    pub fn history(&self) -> Vec<FrameRecord> {
        self.shared.history.lock().snapshot()
    }

    pub fn bound_channels(&self) -> Vec<ChannelId> {
        self.shared.deps.arbiter.bound_channels(self.id()).iter().collect()
    }

    fn limits(&self) -> FrameLimits<'_> {
        FrameLimits {
            max_windows: self.max_windows,
            width: self.shared.screen.w,
            height: self.shared.screen.h,
            channels: &self.channels,
            writeback: self.shared.kind.is_writeback(),
        }
    }

    /// Validate, import, and queue a frame.
    ///
    /// Validation and import errors are returned here and nothing is queued.
    /// While the pipeline is powered down the frame is dropped and already
    /// signaled fences are returned.
    pub fn submit(&self, desc: FrameDesc) -> Result<SubmitFences> {
        frame::validate(&desc, &self.limits())?;

        let mut submit = self.submit.lock();
        if self.shared.is_fatal() {
            return Err(PipelineError::PipelineFatal { pipeline: self.id() });
        }
        let block = self.shared.power.block();
        if !self.admit(&submit)? {
            return Ok(self.synthesize(desc.writeback.is_some()));
        }

        let FrameDesc {
            windows,
            writeback,
            update_region,
        } = desc;
        let deps = &self.shared.deps;

        // any early return drops what was imported so far
        let mut planes = Vec::with_capacity(windows.len());
        for (index, window) in windows.iter().enumerate() {
            match window.buffer() {
                Some(b) => {
                    let bound =
                        buffer::import_planes(&deps.buffers, &b.handles, b.channel, b.acquire.clone())?;
                    frame::check_plane_sizes(index, b, &bound)?;
                    planes.push(bound);
                }
                None => planes.push(Vec::new()),
            }
        }

        let mut readback = None;
        let writeback = match writeback {
            Some(target) => {
                let binding = BufferBinding::import(
                    &deps.buffers,
                    target.handle,
                    WRITEBACK_DEVICE_BASE + self.id(),
                    None,
                )?;
                let required = target
                    .format
                    .plane_sizes(target.rect.w, target.rect.h)
                    .and_then(|sizes| sizes.first().copied())
                    .ok_or_else(|| PipelineError::InvalidWindow {
                        window: usize::MAX,
                        reason: format!("writeback target {:?} has no addressable size", target.rect),
                    })?;
                if binding.size() < required {
                    return Err(PipelineError::ResourceMismatch {
                        window: usize::MAX,
                        required,
                        actual: binding.size(),
                    });
                }
                let (producer, fence) = deps.fences.create("readback");
                readback = Some(fence);
                Some((target, binding, producer))
            }
            None => None,
        };

        let (producer, retire) = deps.fences.create("retire");
        submit.next_seq += 1;
        let request = FrameRequest {
            seq: submit.next_seq,
            payload: FramePayload::Windows {
                windows,
                planes,
                writeback,
                update_region,
            },
            full_redraw: false,
            retire: producer,
            hiber_block: Some(block),
        };
        self.enqueue(&submit, request)?;

        Ok(SubmitFences { retire, readback })
    }

    /// Queue a refresh-rate change. Returns its retire fence.
    pub fn set_refresh_rate(&self, fps: u32, mode: u32) -> Result<Fence> {
        if fps == 0 || fps > 480 {
            return Err(PipelineError::InvalidRefreshRate(fps));
        }

        let mut submit = self.submit.lock();
        if self.shared.is_fatal() {
            return Err(PipelineError::PipelineFatal { pipeline: self.id() });
        }
        let block = self.shared.power.block();
        if !self.admit(&submit)? {
            return Ok(self.synthesize(false).retire);
        }

        let (producer, retire) = self.shared.deps.fences.create("retire");
        submit.next_seq += 1;
        let request = FrameRequest {
            seq: submit.next_seq,
            payload: FramePayload::Refresh(RefreshChange { fps, mode }),
            full_redraw: false,
            retire: producer,
            hiber_block: Some(block),
        };
        self.enqueue(&submit, request)?;
        Ok(retire)
    }

    /// Whether a submission may be queued. Leaves hibernation if needed.
    fn admit(&self, submit: &SubmitState) -> Result<bool> {
        if submit.draining {
            return Ok(false);
        }
        let hw = &self.shared.deps.hw;
        let id = self.id();
        if self
            .shared
            .power
            .exit_hiber(|| hw.set_power(id, PowerState::On))?
        {
            debug!("pipeline {} woke from hibernation for submission", id);
        }
        Ok(self.shared.power.state().accepts_frames())
    }

    fn synthesize(&self, readback: bool) -> SubmitFences {
        let fences = &self.shared.deps.fences;
        self.shared.stats.lock().synthesized += 1;
        debug!(
            "pipeline {} is {:?}, frame answered without commit",
            self.id(),
            self.power_state()
        );
        SubmitFences {
            retire: fences.signaled("retire", Ok(())),
            readback: readback.then(|| fences.signaled("readback", Ok(()))),
        }
    }

    fn enqueue(&self, submit: &SubmitState, request: FrameRequest) -> Result<()> {
        let gone = PipelineError::WorkerGone { pipeline: self.id() };
        let Some(tx) = submit.tx.as_ref() else {
            return Err(gone);
        };
        let seq = request.seq;
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        if tx.send(WorkerMsg::Frame(request)).is_err() {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(gone);
        }
        self.shared.stats.lock().submitted += 1;
        debug!("pipeline {} queued frame {}", self.id(), seq);
        Ok(())
    }

    /// Send a control message and wait for the worker to complete it
    fn round_trip(
        &self,
        label: &'static str,
        make: impl FnOnce(FenceProducer) -> WorkerMsg,
    ) -> Result<()> {
        let tx = self
            .submit
            .lock()
            .tx
            .clone()
            .ok_or(PipelineError::WorkerGone { pipeline: self.id() })?;
        let (producer, done) = self.shared.deps.fences.create(label);
        tx.send(make(producer))
            .map_err(|_| PipelineError::WorkerGone { pipeline: self.id() })?;
        match done.wait(self.shared.timing.flush_timeout()) {
            FenceWait::Ready(result) => result,
            FenceWait::TimedOut => Err(PipelineError::Hardware(format!(
                "pipeline {} {} timed out",
                self.id(),
                label
            ))),
        }
    }

    /// Block until every request queued so far has retired
    pub fn flush(&self) -> Result<()> {
        self.round_trip("flush", WorkerMsg::Flush)
    }

    /// Change power state.
    ///
    /// Going to `Off`, `DozeSuspend` or `Tui` stops admission immediately and
    /// drains the queue before returning.
    pub fn set_power(&self, target: PowerState) -> Result<()> {
        let id = self.id();
        let hw = &self.shared.deps.hw;
        match target {
            PowerState::Hiber => self.enter_hiber(),
            PowerState::On | PowerState::Doze => {
                let mut submit = self.submit.lock();
                self.shared
                    .power
                    .exit_hiber(|| hw.set_power(id, PowerState::On))?;
                hw.set_power(id, target)?;
                self.shared.power.force(target);
                submit.draining = false;
                Ok(())
            }
            PowerState::Off | PowerState::DozeSuspend | PowerState::Tui => {
                self.submit.lock().draining = true;
                let drained = self.round_trip("blank", |done| WorkerMsg::PowerDown { target, done });
                self.shared.power.force(target);
                if let Err(e) = &drained {
                    warn!("pipeline {} blank did not drain cleanly: {}", id, e);
                }
                drained
            }
        }
    }

    /// Enter hibernation now. Refused while anything is queued or in flight.
    pub fn enter_hiber(&self) -> Result<()> {
        let _submit = self.submit.lock();
        if self.shared.is_fatal() {
            return Err(PipelineError::PipelineFatal { pipeline: self.id() });
        }
        let hw = &self.shared.deps.hw;
        let id = self.id();
        self.shared.power.enter_hiber(self.queued(), || hw.set_power(id, PowerState::Hiber))
    }

    /// Move the latched cursor window without a full commit
    pub fn update_cursor_position(&self, x: i32, y: i32) -> Result<()> {
        let shared = &self.shared;
        let id = self.id();
        if shared.is_fatal() {
            return Err(PipelineError::PipelineFatal { pipeline: id });
        }
        let Some(cursor) = *shared.cursor.lock() else {
            return Err(PipelineError::InvalidWindow {
                window: usize::MAX,
                reason: "no cursor window on screen".into(),
            });
        };
        let dst = Rect::new(x, y, cursor.dst.w, cursor.dst.h);
        if !dst.fits_in(shared.screen.w, shared.screen.h) {
            return Err(PipelineError::InvalidWindow {
                window: cursor.window,
                reason: format!("cursor position {:?} outside the screen", dst),
            });
        }

        let _block = shared.power.block();
        shared
            .power
            .exit_hiber(|| shared.deps.hw.set_power(id, PowerState::On))?;
        let state = shared.power.state();
        if !state.accepts_frames() {
            return Err(PipelineError::PowerState { state });
        }

        if !shared.shadow.try_begin() {
            return Err(PipelineError::ShadowUpdateBusy { pipeline: id });
        }
        let hw = &shared.deps.hw;
        let result = hw
            .set_cursor_position(id, cursor.window, x, y)
            .and_then(|_| hw.arm_latch(id))
            .and_then(|_| shared.wait_latch(Instant::now() + shared.latch_timeout()));
        shared.shadow.end();

        match result {
            Ok(_) => {
                *shared.cursor.lock() = Some(CursorState {
                    window: cursor.window,
                    dst,
                });
                shared.stats.lock().cursor_updates += 1;
                Ok(())
            }
            Err(e) => {
                if e.is_fatal() {
                    shared.stats.lock().latch_timeouts += 1;
                    shared.mark_fatal(&e);
                }
                Err(e)
            }
        }
    }

    /// Time of the most recent vsync
    pub fn vsync_timestamp(&self) -> Option<Instant> {
        self.shared.notifier.last_vsync()
    }

    pub fn vsync_seq(&self) -> u64 {
        self.shared.notifier.vsync_seq()
    }

    /// Block until the next vsync. Returns its sequence number.
    pub fn wait_for_vsync(&self, timeout: Duration) -> Option<u64> {
        self.shared.notifier.wait_next_vsync(timeout)
    }

    /// Reset the hardware, drop all bindings, and leave the fatal state
    pub fn reinit(&self) -> Result<()> {
        self.round_trip("reinit", WorkerMsg::Reinit)
    }

    /// Stop the worker after it drains its queue. Idempotent.
    pub fn shutdown(&self) {
        let tx = self.submit.lock().tx.take();
        if tx.is_none() {
            return;
        }
        drop(tx);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("commit worker {} panicked", self.id());
            }
        }
        self.shared.deps.hw.detach(self.id());
        info!("pipeline {} shut down", self.id());
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("power", &self.power_state())
            .field("queued", &self.queued())
            .field("fatal", &self.is_fatal())
            .finish()
    }
}
