//! Commit worker
//!
//! Consumes one pipeline's FIFO. For each frame: wait on acquire fences,
//! bind channels (demoting windows that cannot get one), program the shadow
//! registers, raise bandwidth, arm the latch, wait for confirmation, retire,
//! and release the buffers of the frame that was on screen before.

use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{CursorState, FrameOutcome, FrameRecord, OutputKind, PipelineShared};
use crate::arbiter::ChannelClaim;
use crate::bandwidth::{BandwidthGate, PanelTiming, WindowLoad};
use crate::buffer::{BufferBinding, StaleBuffers};
use crate::error::{PipelineError, Result};
use crate::fence::{FenceProducer, FenceWait};
use crate::frame::{
    BlendMode, Compression, FramePayload, FrameRequest, Rect, RefreshChange, Rotation,
    WindowConfig, WritebackTarget,
};
use crate::hw::{FrameRegs, LayerSource, WindowRegs, WritebackRegs};
use crate::power::PowerState;

pub(crate) enum WorkerMsg {
    Frame(FrameRequest),
    /// Signaled once everything queued before it has retired
    Flush(FenceProducer),
    PowerDown {
        target: PowerState,
        done: FenceProducer,
    },
    Reinit(FenceProducer),
}

/// A window-update request being committed
struct FrameWork {
    seq: u64,
    windows: Vec<WindowConfig>,
    planes: Vec<Vec<BufferBinding>>,
    writeback: Option<(WritebackTarget, BufferBinding, FenceProducer)>,
    update_region: Option<Rect>,
    full_redraw: bool,
    retire: FenceProducer,
    started: Instant,
    /// Windows demoted to disabled, in demotion order
    disabled: Vec<usize>,
    /// Planes of demoted windows, released after retire
    discarded: Vec<BufferBinding>,
    enabled_before: usize,
    last_error: Option<PipelineError>,
}

impl FrameWork {
    fn demote(&mut self, window: usize, reason: PipelineError) {
        self.windows[window] = WindowConfig::Disabled;
        self.discarded.append(&mut self.planes[window]);
        self.disabled.push(window);
        self.last_error = Some(reason);
    }

    /// Every window that started enabled has been demoted
    fn collapsed(&self) -> bool {
        self.enabled_before > 0 && self.windows.iter().all(|w| !w.is_enabled())
    }

    fn claims(&self) -> Vec<ChannelClaim> {
        self.windows
            .iter()
            .enumerate()
            .filter_map(|(window, w)| w.channel().map(|channel| ChannelClaim { window, channel }))
            .collect()
    }

    fn record(&self, outcome: FrameOutcome) -> FrameRecord {
        FrameRecord {
            seq: self.seq,
            outcome,
            disabled_windows: self.disabled.clone(),
            full_redraw: self.full_redraw,
            update_region: self.update_region,
            commit_time: self.started.elapsed(),
        }
    }
}

pub(crate) struct CommitWorker {
    shared: Arc<PipelineShared>,
    rx: Receiver<WorkerMsg>,
    gate: BandwidthGate,
    /// Buffers of the latched frame; released when the next one latches
    on_screen: StaleBuffers,
    refresh: RefreshChange,
    /// Force the next window update to redraw the whole screen
    redraw_next: bool,
}

impl CommitWorker {
    pub(crate) fn new(shared: Arc<PipelineShared>, rx: Receiver<WorkerMsg>, refresh: RefreshChange) -> Self {
        let gate = BandwidthGate::new(
            shared.id,
            Arc::clone(&shared.deps.estimator),
            Arc::clone(&shared.deps.bandwidth),
        );
        Self {
            shared,
            rx,
            gate,
            on_screen: StaleBuffers::default(),
            refresh,
            redraw_next: false,
        }
    }

    pub(crate) fn run(mut self) {
        debug!("commit worker {} running", self.shared.id);
        while let Some(msg) = self.next_message() {
            match msg {
                WorkerMsg::Frame(request) => {
                    self.shared.queued.fetch_sub(1, Ordering::SeqCst);
                    self.process(request);
                }
                WorkerMsg::Flush(done) => done.signal(Ok(())),
                WorkerMsg::PowerDown { target, done } => {
                    let result = self.power_down(target);
                    done.signal(result);
                }
                WorkerMsg::Reinit(done) => {
                    let result = self.reinit();
                    done.signal(result);
                }
            }
        }
        self.teardown();
    }

    fn next_message(&mut self) -> Option<WorkerMsg> {
        loop {
            let idle_hiber = self.shared.hibernation.enabled
                && !self.shared.is_fatal()
                && self.shared.power.state() == PowerState::On;
            if !idle_hiber {
                return self.rx.recv().ok();
            }
            match self.rx.recv_timeout(self.shared.hibernation.idle_timeout()) {
                Ok(msg) => return Some(msg),
                Err(RecvTimeoutError::Timeout) => self.try_auto_hiber(),
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn try_auto_hiber(&self) {
        let id = self.shared.id;
        let hw = &self.shared.deps.hw;
        let queued = self.shared.queued.load(Ordering::SeqCst);
        match self
            .shared
            .power
            .enter_hiber(queued, || hw.set_power(id, PowerState::Hiber))
        {
            Ok(()) => info!("💤 pipeline {} hibernating after idle", id),
            Err(e) => debug!("pipeline {} stays awake: {}", id, e),
        }
    }

    fn process(&mut self, request: FrameRequest) {
        let started = Instant::now();
        let FrameRequest {
            seq,
            payload,
            full_redraw,
            retire,
            hiber_block,
        } = request;

        if self.shared.is_fatal() {
            self.retire_fatal(seq, payload, retire, started);
        } else {
            match payload {
                FramePayload::Refresh(change) => self.apply_refresh(seq, change, retire, started),
                FramePayload::Windows {
                    windows,
                    planes,
                    writeback,
                    update_region,
                } => {
                    let enabled_before = windows.iter().filter(|w| w.is_enabled()).count();
                    let full_redraw = full_redraw || std::mem::take(&mut self.redraw_next);
                    self.commit(FrameWork {
                        seq,
                        windows,
                        planes,
                        writeback,
                        update_region,
                        full_redraw,
                        retire,
                        started,
                        disabled: Vec::new(),
                        discarded: Vec::new(),
                        enabled_before,
                        last_error: None,
                    });
                }
            }
        }

        // hibernation may resume once the frame is fully retired
        drop(hiber_block);
    }

    fn retire_fatal(&mut self, seq: u64, payload: FramePayload, retire: FenceProducer, started: Instant) {
        let error = PipelineError::PipelineFatal {
            pipeline: self.shared.id,
        };
        if let FramePayload::Windows {
            writeback: Some((_, _, readback)),
            ..
        } = payload
        {
            readback.signal(Err(error.clone()));
        }
        retire.signal(Err(error.clone()));
        self.shared.stats.lock().fatal_retired += 1;
        self.shared.record(FrameRecord {
            seq,
            outcome: FrameOutcome::Fatal(error.to_string()),
            disabled_windows: Vec::new(),
            full_redraw: false,
            update_region: None,
            commit_time: started.elapsed(),
        });
    }

    fn apply_refresh(&mut self, seq: u64, change: RefreshChange, retire: FenceProducer, started: Instant) {
        let id = self.shared.id;
        let outcome = match self.shared.deps.hw.set_refresh_rate(id, change) {
            Ok(()) => {
                let period = Duration::from_micros(1_000_000 / change.fps.max(1) as u64);
                *self.shared.period.lock() = period;
                self.refresh = change;
                // the new timing is in effect from the next boundary
                self.shared.notifier.wait_next_vsync(period * 2);
                self.shared.stats.lock().refresh_changes += 1;
                info!("pipeline {} refresh -> {} Hz (mode {})", id, change.fps, change.mode);
                retire.signal(Ok(()));
                FrameOutcome::Refresh
            }
            Err(e) => {
                warn!("pipeline {} refresh change failed: {}", id, e);
                self.shared.stats.lock().aborted += 1;
                let outcome = FrameOutcome::Aborted(e.to_string());
                retire.signal(Err(e));
                outcome
            }
        };
        self.shared.record(FrameRecord {
            seq,
            outcome,
            disabled_windows: Vec::new(),
            full_redraw: false,
            update_region: None,
            commit_time: started.elapsed(),
        });
    }

    fn commit(&mut self, mut work: FrameWork) {
        let shared = Arc::clone(&self.shared);
        let id = shared.id;

        // WaitingAcquire
        let mut acquire_timed_out = false;
        for window in 0..work.windows.len() {
            let Some(fence) = work.planes[window].first().and_then(|p| p.acquire()).cloned() else {
                continue;
            };
            match fence.wait(shared.timing.acquire_timeout()) {
                FenceWait::Ready(Ok(())) => {}
                FenceWait::Ready(Err(e)) => {
                    warn!("pipeline {} frame {} window {} acquire failed: {}", id, work.seq, window, e);
                    work.demote(window, e);
                }
                FenceWait::TimedOut => {
                    warn!("pipeline {} frame {} window {} acquire timed out", id, work.seq, window);
                    shared.stats.lock().acquire_timeouts += 1;
                    acquire_timed_out = true;
                    work.demote(window, PipelineError::AcquireTimeout { window });
                }
            }
        }
        if acquire_timed_out {
            self.redraw_next = true;
            shared.notifier.wait_next_vsync(shared.period() * 2);
        }

        // Binding
        let bound = loop {
            if work.collapsed() {
                break false;
            }
            match shared.deps.arbiter.bind(id, &work.claims()) {
                Ok(_) => break true,
                Err(PipelineError::ResourceConflict { channel, owner }) => {
                    shared.stats.lock().conflicts += 1;
                    let Some(window) = work.windows.iter().position(|w| w.channel() == Some(channel)) else {
                        break false;
                    };
                    warn!(
                        "pipeline {} frame {} window {} demoted: channel {} held by pipeline {}",
                        id, work.seq, window, channel, owner
                    );
                    work.demote(window, PipelineError::ResourceConflict { channel, owner });
                }
                Err(e) => return self.abort(work, e),
            }
        };
        if !bound {
            return self.finish_noop(work);
        }

        // Committing
        let timing = PanelTiming {
            width: shared.screen.w,
            height: shared.screen.h,
            fps: self.refresh.fps,
        };
        let plan = match self.gate.estimate(&window_loads(&work), &timing) {
            Ok(plan) => plan,
            Err(e) => {
                shared.deps.arbiter.rollback(id);
                shared.stats.lock().estimator_failures += 1;
                return self.fail(work, e);
            }
        };
        let regs = build_regs(&work, shared.screen);
        self.gate.before_commit(plan);

        if !shared.shadow.begin(Instant::now() + shared.latch_timeout()) {
            shared.deps.arbiter.rollback(id);
            shared.stats.lock().latch_timeouts += 1;
            return self.fail(work, PipelineError::LatchTimeout { pipeline: id });
        }
        let frame_done_seq = shared.notifier.frame_done_seq();
        let armed = shared
            .deps
            .hw
            .program(id, &regs)
            .and_then(|_| shared.deps.hw.arm_latch(id));
        if let Err(e) = armed {
            shared.shadow.end();
            shared.deps.arbiter.rollback(id);
            self.gate.revert();
            return self.abort(work, e);
        }

        // WaitingLatch
        let latched = shared.wait_latch(Instant::now() + shared.latch_timeout());
        shared.shadow.end();
        let seen = match latched {
            Ok(seen) => seen,
            Err(e) => {
                shared.stats.lock().latch_timeouts += 1;
                return self.fail(work, e);
            }
        };
        let freed = shared.deps.arbiter.commit_latched(id);
        self.gate.after_latch();

        // WaitingFrameDone
        match shared.kind {
            OutputKind::Writeback => {
                if work.writeback.is_some() {
                    let deadline = Instant::now() + shared.timing.frame_done_timeout();
                    if shared.notifier.wait_frame_done_after(frame_done_seq, deadline).is_none() {
                        shared.stats.lock().frame_done_timeouts += 1;
                        return self.fail(work, PipelineError::FrameDoneTimeout { pipeline: id });
                    }
                }
            }
            OutputKind::Display { .. } => {
                let deadline = Instant::now() + shared.period() * 2;
                if shared.notifier.wait_vsync_after(seen, deadline).is_none() {
                    debug!("pipeline {} frame {} retiring without a trailing vsync", id, work.seq);
                }
            }
        }

        *shared.cursor.lock() = work.windows.iter().enumerate().find_map(|(window, w)| match w {
            WindowConfig::Cursor(b) => Some(CursorState { window, dst: b.dst }),
            _ => None,
        });
        {
            let mut stats = shared.stats.lock();
            stats.committed += 1;
            stats.demoted_windows += work.disabled.len() as u64;
        }
        shared.record(work.record(FrameOutcome::Committed));
        debug!(
            "pipeline {} frame {} latched (disabled {:?}, freed {:?})",
            id, work.seq, work.disabled, freed
        );

        let FrameWork {
            planes,
            writeback,
            retire,
            discarded,
            ..
        } = work;
        if let Some((_, _, readback)) = &writeback {
            debug!("pipeline {} readback fence #{} ready", id, readback.seqno());
        }
        let written = writeback.map(|(_, binding, readback)| {
            readback.signal(Ok(()));
            binding
        });
        retire.signal(Ok(()));

        // the previous frame is no longer scanned out
        self.on_screen.release_all();
        self.on_screen.absorb(planes.into_iter().flatten());
        drop(written);
        drop(discarded);
    }

    /// Every enabled window was demoted: retire without touching hardware.
    /// The previous frame and its buffers stay on screen.
    fn finish_noop(&mut self, work: FrameWork) {
        let shared = &self.shared;
        {
            let mut stats = shared.stats.lock();
            stats.noop += 1;
            stats.demoted_windows += work.disabled.len() as u64;
        }
        shared.record(work.record(FrameOutcome::NoOp));
        debug!(
            "pipeline {} frame {} collapsed to a no-op (disabled {:?})",
            shared.id, work.seq, work.disabled
        );

        let reason = work.last_error.clone().unwrap_or(PipelineError::Abandoned);
        if let Some((_, _, readback)) = work.writeback {
            readback.signal(Err(reason));
        }
        work.retire.signal(Ok(()));
    }

    /// Programming failed; the previous frame stays latched
    fn abort(&mut self, work: FrameWork, error: PipelineError) {
        warn!("pipeline {} frame {} aborted: {}", self.shared.id, work.seq, error);
        self.shared.stats.lock().aborted += 1;
        self.shared
            .record(work.record(FrameOutcome::Aborted(error.to_string())));
        if let Some((_, _, readback)) = work.writeback {
            readback.signal(Err(error.clone()));
        }
        work.retire.signal(Err(error));
    }

    /// The hardware is wedged. The frame's buffers are kept mapped until
    /// re-initialization since the hardware may still fetch them.
    fn fail(&mut self, work: FrameWork, error: PipelineError) {
        let shared = Arc::clone(&self.shared);
        error!("pipeline {} frame {} failed: {}", shared.id, work.seq, error);
        shared.stats.lock().fatal_retired += 1;
        shared.record(work.record(FrameOutcome::Fatal(error.to_string())));
        shared.mark_fatal(&error);

        let FrameWork {
            planes,
            writeback,
            retire,
            discarded,
            ..
        } = work;
        if let Some((_, binding, readback)) = writeback {
            readback.signal(Err(error.clone()));
            self.on_screen.absorb(Some(binding));
        }
        retire.signal(Err(error));
        self.on_screen.absorb(planes.into_iter().flatten());
        drop(discarded);
    }

    fn power_down(&mut self, target: PowerState) -> Result<()> {
        let id = self.shared.id;
        self.shared.deps.hw.set_power(id, target)?;
        if matches!(target, PowerState::Off | PowerState::Tui) {
            let released = self.shared.deps.arbiter.unbind(id);
            let buffers = self.on_screen.len();
            self.on_screen.release_all();
            self.gate.release();
            *self.shared.cursor.lock() = None;
            self.redraw_next = true;
            info!(
                "pipeline {} blanked to {:?}: released channels {:?} and {} buffers",
                id, target, released, buffers
            );
        } else {
            info!("pipeline {} entering {:?}", id, target);
        }
        Ok(())
    }

    fn reinit(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let id = shared.id;
        shared.deps.hw.reset(id)?;
        let state = shared.power.state();
        if state.is_powered() {
            shared.deps.hw.set_power(id, state)?;
        }
        shared.deps.arbiter.unbind(id);
        self.on_screen.release_all();
        self.gate.release();
        shared.shadow.end();
        *shared.cursor.lock() = None;
        self.redraw_next = true;
        shared.fatal.store(false, Ordering::Release);
        shared.stats.lock().reinits += 1;
        shared.deps.recovery.lock().note_reinit(id);
        Ok(())
    }

    fn teardown(&mut self) {
        let id = self.shared.id;
        if let Err(e) = self.shared.deps.hw.set_power(id, PowerState::Off) {
            debug!("pipeline {} power off on exit failed: {}", id, e);
        }
        self.shared.deps.arbiter.unbind(id);
        self.on_screen.release_all();
        self.gate.release();
        debug!("commit worker {} exiting", id);
    }
}

fn window_loads(work: &FrameWork) -> Vec<WindowLoad> {
    let mut loads: Vec<WindowLoad> = work
        .windows
        .iter()
        .filter_map(|w| w.buffer())
        .map(|b| WindowLoad {
            channel: Some(b.channel),
            src: b.src,
            dst: b.dst,
            bits_per_pixel: b.format.bits_per_pixel(),
            compressed: b.compression != Compression::None,
            rotated: b.rotation != Rotation::None,
            write: false,
        })
        .collect();
    if let Some((target, _, _)) = &work.writeback {
        loads.push(WindowLoad {
            channel: None,
            src: target.rect,
            dst: target.rect,
            bits_per_pixel: target.format.bits_per_pixel(),
            compressed: false,
            rotated: false,
            write: true,
        });
    }
    loads
}

fn build_regs(work: &FrameWork, screen: Rect) -> FrameRegs {
    let windows = work
        .windows
        .iter()
        .enumerate()
        .filter_map(|(window, w)| match w {
            WindowConfig::Disabled => None,
            WindowConfig::Color { color, dst } => Some(WindowRegs {
                window,
                source: LayerSource::Color(*color),
                src: Rect::new(0, 0, dst.w, dst.h),
                dst: *dst,
                blend: BlendMode::Premultiplied,
                plane_alpha: 0xff,
            }),
            WindowConfig::Buffer(b) | WindowConfig::Cursor(b) => Some(WindowRegs {
                window,
                source: LayerSource::Dma {
                    channel: b.channel,
                    addrs: work.planes[window].iter().map(|p| p.dma_addr()).collect(),
                    format: b.format,
                    rotation: b.rotation,
                    compression: b.compression,
                    protected: b.protected,
                    cursor: matches!(w, WindowConfig::Cursor(_)),
                },
                src: b.src,
                dst: b.dst,
                blend: b.blend,
                plane_alpha: b.plane_alpha,
            }),
        })
        .collect();

    let update_region = if work.full_redraw {
        screen
    } else {
        work.update_region.unwrap_or(screen)
    };

    FrameRegs {
        windows,
        update_region,
        writeback: work.writeback.as_ref().map(|(target, binding, _)| WritebackRegs {
            addr: binding.dma_addr(),
            rect: target.rect,
            format: target.format,
        }),
    }
}
