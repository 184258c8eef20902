//! Simulated display controller
//!
//! Stands in for the register layer, the buffer allocator, and the bus
//! governor. Each attached pipeline gets a ticker thread that latches armed
//! shadow registers and raises vsync (plus frame-done for writeback
//! frames) once per refresh period. Faults can be injected per pipeline.

use log::{debug, info, trace};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{FrameRegs, LayerSource, RegisterDump, RegisterLayer};
use crate::arbiter::ResourceArbiter;
use crate::bandwidth::{BandwidthController, BandwidthPlan, LinearEstimator, Phase};
use crate::buffer::{BufferHandle, BufferProvider, DeviceId, DeviceMapping};
use crate::config::DisplayConfig;
use crate::error::{PipelineError, PipelineId, Result};
use crate::fence::FenceRegistry;
use crate::frame::RefreshChange;
use crate::pipeline::Collaborators;
use crate::power::PowerState;
use crate::recovery::{DumpConfig, RecoveryManager};
use crate::vsync::VsyncNotifier;

#[derive(Debug, Default)]
struct SimRegs {
    power: PowerState,
    shadow: Option<FrameRegs>,
    active: Option<FrameRegs>,
    arm_gen: u64,
    latched_gen: u64,
    stuck_latch: bool,
    stuck_frame_done: bool,
    fail_program: bool,
    fail_arm: bool,
    programs: u64,
    latches: u64,
    resets: u64,
    refresh: Option<RefreshChange>,
}

struct SimPipe {
    regs: Mutex<SimRegs>,
    notifier: Arc<VsyncNotifier>,
    period: Mutex<Duration>,
    stop: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SimPipe {
    fn tick(&self) {
        let frame_done = {
            let mut regs = self.regs.lock();
            if matches!(regs.power, PowerState::Off | PowerState::Hiber) {
                return;
            }
            let mut latched = false;
            if regs.arm_gen != regs.latched_gen && !regs.stuck_latch {
                regs.active = regs.shadow.clone();
                regs.latched_gen = regs.arm_gen;
                regs.latches += 1;
                latched = true;
            }
            latched
                && !regs.stuck_frame_done
                && regs.active.as_ref().map_or(false, |a| a.writeback.is_some())
        };
        self.notifier.vsync();
        if frame_done {
            self.notifier.frame_done();
        }
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.ticker.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Simulated register layer with one vsync ticker per attached pipeline
#[derive(Default)]
pub struct SimHardware {
    pipes: Mutex<HashMap<PipelineId, Arc<SimPipe>>>,
}

impl SimHardware {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn pipe(&self, pipeline: PipelineId) -> Result<Arc<SimPipe>> {
        self.pipes
            .lock()
            .get(&pipeline)
            .cloned()
            .ok_or_else(|| PipelineError::Hardware(format!("pipeline {} not attached", pipeline)))
    }

    fn with_regs<T>(&self, pipeline: PipelineId, f: impl FnOnce(&mut SimRegs) -> T) -> Option<T> {
        let pipe = self.pipe(pipeline).ok()?;
        let mut regs = pipe.regs.lock();
        Some(f(&mut regs))
    }

    /// Never latch armed registers until reset
    pub fn stick_latch(&self, pipeline: PipelineId, stuck: bool) {
        self.with_regs(pipeline, |r| r.stuck_latch = stuck);
    }

    /// Never raise frame-done until reset
    pub fn stick_frame_done(&self, pipeline: PipelineId, stuck: bool) {
        self.with_regs(pipeline, |r| r.stuck_frame_done = stuck);
    }

    /// Reject register programming until cleared
    pub fn fail_program(&self, pipeline: PipelineId, fail: bool) {
        self.with_regs(pipeline, |r| r.fail_program = fail);
    }

    /// Reject latch arming until cleared
    pub fn fail_arm(&self, pipeline: PipelineId, fail: bool) {
        self.with_regs(pipeline, |r| r.fail_arm = fail);
    }

    /// Registers currently scanned out
    pub fn active(&self, pipeline: PipelineId) -> Option<FrameRegs> {
        self.with_regs(pipeline, |r| r.active.clone()).flatten()
    }

    pub fn latch_count(&self, pipeline: PipelineId) -> u64 {
        self.with_regs(pipeline, |r| r.latches).unwrap_or(0)
    }

    pub fn program_count(&self, pipeline: PipelineId) -> u64 {
        self.with_regs(pipeline, |r| r.programs).unwrap_or(0)
    }

    pub fn reset_count(&self, pipeline: PipelineId) -> u64 {
        self.with_regs(pipeline, |r| r.resets).unwrap_or(0)
    }

    pub fn power_state(&self, pipeline: PipelineId) -> Option<PowerState> {
        self.with_regs(pipeline, |r| r.power)
    }

    pub fn refresh(&self, pipeline: PipelineId) -> Option<RefreshChange> {
        self.with_regs(pipeline, |r| r.refresh).flatten()
    }
}

impl RegisterLayer for SimHardware {
    fn attach(&self, pipeline: PipelineId, notifier: Arc<VsyncNotifier>, period: Duration) -> Result<()> {
        let pipe = Arc::new(SimPipe {
            regs: Mutex::new(SimRegs::default()),
            notifier,
            period: Mutex::new(period),
            stop: AtomicBool::new(false),
            ticker: Mutex::new(None),
        });

        let ticking = Arc::clone(&pipe);
        let handle = thread::Builder::new()
            .name(format!("vsync-sim-{}", pipeline))
            .spawn(move || {
                while !ticking.stop.load(Ordering::Acquire) {
                    let period = *ticking.period.lock();
                    thread::sleep(period);
                    ticking.tick();
                }
            })
            .map_err(|e| PipelineError::Hardware(format!("ticker spawn failed: {}", e)))?;
        *pipe.ticker.lock() = Some(handle);

        if let Some(old) = self.pipes.lock().insert(pipeline, pipe) {
            old.stop();
        }
        debug!("sim: pipeline {} attached, period {:?}", pipeline, period);
        Ok(())
    }

    fn detach(&self, pipeline: PipelineId) {
        let pipe = self.pipes.lock().remove(&pipeline);
        if let Some(pipe) = pipe {
            pipe.stop();
            debug!("sim: pipeline {} detached", pipeline);
        }
    }

    fn program(&self, pipeline: PipelineId, regs: &FrameRegs) -> Result<()> {
        let pipe = self.pipe(pipeline)?;
        let mut sim = pipe.regs.lock();
        if sim.fail_program {
            return Err(PipelineError::Hardware("register write rejected".into()));
        }
        sim.shadow = Some(regs.clone());
        sim.programs += 1;
        trace!("sim: pipeline {} programmed {} windows", pipeline, regs.windows.len());
        Ok(())
    }

    fn arm_latch(&self, pipeline: PipelineId) -> Result<()> {
        let pipe = self.pipe(pipeline)?;
        let mut sim = pipe.regs.lock();
        if sim.power == PowerState::Off {
            return Err(PipelineError::PowerState {
                state: PowerState::Off,
            });
        }
        if sim.fail_arm {
            return Err(PipelineError::Hardware("latch arm rejected".into()));
        }
        sim.arm_gen += 1;
        Ok(())
    }

    fn is_latch_confirmed(&self, pipeline: PipelineId) -> bool {
        self.with_regs(pipeline, |r| r.arm_gen == r.latched_gen)
            .unwrap_or(false)
    }

    fn set_cursor_position(&self, pipeline: PipelineId, window: usize, x: i32, y: i32) -> Result<()> {
        let pipe = self.pipe(pipeline)?;
        let mut sim = pipe.regs.lock();
        let shadow = match sim.shadow.as_mut() {
            Some(shadow) => shadow,
            None => return Err(PipelineError::Hardware("no programmed frame".into())),
        };
        let Some(regs) = shadow.windows.iter_mut().find(|w| w.window == window) else {
            return Err(PipelineError::Hardware(format!("window {} not enabled", window)));
        };
        regs.dst.x = x;
        regs.dst.y = y;
        Ok(())
    }

    fn set_refresh_rate(&self, pipeline: PipelineId, change: RefreshChange) -> Result<()> {
        let pipe = self.pipe(pipeline)?;
        pipe.regs.lock().refresh = Some(change);
        *pipe.period.lock() = Duration::from_micros(1_000_000 / change.fps.max(1) as u64);
        Ok(())
    }

    fn set_power(&self, pipeline: PipelineId, state: PowerState) -> Result<()> {
        let pipe = self.pipe(pipeline)?;
        let mut sim = pipe.regs.lock();
        if state == PowerState::Off {
            sim.active = None;
            sim.shadow = None;
            sim.latched_gen = sim.arm_gen;
        }
        sim.power = state;
        Ok(())
    }

    fn reset(&self, pipeline: PipelineId) -> Result<()> {
        let pipe = self.pipe(pipeline)?;
        let mut sim = pipe.regs.lock();
        sim.stuck_latch = false;
        sim.stuck_frame_done = false;
        sim.shadow = None;
        sim.active = None;
        sim.latched_gen = sim.arm_gen;
        sim.resets += 1;
        info!("sim: pipeline {} reset", pipeline);
        Ok(())
    }

    fn dump(&self, pipeline: PipelineId) -> RegisterDump {
        let mut registers = BTreeMap::new();
        self.with_regs(pipeline, |r| {
            registers.insert("arm_gen".to_string(), r.arm_gen);
            registers.insert("latched_gen".to_string(), r.latched_gen);
            registers.insert("programs".to_string(), r.programs);
            registers.insert("latches".to_string(), r.latches);
            registers.insert("stuck_latch".to_string(), r.stuck_latch as u64);
            if let Some(active) = &r.active {
                for w in &active.windows {
                    if let LayerSource::Dma { channel, addrs, .. } = &w.source {
                        registers.insert(format!("win{}.channel", w.window), *channel as u64);
                        registers.insert(
                            format!("win{}.addr", w.window),
                            addrs.first().copied().unwrap_or(0),
                        );
                    }
                }
            }
        });
        RegisterDump {
            pipeline,
            registers,
        }
    }
}

impl Drop for SimHardware {
    fn drop(&mut self) {
        for (_, pipe) in self.pipes.lock().drain() {
            pipe.stop();
        }
    }
}

#[derive(Debug, Default)]
struct SimBuffers {
    sizes: HashMap<BufferHandle, u64>,
    mapped: HashMap<(BufferHandle, DeviceId), u32>,
    failing: HashSet<BufferHandle>,
    next_handle: u64,
    next_dva: u64,
    imports: u64,
    unmaps: u64,
}

/// Allocator stand-in with mapping accounting
#[derive(Debug, Default)]
pub struct SimBufferProvider {
    inner: Mutex<SimBuffers>,
}

impl SimBufferProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a buffer of `size` bytes
    pub fn allocate(&self, size: u64) -> BufferHandle {
        let mut inner = self.inner.lock();
        inner.next_handle += 1;
        let handle = BufferHandle(inner.next_handle);
        inner.sizes.insert(handle, size);
        handle
    }

    /// Make every future import of `handle` fail
    pub fn fail_import(&self, handle: BufferHandle) {
        self.inner.lock().failing.insert(handle);
    }

    pub fn is_mapped(&self, handle: BufferHandle) -> bool {
        self.inner
            .lock()
            .mapped
            .iter()
            .any(|((h, _), count)| *h == handle && *count > 0)
    }

    /// Number of mappings not yet undone
    pub fn live_mappings(&self) -> u64 {
        self.inner.lock().mapped.values().map(|&c| c as u64).sum()
    }

    pub fn imports(&self) -> u64 {
        self.inner.lock().imports
    }

    pub fn unmaps(&self) -> u64 {
        self.inner.lock().unmaps
    }
}

impl BufferProvider for SimBufferProvider {
    fn import(&self, handle: BufferHandle, device: DeviceId) -> Result<DeviceMapping> {
        let mut inner = self.inner.lock();
        if inner.failing.contains(&handle) {
            return Err(PipelineError::ImportFailed {
                handle,
                reason: "injected failure".into(),
            });
        }
        let Some(&size) = inner.sizes.get(&handle) else {
            return Err(PipelineError::ImportFailed {
                handle,
                reason: "unknown handle".into(),
            });
        };
        let dma_addr = 0x8000_0000 + inner.next_dva;
        inner.next_dva += size.next_multiple_of(4096);
        inner.imports += 1;
        *inner.mapped.entry((handle, device)).or_insert(0) += 1;
        Ok(DeviceMapping {
            handle,
            device,
            dma_addr,
            size,
        })
    }

    fn unmap(&self, mapping: &DeviceMapping) {
        let mut inner = self.inner.lock();
        inner.unmaps += 1;
        let key = (mapping.handle, mapping.device);
        if let Some(count) = inner.mapped.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                inner.mapped.remove(&key);
            }
        }
    }
}

/// One request seen by [`RecordingBandwidth`]
#[derive(Debug, Clone, PartialEq)]
pub struct BandwidthEvent {
    pub pipeline: PipelineId,
    pub plan: BandwidthPlan,
    pub phase: Phase,
}

/// Bus governor stand-in that records every request
#[derive(Debug, Default)]
pub struct RecordingBandwidth {
    events: Mutex<Vec<BandwidthEvent>>,
    failing: AtomicBool,
    applied: AtomicU64,
}

impl RecordingBandwidth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject every request from now on
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<BandwidthEvent> {
        self.events.lock().clone()
    }

    pub fn events_for(&self, pipeline: PipelineId) -> Vec<BandwidthEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.pipeline == pipeline)
            .cloned()
            .collect()
    }

    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }
}

impl BandwidthController for RecordingBandwidth {
    fn apply(&self, pipeline: PipelineId, plan: &BandwidthPlan, phase: Phase) -> Result<()> {
        self.events.lock().push(BandwidthEvent {
            pipeline,
            plan: *plan,
            phase,
        });
        if self.failing.load(Ordering::Relaxed) {
            return Err(PipelineError::Hardware("bus governor refused".into()));
        }
        self.applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// The simulated controller, allocator, and bus governor together.
///
/// Keeps the concrete handles so tests and the demo can inject faults and
/// inspect state while pipelines see only the trait objects.
pub struct SimRig {
    pub hw: Arc<SimHardware>,
    pub buffers: Arc<SimBufferProvider>,
    pub bandwidth: Arc<RecordingBandwidth>,
}

impl SimRig {
    pub fn new() -> Self {
        Self {
            hw: SimHardware::new(),
            buffers: SimBufferProvider::new(),
            bandwidth: RecordingBandwidth::new(),
        }
    }

    /// Collaborators for every pipeline of `config`, sharing one arbiter
    pub fn collaborators(&self, config: &DisplayConfig) -> Collaborators {
        Collaborators {
            hw: self.hw.clone(),
            buffers: self.buffers.clone(),
            estimator: Arc::new(LinearEstimator),
            bandwidth: self.bandwidth.clone(),
            arbiter: Arc::new(ResourceArbiter::new(config.channel_slots())),
            fences: FenceRegistry::new(),
            recovery: Arc::new(Mutex::new(RecoveryManager::new(DumpConfig::from(
                &config.general,
            )))),
        }
    }
}

impl Default for SimRig {
    fn default() -> Self {
        Self::new()
    }
}
