//! Unit tests for the output pipeline
//!
//! Run against the simulated controller at 240 Hz with short timeouts.

use super::*;
use crate::bandwidth::{BandwidthPlan, PanelTiming, Phase, WindowLoad};
use crate::buffer::BufferHandle;
use crate::config::{HibernationConfig, PipelineConfig, TimingConfig};
use crate::fence::FenceStatus;
use crate::frame::{BufferWindow, PixelFormat, WindowConfig, WritebackTarget};
use crate::hw::sim::SimRig;
use crate::hw::LayerSource;
use anyhow::Result;

const WAIT: Duration = Duration::from_secs(2);

fn test_config() -> DisplayConfig {
    let mut config = DisplayConfig::default();
    config.timing = TimingConfig {
        acquire_timeout_ms: 30,
        latch_timeout_frames: 30,
        frame_done_timeout_ms: 100,
        flush_timeout_ms: 3000,
    };
    config.pipelines = vec![
        PipelineConfig {
            refresh_hz: 240,
            ..PipelineConfig::display(0, 64, 64, 4)
        },
        PipelineConfig {
            refresh_hz: 240,
            ..PipelineConfig::writeback(1, 64, 64, 2)
        },
    ];
    config
}

fn start(rig: &SimRig, config: &DisplayConfig, id: PipelineId) -> Result<Pipeline> {
    let pipeline_config = config
        .pipeline(id)
        .ok_or_else(|| anyhow::anyhow!("no pipeline {}", id))?;
    Ok(Pipeline::new(pipeline_config, config, rig.collaborators(config))?)
}

fn buffer_window(rig: &SimRig, channel: ChannelId, x: i32) -> (BufferWindow, BufferHandle) {
    let handle = rig.buffers.allocate(16 * 16 * 4);
    (BufferWindow::simple(channel, Rect::new(x, 0, 16, 16), handle), handle)
}

fn color(x: i32) -> WindowConfig {
    WindowConfig::Color {
        color: 0xff20_4080,
        dst: Rect::new(x, 0, 8, 8),
    }
}

fn retired_ok(fence: &Fence) -> bool {
    fence.wait(WAIT) == FenceWait::Ready(Ok(()))
}

#[test]
fn test_frame_latches_and_retires() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    let (window, _) = buffer_window(&rig, 0, 0);
    let fences = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window), color(20)]))?;
    assert!(retired_ok(&fences.retire));
    assert!(fences.readback.is_none());

    let active = rig.hw.active(0).ok_or_else(|| anyhow::anyhow!("nothing latched"))?;
    assert_eq!(active.windows.len(), 2);
    assert!(matches!(active.windows[0].source, LayerSource::Dma { channel: 0, .. }));
    assert_eq!(pipeline.bound_channels(), vec![0]);

    let stats = pipeline.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.committed, 1);
    assert_eq!(pipeline.history()[0].outcome, FrameOutcome::Committed);
    Ok(())
}

#[test]
fn test_previous_frame_released_after_next_latch() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    let (first, first_handle) = buffer_window(&rig, 0, 0);
    let a = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(first)]))?;
    assert!(retired_ok(&a.retire));
    // still scanned out
    assert!(rig.buffers.is_mapped(first_handle));

    let (second, second_handle) = buffer_window(&rig, 0, 0);
    let b = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(second)]))?;
    assert!(retired_ok(&b.retire));
    pipeline.flush()?;
    assert!(!rig.buffers.is_mapped(first_handle));
    assert!(rig.buffers.is_mapped(second_handle));
    Ok(())
}

#[test]
fn test_retire_order_matches_submission() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    let mut retires = Vec::new();
    for i in 0..5 {
        let (window, _) = buffer_window(&rig, 0, i * 4);
        retires.push(pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)]))?.retire);
    }
    pipeline.flush()?;

    assert!(retires.iter().all(|r| r.status() == FenceStatus::Signaled));
    let seqs: Vec<u64> = pipeline.history().iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    assert_eq!(pipeline.queued(), 0);
    Ok(())
}

#[test]
fn test_acquire_timeout_demotes_window_and_forces_full_redraw() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;
    let producers = FenceRegistry::new();

    let (_never, acquire) = producers.create("acquire");
    let (window, _) = buffer_window(&rig, 0, 0);
    let partial = Rect::new(0, 0, 8, 8);
    let first = pipeline.submit(
        FrameDesc::new(vec![WindowConfig::Buffer(window.with_acquire(acquire)), color(20)])
            .with_update_region(partial),
    )?;
    assert!(retired_ok(&first.retire));

    let second = pipeline.submit(FrameDesc::new(vec![color(0)]).with_update_region(partial))?;
    assert!(retired_ok(&second.retire));

    let history = pipeline.history();
    assert_eq!(history[0].disabled_windows, vec![0]);
    assert_eq!(history[0].outcome, FrameOutcome::Committed);
    assert!(history[1].full_redraw);
    assert_eq!(pipeline.stats().acquire_timeouts, 1);
    Ok(())
}

#[test]
fn test_failed_acquire_collapses_frame_to_noop() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;
    let producers = FenceRegistry::new();

    let (producer, acquire) = producers.create("acquire");
    producer.signal(Err(PipelineError::Hardware("gpu fault".into())));
    let (window, handle) = buffer_window(&rig, 0, 0);
    let fences = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window.with_acquire(acquire))]))?;

    // a no-op still retires successfully
    assert!(retired_ok(&fences.retire));
    pipeline.flush()?;
    assert_eq!(pipeline.history()[0].outcome, FrameOutcome::NoOp);
    assert_eq!(rig.hw.program_count(0), 0);
    assert!(!rig.buffers.is_mapped(handle));
    Ok(())
}

#[test]
fn test_latch_timeout_is_fatal_until_reinit() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let collaborators = rig.collaborators(&config);
    let recovery = Arc::clone(&collaborators.recovery);
    let pipeline = Pipeline::new(&config.pipelines[0], &config, collaborators)?;

    rig.hw.stick_latch(0, true);
    let (window, handle) = buffer_window(&rig, 0, 0);
    let fences = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)]))?;
    assert_eq!(
        fences.retire.wait(WAIT),
        FenceWait::Ready(Err(PipelineError::LatchTimeout { pipeline: 0 }))
    );
    assert!(pipeline.is_fatal());
    // the hardware may still be fetching it
    assert!(rig.buffers.is_mapped(handle));

    let (again, _) = buffer_window(&rig, 0, 0);
    assert!(matches!(
        pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(again)])),
        Err(PipelineError::PipelineFatal { pipeline: 0 })
    ));
    {
        let recovery = recovery.lock();
        let dump = recovery.latest().ok_or_else(|| anyhow::anyhow!("no dump"))?;
        assert_eq!(dump.pipeline, 0);
        assert!(dump.error.contains("latch"));
        assert!(dump.registers.registers.contains_key("arm_gen"));
    }

    pipeline.reinit()?;
    assert!(!pipeline.is_fatal());
    assert_eq!(rig.hw.reset_count(0), 1);
    assert!(!rig.buffers.is_mapped(handle));

    let (fresh, _) = buffer_window(&rig, 0, 0);
    let fences = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(fresh)]))?;
    assert!(retired_ok(&fences.retire));
    assert_eq!(pipeline.stats().reinits, 1);
    assert_eq!(recovery.lock().stats().reinits, 1);
    Ok(())
}

struct FailingEstimator;

impl BandwidthEstimator for FailingEstimator {
    fn estimate(&self, _windows: &[WindowLoad], _timing: &PanelTiming) -> Result<BandwidthPlan, PipelineError> {
        Err(PipelineError::Estimator("no table for this mode".into()))
    }
}

#[test]
fn test_estimator_failure_is_fatal() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let collaborators = Collaborators {
        estimator: Arc::new(FailingEstimator),
        ..rig.collaborators(&config)
    };
    let arbiter = Arc::clone(&collaborators.arbiter);
    let pipeline = Pipeline::new(&config.pipelines[0], &config, collaborators)?;

    let (window, _) = buffer_window(&rig, 2, 0);
    let fences = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)]))?;
    assert!(matches!(
        fences.retire.wait(WAIT),
        FenceWait::Ready(Err(PipelineError::Estimator(_)))
    ));
    assert!(pipeline.is_fatal());
    assert_eq!(pipeline.stats().estimator_failures, 1);
    // the reservation was rolled back
    assert_eq!(arbiter.owner_of(2), None);
    assert_eq!(rig.hw.program_count(0), 0);
    Ok(())
}

#[test]
fn test_bandwidth_controller_failure_does_not_block_commit() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;
    rig.bandwidth.set_failing(true);

    let (window, _) = buffer_window(&rig, 0, 0);
    let fences = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)]))?;
    assert!(retired_ok(&fences.retire));
    assert!(!rig.bandwidth.events_for(0).is_empty());
    assert_eq!(rig.bandwidth.applied(), 0);
    Ok(())
}

#[test]
fn test_bandwidth_raised_before_and_settled_after_latch() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    let (window, _) = buffer_window(&rig, 0, 0);
    let fences = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)]))?;
    assert!(retired_ok(&fences.retire));

    let phases: Vec<Phase> = rig.bandwidth.events_for(0).iter().map(|e| e.phase).collect();
    assert_eq!(phases, vec![Phase::BeforeCommit, Phase::AfterCommit]);
    Ok(())
}

#[test]
fn test_refresh_rate_change() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    let retire = pipeline.set_refresh_rate(120, 3)?;
    assert!(retired_ok(&retire));
    assert_eq!(rig.hw.refresh(0), Some(RefreshChange { fps: 120, mode: 3 }));
    assert_eq!(pipeline.history()[0].outcome, FrameOutcome::Refresh);
    assert_eq!(pipeline.stats().refresh_changes, 1);

    assert_eq!(
        pipeline.set_refresh_rate(0, 0).map(|_| ()),
        Err(PipelineError::InvalidRefreshRate(0))
    );
    Ok(())
}

#[test]
fn test_cursor_moves_without_full_commit() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    assert!(matches!(
        pipeline.update_cursor_position(4, 4),
        Err(PipelineError::InvalidWindow { .. })
    ));

    let (cursor, _) = buffer_window(&rig, 1, 0);
    let fences = pipeline.submit(FrameDesc::new(vec![color(0), WindowConfig::Cursor(cursor)]))?;
    assert!(retired_ok(&fences.retire));
    let programs = rig.hw.program_count(0);

    pipeline.update_cursor_position(10, 20)?;
    let active = rig.hw.active(0).ok_or_else(|| anyhow::anyhow!("nothing latched"))?;
    let regs = active
        .windows
        .iter()
        .find(|w| w.window == 1)
        .ok_or_else(|| anyhow::anyhow!("cursor window missing"))?;
    assert_eq!((regs.dst.x, regs.dst.y), (10, 20));
    assert_eq!(rig.hw.program_count(0), programs);
    assert_eq!(pipeline.stats().cursor_updates, 1);

    assert!(matches!(
        pipeline.update_cursor_position(60, 60),
        Err(PipelineError::InvalidWindow { window: 1, .. })
    ));
    Ok(())
}

#[test]
fn test_cursor_update_refused_while_shadow_pending() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    let (cursor, _) = buffer_window(&rig, 1, 0);
    let fences = pipeline.submit(FrameDesc::new(vec![WindowConfig::Cursor(cursor)]))?;
    assert!(retired_ok(&fences.retire));

    assert!(pipeline.shared.shadow.try_begin());
    assert_eq!(
        pipeline.update_cursor_position(2, 2),
        Err(PipelineError::ShadowUpdateBusy { pipeline: 0 })
    );
    pipeline.shared.shadow.end();
    pipeline.update_cursor_position(2, 2)?;
    Ok(())
}

#[test]
fn test_submission_wakes_hibernating_pipeline() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    pipeline.enter_hiber()?;
    assert_eq!(pipeline.power_state(), PowerState::Hiber);
    assert_eq!(rig.hw.power_state(0), Some(PowerState::Hiber));

    let (window, _) = buffer_window(&rig, 0, 0);
    let fences = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)]))?;
    assert_eq!(pipeline.power_state(), PowerState::On);
    assert!(retired_ok(&fences.retire));
    assert_eq!(pipeline.shared.power.hiber_exits(), 1);
    Ok(())
}

#[test]
fn test_idle_pipeline_hibernates_automatically() -> Result<()> {
    let rig = SimRig::new();
    let mut config = test_config();
    config.hibernation = HibernationConfig {
        enabled: true,
        idle_timeout_ms: 20,
    };
    let pipeline = start(&rig, &config, 0)?;

    let deadline = Instant::now() + WAIT;
    while pipeline.power_state() != PowerState::Hiber && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(pipeline.power_state(), PowerState::Hiber);

    let (window, _) = buffer_window(&rig, 0, 0);
    let fences = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)]))?;
    assert!(retired_ok(&fences.retire));
    Ok(())
}

#[test]
fn test_powered_off_pipeline_answers_with_signaled_fences() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    let (window, handle) = buffer_window(&rig, 0, 0);
    let fences = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)]))?;
    assert!(retired_ok(&fences.retire));

    pipeline.set_power(PowerState::Off)?;
    assert_eq!(rig.hw.power_state(0), Some(PowerState::Off));
    assert!(pipeline.bound_channels().is_empty());
    assert!(!rig.buffers.is_mapped(handle));

    let (window, _) = buffer_window(&rig, 0, 0);
    let fences = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)]))?;
    assert_eq!(fences.retire.status(), FenceStatus::Signaled);
    assert_eq!(pipeline.stats().synthesized, 1);
    assert_eq!(pipeline.stats().submitted, 1);

    pipeline.set_power(PowerState::On)?;
    let (window, _) = buffer_window(&rig, 0, 0);
    let fences = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)]))?;
    assert!(retired_ok(&fences.retire));
    assert_eq!(pipeline.stats().committed, 2);
    Ok(())
}

#[test]
fn test_import_failure_is_returned_and_nothing_queued() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    let (good, _) = buffer_window(&rig, 0, 0);
    let (bad, bad_handle) = buffer_window(&rig, 1, 20);
    rig.buffers.fail_import(bad_handle);

    let result = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(good), WindowConfig::Buffer(bad)]));
    assert!(matches!(result, Err(PipelineError::ImportFailed { .. })));
    assert_eq!(rig.buffers.live_mappings(), 0);
    assert_eq!(pipeline.stats().submitted, 0);
    Ok(())
}

#[test]
fn test_undersized_buffer_rejected() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    let handle = rig.buffers.allocate(64);
    let window = BufferWindow::simple(0, Rect::new(0, 0, 16, 16), handle);
    assert_eq!(
        pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)])).map(|_| ()),
        Err(PipelineError::ResourceMismatch {
            window: 0,
            required: 16 * 16 * 4,
            actual: 64
        })
    );
    assert_eq!(rig.buffers.live_mappings(), 0);
    Ok(())
}

#[test]
fn test_oversized_source_rejected_before_import() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    let handle = rig.buffers.allocate(4096);
    let mut window = BufferWindow::simple(2, Rect::new(0, 0, 64, 64), handle);
    window.src = Rect::new(0, 0, 1 << 31, 1 << 31);
    assert!(matches!(
        pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)])),
        Err(PipelineError::InvalidWindow { window: 0, .. })
    ));
    assert_eq!(rig.buffers.imports(), 0);
    assert_eq!(pipeline.stats().submitted, 0);
    Ok(())
}

#[test]
fn test_scaled_source_needs_full_backing() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    let handle = rig.buffers.allocate(4096);
    let mut window = BufferWindow::simple(2, Rect::new(0, 0, 64, 64), handle);
    window.src = Rect::new(0, 0, 8192, 8192);
    assert_eq!(
        pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)])).map(|_| ()),
        Err(PipelineError::ResourceMismatch {
            window: 0,
            required: 8192 * 8192 * 4,
            actual: 4096
        })
    );
    assert_eq!(rig.buffers.live_mappings(), 0);
    Ok(())
}

#[test]
fn test_program_failure_aborts_and_restores_latched_state() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    let (first, first_handle) = buffer_window(&rig, 0, 0);
    assert!(retired_ok(&pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(first)]))?.retire));
    let latched = rig.bandwidth.events_for(0)[1].plan;

    rig.hw.fail_program(0, true);
    let (extra, extra_handle) = buffer_window(&rig, 1, 20);
    let (again, _) = buffer_window(&rig, 0, 0);
    let rejected = pipeline.submit(FrameDesc::new(vec![
        WindowConfig::Buffer(again),
        WindowConfig::Buffer(extra),
    ]))?;
    assert!(matches!(
        rejected.retire.wait(WAIT),
        FenceWait::Ready(Err(PipelineError::Hardware(_)))
    ));
    pipeline.flush()?;

    // the raise for the bigger frame is dropped back to the latched plan
    let events = rig.bandwidth.events_for(0);
    assert_eq!(events.len(), 4);
    assert_eq!(events[2].phase, Phase::BeforeCommit);
    assert!(events[2].plan.read > latched.read);
    assert_eq!(events[3].phase, Phase::AfterCommit);
    assert_eq!(events[3].plan, latched);

    assert_eq!(pipeline.bound_channels(), vec![0]);
    assert!(!rig.buffers.is_mapped(extra_handle));
    assert!(rig.buffers.is_mapped(first_handle));
    assert!(!pipeline.is_fatal());
    assert_eq!(pipeline.stats().aborted, 1);
    assert!(matches!(pipeline.history()[1].outcome, FrameOutcome::Aborted(_)));

    rig.hw.fail_program(0, false);
    let (next, _) = buffer_window(&rig, 1, 20);
    assert!(retired_ok(&pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(next)]))?.retire));
    assert_eq!(pipeline.bound_channels(), vec![1]);
    assert_eq!(pipeline.stats().committed, 2);
    Ok(())
}

#[test]
fn test_arm_failure_releases_new_channels() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    rig.hw.fail_arm(0, true);
    let (window, _) = buffer_window(&rig, 3, 0);
    let fences = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)]))?;
    assert!(matches!(
        fences.retire.wait(WAIT),
        FenceWait::Ready(Err(PipelineError::Hardware(_)))
    ));
    pipeline.flush()?;
    assert!(pipeline.bound_channels().is_empty());
    assert_eq!(rig.hw.latch_count(0), 0);

    rig.hw.fail_arm(0, false);
    let (window, _) = buffer_window(&rig, 3, 0);
    assert!(retired_ok(&pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)]))?.retire));
    assert_eq!(pipeline.bound_channels(), vec![3]);
    Ok(())
}

#[test]
fn test_frame_without_damage_is_not_tagged_full_redraw() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    let fences = pipeline.submit(FrameDesc::new(vec![color(0)]))?;
    assert!(retired_ok(&fences.retire));
    assert!(!pipeline.history()[0].full_redraw);
    let active = rig.hw.active(0).ok_or_else(|| anyhow::anyhow!("nothing latched"))?;
    assert_eq!(active.update_region, Rect::new(0, 0, 64, 64));
    Ok(())
}

fn writeback_target(rig: &SimRig) -> WritebackTarget {
    WritebackTarget {
        rect: Rect::new(0, 0, 64, 64),
        format: PixelFormat::Argb8888,
        handle: rig.buffers.allocate(64 * 64 * 4),
    }
}

#[test]
fn test_writeback_readback_fence() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 1)?;

    let target = writeback_target(&rig);
    let handle = target.handle;
    let fences = pipeline.submit(FrameDesc::new(vec![color(0)]).with_writeback(target))?;
    let readback = fences.readback.ok_or_else(|| anyhow::anyhow!("no readback fence"))?;
    assert!(retired_ok(&readback));
    assert!(retired_ok(&fences.retire));
    pipeline.flush()?;
    assert!(!rig.buffers.is_mapped(handle));
    Ok(())
}

#[test]
fn test_writeback_frame_done_timeout_is_fatal() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 1)?;
    rig.hw.stick_frame_done(1, true);

    let fences = pipeline.submit(FrameDesc::new(vec![color(0)]).with_writeback(writeback_target(&rig)))?;
    assert_eq!(
        fences.retire.wait(WAIT),
        FenceWait::Ready(Err(PipelineError::FrameDoneTimeout { pipeline: 1 }))
    );
    assert!(pipeline.is_fatal());
    assert_eq!(pipeline.stats().frame_done_timeouts, 1);
    Ok(())
}

#[test]
fn test_writeback_rejected_on_display_pipeline() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    let result = pipeline.submit(FrameDesc::new(vec![color(0)]).with_writeback(writeback_target(&rig)));
    assert!(matches!(result, Err(PipelineError::InvalidWindow { .. })));
    Ok(())
}

#[test]
fn test_shutdown_stops_worker() -> Result<()> {
    let rig = SimRig::new();
    let config = test_config();
    let pipeline = start(&rig, &config, 0)?;

    let (window, _) = buffer_window(&rig, 0, 0);
    let fences = pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)]))?;
    pipeline.shutdown();
    assert!(retired_ok(&fences.retire));
    assert_eq!(rig.buffers.live_mappings(), 0);

    let (window, _) = buffer_window(&rig, 0, 0);
    assert_eq!(
        pipeline.submit(FrameDesc::new(vec![WindowConfig::Buffer(window)])).map(|_| ()),
        Err(PipelineError::WorkerGone { pipeline: 0 })
    );
    // idempotent
    pipeline.shutdown();
    Ok(())
}
