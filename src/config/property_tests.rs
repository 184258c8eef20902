//! Property-based tests for configuration module
//!
//! These tests use proptest to generate random configurations and verify
//! invariants and serialization round-trips.

use super::*;
use proptest::prelude::*;

prop_compose! {
    fn valid_timing_config()(
        acquire_timeout_ms in 1u64..5000,
        latch_timeout_frames in 1u32..16,
        frame_done_timeout_ms in 1u64..1000,
        flush_timeout_ms in 1u64..10_000,
    ) -> TimingConfig {
        TimingConfig {
            acquire_timeout_ms,
            latch_timeout_frames,
            frame_done_timeout_ms,
            flush_timeout_ms,
        }
    }
}

prop_compose! {
    fn valid_channel()(
        id in 0u32..64,
        rotation in any::<bool>(),
        compression in any::<bool>(),
        protected in any::<bool>(),
        scaling in any::<bool>(),
        yuv in any::<bool>(),
    ) -> ChannelCaps {
        ChannelCaps { id, rotation, compression, protected, scaling, yuv }
    }
}

prop_compose! {
    fn valid_pipeline()(
        id in 0u32..1000,
        writeback in any::<bool>(),
        width in 1u32..8192,
        height in 1u32..8192,
        window_count in 1usize..16,
        refresh_hz in 1u32..240,
    ) -> PipelineConfig {
        PipelineConfig {
            id,
            kind: if writeback { PipelineKind::Writeback } else { PipelineKind::Display },
            width,
            height,
            window_count,
            refresh_hz,
        }
    }
}

fn dedup_channels(mut channels: Vec<ChannelCaps>) -> Vec<ChannelCaps> {
    channels.sort_by_key(|c| c.id);
    channels.dedup_by_key(|c| c.id);
    channels
}

fn dedup_pipelines(mut pipelines: Vec<PipelineConfig>) -> Vec<PipelineConfig> {
    pipelines.sort_by_key(|p| p.id);
    pipelines.dedup_by_key(|p| p.id);
    pipelines
}

proptest! {
    #[test]
    fn prop_valid_configs_roundtrip(
        timing in valid_timing_config(),
        channels in proptest::collection::vec(valid_channel(), 1..12),
        pipelines in proptest::collection::vec(valid_pipeline(), 1..5),
        hiber in any::<bool>(),
    ) {
        let config = DisplayConfig {
            timing,
            channels: dedup_channels(channels),
            pipelines: dedup_pipelines(pipelines),
            hibernation: HibernationConfig { enabled: hiber, idle_timeout_ms: 250 },
            ..DisplayConfig::default()
        };
        prop_assert!(config.validate().is_ok());

        let text = toml::to_string(&config).unwrap();
        let parsed: DisplayConfig = toml::from_str(&text).unwrap();
        prop_assert_eq!(parsed, config);
    }

    #[test]
    fn prop_latch_timeout_never_below_one_period(
        frames in 0u32..16,
        hz in 1u32..240,
    ) {
        let timing = TimingConfig { latch_timeout_frames: frames, ..TimingConfig::default() };
        let pipeline = PipelineConfig { refresh_hz: hz, ..PipelineConfig::display(0, 1, 1, 1) };
        let period = pipeline.frame_period();
        prop_assert!(timing.latch_timeout(period) >= period);
    }
}
