//! Per-pipeline counters and frame history

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::frame::Rect;

/// How the worker finished a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameOutcome {
    /// Latched into hardware
    Committed,
    /// Every enabled window was demoted; nothing was programmed
    NoOp,
    /// Refresh-rate change applied
    Refresh,
    /// Programming failed; previous frame stays on screen
    Aborted(String),
    /// Retired with an error because the pipeline is wedged
    Fatal(String),
}

/// One processed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub seq: u64,
    pub outcome: FrameOutcome,
    /// Windows demoted to disabled by the worker
    pub disabled_windows: Vec<usize>,
    pub full_redraw: bool,
    pub update_region: Option<Rect>,
    /// Dequeue to retire
    pub commit_time: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub submitted: u64,
    /// Answered with pre-signaled fences while powered down
    pub synthesized: u64,
    pub committed: u64,
    pub noop: u64,
    pub aborted: u64,
    pub refresh_changes: u64,
    pub demoted_windows: u64,
    pub conflicts: u64,
    pub acquire_timeouts: u64,
    pub latch_timeouts: u64,
    pub frame_done_timeouts: u64,
    pub estimator_failures: u64,
    pub fatal_retired: u64,
    pub reinits: u64,
    pub cursor_updates: u64,
}

/// Bounded history, oldest first
#[derive(Debug)]
pub(crate) struct FrameHistory {
    records: VecDeque<FrameRecord>,
    capacity: usize,
}

impl FrameHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(&mut self, record: FrameRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub(crate) fn snapshot(&self) -> Vec<FrameRecord> {
        self.records.iter().cloned().collect()
    }

    pub(crate) fn recent(&self, count: usize) -> Vec<FrameRecord> {
        let skip = self.records.len().saturating_sub(count);
        self.records.iter().skip(skip).cloned().collect()
    }
}
