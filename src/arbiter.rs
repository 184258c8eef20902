//! Cross-pipeline hardware channel arbitration
//!
//! Every output pipeline draws its DMA channels from one shared pool. The
//! [`GlobalResourceMap`] records which (pipeline, window) owns each channel;
//! [`ResourceArbiter`] wraps it in a single short critical section so that
//! concurrent commits on sibling pipelines can never both bind a channel.
//!
//! A pipeline's channels move through two stages:
//!
//! ```text
//!   bind(claims)          commit_latched()
//!  ───────────────► cur_req ───────────────► prev_used
//!                                  (channels in prev_used but not in
//!                                   cur_req are released here)
//! ```
//!
//! Channels the hardware may still be reading from the previous frame stay
//! owned until the new frame's latch is confirmed.

use log::debug;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{PipelineError, PipelineId, Result};

/// Hardware channel index
pub type ChannelId = u32;

/// Upper bound on channels tracked by the map
pub const MAX_CHANNELS: usize = 64;

/// A set of channels
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ChannelSet(u64);

impl ChannelSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, channel: ChannelId) -> bool {
        (channel as usize) < MAX_CHANNELS && self.0 & (1 << channel) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ChannelId> + '_ {
        (0..MAX_CHANNELS as ChannelId).filter(move |c| self.contains(*c))
    }

    fn insert(&mut self, channel: ChannelId) {
        self.0 |= 1 << channel;
    }

    fn difference(self, other: ChannelSet) -> ChannelSet {
        ChannelSet(self.0 & !other.0)
    }
}

impl fmt::Debug for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<ChannelId> for ChannelSet {
    fn from_iter<I: IntoIterator<Item = ChannelId>>(iter: I) -> Self {
        let mut set = ChannelSet::empty();
        for c in iter {
            if (c as usize) < MAX_CHANNELS {
                set.insert(c);
            }
        }
        set
    }
}

/// A window's request for one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClaim {
    pub window: usize,
    pub channel: ChannelId,
}

/// What a successful bind changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOutcome {
    /// Channels this pipeline did not hold before the bind
    pub newly_bound: ChannelSet,
    /// Channels that will be released once the new frame latches
    pub pending_release: ChannelSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PipelineBindings {
    prev_used: ChannelSet,
    cur_req: ChannelSet,
    /// channel -> window for the latched frame
    prev_windows: BTreeMap<ChannelId, usize>,
    /// channel -> window for the frame being committed
    cur_windows: BTreeMap<ChannelId, usize>,
}

impl PipelineBindings {
    fn is_empty(&self) -> bool {
        self.prev_used.is_empty() && self.cur_req.is_empty()
    }
}

/// Channel ownership across all pipelines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalResourceMap {
    owners: Vec<Option<PipelineId>>,
    pipelines: BTreeMap<PipelineId, PipelineBindings>,
}

impl GlobalResourceMap {
    pub fn new(channel_count: usize) -> Self {
        Self {
            owners: vec![None; channel_count.min(MAX_CHANNELS)],
            pipelines: BTreeMap::new(),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.owners.len()
    }

    /// Bind `claims` as the pipeline's next window set. All or nothing.
    pub fn bind(&mut self, pipeline: PipelineId, claims: &[ChannelClaim]) -> Result<BindOutcome> {
        let mut requested = ChannelSet::empty();
        for claim in claims {
            let Some(owner) = self.owners.get(claim.channel as usize) else {
                return Err(PipelineError::InvalidWindow {
                    window: claim.window,
                    reason: format!("channel {} does not exist", claim.channel),
                });
            };
            if requested.contains(claim.channel) {
                return Err(PipelineError::InvalidWindow {
                    window: claim.window,
                    reason: format!("channel {} claimed twice", claim.channel),
                });
            }
            if let Some(owner) = *owner {
                if owner != pipeline {
                    return Err(PipelineError::ResourceConflict {
                        channel: claim.channel,
                        owner,
                    });
                }
            }
            requested.insert(claim.channel);
        }

        let entry = self.pipelines.entry(pipeline).or_default();
        let held = ChannelSet(entry.prev_used.0 | entry.cur_req.0);
        // a second bind before the latch supersedes the first
        let superseded = entry.cur_req.difference(entry.prev_used).difference(requested);
        entry.cur_req = requested;
        entry.cur_windows = claims.iter().map(|c| (c.channel, c.window)).collect();
        let pending_release = entry.prev_used.difference(requested);
        for channel in superseded.iter() {
            self.owners[channel as usize] = None;
        }
        for claim in claims {
            self.owners[claim.channel as usize] = Some(pipeline);
        }

        Ok(BindOutcome {
            newly_bound: requested.difference(held),
            pending_release,
        })
    }

    /// The pipeline's requested set has latched; release what it no longer uses
    pub fn commit_latched(&mut self, pipeline: PipelineId) -> ChannelSet {
        let Some(entry) = self.pipelines.get_mut(&pipeline) else {
            return ChannelSet::empty();
        };
        let freed = entry.prev_used.difference(entry.cur_req);
        entry.prev_used = entry.cur_req;
        entry.prev_windows = entry.cur_windows.clone();
        let now_empty = entry.is_empty();
        for channel in freed.iter() {
            self.owners[channel as usize] = None;
        }
        if now_empty {
            self.pipelines.remove(&pipeline);
        }
        freed
    }

    /// Undo a bind whose frame never reached the hardware
    pub fn rollback(&mut self, pipeline: PipelineId) {
        let Some(entry) = self.pipelines.get_mut(&pipeline) else {
            return;
        };
        let undone = entry.cur_req.difference(entry.prev_used);
        entry.cur_req = entry.prev_used;
        entry.cur_windows = entry.prev_windows.clone();
        let now_empty = entry.is_empty();
        for channel in undone.iter() {
            self.owners[channel as usize] = None;
        }
        if now_empty {
            self.pipelines.remove(&pipeline);
        }
    }

    /// Release everything the pipeline holds
    pub fn unbind(&mut self, pipeline: PipelineId) -> ChannelSet {
        let mut released = ChannelSet::empty();
        for (channel, owner) in self.owners.iter_mut().enumerate() {
            if *owner == Some(pipeline) {
                *owner = None;
                released.insert(channel as ChannelId);
            }
        }
        self.pipelines.remove(&pipeline);
        released
    }

    pub fn owner_of(&self, channel: ChannelId) -> Option<PipelineId> {
        self.owners.get(channel as usize).copied().flatten()
    }

    /// Channels currently owned by `pipeline`
    pub fn bound_channels(&self, pipeline: PipelineId) -> ChannelSet {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, o)| **o == Some(pipeline))
            .map(|(c, _)| c as ChannelId)
            .collect()
    }

    /// Whether (pipeline, window) has a channel bound in either stage
    pub fn is_window_bound(&self, pipeline: PipelineId, window: usize) -> bool {
        self.pipelines.get(&pipeline).is_some_and(|entry| {
            entry.cur_windows.values().any(|w| *w == window)
                || entry.prev_windows.values().any(|w| *w == window)
        })
    }
}

/// Shared, lock-protected [`GlobalResourceMap`]
pub struct ResourceArbiter {
    map: Mutex<GlobalResourceMap>,
}

impl ResourceArbiter {
    pub fn new(channel_count: usize) -> Self {
        Self {
            map: Mutex::new(GlobalResourceMap::new(channel_count)),
        }
    }

    pub fn bind(&self, pipeline: PipelineId, claims: &[ChannelClaim]) -> Result<BindOutcome> {
        let outcome = self.map.lock().bind(pipeline, claims)?;
        if !outcome.newly_bound.is_empty() {
            debug!(
                "pipeline {} bound channels {:?}",
                pipeline, outcome.newly_bound
            );
        }
        Ok(outcome)
    }

    pub fn commit_latched(&self, pipeline: PipelineId) -> ChannelSet {
        let freed = self.map.lock().commit_latched(pipeline);
        if !freed.is_empty() {
            debug!("pipeline {} released channels {:?}", pipeline, freed);
        }
        freed
    }

    pub fn rollback(&self, pipeline: PipelineId) {
        self.map.lock().rollback(pipeline);
    }

    pub fn unbind(&self, pipeline: PipelineId) -> ChannelSet {
        let released = self.map.lock().unbind(pipeline);
        if !released.is_empty() {
            debug!("pipeline {} unbound channels {:?}", pipeline, released);
        }
        released
    }

    pub fn owner_of(&self, channel: ChannelId) -> Option<PipelineId> {
        self.map.lock().owner_of(channel)
    }

    pub fn bound_channels(&self, pipeline: PipelineId) -> ChannelSet {
        self.map.lock().bound_channels(pipeline)
    }

    pub fn channel_count(&self) -> usize {
        self.map.lock().channel_count()
    }

    /// Copy of the current map
    pub fn snapshot(&self) -> GlobalResourceMap {
        self.map.lock().clone()
    }
}
