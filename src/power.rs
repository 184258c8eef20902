//! Power and hibernation state
//!
//! `Hiber` is a low-power sub-state of `On`. It may only be entered while no
//! submission is in flight and the queue is empty. Every in-flight frame
//! holds a [`HiberBlock`] from admission until it retires.

use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{PipelineError, Result};

/// Power state of one pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerState {
    Off,
    On,
    /// Low-power refresh; still accepts frames
    Doze,
    /// Low-power refresh with the pipeline clock gated
    DozeSuspend,
    /// Idle power saving inside `On`
    Hiber,
    /// Display owned by a trusted UI; normal submissions are parked
    Tui,
}

impl PowerState {
    /// Whether submissions are queued in this state
    pub fn accepts_frames(&self) -> bool {
        matches!(self, PowerState::On | PowerState::Doze | PowerState::Hiber)
    }

    /// Whether the hardware is scanning out
    pub fn is_powered(&self) -> bool {
        !matches!(self, PowerState::Off)
    }
}

impl Default for PowerState {
    fn default() -> Self {
        PowerState::Off
    }
}

/// Power state plus the hibernation block counter of one pipeline
#[derive(Debug)]
pub struct PowerController {
    state: Mutex<PowerState>,
    blocks: AtomicUsize,
    hiber_entries: AtomicU64,
    hiber_exits: AtomicU64,
}

impl PowerController {
    pub fn new(initial: PowerState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(initial),
            blocks: AtomicUsize::new(0),
            hiber_entries: AtomicU64::new(0),
            hiber_exits: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> PowerState {
        *self.state.lock()
    }

    /// Forbid hibernation until the returned guard is dropped
    pub fn block(self: &Arc<Self>) -> HiberBlock {
        self.blocks.fetch_add(1, Ordering::SeqCst);
        HiberBlock {
            power: Arc::clone(self),
        }
    }

    pub fn blocks(&self) -> usize {
        self.blocks.load(Ordering::SeqCst)
    }

    /// Enter `Hiber` from `On`, running `suspend` under the state lock.
    ///
    /// Refused while any block is held or `queued` is non-zero.
    pub fn enter_hiber<F>(&self, queued: usize, suspend: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut state = self.state.lock();
        match *state {
            PowerState::Hiber => return Ok(()),
            PowerState::On => {}
            other => return Err(PipelineError::PowerState { state: other }),
        }
        if queued > 0 {
            return Err(PipelineError::HiberRefused("frames queued"));
        }
        if self.blocks.load(Ordering::SeqCst) > 0 {
            return Err(PipelineError::HiberRefused("submission in flight"));
        }
        suspend()?;
        *state = PowerState::Hiber;
        self.hiber_entries.fetch_add(1, Ordering::Relaxed);
        debug!("entered hibernation");
        Ok(())
    }

    /// Leave `Hiber` if in it. Returns whether a transition happened.
    pub fn exit_hiber<F>(&self, resume: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut state = self.state.lock();
        if *state != PowerState::Hiber {
            return Ok(false);
        }
        resume()?;
        *state = PowerState::On;
        self.hiber_exits.fetch_add(1, Ordering::Relaxed);
        debug!("left hibernation");
        Ok(true)
    }

    /// Unconditional transition, used by the blank/unblank path
    pub(crate) fn force(&self, next: PowerState) {
        let mut state = self.state.lock();
        if *state != next {
            info!("power {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    pub fn hiber_entries(&self) -> u64 {
        self.hiber_entries.load(Ordering::Relaxed)
    }

    pub fn hiber_exits(&self) -> u64 {
        self.hiber_exits.load(Ordering::Relaxed)
    }
}

/// Keeps a pipeline out of hibernation while alive
#[derive(Debug)]
pub struct HiberBlock {
    power: Arc<PowerController>,
}

impl Drop for HiberBlock {
    fn drop(&mut self) {
        self.power.blocks.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_states() {
        assert!(PowerState::On.accepts_frames());
        assert!(PowerState::Doze.accepts_frames());
        assert!(PowerState::Hiber.accepts_frames());
        assert!(!PowerState::Off.accepts_frames());
        assert!(!PowerState::DozeSuspend.accepts_frames());
        assert!(!PowerState::Tui.accepts_frames());
    }

    #[test]
    fn test_hiber_refused_with_queue() {
        let power = PowerController::new(PowerState::On);
        assert_eq!(
            power.enter_hiber(1, || Ok(())),
            Err(PipelineError::HiberRefused("frames queued"))
        );
        assert_eq!(power.state(), PowerState::On);
    }

    #[test]
    fn test_hiber_refused_while_blocked() {
        let power = PowerController::new(PowerState::On);
        let block = power.block();
        assert!(power.enter_hiber(0, || Ok(())).is_err());
        drop(block);
        assert_eq!(power.blocks(), 0);
        assert!(power.enter_hiber(0, || Ok(())).is_ok());
        assert_eq!(power.state(), PowerState::Hiber);
    }

    #[test]
    fn test_hiber_roundtrip_counts() {
        let power = PowerController::new(PowerState::On);
        power.enter_hiber(0, || Ok(())).unwrap();
        assert!(power.exit_hiber(|| Ok(())).unwrap());
        assert!(!power.exit_hiber(|| Ok(())).unwrap());
        assert_eq!(power.hiber_entries(), 1);
        assert_eq!(power.hiber_exits(), 1);
    }

    #[test]
    fn test_hiber_only_from_on() {
        let power = PowerController::new(PowerState::Doze);
        assert_eq!(
            power.enter_hiber(0, || Ok(())),
            Err(PipelineError::PowerState {
                state: PowerState::Doze
            })
        );
    }

    #[test]
    fn test_failed_suspend_keeps_state() {
        let power = PowerController::new(PowerState::On);
        let result = power.enter_hiber(0, || Err(PipelineError::Hardware("clock".into())));
        assert!(result.is_err());
        assert_eq!(power.state(), PowerState::On);
    }
}
