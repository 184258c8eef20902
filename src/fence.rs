//! Completion signals (fences)
//!
//! A fence is a reference-counted tri-state completion object. The producer
//! half is a move-only RAII handle: every producer is signaled exactly once,
//! either explicitly through [`FenceProducer::signal`] or with
//! [`PipelineError::Abandoned`] when it is dropped unsignaled. Any number of
//! [`Fence`] clones may wait on the same completion.
//!
//! ```
//! use std::time::Duration;
//! use shadowcommit::fence::{FenceRegistry, FenceWait};
//!
//! let registry = FenceRegistry::new();
//! let (producer, fence) = registry.create("retire");
//! let observer = fence.clone();
//!
//! producer.signal(Ok(()));
//! assert_eq!(observer.wait(Duration::from_millis(1)), FenceWait::Ready(Ok(())));
//! assert_eq!(registry.outstanding(), 0);
//! ```

use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{PipelineError, Result};

/// Observable state of a fence
#[derive(Debug, Clone, PartialEq)]
pub enum FenceStatus {
    Pending,
    Signaled,
    Error(PipelineError),
}

/// Outcome of a bounded wait
#[derive(Debug, Clone, PartialEq)]
pub enum FenceWait {
    /// The fence completed, successfully or with the carried error
    Ready(Result<()>),
    TimedOut,
}

/// Creates fences and accounts for every one of them.
///
/// `outstanding()` is the number of created fences whose producer has not
/// signaled yet; it returns to zero once all in-flight frames retire.
#[derive(Debug, Default)]
pub struct FenceRegistry {
    next_seqno: AtomicU64,
    created: AtomicU64,
    signaled: AtomicU64,
}

impl FenceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a pending fence and its producer
    pub fn create(self: &Arc<Self>, label: &'static str) -> (FenceProducer, Fence) {
        let seqno = self.next_seqno.fetch_add(1, Ordering::Relaxed) + 1;
        self.created.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(FenceInner {
            seqno,
            label,
            status: Mutex::new(FenceStatus::Pending),
            cond: Condvar::new(),
            registry: Arc::clone(self),
        });
        trace!("fence {}#{} created", label, seqno);
        (
            FenceProducer {
                inner: Some(Arc::clone(&inner)),
            },
            Fence { inner },
        )
    }

    /// Create a fence that has already completed with `result`
    pub fn signaled(self: &Arc<Self>, label: &'static str, result: Result<()>) -> Fence {
        let (producer, fence) = self.create(label);
        producer.signal(result);
        fence
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn outstanding(&self) -> u64 {
        self.created.load(Ordering::Acquire) - self.signaled.load(Ordering::Acquire)
    }
}

struct FenceInner {
    seqno: u64,
    label: &'static str,
    status: Mutex<FenceStatus>,
    cond: Condvar,
    registry: Arc<FenceRegistry>,
}

impl FenceInner {
    fn complete(&self, result: Result<()>) {
        let mut status = self.status.lock();
        if *status != FenceStatus::Pending {
            return;
        }
        *status = match result {
            Ok(()) => FenceStatus::Signaled,
            Err(e) => FenceStatus::Error(e),
        };
        self.registry.signaled.fetch_add(1, Ordering::AcqRel);
        trace!("fence {}#{} -> {:?}", self.label, self.seqno, *status);
        self.cond.notify_all();
    }
}

/// Waiter half of a completion signal. Cheap to clone.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    pub fn seqno(&self) -> u64 {
        self.inner.seqno
    }

    pub fn label(&self) -> &'static str {
        self.inner.label
    }

    /// Non-blocking poll
    pub fn status(&self) -> FenceStatus {
        self.inner.status.lock().clone()
    }

    pub fn is_pending(&self) -> bool {
        *self.inner.status.lock() == FenceStatus::Pending
    }

    /// Block until the fence completes or `timeout` elapses
    pub fn wait(&self, timeout: Duration) -> FenceWait {
        self.wait_until(Instant::now() + timeout)
    }

    pub fn wait_until(&self, deadline: Instant) -> FenceWait {
        let mut status = self.inner.status.lock();
        loop {
            match &*status {
                FenceStatus::Signaled => return FenceWait::Ready(Ok(())),
                FenceStatus::Error(e) => return FenceWait::Ready(Err(e.clone())),
                FenceStatus::Pending => {}
            }
            if self.inner.cond.wait_until(&mut status, deadline).timed_out() {
                return match &*status {
                    FenceStatus::Signaled => FenceWait::Ready(Ok(())),
                    FenceStatus::Error(e) => FenceWait::Ready(Err(e.clone())),
                    FenceStatus::Pending => FenceWait::TimedOut,
                };
            }
        }
    }

    /// Two handles observe the same completion
    pub fn ptr_eq(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Fence {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("label", &self.inner.label)
            .field("seqno", &self.inner.seqno)
            .field("status", &*self.inner.status.lock())
            .finish()
    }
}

/// Producer half of a completion signal.
///
/// Consumed by [`signal`](Self::signal); dropping it unsignaled completes the
/// fence with [`PipelineError::Abandoned`].
pub struct FenceProducer {
    inner: Option<Arc<FenceInner>>,
}

impl FenceProducer {
    pub fn signal(mut self, result: Result<()>) {
        if let Some(inner) = self.inner.take() {
            inner.complete(result);
        }
    }

    /// Another waiter handle for this producer's fence
    pub fn fence(&self) -> Option<Fence> {
        self.inner.as_ref().map(|inner| Fence {
            inner: Arc::clone(inner),
        })
    }

    pub fn seqno(&self) -> u64 {
        self.inner.as_ref().map(|i| i.seqno).unwrap_or(0)
    }
}

impl Drop for FenceProducer {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            warn!(
                "fence {}#{} dropped without signal, completing with error",
                inner.label, inner.seqno
            );
            inner.complete(Err(PipelineError::Abandoned));
        }
    }
}

impl fmt::Debug for FenceProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FenceProducer")
            .field("seqno", &self.seqno())
            .finish()
    }
}
