//! Pull-based pipeline stages.
//!
//! Every stage implements [`ExtentModule`]: each call hands back the next
//! extent (ownership moves to the caller) or `None` at end of stream.
//! Stages own their upstream, so dropping the tail of a chain tears the
//! chain down from the tail towards the source.
//!
//! ```text
//! Unstarted --first get_extent--> Active --end of stream / error--> Exhausted
//! ```
//!
//! Threaded stages start their workers on the first pull. An error from
//! upstream is returned once; the stage is exhausted afterwards. A worker
//! panic ends the stream with
//! [`ExtentError::WorkerPanicked`](crate::ExtentError::WorkerPanicked), never
//! with a normal end of stream.

mod parallel_filter;
mod prefetch;
pub(crate) mod queue;
mod record_filter;
mod sequence;
mod sort;
mod source;
mod type_filter;
mod vec_source;

pub use parallel_filter::{ExtentTransform, ParallelFilterModule};
pub use prefetch::PrefetchBufferModule;
pub use record_filter::{RecordFilterModule, RowPredicate};
pub use sequence::SequenceModule;
pub use sort::{RowComparator, SortModule};
pub use source::FileSourceModule;
pub use type_filter::{TypeFilterModule, TypePredicate};
pub use vec_source::VecModule;

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use crate::error::Result;
use crate::extent::Extent;

// ── ExtentModule ────────────────────────────────────────────────────

pub trait ExtentModule: Send {
    /// Next extent, or `None` once the stream is exhausted. Calls after
    /// exhaustion keep returning `None`.
    fn get_extent(&mut self) -> Result<Option<Extent>>;

    /// Signal that stops this stage (and the stages it owns) when fired.
    fn abort_handle(&self) -> Option<AbortHandle> {
        None
    }
}

impl ExtentModule for Box<dyn ExtentModule> {
    fn get_extent(&mut self) -> Result<Option<Extent>> {
        (**self).get_extent()
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        (**self).abort_handle()
    }
}

/// Pull every remaining extent.
pub fn collect_extents(module: &mut dyn ExtentModule) -> Result<Vec<Extent>> {
    let mut out = Vec::new();
    while let Some(extent) = module.get_extent()? {
        out.push(extent);
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageState {
    #[default]
    Unstarted,
    Active,
    Exhausted,
}

impl StageState {
    /// Advance on the outcome of one pull.
    pub(crate) fn observe(&mut self, result: &Result<Option<Extent>>) {
        *self = match result {
            Ok(Some(_)) => StageState::Active,
            _ => StageState::Exhausted,
        };
    }
}

/// Text of a panic payload returned by `JoinHandle::join`.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ── AbortHandle ─────────────────────────────────────────────────────

struct AbortInner {
    aborted: AtomicBool,
    /// Dropped on abort, which disconnects `signal` for every waiter.
    wake: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
    children: Mutex<Vec<AbortHandle>>,
}

/// Cloneable cancellation flag that also wakes threads blocked in a
/// `select!` on [`signal`](Self::signal).
#[derive(Clone)]
pub struct AbortHandle {
    inner: Arc<AbortInner>,
}

impl AbortHandle {
    pub fn new() -> Self {
        let (wake, signal) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(AbortInner {
                aborted: AtomicBool::new(false),
                wake: Mutex::new(Some(wake)),
                signal,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn abort(&self) {
        if self.inner.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.wake.lock().unwrap().take();
        let children = std::mem::take(&mut *self.inner.children.lock().unwrap());
        for child in children {
            child.abort();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// Receiver that becomes ready (disconnected) once aborted.
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }

    /// Abort `child` whenever this handle aborts.
    pub fn link(&self, child: AbortHandle) {
        let mut children = self.inner.children.lock().unwrap();
        if self.is_aborted() {
            drop(children);
            child.abort();
            return;
        }
        children.push(child);
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortHandle")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_abort_wakes_waiters() {
        let handle = AbortHandle::new();
        let waiter = handle.clone();
        let thread = std::thread::spawn(move || {
            crossbeam_channel::select! {
                recv(waiter.signal()) -> _ => waiter.is_aborted(),
                default(Duration::from_secs(10)) => false,
            }
        });
        std::thread::sleep(Duration::from_millis(20));
        handle.abort();
        assert!(thread.join().unwrap());
    }

    #[test]
    fn test_abort_propagates_to_children() {
        let parent = AbortHandle::new();
        let child = AbortHandle::new();
        parent.link(child.clone());
        assert!(!child.is_aborted());
        parent.abort();
        assert!(child.is_aborted());

        let late = AbortHandle::new();
        parent.link(late.clone());
        assert!(late.is_aborted());
    }

    #[test]
    fn test_stage_state_observe() {
        let mut state = StageState::default();
        assert_eq!(state, StageState::Unstarted);
        state.observe(&Ok(None));
        assert_eq!(state, StageState::Exhausted);
    }
}
