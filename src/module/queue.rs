//! Byte-bounded multi-producer queue between pipeline threads.
//!
//! Items carry their size. Producers block while the queue holds at least
//! `limit` bytes, so the queue overshoots by at most one item per
//! producer. Every blocked party wakes on abort.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{select, Receiver, Sender};

use super::AbortHandle;

struct Budget {
    buffered: AtomicUsize,
    limit: usize,
    /// One pending "space freed" token.
    space_tx: Sender<()>,
    space_rx: Receiver<()>,
}

pub(crate) fn byte_queue<T>(limit: usize, abort: AbortHandle) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let (space_tx, space_rx) = crossbeam_channel::bounded(1);
    let budget = Arc::new(Budget {
        buffered: AtomicUsize::new(0),
        limit: limit.max(1),
        space_tx,
        space_rx,
    });
    (
        QueueSender {
            tx,
            budget: Arc::clone(&budget),
            abort: abort.clone(),
        },
        QueueReceiver { rx, budget, abort },
    )
}

pub(crate) struct QueueSender<T> {
    tx: Sender<(T, usize)>,
    budget: Arc<Budget>,
    abort: AbortHandle,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            budget: Arc::clone(&self.budget),
            abort: self.abort.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueue `item`, blocking while the queue is full. Returns `false`
    /// if the queue was aborted or the receiver is gone.
    pub(crate) fn send(&self, item: T, bytes: usize) -> bool {
        loop {
            if self.abort.is_aborted() {
                return false;
            }
            if self.budget.buffered.load(Ordering::Acquire) < self.budget.limit {
                break;
            }
            select! {
                recv(self.budget.space_rx) -> _ => {}
                recv(self.abort.signal()) -> _ => {}
            }
        }
        self.budget.buffered.fetch_add(bytes, Ordering::AcqRel);
        self.tx.send((item, bytes)).is_ok()
    }
}

pub(crate) struct QueueReceiver<T> {
    rx: Receiver<(T, usize)>,
    budget: Arc<Budget>,
    abort: AbortHandle,
}

impl<T> QueueReceiver<T> {
    /// Next item; `None` once every sender is gone and the queue is
    /// drained, or on abort.
    pub(crate) fn recv(&self) -> Option<T> {
        if self.abort.is_aborted() {
            return None;
        }
        let (item, bytes) = select! {
            recv(self.rx) -> msg => msg.ok()?,
            recv(self.abort.signal()) -> _ => return None,
        };
        self.budget.buffered.fetch_sub(bytes, Ordering::AcqRel);
        let _ = self.budget.space_tx.try_send(());
        Some(item)
    }

    pub(crate) fn buffered_bytes(&self) -> usize {
        self.budget.buffered.load(Ordering::Acquire)
    }
}
