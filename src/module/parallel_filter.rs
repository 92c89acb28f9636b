//! Fan-out of one upstream to a pool of transform workers.
//!
//! Workers take turns pulling from the shared upstream, transform what
//! they pulled without holding the lock, and push results into one
//! byte-bounded queue. Output order is whatever order the workers finish
//! in; use this only for transforms whose result does not depend on
//! extent order. A panic in any worker surfaces as
//! [`ExtentError::WorkerPanicked`] once the queue drains.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::queue::{byte_queue, QueueReceiver};
use super::record_filter::filter_rows;
use super::{panic_message, AbortHandle, ExtentModule, StageState};
use crate::error::{ExtentError, Result};
use crate::extent::{Extent, FieldValue, GeneralField};

/// Per-extent work; `Ok(None)` drops the extent.
pub type ExtentTransform = Arc<dyn Fn(Extent) -> Result<Option<Extent>> + Send + Sync>;

pub struct ParallelFilterModule {
    upstream: Option<Box<dyn ExtentModule>>,
    transform: ExtentTransform,
    threads: usize,
    queue_bytes: usize,
    state: StageState,
    abort: AbortHandle,
    receiver: Option<QueueReceiver<Result<Extent>>>,
    workers: Vec<JoinHandle<()>>,
}

impl ParallelFilterModule {
    pub fn new<F>(upstream: Box<dyn ExtentModule>, threads: usize, queue_bytes: usize, transform: F) -> Self
    where
        F: Fn(Extent) -> Result<Option<Extent>> + Send + Sync + 'static,
    {
        let abort = AbortHandle::new();
        if let Some(upstream_abort) = upstream.abort_handle() {
            abort.link(upstream_abort);
        }
        Self {
            upstream: Some(upstream),
            transform: Arc::new(transform),
            threads: threads.max(1),
            queue_bytes,
            state: StageState::Unstarted,
            abort,
            receiver: None,
            workers: Vec::new(),
        }
    }

    /// Parallel form of [`RecordFilterModule::new`](super::RecordFilterModule::new):
    /// keeps rows whose `field` satisfies `predicate`, dropping extents
    /// with no match.
    pub fn row_filter<P>(
        upstream: Box<dyn ExtentModule>,
        threads: usize,
        queue_bytes: usize,
        field: &str,
        predicate: P,
    ) -> Self
    where
        P: for<'a> Fn(&FieldValue<'a>) -> bool + Send + Sync + 'static,
    {
        let field = field.to_string();
        Self::new(upstream, threads, queue_bytes, move |extent| {
            let accessor = GeneralField::bound(extent.schema(), &field)?;
            let out = filter_rows(&extent, &accessor, &predicate);
            Ok((!out.is_empty()).then_some(out))
        })
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        let upstream = self
            .upstream
            .take()
            .ok_or_else(|| ExtentError::Usage("parallel filter started twice".into()))?;
        let upstream = Arc::new(Mutex::new(upstream));
        let (sender, receiver) = byte_queue(self.queue_bytes, self.abort.clone());

        for i in 0..self.threads {
            let upstream = Arc::clone(&upstream);
            let sender = sender.clone();
            let transform = Arc::clone(&self.transform);
            let abort = self.abort.clone();
            let worker = std::thread::Builder::new()
                .name(format!("extentdb-filter-{}", i))
                .spawn(move || {
                    while !abort.is_aborted() {
                        let next = match upstream.lock() {
                            Ok(mut guard) => guard.get_extent(),
                            Err(_) => Err(ExtentError::WorkerPanicked(
                                "another worker panicked while pulling upstream".into(),
                            )),
                        };
                        let result = match next {
                            Ok(Some(extent)) => transform(extent),
                            Ok(None) => break,
                            Err(e) => Err(e),
                        };
                        match result {
                            Ok(Some(extent)) => {
                                let bytes = extent.size_bytes();
                                if !sender.send(Ok(extent), bytes) {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                sender.send(Err(e), 0);
                                break;
                            }
                        }
                    }
                })?;
            self.workers.push(worker);
        }
        tracing::debug!(threads = self.threads, "started parallel filter");
        self.receiver = Some(receiver);
        Ok(())
    }

    /// Wait for every worker; reports the last panic, if any.
    fn join(&mut self) -> Result<()> {
        let mut panicked = None;
        for worker in self.workers.drain(..) {
            if let Err(payload) = worker.join() {
                let message = panic_message(payload.as_ref());
                tracing::error!(panic = %message, "parallel filter worker panicked");
                panicked = Some(message);
            }
        }
        match panicked {
            Some(message) => Err(ExtentError::WorkerPanicked(message)),
            None => Ok(()),
        }
    }
}

impl ExtentModule for ParallelFilterModule {
    fn get_extent(&mut self) -> Result<Option<Extent>> {
        if self.state == StageState::Exhausted {
            return Ok(None);
        }
        if self.abort.is_aborted() {
            self.state = StageState::Exhausted;
            return Ok(None);
        }
        if self.state == StageState::Unstarted {
            self.state = StageState::Active;
            if let Err(e) = self.start() {
                self.state = StageState::Exhausted;
                self.abort.abort();
                let _ = self.join();
                return Err(e);
            }
        }
        let mut next = match self.receiver.as_ref().and_then(|r| r.recv()) {
            Some(Ok(extent)) => Ok(Some(extent)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        };
        self.state.observe(&next);
        if self.state == StageState::Exhausted {
            self.abort.abort();
            let joined = self.join();
            if let (Ok(None), Err(e)) = (&next, joined) {
                next = Err(e);
            }
        }
        next
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        Some(self.abort.clone())
    }
}

impl Drop for ParallelFilterModule {
    fn drop(&mut self) {
        self.abort.abort();
        let _ = self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{ExtentSeries, Int64Field};
    use crate::module::{collect_extents, VecModule};
    use crate::schema::TypeRegistry;

    fn input() -> Vec<Extent> {
        let schema = TypeRegistry::new()
            .register(r#"<ExtentType name="PFil"><field type="int64" name="v"/></ExtentType>"#)
            .unwrap();
        let v = Int64Field::bound(&schema, "v").unwrap();
        (0..20)
            .map(|e| {
                let mut s = ExtentSeries::for_schema(Arc::clone(&schema));
                for i in 0..50 {
                    s.new_row();
                    v.set(&mut s, e * 50 + i);
                }
                s.take_extent().unwrap()
            })
            .collect()
    }

    fn values(extents: &[Extent]) -> Vec<i64> {
        let mut out = Vec::new();
        for extent in extents {
            let v = Int64Field::bound(extent.schema(), "v").unwrap();
            let mut s = ExtentSeries::with_extent(extent.clone());
            while s.more() {
                out.push(v.get(&s));
                s.next_row();
            }
        }
        out.sort();
        out
    }

    #[test]
    fn test_row_filter_matches_serial_result() {
        let mut parallel = ParallelFilterModule::row_filter(
            Box::new(VecModule::new(input())),
            4,
            1024,
            "v",
            |v| v.as_i64().is_some_and(|v| v % 7 == 0),
        );
        let got = values(&collect_extents(&mut parallel).unwrap());
        let expected: Vec<i64> = (0..1000).filter(|v| v % 7 == 0).collect();
        assert_eq!(got, expected);
        assert!(parallel.get_extent().unwrap().is_none());
    }

    #[test]
    fn test_transform_error_is_reported_once() {
        let mut parallel = ParallelFilterModule::new(Box::new(VecModule::new(input())), 3, 1 << 20, |_| {
            Err(ExtentError::Usage("boom".into()))
        });
        assert!(parallel.get_extent().is_err());
        assert!(parallel.get_extent().unwrap().is_none());
    }

    #[test]
    fn test_worker_panic_is_an_error() {
        for threads in [1, 3] {
            let mut parallel =
                ParallelFilterModule::new(Box::new(VecModule::new(input())), threads, 1 << 20, |extent| {
                    let v = Int64Field::bound(extent.schema(), "v")?;
                    if v.get(&ExtentSeries::with_extent(extent.clone())) == 150 {
                        panic!("transform failed on extent 3");
                    }
                    Ok(Some(extent))
                });
            let err = collect_extents(&mut parallel).unwrap_err();
            assert!(matches!(&err, ExtentError::WorkerPanicked(m) if m.contains("extent 3")));
            assert!(parallel.get_extent().unwrap().is_none());
        }
    }

    #[test]
    fn test_upstream_panic_is_an_error() {
        struct Exploding(usize);
        impl ExtentModule for Exploding {
            fn get_extent(&mut self) -> Result<Option<Extent>> {
                self.0 += 1;
                if self.0 == 4 {
                    panic!("upstream failed");
                }
                Ok(input().pop())
            }
        }
        let mut parallel = ParallelFilterModule::new(Box::new(Exploding(0)), 2, 1 << 20, |e| Ok(Some(e)));
        let err = collect_extents(&mut parallel).unwrap_err();
        assert!(matches!(err, ExtentError::WorkerPanicked(_)));
    }
}
