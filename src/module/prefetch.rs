//! Read-ahead on a worker thread.

use std::thread::JoinHandle;

use super::queue::{byte_queue, QueueReceiver};
use super::{panic_message, AbortHandle, ExtentModule, StageState};
use crate::error::{ExtentError, Result};
use crate::extent::Extent;

/// Pulls upstream on a dedicated thread, keeping up to `max_bytes` of
/// extents buffered. Order is preserved. If upstream panics on the worker,
/// the buffered extents are still delivered and the stream then ends with
/// [`ExtentError::WorkerPanicked`].
pub struct PrefetchBufferModule {
    upstream: Option<Box<dyn ExtentModule>>,
    max_bytes: usize,
    state: StageState,
    abort: AbortHandle,
    receiver: Option<QueueReceiver<Result<Extent>>>,
    worker: Option<JoinHandle<()>>,
}

impl PrefetchBufferModule {
    pub fn new(upstream: Box<dyn ExtentModule>, max_bytes: usize) -> Self {
        let abort = AbortHandle::new();
        if let Some(upstream_abort) = upstream.abort_handle() {
            abort.link(upstream_abort);
        }
        Self {
            upstream: Some(upstream),
            max_bytes,
            state: StageState::Unstarted,
            abort,
            receiver: None,
            worker: None,
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        let mut upstream = self
            .upstream
            .take()
            .ok_or_else(|| ExtentError::Usage("prefetch stage started twice".into()))?;
        let (sender, receiver) = byte_queue(self.max_bytes, self.abort.clone());
        let abort = self.abort.clone();
        let worker = std::thread::Builder::new()
            .name("extentdb-prefetch".into())
            .spawn(move || {
                while !abort.is_aborted() {
                    match upstream.get_extent() {
                        Ok(Some(extent)) => {
                            let bytes = extent.size_bytes();
                            if !sender.send(Ok(extent), bytes) {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            sender.send(Err(e), 0);
                            break;
                        }
                    }
                }
                tracing::debug!("prefetch worker finished");
            })?;
        self.receiver = Some(receiver);
        self.worker = Some(worker);
        Ok(())
    }

    fn join(&mut self) -> Result<()> {
        match self.worker.take().map(JoinHandle::join) {
            Some(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(panic = %message, "prefetch worker panicked");
                Err(ExtentError::WorkerPanicked(message))
            }
            _ => Ok(()),
        }
    }
}

impl ExtentModule for PrefetchBufferModule {
    fn get_extent(&mut self) -> Result<Option<Extent>> {
        if self.state == StageState::Exhausted {
            return Ok(None);
        }
        if self.abort.is_aborted() {
            self.state = StageState::Exhausted;
            return Ok(None);
        }
        if self.state == StageState::Unstarted {
            self.start()?;
            self.state = StageState::Active;
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

impl Drop for PrefetchBufferModule {
    fn drop(&mut self) {
        self.abort.abort();
        let _ = self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{collect_extents, VecModule};
    use crate::schema::TypeRegistry;
    use std::sync::Arc;

    fn extents(n: usize) -> Vec<Extent> {
        let schema = TypeRegistry::new()
            .register(r#"<ExtentType name="PF"><field type="int64" name="v"/></ExtentType>"#)
            .unwrap();
        (0..n)
            .map(|i| {
                let mut e = Extent::new(Arc::clone(&schema));
                e.create_rows(i + 1);
                e
            })
            .collect()
    }

    #[test]
    fn test_prefetch_preserves_order() {
        let input = extents(50);
        let mut prefetch = PrefetchBufferModule::new(Box::new(VecModule::new(input.clone())), 64);
        assert_eq!(prefetch.state(), StageState::Unstarted);
        let out = collect_extents(&mut prefetch).unwrap();
        assert_eq!(out, input);
        assert_eq!(prefetch.state(), StageState::Exhausted);
        assert!(prefetch.get_extent().unwrap().is_none());
    }

    #[test]
    fn test_abort_ends_stream() {
        let mut prefetch = PrefetchBufferModule::new(Box::new(VecModule::new(extents(100))), 16);
        assert!(prefetch.get_extent().unwrap().is_some());
        prefetch.abort_handle().unwrap().abort();
        assert!(prefetch.get_extent().unwrap().is_none());
    }

    #[test]
    fn test_drop_joins_blocked_worker() {
        let mut prefetch = PrefetchBufferModule::new(Box::new(VecModule::new(extents(100))), 1);
        assert!(prefetch.get_extent().unwrap().is_some());
        drop(prefetch);
    }

    #[test]
    fn test_upstream_panic_is_an_error() {
        struct Exploding(Vec<Extent>);
        impl ExtentModule for Exploding {
            fn get_extent(&mut self) -> Result<Option<Extent>> {
                if self.0.len() == 8 {
                    panic!("upstream failed on third pull");
                }
                Ok(self.0.pop())
            }
        }
        let mut prefetch = PrefetchBufferModule::new(Box::new(Exploding(extents(10))), 1 << 20);
        assert!(prefetch.get_extent().unwrap().is_some());
        assert!(prefetch.get_extent().unwrap().is_some());
        let err = prefetch.get_extent().unwrap_err();
        assert!(matches!(&err, ExtentError::WorkerPanicked(m) if m.contains("third pull")));
        assert_eq!(prefetch.state(), StageState::Exhausted);
        assert!(prefetch.get_extent().unwrap().is_none());
    }
}
