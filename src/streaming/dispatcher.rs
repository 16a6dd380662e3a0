use std::io;
use std::sync::Arc;

use crate::streaming::PageSource;

/// Bulk read issued for one pending page
#[derive(Debug)]
pub struct ReadRequest {
    pub ticket: u64,
    pub source: Arc<dyn PageSource>,
    pub offset: u64,
    pub len: usize,
}

impl ReadRequest {
    /// Perform the read on the current thread
    pub fn execute(self) -> ReadCompletion {
        let mut buffer = vec![0u8; self.len];
        let result = self.source.read_at(self.offset, &mut buffer).map(|_| buffer);
        ReadCompletion {
            ticket: self.ticket,
            result,
        }
    }
}

/// Outcome of a read, delivered exactly once per ticket
#[derive(Debug)]
pub struct ReadCompletion {
    pub ticket: u64,
    pub result: io::Result<Vec<u8>>,
}

/// Executes bulk reads and posts their completions to a channel drained by `end_update`
pub trait ReadDispatcher: Send {
    fn dispatch(&self, request: ReadRequest, completions: flume::Sender<ReadCompletion>);
}

/// Reads synchronously on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl ReadDispatcher for InlineDispatcher {
    fn dispatch(&self, request: ReadRequest, completions: flume::Sender<ReadCompletion>) {
        // Receiver lives as long as the pipeline; a send failure means it is shutting down
        let _ = completions.send(request.execute());
    }
}

/// Reads on the blocking pool of a dedicated tokio runtime
#[cfg(feature = "native")]
pub struct TokioDispatcher {
    runtime: Option<tokio::runtime::Runtime>,
}

#[cfg(feature = "native")]
impl TokioDispatcher {
    pub fn new(worker_threads: usize) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(worker_threads.max(1))
            .thread_name("page-streamer-io")
            .build()?;
        log::info!("[TokioDispatcher] Started with {} IO threads", worker_threads);
        Ok(Self { runtime: Some(runtime) })
    }
}

#[cfg(feature = "native")]
impl ReadDispatcher for TokioDispatcher {
    fn dispatch(&self, request: ReadRequest, completions: flume::Sender<ReadCompletion>) {
        match &self.runtime {
            Some(runtime) => {
                runtime.spawn_blocking(move || {
                    let _ = completions.send(request.execute());
                });
            }
            None => {
                let _ = completions.send(ReadCompletion {
                    ticket: request.ticket,
                    result: Err(io::Error::new(io::ErrorKind::Other, "dispatcher is shut down")),
                });
            }
        }
    }
}

#[cfg(feature = "native")]
impl Drop for TokioDispatcher {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Outstanding reads are abandoned; their completions have nowhere to go
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::MemorySource;

    #[test]
    fn test_inline_dispatch_completes_immediately() {
        let (tx, rx) = flume::unbounded();
        let source: Arc<dyn PageSource> = Arc::new(MemorySource::new(vec![1, 2, 3, 4, 5]));
        InlineDispatcher.dispatch(
            ReadRequest {
                ticket: 9,
                source: source.clone(),
                offset: 1,
                len: 3,
            },
            tx.clone(),
        );
        InlineDispatcher.dispatch(
            ReadRequest {
                ticket: 10,
                source,
                offset: 4,
                len: 3,
            },
            tx,
        );

        let first = rx.try_recv().expect("first completion");
        assert_eq!(first.ticket, 9);
        assert_eq!(first.result.expect("read succeeded"), vec![2, 3, 4]);

        let second = rx.try_recv().expect("second completion");
        assert!(second.result.is_err());
    }

    #[cfg(feature = "native")]
    #[test]
    fn test_tokio_dispatch_delivers() {
        let dispatcher = TokioDispatcher::new(2).expect("Failed to start dispatcher");
        let (tx, rx) = flume::unbounded();
        let source: Arc<dyn PageSource> = Arc::new(MemorySource::new(vec![7; 64]));
        for ticket in 0..8 {
            dispatcher.dispatch(
                ReadRequest {
                    ticket,
                    source: source.clone(),
                    offset: ticket * 8,
                    len: 8,
                },
                tx.clone(),
            );
        }

        let mut tickets: Vec<u64> = (0..8)
            .map(|_| {
                let completion = rx
                    .recv_timeout(std::time::Duration::from_secs(5))
                    .expect("completion within timeout");
                assert_eq!(completion.result.expect("read succeeded"), vec![7; 8]);
                completion.ticket
            })
            .collect();
        tickets.sort_unstable();
        assert_eq!(tickets, (0..8).collect::<Vec<_>>());
    }
}
