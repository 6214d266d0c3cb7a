//! Readout worker: the consumer side of a session.
//!
//! Runs on its own OS thread so a slow handler never occupies a reactor
//! thread. While the data socket is open it hands each queued chunk to the
//! [`ReadoutHandler`]; once the socket is reported closed it drains whatever
//! is left (the sentinel included) and exits. A reader that was cancelled
//! never queues its sentinel; the worker delivers one in its place so the
//! handler always sees the end of the session.
//!
//! A handler that returns an error or panics does not take the process
//! down. The fault is logged and counted, the data socket is closed so the
//! reader stops producing, and delivery of already-queued chunks continues
//! until the drain is done.

use crate::reader::SessionLink;
use dtacq_core::chunk::Chunk;
use dtacq_core::error::{AcqError, Result};
use dtacq_core::reactor::Reactor;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Name of the readout worker thread.
pub const WORKER_THREAD_NAME: &str = "dtacq-readout";

/// Receives every chunk of a readout session, including the final
/// zero-length sentinel.
///
/// Any state the handler needs is owned by the handler itself.
pub trait ReadoutHandler: Send + 'static {
    /// Process one chunk. An error ends the session.
    fn on_chunk(&mut self, chunk: Chunk) -> anyhow::Result<()>;
}

impl<F> ReadoutHandler for F
where
    F: FnMut(Chunk) -> anyhow::Result<()> + Send + 'static,
{
    fn on_chunk(&mut self, chunk: Chunk) -> anyhow::Result<()> {
        self(chunk)
    }
}

/// Default handler: counts samples and discards them.
#[derive(Debug, Clone, Default)]
pub struct SampleCounter {
    total: Arc<AtomicU64>,
}

impl SampleCounter {
    /// Count into a fresh total.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count into an existing total.
    pub fn with_total(total: Arc<AtomicU64>) -> Self {
        Self { total }
    }

    /// Samples counted so far.
    pub fn count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl ReadoutHandler for SampleCounter {
    fn on_chunk(&mut self, chunk: Chunk) -> anyhow::Result<()> {
        self.total.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Handle to a running worker thread.
#[derive(Debug)]
pub struct ReadoutWorker {
    handle: JoinHandle<()>,
}

impl ReadoutWorker {
    /// Start consuming `link.queue` on a new thread.
    ///
    /// `reactor` is used to close the data socket after a handler fault.
    pub fn spawn(
        handler: Box<dyn ReadoutHandler>,
        link: SessionLink,
        reactor: Reactor,
        poll_interval: Duration,
    ) -> Result<Self> {
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let mut delivery = Delivery {
                    handler,
                    link,
                    reactor,
                    faulted: false,
                };
                delivery.run(poll_interval);
            })?;

        Ok(Self { handle })
    }

    /// Thread the worker runs on.
    pub fn thread_id(&self) -> ThreadId {
        self.handle.thread().id()
    }

    /// True once the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker thread to exit.
    pub fn join(self) {
        if let Err(panic) = self.handle.join() {
            error!("Readout worker panicked: {}", panic_message(panic.as_ref()));
        }
    }
}

struct Delivery {
    handler: Box<dyn ReadoutHandler>,
    link: SessionLink,
    reactor: Reactor,
    faulted: bool,
}

impl Delivery {
    fn run(&mut self, poll_interval: Duration) {
        debug!("Readout worker started");

        let queue = Arc::clone(&self.link.queue);
        while self.link.open.load(Ordering::SeqCst) {
            queue.consume_timeout(poll_interval, |chunk| self.deliver(chunk));
        }

        // The reader queues the sentinel before clearing `open`
        let drained = queue.drain_all(|chunk| self.deliver(chunk));
        if !self.link.sentinel_queued() {
            debug!("Reader ended without a sentinel; delivering it from the worker");
            self.deliver(Chunk::empty(self.link.width));
        }

        debug!(drained, faulted = self.faulted, "Readout worker finished");
    }

    fn deliver(&mut self, chunk: Chunk) {
        let samples = chunk.len();
        trace!(samples, "Delivering chunk");

        let outcome = catch_unwind(AssertUnwindSafe(|| self.handler.on_chunk(chunk)));
        match outcome {
            Ok(Ok(())) => self.link.counters.record_delivery(samples),
            Ok(Err(e)) => self.fault(&format!("{:#}", e)),
            Err(panic) => self.fault(&panic_message(panic.as_ref())),
        }
    }

    fn fault(&mut self, message: &str) {
        self.link.counters.record_fault();
        let fault = AcqError::CallbackFault(message.to_string());
        warn!(error = %fault, kind = %fault.kind(), "Readout handler failed");

        if !self.faulted {
            self.faulted = true;
            debug!("Closing data socket after handler fault");
            self.link.close.request_via(&self.reactor);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
