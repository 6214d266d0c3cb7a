//! Data channel reader.
//!
//! The reader runs as a task on the [`Reactor`]. It keeps one read armed on
//! the data socket at all times, turns every completed read into a [`Chunk`]
//! and pushes it onto the session queue, waiting while the queue is full.
//!
//! The loop ends on the first read error or when the session's
//! [`CloseSignal`] fires. Either way the socket is dropped, exactly one
//! zero-length sentinel chunk is queued, and only then is the session marked
//! closed. The worker relies on that ordering: once it sees the socket closed,
//! a final drain is guaranteed to include the sentinel. If the task is
//! cancelled before it gets that far (the reactor shut down under it), the
//! session's `sentinel_queued` flag stays clear and the worker delivers the
//! sentinel itself.

use crate::stats::ReadoutCounters;
use async_trait::async_trait;
use dtacq_core::chunk::{Chunk, SampleWidth, WordAssembler};
use dtacq_core::error::{AcqError, Result};
use dtacq_core::queue::BoundedQueue;
use dtacq_core::reactor::Reactor;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

// =============================================================================
// Close Signal
// =============================================================================

/// Request to close a session's data socket.
///
/// Closing the socket is the only cancellation mechanism in the readout
/// path; the reader observes the request and unwinds through its normal
/// error path.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSignal {
    /// A signal that has not fired.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Idempotent.
    pub fn request(&self) {
        self.tx.send_replace(true);
    }

    /// True once [`request`](Self::request) has been called.
    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal fires.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once the flag is set
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Fire the signal from a reactor task so the socket is only ever
    /// touched from reactor context.
    ///
    /// Falls back to firing directly if the reactor has shut down.
    pub fn request_via(&self, reactor: &Reactor) {
        let signal = self.clone();
        if reactor.post(async move { signal.request() }).is_err() {
            self.request();
        }
    }
}

// =============================================================================
// Sample Source
// =============================================================================

/// Byte stream feeding a [`StreamingReader`] (allows mock injection).
///
/// `Ok(0)` is a legitimate empty delivery, not end of stream. Sources signal
/// the end of the stream with an error.
#[async_trait]
pub trait SampleSource: Send {
    /// Read whatever is available into `buf`, waiting for at least one delivery.
    async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// The device's streaming TCP connection.
#[derive(Debug)]
pub struct DataSocket {
    stream: TcpStream,
    peer: SocketAddr,
}

impl DataSocket {
    /// Connect to the streaming port at `addr`.
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Self> {
        let endpoint = addr.to_string();
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| AcqError::Connection {
                endpoint: endpoint.clone(),
                source: io::Error::from(io::ErrorKind::TimedOut),
            })?
            .map_err(|source| AcqError::Connection {
                endpoint: endpoint.clone(),
                source,
            })?;

        stream.set_nodelay(true)?;
        info!(peer = %addr, "Connected to digitizer data channel");

        Ok(Self { stream, peer: addr })
    }

    /// Address of the streaming endpoint.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl SampleSource for DataSocket {
    async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.read(buf).await?;
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "device closed the data stream",
            ));
        }
        Ok(n)
    }
}

// =============================================================================
// Streaming Reader
// =============================================================================

/// Handles shared by the reader, the worker and the controller for one session.
#[derive(Debug, Clone)]
pub struct SessionLink {
    /// Reader-to-worker handoff
    pub queue: Arc<BoundedQueue<Chunk>>,
    /// Sample width of every chunk in this session
    pub width: SampleWidth,
    /// True while the data socket is open
    pub open: Arc<AtomicBool>,
    /// Set by the reader once the sentinel is on the queue
    pub sentinel_queued: Arc<AtomicBool>,
    /// Requests the data socket be closed
    pub close: CloseSignal,
    /// Session counters
    pub counters: Arc<ReadoutCounters>,
}

impl SessionLink {
    /// Fresh session state over a queue of `queue_capacity` chunks.
    ///
    /// `open` is shared so the owner can observe the socket after the
    /// session is gone; it is not modified here.
    pub fn new(
        queue_capacity: usize,
        width: SampleWidth,
        open: Arc<AtomicBool>,
        counters: Arc<ReadoutCounters>,
    ) -> Self {
        Self {
            queue: Arc::new(BoundedQueue::new(queue_capacity)),
            width,
            open,
            sentinel_queued: Arc::new(AtomicBool::new(false)),
            close: CloseSignal::new(),
            counters,
        }
    }

    /// True once the reader has queued the end-of-stream sentinel.
    pub fn sentinel_queued(&self) -> bool {
        self.sentinel_queued.load(Ordering::SeqCst)
    }
}

/// Clears the open flag when the reader finishes or its task is cancelled.
struct OpenGuard(Arc<AtomicBool>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Continuously re-armed read loop over one data socket.
pub struct StreamingReader {
    source: Box<dyn SampleSource>,
    assembler: WordAssembler,
    buffer: Vec<u8>,
    link: SessionLink,
}

impl StreamingReader {
    /// Build a reader with a receive buffer of `buffer_size` bytes.
    ///
    /// The buffer is rounded down to whole words of `link.width`, and holds
    /// at least one.
    pub fn new(source: Box<dyn SampleSource>, buffer_size: usize, link: SessionLink) -> Self {
        let width = link.width;
        let words = (buffer_size / width.bytes()).max(1);
        Self {
            source,
            assembler: WordAssembler::new(width),
            buffer: vec![0; words * width.bytes()],
            link,
        }
    }

    /// Size of the receive buffer in bytes.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Read until the socket fails or a close is requested.
    pub async fn run(self) {
        let Self {
            mut source,
            mut assembler,
            mut buffer,
            link,
        } = self;
        let open = OpenGuard(Arc::clone(&link.open));
        let width = assembler.width();

        debug!(buffer = buffer.len(), %width, "Streaming reader started");

        loop {
            let read = tokio::select! {
                biased;
                _ = link.close.closed() => {
                    debug!("Data socket close requested");
                    break;
                }
                read = source.read_some(&mut buffer) => read,
            };

            match read {
                Ok(n) => {
                    let chunk = assembler.assemble(&buffer[..n]);
                    assert_eq!(chunk.width(), width, "chunk width differs from device width");
                    link.counters.record_read(n);
                    trace!(bytes = n, samples = chunk.len(), "Chunk read");

                    if link.queue.push(chunk).await.is_err() {
                        debug!("Queue closed under the reader");
                        break;
                    }
                }
                Err(e) => {
                    let eof = e.kind() == io::ErrorKind::UnexpectedEof;
                    let closed = AcqError::StreamClosed(e);
                    if eof {
                        info!(error = %closed, "Device closed the data stream");
                    } else {
                        warn!(error = %closed, "Data socket read failed");
                    }
                    break;
                }
            }
        }

        drop(source);
        if assembler.pending() > 0 {
            debug!(bytes = assembler.pending(), "Discarding partial word at end of stream");
        }

        match link.queue.push(Chunk::empty(width)).await {
            Ok(()) => link.sentinel_queued.store(true, Ordering::SeqCst),
            Err(_) => debug!("Queue closed before the sentinel was queued"),
        }
        link.counters.mark_stopped();
        drop(open);

        let stats = link.counters.snapshot();
        debug!(
            bytes = stats.bytes_read,
            chunks = stats.chunks_produced,
            "Streaming reader finished"
        );
    }
}

impl std::fmt::Debug for StreamingReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingReader")
            .field("width", &self.assembler.width())
            .field("buffer", &self.buffer.len())
            .finish()
    }
}
