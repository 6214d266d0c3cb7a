//! Readout session lifecycle.
//!
//! ```text
//! Idle ──start──▶ Starting ──connected──▶ Running
//!  ▲                 │                       │
//!  └──connect failed─┘                     stop
//!  ▲                                         ▼
//!  └─────────────worker joined───────── Stopping
//! ```
//!
//! A controller owns at most one session. Starting a new session stops the
//! previous one completely first, so two workers never run for the same
//! device. The session lock is only held across start/stop transitions;
//! [`ReadoutController::is_running`] and [`ReadoutController::state`] never
//! wait on it.

use crate::reader::{CloseSignal, SampleSource, SessionLink, StreamingReader};
use crate::stats::{ReadoutCounters, ReadoutStats};
use crate::worker::{ReadoutHandler, ReadoutWorker};
use dtacq_core::chunk::SampleWidth;
use dtacq_core::config::{DeviceConfig, DEFAULT_QUEUE_CAPACITY};
use dtacq_core::error::Result;
use dtacq_core::reactor::Reactor;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of a [`ReadoutController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadoutState {
    /// No data socket, no worker.
    #[default]
    Idle,
    /// Data socket connecting.
    Starting,
    /// Reader and worker active.
    Running,
    /// Close requested, worker draining.
    Stopping,
}

impl std::fmt::Display for ReadoutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ReadoutState::Idle => "idle",
            ReadoutState::Starting => "starting",
            ReadoutState::Running => "running",
            ReadoutState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// Sizing of each session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Queue capacity in chunks
    pub queue_capacity: usize,
    /// Worker wake-up period while waiting for data
    pub poll_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl From<&DeviceConfig> for ControllerSettings {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            poll_interval: config.poll_interval,
        }
    }
}

struct ReadoutSession {
    link: SessionLink,
    worker: ReadoutWorker,
    reader: JoinHandle<()>,
}

/// Lets a stop issued from inside the handler find its own session.
struct WorkerContext {
    thread: ThreadId,
    close: CloseSignal,
}

/// Start/stop state machine over one data socket, reader and worker.
pub struct ReadoutController {
    reactor: Reactor,
    settings: ControllerSettings,
    session: Mutex<Option<ReadoutSession>>,
    worker: Mutex<Option<WorkerContext>>,
    state: RwLock<ReadoutState>,
    open: Arc<AtomicBool>,
    counters: Arc<ReadoutCounters>,
}

impl ReadoutController {
    /// Create an idle controller running its sockets on `reactor`.
    pub fn new(reactor: Reactor, settings: ControllerSettings) -> Self {
        Self {
            reactor,
            settings,
            session: Mutex::new(None),
            worker: Mutex::new(None),
            state: RwLock::new(ReadoutState::Idle),
            open: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(ReadoutCounters::default()),
        }
    }

    /// Start a session.
    ///
    /// Stops any active session, then resolves `connect` on the reactor to
    /// open the data socket. Returns once the reader and worker are running;
    /// it does not wait for data. If `connect` fails the controller is left
    /// idle and the error is returned.
    pub fn start<C>(
        &self,
        connect: C,
        handler: Box<dyn ReadoutHandler>,
        width: SampleWidth,
        buffer_size: usize,
    ) -> Result<()>
    where
        C: Future<Output = Result<Box<dyn SampleSource>>> + Send,
    {
        let mut session = self.session.lock();
        if let Some(previous) = session.take() {
            debug!("Stopping previous readout session");
            self.shutdown(previous);
        }

        self.set_state(ReadoutState::Starting);
        self.counters.reset();

        let source = match self.reactor.block_on(connect) {
            Ok(Ok(source)) => source,
            Ok(Err(e)) | Err(e) => {
                self.set_state(ReadoutState::Idle);
                return Err(e);
            }
        };

        let link = SessionLink::new(
            self.settings.queue_capacity,
            width,
            Arc::clone(&self.open),
            Arc::clone(&self.counters),
        );
        self.open.store(true, Ordering::SeqCst);

        let worker = match ReadoutWorker::spawn(
            handler,
            link.clone(),
            self.reactor.clone(),
            self.settings.poll_interval,
        ) {
            Ok(worker) => worker,
            Err(e) => {
                self.open.store(false, Ordering::SeqCst);
                self.set_state(ReadoutState::Idle);
                return Err(e);
            }
        };

        let reader = StreamingReader::new(source, buffer_size, link.clone());
        let buffer = reader.buffer_len();
        let reader = match self.reactor.post(reader.run()) {
            Ok(task) => task,
            Err(e) => {
                // The reader never ran; its socket went with the rejected task
                self.open.store(false, Ordering::SeqCst);
                link.queue.close();
                worker.join();
                self.set_state(ReadoutState::Idle);
                return Err(e);
            }
        };

        *self.worker.lock() = Some(WorkerContext {
            thread: worker.thread_id(),
            close: link.close.clone(),
        });
        *session = Some(ReadoutSession {
            link,
            worker,
            reader,
        });
        self.set_state(ReadoutState::Running);

        info!(
            %width,
            buffer,
            queue_capacity = self.settings.queue_capacity,
            "Readout started"
        );
        Ok(())
    }

    /// Stop the active session and wait for its worker to drain and exit.
    ///
    /// No-op when idle. Called from inside the session's own handler, it only
    /// requests the close; the session finishes once the handler returns and
    /// is reaped by the next `stop` or `start`.
    pub fn stop(&self) {
        if let Some(close) = self.own_worker_close() {
            debug!("Stop requested from readout handler");
            close.request_via(&self.reactor);
            return;
        }

        let mut session = self.session.lock();
        if let Some(active) = session.take() {
            self.shutdown(active);
        }
    }

    /// True while the data socket is open.
    pub fn is_running(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    ///
    /// A session whose data socket has already closed (device hung up,
    /// handler fault) reports `Stopping` until it is reaped by `stop`.
    pub fn state(&self) -> ReadoutState {
        match *self.state.read() {
            ReadoutState::Running if !self.is_running() => ReadoutState::Stopping,
            state => state,
        }
    }

    /// Counters of the current (or last) session.
    pub fn stats(&self) -> ReadoutStats {
        self.counters.snapshot()
    }

    /// Session sizing.
    pub fn settings(&self) -> ControllerSettings {
        self.settings
    }

    fn shutdown(&self, session: ReadoutSession) {
        self.set_state(ReadoutState::Stopping);
        session.link.close.request_via(&self.reactor);

        if session.worker.thread_id() == thread::current().id() {
            warn!("Readout session stopped from its own handler; not joining worker");
        } else {
            session.worker.join();
        }
        *self.worker.lock() = None;

        session.link.queue.close();
        // Returns promptly: the reader clears `open` as its last step
        if let Err(e) = self.reactor.block_on(session.reader) {
            debug!(error = %e, "Reader task not awaited");
        }
        self.counters.mark_stopped();
        self.set_state(ReadoutState::Idle);

        let stats = self.counters.snapshot();
        info!(
            bytes = stats.bytes_read,
            chunks = stats.chunks_produced,
            samples = stats.samples_delivered,
            faults = stats.callback_faults,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "Readout stopped"
        );
    }

    fn own_worker_close(&self) -> Option<CloseSignal> {
        let worker = self.worker.lock();
        worker
            .as_ref()
            .filter(|ctx| ctx.thread == thread::current().id())
            .map(|ctx| ctx.close.clone())
    }

    fn set_state(&self, state: ReadoutState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(from = %*current, to = %state, "Readout state");
            *current = state;
        }
    }
}

impl Drop for ReadoutController {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ReadoutController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadoutController")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .field("settings", &self.settings)
            .finish()
    }
}
