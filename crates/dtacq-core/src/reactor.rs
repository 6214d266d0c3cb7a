//! Shared asynchronous I/O service.
//!
//! Socket reads, writes and closes run as tasks on a tokio multi-thread
//! runtime owned by a [`Reactor`]. One process-wide instance
//! ([`Reactor::global`]) is shared by every device; tests and embedding
//! applications can inject their own.
//!
//! The reactor exposes three operations:
//! - [`post`](Reactor::post) schedules a task on a reactor thread.
//! - [`block_on`](Reactor::block_on) lets a synchronous caller wait for a
//!   future. The caller's thread is suspended; reactor threads are not.
//! - [`shutdown`](Reactor::shutdown) stops the runtime. Later calls fail with
//!   [`AcqError::ReactorShutdown`].

use crate::error::{AcqError, Result};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Worker threads used by the process-wide reactor.
pub const DEFAULT_REACTOR_THREADS: usize = 2;

static GLOBAL: OnceCell<Reactor> = OnceCell::new();

struct Inner {
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    shutdown: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

/// Cloneable handle to an I/O runtime.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

impl Reactor {
    /// Build a private reactor with `threads` worker threads.
    pub fn new(threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("dtacq-reactor")
            .enable_all()
            .build()?;

        debug!(threads = threads.max(1), "Started reactor");

        Ok(Self {
            inner: Arc::new(Inner {
                handle: runtime.handle().clone(),
                runtime: Mutex::new(Some(runtime)),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// The process-wide reactor, created on first use.
    pub fn global() -> Result<Self> {
        GLOBAL
            .get_or_try_init(|| Reactor::new(DEFAULT_REACTOR_THREADS))
            .cloned()
    }

    /// Runtime handle, for code that needs to spawn directly.
    pub fn handle(&self) -> Result<Handle> {
        self.ensure_running()?;
        Ok(self.inner.handle.clone())
    }

    /// Schedule `task` on a reactor thread.
    pub fn post<F>(&self, task: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.ensure_running()?;
        Ok(self.inner.handle.spawn(task))
    }

    /// Run `future` to completion on the calling thread.
    ///
    /// Safe to call from plain threads and from inside another tokio runtime.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send,
        F::Output: Send,
    {
        self.ensure_running()?;
        let handle = &self.inner.handle;

        match Handle::try_current().map(|h| h.runtime_flavor()) {
            Err(_) => Ok(handle.block_on(future)),
            Ok(RuntimeFlavor::MultiThread) => {
                Ok(tokio::task::block_in_place(|| handle.block_on(future)))
            }
            // A current-thread runtime cannot be blocked; hop to a helper thread.
            Ok(_) => std::thread::scope(|scope| {
                scope
                    .spawn(|| handle.block_on(future))
                    .join()
                    .map_err(|_| AcqError::Io(std::io::Error::other("block_on helper panicked")))
            }),
        }
    }

    /// Stop the runtime. Outstanding tasks are cancelled.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(runtime) = self.inner.runtime.lock().take() {
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(Duration::from_secs(1));
            }
        }
        info!("Reactor shut down");
    }

    /// True after [`shutdown`](Self::shutdown).
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            Err(AcqError::ReactorShutdown)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
