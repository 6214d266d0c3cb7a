//! Core types for D-TACQ digitizer readout.
//!
//! This crate holds the pieces of the streaming readout that do not depend on
//! the device protocol:
//!
//! - [`Chunk`] / [`SampleWidth`] - owned sample batches with a runtime-selected word width
//! - [`BoundedQueue`] - fixed-capacity producer/consumer handoff (the backpressure point)
//! - [`Reactor`] - shared asynchronous I/O service that runs socket completions
//! - [`AcqError`] - error taxonomy
//! - [`DeviceConfig`] - layered connection/readout settings
//!
//! The device driver itself lives in `daq-driver-dtacq`.

pub mod chunk;
pub mod config;
pub mod error;
pub mod logging;
pub mod queue;
pub mod reactor;

pub use chunk::{Chunk, SampleWidth, WordAssembler};
pub use config::DeviceConfig;
pub use error::{AcqError, ErrorKind, Result};
pub use queue::BoundedQueue;
pub use reactor::Reactor;
