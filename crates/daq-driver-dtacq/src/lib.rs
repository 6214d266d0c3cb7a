//! D-TACQ Networked Digitizer Driver
//!
//! Client for D-TACQ ACQ400-series digitizers. The device exposes two TCP
//! endpoints: a line-oriented control channel and a raw binary streaming
//! channel.
//!
//! # Communication
//!
//! - Control: newline-terminated commands, responses terminated by a `>`
//!   prompt (default port 4220)
//! - Data: fixed-width signed samples with no framing (default port 4210)
//!
//! On connect the driver enables prompts and discovers the populated sites,
//! their channel counts and the sample word width.
//!
//! # Readout
//!
//! [`Device::begin_readout`] starts a session made of three parts:
//!
//! - a [`StreamingReader`] task on the shared [`Reactor`], reading as fast as
//!   the link delivers
//! - a [`BoundedQueue`] between reader and consumer, which is the only
//!   backpressure point
//! - a [`ReadoutWorker`] thread handing every chunk to the caller's
//!   [`ReadoutHandler`], followed by one zero-length sentinel chunk
//!
//! [`Device::stop_readout`] closes the data socket and returns once the
//! worker has delivered everything queued before the close.
//!
//! # Usage
//!
//! ```rust,ignore
//! use daq_driver_dtacq::{Chunk, Device};
//!
//! let device = Device::new("acq2106_042")?;
//! for site in 0..device.num_sites() {
//!     println!("site {}: {} channels", site + 1, device.num_channels(site));
//! }
//!
//! device.send_command("set.site 1 trg=1,0,1")?;
//! device.begin_readout(
//!     |chunk: Chunk| -> anyhow::Result<()> {
//!         if chunk.is_empty() {
//!             println!("stream ended");
//!         }
//!         Ok(())
//!     },
//!     1 << 20,
//! )?;
//! // ...
//! device.stop_readout();
//! println!("{:?}", device.readout_stats());
//! ```
//!
//! # Mock Mode
//!
//! [`MockCommandChannel`] answers control commands from a script, for
//! exercising discovery and command handling without hardware.

pub mod command;
pub mod controller;
pub mod device;
pub mod discovery;
pub mod reader;
pub mod stats;
pub mod worker;

pub use command::{CommandChannel, CommandOps, MockCommandChannel};
pub use controller::{ControllerSettings, ReadoutController, ReadoutState};
pub use device::Device;
pub use discovery::{DeviceLayout, SiteInventory};
pub use reader::{CloseSignal, DataSocket, SampleSource, StreamingReader};
pub use stats::ReadoutStats;
pub use worker::{ReadoutHandler, ReadoutWorker, SampleCounter};

pub use dtacq_core::{
    AcqError, BoundedQueue, Chunk, DeviceConfig, ErrorKind, Reactor, Result, SampleWidth,
};
