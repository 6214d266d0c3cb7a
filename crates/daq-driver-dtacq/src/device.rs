//! Synchronous device facade.
//!
//! A [`Device`] owns the control connection and one [`ReadoutController`].
//! Every method blocks its caller; the sockets themselves are driven by the
//! shared [`Reactor`].

use crate::command::{CommandChannel, PROMPT_ON};
use crate::controller::{ControllerSettings, ReadoutController, ReadoutState};
use crate::discovery::{discover, DeviceLayout, SiteInventory};
use crate::reader::{DataSocket, SampleSource};
use crate::stats::ReadoutStats;
use crate::worker::{ReadoutHandler, SampleCounter};
use dtacq_core::chunk::SampleWidth;
use dtacq_core::config::DeviceConfig;
use dtacq_core::error::{AcqError, Result};
use dtacq_core::reactor::Reactor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A networked digitizer.
///
/// # Example
///
/// ```rust,ignore
/// use daq_driver_dtacq::{Chunk, Device};
///
/// let device = Device::new("acq1001_123")?;
/// println!("{} sites, {} byte samples", device.num_sites(), device.readout_size());
///
/// device.begin_readout(|chunk: Chunk| -> anyhow::Result<()> {
///     println!("{} samples", chunk.len());
///     Ok(())
/// }, 1 << 20)?;
/// std::thread::sleep(std::time::Duration::from_secs(1));
/// device.stop_readout();
/// ```
pub struct Device {
    address: String,
    config: DeviceConfig,
    reactor: Reactor,
    control: Option<Arc<CommandChannel>>,
    layout: DeviceLayout,
    controller: ReadoutController,
    samples: Arc<AtomicU64>,
}

impl Device {
    /// Connect to `address` with default settings on the process-wide reactor.
    ///
    /// An empty address creates an unconnected device; see
    /// [`reset_ip_address`](Self::reset_ip_address).
    pub fn new(address: &str) -> Result<Self> {
        Self::with_config(address, DeviceConfig::default(), Reactor::global()?)
    }

    /// Connect to `address` with explicit settings and reactor.
    pub fn with_config(address: &str, config: DeviceConfig, reactor: Reactor) -> Result<Self> {
        config.validate()?;
        let mut device = Self {
            address: String::new(),
            controller: ReadoutController::new(reactor.clone(), ControllerSettings::from(&config)),
            config,
            reactor,
            control: None,
            layout: DeviceLayout::default(),
            samples: Arc::new(AtomicU64::new(0)),
        };
        device.reset_ip_address(address)?;
        Ok(device)
    }

    /// Point the device at `address`.
    ///
    /// Stops any readout, drops the current control connection and the site
    /// inventory, then connects, enables prompts and re-runs discovery. An
    /// empty address leaves the device unconnected.
    pub fn reset_ip_address(&mut self, address: &str) -> Result<()> {
        self.controller.stop();
        self.release_control();
        self.layout = DeviceLayout::default();
        self.address = address.to_string();

        if address.is_empty() {
            return Ok(());
        }

        let config = &self.config;
        let (channel, layout) = self.reactor.block_on(async {
            let channel = CommandChannel::connect(
                address,
                config.control_port,
                config.connect_timeout,
                config.command_timeout,
            )
            .await?;
            channel.send(PROMPT_ON).await?;
            let layout = discover(&channel, config.query_data32).await?;
            Ok::<_, AcqError>((channel, layout))
        })??;

        info!(
            address,
            sites = layout.inventory.num_sites(),
            width = %layout.width,
            "Device connected"
        );
        self.control = Some(Arc::new(channel));
        self.layout = layout;
        Ok(())
    }

    /// Address the control connection targets (empty if unconnected).
    pub fn ip_address(&self) -> &str {
        &self.address
    }

    /// Open a second, independent connection to the same device.
    pub fn try_clone(&self) -> Result<Self> {
        Self::with_config(&self.address, self.config.clone(), self.reactor.clone())
    }

    /// Send one control command and return its response without the prompt.
    ///
    /// Safe to call while a readout is running.
    pub fn send_command(&self, command: &str) -> Result<String> {
        let channel = self.control()?;
        self.reactor.block_on(channel.send(command))?
    }

    /// Start streaming into `handler` with a receive buffer of `buffer_size` bytes.
    ///
    /// Stops any readout already running. Returns once the data socket is
    /// connected and the worker has started.
    pub fn begin_readout<H: ReadoutHandler>(&self, handler: H, buffer_size: usize) -> Result<()> {
        let addr = self.data_addr()?;
        let connect_timeout = self.config.connect_timeout;
        let connect = async move {
            let socket = DataSocket::connect(addr, connect_timeout).await?;
            Ok::<_, AcqError>(Box::new(socket) as Box<dyn SampleSource>)
        };
        self.controller
            .start(connect, Box::new(handler), self.layout.width, buffer_size)
    }

    /// Start streaming with a handler that only counts samples.
    ///
    /// The count is read with [`samples_received`](Self::samples_received).
    pub fn begin_readout_default(&self, buffer_size: usize) -> Result<()> {
        // A previous counting session must not add to the new total
        self.controller.stop();
        self.samples.store(0, Ordering::Relaxed);
        let counter = SampleCounter::with_total(Arc::clone(&self.samples));
        self.begin_readout(counter, buffer_size)
    }

    /// Stop streaming and wait for the worker to drain. No-op if idle.
    pub fn stop_readout(&self) {
        self.controller.stop();
    }

    /// True while the data socket is open.
    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    /// Number of populated sites (0 if unconnected).
    pub fn num_sites(&self) -> usize {
        self.layout.inventory.num_sites()
    }

    /// Channel count of the site at `site` (0-based discovery order).
    ///
    /// # Panics
    /// Panics if `site >= num_sites()`.
    pub fn num_channels(&self, site: usize) -> usize {
        self.layout.inventory[site]
    }

    /// Sample word width in bytes.
    pub fn readout_size(&self) -> usize {
        self.layout.width.bytes()
    }

    /// Sample word width.
    pub fn sample_width(&self) -> SampleWidth {
        self.layout.width
    }

    /// Per-site channel counts from the last discovery.
    pub fn inventory(&self) -> &SiteInventory {
        &self.layout.inventory
    }

    /// Samples counted by the default handler since its readout began.
    pub fn samples_received(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Counters of the current (or last) readout.
    pub fn readout_stats(&self) -> ReadoutStats {
        self.controller.stats()
    }

    /// Readout lifecycle state.
    pub fn readout_state(&self) -> ReadoutState {
        self.controller.state()
    }

    /// Settings in use.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn control(&self) -> Result<&Arc<CommandChannel>> {
        self.control.as_ref().ok_or(AcqError::NotConnected)
    }

    fn data_addr(&self) -> Result<SocketAddr> {
        let peer = self.control()?.peer_addr();
        Ok(SocketAddr::new(peer.ip(), self.config.data_port))
    }

    /// Close the control socket from reactor context.
    fn release_control(&mut self) {
        let Some(channel) = self.control.take() else {
            return;
        };
        let posted = self.reactor.post(async move {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Control channel close failed");
            }
        });
        if posted.is_err() {
            warn!(address = self.address.as_str(), "Reactor shut down; control socket dropped unclosed");
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.controller.stop();
        self.release_control();
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("connected", &self.control.is_some())
            .field("layout", &self.layout)
            .field("readout", &self.controller.state())
            .finish()
    }
}
