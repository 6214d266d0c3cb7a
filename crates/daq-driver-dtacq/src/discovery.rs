//! Connect-time self-discovery of the acquisition layout.
//!
//! After `prompt on`, the driver asks the device how it is populated:
//!
//! 1. `get.site <i> NCHAN` for `i = 1, 2, 3, …` until a response does not
//!    parse as an integer. That is the normal end-of-sites signal.
//! 2. `data32`: zero means 2-byte samples, anything else 4-byte. Firmware
//!    with a fixed 16-bit width does not answer this query, so it can be
//!    skipped.

use crate::command::{parse_unsigned, CommandOps};
use dtacq_core::chunk::SampleWidth;
use dtacq_core::error::Result;
use std::ops::Index;
use tracing::{debug, info, warn};

/// Upper bound on probed sites, in case a device answers every index.
pub const MAX_SITES: usize = 64;

/// Per-site channel counts in discovery order (index 0 is site 1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteInventory {
    channels: Vec<usize>,
}

impl SiteInventory {
    /// Build an inventory from channel counts.
    pub fn new(channels: Vec<usize>) -> Self {
        Self { channels }
    }

    /// Number of populated sites.
    pub fn num_sites(&self) -> usize {
        self.channels.len()
    }

    /// True if no site answered.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Channel count of the site at `index`, if present.
    pub fn get(&self, index: usize) -> Option<usize> {
        self.channels.get(index).copied()
    }

    /// Sum over all sites.
    pub fn total_channels(&self) -> usize {
        self.channels.iter().sum()
    }

    /// Iterate channel counts in site order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.channels.iter().copied()
    }

    /// Channel counts as a slice.
    pub fn as_slice(&self) -> &[usize] {
        &self.channels
    }
}

impl Index<usize> for SiteInventory {
    type Output = usize;

    fn index(&self, index: usize) -> &usize {
        &self.channels[index]
    }
}

/// Everything learned about a device at connect time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceLayout {
    /// Populated sites and their channel counts.
    pub inventory: SiteInventory,
    /// Sample word width on the data stream.
    pub width: SampleWidth,
}

/// Command asking for the channel count of `site` (1-based).
pub fn site_channels_command(site: usize) -> String {
    format!("get.site {} NCHAN", site)
}

/// Probe sites until one does not report a channel count.
pub async fn discover_sites<C: CommandOps + ?Sized>(ops: &C) -> Result<SiteInventory> {
    let mut channels = Vec::new();

    for site in 1..=MAX_SITES {
        let response = ops.send(&site_channels_command(site)).await?;
        match parse_unsigned(&response) {
            Some(count) => {
                debug!(site, channels = count, "Discovered site");
                channels.push(count as usize);
            }
            None => {
                debug!(site, response = response.as_str(), "End of sites");
                return Ok(SiteInventory::new(channels));
            }
        }
    }

    warn!(max = MAX_SITES, "Device reported channels for every probed site");
    Ok(SiteInventory::new(channels))
}

/// Determine the sample word width.
pub async fn discover_width<C: CommandOps + ?Sized>(
    ops: &C,
    query_data32: bool,
) -> Result<SampleWidth> {
    if !query_data32 {
        return Ok(SampleWidth::Word16);
    }
    let flag = ops.query_u64("data32").await?;
    Ok(SampleWidth::from_data32(flag))
}

/// Run the full discovery sequence.
pub async fn discover<C: CommandOps + ?Sized>(ops: &C, query_data32: bool) -> Result<DeviceLayout> {
    let inventory = discover_sites(ops).await?;
    let width = discover_width(ops, query_data32).await?;

    if inventory.is_empty() {
        warn!("Digitizer reported no populated sites");
    }
    info!(
        sites = inventory.num_sites(),
        channels = inventory.total_channels(),
        %width,
        "Discovered digitizer layout"
    );

    Ok(DeviceLayout { inventory, width })
}
