//! Runtime device discovery
//!
//! Scans PCIe sysfs for functions whose vendor/device pair is the KC705
//! gateware's (`10ee:7024`). Boards are numbered in bus-address order.

use crate::backends::userspace::{read_hex, UserspaceBackend};
use crate::device::Kc705Device;
use crate::error::{Kc705Error, Result};
use kc705_chip::pcie;
use std::path::{Path, PathBuf};

const PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// Device manager for runtime discovery and access
#[derive(Debug)]
pub struct DeviceManager {
    devices: Vec<DeviceInfo>,
}

/// Information about a discovered board
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device index (0, 1, 2, ...)
    pub index: usize,

    /// sysfs directory of the PCIe function
    pub path: PathBuf,

    /// PCIe bus address (0000:03:00.0, etc.)
    pub pcie_address: String,
}

impl DeviceManager {
    /// Discover all KC705 boards on the system
    ///
    /// # Errors
    ///
    /// Returns `Kc705Error::NoDevicesFound` if no boards are detected.
    pub fn discover() -> Result<Self> {
        Self::discover_in(Path::new(PCI_DEVICES))
    }

    /// Discover boards under an alternative sysfs device directory.
    ///
    /// # Errors
    ///
    /// Returns error if `root` cannot be read or holds no KC705 functions.
    pub fn discover_in(root: &Path) -> Result<Self> {
        tracing::info!("Discovering KC705 devices under {}", root.display());

        let entries = std::fs::read_dir(root)
            .map_err(|e| Kc705Error::invalid_state(format!("Cannot read {}: {e}", root.display())))?;

        let mut matches: Vec<(String, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let vendor = read_hex(&path.join("vendor")).ok()?;
                let device = read_hex(&path.join("device")).ok()?;
                pcie::is_kc705(vendor, device)
                    .then(|| (entry.file_name().to_string_lossy().to_string(), path))
            })
            .collect();

        matches.sort();

        if matches.len() > pcie::MAX_DEVICES {
            tracing::warn!(
                "{} KC705 functions found, using the first {}",
                matches.len(),
                pcie::MAX_DEVICES
            );
            matches.truncate(pcie::MAX_DEVICES);
        }

        let devices: Vec<DeviceInfo> = matches
            .into_iter()
            .enumerate()
            .map(|(index, (pcie_address, path))| {
                tracing::info!("Device {index}: KC705 @ {pcie_address}");
                DeviceInfo {
                    index,
                    path,
                    pcie_address,
                }
            })
            .collect();

        if devices.is_empty() {
            tracing::error!("No KC705 devices found");
            return Err(Kc705Error::NoDevicesFound);
        }

        tracing::info!("Discovered {} KC705 device(s)", devices.len());

        Ok(Self { devices })
    }

    /// Get number of discovered devices
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Get slice of all devices
    #[must_use]
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Get device info by index
    ///
    /// # Errors
    ///
    /// Returns `Kc705Error::InvalidIndex` if the index is out of bounds.
    pub fn device(&self, index: usize) -> Result<&DeviceInfo> {
        self.devices.get(index).ok_or(Kc705Error::InvalidIndex {
            index,
            count: self.devices.len(),
        })
    }

    /// Open device by index
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be opened or the index is invalid.
    pub fn open(&self, index: usize) -> Result<Kc705Device> {
        self.device(index)?.open()
    }

    /// Open first available device
    ///
    /// # Errors
    ///
    /// Returns an error if no devices are available or the device cannot be opened.
    pub fn open_first(&self) -> Result<Kc705Device> {
        self.devices
            .first()
            .ok_or(Kc705Error::NoDevicesFound)?
            .open()
    }
}

impl DeviceInfo {
    /// Get device index
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Get sysfs path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get PCIe address
    #[must_use]
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }

    /// Map the board and wrap it in a device handle.
    ///
    /// # Errors
    ///
    /// Returns error if the BARs cannot be mapped.
    pub fn open(&self) -> Result<Kc705Device> {
        let backend = UserspaceBackend::init(&self.pcie_address)?;
        Ok(Kc705Device::new(Box::new(backend)))
    }
}
