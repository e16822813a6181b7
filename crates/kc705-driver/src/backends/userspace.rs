//! Userspace KC705 backend
//!
//! Maps BAR0 (register file) and BAR1 (data space) through sysfs and talks
//! to the gateware with plain loads and stores. No DMA and no interrupt
//! delivery: completion is observed by polling `STATUS`.

use crate::backend::{Backend, BackendType, LinkInfo};
use crate::backends::mmap::MmapRegion;
use crate::error::{Kc705Error, Result};
use kc705_chip::{memmap, pcie, regs};
use std::path::Path;

/// Userspace backend using memory-mapped I/O
#[derive(Debug)]
pub struct UserspaceBackend {
    pcie_address: String,
    bar0: MmapRegion,
    bar1: MmapRegion,
    link: LinkInfo,
}

impl UserspaceBackend {
    /// Map the board at `pcie_address`.
    ///
    /// # Errors
    ///
    /// Returns error if the device is not a KC705, cannot be enabled, or a
    /// BAR is missing or too small.
    pub fn init(pcie_address: &str) -> Result<Self> {
        tracing::info!("Initializing userspace backend for {pcie_address}");

        let sysfs = Path::new("/sys/bus/pci/devices").join(pcie_address);
        if !sysfs.exists() {
            return Err(Kc705Error::device_not_found(sysfs));
        }
        let vendor = read_hex(&sysfs.join("vendor"))?;
        let device = read_hex(&sysfs.join("device"))?;
        if !pcie::is_kc705(vendor, device) {
            return Err(Kc705Error::invalid_param(format!(
                "{pcie_address} is {vendor:04x}:{device:04x}, not a KC705 ({})",
                pcie::lspci_filter()
            )));
        }

        Self::ensure_device_enabled(pcie_address)?;

        let bar0 = MmapRegion::new(pcie_address, pcie::REGISTER_BAR)?;
        if bar0.size() < regs::REGISTER_COUNT * 4 {
            return Err(Kc705Error::transfer_failed(format!(
                "BAR0 is {} bytes, register file needs {}",
                bar0.size(),
                regs::REGISTER_COUNT * 4
            )));
        }
        let bar1 = MmapRegion::new(pcie_address, pcie::DATA_BAR)?;
        if bar1.size() < memmap::DATA_SPACE_BYTES {
            return Err(Kc705Error::transfer_failed(format!(
                "BAR1 is {} bytes, data space needs {}",
                bar1.size(),
                memmap::DATA_SPACE_BYTES
            )));
        }

        let link = link_from_sysfs(&sysfs);
        tracing::info!("Initialized {pcie_address} via userspace driver, link {link}");

        Ok(Self {
            pcie_address: pcie_address.to_string(),
            bar0,
            bar1,
            link,
        })
    }

    fn ensure_device_enabled(pcie_address: &str) -> Result<()> {
        let enable_path = format!("/sys/bus/pci/devices/{pcie_address}/enable");

        match std::fs::read_to_string(&enable_path) {
            Ok(content) if content.trim() == "1" => {
                tracing::debug!("Device {pcie_address} already enabled");
                Ok(())
            }
            Ok(_) => {
                if let Err(e) = std::fs::write(&enable_path, "1") {
                    tracing::warn!("Could not enable device {pcie_address} (may need sudo): {e}");
                    Err(Kc705Error::invalid_state(format!(
                        "device not enabled and cannot enable: {e}"
                    )))
                } else {
                    tracing::info!("Enabled device {pcie_address}");
                    Ok(())
                }
            }
            Err(e) => Err(Kc705Error::invalid_state(format!(
                "cannot check device enable status: {e}"
            ))),
        }
    }
}

impl Backend for UserspaceBackend {
    fn read_reg(&self, offset: usize) -> Result<u32> {
        self.bar0.read_u32(offset)
    }

    fn write_reg(&mut self, offset: usize, value: u32) -> Result<()> {
        self.bar0.write_u32(offset, value)
    }

    fn read_data(&self, offset: usize, buffer: &mut [u8]) -> Result<()> {
        self.bar1.read_bytes(offset, buffer)
    }

    fn write_data(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.bar1.write_bytes(offset, data)
    }

    fn link(&self) -> LinkInfo {
        self.link
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Userspace
    }

    fn address(&self) -> &str {
        &self.pcie_address
    }
}

/// Read a hexadecimal sysfs attribute such as `vendor` (`0x10ee`).
pub(crate) fn read_hex(path: &Path) -> Result<u16> {
    let content = std::fs::read_to_string(path)?;
    let trimmed = content.trim().trim_start_matches("0x");
    u16::from_str_radix(trimmed, 16).map_err(|e| {
        Kc705Error::invalid_param(format!("{}: invalid hex value {trimmed:?}: {e}", path.display()))
    })
}

/// Negotiated link from `current_link_speed` / `current_link_width`,
/// falling back to the board's nominal Gen2 x8.
fn link_from_sysfs(device: &Path) -> LinkInfo {
    let read = |attr: &str| std::fs::read_to_string(device.join(attr)).ok();

    let speed = read("current_link_speed").and_then(|s| parse_link_speed(&s));
    let width = read("current_link_width").and_then(|s| s.trim().parse::<u8>().ok());

    match (speed, width) {
        (Some(speed_gts), Some(width)) => LinkInfo {
            generation: generation_for_speed(speed_gts),
            width,
            speed_gts,
        },
        _ => {
            tracing::debug!("link attributes unavailable, assuming nominal link");
            LinkInfo {
                generation: pcie::LINK_GENERATION,
                width: pcie::LINK_WIDTH,
                speed_gts: pcie::LINK_SPEED_GTS,
            }
        }
    }
}

/// Parse strings like `"5.0 GT/s PCIe"` or `"8 GT/s"`.
fn parse_link_speed(s: &str) -> Option<f32> {
    s.split_whitespace().next()?.parse().ok()
}

fn generation_for_speed(gts: f32) -> u8 {
    match gts {
        s if s < 3.0 => 1,
        s if s < 6.0 => 2,
        s if s < 10.0 => 3,
        s if s < 20.0 => 4,
        _ => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_link_speed() {
        assert_eq!(parse_link_speed("5.0 GT/s PCIe\n"), Some(5.0));
        assert_eq!(parse_link_speed("8 GT/s"), Some(8.0));
        assert_eq!(parse_link_speed("Unknown"), None);
    }

    #[test]
    fn test_generation_for_speed() {
        assert_eq!(generation_for_speed(2.5), 1);
        assert_eq!(generation_for_speed(5.0), 2);
        assert_eq!(generation_for_speed(8.0), 3);
        assert_eq!(generation_for_speed(16.0), 4);
    }

    #[test]
    fn test_read_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vendor");
        std::fs::write(&path, "0x10ee\n").unwrap();
        assert_eq!(read_hex(&path).unwrap(), pcie::XILINX_VENDOR_ID);
    }

    #[test]
    fn test_link_fallback_is_nominal() {
        let dir = tempfile::tempdir().unwrap();
        let link = link_from_sysfs(dir.path());
        assert_eq!(link.generation, 2);
        assert_eq!(link.width, 8);
    }

    #[test]
    fn test_init_rejects_missing_device() {
        let err = UserspaceBackend::init("ffff:ff:1f.7").unwrap_err();
        assert!(matches!(err, Kc705Error::DeviceNotFound { .. }));
    }

    #[test]
    #[ignore] // Requires hardware
    fn test_userspace_backend_with_hardware() {
        let manager = crate::DeviceManager::discover().unwrap();
        let info = &manager.devices()[0];
        let backend = UserspaceBackend::init(info.pcie_address()).unwrap();
        let status = backend.read_reg(regs::STATUS).unwrap();
        assert_ne!(status & regs::status::LINK_UP, 0);
    }
}
