//! Backend abstraction for KC705 access
//!
//! A backend exposes the two PCIe BARs the host protocol needs: the 32-bit
//! register file and the data space holding the image, result and weight
//! regions. Everything above that (the START/DONE handshake, timeouts,
//! statistics) lives in [`crate::Kc705Device`].

use crate::error::Result;
use std::fmt::Debug;

/// Register and data-space access to one board.
pub trait Backend: Debug + Send {
    /// Read a 32-bit register at a BAR0 offset.
    ///
    /// # Errors
    ///
    /// Returns error if the offset is outside the register file.
    fn read_reg(&self, offset: usize) -> Result<u32>;

    /// Write a 32-bit register at a BAR0 offset.
    ///
    /// Writes to `CONTROL` and `WEIGHT_ADDR` have side effects.
    ///
    /// # Errors
    ///
    /// Returns error if the offset is outside the register file.
    fn write_reg(&mut self, offset: usize, value: u32) -> Result<()>;

    /// Copy bytes out of the data space.
    ///
    /// # Errors
    ///
    /// Returns error if the read would leave the data space.
    fn read_data(&self, offset: usize, buffer: &mut [u8]) -> Result<()>;

    /// Copy bytes into the data space.
    ///
    /// # Errors
    ///
    /// Returns error if the write would leave the data space.
    fn write_data(&mut self, offset: usize, data: &[u8]) -> Result<()>;

    /// Negotiated link parameters.
    fn link(&self) -> LinkInfo;

    /// Get backend type for debugging
    fn backend_type(&self) -> BackendType;

    /// PCIe address (or a pseudo-address for software backends).
    fn address(&self) -> &str;
}

/// PCIe link parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkInfo {
    /// PCIe generation (1, 2, 3, ...); 0 when not applicable.
    pub generation: u8,
    /// Negotiated lane count; 0 when not applicable.
    pub width: u8,
    /// Per-lane speed in GT/s.
    pub speed_gts: f32,
}

impl LinkInfo {
    /// Link of a backend with no physical bus.
    pub const NONE: Self = Self {
        generation: 0,
        width: 0,
        speed_gts: 0.0,
    };
}

impl std::fmt::Display for LinkInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.generation == 0 {
            f.write_str("none")
        } else {
            write!(
                f,
                "Gen{} x{} ({:.1} GT/s)",
                self.generation, self.width, self.speed_gts
            )
        }
    }
}

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Userspace driver (mmap PCIe BARs)
    Userspace,

    /// Software control-plane adapter running the fixed-point pipeline on the CPU
    Software,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Userspace => write!(f, "Userspace"),
            Self::Software => write!(f, "Software (pipeline adapter)"),
        }
    }
}

/// Backend selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendSelection {
    /// Userspace if the board can be mapped, software otherwise
    Auto,

    /// Force userspace driver
    Userspace,

    /// Force software backend
    Software,
}

/// Select appropriate backend based on availability and requirements
///
/// The software fallback is built for the full-size model; its weights
/// still have to be loaded through the weight region.
///
/// # Errors
///
/// Returns error if no suitable backend can be initialized for the given device.
pub fn select_backend(selection: BackendSelection, pcie_address: &str) -> Result<Box<dyn Backend>> {
    use crate::backends::software::SoftwareBackend;
    use crate::backends::userspace::UserspaceBackend;
    use kc705_chip::image::NUM_CLASSES;
    use kc705_pipeline::ModelConfig;

    let software = || -> Result<Box<dyn Backend>> {
        Ok(Box::new(SoftwareBackend::new(
            ModelConfig::mobilenet_v3_small(NUM_CLASSES),
        )?))
    };

    match selection {
        BackendSelection::Software => software(),
        BackendSelection::Userspace => Ok(Box::new(UserspaceBackend::init(pcie_address)?)),
        BackendSelection::Auto => match UserspaceBackend::init(pcie_address) {
            Ok(backend) => {
                tracing::info!("Selected userspace backend for {pcie_address}");
                Ok(Box::new(backend))
            }
            Err(e) => {
                tracing::warn!("Userspace backend unavailable ({e}), using software backend");
                software()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_display() {
        let link = LinkInfo {
            generation: 2,
            width: 8,
            speed_gts: 5.0,
        };
        assert_eq!(link.to_string(), "Gen2 x8 (5.0 GT/s)");
        assert_eq!(LinkInfo::NONE.to_string(), "none");
    }

    #[test]
    fn test_forced_software_selection() {
        let backend = select_backend(BackendSelection::Software, "ignored").unwrap();
        assert_eq!(backend.backend_type(), BackendType::Software);
    }
}
