//! PCIe identity and link constants.

/// Xilinx vendor ID (PCI-SIG assigned).
pub const XILINX_VENDOR_ID: u16 = 0x10EE;

/// KC705 MobileNetV3 endpoint device ID (`lspci: 10ee:7024`).
pub const KC705_DEVICE_ID: u16 = 0x7024;

/// Maximum number of boards the driver enumerates.
pub const MAX_DEVICES: usize = 8;

/// Link generation of the KC705 endpoint (Gen2, 5 GT/s).
pub const LINK_GENERATION: u8 = 2;

/// Link width of the KC705 endpoint.
pub const LINK_WIDTH: u8 = 8;

/// Nominal link speed in GT/s.
pub const LINK_SPEED_GTS: f32 = 5.0;

/// BAR index of the register space.
pub const REGISTER_BAR: usize = 0;

/// BAR index of the data space.
pub const DATA_BAR: usize = 1;

/// Format a `vendor:device` string for use with `lspci -d`.
#[must_use]
pub fn lspci_filter() -> String {
    format!("{XILINX_VENDOR_ID:04x}:{KC705_DEVICE_ID:04x}")
}

/// True if the sysfs `vendor` / `device` pair identifies a KC705 board.
#[must_use]
pub const fn is_kc705(vendor: u16, device: u16) -> bool {
    vendor == XILINX_VENDOR_ID && device == KC705_DEVICE_ID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lspci_filter_format() {
        assert_eq!(lspci_filter(), "10ee:7024");
    }

    #[test]
    fn identity_match() {
        assert!(is_kc705(0x10EE, 0x7024));
        assert!(!is_kc705(0x10EE, 0x7021));
        assert!(!is_kc705(0x1E7C, 0x7024));
    }
}
