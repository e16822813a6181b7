//! Host driver for the KC705 MobileNetV3 accelerator.
//!
//! The board exposes a register file on BAR0 and a data space on BAR1. This
//! crate finds boards on the PCIe bus, maps their BARs and runs the
//! upload/START/DONE protocol. The same protocol can be served by
//! [`SoftwareBackend`], which puts the fixed-point pipeline from
//! `kc705-pipeline` behind an in-memory copy of the register file.
//!
//! # Backends
//!
//! ```text
//! UserspaceBackend — sysfs resource0/resource1 mmap, polled completion
//! SoftwareBackend  — CPU sequencer behind the same registers and regions
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use kc705_driver::DeviceManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mgr = DeviceManager::discover()?;
//! let mut dev = mgr.open_first()?;
//! println!("{}", dev.device_info()?);
//!
//! dev.load_weights_file("mobilenet_v3_small.k7w")?;
//! let result = dev.infer_file("cat.rgb")?;
//! println!("{result}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod backend;
pub mod backends;
pub mod classes;
mod device;
mod discovery;
mod error;
pub mod image;
mod inference;

/// Hardware identification constants (re-exported from kc705-chip).
pub mod pcie_ids {
    pub use kc705_chip::pcie::{
        is_kc705, lspci_filter, KC705_DEVICE_ID, MAX_DEVICES, XILINX_VENDOR_ID,
    };
}

pub use backend::{select_backend, Backend, BackendSelection, BackendType, LinkInfo};
pub use backends::{SoftwareBackend, UserspaceBackend};
pub use classes::class_name;
pub use device::{DebugStatus, DeviceDetails, Kc705Device, DRIVER_VERSION, RESET_PULSE};
pub use discovery::{DeviceInfo, DeviceManager};
pub use error::{Kc705Error, Result};
pub use image::RgbImage;
pub use inference::{
    ClassificationResult, InferenceConfig, PerformanceStats, DEFAULT_POLL_INTERVAL,
    DEFAULT_TIMEOUT,
};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        ClassificationResult, DeviceManager, InferenceConfig, Kc705Device, Kc705Error,
        PerformanceStats, Result, RgbImage, SoftwareBackend,
    };
}
