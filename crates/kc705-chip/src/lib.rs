//! Board model for the Xilinx KC705 MobileNetV3 accelerator.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure description of the board as the host sees it: register offsets and
//! bit definitions, the data-BAR region layout, PCIe identity and the
//! canonical image format.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pcie`] | Vendor/device IDs, link constants |
//! | [`regs`] | BAR0 register map with bit definitions |
//! | [`memmap`] | Data BAR layout (image, result, weight regions) |
//! | [`image`] | Canonical input format and class count |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod image;
pub mod memmap;
pub mod pcie;
pub mod regs;
