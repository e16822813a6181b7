//! Backend implementations
//!
//! - **Userspace**: memory-mapped PCIe BARs of a real board
//! - **Software**: the fixed-point pipeline behind an in-memory register file

pub mod mmap;
pub mod software;
pub mod userspace;

pub use software::SoftwareBackend;
pub use userspace::UserspaceBackend;
