//! BAR0 register map.
//!
//! Every register is 32 bits wide and 4-byte aligned.
//!
//! ```text
//! 0x00  CONTROL      START | RESET | IRQ_ENABLE | DMA_ENABLE
//! 0x04  STATUS       DONE | BUSY | ERROR | LINK_UP
//! 0x08  INTERRUPT    pending interrupt flags (write 1 to clear)
//! 0x0C  IMAGE_SIZE   bytes of image data uploaded
//! 0x10  IMAGE_ADDR   image offset inside the image region
//! 0x14  RESULT_ADDR  result offset inside the result region
//! 0x18  WEIGHT_ADDR  weight blob offset inside the weight region (write = install)
//! 0x1C  DEBUG        saturation event counter
//! ```

// ── Registers ────────────────────────────────────────────────────────────────

/// Control register.
pub const CONTROL: usize = 0x00;
/// Status register (read-only from the host).
pub const STATUS: usize = 0x04;
/// Interrupt flags.
pub const INTERRUPT: usize = 0x08;
/// Size in bytes of the uploaded image.
pub const IMAGE_SIZE: usize = 0x0C;
/// Image offset inside the image region.
pub const IMAGE_ADDR: usize = 0x10;
/// Result offset inside the result region.
pub const RESULT_ADDR: usize = 0x14;
/// Weight blob offset inside the weight region.
pub const WEIGHT_ADDR: usize = 0x18;
/// Debug register.
pub const DEBUG: usize = 0x1C;

/// Number of 32-bit registers in the map.
pub const REGISTER_COUNT: usize = 8;

/// Bytes of BAR0 the host maps.
pub const REGISTER_SPACE_BYTES: usize = 4096;

/// All register offsets, in address order.
pub const ALL: [usize; REGISTER_COUNT] = [
    CONTROL,
    STATUS,
    INTERRUPT,
    IMAGE_SIZE,
    IMAGE_ADDR,
    RESULT_ADDR,
    WEIGHT_ADDR,
    DEBUG,
];

/// Human-readable name of a register offset.
#[must_use]
pub const fn name(offset: usize) -> &'static str {
    match offset {
        CONTROL => "CONTROL",
        STATUS => "STATUS",
        INTERRUPT => "INTERRUPT",
        IMAGE_SIZE => "IMAGE_SIZE",
        IMAGE_ADDR => "IMAGE_ADDR",
        RESULT_ADDR => "RESULT_ADDR",
        WEIGHT_ADDR => "WEIGHT_ADDR",
        DEBUG => "DEBUG",
        _ => "UNKNOWN",
    }
}

// ── Control register bit definitions ─────────────────────────────────────────

pub mod control {
    //! `CONTROL` bits.

    /// Start one inference.
    pub const START: u32 = 1 << 0;
    /// Soft reset; discards all pipeline state.
    pub const RESET: u32 = 1 << 1;
    /// Raise an interrupt when DONE is set.
    pub const IRQ_ENABLE: u32 = 1 << 2;
    /// Use DMA for region transfers.
    pub const DMA_ENABLE: u32 = 1 << 3;
}

// ── Status register bit definitions ──────────────────────────────────────────

pub mod status {
    //! `STATUS` bits.

    /// Inference finished; result region is valid.
    pub const DONE: u32 = 1 << 0;
    /// Inference in progress.
    pub const BUSY: u32 = 1 << 1;
    /// Last operation failed.
    pub const ERROR: u32 = 1 << 2;
    /// PCIe link is up.
    pub const LINK_UP: u32 = 1 << 3;
}

// ── Interrupt register bit definitions ───────────────────────────────────────

pub mod interrupt {
    //! `INTERRUPT` bits.

    /// Inference completed.
    pub const DONE: u32 = 1 << 0;
    /// Inference failed.
    pub const ERROR: u32 = 1 << 1;
}
