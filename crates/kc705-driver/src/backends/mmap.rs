//! Memory-mapped PCIe BAR access
//!
//! All `unsafe` in the crate lives here: one `mmap` per BAR, volatile 32-bit
//! register access and bulk copies, each behind a bounds check.

use crate::error::{Kc705Error, Result};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::ptr::NonNull;

/// Memory-mapped PCIe BAR region
#[derive(Debug)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    pcie_address: String,
    bar_index: usize,
}

impl MmapRegion {
    /// Map `resource{bar_index}` of the device at `pcie_address`.
    ///
    /// # Errors
    ///
    /// Returns error if the resource file is missing, cannot be opened
    /// read-write, is empty, or `mmap` fails.
    pub fn new(pcie_address: &str, bar_index: usize) -> Result<Self> {
        let path = format!("/sys/bus/pci/devices/{pcie_address}/resource{bar_index}");

        tracing::debug!("Mapping PCIe BAR: {path}");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                Kc705Error::transfer_failed(format!("Cannot open {path}: {e}. Is the board enabled?"))
            })?;

        let size = usize::try_from(file.metadata()?.len())
            .map_err(|_| Kc705Error::transfer_failed(format!("{path} is larger than the address space")))?;

        if size == 0 {
            return Err(Kc705Error::transfer_failed(format!(
                "BAR{bar_index} size is 0 (device not enabled?)"
            )));
        }

        // SAFETY: the fd is open read-write for the duration of the mapping
        // (kept in `_file`), `size` is the non-zero resource length, and the
        // mapping is released exactly once in `Drop`.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| Kc705Error::transfer_failed(format!("mmap of {path} failed: {e}")))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| Kc705Error::transfer_failed(format!("mmap of {path} returned null")))?;

        tracing::info!(
            "Mapped BAR{bar_index} for {pcie_address} ({} KiB at {ptr:p})",
            size / 1024,
        );

        Ok(Self {
            ptr,
            size,
            _file: file,
            pcie_address: pcie_address.to_string(),
            bar_index,
        })
    }

    fn check(&self, offset: usize, len: usize, op: &str) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Kc705Error::transfer_failed(format!(
                "Out of bounds {op} on BAR{}: offset={offset:#x}, size={len}, limit={:#x}",
                self.bar_index, self.size
            ))),
        }
    }

    fn check_word(&self, offset: usize, op: &str) -> Result<()> {
        if offset % 4 != 0 {
            return Err(Kc705Error::transfer_failed(format!(
                "Unaligned register {op} at {offset:#x}"
            )));
        }
        self.check(offset, 4, op)
    }

    /// Volatile 32-bit read.
    ///
    /// # Errors
    ///
    /// Returns error if `offset` is unaligned or out of bounds.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        self.check_word(offset, "read")?;

        // SAFETY: `offset + 4 <= size` and `offset` is 4-byte aligned inside a
        // page-aligned mapping; volatile keeps the access from being elided.
        #[allow(clippy::cast_ptr_alignment)]
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() };

        tracing::trace!("Read u32 @ {offset:#x} = {value:#x}");
        Ok(value)
    }

    /// Volatile 32-bit write.
    ///
    /// # Errors
    ///
    /// Returns error if `offset` is unaligned or out of bounds.
    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.check_word(offset, "write")?;

        tracing::trace!("Write u32 @ {offset:#x} = {value:#x}");

        // SAFETY: as in `read_u32`; `&mut self` serializes writers.
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value);
        }

        Ok(())
    }

    /// Copy `buffer.len()` bytes starting at `offset` out of the BAR.
    ///
    /// # Errors
    ///
    /// Returns error if the range leaves the BAR.
    pub fn read_bytes(&self, offset: usize, buffer: &mut [u8]) -> Result<()> {
        self.check(offset, buffer.len(), "read")?;

        // SAFETY: the source range is inside the mapping (checked above) and
        // cannot overlap a host slice.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset),
                buffer.as_mut_ptr(),
                buffer.len(),
            );
        }

        Ok(())
    }

    /// Copy `data` into the BAR at `offset`.
    ///
    /// # Errors
    ///
    /// Returns error if the range leaves the BAR.
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len(), "write")?;

        // SAFETY: the destination range is inside the mapping (checked above)
        // and cannot overlap a host slice.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }

        Ok(())
    }

    /// Get region size
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Get PCIe address
    #[must_use]
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }

    /// Get BAR index
    #[must_use]
    pub const fn bar_index(&self) -> usize {
        self.bar_index
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        tracing::debug!("Unmapping BAR{} for {}", self.bar_index, self.pcie_address);

        // SAFETY: `ptr` and `size` are exactly what `mmap` returned and took
        // in `new`; the region is not used after drop.
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.size) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
    }
}

// SAFETY: the mapping is owned exclusively by this value and stays valid
// while the file is open; moving it to another thread does not invalidate it.
unsafe impl Send for MmapRegion {}

// SAFETY: shared access only performs bounds-checked volatile reads; all
// writes take `&mut self`.
unsafe impl Sync for MmapRegion {}
