//! KC705 device handle and host protocol
//!
//! ```text
//! upload_image   image → IMAGE region, IMAGE_ADDR = 0, IMAGE_SIZE = len
//! start          CONTROL = START [| IRQ_ENABLE]
//! wait           poll STATUS: ERROR → HardwareError, !LINK_UP → LinkDown,
//!                DONE → read RESULT region, deadline → Timeout
//! reset          CONTROL = RESET, 1 ms, CONTROL = 0
//! ```

use crate::backend::{Backend, BackendType, LinkInfo};
use crate::error::{Kc705Error, Result};
use crate::image::RgbImage;
use crate::inference::{ClassificationResult, InferenceConfig, PerformanceStats};
use kc705_chip::memmap::{self, IMAGE, RESULT, WEIGHTS};
use kc705_chip::pcie;
use kc705_chip::regs::{self, control, status};
use kc705_pipeline::ModelWeights;
use std::path::Path;
use std::time::{Duration, Instant};

/// Driver version reported by [`Kc705Device::device_info`].
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long `RESET` is held asserted.
pub const RESET_PULSE: Duration = Duration::from_millis(1);

/// An open KC705 board (or its software stand-in).
#[derive(Debug)]
pub struct Kc705Device {
    backend: Box<dyn Backend>,
    config: InferenceConfig,
    stats: PerformanceStats,
}

/// Identification and link state.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDetails {
    /// PCI vendor ID.
    pub vendor_id: u16,
    /// PCI device ID.
    pub device_id: u16,
    /// Host driver version.
    pub driver_version: &'static str,
    /// Backend serving the device.
    pub backend: BackendType,
    /// PCIe address.
    pub address: String,
    /// `STATUS.LINK_UP` at the time of the query.
    pub link_up: bool,
    /// Negotiated link.
    pub link: LinkInfo,
}

impl std::fmt::Display for DeviceDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Device:   {:04x}:{:04x} @ {}", self.vendor_id, self.device_id, self.address)?;
        writeln!(f, "Backend:  {}", self.backend)?;
        writeln!(f, "Driver:   {}", self.driver_version)?;
        write!(
            f,
            "Link:     {} ({})",
            if self.link_up { "up" } else { "down" },
            self.link
        )
    }
}

/// Snapshot of every register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugStatus {
    /// `(offset, value)` in address order.
    pub registers: Vec<(usize, u32)>,
}

impl DebugStatus {
    /// Value of the register at `offset`, if captured.
    pub fn get(&self, offset: usize) -> Option<u32> {
        self.registers
            .iter()
            .find_map(|&(o, v)| (o == offset).then_some(v))
    }
}

impl std::fmt::Display for DebugStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &(offset, value) in &self.registers {
            writeln!(f, "  {offset:#04x}  {:<12} {value:#010x}", regs::name(offset))?;
        }
        Ok(())
    }
}

impl Kc705Device {
    /// Wrap a backend with default inference settings.
    pub fn new(backend: Box<dyn Backend>) -> Self {
        tracing::info!(
            "Opened {} device at {}",
            backend.backend_type(),
            backend.address()
        );
        Self {
            backend,
            config: InferenceConfig::default(),
            stats: PerformanceStats::default(),
        }
    }

    /// Replace the inference settings.
    #[must_use]
    pub fn with_config(mut self, config: InferenceConfig) -> Self {
        self.config = config;
        self
    }

    /// Current inference settings.
    pub const fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Backend kind.
    pub fn backend_type(&self) -> BackendType {
        self.backend.backend_type()
    }

    /// PCIe address.
    pub fn address(&self) -> &str {
        self.backend.address()
    }

    // ── Registers ────────────────────────────────────────────────────────

    /// Raw register read.
    ///
    /// # Errors
    ///
    /// Returns error if `offset` is not a register.
    pub fn read_reg(&self, offset: usize) -> Result<u32> {
        self.backend.read_reg(offset)
    }

    /// Raw register write.
    ///
    /// # Errors
    ///
    /// Returns error if `offset` is not a register.
    pub fn write_reg(&mut self, offset: usize, value: u32) -> Result<()> {
        self.backend.write_reg(offset, value)
    }

    /// Read `STATUS` and fail if the link is down.
    fn status(&self) -> Result<u32> {
        let value = self.backend.read_reg(regs::STATUS)?;
        if value & status::LINK_UP == 0 {
            return Err(Kc705Error::link_down(self.backend.address()));
        }
        Ok(value)
    }

    /// Soft reset: assert `RESET`, hold it for [`RESET_PULSE`], release.
    ///
    /// # Errors
    ///
    /// Returns error if a register write fails.
    pub fn reset(&mut self) -> Result<()> {
        tracing::info!("Resetting {}", self.backend.address());
        self.backend.write_reg(regs::CONTROL, control::RESET)?;
        std::thread::sleep(RESET_PULSE);
        self.backend.write_reg(regs::CONTROL, 0)
    }

    // ── Inference protocol ───────────────────────────────────────────────

    /// Copy an interleaved image into the image region and record its size.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParam` for an empty image or one larger than the
    /// image region.
    pub fn upload_image(&mut self, image: &[u8]) -> Result<()> {
        if image.is_empty() || image.len() > IMAGE.size {
            return Err(Kc705Error::invalid_param(format!(
                "image of {} bytes does not fit the {}-byte image region",
                image.len(),
                IMAGE.size
            )));
        }
        let size = u32::try_from(image.len())
            .map_err(|_| Kc705Error::invalid_param("image size exceeds 32 bits"))?;

        tracing::debug!("Uploading {} image bytes", image.len());
        self.backend.write_data(IMAGE.base, image)?;
        self.backend.write_reg(regs::IMAGE_ADDR, 0)?;
        self.backend.write_reg(regs::RESULT_ADDR, 0)?;
        self.backend.write_reg(regs::IMAGE_SIZE, size)
    }

    /// Pulse `START`.
    ///
    /// # Errors
    ///
    /// Returns `LinkDown` if the link is down, or a register write error.
    pub fn start_inference(&mut self) -> Result<()> {
        self.status()?;
        let mut value = control::START;
        if self.config.interrupts {
            value |= control::IRQ_ENABLE;
        }
        self.backend.write_reg(regs::CONTROL, value)
    }

    /// Whether `STATUS.DONE` is set.
    ///
    /// # Errors
    ///
    /// Returns `LinkDown` if the link is down.
    pub fn is_done(&self) -> Result<bool> {
        Ok(self.status()? & status::DONE != 0)
    }

    /// Poll until `wait_for` is set, checking the error and link bits first.
    fn poll_status(&self, wait_for: u32, timeout: Duration) -> Result<()> {
        let start = Instant::now();

        loop {
            let value = self.status()?;

            if value & status::ERROR != 0 {
                return Err(Kc705Error::hardware_error(format!(
                    "ERROR bit set (status={value:#x}, debug={:#x})",
                    self.backend.read_reg(regs::DEBUG).unwrap_or(0)
                )));
            }

            if value & wait_for != 0 {
                return Ok(());
            }

            if start.elapsed() > timeout {
                return Err(Kc705Error::timeout(timeout));
            }

            std::thread::sleep(self.config.poll_interval);
        }
    }

    fn read_result(&self, latency: Duration) -> Result<ClassificationResult> {
        let offset = RESULT.base + self.backend.read_reg(regs::RESULT_ADDR)? as usize;
        let mut raw = [0u8; memmap::result::LEN];
        self.backend.read_data(offset, &mut raw)?;
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);

        let result = ClassificationResult {
            class_id: word(memmap::result::CLASS_ID),
            confidence_raw: word(memmap::result::CONFIDENCE),
            processing_time_us: word(memmap::result::TIMING_US),
            latency,
        };
        tracing::debug!("Result: {result}");
        Ok(result)
    }

    /// Wait up to the configured timeout for DONE and read the result.
    ///
    /// # Errors
    ///
    /// `Timeout` if DONE does not appear in time, `HardwareError` if the
    /// board sets ERROR, `LinkDown` if the link drops.
    pub fn get_result(&self) -> Result<ClassificationResult> {
        let start = Instant::now();
        self.poll_status(status::DONE, self.config.timeout)?;
        self.read_result(start.elapsed())
    }

    /// Read the result if DONE is already set.
    ///
    /// # Errors
    ///
    /// `HardwareError` if ERROR is set, `LinkDown` if the link is down.
    pub fn get_result_nowait(&self) -> Result<Option<ClassificationResult>> {
        let value = self.status()?;
        if value & status::ERROR != 0 {
            return Err(Kc705Error::hardware_error(format!(
                "ERROR bit set (status={value:#x})"
            )));
        }
        if value & status::DONE == 0 {
            return Ok(None);
        }
        self.read_result(Duration::ZERO).map(Some)
    }

    /// Upload, start and wait for one image.
    ///
    /// # Errors
    ///
    /// Any error from the individual protocol steps. Failures are counted
    /// in the statistics.
    pub fn infer(&mut self, image: &[u8]) -> Result<ClassificationResult> {
        let start = Instant::now();
        let outcome = self
            .upload_image(image)
            .and_then(|()| self.start_inference())
            .and_then(|()| self.get_result());
        match outcome {
            Ok(mut result) => {
                result.latency = start.elapsed();
                self.stats.record(result.latency);
                Ok(result)
            }
            Err(e) => {
                self.stats.record_error();
                tracing::warn!("Inference failed: {e}");
                Err(e)
            }
        }
    }

    /// Infer a headerless 224×224 RGB file.
    ///
    /// # Errors
    ///
    /// Returns an I/O or `InvalidParam` error if the file is not a canonical
    /// image, otherwise as [`Kc705Device::infer`].
    pub fn infer_file(&mut self, path: impl AsRef<Path>) -> Result<ClassificationResult> {
        let image = RgbImage::load_canonical(path)?;
        self.infer(image.as_bytes())
    }

    /// Infer each file in turn. A failing file does not stop the batch.
    pub fn infer_batch<P: AsRef<Path>>(&mut self, files: &[P]) -> Vec<Result<ClassificationResult>> {
        let results: Vec<_> = files
            .iter()
            .map(|path| {
                let path = path.as_ref();
                self.infer_file(path).map_err(|e| {
                    tracing::warn!("Failed to process {}: {e}", path.display());
                    e
                })
            })
            .collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        tracing::info!("Batch: {ok}/{} images processed", files.len());
        results
    }

    // ── Weights ──────────────────────────────────────────────────────────

    /// Write a packed weight blob to the weight region and trigger
    /// installation through `WEIGHT_ADDR`.
    ///
    /// # Errors
    ///
    /// `InvalidParam` if the blob does not fit, `HardwareError` if the board
    /// rejects it.
    pub fn load_weight_blob(&mut self, blob: &[u8]) -> Result<()> {
        let capacity = WEIGHTS.size - memmap::weights::BLOB;
        if blob.is_empty() || blob.len() > capacity {
            return Err(Kc705Error::invalid_param(format!(
                "weight blob of {} bytes does not fit the {capacity}-byte weight region",
                blob.len()
            )));
        }
        let len = u32::try_from(blob.len())
            .map_err(|_| Kc705Error::invalid_param("weight blob exceeds 32 bits"))?;

        tracing::info!("Loading {} bytes of weights", blob.len());
        self.backend
            .write_data(WEIGHTS.base + memmap::weights::LENGTH, &len.to_le_bytes())?;
        self.backend
            .write_data(WEIGHTS.base + memmap::weights::BLOB, blob)?;
        self.backend.write_reg(regs::WEIGHT_ADDR, 0)?;

        let value = self.status()?;
        if value & status::ERROR != 0 {
            return Err(Kc705Error::hardware_error("weight blob rejected"));
        }
        Ok(())
    }

    /// Pack and load `weights`.
    ///
    /// # Errors
    ///
    /// As [`Kc705Device::load_weight_blob`].
    pub fn load_weights(&mut self, weights: &ModelWeights) -> Result<()> {
        self.load_weight_blob(&weights.pack())
    }

    /// Load a packed weight file.
    ///
    /// # Errors
    ///
    /// An I/O error if the file cannot be read, otherwise as
    /// [`Kc705Device::load_weight_blob`].
    pub fn load_weights_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let blob = std::fs::read(path.as_ref())?;
        self.load_weight_blob(&blob)
    }

    // ── Information ──────────────────────────────────────────────────────

    /// Identification and link state.
    ///
    /// # Errors
    ///
    /// Returns error if `STATUS` cannot be read.
    pub fn device_info(&self) -> Result<DeviceDetails> {
        let value = self.backend.read_reg(regs::STATUS)?;
        Ok(DeviceDetails {
            vendor_id: pcie::XILINX_VENDOR_ID,
            device_id: pcie::KC705_DEVICE_ID,
            driver_version: DRIVER_VERSION,
            backend: self.backend.backend_type(),
            address: self.backend.address().to_string(),
            link_up: value & status::LINK_UP != 0,
            link: self.backend.link(),
        })
    }

    /// Read every register.
    ///
    /// # Errors
    ///
    /// Returns error if any register read fails.
    pub fn debug_status(&self) -> Result<DebugStatus> {
        let registers = regs::ALL
            .iter()
            .map(|&offset| Ok((offset, self.backend.read_reg(offset)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(DebugStatus { registers })
    }

    /// Accumulated statistics.
    pub const fn stats(&self) -> &PerformanceStats {
        &self.stats
    }

    /// Clear accumulated statistics.
    pub fn reset_stats(&mut self) {
        self.stats = PerformanceStats::default();
    }
}

impl Drop for Kc705Device {
    fn drop(&mut self) {
        tracing::info!(
            "Closing {} ({})",
            self.backend.address(),
            self.stats
        );
    }
}
