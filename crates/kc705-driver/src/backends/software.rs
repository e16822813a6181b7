// SPDX-License-Identifier: AGPL-3.0-only

//! Software control-plane adapter
//!
//! Presents the board's register file and data BAR in host memory and runs
//! the fixed-point [`Sequencer`] on the CPU behind them, so the host protocol
//! in [`crate::Kc705Device`] is exercised bit-for-bit without a KC705.
//!
//! ## Protocol
//!
//! ```text
//! host                               adapter
//! ────                               ───────
//! write image → IMAGE region
//! IMAGE_SIZE, IMAGE_ADDR
//! CONTROL = START | IRQ_ENABLE  ──▶  STATUS = BUSY
//!                                    decode u8 image, run sequencer
//!                                    write {class, confidence, timing_us}
//!                                    STATUS = DONE, INTERRUPT |= DONE
//!                                    IMAGE_SIZE = IMAGE_ADDR = 0
//! poll STATUS.DONE              ◀──
//! read RESULT region
//! ```
//!
//! Inference runs to completion inside the `START` write, so `BUSY` is only
//! visible to code observing the adapter from another thread. Writing
//! `WEIGHT_ADDR` installs the weight record found at that offset of the
//! weight region. Faults never fail the register write; they set
//! `STATUS.ERROR` the way the gateware does.

use crate::backend::{Backend, BackendType, LinkInfo};
use crate::error::{Kc705Error, Result};
use bytes::BufMut;
use kc705_chip::memmap::{self, IMAGE, RESULT, WEIGHTS};
use kc705_chip::regs::{self, control, interrupt, status};
use kc705_pipeline::{FeatureMap, FixedPoint, ModelConfig, ModelWeights, Sequencer};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Pseudo PCIe address reported by the adapter.
pub const SOFTWARE_ADDRESS: &str = "software";

/// Software (CPU) implementation of the KC705 register interface.
#[derive(Debug)]
pub struct SoftwareBackend {
    regs: [u32; regs::REGISTER_COUNT],
    data: Vec<u8>,
    sequencer: Sequencer,
    fx: FixedPoint,
    interrupts: u64,
}

impl SoftwareBackend {
    /// Create an adapter for `config` with no weights installed.
    ///
    /// # Errors
    ///
    /// Returns a pipeline configuration error if `config` is inconsistent.
    pub fn new(config: ModelConfig) -> Result<Self> {
        let fx = FixedPoint::new(config.activation_format());
        let sequencer = Sequencer::new(config)?;
        info!(
            input = %sequencer.config().input(),
            classes = sequencer.config().num_classes(),
            "software backend ready"
        );
        Ok(Self {
            regs: [0; regs::REGISTER_COUNT],
            data: vec![0; memmap::DATA_SPACE_BYTES],
            sequencer,
            fx,
            interrupts: 0,
        })
    }

    /// Create an adapter with `weights` already installed.
    ///
    /// # Errors
    ///
    /// Returns a pipeline error if the configuration or weights are invalid.
    pub fn with_weights(config: ModelConfig, weights: ModelWeights) -> Result<Self> {
        let mut backend = Self::new(config)?;
        backend.sequencer.load_weights(weights)?;
        Ok(backend)
    }

    /// The sequencer behind the registers.
    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// Model configuration.
    pub fn config(&self) -> &ModelConfig {
        self.sequencer.config()
    }

    /// Interrupts raised since creation.
    pub const fn interrupt_count(&self) -> u64 {
        self.interrupts
    }

    fn reg(&self, offset: usize) -> u32 {
        self.regs[offset / 4]
    }

    fn set_reg(&mut self, offset: usize, value: u32) {
        self.regs[offset / 4] = value;
    }

    fn check_reg(offset: usize) -> Result<()> {
        if offset % 4 != 0 || offset >= regs::REGISTER_COUNT * 4 {
            return Err(Kc705Error::transfer_failed(format!(
                "No register at offset {offset:#x}"
            )));
        }
        Ok(())
    }

    fn check_data(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(Kc705Error::transfer_failed(format!(
                "Out of bounds access: offset={offset:#x}, size={len}, limit={:#x}",
                self.data.len()
            ))),
        }
    }

    fn control(&mut self, value: u32) {
        if value & control::RESET != 0 {
            self.reset();
            self.set_reg(regs::CONTROL, value);
            return;
        }
        self.set_reg(regs::CONTROL, value & !control::START);
        if value & control::START != 0 {
            self.run();
        }
    }

    fn reset(&mut self) {
        debug!("soft reset");
        self.sequencer.reset();
        self.sequencer.clear_saturations();
        self.regs = [0; regs::REGISTER_COUNT];
    }

    fn raise(&mut self, flag: u32) {
        if self.reg(regs::CONTROL) & control::IRQ_ENABLE != 0 {
            let pending = self.reg(regs::INTERRUPT) | flag;
            self.set_reg(regs::INTERRUPT, pending);
            self.interrupts += 1;
        }
    }

    fn fault(&mut self, reason: &str) {
        warn!(reason, "adapter fault");
        self.set_reg(regs::STATUS, status::ERROR);
        self.raise(interrupt::ERROR);
    }

    fn run(&mut self) {
        self.set_reg(regs::STATUS, status::BUSY);
        let started = Instant::now();
        match self.classify() {
            Ok((class_id, confidence)) => {
                let micros = u32::try_from(started.elapsed().as_micros()).unwrap_or(u32::MAX);
                if let Err(e) = self.write_result(class_id, confidence, micros) {
                    self.fault(&e.to_string());
                    return;
                }
                debug!(class_id, confidence, micros, "inference complete");
                self.set_reg(regs::STATUS, status::DONE);
                self.raise(interrupt::DONE);
            }
            Err(e) => self.fault(&e.to_string()),
        }
        self.set_reg(regs::IMAGE_SIZE, 0);
        self.set_reg(regs::IMAGE_ADDR, 0);
    }

    fn classify(&mut self) -> Result<(u32, u32)> {
        let shape = self.sequencer.config().input();
        let size = self.reg(regs::IMAGE_SIZE) as usize;
        if size != shape.volume() {
            return Err(Kc705Error::invalid_param(format!(
                "IMAGE_SIZE is {size} bytes, model expects {} ({shape})",
                shape.volume()
            )));
        }
        let start = IMAGE.base + self.reg(regs::IMAGE_ADDR) as usize;
        if !IMAGE.contains(start, size) {
            return Err(Kc705Error::transfer_failed(format!(
                "image [{start:#x}, +{size}) leaves the image region"
            )));
        }
        let image = FeatureMap::from_interleaved_u8(&self.fx, shape, &self.data[start..start + size])?;
        let result = self.sequencer.infer(&image)?;
        Ok((result.class_id, result.confidence))
    }

    fn write_result(&mut self, class_id: u32, confidence: u32, micros: u32) -> Result<()> {
        let start = RESULT.base + self.reg(regs::RESULT_ADDR) as usize;
        if !RESULT.contains(start, memmap::result::LEN) {
            return Err(Kc705Error::transfer_failed(format!(
                "result at {start:#x} leaves the result region"
            )));
        }
        let mut out = &mut self.data[start..start + memmap::result::LEN];
        out.put_u32_le(class_id);
        out.put_u32_le(confidence);
        out.put_u32_le(micros);
        Ok(())
    }

    fn install_weights(&mut self) -> Result<()> {
        let record = WEIGHTS.base + self.reg(regs::WEIGHT_ADDR) as usize;
        if !WEIGHTS.contains(record, memmap::weights::BLOB) {
            return Err(Kc705Error::transfer_failed(format!(
                "weight record at {record:#x} leaves the weight region"
            )));
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&self.data[record..record + 4]);
        let len = u32::from_le_bytes(len) as usize;
        let blob = record + memmap::weights::BLOB;
        if !WEIGHTS.contains(blob, len) {
            return Err(Kc705Error::transfer_failed(format!(
                "{len}-byte weight blob leaves the weight region"
            )));
        }
        let weights = ModelWeights::unpack(&self.data[blob..blob + len])?;
        self.sequencer.load_weights(weights)?;
        Ok(())
    }
}

impl Backend for SoftwareBackend {
    fn read_reg(&self, offset: usize) -> Result<u32> {
        Self::check_reg(offset)?;
        let value = match offset {
            regs::STATUS => self.reg(offset) | status::LINK_UP,
            regs::DEBUG => u32::try_from(self.sequencer.saturation_count()).unwrap_or(u32::MAX),
            _ => self.reg(offset),
        };
        tracing::trace!("Read {} = {value:#x}", regs::name(offset));
        Ok(value)
    }

    fn write_reg(&mut self, offset: usize, value: u32) -> Result<()> {
        Self::check_reg(offset)?;
        tracing::trace!("Write {} = {value:#x}", regs::name(offset));
        match offset {
            regs::CONTROL => self.control(value),
            regs::STATUS | regs::DEBUG => {
                debug!("ignoring write to read-only {}", regs::name(offset));
            }
            regs::INTERRUPT => {
                let pending = self.reg(offset) & !value;
                self.set_reg(offset, pending);
            }
            regs::WEIGHT_ADDR => {
                self.set_reg(offset, value);
                if let Err(e) = self.install_weights() {
                    self.fault(&e.to_string());
                }
            }
            _ => self.set_reg(offset, value),
        }
        Ok(())
    }

    fn read_data(&self, offset: usize, buffer: &mut [u8]) -> Result<()> {
        self.check_data(offset, buffer.len())?;
        buffer.copy_from_slice(&self.data[offset..offset + buffer.len()]);
        Ok(())
    }

    fn write_data(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_data(offset, data.len())?;
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn link(&self) -> LinkInfo {
        LinkInfo::NONE
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Software
    }

    fn address(&self) -> &str {
        SOFTWARE_ADDRESS
    }
}
