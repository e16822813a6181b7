//! Failure modes of the host protocol.
//!
//! A scripted backend pins `STATUS` to fixed values so each wait outcome can
//! be provoked: a board that never finishes, one that raises ERROR, one whose
//! link has dropped.

use kc705_chip::regs::{self, control, status};
use kc705_driver::{
    Backend, BackendType, InferenceConfig, Kc705Device, Kc705Error, LinkInfo, Result,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Scripted {
    status: u32,
    control_writes: Arc<AtomicU32>,
    last_control: Arc<AtomicU32>,
}

impl Scripted {
    fn boxed(status: u32) -> Box<Self> {
        Box::new(Self {
            status,
            control_writes: Arc::default(),
            last_control: Arc::default(),
        })
    }
}

impl Backend for Scripted {
    fn read_reg(&self, offset: usize) -> Result<u32> {
        Ok(if offset == regs::STATUS { self.status } else { 0 })
    }

    fn write_reg(&mut self, offset: usize, value: u32) -> Result<()> {
        if offset == regs::CONTROL {
            self.control_writes.fetch_add(1, Ordering::Relaxed);
            self.last_control.store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    fn read_data(&self, _offset: usize, buffer: &mut [u8]) -> Result<()> {
        buffer.fill(0);
        Ok(())
    }

    fn write_data(&mut self, _offset: usize, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn link(&self) -> LinkInfo {
        LinkInfo::NONE
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Userspace
    }

    fn address(&self) -> &str {
        "0000:00:00.0"
    }
}

fn fast() -> InferenceConfig {
    InferenceConfig::default()
        .with_timeout(Duration::from_millis(20))
        .with_poll_interval(Duration::from_millis(1))
}

#[test]
fn test_never_done_times_out() {
    let mut dev = Kc705Device::new(Scripted::boxed(status::LINK_UP | status::BUSY)).with_config(fast());
    let started = Instant::now();
    let err = dev.infer(&[0u8; 16]).unwrap_err();
    assert!(matches!(err, Kc705Error::Timeout { duration_ms: 20 }), "{err}");
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(dev.stats().errors, 1);
}

#[test]
fn test_error_bit_is_not_a_timeout() {
    let mut dev = Kc705Device::new(Scripted::boxed(status::LINK_UP | status::ERROR)).with_config(fast());
    let err = dev.infer(&[0u8; 16]).unwrap_err();
    assert!(matches!(err, Kc705Error::HardwareError { .. }), "{err}");
    assert!(matches!(
        dev.get_result_nowait(),
        Err(Kc705Error::HardwareError { .. })
    ));
}

#[test]
fn test_link_down_is_reported() {
    let mut dev = Kc705Device::new(Scripted::boxed(status::DONE)).with_config(fast());
    assert!(matches!(
        dev.start_inference(),
        Err(Kc705Error::LinkDown { .. })
    ));
    assert!(matches!(dev.is_done(), Err(Kc705Error::LinkDown { .. })));
    assert!(!dev.device_info().unwrap().link_up);
}

#[test]
fn test_not_done_nowait_is_none() {
    let dev = Kc705Device::new(Scripted::boxed(status::LINK_UP | status::BUSY));
    assert_eq!(dev.get_result_nowait().unwrap(), None);
}

#[test]
fn test_start_sets_irq_enable_only_when_configured() {
    let backend = Scripted::boxed(status::LINK_UP);
    let last = Arc::clone(&backend.last_control);
    let mut dev = Kc705Device::new(backend);
    dev.start_inference().unwrap();
    assert_eq!(last.load(Ordering::Relaxed), control::START | control::IRQ_ENABLE);

    let backend = Scripted::boxed(status::LINK_UP);
    let last = Arc::clone(&backend.last_control);
    let mut dev = Kc705Device::new(backend).with_config(fast().with_interrupts(false));
    dev.start_inference().unwrap();
    assert_eq!(last.load(Ordering::Relaxed), control::START);
}

#[test]
fn test_reset_pulses_control() {
    let backend = Scripted::boxed(status::LINK_UP);
    let writes = Arc::clone(&backend.control_writes);
    let last = Arc::clone(&backend.last_control);
    let mut dev = Kc705Device::new(backend);
    dev.reset().unwrap();
    assert_eq!(writes.load(Ordering::Relaxed), 2);
    assert_eq!(last.load(Ordering::Relaxed), 0);
}

#[test]
fn test_error_messages() {
    assert_eq!(
        Kc705Error::timeout(Duration::from_secs(5)).to_string(),
        "Operation timeout after 5000ms"
    );
    assert_eq!(
        Kc705Error::link_down("0000:03:00.0").to_string(),
        "PCIe link down (0000:03:00.0)"
    );
    assert!(Kc705Error::NoDevicesFound.to_string().contains("KC705"));
}

#[test]
#[ignore] // Requires hardware
fn test_hardware_roundtrip() {
    let manager = kc705_driver::DeviceManager::discover().unwrap();
    let mut dev = manager.open_first().unwrap();
    dev.reset().unwrap();
    let result = dev.infer(&vec![128u8; kc705_chip::image::BYTES]).unwrap();
    assert!(result.class_id < 1000);
}
