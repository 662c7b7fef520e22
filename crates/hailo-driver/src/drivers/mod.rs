//! Driver implementations
//!
//! Two drivers available:
//! - **Kernel**: `/dev/hailo*` ioctls against the PCIe kernel module
//! - **Software**: in-process simulated device with H2D→D2H loopback,
//!   simulated firmware and an event log (CI, tests)

pub mod kernel;
pub mod software;

pub use kernel::KernelDriver;
pub use software::{DeviceEvent, SoftwareDriver};
