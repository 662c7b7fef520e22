//! Opened device: driver plus its firmware control channel

use crate::control::{FirmwareIdentity, FwControl};
use crate::driver::{DeviceProperties, Driver};
use crate::drivers::KernelDriver;
use crate::error::Result;
use std::path::Path;
use std::sync::Arc;

/// One physical (or simulated) device
///
/// Resources managers hold it through an `Arc`; the driver is shared with
/// every channel they create.
#[derive(Debug)]
pub struct VdmaDevice {
    driver: Arc<dyn Driver>,
    control: FwControl,
    device_id: String,
}

impl VdmaDevice {
    /// Open a device node through the kernel driver
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` if the node is missing, or the open error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let driver: Arc<dyn Driver> = Arc::new(KernelDriver::open(path)?);
        Ok(Self::from_driver(driver, path.display().to_string()))
    }

    /// Wrap an already opened driver
    pub fn from_driver(driver: Arc<dyn Driver>, device_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        tracing::info!("Using {} device {device_id}", driver.driver_type());
        Self {
            control: FwControl::new(Arc::clone(&driver)),
            driver,
            device_id,
        }
    }

    /// Driver gateway
    pub const fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Firmware control channel
    pub const fn control(&self) -> &FwControl {
        &self.control
    }

    /// Stable id, the device path for kernel devices
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Device properties reported by the driver
    pub fn properties(&self) -> &DeviceProperties {
        self.driver.properties()
    }

    /// Query the firmware version
    ///
    /// # Errors
    ///
    /// Returns the control error.
    pub fn identify(&self) -> Result<FirmwareIdentity> {
        let identity = self.control.identify()?;
        tracing::info!(
            "Device {}: firmware {} (protocol {})",
            self.device_id,
            identity.version,
            identity.protocol_version
        );
        Ok(identity)
    }

    /// Reset the neural-network core
    ///
    /// # Errors
    ///
    /// Returns the driver error.
    pub fn reset_nn_core(&self) -> Result<()> {
        tracing::warn!("Resetting nn core of device {}", self.device_id);
        self.driver.reset_nn_core()
    }
}

impl Drop for VdmaDevice {
    fn drop(&mut self) {
        tracing::info!("Closing device {}", self.device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::SoftwareDriver;
    use crate::error::VdmaError;

    #[test]
    fn test_identify_software_device() {
        let device = VdmaDevice::from_driver(Arc::new(SoftwareDriver::new()), "sim0");
        let identity = device.identify().unwrap();
        assert_eq!(identity.version.to_string(), "4.17.0");
        assert_eq!(device.device_id(), "sim0");
        assert!(device.properties().is_fw_loaded);
    }

    #[test]
    fn test_open_missing_node() {
        assert!(matches!(
            VdmaDevice::open("/dev/hailo-missing"),
            Err(VdmaError::DeviceNotFound { .. })
        ));
    }
}
