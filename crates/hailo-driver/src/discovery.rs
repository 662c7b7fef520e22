//! Runtime device discovery
//!
//! Scans `/dev/hailo*` for device nodes. Nothing is opened here; see
//! [`DeviceInfo::open`].

use crate::device::VdmaDevice;
use crate::error::{Result, VdmaError};
use std::path::PathBuf;

/// Device nodes probed per scan
const MAX_DEVICES: usize = 16;

const DEVICE_PREFIX: &str = "/dev/hailo";

/// A device node found by [`scan_devices`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device index (0, 1, 2, ...)
    pub index: usize,

    /// Device file path (/dev/hailo0, etc.)
    pub path: PathBuf,
}

impl DeviceInfo {
    /// Open the device through the kernel driver
    ///
    /// # Errors
    ///
    /// Returns error if the node cannot be opened or queried.
    pub fn open(&self) -> Result<VdmaDevice> {
        VdmaDevice::open(&self.path)
    }
}

/// List the Hailo device nodes on this system
///
/// # Errors
///
/// Returns `VdmaError::NoDevicesFound` if no node exists.
pub fn scan_devices() -> Result<Vec<DeviceInfo>> {
    scan_prefix(DEVICE_PREFIX)
}

fn scan_prefix(prefix: &str) -> Result<Vec<DeviceInfo>> {
    tracing::info!("Scanning for devices at {prefix}*");

    let devices: Vec<DeviceInfo> = (0..MAX_DEVICES)
        .map(|index| DeviceInfo {
            index,
            path: PathBuf::from(format!("{prefix}{index}")),
        })
        .filter(|info| info.path.exists())
        .inspect(|info| tracing::debug!("Found device file: {}", info.path.display()))
        .collect();

    if devices.is_empty() {
        tracing::error!("No Hailo devices found");
        return Err(VdmaError::NoDevicesFound);
    }
    tracing::info!("Discovered {} device(s)", devices.len());
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_finds_numbered_nodes() {
        let dir = std::env::temp_dir().join(format!("hailo-scan-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for index in [0, 2] {
            std::fs::write(dir.join(format!("node{index}")), b"").unwrap();
        }
        std::fs::write(dir.join("node99"), b"").unwrap();

        let prefix = format!("{}/node", dir.display());
        let devices = scan_prefix(&prefix).unwrap();
        let indices: Vec<usize> = devices.iter().map(|d| d.index).collect();
        assert_eq!(indices, [0, 2]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_scan_without_nodes() {
        assert!(matches!(
            scan_prefix("/nonexistent/hailo"),
            Err(VdmaError::NoDevicesFound)
        ));
    }

    #[test]
    #[ignore] // Requires hardware
    fn test_scan_real_devices() {
        let devices = scan_devices().unwrap();
        let device = devices[0].open().unwrap();
        println!("Opened {}", device.device_id());
    }
}
