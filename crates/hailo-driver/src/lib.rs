//! Host-side vDMA runtime for Hailo PCIe accelerators.
//!
//! Moves tensors between host memory and the accelerator's DMA channels,
//! builds the firmware program of a compiled network group and drives its
//! context-switch state machine.
//!
//! # Layers
//!
//! ```text
//! InputStream / OutputStream      blocking frame I/O
//!         │
//! ResourcesManager  ──▶  ActivatedNetworkGroup (teardown on drop)
//!   channels, cfg / inter-context / DDR buffers, context programs
//!         │
//! VdmaChannel       descriptor ring + pending-transfer ring
//!         │
//! SgBuffer = DescriptorList + MappedBuffer
//!         │
//! Driver:  KernelDriver (/dev/hailo*)  |  SoftwareDriver (simulated)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use hailo_driver::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! # let metadata: Arc<NetworkGroupMetadata> = Arc::default();
//! let device = Arc::new(VdmaDevice::open("/dev/hailo0")?);
//! let mut manager = build(device, ConfigureParams::default(), metadata, 0)?;
//!
//! let input = manager.input_stream("net/input")?;
//! let output = manager.output_stream("net/output")?;
//! let _active = manager.activate(&[input.clone()], &[output.clone()], 0)?;
//!
//! input.write(&vec![0u8; input.frame_size() as usize])?;
//! let mut frame = vec![0u8; output.frame_size() as usize];
//! output.read(&mut frame)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod action_list;
mod activation;
pub mod config;
pub mod control;
mod device;
mod discovery;
pub mod driver;
pub mod drivers;
mod error;
pub mod metadata;
mod registry;
pub mod resources;
mod stream;
pub mod vdma;

pub use activation::ActivatedNetworkGroup;
pub use config::{ConfigureParams, LatencyMeasurement, NetworkParams, PowerMode, StreamParams};
pub use control::{DownloadedActionList, FirmwareIdentity, FwControl};
pub use device::VdmaDevice;
pub use discovery::{scan_devices, DeviceInfo};
pub use driver::{DeviceProperties, Driver, DriverType, InterruptsDomain};
pub use drivers::{KernelDriver, SoftwareDriver};
pub use error::{Result, VdmaError};
pub use metadata::NetworkGroupMetadata;
pub use registry::{
    network_group_key, ConfiguredNetworkGroups, NetworkGroupKey, NetworkGroupRegistry, SharedNetworkGroup,
};
pub use resources::{build, ResourcesManager};
pub use stream::{InputStream, OutputStream};
pub use vdma::VdmaChannel;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        build, ActivatedNetworkGroup, ConfigureParams, ConfiguredNetworkGroups, InputStream,
        NetworkGroupMetadata, NetworkGroupRegistry, NetworkParams, OutputStream, ResourcesManager,
        Result, StreamParams, VdmaDevice, VdmaError,
    };
}
