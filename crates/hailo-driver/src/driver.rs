//! Driver abstraction for the vDMA runtime
//!
//! Every hardware interaction of the runtime goes through [`Driver`]: buffer
//! pinning, descriptor lists, channel control, interrupt waits, register
//! access and firmware control. Two implementations exist:
//!
//! ```text
//! KernelDriver    /dev/hailo* ioctls (production)
//! SoftwareDriver  in-process simulated device (CI, tests)
//! ```

use crate::error::{Result, VdmaError};
use crate::vdma::DescriptorRegion;
use bitflags::bitflags;
use hailo_chip::control::CpuId;
use hailo_chip::descriptor::{DmaType, MAX_DESC_PAGE_SIZE};
use hailo_chip::vdma::{ChannelId, Direction, DEFAULT_ENGINES_COUNT};
use std::fmt::Debug;
use std::ptr::NonNull;
use std::time::Duration;

/// Gateway to the accelerator's kernel-mode driver
///
/// All calls are synchronous. Interrupt waits return [`VdmaError::Timeout`]
/// as a distinct, non-fatal status; everything else that fails is fatal to
/// the call and never retried here.
pub trait Driver: Debug + Send + Sync {
    /// Device properties queried at open time
    fn properties(&self) -> &DeviceProperties;

    /// Driver flavour, for logs
    fn driver_type(&self) -> DriverType;

    /// Read device memory
    ///
    /// # Errors
    ///
    /// Returns error if the address is invalid for `memory_type` or the
    /// transfer fails.
    fn read_memory(&self, memory_type: MemoryType, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Write device memory
    ///
    /// # Errors
    ///
    /// Returns error if the address is invalid for `memory_type` or the
    /// transfer fails.
    fn write_memory(&self, memory_type: MemoryType, address: u64, data: &[u8]) -> Result<()>;

    /// Read a per-channel vDMA register (see `hailo_chip::regs`)
    ///
    /// `direction` selects the host-side (channel's own direction) or
    /// device-side block.
    ///
    /// # Errors
    ///
    /// Returns error for `Direction::Both` or if the driver call fails.
    fn read_vdma_channel_register(
        &self,
        channel_id: ChannelId,
        direction: Direction,
        offset: usize,
        reg_size: usize,
    ) -> Result<u32>;

    /// Write a per-channel vDMA register
    ///
    /// # Errors
    ///
    /// Returns error for `Direction::Both` or if the driver call fails.
    fn write_vdma_channel_register(
        &self,
        channel_id: ChannelId,
        direction: Direction,
        offset: usize,
        reg_size: usize,
        data: u32,
    ) -> Result<()>;

    /// Pin and IOMMU-map a user buffer
    ///
    /// # Safety
    ///
    /// `address` must be valid for reads and writes of `size` bytes and must
    /// stay allocated until the returned handle is passed to
    /// [`Driver::vdma_buffer_unmap`]; the device may access it at any time in
    /// between.
    ///
    /// # Errors
    ///
    /// Returns error if the driver refuses the mapping.
    unsafe fn vdma_buffer_map(
        &self,
        address: NonNull<u8>,
        size: usize,
        direction: Direction,
    ) -> Result<BufferHandle>;

    /// Release a mapping created by [`Driver::vdma_buffer_map`]
    ///
    /// # Errors
    ///
    /// Returns error if the handle is unknown.
    fn vdma_buffer_unmap(&self, handle: BufferHandle) -> Result<()>;

    /// Cache-sync a mapped range for the given access direction
    ///
    /// # Errors
    ///
    /// Returns error for `Direction::Both` or an out-of-range sync.
    fn vdma_buffer_sync(
        &self,
        handle: BufferHandle,
        direction: Direction,
        offset: usize,
        size: usize,
    ) -> Result<()>;

    /// Allocate a descriptor list of `desc_count` entries
    ///
    /// # Errors
    ///
    /// Returns error if the driver is out of descriptor memory.
    fn descriptors_list_create(&self, desc_count: u32) -> Result<DescriptorListInfo>;

    /// Map a descriptor list into host memory
    ///
    /// # Errors
    ///
    /// Returns error if the list is unknown or the mapping fails.
    fn descriptors_list_map(
        &self,
        handle: DescriptorListHandle,
        desc_count: u32,
    ) -> Result<DescriptorRegion>;

    /// Free a descriptor list
    ///
    /// # Errors
    ///
    /// Returns error if the list is unknown.
    fn descriptors_list_release(&self, handle: DescriptorListHandle) -> Result<()>;

    /// Point the descriptors of a list at consecutive pages of a mapped
    /// buffer, starting `offset` bytes into the buffer
    ///
    /// `channel` is the channel the list serves, `None` for lists firmware
    /// hands between channels.
    ///
    /// # Errors
    ///
    /// Returns error if either handle is unknown or the offset is invalid.
    fn descriptors_list_bind_vdma_buffer(
        &self,
        desc_handle: DescriptorListHandle,
        buffer_handle: BufferHandle,
        page_size: u16,
        channel: Option<ChannelId>,
        offset: usize,
    ) -> Result<()>;

    /// Enable a channel and acquire its handle
    ///
    /// # Errors
    ///
    /// Returns error if the channel is already owned or the call fails.
    fn vdma_channel_enable(
        &self,
        channel_id: ChannelId,
        direction: Direction,
        measure_timestamps: bool,
    ) -> Result<ChannelHandle>;

    /// Disable a channel and release its handle
    ///
    /// # Errors
    ///
    /// Returns error if the handle does not own the channel.
    fn vdma_channel_disable(&self, channel_id: ChannelId, handle: ChannelHandle) -> Result<()>;

    /// Abort a channel; blocked interrupt waits return `AbortedByUser`
    ///
    /// # Errors
    ///
    /// Returns error if the handle does not own the channel.
    fn vdma_channel_abort(&self, channel_id: ChannelId, handle: ChannelHandle) -> Result<()>;

    /// Clear a previous abort
    ///
    /// # Errors
    ///
    /// Returns error if the handle does not own the channel.
    fn vdma_channel_clear_abort(&self, channel_id: ChannelId, handle: ChannelHandle)
        -> Result<()>;

    /// Block until the channel raises interrupts or `timeout` expires
    ///
    /// # Errors
    ///
    /// `Timeout` on expiry, `AbortedByUser` when aborted, `NotActivated`
    /// when the channel was disabled under the waiter.
    fn wait_channel_interrupts(
        &self,
        channel_id: ChannelId,
        handle: ChannelHandle,
        timeout: Duration,
    ) -> Result<ChannelInterruptTimestampList>;

    /// Send one framed control to firmware and return the raw response
    ///
    /// Framing and digest verification are done by [`crate::control`].
    ///
    /// # Errors
    ///
    /// Returns error if the driver call fails or times out.
    fn fw_control(
        &self,
        request: &[u8],
        request_md5: &[u8; 16],
        timeout: Duration,
        cpu_id: CpuId,
    ) -> Result<FwControlResponse>;

    /// Reset the neural-network core
    ///
    /// # Errors
    ///
    /// Returns error if the driver call fails.
    fn reset_nn_core(&self) -> Result<()>;

    /// Clamp a requested descriptor page size to what the device supports
    fn calc_desc_page_size(&self, requested: u16) -> u16 {
        let max = self.properties().desc_max_page_size;
        if requested > max {
            tracing::warn!(
                "Requested desc page size {requested} is larger than the device maximum {max}, using {max}"
            );
            max
        } else {
            requested
        }
    }

    /// DMA flavour, which selects the interrupt bit layout
    fn dma_type(&self) -> DmaType {
        self.properties().dma_type
    }

    /// Number of DMA engines
    fn dma_engines_count(&self) -> u8 {
        self.properties().dma_engines_count
    }
}

/// Handle to a mapped host buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(u64);

/// Handle to a kernel descriptor list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorListHandle(u64);

/// Handle to an enabled channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(u64);

macro_rules! handle_impl {
    ($($name:ident),*) => {$(
        impl $name {
            /// Wrap a raw driver handle
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Raw driver handle
            pub const fn raw(&self) -> u64 {
                self.0
            }
        }
    )*};
}

handle_impl!(BufferHandle, DescriptorListHandle, ChannelHandle);

/// A freshly created descriptor list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorListInfo {
    /// Driver handle, also the mmap offset of the list
    pub handle: DescriptorListHandle,
    /// Device-visible address of the first descriptor
    pub dma_address: u64,
}

/// Properties of an opened device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProperties {
    /// Largest descriptor page size the device accepts
    pub desc_max_page_size: u16,
    /// DMA flavour
    pub dma_type: DmaType,
    /// Number of DMA engines
    pub dma_engines_count: u8,
    /// Whether firmware is loaded and answering controls
    pub is_fw_loaded: bool,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            desc_max_page_size: MAX_DESC_PAGE_SIZE,
            dma_type: DmaType::Pcie,
            dma_engines_count: DEFAULT_ENGINES_COUNT,
            is_fw_loaded: true,
        }
    }
}

/// Device memory spaces reachable by `read_memory` / `write_memory`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Device address space through the firmware window
    DirectMemory,
    /// vDMA engine 0 register space
    Vdma0,
    /// PCIe BAR 0
    PcieBar0,
    /// PCIe BAR 2
    PcieBar2,
    /// PCIe BAR 4
    PcieBar4,
    /// DMA engine 0 register space
    DmaEngine0,
}

impl MemoryType {
    /// Wire value used by the memory transfer ioctl
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::DirectMemory => 0,
            Self::Vdma0 => 1,
            Self::PcieBar0 => 4,
            Self::PcieBar2 => 5,
            Self::PcieBar4 => 6,
            Self::DmaEngine0 => 7,
        }
    }

    /// PCIe BAR windows are addressed with 32 bits
    pub const fn is_pcie_bar(self) -> bool {
        matches!(self, Self::PcieBar0 | Self::PcieBar2 | Self::PcieBar4)
    }
}

bitflags! {
    /// Who gets interrupted when a descriptor completes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InterruptsDomain: u8 {
        /// The device (firmware) is interrupted
        const DEVICE = 1 << 0;
        /// The host is interrupted
        const HOST = 1 << 1;
        /// Both sides are interrupted
        const BOTH = Self::DEVICE.bits() | Self::HOST.bits();
    }
}

impl InterruptsDomain {
    /// No interrupts
    pub const NONE: Self = Self::empty();
}

/// One interrupt reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInterruptTimestamp {
    /// Monotonic time the interrupt was raised
    pub timestamp: Duration,
    /// `NUM_PROCESSED` at the time of the interrupt
    pub desc_num_processed: u16,
}

/// Interrupts returned by one wait, at most
/// `hailo_chip::vdma::MAX_IRQ_TIMESTAMPS_SIZE` entries; empty unless
/// timestamps were requested at enable time
pub type ChannelInterruptTimestampList = Vec<ChannelInterruptTimestamp>;

/// Raw firmware control response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwControlResponse {
    /// Response frame, header included
    pub response: Vec<u8>,
    /// Digest the firmware computed over `response`
    pub md5: [u8; 16],
}

/// Driver implementation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverType {
    /// Kernel driver (/dev/hailo*)
    Kernel,

    /// Software (simulated device), no hardware required
    Software,
}

impl std::fmt::Display for DriverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kernel => write!(f, "Kernel"),
            Self::Software => write!(f, "Software (simulated device)"),
        }
    }
}

/// Reject `Direction::Both` where a single direction is required
pub(crate) fn require_single_direction(direction: Direction, operation: &str) -> Result<()> {
    if direction == Direction::Both {
        return Err(VdmaError::invalid_argument(format!(
            "{operation} requires H2D or D2H, got {direction}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupts_domain() {
        assert!(InterruptsDomain::BOTH.contains(InterruptsDomain::HOST));
        assert!(InterruptsDomain::BOTH.contains(InterruptsDomain::DEVICE));
        assert!(InterruptsDomain::NONE.is_empty());
    }

    #[test]
    fn test_single_direction() {
        assert!(require_single_direction(Direction::H2D, "sync").is_ok());
        assert!(matches!(
            require_single_direction(Direction::Both, "sync"),
            Err(VdmaError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_bar_addressing() {
        assert!(MemoryType::PcieBar0.is_pcie_bar());
        assert!(!MemoryType::DirectMemory.is_pcie_bar());
    }
}
