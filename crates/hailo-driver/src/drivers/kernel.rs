//! Kernel driver: `/dev/hailo*` ioctls
//!
//! Every [`Driver`] call is one ioctl (memory transfers are chunked) on the
//! device node. Descriptor lists are mapped by `mmap`ing the node at the
//! list handle. Parameter blocks are `#[repr(C)]` mirrors of the kernel ABI.
//!
//! Errno mapping:
//!
//! ```text
//! ETIMEDOUT    → Timeout
//! ECONNABORTED → AbortedByUser
//! ECONNRESET   → NotActivated
//! other        → Driver { operation, errno }
//! ```

// ioctl parameter blocks use the kernel's field widths
#![allow(clippy::cast_possible_truncation)]

use crate::driver::{
    require_single_direction, BufferHandle, ChannelHandle, ChannelInterruptTimestamp,
    ChannelInterruptTimestampList, DescriptorListHandle, DescriptorListInfo, DeviceProperties,
    Driver, DriverType, FwControlResponse, MemoryType,
};
use crate::error::{Result, VdmaError};
use crate::vdma::{DescriptorRegion, VdmaDescriptor};
use bytemuck::Zeroable;
use hailo_chip::control::{CpuId, MAX_CONTROL_LENGTH, MD5_LENGTH};
use hailo_chip::descriptor::{DmaType, DESCRIPTOR_SIZE};
use hailo_chip::vdma::{ChannelId, Direction, INVALID_CHANNEL_INDEX, MAX_IRQ_TIMESTAMPS_SIZE};
use rustix::fs::OFlags;
use rustix::mm::{mmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::raw::c_ulong;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::time::Duration;

/// Bytes moved by one memory transfer ioctl
const MAX_MEMORY_TRANSFER_LENGTH: usize = 128;

/// Driver ioctl numbers
///
/// Encoded as `_IOC(dir, 'g', nr, size_of::<params>())`.
mod ioctls {
    use std::os::raw::c_ulong;

    const MAGIC: u8 = b'g';
    const IOC_NONE: c_ulong = 0;
    const IOC_WRITE: c_ulong = 1;
    const IOC_READ: c_ulong = 2;

    const fn ioc(dir: c_ulong, nr: u8, size: usize) -> c_ulong {
        (dir << 30) | ((size as c_ulong) << 16) | ((MAGIC as c_ulong) << 8) | (nr as c_ulong)
    }

    const fn io(nr: u8) -> c_ulong {
        ioc(IOC_NONE, nr, 0)
    }

    const fn ior<T>(nr: u8) -> c_ulong {
        ioc(IOC_READ, nr, std::mem::size_of::<T>())
    }

    const fn iow<T>(nr: u8) -> c_ulong {
        ioc(IOC_WRITE, nr, std::mem::size_of::<T>())
    }

    const fn iowr<T>(nr: u8) -> c_ulong {
        ioc(IOC_READ | IOC_WRITE, nr, std::mem::size_of::<T>())
    }

    pub const QUERY_DEVICE_PROPERTIES: c_ulong = ior::<super::DevicePropertiesParams>(0);
    pub const MEMORY_TRANSFER: c_ulong = iowr::<super::MemoryTransferParams>(1);
    pub const VDMA_CHANNEL_ENABLE: c_ulong = iowr::<super::ChannelEnableParams>(2);
    pub const VDMA_CHANNEL_DISABLE: c_ulong = iow::<super::ChannelHandleParams>(3);
    pub const VDMA_CHANNEL_WAIT_INT: c_ulong = iowr::<super::ChannelWaitParams>(4);
    pub const VDMA_CHANNEL_ABORT: c_ulong = iow::<super::ChannelHandleParams>(5);
    pub const VDMA_CHANNEL_CLEAR_ABORT: c_ulong = iow::<super::ChannelHandleParams>(6);
    pub const VDMA_CHANNEL_READ_REGISTER: c_ulong = iowr::<super::ChannelRegisterParams>(7);
    pub const VDMA_CHANNEL_WRITE_REGISTER: c_ulong = iow::<super::ChannelRegisterParams>(8);
    pub const VDMA_BUFFER_MAP: c_ulong = iowr::<super::BufferMapParams>(9);
    pub const VDMA_BUFFER_UNMAP: c_ulong = iow::<u64>(10);
    pub const VDMA_BUFFER_SYNC: c_ulong = iow::<super::BufferSyncParams>(11);
    pub const DESC_LIST_CREATE: c_ulong = iowr::<super::DescListCreateParams>(12);
    pub const DESC_LIST_RELEASE: c_ulong = iow::<u64>(13);
    pub const DESC_LIST_BIND_VDMA_BUFFER: c_ulong = iow::<super::DescListBindParams>(14);
    pub const FW_CONTROL: c_ulong = iowr::<super::FwControlParams>(15);
    pub const RESET_NN_CORE: c_ulong = io(16);
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Zeroable)]
struct DevicePropertiesParams {
    desc_max_page_size: u16,
    dma_type: u8,
    dma_engines_count: u8,
    is_fw_loaded: u8,
    reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable)]
struct MemoryTransferParams {
    transfer_direction: u32,
    memory_type: u32,
    address: u64,
    count: u64,
    buffer: [u8; MAX_MEMORY_TRANSFER_LENGTH],
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable)]
struct ChannelEnableParams {
    engine_index: u8,
    channel_index: u8,
    direction: u8,
    enable_timestamps_measure: u8,
    reserved: [u8; 4],
    channel_handle: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable)]
struct ChannelHandleParams {
    engine_index: u8,
    channel_index: u8,
    reserved: [u8; 6],
    channel_handle: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable)]
struct IrqTimestampParams {
    timestamp_ns: u64,
    desc_num_processed: u16,
    reserved: [u8; 6],
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable)]
struct ChannelWaitParams {
    engine_index: u8,
    channel_index: u8,
    reserved: [u8; 2],
    timeout_ms: u32,
    channel_handle: u64,
    timestamps_count: u32,
    reserved2: u32,
    timestamps: [IrqTimestampParams; MAX_IRQ_TIMESTAMPS_SIZE],
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable)]
struct ChannelRegisterParams {
    engine_index: u8,
    channel_index: u8,
    direction: u8,
    reserved: u8,
    offset: u32,
    reg_size: u32,
    data: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable)]
struct BufferMapParams {
    user_address: u64,
    size: u64,
    data_direction: u32,
    reserved: u32,
    mapped_handle: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable)]
struct BufferSyncParams {
    handle: u64,
    sync_type: u32,
    reserved: u32,
    offset: u64,
    count: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable)]
struct DescListCreateParams {
    desc_count: u64,
    desc_handle: u64,
    dma_address: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable)]
struct DescListBindParams {
    buffer_handle: u64,
    desc_handle: u64,
    desc_page_size: u16,
    channel_index: u8,
    reserved: u8,
    offset: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable)]
struct FwControlParams {
    expected_md5: [u8; MD5_LENGTH],
    buffer_len: u32,
    buffer: [u8; MAX_CONTROL_LENGTH],
    timeout_ms: u32,
    cpu_id: u32,
}

const TRANSFER_READ: u32 = 0;
const TRANSFER_WRITE: u32 = 1;

const SYNC_FOR_DEVICE: u32 = 0;
const SYNC_FOR_HOST: u32 = 1;

const fn direction_to_raw(direction: Direction) -> u8 {
    match direction {
        Direction::H2D => 0,
        Direction::D2H => 1,
        Direction::Both => 2,
    }
}

fn timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn errno_to_error(operation: &'static str, errno: i32) -> VdmaError {
    match errno {
        libc::ETIMEDOUT => VdmaError::Timeout { duration_ms: 0 },
        libc::ECONNABORTED => VdmaError::AbortedByUser,
        libc::ECONNRESET => VdmaError::NotActivated,
        _ => {
            tracing::error!("Driver call {operation} failed with errno {errno}");
            VdmaError::driver(operation, errno)
        }
    }
}

/// Issue one ioctl with a parameter block
///
/// # Safety
///
/// `request` must be an ioctl whose argument is a pointer to a `T` laid out
/// as the kernel expects.
unsafe fn ioctl<T>(file: &File, operation: &'static str, request: c_ulong, params: &mut T) -> Result<()> {
    // SAFETY: driver ioctl with a parameter block. Invariants: (1) fd valid while `file` is
    // borrowed; (2) params is an exclusive, live T for the whole call; (3) caller guarantees
    // request/T pairing, so the kernel reads and writes within size_of::<T>().
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as _, std::ptr::from_mut(params)) };
    if ret < 0 {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        return Err(errno_to_error(operation, errno));
    }
    Ok(())
}

/// Kernel-mode driver gateway for one device node
#[derive(Debug)]
pub struct KernelDriver {
    file: File,
    path: PathBuf,
    properties: DeviceProperties,
}

impl KernelDriver {
    /// Open a device node and query its properties
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` if the node does not exist, `Io` if it
    /// cannot be opened, or the driver error from the properties query.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VdmaError::DeviceNotFound {
                path: path.to_path_buf(),
            });
        }

        // SAFETY: OFlags::NONBLOCK.bits() is always a valid i32 value (flag bits are small positive values)
        #[allow(clippy::cast_possible_wrap)]
        let nonblock_flag = OFlags::NONBLOCK.bits() as i32;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nonblock_flag)
            .open(path)?;

        let mut params = DevicePropertiesParams::zeroed();
        // SAFETY: QUERY_DEVICE_PROPERTIES takes a DevicePropertiesParams.
        unsafe {
            ioctl(
                &file,
                "query_device_properties",
                ioctls::QUERY_DEVICE_PROPERTIES,
                &mut params,
            )
        }?;

        let dma_type = match params.dma_type {
            0 => DmaType::Pcie,
            1 => DmaType::Dram,
            other => {
                return Err(VdmaError::malformed(format!(
                    "Unknown DMA type {other} reported by {}",
                    path.display()
                )))
            }
        };
        let properties = DeviceProperties {
            desc_max_page_size: params.desc_max_page_size,
            dma_type,
            dma_engines_count: params.dma_engines_count.max(1),
            is_fw_loaded: params.is_fw_loaded != 0,
        };

        tracing::info!(
            "Opened {}: {dma_type:?} DMA, {} engine(s), max desc page {}, fw loaded: {}",
            path.display(),
            properties.dma_engines_count,
            properties.desc_max_page_size,
            properties.is_fw_loaded
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            properties,
        })
    }

    /// Device node path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_address(memory_type: MemoryType, address: u64, len: usize) -> Result<()> {
        if memory_type.is_pcie_bar() && address.saturating_add(len as u64) > u64::from(u32::MAX) {
            return Err(VdmaError::invalid_argument(format!(
                "Address out of range {address:#x} for {memory_type:?}"
            )));
        }
        Ok(())
    }

    fn channel_call(&self, operation: &'static str, request: c_ulong, channel_id: ChannelId, handle: ChannelHandle) -> Result<()> {
        let mut params = ChannelHandleParams {
            engine_index: channel_id.engine_index,
            channel_index: channel_id.channel_index,
            channel_handle: handle.raw(),
            ..ChannelHandleParams::zeroed()
        };
        // SAFETY: channel disable/abort/clear-abort all take a ChannelHandleParams.
        unsafe { ioctl(&self.file, operation, request, &mut params) }
    }
}

impl Driver for KernelDriver {
    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Kernel
    }

    fn read_memory(&self, memory_type: MemoryType, address: u64, buf: &mut [u8]) -> Result<()> {
        Self::check_address(memory_type, address, buf.len())?;
        for (index, chunk) in buf.chunks_mut(MAX_MEMORY_TRANSFER_LENGTH).enumerate() {
            let mut params = MemoryTransferParams {
                transfer_direction: TRANSFER_READ,
                memory_type: memory_type.as_u32(),
                address: address + (index * MAX_MEMORY_TRANSFER_LENGTH) as u64,
                count: chunk.len() as u64,
                ..MemoryTransferParams::zeroed()
            };
            // SAFETY: MEMORY_TRANSFER takes a MemoryTransferParams.
            unsafe { ioctl(&self.file, "memory_transfer", ioctls::MEMORY_TRANSFER, &mut params) }?;
            chunk.copy_from_slice(&params.buffer[..chunk.len()]);
        }
        Ok(())
    }

    fn write_memory(&self, memory_type: MemoryType, address: u64, data: &[u8]) -> Result<()> {
        Self::check_address(memory_type, address, data.len())?;
        for (index, chunk) in data.chunks(MAX_MEMORY_TRANSFER_LENGTH).enumerate() {
            let mut params = MemoryTransferParams {
                transfer_direction: TRANSFER_WRITE,
                memory_type: memory_type.as_u32(),
                address: address + (index * MAX_MEMORY_TRANSFER_LENGTH) as u64,
                count: chunk.len() as u64,
                ..MemoryTransferParams::zeroed()
            };
            params.buffer[..chunk.len()].copy_from_slice(chunk);
            // SAFETY: MEMORY_TRANSFER takes a MemoryTransferParams.
            unsafe { ioctl(&self.file, "memory_transfer", ioctls::MEMORY_TRANSFER, &mut params) }?;
        }
        Ok(())
    }

    fn read_vdma_channel_register(
        &self,
        channel_id: ChannelId,
        direction: Direction,
        offset: usize,
        reg_size: usize,
    ) -> Result<u32> {
        require_single_direction(direction, "read_vdma_channel_register")?;
        let mut params = ChannelRegisterParams {
            engine_index: channel_id.engine_index,
            channel_index: channel_id.channel_index,
            direction: direction_to_raw(direction),
            offset: offset as u32,
            reg_size: reg_size as u32,
            ..ChannelRegisterParams::zeroed()
        };
        // SAFETY: VDMA_CHANNEL_READ_REGISTER takes a ChannelRegisterParams.
        unsafe {
            ioctl(
                &self.file,
                "vdma_channel_read_register",
                ioctls::VDMA_CHANNEL_READ_REGISTER,
                &mut params,
            )
        }?;
        Ok(params.data)
    }

    fn write_vdma_channel_register(
        &self,
        channel_id: ChannelId,
        direction: Direction,
        offset: usize,
        reg_size: usize,
        data: u32,
    ) -> Result<()> {
        require_single_direction(direction, "write_vdma_channel_register")?;
        let mut params = ChannelRegisterParams {
            engine_index: channel_id.engine_index,
            channel_index: channel_id.channel_index,
            direction: direction_to_raw(direction),
            offset: offset as u32,
            reg_size: reg_size as u32,
            data,
            ..ChannelRegisterParams::zeroed()
        };
        // SAFETY: VDMA_CHANNEL_WRITE_REGISTER takes a ChannelRegisterParams.
        unsafe {
            ioctl(
                &self.file,
                "vdma_channel_write_register",
                ioctls::VDMA_CHANNEL_WRITE_REGISTER,
                &mut params,
            )
        }
    }

    unsafe fn vdma_buffer_map(
        &self,
        address: NonNull<u8>,
        size: usize,
        direction: Direction,
    ) -> Result<BufferHandle> {
        let mut params = BufferMapParams {
            user_address: address.as_ptr() as u64,
            size: size as u64,
            data_direction: u32::from(direction_to_raw(direction)),
            ..BufferMapParams::zeroed()
        };
        // SAFETY: VDMA_BUFFER_MAP takes a BufferMapParams; the caller keeps the buffer
        // allocated until unmap.
        unsafe { ioctl(&self.file, "vdma_buffer_map", ioctls::VDMA_BUFFER_MAP, &mut params) }?;
        Ok(BufferHandle::new(params.mapped_handle))
    }

    fn vdma_buffer_unmap(&self, handle: BufferHandle) -> Result<()> {
        let mut raw = handle.raw();
        // SAFETY: VDMA_BUFFER_UNMAP takes the u64 handle.
        unsafe { ioctl(&self.file, "vdma_buffer_unmap", ioctls::VDMA_BUFFER_UNMAP, &mut raw) }
    }

    fn vdma_buffer_sync(
        &self,
        handle: BufferHandle,
        direction: Direction,
        offset: usize,
        size: usize,
    ) -> Result<()> {
        require_single_direction(direction, "vdma_buffer_sync")?;
        let mut params = BufferSyncParams {
            handle: handle.raw(),
            sync_type: if direction == Direction::H2D {
                SYNC_FOR_DEVICE
            } else {
                SYNC_FOR_HOST
            },
            offset: offset as u64,
            count: size as u64,
            ..BufferSyncParams::zeroed()
        };
        // SAFETY: VDMA_BUFFER_SYNC takes a BufferSyncParams.
        unsafe { ioctl(&self.file, "vdma_buffer_sync", ioctls::VDMA_BUFFER_SYNC, &mut params) }
    }

    fn descriptors_list_create(&self, desc_count: u32) -> Result<DescriptorListInfo> {
        let mut params = DescListCreateParams {
            desc_count: u64::from(desc_count),
            ..DescListCreateParams::zeroed()
        };
        // SAFETY: DESC_LIST_CREATE takes a DescListCreateParams.
        unsafe { ioctl(&self.file, "desc_list_create", ioctls::DESC_LIST_CREATE, &mut params) }?;
        Ok(DescriptorListInfo {
            handle: DescriptorListHandle::new(params.desc_handle),
            dma_address: params.dma_address,
        })
    }

    fn descriptors_list_map(
        &self,
        handle: DescriptorListHandle,
        desc_count: u32,
    ) -> Result<DescriptorRegion> {
        let len = desc_count as usize * DESCRIPTOR_SIZE;
        // SAFETY: mmap necessary - the driver exposes list `handle` at that offset of the
        // device node. Invariants: (1) fd valid while self lives; (2) len covers exactly
        // desc_count descriptors; (3) result unmapped only by DescriptorRegion::drop.
        let raw = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &self.file,
                handle.raw(),
            )
        }
        .map_err(|e| {
            tracing::error!("Failed to map descriptor list {:#x}: {e}", handle.raw());
            std::io::Error::from(e)
        })?;
        let ptr = NonNull::new(raw.cast::<VdmaDescriptor>())
            .ok_or_else(|| VdmaError::malformed("mmap of descriptor list returned null"))?;
        // SAFETY: ptr comes from the mmap above of desc_count descriptors.
        Ok(unsafe { DescriptorRegion::from_mmap(ptr, desc_count) })
    }

    fn descriptors_list_release(&self, handle: DescriptorListHandle) -> Result<()> {
        let mut raw = handle.raw();
        // SAFETY: DESC_LIST_RELEASE takes the u64 handle.
        unsafe { ioctl(&self.file, "desc_list_release", ioctls::DESC_LIST_RELEASE, &mut raw) }
    }

    fn descriptors_list_bind_vdma_buffer(
        &self,
        desc_handle: DescriptorListHandle,
        buffer_handle: BufferHandle,
        page_size: u16,
        channel: Option<ChannelId>,
        offset: usize,
    ) -> Result<()> {
        let channel_index = channel.map_or(INVALID_CHANNEL_INDEX, |c| c.channel_index);
        let offset = u32::try_from(offset).map_err(|_| {
            VdmaError::invalid_argument(format!("Buffer offset {offset} does not fit the driver ABI"))
        })?;
        let mut params = DescListBindParams {
            buffer_handle: buffer_handle.raw(),
            desc_handle: desc_handle.raw(),
            desc_page_size: page_size,
            channel_index,
            offset,
            ..DescListBindParams::zeroed()
        };
        // SAFETY: DESC_LIST_BIND_VDMA_BUFFER takes a DescListBindParams.
        unsafe {
            ioctl(
                &self.file,
                "desc_list_bind_vdma_buffer",
                ioctls::DESC_LIST_BIND_VDMA_BUFFER,
                &mut params,
            )
        }
    }

    fn vdma_channel_enable(
        &self,
        channel_id: ChannelId,
        direction: Direction,
        measure_timestamps: bool,
    ) -> Result<ChannelHandle> {
        require_single_direction(direction, "vdma_channel_enable")?;
        let mut params = ChannelEnableParams {
            engine_index: channel_id.engine_index,
            channel_index: channel_id.channel_index,
            direction: direction_to_raw(direction),
            enable_timestamps_measure: u8::from(measure_timestamps),
            ..ChannelEnableParams::zeroed()
        };
        // SAFETY: VDMA_CHANNEL_ENABLE takes a ChannelEnableParams.
        unsafe {
            ioctl(
                &self.file,
                "vdma_channel_enable",
                ioctls::VDMA_CHANNEL_ENABLE,
                &mut params,
            )
        }?;
        Ok(ChannelHandle::new(params.channel_handle))
    }

    fn vdma_channel_disable(&self, channel_id: ChannelId, handle: ChannelHandle) -> Result<()> {
        self.channel_call("vdma_channel_disable", ioctls::VDMA_CHANNEL_DISABLE, channel_id, handle)
    }

    fn vdma_channel_abort(&self, channel_id: ChannelId, handle: ChannelHandle) -> Result<()> {
        self.channel_call("vdma_channel_abort", ioctls::VDMA_CHANNEL_ABORT, channel_id, handle)
    }

    fn vdma_channel_clear_abort(&self, channel_id: ChannelId, handle: ChannelHandle) -> Result<()> {
        self.channel_call(
            "vdma_channel_clear_abort",
            ioctls::VDMA_CHANNEL_CLEAR_ABORT,
            channel_id,
            handle,
        )
    }

    fn wait_channel_interrupts(
        &self,
        channel_id: ChannelId,
        handle: ChannelHandle,
        timeout: Duration,
    ) -> Result<ChannelInterruptTimestampList> {
        let mut params = Box::new(ChannelWaitParams {
            engine_index: channel_id.engine_index,
            channel_index: channel_id.channel_index,
            timeout_ms: timeout_ms(timeout),
            channel_handle: handle.raw(),
            ..ChannelWaitParams::zeroed()
        });
        // SAFETY: VDMA_CHANNEL_WAIT_INT takes a ChannelWaitParams.
        unsafe {
            ioctl(
                &self.file,
                "vdma_channel_wait_interrupts",
                ioctls::VDMA_CHANNEL_WAIT_INT,
                params.as_mut(),
            )
        }
        .map_err(|e| if e.is_timeout() { VdmaError::timeout(timeout) } else { e })?;

        let count = params.timestamps_count as usize;
        if count > MAX_IRQ_TIMESTAMPS_SIZE {
            return Err(VdmaError::malformed(format!(
                "Driver returned {count} interrupt timestamps, max {MAX_IRQ_TIMESTAMPS_SIZE}"
            )));
        }
        Ok(params.timestamps[..count]
            .iter()
            .map(|irq| ChannelInterruptTimestamp {
                timestamp: Duration::from_nanos(irq.timestamp_ns),
                desc_num_processed: irq.desc_num_processed,
            })
            .collect())
    }

    fn fw_control(
        &self,
        request: &[u8],
        request_md5: &[u8; 16],
        timeout: Duration,
        cpu_id: CpuId,
    ) -> Result<FwControlResponse> {
        if request.len() > MAX_CONTROL_LENGTH {
            return Err(VdmaError::invalid_argument(format!(
                "Control request of {} bytes exceeds {MAX_CONTROL_LENGTH}",
                request.len()
            )));
        }
        let mut params = Box::new(FwControlParams {
            expected_md5: *request_md5,
            buffer_len: request.len() as u32,
            timeout_ms: timeout_ms(timeout),
            cpu_id: cpu_id.as_u32(),
            ..FwControlParams::zeroed()
        });
        params.buffer[..request.len()].copy_from_slice(request);

        // SAFETY: FW_CONTROL takes a FwControlParams.
        unsafe { ioctl(&self.file, "fw_control", ioctls::FW_CONTROL, params.as_mut()) }
            .map_err(|e| if e.is_timeout() { VdmaError::timeout(timeout) } else { e })?;

        let len = params.buffer_len as usize;
        if len > MAX_CONTROL_LENGTH {
            return Err(VdmaError::malformed(format!(
                "Control response of {len} bytes exceeds {MAX_CONTROL_LENGTH}"
            )));
        }
        Ok(FwControlResponse {
            response: params.buffer[..len].to_vec(),
            md5: params.expected_md5,
        })
    }

    fn reset_nn_core(&self) -> Result<()> {
        // SAFETY: RESET_NN_CORE takes no argument. Invariants: (1) fd valid while self
        // lives; (2) _IO request, the kernel reads nothing from user memory.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), ioctls::RESET_NN_CORE as _) };
        if ret < 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            return Err(errno_to_error("reset_nn_core", errno));
        }
        tracing::info!("NN core reset on {}", self.path.display());
        Ok(())
    }
}
