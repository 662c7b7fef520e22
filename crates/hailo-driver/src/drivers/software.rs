//! Software driver: in-process simulated device
//!
//! Implements [`Driver`] without hardware. Each H2D channel `n` is looped
//! back to D2H channel `n + 16`:
//!
//! ```text
//! host buffer ─▶ H2D descs ─▶ FIFO ─▶ D2H descs ─▶ host buffer
//! ```
//!
//! Descriptors are processed as soon as `NUM_AVAILABLE` moves and the peer
//! channel is enabled; a descriptor tagged for the host raises an interrupt.
//! A small firmware model answers the control opcodes the runtime sends and
//! keeps the context programs so they can be downloaded back. Channel,
//! control and reset calls are recorded as [`DeviceEvent`]s so tests can
//! check ordering.
//!
//! Descriptor lists live in heap memory owned by the simulator; buffers are
//! the caller's pinned allocations, accessed by raw pointer between map and
//! unmap exactly like a DMA engine would.

// Ring indices fit u16, descriptor counts fit u32
#![allow(clippy::cast_possible_truncation)]

use crate::control::{md5_digest, RequestHeader, ResponseHeader};
use crate::driver::{
    require_single_direction, BufferHandle, ChannelHandle, ChannelInterruptTimestamp,
    ChannelInterruptTimestampList, DescriptorListHandle, DescriptorListInfo, DeviceProperties,
    Driver, DriverType, FwControlResponse, MemoryType,
};
use crate::error::{Result, VdmaError};
use crate::vdma::{DescriptorRegion, VdmaDescriptor};
use bytemuck::Zeroable;
use bytes::{Buf, BufMut};
use hailo_chip::control::{
    opcode, switch_status, CpuId, CONTEXT_NETWORK_DATA_SINGLE_CONTROL_MAX_SIZE, MAX_CONTROL_LENGTH,
    PROTOCOL_VERSION, STATUS_SUCCESS,
};
use hailo_chip::regs;
use hailo_chip::vdma::{ChannelId, Direction, MAX_IRQ_TIMESTAMPS_SIZE, MIN_D2H_CHANNEL_INDEX};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Size of each simulated device memory space
const SIM_MEMORY_SIZE: usize = 1024 * 1024;

const DESC_LIST_DMA_BASE: u64 = 0x1000_0000;
const BUFFER_IOVA_BASE: u64 = 0x8_0000_0000;

/// Firmware version reported by `IDENTIFY`
const SIM_FW_VERSION: (u32, u32, u32) = (4, 17, 0);

/// Base address reported with downloaded action lists
const SIM_ACTION_LIST_BASE_ADDRESS: u32 = 0x6000_0000;

/// Firmware major statuses
mod fw_status {
    pub const UNSUPPORTED_OPCODE: u32 = 1;
    pub const BAD_HEADER: u32 = 2;
    pub const INVALID_PAYLOAD: u32 = 3;
    pub const NOT_FOUND: u32 = 4;
}

/// Something the simulated device observed, in call order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A channel was enabled
    ChannelEnabled(ChannelId),
    /// A channel was disabled
    ChannelDisabled(ChannelId),
    /// A channel was aborted
    ChannelAborted(ChannelId),
    /// A channel abort was cleared
    AbortCleared(ChannelId),
    /// A firmware control was received
    Control {
        /// Control opcode
        opcode: u32,
    },
    /// `CHANGE_CONTEXT_SWITCH_STATUS` with the new state
    ContextSwitchStatus(u8),
    /// The NN core was reset
    NnCoreReset,
}

#[derive(Debug, Clone, Copy)]
struct HostPtr(NonNull<u8>);

// SAFETY: Send - the pointer refers to a caller allocation that stays valid until unmap
// (contract of Driver::vdma_buffer_map); it is only dereferenced under the device lock.
unsafe impl Send for HostPtr {}

#[derive(Debug, Clone, Copy)]
struct SimBuffer {
    ptr: HostPtr,
    size: usize,
}

impl SimBuffer {
    /// Copy out of the host buffer, wrapping at its end
    fn read_at(&self, offset: usize, dst: &mut [u8]) {
        let mut offset = offset % self.size;
        let mut done = 0;
        while done < dst.len() {
            let n = (dst.len() - done).min(self.size - offset);
            // SAFETY: Device-side read of a mapped buffer. Invariants: (1) offset + n <= size;
            // (2) the allocation is valid for size bytes until unmap, which removes this entry;
            // (3) dst is a distinct slice.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.ptr.0.as_ptr().add(offset),
                    dst.as_mut_ptr().add(done),
                    n,
                );
            }
            done += n;
            offset = 0;
        }
    }

    /// Copy into the host buffer, wrapping at its end
    fn write_at(&self, offset: usize, src: &[u8]) {
        let mut offset = offset % self.size;
        let mut done = 0;
        while done < src.len() {
            let n = (src.len() - done).min(self.size - offset);
            // SAFETY: Device-side write of a mapped buffer. Invariants: (1) offset + n <= size;
            // (2) the allocation is valid for size bytes until unmap; (3) src is a distinct slice.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(done),
                    self.ptr.0.as_ptr().add(offset),
                    n,
                );
            }
            done += n;
            offset = 0;
        }
    }
}

/// Heap memory standing in for a driver-allocated descriptor list
#[derive(Debug)]
struct SoftwareDescriptorMemory {
    ptr: NonNull<VdmaDescriptor>,
    count: u32,
}

// SAFETY: Send/Sync - the memory is owned by this value and freed only in Drop; every
// access goes through DescriptorRegion's volatile, bounds-checked reads and writes.
unsafe impl Send for SoftwareDescriptorMemory {}
// SAFETY: see above.
unsafe impl Sync for SoftwareDescriptorMemory {}

impl SoftwareDescriptorMemory {
    fn new(count: u32) -> Self {
        let descs = vec![VdmaDescriptor::zeroed(); count as usize].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(descs)).cast::<VdmaDescriptor>();
        Self { ptr, count }
    }

    fn region(self: &Arc<Self>) -> DescriptorRegion {
        let owner: Arc<dyn Any + Send + Sync> = Arc::clone(self) as _;
        // SAFETY: ptr is valid for count descriptors while the Arc the region holds is alive.
        unsafe { DescriptorRegion::from_shared(self.ptr, self.count, owner) }
    }
}

impl Drop for SoftwareDescriptorMemory {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.count as usize);
        // SAFETY: reconstitutes the Box leaked in new(). Invariants: (1) same pointer and
        // length; (2) no region outlives self, each holds an Arc to it.
        drop(unsafe { Box::from_raw(slice) });
    }
}

#[derive(Debug)]
struct SimDescList {
    memory: Arc<SoftwareDescriptorMemory>,
    region: DescriptorRegion,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    desc_handle: u64,
    buffer_handle: u64,
    page_size: u16,
    offset: usize,
}

#[derive(Debug)]
struct SimChannel {
    handle: ChannelHandle,
    measure_timestamps: bool,
    aborted: bool,
    num_available: u16,
    num_processed: u16,
    pending_irqs: usize,
    timestamps: ChannelInterruptTimestampList,
    /// Bytes in flight from the H2D peer (D2H channels only)
    fifo: VecDeque<u8>,
}

impl SimChannel {
    fn raise_irq(&mut self, timestamp: Duration) {
        self.pending_irqs += 1;
        if self.measure_timestamps && self.timestamps.len() < MAX_IRQ_TIMESTAMPS_SIZE {
            self.timestamps.push(ChannelInterruptTimestamp {
                timestamp,
                desc_num_processed: self.num_processed,
            });
        }
    }
}

#[derive(Debug, Default)]
struct SimFirmware {
    network_group_header: Vec<u8>,
    /// Finished context programs: `(context_type, actions)`
    contexts: Vec<(u8, Vec<u8>)>,
    pending_context: Option<(u8, Vec<u8>)>,
    state: u8,
    batch_counter: u32,
}

#[derive(Debug, Default)]
struct SimDevice {
    next_handle: u64,
    buffers: HashMap<u64, SimBuffer>,
    desc_lists: HashMap<u64, SimDescList>,
    bindings: HashMap<ChannelId, Binding>,
    channels: HashMap<ChannelId, SimChannel>,
    memory: HashMap<MemoryType, Vec<u8>>,
    firmware: SimFirmware,
    events: Vec<DeviceEvent>,
    corrupt_next_digest: bool,
}

const fn loopback_peer(channel_id: ChannelId) -> Option<ChannelId> {
    let channel_index = if channel_id.channel_index < MIN_D2H_CHANNEL_INDEX {
        channel_id.channel_index + MIN_D2H_CHANNEL_INDEX
    } else {
        channel_id.channel_index - MIN_D2H_CHANNEL_INDEX
    };
    ChannelId::checked(channel_id.engine_index, channel_index)
}

impl SimDevice {
    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn channel_mut(
        &mut self,
        channel_id: ChannelId,
        handle: ChannelHandle,
        operation: &'static str,
    ) -> Result<&mut SimChannel> {
        match self.channels.get_mut(&channel_id) {
            Some(channel) if channel.handle == handle => Ok(channel),
            _ => Err(VdmaError::driver(operation, libc::EINVAL)),
        }
    }

    /// Run every descriptor the channel can process now
    fn progress(&mut self, channel_id: ChannelId, host_irq_bit: u32, now: Duration) {
        match channel_id.direction() {
            Some(Direction::H2D) => {
                self.progress_h2d(channel_id, host_irq_bit, now);
                if let Some(peer) = loopback_peer(channel_id) {
                    self.progress_d2h(peer, host_irq_bit, now);
                }
            }
            Some(Direction::D2H) => self.progress_d2h(channel_id, host_irq_bit, now),
            _ => {}
        }
    }

    fn progress_h2d(&mut self, channel_id: ChannelId, host_irq_bit: u32, now: Duration) {
        let Some(peer_id) = loopback_peer(channel_id) else {
            return;
        };
        if !self.channels.contains_key(&peer_id) {
            return;
        }
        let Some(binding) = self.bindings.get(&channel_id).copied() else {
            return;
        };
        let (Some(list), Some(buffer)) = (
            self.desc_lists.get(&binding.desc_handle),
            self.buffers.get(&binding.buffer_handle).copied(),
        ) else {
            return;
        };
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if channel.aborted {
            return;
        }

        let mask = list.region.count() as usize - 1;
        let mut moved = Vec::new();
        while usize::from(channel.num_processed) != usize::from(channel.num_available) & mask {
            let index = usize::from(channel.num_processed);
            let Ok(desc) = list.region.read(index) else {
                break;
            };
            let mut page = vec![0u8; usize::from(desc.page_size())];
            buffer.read_at(binding.offset + index * usize::from(binding.page_size), &mut page);
            moved.extend_from_slice(&page);
            channel.num_processed = ((index + 1) & mask) as u16;
            if desc.irq_bits() & host_irq_bit != 0 {
                channel.raise_irq(now);
            }
        }

        if let Some(peer) = self.channels.get_mut(&peer_id) {
            peer.fifo.extend(moved);
        }
    }

    fn progress_d2h(&mut self, channel_id: ChannelId, host_irq_bit: u32, now: Duration) {
        let Some(binding) = self.bindings.get(&channel_id).copied() else {
            return;
        };
        let (Some(list), Some(buffer)) = (
            self.desc_lists.get(&binding.desc_handle),
            self.buffers.get(&binding.buffer_handle).copied(),
        ) else {
            return;
        };
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if channel.aborted {
            return;
        }

        let mask = list.region.count() as usize - 1;
        while usize::from(channel.num_processed) != usize::from(channel.num_available) & mask {
            let index = usize::from(channel.num_processed);
            let Ok(desc) = list.region.read(index) else {
                break;
            };
            let len = usize::from(desc.page_size());
            if channel.fifo.len() < len {
                break;
            }
            let page: Vec<u8> = channel.fifo.drain(..len).collect();
            buffer.write_at(binding.offset + index * usize::from(binding.page_size), &page);
            channel.num_processed = ((index + 1) & mask) as u16;
            if desc.irq_bits() & host_irq_bit != 0 {
                channel.raise_irq(now);
            }
        }
    }

    fn memory_space(&mut self, memory_type: MemoryType, address: u64, len: usize) -> Result<&mut [u8]> {
        let start = usize::try_from(address).unwrap_or(usize::MAX);
        if memory_type.is_pcie_bar() && address.saturating_add(len as u64) > u64::from(u32::MAX) {
            return Err(VdmaError::invalid_argument(format!(
                "Address out of range {address:#x} for {memory_type:?}"
            )));
        }
        if start.saturating_add(len) > SIM_MEMORY_SIZE {
            return Err(VdmaError::driver("memory_transfer", libc::EFAULT));
        }
        let space = self
            .memory
            .entry(memory_type)
            .or_insert_with(|| vec![0; SIM_MEMORY_SIZE]);
        Ok(&mut space[start..start + len])
    }

    fn handle_control(&mut self, request: &[u8]) -> Vec<u8> {
        let mut buf = request;
        let (opcode, sequence, result) = match RequestHeader::decode(&mut buf) {
            Ok(header)
                if header.protocol_version == PROTOCOL_VERSION
                    && header.payload_len as usize == buf.len() =>
            {
                self.events.push(DeviceEvent::Control {
                    opcode: header.opcode,
                });
                (header.opcode, header.sequence, self.dispatch(header.opcode, buf))
            }
            Ok(header) => (header.opcode, header.sequence, Err(fw_status::BAD_HEADER)),
            Err(_) => (0, 0, Err(fw_status::BAD_HEADER)),
        };

        let (major_status, payload) = match result {
            Ok(payload) => (STATUS_SUCCESS, payload),
            Err(major) => {
                tracing::debug!("Simulated firmware rejected control {opcode:#x} with status {major}");
                (major, Vec::new())
            }
        };
        let mut response = Vec::with_capacity(ResponseHeader::SIZE + payload.len());
        ResponseHeader {
            opcode,
            sequence,
            major_status,
            minor_status: 0,
        }
        .encode(&mut response);
        response.extend_from_slice(&payload);
        response
    }

    fn dispatch(&mut self, op: u32, mut payload: &[u8]) -> std::result::Result<Vec<u8>, u32> {
        let firmware = &mut self.firmware;
        match op {
            opcode::IDENTIFY => {
                let mut out = Vec::with_capacity(16);
                out.put_u32_le(PROTOCOL_VERSION);
                out.put_u32_le(SIM_FW_VERSION.0);
                out.put_u32_le(SIM_FW_VERSION.1);
                out.put_u32_le(SIM_FW_VERSION.2);
                Ok(out)
            }
            opcode::SET_NETWORK_GROUP_HEADER => {
                firmware.network_group_header = payload.to_vec();
                firmware.contexts.clear();
                firmware.pending_context = None;
                Ok(Vec::new())
            }
            opcode::SET_CONTEXT_INFO => {
                if payload.remaining() < 6 {
                    return Err(fw_status::INVALID_PAYLOAD);
                }
                let is_first = payload.get_u8() != 0;
                let is_last = payload.get_u8() != 0;
                let context_type = payload.get_u8();
                let _actions_count = payload.get_u8();
                let data_len = usize::from(payload.get_u16_le());
                if payload.remaining() != data_len {
                    return Err(fw_status::INVALID_PAYLOAD);
                }
                if is_first {
                    firmware.pending_context = Some((context_type, Vec::new()));
                }
                match firmware.pending_context.as_mut() {
                    Some((pending_type, data)) if *pending_type == context_type => {
                        data.extend_from_slice(payload);
                    }
                    _ => return Err(fw_status::INVALID_PAYLOAD),
                }
                if is_last {
                    if let Some(context) = firmware.pending_context.take() {
                        firmware.contexts.push(context);
                    }
                }
                Ok(Vec::new())
            }
            opcode::CHANGE_CONTEXT_SWITCH_STATUS => {
                if payload.remaining() < 5 {
                    return Err(fw_status::INVALID_PAYLOAD);
                }
                let state = payload.get_u8();
                firmware.state = state;
                if state == switch_status::ENABLED {
                    firmware.batch_counter += 1;
                }
                self.events.push(DeviceEvent::ContextSwitchStatus(state));
                Ok(Vec::new())
            }
            opcode::DOWNLOAD_CONTEXT_ACTION_LIST => {
                if payload.remaining() < 10 {
                    return Err(fw_status::INVALID_PAYLOAD);
                }
                let _network_group_id = payload.get_u32_le();
                let context_type = payload.get_u8();
                let context_index = usize::from(payload.get_u8());
                let offset = payload.get_u32_le() as usize;
                let Some((_, data)) = firmware
                    .contexts
                    .iter()
                    .filter(|(ty, _)| *ty == context_type)
                    .nth(context_index)
                else {
                    return Err(fw_status::NOT_FOUND);
                };
                if offset > data.len() {
                    return Err(fw_status::INVALID_PAYLOAD);
                }
                let end = (offset + CONTEXT_NETWORK_DATA_SINGLE_CONTROL_MAX_SIZE).min(data.len());
                let chunk = &data[offset..end];
                let mut out = Vec::with_capacity(11 + chunk.len());
                out.put_u32_le(SIM_ACTION_LIST_BASE_ADDRESS);
                out.put_u32_le(firmware.batch_counter);
                out.put_u8(u8::from(end == data.len()));
                out.put_u16_le(chunk.len() as u16);
                out.put_slice(chunk);
                Ok(out)
            }
            _ => Err(fw_status::UNSUPPORTED_OPCODE),
        }
    }
}

/// Simulated device implementing [`Driver`]
#[derive(Debug)]
pub struct SoftwareDriver {
    properties: DeviceProperties,
    device: Mutex<SimDevice>,
    irq: Condvar,
    start: Instant,
}

impl Default for SoftwareDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareDriver {
    /// Simulated PCIe device with default properties
    pub fn new() -> Self {
        Self::with_properties(DeviceProperties::default())
    }

    /// Simulated device with explicit properties
    pub fn with_properties(properties: DeviceProperties) -> Self {
        tracing::info!(
            "Software driver: {:?} DMA, {} engine(s), max desc page {}",
            properties.dma_type,
            properties.dma_engines_count,
            properties.desc_max_page_size
        );
        Self {
            properties,
            device: Mutex::new(SimDevice::default()),
            irq: Condvar::new(),
            start: Instant::now(),
        }
    }

    /// Everything the device observed so far
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.device.lock().events.clone()
    }

    /// Forget recorded events
    pub fn clear_events(&self) {
        self.device.lock().events.clear();
    }

    /// Channels currently enabled, sorted
    pub fn enabled_channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<_> = self.device.lock().channels.keys().copied().collect();
        channels.sort_unstable();
        channels
    }

    /// Raise an interrupt on `channel_id` as if the device had processed up
    /// to `num_processed`; used for channels firmware would drive
    ///
    /// # Errors
    ///
    /// Returns `NotActivated` if the channel is not enabled.
    pub fn inject_interrupt(&self, channel_id: ChannelId, num_processed: u16) -> Result<()> {
        let now = self.start.elapsed();
        {
            let mut device = self.device.lock();
            let channel = device
                .channels
                .get_mut(&channel_id)
                .ok_or(VdmaError::NotActivated)?;
            channel.num_processed = num_processed;
            channel.raise_irq(now);
        }
        self.irq.notify_all();
        Ok(())
    }

    /// Make the next firmware response fail its digest check
    pub fn corrupt_next_response_digest(&self) {
        self.device.lock().corrupt_next_digest = true;
    }

    fn host_irq_bit(&self) -> u32 {
        self.properties.dma_type.interrupt_bits().0
    }

    fn check_register(offset: usize, reg_size: usize, operation: &str) -> Result<()> {
        if reg_size != regs::width(offset) {
            return Err(VdmaError::invalid_argument(format!(
                "{operation}: register {offset:#x} is {} byte(s), got {reg_size}",
                regs::width(offset)
            )));
        }
        Ok(())
    }
}

impl Driver for SoftwareDriver {
    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Software
    }

    fn read_memory(&self, memory_type: MemoryType, address: u64, buf: &mut [u8]) -> Result<()> {
        let mut device = self.device.lock();
        buf.copy_from_slice(device.memory_space(memory_type, address, buf.len())?);
        Ok(())
    }

    fn write_memory(&self, memory_type: MemoryType, address: u64, data: &[u8]) -> Result<()> {
        let mut device = self.device.lock();
        device
            .memory_space(memory_type, address, data.len())?
            .copy_from_slice(data);
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
        Self::check_register(offset, reg_size, "read_vdma_channel_register")?;
        let device = self.device.lock();
        let Some(channel) = device.channels.get(&channel_id) else {
            return Ok(0);
        };
        Ok(match offset {
            regs::NUM_PROCESSED => u32::from(channel.num_processed),
            regs::NUM_AVAILABLE => u32::from(channel.num_available),
            regs::CONTROL if channel.aborted => regs::control::START | regs::control::ABORT,
            regs::CONTROL => regs::control::START,
            _ => 0,
        })
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
        Self::check_register(offset, reg_size, "write_vdma_channel_register")?;
        let now = self.start.elapsed();
        {
            let mut device = self.device.lock();
            let channel = device
                .channels
                .get_mut(&channel_id)
                .ok_or(VdmaError::driver("vdma_channel_write_register", libc::ENODEV))?;
            if offset != regs::NUM_AVAILABLE {
                return Ok(());
            }
            channel.num_available = data as u16;
            device.progress(channel_id, self.host_irq_bit(), now);
        }
        self.irq.notify_all();
        Ok(())
    }

    unsafe fn vdma_buffer_map(
        &self,
        address: NonNull<u8>,
        size: usize,
        direction: Direction,
    ) -> Result<BufferHandle> {
        if size == 0 {
            return Err(VdmaError::driver("vdma_buffer_map", libc::EINVAL));
        }
        let mut device = self.device.lock();
        let handle = device.allocate_handle();
        device.buffers.insert(
            handle,
            SimBuffer {
                ptr: HostPtr(address),
                size,
            },
        );
        tracing::debug!("Software driver mapped {size} byte {direction} buffer as {handle:#x}");
        Ok(BufferHandle::new(handle))
    }

    fn vdma_buffer_unmap(&self, handle: BufferHandle) -> Result<()> {
        let mut device = self.device.lock();
        if device.buffers.remove(&handle.raw()).is_none() {
            return Err(VdmaError::driver("vdma_buffer_unmap", libc::EINVAL));
        }
        device
            .bindings
            .retain(|_, binding| binding.buffer_handle != handle.raw());
        Ok(())
    }

    fn vdma_buffer_sync(
        &self,
        handle: BufferHandle,
        direction: Direction,
        offset: usize,
        size: usize,
    ) -> Result<()> {
        require_single_direction(direction, "vdma_buffer_sync")?;
        let device = self.device.lock();
        let buffer = device
            .buffers
            .get(&handle.raw())
            .ok_or(VdmaError::driver("vdma_buffer_sync", libc::EINVAL))?;
        if offset.saturating_add(size) > buffer.size {
            return Err(VdmaError::driver("vdma_buffer_sync", libc::EINVAL));
        }
        Ok(())
    }

    fn descriptors_list_create(&self, desc_count: u32) -> Result<DescriptorListInfo> {
        if desc_count == 0 {
            return Err(VdmaError::driver("desc_list_create", libc::EINVAL));
        }
        let memory = Arc::new(SoftwareDescriptorMemory::new(desc_count));
        let region = memory.region();
        let mut device = self.device.lock();
        let handle = device.allocate_handle();
        device.desc_lists.insert(handle, SimDescList { memory, region });
        Ok(DescriptorListInfo {
            handle: DescriptorListHandle::new(handle),
            dma_address: DESC_LIST_DMA_BASE + (handle << 20),
        })
    }

    fn descriptors_list_map(
        &self,
        handle: DescriptorListHandle,
        desc_count: u32,
    ) -> Result<DescriptorRegion> {
        let device = self.device.lock();
        match device.desc_lists.get(&handle.raw()) {
            Some(list) if list.memory.count == desc_count => Ok(list.memory.region()),
            _ => Err(VdmaError::driver("desc_list_mmap", libc::EINVAL)),
        }
    }

    fn descriptors_list_release(&self, handle: DescriptorListHandle) -> Result<()> {
        let mut device = self.device.lock();
        if device.desc_lists.remove(&handle.raw()).is_none() {
            return Err(VdmaError::driver("desc_list_release", libc::EINVAL));
        }
        device
            .bindings
            .retain(|_, binding| binding.desc_handle != handle.raw());
        Ok(())
    }

    fn descriptors_list_bind_vdma_buffer(
        &self,
        desc_handle: DescriptorListHandle,
        buffer_handle: BufferHandle,
        page_size: u16,
        channel: Option<ChannelId>,
        offset: usize,
    ) -> Result<()> {
        let mut device = self.device.lock();
        let buffer = device
            .buffers
            .get(&buffer_handle.raw())
            .copied()
            .ok_or(VdmaError::driver("desc_list_bind_vdma_buffer", libc::EINVAL))?;
        if offset >= buffer.size || page_size == 0 {
            return Err(VdmaError::driver("desc_list_bind_vdma_buffer", libc::EINVAL));
        }
        let list = device
            .desc_lists
            .get(&desc_handle.raw())
            .ok_or(VdmaError::driver("desc_list_bind_vdma_buffer", libc::EINVAL))?;

        let iova = BUFFER_IOVA_BASE + (buffer_handle.raw() << 32);
        for index in 0..list.region.count() as usize {
            let address = iova + ((offset + index * usize::from(page_size)) % buffer.size) as u64;
            let desc = list.region.read(index)?;
            list.region.write(
                index,
                VdmaDescriptor {
                    addr_low: address as u32,
                    addr_high: (address >> 32) as u32,
                    ..desc
                },
            )?;
        }

        if let Some(channel_id) = channel {
            device.bindings.insert(
                channel_id,
                Binding {
                    desc_handle: desc_handle.raw(),
                    buffer_handle: buffer_handle.raw(),
                    page_size,
                    offset,
                },
            );
        }
        Ok(())
    }

    fn vdma_channel_enable(
        &self,
        channel_id: ChannelId,
        direction: Direction,
        measure_timestamps: bool,
    ) -> Result<ChannelHandle> {
        require_single_direction(direction, "vdma_channel_enable")?;
        if channel_id.direction() != Some(direction)
            || channel_id.engine_index >= self.properties.dma_engines_count
        {
            return Err(VdmaError::driver("vdma_channel_enable", libc::EINVAL));
        }
        let now = self.start.elapsed();
        let handle = {
            let mut device = self.device.lock();
            if device.channels.contains_key(&channel_id) {
                return Err(VdmaError::driver("vdma_channel_enable", libc::EBUSY));
            }
            let handle = ChannelHandle::new(device.allocate_handle());
            device.channels.insert(
                channel_id,
                SimChannel {
                    handle,
                    measure_timestamps,
                    aborted: false,
                    num_available: 0,
                    num_processed: 0,
                    pending_irqs: 0,
                    timestamps: Vec::new(),
                    fifo: VecDeque::new(),
                },
            );
            device.events.push(DeviceEvent::ChannelEnabled(channel_id));
            // A peer that was waiting for us may move now
            if direction == Direction::D2H {
                if let Some(peer) = loopback_peer(channel_id) {
                    device.progress(peer, self.host_irq_bit(), now);
                }
            }
            handle
        };
        self.irq.notify_all();
        Ok(handle)
    }

    fn vdma_channel_disable(&self, channel_id: ChannelId, handle: ChannelHandle) -> Result<()> {
        {
            let mut device = self.device.lock();
            device.channel_mut(channel_id, handle, "vdma_channel_disable")?;
            device.channels.remove(&channel_id);
            device.events.push(DeviceEvent::ChannelDisabled(channel_id));
        }
        self.irq.notify_all();
        Ok(())
    }

    fn vdma_channel_abort(&self, channel_id: ChannelId, handle: ChannelHandle) -> Result<()> {
        {
            let mut device = self.device.lock();
            device
                .channel_mut(channel_id, handle, "vdma_channel_abort")?
                .aborted = true;
            device.events.push(DeviceEvent::ChannelAborted(channel_id));
        }
        self.irq.notify_all();
        Ok(())
    }

    fn vdma_channel_clear_abort(&self, channel_id: ChannelId, handle: ChannelHandle) -> Result<()> {
        let now = self.start.elapsed();
        {
            let mut device = self.device.lock();
            device
                .channel_mut(channel_id, handle, "vdma_channel_clear_abort")?
                .aborted = false;
            device.events.push(DeviceEvent::AbortCleared(channel_id));
            device.progress(channel_id, self.host_irq_bit(), now);
        }
        self.irq.notify_all();
        Ok(())
    }

    fn wait_channel_interrupts(
        &self,
        channel_id: ChannelId,
        handle: ChannelHandle,
        timeout: Duration,
    ) -> Result<ChannelInterruptTimestampList> {
        let deadline = Instant::now() + timeout;
        let mut device = self.device.lock();
        loop {
            let channel = match device.channels.get_mut(&channel_id) {
                Some(channel) if channel.handle == handle => channel,
                _ => return Err(VdmaError::NotActivated),
            };
            if channel.aborted {
                return Err(VdmaError::AbortedByUser);
            }
            if channel.pending_irqs > 0 {
                channel.pending_irqs = 0;
                return Ok(std::mem::take(&mut channel.timestamps));
            }
            if Instant::now() >= deadline {
                return Err(VdmaError::timeout(timeout));
            }
            let _ = self.irq.wait_until(&mut device, deadline);
        }
    }

    fn fw_control(
        &self,
        request: &[u8],
        request_md5: &[u8; 16],
        _timeout: Duration,
        _cpu_id: CpuId,
    ) -> Result<FwControlResponse> {
        if request.len() > MAX_CONTROL_LENGTH {
            return Err(VdmaError::invalid_argument(format!(
                "Control request of {} bytes exceeds {MAX_CONTROL_LENGTH}",
                request.len()
            )));
        }
        if md5_digest(request) != *request_md5 {
            tracing::error!("Software driver: control request digest mismatch");
            return Err(VdmaError::driver("fw_control", libc::EBADMSG));
        }
        if !self.properties.is_fw_loaded {
            return Err(VdmaError::driver("fw_control", libc::ENODEV));
        }

        let mut device = self.device.lock();
        let response = device.handle_control(request);
        let mut md5 = md5_digest(&response);
        if std::mem::take(&mut device.corrupt_next_digest) {
            md5[0] ^= 0xFF;
        }
        Ok(FwControlResponse { response, md5 })
    }

    fn reset_nn_core(&self) -> Result<()> {
        let mut device = self.device.lock();
        device.firmware.state = switch_status::RESET;
        device.events.push(DeviceEvent::NnCoreReset);
        Ok(())
    }
}
