//! Scatter-gather buffer: a descriptor list bound to a mapped buffer of
//! `desc_count × page_size` bytes

use crate::driver::{Driver, InterruptsDomain};
use crate::error::Result;
use crate::vdma::{DescriptorList, MappedBuffer};
use hailo_chip::action::host_buffer_type;
use hailo_chip::vdma::{ChannelId, Direction};
use std::sync::Arc;

/// Host buffer description the firmware needs to drive a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostBufferInfo {
    /// `host_buffer_type::*`
    pub buffer_type: u8,
    /// Device address of the descriptor list
    pub dma_address: u64,
    /// Descriptor page size
    pub desc_page_size: u16,
    /// Descriptors in the list
    pub total_desc_count: u32,
    /// Bytes covered by the list
    pub bytes_in_pattern: u32,
}

/// Descriptor list plus the buffer it points into
#[derive(Debug)]
pub struct SgBuffer {
    desc_list: DescriptorList,
    mapped_buffer: MappedBuffer,
}

impl SgBuffer {
    /// Create the list, map `desc_count × page_size` bytes and bind them
    ///
    /// # Errors
    ///
    /// Returns error if any of the three driver steps fails; nothing is
    /// leaked on failure.
    pub fn create(
        driver: &Arc<dyn Driver>,
        desc_count: u32,
        desc_page_size: u16,
        direction: Direction,
        channel: Option<ChannelId>,
    ) -> Result<Self> {
        let desc_list = DescriptorList::create(driver, desc_count, desc_page_size)?;
        let size = desc_count as usize * usize::from(desc_list.page_size());
        let mapped_buffer = MappedBuffer::create(driver, size, direction)?;
        desc_list.configure_to_use_buffer(&mapped_buffer, channel, 0)?;
        Ok(Self {
            desc_list,
            mapped_buffer,
        })
    }

    /// Buffer size in bytes
    pub const fn size(&self) -> usize {
        self.mapped_buffer.size()
    }

    /// Device address of the descriptor list
    pub const fn dma_address(&self) -> u64 {
        self.desc_list.dma_address()
    }

    /// Descriptor page size
    pub const fn desc_page_size(&self) -> u16 {
        self.desc_list.page_size()
    }

    /// Descriptors in the list
    pub fn descs_count(&self) -> u32 {
        self.desc_list.count()
    }

    /// `log2(descs_count)`
    pub const fn depth(&self) -> u8 {
        self.desc_list.depth()
    }

    /// The descriptor list
    pub const fn desc_list(&self) -> &DescriptorList {
        &self.desc_list
    }

    /// The mapped buffer
    pub const fn mapped_buffer(&self) -> &MappedBuffer {
        &self.mapped_buffer
    }

    /// See [`MappedBuffer::read`]
    ///
    /// # Errors
    ///
    /// Returns `InsufficientBuffer` or the sync error.
    pub fn read(&self, dst: &mut [u8], offset: usize, should_sync: bool) -> Result<()> {
        self.mapped_buffer.read(dst, offset, should_sync)
    }

    /// See [`MappedBuffer::write`]
    ///
    /// # Errors
    ///
    /// Returns `InsufficientBuffer` or the sync error.
    pub fn write(&self, src: &[u8], offset: usize) -> Result<()> {
        self.mapped_buffer.write(src, offset)
    }

    /// See [`MappedBuffer::read_cyclic`]
    ///
    /// # Errors
    ///
    /// Returns `InsufficientBuffer` or the sync error.
    pub fn read_cyclic(&self, dst: &mut [u8], offset: usize, should_sync: bool) -> Result<()> {
        self.mapped_buffer.read_cyclic(dst, offset, should_sync)
    }

    /// See [`MappedBuffer::write_cyclic`]
    ///
    /// # Errors
    ///
    /// Returns `InsufficientBuffer` or the sync error.
    pub fn write_cyclic(&self, src: &[u8], offset: usize) -> Result<()> {
        self.mapped_buffer.write_cyclic(src, offset)
    }

    /// See [`DescriptorList::program_descriptors`]
    ///
    /// # Errors
    ///
    /// Returns `OutOfDescriptors` for a non-circular overflow.
    pub fn program_descriptors(
        &self,
        transfer_size: usize,
        first_domain: InterruptsDomain,
        last_domain: InterruptsDomain,
        desc_offset: usize,
        is_circular: bool,
    ) -> Result<u16> {
        self.desc_list
            .program_descriptors(transfer_size, first_domain, last_domain, desc_offset, is_circular)
    }

    /// Re-tag the last descriptor of the `batch_size`-th transfer
    ///
    /// # Errors
    ///
    /// Returns `OutOfDescriptors` if the batch does not fit the list.
    pub fn reprogram_device_interrupts_for_end_of_batch(
        &self,
        transfer_size: usize,
        batch_size: u16,
        domain: InterruptsDomain,
    ) -> Result<()> {
        let descs_per_transfer = self.desc_list.descriptors_in_buffer(transfer_size) as usize;
        let last_desc_in_batch = (descs_per_transfer * usize::from(batch_size)).saturating_sub(1);
        self.desc_list
            .reprogram_descriptor_interrupts_domain(last_desc_in_batch, domain)
    }

    /// Rebind the list so its first descriptor points `new_start_offset`
    /// bytes into the buffer
    ///
    /// # Errors
    ///
    /// Returns the driver error if binding fails.
    pub fn reprogram_buffer_offset(&self, new_start_offset: usize, channel: ChannelId) -> Result<()> {
        self.desc_list
            .configure_to_use_buffer(&self.mapped_buffer, Some(channel), new_start_offset)
    }

    /// Host buffer info for firmware actions
    pub fn host_buffer_info(&self, bytes_in_pattern: u32) -> HostBufferInfo {
        HostBufferInfo {
            buffer_type: host_buffer_type::EXTERNAL_DESC,
            dma_address: self.dma_address(),
            desc_page_size: self.desc_page_size(),
            total_desc_count: self.descs_count(),
            bytes_in_pattern,
        }
    }
}
