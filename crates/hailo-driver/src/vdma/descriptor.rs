//! Descriptor lists
//!
//! A descriptor list is a power-of-two ring of 16-byte descriptors allocated
//! by the driver and mapped into the process. The host writes the page size
//! and interrupt bits of each descriptor; the driver fills in the addresses
//! when the list is bound to a mapped buffer.

// Descriptor words are u32 in hardware, sizes are usize on the host
#![allow(clippy::cast_possible_truncation)]

use crate::driver::{DescriptorListHandle, Driver, InterruptsDomain};
use crate::error::{Result, VdmaError};
use crate::vdma::MappedBuffer;
use bytemuck::{Pod, Zeroable};
use hailo_chip::descriptor::{
    self, DESC_REQUEST_IRQ_ERR, DESC_REQUEST_IRQ_PROCESSED, DESC_STATUS_REQ, DESC_STATUS_REQ_ERR,
    IRQ_MASK, MAX_DESCS_COUNT, MAX_DESC_PAGE_SIZE, MIN_DESCS_COUNT, MIN_DESC_PAGE_SIZE,
    PAGE_SIZE_MASK, PAGE_SIZE_SHIFT,
};
use hailo_chip::descriptor::{DmaType, DEFAULT_DESC_PAGE_SIZE};
use hailo_chip::vdma::ChannelId;
use std::any::Any;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::Arc;

/// One hardware descriptor
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VdmaDescriptor {
    /// `[31:8]` page size, `[7:0]` control
    pub page_size_desc_control: u32,
    /// Low half of the page address
    pub addr_low: u32,
    /// High half of the page address
    pub addr_high: u32,
    /// `[7:0]` status written back by the engine
    pub remaining_page_size_status: u32,
}

impl VdmaDescriptor {
    /// Page size programmed into this descriptor
    pub const fn page_size(&self) -> u16 {
        ((self.page_size_desc_control & PAGE_SIZE_MASK) >> PAGE_SIZE_SHIFT) as u16
    }

    /// Interrupt bits of the control word
    pub const fn irq_bits(&self) -> u32 {
        self.page_size_desc_control & IRQ_MASK
    }
}

enum Backing {
    /// `mmap` of the driver fd, unmapped on drop
    Mmap { len: usize },
    /// Memory owned by someone else, kept alive while mapped
    Shared(#[allow(dead_code)] Arc<dyn Any + Send + Sync>),
}

/// Host mapping of a descriptor list
pub struct DescriptorRegion {
    ptr: NonNull<VdmaDescriptor>,
    count: u32,
    backing: Backing,
}

impl std::fmt::Debug for DescriptorRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("count", &self.count)
            .field("mmap", &matches!(self.backing, Backing::Mmap { .. }))
            .finish()
    }
}

// SAFETY: Send - the region owns its mapping (or a reference that keeps the backing
// memory alive); the pointer stays valid when moved between threads.
unsafe impl Send for DescriptorRegion {}

// SAFETY: Sync - every access is a bounds-checked volatile read or write of a single
// descriptor; callers serialize programming of a given list (channel lock).
unsafe impl Sync for DescriptorRegion {}

impl DescriptorRegion {
    /// Wrap an `mmap` of `count` descriptors
    ///
    /// # Safety
    ///
    /// `ptr` must come from a successful `mmap` of exactly
    /// `count * DESCRIPTOR_SIZE` bytes that nothing else unmaps.
    pub unsafe fn from_mmap(ptr: NonNull<VdmaDescriptor>, count: u32) -> Self {
        Self {
            ptr,
            count,
            backing: Backing::Mmap {
                len: count as usize * descriptor::DESCRIPTOR_SIZE,
            },
        }
    }

    /// Wrap memory kept alive by `owner`
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `count` descriptors for as long as `owner`
    /// is alive.
    pub unsafe fn from_shared(
        ptr: NonNull<VdmaDescriptor>,
        count: u32,
        owner: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            ptr,
            count,
            backing: Backing::Shared(owner),
        }
    }

    /// Number of descriptors
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Read descriptor `index`
    ///
    /// # Errors
    ///
    /// Returns `OutOfDescriptors` if `index` is past the end of the list.
    pub fn read(&self, index: usize) -> Result<VdmaDescriptor> {
        self.check_index(index)?;
        // SAFETY: Volatile read of one descriptor. Invariants: (1) index < count checked
        // above; (2) ptr valid for count descriptors while self lives; (3) VdmaDescriptor is
        // Pod, any bit pattern is valid.
        Ok(unsafe { self.ptr.as_ptr().add(index).read_volatile() })
    }

    /// Write descriptor `index`
    ///
    /// # Errors
    ///
    /// Returns `OutOfDescriptors` if `index` is past the end of the list.
    pub fn write(&self, index: usize, desc: VdmaDescriptor) -> Result<()> {
        self.check_index(index)?;
        // SAFETY: Volatile write of one descriptor. Invariants: (1) index < count checked
        // above; (2) ptr valid and writable for count descriptors while self lives.
        unsafe { self.ptr.as_ptr().add(index).write_volatile(desc) };
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.count as usize {
            return Err(VdmaError::OutOfDescriptors {
                requested: index + 1,
                available: self.count as usize,
            });
        }
        Ok(())
    }
}

impl Drop for DescriptorRegion {
    fn drop(&mut self) {
        if let Backing::Mmap { len } = self.backing {
            // SAFETY: munmap necessary - releases the mapping created for this region.
            // Invariants: (1) ptr/len from the original mmap; (2) no references outlive self.
            if let Err(e) = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), len) } {
                tracing::error!("Failed to unmap descriptor list: {e}");
            }
        }
    }
}

/// A descriptor list owned by the runtime
#[derive(Debug)]
pub struct DescriptorList {
    region: ManuallyDrop<DescriptorRegion>,
    depth: u8,
    handle: DescriptorListHandle,
    dma_address: u64,
    page_size: u16,
    dma_type: DmaType,
    driver: Arc<dyn Driver>,
}

impl DescriptorList {
    /// Allocate and map a list of `desc_count` descriptors
    ///
    /// The requested page size is clamped by the driver.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `desc_count` is not a power of two in
    /// `[2, 64K]`, or the driver error if allocation or mapping fails.
    pub fn create(driver: &Arc<dyn Driver>, desc_count: u32, requested_page_size: u16) -> Result<Self> {
        let page_size = driver.calc_desc_page_size(requested_page_size);
        if !(MIN_DESCS_COUNT..=MAX_DESCS_COUNT).contains(&desc_count) {
            return Err(VdmaError::invalid_argument(format!(
                "Descriptor count {desc_count} outside [{MIN_DESCS_COUNT}, {MAX_DESCS_COUNT}]"
            )));
        }
        let depth = descriptor::list_depth(desc_count).ok_or_else(|| {
            VdmaError::invalid_argument(format!("Descriptor count ({desc_count}) must be power of 2"))
        })?;

        let info = driver.descriptors_list_create(desc_count)?;
        let region = match driver.descriptors_list_map(info.handle, desc_count) {
            Ok(region) => region,
            Err(e) => {
                tracing::error!("Failed to map descriptor list {:#x}: {e}", info.handle.raw());
                if let Err(release) = driver.descriptors_list_release(info.handle) {
                    tracing::error!("Failed to release descriptor list: {release}");
                }
                return Err(e);
            }
        };

        tracing::debug!(
            "Descriptor list {:#x}: {desc_count} descs, page {page_size}, dma {:#x}",
            info.handle.raw(),
            info.dma_address
        );

        Ok(Self {
            region: ManuallyDrop::new(region),
            depth,
            handle: info.handle,
            dma_address: info.dma_address,
            page_size,
            dma_type: driver.dma_type(),
            driver: Arc::clone(driver),
        })
    }

    /// Number of descriptors
    pub fn count(&self) -> u32 {
        self.region.count()
    }

    /// `log2(count)`
    pub const fn depth(&self) -> u8 {
        self.depth
    }

    /// Device-visible address of the list
    pub const fn dma_address(&self) -> u64 {
        self.dma_address
    }

    /// Page size every descriptor points to
    pub const fn page_size(&self) -> u16 {
        self.page_size
    }

    /// Driver handle
    pub const fn handle(&self) -> DescriptorListHandle {
        self.handle
    }

    /// Mapped descriptors
    pub fn region(&self) -> &DescriptorRegion {
        &self.region
    }

    /// Descriptors needed for `buffer_size` bytes at this list's page size
    pub const fn descriptors_in_buffer(&self, buffer_size: usize) -> u32 {
        descriptor::descriptors_in_buffer(buffer_size, self.page_size)
    }

    /// Bind the list to `buffer`, first descriptor at `offset`
    ///
    /// # Errors
    ///
    /// Returns the driver error if binding fails.
    pub fn configure_to_use_buffer(
        &self,
        buffer: &MappedBuffer,
        channel: Option<ChannelId>,
        offset: usize,
    ) -> Result<()> {
        self.driver.descriptors_list_bind_vdma_buffer(
            self.handle,
            buffer.handle(),
            self.page_size,
            channel,
            offset,
        )
    }

    /// Program the descriptors covering one transfer
    ///
    /// Returns the number of descriptors used. The first descriptor gets
    /// `first_domain`, the last gets the residue size and `last_domain`,
    /// the rest interrupt nobody. Indices wrap around the ring.
    ///
    /// # Errors
    ///
    /// Returns `OutOfDescriptors` when a non-circular transfer does not fit
    /// between `desc_offset` and the end of the list.
    pub fn program_descriptors(
        &self,
        transfer_size: usize,
        first_domain: InterruptsDomain,
        last_domain: InterruptsDomain,
        desc_offset: usize,
        is_circular: bool,
    ) -> Result<u16> {
        if transfer_size == 0 {
            return Err(VdmaError::invalid_argument("Transfer size must be positive"));
        }
        let required = self.descriptors_in_buffer(transfer_size) as usize;
        let count = self.count() as usize;
        if !is_circular && required + desc_offset > count {
            tracing::error!(
                "Requested transfer size ({transfer_size}) results in more descriptors than available ({count})"
            );
            return Err(VdmaError::OutOfDescriptors {
                requested: required + desc_offset,
                available: count,
            });
        }
        if required > count {
            return Err(VdmaError::OutOfDescriptors {
                requested: required,
                available: count,
            });
        }

        let mask = count - 1;
        let mut index = desc_offset & mask;
        for i in 0..required - 1 {
            let domain = if i == 0 { first_domain } else { InterruptsDomain::NONE };
            self.program_single_descriptor(index, self.page_size, domain)?;
            index = (index + 1) & mask;
        }

        let residue = transfer_size - (required - 1) * self.page_size as usize;
        self.program_single_descriptor(index, residue as u16, last_domain)?;

        Ok(required as u16)
    }

    /// Replace the interrupt target of descriptor `index`
    ///
    /// # Errors
    ///
    /// Returns `OutOfDescriptors` if `index` is past the end of the list.
    pub fn reprogram_descriptor_interrupts_domain(
        &self,
        index: usize,
        domain: InterruptsDomain,
    ) -> Result<()> {
        let mut desc = self.region.read(index)?;
        desc.page_size_desc_control &= !IRQ_MASK;
        if !domain.is_empty() {
            desc.page_size_desc_control |=
                DESC_REQUEST_IRQ_PROCESSED | DESC_REQUEST_IRQ_ERR | self.interrupts_bitmask(domain);
        }
        self.region.write(index, desc)
    }

    fn program_single_descriptor(
        &self,
        index: usize,
        page_size: u16,
        domain: InterruptsDomain,
    ) -> Result<()> {
        let mut desc = self.region.read(index)?;
        desc.page_size_desc_control = (u32::from(page_size) << PAGE_SIZE_SHIFT) & PAGE_SIZE_MASK;
        if !domain.is_empty() {
            desc.page_size_desc_control |=
                DESC_REQUEST_IRQ_PROCESSED | DESC_REQUEST_IRQ_ERR | self.interrupts_bitmask(domain);
            if cfg!(debug_assertions) {
                desc.page_size_desc_control |= DESC_STATUS_REQ | DESC_STATUS_REQ_ERR;
            }
        }
        desc.remaining_page_size_status = 0;
        self.region.write(index, desc)
    }

    fn interrupts_bitmask(&self, domain: InterruptsDomain) -> u32 {
        let (host, device) = self.dma_type.interrupt_bits();
        let mut bitmask = 0;
        if domain.contains(InterruptsDomain::HOST) {
            bitmask |= host;
        }
        if domain.contains(InterruptsDomain::DEVICE) {
            bitmask |= device;
        }
        bitmask
    }
}

impl Drop for DescriptorList {
    fn drop(&mut self) {
        // SAFETY: the region is dropped exactly once, here, and never touched again.
        // The mapping must go before the list is released.
        unsafe { ManuallyDrop::drop(&mut self.region) };
        if let Err(e) = self.driver.descriptors_list_release(self.handle) {
            tracing::error!("Failed to release descriptor list {:#x}: {e}", self.handle.raw());
        }
    }
}

/// Page size and list size for a channel carrying one transfer size,
/// buffering between `min_batch_size` and `max_batch_size` transfers
///
/// # Errors
///
/// Returns `OutOfDescriptors` when no page size up to the maximum fits.
pub fn desc_buffer_sizes_for_single_transfer(
    driver: &dyn Driver,
    min_batch_size: u16,
    max_batch_size: u16,
    transfer_size: u32,
) -> Result<(u16, u32)> {
    // Small transfers use small pages to save memory.
    let initial_page_size = if u32::from(DEFAULT_DESC_PAGE_SIZE) > transfer_size {
        descriptor::nearest_power_of_2(transfer_size, u32::from(MIN_DESC_PAGE_SIZE)) as u16
    } else {
        DEFAULT_DESC_PAGE_SIZE
    };
    if initial_page_size != DEFAULT_DESC_PAGE_SIZE {
        tracing::info!(
            "Using non-default initial desc page size of {initial_page_size}, due to a small transfer size ({transfer_size})"
        );
    }

    let (page_size, _) =
        sizes_for_multiple_transfers(driver, min_batch_size, &[transfer_size], initial_page_size)?;
    let desc_count = descriptor::calculate_descriptors_count(transfer_size, max_batch_size, page_size)
        .min(MAX_DESCS_COUNT);
    Ok((page_size, desc_count))
}

/// Page size and list size for a list carrying several transfers back to
/// back, `batch_size` times
///
/// # Errors
///
/// Returns `OutOfDescriptors` when no page size up to the maximum fits.
pub fn desc_buffer_sizes_for_multiple_transfers(
    driver: &dyn Driver,
    batch_size: u16,
    transfer_sizes: &[u32],
) -> Result<(u16, u32)> {
    sizes_for_multiple_transfers(driver, batch_size, transfer_sizes, DEFAULT_DESC_PAGE_SIZE)
}

fn sizes_for_multiple_transfers(
    driver: &dyn Driver,
    batch_size: u16,
    transfer_sizes: &[u32],
    initial_page_size: u16,
) -> Result<(u16, u32)> {
    let min_page = driver.calc_desc_page_size(MIN_DESC_PAGE_SIZE);
    let max_page = u32::from(driver.calc_desc_page_size(MAX_DESC_PAGE_SIZE));
    // u32 so doubling past the maximum is observable
    let mut page = u32::from(driver.calc_desc_page_size(initial_page_size));
    if page < u32::from(min_page) {
        return Err(VdmaError::invalid_argument(format!(
            "Initial descriptor page size ({page}) is smaller than minimum descriptor page size ({min_page})"
        )));
    }

    let count_for = |page: u32| -> u32 {
        transfer_sizes
            .iter()
            .map(|&size| descriptor::descriptors_in_buffer(size as usize, page as u16))
            .sum()
    };

    let mut acc_desc_count = count_for(page);
    while u64::from(acc_desc_count) * u64::from(batch_size) > u64::from(MAX_DESCS_COUNT - 1) {
        page <<= 1;
        if page > max_page {
            tracing::error!(
                "Network shapes and batch size exceed driver descriptor capabilities. Required: {}, max: {MAX_DESCS_COUNT}, batch {batch_size}",
                u64::from(acc_desc_count) * u64::from(batch_size)
            );
            return Err(VdmaError::OutOfDescriptors {
                requested: acc_desc_count as usize * batch_size as usize,
                available: MAX_DESCS_COUNT as usize,
            });
        }
        acc_desc_count = count_for(page);
    }

    let page_size = page as u16;
    let desc_count = descriptor::nearest_power_of_2(acc_desc_count, MIN_DESCS_COUNT);
    if desc_count > MAX_DESCS_COUNT {
        return Err(VdmaError::OutOfDescriptors {
            requested: desc_count as usize,
            available: MAX_DESCS_COUNT as usize,
        });
    }
    if page_size != initial_page_size {
        tracing::warn!("Desc page size value ({page_size}) is not optimal for performance.");
    }

    Ok((page_size, desc_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::SoftwareDriver;
    use hailo_chip::descriptor::irq_target;

    fn driver() -> Arc<dyn Driver> {
        Arc::new(SoftwareDriver::new())
    }

    #[test]
    fn test_create_rejects_non_power_of_two() {
        let drv = driver();
        assert!(matches!(
            DescriptorList::create(&drv, 100, 512),
            Err(VdmaError::InvalidArgument { .. })
        ));
        assert!(DescriptorList::create(&drv, 1, 512).is_err());
    }

    #[test]
    fn test_program_descriptors_fills_list_exactly() {
        let drv = driver();
        let list = DescriptorList::create(&drv, 8, 512).unwrap();
        let used = list
            .program_descriptors(8 * 512, InterruptsDomain::NONE, InterruptsDomain::HOST, 0, false)
            .unwrap();
        assert_eq!(used, 8);
        assert!(matches!(
            list.program_descriptors(9 * 512, InterruptsDomain::NONE, InterruptsDomain::HOST, 0, false),
            Err(VdmaError::OutOfDescriptors { .. })
        ));
    }

    #[test]
    fn test_program_descriptors_residue_and_domains() {
        let drv = driver();
        let list = DescriptorList::create(&drv, 16, 512).unwrap();
        let used = list
            .program_descriptors(1300, InterruptsDomain::DEVICE, InterruptsDomain::HOST, 14, true)
            .unwrap();
        assert_eq!(used, 3);

        let first = list.region().read(14).unwrap();
        assert_eq!(first.page_size(), 512);
        assert_ne!(first.irq_bits() & irq_target::PCIE_DEVICE, 0);

        let middle = list.region().read(15).unwrap();
        assert_eq!(middle.irq_bits(), 0);

        // wrapped to index 0 with the residue
        let last = list.region().read(0).unwrap();
        assert_eq!(last.page_size(), 1300 - 1024);
        assert_ne!(last.irq_bits() & irq_target::PCIE_HOST, 0);
    }

    #[test]
    fn test_reprogram_domain() {
        let drv = driver();
        let list = DescriptorList::create(&drv, 4, 512).unwrap();
        list.program_descriptors(512, InterruptsDomain::NONE, InterruptsDomain::HOST, 0, false)
            .unwrap();
        list.reprogram_descriptor_interrupts_domain(0, InterruptsDomain::BOTH).unwrap();
        let desc = list.region().read(0).unwrap();
        assert_eq!(desc.page_size(), 512);
        assert_ne!(desc.irq_bits() & irq_target::PCIE_HOST, 0);
        assert_ne!(desc.irq_bits() & irq_target::PCIE_DEVICE, 0);

        list.reprogram_descriptor_interrupts_domain(0, InterruptsDomain::NONE).unwrap();
        assert_eq!(list.region().read(0).unwrap().irq_bits(), 0);
        assert!(list
            .reprogram_descriptor_interrupts_domain(4, InterruptsDomain::NONE)
            .is_err());
    }

    #[test]
    fn test_single_transfer_sizes_small_frame() {
        let drv = driver();
        // 100-byte frames use 128-byte pages
        let (page, count) = desc_buffer_sizes_for_single_transfer(drv.as_ref(), 2, 4, 100).unwrap();
        assert_eq!(page, 128);
        assert_eq!(count, 8);
    }

    #[test]
    fn test_multiple_transfers_page_doubling() {
        let drv = driver();
        // 512 descs per frame at 512 bytes, 256 frames -> too many; doubles to 2048
        let frame = 512 * 512;
        let (page, count) = desc_buffer_sizes_for_multiple_transfers(drv.as_ref(), 256, &[frame]).unwrap();
        assert_eq!(page, 2048);
        assert_eq!(count, 128);

        assert!(matches!(
            desc_buffer_sizes_for_multiple_transfers(drv.as_ref(), 4096, &[frame]),
            Err(VdmaError::OutOfDescriptors { .. })
        ));
    }
}
