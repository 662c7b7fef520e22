//! vDMA descriptor layout and list limits.
//!
//! A descriptor is four little-endian 32-bit words:
//!
//! ```text
//! word 0  page_size_desc_control      [31:8] page size, [7:0] control
//! word 1  addr_low                    (written by the kernel driver)
//! word 2  addr_high                   (written by the kernel driver)
//! word 3  remaining_page_size_status  [7:0] status, cleared by the host
//! ```
//!
//! The host only ever touches words 0 and 3; the addresses are filled in
//! when the list is bound to a mapped buffer.

/// Size of one descriptor in bytes.
pub const DESCRIPTOR_SIZE: usize = 16;

/// Largest descriptor list.
pub const MAX_DESCS_COUNT: u32 = 64 * 1024;
/// Smallest descriptor list.
pub const MIN_DESCS_COUNT: u32 = 2;
/// List size used when nothing better is known.
pub const DEFAULT_DESC_COUNT: u32 = 64 * 1024;

/// Smallest page a descriptor may point to (64-byte address alignment).
pub const MIN_DESC_PAGE_SIZE: u16 = 64;
/// Largest page a descriptor may point to.
pub const MAX_DESC_PAGE_SIZE: u16 = 4096;
/// Optimal page size for whole-page copies.
pub const DEFAULT_DESC_PAGE_SIZE: u16 = 512;

/// Shift of the page size field in word 0.
pub const PAGE_SIZE_SHIFT: u32 = 8;
/// Mask of the page size field in word 0.
pub const PAGE_SIZE_MASK: u32 = 0xFFFF_FF00;
/// Control bits that select interrupt behavior in word 0.
pub const IRQ_MASK: u32 = 0x0000_003C;

/// Control bit: report status on completion.
pub const DESC_STATUS_REQ: u32 = 1 << 0;
/// Control bit: report status on error.
pub const DESC_STATUS_REQ_ERR: u32 = 1 << 1;
/// Control bit: raise interrupt once processed.
pub const DESC_REQUEST_IRQ_PROCESSED: u32 = 1 << 2;
/// Control bit: raise interrupt on error.
pub const DESC_REQUEST_IRQ_ERR: u32 = 1 << 3;

/// Interrupt-target bits, which differ between the PCIe and DRAM DMA flavours.
pub mod irq_target {
    /// PCIe DMA: interrupt the host.
    pub const PCIE_HOST: u32 = 1 << 5;
    /// PCIe DMA: interrupt the device.
    pub const PCIE_DEVICE: u32 = 1 << 4;
    /// DRAM DMA: interrupt the host.
    pub const DRAM_HOST: u32 = 1 << 4;
    /// DRAM DMA: interrupt the device.
    pub const DRAM_DEVICE: u32 = 1 << 5;
}

/// Which DMA flavour the device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaType {
    /// PCIe-attached vDMA.
    Pcie,
    /// On-chip DRAM DMA.
    Dram,
}

impl DmaType {
    /// `(host_bit, device_bit)` for interrupt targeting.
    #[must_use]
    pub const fn interrupt_bits(self) -> (u32, u32) {
        match self {
            Self::Pcie => (irq_target::PCIE_HOST, irq_target::PCIE_DEVICE),
            Self::Dram => (irq_target::DRAM_HOST, irq_target::DRAM_DEVICE),
        }
    }
}

/// Descriptors needed to cover `buffer_size` bytes with `page_size` pages.
#[must_use]
pub const fn descriptors_in_buffer(buffer_size: usize, page_size: u16) -> u32 {
    let page = page_size as usize;
    #[allow(clippy::cast_possible_truncation)]
    let count = buffer_size.div_ceil(page) as u32;
    count
}

/// Smallest power of two that is `>= value`, starting from `min_power_of_2`.
#[must_use]
pub const fn nearest_power_of_2(value: u32, min_power_of_2: u32) -> u32 {
    let mut power = min_power_of_2;
    while value > power {
        power <<= 1;
    }
    power
}

/// Descriptor list size for `batch_size` buffers of `buffer_size` bytes.
///
/// One descriptor is added because a full ring is indistinguishable from an
/// empty one otherwise.
#[must_use]
pub const fn calculate_descriptors_count(buffer_size: u32, batch_size: u16, page_size: u16) -> u32 {
    let per_buffer = descriptors_in_buffer(buffer_size as usize, page_size);
    let wanted = per_buffer.saturating_mul(batch_size as u32).saturating_add(1);
    let capped = if wanted < MAX_DESCS_COUNT {
        wanted
    } else {
        MAX_DESCS_COUNT
    };
    nearest_power_of_2(capped, MIN_DESCS_COUNT)
}

/// `log2(count)` for a power-of-two list, `None` otherwise.
#[must_use]
pub const fn list_depth(count: u32) -> Option<u8> {
    if count.is_power_of_two() {
        #[allow(clippy::cast_possible_truncation)]
        let depth = count.trailing_zeros() as u8;
        Some(depth)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptors_in_buffer_rounds_up() {
        assert_eq!(descriptors_in_buffer(0, 512), 0);
        assert_eq!(descriptors_in_buffer(1, 512), 1);
        assert_eq!(descriptors_in_buffer(512, 512), 1);
        assert_eq!(descriptors_in_buffer(513, 512), 2);
    }

    #[test]
    fn test_nearest_power_of_2() {
        assert_eq!(nearest_power_of_2(0, 2), 2);
        assert_eq!(nearest_power_of_2(3, 2), 4);
        assert_eq!(nearest_power_of_2(100, 64), 128);
        assert_eq!(nearest_power_of_2(64, 64), 64);
    }

    #[test]
    fn test_calculate_descriptors_count() {
        // 2 descs per frame * 4 + 1 = 9 -> 16
        assert_eq!(calculate_descriptors_count(1024, 4, 512), 16);
        assert_eq!(calculate_descriptors_count(u32::MAX, 16, 64), MAX_DESCS_COUNT);
        assert_eq!(calculate_descriptors_count(0, 1, 512), MIN_DESCS_COUNT);
    }

    #[test]
    fn test_list_depth() {
        assert_eq!(list_depth(64 * 1024), Some(16));
        assert_eq!(list_depth(2), Some(1));
        assert_eq!(list_depth(3), None);
    }

    #[test]
    fn test_interrupt_bits_swap_between_dma_types() {
        let (pcie_host, pcie_dev) = DmaType::Pcie.interrupt_bits();
        let (dram_host, dram_dev) = DmaType::Dram.interrupt_bits();
        assert_eq!(pcie_host, dram_dev);
        assert_eq!(pcie_dev, dram_host);
        assert_eq!((pcie_host | pcie_dev) & !IRQ_MASK, 0);
    }
}
