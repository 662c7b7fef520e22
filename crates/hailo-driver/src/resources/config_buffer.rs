//! Configuration stream buffer
//!
//! CCWs are appended to a scatter-gather buffer and handed to firmware in
//! chunks: each [`ConfigResources::program_descriptors`] call closes the
//! bytes written since the previous one into a run of descriptors, the last
//! of which interrupts the device.
//!
//! ```text
//! | programmed (acc_desc_count pages) | pending (acc_offset bytes) | free |
//! ```

use crate::driver::{Driver, InterruptsDomain};
use crate::error::{Result, VdmaError};
use crate::vdma::{desc_buffer_sizes_for_multiple_transfers, HostBufferInfo, SgBuffer};
use hailo_chip::vdma::{ChannelId, Direction};
use std::sync::Arc;

/// A CCW is a 64-bit header; all-zero is a NOP
const CCW_HEADER_SIZE: usize = 8;
const CCW_NOP: u64 = 0;

/// Config buffer of one cfg channel within one context
#[derive(Debug)]
pub struct ConfigResources {
    buffer: SgBuffer,
    channel_id: ChannelId,
    total_size: usize,
    current_size: usize,
    acc_offset: usize,
    acc_desc_count: usize,
    padding: usize,
}

impl ConfigResources {
    /// Buffer for CCW bursts of the given sizes
    ///
    /// # Errors
    ///
    /// `OutOfDescriptors` when the bursts cannot be described, or the
    /// allocation error.
    pub fn create(driver: &Arc<dyn Driver>, channel_id: ChannelId, cfg_sizes: &[u32]) -> Result<Self> {
        let total_size = cfg_sizes.iter().map(|&size| size as usize).sum();
        let (page_size, desc_count) = desc_buffer_sizes_for_multiple_transfers(driver.as_ref(), 1, cfg_sizes)?;
        let buffer = SgBuffer::create(
            driver,
            desc_count,
            page_size,
            Direction::H2D,
            Some(channel_id),
        )?;
        Ok(Self {
            buffer,
            channel_id,
            total_size,
            current_size: 0,
            acc_offset: 0,
            acc_desc_count: 0,
            padding: 0,
        })
    }

    /// Cfg channel the buffer feeds
    pub const fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Descriptor page size
    pub const fn desc_page_size(&self) -> u16 {
        self.buffer.desc_page_size()
    }

    /// Payload bytes still expected
    pub const fn size_left(&self) -> usize {
        self.total_size - self.current_size
    }

    /// Payload bytes written so far
    pub const fn current_size(&self) -> usize {
        self.current_size
    }

    /// Append CCWs
    ///
    /// # Errors
    ///
    /// `InsufficientBuffer` when `data` exceeds what is left of the
    /// declared total.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.size_left() {
            tracing::error!(
                "Write too many config words to channel {} ({} > {})",
                self.channel_id,
                data.len(),
                self.size_left()
            );
            return Err(VdmaError::InsufficientBuffer {
                requested: data.len(),
                available: self.size_left(),
            });
        }
        self.write_inner(data)?;
        self.current_size += data.len();
        Ok(())
    }

    fn write_inner(&mut self, data: &[u8]) -> Result<()> {
        let offset = self.acc_desc_count * usize::from(self.desc_page_size()) + self.acc_offset;
        self.buffer.write(data, offset)?;
        self.acc_offset += data.len();
        Ok(())
    }

    /// Close the pending bytes into descriptors; returns how many
    ///
    /// Nothing pending programs nothing.
    ///
    /// # Errors
    ///
    /// `OutOfDescriptors` if the list is exhausted.
    pub fn program_descriptors(&mut self) -> Result<u16> {
        if self.acc_offset == 0 {
            return Ok(0);
        }
        let count = self.buffer.program_descriptors(
            self.acc_offset,
            InterruptsDomain::NONE,
            InterruptsDomain::DEVICE,
            self.acc_desc_count,
            false,
        )?;
        self.acc_desc_count += usize::from(count);
        self.acc_offset = 0;
        Ok(count)
    }

    /// Fill the rest of the last page with CCW NOPs
    ///
    /// # Errors
    ///
    /// `InvalidOperation` before every payload byte is written or when the
    /// last page residue is not CCW aligned.
    pub fn pad_with_nops(&mut self) -> Result<()> {
        if self.size_left() != 0 {
            return Err(VdmaError::invalid_operation(format!(
                "Cfg channel {} padded with {} bytes still unwritten",
                self.channel_id,
                self.size_left()
            )));
        }
        let page_size = usize::from(self.desc_page_size());
        let residue = self.total_size % page_size;
        if residue % CCW_HEADER_SIZE != 0 {
            return Err(VdmaError::invalid_operation(format!(
                "Cfg channel buffer size must be a multiple of CCW header size ({CCW_HEADER_SIZE})"
            )));
        }
        if residue == 0 {
            return Ok(());
        }
        let nop_count = (page_size - residue) / CCW_HEADER_SIZE;
        for _ in 0..nop_count {
            self.write_inner(&CCW_NOP.to_le_bytes())?;
        }
        self.padding = nop_count * CCW_HEADER_SIZE;
        Ok(())
    }

    /// Payload plus NOP padding
    pub const fn get_total_cfg_size(&self) -> usize {
        self.total_size + self.padding
    }

    /// Host buffer covering the programmed descriptors
    pub fn host_buffer_info(&self) -> HostBufferInfo {
        #[allow(clippy::cast_possible_truncation)] // at most 64K pages
        let bytes = (self.acc_desc_count * usize::from(self.desc_page_size())) as u32;
        self.buffer.host_buffer_info(bytes)
    }

    /// Copy `dst.len()` bytes from the start of the buffer
    ///
    /// # Errors
    ///
    /// `InsufficientBuffer` past the end.
    pub fn read(&self, dst: &mut [u8]) -> Result<()> {
        self.buffer.read(dst, 0, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::SoftwareDriver;

    fn config(sizes: &[u32]) -> ConfigResources {
        let driver: Arc<dyn Driver> = Arc::new(SoftwareDriver::new());
        ConfigResources::create(&driver, ChannelId::checked(0, 0).unwrap(), sizes).unwrap()
    }

    #[test]
    fn test_write_past_total_is_insufficient() {
        let mut cfg = config(&[64]);
        cfg.write(&[1; 40]).unwrap();
        assert_eq!(cfg.size_left(), 24);
        assert!(matches!(
            cfg.write(&[1; 32]),
            Err(VdmaError::InsufficientBuffer {
                requested: 32,
                available: 24
            })
        ));
        cfg.write(&[2; 24]).unwrap();
        assert_eq!(cfg.current_size(), 64);
    }

    #[test]
    fn test_program_accumulates_descriptors() {
        let mut cfg = config(&[6000, 1000]);
        assert_eq!(cfg.desc_page_size(), 512);
        assert_eq!(cfg.program_descriptors().unwrap(), 0);

        cfg.write(&[0xAA; 6000]).unwrap();
        assert_eq!(cfg.program_descriptors().unwrap(), 12);
        cfg.write(&[0xBB; 1000]).unwrap();
        assert_eq!(cfg.program_descriptors().unwrap(), 2);
        assert_eq!(cfg.host_buffer_info().bytes_in_pattern, 14 * 512);

        // Second burst starts on a fresh page
        let mut head = vec![0u8; 12 * 512 + 1];
        cfg.read(&mut head).unwrap();
        assert_eq!(head[5999], 0xAA);
        assert_eq!(head[6000], 0);
        assert_eq!(head[12 * 512], 0xBB);
    }

    #[test]
    fn test_pad_fills_last_page_with_nops() {
        let mut cfg = config(&[520]);
        assert!(cfg.pad_with_nops().is_err());
        cfg.write(&[0xFF; 520]).unwrap();
        cfg.pad_with_nops().unwrap();
        assert_eq!(cfg.get_total_cfg_size(), 1024);
        assert_eq!(cfg.program_descriptors().unwrap(), 2);

        let mut page = vec![0xEEu8; 1024];
        cfg.read(&mut page).unwrap();
        assert!(page[..520].iter().all(|&b| b == 0xFF));
        assert!(page[520..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pad_rejects_unaligned_residue() {
        let mut cfg = config(&[100]);
        cfg.write(&[1; 100]).unwrap();
        assert!(matches!(cfg.pad_with_nops(), Err(VdmaError::InvalidOperation { .. })));
    }
}
