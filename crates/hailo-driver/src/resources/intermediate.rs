//! Buffers chaining one context's output to a later context's input

use crate::driver::{Driver, InterruptsDomain};
use crate::error::{Result, VdmaError};
use crate::vdma::{desc_buffer_sizes_for_single_transfer, HostBufferInfo, SgBuffer};
use bytes::Bytes;
use hailo_chip::vdma::Direction;
use std::sync::Arc;

/// Identifies an intermediate buffer by the stream that produces it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntermediateBufferKey {
    /// Producing stream
    pub src_stream_index: u8,
    /// Producing dynamic context
    pub src_context_index: u8,
    /// Network name as written in the layer, possibly partial
    pub partial_network_name: String,
    /// Batch size the buffer was sized for
    pub batch_size: u16,
}

/// Host buffer holding `batch_size` frames of one inter-context edge
///
/// Firmware drives both channels; the host only programs descriptors so the
/// device is interrupted at the end of each batch.
#[derive(Debug)]
pub struct InterContextBuffer {
    buffer: SgBuffer,
    transfer_size: u32,
    max_batch_size: u16,
    dynamic_batch_size: u16,
}

impl InterContextBuffer {
    /// Allocate and program for `batch_size` frames of `transfer_size`
    ///
    /// # Errors
    ///
    /// `OutOfDescriptors` when the batch cannot be described, or the
    /// allocation error.
    pub fn create(driver: &Arc<dyn Driver>, transfer_size: u32, batch_size: u16) -> Result<Self> {
        let (page_size, desc_count) =
            desc_buffer_sizes_for_single_transfer(driver.as_ref(), batch_size, batch_size, transfer_size)?;
        let buffer = SgBuffer::create(
            driver,
            desc_count,
            page_size,
            Direction::Both,
            None,
        )?;
        let this = Self {
            buffer,
            transfer_size,
            max_batch_size: batch_size,
            dynamic_batch_size: batch_size,
        };
        this.program(batch_size)?;
        Ok(this)
    }

    fn program(&self, batch_size: u16) -> Result<()> {
        let size = self.transfer_size as usize * usize::from(batch_size);
        self.buffer
            .program_descriptors(size, InterruptsDomain::NONE, InterruptsDomain::DEVICE, 0, false)?;
        Ok(())
    }

    /// Move the end-of-batch interrupt to a new batch size
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for 0 or above the batch the buffer was sized for.
    pub fn reprogram(&mut self, dynamic_batch_size: u16) -> Result<()> {
        if dynamic_batch_size == 0 {
            return Err(VdmaError::invalid_argument("Intermediate buffer batch must be at least 1"));
        }
        if dynamic_batch_size > self.max_batch_size {
            return Err(VdmaError::invalid_argument(format!(
                "Dynamic batch {dynamic_batch_size} exceeds intermediate buffer batch {}",
                self.max_batch_size
            )));
        }
        if dynamic_batch_size == self.dynamic_batch_size {
            return Ok(());
        }
        // Clear the old trigger, then tag the new last descriptor
        self.buffer.reprogram_device_interrupts_for_end_of_batch(
            self.transfer_size as usize,
            self.dynamic_batch_size,
            InterruptsDomain::NONE,
        )?;
        self.buffer.reprogram_device_interrupts_for_end_of_batch(
            self.transfer_size as usize,
            dynamic_batch_size,
            InterruptsDomain::DEVICE,
        )?;
        self.dynamic_batch_size = dynamic_batch_size;
        Ok(())
    }

    /// Bytes per frame
    pub const fn transfer_size(&self) -> u32 {
        self.transfer_size
    }

    /// Batch currently programmed
    pub const fn dynamic_batch_size(&self) -> u16 {
        self.dynamic_batch_size
    }

    /// Host buffer info for the activation actions
    pub fn host_buffer_info(&self) -> HostBufferInfo {
        self.buffer.host_buffer_info(self.transfer_size)
    }

    /// Snapshot of the current batch
    ///
    /// # Errors
    ///
    /// Returns the sync error.
    pub fn read(&self) -> Result<Bytes> {
        let size = self.transfer_size as usize * usize::from(self.dynamic_batch_size);
        let mut out = vec![0u8; size];
        self.buffer.read(&mut out, 0, true)?;
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::SoftwareDriver;

    fn tagged_descriptors(buffer: &InterContextBuffer) -> Vec<usize> {
        let region = buffer.buffer.desc_list().region();
        (0..buffer.buffer.descs_count() as usize)
            .filter(|&i| region.read(i).unwrap().irq_bits() != 0)
            .collect()
    }

    #[test]
    fn test_interrupt_at_end_of_batch() {
        let driver: Arc<dyn Driver> = Arc::new(SoftwareDriver::new());
        let mut buffer = InterContextBuffer::create(&driver, 1024, 4).unwrap();
        // 2 descs per frame
        assert_eq!(tagged_descriptors(&buffer), [7]);

        buffer.reprogram(2).unwrap();
        assert_eq!(tagged_descriptors(&buffer), [3]);
        assert_eq!(buffer.dynamic_batch_size(), 2);
        assert!(buffer.reprogram(5).is_err());
    }

    #[test]
    fn test_zero_batch_rejected() {
        let driver: Arc<dyn Driver> = Arc::new(SoftwareDriver::new());
        let mut buffer = InterContextBuffer::create(&driver, 1024, 4).unwrap();
        assert!(matches!(buffer.reprogram(0), Err(VdmaError::InvalidArgument { .. })));
        // Programming is untouched
        assert_eq!(tagged_descriptors(&buffer), [7]);
        assert_eq!(buffer.dynamic_batch_size(), 4);
    }

    #[test]
    fn test_read_covers_current_batch() {
        let driver: Arc<dyn Driver> = Arc::new(SoftwareDriver::new());
        let mut buffer = InterContextBuffer::create(&driver, 256, 3).unwrap();
        assert_eq!(buffer.read().unwrap().len(), 768);
        buffer.reprogram(1).unwrap();
        assert_eq!(buffer.read().unwrap().len(), 256);
    }
}
