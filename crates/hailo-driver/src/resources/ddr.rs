//! DDR buffering: a tensor looped through host memory by a D2H/H2D pair
//!
//! The device writes rows through the D2H channel and reads them back
//! through the H2D channel. Both channels share one circular buffer; the
//! host's only job is forwarding every D2H completion as H2D credit, which
//! a drain thread per pair does while the network group is active.
//!
//! ```text
//! device ──D2H──▶ [ min_buffered_rows × row_size ] ──H2D──▶ device
//!                        ▲ drain thread: NUM_PROCESSED(d2h) → NUM_AVAILABLE(h2d)
//! ```

use crate::driver::{Driver, InterruptsDomain};
use crate::error::{Result, VdmaError};
use crate::vdma::{desc_buffer_sizes_for_single_transfer, HostBufferInfo, SgBuffer, VdmaChannel};
use bytes::Bytes;
use hailo_chip::vdma::{ChannelId, Direction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Upper bound of one drain-thread interrupt wait
pub const DDR_THREAD_WAIT_TIMEOUT: Duration = Duration::from_secs(20);

/// Geometry and channels of one DDR pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdrChannelsInfo {
    /// Channel the device writes rows through
    pub d2h_channel: ChannelId,
    /// Channel the device reads rows back through
    pub h2d_channel: ChannelId,
    /// Stream index of the D2H side
    pub d2h_stream_index: u8,
    /// Stream index of the H2D side
    pub h2d_stream_index: u8,
    /// Bytes per row
    pub row_size: u32,
    /// Rows held in host memory
    pub min_buffered_rows: u16,
    /// Rows per frame
    pub total_buffers_per_frame: u16,
    /// `descs_count - 1`, filled in by [`DdrChannelsPair::create`]
    pub desc_list_size_mask: u16,
}

/// Buffer and channels of one DDR pair, plus its drain thread while open
#[derive(Debug)]
pub struct DdrChannelsPair {
    buffer: SgBuffer,
    info: DdrChannelsInfo,
    d2h: Arc<VdmaChannel>,
    h2d: Arc<VdmaChannel>,
    drain: Option<DrainThread>,
}

#[derive(Debug)]
struct DrainThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl DdrChannelsPair {
    /// Allocate the shared buffer and program every descriptor circularly
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the row size is not a multiple of the page
    /// size, or the sizing/allocation error.
    pub fn create(
        driver: &Arc<dyn Driver>,
        mut info: DdrChannelsInfo,
        d2h: Arc<VdmaChannel>,
        h2d: Arc<VdmaChannel>,
    ) -> Result<Self> {
        let (page_size, desc_count) = desc_buffer_sizes_for_single_transfer(
            driver.as_ref(),
            info.min_buffered_rows,
            info.min_buffered_rows,
            info.row_size,
        )?;
        let buffer = SgBuffer::create(driver, desc_count, page_size, Direction::Both, None)?;
        if info.row_size % u32::from(buffer.desc_page_size()) != 0 {
            return Err(VdmaError::invalid_argument(format!(
                "DDR channel buffer row size ({}) must be a multiple of descriptor page size ({})",
                info.row_size,
                buffer.desc_page_size()
            )));
        }

        buffer.program_descriptors(
            buffer.size(),
            InterruptsDomain::NONE,
            InterruptsDomain::NONE,
            0,
            true,
        )?;
        #[allow(clippy::cast_possible_truncation)] // at most 64K descriptors
        let mask = (buffer.descs_count() - 1) as u16;
        info.desc_list_size_mask = mask;
        tracing::debug!(
            "DDR pair {} -> {}: {} descs x {} bytes",
            info.d2h_channel,
            info.h2d_channel,
            buffer.descs_count(),
            buffer.desc_page_size()
        );

        Ok(Self {
            buffer,
            info,
            d2h,
            h2d,
            drain: None,
        })
    }

    /// Geometry and channels
    pub const fn info(&self) -> &DdrChannelsInfo {
        &self.info
    }

    /// Descriptors in the shared list
    pub fn descs_count(&self) -> u32 {
        self.buffer.descs_count()
    }

    /// Descriptors one frame moves through the pair
    pub fn descriptors_per_frame(&self) -> u32 {
        (self.info.row_size / u32::from(self.buffer.desc_page_size()))
            * u32::from(self.info.total_buffers_per_frame)
    }

    /// Host buffer info for the activation actions, one row per pattern
    pub fn host_buffer_info(&self) -> HostBufferInfo {
        self.buffer.host_buffer_info(self.info.row_size)
    }

    /// Snapshot of the whole buffer
    ///
    /// # Errors
    ///
    /// Returns the sync error.
    pub fn read(&self) -> Result<Bytes> {
        let mut out = vec![0u8; self.buffer.size()];
        self.buffer.read(&mut out, 0, true)?;
        Ok(Bytes::from(out))
    }

    /// Whether a drain thread is running
    pub const fn is_open(&self) -> bool {
        self.drain.is_some()
    }

    /// Start the drain thread
    ///
    /// Aborts left over from a previous activation are cleared first.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if already open, or the thread spawn error.
    pub fn open(&mut self) -> Result<()> {
        if self.drain.is_some() {
            return Err(VdmaError::invalid_operation(format!(
                "DDR pair {} is already open",
                self.info.d2h_channel
            )));
        }
        self.d2h.clear_abort()?;
        self.h2d.clear_abort()?;

        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let (d2h, h2d, stop) = (Arc::clone(&self.d2h), Arc::clone(&self.h2d), Arc::clone(&stop));
            let mask = self.info.desc_list_size_mask;
            thread::Builder::new()
                .name(format!("ddr-{}", self.info.d2h_channel))
                .spawn(move || drain(&d2h, &h2d, mask, &stop))?
        };
        self.drain = Some(DrainThread { stop, handle });
        Ok(())
    }

    /// Abort both channels, unblocking the drain thread
    ///
    /// # Errors
    ///
    /// Returns the first driver error; both channels are attempted.
    pub fn abort(&self) -> Result<()> {
        let d2h = self.d2h.abort();
        let h2d = self.h2d.abort();
        d2h.and(h2d)
    }

    /// Stop and join the drain thread; a no-op when not open
    pub fn close(&mut self) {
        let Some(drain) = self.drain.take() else {
            return;
        };
        drain.stop.store(true, Ordering::Release);
        if !self.d2h.is_aborted() {
            if let Err(e) = self.d2h.abort() {
                tracing::warn!("Failed to abort DDR channel {} on close: {e}", self.info.d2h_channel);
            }
        }
        if drain.handle.join().is_err() {
            tracing::error!("DDR drain thread of {} panicked", self.info.d2h_channel);
        }
    }
}

impl Drop for DdrChannelsPair {
    fn drop(&mut self) {
        self.close();
    }
}

fn drain(d2h: &VdmaChannel, h2d: &VdmaChannel, desc_list_size_mask: u16, stop: &AtomicBool) {
    tracing::debug!("DDR drain thread {} -> {} started", d2h.channel_id(), h2d.channel_id());
    while !stop.load(Ordering::Acquire) {
        match d2h.wait_for_interrupts(DDR_THREAD_WAIT_TIMEOUT) {
            Ok(num_processed) => {
                if let Err(e) = h2d.set_num_available(num_processed & desc_list_size_mask) {
                    tracing::error!("DDR channel {} credit update failed: {e}", h2d.channel_id());
                    break;
                }
            }
            Err(e) if e.is_timeout() => {
                tracing::debug!("DDR channel {} idle for {DDR_THREAD_WAIT_TIMEOUT:?}", d2h.channel_id());
            }
            Err(e) if e.is_aborted() || matches!(e, VdmaError::NotActivated) => break,
            Err(e) => {
                tracing::error!("DDR channel {} wait failed: {e}", d2h.channel_id());
                break;
            }
        }
    }
    tracing::debug!("DDR drain thread {} stopped", d2h.channel_id());
}
