//! Blocking input and output streams
//!
//! A stream wraps one boundary channel. Handles are cheap clones of one
//! shared core, so a writer thread and a reader thread can each own one.
//!
//! ```text
//! write(frame) ──▶ wait(frame, timeout) ──▶ transfer ──▶ H2D channel
//! read(frame)  ◀── transfer ◀── wait(frame, timeout) ◀── D2H channel
//! ```

use crate::error::{Result, VdmaError};
use crate::vdma::VdmaChannel;
use hailo_chip::vdma::{ChannelId, Direction};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct StreamCore {
    channel: Arc<VdmaChannel>,
    name: String,
    frame_size: u32,
    max_batch_size: u16,
    timeout: Mutex<Duration>,
    dynamic_batch_size: AtomicU16,
}

impl StreamCore {
    fn new(channel: Arc<VdmaChannel>, frame_size: u32, max_batch_size: u16, timeout: Duration) -> Self {
        Self {
            name: channel.stream_name().to_owned(),
            channel,
            frame_size,
            max_batch_size,
            timeout: Mutex::new(timeout),
            dynamic_batch_size: AtomicU16::new(max_batch_size),
        }
    }

    fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    fn check_frame(&self, len: usize) -> Result<()> {
        if len == self.frame_size as usize {
            Ok(())
        } else {
            Err(VdmaError::invalid_argument(format!(
                "Stream {} transfers frames of {} bytes, got {len}",
                self.name, self.frame_size
            )))
        }
    }

    fn set_dynamic_batch_size(&self, batch_size: u16) -> Result<()> {
        let batch_size = if batch_size == 0 { self.max_batch_size } else { batch_size };
        if batch_size > self.max_batch_size {
            return Err(VdmaError::invalid_argument(format!(
                "Dynamic batch size {batch_size} of stream {} exceeds its batch size {}",
                self.name, self.max_batch_size
            )));
        }
        self.channel.set_transfers_per_axi_intr(batch_size)?;
        self.dynamic_batch_size.store(batch_size, Ordering::Release);
        Ok(())
    }

    fn activate(&self, dynamic_batch_size: u16, transfer_size: u32) -> Result<()> {
        self.set_dynamic_batch_size(dynamic_batch_size)?;
        if !self.channel.is_enabled() {
            self.channel.register_fw_controlled_channel()?;
        }
        self.channel.complete_channel_activation(transfer_size)
    }

    fn flush_timeout(&self) -> Duration {
        self.timeout() * u32::from(self.dynamic_batch_size.load(Ordering::Acquire).max(1))
    }
}

macro_rules! stream_common {
    () => {
        /// Stream name
        pub fn name(&self) -> &str {
            &self.core.name
        }

        /// Bytes per frame
        pub fn frame_size(&self) -> u32 {
            self.core.frame_size
        }

        /// Channel carrying the stream
        pub fn channel_id(&self) -> ChannelId {
            self.core.channel.channel_id()
        }

        /// Batch size the stream was configured with
        pub fn max_batch_size(&self) -> u16 {
            self.core.max_batch_size
        }

        /// Batch size of the current activation
        pub fn dynamic_batch_size(&self) -> u16 {
            self.core.dynamic_batch_size.load(Ordering::Acquire)
        }

        /// Blocking timeout of one transfer
        pub fn timeout(&self) -> Duration {
            self.core.timeout()
        }

        /// Change the blocking timeout
        pub fn set_timeout(&self, timeout: Duration) {
            *self.core.timeout.lock() = timeout;
        }

        /// Change the batch size; 0 selects the configured batch size
        ///
        /// # Errors
        ///
        /// `InvalidArgument` above the configured batch size.
        pub fn set_dynamic_batch_size(&self, batch_size: u16) -> Result<()> {
            self.core.set_dynamic_batch_size(batch_size)
        }

        /// Unblock pending calls with `AbortedByUser`
        ///
        /// # Errors
        ///
        /// Returns the driver error.
        pub fn abort(&self) -> Result<()> {
            self.core.channel.abort()
        }

        /// Undo [`abort`](Self::abort)
        ///
        /// # Errors
        ///
        /// Returns the driver error.
        pub fn clear_abort(&self) -> Result<()> {
            self.core.channel.clear_abort()
        }

        /// Whether the stream is aborted
        pub fn is_aborted(&self) -> bool {
            self.core.channel.is_aborted()
        }
    };
}

/// Host-to-device stream
#[derive(Debug, Clone)]
pub struct InputStream {
    core: Arc<StreamCore>,
}

impl InputStream {
    /// Stream over a boundary H2D channel
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the channel is not H2D.
    pub fn new(channel: Arc<VdmaChannel>, frame_size: u32, max_batch_size: u16, timeout: Duration) -> Result<Self> {
        if channel.direction() != Direction::H2D {
            return Err(VdmaError::invalid_argument(format!(
                "Input stream {} needs an H2D channel, got {}",
                channel.stream_name(),
                channel.channel_id()
            )));
        }
        Ok(Self {
            core: Arc::new(StreamCore::new(channel, frame_size, max_batch_size, timeout)),
        })
    }

    stream_common!();

    /// Write one frame, blocking until the channel has room
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a buffer that is not one frame, `Timeout`,
    /// `AbortedByUser`, or the transfer error.
    pub fn write(&self, frame: &[u8]) -> Result<()> {
        self.core.check_frame(frame.len())?;
        self.core.channel.wait(frame.len(), self.core.timeout())?;
        self.core.channel.transfer_h2d(frame)
    }

    /// Block until every written frame was consumed, for up to the timeout
    /// times the batch size
    ///
    /// # Errors
    ///
    /// `Timeout` or `AbortedByUser`.
    pub fn flush(&self) -> Result<()> {
        self.core.channel.flush(self.core.flush_timeout())
    }

    /// Enable the channel and reset it for a new activation
    ///
    /// # Errors
    ///
    /// Returns the batch, enable or activation error.
    pub fn activate_stream(&self, dynamic_batch_size: u16) -> Result<()> {
        self.core.activate(dynamic_batch_size, 0)
    }

    /// Flush what was written, then stop the channel
    ///
    /// A failed flush is logged; an aborted one is expected.
    ///
    /// # Errors
    ///
    /// Returns the stop error.
    pub fn deactivate_stream(&self) -> Result<()> {
        match self.flush() {
            Ok(()) => {}
            Err(e) if e.is_aborted() => {
                tracing::info!("Flush of {} aborted during deactivation", self.core.name);
            }
            Err(e) => tracing::warn!("Flush of {} failed during deactivation: {e}", self.core.name),
        }
        self.core.channel.stop_channel()
    }
}

/// Device-to-host stream
#[derive(Debug, Clone)]
pub struct OutputStream {
    core: Arc<StreamCore>,
}

impl OutputStream {
    /// Stream over a boundary D2H channel
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the channel is not D2H.
    pub fn new(channel: Arc<VdmaChannel>, frame_size: u32, max_batch_size: u16, timeout: Duration) -> Result<Self> {
        if channel.direction() != Direction::D2H {
            return Err(VdmaError::invalid_argument(format!(
                "Output stream {} needs a D2H channel, got {}",
                channel.stream_name(),
                channel.channel_id()
            )));
        }
        Ok(Self {
            core: Arc::new(StreamCore::new(channel, frame_size, max_batch_size, timeout)),
        })
    }

    stream_common!();

    /// Read one frame, blocking until the device produced it
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a buffer that is not one frame, `Timeout`,
    /// `AbortedByUser`, or the transfer error.
    pub fn read(&self, frame: &mut [u8]) -> Result<()> {
        self.core.check_frame(frame.len())?;
        self.core.channel.wait(frame.len(), self.core.timeout())?;
        self.core.channel.transfer_d2h(frame)
    }

    /// Enable the channel and pre-program receive descriptors
    ///
    /// # Errors
    ///
    /// Returns the batch, enable or activation error.
    pub fn activate_stream(&self, dynamic_batch_size: u16) -> Result<()> {
        self.core.activate(dynamic_batch_size, self.core.frame_size)
    }

    /// Stop the channel
    ///
    /// # Errors
    ///
    /// Returns the stop error.
    pub fn deactivate_stream(&self) -> Result<()> {
        self.core.channel.stop_channel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Driver;
    use crate::drivers::SoftwareDriver;
    use hailo_chip::descriptor::DEFAULT_DESC_PAGE_SIZE;

    fn channel(driver: &Arc<dyn Driver>, index: u8, direction: Direction) -> Arc<VdmaChannel> {
        let id = ChannelId::checked(0, index).unwrap();
        let channel =
            VdmaChannel::create(id, direction, driver, DEFAULT_DESC_PAGE_SIZE, format!("s{index}"), None, 2).unwrap();
        channel.allocate_resources(64).unwrap();
        Arc::new(channel)
    }

    #[test]
    fn test_direction_is_checked() {
        let driver: Arc<dyn Driver> = Arc::new(SoftwareDriver::new());
        let d2h = channel(&driver, 16, Direction::D2H);
        assert!(InputStream::new(Arc::clone(&d2h), 512, 2, Duration::from_secs(1)).is_err());
        assert!(OutputStream::new(d2h, 512, 2, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_dynamic_batch_bounds() {
        let driver: Arc<dyn Driver> = Arc::new(SoftwareDriver::new());
        let input = InputStream::new(channel(&driver, 0, Direction::H2D), 512, 4, Duration::from_secs(1)).unwrap();
        input.set_dynamic_batch_size(2).unwrap();
        assert_eq!(input.dynamic_batch_size(), 2);
        input.set_dynamic_batch_size(0).unwrap();
        assert_eq!(input.dynamic_batch_size(), 4);
        assert!(matches!(
            input.set_dynamic_batch_size(5),
            Err(VdmaError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_frame_size_is_checked() {
        let driver: Arc<dyn Driver> = Arc::new(SoftwareDriver::new());
        let input = InputStream::new(channel(&driver, 0, Direction::H2D), 512, 1, Duration::from_secs(1)).unwrap();
        input.activate_stream(1).unwrap();
        assert!(matches!(input.write(&[0; 100]), Err(VdmaError::InvalidArgument { .. })));
        input.deactivate_stream().unwrap();
    }

    #[test]
    fn test_clones_share_timeout() {
        let driver: Arc<dyn Driver> = Arc::new(SoftwareDriver::new());
        let output = OutputStream::new(channel(&driver, 16, Direction::D2H), 512, 1, Duration::from_secs(1)).unwrap();
        let other = output.clone();
        other.set_timeout(Duration::from_millis(20));
        assert_eq!(output.timeout(), Duration::from_millis(20));
    }
}
