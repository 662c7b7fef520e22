//! vDMA channel: one direction of one hardware channel
//!
//! The channel owns a scatter-gather buffer and tracks the transfers in
//! flight with two rings: the descriptor counters (`head` = host
//! `NUM_AVAILABLE`, `tail` = last retired descriptor + 1) and the pending
//! transfer ring, one slot per frame handed to the hardware.
//!
//! ```text
//! H2D: wait(room) → transfer_h2d → [device consumes] → irq → retire
//! D2H: activation pre-programs frames → [device fills] → irq → retire
//!      → wait(ready) → transfer_d2h → re-program the slot
//! ```
//!
//! State lives behind a `parking_lot::Mutex`; a thread that finds another
//! thread already blocked in the driver's interrupt wait parks on the
//! direction's condvar instead of issuing a second wait.

// Ring indices fit u16 (descriptor lists are at most 64K entries)
#![allow(clippy::cast_possible_truncation)]

use crate::driver::{ChannelHandle, ChannelInterruptTimestampList, Driver, InterruptsDomain};
use crate::error::{Result, VdmaError};
use crate::vdma::circular::{is_desc_between, CircularCounters};
use crate::vdma::{HostBufferInfo, LatencyMeter, SgBuffer, VdmaDescriptor};
use hailo_chip::descriptor::{self, DESC_STATUS_REQ_ERR, MAX_DESCS_COUNT, MIN_DESCS_COUNT};
use hailo_chip::regs;
use hailo_chip::vdma::{ChannelId, Direction, CHANNELS_PER_ENGINE, PENDING_BUFFERS_SIZE};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default)]
struct PendingBuffer {
    last_desc: u16,
    latency_measure_desc: u16,
}

#[derive(Debug)]
struct ChannelState {
    buffer: Option<SgBuffer>,
    descs: CircularCounters,
    buffers: CircularCounters,
    pending: Vec<PendingBuffer>,
    d2h_read_desc_index: usize,
    previous_tail: usize,
    should_reprogram_buffer: bool,
    last_timestamp_num_processed: u16,
    accumulated_transfers: u16,
    transfers_per_axi_intr: u16,
    handle: Option<ChannelHandle>,
    aborted: bool,
    waiting_for_interrupts: bool,
}

impl ChannelState {
    fn reset_counters(&mut self) {
        self.descs.reset();
        self.buffers.reset();
        self.d2h_read_desc_index = 0;
        self.last_timestamp_num_processed = 0;
        self.accumulated_transfers = 0;
    }

    fn buffer(&self) -> Result<&SgBuffer> {
        self.buffer
            .as_ref()
            .ok_or_else(|| VdmaError::invalid_operation("Channel resources are not allocated"))
    }

    fn desc_mask(&self) -> u16 {
        self.descs.mask() as u16
    }
}

/// One direction of a hardware vDMA channel
#[derive(Debug)]
pub struct VdmaChannel {
    channel_id: ChannelId,
    direction: Direction,
    page_size: u16,
    stream_name: String,
    latency_meter: Option<Arc<LatencyMeter>>,
    driver: Arc<dyn Driver>,
    state: Mutex<ChannelState>,
    can_write: Condvar,
    can_read: Condvar,
}

impl VdmaChannel {
    /// Create a disabled channel without resources
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for `Direction::Both`, a zero
    /// `transfers_per_axi_intr`, a non-power-of-two page size, a channel
    /// index past 31 or an engine the device does not have.
    pub fn create(
        channel_id: ChannelId,
        direction: Direction,
        driver: &Arc<dyn Driver>,
        requested_page_size: u16,
        stream_name: impl Into<String>,
        latency_meter: Option<Arc<LatencyMeter>>,
        transfers_per_axi_intr: u16,
    ) -> Result<Self> {
        if direction == Direction::Both {
            return Err(VdmaError::invalid_argument("Channel direction must be H2D or D2H"));
        }
        if transfers_per_axi_intr == 0 {
            return Err(VdmaError::invalid_argument("Invalid transfers per axi interrupt"));
        }
        let page_size = driver.calc_desc_page_size(requested_page_size);
        if !page_size.is_power_of_two() {
            return Err(VdmaError::invalid_argument("Descriptor page_size must be a power of two."));
        }
        if channel_id.channel_index >= CHANNELS_PER_ENGINE {
            return Err(VdmaError::InvalidChannelId {
                channel_index: channel_id.channel_index,
            });
        }
        if channel_id.engine_index >= driver.dma_engines_count() {
            return Err(VdmaError::invalid_argument(format!(
                "Invalid DMA engine index {}, max {}",
                channel_id.engine_index,
                driver.dma_engines_count()
            )));
        }

        let pending_size = if latency_meter.is_some() {
            PENDING_BUFFERS_SIZE / 2
        } else {
            PENDING_BUFFERS_SIZE
        };

        Ok(Self {
            channel_id,
            direction,
            page_size,
            stream_name: stream_name.into(),
            latency_meter,
            driver: Arc::clone(driver),
            state: Mutex::new(ChannelState {
                buffer: None,
                descs: CircularCounters::new(MIN_DESCS_COUNT as usize),
                buffers: CircularCounters::new(pending_size),
                pending: vec![PendingBuffer::default(); pending_size],
                d2h_read_desc_index: 0,
                previous_tail: 0,
                should_reprogram_buffer: false,
                last_timestamp_num_processed: 0,
                accumulated_transfers: 0,
                transfers_per_axi_intr,
                handle: None,
                aborted: false,
                waiting_for_interrupts: false,
            }),
            can_write: Condvar::new(),
            can_read: Condvar::new(),
        })
    }

    /// Hardware channel id
    pub const fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Data direction
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Descriptor page size
    pub const fn page_size(&self) -> u16 {
        self.page_size
    }

    /// Stream this channel serves
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Whether the channel currently holds a driver handle
    pub fn is_enabled(&self) -> bool {
        self.state.lock().handle.is_some()
    }

    /// Allocate the channel's SG buffer of `desc_count` pages
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if already allocated, `InvalidArgument`
    /// for more than 64K descriptors, or the allocation error.
    pub fn allocate_resources(&self, desc_count: u32) -> Result<()> {
        if desc_count > MAX_DESCS_COUNT {
            return Err(VdmaError::invalid_argument(format!(
                "Vdma channel descs_count mustn't be larger than {MAX_DESCS_COUNT}"
            )));
        }
        let mut state = self.state.lock();
        if state.buffer.is_some() {
            return Err(VdmaError::invalid_operation("Channel buffer is already allocated"));
        }

        let buffer = SgBuffer::create(
            &self.driver,
            desc_count,
            self.page_size,
            self.direction,
            Some(self.channel_id),
        )?;

        // Host-side defaults: full pages, report errors
        let region = buffer.desc_list().region();
        for index in 0..desc_count as usize {
            let desc = region.read(index)?;
            region.write(
                index,
                VdmaDescriptor {
                    page_size_desc_control: (u32::from(self.page_size) << descriptor::PAGE_SIZE_SHIFT)
                        | DESC_STATUS_REQ_ERR,
                    remaining_page_size_status: 0,
                    ..desc
                },
            )?;
        }

        state.descs = CircularCounters::new(desc_count as usize);
        state.previous_tail = 0;
        state.should_reprogram_buffer = false;
        state.buffer = Some(buffer);
        state.reset_counters();

        tracing::debug!(
            "Channel {} ({}): {desc_count} descs x {} bytes",
            self.channel_id,
            self.stream_name,
            self.page_size
        );
        Ok(())
    }

    /// SG buffer size in bytes
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` before `allocate_resources`.
    pub fn buffer_size(&self) -> Result<usize> {
        Ok(self.state.lock().buffer()?.size())
    }

    /// Host buffer info handed to firmware for a boundary channel
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` before `allocate_resources`.
    pub fn boundary_buffer_info(&self, transfer_size: u32) -> Result<HostBufferInfo> {
        Ok(self.state.lock().buffer()?.host_buffer_info(transfer_size))
    }

    /// Acquire a driver handle
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if already enabled, or the driver error.
    pub fn enable(&self, measure_timestamps: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.handle.is_some() {
            return Err(VdmaError::invalid_operation(format!(
                "Channel {} is already enabled",
                self.channel_id
            )));
        }
        let handle = self
            .driver
            .vdma_channel_enable(self.channel_id, self.direction, measure_timestamps)
            .inspect_err(|e| tracing::error!("Failed to enable channel {}: {e}", self.channel_id))?;
        state.handle = Some(handle);
        Ok(())
    }

    /// Enable on behalf of firmware; timestamps are measured when the
    /// channel has a latency meter
    ///
    /// # Errors
    ///
    /// See [`enable`](Self::enable).
    pub fn register_fw_controlled_channel(&self) -> Result<()> {
        self.enable(self.latency_meter.is_some())
    }

    /// Release the driver handle and reset the counters
    ///
    /// # Errors
    ///
    /// Returns the driver error if disabling fails; the handle is dropped
    /// regardless.
    pub fn disable(&self) -> Result<()> {
        self.stop_channel()
    }

    /// See [`disable`](Self::disable)
    ///
    /// # Errors
    ///
    /// Returns the driver error if disabling fails.
    pub fn stop_channel(&self) -> Result<()> {
        let result = {
            let mut state = self.state.lock();
            self.stop_locked(&mut state)
        };
        self.notify_all();
        result
    }

    fn stop_locked(&self, state: &mut ChannelState) -> Result<()> {
        let result = match state.handle.take() {
            Some(handle) => self
                .driver
                .vdma_channel_disable(self.channel_id, handle)
                .inspect_err(|e| tracing::error!("Failed to disable channel {}: {e}", self.channel_id)),
            None => Ok(()),
        };

        if self.direction == Direction::H2D && state.buffer.is_some() {
            // Writes restart where the hardware stopped reading
            let mask = state.descs.mask();
            state.previous_tail = (state.descs.tail() + state.previous_tail) & mask;
            state.should_reprogram_buffer |= state.previous_tail != 0;
        }
        state.reset_counters();
        result
    }

    /// Reset counters after enabling; D2H channels pre-program as many
    /// frames of `transfer_size` as fit
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the channel is not enabled or has no
    /// buffer, or the programming error (the channel is stopped then).
    pub fn complete_channel_activation(&self, transfer_size: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.handle.is_none() {
            return Err(VdmaError::invalid_operation(
                "Vdma channel must be registered before activation",
            ));
        }
        state.buffer()?;
        state.reset_counters();

        if self.direction == Direction::D2H && transfer_size != 0 {
            if let Err(e) = self.prepare_d2h_pending_descriptors(&mut state, transfer_size as usize) {
                if let Err(stop) = self.stop_locked(&mut state) {
                    tracing::error!("Failed to stop channel {} after activation error: {stop}", self.channel_id);
                }
                return Err(e);
            }
            return Ok(());
        }

        if state.should_reprogram_buffer {
            let offset = state.previous_tail * usize::from(self.page_size);
            state.buffer()?.reprogram_buffer_offset(offset, self.channel_id)?;
        }
        Ok(())
    }

    fn prepare_d2h_pending_descriptors(&self, state: &mut ChannelState, transfer_size: usize) -> Result<()> {
        let descs_in_transfer = state.buffer()?.desc_list().descriptors_in_buffer(transfer_size) as usize;
        let transfers_in_buffer = (state.descs.size() - 1) / descs_in_transfer.max(1);
        let transfers = transfers_in_buffer.min(state.buffers.size() - 1);
        let per_intr = usize::from(state.transfers_per_axi_intr);

        for i in 0..transfers {
            // Firmware only needs the end of each batch
            let last_domain = if i % per_intr == per_intr - 1 {
                InterruptsDomain::BOTH
            } else {
                InterruptsDomain::HOST
            };
            self.prepare_descriptors(state, transfer_size, InterruptsDomain::NONE, last_domain)
                .inspect_err(|e| tracing::error!("Failed prepare desc on channel {}: {e}", self.channel_id))?;
        }
        state.accumulated_transfers = (transfers % per_intr) as u16;
        Ok(())
    }

    /// Abort: waiters return `AbortedByUser` until [`clear_abort`](Self::clear_abort)
    ///
    /// # Errors
    ///
    /// Returns the driver error from the abort call.
    pub fn abort(&self) -> Result<()> {
        let handle = {
            let mut state = self.state.lock();
            state.aborted = true;
            state.handle
        };
        self.notify_all();
        match handle {
            Some(handle) => self.driver.vdma_channel_abort(self.channel_id, handle),
            None => Ok(()),
        }
    }

    /// Undo [`abort`](Self::abort)
    ///
    /// # Errors
    ///
    /// Returns the driver error from the clear call; the flag is cleared
    /// regardless.
    pub fn clear_abort(&self) -> Result<()> {
        let handle = self.state.lock().handle;
        let result = match handle {
            Some(handle) => self.driver.vdma_channel_clear_abort(self.channel_id, handle),
            None => Ok(()),
        };
        self.state.lock().aborted = false;
        result
    }

    /// Whether [`abort`](Self::abort) is in effect
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// Block until a transfer of `buffer_size` bytes can proceed
    ///
    /// H2D: the rings have room for it. D2H: that many bytes are ready.
    ///
    /// # Errors
    ///
    /// `Timeout`, `AbortedByUser`, `NotActivated`, or `InvalidArgument`
    /// when `buffer_size` exceeds the channel buffer.
    pub fn wait(&self, buffer_size: usize, timeout: Duration) -> Result<()> {
        let (desc_num, size) = {
            let state = self.state.lock();
            let buffer = state.buffer()?;
            (
                buffer.desc_list().descriptors_in_buffer(buffer_size) as usize,
                buffer.size(),
            )
        };
        if buffer_size > size {
            return Err(VdmaError::invalid_argument(format!(
                "Requested transfer size ({buffer_size}) must not exceed the channel buffer ({size})"
            )));
        }

        match self.direction {
            Direction::H2D => self.wait_for_condition(
                |state| {
                    if state.buffers.avail() == 0 {
                        return false;
                    }
                    if desc_num == state.descs.size() {
                        return state.descs.head() == state.descs.tail();
                    }
                    state.descs.avail() >= desc_num
                },
                timeout,
            ),
            _ => self.wait_for_condition(
                |state| state.descs.prog_between(state.descs.tail(), state.d2h_read_desc_index) >= desc_num,
                timeout,
            ),
        }
    }

    /// Copy `src` into the ring and hand it to the hardware
    ///
    /// # Errors
    ///
    /// `AbortedByUser` when aborted, `OutOfDescriptors` when called without
    /// a successful [`wait`](Self::wait), `NotActivated` when disabled.
    pub fn transfer_h2d(&self, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Err(VdmaError::invalid_argument("Transfer buffer is empty"));
        }
        self.check_direction(Direction::H2D)?;
        let mut state = self.state.lock();
        if state.aborted {
            tracing::info!("Tried to write to aborted channel {}", self.channel_id);
            return Err(VdmaError::AbortedByUser);
        }

        let buffer = state.buffer()?;
        let desc_num = buffer.desc_list().descriptors_in_buffer(src.len()) as usize;
        if state.descs.avail() < desc_num {
            return Err(VdmaError::OutOfDescriptors {
                requested: desc_num,
                available: state.descs.avail(),
            });
        }
        let index = (state.descs.head() + state.previous_tail) & state.descs.mask();
        buffer.write_cyclic(src, index * usize::from(self.page_size))?;

        // Latency needs the first descriptor's timestamp too
        let first_domain = if self.latency_meter.is_some() {
            InterruptsDomain::HOST
        } else {
            InterruptsDomain::NONE
        };
        if let Err(e) = self.prepare_descriptors(&mut state, src.len(), first_domain, InterruptsDomain::HOST) {
            if matches!(e, VdmaError::NotActivated) {
                tracing::info!("Transfer failed because channel {} is not activated", self.channel_id);
            } else {
                tracing::error!("Transfer failed for channel {}: {e}", self.channel_id);
            }
            return Err(e);
        }
        state.accumulated_transfers = (state.accumulated_transfers + 1) % state.transfers_per_axi_intr;
        Ok(())
    }

    /// Copy one ready frame out of the ring and re-arm its descriptors
    ///
    /// # Errors
    ///
    /// `AbortedByUser` when aborted, `OutOfDescriptors` when fewer than
    /// `dst.len()` bytes are ready.
    pub fn transfer_d2h(&self, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Err(VdmaError::invalid_argument("Transfer buffer is empty"));
        }
        self.check_direction(Direction::D2H)?;
        let mut state = self.state.lock();
        if state.aborted {
            tracing::info!("Tried to read from aborted channel {}", self.channel_id);
            return Err(VdmaError::AbortedByUser);
        }

        let buffer = state.buffer()?;
        let desc_num = buffer.desc_list().descriptors_in_buffer(dst.len()) as usize;
        let num_ready = state.descs.prog_between(state.descs.tail(), state.d2h_read_desc_index);
        if num_ready < desc_num {
            return Err(VdmaError::OutOfDescriptors {
                requested: desc_num,
                available: num_ready,
            });
        }
        buffer.read_cyclic(dst, state.d2h_read_desc_index * usize::from(self.page_size), true)?;
        state.d2h_read_desc_index = (state.d2h_read_desc_index + desc_num) & state.descs.mask();

        if state.handle.is_some() {
            let last_domain = if state.accumulated_transfers + 1 == state.transfers_per_axi_intr {
                InterruptsDomain::BOTH
            } else {
                InterruptsDomain::HOST
            };
            self.prepare_descriptors(&mut state, dst.len(), InterruptsDomain::NONE, last_domain)?;
        }
        state.accumulated_transfers = (state.accumulated_transfers + 1) % state.transfers_per_axi_intr;
        Ok(())
    }

    fn check_direction(&self, expected: Direction) -> Result<()> {
        if self.direction != expected {
            return Err(VdmaError::invalid_operation(format!(
                "Channel {} is {}, not {expected}",
                self.channel_id, self.direction
            )));
        }
        Ok(())
    }

    fn prepare_descriptors(
        &self,
        state: &mut ChannelState,
        transfer_size: usize,
        first_domain: InterruptsDomain,
        last_domain: InterruptsDomain,
    ) -> Result<()> {
        let buffer = state.buffer()?;
        let desc_num = buffer.desc_list().descriptors_in_buffer(transfer_size) as usize;
        let num_available = state.descs.head();
        if state.descs.avail() < desc_num {
            return Err(VdmaError::OutOfDescriptors {
                requested: desc_num,
                available: state.descs.avail(),
            });
        }
        if state.buffers.avail() == 0 {
            return Err(VdmaError::ResourceExhausted {
                kind: "pending transfer slot",
                requested: 1,
                available: 0,
            });
        }

        buffer.program_descriptors(transfer_size, first_domain, last_domain, num_available, true)?;

        let last_desc = (num_available + desc_num - 1) & state.descs.mask();
        let slot = state.buffers.head();
        state.pending[slot] = PendingBuffer {
            last_desc: last_desc as u16,
            latency_measure_desc: if self.direction == Direction::H2D {
                num_available as u16
            } else {
                last_desc as u16
            },
        };
        state.buffers.enqueue(1);
        self.inc_num_available(state, desc_num)
    }

    fn inc_num_available(&self, state: &mut ChannelState, count: usize) -> Result<()> {
        if state.handle.is_none() {
            return Err(VdmaError::NotActivated);
        }
        state.descs.enqueue(count);
        self.write_host_register(regs::NUM_AVAILABLE, state.descs.head() as u32)
    }

    /// Retire pending transfers whose last descriptor the hardware passed
    ///
    /// Returns the number of transfers retired.
    ///
    /// # Errors
    ///
    /// `AbortedByUser` when aborted, or the register read error.
    pub fn trigger_channel_completion(&self, hw_num_processed: u16) -> Result<usize> {
        let processed = {
            let mut state = self.state.lock();
            if state.aborted {
                return Err(VdmaError::AbortedByUser);
            }
            self.complete_transfers(&mut state, hw_num_processed)?
        };
        Ok(processed)
    }

    fn complete_transfers(&self, state: &mut ChannelState, hw_num_processed: u16) -> Result<usize> {
        let channel_error = self.read_host_register(regs::ERROR)?;
        if channel_error != 0 {
            tracing::error!("Vdma channel {} in error state {channel_error}", self.channel_id);
            return Err(VdmaError::driver("vdma channel error", channel_error as i32));
        }

        let last_num_processed = state.descs.tail() as u16;
        let num_available = state.descs.head() as u16;
        let mut tail = state.buffers.tail();
        let mut processed = 0;
        let mut last_tail = None;

        for _ in 0..state.buffers.prog() {
            let last_desc = state.pending[tail].last_desc;
            let is_complete = is_desc_between(last_num_processed, hw_num_processed, last_desc)
                || hw_num_processed == num_available;
            if !is_complete {
                break;
            }
            processed += 1;
            last_tail = Some(tail);
            tail = (tail + 1) & state.buffers.mask();
        }

        if let Some(last_tail) = last_tail {
            state.descs.set_tail(usize::from(state.pending[last_tail].last_desc) + 1);
            state.buffers.dequeue(processed);
            self.condvar().notify_all();
        }
        Ok(processed)
    }

    fn update_latency_meter(&self, state: &mut ChannelState, irqs: &ChannelInterruptTimestampList) -> u16 {
        let last_num_processed = state.last_timestamp_num_processed;
        let Some(last_irq) = irqs.last() else {
            return last_num_processed;
        };
        let Some(meter) = self.latency_meter.as_deref() else {
            return last_num_processed;
        };
        let mask = state.desc_mask();

        let mut tail = state.buffers.tail();
        for _ in 0..state.buffers.prog() {
            let latency_desc = state.pending[tail].latency_measure_desc;
            let hit = irqs
                .iter()
                .find(|irq| is_desc_between(last_num_processed, irq.desc_num_processed & mask, latency_desc));
            if let Some(irq) = hit {
                match self.direction {
                    Direction::H2D => meter.add_start_sample(irq.timestamp),
                    _ => meter.add_end_sample(&self.stream_name, irq.timestamp),
                }
            }
            tail = (tail + 1) & state.buffers.mask();
        }

        state.last_timestamp_num_processed = last_irq.desc_num_processed & mask;
        state.last_timestamp_num_processed
    }

    fn wait_for_condition<F>(&self, condition: F, timeout: Duration) -> Result<()>
    where
        F: Fn(&ChannelState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return Err(VdmaError::AbortedByUser);
            }
            if condition(&*state) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(VdmaError::timeout(timeout));
            }
            if state.waiting_for_interrupts {
                let _ = self.condvar().wait_until(&mut state, deadline);
                continue;
            }
            let Some(handle) = state.handle else {
                return Err(VdmaError::NotActivated);
            };

            state.waiting_for_interrupts = true;
            let irqs = MutexGuard::unlocked(&mut state, || {
                self.driver
                    .wait_channel_interrupts(self.channel_id, handle, deadline - now)
            });
            state.waiting_for_interrupts = false;
            self.condvar().notify_all();

            let irqs = match irqs {
                Ok(irqs) => irqs,
                Err(e) if e.is_timeout() => continue,
                Err(e) => {
                    if e.is_aborted() {
                        tracing::info!("Wait on channel {} was aborted", self.channel_id);
                    }
                    return Err(e);
                }
            };
            let hw_num_processed = if self.latency_meter.is_some() {
                self.update_latency_meter(&mut state, &irqs)
            } else {
                self.read_host_register(regs::NUM_PROCESSED)? as u16 & state.desc_mask()
            };
            if state.aborted {
                return Err(VdmaError::AbortedByUser);
            }
            self.complete_transfers(&mut state, hw_num_processed)?;
        }
    }

    /// Wait for the ring to drain; D2H channels return immediately
    ///
    /// # Errors
    ///
    /// `Timeout`, `AbortedByUser` or `NotActivated`.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        if self.direction == Direction::D2H {
            return Ok(());
        }
        self.state.lock().buffer()?;
        self.wait_for_condition(|state| state.buffers.head() == state.buffers.tail(), timeout)
    }

    /// Wake every thread parked on the channel
    pub fn notify_all(&self) {
        // Taking the lock orders the wakeup after any state change
        drop(self.state.lock());
        self.can_write.notify_all();
        self.can_read.notify_all();
    }

    /// Frames per firmware interrupt
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for zero.
    pub fn set_transfers_per_axi_intr(&self, transfers_per_axi_intr: u16) -> Result<()> {
        if transfers_per_axi_intr == 0 {
            return Err(VdmaError::invalid_argument("Invalid transfers per axi interrupt"));
        }
        self.state.lock().transfers_per_axi_intr = transfers_per_axi_intr;
        Ok(())
    }

    /// Frames written but not yet retired (H2D)
    pub fn h2d_pending_frames(&self) -> usize {
        self.state.lock().buffers.prog()
    }

    /// Descriptors processed but not yet read (D2H)
    pub fn d2h_pending_descs(&self) -> usize {
        let state = self.state.lock();
        state.descs.prog_between(state.descs.tail(), state.d2h_read_desc_index)
    }

    /// Block for the next interrupt and return the raw `NUM_PROCESSED`
    ///
    /// Used for channels whose descriptors firmware drives, where no
    /// pending ring is kept.
    ///
    /// # Errors
    ///
    /// `Timeout`, `AbortedByUser`, `NotActivated`.
    pub fn wait_for_interrupts(&self, timeout: Duration) -> Result<u16> {
        let handle = self.state.lock().handle.ok_or(VdmaError::NotActivated)?;
        self.driver
            .wait_channel_interrupts(self.channel_id, handle, timeout)?;
        self.hw_num_processed()
    }

    /// Raw `NUM_PROCESSED` register
    ///
    /// # Errors
    ///
    /// Returns the register read error.
    pub fn hw_num_processed(&self) -> Result<u16> {
        Ok(self.read_host_register(regs::NUM_PROCESSED)? as u16)
    }

    /// Write the `NUM_AVAILABLE` register directly
    ///
    /// # Errors
    ///
    /// `NotActivated` if the channel is disabled, or the register error.
    pub fn set_num_available(&self, value: u16) -> Result<()> {
        if self.state.lock().handle.is_none() {
            tracing::error!("Can't set num available when channel {} is not activated", self.channel_id);
            return Err(VdmaError::NotActivated);
        }
        self.write_host_register(regs::NUM_AVAILABLE, u32::from(value))
    }

    /// Bytes needed to buffer `transfers_count` transfers
    pub fn calculate_buffer_size(
        driver: &dyn Driver,
        transfer_size: u32,
        transfers_count: u32,
        requested_page_size: u16,
    ) -> u32 {
        let page_size = driver.calc_desc_page_size(requested_page_size);
        let descs_per_transfer = descriptor::descriptors_in_buffer(transfer_size as usize, page_size);
        let descs_count = descs_per_transfer
            .saturating_mul(transfers_count)
            .clamp(MIN_DESCS_COUNT, MAX_DESCS_COUNT);
        descs_count * u32::from(page_size)
    }

    fn condvar(&self) -> &Condvar {
        match self.direction {
            Direction::H2D => &self.can_write,
            _ => &self.can_read,
        }
    }

    fn read_host_register(&self, offset: usize) -> Result<u32> {
        self.driver
            .read_vdma_channel_register(self.channel_id, self.direction, offset, regs::width(offset))
    }

    fn write_host_register(&self, offset: usize, value: u32) -> Result<()> {
        self.driver.write_vdma_channel_register(
            self.channel_id,
            self.direction,
            offset,
            regs::width(offset),
            value,
        )
    }
}

impl Drop for VdmaChannel {
    fn drop(&mut self) {
        if self.state.get_mut().handle.is_some() {
            if let Err(e) = self.stop_channel() {
                tracing::error!("Failed to stop channel {} on drop: {e}", self.channel_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::SoftwareDriver;

    fn driver() -> Arc<dyn Driver> {
        Arc::new(SoftwareDriver::new())
    }

    fn channel(driver: &Arc<dyn Driver>, index: u8) -> VdmaChannel {
        let id = ChannelId::checked(0, index).unwrap();
        let direction = id.direction().unwrap();
        VdmaChannel::create(id, direction, driver, 512, format!("stream{index}"), None, 1).unwrap()
    }

    #[test]
    fn test_create_rejects_bad_arguments() {
        let drv = driver();
        let id = ChannelId::checked(0, 0).unwrap();
        assert!(VdmaChannel::create(id, Direction::Both, &drv, 512, "s", None, 1).is_err());
        assert!(VdmaChannel::create(id, Direction::H2D, &drv, 512, "s", None, 0).is_err());
        let other_engine = ChannelId {
            engine_index: 3,
            channel_index: 0,
        };
        assert!(VdmaChannel::create(other_engine, Direction::H2D, &drv, 512, "s", None, 1).is_err());
    }

    #[test]
    fn test_enable_twice_is_invalid() {
        let drv = driver();
        let ch = channel(&drv, 0);
        ch.enable(false).unwrap();
        assert!(matches!(ch.enable(false), Err(VdmaError::InvalidOperation { .. })));
        ch.disable().unwrap();
        assert!(!ch.is_enabled());
        ch.enable(false).unwrap();
    }

    #[test]
    fn test_allocate_twice_is_invalid() {
        let drv = driver();
        let ch = channel(&drv, 0);
        ch.allocate_resources(16).unwrap();
        assert_eq!(ch.buffer_size().unwrap(), 16 * 512);
        assert!(ch.allocate_resources(16).is_err());
    }

    #[test]
    fn test_transfer_requires_activation() {
        let drv = driver();
        let ch = channel(&drv, 0);
        ch.allocate_resources(16).unwrap();
        assert!(matches!(ch.transfer_h2d(&[1; 512]), Err(VdmaError::NotActivated)));
    }

    #[test]
    fn test_d2h_activation_preprograms_frames() {
        let drv = driver();
        let ch = channel(&drv, 16);
        ch.allocate_resources(16).unwrap();
        ch.enable(false).unwrap();
        ch.complete_channel_activation(1024).unwrap();
        // (16 - 1) / 2 frames of 2 descriptors are in flight
        assert_eq!(ch.h2d_pending_frames(), 7);
        assert_eq!(ch.d2h_pending_descs(), 0);
        assert!(ch.wait(1024, Duration::from_millis(20)).unwrap_err().is_timeout());
    }

    #[test]
    fn test_abort_unblocks_and_clear_abort_restores() {
        let drv = driver();
        let ch = Arc::new(channel(&drv, 16));
        ch.allocate_resources(16).unwrap();
        ch.enable(false).unwrap();
        ch.complete_channel_activation(512).unwrap();

        let waiter = {
            let ch = Arc::clone(&ch);
            std::thread::spawn(move || ch.wait(512, Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(50));
        ch.abort().unwrap();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(VdmaError::AbortedByUser)));

        ch.clear_abort().unwrap();
        assert!(!ch.is_aborted());
        assert!(ch.wait(512, Duration::from_millis(10)).unwrap_err().is_timeout());
    }

    #[test]
    fn test_calculate_buffer_size_clamps() {
        let drv = driver();
        assert_eq!(VdmaChannel::calculate_buffer_size(drv.as_ref(), 100, 1, 512), 2 * 512);
        assert_eq!(
            VdmaChannel::calculate_buffer_size(drv.as_ref(), u32::MAX, 4, 4096),
            MAX_DESCS_COUNT * 4096
        );
    }
}
