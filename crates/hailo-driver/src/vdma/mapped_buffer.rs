//! Pinned host buffers mapped for vDMA
//!
//! Page-aligned, zeroed, `mlock`ed allocation handed to the driver with
//! [`Driver::vdma_buffer_map`]. Every copy in or out is followed (H2D) or
//! preceded (D2H) by a cache sync over exactly the bytes touched.

use crate::driver::{BufferHandle, Driver};
use crate::error::{Result, VdmaError};
use hailo_chip::vdma::Direction;
use rustix::mm::{mlock, munlock};
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

const PAGE_ALIGN: usize = 4096;

/// Host buffer the device can DMA to or from
pub struct MappedBuffer {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
    locked: bool,
    direction: Direction,
    handle: BufferHandle,
    driver: Arc<dyn Driver>,
}

impl std::fmt::Debug for MappedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("direction", &self.direction)
            .field("handle", &self.handle)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

// SAFETY: Send - the allocation is owned exclusively by this value; the device mapping is
// process-wide and does not depend on the creating thread.
unsafe impl Send for MappedBuffer {}

// SAFETY: Sync - `read`/`write` copy through raw pointers into bounds-checked ranges; the
// channel that owns the buffer serializes access to overlapping ranges under its lock.
unsafe impl Sync for MappedBuffer {}

impl MappedBuffer {
    /// Allocate `size` bytes and map them for `direction`
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero size, `Io` if allocation fails,
    /// or the driver error if mapping fails.
    pub fn create(driver: &Arc<dyn Driver>, size: usize, direction: Direction) -> Result<Self> {
        if size == 0 {
            return Err(VdmaError::invalid_argument("Mapped buffer size must be positive"));
        }
        let layout = Layout::from_size_align(size.next_multiple_of(PAGE_ALIGN), PAGE_ALIGN)
            .map_err(|e| VdmaError::invalid_argument(format!("Invalid DMA buffer layout: {e}")))?;

        // SAFETY: Raw alloc_zeroed necessary for page-aligned DMA buffer. Invariants:
        // (1) layout from from_size_align, size > 0, align 4096 power-of-two; (2) returns valid
        // ptr for layout.size() bytes or null on OOM; (3) dealloc in Drop with same layout.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            VdmaError::Io {
                source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
            }
        })?;

        // SAFETY: mlock keeps the pages resident while the device owns them.
        // Invariants: (1) ptr from alloc_zeroed, valid for layout.size() bytes;
        // (2) region [ptr, ptr+len) entirely within the allocation.
        let locked = match unsafe { mlock(ptr.as_ptr().cast(), layout.size()) } {
            Ok(()) => true,
            Err(e) => {
                // The driver pins the pages on map; mlock only saves page faults.
                tracing::warn!("mlock of {} bytes failed ({e}), continuing unlocked", layout.size());
                false
            }
        };

        // SAFETY: the allocation is valid for `size` bytes and is only freed in Drop, after
        // vdma_buffer_unmap.
        let handle = match unsafe { driver.vdma_buffer_map(ptr, size, direction) } {
            Ok(handle) => handle,
            Err(e) => {
                if locked {
                    // SAFETY: same range that was locked above.
                    let _ = unsafe { munlock(ptr.as_ptr().cast(), layout.size()) };
                }
                // SAFETY: ptr allocated above with layout; cleanup on error path before return.
                unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
                return Err(e);
            }
        };

        tracing::debug!("Mapped {size} byte {direction} buffer, handle {:#x}", handle.raw());

        Ok(Self {
            ptr,
            size,
            layout,
            locked,
            direction,
            handle,
            driver: Arc::clone(driver),
        })
    }

    /// Buffer size in bytes
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Driver handle
    pub const fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Data direction the buffer was mapped for
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Copy `src` into the buffer at `offset`, then sync for the device
    ///
    /// # Errors
    ///
    /// Returns `InsufficientBuffer` when `offset + src.len()` exceeds the
    /// buffer, or the driver error if the sync fails.
    pub fn write(&self, src: &[u8], offset: usize) -> Result<()> {
        self.check_range(src.len(), offset)?;
        if src.is_empty() {
            return Ok(());
        }
        // SAFETY: Copy into our allocation. Invariants: (1) offset + len <= size checked above;
        // (2) src is a distinct Rust slice, so the ranges cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
        self.driver
            .vdma_buffer_sync(self.handle, Direction::H2D, offset, src.len())
            .inspect_err(|e| tracing::error!("Failed syncing vdma buffer on write: {e}"))
    }

    /// Sync for the host, then copy `dst.len()` bytes from `offset`
    ///
    /// # Errors
    ///
    /// Returns `InsufficientBuffer` when `offset + dst.len()` exceeds the
    /// buffer, or the driver error if the sync fails.
    pub fn read(&self, dst: &mut [u8], offset: usize, should_sync: bool) -> Result<()> {
        self.check_range(dst.len(), offset)?;
        if dst.is_empty() {
            return Ok(());
        }
        if should_sync {
            self.driver
                .vdma_buffer_sync(self.handle, Direction::D2H, offset, dst.len())
                .inspect_err(|e| tracing::error!("Failed syncing vdma buffer on read: {e}"))?;
        }
        // SAFETY: Copy out of our allocation. Invariants: (1) offset + len <= size checked
        // above; (2) dst is a distinct &mut slice.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// [`write`](Self::write) that wraps to offset 0 at the end of the buffer
    ///
    /// # Errors
    ///
    /// Returns `InsufficientBuffer` if `src` is larger than the buffer.
    pub fn write_cyclic(&self, src: &[u8], offset: usize) -> Result<()> {
        let split = self.cyclic_split(src.len(), offset)?;
        let (head, tail) = src.split_at(split);
        self.write(head, offset)?;
        if !tail.is_empty() {
            self.write(tail, 0)?;
        }
        Ok(())
    }

    /// [`read`](Self::read) that wraps to offset 0 at the end of the buffer
    ///
    /// # Errors
    ///
    /// Returns `InsufficientBuffer` if `dst` is larger than the buffer.
    pub fn read_cyclic(&self, dst: &mut [u8], offset: usize, should_sync: bool) -> Result<()> {
        let split = self.cyclic_split(dst.len(), offset)?;
        let (head, tail) = dst.split_at_mut(split);
        self.read(head, offset, should_sync)?;
        if !tail.is_empty() {
            self.read(tail, 0, should_sync)?;
        }
        Ok(())
    }

    fn cyclic_split(&self, count: usize, offset: usize) -> Result<usize> {
        if count > self.size {
            tracing::error!("Requested size ({count}) is more than the MappedBuffer size {}", self.size);
            return Err(VdmaError::InsufficientBuffer {
                requested: count,
                available: self.size,
            });
        }
        let size_to_end = self.size.saturating_sub(offset);
        Ok(size_to_end.min(count))
    }

    fn check_range(&self, count: usize, offset: usize) -> Result<()> {
        if count.saturating_add(offset) > self.size {
            tracing::error!(
                "Requested size {count} from offset {offset} is more than the MappedBuffer size {}",
                self.size
            );
            return Err(VdmaError::InsufficientBuffer {
                requested: count.saturating_add(offset),
                available: self.size,
            });
        }
        Ok(())
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        // The device must lose access before the memory goes away.
        if let Err(e) = self.driver.vdma_buffer_unmap(self.handle) {
            tracing::error!("Failed to unmap vdma buffer {:#x}: {e}", self.handle.raw());
        }

        if self.locked {
            // SAFETY: munlock necessary - the range was mlock'd in create().
            let _ = unsafe { munlock(self.ptr.as_ptr().cast(), self.layout.size()) };
        }

        // SAFETY: dealloc must match alloc_zeroed in create(). Invariants: (1) ptr from that
        // allocation; (2) layout is the same; (3) driver mapping already released; (4) no refs.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::SoftwareDriver;

    fn buffer(size: usize) -> MappedBuffer {
        let driver: Arc<dyn Driver> = Arc::new(SoftwareDriver::new());
        MappedBuffer::create(&driver, size, Direction::H2D).unwrap()
    }

    #[test]
    fn test_write_read() {
        let buf = buffer(1024);
        buf.write(&[1, 2, 3, 4], 100).unwrap();
        let mut out = [0u8; 4];
        buf.read(&mut out, 100, true).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_out_of_range() {
        let buf = buffer(64);
        assert!(matches!(
            buf.write(&[0; 8], 60),
            Err(VdmaError::InsufficientBuffer { requested: 68, available: 64 })
        ));
        let mut out = [0u8; 65];
        assert!(buf.read(&mut out, 0, false).is_err());
    }

    #[test]
    fn test_cyclic_wraps_at_end() {
        let buf = buffer(16);
        let data: Vec<u8> = (0..10).collect();
        buf.write_cyclic(&data, 12).unwrap();

        let mut head = [0u8; 4];
        buf.read(&mut head, 12, false).unwrap();
        assert_eq!(head, [0, 1, 2, 3]);
        let mut tail = [0u8; 6];
        buf.read(&mut tail, 0, false).unwrap();
        assert_eq!(tail, [4, 5, 6, 7, 8, 9]);

        let mut round = vec![0u8; 10];
        buf.read_cyclic(&mut round, 12, true).unwrap();
        assert_eq!(round, data);
    }

    #[test]
    fn test_cyclic_larger_than_buffer() {
        let buf = buffer(16);
        assert!(buf.write_cyclic(&[0; 17], 0).is_err());
    }
}
