//! Power-of-two ring counters
//!
//! `head` is where the producer writes next, `tail` where the consumer reads
//! next. One slot is always kept free so a full ring differs from an empty one.

/// Head/tail counters over a ring of `size` slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircularCounters {
    head: usize,
    tail: usize,
    size: usize,
}

impl CircularCounters {
    /// Counters for a ring of `size` slots; `size` must be a power of two
    pub const fn new(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        Self {
            head: 0,
            tail: 0,
            size,
        }
    }

    /// Reset both counters to zero
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Slots in the ring
    pub const fn size(&self) -> usize {
        self.size
    }

    /// `size - 1`
    pub const fn mask(&self) -> usize {
        self.size - 1
    }

    /// Producer position
    pub const fn head(&self) -> usize {
        self.head
    }

    /// Consumer position
    pub const fn tail(&self) -> usize {
        self.tail
    }

    /// Free slots between `head` and `tail`
    pub const fn avail_between(&self, head: usize, tail: usize) -> usize {
        (self.size - 1 + tail).wrapping_sub(head) & self.mask()
    }

    /// Occupied slots from `tail` up to `head`
    pub const fn prog_between(&self, head: usize, tail: usize) -> usize {
        (self.size + head).wrapping_sub(tail) & self.mask()
    }

    /// Free slots
    pub const fn avail(&self) -> usize {
        self.avail_between(self.head, self.tail)
    }

    /// Occupied slots
    pub const fn prog(&self) -> usize {
        self.prog_between(self.head, self.tail)
    }

    /// Advance `head` by `count`
    pub fn enqueue(&mut self, count: usize) {
        self.head = (self.head + count) & self.mask();
    }

    /// Advance `tail` by `count`
    pub fn dequeue(&mut self, count: usize) {
        self.tail = (self.tail + count) & self.mask();
    }

    /// Move `tail` to an absolute position
    pub fn set_tail(&mut self, tail: usize) {
        self.tail = tail & self.mask();
    }
}

/// Whether `desc` lies in `[begin, end)` on a ring; empty when `begin == end`
pub const fn is_desc_between(begin: u16, end: u16, desc: u16) -> bool {
    if begin == end {
        false
    } else if begin < end {
        begin <= desc && desc < end
    } else {
        desc < end || begin <= desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hailo_chip::vdma::PENDING_BUFFERS_SIZE;

    #[test]
    fn test_pending_ring_wraps_to_zero() {
        let mut ring = CircularCounters::new(PENDING_BUFFERS_SIZE);
        ring.enqueue(PENDING_BUFFERS_SIZE - 1);
        assert_eq!(ring.head(), 127);
        assert_eq!(ring.avail(), 0);
        ring.dequeue(1);
        ring.enqueue(1);
        assert_eq!(ring.head(), 0);
        assert_eq!(ring.prog(), 127);
    }

    #[test]
    fn test_avail_and_prog_complement() {
        let mut ring = CircularCounters::new(16);
        ring.enqueue(5);
        ring.dequeue(2);
        assert_eq!(ring.prog(), 3);
        assert_eq!(ring.avail(), 12);
        assert_eq!(ring.prog() + ring.avail(), ring.size() - 1);
    }

    #[test]
    fn test_desc_between() {
        assert!(!is_desc_between(3, 3, 3));
        assert!(is_desc_between(2, 5, 4));
        assert!(!is_desc_between(2, 5, 5));
        // wrapped range [14, 2)
        assert!(is_desc_between(14, 2, 15));
        assert!(is_desc_between(14, 2, 1));
        assert!(!is_desc_between(14, 2, 2));
    }
}
