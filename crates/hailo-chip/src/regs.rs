//! Per-channel vDMA register block.
//!
//! Each channel has a host-side and a device-side register block; which one
//! the host touches for a given channel is selected by the direction passed
//! to the register ioctls. Offsets are relative to the block.
//!
//! ```text
//! 0x00  u8   CONTROL        start / pause / abort bits
//! 0x01  u8   DEPTH          log2 of the bound descriptor list
//! 0x02  u16  NUM_AVAILABLE  producer index (host writes)
//! 0x04  u16  NUM_PROCESSED  consumer index (device writes)
//! 0x06  u16  NUM_ONGOING    descriptors currently in flight
//! 0x08  u8   ERROR          last error code, 0 when healthy
//! ```

/// Control register.
pub const CONTROL: usize = 0x00;
/// Descriptor list depth register.
pub const DEPTH: usize = 0x01;
/// Number of descriptors made available to the channel.
pub const NUM_AVAILABLE: usize = 0x02;
/// Number of descriptors the channel has processed.
pub const NUM_PROCESSED: usize = 0x04;
/// Number of descriptors in flight.
pub const NUM_ONGOING: usize = 0x06;
/// Error register.
pub const ERROR: usize = 0x08;

/// Width in bytes of each register above.
#[must_use]
pub const fn width(offset: usize) -> usize {
    match offset {
        NUM_AVAILABLE | NUM_PROCESSED | NUM_ONGOING => 2,
        _ => 1,
    }
}

/// Control register bits.
pub mod control {
    /// Channel is running.
    pub const START: u32 = 1 << 0;
    /// Channel is paused.
    pub const PAUSE: u32 = 1 << 1;
    /// Channel was aborted and has not been cleared.
    pub const ABORT: u32 = 1 << 2;
}

/// `NUM_PROCESSED` wraps at 16 bits; only the low bits covered by the
/// descriptor ring are meaningful.
#[must_use]
pub const fn num_processed_mask(depth: u8) -> u16 {
    if depth >= 16 {
        u16::MAX
    } else {
        (1u16 << depth) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widths() {
        assert_eq!(width(CONTROL), 1);
        assert_eq!(width(NUM_AVAILABLE), 2);
        assert_eq!(width(NUM_PROCESSED), 2);
        assert_eq!(width(ERROR), 1);
    }

    #[test]
    fn test_num_processed_mask() {
        assert_eq!(num_processed_mask(4), 0xF);
        assert_eq!(num_processed_mask(16), 0xFFFF);
    }
}
