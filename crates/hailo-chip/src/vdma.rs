//! vDMA channel partition.
//!
//! Every DMA engine exposes 32 channels. The lower half carries
//! host-to-device traffic, the upper half device-to-host:
//!
//! ```text
//! channel index   0 ............ 15 | 16 ............ 31
//! direction       H2D                | D2H
//! ```

use core::fmt;

/// Channels per DMA engine.
pub const CHANNELS_PER_ENGINE: u8 = 32;

/// First H2D channel index.
pub const MIN_H2D_CHANNEL_INDEX: u8 = 0;
/// Last H2D channel index.
pub const MAX_H2D_CHANNEL_INDEX: u8 = 15;
/// First D2H channel index.
pub const MIN_D2H_CHANNEL_INDEX: u8 = 16;
/// Last D2H channel index.
pub const MAX_D2H_CHANNEL_INDEX: u8 = 31;

/// Default number of DMA engines when the device does not report one.
pub const DEFAULT_ENGINES_COUNT: u8 = 1;

/// Slots in a channel's pending-transfer ring. Must be a power of two.
pub const PENDING_BUFFERS_SIZE: usize = 128;

/// Maximum interrupt timestamps returned by one interrupt wait.
pub const MAX_IRQ_TIMESTAMPS_SIZE: usize = 256;

/// Channel index passed to the driver for bindings not tied to a channel.
pub const INVALID_CHANNEL_INDEX: u8 = 0xFF;

/// Direction of a vDMA channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to device.
    H2D,
    /// Device to host.
    D2H,
    /// Both directions (buffer mappings only, never a channel).
    Both,
}

impl Direction {
    /// Inclusive channel index range for this direction, `None` for `Both`.
    #[must_use]
    pub const fn channel_range(self) -> Option<(u8, u8)> {
        match self {
            Self::H2D => Some((MIN_H2D_CHANNEL_INDEX, MAX_H2D_CHANNEL_INDEX)),
            Self::D2H => Some((MIN_D2H_CHANNEL_INDEX, MAX_D2H_CHANNEL_INDEX)),
            Self::Both => None,
        }
    }

    /// Direction whose sub-range contains `channel_index`.
    #[must_use]
    pub const fn of_channel_index(channel_index: u8) -> Option<Self> {
        if channel_index <= MAX_H2D_CHANNEL_INDEX {
            Some(Self::H2D)
        } else if channel_index <= MAX_D2H_CHANNEL_INDEX {
            Some(Self::D2H)
        } else {
            None
        }
    }

    /// The opposite side of a channel (`Both` maps to itself).
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::H2D => Self::D2H,
            Self::D2H => Self::H2D,
            Self::Both => Self::Both,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H2D => write!(f, "H2D"),
            Self::D2H => write!(f, "D2H"),
            Self::Both => write!(f, "BOTH"),
        }
    }
}

/// Identity of one hardware channel: `(engine_index, channel_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId {
    /// DMA engine index.
    pub engine_index: u8,
    /// Channel index within the engine, `0..32`.
    pub channel_index: u8,
}

impl ChannelId {
    /// Build a channel id, rejecting indices outside the engine.
    #[must_use]
    pub const fn checked(engine_index: u8, channel_index: u8) -> Option<Self> {
        if channel_index < CHANNELS_PER_ENGINE {
            Some(Self {
                engine_index,
                channel_index,
            })
        } else {
            None
        }
    }

    /// Direction implied by the channel index.
    #[must_use]
    pub const fn direction(self) -> Option<Direction> {
        Direction::of_channel_index(self.channel_index)
    }

    /// Pack into the one-byte form used by firmware actions
    /// (engine in bits 5..8, channel in bits 0..5).
    #[must_use]
    pub const fn pack(self) -> u8 {
        (self.engine_index << 5) | (self.channel_index & 0x1F)
    }

    /// Inverse of [`ChannelId::pack`].
    #[must_use]
    pub const fn unpack(packed: u8) -> Self {
        Self {
            engine_index: packed >> 5,
            channel_index: packed & 0x1F,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.engine_index, self.channel_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition() {
        assert_eq!(Direction::of_channel_index(0), Some(Direction::H2D));
        assert_eq!(Direction::of_channel_index(15), Some(Direction::H2D));
        assert_eq!(Direction::of_channel_index(16), Some(Direction::D2H));
        assert_eq!(Direction::of_channel_index(31), Some(Direction::D2H));
        assert_eq!(Direction::of_channel_index(32), None);
    }

    #[test]
    fn test_checked_rejects_out_of_engine() {
        assert!(ChannelId::checked(0, 31).is_some());
        assert!(ChannelId::checked(0, 32).is_none());
    }

    #[test]
    fn test_pack() {
        let id = ChannelId::checked(2, 17).unwrap();
        assert_eq!(id.pack(), 0x51);
        assert_eq!(ChannelId::unpack(0x51), id);
        assert_eq!(id.to_string(), "2:17");
    }

    #[test]
    fn test_pending_ring_wraps() {
        assert!(PENDING_BUFFERS_SIZE.is_power_of_two());
        assert_eq!((127 + 1) & (PENDING_BUFFERS_SIZE - 1), 0);
    }
}
