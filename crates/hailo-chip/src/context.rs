//! Context kinds of a network group's firmware program.
//!
//! Firmware executes contexts in a fixed order:
//!
//! ```text
//! preliminary -> dynamic[0] .. dynamic[N-1] -> batch-switching -> activation
//! ```

/// Contexts per network group, all kinds included.
pub const MAX_CONTEXTS_PER_NETWORK_GROUP: usize = 255;

/// Contexts that are not dynamic: preliminary, batch-switching, activation.
pub const NUMBER_OF_NON_DYNAMIC_CONTEXTS: usize = 3;

/// Kind of a context record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// Runs once before the first dynamic context.
    Preliminary,
    /// One of the N dynamic contexts.
    Dynamic,
    /// Runs when the batch size changes.
    BatchSwitching,
    /// Runs when the network group is activated.
    Activation,
}

impl ContextKind {
    /// Position of this kind in the firmware execution order.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Preliminary => 0,
            Self::Dynamic => 1,
            Self::BatchSwitching => 2,
            Self::Activation => 3,
        }
    }

    /// Wire value used by control messages.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Activation => 0,
            Self::BatchSwitching => 1,
            Self::Preliminary => 2,
            Self::Dynamic => 3,
        }
    }

    /// Inverse of [`ContextKind::as_u8`].
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Activation),
            1 => Some(Self::BatchSwitching),
            2 => Some(Self::Preliminary),
            3 => Some(Self::Dynamic),
            _ => None,
        }
    }

    /// Only dynamic contexts may appear more than once.
    #[must_use]
    pub const fn is_repeatable(self) -> bool {
        matches!(self, Self::Dynamic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_order() {
        assert!(ContextKind::Preliminary.rank() < ContextKind::Dynamic.rank());
        assert!(ContextKind::Dynamic.rank() < ContextKind::BatchSwitching.rank());
        assert!(ContextKind::BatchSwitching.rank() < ContextKind::Activation.rank());
    }

    #[test]
    fn test_wire_values() {
        for kind in [
            ContextKind::Preliminary,
            ContextKind::Dynamic,
            ContextKind::BatchSwitching,
            ContextKind::Activation,
        ] {
            assert_eq!(ContextKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(ContextKind::from_u8(9), None);
    }
}
