//! Firmware action-list record table.
//!
//! A context's program is a byte stream of records:
//!
//! ```text
//! header   timestamp u32 LE | action_type u8
//! payload  fixed size, keyed by action_type (may be empty)
//! ```
//!
//! `RepeatedAction` is special: its payload `{sub_action_type u8, count u8,
//! reserved u8}` is followed by exactly `count` payloads of the sub type
//! without headers.
//!
//! All multi-byte payload fields are little-endian. Channel ids are packed
//! into one byte (engine `[7:5]`, channel `[4:0]`), LCU ids likewise
//! (cluster `[7:4]`, lcu `[3:0]`).

/// Size of the common record header.
pub const ACTION_HEADER_SIZE: usize = 5;

/// Size of the `RepeatedAction` payload.
pub const REPEATED_ACTION_PAYLOAD_SIZE: usize = 3;

/// Serialized size of a host buffer descriptor inside an action:
/// `buffer_type u8 | dma_address u64 | desc_page_size u16 |
/// total_desc_count u32 | bytes_in_pattern u32`.
pub const HOST_BUFFER_INFO_SIZE: usize = 19;

/// Serialized size of edge-layer activation payloads:
/// `channel u8 | stream_index u8 | network_index u8 | host buffer |
/// credit u32`.
pub const EDGE_ACTIVATION_PAYLOAD_SIZE: usize = 3 + HOST_BUFFER_INFO_SIZE + 4;

/// Largest action list the firmware reports for one context.
pub const MAX_ACTION_LIST_SIZE: usize = u16::MAX as usize;

/// Host buffer kinds referenced by actions.
pub mod host_buffer_type {
    /// Scatter-gather buffer described by a descriptor list.
    pub const EXTERNAL_DESC: u8 = 0;
    /// Physically contiguous buffer.
    pub const CCB: u8 = 1;
}

macro_rules! action_types {
    ($( $(#[$doc:meta])* $name:ident = $value:literal => $size:expr, )*) => {
        /// Action record type.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum ActionType {
            $( $(#[$doc])* $name = $value, )*
        }

        impl ActionType {
            /// Every action type, in discriminant order.
            pub const ALL: &'static [Self] = &[$( Self::$name, )*];

            /// Decode a wire value; `None` for values outside the table.
            #[must_use]
            pub const fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $( $value => Some(Self::$name), )*
                    _ => None,
                }
            }

            /// Fixed payload size following the record header.
            #[must_use]
            pub const fn payload_size(self) -> usize {
                match self {
                    $( Self::$name => $size, )*
                }
            }

            /// Stable name used in logs.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $( Self::$name => stringify!($name), )*
                }
            }
        }
    };
}

action_types! {
    /// Header of a run of same-typed sub-actions.
    RepeatedAction = 0 => REPEATED_ACTION_PAYLOAD_SIZE,
    /// Wait for an LCU interrupt.
    LcuInterrupt = 1 => 2,
    /// Wait for a sequencer-done interrupt.
    SequencerDoneInterrupt = 2 => 1,
    /// Wait for an input channel transfer-done interrupt.
    InputChannelTransferDoneInterrupt = 3 => 1,
    /// Wait for an output channel transfer-done interrupt.
    OutputChannelTransferDoneInterrupt = 4 => 1,
    /// Wait for a module-config-done interrupt.
    ModuleConfigDoneInterrupt = 5 => 1,
    /// Wait for the application-change interrupt.
    ApplicationChangeInterrupt = 6 => 0,
    /// Fetch descriptors of a cfg channel.
    FetchCfgChannelDescriptors = 7 => 3,
    /// Fetch CCW bursts from a config stream.
    FetchCcwBursts = 8 => 3,
    /// Trigger a cluster sequencer.
    TriggerSequencer = 9 => 44,
    /// Wait until a vDMA channel is idle.
    WaitForDmaIdle = 10 => 2,
    /// Wait for an NMS unit.
    WaitForNms = 11 => 2,
    /// Fetch data from a vDMA channel.
    FetchDataFromVdmaChannel = 12 => 2,
    /// Deactivate a vDMA channel.
    DeactivateVdmaChannel = 13 => 1,
    /// Validate a vDMA channel at the end of a context.
    ValidateVdmaChannel = 14 => 1,
    /// Enable an LCU with default kernel-done settings.
    EnableLcuDefault = 15 => 2,
    /// Enable an LCU with explicit kernel-done settings.
    EnableLcuNonDefault = 16 => 8,
    /// Disable an LCU.
    DisableLcu = 17 => 2,
    /// Activate a boundary input channel.
    ActivateBoundaryInput = 18 => EDGE_ACTIVATION_PAYLOAD_SIZE,
    /// Activate a boundary output channel.
    ActivateBoundaryOutput = 19 => EDGE_ACTIVATION_PAYLOAD_SIZE,
    /// Activate an inter-context input channel.
    ActivateInterContextInput = 20 => EDGE_ACTIVATION_PAYLOAD_SIZE,
    /// Activate an inter-context output channel.
    ActivateInterContextOutput = 21 => EDGE_ACTIVATION_PAYLOAD_SIZE,
    /// Activate the H2D side of a DDR buffer.
    ActivateDdrBufferInput = 22 => EDGE_ACTIVATION_PAYLOAD_SIZE,
    /// Activate the D2H side of a DDR buffer.
    ActivateDdrBufferOutput = 23 => EDGE_ACTIVATION_PAYLOAD_SIZE,
    /// Remap a vDMA channel to a stream.
    ChangeVdmaToStreamMapping = 24 => 3,
    /// Describe a DDR channel pair.
    AddDdrPairInfo = 25 => 8,
    /// Start the DDR buffering task.
    DdrBufferingStart = 26 => 0,
    /// Start the burst-credits task.
    BurstCreditsTaskStart = 27 => 0,
    /// Activate a cfg channel.
    ActivateCfgChannel = 28 => 2 + HOST_BUFFER_INFO_SIZE,
    /// Deactivate a cfg channel.
    DeactivateCfgChannel = 29 => 2,
    /// Reset the DDR buffering task.
    DdrBufferingReset = 30 => 0,
    /// Open a boundary input channel.
    OpenBoundaryInputChannel = 31 => 1 + HOST_BUFFER_INFO_SIZE,
    /// Open a boundary output channel.
    OpenBoundaryOutputChannel = 32 => 1 + HOST_BUFFER_INFO_SIZE,
    /// Enable an NMS unit.
    EnableNms = 33 => 2,
}

impl ActionType {
    /// Wire value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl core::fmt::Display for ActionType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_dense() {
        for (index, ty) in ActionType::ALL.iter().enumerate() {
            assert_eq!(usize::from(ty.as_u8()), index);
            assert_eq!(ActionType::from_u8(ty.as_u8()), Some(*ty));
        }
        assert_eq!(ActionType::from_u8(ActionType::ALL.len() as u8), None);
    }

    #[test]
    fn test_zero_payload_types() {
        let empty: Vec<_> = ActionType::ALL
            .iter()
            .filter(|t| t.payload_size() == 0)
            .map(|t| t.name())
            .collect();
        assert_eq!(
            empty,
            [
                "ApplicationChangeInterrupt",
                "DdrBufferingStart",
                "BurstCreditsTaskStart",
                "DdrBufferingReset"
            ]
        );
    }

    #[test]
    fn test_edge_activation_size() {
        assert_eq!(EDGE_ACTIVATION_PAYLOAD_SIZE, 26);
        assert_eq!(ActionType::ActivateBoundaryInput.payload_size(), 26);
    }
}
