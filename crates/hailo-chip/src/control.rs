//! Firmware control protocol constants.
//!
//! Every control request and response is framed by a fixed 16-byte
//! little-endian header and protected by a 16-byte MD5 digest computed over
//! the whole frame.
//!
//! ```text
//! request   protocol_version u32 | opcode u32 | sequence u32 | payload_len u32 | payload
//! response  opcode u32 | sequence u32 | major_status u32 | minor_status u32 | payload
//! ```

/// Length of the integrity digest carried by every control frame.
pub const MD5_LENGTH: usize = 16;

/// Protocol version sent in every request header.
pub const PROTOCOL_VERSION: u32 = 2;

/// Size of the request and response headers.
pub const HEADER_SIZE: usize = 16;

/// Largest control frame accepted by firmware, header included.
pub const MAX_CONTROL_LENGTH: usize = 1500;

/// Largest per-context action payload sent in a single control.
pub const CONTEXT_NETWORK_DATA_SINGLE_CONTROL_MAX_SIZE: usize = 1024;

/// `major_status` value for success.
pub const STATUS_SUCCESS: u32 = 0;

/// Descending-timestamp origin used by the action-list recorder. A recorded
/// timestamp `t` corresponds to elapsed time `TIMESTAMP_INIT_VALUE - t`.
pub const TIMESTAMP_INIT_VALUE: u32 = 0xFFFF_FFFF;

/// Default timeout for a firmware control round-trip, in milliseconds.
pub const DEFAULT_CONTROL_TIMEOUT_MS: u64 = 5_000;

/// Firmware CPU a control is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuId {
    /// Application CPU.
    App,
    /// Core (neural-network) CPU.
    Core,
}

impl CpuId {
    /// Wire value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::App => 0,
            Self::Core => 1,
        }
    }
}

/// Control opcodes used by the host vDMA runtime.
pub mod opcode {
    /// Identify firmware and board.
    pub const IDENTIFY: u32 = 0;
    /// Send the network-group header.
    pub const SET_NETWORK_GROUP_HEADER: u32 = 0x28;
    /// Send one chunk of a context's action program.
    pub const SET_CONTEXT_INFO: u32 = 0x29;
    /// Enable, pause or reset the context-switch state machine.
    pub const CHANGE_CONTEXT_SWITCH_STATUS: u32 = 0x2A;
    /// Download one chunk of the executed action list of a context.
    pub const DOWNLOAD_CONTEXT_ACTION_LIST: u32 = 0x2B;
}

/// Context-switch sequencer states carried by `CHANGE_CONTEXT_SWITCH_STATUS`.
pub mod switch_status {
    /// Sequencer reset.
    pub const RESET: u8 = 0;
    /// Sequencer enabled.
    pub const ENABLED: u8 = 1;
    /// Sequencer paused.
    pub const PAUSED: u8 = 2;
}
