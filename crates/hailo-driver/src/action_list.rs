//! Firmware action-list records
//!
//! Encoder used when assembling context programs and decoder for the lists
//! downloaded back from firmware. Record layout and payload sizes are in
//! [`hailo_chip::action`]; every field is extracted after a bounds check, so
//! a malformed list is an error, never a panic.
//!
//! ```text
//! [ts u32 | type u8 | payload]  [ts | RepeatedAction | sub u8 count u8 rsvd u8 | payload × count]
//! ```
//!
//! A `RepeatedAction` header is not a record of its own: it expands into
//! `count` records that share its timestamp and carry a sub-action index.

use crate::error::{Result, VdmaError};
use crate::vdma::HostBufferInfo;
use bytes::{Buf, BufMut};
use hailo_chip::action::{
    ActionType, ACTION_HEADER_SIZE, MAX_ACTION_LIST_SIZE, REPEATED_ACTION_PAYLOAD_SIZE,
};
use hailo_chip::control::TIMESTAMP_INIT_VALUE;
use hailo_chip::vdma::ChannelId;

/// LCU address, packed as cluster `[7:4]`, lcu `[3:0]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LcuId {
    /// Cluster index, `0..16`
    pub cluster_index: u8,
    /// LCU index within the cluster, `0..16`
    pub lcu_index: u8,
}

impl LcuId {
    /// One-byte wire form
    pub const fn pack(self) -> u8 {
        (self.cluster_index << 4) | (self.lcu_index & 0x0F)
    }

    /// Inverse of [`pack`](Self::pack)
    pub const fn unpack(packed: u8) -> Self {
        Self {
            cluster_index: packed >> 4,
            lcu_index: packed & 0x0F,
        }
    }
}

/// Payload shared by the six edge-layer activation actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeLayerActivation {
    /// Channel carrying the layer
    pub channel: ChannelId,
    /// Stream index on the device side
    pub stream_index: u8,
    /// Network the layer belongs to
    pub network_index: u8,
    /// Host buffer backing the channel
    pub host_buffer: HostBufferInfo,
    /// Initial credit (inputs) or frame size (outputs)
    pub credit: u32,
}

/// Cluster sequencer trigger
#[allow(missing_docs)] // register images, named as in the firmware
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerSequencer {
    pub cluster_index: u8,
    pub initial_l3_cut: u8,
    pub initial_l3_offset: u16,
    pub active_apu: u32,
    pub active_ia: u32,
    pub active_sc: u64,
    pub active_l2: u64,
    pub l2_offset_0: u64,
    pub l2_offset_1: u64,
}

/// One decoded action
// Payload fields carry the firmware's names; see hailo_chip::action for sizes
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    LcuInterrupt { lcu: LcuId, network_index: u8 },
    SequencerDoneInterrupt { cluster_index: u8 },
    InputChannelTransferDoneInterrupt { channel: ChannelId },
    OutputChannelTransferDoneInterrupt { channel: ChannelId },
    ModuleConfigDoneInterrupt { module_index: u8 },
    ApplicationChangeInterrupt,
    FetchCfgChannelDescriptors { channel: ChannelId, desc_count: u16 },
    FetchCcwBursts { config_stream_index: u8, ccw_bursts: u16 },
    TriggerSequencer(TriggerSequencer),
    WaitForDmaIdle { channel: ChannelId, stream_index: u8 },
    WaitForNms { nms_unit_index: u8, aggregator_index: u8 },
    FetchDataFromVdmaChannel { channel: ChannelId, stream_index: u8 },
    DeactivateVdmaChannel { channel: ChannelId },
    ValidateVdmaChannel { channel: ChannelId },
    EnableLcuDefault { lcu: LcuId, network_index: u8 },
    EnableLcuNonDefault {
        lcu: LcuId,
        network_index: u8,
        kernel_done_address: u16,
        kernel_done_count: u32,
    },
    DisableLcu { lcu: LcuId, network_index: u8 },
    ActivateBoundaryInput(EdgeLayerActivation),
    ActivateBoundaryOutput(EdgeLayerActivation),
    ActivateInterContextInput(EdgeLayerActivation),
    ActivateInterContextOutput(EdgeLayerActivation),
    ActivateDdrBufferInput(EdgeLayerActivation),
    ActivateDdrBufferOutput(EdgeLayerActivation),
    ChangeVdmaToStreamMapping { channel: ChannelId, stream_index: u8, is_dummy_stream: bool },
    AddDdrPairInfo {
        h2d: ChannelId,
        d2h: ChannelId,
        descriptors_per_frame: u32,
        programmed_descs: u16,
    },
    DdrBufferingStart,
    BurstCreditsTaskStart,
    ActivateCfgChannel { channel: ChannelId, config_stream_index: u8, host_buffer: HostBufferInfo },
    DeactivateCfgChannel { channel: ChannelId, config_stream_index: u8 },
    DdrBufferingReset,
    OpenBoundaryInputChannel { channel: ChannelId, host_buffer: HostBufferInfo },
    OpenBoundaryOutputChannel { channel: ChannelId, host_buffer: HostBufferInfo },
    EnableNms { nms_unit_index: u8, network_index: u8 },
}

fn put_host_buffer(buf: &mut impl BufMut, info: &HostBufferInfo) {
    buf.put_u8(info.buffer_type);
    buf.put_u64_le(info.dma_address);
    buf.put_u16_le(info.desc_page_size);
    buf.put_u32_le(info.total_desc_count);
    buf.put_u32_le(info.bytes_in_pattern);
}

fn get_host_buffer(buf: &mut impl Buf) -> HostBufferInfo {
    HostBufferInfo {
        buffer_type: buf.get_u8(),
        dma_address: buf.get_u64_le(),
        desc_page_size: buf.get_u16_le(),
        total_desc_count: buf.get_u32_le(),
        bytes_in_pattern: buf.get_u32_le(),
    }
}

fn put_edge(buf: &mut impl BufMut, edge: &EdgeLayerActivation) {
    buf.put_u8(edge.channel.pack());
    buf.put_u8(edge.stream_index);
    buf.put_u8(edge.network_index);
    put_host_buffer(buf, &edge.host_buffer);
    buf.put_u32_le(edge.credit);
}

fn get_edge(buf: &mut impl Buf) -> EdgeLayerActivation {
    EdgeLayerActivation {
        channel: ChannelId::unpack(buf.get_u8()),
        stream_index: buf.get_u8(),
        network_index: buf.get_u8(),
        host_buffer: get_host_buffer(buf),
        credit: buf.get_u32_le(),
    }
}

fn channel(buf: &mut impl Buf) -> ChannelId {
    ChannelId::unpack(buf.get_u8())
}

fn lcu(buf: &mut impl Buf) -> LcuId {
    LcuId::unpack(buf.get_u8())
}

impl Action {
    /// Record type of this action
    pub const fn action_type(&self) -> ActionType {
        match self {
            Self::LcuInterrupt { .. } => ActionType::LcuInterrupt,
            Self::SequencerDoneInterrupt { .. } => ActionType::SequencerDoneInterrupt,
            Self::InputChannelTransferDoneInterrupt { .. } => {
                ActionType::InputChannelTransferDoneInterrupt
            }
            Self::OutputChannelTransferDoneInterrupt { .. } => {
                ActionType::OutputChannelTransferDoneInterrupt
            }
            Self::ModuleConfigDoneInterrupt { .. } => ActionType::ModuleConfigDoneInterrupt,
            Self::ApplicationChangeInterrupt => ActionType::ApplicationChangeInterrupt,
            Self::FetchCfgChannelDescriptors { .. } => ActionType::FetchCfgChannelDescriptors,
            Self::FetchCcwBursts { .. } => ActionType::FetchCcwBursts,
            Self::TriggerSequencer(_) => ActionType::TriggerSequencer,
            Self::WaitForDmaIdle { .. } => ActionType::WaitForDmaIdle,
            Self::WaitForNms { .. } => ActionType::WaitForNms,
            Self::FetchDataFromVdmaChannel { .. } => ActionType::FetchDataFromVdmaChannel,
            Self::DeactivateVdmaChannel { .. } => ActionType::DeactivateVdmaChannel,
            Self::ValidateVdmaChannel { .. } => ActionType::ValidateVdmaChannel,
            Self::EnableLcuDefault { .. } => ActionType::EnableLcuDefault,
            Self::EnableLcuNonDefault { .. } => ActionType::EnableLcuNonDefault,
            Self::DisableLcu { .. } => ActionType::DisableLcu,
            Self::ActivateBoundaryInput(_) => ActionType::ActivateBoundaryInput,
            Self::ActivateBoundaryOutput(_) => ActionType::ActivateBoundaryOutput,
            Self::ActivateInterContextInput(_) => ActionType::ActivateInterContextInput,
            Self::ActivateInterContextOutput(_) => ActionType::ActivateInterContextOutput,
            Self::ActivateDdrBufferInput(_) => ActionType::ActivateDdrBufferInput,
            Self::ActivateDdrBufferOutput(_) => ActionType::ActivateDdrBufferOutput,
            Self::ChangeVdmaToStreamMapping { .. } => ActionType::ChangeVdmaToStreamMapping,
            Self::AddDdrPairInfo { .. } => ActionType::AddDdrPairInfo,
            Self::DdrBufferingStart => ActionType::DdrBufferingStart,
            Self::BurstCreditsTaskStart => ActionType::BurstCreditsTaskStart,
            Self::ActivateCfgChannel { .. } => ActionType::ActivateCfgChannel,
            Self::DeactivateCfgChannel { .. } => ActionType::DeactivateCfgChannel,
            Self::DdrBufferingReset => ActionType::DdrBufferingReset,
            Self::OpenBoundaryInputChannel { .. } => ActionType::OpenBoundaryInputChannel,
            Self::OpenBoundaryOutputChannel { .. } => ActionType::OpenBoundaryOutputChannel,
            Self::EnableNms { .. } => ActionType::EnableNms,
        }
    }

    /// Encoded record size, header included
    pub const fn encoded_len(&self) -> usize {
        ACTION_HEADER_SIZE + self.action_type().payload_size()
    }

    /// Append header and payload
    pub fn encode(&self, timestamp: u32, buf: &mut impl BufMut) {
        buf.put_u32_le(timestamp);
        buf.put_u8(self.action_type().as_u8());
        self.encode_payload(buf);
    }

    /// Append the payload only
    pub fn encode_payload(&self, buf: &mut impl BufMut) {
        match self {
            Self::LcuInterrupt { lcu, network_index }
            | Self::EnableLcuDefault { lcu, network_index }
            | Self::DisableLcu { lcu, network_index } => {
                buf.put_u8(lcu.pack());
                buf.put_u8(*network_index);
            }
            Self::SequencerDoneInterrupt { cluster_index } => buf.put_u8(*cluster_index),
            Self::InputChannelTransferDoneInterrupt { channel }
            | Self::OutputChannelTransferDoneInterrupt { channel }
            | Self::DeactivateVdmaChannel { channel }
            | Self::ValidateVdmaChannel { channel } => buf.put_u8(channel.pack()),
            Self::ModuleConfigDoneInterrupt { module_index } => buf.put_u8(*module_index),
            Self::ApplicationChangeInterrupt
            | Self::DdrBufferingStart
            | Self::BurstCreditsTaskStart
            | Self::DdrBufferingReset => {}
            Self::FetchCfgChannelDescriptors { channel, desc_count } => {
                buf.put_u8(channel.pack());
                buf.put_u16_le(*desc_count);
            }
            Self::FetchCcwBursts {
                config_stream_index,
                ccw_bursts,
            } => {
                buf.put_u8(*config_stream_index);
                buf.put_u16_le(*ccw_bursts);
            }
            Self::TriggerSequencer(t) => {
                buf.put_u8(t.cluster_index);
                buf.put_u8(t.initial_l3_cut);
                buf.put_u16_le(t.initial_l3_offset);
                buf.put_u32_le(t.active_apu);
                buf.put_u32_le(t.active_ia);
                buf.put_u64_le(t.active_sc);
                buf.put_u64_le(t.active_l2);
                buf.put_u64_le(t.l2_offset_0);
                buf.put_u64_le(t.l2_offset_1);
            }
            Self::WaitForDmaIdle {
                channel,
                stream_index,
            }
            | Self::FetchDataFromVdmaChannel {
                channel,
                stream_index,
            } => {
                buf.put_u8(channel.pack());
                buf.put_u8(*stream_index);
            }
            Self::WaitForNms {
                nms_unit_index,
                aggregator_index,
            } => {
                buf.put_u8(*nms_unit_index);
                buf.put_u8(*aggregator_index);
            }
            Self::EnableLcuNonDefault {
                lcu,
                network_index,
                kernel_done_address,
                kernel_done_count,
            } => {
                buf.put_u8(lcu.pack());
                buf.put_u8(*network_index);
                buf.put_u16_le(*kernel_done_address);
                buf.put_u32_le(*kernel_done_count);
            }
            Self::ActivateBoundaryInput(edge)
            | Self::ActivateBoundaryOutput(edge)
            | Self::ActivateInterContextInput(edge)
            | Self::ActivateInterContextOutput(edge)
            | Self::ActivateDdrBufferInput(edge)
            | Self::ActivateDdrBufferOutput(edge) => put_edge(buf, edge),
            Self::ChangeVdmaToStreamMapping {
                channel,
                stream_index,
                is_dummy_stream,
            } => {
                buf.put_u8(channel.pack());
                buf.put_u8(*stream_index);
                buf.put_u8(u8::from(*is_dummy_stream));
            }
            Self::AddDdrPairInfo {
                h2d,
                d2h,
                descriptors_per_frame,
                programmed_descs,
            } => {
                buf.put_u8(h2d.pack());
                buf.put_u8(d2h.pack());
                buf.put_u32_le(*descriptors_per_frame);
                buf.put_u16_le(*programmed_descs);
            }
            Self::ActivateCfgChannel {
                channel,
                config_stream_index,
                host_buffer,
            } => {
                buf.put_u8(channel.pack());
                buf.put_u8(*config_stream_index);
                put_host_buffer(buf, host_buffer);
            }
            Self::DeactivateCfgChannel {
                channel,
                config_stream_index,
            } => {
                buf.put_u8(channel.pack());
                buf.put_u8(*config_stream_index);
            }
            Self::OpenBoundaryInputChannel {
                channel,
                host_buffer,
            }
            | Self::OpenBoundaryOutputChannel {
                channel,
                host_buffer,
            } => {
                buf.put_u8(channel.pack());
                put_host_buffer(buf, host_buffer);
            }
            Self::EnableNms {
                nms_unit_index,
                network_index,
            } => {
                buf.put_u8(*nms_unit_index);
                buf.put_u8(*network_index);
            }
        }
    }

    /// Decode one payload of type `ty`
    ///
    /// The caller guarantees `buf` holds at least `ty.payload_size()` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` for `RepeatedAction`, which has no payload of its
    /// own.
    fn decode_payload(ty: ActionType, buf: &mut impl Buf) -> Result<Self> {
        Ok(match ty {
            ActionType::RepeatedAction => {
                return Err(VdmaError::malformed("Nested repeated action"));
            }
            ActionType::LcuInterrupt => Self::LcuInterrupt {
                lcu: lcu(buf),
                network_index: buf.get_u8(),
            },
            ActionType::SequencerDoneInterrupt => Self::SequencerDoneInterrupt {
                cluster_index: buf.get_u8(),
            },
            ActionType::InputChannelTransferDoneInterrupt => {
                Self::InputChannelTransferDoneInterrupt {
                    channel: channel(buf),
                }
            }
            ActionType::OutputChannelTransferDoneInterrupt => {
                Self::OutputChannelTransferDoneInterrupt {
                    channel: channel(buf),
                }
            }
            ActionType::ModuleConfigDoneInterrupt => Self::ModuleConfigDoneInterrupt {
                module_index: buf.get_u8(),
            },
            ActionType::ApplicationChangeInterrupt => Self::ApplicationChangeInterrupt,
            ActionType::FetchCfgChannelDescriptors => Self::FetchCfgChannelDescriptors {
                channel: channel(buf),
                desc_count: buf.get_u16_le(),
            },
            ActionType::FetchCcwBursts => Self::FetchCcwBursts {
                config_stream_index: buf.get_u8(),
                ccw_bursts: buf.get_u16_le(),
            },
            ActionType::TriggerSequencer => Self::TriggerSequencer(TriggerSequencer {
                cluster_index: buf.get_u8(),
                initial_l3_cut: buf.get_u8(),
                initial_l3_offset: buf.get_u16_le(),
                active_apu: buf.get_u32_le(),
                active_ia: buf.get_u32_le(),
                active_sc: buf.get_u64_le(),
                active_l2: buf.get_u64_le(),
                l2_offset_0: buf.get_u64_le(),
                l2_offset_1: buf.get_u64_le(),
            }),
            ActionType::WaitForDmaIdle => Self::WaitForDmaIdle {
                channel: channel(buf),
                stream_index: buf.get_u8(),
            },
            ActionType::WaitForNms => Self::WaitForNms {
                nms_unit_index: buf.get_u8(),
                aggregator_index: buf.get_u8(),
            },
            ActionType::FetchDataFromVdmaChannel => Self::FetchDataFromVdmaChannel {
                channel: channel(buf),
                stream_index: buf.get_u8(),
            },
            ActionType::DeactivateVdmaChannel => Self::DeactivateVdmaChannel {
                channel: channel(buf),
            },
            ActionType::ValidateVdmaChannel => Self::ValidateVdmaChannel {
                channel: channel(buf),
            },
            ActionType::EnableLcuDefault => Self::EnableLcuDefault {
                lcu: lcu(buf),
                network_index: buf.get_u8(),
            },
            ActionType::EnableLcuNonDefault => Self::EnableLcuNonDefault {
                lcu: lcu(buf),
                network_index: buf.get_u8(),
                kernel_done_address: buf.get_u16_le(),
                kernel_done_count: buf.get_u32_le(),
            },
            ActionType::DisableLcu => Self::DisableLcu {
                lcu: lcu(buf),
                network_index: buf.get_u8(),
            },
            ActionType::ActivateBoundaryInput => Self::ActivateBoundaryInput(get_edge(buf)),
            ActionType::ActivateBoundaryOutput => Self::ActivateBoundaryOutput(get_edge(buf)),
            ActionType::ActivateInterContextInput => Self::ActivateInterContextInput(get_edge(buf)),
            ActionType::ActivateInterContextOutput => {
                Self::ActivateInterContextOutput(get_edge(buf))
            }
            ActionType::ActivateDdrBufferInput => Self::ActivateDdrBufferInput(get_edge(buf)),
            ActionType::ActivateDdrBufferOutput => Self::ActivateDdrBufferOutput(get_edge(buf)),
            ActionType::ChangeVdmaToStreamMapping => Self::ChangeVdmaToStreamMapping {
                channel: channel(buf),
                stream_index: buf.get_u8(),
                is_dummy_stream: buf.get_u8() != 0,
            },
            ActionType::AddDdrPairInfo => Self::AddDdrPairInfo {
                h2d: channel(buf),
                d2h: channel(buf),
                descriptors_per_frame: buf.get_u32_le(),
                programmed_descs: buf.get_u16_le(),
            },
            ActionType::DdrBufferingStart => Self::DdrBufferingStart,
            ActionType::BurstCreditsTaskStart => Self::BurstCreditsTaskStart,
            ActionType::ActivateCfgChannel => Self::ActivateCfgChannel {
                channel: channel(buf),
                config_stream_index: buf.get_u8(),
                host_buffer: get_host_buffer(buf),
            },
            ActionType::DeactivateCfgChannel => Self::DeactivateCfgChannel {
                channel: channel(buf),
                config_stream_index: buf.get_u8(),
            },
            ActionType::DdrBufferingReset => Self::DdrBufferingReset,
            ActionType::OpenBoundaryInputChannel => Self::OpenBoundaryInputChannel {
                channel: channel(buf),
                host_buffer: get_host_buffer(buf),
            },
            ActionType::OpenBoundaryOutputChannel => Self::OpenBoundaryOutputChannel {
                channel: channel(buf),
                host_buffer: get_host_buffer(buf),
            },
            ActionType::EnableNms => Self::EnableNms {
                nms_unit_index: buf.get_u8(),
                network_index: buf.get_u8(),
            },
        })
    }
}

/// Append a `RepeatedAction` run of same-typed actions
///
/// # Errors
///
/// Returns `InvalidArgument` for an empty run, more than 255 actions, mixed
/// types, or repeated `RepeatedAction`.
pub fn encode_repeated(timestamp: u32, actions: &[Action], buf: &mut impl BufMut) -> Result<()> {
    let Some(first) = actions.first() else {
        return Err(VdmaError::invalid_argument("Repeated action needs at least one action"));
    };
    let count = u8::try_from(actions.len()).map_err(|_| {
        VdmaError::invalid_argument(format!("{} actions do not fit one repeated action", actions.len()))
    })?;
    let sub_type = first.action_type();
    if actions.iter().any(|a| a.action_type() != sub_type) {
        return Err(VdmaError::invalid_argument(format!(
            "Repeated {sub_type} run mixes action types"
        )));
    }

    buf.put_u32_le(timestamp);
    buf.put_u8(ActionType::RepeatedAction.as_u8());
    buf.put_u8(sub_type.as_u8());
    buf.put_u8(count);
    buf.put_u8(0);
    for action in actions {
        action.encode_payload(buf);
    }
    Ok(())
}

/// One decoded record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionRecord {
    /// Raw descending timestamp
    pub timestamp: u32,
    /// Position inside a `RepeatedAction` run
    pub sub_action_index: Option<u8>,
    /// Byte offset of the payload (plain records: of the header)
    pub offset: usize,
    /// The action
    pub action: Action,
}

impl ActionRecord {
    /// Forward time since the recorder started
    pub const fn elapsed(&self) -> u32 {
        TIMESTAMP_INIT_VALUE.wrapping_sub(self.timestamp)
    }
}

fn need(buf: &impl Buf, needed: usize, offset: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(VdmaError::Truncated {
            needed,
            remaining: buf.remaining(),
            offset,
        });
    }
    Ok(())
}

/// Decode an action list of `declared_len` bytes
///
/// # Errors
///
/// `Malformed` when the list is larger than `u16::MAX`, when `data` holds
/// bytes past `declared_len`, or for a nested repeat; `Truncated` when a
/// record crosses the end; `UnknownActionType` for a type outside the
/// table.
pub fn decode_action_list(data: &[u8], declared_len: usize) -> Result<Vec<ActionRecord>> {
    if declared_len > MAX_ACTION_LIST_SIZE {
        return Err(VdmaError::malformed(format!(
            "Action list of {declared_len} bytes exceeds {MAX_ACTION_LIST_SIZE}"
        )));
    }
    if data.len() < declared_len {
        return Err(VdmaError::Truncated {
            needed: declared_len,
            remaining: data.len(),
            offset: 0,
        });
    }
    if data.len() > declared_len {
        return Err(VdmaError::malformed(format!(
            "{} bytes past the declared action list length {declared_len}",
            data.len() - declared_len
        )));
    }

    let mut buf = data;
    let offset_of = |buf: &[u8]| declared_len - buf.len();
    let mut records = Vec::new();

    while buf.has_remaining() {
        let offset = offset_of(buf);
        need(&buf, ACTION_HEADER_SIZE, offset)?;
        let timestamp = buf.get_u32_le();
        let raw = buf.get_u8();
        let ty = ActionType::from_u8(raw).ok_or(VdmaError::UnknownActionType { value: raw, offset })?;

        if ty != ActionType::RepeatedAction {
            need(&buf, ty.payload_size(), offset)?;
            records.push(ActionRecord {
                timestamp,
                sub_action_index: None,
                offset,
                action: Action::decode_payload(ty, &mut buf)?,
            });
            continue;
        }

        need(&buf, REPEATED_ACTION_PAYLOAD_SIZE, offset)?;
        let raw_sub = buf.get_u8();
        let count = buf.get_u8();
        let _reserved = buf.get_u8();
        let sub_type = ActionType::from_u8(raw_sub).ok_or(VdmaError::UnknownActionType {
            value: raw_sub,
            offset: offset + ACTION_HEADER_SIZE,
        })?;
        if sub_type == ActionType::RepeatedAction {
            return Err(VdmaError::malformed(format!("Nested repeated action at offset {offset}")));
        }
        for index in 0..count {
            let sub_offset = offset_of(buf);
            need(&buf, sub_type.payload_size(), sub_offset)?;
            records.push(ActionRecord {
                timestamp,
                sub_action_index: Some(index),
                offset: sub_offset,
                action: Action::decode_payload(sub_type, &mut buf)?,
            });
        }
    }

    tracing::debug!("Decoded {} action records from {declared_len} bytes", records.len());
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hailo_chip::action::host_buffer_type;

    fn ch(index: u8) -> ChannelId {
        ChannelId::checked(0, index).unwrap()
    }

    fn host_buffer() -> HostBufferInfo {
        HostBufferInfo {
            buffer_type: host_buffer_type::EXTERNAL_DESC,
            dma_address: 0x1_2345_6000,
            desc_page_size: 512,
            total_desc_count: 64,
            bytes_in_pattern: 1024,
        }
    }

    fn edge() -> EdgeLayerActivation {
        EdgeLayerActivation {
            channel: ch(16),
            stream_index: 3,
            network_index: 1,
            host_buffer: host_buffer(),
            credit: 1024,
        }
    }

    fn one_of_each() -> Vec<Action> {
        let lcu = LcuId {
            cluster_index: 2,
            lcu_index: 7,
        };
        vec![
            Action::LcuInterrupt { lcu, network_index: 0 },
            Action::SequencerDoneInterrupt { cluster_index: 1 },
            Action::InputChannelTransferDoneInterrupt { channel: ch(0) },
            Action::OutputChannelTransferDoneInterrupt { channel: ch(16) },
            Action::ModuleConfigDoneInterrupt { module_index: 4 },
            Action::ApplicationChangeInterrupt,
            Action::FetchCfgChannelDescriptors { channel: ch(1), desc_count: 10 },
            Action::FetchCcwBursts { config_stream_index: 0, ccw_bursts: 3 },
            Action::TriggerSequencer(TriggerSequencer {
                cluster_index: 1,
                active_sc: u64::MAX,
                ..TriggerSequencer::default()
            }),
            Action::WaitForDmaIdle { channel: ch(2), stream_index: 2 },
            Action::WaitForNms { nms_unit_index: 0, aggregator_index: 1 },
            Action::FetchDataFromVdmaChannel { channel: ch(3), stream_index: 3 },
            Action::DeactivateVdmaChannel { channel: ch(4) },
            Action::ValidateVdmaChannel { channel: ch(20) },
            Action::EnableLcuDefault { lcu, network_index: 0 },
            Action::EnableLcuNonDefault {
                lcu,
                network_index: 0,
                kernel_done_address: 0x40,
                kernel_done_count: 9,
            },
            Action::DisableLcu { lcu, network_index: 0 },
            Action::ActivateBoundaryInput(edge()),
            Action::ActivateBoundaryOutput(edge()),
            Action::ActivateInterContextInput(edge()),
            Action::ActivateInterContextOutput(edge()),
            Action::ActivateDdrBufferInput(edge()),
            Action::ActivateDdrBufferOutput(edge()),
            Action::ChangeVdmaToStreamMapping {
                channel: ch(5),
                stream_index: 1,
                is_dummy_stream: true,
            },
            Action::AddDdrPairInfo {
                h2d: ch(6),
                d2h: ch(22),
                descriptors_per_frame: 32,
                programmed_descs: 64,
            },
            Action::DdrBufferingStart,
            Action::BurstCreditsTaskStart,
            Action::ActivateCfgChannel {
                channel: ch(0),
                config_stream_index: 0,
                host_buffer: host_buffer(),
            },
            Action::DeactivateCfgChannel { channel: ch(0), config_stream_index: 0 },
            Action::DdrBufferingReset,
            Action::OpenBoundaryInputChannel { channel: ch(0), host_buffer: host_buffer() },
            Action::OpenBoundaryOutputChannel { channel: ch(16), host_buffer: host_buffer() },
            Action::EnableNms { nms_unit_index: 0, network_index: 0 },
        ]
    }

    #[test]
    fn test_payloads_match_table_sizes() {
        let actions = one_of_each();
        // every type but RepeatedAction
        assert_eq!(actions.len(), ActionType::ALL.len() - 1);
        for action in &actions {
            let mut payload = Vec::new();
            action.encode_payload(&mut payload);
            assert_eq!(
                payload.len(),
                action.action_type().payload_size(),
                "{}",
                action.action_type()
            );
        }
    }

    #[test]
    fn test_whole_list_decodes_in_order() {
        let actions = one_of_each();
        let mut data = Vec::new();
        for (i, action) in actions.iter().enumerate() {
            action.encode(TIMESTAMP_INIT_VALUE - i as u32, &mut data);
        }
        let records = decode_action_list(&data, data.len()).unwrap();
        let decoded: Vec<Action> = records.iter().map(|r| r.action).collect();
        assert_eq!(decoded, actions);
        assert_eq!(records[5].elapsed(), 5);
    }

    #[test]
    fn test_repeated_expands_into_sub_records() {
        let mut data = Vec::new();
        Action::DdrBufferingStart.encode(100, &mut data);
        let validates = [
            Action::ValidateVdmaChannel { channel: ch(16) },
            Action::ValidateVdmaChannel { channel: ch(17) },
            Action::ValidateVdmaChannel { channel: ch(18) },
        ];
        encode_repeated(90, &validates, &mut data).unwrap();
        assert_eq!(data.len(), 5 + 5 + 3 + 3);

        let records = decode_action_list(&data, data.len()).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].action, Action::DdrBufferingStart);
        assert_eq!(records[0].sub_action_index, None);
        for (i, record) in records[1..].iter().enumerate() {
            assert_eq!(record.timestamp, 90);
            assert_eq!(record.sub_action_index, Some(i as u8));
            assert_eq!(record.action, validates[i]);
            assert_eq!(record.offset, 13 + i);
        }
    }

    #[test]
    fn test_truncated_record_rejected() {
        let mut data = Vec::new();
        Action::ActivateBoundaryInput(edge()).encode(0, &mut data);
        data.truncate(20);
        assert!(matches!(
            decode_action_list(&data, data.len()),
            Err(VdmaError::Truncated { needed: 26, remaining: 15, offset: 0 })
        ));

        let mut repeated = Vec::new();
        encode_repeated(0, &[Action::DeactivateVdmaChannel { channel: ch(1) }; 3], &mut repeated)
            .unwrap();
        repeated.pop();
        assert!(matches!(
            decode_action_list(&repeated, repeated.len()),
            Err(VdmaError::Truncated { .. })
        ));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut data = Vec::new();
        Action::DdrBufferingReset.encode(0, &mut data);
        assert!(matches!(
            decode_action_list(&data, data.len() - 1),
            Err(VdmaError::Malformed { .. })
        ));
        assert!(matches!(
            decode_action_list(&data, data.len() + 1),
            Err(VdmaError::Truncated { .. })
        ));
        let huge = vec![0u8; MAX_ACTION_LIST_SIZE + 1];
        assert!(matches!(
            decode_action_list(&huge, huge.len()),
            Err(VdmaError::Malformed { .. })
        ));
    }

    #[test]
    fn test_unknown_and_nested_types_rejected() {
        let mut data = Vec::new();
        Action::DdrBufferingStart.encode(0, &mut data);
        data.extend_from_slice(&[0, 0, 0, 0, 200]);
        assert!(matches!(
            decode_action_list(&data, data.len()),
            Err(VdmaError::UnknownActionType { value: 200, offset: 5 })
        ));

        let nested = [0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            decode_action_list(&nested, nested.len()),
            Err(VdmaError::Malformed { .. })
        ));

        // An empty nested run is still nested
        let empty_nested = [0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            decode_action_list(&empty_nested, empty_nested.len()),
            Err(VdmaError::Malformed { .. })
        ));
    }

    #[test]
    fn test_repeated_encoder_validation() {
        let mut buf = Vec::new();
        assert!(encode_repeated(0, &[], &mut buf).is_err());
        assert!(encode_repeated(
            0,
            &[Action::DdrBufferingStart, Action::DdrBufferingReset],
            &mut buf
        )
        .is_err());
        assert!(encode_repeated(0, &[Action::DdrBufferingStart; 256], &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_lcu_packing() {
        let lcu = LcuId {
            cluster_index: 0xA,
            lcu_index: 0x3,
        };
        assert_eq!(lcu.pack(), 0xA3);
        assert_eq!(LcuId::unpack(0xA3), lcu);
    }
}
