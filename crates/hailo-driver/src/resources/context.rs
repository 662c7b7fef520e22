//! One context of a network group's firmware program
//!
//! A record owns the context's config buffers and DDR pairs and collects
//! its action program, already split into control-sized chunks.

use crate::action_list::{encode_repeated, Action};
use crate::control::ContextControl;
use crate::driver::Driver;
use crate::error::{Result, VdmaError};
use crate::resources::config_buffer::ConfigResources;
use crate::resources::ddr::DdrChannelsPair;
use bytes::BufMut;
use hailo_chip::context::ContextKind;
use hailo_chip::control::{CONTEXT_NETWORK_DATA_SINGLE_CONTROL_MAX_SIZE, TIMESTAMP_INIT_VALUE};
use hailo_chip::vdma::{ChannelId, Direction};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Role of an edge layer within its context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeLayerType {
    /// Host-facing stream
    Boundary,
    /// Inter-context buffer side
    InterContext,
    /// DDR pair side
    Ddr,
}

/// An edge layer mapped to a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeLayer {
    /// Layer name
    pub name: String,
    /// Channel carrying it
    pub channel: ChannelId,
    /// Device-side stream index
    pub stream_index: u8,
    /// Direction of the layer
    pub direction: Direction,
    /// Role
    pub layer_type: EdgeLayerType,
}

/// Resources and action program of one context
#[derive(Debug)]
pub struct ContextRecord {
    kind: ContextKind,
    config: BTreeMap<u8, ConfigResources>,
    edge_layers: Vec<EdgeLayer>,
    ddr_pairs: Vec<DdrChannelsPair>,
    controls: Vec<ContextControl>,
}

impl ContextRecord {
    /// Record with one config buffer per non-empty config stream
    ///
    /// `config_buffers[i]` lists the CCW burst sizes of config stream `i`,
    /// fed by `cfg_channels[i]`.
    ///
    /// # Errors
    ///
    /// `Malformed` when there are more config streams than cfg channels,
    /// or the buffer allocation error.
    pub fn new(
        driver: &Arc<dyn Driver>,
        kind: ContextKind,
        cfg_channels: &[ChannelId],
        config_buffers: &[Vec<u32>],
    ) -> Result<Self> {
        if config_buffers.len() > cfg_channels.len() {
            return Err(VdmaError::malformed(format!(
                "{} config streams but only {} cfg channels",
                config_buffers.len(),
                cfg_channels.len()
            )));
        }
        let mut config = BTreeMap::new();
        for (index, (sizes, &channel)) in config_buffers.iter().zip(cfg_channels).enumerate() {
            if sizes.iter().all(|&size| size == 0) {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)] // bounded by the channel table
            config.insert(index as u8, ConfigResources::create(driver, channel, sizes)?);
        }
        Ok(Self {
            kind,
            config,
            edge_layers: Vec::new(),
            ddr_pairs: Vec::new(),
            controls: vec![ContextControl {
                is_first: true,
                is_last: true,
                ..ContextControl::default()
            }],
        })
    }

    /// Context kind
    pub const fn kind(&self) -> ContextKind {
        self.kind
    }

    /// Config buffer of one config stream
    ///
    /// # Errors
    ///
    /// `NotFound` for a stream the context has no CCWs for.
    pub fn config_resources(&mut self, config_stream_index: u8) -> Result<&mut ConfigResources> {
        self.config
            .get_mut(&config_stream_index)
            .ok_or_else(|| VdmaError::not_found(format!("config stream {config_stream_index}")))
    }

    /// Config buffers by config stream
    pub fn config_streams(&self) -> impl Iterator<Item = (u8, &ConfigResources)> {
        self.config.iter().map(|(&index, cfg)| (index, cfg))
    }

    /// Stream indices with a config buffer
    pub fn config_stream_indices(&self) -> Vec<u8> {
        self.config.keys().copied().collect()
    }

    /// Padded CCW bytes of each of `streams_count` config streams
    pub fn cfg_sizes(&self, streams_count: usize) -> Vec<u32> {
        (0..streams_count)
            .map(|index| {
                u8::try_from(index)
                    .ok()
                    .and_then(|index| self.config.get(&index))
                    .map_or(0, |cfg| u32::try_from(cfg.get_total_cfg_size()).unwrap_or(u32::MAX))
            })
            .collect()
    }

    /// Record an edge layer
    pub fn add_edge_layer(&mut self, layer: EdgeLayer) {
        self.edge_layers.push(layer);
    }

    /// Edge layers in mapping order
    pub fn edge_layers(&self) -> &[EdgeLayer] {
        &self.edge_layers
    }

    /// Take ownership of a DDR pair created for this context
    pub fn add_ddr_pair(&mut self, pair: DdrChannelsPair) {
        self.ddr_pairs.push(pair);
    }

    /// DDR pairs of the context
    pub fn ddr_pairs(&self) -> &[DdrChannelsPair] {
        &self.ddr_pairs
    }

    /// Mutable DDR pairs, for opening and closing
    pub fn ddr_pairs_mut(&mut self) -> &mut [DdrChannelsPair] {
        &mut self.ddr_pairs
    }

    /// The pair whose D2H side is `d2h_stream_index`
    pub fn get_ddr_channels_pair(&self, d2h_stream_index: u8) -> Option<&DdrChannelsPair> {
        self.ddr_pairs
            .iter()
            .find(|pair| pair.info().d2h_stream_index == d2h_stream_index)
    }

    /// Append one action record
    pub fn add_action(&mut self, action: &Action) {
        let mut record = Vec::with_capacity(action.encoded_len());
        action.encode(TIMESTAMP_INIT_VALUE, &mut record);
        self.push_record(&record, 1);
    }

    /// Append several action records
    pub fn add_actions(&mut self, actions: &[Action]) {
        for action in actions {
            self.add_action(action);
        }
    }

    /// Append a run of same-typed actions as one repeated record
    ///
    /// A single action is appended as-is.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty, oversized or mixed run.
    pub fn add_repeated_actions(&mut self, actions: &[Action]) -> Result<()> {
        if let [single] = actions {
            self.add_action(single);
            return Ok(());
        }
        let mut record = Vec::new();
        encode_repeated(TIMESTAMP_INIT_VALUE, actions, &mut record)?;
        if record.len() > CONTEXT_NETWORK_DATA_SINGLE_CONTROL_MAX_SIZE {
            // Too large for one control; fall back to plain records
            self.add_actions(actions);
            return Ok(());
        }
        self.push_record(&record, 1);
        Ok(())
    }

    fn push_record(&mut self, record: &[u8], actions: u8) {
        let needs_new = self.controls.last().is_none_or(|control| {
            control.data.len() + record.len() > CONTEXT_NETWORK_DATA_SINGLE_CONTROL_MAX_SIZE
                || control.actions_count.checked_add(actions).is_none()
        });
        if needs_new {
            let is_first = self.controls.is_empty();
            if let Some(last) = self.controls.last_mut() {
                last.is_last = false;
            }
            self.controls.push(ContextControl {
                is_first,
                is_last: true,
                ..ContextControl::default()
            });
        }
        if let Some(control) = self.controls.last_mut() {
            control.data.put_slice(record);
            control.actions_count += actions;
        }
    }

    /// Action program split into control-sized chunks
    pub fn controls(&self) -> &[ContextControl] {
        &self.controls
    }

    /// Concatenated action program
    pub fn action_list(&self) -> Vec<u8> {
        self.controls.iter().flat_map(|c| c.data.iter().copied()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_list::decode_action_list;
    use crate::drivers::SoftwareDriver;

    fn record(config_buffers: &[Vec<u32>]) -> ContextRecord {
        let driver: Arc<dyn Driver> = Arc::new(SoftwareDriver::new());
        let cfg = [ChannelId::checked(0, 0).unwrap(), ChannelId::checked(0, 1).unwrap()];
        ContextRecord::new(&driver, ContextKind::Dynamic, &cfg, config_buffers).unwrap()
    }

    #[test]
    fn test_controls_split_at_control_size() {
        let mut context = record(&[]);
        let channel = ChannelId::checked(0, 16).unwrap();
        // 6-byte records; 170 fit in 1024 bytes
        for _ in 0..200 {
            context.add_action(&Action::ValidateVdmaChannel { channel });
        }
        let controls = context.controls();
        assert_eq!(controls.len(), 2);
        assert!(controls[0].is_first && !controls[0].is_last);
        assert!(!controls[1].is_first && controls[1].is_last);
        assert_eq!(controls[0].actions_count, 170);
        assert_eq!(controls[1].actions_count, 30);
        assert!(controls.iter().all(|c| c.data.len() <= CONTEXT_NETWORK_DATA_SINGLE_CONTROL_MAX_SIZE));

        let list = context.action_list();
        assert_eq!(decode_action_list(&list, list.len()).unwrap().len(), 200);
    }

    #[test]
    fn test_empty_context_has_one_control() {
        let context = record(&[]);
        assert_eq!(context.controls().len(), 1);
        assert!(context.controls()[0].is_first && context.controls()[0].is_last);
        assert!(context.action_list().is_empty());
    }

    #[test]
    fn test_repeated_run_expands_on_decode() {
        let mut context = record(&[]);
        let actions: Vec<Action> = (16..19)
            .map(|index| Action::DeactivateVdmaChannel {
                channel: ChannelId::checked(0, index).unwrap(),
            })
            .collect();
        context.add_repeated_actions(&actions).unwrap();
        assert_eq!(context.controls()[0].actions_count, 1);

        let list = context.action_list();
        let records = decode_action_list(&list, list.len()).unwrap();
        let decoded: Vec<Action> = records.iter().map(|r| r.action).collect();
        assert_eq!(decoded, actions);
    }

    #[test]
    fn test_config_streams_and_sizes() {
        let mut context = record(&[vec![64], vec![]]);
        assert_eq!(context.config_stream_indices(), [0]);
        assert!(context.config_resources(1).is_err());
        context.config_resources(0).unwrap().write(&[0; 64]).unwrap();
        assert_eq!(context.cfg_sizes(2), [64, 0]);
    }

    #[test]
    fn test_more_streams_than_channels_is_malformed() {
        let driver: Arc<dyn Driver> = Arc::new(SoftwareDriver::new());
        let cfg = [ChannelId::checked(0, 0).unwrap()];
        assert!(matches!(
            ContextRecord::new(&driver, ContextKind::Dynamic, &cfg, &[vec![8], vec![8]]),
            Err(VdmaError::Malformed { .. })
        ));
    }
}
