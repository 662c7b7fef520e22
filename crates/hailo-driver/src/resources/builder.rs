//! Assembly of a network group's firmware program
//!
//! Contexts are filled in the order firmware expects them:
//!
//! ```text
//! Preliminary ─▶ Dynamic[0] ─▶ ... ─▶ Dynamic[n-1] ─▶ BatchSwitching ─▶ Activation
//! ```
//!
//! A context with edge layers gets, in order: cfg channel activation, edge
//! activation (outputs before inputs, DDR before boundary before
//! inter-context), stream remapping, DDR pair info, cfg fetches, the
//! context's own actions, burst credits, cfg deactivation and finally the
//! end-of-context channel validation and deactivation runs.

use crate::action_list::{Action, EdgeLayerActivation};
use crate::config::ConfigureParams;
use crate::device::VdmaDevice;
use crate::error::{Result, VdmaError};
use crate::metadata::{ContextMetadata, LayerInfo, LayerKind, NetworkGroupMetadata};
use crate::resources::channel_table::{ChannelType, LayerRef};
use crate::resources::context::{ContextRecord, EdgeLayer, EdgeLayerType};
use crate::resources::ddr::DdrChannelsInfo;
use crate::resources::intermediate::IntermediateBufferKey;
use crate::resources::manager::ResourcesManager;
use hailo_chip::context::ContextKind;
use hailo_chip::vdma::Direction;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Longest run one repeated record may carry
const MAX_REPEATED_RUN: usize = u8::MAX as usize;

/// Build every resource of a network group and send its program to
/// firmware
///
/// # Errors
///
/// Any creation, mapping or control error; everything created so far is
/// released.
pub fn build(
    device: Arc<VdmaDevice>,
    params: ConfigureParams,
    metadata: Arc<NetworkGroupMetadata>,
    network_group_index: u8,
) -> Result<ResourcesManager> {
    let mut manager = ResourcesManager::create(device, params, Arc::clone(&metadata), network_group_index)?;

    for layer in metadata.boundary_layers() {
        manager.create_boundary_vdma_channel(layer)?;
    }

    // Run-asap groups start the first dynamic context's boundaries early
    let preliminary_edges: Vec<&LayerInfo> = if metadata.supported_features.preliminary_run_asap {
        metadata
            .dynamic_contexts
            .first()
            .map(|c| c.layers.iter().filter(|l| l.is_boundary()).collect())
            .unwrap_or_default()
    } else {
        Vec::new()
    };
    fill_context(
        &mut manager,
        &metadata,
        ContextKind::Preliminary,
        &metadata.preliminary_context,
        &preliminary_edges,
        0,
    )?;

    for (index, context) in metadata.dynamic_contexts.iter().enumerate() {
        let index = u8::try_from(index).map_err(|_| VdmaError::malformed("Too many dynamic contexts"))?;
        let layers: Vec<&LayerInfo> = context.layers.iter().collect();
        fill_context(&mut manager, &metadata, ContextKind::Dynamic, context, &layers, index)?;
    }

    fill_batch_switching_context(&mut manager, &metadata)?;
    fill_activation_context(&mut manager, &metadata)?;

    manager.create_internal_vdma_channels()?;
    manager.configure()?;
    Ok(manager)
}

fn push_context(manager: &mut ResourcesManager, kind: ContextKind, config_buffers: &[Vec<u32>]) -> Result<usize> {
    manager.add_new_context(kind, config_buffers)?;
    Ok(manager.contexts().len() - 1)
}

fn context(manager: &ResourcesManager, record_index: usize) -> Result<&ContextRecord> {
    manager
        .contexts()
        .get(record_index)
        .ok_or_else(|| VdmaError::not_found(format!("context {record_index}")))
}

fn fill_context(
    manager: &mut ResourcesManager,
    metadata: &NetworkGroupMetadata,
    kind: ContextKind,
    context_metadata: &ContextMetadata,
    layers: &[&LayerInfo],
    context_index: u8,
) -> Result<()> {
    let record_index = push_context(manager, kind, &context_metadata.config_buffers)?;

    // Outputs first: a DDR input needs the pair its output created
    let mut ordered = layers.to_vec();
    ordered.sort_by_key(|l| direction_rank(l.direction));
    let mut activations = Vec::with_capacity(ordered.len());
    for layer in ordered {
        let (layer_type, action) = map_edge_layer(manager, record_index, layer, context_index)?;
        activations.push((direction_rank(layer.direction), type_rank(layer_type), action));
    }
    activations.sort_by_key(|&(direction, layer_type, _)| (direction, layer_type));

    let cfg = process_config_writes(
        manager.context_mut(record_index)?,
        context_metadata,
        metadata.supported_features.cfg_prefetch,
    )?;

    let record = context(manager, record_index)?;
    let has_edges = !record.edge_layers().is_empty();
    let has_inputs = record.edge_layers().iter().any(|e| e.direction == Direction::H2D);

    let mut actions = cfg.activations;
    actions.extend(activations.into_iter().map(|(_, _, action)| action));
    if has_edges && metadata.dynamic_contexts.len() > 1 {
        actions.extend(stream_mapping_actions(manager, metadata, record)?);
    }
    actions.extend(ddr_pair_actions(record)?);
    actions.extend(cfg.fetches);
    actions.extend(context_metadata.actions.iter().copied());
    if has_inputs {
        actions.push(Action::BurstCreditsTaskStart);
    }
    actions.extend(cfg.deactivations);

    let validations: Vec<Action> = record
        .edge_layers()
        .iter()
        .filter(|e| e.layer_type == EdgeLayerType::Boundary)
        .map(|e| Action::ValidateVdmaChannel { channel: e.channel })
        .collect();
    let deactivations: Vec<Action> = record
        .edge_layers()
        .iter()
        .filter(|e| e.layer_type != EdgeLayerType::Boundary)
        .map(|e| Action::DeactivateVdmaChannel { channel: e.channel })
        .collect();

    let record = manager.context_mut(record_index)?;
    record.add_actions(&actions);
    add_grouped_runs(record, &validations)?;
    add_grouped_runs(record, &deactivations)?;
    tracing::debug!(
        "{kind:?} context {context_index}: {} edge layer(s), {} control(s)",
        record.edge_layers().len(),
        record.controls().len()
    );
    Ok(())
}

const fn direction_rank(direction: Direction) -> u8 {
    match direction {
        Direction::D2H => 0,
        _ => 1,
    }
}

const fn type_rank(layer_type: EdgeLayerType) -> u8 {
    match layer_type {
        EdgeLayerType::Ddr => 0,
        EdgeLayerType::Boundary => 1,
        EdgeLayerType::InterContext => 2,
    }
}

/// Assign the layer's channel and buffer; returns its activation action
fn map_edge_layer(
    manager: &mut ResourcesManager,
    record_index: usize,
    layer: &LayerInfo,
    context_index: u8,
) -> Result<(EdgeLayerType, Action)> {
    let stream = LayerRef {
        name: &layer.name,
        stream_index: layer.stream_index,
    };
    let is_output = layer.direction == Direction::D2H;

    let (layer_type, channel, host_buffer, credit) = match layer.kind {
        LayerKind::Boundary => {
            let channel = manager.boundary_channel(&layer.name)?;
            let host_buffer = channel.boundary_buffer_info(layer.frame_size)?;
            (EdgeLayerType::Boundary, channel.channel_id(), host_buffer, layer.frame_size)
        }
        LayerKind::InterContext {
            connected_context_index,
            connected_stream_index,
        } => {
            let channel = manager.get_available_channel_index(
                &[],
                ChannelType::InterContext,
                layer.direction,
                layer.engine_index,
                Some(stream),
            )?;
            let host_buffer = if is_output {
                manager
                    .create_inter_context_buffer(layer.frame_size, layer.stream_index, context_index, &layer.network_name)?
                    .host_buffer_info()
            } else {
                let key = IntermediateBufferKey {
                    src_stream_index: connected_stream_index,
                    src_context_index: connected_context_index,
                    partial_network_name: layer.network_name.clone(),
                    batch_size: manager.get_network_batch_size_from_partial_name(&layer.network_name)?,
                };
                manager.get_intermediate_buffer(&key)?.host_buffer_info()
            };
            (EdgeLayerType::InterContext, channel, host_buffer, layer.frame_size)
        }
        LayerKind::Ddr {
            connected_stream_index,
            row_size,
            min_buffered_rows,
            total_buffers_per_frame,
        } if is_output => {
            let d2h_channel = manager.get_available_channel_index(
                &[],
                ChannelType::Ddr,
                Direction::D2H,
                layer.engine_index,
                Some(stream),
            )?;
            let h2d_channel = manager.get_available_channel_index(
                &[],
                ChannelType::Ddr,
                Direction::H2D,
                layer.engine_index,
                Some(LayerRef {
                    name: &layer.name,
                    stream_index: connected_stream_index,
                }),
            )?;
            let info = manager.create_ddr_buffer(
                DdrChannelsInfo {
                    d2h_channel,
                    h2d_channel,
                    d2h_stream_index: layer.stream_index,
                    h2d_stream_index: connected_stream_index,
                    row_size,
                    min_buffered_rows,
                    total_buffers_per_frame,
                    desc_list_size_mask: 0,
                },
                record_index,
            )?;
            let host_buffer = context(manager, record_index)?
                .get_ddr_channels_pair(info.d2h_stream_index)
                .map(|pair| pair.host_buffer_info())
                .ok_or_else(|| VdmaError::not_found(format!("DDR pair of stream {}", info.d2h_stream_index)))?;
            (EdgeLayerType::Ddr, d2h_channel, host_buffer, row_size)
        }
        LayerKind::Ddr {
            connected_stream_index,
            row_size,
            ..
        } => {
            let record = context(manager, record_index)?;
            let Some(pair) = record.get_ddr_channels_pair(connected_stream_index) else {
                return Err(VdmaError::malformed(format!(
                    "DDR input {} has no DDR output on stream {connected_stream_index}",
                    layer.name
                )));
            };
            if pair.info().h2d_stream_index != layer.stream_index {
                return Err(VdmaError::malformed(format!(
                    "DDR input {} is stream {}, its pair expects stream {}",
                    layer.name,
                    layer.stream_index,
                    pair.info().h2d_stream_index
                )));
            }
            (EdgeLayerType::Ddr, pair.info().h2d_channel, pair.host_buffer_info(), row_size)
        }
    };

    manager.context_mut(record_index)?.add_edge_layer(EdgeLayer {
        name: layer.name.clone(),
        channel,
        stream_index: layer.stream_index,
        direction: layer.direction,
        layer_type,
    });

    let edge = EdgeLayerActivation {
        channel,
        stream_index: layer.stream_index,
        network_index: layer.network_index,
        host_buffer,
        credit,
    };
    let action = match (layer_type, is_output) {
        (EdgeLayerType::Boundary, true) => Action::ActivateBoundaryOutput(edge),
        (EdgeLayerType::Boundary, false) => Action::ActivateBoundaryInput(edge),
        (EdgeLayerType::InterContext, true) => Action::ActivateInterContextOutput(edge),
        (EdgeLayerType::InterContext, false) => Action::ActivateInterContextInput(edge),
        (EdgeLayerType::Ddr, true) => Action::ActivateDdrBufferOutput(edge),
        (EdgeLayerType::Ddr, false) => Action::ActivateDdrBufferInput(edge),
    };
    Ok((layer_type, action))
}

#[derive(Debug, Default)]
struct CfgProgram {
    activations: Vec<Action>,
    fetches: Vec<Action>,
    deactivations: Vec<Action>,
}

/// Write the context's CCWs and describe how firmware fetches them
///
/// Without prefetch every consecutive run of writes to one stream is closed
/// into descriptors and fetched; with prefetch each stream is padded,
/// programmed once and fetched as CCW bursts.
fn process_config_writes(
    record: &mut ContextRecord,
    context_metadata: &ContextMetadata,
    prefetch: bool,
) -> Result<CfgProgram> {
    let mut program = CfgProgram::default();
    let mut bursts: BTreeMap<u8, u16> = BTreeMap::new();
    let mut pending: Option<u8> = None;

    for write in &context_metadata.config_writes {
        let index = write.config_stream_index;
        if !prefetch {
            if let Some(previous) = pending.filter(|&p| p != index) {
                fetch_descriptors(record, previous, &mut program.fetches)?;
            }
        }
        record.config_resources(index)?.write(&write.data)?;
        let count = bursts.entry(index).or_default();
        *count = count.saturating_add(1);
        pending = Some(index);
    }

    if prefetch {
        for (&index, &ccw_bursts) in &bursts {
            let cfg = record.config_resources(index)?;
            cfg.pad_with_nops()?;
            cfg.program_descriptors()?;
            program.fetches.push(Action::FetchCcwBursts {
                config_stream_index: index,
                ccw_bursts,
            });
        }
    } else if let Some(previous) = pending {
        fetch_descriptors(record, previous, &mut program.fetches)?;
    }

    for (index, cfg) in record.config_streams() {
        program.activations.push(Action::ActivateCfgChannel {
            channel: cfg.channel_id(),
            config_stream_index: index,
            host_buffer: cfg.host_buffer_info(),
        });
        program.deactivations.push(Action::DeactivateCfgChannel {
            channel: cfg.channel_id(),
            config_stream_index: index,
        });
    }
    Ok(program)
}

fn fetch_descriptors(record: &mut ContextRecord, config_stream_index: u8, fetches: &mut Vec<Action>) -> Result<()> {
    let cfg = record.config_resources(config_stream_index)?;
    let desc_count = cfg.program_descriptors()?;
    fetches.push(Action::FetchCfgChannelDescriptors {
        channel: cfg.channel_id(),
        desc_count,
    });
    Ok(())
}

/// Point every boundary channel of the group at a stream of this context
///
/// Boundaries the context does not use are mapped to a dummy stream: the
/// first edge of the opposite direction (boundary, then inter-context,
/// then DDR).
fn stream_mapping_actions(
    manager: &ResourcesManager,
    metadata: &NetworkGroupMetadata,
    record: &ContextRecord,
) -> Result<Vec<Action>> {
    let edges = record.edge_layers();
    let mut actions = Vec::new();
    for layer in metadata.boundary_layers() {
        let channel = manager.boundary_channel(&layer.name)?.channel_id();
        let own = edges
            .iter()
            .find(|e| e.layer_type == EdgeLayerType::Boundary && e.name == layer.name);
        let action = if let Some(edge) = own {
            Action::ChangeVdmaToStreamMapping {
                channel,
                stream_index: edge.stream_index,
                is_dummy_stream: false,
            }
        } else {
            let dummy = [EdgeLayerType::Boundary, EdgeLayerType::InterContext, EdgeLayerType::Ddr]
                .iter()
                .find_map(|&t| edges.iter().find(|e| e.layer_type == t && e.direction != layer.direction))
                .ok_or_else(|| {
                    tracing::error!("Couldn't find dummy stream for {} in context", layer.name);
                    VdmaError::malformed(format!("No dummy stream for {}", layer.name))
                })?;
            Action::ChangeVdmaToStreamMapping {
                channel,
                stream_index: dummy.stream_index,
                is_dummy_stream: true,
            }
        };
        actions.push(action);
    }
    Ok(actions)
}

fn ddr_pair_actions(record: &ContextRecord) -> Result<Vec<Action>> {
    let mut actions = Vec::new();
    for pair in record.ddr_pairs() {
        let programmed_descs = u16::try_from(pair.descs_count()).map_err(|_| {
            VdmaError::invalid_operation(format!("DDR pair of {} descriptors cannot be described", pair.descs_count()))
        })?;
        actions.push(Action::AddDdrPairInfo {
            h2d: pair.info().h2d_channel,
            d2h: pair.info().d2h_channel,
            descriptors_per_frame: pair.descriptors_per_frame(),
            programmed_descs,
        });
    }
    if !actions.is_empty() {
        actions.push(Action::DdrBufferingStart);
    }
    Ok(actions)
}

/// Add consecutive same-typed actions as repeated records
fn add_grouped_runs(record: &mut ContextRecord, actions: &[Action]) -> Result<()> {
    for run in actions.chunk_by(|a, b| a.action_type() == b.action_type()) {
        for chunk in run.chunks(MAX_REPEATED_RUN) {
            record.add_repeated_actions(chunk)?;
        }
    }
    Ok(())
}

fn fill_batch_switching_context(manager: &mut ResourcesManager, metadata: &NetworkGroupMetadata) -> Result<()> {
    let record_index = push_context(manager, ContextKind::BatchSwitching, &[])?;
    let lcu_enables: Vec<Action> = metadata
        .preliminary_context
        .actions
        .iter()
        .filter(|a| matches!(a, Action::EnableLcuDefault { .. } | Action::EnableLcuNonDefault { .. }))
        .copied()
        .collect();

    let record = manager.context_mut(record_index)?;
    record.add_action(&Action::DdrBufferingReset);
    add_grouped_runs(record, &lcu_enables)
}

fn fill_activation_context(manager: &mut ResourcesManager, metadata: &NetworkGroupMetadata) -> Result<()> {
    let record_index = push_context(manager, ContextKind::Activation, &[])?;
    let mut actions = Vec::new();
    for direction in [Direction::D2H, Direction::H2D] {
        for layer in metadata.boundary_layers_in(direction) {
            let channel = manager.boundary_channel(&layer.name)?;
            let host_buffer = channel.boundary_buffer_info(layer.frame_size)?;
            let channel = channel.channel_id();
            actions.push(if direction == Direction::D2H {
                Action::OpenBoundaryOutputChannel { channel, host_buffer }
            } else {
                Action::OpenBoundaryInputChannel { channel, host_buffer }
            });
        }
    }
    manager.context_mut(record_index)?.add_actions(&actions);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_list::{decode_action_list, LcuId};
    use crate::config::NetworkParams;
    use crate::drivers::{DeviceEvent, SoftwareDriver};
    use crate::metadata::{ConfigChannelInfo, ConfigWrite};
    use hailo_chip::control::opcode;

    fn device() -> (Arc<SoftwareDriver>, Arc<VdmaDevice>) {
        let driver = Arc::new(SoftwareDriver::new());
        let device = Arc::new(VdmaDevice::from_driver(driver.clone(), "sim0"));
        (driver, device)
    }

    fn group(dynamic_contexts: Vec<ContextMetadata>) -> Arc<NetworkGroupMetadata> {
        Arc::new(NetworkGroupMetadata {
            network_group_name: "g".into(),
            network_names: vec!["g/net".into()],
            config_channels: vec![ConfigChannelInfo::default()],
            dynamic_contexts,
            ..NetworkGroupMetadata::default()
        })
    }

    fn context(layers: Vec<LayerInfo>) -> ContextMetadata {
        ContextMetadata {
            layers,
            ..ContextMetadata::default()
        }
    }

    fn actions_of(manager: &ResourcesManager, record_index: usize) -> Vec<Action> {
        let list = manager.contexts()[record_index].action_list();
        decode_action_list(&list, list.len())
            .unwrap()
            .into_iter()
            .map(|r| r.action)
            .collect()
    }

    fn input() -> LayerInfo {
        LayerInfo::boundary("in", "g/net", Direction::H2D, 0, 1024)
    }

    fn output() -> LayerInfo {
        LayerInfo::boundary("out", "g/net", Direction::D2H, 1, 1024)
    }

    #[test]
    fn test_single_context_program() {
        let (driver, device) = device();
        let manager = build(device, ConfigureParams::default(), group(vec![context(vec![input(), output()])]), 0).unwrap();

        let kinds: Vec<ContextKind> = manager.contexts().iter().map(ContextRecord::kind).collect();
        assert_eq!(
            kinds,
            [
                ContextKind::Preliminary,
                ContextKind::Dynamic,
                ContextKind::BatchSwitching,
                ContextKind::Activation
            ]
        );

        let dynamic = actions_of(&manager, 1);
        assert!(matches!(dynamic[0], Action::ActivateBoundaryOutput(e) if e.channel.channel_index == 16));
        assert!(matches!(dynamic[1], Action::ActivateBoundaryInput(e) if e.channel.channel_index == 1 && e.credit == 1024));
        assert_eq!(dynamic[2], Action::BurstCreditsTaskStart);
        // Single context: no remapping
        assert!(!dynamic.iter().any(|a| matches!(a, Action::ChangeVdmaToStreamMapping { .. })));
        let validated: Vec<u8> = dynamic[3..]
            .iter()
            .map(|a| match a {
                Action::ValidateVdmaChannel { channel } => channel.channel_index,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(validated, [16, 1]);

        let activation = actions_of(&manager, 3);
        assert!(matches!(activation[0], Action::OpenBoundaryOutputChannel { .. }));
        assert!(matches!(activation[1], Action::OpenBoundaryInputChannel { .. }));
        assert_eq!(actions_of(&manager, 2), [Action::DdrBufferingReset]);

        assert!(manager.is_configured());
        let controls = driver.events().iter().filter(|e| matches!(e, DeviceEvent::Control { .. })).count();
        // header plus one SET_CONTEXT_INFO per context
        assert_eq!(controls, 5);
        assert!(driver
            .events()
            .contains(&DeviceEvent::Control { opcode: opcode::SET_NETWORK_GROUP_HEADER }));
    }

    #[test]
    fn test_inter_context_buffers_chain_contexts() {
        let (_, device) = device();
        let inter_out = LayerInfo::boundary("ic_out", "g/net", Direction::D2H, 2, 512).with_kind(LayerKind::InterContext {
            connected_context_index: 0,
            connected_stream_index: 2,
        });
        let inter_in = LayerInfo::boundary("ic_in", "g/net", Direction::H2D, 3, 512)
            .with_kind(LayerKind::InterContext {
                connected_context_index: 0,
                connected_stream_index: 2,
            })
            .with_context_index(1);
        let metadata = group(vec![
            context(vec![input(), inter_out]),
            context(vec![inter_in, output().with_context_index(1)]),
        ]);
        let params = ConfigureParams::default().with_network("g/net", NetworkParams::default().with_batch_size(2));
        let manager = build(device, params, metadata, 0).unwrap();

        let key = IntermediateBufferKey {
            src_stream_index: 2,
            src_context_index: 0,
            partial_network_name: "g/net".into(),
            batch_size: 2,
        };
        let buffer = manager.get_intermediate_buffer(&key).unwrap();
        assert!(std::ptr::eq(buffer, manager.get_intermediate_buffer(&key).unwrap()));
        assert_eq!(manager.read_intermediate_buffer(&key).unwrap().len(), 1024);

        let first = actions_of(&manager, 1);
        let mappings: Vec<(u8, bool)> = first
            .iter()
            .filter_map(|a| match a {
                Action::ChangeVdmaToStreamMapping {
                    stream_index,
                    is_dummy_stream,
                    ..
                } => Some((*stream_index, *is_dummy_stream)),
                _ => None,
            })
            .collect();
        // "out" is not in this context and borrows the opposite-direction input
        assert_eq!(mappings, [(0, false), (0, true)]);
        assert!(first.contains(&Action::DeactivateVdmaChannel {
            channel: hailo_chip::vdma::ChannelId::checked(0, 17).unwrap()
        }));

        let second = actions_of(&manager, 2);
        let Action::ActivateBoundaryOutput(_) = second[0] else {
            panic!("outputs activate first: {:?}", second[0]);
        };
        assert!(matches!(second[1], Action::ActivateInterContextInput(e) if e.host_buffer == buffer.host_buffer_info()));
    }

    fn ddr_output() -> LayerInfo {
        LayerInfo::boundary("ddr_out", "g/net", Direction::D2H, 4, 512).with_kind(LayerKind::Ddr {
            connected_stream_index: 5,
            row_size: 512,
            min_buffered_rows: 4,
            total_buffers_per_frame: 2,
        })
    }

    fn ddr_input(stream_index: u8) -> LayerInfo {
        LayerInfo::boundary("ddr_in", "g/net", Direction::H2D, stream_index, 512).with_kind(LayerKind::Ddr {
            connected_stream_index: 4,
            row_size: 512,
            min_buffered_rows: 4,
            total_buffers_per_frame: 2,
        })
    }

    #[test]
    fn test_ddr_pair_program() {
        let (_, device) = device();
        let metadata = group(vec![context(vec![input(), ddr_input(5), output(), ddr_output()])]);
        let manager = build(device, ConfigureParams::default(), metadata, 0).unwrap();

        let dynamic = actions_of(&manager, 1);
        assert!(matches!(dynamic[0], Action::ActivateDdrBufferOutput(e) if e.credit == 512));
        assert!(matches!(dynamic[1], Action::ActivateBoundaryOutput(_)));
        assert!(matches!(dynamic[2], Action::ActivateDdrBufferInput(_)));
        assert!(matches!(dynamic[3], Action::ActivateBoundaryInput(_)));
        assert!(matches!(
            dynamic[4],
            Action::AddDdrPairInfo {
                descriptors_per_frame: 2,
                programmed_descs: 8,
                ..
            }
        ));
        assert_eq!(dynamic[5], Action::DdrBufferingStart);

        let pairs = manager.contexts()[1].ddr_pairs();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].info().desc_list_size_mask, 7);
        // both DDR channels are internal
        assert_eq!(manager.internal_channels().len(), 3);
    }

    #[test]
    fn test_ddr_input_without_output_is_malformed() {
        let (_, dev) = device();
        let metadata = group(vec![context(vec![input(), ddr_input(5)])]);
        assert!(matches!(
            build(dev, ConfigureParams::default(), metadata, 0),
            Err(VdmaError::Malformed { .. })
        ));

        let (_, device) = device();
        let metadata = group(vec![context(vec![ddr_output(), ddr_input(6)])]);
        assert!(matches!(
            build(device, ConfigureParams::default(), metadata, 0),
            Err(VdmaError::Malformed { .. })
        ));
    }

    #[test]
    fn test_cfg_writes_are_fetched() {
        let (_, device) = device();
        let mut metadata = (*group(vec![context(vec![input(), output()])])).clone();
        metadata.dynamic_contexts[0].config_buffers = vec![vec![64]];
        metadata.dynamic_contexts[0].config_writes = vec![ConfigWrite {
            config_stream_index: 0,
            data: vec![0x11; 64],
        }];
        let manager = build(device, ConfigureParams::default(), Arc::new(metadata), 0).unwrap();

        let dynamic = actions_of(&manager, 1);
        assert!(matches!(dynamic[0], Action::ActivateCfgChannel { config_stream_index: 0, host_buffer, .. } if host_buffer.bytes_in_pattern == 512));
        assert!(dynamic.contains(&Action::FetchCfgChannelDescriptors {
            channel: manager.cfg_channel_ids()[0],
            desc_count: 1
        }));
        assert!(dynamic.contains(&Action::DeactivateCfgChannel {
            channel: manager.cfg_channel_ids()[0],
            config_stream_index: 0
        }));
    }

    #[test]
    fn test_cfg_prefetch_fetches_bursts() {
        let (_, device) = device();
        let mut metadata = (*group(vec![context(vec![input(), output()])])).clone();
        metadata.supported_features.cfg_prefetch = true;
        metadata.dynamic_contexts[0].config_buffers = vec![vec![32, 32]];
        metadata.dynamic_contexts[0].config_writes = (0..2)
            .map(|_| ConfigWrite {
                config_stream_index: 0,
                data: vec![0x22; 32],
            })
            .collect();
        let manager = build(device, ConfigureParams::default(), Arc::new(metadata), 0).unwrap();

        assert!(actions_of(&manager, 1).contains(&Action::FetchCcwBursts {
            config_stream_index: 0,
            ccw_bursts: 2
        }));
        assert_eq!(manager.contexts()[1].cfg_sizes(1), [512]);
    }

    #[test]
    fn test_batch_switching_groups_lcu_enables() {
        let (_, device) = device();
        let mut metadata = (*group(vec![context(vec![input(), output()])])).clone();
        metadata.preliminary_context.actions = (0..3)
            .map(|lcu_index| Action::EnableLcuDefault {
                lcu: LcuId {
                    cluster_index: 0,
                    lcu_index,
                },
                network_index: 0,
            })
            .collect();
        let manager = build(device, ConfigureParams::default(), Arc::new(metadata), 0).unwrap();

        let record = &manager.contexts()[2];
        // reset plus one repeated record
        assert_eq!(record.controls()[0].actions_count, 2);
        assert_eq!(actions_of(&manager, 2).len(), 4);
    }
}
