//! Per-(device, network group) resources and firmware program
//!
//! The manager owns every channel, buffer and context record one configured
//! network group needs. It is built by [`build`](crate::resources::build),
//! which fills the contexts in firmware order and then calls
//! [`ResourcesManager::configure`].

use crate::config::{
    ConfigureParams, NetworkParams, PowerMode, DEFAULT_ACTUAL_BATCH_SIZE, DEFAULT_BATCH_SIZE, MAX_ACTIVE_TRANSFERS_SCALE,
    MAX_BATCH_SIZE, MIN_ACTIVE_TRANSFERS_SCALE,
};
use crate::control::DownloadedActionList;
use crate::device::VdmaDevice;
use crate::driver::Driver;
use crate::error::{Result, VdmaError};
use crate::metadata::{LayerInfo, NetworkGroupMetadata};
use crate::resources::channel_table::{ChannelTable, ChannelType, LayerRef};
use crate::resources::context::ContextRecord;
use crate::resources::ddr::{DdrChannelsInfo, DdrChannelsPair};
use crate::resources::intermediate::{InterContextBuffer, IntermediateBufferKey};
use crate::stream::{InputStream, OutputStream};
use crate::vdma::{desc_buffer_sizes_for_single_transfer, LatencyMeter, VdmaChannel};
use bytes::{BufMut, Bytes};
use hailo_chip::context::{ContextKind, MAX_CONTEXTS_PER_NETWORK_GROUP, NUMBER_OF_NON_DYNAMIC_CONTEXTS};
use hailo_chip::control::switch_status;
use hailo_chip::descriptor::{DmaType, DEFAULT_DESC_PAGE_SIZE};
use hailo_chip::vdma::{ChannelId, Direction};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stream index written for channels that serve no stream
const NO_STREAM_INDEX: u8 = 0xFF;

/// All resources of one configured network group
#[derive(Debug)]
pub struct ResourcesManager {
    device: Arc<VdmaDevice>,
    params: ConfigureParams,
    metadata: Arc<NetworkGroupMetadata>,
    network_group_index: u8,
    channels: ChannelTable,
    cfg_channel_ids: Vec<ChannelId>,
    boundary_channels: BTreeMap<String, Arc<VdmaChannel>>,
    internal_channels: Vec<Arc<VdmaChannel>>,
    intermediate_buffers: BTreeMap<IntermediateBufferKey, InterContextBuffer>,
    contexts: Vec<ContextRecord>,
    dynamic_context_count: u8,
    network_index_map: Vec<String>,
    latency_meters: BTreeMap<String, Arc<LatencyMeter>>,
    is_configured: bool,
}

impl ResourcesManager {
    /// Validate parameters, assign the cfg channels and set up latency
    /// meters
    ///
    /// Networks of the group missing from `params` get the default
    /// parameters.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a batch above [`MAX_BATCH_SIZE`], `NotFound`
    /// for a parameter naming an unknown network, `Malformed` for too many
    /// contexts, `ResourceExhausted` when the cfg channels do not fit.
    pub fn create(
        device: Arc<VdmaDevice>,
        mut params: ConfigureParams,
        metadata: Arc<NetworkGroupMetadata>,
        network_group_index: u8,
    ) -> Result<Self> {
        let contexts_count = metadata.dynamic_contexts.len() + NUMBER_OF_NON_DYNAMIC_CONTEXTS;
        if contexts_count > MAX_CONTEXTS_PER_NETWORK_GROUP {
            return Err(VdmaError::malformed(format!(
                "Network group {} has more contexts than allowed ({contexts_count} > {MAX_CONTEXTS_PER_NETWORK_GROUP})",
                metadata.network_group_name
            )));
        }
        for (name, network) in &params.network_params_by_name {
            if network.batch_size > MAX_BATCH_SIZE {
                return Err(VdmaError::invalid_argument(format!(
                    "Batch size {} of network {name} exceeds the maximum ({MAX_BATCH_SIZE})",
                    network.batch_size
                )));
            }
            if metadata.network_index(name).is_none() {
                tracing::error!("Network {name} is not part of network group {}", metadata.network_group_name);
                return Err(VdmaError::not_found(format!("network {name}")));
            }
        }
        for name in &metadata.network_names {
            params
                .network_params_by_name
                .entry(name.clone())
                .or_insert_with(NetworkParams::default);
        }

        let driver = Arc::clone(device.driver());
        let mut channels = ChannelTable::new(driver.dma_engines_count());
        let mut cfg_channel_ids = Vec::with_capacity(metadata.config_channels.len());
        for cfg in &metadata.config_channels {
            let engine_index = engine_for(driver.as_ref(), cfg.engine_index);
            cfg_channel_ids.push(channels.get_available_channel_index(
                &[],
                ChannelType::Cfg,
                Direction::H2D,
                engine_index,
                None,
            )?);
        }

        let latency_meters = if params.latency.is_enabled() {
            create_latency_meters(&metadata)
        } else {
            BTreeMap::new()
        };

        tracing::info!(
            "Network group {} (index {network_group_index}): {} network(s), {} dynamic context(s), {} cfg channel(s)",
            metadata.network_group_name,
            metadata.network_names.len(),
            metadata.dynamic_contexts.len(),
            cfg_channel_ids.len()
        );

        Ok(Self {
            network_index_map: metadata.network_names.clone(),
            device,
            params,
            metadata,
            network_group_index,
            channels,
            cfg_channel_ids,
            boundary_channels: BTreeMap::new(),
            internal_channels: Vec::new(),
            intermediate_buffers: BTreeMap::new(),
            contexts: Vec::new(),
            dynamic_context_count: 0,
            latency_meters,
            is_configured: false,
        })
    }

    /// Device the group is configured on
    pub const fn device(&self) -> &Arc<VdmaDevice> {
        &self.device
    }

    fn driver(&self) -> &Arc<dyn Driver> {
        self.device.driver()
    }

    /// Network-group description
    pub fn metadata(&self) -> &NetworkGroupMetadata {
        &self.metadata
    }

    /// Index of the group on the device
    pub const fn network_group_index(&self) -> u8 {
        self.network_group_index
    }

    /// Configured power mode
    pub const fn power_mode(&self) -> PowerMode {
        self.params.power_mode
    }

    /// Parameters the group was configured with, defaults filled in
    pub const fn params(&self) -> &ConfigureParams {
        &self.params
    }

    /// Channel assignment table
    pub const fn channel_table(&self) -> &ChannelTable {
        &self.channels
    }

    /// Cfg channel of each config stream
    pub fn cfg_channel_ids(&self) -> &[ChannelId] {
        &self.cfg_channel_ids
    }

    /// Latency meter of a network, when measurement is enabled
    pub fn latency_meter(&self, network_name: &str) -> Option<Arc<LatencyMeter>> {
        self.latency_meters.get(network_name).cloned()
    }

    /// Assign a channel; engines collapse to 0 on PCIe devices
    ///
    /// # Errors
    ///
    /// See [`ChannelTable::get_available_channel_index`].
    pub fn get_available_channel_index(
        &mut self,
        blacklist: &[u8],
        required_type: ChannelType,
        direction: Direction,
        engine_index: u8,
        layer: Option<LayerRef<'_>>,
    ) -> Result<ChannelId> {
        let engine_index = engine_for(self.driver().as_ref(), engine_index);
        self.channels
            .get_available_channel_index(blacklist, required_type, direction, engine_index, layer)
    }

    /// Batch size of a network; the default batch resolves to 1
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown network.
    pub fn get_network_batch_size(&self, network_name: &str) -> Result<u16> {
        let Some(params) = self.params.network_params_by_name.get(network_name) else {
            tracing::error!("Failed to find network with network name {network_name}");
            return Err(VdmaError::not_found(format!("network {network_name}")));
        };
        Ok(if params.batch_size == DEFAULT_BATCH_SIZE {
            DEFAULT_ACTUAL_BATCH_SIZE
        } else {
            params.batch_size
        })
    }

    /// Batch size of the one network whose name is `partial_name` or ends
    /// with `/partial_name`
    ///
    /// # Errors
    ///
    /// `InvalidArgument` listing the candidates when no network or more
    /// than one matches.
    pub fn get_network_batch_size_from_partial_name(&self, partial_name: &str) -> Result<u16> {
        let suffix = format!("/{partial_name}");
        let matches: Vec<String> = self
            .network_index_map
            .iter()
            .filter(|name| *name == partial_name || name.ends_with(&suffix))
            .cloned()
            .collect();
        match matches.as_slice() {
            [name] => self.get_network_batch_size(name),
            [] => Err(VdmaError::ambiguous(
                format!("No network matches {partial_name}"),
                self.network_index_map.clone(),
            )),
            _ => Err(VdmaError::ambiguous(
                format!("Network name {partial_name} is ambiguous"),
                matches,
            )),
        }
    }

    /// Assign and allocate the channel of a boundary layer
    ///
    /// The descriptor list holds between 2 and 4 batches of frames.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a batch too large to size, or the assignment,
    /// sizing or allocation error.
    pub fn create_boundary_vdma_channel(&mut self, layer: &LayerInfo) -> Result<()> {
        let channel_id = self.get_available_channel_index(
            &[],
            ChannelType::Boundary,
            layer.direction,
            layer.engine_index,
            Some(LayerRef {
                name: &layer.name,
                stream_index: layer.stream_index,
            }),
        )?;
        let batch_size = self.get_network_batch_size(&layer.network_name)?;
        let (min_active, max_active) = (
            batch_size.checked_mul(MIN_ACTIVE_TRANSFERS_SCALE),
            batch_size.checked_mul(MAX_ACTIVE_TRANSFERS_SCALE),
        );
        let (Some(min_active), Some(max_active)) = (min_active, max_active) else {
            return Err(VdmaError::invalid_argument(format!(
                "Active transfers for batch {batch_size} are out of range"
            )));
        };

        let (page_size, desc_count) =
            desc_buffer_sizes_for_single_transfer(self.driver().as_ref(), min_active, max_active, layer.frame_size)?;
        let channel = VdmaChannel::create(
            channel_id,
            layer.direction,
            self.driver(),
            page_size,
            layer.name.clone(),
            self.latency_meter(&layer.network_name),
            batch_size,
        )?;
        channel.allocate_resources(desc_count)?;
        tracing::debug!("Boundary {} stream {}: channel {channel_id}", layer.direction, layer.name);
        self.boundary_channels.insert(layer.name.clone(), Arc::new(channel));
        Ok(())
    }

    /// Channel of a boundary stream
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown stream.
    pub fn boundary_channel(&self, stream_name: &str) -> Result<Arc<VdmaChannel>> {
        self.boundary_channels
            .get(stream_name)
            .cloned()
            .ok_or_else(|| VdmaError::not_found(format!("boundary channel of {stream_name}")))
    }

    /// Input stream of a boundary layer, with its configured timeout and
    /// its network's batch size
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown stream, `InvalidArgument` for an output.
    pub fn input_stream(&self, stream_name: &str) -> Result<InputStream> {
        let layer = self.metadata.boundary_layer(stream_name)?;
        InputStream::new(
            self.boundary_channel(stream_name)?,
            layer.frame_size,
            self.get_network_batch_size(&layer.network_name)?,
            self.params.stream_params(stream_name).timeout(),
        )
    }

    /// Output stream of a boundary layer; see [`input_stream`](Self::input_stream)
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown stream, `InvalidArgument` for an input.
    pub fn output_stream(&self, stream_name: &str) -> Result<OutputStream> {
        let layer = self.metadata.boundary_layer(stream_name)?;
        OutputStream::new(
            self.boundary_channel(stream_name)?,
            layer.frame_size,
            self.get_network_batch_size(&layer.network_name)?,
            self.params.stream_params(stream_name).timeout(),
        )
    }

    /// Boundary channels by stream name
    pub fn boundary_channels(&self) -> impl Iterator<Item = (&str, &Arc<VdmaChannel>)> {
        self.boundary_channels.iter().map(|(name, channel)| (name.as_str(), channel))
    }

    /// Create, or return the existing, buffer produced by one stream of
    /// one context
    ///
    /// # Errors
    ///
    /// The batch lookup error, or the allocation error.
    pub fn create_inter_context_buffer(
        &mut self,
        transfer_size: u32,
        src_stream_index: u8,
        src_context_index: u8,
        partial_network_name: &str,
    ) -> Result<&InterContextBuffer> {
        let batch_size = self.get_network_batch_size_from_partial_name(partial_network_name)?;
        let key = IntermediateBufferKey {
            src_stream_index,
            src_context_index,
            partial_network_name: partial_network_name.to_owned(),
            batch_size,
        };
        if !self.intermediate_buffers.contains_key(&key) {
            let buffer = InterContextBuffer::create(self.driver(), transfer_size, batch_size)?;
            tracing::debug!(
                "Inter-context buffer ctx {src_context_index} stream {src_stream_index}: {transfer_size} x {batch_size}"
            );
            self.intermediate_buffers.insert(key.clone(), buffer);
        }
        self.get_intermediate_buffer(&key)
    }

    /// Look up an intermediate buffer
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown key.
    pub fn get_intermediate_buffer(&self, key: &IntermediateBufferKey) -> Result<&InterContextBuffer> {
        self.intermediate_buffers.get(key).ok_or_else(|| {
            VdmaError::not_found(format!(
                "intermediate buffer of context {} stream {}",
                key.src_context_index, key.src_stream_index
            ))
        })
    }

    /// Snapshot an intermediate buffer, or the DDR pair whose D2H side is
    /// `key.src_stream_index` in dynamic context `key.src_context_index`
    ///
    /// # Errors
    ///
    /// `NotFound` when neither exists, or the sync error.
    pub fn read_intermediate_buffer(&self, key: &IntermediateBufferKey) -> Result<Bytes> {
        if let Some(buffer) = self.intermediate_buffers.get(key) {
            return buffer.read();
        }
        let pair = self
            .contexts
            .iter()
            .filter(|c| c.kind() == ContextKind::Dynamic)
            .nth(usize::from(key.src_context_index))
            .and_then(|c| c.get_ddr_channels_pair(key.src_stream_index));
        match pair {
            Some(pair) => pair.read(),
            None => {
                tracing::error!(
                    "Failed to find intermediate buffer for src_context {}, src_stream_index {}",
                    key.src_context_index,
                    key.src_stream_index
                );
                Err(VdmaError::not_found(format!(
                    "intermediate buffer of context {} stream {}",
                    key.src_context_index, key.src_stream_index
                )))
            }
        }
    }

    /// Move every intermediate buffer's end-of-batch interrupt
    ///
    /// # Errors
    ///
    /// `InvalidArgument` above a buffer's batch.
    pub fn set_inter_context_channels_dynamic_batch_size(&mut self, dynamic_batch_size: u16) -> Result<()> {
        for buffer in self.intermediate_buffers.values_mut() {
            buffer.reprogram(dynamic_batch_size)?;
        }
        Ok(())
    }

    /// Build a DDR pair on the channels in `info` and hand it to context
    /// record `context_index`; returns the completed info
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown record, or the channel/buffer error.
    pub fn create_ddr_buffer(&mut self, info: DdrChannelsInfo, context_index: usize) -> Result<DdrChannelsInfo> {
        if context_index >= self.contexts.len() {
            return Err(VdmaError::not_found(format!("context {context_index}")));
        }
        let name = format!("ddr-{}", info.d2h_stream_index);
        let d2h = Arc::new(VdmaChannel::create(
            info.d2h_channel,
            Direction::D2H,
            self.driver(),
            DEFAULT_DESC_PAGE_SIZE,
            name.clone(),
            None,
            1,
        )?);
        let h2d = Arc::new(VdmaChannel::create(
            info.h2d_channel,
            Direction::H2D,
            self.driver(),
            DEFAULT_DESC_PAGE_SIZE,
            name,
            None,
            1,
        )?);
        let pair = DdrChannelsPair::create(self.driver(), info, Arc::clone(&d2h), Arc::clone(&h2d))?;
        let info = *pair.info();
        self.internal_channels.push(d2h);
        self.internal_channels.push(h2d);
        self.contexts[context_index].add_ddr_pair(pair);
        Ok(info)
    }

    fn ddr_pairs_mut(&mut self) -> impl Iterator<Item = &mut DdrChannelsPair> {
        self.contexts.iter_mut().flat_map(|c| c.ddr_pairs_mut().iter_mut())
    }

    /// Start a drain thread per DDR pair
    ///
    /// # Errors
    ///
    /// The first open error; pairs opened before it stay open.
    pub fn open_ddr_channels(&mut self) -> Result<()> {
        for pair in self.ddr_pairs_mut() {
            pair.open()?;
        }
        Ok(())
    }

    /// Stop and join every drain thread
    pub fn close_ddr_channels(&mut self) {
        for pair in self.ddr_pairs_mut() {
            pair.close();
        }
    }

    /// Abort both channels of every DDR pair
    ///
    /// # Errors
    ///
    /// The first abort error; every pair is attempted.
    pub fn abort_ddr_channels(&self) -> Result<()> {
        let mut result = Ok(());
        for pair in self.contexts.iter().flat_map(ContextRecord::ddr_pairs) {
            let status = pair.abort();
            if result.is_ok() {
                result = status;
            }
        }
        result
    }

    /// Create channel objects for the assigned cfg and inter-context
    /// channels; DDR channels already exist
    ///
    /// # Errors
    ///
    /// The channel creation error.
    pub fn create_internal_vdma_channels(&mut self) -> Result<()> {
        let driver = Arc::clone(self.driver());
        let mut created = Vec::new();
        for (channel_id, info) in self.channels.assigned() {
            let Some(channel_type) = info.channel_type else {
                continue;
            };
            if !matches!(channel_type, ChannelType::Cfg | ChannelType::InterContext) {
                continue;
            }
            let Some(direction) = channel_id.direction() else {
                continue;
            };
            let name = info
                .layer_name
                .clone()
                .unwrap_or_else(|| format!("cfg-{}", channel_id.channel_index));
            created.push(Arc::new(VdmaChannel::create(
                channel_id,
                direction,
                &driver,
                DEFAULT_DESC_PAGE_SIZE,
                name,
                None,
                1,
            )?));
        }
        tracing::debug!("Created {} internal channel(s)", created.len());
        self.internal_channels.extend(created);
        Ok(())
    }

    /// Channels firmware drives on its own
    pub fn internal_channels(&self) -> &[Arc<VdmaChannel>] {
        &self.internal_channels
    }

    /// Append a context record
    ///
    /// Kinds must come in firmware order: preliminary, dynamic contexts,
    /// batch switching, activation.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for an out-of-order or repeated kind or past
    /// [`MAX_CONTEXTS_PER_NETWORK_GROUP`] records, or the config buffer
    /// error.
    pub fn add_new_context(&mut self, kind: ContextKind, config_buffers: &[Vec<u32>]) -> Result<&mut ContextRecord> {
        if self.contexts.len() >= MAX_CONTEXTS_PER_NETWORK_GROUP {
            return Err(VdmaError::invalid_operation(format!(
                "Network group already has {MAX_CONTEXTS_PER_NETWORK_GROUP} contexts"
            )));
        }
        if let Some(last) = self.contexts.last().map(ContextRecord::kind) {
            let out_of_order = kind.rank() < last.rank() || (kind == last && !kind.is_repeatable());
            if out_of_order {
                return Err(VdmaError::invalid_operation(format!(
                    "{kind:?} context cannot follow a {last:?} context"
                )));
            }
        }

        let record = ContextRecord::new(self.driver(), kind, &self.cfg_channel_ids, config_buffers)?;
        if kind == ContextKind::Dynamic {
            self.dynamic_context_count += 1;
        }
        self.contexts.push(record);
        let index = self.contexts.len() - 1;
        Ok(&mut self.contexts[index])
    }

    /// Context records in firmware order
    pub fn contexts(&self) -> &[ContextRecord] {
        &self.contexts
    }

    pub(crate) fn context_mut(&mut self, index: usize) -> Result<&mut ContextRecord> {
        self.contexts
            .get_mut(index)
            .ok_or_else(|| VdmaError::not_found(format!("context {index}")))
    }

    /// Serialize the network-group header
    ///
    /// ```text
    /// u8  dynamic_contexts_count
    /// u8  preliminary_run_asap
    /// u8  is_abbale_supported (0)
    /// u8  power_mode
    /// u8  networks_count, then u16 batch size per network (index order)
    /// u8  channels_count, then {u8 packed id, u8 type, u8 stream index} each
    /// u8  contexts_count, then {u8 kind, u8 cfg streams, u32 cfg size each}
    /// ```
    ///
    /// # Errors
    ///
    /// The batch lookup error, or `InvalidOperation` when a count does
    /// not fit a byte.
    pub fn get_control_network_group_header(&self) -> Result<Vec<u8>> {
        let count = |n: usize, what: &str| {
            u8::try_from(n).map_err(|_| VdmaError::invalid_operation(format!("{n} {what} do not fit the header")))
        };

        let mut header = Vec::new();
        header.put_u8(self.dynamic_context_count);
        header.put_u8(u8::from(self.metadata.supported_features.preliminary_run_asap));
        header.put_u8(0);
        header.put_u8(match self.params.power_mode {
            PowerMode::Performance => 0,
            PowerMode::UltraPerformance => 1,
        });

        header.put_u8(count(self.network_index_map.len(), "networks")?);
        for name in &self.network_index_map {
            header.put_u16_le(self.get_network_batch_size(name)?);
        }

        let assigned: Vec<_> = self.channels.assigned().collect();
        header.put_u8(count(assigned.len(), "channels")?);
        for (channel_id, info) in assigned {
            header.put_u8(channel_id.pack());
            header.put_u8(info.channel_type.map_or(0xFF, ChannelType::as_u8));
            header.put_u8(info.stream_index.unwrap_or(NO_STREAM_INDEX));
        }

        let streams = self.cfg_channel_ids.len();
        header.put_u8(count(self.contexts.len(), "contexts")?);
        for context in &self.contexts {
            header.put_u8(context.kind().as_u8());
            header.put_u8(count(streams, "cfg streams")?);
            for size in context.cfg_sizes(streams) {
                header.put_u32_le(size);
            }
        }
        Ok(header)
    }

    /// Send the header and every context program to firmware, once
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when already configured, or the control error.
    pub fn configure(&mut self) -> Result<()> {
        if self.is_configured {
            return Err(VdmaError::invalid_operation("Can't configure the same network group twice"));
        }
        self.is_configured = true;

        let header = self.get_control_network_group_header()?;
        let control = self.device.control();
        control.set_network_group_header(&header)?;
        for context in &self.contexts {
            control.set_context_info(context.kind(), context.controls())?;
        }
        tracing::info!(
            "Configured network group {} with {} context(s)",
            self.metadata.network_group_name,
            self.contexts.len()
        );
        Ok(())
    }

    /// Whether [`configure`](Self::configure) ran
    pub const fn is_configured(&self) -> bool {
        self.is_configured
    }

    /// Start the context-switch state machine
    ///
    /// # Errors
    ///
    /// Returns the control error.
    pub fn enable_state_machine(&self, dynamic_batch_size: u16) -> Result<()> {
        self.device.control().change_context_switch_status(
            switch_status::ENABLED,
            self.network_group_index,
            dynamic_batch_size,
            false,
        )
    }

    /// Reset the context-switch state machine
    ///
    /// Without `keep_nn_config`, the nn core of DRAM-DMA devices is reset
    /// as well.
    ///
    /// # Errors
    ///
    /// Returns the control or reset error.
    pub fn reset_state_machine(&self, keep_nn_config: bool) -> Result<()> {
        self.device.control().change_context_switch_status(
            switch_status::RESET,
            self.network_group_index,
            0,
            keep_nn_config,
        )?;
        if !keep_nn_config && self.driver().dma_type() == DmaType::Dram {
            self.device.reset_nn_core()?;
        }
        Ok(())
    }

    /// Enable every internal channel and every boundary channel on behalf
    /// of firmware
    ///
    /// # Errors
    ///
    /// The first enable error.
    pub fn register_fw_managed_vdma_channels(&self) -> Result<()> {
        for channel in self.internal_channels.iter().chain(self.boundary_channels.values()) {
            channel.register_fw_controlled_channel()?;
        }
        Ok(())
    }

    /// Disable the internal channels, and any boundary channel no stream
    /// stopped
    ///
    /// # Errors
    ///
    /// The first disable error; every channel is attempted.
    pub fn unregister_fw_managed_vdma_channels(&self) -> Result<()> {
        let mut result = Ok(());
        let stragglers = self.boundary_channels.values().filter(|c| c.is_enabled());
        for channel in self.internal_channels.iter().chain(stragglers) {
            let status = channel.disable();
            if result.is_ok() {
                result = status;
            }
        }
        result
    }

    /// Download the action list firmware holds for one context
    ///
    /// `context_index` counts contexts of `kind`.
    ///
    /// # Errors
    ///
    /// Returns the control error.
    pub fn download_context_action_list(&self, kind: ContextKind, context_index: u8) -> Result<DownloadedActionList> {
        self.device.control().download_context_action_list(
            u32::from(self.network_group_index),
            kind,
            context_index,
        )
    }
}

fn engine_for(driver: &dyn Driver, engine_index: u8) -> u8 {
    // PCIe devices expose a single engine
    if driver.dma_type() == DmaType::Pcie {
        0
    } else {
        engine_index
    }
}

/// A meter per network with a single input; others are skipped
fn create_latency_meters(metadata: &NetworkGroupMetadata) -> BTreeMap<String, Arc<LatencyMeter>> {
    let layers = metadata.boundary_layers();
    let mut meters = BTreeMap::new();
    for network in &metadata.network_names {
        let of_network = || layers.iter().filter(move |l| &l.network_name == network);
        let inputs = of_network().filter(|l| l.direction == Direction::H2D).count();
        if inputs > 1 {
            tracing::warn!("Latency measurement of {network} needs a single input, found {inputs}");
            continue;
        }
        let outputs = of_network()
            .filter(|l| l.direction == Direction::D2H)
            .map(|l| l.name.clone());
        meters.insert(network.clone(), Arc::new(LatencyMeter::new(outputs)));
        tracing::debug!("Starting latency measurement for network {network}");
    }
    meters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LatencyMeasurement;
    use crate::drivers::SoftwareDriver;
    use crate::metadata::{ConfigChannelInfo, ContextMetadata};

    fn device() -> Arc<VdmaDevice> {
        Arc::new(VdmaDevice::from_driver(Arc::new(SoftwareDriver::new()), "sim0"))
    }

    fn metadata(networks: &[&str]) -> Arc<NetworkGroupMetadata> {
        let layers = networks
            .iter()
            .enumerate()
            .flat_map(|(i, net)| {
                let i = u8::try_from(i).unwrap();
                [
                    LayerInfo::boundary(format!("{net}/in"), *net, Direction::H2D, i, 1024),
                    LayerInfo::boundary(format!("{net}/out"), *net, Direction::D2H, i + 8, 1024),
                ]
            })
            .collect();
        Arc::new(NetworkGroupMetadata {
            network_group_name: "g".into(),
            network_names: networks.iter().map(|n| (*n).to_owned()).collect(),
            config_channels: vec![ConfigChannelInfo::default()],
            dynamic_contexts: vec![ContextMetadata {
                layers,
                ..ContextMetadata::default()
            }],
            ..NetworkGroupMetadata::default()
        })
    }

    fn manager(params: ConfigureParams) -> ResourcesManager {
        ResourcesManager::create(device(), params, metadata(&["g/net_a", "g/net_b"]), 0).unwrap()
    }

    #[test]
    fn test_batch_sizes_resolve_defaults() {
        let params = ConfigureParams::default().with_network("g/net_a", NetworkParams::default().with_batch_size(4));
        let manager = manager(params);
        assert_eq!(manager.get_network_batch_size("g/net_a").unwrap(), 4);
        assert_eq!(manager.get_network_batch_size("g/net_b").unwrap(), 1);
        assert!(matches!(
            manager.get_network_batch_size("g/net_c"),
            Err(VdmaError::NotFound { .. })
        ));
    }

    #[test]
    fn test_create_rejects_bad_params() {
        let too_big = ConfigureParams::default()
            .with_network("g/net_a", NetworkParams::default().with_batch_size(MAX_BATCH_SIZE + 1));
        assert!(matches!(
            ResourcesManager::create(device(), too_big, metadata(&["g/net_a"]), 0),
            Err(VdmaError::InvalidArgument { .. })
        ));
        let unknown = ConfigureParams::default().with_network("g/other", NetworkParams::default());
        assert!(matches!(
            ResourcesManager::create(device(), unknown, metadata(&["g/net_a"]), 0),
            Err(VdmaError::NotFound { .. })
        ));
    }

    #[test]
    fn test_partial_name_lookup() {
        let manager = manager(ConfigureParams::default().with_network(
            "g/net_b",
            NetworkParams::default().with_batch_size(2),
        ));
        assert_eq!(manager.get_network_batch_size_from_partial_name("net_b").unwrap(), 2);
        assert_eq!(manager.get_network_batch_size_from_partial_name("g/net_b").unwrap(), 2);

        match manager.get_network_batch_size_from_partial_name("missing") {
            Err(VdmaError::InvalidArgument { candidates, .. }) => assert_eq!(candidates, ["g/net_a", "g/net_b"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_partial_name_ambiguity_lists_matches() {
        let device = device();
        let metadata = Arc::new(NetworkGroupMetadata {
            network_names: vec!["a/net".into(), "b/net".into(), "c/other".into()],
            ..NetworkGroupMetadata::default()
        });
        let manager = ResourcesManager::create(device, ConfigureParams::default(), metadata, 0).unwrap();
        match manager.get_network_batch_size_from_partial_name("net") {
            Err(VdmaError::InvalidArgument { candidates, .. }) => assert_eq!(candidates, ["a/net", "b/net"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cfg_channels_are_assigned_first() {
        let manager = manager(ConfigureParams::default());
        assert_eq!(manager.cfg_channel_ids(), [ChannelId::checked(0, 0).unwrap()]);
    }

    #[test]
    fn test_boundary_channel_sizing() {
        let mut manager = manager(
            ConfigureParams::default().with_network("g/net_a", NetworkParams::default().with_batch_size(4)),
        );
        let layer = manager.metadata().boundary_layer("g/net_a/out").unwrap().clone();
        manager.create_boundary_vdma_channel(&layer).unwrap();
        let channel = manager.boundary_channel("g/net_a/out").unwrap();
        assert_eq!(channel.channel_id().channel_index, 16);
        assert_eq!(channel.page_size(), 512);
        // 2 descs per frame x 16 active transfers + 1, rounded up
        assert_eq!(channel.buffer_size().unwrap(), 64 * 512);
        assert!(manager.boundary_channel("nope").is_err());
    }

    #[test]
    fn test_context_order_is_enforced() {
        let mut manager = manager(ConfigureParams::default());
        manager.add_new_context(ContextKind::Preliminary, &[]).unwrap();
        manager.add_new_context(ContextKind::Dynamic, &[]).unwrap();
        manager.add_new_context(ContextKind::Dynamic, &[]).unwrap();
        assert!(manager.add_new_context(ContextKind::Preliminary, &[]).is_err());
        manager.add_new_context(ContextKind::BatchSwitching, &[]).unwrap();
        assert!(manager.add_new_context(ContextKind::BatchSwitching, &[]).is_err());
        manager.add_new_context(ContextKind::Activation, &[]).unwrap();
        assert!(manager.add_new_context(ContextKind::Dynamic, &[]).is_err());
        assert_eq!(manager.contexts().len(), 5);
    }

    #[test]
    fn test_header_layout() {
        let mut manager = manager(
            ConfigureParams::default()
                .with_network("g/net_a", NetworkParams::default().with_batch_size(3))
                .with_power_mode(PowerMode::UltraPerformance),
        );
        manager.add_new_context(ContextKind::Preliminary, &[vec![64]]).unwrap();
        manager.add_new_context(ContextKind::Dynamic, &[]).unwrap();

        let header = manager.get_control_network_group_header().unwrap();
        let expected = [
            1, 0, 0, 1, // dynamic contexts, run asap, abbale, power mode
            2, 3, 0, 1, 0, // networks and their batches
            1, 0, 3, 0xFF, // the cfg channel
            2, // contexts
            2, 1, 64, 0, 0, 0, // preliminary: one 64-byte stream
            3, 1, 0, 0, 0, 0, // dynamic: no config stream
        ];
        assert_eq!(header, expected);
    }

    #[test]
    fn test_configure_only_once() {
        let mut manager = manager(ConfigureParams::default());
        manager.add_new_context(ContextKind::Dynamic, &[]).unwrap();
        manager.configure().unwrap();
        assert!(manager.is_configured());
        assert!(matches!(manager.configure(), Err(VdmaError::InvalidOperation { .. })));
    }

    #[test]
    fn test_latency_meters_follow_params() {
        let without = manager(ConfigureParams::default());
        assert!(without.latency_meter("g/net_a").is_none());
        let with = manager(ConfigureParams::default().with_latency(LatencyMeasurement::Measure));
        assert!(with.latency_meter("g/net_a").is_some());
    }
}
