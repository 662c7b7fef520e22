//! Network-group description consumed at configuration time
//!
//! These structs are the output of model-file parsing, which lives outside
//! this crate. Layer names are unique within a network group; network names
//! are full names (`group/network`).

use crate::action_list::Action;
use crate::error::{Result, VdmaError};
use hailo_chip::vdma::Direction;

/// Role of a layer's edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Tensor exchanged with the host
    Boundary,
    /// Output of one context read by a later one. Inputs name the
    /// producing context and stream; outputs name themselves.
    InterContext {
        /// Producing context index
        connected_context_index: u8,
        /// Producing stream index
        connected_stream_index: u8,
    },
    /// Row-buffered tensor looped through host memory within one context
    Ddr {
        /// Stream on the other end of the loop
        connected_stream_index: u8,
        /// Bytes per row; a multiple of the descriptor page size
        row_size: u32,
        /// Rows buffered in host memory
        min_buffered_rows: u16,
        /// Rows per frame
        total_buffers_per_frame: u16,
    },
}

/// One edge layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    /// Stream name
    pub name: String,
    /// Full name of the owning network
    pub network_name: String,
    /// Index of the owning network in the group
    pub network_index: u8,
    /// H2D for inputs, D2H for outputs
    pub direction: Direction,
    /// Device-side stream index
    pub stream_index: u8,
    /// Dynamic context the layer belongs to
    pub context_index: u8,
    /// DMA engine serving the layer
    pub engine_index: u8,
    /// Bytes per frame
    pub frame_size: u32,
    /// Edge role
    pub kind: LayerKind,
}

impl LayerInfo {
    /// Boundary layer on engine 0, network index 0
    pub fn boundary(
        name: impl Into<String>,
        network_name: impl Into<String>,
        direction: Direction,
        stream_index: u8,
        frame_size: u32,
    ) -> Self {
        Self {
            name: name.into(),
            network_name: network_name.into(),
            network_index: 0,
            direction,
            stream_index,
            context_index: 0,
            engine_index: 0,
            frame_size,
            kind: LayerKind::Boundary,
        }
    }

    /// Set the edge role
    #[must_use]
    pub const fn with_kind(mut self, kind: LayerKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the dynamic context index
    #[must_use]
    pub const fn with_context_index(mut self, context_index: u8) -> Self {
        self.context_index = context_index;
        self
    }

    /// Set the network index
    #[must_use]
    pub const fn with_network_index(mut self, network_index: u8) -> Self {
        self.network_index = network_index;
        self
    }

    /// Whether the layer is a host-facing boundary
    pub const fn is_boundary(&self) -> bool {
        matches!(self.kind, LayerKind::Boundary)
    }
}

/// Configuration words written to one config stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWrite {
    /// Config stream (cfg channel) index
    pub config_stream_index: u8,
    /// CCW bytes
    pub data: Vec<u8>,
}

/// One context's program
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextMetadata {
    /// Per config stream: sizes of the CCW bursts it will carry
    pub config_buffers: Vec<Vec<u32>>,
    /// CCW writes, in order
    pub config_writes: Vec<ConfigWrite>,
    /// Edge layers of the context
    pub layers: Vec<LayerInfo>,
    /// Device actions (sequencer triggers, LCU enables, ...)
    pub actions: Vec<Action>,
}

impl ContextMetadata {
    /// Total CCW bytes of one config stream
    pub fn config_size(&self, config_stream_index: usize) -> u32 {
        self.config_buffers
            .get(config_stream_index)
            .map_or(0, |sizes| sizes.iter().sum())
    }
}

/// Feature flags of a compiled network group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupportedFeatures {
    /// Preliminary context starts before activation
    pub preliminary_run_asap: bool,
    /// Config descriptors are programmed ahead and fetched as CCW bursts
    pub cfg_prefetch: bool,
}

/// A cfg channel the group needs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigChannelInfo {
    /// DMA engine of the channel
    pub engine_index: u8,
}

/// A compiled network group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkGroupMetadata {
    /// Group name
    pub network_group_name: String,
    /// Full network names; position is the network index
    pub network_names: Vec<String>,
    /// Cfg channels, one per config stream
    pub config_channels: Vec<ConfigChannelInfo>,
    /// Preliminary context (no edge layers)
    pub preliminary_context: ContextMetadata,
    /// Dynamic contexts, in execution order
    pub dynamic_contexts: Vec<ContextMetadata>,
    /// Feature flags
    pub supported_features: SupportedFeatures,
}

impl NetworkGroupMetadata {
    /// Boundary layers of every dynamic context, each stream once
    pub fn boundary_layers(&self) -> Vec<&LayerInfo> {
        let mut layers: Vec<&LayerInfo> = Vec::new();
        for layer in self
            .dynamic_contexts
            .iter()
            .flat_map(|c| &c.layers)
            .filter(|l| l.is_boundary())
        {
            if !layers.iter().any(|known| known.name == layer.name) {
                layers.push(layer);
            }
        }
        layers
    }

    /// Boundary layers flowing in `direction`
    pub fn boundary_layers_in(&self, direction: Direction) -> Vec<&LayerInfo> {
        self.boundary_layers()
            .into_iter()
            .filter(|l| l.direction == direction)
            .collect()
    }

    /// Boundary layer by stream name
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown name.
    pub fn boundary_layer(&self, name: &str) -> Result<&LayerInfo> {
        self.boundary_layers()
            .into_iter()
            .find(|l| l.name == name)
            .ok_or_else(|| VdmaError::not_found(format!("stream {name}")))
    }

    /// Index of a network in the group
    pub fn network_index(&self, network_name: &str) -> Option<usize> {
        self.network_names.iter().position(|n| n == network_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> NetworkGroupMetadata {
        let input = LayerInfo::boundary("in", "g/net", Direction::H2D, 0, 1024);
        let output = LayerInfo::boundary("out", "g/net", Direction::D2H, 1, 256);
        NetworkGroupMetadata {
            network_group_name: "g".into(),
            network_names: vec!["g/net".into()],
            dynamic_contexts: vec![
                ContextMetadata {
                    layers: vec![input.clone()],
                    ..ContextMetadata::default()
                },
                ContextMetadata {
                    layers: vec![input.with_context_index(1), output.with_context_index(1)],
                    ..ContextMetadata::default()
                },
            ],
            ..NetworkGroupMetadata::default()
        }
    }

    #[test]
    fn test_boundary_layers_are_unique() {
        let metadata = metadata();
        let names: Vec<&str> = metadata.boundary_layers().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["in", "out"]);
        assert_eq!(metadata.boundary_layers_in(Direction::D2H).len(), 1);
        assert_eq!(metadata.boundary_layer("out").unwrap().frame_size, 256);
        assert!(metadata.boundary_layer("nope").is_err());
    }

    #[test]
    fn test_config_size_sums_bursts() {
        let context = ContextMetadata {
            config_buffers: vec![vec![64, 128], vec![]],
            ..ContextMetadata::default()
        };
        assert_eq!(context.config_size(0), 192);
        assert_eq!(context.config_size(1), 0);
        assert_eq!(context.config_size(5), 0);
    }
}
