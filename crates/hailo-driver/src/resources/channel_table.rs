//! Per-engine channel assignment table
//!
//! Every engine has 32 slots, H2D in `0..16` and D2H in `16..32`. A slot
//! is assigned once per network group and keeps its type for the life of
//! the table.

use crate::error::{Result, VdmaError};
use hailo_chip::vdma::{ChannelId, Direction, CHANNELS_PER_ENGINE};

/// What a channel carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    /// Host-facing stream
    Boundary,
    /// Buffer chaining two contexts
    InterContext,
    /// One side of a DDR buffering pair
    Ddr,
    /// Configuration words
    Cfg,
}

impl ChannelType {
    /// Wire value in the network-group header
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Boundary => 0,
            Self::InterContext => 1,
            Self::Ddr => 2,
            Self::Cfg => 3,
        }
    }

    /// Channels firmware drives without host transfers
    pub const fn is_internal(self) -> bool {
        !matches!(self, Self::Boundary)
    }
}

/// State of one slot; `channel_type` is `None` while unassigned
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Assigned type
    pub channel_type: Option<ChannelType>,
    /// Device-side stream index
    pub stream_index: Option<u8>,
    /// Layer the channel serves
    pub layer_name: Option<String>,
}

impl ChannelInfo {
    /// Whether the slot is free
    pub const fn is_unassigned(&self) -> bool {
        self.channel_type.is_none()
    }
}

/// The layer a channel is requested for
#[derive(Debug, Clone, Copy)]
pub struct LayerRef<'a> {
    /// Layer name
    pub name: &'a str,
    /// Device-side stream index
    pub stream_index: u8,
}

/// Assignment table of every engine
#[derive(Debug, Clone)]
pub struct ChannelTable {
    engines: Vec<Vec<ChannelInfo>>,
}

impl ChannelTable {
    /// All slots free on `engines_count` engines
    pub fn new(engines_count: u8) -> Self {
        let engines = (0..engines_count.max(1))
            .map(|_| vec![ChannelInfo::default(); usize::from(CHANNELS_PER_ENGINE)])
            .collect();
        Self { engines }
    }

    /// First-fit assignment of a free slot in `direction`'s sub-range
    ///
    /// Channel indices in `blacklist` are skipped. The winner is marked
    /// with `required_type` and the layer, if any.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for `Direction::Both` or an unknown engine,
    /// `ResourceExhausted` when the sub-range is full.
    pub fn get_available_channel_index(
        &mut self,
        blacklist: &[u8],
        required_type: ChannelType,
        direction: Direction,
        engine_index: u8,
        layer: Option<LayerRef<'_>>,
    ) -> Result<ChannelId> {
        let (first, last) = direction
            .channel_range()
            .ok_or_else(|| VdmaError::invalid_argument("Channel direction must be H2D or D2H"))?;
        let slots = self
            .engines
            .get_mut(usize::from(engine_index))
            .ok_or_else(|| VdmaError::invalid_argument(format!("Invalid DMA engine index {engine_index}")))?;

        let available = (first..=last)
            .filter(|&index| slots[usize::from(index)].is_unassigned() && !blacklist.contains(&index))
            .count();
        let Some(channel_index) = (first..=last)
            .find(|&index| slots[usize::from(index)].is_unassigned() && !blacklist.contains(&index))
        else {
            tracing::error!("No free {direction} channel for {required_type:?} on engine {engine_index}");
            return Err(VdmaError::ResourceExhausted {
                kind: "vdma channel",
                requested: 1,
                available,
            });
        };

        slots[usize::from(channel_index)] = ChannelInfo {
            channel_type: Some(required_type),
            stream_index: layer.map(|l| l.stream_index),
            layer_name: layer.map(|l| l.name.to_owned()),
        };
        let channel_id = ChannelId {
            engine_index,
            channel_index,
        };
        tracing::debug!(
            "Assigned channel {channel_id} as {required_type:?} for {}",
            layer.map_or("<no layer>", |l| l.name)
        );
        Ok(channel_id)
    }

    /// Slot of `channel_id`
    pub fn info(&self, channel_id: ChannelId) -> Option<&ChannelInfo> {
        self.engines
            .get(usize::from(channel_id.engine_index))?
            .get(usize::from(channel_id.channel_index))
    }

    /// Assigned slots in engine, then index order
    pub fn assigned(&self) -> impl Iterator<Item = (ChannelId, &ChannelInfo)> {
        self.engines.iter().enumerate().flat_map(|(engine, slots)| {
            slots.iter().enumerate().filter(|(_, info)| !info.is_unassigned()).map(
                move |(index, info)| {
                    #[allow(clippy::cast_possible_truncation)] // < 32 of each
                    let id = ChannelId {
                        engine_index: engine as u8,
                        channel_index: index as u8,
                    };
                    (id, info)
                },
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(name: &str) -> Option<LayerRef<'_>> {
        Some(LayerRef {
            name,
            stream_index: 3,
        })
    }

    #[test]
    fn test_first_fit_per_direction() {
        let mut table = ChannelTable::new(1);
        let h2d = table
            .get_available_channel_index(&[], ChannelType::Boundary, Direction::H2D, 0, layer("in"))
            .unwrap();
        let d2h = table
            .get_available_channel_index(&[], ChannelType::Boundary, Direction::D2H, 0, layer("out"))
            .unwrap();
        assert_eq!(h2d.channel_index, 0);
        assert_eq!(d2h.channel_index, 16);

        let info = table.info(d2h).unwrap();
        assert_eq!(info.channel_type, Some(ChannelType::Boundary));
        assert_eq!(info.layer_name.as_deref(), Some("out"));
        assert_eq!(info.stream_index, Some(3));
    }

    #[test]
    fn test_blacklist_is_skipped() {
        let mut table = ChannelTable::new(1);
        let id = table
            .get_available_channel_index(&[0, 1, 3], ChannelType::Cfg, Direction::H2D, 0, None)
            .unwrap();
        assert_eq!(id.channel_index, 2);
        let id = table
            .get_available_channel_index(&[0, 1, 3], ChannelType::Cfg, Direction::H2D, 0, None)
            .unwrap();
        assert_eq!(id.channel_index, 4);
    }

    #[test]
    fn test_exhaustion_after_sixteen_per_direction() {
        let mut table = ChannelTable::new(1);
        for direction in [Direction::H2D, Direction::D2H] {
            for _ in 0..16 {
                let id = table
                    .get_available_channel_index(&[], ChannelType::InterContext, direction, 0, None)
                    .unwrap();
                assert_eq!(id.direction(), Some(direction));
            }
        }
        assert_eq!(table.assigned().count(), 32);
        assert!(matches!(
            table.get_available_channel_index(&[], ChannelType::Ddr, Direction::H2D, 0, None),
            Err(VdmaError::ResourceExhausted {
                kind: "vdma channel",
                requested: 1,
                available: 0
            })
        ));
    }

    #[test]
    fn test_bad_requests() {
        let mut table = ChannelTable::new(1);
        assert!(table
            .get_available_channel_index(&[], ChannelType::Boundary, Direction::Both, 0, None)
            .is_err());
        assert!(table
            .get_available_channel_index(&[], ChannelType::Boundary, Direction::H2D, 2, None)
            .is_err());
    }
}
