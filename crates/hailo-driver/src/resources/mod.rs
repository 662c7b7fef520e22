//! Network-group resources and firmware program
//!
//! | Module | Contents |
//! |--------|----------|
//! | `channel_table` | Per-engine channel assignment |
//! | `config_buffer` | Cfg channel CCW buffers |
//! | `intermediate` | Inter-context buffers |
//! | `ddr` | DDR buffering pairs and their drain threads |
//! | `context` | Context records and their action controls |
//! | `manager` | [`ResourcesManager`], owner of all of the above |
//! | `builder` | [`build`], filling a manager from metadata |

mod builder;
mod channel_table;
mod config_buffer;
mod context;
mod ddr;
mod intermediate;
mod manager;

pub use builder::build;
pub use channel_table::{ChannelInfo, ChannelTable, ChannelType, LayerRef};
pub use config_buffer::ConfigResources;
pub use context::{ContextRecord, EdgeLayer, EdgeLayerType};
pub use ddr::{DdrChannelsInfo, DdrChannelsPair, DDR_THREAD_WAIT_TIMEOUT};
pub use intermediate::{InterContextBuffer, IntermediateBufferKey};
pub use manager::ResourcesManager;
