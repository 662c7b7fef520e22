//! vDMA transport primitives
//!
//! | Module | Contents |
//! |--------|----------|
//! | `descriptor` | Descriptor lists, host mapping, list sizing |
//! | `mapped_buffer` | Pinned, driver-mapped host buffers |
//! | `sg_buffer` | Descriptor list bound to a mapped buffer |
//! | `channel` | Per-channel transfer state machine |
//! | `latency` | Frame latency from interrupt timestamps |

mod channel;
pub(crate) mod circular;
mod descriptor;
mod latency;
mod mapped_buffer;
mod sg_buffer;

pub use channel::VdmaChannel;
pub use descriptor::{
    desc_buffer_sizes_for_multiple_transfers, desc_buffer_sizes_for_single_transfer,
    DescriptorList, DescriptorRegion, VdmaDescriptor,
};
pub use latency::LatencyMeter;
pub use mapped_buffer::MappedBuffer;
pub use sg_buffer::{HostBufferInfo, SgBuffer};
