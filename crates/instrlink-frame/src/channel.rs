//! Virtual channel limits.
//!
//! Logical channels are carried as a 16-bit tag in each stream frame. The
//! tag is opaque to the codec; the mapping from logical channel to tag is
//! owned by whoever builds the frames.

/// Largest number of logical channels multiplexed on one physical channel.
pub const MAX_VIRTUAL_CHANNELS: usize = 8;

/// Physical DMA channel carrying multiplexed traffic unless configured.
pub const DEFAULT_PHYSICAL_CHANNEL: u16 = 0;

/// Tag reserved for padding frames; they are dropped on receive.
pub const PADDING_TAG: u16 = 0xFFFF;

/// Returns true if a frame with this tag carries no data.
pub fn is_padding(tag: u16) -> bool {
    tag == PADDING_TAG
}
