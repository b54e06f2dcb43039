//! Shared data model: tracks, queue, node statistics, filters and wire messages.

mod filters;
mod protocol;
mod queue;
mod stats;
mod track;

pub use filters::{
    ChannelMix, Distortion, EqualizerBand, Filters, Karaoke, LowPass, Oscillation, Rotation,
    Timescale,
};
pub use protocol::{
    EventTrack, LoadException, LoadResult, LoadType, NodeMessage, PlayerUpdateState,
    PlaylistInfo, TrackEndReason, TrackEvent,
};
pub use queue::{LoopMode, Queue};
pub use stats::{CpuStats, FrameStats, MemoryStats, NodeInfo, NodeStats, NodeVersion, PluginDescriptor};
pub use track::{Track, TrackInfo};
