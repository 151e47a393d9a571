//! Per-job video assembly: resolve the playlist, download segments with
//! bounded parallelism, and stream them in order into a remux session.

mod fetch;
mod orchestrator;
mod playlist;

pub use fetch::{HttpSegmentFetcher, SegmentFetcher};
pub use orchestrator::{AssembledVideo, AssemblyError, SegmentError, VideoAssembler};
pub use playlist::{HttpPlaylistResolver, PlaylistResolver, ResolvedPlaylist, select_variant};
