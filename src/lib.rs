//! A seekable, cached, prefetching video frame reader built on `ffmpeg-next`.
//!
//! The entry point is [`PositionalReader`]: open a file to get a
//! [`types::VideoInfo`], then drive it with `move_to`/`move_next` while an
//! optional background [`prefetch::PrefetchWorker`] decodes ahead of the
//! playhead into a [`cache::FrameCache`].
//!
//! Configuration loading, the CLI/GUI front end, and KVA overlay parsing
//! live outside this crate; it exposes the hooks they need (`VideoInfo`,
//! `read_metadata`, the bitmap conversion boundary) but does not implement
//! them.

pub mod cache;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod log;
pub mod prefetch;
pub mod progress;
pub mod reader;
pub mod timestamp;
pub mod types;

pub use cache::{CapacityMode, FrameCache};
pub use decoder::{Demuxer, StreamIndexes, VideoSource};
pub use error::{OpenError, OpenResult, ReadError, ReadResult};
pub use frame::{Disposer, Frame, ImageBuffer};
pub use progress::{Progress, ProgressBar};
pub use reader::PositionalReader;
pub use timestamp::{TimestampInfo, TimestampResolver};
pub use types::{
    AspectRatioMode, CacheView, Options, Ratio, Size, Thumbnail, Timestamp, VideoInfo, VideoSection, VideoSummary,
};

/// Initializes FFmpeg's own global state and this crate's logging. Safe to
/// call more than once; only the first call has any effect.
pub fn init() {
    ffmpeg::init().expect("failed to initialize ffmpeg");
    log::init();
}
