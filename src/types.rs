//! Value types shared across the reader: durations, sections, and the
//! immutable descriptors produced by `open`.

/// A presentation timestamp expressed in the video stream's own time base.
pub type Timestamp = i64;

/// How the decoder should reconcile pixel aspect ratio with display aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AspectRatioMode {
    #[default]
    Auto,
    Force43,
    Force169,
    ForcedSquarePixels,
}

/// Mutable knobs that can change between sessions on an open reader.
///
/// Changing either field clears the frame cache; callers must stop the
/// prefetch worker first (see `PositionalReader::change_aspect_ratio`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Options {
    pub aspect_ratio: AspectRatioMode,
    pub deinterlace: bool,
}

/// A half-open-by-convention time range, stored and compared with an
/// inclusive end timestamp. This mirrors the source player's working-zone
/// semantics exactly, off-by-one included (see module docs on `FrameCache`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoSection {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl VideoSection {
    pub const EMPTY: VideoSection = VideoSection { start: 0, end: 0 };

    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        VideoSection { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    pub fn duration(&self) -> Timestamp {
        self.end - self.start
    }
}

/// A rational aspect/sample ratio, numerator over denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ratio {
    pub num: i32,
    pub den: i32,
}

impl Ratio {
    pub const ONE: Ratio = Ratio { num: 1, den: 1 };

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

/// Pixel dimensions, width always a multiple of four (the conversion path
/// assumes row alignment).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

/// Everything known about an opened video, fixed for the lifetime of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub path: String,
    pub first_timestamp: Timestamp,
    pub duration_timestamps: Timestamp,
    pub average_timestamps_per_second: f64,
    pub average_timestamps_per_frame: Timestamp,
    pub frames_per_second: f64,
    pub frame_interval_ms: f64,
    pub original_size: Size,
    pub decoding_size: Size,
    pub pixel_aspect_ratio: f64,
    pub sample_aspect_ratio: Ratio,
    pub is_codec_mpeg2: bool,
    pub has_kva: bool,
}

/// A single decoded, resized preview frame produced by `extract_summary`.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub timestamp: Timestamp,
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// Coarse result of scanning a file without fully opening it for playback.
#[derive(Debug, Clone)]
pub struct VideoSummary {
    pub is_image: bool,
    pub has_kva: bool,
    pub original_size: Size,
    pub duration_ms: f64,
    pub thumbnails: Vec<Thumbnail>,
}

/// A read-only snapshot of `FrameCache` state, for UI introspection
/// (`PositionalReader::cache_view`). Doesn't expose the frames themselves.
#[derive(Debug, Clone, Copy)]
pub struct CacheView {
    pub current: Option<Timestamp>,
    pub working_zone: VideoSection,
    pub len: usize,
}
