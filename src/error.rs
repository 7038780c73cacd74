use thiserror::Error;

/// Failures that can occur while opening a video file.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("failed to open file: {0}")]
    FileNotOpened(#[from] ffmpeg::Error),
    #[error("stream information could not be read")]
    StreamInfoNotFound,
    #[error("no video stream found")]
    VideoStreamNotFound,
    #[error("codec not found for video stream")]
    CodecNotFound,
    #[error("codec could not be opened")]
    CodecNotOpened,
}

/// Failures that can occur while seeking or decoding within an open video.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("movie not loaded")]
    MovieNotLoaded,
    #[error("failed to read next frame")]
    FrameNotRead,
    #[error("failed to allocate frame memory")]
    MemoryNotAllocated,
    #[error("failed to convert decoded image")]
    ImageNotConverted,
}

pub type OpenResult<T> = Result<T, OpenError>;
pub type ReadResult<T> = Result<T, ReadError>;
