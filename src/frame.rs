//! A decoded, converted image plus the presentation timestamp it belongs to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::types::Timestamp;

/// An owned, rescaled/converted decoded picture. Row-major, tightly packed
/// unless `stride` says otherwise.
#[derive(Debug, Clone)]
pub struct ImageBuffer {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub bytes: Arc<[u8]>,
}

impl ImageBuffer {
    pub fn new(width: u32, height: u32, stride: usize, bytes: Vec<u8>) -> Self {
        ImageBuffer {
            width,
            height,
            stride,
            bytes: bytes.into(),
        }
    }
}

/// One entry in the frame cache: a timestamp plus its decoded picture.
///
/// Frames are disposed exactly once, by whichever `Disposer` the cache was
/// built with; `disposed` is a debug-only double-free guard, not a silent
/// no-op.
pub struct Frame {
    pub timestamp: Timestamp,
    pub image: ImageBuffer,
    disposed: AtomicBool,
}

impl Frame {
    pub fn new(timestamp: Timestamp, image: ImageBuffer) -> Self {
        Frame {
            timestamp,
            image,
            disposed: AtomicBool::new(false),
        }
    }

    /// Marks this frame disposed. Panics in debug builds on double-dispose.
    pub(crate) fn mark_disposed(&self) {
        let already = self.disposed.swap(true, Ordering::AcqRel);
        debug_assert!(!already, "frame at ts {} disposed twice", self.timestamp);
    }
}

/// Invoked exactly once per frame that ever entered the cache, to release
/// its native pixel memory. Boxed by value rather than held as a back
/// reference to the reader, so cache and reader don't form a cycle.
pub type Disposer = Box<dyn Fn(&Frame) + Send + Sync>;

/// A disposer that does nothing; useful for tests and for call sites that
/// only hold `ImageBuffer`s backed by plain `Vec<u8>` with no native twin.
pub fn noop_disposer() -> Disposer {
    Box::new(|_frame: &Frame| {})
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame(ts: Timestamp) -> Frame {
        Frame::new(ts, ImageBuffer::new(4, 4, 12, vec![0u8; 48]))
    }

    #[test]
    fn dispose_runs_exactly_once() {
        use std::sync::atomic::AtomicUsize;
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let disposer: Disposer = Box::new(move |_f| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        let frame = sample_frame(10);
        disposer(&frame);
        frame.mark_disposed();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic]
    fn double_dispose_panics_in_debug() {
        let frame = sample_frame(1);
        frame.mark_disposed();
        frame.mark_disposed();
    }
}
