//! The seek-and-decode state machine: composes the demuxer, timestamp
//! resolver, frame cache and prefetch worker into the positional reading
//! API consumed by the UI layer.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::cache::{CapacityMode, FrameCache};
use crate::decoder::{DecodeOutcome, Demuxer, VideoSource};
use crate::error::{OpenResult, ReadError, ReadResult};
use crate::frame::{Disposer, Frame};
use crate::prefetch::{PrefetchWorker, StepOutcome};
use crate::progress::ProgressBar;
use crate::timestamp::TimestampResolver;
use crate::types::{
    AspectRatioMode, CacheView, Options, Size, Thumbnail, Timestamp, VideoInfo, VideoSection, VideoSummary,
};

/// Wraps `Demuxer` so the surrounding `Mutex` can be shared between the
/// foreground caller and the prefetch thread. FFmpeg's context types carry
/// raw pointers and are not auto-`Send`; access to this wrapper is always
/// serialized by the decoder lock, so moving it across threads is sound.
struct SendableDemuxer(Demuxer);
unsafe impl Send for SendableDemuxer {}

struct LoadedState {
    demuxer: SendableDemuxer,
    resolver: TimestampResolver,
    info: VideoInfo,
    options: Options,
    /// Average timestamps per second, used as the seek window width.
    one_second: Timestamp,
}

struct Shared {
    /// The decoder lock: serializes every entry into the codec so foreground
    /// and prefetch never call into FFmpeg concurrently.
    loaded: Mutex<Option<LoadedState>>,
    cache: Mutex<Option<Arc<FrameCache>>>,
    prefetch: Mutex<Option<PrefetchWorker>>,
}

/// A seekable, cached, prefetching video frame reader.
pub struct PositionalReader {
    shared: Arc<Shared>,
    disposer_factory: Box<dyn Fn() -> Disposer + Send + Sync>,
}

const SEEK_OVERSHOOT_BACKOFF_SECONDS: i64 = 4;

impl PositionalReader {
    /// `disposer_factory` builds a fresh `Disposer` for each `open`, since
    /// disposers often close over per-session native allocator state.
    pub fn new(disposer_factory: impl Fn() -> Disposer + Send + Sync + 'static) -> Self {
        PositionalReader {
            shared: Arc::new(Shared {
                loaded: Mutex::new(None),
                cache: Mutex::new(None),
                prefetch: Mutex::new(None),
            }),
            disposer_factory: Box::new(disposer_factory),
        }
    }

    /// Opens `path` for positional reading. Any previously open file is closed first.
    pub fn open(&self, path: &str) -> OpenResult<VideoInfo> {
        self.close();

        let (demuxer, info) = Demuxer::open(path)?;
        let one_second = info.average_timestamps_per_second.round() as Timestamp;
        let resolver = TimestampResolver::new(info.average_timestamps_per_frame);

        let cache = Arc::new(FrameCache::new(
            (self.disposer_factory)(),
            CapacityMode::Bounded {
                back_window: 32,
                forward_window: 64,
            },
        ));

        *self.shared.loaded.lock().unwrap() = Some(LoadedState {
            demuxer: SendableDemuxer(demuxer),
            resolver,
            info: info.clone(),
            options: Options::default(),
            one_second,
        });
        *self.shared.cache.lock().unwrap() = Some(cache);

        debug!(path, "opened video");
        Ok(info)
    }

    /// Idempotent: stops the prefetch worker, disposes the cache, and
    /// releases the codec/container.
    pub fn close(&self) {
        if let Some(worker) = self.shared.prefetch.lock().unwrap().take() {
            worker.stop();
        }
        if let Some(cache) = self.shared.cache.lock().unwrap().take() {
            cache.clear();
        }
        self.shared.loaded.lock().unwrap().take();
    }

    pub fn video_info(&self) -> Option<VideoInfo> {
        self.shared.loaded.lock().unwrap().as_ref().map(|s| s.info.clone())
    }

    pub fn options(&self) -> Option<Options> {
        self.shared.loaded.lock().unwrap().as_ref().map(|s| s.options)
    }

    pub fn is_caching(&self) -> bool {
        self.shared.prefetch.lock().unwrap().is_some()
    }

    pub fn current_timestamp(&self) -> Option<Timestamp> {
        self.cache_handle().and_then(|c| c.current_timestamp())
    }

    pub fn set_working_zone(&self, zone: VideoSection) {
        if let Some(cache) = self.cache_handle() {
            cache.set_working_zone(zone);
        }
    }

    /// A read-only snapshot of the cache's playhead, working zone, and size,
    /// for UI introspection without exposing the frames themselves.
    pub fn cache_view(&self) -> Option<CacheView> {
        let cache = self.cache_handle()?;
        Some(CacheView {
            current: cache.current_timestamp(),
            working_zone: cache.working_zone(),
            len: cache.len(),
        })
    }

    fn cache_handle(&self) -> Option<Arc<FrameCache>> {
        self.shared.cache.lock().unwrap().clone()
    }

    /// Starts the background prefetch worker, if not already running.
    pub fn start_caching(&self) {
        let mut prefetch = self.shared.prefetch.lock().unwrap();
        if prefetch.is_some() {
            return;
        }
        let shared = self.shared.clone();
        *prefetch = Some(PrefetchWorker::spawn(move |canceler| {
            if canceler.is_cancelled() {
                return StepOutcome::Stop;
            }
            match Self::read_frame_on(&shared, None, 1, false) {
                Ok(_) => StepOutcome::Decoded,
                Err(ReadError::FrameNotRead) => {
                    if canceler.is_cancelled() {
                        return StepOutcome::Stop;
                    }
                    match Self::read_frame_on(&shared, Some(0), 1, false) {
                        Ok(_) => StepOutcome::WrappedAround,
                        Err(_) => StepOutcome::Stop,
                    }
                }
                Err(_) => StepOutcome::Stop,
            }
        }));
    }

    /// Cancels and joins the background prefetch worker, if running.
    pub fn stop_caching(&self) {
        if let Some(worker) = self.shared.prefetch.lock().unwrap().take() {
            worker.stop();
        }
    }

    /// Requests cancellation of the background prefetch worker and removes
    /// it from `shared.prefetch`, but does not join it. The worker may be
    /// parked inside `FrameCache::add` holding the decoder lock, waiting for
    /// capacity to free up; callers must unblock the cache before joining
    /// the returned handle, or the thread will never exit.
    fn cancel_caching(&self) -> Option<PrefetchWorker> {
        let worker = self.shared.prefetch.lock().unwrap().take()?;
        worker.cancel();
        Some(worker)
    }

    /// Advances one frame. If `blocking` and the next frame isn't cached
    /// yet, decodes it synchronously first.
    pub fn move_next(&self, blocking: bool) -> ReadResult<bool> {
        let cache = self.cache_handle().ok_or(ReadError::MovieNotLoaded)?;
        if blocking && !cache.has_next() {
            Self::read_frame_on(&self.shared, None, 1, false)?;
        }
        cache.move_next();
        Ok(self.has_more())
    }

    /// Seeks to `ts`. If `blocking` and `ts` isn't cached, cancels the
    /// prefetch worker, clears (or partially evicts, on a rollover) the
    /// cache, decodes synchronously, and restarts prefetching if it had
    /// been running.
    pub fn move_to(&self, ts: Timestamp, blocking: bool) -> ReadResult<bool> {
        let cache = self.cache_handle().ok_or(ReadError::MovieNotLoaded)?;

        if blocking && !cache.contains(ts) {
            let worker = self.cancel_caching();
            let was_caching = worker.is_some();

            // The worker may be parked inside `cache.add`, holding the
            // decoder lock, waiting for room to free up. Unblock the cache
            // first so it can observe cancellation and return, *then* join.
            if cache.is_rollover_jump(ts) {
                cache.remove_oldest();
            } else {
                cache.clear();
            }
            if let Some(worker) = worker {
                worker.join();
            }

            let actual = Self::read_frame_on(&self.shared, Some(ts), 1, false)?;

            if was_caching {
                self.start_caching();
            }

            cache.move_to(actual);
            return Ok(self.has_more());
        }

        cache.move_to(ts);
        Ok(self.has_more())
    }

    fn has_more(&self) -> bool {
        let Some(cache) = self.cache_handle() else { return false };
        let Some(ts) = cache.current_timestamp() else { return true };
        ts < cache.working_zone().end
    }

    /// Fills the cache with every frame in `section`, disabling the normal
    /// capacity eviction so the whole zone survives. `prepend` mirrors the
    /// cache's prepend-block mode for callers materializing a zone behind
    /// the current playhead. `progress` is updated one tick per decoded
    /// frame and can be used from another thread to cancel the bulk read
    /// early (`ProgressBar::interrupt`).
    pub fn read_many(&self, progress: &ProgressBar, section: VideoSection, prepend: bool) -> ReadResult<()> {
        let cache = self.cache_handle().ok_or(ReadError::MovieNotLoaded)?;
        cache.disable_capacity_check();
        cache.set_prepend_block(prepend);

        let avg_tspf = self.avg_tspf().unwrap_or(1).max(1);
        let total = ((section.duration() / avg_tspf) + 1).max(1) as u32;
        progress.start(total);

        let mut ts = section.start;
        let mut first = true;
        let result = loop {
            if ts > section.end {
                break Ok(());
            }
            if progress.add(1).is_err() {
                break Ok(());
            }
            let seek = if first { Some(ts) } else { None };
            match Self::read_frame_on(&self.shared, seek, 1, false) {
                Ok(actual) => ts = actual + avg_tspf,
                Err(ReadError::FrameNotRead) => break Ok(()),
                Err(e) => break Err(e),
            }
            first = false;
        };

        cache.set_prepend_block(false);
        result
    }

    fn avg_tspf(&self) -> Option<Timestamp> {
        self.shared
            .loaded
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.info.average_timestamps_per_frame)
    }

    /// Mutates the aspect-ratio handling and clears the cache. Caller must
    /// ensure the prefetch worker is stopped first.
    pub fn change_aspect_ratio(&self, mode: AspectRatioMode) {
        let mut loaded = self.shared.loaded.lock().unwrap();
        if let Some(state) = loaded.as_mut() {
            state.options.aspect_ratio = mode;
        }
        drop(loaded);
        if let Some(cache) = self.cache_handle() {
            cache.clear();
        }
    }

    /// Mutates deinterlacing and clears the cache. Caller must ensure the
    /// prefetch worker is stopped first.
    pub fn change_deinterlace(&self, deinterlace: bool) {
        let mut loaded = self.shared.loaded.lock().unwrap();
        if let Some(state) = loaded.as_mut() {
            state.options.deinterlace = deinterlace;
            state.demuxer.0.set_deinterlace(deinterlace);
        }
        drop(loaded);
        if let Some(cache) = self.cache_handle() {
            cache.clear();
        }
    }

    /// Whether `section` can be fully cached within the given memory and
    /// duration budget. `max_megabytes` is interpreted as megabytes (not
    /// bytes), matching the source player's own (ambiguous, but preserved)
    /// convention.
    pub fn can_cache_working_zone(&self, section: VideoSection, max_seconds: f64, max_megabytes: f64) -> bool {
        let Some(info) = self.video_info() else { return false };
        let duration_sec = section.duration() as f64 / info.average_timestamps_per_second;
        if duration_sec <= 0.0 || duration_sec > max_seconds {
            return false;
        }
        let per_frame_mb =
            (info.decoding_size.width as f64 * info.decoding_size.height as f64 * 3.0) / (1024.0 * 1024.0);
        let total_mb = duration_sec * info.frames_per_second * per_frame_mb;
        total_mb <= max_megabytes
    }

    /// Opens `path` just long enough to produce a coarse summary: whether
    /// it's a single-frame image, whether a KVA sidecar stream is present,
    /// and up to `n_thumbs` evenly spaced thumbnails resized to
    /// `target_width` (height scaled to preserve aspect).
    pub fn extract_summary(path: &str, n_thumbs: usize, target_width: u32) -> OpenResult<VideoSummary> {
        let (mut demuxer, info) = Demuxer::open(path)?;
        let aspect = info.original_size.height as f64 / info.original_size.width as f64;
        let target_height = (target_width as f64 * aspect).round() as u32;
        demuxer.set_decoding_size(Size {
            width: target_width,
            height: target_height,
        });

        let is_image = info.duration_timestamps == 1;
        let n_thumbs = n_thumbs.max(1);
        // ceil(duration / n_thumbs), not floor: the last thumbnail should
        // land at or before the final timestamp, never past it.
        let n = n_thumbs as i64;
        let step = ((info.duration_timestamps + n - 1) / n).max(1);

        let mut thumbnails = Vec::with_capacity(n_thumbs);
        let mut ts = info.first_timestamp;
        for _ in 0..n_thumbs {
            if ts > info.first_timestamp + info.duration_timestamps {
                break;
            }
            match Self::read_one_frame(&mut demuxer, Some(ts), true) {
                Ok(frame) => {
                    thumbnails.push(Thumbnail {
                        timestamp: frame.timestamp,
                        width: frame.image.width,
                        height: frame.image.height,
                        rgb: frame.image.bytes.to_vec(),
                    });
                }
                Err(_) => break,
            }
            ts += step;
        }

        Ok(VideoSummary {
            is_image,
            has_kva: info.has_kva,
            original_size: info.original_size,
            duration_ms: info.duration_timestamps as f64 / info.average_timestamps_per_second * 1000.0,
            thumbnails,
        })
    }

    /// Reads the raw KVA analysis text muxed as a subtitle stream, if any.
    pub fn read_metadata(&self) -> ReadResult<Option<String>> {
        let mut loaded = self.shared.loaded.lock().unwrap();
        let state = loaded.as_mut().ok_or(ReadError::MovieNotLoaded)?;
        Ok(state.demuxer.0.read_kva_text())
    }

    /// Drives the shared seek-and-decode loop against `shared`'s demuxer
    /// and cache, pushing the resulting frame into the cache. Returns the
    /// actual presentation timestamp decoded.
    fn read_frame_on(
        shared: &Shared,
        seek_ts: Option<Timestamp>,
        frames_to_decode: i64,
        approximate: bool,
    ) -> ReadResult<Timestamp> {
        let mut loaded = shared.loaded.lock().unwrap();
        let state = loaded.as_mut().ok_or(ReadError::MovieNotLoaded)?;
        let cache = shared.cache.lock().unwrap().clone().ok_or(ReadError::MovieNotLoaded)?;

        let frame = Self::read_frame_inner(state, seek_ts, frames_to_decode, approximate)?;
        let ts = frame.timestamp;
        cache.add(frame);
        Ok(ts)
    }

    /// Mirrors `read_frame_on` but against a standalone demuxer with no
    /// cache/resolver session, for `extract_summary`'s thumbnail scan.
    fn read_one_frame(demuxer: &mut Demuxer, seek_ts: Option<Timestamp>, approximate: bool) -> ReadResult<Frame> {
        let mut resolver = TimestampResolver::new(1);
        Self::decode_to_frame(demuxer, &mut resolver, seek_ts, 1, approximate, 1)
    }

    fn read_frame_inner(
        state: &mut LoadedState,
        seek_ts: Option<Timestamp>,
        frames_to_decode: i64,
        approximate: bool,
    ) -> ReadResult<Frame> {
        Self::decode_to_frame(
            &mut state.demuxer.0,
            &mut state.resolver,
            seek_ts,
            frames_to_decode,
            approximate,
            state.one_second,
        )
    }

    /// The seek-and-decode loop itself: seeks if requested, reads and
    /// decodes packets until termination, recovering once from seek
    /// overshoot, then converts and returns the resulting frame.
    ///
    /// Generic over `VideoSource` (rather than tied to the concrete
    /// `Demuxer`) so this, the heart of the reader, can be driven against a
    /// scripted fake container in tests without touching FFmpeg or a real
    /// file on disk.
    fn decode_to_frame<S: VideoSource>(
        demuxer: &mut S,
        resolver: &mut TimestampResolver,
        seek_ts: Option<Timestamp>,
        frames_to_decode: i64,
        approximate: bool,
        one_second: Timestamp,
    ) -> ReadResult<Frame> {
        let mut target = seek_ts;
        let mut frames_to_decode = frames_to_decode;
        let mut overshoot_recovered = false;

        if let Some(ts) = target {
            demuxer.seek(ts, one_second)?;
            resolver.reset();
            frames_to_decode = 1;
        }

        let mut decoded_count = 0;
        loop {
            let outcome = demuxer.read_and_decode()?;
            let (dts, pts, finished) = match outcome {
                DecodeOutcome::Buffering { dts, pts } => {
                    resolver.observe(dts, pts, false);
                    continue;
                }
                DecodeOutcome::Finished { dts, pts } => (dts, pts, true),
            };
            let _ = finished;
            resolver.observe(dts, pts, true);

            if let Some(seek) = target {
                if !overshoot_recovered && !approximate && resolver.current() > seek {
                    warn!(seek, current = resolver.current(), "seek overshoot, recovering");
                    let backoff = (seek - SEEK_OVERSHOOT_BACKOFF_SECONDS * one_second).max(0);
                    demuxer.seek(backoff, one_second)?;
                    resolver.reset();
                    target = Some(seek);
                    overshoot_recovered = true;
                    decoded_count = 0;
                    continue;
                }
            }

            decoded_count += 1;
            let seeking_done = target.map(|seek| resolver.current() >= seek).unwrap_or(false);
            let count_done = target.is_none() && decoded_count >= frames_to_decode;
            if seeking_done || count_done || approximate {
                let image = demuxer.convert()?;
                return Ok(Frame::new(resolver.current(), image));
            }
        }
    }
}

impl Drop for PositionalReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_cache_working_zone_respects_duration_and_memory_budget() {
        let reader = PositionalReader::new(crate::frame::noop_disposer);
        // no video open: must reject safely rather than panic
        assert!(!reader.can_cache_working_zone(VideoSection::new(0, 1000), 10.0, 100.0));
    }

    #[test]
    fn move_next_without_open_reports_movie_not_loaded() {
        let reader = PositionalReader::new(crate::frame::noop_disposer);
        assert!(matches!(reader.move_next(true), Err(ReadError::MovieNotLoaded)));
    }

    #[test]
    fn close_before_open_is_a_harmless_noop() {
        let reader = PositionalReader::new(crate::frame::noop_disposer);
        reader.close();
        assert!(reader.video_info().is_none());
    }

    #[test]
    fn cache_view_is_none_without_an_open_video() {
        let reader = PositionalReader::new(crate::frame::noop_disposer);
        assert!(reader.cache_view().is_none());
    }

    /// A scripted container: a fixed, evenly spaced sequence of frames with
    /// no B-frame reordering (`dts == pts`, always immediately "finished"),
    /// plus an optional one-shot seek-overshoot script. Exercises
    /// `PositionalReader::decode_to_frame` — the seek-and-decode loop itself
    /// — without touching FFmpeg or a file on disk.
    struct FakeDemuxer {
        /// Presentation timestamp of the frame at each index, ascending.
        timestamps: Vec<Timestamp>,
        cursor: usize,
        /// If set, the *next* `seek` call lands at this index regardless of
        /// its target, then clears itself; later seeks land accurately.
        next_seek_overshoots_to: Option<usize>,
    }

    impl FakeDemuxer {
        fn linear(frame_count: usize, avg_tspf: Timestamp) -> Self {
            FakeDemuxer {
                timestamps: (0..frame_count as Timestamp).map(|n| n * avg_tspf).collect(),
                cursor: 0,
                next_seek_overshoots_to: None,
            }
        }
    }

    impl VideoSource for FakeDemuxer {
        fn seek(&mut self, target: Timestamp, _one_second: Timestamp) -> ReadResult<()> {
            self.cursor = match self.next_seek_overshoots_to.take() {
                Some(idx) => idx,
                None => self
                    .timestamps
                    .iter()
                    .position(|&ts| ts >= target)
                    .unwrap_or(self.timestamps.len()),
            };
            Ok(())
        }

        fn read_and_decode(&mut self) -> ReadResult<DecodeOutcome> {
            let ts = *self.timestamps.get(self.cursor).ok_or(ReadError::FrameNotRead)?;
            self.cursor += 1;
            Ok(DecodeOutcome::Finished {
                dts: Some(ts),
                pts: Some(ts),
            })
        }

        fn convert(&mut self) -> ReadResult<crate::frame::ImageBuffer> {
            Ok(crate::frame::ImageBuffer::new(1, 1, 3, vec![0u8; 3]))
        }
    }

    const APS: Timestamp = 90_000;
    const AVG_TSPF: Timestamp = 3_000;

    #[test]
    fn scenario_linear_playback_is_monotone_and_covers_every_frame() {
        let mut source = FakeDemuxer::linear(300, AVG_TSPF);
        let mut resolver = TimestampResolver::new(AVG_TSPF);

        let first = PositionalReader::decode_to_frame(&mut source, &mut resolver, Some(0), 1, false, APS).unwrap();
        assert_eq!(first.timestamp, 0);

        let mut timestamps = vec![first.timestamp];
        for _ in 0..299 {
            let frame = PositionalReader::decode_to_frame(&mut source, &mut resolver, None, 1, false, APS).unwrap();
            timestamps.push(frame.timestamp);
        }

        assert_eq!(timestamps.len(), 300);
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
        assert!(PositionalReader::decode_to_frame(&mut source, &mut resolver, None, 1, false, APS).is_err());
    }

    #[test]
    fn scenario_backward_jump_lands_exactly_when_seek_is_accurate() {
        let mut source = FakeDemuxer::linear(100, AVG_TSPF);
        let mut resolver = TimestampResolver::new(AVG_TSPF);

        PositionalReader::decode_to_frame(&mut source, &mut resolver, Some(180_000), 1, false, APS).unwrap();

        let frame = PositionalReader::decode_to_frame(&mut source, &mut resolver, Some(6_000), 1, false, APS).unwrap();
        assert_eq!(frame.timestamp, 6_000);
    }

    #[test]
    fn scenario_seek_overshoot_recovers_to_the_exact_target() {
        let mut source = FakeDemuxer::linear(31, AVG_TSPF); // covers ts 0..=90000
        // container's seek(60000) actually lands on ts=75000 (index 25), once.
        source.next_seek_overshoots_to = Some(25);
        let mut resolver = TimestampResolver::new(AVG_TSPF);

        let frame = PositionalReader::decode_to_frame(&mut source, &mut resolver, Some(60_000), 1, false, APS).unwrap();
        assert_eq!(frame.timestamp, 60_000);
    }

    #[test]
    fn scenario_approximate_read_returns_on_first_decoded_frame_even_mid_overshoot() {
        let mut source = FakeDemuxer::linear(31, AVG_TSPF);
        source.next_seek_overshoots_to = Some(25);
        let mut resolver = TimestampResolver::new(AVG_TSPF);

        // approximate=true must not trigger overshoot recovery; it returns
        // whatever the first post-seek decoded frame is.
        let frame = PositionalReader::decode_to_frame(&mut source, &mut resolver, Some(60_000), 1, true, APS).unwrap();
        assert_eq!(frame.timestamp, 75_000);
    }
}
