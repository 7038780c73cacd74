//! Ordered, timestamp-keyed store of decoded frames with a bounded working
//! zone and a playhead.
//!
//! The cache is driven exclusively by `PositionalReader` under its decoder
//! lock; the one exception is capacity backpressure, which uses its own
//! internal `Mutex` + `Condvar` pair (mirroring the condition-variable
//! primitive sketched in the teacher's prefetch-cancellation experiment) so
//! a blocked prefetch worker can be woken by a foreground `remove_oldest`
//! without requiring the foreground to also hold the decoder lock.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::frame::{Disposer, Frame};
use crate::types::{Timestamp, VideoSection};

/// How aggressively the cache evicts frames outside the live window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityMode {
    /// Evict frames outside `[playhead - back_window, playhead + forward_window]`.
    Bounded {
        back_window: usize,
        forward_window: usize,
    },
    /// Never evict; used while materializing an entire working zone via `read_many`.
    Disabled,
}

struct State {
    frames: VecDeque<Frame>,
    playhead: Option<usize>,
    working_zone: VideoSection,
    capacity: CapacityMode,
    prepend_block: bool,
}

/// Timestamp-ordered cache of decoded frames.
pub struct FrameCache {
    state: Mutex<State>,
    capacity_freed: Condvar,
    disposer: Disposer,
}

impl FrameCache {
    pub fn new(disposer: Disposer, capacity: CapacityMode) -> Self {
        FrameCache {
            state: Mutex::new(State {
                frames: VecDeque::new(),
                playhead: None,
                working_zone: VideoSection::EMPTY,
                capacity,
                prepend_block: false,
            }),
            capacity_freed: Condvar::new(),
            disposer,
        }
    }

    pub fn set_prepend_block(&self, prepend: bool) {
        self.state.lock().unwrap().prepend_block = prepend;
    }

    pub fn disable_capacity_check(&self) {
        self.state.lock().unwrap().capacity = CapacityMode::Disabled;
    }

    pub fn set_capacity(&self, capacity: CapacityMode) {
        self.state.lock().unwrap().capacity = capacity;
    }

    pub fn working_zone(&self) -> VideoSection {
        self.state.lock().unwrap().working_zone
    }

    pub fn set_working_zone(&self, zone: VideoSection) {
        let mut state = self.state.lock().unwrap();
        state.working_zone = zone;
        Self::evict_outside_zone(&mut state, &self.disposer);
    }

    /// Inserts `frame` in timestamp order. A duplicate timestamp is a silent
    /// no-op (and disposes the incoming frame immediately, since the cache
    /// never holds two live frames for one timestamp). Blocks on the
    /// capacity condvar while the live window has no room, until a
    /// foreground caller frees a slot via `remove_oldest`/`clear`.
    pub fn add(&self, frame: Frame) {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(idx) = Self::find_insertion_point(&state.frames, frame.timestamp) {
                if idx < state.frames.len() && state.frames[idx].timestamp == frame.timestamp {
                    frame.mark_disposed();
                    (self.disposer)(&frame);
                    return;
                }
                if !Self::has_room(&state) {
                    state = self.capacity_freed.wait(state).unwrap();
                    continue;
                }
                let insert_at = if state.prepend_block { 0 } else { idx };
                state.frames.insert(insert_at, frame);
                if let Some(ph) = state.playhead {
                    if insert_at <= ph {
                        state.playhead = Some(ph + 1);
                    }
                }
                Self::evict_outside_zone(&mut state, &self.disposer);
                return;
            }
        }
    }

    fn find_insertion_point(frames: &VecDeque<Frame>, ts: Timestamp) -> Option<usize> {
        Some(frames.partition_point(|f| f.timestamp < ts))
    }

    fn has_room(state: &State) -> bool {
        match state.capacity {
            CapacityMode::Disabled => true,
            CapacityMode::Bounded { forward_window, .. } => {
                let Some(ph) = state.playhead else {
                    return true;
                };
                let ahead = state.frames.len().saturating_sub(ph + 1);
                ahead < forward_window
            }
        }
    }

    fn evict_outside_zone(state: &mut State, disposer: &Disposer) {
        let CapacityMode::Bounded {
            back_window,
            forward_window,
        } = state.capacity
        else {
            return;
        };
        let Some(mut ph) = state.playhead else { return };

        while ph > back_window {
            let Some(front) = state.frames.pop_front() else { break };
            front.mark_disposed();
            (disposer)(&front);
            ph -= 1;
        }
        state.playhead = Some(ph);

        while state.frames.len().saturating_sub(ph + 1) > forward_window {
            let Some(back) = state.frames.pop_back() else { break };
            back.mark_disposed();
            (disposer)(&back);
        }
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        let state = self.state.lock().unwrap();
        state.frames.binary_search_by_key(&ts, |f| f.timestamp).is_ok()
    }

    /// Moves the playhead to the frame with timestamp `ts`. Returns whether
    /// it was found.
    pub fn move_to(&self, ts: Timestamp) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.frames.binary_search_by_key(&ts, |f| f.timestamp) {
            Ok(idx) => {
                state.playhead = Some(idx);
                true
            }
            Err(_) => false,
        }
    }

    pub fn has_next(&self) -> bool {
        let state = self.state.lock().unwrap();
        match state.playhead {
            Some(ph) => ph + 1 < state.frames.len(),
            None => false,
        }
    }

    /// Advances the playhead by one. The caller is responsible for having
    /// synchronously decoded the next frame first if `has_next()` was false.
    pub fn move_next(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(ph) = state.playhead {
            if ph + 1 < state.frames.len() {
                state.playhead = Some(ph + 1);
            }
        } else if !state.frames.is_empty() {
            state.playhead = Some(0);
        }
    }

    pub fn current_timestamp(&self) -> Option<Timestamp> {
        let state = self.state.lock().unwrap();
        state.playhead.and_then(|ph| state.frames.get(ph)).map(|f| f.timestamp)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().frames.len()
    }

    /// True iff `ts` targets the start of the working zone while the cache's
    /// playhead currently sits at the end of it: the signature of looped
    /// playback wrapping around, as opposed to an arbitrary backward seek.
    pub fn is_rollover_jump(&self, ts: Timestamp) -> bool {
        let state = self.state.lock().unwrap();
        if state.working_zone.is_empty() {
            return false;
        }
        let at_zone_end = state
            .playhead
            .and_then(|ph| state.frames.get(ph))
            .map(|f| f.timestamp >= state.working_zone.end)
            .unwrap_or(false);
        at_zone_end && ts <= state.working_zone.start
    }

    /// Evicts a single front-most (oldest) frame, to unblock a prefetch
    /// worker parked in `add` on a full forward window, or to make room
    /// while preserving the rest of the cache on a rollover jump.
    pub fn remove_oldest(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(front) = state.frames.pop_front() {
            front.mark_disposed();
            (self.disposer)(&front);
            if let Some(ph) = state.playhead {
                state.playhead = Some(ph.saturating_sub(1));
            }
        }
        drop(state);
        self.capacity_freed.notify_all();
    }

    /// Disposes every frame and resets the playhead.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        for frame in state.frames.drain(..) {
            frame.mark_disposed();
            (self.disposer)(&frame);
        }
        state.playhead = None;
        drop(state);
        self.capacity_freed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ImageBuffer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn frame(ts: Timestamp) -> Frame {
        Frame::new(ts, ImageBuffer::new(4, 4, 12, vec![0u8; 48]))
    }

    #[test]
    fn add_orders_by_timestamp() {
        let cache = FrameCache::new(crate::frame::noop_disposer(), CapacityMode::Disabled);
        cache.add(frame(30));
        cache.add(frame(10));
        cache.add(frame(20));
        assert!(cache.move_to(10));
        assert!(cache.has_next());
        cache.move_next();
        assert_eq!(cache.current_timestamp(), Some(20));
    }

    #[test]
    fn duplicate_add_is_noop() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let cache = FrameCache::new(
            Box::new(move |_f| {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
            CapacityMode::Disabled,
        );
        cache.add(frame(10));
        cache.add(frame(10));
        assert_eq!(cache.len(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn move_to_missing_timestamp_fails() {
        let cache = FrameCache::new(crate::frame::noop_disposer(), CapacityMode::Disabled);
        cache.add(frame(10));
        assert!(!cache.move_to(20));
    }

    #[test]
    fn clear_disposes_all_frames() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let cache = FrameCache::new(
            Box::new(move |_f| {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
            CapacityMode::Disabled,
        );
        cache.add(frame(10));
        cache.add(frame(20));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn remove_oldest_wakes_blocked_add() {
        let cache = Arc::new(FrameCache::new(
            crate::frame::noop_disposer(),
            CapacityMode::Bounded {
                back_window: 0,
                forward_window: 1,
            },
        ));
        cache.add(frame(0));
        cache.move_to(0);
        cache.add(frame(1));
        assert_eq!(cache.len(), 2);

        let cache2 = cache.clone();
        let handle = std::thread::spawn(move || {
            cache2.add(frame(2));
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        cache.remove_oldest();
        handle.join().unwrap();
        assert!(cache.contains(2));
    }
}
