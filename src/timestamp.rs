//! Presentation-timestamp reconstruction.
//!
//! Muxers frequently omit PTS, deliver DTS instead, and the codec's own
//! reorder buffer delays frame emission by one slot relative to the packet
//! that triggered it. `TimestampResolver` tracks just enough state to turn
//! that stream of `(dts, pts, decoded)` observations into a monotonically
//! sane `current` presentation timestamp, without ever looking ahead.

use crate::types::Timestamp;

/// Resolver state, carried across an entire decode session and reset on seek.
#[derive(Debug, Clone, Copy)]
pub struct TimestampInfo {
    /// Best-available presentation timestamp for the most recently emitted frame.
    pub current: Timestamp,
    /// Presentation timestamp last assigned to a fully decoded frame.
    last_decoded: Timestamp,
    /// A PTS/DTS the codec announced while still buffering (reorder delay).
    buffered: Timestamp,
}

impl Default for TimestampInfo {
    fn default() -> Self {
        TimestampInfo {
            current: -1,
            last_decoded: -1,
            buffered: i64::MAX,
        }
    }
}

/// Per-session resolver. Needs to know `avg_tspf` (average timestamps per
/// frame) to extrapolate when both PTS and DTS are missing.
#[derive(Debug, Clone, Copy)]
pub struct TimestampResolver {
    info: TimestampInfo,
    avg_tspf: Timestamp,
}

impl TimestampResolver {
    pub fn new(avg_tspf: Timestamp) -> Self {
        TimestampResolver {
            info: TimestampInfo::default(),
            avg_tspf,
        }
    }

    /// Resets all tracked state; called on every seek.
    pub fn reset(&mut self) {
        self.info = TimestampInfo::default();
    }

    pub fn current(&self) -> Timestamp {
        self.info.current
    }

    /// Feeds one packet's timing metadata through the resolver.
    ///
    /// `dts`/`pts` are `None` when the codec/container didn't supply a
    /// value. `decoded` is true once the codec has produced a finished
    /// picture for this packet (as opposed to still buffering it).
    pub fn observe(&mut self, dts: Option<Timestamp>, pts: Option<Timestamp>, decoded: bool) {
        match (pts, decoded) {
            (Some(pts), true) => {
                if self.info.buffered < pts {
                    self.info.current = self.info.buffered;
                    self.info.buffered = pts;
                } else {
                    self.info.current = pts;
                }
                self.info.last_decoded = self.info.current;
            }
            (Some(pts), false) => {
                self.info.buffered = pts;
            }
            (None, true) => self.observe_decoded_without_pts(dts),
            (None, false) => self.observe_buffering_without_pts(dts),
        }
    }

    fn observe_decoded_without_pts(&mut self, dts: Option<Timestamp>) {
        match dts {
            None => {
                if self.info.buffered < i64::MAX {
                    self.info.current = self.info.buffered;
                    self.info.buffered = i64::MAX;
                } else if self.info.last_decoded >= 0 {
                    self.info.current = self.info.last_decoded + self.avg_tspf;
                } else {
                    self.info.current = 0;
                }
            }
            Some(dts) => {
                if self.info.buffered < dts {
                    self.info.current = self.info.buffered;
                    self.info.buffered = dts;
                } else {
                    self.info.current = dts.max(0);
                }
            }
        }
        self.info.last_decoded = self.info.current;
    }

    fn observe_buffering_without_pts(&mut self, dts: Option<Timestamp>) {
        self.info.buffered = match dts {
            Some(dts) if dts < 0 => i64::MAX,
            Some(dts) => dts,
            None => 0,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pts_present_simple_case() {
        let mut r = TimestampResolver::new(1000);
        r.observe(Some(0), Some(0), true);
        assert_eq!(r.current(), 0);
        r.observe(Some(1000), Some(1000), true);
        assert_eq!(r.current(), 1000);
    }

    #[test]
    fn pts_present_with_reorder_delay() {
        let mut r = TimestampResolver::new(1000);
        // one frame buffered (B-frame reorder), pts 2000 announced early
        r.observe(Some(0), Some(2000), false);
        // next packet decoded with smaller pts than buffered -> emit buffered first
        r.observe(Some(1000), Some(1000), true);
        assert_eq!(r.current(), 2000);
    }

    #[test]
    fn missing_pts_present_dts_extrapolates_on_missing_dts() {
        let mut r = TimestampResolver::new(500);
        r.observe(Some(0), None, true);
        assert_eq!(r.current(), 0);
        r.observe(None, None, true);
        assert_eq!(r.current(), 500);
    }

    #[test]
    fn missing_pts_and_dts_starts_at_zero() {
        let mut r = TimestampResolver::new(500);
        r.observe(None, None, true);
        assert_eq!(r.current(), 0);
    }

    #[test]
    fn negative_dts_while_buffering_is_hopeless() {
        let mut r = TimestampResolver::new(500);
        r.observe(Some(-1), None, false);
        // buffered is now i64::MAX sentinel; a later decoded-without-pts,
        // without-dts observation falls through to last_decoded/zero path
        r.observe(None, None, true);
        assert_eq!(r.current(), 0);
    }

    #[test]
    fn missing_pts_present_dts_exact_trace_from_spec() {
        // (dts=3000, pts=None, decoded=false) then (dts=6000, pts=None, decoded=true)
        let mut r = TimestampResolver::new(1000);
        r.observe(Some(3000), None, false);
        assert_eq!(r.info.buffered, 3000);
        r.observe(Some(6000), None, true);
        assert_eq!(r.current(), 3000);
        assert_eq!(r.info.buffered, 6000);
        assert_eq!(r.info.last_decoded, 3000);
    }

    #[test]
    fn reset_clears_state() {
        let mut r = TimestampResolver::new(1000);
        r.observe(Some(0), Some(5000), true);
        assert_eq!(r.current(), 5000);
        r.reset();
        assert_eq!(r.current(), -1);
    }
}
