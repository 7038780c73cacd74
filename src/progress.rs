//! Progress reporting for long-running bulk reads (`read_many`).
//!
//! A lock-free progress counter callers can poll from another thread while
//! `read_many` runs under the decoder lock, plus a way to request it stop
//! early. Packs `count`/`total` into one `AtomicI64` (low 32 bits count, high
//! 32 bits total) rather than a `Mutex<(u32, u32)>`.

use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    Uninitialized,
    InProgress { total: u32, count: u32 },
    Finished { total: u32 },
}

#[derive(Debug, Default)]
pub struct ProgressBar(AtomicI64);

impl ProgressBar {
    /// Resets the bar to `0 / new_total`. Waits out a concurrent in-progress
    /// bar rather than clobbering it.
    pub fn start(&self, new_total: u32) {
        while self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::Acquire, |x| {
                match to_progress(x) {
                    Progress::InProgress { .. } => None,
                    _ => Some((new_total as i64) << 32),
                }
            })
            .is_err()
        {
            self.interrupt();
        }
    }

    pub fn get(&self) -> Progress {
        to_progress(self.0.load(Ordering::Relaxed))
    }

    /// Advances the count by `n`. Returns an error if the bar was
    /// interrupted since the last `start`.
    pub fn add(&self, n: i64) -> Result<(), Interrupted> {
        let old = self.0.fetch_add(n, Ordering::Relaxed);
        if old < 0 {
            return Err(Interrupted);
        }
        Ok(())
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    /// Requests that the current bulk read stop as soon as it next checks in.
    pub fn interrupt(&self) {
        self.0.store(i64::MIN, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct Interrupted;

fn to_progress(x: i64) -> Progress {
    let count = x as u32;
    let total = (x >> 32) as u32;
    match (count, total) {
        (0, 0) => Progress::Uninitialized,
        (count, total) if count >= total && total > 0 => Progress::Finished { total },
        _ => Progress::InProgress { total, count },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uninitialized() {
        assert_eq!(ProgressBar::default().get(), Progress::Uninitialized);
    }

    #[test]
    fn tracks_count_against_total() {
        let bar = ProgressBar::default();
        bar.start(10);
        bar.add(3).unwrap();
        assert_eq!(bar.get(), Progress::InProgress { total: 10, count: 3 });
        bar.add(7).unwrap();
        assert_eq!(bar.get(), Progress::Finished { total: 10 });
    }

    #[test]
    fn interrupt_fails_subsequent_add() {
        let bar = ProgressBar::default();
        bar.start(10);
        bar.interrupt();
        assert!(bar.add(1).is_err());
    }
}
