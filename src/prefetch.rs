//! Background decode-ahead thread with cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, trace};

/// Shared cancellation flag, checked by the prefetch worker between frames
/// and set by whoever wants it to stop.
#[derive(Clone, Default)]
pub struct ThreadCanceler(Arc<AtomicBool>);

impl ThreadCanceler {
    pub fn new() -> Self {
        ThreadCanceler(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What one iteration of background decoding did.
pub enum StepOutcome {
    /// A frame was decoded and cached; keep going.
    Decoded,
    /// End of stream; the worker wrapped back to the start.
    WrappedAround,
    /// Nothing more to do (cancelled, or wrap-around also failed).
    Stop,
}

/// Runs `step` in a loop on a dedicated OS thread until it returns
/// `StepOutcome::Stop` or cancellation is requested. `step` is expected to
/// decode exactly one frame ahead of the playhead per call; it owns its own
/// synchronization with the foreground reader (the decoder lock).
pub struct PrefetchWorker {
    canceler: ThreadCanceler,
    handle: Option<JoinHandle<()>>,
}

impl PrefetchWorker {
    pub fn spawn<F>(mut step: F) -> Self
    where
        F: FnMut(&ThreadCanceler) -> StepOutcome + Send + 'static,
    {
        let canceler = ThreadCanceler::new();
        let worker_canceler = canceler.clone();
        let handle = std::thread::spawn(move || {
            debug!("prefetch worker started");
            loop {
                if worker_canceler.is_cancelled() {
                    break;
                }
                match step(&worker_canceler) {
                    StepOutcome::Decoded => trace!("prefetch decoded one frame"),
                    StepOutcome::WrappedAround => trace!("prefetch wrapped to start of stream"),
                    StepOutcome::Stop => break,
                }
            }
            debug!("prefetch worker exiting");
        });

        PrefetchWorker {
            canceler,
            handle: Some(handle),
        }
    }

    pub fn canceler(&self) -> ThreadCanceler {
        self.canceler.clone()
    }

    /// Requests cancellation without waiting for the thread to exit. The
    /// worker may be parked inside the caller's own blocking call (e.g. a
    /// full cache); callers that need the thread to actually stop must
    /// unblock whatever it's waiting on before calling `join`.
    pub fn cancel(&self) {
        self.canceler.cancel();
    }

    /// Joins the worker thread. Only returns once the thread has observed
    /// cancellation and exited, so callers must unblock anything it might be
    /// parked on (e.g. a full cache) before calling this.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Requests cancellation and joins the worker thread.
    pub fn stop(self) {
        self.cancel();
        self.join();
    }
}

impl Drop for PrefetchWorker {
    fn drop(&mut self) {
        self.canceler.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cancel_then_unblock_then_join_does_not_hang() {
        use std::sync::{Condvar, Mutex};

        // Mirrors the cache-backpressure deadlock: the worker parks on a
        // condvar until told to stop *and* something wakes it. `cancel()`
        // alone must not be enough to unwedge it; only after the condvar is
        // notified (standing in for `remove_oldest`/`clear`) does `join()`
        // return.
        let parked = Arc::new((Mutex::new(false), Condvar::new()));
        let parked2 = parked.clone();

        let worker = PrefetchWorker::spawn(move |canceler| {
            let (lock, cvar) = &*parked2;
            let mut woken = lock.lock().unwrap();
            while !*woken && !canceler.is_cancelled() {
                woken = cvar.wait(woken).unwrap();
            }
            StepOutcome::Stop
        });

        worker.cancel();

        let (lock, cvar) = &*parked;
        *lock.lock().unwrap() = true;
        cvar.notify_all();

        worker.join();
    }

    #[test]
    fn worker_stops_on_cancel() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let worker = PrefetchWorker::spawn(move |canceler| {
            count2.fetch_add(1, Ordering::SeqCst);
            if canceler.is_cancelled() {
                StepOutcome::Stop
            } else {
                std::thread::sleep(std::time::Duration::from_millis(1));
                StepOutcome::Decoded
            }
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        worker.stop();
        assert!(count.load(Ordering::SeqCst) > 0);
    }
}
