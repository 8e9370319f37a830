use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};

/// Blocking memory-quota gate shared by all indexes of one engine.
///
/// Foreground writers call `acquire` before pinning document bytes and
/// block until background work (flush, compaction, GC) releases enough
/// to fit under the limit. `release` wakes all waiters; the gate is the
/// only place a foreground transaction may park on background progress.
pub struct Quota {
    limit: usize,
    state: Mutex<QuotaState>,
    freed: Condvar,
}

struct QuotaState {
    used: usize,
    closed: bool,
}

/// Upper bound on a single blocking acquire. A request that cannot be
/// satisfied within this window means background progress has stalled,
/// which is reported as exhaustion rather than waited out forever.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

impl Quota {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            state: Mutex::new(QuotaState {
                used: 0,
                closed: false,
            }),
            freed: Condvar::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.state.lock().unwrap().used
    }

    /// Current usage as a 0..=100 percentile, used for zone selection.
    pub fn percent_used(&self) -> u8 {
        if self.limit == 0 {
            return 0;
        }
        let used = self.used();
        ((used.saturating_mul(100)) / self.limit).min(100) as u8
    }

    /// Reserve `n` bytes, blocking while the gate is over the limit.
    ///
    /// A request larger than the whole limit can never succeed and
    /// fails immediately. Returns `QuotaExceeded` if the gate closes or
    /// no space frees up within the wait bound.
    pub fn acquire(&self, n: usize) -> Result<()> {
        if n > self.limit {
            return Err(Error::QuotaExceeded(n));
        }
        let mut state = self.state.lock().unwrap();
        while state.used + n > self.limit {
            if state.closed {
                return Err(Error::QuotaExceeded(n));
            }
            let (next, timeout) = self
                .freed
                .wait_timeout(state, ACQUIRE_TIMEOUT)
                .map_err(|_| Error::InvalidState("quota lock poisoned".into()))?;
            state = next;
            if timeout.timed_out() && state.used + n > self.limit {
                return Err(Error::QuotaExceeded(n));
            }
        }
        state.used += n;
        Ok(())
    }

    /// Return `n` bytes and wake blocked writers.
    pub fn release(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.used = state.used.saturating_sub(n);
        drop(state);
        self.freed.notify_all();
    }

    /// Stop admitting new reservations; wakes all waiters with failure.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.freed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_release() {
        let quota = Quota::new(100);
        quota.acquire(60).expect("First acquire failed");
        assert_eq!(quota.used(), 60);
        assert_eq!(quota.percent_used(), 60);

        quota.acquire(40).expect("Fill to limit failed");
        assert_eq!(quota.percent_used(), 100);

        quota.release(50);
        assert_eq!(quota.used(), 50);
    }

    #[test]
    fn test_oversized_request_fails_fast() {
        let quota = Quota::new(100);
        assert!(matches!(quota.acquire(101), Err(Error::QuotaExceeded(101))));
    }

    #[test]
    fn test_blocked_writer_resumes_after_release() {
        let quota = Arc::new(Quota::new(100));
        quota.acquire(100).expect("Fill failed");

        let waiter = {
            let quota = quota.clone();
            std::thread::spawn(move || quota.acquire(30))
        };

        // Let the waiter park, then free enough space.
        std::thread::sleep(Duration::from_millis(50));
        quota.release(50);

        waiter
            .join()
            .expect("Waiter panicked")
            .expect("Waiter should acquire after release");
        assert_eq!(quota.used(), 80);
    }

    #[test]
    fn test_close_unblocks_waiters() {
        let quota = Arc::new(Quota::new(10));
        quota.acquire(10).expect("Fill failed");

        let waiter = {
            let quota = quota.clone();
            std::thread::spawn(move || quota.acquire(5))
        };

        std::thread::sleep(Duration::from_millis(50));
        quota.close();

        let result = waiter.join().expect("Waiter panicked");
        assert!(matches!(result, Err(Error::QuotaExceeded(5))));
    }
}
