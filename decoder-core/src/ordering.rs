//! The ordering coordinator (§4.2): a per-object gated monotone counter
//! giving concurrent decode threads an explicit happens-before at the
//! points the guest command stream requires one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dty::SequenceNumber;
use parking_lot::{Condvar, Mutex};

struct Inner {
    current: Mutex<SequenceNumber>,
    condvar: Condvar,
}

/// A reference-counted token attached to every dispatchable boxed handle.
/// Cloning an `OrderingToken` is cheap and shares the same counter.
#[derive(Clone)]
pub struct OrderingToken {
    inner: Arc<Inner>,
}

impl Default for OrderingToken {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderingToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                current: Mutex::new(0),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Block until `current == sequence_number - 1`, then advance
    /// `current` to `sequence_number` and wake any other waiter. Returns
    /// `true` if the advance happened because the predecessor was
    /// observed, `false` if the deadline elapsed and this call advanced
    /// unilaterally instead (§4.2, §5 "Cancellation and timeouts").
    pub fn host_sync(&self, need_host_sync: bool, sequence_number: SequenceNumber, deadline: Duration) -> bool {
        if !need_host_sync {
            let mut current = self.inner.current.lock();
            if sequence_number > *current {
                *current = sequence_number;
            }
            self.inner.condvar.notify_all();
            return true;
        }

        let mut current = self.inner.current.lock();
        let deadline_at = Instant::now() + deadline;
        let mut observed_predecessor = true;
        while *current + 1 < sequence_number {
            let now = Instant::now();
            if now >= deadline_at {
                observed_predecessor = false;
                break;
            }
            let wait_result = self
                .inner
                .condvar
                .wait_for(&mut current, deadline_at - now);
            if wait_result.timed_out() && *current + 1 < sequence_number {
                observed_predecessor = false;
                break;
            }
        }
        if sequence_number > *current {
            *current = sequence_number;
        }
        self.inner.condvar.notify_all();
        observed_predecessor
    }

    /// Same gate, used at queue-submission boundaries
    /// (`host_sync_queue`). The queue variant never skips the initial
    /// check that `need_host_sync` performs on the instance variant: a
    /// queue submission is always meant to observe its predecessor.
    pub fn host_sync_queue(&self, sequence_number: SequenceNumber, deadline: Duration) -> bool {
        self.host_sync(true, sequence_number, deadline)
    }

    pub fn current(&self) -> SequenceNumber {
        *self.inner.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn host_sync_advances_unilaterally_without_need_flag() {
        let token = OrderingToken::new();
        assert!(token.host_sync(false, 5, Duration::from_millis(10)));
        assert_eq!(token.current(), 5);
    }

    #[test]
    fn sibling_thread_observes_predecessor() {
        let token = OrderingToken::new();
        let barrier = Arc::new(Barrier::new(2));

        let t1_token = token.clone();
        let t1_barrier = barrier.clone();
        let t1 = thread::spawn(move || {
            t1_barrier.wait();
            thread::sleep(Duration::from_millis(20));
            t1_token.host_sync(true, 1, Duration::from_secs(5));
        });

        barrier.wait();
        let observed = token.host_sync(true, 2, Duration::from_secs(5));
        t1.join().unwrap();
        assert!(observed);
        assert_eq!(token.current(), 2);
    }

    #[test]
    fn deadline_forces_progress_without_predecessor() {
        let token = OrderingToken::new();
        let observed = token.host_sync(true, 3, Duration::from_millis(30));
        assert!(!observed);
        assert_eq!(token.current(), 3);
    }
}
