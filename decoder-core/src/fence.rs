//! Per-fence condition-variable protocol (§3 Semaphore/Fence, §4.8
//! "Submission and fencing"): a fence moves through
//! `not-waitable -> waitable -> waiting` so that `wait_for_fence` can
//! never observe a fence as waitable before the submitting thread has
//! finished recording its `latest_use`.

use ash::vk;
use parking_lot::{Condvar, Mutex};

use crate::device_op_tracker::DeviceOpWaitable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    NotWaitable,
    Waitable,
    Waiting,
}

pub struct FenceRecord {
    pub raw: vk::Fence,
    /// Set when the fence backs an externally-imported/exported sync
    /// object; destruction routes through the external-fence pool
    /// instead of a plain `vkDestroyFence`.
    pub external: bool,
    state: Mutex<FenceState>,
    condvar: Condvar,
    latest_use: Mutex<Option<DeviceOpWaitable>>,
}

impl FenceRecord {
    pub fn new(raw: vk::Fence, external: bool) -> Self {
        Self {
            raw,
            external,
            state: Mutex::new(FenceState::NotWaitable),
            condvar: Condvar::new(),
            latest_use: Mutex::new(None),
        }
    }

    pub fn set_latest_use(&self, waitable: DeviceOpWaitable) {
        *self.latest_use.lock() = Some(waitable);
    }

    pub fn latest_use_is_done(&self) -> bool {
        match self.latest_use.lock().as_ref() {
            Some(waitable) => waitable.is_done(),
            None => true,
        }
    }

    /// Called by the submitting thread once the native `vkQueueSubmit`
    /// has returned successfully.
    pub fn mark_waitable(&self) {
        let mut state = self.state.lock();
        *state = FenceState::Waitable;
        self.condvar.notify_all();
    }

    /// Blocks until the fence is `Waitable`, transitions to `Waiting`,
    /// and returns — the caller then issues the native
    /// `vkWaitForFences` call itself.
    pub fn begin_wait(&self) {
        let mut state = self.state.lock();
        while *state == FenceState::NotWaitable {
            self.condvar.wait(&mut state);
        }
        *state = FenceState::Waiting;
    }

    /// Non-blocking counterpart to `begin_wait`: a fence that has never
    /// been submitted stays `NotWaitable` forever, so blocking on it would
    /// deadlock the caller. Returns `false` immediately without touching
    /// the state machine in that case; otherwise transitions to `Waiting`
    /// exactly like `begin_wait` and returns `true` (§8 boundary: "a fence
    /// never submitted returns success immediately").
    pub fn try_begin_wait(&self) -> bool {
        let mut state = self.state.lock();
        if *state == FenceState::NotWaitable {
            return false;
        }
        *state = FenceState::Waiting;
        true
    }

    pub fn state(&self) -> FenceState {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn waiter_blocks_until_marked_waitable() {
        let fence = Arc::new(FenceRecord::new(vk::Fence::null(), false));
        let waiter_fence = fence.clone();
        let waiter = thread::spawn(move || {
            waiter_fence.begin_wait();
            waiter_fence.state()
        });

        thread::sleep(Duration::from_millis(20));
        fence.mark_waitable();
        assert_eq!(waiter.join().unwrap(), FenceState::Waiting);
    }

    #[test]
    fn never_submitted_fence_has_no_pending_use() {
        let fence = FenceRecord::new(vk::Fence::null(), false);
        assert!(fence.latest_use_is_done());
    }

    #[test]
    fn try_begin_wait_does_not_block_a_never_submitted_fence() {
        let fence = FenceRecord::new(vk::Fence::null(), false);
        assert!(!fence.try_begin_wait());
        assert_eq!(fence.state(), FenceState::NotWaitable);
    }

    #[test]
    fn try_begin_wait_transitions_once_waitable() {
        let fence = FenceRecord::new(vk::Fence::null(), false);
        fence.mark_waitable();
        assert!(fence.try_begin_wait());
        assert_eq!(fence.state(), FenceState::Waiting);
    }
}
