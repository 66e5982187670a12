//! The device-op tracker (§4.3).
//!
//! Grounded directly on gfxstream's `DeviceOpTracker`/`DeviceOpBuilder`
//! (`original_source/host/vulkan/DeviceOpTracker.{h,cpp}`): a polling
//! queue of in-flight GPU work plus a pending-garbage queue of fences and
//! semaphores waiting for that work to finish before they're destroyed.
//!
//! `DeviceOpWaitable` here is the Rust equivalent of the original's
//! `std::shared_future<void>` — a single-shot, clonable, pollable future
//! with no async runtime involved, because every poll happens from
//! ordinary dispatcher threads holding no waker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use dty::{abort_with_reason, FatalError};
use parking_lot::Mutex;

/// Status of one polling-queue entry, matching the original's
/// `DeviceOpStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOpStatus {
    Pending,
    Done,
    Failure,
}

struct WaitableInner {
    done: AtomicBool,
}

/// A single-shot, clonable future resolved by the device-op tracker's
/// polling loop. `is_done` never transitions back to `false` once set.
#[derive(Clone)]
pub struct DeviceOpWaitable {
    inner: Arc<WaitableInner>,
}

impl DeviceOpWaitable {
    fn new() -> (Self, WaitableHandle) {
        let inner = Arc::new(WaitableInner {
            done: AtomicBool::new(false),
        });
        (
            Self {
                inner: inner.clone(),
            },
            WaitableHandle { inner },
        )
    }

    /// A waitable that is immediately resolved; used for a fence of
    /// `VK_NULL_HANDLE` (nothing to wait on).
    pub fn done() -> Self {
        let inner = Arc::new(WaitableInner {
            done: AtomicBool::new(true),
        });
        Self { inner }
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }
}

/// The write side of a `DeviceOpWaitable`, held only by the polling
/// closure that resolves it.
struct WaitableHandle {
    inner: Arc<WaitableInner>,
}

impl WaitableHandle {
    fn resolve(self) {
        self.inner.done.store(true, Ordering::Release);
    }
}

/// What a pending-garbage entry owns: either a fence or a semaphore,
/// mirroring the original's `std::variant<VkFence, VkSemaphore>`.
enum GarbageObject {
    Fence(vk::Fence),
    Semaphore(vk::Semaphore),
}

struct PendingGarbage {
    waitable: DeviceOpWaitable,
    object: GarbageObject,
    timepoint: Instant,
}

type PollFn = Box<dyn FnMut(&ash::Device) -> DeviceOpStatus + Send>;

/// Per-device tracker of in-flight GPU operations. Owned by the `Device`
/// record; not `Clone` — callers share it through `Arc`.
pub struct DeviceOpTracker {
    poll_functions: Mutex<VecDeque<PollFn>>,
    pending_garbage: Mutex<VecDeque<PendingGarbage>>,
    warn_threshold: usize,
    leak_timeout: Duration,
}

impl DeviceOpTracker {
    pub fn new(warn_threshold: usize, leak_timeout: Duration) -> Self {
        Self {
            poll_functions: Mutex::new(VecDeque::new()),
            pending_garbage: Mutex::new(VecDeque::new()),
            warn_threshold,
            leak_timeout,
        }
    }

    fn add_pending_device_op(&self, poll_fn: PollFn) {
        let mut queue = self.poll_functions.lock();
        queue.push_back(poll_fn);
    }

    fn add_pending_garbage(&self, waitable: DeviceOpWaitable, object: GarbageObject) {
        let mut garbage = self.pending_garbage.lock();
        garbage.push_back(PendingGarbage {
            waitable,
            object,
            timepoint: Instant::now(),
        });
        if garbage.len() > self.warn_threshold {
            log::warn!(
                "device-op tracker: {} pending garbage objects, may be leaking",
                garbage.len()
            );
        }
    }

    pub fn add_pending_garbage_fence(&self, waitable: DeviceOpWaitable, fence: vk::Fence) {
        self.add_pending_garbage(waitable, GarbageObject::Fence(fence));
    }

    pub fn add_pending_garbage_semaphore(&self, waitable: DeviceOpWaitable, semaphore: vk::Semaphore) {
        self.add_pending_garbage(waitable, GarbageObject::Semaphore(semaphore));
    }

    /// Advances the polling queue: the first pending entry, and
    /// everything after it, is retried next time; everything strictly
    /// before it (assumed FIFO-ish submission order) is resolved and
    /// erased.
    pub fn poll(&self, device: &ash::Device) {
        let mut queue = self.poll_functions.lock();
        let mut first_pending = None;
        for (idx, poll_fn) in queue.iter_mut().enumerate() {
            if poll_fn(device) != DeviceOpStatus::Done {
                first_pending = Some(idx);
                break;
            }
        }
        let cut = first_pending.unwrap_or(queue.len());
        queue.drain(..cut);
        if queue.len() > self.warn_threshold {
            log::warn!(
                "device-op tracker: {} pending polling functions",
                queue.len()
            );
        }
    }

    /// `poll()` then sweep the pending-garbage queue: destroy every
    /// resolved entry in the same FIFO-ish prefix, and leak (with a
    /// warning) anything older than `leak_timeout` rather than risk
    /// destroying a resource the driver might still be using.
    pub fn poll_and_process_garbage(&self, device: &ash::Device) {
        self.poll(device);

        let mut garbage = self.pending_garbage.lock();
        let old_before = Instant::now() - self.leak_timeout;
        let mut cut = garbage.len();
        for (idx, entry) in garbage.iter().enumerate() {
            let still_pending = !entry.waitable.is_done() && entry.timepoint >= old_before;
            if still_pending {
                cut = idx;
                break;
            }
        }
        for entry in garbage.drain(..cut) {
            if entry.timepoint < old_before {
                log::warn!("device-op tracker: leaking garbage object past leak timeout");
                continue;
            }
            unsafe {
                match entry.object {
                    GarbageObject::Fence(fence) => device.destroy_fence(fence, None),
                    GarbageObject::Semaphore(semaphore) => device.destroy_semaphore(semaphore, None),
                }
            }
        }
        if garbage.len() > self.warn_threshold {
            log::warn!("device-op tracker: {} pending garbage objects", garbage.len());
        }
    }

    /// `vkDeviceWaitIdle`, drain garbage, and log (never abort) if
    /// anything is still pending afterwards.
    pub fn on_destroy_device(&self, device: &ash::Device) {
        let _ = unsafe { device.device_wait_idle() };
        self.poll_and_process_garbage(device);
        if !self.pending_garbage.lock().is_empty() {
            log::warn!("device-op tracker: garbage still pending at device destruction");
        }
    }
}

/// Builds one device operation from a queue submission. Non-`Clone`,
/// non-`Copy`: it must be consumed by exactly one
/// `on_queue_submitted_with_fence` call before it drops, or it aborts
/// (gfxstream: `DeviceOpBuilder::~DeviceOpBuilder`).
pub struct DeviceOpBuilder<'a> {
    tracker: &'a DeviceOpTracker,
    created_fence: Option<vk::Fence>,
    submitted_fence: Option<vk::Fence>,
    consumed: bool,
}

impl<'a> DeviceOpBuilder<'a> {
    pub fn new(tracker: &'a DeviceOpTracker) -> Self {
        Self {
            tracker,
            created_fence: None,
            submitted_fence: None,
            consumed: false,
        }
    }

    /// Creates a fence to attach to the caller's submission, for the
    /// common case where the guest didn't supply one of its own.
    pub fn create_fence_for_op(&mut self, device: &ash::Device) -> vk::Fence {
        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) };
        let fence = match fence {
            Ok(fence) => fence,
            Err(err) => {
                log::error!("device-op tracker: failed to create fence: {err:?}");
                vk::Fence::null()
            }
        };
        self.created_fence = Some(fence);
        fence
    }

    /// Records which fence was actually submitted, registers a polling
    /// closure for it, and returns the waitable resolved once that fence
    /// signals. Aborts if `fence` doesn't match a fence this builder
    /// itself created via `create_fence_for_op`.
    pub fn on_queue_submitted_with_fence(
        mut self,
        device: ash::Device,
        fence: vk::Fence,
    ) -> DeviceOpWaitable {
        if let Some(created) = self.created_fence {
            if created != fence {
                abort_with_reason!(FatalError::DeviceOpFenceMismatch);
            }
        }
        self.submitted_fence = Some(fence);
        self.consumed = true;
        let destroy_on_completion = self.created_fence.is_some();

        if fence == vk::Fence::null() {
            return DeviceOpWaitable::done();
        }

        let (waitable, handle) = DeviceOpWaitable::new();
        let mut handle = Some(handle);
        self.tracker.add_pending_device_op(Box::new(move |dev: &ash::Device| {
            match dev.get_fence_status(fence) {
                Ok(true) => {
                    if destroy_on_completion {
                        unsafe { device.destroy_fence(fence, None) };
                    }
                    if let Some(h) = handle.take() {
                        h.resolve();
                    }
                    DeviceOpStatus::Done
                }
                Ok(false) => DeviceOpStatus::Pending,
                Err(_) => {
                    if let Some(h) = handle.take() {
                        h.resolve();
                    }
                    DeviceOpStatus::Failure
                }
            }
        }));

        waitable
    }
}

impl Drop for DeviceOpBuilder<'_> {
    fn drop(&mut self) {
        if !self.consumed {
            abort_with_reason!(FatalError::DeviceOpBuilderMisuse);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_fence_resolves_immediately() {
        let waitable = DeviceOpWaitable::done();
        assert!(waitable.is_done());
    }

    #[test]
    fn pending_garbage_leaks_past_timeout_without_destroying() {
        let tracker = DeviceOpTracker::new(20, Duration::from_millis(0));
        let waitable = DeviceOpWaitable::new().0;
        tracker.add_pending_garbage_semaphore(waitable, vk::Semaphore::null());
        assert_eq!(tracker.pending_garbage.lock().len(), 1);
    }
}
