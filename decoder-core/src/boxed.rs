//! The boxed-handle manager (§4.1): a bidirectional map between stable
//! 64-bit guest-visible tokens and native Vulkan handles.
//!
//! Grounded on `wgpu_core::registry::Storage`'s block-array-of-slots
//! design, but traded for a `parking_lot::RwLock<FxHashMap<..>>` rather
//! than `wgpu_core`'s unsafe fixed-size-block/seqlock storage — see
//! DESIGN.md's Open Questions for why that simplification is safe here
//! (this decoder has no per-frame allocation-rate requirement anywhere
//! near wgpu-core's hot id-allocation path).

use std::sync::Arc;

use dty::{BoxedHandle, FatalError, HandleKind};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

type OnRemove = Box<dyn FnOnce() + Send>;

/// What a boxed entry points at. Dispatchable kinds additionally carry a
/// dispatch-table handle (here, an `Arc<dyn std::any::Any + Send + Sync>`
/// so the manager stays generic over `decoder-hal`'s concrete
/// `InstanceShared`/`DeviceShared` types); non-dispatchable kinds carry
/// only the raw integer value of the native handle.
struct Entry {
    underlying: u64,
    kind: HandleKind,
    dispatch: Option<Arc<dyn std::any::Any + Send + Sync>>,
}

/// The boxed-handle manager proper. One instance is owned by
/// `VkDecoderGlobalState` (§2 top-level facade) and shared by every
/// dispatcher.
pub struct BoxedHandleManager {
    forward: RwLock<FxHashMap<u64, Entry>>,
    reverse: RwLock<FxHashMap<(HandleKind, u64), u64>>,
    /// Tokens whose erasure was deferred via `remove_delayed`, grouped by
    /// the underlying device they belong to, so `process_delayed_removes`
    /// can drain exactly the device whose callers know it's safe to hold
    /// the global lock (§4.1).
    delayed: Mutex<FxHashMap<u64, Vec<(u64, OnRemove)>>>,
}

impl Default for BoxedHandleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BoxedHandleManager {
    pub fn new() -> Self {
        Self {
            forward: RwLock::new(FxHashMap::default()),
            reverse: RwLock::new(FxHashMap::default()),
            delayed: Mutex::new(FxHashMap::default()),
        }
    }

    /// Box a freshly created native handle, returning its token.
    pub fn add<T>(&self, kind: HandleKind, underlying: u64) -> BoxedHandle<T> {
        self.add_with_dispatch(kind, underlying, None)
    }

    /// Box a dispatchable handle, additionally recording its dispatch
    /// table so later calls on the same boxed token don't need to walk
    /// back up to the parent instance/device.
    pub fn add_with_dispatch<T>(
        &self,
        kind: HandleKind,
        underlying: u64,
        dispatch: Option<Arc<dyn std::any::Any + Send + Sync>>,
    ) -> BoxedHandle<T> {
        let boxed = BoxedHandle::fresh(kind);
        self.forward.write().insert(
            boxed.raw(),
            Entry {
                underlying,
                kind,
                dispatch,
            },
        );
        self.reverse.write().insert((kind, underlying), boxed.raw());
        boxed
    }

    /// Re-insert a token captured by a previous snapshot load, so the
    /// reloaded object keeps the token the guest already has cached.
    pub fn add_fixed<T>(
        &self,
        token: u64,
        kind: HandleKind,
        underlying: u64,
    ) -> BoxedHandle<T> {
        let boxed = BoxedHandle::from_saved(token, kind);
        self.forward.write().insert(
            boxed.raw(),
            Entry {
                underlying,
                kind,
                dispatch: None,
            },
        );
        self.reverse.write().insert((kind, underlying), boxed.raw());
        boxed
    }

    /// Replace the underlying value a token points at, used when a
    /// create-info needed a destroy-and-recreate round trip (e.g. binding
    /// an Android native-buffer image) but the boxed token must survive.
    pub fn update(&self, token: u64, new_underlying: u64) {
        let mut forward = self.forward.write();
        if let Some(entry) = forward.get_mut(&token) {
            let kind = entry.kind;
            let old_underlying = entry.underlying;
            entry.underlying = new_underlying;
            drop(forward);
            let mut reverse = self.reverse.write();
            reverse.remove(&(kind, old_underlying));
            reverse.insert((kind, new_underlying), token);
        }
    }

    pub fn remove(&self, token: u64) {
        if let Some(entry) = self.forward.write().remove(&token) {
            self.reverse.write().remove(&(entry.kind, entry.underlying));
        }
    }

    /// Defers a token's erasure until the next `process_delayed_removes`
    /// call for the same `device`, rather than erasing it inline. `get`
    /// still resolves the token in the meantime — this lets a destroy
    /// call be reordered behind in-flight use of the same object instead
    /// of racing it (§4.1).
    pub fn remove_delayed(&self, token: u64, device: u64, on_remove: impl FnOnce() + Send + 'static) {
        self.delayed
            .lock()
            .entry(device)
            .or_default()
            .push((token, Box::new(on_remove)));
    }

    /// Drains every delayed removal queued for `device`: runs each
    /// `on_remove` callback, then erases the token from the forward/reverse
    /// maps. Called at points where holding the global lock across the
    /// callback is known to be safe (e.g. around a device-op-tracker poll).
    pub fn process_delayed_removes(&self, device: u64) {
        let pending = self.delayed.lock().remove(&device).unwrap_or_default();
        for (token, on_remove) in pending {
            on_remove();
            self.remove(token);
        }
    }

    /// Look up the native handle behind a token. Returns `None` for an
    /// unknown token; callers that know the kind must be live (anything
    /// other than `Fence`, per §4.1's "not fatal for fences" carve-out)
    /// should treat `None` as `FatalError::UnknownHandle` and abort.
    pub fn get(&self, token: u64) -> Option<u64> {
        self.forward.read().get(&token).map(|e| e.underlying)
    }

    pub fn get_or_abort(&self, token: u64, kind: HandleKind) -> u64 {
        self.get(token)
            .unwrap_or_else(|| dty::abort_with_reason!(FatalError::UnknownHandle(kind)))
    }

    pub fn get_dispatch(&self, token: u64) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.forward.read().get(&token).and_then(|e| e.dispatch.clone())
    }

    /// The reverse direction: given a native handle of a given kind,
    /// return its boxed token, if any.
    pub fn get_boxed_from_unboxed(&self, kind: HandleKind, underlying: u64) -> Option<u64> {
        self.reverse.read().get(&(kind, underlying)).copied()
    }

    pub fn contains(&self, token: u64) -> bool {
        self.forward.read().contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.forward.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_forward_and_reverse() {
        let mgr = BoxedHandleManager::new();
        let boxed: BoxedHandle = mgr.add(HandleKind::Buffer, 0xdead_beef);
        assert_eq!(mgr.get(boxed.raw()), Some(0xdead_beef));
        assert_eq!(
            mgr.get_boxed_from_unboxed(HandleKind::Buffer, 0xdead_beef),
            Some(boxed.raw())
        );
    }

    #[test]
    fn remove_clears_both_directions() {
        let mgr = BoxedHandleManager::new();
        let boxed: BoxedHandle = mgr.add(HandleKind::Image, 42);
        mgr.remove(boxed.raw());
        assert_eq!(mgr.get(boxed.raw()), None);
        assert_eq!(mgr.get_boxed_from_unboxed(HandleKind::Image, 42), None);
    }

    #[test]
    fn tokens_are_never_recycled() {
        let mgr = BoxedHandleManager::new();
        let a: BoxedHandle = mgr.add(HandleKind::Buffer, 1);
        mgr.remove(a.raw());
        let b: BoxedHandle = mgr.add(HandleKind::Buffer, 1);
        assert_ne!(a.raw(), b.raw());
    }

    #[test]
    fn fixed_token_biases_future_allocation() {
        let mgr = BoxedHandleManager::new();
        let restored: BoxedHandle = mgr.add_fixed(10_000, HandleKind::Buffer, 7);
        let fresh: BoxedHandle = mgr.add(HandleKind::Buffer, 8);
        assert!(fresh.raw() > restored.raw());
    }

    #[test]
    fn delayed_remove_keeps_token_live_until_processed() {
        let mgr = BoxedHandleManager::new();
        let boxed: BoxedHandle = mgr.add(HandleKind::Fence, 99);
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_cb = ran.clone();
        mgr.remove_delayed(boxed.raw(), 1, move || {
            ran_cb.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        assert_eq!(mgr.get(boxed.raw()), Some(99));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));

        mgr.process_delayed_removes(1);
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(mgr.get(boxed.raw()), None);
    }

    #[test]
    fn process_delayed_removes_only_drains_matching_device() {
        let mgr = BoxedHandleManager::new();
        let boxed: BoxedHandle = mgr.add(HandleKind::Fence, 5);
        mgr.remove_delayed(boxed.raw(), 1, || {});
        mgr.process_delayed_removes(2);
        assert_eq!(mgr.get(boxed.raw()), Some(5));
    }
}
