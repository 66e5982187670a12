//! Top-level facade (§2, §6): the process-wide singleton every dispatcher
//! is a method on. Named `VkDecoderGlobalState` after the system this
//! spec distills (gfxstream's own global-state singleton), kept as the
//! literal name dispatchers are written against.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;

use crate::boxed::BoxedHandleManager;
use crate::config::DecoderConfig;
use crate::external::{AddressSpaceDevice, ColorBufferManager, ExternalObjectManager, MetricsLogger, ProcessCleanupRegistry};
use crate::registries::Registries;

/// The collaborators the core treats as external (§6). A production
/// embedding wires in the compositor, the guest-memory subsystem, and
/// the address-space device; `tests` wires in fakes.
pub struct Collaborators {
    pub colorbuffers: Arc<dyn ColorBufferManager>,
    pub external_objects: Arc<dyn ExternalObjectManager>,
    pub address_space: Arc<dyn AddressSpaceDevice>,
    pub process_cleanup: Arc<dyn ProcessCleanupRegistry>,
    pub metrics: Arc<dyn MetricsLogger>,
}

/// Every dispatcher is effectively a method on this struct: the boxed-
/// handle manager, the registries (behind the single global recursive
/// mutex §5 names), the config, and the collaborator handles.
///
/// `registries` is wrapped in a `parking_lot::ReentrantMutex<RefCell<_>>`
/// rather than a plain `Mutex` because dispatchers recursively re-enter
/// the lock (e.g. destroy-image calling destroy-image-view calling
/// destroy-sampler), matching §5's "single global recursive mutex".
pub struct VkDecoderGlobalState {
    pub boxed: BoxedHandleManager,
    registries: ReentrantMutex<RefCell<Registries>>,
    pub config: DecoderConfig,
    pub collaborators: Collaborators,
}

impl VkDecoderGlobalState {
    pub fn new(config: DecoderConfig, collaborators: Collaborators) -> Self {
        Self {
            boxed: BoxedHandleManager::new(),
            registries: ReentrantMutex::new(RefCell::new(Registries::default())),
            config,
            collaborators,
        }
    }

    /// Runs `f` with exclusive (but re-entrant) access to every registry.
    /// Dispatchers use this instead of holding a guard across a native
    /// driver call whenever the call is long-running (§5: "drop [the
    /// lock] around long native calls where possible").
    pub fn with_registries<R>(&self, f: impl FnOnce(&mut Registries) -> R) -> R {
        let guard = self.registries.lock();
        let mut regs = guard.borrow_mut();
        f(&mut regs)
    }
}

static SINGLETON: OnceCell<Arc<VkDecoderGlobalState>> = OnceCell::new();

/// Process-wide accessor (§6 "Process-wide state"). Prefer constructing
/// a `VkDecoderGlobalState` directly and threading it explicitly; this
/// exists only as the outer-boundary convenience the spec calls for.
pub fn global(config: DecoderConfig, collaborators: Collaborators) -> Arc<VkDecoderGlobalState> {
    SINGLETON
        .get_or_init(|| Arc::new(VkDecoderGlobalState::new(config, collaborators)))
        .clone()
}

pub fn try_global() -> Option<Arc<VkDecoderGlobalState>> {
    SINGLETON.get().cloned()
}
