use std::sync::atomic::{AtomicU64, Ordering};

/// Tag distinguishing the kind of object a [`BoxedHandle`] stands in for.
///
/// Dispatchable kinds (`Instance`, `PhysicalDevice`, `Device`, `Queue`,
/// `CommandBuffer`) additionally own a dispatch-table pointer in the boxed
/// entry; non-dispatchable kinds own only the underlying value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandleKind {
    Instance,
    PhysicalDevice,
    Device,
    Queue,
    CommandBuffer,
    CommandPool,
    Buffer,
    Image,
    ImageView,
    Sampler,
    Memory,
    Semaphore,
    Fence,
    DescriptorSetLayout,
    DescriptorPool,
    DescriptorSet,
    RenderPass,
    Framebuffer,
    ShaderModule,
    PipelineCache,
    Pipeline,
    PipelineLayout,
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A stable 64-bit guest-visible token standing in for a native handle.
///
/// Tokens are never recycled: once issued, a value is never reused for a
/// different live object, even after the object it named is destroyed and
/// a new object happens to receive the same underlying native handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoxedHandle<T = ()> {
    token: u64,
    kind: HandleKind,
    _marker: std::marker::PhantomData<T>,
}

impl<T> BoxedHandle<T> {
    /// Mint a fresh token. Used by the boxed-handle manager on object
    /// creation; never call this outside that module.
    pub fn fresh(kind: HandleKind) -> Self {
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        Self {
            token,
            kind,
            _marker: std::marker::PhantomData,
        }
    }

    /// Reconstruct a token captured by a previous snapshot save, biasing
    /// the allocator so future `fresh()` calls never collide with it.
    pub fn from_saved(token: u64, kind: HandleKind) -> Self {
        let mut cur = NEXT_TOKEN.load(Ordering::Relaxed);
        while token >= cur {
            match NEXT_TOKEN.compare_exchange_weak(
                cur,
                token + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        Self {
            token,
            kind,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn raw(self) -> u64 {
        self.token
    }

    pub fn kind(self) -> HandleKind {
        self.kind
    }
}
