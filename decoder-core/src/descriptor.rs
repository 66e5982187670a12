//! Descriptor-set batched-update protocol (§4.7):
//! `queue_commit_descriptor_set_updates` and the shared
//! `update_descriptor_sets` path it funnels through.

use ash::vk;
use rustc_hash::FxHashMap;

use crate::registries::DescriptorWriteEntry;

/// One flattened write, already resolved to an underlying `dst_set`.
#[derive(Clone)]
pub struct ResolvedWrite {
    pub dst_set: vk::DescriptorSet,
    pub dst_binding: u32,
    pub dst_array_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    /// Tagged dependency payload recorded into the owning set's binding
    /// table after the native call succeeds (§4.7 shared
    /// `update_descriptor_sets` path).
    pub payload: DescriptorWriteEntry,
}

/// Input to `commit_descriptor_set_updates`: parallel arrays exactly as
/// the guest submits them (§4.7).
pub struct BatchedUpdateRequest<'a> {
    pub descriptor_pools: &'a [vk::DescriptorPool],
    pub set_layouts: &'a [vk::DescriptorSetLayout],
    pub set_pool_ids: &'a [u64],
    pub which_pool: &'a [u32],
    pub pending_alloc: &'a [bool],
    pub writes: &'a [ResolvedWriteTemplate],
}

/// A write as submitted by the guest, before `dst_set` has been resolved
/// from a pending-allocation slot to an underlying handle.
#[derive(Clone)]
pub struct ResolvedWriteTemplate {
    pub pool_id_index: usize,
    pub dst_binding: u32,
    pub dst_array_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub payload: DescriptorWriteEntry,
}

/// Resolves each pending-allocation slot to an underlying descriptor set,
/// allocating (or re-allocating) through the pool's cache the way §4.7
/// step 1 describes, and rewrites every write's `dst_set`.
pub fn resolve_pending_allocations(
    req: &BatchedUpdateRequest<'_>,
    allocate: impl Fn(vk::DescriptorPool, vk::DescriptorSetLayout) -> Result<vk::DescriptorSet, crate::error::DescriptorUpdateError>,
    cache: &mut FxHashMap<u64, vk::DescriptorSet>,
) -> Result<Vec<vk::DescriptorSet>, crate::error::DescriptorUpdateError> {
    let mut resolved = Vec::with_capacity(req.set_pool_ids.len());
    for (idx, &pool_id) in req.set_pool_ids.iter().enumerate() {
        let needs_alloc = req.pending_alloc.get(idx).copied().unwrap_or(false);
        let set = if needs_alloc || !cache.contains_key(&pool_id) {
            let pool_idx = req.which_pool[idx] as usize;
            let pool = *req
                .descriptor_pools
                .get(pool_idx)
                .ok_or(crate::error::DescriptorUpdateError::UnknownPool)?;
            let layout = req.set_layouts[idx];
            let set = allocate(pool, layout)?;
            cache.insert(pool_id, set);
            set
        } else {
            cache[&pool_id]
        };
        resolved.push(set);
    }
    Ok(resolved)
}

/// Rewrites each write's `dst_set` using the per-set resolution above,
/// implementing §4.7 step 2.
pub fn rewrite_dst_sets(
    req: &BatchedUpdateRequest<'_>,
    resolved_sets: &[vk::DescriptorSet],
) -> Vec<ResolvedWrite> {
    req.writes
        .iter()
        .map(|w| ResolvedWrite {
            dst_set: resolved_sets[w.pool_id_index],
            dst_binding: w.dst_binding,
            dst_array_element: w.dst_array_element,
            descriptor_type: w.descriptor_type,
            count: w.count,
            payload: w.payload.clone(),
        })
        .collect()
}

/// Records every resolved write into its owning set's binding table
/// (§4.7 shared path), applying the wrap-around rule so a write whose
/// element count overflows its binding continues at element zero of the
/// next binding.
pub fn record_writes(resolved: &[ResolvedWrite], registries: &mut crate::registries::Registries) {
    for write in resolved {
        let layout = match registries.descriptor_sets.get(write.dst_set.as_raw()) {
            Some(set) => set.layout,
            None => continue, // set destroyed concurrently with its own update; nothing to record into
        };
        let sizes: FxHashMap<u32, u32> = registries
            .descriptor_set_layouts
            .get(layout.as_raw())
            .map(|l| l.bindings.iter().map(|b| (b.binding, b.descriptor_count)).collect())
            .unwrap_or_default();
        let spans = wrap_binding_overflow(&sizes, write.dst_binding, write.dst_array_element, write.count.max(1));
        if let Some(set) = registries.descriptor_sets.get_mut(write.dst_set.as_raw()) {
            for (binding, element, _) in spans {
                set.apply_write(binding, element, write.payload.clone());
            }
        }
    }
}

/// A lazily-populated substitute-sampler cache (§4.7): when a combined-
/// image-sampler write needs opaque-alpha border-colour emulation, the
/// original sampler is replaced with an alternate one that has
/// `TRANSPARENT_BLACK` swapped for `OPAQUE_BLACK`, created once per
/// original sampler and reused afterwards.
#[derive(Default)]
pub struct EmulatedAlphaSamplerCache {
    cache: FxHashMap<vk::Sampler, vk::Sampler>,
}

impl EmulatedAlphaSamplerCache {
    pub fn get_or_create(
        &mut self,
        original: vk::Sampler,
        create: impl FnOnce() -> Result<vk::Sampler, crate::error::DescriptorUpdateError>,
    ) -> Result<vk::Sampler, crate::error::DescriptorUpdateError> {
        if let Some(&alt) = self.cache.get(&original) {
            return Ok(alt);
        }
        let alt = create()?;
        self.cache.insert(original, alt);
        Ok(alt)
    }
}

/// Applies the descriptor-write wrap-around rule: when `dst_array_element
/// + count` exceeds the number of elements declared for `dst_binding`,
/// the excess wraps to element zero of `dst_binding + 1` (§4.7 "wrap-
/// around rule").
pub fn wrap_binding_overflow(
    binding_sizes: &FxHashMap<u32, u32>,
    mut binding: u32,
    mut element: u32,
    mut remaining: u32,
) -> Vec<(u32, u32, u32)> {
    let mut spans = Vec::new();
    while remaining > 0 {
        let size = *binding_sizes.get(&binding).unwrap_or(&remaining);
        let available = size.saturating_sub(element).max(1);
        let span = remaining.min(available);
        spans.push((binding, element, span));
        remaining -= span;
        binding += 1;
        element = 0;
    }
    spans
}

/// Whether a combined-image-sampler write needs the emulated-alpha
/// sampler substitution (§4.7): both the view's image and the sampler
/// require opaque-alpha border-colour emulation.
pub fn needs_emulated_alpha_sampler(view_emulated_alpha: bool, sampler_emulated_alpha: bool) -> bool {
    view_emulated_alpha && sampler_emulated_alpha
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_wraps_into_next_binding() {
        let mut sizes = FxHashMap::default();
        sizes.insert(0, 4);
        sizes.insert(1, 4);
        let spans = wrap_binding_overflow(&sizes, 0, 2, 5);
        assert_eq!(spans, vec![(0, 2, 2), (1, 0, 3)]);
    }

    #[test]
    fn no_overflow_is_single_span() {
        let mut sizes = FxHashMap::default();
        sizes.insert(0, 8);
        let spans = wrap_binding_overflow(&sizes, 0, 0, 3);
        assert_eq!(spans, vec![(0, 0, 3)]);
    }

    #[test]
    fn emulated_alpha_requires_both_sides() {
        assert!(needs_emulated_alpha_sampler(true, true));
        assert!(!needs_emulated_alpha_sampler(true, false));
    }
}
