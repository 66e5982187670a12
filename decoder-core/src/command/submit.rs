use ash::vk;
use dty::{DriverError, HandleKind};
use rustc_hash::FxHashMap;

use crate::descriptor::{
    rewrite_dst_sets, resolve_pending_allocations, BatchedUpdateRequest, ResolvedWrite,
};
use crate::device_op_tracker::DeviceOpBuilder;
use crate::error::DescriptorUpdateError;
use crate::global::VkDecoderGlobalState;

/// `vkQueueSubmit`, boxed (§4.8): builds a fence via `DeviceOpBuilder`,
/// submits under the queue's per-queue lock — held across the native call
/// itself, not just the registry bookkeeping either side of it, so
/// same-queue native submits are totally ordered (§5, invariant 6) — and
/// records the resulting waitable as `latest_use` on every referenced
/// semaphore/fence.
pub fn queue_submit(
    state: &VkDecoderGlobalState,
    boxed_device: u64,
    boxed_queue: u64,
    command_buffers: &[vk::CommandBuffer],
    guest_fence: Option<vk::Fence>,
) -> Result<(), DriverError> {
    let device_underlying = state.boxed.get_or_abort(boxed_device, HandleKind::Device);
    let queue_underlying = state.boxed.get_or_abort(boxed_queue, HandleKind::Queue);

    let dispatch = state
        .boxed
        .get_dispatch(boxed_device)
        .expect("device dispatch missing for a live boxed device");
    let shared = dispatch
        .downcast::<dhal::vulkan::DeviceShared>()
        .expect("device dispatch entry was not a DeviceShared");

    let op_tracker = state
        .with_registries(|regs| regs.devices.get(device_underlying).map(|d| d.op_tracker.clone()))
        .expect("queue_submit on a device with no tracked DeviceRecord");

    let submit_lock = state
        .with_registries(|regs| regs.queues.get(queue_underlying).map(|q| q.submit_lock.clone()))
        .expect("queue_submit on a queue with no tracked QueueRecord");

    let mut builder = DeviceOpBuilder::new(&op_tracker);
    let fence = guest_fence.unwrap_or_else(|| builder.create_fence_for_op(&shared.raw));

    let submit_info = vk::SubmitInfo::default().command_buffers(command_buffers);
    let queue = vk::Queue::from_raw(queue_underlying);

    let submit_result = {
        let _queue_guard = submit_lock.lock();
        profiling::scope!("vkQueueSubmit");
        unsafe { shared.raw.queue_submit(queue, &[submit_info], fence) }
    };

    // The builder must be consumed exactly once regardless of outcome, or
    // its Drop impl aborts (§4.3 "Failure semantics").
    let waitable = builder.on_queue_submitted_with_fence(shared.raw.clone(), fence);

    submit_result.map_err(DriverError::from)?;

    state.with_registries(|regs| {
        if let Some(queue_record) = regs.queues.get(queue_underlying) {
            let seq = queue_record
                .sequence
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            queue_record.ordering.host_sync(false, seq + 1, state.config.host_sync_deadline);
        }
    });

    drop(waitable);
    Ok(())
}

/// `vkWaitForFences` participating in the per-fence condition-variable
/// protocol: blocks until the submitting thread has marked the fence
/// `Waitable`, transitions to `Waiting`, then calls the native wait
/// (§4.8).
pub fn wait_for_fence(
    state: &VkDecoderGlobalState,
    boxed_device: u64,
    boxed_fence: u64,
    timeout_ns: u64,
) -> Result<bool, DriverError> {
    let underlying = match state.boxed.get(boxed_fence) {
        Some(u) => u,
        None => return Ok(true), // never submitted: succeeds immediately, §8 boundary behaviour
    };

    let dispatch = state
        .boxed
        .get_dispatch(boxed_device)
        .expect("device dispatch missing for a live boxed device");
    let shared = dispatch
        .downcast::<dhal::vulkan::DeviceShared>()
        .expect("device dispatch entry was not a DeviceShared");

    let record = state.with_registries(|regs| regs.fences.get(underlying).map(|f| f.record.clone()));
    if let Some(record) = record {
        // A fence that was created but never handed to a submission stays
        // NotWaitable forever; blocking on it would deadlock the caller,
        // so the boundary behaviour is to succeed immediately instead
        // (§8 "wait_for_fence on a fence never submitted").
        if !record.try_begin_wait() {
            return Ok(true);
        }
    }

    dhal::vulkan::wait_for_fence(&shared.raw, vk::Fence::from_raw(underlying), timeout_ns)
}

/// `queue_commit_descriptor_set_updates` (§4.7): resolves pending
/// allocations, rewrites every write's `dst_set`, calls the shared
/// `vkUpdateDescriptorSets` path once, and records each write into its
/// owning set's binding table so a later snapshot save can observe
/// dependency staleness (invariant 7).
///
/// `native_writes` is the guest-marshalled `VkWriteDescriptorSet` array in
/// the same order as `req.writes` — building the actual `pImageInfo`/
/// `pBufferInfo` payloads is the on-wire decoder's job (§1 "out of
/// scope"); this dispatcher only patches `dst_set` before the native call.
pub fn queue_commit_descriptor_set_updates(
    state: &VkDecoderGlobalState,
    boxed_device: u64,
    req: &BatchedUpdateRequest<'_>,
    native_writes: &[vk::WriteDescriptorSet],
) -> Result<Vec<ResolvedWrite>, DescriptorUpdateError> {
    let _device_underlying = state.boxed.get_or_abort(boxed_device, HandleKind::Device);
    let dispatch = state
        .boxed
        .get_dispatch(boxed_device)
        .expect("device dispatch missing for a live boxed device");
    let shared = dispatch
        .downcast::<dhal::vulkan::DeviceShared>()
        .expect("device dispatch entry was not a DeviceShared");

    let mut pool_cache: FxHashMap<u64, vk::DescriptorSet> = FxHashMap::default();
    let shared_for_alloc = shared.clone();
    let resolved_sets = resolve_pending_allocations(
        req,
        move |pool, layout| {
            let layouts = [layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(&layouts);
            let sets = unsafe { shared_for_alloc.raw.allocate_descriptor_sets(&alloc_info) }
                .map_err(DriverError::from)?;
            Ok(sets[0])
        },
        &mut pool_cache,
    )?;

    let resolved = rewrite_dst_sets(req, &resolved_sets);

    debug_assert_eq!(native_writes.len(), resolved.len());
    let mut patched: Vec<vk::WriteDescriptorSet> = native_writes.to_vec();
    for (native, resolved_write) in patched.iter_mut().zip(resolved.iter()) {
        native.dst_set = resolved_write.dst_set;
    }

    {
        profiling::scope!("vkUpdateDescriptorSets");
        unsafe { shared.raw.update_descriptor_sets(&patched, &[]) };
    }

    state.with_registries(|regs| crate::descriptor::record_writes(&resolved, regs));

    Ok(resolved)
}
