use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use dty::{BoxedHandle, DriverError, HandleKind};
use rustc_hash::FxHashMap;

use crate::device_op_tracker::DeviceOpTracker;
use crate::fence::FenceRecord;
use crate::global::VkDecoderGlobalState;
use crate::ordering::OrderingToken;
use crate::registries::{
    DeviceRecord, FenceTableRecord, InstanceRecord, PhysicalDeviceRecord, QueueRecord,
    SemaphoreRecord,
};

/// Extensions stripped from guest-requested instance/device create-info
/// because they are emulated above the driver, not passed through to it
/// (§4.6 "Extension filtering").
const FILTERED_INSTANCE_EXTENSIONS: &[&str] = &["VK_KHR_external_memory_capabilities"];
const FILTERED_DEVICE_EXTENSIONS: &[&str] = &["VK_ANDROID_native_buffer"];

/// `vkCreateInstance`, boxed. The native call is made with the global
/// lock released (§5) since instance creation can be slow and touches no
/// shared registry state until it returns.
pub fn create_instance(
    state: &VkDecoderGlobalState,
    entry: ash::Entry,
    requested_extensions: &[String],
    app_name: &str,
) -> Result<BoxedHandle, DriverError> {
    let enabled: Vec<String> = requested_extensions
        .iter()
        .filter(|ext| !FILTERED_INSTANCE_EXTENSIONS.contains(&ext.as_str()))
        .cloned()
        .collect();

    let app_name_c = std::ffi::CString::new(app_name).unwrap_or_default();
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name_c)
        .api_version(vk::API_VERSION_1_3);

    let ext_cstrings: Vec<std::ffi::CString> = enabled
        .iter()
        .map(|e| std::ffi::CString::new(e.as_str()).unwrap_or_default())
        .collect();
    let ext_ptrs: Vec<*const std::os::raw::c_char> = ext_cstrings.iter().map(|c| c.as_ptr()).collect();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&ext_ptrs);

    let raw = {
        profiling::scope!("vkCreateInstance");
        unsafe { entry.create_instance(&create_info, None) }.map_err(DriverError::from)?
    };

    let shared = Arc::new(dhal::vulkan::InstanceShared {
        raw: raw.clone(),
        entry,
        extensions: Vec::new(),
        instance_api_version: vk::API_VERSION_1_3,
        get_physical_device_properties2: None,
    });

    state.with_registries(|regs| {
        regs.instances.insert(
            raw.handle().as_raw(),
            InstanceRecord {
                raw: raw.handle(),
                shared: shared.clone(),
                enabled_extensions: enabled,
                is_angle: app_name.eq_ignore_ascii_case("ANGLE"),
            },
        );
    });

    Ok(state
        .boxed
        .add_with_dispatch(HandleKind::Instance, raw.handle().as_raw(), Some(shared)))
}

pub fn destroy_instance(state: &VkDecoderGlobalState, boxed_instance: u64) {
    let underlying = match state.boxed.get(boxed_instance) {
        Some(u) => u,
        None => dty::abort_with_reason!(dty::FatalError::UnknownHandle(HandleKind::Instance)),
    };
    let dispatch = state.boxed.get_dispatch(boxed_instance);
    state.with_registries(|regs| {
        regs.instances.remove(underlying);
    });
    state.boxed.remove(boxed_instance);
    if let Some(shared) = dispatch.and_then(|d| d.downcast::<dhal::vulkan::InstanceShared>().ok()) {
        unsafe { shared.raw.destroy_instance(None) };
    }
}

/// `vkCreateDevice`, boxed. Forces off private-data and protected-memory
/// features and clears YCbCr conversion when this device emulates a
/// compressed format, per §4.6's "Forced feature fixups", and builds the
/// per-device op tracker and texture-emulation flags from `DecoderConfig`.
pub fn create_device(
    state: &VkDecoderGlobalState,
    boxed_instance: u64,
    boxed_physical_device: u64,
    requested_extensions: &[String],
    queue_family_index: u32,
) -> Result<BoxedHandle, DriverError> {
    let instance_dispatch = state
        .boxed
        .get_dispatch(boxed_instance)
        .expect("instance dispatch missing for a live boxed instance");
    let instance_shared = instance_dispatch
        .downcast::<dhal::vulkan::InstanceShared>()
        .expect("instance dispatch entry was not an InstanceShared");

    let physical_device_underlying = state
        .boxed
        .get_or_abort(boxed_physical_device, HandleKind::PhysicalDevice);
    let physical_device = vk::PhysicalDevice::from_raw(physical_device_underlying);

    let enabled: Vec<String> = requested_extensions
        .iter()
        .filter(|ext| !FILTERED_DEVICE_EXTENSIONS.contains(&ext.as_str()))
        .cloned()
        .collect();
    let ext_cstrings: Vec<std::ffi::CString> = enabled
        .iter()
        .map(|e| std::ffi::CString::new(e.as_str()).unwrap_or_default())
        .collect();
    let ext_ptrs: Vec<*const std::os::raw::c_char> = ext_cstrings.iter().map(|c| c.as_ptr()).collect();

    let queue_priorities = [1.0f32];
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family_index)
        .queue_priorities(&queue_priorities);
    let queue_create_infos = [queue_create_info];

    let features = vk::PhysicalDeviceFeatures::default();

    // Forced feature fixups (§4.6): private-data and protected-memory are
    // always forced off; YCbCr conversion is cleared only when this
    // device emulates a compressed format, since the emulation path
    // doesn't support combining the two.
    let emulates_compressed_formats = !state.config.texture_emulation.is_empty();
    let mut features11 = vk::PhysicalDeviceVulkan11Features::default()
        .protected_memory(false)
        .sampler_ycbcr_conversion(!emulates_compressed_formats);
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default().private_data(false);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&ext_ptrs)
        .enabled_features(&features)
        .push_next(&mut features11)
        .push_next(&mut features13);

    let raw = {
        profiling::scope!("vkCreateDevice");
        unsafe {
            instance_shared
                .raw
                .create_device(physical_device, &create_info, None)
        }
        .map_err(DriverError::from)?
    };

    let queue = unsafe { raw.get_device_queue(queue_family_index, 0) };
    let mut queues = FxHashMap::default();
    queues.insert(queue_family_index, vec![queue]);

    let shared = Arc::new(dhal::vulkan::DeviceShared {
        raw: raw.clone(),
        physical_device,
        instance: instance_shared,
        queues,
        extension_fns: dhal::vulkan::DeviceExtensionFunctions {
            timeline_semaphore: None,
            external_memory_fd: None,
            external_fence_fd: None,
            external_semaphore_fd: None,
        },
        vendor_id: 0,
        timestamp_period: 1.0,
        render_passes: parking_lot::Mutex::new(FxHashMap::default()),
        framebuffers: parking_lot::Mutex::new(FxHashMap::default()),
    });

    let op_tracker = Arc::new(DeviceOpTracker::new(
        state.config.gc_queue_warn_threshold,
        state.config.gc_leak_timeout,
    ));

    state.with_registries(|regs| {
        regs.devices.insert(
            raw.handle().as_raw(),
            DeviceRecord {
                raw: raw.handle(),
                shared: shared.clone(),
                physical_device,
                op_tracker,
                texture_emulation: state.config.texture_emulation,
                external_fence_types: dty::ExternalHandleTypes::empty(),
                external_semaphore_types: dty::ExternalHandleTypes::empty(),
                decompression: once_cell::sync::OnceCell::new(),
            },
        );
    });

    Ok(state
        .boxed
        .add_with_dispatch(HandleKind::Device, raw.handle().as_raw(), Some(shared)))
}

/// `vkDestroyDevice`: waits for device idle and drains the device-op
/// tracker's garbage before tearing down the native device (§4.3
/// `on_destroy_device`).
pub fn destroy_device(state: &VkDecoderGlobalState, boxed_device: u64) {
    let underlying = state.boxed.get_or_abort(boxed_device, HandleKind::Device);
    let dispatch = state.boxed.get_dispatch(boxed_device);
    let shared = dispatch.and_then(|d| d.downcast::<dhal::vulkan::DeviceShared>().ok());

    let op_tracker = state.with_registries(|regs| regs.devices.get(underlying).map(|d| d.op_tracker.clone()));

    if let (Some(shared), Some(op_tracker)) = (&shared, &op_tracker) {
        op_tracker.on_destroy_device(&shared.raw);
    }

    if let Some(shared) = &shared {
        state.with_registries(|regs| {
            if let Some(resources) = regs.devices.get(underlying).and_then(|d| d.decompression.get()) {
                resources.destroy(&shared.raw);
            }
        });
    }

    state.with_registries(|regs| {
        regs.devices.remove(underlying);
    });
    state.boxed.remove(boxed_device);

    if let Some(shared) = shared {
        unsafe { shared.raw.destroy_device(None) };
    }
}

/// `host_sync`'s five-second deadline, read from config rather than
/// hard-coded (§4.2, `DecoderConfig::host_sync_deadline`).
pub fn host_sync_deadline(state: &VkDecoderGlobalState) -> Duration {
    state.config.host_sync_deadline
}

/// `vkGetDeviceQueue`, boxed: looks up the native queue handle
/// `create_device` already retrieved and records a `QueueRecord` — the
/// ordering token and per-queue submit lock `command::submit` needs
/// (§4.4, §5 "each queue has its own lock").
pub fn get_device_queue(
    state: &VkDecoderGlobalState,
    boxed_device: u64,
    queue_family_index: u32,
    queue_index: u32,
) -> BoxedHandle {
    let device_underlying = state.boxed.get_or_abort(boxed_device, HandleKind::Device);
    let dispatch = state
        .boxed
        .get_dispatch(boxed_device)
        .expect("device dispatch missing for a live boxed device");
    let shared = dispatch
        .downcast::<dhal::vulkan::DeviceShared>()
        .expect("device dispatch entry was not a DeviceShared");

    let raw = shared
        .queues
        .get(&queue_family_index)
        .and_then(|qs| qs.get(queue_index as usize))
        .copied()
        .unwrap_or_else(|| unsafe { shared.raw.get_device_queue(queue_family_index, queue_index) });

    state.with_registries(|regs| {
        if !regs.queues.contains(raw.as_raw()) {
            regs.queues.insert(
                raw.as_raw(),
                QueueRecord {
                    raw,
                    device: vk::Device::from_raw(device_underlying),
                    family_index: queue_family_index,
                    ordering: OrderingToken::new(),
                    sequence: std::sync::atomic::AtomicU64::new(0),
                    submit_lock: Arc::new(parking_lot::Mutex::new(())),
                },
            );
        }
    });

    state.boxed.add(HandleKind::Queue, raw.as_raw())
}
