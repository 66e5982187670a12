pub mod conv;

use std::{ffi::CStr, sync::Arc};

use ash::vk;
use dty::DriverError;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

pub use conv::map_memory_property_flags;

/// A loaded extension function pointer, or a marker that the functionality
/// was promoted to core and is called through the base `ash::Device`/
/// `ash::Instance` instead. Identical in spirit to
/// `wgpu_hal::vulkan::ExtensionFn`.
#[derive(Debug)]
pub enum ExtensionFn<T> {
    Extension(T),
    Promoted,
}

/// State shared by every boxed handle that traces back to one
/// `VkInstance`: the raw `ash::Instance`, the loader entry point it came
/// from, and whichever instance-level extension functions were loaded.
#[derive(Debug)]
pub struct InstanceShared {
    pub raw: ash::Instance,
    pub entry: ash::Entry,
    pub extensions: Vec<&'static CStr>,
    pub instance_api_version: u32,
    pub get_physical_device_properties2:
        Option<ash::khr::get_physical_device_properties2::Instance>,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub shared: Arc<InstanceShared>,
}

/// Extension function tables loaded per-device. Only the families this
/// decoder actually calls into are kept; anything promoted to Vulkan 1.2
/// core is looked up through `ash::Device` directly and recorded here only
/// as `Promoted` so call sites stay uniform.
#[derive(Debug)]
pub struct DeviceExtensionFunctions {
    pub timeline_semaphore: Option<ExtensionFn<ash::khr::timeline_semaphore::Device>>,
    pub external_memory_fd: Option<ash::khr::external_memory_fd::Device>,
    pub external_fence_fd: Option<ash::khr::external_fence_fd::Device>,
    pub external_semaphore_fd: Option<ash::khr::external_semaphore_fd::Device>,
}

/// State shared by every boxed handle that traces back to one `VkDevice`:
/// the raw `ash::Device`, the physical device and instance it was created
/// from, its extension function tables, and the render-pass/framebuffer
/// style caches the spec's dispatchers consult before calling the driver.
///
/// Mirrors `wgpu_hal::vulkan::DeviceShared`.
#[derive(Debug)]
pub struct DeviceShared {
    pub raw: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: Arc<InstanceShared>,
    pub queues: FxHashMap<u32, Vec<vk::Queue>>,
    pub extension_fns: DeviceExtensionFunctions,
    pub vendor_id: u32,
    pub timestamp_period: f32,
    /// Caches keyed by a structural hash of the create-info, the way
    /// `wgpu_hal::vulkan::DeviceShared::render_passes`/`framebuffers` avoid
    /// re-creating equivalent objects on every call.
    pub render_passes: Mutex<FxHashMap<u64, vk::RenderPass>>,
    pub framebuffers: Mutex<FxHashMap<u64, vk::Framebuffer>>,
}

impl DeviceShared {
    /// Returns any queue of the given family, used by dispatchers that
    /// need a throwaway queue for single-shot transfer work (snapshot
    /// image/buffer content restore).
    pub fn any_queue(&self, family_index: u32) -> Option<vk::Queue> {
        self.queues.get(&family_index).and_then(|qs| qs.first()).copied()
    }
}

/// Owns a device's raw handle plus the allocators layered on top of it.
/// The boxed-handle manager's `Device` record (decoder-core) holds one of
/// these; this struct itself knows nothing about boxing.
pub struct Device {
    pub shared: Arc<DeviceShared>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("shared", &self.shared).finish()
    }
}

/// `vkWaitForFences`/`vkGetFenceStatus`/`vkResetFences` wrapped with the
/// `DriverError` conversion every dispatcher uses; kept thin because the
/// actual fence *state machine* (not-waitable/waitable/waiting) lives in
/// `decoder-core`, not here — this crate only talks to the driver.
pub fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<bool, DriverError> {
    match unsafe { device.wait_for_fences(&[fence], true, timeout_ns) } {
        Ok(()) => Ok(true),
        Err(vk::Result::TIMEOUT) => Ok(false),
        Err(other) => Err(other.into()),
    }
}

pub fn get_fence_status(device: &ash::Device, fence: vk::Fence) -> Result<bool, DriverError> {
    unsafe { device.get_fence_status(fence) }.or_else(|e| match e {
        vk::Result::NOT_READY => Ok(false),
        other => Err(other.into()),
    })
}

/// Exports a `VkDeviceMemory` allocation as a POSIX file descriptor via
/// `VK_KHR_external_memory_fd`, the Linux half of §4.6's "external-
/// resource bridge" (the Windows `HANDLE` family is a separate extension
/// this decoder does not target).
pub fn export_memory_fd(
    extension_fns: &DeviceExtensionFunctions,
    memory: vk::DeviceMemory,
) -> Result<i32, DriverError> {
    let ext = extension_fns
        .external_memory_fd
        .as_ref()
        .ok_or(DriverError::ExtensionNotPresent)?;
    let info = vk::MemoryGetFdInfoKHR::default()
        .memory(memory)
        .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);
    unsafe { ext.get_memory_fd(&info) }.map_err(DriverError::from)
}

/// Exports a binary `VkSemaphore`'s current payload as a POSIX fd via
/// `VK_KHR_external_semaphore_fd` (§4.6, §6 "external-resource bridge").
pub fn export_semaphore_fd(
    extension_fns: &DeviceExtensionFunctions,
    semaphore: vk::Semaphore,
) -> Result<i32, DriverError> {
    let ext = extension_fns
        .external_semaphore_fd
        .as_ref()
        .ok_or(DriverError::ExtensionNotPresent)?;
    let info = vk::SemaphoreGetFdInfoKHR::default()
        .semaphore(semaphore)
        .handle_type(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD);
    unsafe { ext.get_semaphore_fd(&info) }.map_err(DriverError::from)
}

/// Imports a POSIX fd payload into an already-created `VkSemaphore` via
/// `VK_KHR_external_semaphore_fd`; ownership of `fd` transfers to the
/// driver on success, matching `vkImportSemaphoreFdKHR`'s contract.
pub fn import_semaphore_fd(
    extension_fns: &DeviceExtensionFunctions,
    semaphore: vk::Semaphore,
    fd: std::os::fd::RawFd,
) -> Result<(), DriverError> {
    let ext = extension_fns
        .external_semaphore_fd
        .as_ref()
        .ok_or(DriverError::ExtensionNotPresent)?;
    let info = vk::ImportSemaphoreFdInfoKHR::default()
        .semaphore(semaphore)
        .handle_type(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD)
        .fd(fd);
    unsafe { ext.import_semaphore_fd(&info) }.map_err(DriverError::from)
}

/// Exports a `VkFence`'s current payload as a POSIX fd via
/// `VK_KHR_external_fence_fd` (§4.6, §6).
pub fn export_fence_fd(
    extension_fns: &DeviceExtensionFunctions,
    fence: vk::Fence,
) -> Result<i32, DriverError> {
    let ext = extension_fns
        .external_fence_fd
        .as_ref()
        .ok_or(DriverError::ExtensionNotPresent)?;
    let info = vk::FenceGetFdInfoKHR::default()
        .fence(fence)
        .handle_type(vk::ExternalFenceHandleTypeFlags::OPAQUE_FD);
    unsafe { ext.get_fence_fd(&info) }.map_err(DriverError::from)
}

/// Imports a POSIX fd payload into an already-created `VkFence` via
/// `VK_KHR_external_fence_fd`.
pub fn import_fence_fd(
    extension_fns: &DeviceExtensionFunctions,
    fence: vk::Fence,
    fd: std::os::fd::RawFd,
) -> Result<(), DriverError> {
    let ext = extension_fns
        .external_fence_fd
        .as_ref()
        .ok_or(DriverError::ExtensionNotPresent)?;
    let info = vk::ImportFenceFdInfoKHR::default()
        .fence(fence)
        .handle_type(vk::ExternalFenceHandleTypeFlags::OPAQUE_FD)
        .fd(fd);
    unsafe { ext.import_fence_fd(&info) }.map_err(DriverError::from)
}
