//! Fakes for the collaborator traits (§6), shared by the integration
//! test binary. Kept in the library target the way `wgpu-test` keeps its
//! shared harness separate from the `tests/` test binaries themselves.

use std::sync::Mutex;

use ash::vk;
use dcore::device_op_tracker::{DeviceOpTracker, DeviceOpWaitable};
use dcore::external::{
    AddressSpaceDevice, ColorBufferAllocationInfo, ColorBufferManager, ExternalObjectManager,
    MetricsLogger, ProcessCleanupRegistry, VulkanBlobInfo,
};
use dcore::memory::CacheMode;
use dty::ExternalHandleTypes;

#[derive(Default)]
pub struct FakeColorBuffers;

impl ColorBufferManager for FakeColorBuffers {
    fn get_allocation_info(&self, _id: u32) -> Option<ColorBufferAllocationInfo> {
        None
    }
    fn get_external_memory_handle(&self, _id: u32) -> Option<i32> {
        None
    }
    fn get_image(&self, _id: u32) -> Option<vk::Image> {
        None
    }
    fn invalidate(&self, _id: u32) {}
    fn flush(&self, _id: u32) {}
    fn set_current_layout(&self, _id: u32, _layout: vk::ImageLayout) {}
    fn set_latest_use(&self, _id: u32, _waitable: DeviceOpWaitable, _tracker: &DeviceOpTracker) {}
    fn sync_image_to_colorbuffer(&self, _id: u32, _image: vk::Image, _layout: vk::ImageLayout) {}
}

#[derive(Default)]
pub struct FakeExternalObjects {
    pub registered: Mutex<Vec<(u64, i32, ExternalHandleTypes)>>,
}

impl ExternalObjectManager for FakeExternalObjects {
    fn add_blob_descriptor_info(
        &self,
        blob_id: u64,
        handle: i32,
        handle_type: ExternalHandleTypes,
        _cache_mode: CacheMode,
        _vulkan_info: Option<VulkanBlobInfo>,
    ) {
        self.registered.lock().unwrap().push((blob_id, handle, handle_type));
    }

    fn remove_blob_descriptor_info(&self, blob_id: u64) -> Option<(i32, ExternalHandleTypes)> {
        let mut registered = self.registered.lock().unwrap();
        let idx = registered.iter().position(|(id, _, _)| *id == blob_id)?;
        let (_, handle, ty) = registered.remove(idx);
        Some((handle, ty))
    }

    fn add_sync_descriptor_info(&self, sync_id: u64, handle: i32, handle_type: ExternalHandleTypes) {
        self.registered.lock().unwrap().push((sync_id, handle, handle_type));
    }

    fn add_mapping(&self, _blob_id: u64, _ptr: *mut u8, _cache_mode: CacheMode) {}
}

#[derive(Default)]
pub struct FakeAddressSpaceDevice;

impl AddressSpaceDevice for FakeAddressSpaceDevice {
    fn map_user_backed_ram(&self, _gpa: u64, _hva: *mut u8, _size: u64) {}
    fn unmap_user_backed_ram(&self, _gpa: u64, _size: u64) {}
    fn register_deallocation_callback(&self, _key: u64, _gpa: u64, _cb: Box<dyn FnOnce() + Send>) {}
}

#[derive(Default)]
pub struct FakeProcessCleanupRegistry;

impl ProcessCleanupRegistry for FakeProcessCleanupRegistry {
    fn register(&self, _process_id: u64, _cb: Box<dyn FnOnce() + Send>) {}
    fn unregister(&self, _process_id: u64) {}
}

#[derive(Default)]
pub struct FakeMetricsLogger {
    pub oom_events: Mutex<Vec<(u32, Option<u64>)>>,
}

impl MetricsLogger for FakeMetricsLogger {
    fn report_out_of_memory(&self, op_code: u32, allocation_size: Option<u64>) {
        self.oom_events.lock().unwrap().push((op_code, allocation_size));
    }
}
