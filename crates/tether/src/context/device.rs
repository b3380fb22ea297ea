use std::{ffi::CString, ptr::NonNull, sync::Arc};

use ash::vk::{self, Handle as _};

use crate::{
    allocator::{AllocatorProxy, HostAllocator},
    error::{ArgumentError, CallFailed, DeviceError, MemoryError, VkResultExt},
    handle::{AsRawObject, Handle, ObjectKind, Teardown},
    memory::{DeviceMemoryOps, MappedMemory},
};

///Thin device abstraction that owns the [AllocatorProxy] all of the device's objects are created with,
/// and takes care of device destruction once its dropped.
///
/// # Safety and self creation
/// The device is usually created through [Device::new_from_info]. When wrapping an existing device via [Device::from_raw]
/// you'll have to make sure that the proxy is the one the device was created with.
pub struct Device {
    ///The raw ash device
    pub inner: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    ///See [limits](https://registry.khronos.org/vulkan/specs/1.3-extensions/man/html/VkPhysicalDeviceLimits.html).
    pub non_coherent_atom_size: vk::DeviceSize,
    ///Host allocation callbacks used for every object created from this device.
    pub allocator_proxy: Arc<AllocatorProxy>,
    debug_utils: Option<ash::ext::debug_utils::Device>,
}

impl Device {
    ///Creates the device for `physical_device` from `device_create_info`. If `host_allocator` is set, the driver uses
    /// it for all host memory of the device.
    ///
    /// # Safety
    /// Extensions and queues requested in `device_create_info` must be supported by `physical_device`.
    pub unsafe fn new_from_info(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device_create_info: &vk::DeviceCreateInfo<'_>,
        host_allocator: Option<Arc<dyn HostAllocator>>,
    ) -> Result<Self, DeviceError> {
        let allocator_proxy = Arc::new(AllocatorProxy::new(host_allocator));
        let device = unsafe {
            instance.create_device(
                physical_device,
                device_create_info,
                allocator_proxy.callback_block()?,
            )
        }
        .during("vkCreateDevice")?;

        #[cfg(feature = "logging")]
        log::debug!(
            "Created device {:?} (custom host allocator: {})",
            device.handle(),
            allocator_proxy.has_allocator()
        );

        Ok(unsafe { Self::from_raw(instance, device, physical_device, allocator_proxy) })
    }

    ///Wraps an already created device.
    ///
    /// # Safety
    /// `inner` must be created from `physical_device` with the callbacks of `allocator_proxy`. The device is destroyed
    /// when `self` is dropped.
    pub unsafe fn from_raw(
        instance: &ash::Instance,
        inner: ash::Device,
        physical_device: vk::PhysicalDevice,
        allocator_proxy: Arc<AllocatorProxy>,
    ) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        Device {
            inner,
            physical_device,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size,
            allocator_proxy,
            debug_utils: None,
        }
    }

    ///Loads `VK_EXT_debug_utils` for object naming. The extension must be enabled on `instance`.
    pub fn with_debug_utils(mut self, instance: &ash::Instance) -> Self {
        self.debug_utils = Some(ash::ext::debug_utils::Device::new(instance, &self.inner));
        self
    }

    ///Wraps `raw` into a handle that is destroyed through this device.
    ///
    /// # Safety
    /// `raw` must be a live object of `kind` created from this device, and must not be destroyed by anything else.
    pub unsafe fn wrap_owned(self: &Arc<Self>, kind: ObjectKind, raw: u64) -> Handle {
        unsafe { Handle::owned(self.clone(), kind, raw) }
    }

    ///Wraps `raw` into a handle that is never destroyed by us. Use this for objects that are owned by other objects,
    /// for instance swapchain images.
    pub fn wrap_external(&self, kind: ObjectKind, raw: u64) -> Handle {
        Handle::external(kind, raw)
    }

    ///Allocates `size` bytes of device memory from `memory_type_index`. The memory is freed when the handle is closed.
    pub fn allocate_memory(
        self: &Arc<Self>,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> Result<Handle, DeviceError> {
        if size == 0 {
            return Err(ArgumentError::invalid("size", "can't allocate zero bytes").into());
        }

        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        let callbacks = self.allocator_proxy.callback_block()?;
        let memory =
            unsafe { self.inner.allocate_memory(&info, callbacks) }.during("vkAllocateMemory")?;

        #[cfg(feature = "logging")]
        log::trace!(
            "Allocated {} bytes of device memory {:?} from type {}",
            size,
            memory,
            memory_type_index
        );

        Ok(unsafe { self.wrap_owned(ObjectKind::DeviceMemory, memory.as_raw()) })
    }

    ///Maps `size` bytes of `memory` starting at `offset`. Flushes of the returned view go directly to this device.
    ///
    /// The memory is borrowed exclusively while the view is alive, so it can neither be closed nor mapped again.
    ///
    /// ```compile_fail
    /// # use tether::{context::Device, handle::Handle};
    /// fn map_twice(device: &Device, memory: &mut Handle) {
    ///     let first = device.map_memory(memory, 0, 64).unwrap();
    ///     let second = device.map_memory(memory, 0, 64).unwrap();
    ///     drop((first, second));
    /// }
    /// ```
    pub fn map_memory<'a>(
        &'a self,
        memory: &'a mut Handle,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<MappedMemory<'a>, MemoryError> {
        if memory.kind() != ObjectKind::DeviceMemory {
            return Err(ArgumentError::invalid(
                "memory",
                format!("expected device memory, got {:?}", memory.kind()),
            )
            .into());
        }
        memory.check_not_closed()?;
        if size == 0 || size == vk::WHOLE_SIZE {
            return Err(
                ArgumentError::invalid("size", "mapped size must be explicit and non-zero").into(),
            );
        }

        let raw_memory: vk::DeviceMemory = memory.typed();
        let ptr = unsafe {
            self.inner
                .map_memory(raw_memory, offset, size, vk::MemoryMapFlags::empty())
        }
        .during("vkMapMemory")?;
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(MemoryError::NotMappable)?;

        //Safety: the driver mapped exactly `size` bytes at `offset`.
        Ok(unsafe { MappedMemory::from_device(self, raw_memory, offset, ptr, size as usize) })
    }

    ///Names `object` for debuggers and validation messages.
    pub fn set_object_name(
        &self,
        object: &impl AsRawObject,
        name: &str,
    ) -> Result<(), DeviceError> {
        let debug_utils = self
            .debug_utils
            .as_ref()
            .ok_or(DeviceError::DebugUtilsUnavailable)?;
        let name = CString::new(name)
            .map_err(|_| ArgumentError::invalid("name", "contains a nul byte"))?;

        let mut info = vk::DebugUtilsObjectNameInfoEXT::default().object_name(&name);
        info.object_type = object.object_kind().object_type();
        info.object_handle = object.as_raw();

        unsafe { debug_utils.set_debug_utils_object_name(&info) }
            .during("vkSetDebugUtilsObjectNameEXT")?;
        Ok(())
    }
}

impl Teardown for Device {
    unsafe fn teardown(&self, kind: ObjectKind, raw: u64) -> Result<(), DeviceError> {
        let callbacks = self.allocator_proxy.callback_block()?;
        let device = &self.inner;

        unsafe {
            match kind {
                ObjectKind::Buffer => device.destroy_buffer(vk::Buffer::from_raw(raw), callbacks),
                ObjectKind::BufferView => {
                    device.destroy_buffer_view(vk::BufferView::from_raw(raw), callbacks)
                }
                ObjectKind::Image => device.destroy_image(vk::Image::from_raw(raw), callbacks),
                ObjectKind::ImageView => {
                    device.destroy_image_view(vk::ImageView::from_raw(raw), callbacks)
                }
                ObjectKind::DeviceMemory => {
                    device.free_memory(vk::DeviceMemory::from_raw(raw), callbacks)
                }
                ObjectKind::Sampler => {
                    device.destroy_sampler(vk::Sampler::from_raw(raw), callbacks)
                }
                ObjectKind::Semaphore => {
                    device.destroy_semaphore(vk::Semaphore::from_raw(raw), callbacks)
                }
                ObjectKind::Fence => device.destroy_fence(vk::Fence::from_raw(raw), callbacks),
                ObjectKind::Event => device.destroy_event(vk::Event::from_raw(raw), callbacks),
                ObjectKind::QueryPool => {
                    device.destroy_query_pool(vk::QueryPool::from_raw(raw), callbacks)
                }
                ObjectKind::ShaderModule => {
                    device.destroy_shader_module(vk::ShaderModule::from_raw(raw), callbacks)
                }
                ObjectKind::PipelineLayout => {
                    device.destroy_pipeline_layout(vk::PipelineLayout::from_raw(raw), callbacks)
                }
                ObjectKind::Pipeline => {
                    device.destroy_pipeline(vk::Pipeline::from_raw(raw), callbacks)
                }
                ObjectKind::DescriptorSetLayout => device.destroy_descriptor_set_layout(
                    vk::DescriptorSetLayout::from_raw(raw),
                    callbacks,
                ),
                ObjectKind::DescriptorPool => {
                    device.destroy_descriptor_pool(vk::DescriptorPool::from_raw(raw), callbacks)
                }
                ObjectKind::CommandPool => {
                    device.destroy_command_pool(vk::CommandPool::from_raw(raw), callbacks)
                }
            }
        }
        Ok(())
    }
}

impl DeviceMemoryOps for Device {
    fn non_coherent_atom_size(&self) -> u64 {
        self.non_coherent_atom_size
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.inner.unmap_memory(memory) }
    }

    unsafe fn flush_memory_range(
        &self,
        range: &vk::MappedMemoryRange<'_>,
    ) -> Result<(), CallFailed> {
        unsafe {
            self.inner
                .flush_mapped_memory_ranges(std::slice::from_ref(range))
        }
        .during("vkFlushMappedMemoryRanges")
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        match self.allocator_proxy.callback_block() {
            Ok(callbacks) => unsafe { self.inner.destroy_device(callbacks) },
            Err(_e) => {
                //FIXME: destroying with other callbacks than the device was created with is invalid, but
                //       leaking the device is worse.
                #[cfg(feature = "logging")]
                log::error!("Allocator proxy closed before its device: {}", _e);
                unsafe { self.inner.destroy_device(None) }
            }
        }
        self.allocator_proxy.close();
    }
}
