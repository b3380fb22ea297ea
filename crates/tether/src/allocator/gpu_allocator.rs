use std::{
    cmp::Reverse,
    ptr::NonNull,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use ::gpu_allocator::{
    vulkan::{AllocationCreateDesc, AllocationScheme, AllocatorCreateDesc},
    AllocatorDebugSettings, MemoryLocation,
};
use ash::vk;
use slotmap::{new_key_type, Key, KeyData, SlotMap};

use super::{
    AllocationCreateInfo, AllocationToken, Allocator, BackendAllocation, MemoryUsage, SubAllocator,
};
use crate::{
    context::Device,
    error::{AllocationError, CallFailed, MemoryError, VkResultExt},
    memory::{align_to_atom, DeviceMemoryOps},
};

new_key_type! {
    struct AllocationKey;
}

impl From<AllocationKey> for AllocationToken {
    fn from(key: AllocationKey) -> Self {
        AllocationToken(key.data().as_ffi())
    }
}

impl From<AllocationToken> for AllocationKey {
    fn from(token: AllocationToken) -> Self {
        AllocationKey::from(KeyData::from_ffi(token.0))
    }
}

fn gpu_allocator_error(e: ::gpu_allocator::AllocationError) -> AllocationError {
    AllocationError::GpuAllocatorError(Box::new(e))
}

///Memory properties a usage is best served with.
fn preferred_properties(usage: MemoryUsage) -> vk::MemoryPropertyFlags {
    match usage {
        MemoryUsage::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        MemoryUsage::CpuToGpu => {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        }
        MemoryUsage::GpuToCpu => {
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED
        }
        MemoryUsage::Unknown => vk::MemoryPropertyFlags::empty(),
    }
}

///Selects the memory type for an allocation. Only types allowed by `memory_type_bits` that have all required
/// properties are considered. Of those the one with most preferred properties wins, on a tie the lower index wins.
fn select_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    memory_type_bits: u32,
    info: &AllocationCreateInfo<'_>,
) -> Result<u32, AllocationError> {
    let preferred = preferred_properties(info.usage) | info.preferred_flags;
    let types = &properties.memory_types[..properties.memory_type_count as usize];
    let allowed = || {
        types
            .iter()
            .enumerate()
            .filter(|(i, _)| memory_type_bits & (1 << i) != 0)
    };

    allowed()
        .filter(|(_, ty)| ty.property_flags.contains(info.required_flags))
        .max_by_key(|(i, ty)| ((ty.property_flags & preferred).as_raw().count_ones(), Reverse(*i)))
        .map(|(i, _)| i as u32)
        .ok_or_else(|| AllocationError::UnsatisfiedMemoryProperties {
            required: info.required_flags,
            available: allowed().fold(vk::MemoryPropertyFlags::empty(), |flags, (_, ty)| {
                flags | ty.property_flags
            }),
        })
}

///Pins `requirements` to `memory_type_index`. Host visible, non coherent memory is padded to whole atoms, so flushes
/// never touch a neighbouring allocation.
fn pin_requirements(
    requirements: vk::MemoryRequirements,
    memory_type_index: u32,
    flags: vk::MemoryPropertyFlags,
    atom: u64,
) -> vk::MemoryRequirements {
    let non_coherent_visible = flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        && !flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT);
    let atom = atom.max(1);
    let (size, alignment) = if non_coherent_visible {
        (
            requirements.size.div_ceil(atom) * atom,
            requirements.alignment.max(atom),
        )
    } else {
        (requirements.size, requirements.alignment)
    };

    vk::MemoryRequirements {
        size,
        alignment,
        memory_type_bits: 1 << memory_type_index,
    }
}

///Atom aligned `(offset, size)` in device memory for flushing `[offset, offset + size)` of an allocation placed at
/// `allocation_offset`. `None` if the range is empty.
fn flush_window(
    allocation_offset: u64,
    allocation_size: u64,
    offset: u64,
    size: u64,
    atom: u64,
) -> Option<(u64, u64)> {
    let start = offset.min(allocation_size);
    let end = if size == vk::WHOLE_SIZE {
        allocation_size
    } else {
        start.saturating_add(size).min(allocation_size)
    };
    if start >= end {
        return None;
    }

    //Non coherent allocations are atom aligned, so the aligned range stays within the allocation.
    Some(align_to_atom(
        allocation_offset + start,
        allocation_offset + end,
        atom,
    ))
}

fn attach<R>(created: BackendAllocation<()>, resource: R) -> BackendAllocation<R> {
    BackendAllocation {
        resource,
        token: created.token,
        memory_type_index: created.memory_type_index,
        device_memory: created.device_memory,
        offset: created.offset,
        size: created.size,
    }
}

///Creation info of a [GpuAllocatorBackend].
pub struct GpuAllocatorBackendDesc {
    pub instance: ash::Instance,
    pub device: Arc<Device>,
    ///Must match the device's `bufferDeviceAddress` feature.
    pub buffer_device_address: bool,
    ///Logs every allocation that is still alive when the backend is dropped.
    pub log_leaks_on_shutdown: bool,
}

impl GpuAllocatorBackendDesc {
    pub fn new(instance: ash::Instance, device: Arc<Device>) -> Self {
        GpuAllocatorBackendDesc {
            instance,
            device,
            buffer_device_address: cfg!(feature = "buffer_device_address"),
            log_leaks_on_shutdown: true,
        }
    }
}

struct Entry {
    allocation: ::gpu_allocator::vulkan::Allocation,
    properties: vk::MemoryPropertyFlags,
}

struct State {
    allocator: ::gpu_allocator::vulkan::Allocator,
    allocations: SlotMap<AllocationKey, Entry>,
}

///Default sub-allocation backend based on Traverse Research's gpu-allocator.
pub struct GpuAllocatorBackend {
    //Note: declared before `device`, the allocator must be dropped before the device can be destroyed.
    state: Mutex<State>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device: Arc<Device>,
}

impl GpuAllocatorBackend {
    pub fn new(desc: GpuAllocatorBackendDesc) -> Result<Self, AllocationError> {
        let GpuAllocatorBackendDesc {
            instance,
            device,
            buffer_device_address,
            log_leaks_on_shutdown,
        } = desc;

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(device.physical_device) };

        let allocator = ::gpu_allocator::vulkan::Allocator::new(&AllocatorCreateDesc {
            instance,
            device: device.inner.clone(),
            physical_device: device.physical_device,
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown,
                ..Default::default()
            },
            buffer_device_address,
            allocation_sizes: Default::default(),
        })
        .map_err(gpu_allocator_error)?;

        Ok(GpuAllocatorBackend {
            state: Mutex::new(State {
                allocator,
                allocations: SlotMap::with_key(),
            }),
            memory_properties,
            device,
        })
    }

    ///Number of allocations that were not freed yet.
    pub fn live_allocations(&self) -> usize {
        self.lock().allocations.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    ///Allocates memory for a resource with `requirements` and binds it through `bind`. If binding fails the memory
    /// is freed again.
    fn allocate_and_bind(
        &self,
        requirements: vk::MemoryRequirements,
        info: &AllocationCreateInfo<'_>,
        linear: bool,
        allocation_scheme: AllocationScheme,
        bind: impl FnOnce(vk::DeviceMemory, u64) -> Result<(), CallFailed>,
    ) -> Result<BackendAllocation<()>, AllocationError> {
        let memory_type_index =
            select_memory_type(&self.memory_properties, requirements.memory_type_bits, info)?;
        let properties =
            self.memory_properties.memory_types[memory_type_index as usize].property_flags;
        let requirements = pin_requirements(
            requirements,
            memory_type_index,
            properties,
            self.device.non_coherent_atom_size(),
        );

        let mut state = self.lock();
        let allocation = state
            .allocator
            .allocate(&AllocationCreateDesc {
                name: info.name,
                requirements,
                //The memory type is already pinned, the location must not filter it again.
                location: MemoryLocation::Unknown,
                linear,
                allocation_scheme,
            })
            .map_err(gpu_allocator_error)?;

        let memory = unsafe { allocation.memory() };
        let offset = allocation.offset();
        let size = allocation.size();

        if let Err(e) = bind(memory, offset) {
            if let Err(_free_error) = state.allocator.free(allocation) {
                #[cfg(feature = "logging")]
                log::error!("Failed to free allocation after failed bind: {}", _free_error);
            }
            return Err(e.into());
        }

        let token = AllocationToken::from(state.allocations.insert(Entry {
            allocation,
            properties,
        }));

        #[cfg(feature = "logging")]
        log::trace!(
            "Allocated {:?} \"{}\": {} bytes at {} in memory type {} ({:?})",
            token,
            info.name,
            size,
            offset,
            memory_type_index,
            properties
        );

        Ok(BackendAllocation {
            resource: (),
            token,
            memory_type_index,
            device_memory: memory,
            offset,
            size,
        })
    }

    fn free(&self, token: AllocationToken) -> Result<(), AllocationError> {
        let mut state = self.lock();
        let entry = state
            .allocations
            .remove(AllocationKey::from(token))
            .ok_or(AllocationError::UnknownToken(token))?;
        state
            .allocator
            .free(entry.allocation)
            .map_err(gpu_allocator_error)
    }
}

impl Allocator for GpuAllocatorBackend {
    unsafe fn create_buffer(
        &self,
        buffer_info: &vk::BufferCreateInfo<'_>,
        allocation_info: &AllocationCreateInfo<'_>,
    ) -> Result<BackendAllocation<vk::Buffer>, AllocationError> {
        let device = &self.device.inner;
        let callbacks = self.device.allocator_proxy.callback_block()?;

        let buffer =
            unsafe { device.create_buffer(buffer_info, callbacks) }.during("vkCreateBuffer")?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let scheme = if allocation_info.dedicated {
            AllocationScheme::DedicatedBuffer(buffer)
        } else {
            AllocationScheme::GpuAllocatorManaged
        };

        let created = self.allocate_and_bind(
            requirements,
            allocation_info,
            true,
            scheme,
            |memory, offset| {
                unsafe { device.bind_buffer_memory(buffer, memory, offset) }
                    .during("vkBindBufferMemory")
            },
        );

        match created {
            Ok(created) => Ok(attach(created, buffer)),
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, callbacks) };
                Err(e)
            }
        }
    }

    unsafe fn create_image(
        &self,
        image_info: &vk::ImageCreateInfo<'_>,
        allocation_info: &AllocationCreateInfo<'_>,
    ) -> Result<BackendAllocation<vk::Image>, AllocationError> {
        let device = &self.device.inner;
        let callbacks = self.device.allocator_proxy.callback_block()?;

        let image =
            unsafe { device.create_image(image_info, callbacks) }.during("vkCreateImage")?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let scheme = if allocation_info.dedicated {
            AllocationScheme::DedicatedImage(image)
        } else {
            AllocationScheme::GpuAllocatorManaged
        };
        let linear = image_info.tiling == vk::ImageTiling::LINEAR;

        let created = self.allocate_and_bind(
            requirements,
            allocation_info,
            linear,
            scheme,
            |memory, offset| {
                unsafe { device.bind_image_memory(image, memory, offset) }
                    .during("vkBindImageMemory")
            },
        );

        match created {
            Ok(created) => Ok(attach(created, image)),
            Err(e) => {
                unsafe { device.destroy_image(image, callbacks) };
                Err(e)
            }
        }
    }

    unsafe fn destroy_buffer(
        &self,
        buffer: vk::Buffer,
        token: AllocationToken,
    ) -> Result<(), AllocationError> {
        let callbacks = self.device.allocator_proxy.callback_block()?;
        unsafe { self.device.inner.destroy_buffer(buffer, callbacks) };
        self.free(token)
    }

    unsafe fn destroy_image(
        &self,
        image: vk::Image,
        token: AllocationToken,
    ) -> Result<(), AllocationError> {
        let callbacks = self.device.allocator_proxy.callback_block()?;
        unsafe { self.device.inner.destroy_image(image, callbacks) };
        self.free(token)
    }

    unsafe fn map(&self, token: AllocationToken) -> Result<NonNull<u8>, MemoryError> {
        let state = self.lock();
        let entry = state
            .allocations
            .get(AllocationKey::from(token))
            .ok_or(MemoryError::UnknownToken(token))?;

        //host visible memory is persistently mapped by gpu-allocator
        entry
            .allocation
            .mapped_ptr()
            .map(NonNull::cast)
            .ok_or(MemoryError::NotMappable)
    }

    unsafe fn unmap(&self, token: AllocationToken) -> Result<(), MemoryError> {
        //The mapping stays alive till the allocation is freed.
        if self.lock().allocations.contains_key(AllocationKey::from(token)) {
            Ok(())
        } else {
            Err(MemoryError::UnknownToken(token))
        }
    }

    unsafe fn flush(
        &self,
        token: AllocationToken,
        offset: u64,
        size: u64,
    ) -> Result<(), MemoryError> {
        let state = self.lock();
        let entry = state
            .allocations
            .get(AllocationKey::from(token))
            .ok_or(MemoryError::UnknownToken(token))?;

        if !entry.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(MemoryError::NotMappable);
        }
        if entry.properties.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
            return Ok(());
        }

        let Some((offset, size)) = flush_window(
            entry.allocation.offset(),
            entry.allocation.size(),
            offset,
            size,
            self.device.non_coherent_atom_size(),
        ) else {
            return Ok(());
        };
        let range = vk::MappedMemoryRange::default()
            .memory(unsafe { entry.allocation.memory() })
            .offset(offset)
            .size(size);

        unsafe { self.device.flush_memory_range(&range)? };
        Ok(())
    }
}

impl Drop for GpuAllocatorBackend {
    fn drop(&mut self) {
        let state = self.lock();
        if !state.allocations.is_empty() {
            #[cfg(feature = "logging")]
            log::warn!(
                "Dropping gpu-allocator backend with {} live allocations",
                state.allocations.len()
            );
        }
    }
}

impl SubAllocator {
    ///Creates a sub-allocator that uses the default [GpuAllocatorBackend].
    pub fn with_gpu_allocator(desc: GpuAllocatorBackendDesc) -> Result<Self, AllocationError> {
        Ok(SubAllocator::new(Arc::new(GpuAllocatorBackend::new(desc)?)))
    }
}
