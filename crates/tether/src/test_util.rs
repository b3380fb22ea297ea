//! Recording test doubles for the trait seams. None of them needs a GPU.

use std::{
    ffi::c_void,
    ptr::NonNull,
    sync::{Mutex, MutexGuard},
};

use ahash::{AHashMap, AHashSet};
use ash::vk::{self, Handle as _};

use crate::{
    allocator::{
        AllocationCreateInfo, AllocationToken, Allocator, BackendAllocation, HostAllocator,
        SystemHostAllocator,
    },
    error::{AllocationError, CallFailed, DeviceError, MemoryError},
    handle::{ObjectKind, Teardown},
    memory::DeviceMemoryOps,
};

///Records every teardown. Optionally fails all of them.
#[derive(Default)]
pub struct RecordingTeardown {
    calls: Mutex<Vec<(ObjectKind, u64)>>,
    fail: bool,
}

impl RecordingTeardown {
    pub fn failing() -> Self {
        RecordingTeardown {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(ObjectKind, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Teardown for RecordingTeardown {
    unsafe fn teardown(&self, kind: ObjectKind, raw: u64) -> Result<(), DeviceError> {
        self.calls.lock().unwrap().push((kind, raw));
        if self.fail {
            Err(CallFailed {
                call: "vkDestroy",
                result: vk::Result::ERROR_DEVICE_LOST,
            }
            .into())
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostCounts {
    pub allocations: usize,
    pub reallocations: usize,
    pub frees: usize,
    pub internal_allocations: usize,
    pub internal_frees: usize,
}

///Counts the calls per callback and forwards them to a [SystemHostAllocator].
#[derive(Default)]
pub struct CountingHostAllocator {
    system: SystemHostAllocator,
    counts: Mutex<HostCounts>,
}

impl CountingHostAllocator {
    pub fn counts(&self) -> HostCounts {
        *self.counts.lock().unwrap()
    }

    pub fn system(&self) -> &SystemHostAllocator {
        &self.system
    }
}

impl HostAllocator for CountingHostAllocator {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        scope: vk::SystemAllocationScope,
    ) -> Option<NonNull<c_void>> {
        self.counts.lock().unwrap().allocations += 1;
        self.system.allocate(size, alignment, scope)
    }

    fn free(&self, memory: NonNull<c_void>) {
        self.counts.lock().unwrap().frees += 1;
        self.system.free(memory)
    }

    fn reallocate(
        &self,
        original: NonNull<c_void>,
        size: usize,
        alignment: usize,
        scope: vk::SystemAllocationScope,
    ) -> Option<NonNull<c_void>> {
        self.counts.lock().unwrap().reallocations += 1;
        self.system.reallocate(original, size, alignment, scope)
    }

    fn on_internal_allocation(
        &self,
        size: usize,
        kind: vk::InternalAllocationType,
        scope: vk::SystemAllocationScope,
    ) {
        self.counts.lock().unwrap().internal_allocations += 1;
        self.system.on_internal_allocation(size, kind, scope)
    }

    fn on_internal_free(
        &self,
        size: usize,
        kind: vk::InternalAllocationType,
        scope: vk::SystemAllocationScope,
    ) {
        self.counts.lock().unwrap().internal_frees += 1;
        self.system.on_internal_free(size, kind, scope)
    }
}

///Create and destroy calls seen by a [MockAllocator].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    CreateBuffer {
        size: u64,
        usage: vk::BufferUsageFlags,
        name: String,
        dedicated: bool,
        required: vk::MemoryPropertyFlags,
    },
    CreateImage {
        extent: vk::Extent3D,
        usage: vk::ImageUsageFlags,
        name: String,
    },
    DestroyBuffer(vk::Buffer, AllocationToken),
    DestroyImage(vk::Image, AllocationToken),
}

struct NextAllocation {
    resource: u64,
    token: u64,
    memory: u64,
    offset: u64,
    size: u64,
    memory_type_index: u32,
}

#[derive(Default)]
struct MockState {
    calls: Vec<BackendCall>,
    flushes: Vec<(AllocationToken, u64, u64)>,
    unmaps: Vec<AllocationToken>,
    next: Option<NextAllocation>,
    fail_next: Option<vk::Result>,
    counter: u64,
    memory: AHashMap<AllocationToken, Box<[u8]>>,
    mappable: AHashSet<AllocationToken>,
}

///[Allocator] backend that hands out host memory and records every call.
///
/// Unless configured through [MockAllocator::set_next] every creation gets a fresh handle and token, memory `0xCCCC`,
/// offset 0 and exactly the requested size. Allocations are mappable if `HOST_VISIBLE` was required.
#[derive(Default)]
pub struct MockAllocator {
    state: Mutex<MockState>,
}

impl MockAllocator {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    ///Values reported by the next successful creation.
    pub fn set_next(
        &self,
        resource: u64,
        token: u64,
        memory: u64,
        offset: u64,
        size: u64,
        memory_type_index: u32,
    ) {
        self.lock().next = Some(NextAllocation {
            resource,
            token,
            memory,
            offset,
            size,
            memory_type_index,
        });
    }

    ///Lets the next creation fail with `result`.
    pub fn fail_next_create(&self, result: vk::Result) {
        self.lock().fail_next = Some(result);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    pub fn destroys(&self) -> Vec<BackendCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    BackendCall::DestroyBuffer(..) | BackendCall::DestroyImage(..)
                )
            })
            .cloned()
            .collect()
    }

    pub fn count(&self, call: &BackendCall) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn flushes(&self) -> Vec<(AllocationToken, u64, u64)> {
        self.lock().flushes.clone()
    }

    pub fn unmaps(&self) -> Vec<AllocationToken> {
        self.lock().unmaps.clone()
    }

    ///Content of the memory backing `token`.
    pub fn memory_of(&self, token: AllocationToken) -> Vec<u8> {
        self.lock()
            .memory
            .get(&token)
            .map(|m| m.to_vec())
            .unwrap_or_default()
    }

    fn create<R: vk::Handle>(
        &self,
        call: BackendCall,
        requested_size: u64,
        call_name: &'static str,
        mappable: bool,
    ) -> Result<BackendAllocation<R>, AllocationError> {
        let mut state = self.lock();
        state.calls.push(call);
        if let Some(result) = state.fail_next.take() {
            return Err(CallFailed {
                call: call_name,
                result,
            }
            .into());
        }

        state.counter += 1;
        let counter = state.counter;
        let next = state.next.take().unwrap_or(NextAllocation {
            resource: 0x1000 + counter,
            token: counter,
            memory: 0xCCCC,
            offset: 0,
            size: requested_size,
            memory_type_index: 0,
        });

        let token = AllocationToken(next.token);
        state
            .memory
            .insert(token, vec![0u8; next.size as usize].into_boxed_slice());
        if mappable {
            state.mappable.insert(token);
        }

        Ok(BackendAllocation {
            resource: R::from_raw(next.resource),
            token,
            memory_type_index: next.memory_type_index,
            device_memory: vk::DeviceMemory::from_raw(next.memory),
            offset: next.offset,
            size: next.size,
        })
    }
}

impl Allocator for MockAllocator {
    unsafe fn create_buffer(
        &self,
        buffer_info: &vk::BufferCreateInfo<'_>,
        allocation_info: &AllocationCreateInfo<'_>,
    ) -> Result<BackendAllocation<vk::Buffer>, AllocationError> {
        let call = BackendCall::CreateBuffer {
            size: buffer_info.size,
            usage: buffer_info.usage,
            name: allocation_info.name.to_owned(),
            dedicated: allocation_info.dedicated,
            required: allocation_info.required_flags,
        };
        let mappable = allocation_info
            .required_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        self.create(call, buffer_info.size, "vkCreateBuffer", mappable)
    }

    unsafe fn create_image(
        &self,
        image_info: &vk::ImageCreateInfo<'_>,
        allocation_info: &AllocationCreateInfo<'_>,
    ) -> Result<BackendAllocation<vk::Image>, AllocationError> {
        let call = BackendCall::CreateImage {
            extent: image_info.extent,
            usage: image_info.usage,
            name: allocation_info.name.to_owned(),
        };
        let extent = image_info.extent;
        let size = u64::from(extent.width)
            * u64::from(extent.height)
            * u64::from(extent.depth)
            * u64::from(image_info.array_layers)
            * 4;
        let mappable = allocation_info
            .required_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        self.create(call, size, "vkCreateImage", mappable)
    }

    unsafe fn destroy_buffer(
        &self,
        buffer: vk::Buffer,
        token: AllocationToken,
    ) -> Result<(), AllocationError> {
        let mut state = self.lock();
        state.calls.push(BackendCall::DestroyBuffer(buffer, token));
        state.mappable.remove(&token);
        Ok(())
    }

    unsafe fn destroy_image(
        &self,
        image: vk::Image,
        token: AllocationToken,
    ) -> Result<(), AllocationError> {
        let mut state = self.lock();
        state.calls.push(BackendCall::DestroyImage(image, token));
        state.mappable.remove(&token);
        Ok(())
    }

    unsafe fn map(&self, token: AllocationToken) -> Result<NonNull<u8>, MemoryError> {
        let mut state = self.lock();
        if !state.mappable.contains(&token) {
            return Err(if state.memory.contains_key(&token) {
                MemoryError::NotMappable
            } else {
                MemoryError::UnknownToken(token)
            });
        }
        let memory = state
            .memory
            .get_mut(&token)
            .ok_or(MemoryError::UnknownToken(token))?;
        Ok(NonNull::from(&mut memory[..]).cast())
    }

    unsafe fn unmap(&self, token: AllocationToken) -> Result<(), MemoryError> {
        self.lock().unmaps.push(token);
        Ok(())
    }

    unsafe fn flush(
        &self,
        token: AllocationToken,
        offset: u64,
        size: u64,
    ) -> Result<(), MemoryError> {
        self.lock().flushes.push((token, offset, size));
        Ok(())
    }
}

///[DeviceMemoryOps] that records unmaps and flushes.
pub struct RecordingMemoryOps {
    atom: u64,
    flushes: Mutex<Vec<(vk::DeviceMemory, u64, u64)>>,
    unmaps: Mutex<Vec<vk::DeviceMemory>>,
}

impl RecordingMemoryOps {
    pub fn with_atom(atom: u64) -> Self {
        RecordingMemoryOps {
            atom,
            flushes: Mutex::new(Vec::new()),
            unmaps: Mutex::new(Vec::new()),
        }
    }

    pub fn flushes(&self) -> Vec<(vk::DeviceMemory, u64, u64)> {
        self.flushes.lock().unwrap().clone()
    }

    pub fn unmaps(&self) -> Vec<vk::DeviceMemory> {
        self.unmaps.lock().unwrap().clone()
    }
}

impl DeviceMemoryOps for RecordingMemoryOps {
    fn non_coherent_atom_size(&self) -> u64 {
        self.atom
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.unmaps.lock().unwrap().push(memory);
    }

    unsafe fn flush_memory_range(
        &self,
        range: &vk::MappedMemoryRange<'_>,
    ) -> Result<(), CallFailed> {
        self.flushes
            .lock()
            .unwrap()
            .push((range.memory, range.offset, range.size));
        Ok(())
    }
}
