//! ## Mapped memory
//!
//! Host visible memory can be mapped into the address space of the application. [MappedMemory] is a view over such a
//! mapping. Depending on who created the mapping, flushing and unmapping either go directly through the
//! [Device](crate::context::Device) (for manually allocated [DeviceMemory](crate::handle::ObjectKind::DeviceMemory)),
//! or through the sub-allocator that owns the [Allocation](crate::allocator::Allocation).
//!
//! The view borrows whatever it was mapped from, so the memory can't be freed while it is mapped.

use std::{marker::PhantomData, ptr::NonNull};

use ash::vk::{self, Handle as _};

use crate::{
    allocator::{AllocationToken, Allocator},
    error::{ArgumentError, CallFailed, MemoryError},
};

///Non owning reference to a [vk::DeviceMemory] object. Used to expose which memory backs an allocation.
/// Can't be used to free the memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceMemoryRef(vk::DeviceMemory);

impl DeviceMemoryRef {
    ///Returns `None` for a null handle.
    pub fn new(memory: vk::DeviceMemory) -> Option<Self> {
        if memory == vk::DeviceMemory::null() {
            None
        } else {
            Some(DeviceMemoryRef(memory))
        }
    }

    pub fn handle(&self) -> vk::DeviceMemory {
        self.0
    }

    pub fn raw(&self) -> u64 {
        self.0.as_raw()
    }
}

///Device level memory functions needed by directly mapped memory.
pub trait DeviceMemoryOps: Send + Sync {
    ///See [limits](https://registry.khronos.org/vulkan/specs/1.3-extensions/man/html/VkPhysicalDeviceLimits.html).
    fn non_coherent_atom_size(&self) -> u64;

    /// # Safety
    /// `memory` must be mapped, and must not be accessed through the mapping afterwards.
    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);

    /// # Safety
    /// `range` must be within a currently mapped region.
    unsafe fn flush_memory_range(
        &self,
        range: &vk::MappedMemoryRange<'_>,
    ) -> Result<(), CallFailed>;
}

///Rounds `[start, end)` outwards to multiples of `atom`. Returns the aligned offset and size.
pub(crate) fn align_to_atom(start: u64, end: u64, atom: u64) -> (u64, u64) {
    let atom = atom.max(1);
    let aligned_start = start - (start % atom);
    let aligned_end = end.div_ceil(atom).saturating_mul(atom);
    (aligned_start, aligned_end - aligned_start)
}

enum MappingSource<'a> {
    Device {
        device: &'a dyn DeviceMemoryOps,
        memory: vk::DeviceMemory,
        ///Offset of the mapping within `memory`.
        offset: u64,
    },
    Allocator {
        allocator: &'a dyn Allocator,
        token: AllocationToken,
    },
}

///View over a mapped, host visible memory range.
pub struct MappedMemory<'a> {
    ptr: NonNull<u8>,
    size: usize,
    mapped: bool,
    source: MappingSource<'a>,
    lifetime: PhantomData<&'a [u8]>,
}

impl<'a> MappedMemory<'a> {
    /// # Safety
    /// `ptr` must point to `size` bytes of `memory` mapped starting at `offset`.
    pub(crate) unsafe fn from_device(
        device: &'a dyn DeviceMemoryOps,
        memory: vk::DeviceMemory,
        offset: u64,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Self {
        MappedMemory {
            ptr,
            size,
            mapped: true,
            source: MappingSource::Device {
                device,
                memory,
                offset,
            },
            lifetime: PhantomData,
        }
    }

    /// # Safety
    /// `ptr` must point to `size` bytes of the allocation `token` of `allocator`.
    pub(crate) unsafe fn from_allocator(
        allocator: &'a dyn Allocator,
        token: AllocationToken,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Self {
        MappedMemory {
            ptr,
            size,
            mapped: true,
            source: MappingSource::Allocator { allocator, token },
            lifetime: PhantomData,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    ///Size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    ///Start of the mapping. Dangling once the view is closed.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    ///The whole mapped range. Empty once closed.
    pub fn as_bytes(&self) -> &[u8] {
        if !self.mapped {
            return &[];
        }
        //Safety: ptr is mapped for size bytes while `mapped` is set.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    ///The whole mapped range. Empty once closed.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        if !self.mapped {
            return &mut [];
        }
        //Safety: ptr is mapped for size bytes while `mapped` is set, and we hold the only view.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    ///Makes host writes to `[offset, offset + size)` visible to the device. `size` can be [vk::WHOLE_SIZE] to flush
    /// till the end of the mapping. Does nothing if the memory is not mapped anymore.
    pub fn flush_range(&self, offset: u64, size: u64) -> Result<(), MemoryError> {
        if !self.mapped {
            return Ok(());
        }

        if offset > self.size as u64 {
            return Err(ArgumentError::invalid(
                "offset",
                format!("{} exceeds mapping of {} bytes", offset, self.size),
            )
            .into());
        }

        let end = if size == vk::WHOLE_SIZE {
            self.size as u64
        } else {
            offset.saturating_add(size).min(self.size as u64)
        };
        //Empty ranges are not valid flush ranges.
        if offset >= end {
            return Ok(());
        }

        match &self.source {
            MappingSource::Device {
                device,
                memory,
                offset: map_offset,
            } => {
                let map_end = map_offset + self.size as u64;
                let (aligned_offset, aligned_size) = align_to_atom(
                    map_offset + offset,
                    map_offset + end,
                    device.non_coherent_atom_size(),
                );
                //Rounding up past the mapping is not allowed, but WHOLE_SIZE covers exactly the rest of it.
                let aligned_size = if aligned_offset + aligned_size >= map_end {
                    vk::WHOLE_SIZE
                } else {
                    aligned_size
                };

                let range = vk::MappedMemoryRange::default()
                    .memory(*memory)
                    .offset(aligned_offset)
                    .size(aligned_size);
                //Safety: range lies within the mapping, since we are still mapped.
                unsafe { device.flush_memory_range(&range)? };
                Ok(())
            }
            MappingSource::Allocator { allocator, token } => {
                //Safety: token is alive since the view borrows its allocation.
                unsafe { allocator.flush(*token, offset, size) }
            }
        }
    }

    ///Flushes the whole mapping.
    pub fn flush(&self) -> Result<(), MemoryError> {
        self.flush_range(0, vk::WHOLE_SIZE)
    }

    ///Unmaps the memory. Calling this more than once does nothing.
    pub fn close(&mut self) {
        if !self.mapped {
            return;
        }
        self.mapped = false;

        match &self.source {
            //Safety: still mapped, and no slice can outlive the borrow of self.
            MappingSource::Device { device, memory, .. } => unsafe { device.unmap_memory(*memory) },
            MappingSource::Allocator { allocator, token } => {
                if let Err(_e) = unsafe { allocator.unmap(*token) } {
                    #[cfg(feature = "logging")]
                    log::error!("Unmapping {:?} failed: {}", token, _e);
                }
            }
        }
    }
}

impl Drop for MappedMemory<'_> {
    fn drop(&mut self) {
        self.close()
    }
}

///Convenience for mapping memory for a single write.
pub(crate) fn checked_write(
    view: &mut MappedMemory<'_>,
    offset: usize,
    data: &[u8],
) -> Result<usize, MemoryError> {
    let size = view.size();
    if offset > size {
        return Err(ArgumentError::invalid(
            "offset",
            format!("{} exceeds mapping of {} bytes", offset, size),
        )
        .into());
    }
    let written = data.len().min(size - offset);
    view.as_bytes_mut()[offset..offset + written].copy_from_slice(&data[..written]);
    Ok(written)
}
