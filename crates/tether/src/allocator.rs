//! ## Allocator
//!
//! In Vulkan the application itself is responsible for allocating memory.
//! Most of the time however this will be done trough some external sub-allocator that carves big memory blocks into
//! the small allocations needed by single buffers and images.
//!
//! Since there are several, tether provides a simple abstraction via the [Allocator] trait. The [SubAllocator] builds on
//! top of it: It creates a resource together with its memory and hands out an [Allocation] that destroys both at once.
//!
//! A default implementation based on [Traverse Researche's](https://github.com/Traverse-Research/gpu-allocator) `gpu-allocator`
//! crate is included trough the `default_allocator` feature that is enabled by default.
//!
//! The [host] submodule is unrelated to device memory. It allows replacing the host memory allocator Vulkan uses
//! internally.

#[cfg(feature = "default_allocator")]
mod gpu_allocator;
#[cfg(feature = "default_allocator")]
pub use self::gpu_allocator::{GpuAllocatorBackend, GpuAllocatorBackendDesc};

pub mod host;
pub use host::{AllocatorProxy, CallbackSlot, HostAllocator};

mod system;
pub use system::SystemHostAllocator;

use std::{
    fmt::Debug,
    hash::{Hash, Hasher},
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use ash::vk::{self, Handle as _};
use bumpalo::Bump;

use crate::{
    error::{AllocationError, ArgumentError, HandleError, MemoryError},
    handle::{AsRawObject, ObjectKind},
    marshal::{Marshal, ScratchArena},
    memory::{DeviceMemoryRef, MappedMemory},
    resources::{BufDesc, ImgDesc},
};

///Types of memory usage. Make sure to use GpuOnly wherever it applies to get optimal performance.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum MemoryUsage {
    Unknown,
    GpuOnly,
    CpuToGpu,
    GpuToCpu,
}

impl MemoryUsage {
    ///True if memory of this usage is expected to be mappable by the host.
    pub fn is_host_visible(&self) -> bool {
        matches!(self, MemoryUsage::CpuToGpu | MemoryUsage::GpuToCpu)
    }
}

///Flags that change how an allocation is placed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AllocationFlags {
    ///Use a memory block of its own, instead of a sub-allocation.
    pub dedicated: bool,
    ///The allocation must be mappable by the host.
    pub mapped: bool,
}

///Allocation policy for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationDesc {
    pub usage: MemoryUsage,
    pub flags: AllocationFlags,
    ///Properties the chosen memory must have.
    pub required_flags: vk::MemoryPropertyFlags,
    ///Properties that are used as a hint if `usage` is [MemoryUsage::Unknown].
    pub preferred_flags: vk::MemoryPropertyFlags,
    ///Debug name of the allocation.
    pub name: Option<String>,
}

impl Default for AllocationDesc {
    fn default() -> Self {
        AllocationDesc {
            usage: MemoryUsage::GpuOnly,
            flags: AllocationFlags::default(),
            required_flags: vk::MemoryPropertyFlags::empty(),
            preferred_flags: vk::MemoryPropertyFlags::empty(),
            name: None,
        }
    }
}

impl AllocationDesc {
    pub fn gpu_only() -> Self {
        Self::default()
    }

    ///Host visible memory that is mapped for uploads.
    pub fn cpu_to_gpu() -> Self {
        AllocationDesc {
            usage: MemoryUsage::CpuToGpu,
            flags: AllocationFlags {
                mapped: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    ///Host visible memory that is mapped for read backs.
    pub fn gpu_to_cpu() -> Self {
        AllocationDesc {
            usage: MemoryUsage::GpuToCpu,
            flags: AllocationFlags {
                mapped: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn dedicated(mut self) -> Self {
        self.flags.dedicated = true;
        self
    }
}

///Native argument block of an [AllocationDesc].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationCreateInfo<'a> {
    pub name: &'a str,
    pub usage: MemoryUsage,
    pub dedicated: bool,
    pub required_flags: vk::MemoryPropertyFlags,
    pub preferred_flags: vk::MemoryPropertyFlags,
}

impl Marshal for AllocationDesc {
    type Native<'a> = AllocationCreateInfo<'a>;

    fn validate(&self) -> Result<(), ArgumentError> {
        if self.flags.mapped && self.usage == MemoryUsage::GpuOnly {
            return Err(ArgumentError::invalid(
                "allocation_policy",
                "GpuOnly memory can not be mapped",
            ));
        }
        Ok(())
    }

    fn marshal<'a>(&'a self, arena: &'a Bump) -> Result<Self::Native<'a>, ArgumentError> {
        let mut required_flags = self.required_flags;
        if self.flags.mapped {
            required_flags |= vk::MemoryPropertyFlags::HOST_VISIBLE;
        }

        Ok(AllocationCreateInfo {
            name: arena.alloc_str(self.name.as_deref().unwrap_or("tether allocation")),
            usage: self.usage,
            dedicated: self.flags.dedicated,
            required_flags,
            preferred_flags: self.preferred_flags,
        })
    }
}

///Key of a single allocation in the backend's own bookkeeping. Not a Vulkan handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationToken(pub u64);

///Everything a backend reports about a freshly created and bound resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendAllocation<R> {
    pub resource: R,
    pub token: AllocationToken,
    pub memory_type_index: u32,
    ///Might be null if the allocation has no backing memory (yet).
    pub device_memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
}

///Sub-allocation backend. Creates resources together with their memory and destroys both together.
pub trait Allocator: Send + Sync {
    ///Creates a buffer, allocates memory for it and binds it. Either all of that succeeds or nothing is retained.
    ///
    /// # Safety
    /// `buffer_info` must be a valid create info, including its `p_next` chain.
    unsafe fn create_buffer(
        &self,
        buffer_info: &vk::BufferCreateInfo<'_>,
        allocation_info: &AllocationCreateInfo<'_>,
    ) -> Result<BackendAllocation<vk::Buffer>, AllocationError>;

    ///Creates an image, allocates memory for it and binds it. Either all of that succeeds or nothing is retained.
    ///
    /// # Safety
    /// `image_info` must be a valid create info, including its `p_next` chain.
    unsafe fn create_image(
        &self,
        image_info: &vk::ImageCreateInfo<'_>,
        allocation_info: &AllocationCreateInfo<'_>,
    ) -> Result<BackendAllocation<vk::Image>, AllocationError>;

    ///Destroys `buffer` and frees `token`.
    ///
    /// # Safety
    /// Both must have been created together by [Self::create_buffer] and must not be used afterwards.
    unsafe fn destroy_buffer(
        &self,
        buffer: vk::Buffer,
        token: AllocationToken,
    ) -> Result<(), AllocationError>;

    ///Destroys `image` and frees `token`.
    ///
    /// # Safety
    /// Both must have been created together by [Self::create_image] and must not be used afterwards.
    unsafe fn destroy_image(
        &self,
        image: vk::Image,
        token: AllocationToken,
    ) -> Result<(), AllocationError>;

    ///Maps the allocation and returns a pointer to its first byte.
    ///
    /// # Safety
    /// `token` must be a live allocation of this backend.
    unsafe fn map(&self, token: AllocationToken) -> Result<NonNull<u8>, MemoryError>;

    /// # Safety
    /// `token` must be mapped, the mapping must not be accessed afterwards.
    unsafe fn unmap(&self, token: AllocationToken) -> Result<(), MemoryError>;

    ///Flushes `[offset, offset + size)` of the allocation, relative to the allocation's start. `size` might be
    /// [vk::WHOLE_SIZE].
    ///
    /// # Safety
    /// `token` must be a live, mapped allocation of this backend.
    unsafe fn flush(
        &self,
        token: AllocationToken,
        offset: u64,
        size: u64,
    ) -> Result<(), MemoryError>;
}

///Snapshot of where an allocation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationInfo {
    pub memory_type_index: u32,
    ///`None` if there is currently no device memory backing the allocation.
    pub device_memory: Option<DeviceMemoryRef>,
    pub offset: u64,
    pub size: u64,
}

///Resource created together with an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

impl AsRawObject for Resource {
    fn object_kind(&self) -> ObjectKind {
        match self {
            Resource::Buffer(_) => ObjectKind::Buffer,
            Resource::Image(_) => ObjectKind::Image,
        }
    }

    fn as_raw(&self) -> u64 {
        match self {
            Resource::Buffer(b) => b.as_raw(),
            Resource::Image(i) => i.as_raw(),
        }
    }
}

///How an allocation is destroyed. Recorded when it is created and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationTeardown {
    Buffer {
        buffer: vk::Buffer,
        token: AllocationToken,
    },
    Image {
        image: vk::Image,
        token: AllocationToken,
    },
}

impl AllocationTeardown {
    pub fn token(&self) -> AllocationToken {
        match self {
            AllocationTeardown::Buffer { token, .. } | AllocationTeardown::Image { token, .. } => {
                *token
            }
        }
    }

    pub fn resource(&self) -> Resource {
        match self {
            AllocationTeardown::Buffer { buffer, .. } => Resource::Buffer(*buffer),
            AllocationTeardown::Image { image, .. } => Resource::Image(*image),
        }
    }
}

///A resource and its memory. Both are destroyed together when the allocation is closed or dropped.
pub struct Allocation {
    allocator_id: u64,
    teardown: AllocationTeardown,
    info: AllocationInfo,
    backend: Arc<dyn Allocator>,
    closed: bool,
}

impl Allocation {
    pub fn info(&self) -> AllocationInfo {
        self.info
    }

    pub fn token(&self) -> AllocationToken {
        self.teardown.token()
    }

    ///The kind of resource this allocation was created for.
    pub fn resource_kind(&self) -> ObjectKind {
        self.teardown.resource().object_kind()
    }

    ///The resource backed by this allocation. Fails if the allocation was closed.
    pub fn resource(&self) -> Result<Resource, HandleError> {
        self.check_not_closed()?;
        Ok(self.teardown.resource())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn check_not_closed(&self) -> Result<(), HandleError> {
        if self.closed {
            let resource = self.teardown.resource();
            Err(HandleError::Destroyed {
                kind: resource.object_kind(),
                raw: resource.as_raw(),
            })
        } else {
            Ok(())
        }
    }

    ///Destroys the resource and frees its memory in one go. Calling this more than once does nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        #[cfg(feature = "logging")]
        log::trace!("Destroying {:?}", self.teardown);

        //Safety: The teardown operands where created together by `backend`, the closed flag
        //        makes sure they are destroyed only once.
        let result = unsafe {
            match self.teardown {
                AllocationTeardown::Buffer { buffer, token } => {
                    self.backend.destroy_buffer(buffer, token)
                }
                AllocationTeardown::Image { image, token } => {
                    self.backend.destroy_image(image, token)
                }
            }
        };

        if let Err(_e) = result {
            #[cfg(feature = "logging")]
            log::error!("Destroying {:?} failed: {}", self.teardown, _e);
        }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.close()
    }
}

///Allocations are equal if they start at the same location in the same device memory. Different resources
/// can alias the same memory.
impl PartialEq for Allocation {
    fn eq(&self, other: &Self) -> bool {
        self.info.device_memory == other.info.device_memory && self.info.offset == other.info.offset
    }
}

impl Eq for Allocation {}

impl Hash for Allocation {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.info.device_memory.hash(hasher);
        self.info.offset.hash(hasher);
    }
}

impl Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("teardown", &self.teardown)
            .field("info", &self.info)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

static NEXT_SUB_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(0);

///Creates buffers and images with bound memory through an [Allocator] backend.
pub struct SubAllocator {
    id: u64,
    backend: Arc<dyn Allocator>,
    scratch: ScratchArena,
}

impl SubAllocator {
    pub fn new(backend: Arc<dyn Allocator>) -> Self {
        SubAllocator {
            id: NEXT_SUB_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            backend,
            scratch: ScratchArena::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Allocator> {
        &self.backend
    }

    fn wrap<R>(&self, created: &BackendAllocation<R>, teardown: AllocationTeardown) -> Allocation {
        Allocation {
            allocator_id: self.id,
            teardown,
            info: AllocationInfo {
                memory_type_index: created.memory_type_index,
                device_memory: DeviceMemoryRef::new(created.device_memory),
                offset: created.offset,
                size: created.size,
            },
            backend: self.backend.clone(),
            closed: false,
        }
    }

    ///Creates a buffer of `shape` with memory allocated according to `policy`.
    pub fn create_buffer(
        &self,
        policy: &AllocationDesc,
        shape: &BufDesc,
    ) -> Result<(Allocation, vk::Buffer), AllocationError> {
        shape.validate()?;
        policy.validate()?;

        let frame = self.scratch.frame();
        let buffer_info = shape.marshal(frame.arena())?;
        let allocation_info = policy.marshal(frame.arena())?;

        //Safety: both infos where just built by the marshaller and live till the frame is dropped.
        let created = unsafe { self.backend.create_buffer(buffer_info, &allocation_info)? };

        #[cfg(feature = "logging")]
        log::debug!(
            "Created buffer {:?} ({} bytes) in memory type {}",
            created.resource,
            created.size,
            created.memory_type_index
        );

        let allocation = self.wrap(
            &created,
            AllocationTeardown::Buffer {
                buffer: created.resource,
                token: created.token,
            },
        );
        Ok((allocation, created.resource))
    }

    ///Creates an image of `shape` with memory allocated according to `policy`.
    pub fn create_image(
        &self,
        policy: &AllocationDesc,
        shape: &ImgDesc,
    ) -> Result<(Allocation, vk::Image), AllocationError> {
        shape.validate()?;
        policy.validate()?;

        let frame = self.scratch.frame();
        let image_info = shape.marshal(frame.arena())?;
        let allocation_info = policy.marshal(frame.arena())?;

        //Safety: both infos where just built by the marshaller and live till the frame is dropped.
        let created = unsafe { self.backend.create_image(image_info, &allocation_info)? };

        #[cfg(feature = "logging")]
        log::debug!(
            "Created image {:?} ({} bytes) in memory type {}",
            created.resource,
            created.size,
            created.memory_type_index
        );

        let allocation = self.wrap(
            &created,
            AllocationTeardown::Image {
                image: created.resource,
                token: created.token,
            },
        );
        Ok((allocation, created.resource))
    }

    ///Maps the whole `allocation`. The allocation is borrowed exclusively while the mapping is alive, so it can
    /// neither be closed nor mapped a second time.
    ///
    /// ```compile_fail
    /// # use tether::allocator::{Allocation, SubAllocator};
    /// fn map_twice(sub: &SubAllocator, allocation: &mut Allocation) {
    ///     let first = sub.map_memory(allocation).unwrap();
    ///     let second = sub.map_memory(allocation).unwrap();
    ///     drop((first, second));
    /// }
    /// ```
    pub fn map_memory<'a>(
        &self,
        allocation: &'a mut Allocation,
    ) -> Result<MappedMemory<'a>, MemoryError> {
        let allocation: &'a Allocation = allocation;
        if allocation.allocator_id != self.id {
            return Err(ArgumentError::Incompatible {
                name: "allocation",
                owner: "SubAllocator",
            }
            .into());
        }
        allocation.check_not_closed()?;

        let token = allocation.token();
        //Safety: the allocation is alive and belongs to our backend.
        let ptr = unsafe { allocation.backend.map(token)? };
        //Safety: the backend mapped the whole allocation at ptr.
        Ok(unsafe {
            MappedMemory::from_allocator(
                allocation.backend.as_ref(),
                token,
                ptr,
                allocation.info.size as usize,
            )
        })
    }
}
