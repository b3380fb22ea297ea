//! # Tether
//!
//! Ownership tracked Vulkan objects on top of [ash].
//!
//! # Usage
//!
//! Every Vulkan object tether hands out is wrapped in a [Handle](handle::Handle) that knows whether it is responsible
//! for destroying the object, and whether it was already destroyed. Closing a handle twice is fine, using it after
//! it was closed is an error instead of undefined behaviour.
//!
//! Buffers and images are usually not created one by one, but through a [SubAllocator](allocator::SubAllocator) that
//! creates the resource and its memory in one go, and frees both together once the [Allocation](allocator::Allocation)
//! is dropped. Host visible memory can be mapped into a [MappedMemory](memory::MappedMemory) view.
//!
//! Optionally the driver's host memory allocations can be redirected to a
//! [HostAllocator](allocator::HostAllocator) via an [AllocatorProxy](allocator::AllocatorProxy).
//!
//! Structures that are not sensitive to lifetime requirements (like create info) are not wrapped.

pub use ash;
#[cfg(feature = "default_allocator")]
pub use gpu_allocator;

pub use bytemuck;

///Allocator related details. Tether allows for custom sub-allocation backends as well as custom host allocators.
pub mod allocator;

///The [Device](context::Device) wrapper all other objects are created from.
pub mod context;

///Opaque handles and their ownership.
pub mod handle;

///Conversion of descriptions into native create infos.
pub mod marshal;

///Mapped views of host visible memory.
pub mod memory;

///Allocatable resources. Mostly [Image](resources::Image) and [Buffer](resources::Buffer).
pub mod resources;

mod error;
pub use error::{
    AllocationError, ArgumentError, CallFailed, DeviceError, HandleError, MemoryError, ProxyError,
    TetherError,
};

#[cfg(test)]
pub(crate) mod test_util;
