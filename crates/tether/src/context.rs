//! ## Context
//!
//! When working with Vulkan the [Device](ash::Device) is entry point for most of the operations.
//! It therefore is needed in most structures and functions calls that somehow transform state related to Vulkan.
//!
//! Tether does not create instances or pick physical devices. The [Device] wraps a device created by the application
//! together with the [AllocatorProxy](crate::allocator::AllocatorProxy) it was created with. Every object created
//! from the device is destroyed with the same host allocation callbacks, and the proxy is closed once the device
//! is gone.
//!
//! When working with buffers (and images) another structure, the allocator is relevant.
//! Have a look at the [allocator](crate::allocator) module for its definition and default implementation.

mod device;
pub use device::Device;
