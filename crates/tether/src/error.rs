use std::error::Error;

use ash::vk;

use thiserror::Error;

use crate::{allocator::AllocationToken, handle::ObjectKind};

///A native call that reported a failure. Carries the name of the call and its result code.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{call} failed with {result}")]
pub struct CallFailed {
    pub call: &'static str,
    #[source]
    pub result: vk::Result,
}

///Maps raw [vk::Result]s to [CallFailed] with the name of the call that produced them.
pub(crate) trait VkResultExt<T> {
    fn during(self, call: &'static str) -> Result<T, CallFailed>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn during(self, call: &'static str) -> Result<T, CallFailed> {
        self.map_err(|result| CallFailed { call, result })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("{kind:?} {raw:#x} was already destroyed")]
    Destroyed { kind: ObjectKind, raw: u64 },
}

///Contract violations of the caller. Those are always raised before anything reaches the driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("Invalid argument `{name}`: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("Argument `{name}` was not created by this {owner}")]
    Incompatible {
        name: &'static str,
        owner: &'static str,
    },
}

impl ArgumentError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        ArgumentError::Invalid {
            name,
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyError {
    #[error("Allocation callbacks were requested after the allocator proxy was closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Vulkan error: {0}")]
    CallFailed(#[from] CallFailed),
    #[error("Allocator proxy error: {0}")]
    Proxy(#[from] ProxyError),
    #[error("Handle error: {0}")]
    Handle(#[from] HandleError),
    #[error("Argument error: {0}")]
    Argument(#[from] ArgumentError),
    #[error("VK_EXT_debug_utils is not loaded for this device")]
    DebugUtilsUnavailable,
}

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("Argument error: {0}")]
    Argument(#[from] ArgumentError),
    #[error("Handle error: {0}")]
    Handle(#[from] HandleError),
    #[error("Vulkan error: {0}")]
    CallFailed(#[from] CallFailed),
    #[error("Allocator proxy error: {0}")]
    Proxy(#[from] ProxyError),
    //FIXME: Not happy about that Box :/
    #[error("GpuAllocator error: {0}")]
    GpuAllocatorError(Box<dyn Error + Send + Sync + 'static>),
    #[error("Allocated memory has properties {available:?}, but {required:?} are required")]
    UnsatisfiedMemoryProperties {
        required: vk::MemoryPropertyFlags,
        available: vk::MemoryPropertyFlags,
    },
    #[error("No allocation is known for {0:?}")]
    UnknownToken(AllocationToken),
}

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Argument error: {0}")]
    Argument(#[from] ArgumentError),
    #[error("Handle error: {0}")]
    Handle(#[from] HandleError),
    #[error("Vulkan error: {0}")]
    CallFailed(#[from] CallFailed),
    #[error("Allocator proxy error: {0}")]
    Proxy(#[from] ProxyError),
    #[error("Memory is not host visible and can not be mapped")]
    NotMappable,
    #[error("No allocation is known for {0:?}")]
    UnknownToken(AllocationToken),
}

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Device error: {0}")]
    DeviceError(#[from] DeviceError),
    #[error("Allocation error: {0}")]
    AllocationError(#[from] AllocationError),
    #[error("Memory error: {0}")]
    MemoryError(#[from] MemoryError),
    #[error("Other error: {0}")]
    Other(String),
}
