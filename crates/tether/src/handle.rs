//! ## Handles
//!
//! Vulkan refers to every object through an opaque 64-bit handle. A [Handle] stores that value together with the
//! [ObjectKind] it refers to and who is responsible for destroying it ([Ownership]).
//!
//! Destruction is explicit through [Handle::close], or implicit when the handle is dropped. In both cases the
//! teardown is executed at most once. Handles that are [Ownership::ExternallyOwned] (for instance swapchain images)
//! are never destroyed by us, they only get marked as closed.
//!
//! Two handles compare equal if their raw values are equal, regardless of which wrapper instance they are.
//! This allows using them as keys in maps without a registry that canonicalizes wrappers.

use std::{
    fmt::Debug,
    hash::{Hash, Hasher},
    sync::Arc,
};

use ash::vk;

use crate::error::{DeviceError, HandleError};

///All object kinds a [Handle] can refer to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    BufferView,
    Image,
    ImageView,
    DeviceMemory,
    Sampler,
    Semaphore,
    Fence,
    Event,
    QueryPool,
    ShaderModule,
    PipelineLayout,
    Pipeline,
    DescriptorSetLayout,
    DescriptorPool,
    CommandPool,
}

impl ObjectKind {
    ///Vulkan's object type for this kind. Used for instance when naming objects for debuggers.
    pub fn object_type(&self) -> vk::ObjectType {
        match self {
            ObjectKind::Buffer => vk::ObjectType::BUFFER,
            ObjectKind::BufferView => vk::ObjectType::BUFFER_VIEW,
            ObjectKind::Image => vk::ObjectType::IMAGE,
            ObjectKind::ImageView => vk::ObjectType::IMAGE_VIEW,
            ObjectKind::DeviceMemory => vk::ObjectType::DEVICE_MEMORY,
            ObjectKind::Sampler => vk::ObjectType::SAMPLER,
            ObjectKind::Semaphore => vk::ObjectType::SEMAPHORE,
            ObjectKind::Fence => vk::ObjectType::FENCE,
            ObjectKind::Event => vk::ObjectType::EVENT,
            ObjectKind::QueryPool => vk::ObjectType::QUERY_POOL,
            ObjectKind::ShaderModule => vk::ObjectType::SHADER_MODULE,
            ObjectKind::PipelineLayout => vk::ObjectType::PIPELINE_LAYOUT,
            ObjectKind::Pipeline => vk::ObjectType::PIPELINE,
            ObjectKind::DescriptorSetLayout => vk::ObjectType::DESCRIPTOR_SET_LAYOUT,
            ObjectKind::DescriptorPool => vk::ObjectType::DESCRIPTOR_POOL,
            ObjectKind::CommandPool => vk::ObjectType::COMMAND_POOL,
        }
    }
}

///Who is responsible for destroying the object behind a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    ///Destroyed by this handle when it is closed.
    UserOwned,
    ///Created as a side effect of another object and destroyed by it. Closing only marks the handle as closed.
    ExternallyOwned,
}

///Kind specific destruction of raw handles. Usually implemented by the [Device](crate::context::Device)
/// that created the object.
pub trait Teardown: Send + Sync {
    ///Destroys the object `raw` of type `kind`.
    ///
    /// # Safety
    /// `raw` must be a live object of `kind` that was created from `self`. It must not be used after this call,
    /// regardless of the result.
    unsafe fn teardown(&self, kind: ObjectKind, raw: u64) -> Result<(), DeviceError>;
}

enum Owner {
    User(Arc<dyn Teardown>),
    External,
}

///Anything that identifies a single Vulkan object.
pub trait AsRawObject {
    fn object_kind(&self) -> ObjectKind;
    fn as_raw(&self) -> u64;
}

///A Vulkan handle that knows its ownership and whether it was already destroyed.
pub struct Handle {
    raw: u64,
    kind: ObjectKind,
    owner: Owner,
    closed: bool,
}

impl Handle {
    ///Wraps `raw`, which will be destroyed through `owner` once the handle is closed.
    ///
    /// # Safety
    /// `raw` must be a live object of `kind`, created from `owner`, and nothing else may destroy it.
    pub unsafe fn owned(owner: Arc<dyn Teardown>, kind: ObjectKind, raw: u64) -> Self {
        Handle {
            raw,
            kind,
            owner: Owner::User(owner),
            closed: false,
        }
    }

    ///Wraps a handle whose lifetime is managed elsewhere. Closing it never destroys the object.
    pub fn external(kind: ObjectKind, raw: u64) -> Self {
        Handle {
            raw,
            kind,
            owner: Owner::External,
            closed: false,
        }
    }

    pub fn ownership(&self) -> Ownership {
        match self.owner {
            Owner::User(_) => Ownership::UserOwned,
            Owner::External => Ownership::ExternallyOwned,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    ///The raw value, even if the handle was already closed.
    pub fn raw(&self) -> u64 {
        self.raw
    }

    ///Converts the raw value into an ash handle type. Only use this if `H` matches [Self::kind].
    pub fn typed<H: vk::Handle>(&self) -> H {
        H::from_raw(self.raw)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    ///Fails with [HandleError::Destroyed] if the handle was already closed. Should be called before any native call
    /// that uses this handle.
    pub fn check_not_closed(&self) -> Result<(), HandleError> {
        if self.closed {
            Err(HandleError::Destroyed {
                kind: self.kind,
                raw: self.raw,
            })
        } else {
            Ok(())
        }
    }

    ///Destroys the object if it is user owned. Calling this more than once does nothing.
    ///
    /// The handle counts as closed even if the teardown fails, so a failed teardown is never repeated.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Owner::User(owner) = &self.owner {
            #[cfg(feature = "logging")]
            log::trace!("Destroying {:?} {:#x}", self.kind, self.raw);

            //Safety: creation of a user owned handle guarantees `raw` was created from owner
            //        and the closed flag guarantees this happens only once.
            if let Err(_e) = unsafe { owner.teardown(self.kind, self.raw) } {
                #[cfg(feature = "logging")]
                log::error!("Destroying {:?} {:#x} failed: {}", self.kind, self.raw, _e);
            }
        }
    }
}

impl AsRawObject for Handle {
    fn object_kind(&self) -> ObjectKind {
        self.kind
    }
    fn as_raw(&self) -> u64 {
        self.raw
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close()
    }
}

///The equality is based on the raw handle value only.
impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Handle {}

///The hash implementation is based on the raw handle value only.
impl Hash for Handle {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.raw.hash(hasher)
    }
}

impl Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("raw", &format_args!("{:#x}", self.raw))
            .field("kind", &self.kind)
            .field("ownership", &self.ownership())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RecordingTeardown;
    use ahash::AHashSet;
    use static_assertions::assert_impl_all;

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(Handle: Send, Sync);
    }

    #[test]
    fn close_is_idempotent() {
        let owner = Arc::new(RecordingTeardown::default());
        let mut handle = unsafe { Handle::owned(owner.clone(), ObjectKind::Sampler, 0x10) };

        handle.close();
        handle.close();

        assert!(handle.is_closed());
        assert_eq!(owner.calls(), vec![(ObjectKind::Sampler, 0x10)]);

        drop(handle);
        assert_eq!(owner.calls().len(), 1);
    }

    #[test]
    fn drop_destroys_user_owned() {
        let owner = Arc::new(RecordingTeardown::default());
        {
            let _handle = unsafe { Handle::owned(owner.clone(), ObjectKind::Fence, 0x42) };
        }
        assert_eq!(owner.calls(), vec![(ObjectKind::Fence, 0x42)]);
    }

    #[test]
    fn external_handles_are_never_destroyed() {
        let mut handle = Handle::external(ObjectKind::Image, 0x99);
        assert_eq!(handle.ownership(), Ownership::ExternallyOwned);
        assert!(handle.check_not_closed().is_ok());

        handle.close();
        assert!(handle.is_closed());
        handle.close();
    }

    #[test]
    fn failed_teardown_is_not_retried() {
        let owner = Arc::new(RecordingTeardown::failing());
        let mut handle = unsafe { Handle::owned(owner.clone(), ObjectKind::Buffer, 0x7) };

        handle.close();
        assert!(handle.is_closed());
        handle.close();
        drop(handle);

        assert_eq!(owner.calls().len(), 1);
    }

    #[test]
    fn closed_handles_report_destroyed() {
        let owner = Arc::new(RecordingTeardown::default());
        let mut handle = unsafe { Handle::owned(owner, ObjectKind::Event, 0x5) };
        handle.close();

        assert_eq!(
            handle.check_not_closed(),
            Err(HandleError::Destroyed {
                kind: ObjectKind::Event,
                raw: 0x5
            })
        );
    }

    #[test]
    fn equality_by_raw_value() {
        let owner = Arc::new(RecordingTeardown::default());
        let a = unsafe { Handle::owned(owner.clone(), ObjectKind::Buffer, 0xAAAA) };
        let b = Handle::external(ObjectKind::Buffer, 0xAAAA);
        let c = Handle::external(ObjectKind::Buffer, 0xBBBB);

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = AHashSet::new();
        set.insert(b);
        assert!(set.contains(&a));
        assert!(!set.contains(&c));
    }

    #[test]
    fn typed_roundtrips_raw() {
        let handle = Handle::external(ObjectKind::Buffer, 0x1234);
        let buffer: vk::Buffer = handle.typed();
        assert_eq!(vk::Handle::as_raw(buffer), 0x1234);
        assert_eq!(handle.kind().object_type(), vk::ObjectType::BUFFER);
    }
}
