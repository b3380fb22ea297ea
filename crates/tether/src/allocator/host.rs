//! Host allocation callbacks.
//!
//! Vulkan lets the application replace the driver's host memory allocator through [vk::AllocationCallbacks].
//! The [AllocatorProxy] translates an implementation of [HostAllocator] into those five function pointers.
//!
//! The callbacks have to stay valid for as long as any object created with them might allocate or free memory.
//! For a device this is its whole lifetime. The proxy is therefore owned by the [Device](crate::context::Device)
//! and closed when the device is destroyed.

use std::{
    ffi::c_void,
    panic::{catch_unwind, AssertUnwindSafe},
    ptr::{self, NonNull},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use ash::vk;

use crate::error::ProxyError;

///Host memory allocator that can be installed for a device or instance.
///
/// All functions are called from within the driver, possibly from multiple threads at once.
pub trait HostAllocator: Send + Sync {
    ///Allocates `size` bytes aligned to `alignment`. Returns `None` if the allocation failed.
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        scope: vk::SystemAllocationScope,
    ) -> Option<NonNull<c_void>>;

    ///Frees memory that was returned by [Self::allocate] or [Self::reallocate].
    fn free(&self, memory: NonNull<c_void>);

    ///Resizes `original` to `size` bytes, preserving its content up to the smaller of both sizes.
    /// On failure `None` is returned and `original` stays untouched.
    fn reallocate(
        &self,
        original: NonNull<c_void>,
        size: usize,
        alignment: usize,
        scope: vk::SystemAllocationScope,
    ) -> Option<NonNull<c_void>>;

    ///The driver allocated `size` bytes of memory on its own (for instance executable memory).
    fn on_internal_allocation(
        &self,
        _size: usize,
        _kind: vk::InternalAllocationType,
        _scope: vk::SystemAllocationScope,
    ) {
    }

    ///Memory previously reported through [Self::on_internal_allocation] was freed.
    fn on_internal_free(
        &self,
        _size: usize,
        _kind: vk::InternalAllocationType,
        _scope: vk::SystemAllocationScope,
    ) {
    }
}

///The five callback slots of [vk::AllocationCallbacks].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallbackSlot {
    Allocation = 0,
    Reallocation = 1,
    Free = 2,
    InternalAllocation = 3,
    InternalFree = 4,
}

impl CallbackSlot {
    pub const ALL: [CallbackSlot; 5] = [
        CallbackSlot::Allocation,
        CallbackSlot::Reallocation,
        CallbackSlot::Free,
        CallbackSlot::InternalAllocation,
        CallbackSlot::InternalFree,
    ];
}

///Host side state of one callback slot. Keeps the target allocator alive while the driver might call it.
struct Trampoline {
    slot: CallbackSlot,
    target: Arc<dyn HostAllocator>,
}

///The table `p_user_data` points to.
struct Trampolines {
    slots: [Trampoline; 5],
}

impl Trampolines {
    fn new(target: &Arc<dyn HostAllocator>) -> Self {
        Trampolines {
            slots: CallbackSlot::ALL.map(|slot| Trampoline {
                slot,
                target: target.clone(),
            }),
        }
    }

    ///# Safety
    /// `user_data` must be the pointer installed by an [AllocatorProxy] that is not closed yet.
    unsafe fn target<'a>(user_data: *mut c_void, slot: CallbackSlot) -> &'a dyn HostAllocator {
        let table = unsafe { &*(user_data as *const Trampolines) };
        let trampoline = &table.slots[slot as usize];
        debug_assert_eq!(trampoline.slot, slot);
        trampoline.target.as_ref()
    }
}

///Runs `f`, but never lets a panic unwind into the driver.
fn guarded<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(t) => t,
        Err(_) => {
            #[cfg(feature = "logging")]
            log::error!("Host allocator panicked inside an allocation callback");
            fallback
        }
    }
}

unsafe extern "system" fn allocation_trampoline(
    user_data: *mut c_void,
    size: usize,
    alignment: usize,
    scope: vk::SystemAllocationScope,
) -> *mut c_void {
    guarded(ptr::null_mut(), || {
        let target = unsafe { Trampolines::target(user_data, CallbackSlot::Allocation) };
        target
            .allocate(size, alignment, scope)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    })
}

unsafe extern "system" fn reallocation_trampoline(
    user_data: *mut c_void,
    original: *mut c_void,
    size: usize,
    alignment: usize,
    scope: vk::SystemAllocationScope,
) -> *mut c_void {
    guarded(ptr::null_mut(), || {
        let target = unsafe { Trampolines::target(user_data, CallbackSlot::Reallocation) };
        match (NonNull::new(original), size) {
            //A null original behaves like a fresh allocation
            (None, _) => target
                .allocate(size, alignment, scope)
                .map_or(ptr::null_mut(), NonNull::as_ptr),
            //size 0 behaves like free
            (Some(original), 0) => {
                target.free(original);
                ptr::null_mut()
            }
            (Some(original), size) => target
                .reallocate(original, size, alignment, scope)
                .map_or(ptr::null_mut(), NonNull::as_ptr),
        }
    })
}

unsafe extern "system" fn free_trampoline(user_data: *mut c_void, memory: *mut c_void) {
    guarded((), || {
        if let Some(memory) = NonNull::new(memory) {
            let target = unsafe { Trampolines::target(user_data, CallbackSlot::Free) };
            target.free(memory);
        }
    })
}

unsafe extern "system" fn internal_allocation_trampoline(
    user_data: *mut c_void,
    size: usize,
    kind: vk::InternalAllocationType,
    scope: vk::SystemAllocationScope,
) {
    guarded((), || {
        let target = unsafe { Trampolines::target(user_data, CallbackSlot::InternalAllocation) };
        target.on_internal_allocation(size, kind, scope)
    })
}

unsafe extern "system" fn internal_free_trampoline(
    user_data: *mut c_void,
    size: usize,
    kind: vk::InternalAllocationType,
    scope: vk::SystemAllocationScope,
) {
    guarded((), || {
        let target = unsafe { Trampolines::target(user_data, CallbackSlot::InternalFree) };
        target.on_internal_free(size, kind, scope)
    })
}

struct Installed {
    //Boxed so `block.p_user_data` stays stable while the proxy moves.
    trampolines: Mutex<Option<Box<Trampolines>>>,
    block: vk::AllocationCallbacks<'static>,
}

///Bridges an optional [HostAllocator] into [vk::AllocationCallbacks].
///
/// A proxy without allocator (see [AllocatorProxy::null]) has no callback block, which tells Vulkan to use its
/// default allocator.
pub struct AllocatorProxy {
    installed: Option<Installed>,
    closed: AtomicBool,
}

//Safety: The only non Send/Sync part is the `p_user_data` pointer in the callback block. It points to the
//        trampoline table, which only contains `Arc<dyn HostAllocator>`s, which are Send + Sync themselves.
unsafe impl Send for AllocatorProxy {}
unsafe impl Sync for AllocatorProxy {}

impl AllocatorProxy {
    ///Creates a proxy for `allocator`. If `None` is supplied a null proxy is created.
    pub fn new(allocator: Option<Arc<dyn HostAllocator>>) -> Self {
        let installed = allocator.map(|allocator| {
            let mut trampolines = Box::new(Trampolines::new(&allocator));
            let user_data = trampolines.as_mut() as *mut Trampolines as *mut c_void;
            let block = vk::AllocationCallbacks::default()
                .user_data(user_data)
                .pfn_allocation(Some(allocation_trampoline))
                .pfn_reallocation(Some(reallocation_trampoline))
                .pfn_free(Some(free_trampoline))
                .pfn_internal_allocation(Some(internal_allocation_trampoline))
                .pfn_internal_free(Some(internal_free_trampoline));

            Installed {
                trampolines: Mutex::new(Some(trampolines)),
                block,
            }
        });

        AllocatorProxy {
            installed,
            closed: AtomicBool::new(false),
        }
    }

    ///Proxy that lets Vulkan use its own allocator.
    pub fn null() -> Self {
        Self::new(None)
    }

    pub fn has_allocator(&self) -> bool {
        self.installed.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    ///Returns the callback block that can be passed to Vulkan, or `None` if no allocator is installed.
    ///
    /// Fails if the proxy was already closed, since the callbacks would point to released trampolines.
    pub fn callback_block(&self) -> Result<Option<&vk::AllocationCallbacks<'static>>, ProxyError> {
        if self.is_closed() {
            return Err(ProxyError::Closed);
        }
        Ok(self.installed.as_ref().map(|i| &i.block))
    }

    ///Releases the trampolines. Any further call to [Self::callback_block] fails. Calling this more than once,
    /// also from different threads, releases the trampolines only once.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if let Some(installed) = &self.installed {
            let released = installed
                .trampolines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();

            #[cfg(feature = "logging")]
            log::debug!(
                "Releasing {} allocation callback trampolines",
                released.as_ref().map(|t| t.slots.len()).unwrap_or(0)
            );
            drop(released);
        }
    }
}

impl Drop for AllocatorProxy {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SystemHostAllocator;
    use crate::test_util::CountingHostAllocator;
    use static_assertions::assert_impl_all;

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(AllocatorProxy: Send, Sync);
    }

    #[test]
    fn null_proxy_has_no_block() {
        let proxy = AllocatorProxy::null();
        assert!(!proxy.has_allocator());
        assert!(proxy.callback_block().unwrap().is_none());
        proxy.close();
        proxy.close();
        assert!(matches!(proxy.callback_block(), Err(ProxyError::Closed)));
    }

    #[test]
    fn block_is_unreadable_after_close() {
        let host: Arc<dyn HostAllocator> = Arc::new(CountingHostAllocator::default());
        let proxy = AllocatorProxy::new(Some(host));
        assert!(proxy.callback_block().unwrap().is_some());

        proxy.close();
        assert!(proxy.is_closed());
        assert!(matches!(proxy.callback_block(), Err(ProxyError::Closed)));
    }

    #[test]
    fn trampolines_are_released_once() {
        let host = Arc::new(CountingHostAllocator::default());
        let proxy = AllocatorProxy::new(Some(host.clone() as Arc<dyn HostAllocator>));

        //one reference per slot, plus ours
        assert_eq!(Arc::strong_count(&host), 1 + CallbackSlot::ALL.len());

        proxy.close();
        assert_eq!(Arc::strong_count(&host), 1);
        proxy.close();
        drop(proxy);
        assert_eq!(Arc::strong_count(&host), 1);
    }

    #[test]
    fn concurrent_close_releases_once() {
        let host = Arc::new(CountingHostAllocator::default());
        let proxy = Arc::new(AllocatorProxy::new(Some(
            host.clone() as Arc<dyn HostAllocator>
        )));

        let threads = (0..4)
            .map(|_| {
                let proxy = proxy.clone();
                std::thread::spawn(move || proxy.close())
            })
            .collect::<Vec<_>>();
        for t in threads {
            t.join().unwrap();
        }

        assert!(proxy.is_closed());
        assert_eq!(Arc::strong_count(&host), 1);
    }

    #[test]
    fn callbacks_forward_to_host_allocator() {
        let host = Arc::new(CountingHostAllocator::default());
        let proxy = AllocatorProxy::new(Some(host.clone() as Arc<dyn HostAllocator>));
        let block = *proxy.callback_block().unwrap().unwrap();

        unsafe {
            let memory = (block.pfn_allocation.unwrap())(
                block.p_user_data,
                64,
                16,
                vk::SystemAllocationScope::OBJECT,
            );
            assert!(!memory.is_null());
            assert_eq!(memory as usize % 16, 0);

            let memory = (block.pfn_reallocation.unwrap())(
                block.p_user_data,
                memory,
                128,
                16,
                vk::SystemAllocationScope::OBJECT,
            );
            assert!(!memory.is_null());

            (block.pfn_internal_allocation.unwrap())(
                block.p_user_data,
                32,
                vk::InternalAllocationType::EXECUTABLE,
                vk::SystemAllocationScope::DEVICE,
            );
            (block.pfn_internal_free.unwrap())(
                block.p_user_data,
                32,
                vk::InternalAllocationType::EXECUTABLE,
                vk::SystemAllocationScope::DEVICE,
            );

            (block.pfn_free.unwrap())(block.p_user_data, memory);
            //freeing null is allowed and never reaches the host allocator
            (block.pfn_free.unwrap())(block.p_user_data, ptr::null_mut());
        }

        let counts = host.counts();
        assert_eq!(counts.allocations, 1);
        assert_eq!(counts.reallocations, 1);
        assert_eq!(counts.frees, 1);
        assert_eq!(counts.internal_allocations, 1);
        assert_eq!(counts.internal_frees, 1);
        assert_eq!(host.system().live_allocations(), 0);
    }

    #[test]
    fn reallocation_edge_cases() {
        let host = Arc::new(SystemHostAllocator::default());
        let proxy = AllocatorProxy::new(Some(host.clone() as Arc<dyn HostAllocator>));
        let block = *proxy.callback_block().unwrap().unwrap();
        let realloc = block.pfn_reallocation.unwrap();

        unsafe {
            //null original allocates
            let memory = realloc(
                block.p_user_data,
                ptr::null_mut(),
                48,
                8,
                vk::SystemAllocationScope::COMMAND,
            );
            assert!(!memory.is_null());
            assert_eq!(host.live_allocations(), 1);

            //size zero frees
            let memory = realloc(
                block.p_user_data,
                memory,
                0,
                8,
                vk::SystemAllocationScope::COMMAND,
            );
            assert!(memory.is_null());
            assert_eq!(host.live_allocations(), 0);
        }
    }
}
