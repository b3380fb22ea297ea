use std::{
    alloc::Layout,
    ffi::c_void,
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
};

use ahash::AHashMap;
use ash::vk;

use super::HostAllocator;

///[HostAllocator] that uses Rust's global allocator.
///
/// Vulkan only hands back the pointer when freeing, so the layout of every live allocation is recorded.
/// Also keeps track of the memory the driver reports as internally allocated.
#[derive(Default)]
pub struct SystemHostAllocator {
    live: Mutex<AHashMap<usize, Layout>>,
    internal_bytes: AtomicUsize,
}

impl SystemHostAllocator {
    ///Number of allocations that were not freed yet.
    pub fn live_allocations(&self) -> usize {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    ///Sum of the sizes of all live allocations.
    pub fn live_bytes(&self) -> usize {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|l| l.size())
            .sum()
    }

    ///Bytes the driver currently reports as internally allocated.
    pub fn internal_bytes(&self) -> usize {
        self.internal_bytes.load(Ordering::Relaxed)
    }

    fn layout_for(size: usize, alignment: usize) -> Option<Layout> {
        //zero sized allocations are not allowed by the global allocator
        Layout::from_size_align(size.max(1), alignment.max(1)).ok()
    }
}

impl HostAllocator for SystemHostAllocator {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        _scope: vk::SystemAllocationScope,
    ) -> Option<NonNull<c_void>> {
        let layout = Self::layout_for(size, alignment)?;
        //Safety: layout has a non-zero size
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) })?;
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ptr.as_ptr() as usize, layout);
        Some(ptr.cast())
    }

    fn free(&self, memory: NonNull<c_void>) {
        let layout = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(memory.as_ptr() as usize));

        match layout {
            //Safety: memory was allocated by us with exactly that layout
            Some(layout) => unsafe { std::alloc::dealloc(memory.as_ptr().cast(), layout) },
            None => {
                #[cfg(feature = "logging")]
                log::error!("Tried to free unknown host allocation {:p}", memory);
            }
        }
    }

    fn reallocate(
        &self,
        original: NonNull<c_void>,
        size: usize,
        alignment: usize,
        scope: vk::SystemAllocationScope,
    ) -> Option<NonNull<c_void>> {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        let old_layout = *live.get(&(original.as_ptr() as usize))?;

        //realloc keeps the old alignment, so only use it if that is still sufficient.
        if old_layout.align() >= alignment.max(1) {
            let new_layout = Self::layout_for(size, old_layout.align())?;
            //The guard is held till the map is updated. Otherwise another thread could be handed the freed
            //address and record it, before we remove the old record.
            //Safety: original was allocated with old_layout, new size is non-zero and fits the alignment.
            let ptr = NonNull::new(unsafe {
                std::alloc::realloc(original.as_ptr().cast(), old_layout, new_layout.size())
            })?;

            live.remove(&(original.as_ptr() as usize));
            live.insert(ptr.as_ptr() as usize, new_layout);
            return Some(ptr.cast());
        }
        //allocate and free lock on their own.
        drop(live);

        let new = self.allocate(size, alignment, scope)?;
        //Safety: both allocations are live and at least `min(old, new)` bytes large.
        unsafe {
            std::ptr::copy_nonoverlapping(
                original.as_ptr() as *const u8,
                new.as_ptr() as *mut u8,
                old_layout.size().min(size),
            );
        }
        self.free(original);
        Some(new)
    }

    fn on_internal_allocation(
        &self,
        size: usize,
        _kind: vk::InternalAllocationType,
        _scope: vk::SystemAllocationScope,
    ) {
        self.internal_bytes.fetch_add(size, Ordering::Relaxed);
    }

    fn on_internal_free(
        &self,
        size: usize,
        _kind: vk::InternalAllocationType,
        _scope: vk::SystemAllocationScope,
    ) {
        let _ = self
            .internal_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| {
                Some(b.saturating_sub(size))
            });
    }
}
