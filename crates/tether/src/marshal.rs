//! ## Marshalling
//!
//! Descriptions like [BufDesc](crate::resources::BufDesc) are plain Rust values. Before they can be handed to Vulkan they
//! have to be turned into the matching `*CreateInfo` structures, which borrow all their arrays.
//!
//! Those structures are built inside a [ScratchArena]. Each create call opens a [ScratchFrame], builds all its arguments
//! in there and drops the frame when returning. Nothing built in a frame outlives the call, only the handles created
//! from it do.

use std::sync::{Mutex, MutexGuard, PoisonError};

use bumpalo::Bump;

use crate::error::ArgumentError;

///Conversion of a description into native call arguments.
///
/// Implementations must not allocate long lived native memory, and must not destroy anything.
pub trait Marshal {
    type Native<'a>
    where
        Self: 'a;

    ///Checks the description for contract violations before anything is marshalled.
    fn validate(&self) -> Result<(), ArgumentError> {
        Ok(())
    }

    ///Builds the native representation of `self` in `arena`.
    fn marshal<'a>(&'a self, arena: &'a Bump) -> Result<Self::Native<'a>, ArgumentError>;
}

///Bump allocator used to build native call arguments.
#[derive(Default)]
pub struct ScratchArena {
    bump: Mutex<Bump>,
}

impl ScratchArena {
    pub fn new() -> Self {
        Self::default()
    }

    ///Opens a new frame. Everything allocated through the frame is released when it is dropped.
    ///
    /// Frames are exclusive, a second frame on another thread waits till the first one is dropped.
    pub fn frame(&self) -> ScratchFrame<'_> {
        ScratchFrame {
            bump: self.bump.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

///Scope of one native call's arguments. Resets the arena when dropped.
pub struct ScratchFrame<'s> {
    bump: MutexGuard<'s, Bump>,
}

impl ScratchFrame<'_> {
    pub fn arena(&self) -> &Bump {
        &self.bump
    }
}

impl Drop for ScratchFrame<'_> {
    fn drop(&mut self) {
        self.bump.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_reuse_memory() {
        let arena = ScratchArena::new();

        let first = {
            let frame = arena.frame();
            let values = frame.arena().alloc_slice_copy(&[1u32, 2, 3, 4]);
            values.as_ptr() as usize
        };

        let second = {
            let frame = arena.frame();
            let values = frame.arena().alloc_slice_copy(&[5u32, 6, 7, 8]);
            assert_eq!(values, &[5, 6, 7, 8]);
            values.as_ptr() as usize
        };

        assert_eq!(first, second);
    }

    #[test]
    fn frames_are_exclusive() {
        let arena = std::sync::Arc::new(ScratchArena::new());
        let frame = arena.frame();

        let other = {
            let arena = arena.clone();
            std::thread::spawn(move || {
                let frame = arena.frame();
                *frame.arena().alloc(7u64)
            })
        };

        frame.arena().alloc(1u64);
        drop(frame);
        assert_eq!(other.join().unwrap(), 7);
    }
}
