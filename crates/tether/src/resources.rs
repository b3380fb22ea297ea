mod image;
pub use image::{ImageType, Image, ImageView, ImgDesc, ImgViewDesc, SafeImageView, Sampler};

mod buffer;
pub use buffer::{BufDesc, Buffer, BufferMapError};

use ash::vk;
use bumpalo::Bump;
use smallvec::SmallVec;

use crate::error::ArgumentError;

///How a resource is shared between queue families.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum SharingMode {
    #[default]
    Exclusive,
    Concurrent {
        ///The queue family indices of families that can access the resource concurrently.
        queue_family_indices: SmallVec<[u32; 4]>,
    },
}

impl SharingMode {
    pub(crate) fn validate(&self) -> Result<(), ArgumentError> {
        match self {
            SharingMode::Concurrent {
                queue_family_indices,
            } if queue_family_indices.len() < 2 => Err(ArgumentError::invalid(
                "sharing",
                "concurrent sharing needs at least two queue families",
            )),
            _ => Ok(()),
        }
    }

    ///Returns the native mode and the queue family indices, copied into `arena`.
    pub(crate) fn marshal<'a>(&self, arena: &'a Bump) -> (vk::SharingMode, &'a [u32]) {
        match self {
            SharingMode::Exclusive => (vk::SharingMode::EXCLUSIVE, &[]),
            SharingMode::Concurrent {
                queue_family_indices,
            } => (
                vk::SharingMode::CONCURRENT,
                arena.alloc_slice_copy(queue_family_indices),
            ),
        }
    }
}
