use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};

use ash::vk;
use bumpalo::Bump;
use thiserror::Error;

use crate::{
    allocator::{Allocation, AllocationDesc, MemoryUsage, SubAllocator},
    error::{AllocationError, ArgumentError, MemoryError},
    marshal::Marshal,
    memory::{checked_write, MappedMemory},
};

use super::SharingMode;

#[derive(Error, Debug)]
pub enum BufferMapError {
    #[error("Supplied offset bigger then buffer")]
    OffsetTooLarge,
    #[error("Mapped buffer is partially written. {written} / {size}")]
    PartialyWritten { written: usize, size: usize },
    #[error("Buffer can not be mapped")]
    NotMapable,
    #[error("Mapping failed: {0}")]
    Memory(#[from] MemoryError),
    #[error("Buffer creation failed: {0}")]
    Allocation(#[from] AllocationError),
}

///Buffer description. Everything needed to create a [vk::Buffer], except its memory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub sharing: SharingMode,
    pub flags: vk::BufferCreateFlags,
}

impl BufDesc {
    ///Buffer that can be used as copy source and destination.
    pub fn transfer(size: vk::DeviceSize) -> Self {
        BufDesc {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            ..Default::default()
        }
    }

    ///Appends the additional usage
    pub fn add_usage(mut self, usage: vk::BufferUsageFlags) -> Self {
        self.usage |= usage;
        self
    }
}

impl Marshal for BufDesc {
    type Native<'a> = &'a vk::BufferCreateInfo<'a>;

    fn validate(&self) -> Result<(), ArgumentError> {
        if self.size == 0 {
            return Err(ArgumentError::invalid("size", "buffers can't be empty"));
        }
        if self.usage.is_empty() {
            return Err(ArgumentError::invalid("usage", "no buffer usage set"));
        }
        self.sharing.validate()
    }

    fn marshal<'a>(&'a self, arena: &'a Bump) -> Result<Self::Native<'a>, ArgumentError> {
        let (sharing_mode, queue_family_indices) = self.sharing.marshal(arena);

        let mut usage = self.usage;
        if cfg!(feature = "buffer_device_address") {
            usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }

        let info = vk::BufferCreateInfo::default()
            .flags(self.flags)
            .size(self.size)
            .usage(usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(queue_family_indices);

        Ok(arena.alloc(info))
    }
}

///Self managing buffer. The buffer and its memory are freed together when it is dropped.
//Note Freeing happens in `Allocation`'s implementation.
pub struct Buffer {
    pub desc: BufDesc,
    pub inner: vk::Buffer,
    pub usage: MemoryUsage,
    pub allocator: Arc<SubAllocator>,
    pub allocation: Allocation,
}

///The hash implementation is based on [Buffer](vk::Buffer)'s hash.
impl Hash for Buffer {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.inner.hash(hasher)
    }
}

impl Buffer {
    ///Creates a buffer for `description`, with memory placed according to `policy`. Note that the actual
    /// allocation can be bigger than specified.
    pub fn new(
        allocator: &Arc<SubAllocator>,
        description: BufDesc,
        policy: &AllocationDesc,
    ) -> Result<Self, AllocationError> {
        let (allocation, inner) = allocator.create_buffer(policy, &description)?;

        Ok(Buffer {
            desc: description,
            inner,
            usage: policy.usage,
            allocator: allocator.clone(),
            allocation,
        })
    }

    ///A staging buffer is a host visible, mapable buffer. Those are usually used to either copy data (from them) to the GPU, or from the GPU back to
    /// the staging buffer to read the data.
    ///
    /// Buffers created by this function are initalized to `data` and can be used as transfer source and destination.
    pub fn new_staging_for_data<T: bytemuck::Pod>(
        allocator: &Arc<SubAllocator>,
        name: Option<&str>,
        data: &[T],
    ) -> Result<Self, BufferMapError> {
        let data: &[u8] = bytemuck::cast_slice(data);

        let mut policy = AllocationDesc::cpu_to_gpu();
        policy.name = name.map(str::to_owned);

        let mut buffer = Buffer::new(allocator, BufDesc::transfer(data.len() as u64), &policy)?;
        buffer.write(0, data)?;

        Ok(buffer)
    }

    fn check_mapable(&self) -> Result<(), BufferMapError> {
        if self.usage.is_host_visible() {
            Ok(())
        } else {
            #[cfg(feature = "logging")]
            log::error!("Tried to map buffer that has usage: {:?}", self.usage);
            Err(BufferMapError::NotMapable)
        }
    }

    ///Maps the whole buffer. Fails if the buffer is not host visible.
    pub fn map(&mut self) -> Result<MappedMemory<'_>, BufferMapError> {
        self.check_mapable()?;
        Ok(self.allocator.map_memory(&mut self.allocation)?)
    }

    ///Writes `data` to the buffer and flushes the written range.
    ///If `(offset + data.len()) > buffer.len()` only the bytes that fit are written and an error is returned.
    ///
    ///If the buffer is not mapable by the host (usually if the buffer us created with MemoryUsage::GpuOnly) nothing is
    /// written and an error is returned.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), BufferMapError> {
        self.check_mapable()?;

        let size = self.desc.size as usize;
        if offset > size {
            #[cfg(feature = "logging")]
            log::error!(
                "Supplied offset for buffer write to large. BufferSize={}, offset={}",
                size,
                offset
            );
            return Err(BufferMapError::OffsetTooLarge);
        }
        let data_in_bounds = &data[..data.len().min(size - offset)];

        let mut view = self.allocator.map_memory(&mut self.allocation)?;
        let written = checked_write(&mut view, offset, data_in_bounds)?;
        view.flush_range(offset as u64, written as u64)?;

        #[cfg(feature = "logging")]
        log::trace!(
            "wrote to mapped buffer[{:?}] of size {} with offset={}, data_size={}, write_size={}",
            self.inner,
            size,
            offset,
            data.len(),
            written
        );

        if written < data.len() {
            Err(BufferMapError::PartialyWritten {
                written,
                size: data.len(),
            })
        } else {
            Ok(())
        }
    }

    ///Copies the buffer's content starting at `offset` into `dst`. Returns the number of bytes read, which is less
    /// than `dst.len()` if the buffer ends before.
    pub fn read(&mut self, offset: usize, dst: &mut [u8]) -> Result<usize, BufferMapError> {
        self.check_mapable()?;

        let size = self.desc.size as usize;
        if offset > size {
            return Err(BufferMapError::OffsetTooLarge);
        }

        let view = self.allocator.map_memory(&mut self.allocation)?;
        let available = &view.as_bytes()[offset.min(view.size())..size.min(view.size())];
        let read = available.len().min(dst.len());
        dst[..read].copy_from_slice(&available[..read]);
        Ok(read)
    }
}
