use ash::vk::{self, Handle as _};
use bumpalo::Bump;

use crate::{
    allocator::{Allocation, AllocationDesc, MemoryUsage, SubAllocator},
    context::Device,
    error::{AllocationError, ArgumentError, DeviceError, VkResultExt},
    handle::{Handle, ObjectKind, Ownership},
    marshal::Marshal,
    resources::SharingMode,
};
use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageType {
    Tex1d,
    Tex1dArray(u32),
    Tex2d,
    ///Array of 2d textures, u32 is number of layers
    Tex2dArray(u32),
    Tex3d,
    Cube,
    ///Array of cube maps, u32 is the number of cubes
    CubeArray(u32),
}

impl ImageType {
    ///Modifies `extent` based on `self` to be valid. For instance sets height and depth to 1 for a 1d image
    pub fn valid_extent(&self, extent: vk::Extent3D) -> vk::Extent3D {
        match self {
            ImageType::Tex1d | ImageType::Tex1dArray(_) => vk::Extent3D {
                width: extent.width,
                height: 1,
                depth: 1,
            },
            ImageType::Tex3d => extent,
            ImageType::Tex2d
            | ImageType::Tex2dArray(_)
            | ImageType::Cube
            | ImageType::CubeArray(_) => vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
        }
    }

    ///Returns the correct number of layers for this image type
    pub fn layer_count(&self) -> u32 {
        match self {
            ImageType::Tex1d | ImageType::Tex2d | ImageType::Tex3d => 1,
            ImageType::Tex1dArray(i) | ImageType::Tex2dArray(i) => *i,
            ImageType::Cube => 6,
            ImageType::CubeArray(i) => 6 * i,
        }
    }

    pub fn is_cube(&self) -> bool {
        matches!(self, ImageType::Cube | ImageType::CubeArray(_))
    }

    ///Converts `self` to the matching [ImageViewType](vk::ImageViewType).
    pub fn view_type(&self) -> vk::ImageViewType {
        match self {
            ImageType::Tex1d => vk::ImageViewType::TYPE_1D,
            ImageType::Tex1dArray(_) => vk::ImageViewType::TYPE_1D_ARRAY,
            ImageType::Tex2d => vk::ImageViewType::TYPE_2D,
            ImageType::Tex2dArray(_) => vk::ImageViewType::TYPE_2D_ARRAY,
            ImageType::Tex3d => vk::ImageViewType::TYPE_3D,
            ImageType::Cube => vk::ImageViewType::CUBE,
            ImageType::CubeArray(_) => vk::ImageViewType::CUBE_ARRAY,
        }
    }
}

impl From<ImageType> for vk::ImageType {
    fn from(ty: ImageType) -> vk::ImageType {
        match ty {
            ImageType::Tex1d | ImageType::Tex1dArray(_) => vk::ImageType::TYPE_1D,
            ImageType::Tex3d => vk::ImageType::TYPE_3D,
            ImageType::Tex2d
            | ImageType::Tex2dArray(_)
            | ImageType::Cube
            | ImageType::CubeArray(_) => vk::ImageType::TYPE_2D,
        }
    }
}

///Describes all static parameters of an image view. The easiest way is to create the view description via
/// [Image::view_all]. This fills in all parameters with default value. Those can then be changed base don the needed
/// usage. Usually only the subresource range is changed.
#[derive(Clone, Copy, Debug)]
pub struct ImgViewDesc {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub component_mapping: vk::ComponentMapping,
    pub range: vk::ImageSubresourceRange,
}

impl ImgViewDesc {
    ///Overwrites all fields (that apply) of `info` with the data in `self`
    pub fn set_on<'a>(&self, info: vk::ImageViewCreateInfo<'a>) -> vk::ImageViewCreateInfo<'a> {
        info.components(self.component_mapping)
            .view_type(self.view_type)
            .format(self.format)
            .subresource_range(self.range)
    }

    pub fn with_aspect(mut self, aspect_flag: vk::ImageAspectFlags) -> Self {
        self.range.aspect_mask |= aspect_flag;
        self
    }
}

///[vk::ImageView] wrapper that saves its description data, source image and destroys itself when not in use anymore.
pub struct ImageView {
    pub desc: ImgViewDesc,
    pub handle: Handle,
    pub src_img: Arc<Image>,
}

impl ImageView {
    pub fn inner(&self) -> vk::ImageView {
        self.handle.typed()
    }
}

///Image description. Collects all meta data related to an [Image](Image).
///
/// This is basically a [ImageCreateInfo](vk::ImageCreateInfo) where creation-time specifics like the `push_next` chain
/// are removed. Therefore, follow the linked vulkan specification if you want to create an image that is not
/// "standard".
///
/// In most cases the provided helper function should cover 99% of the use cases.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImgDesc {
    pub img_type: ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub sharing_mode: SharingMode,
    pub flags: vk::ImageCreateFlags,
}

impl Default for ImgDesc {
    ///Creates a convervative image desciption for a 2d 8bit 4-channel image without mipmapping or multisampling.
    /// with an extend of 512x512
    fn default() -> Self {
        ImgDesc {
            img_type: ImageType::Tex2d,
            format: vk::Format::R8G8B8A8_UINT,
            extent: vk::Extent3D {
                width: 512,
                height: 512,
                depth: 1,
            },
            mip_levels: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            sharing_mode: SharingMode::Exclusive,
            flags: vk::ImageCreateFlags::empty(),
        }
    }
}

impl Marshal for ImgDesc {
    type Native<'a> = &'a vk::ImageCreateInfo<'a>;

    fn validate(&self) -> Result<(), ArgumentError> {
        let extent = self.img_type.valid_extent(self.extent);
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 {
            return Err(ArgumentError::invalid(
                "extent",
                format!("{:?} has a zero sized dimension", extent),
            ));
        }
        if self.mip_levels == 0 {
            return Err(ArgumentError::invalid("mip_levels", "must be at least 1"));
        }
        if self.img_type.layer_count() == 0 {
            return Err(ArgumentError::invalid("img_type", "array without layers"));
        }
        if self.img_type.is_cube() && extent.width != extent.height {
            return Err(ArgumentError::invalid(
                "extent",
                "cube maps need square faces",
            ));
        }
        if self.usage.is_empty() {
            return Err(ArgumentError::invalid("usage", "no image usage set"));
        }
        self.sharing_mode.validate()
    }

    fn marshal<'a>(&'a self, arena: &'a Bump) -> Result<Self::Native<'a>, ArgumentError> {
        let (sharing_mode, queue_family_indices) = self.sharing_mode.marshal(arena);

        let mut flags = self.flags;
        if self.img_type.is_cube() {
            flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }

        //per definition the image layout is undefined when creating an image.
        let info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(self.img_type.into())
            .format(self.format)
            .extent(self.img_type.valid_extent(self.extent))
            .mip_levels(self.mip_levels)
            .array_layers(self.img_type.layer_count())
            .samples(self.samples)
            .tiling(self.tiling)
            .usage(self.usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(queue_family_indices)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        Ok(arena.alloc(info))
    }
}

impl ImgDesc {
    ///Appends the additional usage
    pub fn add_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage |= usage;
        self
    }

    ///Creates a simple 2d image description meant as color attachment. You might have to add additional usages
    ///The only standard usage is `COLOR_ATTACHMENT`.
    pub fn color_attachment_2d(width: u32, height: u32, format: vk::Format) -> Self {
        ImgDesc {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            ..Default::default()
        }
    }

    ///Creates a simple 2d image description meant as depth attachment. You might have to add additional usages
    ///The only standard usage is `DEPTH_ATTACHMENT`.
    pub fn depth_attachment_2d(width: u32, height: u32, format: vk::Format) -> Self {
        ImgDesc {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            ..Default::default()
        }
    }

    ///Creates a simple storage image that has the storage bit set as well as transfere bits.
    pub fn storage_image_2d(width: u32, height: u32, format: vk::Format) -> Self {
        ImgDesc {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            usage: vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            ..Default::default()
        }
    }

    ///Creates a simple texture image that has the sampeld bit set as well as transfere bits.
    pub fn texture_2d(width: u32, height: u32, format: vk::Format) -> Self {
        ImgDesc {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            ..Default::default()
        }
    }

    ///Sampled cube map with `size`x`size` faces.
    pub fn cube_map(size: u32, format: vk::Format) -> Self {
        ImgDesc {
            img_type: ImageType::Cube,
            ..Self::texture_2d(size, size, format)
        }
    }
}

enum Backing {
    Allocated(Allocation),
    ///Image owned by someone else, for instance a swapchain.
    External(Handle),
}

///Self managing image. Allocated images free their image and memory together when dropped.
//Note Freeing happens in `Allocation`'s implementation.
pub struct Image {
    ///vulkan image handle
    pub inner: vk::Image,
    pub desc: ImgDesc,
    pub usage: MemoryUsage,
    backing: Backing,
}

///The hash implementation is based on [Image](vk::Image)'s hash.
impl Hash for Image {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.inner.hash(hasher)
    }
}

impl Image {
    ///Creates the image based on the description, with memory placed according to `policy`.
    ///
    /// Note that the image is just created with an initial "Undefined" layout.
    pub fn new(
        allocator: &Arc<SubAllocator>,
        description: ImgDesc,
        policy: &AllocationDesc,
    ) -> Result<Self, AllocationError> {
        let (allocation, inner) = allocator.create_image(policy, &description)?;

        Ok(Image {
            inner,
            desc: description,
            usage: policy.usage,
            backing: Backing::Allocated(allocation),
        })
    }

    ///Wraps an image that is owned by some other object, for instance a swapchain. The image is never destroyed
    /// through `self`.
    pub fn from_external(inner: vk::Image, description: ImgDesc) -> Self {
        Image {
            inner,
            desc: description,
            usage: MemoryUsage::Unknown,
            backing: Backing::External(Handle::external(ObjectKind::Image, inner.as_raw())),
        }
    }

    pub fn ownership(&self) -> Ownership {
        match &self.backing {
            Backing::Allocated(_) => Ownership::UserOwned,
            Backing::External(handle) => handle.ownership(),
        }
    }

    ///The image's allocation, if it was allocated by us.
    pub fn allocation(&self) -> Option<&Allocation> {
        match &self.backing {
            Backing::Allocated(allocation) => Some(allocation),
            Backing::External(_) => None,
        }
    }

    pub fn extent_3d(&self) -> vk::Extent3D {
        self.desc.img_type.valid_extent(self.desc.extent)
    }

    ///In case of 3d image formats the depth is ignored.
    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.desc.extent.width,
            height: self.desc.extent.height,
        }
    }

    ///Returns a sub resource range that encloses the whole image.
    pub fn subresource_all(&self) -> vk::ImageSubresourceRange {
        let aspect_mask = if self
            .desc
            .usage
            .contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        {
            //use depth only aspect flag for depth only format, otherwise use both flags
            match self.desc.format {
                vk::Format::D16_UNORM
                | vk::Format::D32_SFLOAT
                | vk::Format::X8_D24_UNORM_PACK32 => vk::ImageAspectFlags::DEPTH,
                _ => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            }
        } else {
            vk::ImageAspectFlags::COLOR
        };

        vk::ImageSubresourceRange {
            aspect_mask,
            base_array_layer: 0,
            base_mip_level: 0,
            layer_count: self.desc.img_type.layer_count(),
            level_count: self.desc.mip_levels,
        }
    }

    ///Creates a subresource layer for the first mip level. It is choosen based on `Self::subresource_all`'s base_mip_level.
    pub fn subresource_layers_all(&self) -> vk::ImageSubresourceLayers {
        let vk::ImageSubresourceRange {
            aspect_mask,
            base_array_layer,
            layer_count,
            base_mip_level,
            ..
        } = self.subresource_all();
        vk::ImageSubresourceLayers {
            aspect_mask,
            base_array_layer,
            layer_count,
            mip_level: base_mip_level,
        }
    }

    ///Creates an [ImgViewDesc](ImgViewDesc) that encloses the whole image.
    pub fn view_all(&self) -> ImgViewDesc {
        ImgViewDesc {
            component_mapping: vk::ComponentMapping {
                r: vk::ComponentSwizzle::R,
                g: vk::ComponentSwizzle::G,
                b: vk::ComponentSwizzle::B,
                a: vk::ComponentSwizzle::A,
            },
            format: self.desc.format,
            range: self.subresource_all(),
            view_type: self.desc.img_type.view_type(),
        }
    }
}

///If implemented, creates a self managing image view that keeps its source image and device alive long enough
/// to destroy the inner view when dropped.
pub trait SafeImageView {
    fn view(&self, device: &Arc<Device>, desc: ImgViewDesc) -> Result<ImageView, DeviceError>;
}

impl SafeImageView for Arc<Image> {
    ///Creates an image view for this image based on the based `desc`.
    fn view(&self, device: &Arc<Device>, desc: ImgViewDesc) -> Result<ImageView, DeviceError> {
        if let Some(allocation) = self.allocation() {
            allocation.check_not_closed()?;
        }

        let info = desc.set_on(vk::ImageViewCreateInfo::default().image(self.inner));
        let callbacks = device.allocator_proxy.callback_block()?;
        let view = unsafe { device.inner.create_image_view(&info, callbacks) }
            .during("vkCreateImageView")?;

        Ok(ImageView {
            desc,
            //Safety: just created from device
            handle: unsafe { device.wrap_owned(ObjectKind::ImageView, view.as_raw()) },
            src_img: self.clone(),
        })
    }
}

pub struct Sampler {
    pub handle: Handle,
}

impl Sampler {
    pub fn new(
        device: &Arc<Device>,
        create_info: &vk::SamplerCreateInfo<'_>,
    ) -> Result<Self, DeviceError> {
        let callbacks = device.allocator_proxy.callback_block()?;
        let sampler = unsafe { device.inner.create_sampler(create_info, callbacks) }
            .during("vkCreateSampler")?;

        Ok(Sampler {
            //Safety: just created from device
            handle: unsafe { device.wrap_owned(ObjectKind::Sampler, sampler.as_raw()) },
        })
    }

    pub fn inner(&self) -> vk::Sampler {
        self.handle.typed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{BackendCall, MockAllocator};
    use static_assertions::assert_impl_all;

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(Image: Send, Sync);
        assert_impl_all!(ImageView: Send, Sync);
        assert_impl_all!(Sampler: Send, Sync);
    }

    #[test]
    fn cube_maps_are_marshalled_as_layered_2d() {
        let desc = ImgDesc::cube_map(64, vk::Format::R16G16B16A16_SFLOAT);
        desc.validate().unwrap();

        let arena = Bump::new();
        let info = desc.marshal(&arena).unwrap();
        assert_eq!(info.image_type, vk::ImageType::TYPE_2D);
        assert_eq!(info.array_layers, 6);
        assert!(info.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE));
        assert_eq!(info.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(info.extent.depth, 1);
    }

    #[test]
    fn invalid_descriptions() {
        assert!(ImgDesc::texture_2d(0, 4, vk::Format::R8_UNORM).validate().is_err());
        assert!(ImgDesc {
            mip_levels: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(ImgDesc {
            img_type: ImageType::Tex2dArray(0),
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(ImgDesc {
            img_type: ImageType::Cube,
            ..ImgDesc::texture_2d(64, 32, vk::Format::R8_UNORM)
        }
        .validate()
        .is_err());
        //1d images ignore their height
        assert!(ImgDesc {
            img_type: ImageType::Tex1d,
            ..ImgDesc::texture_2d(64, 0, vk::Format::R8_UNORM)
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn subresource_aspects() {
        let depth = Image::from_external(
            vk::Image::from_raw(1),
            ImgDesc::depth_attachment_2d(8, 8, vk::Format::D32_SFLOAT),
        );
        assert_eq!(depth.subresource_all().aspect_mask, vk::ImageAspectFlags::DEPTH);

        let depth_stencil = Image::from_external(
            vk::Image::from_raw(2),
            ImgDesc::depth_attachment_2d(8, 8, vk::Format::D24_UNORM_S8_UINT),
        );
        assert_eq!(
            depth_stencil.subresource_all().aspect_mask,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );

        let cube = Image::from_external(
            vk::Image::from_raw(3),
            ImgDesc::cube_map(16, vk::Format::R8G8B8A8_UNORM),
        );
        let range = cube.subresource_all();
        assert_eq!(range.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!(range.layer_count, 6);
        assert_eq!(cube.view_all().view_type, vk::ImageViewType::CUBE);
    }

    #[test]
    fn allocated_image_is_freed_on_drop() {
        let backend = Arc::new(MockAllocator::default());
        let sub = Arc::new(SubAllocator::new(backend.clone()));

        let image = Image::new(
            &sub,
            ImgDesc::storage_image_2d(32, 32, vk::Format::R32_SFLOAT),
            &AllocationDesc::gpu_only(),
        )
        .unwrap();
        assert_eq!(image.ownership(), Ownership::UserOwned);
        let token = image.allocation().unwrap().token();
        let inner = image.inner;

        drop(image);
        assert_eq!(backend.destroys(), vec![BackendCall::DestroyImage(inner, token)]);
    }

    #[test]
    fn external_images_are_not_freed() {
        let image = Image::from_external(vk::Image::from_raw(0x5), ImgDesc::default());
        assert_eq!(image.ownership(), Ownership::ExternallyOwned);
        assert!(image.allocation().is_none());
        drop(image);
    }
}
