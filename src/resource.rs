// GPU resources: buffers, textures and samplers
//
// Usage flags are fixed at creation. The usage *state* is mutable and is
// updated by recorded transitions; the abstraction trusts the caller's
// asserted old state and records the new one for downstream queries.
// Host-visible resources keep one persistent mapping for their lifetime.

use anyhow::{bail, Context, Result};
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::backend::{BufferKey, SamplerKey, TextureKey};
use crate::device::Device;
use crate::format::Format;
use crate::types::{
    align_up, AddressMode, BufferUsage, ClearValue, Filter, IndexType, MemoryLocation, ResourceState,
    TextureType, TextureUsage,
};
use crate::validation::ResourceId;

#[derive(Debug, Clone, PartialEq)]
pub struct BufferDesc {
    pub usage: BufferUsage,
    pub size: u64,
    pub location: MemoryLocation,
    /// Element format of texel buffers
    pub format: Format,
    /// Structured buffer view: first element, element count and stride
    pub first_element: u64,
    pub element_count: u64,
    pub struct_stride: u32,
    /// View as a raw (byte address) buffer instead of a structured one
    pub raw: bool,
}

impl BufferDesc {
    pub fn new(usage: BufferUsage, size: u64, location: MemoryLocation) -> Self {
        Self {
            usage,
            size,
            location,
            format: Format::Undefined,
            first_element: 0,
            element_count: 0,
            struct_stride: 0,
            raw: false,
        }
    }
}

pub struct Buffer {
    device: Arc<Device>,
    key: BufferKey,
    desc: BufferDesc,
    state: Cell<ResourceState>,
    mapped: Option<NonNull<u8>>,
    index_type: IndexType,
    vertex_stride: u32,
    counter: Option<Box<Buffer>>,
}

impl Buffer {
    pub fn new(device: &Arc<Device>, mut desc: BufferDesc) -> Result<Self> {
        if desc.size == 0 {
            bail!("Buffer size must be non-zero");
        }
        if desc.usage.contains(BufferUsage::UNIFORM_CBV) {
            desc.size = align_up(desc.size, device.limits().uniform_buffer_alignment);
        }

        let allocation = device
            .backend()
            .create_buffer(&desc)
            .with_context(|| format!("Failed to create {} byte buffer ({:?})", desc.size, desc.usage))?;

        if desc.location.is_host_visible() && allocation.mapped.is_none() {
            device.backend().destroy_buffer(allocation.key);
            bail!("Host-visible buffer was not mapped by the backend");
        }

        device.track_resource(ResourceId::Buffer(allocation.key), ResourceState::Undefined);
        log::debug!("Created buffer {:?}: {} bytes, {:?}", allocation.key, desc.size, desc.usage);

        Ok(Self {
            device: device.clone(),
            key: allocation.key,
            desc,
            state: Cell::new(ResourceState::Undefined),
            mapped: allocation.mapped,
            index_type: IndexType::Uint16,
            vertex_stride: 0,
            counter: None,
        })
    }

    pub(crate) fn with_index_type(mut self, index_type: IndexType) -> Self {
        self.index_type = index_type;
        self
    }

    pub(crate) fn with_vertex_stride(mut self, stride: u32) -> Self {
        self.vertex_stride = stride;
        self
    }

    pub(crate) fn with_counter(mut self, counter: Buffer) -> Self {
        self.counter = Some(Box::new(counter));
        self
    }

    pub fn key(&self) -> BufferKey {
        self.key
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::Buffer(self.key)
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn usage(&self) -> BufferUsage {
        self.desc.usage
    }

    /// Allocated size, after any backend alignment
    pub fn size(&self) -> u64 {
        self.desc.size
    }

    pub fn location(&self) -> MemoryLocation {
        self.desc.location
    }

    pub fn is_host_visible(&self) -> bool {
        self.desc.location.is_host_visible()
    }

    /// State as of the last recorded transition
    pub fn state(&self) -> ResourceState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: ResourceState) {
        self.state.set(state);
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    pub fn vertex_stride(&self) -> u32 {
        self.vertex_stride
    }

    pub fn counter_buffer(&self) -> Option<&Buffer> {
        self.counter.as_deref()
    }

    /// Persistent CPU mapping; `None` for device-local buffers
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.mapped.map(NonNull::as_ptr)
    }

    /// Copy `data` into the mapping at `offset`
    pub fn write<T: bytemuck::Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let ptr = self.mapped_range(offset, bytes.len() as u64)?;
        // SAFETY: the range was bounds-checked against the mapping, which stays
        // valid for the buffer's lifetime.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        Ok(())
    }

    /// Copy `len` bytes out of the mapping at `offset`
    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let ptr = self.mapped_range(offset, len)?;
        let mut out = vec![0u8; len as usize];
        // SAFETY: bounds-checked as in `write`.
        unsafe { std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), out.len()) };
        Ok(out)
    }

    fn mapped_range(&self, offset: u64, len: u64) -> Result<*mut u8> {
        let ptr = self.mapped.context("Buffer is not host visible")?;
        if offset.checked_add(len).map_or(true, |end| end > self.desc.size) {
            bail!(
                "Mapped access [{}, {}) out of bounds for {} byte buffer",
                offset,
                offset.saturating_add(len),
                self.desc.size
            );
        }
        // SAFETY: offset is within the mapping.
        Ok(unsafe { ptr.as_ptr().add(offset as usize) })
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.device.forget_resource(self.id());
        self.device.backend().destroy_buffer(self.key);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("key", &self.key)
            .field("desc", &self.desc)
            .field("state", &self.state.get())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub texture_type: TextureType,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: Format,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub usage: TextureUsage,
    pub clear_value: ClearValue,
    /// Linear, persistently mapped storage
    pub host_visible: bool,
}

impl TextureDesc {
    pub fn new_2d(width: u32, height: u32, format: Format, usage: TextureUsage) -> Self {
        Self {
            texture_type: TextureType::Tex2D,
            width,
            height,
            depth: 1,
            format,
            mip_levels: 1,
            sample_count: 1,
            usage,
            clear_value: if format.is_depth_stencil() {
                ClearValue::DEPTH_ONE
            } else {
                ClearValue::BLACK
            },
            host_visible: false,
        }
    }

    /// Extent of one mip level, never below 1
    pub fn mip_extent(&self, level: u32) -> (u32, u32, u32) {
        (
            (self.width >> level).max(1),
            (self.height >> level).max(1),
            (self.depth >> level).max(1),
        )
    }

    /// Tightly packed size of one mip level in bytes
    pub fn mip_size(&self, level: u32) -> u64 {
        let (w, h, d) = self.mip_extent(level);
        w as u64 * h as u64 * d as u64 * self.format.stride() as u64
    }

    /// Byte offset of a mip level when all levels are packed back to back
    pub fn mip_offset(&self, level: u32) -> u64 {
        (0..level).map(|l| self.mip_size(l)).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.mip_offset(self.mip_levels)
    }
}

pub struct Texture {
    device: Arc<Device>,
    key: TextureKey,
    desc: TextureDesc,
    state: Cell<ResourceState>,
    mapped: Option<NonNull<u8>>,
    /// Swapchain images belong to the backend
    owned: bool,
}

impl Texture {
    pub fn new(device: &Arc<Device>, desc: TextureDesc) -> Result<Self> {
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
            bail!("Texture dimensions must be non-zero");
        }
        if desc.format == Format::Undefined {
            bail!("Texture format must not be undefined");
        }
        if desc.mip_levels == 0 || !desc.sample_count.is_power_of_two() {
            bail!(
                "Invalid texture mip count {} / sample count {}",
                desc.mip_levels,
                desc.sample_count
            );
        }

        let allocation = device.backend().create_texture(&desc).with_context(|| {
            format!(
                "Failed to create {}x{}x{} {} texture",
                desc.width, desc.height, desc.depth, desc.format
            )
        })?;

        device.track_resource(ResourceId::Texture(allocation.key), ResourceState::Undefined);
        log::debug!(
            "Created texture {:?}: {}x{} {} ({:?})",
            allocation.key,
            desc.width,
            desc.height,
            desc.format,
            desc.usage
        );

        Ok(Self {
            device: device.clone(),
            key: allocation.key,
            desc,
            state: Cell::new(ResourceState::Undefined),
            mapped: allocation.mapped,
            owned: true,
        })
    }

    /// Wrap an image the backend created for its swapchain
    pub(crate) fn external(device: &Arc<Device>, key: TextureKey, desc: TextureDesc, state: ResourceState) -> Self {
        device.track_resource(ResourceId::Texture(key), state);
        Self {
            device: device.clone(),
            key,
            desc,
            state: Cell::new(state),
            mapped: None,
            owned: false,
        }
    }

    pub fn key(&self) -> TextureKey {
        self.key
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::Texture(self.key)
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn usage(&self) -> TextureUsage {
        self.desc.usage
    }

    pub fn format(&self) -> Format {
        self.desc.format
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn sample_count(&self) -> u32 {
        self.desc.sample_count
    }

    pub fn clear_value(&self) -> ClearValue {
        self.desc.clear_value
    }

    pub fn state(&self) -> ResourceState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: ResourceState) {
        self.state.set(state);
    }

    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.mapped.map(NonNull::as_ptr)
    }

    pub fn is_swapchain_image(&self) -> bool {
        !self.owned
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.device.forget_resource(self.id());
        if self.owned {
            self.device.backend().destroy_texture(self.key);
        }
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("key", &self.key)
            .field("desc", &self.desc)
            .field("state", &self.state.get())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mipmap_mode: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub mip_lod_bias: f32,
    /// 0 disables anisotropic filtering
    pub max_anisotropy: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            mipmap_mode: Filter::Linear,
            address_u: AddressMode::Repeat,
            address_v: AddressMode::Repeat,
            address_w: AddressMode::Repeat,
            mip_lod_bias: 0.0,
            max_anisotropy: 0.0,
        }
    }
}

pub struct Sampler {
    device: Arc<Device>,
    key: SamplerKey,
    desc: SamplerDesc,
}

impl Sampler {
    pub fn new(device: &Arc<Device>, desc: SamplerDesc) -> Result<Self> {
        let key = device
            .backend()
            .create_sampler(&desc)
            .context("Failed to create sampler")?;
        Ok(Self {
            device: device.clone(),
            key,
            desc,
        })
    }

    pub fn key(&self) -> SamplerKey {
        self.key
    }

    pub fn desc(&self) -> &SamplerDesc {
        &self.desc
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.device.backend().destroy_sampler(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_chain_layout() {
        let desc = TextureDesc {
            mip_levels: 3,
            ..TextureDesc::new_2d(8, 4, Format::R8G8B8A8Unorm, TextureUsage::SAMPLED_IMAGE)
        };
        assert_eq!(desc.mip_extent(0), (8, 4, 1));
        assert_eq!(desc.mip_extent(2), (2, 1, 1));
        assert_eq!(desc.mip_size(0), 128);
        assert_eq!(desc.mip_offset(1), 128);
        assert_eq!(desc.total_size(), 128 + 32 + 8);
    }

    #[test]
    fn depth_textures_default_to_depth_clear() {
        let desc = TextureDesc::new_2d(4, 4, Format::D32Float, TextureUsage::DEPTH_STENCIL_ATTACHMENT);
        assert_eq!(desc.clear_value, ClearValue::DEPTH_ONE);
    }
}
