// Descriptor sets
//
// Two phases: the binding list is declared once at creation and is what
// pipelines build their native layout from (Vulkan descriptor-set layout,
// D3D12 root signature); updates then write concrete resources into the
// declared slots and may be repeated. Sets still referenced by in-flight
// work must not be updated; callers keep one set per frame in flight.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backend::{BoundResources, DescriptorSetKey, DescriptorWrite};
use crate::device::Device;
use crate::resource::{Buffer, Sampler, Texture};
use crate::types::{Access, BufferUsage, ShaderStages, TextureUsage};
use crate::validation::{ResourceId, Violation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    Sampler,
    UniformBufferCbv,
    StorageBufferSrv,
    StorageBufferUav,
    UniformTexelBufferSrv,
    StorageTexelBufferUav,
    TextureSrv,
    TextureUav,
}

/// What kind of object a descriptor type accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer,
    Texture,
    Sampler,
}

impl DescriptorType {
    pub fn resource_kind(self) -> ResourceKind {
        match self {
            DescriptorType::Sampler => ResourceKind::Sampler,
            DescriptorType::TextureSrv | DescriptorType::TextureUav => ResourceKind::Texture,
            _ => ResourceKind::Buffer,
        }
    }

    /// Access the bound resource sees when a draw or dispatch reads the slot
    pub fn access(self) -> Option<Access> {
        match self {
            DescriptorType::Sampler => None,
            DescriptorType::UniformBufferCbv => Some(Access::UniformRead),
            DescriptorType::StorageBufferSrv | DescriptorType::UniformTexelBufferSrv => Some(Access::ShaderRead),
            DescriptorType::StorageBufferUav | DescriptorType::StorageTexelBufferUav => Some(Access::ShaderWrite),
            DescriptorType::TextureSrv => Some(Access::SampledRead),
            DescriptorType::TextureUav => Some(Access::StorageImage),
        }
    }

    pub fn required_buffer_usage(self) -> BufferUsage {
        match self {
            DescriptorType::UniformBufferCbv => BufferUsage::UNIFORM_CBV,
            DescriptorType::StorageBufferSrv => BufferUsage::STORAGE_SRV,
            DescriptorType::StorageBufferUav => BufferUsage::STORAGE_UAV,
            DescriptorType::UniformTexelBufferSrv => BufferUsage::UNIFORM_TEXEL_SRV,
            DescriptorType::StorageTexelBufferUav => BufferUsage::STORAGE_TEXEL_UAV,
            _ => BufferUsage::empty(),
        }
    }

    pub fn required_texture_usage(self) -> TextureUsage {
        match self {
            DescriptorType::TextureSrv => TextureUsage::SAMPLED_IMAGE,
            DescriptorType::TextureUav => TextureUsage::STORAGE_IMAGE,
            _ => TextureUsage::empty(),
        }
    }
}

/// One declared slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub ty: DescriptorType,
    pub binding: u32,
    pub count: u32,
    pub stages: ShaderStages,
}

impl DescriptorBinding {
    pub fn new(ty: DescriptorType, binding: u32, stages: ShaderStages) -> Self {
        Self {
            ty,
            binding,
            count: 1,
            stages,
        }
    }
}

/// Resources to write into one slot; the slice length must equal the slot's count
#[derive(Clone, Copy)]
pub enum DescriptorResources<'a> {
    Buffers(&'a [&'a Buffer]),
    Textures(&'a [&'a Texture]),
    Samplers(&'a [&'a Sampler]),
}

impl DescriptorResources<'_> {
    fn kind(&self) -> ResourceKind {
        match self {
            DescriptorResources::Buffers(_) => ResourceKind::Buffer,
            DescriptorResources::Textures(_) => ResourceKind::Texture,
            DescriptorResources::Samplers(_) => ResourceKind::Sampler,
        }
    }

    fn len(&self) -> usize {
        match self {
            DescriptorResources::Buffers(b) => b.len(),
            DescriptorResources::Textures(t) => t.len(),
            DescriptorResources::Samplers(s) => s.len(),
        }
    }
}

#[derive(Clone, Copy)]
pub struct DescriptorUpdate<'a> {
    pub binding: u32,
    pub resources: DescriptorResources<'a>,
}

impl<'a> DescriptorUpdate<'a> {
    pub fn buffers(binding: u32, buffers: &'a [&'a Buffer]) -> Self {
        Self {
            binding,
            resources: DescriptorResources::Buffers(buffers),
        }
    }

    pub fn textures(binding: u32, textures: &'a [&'a Texture]) -> Self {
        Self {
            binding,
            resources: DescriptorResources::Textures(textures),
        }
    }

    pub fn samplers(binding: u32, samplers: &'a [&'a Sampler]) -> Self {
        Self {
            binding,
            resources: DescriptorResources::Samplers(samplers),
        }
    }
}

pub struct DescriptorSet {
    device: Arc<Device>,
    key: DescriptorSetKey,
    bindings: Vec<DescriptorBinding>,
    /// Per written slot, the resources and the access a draw makes through it
    written: BTreeMap<u32, Vec<(ResourceId, Access)>>,
}

impl DescriptorSet {
    pub fn new(device: &Arc<Device>, bindings: &[DescriptorBinding]) -> Result<Self> {
        for (i, binding) in bindings.iter().enumerate() {
            if binding.count == 0 {
                bail!("Descriptor binding {} has a count of 0", binding.binding);
            }
            if binding.stages.is_empty() {
                bail!("Descriptor binding {} has an empty stage mask", binding.binding);
            }
            if bindings[..i].iter().any(|b| b.binding == binding.binding) {
                bail!("Descriptor binding {} declared twice", binding.binding);
            }
        }

        let key = device
            .backend()
            .create_descriptor_set(bindings)
            .context("Failed to create descriptor set")?;

        log::debug!("Created descriptor set {:?} with {} bindings", key, bindings.len());

        Ok(Self {
            device: device.clone(),
            key,
            bindings: bindings.to_vec(),
            written: BTreeMap::new(),
        })
    }

    pub fn key(&self) -> DescriptorSetKey {
        self.key
    }

    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }

    pub fn binding(&self, slot: u32) -> Option<&DescriptorBinding> {
        self.bindings.iter().find(|b| b.binding == slot)
    }

    pub fn is_written(&self, slot: u32) -> bool {
        self.written.contains_key(&slot)
    }

    /// Declared slots no update has written yet
    pub fn unwritten_bindings(&self) -> Vec<u32> {
        self.bindings
            .iter()
            .map(|b| b.binding)
            .filter(|slot| !self.written.contains_key(slot))
            .collect()
    }

    /// Resources a draw or dispatch reaches through this set
    pub(crate) fn resource_uses(&self) -> impl Iterator<Item = (ResourceId, Access)> + '_ {
        self.written.values().flatten().copied()
    }

    /// Write concrete resources into declared slots
    pub fn update(&mut self, updates: &[DescriptorUpdate<'_>]) -> Result<()> {
        let mut writes = Vec::with_capacity(updates.len());
        let mut uses = Vec::with_capacity(updates.len());

        for update in updates {
            let binding = *self
                .binding(update.binding)
                .with_context(|| format!("Descriptor binding {} was never declared", update.binding))?;
            check_compatible(&binding, &update.resources)?;

            let access = binding.ty.access();
            let (resources, ids): (BoundResources, Vec<ResourceId>) = match update.resources {
                DescriptorResources::Buffers(buffers) => (
                    BoundResources::Buffers(buffers.iter().map(|b| b.key()).collect()),
                    buffers.iter().map(|b| b.id()).collect(),
                ),
                DescriptorResources::Textures(textures) => (
                    BoundResources::Textures(textures.iter().map(|t| t.key()).collect()),
                    textures.iter().map(|t| t.id()).collect(),
                ),
                DescriptorResources::Samplers(samplers) => {
                    (BoundResources::Samplers(samplers.iter().map(|s| s.key()).collect()), Vec::new())
                }
            };

            writes.push(DescriptorWrite {
                binding: binding.binding,
                ty: binding.ty,
                resources,
            });
            uses.push((
                binding.binding,
                access.map_or_else(Vec::new, |a| ids.into_iter().map(|id| (id, a)).collect()),
            ));
        }

        self.device
            .backend()
            .update_descriptor_set(self.key, &writes)
            .context("Failed to update descriptor set")?;

        self.written.extend(uses);
        Ok(())
    }

    /// Report every declared slot that was never written
    pub(crate) fn check_complete(&self) -> bool {
        let missing = self.unwritten_bindings();
        for binding in &missing {
            self.device.report(Violation::IncompleteDescriptorSet {
                set: self.key,
                binding: *binding,
            });
        }
        missing.is_empty()
    }

    /// Report every binding of a pipeline layout this set does not declare
    /// with the same type, count and stages
    pub(crate) fn check_layout(&self, layout: &[DescriptorBinding]) -> bool {
        let mut matches = true;
        for expected in layout {
            let found = self.binding(expected.binding).copied();
            if found != Some(*expected) {
                matches = false;
                self.device.report(Violation::DescriptorLayoutMismatch {
                    set: self.key,
                    expected: *expected,
                    found,
                });
            }
        }
        matches
    }
}

fn check_compatible(binding: &DescriptorBinding, resources: &DescriptorResources<'_>) -> Result<()> {
    if resources.kind() != binding.ty.resource_kind() {
        bail!(
            "Binding {} is {:?} but was given {:?} resources",
            binding.binding,
            binding.ty,
            resources.kind()
        );
    }
    if resources.len() != binding.count as usize {
        bail!(
            "Binding {} declares {} descriptors but was given {}",
            binding.binding,
            binding.count,
            resources.len()
        );
    }
    match resources {
        DescriptorResources::Buffers(buffers) => {
            let required = binding.ty.required_buffer_usage();
            if let Some(b) = buffers.iter().find(|b| !b.usage().contains(required)) {
                bail!(
                    "Buffer {:?} lacks usage {:?} for binding {}",
                    b.key(),
                    required,
                    binding.binding
                );
            }
        }
        DescriptorResources::Textures(textures) => {
            let required = binding.ty.required_texture_usage();
            if let Some(t) = textures.iter().find(|t| !t.usage().contains(required)) {
                bail!(
                    "Texture {:?} lacks usage {:?} for binding {}",
                    t.key(),
                    required,
                    binding.binding
                );
            }
        }
        DescriptorResources::Samplers(_) => {}
    }
    Ok(())
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        self.device.backend().destroy_descriptor_set(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_types_map_to_kinds_and_accesses() {
        assert_eq!(DescriptorType::TextureSrv.resource_kind(), ResourceKind::Texture);
        assert_eq!(DescriptorType::UniformBufferCbv.resource_kind(), ResourceKind::Buffer);
        assert_eq!(DescriptorType::Sampler.access(), None);
        assert_eq!(DescriptorType::StorageBufferUav.access(), Some(Access::ShaderWrite));
        assert_eq!(
            DescriptorType::StorageBufferSrv.required_buffer_usage(),
            BufferUsage::STORAGE_SRV
        );
    }
}
