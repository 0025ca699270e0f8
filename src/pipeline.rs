// Pipelines
//
// A pipeline bakes a shader program, vertex input layout, descriptor layout,
// attachment formats and fixed-function state into an immutable native
// pipeline state object. Graphics and compute pipelines are the two variants
// of `PipelineKind`.

use anyhow::{bail, Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::backend::{GraphicsPipelineDesc, PipelineKey};
use crate::descriptor::{DescriptorBinding, DescriptorSet};
use crate::device::Device;
use crate::format::Format;
use crate::render_target::{RenderPassDesc, RenderTarget};
use crate::shader::ShaderProgram;
use crate::types::{BlendMode, CullMode, FrontFace, PrimitiveTopology, TessellationDomainOrigin};

/// Input-assembler semantic, needed by D3D12 input layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexSemantic {
    Position,
    Normal,
    Color,
    Tangent,
    Texcoord(u32),
}

impl VertexSemantic {
    /// HLSL semantic name and index
    pub fn hlsl(self) -> (&'static str, u32) {
        match self {
            VertexSemantic::Position => ("POSITION", 0),
            VertexSemantic::Normal => ("NORMAL", 0),
            VertexSemantic::Color => ("COLOR", 0),
            VertexSemantic::Tangent => ("TANGENT", 0),
            VertexSemantic::Texcoord(i) => ("TEXCOORD", i),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub semantic: VertexSemantic,
    pub format: Format,
    pub binding: u32,
    pub location: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// An empty layout, for pipelines that generate vertices in the shader
    pub fn empty() -> Self {
        Self::default()
    }

    /// Tightly packed, interleaved attributes in binding 0 with sequential locations
    pub fn interleaved(attributes: &[(VertexSemantic, Format)]) -> Self {
        let mut offset = 0;
        let attributes = attributes
            .iter()
            .enumerate()
            .map(|(location, &(semantic, format))| {
                let attribute = VertexAttribute {
                    semantic,
                    format,
                    binding: 0,
                    location: location as u32,
                    offset,
                };
                offset += format.stride();
                attribute
            })
            .collect();
        Self { attributes }
    }

    /// Distinct bindings in ascending order
    pub fn bindings(&self) -> Vec<u32> {
        let mut bindings: Vec<u32> = self.attributes.iter().map(|a| a.binding).collect();
        bindings.sort_unstable();
        bindings.dedup();
        bindings
    }

    /// Stride of one binding: the end of its furthest attribute
    pub fn stride(&self, binding: u32) -> u32 {
        self.attributes
            .iter()
            .filter(|a| a.binding == binding)
            .map(|a| a.offset + a.format.stride())
            .max()
            .unwrap_or(0)
    }

    pub fn validate(&self) -> Result<()> {
        for (i, attribute) in self.attributes.iter().enumerate() {
            if !attribute.format.is_vertex_format() {
                bail!(
                    "Vertex attribute {} uses format {}, which is not a supported vertex format",
                    attribute.location,
                    attribute.format
                );
            }
            if self.attributes[..i].iter().any(|a| a.location == attribute.location) {
                bail!("Vertex attribute location {} declared twice", attribute.location);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineSettings {
    pub topology: PrimitiveTopology,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    /// Per color attachment; missing entries are opaque
    pub blend_modes: Vec<BlendMode>,
    pub depth_test: bool,
    pub depth_write: bool,
    /// Control points per patch when `topology` is `PatchList`
    pub tessellation_patch_size: u32,
    /// Vulkan only; kept and ignored on D3D12
    pub tessellation_domain_origin: TessellationDomainOrigin,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            topology: PrimitiveTopology::TriangleList,
            cull_mode: CullMode::None,
            front_face: FrontFace::CounterClockwise,
            blend_modes: Vec::new(),
            depth_test: false,
            depth_write: false,
            tessellation_patch_size: 0,
            tessellation_domain_origin: TessellationDomainOrigin::UpperLeft,
        }
    }
}

impl PipelineSettings {
    pub fn blend_mode(&self, attachment: usize) -> BlendMode {
        self.blend_modes.get(attachment).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineInfo {
    pub vertex_layout: VertexLayout,
    pub settings: PipelineSettings,
    pub render_pass: RenderPassDesc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Graphics(GraphicsPipelineInfo),
    Compute,
}

pub struct Pipeline {
    device: Arc<Device>,
    key: PipelineKey,
    kind: PipelineKind,
    descriptor_bindings: Vec<DescriptorBinding>,
    fingerprint: u64,
}

impl Pipeline {
    pub fn new_graphics(
        device: &Arc<Device>,
        shader: &ShaderProgram,
        vertex_layout: &VertexLayout,
        descriptor_set: Option<&DescriptorSet>,
        render_target: &RenderTarget,
        settings: &PipelineSettings,
    ) -> Result<Self> {
        if shader.is_compute() {
            bail!("Graphics pipeline created from a compute shader program");
        }
        vertex_layout.validate()?;

        let pass = render_target.render_pass();
        let color_count = pass.desc().color_formats.len();
        if color_count as u32 > device.limits().max_color_attachments {
            bail!("{} color attachments exceed the device limit", color_count);
        }
        if settings.blend_modes.len() > color_count {
            bail!(
                "{} blend modes given for {} color attachments",
                settings.blend_modes.len(),
                color_count
            );
        }
        let patches = settings.topology == PrimitiveTopology::PatchList;
        if patches != shader.has_tessellation() {
            bail!("Patch list topology and tessellation stages must be used together");
        }
        if patches && !(1..=32).contains(&settings.tessellation_patch_size) {
            bail!("Tessellation patch size {} out of range", settings.tessellation_patch_size);
        }
        if (settings.depth_test || settings.depth_write) && !pass.desc().depth_stencil_format.is_depth() {
            bail!("Depth testing requested on a render target without a depth attachment");
        }

        let key = device
            .backend()
            .create_graphics_pipeline(&GraphicsPipelineDesc {
                shader: shader.key(),
                vertex_layout,
                descriptor_set: descriptor_set.map(|s| s.key()),
                render_pass: pass.key(),
                settings,
            })
            .context("Failed to create graphics pipeline")?;

        let kind = PipelineKind::Graphics(GraphicsPipelineInfo {
            vertex_layout: vertex_layout.clone(),
            settings: settings.clone(),
            render_pass: pass.desc().clone(),
        });
        let descriptor_bindings = descriptor_set.map(|s| s.bindings().to_vec()).unwrap_or_default();
        let fingerprint = fingerprint(shader, &kind, &descriptor_bindings);

        log::debug!("Created graphics pipeline {:?}", key);

        Ok(Self {
            device: device.clone(),
            key,
            kind,
            descriptor_bindings,
            fingerprint,
        })
    }

    pub fn new_compute(device: &Arc<Device>, shader: &ShaderProgram, descriptor_set: Option<&DescriptorSet>) -> Result<Self> {
        if !shader.is_compute() {
            bail!("Compute pipeline created from a graphics shader program");
        }
        let key = device
            .backend()
            .create_compute_pipeline(shader.key(), descriptor_set.map(|s| s.key()))
            .context("Failed to create compute pipeline")?;

        let descriptor_bindings = descriptor_set.map(|s| s.bindings().to_vec()).unwrap_or_default();
        let fingerprint = fingerprint(shader, &PipelineKind::Compute, &descriptor_bindings);

        log::debug!("Created compute pipeline {:?}", key);

        Ok(Self {
            device: device.clone(),
            key,
            kind: PipelineKind::Compute,
            descriptor_bindings,
            fingerprint,
        })
    }

    pub fn key(&self) -> PipelineKey {
        self.key
    }

    pub fn kind(&self) -> &PipelineKind {
        &self.kind
    }

    pub fn is_compute(&self) -> bool {
        matches!(self.kind, PipelineKind::Compute)
    }

    pub fn descriptor_bindings(&self) -> &[DescriptorBinding] {
        &self.descriptor_bindings
    }

    /// Equal for pipelines built from identical inputs
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

fn fingerprint(shader: &ShaderProgram, kind: &PipelineKind, bindings: &[DescriptorBinding]) -> u64 {
    let mut hasher = DefaultHasher::new();
    shader.content_hash().hash(&mut hasher);
    kind.hash(&mut hasher);
    bindings.hash(&mut hasher);
    hasher.finish()
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.device.backend().destroy_pipeline(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_layout_offsets_and_stride() {
        let layout = VertexLayout::interleaved(&[
            (VertexSemantic::Position, Format::R32G32B32A32Float),
            (VertexSemantic::Color, Format::R32G32B32A32Float),
        ]);
        assert_eq!(layout.attributes[1].offset, 16);
        assert_eq!(layout.attributes[1].location, 1);
        assert_eq!(layout.stride(0), 32);
        assert_eq!(layout.bindings(), vec![0]);
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn rejects_unsupported_vertex_formats() {
        let layout = VertexLayout::interleaved(&[(VertexSemantic::Position, Format::R8G8B8Unorm)]);
        assert!(layout.validate().is_err());
    }

    #[test]
    fn missing_blend_modes_are_opaque() {
        let settings = PipelineSettings {
            blend_modes: vec![BlendMode::Alpha],
            ..PipelineSettings::default()
        };
        assert_eq!(settings.blend_mode(0), BlendMode::Alpha);
        assert_eq!(settings.blend_mode(3), BlendMode::Opaque);
    }
}
