// Render passes and render targets
//
// A render pass describes attachment formats and sample count; a render
// target is a concrete set of attachments compatible with one pass. On Vulkan
// both map to native objects (VkRenderPass + VkFramebuffer). D3D12 has
// neither and synthesizes the pair from tracked attachment state.
//
// Attachments are loaded and stored, never cleared implicitly: clears are
// explicit commands. Every attachment must be in its attachment state
// (ColorAttachment / DepthStencilAttachment) when the pass begins and is
// left in that state when it ends.

use anyhow::{bail, Context, Result};
use std::sync::Arc;

use crate::backend::{RenderPassKey, RenderTargetAttachments, RenderTargetKey};
use crate::device::Device;
use crate::format::Format;
use crate::resource::{Texture, TextureDesc};
use crate::types::{ClearValue, TextureUsage};

pub const MAX_COLOR_ATTACHMENTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderPassDesc {
    pub color_formats: Vec<Format>,
    /// `Format::Undefined` for no depth-stencil attachment
    pub depth_stencil_format: Format,
    pub sample_count: u32,
    /// Multisampled color attachments resolve into single-sample targets at the end of the pass
    pub resolve: bool,
}

impl RenderPassDesc {
    pub fn validate(&self, max_color_attachments: u32) -> Result<()> {
        if self.color_formats.len() > (max_color_attachments as usize).min(MAX_COLOR_ATTACHMENTS) {
            bail!("{} color attachments requested", self.color_formats.len());
        }
        if let Some(f) = self.color_formats.iter().find(|f| f.is_depth_stencil() || **f == Format::Undefined) {
            bail!("{} is not a color attachment format", f);
        }
        if self.depth_stencil_format != Format::Undefined && !self.depth_stencil_format.is_depth_stencil() {
            bail!("{} is not a depth-stencil format", self.depth_stencil_format);
        }
        if !self.sample_count.is_power_of_two() || self.sample_count > 64 {
            bail!("Invalid sample count {}", self.sample_count);
        }
        if self.resolve && self.sample_count == 1 {
            bail!("Resolve requested for a single-sampled render pass");
        }
        Ok(())
    }

    pub fn has_depth_stencil(&self) -> bool {
        self.depth_stencil_format != Format::Undefined
    }
}

pub struct RenderPass {
    device: Arc<Device>,
    key: RenderPassKey,
    desc: RenderPassDesc,
}

impl RenderPass {
    pub fn new(device: &Arc<Device>, desc: RenderPassDesc) -> Result<Self> {
        desc.validate(device.limits().max_color_attachments)?;
        let key = device
            .backend()
            .create_render_pass(&desc)
            .context("Failed to create render pass")?;
        Ok(Self {
            device: device.clone(),
            key,
            desc,
        })
    }

    pub fn key(&self) -> RenderPassKey {
        self.key
    }

    pub fn desc(&self) -> &RenderPassDesc {
        &self.desc
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.device.backend().destroy_render_pass(self.key);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderTargetDesc {
    pub width: u32,
    pub height: u32,
    pub sample_count: u32,
    pub color_format: Format,
    pub color_attachment_count: u32,
    pub depth_stencil_format: Format,
    pub color_clear_value: ClearValue,
    pub depth_stencil_clear_value: ClearValue,
    /// Usage added to the color attachments (and resolve targets) beyond COLOR_ATTACHMENT
    pub color_usage: TextureUsage,
}

impl RenderTargetDesc {
    pub fn new(width: u32, height: u32, color_format: Format) -> Self {
        Self {
            width,
            height,
            sample_count: 1,
            color_format,
            color_attachment_count: 1,
            depth_stencil_format: Format::Undefined,
            color_clear_value: ClearValue::BLACK,
            depth_stencil_clear_value: ClearValue::DEPTH_ONE,
            color_usage: TextureUsage::SAMPLED_IMAGE | TextureUsage::TRANSFER_SRC,
        }
    }

    fn pass_desc(&self) -> RenderPassDesc {
        RenderPassDesc {
            color_formats: vec![self.color_format; self.color_attachment_count as usize],
            depth_stencil_format: self.depth_stencil_format,
            sample_count: self.sample_count,
            resolve: self.sample_count > 1 && self.color_attachment_count > 0,
        }
    }
}

pub struct RenderTarget {
    device: Arc<Device>,
    key: RenderTargetKey,
    render_pass: RenderPass,
    width: u32,
    height: u32,
    colors: Vec<Texture>,
    resolves: Vec<Texture>,
    depth_stencil: Option<Texture>,
}

impl RenderTarget {
    /// Create the pass and all attachment textures. Attachments start out in
    /// `Undefined`; the caller transitions them before first use.
    pub fn new(device: &Arc<Device>, desc: &RenderTargetDesc) -> Result<Self> {
        if desc.width == 0 || desc.height == 0 {
            bail!("Render target dimensions must be non-zero");
        }
        let pass = RenderPass::new(device, desc.pass_desc())?;
        let multisampled = desc.sample_count > 1;

        let color_texture = |sample_count: u32, extra: TextureUsage| {
            Texture::new(
                device,
                TextureDesc {
                    sample_count,
                    clear_value: desc.color_clear_value,
                    ..TextureDesc::new_2d(
                        desc.width,
                        desc.height,
                        desc.color_format,
                        TextureUsage::COLOR_ATTACHMENT | extra,
                    )
                },
            )
        };

        let mut colors = Vec::with_capacity(desc.color_attachment_count as usize);
        let mut resolves = Vec::new();
        for _ in 0..desc.color_attachment_count {
            if multisampled {
                colors.push(color_texture(desc.sample_count, TextureUsage::RESOLVE_SRC)?);
                resolves.push(color_texture(1, desc.color_usage | TextureUsage::RESOLVE_DST)?);
            } else {
                colors.push(color_texture(1, desc.color_usage)?);
            }
        }

        let depth_stencil = if desc.depth_stencil_format != Format::Undefined {
            Some(Texture::new(
                device,
                TextureDesc {
                    sample_count: desc.sample_count,
                    clear_value: desc.depth_stencil_clear_value,
                    ..TextureDesc::new_2d(
                        desc.width,
                        desc.height,
                        desc.depth_stencil_format,
                        TextureUsage::DEPTH_STENCIL_ATTACHMENT,
                    )
                },
            )?)
        } else {
            None
        };

        Self::from_parts(device, pass, desc.width, desc.height, colors, resolves, depth_stencil)
    }

    pub(crate) fn from_parts(
        device: &Arc<Device>,
        render_pass: RenderPass,
        width: u32,
        height: u32,
        colors: Vec<Texture>,
        resolves: Vec<Texture>,
        depth_stencil: Option<Texture>,
    ) -> Result<Self> {
        let attachments = RenderTargetAttachments {
            width,
            height,
            colors: colors.iter().map(Texture::key).collect(),
            resolves: resolves.iter().map(Texture::key).collect(),
            depth_stencil: depth_stencil.as_ref().map(Texture::key),
        };
        let key = device
            .backend()
            .create_render_target(render_pass.key(), &attachments)
            .context("Failed to create render target")?;

        log::debug!(
            "Created render target {:?}: {}x{}, {} color, {} resolve, depth: {}",
            key,
            width,
            height,
            colors.len(),
            resolves.len(),
            depth_stencil.is_some()
        );

        Ok(Self {
            device: device.clone(),
            key,
            render_pass,
            width,
            height,
            colors,
            resolves,
            depth_stencil,
        })
    }

    pub fn key(&self) -> RenderTargetKey {
        self.key
    }

    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn sample_count(&self) -> u32 {
        self.render_pass.desc().sample_count
    }

    pub fn color_attachments(&self) -> &[Texture] {
        &self.colors
    }

    pub fn resolve_attachments(&self) -> &[Texture] {
        &self.resolves
    }

    pub fn depth_stencil_attachment(&self) -> Option<&Texture> {
        self.depth_stencil.as_ref()
    }

    /// The single-sample images the pass finally writes: resolve targets when
    /// multisampled, the color attachments otherwise
    pub fn output_attachments(&self) -> &[Texture] {
        if self.resolves.is_empty() {
            &self.colors
        } else {
            &self.resolves
        }
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        self.device.backend().destroy_render_target(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_validation() {
        let ok = RenderPassDesc {
            color_formats: vec![Format::R8G8B8A8Unorm],
            depth_stencil_format: Format::D32Float,
            sample_count: 4,
            resolve: true,
        };
        assert!(ok.validate(8).is_ok());

        let too_many = RenderPassDesc {
            color_formats: vec![Format::R8G8B8A8Unorm; 9],
            ..ok.clone()
        };
        assert!(too_many.validate(8).is_err());

        let depth_as_color = RenderPassDesc {
            color_formats: vec![Format::D32Float],
            ..ok.clone()
        };
        assert!(depth_as_color.validate(8).is_err());

        let bad_resolve = RenderPassDesc {
            sample_count: 1,
            ..ok
        };
        assert!(bad_resolve.validate(8).is_err());
    }

    #[test]
    fn target_desc_derives_pass() {
        let desc = RenderTargetDesc {
            sample_count: 4,
            color_attachment_count: 2,
            ..RenderTargetDesc::new(64, 64, Format::R16G16B16A16Float)
        };
        let pass = desc.pass_desc();
        assert_eq!(pass.color_formats.len(), 2);
        assert!(pass.resolve);
        assert!(!pass.has_depth_stencil());
    }
}
