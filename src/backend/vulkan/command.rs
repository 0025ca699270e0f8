// Command translation
//
// Each neutral `Command` becomes one vkCmd* call (or a single barrier).
// Objects that are gone by the time a command references them are reported
// and the command is dropped.

use ash::vk;

use super::{conv, CmdEntry, OpenPass, Registry, VulkanBackend};
use crate::backend::{BufferTextureCopy, CmdKey, Command};
use crate::format::{ChannelKind, Format};
use crate::types::ClearValue;

macro_rules! lookup {
    ($self:ident, $map:expr, $key:expr, $what:literal) => {
        match $map.get($key) {
            Some(entry) => entry,
            None => {
                $self.report(concat!("Command references an unknown ", $what));
                return;
            }
        }
    };
}

fn clear_color(format: Format, value: ClearValue) -> vk::ClearColorValue {
    let rgba = value.color();
    match format.channel_kind() {
        Some(ChannelKind::Uint32) => vk::ClearColorValue {
            uint32: rgba.map(|c| c as u32),
        },
        _ => vk::ClearColorValue { float32: rgba },
    }
}

fn copy_region(region: &BufferTextureCopy, format: Format) -> vk::BufferImageCopy {
    let stride = format.stride().max(1);
    vk::BufferImageCopy {
        buffer_offset: region.buffer_offset,
        buffer_row_length: region.row_pitch / stride,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: conv::aspect_mask(format),
            mip_level: region.mip_level,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D {
            width: region.width,
            height: region.height,
            depth: 1,
        },
    }
}

impl VulkanBackend {
    pub(super) fn record_impl(&self, registry: &mut Registry, key: CmdKey, command: &Command) {
        let device = &self.device.device;
        let Some(&CmdEntry { cmd, .. }) = registry.cmds.get(key) else {
            self.report("Recording into an unknown command buffer");
            return;
        };

        match command {
            Command::BeginRender { target, render_pass } => {
                let target = lookup!(self, registry.render_targets, *target, "render target");
                let pass = lookup!(self, registry.render_passes, *render_pass, "render pass");
                let begin_info = vk::RenderPassBeginInfo::builder()
                    .render_pass(pass.render_pass)
                    .framebuffer(target.framebuffer)
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent: target.extent,
                    });
                unsafe { device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE) };
                let open = OpenPass {
                    extent: target.extent,
                    color_formats: pass.desc.color_formats.clone(),
                    depth_stencil_format: pass.desc.depth_stencil_format,
                };
                if let Some(entry) = registry.cmds.get_mut(key) {
                    entry.pass = Some(open);
                }
            }
            Command::EndRender => {
                unsafe { device.cmd_end_render_pass(cmd) };
                if let Some(entry) = registry.cmds.get_mut(key) {
                    entry.pass = None;
                }
            }
            Command::SetViewport(viewport) => {
                let viewports = [vk::Viewport {
                    x: viewport.x,
                    y: viewport.y,
                    width: viewport.width,
                    height: viewport.height,
                    min_depth: viewport.min_depth,
                    max_depth: viewport.max_depth,
                }];
                unsafe { device.cmd_set_viewport(cmd, 0, &viewports) };
            }
            Command::SetScissor(rect) => {
                let scissors = [vk::Rect2D {
                    offset: vk::Offset2D { x: rect.x, y: rect.y },
                    extent: vk::Extent2D {
                        width: rect.width,
                        height: rect.height,
                    },
                }];
                unsafe { device.cmd_set_scissor(cmd, 0, &scissors) };
            }
            Command::ClearColorAttachment { index, value } => {
                let Some(pass) = registry.cmds.get(key).and_then(|c| c.pass.as_ref()) else {
                    self.report("Color clear outside a render pass");
                    return;
                };
                let Some(&format) = pass.color_formats.get(*index as usize) else {
                    self.report("Color clear of an attachment the render pass does not have");
                    return;
                };
                let attachments = [vk::ClearAttachment {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    color_attachment: *index,
                    clear_value: vk::ClearValue {
                        color: clear_color(format, *value),
                    },
                }];
                let rects = [full_rect(pass.extent)];
                unsafe { device.cmd_clear_attachments(cmd, &attachments, &rects) };
            }
            Command::ClearDepthStencilAttachment { value } => {
                let Some(pass) = registry.cmds.get(key).and_then(|c| c.pass.as_ref()) else {
                    self.report("Depth-stencil clear outside a render pass");
                    return;
                };
                if pass.depth_stencil_format == Format::Undefined {
                    self.report("Depth-stencil clear in a render pass without a depth-stencil attachment");
                    return;
                }
                let (depth, stencil) = value.depth_stencil();
                let attachments = [vk::ClearAttachment {
                    aspect_mask: conv::aspect_mask(pass.depth_stencil_format),
                    color_attachment: 0,
                    clear_value: vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
                    },
                }];
                let rects = [full_rect(pass.extent)];
                unsafe { device.cmd_clear_attachments(cmd, &attachments, &rects) };
            }
            Command::BindPipeline(pipeline) => {
                let pipeline = lookup!(self, registry.pipelines, *pipeline, "pipeline");
                unsafe { device.cmd_bind_pipeline(cmd, pipeline.bind_point, pipeline.pipeline) };
            }
            Command::BindDescriptorSets { pipeline, set } => {
                let pipeline = lookup!(self, registry.pipelines, *pipeline, "pipeline");
                let set = lookup!(self, registry.descriptor_sets, *set, "descriptor set");
                unsafe {
                    device.cmd_bind_descriptor_sets(cmd, pipeline.bind_point, pipeline.layout, 0, &[set.set], &[])
                };
            }
            Command::BindVertexBuffers(bindings) => {
                let mut buffers = Vec::with_capacity(bindings.len());
                let mut offsets = Vec::with_capacity(bindings.len());
                for binding in bindings {
                    let buffer = lookup!(self, registry.buffers, binding.buffer, "vertex buffer");
                    buffers.push(buffer.buffer);
                    offsets.push(binding.offset);
                }
                unsafe { device.cmd_bind_vertex_buffers(cmd, 0, &buffers, &offsets) };
            }
            Command::BindIndexBuffer {
                buffer,
                index_type,
                offset,
                ..
            } => {
                let buffer = lookup!(self, registry.buffers, *buffer, "index buffer");
                unsafe { device.cmd_bind_index_buffer(cmd, buffer.buffer, *offset, conv::index_type(*index_type)) };
            }
            Command::Draw {
                vertex_count,
                first_vertex,
            } => unsafe { device.cmd_draw(cmd, *vertex_count, 1, *first_vertex, 0) },
            Command::DrawIndexed {
                index_count,
                first_index,
            } => unsafe { device.cmd_draw_indexed(cmd, *index_count, 1, *first_index, 0, 0) },
            Command::Dispatch { x, y, z } => unsafe { device.cmd_dispatch(cmd, *x, *y, *z) },
            Command::BufferTransition { buffer, old, new } => {
                let buffer = lookup!(self, registry.buffers, *buffer, "buffer");
                let (src_access, src_stage) = conv::access_and_stage(*old);
                let (dst_access, dst_stage) = conv::access_and_stage(*new);
                let barrier = vk::BufferMemoryBarrier::builder()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(buffer.buffer)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build();
                unsafe {
                    device.cmd_pipeline_barrier(
                        cmd,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[barrier],
                        &[],
                    )
                };
            }
            Command::TextureTransition { texture, old, new } => {
                let texture = lookup!(self, registry.textures, *texture, "texture");
                let (src_access, src_stage) = conv::access_and_stage(*old);
                let (dst_access, dst_stage) = conv::access_and_stage(*new);
                let barrier = vk::ImageMemoryBarrier::builder()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .old_layout(conv::image_layout(*old))
                    .new_layout(conv::image_layout(*new))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(texture.image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: conv::aspect_mask(texture.format),
                        base_mip_level: 0,
                        level_count: vk::REMAINING_MIP_LEVELS,
                        base_array_layer: 0,
                        layer_count: vk::REMAINING_ARRAY_LAYERS,
                    })
                    .build();
                unsafe {
                    device.cmd_pipeline_barrier(
                        cmd,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    )
                };
            }
            Command::CopyBufferToBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let src = lookup!(self, registry.buffers, *src, "copy source buffer");
                let dst = lookup!(self, registry.buffers, *dst, "copy destination buffer");
                let region = vk::BufferCopy {
                    src_offset: *src_offset,
                    dst_offset: *dst_offset,
                    size: *size,
                };
                unsafe { device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]) };
            }
            Command::CopyBufferToTexture2d { src, dst, region } => {
                let src = lookup!(self, registry.buffers, *src, "copy source buffer");
                let dst = lookup!(self, registry.textures, *dst, "copy destination texture");
                let region = copy_region(region, dst.format);
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        src.buffer,
                        dst.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    )
                };
            }
            Command::CopyTextureToBuffer { src, dst, region } => {
                let src = lookup!(self, registry.textures, *src, "copy source texture");
                let dst = lookup!(self, registry.buffers, *dst, "copy destination buffer");
                let region = copy_region(region, src.format);
                unsafe {
                    device.cmd_copy_image_to_buffer(
                        cmd,
                        src.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst.buffer,
                        &[region],
                    )
                };
            }
        }
    }
}

fn full_rect(extent: vk::Extent2D) -> vk::ClearRect {
    vk::ClearRect {
        rect: vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        },
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_targets_clear_with_integer_values() {
        let value = clear_color(Format::R32G32B32A32Uint, ClearValue::Color([1.0, 2.0, 3.0, 4.0]));
        assert_eq!(unsafe { value.uint32 }, [1, 2, 3, 4]);
        let value = clear_color(Format::R8G8B8A8Unorm, ClearValue::Color([0.5, 0.0, 0.0, 1.0]));
        assert_eq!(unsafe { value.float32 }, [0.5, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn copy_rows_are_measured_in_texels() {
        let region = BufferTextureCopy {
            buffer_offset: 64,
            row_pitch: 256,
            mip_level: 1,
            width: 60,
            height: 8,
        };
        let copy = copy_region(&region, Format::R8G8B8A8Unorm);
        assert_eq!(copy.buffer_row_length, 64);
        assert_eq!(copy.buffer_offset, 64);
        assert_eq!(copy.image_subresource.mip_level, 1);
        assert_eq!(copy.image_extent.depth, 1);
    }
}
