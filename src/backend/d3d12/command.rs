// Command translation
//
// Each neutral `Command` maps onto ID3D12GraphicsCommandList calls. The render
// pass is synthesized: BeginRender binds the target's views, EndRender
// resolves multisampled colors with ResolveSubresource.

use windows::Win32::Foundation::RECT;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_R16_UINT, DXGI_FORMAT_R32_UINT};

use super::resources::{transition_barrier, uav_barrier};
use super::{conv, D3D12Backend, OpenPass, Registry};
use crate::backend::{BufferTextureCopy, CmdKey, Command};
use crate::format::Format;
use crate::types::{IndexType, ResourceState};

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

fn footprint_location(resource: &ID3D12Resource, region: &BufferTextureCopy, format: Format) -> D3D12_TEXTURE_COPY_LOCATION {
    D3D12_TEXTURE_COPY_LOCATION {
        pResource: unsafe { std::mem::transmute_copy(resource) },
        Type: D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
            PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                Offset: region.buffer_offset,
                Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                    Format: conv::format(format),
                    Width: region.width,
                    Height: region.height,
                    Depth: 1,
                    RowPitch: region.row_pitch,
                },
            },
        },
    }
}

fn subresource_location(resource: &ID3D12Resource, mip_level: u32) -> D3D12_TEXTURE_COPY_LOCATION {
    D3D12_TEXTURE_COPY_LOCATION {
        pResource: unsafe { std::mem::transmute_copy(resource) },
        Type: D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
        Anonymous: D3D12_TEXTURE_COPY_LOCATION_0 {
            SubresourceIndex: mip_level,
        },
    }
}

/// Barrier for `old -> new`, if the native states differ or a UAV needs flushing.
/// Barrier and copy-location structs hold non-owning interface pointers.
fn state_barrier(resource: &ID3D12Resource, old: ResourceState, new: ResourceState) -> Option<D3D12_RESOURCE_BARRIER> {
    let (before, after) = (conv::resource_state(old), conv::resource_state(new));
    if before != after {
        Some(transition_barrier(resource, before, after))
    } else if matches!(new, ResourceState::StorageBufferUav | ResourceState::StorageImage) {
        Some(uav_barrier(resource))
    } else {
        None
    }
}

impl D3D12Backend {
    pub(super) fn record_impl(&self, registry: &mut Registry, key: CmdKey, command: &Command) {
        let Some(list) = registry.cmds.get(key).map(|c| c.list.clone()) else {
            self.report("Recording into an unknown command buffer");
            return;
        };

        match command {
            Command::BeginRender { target, render_pass } => {
                lookup!(self, registry.render_passes, *render_pass, "render pass");
                let target = lookup!(self, registry.render_targets, *target, "render target");
                let mut open = OpenPass {
                    rtvs: Vec::with_capacity(target.colors.len()),
                    dsv: None,
                    colors: Vec::with_capacity(target.colors.len()),
                    resolves: Vec::with_capacity(target.resolves.len()),
                };
                for &color in &target.colors {
                    let texture = lookup!(self, registry.textures, color, "color attachment");
                    let Some(rtv) = texture.views.rtv else {
                        self.report("Color attachment has no render target view");
                        return;
                    };
                    open.rtvs.push(rtv);
                    open.colors.push(texture.resource.clone());
                }
                for &resolve in &target.resolves {
                    let texture = lookup!(self, registry.textures, resolve, "resolve attachment");
                    open.resolves.push((texture.resource.clone(), texture.format));
                }
                if let Some(depth) = target.depth_stencil {
                    let texture = lookup!(self, registry.textures, depth, "depth-stencil attachment");
                    open.dsv = texture.views.dsv.map(|dsv| (dsv, texture.format));
                }

                unsafe {
                    list.OMSetRenderTargets(
                        open.rtvs.len() as u32,
                        if open.rtvs.is_empty() { None } else { Some(open.rtvs.as_ptr()) },
                        false,
                        open.dsv.as_ref().map(|(dsv, _)| dsv as *const _),
                    )
                };
                if let Some(entry) = registry.cmds.get_mut(key) {
                    entry.pass = Some(open);
                }
            }
            Command::EndRender => {
                let Some(open) = registry.cmds.get_mut(key).and_then(|c| c.pass.take()) else {
                    self.report("EndRender without an open render pass");
                    return;
                };
                if open.resolves.is_empty() {
                    return;
                }
                let mut before = Vec::with_capacity(open.resolves.len() * 2);
                let mut after = Vec::with_capacity(open.resolves.len() * 2);
                for (src, (dst, _)) in open.colors.iter().zip(&open.resolves) {
                    before.push(transition_barrier(src, D3D12_RESOURCE_STATE_RENDER_TARGET, D3D12_RESOURCE_STATE_RESOLVE_SOURCE));
                    before.push(transition_barrier(dst, D3D12_RESOURCE_STATE_RENDER_TARGET, D3D12_RESOURCE_STATE_RESOLVE_DEST));
                    after.push(transition_barrier(src, D3D12_RESOURCE_STATE_RESOLVE_SOURCE, D3D12_RESOURCE_STATE_RENDER_TARGET));
                    after.push(transition_barrier(dst, D3D12_RESOURCE_STATE_RESOLVE_DEST, D3D12_RESOURCE_STATE_RENDER_TARGET));
                }
                unsafe {
                    list.ResourceBarrier(&before);
                    for (src, (dst, format)) in open.colors.iter().zip(&open.resolves) {
                        list.ResolveSubresource(dst, 0, src, 0, conv::format(*format));
                    }
                    list.ResourceBarrier(&after);
                }
            }
            Command::SetViewport(viewport) => {
                let viewports = [D3D12_VIEWPORT {
                    TopLeftX: viewport.x,
                    TopLeftY: viewport.y,
                    Width: viewport.width,
                    Height: viewport.height,
                    MinDepth: viewport.min_depth,
                    MaxDepth: viewport.max_depth,
                }];
                unsafe { list.RSSetViewports(&viewports) };
            }
            Command::SetScissor(rect) => {
                let rects = [RECT {
                    left: rect.x,
                    top: rect.y,
                    right: rect.x + rect.width as i32,
                    bottom: rect.y + rect.height as i32,
                }];
                unsafe { list.RSSetScissorRects(&rects) };
            }
            Command::ClearColorAttachment { index, value } => {
                let Some(pass) = registry.cmds.get(key).and_then(|c| c.pass.as_ref()) else {
                    self.report("Color clear outside a render pass");
                    return;
                };
                let Some(&rtv) = pass.rtvs.get(*index as usize) else {
                    self.report("Color clear of an attachment the render pass does not have");
                    return;
                };
                let rgba = value.color();
                unsafe { list.ClearRenderTargetView(rtv, rgba.as_ptr(), None) };
            }
            Command::ClearDepthStencilAttachment { value } => {
                let Some(pass) = registry.cmds.get(key).and_then(|c| c.pass.as_ref()) else {
                    self.report("Depth-stencil clear outside a render pass");
                    return;
                };
                let Some((dsv, format)) = pass.dsv else {
                    self.report("Depth-stencil clear without a depth-stencil attachment");
                    return;
                };
                let (depth, stencil) = value.depth_stencil();
                let mut flags = D3D12_CLEAR_FLAG_DEPTH;
                if format.has_stencil() {
                    flags |= D3D12_CLEAR_FLAG_STENCIL;
                }
                unsafe { list.ClearDepthStencilView(dsv, flags, depth, stencil as u8, None) };
            }
            Command::BindPipeline(pipeline) => {
                let pipeline = lookup!(self, registry.pipelines, *pipeline, "pipeline");
                unsafe {
                    list.SetPipelineState(&pipeline.pipeline);
                    if pipeline.compute {
                        list.SetComputeRootSignature(&pipeline.root_signature);
                    } else {
                        list.SetGraphicsRootSignature(&pipeline.root_signature);
                        list.IASetPrimitiveTopology(pipeline.topology);
                    }
                }
            }
            Command::BindDescriptorSets { pipeline, set } => {
                let pipeline = lookup!(self, registry.pipelines, *pipeline, "pipeline");
                let set = lookup!(self, registry.descriptor_sets, *set, "descriptor set");
                let heaps = self.heaps.lock();
                let tables = [
                    (pipeline.view_table, set.views.map(|r| heaps.shader_views.gpu(r.offset))),
                    (pipeline.sampler_table, set.samplers.map(|r| heaps.shader_samplers.gpu(r.offset))),
                ];
                unsafe {
                    list.SetDescriptorHeaps(&[
                        Some(heaps.shader_views.heap().clone()),
                        Some(heaps.shader_samplers.heap().clone()),
                    ]);
                    for (parameter, handle) in tables {
                        let (Some(parameter), Some(handle)) = (parameter, handle) else { continue };
                        if pipeline.compute {
                            list.SetComputeRootDescriptorTable(parameter, handle);
                        } else {
                            list.SetGraphicsRootDescriptorTable(parameter, handle);
                        }
                    }
                }
            }
            Command::BindVertexBuffers(bindings) => {
                let mut views = Vec::with_capacity(bindings.len());
                for binding in bindings {
                    let buffer = lookup!(self, registry.buffers, binding.buffer, "vertex buffer");
                    views.push(D3D12_VERTEX_BUFFER_VIEW {
                        BufferLocation: unsafe { buffer.resource.GetGPUVirtualAddress() } + binding.offset,
                        SizeInBytes: binding.size as u32,
                        StrideInBytes: binding.stride,
                    });
                }
                unsafe { list.IASetVertexBuffers(0, Some(&views)) };
            }
            Command::BindIndexBuffer {
                buffer,
                index_type,
                offset,
                size,
            } => {
                let buffer = lookup!(self, registry.buffers, *buffer, "index buffer");
                let view = D3D12_INDEX_BUFFER_VIEW {
                    BufferLocation: unsafe { buffer.resource.GetGPUVirtualAddress() } + offset,
                    SizeInBytes: *size as u32,
                    Format: match index_type {
                        IndexType::Uint16 => DXGI_FORMAT_R16_UINT,
                        IndexType::Uint32 => DXGI_FORMAT_R32_UINT,
                    },
                };
                unsafe { list.IASetIndexBuffer(Some(&view)) };
            }
            Command::Draw {
                vertex_count,
                first_vertex,
            } => unsafe { list.DrawInstanced(*vertex_count, 1, *first_vertex, 0) },
            Command::DrawIndexed {
                index_count,
                first_index,
            } => unsafe { list.DrawIndexedInstanced(*index_count, 1, *first_index, 0, 0) },
            Command::Dispatch { x, y, z } => unsafe { list.Dispatch(*x, *y, *z) },
            Command::BufferTransition { buffer, old, new } => {
                let buffer = lookup!(self, registry.buffers, *buffer, "buffer");
                if buffer.pinned_state {
                    return;
                }
                if let Some(barrier) = state_barrier(&buffer.resource, *old, *new) {
                    unsafe { list.ResourceBarrier(&[barrier]) };
                }
            }
            Command::TextureTransition { texture, old, new } => {
                let texture = lookup!(self, registry.textures, *texture, "texture");
                if let Some(barrier) = state_barrier(&texture.resource, *old, *new) {
                    unsafe { list.ResourceBarrier(&[barrier]) };
                }
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
                unsafe { list.CopyBufferRegion(&dst.resource, *dst_offset, &src.resource, *src_offset, *size) };
            }
            Command::CopyBufferToTexture2d { src, dst, region } => {
                let src = lookup!(self, registry.buffers, *src, "copy source buffer");
                let dst = lookup!(self, registry.textures, *dst, "copy destination texture");
                let src_location = footprint_location(&src.resource, region, dst.format);
                let dst_location = subresource_location(&dst.resource, region.mip_level);
                unsafe { list.CopyTextureRegion(&dst_location, 0, 0, 0, &src_location, None) };
            }
            Command::CopyTextureToBuffer { src, dst, region } => {
                let src = lookup!(self, registry.textures, *src, "copy source texture");
                let dst = lookup!(self, registry.buffers, *dst, "copy destination buffer");
                let src_location = subresource_location(&src.resource, region.mip_level);
                let dst_location = footprint_location(&dst.resource, region, src.format);
                unsafe { list.CopyTextureRegion(&dst_location, 0, 0, 0, &src_location, None) };
            }
        }
    }
}
