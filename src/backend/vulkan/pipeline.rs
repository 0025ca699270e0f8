// Shaders, descriptor sets, render passes and pipelines
//
// Render passes LOAD and STORE every attachment and keep each one in its
// attachment layout on entry and exit: layout changes are always explicit
// transitions recorded by the caller, and clears are in-pass commands.

use anyhow::{bail, Context, Result};
use ash::vk;
use std::collections::HashMap;
use std::ffi::CString;

use super::{
    conv, DescriptorSetEntry, PipelineEntry, RenderPassEntry, RenderTargetEntry, ShaderStage, VulkanBackend,
};
use crate::backend::{
    BoundResources, DescriptorSetKey, DescriptorWrite, GraphicsPipelineDesc, PipelineKey, RenderPassKey,
    RenderTargetAttachments, RenderTargetKey, ShaderKey,
};
use crate::descriptor::{DescriptorBinding, DescriptorType};
use crate::render_target::RenderPassDesc;
use crate::shader::{ShaderCode, ShaderProgramDesc, ShaderStageDesc};
use crate::types::PrimitiveTopology;

/// Resources of one descriptor write, converted before the write structs
/// borrow them
enum WriteInfo {
    Buffers(Vec<vk::DescriptorBufferInfo>),
    Images(Vec<vk::DescriptorImageInfo>),
    TexelViews(Vec<vk::BufferView>),
}

impl VulkanBackend {
    fn create_shader_module(&self, stage: &ShaderStageDesc) -> Result<vk::ShaderModule> {
        let ShaderCode::SpirV(words) = &stage.code else {
            bail!(
                "The Vulkan backend consumes SPIR-V, got {} for entry point '{}'",
                stage.code.kind_name(),
                stage.entry_point
            );
        };
        let create_info = vk::ShaderModuleCreateInfo::builder().code(words);
        unsafe { self.device.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")
    }

    pub(super) fn create_shader_program_impl(&self, desc: &ShaderProgramDesc) -> Result<ShaderKey> {
        let stages = [
            (&desc.vert, vk::ShaderStageFlags::VERTEX),
            (&desc.tesc, vk::ShaderStageFlags::TESSELLATION_CONTROL),
            (&desc.tese, vk::ShaderStageFlags::TESSELLATION_EVALUATION),
            (&desc.geom, vk::ShaderStageFlags::GEOMETRY),
            (&desc.frag, vk::ShaderStageFlags::FRAGMENT),
            (&desc.comp, vk::ShaderStageFlags::COMPUTE),
        ];

        let mut created: Vec<ShaderStage> = Vec::new();
        for (stage_desc, stage) in stages {
            let Some(stage_desc) = stage_desc else { continue };
            let result = CString::new(stage_desc.entry_point.as_str())
                .context("Entry point contains a NUL byte")
                .and_then(|entry_point| Ok((entry_point, self.create_shader_module(stage_desc)?)));
            match result {
                Ok((entry_point, module)) => created.push(ShaderStage {
                    stage,
                    module,
                    entry_point,
                }),
                Err(e) => {
                    for stage in created {
                        unsafe { self.device.device.destroy_shader_module(stage.module, None) };
                    }
                    return Err(e);
                }
            }
        }

        let key = self.registry.lock().shaders.insert(created);
        log::debug!("Created shader program {:?} ({:?})", key, desc.stages());
        Ok(key)
    }

    pub(super) fn create_descriptor_set_impl(&self, bindings: &[DescriptorBinding]) -> Result<DescriptorSetKey> {
        let device = &self.device.device;

        let layout_bindings: Vec<_> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(conv::descriptor_type(b.ty))
                    .descriptor_count(b.count)
                    .stage_flags(conv::shader_stages(b.stages))
                    .build()
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&layout_bindings);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create descriptor set layout")?;

        let mut counts: HashMap<vk::DescriptorType, u32> = HashMap::new();
        for b in bindings {
            *counts.entry(conv::descriptor_type(b.ty)).or_default() += b.count;
        }
        let mut pool_sizes: Vec<_> = counts
            .into_iter()
            .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
            .collect();
        if pool_sizes.is_empty() {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: 1,
            });
        }
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = match unsafe { device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(layout, None) };
                return Err(e).context("Failed to create descriptor pool");
            }
        };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let set = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(e) => {
                unsafe {
                    device.destroy_descriptor_pool(pool, None);
                    device.destroy_descriptor_set_layout(layout, None);
                }
                return Err(e).context("Failed to allocate descriptor set");
            }
        };

        Ok(self.registry.lock().descriptor_sets.insert(DescriptorSetEntry {
            layout,
            pool,
            set,
            bindings: bindings.to_vec(),
        }))
    }

    pub(super) fn update_descriptor_set_impl(&self, key: DescriptorSetKey, writes: &[DescriptorWrite]) -> Result<()> {
        let registry = self.registry.lock();
        let entry = registry.descriptor_sets.get(key).context("Unknown descriptor set")?;

        let mut infos = Vec::with_capacity(writes.len());
        for write in writes {
            if !entry.bindings.iter().any(|b| b.binding == write.binding) {
                bail!("Descriptor set has no binding {}", write.binding);
            }
            let info = match (&write.resources, write.ty) {
                (BoundResources::Buffers(keys), DescriptorType::UniformTexelBufferSrv | DescriptorType::StorageTexelBufferUav) => {
                    WriteInfo::TexelViews(
                        keys.iter()
                            .map(|&k| {
                                registry
                                    .buffers
                                    .get(k)
                                    .context("Unknown buffer in descriptor write")?
                                    .texel_view
                                    .context("Texel buffer was created without a format")
                            })
                            .collect::<Result<_>>()?,
                    )
                }
                (BoundResources::Buffers(keys), _) => WriteInfo::Buffers(
                    keys.iter()
                        .map(|&k| {
                            let buffer = registry.buffers.get(k).context("Unknown buffer in descriptor write")?;
                            Ok(vk::DescriptorBufferInfo {
                                buffer: buffer.buffer,
                                offset: 0,
                                range: vk::WHOLE_SIZE,
                            })
                        })
                        .collect::<Result<_>>()?,
                ),
                (BoundResources::Textures(keys), ty) => {
                    let layout = if ty == DescriptorType::TextureUav {
                        vk::ImageLayout::GENERAL
                    } else {
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                    };
                    WriteInfo::Images(
                        keys.iter()
                            .map(|&k| {
                                let texture = registry.textures.get(k).context("Unknown texture in descriptor write")?;
                                Ok(vk::DescriptorImageInfo {
                                    sampler: vk::Sampler::null(),
                                    image_view: texture.view,
                                    image_layout: layout,
                                })
                            })
                            .collect::<Result<_>>()?,
                    )
                }
                (BoundResources::Samplers(keys), _) => WriteInfo::Images(
                    keys.iter()
                        .map(|&k| {
                            let sampler = registry.samplers.get(k).context("Unknown sampler in descriptor write")?;
                            Ok(vk::DescriptorImageInfo {
                                sampler: *sampler,
                                image_view: vk::ImageView::null(),
                                image_layout: vk::ImageLayout::UNDEFINED,
                            })
                        })
                        .collect::<Result<_>>()?,
                ),
            };
            infos.push(info);
        }

        let vk_writes: Vec<_> = writes
            .iter()
            .zip(&infos)
            .map(|(write, info)| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(entry.set)
                    .dst_binding(write.binding)
                    .dst_array_element(0)
                    .descriptor_type(conv::descriptor_type(write.ty));
                match info {
                    WriteInfo::Buffers(buffers) => builder.buffer_info(buffers).build(),
                    WriteInfo::Images(images) => builder.image_info(images).build(),
                    WriteInfo::TexelViews(views) => builder.texel_buffer_view(views).build(),
                }
            })
            .collect();

        unsafe { self.device.device.update_descriptor_sets(&vk_writes, &[]) };
        Ok(())
    }

    pub(super) fn create_render_pass_impl(&self, desc: &RenderPassDesc) -> Result<RenderPassKey> {
        let samples = conv::sample_count(desc.sample_count);
        let color_layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
        let depth_layout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;

        let mut attachments = Vec::new();
        let mut color_refs = Vec::new();
        let mut resolve_refs = Vec::new();

        for &format in &desc.color_formats {
            color_refs.push(vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: color_layout,
            });
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(conv::format(format))
                    .samples(samples)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(color_layout)
                    .final_layout(color_layout)
                    .build(),
            );
        }
        if desc.resolve {
            for &format in &desc.color_formats {
                resolve_refs.push(vk::AttachmentReference {
                    attachment: attachments.len() as u32,
                    layout: color_layout,
                });
                attachments.push(
                    vk::AttachmentDescription::builder()
                        .format(conv::format(format))
                        .samples(vk::SampleCountFlags::TYPE_1)
                        .load_op(vk::AttachmentLoadOp::DONT_CARE)
                        .store_op(vk::AttachmentStoreOp::STORE)
                        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                        .initial_layout(color_layout)
                        .final_layout(color_layout)
                        .build(),
                );
            }
        }
        let depth_ref = desc.has_depth_stencil().then(|| {
            let reference = vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: depth_layout,
            };
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(conv::format(desc.depth_stencil_format))
                    .samples(samples)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::LOAD)
                    .stencil_store_op(vk::AttachmentStoreOp::STORE)
                    .initial_layout(depth_layout)
                    .final_layout(depth_layout)
                    .build(),
            );
            reference
        });

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if desc.resolve {
            subpass = subpass.resolve_attachments(&resolve_refs);
        }
        if let Some(depth_ref) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        let subpasses = [subpass.build()];

        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(stages)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
            .build();
        let dependencies = [dependency];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe { self.device.device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")?;

        Ok(self.registry.lock().render_passes.insert(RenderPassEntry {
            render_pass,
            desc: desc.clone(),
        }))
    }

    pub(super) fn create_render_target_impl(
        &self,
        render_pass: RenderPassKey,
        attachments: &RenderTargetAttachments,
    ) -> Result<RenderTargetKey> {
        let mut registry = self.registry.lock();
        let vk_render_pass = registry
            .render_passes
            .get(render_pass)
            .context("Unknown render pass")?
            .render_pass;

        // same order as the render pass attachments: colors, resolves, depth
        let views = attachments
            .colors
            .iter()
            .chain(&attachments.resolves)
            .chain(&attachments.depth_stencil)
            .map(|&k| registry.textures.get(k).map(|t| t.view).context("Unknown render target attachment"))
            .collect::<Result<Vec<_>>>()?;

        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(vk_render_pass)
            .attachments(&views)
            .width(attachments.width)
            .height(attachments.height)
            .layers(1);
        let framebuffer = unsafe { self.device.device.create_framebuffer(&framebuffer_info, None) }
            .context("Failed to create framebuffer")?;

        Ok(registry.render_targets.insert(RenderTargetEntry {
            framebuffer,
            extent: vk::Extent2D {
                width: attachments.width,
                height: attachments.height,
            },
        }))
    }

    fn create_pipeline_layout(&self, descriptor_set: Option<DescriptorSetKey>) -> Result<vk::PipelineLayout> {
        let set_layouts = match descriptor_set {
            Some(key) => vec![
                self.registry
                    .lock()
                    .descriptor_sets
                    .get(key)
                    .context("Unknown descriptor set")?
                    .layout,
            ],
            None => Vec::new(),
        };
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        unsafe { self.device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")
    }

    pub(super) fn create_graphics_pipeline_impl(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<PipelineKey> {
        let settings = desc.settings;
        let (render_pass, pass_desc, stage_infos, stage_flags, entry_points) = {
            let registry = self.registry.lock();
            let pass = registry.render_passes.get(desc.render_pass).context("Unknown render pass")?;
            let stages = registry.shaders.get(desc.shader).context("Unknown shader program")?;
            let entry_points: Vec<CString> = stages.iter().map(|s| s.entry_point.clone()).collect();
            let stage_flags = stages.iter().fold(vk::ShaderStageFlags::empty(), |acc, s| acc | s.stage);
            let modules: Vec<_> = stages.iter().map(|s| (s.stage, s.module)).collect();
            (pass.render_pass, pass.desc.clone(), modules, stage_flags, entry_points)
        };
        if stage_flags.contains(vk::ShaderStageFlags::COMPUTE) {
            bail!("A compute shader cannot be used in a graphics pipeline");
        }

        let shader_stages: Vec<_> = stage_infos
            .iter()
            .zip(&entry_points)
            .map(|(&(stage, module), name)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage)
                    .module(module)
                    .name(name)
                    .build()
            })
            .collect();

        let bindings: Vec<_> = desc
            .vertex_layout
            .bindings()
            .into_iter()
            .map(|binding| {
                vk::VertexInputBindingDescription::builder()
                    .binding(binding)
                    .stride(desc.vertex_layout.stride(binding))
                    .input_rate(vk::VertexInputRate::VERTEX)
                    .build()
            })
            .collect();
        let attributes: Vec<_> = desc
            .vertex_layout
            .attributes
            .iter()
            .map(|a| {
                vk::VertexInputAttributeDescription::builder()
                    .binding(a.binding)
                    .location(a.location)
                    .format(conv::format(a.format))
                    .offset(a.offset)
                    .build()
            })
            .collect();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(conv::topology(settings.topology))
            .primitive_restart_enable(false);

        let mut domain_origin = vk::PipelineTessellationDomainOriginStateCreateInfo::builder()
            .domain_origin(conv::domain_origin(settings.tessellation_domain_origin));
        let tessellation = vk::PipelineTessellationStateCreateInfo::builder()
            .patch_control_points(settings.tessellation_patch_size.max(1))
            .push_next(&mut domain_origin);

        // viewport and scissor are always recorded
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(conv::cull_mode(settings.cull_mode))
            .front_face(conv::front_face(settings.front_face))
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(conv::sample_count(pass_desc.sample_count));

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(settings.depth_test)
            .depth_write_enable(settings.depth_write)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments: Vec<_> = (0..pass_desc.color_formats.len())
            .map(|i| conv::blend_attachment(settings.blend_mode(i)))
            .collect();
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let pipeline_layout = self.create_pipeline_layout(desc.descriptor_set)?;

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(pipeline_layout)
            .render_pass(render_pass)
            .subpass(0);
        if pass_desc.has_depth_stencil() {
            pipeline_info = pipeline_info.depth_stencil_state(&depth_stencil);
        }
        if settings.topology == PrimitiveTopology::PatchList {
            pipeline_info = pipeline_info.tessellation_state(&tessellation);
        }
        let pipeline_info = pipeline_info.build();

        let pipelines = unsafe {
            self.device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| e);
        let pipelines = match pipelines {
            Ok(pipelines) => pipelines,
            Err(e) => {
                unsafe { self.device.device.destroy_pipeline_layout(pipeline_layout, None) };
                return Err(e).context("Failed to create graphics pipeline");
            }
        };

        Ok(self.registry.lock().pipelines.insert(PipelineEntry {
            pipeline: pipelines[0],
            layout: pipeline_layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        }))
    }

    pub(super) fn create_compute_pipeline_impl(
        &self,
        shader: ShaderKey,
        descriptor_set: Option<DescriptorSetKey>,
    ) -> Result<PipelineKey> {
        let (module, entry_point) = {
            let registry = self.registry.lock();
            let stages = registry.shaders.get(shader).context("Unknown shader program")?;
            let stage = stages
                .iter()
                .find(|s| s.stage == vk::ShaderStageFlags::COMPUTE)
                .context("Shader program has no compute stage")?;
            (stage.module, stage.entry_point.clone())
        };

        let pipeline_layout = self.create_pipeline_layout(descriptor_set)?;
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry_point)
            .build();
        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(pipeline_layout)
            .build();

        let pipelines = unsafe {
            self.device
                .device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| e);
        let pipelines = match pipelines {
            Ok(pipelines) => pipelines,
            Err(e) => {
                unsafe { self.device.device.destroy_pipeline_layout(pipeline_layout, None) };
                return Err(e).context("Failed to create compute pipeline");
            }
        };

        Ok(self.registry.lock().pipelines.insert(PipelineEntry {
            pipeline: pipelines[0],
            layout: pipeline_layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
        }))
    }
}
