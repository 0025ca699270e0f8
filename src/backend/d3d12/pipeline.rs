// Shaders, descriptor sets, root signatures and pipeline state objects
//
// A descriptor set becomes at most two root descriptor tables: one for
// CBV/SRV/UAV bindings and one for samplers. Each binding's register is its
// binding number, in register space 0.

use anyhow::{bail, Context, Result};
use std::ffi::CString;
use windows::core::PCSTR;
use windows::Win32::Graphics::Direct3D::Fxc::*;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use super::{conv, D3D12Backend, DescriptorSetEntry, HeapRange, PipelineEntry, RenderTargetEntry, ShaderStage};
use crate::backend::{
    BoundResources, DescriptorSetKey, DescriptorWrite, GraphicsPipelineDesc, PipelineKey, RenderPassKey,
    RenderTargetAttachments, RenderTargetKey, ShaderKey,
};
use crate::descriptor::{DescriptorBinding, DescriptorType};
use crate::shader::{ShaderCode, ShaderProgramDesc, ShaderStageDesc};
use crate::types::{FrontFace, ShaderStages};

fn shader_target(stage: ShaderStages) -> &'static str {
    match stage {
        ShaderStages::VERT => "vs_5_0",
        ShaderStages::TESC => "hs_5_0",
        ShaderStages::TESE => "ds_5_0",
        ShaderStages::GEOM => "gs_5_0",
        ShaderStages::FRAG => "ps_5_0",
        _ => "cs_5_0",
    }
}

fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    unsafe { std::slice::from_raw_parts(blob.GetBufferPointer().cast::<u8>(), blob.GetBufferSize()) }
}

fn range_type(ty: DescriptorType) -> D3D12_DESCRIPTOR_RANGE_TYPE {
    match ty {
        DescriptorType::Sampler => D3D12_DESCRIPTOR_RANGE_TYPE_SAMPLER,
        DescriptorType::UniformBufferCbv => D3D12_DESCRIPTOR_RANGE_TYPE_CBV,
        DescriptorType::StorageBufferSrv | DescriptorType::UniformTexelBufferSrv | DescriptorType::TextureSrv => {
            D3D12_DESCRIPTOR_RANGE_TYPE_SRV
        }
        DescriptorType::StorageBufferUav | DescriptorType::StorageTexelBufferUav | DescriptorType::TextureUav => {
            D3D12_DESCRIPTOR_RANGE_TYPE_UAV
        }
    }
}

fn bytecode(stages: &[ShaderStage], stage: ShaderStages) -> D3D12_SHADER_BYTECODE {
    match stages.iter().find(|s| s.stage == stage) {
        Some(s) => D3D12_SHADER_BYTECODE {
            pShaderBytecode: s.bytecode.as_ptr().cast(),
            BytecodeLength: s.bytecode.len(),
        },
        None => D3D12_SHADER_BYTECODE::default(),
    }
}

impl D3D12Backend {
    fn compile_hlsl(&self, source: &str, stage_desc: &ShaderStageDesc, stage: ShaderStages) -> Result<Vec<u8>> {
        let entry_point = CString::new(stage_desc.entry_point.as_str()).context("Entry point contains a NUL byte")?;
        let target = CString::new(shader_target(stage))?;
        let flags = if self.debug_shaders {
            D3DCOMPILE_DEBUG | D3DCOMPILE_SKIP_OPTIMIZATION
        } else {
            D3DCOMPILE_OPTIMIZATION_LEVEL3
        };

        let mut code: Option<ID3DBlob> = None;
        let mut errors: Option<ID3DBlob> = None;
        let result = unsafe {
            D3DCompile(
                source.as_ptr().cast(),
                source.len(),
                PCSTR::null(),
                None,
                None,
                PCSTR(entry_point.as_ptr().cast()),
                PCSTR(target.as_ptr().cast()),
                flags,
                0,
                &mut code,
                Some(&mut errors),
            )
        };
        if let Err(e) = result {
            let log = errors
                .as_ref()
                .map(|blob| String::from_utf8_lossy(blob_bytes(blob)).into_owned())
                .unwrap_or_default();
            bail!("Failed to compile '{}' ({}): {} {}", stage_desc.entry_point, shader_target(stage), e, log);
        }
        let code = code.context("D3DCompile produced no bytecode")?;
        Ok(blob_bytes(&code).to_vec())
    }

    pub(super) fn create_shader_program_impl(&self, desc: &ShaderProgramDesc) -> Result<ShaderKey> {
        let mut stages = Vec::new();
        for (stage, stage_desc) in desc.iter() {
            let bytecode = match &stage_desc.code {
                ShaderCode::Hlsl(source) => self.compile_hlsl(source, stage_desc, stage)?,
                ShaderCode::Dxbc(bytes) => bytes.clone(),
                ShaderCode::SpirV(_) => bail!(
                    "The D3D12 backend consumes HLSL or DXBC, got SPIR-V for entry point '{}'",
                    stage_desc.entry_point
                ),
            };
            stages.push(ShaderStage { stage, bytecode });
        }
        let key = self.registry.lock().shaders.insert(stages);
        log::debug!("Created shader program {:?} ({:?})", key, desc.stages());
        Ok(key)
    }

    pub(super) fn create_descriptor_set_impl(&self, bindings: &[DescriptorBinding]) -> Result<DescriptorSetKey> {
        let mut table_offsets = Vec::with_capacity(bindings.len());
        let mut view_ranges = Vec::new();
        let mut sampler_ranges = Vec::new();
        let (mut view_count, mut sampler_count) = (0u32, 0u32);

        for b in bindings {
            let (ranges, count) = if b.ty == DescriptorType::Sampler {
                (&mut sampler_ranges, &mut sampler_count)
            } else {
                (&mut view_ranges, &mut view_count)
            };
            table_offsets.push(*count);
            ranges.push(D3D12_DESCRIPTOR_RANGE {
                RangeType: range_type(b.ty),
                NumDescriptors: b.count,
                BaseShaderRegister: b.binding,
                RegisterSpace: 0,
                OffsetInDescriptorsFromTableStart: *count,
            });
            *count += b.count;
        }

        let mut heaps = self.heaps.lock();
        let views = match view_count {
            0 => None,
            count => Some(HeapRange {
                offset: heaps.shader_views.alloc(count)?,
                count,
            }),
        };
        let samplers = match sampler_count {
            0 => None,
            count => match heaps.shader_samplers.alloc(count) {
                Ok(offset) => Some(HeapRange { offset, count }),
                Err(e) => {
                    if let Some(range) = views {
                        heaps.shader_views.free(range.offset, range.count);
                    }
                    return Err(e);
                }
            },
        };
        drop(heaps);

        Ok(self.registry.lock().descriptor_sets.insert(DescriptorSetEntry {
            bindings: bindings.to_vec(),
            table_offsets,
            view_ranges,
            sampler_ranges,
            views,
            samplers,
        }))
    }

    pub(super) fn update_descriptor_set_impl(&self, key: DescriptorSetKey, writes: &[DescriptorWrite]) -> Result<()> {
        let registry = self.registry.lock();
        let entry = registry.descriptor_sets.get(key).context("Unknown descriptor set")?;
        let heaps = self.heaps.lock();
        let device = &self.device.device;

        for write in writes {
            let index = entry
                .bindings
                .iter()
                .position(|b| b.binding == write.binding)
                .with_context(|| format!("Descriptor set has no binding {}", write.binding))?;
            let base = entry.table_offsets[index];

            let (sources, heap_type) = match &write.resources {
                BoundResources::Buffers(keys) => {
                    let handles = keys
                        .iter()
                        .map(|&k| {
                            let views = registry.buffers.get(k).context("Unknown buffer in descriptor write")?.views;
                            match write.ty {
                                DescriptorType::UniformBufferCbv => views.cbv,
                                DescriptorType::StorageBufferSrv | DescriptorType::UniformTexelBufferSrv => views.srv,
                                _ => views.uav,
                            }
                            .with_context(|| format!("Buffer has no view for {:?}", write.ty))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    (handles, D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV)
                }
                BoundResources::Textures(keys) => {
                    let handles = keys
                        .iter()
                        .map(|&k| {
                            let views = registry.textures.get(k).context("Unknown texture in descriptor write")?.views;
                            match write.ty {
                                DescriptorType::TextureUav => views.uav,
                                _ => views.srv,
                            }
                            .with_context(|| format!("Texture has no view for {:?}", write.ty))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    (handles, D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV)
                }
                BoundResources::Samplers(keys) => {
                    let handles = keys
                        .iter()
                        .map(|&k| registry.samplers.get(k).copied().context("Unknown sampler in descriptor write"))
                        .collect::<Result<Vec<_>>>()?;
                    (handles, D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER)
                }
            };

            let (range, heap) = if heap_type == D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER {
                (entry.samplers, &heaps.shader_samplers)
            } else {
                (entry.views, &heaps.shader_views)
            };
            let range = range.context("Descriptor set has no table for this binding")?;
            for (i, source) in sources.into_iter().enumerate() {
                let dst = heap.cpu(range.offset + base + i as u32);
                unsafe { device.CopyDescriptorsSimple(1, dst, source, heap_type) };
            }
        }
        Ok(())
    }

    pub(super) fn create_render_target_impl(
        &self,
        render_pass: RenderPassKey,
        attachments: &RenderTargetAttachments,
    ) -> Result<RenderTargetKey> {
        let mut registry = self.registry.lock();
        registry.render_passes.get(render_pass).context("Unknown render pass")?;
        for &key in attachments.colors.iter().chain(&attachments.resolves) {
            let texture = registry.textures.get(key).context("Unknown render target attachment")?;
            if texture.views.rtv.is_none() {
                bail!("Color attachment {:?} has no render target view", key);
            }
        }
        if let Some(key) = attachments.depth_stencil {
            let texture = registry.textures.get(key).context("Unknown depth-stencil attachment")?;
            if texture.views.dsv.is_none() {
                bail!("Depth-stencil attachment {:?} has no depth-stencil view", key);
            }
        }
        Ok(registry.render_targets.insert(RenderTargetEntry {
            width: attachments.width,
            height: attachments.height,
            colors: attachments.colors.clone(),
            resolves: attachments.resolves.clone(),
            depth_stencil: attachments.depth_stencil,
        }))
    }

    /// Root signature for `set`, plus the root parameter index of each table
    fn create_root_signature(
        &self,
        set: Option<&DescriptorSetEntry>,
        graphics: bool,
    ) -> Result<(ID3D12RootSignature, Option<u32>, Option<u32>)> {
        let mut parameters = Vec::new();
        let mut tables = [None, None];
        if let Some(set) = set {
            for (slot, ranges) in [&set.view_ranges, &set.sampler_ranges].into_iter().enumerate() {
                if ranges.is_empty() {
                    continue;
                }
                tables[slot] = Some(parameters.len() as u32);
                parameters.push(D3D12_ROOT_PARAMETER {
                    ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
                    Anonymous: D3D12_ROOT_PARAMETER_0 {
                        DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                            NumDescriptorRanges: ranges.len() as u32,
                            pDescriptorRanges: ranges.as_ptr(),
                        },
                    },
                    ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
                });
            }
        }

        let desc = D3D12_ROOT_SIGNATURE_DESC {
            NumParameters: parameters.len() as u32,
            pParameters: if parameters.is_empty() {
                std::ptr::null()
            } else {
                parameters.as_ptr()
            },
            NumStaticSamplers: 0,
            pStaticSamplers: std::ptr::null(),
            Flags: if graphics {
                D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT
            } else {
                D3D12_ROOT_SIGNATURE_FLAG_NONE
            },
        };

        let mut blob: Option<ID3DBlob> = None;
        let mut errors: Option<ID3DBlob> = None;
        if let Err(e) =
            unsafe { D3D12SerializeRootSignature(&desc, D3D_ROOT_SIGNATURE_VERSION_1, &mut blob, Some(&mut errors)) }
        {
            let log = errors
                .as_ref()
                .map(|b| String::from_utf8_lossy(blob_bytes(b)).into_owned())
                .unwrap_or_default();
            bail!("Failed to serialize root signature ({}): {}", e, log);
        }
        let blob = blob.context("Root signature serialization produced no blob")?;
        let root_signature: ID3D12RootSignature = unsafe { self.device.device.CreateRootSignature(0, blob_bytes(&blob)) }
            .context("Failed to create root signature")?;
        Ok((root_signature, tables[0], tables[1]))
    }

    pub(super) fn create_graphics_pipeline_impl(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<PipelineKey> {
        let registry = self.registry.lock();
        let pass = registry.render_passes.get(desc.render_pass).context("Unknown render pass")?;
        let stages = registry.shaders.get(desc.shader).context("Unknown shader program")?;
        if stages.iter().any(|s| s.stage == ShaderStages::COMP) {
            bail!("A compute shader cannot be used in a graphics pipeline");
        }
        let set = match desc.descriptor_set {
            Some(key) => Some(registry.descriptor_sets.get(key).context("Unknown descriptor set")?),
            None => None,
        };
        let (root_signature, view_table, sampler_table) = self.create_root_signature(set, true)?;

        let settings = desc.settings;
        let input_elements: Vec<D3D12_INPUT_ELEMENT_DESC> = desc
            .vertex_layout
            .attributes
            .iter()
            .map(|attr| {
                let (name, index) = attr.semantic.hlsl();
                D3D12_INPUT_ELEMENT_DESC {
                    SemanticName: PCSTR(conv::semantic_name(name).as_ptr()),
                    SemanticIndex: index,
                    Format: conv::format(attr.format),
                    InputSlot: attr.binding,
                    AlignedByteOffset: attr.offset,
                    InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
                    InstanceDataStepRate: 0,
                }
            })
            .collect();

        let mut blend = D3D12_BLEND_DESC {
            AlphaToCoverageEnable: false.into(),
            IndependentBlendEnable: true.into(),
            RenderTarget: [conv::blend(crate::types::BlendMode::Opaque); 8],
        };
        let mut rtv_formats = [DXGI_FORMAT_UNKNOWN; 8];
        for (i, &format) in pass.color_formats.iter().enumerate() {
            rtv_formats[i] = conv::format(format);
            blend.RenderTarget[i] = conv::blend(settings.blend_mode(i));
        }
        let has_depth = pass.has_depth_stencil();

        let pso_desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC {
            // borrowed without AddRef; ManuallyDrop keeps it from being released
            pRootSignature: unsafe { std::mem::transmute_copy(&root_signature) },
            VS: bytecode(stages, ShaderStages::VERT),
            PS: bytecode(stages, ShaderStages::FRAG),
            DS: bytecode(stages, ShaderStages::TESE),
            HS: bytecode(stages, ShaderStages::TESC),
            GS: bytecode(stages, ShaderStages::GEOM),
            BlendState: blend,
            SampleMask: u32::MAX,
            RasterizerState: D3D12_RASTERIZER_DESC {
                FillMode: D3D12_FILL_MODE_SOLID,
                CullMode: conv::cull_mode(settings.cull_mode),
                FrontCounterClockwise: (settings.front_face == FrontFace::CounterClockwise).into(),
                DepthClipEnable: true.into(),
                ..Default::default()
            },
            DepthStencilState: D3D12_DEPTH_STENCIL_DESC {
                DepthEnable: (has_depth && settings.depth_test).into(),
                DepthWriteMask: if has_depth && settings.depth_write {
                    D3D12_DEPTH_WRITE_MASK_ALL
                } else {
                    D3D12_DEPTH_WRITE_MASK_ZERO
                },
                DepthFunc: D3D12_COMPARISON_FUNC_LESS_EQUAL,
                ..Default::default()
            },
            InputLayout: D3D12_INPUT_LAYOUT_DESC {
                pInputElementDescs: if input_elements.is_empty() {
                    std::ptr::null()
                } else {
                    input_elements.as_ptr()
                },
                NumElements: input_elements.len() as u32,
            },
            PrimitiveTopologyType: conv::topology_type(settings.topology),
            NumRenderTargets: pass.color_formats.len() as u32,
            RTVFormats: rtv_formats,
            DSVFormat: if has_depth {
                conv::depth_formats(pass.depth_stencil_format).1
            } else {
                DXGI_FORMAT_UNKNOWN
            },
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: pass.sample_count.max(1),
                Quality: 0,
            },
            ..Default::default()
        };

        let result = unsafe { self.device.device.CreateGraphicsPipelineState::<ID3D12PipelineState>(&pso_desc) };
        let pipeline = result.context("Failed to create graphics pipeline")?;
        let topology = conv::topology(settings.topology, settings.tessellation_patch_size);
        drop(registry);

        Ok(self.registry.lock().pipelines.insert(PipelineEntry {
            pipeline,
            root_signature,
            compute: false,
            topology,
            view_table,
            sampler_table,
        }))
    }

    pub(super) fn create_compute_pipeline_impl(
        &self,
        shader: ShaderKey,
        descriptor_set: Option<DescriptorSetKey>,
    ) -> Result<PipelineKey> {
        let registry = self.registry.lock();
        let stages = registry.shaders.get(shader).context("Unknown shader program")?;
        if !stages.iter().any(|s| s.stage == ShaderStages::COMP) {
            bail!("Shader program has no compute stage");
        }
        let set = match descriptor_set {
            Some(key) => Some(registry.descriptor_sets.get(key).context("Unknown descriptor set")?),
            None => None,
        };
        let (root_signature, view_table, sampler_table) = self.create_root_signature(set, false)?;

        let pso_desc = D3D12_COMPUTE_PIPELINE_STATE_DESC {
            pRootSignature: unsafe { std::mem::transmute_copy(&root_signature) },
            CS: bytecode(stages, ShaderStages::COMP),
            ..Default::default()
        };
        let result = unsafe { self.device.device.CreateComputePipelineState::<ID3D12PipelineState>(&pso_desc) };
        let pipeline = result.context("Failed to create compute pipeline")?;
        drop(registry);

        Ok(self.registry.lock().pipelines.insert(PipelineEntry {
            pipeline,
            root_signature,
            compute: true,
            topology: D3D_PRIMITIVE_TOPOLOGY_UNDEFINED,
            view_table,
            sampler_table,
        }))
    }
}
