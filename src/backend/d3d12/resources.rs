// Committed buffers and textures, their staging views, and samplers

use anyhow::{bail, Context, Result};
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use super::{conv, BufferEntry, D3D12Backend, TextureEntry, Views};
use crate::backend::{BufferAllocation, BufferKey, SamplerKey, TextureAllocation, TextureKey};
use crate::resource::{BufferDesc, SamplerDesc, TextureDesc};
use crate::types::{BufferUsage, ClearValue, MemoryLocation, TextureType, TextureUsage};

/// D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING
const IDENTITY_MAPPING: u32 = 0x1688;

fn heap_properties(ty: D3D12_HEAP_TYPE) -> D3D12_HEAP_PROPERTIES {
    D3D12_HEAP_PROPERTIES {
        Type: ty,
        CPUPageProperty: D3D12_CPU_PAGE_PROPERTY_UNKNOWN,
        MemoryPoolPreference: D3D12_MEMORY_POOL_UNKNOWN,
        CreationNodeMask: 1,
        VisibleNodeMask: 1,
    }
}

impl D3D12Backend {
    fn create_committed(
        &self,
        heap: D3D12_HEAP_TYPE,
        desc: &D3D12_RESOURCE_DESC,
        state: D3D12_RESOURCE_STATES,
        clear: Option<&D3D12_CLEAR_VALUE>,
    ) -> Result<ID3D12Resource> {
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device.device.CreateCommittedResource(
                &heap_properties(heap),
                D3D12_HEAP_FLAG_NONE,
                desc,
                state,
                clear.map(|c| c as *const _),
                &mut resource,
            )
        }
        .context("CreateCommittedResource failed")?;
        resource.context("CreateCommittedResource returned no resource")
    }

    pub(super) fn create_buffer_impl(&self, desc: &BufferDesc) -> Result<BufferAllocation> {
        let uav_usage = BufferUsage::STORAGE_UAV | BufferUsage::STORAGE_TEXEL_UAV;
        let (heap, state) = match desc.location {
            MemoryLocation::GpuOnly => (D3D12_HEAP_TYPE_DEFAULT, D3D12_RESOURCE_STATE_COMMON),
            MemoryLocation::CpuToGpu => (D3D12_HEAP_TYPE_UPLOAD, D3D12_RESOURCE_STATE_GENERIC_READ),
            MemoryLocation::GpuToCpu => (D3D12_HEAP_TYPE_READBACK, D3D12_RESOURCE_STATE_COPY_DEST),
        };
        if desc.usage.intersects(uav_usage) && heap != D3D12_HEAP_TYPE_DEFAULT {
            bail!("Unordered-access buffers must live in GPU-only memory on D3D12");
        }

        let resource_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Alignment: 0,
            Width: desc.size,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            Flags: if desc.usage.intersects(uav_usage) {
                D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS
            } else {
                D3D12_RESOURCE_FLAG_NONE
            },
        };
        let resource = self.create_committed(heap, &resource_desc, state, None)?;

        let mapped = if heap == D3D12_HEAP_TYPE_DEFAULT {
            None
        } else {
            let mut ptr = std::ptr::null_mut();
            unsafe { resource.Map(0, None, Some(&mut ptr)) }.context("Failed to map buffer")?;
            NonNull::new(ptr.cast::<u8>())
        };

        let views = self.create_buffer_views(&resource, desc)?;
        let key = self.registry.lock().buffers.insert(BufferEntry {
            resource,
            pinned_state: heap != D3D12_HEAP_TYPE_DEFAULT,
            views,
        });
        log::debug!("Created buffer {:?}: {} bytes, {:?}", key, desc.size, desc.usage);
        Ok(BufferAllocation { key, mapped })
    }

    fn create_buffer_views(&self, resource: &ID3D12Resource, desc: &BufferDesc) -> Result<Views> {
        let device = &self.device.device;
        let mut heaps = self.heaps.lock();
        let mut views = Views::default();

        if desc.usage.contains(BufferUsage::UNIFORM_CBV) {
            let handle = heaps.views.alloc()?;
            let cbv = D3D12_CONSTANT_BUFFER_VIEW_DESC {
                BufferLocation: unsafe { resource.GetGPUVirtualAddress() },
                SizeInBytes: desc.size as u32,
            };
            unsafe { device.CreateConstantBufferView(Some(&cbv), handle) };
            views.cbv = Some(handle);
        }

        // (format, stride, flags) shared by the SRV and UAV
        let element = |texel: bool| -> (DXGI_FORMAT, u32, bool) {
            if texel {
                (conv::format(desc.format), 0, false)
            } else if desc.raw {
                (DXGI_FORMAT_R32_TYPELESS, 0, true)
            } else {
                (DXGI_FORMAT_UNKNOWN, desc.struct_stride, false)
            }
        };
        let element_count = |stride: u64| {
            if desc.element_count > 0 {
                desc.element_count
            } else {
                desc.size / stride.max(1)
            }
        };

        let srv_usage = BufferUsage::STORAGE_SRV | BufferUsage::UNIFORM_TEXEL_SRV;
        if desc.usage.intersects(srv_usage) {
            let texel = desc.usage.contains(BufferUsage::UNIFORM_TEXEL_SRV);
            let (format, stride, raw) = element(texel);
            let byte_stride = if texel { desc.format.stride() } else if raw { 4 } else { stride };
            let handle = heaps.views.alloc()?;
            let srv = D3D12_SHADER_RESOURCE_VIEW_DESC {
                Format: format,
                ViewDimension: D3D12_SRV_DIMENSION_BUFFER,
                Shader4ComponentMapping: IDENTITY_MAPPING,
                Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                    Buffer: D3D12_BUFFER_SRV {
                        FirstElement: desc.first_element,
                        NumElements: element_count(byte_stride as u64) as u32,
                        StructureByteStride: stride,
                        Flags: if raw { D3D12_BUFFER_SRV_FLAG_RAW } else { D3D12_BUFFER_SRV_FLAG_NONE },
                    },
                },
            };
            unsafe { device.CreateShaderResourceView(resource, Some(&srv), handle) };
            views.srv = Some(handle);
        }

        let uav_usage = BufferUsage::STORAGE_UAV | BufferUsage::STORAGE_TEXEL_UAV;
        if desc.usage.intersects(uav_usage) {
            let texel = desc.usage.contains(BufferUsage::STORAGE_TEXEL_UAV);
            let (format, stride, raw) = element(texel);
            let byte_stride = if texel { desc.format.stride() } else if raw { 4 } else { stride };
            let handle = heaps.views.alloc()?;
            let uav = D3D12_UNORDERED_ACCESS_VIEW_DESC {
                Format: format,
                ViewDimension: D3D12_UAV_DIMENSION_BUFFER,
                Anonymous: D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                    Buffer: D3D12_BUFFER_UAV {
                        FirstElement: desc.first_element,
                        NumElements: element_count(byte_stride as u64) as u32,
                        StructureByteStride: stride,
                        CounterOffsetInBytes: 0,
                        Flags: if raw { D3D12_BUFFER_UAV_FLAG_RAW } else { D3D12_BUFFER_UAV_FLAG_NONE },
                    },
                },
            };
            unsafe { device.CreateUnorderedAccessView(resource, None, Some(&uav), handle) };
            views.uav = Some(handle);
        }

        Ok(views)
    }

    fn free_views(&self, views: &Views) {
        let mut heaps = self.heaps.lock();
        for handle in [views.cbv, views.srv, views.uav].into_iter().flatten() {
            heaps.views.free(handle);
        }
        if let Some(handle) = views.rtv {
            heaps.rtv.free(handle);
        }
        if let Some(handle) = views.dsv {
            heaps.dsv.free(handle);
        }
    }

    pub(super) fn destroy_buffer_impl(&self, key: BufferKey) {
        let Some(entry) = self.registry.lock().buffers.remove(key) else { return };
        self.free_views(&entry.views);
        if entry.pinned_state {
            unsafe { entry.resource.Unmap(0, None) };
        }
    }

    pub(super) fn create_texture_impl(&self, desc: &TextureDesc) -> Result<TextureAllocation> {
        if desc.host_visible {
            bail!("Host-visible textures are not supported on D3D12");
        }
        let (resource_format, dsv_format, srv_format) = if desc.format.is_depth() {
            let formats = conv::depth_formats(desc.format);
            if desc.usage.contains(TextureUsage::SAMPLED_IMAGE) {
                formats
            } else {
                (formats.1, formats.1, formats.2)
            }
        } else {
            let f = conv::format(desc.format);
            (f, f, f)
        };
        if resource_format == DXGI_FORMAT_UNKNOWN {
            bail!("Format {} has no DXGI equivalent", desc.format);
        }

        let mut flags = D3D12_RESOURCE_FLAG_NONE;
        if desc.usage.intersects(TextureUsage::COLOR_ATTACHMENT | TextureUsage::RESOLVE_SRC) {
            flags |= D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
        }
        if desc.usage.contains(TextureUsage::DEPTH_STENCIL_ATTACHMENT) {
            flags |= D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL;
        }
        if desc.usage.contains(TextureUsage::STORAGE_IMAGE) {
            flags |= D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS;
        }

        let (dimension, height, depth) = match desc.texture_type {
            TextureType::Tex1D => (D3D12_RESOURCE_DIMENSION_TEXTURE1D, 1, 1),
            TextureType::Tex2D => (D3D12_RESOURCE_DIMENSION_TEXTURE2D, desc.height, 1),
            TextureType::Tex3D => (D3D12_RESOURCE_DIMENSION_TEXTURE3D, desc.height, desc.depth),
        };
        let mip_levels = desc.mip_levels.max(1);
        let sample_count = desc.sample_count.max(1);
        let resource_desc = D3D12_RESOURCE_DESC {
            Dimension: dimension,
            Alignment: 0,
            Width: desc.width as u64,
            Height: height,
            DepthOrArraySize: depth as u16,
            MipLevels: mip_levels as u16,
            Format: resource_format,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: sample_count,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: flags,
        };

        let clear = if flags.contains(D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL) {
            let (depth, stencil) = desc.clear_value.depth_stencil();
            Some(D3D12_CLEAR_VALUE {
                Format: dsv_format,
                Anonymous: D3D12_CLEAR_VALUE_0 {
                    DepthStencil: D3D12_DEPTH_STENCIL_VALUE {
                        Depth: depth,
                        Stencil: stencil as u8,
                    },
                },
            })
        } else if flags.contains(D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET) {
            Some(D3D12_CLEAR_VALUE {
                Format: resource_format,
                Anonymous: D3D12_CLEAR_VALUE_0 {
                    Color: match desc.clear_value {
                        ClearValue::Color(rgba) => rgba,
                        ClearValue::DepthStencil { .. } => [0.0; 4],
                    },
                },
            })
        } else {
            None
        };

        let resource = self.create_committed(
            D3D12_HEAP_TYPE_DEFAULT,
            &resource_desc,
            D3D12_RESOURCE_STATE_COMMON,
            clear.as_ref(),
        )?;
        let views = self.create_texture_views(&resource, desc, dsv_format, srv_format)?;

        let key = self.registry.lock().textures.insert(TextureEntry {
            resource,
            format: desc.format,
            views,
            swapchain: false,
        });
        log::debug!(
            "Created texture {:?}: {}x{}x{} {}",
            key,
            desc.width,
            height,
            depth,
            desc.format
        );
        Ok(TextureAllocation { key, mapped: None })
    }

    fn create_texture_views(
        &self,
        resource: &ID3D12Resource,
        desc: &TextureDesc,
        dsv_format: DXGI_FORMAT,
        srv_format: DXGI_FORMAT,
    ) -> Result<Views> {
        let device = &self.device.device;
        let mut heaps = self.heaps.lock();
        let mut views = Views::default();
        let mip_levels = desc.mip_levels.max(1);
        let multisampled = desc.sample_count > 1;

        if desc.usage.contains(TextureUsage::SAMPLED_IMAGE) {
            let (dimension, anonymous) = match (desc.texture_type, multisampled) {
                (TextureType::Tex1D, _) => (
                    D3D12_SRV_DIMENSION_TEXTURE1D,
                    D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                        Texture1D: D3D12_TEX1D_SRV {
                            MostDetailedMip: 0,
                            MipLevels: mip_levels,
                            ResourceMinLODClamp: 0.0,
                        },
                    },
                ),
                (TextureType::Tex2D, true) => (
                    D3D12_SRV_DIMENSION_TEXTURE2DMS,
                    D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                        Texture2DMS: D3D12_TEX2DMS_SRV {
                            UnusedField_NothingToDefine: 0,
                        },
                    },
                ),
                (TextureType::Tex2D, false) => (
                    D3D12_SRV_DIMENSION_TEXTURE2D,
                    D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                        Texture2D: D3D12_TEX2D_SRV {
                            MostDetailedMip: 0,
                            MipLevels: mip_levels,
                            PlaneSlice: 0,
                            ResourceMinLODClamp: 0.0,
                        },
                    },
                ),
                (TextureType::Tex3D, _) => (
                    D3D12_SRV_DIMENSION_TEXTURE3D,
                    D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                        Texture3D: D3D12_TEX3D_SRV {
                            MostDetailedMip: 0,
                            MipLevels: mip_levels,
                            ResourceMinLODClamp: 0.0,
                        },
                    },
                ),
            };
            let handle = heaps.views.alloc()?;
            let srv = D3D12_SHADER_RESOURCE_VIEW_DESC {
                Format: srv_format,
                ViewDimension: dimension,
                Shader4ComponentMapping: IDENTITY_MAPPING,
                Anonymous: anonymous,
            };
            unsafe { device.CreateShaderResourceView(resource, Some(&srv), handle) };
            views.srv = Some(handle);
        }

        if desc.usage.contains(TextureUsage::STORAGE_IMAGE) {
            let (dimension, anonymous) = match desc.texture_type {
                TextureType::Tex1D => (
                    D3D12_UAV_DIMENSION_TEXTURE1D,
                    D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                        Texture1D: D3D12_TEX1D_UAV { MipSlice: 0 },
                    },
                ),
                TextureType::Tex2D => (
                    D3D12_UAV_DIMENSION_TEXTURE2D,
                    D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                        Texture2D: D3D12_TEX2D_UAV {
                            MipSlice: 0,
                            PlaneSlice: 0,
                        },
                    },
                ),
                TextureType::Tex3D => (
                    D3D12_UAV_DIMENSION_TEXTURE3D,
                    D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                        Texture3D: D3D12_TEX3D_UAV {
                            MipSlice: 0,
                            FirstWSlice: 0,
                            WSize: desc.depth.max(1),
                        },
                    },
                ),
            };
            let handle = heaps.views.alloc()?;
            let uav = D3D12_UNORDERED_ACCESS_VIEW_DESC {
                Format: srv_format,
                ViewDimension: dimension,
                Anonymous: anonymous,
            };
            unsafe { device.CreateUnorderedAccessView(resource, None, Some(&uav), handle) };
            views.uav = Some(handle);
        }

        if desc.usage.intersects(TextureUsage::COLOR_ATTACHMENT | TextureUsage::RESOLVE_SRC) {
            let handle = heaps.rtv.alloc()?;
            unsafe { device.CreateRenderTargetView(resource, None, handle) };
            views.rtv = Some(handle);
        }

        if desc.usage.contains(TextureUsage::DEPTH_STENCIL_ATTACHMENT) {
            let handle = heaps.dsv.alloc()?;
            let dsv = D3D12_DEPTH_STENCIL_VIEW_DESC {
                Format: dsv_format,
                ViewDimension: if multisampled {
                    D3D12_DSV_DIMENSION_TEXTURE2DMS
                } else {
                    D3D12_DSV_DIMENSION_TEXTURE2D
                },
                Flags: D3D12_DSV_FLAG_NONE,
                Anonymous: if multisampled {
                    D3D12_DEPTH_STENCIL_VIEW_DESC_0 {
                        Texture2DMS: D3D12_TEX2DMS_DSV {
                            UnusedField_NothingToDefine: 0,
                        },
                    }
                } else {
                    D3D12_DEPTH_STENCIL_VIEW_DESC_0 {
                        Texture2D: D3D12_TEX2D_DSV { MipSlice: 0 },
                    }
                },
            };
            unsafe { device.CreateDepthStencilView(resource, Some(&dsv), handle) };
            views.dsv = Some(handle);
        }

        Ok(views)
    }

    pub(super) fn destroy_texture_impl(&self, key: TextureKey) {
        let mut registry = self.registry.lock();
        if registry.textures.get(key).is_some_and(|t| t.swapchain) {
            return;
        }
        let Some(entry) = registry.textures.remove(key) else { return };
        drop(registry);
        self.free_views(&entry.views);
    }

    /// Wrap the swapchain's buffers so render targets can reference them
    pub(super) fn register_swapchain_images(&self) -> Result<Vec<TextureKey>> {
        let mut keys = Vec::with_capacity(self.swapchain.buffers.len());
        for buffer in &self.swapchain.buffers {
            let handle = self.heaps.lock().rtv.alloc()?;
            unsafe { self.device.device.CreateRenderTargetView(buffer, None, handle) };
            keys.push(self.registry.lock().textures.insert(TextureEntry {
                resource: buffer.clone(),
                format: self.swapchain.format,
                views: Views {
                    rtv: Some(handle),
                    ..Views::default()
                },
                swapchain: true,
            }));
        }
        Ok(keys)
    }

    pub(super) fn create_sampler_impl(&self, desc: &SamplerDesc) -> Result<SamplerKey> {
        if desc.max_anisotropy < 0.0 {
            bail!("Negative max anisotropy {}", desc.max_anisotropy);
        }
        let anisotropy = (desc.max_anisotropy as u32).min(D3D12_MAX_MAXANISOTROPY);
        let sampler = D3D12_SAMPLER_DESC {
            Filter: conv::filter(desc.min_filter, desc.mag_filter, desc.mipmap_mode, anisotropy > 0),
            AddressU: conv::address_mode(desc.address_u),
            AddressV: conv::address_mode(desc.address_v),
            AddressW: conv::address_mode(desc.address_w),
            MipLODBias: desc.mip_lod_bias,
            MaxAnisotropy: anisotropy.max(1),
            ComparisonFunc: D3D12_COMPARISON_FUNC_NEVER,
            BorderColor: [0.0; 4],
            MinLOD: 0.0,
            MaxLOD: f32::MAX,
        };
        let handle = self.heaps.lock().samplers.alloc()?;
        unsafe { self.device.device.CreateSampler(&sampler, handle) };
        Ok(self.registry.lock().samplers.insert(handle))
    }
}

/// Transition barrier over every subresource
pub(super) fn transition_barrier(
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: unsafe { std::mem::transmute_copy(resource) },
                StateBefore: before,
                StateAfter: after,
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
            }),
        },
    }
}

pub(super) fn uav_barrier(resource: &ID3D12Resource) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_UAV,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            UAV: ManuallyDrop::new(D3D12_RESOURCE_UAV_BARRIER {
                pResource: unsafe { std::mem::transmute_copy(resource) },
            }),
        },
    }
}
