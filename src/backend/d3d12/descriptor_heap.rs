// Descriptor heaps
//
// Views live in CPU-only staging heaps, one slot per view. Descriptor sets
// own a contiguous range of a shader-visible heap and are filled by copying
// from the staging slots.

use anyhow::{bail, Context, Result};
use windows::Win32::Graphics::Direct3D12::*;

pub struct CpuDescriptorHeap {
    _heap: ID3D12DescriptorHeap,
    start: D3D12_CPU_DESCRIPTOR_HANDLE,
    increment: usize,
    capacity: u32,
    next: u32,
    free: Vec<u32>,
}

impl CpuDescriptorHeap {
    pub fn new(device: &ID3D12Device, ty: D3D12_DESCRIPTOR_HEAP_TYPE, capacity: u32) -> Result<Self> {
        let heap: ID3D12DescriptorHeap = unsafe {
            device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: ty,
                NumDescriptors: capacity,
                Flags: D3D12_DESCRIPTOR_HEAP_FLAG_NONE,
                NodeMask: 0,
            })
        }
        .context("Failed to create staging descriptor heap")?;
        let start = unsafe { heap.GetCPUDescriptorHandleForHeapStart() };
        let increment = unsafe { device.GetDescriptorHandleIncrementSize(ty) } as usize;
        Ok(Self {
            _heap: heap,
            start,
            increment,
            capacity,
            next: 0,
            free: Vec::new(),
        })
    }

    pub fn alloc(&mut self) -> Result<D3D12_CPU_DESCRIPTOR_HANDLE> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.next < self.capacity => {
                self.next += 1;
                self.next - 1
            }
            None => bail!("Staging descriptor heap exhausted ({} slots)", self.capacity),
        };
        Ok(D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: self.start.ptr + index as usize * self.increment,
        })
    }

    pub fn free(&mut self, handle: D3D12_CPU_DESCRIPTOR_HANDLE) {
        let index = ((handle.ptr - self.start.ptr) / self.increment) as u32;
        debug_assert!(index < self.next);
        self.free.push(index);
    }
}

/// Shader-visible heap handed out in contiguous ranges
pub struct GpuDescriptorHeap {
    heap: ID3D12DescriptorHeap,
    cpu_start: D3D12_CPU_DESCRIPTOR_HANDLE,
    gpu_start: D3D12_GPU_DESCRIPTOR_HANDLE,
    increment: usize,
    capacity: u32,
    next: u32,
    /// (offset, count), first fit
    free: Vec<(u32, u32)>,
}

impl GpuDescriptorHeap {
    pub fn new(device: &ID3D12Device, ty: D3D12_DESCRIPTOR_HEAP_TYPE, capacity: u32) -> Result<Self> {
        let heap: ID3D12DescriptorHeap = unsafe {
            device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: ty,
                NumDescriptors: capacity,
                Flags: D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE,
                NodeMask: 0,
            })
        }
        .context("Failed to create shader-visible descriptor heap")?;
        let (cpu_start, gpu_start) =
            unsafe { (heap.GetCPUDescriptorHandleForHeapStart(), heap.GetGPUDescriptorHandleForHeapStart()) };
        let increment = unsafe { device.GetDescriptorHandleIncrementSize(ty) } as usize;
        Ok(Self {
            heap,
            cpu_start,
            gpu_start,
            increment,
            capacity,
            next: 0,
            free: Vec::new(),
        })
    }

    pub fn alloc(&mut self, count: u32) -> Result<u32> {
        if let Some(pos) = self.free.iter().position(|&(_, n)| n >= count) {
            let (offset, n) = self.free[pos];
            if n == count {
                self.free.swap_remove(pos);
            } else {
                self.free[pos] = (offset + count, n - count);
            }
            return Ok(offset);
        }
        if self.next + count > self.capacity {
            bail!("Shader-visible descriptor heap exhausted ({} slots)", self.capacity);
        }
        self.next += count;
        Ok(self.next - count)
    }

    pub fn free(&mut self, offset: u32, count: u32) {
        self.free.push((offset, count));
    }

    pub fn cpu(&self, offset: u32) -> D3D12_CPU_DESCRIPTOR_HANDLE {
        D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: self.cpu_start.ptr + offset as usize * self.increment,
        }
    }

    pub fn gpu(&self, offset: u32) -> D3D12_GPU_DESCRIPTOR_HANDLE {
        D3D12_GPU_DESCRIPTOR_HANDLE {
            ptr: self.gpu_start.ptr + (offset as usize * self.increment) as u64,
        }
    }

    pub fn heap(&self) -> &ID3D12DescriptorHeap {
        &self.heap
    }
}

/// Every descriptor heap the backend owns
pub struct Heaps {
    pub rtv: CpuDescriptorHeap,
    pub dsv: CpuDescriptorHeap,
    pub views: CpuDescriptorHeap,
    pub samplers: CpuDescriptorHeap,
    pub shader_views: GpuDescriptorHeap,
    pub shader_samplers: GpuDescriptorHeap,
}

impl Heaps {
    pub fn new(device: &ID3D12Device) -> Result<Self> {
        Ok(Self {
            rtv: CpuDescriptorHeap::new(device, D3D12_DESCRIPTOR_HEAP_TYPE_RTV, 256)?,
            dsv: CpuDescriptorHeap::new(device, D3D12_DESCRIPTOR_HEAP_TYPE_DSV, 64)?,
            views: CpuDescriptorHeap::new(device, D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV, 4096)?,
            samplers: CpuDescriptorHeap::new(device, D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER, 256)?,
            shader_views: GpuDescriptorHeap::new(device, D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV, 8192)?,
            // hardware limit for shader-visible sampler heaps
            shader_samplers: GpuDescriptorHeap::new(device, D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER, 2048)?,
        })
    }
}
