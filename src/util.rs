// Utility operations
//
// Blocking helpers built from the recording API: each records a one-shot
// command buffer on the graphics queue, submits it and waits for the queue
// to drain. Meant for setup and tests, not for the per-frame path.

use anyhow::{bail, Context, Result};
use std::sync::Arc;

use crate::backend::BufferTextureCopy;
use crate::command::{CommandBuffer, CommandPool};
use crate::device::Device;
use crate::format::{ChannelKind, Format};
use crate::queue::Queue;
use crate::renderer::Renderer;
use crate::resource::{Buffer, BufferDesc, Texture};
use crate::types::{align_up, BufferUsage, MemoryLocation, ResourceState, TextureUsage};

/// Record, submit and wait for a single command buffer
pub(crate) fn submit_one_shot<F>(pool: &CommandPool, queue: &Queue, record: F) -> Result<()>
where
    F: FnOnce(&mut CommandBuffer),
{
    let mut cmd = pool.allocate()?;
    cmd.begin()?;
    record(&mut cmd);
    cmd.end()?;
    queue.submit(&mut [&mut cmd], &[], &[], None)?;
    queue.wait_idle()
}

fn one_shot<F>(renderer: &Renderer, record: F) -> Result<()>
where
    F: FnOnce(&mut CommandBuffer),
{
    submit_one_shot(renderer.util_pool(), renderer.graphics_queue(), record)
}

fn staging_buffer(device: &Arc<Device>, size: u64, usage: BufferUsage, location: MemoryLocation) -> Result<Buffer> {
    Buffer::new(device, BufferDesc::new(usage, size, location)).context("Failed to create staging buffer")
}

/// Upload `data` to the start of `buffer`.
///
/// Host-visible buffers are written through their mapping; device-local ones
/// through a staging copy, after which the buffer is returned to the state it
/// was in (or left in `TransferDst` if it had none yet).
pub fn update_buffer(renderer: &Renderer, buffer: &Buffer, data: &[u8]) -> Result<()> {
    if data.len() as u64 > buffer.size() {
        bail!("{} bytes do not fit in a {} byte buffer", data.len(), buffer.size());
    }
    if buffer.is_host_visible() {
        return buffer.write(0, data);
    }

    let staging = staging_buffer(
        renderer.device(),
        data.len() as u64,
        BufferUsage::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
    )?;
    staging.write(0, data)?;

    let old = buffer.state();
    one_shot(renderer, |cmd| {
        if old != ResourceState::TransferDst {
            cmd.buffer_transition(buffer, old, ResourceState::TransferDst);
        }
        cmd.copy_buffer_to_buffer(&staging, 0, buffer, 0, data.len() as u64);
        if old != ResourceState::Undefined && old != ResourceState::TransferDst {
            cmd.buffer_transition(buffer, ResourceState::TransferDst, old);
        }
    })
}

/// Upload 8-bit pixel data into mip 0 of an 8-bit unorm texture.
///
/// Rows are repacked to the device's copy pitch and channels are expanded or
/// truncated to the texture's channel count (missing alpha becomes 255).
/// The texture ends up in `SampledImage` if it had no state yet, otherwise in
/// the state it was in.
pub fn update_texture_uint8(
    renderer: &Renderer,
    texture: &Texture,
    src_width: u32,
    src_height: u32,
    src_row_stride: u32,
    src_data: &[u8],
    src_channel_count: u32,
) -> Result<()> {
    let format = texture.format();
    if format.channel_kind() != Some(ChannelKind::Unorm8) {
        bail!("update_texture_uint8 needs an 8-bit unorm texture, got {}", format);
    }
    if src_width != texture.width() || src_height != texture.height() {
        bail!(
            "Source is {}x{} but texture is {}x{}",
            src_width,
            src_height,
            texture.width(),
            texture.height()
        );
    }
    if src_channel_count == 0 || src_channel_count > 4 {
        bail!("Invalid source channel count {}", src_channel_count);
    }
    let needed = (src_height.saturating_sub(1) * src_row_stride + src_width * src_channel_count) as usize;
    if src_data.len() < needed || src_row_stride < src_width * src_channel_count {
        bail!("Source data too small for {}x{} pixels", src_width, src_height);
    }

    let dst_channels = format.channel_count() as usize;
    let row_pitch = align_up(
        (src_width * format.stride()) as u64,
        renderer.device().limits().texture_row_pitch_alignment,
    ) as u32;
    let packed = pack_rows(
        src_data,
        src_width as usize,
        src_height as usize,
        src_row_stride as usize,
        src_channel_count as usize,
        dst_channels,
        row_pitch as usize,
        format.is_bgra(),
    );

    let staging = staging_buffer(
        renderer.device(),
        packed.len() as u64,
        BufferUsage::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
    )?;
    staging.write(0, &packed)?;

    let old = texture.state();
    let final_state = match old {
        ResourceState::Undefined if texture.usage().contains(TextureUsage::SAMPLED_IMAGE) => ResourceState::SampledImage,
        ResourceState::Undefined => ResourceState::TransferDst,
        state => state,
    };
    one_shot(renderer, |cmd| {
        if old != ResourceState::TransferDst {
            cmd.image_transition(texture, old, ResourceState::TransferDst);
        }
        cmd.copy_buffer_to_texture2d(
            &staging,
            texture,
            BufferTextureCopy {
                buffer_offset: 0,
                row_pitch,
                mip_level: 0,
                width: src_width,
                height: src_height,
            },
        );
        if final_state != ResourceState::TransferDst {
            cmd.image_transition(texture, ResourceState::TransferDst, final_state);
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn pack_rows(
    src: &[u8],
    width: usize,
    height: usize,
    src_row_stride: usize,
    src_channels: usize,
    dst_channels: usize,
    dst_row_pitch: usize,
    swap_red_blue: bool,
) -> Vec<u8> {
    let mut out = vec![0u8; dst_row_pitch * height];
    for y in 0..height {
        let src_row = &src[y * src_row_stride..];
        let dst_row = &mut out[y * dst_row_pitch..];
        for x in 0..width {
            let mut texel = [0u8, 0, 0, 255];
            texel[..src_channels.min(4)].copy_from_slice(&src_row[x * src_channels..x * src_channels + src_channels.min(4)]);
            if swap_red_blue {
                texel.swap(0, 2);
            }
            dst_row[x * dst_channels..(x + 1) * dst_channels].copy_from_slice(&texel[..dst_channels]);
        }
    }
    out
}

pub fn transition_buffer(renderer: &Renderer, buffer: &Buffer, old: ResourceState, new: ResourceState) -> Result<()> {
    one_shot(renderer, |cmd| cmd.buffer_transition(buffer, old, new))
}

pub fn transition_image(renderer: &Renderer, texture: &Texture, old: ResourceState, new: ResourceState) -> Result<()> {
    one_shot(renderer, |cmd| cmd.image_transition(texture, old, new))
}

/// Read a whole buffer back to the host
pub fn read_buffer(renderer: &Renderer, buffer: &Buffer) -> Result<Vec<u8>> {
    if buffer.is_host_visible() {
        renderer.graphics_queue().wait_idle()?;
        return buffer.read(0, buffer.size());
    }

    let readback = staging_buffer(
        renderer.device(),
        buffer.size(),
        BufferUsage::TRANSFER_DST,
        MemoryLocation::GpuToCpu,
    )?;
    let old = buffer.state();
    one_shot(renderer, |cmd| {
        if old != ResourceState::TransferSrc {
            cmd.buffer_transition(buffer, old, ResourceState::TransferSrc);
        }
        cmd.copy_buffer_to_buffer(buffer, 0, &readback, 0, buffer.size());
        if old != ResourceState::Undefined && old != ResourceState::TransferSrc {
            cmd.buffer_transition(buffer, ResourceState::TransferSrc, old);
        }
    })?;
    readback.read(0, buffer.size())
}

/// Read mip 0 of a 2D texture back to the host, tightly packed.
///
/// The texture must carry `TRANSFER_SRC` usage; it is returned to its prior state.
pub fn read_texture(renderer: &Renderer, texture: &Texture) -> Result<Vec<u8>> {
    let stride = texture.format().stride();
    let tight_pitch = texture.width() * stride;
    let row_pitch = align_up(tight_pitch as u64, renderer.device().limits().texture_row_pitch_alignment) as u32;
    let size = row_pitch as u64 * texture.height() as u64;

    let readback = staging_buffer(renderer.device(), size, BufferUsage::TRANSFER_DST, MemoryLocation::GpuToCpu)?;
    let old = texture.state();
    one_shot(renderer, |cmd| {
        if old != ResourceState::TransferSrc {
            cmd.image_transition(texture, old, ResourceState::TransferSrc);
        }
        cmd.copy_texture_to_buffer(
            texture,
            &readback,
            BufferTextureCopy {
                buffer_offset: 0,
                row_pitch,
                mip_level: 0,
                width: texture.width(),
                height: texture.height(),
            },
        );
        if old != ResourceState::Undefined && old != ResourceState::TransferSrc {
            cmd.image_transition(texture, ResourceState::TransferSrc, old);
        }
    })?;

    let raw = readback.read(0, size)?;
    Ok(raw
        .chunks(row_pitch as usize)
        .flat_map(|row| row[..tight_pitch as usize].iter().copied())
        .collect())
}

pub fn format_stride(format: Format) -> u32 {
    format.stride()
}

pub fn format_channel_count(format: Format) -> u32 {
    format.channel_count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_rows_expands_rgb_to_rgba_with_opaque_alpha() {
        let src = [1, 2, 3, 4, 5, 6];
        let out = pack_rows(&src, 2, 1, 6, 3, 4, 8, false);
        assert_eq!(out, vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn pack_rows_pads_rows_and_swaps_for_bgra() {
        let src = [10, 20, 30, 40, /* row pad */ 0, 0, 50, 60, 70, 80];
        let out = pack_rows(&src, 1, 2, 6, 4, 4, 8, true);
        assert_eq!(out, vec![30, 20, 10, 40, 0, 0, 0, 0, 70, 60, 50, 80, 0, 0, 0, 0]);
    }

    #[test]
    fn pack_rows_truncates_to_fewer_channels() {
        let src = [9, 8, 7, 6];
        let out = pack_rows(&src, 1, 1, 4, 4, 1, 1, false);
        assert_eq!(out, vec![9]);
    }
}
