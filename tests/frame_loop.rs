// Frame loop on the headless backend: slot cycling, presentation order and a
// full triangle frame sequence

mod common;

use common::{headless_renderer, triangle_shader, uniform_set};
use tiny_renderer::api;
use tiny_renderer::backend::headless::{encode_color, DrawKind};
use tiny_renderer::{
    ClearValue, CommandBuffer, DescriptorUpdate, Format, IndexType, PipelineSettings, QueueKind, Renderer,
    ResourceState, VertexLayout, VertexSemantic,
};

#[test]
fn frame_slots_cycle_with_swapchain_length() {
    let (renderer, log) = headless_renderer(64, 64, 3);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmds = api::create_cmd_n(&pool, renderer.image_count() as usize).unwrap();

    for frame in 0..7u64 {
        assert_eq!(renderer.frame_index() as u64, frame % 3);
        let cmd = &mut cmds[renderer.frame_index() as usize];
        renderer.begin_frame(cmd).unwrap();
        renderer.end_frame(cmd).unwrap();
    }

    assert_eq!(renderer.frame_count(), 7);
    let headless = renderer.headless().unwrap();
    assert_eq!(headless.presented_images(), vec![0, 1, 2, 0, 1, 2, 0]);
    assert!(renderer.violations().is_empty(), "{:?}", renderer.violations());
    assert!(log.errors().is_empty(), "{:?}", log.errors());
}

#[test]
fn slot_fence_is_signaled_again_after_the_frame() {
    let (renderer, _log) = headless_renderer(32, 32, 2);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();

    renderer.begin_frame(&mut cmd).unwrap();
    renderer.end_frame(&mut cmd).unwrap();

    // present waited on the render-complete semaphore, so the frame has retired
    assert!(renderer.frame_sync(0).render_complete_fence.is_signaled().unwrap());
    assert_eq!(renderer.headless().unwrap().pending_submissions(), 0);
}

#[test]
fn triangle_frames_render_without_findings() {
    let (renderer, log) = headless_renderer(48, 32, 2);
    let clear = ClearValue::Color([0.0, 0.5, 1.0, 1.0]);

    let vertices: [f32; 15] = [0.0, -0.5, 1.0, 0.0, 0.0, 0.5, 0.5, 0.0, 1.0, 0.0, -0.5, 0.5, 0.0, 0.0, 1.0];
    let vertex_buffer = api::create_vertex_buffer(&renderer, 60, true, 20).unwrap();
    vertex_buffer.write(0, &vertices).unwrap();
    api::util_transition_buffer(&renderer, &vertex_buffer, ResourceState::Undefined, ResourceState::VertexBuffer)
        .unwrap();

    let mut uniforms = Vec::new();
    let mut sets = Vec::new();
    for _ in 0..renderer.image_count() {
        let buffer = api::create_uniform_buffer(&renderer, 64, true).unwrap();
        api::util_transition_buffer(&renderer, &buffer, ResourceState::Undefined, ResourceState::UniformBuffer)
            .unwrap();
        let mut set = uniform_set(&renderer);
        api::update_descriptor_set(&mut set, &[DescriptorUpdate::buffers(0, &[&buffer])]).unwrap();
        uniforms.push(buffer);
        sets.push(set);
    }

    let shader = triangle_shader(&renderer);
    let layout = VertexLayout::interleaved(&[
        (VertexSemantic::Position, Format::R32G32Float),
        (VertexSemantic::Color, Format::R32G32B32Float),
    ]);
    let pipeline = api::create_pipeline(
        &renderer,
        &shader,
        &layout,
        Some(&sets[0]),
        renderer.swapchain_render_target(0),
        &PipelineSettings::default(),
    )
    .unwrap();

    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmds = api::create_cmd_n(&pool, 2).unwrap();

    for frame in 0..4u32 {
        let slot = renderer.frame_index() as usize;
        let image = api::acquire_next_image(&renderer).unwrap();
        assert_eq!(image, frame % 2);

        uniforms[slot].write(0, &[frame as f32; 16]).unwrap();

        let target = renderer.current_render_target();
        let cmd = &mut cmds[slot];
        api::begin_cmd(cmd).unwrap();
        api::cmd_render_target_transition(cmd, target, ResourceState::Present, ResourceState::ColorAttachment);
        api::cmd_begin_render(cmd, target);
        api::cmd_set_viewport(cmd, 0.0, 0.0, 48.0, 32.0, 0.0, 1.0);
        api::cmd_set_scissor(cmd, 0, 0, 48, 32);
        api::cmd_clear_color_attachment(cmd, 0, clear);
        api::cmd_bind_pipeline(cmd, &pipeline);
        api::cmd_bind_descriptor_sets(cmd, &pipeline, &sets[slot]);
        api::cmd_bind_vertex_buffers(cmd, &[&vertex_buffer]);
        api::cmd_draw(cmd, 3, 0);
        api::cmd_end_render(cmd);
        api::cmd_render_target_transition(cmd, target, ResourceState::ColorAttachment, ResourceState::Present);
        api::end_cmd(cmd).unwrap();

        let sync = renderer.current_frame_sync();
        api::queue_submit(
            &renderer,
            &mut [cmd],
            &[&sync.image_acquired_semaphore],
            &[&sync.render_complete_semaphore],
        )
        .unwrap();
        api::queue_present(&renderer, &[&sync.render_complete_semaphore]).unwrap();
    }
    api::queue_wait_idle(&renderer).unwrap();

    let headless = renderer.headless().unwrap();
    assert_eq!(headless.presented_images(), vec![0, 1, 0, 1]);

    let draws = headless.draw_log();
    assert_eq!(draws.len(), 4);
    for draw in &draws {
        assert_eq!(draw.kind, DrawKind::Draw { vertex_count: 3, first_vertex: 0 });
        assert_eq!(draw.vertex_buffers, vec![vertex_buffer.key()]);
        assert_eq!(draw.pipeline, pipeline.key());
    }
    assert_eq!(draws[0].descriptor_set, Some(sets[0].key()));
    assert_eq!(draws[1].descriptor_set, Some(sets[1].key()));

    let texel = encode_color(Format::B8G8R8A8Unorm, clear.color());
    assert_eq!(texel, vec![255, 128, 0, 255]);
    for target in renderer.swapchain_render_targets() {
        let image = &target.output_attachments()[0];
        let data = headless.texture_data(image.key()).unwrap();
        assert_eq!(data.len(), 48 * 32 * 4);
        assert!(data.chunks(4).all(|px| px == texel.as_slice()));
        assert_eq!(headless.texture_state(image.key()), Some(ResourceState::Present));
    }

    assert!(renderer.violations().is_empty(), "{:?}", renderer.violations());
    assert!(log.errors().is_empty(), "{:?}", log.errors());
}

#[test]
fn presenting_an_image_left_in_color_attachment_is_reported() {
    let (renderer, log) = headless_renderer(16, 16, 2);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();

    api::acquire_next_image(&renderer).unwrap();
    api::begin_cmd(&mut cmd).unwrap();
    api::cmd_render_target_transition(
        &mut cmd,
        renderer.current_render_target(),
        ResourceState::Present,
        ResourceState::ColorAttachment,
    );
    api::end_cmd(&mut cmd).unwrap();

    let sync = renderer.current_frame_sync();
    api::queue_submit(
        &renderer,
        &mut [&mut cmd],
        &[&sync.image_acquired_semaphore],
        &[&sync.render_complete_semaphore],
    )
    .unwrap();
    api::queue_present(&renderer, &[&sync.render_complete_semaphore]).unwrap();

    assert!(renderer.violations().iter().any(|v| matches!(
        v,
        tiny_renderer::Violation::PresentState {
            image_index: 0,
            state: ResourceState::ColorAttachment
        }
    )));
    assert!(!log.errors_from("validation").is_empty());
    assert!(!log.errors_from("headless").is_empty());
}

/// Record one frame into the current swapchain target, submit and present it
fn render_frame(renderer: &Renderer, cmd: &mut CommandBuffer, record: impl FnOnce(&mut CommandBuffer)) {
    api::acquire_next_image(renderer).unwrap();
    let target = renderer.current_render_target();
    api::begin_cmd(cmd).unwrap();
    api::cmd_render_target_transition(cmd, target, ResourceState::Present, ResourceState::ColorAttachment);
    api::cmd_begin_render(cmd, target);
    record(&mut *cmd);
    api::cmd_end_render(cmd);
    api::cmd_render_target_transition(cmd, target, ResourceState::ColorAttachment, ResourceState::Present);
    api::end_cmd(cmd).unwrap();

    let sync = renderer.current_frame_sync();
    api::queue_submit(
        renderer,
        &mut [cmd],
        &[&sync.image_acquired_semaphore],
        &[&sync.render_complete_semaphore],
    )
    .unwrap();
    api::queue_present(renderer, &[&sync.render_complete_semaphore]).unwrap();
}

#[test]
fn unbound_triangle_pipeline_runs_four_frames_cleanly() {
    let (renderer, log) = headless_renderer(32, 32, 2);
    let clear = ClearValue::Color([0.0, 0.0, 0.0, 0.0]);

    let vertices: [f32; 15] = [0.0, -0.5, 1.0, 0.0, 0.0, 0.5, 0.5, 0.0, 1.0, 0.0, -0.5, 0.5, 0.0, 0.0, 1.0];
    let vertex_buffer = api::create_vertex_buffer(&renderer, 60, true, 20).unwrap();
    vertex_buffer.write(0, &vertices).unwrap();
    api::util_transition_buffer(&renderer, &vertex_buffer, ResourceState::Undefined, ResourceState::VertexBuffer)
        .unwrap();

    let shader = triangle_shader(&renderer);
    let layout = VertexLayout::interleaved(&[
        (VertexSemantic::Position, Format::R32G32Float),
        (VertexSemantic::Color, Format::R32G32B32Float),
    ]);
    let pipeline = api::create_pipeline(
        &renderer,
        &shader,
        &layout,
        None,
        renderer.swapchain_render_target(0),
        &PipelineSettings::default(),
    )
    .unwrap();
    assert!(pipeline.descriptor_bindings().is_empty());

    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmds = api::create_cmd_n(&pool, 2).unwrap();
    for _ in 0..4 {
        let slot = renderer.frame_index() as usize;
        render_frame(&renderer, &mut cmds[slot], |cmd| {
            cmd.set_full_viewport();
            api::cmd_clear_color_attachment(cmd, 0, clear);
            api::cmd_bind_pipeline(cmd, &pipeline);
            api::cmd_bind_vertex_buffers(cmd, &[&vertex_buffer]);
            api::cmd_draw(cmd, 3, 0);
        });
    }
    api::queue_wait_idle(&renderer).unwrap();

    let headless = renderer.headless().unwrap();
    assert_eq!(headless.presented_images(), vec![0, 1, 0, 1]);
    let draws = headless.draw_log();
    assert_eq!(draws.len(), 4);
    assert!(draws.iter().all(|d| d.descriptor_set.is_none()));
    for target in renderer.swapchain_render_targets() {
        let data = headless.texture_data(target.output_attachments()[0].key()).unwrap();
        assert!(data.iter().all(|&b| b == 0));
    }

    assert!(renderer.violations().is_empty(), "{:?}", renderer.violations());
    assert!(log.errors().is_empty(), "{:?}", log.errors());
}

#[test]
fn indexed_draw_reads_the_bound_index_buffer() {
    let (renderer, log) = headless_renderer(16, 16, 2);
    let indices: [u16; 3] = [0, 1, 2];
    let index_buffer = api::create_index_buffer(&renderer, 6, true, IndexType::Uint16).unwrap();
    index_buffer.write(0, &indices).unwrap();
    api::util_transition_buffer(&renderer, &index_buffer, ResourceState::Undefined, ResourceState::IndexBuffer)
        .unwrap();

    let shader = triangle_shader(&renderer);
    let pipeline = api::create_pipeline(
        &renderer,
        &shader,
        &VertexLayout::empty(),
        None,
        renderer.swapchain_render_target(0),
        &PipelineSettings::default(),
    )
    .unwrap();

    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();
    render_frame(&renderer, &mut cmd, |cmd| {
        api::cmd_bind_pipeline(cmd, &pipeline);
        api::cmd_bind_index_buffer(cmd, &index_buffer);
        api::cmd_draw_indexed(cmd, 3, 0);
    });
    api::queue_wait_idle(&renderer).unwrap();

    let draws = renderer.headless().unwrap().draw_log();
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].kind, DrawKind::DrawIndexed { index_count: 3, first_index: 0 });
    assert_eq!(draws[0].index_buffer, Some(index_buffer.key()));
    assert_eq!(index_buffer.index_type(), IndexType::Uint16);
    assert!(renderer.violations().is_empty(), "{:?}", renderer.violations());
    assert!(log.errors().is_empty(), "{:?}", log.errors());
}
