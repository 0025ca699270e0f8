// Compute dispatches and storage states on the headless backend

mod common;

use common::headless_renderer;
use tiny_renderer::api;
use tiny_renderer::backend::headless::DrawKind;
use tiny_renderer::{
    Access, DescriptorBinding, DescriptorSet, DescriptorType, DescriptorUpdate, Format, Pipeline, QueueKind,
    Renderer, ResourceState, ShaderCode, ShaderProgram, ShaderProgramDesc, ShaderStageDesc, ShaderStages,
    TextureUsage, Violation,
};

fn compute_shader(renderer: &Renderer) -> ShaderProgram {
    let source = ShaderCode::Hlsl("RWStructuredBuffer<uint> data : register(u0); [numthreads(64, 1, 1)] void cs_main() {}".to_string());
    api::create_shader_program(renderer, &ShaderProgramDesc::compute(ShaderStageDesc::new(source, "cs_main")))
        .expect("compute program")
}

fn storage_set(renderer: &Renderer) -> DescriptorSet {
    api::create_descriptor_set(
        renderer,
        &[
            DescriptorBinding::new(DescriptorType::StorageBufferUav, 0, ShaderStages::COMP),
            DescriptorBinding::new(DescriptorType::TextureUav, 1, ShaderStages::COMP),
        ],
    )
    .expect("descriptor set")
}

fn dispatch_once(renderer: &Renderer, pipeline: &Pipeline, set: &DescriptorSet) {
    let pool = api::create_cmd_pool(renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();
    api::begin_cmd(&mut cmd).unwrap();
    api::cmd_bind_pipeline(&mut cmd, pipeline);
    api::cmd_bind_descriptor_sets(&mut cmd, pipeline, set);
    api::cmd_dispatch(&mut cmd, 4, 1, 1);
    api::end_cmd(&mut cmd).unwrap();
    api::queue_submit(renderer, &mut [&mut cmd], &[], &[]).unwrap();
    api::queue_wait_idle(renderer).unwrap();
}

#[test]
fn dispatch_writes_storage_resources_only_in_storage_states() {
    let (renderer, log) = headless_renderer(16, 16, 2);
    let buffer = api::create_rw_structured_buffer(&renderer, 256, 0, 64, 4, false, false, false).unwrap();
    let image = api::create_texture_2d(
        &renderer,
        8,
        8,
        1,
        Format::R8G8B8A8Unorm,
        1,
        None,
        TextureUsage::STORAGE_IMAGE,
        false,
        ResourceState::StorageImage,
    )
    .unwrap();
    api::util_transition_buffer(&renderer, &buffer, ResourceState::Undefined, ResourceState::StorageBufferUav).unwrap();

    let mut set = storage_set(&renderer);
    api::update_descriptor_set(
        &mut set,
        &[DescriptorUpdate::buffers(0, &[&buffer]), DescriptorUpdate::textures(1, &[&image])],
    )
    .unwrap();
    let shader = compute_shader(&renderer);
    let pipeline = api::create_compute_pipeline(&renderer, &shader, Some(&set)).unwrap();
    assert!(pipeline.is_compute());

    dispatch_once(&renderer, &pipeline, &set);
    assert!(renderer.violations().is_empty(), "{:?}", renderer.violations());
    assert!(log.errors().is_empty(), "{:?}", log.errors());
    assert_eq!(
        renderer.headless().unwrap().draw_log().last().map(|d| d.kind),
        Some(DrawKind::Dispatch { x: 4, y: 1, z: 1 })
    );

    // read-only view of a buffer the shader writes
    api::util_transition_buffer(&renderer, &buffer, ResourceState::StorageBufferUav, ResourceState::StorageBufferSrv)
        .unwrap();
    dispatch_once(&renderer, &pipeline, &set);
    assert_eq!(
        renderer.violations(),
        vec![Violation::InvalidUse {
            resource: buffer.id(),
            access: Access::ShaderWrite,
            state: ResourceState::StorageBufferSrv,
            operation: "dispatch",
        }]
    );
}

#[test]
fn compute_pipelines_need_a_compute_program() {
    let (renderer, _log) = headless_renderer(16, 16, 2);
    let graphics = common::triangle_shader(&renderer);
    assert!(api::create_compute_pipeline(&renderer, &graphics, None).is_err());

    let compute = compute_shader(&renderer);
    let pipeline = api::create_compute_pipeline(&renderer, &compute, None).unwrap();
    assert!(pipeline.descriptor_bindings().is_empty());
}
