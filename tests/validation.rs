// Shadow state model and pipeline identity, observed through the public API

mod common;

use common::{headless_renderer, headless_settings, renderer_with, triangle_shader, uniform_set};
use tiny_renderer::api;
use tiny_renderer::{
    BufferUsage, Config, CullMode, DescriptorBinding, DescriptorType, DescriptorUpdate, Format, PipelineSettings,
    QueueKind, ResourceState, ShaderStages, TextureUsage, VertexLayout, Violation,
};

fn sampled_texture(renderer: &tiny_renderer::Renderer) -> tiny_renderer::Texture {
    api::create_texture_2d(
        renderer,
        4,
        4,
        1,
        Format::R8G8B8A8Unorm,
        1,
        None,
        TextureUsage::SAMPLED_IMAGE | TextureUsage::TRANSFER_DST,
        false,
        ResourceState::Undefined,
    )
    .unwrap()
}

#[test]
fn binding_a_partially_written_set_reports_the_missing_slot() {
    let (renderer, log) = headless_renderer(32, 32, 2);
    let buffer = api::create_uniform_buffer(&renderer, 64, true).unwrap();
    let mut set = api::create_descriptor_set(
        &renderer,
        &[
            DescriptorBinding::new(DescriptorType::UniformBufferCbv, 0, ShaderStages::VERT),
            DescriptorBinding::new(DescriptorType::UniformBufferCbv, 1, ShaderStages::FRAG),
        ],
    )
    .unwrap();
    api::update_descriptor_set(&mut set, &[DescriptorUpdate::buffers(0, &[&buffer])]).unwrap();
    assert_eq!(set.unwritten_bindings(), vec![1]);

    let shader = triangle_shader(&renderer);
    let pipeline = api::create_pipeline(
        &renderer,
        &shader,
        &VertexLayout::empty(),
        Some(&set),
        renderer.swapchain_render_target(0),
        &PipelineSettings::default(),
    )
    .unwrap();

    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();
    api::begin_cmd(&mut cmd).unwrap();
    api::cmd_bind_descriptor_sets(&mut cmd, &pipeline, &set);
    api::end_cmd(&mut cmd).unwrap();

    assert_eq!(
        renderer.violations(),
        vec![Violation::IncompleteDescriptorSet {
            set: set.key(),
            binding: 1
        }]
    );
    assert_eq!(log.errors_from("validation").len(), 1);
}

#[test]
fn descriptor_updates_check_kind_count_and_usage() {
    let (renderer, _log) = headless_renderer(32, 32, 2);
    let mut set = uniform_set(&renderer);
    let texture = sampled_texture(&renderer);
    let vertex_only = api::create_buffer(&renderer, BufferUsage::VERTEX, 64, true).unwrap();
    let uniform = api::create_uniform_buffer(&renderer, 64, true).unwrap();

    assert!(api::update_descriptor_set(&mut set, &[DescriptorUpdate::textures(0, &[&texture])]).is_err());
    assert!(api::update_descriptor_set(&mut set, &[DescriptorUpdate::buffers(0, &[&vertex_only])]).is_err());
    assert!(api::update_descriptor_set(&mut set, &[DescriptorUpdate::buffers(0, &[&uniform, &uniform])]).is_err());
    assert!(api::update_descriptor_set(&mut set, &[DescriptorUpdate::buffers(3, &[&uniform])]).is_err());
    assert!(!set.is_written(0));

    api::update_descriptor_set(&mut set, &[DescriptorUpdate::buffers(0, &[&uniform])]).unwrap();
    assert!(set.is_written(0));
}

#[test]
fn transitions_replay_in_submission_order_not_recording_order() {
    let (renderer, log) = headless_renderer(32, 32, 2);
    let texture = sampled_texture(&renderer);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();

    // recorded first, but meant to run second
    let mut second = api::create_cmd(&pool).unwrap();
    api::begin_cmd(&mut second).unwrap();
    api::cmd_image_transition(&mut second, &texture, ResourceState::SampledImage, ResourceState::TransferDst);
    api::end_cmd(&mut second).unwrap();

    let mut first = api::create_cmd(&pool).unwrap();
    api::begin_cmd(&mut first).unwrap();
    api::cmd_image_transition(&mut first, &texture, ResourceState::Undefined, ResourceState::SampledImage);
    api::end_cmd(&mut first).unwrap();

    api::queue_submit(&renderer, &mut [&mut first], &[], &[]).unwrap();
    api::queue_submit(&renderer, &mut [&mut second], &[], &[]).unwrap();
    api::queue_wait_idle(&renderer).unwrap();

    assert!(renderer.violations().is_empty(), "{:?}", renderer.violations());
    assert!(log.errors().is_empty(), "{:?}", log.errors());
    assert_eq!(
        renderer.device().tracked_state(texture.id()),
        Some(ResourceState::TransferDst)
    );
}

#[test]
fn mismatched_old_state_is_reported_but_not_enforced() {
    let (renderer, log) = headless_renderer(32, 32, 2);
    let texture = sampled_texture(&renderer);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();

    let mut cmd = api::create_cmd(&pool).unwrap();
    api::begin_cmd(&mut cmd).unwrap();
    api::cmd_image_transition(&mut cmd, &texture, ResourceState::SampledImage, ResourceState::TransferDst);
    api::end_cmd(&mut cmd).unwrap();
    api::queue_submit(&renderer, &mut [&mut cmd], &[], &[]).unwrap();
    api::queue_wait_idle(&renderer).unwrap();

    let violations = renderer.take_violations();
    assert_eq!(
        violations,
        vec![Violation::TransitionMismatch {
            resource: texture.id(),
            asserted: ResourceState::SampledImage,
            actual: ResourceState::Undefined,
        }]
    );
    assert!(!log.errors_from("validation").is_empty());
    // the barrier still went through
    assert_eq!(texture.state(), ResourceState::TransferDst);
    assert!(renderer.violations().is_empty());
}

#[test]
fn states_outside_the_usage_flags_are_illegal() {
    let (renderer, _log) = headless_renderer(32, 32, 2);
    let buffer = api::create_buffer(&renderer, BufferUsage::VERTEX, 64, true).unwrap();
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();

    let mut cmd = api::create_cmd(&pool).unwrap();
    api::begin_cmd(&mut cmd).unwrap();
    api::cmd_buffer_transition(&mut cmd, &buffer, ResourceState::Undefined, ResourceState::UniformBuffer);
    api::end_cmd(&mut cmd).unwrap();

    assert!(renderer
        .violations()
        .iter()
        .any(|v| matches!(v, Violation::IllegalState { state: ResourceState::UniformBuffer, .. })));
}

#[test]
fn disabled_validation_records_nothing() {
    let mut settings = headless_settings(32, 32, 2);
    settings.validation = false;
    let (renderer, log) = renderer_with(settings);
    assert!(!renderer.device().validation_enabled());

    let texture = sampled_texture(&renderer);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();
    api::begin_cmd(&mut cmd).unwrap();
    api::cmd_image_transition(&mut cmd, &texture, ResourceState::SampledImage, ResourceState::TransferDst);
    api::end_cmd(&mut cmd).unwrap();
    api::queue_submit(&renderer, &mut [&mut cmd], &[], &[]).unwrap();
    api::queue_wait_idle(&renderer).unwrap();

    assert!(renderer.violations().is_empty());
    assert!(log.errors_from("validation").is_empty());
}

#[test]
fn identical_pipeline_inputs_give_identical_pipelines() {
    let (renderer, _log) = headless_renderer(32, 32, 2);
    let set_a = uniform_set(&renderer);
    let set_b = uniform_set(&renderer);
    let shader_a = triangle_shader(&renderer);
    let shader_b = triangle_shader(&renderer);
    let target = renderer.swapchain_render_target(0);
    let settings = PipelineSettings::default();

    let a = api::create_pipeline(&renderer, &shader_a, &VertexLayout::empty(), Some(&set_a), target, &settings).unwrap();
    let b = api::create_pipeline(&renderer, &shader_b, &VertexLayout::empty(), Some(&set_b), target, &settings).unwrap();
    assert_ne!(a.key(), b.key());
    assert_eq!(a.fingerprint(), b.fingerprint());

    let culled = PipelineSettings {
        cull_mode: CullMode::Back,
        ..PipelineSettings::default()
    };
    let c = api::create_pipeline(&renderer, &shader_a, &VertexLayout::empty(), Some(&set_a), target, &culled).unwrap();
    assert_ne!(a.fingerprint(), c.fingerprint());
}

#[test]
fn renderer_settings_come_from_toml() {
    let config = Config::parse(
        r#"
        [renderer]
        backend = "headless"
        width = 40
        height = 30

        [renderer.swapchain]
        image_count = 3
        color_format = "r8g8b8a8_unorm"
        "#,
    )
    .unwrap();

    let (renderer, _log) = renderer_with(config.renderer);
    assert_eq!(renderer.image_count(), 3);
    let target = renderer.swapchain_render_target(2);
    assert_eq!((target.width(), target.height()), (40, 30));
    assert_eq!(target.output_attachments()[0].format(), Format::R8G8B8A8Unorm);
}

#[test]
fn undefined_old_state_after_a_transition_is_a_mismatch() {
    let (renderer, log) = headless_renderer(32, 32, 2);
    let texture = api::create_texture_2d(
        &renderer,
        4,
        4,
        1,
        Format::R8G8B8A8Unorm,
        1,
        None,
        TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_DST,
        false,
        ResourceState::Undefined,
    )
    .unwrap();
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();

    let mut cmd = api::create_cmd(&pool).unwrap();
    api::begin_cmd(&mut cmd).unwrap();
    api::cmd_image_transition(&mut cmd, &texture, ResourceState::Undefined, ResourceState::TransferDst);
    api::cmd_image_transition(&mut cmd, &texture, ResourceState::Undefined, ResourceState::ColorAttachment);
    api::end_cmd(&mut cmd).unwrap();
    api::queue_submit(&renderer, &mut [&mut cmd], &[], &[]).unwrap();
    api::queue_wait_idle(&renderer).unwrap();

    assert_eq!(
        renderer.violations(),
        vec![Violation::TransitionMismatch {
            resource: texture.id(),
            asserted: ResourceState::Undefined,
            actual: ResourceState::TransferDst,
        }]
    );
    assert!(log
        .errors_from("headless")
        .iter()
        .any(|m| m.contains("transitioned from Undefined")));
}

#[test]
fn buffer_transitions_from_the_wrong_state_are_reported_by_the_backend() {
    let (renderer, log) = headless_renderer(32, 32, 2);
    let buffer = api::create_uniform_buffer(&renderer, 64, true).unwrap();
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();

    let mut cmd = api::create_cmd(&pool).unwrap();
    api::begin_cmd(&mut cmd).unwrap();
    api::cmd_buffer_transition(&mut cmd, &buffer, ResourceState::TransferDst, ResourceState::UniformBuffer);
    api::end_cmd(&mut cmd).unwrap();
    api::queue_submit(&renderer, &mut [&mut cmd], &[], &[]).unwrap();
    api::queue_wait_idle(&renderer).unwrap();

    assert!(log
        .errors_from("headless")
        .iter()
        .any(|m| m.contains("transitioned from TransferDst")));
    assert_eq!(
        renderer.headless().unwrap().buffer_state(buffer.key()),
        Some(ResourceState::UniformBuffer)
    );
}

#[test]
fn binding_a_set_missing_a_pipeline_slot_is_reported() {
    let (renderer, log) = headless_renderer(32, 32, 2);
    let layout = [
        DescriptorBinding::new(DescriptorType::UniformBufferCbv, 0, ShaderStages::VERT),
        DescriptorBinding::new(DescriptorType::UniformBufferCbv, 1, ShaderStages::FRAG),
    ];
    let pipeline_set = api::create_descriptor_set(&renderer, &layout).unwrap();
    let shader = triangle_shader(&renderer);
    let pipeline = api::create_pipeline(
        &renderer,
        &shader,
        &VertexLayout::empty(),
        Some(&pipeline_set),
        renderer.swapchain_render_target(0),
        &PipelineSettings::default(),
    )
    .unwrap();

    // fully written, but declares only slot 0
    let buffer = api::create_uniform_buffer(&renderer, 64, true).unwrap();
    let mut narrow = uniform_set(&renderer);
    api::update_descriptor_set(&mut narrow, &[DescriptorUpdate::buffers(0, &[&buffer])]).unwrap();

    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();
    api::begin_cmd(&mut cmd).unwrap();
    api::cmd_bind_descriptor_sets(&mut cmd, &pipeline, &narrow);
    api::end_cmd(&mut cmd).unwrap();

    assert_eq!(
        renderer.violations(),
        vec![Violation::DescriptorLayoutMismatch {
            set: narrow.key(),
            expected: layout[1],
            found: None,
        }]
    );
    assert_eq!(log.errors_from("validation").len(), 1);

    // same slot, different stages
    renderer.take_violations();
    let mut restaged = api::create_descriptor_set(
        &renderer,
        &[
            DescriptorBinding::new(DescriptorType::UniformBufferCbv, 0, ShaderStages::VERT),
            DescriptorBinding::new(DescriptorType::UniformBufferCbv, 1, ShaderStages::VERT),
        ],
    )
    .unwrap();
    api::update_descriptor_set(
        &mut restaged,
        &[DescriptorUpdate::buffers(0, &[&buffer]), DescriptorUpdate::buffers(1, &[&buffer])],
    )
    .unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();
    api::begin_cmd(&mut cmd).unwrap();
    api::cmd_bind_descriptor_sets(&mut cmd, &pipeline, &restaged);
    api::end_cmd(&mut cmd).unwrap();
    assert!(matches!(
        renderer.violations().as_slice(),
        [Violation::DescriptorLayoutMismatch { found: Some(found), .. }] if found.stages == ShaderStages::VERT
    ));
}
