// Command buffer state machine and synchronization misuse on the headless
// backend

mod common;

use common::{headless_renderer, headless_settings, renderer_with};
use tiny_renderer::api;
use tiny_renderer::{BufferUsage, CommandBufferState, QueueKind, ResourceState};

#[test]
fn command_buffer_walks_through_its_states() {
    let (renderer, log) = headless_renderer(16, 16, 2);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();
    assert_eq!(cmd.state(), CommandBufferState::Initial);

    api::begin_cmd(&mut cmd).unwrap();
    assert_eq!(cmd.state(), CommandBufferState::Recording);
    api::end_cmd(&mut cmd).unwrap();
    assert_eq!(cmd.state(), CommandBufferState::Executable);

    let serial = api::queue_submit(&renderer, &mut [&mut cmd], &[], &[]).unwrap();
    assert_eq!(cmd.submission_serial(), Some(serial));
    assert_eq!(cmd.state(), CommandBufferState::Pending);

    api::queue_wait_idle(&renderer).unwrap();
    assert!(renderer.graphics_queue().completed_serial() >= serial);
    assert_eq!(cmd.state(), CommandBufferState::Executable);

    // re-recording an executed buffer starts from scratch
    api::begin_cmd(&mut cmd).unwrap();
    assert_eq!(cmd.state(), CommandBufferState::Recording);
    api::end_cmd(&mut cmd).unwrap();

    api::reset_cmd(&mut cmd);
    assert_eq!(cmd.state(), CommandBufferState::Initial);
    assert!(log.errors().is_empty(), "{:?}", log.errors());
}

#[test]
fn submission_serials_increase_per_queue() {
    let (renderer, _log) = headless_renderer(16, 16, 2);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmds = api::create_cmd_n(&pool, 3).unwrap();

    let mut serials = Vec::new();
    for cmd in cmds.iter_mut() {
        api::begin_cmd(cmd).unwrap();
        api::end_cmd(cmd).unwrap();
        serials.push(api::queue_submit(&renderer, &mut [cmd], &[], &[]).unwrap());
    }
    assert!(serials.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn begin_on_a_pending_buffer_invalidates_it() {
    let mut settings = headless_settings(16, 16, 2);
    settings.headless.max_pending_submissions = 0;
    let (renderer, log) = renderer_with(settings);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();

    api::begin_cmd(&mut cmd).unwrap();
    api::end_cmd(&mut cmd).unwrap();
    api::queue_submit(&renderer, &mut [&mut cmd], &[], &[]).unwrap();
    assert_eq!(renderer.headless().unwrap().pending_submissions(), 1);

    assert!(api::begin_cmd(&mut cmd).is_err());
    assert_eq!(cmd.state(), CommandBufferState::Invalid);
    assert_eq!(log.errors_from("command").len(), 1);

    // an invalid buffer refuses to record until reset
    assert!(api::begin_cmd(&mut cmd).is_err());
    assert_eq!(log.errors_from("command").len(), 2);

    // still invalid after the GPU catches up, until it is reset
    api::queue_wait_idle(&renderer).unwrap();
    assert_eq!(cmd.state(), CommandBufferState::Invalid);
    api::reset_cmd(&mut cmd);
    api::begin_cmd(&mut cmd).unwrap();
    assert_eq!(cmd.state(), CommandBufferState::Recording);
    api::end_cmd(&mut cmd).unwrap();
}

#[test]
fn reset_of_a_pending_buffer_invalidates_it() {
    let mut settings = headless_settings(16, 16, 2);
    settings.headless.max_pending_submissions = 0;
    let (renderer, log) = renderer_with(settings);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();

    api::begin_cmd(&mut cmd).unwrap();
    api::end_cmd(&mut cmd).unwrap();
    api::queue_submit(&renderer, &mut [&mut cmd], &[], &[]).unwrap();

    api::reset_cmd(&mut cmd);
    assert_eq!(cmd.state(), CommandBufferState::Invalid);
    assert_eq!(log.errors_from("command").len(), 1);
    assert!(api::begin_cmd(&mut cmd).is_err());
    assert_eq!(renderer.headless().unwrap().pending_submissions(), 1);

    // a second reset while still in flight keeps refusing
    api::reset_cmd(&mut cmd);
    assert_eq!(cmd.state(), CommandBufferState::Invalid);

    api::queue_wait_idle(&renderer).unwrap();
    api::reset_cmd(&mut cmd);
    assert_eq!(cmd.state(), CommandBufferState::Initial);
    api::begin_cmd(&mut cmd).unwrap();
    assert_eq!(cmd.state(), CommandBufferState::Recording);
    api::end_cmd(&mut cmd).unwrap();
}

#[test]
#[should_panic(expected = "region out of bounds")]
fn copy_with_an_overflowing_region_panics() {
    let (renderer, _log) = headless_renderer(16, 16, 2);
    let src = api::create_buffer(&renderer, BufferUsage::TRANSFER_SRC, 64, true).unwrap();
    let dst = api::create_buffer(&renderer, BufferUsage::TRANSFER_DST, 64, true).unwrap();
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();
    api::begin_cmd(&mut cmd).unwrap();
    api::cmd_copy_buffer_to_buffer(&mut cmd, &src, u64::MAX, &dst, 0, 16);
}

#[test]
fn bounded_pending_queue_retires_old_work() {
    let mut settings = headless_settings(16, 16, 2);
    settings.headless.max_pending_submissions = 1;
    let (renderer, _log) = renderer_with(settings);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmds = api::create_cmd_n(&pool, 2).unwrap();

    for cmd in cmds.iter_mut() {
        api::begin_cmd(cmd).unwrap();
        api::end_cmd(cmd).unwrap();
        api::queue_submit(&renderer, &mut [cmd], &[], &[]).unwrap();
    }
    assert_eq!(renderer.headless().unwrap().pending_submissions(), 1);
    assert_eq!(cmds[0].state(), CommandBufferState::Executable);
    assert_eq!(cmds[1].state(), CommandBufferState::Pending);
}

#[test]
fn fences_signal_on_completion_and_reset() {
    let (renderer, log) = headless_renderer(16, 16, 2);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();
    let fence = api::create_fence(&renderer, false).unwrap();
    assert!(!fence.is_signaled().unwrap());

    api::begin_cmd(&mut cmd).unwrap();
    api::end_cmd(&mut cmd).unwrap();
    renderer
        .graphics_queue()
        .submit(&mut [&mut cmd], &[], &[], Some(&fence))
        .unwrap();
    fence.wait().unwrap();
    assert!(fence.is_signaled().unwrap());

    fence.reset().unwrap();
    assert!(!fence.is_signaled().unwrap());
    assert!(log.errors().is_empty(), "{:?}", log.errors());
}

#[test]
fn waiting_on_an_unsubmitted_fence_fails_instead_of_hanging() {
    let (renderer, _log) = headless_renderer(16, 16, 2);
    let fence = api::create_fence(&renderer, false).unwrap();
    assert!(fence.wait().is_err());

    let signaled = api::create_fence(&renderer, true).unwrap();
    assert!(signaled.wait().is_ok());
}

#[test]
fn waiting_on_a_semaphore_nobody_signals_is_reported() {
    let (renderer, log) = headless_renderer(16, 16, 2);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();
    let semaphore = api::create_semaphore(&renderer).unwrap();

    api::begin_cmd(&mut cmd).unwrap();
    api::end_cmd(&mut cmd).unwrap();
    api::queue_submit(&renderer, &mut [&mut cmd], &[&semaphore], &[]).unwrap();

    assert!(log
        .errors_from("headless")
        .iter()
        .any(|m| m.contains("no signal pending")));
}

#[test]
fn signaling_a_semaphore_twice_is_reported() {
    let (renderer, log) = headless_renderer(16, 16, 2);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmds = api::create_cmd_n(&pool, 2).unwrap();
    let semaphore = api::create_semaphore(&renderer).unwrap();

    for cmd in cmds.iter_mut() {
        api::begin_cmd(cmd).unwrap();
        api::end_cmd(cmd).unwrap();
        api::queue_submit(&renderer, &mut [cmd], &[], &[&semaphore]).unwrap();
    }
    assert!(log
        .errors_from("headless")
        .iter()
        .any(|m| m.contains("already signaled")));
}

#[test]
fn chained_semaphore_orders_two_submissions() {
    let (renderer, log) = headless_renderer(16, 16, 2);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut producer = api::create_cmd(&pool).unwrap();
    let mut consumer = api::create_cmd(&pool).unwrap();
    let semaphore = api::create_semaphore(&renderer).unwrap();

    for cmd in [&mut producer, &mut consumer] {
        api::begin_cmd(cmd).unwrap();
        api::end_cmd(cmd).unwrap();
    }
    api::queue_submit(&renderer, &mut [&mut producer], &[], &[&semaphore]).unwrap();
    api::queue_submit(&renderer, &mut [&mut consumer], &[&semaphore], &[]).unwrap();
    api::queue_wait_idle(&renderer).unwrap();

    assert!(log.errors().is_empty(), "{:?}", log.errors());
}

#[test]
#[should_panic(expected = "not recording")]
fn recording_before_begin_panics() {
    let (renderer, _log) = headless_renderer(16, 16, 2);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();
    api::cmd_draw(&mut cmd, 3, 0);
}

#[test]
#[should_panic(expected = "requires an open render pass")]
fn draw_outside_a_render_pass_panics() {
    let (renderer, _log) = headless_renderer(16, 16, 2);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();
    api::begin_cmd(&mut cmd).unwrap();
    api::cmd_draw(&mut cmd, 3, 0);
}

#[test]
#[should_panic(expected = "not allowed inside a render pass")]
fn transition_inside_a_render_pass_panics() {
    let (renderer, _log) = headless_renderer(16, 16, 2);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();
    api::acquire_next_image(&renderer).unwrap();
    let target = renderer.current_render_target();

    api::begin_cmd(&mut cmd).unwrap();
    api::cmd_render_target_transition(&mut cmd, target, ResourceState::Present, ResourceState::ColorAttachment);
    api::cmd_begin_render(&mut cmd, target);
    api::cmd_render_target_transition(&mut cmd, target, ResourceState::ColorAttachment, ResourceState::Present);
}

#[test]
#[should_panic(expected = "render pass still open")]
fn ending_with_an_open_render_pass_panics() {
    let (renderer, _log) = headless_renderer(16, 16, 2);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();
    api::acquire_next_image(&renderer).unwrap();
    let target = renderer.current_render_target();

    api::begin_cmd(&mut cmd).unwrap();
    api::cmd_render_target_transition(&mut cmd, target, ResourceState::Present, ResourceState::ColorAttachment);
    api::cmd_begin_render(&mut cmd, target);
    let _ = api::end_cmd(&mut cmd);
}

#[test]
#[should_panic(expected = "not executable")]
fn submitting_a_recording_buffer_panics() {
    let (renderer, _log) = headless_renderer(16, 16, 2);
    let pool = api::create_cmd_pool(&renderer, QueueKind::Graphics).unwrap();
    let mut cmd = api::create_cmd(&pool).unwrap();
    api::begin_cmd(&mut cmd).unwrap();
    let _ = api::queue_submit(&renderer, &mut [&mut cmd], &[], &[]);
}
