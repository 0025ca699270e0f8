// =============================================================================
// TINY RENDERER DEMO - rotating triangle on any backend
// =============================================================================
//
// FRAME FLOW (one slot per swapchain image):
// 1. Acquire the next image (waits until the slot's previous frame is done)
// 2. Write the slot's uniform buffer with the current transform
// 3. Record: Present -> ColorAttachment, clear, draw, ColorAttachment -> Present
// 4. Submit waiting on the acquisition semaphore, signal render-complete
// 5. Present waiting on render-complete
//
// With `backend = "headless"` in renderer.toml the demo runs without a
// window for `debug.headless_frames` frames and reports validation findings.
//
// =============================================================================

use anyhow::{bail, Context, Result};
use glam::{Mat4, Vec3};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tiny_renderer::api;
use tiny_renderer::{
    BackendKind, Buffer, ClearValue, CommandBuffer, CommandPool, Config, DescriptorBinding, DescriptorSet,
    DescriptorType, DescriptorUpdate, Format, Pipeline, PipelineSettings, PlatformHandle, QueueKind, Renderer,
    ResourceState, ShaderCode, ShaderProgram, ShaderProgramDesc, ShaderStageDesc, ShaderStages, VertexLayout,
    VertexSemantic,
};
use winit::{
    application::ApplicationHandler,
    event::{ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

const TRIANGLE_HLSL: &str = include_str!("../shaders/triangle.hlsl");

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 2],
    color: [f32; 3],
}

const TRIANGLE: [Vertex; 3] = [
    Vertex { position: [0.0, -0.6], color: [1.0, 0.2, 0.2] },
    Vertex { position: [0.6, 0.5], color: [0.2, 1.0, 0.2] },
    Vertex { position: [-0.6, 0.5], color: [0.2, 0.2, 1.0] },
];

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting tiny-renderer demo");
    log::info!(
        "Backend: {:?}, {}x{}, {} swapchain images",
        config.renderer.backend,
        config.renderer.width,
        config.renderer.height,
        config.renderer.swapchain.image_count
    );

    if config.renderer.backend == BackendKind::Headless {
        return run_headless(config);
    }

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    app.error.map_or(Ok(()), Err)
}

/// Initialize logging with optional file output
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== tiny-renderer log ===");
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

fn run_headless(config: Config) -> Result<()> {
    let frames = config.debug.headless_frames;
    let renderer = api::create_renderer(&config.window.title, config.renderer)?;
    let mut scene = Scene::new(&renderer)?;

    let start = Instant::now();
    for _ in 0..frames {
        scene.transform.set_angle(start.elapsed().as_secs_f32());
        scene.render_frame(&renderer)?;
    }
    api::queue_wait_idle(&renderer)?;

    let violations = renderer.take_violations();
    for violation in &violations {
        log::error!("{}", violation);
    }
    log::info!(
        "Rendered {} headless frames, {} validation findings",
        renderer.frame_count(),
        violations.len()
    );

    drop(scene);
    api::destroy_renderer(renderer)?;

    if !violations.is_empty() {
        bail!("{} validation findings", violations.len());
    }
    Ok(())
}

// =============================================================================
// TRANSFORM
// =============================================================================

/// Rotation plus aspect correction, recomputed only after a change
struct Transform {
    angle: f32,
    aspect: f32,
    matrix: Mat4,
    dirty: bool,
}

impl Transform {
    fn new(aspect: f32) -> Self {
        Self {
            angle: 0.0,
            aspect,
            matrix: Mat4::IDENTITY,
            dirty: true,
        }
    }

    fn set_angle(&mut self, angle: f32) {
        if angle != self.angle {
            self.angle = angle;
            self.dirty = true;
        }
    }

    fn matrix(&mut self) -> Mat4 {
        if self.dirty {
            self.matrix = Mat4::from_scale(Vec3::new(1.0 / self.aspect.max(f32::EPSILON), 1.0, 1.0))
                * Mat4::from_rotation_z(self.angle);
            self.dirty = false;
        }
        self.matrix
    }
}

// =============================================================================
// SCENE
// =============================================================================

/// Everything the triangle needs, with per-slot uniform buffers and command
/// buffers so a slot is only rewritten once its previous frame has retired
struct Scene {
    transform: Transform,
    cmds: Vec<CommandBuffer>,
    _cmd_pool: CommandPool,
    pipeline: Pipeline,
    _shader: ShaderProgram,
    descriptor_sets: Vec<DescriptorSet>,
    uniform_buffers: Vec<Buffer>,
    vertex_buffer: Buffer,
    clear_value: ClearValue,
}

impl Scene {
    fn new(renderer: &Renderer) -> Result<Self> {
        let slots = renderer.image_count() as usize;
        let settings = renderer.settings();

        let shader = api::create_shader_program(renderer, &shader_desc(settings.backend)?)?;

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&TRIANGLE);
        let vertex_buffer = api::create_vertex_buffer(
            renderer,
            vertex_bytes.len() as u64,
            false,
            std::mem::size_of::<Vertex>() as u32,
        )?;
        api::util_update_buffer(renderer, &vertex_buffer, vertex_bytes)?;
        api::util_transition_buffer(renderer, &vertex_buffer, ResourceState::TransferDst, ResourceState::VertexBuffer)?;

        let bindings = [DescriptorBinding::new(DescriptorType::UniformBufferCbv, 0, ShaderStages::VERT)];
        let mut uniform_buffers = Vec::with_capacity(slots);
        let mut descriptor_sets = Vec::with_capacity(slots);
        for _ in 0..slots {
            let buffer = api::create_uniform_buffer(renderer, std::mem::size_of::<Mat4>() as u64, true)?;
            api::util_transition_buffer(renderer, &buffer, ResourceState::Undefined, ResourceState::UniformBuffer)?;
            let mut set = api::create_descriptor_set(renderer, &bindings)?;
            api::update_descriptor_set(&mut set, &[DescriptorUpdate::buffers(0, &[&buffer])])?;
            uniform_buffers.push(buffer);
            descriptor_sets.push(set);
        }

        let layout = VertexLayout::interleaved(&[
            (VertexSemantic::Position, Format::R32G32Float),
            (VertexSemantic::Color, Format::R32G32B32Float),
        ]);
        let pipeline = api::create_pipeline(
            renderer,
            &shader,
            &layout,
            descriptor_sets.first(),
            renderer.swapchain_render_target(0),
            &PipelineSettings::default(),
        )
        .context("Failed to create triangle pipeline")?;

        let cmd_pool = api::create_cmd_pool(renderer, QueueKind::Graphics)?;
        let cmds = api::create_cmd_n(&cmd_pool, slots)?;

        Ok(Self {
            transform: Transform::new(settings.width as f32 / settings.height as f32),
            cmds,
            _cmd_pool: cmd_pool,
            pipeline,
            _shader: shader,
            descriptor_sets,
            uniform_buffers,
            vertex_buffer,
            clear_value: settings.swapchain.color_clear_value,
        })
    }

    fn render_frame(&mut self, renderer: &Renderer) -> Result<()> {
        let slot = renderer.frame_index() as usize;
        api::acquire_next_image(renderer)?;

        let matrix = self.transform.matrix();
        self.uniform_buffers[slot].write(0, &matrix.to_cols_array())?;

        let target = renderer.current_render_target();
        let cmd = &mut self.cmds[slot];
        api::begin_cmd(cmd)?;
        api::cmd_render_target_transition(cmd, target, ResourceState::Present, ResourceState::ColorAttachment);
        api::cmd_begin_render(cmd, target);
        cmd.set_full_viewport();
        api::cmd_clear_color_attachment(cmd, 0, self.clear_value);
        api::cmd_bind_pipeline(cmd, &self.pipeline);
        api::cmd_bind_descriptor_sets(cmd, &self.pipeline, &self.descriptor_sets[slot]);
        api::cmd_bind_vertex_buffers(cmd, &[&self.vertex_buffer]);
        api::cmd_draw(cmd, TRIANGLE.len() as u32, 0);
        api::cmd_end_render(cmd);
        api::cmd_render_target_transition(cmd, target, ResourceState::ColorAttachment, ResourceState::Present);
        api::end_cmd(cmd)?;

        let sync = renderer.current_frame_sync();
        api::queue_submit(
            renderer,
            &mut [cmd],
            &[&sync.image_acquired_semaphore],
            &[&sync.render_complete_semaphore],
        )?;
        api::queue_present(renderer, &[&sync.render_complete_semaphore])
    }
}

fn shader_desc(backend: BackendKind) -> Result<ShaderProgramDesc> {
    let (vert, frag) = match backend {
        BackendKind::Vulkan => (
            ShaderStageDesc::new(ShaderCode::load_spirv("shaders/triangle.vert.spv")?, "main"),
            ShaderStageDesc::new(ShaderCode::load_spirv("shaders/triangle.frag.spv")?, "main"),
        ),
        BackendKind::D3d12 | BackendKind::Headless => (
            ShaderStageDesc::new(ShaderCode::Hlsl(TRIANGLE_HLSL.to_string()), "vs_main"),
            ShaderStageDesc::new(ShaderCode::Hlsl(TRIANGLE_HLSL.to_string()), "ps_main"),
        ),
    };
    Ok(ShaderProgramDesc::graphics(vert, frag))
}

// =============================================================================
// WINDOWED APPLICATION
// =============================================================================

/// Scene and renderer for the open window; the scene is dropped first,
/// after the GPU has drained
struct Running {
    scene: Scene,
    renderer: Renderer,
    window: Arc<Window>,
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Err(e) = self.renderer.wait_idle() {
            log::warn!("Wait idle failed on shutdown: {:?}", e);
        }
    }
}

struct App {
    config: Config,
    running: Option<Running>,
    is_fullscreen: bool,
    error: Option<anyhow::Error>,

    start_time: Instant,
    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            running: None,
            is_fullscreen,
            error: None,
            start_time: now,
            frame_count: 0,
            last_fps_update: now,
        }
    }

    fn init_renderer(&self, window: Arc<Window>) -> Result<Running> {
        let size = window.inner_size();
        if size.width == 0 || size.height == 0 {
            bail!("Window has no drawable area");
        }

        let mut settings = self.config.renderer.clone();
        settings.width = size.width;
        settings.height = size.height;
        settings.handle = Some(PlatformHandle::from_window(&*window)?);

        let renderer = api::create_renderer(&self.config.window.title, settings)?;
        let scene = Scene::new(&renderer)?;
        Ok(Running { scene, renderer, window })
    }

    fn render_frame(&mut self) -> Result<()> {
        let Some(running) = self.running.as_mut() else {
            return Ok(());
        };
        running
            .scene
            .transform
            .set_angle(self.start_time.elapsed().as_secs_f32());
        running.scene.render_frame(&running.renderer)
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(running) = &self.running {
            self.is_fullscreen = !self.is_fullscreen;
            if self.is_fullscreen {
                running.window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                running.window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        self.frame_count += 1;
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(running) = &self.running {
                running
                    .window
                    .set_title(&format!("{} - {:.0} FPS", self.config.window.title, fps));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:?}", error);
        self.error = Some(error);
        self.running = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.running.is_some() {
            return;
        }

        let mut attributes = WindowAttributes::default()
            .with_title(self.config.window.title.clone())
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.renderer.width,
                self.config.renderer.height,
            ));
        if self.is_fullscreen {
            attributes = attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(attributes) {
            Ok(window) => Arc::new(window),
            Err(e) => return self.fail(event_loop, e.into()),
        };

        match self.init_renderer(window) {
            Ok(running) => self.running = Some(running),
            Err(e) => self.fail(event_loop, e.context("Failed to initialize renderer")),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down");
                self.running = None;
                event_loop.exit();
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => match code {
                KeyCode::Escape => {
                    self.running = None;
                    event_loop.exit();
                }
                KeyCode::F11 => self.toggle_fullscreen(),
                _ => {}
            },
            WindowEvent::Resized(size) => {
                // The swapchain keeps its creation size; the compositor scales
                if let Some(running) = &self.running {
                    log::debug!(
                        "Window resized to {}x{}, rendering stays at {}x{}",
                        size.width,
                        size.height,
                        running.renderer.settings().width,
                        running.renderer.settings().height
                    );
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render_frame() {
                    return self.fail(event_loop, e);
                }
                self.update_fps();
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(running) = &self.running {
            running.window.request_redraw();
        }
    }
}
