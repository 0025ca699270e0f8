// Shared helpers for the headless integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use tiny_renderer::api;
use tiny_renderer::{
    DescriptorBinding, DescriptorSet, DescriptorType, LogCallback, LogLevel, Renderer, RendererSettings, ShaderCode,
    ShaderProgram, ShaderProgramDesc, ShaderStageDesc, ShaderStages,
};

/// Messages routed through `log_fn`
#[derive(Clone, Default)]
pub struct CapturedLog(Arc<Mutex<Vec<(LogLevel, String, String)>>>);

impl CapturedLog {
    pub fn callback(&self) -> LogCallback {
        let entries = self.0.clone();
        LogCallback::new(move |level, component, message| {
            entries.lock().push((level, component.to_string(), message.to_string()));
        })
    }

    pub fn errors(&self) -> Vec<(String, String)> {
        self.0
            .lock()
            .iter()
            .filter(|(level, _, _)| *level == LogLevel::Error)
            .map(|(_, component, message)| (component.clone(), message.clone()))
            .collect()
    }

    pub fn errors_from(&self, component: &str) -> Vec<String> {
        self.errors()
            .into_iter()
            .filter(|(c, _)| c == component)
            .map(|(_, m)| m)
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

pub fn headless_settings(width: u32, height: u32, image_count: u32) -> RendererSettings {
    RendererSettings::headless(width, height, image_count)
}

pub fn renderer_with(mut settings: RendererSettings) -> (Renderer, CapturedLog) {
    let log = CapturedLog::default();
    settings.log_fn = Some(log.callback());
    let renderer = api::create_renderer("integration-test", settings).expect("headless renderer");
    (renderer, log)
}

pub fn headless_renderer(width: u32, height: u32, image_count: u32) -> (Renderer, CapturedLog) {
    renderer_with(headless_settings(width, height, image_count))
}

pub fn triangle_shader(renderer: &Renderer) -> ShaderProgram {
    let source = ShaderCode::Hlsl("float4 vs_main() : SV_Position { return 0; }".to_string());
    let desc = ShaderProgramDesc::graphics(
        ShaderStageDesc::new(source.clone(), "vs_main"),
        ShaderStageDesc::new(source, "ps_main"),
    );
    api::create_shader_program(renderer, &desc).expect("shader program")
}

pub fn uniform_set(renderer: &Renderer) -> DescriptorSet {
    api::create_descriptor_set(
        renderer,
        &[DescriptorBinding::new(DescriptorType::UniformBufferCbv, 0, ShaderStages::VERT)],
    )
    .expect("descriptor set")
}
