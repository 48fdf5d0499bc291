//! Renders a few hundred stereo frames against the simulated runtime with the
//! wgpu backend and prints the resulting diagnostics.
//!
//! `cargo run --example headless_stereo --features render-wgpu`

use hmd_stereo::render::wgpu_backend::{WgpuGraphicsBackend, WgpuSwapchainTarget};
use hmd_stereo::render::{FocusIndicator, RenderTarget};
use hmd_stereo::vr::{Extent, Eye, EyeCamera};
use hmd_stereo::{
    HmdSession, HostCamera, HostView, SimulatedRuntime, StereoOptions, StereoRenderer, XrConfig,
};

struct TintedScene {
    resolution: Extent,
    frames: u32,
}

impl HostView<WgpuSwapchainTarget> for TintedScene {
    fn set_resolution(&mut self, extent: Extent) {
        self.resolution = extent;
    }

    fn render_eye(&mut self, eye: Eye, target: &WgpuSwapchainTarget, camera: &EyeCamera) {
        // Stand-in for a scene renderer: tint each eye so the preview halves differ.
        let shade = (self.frames % 90) as f32 / 90.0;
        let color = match eye {
            Eye::Left => [shade, 0.2, 0.3, 1.0],
            Eye::Right => [0.2, shade, 0.3, 1.0],
        };
        target.clear(color);
        if eye == Eye::Right {
            self.frames += 1;
        }
        log::trace!(
            "[demo] {} eye at {:?}, fov_y {:.3}",
            eye.label(),
            camera.position,
            camera.fov_y
        );
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("[demo] error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = XrConfig {
        downscale_factor: 2,
        ..XrConfig::default()
    };

    let focus = FocusIndicator::new();
    let mut session = HmdSession::new(SimulatedRuntime::new(), &config).with_listener(focus.clone());
    session.init()?;
    session.start_session(())?;

    let mut backend = WgpuGraphicsBackend::initialize()?;
    backend.enable_preview(Extent::new(1280, 720));

    let mut renderer = StereoRenderer::new(session, backend, StereoOptions::from_config(&config))
        .with_focus_indicator(focus);
    let mut scene = TintedScene {
        resolution: Extent::default(),
        frames: 0,
    };
    let camera = HostCamera::default();

    for _ in 0..300 {
        renderer.render(&mut scene, &camera);
    }

    println!("{}", renderer.diagnostics().to_json()?);
    log::info!(
        "[demo] rendered {} stereo frames at {}x{}",
        scene.frames,
        scene.resolution.width,
        scene.resolution.height
    );
    renderer.shutdown()?;
    Ok(())
}
