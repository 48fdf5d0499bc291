use hmd_stereo::render::{FocusIndicator, NullRenderTarget};
use hmd_stereo::vr::{Extent, Eye, EyeCamera};
use hmd_stereo::{
    HmdSession, HostCamera, HostView, NullGraphicsBackend, SimulatedRuntime, StereoOptions,
    StereoRenderer, TickOutcome, XrConfig,
};
use std::env;

const PROBE_FRAMES: u32 = 240;

struct ProbeView {
    resolution: Extent,
    eyes_rendered: u32,
}

impl HostView<NullRenderTarget> for ProbeView {
    fn set_resolution(&mut self, extent: Extent) {
        self.resolution = extent;
    }

    fn render_eye(&mut self, _eye: Eye, _target: &NullRenderTarget, _camera: &EyeCamera) {
        self.eyes_rendered += 1;
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("[xr_probe] error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = match env::args().nth(1) {
        Some(path) => XrConfig::from_json_file(&path)?,
        None => XrConfig::default(),
    };

    let focus = FocusIndicator::new();
    let mut session = HmdSession::new(SimulatedRuntime::new(), &config).with_listener(focus.clone());
    session.init()?;
    session.start_session(())?;

    let backend = NullGraphicsBackend::with_preview(Extent::new(1280, 720));
    let mut renderer = StereoRenderer::new(session, backend, StereoOptions::from_config(&config))
        .with_focus_indicator(focus);

    let mut view = ProbeView {
        resolution: Extent::default(),
        eyes_rendered: 0,
    };
    let camera = HostCamera::default();
    let mut skipped = 0;
    for _ in 0..PROBE_FRAMES {
        if let TickOutcome::Skipped(reason) = renderer.render(&mut view, &camera) {
            log::debug!("[xr_probe] tick skipped: {reason:?}");
            skipped += 1;
        }
    }

    println!("{}", renderer.diagnostics().to_json()?);
    println!(
        "[xr_probe] {} eyes rendered at {}x{}, {} ticks skipped",
        view.eyes_rendered, view.resolution.width, view.resolution.height, skipped
    );

    renderer.shutdown()?;
    Ok(())
}
