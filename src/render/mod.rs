pub mod target;
#[cfg(feature = "render-wgpu")]
pub mod wgpu_backend;

pub use target::{NullRenderTarget, RenderTarget, RenderTargetPool};

use crate::config::XrConfig;
use crate::diagnostics::Diagnostics;
use crate::vr::{
    Extent, Eye, EyeCamera, FrameSubmission, HmdSession, ImageHandle, ProjectionOptions,
    SessionListener, View, VrError, XrRuntime,
};
use glam::Vec3;
use serde::Serialize;
use std::cell::Cell;
use std::rc::Rc;
#[cfg(feature = "render-wgpu")]
use std::sync::Arc;
use thiserror::Error;

#[cfg(feature = "render-wgpu")]
#[derive(Clone)]
pub struct WgpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("vr runtime error: {0}")]
    Vr(#[from] VrError),
    #[error("gpu backend failure: {0}")]
    Backend(&'static str),
    #[error("desktop preview is not enabled")]
    PreviewDisabled,
}

pub type RenderResult<T> = Result<T, RenderError>;

/// Pixel rectangle inside the desktop preview surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewViewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PreviewViewport {
    /// Left eye fills the left half, right eye the right half.
    pub fn for_eye(eye: Eye, preview: Extent) -> Self {
        let half = preview.width / 2;
        let x = match eye {
            Eye::Left => 0,
            Eye::Right => half,
        };
        Self {
            x,
            y: 0,
            width: half,
            height: preview.height,
        }
    }
}

/// Graphics API hooks the orchestrator needs: wrapping swapchain images and
/// compositing the desktop preview.
pub trait GraphicsBackend {
    type Target: RenderTarget;

    fn label(&self) -> &'static str;

    /// Binds a framebuffer to `image` as its color attachment.
    fn create_target(&mut self, image: ImageHandle, extent: Extent) -> RenderResult<Self::Target>;

    /// Size of the desktop preview surface, if one is enabled.
    fn preview_extent(&self) -> Option<Extent> {
        None
    }

    /// Draws `target` into `viewport` of the preview surface with a textured quad.
    fn blit_preview(&mut self, _target: &Self::Target, _viewport: PreviewViewport) -> RenderResult<()> {
        Err(RenderError::PreviewDisabled)
    }

    /// Called once per rendered frame after both eyes were blitted.
    fn finish_preview(&mut self, _indicator: [f32; 4]) -> RenderResult<()> {
        Ok(())
    }

    #[cfg(feature = "render-wgpu")]
    fn wgpu_context(&self) -> Option<WgpuContext> {
        None
    }
}

/// Backend that hands out [`NullRenderTarget`]s and records preview traffic.
#[derive(Debug, Default)]
pub struct NullGraphicsBackend {
    preview: Option<Extent>,
    targets_created: usize,
    blits: Vec<(ImageHandle, PreviewViewport)>,
    last_indicator: Option<[f32; 4]>,
}

impl NullGraphicsBackend {
    pub fn with_preview(extent: Extent) -> Self {
        Self {
            preview: Some(extent),
            ..Self::default()
        }
    }

    pub fn targets_created(&self) -> usize {
        self.targets_created
    }

    pub fn blits(&self) -> &[(ImageHandle, PreviewViewport)] {
        &self.blits
    }

    pub fn last_indicator(&self) -> Option<[f32; 4]> {
        self.last_indicator
    }
}

impl GraphicsBackend for NullGraphicsBackend {
    type Target = NullRenderTarget;

    fn label(&self) -> &'static str {
        "Null Graphics Backend"
    }

    fn create_target(&mut self, image: ImageHandle, extent: Extent) -> RenderResult<NullRenderTarget> {
        self.targets_created += 1;
        Ok(NullRenderTarget::new(image, extent))
    }

    fn preview_extent(&self) -> Option<Extent> {
        self.preview
    }

    fn blit_preview(&mut self, target: &NullRenderTarget, viewport: PreviewViewport) -> RenderResult<()> {
        if self.preview.is_none() {
            return Err(RenderError::PreviewDisabled);
        }
        self.blits.push((target.image(), viewport));
        Ok(())
    }

    fn finish_preview(&mut self, indicator: [f32; 4]) -> RenderResult<()> {
        self.last_indicator = Some(indicator);
        Ok(())
    }
}

/// The host's renderable scene view.
///
/// `render_eye` must not fail: errors are the host's to log, since bailing out
/// mid-callback would leave the frame protocol unbalanced.
pub trait HostView<T: RenderTarget> {
    fn set_resolution(&mut self, extent: Extent);
    fn render_eye(&mut self, eye: Eye, target: &T, camera: &EyeCamera);
}

/// The host's desktop camera, used for seated recentering and clip planes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostCamera {
    pub position: Vec3,
    pub znear: f32,
    pub zfar: f32,
}

impl Default for HostCamera {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            znear: 0.01,
            zfar: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum HeadsetFocus {
    #[default]
    Idle,
    Visible,
    Focused,
}

/// Session listener that remembers whether the headset currently has focus.
#[derive(Debug, Clone, Default)]
pub struct FocusIndicator(Rc<Cell<HeadsetFocus>>);

impl FocusIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HeadsetFocus {
        self.0.get()
    }

    pub fn color(&self) -> [f32; 4] {
        match self.state() {
            HeadsetFocus::Focused => [0.1, 0.8, 0.2, 1.0],
            HeadsetFocus::Visible => [0.9, 0.6, 0.1, 1.0],
            HeadsetFocus::Idle => [0.8, 0.1, 0.1, 1.0],
        }
    }
}

impl SessionListener for FocusIndicator {
    fn on_idle(&mut self) {
        self.0.set(HeadsetFocus::Idle);
    }

    fn on_visible(&mut self) {
        self.0.set(HeadsetFocus::Visible);
    }

    fn on_focused(&mut self) {
        self.0.set(HeadsetFocus::Focused);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoOptions {
    pub downscale_factor: u32,
    pub axis_correction: bool,
    pub recenter_on_host_camera: bool,
    pub clear_color: [f32; 4],
}

impl StereoOptions {
    pub fn from_config(config: &XrConfig) -> Self {
        Self {
            downscale_factor: config.downscale_factor.max(1),
            axis_correction: config.axis_correction,
            recenter_on_host_camera: config.recenter_on_host_camera,
            ..Self::default()
        }
    }
}

impl Default for StereoOptions {
    fn default() -> Self {
        Self {
            downscale_factor: 1,
            axis_correction: true,
            recenter_on_host_camera: false,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    PollFailed,
    NotRunning,
    WaitFailed,
    SubmitFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The host should fall back to its desktop render path.
    Skipped(SkipReason),
    Rendered(FrameSubmission),
}

impl TickOutcome {
    pub fn is_rendered(&self) -> bool {
        matches!(self, TickOutcome::Rendered(_))
    }
}

/// Per-tick driver: polls the session, paces frames and renders both eyes.
pub struct StereoRenderer<R: XrRuntime, B: GraphicsBackend> {
    session: HmdSession<R>,
    backend: B,
    pool: RenderTargetPool<B::Target>,
    options: StereoOptions,
    focus: Option<FocusIndicator>,
}

impl<R: XrRuntime, B: GraphicsBackend> StereoRenderer<R, B> {
    pub fn new(session: HmdSession<R>, backend: B, options: StereoOptions) -> Self {
        Self {
            session,
            backend,
            pool: RenderTargetPool::new(),
            options: StereoOptions {
                downscale_factor: options.downscale_factor.max(1),
                ..options
            },
            focus: None,
        }
    }

    pub fn with_focus_indicator(mut self, focus: FocusIndicator) -> Self {
        self.focus = Some(focus);
        self
    }

    pub fn session(&self) -> &HmdSession<R> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut HmdSession<R> {
        &mut self.session
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn pool(&self) -> &RenderTargetPool<B::Target> {
        &self.pool
    }

    pub fn options(&self) -> StereoOptions {
        self.options
    }

    pub fn focus(&self) -> Option<&FocusIndicator> {
        self.focus.as_ref()
    }

    fn reject_after_start(&self, what: &str) -> bool {
        if self.session.session_started() {
            log::warn!("[render] {what} cannot change after the session started; ignoring");
            true
        } else {
            false
        }
    }

    pub fn set_downscale_factor(&mut self, factor: u32) {
        if self.reject_after_start("downscale factor") {
            return;
        }
        if factor == 0 {
            log::warn!("[render] downscale factor must be at least 1; ignoring");
            return;
        }
        self.options.downscale_factor = factor;
    }

    pub fn set_axis_correction(&mut self, enabled: bool) {
        if self.reject_after_start("axis correction") {
            return;
        }
        self.options.axis_correction = enabled;
    }

    pub fn set_recenter_on_host_camera(&mut self, enabled: bool) {
        if self.reject_after_start("seated recentering") {
            return;
        }
        self.options.recenter_on_host_camera = enabled;
    }

    /// Resolution the host view renders at; swapchains stay at the headset's.
    pub fn render_resolution(&self) -> Extent {
        self.session
            .resolution()
            .downscaled(self.options.downscale_factor)
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics::capture(&self.session, self.render_resolution())
    }

    /// Runs one host tick. Transient failures skip the tick instead of erroring.
    pub fn render<V>(&mut self, host: &mut V, camera: &HostCamera) -> TickOutcome
    where
        V: HostView<B::Target>,
    {
        if let Err(err) = self.session.poll_events() {
            log::debug!("[render] event poll: {err}");
            if !self.session.is_session_running() {
                self.release_targets();
            }
            return TickOutcome::Skipped(SkipReason::PollFailed);
        }

        if !self.session.is_session_running() {
            self.release_targets();
            return TickOutcome::Skipped(SkipReason::NotRunning);
        }

        if let Err(err) = self.session.wait_next_frame() {
            log::debug!("[render] frame wait: {err}");
            return TickOutcome::Skipped(SkipReason::WaitFailed);
        }

        let render_extent = self.render_resolution();
        host.set_resolution(render_extent);

        let views: Vec<View> = self.session.views();
        let swapchain_extent = self.session.resolution();
        let projection = ProjectionOptions {
            axis_correction: self.options.axis_correction,
            recenter_on: self
                .options
                .recenter_on_host_camera
                .then_some(camera.position),
            znear: camera.znear,
            zfar: camera.zfar,
        };
        let clear_color = self.options.clear_color;
        let preview = self.backend.preview_extent();

        let pool = &mut self.pool;
        let backend = &mut self.backend;
        let submitted = self.session.submit_frame(|view_index, image| {
            let (Some(eye), Some(view)) = (Eye::from_view_index(view_index), views.get(view_index))
            else {
                log::warn!("[render] no eye for view {view_index}");
                return false;
            };
            let camera = EyeCamera::from_view(view, &projection, render_extent);
            let target = match pool.get_render_target(
                &mut *backend,
                image,
                swapchain_extent.width,
                swapchain_extent.height,
            ) {
                Ok(target) => target,
                Err(err) => {
                    log::warn!("[render] {} eye target unavailable: {err}", eye.label());
                    return false;
                }
            };

            target.clear(clear_color);
            target.bind();
            host.render_eye(eye, &target, &camera);
            target.unbind();

            if let Some(preview) = preview {
                if let Err(err) = backend.blit_preview(&target, PreviewViewport::for_eye(eye, preview)) {
                    log::warn!("[render] preview blit for {} eye failed: {err}", eye.label());
                }
            }
            true
        });

        match submitted {
            Ok(submission) => {
                if submission.rendered && preview.is_some() {
                    let indicator = self
                        .focus
                        .as_ref()
                        .map(FocusIndicator::color)
                        .unwrap_or([0.0, 0.0, 0.0, 0.0]);
                    if let Err(err) = self.backend.finish_preview(indicator) {
                        log::warn!("[render] preview finish failed: {err}");
                    }
                }
                TickOutcome::Rendered(submission)
            }
            Err(err) => {
                log::warn!("[render] frame submission failed: {err}");
                TickOutcome::Skipped(SkipReason::SubmitFailed)
            }
        }
    }

    fn release_targets(&mut self) {
        if !self.session.session_started() && !self.pool.is_empty() {
            self.pool.clear();
        }
    }

    /// Closes the session and drops every cached target.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        let closed = self.session.terminate();
        self.pool.clear();
        closed.map_err(RenderError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vr::SimulatedRuntime;

    #[derive(Default)]
    struct CountingView {
        resolution: Extent,
        eyes: Vec<Eye>,
    }

    impl HostView<NullRenderTarget> for CountingView {
        fn set_resolution(&mut self, extent: Extent) {
            self.resolution = extent;
        }

        fn render_eye(&mut self, eye: Eye, target: &NullRenderTarget, _camera: &EyeCamera) {
            assert!(target.is_bound());
            self.eyes.push(eye);
        }
    }

    fn started_renderer(
        backend: NullGraphicsBackend,
    ) -> StereoRenderer<SimulatedRuntime, NullGraphicsBackend> {
        let config = XrConfig::default();
        let mut session = HmdSession::new(SimulatedRuntime::new(), &config);
        session.init().expect("init");
        session.start_session(()).expect("start");
        StereoRenderer::new(session, backend, StereoOptions::from_config(&config))
    }

    #[test]
    fn preview_halves_split_the_surface() {
        let preview = Extent::new(1280, 720);
        assert_eq!(
            PreviewViewport::for_eye(Eye::Left, preview),
            PreviewViewport { x: 0, y: 0, width: 640, height: 720 }
        );
        assert_eq!(PreviewViewport::for_eye(Eye::Right, preview).x, 640);
    }

    #[test]
    fn tick_renders_both_eyes_and_blits_preview() {
        let focus = FocusIndicator::new();
        let mut renderer = started_renderer(NullGraphicsBackend::with_preview(Extent::new(1280, 720)))
            .with_focus_indicator(focus.clone());
        let mut view = CountingView::default();

        let outcome = renderer.render(&mut view, &HostCamera::default());
        assert!(outcome.is_rendered());
        assert_eq!(view.eyes, vec![Eye::Left, Eye::Right]);

        let blits = renderer.backend().blits();
        assert_eq!(blits.len(), 2);
        assert_eq!(blits[0].1.x, 0);
        assert_eq!(blits[1].1.x, 640);
        assert!(renderer.backend().last_indicator().is_some());
    }

    #[test]
    fn options_are_frozen_once_started() {
        let mut renderer = started_renderer(NullGraphicsBackend::default());
        renderer.set_downscale_factor(4);
        renderer.set_axis_correction(false);
        assert_eq!(renderer.options().downscale_factor, 1);
        assert!(renderer.options().axis_correction);
    }

    #[test]
    fn stopped_session_skips_tick() {
        let mut session = HmdSession::new(SimulatedRuntime::new(), &XrConfig::default());
        session.init().expect("init");
        let mut renderer =
            StereoRenderer::new(session, NullGraphicsBackend::default(), StereoOptions::default());
        let mut view = CountingView::default();

        let outcome = renderer.render(&mut view, &HostCamera::default());
        assert_eq!(outcome, TickOutcome::Skipped(SkipReason::NotRunning));
        assert!(view.eyes.is_empty());
    }

    #[test]
    fn focus_indicator_follows_hooks() {
        let mut focus = FocusIndicator::new();
        let observer = focus.clone();
        focus.on_visible();
        assert_eq!(observer.state(), HeadsetFocus::Visible);
        focus.on_focused();
        assert_eq!(observer.state(), HeadsetFocus::Focused);
        focus.on_idle();
        assert_eq!(observer.color(), [0.8, 0.1, 0.1, 1.0]);
    }
}
