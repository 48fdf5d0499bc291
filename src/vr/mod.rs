pub mod frame;
#[cfg(feature = "vr-openxr")]
pub mod openxr;
pub mod pose;
pub mod session;
pub mod simulated;

pub use frame::{
    FrameScheduler, FrameSubmission, HeldImage, RefreshReport, RefreshTracker, ViewSlot,
};
pub use pose::{AngleUnit, EyeCamera, ProjectionOptions};
pub use session::{HmdSession, SessionStatus};
pub use simulated::{RuntimeCall, SimulatedRuntime};

use crate::config::ReferenceSpaceMode;
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Number of views in a primary stereo configuration.
pub const STEREO_VIEW_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    pub const fn both() -> [Eye; 2] {
        [Eye::Left, Eye::Right]
    }

    pub fn from_view_index(index: usize) -> Option<Eye> {
        match index {
            0 => Some(Eye::Left),
            1 => Some(Eye::Right),
            _ => None,
        }
    }

    pub fn view_index(self) -> usize {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Eye::Left => "LEFT",
            Eye::Right => "RIGHT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Integer downscale; a factor of zero is treated as one.
    pub fn downscaled(self, factor: u32) -> Self {
        let factor = factor.max(1);
        Self {
            width: self.width / factor,
            height: self.height / factor,
        }
    }

    pub fn aspect(self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// Opaque identity of a runtime-owned swapchain image (GL texture name, Vulkan image, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ImageHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub orientation: Quat,
    pub position: Vec3,
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        orientation: Quat::IDENTITY,
        position: Vec3::ZERO,
    };
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Field of view as four half-angles in radians. Left and down are usually negative.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

impl Fov {
    pub fn symmetric(horizontal: f32, vertical: f32) -> Self {
        Self {
            angle_left: -horizontal * 0.5,
            angle_right: horizontal * 0.5,
            angle_up: vertical * 0.5,
            angle_down: -vertical * 0.5,
        }
    }
}

/// One eye's pose and field of view at the predicted display time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct View {
    pub pose: Pose,
    pub fov: Fov,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameState {
    /// Runtime clock, nanoseconds.
    pub predicted_display_time: i64,
    pub predicted_display_period: i64,
    pub should_render: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewConfiguration {
    pub recommended: Extent,
    pub max: Extent,
    pub recommended_sample_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainRequest {
    pub extent: Extent,
    pub sample_count: u32,
    pub format: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainInfo {
    pub images: Vec<ImageHandle>,
    pub extent: Extent,
    pub format: i64,
}

impl SwapchainInfo {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionView {
    pub view_index: usize,
    pub pose: Pose,
    pub fov: Fov,
    pub extent: Extent,
}

/// The single projection composition layer submitted at frame end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectionLayer {
    pub views: Vec<ProjectionView>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub application_name: String,
    pub engine_name: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub name: String,
    pub version: String,
}

impl Default for RuntimeInfo {
    fn default() -> Self {
        Self {
            name: "unknown".to_string(),
            version: "unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceSpaceType {
    View,
    Local,
    Stage,
}

impl ReferenceSpaceType {
    pub fn label(self) -> &'static str {
        match self {
            ReferenceSpaceType::View => "VIEW",
            ReferenceSpaceType::Local => "LOCAL",
            ReferenceSpaceType::Stage => "STAGE",
        }
    }
}

impl From<ReferenceSpaceMode> for ReferenceSpaceType {
    fn from(mode: ReferenceSpaceMode) -> Self {
        match mode {
            ReferenceSpaceMode::Seated => ReferenceSpaceType::Local,
            ReferenceSpaceMode::Standing => ReferenceSpaceType::Stage,
        }
    }
}

/// Session state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RuntimeSessionState {
    #[default]
    Unknown,
    Idle,
    Ready,
    Synchronized,
    Visible,
    Focused,
    Stopping,
    LossPending,
    Exiting,
}

impl RuntimeSessionState {
    pub fn label(self) -> &'static str {
        match self {
            RuntimeSessionState::Unknown => "UNKNOWN",
            RuntimeSessionState::Idle => "IDLE",
            RuntimeSessionState::Ready => "READY",
            RuntimeSessionState::Synchronized => "SYNCHRONIZED",
            RuntimeSessionState::Visible => "VISIBLE",
            RuntimeSessionState::Focused => "FOCUSED",
            RuntimeSessionState::Stopping => "STOPPING",
            RuntimeSessionState::LossPending => "LOSS_PENDING",
            RuntimeSessionState::Exiting => "EXITING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    SessionStateChanged(RuntimeSessionState),
    InstanceLossPending,
    InteractionProfileChanged,
    EventsLost(u32),
    Other(String),
}

#[derive(Debug, Error)]
pub enum VrError {
    #[error("runtime does not support required extension {0}")]
    MissingExtension(String),
    #[error("{call} failed: {reason}")]
    Runtime { call: &'static str, reason: String },
    #[error("runtime reported {0} views; a primary stereo configuration needs 2")]
    ViewConfiguration(usize),
    #[error("runtime offers no usable swapchain format")]
    NoSwapchainFormat,
    #[error("runtime connection has not been initialized")]
    NotInitialized,
    #[error("session is not running (status {0})")]
    SessionNotRunning(SessionStatus),
    #[error("session entered the failure state")]
    SessionFailed,
    #[error("view {view} acquired image {image} outside its swapchain")]
    InvalidImage { view: usize, image: usize },
    #[error("view {0} was not rendered by the host")]
    ViewNotRendered(usize),
    #[error("gave up waiting for {0} after {1} polls")]
    TransitionTimeout(&'static str, u32),
}

impl VrError {
    pub fn runtime(call: &'static str, reason: impl fmt::Display) -> Self {
        VrError::Runtime {
            call,
            reason: reason.to_string(),
        }
    }
}

pub type VrResult<T> = Result<T, VrError>;

/// The device runtime as seen by the session state machine and frame scheduler.
///
/// Calls map one-to-one onto the runtime API; sequencing, retries and state
/// tracking live in [`HmdSession`].
pub trait XrRuntime {
    /// Platform graphics binding forwarded untouched to session creation.
    type Binding;

    fn label(&self) -> &'static str;
    /// Name of the rendering-interop extension the graphics backend needs.
    fn graphics_extension(&self) -> &'static str;

    fn enumerate_extensions(&mut self) -> VrResult<Vec<String>>;
    fn create_instance(&mut self, app: &AppInfo, extensions: &[&str]) -> VrResult<RuntimeInfo>;
    fn select_hmd_system(&mut self) -> VrResult<()>;
    fn view_configuration(&mut self) -> VrResult<Vec<ViewConfiguration>>;
    fn check_graphics_requirements(&mut self) -> VrResult<()>;

    fn create_session(&mut self, binding: Self::Binding) -> VrResult<()>;
    fn create_reference_space(&mut self, space: ReferenceSpaceType) -> VrResult<()>;
    fn swapchain_formats(&mut self) -> VrResult<Vec<i64>>;
    fn create_swapchain(
        &mut self,
        view_index: usize,
        request: &SwapchainRequest,
    ) -> VrResult<SwapchainInfo>;

    /// Non-blocking; `Ok(None)` when the queue is empty.
    fn poll_event(&mut self) -> VrResult<Option<RuntimeEvent>>;
    fn begin_session(&mut self) -> VrResult<()>;
    fn end_session(&mut self) -> VrResult<()>;
    fn request_exit(&mut self) -> VrResult<()>;
    fn destroy_session(&mut self) -> VrResult<()>;
    fn destroy_instance(&mut self) -> VrResult<()>;

    /// Blocks until the runtime hands out the next frame timing.
    fn wait_frame(&mut self) -> VrResult<FrameState>;
    fn locate_views(&mut self, display_time: i64) -> VrResult<Vec<View>>;
    fn begin_frame(&mut self) -> VrResult<()>;
    fn acquire_image(&mut self, view_index: usize) -> VrResult<usize>;
    fn wait_image(&mut self, view_index: usize, timeout: Duration) -> VrResult<()>;
    fn release_image(&mut self, view_index: usize) -> VrResult<()>;
    fn end_frame(&mut self, display_time: i64, layer: Option<&ProjectionLayer>) -> VrResult<()>;

    /// Current time on the runtime clock, nanoseconds.
    fn now(&self) -> VrResult<i64>;
}

/// Lifecycle hooks invoked synchronously on the polling thread. Must not block.
pub trait SessionListener {
    fn on_idle(&mut self) {}
    fn on_visible(&mut self) {}
    fn on_focused(&mut self) {}
}

#[derive(Debug, Default)]
pub struct NoopListener;

impl SessionListener for NoopListener {}

/// Picks the preferred swapchain format if offered, otherwise the first offered one.
pub fn select_swapchain_format(offered: &[i64], preferred: Option<i64>) -> Option<i64> {
    let first = *offered.first()?;
    match preferred {
        Some(format) if offered.contains(&format) => Some(format),
        Some(format) => {
            log::info!("[xr] preferred swapchain format {format} unavailable; falling back to {first}");
            Some(first)
        }
        None => Some(first),
    }
}
