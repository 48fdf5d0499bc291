//! Head-mounted display session management and stereo frame submission.
//!
//! [`vr::HmdSession`] drives the device runtime through its lifecycle,
//! [`vr::FrameScheduler`] paces frames, and [`render::StereoRenderer`] ties both
//! to a host scene and a graphics backend once per render-loop tick.

pub mod config;
pub mod diagnostics;
pub mod render;
pub mod vr;

pub use config::{ConfigError, ReferenceSpaceMode, XrConfig};
pub use diagnostics::Diagnostics;
pub use render::{
    GraphicsBackend, HostCamera, HostView, NullGraphicsBackend, RenderError, RenderResult,
    StereoOptions, StereoRenderer, TickOutcome,
};
pub use vr::{HmdSession, SessionStatus, SimulatedRuntime, VrError, VrResult, XrRuntime};
