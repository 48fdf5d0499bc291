//! Read-only snapshot of session state for a UI layer.

use crate::vr::pose::interpupillary_distance_cm;
use crate::vr::{AngleUnit, Extent, Eye, HmdSession, RefreshReport, SessionStatus, XrRuntime};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EyeDiagnostics {
    pub eye: &'static str,
    /// Left, right, down, up in degrees.
    pub fov_degrees: [f32; 4],
    pub position: [f32; 3],
    /// Roll, pitch, yaw in degrees.
    pub orientation_degrees: [f32; 3],
    pub screen_center: [f32; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub status: SessionStatus,
    pub running: bool,
    pub visible: bool,
    pub focused: bool,
    pub runtime_name: String,
    pub runtime_version: String,
    pub reference_space: &'static str,
    pub headset_resolution: Extent,
    pub render_resolution: Extent,
    pub ipd_cm: Option<f32>,
    pub eyes: Vec<EyeDiagnostics>,
    pub refresh: RefreshReport,
}

impl Diagnostics {
    pub fn capture<R: XrRuntime>(session: &HmdSession<R>, render_resolution: Extent) -> Self {
        let eyes = Eye::both()
            .into_iter()
            .filter(|eye| session.view(*eye).is_some())
            .map(|eye| EyeDiagnostics {
                eye: eye.label(),
                fov_degrees: session.field_of_view(eye, AngleUnit::Degree).to_array(),
                position: session.pose_position(eye).to_array(),
                orientation_degrees: session.pose_orientation(eye, AngleUnit::Degree).to_array(),
                screen_center: session.screen_center(eye).to_array(),
            })
            .collect();

        let ipd_cm = match (session.view(Eye::Left), session.view(Eye::Right)) {
            (Some(left), Some(right)) => Some(interpupillary_distance_cm(&left.pose, &right.pose)),
            _ => None,
        };

        Self {
            status: session.status(),
            running: session.is_session_running(),
            visible: session.is_visible(),
            focused: session.is_focused(),
            runtime_name: session.runtime_name().to_string(),
            runtime_version: session.runtime_version().to_string(),
            reference_space: session.reference_space_label(),
            headset_resolution: session.resolution(),
            render_resolution,
            ipd_cm,
            eyes,
            refresh: session.refresh_report(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
