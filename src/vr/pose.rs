//! Pure conversions from runtime view data to renderer-ready camera parameters.

use super::{Extent, Fov, Pose, View};
use glam::{Mat4, Quat, Vec2, Vec3, Vec4};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AngleUnit {
    #[default]
    Radian,
    Degree,
}

impl AngleUnit {
    fn apply(self, radians: f32) -> f32 {
        match self {
            AngleUnit::Radian => radians,
            AngleUnit::Degree => radians.to_degrees(),
        }
    }
}

/// Roll (x), pitch (y), yaw (z) of a unit quaternion.
pub fn quaternion_to_euler(q: Quat, unit: AngleUnit) -> Vec3 {
    let (x, y, z, w) = (q.x as f64, q.y as f64, q.z as f64, q.w as f64);

    let sinr_cosp = 2.0 * (w * x + y * z);
    let cosr_cosp = 1.0 - 2.0 * (x * x + y * y);
    let roll = sinr_cosp.atan2(cosr_cosp);

    // Clamp so rounding near the poles never feeds sqrt a negative.
    let s = 2.0 * (w * y - x * z);
    let sinp = (1.0 + s).max(0.0).sqrt();
    let cosp = (1.0 - s).max(0.0).sqrt();
    let pitch = 2.0 * sinp.atan2(cosp) - std::f64::consts::FRAC_PI_2;

    let siny_cosp = 2.0 * (w * z + x * y);
    let cosy_cosp = 1.0 - 2.0 * (y * y + z * z);
    let yaw = siny_cosp.atan2(cosy_cosp);

    Vec3::new(
        unit.apply(roll as f32),
        unit.apply(pitch as f32),
        unit.apply(yaw as f32),
    )
}

/// Inverse of [`quaternion_to_euler`] for radian input.
pub fn euler_to_quaternion(roll: f32, pitch: f32, yaw: f32) -> Quat {
    let (sr, cr) = (roll * 0.5).sin_cos();
    let (sp, cp) = (pitch * 0.5).sin_cos();
    let (sy, cy) = (yaw * 0.5).sin_cos();
    Quat::from_xyzw(
        sr * cp * cy - cr * sp * sy,
        cr * sp * cy + sr * cp * sy,
        cr * cp * sy - sr * sp * cy,
        cr * cp * cy + sr * sp * sy,
    )
}

/// Half-angles ordered left, right, down, up.
pub fn field_of_view(fov: &Fov, unit: AngleUnit) -> Vec4 {
    Vec4::new(
        unit.apply(fov.angle_left),
        unit.apply(fov.angle_right),
        unit.apply(fov.angle_down),
        unit.apply(fov.angle_up),
    )
}

/// Horizontal (right - left) and vertical (up - down) extent.
pub fn hv_field_of_view(fov: &Fov, unit: AngleUnit) -> Vec2 {
    Vec2::new(
        unit.apply(fov.angle_right - fov.angle_left),
        unit.apply(fov.angle_up - fov.angle_down),
    )
}

/// Normalized screen center of an asymmetric frustum; (0.5, 0.5) when symmetric.
pub fn screen_center(fov: &Fov) -> Vec2 {
    let tan_left = fov.angle_left.abs().tan();
    let tan_right = fov.angle_right.abs().tan();
    let tan_up = fov.angle_up.abs().tan();
    let tan_down = fov.angle_down.abs().tan();
    Vec2::new(
        ratio(tan_left, tan_left + tan_right),
        ratio(tan_down, tan_down + tan_up),
    )
}

fn ratio(part: f32, total: f32) -> f32 {
    if total <= f32::EPSILON {
        0.5
    } else {
        part / total
    }
}

/// Half-turn about X: runtime space (+Y up, -Z forward) into +Y down, +Z forward.
pub fn axis_correction() -> Quat {
    Quat::from_rotation_x(PI)
}

pub fn correct_axes(pose: Pose) -> Pose {
    let correction = axis_correction();
    Pose {
        orientation: (correction * pose.orientation).normalize(),
        position: Vec3::new(pose.position.x, -pose.position.y, -pose.position.z),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionOptions {
    pub axis_correction: bool,
    /// Added to the eye position when recentering on the host camera.
    pub recenter_on: Option<Vec3>,
    pub znear: f32,
    pub zfar: f32,
}

impl Default for ProjectionOptions {
    fn default() -> Self {
        Self {
            axis_correction: false,
            recenter_on: None,
            znear: 0.01,
            zfar: 1000.0,
        }
    }
}

/// Per-eye camera handed to the host render entry point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeCamera {
    pub position: Vec3,
    pub orientation: Quat,
    /// Vertical field of view, radians.
    pub fov_y: f32,
    pub aspect: f32,
    /// Off-axis principal point in [0, 1]; (0.5, 0.5) is centered.
    pub principal_point: Vec2,
    pub znear: f32,
    pub zfar: f32,
}

impl EyeCamera {
    pub fn from_view(view: &View, options: &ProjectionOptions, extent: Extent) -> Self {
        let pose = if options.axis_correction {
            correct_axes(view.pose)
        } else {
            view.pose
        };
        let position = match options.recenter_on {
            Some(origin) => pose.position + origin,
            None => pose.position,
        };

        Self {
            position,
            orientation: pose.orientation,
            fov_y: view.fov.angle_up - view.fov.angle_down,
            aspect: extent.aspect(),
            principal_point: Vec2::ONE - screen_center(&view.fov),
            znear: options.znear,
            zfar: options.zfar,
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.orientation, self.position).inverse()
    }

    /// Right-handed off-axis perspective with a [0, 1] depth range.
    pub fn projection_matrix(&self) -> Mat4 {
        let tan_v = (self.fov_y * 0.5).tan();
        let tan_h = tan_v * self.aspect;

        let right = 2.0 * tan_h * self.principal_point.x;
        let left = right - 2.0 * tan_h;
        let top = 2.0 * tan_v * self.principal_point.y;
        let bottom = top - 2.0 * tan_v;

        let depth = self.znear - self.zfar;
        Mat4::from_cols(
            Vec4::new(2.0 / (right - left), 0.0, 0.0, 0.0),
            Vec4::new(0.0, 2.0 / (top - bottom), 0.0, 0.0),
            Vec4::new(
                (right + left) / (right - left),
                (top + bottom) / (top - bottom),
                self.zfar / depth,
                -1.0,
            ),
            Vec4::new(0.0, 0.0, self.znear * self.zfar / depth, 0.0),
        )
    }
}

/// Inter-pupillary distance in centimeters.
pub fn interpupillary_distance_cm(left: &Pose, right: &Pose) -> f32 {
    left.position.distance(right.position) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::f32::consts::FRAC_PI_2;

    fn asymmetric_fov() -> Fov {
        Fov {
            angle_left: -0.90,
            angle_right: 0.76,
            angle_up: 0.81,
            angle_down: -0.92,
        }
    }

    #[test]
    fn symmetric_fov_is_centered() {
        let center = screen_center(&Fov::symmetric(1.6, 1.7));
        assert!((center.x - 0.5).abs() < 1e-6);
        assert!((center.y - 0.5).abs() < 1e-6);
    }

    #[test]
    fn asymmetric_fov_shifts_center_toward_wider_side() {
        let center = screen_center(&asymmetric_fov());
        assert!(center.x > 0.5, "wider left half should push the center right");
        assert!(center.y > 0.5, "wider bottom half should push the center up");
        assert_eq!(center, screen_center(&asymmetric_fov()));
    }

    #[test]
    fn hv_fov_spans_both_halves() {
        let hv = hv_field_of_view(&asymmetric_fov(), AngleUnit::Radian);
        assert!((hv.x - 1.66).abs() < 1e-5);
        assert!((hv.y - 1.73).abs() < 1e-5);

        let fov = field_of_view(&Fov::symmetric(PI / 2.0, PI / 2.0), AngleUnit::Degree);
        assert!((fov.x + 45.0).abs() < 1e-4);
        assert!((fov.w - 45.0).abs() < 1e-4);
    }

    #[test]
    fn pitch_at_the_pole_stays_finite() {
        let q = Quat::from_rotation_y(FRAC_PI_2);
        let euler = quaternion_to_euler(q, AngleUnit::Radian);
        assert!(euler.is_finite());
        assert!((euler.y - FRAC_PI_2).abs() < 1e-3);
    }

    #[test]
    fn axis_correction_flips_up_and_forward() {
        let pose = Pose {
            orientation: Quat::IDENTITY,
            position: Vec3::new(0.1, 1.6, -0.5),
        };
        let corrected = correct_axes(pose);
        assert_eq!(corrected.position, Vec3::new(0.1, -1.6, 0.5));
        let up = corrected.orientation * Vec3::Y;
        assert!((up - Vec3::NEG_Y).length() < 1e-5);
    }

    #[test]
    fn camera_recenters_on_host_position() {
        let view = View {
            pose: Pose {
                orientation: Quat::IDENTITY,
                position: Vec3::new(-0.03, 0.0, 0.0),
            },
            fov: asymmetric_fov(),
        };
        let options = ProjectionOptions {
            recenter_on: Some(Vec3::new(1.0, 2.0, 3.0)),
            ..ProjectionOptions::default()
        };
        let camera = EyeCamera::from_view(&view, &options, Extent::new(1832, 1920));
        assert!((camera.position - Vec3::new(0.97, 2.0, 3.0)).length() < 1e-6);
        assert!((camera.fov_y - 1.73).abs() < 1e-5);
        assert!((camera.aspect - 1832.0 / 1920.0).abs() < 1e-6);
        assert!(camera.principal_point.x < 0.5);
    }

    #[test]
    fn centered_projection_matches_symmetric_perspective() {
        let camera = EyeCamera {
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            fov_y: 1.2,
            aspect: 1.5,
            principal_point: Vec2::splat(0.5),
            znear: 0.1,
            zfar: 100.0,
        };
        let expected = Mat4::perspective_rh(1.2, 1.5, 0.1, 100.0);
        assert!(camera.projection_matrix().abs_diff_eq(expected, 1e-5));
    }

    #[test]
    fn off_axis_projection_maps_frustum_edges_to_clip_bounds() {
        let fov = asymmetric_fov();
        let view = View {
            pose: Pose::IDENTITY,
            fov,
        };
        let extent = Extent::new(1000, 1000);
        let mut camera = EyeCamera::from_view(&view, &ProjectionOptions::default(), extent);
        // Tie the aspect to the FOV so the frustum edges line up with the half-angles.
        camera.aspect = (fov.angle_right.tan() - fov.angle_left.tan())
            / (fov.angle_up.tan() - fov.angle_down.tan());
        camera.fov_y = 2.0 * ((fov.angle_up.tan() - fov.angle_down.tan()) * 0.5).atan();

        let projection = camera.projection_matrix();
        let right_edge = projection * Vec4::new(fov.angle_right.tan(), 0.0, -1.0, 1.0);
        let left_edge = projection * Vec4::new(fov.angle_left.tan(), 0.0, -1.0, 1.0);
        assert!((right_edge.x / right_edge.w - 1.0).abs() < 1e-4);
        assert!((left_edge.x / left_edge.w + 1.0).abs() < 1e-4);
    }

    #[test]
    fn ipd_is_reported_in_centimeters() {
        let left = Pose {
            position: Vec3::new(-0.0315, 1.6, 0.0),
            ..Pose::IDENTITY
        };
        let right = Pose {
            position: Vec3::new(0.0315, 1.6, 0.0),
            ..Pose::IDENTITY
        };
        assert!((interpupillary_distance_cm(&left, &right) - 6.3).abs() < 1e-4);
    }

    proptest! {
        #[test]
        fn screen_center_stays_in_unit_square(
            left in 0.1f32..1.4,
            right in 0.1f32..1.4,
            up in 0.1f32..1.4,
            down in 0.1f32..1.4,
        ) {
            let fov = Fov { angle_left: -left, angle_right: right, angle_up: up, angle_down: -down };
            let center = screen_center(&fov);
            prop_assert!(center.x > 0.0 && center.x < 1.0);
            prop_assert!(center.y > 0.0 && center.y < 1.0);
        }

        #[test]
        fn euler_decomposition_inverts_composition(
            roll in -3.0f32..3.0,
            pitch in -1.4f32..1.4,
            yaw in -3.0f32..3.0,
        ) {
            let q = euler_to_quaternion(roll, pitch, yaw);
            let euler = quaternion_to_euler(q, AngleUnit::Radian);
            let rebuilt = euler_to_quaternion(euler.x, euler.y, euler.z);
            prop_assert!(rebuilt.dot(q).abs() > 1.0 - 1e-4);
        }
    }
}
