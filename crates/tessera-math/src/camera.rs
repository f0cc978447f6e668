// SPDX-License-Identifier: CEPL-1.0
use glam::{Mat3, Mat4, Vec3};

/// First-person camera.
///
/// `x_rotation` turns around the vertical axis (yaw) and `y_rotation` tilts
/// up and down (pitch). Both are stored in degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub x_rotation: f32,
    pub y_rotation: f32,
    pub near: f32,
    pub far: f32,
    pub fov_y_degrees: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 4.0, 0.0),
            x_rotation: 0.0,
            y_rotation: 0.0,
            near: 0.1,
            far: 1000.0,
            fov_y_degrees: 90.0,
        }
    }
}

impl Camera {
    pub fn rotation(&self) -> Mat3 {
        Mat3::from_rotation_x(-self.y_rotation.to_radians())
            * Mat3::from_rotation_y(-self.x_rotation.to_radians())
    }

    pub fn view(&self) -> Mat4 {
        Mat4::from_mat3(self.rotation()) * Mat4::from_translation(-self.position)
    }

    /// Depth range is 0..1. Y is flipped by the viewport, not here.
    pub fn projection(&self, aspect: f32) -> Mat4 {
        let aspect = if aspect.is_finite() && aspect > 0.0 { aspect } else { 1.0 };
        Mat4::perspective_rh(self.fov_y_degrees.to_radians(), aspect, self.near, self.far)
    }

    /// Unit vector the camera looks along.
    pub fn forward(&self) -> Vec3 {
        self.rotation().transpose() * Vec3::NEG_Z
    }

    pub fn right(&self) -> Vec3 {
        self.rotation().transpose() * Vec3::X
    }

    /// Applies a mouse-look delta in degrees, clamping pitch short of the poles.
    pub fn rotate(&mut self, yaw: f32, pitch: f32) {
        self.x_rotation = (self.x_rotation + yaw).rem_euclid(360.0);
        self.y_rotation = (self.y_rotation + pitch).clamp(-89.0, 89.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-4
    }

    #[test]
    fn default_camera_sits_above_origin() {
        let cam = Camera::default();
        assert_eq!(cam.position, Vec3::new(0.0, 4.0, 0.0));
        assert_eq!(cam.fov_y_degrees, 90.0);
    }

    #[test]
    fn view_moves_camera_to_origin() {
        let cam = Camera {
            position: Vec3::new(3.0, 4.0, -2.0),
            ..Default::default()
        };
        let p = cam.view().transform_point3(cam.position);
        assert!(approx(p, Vec3::ZERO));
    }

    #[test]
    fn forward_points_down_negative_z_without_rotation() {
        let cam = Camera::default();
        assert!(approx(cam.forward(), Vec3::NEG_Z));
        assert!(approx(cam.right(), Vec3::X));
    }

    #[test]
    fn point_ahead_lands_in_front_after_yaw() {
        let mut cam = Camera {
            position: Vec3::ZERO,
            ..Default::default()
        };
        cam.rotate(90.0, 0.0);
        let ahead = cam.forward() * 5.0;
        let in_view = cam.view().transform_point3(ahead);
        assert!(approx(in_view, Vec3::new(0.0, 0.0, -5.0)));
    }

    #[test]
    fn pitch_is_clamped() {
        let mut cam = Camera::default();
        cam.rotate(0.0, 500.0);
        assert_eq!(cam.y_rotation, 89.0);
    }

    #[test]
    fn projection_maps_near_plane_to_zero_depth() {
        let cam = Camera::default();
        let clip = cam.projection(16.0 / 9.0) * glam::Vec4::new(0.0, 0.0, -cam.near, 1.0);
        assert!((clip.z / clip.w).abs() < 1e-5);
    }
}
