// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Pinhole camera model and its multi-resolution pyramid.
//!
//! The `CameraPyramid` is constructed once, shared (read-only) by the
//! optimizer instances, and must stay alive for their entire lifetime.

use crate::misc::type_aliases::{Float, Point2, Point3, Vec3};

/// Intrinsic parameters of a pinhole camera at one pyramid level.
#[derive(PartialEq, Debug, Clone)]
pub struct Intrinsics {
    /// Horizontal focal length (in pixels).
    pub fx: Float,
    /// Vertical focal length (in pixels).
    pub fy: Float,
    /// Skew coefficient, 0 for most cameras.
    pub skew: Float,
    /// Horizontal coordinate of the principal point.
    pub cx: Float,
    /// Vertical coordinate of the principal point.
    pub cy: Float,
}

impl Intrinsics {
    /// Project a 3D point in the camera frame onto the image plane.
    ///
    /// Returns homogeneous pixel coordinates `(u*z, v*z, z)`.
    /// Perspective division is left to the caller since it often wants
    /// to check the sign of `z` first.
    pub fn project(&self, point: Point3) -> Vec3 {
        Vec3::new(
            self.fx * point[0] + self.skew * point[1] + self.cx * point[2],
            self.fy * point[1] + self.cy * point[2],
            point[2],
        )
    }

    /// Back-project a pixel with known depth to a 3D point in the camera frame.
    pub fn back_project(&self, pixel: Point2, depth: Float) -> Point3 {
        let y = (pixel[1] - self.cy) * depth / self.fy;
        let x = ((pixel[0] - self.cx) * depth - self.skew * y) / self.fx;
        Point3::new(x, y, depth)
    }

    /// Intrinsics of the same camera at half the image resolution.
    ///
    /// The `(c + 0.5) / 2 - 0.5` rule keeps the principal point aligned
    /// with the pixel centers of the downsampled image.
    pub fn half_res(&self) -> Intrinsics {
        Intrinsics {
            fx: self.fx / 2.0,
            fy: self.fy / 2.0,
            skew: self.skew / 2.0,
            cx: (self.cx + 0.5) / 2.0 - 0.5,
            cy: (self.cy + 0.5) / 2.0 - 0.5,
        }
    }
}

/// Pyramid of camera intrinsics, one per resolution level.
///
/// Level 0 is the full resolution camera, each level halves the previous one.
#[derive(PartialEq, Debug, Clone)]
pub struct CameraPyramid {
    levels: Vec<Intrinsics>,
}

impl CameraPyramid {
    /// Build a camera pyramid with `nb_levels` levels from the
    /// full resolution intrinsics.
    pub fn new(nb_levels: usize, intrinsics: Intrinsics) -> Self {
        assert!(nb_levels > 0, "a camera pyramid needs at least one level");
        let mut levels = Vec::with_capacity(nb_levels);
        levels.push(intrinsics);
        for _ in 1..nb_levels {
            let next = levels.last().unwrap().half_res();
            levels.push(next);
        }
        CameraPyramid { levels }
    }

    /// Number of resolution levels.
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Intrinsics at the given level (0 = full resolution).
    pub fn at(&self, level: usize) -> &Intrinsics {
        &self.levels[level]
    }
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use approx::assert_relative_eq;

    fn fr3_like() -> Intrinsics {
        Intrinsics {
            fx: 535.4,
            fy: 539.2,
            skew: 0.0,
            cx: 320.1,
            cy: 247.6,
        }
    }

    #[test]
    fn project_back_project_round_trip() {
        let intrinsics = fr3_like();
        let point = Point3::new(0.3, -0.2, 1.7);
        let uvz = intrinsics.project(point);
        let pixel = Point2::new(uvz.x / uvz.z, uvz.y / uvz.z);
        let back = intrinsics.back_project(pixel, point.z);
        assert_relative_eq!(point, back, epsilon = 1e-4);
    }

    #[test]
    fn back_project_with_skew() {
        let mut intrinsics = fr3_like();
        intrinsics.skew = 2.5;
        let point = Point3::new(-0.4, 0.1, 2.3);
        let uvz = intrinsics.project(point);
        let pixel = Point2::new(uvz.x / uvz.z, uvz.y / uvz.z);
        let back = intrinsics.back_project(pixel, point.z);
        assert_relative_eq!(point, back, epsilon = 1e-4);
    }

    #[test]
    fn pyramid_halves_focal_each_level() {
        let camera = CameraPyramid::new(4, fr3_like());
        assert_eq!(camera.level_count(), 4);
        for level in 1..4 {
            assert_relative_eq!(
                camera.at(level).fx,
                camera.at(level - 1).fx / 2.0,
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn half_res_principal_point_rule() {
        let intrinsics = fr3_like();
        let half = intrinsics.half_res();
        assert_relative_eq!(half.cx, (intrinsics.cx + 0.5) / 2.0 - 0.5, epsilon = 1e-6);
        assert_relative_eq!(half.cy, (intrinsics.cy + 0.5) / 2.0 - 0.5, epsilon = 1e-6);
    }
}
