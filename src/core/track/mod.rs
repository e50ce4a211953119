// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Types and functions to track a camera between two RGB-D frames.

pub mod lm;
pub mod residuals;
pub mod robust;

use thiserror::Error;

/// Structural failures of the tracking optimizer.
///
/// Rejected Levenberg-Marquardt steps are recovered locally by damping
/// adaptation and never surface here. Reaching the iteration cap without
/// convergence is a normal termination, not an error.
#[derive(Debug, Error)]
pub enum TrackError {
    /// Invalid hyperparameters at construction or reset.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A pyramid level yields too few valid residuals,
    /// i.e. no geometric/photometric overlap between the frames.
    #[error("insufficient overlap at pyramid level {level}: {count} valid residuals")]
    InsufficientData {
        /// Pyramid level at which the failure occurred.
        level: usize,
        /// Number of valid residuals found at that level.
        count: usize,
    },
    /// The damped normal equations are singular beyond recovery.
    #[error("normal equations are singular at pyramid level {level}")]
    Numerical {
        /// Pyramid level at which the failure occurred.
        level: usize,
    },
}

// Synthetic scenes shared by the tracking tests ###############################

#[cfg(test)]
pub(crate) mod synthetic {

    use crate::core::camera::Intrinsics;
    use crate::misc::type_aliases::{DMat, Float, Iso3, Vec3};

    /// Smooth textured intensity as a function of scene coordinates.
    pub fn scene_intensity(x: Float, y: Float) -> Float {
        0.5 + 0.3 * (7.0 * x).sin() * (5.0 * y).cos() + 0.15 * (3.0 * x + 2.0 * y).sin()
    }

    /// Intrinsics for a small synthetic camera of the given image size.
    pub fn camera(width: usize, height: usize) -> Intrinsics {
        Intrinsics {
            fx: 0.9 * width as Float,
            fy: 0.9 * width as Float,
            skew: 0.0,
            cx: (width as Float - 1.0) / 2.0,
            cy: (height as Float - 1.0) / 2.0,
        }
    }

    /// A slanted textured plane `z = z0 + slope_x * x + slope_y * y`
    /// (in frame 1 coordinates), rendered analytically so that frame
    /// pairs are exact up to float rounding.
    pub struct PlaneScene {
        pub z0: Float,
        pub slope_x: Float,
        pub slope_y: Float,
    }

    impl Default for PlaneScene {
        fn default() -> Self {
            PlaneScene {
                z0: 1.0,
                slope_x: 0.1,
                slope_y: -0.05,
            }
        }
    }

    impl PlaneScene {
        /// Plane normal `m` such that the plane is `m . X = z0`.
        fn normal(&self) -> Vec3 {
            Vec3::new(-self.slope_x, -self.slope_y, 1.0)
        }

        /// Intensity and depth images seen from frame 1.
        pub fn render_reference(
            &self,
            height: usize,
            width: usize,
            k: &Intrinsics,
        ) -> (DMat, DMat) {
            let m = self.normal();
            let mut intensity = DMat::zeros(height, width);
            let mut depth = DMat::zeros(height, width);
            for i in 0..height {
                for j in 0..width {
                    let dir = Vec3::new(
                        (j as Float - k.cx) / k.fx,
                        (i as Float - k.cy) / k.fy,
                        1.0,
                    );
                    let lambda = self.z0 / m.dot(&dir);
                    let point = lambda * dir;
                    intensity[(i, j)] = scene_intensity(point.x, point.y);
                    depth[(i, j)] = point.z;
                }
            }
            (intensity, depth)
        }

        /// Intensity image seen from frame 2, where frame 2's camera is
        /// placed such that `X_2 = motion * X_1`.
        pub fn render_transformed(
            &self,
            height: usize,
            width: usize,
            k: &Intrinsics,
            motion: &Iso3,
        ) -> DMat {
            let m = self.normal();
            let inverse = motion.inverse();
            let offset = inverse.translation.vector;
            let mut intensity = DMat::zeros(height, width);
            for i in 0..height {
                for j in 0..width {
                    let dir = Vec3::new(
                        (j as Float - k.cx) / k.fx,
                        (i as Float - k.cy) / k.fy,
                        1.0,
                    );
                    // Intersect the frame 2 viewing ray with the plane,
                    // expressed in frame 1 coordinates.
                    let rotated_dir = inverse.rotation * dir;
                    let lambda = (self.z0 - m.dot(&offset)) / m.dot(&rotated_dir);
                    let point = lambda * rotated_dir + offset;
                    intensity[(i, j)] = scene_intensity(point.x, point.y);
                }
            }
            intensity
        }
    }
}
