// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Photometric residuals and their Jacobian with respect to the twist.
//!
//! For every pixel of frame 1 with a valid depth, the pixel is
//! back-projected, moved by the current motion estimate, and projected
//! into frame 2. The residual is the difference between the bilinearly
//! interpolated frame 2 intensity and the frame 1 intensity. The Jacobian
//! row chains the interpolated image gradient, the pinhole projection
//! Jacobian, and the generators of rigid motion at the transformed point.
//!
//! Two kernels build the same system: a naive per-pixel loop parallelized
//! over image rows, and a vectorized kernel processing 4-pixel blocks with
//! a scalar tail. They must produce the same residual count, ordering
//! (row-major over frame 1), and values up to floating point rounding.
//! To that end both paths share the warp constants; the scalar path goes
//! through the camera model and the lane expressions mirror its arithmetic
//! operation for operation.

use rayon::prelude::*;
use wide::f32x4;

use crate::core::camera::Intrinsics;
use crate::misc::type_aliases::{DMat, DVec, Float, Iso3, Point2, Point3, Vec6};

/// Transformed points closer than this to the camera plane are dropped.
const MIN_DEPTH: Float = 1e-6;

const LANES: usize = 4;

/// Which residual/Jacobian kernel to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    /// Reference per-pixel loop, parallelized over rows.
    Naive,
    /// 4-wide SIMD blocks with scalar remainder handling.
    Vectorized,
}

/// Per-level observations needed to build the residual system.
pub struct Obs<'a> {
    /// Reference intensity image (frame 1).
    pub intensity_1: &'a DMat,
    /// Depth map of frame 1, in meters, 0 = invalid.
    pub depth_1: &'a DMat,
    /// Intensity image to align onto (frame 2).
    pub intensity_2: &'a DMat,
    /// Horizontal centered gradient of frame 2.
    pub gradient_x_2: &'a DMat,
    /// Vertical centered gradient of frame 2.
    pub gradient_y_2: &'a DMat,
    /// Camera intrinsics at this pyramid level.
    pub intrinsics: &'a Intrinsics,
}

/// Residual vector and Jacobian rows, one entry per valid pixel.
pub struct ResidualSystem {
    /// Photometric residuals `I2(warp(p)) - I1(p)`.
    pub residuals: DVec,
    /// Derivative of each residual with respect to the twist.
    pub jacobians: Vec<Vec6>,
}

impl ResidualSystem {
    /// Number of valid residuals.
    pub fn len(&self) -> usize {
        self.residuals.len()
    }

    /// True when no pixel was valid.
    pub fn is_empty(&self) -> bool {
        self.residuals.len() == 0
    }
}

/// Build the residual system with the requested kernel.
pub fn build(kernel: Kernel, obs: &Obs, motion: &Iso3) -> ResidualSystem {
    match kernel {
        Kernel::Naive => build_naive(obs, motion),
        Kernel::Vectorized => build_vectorized(obs, motion),
    }
}

/// Centered image gradients, zero on the image border.
pub fn gradients_centered(img: &DMat) -> (DMat, DMat) {
    let (h, w) = img.shape();
    let gx = DMat::from_fn(h, w, |i, j| {
        if j == 0 || j == w - 1 {
            0.0
        } else {
            0.5 * (img[(i, j + 1)] - img[(i, j - 1)])
        }
    });
    let gy = DMat::from_fn(h, w, |i, j| {
        if i == 0 || i == h - 1 {
            0.0
        } else {
            0.5 * (img[(i + 1, j)] - img[(i - 1, j)])
        }
    });
    (gx, gy)
}

/// Rigid motion unpacked into its rotation rows and translation,
/// so that both kernels apply exactly the same arithmetic.
struct Warp {
    r11: Float,
    r12: Float,
    r13: Float,
    r21: Float,
    r22: Float,
    r23: Float,
    r31: Float,
    r32: Float,
    r33: Float,
    t1: Float,
    t2: Float,
    t3: Float,
}

impl Warp {
    fn new(motion: &Iso3) -> Self {
        let m = motion.to_homogeneous();
        Warp {
            r11: m[(0, 0)],
            r12: m[(0, 1)],
            r13: m[(0, 2)],
            r21: m[(1, 0)],
            r22: m[(1, 1)],
            r23: m[(1, 2)],
            r31: m[(2, 0)],
            r32: m[(2, 1)],
            r33: m[(2, 2)],
            t1: m[(0, 3)],
            t2: m[(1, 3)],
            t3: m[(2, 3)],
        }
    }
}

// Naive kernel ################################################################

/// Reference implementation: one big loop over all pixels of frame 1,
/// parallelized over image rows. Rows are collected in order so the
/// residual layout is deterministic and identical to the vectorized path.
pub fn build_naive(obs: &Obs, motion: &Iso3) -> ResidualSystem {
    let warp = Warp::new(motion);
    let (height, width) = obs.intensity_1.shape();
    let rows: Vec<Vec<(Float, Vec6)>> = (0..height)
        .into_par_iter()
        .map(|i| {
            let mut row = Vec::new();
            for j in 0..width {
                if let Some(contribution) = pixel_contribution(obs, &warp, i, j) {
                    row.push(contribution);
                }
            }
            row
        })
        .collect();

    let count = rows.iter().map(Vec::len).sum();
    let mut residuals = Vec::with_capacity(count);
    let mut jacobians = Vec::with_capacity(count);
    for row in rows {
        for (r, jac) in row {
            residuals.push(r);
            jacobians.push(jac);
        }
    }
    ResidualSystem {
        residuals: DVec::from_vec(residuals),
        jacobians,
    }
}

/// Residual and Jacobian row of a single pixel, `None` if the pixel has no
/// valid depth or its reprojection falls outside frame 2.
#[inline]
fn pixel_contribution(obs: &Obs, warp: &Warp, i: usize, j: usize) -> Option<(Float, Vec6)> {
    let k = obs.intrinsics;
    let d = obs.depth_1[(i, j)];
    if d <= 0.0 {
        return None;
    }

    // Back-project pixel (x = j, y = i) with its depth.
    let p1 = k.back_project(Point2::new(j as Float, i as Float), d);

    // Move the point into frame 2's camera frame.
    let qx = warp.r11 * p1.x + warp.r12 * p1.y + warp.r13 * d + warp.t1;
    let qy = warp.r21 * p1.x + warp.r22 * p1.y + warp.r23 * d + warp.t2;
    let qz = warp.r31 * p1.x + warp.r32 * p1.y + warp.r33 * d + warp.t3;
    if qz <= MIN_DEPTH {
        return None;
    }

    // Project onto frame 2's image plane.
    let uvz = k.project(Point3::new(qx, qy, qz));
    let u = uvz.x / uvz.z;
    let v = uvz.y / uvz.z;
    let z_inv = 1.0 / qz;
    let (height_2, width_2) = obs.intensity_2.shape();
    if !in_bounds(u, v, width_2, height_2) {
        return None;
    }

    let im2 = interpolate(u, v, obs.intensity_2);
    let gx = interpolate(u, v, obs.gradient_x_2);
    let gy = interpolate(u, v, obs.gradient_y_2);
    let residual = im2 - obs.intensity_1[(i, j)];
    Some((residual, jacobian_row(gx, gy, qx, qy, qz, z_inv, k)))
}

/// Jacobian of the interpolated intensity with respect to the twist,
/// evaluated at the transformed point `q` (with `z_inv = 1 / q.z`).
///
/// Chains the image gradient `(gx, gy)`, the projection Jacobian, and the
/// rigid motion generators `[I | -q^]`, with the twist parameterized as
/// linear velocity first (same layout as `math::se3`).
#[inline]
fn jacobian_row(
    gx: Float,
    gy: Float,
    qx: Float,
    qy: Float,
    qz: Float,
    z_inv: Float,
    k: &Intrinsics,
) -> Vec6 {
    let z_inv_2 = z_inv * z_inv;
    let wx = gx * k.fx * z_inv;
    let wy = (gx * k.skew + gy * k.fy) * z_inv;
    let wz = -(gx * (k.fx * qx + k.skew * qy) + gy * k.fy * qy) * z_inv_2;
    Vec6::new(
        wx,
        wy,
        wz,
        qy * wz - qz * wy,
        qz * wx - qx * wz,
        qx * wy - qy * wx,
    )
}

/// A reprojected point is usable when its 4 bilinear neighbors exist:
/// `floor` coordinates inside `[0, size - 2]` in both dimensions.
/// The size arithmetic is done in floats so degenerate (0 or 1 pixel
/// wide) images reject every point instead of underflowing.
#[inline]
fn in_bounds(x: Float, y: Float, width: usize, height: usize) -> bool {
    x >= 0.0 && y >= 0.0 && x < width as Float - 1.0 && y < height as Float - 1.0
}

/// Bilinear interpolation. The caller must have checked `in_bounds`.
#[inline]
fn interpolate(x: Float, y: Float, mat: &DMat) -> Float {
    let u = x.floor();
    let v = y.floor();
    let u_0 = u as usize;
    let v_0 = v as usize;
    let a = x - u;
    let b = y - v;
    let vu_00 = mat[(v_0, u_0)];
    let vu_10 = mat[(v_0 + 1, u_0)];
    let vu_01 = mat[(v_0, u_0 + 1)];
    let vu_11 = mat[(v_0 + 1, u_0 + 1)];
    (1.0 - b) * (1.0 - a) * vu_00
        + b * (1.0 - a) * vu_10
        + (1.0 - b) * a * vu_01
        + b * a * vu_11
}

// Vectorized kernel ###########################################################

/// Vectorized implementation: the warp, residual and Jacobian arithmetic
/// runs on 4-pixel column blocks; bilinear gathers and the validity tests
/// stay per-lane since they are address computations anyway. Row tails
/// shorter than a block go through the scalar per-pixel routine.
pub fn build_vectorized(obs: &Obs, motion: &Iso3) -> ResidualSystem {
    let warp = Warp::new(motion);
    let k = obs.intrinsics;
    let (height, width) = obs.intensity_1.shape();
    let (height_2, width_2) = obs.intensity_2.shape();

    let fx = f32x4::splat(k.fx);
    let fy = f32x4::splat(k.fy);
    let skew = f32x4::splat(k.skew);
    let cx = f32x4::splat(k.cx);
    let cy = f32x4::splat(k.cy);
    let r11 = f32x4::splat(warp.r11);
    let r12 = f32x4::splat(warp.r12);
    let r13 = f32x4::splat(warp.r13);
    let r21 = f32x4::splat(warp.r21);
    let r22 = f32x4::splat(warp.r22);
    let r23 = f32x4::splat(warp.r23);
    let r31 = f32x4::splat(warp.r31);
    let r32 = f32x4::splat(warp.r32);
    let r33 = f32x4::splat(warp.r33);
    let t1 = f32x4::splat(warp.t1);
    let t2 = f32x4::splat(warp.t2);
    let t3 = f32x4::splat(warp.t3);

    let mut residuals = Vec::new();
    let mut jacobians = Vec::new();

    for i in 0..height {
        let y = f32x4::splat(i as Float);
        let mut j = 0;
        while j + LANES <= width {
            let d_arr = [
                obs.depth_1[(i, j)],
                obs.depth_1[(i, j + 1)],
                obs.depth_1[(i, j + 2)],
                obs.depth_1[(i, j + 3)],
            ];
            let d = f32x4::from(d_arr);
            let x = f32x4::from([
                j as Float,
                (j + 1) as Float,
                (j + 2) as Float,
                (j + 3) as Float,
            ]);

            // Back-project, transform, project: the same arithmetic as
            // `Intrinsics::back_project` / `Intrinsics::project`, lane-wise.
            let py = (y - cy) * d / fy;
            let px = ((x - cx) * d - skew * py) / fx;
            let qx = r11 * px + r12 * py + r13 * d + t1;
            let qy = r21 * px + r22 * py + r23 * d + t2;
            let qz = r31 * px + r32 * py + r33 * d + t3;
            let u = (fx * qx + skew * qy + cx * qz) / qz;
            let v = (fy * qy + cy * qz) / qz;
            let z_inv = f32x4::splat(1.0) / qz;

            // Per-lane validity and bilinear gathers.
            let u_arr = u.to_array();
            let v_arr = v.to_array();
            let qz_arr = qz.to_array();
            let mut valid = [false; LANES];
            let mut any_valid = false;
            let mut im2_arr = [0.0; LANES];
            let mut gx_arr = [0.0; LANES];
            let mut gy_arr = [0.0; LANES];
            for l in 0..LANES {
                if d_arr[l] > 0.0
                    && qz_arr[l] > MIN_DEPTH
                    && in_bounds(u_arr[l], v_arr[l], width_2, height_2)
                {
                    valid[l] = true;
                    any_valid = true;
                    im2_arr[l] = interpolate(u_arr[l], v_arr[l], obs.intensity_2);
                    gx_arr[l] = interpolate(u_arr[l], v_arr[l], obs.gradient_x_2);
                    gy_arr[l] = interpolate(u_arr[l], v_arr[l], obs.gradient_y_2);
                }
            }

            if any_valid {
                let im1 = f32x4::from([
                    obs.intensity_1[(i, j)],
                    obs.intensity_1[(i, j + 1)],
                    obs.intensity_1[(i, j + 2)],
                    obs.intensity_1[(i, j + 3)],
                ]);
                let r = f32x4::from(im2_arr) - im1;
                let gx = f32x4::from(gx_arr);
                let gy = f32x4::from(gy_arr);

                // Same chain rule as `jacobian_row`, lane-wise.
                let z_inv_2 = z_inv * z_inv;
                let wx = gx * fx * z_inv;
                let wy = (gx * skew + gy * fy) * z_inv;
                let wz = -(gx * (fx * qx + skew * qy) + gy * fy * qy) * z_inv_2;
                let jw1 = qy * wz - qz * wy;
                let jw2 = qz * wx - qx * wz;
                let jw3 = qx * wy - qy * wx;

                let r_arr = r.to_array();
                let wx_arr = wx.to_array();
                let wy_arr = wy.to_array();
                let wz_arr = wz.to_array();
                let jw1_arr = jw1.to_array();
                let jw2_arr = jw2.to_array();
                let jw3_arr = jw3.to_array();
                for l in 0..LANES {
                    if valid[l] {
                        residuals.push(r_arr[l]);
                        jacobians.push(Vec6::new(
                            wx_arr[l], wy_arr[l], wz_arr[l], jw1_arr[l], jw2_arr[l], jw3_arr[l],
                        ));
                    }
                }
            }
            j += LANES;
        }

        // Scalar remainder of the row.
        while j < width {
            if let Some((r, jac)) = pixel_contribution(obs, &warp, i, j) {
                residuals.push(r);
                jacobians.push(jac);
            }
            j += 1;
        }
    }

    ResidualSystem {
        residuals: DVec::from_vec(residuals),
        jacobians,
    }
}

// TESTS #############################################################
