// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Robust residual weighting for the photometric error.
//!
//! M-estimator weights down-weight large residuals presumed to be outliers
//! (occlusions, moving objects, sensor noise). Two weighting schemes are
//! supported besides plain least squares: Huber with a fixed threshold, and
//! a t-distribution whose scale is estimated from the residual population.

use wide::f32x4;

use crate::misc::type_aliases::{DVec, Float};

/// Default Huber threshold, about 4 gray levels on a [0, 1] intensity scale.
pub const DEFAULT_HUBER_DELTA: Float = 4.0 / 255.0;

/// Default degrees of freedom of the t-distribution.
/// 5 is the usual choice for photometric residuals.
pub const DEFAULT_TDIST_DOF: Float = 5.0;

/// Number of fixed-point refinements of the t-distribution scale.
const TDIST_SCALE_ITERATIONS: usize = 5;

/// Floor for the estimated variance, so weights stay finite on
/// residual vectors that are (numerically) all zero.
const MIN_SIGMA_2: Float = 1e-12;

const LANES: usize = 4;

/// Residual weighting scheme, chosen at optimizer construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RobustEstimator {
    /// Plain least squares, all weights are 1.
    None,
    /// Huber weighting with a fixed threshold.
    Huber {
        /// Threshold below which residuals keep full weight.
        delta: Float,
    },
    /// Student t-distribution weighting with estimated scale.
    TDist {
        /// Degrees of freedom of the distribution.
        dof: Float,
    },
}

impl RobustEstimator {
    /// Huber estimator with the default threshold.
    pub fn huber() -> Self {
        RobustEstimator::Huber {
            delta: DEFAULT_HUBER_DELTA,
        }
    }

    /// t-distribution estimator with the default degrees of freedom.
    pub fn t_dist() -> Self {
        RobustEstimator::TDist {
            dof: DEFAULT_TDIST_DOF,
        }
    }

    /// Compute one strictly positive, finite weight per residual.
    ///
    /// `vectorized` selects the block-accumulated scale estimation path;
    /// both paths agree within floating point tolerance.
    pub fn weights(&self, residuals: &DVec, vectorized: bool) -> DVec {
        match *self {
            RobustEstimator::None => DVec::from_element(residuals.len(), 1.0),
            RobustEstimator::Huber { delta } => residuals.map(|r| huber_weight(r, delta)),
            RobustEstimator::TDist { dof } => {
                let sigma_2 = if vectorized {
                    tdist_scale_vectorized(residuals, dof)
                } else {
                    tdist_scale_naive(residuals, dof)
                };
                residuals.map(|r| tdist_weight(r, dof, sigma_2))
            }
        }
    }
}

/// Huber weight: 1 inside the threshold, `delta / |r|` outside.
#[inline]
pub fn huber_weight(r: Float, delta: Float) -> Float {
    let abs_r = r.abs();
    if abs_r <= delta {
        1.0
    } else {
        delta / abs_r
    }
}

/// t-distribution weight `(dof + 1) / (dof + (r / sigma)^2)`.
#[inline]
pub fn tdist_weight(r: Float, dof: Float, sigma_2: Float) -> Float {
    (dof + 1.0) / (dof + r * r / sigma_2)
}

/// Estimate the squared t-distribution scale with a fixed number of
/// fixed-point iterations: `sigma^2 <- mean(r^2 * (dof+1) / (dof + r^2/sigma^2))`.
///
/// Seeded with the residual variance. Single pass over all residuals
/// per iteration.
pub fn tdist_scale_naive(residuals: &DVec, dof: Float) -> Float {
    let n = residuals.len();
    if n == 0 {
        return MIN_SIGMA_2;
    }
    let inv_n = 1.0 / n as Float;
    let mut sigma_2 = (residuals.iter().map(|r| r * r).sum::<Float>() * inv_n).max(MIN_SIGMA_2);
    for _ in 0..TDIST_SCALE_ITERATIONS {
        let mut acc = 0.0;
        for &r in residuals.iter() {
            let r_2 = r * r;
            acc += r_2 * (dof + 1.0) / (dof + r_2 / sigma_2);
        }
        sigma_2 = (acc * inv_n).max(MIN_SIGMA_2);
    }
    sigma_2
}

/// Same fixed-point scale estimation as [`tdist_scale_naive`], accumulating
/// the sufficient statistics over 4-wide blocks with a scalar remainder.
pub fn tdist_scale_vectorized(residuals: &DVec, dof: Float) -> Float {
    let n = residuals.len();
    if n == 0 {
        return MIN_SIGMA_2;
    }
    let slice = residuals.as_slice();
    let inv_n = 1.0 / n as Float;
    let blocks = n / LANES;

    // Variance seed, block accumulated.
    let mut sum_v = f32x4::ZERO;
    for b in 0..blocks {
        let r = f32x4::from([
            slice[LANES * b],
            slice[LANES * b + 1],
            slice[LANES * b + 2],
            slice[LANES * b + 3],
        ]);
        sum_v += r * r;
    }
    let mut sum = sum_v.to_array().iter().sum::<Float>();
    for &r in &slice[LANES * blocks..] {
        sum += r * r;
    }
    let mut sigma_2 = (sum * inv_n).max(MIN_SIGMA_2);

    for _ in 0..TDIST_SCALE_ITERATIONS {
        let dof_v = f32x4::splat(dof);
        let dof_1_v = f32x4::splat(dof + 1.0);
        let inv_sigma_2_v = f32x4::splat(1.0 / sigma_2);
        let mut acc_v = f32x4::ZERO;
        for b in 0..blocks {
            let r = f32x4::from([
                slice[LANES * b],
                slice[LANES * b + 1],
                slice[LANES * b + 2],
                slice[LANES * b + 3],
            ]);
            let r_2 = r * r;
            acc_v += r_2 * dof_1_v / (dof_v + r_2 * inv_sigma_2_v);
        }
        let mut acc = acc_v.to_array().iter().sum::<Float>();
        for &r in &slice[LANES * blocks..] {
            let r_2 = r * r;
            acc += r_2 * (dof + 1.0) / (dof + r_2 / sigma_2);
        }
        sigma_2 = (acc * inv_n).max(MIN_SIGMA_2);
    }
    sigma_2
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn huber_weight_is_one_inside_threshold() {
        let delta = DEFAULT_HUBER_DELTA;
        assert_eq!(huber_weight(0.0, delta), 1.0);
        assert_eq!(huber_weight(delta, delta), 1.0);
        assert_eq!(huber_weight(-delta, delta), 1.0);
        assert_eq!(huber_weight(0.5 * delta, delta), 1.0);
    }

    #[test]
    fn huber_weight_is_delta_over_abs_outside_threshold() {
        let delta = DEFAULT_HUBER_DELTA;
        let r = 3.0 * delta;
        assert_eq!(huber_weight(r, delta), delta / r);
        assert_eq!(huber_weight(-r, delta), delta / r);
    }

    #[test]
    fn tdist_scale_paths_agree() {
        let residuals = DVec::from_fn(503, |i, _| {
            let x = i as Float;
            0.02 * (0.13 * x).sin() + if i % 37 == 0 { 0.4 } else { 0.0 }
        });
        let naive = tdist_scale_naive(&residuals, DEFAULT_TDIST_DOF);
        let vectorized = tdist_scale_vectorized(&residuals, DEFAULT_TDIST_DOF);
        assert_relative_eq!(naive, vectorized, max_relative = 1e-4);
    }

    #[test]
    fn tdist_down_weights_outliers() {
        let mut values = vec![0.01; 200];
        values[0] = 1.0;
        let residuals = DVec::from_vec(values);
        let weights = RobustEstimator::t_dist().weights(&residuals, false);
        assert!(weights[0] < weights[1]);
    }

    #[test]
    fn weights_match_residual_count() {
        let residuals = DVec::from_fn(17, |i, _| i as Float * 0.01 - 0.05);
        for estimator in [
            RobustEstimator::None,
            RobustEstimator::huber(),
            RobustEstimator::t_dist(),
        ] {
            assert_eq!(estimator.weights(&residuals, false).len(), 17);
        }
    }

    #[test]
    fn zero_residuals_yield_finite_weights() {
        let residuals = DVec::zeros(42);
        let weights = RobustEstimator::t_dist().weights(&residuals, true);
        assert!(weights.iter().all(|w| w.is_finite() && *w > 0.0));
    }

    // PROPERTY TESTS ################################################

    #[quickcheck_macros::quickcheck]
    fn weights_strictly_positive_and_finite(values: Vec<Float>) -> bool {
        let values: Vec<Float> = values
            .into_iter()
            .filter(|v| v.is_finite() && v.abs() < 1e3)
            .collect();
        let residuals = DVec::from_vec(values);
        [
            RobustEstimator::None,
            RobustEstimator::huber(),
            RobustEstimator::t_dist(),
        ]
        .iter()
        .all(|estimator| {
            estimator
                .weights(&residuals, false)
                .iter()
                .all(|w| w.is_finite() && *w > 0.0)
        })
    }
}
