// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Coarse-to-fine Levenberg-Marquardt optimizer for direct RGB-D alignment.
//!
//! The optimizer owns its damping factor, motion estimate and statistics,
//! and holds a shared read-only handle to the camera pyramid. One instance
//! is constructed once and reused across frame pairs; call [`LMOptimizer::reset`]
//! between pairs to clear the per-pair state.

use std::sync::Arc;

use itertools::izip;
use nalgebra::UnitQuaternion;

use crate::core::camera::CameraPyramid;
use crate::core::pyramid::Pyramid;
use crate::core::track::residuals::{self, Kernel, Obs, ResidualSystem};
use crate::core::track::robust::RobustEstimator;
use crate::core::track::TrackError;
use crate::math::se3;
use crate::misc::type_aliases::{DMat, DVec, Float, Iso3, Mat6, Vec6};

/// Multiplicative damping adaptation: divide lambda on accepted steps,
/// multiply on rejected ones.
const LAMBDA_FACTOR: Float = 10.0;

/// Numerical convergence floor on the twist increment magnitude.
const STEP_EPSILON: Float = 1e-8;

/// Below this many valid residuals a level has no usable overlap.
const MIN_RESIDUALS: usize = 6;

/// Hyperparameters of the optimizer, fixed at construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial damping factor, must be > 0.
    pub lambda: Float,
    /// Relative cost improvement under which a level has converged.
    pub precision: Float,
    /// Iteration cap for each pyramid level (same length as the camera pyramid).
    pub max_iterations: Vec<usize>,
    /// Motion hypothesis used as the starting point of the coarsest level.
    pub initial_motion: Iso3,
    /// Robust residual weighting scheme.
    pub estimator: RobustEstimator,
    /// Residual/Jacobian kernel implementation.
    pub kernel: Kernel,
}

impl Config {
    /// Default configuration for a camera pyramid with `nb_levels` levels:
    /// lambda 0.001, precision 5e-7, 100 iterations per level, identity
    /// initial motion, t-distribution weighting, vectorized kernel.
    pub fn default_for(nb_levels: usize) -> Self {
        Config {
            lambda: 0.001,
            precision: 5e-7,
            max_iterations: vec![100; nb_levels],
            initial_motion: Iso3::identity(),
            estimator: RobustEstimator::t_dist(),
            kernel: Kernel::Vectorized,
        }
    }
}

/// Per-level statistics of the last solve.
#[derive(Debug, Clone)]
pub struct LevelStats {
    /// Pyramid level (0 = finest).
    pub level: usize,
    /// Number of LM iterations performed at this level.
    pub iterations: usize,
    /// Weighted mean cost when entering the level.
    pub cost_before: Float,
    /// Weighted mean cost when leaving the level.
    pub cost_after: Float,
    /// Number of valid residuals at the accepted motion.
    pub residual_count: usize,
}

/// Statistics of the last solve, coarsest level first.
#[derive(Debug, Clone, Default)]
pub struct SolveReport {
    /// One entry per optimized pyramid level.
    pub levels: Vec<LevelStats>,
}

/// Data of a successfully evaluated motion hypothesis.
struct Eval {
    motion: Iso3,
    cost: Float,
    system: ResidualSystem,
    weights: DVec,
}

/// Levenberg-Marquardt optimizer for the photometric alignment of two
/// RGB-D frames.
///
/// [`LMOptimizer::solve`] returns the motion `T` such that `X_2 = T * X_1`
/// (points of frame 1 expressed in frame 2's camera frame). The instance is
/// not safe for concurrent solves; independent frame streams need
/// independent instances sharing the same `Arc<CameraPyramid>`.
pub struct LMOptimizer {
    config: Config,
    camera: Arc<CameraPyramid>,
    lambda: Float,
    motion: Iso3,
    report: SolveReport,
}

impl LMOptimizer {
    /// Build an optimizer, validating the configuration against the camera.
    pub fn new(config: Config, camera: Arc<CameraPyramid>) -> Result<Self, TrackError> {
        check_lambda(config.lambda)?;
        if !(config.precision.is_finite() && config.precision > 0.0) {
            return Err(TrackError::Config(format!(
                "precision must be a positive number, got {}",
                config.precision
            )));
        }
        if config.max_iterations.len() != camera.level_count() {
            return Err(TrackError::Config(format!(
                "one iteration cap per pyramid level expected: {} caps for {} levels",
                config.max_iterations.len(),
                camera.level_count()
            )));
        }
        check_motion(&config.initial_motion)?;
        match config.estimator {
            RobustEstimator::Huber { delta } if !(delta.is_finite() && delta > 0.0) => {
                return Err(TrackError::Config(format!(
                    "Huber threshold must be a positive number, got {}",
                    delta
                )));
            }
            RobustEstimator::TDist { dof } if !(dof.is_finite() && dof > 0.0) => {
                return Err(TrackError::Config(format!(
                    "t-distribution degrees of freedom must be a positive number, got {}",
                    dof
                )));
            }
            _ => {}
        }
        let lambda = config.lambda;
        let motion = config.initial_motion;
        Ok(LMOptimizer {
            config,
            camera,
            lambda,
            motion,
            report: SolveReport::default(),
        })
    }

    /// Clear the per-pair mutable state: motion estimate, damping factor
    /// and statistics. Must be called between frame pairs.
    pub fn reset(&mut self, initial_motion: Iso3, lambda: Float) -> Result<(), TrackError> {
        check_motion(&initial_motion)?;
        check_lambda(lambda)?;
        self.motion = initial_motion;
        self.lambda = lambda;
        self.report.levels.clear();
        Ok(())
    }

    /// Estimate the motion aligning the frame pair, coarsest level first.
    ///
    /// `intensity_1` and `depth_1` describe frame 1, `intensity_2` is the
    /// frame to align onto. All three pyramids must have the same number of
    /// levels as the camera pyramid. Returns the motion `T` with
    /// `X_2 = T * X_1`; structural failures (no overlap, singular normal
    /// equations) are reported as errors, never as a meaningless transform.
    pub fn solve(
        &mut self,
        intensity_1: &Pyramid,
        depth_1: &Pyramid,
        intensity_2: &Pyramid,
    ) -> Result<Iso3, TrackError> {
        self.check_pyramids(intensity_1, depth_1, intensity_2)?;
        self.report.levels.clear();
        for level in (0..self.camera.level_count()).rev() {
            self.optimize_level(
                level,
                intensity_1.at(level),
                depth_1.at(level),
                intensity_2.at(level),
            )?;
        }
        Ok(self.motion)
    }

    /// Statistics accumulated by the last solve.
    pub fn report(&self) -> &SolveReport {
        &self.report
    }

    /// Log the accumulated statistics, one line per pyramid level.
    pub fn show_report(&self) {
        for stats in &self.report.levels {
            log::info!(
                "level {}: {} iterations, cost {:.2e} -> {:.2e} ({} residuals)",
                stats.level,
                stats.iterations,
                stats.cost_before,
                stats.cost_after,
                stats.residual_count
            );
        }
    }

    // Private #################################################################

    fn optimize_level(
        &mut self,
        level: usize,
        img_1: &DMat,
        depth_1: &DMat,
        img_2: &DMat,
    ) -> Result<(), TrackError> {
        let (gradient_x_2, gradient_y_2) = residuals::gradients_centered(img_2);
        // Borrow the intrinsics through a local handle so the observation
        // data does not hold a borrow of `self` across the state updates.
        let camera = Arc::clone(&self.camera);
        let obs = Obs {
            intensity_1: img_1,
            depth_1,
            intensity_2: img_2,
            gradient_x_2: &gradient_x_2,
            gradient_y_2: &gradient_y_2,
            intrinsics: camera.at(level),
        };

        let mut eval = self.evaluate(level, &obs, self.motion)?;
        let cost_before = eval.cost;
        let mut iterations = 0;
        while iterations < self.config.max_iterations[level] {
            let (hessian, gradient) = normal_equations(&eval);
            let delta = solve_damped(hessian, gradient, self.lambda)
                .ok_or(TrackError::Numerical { level })?;
            let candidate = renormalize(se3::exp(delta) * eval.motion);
            let candidate_eval = self.evaluate(level, &obs, candidate)?;
            iterations += 1;

            if candidate_eval.cost <= eval.cost {
                let improvement = relative_improvement(eval.cost, candidate_eval.cost);
                log::debug!(
                    "level {} iter {}: cost {:.3e} -> {:.3e}, lambda {:.1e}",
                    level,
                    iterations,
                    eval.cost,
                    candidate_eval.cost,
                    self.lambda
                );
                eval = candidate_eval;
                self.accept_step();
                if improvement < self.config.precision || delta.norm() < STEP_EPSILON {
                    break;
                }
            } else {
                self.reject_step();
                if delta.norm() < STEP_EPSILON {
                    break;
                }
            }
        }

        self.motion = eval.motion;
        self.report.levels.push(LevelStats {
            level,
            iterations,
            cost_before,
            cost_after: eval.cost,
            residual_count: eval.system.len(),
        });
        Ok(())
    }

    /// Build the residual system at a motion hypothesis and weight it.
    fn evaluate(&self, level: usize, obs: &Obs, motion: Iso3) -> Result<Eval, TrackError> {
        let system = residuals::build(self.config.kernel, obs, &motion);
        let count = system.len();
        if count < MIN_RESIDUALS {
            return Err(TrackError::InsufficientData { level, count });
        }
        let vectorized = self.config.kernel == Kernel::Vectorized;
        let weights = self.config.estimator.weights(&system.residuals, vectorized);
        let cost = izip!(system.residuals.iter(), weights.iter())
            .map(|(r, w)| w * r * r)
            .sum::<Float>()
            / count as Float;
        Ok(Eval {
            motion,
            cost,
            system,
            weights,
        })
    }

    /// Accepted step: relax the damping towards Gauss-Newton.
    fn accept_step(&mut self) {
        self.lambda /= LAMBDA_FACTOR;
    }

    /// Rejected step: strengthen the damping towards gradient descent.
    fn reject_step(&mut self) {
        self.lambda *= LAMBDA_FACTOR;
    }

    fn check_pyramids(
        &self,
        intensity_1: &Pyramid,
        depth_1: &Pyramid,
        intensity_2: &Pyramid,
    ) -> Result<(), TrackError> {
        let levels = self.camera.level_count();
        for (name, count) in [
            ("intensity_1", intensity_1.level_count()),
            ("depth_1", depth_1.level_count()),
            ("intensity_2", intensity_2.level_count()),
        ] {
            if count != levels {
                return Err(TrackError::Config(format!(
                    "{} has {} levels, the camera pyramid has {}",
                    name, count, levels
                )));
            }
        }
        for level in 0..levels {
            let shape_1 = intensity_1.at(level).shape();
            if shape_1 != depth_1.at(level).shape() {
                return Err(TrackError::Config(format!(
                    "intensity and depth shapes differ at level {}: {:?} vs {:?}",
                    level,
                    shape_1,
                    depth_1.at(level).shape()
                )));
            }
            let shape_2 = intensity_2.at(level).shape();
            if shape_1.0 < 2 || shape_1.1 < 2 || shape_2.0 < 2 || shape_2.1 < 2 {
                return Err(TrackError::Config(format!(
                    "frames must be at least 2x2 at every level, level {} is degenerate",
                    level
                )));
            }
        }
        Ok(())
    }
}

// Helper ######################################################################

/// Accumulate the weighted normal equations `J^T W J` and `J^T W r`.
fn normal_equations(eval: &Eval) -> (Mat6, Vec6) {
    let mut hessian = Mat6::zeros();
    let mut gradient = Vec6::zeros();
    for (jac, w, r) in izip!(
        eval.system.jacobians.iter(),
        eval.weights.iter(),
        eval.system.residuals.iter()
    ) {
        hessian += *w * (jac * jac.transpose());
        gradient += (w * r) * *jac;
    }
    (hessian, gradient)
}

/// Solve `(H + lambda * diag(H)) delta = -g` by Cholesky decomposition.
/// Returns `None` when the damped Hessian is not positive definite.
fn solve_damped(hessian: Mat6, gradient: Vec6, lambda: Float) -> Option<Vec6> {
    let mut damped = hessian;
    for i in 0..6 {
        damped[(i, i)] *= 1.0 + lambda;
    }
    let cholesky = damped.cholesky()?;
    Some(cholesky.solve(&(-gradient)))
}

/// Relative cost improvement, 0 when the previous cost already vanished.
fn relative_improvement(old_cost: Float, new_cost: Float) -> Float {
    if old_cost > 0.0 {
        (old_cost - new_cost) / old_cost
    } else {
        0.0
    }
}

/// First order Taylor approximation for renormalization of rotation part of motion.
fn renormalize(motion: Iso3) -> Iso3 {
    let mut motion = motion;
    motion.rotation = renormalize_unit_quaternion(motion.rotation);
    motion
}

/// First order Taylor approximation for unit quaternion re-normalization.
fn renormalize_unit_quaternion(uq: UnitQuaternion<Float>) -> UnitQuaternion<Float> {
    let q = uq.into_inner();
    let sq_norm = q.norm_squared();
    UnitQuaternion::new_unchecked(0.5 * (3.0 - sq_norm) * q)
}

fn check_lambda(lambda: Float) -> Result<(), TrackError> {
    if lambda.is_finite() && lambda > 0.0 {
        Ok(())
    } else {
        Err(TrackError::Config(format!(
            "lambda must be a positive number, got {}",
            lambda
        )))
    }
}

fn check_motion(motion: &Iso3) -> Result<(), TrackError> {
    let translation_finite = motion.translation.vector.iter().all(|x| x.is_finite());
    let rotation_finite = motion.rotation.quaternion().coords.iter().all(|x| x.is_finite());
    if translation_finite && rotation_finite {
        Ok(())
    } else {
        Err(TrackError::Config(
            "initial transform has non-finite entries".to_string(),
        ))
    }
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use crate::core::camera::CameraPyramid;
    use crate::core::track::synthetic;
    use crate::misc::type_aliases::Vec3;
    use nalgebra::{Translation3, UnitQuaternion};

    const WIDTH: usize = 64;
    const HEIGHT: usize = 48;
    const NB_LEVELS: usize = 3;

    fn camera() -> Arc<CameraPyramid> {
        Arc::new(CameraPyramid::new(
            NB_LEVELS,
            synthetic::camera(WIDTH, HEIGHT),
        ))
    }

    fn frame_pair(motion: &Iso3) -> (Pyramid, Pyramid, Pyramid) {
        let scene = synthetic::PlaneScene::default();
        let intrinsics = synthetic::camera(WIDTH, HEIGHT);
        let (img_1, depth_1) = scene.render_reference(HEIGHT, WIDTH, &intrinsics);
        let img_2 = scene.render_transformed(HEIGHT, WIDTH, &intrinsics, motion);
        (
            Pyramid::intensity(NB_LEVELS, img_1),
            Pyramid::depth(NB_LEVELS, depth_1),
            Pyramid::intensity(NB_LEVELS, img_2),
        )
    }

    fn small_motion() -> Iso3 {
        let rotation = UnitQuaternion::from_scaled_axis(Vec3::new(0.004, -0.002, 0.006));
        Iso3::from_parts(Translation3::new(0.01, -0.006, 0.008), rotation)
    }

    fn motion_error(estimated: &Iso3, expected: &Iso3) -> Float {
        se3::log(estimated * expected.inverse()).norm()
    }

    #[test]
    fn identical_frames_align_to_identity() {
        let (img_1, depth_1, _) = frame_pair(&Iso3::identity());
        let mut optimizer =
            LMOptimizer::new(Config::default_for(NB_LEVELS), camera()).unwrap();
        let motion = optimizer.solve(&img_1, &depth_1, &img_1).unwrap();
        assert!(
            motion_error(&motion, &Iso3::identity()) < 1e-3,
            "motion: {}",
            motion
        );
    }

    #[test]
    fn recovers_known_motion_naive_kernel() {
        let truth = small_motion();
        let (img_1, depth_1, img_2) = frame_pair(&truth);
        let config = Config {
            estimator: RobustEstimator::None,
            kernel: Kernel::Naive,
            ..Config::default_for(NB_LEVELS)
        };
        let mut optimizer = LMOptimizer::new(config, camera()).unwrap();
        let motion = optimizer.solve(&img_1, &depth_1, &img_2).unwrap();
        assert!(
            motion_error(&motion, &truth) < 2e-3,
            "estimated {} expected {}",
            motion,
            truth
        );
    }

    #[test]
    fn recovers_known_motion_vectorized_tdist() {
        let truth = small_motion();
        let (img_1, depth_1, img_2) = frame_pair(&truth);
        let mut optimizer =
            LMOptimizer::new(Config::default_for(NB_LEVELS), camera()).unwrap();
        let motion = optimizer.solve(&img_1, &depth_1, &img_2).unwrap();
        assert!(
            motion_error(&motion, &truth) < 2e-3,
            "estimated {} expected {}",
            motion,
            truth
        );
    }

    #[test]
    fn reset_makes_consecutive_solves_identical() {
        let truth = small_motion();
        let (img_1, depth_1, img_2) = frame_pair(&truth);
        let config = Config {
            kernel: Kernel::Naive,
            ..Config::default_for(NB_LEVELS)
        };
        let mut optimizer = LMOptimizer::new(config.clone(), camera()).unwrap();
        let first = optimizer.solve(&img_1, &depth_1, &img_2).unwrap();
        optimizer
            .reset(config.initial_motion, config.lambda)
            .unwrap();
        let second = optimizer.solve(&img_1, &depth_1, &img_2).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn iteration_caps_are_respected() {
        let truth = small_motion();
        let (img_1, depth_1, img_2) = frame_pair(&truth);
        let config = Config {
            max_iterations: vec![4, 3, 2],
            ..Config::default_for(NB_LEVELS)
        };
        let mut optimizer = LMOptimizer::new(config, camera()).unwrap();
        optimizer.solve(&img_1, &depth_1, &img_2).unwrap();
        let report = optimizer.report();
        assert_eq!(report.levels.len(), NB_LEVELS);
        for stats in &report.levels {
            let cap = [4, 3, 2][stats.level];
            assert!(stats.iterations <= cap, "level {}", stats.level);
        }
    }

    #[test]
    fn damping_adaptation_is_strictly_monotonic() {
        let mut optimizer =
            LMOptimizer::new(Config::default_for(NB_LEVELS), camera()).unwrap();
        let before = optimizer.lambda;
        optimizer.reject_step();
        assert!(optimizer.lambda > before);
        assert!(optimizer.lambda > 0.0);
        let before = optimizer.lambda;
        optimizer.accept_step();
        assert!(optimizer.lambda < before);
        assert!(optimizer.lambda > 0.0);
    }

    #[test]
    fn rejects_invalid_configurations() {
        let config = Config {
            lambda: 0.0,
            ..Config::default_for(NB_LEVELS)
        };
        assert!(matches!(
            LMOptimizer::new(config, camera()),
            Err(TrackError::Config(_))
        ));

        let config = Config {
            max_iterations: vec![100; NB_LEVELS + 1],
            ..Config::default_for(NB_LEVELS)
        };
        assert!(matches!(
            LMOptimizer::new(config, camera()),
            Err(TrackError::Config(_))
        ));
    }

    #[test]
    fn reset_rejects_inconsistent_state() {
        let mut optimizer =
            LMOptimizer::new(Config::default_for(NB_LEVELS), camera()).unwrap();
        assert!(matches!(
            optimizer.reset(Iso3::identity(), -1.0),
            Err(TrackError::Config(_))
        ));
        let broken = Iso3::from_parts(
            Translation3::new(Float::NAN, 0.0, 0.0),
            UnitQuaternion::identity(),
        );
        assert!(matches!(
            optimizer.reset(broken, 0.001),
            Err(TrackError::Config(_))
        ));
    }

    #[test]
    fn all_invalid_depth_is_insufficient_data() {
        let (img_1, depth_1, img_2) = frame_pair(&small_motion());
        let no_depth = Pyramid::from_levels(
            (0..NB_LEVELS)
                .map(|level| DMat::zeros(depth_1.at(level).nrows(), depth_1.at(level).ncols()))
                .collect(),
        );
        let mut optimizer =
            LMOptimizer::new(Config::default_for(NB_LEVELS), camera()).unwrap();
        assert!(matches!(
            optimizer.solve(&img_1, &no_depth, &img_2),
            Err(TrackError::InsufficientData { .. })
        ));
    }

    #[test]
    fn textureless_frames_are_a_numerical_error() {
        // Constant intensity zeroes every image gradient, so all Jacobian
        // rows vanish and the damped normal equations are singular.
        let nb_levels = 2;
        let flat = DMat::from_element(HEIGHT, WIDTH, 0.5);
        let depth = DMat::from_element(HEIGHT, WIDTH, 1.0);
        let intensity_1 = Pyramid::intensity(nb_levels, flat.clone());
        let depth_1 = Pyramid::depth(nb_levels, depth);
        let intensity_2 = Pyramid::intensity(nb_levels, flat);
        let camera = Arc::new(CameraPyramid::new(
            nb_levels,
            synthetic::camera(WIDTH, HEIGHT),
        ));
        let mut optimizer =
            LMOptimizer::new(Config::default_for(nb_levels), camera).unwrap();
        assert!(matches!(
            optimizer.solve(&intensity_1, &depth_1, &intensity_2),
            Err(TrackError::Numerical { .. })
        ));
    }

    #[test]
    fn thin_target_frame_is_a_configuration_error() {
        let (img_1, depth_1, _) = frame_pair(&small_motion());
        // One pixel wide at every level: too small to interpolate into.
        let thin = Pyramid::from_levels(
            (0..NB_LEVELS)
                .map(|level| DMat::zeros(img_1.at(level).nrows(), 1))
                .collect(),
        );
        let mut optimizer =
            LMOptimizer::new(Config::default_for(NB_LEVELS), camera()).unwrap();
        assert!(matches!(
            optimizer.solve(&img_1, &depth_1, &thin),
            Err(TrackError::Config(_))
        ));
    }

    #[test]
    fn mismatched_level_counts_are_a_configuration_error() {
        let (img_1, depth_1, img_2) = frame_pair(&small_motion());
        let camera_more_levels = Arc::new(CameraPyramid::new(
            NB_LEVELS + 1,
            synthetic::camera(WIDTH, HEIGHT),
        ));
        let mut optimizer = LMOptimizer::new(
            Config::default_for(NB_LEVELS + 1),
            camera_more_levels,
        )
        .unwrap();
        assert!(matches!(
            optimizer.solve(&img_1, &depth_1, &img_2),
            Err(TrackError::Config(_))
        ));
    }
}
