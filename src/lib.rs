// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Direct RGB-D visual odometry.
//!
//! Estimates the rigid body motion between two consecutive RGB-D frames
//! by minimizing a photometric error over pixel intensities and depth,
//! with a Levenberg-Marquardt solver applied coarse-to-fine over image
//! pyramids and robust (Huber / t-distribution) residual weighting.
//!
//! The entry point is [`core::track::lm::LMOptimizer`].

pub mod core;
pub mod math;
pub mod misc;
