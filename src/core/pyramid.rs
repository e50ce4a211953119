// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Multi-resolution pyramids of intensity and depth images.
//!
//! Images are dense matrices of `Float` values: intensity in an arbitrary
//! consistent unit, depth in meters with 0 meaning "invalid / no data".
//! Level 0 is the full resolution image, each subsequent level halves the
//! previous one with a 2x2 block reduction.

use crate::misc::type_aliases::{DMat, Float};

/// Ordered sequence of images, full resolution first.
#[derive(Debug, Clone)]
pub struct Pyramid {
    levels: Vec<DMat>,
}

impl Pyramid {
    /// Build an intensity pyramid by 2x2 mean downsampling.
    pub fn intensity(nb_levels: usize, img: DMat) -> Self {
        Self::build(nb_levels, img, mean_bloc)
    }

    /// Build a depth pyramid by 2x2 mean downsampling over valid samples.
    ///
    /// Invalid depths (0) do not contribute to the mean, and a block with
    /// no valid sample stays invalid. This avoids bleeding the "no data"
    /// marker into valid regions when going down the pyramid.
    pub fn depth(nb_levels: usize, map: DMat) -> Self {
        Self::build(nb_levels, map, valid_mean_bloc)
    }

    /// Wrap pre-computed levels into a pyramid, without downsampling.
    pub fn from_levels(levels: Vec<DMat>) -> Self {
        assert!(!levels.is_empty(), "a pyramid needs at least one level");
        Pyramid { levels }
    }

    /// Number of resolution levels.
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Image at the given level (0 = full resolution).
    pub fn at(&self, level: usize) -> &DMat {
        &self.levels[level]
    }

    fn build<F: Fn(Float, Float, Float, Float) -> Float>(
        nb_levels: usize,
        mat: DMat,
        f: F,
    ) -> Self {
        assert!(nb_levels > 0, "a pyramid needs at least one level");
        let mut levels = Vec::with_capacity(nb_levels);
        levels.push(mat);
        for _ in 1..nb_levels {
            match halve(levels.last().unwrap(), &f) {
                Some(half) => levels.push(half),
                None => break,
            }
        }
        Pyramid { levels }
    }
}

/// Halve the resolution of a matrix by applying a function to each 2x2 block.
/// If one size of the matrix is < 2 then this function returns None.
/// If one size is odd, its last line/column is dropped.
fn halve<F: Fn(Float, Float, Float, Float) -> Float>(mat: &DMat, f: F) -> Option<DMat> {
    let (r, c) = mat.shape();
    let half_r = r / 2;
    let half_c = c / 2;
    if half_r == 0 || half_c == 0 {
        None
    } else {
        let half_mat = DMat::from_fn(half_r, half_c, |i, j| {
            let a = mat[(2 * i, 2 * j)];
            let b = mat[(2 * i + 1, 2 * j)];
            let c = mat[(2 * i, 2 * j + 1)];
            let d = mat[(2 * i + 1, 2 * j + 1)];
            f(a, b, c, d)
        });
        Some(half_mat)
    }
}

/// Mean of a 2x2 block.
fn mean_bloc(a: Float, b: Float, c: Float, d: Float) -> Float {
    0.25 * (a + b + c + d)
}

/// Mean of the valid (non zero) samples of a 2x2 block, 0 if none is valid.
fn valid_mean_bloc(a: Float, b: Float, c: Float, d: Float) -> Float {
    let mut sum = 0.0;
    let mut count = 0;
    for v in [a, b, c, d] {
        if v > 0.0 {
            sum += v;
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as Float
    }
}

// TESTS #############################################################
