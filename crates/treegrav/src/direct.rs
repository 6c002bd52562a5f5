//! O(N^2) direct-sum gravity, the reference the tree is tested against and
//! a sane fallback for very small N.

use crate::interaction::R2_TINY;

/// Pairwise Newtonian accelerations, no softening, self-pairs skipped.
pub fn direct_accelerations(
    dim: usize,
    positions: &[[f64; 3]],
    masses: &[f64],
) -> Vec<[f64; 3]> {
    let n = positions.len();
    assert_eq!(n, masses.len());
    let mut acc = vec![[0.0f64; 3]; n];
    for i in 0..n {
        let xi = positions[i];
        for j in 0..n {
            if j == i {
                continue;
            }
            let mut dr = [0.0; 3];
            let mut r2 = 0.0;
            for k in 0..dim {
                dr[k] = positions[j][k] - xi[k];
                r2 += dr[k] * dr[k];
            }
            let inv_r = 1.0 / (r2 + R2_TINY).sqrt();
            let inv_r3 = inv_r * inv_r * inv_r;
            for k in 0..dim {
                acc[i][k] += masses[j] * dr[k] * inv_r3;
            }
        }
    }
    acc
}

/// Accelerations at arbitrary query points; all particles are sources.
pub fn direct_accelerations_at_points(
    dim: usize,
    positions: &[[f64; 3]],
    masses: &[f64],
    points: &[[f64; 3]],
) -> Vec<[f64; 3]> {
    let mut acc = vec![[0.0f64; 3]; points.len()];
    for (p, out) in points.iter().zip(acc.iter_mut()) {
        for (x, &m) in positions.iter().zip(masses.iter()) {
            let mut dr = [0.0; 3];
            let mut r2 = 0.0;
            for k in 0..dim {
                dr[k] = x[k] - p[k];
                r2 += dr[k] * dr[k];
            }
            let inv_r = 1.0 / (r2 + R2_TINY).sqrt();
            let inv_r3 = inv_r * inv_r * inv_r;
            for k in 0..dim {
                out[k] += m * dr[k] * inv_r3;
            }
        }
    }
    acc
}
