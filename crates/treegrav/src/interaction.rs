//! Per-particle accumulators driven by tree walks.
//!
//! An interaction owns the cursor over the particle container and a scratch
//! accumulator for the particle currently being walked. The walker stays a
//! single function; swapping the interaction swaps the physics.

use crate::particles::{ParticleSet, ParticleTag};
use crate::pool::Node;

// Tiny additive term to avoid division by zero in 1/sqrt(r2). Vanishes in
// the sum for any nonzero separation.
pub(crate) const R2_TINY: f64 = f64::MIN_POSITIVE;

/// Monopole Newtonian kernel: accumulate `m * dr / r^3` of `node` onto
/// `out`, skipping the target's own cell (a leaf geometrically containing
/// the target).
#[inline]
pub(crate) fn monopole_accel(dim: usize, node: &Node, target: &[f64; 3], out: &mut [f64; 3]) {
    if node.flags.is_leaf() && node.contains(target, dim) {
        return;
    }
    let m = node.moments();
    let mut dr = [0.0; 3];
    let mut r2 = 0.0;
    for k in 0..dim {
        dr[k] = m.com[k] - target[k];
        r2 += dr[k] * dr[k];
    }
    let inv_r = 1.0 / (r2 + R2_TINY).sqrt();
    let inv_r3 = inv_r * inv_r * inv_r;
    for k in 0..dim {
        out[k] += m.mass * dr[k] * inv_r3;
    }
}

pub trait Interaction {
    /// Move the cursor to the next Real particle, clearing the scratch
    /// accumulator. Returns false when the container is exhausted.
    fn advance(&mut self, pc: &ParticleSet) -> bool;

    /// Row of the focused particle.
    fn current(&self) -> usize;

    /// Position of the focused particle.
    fn target(&self) -> [f64; 3];

    /// Accumulate the node's contribution for the focused particle.
    fn interact(&mut self, node: &Node);

    /// Fold the scratch accumulator into the output column and mark the
    /// focused particle complete.
    fn commit(&mut self, accel: &mut [[f64; 3]]);

    /// True when no particle walk is pending.
    fn done(&self) -> bool;
}

/// Monopole gravitational acceleration.
#[derive(Clone, Copy, Debug)]
pub struct Acceleration {
    dim: usize,
    cursor: usize,
    pid: usize,
    target: [f64; 3],
    acc: [f64; 3],
    pending: bool,
}

impl Acceleration {
    pub fn new(dim: usize) -> Self {
        Acceleration {
            dim,
            cursor: 0,
            pid: 0,
            target: [0.0; 3],
            acc: [0.0; 3],
            pending: false,
        }
    }
}

impl Interaction for Acceleration {
    fn advance(&mut self, pc: &ParticleSet) -> bool {
        while self.cursor < pc.len() {
            let row = self.cursor;
            self.cursor += 1;
            if pc.tag[row] == ParticleTag::Real {
                self.pid = row;
                self.target = pc.position[row];
                self.acc = [0.0; 3];
                self.pending = true;
                return true;
            }
        }
        self.pending = false;
        false
    }

    #[inline]
    fn current(&self) -> usize {
        self.pid
    }

    #[inline]
    fn target(&self) -> [f64; 3] {
        self.target
    }

    #[inline]
    fn interact(&mut self, node: &Node) {
        monopole_accel(self.dim, node, &self.target, &mut self.acc);
    }

    fn commit(&mut self, accel: &mut [[f64; 3]]) {
        for k in 0..self.dim {
            accel[self.pid][k] += self.acc[k];
        }
        self.acc = [0.0; 3];
        self.pending = false;
    }

    fn done(&self) -> bool {
        !self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Moments, NodeFlags, Payload};

    fn moment_leaf(center: [f64; 3], width: f64, mass: f64, com: [f64; 3]) -> Node {
        let mut node = Node::default();
        node.center = center;
        node.width = width;
        node.payload = Payload::Moments(Moments {
            mass,
            com,
            first_child: crate::pool::NONE,
            next_sibling: crate::pool::NONE,
        });
        node
    }

    #[test]
    fn kernel_skips_own_cell() {
        let node = moment_leaf([0.5, 0.5, 0.5], 1.0, 1.0, [0.5, 0.5, 0.5]);
        let mut out = [0.0; 3];
        monopole_accel(3, &node, &[0.25, 0.25, 0.25], &mut out);
        assert_eq!(out, [0.0; 3]);
    }

    #[test]
    fn kernel_pulls_toward_mass() {
        let node = moment_leaf([2.0, 0.0, 0.0], 0.5, 3.0, [2.0, 0.0, 0.0]);
        let mut out = [0.0; 3];
        monopole_accel(3, &node, &[0.0; 3], &mut out);
        assert!(out[0] > 0.0);
        assert_eq!(out[1], 0.0);
        assert_eq!(out[2], 0.0);
        // m / r^2 = 3 / 4
        assert!((out[0] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn advance_skips_ghosts() {
        let mut pc = ParticleSet::new();
        pc.push([0.1, 0.1, 0.1], 1.0, ParticleTag::Ghost);
        pc.push([0.2, 0.2, 0.2], 1.0, ParticleTag::Real);
        pc.push([0.3, 0.3, 0.3], 1.0, ParticleTag::Ghost);

        let mut inter = Acceleration::new(3);
        assert!(inter.advance(&pc));
        assert_eq!(inter.current(), 1);
        assert!(!inter.advance(&pc));
        assert!(inter.done());
    }

    #[test]
    fn half_open_cell_test_excludes_upper_face() {
        let node = moment_leaf([0.5, 0.5, 0.5], 1.0, 1.0, [0.5, 0.5, 0.5]);
        // on the upper face: outside the half-open cell, so it interacts
        let mut out = [0.0; 3];
        monopole_accel(3, &node, &[1.0, 0.5, 0.5], &mut out);
        assert!(out[0] < 0.0);
    }
}
