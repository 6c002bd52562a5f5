//! Opening criteria.
//!
//! A splitter decides, for the focused target particle, whether a node must
//! be opened (walk its children) or may be accepted as a monopole. Both
//! criteria below work on squared distances so the hot path never takes a
//! square root.

use crate::pool::Node;

pub trait Splitter {
    /// Remember the particle position the next `split` calls refer to.
    fn focus(&mut self, target: [f64; 3]);

    /// True iff `node` must be opened for the focused target.
    fn split(&self, node: &Node) -> bool;
}

#[inline]
fn dist2(a: &[f64; 3], b: &[f64; 3], dim: usize) -> f64 {
    let mut d2 = 0.0;
    for k in 0..dim {
        let d = a[k] - b[k];
        d2 += d * d;
    }
    d2
}

/// Geometric Barnes-Hut criterion: open iff `s^2 >= d^2 * theta^2`.
#[derive(Clone, Copy, Debug)]
pub struct BarnesHutOpening {
    dim: usize,
    theta2: f64,
    target: [f64; 3],
}

impl BarnesHutOpening {
    pub fn new(dim: usize, opening_angle: f64) -> Self {
        BarnesHutOpening {
            dim,
            theta2: opening_angle * opening_angle,
            target: [0.0; 3],
        }
    }
}

impl Splitter for BarnesHutOpening {
    #[inline]
    fn focus(&mut self, target: [f64; 3]) {
        self.target = target;
    }

    #[inline]
    fn split(&self, node: &Node) -> bool {
        let m = node.moments();
        let d2 = dist2(&self.target, &m.com, self.dim);
        node.width * node.width >= d2 * self.theta2
    }
}

/// Acceleration-error criterion: open iff `m * s^2 > tol * d^4`, so every
/// accepted monopole keeps its truncation-error estimate `m s^2 / d^4`
/// below `tol`.
#[derive(Clone, Copy, Debug)]
pub struct AccelOpening {
    dim: usize,
    tol: f64,
    target: [f64; 3],
}

impl AccelOpening {
    pub fn new(dim: usize, tol: f64) -> Self {
        AccelOpening {
            dim,
            tol,
            target: [0.0; 3],
        }
    }
}

impl Splitter for AccelOpening {
    #[inline]
    fn focus(&mut self, target: [f64; 3]) {
        self.target = target;
    }

    #[inline]
    fn split(&self, node: &Node) -> bool {
        let m = node.moments();
        let d2 = dist2(&self.target, &m.com, self.dim);
        m.mass * node.width * node.width > self.tol * d2 * d2
    }
}
