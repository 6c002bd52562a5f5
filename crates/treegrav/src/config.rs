//! Solver configuration.
//!
//! A [`TreeConfig`] is plain data: it can be deserialized from a scenario
//! file or built in code, and is checked once by [`TreeConfig::validate`]
//! before a tree accepts it.

use serde::{Deserialize, Serialize};

use crate::error::{GravityError, Result};

/// Which opening criterion the walk uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitKind {
    /// Geometric Barnes-Hut test: open a node iff `s^2 >= d^2 * theta^2`.
    #[default]
    #[serde(rename = "barnes-hut")]
    BarnesHut,
    /// Acceleration-error test: open a node iff `m * s^2 > tol * d^4`,
    /// bounding the monopole truncation error `m s^2 / d^4` per interaction.
    #[serde(rename = "acceleration")]
    Acceleration,
}

/// Axis-aligned simulation domain. Cells are half-open, so a particle on the
/// upper boundary of an axis is outside the domain.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainLimits {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl DomainLimits {
    /// Unit cube, the conventional test domain.
    pub fn unit() -> Self {
        DomainLimits {
            min: [0.0; 3],
            max: [1.0; 3],
        }
    }

    /// Midpoint of the domain.
    pub fn center(&self, dim: usize) -> [f64; 3] {
        let mut c = [0.0; 3];
        for k in 0..dim {
            c[k] = 0.5 * (self.min[k] + self.max[k]);
        }
        c
    }

    /// Largest side length over the active axes.
    pub fn max_extent(&self, dim: usize) -> f64 {
        let mut w: f64 = 0.0;
        for k in 0..dim {
            w = w.max(self.max[k] - self.min[k]);
        }
        w
    }
}

/// Configuration for one gravity tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreeConfig {
    /// Spatial dimension, 2 or 3.
    pub dim: usize,
    /// Bounds of the root cell.
    pub domain: DomainLimits,
    /// Whether this tree participates in a multi-rank run. A parallel tree
    /// requires an attached partition tree and keyed particles.
    #[serde(default)]
    pub parallel: bool,
    /// Opening criterion used by every walk.
    #[serde(default)]
    pub split: SplitKind,
    /// Barnes-Hut opening angle, in (0, 1].
    #[serde(default = "default_opening_angle")]
    pub opening_angle: f64,
    /// Absolute tolerance for [`SplitKind::Acceleration`]. Ignored by the
    /// Barnes-Hut criterion.
    #[serde(default)]
    pub accel_tol: f64,
    /// Export-buffer capacity of one parallel walk round, in particles.
    #[serde(default = "default_max_export")]
    pub max_export: usize,
}

fn default_opening_angle() -> f64 {
    0.5
}

fn default_max_export() -> usize {
    4096
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            dim: 3,
            domain: DomainLimits::unit(),
            parallel: false,
            split: SplitKind::BarnesHut,
            opening_angle: default_opening_angle(),
            accel_tol: 0.0,
            max_export: default_max_export(),
        }
    }
}

impl TreeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dim != 2 && self.dim != 3 {
            return Err(GravityError::Config(format!(
                "dim must be 2 or 3, got {}",
                self.dim
            )));
        }
        if !(self.opening_angle > 0.0 && self.opening_angle <= 1.0) {
            return Err(GravityError::Config(format!(
                "opening_angle must lie in (0, 1], got {}",
                self.opening_angle
            )));
        }
        if self.split == SplitKind::Acceleration && !(self.accel_tol > 0.0) {
            return Err(GravityError::Config(format!(
                "accel_tol must be positive for the acceleration criterion, got {}",
                self.accel_tol
            )));
        }
        if self.max_export == 0 {
            return Err(GravityError::Config(
                "max_export must be positive".to_string(),
            ));
        }
        for k in 0..self.dim {
            if !(self.domain.max[k] > self.domain.min[k]) {
                return Err(GravityError::Config(format!(
                    "domain is empty along axis {k}: [{}, {}]",
                    self.domain.min[k], self.domain.max[k]
                )));
            }
        }
        Ok(())
    }

    /// Number of children of an interior cell.
    #[inline]
    pub fn fanout(&self) -> usize {
        1 << self.dim
    }
}
