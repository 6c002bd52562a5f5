//! Error types for the gravity solver.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GravityError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(
        "degenerate insertion: particles {first} and {second} at {position:?} \
         could not be separated after {splits} splits"
    )]
    DegenerateParticles {
        first: usize,
        second: usize,
        position: [f64; 3],
        splits: usize,
    },

    #[error("rank protocol mismatch: {0}")]
    Protocol(String),

    #[error("no partition tree attached; attach() is required for a parallel build")]
    NoPartition,
}

pub type Result<T> = std::result::Result<T, GravityError>;
