pub mod config;
pub mod direct;
pub mod error;
pub mod interaction;
pub mod parallel;
pub mod particles;
pub mod partition;
pub mod pool;
pub mod remote;
pub mod splitter;
pub mod transport;
pub mod tree;

pub use crate::config::{DomainLimits, SplitKind, TreeConfig};
pub use crate::error::GravityError;
pub use crate::interaction::{Acceleration, Interaction};
pub use crate::parallel::WalkStats;
pub use crate::particles::{ParticleSet, ParticleTag};
pub use crate::partition::{MortonPartition, PartitionNode, PartitionTree};
pub use crate::pool::{Node, NodeFlags, NodePool, Payload};
pub use crate::splitter::{AccelOpening, BarnesHutOpening, Splitter};
pub use crate::transport::{Comm, LocalCluster, SelfComm, ThreadComm};
pub use crate::tree::GravityTree;
