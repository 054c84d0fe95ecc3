//! Policy-side types: action distributions and network collaborators
//!
//! This module does not define network architectures; it describes what the
//! training core needs from them.

pub mod distribution;
pub mod network;

pub use distribution::{
    ActionComponentSpec, ActionDistribution, ActionSpec, Distribution, DistributionKind,
    DistributionParams,
};
pub use network::{kernel_weights, ActorNetwork, ValueNetwork};
