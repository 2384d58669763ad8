//! system-registry-orchestrator: drives the cluster-embedded container image
//! registry between its operating modes.
//!
//! The [`orchestrator`] module holds the convergence logic and is free of
//! Kubernetes I/O; [`controller`] feeds it with cluster observations and
//! applies the writes it records. [`user_operations`] executes UserOperation
//! requests against Dex.

pub mod constants;
pub mod controller;
pub mod crd;
pub mod deckhouse_registry;
pub mod error;
pub mod helpers;
pub mod orchestrator;
pub mod pki;
pub mod user_operations;
pub mod values;

pub use crate::error::{Error, Result};
