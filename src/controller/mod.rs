//! Kubernetes side of the orchestrator
//!
//! Watches the module config and everything the orchestrator observes,
//! gathers [`Inputs`](crate::orchestrator::Inputs), runs one orchestration
//! tick and applies the recorded writes.

pub mod apply;
pub mod cache;
pub mod driver;
pub mod global_values;
pub mod inputs;
pub mod leader;
pub mod node_agent;
mod reconciler;
pub mod status;

pub use cache::SecretCache;
pub use global_values::GlobalValuesSync;
pub use leader::{holder_identity, run_leader_election};
pub use node_agent::{NodeAgentClient, NodeAgentConfig};
pub use reconciler::{run_controller, ControllerState};
