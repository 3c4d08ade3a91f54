//! Registries holding the manager's shared state
//!
//! All three registries sit on top of [`crate::store::RecordStore`] tables and
//! mutate records only through compare-and-swap.

mod agents;
mod metrics;
mod runtimes;

pub use agents::{AgentRegistry, Tombstone};
pub use metrics::MetricStore;
pub use runtimes::{RuntimeRange, RuntimeRegistry};

/// Key prefixes used inside a shared store
pub mod prefixes {
    pub const AGENTS: &str = "/agents/";
    pub const TOMBSTONES: &str = "/tombstones/";
    pub const RUNTIMES: &str = "/runtimes/";
    pub const AGENT_METRICS: &str = "/metrics/agents/";
    pub const INSTANCE_METRICS: &str = "/metrics/instances/";
}
