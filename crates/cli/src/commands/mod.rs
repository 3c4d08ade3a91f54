//! Subcommand implementations

pub mod agents;
pub mod metrics;
pub mod runtimes;
pub mod status;
pub mod tasks;
