//! Fleet manager library
//!
//! This crate provides the control plane for a fleet of plugin agents:
//! - Agent, runtime and metric registries over a shared record store
//! - Placement of start and stop tasks on the least-loaded agent
//! - Monitors for instance liveness, desired state and agent heartbeats
//! - Health checks and observability

pub mod agent_client;
pub mod clock;
pub mod coordination;
pub mod desired_state;
pub mod error;
pub mod health;
pub mod lock;
pub mod manager;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod proto;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod store;

pub use agent_client::{AgentClientConfig, AgentCommander, GrpcAgentClient, RecordingCommander};
pub use desired_state::{DesiredStateSource, FileDesiredState, StaticDesiredState};
pub use error::{ManagerError, StoreError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use manager::{Manager, ManagerBuilder, ManagerConfig, OwnershipPolicy};
pub use models::*;
pub use observability::{ManagerMetrics, StructuredLogger};
