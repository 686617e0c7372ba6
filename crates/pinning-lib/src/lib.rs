//! Node resource alignment library
//!
//! This crate provides the core functionality for:
//! - Machine CPU topology discovery and cpuset arithmetic
//! - Exclusive CPU assignment for Guaranteed pods (static CPU policy)
//! - Topology-aware device allocation for device-plugin resources
//! - NUMA hint merging and pod admission
//! - Checksummed checkpoints for crash recovery
//! - Health checks and observability

pub mod bitmask;
pub mod checkpoint;
pub mod container_manager;
pub mod cpumanager;
pub mod cpuset;
pub mod devicemanager;
pub mod health;
pub mod models;
pub mod observability;
pub mod topology;
pub mod topologymanager;

pub use container_manager::{NodeResourceConfig, NodeResourceManager, NodeSnapshot, StartupError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::{Container, Pod, Quantity, ResourceRequirements};
pub use observability::{AgentMetrics, StructuredLogger};
