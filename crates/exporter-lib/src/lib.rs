//! Ephemeral storage exporter library
//!
//! This crate provides the core functionality for:
//! - Tracking scrape targets and pod resource profiles from the cluster API
//! - Querying node stats endpoints with bounded retry
//! - Computing ephemeral storage gauges and evicting stale series
//! - Periodic garbage collection of vanished nodes and pods
//! - Health checks and observability

pub mod cluster;
pub mod compute;
pub mod gc;
pub mod health;
pub mod models;
pub mod nodes;
pub mod observability;
pub mod pods;
pub mod quantity;
pub mod readiness;
pub mod scheduler;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{MetricFeatures, StorageMetrics, StructuredLogger};
