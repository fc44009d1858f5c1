//! Urumi orchestrator - multi-tenant store lifecycle management on Kubernetes
//!
//! Each tenant store maps to one cluster namespace into which a packaged
//! application bundle is installed with per-tenant values. An HTTP API accepts
//! create/delete requests; a background reconciler keeps the durable registry
//! aligned with the live cluster and force-reaps stuck resources.
//!
//! # Modules
//!
//! - [`store`] - store records, lifecycle states and release naming
//! - [`registry`] - durable, ordered, concurrent-safe store registry
//! - [`cluster`] - Kubernetes access seam and cluster discovery probes
//! - [`readiness`] - pure readiness evaluation over cluster observations
//! - [`driver`] - chart install/uninstall behind the `DeploymentDriver` trait
//! - [`reaper`] - forced cleanup of stuck namespaces, pods and volumes
//! - [`jobs`] - bounded-concurrency provision/delete task runner
//! - [`reconciler`] - periodic cluster/registry reconciliation sweep
//! - [`admission`] - request validation, quotas and rate limiting
//! - [`coordinator`] - top-level façade serving the API handlers
//! - [`api`] - axum HTTP edge
//! - [`events`] - audit and activity journals
//! - [`metrics`] - fleet metrics
//! - [`config`] - environment-driven configuration
//! - [`error`] - error types

pub mod admission;
pub mod api;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod events;
pub mod jobs;
pub mod metrics;
pub mod naming;
pub mod readiness;
pub mod reaper;
pub mod reconciler;
pub mod registry;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing with `RUST_LOG` support, falling back to the given
/// default directive.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init();
}
