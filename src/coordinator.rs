//! Top-level lifecycle façade
//!
//! Binds the registry, probe, job runner, reaper and reconciler together and
//! exposes the high-level operations the HTTP edge calls. Holds no
//! request-scoped state; everything here is shared handles constructed once
//! at startup.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::admission::{self, CreateStoreRequest, RateLimiter};
use crate::cluster::{ClusterClient, ClusterProbe};
use crate::config::Settings;
use crate::driver::{DeploymentDriver, InstallParams};
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::jobs::JobRunner;
use crate::metrics::{self, Metrics};
use crate::naming::random_string;
use crate::reaper::Reaper;
use crate::reconciler::Reconciler;
use crate::registry::StoreRegistry;
use crate::store::{Store, StoreStatus};

const GENERATED_PASSWORD_LEN: usize = 20;
const PASSWORD_SOURCE: &str = "k8s-secret";
const DEFAULT_ACTIVITY_LIMIT: usize = 50;

/// Accepted create response: the record plus one-time credentials
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedStore {
    /// The admitted record, in Provisioning
    pub store: Store,
    /// Admin password, disclosed exactly once when one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
    /// Where the password also lives, for operators
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_source: Option<String>,
}

/// Orchestrator façade serving the API handlers
pub struct LifecycleCoordinator {
    settings: Arc<Settings>,
    registry: Arc<StoreRegistry>,
    jobs: Arc<JobRunner>,
    reconciler: Arc<Reconciler>,
    rate_limiter: RateLimiter,
    events: Arc<EventSink>,
}

impl LifecycleCoordinator {
    /// Wire up the component graph and load the registry.
    pub fn new(
        settings: Arc<Settings>,
        cluster: Arc<dyn ClusterClient>,
        driver: Arc<dyn DeploymentDriver>,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(StoreRegistry::new(&settings.store_file));
        registry.load()?;

        let probe = Arc::new(ClusterProbe::new(cluster.clone()));
        let events = Arc::new(EventSink::new(
            &settings.audit_log_file,
            &settings.activity_log_file,
        ));
        let reaper = Arc::new(Reaper::new(cluster.clone(), driver.clone()));
        let jobs = Arc::new(JobRunner::new(
            settings.clone(),
            registry.clone(),
            probe.clone(),
            driver,
            reaper.clone(),
            events.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            settings.clone(),
            registry.clone(),
            cluster,
            probe,
            reaper,
        ));
        let rate_limiter = RateLimiter::new(settings.rate_limit_max, settings.rate_limit_window);

        Ok(Arc::new(Self {
            settings,
            registry,
            jobs,
            reconciler,
            rate_limiter,
            events,
        }))
    }

    /// Start the background reconcile loop
    pub fn start_background_sync(&self) -> JoinHandle<()> {
        self.reconciler.clone().spawn()
    }

    /// The shared rate limiter, applied by the HTTP middleware
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// The audit/activity sink
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// The runtime configuration
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Admit a create request, persist the record and start provisioning.
    ///
    /// A lost `add` race (two requests resolving the same free slug) loops
    /// back through id allocation, so exactly one caller gets the bare slug
    /// and the rest get suffixed ids.
    pub async fn create_store(
        &self,
        request: &CreateStoreRequest,
        source: &str,
    ) -> Result<CreatedStore> {
        let admitted = admission::validate(request)?;
        admission::check_quota(
            &self.registry.list(),
            source,
            self.settings.max_stores_total,
            self.settings.max_stores_per_ip,
        )?;

        let admin_password = if admitted.kind.requires_admin_credentials() {
            if self.settings.admin_password.is_empty() {
                random_string(GENERATED_PASSWORD_LEN)
            } else {
                self.settings.admin_password.clone()
            }
        } else {
            String::new()
        };

        let (store, subdomain) = loop {
            let id = self.registry.ensure_unique_id(&admitted.slug);
            let subdomain = if admitted.subdomain.is_empty() {
                id.clone()
            } else {
                admitted.subdomain.clone()
            };
            let now = Utc::now();
            let store = Store {
                id: id.clone(),
                name: admitted.name.clone(),
                kind: admitted.kind,
                namespace: Store::namespace_for(&id),
                status: StoreStatus::Provisioning,
                urls: vec![format!("http://{subdomain}.{}", self.settings.base_domain)],
                created_at: now,
                updated_at: now,
                was_ready: false,
                provisioned_at: None,
                created_by: source.to_string(),
                provision_attempts: 0,
                error: String::new(),
            };
            match self.registry.add(store.clone()) {
                Ok(()) => break (store, subdomain),
                Err(Error::Duplicate(_)) => continue,
                Err(e) => return Err(e),
            }
        };

        self.jobs.spawn_provision(
            store.clone(),
            InstallParams {
                subdomain,
                admin_password: admin_password.clone(),
            },
        );
        self.events.activity("created", &store, "");

        let has_password = !admin_password.is_empty();
        Ok(CreatedStore {
            store,
            admin_password: has_password.then_some(admin_password),
            password_source: has_password.then(|| PASSWORD_SOURCE.to_string()),
        })
    }

    /// Mark a store Deleting and start the teardown task.
    ///
    /// Repeat deletes of a store already mid-teardown are accepted as-is.
    pub async fn delete_store(&self, id: &str) -> Result<Store> {
        let Some(mut store) = self.registry.get(id) else {
            return Err(Error::NotFound(id.to_string()));
        };
        if store.status == StoreStatus::Deleting {
            return Ok(store);
        }
        store.status = StoreStatus::Deleting;
        store.touch();
        self.registry.update(store.clone());
        self.jobs.spawn_delete(store.clone());
        Ok(store)
    }

    /// Snapshot of one record
    pub fn get_store(&self, id: &str) -> Option<Store> {
        self.registry.get(id)
    }

    /// All records in insertion order, after a synchronous readiness refresh
    pub async fn list_stores(&self) -> Vec<Store> {
        self.reconciler.refresh_statuses().await;
        self.registry.list()
    }

    /// Fleet metrics over the current snapshot
    pub fn metrics(&self) -> Metrics {
        metrics::compute(&self.registry.list())
    }

    /// Trailing activity journal lines; a zero limit falls back to the default
    pub fn activity(&self) -> Vec<String> {
        let limit = if self.settings.activity_limit == 0 {
            DEFAULT_ACTIVITY_LIMIT
        } else {
            self.settings.activity_limit
        };
        self.events.read_activity(limit)
    }
}
