//! Background reconciliation loop
//!
//! Every sweep cross-checks persisted records against the live cluster:
//! unknown `store-*` namespaces are imported, records whose namespace is gone
//! are dropped, statuses are refreshed through the readiness evaluator, and
//! zombie namespaces are handed to the reaper. The loop does not start until
//! the cluster answers, and each tick runs under a fixed budget so a slow
//! API server cannot back the loop up.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, ClusterProbe};
use crate::config::Settings;
use crate::error::Result;
use crate::readiness::evaluate_store;
use crate::reaper::Reaper;
use crate::registry::StoreRegistry;
use crate::store::{Store, StoreKind, StoreStatus, NAMESPACE_PREFIX};

/// Pause between sweeps
const SYNC_INTERVAL: Duration = Duration::from_secs(30);
/// Budget for one sweep; overruns are abandoned
const TICK_BUDGET: Duration = Duration::from_secs(20);

/// Periodic cluster/registry reconciliation
pub struct Reconciler {
    settings: Arc<Settings>,
    registry: Arc<StoreRegistry>,
    cluster: Arc<dyn ClusterClient>,
    probe: Arc<ClusterProbe>,
    reaper: Arc<Reaper>,
}

impl Reconciler {
    /// Create a reconciler over the shared state handles
    pub fn new(
        settings: Arc<Settings>,
        registry: Arc<StoreRegistry>,
        cluster: Arc<dyn ClusterClient>,
        probe: Arc<ClusterProbe>,
        reaper: Arc<Reaper>,
    ) -> Self {
        Self {
            settings,
            registry,
            cluster,
            probe,
            reaper,
        }
    }

    /// Start the long-lived background task
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        self.probe.wait_until_reachable().await;
        info!("cluster reachable; starting reconcile loop");

        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tokio::time::timeout(TICK_BUDGET, self.tick()).await.is_err() {
                warn!("reconcile tick exceeded its budget; abandoning");
            }
        }
    }

    /// One sweep: import, drop, refresh, zombie cleanup
    pub async fn tick(&self) {
        if let Err(e) = self.sync_with_cluster().await {
            warn!(error = %e, "cluster sync failed");
        }
        self.refresh_statuses().await;
        if let Err(e) = self.reaper.sweep_zombies().await {
            warn!(error = %e, "zombie sweep failed");
        }
    }

    /// Import unknown live `store-*` namespaces and drop records whose
    /// namespace has vanished (unless they are mid-delete).
    async fn sync_with_cluster(&self) -> Result<()> {
        let namespaces = self.cluster.list_namespaces().await?;

        let mut observed: HashSet<String> = HashSet::new();
        for namespace in &namespaces {
            let Some(name) = namespace.metadata.name.as_deref() else {
                continue;
            };
            if !name.starts_with(NAMESPACE_PREFIX) {
                continue;
            }
            if namespace.metadata.deletion_timestamp.is_some() {
                continue;
            }
            observed.insert(name.to_string());

            let Some(id) = Store::id_from_namespace(name) else {
                continue;
            };
            if self.registry.get(id).is_some() {
                continue;
            }
            // A restart with a pre-populated cluster lands here. The real
            // kind is unknowable without a namespace label, so assume A.
            info!(store = id, "importing unknown store namespace");
            let now = Utc::now();
            let imported = Store {
                id: id.to_string(),
                name: id.to_string(),
                kind: StoreKind::A,
                namespace: name.to_string(),
                status: StoreStatus::Provisioning,
                urls: vec![format!("http://{id}.{}", self.settings.base_domain)],
                created_at: now,
                updated_at: now,
                was_ready: false,
                provisioned_at: None,
                created_by: String::new(),
                provision_attempts: 0,
                error: String::new(),
            };
            if let Err(e) = self.registry.add(imported) {
                debug!(store = id, error = %e, "import raced another writer");
            }
        }

        for store in self.registry.list() {
            if store.status == StoreStatus::Deleting {
                continue;
            }
            if !observed.contains(&store.namespace) {
                info!(store = %store.id, "namespace vanished; dropping record");
                self.registry.remove(&store.id);
            }
        }
        Ok(())
    }

    /// Re-evaluate readiness for every record not mid-delete, applying the
    /// status guards before committing a change.
    pub async fn refresh_statuses(&self) {
        for mut store in self.registry.list() {
            if store.status == StoreStatus::Deleting {
                continue;
            }
            if let Err(e) = self.probe.ensure_namespace_access(&store.namespace).await {
                debug!(store = %store.id, error = %e, "namespace access converge failed");
            }

            let (status, message) = match evaluate_store(&self.probe, &store).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    debug!(store = %store.id, error = %e, "readiness probe failed; skipping");
                    continue;
                }
            };

            if status == StoreStatus::Failed && message == "namespace not found" {
                self.registry.remove(&store.id);
                continue;
            }
            // A transient miss must not downgrade a terminal failure.
            if store.status == StoreStatus::Failed && status == StoreStatus::Provisioning {
                continue;
            }
            if status == store.status && message == store.error {
                continue;
            }

            store.status = status;
            store.error = message;
            if status == StoreStatus::Ready {
                store.was_ready = true;
                if store.provisioned_at.is_none() {
                    store.provisioned_at = Some(Utc::now());
                }
            }
            store.touch();
            self.registry.update(store);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::driver::MockDeploymentDriver;
    use clap::Parser;
    use k8s_openapi::api::core::v1::Namespace;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn live_namespace(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn deleting_namespace(name: &str) -> Namespace {
        let mut ns = live_namespace(name);
        ns.metadata.deletion_timestamp = Some(Time(Utc::now()));
        ns
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<StoreRegistry>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(StoreRegistry::new(dir.path().join("stores.json")));
        registry.load().unwrap();
        Fixture { _dir: dir, registry }
    }

    fn reconciler_with(fixture: &Fixture, cluster: MockClusterClient) -> Reconciler {
        let cluster: Arc<dyn ClusterClient> = Arc::new(cluster);
        let probe = Arc::new(ClusterProbe::new(cluster.clone()));
        let mut driver = MockDeploymentDriver::new();
        driver.expect_uninstall().returning(|_, _, _| Ok(()));
        let reaper = Arc::new(Reaper::new(cluster.clone(), Arc::new(driver)));
        Reconciler::new(
            Arc::new(Settings::parse_from(["urumi-orchestrator"])),
            fixture.registry.clone(),
            cluster,
            probe,
            reaper,
        )
    }

    fn seeded_store(id: &str, status: StoreStatus) -> Store {
        let now = Utc::now();
        Store {
            id: id.to_string(),
            name: id.to_string(),
            kind: StoreKind::A,
            namespace: Store::namespace_for(id),
            status,
            urls: vec![],
            created_at: now,
            updated_at: now,
            was_ready: false,
            provisioned_at: None,
            created_by: String::new(),
            provision_attempts: 0,
            error: String::new(),
        }
    }

    #[tokio::test]
    async fn unknown_namespaces_are_imported_as_kind_a() {
        let fixture = fixture();
        let mut cluster = MockClusterClient::new();
        cluster.expect_list_namespaces().returning(|| {
            Ok(vec![live_namespace("store-found"), live_namespace("kube-system")])
        });
        let reconciler = reconciler_with(&fixture, cluster);

        reconciler.sync_with_cluster().await.unwrap();

        let imported = fixture.registry.get("found").expect("imported record");
        assert_eq!(imported.kind, StoreKind::A);
        assert_eq!(imported.status, StoreStatus::Provisioning);
        assert_eq!(imported.namespace, "store-found");
        assert_eq!(imported.urls, vec!["http://found.127.0.0.1.nip.io"]);
        assert!(fixture.registry.get("kube-system").is_none());
    }

    #[tokio::test]
    async fn namespaces_mid_deletion_are_not_imported() {
        let fixture = fixture();
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_list_namespaces()
            .returning(|| Ok(vec![deleting_namespace("store-dying")]));
        let reconciler = reconciler_with(&fixture, cluster);

        reconciler.sync_with_cluster().await.unwrap();
        assert!(fixture.registry.get("dying").is_none());
    }

    #[tokio::test]
    async fn records_without_a_namespace_are_dropped_unless_deleting() {
        let fixture = fixture();
        fixture.registry.add(seeded_store("a", StoreStatus::Ready)).unwrap();
        fixture
            .registry
            .add(seeded_store("b", StoreStatus::Provisioning))
            .unwrap();
        fixture
            .registry
            .add(seeded_store("c", StoreStatus::Deleting))
            .unwrap();

        let mut cluster = MockClusterClient::new();
        cluster
            .expect_list_namespaces()
            .returning(|| Ok(vec![live_namespace("store-a")]));
        let reconciler = reconciler_with(&fixture, cluster);

        reconciler.sync_with_cluster().await.unwrap();

        assert!(fixture.registry.get("a").is_some());
        assert!(fixture.registry.get("b").is_none(), "vanished namespace drops record");
        assert!(fixture.registry.get("c").is_some(), "deleting record survives");
    }

    fn refresh_cluster(namespace_present: bool) -> MockClusterClient {
        let mut cluster = MockClusterClient::new();
        if namespace_present {
            cluster
                .expect_get_namespace()
                .returning(|name| Ok(Some(live_namespace(name))));
        } else {
            cluster.expect_get_namespace().returning(|_| Ok(None));
        }
        cluster
            .expect_get_role_binding()
            .returning(|_, _| Ok(None));
        cluster.expect_create_role_binding().returning(|_, _| Ok(()));
        cluster
    }

    #[tokio::test]
    async fn refresh_removes_records_whose_namespace_is_gone() {
        let fixture = fixture();
        fixture
            .registry
            .add(seeded_store("a", StoreStatus::Ready))
            .unwrap();
        let reconciler = reconciler_with(&fixture, refresh_cluster(false));

        reconciler.refresh_statuses().await;
        assert!(fixture.registry.get("a").is_none());
    }

    #[tokio::test]
    async fn refresh_never_downgrades_failed_to_provisioning() {
        let fixture = fixture();
        let mut failed = seeded_store("a", StoreStatus::Failed);
        failed.error = "setup job failed".to_string();
        fixture.registry.add(failed).unwrap();

        let mut cluster = refresh_cluster(true);
        // No job and no deployment observed → evaluator says Provisioning.
        cluster.expect_get_job().returning(|_, _| Ok(None));
        cluster.expect_get_deployment().returning(|_, _| Ok(None));
        let reconciler = reconciler_with(&fixture, cluster);

        reconciler.refresh_statuses().await;
        let stored = fixture.registry.get("a").unwrap();
        assert_eq!(stored.status, StoreStatus::Failed);
        assert_eq!(stored.error, "setup job failed");
    }

    #[tokio::test]
    async fn refresh_promotes_to_ready_and_sets_sticky_fields() {
        use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
        use k8s_openapi::api::batch::v1::{Job, JobStatus};

        let fixture = fixture();
        fixture
            .registry
            .add(seeded_store("a", StoreStatus::Provisioning))
            .unwrap();

        let mut cluster = refresh_cluster(true);
        cluster.expect_get_job().returning(|_, name| {
            assert_eq!(name, "urumi-a-ecommerce-store-job");
            Ok(Some(Job {
                status: Some(JobStatus {
                    succeeded: Some(1),
                    ..Default::default()
                }),
                ..Default::default()
            }))
        });
        cluster.expect_get_deployment().returning(|_, name| {
            assert_eq!(name, "urumi-a-ecommerce-store-primary");
            Ok(Some(Deployment {
                status: Some(DeploymentStatus {
                    ready_replicas: Some(1),
                    ..Default::default()
                }),
                ..Default::default()
            }))
        });
        let reconciler = reconciler_with(&fixture, cluster);

        reconciler.refresh_statuses().await;
        let stored = fixture.registry.get("a").unwrap();
        assert_eq!(stored.status, StoreStatus::Ready);
        assert!(stored.was_ready);
        assert!(stored.provisioned_at.is_some());
    }

    #[tokio::test]
    async fn refresh_skips_the_write_when_nothing_changed() {
        let fixture = fixture();
        let mut ready = seeded_store("a", StoreStatus::Ready);
        ready.was_ready = true;
        ready.provisioned_at = Some(Utc::now());
        let before = ready.updated_at;
        fixture.registry.add(ready).unwrap();

        let mut cluster = refresh_cluster(true);
        cluster.expect_get_job().returning(|_, _| {
            Ok(Some(k8s_openapi::api::batch::v1::Job {
                status: Some(k8s_openapi::api::batch::v1::JobStatus {
                    succeeded: Some(1),
                    ..Default::default()
                }),
                ..Default::default()
            }))
        });
        cluster.expect_get_deployment().returning(|_, _| {
            Ok(Some(k8s_openapi::api::apps::v1::Deployment {
                status: Some(k8s_openapi::api::apps::v1::DeploymentStatus {
                    ready_replicas: Some(1),
                    ..Default::default()
                }),
                ..Default::default()
            }))
        });
        let reconciler = reconciler_with(&fixture, cluster);

        reconciler.refresh_statuses().await;
        let stored = fixture.registry.get("a").unwrap();
        assert_eq!(stored.updated_at, before, "unchanged state is not rewritten");
    }

    #[tokio::test]
    async fn refresh_skips_records_with_probe_errors() {
        let fixture = fixture();
        fixture
            .registry
            .add(seeded_store("a", StoreStatus::Ready))
            .unwrap();

        let mut cluster = MockClusterClient::new();
        cluster
            .expect_get_namespace()
            .returning(|_| Err(crate::error::Error::driver("api flake")));
        let reconciler = reconciler_with(&fixture, cluster);

        reconciler.refresh_statuses().await;
        let stored = fixture.registry.get("a").unwrap();
        assert_eq!(stored.status, StoreStatus::Ready, "record untouched on probe error");
    }
}
