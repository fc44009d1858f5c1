//! Bounded-concurrency provision and delete tasks
//!
//! Every task takes one permit from a shared semaphore for its whole run, so
//! at most `MAX_CONCURRENT_PROVISIONS` installs/teardowns touch the cluster
//! at once. Task errors never bubble out: they land on the record's `error`
//! field and in the activity journal, and the reconciler converges the rest.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use crate::cluster::{namespace_is_terminating, ClusterProbe};
use crate::config::Settings;
use crate::driver::{DeploymentDriver, InstallParams};
use crate::error::Result;
use crate::events::EventSink;
use crate::reaper::Reaper;
use crate::registry::StoreRegistry;
use crate::store::{Store, StoreStatus};

/// Ceiling for the between-attempts release cleanup
const RETRY_CLEANUP_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Executor for provision and delete tasks
pub struct JobRunner {
    semaphore: Semaphore,
    settings: Arc<Settings>,
    registry: Arc<StoreRegistry>,
    probe: Arc<ClusterProbe>,
    driver: Arc<dyn DeploymentDriver>,
    reaper: Arc<Reaper>,
    events: Arc<EventSink>,
}

impl JobRunner {
    /// Create a runner with a permit pool sized from the settings
    pub fn new(
        settings: Arc<Settings>,
        registry: Arc<StoreRegistry>,
        probe: Arc<ClusterProbe>,
        driver: Arc<dyn DeploymentDriver>,
        reaper: Arc<Reaper>,
        events: Arc<EventSink>,
    ) -> Self {
        Self {
            semaphore: Semaphore::new(settings.max_concurrent_jobs.max(1)),
            settings,
            registry,
            probe,
            driver,
            reaper,
            events,
        }
    }

    /// Start a provision task for a freshly-admitted record
    pub fn spawn_provision(
        self: &Arc<Self>,
        store: Store,
        params: InstallParams,
    ) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move { runner.run_provision(store, params).await })
    }

    /// Start a delete task for a record already marked Deleting
    pub fn spawn_delete(self: &Arc<Self>, store: Store) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move { runner.run_delete(store).await })
    }

    async fn run_provision(&self, mut store: Store, params: InstallParams) {
        let _permit = self.semaphore.acquire().await.expect("semaphore closed");
        let deadline = Instant::now() + self.settings.provision_timeout;
        let max_attempts = self.settings.max_provision_attempts();

        for attempt in 1..=max_attempts {
            store.provision_attempts = attempt;

            if timeout_at(deadline, self.probe.wait_until_reachable())
                .await
                .is_err()
            {
                store.mark_failed("kubernetes API not ready: timed out waiting for cluster");
                self.registry.update(store.clone());
                self.events.activity("provision_failed", &store, &store.error);
                return;
            }

            match timeout_at(deadline, self.provision_once(&store, &params)).await {
                Ok(Ok(())) => {
                    store.mark_ready();
                    self.registry.update(store.clone());
                    self.events.activity("provision_ready", &store, "");
                    return;
                }
                Ok(Err(e)) => {
                    if attempt < max_attempts && Instant::now() < deadline {
                        store.status = StoreStatus::Provisioning;
                        store.error = format!("retrying ({attempt}/{max_attempts}): {e}");
                        store.touch();
                        self.registry.update(store.clone());
                        self.events.activity("provision_retry", &store, &store.error);
                        if let Err(cleanup_err) = self
                            .driver
                            .uninstall(&store.id, &store.namespace, RETRY_CLEANUP_TIMEOUT)
                            .await
                        {
                            warn!(store = %store.id, error = %cleanup_err, "pre-retry release cleanup failed");
                        }
                        tokio::time::sleep(self.settings.provision_retry_backoff).await;
                        continue;
                    }
                    store.mark_failed(e.to_string());
                    self.registry.update(store.clone());
                    self.events.activity("provision_failed", &store, &store.error);
                    return;
                }
                Err(_) => {
                    store.mark_failed("provision timed out");
                    self.registry.update(store.clone());
                    self.events.activity("provision_failed", &store, &store.error);
                    return;
                }
            }
        }
    }

    /// One install attempt: namespace pre-flight, RBAC, then the driver
    async fn provision_once(&self, store: &Store, params: &InstallParams) -> Result<()> {
        self.ensure_namespace_ready(&store.namespace).await?;
        self.probe.ensure_namespace(&store.namespace).await?;
        self.probe.ensure_namespace_access(&store.namespace).await?;
        self.driver.install(store, params).await
    }

    /// A leftover namespace still tearing down blocks the install; force it
    /// out first.
    async fn ensure_namespace_ready(&self, namespace: &str) -> Result<()> {
        let Some(ns) = self.probe.get_namespace(namespace).await? else {
            return Ok(());
        };
        if !namespace_is_terminating(&ns) {
            return Ok(());
        }
        info!(namespace, "namespace still terminating before install; finalizing");
        self.reaper.finalize_namespace(namespace).await
    }

    async fn run_delete(&self, mut store: Store) {
        let _permit = self.semaphore.acquire().await.expect("semaphore closed");
        let deadline = Instant::now() + self.settings.provision_timeout;

        if let Err(e) = self.probe.ensure_namespace_access(&store.namespace).await {
            warn!(store = %store.id, error = %e, "namespace rbac ensure failed");
        }

        let outcome = timeout_at(
            deadline,
            self.reaper
                .full_cleanup(&store, self.settings.provision_timeout),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                self.registry.remove(&store.id);
                self.events.audit("delete_store", &store.id, "deleted", "", None);
                self.events.activity("deleted", &store, "");
            }
            Ok(Err(e)) => self.fail_delete(&mut store, e.to_string()),
            Err(_) => self.fail_delete(&mut store, "delete timed out".to_string()),
        }
    }

    fn fail_delete(&self, store: &mut Store, reason: String) {
        store.mark_failed(reason);
        self.registry.update(store.clone());
        self.events
            .audit("delete_store", &store.id, "failed", &store.error, None);
        self.events.activity("delete_failed", store, &store.error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::driver::MockDeploymentDriver;
    use chrono::Utc;
    use clap::Parser;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        _dir: tempfile::TempDir,
        settings: Arc<Settings>,
        registry: Arc<StoreRegistry>,
        events: Arc<EventSink>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::parse_from(["urumi-orchestrator"]);
        settings.store_file = dir.path().join("stores.json");
        settings.provision_timeout = Duration::from_secs(5);
        settings.provision_retry_backoff = Duration::from_millis(10);
        let registry = Arc::new(StoreRegistry::new(&settings.store_file));
        registry.load().unwrap();
        let events = Arc::new(EventSink::new(
            dir.path().join("audit.log"),
            dir.path().join("activity.log"),
        ));
        Fixture {
            _dir: dir,
            settings: Arc::new(settings),
            registry,
            events,
        }
    }

    fn reachable_cluster() -> MockClusterClient {
        let mut mock = MockClusterClient::new();
        mock.expect_list_namespaces().returning(|| Ok(vec![]));
        mock.expect_get_namespace().returning(|_| Ok(None));
        mock.expect_create_namespace().returning(|_| Ok(()));
        mock
    }

    fn runner_with(
        fixture: &Fixture,
        cluster: MockClusterClient,
        driver: MockDeploymentDriver,
    ) -> Arc<JobRunner> {
        let cluster: Arc<dyn crate::cluster::ClusterClient> = Arc::new(cluster);
        let driver: Arc<dyn DeploymentDriver> = Arc::new(driver);
        let probe = Arc::new(ClusterProbe::new(cluster.clone()));
        let reaper = Arc::new(Reaper::new(cluster, driver.clone()));
        Arc::new(JobRunner::new(
            fixture.settings.clone(),
            fixture.registry.clone(),
            probe,
            driver,
            reaper,
            fixture.events.clone(),
        ))
    }

    fn provisioning_store(id: &str) -> Store {
        let now = Utc::now();
        Store {
            id: id.to_string(),
            name: id.to_string(),
            kind: crate::store::StoreKind::A,
            namespace: Store::namespace_for(id),
            status: StoreStatus::Provisioning,
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

    fn params() -> InstallParams {
        InstallParams {
            subdomain: "shop".to_string(),
            admin_password: "pw".to_string(),
        }
    }

    #[tokio::test]
    async fn successful_provision_marks_the_store_ready() {
        let fixture = fixture();
        let mut driver = MockDeploymentDriver::new();
        driver.expect_install().times(1).returning(|_, _| Ok(()));

        let runner = runner_with(&fixture, reachable_cluster(), driver);
        let store = provisioning_store("shop");
        fixture.registry.add(store.clone()).unwrap();

        runner.spawn_provision(store, params()).await.unwrap();

        let stored = fixture.registry.get("shop").unwrap();
        assert_eq!(stored.status, StoreStatus::Ready);
        assert!(stored.was_ready);
        assert!(stored.provisioned_at.is_some());
        assert_eq!(stored.provision_attempts, 1);
        assert!(stored.error.is_empty());
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let fixture = fixture();
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let mut driver = MockDeploymentDriver::new();
        driver.expect_install().times(2).returning(move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(crate::error::Error::driver("helm install: connection refused"))
            } else {
                Ok(())
            }
        });
        // Between attempts the half-installed release is cleaned up.
        driver.expect_uninstall().times(1).returning(|_, _, _| Ok(()));

        let runner = runner_with(&fixture, reachable_cluster(), driver);
        let store = provisioning_store("shop");
        fixture.registry.add(store.clone()).unwrap();

        runner.spawn_provision(store, params()).await.unwrap();

        let stored = fixture.registry.get("shop").unwrap();
        assert_eq!(stored.status, StoreStatus::Ready);
        assert_eq!(stored.provision_attempts, 2);
        assert!(stored.error.is_empty());

        let journal = fixture.events.read_activity(10).join("\n");
        assert!(journal.contains("provision_retry"));
        assert!(journal.contains("retrying (1/2)"));
        assert!(journal.contains("provision_ready"));
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_terminally() {
        let fixture = fixture();
        let mut driver = MockDeploymentDriver::new();
        driver
            .expect_install()
            .times(2)
            .returning(|_, _| Err(crate::error::Error::driver("helm install: timed out")));
        driver.expect_uninstall().returning(|_, _, _| Ok(()));

        let runner = runner_with(&fixture, reachable_cluster(), driver);
        let store = provisioning_store("shop");
        fixture.registry.add(store.clone()).unwrap();

        runner.spawn_provision(store, params()).await.unwrap();

        let stored = fixture.registry.get("shop").unwrap();
        assert_eq!(stored.status, StoreStatus::Failed);
        assert!(stored.error.contains("timed out"));
        assert!(!stored.was_ready);
        assert!(stored.provisioned_at.is_none());
        assert_eq!(stored.provision_attempts, 2);
    }

    #[tokio::test]
    async fn delete_removes_the_record_after_cleanup() {
        let fixture = fixture();
        let mut cluster = reachable_cluster();
        cluster.expect_list_pods().returning(|_| Ok(vec![]));
        cluster.expect_list_pvcs().returning(|_| Ok(vec![]));
        cluster.expect_delete_namespace().returning(|_| Ok(()));
        cluster.expect_list_pvs().returning(|| Ok(vec![]));
        let mut driver = MockDeploymentDriver::new();
        driver.expect_uninstall().times(1).returning(|_, _, _| Ok(()));

        let runner = runner_with(&fixture, cluster, driver);
        let mut store = provisioning_store("shop");
        store.status = StoreStatus::Deleting;
        fixture.registry.add(store.clone()).unwrap();

        runner.spawn_delete(store).await.unwrap();

        assert!(fixture.registry.get("shop").is_none());
        let journal = fixture.events.read_activity(10).join("\n");
        assert!(journal.contains("deleted"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn permit_pool_bounds_concurrent_installs() {
        let mut fixture = fixture();
        {
            let settings = Arc::get_mut(&mut fixture.settings).unwrap();
            settings.max_concurrent_jobs = 1;
        }

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut driver = MockDeploymentDriver::new();
        {
            let running = running.clone();
            let peak = peak.clone();
            driver.expect_install().times(3).returning(move |_, _| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(25));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let runner = runner_with(&fixture, reachable_cluster(), driver);
        let mut handles = Vec::new();
        for id in ["a", "b", "c"] {
            let store = provisioning_store(id);
            fixture.registry.add(store.clone()).unwrap();
            handles.push(runner.spawn_provision(store, params()));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
