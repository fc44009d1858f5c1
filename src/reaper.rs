//! Forced cleanup of stuck cluster resources
//!
//! Namespaces waiting on finalizers, orphaned volumes and pods stuck in
//! Terminating all end up here. Every step of the full cleanup is
//! best-effort: failures are logged and processing continues, because the
//! reconciler will notice any residue on a later sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::cluster::ClusterClient;
use crate::driver::DeploymentDriver;
use crate::error::{Error, Result};
use crate::store::{Store, NAMESPACE_PREFIX};

/// How long a namespace may sit in Terminating before it is a zombie
const ZOMBIE_GRACE_SECS: i64 = 120;
/// How long to poll for a finalized namespace to disappear
const FINALIZE_WAIT: Duration = Duration::from_secs(120);
const FINALIZE_POLL: Duration = Duration::from_secs(2);

/// Forced-cleanup protocol runner
pub struct Reaper {
    cluster: Arc<dyn ClusterClient>,
    driver: Arc<dyn DeploymentDriver>,
}

impl Reaper {
    /// Create a reaper over the given cluster client and driver
    pub fn new(cluster: Arc<dyn ClusterClient>, driver: Arc<dyn DeploymentDriver>) -> Self {
        Self { cluster, driver }
    }

    /// Clear a namespace's finalizers and re-issue its delete.
    ///
    /// Absent namespaces are a no-op. Does not wait for the namespace to
    /// disappear; use [`finalize_namespace`](Self::finalize_namespace) when
    /// the caller needs the namespace gone.
    pub async fn strip_finalizers(&self, name: &str) -> Result<()> {
        let Some(mut namespace) = self.cluster.get_namespace(name).await? else {
            return Ok(());
        };

        let has_meta_finalizers = namespace
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|finalizers| !finalizers.is_empty());
        let has_spec_finalizers = namespace
            .spec
            .as_ref()
            .and_then(|spec| spec.finalizers.as_ref())
            .is_some_and(|finalizers| !finalizers.is_empty());

        if has_meta_finalizers || has_spec_finalizers {
            info!(namespace = name, "clearing namespace finalizers");
            namespace.metadata.finalizers = Some(Vec::new());
            if let Some(spec) = namespace.spec.as_mut() {
                spec.finalizers = Some(Vec::new());
            }
            if let Err(e) = self.cluster.finalize_namespace(&namespace).await {
                warn!(namespace = name, error = %e, "namespace finalize write failed");
            }
        }

        if let Err(e) = self.cluster.delete_namespace(name).await {
            warn!(namespace = name, error = %e, "namespace delete failed");
        }
        Ok(())
    }

    /// Apply [`strip_finalizers`](Self::strip_finalizers) and poll up to two
    /// minutes for the namespace to disappear.
    pub async fn finalize_namespace(&self, name: &str) -> Result<()> {
        self.strip_finalizers(name).await?;

        let deadline = tokio::time::Instant::now() + FINALIZE_WAIT;
        loop {
            if self.cluster.get_namespace(name).await?.is_none() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::timeout(format!(
                    "namespace {name} is terminating; delete in progress"
                )));
            }
            tokio::time::sleep(FINALIZE_POLL).await;
        }
    }

    /// Finalize every managed namespace whose deletion has been pending for
    /// more than the zombie grace period.
    pub async fn sweep_zombies(&self) -> Result<()> {
        let namespaces = self.cluster.list_namespaces().await?;
        let now = Utc::now();
        for namespace in namespaces {
            let Some(name) = namespace.metadata.name.clone() else {
                continue;
            };
            if !name.starts_with(NAMESPACE_PREFIX) {
                continue;
            }
            let Some(deleted_at) = namespace.metadata.deletion_timestamp.as_ref() else {
                continue;
            };
            if now.signed_duration_since(deleted_at.0).num_seconds() < ZOMBIE_GRACE_SECS {
                continue;
            }
            info!(namespace = %name, "finalizing zombie namespace");
            if let Err(e) = self.strip_finalizers(&name).await {
                warn!(namespace = %name, error = %e, "zombie finalize failed");
            }
        }
        Ok(())
    }

    /// Tear down everything belonging to a store.
    ///
    /// Uninstalls the release, force-deletes pods, strips claim and volume
    /// finalizers, and deletes the namespace (finalizing it when stuck).
    /// Each sub-step failure is logged, never fatal.
    pub async fn full_cleanup(&self, store: &Store, uninstall_timeout: Duration) -> Result<()> {
        if let Err(e) = self
            .driver
            .uninstall(&store.id, &store.namespace, uninstall_timeout)
            .await
        {
            warn!(store = %store.id, error = %e, "release uninstall failed");
        }

        match self.cluster.list_pods(&store.namespace).await {
            Ok(pods) => {
                for pod in pods {
                    let Some(name) = pod.metadata.name else { continue };
                    info!(namespace = %store.namespace, pod = %name, "force deleting pod");
                    if let Err(e) = self.cluster.force_delete_pod(&store.namespace, &name).await {
                        warn!(pod = %name, error = %e, "pod force delete failed");
                    }
                }
            }
            Err(e) => warn!(namespace = %store.namespace, error = %e, "pod list failed"),
        }

        match self.cluster.list_pvcs(&store.namespace).await {
            Ok(pvcs) => {
                for mut pvc in pvcs {
                    let Some(name) = pvc.metadata.name.clone() else { continue };
                    pvc.metadata.finalizers = None;
                    if let Err(e) = self.cluster.update_pvc(&store.namespace, &pvc).await {
                        warn!(pvc = %name, error = %e, "pvc finalizer update failed");
                    }
                    if let Err(e) = self.cluster.delete_pvc(&store.namespace, &name).await {
                        warn!(pvc = %name, error = %e, "pvc delete failed");
                    }
                }
            }
            Err(e) => warn!(namespace = %store.namespace, error = %e, "pvc list failed"),
        }

        if let Err(e) = self.cluster.delete_namespace(&store.namespace).await {
            warn!(namespace = %store.namespace, error = %e, "namespace delete failed");
        }
        if let Err(e) = self.finalize_namespace(&store.namespace).await {
            warn!(namespace = %store.namespace, error = %e, "namespace finalize failed");
        }

        match self.cluster.list_pvs().await {
            Ok(pvs) => {
                for mut pv in pvs {
                    let claims_namespace = pv
                        .spec
                        .as_ref()
                        .and_then(|spec| spec.claim_ref.as_ref())
                        .and_then(|claim| claim.namespace.as_deref())
                        == Some(store.namespace.as_str());
                    if !claims_namespace {
                        continue;
                    }
                    let Some(name) = pv.metadata.name.clone() else { continue };
                    pv.metadata.finalizers = None;
                    if let Err(e) = self.cluster.update_pv(&pv).await {
                        warn!(pv = %name, error = %e, "pv finalizer update failed");
                    }
                    if let Err(e) = self.cluster.delete_pv(&name).await {
                        warn!(pv = %name, error = %e, "pv delete failed");
                    }
                }
            }
            Err(e) => warn!(error = %e, "pv list failed"),
        }

        Ok(())
    }
}
