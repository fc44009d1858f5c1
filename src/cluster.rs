//! Cluster access layer
//!
//! [`ClusterClient`] is the thin seam over the Kubernetes API: it lists, gets
//! and updates the handful of resource types the orchestrator touches, and is
//! mockable in tests. [`ClusterProbe`] layers the read-side queries on top:
//! reachability checks, tri-state workload lookups, and ingress/storage class
//! discovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::networking::v1::IngressClass;
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::Result;
use crate::store::NAMESPACE_PREFIX;

/// ClusterRole granting the orchestrator access inside store namespaces
const NAMESPACE_ROLE_NAME: &str = "urumi-orchestrator-ns";
/// RoleBinding converged into every store namespace
const ROLE_BINDING_NAME: &str = "urumi-orchestrator";
/// ServiceAccount the orchestrator runs as
const SERVICE_ACCOUNT: &str = "orchestrator";
/// Namespace the orchestrator is deployed into
const ORCHESTRATOR_NAMESPACE: &str = "urumi-system";

const DEFAULT_INGRESS_ANNOTATION: &str = "ingressclass.kubernetes.io/is-default-class";
const DEFAULT_STORAGE_ANNOTATIONS: [&str; 2] = [
    "storageclass.kubernetes.io/is-default-class",
    "storageclass.beta.kubernetes.io/is-default-class",
];

/// How long a single reachability probe may take
const REACHABLE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between reachability probes while waiting for the cluster
pub const REACHABLE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Low-level cluster operations the orchestrator depends on.
///
/// Absent objects are `Ok(None)`; only transport/API failures surface as
/// errors, which keeps the tri-state {present, absent, error} explicit at
/// every call site.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List all namespaces in the cluster
    async fn list_namespaces(&self) -> Result<Vec<Namespace>>;
    /// Fetch one namespace
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;
    /// Create a namespace, tolerating a concurrent creation
    async fn create_namespace(&self, name: &str) -> Result<()>;
    /// Delete a namespace, tolerating it being already gone
    async fn delete_namespace(&self, name: &str) -> Result<()>;
    /// Write a namespace through the finalize sub-resource
    async fn finalize_namespace(&self, namespace: &Namespace) -> Result<()>;

    /// Fetch a deployment in a namespace
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;
    /// Fetch a job in a namespace
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    /// List pods in a namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;
    /// Delete a pod immediately (grace period 0, background propagation)
    async fn force_delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// List claims in a namespace
    async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>>;
    /// Replace a claim (finalizer edits)
    async fn update_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()>;
    /// Delete a claim
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()>;

    /// List cluster-scoped persistent volumes
    async fn list_pvs(&self) -> Result<Vec<PersistentVolume>>;
    /// Replace a persistent volume (finalizer edits)
    async fn update_pv(&self, pv: &PersistentVolume) -> Result<()>;
    /// Delete a persistent volume
    async fn delete_pv(&self, name: &str) -> Result<()>;

    /// List ingress classes
    async fn list_ingress_classes(&self) -> Result<Vec<IngressClass>>;
    /// List storage classes
    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>>;

    /// Fetch a role binding in a namespace
    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>>;
    /// Create a role binding
    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding) -> Result<()>;
    /// Replace a role binding
    async fn update_role_binding(&self, namespace: &str, binding: &RoleBinding) -> Result<()>;
}

/// Real [`ClusterClient`] backed by a kube [`Client`]
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap the given kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        Ok(self.namespaces().list(&ListParams::default()).await?.items)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        Ok(self.namespaces().get_opt(name).await?)
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match self.namespaces().create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        match self.namespaces().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn finalize_namespace(&self, namespace: &Namespace) -> Result<()> {
        let name = namespace.metadata.name.clone().unwrap_or_default();
        let data = serde_json::to_vec(namespace)?;
        self.namespaces()
            .replace_subresource("finalize", &name, &PostParams::default(), data)
            .await?;
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn force_delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams::background().grace_period(0);
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn update_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let name = pvc.metadata.name.clone().unwrap_or_default();
        api.replace(&name, &PostParams::default(), pvc).await?;
        Ok(())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pvs(&self) -> Result<Vec<PersistentVolume>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn update_pv(&self, pv: &PersistentVolume) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let name = pv.metadata.name.clone().unwrap_or_default();
        api.replace(&name, &PostParams::default(), pv).await?;
        Ok(())
    }

    async fn delete_pv(&self, name: &str) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_ingress_classes(&self) -> Result<Vec<IngressClass>> {
        let api: Api<IngressClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding) -> Result<()> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), binding).await?;
        Ok(())
    }

    async fn update_role_binding(&self, namespace: &str, binding: &RoleBinding) -> Result<()> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        let name = binding.metadata.name.clone().unwrap_or_default();
        api.replace(&name, &PostParams::default(), binding).await?;
        Ok(())
    }
}

/// Whether a namespace is in the Terminating phase
pub fn namespace_is_terminating(namespace: &Namespace) -> bool {
    namespace
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Terminating")
}

/// Read-side query layer over [`ClusterClient`]
pub struct ClusterProbe {
    cluster: Arc<dyn ClusterClient>,
}

impl ClusterProbe {
    /// Wrap the given cluster client
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    /// Boolean reachability probe: can we list namespaces within the deadline?
    pub async fn cluster_reachable(&self, deadline: Duration) -> bool {
        matches!(
            tokio::time::timeout(deadline, self.cluster.list_namespaces()).await,
            Ok(Ok(_))
        )
    }

    /// Block until the cluster answers, probing every 2 seconds.
    ///
    /// Callers bound this with their own deadline via `tokio::time::timeout`.
    pub async fn wait_until_reachable(&self) {
        loop {
            if self.cluster_reachable(REACHABLE_PROBE_TIMEOUT).await {
                return;
            }
            tokio::time::sleep(REACHABLE_POLL_INTERVAL).await;
        }
    }

    /// Tri-state namespace lookup
    pub async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        self.cluster.get_namespace(name).await
    }

    /// Tri-state deployment lookup
    pub async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        self.cluster.get_deployment(namespace, name).await
    }

    /// Tri-state job lookup
    pub async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        self.cluster.get_job(namespace, name).await
    }

    /// Pick the ingress class to hand to the chart.
    ///
    /// Order: the configured class if the cluster has it, the class annotated
    /// as default, then `nginx`/`traefik` if present, then the first listed.
    /// When the lookup fails the configured class is returned unchanged.
    pub async fn resolve_ingress_class(&self, preferred: &str) -> String {
        let classes = match self.cluster.list_ingress_classes().await {
            Ok(classes) if !classes.is_empty() => classes,
            _ => return preferred.to_string(),
        };

        let mut default_class = None;
        let mut names = Vec::with_capacity(classes.len());
        for class in &classes {
            let Some(name) = class.metadata.name.as_deref() else {
                continue;
            };
            names.push(name);
            let is_default = class
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(DEFAULT_INGRESS_ANNOTATION))
                .map(String::as_str)
                == Some("true");
            if is_default {
                default_class = Some(name);
            }
        }

        if !preferred.is_empty() && names.contains(&preferred) {
            return preferred.to_string();
        }
        if let Some(default_class) = default_class {
            return default_class.to_string();
        }
        for fallback in ["nginx", "traefik"] {
            if names.contains(&fallback) {
                return fallback.to_string();
            }
        }
        names.first().map(|name| name.to_string()).unwrap_or_else(|| preferred.to_string())
    }

    /// Namespace the ingress controller for a class runs in, when well known
    pub fn resolve_ingress_namespace(class: &str) -> &'static str {
        match class {
            "nginx" => "ingress-nginx",
            "traefik" => "kube-system",
            _ => "",
        }
    }

    /// First storage class carrying one of the well-known default annotations
    pub async fn detect_default_storage_class(&self) -> Result<Option<String>> {
        let classes = self.cluster.list_storage_classes().await?;
        for class in classes {
            let is_default = class.metadata.annotations.as_ref().is_some_and(|annotations| {
                DEFAULT_STORAGE_ANNOTATIONS
                    .iter()
                    .any(|key| annotations.get(*key).map(String::as_str) == Some("true"))
            });
            if is_default {
                return Ok(class.metadata.name);
            }
        }
        Ok(None)
    }

    /// Create the namespace if it does not exist yet
    pub async fn ensure_namespace(&self, name: &str) -> Result<()> {
        if self.cluster.get_namespace(name).await?.is_some() {
            return Ok(());
        }
        self.cluster.create_namespace(name).await
    }

    /// Converge the orchestrator RoleBinding inside a store namespace.
    ///
    /// No-op for namespaces the orchestrator does not manage or that do not
    /// exist.
    pub async fn ensure_namespace_access(&self, namespace: &str) -> Result<()> {
        if !namespace.starts_with(NAMESPACE_PREFIX) {
            return Ok(());
        }
        if self.cluster.get_namespace(namespace).await?.is_none() {
            return Ok(());
        }

        let desired = orchestrator_role_binding(namespace);
        match self.cluster.get_role_binding(namespace, ROLE_BINDING_NAME).await? {
            None => self.cluster.create_role_binding(namespace, &desired).await,
            Some(existing) if role_binding_matches(&existing, &desired) => Ok(()),
            Some(mut existing) => {
                debug!(namespace, "converging orchestrator role binding");
                existing.role_ref = desired.role_ref.clone();
                existing.subjects = desired.subjects.clone();
                self.cluster.update_role_binding(namespace, &existing).await
            }
        }
    }
}

fn orchestrator_role_binding(namespace: &str) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(ROLE_BINDING_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: NAMESPACE_ROLE_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: SERVICE_ACCOUNT.to_string(),
            namespace: Some(ORCHESTRATOR_NAMESPACE.to_string()),
            ..Default::default()
        }]),
    }
}

fn role_binding_matches(existing: &RoleBinding, desired: &RoleBinding) -> bool {
    existing.role_ref == desired.role_ref && existing.subjects == desired.subjects
}
