//! Readiness evaluation
//!
//! Maps (store kind, cluster observations) to a lifecycle state and message.
//! The decision itself is a pure function over [`Observations`] so every
//! branch is unit-testable without a cluster; [`observe`] gathers the inputs
//! through the [`ClusterProbe`].

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;

use crate::cluster::{namespace_is_terminating, ClusterProbe};
use crate::error::Result;
use crate::store::{Store, StoreKind, StoreStatus};

/// What the cluster reported about a store's namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamespaceState {
    /// Namespace does not exist
    Absent,
    /// Namespace exists but is being torn down
    Terminating,
    /// Namespace exists and is usable
    Active,
}

/// Setup-job counters, present only when the job object exists
#[derive(Clone, Copy, Debug, Default)]
pub struct JobObservation {
    /// Completed pods
    pub succeeded: i32,
    /// Failed pods
    pub failed: i32,
}

/// Workload deployment state, present only when the deployment exists
#[derive(Clone, Copy, Debug, Default)]
pub struct DeploymentObservation {
    /// Replicas passing their readiness checks
    pub ready_replicas: i32,
}

/// Everything the evaluator needs to know about one store
#[derive(Clone, Copy, Debug)]
pub struct Observations {
    /// Namespace tri-state
    pub namespace: NamespaceState,
    /// Setup job, kind A only
    pub job: Option<JobObservation>,
    /// Web deployment (`-primary` for kind A, `-secondary` for kind B)
    pub deployment: Option<DeploymentObservation>,
}

impl Observations {
    fn namespace_only(namespace: NamespaceState) -> Self {
        Self {
            namespace,
            job: None,
            deployment: None,
        }
    }
}

/// Decide the lifecycle state for a store from cluster observations.
pub fn evaluate(kind: StoreKind, obs: &Observations) -> (StoreStatus, String) {
    match obs.namespace {
        NamespaceState::Absent => {
            return (StoreStatus::Failed, "namespace not found".to_string());
        }
        NamespaceState::Terminating => {
            return (StoreStatus::Failed, "namespace terminating".to_string());
        }
        NamespaceState::Active => {}
    }

    match kind {
        StoreKind::B => match obs.deployment {
            Some(deployment) if deployment.ready_replicas >= 1 => {
                (StoreStatus::Ready, String::new())
            }
            _ => (StoreStatus::Provisioning, String::new()),
        },
        StoreKind::A => {
            if let Some(job) = obs.job {
                if job.failed > 0 && job.succeeded == 0 {
                    return (StoreStatus::Failed, "setup job failed".to_string());
                }
                if job.succeeded == 0 {
                    return (StoreStatus::Provisioning, String::new());
                }
            }
            match obs.deployment {
                Some(deployment) if deployment.ready_replicas >= 1 => {
                    (StoreStatus::Ready, String::new())
                }
                _ => (StoreStatus::Provisioning, String::new()),
            }
        }
    }
}

/// Gather the observations [`evaluate`] needs for one store.
///
/// Only the objects relevant to the store's kind are fetched; lookups stop
/// as soon as the namespace rules out a healthy outcome.
pub async fn observe(probe: &ClusterProbe, store: &Store) -> Result<Observations> {
    let Some(namespace) = probe.get_namespace(&store.namespace).await? else {
        return Ok(Observations::namespace_only(NamespaceState::Absent));
    };
    if namespace_is_terminating(&namespace) {
        return Ok(Observations::namespace_only(NamespaceState::Terminating));
    }

    let fullname = Store::release_fullname(&store.id);
    let mut obs = Observations::namespace_only(NamespaceState::Active);
    match store.kind {
        StoreKind::B => {
            let name = format!("{fullname}-secondary");
            obs.deployment = probe
                .get_deployment(&store.namespace, &name)
                .await?
                .map(|deployment| deployment_observation(&deployment));
        }
        StoreKind::A => {
            let job_name = format!("{fullname}-job");
            obs.job = probe
                .get_job(&store.namespace, &job_name)
                .await?
                .map(|job| job_observation(&job));
            let deploy_name = format!("{fullname}-primary");
            obs.deployment = probe
                .get_deployment(&store.namespace, &deploy_name)
                .await?
                .map(|deployment| deployment_observation(&deployment));
        }
    }
    Ok(obs)
}

/// Convenience wrapper: observe then evaluate.
pub async fn evaluate_store(probe: &ClusterProbe, store: &Store) -> Result<(StoreStatus, String)> {
    let obs = observe(probe, store).await?;
    Ok(evaluate(store.kind, &obs))
}

fn deployment_observation(deployment: &Deployment) -> DeploymentObservation {
    DeploymentObservation {
        ready_replicas: deployment
            .status
            .as_ref()
            .and_then(|status| status.ready_replicas)
            .unwrap_or(0),
    }
}

fn job_observation(job: &Job) -> JobObservation {
    let status = job.status.as_ref();
    JobObservation {
        succeeded: status.and_then(|status| status.succeeded).unwrap_or(0),
        failed: status.and_then(|status| status.failed).unwrap_or(0),
    }
}
