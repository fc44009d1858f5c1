//! Store records and lifecycle states
//!
//! A store is the unit of tenancy: one record maps to one cluster namespace
//! into which the packaged application bundle is installed. Records are owned
//! by the [`crate::registry::StoreRegistry`] and mutated by the job runner and
//! the reconciler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix shared by every namespace the orchestrator manages.
pub const NAMESPACE_PREFIX: &str = "store-";

/// Release name prefix, kept in sync with the deployment driver.
pub const RELEASE_PREFIX: &str = "urumi";

const CHART_NAME: &str = "ecommerce-store";

/// Lifecycle state of a store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreStatus {
    /// Install in progress or readiness criteria not yet met
    Provisioning,
    /// Workload observed healthy
    Ready,
    /// Terminal install failure or broken cluster state
    Failed,
    /// Deletion requested; terminal except for removal from the registry
    Deleting,
}

/// Deployment flavor of a store.
///
/// The two kinds differ only in their readiness criteria and in whether
/// admin credentials are generated at admission time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreKind {
    /// Runs a one-shot setup job plus a `-primary` web deployment; admin
    /// credentials are generated for it
    #[default]
    A,
    /// Single `-secondary` deployment, no generated credentials
    B,
}

impl StoreKind {
    /// Parse a user-supplied kind, defaulting to [`StoreKind::A`] when empty.
    pub fn parse(input: &str) -> Option<StoreKind> {
        match input.trim().to_lowercase().as_str() {
            "" | "a" => Some(StoreKind::A),
            "b" => Some(StoreKind::B),
            _ => None,
        }
    }

    /// Whether admission should generate admin credentials for this kind
    pub fn requires_admin_credentials(&self) -> bool {
        matches!(self, StoreKind::A)
    }
}

/// The single persisted entity: one tenant store deployment
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Store {
    /// Unique short identifier, primary key
    pub id: String,
    /// Free-form human label
    pub name: String,
    /// Deployment flavor
    #[serde(default)]
    pub kind: StoreKind,
    /// Cluster namespace, always `"store-" + id`, immutable once set
    pub namespace: String,
    /// Lifecycle state
    pub status: StoreStatus,
    /// Externally reachable URLs
    pub urls: Vec<String>,
    /// Creation instant (UTC)
    pub created_at: DateTime<Utc>,
    /// Last mutation instant (UTC)
    pub updated_at: DateTime<Utc>,
    /// Sticky flag, set the first time the store becomes Ready
    #[serde(default, skip_serializing_if = "is_false")]
    pub was_ready: bool,
    /// First transition into Ready; written at most once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioned_at: Option<DateTime<Utc>>,
    /// Source address of the creator, used for per-source quotas
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    /// Monotonic provision attempt counter
    #[serde(default, skip_serializing_if = "is_zero")]
    pub provision_attempts: u32,
    /// Last observed human-readable failure reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl Store {
    /// Derive the namespace name for a store id
    pub fn namespace_for(id: &str) -> String {
        format!("{NAMESPACE_PREFIX}{id}")
    }

    /// Extract the store id from a managed namespace name, if it is one
    pub fn id_from_namespace(namespace: &str) -> Option<&str> {
        namespace.strip_prefix(NAMESPACE_PREFIX)
    }

    /// Release name handed to the deployment driver
    pub fn release_name(id: &str) -> String {
        format!("{RELEASE_PREFIX}-{id}")
    }

    /// Full resource-name prefix the chart stamps onto its workloads
    pub fn release_fullname(id: &str) -> String {
        format!("{}-{CHART_NAME}", Self::release_name(id))
    }

    /// Bump the mutation timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Transition into Ready, preserving the sticky flags.
    ///
    /// `was_ready` never goes back to false and `provisioned_at` is only
    /// written on the first transition.
    pub fn mark_ready(&mut self) {
        self.status = StoreStatus::Ready;
        self.error.clear();
        self.was_ready = true;
        if self.provisioned_at.is_none() {
            self.provisioned_at = Some(Utc::now());
        }
        self.touch();
    }

    /// Transition into Failed with the given reason
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = StoreStatus::Failed;
        self.error = reason.into();
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store(id: &str) -> Store {
        let now = Utc::now();
        Store {
            id: id.to_string(),
            name: id.to_string(),
            kind: StoreKind::A,
            namespace: Store::namespace_for(id),
            status: StoreStatus::Provisioning,
            urls: vec![format!("http://{id}.127.0.0.1.nip.io")],
            created_at: now,
            updated_at: now,
            was_ready: false,
            provisioned_at: None,
            created_by: String::new(),
            provision_attempts: 0,
            error: String::new(),
        }
    }

    #[test]
    fn namespace_is_derived_from_id() {
        assert_eq!(Store::namespace_for("my-shop"), "store-my-shop");
        assert_eq!(Store::id_from_namespace("store-my-shop"), Some("my-shop"));
        assert_eq!(Store::id_from_namespace("kube-system"), None);
    }

    #[test]
    fn release_naming_matches_the_chart() {
        assert_eq!(Store::release_name("my-shop"), "urumi-my-shop");
        assert_eq!(
            Store::release_fullname("my-shop"),
            "urumi-my-shop-ecommerce-store"
        );
    }

    #[test]
    fn kind_parse_defaults_to_a_and_rejects_unknown() {
        assert_eq!(StoreKind::parse(""), Some(StoreKind::A));
        assert_eq!(StoreKind::parse("  A "), Some(StoreKind::A));
        assert_eq!(StoreKind::parse("b"), Some(StoreKind::B));
        assert_eq!(StoreKind::parse("c"), None);
    }

    #[test]
    fn only_kind_a_needs_credentials() {
        assert!(StoreKind::A.requires_admin_credentials());
        assert!(!StoreKind::B.requires_admin_credentials());
    }

    #[test]
    fn mark_ready_sets_sticky_fields_once() {
        let mut store = sample_store("shop");
        store.mark_ready();
        assert_eq!(store.status, StoreStatus::Ready);
        assert!(store.was_ready);
        let first = store.provisioned_at.expect("provisioned_at set");

        store.mark_failed("broke");
        assert!(store.was_ready, "was_ready is sticky");

        store.mark_ready();
        assert_eq!(store.provisioned_at, Some(first), "provisioned_at written once");
    }

    #[test]
    fn mark_failed_records_the_reason() {
        let mut store = sample_store("shop");
        store.mark_failed("helm install: timed out");
        assert_eq!(store.status, StoreStatus::Failed);
        assert_eq!(store.error, "helm install: timed out");
    }

    #[test]
    fn wire_format_uses_camel_case_and_omits_empty_fields() {
        let store = sample_store("shop");
        let json = serde_json::to_value(&store).unwrap();
        assert_eq!(json["kind"], "A");
        assert_eq!(json["status"], "Provisioning");
        assert_eq!(json["namespace"], "store-shop");
        assert!(json.get("wasReady").is_none());
        assert!(json.get("provisionedAt").is_none());
        assert!(json.get("error").is_none());
        assert!(json.get("createdAt").is_some());
    }

    #[test]
    fn wire_format_round_trips() {
        let mut store = sample_store("shop");
        store.mark_ready();
        store.created_by = "10.0.0.1".to_string();
        store.provision_attempts = 2;
        let json = serde_json::to_string(&store).unwrap();
        let back: Store = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, store.id);
        assert_eq!(back.status, StoreStatus::Ready);
        assert!(back.was_ready);
        assert_eq!(back.provision_attempts, 2);
        assert_eq!(back.created_by, "10.0.0.1");
    }
}
