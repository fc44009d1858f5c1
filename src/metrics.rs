//! Fleet metrics served by the API

use serde::Serialize;

use crate::store::{Store, StoreStatus};

/// Aggregate counters plus provisioning latency percentiles
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    /// All records
    pub total_stores: usize,
    /// Records currently Ready
    pub ready_stores: usize,
    /// Records still converging (Provisioning or Deleting)
    pub provisioning_stores: usize,
    /// Records in terminal failure
    pub failed_stores: usize,
    /// Latency from creation to first Ready, in seconds
    pub provisioning_seconds: ProvisioningSeconds,
}

/// Provisioning latency summary
#[derive(Clone, Debug, Serialize)]
pub struct ProvisioningSeconds {
    /// Arithmetic mean
    pub avg: f64,
    /// 95th percentile (nearest-rank)
    pub p95: f64,
}

/// Compute metrics over a registry snapshot.
pub fn compute(stores: &[Store]) -> Metrics {
    let mut ready = 0;
    let mut failed = 0;
    let mut provisioning = 0;
    let mut durations = Vec::new();

    for store in stores {
        match store.status {
            StoreStatus::Ready => ready += 1,
            StoreStatus::Failed => failed += 1,
            _ => provisioning += 1,
        }
        if let Some(provisioned_at) = store.provisioned_at {
            let seconds = (provisioned_at - store.created_at).num_milliseconds() as f64 / 1000.0;
            if seconds >= 0.0 {
                durations.push(seconds);
            }
        }
    }

    durations.sort_by(|a, b| a.partial_cmp(b).expect("durations are finite"));
    let avg = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };

    Metrics {
        total_stores: stores.len(),
        ready_stores: ready,
        provisioning_stores: provisioning,
        failed_stores: failed,
        provisioning_seconds: ProvisioningSeconds {
            avg,
            p95: percentile95(&durations),
        },
    }
}

/// Nearest-rank p95: the value at index `ceil(0.95 * n) - 1`, clamped to the
/// sorted slice. Empty input yields 0.
fn percentile95(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (0.95 * sorted.len() as f64).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[index]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreKind;
    use chrono::{Duration as ChronoDuration, Utc};

    fn store_with(status: StoreStatus, provision_seconds: Option<i64>) -> Store {
        let created = Utc::now() - ChronoDuration::hours(1);
        Store {
            id: "s".to_string(),
            name: "s".to_string(),
            kind: StoreKind::A,
            namespace: "store-s".to_string(),
            status,
            urls: vec![],
            created_at: created,
            updated_at: created,
            was_ready: false,
            provisioned_at: provision_seconds.map(|s| created + ChronoDuration::seconds(s)),
            created_by: String::new(),
            provision_attempts: 0,
            error: String::new(),
        }
    }

    #[test]
    fn counters_split_by_status() {
        let stores = vec![
            store_with(StoreStatus::Ready, Some(30)),
            store_with(StoreStatus::Failed, None),
            store_with(StoreStatus::Provisioning, None),
            store_with(StoreStatus::Deleting, None),
        ];
        let metrics = compute(&stores);
        assert_eq!(metrics.total_stores, 4);
        assert_eq!(metrics.ready_stores, 1);
        assert_eq!(metrics.failed_stores, 1);
        assert_eq!(metrics.provisioning_stores, 2, "deleting counts as converging");
    }

    #[test]
    fn empty_fleet_reports_zeroes() {
        let metrics = compute(&[]);
        assert_eq!(metrics.total_stores, 0);
        assert_eq!(metrics.provisioning_seconds.avg, 0.0);
        assert_eq!(metrics.provisioning_seconds.p95, 0.0);
    }

    #[test]
    fn single_sample_is_its_own_p95() {
        let stores = vec![store_with(StoreStatus::Ready, Some(42))];
        let metrics = compute(&stores);
        assert_eq!(metrics.provisioning_seconds.p95, 42.0);
        assert_eq!(metrics.provisioning_seconds.avg, 42.0);
    }

    #[test]
    fn p95_uses_nearest_rank_on_larger_samples() {
        // 20 samples: ceil(0.95 * 20) - 1 = 18 → the 19th value.
        let stores: Vec<Store> = (1..=20)
            .map(|i| store_with(StoreStatus::Ready, Some(i)))
            .collect();
        let metrics = compute(&stores);
        assert_eq!(metrics.provisioning_seconds.p95, 19.0);
    }

    #[test]
    fn negative_deltas_are_excluded() {
        let stores = vec![store_with(StoreStatus::Ready, Some(-5))];
        let metrics = compute(&stores);
        assert_eq!(metrics.provisioning_seconds.avg, 0.0);
        assert_eq!(metrics.provisioning_seconds.p95, 0.0);
    }

    #[test]
    fn wire_format_is_camel_case() {
        let json = serde_json::to_value(compute(&[])).unwrap();
        assert!(json.get("totalStores").is_some());
        assert!(json.get("provisioningSeconds").is_some());
        assert!(json["provisioningSeconds"].get("p95").is_some());
    }
}
