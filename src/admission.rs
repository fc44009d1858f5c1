//! Request admission: validation, quotas, rate limiting

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::naming::slugify;
use crate::store::{Store, StoreKind, StoreStatus};

/// Body of `POST /api/stores`
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CreateStoreRequest {
    /// Human label; also the slug source for the store id
    #[serde(default)]
    pub name: String,
    /// Deployment flavor, defaults to A
    #[serde(default)]
    pub kind: String,
    /// Optional host label; defaults to the store id
    #[serde(default)]
    pub subdomain: String,
}

/// Validated admission output
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdmittedRequest {
    /// Trimmed display name
    pub name: String,
    /// Parsed deployment flavor
    pub kind: StoreKind,
    /// Slug the id is allocated from
    pub slug: String,
    /// Subdomain slug, empty when the caller left it out
    pub subdomain: String,
}

/// Apply the admission rules to a create request.
pub fn validate(request: &CreateStoreRequest) -> Result<AdmittedRequest> {
    let kind = StoreKind::parse(&request.kind)
        .ok_or_else(|| Error::validation("kind must be A or B"))?;

    let name = request.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::validation("name is required"));
    }
    let slug = slugify(&name);
    if slug.is_empty() {
        return Err(Error::validation(
            "name must contain alphanumeric characters",
        ));
    }

    Ok(AdmittedRequest {
        name,
        kind,
        slug,
        subdomain: slugify(&request.subdomain),
    })
}

/// Check the global and per-source quotas over a registry snapshot.
///
/// Deleting records are already on their way out and do not count. A limit
/// of zero disables that check.
pub fn check_quota(
    stores: &[Store],
    source: &str,
    max_total: usize,
    max_per_source: usize,
) -> Result<()> {
    let mut total = 0;
    let mut per_source = 0;
    for store in stores {
        if store.status == StoreStatus::Deleting {
            continue;
        }
        total += 1;
        if !source.is_empty() && store.created_by == source {
            per_source += 1;
        }
    }
    if max_total > 0 && total >= max_total {
        return Err(Error::QuotaExceeded);
    }
    if max_per_source > 0 && per_source >= max_per_source {
        return Err(Error::QuotaExceeded);
    }
    Ok(())
}

#[derive(Clone, Copy, Debug)]
struct RateBucket {
    count: u32,
    reset_at: Instant,
}

/// Sliding-window request limiter keyed by source address.
///
/// Buckets are replaced wholesale when their window rolls over; state is
/// in-memory only and resets on restart.
#[derive(Debug)]
pub struct RateLimiter {
    max: u32,
    window: Duration,
    buckets: DashMap<String, RateBucket>,
}

impl RateLimiter {
    /// Create a limiter allowing `max` requests per `window` per source
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            buckets: DashMap::new(),
        }
    }

    /// Record one request from `source`; returns whether it is allowed.
    pub fn allow(&self, source: &str) -> bool {
        if self.max == 0 || self.window.is_zero() {
            return true;
        }
        let source = if source.is_empty() { "unknown" } else { source };
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(source.to_string())
            .or_insert(RateBucket {
                count: 0,
                reset_at: now + self.window,
            });
        if now > bucket.reset_at {
            *bucket = RateBucket {
                count: 0,
                reset_at: now + self.window,
            };
        }
        if bucket.count >= self.max {
            return false;
        }
        bucket.count += 1;
        true
    }
}
