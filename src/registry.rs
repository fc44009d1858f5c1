//! Durable store registry
//!
//! Concurrent-safe map from store id to record plus an ordering list that
//! preserves insertion order across restarts. Every mutation persists the
//! whole document; the file write happens inside the write-critical section
//! so API readers never observe a state the file does not (eventually)
//! reflect.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::naming::random_suffix;
use crate::store::{Store, StoreStatus};

const ID_SUFFIX_LEN: usize = 4;

/// On-disk document: `{"stores": {...}, "order": [...]}`
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    stores: HashMap<String, Store>,
    #[serde(default)]
    order: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    stores: HashMap<String, Store>,
    order: Vec<String>,
}

/// Durable key→record map with stable insertion order
#[derive(Debug)]
pub struct StoreRegistry {
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl StoreRegistry {
    /// Create a registry backed by the given file; call [`load`](Self::load)
    /// before serving traffic.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Read the persistence file, starting empty when it does not exist.
    ///
    /// Applies the sticky-flag reconciliation (any Ready record gets
    /// `was_ready`, and a missing `provisioned_at` is backfilled from
    /// `updated_at`), then reconciles the ordering list. The file is
    /// rewritten only if reconciliation changed the order.
    pub fn load(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let file: RegistryFile = serde_json::from_slice(&data)?;

        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.stores = file.stores;
        inner.order = file.order;

        for store in inner.stores.values_mut() {
            if store.status == StoreStatus::Ready {
                store.was_ready = true;
                if store.provisioned_at.is_none() {
                    store.provisioned_at = Some(store.updated_at);
                }
            }
        }

        if reconcile_order(&mut inner) {
            self.persist(&inner)?;
        }
        Ok(())
    }

    /// Insert a new record; fails with [`Error::Duplicate`] when the id is taken.
    pub fn add(&self, store: Store) -> Result<()> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.stores.contains_key(&store.id) {
            return Err(Error::Duplicate(store.id));
        }
        inner.order.push(store.id.clone());
        inner.stores.insert(store.id.clone(), store);
        self.persist(&inner)
    }

    /// Replace a record in place. Idempotent; a persistence failure is logged
    /// and the in-memory mutation is kept (the reconciler re-derives state
    /// from the cluster on its next tick).
    pub fn update(&self, store: Store) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.stores.insert(store.id.clone(), store);
        if let Err(e) = self.persist(&inner) {
            error!(error = %e, "failed to persist store update");
        }
    }

    /// Remove a record from the map and the order. Idempotent.
    pub fn remove(&self, id: &str) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.stores.remove(id);
        inner.order.retain(|entry| entry != id);
        if let Err(e) = self.persist(&inner) {
            error!(error = %e, "failed to persist store removal");
        }
    }

    /// Snapshot of a single record
    pub fn get(&self, id: &str) -> Option<Store> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.stores.get(id).cloned()
    }

    /// Snapshot of all records in insertion order.
    ///
    /// Records present in the map but missing from the order (possible after
    /// a hand-edited file) are appended, oldest first.
    pub fn list(&self) -> Vec<Store> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut items = Vec::with_capacity(inner.stores.len());
        let mut seen: HashSet<&str> = HashSet::with_capacity(inner.stores.len());
        for id in &inner.order {
            if let Some(store) = inner.stores.get(id) {
                if seen.insert(id.as_str()) {
                    items.push(store.clone());
                }
            }
        }
        if items.len() < inner.stores.len() {
            let mut missing: Vec<&Store> = inner
                .stores
                .values()
                .filter(|store| !seen.contains(store.id.as_str()))
                .collect();
            missing.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            items.extend(missing.into_iter().cloned());
        }
        items
    }

    /// Allocate a unique id from a base slug.
    ///
    /// Returns the bare base when free; otherwise appends random 4-character
    /// suffixes until one misses. The check runs under the read lock; the
    /// eventual [`add`](Self::add) is the authoritative uniqueness check, so
    /// a losing racer simply allocates again.
    pub fn ensure_unique_id(&self, base: &str) -> String {
        let base = base.to_lowercase();
        {
            let inner = self.inner.read().expect("registry lock poisoned");
            if !inner.stores.contains_key(&base) {
                return base;
            }
        }
        loop {
            let candidate = format!("{base}-{}", random_suffix(ID_SUFFIX_LEN));
            let inner = self.inner.read().expect("registry lock poisoned");
            if !inner.stores.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Pretty-print the document and atomically replace the file
    fn persist(&self, inner: &Inner) -> Result<()> {
        let file = RegistryFile {
            stores: inner.stores.clone(),
            order: inner.order.clone(),
        };
        let data = serde_json::to_string_pretty(&file)?;
        write_atomic(&self.path, data.as_bytes())
    }
}

/// Rewrite `path` through a temp file in the same directory so a torn
/// document is never observable.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| Error::persistence(format!("replace {}: {}", path.display(), e.error)))?;
    Ok(())
}

/// Bring the ordering list in line with the map: drop ids without records,
/// collapse duplicates to their first occurrence, and append records missing
/// from the order in `created_at` ascending (ties broken by id). Returns
/// whether the order changed.
fn reconcile_order(inner: &mut Inner) -> bool {
    let mut seen: HashSet<String> = HashSet::with_capacity(inner.stores.len());
    let mut next: Vec<String> = Vec::with_capacity(inner.stores.len());
    for id in &inner.order {
        if !inner.stores.contains_key(id) {
            continue;
        }
        if !seen.insert(id.clone()) {
            continue;
        }
        next.push(id.clone());
    }

    let mut missing: Vec<&Store> = inner
        .stores
        .values()
        .filter(|store| !seen.contains(&store.id))
        .collect();
    missing.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    next.extend(missing.into_iter().map(|store| store.id.clone()));

    if next != inner.order {
        if !inner.order.is_empty() || !next.is_empty() {
            warn!(
                before = inner.order.len(),
                after = next.len(),
                "store order reconciled at load"
            );
        }
        inner.order = next;
        true
    } else {
        false
    }
}
