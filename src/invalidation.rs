//! Post-mutation cache busting
//!
//! Exact deletes over the key-spaces registered for an entity type are the
//! authoritative part of an invalidation. The wildcard sweep that follows is
//! best-effort: it may miss keys written concurrently and may over-match.
//! Neither touches the memo of requests already in flight.

use crate::cache::{CacheKey, SharedCacheStore, KEY_PREFIX};
use crate::loaders::{ENTITY_CATALOG, RELATION_CATALOG};
use crate::observability::{CacheEvent, SharedCacheEventSink};
use std::collections::BTreeMap;
use tracing::debug;

/// What an entity invalidation removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Keys removed by exact delete
    pub exact: usize,
    /// Keys removed by the wildcard sweep
    pub swept: usize,
}

/// Removes shared-cache entries after writes
#[derive(Clone)]
pub struct CacheInvalidator {
    store: SharedCacheStore,
    sink: SharedCacheEventSink,
    index: BTreeMap<String, Vec<(String, String)>>,
}

impl CacheInvalidator {
    /// Invalidator with an empty entity index
    pub fn new(store: SharedCacheStore, sink: SharedCacheEventSink) -> Self {
        Self {
            store,
            sink,
            index: BTreeMap::new(),
        }
    }

    /// Invalidator indexing every entity and relation key-space of the catalog
    pub fn with_catalog(store: SharedCacheStore, sink: SharedCacheEventSink) -> Self {
        let mut invalidator = Self::new(store, sink);
        for entry in ENTITY_CATALOG.iter().chain(RELATION_CATALOG) {
            invalidator.register(entry.entity_type, entry.service, entry.keyspace);
        }
        invalidator
    }

    /// Associate a key-space with an entity type
    pub fn register(&mut self, entity_type: &str, service: &str, keyspace: &str) {
        let spaces = self.index.entry(entity_type.to_string()).or_default();
        let space = (service.to_string(), keyspace.to_string());
        if !spaces.contains(&space) {
            spaces.push(space);
        }
    }

    /// Key-spaces registered for `entity_type`
    pub fn keyspaces(&self, entity_type: &str) -> &[(String, String)] {
        self.index
            .get(entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Remove one composite key. Returns whether it existed.
    pub async fn invalidate(&self, service: &str, keyspace: &str, id: &str) -> bool {
        let key = CacheKey::new(service, keyspace, id).to_string();
        match self.store.delete(&key).await {
            Ok(removed) => {
                debug!(key = %key, removed, "Cache entry invalidated");
                removed
            }
            Err(e) => {
                self.sink.record(CacheEvent::InvalidationFailed {
                    target: key,
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Remove every entry derived from one entity
    pub async fn invalidate_entity(&self, entity_type: &str, id: &str) -> InvalidationReport {
        let mut report = InvalidationReport::default();

        let exact = self
            .keyspaces(entity_type)
            .iter()
            .map(|(service, keyspace)| self.invalidate(service, keyspace, id));
        report.exact = futures::future::join_all(exact)
            .await
            .into_iter()
            .filter(|removed| *removed)
            .count();

        for pattern in sweep_patterns(entity_type, id) {
            match self.store.scan_delete(&pattern).await {
                Ok(removed) => report.swept += removed,
                Err(e) => self.sink.record(CacheEvent::InvalidationFailed {
                    target: pattern,
                    error: e.to_string(),
                }),
            }
        }

        debug!(
            entity_type = %entity_type,
            id = %id,
            exact = report.exact,
            swept = report.swept,
            "Entity cache invalidated"
        );
        report
    }

    /// Run [`invalidate_entity`](Self::invalidate_entity) in the background
    pub fn spawn_invalidate_entity(
        &self,
        entity_type: impl Into<String>,
        id: impl Into<String>,
    ) -> tokio::task::JoinHandle<InvalidationReport> {
        let invalidator = self.clone();
        let entity_type = entity_type.into();
        let id = id.into();
        tokio::spawn(async move { invalidator.invalidate_entity(&entity_type, &id).await })
    }
}

impl std::fmt::Debug for CacheInvalidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheInvalidator")
            .field("entity_types", &self.index.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Wildcard patterns for entries mentioning an entity: key-spaces whose name
/// contains the type, keys with the id in a middle segment, and key-spaces of
/// a service named after the type.
fn sweep_patterns(entity_type: &str, id: &str) -> [String; 3] {
    let id = escape_glob(id);
    [
        format!("{}:*:*{}*:{}", KEY_PREFIX, entity_type, id),
        format!("{}:*:*:{}:*", KEY_PREFIX, id),
        format!("{}:{}:*:{}", KEY_PREFIX, entity_type, id),
    ]
}

fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
