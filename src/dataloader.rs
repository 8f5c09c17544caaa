//! Request-scoped batching loaders with a shared cache-aside tier
//!
//! One [`EntityLoader`] serves one key-space (e.g. `crm.contacts`) for the
//! duration of one gateway request. Lookups issued within the batch window
//! are coalesced by async-graphql's [`DataLoader`]; each dispatched batch
//! first consults the shared cache in one multi-get, then sends exactly the
//! missing ids to the backend in one call, and writes fetched entities back to
//! the cache in the background.
//!
//! Every key resolves to a value. Ids the backend does not return, and every
//! id of a batch whose backend call failed, resolve to `None`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use erp_gateway::{EntityLoader, KeySpace, LoaderOptions, MemoryCacheStore, TracingSink};
//! use std::sync::Arc;
//!
//! # async fn example(client: erp_gateway::SharedClient) {
//! let contacts = EntityLoader::new(
//!     KeySpace::entity("crm", "contacts"),
//!     client,
//!     Arc::new(MemoryCacheStore::default()),
//!     Arc::new(TracingSink),
//!     LoaderOptions::default(),
//! );
//!
//! // Both lookups join the same batch; "c1" is fetched once
//! let (a, b) = tokio::join!(contacts.load("c1"), contacts.load_many(["c2", "c1"]));
//! # }
//! ```

use crate::cache::{CacheKey, SharedCacheStore};
use crate::client::SharedClient;
use crate::config::{CacheSettings, LoaderSettings};
use crate::error::Result;
use crate::metrics::GatewayMetrics;
use crate::observability::{CacheEvent, SharedCacheEventSink};
use async_graphql::dataloader::{DataLoader, Loader};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A resolved entity; duplicates of one key share the same allocation
pub type Entity = Arc<serde_json::Value>;

/// A named collection of entities addressable by one id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeySpace {
    /// Logical backend service (`crm`)
    pub service: String,
    /// Collection name, also the cache key segment (`contacts`)
    pub name: String,
    /// Remote batch method (`GetContactsByIds`)
    pub method: String,
    /// Request field carrying the ids
    pub request_field: String,
    /// Item field holding the id
    pub id_field: String,
}

impl KeySpace {
    pub fn new(
        service: impl Into<String>,
        name: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
            method: method.into(),
            request_field: "ids".to_string(),
            id_field: "id".to_string(),
        }
    }

    /// Key-space served by `Get{Collection}ByIds`
    pub fn entity(service: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let method = format!("Get{}ByIds", upper_first(&name));
        Self::new(service, name, method)
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn cache_key(&self, id: &str) -> CacheKey {
        CacheKey::new(&self.service, &self.name, id)
    }
}

impl fmt::Display for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.name)
    }
}

fn upper_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Batching and caching parameters shared by the loaders of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    pub max_batch_size: usize,
    /// Batch window: loads issued within it share one dispatch
    pub batch_delay: Duration,
    /// TTL of shared cache entries
    pub ttl: Duration,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            batch_delay: Duration::from_millis(1),
            ttl: Duration::from_secs(60),
        }
    }
}

impl LoaderOptions {
    pub fn from_settings(loader: &LoaderSettings, cache: &CacheSettings) -> Self {
        Self {
            max_batch_size: loader.max_batch_size,
            batch_delay: loader.batch_delay(),
            ttl: cache.ttl(),
        }
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }
}

/// Render an id-like JSON value as a key
pub fn id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First array found under one of `fields` in a backend response
pub(crate) fn response_items<'a>(
    response: &'a serde_json::Value,
    fields: &[&str],
) -> &'a [serde_json::Value] {
    fields
        .iter()
        .find_map(|field| response.get(*field).and_then(|v| v.as_array()))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Cache-aside access for one key-space
#[derive(Clone)]
pub(crate) struct CacheAside {
    service: String,
    keyspace: String,
    label: String,
    store: SharedCacheStore,
    sink: SharedCacheEventSink,
    ttl: Duration,
}

impl CacheAside {
    pub(crate) fn new(
        service: &str,
        keyspace: &str,
        store: SharedCacheStore,
        sink: SharedCacheEventSink,
        ttl: Duration,
    ) -> Self {
        Self {
            service: service.to_string(),
            keyspace: keyspace.to_string(),
            label: format!("{}.{}", service, keyspace),
            store,
            sink,
            ttl,
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn sink(&self) -> &SharedCacheEventSink {
        &self.sink
    }

    pub(crate) fn key(&self, id: &str) -> String {
        CacheKey::new(&self.service, &self.keyspace, id).to_string()
    }

    /// Split `ids` into cached values and misses with one multi-get.
    ///
    /// A failed read, or an entry that does not parse, counts as a miss.
    pub(crate) async fn read(
        &self,
        ids: &[String],
    ) -> (HashMap<String, serde_json::Value>, Vec<String>) {
        let keys: Vec<String> = ids.iter().map(|id| self.key(id)).collect();

        let raw = match self.store.multi_get(&keys).await {
            Ok(values) if values.len() == ids.len() => values,
            Ok(values) => {
                self.sink.record(CacheEvent::ReadFailed {
                    keyspace: self.label.clone(),
                    error: format!("expected {} values, got {}", ids.len(), values.len()),
                });
                vec![None; ids.len()]
            }
            Err(e) => {
                self.sink.record(CacheEvent::ReadFailed {
                    keyspace: self.label.clone(),
                    error: e.to_string(),
                });
                vec![None; ids.len()]
            }
        };

        let mut hits = HashMap::new();
        let mut misses = Vec::new();
        for (id, cached) in ids.iter().zip(raw) {
            match cached.map(|s| serde_json::from_str::<serde_json::Value>(&s)) {
                Some(Ok(value)) => {
                    hits.insert(id.clone(), value);
                }
                Some(Err(e)) => {
                    debug!(
                        keyspace = %self.label,
                        id = %id,
                        error = %e,
                        "Discarding unreadable cache entry"
                    );
                    misses.push(id.clone());
                }
                None => misses.push(id.clone()),
            }
        }

        GatewayMetrics::global().record_cache_lookups(&self.label, hits.len(), misses.len());
        debug!(keyspace = %self.label, hits = hits.len(), misses = misses.len(), "Cache lookup");
        (hits, misses)
    }

    /// Write entries in the background; failures go to the sink
    pub(crate) fn write_back(&self, entries: Vec<(String, serde_json::Value)>) {
        if entries.is_empty() {
            return;
        }

        let payloads: Vec<(String, String)> = entries
            .into_iter()
            .filter_map(|(id, value)| {
                let key = self.key(&id);
                match serde_json::to_string(&value) {
                    Ok(payload) => Some((key, payload)),
                    Err(e) => {
                        self.sink.record(CacheEvent::WriteFailed {
                            key,
                            error: e.to_string(),
                        });
                        None
                    }
                }
            })
            .collect();

        let store = self.store.clone();
        let sink = self.sink.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            let writes = payloads.into_iter().map(|(key, payload)| {
                let store = store.clone();
                let sink = sink.clone();
                async move {
                    if let Err(e) = store.set_with_ttl(&key, &payload, ttl).await {
                        sink.record(CacheEvent::WriteFailed {
                            key,
                            error: e.to_string(),
                        });
                    }
                }
            });
            futures::future::join_all(writes).await;
        });
    }
}

type MemoFuture<V> = Shared<BoxFuture<'static, Option<V>>>;

/// A [`DataLoader`] plus a per-request memo of in-flight and settled keys.
///
/// The memo holds the shared future of each key, so a key requested while its
/// batch is still running joins that batch instead of starting another.
pub(crate) struct Batched<B>
where
    B: Loader<String, Error = Infallible>,
{
    loader: Arc<DataLoader<B>>,
    memo: Arc<Mutex<HashMap<String, MemoFuture<B::Value>>>>,
}

impl<B> Clone for Batched<B>
where
    B: Loader<String, Error = Infallible>,
{
    fn clone(&self) -> Self {
        Self {
            loader: Arc::clone(&self.loader),
            memo: Arc::clone(&self.memo),
        }
    }
}

impl<B> Batched<B>
where
    B: Loader<String, Error = Infallible>,
{
    pub(crate) fn new(batcher: B, max_batch_size: usize, batch_delay: Duration) -> Self {
        let loader = DataLoader::new(batcher, tokio::spawn)
            .delay(batch_delay)
            .max_batch_size(max_batch_size.max(1));
        Self {
            loader: Arc::new(loader),
            memo: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn get(&self, key: String) -> MemoFuture<B::Value> {
        let mut memo = self.memo.lock();
        memo.entry(key.clone())
            .or_insert_with(|| {
                let loader = Arc::clone(&self.loader);
                async move {
                    match loader.load_one(key).await {
                        Ok(value) => value,
                        Err(never) => match never {},
                    }
                }
                .boxed()
                .shared()
            })
            .clone()
    }

    /// Seed the memo; an existing entry is kept. Returns whether it was seeded.
    pub(crate) fn prime(&self, key: String, value: B::Value) -> bool {
        let mut memo = self.memo.lock();
        if memo.contains_key(&key) {
            return false;
        }
        memo.insert(key, futures::future::ready(Some(value)).boxed().shared());
        true
    }

    pub(crate) fn memo_len(&self) -> usize {
        self.memo.lock().len()
    }
}

/// Batch function for one entity key-space
pub(crate) struct EntityBatcher {
    keyspace: Arc<KeySpace>,
    client: SharedClient,
    cache: CacheAside,
}

impl EntityBatcher {
    async fn fetch(&self, ids: &[String]) -> Result<HashMap<String, serde_json::Value>> {
        let mut request = serde_json::Map::new();
        request.insert(self.keyspace.request_field.clone(), serde_json::json!(ids));

        let response = self
            .client
            .call(&self.keyspace.method, serde_json::Value::Object(request))
            .await?;

        let mut found = HashMap::new();
        for item in response_items(&response, &["items", "data"]) {
            if let Some(id) = item.get(&self.keyspace.id_field).and_then(id_string) {
                found.entry(id).or_insert_with(|| item.clone());
            }
        }
        Ok(found)
    }
}

#[async_trait::async_trait]
impl Loader<String> for EntityBatcher {
    type Value = Option<Entity>;
    type Error = Infallible;

    async fn load(
        &self,
        keys: &[String],
    ) -> std::result::Result<HashMap<String, Self::Value>, Self::Error> {
        let (hits, misses) = self.cache.read(keys).await;
        let mut resolved: HashMap<String, Self::Value> = hits
            .into_iter()
            .map(|(id, value)| (id, Some(Arc::new(value))))
            .collect();

        if misses.is_empty() {
            return Ok(resolved);
        }

        GatewayMetrics::global().record_batch(self.cache.label(), misses.len());
        debug!(keyspace = %self.keyspace, keys = misses.len(), "Dispatching batch");

        match self.fetch(&misses).await {
            Ok(mut found) => {
                let mut fresh = Vec::new();
                for id in misses {
                    let entity = found.remove(&id);
                    if let Some(value) = &entity {
                        fresh.push((id.clone(), value.clone()));
                    }
                    resolved.insert(id, entity.map(Arc::new));
                }
                self.cache.write_back(fresh);
                Ok(resolved)
            }
            Err(e) => {
                self.cache.sink().record(CacheEvent::BatchFailed {
                    keyspace: self.cache.label().to_string(),
                    keys: keys.len(),
                    error: e.to_string(),
                });
                Ok(keys.iter().map(|id| (id.clone(), None)).collect())
            }
        }
    }
}

/// Request-scoped loader for one entity key-space
#[derive(Clone)]
pub struct EntityLoader {
    keyspace: Arc<KeySpace>,
    batched: Batched<EntityBatcher>,
    cache: CacheAside,
}

impl EntityLoader {
    pub fn new(
        keyspace: KeySpace,
        client: SharedClient,
        store: SharedCacheStore,
        sink: SharedCacheEventSink,
        options: LoaderOptions,
    ) -> Self {
        let keyspace = Arc::new(keyspace);
        let cache = CacheAside::new(&keyspace.service, &keyspace.name, store, sink, options.ttl);
        let batcher = EntityBatcher {
            keyspace: Arc::clone(&keyspace),
            client,
            cache: cache.clone(),
        };

        Self {
            keyspace,
            batched: Batched::new(batcher, options.max_batch_size, options.batch_delay),
            cache,
        }
    }

    pub fn keyspace(&self) -> &KeySpace {
        &self.keyspace
    }

    /// Load one entity; `None` when absent or when its batch failed
    pub async fn load(&self, id: impl Into<String>) -> Option<Entity> {
        self.batched.get(id.into()).await.flatten()
    }

    /// Load several entities; results follow the input order, duplicates included
    pub async fn load_many<I, K>(&self, ids: I) -> Vec<Option<Entity>>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let pending: Vec<_> = ids
            .into_iter()
            .map(|id| self.batched.get(id.into()))
            .collect();
        futures::future::join_all(pending)
            .await
            .into_iter()
            .map(Option::flatten)
            .collect()
    }

    /// Seed this request's memo and the shared cache with a known entity.
    ///
    /// The shared cache is always written; the memo keeps a value already
    /// requested in this request.
    pub fn prime(&self, id: impl Into<String>, value: serde_json::Value) {
        let id = id.into();
        self.batched.prime(id.clone(), Some(Arc::new(value.clone())));
        self.cache.write_back(vec![(id, value)]);
    }

    /// Distinct keys requested or primed so far
    pub fn memoized_keys(&self) -> usize {
        self.batched.memo_len()
    }
}

impl fmt::Debug for EntityLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityLoader")
            .field("keyspace", &self.keyspace.to_string())
            .field("memoized", &self.memoized_keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, MemoryCacheStore};
    use crate::circuit_breaker::CircuitState;
    use crate::client::BackendClient;
    use crate::error::Error;
    use crate::observability::CacheEventSink;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeCrm {
        calls: AtomicUsize,
        requests: Mutex<Vec<serde_json::Value>>,
        fail: bool,
    }

    #[async_trait]
    impl BackendClient for FakeCrm {
        fn service(&self) -> &str {
            "crm"
        }

        async fn call(
            &self,
            _method: &str,
            request: serde_json::Value,
        ) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request.clone());
            if self.fail {
                return Err(Error::Grpc(tonic::Status::invalid_argument("rejected")));
            }
            let items: Vec<_> = request["ids"]
                .as_array()
                .into_iter()
                .flatten()
                .filter(|id| id.as_str() != Some("missing"))
                .map(|id| {
                    let name = format!("contact {}", id.as_str().unwrap_or(""));
                    json!({"id": id, "name": name})
                })
                .collect();
            Ok(json!({ "items": items }))
        }

        fn circuit_state(&self) -> Option<CircuitState> {
            Some(CircuitState::Closed)
        }

        async fn close(&self) {}
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<CacheEvent>>);

    impl CacheEventSink for RecordingSink {
        fn record(&self, event: CacheEvent) {
            self.0.lock().push(event);
        }
    }

    fn loader_with(
        client: Arc<FakeCrm>,
        store: Arc<MemoryCacheStore>,
        sink: Arc<RecordingSink>,
    ) -> EntityLoader {
        EntityLoader::new(
            KeySpace::entity("crm", "contacts"),
            client,
            store,
            sink,
            LoaderOptions::default(),
        )
    }

    #[test]
    fn test_entity_keyspace_naming() {
        let ks = KeySpace::entity("finance", "invoiceLineItems");
        assert_eq!(ks.method, "GetInvoiceLineItemsByIds");
        assert_eq!(ks.to_string(), "finance.invoiceLineItems");
        assert_eq!(ks.cache_key("li-1").to_string(), "dl:finance:invoiceLineItems:li-1");
    }

    #[test]
    fn test_id_string() {
        assert_eq!(id_string(&json!("c1")), Some("c1".to_string()));
        assert_eq!(id_string(&json!(42)), Some("42".to_string()));
        assert_eq!(id_string(&json!("")), None);
        assert_eq!(id_string(&json!(null)), None);
    }

    #[test]
    fn test_response_items_falls_back_to_data() {
        let response = json!({"data": [{"id": "a"}]});
        assert_eq!(response_items(&response, &["items", "data"]).len(), 1);
        assert!(response_items(&json!({}), &["items", "data"]).is_empty());
    }

    #[tokio::test]
    async fn test_batches_and_dedupes() {
        let client = Arc::new(FakeCrm::default());
        let store = Arc::new(MemoryCacheStore::default());
        let loader = loader_with(client.clone(), store, Arc::default());

        let results = loader.load_many(["c1", "c2", "c1", "c3"]).await;

        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        let mut sent: Vec<String> = client.requests.lock()[0]["ids"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        sent.sort();
        assert_eq!(sent, vec!["c1", "c2", "c3"]);

        let ids: Vec<_> = results
            .iter()
            .map(|r| r.as_ref().unwrap()["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["c1", "c2", "c1", "c3"]);
        assert!(Arc::ptr_eq(
            results[0].as_ref().unwrap(),
            results[2].as_ref().unwrap()
        ));
    }

    #[tokio::test]
    async fn test_missing_ids_resolve_to_none_and_are_memoized() {
        let client = Arc::new(FakeCrm::default());
        let loader = loader_with(client.clone(), Arc::default(), Arc::default());

        assert!(loader.load("missing").await.is_none());
        assert!(loader.load("missing").await.is_none());
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_request_served_from_shared_cache() {
        let client = Arc::new(FakeCrm::default());
        let store = Arc::new(MemoryCacheStore::default());

        let first = loader_with(client.clone(), store.clone(), Arc::default());
        assert!(first.load("c1").await.is_some());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.keys(), vec!["dl:crm:contacts:c1".to_string()]);

        let second = loader_with(client.clone(), store, Arc::default());
        let entity = second.load("c1").await.unwrap();
        assert_eq!(entity["name"], json!("contact c1"));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_resolves_batch_to_none() {
        let client = Arc::new(FakeCrm {
            fail: true,
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink::default());
        let loader = loader_with(client, Arc::default(), sink.clone());

        let results = loader.load_many(["c1", "c2"]).await;
        assert_eq!(results, vec![None, None]);

        let events = sink.0.lock();
        assert!(matches!(
            &events[0],
            CacheEvent::BatchFailed { keyspace, keys: 2, .. } if keyspace == "crm.contacts"
        ));
    }

    #[tokio::test]
    async fn test_prime_skips_backend() {
        let client = Arc::new(FakeCrm::default());
        let store = Arc::new(MemoryCacheStore::default());
        let loader = loader_with(client.clone(), store.clone(), Arc::default());

        loader.prime("c9", json!({"id": "c9", "name": "fresh"}));
        let entity = loader.load("c9").await.unwrap();
        assert_eq!(entity["name"], json!("fresh"));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let cached = store
            .multi_get(&["dl:crm:contacts:c9".to_string()])
            .await
            .unwrap();
        assert!(cached[0].as_deref().unwrap().contains("fresh"));
    }

    #[tokio::test]
    async fn test_max_batch_size_splits_dispatch() {
        let client = Arc::new(FakeCrm::default());
        let loader = EntityLoader::new(
            KeySpace::entity("crm", "contacts"),
            client.clone(),
            Arc::new(MemoryCacheStore::default()),
            Arc::new(RecordingSink::default()),
            LoaderOptions::default().with_max_batch_size(2),
        );

        let results = loader.load_many(["a", "b", "c", "d", "e"]).await;
        assert!(results.iter().all(Option::is_some));
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        for request in client.requests.lock().iter() {
            assert!(request["ids"].as_array().unwrap().len() <= 2);
        }
    }
}
