//! Fakes shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use erp_gateway::{
    wrap_with_resilience, CacheEvent, CacheEventSink, CacheStore, CallOptions, CircuitBreakerConfig,
    CircuitBreakerRegistry, ClientManager, Error, GatewayConfig, GatewayRuntime, MemoryCacheStore,
    RetryPolicy, ServiceRegistry, ServiceStub, SharedClient,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tonic::Status;

/// In-process backend answering `*ByIds` style calls from fixed tables
#[derive(Default)]
pub struct FakeBackend {
    /// method → (request field, response field, item field matched against the ids)
    routes: HashMap<String, (String, String, String)>,
    tables: HashMap<String, Vec<Value>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
    failure: Mutex<Option<Status>>,
    invocations: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `method` by matching `ids` against each item's `id`
    pub fn entities(self, method: &str, items: Vec<Value>) -> Self {
        self.route(method, "ids", "items", "id", items)
    }

    pub fn route(
        mut self,
        method: &str,
        request_field: &str,
        response_field: &str,
        match_field: &str,
        items: Vec<Value>,
    ) -> Self {
        self.routes.insert(
            method.to_string(),
            (
                request_field.to_string(),
                response_field.to_string(),
                match_field.to_string(),
            ),
        );
        self.tables.insert(method.to_string(), items);
        self
    }

    pub fn fail_with(&self, status: Status) {
        *self.failure.lock() = Some(status);
    }

    pub fn recover(&self) {
        *self.failure.lock() = None;
    }

    /// Every stub invocation, retries included
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Successful-or-not calls per method with the ids they carried, sorted
    pub fn calls_to(&self, method: &str) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, ids)| {
                let mut ids = ids.clone();
                ids.sort();
                ids
            })
            .collect()
    }
}

#[async_trait]
impl ServiceStub for FakeBackend {
    async fn invoke(
        &self,
        method: &str,
        request: Value,
        _options: CallOptions,
    ) -> Result<Value, Status> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let Some((request_field, response_field, match_field)) = self.routes.get(method) else {
            return Err(Status::unimplemented(format!("no route for {method}")));
        };
        let ids: Vec<String> = request[request_field.as_str()]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        self.calls.lock().push((method.to_string(), ids.clone()));

        if let Some(status) = self.failure.lock().clone() {
            return Err(status);
        }

        let items: Vec<Value> = self.tables[method]
            .iter()
            .filter(|item| {
                item[match_field.as_str()]
                    .as_str()
                    .map(|id| ids.iter().any(|wanted| wanted == id))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let mut response = serde_json::Map::new();
        response.insert(response_field.clone(), Value::Array(items));
        Ok(Value::Object(response))
    }
}

/// Memory store that counts writes and can be told to fail
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryCacheStore,
    pub writes: AtomicUsize,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheStore for FlakyStore {
    async fn multi_get(&self, keys: &[String]) -> erp_gateway::Result<Vec<Option<String>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Cache("read refused".into()));
        }
        self.inner.multi_get(keys).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> erp_gateway::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Cache("write refused".into()));
        }
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> erp_gateway::Result<bool> {
        self.inner.delete(key).await
    }

    async fn scan_delete(&self, pattern: &str) -> erp_gateway::Result<usize> {
        self.inner.scan_delete(pattern).await
    }
}

#[derive(Default)]
pub struct RecordingSink(pub Mutex<Vec<CacheEvent>>);

impl RecordingSink {
    pub fn operations(&self) -> Vec<&'static str> {
        self.0.lock().iter().map(CacheEvent::operation).collect()
    }
}

impl CacheEventSink for RecordingSink {
    fn record(&self, event: CacheEvent) {
        self.0.lock().push(event);
    }
}

pub struct Harness {
    pub runtime: GatewayRuntime,
    pub store: Arc<FlakyStore>,
    pub sink: Arc<RecordingSink>,
    pub breakers: Arc<CircuitBreakerRegistry>,
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(3)
        .with_backoff_base(Duration::from_millis(1))
        .with_call_timeout(Duration::from_millis(500))
}

/// Runtime over fake backends wrapped in the real resilience layer
pub fn harness(backends: Vec<(&str, Arc<FakeBackend>)>, breaker: CircuitBreakerConfig) -> Harness {
    let breakers = Arc::new(CircuitBreakerRegistry::new(breaker));
    let clients: Vec<SharedClient> = backends
        .into_iter()
        .map(|(service, backend)| {
            Arc::new(wrap_with_resilience(
                backend,
                breakers.get_or_create(service),
                fast_policy(),
            )) as SharedClient
        })
        .collect();

    let store = Arc::new(FlakyStore::default());
    let sink = Arc::new(RecordingSink::default());
    let manager =
        ClientManager::from_clients(ServiceRegistry::default(), breakers.clone(), clients);
    let runtime = GatewayRuntime::from_parts(
        GatewayConfig::default(),
        manager,
        store.clone(),
        sink.clone(),
    );

    Harness {
        runtime,
        store,
        sink,
        breakers,
    }
}

/// Give fire-and-forget cache writes time to land
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}

pub fn users() -> Vec<Value> {
    (1..=3)
        .map(|n| json!({"id": n.to_string(), "name": format!("user{n}")}))
        .collect()
}
