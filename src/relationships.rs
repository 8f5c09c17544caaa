//! Loaders for derived relations
//!
//! [`OneToManyLoader`] batches parent ids into one backend call and groups the
//! returned items by a foreign key; parents without matches resolve to an empty
//! list. [`ChainedLoader`] follows a reference field from one entity to another
//! of the same key-space through an [`EntityLoader`].

use crate::cache::SharedCacheStore;
use crate::client::SharedClient;
use crate::dataloader::{
    id_string, response_items, Batched, CacheAside, Entity, EntityLoader, LoaderOptions,
};
use crate::error::Result;
use crate::metrics::GatewayMetrics;
use crate::observability::{CacheEvent, SharedCacheEventSink};
use async_graphql::dataloader::Loader;
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Children of one parent; shared by every lookup of that parent
pub type Related = Arc<Vec<serde_json::Value>>;

/// How to fetch and group a one-to-many relation
#[derive(Debug, Clone, PartialEq)]
pub struct RelationSpec {
    pub service: String,
    /// Relation name, also the cache key segment (`contactLeads`)
    pub name: String,
    pub method: String,
    /// Request field carrying the parent ids (`contactIds`)
    pub request_field: String,
    /// Response field holding the children (`leads`)
    pub response_field: String,
    /// Child field referencing the parent (`contactId`)
    pub group_field: String,
    /// Additional request fields sent with every batch
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RelationSpec {
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
            response_field: "items".to_string(),
            group_field: "parentId".to_string(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn request_field(mut self, field: impl Into<String>) -> Self {
        self.request_field = field.into();
        self
    }

    pub fn response_field(mut self, field: impl Into<String>) -> Self {
        self.response_field = field.into();
        self
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_field = field.into();
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    fn request(&self, ids: &[String]) -> serde_json::Value {
        let mut request = self.extra.clone();
        request.insert(self.request_field.clone(), serde_json::json!(ids));
        serde_json::Value::Object(request)
    }
}

impl fmt::Display for RelationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.name)
    }
}

pub(crate) struct OneToManyBatcher {
    spec: Arc<RelationSpec>,
    client: SharedClient,
    cache: CacheAside,
}

impl OneToManyBatcher {
    async fn fetch(&self, ids: &[String]) -> Result<HashMap<String, Vec<serde_json::Value>>> {
        let response = self
            .client
            .call(&self.spec.method, self.spec.request(ids))
            .await?;

        let mut groups: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
        for item in response_items(&response, &[self.spec.response_field.as_str(), "items"]) {
            if let Some(parent) = item.get(&self.spec.group_field).and_then(id_string) {
                groups.entry(parent).or_default().push(item.clone());
            }
        }
        Ok(groups)
    }
}

#[async_trait::async_trait]
impl Loader<String> for OneToManyBatcher {
    type Value = Related;
    type Error = Infallible;

    async fn load(
        &self,
        keys: &[String],
    ) -> std::result::Result<HashMap<String, Self::Value>, Self::Error> {
        let (hits, misses) = self.cache.read(keys).await;
        let mut resolved: HashMap<String, Related> = HashMap::with_capacity(keys.len());
        let mut misses = misses;
        for (id, value) in hits {
            match value {
                serde_json::Value::Array(children) => {
                    resolved.insert(id, Arc::new(children));
                }
                _ => misses.push(id),
            }
        }

        if misses.is_empty() {
            return Ok(resolved);
        }

        GatewayMetrics::global().record_batch(self.cache.label(), misses.len());
        debug!(relation = %self.spec, keys = misses.len(), "Dispatching relation batch");

        match self.fetch(&misses).await {
            Ok(mut groups) => {
                let mut fresh = Vec::with_capacity(misses.len());
                for id in misses {
                    let children = groups.remove(&id).unwrap_or_default();
                    fresh.push((id.clone(), serde_json::Value::Array(children.clone())));
                    resolved.insert(id, Arc::new(children));
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
                Ok(keys
                    .iter()
                    .map(|id| (id.clone(), Arc::new(Vec::new())))
                    .collect())
            }
        }
    }
}

/// Request-scoped loader for a one-to-many relation.
///
/// Results, empty lists included, are cached under
/// `dl:{service}:{relation}:{parent id}`.
#[derive(Clone)]
pub struct OneToManyLoader {
    spec: Arc<RelationSpec>,
    batched: Batched<OneToManyBatcher>,
    cache: CacheAside,
}

impl OneToManyLoader {
    pub fn new(
        spec: RelationSpec,
        client: SharedClient,
        store: SharedCacheStore,
        sink: SharedCacheEventSink,
        options: LoaderOptions,
    ) -> Self {
        let spec = Arc::new(spec);
        let cache = CacheAside::new(&spec.service, &spec.name, store, sink, options.ttl);
        let batcher = OneToManyBatcher {
            spec: Arc::clone(&spec),
            client,
            cache: cache.clone(),
        };
        Self {
            spec,
            batched: Batched::new(batcher, options.max_batch_size, options.batch_delay),
            cache,
        }
    }

    pub fn spec(&self) -> &RelationSpec {
        &self.spec
    }

    /// Children of `parent`; empty when none or when the batch failed
    pub async fn load(&self, parent: impl Into<String>) -> Related {
        self.batched
            .get(parent.into())
            .await
            .unwrap_or_else(|| Arc::new(Vec::new()))
    }

    pub async fn load_many<I, K>(&self, parents: I) -> Vec<Related>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let pending: Vec<_> = parents.into_iter().map(|id| self.load(id)).collect();
        futures::future::join_all(pending).await
    }

    /// Seed the children of `parent` in this request and in the shared cache
    pub fn prime(&self, parent: impl Into<String>, children: Vec<serde_json::Value>) {
        let parent = parent.into();
        self.batched.prime(parent.clone(), Arc::new(children.clone()));
        self.cache
            .write_back(vec![(parent, serde_json::Value::Array(children))]);
    }
}

impl fmt::Debug for OneToManyLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneToManyLoader")
            .field("relation", &self.spec.to_string())
            .finish()
    }
}

/// Follows `link_field` of an entity to another entity of the same key-space
#[derive(Clone, Debug)]
pub struct ChainedLoader {
    entities: EntityLoader,
    link_field: String,
}

impl ChainedLoader {
    pub fn new(entities: EntityLoader, link_field: impl Into<String>) -> Self {
        Self {
            entities,
            link_field: link_field.into(),
        }
    }

    pub fn link_field(&self) -> &str {
        &self.link_field
    }

    /// The entity referenced by `id`'s link field, if both exist
    pub async fn load(&self, id: impl Into<String>) -> Option<Entity> {
        let source = self.entities.load(id).await?;
        let target = source.get(&self.link_field).and_then(id_string)?;
        self.entities.load(target).await
    }

    /// Two batched rounds: the sources, then every referenced target
    pub async fn load_many<I, K>(&self, ids: I) -> Vec<Option<Entity>>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let sources = self.entities.load_many(ids).await;
        let links: Vec<Option<String>> = sources
            .iter()
            .map(|source| {
                source
                    .as_ref()
                    .and_then(|s| s.get(&self.link_field).and_then(id_string))
            })
            .collect();

        let targets = self
            .entities
            .load_many(links.iter().flatten().cloned())
            .await;
        let mut targets = targets.into_iter();

        links
            .into_iter()
            .map(|link| match link {
                Some(_) => targets.next().flatten(),
                None => None,
            })
            .collect()
    }
}
