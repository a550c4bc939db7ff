//! Qdrant vector-store backend
//!
//! Talks to Qdrant over its REST API. All memory layers can share one
//! collection; every point carries `memory_type` and `user_id` in its payload
//! and each store filters on its own layer.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{eviction_candidate, ForgetStrategy, MemoryStore, MemoryUpdate, RetrieveQuery, StoreStats};
use crate::embedding::Embedder;
use crate::error::{MemoryError, Result};
use crate::model::{MemoryConfig, MemoryItem, MemoryKind, Metadata};

const SCROLL_PAGE: usize = 256;

/// Payload fields that get a keyword index
const INDEXED_FIELDS: &[(&str, &str)] = &[
    ("memory_id", "keyword"),
    ("memory_type", "keyword"),
    ("user_id", "keyword"),
    ("timestamp", "integer"),
    ("importance", "float"),
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distance {
    #[default]
    Cosine,
    Dot,
    Euclid,
}

impl FromStr for Distance {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cosine" => Ok(Distance::Cosine),
            "dot" => Ok(Distance::Dot),
            "euclid" | "euclidean" => Ok(Distance::Euclid),
            other => Err(MemoryError::Config(format!("unknown vector distance '{}'", other))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
    pub distance: Distance,
    pub timeout_secs: u64,
    /// Drop search hits scoring below this
    pub score_threshold: Option<f32>,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6333".into(),
            api_key: None,
            collection: "agent_memory".into(),
            distance: Distance::Cosine,
            timeout_secs: 30,
            score_threshold: None,
        }
    }
}

impl QdrantConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Ok(Self {
            url: get("QDRANT_URL").unwrap_or(defaults.url),
            api_key: get("QDRANT_API_KEY"),
            collection: get("QDRANT_COLLECTION").unwrap_or(defaults.collection),
            distance: match get("QDRANT_DISTANCE") {
                Some(raw) => raw.parse()?,
                None => defaults.distance,
            },
            timeout_secs: match get("QDRANT_TIMEOUT") {
                Some(raw) => raw.parse().map_err(|e| {
                    MemoryError::Config(format!("QDRANT_TIMEOUT must be an integer, got '{}': {}", raw, e))
                })?,
                None => defaults.timeout_secs,
            },
            score_threshold: None,
        })
    }
}

/// Points in Qdrant must have UUID or integer IDs; the memory ID itself
/// always travels in the payload as `memory_id`. Other IDs map to a stable
/// name-based UUID, so writing the same memory again replaces its point.
fn point_id(memory_id: &str) -> String {
    match uuid::Uuid::parse_str(memory_id) {
        Ok(id) => id.to_string(),
        Err(_) => uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, memory_id.as_bytes()).to_string(),
    }
}

fn to_payload(item: &MemoryItem) -> Value {
    json!({
        "memory_id": item.id,
        "content": item.content,
        "memory_type": item.memory_type.as_str(),
        "user_id": item.user_id,
        "timestamp": item.timestamp.timestamp(),
        "importance": item.importance,
        "metadata": item.metadata,
    })
}

fn from_payload(payload: &Value) -> Result<MemoryItem> {
    let text = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| MemoryError::Backend(format!("point payload is missing '{}'", key)))
    };

    let timestamp = payload
        .get("timestamp")
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);
    let metadata: Metadata = match payload.get("metadata") {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => Metadata::new(),
    };

    Ok(MemoryItem {
        id: text("memory_id")?,
        content: text("content")?,
        memory_type: text("memory_type")?.parse()?,
        user_id: text("user_id").unwrap_or_default(),
        timestamp,
        importance: payload
            .get("importance")
            .and_then(Value::as_f64)
            .map_or(0.5, |v| v as f32),
        metadata,
    })
}

fn match_condition(key: &str, value: &str) -> Value {
    json!({ "key": key, "match": { "value": value } })
}

/// Filter restricting to one layer, plus optional extra conditions
fn layer_filter(kind: MemoryKind, extra: Vec<Value>) -> Value {
    let mut must = vec![match_condition("memory_type", kind.as_str())];
    must.extend(extra);
    json!({ "must": must })
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct ScoredPoint {
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct ScrollPage {
    points: Vec<ScoredPoint>,
    #[serde(default)]
    next_page_offset: Option<Value>,
}

#[derive(Deserialize)]
struct CountResult {
    count: usize,
}

/// Memory layer stored as vectors in a Qdrant collection
pub struct QdrantStore {
    kind: MemoryKind,
    client: Client,
    config: QdrantConfig,
    embedder: Arc<dyn Embedder>,
    capacity: usize,
    ready: OnceCell<()>,
}

impl QdrantStore {
    pub fn new(kind: MemoryKind, config: QdrantConfig, embedder: Arc<dyn Embedder>, memory: &MemoryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            kind,
            client,
            config,
            embedder,
            capacity: memory.max_capacity.max(1),
            ready: OnceCell::new(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!(
            "{}/collections/{}{}",
            self.config.url.trim_end_matches('/'),
            self.config.collection,
            path
        );
        let builder = self.client.request(method, url);
        match &self.config.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.pointer("/status/error").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        Err(MemoryError::Backend(format!("HTTP {}: {}", status.as_u16(), detail.trim())))
    }

    async fn call<T: for<'de> Deserialize<'de>>(&self, builder: RequestBuilder) -> Result<T> {
        let envelope: Envelope<T> = self.send(builder).await?.json().await?;
        Ok(envelope.result)
    }

    /// Create the collection and payload indexes on first use
    async fn ensure_collection(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                let exists = self.request(Method::GET, "").send().await?;
                match exists.status() {
                    StatusCode::OK => {
                        debug!(collection = %self.config.collection, "Using existing Qdrant collection");
                    }
                    StatusCode::NOT_FOUND => {
                        let body = json!({
                            "vectors": {
                                "size": self.embedder.dimension(),
                                "distance": self.config.distance,
                            }
                        });
                        self.send(self.request(Method::PUT, "").json(&body)).await?;
                        info!(collection = %self.config.collection, "Created Qdrant collection");
                    }
                    other => {
                        return Err(MemoryError::Backend(format!(
                            "collection lookup failed with HTTP {}",
                            other.as_u16()
                        )));
                    }
                }

                for (field, schema) in INDEXED_FIELDS {
                    let body = json!({ "field_name": field, "field_schema": schema });
                    if let Err(e) = self.send(self.request(Method::PUT, "/index?wait=true").json(&body)).await {
                        debug!(field, error = %e, "Payload index not created");
                    }
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Embed and upsert `item`, then drop any older point holding the same
    /// memory under a different point ID. Nothing is deleted unless the new
    /// point was written.
    async fn write(&self, item: &MemoryItem) -> Result<()> {
        let vector = self.embedder.embed_one(&item.content).await?;
        let point = point_id(&item.id);
        let body = json!({
            "points": [{
                "id": point,
                "vector": vector,
                "payload": to_payload(item),
            }]
        });
        self.send(self.request(Method::PUT, "/points?wait=true").json(&body)).await?;

        if point != item.id {
            let stale = json!({
                "must": [
                    match_condition("memory_type", self.kind.as_str()),
                    match_condition("memory_id", &item.id),
                ],
                "must_not": [{ "has_id": [point] }],
            });
            if let Err(e) = self.delete_where(stale).await {
                warn!(id = %item.id, error = %e, "Stale Qdrant points not removed");
            }
        }
        Ok(())
    }

    async fn delete_where(&self, filter: Value) -> Result<()> {
        let body = json!({ "filter": filter });
        self.send(self.request(Method::POST, "/points/delete?wait=true").json(&body)).await?;
        Ok(())
    }

    async fn count_where(&self, filter: Value) -> Result<usize> {
        let body = json!({ "filter": filter, "exact": true });
        let result: CountResult = self.call(self.request(Method::POST, "/points/count").json(&body)).await?;
        Ok(result.count)
    }

    async fn scroll_where(&self, filter: Value) -> Result<Vec<MemoryItem>> {
        let mut items = Vec::new();
        let mut offset: Option<Value> = None;
        loop {
            let mut body = json!({
                "filter": filter,
                "limit": SCROLL_PAGE,
                "with_payload": true,
                "with_vector": false,
            });
            if let Some(offset) = offset.take() {
                body["offset"] = offset;
            }
            let page: ScrollPage = self.call(self.request(Method::POST, "/points/scroll").json(&body)).await?;
            for point in &page.points {
                match from_payload(&point.payload) {
                    Ok(item) => items.push(item),
                    Err(e) => warn!(error = %e, "Skipping malformed Qdrant point"),
                }
            }
            match page.next_page_offset {
                Some(next) if !next.is_null() => offset = Some(next),
                _ => break,
            }
        }
        Ok(items)
    }

    fn id_filter(&self, id: &str) -> Value {
        layer_filter(self.kind, vec![match_condition("memory_id", id)])
    }
}

#[async_trait]
impl MemoryStore for QdrantStore {
    fn kind(&self) -> MemoryKind {
        self.kind
    }

    async fn add(&self, mut item: MemoryItem) -> Result<String> {
        self.ensure_collection().await?;
        item.memory_type = self.kind;
        self.write(&item).await?;
        Ok(item.id)
    }

    async fn retrieve(&self, query: &RetrieveQuery) -> Result<Vec<MemoryItem>> {
        self.ensure_collection().await?;

        let mut extra = vec![json!({ "key": "importance", "range": { "gte": query.min_importance } })];
        if let Some(user) = &query.user_id {
            extra.push(match_condition("user_id", user));
        }
        let filter = layer_filter(self.kind, extra);

        if query.query.trim().is_empty() {
            let mut items = self.scroll_where(filter).await?;
            items.sort_by(|a, b| b.importance.total_cmp(&a.importance));
            items.truncate(query.limit);
            return Ok(items);
        }

        let vector = self.embedder.embed_one(&query.query).await?;
        let mut body = json!({
            "vector": vector,
            "limit": query.limit,
            "with_payload": true,
            "filter": filter,
        });
        if let Some(threshold) = self.config.score_threshold {
            body["score_threshold"] = json!(threshold);
        }

        let hits: Vec<ScoredPoint> = self.call(self.request(Method::POST, "/points/search").json(&body)).await?;
        Ok(hits
            .iter()
            .filter_map(|hit| from_payload(&hit.payload).ok())
            .collect())
    }

    async fn update(&self, id: &str, update: &MemoryUpdate) -> Result<bool> {
        let Some(mut item) = self.get(id).await? else {
            return Ok(false);
        };
        update.apply(&mut item);
        self.write(&item).await?;
        Ok(true)
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        if !self.contains(id).await? {
            return Ok(false);
        }
        self.delete_where(self.id_filter(id)).await?;
        Ok(true)
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        self.ensure_collection().await?;
        Ok(self.count_where(self.id_filter(id)).await? > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<MemoryItem>> {
        self.ensure_collection().await?;
        Ok(self.scroll_where(self.id_filter(id)).await?.into_iter().next())
    }

    async fn all(&self) -> Result<Vec<MemoryItem>> {
        self.ensure_collection().await?;
        self.scroll_where(layer_filter(self.kind, Vec::new())).await
    }

    async fn forget(&self, strategy: ForgetStrategy, threshold: f32, max_age_days: u32) -> Result<usize> {
        self.ensure_collection().await?;
        let condition = match strategy {
            ForgetStrategy::ImportanceBased => {
                json!({ "key": "importance", "range": { "lt": threshold } })
            }
            ForgetStrategy::TimeBased => {
                let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_age_days));
                json!({ "key": "timestamp", "range": { "lt": cutoff.timestamp() } })
            }
            ForgetStrategy::CapacityBased => {
                let mut items = self.all().await?;
                let mut forgotten = 0;
                while items.len() > self.capacity {
                    let Some(victim) = eviction_candidate(&items) else { break };
                    let item = items.remove(victim);
                    self.delete_where(self.id_filter(&item.id)).await?;
                    forgotten += 1;
                }
                return Ok(forgotten);
            }
        };

        let filter = layer_filter(self.kind, vec![condition]);
        let count = self.count_where(filter.clone()).await?;
        if count > 0 {
            self.delete_where(filter).await?;
        }
        Ok(count)
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_collection().await?;
        self.delete_where(layer_filter(self.kind, Vec::new())).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        let items = self.all().await?;
        Ok(StoreStats {
            capacity: Some(self.capacity),
            ..StoreStats::from_items(self.kind, items.iter())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[test]
    fn test_payload_round_trip() {
        let mut item = MemoryItem::new("Paris is the capital of France", MemoryKind::Semantic, "alice")
            .with_importance(0.75);
        item.metadata.insert("source".into(), json!("atlas.md"));

        let payload = to_payload(&item);
        assert_eq!(payload["memory_type"], "semantic");
        assert_eq!(payload["metadata"]["source"], "atlas.md");

        let restored = from_payload(&payload).unwrap();
        assert_eq!(restored, item);
        assert_eq!(restored.content, item.content);
        assert_eq!(restored.user_id, "alice");
        assert!((restored.importance - 0.75).abs() < 1e-6);
        assert_eq!(restored.timestamp.timestamp(), item.timestamp.timestamp());
        assert_eq!(restored.metadata["source"], "atlas.md");
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            from_payload(&json!({ "content": "x" })),
            Err(MemoryError::Backend(msg)) if msg.contains("memory_id")
        ));
    }

    #[test]
    fn test_point_ids_are_uuids() {
        let uuid = uuid::Uuid::new_v4().to_string();
        assert_eq!(point_id(&uuid), uuid);
        assert!(uuid::Uuid::parse_str(&point_id("note-1")).is_ok());
        assert_eq!(point_id("note-1"), point_id("note-1"));
        assert_ne!(point_id("note-1"), point_id("note-2"));
    }

    type RequestLog = Arc<Mutex<Vec<(String, String, Value)>>>;

    /// Stand-in for the Qdrant REST API: records requests, answers every
    /// scroll with `stored` and every count with 1
    async fn fake_qdrant(stored: MemoryItem) -> (String, RequestLog) {
        let log = RequestLog::default();
        let sink = Arc::clone(&log);
        let payload = to_payload(&stored);

        let app = axum::Router::new().fallback(move |method: Method, uri: axum::http::Uri, body: String| {
            let sink = Arc::clone(&sink);
            let payload = payload.clone();
            async move {
                let path = uri.path().to_string();
                let body: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                sink.lock().unwrap().push((method.to_string(), path.clone(), body));
                let result = if path.ends_with("/points/scroll") {
                    json!({ "points": [{ "payload": payload }], "next_page_offset": null })
                } else if path.ends_with("/points/count") {
                    json!({ "count": 1 })
                } else {
                    json!(true)
                };
                axum::Json(json!({ "result": result, "status": "ok" }))
            }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await });
        (url, log)
    }

    struct StubEmbedder {
        fail: bool,
    }

    #[async_trait]
    impl Embedder for StubEmbedder {
        fn dimension(&self) -> usize {
            3
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.fail {
                return Err(MemoryError::Embedding("embedding service down".into()));
            }
            Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
        }
    }

    fn store(url: String, fail: bool) -> QdrantStore {
        let config = QdrantConfig {
            url,
            ..QdrantConfig::default()
        };
        QdrantStore::new(
            MemoryKind::Semantic,
            config,
            Arc::new(StubEmbedder { fail }),
            &MemoryConfig::default(),
        )
        .unwrap()
    }

    /// Point writes and deletes, in the order they were sent
    fn writes(log: &RequestLog) -> Vec<String> {
        log.lock()
            .unwrap()
            .iter()
            .filter(|(_, path, _)| path.contains("/points") && !path.ends_with("/scroll") && !path.ends_with("/count"))
            .map(|(method, path, _)| format!("{} {}", method, path.trim_start_matches("/collections/agent_memory")))
            .collect()
    }

    #[tokio::test]
    async fn test_failed_embedding_deletes_nothing() {
        let existing = MemoryItem::new("old text", MemoryKind::Semantic, "alice");
        let (url, log) = fake_qdrant(existing.clone()).await;
        let store = store(url, true);

        let replacement = MemoryItem::new("new text", MemoryKind::Semantic, "alice");
        let replacement = MemoryItem {
            id: existing.id.clone(),
            ..replacement
        };
        assert!(matches!(store.add(replacement).await, Err(MemoryError::Embedding(_))));

        let update = MemoryUpdate {
            content: Some("edited".into()),
            ..MemoryUpdate::default()
        };
        assert!(store.update(&existing.id, &update).await.is_err());

        assert!(writes(&log).is_empty());
    }

    #[tokio::test]
    async fn test_uuid_ids_are_upserted_in_place() {
        let existing = MemoryItem::new("old text", MemoryKind::Semantic, "alice");
        let (url, log) = fake_qdrant(existing.clone()).await;
        let store = store(url, false);

        let update = MemoryUpdate {
            content: Some("edited".into()),
            ..MemoryUpdate::default()
        };
        assert!(store.update(&existing.id, &update).await.unwrap());

        assert_eq!(writes(&log), vec!["PUT /points"]);
        let log = log.lock().unwrap();
        let (_, _, body) = log.iter().rev().find(|(method, _, _)| method == "PUT").unwrap();
        assert_eq!(body["points"][0]["id"], json!(existing.id));
        assert_eq!(body["points"][0]["payload"]["content"], "edited");
    }

    #[tokio::test]
    async fn test_other_ids_write_before_removing_stale_points() {
        let mut note = MemoryItem::new("note body", MemoryKind::Semantic, "alice");
        note.id = "note-1".into();
        let (url, log) = fake_qdrant(note.clone()).await;
        let store = store(url, false);

        assert_eq!(store.add(note).await.unwrap(), "note-1");

        assert_eq!(writes(&log), vec!["PUT /points", "POST /points/delete"]);
        let log = log.lock().unwrap();
        let (_, _, delete) = log.iter().rev().find(|(_, path, _)| path.ends_with("/points/delete")).unwrap();
        assert_eq!(delete["filter"]["must_not"][0]["has_id"][0], json!(point_id("note-1")));
        assert_eq!(delete["filter"]["must"][1]["match"]["value"], "note-1");
    }

    #[test]
    fn test_layer_filter_shape() {
        let filter = layer_filter(MemoryKind::Episodic, vec![match_condition("user_id", "bob")]);
        assert_eq!(
            filter,
            json!({ "must": [
                { "key": "memory_type", "match": { "value": "episodic" } },
                { "key": "user_id", "match": { "value": "bob" } },
            ]})
        );
    }

    #[test]
    fn test_config_from_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("QDRANT_URL", "https://cluster.qdrant.io"),
            ("QDRANT_API_KEY", "secret"),
            ("QDRANT_DISTANCE", "euclidean"),
        ]);
        let config = QdrantConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.url, "https://cluster.qdrant.io");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.collection, "agent_memory");
        assert_eq!(config.distance, Distance::Euclid);
        assert_eq!(serde_json::to_value(Distance::Cosine).unwrap(), "Cosine");
    }
}
