//! Qdrant REST backend.
//!
//! Two API flavours are supported: servers from 1.10 on expose the universal
//! `/points/query` endpoint, older ones only `/points/search`. The flavour is
//! fixed when the backend is constructed, either from configuration or from a
//! single version lookup.

use super::{
    CollectionSpec, Distance, ImagePayload, IndexEntry, IndexError, ScoredEntry, VectorBackend,
    VectorLayout,
};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{str::FromStr, time::Duration};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QdrantApi {
    /// `/points/query` and `/collections/{name}/exists` (server 1.10+).
    Query,
    /// `/points/search`, existence via `GET /collections/{name}`.
    Search,
}

impl QdrantApi {
    /// Picks the flavour for a server version string such as `"1.12.4"`.
    pub fn for_version(version: &str) -> Self {
        let mut parts = version
            .trim_start_matches('v')
            .split('.')
            .map(|p| p.parse::<u32>().unwrap_or(0));
        let major = parts.next().unwrap_or(0);
        let minor = parts.next().unwrap_or(0);
        if (major, minor) >= (1, 10) {
            QdrantApi::Query
        } else {
            QdrantApi::Search
        }
    }
}

impl FromStr for QdrantApi {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "query" => Ok(QdrantApi::Query),
            "search" | "legacy" => Ok(QdrantApi::Search),
            other => Err(format!("'{other}' is not a Qdrant API flavour (query|search)")),
        }
    }
}

pub struct QdrantBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    api: QdrantApi,
}

impl QdrantBackend {
    /// Every request, connection setup included, is abandoned after `timeout`.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        api: QdrantApi,
        timeout: Duration,
    ) -> Result<Self, IndexError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api,
        })
    }

    /// Builds a backend, probing the server version when `api` is not given.
    pub async fn connect(
        base_url: &str,
        api_key: Option<String>,
        api: Option<QdrantApi>,
        timeout: Duration,
    ) -> Result<Self, IndexError> {
        let mut backend = Self::new(base_url, api_key, api.unwrap_or(QdrantApi::Query), timeout)?;
        if api.is_none() {
            let root = backend.send(backend.request(Method::GET, "/")).await?;
            let version = root
                .get("version")
                .and_then(Value::as_str)
                .ok_or_else(|| IndexError::Decode("missing server version".to_string()))?;
            backend.api = QdrantApi::for_version(version);
            info!(%version, api = ?backend.api, "Detected Qdrant server");
        }
        Ok(backend)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Value, IndexError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

fn is_not_found(err: &IndexError) -> bool {
    matches!(err, IndexError::Rejected { status, .. } if *status == StatusCode::NOT_FOUND.as_u16())
}

fn distance_name(distance: Distance) -> &'static str {
    match distance {
        Distance::Cosine => "Cosine",
        Distance::Dot => "Dot",
        Distance::Euclid => "Euclid",
    }
}

pub(crate) fn collection_body(spec: &CollectionSpec) -> Value {
    let params = json!({
        "size": spec.dimension,
        "distance": distance_name(spec.distance),
    });
    match &spec.layout {
        VectorLayout::Unnamed => json!({ "vectors": params }),
        VectorLayout::Named(name) => json!({ "vectors": { name: params } }),
    }
}

/// Reads the vector layout from a `GET /collections/{name}` response.
///
/// A vectors object carrying `size` is the single unnamed vector; otherwise its
/// keys are vector names and the first one is used.
pub(crate) fn parse_layout(body: &Value) -> Result<VectorLayout, IndexError> {
    let vectors = body
        .pointer("/result/config/params/vectors")
        .and_then(Value::as_object)
        .ok_or_else(|| IndexError::Decode("missing 'result.config.params.vectors'".to_string()))?;
    if vectors.contains_key("size") {
        return Ok(VectorLayout::Unnamed);
    }
    vectors
        .keys()
        .next()
        .map(|name| VectorLayout::Named(name.clone()))
        .ok_or_else(|| IndexError::Decode("collection declares no vectors".to_string()))
}

pub(crate) fn points_body(entries: &[IndexEntry], encoding: &VectorLayout) -> Value {
    let points: Vec<Value> = entries
        .iter()
        .map(|entry| {
            let vector = match encoding {
                VectorLayout::Unnamed => json!(entry.vector),
                VectorLayout::Named(name) => json!({ name: entry.vector }),
            };
            json!({ "id": entry.id, "vector": vector, "payload": entry.payload })
        })
        .collect();
    json!({ "points": points })
}

pub(crate) fn query_body(
    api: QdrantApi,
    vector: &[f32],
    layout: &VectorLayout,
    limit: usize,
) -> Value {
    match (api, layout) {
        (QdrantApi::Query, VectorLayout::Unnamed) => {
            json!({ "query": vector, "limit": limit, "with_payload": true })
        }
        (QdrantApi::Query, VectorLayout::Named(name)) => {
            json!({ "query": vector, "using": name, "limit": limit, "with_payload": true })
        }
        (QdrantApi::Search, VectorLayout::Unnamed) => {
            json!({ "vector": vector, "limit": limit, "with_payload": true })
        }
        (QdrantApi::Search, VectorLayout::Named(name)) => json!({
            "vector": { "name": name, "vector": vector },
            "limit": limit,
            "with_payload": true,
        }),
    }
}

#[derive(Deserialize)]
struct RawHit {
    id: Value,
    score: f32,
    payload: Option<ImagePayload>,
}

pub(crate) fn parse_hits(api: QdrantApi, body: Value) -> Result<Vec<ScoredEntry>, IndexError> {
    let result = body
        .get("result")
        .ok_or_else(|| IndexError::Decode("missing 'result'".to_string()))?;
    let hits = match api {
        QdrantApi::Query => result.get("points").unwrap_or(&Value::Null),
        QdrantApi::Search => result,
    };
    let raw: Vec<RawHit> = serde_json::from_value(hits.clone())
        .map_err(|e| IndexError::Decode(format!("bad hit list: {e}")))?;

    raw.into_iter()
        .map(|hit| {
            let id = hit
                .id
                .as_u64()
                .ok_or_else(|| IndexError::Decode(format!("non-integer point id {}", hit.id)))?;
            let payload = hit
                .payload
                .ok_or_else(|| IndexError::Decode(format!("point {id} has no payload")))?;
            Ok(ScoredEntry {
                id,
                payload,
                score: hit.score,
            })
        })
        .collect()
}

#[async_trait]
impl VectorBackend for QdrantBackend {
    fn describe(&self) -> String {
        format!("qdrant({:?}) at {}", self.api, self.base_url)
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool, IndexError> {
        match self.api {
            QdrantApi::Query => {
                let body = self
                    .send(self.request(Method::GET, &format!("/collections/{collection}/exists")))
                    .await?;
                body.pointer("/result/exists")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| IndexError::Decode("missing 'result.exists'".to_string()))
            }
            QdrantApi::Search => {
                match self
                    .send(self.request(Method::GET, &format!("/collections/{collection}")))
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(e) if is_not_found(&e) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn collection_layout(
        &self,
        collection: &str,
    ) -> Result<Option<VectorLayout>, IndexError> {
        match self
            .send(self.request(Method::GET, &format!("/collections/{collection}")))
            .await
        {
            Ok(body) => parse_layout(&body).map(Some),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_collection(
        &self,
        collection: &str,
        spec: &CollectionSpec,
    ) -> Result<(), IndexError> {
        self.send(
            self.request(Method::PUT, &format!("/collections/{collection}"))
                .json(&collection_body(spec)),
        )
        .await?;
        Ok(())
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), IndexError> {
        match self
            .send(self.request(Method::DELETE, &format!("/collections/{collection}")))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn upsert(
        &self,
        collection: &str,
        entries: &[IndexEntry],
        encoding: &VectorLayout,
    ) -> Result<(), IndexError> {
        self.send(
            self.request(
                Method::PUT,
                &format!("/collections/{collection}/points?wait=true"),
            )
            .json(&points_body(entries, encoding)),
        )
        .await?;
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<u64, IndexError> {
        let body = match self
            .send(
                self.request(
                    Method::POST,
                    &format!("/collections/{collection}/points/count"),
                )
                .json(&json!({ "exact": true })),
            )
            .await
        {
            Ok(body) => body,
            Err(e) if is_not_found(&e) => return Ok(0),
            Err(e) => return Err(e),
        };
        body.pointer("/result/count")
            .and_then(Value::as_u64)
            .ok_or_else(|| IndexError::Decode("missing 'result.count'".to_string()))
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        layout: &VectorLayout,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>, IndexError> {
        let endpoint = match self.api {
            QdrantApi::Query => "query",
            QdrantApi::Search => "search",
        };
        let body = match self
            .send(
                self.request(
                    Method::POST,
                    &format!("/collections/{collection}/points/{endpoint}"),
                )
                .json(&query_body(self.api, vector, layout, limit)),
            )
            .await
        {
            Ok(body) => body,
            Err(e) if is_not_found(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        parse_hits(self.api, body)
    }
}
