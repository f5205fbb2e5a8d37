//! Qdrant vector store adapter.
//!
//! Isolates Qdrant API specifics behind the [`VectorStore`] trait so the
//! memory engine can swap vector backends with minimal surface-area changes.
//! Writes use wait-for-commit with strong ordering; searches read at
//! majority consistency.

use crate::{PayloadPoint, ScoredPoint, VectorPoint, VectorStore};
use async_trait::async_trait;
use qdrant_client::qdrant::{
    CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance, PointId,
    PointStruct, ReadConsistencyType, ScrollPointsBuilder, SearchPointsBuilder,
    SetPayloadPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder, WriteOrdering,
    WriteOrderingType, point_id::PointIdOptions, read_consistency,
    vectors_config::Config as VectorsConfigKind,
};
use qdrant_client::{Payload, Qdrant};
use recall_core::{RecallError, Result, env_int, env_str};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Qdrant runtime configuration, resolved from the environment.
#[derive(Debug, Clone)]
pub struct QdrantSettings {
    /// Empty URL means the embedded/local store is used instead.
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub collection: String,
    pub replication_factor: u32,
    pub write_consistency_factor: u32,
    pub timeout_seconds: u64,
    pub max_retries: usize,
}

impl QdrantSettings {
    pub fn from_env() -> Self {
        Self {
            url: env_str("QDRANT_URL"),
            api_key: env_str("QDRANT_API_KEY"),
            collection: env_str("QDRANT_COLLECTION").unwrap_or_else(|| "memories".to_string()),
            replication_factor: env_int("QDRANT_REPLICATION_FACTOR", 1, 1) as u32,
            write_consistency_factor: env_int("QDRANT_WRITE_CONSISTENCY_FACTOR", 1, 1) as u32,
            timeout_seconds: env_int("QDRANT_TIMEOUT_SEC", 30, 1),
            max_retries: env_int("QDRANT_MAX_RETRIES", 3, 0) as usize,
        }
    }
}

pub struct QdrantVectorStore {
    client: Arc<Qdrant>,
    collection: String,
    settings: QdrantSettings,
}

impl QdrantVectorStore {
    /// Connect and verify the server is reachable, retrying with exponential
    /// backoff up to `max_retries`.
    pub async fn connect(settings: QdrantSettings) -> Result<Self> {
        let url = settings
            .url
            .clone()
            .ok_or_else(|| RecallError::config("QDRANT_URL is required for the qdrant backend"))?;

        info!(url = %url, collection = %settings.collection, "Connecting to Qdrant");

        let mut retries = 0;
        let client = loop {
            let mut config = qdrant_client::config::QdrantConfig::from_url(&url);
            config.set_timeout(Duration::from_secs(settings.timeout_seconds));
            if let Some(api_key) = &settings.api_key {
                config.set_api_key(api_key);
            }

            let client = Qdrant::new(config)
                .map_err(|e| RecallError::vector_store(format!("client init: {e}")))?;

            match client.health_check().await {
                Ok(_) => break client,
                Err(e) if retries < settings.max_retries => {
                    warn!(
                        "Qdrant health check failed (attempt {}/{}): {e}",
                        retries + 1,
                        settings.max_retries
                    );
                    retries += 1;
                    sleep(Duration::from_secs(2u64.pow(retries as u32))).await;
                }
                Err(e) => {
                    return Err(RecallError::vector_store(format!(
                        "failed to connect after {} retries: {e}",
                        settings.max_retries
                    )));
                }
            }
        };

        Ok(Self {
            client: Arc::new(client),
            collection: settings.collection.clone(),
            settings,
        })
    }

    fn write_ordering() -> WriteOrdering {
        WriteOrdering {
            r#type: WriteOrderingType::Strong.into(),
        }
    }

    fn majority_read() -> read_consistency::Value {
        read_consistency::Value::Type(ReadConsistencyType::Majority.into())
    }

    fn ids_selector(ids: &[i64]) -> Vec<PointId> {
        ids.iter().map(|&id| PointId::from(id as u64)).collect()
    }

    async fn create_collection(&self, dimension: usize) -> Result<()> {
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(
                        dimension as u64,
                        Distance::Cosine,
                    ))
                    .replication_factor(self.settings.replication_factor)
                    .write_consistency_factor(self.settings.write_consistency_factor),
            )
            .await
            .map_err(|e| RecallError::vector_store(format!("create collection: {e}")))?;
        info!(collection = %self.collection, dimension, "Qdrant collection created");
        Ok(())
    }
}

fn point_id_to_i64(point_id: Option<PointId>) -> Option<i64> {
    match point_id?.point_id_options? {
        PointIdOptions::Num(n) => Some(n as i64),
        PointIdOptions::Uuid(_) => None,
    }
}

fn qdrant_value_to_json(value: qdrant_client::qdrant::Value) -> serde_json::Value {
    use qdrant_client::qdrant::value::Kind;
    match value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::IntegerValue(i)) => serde_json::Value::from(i),
        Some(Kind::DoubleValue(d)) => serde_json::Value::from(d),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::ListValue(list)) => serde_json::Value::Array(
            list.values.into_iter().map(qdrant_value_to_json).collect(),
        ),
        Some(Kind::StructValue(object)) => serde_json::Value::Object(
            object
                .fields
                .into_iter()
                .map(|(key, value)| (key, qdrant_value_to_json(value)))
                .collect(),
        ),
    }
}

fn payload_to_json(
    payload: std::collections::HashMap<String, qdrant_client::qdrant::Value>,
) -> serde_json::Value {
    serde_json::Value::Object(
        payload
            .into_iter()
            .map(|(key, value)| (key, qdrant_value_to_json(value)))
            .collect(),
    )
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn ensure_collection(&self, dimension: usize) -> Result<()> {
        let collections = self
            .client
            .list_collections()
            .await
            .map_err(|e| RecallError::vector_store(format!("list collections: {e}")))?;
        let exists = collections
            .collections
            .iter()
            .any(|c| c.name == self.collection);
        if exists {
            debug!(collection = %self.collection, "Qdrant collection already exists");
            return Ok(());
        }
        self.create_collection(dimension).await
    }

    async fn dimension(&self) -> Result<Option<usize>> {
        let response = match self.client.collection_info(&self.collection).await {
            Ok(response) => response,
            Err(_) => return Ok(None),
        };
        let size = response
            .result
            .and_then(|info| info.config)
            .and_then(|config| config.params)
            .and_then(|params| params.vectors_config)
            .and_then(|vectors| vectors.config)
            .and_then(|kind| match kind {
                VectorsConfigKind::Params(params) => Some(params.size as usize),
                VectorsConfigKind::ParamsMap(map) => map
                    .map
                    .values()
                    .next()
                    .map(|params| params.size as usize),
            });
        Ok(size)
    }

    async fn recreate_collection(&self, dimension: usize) -> Result<()> {
        // Deleting a missing collection is not an error worth surfacing.
        if let Err(e) = self.client.delete_collection(&self.collection).await {
            debug!("delete collection before recreate: {e}");
        }
        self.create_collection(dimension).await
    }

    async fn count(&self) -> Result<usize> {
        let response = self
            .client
            .count(CountPointsBuilder::new(&self.collection).exact(true))
            .await
            .map_err(|e| RecallError::vector_store(format!("count: {e}")))?;
        Ok(response.result.map(|r| r.count as usize).unwrap_or(0))
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let structs: Vec<PointStruct> = points
            .into_iter()
            .map(|point| {
                let payload = Payload::try_from(point.payload)
                    .map_err(|e| RecallError::vector_store(format!("payload encode: {e}")))?;
                Ok(PointStruct::new(point.id as u64, point.vector, payload))
            })
            .collect::<Result<_>>()?;

        self.client
            .upsert_points(
                UpsertPointsBuilder::new(&self.collection, structs)
                    .wait(true)
                    .ordering(Self::write_ordering()),
            )
            .await
            .map_err(|e| RecallError::vector_store(format!("upsert: {e}")))?;
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        threshold: Option<f64>,
    ) -> Result<Vec<ScoredPoint>> {
        let mut builder =
            SearchPointsBuilder::new(&self.collection, vector.to_vec(), limit as u64)
                .with_payload(true)
                .read_consistency(Self::majority_read());
        if let Some(threshold) = threshold {
            builder = builder.score_threshold(threshold as f32);
        }

        let response = self
            .client
            .search_points(builder)
            .await
            .map_err(|e| RecallError::vector_store(format!("search: {e}")))?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|hit| {
                let id = point_id_to_i64(hit.id)?;
                Some(ScoredPoint {
                    id,
                    score: hit.score,
                    payload: payload_to_json(hit.payload),
                })
            })
            .collect())
    }

    async fn delete(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(Self::ids_selector(ids))
                    .wait(true)
                    .ordering(Self::write_ordering()),
            )
            .await
            .map_err(|e| RecallError::vector_store(format!("delete: {e}")))?;
        Ok(())
    }

    async fn set_payload(&self, id: i64, payload: serde_json::Value) -> Result<()> {
        let payload = Payload::try_from(payload)
            .map_err(|e| RecallError::vector_store(format!("payload encode: {e}")))?;
        self.client
            .overwrite_payload(
                SetPayloadPointsBuilder::new(&self.collection, payload)
                    .points_selector(Self::ids_selector(&[id]))
                    .wait(true),
            )
            .await
            .map_err(|e| RecallError::vector_store(format!("set payload: {e}")))?;
        Ok(())
    }

    async fn scroll(
        &self,
        offset: Option<i64>,
        limit: usize,
    ) -> Result<(Vec<PayloadPoint>, Option<i64>)> {
        let mut builder = ScrollPointsBuilder::new(&self.collection)
            .limit(limit as u32)
            .with_payload(true);
        if let Some(offset) = offset {
            builder = builder.offset(PointId::from(offset as u64));
        }

        let response = self
            .client
            .scroll(builder)
            .await
            .map_err(|e| RecallError::vector_store(format!("scroll: {e}")))?;

        let next_offset = point_id_to_i64(response.next_page_offset);
        let points = response
            .result
            .into_iter()
            .filter_map(|point| {
                let id = point_id_to_i64(point.id)?;
                Some(PayloadPoint {
                    id,
                    payload: payload_to_json(point.payload),
                })
            })
            .collect();
        Ok((points, next_offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> QdrantSettings {
        QdrantSettings {
            url: Some("http://localhost:6334".to_string()),
            api_key: None,
            collection: "recall_test".to_string(),
            replication_factor: 1,
            write_consistency_factor: 1,
            timeout_seconds: 5,
            max_retries: 0,
        }
    }

    #[tokio::test]
    #[ignore] // Requires running Qdrant instance
    async fn test_collection_lifecycle() {
        let store = QdrantVectorStore::connect(test_settings()).await.unwrap();
        store.recreate_collection(4).await.unwrap();
        assert_eq!(store.dimension().await.unwrap(), Some(4));
        assert_eq!(store.count().await.unwrap(), 0);

        store
            .upsert(vec![VectorPoint {
                id: 1,
                vector: vec![1.0, 0.0, 0.0, 0.0],
                payload: serde_json::json!({"text": "hello"}),
            }])
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        let hits = store.search(&[1.0, 0.0, 0.0, 0.0], 1, None).await.unwrap();
        assert_eq!(hits[0].id, 1);

        store.delete(&[1]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
