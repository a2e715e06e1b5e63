//! Qdrant wrapper for the dual case/issue collections.
//!
//! Both collections are cosine-distance at the deployment's embedding
//! dimension. A dimension mismatch against an existing collection is a fatal
//! startup error - serving queries against the wrong geometry would return
//! garbage with healthy-looking status codes.

use qdrant_client::Payload;
use qdrant_client::Qdrant;
use qdrant_client::qdrant::vectors_config::Config as VectorsConfigKind;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointStruct,
    SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
    value::Kind,
};
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::VectorConfig;
use crate::models::SearchFilters;
use crate::utils::{ApiError, ApiResult};

pub struct VectorStore {
    client: Qdrant,
    pub case_collection: String,
    pub issue_collection: String,
    vector_size: u64,
}

/// One scored hit with its JSON payload
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub score: f32,
    pub payload: serde_json::Value,
}

impl VectorStore {
    pub fn connect(config: &VectorConfig) -> ApiResult<Self> {
        let client = Qdrant::from_url(&config.url)
            .build()
            .map_err(|e| ApiError::vector_store(format!("failed to connect: {}", e)))?;

        Ok(Self {
            client,
            case_collection: config.case_collection.clone(),
            issue_collection: config.issue_collection.clone(),
            vector_size: config.vector_size,
        })
    }

    /// Create missing collections; verify dimensions of existing ones.
    pub async fn ensure_collections(&self) -> ApiResult<()> {
        for name in [&self.case_collection, &self.issue_collection] {
            let exists = self
                .client
                .collection_exists(name)
                .await
                .map_err(|e| ApiError::vector_store(e.to_string()))?;

            if !exists {
                tracing::info!("Creating collection '{}' ({}d cosine)", name, self.vector_size);
                self.client
                    .create_collection(
                        CreateCollectionBuilder::new(name.clone()).vectors_config(
                            VectorParamsBuilder::new(self.vector_size, Distance::Cosine),
                        ),
                    )
                    .await
                    .map_err(|e| ApiError::vector_store(e.to_string()))?;
                continue;
            }

            let configured = self.collection_vector_size(name).await?;
            if let Some(size) = configured
                && size != self.vector_size
            {
                return Err(ApiError::vector_store(format!(
                    "collection '{}' has dimension {} but the deployment expects {}",
                    name, size, self.vector_size
                )));
            }
            tracing::info!("Collection '{}' exists", name);
        }
        Ok(())
    }

    async fn collection_vector_size(&self, name: &str) -> ApiResult<Option<u64>> {
        let info = self
            .client
            .collection_info(name)
            .await
            .map_err(|e| ApiError::vector_store(e.to_string()))?;

        let size = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config)
            .and_then(|cfg| match cfg {
                VectorsConfigKind::Params(params) => Some(params.size),
                VectorsConfigKind::ParamsMap(_) => None,
            });

        Ok(size)
    }

    pub async fn upsert_point(
        &self,
        collection: &str,
        vector: Vec<f32>,
        payload: serde_json::Value,
    ) -> ApiResult<String> {
        let point_id = Uuid::new_v4().to_string();
        let payload = Payload::try_from(payload)
            .map_err(|e| ApiError::vector_store(format!("invalid payload: {}", e)))?;
        let point = PointStruct::new(point_id.clone(), vector, payload);

        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, vec![point]).wait(true))
            .await
            .map_err(|e| ApiError::vector_store(e.to_string()))?;

        Ok(point_id)
    }

    pub async fn upsert_points(
        &self,
        collection: &str,
        entries: Vec<(Vec<f32>, serde_json::Value)>,
    ) -> ApiResult<Vec<String>> {
        let mut point_ids = Vec::with_capacity(entries.len());
        let mut points = Vec::with_capacity(entries.len());
        for (vector, payload) in entries {
            let point_id = Uuid::new_v4().to_string();
            let payload = Payload::try_from(payload)
                .map_err(|e| ApiError::vector_store(format!("invalid payload: {}", e)))?;
            points.push(PointStruct::new(point_id.clone(), vector, payload));
            point_ids.push(point_id);
        }

        if !points.is_empty() {
            self.client
                .upsert_points(UpsertPointsBuilder::new(collection, points).wait(true))
                .await
                .map_err(|e| ApiError::vector_store(e.to_string()))?;
        }

        Ok(point_ids)
    }

    /// Remove every point of a case from both collections
    pub async fn delete_case(&self, case_id: &str) -> ApiResult<()> {
        for name in [&self.case_collection, &self.issue_collection] {
            let filter = Filter::must([Condition::matches("case_id", case_id.to_string())]);
            self.client
                .delete_points(DeletePointsBuilder::new(name.clone()).points(filter).wait(true))
                .await
                .map_err(|e| ApiError::vector_store(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        score_threshold: f32,
        filters: Option<&SearchFilters>,
    ) -> ApiResult<Vec<VectorHit>> {
        let mut builder = SearchPointsBuilder::new(collection, vector, limit)
            .score_threshold(score_threshold)
            .with_payload(true);

        if let Some(filter) = filters.and_then(build_filter) {
            builder = builder.filter(filter);
        }

        let response = self
            .client
            .search_points(builder)
            .await
            .map_err(|e| ApiError::vector_store(e.to_string()))?;

        Ok(response
            .result
            .into_iter()
            .map(|point| VectorHit {
                score: point.score,
                payload: payload_to_json(point.payload),
            })
            .collect())
    }

    pub async fn point_count(&self, collection: &str) -> ApiResult<u64> {
        let info = self
            .client
            .collection_info(collection)
            .await
            .map_err(|e| ApiError::vector_store(e.to_string()))?;
        Ok(info.result.and_then(|r| r.points_count).unwrap_or(0))
    }
}

fn build_filter(filters: &SearchFilters) -> Option<Filter> {
    let mut conditions = Vec::new();

    if let Some(part_number) = &filters.part_number {
        conditions.push(Condition::matches("part_number", part_number.clone()));
    }
    if let Some(trial_version) = &filters.trial_version {
        conditions.push(Condition::matches("trial_version", trial_version.clone()));
    }
    if let Some(result) = &filters.result {
        conditions.push(Condition::matches("result_t1", result.clone()));
    }

    if conditions.is_empty() { None } else { Some(Filter::must(conditions)) }
}

fn payload_to_json(payload: HashMap<String, QdrantValue>) -> serde_json::Value {
    let mut map = serde_json::Map::with_capacity(payload.len());
    for (key, value) in payload {
        map.insert(key, qdrant_value_to_json(value));
    }
    serde_json::Value::Object(map)
}

fn qdrant_value_to_json(value: QdrantValue) -> serde_json::Value {
    match value.kind {
        Some(Kind::NullValue(_)) | None => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::IntegerValue(i)) => serde_json::Value::from(i),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::ListValue(list)) => serde_json::Value::Array(
            list.values.into_iter().map(qdrant_value_to_json).collect(),
        ),
        Some(Kind::StructValue(obj)) => {
            let mut map = serde_json::Map::with_capacity(obj.fields.len());
            for (key, value) in obj.fields {
                map.insert(key, qdrant_value_to_json(value));
            }
            serde_json::Value::Object(map)
        }
    }
}
