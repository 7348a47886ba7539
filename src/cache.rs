//! Two-tier result cache
//!
//! Exact lookups address entries by a content hash of the normalized query,
//! the task name and the cache epoch bucket. Similarity lookups embed the query
//! and search the index scoped to one schema. Writes are upserts: the same key
//! written twice in one bucket is a last-write-wins overwrite.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::{CacheConfig, CacheEpoch};
use crate::extractor::{SchemaId, StructuredRecord};
use crate::services::{EmbeddingIndex, IndexFilter};
use crate::types::TaskName;

/// A stored analysis result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub query: String,
    pub task: TaskName,
    pub schema_id: SchemaId,
    pub epoch: String,
    pub timestamp: DateTime<Utc>,
    pub record: StructuredRecord,
}

/// Result of a [`ResultCache::put`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub key: String,
    pub stored: bool,
}

/// One similarity hit
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarRecord {
    pub record: StructuredRecord,
    pub similarity: f32,
    pub query: String,
    pub task: TaskName,
    pub timestamp: DateTime<Utc>,
}

/// Collapse whitespace and case so cosmetic query differences share a key
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Parse a stored payload, dropping entries whose record breaks its invariants
fn decode_entry(payload: serde_json::Value) -> Option<CacheEntry> {
    match serde_json::from_value::<CacheEntry>(payload) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!(error = %e, "Dropping unreadable cache entry");
            None
        }
    }
}

/// Cache front-end over an [`EmbeddingIndex`]
pub struct ResultCache {
    index: Arc<dyn EmbeddingIndex>,
    config: CacheConfig,
}

impl ResultCache {
    pub fn new(index: Arc<dyn EmbeddingIndex>, config: CacheConfig) -> Self {
        Self { index, config }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Current epoch bucket label
    pub fn bucket(&self) -> String {
        match &self.config.epoch {
            CacheEpoch::Daily => Utc::now().date_naive().to_string(),
            CacheEpoch::Fixed(label) => label.clone(),
        }
    }

    /// Deterministic key for `(query, task)` in the current bucket
    pub fn key_for(&self, query: &str, task: TaskName) -> String {
        Self::key_in_bucket(query, task, &self.bucket())
    }

    pub fn key_in_bucket(query: &str, task: TaskName, bucket: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalize_query(query).as_bytes());
        hasher.update(b"|");
        hasher.update(task.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(bucket.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Store a record. Failures are reported through `stored`, never raised.
    pub async fn put(&self, query: &str, task: TaskName, record: &StructuredRecord) -> PutOutcome {
        let epoch = self.bucket();
        let key = Self::key_in_bucket(query, task, &epoch);

        let embedding = match self.index.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(task = %task, key = %key, error = %e, "Cache embedding failed");
                return PutOutcome { key, stored: false };
            }
        };

        let entry = CacheEntry {
            key: key.clone(),
            embedding,
            query: query.to_string(),
            task,
            schema_id: record.schema_id(),
            epoch,
            timestamp: Utc::now(),
            record: record.clone(),
        };

        let payload = match serde_json::to_value(&entry) {
            Ok(p) => p,
            Err(e) => {
                warn!(task = %task, key = %key, error = %e, "Cache entry serialization failed");
                return PutOutcome { key, stored: false };
            }
        };

        match self.index.upsert(&key, entry.embedding, payload).await {
            Ok(()) => {
                debug!(task = %task, key = %key, "Cached result");
                PutOutcome { key, stored: true }
            }
            Err(e) => {
                warn!(task = %task, key = %key, error = %e, "Cache write failed");
                PutOutcome { key, stored: false }
            }
        }
    }

    /// Record stored under the exact `(query, task)` key of the current bucket
    pub async fn get_exact(&self, query: &str, task: TaskName) -> Option<StructuredRecord> {
        let key = self.key_for(query, task);
        let vector = match self.index.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(task = %task, error = %e, "Cache lookup embedding failed");
                return None;
            }
        };

        let filter = IndexFilter::new().eq("key", key.as_str());
        let matches = match self.index.query(&vector, 1, &filter).await {
            Ok(m) => m,
            Err(e) => {
                warn!(task = %task, error = %e, "Cache exact lookup failed");
                return None;
            }
        };

        matches
            .into_iter()
            .filter_map(|m| decode_entry(m.payload))
            .find(|entry| entry.key == key)
            .map(|entry| entry.record)
    }

    /// Nearest stored records for `schema_id`, most similar first.
    /// Equal similarity is broken by the most recent timestamp.
    pub async fn get_similar(
        &self,
        query: &str,
        schema_id: SchemaId,
        top_k: usize,
    ) -> Vec<SimilarRecord> {
        if top_k == 0 {
            return Vec::new();
        }

        let vector = match self.index.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(schema = %schema_id, error = %e, "Similarity embedding failed");
                return Vec::new();
            }
        };

        let filter = IndexFilter::new().eq("schema_id", schema_id.as_str());
        let mut fetch = top_k;
        let matches = loop {
            let matches = match self.index.query(&vector, fetch, &filter).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(schema = %schema_id, error = %e, "Similarity lookup failed");
                    return Vec::new();
                }
            };
            // Widen the window until every entry tied with the score at the
            // cut is visible, so recency can break the tie.
            let exhausted = matches.len() < fetch;
            let tied_at_cut = match (matches.get(top_k - 1), matches.last()) {
                (Some(cut), Some(last)) => last.score >= cut.score,
                _ => false,
            };
            if exhausted || !tied_at_cut || fetch == usize::MAX {
                break matches;
            }
            fetch = fetch.saturating_mul(2);
        };

        let mut hits: Vec<SimilarRecord> = matches
            .into_iter()
            .filter_map(|m| {
                let entry = decode_entry(m.payload)?;
                (entry.schema_id == schema_id).then(|| SimilarRecord {
                    record: entry.record,
                    similarity: m.score,
                    query: entry.query,
                    task: entry.task,
                    timestamp: entry.timestamp,
                })
            })
            .collect();

        hits.sort_by(|a, b| match b.similarity.total_cmp(&a.similarity) {
            Ordering::Equal => b.timestamp.cmp(&a.timestamp),
            other => other,
        });
        hits.truncate(top_k);
        hits
    }

    /// Similarity lookup using the configured default depth
    pub async fn get_similar_default(&self, query: &str, schema_id: SchemaId) -> Vec<SimilarRecord> {
        self.get_similar(query, schema_id, self.config.similar_top_k).await
    }
}
