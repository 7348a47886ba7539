//! In-process embedding index
//!
//! A small [`EmbeddingIndex`] that keeps vectors in memory and embeds text by
//! hashing tokens into a fixed number of buckets. Useful for local runs and
//! tests; production hosts plug in a real vector store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::services::{EmbeddingIndex, IndexFilter, IndexMatch, ServiceError};

const DEFAULT_DIMENSIONS: usize = 256;

#[derive(Debug, Clone)]
struct StoredVector {
    vector: Vec<f32>,
    payload: Value,
}

/// Hashed bag-of-words index with cosine scoring
pub struct InMemoryIndex {
    dimensions: usize,
    entries: RwLock<HashMap<String, StoredVector>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::with_dimensions(DEFAULT_DIMENSIONS)
    }

    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Stored payload for a key
    pub fn payload(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).map(|e| e.payload.clone())
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(prefix) % self.dimensions as u64) as usize
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[self.bucket(&token.to_lowercase())] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl EmbeddingIndex for InMemoryIndex {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        Ok(self.embed_text(text))
    }

    async fn upsert(&self, key: &str, vector: Vec<f32>, payload: Value) -> Result<(), ServiceError> {
        if vector.len() != self.dimensions {
            return Err(ServiceError::Service(format!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                self.dimensions
            )));
        }
        self.entries
            .write()
            .insert(key.to_string(), StoredVector { vector, payload });
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<IndexMatch>, ServiceError> {
        let mut scored: Vec<(String, IndexMatch)> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| filter.matches(&entry.payload))
            .map(|(key, entry)| {
                let hit = IndexMatch {
                    payload: entry.payload.clone(),
                    score: cosine(vector, &entry.vector),
                };
                (key.clone(), hit)
            })
            .collect();

        // Equal scores fall back to key order so the cut is deterministic
        scored.sort_by(|(ka, a), (kb, b)| b.score.total_cmp(&a.score).then_with(|| ka.cmp(kb)));
        scored.truncate(top_k);
        Ok(scored.into_iter().map(|(_, hit)| hit).collect())
    }
}
