//! Capability contracts consumed by the council
//!
//! The council never generates text, embeds or retrieves by itself. Hosts plug
//! in implementations of these traits (HTTP clients, local models, fakes).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure reported by an external collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("rate limited")]
    RateLimited,
    #[error("timeout")]
    Timeout,
    #[error("service error: {0}")]
    Service(String),
}

impl ServiceError {
    pub fn kind(&self) -> ServiceErrorKind {
        match self {
            Self::RateLimited => ServiceErrorKind::RateLimited,
            Self::Timeout => ServiceErrorKind::Timeout,
            Self::Service(_) => ServiceErrorKind::ServiceError,
        }
    }
}

/// Discriminant of [`ServiceError`], kept on records and task failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceErrorKind {
    RateLimited,
    Timeout,
    ServiceError,
}

impl ServiceErrorKind {
    /// Short marker used in context annotations, e.g. `finance: timeout`
    pub fn marker(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate-limited",
            Self::Timeout => "timeout",
            Self::ServiceError => "service-error",
        }
    }
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

/// Response shape hint passed along with a generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSchema {
    pub name: String,
    pub required_keys: Vec<String>,
}

/// Text generation capability
#[async_trait]
pub trait TextGenerationService: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        response_schema: Option<&ResponseSchema>,
    ) -> Result<String, ServiceError>;
}

#[async_trait]
impl<T: TextGenerationService + ?Sized> TextGenerationService for Arc<T> {
    async fn generate(
        &self,
        prompt: &str,
        response_schema: Option<&ResponseSchema>,
    ) -> Result<String, ServiceError> {
        (**self).generate(prompt, response_schema).await
    }
}

/// Document retrieval capability
#[async_trait]
pub trait RetrievalService: Send + Sync {
    /// Most relevant chunks first
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<String>, ServiceError>;
}

#[async_trait]
impl<T: RetrievalService + ?Sized> RetrievalService for Arc<T> {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<String>, ServiceError> {
        (**self).retrieve(query, top_k).await
    }
}

/// Equality filter over top-level payload fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexFilter {
    conditions: BTreeMap<String, String>,
}

impl IndexFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.conditions.insert(field.into(), value.into());
        self
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.conditions.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether a payload satisfies every condition. String fields compare
    /// verbatim, other scalars by their JSON rendering.
    pub fn matches(&self, payload: &Value) -> bool {
        self.conditions.iter().all(|(field, expected)| match payload.get(field) {
            Some(Value::String(actual)) => actual == expected,
            Some(other) => other.to_string() == *expected,
            None => false,
        })
    }
}

/// One hit returned by [`EmbeddingIndex::query`]
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatch {
    pub payload: Value,
    pub score: f32,
}

/// Vector store capability
#[async_trait]
pub trait EmbeddingIndex: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError>;

    /// Insert or replace the entry stored under `key`
    async fn upsert(&self, key: &str, vector: Vec<f32>, payload: Value) -> Result<(), ServiceError>;

    /// Highest score first
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<IndexMatch>, ServiceError>;
}

#[async_trait]
impl<T: EmbeddingIndex + ?Sized> EmbeddingIndex for Arc<T> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        (**self).embed(text).await
    }

    async fn upsert(&self, key: &str, vector: Vec<f32>, payload: Value) -> Result<(), ServiceError> {
        (**self).upsert(key, vector, payload).await
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<IndexMatch>, ServiceError> {
        (**self).query(vector, top_k, filter).await
    }
}
