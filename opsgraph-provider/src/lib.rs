//! The provider adapter interface.
//!
//! A provider adapter performs the actual create/read/update/delete against
//! one external system. The executor talks to adapters exclusively through
//! [`ProviderAdapter`], and relies on [`ProviderError`]'s classification to
//! decide whether an operation is worth retrying.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use opsgraph_core::PhysicalId;

/// Whether an error is expected to succeed on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeouts, throttling: retry per policy.
    Transient,
    /// Validation rejections, permission errors: a retry of the same
    /// request will not succeed.
    NonTransient,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub class: ErrorClass,
    message: String,
}

impl ProviderError {
    pub fn transient(message: impl std::fmt::Display) -> Self {
        ProviderError {
            class: ErrorClass::Transient,
            message: message.to_string(),
        }
    }

    pub fn non_transient(message: impl std::fmt::Display) -> Self {
        ProviderError {
            class: ErrorClass::NonTransient,
            message: message.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResponse {
    pub physical_id: PhysicalId,
    pub outputs: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResponse {
    pub outputs: BTreeMap<String, Value>,
}

/// One adapter per external system. An adapter may serve several resource
/// types; the `type_tag` parameter selects among them.
///
/// All four operations may fail with either error class. `delete` of a
/// resource that is already gone is expected to succeed: teardown must be
/// idempotent.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn create(
        &self,
        type_tag: &str,
        properties: &BTreeMap<String, Value>,
    ) -> ProviderResult<CreateResponse>;

    /// Read the current properties of an existing resource, or `None` if it
    /// no longer exists on the provider side.
    async fn read(
        &self,
        type_tag: &str,
        physical_id: &PhysicalId,
    ) -> ProviderResult<Option<BTreeMap<String, Value>>>;

    async fn update(
        &self,
        type_tag: &str,
        physical_id: &PhysicalId,
        properties: &BTreeMap<String, Value>,
    ) -> ProviderResult<UpdateResponse>;

    async fn delete(&self, type_tag: &str, physical_id: &PhysicalId) -> ProviderResult<()>;
}

impl std::fmt::Debug for dyn ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProviderAdapter")
    }
}

/// Type tag to adapter dispatch.
///
/// Explicit configuration passed to the executor at construction; there is
/// no ambient registry.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` for `type_tag`, replacing any previous adapter
    /// for that tag.
    pub fn register(&mut self, type_tag: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(type_tag.into(), adapter);
    }

    /// Look up the adapter for a type tag. An unknown tag is a
    /// non-transient error: retrying will not make a provider appear.
    pub fn get(&self, type_tag: &str) -> ProviderResult<Arc<dyn ProviderAdapter>> {
        self.adapters.get(type_tag).cloned().ok_or_else(|| {
            ProviderError::non_transient(format!("no provider registered for type {}", type_tag))
        })
    }

    pub fn type_tags(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(|s| s.as_str())
    }
}
