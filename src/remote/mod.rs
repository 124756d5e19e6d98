//! Remote document store interface.
//!
//! The concrete transport lives outside this crate; everything here talks to
//! a [`RemoteStore`]. [`MemoryStore`] is a complete in-process implementation
//! used by tests and by the CLI.

mod document;
mod memory;
mod query;

pub use document::Document;
pub use memory::MemoryStore;
pub use query::{compare_values, Clause, Filter, FilterOp, ListQuery, OrderBy};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::RemoteError;

/// Batches pushed by a live subscription. Each item is the full current result
/// set of the subscribed target.
pub type DocumentStream = BoxStream<'static, Result<Vec<Document>, RemoteError>>;

/// Location of a single document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentPath {
  pub collection: String,
  pub id: String,
}

impl DocumentPath {
  pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      id: id.into(),
    }
  }
}

impl fmt::Display for DocumentPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.collection, self.id)
  }
}

/// What a live subscription watches: a whole (optionally filtered) collection
/// or one document.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionTarget {
  pub collection: String,
  pub document: Option<String>,
  pub filter: Option<Filter>,
}

impl SubscriptionTarget {
  pub fn collection(collection: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      document: None,
      filter: None,
    }
  }

  pub fn document(collection: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      document: Some(id.into()),
      filter: None,
    }
  }

  pub fn with_filter(mut self, filter: Filter) -> Self {
    self.filter = if filter.is_empty() { None } else { Some(filter) };
    self
  }

  /// True for an unfiltered collection target, whose pushes describe the
  /// entire collection.
  pub fn is_whole_collection(&self) -> bool {
    self.document.is_none() && self.filter.is_none()
  }

  /// Human-readable description, stable for equal targets.
  pub fn describe(&self) -> String {
    let mut out = self.collection.clone();
    if let Some(id) = &self.document {
      out.push('/');
      out.push_str(id);
    }
    if let Some(filter) = &self.filter {
      out.push_str(" where ");
      out.push_str(&filter.describe());
    }
    out
  }

  /// Registry key derived from the target, so subscribing twice to the same
  /// target replaces the first subscription.
  pub fn derived_key(&self) -> String {
    // SHA256 for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(self.describe().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}:{}", self.collection, &digest[..16])
  }
}

/// Request/response and push primitives of the remote document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Fetch one document. A missing document is `Ok(None)`, not an error.
  async fn fetch(&self, path: &DocumentPath) -> Result<Option<Document>, RemoteError>;

  /// Fetch a collection, applying the query's filter and order remotely.
  async fn fetch_many(&self, collection: &str, query: &ListQuery) -> Result<Vec<Document>, RemoteError>;

  /// Create or overwrite a document.
  async fn write(&self, path: &DocumentPath, data: Value) -> Result<(), RemoteError>;

  async fn delete(&self, path: &DocumentPath) -> Result<(), RemoteError>;

  /// Open a push channel. Dropping the stream cancels it.
  async fn subscribe(&self, target: &SubscriptionTarget) -> Result<DocumentStream, RemoteError>;
}
