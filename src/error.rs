//! Error taxonomy for the data-access layer.

use thiserror::Error;

use crate::model::{ActionKind, EntityKind};

/// Failure reported by a remote store client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
  /// The network path to the store is down
  #[error("remote store unreachable")]
  Unreachable,
  /// The store answered with a failure
  #[error("remote store error: {0}")]
  Server(String),
  /// The store refused the request (validation, rules, quota)
  #[error("remote store rejected request: {0}")]
  Rejected(String),
  /// A local cleanup cancelled the request before it was registered
  #[error("cancelled before completion")]
  Cancelled,
}

impl RemoteError {
  /// Whether the failure is a connectivity problem an offline queue could retry.
  pub fn is_unreachable(&self) -> bool {
    matches!(self, Self::Unreachable)
  }
}

/// A document could not be parsed into the expected type.
#[derive(Debug, Error)]
#[error("failed to decode document {path}: {source}")]
pub struct DecodeError {
  pub path: String,
  #[source]
  pub source: serde_json::Error,
}

impl DecodeError {
  pub fn new(path: impl Into<String>, source: serde_json::Error) -> Self {
    Self {
      path: path.into(),
      source,
    }
  }
}

/// Error returned by every facade operation.
#[derive(Debug, Error)]
pub enum DataError {
  #[error("not authorized to {action} {entity}")]
  Unauthorized {
    action: ActionKind,
    entity: EntityKind,
  },

  /// Raised only by writes that require an existing document
  #[error("{entity} '{id}' not found")]
  NotFound { entity: EntityKind, id: String },

  #[error(transparent)]
  Decode(#[from] DecodeError),

  #[error(transparent)]
  Transport(#[from] RemoteError),
}

impl DataError {
  pub fn is_unauthorized(&self) -> bool {
    matches!(self, Self::Unauthorized { .. })
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound { .. })
  }
}

pub type DataResult<T> = std::result::Result<T, DataError>;
