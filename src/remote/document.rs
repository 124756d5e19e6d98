use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

/// A raw document as exchanged with the remote store.
///
/// Object payloads always carry their id under the `"id"` field so filters
/// and ordering can address it like any other field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  pub id: String,
  pub data: Value,
}

impl Document {
  pub fn new(id: impl Into<String>, data: Value) -> Self {
    let id = id.into();
    let mut data = data;
    if let Value::Object(map) = &mut data {
      map
        .entry("id")
        .or_insert_with(|| Value::String(id.clone()));
    }
    Self { id, data }
  }

  /// Serialize a typed value into a document.
  pub fn encode<T: Serialize>(id: impl Into<String>, value: &T) -> Result<Self, DecodeError> {
    let id = id.into();
    let data = serde_json::to_value(value).map_err(|e| DecodeError::new(id.clone(), e))?;
    Ok(Self::new(id, data))
  }

  /// Parse the document into `T`. `collection` only labels the error.
  pub fn decode<T: DeserializeOwned>(&self, collection: &str) -> Result<T, DecodeError> {
    serde_json::from_value(self.data.clone())
      .map_err(|e| DecodeError::new(format!("{}/{}", collection, self.id), e))
  }

  /// Top-level field lookup.
  pub fn field(&self, name: &str) -> Option<&Value> {
    self.data.get(name)
  }
}
