//! Items and the keys that address them in the store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{BulkError, BulkResult};
use crate::store::OperationType;

/// Store address of an item: identifier plus optional partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemKey {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
}

impl ItemKey {
    pub fn new(id: impl Into<String>, partition_key: Option<String>) -> Self {
        Self {
            id: id.into(),
            partition_key,
        }
    }

    /// Deterministic operation identifier for this key.
    ///
    /// Identical for every attempt of the same logical operation, so a store can recognize
    /// a resubmission of a write it already applied. Every field is length-prefixed and a
    /// missing partition key hashes differently from an empty one.
    pub fn idempotency_token(&self, operation: OperationType) -> String {
        let mut hasher = Sha256::new();
        hash_field(&mut hasher, operation.to_string().as_bytes());
        hash_field(&mut hasher, self.id.as_bytes());
        match &self.partition_key {
            Some(pk) => {
                hasher.update([1u8]);
                hash_field(&mut hasher, pk.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        format!("{:x}", hasher.finalize())
    }
}

fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.partition_key {
            Some(pk) => write!(f, "{}@{}", self.id, pk),
            None => write!(f, "{}", self.id),
        }
    }
}

/// An opaque document plus its derived key. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Item {
    pub key: ItemKey,
    pub payload: Value,
}

impl Item {
    pub fn new(key: ItemKey, payload: Value) -> Self {
        Self { key, payload }
    }

    /// Derive the key of `document` (the `index`-th input) from the id field and
    /// partition key path.
    pub fn from_document(
        index: usize,
        document: Value,
        id_field: &str,
        partition_key_path: &str,
    ) -> BulkResult<Self> {
        if !document.is_object() {
            return Err(BulkError::InvalidDocument {
                index,
                details: "document is not a JSON object".to_string(),
            });
        }

        let id = match document.get(id_field) {
            Some(value) => scalar_to_string(value).ok_or_else(|| BulkError::InvalidDocument {
                index,
                details: format!("field '{}' is not a scalar", id_field),
            })?,
            None => {
                return Err(BulkError::MissingField {
                    field: id_field.to_string(),
                    index,
                });
            }
        };

        let partition_key = match normalize_path(partition_key_path) {
            None => None,
            Some(pointer) => {
                let value = document
                    .pointer(&pointer)
                    .ok_or_else(|| BulkError::MissingField {
                        field: pointer.clone(),
                        index,
                    })?;
                Some(
                    scalar_to_string(value).ok_or_else(|| BulkError::InvalidDocument {
                        index,
                        details: format!("partition key '{}' is not a scalar", pointer),
                    })?,
                )
            }
        };

        Ok(Self {
            key: ItemKey { id, partition_key },
            payload: document,
        })
    }
}

/// Build items for a whole input set, failing on the first unaddressable document.
pub fn build_items(
    documents: Vec<Value>,
    id_field: &str,
    partition_key_path: &str,
) -> BulkResult<Vec<Item>> {
    documents
        .into_iter()
        .enumerate()
        .map(|(index, document)| Item::from_document(index, document, id_field, partition_key_path))
        .collect()
}

fn normalize_path(path: &str) -> Option<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return None;
    }
    if trimmed.starts_with('/') {
        Some(trimmed.to_string())
    } else {
        Some(format!("/{}", trimmed))
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
