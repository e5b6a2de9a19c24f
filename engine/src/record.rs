//! Record types for cached data.

use crate::{error::Result, is_virtual, Error, Namespace, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field map of a record.
pub type Fields = serde_json::Map<String, Value>;

/// How a cached record relates to the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Residency {
    /// The server has (or had) a row for it.
    #[default]
    Durable,
    /// Optimistic create that has not been confirmed yet.
    Pending,
    /// Unsaved search result; no durable row exists.
    Ephemeral,
}

/// A record in a cached collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Identifier, persisted or virtual
    pub id: RecordId,
    /// Namespace the id belongs to
    pub namespace: Namespace,
    /// The data the UI renders
    pub fields: Fields,
    /// Full source payload for virtual records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_snapshot: Option<Value>,
    /// Relationship to the backing store
    #[serde(default)]
    pub residency: Residency,
}

impl Record {
    /// A server-backed record.
    pub fn persisted(id: RecordId, fields: Fields) -> Self {
        Self {
            id,
            namespace: Namespace::of(id),
            fields,
            source_snapshot: None,
            residency: Residency::Durable,
        }
    }

    /// A virtual record rebuilt from a stored snapshot blob.
    ///
    /// The fields are exactly the snapshot's top-level fields.
    pub fn from_snapshot(id: RecordId, snapshot: Value) -> Self {
        let fields = match &snapshot {
            Value::Object(map) => map.clone(),
            _ => Fields::new(),
        };
        Self {
            id,
            namespace: Namespace::Virtual,
            fields,
            source_snapshot: Some(snapshot),
            residency: Residency::Durable,
        }
    }

    /// An unsaved search result.
    pub fn ephemeral(id: RecordId, fields: Fields) -> Self {
        Self {
            id,
            namespace: Namespace::Virtual,
            source_snapshot: Some(Value::Object(fields.clone())),
            fields,
            residency: Residency::Ephemeral,
        }
    }

    /// An optimistic create awaiting its server id.
    pub fn pending(id: RecordId, fields: Fields) -> Self {
        Self {
            id,
            namespace: Namespace::Virtual,
            fields,
            source_snapshot: None,
            residency: Residency::Pending,
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.namespace == Namespace::Virtual
    }

    /// Whether remote absence may remove this record from the cache.
    pub fn is_durable(&self) -> bool {
        self.residency == Residency::Durable
    }

    /// The blob to store when saving this record.
    pub fn snapshot_blob(&self) -> Value {
        self.source_snapshot
            .clone()
            .unwrap_or_else(|| Value::Object(self.fields.clone()))
    }
}

/// A record as the record store service returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Fields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Value>,
}

impl StoredRecord {
    /// Convert a wire row into a cached record.
    ///
    /// Virtual ids must carry their snapshot, persisted ids their fields.
    pub fn into_record(self) -> Result<Record> {
        if is_virtual(self.id) {
            let snapshot = self.snapshot.ok_or_else(|| Error::InvalidStoredRecord {
                id: self.id,
                reason: "virtual record without snapshot".into(),
            })?;
            Ok(Record::from_snapshot(self.id, snapshot))
        } else {
            Ok(Record::persisted(self.id, self.fields.unwrap_or_default()))
        }
    }
}
