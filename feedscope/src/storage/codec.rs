//! Chunked record codec shared by both table backends.
//!
//! An entity is stored as its JSON encoding split into binary chunks so that
//! no single property exceeds the remote service's 64 KiB limit:
//!
//! ```text
//! { isProto: false, dataChunks: N, dataChunk_0 .. dataChunk_{N-1}, extra_<name>... }
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use super::{ExtraFields, ExtraValue};
use crate::error::{FeedscopeError, Result};

pub const CHUNK_SIZE: usize = 64_000;
pub const MAX_CHUNKS: usize = 15;
pub const EXTRA_PREFIX: &str = "extra_";
pub const IS_PROTO_FIELD: &str = "isProto";
pub const DATA_CHUNKS_FIELD: &str = "dataChunks";

pub fn chunk_field(index: usize) -> String {
    format!("dataChunk_{}", index)
}

/// Scalar property of a table record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
}

impl From<&ExtraValue> for FieldValue {
    fn from(value: &ExtraValue) -> Self {
        match value {
            ExtraValue::Text(s) => FieldValue::Text(s.clone()),
            ExtraValue::Int(n) => FieldValue::Int(*n),
        }
    }
}

/// One row of a table: keys plus named properties.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRecord {
    pub partition_key: String,
    pub row_key: String,
    pub fields: BTreeMap<String, FieldValue>,
}

/// Encode `entity` into a chunked record. Fails without side effects when the
/// payload needs more than [`MAX_CHUNKS`] chunks.
pub fn encode_entity<T: Serialize>(
    entity: &T,
    partition: &str,
    row_key: &str,
    extra: Option<&ExtraFields>,
) -> Result<TableRecord> {
    let payload = serde_json::to_vec(entity)?;
    let chunk_count = payload.len().div_ceil(CHUNK_SIZE).max(1);
    if chunk_count > MAX_CHUNKS {
        return Err(FeedscopeError::StorageCapacity {
            key: row_key.to_string(),
            chunks: chunk_count,
            max: MAX_CHUNKS,
        });
    }

    let mut fields = BTreeMap::new();
    fields.insert(IS_PROTO_FIELD.to_string(), FieldValue::Bool(false));
    fields.insert(DATA_CHUNKS_FIELD.to_string(), FieldValue::Int(chunk_count as i64));
    for (index, chunk) in payload.chunks(CHUNK_SIZE).enumerate() {
        fields.insert(chunk_field(index), FieldValue::Binary(chunk.to_vec()));
    }

    if let Some(extra) = extra {
        for (name, value) in extra {
            fields.insert(format!("{}{}", EXTRA_PREFIX, name), value.into());
        }
    }

    Ok(TableRecord {
        partition_key: partition.to_string(),
        row_key: row_key.to_string(),
        fields,
    })
}

/// Decode a chunked record. Every malformed shape yields `None` and a log
/// line; this never fails.
pub fn decode_entity<T: DeserializeOwned>(record: &TableRecord) -> Option<T> {
    let location = format!("{}/{}", record.partition_key, record.row_key);

    match record.fields.get(IS_PROTO_FIELD) {
        Some(FieldValue::Bool(false)) => {}
        Some(FieldValue::Bool(true)) => {
            warn!("record {}: protobuf payloads are not supported", location);
            return None;
        }
        _ => {
            warn!("record {}: missing or invalid {}", location, IS_PROTO_FIELD);
            return None;
        }
    }

    let chunk_count = match record.fields.get(DATA_CHUNKS_FIELD) {
        Some(FieldValue::Int(n)) if *n > 0 => *n as usize,
        Some(FieldValue::Double(n)) if *n > 0.0 && n.fract() == 0.0 => *n as usize,
        _ => {
            warn!("record {}: missing or invalid {}", location, DATA_CHUNKS_FIELD);
            return None;
        }
    };
    if chunk_count > MAX_CHUNKS {
        warn!("record {}: chunk count {} exceeds limit", location, chunk_count);
        return None;
    }

    let mut payload = Vec::with_capacity(chunk_count * CHUNK_SIZE);
    for index in 0..chunk_count {
        match record.fields.get(&chunk_field(index)) {
            Some(FieldValue::Binary(bytes)) => payload.extend_from_slice(bytes),
            _ => {
                warn!("record {}: chunk {} missing or not binary", location, index);
                return None;
            }
        }
    }

    let text = match String::from_utf8(payload) {
        Ok(text) => text,
        Err(e) => {
            warn!("record {}: payload is not UTF-8: {}", location, e);
            return None;
        }
    };

    match serde_json::from_str(&text) {
        Ok(entity) => Some(entity),
        Err(e) => {
            warn!("record {}: payload is not a valid entity: {}", location, e);
            None
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
