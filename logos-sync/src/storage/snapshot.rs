//! Compressed on-the-wire form of a [`DocumentSnapshot`].
//!
//! Layout (bincode, standard config):
//! ```text
//! ┌────────────────┬────────────┬───────────────┬─────────────────────────┐
//! │ doc_id: String │ version u64│ raw_size u32  │ body: LZ4(JSON snapshot)│
//! └────────────────┴────────────┴───────────────┴─────────────────────────┘
//! ```
//!
//! Document values are arbitrary JSON, which bincode cannot describe, so the
//! body stays JSON and only the header is bincode.

use serde::{Deserialize, Serialize};

use crate::document::DocumentSnapshot;
use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedSnapshot {
    pub doc_id: String,
    pub version: u64,
    /// Size of the uncompressed JSON body in bytes
    pub raw_size: u32,
    /// LZ4 block with prepended size
    pub body: Vec<u8>,
}

impl CompressedSnapshot {
    pub fn compress(snapshot: &DocumentSnapshot) -> Result<Self, StorageError> {
        let json = serde_json::to_vec(snapshot).map_err(|e| StorageError::Encode(e.to_string()))?;
        let raw_size = u32::try_from(json.len())
            .map_err(|_| StorageError::Encode(format!("snapshot of {} bytes is too large", json.len())))?;
        Ok(Self {
            doc_id: snapshot.doc_id.clone(),
            version: snapshot.version,
            raw_size,
            body: lz4_flex::compress_prepend_size(&json),
        })
    }

    pub fn decompress(&self) -> Result<DocumentSnapshot, StorageError> {
        let json = lz4_flex::decompress_size_prepended(&self.body)
            .map_err(|e| StorageError::Decompression(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| StorageError::Decode(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (snapshot, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Decode(e.to_string()))?;
        Ok(snapshot)
    }

    /// Uncompressed over compressed body size.
    pub fn compression_ratio(&self) -> f64 {
        if self.body.is_empty() {
            return 0.0;
        }
        f64::from(self.raw_size) / self.body.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FieldClock;
    use serde_json::{json, Map, Value};

    fn sample() -> DocumentSnapshot {
        let mut state = Map::new();
        state.insert("text".to_string(), Value::String("lorem ipsum ".repeat(200)));
        state.insert("meta".to_string(), json!({"title": "Notes", "tags": ["a", "b"]}));
        DocumentSnapshot {
            doc_id: "doc-1".to_string(),
            state,
            clock: [("text", 12), ("meta", 3)].into_iter().collect::<FieldClock>(),
            version: 12,
        }
    }

    #[test]
    fn test_snapshot_survives_framing() {
        let original = sample();
        let bytes = CompressedSnapshot::compress(&original).unwrap().encode().unwrap();
        let restored = CompressedSnapshot::decode(&bytes).unwrap();
        assert_eq!(restored.doc_id, "doc-1");
        assert_eq!(restored.version, 12);
        assert_eq!(restored.decompress().unwrap(), original);
    }

    #[test]
    fn test_repetitive_text_compresses() {
        let compressed = CompressedSnapshot::compress(&sample()).unwrap();
        assert!(compressed.compression_ratio() > 2.0);
    }

    #[test]
    fn test_corrupt_body_is_rejected() {
        let mut compressed = CompressedSnapshot::compress(&sample()).unwrap();
        compressed.body.truncate(8);
        assert!(matches!(compressed.decompress(), Err(StorageError::Decompression(_))));
        assert!(CompressedSnapshot::decode(&[0xff, 0xff]).is_err());
    }
}
