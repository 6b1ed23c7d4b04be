use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Metadata of one received chunk.
///
/// `(upload_id, chunk_index)` is the key: recording the same index again
/// replaces the earlier record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub upload_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// Where the chunk bytes live inside the `BlobStore`.
    pub blob_path: String,
}

/// The reassembled file of a settled upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalArtifact {
    pub upload_id: String,
    pub path: String,
    pub size_bytes: u64,
    pub original_name: String,
    pub mime_type: String,
    pub hash: ContentHash,
}

/// The BLAKE3 hash of a file's contents.
///
/// Serialized as a hex string in human readable formats, and as raw bytes otherwise.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl From<blake3::Hash> for ContentHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if !deserializer.is_human_readable() {
            return <[u8; 32]>::deserialize(deserializer).map(Self);
        }

        let hex = String::deserialize(deserializer)?;
        let mut hash = [0; 32];
        let decoded = base16ct::mixed::decode(&hex, &mut hash).map_err(serde::de::Error::custom)?;
        let decoded_len = decoded.len();
        if decoded_len != 32 {
            return Err(serde::de::Error::invalid_length(decoded_len, &"32 bytes"));
        }
        Ok(Self(hash))
    }
}

/// Where things live inside the `BlobStore`.
pub mod layout {
    use uuid::Uuid;

    use crate::error::{Result, UploadError};

    /// Every arrival gets its own blob, so a racing re-upload of the same index
    /// can never leave a record pointing at bytes of another attempt.
    pub fn chunk_path(upload_id: &str, chunk_index: u32, attempt: Uuid) -> String {
        format!("chunks/{upload_id}/chunk_{chunk_index}.{}", attempt.simple())
    }

    pub fn staging_path(upload_id: &str, run: Uuid) -> String {
        format!("staging/{upload_id}/{}", run.simple())
    }

    pub fn final_path(upload_id: &str, original_name: &str) -> String {
        format!("uploads/{upload_id}/{original_name}")
    }

    /// Checks that `value` can be used as a single path segment.
    pub fn validate_segment(what: &str, value: &str) -> Result<()> {
        if value.is_empty() || value == "." || value == ".." {
            return Err(UploadError::Validation(format!("{what} {value:?} is not allowed")));
        }
        if value.contains(['/', '\\', '\0']) {
            return Err(UploadError::Validation(format!(
                "{what} {value:?} contains a path separator"
            )));
        }
        Ok(())
    }
}

mod dbg {
    use super::*;
    use core::fmt;

    impl fmt::Debug for ContentHash {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "ContentHash(BLAKE3:{:x})", base16ct::HexDisplay(&self.0))
        }
    }

    impl fmt::Display for ContentHash {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:x}", base16ct::HexDisplay(&self.0))
        }
    }
}
