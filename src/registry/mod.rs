use crate::datamodel::{ChunkRecord, FinalArtifact};
use crate::error::{Result, UploadError};

pub mod fjall_impl;
pub mod mem_impl;

pub use fjall_impl::FjallRegistry;
pub use mem_impl::MemRegistry;

/// The outcome of `ChunkRegistry::record`.
#[derive(Debug)]
pub struct Upserted {
    pub record: ChunkRecord,
    /// The record that was replaced, if this index had been received before.
    pub previous: Option<ChunkRecord>,
}

/// Durable metadata of received chunks and settled uploads.
///
/// Implementations must allow concurrent `record` calls for different indices
/// of the same upload without an upload-wide lock.
///
/// All calls are synchronous and block the calling thread, async callers
/// included. They only touch metadata, a handful of small keys per call,
/// so keep them that way: no blob I/O behind this trait.
pub trait ChunkRegistry: Send + Sync {
    /// Upserts the record keyed by `(upload_id, chunk_index)`.
    fn record(&self, chunk: ChunkRecord) -> Result<Upserted>;

    /// All records of an upload, ascending by `chunk_index`.
    fn list_by_upload(&self, upload_id: &str) -> Result<Vec<ChunkRecord>>;

    /// Removes all records of an upload. A no-op if there are none.
    fn delete_by_upload(&self, upload_id: &str) -> Result<()>;

    /// All records, ordered by `(upload_id, chunk_index)`.
    fn list_all(&self) -> Result<Vec<ChunkRecord>>;

    /// Atomically removes the upload's chunk records and stores its artifact.
    ///
    /// Only settles if the stored records are still exactly `combined`. Returns
    /// `false` without changing anything if a chunk arrived in the meantime.
    fn settle(&self, artifact: &FinalArtifact, combined: &[ChunkRecord]) -> Result<bool>;

    fn artifact(&self, upload_id: &str) -> Result<Option<FinalArtifact>>;
}

fn check_bounds(chunk: &ChunkRecord) -> Result<()> {
    if chunk.total_chunks == 0 {
        return Err(UploadError::Validation(
            "total_chunks must be at least 1".into(),
        ));
    }
    if chunk.chunk_index >= chunk.total_chunks {
        return Err(UploadError::Validation(format!(
            "chunk_index {} is out of range for {} chunks",
            chunk.chunk_index, chunk.total_chunks
        )));
    }
    Ok(())
}

/// All records of one upload have to agree on what file they belong to.
fn check_compatible(chunk: &ChunkRecord, existing: &ChunkRecord) -> Result<()> {
    let mismatch = if chunk.total_chunks != existing.total_chunks {
        Some(("total_chunks", chunk.total_chunks.to_string(), existing.total_chunks.to_string()))
    } else if chunk.original_name != existing.original_name {
        Some(("original_name", chunk.original_name.clone(), existing.original_name.clone()))
    } else if chunk.mime_type != existing.mime_type {
        Some(("mime_type", chunk.mime_type.clone(), existing.mime_type.clone()))
    } else {
        None
    };

    match mismatch {
        Some((field, got, expected)) => Err(UploadError::Validation(format!(
            "{field} {got:?} does not match {expected:?} of upload {}",
            chunk.upload_id
        ))),
        None => Ok(()),
    }
}

fn already_settled(upload_id: &str) -> UploadError {
    UploadError::Validation(format!("upload {upload_id} has already been combined"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::datamodel::ContentHash;

    pub fn chunk(upload_id: &str, chunk_index: u32, total_chunks: u32) -> ChunkRecord {
        ChunkRecord {
            upload_id: upload_id.into(),
            chunk_index,
            total_chunks,
            original_name: "video.mp4".into(),
            mime_type: "video/mp4".into(),
            size_bytes: 10,
            blob_path: format!("chunks/{upload_id}/chunk_{chunk_index}"),
        }
    }

    fn indices(records: &[ChunkRecord]) -> Vec<u32> {
        records.iter().map(|r| r.chunk_index).collect()
    }

    /// Behaviour every `ChunkRegistry` has to share.
    pub fn exercise_registry(registry: &impl ChunkRegistry) {
        assert!(registry.list_by_upload("abc").unwrap().is_empty());

        for index in [2, 0, 1] {
            let upserted = registry.record(chunk("abc", index, 3)).unwrap();
            assert!(upserted.previous.is_none());
        }
        registry.record(chunk("abd", 0, 1)).unwrap();
        registry.record(chunk("ab", 0, 2)).unwrap();
        assert_eq!(indices(&registry.list_by_upload("abc").unwrap()), [0, 1, 2]);
        assert_eq!(indices(&registry.list_by_upload("ab").unwrap()), [0]);

        // re-submission replaces the record and hands back the old one
        let mut retry = chunk("abc", 1, 3);
        retry.size_bytes = 42;
        retry.blob_path = "chunks/abc/chunk_1.retry".into();
        let upserted = registry.record(retry.clone()).unwrap();
        assert_eq!(upserted.previous, Some(chunk("abc", 1, 3)));
        assert_eq!(registry.list_by_upload("abc").unwrap()[1], retry);

        // validation
        for bad in [chunk("abc", 3, 3), chunk("abc", 0, 4), chunk("new", 0, 0)] {
            let err = registry.record(bad).unwrap_err();
            assert!(matches!(err, UploadError::Validation(_)), "{err:?}");
        }
        let mut renamed = chunk("abc", 0, 3);
        renamed.original_name = "other.mp4".into();
        assert!(matches!(registry.record(renamed), Err(UploadError::Validation(_))));
        assert_eq!(registry.list_by_upload("abc").unwrap().len(), 3);

        let all = registry.list_all().unwrap();
        let keys: Vec<_> = all.iter().map(|r| (r.upload_id.as_str(), r.chunk_index)).collect();
        assert_eq!(keys, [("ab", 0), ("abc", 0), ("abc", 1), ("abc", 2), ("abd", 0)]);

        registry.delete_by_upload("ab").unwrap();
        registry.delete_by_upload("ab").unwrap();
        assert!(registry.list_by_upload("ab").unwrap().is_empty());

        // settling
        assert!(registry.artifact("abc").unwrap().is_none());
        let artifact = FinalArtifact {
            upload_id: "abc".into(),
            path: "uploads/abc/video.mp4".into(),
            size_bytes: 62,
            original_name: "video.mp4".into(),
            mime_type: "video/mp4".into(),
            hash: ContentHash([7; 32]),
        };
        let combined = registry.list_by_upload("abc").unwrap();
        let mut stale = combined.clone();
        stale[1] = chunk("abc", 1, 3);
        assert!(!registry.settle(&artifact, &stale).unwrap());
        assert!(!registry.settle(&artifact, &combined[..2]).unwrap());
        assert_eq!(registry.list_by_upload("abc").unwrap(), combined);
        assert!(registry.artifact("abc").unwrap().is_none());

        assert!(registry.settle(&artifact, &combined).unwrap());
        assert!(registry.list_by_upload("abc").unwrap().is_empty());
        assert_eq!(registry.artifact("abc").unwrap(), Some(artifact));
        assert!(matches!(
            registry.record(chunk("abc", 0, 3)),
            Err(UploadError::Validation(_))
        ));
        assert_eq!(indices(&registry.list_by_upload("abd").unwrap()), [0]);
    }

    /// Parallel upserts of distinct indices of one upload must all land.
    pub fn exercise_concurrent_records(registry: &impl ChunkRegistry) {
        const TOTAL: u32 = 64;
        std::thread::scope(|scope| {
            for worker in 0..8 {
                scope.spawn(move || {
                    for index in (worker..TOTAL).step_by(8) {
                        registry.record(chunk("parallel", index, TOTAL)).unwrap();
                    }
                });
            }
        });
        let recorded = indices(&registry.list_by_upload("parallel").unwrap());
        assert_eq!(recorded, (0..TOTAL).collect::<Vec<_>>());
    }
}
