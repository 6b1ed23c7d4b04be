use tokio::io::AsyncRead;
use tracing::instrument;
use uuid::Uuid;

use crate::blobstore::BlobStore;
use crate::datamodel::{layout, ChunkRecord, FinalArtifact};
use crate::error::{Result, UploadError};
use crate::guard::ConcurrencyGuard;
use crate::reassembler::Reassembler;
use crate::registry::ChunkRegistry;
use crate::session::UploadSession;

#[derive(Debug, Clone)]
pub struct Config {
    /// Size of the buffer chunk bytes are streamed through while combining.
    pub copy_buffer_size: usize,
    /// Uploads announcing more chunks than this are rejected.
    pub max_total_chunks: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            copy_buffer_size: 64 * 1024,
            max_total_chunks: 100_000,
        }
    }
}

/// Describes one chunk a client submits, without its bytes.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub upload_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub original_name: String,
    pub mime_type: String,
}

impl ChunkUpload {
    fn validate(&self, config: &Config) -> Result<()> {
        layout::validate_segment("upload_id", &self.upload_id)?;
        layout::validate_segment("original_name", &self.original_name)?;
        if self.total_chunks > config.max_total_chunks {
            return Err(UploadError::Validation(format!(
                "total_chunks {} exceeds the limit of {}",
                self.total_chunks, config.max_total_chunks
            )));
        }
        if self.chunk_index >= self.total_chunks {
            return Err(UploadError::Validation(format!(
                "chunk_index {} is out of range for {} chunks",
                self.chunk_index, self.total_chunks
            )));
        }
        Ok(())
    }
}

/// Accepts chunks of uploads and combines them into final files.
///
/// Wrap it in an `Arc` to share it between request handlers; all methods take `&self`.
#[derive(Debug)]
pub struct UploadStore<B, R> {
    blobs: B,
    registry: R,
    guard: ConcurrencyGuard,
    config: Config,
}

impl<B: BlobStore, R: ChunkRegistry> UploadStore<B, R> {
    pub fn new(blobs: B, registry: R) -> Self {
        Self {
            blobs,
            registry,
            guard: ConcurrencyGuard::new(),
            config: Config::default(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.guard
    }

    /// Stores the bytes of one chunk and records it.
    ///
    /// Submitting an index again replaces the earlier bytes.
    #[instrument(skip(self, chunk, bytes), fields(upload_id = %chunk.upload_id, chunk_index = chunk.chunk_index))]
    pub async fn submit_chunk<Rd>(&self, chunk: ChunkUpload, bytes: Rd) -> Result<ChunkRecord>
    where
        Rd: AsyncRead + Send + Unpin,
    {
        chunk.validate(&self.config)?;

        let blob_path = layout::chunk_path(&chunk.upload_id, chunk.chunk_index, Uuid::new_v4());
        let size_bytes = match self.blobs.put_stream(&blob_path, bytes).await {
            Ok(size_bytes) => size_bytes,
            Err(err) => {
                self.discard(&blob_path).await;
                return Err(UploadError::storage(err));
            }
        };

        let record = ChunkRecord {
            upload_id: chunk.upload_id,
            chunk_index: chunk.chunk_index,
            total_chunks: chunk.total_chunks,
            original_name: chunk.original_name,
            mime_type: chunk.mime_type,
            size_bytes,
            blob_path: blob_path.clone(),
        };
        let upserted = match self.registry.record(record) {
            Ok(upserted) => upserted,
            Err(err) => {
                self.discard(&blob_path).await;
                return Err(err);
            }
        };

        if let Some(previous) = &upserted.previous {
            tracing::warn!(
                previous_size = previous.size_bytes,
                size_bytes,
                "chunk submitted again, replacing the earlier bytes"
            );
            self.discard(&previous.blob_path).await;
        }
        tracing::debug!(size_bytes, "chunk recorded");

        Ok(upserted.record)
    }

    /// Combines all chunks of `upload_id` into its final file.
    ///
    /// This streams every chunk through once, so keep it off latency-sensitive paths.
    pub async fn combine_chunks(&self, upload_id: &str) -> Result<FinalArtifact> {
        Reassembler::new(
            &self.blobs,
            &self.registry,
            &self.guard,
            self.config.copy_buffer_size,
        )
        .combine(upload_id)
        .await
    }

    /// Every chunk record currently held, for diagnostics.
    pub fn list_files(&self) -> Result<Vec<ChunkRecord>> {
        self.registry.list_all()
    }

    /// The arrival state of an upload that still has chunk records.
    pub fn session(&self, upload_id: &str) -> Result<Option<UploadSession>> {
        let records = self.registry.list_by_upload(upload_id)?;
        UploadSession::derive(&records)
    }

    async fn discard(&self, blob_path: &str) {
        if let Err(err) = self.blobs.delete(blob_path).await {
            tracing::warn!(blob_path, error = %err, "failed to delete chunk blob");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::MemBlobStore;
    use crate::registry::MemRegistry;
    use crate::test_support::upload;

    fn mem_store() -> UploadStore<MemBlobStore, MemRegistry> {
        UploadStore::new(MemBlobStore::new(), MemRegistry::new())
    }

    async fn submit_all(
        store: &UploadStore<MemBlobStore, MemRegistry>,
        upload_id: &str,
        total_chunks: u32,
        chunks: &[(u32, &str)],
    ) {
        for (chunk_index, bytes) in chunks {
            store
                .submit_chunk(upload(upload_id, *chunk_index, total_chunks), bytes.as_bytes())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn rejects_invalid_chunks() {
        let store = mem_store();
        submit_all(&store, "abc", 3, &[(0, "b0")]).await;

        let mut bad_name = upload("abc", 1, 3);
        bad_name.original_name = "../escape.mp4".into();
        for chunk in [upload("abc", 3, 3), upload("new", 0, 0), upload("a/b", 0, 1), bad_name] {
            let err = store.submit_chunk(chunk, &b"x"[..]).await.unwrap_err();
            assert!(matches!(err, UploadError::Validation(_)), "{err:?}");
            assert!(!err.is_retryable());
        }

        // rejected by the registry after the bytes were stored
        let err = store
            .submit_chunk(upload("abc", 1, 4), &b"b1"[..])
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
        assert_eq!(store.blobs().paths().len(), 1);
        assert_eq!(store.list_files().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn limits_total_chunks() {
        let store = mem_store().with_config(Config {
            max_total_chunks: 4,
            ..Config::default()
        });

        let err = store
            .submit_chunk(upload("abc", 0, 5), &b"b0"[..])
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)), "{err:?}");
        let err = store
            .submit_chunk(upload("abc", 0, u32::MAX), &b"b0"[..])
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)), "{err:?}");
        assert!(store.blobs().paths().is_empty());
        assert!(store.list_files().unwrap().is_empty());

        submit_all(&store, "abc", 4, &[(3, "b3")]).await;
        match store.combine_chunks("abc").await {
            Err(UploadError::IncompleteUpload { missing, .. }) => assert_eq!(missing, [0, 1, 2]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn lists_pending_chunks() {
        let store = mem_store();
        assert!(store.list_files().unwrap().is_empty());
        assert_eq!(store.session("abc").unwrap(), None);

        submit_all(&store, "xyz", 1, &[(0, "x")]).await;
        submit_all(&store, "abc", 3, &[(2, "b2"), (0, "b0")]).await;

        let files = store.list_files().unwrap();
        let keys: Vec<_> = files
            .iter()
            .map(|r| (r.upload_id.as_str(), r.chunk_index, r.size_bytes))
            .collect();
        assert_eq!(keys, [("abc", 0, 2), ("abc", 2, 2), ("xyz", 0, 1)]);
        for record in &files {
            assert_eq!(
                store.blobs().contents(&record.blob_path).unwrap().len() as u64,
                record.size_bytes
            );
        }

        let session = store.session("abc").unwrap().unwrap();
        assert_eq!(session.name, "final_video.mp4");
        assert!(!session.is_complete());
        assert_eq!(session.missing_indices(), [1]);
    }
}
