use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;
use uuid::Uuid;

use crate::blobstore::BlobStore;
use crate::datamodel::{layout, ChunkRecord, FinalArtifact};
use crate::error::{BoxError, Result, UploadError};
use crate::guard::ConcurrencyGuard;
use crate::registry::ChunkRegistry;
use crate::session::UploadSession;

/// Where concatenation stopped, and why.
struct Failure {
    chunk_index: Option<u32>,
    source: BoxError,
}

impl Failure {
    fn at(chunk_index: Option<u32>) -> impl FnOnce(BoxError) -> Self {
        move |source| Self {
            chunk_index,
            source,
        }
    }
}

/// Concatenates the chunks of a complete upload into its final file.
pub struct Reassembler<'a, B, R> {
    blobs: &'a B,
    registry: &'a R,
    guard: &'a ConcurrencyGuard,
    copy_buffer_size: usize,
}

impl<'a, B: BlobStore, R: ChunkRegistry> Reassembler<'a, B, R> {
    pub fn new(
        blobs: &'a B,
        registry: &'a R,
        guard: &'a ConcurrencyGuard,
        copy_buffer_size: usize,
    ) -> Self {
        Self {
            blobs,
            registry,
            guard,
            copy_buffer_size: copy_buffer_size.max(1),
        }
    }

    /// Reassembles `upload_id`, or returns its artifact if that already happened.
    ///
    /// The final file only ever appears at its path fully written. On failure
    /// the chunk records and blobs are left untouched so the call can be retried.
    #[instrument(skip(self))]
    pub async fn combine(&self, upload_id: &str) -> Result<FinalArtifact> {
        let records = self.registry.list_by_upload(upload_id)?;
        if records.is_empty() {
            return self.settled(upload_id).await;
        }
        complete_session(upload_id, &records)?;

        let Some(_lease) = self.guard.try_acquire(upload_id) else {
            return Err(UploadError::Conflict(upload_id.into()));
        };

        // another run may have finished between the listing above and taking the lease
        let records = self.registry.list_by_upload(upload_id)?;
        if records.is_empty() {
            return self.settled(upload_id).await;
        }
        let session = complete_session(upload_id, &records)?;

        tracing::info!(total_chunks = session.total_chunks, "combining chunks");

        let staged = layout::staging_path(upload_id, Uuid::new_v4());
        let reassembly_error = |failure: Failure| UploadError::Reassembly {
            upload_id: upload_id.into(),
            chunk_index: failure.chunk_index,
            source: failure.source,
        };

        let (size_bytes, hash) = match self.concatenate(&records, &staged).await {
            Ok(written) => written,
            Err(failure) => {
                self.discard(&staged).await;
                return Err(reassembly_error(failure));
            }
        };

        let path = layout::final_path(upload_id, &session.name);
        if let Err(err) = self.blobs.move_blob(&staged, &path).await {
            self.discard(&staged).await;
            return Err(reassembly_error(Failure::at(None)(err.into())));
        }

        let first = &records[0];
        let artifact = FinalArtifact {
            upload_id: upload_id.into(),
            path,
            size_bytes,
            original_name: first.original_name.clone(),
            mime_type: first.mime_type.clone(),
            hash: hash.into(),
        };
        match self.registry.settle(&artifact, &records) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("chunks were resubmitted while combining, dropping the output");
                self.discard(&artifact.path).await;
                return Err(reassembly_error(Failure::at(None)(
                    "chunk records changed while combining".into(),
                )));
            }
            Err(err) => {
                self.discard(&artifact.path).await;
                return Err(err);
            }
        }

        for record in &records {
            if let Err(err) = self.blobs.delete(&record.blob_path).await {
                tracing::warn!(
                    chunk_index = record.chunk_index,
                    blob_path = %record.blob_path,
                    error = %err,
                    "failed to delete chunk blob"
                );
            }
        }

        tracing::info!(size_bytes, path = %artifact.path, hash = %artifact.hash, "upload combined");
        Ok(artifact)
    }

    /// The artifact of an upload whose chunk records are already gone.
    async fn settled(&self, upload_id: &str) -> Result<FinalArtifact> {
        let not_found = || UploadError::NotFound(upload_id.into());

        let artifact = self.registry.artifact(upload_id)?.ok_or_else(not_found)?;
        let published = self
            .blobs
            .exists(&artifact.path)
            .await
            .map_err(UploadError::storage)?;
        if !published {
            tracing::warn!(path = %artifact.path, "artifact recorded but missing from the blobstore");
            return Err(not_found());
        }

        tracing::debug!("upload was already combined");
        Ok(artifact)
    }

    /// Streams all chunks, in order, into a fresh blob at `staged`.
    async fn concatenate(
        &self,
        records: &[ChunkRecord],
        staged: &str,
    ) -> Result<(u64, blake3::Hash), Failure> {
        let mut output = self
            .blobs
            .open_write(staged)
            .await
            .map_err(|err| Failure::at(None)(err.into()))?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0; self.copy_buffer_size];
        let mut size_bytes = 0;

        for record in records {
            size_bytes += self
                .append_chunk(record, &mut output, &mut hasher, &mut buf)
                .await
                .map_err(Failure::at(Some(record.chunk_index)))?;
        }
        output
            .shutdown()
            .await
            .map_err(|err| Failure::at(None)(err.into()))?;

        Ok((size_bytes, hasher.finalize()))
    }

    async fn append_chunk(
        &self,
        record: &ChunkRecord,
        output: &mut B::Writer,
        hasher: &mut blake3::Hasher,
        buf: &mut [u8],
    ) -> Result<u64, BoxError> {
        let mut chunk = self.blobs.open_read(&record.blob_path).await?;
        let mut copied = 0;
        loop {
            let read = chunk.read(buf).await?;
            if read == 0 {
                break;
            }
            output.write_all(&buf[..read]).await?;
            hasher.update(&buf[..read]);
            copied += read as u64;
        }

        if copied != record.size_bytes {
            return Err(format!(
                "chunk blob {} holds {copied} bytes, {} were recorded",
                record.blob_path, record.size_bytes
            )
            .into());
        }
        tracing::debug!(chunk_index = record.chunk_index, copied, "appended chunk");
        Ok(copied)
    }

    async fn discard(&self, output: &str) {
        if let Err(err) = self.blobs.delete(output).await {
            tracing::warn!(output, error = %err, "failed to delete combined output");
        }
    }
}

fn complete_session(upload_id: &str, records: &[ChunkRecord]) -> Result<UploadSession> {
    let session = UploadSession::derive(records)?
        .ok_or_else(|| UploadError::NotFound(upload_id.into()))?;
    if !session.is_complete() {
        return Err(UploadError::IncompleteUpload {
            upload_id: upload_id.into(),
            missing: session.missing_indices(),
        });
    }
    Ok(session)
}
