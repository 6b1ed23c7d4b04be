use std::path::Path;

use fjall::{TransactionalKeyspace, TransactionalPartitionHandle, WriteTransaction};

use super::*;

/// A `ChunkRegistry` persisted in an fjall keyspace.
///
/// Chunk keys are the postcard-encoded upload id followed by the big-endian
/// chunk index, so a prefix scan yields one upload in index order. Writes use
/// serializable transactions and are retried when they conflict.
pub struct FjallRegistry {
    keyspace: TransactionalKeyspace,
    chunks: TransactionalPartitionHandle,
    artifacts: TransactionalPartitionHandle,
}

fn upload_prefix(upload_id: &str) -> Result<Vec<u8>> {
    postcard::to_stdvec(upload_id).map_err(UploadError::storage)
}

fn chunk_key(prefix: &[u8], chunk_index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 4);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&chunk_index.to_be_bytes());
    key
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(UploadError::storage)
}

impl FjallRegistry {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let keyspace = fjall::Config::new(path)
            .open_transactional()
            .map_err(UploadError::storage)?;
        let chunks = keyspace
            .open_partition("chunks", Default::default())
            .map_err(UploadError::storage)?;
        let artifacts = keyspace
            .open_partition("artifacts", Default::default())
            .map_err(UploadError::storage)?;

        Ok(Self {
            keyspace,
            chunks,
            artifacts,
        })
    }

    /// Runs `f` in a write transaction, starting over whenever the commit conflicts.
    fn write<T>(&self, mut f: impl FnMut(&mut WriteTransaction) -> Result<T>) -> Result<T> {
        loop {
            let mut tx = self.keyspace.write_tx().map_err(UploadError::storage)?;
            let value = f(&mut tx)?;
            match tx.commit().map_err(UploadError::storage)? {
                Ok(()) => return Ok(value),
                Err(_conflict) => tracing::debug!("registry transaction conflicted, retrying"),
            }
        }
    }

    fn chunk_keys(&self, tx: &mut WriteTransaction, prefix: &[u8]) -> Result<Vec<fjall::Slice>> {
        tx.prefix(&self.chunks, prefix)
            .map(|kv| kv.map(|(key, _)| key))
            .collect::<fjall::Result<_>>()
            .map_err(UploadError::storage)
    }

    fn chunk_entries(
        &self,
        tx: &mut WriteTransaction,
        prefix: &[u8],
    ) -> Result<Vec<(fjall::Slice, ChunkRecord)>> {
        tx.prefix(&self.chunks, prefix)
            .map(|kv| {
                let (key, value) = kv.map_err(UploadError::storage)?;
                Ok((key, decode(&value)?))
            })
            .collect()
    }
}

impl ChunkRegistry for FjallRegistry {
    fn record(&self, chunk: ChunkRecord) -> Result<Upserted> {
        check_bounds(&chunk)?;
        let prefix = upload_prefix(&chunk.upload_id)?;
        let key = chunk_key(&prefix, chunk.chunk_index);
        let value = postcard::to_stdvec(&chunk).map_err(UploadError::storage)?;

        let previous = self.write(|tx| {
            if tx
                .contains_key(&self.artifacts, chunk.upload_id.as_bytes())
                .map_err(UploadError::storage)?
            {
                return Err(already_settled(&chunk.upload_id));
            }

            let sibling = tx
                .prefix(&self.chunks, &prefix)
                .next()
                .transpose()
                .map_err(UploadError::storage)?;
            if let Some((_, sibling)) = sibling {
                check_compatible(&chunk, &decode(&sibling)?)?;
            }

            let previous = tx
                .get(&self.chunks, &key)
                .map_err(UploadError::storage)?
                .map(|bytes| decode::<ChunkRecord>(&bytes))
                .transpose()?;
            tx.insert(&self.chunks, key.as_slice(), value.as_slice());
            Ok(previous)
        })?;

        Ok(Upserted {
            record: chunk,
            previous,
        })
    }

    fn list_by_upload(&self, upload_id: &str) -> Result<Vec<ChunkRecord>> {
        let prefix = upload_prefix(upload_id)?;
        let read_tx = self.keyspace.read_tx();

        let records = read_tx
            .prefix(&self.chunks, prefix)
            .map(|kv| {
                let (_, value) = kv.map_err(UploadError::storage)?;
                decode(&value)
            })
            .collect();
        records
    }

    fn delete_by_upload(&self, upload_id: &str) -> Result<()> {
        let prefix = upload_prefix(upload_id)?;
        self.write(|tx| {
            for key in self.chunk_keys(tx, &prefix)? {
                tx.remove(&self.chunks, key);
            }
            Ok(())
        })
    }

    fn list_all(&self) -> Result<Vec<ChunkRecord>> {
        let read_tx = self.keyspace.read_tx();

        // keys order by the length of the upload id first, not lexicographically
        let mut records = read_tx
            .iter(&self.chunks)
            .map(|kv| {
                let (_, value) = kv.map_err(UploadError::storage)?;
                decode::<ChunkRecord>(&value)
            })
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| {
            (&a.upload_id, a.chunk_index).cmp(&(&b.upload_id, b.chunk_index))
        });
        Ok(records)
    }

    fn settle(&self, artifact: &FinalArtifact, combined: &[ChunkRecord]) -> Result<bool> {
        let prefix = upload_prefix(&artifact.upload_id)?;
        let value = postcard::to_stdvec(artifact).map_err(UploadError::storage)?;

        // the prefix read makes a concurrent `record` of this upload conflict with us
        self.write(|tx| {
            let stored = self.chunk_entries(tx, &prefix)?;
            if !stored.iter().map(|(_, record)| record).eq(combined) {
                return Ok(false);
            }

            for (key, _) in stored {
                tx.remove(&self.chunks, key);
            }
            tx.insert(
                &self.artifacts,
                artifact.upload_id.as_bytes(),
                value.as_slice(),
            );
            Ok(true)
        })
    }

    fn artifact(&self, upload_id: &str) -> Result<Option<FinalArtifact>> {
        let read_tx = self.keyspace.read_tx();
        read_tx
            .get(&self.artifacts, upload_id.as_bytes())
            .map_err(UploadError::storage)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }
}
