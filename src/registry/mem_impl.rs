use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::*;

#[derive(Debug, Default)]
struct Records {
    chunks: BTreeMap<(String, u32), ChunkRecord>,
    artifacts: HashMap<String, FinalArtifact>,
}

impl Records {
    fn upload(&self, upload_id: &str) -> impl Iterator<Item = &ChunkRecord> {
        let range = (upload_id.to_owned(), 0)..=(upload_id.to_owned(), u32::MAX);
        self.chunks.range(range).map(|(_, record)| record)
    }

    fn remove_upload(&mut self, upload_id: &str) {
        let keys: Vec<_> = self
            .upload(upload_id)
            .map(|record| (record.upload_id.clone(), record.chunk_index))
            .collect();
        for key in keys {
            self.chunks.remove(&key);
        }
    }
}

/// A `ChunkRegistry` that lives in memory only.
///
/// Every operation is a single short critical section over the map.
#[derive(Debug, Default)]
pub struct MemRegistry {
    records: RwLock<Records>,
}

impl MemRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkRegistry for MemRegistry {
    fn record(&self, chunk: ChunkRecord) -> Result<Upserted> {
        check_bounds(&chunk)?;

        let mut records = self.records.write().unwrap();
        if records.artifacts.contains_key(&chunk.upload_id) {
            return Err(already_settled(&chunk.upload_id));
        }
        if let Some(sibling) = records.upload(&chunk.upload_id).next() {
            check_compatible(&chunk, sibling)?;
        }

        let key = (chunk.upload_id.clone(), chunk.chunk_index);
        let previous = records.chunks.insert(key, chunk.clone());
        Ok(Upserted {
            record: chunk,
            previous,
        })
    }

    fn list_by_upload(&self, upload_id: &str) -> Result<Vec<ChunkRecord>> {
        let records = self.records.read().unwrap();
        Ok(records.upload(upload_id).cloned().collect())
    }

    fn delete_by_upload(&self, upload_id: &str) -> Result<()> {
        self.records.write().unwrap().remove_upload(upload_id);
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<ChunkRecord>> {
        let records = self.records.read().unwrap();
        Ok(records.chunks.values().cloned().collect())
    }

    fn settle(&self, artifact: &FinalArtifact, combined: &[ChunkRecord]) -> Result<bool> {
        let mut records = self.records.write().unwrap();
        if !records.upload(&artifact.upload_id).eq(combined) {
            return Ok(false);
        }
        records.remove_upload(&artifact.upload_id);
        records
            .artifacts
            .insert(artifact.upload_id.clone(), artifact.clone());
        Ok(true)
    }

    fn artifact(&self, upload_id: &str) -> Result<Option<FinalArtifact>> {
        let records = self.records.read().unwrap();
        Ok(records.artifacts.get(upload_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{exercise_concurrent_records, exercise_registry};

    #[test]
    fn test_mem_registry() {
        let registry = MemRegistry::new();
        exercise_registry(&registry);
        dbg!(&registry);
    }

    #[test]
    fn concurrent_records() {
        exercise_concurrent_records(&MemRegistry::new());
    }
}
