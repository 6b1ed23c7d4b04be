use std::collections::BTreeSet;

use crate::datamodel::ChunkRecord;
use crate::error::{Result, UploadError};

/// The arrival state of one upload, derived from its chunk records.
///
/// Nothing about a session is stored; it is rebuilt from the registry
/// whenever it is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub upload_id: String,
    pub received_indices: BTreeSet<u32>,
    pub total_chunks: u32,
    pub name: String,
}

impl UploadSession {
    /// Builds the session of the upload `records` belong to, or `None` if there are no records.
    ///
    /// Fails with `CorruptUpload` if the records disagree on the upload or its
    /// chunk count, or hold an index outside of that count.
    pub fn derive(records: &[ChunkRecord]) -> Result<Option<Self>> {
        let Some(first) = records.first() else {
            return Ok(None);
        };
        let corrupt = |reason: String| UploadError::CorruptUpload {
            upload_id: first.upload_id.clone(),
            reason,
        };

        let mut received_indices = BTreeSet::new();
        for record in records {
            if record.upload_id != first.upload_id {
                return Err(corrupt(format!(
                    "record of upload {} mixed in",
                    record.upload_id
                )));
            }
            if record.total_chunks != first.total_chunks {
                return Err(corrupt(format!(
                    "total_chunks disagree: {} and {}",
                    first.total_chunks, record.total_chunks
                )));
            }
            if record.chunk_index >= first.total_chunks {
                return Err(corrupt(format!(
                    "chunk_index {} out of range for {} chunks",
                    record.chunk_index, first.total_chunks
                )));
            }
            received_indices.insert(record.chunk_index);
        }

        Ok(Some(Self {
            upload_id: first.upload_id.clone(),
            received_indices,
            total_chunks: first.total_chunks,
            name: first.original_name.clone(),
        }))
    }

    pub fn is_complete(&self) -> bool {
        // all indices are below `total_chunks`, so a full count means the exact set
        self.received_indices.len() == self.total_chunks as usize
    }

    pub fn missing_indices(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|index| !self.received_indices.contains(index))
            .collect()
    }
}

/// Whether `records` hold every chunk of their upload exactly.
pub fn is_complete(records: &[ChunkRecord]) -> Result<bool> {
    let session = UploadSession::derive(records)?;
    Ok(session.is_some_and(|session| session.is_complete()))
}

/// The indices below `total_chunks` that have no record, ascending.
pub fn missing_indices(records: &[ChunkRecord]) -> Result<Vec<u32>> {
    let session = UploadSession::derive(records)?;
    Ok(session
        .map(|session| session.missing_indices())
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::chunk;

    fn records(indices: &[u32], total: u32) -> Vec<ChunkRecord> {
        indices.iter().map(|&index| chunk("abc", index, total)).collect()
    }

    #[test]
    fn complete_in_any_order() {
        assert!(is_complete(&records(&[0, 1, 2], 3)).unwrap());
        assert!(is_complete(&records(&[2, 0, 1], 3)).unwrap());
        assert!(is_complete(&records(&[0], 1)).unwrap());
        assert!(missing_indices(&records(&[1, 2, 0], 3)).unwrap().is_empty());
    }

    #[test]
    fn incomplete_uploads() {
        let cases: [(&[u32], &[u32]); 4] = [
            (&[1, 2], &[0]),
            (&[0, 2], &[1]),
            (&[0, 1], &[2]),
            (&[2], &[0, 1]),
        ];
        for (indices, missing) in cases {
            let records = records(indices, 3);
            assert!(!is_complete(&records).unwrap(), "{indices:?}");
            assert_eq!(missing_indices(&records).unwrap(), missing);
        }
    }

    #[test]
    fn duplicates_do_not_mask_gaps() {
        let records = records(&[0, 0, 2], 3);
        assert!(!is_complete(&records).unwrap());
        assert_eq!(missing_indices(&records).unwrap(), [1]);
    }

    #[test]
    fn empty_is_never_complete() {
        assert!(!is_complete(&[]).unwrap());
        assert!(missing_indices(&[]).unwrap().is_empty());
        assert_eq!(UploadSession::derive(&[]).unwrap(), None);
    }

    #[test]
    fn disagreeing_records_are_corrupt() {
        let mut records = records(&[0, 1], 3);
        records.push(chunk("abc", 2, 4));
        assert!(matches!(
            is_complete(&records),
            Err(UploadError::CorruptUpload { .. })
        ));

        let out_of_range = [chunk("abc", 0, 2), chunk("abc", 5, 2)];
        assert!(matches!(
            missing_indices(&out_of_range),
            Err(UploadError::CorruptUpload { .. })
        ));
    }

    #[test]
    fn session_view() {
        let session = UploadSession::derive(&records(&[2, 0], 3)).unwrap().unwrap();
        assert_eq!(session.upload_id, "abc");
        assert_eq!(session.name, "video.mp4");
        assert_eq!(session.total_chunks, 3);
        assert_eq!(session.received_indices.iter().copied().collect::<Vec<_>>(), [0, 2]);
        assert_eq!(session.missing_indices(), [1]);
    }
}
