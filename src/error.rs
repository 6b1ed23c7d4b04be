use thiserror::Error;

/// A type-erased error coming out of a storage backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum UploadError {
    /// The submitted chunk contradicts itself or the chunks already recorded.
    #[error("invalid chunk: {0}")]
    Validation(String),

    #[error("unknown upload: {0}")]
    NotFound(String),

    /// Some chunks have not arrived yet. The client may retry once they have.
    #[error("upload {upload_id} is incomplete, missing chunks {missing:?}")]
    IncompleteUpload { upload_id: String, missing: Vec<u32> },

    /// Another reassembly of the same upload is in flight.
    #[error("upload {0} is already being reassembled")]
    Conflict(String),

    /// The recorded chunks disagree with each other. Needs manual cleanup.
    #[error("upload {upload_id} has inconsistent chunk records: {reason}")]
    CorruptUpload { upload_id: String, reason: String },

    /// Concatenation failed. Chunk records and blobs are left in place.
    #[error(
        "reassembly of upload {upload_id} failed{}",
        .chunk_index.map(|index| format!(" at chunk {index}")).unwrap_or_default()
    )]
    Reassembly {
        upload_id: String,
        chunk_index: Option<u32>,
        #[source]
        source: BoxError,
    },

    #[error("storage failure: {0}")]
    Storage(#[source] BoxError),
}

impl UploadError {
    pub(crate) fn storage(err: impl Into<BoxError>) -> Self {
        Self::Storage(err.into())
    }

    /// Whether repeating the same request may succeed without outside intervention.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::CorruptUpload { .. })
    }
}

pub type Result<T, E = UploadError> = std::result::Result<T, E>;
