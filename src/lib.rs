//! Chunked uploads: clients send the pieces of a file in any order, and once
//! all of them arrived they are combined into the final file.

pub mod blobstore;
pub mod datamodel;
pub mod error;
pub mod guard;
pub mod reassembler;
pub mod registry;
pub mod session;
pub mod store;

#[cfg(test)]
mod test_support;

pub use datamodel::{ChunkRecord, ContentHash, FinalArtifact};
pub use error::{Result, UploadError};
pub use store::{ChunkUpload, Config, UploadStore};
