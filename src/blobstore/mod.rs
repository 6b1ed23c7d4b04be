use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub mod fs_impl;
pub mod mem_impl;

pub use fs_impl::FsBlobStore;
pub use mem_impl::MemBlobStore;

/// Byte storage for chunks, staged outputs and published files, addressed by
/// `/`-separated relative paths.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    type Error: std::error::Error + From<std::io::Error> + Send + Sync + 'static;
    type Reader: AsyncRead + Send + Unpin;
    type Writer: AsyncWrite + Send + Unpin;

    /// Opens an existing blob for streaming reads.
    async fn open_read(&self, path: &str) -> Result<Self::Reader, Self::Error>;

    /// Creates a fresh, empty blob at `path`, replacing any existing one.
    ///
    /// Bytes become visible as they are written, so callers write to a
    /// private path and `move_blob` it into place when done.
    async fn open_write(&self, path: &str) -> Result<Self::Writer, Self::Error>;

    /// The size of the blob, or `None` if there is none at `path`.
    async fn size(&self, path: &str) -> Result<Option<u64>, Self::Error>;

    /// Deletes the blob. Deleting a missing blob is not an error.
    async fn delete(&self, path: &str) -> Result<(), Self::Error>;

    /// Atomically moves `from` to `to`, replacing whatever was at `to`.
    async fn move_blob(&self, from: &str, to: &str) -> Result<(), Self::Error>;

    async fn exists(&self, path: &str) -> Result<bool, Self::Error> {
        Ok(self.size(path).await?.is_some())
    }

    async fn put(&self, path: &str, blob: Vec<u8>) -> Result<(), Self::Error> {
        self.put_stream(path, blob.as_slice()).await?;
        Ok(())
    }

    /// Streams `reader` into a blob at `path`, returning the number of bytes written.
    async fn put_stream<R>(&self, path: &str, mut reader: R) -> Result<u64, Self::Error>
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut writer = self.open_write(path).await?;
        let written = tokio::io::copy(&mut reader, &mut writer).await?;
        writer.shutdown().await?;
        Ok(written)
    }
}
