use core::fmt;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;

use super::BlobStore;

#[derive(Default)]
pub struct Blob(Vec<u8>);
impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.0.len().min(64);
        let printed = String::from_utf8_lossy(&self.0[..len]);

        write!(
            f,
            "Blob({printed:?}{})",
            if len < self.0.len() { "…" } else { "" }
        )
    }
}

type Blobs = Arc<RwLock<HashMap<String, Blob>>>;

/// Keeps all blobs in memory. Clones share the same contents.
#[derive(Debug, Default, Clone)]
pub struct MemBlobStore {
    blobs: Blobs,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.blobs.read().unwrap().keys().cloned().collect();
        paths.sort_unstable();
        paths
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs.read().unwrap().get(path).map(|blob| blob.0.clone())
    }
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no blob at {path:?}"))
}

/// Appends straight into the shared map on every write.
pub struct MemWriter {
    blobs: Blobs,
    path: String,
}

impl AsyncWrite for MemWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut blobs = self.blobs.write().unwrap();
        blobs.entry(self.path.clone()).or_default().0.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait::async_trait]
impl BlobStore for MemBlobStore {
    type Error = io::Error;
    type Reader = io::Cursor<Vec<u8>>;
    type Writer = MemWriter;

    async fn open_read(&self, path: &str) -> io::Result<Self::Reader> {
        let contents = self.contents(path).ok_or_else(|| not_found(path))?;
        Ok(io::Cursor::new(contents))
    }

    async fn open_write(&self, path: &str) -> io::Result<MemWriter> {
        self.blobs
            .write()
            .unwrap()
            .insert(path.to_owned(), Blob::default());
        Ok(MemWriter {
            blobs: Arc::clone(&self.blobs),
            path: path.to_owned(),
        })
    }

    async fn size(&self, path: &str) -> io::Result<Option<u64>> {
        let blobs = self.blobs.read().unwrap();
        Ok(blobs.get(path).map(|blob| blob.0.len() as u64))
    }

    async fn delete(&self, path: &str) -> io::Result<()> {
        self.blobs.write().unwrap().remove(path);
        Ok(())
    }

    async fn move_blob(&self, from: &str, to: &str) -> io::Result<()> {
        let mut blobs = self.blobs.write().unwrap();
        let blob = blobs.remove(from).ok_or_else(|| not_found(from))?;
        blobs.insert(to.to_owned(), blob);
        Ok(())
    }

    async fn put(&self, path: &str, blob: Vec<u8>) -> io::Result<()> {
        self.blobs
            .write()
            .unwrap()
            .insert(path.to_owned(), Blob(blob));
        Ok(())
    }
}
