//! Blobstore wrappers that misbehave on purpose.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{Notify, Semaphore};

use crate::blobstore::{BlobStore, MemBlobStore};
use crate::store::ChunkUpload;

pub fn upload(upload_id: &str, chunk_index: u32, total_chunks: u32) -> ChunkUpload {
    ChunkUpload {
        upload_id: upload_id.into(),
        chunk_index,
        total_chunks,
        original_name: "final_video.mp4".into(),
        mime_type: "video/mp4".into(),
    }
}

/// A reader that fails instead of yielding any bytes.
pub enum FlakyReader<R> {
    Healthy(R),
    Broken,
}

impl<R: AsyncRead + Unpin> AsyncRead for FlakyReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Healthy(reader) => Pin::new(reader).poll_read(cx, buf),
            Self::Broken => Poll::Ready(Err(io::Error::other("injected read failure"))),
        }
    }
}

/// Fails reads of every blob whose path starts with a configured prefix.
#[derive(Debug, Clone, Default)]
pub struct FlakyBlobStore {
    pub inner: MemBlobStore,
    broken_prefix: Arc<Mutex<Option<String>>>,
    pub reads: Arc<Mutex<Vec<String>>>,
}

impl FlakyBlobStore {
    pub fn break_reads(&self, prefix: &str) {
        *self.broken_prefix.lock().unwrap() = Some(prefix.into());
    }

    pub fn heal(&self) {
        self.broken_prefix.lock().unwrap().take();
    }
}

#[async_trait::async_trait]
impl BlobStore for FlakyBlobStore {
    type Error = io::Error;
    type Reader = FlakyReader<<MemBlobStore as BlobStore>::Reader>;
    type Writer = <MemBlobStore as BlobStore>::Writer;

    async fn open_read(&self, path: &str) -> io::Result<Self::Reader> {
        self.reads.lock().unwrap().push(path.into());
        let reader = self.inner.open_read(path).await?;
        let broken = self
            .broken_prefix
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|prefix| path.starts_with(prefix.as_str()));
        Ok(if broken {
            FlakyReader::Broken
        } else {
            FlakyReader::Healthy(reader)
        })
    }

    async fn open_write(&self, path: &str) -> io::Result<Self::Writer> {
        self.inner.open_write(path).await
    }

    async fn size(&self, path: &str) -> io::Result<Option<u64>> {
        self.inner.size(path).await
    }

    async fn delete(&self, path: &str) -> io::Result<()> {
        self.inner.delete(path).await
    }

    async fn move_blob(&self, from: &str, to: &str) -> io::Result<()> {
        self.inner.move_blob(from, to).await
    }
}

/// Which `BlobStore` calls a `GatedBlobStore` parks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gated {
    Reads,
    Moves,
}

/// Parks every gated call until the gate is opened.
#[derive(Debug, Clone)]
pub struct GatedBlobStore {
    pub inner: MemBlobStore,
    /// Notified whenever a call arrives at the gate.
    pub arrived: Arc<Notify>,
    gated: Gated,
    gate: Arc<Semaphore>,
    opened: Arc<AtomicBool>,
}

impl GatedBlobStore {
    pub fn new(gated: Gated) -> Self {
        Self {
            inner: MemBlobStore::new(),
            arrived: Arc::new(Notify::new()),
            gated,
            gate: Arc::new(Semaphore::new(0)),
            opened: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn open_gate(&self) {
        if !self.opened.swap(true, Ordering::SeqCst) {
            self.gate.add_permits(1);
        }
    }

    async fn pass(&self, call: Gated) -> io::Result<()> {
        if call == self.gated {
            self.arrived.notify_one();
            let _permit = self.gate.acquire().await.map_err(io::Error::other)?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlobStore for GatedBlobStore {
    type Error = io::Error;
    type Reader = <MemBlobStore as BlobStore>::Reader;
    type Writer = <MemBlobStore as BlobStore>::Writer;

    async fn open_read(&self, path: &str) -> io::Result<Self::Reader> {
        self.pass(Gated::Reads).await?;
        self.inner.open_read(path).await
    }

    async fn open_write(&self, path: &str) -> io::Result<Self::Writer> {
        self.inner.open_write(path).await
    }

    async fn size(&self, path: &str) -> io::Result<Option<u64>> {
        self.inner.size(path).await
    }

    async fn delete(&self, path: &str) -> io::Result<()> {
        self.inner.delete(path).await
    }

    async fn move_blob(&self, from: &str, to: &str) -> io::Result<()> {
        self.pass(Gated::Moves).await?;
        self.inner.move_blob(from, to).await
    }
}
