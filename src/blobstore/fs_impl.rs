use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::fs;

use super::BlobStore;

/// How often creating a blob is retried after its directory vanished underneath it.
const PRUNE_RETRIES: u32 = 3;

/// Stores blobs as plain files below a root directory.
///
/// `move_blob` is a `rename`, which is atomic as long as the root does not
/// span multiple filesystems.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path);
        let all_normal = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if path.is_empty() || !all_normal {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("blob path {path:?} escapes the store"),
            ));
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_parent(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    type Error = io::Error;
    type Reader = fs::File;
    type Writer = fs::File;

    async fn open_read(&self, path: &str) -> io::Result<fs::File> {
        fs::File::open(self.full_path(path)?).await
    }

    async fn open_write(&self, path: &str) -> io::Result<fs::File> {
        let path = self.full_path(path)?;
        let mut attempt = 0;
        loop {
            self.ensure_parent(&path).await?;
            match fs::File::create(&path).await {
                // a concurrent `delete` pruned the directory we just created
                Err(err) if err.kind() == io::ErrorKind::NotFound && attempt < PRUNE_RETRIES => {
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn size(&self, path: &str) -> io::Result<Option<u64>> {
        match fs::metadata(self.full_path(path)?).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn delete(&self, path: &str) -> io::Result<()> {
        let path = self.full_path(path)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        }

        // drop the per-upload directory once its last blob is gone
        if let Some(parent) = path.parent() {
            if parent != self.root {
                let _ = fs::remove_dir(parent).await;
            }
        }
        Ok(())
    }

    async fn move_blob(&self, from: &str, to: &str) -> io::Result<()> {
        let from = self.full_path(from)?;
        let to = self.full_path(to)?;
        let mut attempt = 0;
        loop {
            self.ensure_parent(&to).await?;
            match fs::rename(&from, &to).await {
                Err(err) if err.kind() == io::ErrorKind::NotFound && attempt < PRUNE_RETRIES => {
                    attempt += 1;
                }
                result => break result?,
            }
        }

        if let Some(parent) = from.parent() {
            if parent != self.root {
                let _ = fs::remove_dir(parent).await;
            }
        }
        Ok(())
    }
}
