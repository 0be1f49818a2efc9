//! Filesystem abstraction behind the static handler.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

/// What the file server needs to know about an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub len: u64,
    pub is_dir: bool,
    pub modified: Option<SystemTime>,
}

/// A read-only tree of files addressed by slash-separated relative paths
/// (`"css/site.css"`, `"."` for the root).
///
/// Implementations must refuse to resolve anything outside their root.
#[async_trait]
pub trait FileSystem: Send + Sync + 'static {
    async fn stat(&self, name: &str) -> io::Result<Metadata>;
    async fn read(&self, name: &str) -> io::Result<Bytes>;
}

/// The on-disk [`FileSystem`] rooted at a directory.
#[derive(Clone, Debug)]
pub struct DirFs {
    root: PathBuf,
}

impl DirFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let mut path = self.root.clone();
        for part in name.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid path {name:?}"),
                    ));
                }
                part => path.push(part),
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl FileSystem for DirFs {
    async fn stat(&self, name: &str) -> io::Result<Metadata> {
        let meta = tokio::fs::metadata(self.resolve(name)?).await?;
        Ok(Metadata {
            len: meta.len(),
            is_dir: meta.is_dir(),
            modified: meta.modified().ok(),
        })
    }

    async fn read(&self, name: &str) -> io::Result<Bytes> {
        let bytes = tokio::fs::read(self.resolve(name)?).await?;
        Ok(Bytes::from(bytes))
    }
}
