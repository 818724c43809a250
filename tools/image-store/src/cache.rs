//! A filesystem-backed layer cache with staged commits.
//!
//! ```text
//! <root>/
//!   committed/            state visible to readers
//!     metadata.json
//!     blobs/<hex>.tar
//!   staging/              state being assembled by the current build
//! ```
//!
//! Readers only ever touch `committed/`. A build stages metadata and blobs,
//! then `commit` swaps `staging/` into place with renames, so a crashed or
//! abandoned build leaves the previous state intact. Layers that are not
//! re-staged (added or reused) are dropped at commit, which is how stale
//! cache content gets pruned.

use crate::error::{Error, IoSnafu, NoSuchCacheLayerSnafu};
use crate::{diff_id_hex, CacheStore, Result};
use async_trait::async_trait;
use snafu::ensure;
use snafu::ResultExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;

const COMMITTED_DIR: &str = "committed";
const STAGING_DIR: &str = "staging";
const BLOBS_DIR: &str = "blobs";
const METADATA_FILE: &str = "metadata.json";

#[derive(Debug)]
pub struct LocalCache {
    root: PathBuf,
    staged: bool,
}

impl LocalCache {
    /// Open (creating if necessary) a cache rooted at `root`. Any staging
    /// directory left behind by an interrupted build is discarded.
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let staging = root.join(STAGING_DIR);
        if staging.exists() {
            tokio::fs::remove_dir_all(&staging).await.context(IoSnafu {
                op: "remove stale staging dir",
                path: staging,
            })?;
        }
        tokio::fs::create_dir_all(root.join(COMMITTED_DIR).join(BLOBS_DIR))
            .await
            .context(IoSnafu {
                op: "create",
                path: root.join(COMMITTED_DIR).join(BLOBS_DIR),
            })?;
        Ok(Self {
            root,
            staged: false,
        })
    }

    fn committed(&self) -> PathBuf {
        self.root.join(COMMITTED_DIR)
    }

    fn staging(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    async fn ensure_staging(&mut self) -> Result<PathBuf> {
        let staging = self.staging();
        if !self.staged {
            tokio::fs::create_dir_all(staging.join(BLOBS_DIR))
                .await
                .context(IoSnafu {
                    op: "create",
                    path: staging.join(BLOBS_DIR),
                })?;
            self.staged = true;
        }
        Ok(staging)
    }

    fn committed_blob(&self, diff_id: &str) -> Result<PathBuf> {
        Ok(self
            .committed()
            .join(BLOBS_DIR)
            .join(format!("{}.tar", diff_id_hex(diff_id)?)))
    }
}

#[async_trait]
impl CacheStore for LocalCache {
    fn name(&self) -> String {
        self.root.display().to_string()
    }

    async fn set_metadata(&mut self, metadata: Vec<u8>) -> Result<()> {
        let staging = self.ensure_staging().await?;
        let path = staging.join(METADATA_FILE);
        tokio::fs::write(&path, metadata).await.context(IoSnafu {
            op: "write",
            path,
        })
    }

    async fn retrieve_metadata(&self) -> Result<Vec<u8>> {
        let path = self.committed().join(METADATA_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::Io {
                op: "read",
                path,
                source: e,
            }),
        }
    }

    async fn add_layer_file(&mut self, tar_path: &Path, diff_id: &str) -> Result<()> {
        let staging = self.ensure_staging().await?;
        let dest = staging
            .join(BLOBS_DIR)
            .join(format!("{}.tar", diff_id_hex(diff_id)?));
        tokio::fs::copy(tar_path, &dest).await.context(IoSnafu {
            op: "copy layer into cache at",
            path: dest,
        })?;
        Ok(())
    }

    async fn reuse_layer(&mut self, diff_id: &str) -> Result<()> {
        let src = self.committed_blob(diff_id)?;
        ensure!(src.is_file(), NoSuchCacheLayerSnafu { diff_id });
        let staging = self.ensure_staging().await?;
        let dest = staging
            .join(BLOBS_DIR)
            .join(format!("{}.tar", diff_id_hex(diff_id)?));
        // Hard link when possible; same-filesystem by construction.
        if tokio::fs::hard_link(&src, &dest).await.is_err() {
            tokio::fs::copy(&src, &dest).await.context(IoSnafu {
                op: "copy reused layer to",
                path: dest,
            })?;
        }
        Ok(())
    }

    async fn retrieve_layer(&self, diff_id: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let path = self.committed_blob(diff_id)?;
        ensure!(path.is_file(), NoSuchCacheLayerSnafu { diff_id });
        let file = tokio::fs::File::open(&path).await.context(IoSnafu {
            op: "open",
            path,
        })?;
        Ok(Box::new(file))
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.staged {
            return Ok(());
        }
        let committed = self.committed();
        let retired = self.root.join(".retired");
        if retired.exists() {
            tokio::fs::remove_dir_all(&retired).await.context(IoSnafu {
                op: "remove",
                path: retired.clone(),
            })?;
        }
        tokio::fs::rename(&committed, &retired)
            .await
            .context(IoSnafu {
                op: "retire committed state at",
                path: committed.clone(),
            })?;
        tokio::fs::rename(self.staging(), &committed)
            .await
            .context(IoSnafu {
                op: "promote staged state to",
                path: committed,
            })?;
        tokio::fs::remove_dir_all(&retired).await.context(IoSnafu {
            op: "remove",
            path: retired,
        })?;
        self.staged = false;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sha2::{Digest, Sha256};
    use tokio::io::AsyncReadExt;

    fn diff_id_of(contents: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(contents)))
    }

    #[tokio::test]
    async fn metadata_is_empty_until_committed() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = LocalCache::open(dir.path()).await.unwrap();
        assert!(cache.retrieve_metadata().await.unwrap().is_empty());

        cache.set_metadata(b"{\"v\":1}".to_vec()).await.unwrap();
        // Still empty: nothing committed yet.
        assert!(cache.retrieve_metadata().await.unwrap().is_empty());

        cache.commit().await.unwrap();
        assert_eq!(cache.retrieve_metadata().await.unwrap(), b"{\"v\":1}");
    }

    #[tokio::test]
    async fn layer_round_trip_and_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let contents = b"tarball bytes".to_vec();
        let diff_id = diff_id_of(&contents);
        let tar = scratch.path().join("layer.tar");
        tokio::fs::write(&tar, &contents).await.unwrap();

        let mut cache = LocalCache::open(dir.path()).await.unwrap();
        cache.add_layer_file(&tar, &diff_id).await.unwrap();
        cache.commit().await.unwrap();

        let mut reader = cache.retrieve_layer(&diff_id).await.unwrap();
        let mut read_back = Vec::new();
        reader.read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, contents);

        // A second build reuses the layer; after commit it is still present.
        cache.reuse_layer(&diff_id).await.unwrap();
        cache.commit().await.unwrap();
        assert!(cache.retrieve_layer(&diff_id).await.is_ok());
    }

    #[tokio::test]
    async fn uncommitted_layers_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let contents = b"doomed".to_vec();
        let diff_id = diff_id_of(&contents);
        let tar = scratch.path().join("layer.tar");
        tokio::fs::write(&tar, &contents).await.unwrap();

        {
            let mut cache = LocalCache::open(dir.path()).await.unwrap();
            cache.add_layer_file(&tar, &diff_id).await.unwrap();
            // No commit.
        }
        let cache = LocalCache::open(dir.path()).await.unwrap();
        assert!(cache.retrieve_layer(&diff_id).await.is_err());
    }

    #[tokio::test]
    async fn commit_prunes_layers_not_restaged() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let keep = b"keep me".to_vec();
        let drop_ = b"drop me".to_vec();
        let keep_id = diff_id_of(&keep);
        let drop_id = diff_id_of(&drop_);
        let keep_tar = scratch.path().join("keep.tar");
        let drop_tar = scratch.path().join("drop.tar");
        tokio::fs::write(&keep_tar, &keep).await.unwrap();
        tokio::fs::write(&drop_tar, &drop_).await.unwrap();

        let mut cache = LocalCache::open(dir.path()).await.unwrap();
        cache.add_layer_file(&keep_tar, &keep_id).await.unwrap();
        cache.add_layer_file(&drop_tar, &drop_id).await.unwrap();
        cache.commit().await.unwrap();

        cache.reuse_layer(&keep_id).await.unwrap();
        cache.commit().await.unwrap();

        assert!(cache.retrieve_layer(&keep_id).await.is_ok());
        assert!(cache.retrieve_layer(&drop_id).await.is_err());
    }
}
