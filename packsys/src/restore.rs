//! Restoration of cached layers into the layers directory before a build.
//!
//! The inverse of the cache phase: validated layers are extracted from the
//! cache store back onto disk, and their `.toml` + `.sha` sidecars are
//! re-emitted so the next build and export see them exactly as the
//! previous build left them.

use crate::buildpack::GroupEntry;
use crate::common::fs;
use crate::error::PhaseError;
use crate::layers::{read_buildpack_layers_dir, LayerMetadataFile};
use crate::metadata::{CacheMetadata, LayersMetadata};
use anyhow::{ensure, Context, Result};
use image_store::CacheStore;
use log::{debug, info};
use std::path::{Path, PathBuf};
use tracing::instrument;

pub struct LayerMetadataRestorer {
    pub layers_dir: PathBuf,
    pub buildpacks: Vec<GroupEntry>,
}

impl LayerMetadataRestorer {
    /// Restore every valid cached layer for the group.
    ///
    /// A cached layer is valid when its buildpack (id and version) is in
    /// the group and, for launch layers, the digest recorded by the cache
    /// matches the one recorded by the previous image; a mismatch means
    /// the cache is stale for that layer and it is skipped.
    #[instrument(level = "trace", skip_all)]
    pub async fn restore(
        &self,
        layers_metadata: &LayersMetadata,
        cache_metadata: &CacheMetadata,
        cache: &dyn CacheStore,
    ) -> Result<()> {
        for bp in &self.buildpacks {
            let Some(cached_bp) = cache_metadata.metadata_for_buildpack(bp.id.as_str()) else {
                continue;
            };
            if cached_bp.version != bp.version {
                info!(
                    "Skipping cached layers of '{}': cached version '{}' does not match '{}'",
                    bp.id, cached_bp.version, bp.version
                );
                continue;
            }
            let bp_dir = read_buildpack_layers_dir(&self.layers_dir, bp).await?;
            for (name, cached_layer) in &cached_bp.layers {
                if !cached_layer.cache {
                    continue;
                }
                if cached_layer.launch {
                    let image_sha = layers_metadata.layer_sha(bp.id.as_str(), name);
                    if image_sha != Some(cached_layer.sha.as_str()) {
                        info!(
                            "Skipping cached layer '{}:{name}': digest does not match the previous image",
                            bp.id
                        );
                        continue;
                    }
                }
                let layer = bp_dir.new_layer(name);
                debug!("Restoring layer '{}' from cache", layer.identifier());
                self.extract_layer(cache, &cached_layer.sha).await?;
                layer
                    .write_metadata(&LayerMetadataFile {
                        launch: cached_layer.launch,
                        build: cached_layer.build,
                        cache: cached_layer.cache,
                        metadata: cached_layer.data.clone(),
                    })
                    .await?;
                layer.write_sha(&cached_layer.sha).await?;
            }
        }
        Ok(())
    }

    /// Stream a cached tarball to disk and unpack it. Layer tars carry the
    /// absolute path of the layers directory they were built from; every
    /// entry is checked against it before anything touches the filesystem.
    async fn extract_layer(&self, cache: &dyn CacheStore, sha: &str) -> Result<()> {
        let mut reader = cache
            .retrieve_layer(sha)
            .await
            .map_err(|source| PhaseError::ImageIo { source })
            .context(format!("retrieving cached layer '{sha}'"))?;
        let staging = tempfile::NamedTempFile::new().context("staging cached layer")?;
        let mut file = tokio::fs::File::create(staging.path())
            .await
            .context("staging cached layer")?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .context(format!("streaming cached layer '{sha}'"))?;
        drop(file);

        let layers_dir = fs::canonicalize(&self.layers_dir).await?;
        let tar_path = staging.path().to_path_buf();
        tokio::task::spawn_blocking(move || unpack_within(&tar_path, &layers_dir))
            .await
            .context("cached layer unpack task panicked")?
    }
}

fn unpack_within(tar_path: &Path, layers_dir: &Path) -> Result<()> {
    let file = std::fs::File::open(tar_path)
        .context(format!("Unable to open '{}'", tar_path.display()))?;
    let mut archive = tar::Archive::new(file);
    archive.set_preserve_permissions(true);
    for entry in archive.entries().context("reading cached layer tar")? {
        let mut entry = entry.context("reading cached layer tar")?;
        let target = Path::new("/").join(entry.path().context("cached layer entry path")?);
        // Ancestors of the layers dir ride along in the tar; they exist
        // already and must not be touched.
        if layers_dir.starts_with(&target) {
            continue;
        }
        ensure!(
            target.starts_with(layers_dir),
            "cached layer entry '{}' escapes the layers directory",
            target.display()
        );
        entry
            .unpack(&target)
            .context(format!("unpacking '{}'", target.display()))?;
    }
    Ok(())
}
