//! The cache phase: persist every `cache=true` layer, keyed by its tar
//! digest, so later builds can restore or reuse it without rebuilding.

use crate::buildpack::GroupEntry;
use crate::error::PhaseError;
use crate::layers::factory::{Layer, LayerFactory};
use crate::layers::{for_cached, read_buildpack_layers_dir};
use crate::metadata::{BuildpackLayerMetadata, BuildpackLayersMetadata, CacheMetadata};
use anyhow::{bail, Context, Result};
use image_store::CacheStore;
use log::{debug, info};
use std::path::Path;
use tracing::instrument;

pub struct Cacher {
    pub buildpacks: Vec<GroupEntry>,
    pub layer_factory: LayerFactory,
}

impl Cacher {
    /// Persist cache layers and their metadata, then commit. The store's
    /// previous state stays visible until the commit lands.
    #[instrument(level = "trace", skip_all, fields(cache = %store.name()))]
    pub async fn cache(&self, layers_dir: &Path, store: &mut dyn CacheStore) -> Result<()> {
        let orig = read_cache_metadata(store)
            .await
            .context("metadata for previous cache")?;
        let mut meta = CacheMetadata::default();

        for bp in &self.buildpacks {
            let bp_dir = read_buildpack_layers_dir(layers_dir, bp)
                .await
                .context(format!("reading layers for buildpack '{}'", bp.id))?;
            let mut bp_md = BuildpackLayersMetadata {
                id: bp.id.to_string(),
                version: bp.version.clone(),
                ..Default::default()
            };
            for layer in bp_dir.find_layers(for_cached).await {
                if !layer.has_local_contents() {
                    bail!(
                        "failed to cache layer '{}' because it has no contents",
                        layer.identifier()
                    );
                }
                let layer_metadata = layer
                    .read()
                    .await
                    .context(format!("reading '{}' metadata", layer.identifier()))?;
                let materialized = self
                    .layer_factory
                    .dir_layer(layer.identifier(), layer.path())
                    .await
                    .context(format!("creating layer '{}'", layer.identifier()))?;
                let previous_sha = orig.layer_sha(bp.id.as_str(), &layer.name());
                let sha = add_or_reuse_cache_layer(store, &materialized, previous_sha).await?;
                layer.write_sha(&sha).await?;
                bp_md.layers.insert(
                    layer.name(),
                    BuildpackLayerMetadata {
                        sha,
                        launch: layer_metadata.launch,
                        build: layer_metadata.build,
                        cache: layer_metadata.cache,
                        data: layer_metadata.metadata,
                    },
                );
            }
            meta.buildpacks.push(bp_md);
        }

        let encoded = serde_json::to_vec(&meta).context("failed to serialize cache metadata")?;
        store
            .set_metadata(encoded)
            .await
            .map_err(|source| PhaseError::ImageIo { source })
            .context("setting cache metadata")?;
        store
            .commit()
            .await
            .map_err(|source| PhaseError::ImageIo { source })
            .context("committing cache")?;
        Ok(())
    }
}

/// Digest equality decides between re-staging the previous blob and adding
/// a fresh one. Returns the digest either way.
async fn add_or_reuse_cache_layer(
    store: &mut dyn CacheStore,
    layer: &Layer,
    previous_sha: Option<&str>,
) -> Result<String> {
    if Some(layer.digest.as_str()) == previous_sha {
        info!("Reusing cache layer '{}'", layer.id);
        debug!("Layer '{}' SHA: {}", layer.id, layer.digest);
        store
            .reuse_layer(&layer.digest)
            .await
            .map_err(|source| PhaseError::ImageIo { source })
            .context(format!("reusing cache layer: '{}'", layer.id))?;
    } else {
        info!("Adding cache layer '{}'", layer.id);
        debug!("Layer '{}' SHA: {}", layer.id, layer.digest);
        store
            .add_layer_file(&layer.tar_path, &layer.digest)
            .await
            .map_err(|source| PhaseError::ImageIo { source })
            .context(format!("adding cache layer: '{}'", layer.id))?;
    }
    Ok(layer.digest.clone())
}

/// The committed cache metadata document, or empty metadata for a new cache.
pub async fn read_cache_metadata(store: &dyn CacheStore) -> Result<CacheMetadata> {
    let raw = store
        .retrieve_metadata()
        .await
        .map_err(|source| PhaseError::ImageIo { source })?;
    if raw.is_empty() {
        return Ok(CacheMetadata::default());
    }
    serde_json::from_slice(&raw).context("failed to parse cache metadata")
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use image_store::LocalCache;

    fn bp(id: &str) -> GroupEntry {
        let mut entry = GroupEntry::new(id, "1.0");
        entry.api = Some("0.5".parse().unwrap());
        entry
    }

    async fn write_cached_layer(layers_dir: &Path, bp: &str, name: &str, contents: &str) {
        let dir = layers_dir.join(bp).join(name);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("data"), contents).await.unwrap();
        tokio::fs::write(
            layers_dir.join(bp).join(format!("{name}.toml")),
            "cache = true\n",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn caches_layers_and_records_metadata() {
        let temp = tempfile::tempdir().unwrap();
        let layers_dir = temp.path().join("layers");
        write_cached_layer(&layers_dir, "node", "deps", "modules").await;

        let mut store = LocalCache::open(temp.path().join("cache")).await.unwrap();
        let cacher = Cacher {
            buildpacks: vec![bp("node")],
            layer_factory: LayerFactory::new(temp.path()),
        };
        cacher.cache(&layers_dir, &mut store).await.unwrap();

        let meta = read_cache_metadata(&store).await.unwrap();
        let sha = meta.layer_sha("node", "deps").unwrap().to_string();
        assert!(sha.starts_with("sha256:"));
        assert!(store.retrieve_layer(&sha).await.is_ok());
        // The sha sidecar is written next to the layer.
        let sidecar = tokio::fs::read_to_string(layers_dir.join("node/deps.sha"))
            .await
            .unwrap();
        assert_eq!(sidecar, sha);
    }

    #[tokio::test]
    async fn cache_layer_without_contents_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let layers_dir = temp.path().join("layers");
        tokio::fs::create_dir_all(layers_dir.join("node")).await.unwrap();
        tokio::fs::write(layers_dir.join("node/ghost.toml"), "cache = true\n")
            .await
            .unwrap();

        let mut store = LocalCache::open(temp.path().join("cache")).await.unwrap();
        let cacher = Cacher {
            buildpacks: vec![bp("node")],
            layer_factory: LayerFactory::new(temp.path()),
        };
        let err = cacher.cache(&layers_dir, &mut store).await.unwrap_err();
        assert!(err.to_string().contains("has no contents"));
    }

    /// Store double recording reuse/add decisions.
    #[derive(Debug, Default)]
    struct RecordingCache {
        metadata: Vec<u8>,
        added: Vec<String>,
        reused: Vec<String>,
        committed: usize,
    }

    #[async_trait]
    impl CacheStore for RecordingCache {
        fn name(&self) -> String {
            "recording".into()
        }

        async fn set_metadata(&mut self, metadata: Vec<u8>) -> image_store::Result<()> {
            self.metadata = metadata;
            Ok(())
        }

        async fn retrieve_metadata(&self) -> image_store::Result<Vec<u8>> {
            Ok(self.metadata.clone())
        }

        async fn add_layer_file(
            &mut self,
            _tar_path: &std::path::Path,
            diff_id: &str,
        ) -> image_store::Result<()> {
            self.added.push(diff_id.to_string());
            Ok(())
        }

        async fn reuse_layer(&mut self, diff_id: &str) -> image_store::Result<()> {
            self.reused.push(diff_id.to_string());
            Ok(())
        }

        async fn retrieve_layer(
            &self,
            _diff_id: &str,
        ) -> image_store::Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>> {
            unimplemented!("not needed for these tests")
        }

        async fn commit(&mut self) -> image_store::Result<()> {
            self.committed += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn unchanged_layers_are_reused_by_digest() {
        let temp = tempfile::tempdir().unwrap();
        let layers_dir = temp.path().join("layers");
        write_cached_layer(&layers_dir, "node", "deps", "modules").await;

        let mut store = RecordingCache::default();
        let cacher = Cacher {
            buildpacks: vec![bp("node")],
            layer_factory: LayerFactory::new(temp.path()),
        };
        cacher.cache(&layers_dir, &mut store).await.unwrap();
        assert_eq!(store.added.len(), 1);
        assert!(store.reused.is_empty());

        // Second run with unchanged content: reuse, no new upload.
        cacher.cache(&layers_dir, &mut store).await.unwrap();
        assert_eq!(store.added.len(), 1);
        assert_eq!(store.reused.len(), 1);
        assert_eq!(store.added[0], store.reused[0]);
        assert_eq!(store.committed, 2);
    }

    #[tokio::test]
    async fn launch_only_layers_are_not_cached() {
        let temp = tempfile::tempdir().unwrap();
        let layers_dir = temp.path().join("layers");
        let dir = layers_dir.join("node").join("runtime");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            layers_dir.join("node/runtime.toml"),
            "launch = true\n",
        )
        .await
        .unwrap();

        let mut store = RecordingCache::default();
        let cacher = Cacher {
            buildpacks: vec![bp("node")],
            layer_factory: LayerFactory::new(temp.path()),
        };
        cacher.cache(&layers_dir, &mut store).await.unwrap();
        assert!(store.added.is_empty());
        let meta: CacheMetadata = serde_json::from_slice(&store.metadata).unwrap();
        assert!(meta.buildpacks[0].layers.is_empty());
    }
}
