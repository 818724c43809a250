//! A filesystem-backed image store.
//!
//! Each saved image is a directory under the store root:
//!
//! ```text
//! <root>/<escaped-tag>/
//!   config.json       labels, env, entrypoint, cmd, ordered diff IDs
//!   blobs/<hex>.tar   one uncompressed tarball per unique diff ID
//! ```
//!
//! A build opens the store with an optional base image (the run image) and
//! an optional previous image (an earlier build of the same tag). The base
//! seeds the layer stack and env; the previous image's blobs back
//! `reuse_layer`. Saving writes a fresh directory per tag and swaps it into
//! place with a rename.

use crate::error::{
    ConfigDeserializeSnafu, ConfigReadSnafu, ConfigSerializeSnafu, EmptyImageSnafu, IoSnafu,
    MissingBlobSnafu, NoSuchLayerSnafu,
};
use crate::{diff_id_hex, Image, Result, SaveReport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";
const BLOBS_DIR: &str = "blobs";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ImageConfig {
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    entrypoint: Vec<String>,
    #[serde(default)]
    cmd: Vec<String>,
    #[serde(default)]
    diff_ids: Vec<String>,
}

/// Where the bytes for a pending layer come from at save time.
#[derive(Debug, Clone)]
enum BlobSource {
    /// A tarball produced by this build.
    Fresh(PathBuf),
    /// A blob already present in a saved image directory.
    Stored(PathBuf),
}

#[derive(Debug)]
pub struct LocalImage {
    root: PathBuf,
    name: String,
    config: ImageConfig,
    /// Pending layer stack, bottom to top.
    layers: Vec<(String, BlobSource)>,
    /// diff ID -> blob path, from the previous image and the base.
    known_blobs: BTreeMap<String, PathBuf>,
    /// Labels of the previously saved image under the same name.
    previous_labels: BTreeMap<String, String>,
}

impl LocalImage {
    /// Open a working image named `name` in the store at `root`.
    ///
    /// `base` (the run image) must already be saved in the store when given;
    /// its layers and env seed the new image. A previously saved image under
    /// `name` only contributes blobs for `reuse_layer`, never state.
    pub async fn open(root: &Path, name: &str, base: Option<&str>) -> Result<Self> {
        let mut image = Self {
            root: root.to_path_buf(),
            name: name.to_string(),
            config: ImageConfig::default(),
            layers: Vec::new(),
            known_blobs: BTreeMap::new(),
            previous_labels: BTreeMap::new(),
        };

        if let Some(base) = base {
            let base_dir = image.image_dir(base);
            let base_config = read_config(&base_dir).await?;
            for diff_id in &base_config.diff_ids {
                let blob = blob_path(&base_dir, diff_id)?;
                image.known_blobs.insert(diff_id.clone(), blob.clone());
                image.layers.push((diff_id.clone(), BlobSource::Stored(blob)));
                image.config.diff_ids.push(diff_id.clone());
            }
            image.config.env = base_config.env;
        }

        let prev_dir = image.image_dir(name);
        if prev_dir.join(CONFIG_FILE).is_file() {
            let prev_config = read_config(&prev_dir).await?;
            for diff_id in &prev_config.diff_ids {
                image
                    .known_blobs
                    .entry(diff_id.clone())
                    .or_insert(blob_path(&prev_dir, diff_id)?);
            }
            image.previous_labels = prev_config.labels;
        }

        Ok(image)
    }

    /// A label from the previously saved image under this name, if any.
    /// The working image's own labels start out empty.
    pub fn previous_label(&self, key: &str) -> Option<String> {
        self.previous_labels.get(key).cloned()
    }

    fn image_dir(&self, name: &str) -> PathBuf {
        self.root.join(escape_tag(name))
    }

    fn image_id(&self) -> Result<String> {
        let encoded = serde_json::to_vec(&self.config).context(ConfigSerializeSnafu)?;
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(&encoded))))
    }

    async fn write_image_dir(&self, tag: &str) -> Result<()> {
        let final_dir = self.image_dir(tag);
        let staging = self.root.join(format!(".tmp-{}", escape_tag(tag)));
        if staging.exists() {
            tokio::fs::remove_dir_all(&staging).await.context(IoSnafu {
                op: "remove",
                path: staging.clone(),
            })?;
        }
        let blobs = staging.join(BLOBS_DIR);
        tokio::fs::create_dir_all(&blobs).await.context(IoSnafu {
            op: "create",
            path: blobs.clone(),
        })?;

        for (diff_id, source) in &self.layers {
            let dest = blobs.join(format!("{}.tar", diff_id_hex(diff_id)?));
            if dest.exists() {
                continue;
            }
            let src = match source {
                BlobSource::Fresh(path) | BlobSource::Stored(path) => path,
            };
            tokio::fs::copy(src, &dest).await.context(IoSnafu {
                op: "copy layer blob to",
                path: dest.clone(),
            })?;
        }

        let encoded = serde_json::to_vec_pretty(&self.config).context(ConfigSerializeSnafu)?;
        let config_path = staging.join(CONFIG_FILE);
        tokio::fs::write(&config_path, encoded)
            .await
            .context(IoSnafu {
                op: "write",
                path: config_path,
            })?;

        if final_dir.exists() {
            tokio::fs::remove_dir_all(&final_dir).await.context(IoSnafu {
                op: "remove",
                path: final_dir.clone(),
            })?;
        }
        tokio::fs::rename(&staging, &final_dir)
            .await
            .context(IoSnafu {
                op: "rename staged image to",
                path: final_dir,
            })
    }
}

#[async_trait]
impl Image for LocalImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self, key: &str) -> Option<String> {
        self.config.labels.get(key).cloned()
    }

    fn env_var(&self, key: &str) -> Option<String> {
        self.config.env.get(key).cloned()
    }

    fn top_layer(&self) -> Result<String> {
        self.layers
            .last()
            .map(|(diff_id, _)| diff_id.clone())
            .context(EmptyImageSnafu { name: &self.name })
    }

    fn set_label(&mut self, key: &str, value: &str) {
        self.config.labels.insert(key.to_string(), value.to_string());
    }

    fn set_env(&mut self, key: &str, value: &str) {
        self.config.env.insert(key.to_string(), value.to_string());
    }

    fn set_entrypoint(&mut self, entrypoint: &str) {
        self.config.entrypoint = vec![entrypoint.to_string()];
    }

    fn set_cmd(&mut self, cmd: &[String]) {
        self.config.cmd = cmd.to_vec();
    }

    async fn add_layer_with_diff_id(&mut self, tar_path: &Path, diff_id: &str) -> Result<()> {
        diff_id_hex(diff_id)?;
        self.layers
            .push((diff_id.to_string(), BlobSource::Fresh(tar_path.to_path_buf())));
        self.config.diff_ids.push(diff_id.to_string());
        Ok(())
    }

    async fn reuse_layer(&mut self, diff_id: &str) -> Result<()> {
        let blob = self
            .known_blobs
            .get(diff_id)
            .context(NoSuchLayerSnafu {
                name: &self.name,
                diff_id,
            })?
            .clone();
        snafu::ensure!(
            blob.is_file(),
            MissingBlobSnafu {
                name: &self.name,
                diff_id
            }
        );
        self.layers
            .push((diff_id.to_string(), BlobSource::Stored(blob)));
        self.config.diff_ids.push(diff_id.to_string());
        Ok(())
    }

    async fn save(&mut self, additional_tags: &[String]) -> Result<SaveReport> {
        let mut tags = vec![self.name.clone()];
        tags.extend(additional_tags.iter().cloned());
        for tag in &tags {
            self.write_image_dir(tag).await?;
        }
        Ok(SaveReport {
            tags,
            image_id: self.image_id()?,
            digest: None,
        })
    }
}

async fn read_config(image_dir: &Path) -> Result<ImageConfig> {
    let path = image_dir.join(CONFIG_FILE);
    let bytes = tokio::fs::read(&path)
        .await
        .context(ConfigReadSnafu { path: path.clone() })?;
    serde_json::from_slice(&bytes).context(ConfigDeserializeSnafu { path })
}

fn blob_path(image_dir: &Path, diff_id: &str) -> Result<PathBuf> {
    Ok(image_dir
        .join(BLOBS_DIR)
        .join(format!("{}.tar", diff_id_hex(diff_id)?)))
}

/// Image tags contain `/` and `:`; flatten them for use as a directory name.
fn escape_tag(tag: &str) -> String {
    tag.replace('/', "_").replace(':', "-")
}
