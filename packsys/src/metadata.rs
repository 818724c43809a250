//! Metadata serialized onto images as JSON labels and passed between
//! phases as TOML.

use crate::buildpack::GroupEntry;
use crate::common::fs;
use crate::launch::{Label, LaunchMetadata, Process, Slice};
use crate::layers::StoreToml;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const LAYER_METADATA_LABEL: &str = "io.buildpacks.lifecycle.metadata";
pub const BUILD_METADATA_LABEL: &str = "io.buildpacks.build.metadata";
pub const PROJECT_METADATA_LABEL: &str = "io.buildpacks.project.metadata";

pub const ENV_LAYERS_DIR: &str = "CNB_LAYERS_DIR";
pub const ENV_APP_DIR: &str = "CNB_APP_DIR";
pub const ENV_PLATFORM_API: &str = "CNB_PLATFORM_API";
pub const ENV_DEPRECATION_MODE: &str = "CNB_DEPRECATION_MODE";
pub const ENV_PROCESS_TYPE: &str = "CNB_PROCESS_TYPE";
pub const DEPRECATION_MODE_QUIET: &str = "quiet";

/// A single layer's digest, as recorded in image metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha: String,
}

/// Everything recorded about one buildpack-contributed layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildpackLayerMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha: String,
    #[serde(default)]
    pub launch: bool,
    #[serde(default)]
    pub build: bool,
    #[serde(default)]
    pub cache: bool,
    #[serde(default, skip_serializing_if = "toml::value::Table::is_empty")]
    pub data: toml::value::Table,
}

/// One buildpack's section of [`LayersMetadata`] or [`CacheMetadata`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildpackLayersMetadata {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub layers: BTreeMap<String, BuildpackLayerMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreToml>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunImageMetadata {
    #[serde(default, rename = "topLayer", skip_serializing_if = "String::is_empty")]
    pub top_layer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
}

/// Stack identity carried from build to image; opaque to the engine.
/// Serialized as camelCase in image labels; `stack.toml` spells the key
/// `run-image`, accepted via the alias.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackMetadata {
    #[serde(
        default,
        rename = "runImage",
        alias = "run-image",
        skip_serializing_if = "Option::is_none"
    )]
    pub run_image: Option<StackRunImageMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackRunImageMetadata {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<String>,
}

/// The `io.buildpacks.lifecycle.metadata` label: every sha here names a tar
/// blob present in the image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayersMetadata {
    #[serde(default, rename = "runImage")]
    pub run_image: RunImageMetadata,
    #[serde(default)]
    pub stack: StackMetadata,
    #[serde(default)]
    pub launcher: LayerMetadata,
    #[serde(default)]
    pub config: LayerMetadata,
    #[serde(default, rename = "processTypes")]
    pub process_types: LayerMetadata,
    #[serde(default)]
    pub app: Vec<LayerMetadata>,
    #[serde(default)]
    pub buildpacks: Vec<BuildpackLayersMetadata>,
}

impl LayersMetadata {
    pub fn metadata_for_buildpack(&self, id: &str) -> Option<&BuildpackLayersMetadata> {
        self.buildpacks.iter().find(|bp| bp.id == id)
    }

    /// The previous digest for `(buildpack, layer)`, if any.
    pub fn layer_sha(&self, buildpack_id: &str, layer_name: &str) -> Option<&str> {
        self.metadata_for_buildpack(buildpack_id)
            .and_then(|bp| bp.layers.get(layer_name))
            .map(|layer| layer.sha.as_str())
    }

    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to parse layers metadata label")
    }
}

/// Structurally [`LayersMetadata`] restricted to cache=true layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    #[serde(default)]
    pub buildpacks: Vec<BuildpackLayersMetadata>,
}

impl CacheMetadata {
    pub fn metadata_for_buildpack(&self, id: &str) -> Option<&BuildpackLayersMetadata> {
        self.buildpacks.iter().find(|bp| bp.id == id)
    }

    pub fn layer_sha(&self, buildpack_id: &str, layer_name: &str) -> Option<&str> {
        self.metadata_for_buildpack(buildpack_id)
            .and_then(|bp| bp.layers.get(layer_name))
            .map(|layer| layer.sha.as_str())
    }
}

/// Provenance of the launcher binary, recorded in the build label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LauncherMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default)]
    pub source: LauncherSource,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LauncherSource {
    #[serde(default)]
    pub git: GitMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit: String,
}

/// Output of the build phase (`<layers>/config/metadata.toml`) and, with
/// the launcher stamped in, the `io.buildpacks.build.metadata` label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildMetadata {
    #[serde(default)]
    pub processes: Vec<Process>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slices: Vec<Slice>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bom: Vec<toml::Value>,
    #[serde(default)]
    pub buildpacks: Vec<GroupEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launcher: Option<LauncherMetadata>,
}

impl BuildMetadata {
    pub fn to_launch_metadata(&self) -> LaunchMetadata {
        LaunchMetadata {
            processes: self.processes.clone(),
        }
    }
}

/// Opaque project provenance (`io.buildpacks.project.metadata`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectMetadata(pub serde_json::Value);

/// Path of the build metadata interchange file below a layers dir.
pub fn build_metadata_path(layers_dir: &Path) -> std::path::PathBuf {
    layers_dir.join("config").join("metadata.toml")
}

pub async fn read_build_metadata(layers_dir: &Path) -> Result<BuildMetadata> {
    let path = build_metadata_path(layers_dir);
    let raw = fs::read_to_string(&path)
        .await
        .context("read build metadata")?;
    toml::from_str(&raw).context(format!(
        "Unable to deserialize build metadata '{}'",
        path.display()
    ))
}

pub async fn write_build_metadata(layers_dir: &Path, metadata: &BuildMetadata) -> Result<()> {
    let path = build_metadata_path(layers_dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let serialized = toml::to_string(metadata).context("failed to serialize build metadata")?;
    fs::write(&path, serialized).await
}
