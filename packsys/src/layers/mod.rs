//! The on-disk model of a buildpack's layers directory.
//!
//! Under `<layers>/<escaped-id>/`, each layer is a directory plus a
//! `<name>.toml` metadata file and, once materialized, a `<name>.sha`
//! sidecar naming its tar digest. `store.toml`, `launch.toml`, and (from
//! buildpack API 0.5) `build.toml` are interchange files, never layers.

pub mod factory;

use crate::api::ApiVersion;
use crate::buildpack::GroupEntry;
use crate::common::fs;
use anyhow::{bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use toml::value::Table;

const TYPES_WARNING: &str = "Warning: types table isn't supported in this buildpack api version. \
     The launch, build and cache flags should be in the top level. \
     Ignoring the values in the types table.";

/// The flag set + opaque metadata of a `<name>.toml` layer file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerMetadataFile {
    #[serde(default)]
    pub launch: bool,
    #[serde(default)]
    pub build: bool,
    #[serde(default)]
    pub cache: bool,
    #[serde(default, skip_serializing_if = "Table::is_empty")]
    pub metadata: Table,
}

impl LayerMetadataFile {
    pub fn flagless(&self) -> bool {
        !self.launch && !self.build && !self.cache
    }
}

/// Decode a layer metadata file under the rules of `api`.
///
/// Below 0.6 the flags live at the top level and a `types` table only earns
/// a warning (returned, not logged, so callers decide severity). From 0.6
/// the flags live in `[types]` and stray top-level flags are an error.
pub fn decode_layer_metadata(raw: &str, api: ApiVersion) -> Result<(LayerMetadataFile, Option<String>)> {
    let value: toml::Value = toml::from_str(raw).context("invalid layer metadata")?;
    let table = value
        .as_table()
        .context("layer metadata is not a TOML table")?;
    let has_types = table.get("types").map(toml::Value::is_table) == Some(true);
    let has_flat_flags = ["launch", "build", "cache"]
        .iter()
        .any(|flag| table.contains_key(*flag));

    if api < ApiVersion::new(0, 6) {
        let decoded: LayerMetadataFile = value.try_into().context("invalid layer metadata")?;
        let warning = has_types.then(|| TYPES_WARNING.to_string());
        return Ok((decoded, warning));
    }

    if has_flat_flags {
        bail!(
            "the launch, build and cache flags are not supported at the top level \
             for this buildpack api version, use the types table instead"
        );
    }

    #[derive(Deserialize)]
    struct Versioned {
        #[serde(default)]
        types: LayerMetadataFile,
        #[serde(default)]
        metadata: Table,
    }
    let decoded: Versioned = value.try_into().context("invalid layer metadata")?;
    Ok((
        LayerMetadataFile {
            metadata: decoded.metadata,
            ..decoded.types
        },
        None,
    ))
}

/// Encode a layer metadata file in the schema `api` expects.
pub fn encode_layer_metadata(file: &LayerMetadataFile, api: ApiVersion) -> Result<String> {
    if api < ApiVersion::new(0, 6) {
        return toml::to_string(file).context("failed to serialize layer metadata");
    }

    #[derive(Serialize)]
    struct Versioned<'a> {
        types: Flags,
        #[serde(skip_serializing_if = "Table::is_empty")]
        metadata: &'a Table,
    }
    #[derive(Serialize)]
    struct Flags {
        launch: bool,
        build: bool,
        cache: bool,
    }
    toml::to_string(&Versioned {
        types: Flags {
            launch: file.launch,
            build: file.build,
            cache: file.cache,
        },
        metadata: &file.metadata,
    })
    .context("failed to serialize layer metadata")
}

/// A per-buildpack opaque bag preserved across builds (`store.toml`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreToml {
    #[serde(default)]
    pub metadata: Table,
}

/// One layer of one buildpack, identified as `<buildpack-id>:<name>`.
#[derive(Debug, Clone)]
pub struct BpLayer {
    path: PathBuf,
    identifier: String,
    api: ApiVersion,
}

impl BpLayer {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn toml_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.toml", self.path.display()))
    }

    fn sha_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.sha", self.path.display()))
    }

    /// Read the layer's metadata file; pre-0.6 schema drift is logged as a
    /// warning, post-0.6 drift is an error.
    pub async fn read(&self) -> Result<LayerMetadataFile> {
        let raw = fs::read_to_string(self.toml_path())
            .await
            .context(format!("reading '{}' metadata", self.identifier))?;
        let (decoded, warning) = decode_layer_metadata(&raw, self.api)
            .context(format!("reading '{}' metadata", self.identifier))?;
        if let Some(message) = warning {
            warn!("{message}");
        }
        Ok(decoded)
    }

    /// The digest recorded by a previous materialization, if any.
    pub async fn read_sha(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.sha_path()).await {
            Ok(sha) => Ok(Some(sha.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(format!("reading '{}' sha", self.identifier)),
        }
    }

    pub fn has_local_contents(&self) -> bool {
        self.path.is_dir()
    }

    pub async fn write_metadata(&self, file: &LayerMetadataFile) -> Result<()> {
        if let Some(parent) = self.toml_path().parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(self.toml_path(), encode_layer_metadata(file, self.api)?).await
    }

    pub async fn write_sha(&self, sha: &str) -> Result<()> {
        fs::write(self.sha_path(), sha).await
    }

    /// Remove the layer's contents and both sidecars.
    pub async fn remove(&self) -> Result<()> {
        fs::remove_dir_all(&self.path).await?;
        fs::remove_file(self.toml_path()).await?;
        fs::remove_file(self.sha_path()).await
    }
}

/// Everything found in one buildpack's slice of the layers directory.
#[derive(Debug)]
pub struct BpLayersDir {
    pub path: PathBuf,
    pub layers: Vec<BpLayer>,
    pub buildpack: GroupEntry,
    pub store: Option<StoreToml>,
}

impl BpLayersDir {
    pub fn new_layer(&self, name: &str) -> BpLayer {
        BpLayer {
            path: self.path.join(name),
            identifier: format!("{}:{}", self.buildpack.id, name),
            api: self.buildpack.api_version(),
        }
    }

    /// Layers passing `select`, in sorted identifier order.
    pub async fn find_layers<F>(&self, select: F) -> Vec<&BpLayer>
    where
        F: Fn(&LayerMetadataFile) -> bool,
    {
        let mut selected = Vec::new();
        for layer in &self.layers {
            if let Ok(metadata) = layer.read().await {
                if select(&metadata) {
                    selected.push(layer);
                }
            }
        }
        selected
    }

    /// Layers whose metadata cannot be parsed at all.
    pub async fn malformed_layers(&self) -> Vec<&BpLayer> {
        let mut malformed = Vec::new();
        for layer in &self.layers {
            if layer.read().await.is_err() {
                malformed.push(layer);
            }
        }
        malformed
    }
}

pub fn for_launch(metadata: &LayerMetadataFile) -> bool {
    metadata.launch
}

pub fn for_cached(metadata: &LayerMetadataFile) -> bool {
    metadata.cache
}

/// Scan `<layers>/<escaped-id>/` for the buildpack's layers and store.
///
/// Layer names come from both content directories and bare `<name>.toml`
/// files (a metadata-only layer whose contents live in a previous image).
pub async fn read_buildpack_layers_dir(
    layers_dir: &Path,
    buildpack: &GroupEntry,
) -> Result<BpLayersDir> {
    let path = layers_dir.join(buildpack.id.escaped());
    let mut bp_dir = BpLayersDir {
        path: path.clone(),
        layers: Vec::new(),
        buildpack: buildpack.clone(),
        store: None,
    };
    let api = buildpack.api_version();

    let mut names = std::collections::BTreeSet::new();
    let mut tomls = Vec::new();
    let mut reader = match tokio::fs::read_dir(&path).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(bp_dir),
        Err(e) => {
            return Err(e).context(format!("Unable to read layers dir '{}'", path.display()))
        }
    };
    while let Some(entry) = reader
        .next_entry()
        .await
        .context(format!("Unable to read layers dir '{}'", path.display()))?
    {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if entry.path().is_dir() {
            names.insert(file_name);
        } else if let Some(name) = file_name.strip_suffix(".toml") {
            tomls.push(name.to_string());
        }
    }

    for name in tomls {
        match name.as_str() {
            "store" => {
                let raw = fs::read_to_string(path.join("store.toml")).await?;
                let store: StoreToml = toml::from_str(&raw).context(format!(
                    "failed decoding store.toml for buildpack '{}'",
                    buildpack.id
                ))?;
                bp_dir.store = Some(store);
            }
            // Interchange files, never layers.
            "launch" => {}
            "build" if api >= ApiVersion::new(0, 5) => {}
            _ => {
                names.insert(name);
            }
        }
    }

    bp_dir.layers = names
        .into_iter()
        .map(|name| bp_dir.new_layer(&name))
        .collect();
    Ok(bp_dir)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::ApiVersion;

    fn v(s: &str) -> ApiVersion {
        s.parse().unwrap()
    }

    #[test]
    fn flat_flags_parse_below_0_6() {
        let raw = "launch = true\ncache = true\n[metadata]\nversion = \"1\"\n";
        let (decoded, warning) = decode_layer_metadata(raw, v("0.5")).unwrap();
        assert!(decoded.launch && decoded.cache && !decoded.build);
        assert_eq!(
            decoded.metadata.get("version"),
            Some(&toml::Value::String("1".into()))
        );
        assert!(warning.is_none());
    }

    #[test]
    fn types_table_warns_below_0_6() {
        let raw = "[types]\nlaunch = true\n";
        let (decoded, warning) = decode_layer_metadata(raw, v("0.5")).unwrap();
        // The values in the types table are ignored.
        assert!(!decoded.launch);
        assert!(warning.unwrap().contains("types table isn't supported"));
    }

    #[test]
    fn types_table_required_from_0_6() {
        let raw = "[types]\nlaunch = true\nbuild = true\n";
        let (decoded, warning) = decode_layer_metadata(raw, v("0.6")).unwrap();
        assert!(decoded.launch && decoded.build);
        assert!(warning.is_none());

        let flat = "launch = true\n";
        let err = decode_layer_metadata(flat, v("0.6")).unwrap_err();
        assert!(err.to_string().contains("types table"));
    }

    #[test]
    fn encode_matches_schema_for_api() {
        let file = LayerMetadataFile {
            launch: true,
            build: false,
            cache: true,
            metadata: Table::new(),
        };
        let old = encode_layer_metadata(&file, v("0.5")).unwrap();
        assert!(old.contains("launch = true"));
        assert!(!old.contains("[types]"));

        let new = encode_layer_metadata(&file, v("0.6")).unwrap();
        assert!(new.contains("[types]"));
        let (round_trip, _) = decode_layer_metadata(&new, v("0.6")).unwrap();
        assert_eq!(round_trip, file);
    }

    #[tokio::test]
    async fn layers_dir_scan_finds_dirs_and_bare_tomls() {
        let temp = tempfile::tempdir().unwrap();
        let mut bp = GroupEntry::new("example/node", "1.0");
        bp.api = Some(v("0.6"));
        let bp_root = temp.path().join("example_node");

        tokio::fs::create_dir_all(bp_root.join("modules")).await.unwrap();
        tokio::fs::write(bp_root.join("modules.toml"), "[types]\nlaunch = true\n")
            .await
            .unwrap();
        // Metadata-only layer: toml without a content dir.
        tokio::fs::write(bp_root.join("shim.toml"), "[types]\nlaunch = true\n")
            .await
            .unwrap();
        tokio::fs::write(bp_root.join("store.toml"), "[metadata]\ncount = 1\n")
            .await
            .unwrap();
        tokio::fs::write(bp_root.join("launch.toml"), "").await.unwrap();
        tokio::fs::write(bp_root.join("build.toml"), "").await.unwrap();

        let bp_dir = read_buildpack_layers_dir(temp.path(), &bp).await.unwrap();
        let names: Vec<_> = bp_dir.layers.iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["modules".to_string(), "shim".to_string()]);
        assert!(bp_dir.store.is_some());
        assert!(bp_dir.layers[0].has_local_contents());
        assert!(!bp_dir.layers[1].has_local_contents());
        assert_eq!(bp_dir.layers[0].identifier(), "example/node:modules");
    }

    #[tokio::test]
    async fn build_toml_is_a_layer_below_0_5() {
        let temp = tempfile::tempdir().unwrap();
        let mut bp = GroupEntry::new("old", "1.0");
        bp.api = Some(v("0.4"));
        let bp_root = temp.path().join("old");
        tokio::fs::create_dir_all(&bp_root).await.unwrap();
        tokio::fs::write(bp_root.join("build.toml"), "launch = true\n")
            .await
            .unwrap();

        let bp_dir = read_buildpack_layers_dir(temp.path(), &bp).await.unwrap();
        let names: Vec<_> = bp_dir.layers.iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["build".to_string()]);
    }

    #[tokio::test]
    async fn remove_clears_contents_and_sidecars() {
        let temp = tempfile::tempdir().unwrap();
        let mut bp = GroupEntry::new("bp", "1.0");
        bp.api = Some(v("0.5"));
        let bp_root = temp.path().join("bp");
        tokio::fs::create_dir_all(bp_root.join("stale")).await.unwrap();
        tokio::fs::write(bp_root.join("stale.toml"), "").await.unwrap();
        tokio::fs::write(bp_root.join("stale.sha"), "sha256:abc").await.unwrap();

        let bp_dir = read_buildpack_layers_dir(temp.path(), &bp).await.unwrap();
        let layer = bp_dir.new_layer("stale");
        layer.remove().await.unwrap();
        assert!(!bp_root.join("stale").exists());
        assert!(!bp_root.join("stale.toml").exists());
        assert!(!bp_root.join("stale.sha").exists());
    }
}
