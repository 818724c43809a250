//! Buildpack identities, descriptors, and the on-disk registry that
//! resolves `(id, version)` references to buildpack directories.

use crate::api::ApiVersion;
use crate::common::fs;
use crate::error::PhaseError;
use anyhow::{Context, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

/// Set for detect and build binaries, pointing at the buildpack's root.
pub const ENV_BUILDPACK_DIR: &str = "CNB_BUILDPACK_DIR";

/// A buildpack ID. Non-empty, no whitespace; `/` is allowed (namespaced ids
/// such as `example/node`) and flattened to `_` in filesystem paths.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuildpackId(String);

impl BuildpackId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The directory-safe form of the ID.
    pub fn escaped(&self) -> String {
        self.0.replace('/', "_")
    }
}

impl std::str::FromStr for BuildpackId {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        anyhow::ensure!(!input.is_empty(), "buildpack id cannot be empty");
        anyhow::ensure!(
            !input.chars().any(char::is_whitespace),
            "buildpack id '{input}' cannot contain whitespace"
        );
        Ok(Self(input.to_string()))
    }
}

impl Display for BuildpackId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for BuildpackId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for BuildpackId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let input = String::deserialize(deserializer)?;
        input.parse().map_err(D::Error::custom)
    }
}

/// One buildpack reference inside a group.
///
/// `optional` only means something in group position. `api` is filled in
/// from the descriptor during lookup and never leaves the engine: group and
/// plan files written for buildpacks omit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub id: BuildpackId,
    pub version: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiVersion>,
}

impl GroupEntry {
    pub fn new(id: &str, version: &str) -> Self {
        Self {
            id: id.parse().expect("valid buildpack id"),
            version: version.to_string(),
            optional: false,
            api: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// The form written to build-plan files: no optionality, no API version.
    pub fn sanitized(&self) -> Self {
        Self {
            id: self.id.clone(),
            version: self.version.clone(),
            optional: false,
            api: None,
        }
    }

    /// The form written to group files: API preserved for later phases,
    /// optionality dropped (a winning group has no optional members).
    pub fn without_optional(&self) -> Self {
        Self {
            optional: false,
            ..self.clone()
        }
    }

    /// The buildpack API this entry was resolved against.
    pub fn api_version(&self) -> ApiVersion {
        self.api.unwrap_or(ApiVersion::new(0, 1))
    }

    pub(crate) fn same_buildpack(&self, other: &GroupEntry) -> bool {
        self.id == other.id && self.version == other.version
    }
}

impl Display for GroupEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// An ordered set of buildpacks detected together as one candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackGroup {
    pub group: Vec<GroupEntry>,
}

/// Groups tried in declaration order until one resolves.
pub type BuildpackOrder = Vec<BuildpackGroup>;

/// `order.toml`: `[[order]]` blocks of `[[order.group]]` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderToml {
    pub order: BuildpackOrder,
}

/// The `[buildpack]` table of a descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildpackInfo {
    pub id: BuildpackId,
    pub version: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub clear_env: bool,
}

/// A parsed `buildpack.toml`.
///
/// A descriptor either implements detect/build itself or declares a nested
/// order of other buildpacks; the resolver expands the latter in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildpackDescriptor {
    #[serde(default = "default_api")]
    pub api: ApiVersion,
    pub buildpack: BuildpackInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<BuildpackOrder>,
}

fn default_api() -> ApiVersion {
    ApiVersion::new(0, 1)
}

/// A resolved buildpack: its root directory plus descriptor.
#[derive(Debug, Clone)]
pub struct ResolvedBuildpack {
    pub dir: PathBuf,
    pub descriptor: BuildpackDescriptor,
}

impl ResolvedBuildpack {
    pub fn detect_binary(&self) -> PathBuf {
        self.dir.join("bin").join("detect")
    }

    pub fn build_binary(&self) -> PathBuf {
        self.dir.join("bin").join("build")
    }
}

/// Locates buildpack descriptors below a single root directory laid out as
/// `<root>/<escaped-id>/<version>/buildpack.toml`.
#[derive(Debug, Clone)]
pub struct BuildpackStore {
    root: PathBuf,
}

impl BuildpackStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub async fn lookup(&self, entry: &GroupEntry) -> Result<ResolvedBuildpack> {
        let dir = self.root.join(entry.id.escaped()).join(&entry.version);
        let descriptor_path = dir.join("buildpack.toml");
        let lookup_err = |reason: String| PhaseError::BuildpackLookup {
            id: entry.id.to_string(),
            version: entry.version.clone(),
            reason,
        };

        if !descriptor_path.is_file() {
            return Err(lookup_err(format!(
                "no descriptor at '{}'",
                descriptor_path.display()
            ))
            .into());
        }
        let data = fs::read_to_string(&descriptor_path).await?;
        let descriptor: BuildpackDescriptor =
            toml::from_str(&data).map_err(|e| lookup_err(format!("malformed descriptor: {e}")))?;
        if descriptor.buildpack.id != entry.id || descriptor.buildpack.version != entry.version {
            return Err(lookup_err(format!(
                "descriptor declares '{}@{}'",
                descriptor.buildpack.id, descriptor.buildpack.version
            ))
            .into());
        }
        if !crate::api::is_supported(crate::api::SUPPORTED_BUILDPACK_APIS, &descriptor.api) {
            return Err(lookup_err(format!(
                "buildpack API {} is not supported",
                descriptor.api
            ))
            .into());
        }
        Ok(ResolvedBuildpack { dir, descriptor })
    }
}

/// `group.toml`, passed between the detect, build, and export phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupToml {
    pub group: Vec<GroupEntry>,
}

pub async fn read_group<P: AsRef<Path>>(path: P) -> Result<Vec<GroupEntry>> {
    let data = fs::read_to_string(path.as_ref()).await?;
    let parsed: GroupToml = toml::from_str(&data).context(format!(
        "Unable to deserialize group file '{}'",
        path.as_ref().display()
    ))?;
    Ok(parsed.group)
}

pub async fn write_group<P: AsRef<Path>>(path: P, group: &[GroupEntry]) -> Result<()> {
    let serialized = toml::to_string(&GroupToml {
        group: group.to_vec(),
    })
    .context("failed to serialize group file")?;
    fs::write(path, serialized).await
}

pub async fn read_order<P: AsRef<Path>>(path: P) -> Result<BuildpackOrder> {
    let data = fs::read_to_string(path.as_ref()).await?;
    let parsed: OrderToml = toml::from_str(&data).context(format!(
        "Unable to deserialize order file '{}'",
        path.as_ref().display()
    ))?;
    Ok(parsed.order)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test;

    #[test]
    fn ids_reject_empty_and_whitespace() {
        assert!("".parse::<BuildpackId>().is_err());
        assert!("has space".parse::<BuildpackId>().is_err());
        assert!("example/node".parse::<BuildpackId>().is_ok());
    }

    #[test]
    fn namespaced_ids_escape_for_paths() {
        let id: BuildpackId = "example/node".parse().unwrap();
        assert_eq!(id.escaped(), "example_node");
    }

    #[test]
    fn order_file_round_trips() {
        let raw = r#"
            [[order]]
            [[order.group]]
            id = "a"
            version = "1.0"

            [[order.group]]
            id = "b"
            version = "2.0"
            optional = true
        "#;
        let parsed: OrderToml = toml::from_str(raw).unwrap();
        assert_eq!(parsed.order.len(), 1);
        let group = &parsed.order[0].group;
        assert_eq!(group[0], GroupEntry::new("a", "1.0"));
        assert_eq!(group[1], GroupEntry::new("b", "2.0").optional());
    }

    #[test]
    fn sanitized_entries_omit_optional_and_api() {
        let mut entry = GroupEntry::new("a", "1.0").optional();
        entry.api = Some(ApiVersion::new(0, 6));
        let rendered = toml::to_string(&GroupToml {
            group: vec![entry.sanitized()],
        })
        .unwrap();
        assert!(!rendered.contains("optional"));
        assert!(!rendered.contains("api"));
    }

    #[tokio::test]
    async fn lookup_reads_descriptor_and_checks_identity() {
        let temp = tempfile::tempdir().unwrap();
        let store = BuildpackStore::new(temp.path());
        test::fake_buildpack(temp.path(), "example/node", "1.0", "0.6")
            .detect_script("exit 0")
            .write()
            .await;

        let resolved = store
            .lookup(&GroupEntry::new("example/node", "1.0"))
            .await
            .unwrap();
        assert_eq!(resolved.descriptor.api, ApiVersion::new(0, 6));
        assert!(resolved.detect_binary().ends_with("bin/detect"));

        let missing = store.lookup(&GroupEntry::new("absent", "1.0")).await;
        assert!(missing
            .unwrap_err()
            .to_string()
            .contains("failed to look up buildpack"));
    }

    #[tokio::test]
    async fn lookup_rejects_mismatched_descriptor() {
        let temp = tempfile::tempdir().unwrap();
        let store = BuildpackStore::new(temp.path());
        // Descriptor on disk claims a different version than its directory.
        let dir = temp.path().join("sneaky").join("1.0");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("buildpack.toml"),
            "api = \"0.6\"\n[buildpack]\nid = \"sneaky\"\nversion = \"9.9\"\n",
        )
        .await
        .unwrap();

        let err = store
            .lookup(&GroupEntry::new("sneaky", "1.0"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("descriptor declares"));
    }
}
