//! The provides/requires plan model shared by detect and build.

use crate::buildpack::GroupEntry;
use crate::common::fs;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use toml::value::Table;

/// A capability name a buildpack offers to the group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provide {
    pub name: String,
}

/// A capability a buildpack needs from an earlier group member.
///
/// Older buildpack APIs carried `version` at the top level; from API 0.3 the
/// canonical location is `metadata.version`, and the two may never disagree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Require {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Table::is_empty")]
    pub metadata: Table,
}

impl Require {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn metadata_version(&self) -> Option<String> {
        self.metadata.get("version").map(|v| match v {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn has_inconsistent_versions(&self) -> bool {
        match (&self.version, self.metadata_version()) {
            (Some(top), Some(meta)) => *top != meta,
            _ => false,
        }
    }

    pub fn has_doubly_specified_versions(&self) -> bool {
        self.version.is_some() && self.metadata.contains_key("version")
    }

    pub fn has_top_level_version(&self) -> bool {
        self.version.is_some()
    }

    /// Move a top-level version into `metadata.version` (canonical form).
    pub fn convert_version_to_metadata(&mut self) {
        if let Some(version) = self.version.take() {
            self.metadata
                .insert("version".to_string(), toml::Value::String(version));
        }
    }

    /// Surface `metadata.version` at the top level for pre-0.3 buildpacks.
    pub fn convert_metadata_to_version(&mut self) {
        if let Some(version) = self.metadata_version() {
            self.version = Some(version);
        }
    }
}

/// One `provides`/`requires` block of a detect plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSection {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<Provide>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<Require>,
}

impl PlanSection {
    pub fn has_inconsistent_versions(&self) -> bool {
        self.requires.iter().any(Require::has_inconsistent_versions)
    }

    pub fn has_doubly_specified_versions(&self) -> bool {
        self.requires
            .iter()
            .any(Require::has_doubly_specified_versions)
    }

    pub fn has_top_level_versions(&self) -> bool {
        self.requires.iter().any(Require::has_top_level_version)
    }
}

/// One satisfied requirement name: the buildpacks that provide it and the
/// requirements recorded against it.
///
/// After resolution every entry has at least one provider that precedes all
/// of its requirers in group order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildPlanEntry {
    #[serde(default)]
    pub providers: Vec<GroupEntry>,
    #[serde(default)]
    pub requires: Vec<Require>,
}

impl BuildPlanEntry {
    /// The externally-visible form: providers without optionality or API.
    pub fn sanitized(&self) -> Self {
        Self {
            providers: self.providers.iter().map(GroupEntry::sanitized).collect(),
            requires: self.requires.clone(),
        }
    }
}

/// The resolved build plan, in requirement discovery order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildPlan {
    #[serde(default)]
    pub entries: Vec<BuildPlanEntry>,
}

impl BuildPlan {
    /// The entries a single buildpack is expected to fulfill: those that
    /// list it as a provider.
    pub fn entries_for(&self, buildpack: &GroupEntry) -> Vec<BuildPlanEntry> {
        self.entries
            .iter()
            .filter(|entry| {
                entry
                    .providers
                    .iter()
                    .any(|provider| provider.same_buildpack(buildpack))
            })
            .cloned()
            .collect()
    }
}

pub async fn read_plan<P: AsRef<Path>>(path: P) -> Result<BuildPlan> {
    let data = fs::read_to_string(path.as_ref()).await?;
    toml::from_str(&data).context(format!(
        "Unable to deserialize plan file '{}'",
        path.as_ref().display()
    ))
}

pub async fn write_plan<P: AsRef<Path>>(path: P, plan: &BuildPlan) -> Result<()> {
    let serialized = toml::to_string(plan).context("failed to serialize build plan")?;
    fs::write(path, serialized).await
}

#[cfg(test)]
mod test {
    use super::*;

    fn require_with_meta(name: &str, version: Option<&str>, meta_version: Option<&str>) -> Require {
        let mut require = Require::new(name);
        require.version = version.map(str::to_string);
        if let Some(v) = meta_version {
            require
                .metadata
                .insert("version".into(), toml::Value::String(v.into()));
        }
        require
    }

    #[test]
    fn version_consistency_checks() {
        assert!(require_with_meta("x", Some("1"), Some("2")).has_inconsistent_versions());
        assert!(!require_with_meta("x", Some("1"), Some("1")).has_inconsistent_versions());
        assert!(require_with_meta("x", Some("1"), Some("1")).has_doubly_specified_versions());
        assert!(!require_with_meta("x", Some("1"), None).has_doubly_specified_versions());
        assert!(require_with_meta("x", Some("1"), None).has_top_level_version());
    }

    #[test]
    fn version_migrates_into_metadata() {
        let mut require = require_with_meta("x", Some("1.2"), None);
        require.convert_version_to_metadata();
        assert_eq!(require.version, None);
        assert_eq!(
            require.metadata.get("version"),
            Some(&toml::Value::String("1.2".into()))
        );
    }

    #[test]
    fn metadata_surfaces_as_version_for_old_apis() {
        let mut require = require_with_meta("x", None, Some("3.4"));
        require.convert_metadata_to_version();
        assert_eq!(require.version.as_deref(), Some("3.4"));
    }

    #[test]
    fn plan_slices_by_provider() {
        let a = GroupEntry::new("a", "1.0");
        let b = GroupEntry::new("b", "1.0");
        let plan = BuildPlan {
            entries: vec![
                BuildPlanEntry {
                    providers: vec![a.clone()],
                    requires: vec![Require::new("x")],
                },
                BuildPlanEntry {
                    providers: vec![b.clone()],
                    requires: vec![Require::new("y")],
                },
            ],
        };
        let for_a = plan.entries_for(&a);
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].requires[0].name, "x");
    }

    #[test]
    fn detect_plan_sections_parse_from_toml() {
        let raw = r#"
            [[provides]]
            name = "node"

            [[requires]]
            name = "node"
            version = "14"

            [requires.metadata]
            launch = true
        "#;
        let section: PlanSection = toml::from_str(raw).unwrap();
        assert_eq!(section.provides.len(), 1);
        assert_eq!(section.requires[0].version.as_deref(), Some("14"));
        assert_eq!(
            section.requires[0].metadata.get("launch"),
            Some(&toml::Value::Boolean(true))
        );
    }
}
