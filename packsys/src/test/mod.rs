/*!

Re-usable test code: fabricating fake buildpacks (descriptor plus scripted
detect/build binaries) and order fixtures on disk. This module is only
compiled for `cfg(test)`, which is accomplished at its declaration in
`main.rs`.

!*/

#![allow(unused)]

use crate::buildpack::{BuildpackGroup, BuildpackOrder, GroupEntry};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// A shell script for a detect binary that writes `plan` to the plan path
/// (`$2`) and passes.
pub(crate) fn detect_script_with_plan(plan: &str) -> String {
    format!("cat > \"$2\" <<'EOF'\n{plan}\nEOF\nexit 0")
}

/// Build a one-level order fixture from `(id, version, optional)` tuples.
pub(crate) fn order_of(groups: &[&[(&str, &str, bool)]]) -> BuildpackOrder {
    groups
        .iter()
        .map(|group| BuildpackGroup {
            group: group
                .iter()
                .map(|(id, version, optional)| {
                    let entry = GroupEntry::new(id, version);
                    if *optional {
                        entry.optional()
                    } else {
                        entry
                    }
                })
                .collect(),
        })
        .collect()
}

/// Builder for a fake buildpack under a registry root laid out the way
/// [`crate::buildpack::BuildpackStore`] expects.
pub(crate) struct FakeBuildpack {
    root: PathBuf,
    id: String,
    version: String,
    api: String,
    clear_env: bool,
    detect: Option<String>,
    build: Option<String>,
    order: Option<String>,
}

pub(crate) fn fake_buildpack(root: &Path, id: &str, version: &str, api: &str) -> FakeBuildpack {
    FakeBuildpack {
        root: root.to_path_buf(),
        id: id.to_string(),
        version: version.to_string(),
        api: api.to_string(),
        clear_env: false,
        detect: None,
        build: None,
        order: None,
    }
}

impl FakeBuildpack {
    pub(crate) fn detect_script(mut self, body: &str) -> Self {
        self.detect = Some(body.to_string());
        self
    }

    pub(crate) fn build_script(mut self, body: &str) -> Self {
        self.build = Some(body.to_string());
        self
    }

    pub(crate) fn order_toml(mut self, raw: &str) -> Self {
        self.order = Some(raw.to_string());
        self
    }

    pub(crate) fn clear_env(mut self) -> Self {
        self.clear_env = true;
        self
    }

    pub(crate) async fn write(self) {
        let dir = self
            .root
            .join(self.id.replace('/', "_"))
            .join(&self.version);
        tokio::fs::create_dir_all(dir.join("bin")).await.unwrap();

        let mut descriptor = format!(
            "api = \"{}\"\n\n[buildpack]\nid = \"{}\"\nversion = \"{}\"\n",
            self.api, self.id, self.version
        );
        if self.clear_env {
            descriptor.push_str("clear-env = true\n");
        }
        if let Some(order) = &self.order {
            descriptor.push('\n');
            descriptor.push_str(order);
        }
        tokio::fs::write(dir.join("buildpack.toml"), descriptor)
            .await
            .unwrap();

        for (name, body) in [("detect", &self.detect), ("build", &self.build)] {
            if let Some(body) = body {
                let path = dir.join("bin").join(name);
                tokio::fs::write(&path, format!("#!/bin/sh\n{body}\n"))
                    .await
                    .unwrap();
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                    .await
                    .unwrap();
            }
        }
    }
}
