//! Process types and the on-image launcher contract.

use serde::{Deserialize, Serialize};

/// Root of the lifecycle's on-image assets.
pub const CNB_DIR: &str = "/cnb";
/// The launcher binary as it exists inside the exported image.
pub const LAUNCHER_PATH: &str = "/cnb/lifecycle/launcher";
/// Directory of per-process-type symlinks to the launcher.
pub const PROCESS_DIR: &str = "/cnb/process";

/// One launchable process declared by a buildpack in `launch.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Process {
    pub r#type: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub direct: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub buildpack_id: String,
}

impl Process {
    /// Path of this process's launcher symlink inside the image.
    pub fn path(&self) -> String {
        format!("{PROCESS_DIR}/{}", self.r#type)
    }
}

/// The launch-relevant slice of build metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchMetadata {
    #[serde(default)]
    pub processes: Vec<Process>,
}

impl LaunchMetadata {
    pub fn find_process_type(&self, process_type: &str) -> Option<&Process> {
        self.processes.iter().find(|p| p.r#type == process_type)
    }

    pub fn process_types(&self) -> Vec<String> {
        self.processes.iter().map(|p| p.r#type.clone()).collect()
    }
}

/// A subset of the app directory exported as its own layer, selected by
/// path globs relative to the app root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    #[serde(default)]
    pub paths: Vec<String>,
}

/// A `key`/`value` label a buildpack asks the exporter to set on the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

/// A buildpack's `launch.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LaunchToml {
    #[serde(default)]
    pub processes: Vec<Process>,
    #[serde(default)]
    pub slices: Vec<Slice>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub bom: Vec<toml::Value>,
}

/// Process type names become file names under [`PROCESS_DIR`]; restrict
/// them to characters that cannot escape it.
pub fn valid_process_type(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name != "."
        && name != ".."
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn process_paths_live_under_the_process_dir() {
        let process = Process {
            r#type: "web".into(),
            command: "serve".into(),
            args: vec![],
            direct: false,
            buildpack_id: "example/node".into(),
        };
        assert_eq!(process.path(), "/cnb/process/web");
    }

    #[test]
    fn launch_toml_parses_all_sections() {
        let raw = r#"
            [[processes]]
            type = "web"
            command = "node server.js"
            args = ["--port", "8080"]
            direct = true

            [[slices]]
            paths = ["static/**"]

            [[labels]]
            key = "team"
            value = "runtime"

            [[bom]]
            name = "node"
        "#;
        let parsed: LaunchToml = toml::from_str(raw).unwrap();
        assert_eq!(parsed.processes[0].r#type, "web");
        assert!(parsed.processes[0].direct);
        assert_eq!(parsed.slices[0].paths, vec!["static/**".to_string()]);
        assert_eq!(parsed.labels[0].key, "team");
        assert_eq!(parsed.bom.len(), 1);
    }

    #[test]
    fn process_type_names_are_path_safe() {
        assert!(valid_process_type("web"));
        assert!(valid_process_type("worker-2"));
        assert!(!valid_process_type(""));
        assert!(!valid_process_type(".."));
        assert!(!valid_process_type("a/b"));
    }
}
