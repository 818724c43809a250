//! Process environment composition from layered contributions.
//!
//! Every buildpack layer may carry well-known root directories (`bin`,
//! `lib`, ...) that map onto POSIX search-path variables, plus `env*/`
//! directories of files named `VAR.<op>` whose contents modify `VAR`.
//! Later contributions take search-path precedence, so layers are applied
//! in group order and each prepends itself.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::Path;

const PATH_LIST_SEPARATOR: &str = ":";

/// Root subdirectories of a layer and the variables they extend.
const POSIX_BUILD_DIRS: &[(&str, &[&str])] = &[
    ("bin", &["PATH"]),
    ("lib", &["LD_LIBRARY_PATH", "LIBRARY_PATH"]),
    ("include", &["CPATH"]),
    ("pkgconfig", &["PKG_CONFIG_PATH"]),
];

/// Variables preserved when a buildpack opts into a cleared environment.
const CLEAR_ENV_ALLOWLIST: &[&str] = &["HOME", "LANG", "PATH", "TERM", "USER"];

#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: BTreeMap<String, String>,
}

impl Env {
    /// Snapshot the full process environment.
    pub fn from_current() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// The reduced environment seen by `clear-env` buildpacks.
    pub fn cleared(&self) -> Self {
        Self {
            vars: self
                .vars
                .iter()
                .filter(|(k, _)| CLEAR_ENV_ALLOWLIST.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    /// Key/value pairs in a shape `tokio::process::Command::envs` accepts.
    pub fn to_list(&self) -> Vec<(OsString, OsString)> {
        self.vars
            .iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect()
    }

    /// Prepend the layer's well-known root directories onto their search
    /// path variables.
    pub fn add_root_dir(&mut self, layer_dir: &Path) {
        for (subdir, var_names) in POSIX_BUILD_DIRS {
            let dir = layer_dir.join(subdir);
            if !dir.is_dir() {
                continue;
            }
            let rendered = dir.display().to_string();
            for var in *var_names {
                self.prepend(var, &rendered, PATH_LIST_SEPARATOR);
            }
        }
    }

    /// Apply every `VAR.<op>` file in `env_dir`. Files with no operation
    /// suffix behave as `override`.
    pub fn add_env_dir(&mut self, env_dir: &Path) -> Result<()> {
        if !env_dir.is_dir() {
            return Ok(());
        }
        let mut entries: Vec<_> = std::fs::read_dir(env_dir)
            .context(format!("Unable to read env dir '{}'", env_dir.display()))?
            .collect::<std::io::Result<_>>()
            .context(format!("Unable to read env dir '{}'", env_dir.display()))?;
        entries.sort_by_key(|e| e.file_name());

        // Delimiters first: they change how sibling files apply.
        let mut delims: BTreeMap<String, String> = BTreeMap::new();
        for entry in &entries {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(var) = file_name.strip_suffix(".delim") {
                delims.insert(var.to_string(), read_env_file(&entry.path())?);
            }
        }

        for entry in &entries {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !entry.path().is_file() {
                continue;
            }
            let (var, op) = match file_name.rsplit_once('.') {
                Some((var, op)) if ["append", "prepend", "override", "default", "delim"].contains(&op) => {
                    (var.to_string(), op.to_string())
                }
                _ => (file_name, "override".to_string()),
            };
            let contents = read_env_file(&entry.path())?;
            let delim = delims.get(&var).cloned().unwrap_or_default();
            match op.as_str() {
                "append" => self.append(&var, &contents, &delim),
                "prepend" => self.prepend(&var, &contents, &delim),
                "override" => self.set(&var, &contents),
                "default" => {
                    self.vars.entry(var).or_insert(contents);
                }
                "delim" => {}
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    fn append(&mut self, var: &str, value: &str, delim: &str) {
        match self.vars.get(var) {
            Some(existing) if !existing.is_empty() => {
                let joined = format!("{existing}{delim}{value}");
                self.vars.insert(var.to_string(), joined);
            }
            _ => self.set(var, value),
        }
    }

    fn prepend(&mut self, var: &str, value: &str, delim: &str) {
        match self.vars.get(var) {
            Some(existing) if !existing.is_empty() => {
                let joined = format!("{value}{delim}{existing}");
                self.vars.insert(var.to_string(), joined);
            }
            _ => self.set(var, value),
        }
    }
}

fn read_env_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .context(format!("Unable to read env file '{}'", path.display()))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    fn env_with(pairs: &[(&str, &str)]) -> Env {
        let mut env = Env::default();
        for (k, v) in pairs {
            env.set(k, v);
        }
        env
    }

    #[test]
    fn root_dirs_prepend_search_paths() {
        let temp = tempfile::tempdir().unwrap();
        let layer = temp.path().join("layer");
        fs::create_dir_all(layer.join("bin")).unwrap();
        fs::create_dir_all(layer.join("lib")).unwrap();

        let mut env = env_with(&[("PATH", "/usr/bin")]);
        env.add_root_dir(&layer);

        assert_eq!(
            env.get("PATH").unwrap(),
            format!("{}:/usr/bin", layer.join("bin").display())
        );
        assert_eq!(
            env.get("LD_LIBRARY_PATH").unwrap(),
            layer.join("lib").display().to_string()
        );
        // No include/ dir means CPATH stays unset.
        assert_eq!(env.get("CPATH"), None);
    }

    #[test]
    fn env_files_apply_their_operations() {
        let temp = tempfile::tempdir().unwrap();
        let env_dir = temp.path().join("env");
        fs::create_dir_all(&env_dir).unwrap();
        fs::write(env_dir.join("FLAGS.append"), "-O2").unwrap();
        fs::write(env_dir.join("FLAGS.delim"), " ").unwrap();
        fs::write(env_dir.join("NEW.default"), "fresh").unwrap();
        fs::write(env_dir.join("KEPT.default"), "ignored").unwrap();
        fs::write(env_dir.join("FORCED"), "replaced").unwrap();

        let mut env = env_with(&[("FLAGS", "-Wall"), ("KEPT", "original"), ("FORCED", "old")]);
        env.add_env_dir(&env_dir).unwrap();

        assert_eq!(env.get("FLAGS").unwrap(), "-Wall -O2");
        assert_eq!(env.get("NEW").unwrap(), "fresh");
        assert_eq!(env.get("KEPT").unwrap(), "original");
        assert_eq!(env.get("FORCED").unwrap(), "replaced");
    }

    #[test]
    fn cleared_env_keeps_only_the_allowlist() {
        let mut env = env_with(&[("PATH", "/usr/bin"), ("HOME", "/root"), ("SECRET", "x")]);
        env.set("TERM", "xterm");
        let cleared = env.cleared();
        assert_eq!(cleared.get("PATH"), Some("/usr/bin"));
        assert_eq!(cleared.get("HOME"), Some("/root"));
        assert_eq!(cleared.get("TERM"), Some("xterm"));
        assert_eq!(cleared.get("SECRET"), None);
    }

    #[test]
    fn prepend_on_missing_var_just_sets() {
        let mut env = Env::default();
        env.prepend("PATH", "/layer/bin", ":");
        assert_eq!(env.get("PATH"), Some("/layer/bin"));
    }
}
