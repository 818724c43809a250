//! The build phase: run each selected buildpack's `build` binary in group
//! order, collecting the layers and launch metadata they contribute.
//!
//! Buildpacks run strictly sequentially; each one may read layers written
//! by its predecessors, whose `build=true` layers are also folded into the
//! child environment.

use crate::api::ApiVersion;
use crate::buildpack::{BuildpackStore, GroupEntry, ENV_BUILDPACK_DIR};
use crate::common::{self, fs};
use crate::env::Env;
use crate::error::PhaseError;
use crate::launch::{valid_process_type, LaunchToml, Process};
use crate::layers::read_buildpack_layers_dir;
use crate::metadata::BuildMetadata;
use crate::plan::{write_plan, BuildPlan};
use anyhow::{bail, Context, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::instrument;

/// `build.toml`, written by buildpacks on API >= 0.5.
#[derive(Debug, Default, serde::Deserialize)]
struct BuildToml {
    #[serde(default)]
    unmet: Vec<UnmetRequire>,
    #[serde(default)]
    bom: Vec<toml::Value>,
}

#[derive(Debug, serde::Deserialize)]
struct UnmetRequire {
    name: String,
}

#[derive(Debug)]
pub struct Builder {
    pub app_dir: PathBuf,
    pub layers_dir: PathBuf,
    pub platform_dir: PathBuf,
    pub group: Vec<GroupEntry>,
    pub plan: BuildPlan,
    pub store: BuildpackStore,
    pub env: Env,
}

impl Builder {
    #[instrument(level = "trace", skip_all)]
    pub async fn build(&self) -> Result<BuildMetadata> {
        let app_dir = fs::canonicalize(&self.app_dir).await?;
        let platform_dir = fs::canonicalize(&self.platform_dir).await?;
        fs::create_dir_all(&self.layers_dir).await?;
        let layers_dir = fs::canonicalize(&self.layers_dir).await?;

        let mut metadata = BuildMetadata {
            buildpacks: self.group.iter().map(GroupEntry::sanitized).collect(),
            ..Default::default()
        };
        // Layer dirs feeding the env of every subsequent buildpack.
        let mut env_layer_dirs: Vec<PathBuf> = Vec::new();

        for entry in &self.group {
            let mut entry = entry.clone();
            let resolved = self.store.lookup(&entry).await?;
            entry.api = Some(resolved.descriptor.api);
            let display_name = resolved
                .descriptor
                .buildpack
                .name
                .clone()
                .unwrap_or_else(|| entry.id.to_string());
            info!("---> {} {}", display_name, entry.version);

            let bp_layers = layers_dir.join(entry.id.escaped());
            fs::create_dir_all(&bp_layers).await?;

            let plan_dir = tempfile::Builder::new()
                .prefix("plan.")
                .tempdir()
                .context("Unable to create build plan directory")?;
            let plan_path = plan_dir.path().join("plan.toml");
            write_plan(&plan_path, &self.plan_slice(&entry)).await?;

            let mut env = if resolved.descriptor.buildpack.clear_env {
                self.env.cleared()
            } else {
                self.env.clone()
            };
            for layer_dir in &env_layer_dirs {
                env.add_root_dir(layer_dir);
                env.add_env_dir(&layer_dir.join("env"))?;
                env.add_env_dir(&layer_dir.join("env.build"))?;
            }

            let mut cmd = Command::new(resolved.build_binary());
            cmd.arg(&bp_layers)
                .arg(&platform_dir)
                .arg(&plan_path)
                .current_dir(&app_dir)
                .env_clear()
                .envs(env.to_list())
                .env(ENV_BUILDPACK_DIR, &resolved.dir);
            let run = common::capture(&mut cmd).await?;
            if !run.output.is_empty() {
                info!("{}", run.output.trim_end());
            }
            if run.code != 0 {
                info!("err:  {} ({})", entry, run.code);
                return Err(PhaseError::Buildpack).context(format!(
                    "build of '{entry}' failed with exit code {}",
                    run.code
                ));
            }

            self.process_layers(&layers_dir, &entry, &mut env_layer_dirs)
                .await?;
            self.read_launch_toml(&bp_layers, &entry, &mut metadata)
                .await?;
            if entry.api_version() >= ApiVersion::new(0, 5) {
                read_build_toml(&bp_layers, &entry, &mut metadata).await?;
            }
        }

        Ok(metadata)
    }

    /// The subset of the plan this buildpack is expected to fulfill, with
    /// requirement versions surfaced in the schema its API expects.
    fn plan_slice(&self, entry: &GroupEntry) -> BuildPlan {
        let mut slice = BuildPlan {
            entries: self.plan.entries_for(entry),
        };
        let old_api = entry.api_version() < ApiVersion::new(0, 3);
        for plan_entry in &mut slice.entries {
            for require in &mut plan_entry.requires {
                if old_api {
                    require.convert_metadata_to_version();
                } else {
                    require.convert_version_to_metadata();
                }
            }
        }
        slice
    }

    /// Enforce the on-disk layer invariants after a buildpack exits and
    /// fold its `build=true` layers into the env of later buildpacks.
    async fn process_layers(
        &self,
        layers_dir: &Path,
        entry: &GroupEntry,
        env_layer_dirs: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let bp_dir = read_buildpack_layers_dir(layers_dir, entry).await?;
        for layer in &bp_dir.layers {
            let Ok(layer_metadata) = layer.read().await else {
                // Malformed metadata is surfaced by the exporter, which
                // knows every malformed sibling by then.
                continue;
            };
            if layer_metadata.flagless() {
                debug!("Removing '{}', not marked as cached or launch", layer.identifier());
                layer.remove().await?;
                continue;
            }
            if layer_metadata.build && layer.has_local_contents() {
                env_layer_dirs.push(layer.path().to_path_buf());
            }
        }
        Ok(())
    }

    async fn read_launch_toml(
        &self,
        bp_layers: &Path,
        entry: &GroupEntry,
        metadata: &mut BuildMetadata,
    ) -> Result<()> {
        let path = bp_layers.join("launch.toml");
        if !path.is_file() {
            return Ok(());
        }
        let raw = fs::read_to_string(&path).await?;
        log_unknown_sections(&raw, &["processes", "slices", "labels", "bom"], &path);
        let launch: LaunchToml = toml::from_str(&raw).context(format!(
            "Unable to deserialize launch file '{}'",
            path.display()
        ))?;

        for mut process in launch.processes {
            if !valid_process_type(&process.r#type) {
                bail!(
                    "process type '{}' declared by '{entry}' is not a valid file name",
                    process.r#type
                );
            }
            process.buildpack_id = entry.id.to_string();
            replace_process(&mut metadata.processes, process);
        }
        metadata.slices.extend(launch.slices);
        metadata.labels.extend(launch.labels);
        metadata.bom.extend(launch.bom);
        Ok(())
    }
}

async fn read_build_toml(
    bp_layers: &Path,
    entry: &GroupEntry,
    metadata: &mut BuildMetadata,
) -> Result<()> {
    let path = bp_layers.join("build.toml");
    if !path.is_file() {
        return Ok(());
    }
    let raw = fs::read_to_string(&path).await?;
    let build: BuildToml = toml::from_str(&raw).context(format!(
        "Unable to deserialize build file '{}'",
        path.display()
    ))?;
    for unmet in &build.unmet {
        debug!("'{entry}' reports unmet requirement '{}'", unmet.name);
    }
    metadata.bom.extend(build.bom);
    Ok(())
}

/// Later buildpacks override processes of the same type.
fn replace_process(processes: &mut Vec<Process>, process: Process) {
    if let Some(existing) = processes.iter_mut().find(|p| p.r#type == process.r#type) {
        debug!(
            "Process type '{}' from '{}' overrides the one from '{}'",
            process.r#type, process.buildpack_id, existing.buildpack_id
        );
        *existing = process;
    } else {
        processes.push(process);
    }
}

/// Unknown table sections are tolerated for forward compatibility, but
/// noted at debug so schema drift is visible.
fn log_unknown_sections(raw: &str, known: &[&str], path: &Path) {
    if let Ok(value) = raw.parse::<toml::Value>() {
        if let Some(table) = value.as_table() {
            for key in table.keys() {
                if !known.contains(&key.as_str()) {
                    debug!("Ignoring unknown section '{key}' in '{}'", path.display());
                }
            }
        }
    }
}
