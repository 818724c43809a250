//! The detect phase: run every candidate buildpack's `detect` binary and
//! resolve a provides/requires plan for the first group that satisfies it.
//!
//! Groups are tried in declaration order. Within a group the detect
//! binaries run concurrently and are all joined before any result is
//! examined, so the outcome depends only on declaration order, never on
//! process completion order.

use crate::buildpack::{
    BuildpackGroup, BuildpackOrder, BuildpackStore, GroupEntry, ResolvedBuildpack,
    ENV_BUILDPACK_DIR,
};
use crate::common::{self, fs};
use crate::env::Env;
use crate::error::PhaseError;
use crate::plan::{BuildPlan, BuildPlanEntry, PlanSection, Require};
use anyhow::{anyhow, Context, Result};
use async_recursion::async_recursion;
use log::{debug, info, log, warn, Level};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::process::Command;
use tracing::instrument;

pub const CODE_DETECT_PASS: i32 = 0;
pub const CODE_DETECT_FAIL: i32 = 100;

const WARN_TOP_LEVEL_VERSION: &str =
    "Warning: top level version is deprecated in buildpack API 0.3";

/// Outcome of one buildpack's detect binary.
#[derive(Debug, Clone, Default)]
struct DetectRun {
    code: i32,
    output: String,
    plan: PlanSection,
    or: Vec<PlanSection>,
    failure: Option<DetectFailure>,
}

#[derive(Debug, Clone, PartialEq)]
enum DetectFailure {
    InconsistentVersion,
    DoublyVersioned,
    Other(String),
}

/// The plan file a detect binary writes: a primary section plus zero or
/// more `[[or]]` alternatives.
#[derive(Debug, Default, serde::Deserialize)]
struct DetectPlanFile {
    #[serde(default)]
    provides: Vec<crate::plan::Provide>,
    #[serde(default)]
    requires: Vec<Require>,
    #[serde(default)]
    or: Vec<PlanSection>,
}

/// One candidate buildpack with one of its alternative plan sections.
#[derive(Debug, Clone)]
struct DetectOption {
    buildpack: GroupEntry,
    section: PlanSection,
}

#[derive(Debug, Clone)]
struct DetectResult {
    entry: GroupEntry,
    run: DetectRun,
}

impl DetectResult {
    /// The primary section plus `or` alternatives, in declaration order.
    /// Optionality only survives on the final alternative; earlier ones are
    /// mandatory within this buildpack's slot.
    fn options(&self) -> Vec<DetectOption> {
        let mut sections = vec![self.run.plan.clone()];
        sections.extend(self.run.or.iter().cloned());
        let last = sections.len() - 1;
        sections
            .into_iter()
            .enumerate()
            .map(|(index, section)| {
                let mut buildpack = self.entry.clone();
                buildpack.optional = buildpack.optional && index == last;
                DetectOption { buildpack, section }
            })
            .collect()
    }
}

/// Shared state for one driver invocation of detect.
///
/// The run cache is keyed by the fully qualified `(id, version)` pair so a
/// buildpack appearing in several candidate groups executes at most once.
#[derive(Debug)]
pub struct Detector {
    app_dir: PathBuf,
    platform_dir: PathBuf,
    store: BuildpackStore,
    full_env: Env,
    clear_env: Env,
    runs: Mutex<HashMap<String, DetectRun>>,
}

impl Detector {
    pub fn new(
        app_dir: PathBuf,
        platform_dir: PathBuf,
        store: BuildpackStore,
        full_env: Env,
    ) -> Self {
        let clear_env = full_env.cleared();
        Self {
            app_dir,
            platform_dir,
            store,
            full_env,
            clear_env,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `order` to a winning group and its build plan.
    #[instrument(level = "trace", skip_all)]
    pub async fn detect(&self, order: &BuildpackOrder) -> Result<(Vec<GroupEntry>, BuildPlan)> {
        let (group, mut entries) = self
            .detect_order(order, Vec::new(), Vec::new(), false, &[])
            .await?;
        // Canonical form: versions live under metadata.
        for entry in &mut entries {
            for require in &mut entry.requires {
                require.convert_version_to_metadata();
            }
        }
        Ok((group, BuildPlan { entries }))
    }

    #[async_recursion]
    async fn detect_order(
        &self,
        order: &[BuildpackGroup],
        done: Vec<GroupEntry>,
        next: Vec<GroupEntry>,
        optional: bool,
        visited: &[(String, String)],
    ) -> Result<(Vec<GroupEntry>, Vec<BuildPlanEntry>)> {
        let mut buildpack_err = false;
        for group in order {
            let mut candidate = group.group.clone();
            candidate.extend(next.iter().cloned());
            match self.detect_group(candidate, done.clone(), visited).await {
                Ok(found) => return Ok(found),
                Err(e) => match phase_of(&e) {
                    Some(PhaseError::Buildpack) => {
                        buildpack_err = true;
                        continue;
                    }
                    Some(PhaseError::FailedDetection) => continue,
                    _ => return Err(e),
                },
            }
        }
        if optional {
            return self.detect_group(next, done, visited).await;
        }
        if buildpack_err {
            Err(PhaseError::Buildpack.into())
        } else {
            Err(PhaseError::FailedDetection.into())
        }
    }

    #[async_recursion]
    async fn detect_group(
        &self,
        group: Vec<GroupEntry>,
        mut done: Vec<GroupEntry>,
        visited: &[(String, String)],
    ) -> Result<(Vec<GroupEntry>, Vec<BuildPlanEntry>)> {
        let mut pending = Vec::new();
        for (index, entry) in group.iter().enumerate() {
            let mut entry = entry.clone();
            if done.iter().any(|d| d.id == entry.id) {
                continue;
            }
            let resolved = self.store.lookup(&entry).await?;
            entry.api = Some(resolved.descriptor.api);
            if let Some(nested) = resolved.descriptor.order.clone() {
                // A meta-buildpack: splice its order in, carrying the rest
                // of this group along on every attempt. The visited set
                // fails cyclic expansion closed.
                let key = (entry.id.to_string(), entry.version.clone());
                if visited.contains(&key) {
                    return Err(PhaseError::CyclicReference {
                        id: key.0,
                        version: key.1,
                    }
                    .into());
                }
                let mut branch = visited.to_vec();
                branch.push(key);
                let tail = group[index + 1..].to_vec();
                return self
                    .detect_order(&nested, done, tail, entry.optional, &branch)
                    .await;
            }
            done.push(entry.clone());
            pending.push((entry, resolved));
        }
        self.run_pending(pending).await;
        self.process(&done)
    }

    /// Run every not-yet-cached detect binary concurrently, joining all of
    /// them before any result is recorded.
    async fn run_pending(&self, pending: Vec<(GroupEntry, ResolvedBuildpack)>) {
        let to_run: Vec<_> = {
            let runs = self.runs.lock().expect("detect run cache poisoned");
            pending
                .into_iter()
                .filter(|(entry, _)| !runs.contains_key(&run_key(entry)))
                .collect()
        };
        if to_run.is_empty() {
            return;
        }
        let results = futures::future::join_all(
            to_run
                .iter()
                .map(|(entry, resolved)| self.run_detect(entry, resolved)),
        )
        .await;
        let mut runs = self.runs.lock().expect("detect run cache poisoned");
        for ((entry, _), run) in to_run.into_iter().zip(results) {
            runs.entry(run_key(&entry)).or_insert(run);
        }
    }

    /// Execute one buildpack's detect binary and parse the plan it writes.
    /// Failures are folded into the run; only the classifier decides what
    /// they mean for the group.
    async fn run_detect(&self, entry: &GroupEntry, resolved: &ResolvedBuildpack) -> DetectRun {
        match self.try_run_detect(entry, resolved).await {
            Ok(run) => run,
            Err(e) => DetectRun {
                code: -1,
                failure: Some(DetectFailure::Other(format!("{e:#}"))),
                ..Default::default()
            },
        }
    }

    async fn try_run_detect(
        &self,
        entry: &GroupEntry,
        resolved: &ResolvedBuildpack,
    ) -> Result<DetectRun> {
        let app_dir = fs::canonicalize(&self.app_dir).await?;
        let platform_dir = fs::canonicalize(&self.platform_dir).await?;
        let plan_dir = tempfile::Builder::new()
            .prefix("plan.")
            .tempdir()
            .context("Unable to create detect plan directory")?;
        let plan_path = plan_dir.path().join("plan.toml");
        fs::write(&plan_path, "").await?;

        let env = if resolved.descriptor.buildpack.clear_env {
            &self.clear_env
        } else {
            &self.full_env
        };
        let mut cmd = Command::new(resolved.detect_binary());
        cmd.arg(&platform_dir)
            .arg(&plan_path)
            .current_dir(&app_dir)
            .env_clear()
            .envs(env.to_list())
            .env(ENV_BUILDPACK_DIR, &resolved.dir);
        let captured = common::capture(&mut cmd).await?;
        if captured.code != CODE_DETECT_PASS {
            return Ok(DetectRun {
                code: captured.code,
                output: captured.output,
                ..Default::default()
            });
        }

        let raw = fs::read_to_string(&plan_path).await?;
        let parsed: DetectPlanFile =
            toml::from_str(&raw).context(format!("parsing detect plan of '{entry}'"))?;
        let mut run = DetectRun {
            code: captured.code,
            output: captured.output,
            plan: PlanSection {
                provides: parsed.provides,
                requires: parsed.requires,
            },
            or: parsed.or,
            failure: None,
        };

        let api = entry.api_version();
        let (inconsistent, doubly, top_level) = {
            let sections: Vec<&PlanSection> =
                std::iter::once(&run.plan).chain(run.or.iter()).collect();
            (
                sections.iter().any(|s| s.has_inconsistent_versions()),
                sections.iter().any(|s| s.has_doubly_specified_versions()),
                sections.iter().any(|s| s.has_top_level_versions()),
            )
        };
        if api == crate::api::ApiVersion::new(0, 2) && inconsistent {
            run.failure = Some(DetectFailure::InconsistentVersion);
        }
        if api >= crate::api::ApiVersion::new(0, 3) {
            if doubly {
                run.failure = Some(DetectFailure::DoublyVersioned);
            }
            if top_level {
                warn!("{WARN_TOP_LEVEL_VERSION}");
            }
        }
        Ok(run)
    }

    /// Classify every completed run, enumerate plan trials, and emit the
    /// winning group + plan entries.
    fn process(&self, done: &[GroupEntry]) -> Result<(Vec<GroupEntry>, Vec<BuildPlanEntry>)> {
        let runs = self.runs.lock().expect("detect run cache poisoned");
        let mut results_in = Vec::new();
        for entry in done {
            let run = runs
                .get(&run_key(entry))
                .ok_or_else(|| anyhow!("missing detection of '{entry}'"))?
                .clone();
            results_in.push(DetectResult {
                entry: entry.clone(),
                run,
            });
        }
        drop(runs);

        // Version errors are the most specific failure and outrank the
        // group outcome, even from buildpacks that end up not participating.
        for result in &results_in {
            let level = if matches!(result.run.code, CODE_DETECT_PASS | CODE_DETECT_FAIL) {
                Level::Debug
            } else {
                Level::Info
            };
            if !result.run.output.is_empty() {
                log!(level, "======== Output: {} ========", result.entry);
                log!(level, "{}", result.run.output.trim_end());
            }
            match &result.run.failure {
                Some(DetectFailure::InconsistentVersion) => {
                    return Err(PhaseError::InconsistentVersion.into())
                }
                Some(DetectFailure::DoublyVersioned) => {
                    return Err(PhaseError::DoublyVersioned.into())
                }
                Some(DetectFailure::Other(message)) => {
                    log!(level, "======== Error: {} ========", result.entry);
                    log!(level, "{message}");
                }
                None => {}
            }
        }

        debug!("======== Results ========");
        let mut detected = true;
        let mut buildpack_err = false;
        let mut results = Vec::new();
        for result in results_in {
            match (result.run.code, &result.run.failure) {
                (CODE_DETECT_PASS, None) => {
                    debug!("pass: {}", result.entry);
                    results.push(result);
                }
                (CODE_DETECT_FAIL, _) => {
                    if result.entry.optional {
                        debug!("skip: {}", result.entry);
                    } else {
                        debug!("fail: {}", result.entry);
                    }
                    detected = detected && result.entry.optional;
                }
                (-1, _) => {
                    info!("err:  {}", result.entry);
                    buildpack_err = true;
                    detected = detected && result.entry.optional;
                }
                (code, _) => {
                    info!("err:  {} ({})", result.entry, code);
                    buildpack_err = true;
                    detected = detected && result.entry.optional;
                }
            }
        }
        if !detected {
            if buildpack_err {
                return Err(PhaseError::Buildpack.into());
            }
            return Err(PhaseError::FailedDetection.into());
        }
        let done_count = done.len();

        let mut try_index = 0;
        let (deps, trial) = run_trials(&results, &mut |trial| {
            try_index += 1;
            run_trial(try_index, trial)
        })?;

        if done_count != trial.len() {
            info!("{} of {} buildpacks participating", trial.len(), done_count);
        }
        let width = trial
            .iter()
            .map(|option| option.buildpack.id.as_str().len())
            .max()
            .unwrap_or(0);
        for option in &trial {
            info!(
                "{:width$} {}",
                option.buildpack.id,
                option.buildpack.version,
                width = width
            );
        }

        let group = trial
            .iter()
            .map(|option| option.buildpack.without_optional())
            .collect();
        Ok((group, deps.plan_entries()))
    }
}

fn run_key(entry: &GroupEntry) -> String {
    format!("{}@{}", entry.id, entry.version)
}

fn phase_of(err: &anyhow::Error) -> Option<&PhaseError> {
    err.chain().find_map(|cause| cause.downcast_ref())
}

/// Enumerate the cartesian product of every buildpack's alternatives, in
/// left-to-right declaration order, until one trial resolves.
fn run_trials(
    results: &[DetectResult],
    f: &mut impl FnMut(Vec<DetectOption>) -> Result<(DepMap, Vec<DetectOption>)>,
) -> Result<(DepMap, Vec<DetectOption>)> {
    fn recurse(
        results: &[DetectResult],
        prefix: Vec<DetectOption>,
        f: &mut impl FnMut(Vec<DetectOption>) -> Result<(DepMap, Vec<DetectOption>)>,
    ) -> Result<(DepMap, Vec<DetectOption>)> {
        let Some(first) = results.first() else {
            return f(prefix);
        };
        let mut last_err = None;
        for option in first.options() {
            let mut next = prefix.clone();
            next.push(option);
            match recurse(&results[1..], next, f) {
                Ok(resolved) => return Ok(resolved),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.expect("every result has at least one option"))
    }
    recurse(results, Vec::new(), f)
}

/// Fixed-point resolution of one trial: drop optional buildpacks with
/// unmet requirements or unused provisions until the plan is stable, fail
/// on mandatory ones.
fn run_trial(
    try_index: usize,
    mut trial: Vec<DetectOption>,
) -> Result<(DepMap, Vec<DetectOption>)> {
    debug!("Resolving plan... (try #{try_index})");
    loop {
        let deps = DepMap::new(&trial);
        let mut retry = false;

        for (name, buildpack) in deps.unmet_requires() {
            retry = true;
            if !buildpack.optional {
                debug!("fail: {buildpack} requires {name}");
                return Err(PhaseError::FailedDetection.into());
            }
            debug!("skip: {buildpack} requires {name}");
            trial.retain(|option| option.buildpack != buildpack);
        }
        for (name, buildpack) in deps.unmet_provides() {
            retry = true;
            if !buildpack.optional {
                debug!("fail: {buildpack} provides unused {name}");
                return Err(PhaseError::FailedDetection.into());
            }
            debug!("skip: {buildpack} provides unused {name}");
            trial.retain(|option| option.buildpack != buildpack);
        }

        if !retry {
            if trial.is_empty() {
                debug!("fail: no viable buildpacks in group");
                return Err(PhaseError::FailedDetection.into());
            }
            return Ok((deps, trial));
        }
    }
}

#[derive(Debug, Default)]
struct DepEntry {
    providers: Vec<GroupEntry>,
    requires: Vec<Require>,
    extra_provides: Vec<GroupEntry>,
    early_requires: Vec<GroupEntry>,
}

/// Requirement names in discovery order with their resolution state. The
/// keys-vector keeps iteration deterministic.
#[derive(Debug, Default)]
struct DepMap {
    names: Vec<String>,
    entries: HashMap<String, DepEntry>,
}

impl DepMap {
    fn new(trial: &[DetectOption]) -> Self {
        let mut map = Self::default();
        for option in trial {
            for provide in &option.section.provides {
                map.provide(&option.buildpack, &provide.name);
            }
            for require in &option.section.requires {
                map.require(&option.buildpack, require);
            }
        }
        map
    }

    fn entry_mut(&mut self, name: &str) -> &mut DepEntry {
        if !self.entries.contains_key(name) {
            self.names.push(name.to_string());
            self.entries.insert(name.to_string(), DepEntry::default());
        }
        self.entries.get_mut(name).expect("entry just ensured")
    }

    fn provide(&mut self, buildpack: &GroupEntry, name: &str) {
        self.entry_mut(name).extra_provides.push(buildpack.clone());
    }

    fn require(&mut self, buildpack: &GroupEntry, require: &Require) {
        let entry = self.entry_mut(&require.name);
        // Provisions recorded so far become real providers; a requirement
        // with none yet was declared too early in group order.
        let mut absorbed = std::mem::take(&mut entry.extra_provides);
        entry.providers.append(&mut absorbed);
        if entry.providers.is_empty() {
            entry.early_requires.push(buildpack.clone());
        } else {
            entry.requires.push(require.clone());
        }
    }

    fn unmet_requires(&self) -> Vec<(String, GroupEntry)> {
        self.collect_unmet(|entry| &entry.early_requires)
    }

    fn unmet_provides(&self) -> Vec<(String, GroupEntry)> {
        self.collect_unmet(|entry| &entry.extra_provides)
    }

    fn collect_unmet(&self, select: impl Fn(&DepEntry) -> &Vec<GroupEntry>) -> Vec<(String, GroupEntry)> {
        let mut unmet = Vec::new();
        for name in &self.names {
            let entry = &self.entries[name];
            for buildpack in select(entry) {
                unmet.push((name.clone(), buildpack.clone()));
            }
        }
        unmet
    }

    /// Plan entries for every satisfied name, in discovery order, with
    /// providers reduced to their external form.
    fn plan_entries(&self) -> Vec<BuildPlanEntry> {
        self.names
            .iter()
            .map(|name| {
                let entry = &self.entries[name];
                BuildPlanEntry {
                    providers: entry.providers.iter().map(GroupEntry::sanitized).collect(),
                    requires: entry.requires.clone(),
                }
            })
            .collect()
    }
}
