//! Materializes directories, the launcher, process-type symlinks, and app
//! slices as deterministic tarballs.
//!
//! The digest IS the layer's identity: two trees with identical content,
//! modes, and symlink targets must produce byte-identical tars. Entries are
//! written in sorted path order with uid/gid 0, zero mtime, and no extended
//! attributes; the sha256 is computed over the uncompressed stream as it is
//! written.

use crate::launch::{valid_process_type, LaunchMetadata, Slice, LAUNCHER_PATH, PROCESS_DIR};
use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A materialized layer. The tar path is incidental; the digest is the
/// identity used for reuse decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub id: String,
    pub tar_path: PathBuf,
    pub digest: String,
}

#[derive(Debug, Clone)]
enum TarEntry {
    Dir {
        path: String,
        mode: u32,
    },
    File {
        path: String,
        source: PathBuf,
        mode: u32,
    },
    Symlink {
        path: String,
        target: PathBuf,
        mode: u32,
    },
}

impl TarEntry {
    fn path(&self) -> &str {
        match self {
            TarEntry::Dir { path, .. }
            | TarEntry::File { path, .. }
            | TarEntry::Symlink { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayerFactory {
    artifacts_dir: PathBuf,
}

impl LayerFactory {
    /// `artifacts_dir` receives the layer tarballs; it must outlive any use
    /// of the returned [`Layer`] paths.
    pub fn new<P: AsRef<Path>>(artifacts_dir: P) -> Self {
        Self {
            artifacts_dir: artifacts_dir.as_ref().to_path_buf(),
        }
    }

    /// Tar a directory tree rooted at `dir`, in-tar paths mirroring the
    /// directory's absolute path so extraction at `/` reconstructs it.
    pub async fn dir_layer(&self, id: &str, dir: &Path) -> Result<Layer> {
        let dir = dir
            .canonicalize()
            .context(format!("layer dir '{}'", dir.display()))?;
        let mut entries = ancestor_entries(&dir);
        for dir_entry in WalkDir::new(&dir).follow_links(false).sort_by_file_name() {
            let dir_entry = dir_entry.context(format!("walking layer dir '{}'", dir.display()))?;
            entries.push(entry_for(dir_entry.path())?);
        }
        self.write_layer(id, entries).await
    }

    /// A single-file layer holding the launcher binary at its well-known
    /// on-image path.
    pub async fn launcher_layer(&self, launcher_src: &Path) -> Result<Layer> {
        let source = launcher_src
            .canonicalize()
            .context(format!("launcher binary '{}'", launcher_src.display()))?;
        let mut entries = ancestor_entries(Path::new(LAUNCHER_PATH));
        entries.push(TarEntry::File {
            path: tar_path(Path::new(LAUNCHER_PATH)),
            source,
            mode: 0o755,
        });
        self.write_layer("launcher", entries).await
    }

    /// One symlink per declared process type, pointing at the launcher.
    pub async fn process_types_layer(&self, metadata: &LaunchMetadata) -> Result<Layer> {
        let mut entries = ancestor_entries(Path::new(PROCESS_DIR));
        entries.push(TarEntry::Dir {
            path: tar_path(Path::new(PROCESS_DIR)),
            mode: 0o755,
        });
        let mut types: Vec<&str> = metadata
            .processes
            .iter()
            .map(|p| p.r#type.as_str())
            .collect();
        types.sort_unstable();
        types.dedup();
        for process_type in types {
            if !valid_process_type(process_type) {
                bail!("process type '{process_type}' is not a valid file name");
            }
            entries.push(TarEntry::Symlink {
                path: tar_path(&Path::new(PROCESS_DIR).join(process_type)),
                target: PathBuf::from(LAUNCHER_PATH),
                mode: 0o777,
            });
        }
        self.write_layer("process-types", entries).await
    }

    /// Split the app directory into one layer per non-empty slice, in
    /// declaration order, with everything unmatched in a final `app` layer.
    pub async fn slice_layers(&self, app_dir: &Path, slices: &[Slice]) -> Result<Vec<Layer>> {
        let app_dir = app_dir
            .canonicalize()
            .context(format!("app dir '{}'", app_dir.display()))?;

        // Relative path -> leaf entry (file or symlink), sorted by path.
        let mut remaining: BTreeMap<PathBuf, TarEntry> = BTreeMap::new();
        for dir_entry in WalkDir::new(&app_dir).follow_links(false).sort_by_file_name() {
            let dir_entry = dir_entry.context(format!("walking app dir '{}'", app_dir.display()))?;
            if dir_entry.path() == app_dir || dir_entry.file_type().is_dir() {
                continue;
            }
            let relative = dir_entry
                .path()
                .strip_prefix(&app_dir)
                .expect("walked path is under the app dir")
                .to_path_buf();
            remaining.insert(relative, entry_for(dir_entry.path())?);
        }

        let mut layers = Vec::new();
        for (index, slice) in slices.iter().enumerate() {
            let patterns = slice
                .paths
                .iter()
                .map(|p| glob::Pattern::new(p).context(format!("invalid slice glob '{p}'")))
                .collect::<Result<Vec<_>>>()?;
            let matched: Vec<PathBuf> = remaining
                .keys()
                .filter(|path| patterns.iter().any(|pattern| pattern.matches_path(path)))
                .cloned()
                .collect();
            if matched.is_empty() {
                continue;
            }
            let entries: Vec<TarEntry> = matched
                .iter()
                .map(|path| remaining.remove(path).expect("matched path is present"))
                .collect();
            let id = format!("slice-{}", index + 1);
            layers.push(self.write_layer(&id, self.app_entries(&app_dir, entries)?).await?);
        }

        let leftover: Vec<TarEntry> = remaining.into_values().collect();
        layers.push(self.write_layer("app", self.app_entries(&app_dir, leftover)?).await?);
        Ok(layers)
    }

    /// Prefix app entries with the app dir itself and any intermediate
    /// directories their paths pass through.
    fn app_entries(&self, app_dir: &Path, leaves: Vec<TarEntry>) -> Result<Vec<TarEntry>> {
        let mut entries = ancestor_entries(app_dir);
        entries.push(entry_for(app_dir)?);
        let mut seen_dirs: BTreeSet<String> = BTreeSet::new();
        let mut with_parents = Vec::new();
        for leaf in leaves {
            let leaf_path = PathBuf::from("/").join(leaf.path());
            for parent in parents_below(&leaf_path, app_dir) {
                if seen_dirs.insert(tar_path(&parent)) {
                    with_parents.push(entry_for(&parent)?);
                }
            }
            with_parents.push(leaf);
        }
        entries.extend(with_parents);
        entries.sort_by(|a, b| a.path().cmp(b.path()));
        entries.dedup_by(|a, b| a.path() == b.path());
        Ok(entries)
    }

    async fn write_layer(&self, id: &str, entries: Vec<TarEntry>) -> Result<Layer> {
        let tar_path = self
            .artifacts_dir
            .join(format!("{}.tar", id.replace('/', "_").replace(':', "-")));
        let write_path = tar_path.clone();
        let digest = tokio::task::spawn_blocking(move || write_tar(&write_path, entries))
            .await
            .context("layer tar task panicked")??;
        Ok(Layer {
            id: id.to_string(),
            tar_path,
            digest,
        })
    }
}

/// `io::Write` adapter computing a sha256 over everything written through.
struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn write_tar(tar_path: &Path, entries: Vec<TarEntry>) -> Result<String> {
    let file = std::fs::File::create(tar_path)
        .context(format!("Unable to create '{}'", tar_path.display()))?;
    let writer = DigestWriter {
        inner: std::io::BufWriter::new(file),
        hasher: Sha256::new(),
    };
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    for entry in &entries {
        let mut header = tar::Header::new_gnu();
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        match entry {
            TarEntry::Dir { path, mode } => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(*mode);
                header.set_size(0);
                builder
                    .append_data(&mut header, format!("{path}/"), std::io::empty())
                    .context(format!("appending dir '{path}'"))?;
            }
            TarEntry::File { path, source, mode } => {
                let mut file = std::fs::File::open(source)
                    .context(format!("Unable to open '{}'", source.display()))?;
                let size = file
                    .metadata()
                    .context(format!("Unable to stat '{}'", source.display()))?
                    .len();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(*mode);
                header.set_size(size);
                builder
                    .append_data(&mut header, path, &mut file)
                    .context(format!("appending file '{path}'"))?;
            }
            TarEntry::Symlink { path, target, mode } => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_mode(*mode);
                header.set_size(0);
                builder
                    .append_link(&mut header, path, target)
                    .context(format!("appending symlink '{path}'"))?;
            }
        }
    }

    let mut writer = builder
        .into_inner()
        .context("finishing layer tar archive")?;
    writer.flush().context("flushing layer tar archive")?;
    Ok(format!("sha256:{}", hex::encode(writer.hasher.finalize())))
}

/// Build an entry mirroring the filesystem object at `path`.
fn entry_for(path: &Path) -> Result<TarEntry> {
    let metadata = std::fs::symlink_metadata(path)
        .context(format!("Unable to stat '{}'", path.display()))?;
    let mode = metadata.permissions().mode() & 0o7777;
    let in_tar = tar_path(path);
    if metadata.file_type().is_symlink() {
        let target = std::fs::read_link(path)
            .context(format!("Unable to read link '{}'", path.display()))?;
        Ok(TarEntry::Symlink {
            path: in_tar,
            target,
            mode,
        })
    } else if metadata.is_dir() {
        Ok(TarEntry::Dir { path: in_tar, mode })
    } else {
        Ok(TarEntry::File {
            path: in_tar,
            source: path.to_path_buf(),
            mode,
        })
    }
}

/// Directory entries for every ancestor of `path`, root first, with a fixed
/// mode so the tar does not leak host directory permissions.
fn ancestor_entries(path: &Path) -> Vec<TarEntry> {
    let mut ancestors: Vec<&Path> = path
        .ancestors()
        .skip(1)
        .filter(|p| !p.as_os_str().is_empty() && *p != Path::new("/"))
        .collect();
    ancestors.reverse();
    ancestors
        .into_iter()
        .map(|p| TarEntry::Dir {
            path: tar_path(p),
            mode: 0o755,
        })
        .collect()
}

/// Ancestors of `path` strictly below `base`, shallowest first.
fn parents_below(path: &Path, base: &Path) -> Vec<PathBuf> {
    let mut parents: Vec<PathBuf> = path
        .ancestors()
        .skip(1)
        .take_while(|p| *p != base)
        .map(Path::to_path_buf)
        .collect();
    parents.reverse();
    parents
}

/// The in-tar rendering of an absolute path: leading `/` stripped.
fn tar_path(path: &Path) -> String {
    path.display()
        .to_string()
        .trim_start_matches('/')
        .to_string()
}
