//! Thin wrappers over `tokio::fs` that attach the offending path to errors.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub(crate) async fn read<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();
    tokio::fs::read(path)
        .await
        .context(format!("Unable to read file '{}'", path.display()))
}

pub(crate) async fn read_to_string<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    tokio::fs::read_to_string(path)
        .await
        .context(format!("Unable to read file '{}'", path.display()))
}

pub(crate) async fn write<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, contents: C) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::write(path, contents)
        .await
        .context(format!("Unable to write file '{}'", path.display()))
}

pub(crate) async fn create_dir_all<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::create_dir_all(path)
        .await
        .context(format!("Unable to create directory '{}'", path.display()))
}

pub(crate) async fn remove_dir_all<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(e).context(format!("Unable to remove directory '{}'", path.display()))
        }
        _ => Ok(()),
    }
}

pub(crate) async fn remove_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(e).context(format!("Unable to remove file '{}'", path.display()))
        }
        _ => Ok(()),
    }
}

pub(crate) async fn canonicalize<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    let path = path.as_ref();
    tokio::fs::canonicalize(path)
        .await
        .context(format!("Unable to canonicalize '{}'", path.display()))
}
