//! Store primitives for the build engine: a writable image handle and a
//! layer cache, both addressed by layer diff ID (`sha256:<hex>` over the
//! uncompressed layer tarball).
//!
//! The traits are intentionally small. The engine only ever:
//! * appends a layer tarball by digest, or re-attaches a layer it knows the
//!   digest of from the image (or cache) it is rebuilding on top of,
//! * reads/writes config state (labels, env, entrypoint, cmd),
//! * saves under one or more tags.
//!
//! [`local`] provides filesystem-backed implementations used by the driver
//! and by tests. Registry-backed implementations can plug in behind the same
//! traits.

use async_trait::async_trait;
use std::path::Path;
use tokio::io::AsyncRead;

mod cache;
mod local;

pub use cache::LocalCache;
pub use local::LocalImage;

/// A mutable handle to the image under construction.
///
/// Layer identity is the diff ID; `reuse_layer` must attach the previous
/// image's blob for that digest without the caller re-uploading it.
#[async_trait]
pub trait Image: Send {
    /// The primary name (tag) the image will be saved under.
    fn name(&self) -> &str;

    fn label(&self, key: &str) -> Option<String>;

    fn env_var(&self, key: &str) -> Option<String>;

    /// Diff ID of the topmost layer currently in the image.
    fn top_layer(&self) -> Result<String>;

    fn set_label(&mut self, key: &str, value: &str);

    fn set_env(&mut self, key: &str, value: &str);

    fn set_entrypoint(&mut self, entrypoint: &str);

    /// An empty slice clears the command.
    fn set_cmd(&mut self, cmd: &[String]);

    /// Append a layer from an uncompressed tarball whose digest the caller
    /// has already computed.
    async fn add_layer_with_diff_id(&mut self, tar_path: &Path, diff_id: &str) -> Result<()>;

    /// Re-attach a layer carried over from the image this build started from.
    async fn reuse_layer(&mut self, diff_id: &str) -> Result<()>;

    /// Persist the image under its name plus `additional_tags`.
    async fn save(&mut self, additional_tags: &[String]) -> Result<SaveReport>;
}

/// A store for build-time-only layers, persisted between builds.
///
/// Mutations accumulate in a staging area; `commit` exposes the new state
/// atomically. A cache that is never committed leaves the previous state
/// untouched.
#[async_trait]
pub trait CacheStore: Send {
    fn name(&self) -> String;

    /// Replace the staged metadata document (opaque bytes to the store).
    async fn set_metadata(&mut self, metadata: Vec<u8>) -> Result<()>;

    /// Metadata from the last committed state. Empty when the cache is new.
    async fn retrieve_metadata(&self) -> Result<Vec<u8>>;

    async fn add_layer_file(&mut self, tar_path: &Path, diff_id: &str) -> Result<()>;

    /// Carry a layer from the committed state into the staged state.
    async fn reuse_layer(&mut self, diff_id: &str) -> Result<()>;

    /// Stream a committed layer tarball.
    async fn retrieve_layer(&self, diff_id: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Atomically swap the staged state in. All-or-nothing from the
    /// caller's perspective.
    async fn commit(&mut self) -> Result<()>;
}

/// Outcome of [`Image::save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    /// Every tag the image was saved under, primary name first.
    pub tags: Vec<String>,
    /// Digest of the image config, `sha256:<hex>`.
    pub image_id: String,
    /// Registry digest, when the backing store produces one.
    pub digest: Option<String>,
}

pub type Result<T> = std::result::Result<T, error::Error>;

pub mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Snafu, Debug)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to read image config '{}': {source}", path.display()))]
        ConfigRead {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to deserialize image config '{}': {source}", path.display()))]
        ConfigDeserialize {
            path: PathBuf,
            source: serde_json::Error,
        },

        #[snafu(display("Failed to serialize image config: {source}"))]
        ConfigSerialize { source: serde_json::Error },

        #[snafu(display("Image '{name}' has no layers"))]
        EmptyImage { name: String },

        #[snafu(display("Failed to {op} '{}': {source}", path.display()))]
        Io {
            op: &'static str,
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Layer blob for '{diff_id}' is missing from '{name}'"))]
        MissingBlob { name: String, diff_id: String },

        #[snafu(display("'{name}' does not contain a layer with diff ID '{diff_id}'"))]
        NoSuchLayer { name: String, diff_id: String },

        #[snafu(display("Cache has no committed layer with diff ID '{diff_id}'"))]
        NoSuchCacheLayer { diff_id: String },

        #[snafu(display("'{value}' is not a valid layer diff ID, expected 'sha256:<hex>'"))]
        MalformedDiffId { value: String },
    }
}

/// Validate and strip the `sha256:` prefix from a diff ID, returning the
/// hex portion used for blob file names.
pub(crate) fn diff_id_hex(diff_id: &str) -> Result<&str> {
    let hex = diff_id
        .strip_prefix("sha256:")
        .ok_or_else(|| error::Error::MalformedDiffId {
            value: diff_id.to_string(),
        })?;
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(error::Error::MalformedDiffId {
            value: diff_id.to_string(),
        });
    }
    Ok(hex)
}
