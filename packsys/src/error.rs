//! The failure taxonomy shared by all build phases.
//!
//! Commands return `anyhow::Error`; anything that must map to a specific
//! process exit code is raised as a [`PhaseError`] so `main` can recover it
//! with `downcast_ref` at the very end.

use snafu::Snafu;

pub const CODE_SUCCESS: i32 = 0;
pub const CODE_INTERNAL: i32 = 1;
pub const CODE_INVALID_ARGS: i32 = 3;
pub const CODE_FAILED_BUILD: i32 = 7;
pub const CODE_FAILED_SAVE: i32 = 62;
pub const CODE_FAILED_DETECT: i32 = 100;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PhaseError {
    #[snafu(display("invalid arguments: {message}"))]
    InvalidArgs { message: String },

    #[snafu(display("failed to look up buildpack '{id}@{version}': {reason}"))]
    BuildpackLookup {
        id: String,
        version: String,
        reason: String,
    },

    #[snafu(display("no buildpacks participating"))]
    FailedDetection,

    #[snafu(display("buildpack(s) failed with err"))]
    Buildpack,

    #[snafu(display(
        "buildpack '{id}@{version}' is referenced by an order it expands, \
         cyclic buildpack references are not allowed"
    ))]
    CyclicReference { id: String, version: String },

    #[snafu(display("top level version does not match metadata version"))]
    InconsistentVersion,

    #[snafu(display(
        "top level version cannot be specified along with metadata version; \
         use metadata version instead"
    ))]
    DoublyVersioned,

    #[snafu(display("failed to parse metadata for layers {ids:?}"))]
    MalformedLayer { ids: Vec<String> },

    #[snafu(display(
        "cannot reuse '{layer}', previous image has no metadata for layer '{layer}'"
    ))]
    ReuseMissingMetadata { layer: String },

    #[snafu(display("default process type '{requested}' not present in list {available:?}"))]
    MissingProcessType {
        requested: String,
        available: Vec<String>,
    },

    #[snafu(display("image store error: {source}"))]
    ImageIo { source: image_store::error::Error },
}

impl PhaseError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            PhaseError::InvalidArgs { .. } => CODE_INVALID_ARGS,
            PhaseError::FailedDetection => CODE_FAILED_DETECT,
            PhaseError::Buildpack => CODE_FAILED_BUILD,
            PhaseError::InconsistentVersion | PhaseError::DoublyVersioned => CODE_FAILED_DETECT,
            PhaseError::MalformedLayer { .. }
            | PhaseError::ReuseMissingMetadata { .. }
            | PhaseError::MissingProcessType { .. }
            | PhaseError::ImageIo { .. } => CODE_FAILED_SAVE,
            PhaseError::BuildpackLookup { .. } | PhaseError::CyclicReference { .. } => {
                CODE_INTERNAL
            }
        }
    }
}

/// Exit code for an arbitrary command failure: the taxonomy code when one is
/// buried anywhere in the chain, the generic internal code otherwise.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(phase) = cause.downcast_ref::<PhaseError>() {
            return phase.exit_code();
        }
    }
    CODE_INTERNAL
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_codes_stay_distinct_per_phase() {
        assert_eq!(PhaseError::FailedDetection.exit_code(), CODE_FAILED_DETECT);
        assert_eq!(PhaseError::Buildpack.exit_code(), CODE_FAILED_BUILD);
        assert_eq!(
            PhaseError::ReuseMissingMetadata {
                layer: "bp:lay".into()
            }
            .exit_code(),
            CODE_FAILED_SAVE
        );
    }

    #[test]
    fn taxonomy_is_found_through_context_wrapping() {
        let err = anyhow::Error::new(PhaseError::FailedDetection).context("detect phase");
        assert_eq!(exit_code_for(&err), CODE_FAILED_DETECT);
        let plain = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&plain), CODE_INTERNAL);
    }
}
