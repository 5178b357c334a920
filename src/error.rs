use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for the block-diff builder.
///
/// Every failure the core can produce lands in one of these variants; nothing
/// propagates as a bare `String`. The `Coordinator` matches on the outer
/// variant only to decide a CLI exit code (`InputError` -> 1, everything
/// else -> 2); components construct the more specific inner variants.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error(transparent)]
    External(#[from] ExternalFailure),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    /// Wrap a bare `io::Error` with the path that was being operated on.
    ///
    /// Prefer this over `#[from] io::Error` so every I/O failure keeps the
    /// path that caused it instead of a path-less `BuildError::Io`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("missing file: {0}")]
    MissingFile(PathBuf),

    #[error("invalid configuration value for `{key}`: {value}")]
    InvalidConfig { key: String, value: String },

    #[error("unreadable map file {0}")]
    UnreadableMap(PathBuf),

    #[error("sparse image format is not supported: {0}")]
    SparseUnsupported(PathBuf),

    #[error("downgrade rejected: target version {target} <= source version {source}")]
    Downgrade { target: String, source: String },

    #[error("userdata partition cannot participate in an update")]
    UserdataRejected,

    #[error("partition `boot` cannot be processed incrementally")]
    BootIncremental,

    #[error("source package must be a zip archive in no-zip mode: {0}")]
    SourceNotZip(PathBuf),
}

#[derive(Debug, Error)]
pub enum InvariantViolation {
    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("map file does not cover the care set for key `{key}` in partition `{partition}`")]
    MapInconsistent { partition: String, key: String },

    #[error(
        "transfer list verification failed for partition `{partition}`: \
         new.dat expected {expected_new} bytes, found {actual_new}; \
         patch.dat expected {expected_patch} bytes, found {actual_patch}"
    )]
    TransferListInconsistent {
        partition: String,
        expected_new: u64,
        actual_new: u64,
        expected_patch: u64,
        actual_patch: u64,
    },
}

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("dependency cycle in partition `{partition}` could not be resolved by stashing")]
    UnresolvableCycle { partition: String },

    #[error("cannot split {blocks} blocks into two multiples of ten")]
    SplitImpossible { blocks: u64 },

    #[error("chunking did not converge for partition `{partition}` after {attempts} splits")]
    ChunkingFailed { partition: String, attempts: u32 },
}

#[derive(Debug, Error)]
pub enum ExternalFailure {
    #[error("differ exited with status {status}: {message}")]
    DifferFailed { status: i32, message: String },

    #[error("differ timed out after {0:?}")]
    DifferTimeout(std::time::Duration),

    #[error("required executable not found: {0}")]
    MissingBinary(PathBuf),
}

pub type Result<T> = std::result::Result<T, BuildError>;
