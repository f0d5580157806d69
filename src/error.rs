//! Error types reported by the builders and the configuration layer.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// Terminal failure of a build, or a rejected configuration.
///
/// Degenerate input (no primitives) and hitting the depth cap are *not* errors;
/// they produce an empty tree or an oversized leaf respectively.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A numeric argument is outside of its valid range.
    #[error("invalid argument `{name}`: {value}")]
    InvalidArgument { name: &'static str, value: String },

    /// A builder name that is not known was requested.
    #[error("unknown builder `{0}` (expected `sah` or `morton`)")]
    UnknownBuilder(String),

    /// A traverser name that is not known was requested.
    #[error("unknown traverser `{0}` (expected `single`, `packet`, `hybrid` or `stream`)")]
    UnknownTraverser(String),

    /// A node encoding name that is not known was requested.
    #[error("unknown node encoding `{0}` (expected `aligned`, `quantized` or `unaligned`)")]
    UnknownNodeEncoding(String),

    /// A build quality name that is not known was requested.
    #[error("unknown build quality `{0}` (expected `low`, `medium` or `high`)")]
    UnknownQuality(String),

    /// A configuration string contained an unknown key or an unparsable value.
    #[error("invalid configuration entry `{key}={value}`")]
    InvalidConfig { key: String, value: String },

    /// The arena allocator hit its configured byte limit.
    #[error("arena exhausted: {requested} bytes requested, limit is {limit} bytes")]
    OutOfMemory { requested: usize, limit: usize },

    /// The progress callback asked for the build to stop.
    #[error("build cancelled by progress monitor")]
    Cancelled,

    /// A dedicated worker pool could not be created.
    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl BuildError {
    pub(crate) fn invalid_argument(name: &'static str, value: impl ToString) -> Self {
        Self::InvalidArgument {
            name,
            value: value.to_string(),
        }
    }
}
