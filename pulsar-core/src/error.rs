//! Operator error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The declared cluster spec is malformed and requires operator correction.
    ///
    /// Errors of this variant are never retried automatically.
    #[error("invalid cluster spec: {0}")]
    InvalidSpec(String),
    /// An optimistic-concurrency write was rejected because the target node's
    /// version changed since it was read.
    #[error("version conflict writing coordination node {0}")]
    VersionConflict(String),
    /// Two spec values of incompatible JSON kinds were compared.
    ///
    /// This is a programmer error and is intended to surface in testing.
    #[error("cannot diff incompatible JSON kinds at {0}")]
    IncompatibleKinds(String),
}
