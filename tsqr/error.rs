use std::path::PathBuf;

use thiserror::Error;

use crate::kernels::KernelError;

/// Failures surfaced by a task, a stage, or a pipeline driver.
///
/// A task that returns one of these aborts; its buffered output is discarded and the
/// stage fails. Drivers never emit a partial global factor after a failed stage.
#[derive(Debug, Error)]
pub enum TsqrError {
    /// A malformed row: wrong column count, undecodable bytes, or a byte length that is
    /// not a multiple of the element size.
    #[error("data format error: {0}")]
    DataFormat(String),

    /// A factorization kernel met a matrix it cannot factor (not positive definite,
    /// zero-norm Householder pivot, singular triangular factor).
    #[error("numerical error: {0}")]
    Numerical(String),

    /// A required parameter is absent or malformed. Raised before any stage runs.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize pipeline state: {0}")]
    Serialization(String),
}

impl TsqrError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TsqrError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<KernelError> for TsqrError {
    fn from(value: KernelError) -> Self {
        TsqrError::Numerical(value.to_string())
    }
}

impl From<toml::ser::Error> for TsqrError {
    fn from(value: toml::ser::Error) -> Self {
        TsqrError::Serialization(value.to_string())
    }
}

impl From<toml::de::Error> for TsqrError {
    fn from(value: toml::de::Error) -> Self {
        TsqrError::Serialization(value.to_string())
    }
}
