use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LoopClosureError>;

/// Which reference-selection constraint left no candidate pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceConstraint {
    MaxCoverageEmpty,
    BadLoopCountEmpty,
}

impl std::fmt::Display for ReferenceConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReferenceConstraint::MaxCoverageEmpty => {
                write!(f, "no pixel holds data in any retained interferogram")
            }
            ReferenceConstraint::BadLoopCountEmpty => {
                write!(f, "no maximum-coverage pixel matches any bad-loop count")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum LoopClosureError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("IO error at {path}: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid epoch '{0}', expected yyyymmdd")]
    InvalidEpoch(String),

    #[error("invalid interferogram name '{0}', expected yyyymmdd_yyyymmdd with primary < secondary")]
    InvalidEdge(String),

    #[error("raster {path} holds {actual} bytes, expected {expected} ({length} lines x {width} samples)")]
    RasterSize {
        path: PathBuf,
        expected: u64,
        actual: u64,
        length: usize,
        width: usize,
    },

    #[error("no phase data stored for interferogram {0}")]
    MissingEdge(String),

    #[error("invalid reference area '{0}', expected x1:x2/y1:y2")]
    InvalidReference(String),

    #[error("reference area selection failed: {0}")]
    ReferenceExhausted(ReferenceConstraint),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl LoopClosureError {
    pub(crate) fn io_at(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LoopClosureError::IoAt {
            path: path.into(),
            source,
        }
    }
}
