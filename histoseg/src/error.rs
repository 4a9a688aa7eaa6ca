use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors of the segmentation pipeline.
///
/// Every variant aborts the current run.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing parameter files, bad image dimensions or an
    /// invalid atlas.
    #[error("configuration error: {0}")]
    Config(String),
    /// Inputs that disagree with each other, e.g. a missing ground-truth
    /// directory or fewer scores than patches.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),
    #[error("dimension mismatch in {context}: expected {expected:?}, but found {found:?}")]
    DimensionMismatch {
        context: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("unable to access '{}'", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to process image '{}'", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    /// Invalid taxonomy definitions.
    #[error("invalid atlas: {0:#}")]
    Atlas(#[from] anyhow::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "tch")]
    #[error(transparent)]
    Torch(#[from] tch::TchError),
}

impl Error {
    pub fn config(msg: impl ToString) -> Self {
        Self::Config(msg.to_string())
    }

    pub fn data_integrity(msg: impl ToString) -> Self {
        Self::DataIntegrity(msg.to_string())
    }

    pub fn dimension_mismatch(
        context: impl ToString,
        expected: impl Into<Vec<usize>>,
        found: impl Into<Vec<usize>>,
    ) -> Self {
        Self::DimensionMismatch {
            context: context.to_string(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn image(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        Self::Image {
            path: path.into(),
            source,
        }
    }
}
