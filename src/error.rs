//! Error types.
//!
//! [`StoreError`] covers failures reported by a [`Store`](crate::Store)
//! implementation; [`BuilderError`] is what the record, resolver and mutator
//! APIs return, wrapping store failures unchanged.

use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by container storage.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("container not known: {0}")]
    UnknownContainer(String),

    #[error("image not known: {0}")]
    UnknownImage(String),

    #[error("the container name \"{0}\" is already in use")]
    NameInUse(String),

    #[error("image {0} is not present and this store cannot pull images")]
    PullUnsupported(String),

    #[error("corrupt store registry {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("image layer: {0:#}")]
    Layer(anyhow::Error),
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Failures raised while creating, locating, decoding or saving a build
/// container record.
#[derive(Error, Debug)]
pub enum BuilderError {
    #[error("no build container matches {0}")]
    NotFound(String),

    #[error("container is not a {} container (type {found:?})", crate::PACKAGE)]
    TypeMismatch { found: String },

    #[error("malformed build container metadata: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("encoding build container metadata: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("error parsing --{field} {value:?}: {message}")]
    Tokenize {
        field: &'static str,
        value: String,
        message: String,
    },

    #[error("either --name or --root or --link, or some combination, must be specified")]
    NoTarget,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl BuilderError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True for the errors the path scan treats as "not one of ours".
    pub fn is_foreign(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::TypeMismatch { .. })
    }
}

pub type Result<T> = std::result::Result<T, BuilderError>;
