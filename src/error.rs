//! Error kinds shared by the record store, the transform pipeline and the renderer

use std::fmt;
use std::path::PathBuf;

/// Which quota an operation ran into
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaScope {
    Global,
    Owner,
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaScope::Global => f.write_str("server"),
            QuotaScope::Owner => f.write_str("player"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("no more maps allowed: the {scope} limit has been reached")]
    QuotaExceeded { scope: QuotaScope },

    #[error("this map does not exist: {name}")]
    MapNotFound { name: String },

    #[error("a map named {name} already exists")]
    NameTaken { name: String },

    #[error("invalid image source: {0}")]
    InvalidSource(String),

    #[error("{0}")]
    TransformFailed(String),

    #[error("map '{id}' belongs to {owner}, not to the store of {store_owner}")]
    OwnerMismatch {
        id: String,
        owner: String,
        store_owner: String,
    },

    #[error("failed to persist {path:?}: {source}")]
    PersistenceFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record file {path:?}: {detail}")]
    Serialization { path: PathBuf, detail: String },

    #[error("surface unavailable: {0}")]
    SurfaceUnavailable(String),
}

impl MapError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::MapNotFound { name: name.into() }
    }

    pub fn transform(detail: impl Into<String>) -> Self {
        Self::TransformFailed(detail.into())
    }

    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::PersistenceFailed {
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn is_quota(&self) -> bool {
        matches!(self, MapError::QuotaExceeded { .. })
    }
}

impl From<image::ImageError> for MapError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(e) => MapError::InvalidSource(e.to_string()),
            image::ImageError::Decoding(e) => MapError::InvalidSource(e.to_string()),
            other => MapError::TransformFailed(other.to_string()),
        }
    }
}

pub type Result<T, E = MapError> = std::result::Result<T, E>;
