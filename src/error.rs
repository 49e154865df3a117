//! Error types for the tracking database and its collaborators.
//!
//! Two families with different blast radius:
//! - [`StoreError`]: persisted state could not be read or written. Fatal for
//!   the pass that hit it.
//! - [`SourceError`]: the chart site could not be reached or answered with
//!   something unusable. Transient; the affected unit of work is skipped.

use std::path::PathBuf;

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON document {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("time series storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt sample for song {song_id}: {detail}")]
    Corrupt { song_id: String, detail: String },

    #[error("unknown song ID {0}")]
    UnknownSong(String),

    #[error("song ID {0} is already in the database")]
    DuplicateSong(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        StoreError::Json {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no {what} found for {id}")]
    Missing { what: &'static str, id: String },

    #[error("could not parse {what} from {value:?}")]
    Parse { what: &'static str, value: String },
}

impl SourceError {
    pub fn missing(what: &'static str, id: impl Into<String>) -> Self {
        SourceError::Missing { what, id: id.into() }
    }
}

/// Failure of a manual add: either side can go wrong.
#[derive(Debug, Error)]
pub enum AddError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
