//! Error types for a backup run.
//!
//! Every variant that aborts a run names the app or store involved, so the
//! message printed on exit is enough to tell what failed.

use crate::archive::ArchiveError;
use crate::capture::CaptureError;
use controller_client::ClientError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("error getting {app} app details: {source}")]
    RequiredApp {
        app: String,
        #[source]
        source: ClientError,
    },

    #[error("error getting {app} app {what}: {source}")]
    Lookup {
        app: String,
        what: &'static str,
        #[source]
        source: ClientError,
    },

    #[error("error opening archive: {0}")]
    Open(#[source] ArchiveError),

    #[error("error writing manifest: {0}")]
    Manifest(#[source] ArchiveError),

    #[error("error dumping {store} database: {source}")]
    Dump {
        store: String,
        #[source]
        source: DumpError,
    },

    #[error("error finalizing archive: {0}")]
    Finalize(#[source] ArchiveError),

    #[error("backup cancelled")]
    Cancelled,
}

impl BackupError {
    /// Store name for dump failures
    pub fn store(&self) -> Option<&str> {
        match self {
            BackupError::Dump { store, .. } => Some(store),
            _ => None,
        }
    }
}

/// Why a single dump target failed.
#[derive(Error, Debug)]
pub enum DumpError {
    #[error("{key} is not set in the {app} release environment")]
    MissingEnv { app: String, key: &'static str },

    #[error("{0} app is not in the manifest")]
    AppMissing(String),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("dump cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, BackupError>;
