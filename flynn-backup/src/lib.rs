//! Flynn cluster backup
//!
//! Captures the configuration of the cluster's system apps and dumps of its
//! databases into a single tar archive.

pub mod archive;
pub mod assembler;
pub mod capture;
pub mod config;
pub mod platform;
pub mod shutdown;
pub mod utils;

// Re-export commonly used types
pub use archive::{ArchiveError, ArchiveWriter};
pub use assembler::{BackupAssembler, BackupOptions, BackupReport};
pub use capture::{CaptureError, RemoteCommandCapture};
pub use config::Config;
pub use platform::ControlPlane;
pub use utils::errors::{BackupError, DumpError, Result};
