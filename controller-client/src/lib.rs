//! Flynn controller client
//!
//! Thin HTTP client for the parts of the controller API the backup tool needs:
//! app, release, formation and artifact lookups, plus one-off jobs whose
//! output is streamed back over the attach frame protocol.

pub mod attach;
pub mod client;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use attach::{AttachCodec, AttachFrame};
pub use client::{AttachStream, ControllerClient, JobAttachment};
pub use error::{ClientError, Result};
pub use types::{App, Artifact, ExpandedFormation, Formation, NewJob, Release};
