//! Spill-to-disk buffer for entries of unknown length.
//!
//! Holds data in memory up to a threshold, then moves everything into an
//! anonymous temporary file. The file is unlinked at creation, so dropping the
//! buffer releases the storage on every path.

use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Default in-memory limit before spilling (8MB)
pub const DEFAULT_SPILL_THRESHOLD: usize = 8 * 1024 * 1024;

/// Where and when streamed entries spill to disk
#[derive(Debug, Clone)]
pub struct SpoolOptions {
    /// Bytes kept in memory before switching to a temporary file
    pub spill_threshold: usize,

    /// Directory for temporary files (system default when unset)
    pub temp_dir: Option<PathBuf>,
}

impl Default for SpoolOptions {
    fn default() -> Self {
        Self {
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            temp_dir: None,
        }
    }
}

enum Storage {
    Memory(Vec<u8>),
    File(File),
}

pub struct SpillBuffer {
    storage: Storage,
    len: u64,
    options: SpoolOptions,
}

impl SpillBuffer {
    pub fn new(options: SpoolOptions) -> Self {
        Self {
            storage: Storage::Memory(Vec::new()),
            len: 0,
            options,
        }
    }

    /// Total bytes buffered so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.storage, Storage::File(_))
    }

    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if let Storage::Memory(buf) = &mut self.storage {
            if buf.len() + data.len() <= self.options.spill_threshold {
                buf.extend_from_slice(data);
                self.len += data.len() as u64;
                return Ok(());
            }

            let mut file = create_temp_file(self.options.temp_dir.clone()).await?;
            file.write_all(buf).await?;
            debug!("Spilled {} buffered bytes to temporary file", buf.len());
            self.storage = Storage::File(file);
        }

        if let Storage::File(file) = &mut self.storage {
            file.write_all(data).await?;
        }
        self.len += data.len() as u64;
        Ok(())
    }

    /// Copy the buffered bytes into `sink`, consuming the buffer.
    ///
    /// Returns the number of bytes copied, which always equals `len()`.
    pub async fn drain_into<W>(self, sink: &mut W) -> std::io::Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        match self.storage {
            Storage::Memory(buf) => {
                sink.write_all(&buf).await?;
                Ok(buf.len() as u64)
            }
            Storage::File(mut file) => {
                file.flush().await?;
                file.seek(SeekFrom::Start(0)).await?;
                let mut body = tokio::io::AsyncReadExt::take(file, self.len);
                let copied = tokio::io::copy(&mut body, sink).await?;
                if copied != self.len {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("spill file held {} of {} bytes", copied, self.len),
                    ));
                }
                Ok(copied)
            }
        }
    }
}

async fn create_temp_file(dir: Option<PathBuf>) -> std::io::Result<File> {
    let file = tokio::task::spawn_blocking(move || match dir {
        Some(dir) => tempfile::tempfile_in(dir),
        None => tempfile::tempfile(),
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(File::from_std(file))
}
