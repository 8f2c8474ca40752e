//! Streaming tar archive writer.
//!
//! Entries are written strictly in sequence to a single async sink. A tar
//! header carries the entry size and has to precede the body, so streamed
//! entries are buffered in a [`SpillBuffer`] until the source is exhausted.
//! Nothing is emitted for a source that fails part way through.
//!
//! Layout of every entry: one 512-byte header block, the body, zero padding
//! up to the next block boundary. The archive ends with two zero blocks.

pub mod spool;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use spool::{SpillBuffer, SpoolOptions};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

pub const BLOCK_SIZE: usize = 512;

const ENTRY_MODE: u32 = 0o644;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("failed to encode {name}: {source}")]
    Encoding {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write archive: {0}")]
    Write(#[from] std::io::Error),

    #[error("invalid entry name {name}: {reason}")]
    EntryName { name: String, reason: String },

    #[error("archive is closed")]
    Closed,
}

/// Failure of a streamed entry: either the byte source or the archive itself.
#[derive(Error, Debug)]
pub enum EntryError<E> {
    #[error("entry source failed: {0}")]
    Source(E),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Tar writer that exclusively owns its sink until [`ArchiveWriter::close`].
pub struct ArchiveWriter<W: AsyncWrite + Unpin> {
    base_name: String,
    sink: Option<W>,
    spool: SpoolOptions,
    mtime: u64,
    entries: usize,
    /// Set once a partial write may have reached the sink
    poisoned: bool,
}

impl<W: AsyncWrite + Unpin> ArchiveWriter<W> {
    /// Begin an archive whose entries all live under `base_name/`.
    pub async fn open(
        base_name: impl Into<String>,
        mut sink: W,
        spool: SpoolOptions,
    ) -> Result<Self, ArchiveError> {
        sink.flush().await?;

        let mtime = chrono::Utc::now().timestamp().max(0) as u64;
        Ok(Self {
            base_name: base_name.into(),
            sink: Some(sink),
            spool,
            mtime,
            entries: 0,
            poisoned: false,
        })
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Number of entries fully written so far
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    pub fn is_closed(&self) -> bool {
        self.sink.is_none()
    }

    /// Serialize `value` as JSON and write it as a single entry.
    ///
    /// Returns the entry's body length.
    pub async fn write_structured_entry<T>(&mut self, name: &str, value: &T) -> Result<u64, ArchiveError>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_writable()?;

        let body = serde_json::to_vec(value).map_err(|source| ArchiveError::Encoding {
            name: name.to_string(),
            source,
        })?;
        let header = self.header(name, body.len() as u64)?;

        let mut sink = self.sink_for_write()?;
        let result = async {
            sink.write_all(header.as_bytes()).await?;
            sink.write_all(&body).await?;
            write_padding(&mut sink, body.len() as u64).await
        }
        .await;
        self.finish_entry(name, body.len() as u64, result)
    }

    /// Buffer everything `source` yields, then write it as a single entry.
    ///
    /// If `source` yields an error the buffered data is dropped and the
    /// archive is left exactly as it was before the call.
    pub async fn write_streamed_entry<S, E>(&mut self, name: &str, source: S) -> Result<u64, EntryError<E>>
    where
        S: Stream<Item = Result<Bytes, E>>,
    {
        self.ensure_writable()?;
        // Validate the name before spending time on the source
        self.header(name, 0)?;

        let mut buffer = SpillBuffer::new(self.spool.clone());
        let mut source = std::pin::pin!(source);
        while let Some(chunk) = source.next().await {
            match chunk {
                Ok(data) => buffer.write(&data).await.map_err(ArchiveError::Write)?,
                Err(e) => {
                    debug!("Discarding {} buffered bytes for {}", buffer.len(), name);
                    return Err(EntryError::Source(e));
                }
            }
        }

        let len = buffer.len();
        let header = self.header(name, len)?;

        let mut sink = self.sink_for_write()?;
        let result = async {
            sink.write_all(header.as_bytes()).await?;
            buffer.drain_into(&mut sink).await?;
            write_padding(&mut sink, len).await
        }
        .await;
        Ok(self.finish_entry(name, len, result)?)
    }

    /// Write the end-of-archive marker and release the sink.
    ///
    /// Safe to call more than once; later calls do nothing. After a failed
    /// write the marker is skipped, since the archive is already unusable.
    pub async fn close(&mut self) -> Result<(), ArchiveError> {
        let Some(mut sink) = self.sink.take() else {
            return Ok(());
        };

        if !self.poisoned {
            sink.write_all(&[0u8; BLOCK_SIZE * 2]).await?;
        }
        sink.flush().await?;
        sink.shutdown().await?;

        debug!(
            "Closed archive {} ({} entries{})",
            self.base_name,
            self.entries,
            if self.poisoned { ", incomplete" } else { "" }
        );
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), ArchiveError> {
        if self.sink.is_none() {
            return Err(ArchiveError::Closed);
        }
        if self.poisoned {
            return Err(ArchiveError::Write(std::io::Error::other(
                "archive is incomplete after an earlier write failure",
            )));
        }
        Ok(())
    }

    // Borrow the sink for one entry; the entry counts as in flight until
    // finish_entry sees the result.
    fn sink_for_write(&mut self) -> Result<&mut W, ArchiveError> {
        self.poisoned = true;
        self.sink.as_mut().ok_or(ArchiveError::Closed)
    }

    fn finish_entry(
        &mut self,
        name: &str,
        len: u64,
        result: std::io::Result<()>,
    ) -> Result<u64, ArchiveError> {
        result?;
        self.poisoned = false;
        self.entries += 1;
        debug!("Wrote archive entry {}/{} ({} bytes)", self.base_name, name, len);
        Ok(len)
    }

    fn header(&self, name: &str, len: u64) -> Result<tar::Header, ArchiveError> {
        if name.is_empty() || name.starts_with('/') || name.split('/').any(|c| c == "..") {
            return Err(ArchiveError::EntryName {
                name: name.to_string(),
                reason: "must be a relative path".to_string(),
            });
        }

        let path = format!("{}/{}", self.base_name, name);
        let mut header = tar::Header::new_gnu();
        header
            .set_path(&path)
            .map_err(|e| ArchiveError::EntryName {
                name: path.clone(),
                reason: e.to_string(),
            })?;
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(len);
        header.set_mode(ENTRY_MODE);
        header.set_mtime(self.mtime);
        header.set_cksum();
        Ok(header)
    }
}

impl<W: AsyncWrite + Unpin> Drop for ArchiveWriter<W> {
    fn drop(&mut self) {
        if self.sink.is_some() {
            warn!("Archive {} dropped without being closed", self.base_name);
        }
    }
}

async fn write_padding<W>(sink: &mut W, len: u64) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let remainder = (len % BLOCK_SIZE as u64) as usize;
    if remainder != 0 {
        sink.write_all(&[0u8; BLOCK_SIZE][..BLOCK_SIZE - remainder]).await?;
    }
    Ok(())
}

/// Read an archive back as (path, body) pairs in order.
#[cfg(test)]
pub(crate) fn read_entries(data: &[u8]) -> Vec<(String, Vec<u8>)> {
    use std::io::Read;

    let mut archive = tar::Archive::new(data);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().to_string();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).unwrap();
            assert_eq!(entry.header().size().unwrap(), body.len() as u64);
            (path, body)
        })
        .collect()
}
