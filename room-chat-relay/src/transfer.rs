//! Inline file transfer over a chat connection.
//!
//! A transfer is three frames on the same stream as ordinary chat: a
//! `FILE:<name>` line, a line holding the decimal byte count, and exactly that
//! many raw bytes. Senders follow up with an informational chat line once
//! the payload is flushed.

use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

use tracing::warn;

use crate::codec::{CHUNK_SIZE, FILE_PREFIX, write_line};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("file size line is not a decimal byte count: {0:?}")]
    InvalidSize(String),
    #[error("refusing unsafe file name {0:?}")]
    UnsafeFileName(String),
    #[error("stream ended after {received} of {declared} bytes")]
    Truncated { received: u64, declared: u64 },
    #[error("sender left the room before the transfer finished")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Progress of one incoming payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFileTransfer {
    pub file_name: String,
    pub declared_size: u64,
    pub bytes_received: u64,
}

impl PendingFileTransfer {
    pub fn new(file_name: impl Into<String>, declared_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            declared_size,
            bytes_received: 0,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.declared_size - self.bytes_received
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_received == self.declared_size
    }

    /// Copies the rest of the payload from `reader` into `sink`.
    ///
    /// Reads never go past the declared size, so whatever follows the payload
    /// is left in `reader` for line mode.
    pub async fn receive_into<R, W>(
        &mut self,
        reader: &mut R,
        sink: &mut W,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut chunk = [0u8; CHUNK_SIZE];
        while !self.is_complete() {
            let wanted = self.remaining().min(CHUNK_SIZE as u64) as usize;
            let read = reader.read(&mut chunk[..wanted]).await?;
            if read == 0 {
                return Err(TransferError::Truncated {
                    received: self.bytes_received,
                    declared: self.declared_size,
                });
            }
            sink.write_all(&chunk[..read]).await?;
            self.bytes_received += read as u64;
        }
        sink.flush().await?;
        Ok(self.bytes_received)
    }
}

pub fn parse_declared_size(line: &str) -> Result<u64, TransferError> {
    line.trim()
        .parse()
        .map_err(|_| TransferError::InvalidSize(line.to_string()))
}

/// Resolves a peer-supplied file name inside `storage_root`.
///
/// Only bare file names are accepted; anything that could address another
/// directory is refused.
pub fn confine_to_root(storage_root: &Path, file_name: &str) -> Result<PathBuf, TransferError> {
    let unsafe_name = file_name.is_empty()
        || file_name == "."
        || file_name == ".."
        || file_name.contains(['/', '\\', '\0']);
    if unsafe_name {
        return Err(TransferError::UnsafeFileName(file_name.to_string()));
    }
    Ok(storage_root.join(file_name))
}

/// Reads `transfer`'s payload into a new file at `destination`.
///
/// A payload cut short by the peer leaves no partial file behind.
pub async fn receive_file<R>(
    reader: &mut R,
    destination: &Path,
    transfer: &mut PendingFileTransfer,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut file = File::create(destination).await?;
    match transfer.receive_into(reader, &mut file).await {
        Ok(received) => Ok(received),
        Err(err) => {
            drop(file);
            remove_partial(destination).await;
            Err(err)
        }
    }
}

/// Deletes a file left behind by an unfinished transfer.
pub async fn remove_partial(destination: &Path) {
    match tokio::fs::remove_file(destination).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(path = %destination.display(), error = %err, "failed to remove partial file")
        }
    }
}

/// Consumes `transfer`'s payload without storing it, keeping the stream
/// aligned on the next line frame.
pub async fn discard<R>(
    reader: &mut R,
    transfer: &mut PendingFileTransfer,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
{
    transfer.receive_into(reader, &mut tokio::io::sink()).await
}

/// Sends the file at `path` under its base name, followed by the
/// `Finished sending file` line. Returns the payload size.
pub async fn send_file<W>(writer: &mut W, path: &Path) -> Result<u64, TransferError>
where
    W: AsyncWrite + Unpin,
{
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TransferError::UnsafeFileName(path.display().to_string()))?;

    let mut file = File::open(path).await?;
    let declared = file.metadata().await?.len();

    write_line(writer, &format!("{FILE_PREFIX}{file_name}")).await?;
    write_line(writer, &declared.to_string()).await?;

    let mut outgoing = PendingFileTransfer::new(file_name, declared);
    outgoing.receive_into(&mut file, writer).await?;

    write_line(writer, &format!("Finished sending file: {file_name}")).await?;
    Ok(declared)
}
