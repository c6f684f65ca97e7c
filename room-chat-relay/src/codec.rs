use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Prefix that turns a line into the start of an inline file transfer.
pub const FILE_PREFIX: &str = "FILE:";

/// Size of the raw reads and writes used while a file payload is in flight.
pub const CHUNK_SIZE: usize = 1024;

/// Longest line frame accepted from a peer, not counting the newline.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// One decoded line-mode frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    FileStart { file_name: String },
}

impl Frame {
    pub fn parse(line: String) -> Self {
        match line.strip_prefix(FILE_PREFIX) {
            Some(file_name) => Frame::FileStart {
                file_name: file_name.to_string(),
            },
            None => Frame::Text(line),
        }
    }
}

/// Reads the next newline-terminated line, stripping trailing whitespace.
///
/// Returns `Ok(None)` once the peer has closed the stream. Empty lines are
/// returned as `Some("")` so callers can decide what an empty line means in
/// their current state. A line longer than [`MAX_LINE_BYTES`] is an
/// `InvalidData` error.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer = Vec::new();
    let bytes = (&mut *reader)
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut buffer)
        .await?;
    if bytes == 0 {
        return Ok(None);
    }
    if buffer.len() > MAX_LINE_BYTES && buffer.last() != Some(&b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line frame exceeds {MAX_LINE_BYTES} bytes"),
        ));
    }

    let line = String::from_utf8(buffer).map_err(to_io_error)?;
    Ok(Some(line.trim_end().to_string()))
}

/// Writes `line` followed by a single `\n` and flushes.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = encode_line(line)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

pub fn encode_line(line: &str) -> io::Result<Vec<u8>> {
    if line.contains('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "line frames cannot contain an embedded newline",
        ));
    }

    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    Ok(encoded)
}

fn to_io_error(err: std::string::FromUtf8Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
