//! Reading `\r\n`-terminated protocol lines with a length cap.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest accepted request line: a 1024 byte URL plus `\r\n`.
pub const MAX_REQUEST_LINE: usize = 1024 + 2;

/// Longest accepted response header line: two digits, a space, a 1024 byte
/// meta and `\r\n`.
pub const MAX_HEADER_LINE: usize = 2 + 1 + 1024 + 2;

/// A protocol line could not be read.
#[derive(Debug, Error)]
pub enum LineError {
    /// The stream ended, or the line ended in a bare `\n`.
    #[error("invalid header: line is not terminated by CRLF")]
    MissingTerminator,
    /// No `\n` within the allowed number of bytes.
    #[error("line exceeds {0} bytes")]
    TooLong(usize),
    /// The line is not UTF-8.
    #[error("line is not valid UTF-8")]
    NotUtf8,
    /// The transport failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read one `\r\n` terminated line of at most `limit` bytes and return it
/// without the terminator. Nothing past the `\n` is consumed from `reader`.
pub async fn read_line<R>(reader: &mut R, limit: usize) -> Result<String, LineError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let limit_u64 = u64::try_from(limit).unwrap_or(u64::MAX);
    reader.take(limit_u64).read_until(b'\n', &mut line).await?;

    if line.last() != Some(&b'\n') {
        return Err(if line.len() >= limit {
            LineError::TooLong(limit)
        } else {
            LineError::MissingTerminator
        });
    }

    if !line.ends_with(b"\r\n") {
        return Err(LineError::MissingTerminator);
    }
    line.truncate(line.len() - 2);

    String::from_utf8(line).map_err(|_| LineError::NotUtf8)
}
