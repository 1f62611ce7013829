//! Request body streaming into the child's stdin.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{AppError, Result};

/// Message logged when `CONTENT_LENGTH` cannot be used.
pub const INVALID_LENGTH: &str = "invalid Content-Length header";

/// Interpret the declared `CONTENT_LENGTH`.
///
/// An absent or empty value means no body.
///
/// # Errors
///
/// Returns `AppError::Length` if the value is not a non-negative integer.
pub fn declared_length(raw: Option<&str>) -> Result<u64> {
    match raw.map(str::trim) {
        None | Some("") => Ok(0),
        Some(text) => text
            .parse::<u64>()
            .map_err(|_| AppError::Length(INVALID_LENGTH.into())),
    }
}

/// Copy at most `length` bytes from `input` into `stdin`, then close `stdin`.
///
/// Reads happen in chunks of at most `chunk_size` bytes and stop early when
/// `input` runs dry. A child that exits without draining its input shows up
/// as a broken pipe, which ends the copy without error.
///
/// Returns the number of bytes delivered to the child.
///
/// # Errors
///
/// Returns `AppError::Io` if reading the request body or writing the pipe
/// fails for any other reason.
pub async fn feed_stdin<R, W>(mut input: R, mut stdin: W, length: u64, chunk_size: usize) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0_u8; chunk_size.max(1)];
    let mut remaining = length;
    let mut copied = 0_u64;

    while remaining > 0 {
        let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let read = input
            .read(&mut buf[..want])
            .await
            .map_err(|err| AppError::Io(format!("failed to read request body: {err}")))?;
        if read == 0 {
            break;
        }

        match stdin.write_all(&buf[..read]).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                debug!(copied, "cgi process closed stdin early");
                return Ok(copied);
            }
            Err(err) => return Err(AppError::Io(format!("failed to write cgi stdin: {err}"))),
        }

        copied += read as u64;
        remaining -= read as u64;
    }

    match stdin.shutdown().await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::BrokenPipe => {}
        Err(err) => return Err(AppError::Io(format!("failed to close cgi stdin: {err}"))),
    }
    Ok(copied)
}
