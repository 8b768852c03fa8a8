//! Newline-delimited JSON framing.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::ProtoError;

/// Upper bound on a single line unless configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Read the next frame. Returns `Ok(None)` on clean EOF.
///
/// Blank lines are skipped.
pub async fn read_frame<R, T>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<T>, ProtoError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = (&mut *reader)
            .take(max_frame_bytes as u64 + 1)
            .read_line(&mut line)
            .await?;

        if bytes_read == 0 {
            return Ok(None);
        }
        if bytes_read > max_frame_bytes {
            return Err(ProtoError::FrameTooLarge(max_frame_bytes));
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        trace!(bytes = bytes_read, "Read frame");
        return Ok(Some(serde_json::from_str(trimmed)?));
    }
}

/// Serialize `frame` as one line and flush it.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut json = serde_json::to_vec(frame)?;
    json.push(b'\n');
    writer.write_all(&json).await?;
    writer.flush().await?;
    trace!(bytes = json.len(), "Wrote frame");
    Ok(())
}
