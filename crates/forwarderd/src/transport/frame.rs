//! Newline-delimited JSON framing.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame either side will read.
pub(crate) const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Reads one newline-terminated frame.
///
/// Returns `Ok(None)` on a clean end of stream. A final frame without a
/// trailing newline is still returned.
pub(crate) async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if buffer.is_empty() { None } else { Some(buffer) });
        }
        if let Some(pos) = available.iter().position(|byte| *byte == b'\n') {
            buffer.extend_from_slice(&available[..pos]);
            reader.consume(pos + 1);
            enforce_frame_limit(buffer.len())?;
            return Ok(Some(buffer));
        }
        let read = available.len();
        buffer.extend_from_slice(available);
        reader.consume(read);
        enforce_frame_limit(buffer.len())?;
    }
}

/// Serialises `message` as one frame and flushes it.
pub(crate) async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let mut bytes = serde_json::to_vec(message).map_err(io::Error::other)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}

fn enforce_frame_limit(size: usize) -> io::Result<()> {
    if size > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds maximum size",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::BufReader;

    use super::*;

    #[tokio::test]
    async fn reads_consecutive_frames() {
        let mut reader = BufReader::new(&b"{\"a\":1}\n{\"b\":2}\n"[..]);
        assert_eq!(
            read_frame(&mut reader).await.expect("frame"),
            Some(b"{\"a\":1}".to_vec())
        );
        assert_eq!(
            read_frame(&mut reader).await.expect("frame"),
            Some(b"{\"b\":2}".to_vec())
        );
        assert_eq!(read_frame(&mut reader).await.expect("eof"), None);
    }

    #[tokio::test]
    async fn unterminated_final_frame_is_returned() {
        let mut reader = BufReader::new(&b"{}"[..]);
        assert_eq!(
            read_frame(&mut reader).await.expect("frame"),
            Some(b"{}".to_vec())
        );
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let oversized = vec![b'x'; MAX_FRAME_BYTES + 1];
        let mut reader = BufReader::new(&oversized[..]);
        let error = read_frame(&mut reader).await.expect_err("too large");
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn written_frames_end_with_a_newline() {
        let mut sink = Vec::new();
        write_frame(&mut sink, &serde_json::json!({"op": "ping"}))
            .await
            .expect("write");
        assert_eq!(sink, b"{\"op\":\"ping\"}\n");
    }
}
