//! Length-prefixed framing over any async byte stream.
//!
//! Each frame is: `[u32 big-endian length][payload]`.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame payload (16 MiB).
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Writes `payload` as one length-prefixed frame and flushes.
pub async fn send_frame(w: &mut (impl AsyncWrite + Unpin), payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len <= MAX_FRAME)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds 16 MiB limit"))?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(payload).await?;
    w.flush().await
}

/// Reads one length-prefixed frame.
///
/// A clean end of stream before the header surfaces as
/// [`io::ErrorKind::UnexpectedEof`].
pub async fn recv_frame(r: &mut (impl AsyncRead + Unpin)) -> io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_preserve_boundaries() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            send_frame(&mut a, b"first").await.unwrap();
            send_frame(&mut a, b"").await.unwrap();
            send_frame(&mut a, b"third frame").await.unwrap();
        });

        assert_eq!(recv_frame(&mut b).await.unwrap(), b"first");
        assert_eq!(recv_frame(&mut b).await.unwrap(), b"");
        assert_eq!(recv_frame(&mut b).await.unwrap(), b"third frame");
        writer.await.unwrap();

        let eof = recv_frame(&mut b).await.unwrap_err();
        assert_eq!(eof.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        // Craft a frame header claiming 32 MiB
        let header = (32u32 * 1024 * 1024).to_be_bytes();
        let mut cursor = &header[..];
        let err = recv_frame(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
