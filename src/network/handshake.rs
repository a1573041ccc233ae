//! Magic-tag handshake
//!
//! Both sides write the tag as soon as the socket opens, then read and compare
//! the peer's tag. A mismatch closes the connection without a word.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol magic tag
pub const MAGIC: &[u8; 10] = b"MESHCAST/1";

/// Write our tag and check the peer's
///
/// Returns `Ok(false)` on mismatch, EOF or timeout; only write errors are
/// reported as errors.
pub async fn exchange<R, W>(
    reader: &mut R,
    writer: &mut W,
    timeout: Duration,
) -> std::io::Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(MAGIC).await?;
    writer.flush().await?;
    read_magic(reader, timeout).await
}

/// Read the peer's tag and compare it
pub async fn read_magic<R>(reader: &mut R, timeout: Duration) -> std::io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut tag = [0u8; MAGIC.len()];
    match tokio::time::timeout(timeout, reader.read_exact(&mut tag)).await {
        Ok(Ok(_)) => Ok(&tag == MAGIC),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_matching_tags() {
        let (a, b) = tokio::io::duplex(64);
        let (mut a_read, mut a_write) = tokio::io::split(a);
        let (mut b_read, mut b_write) = tokio::io::split(b);

        let (left, right) = tokio::join!(
            exchange(&mut a_read, &mut a_write, TIMEOUT),
            exchange(&mut b_read, &mut b_write, TIMEOUT)
        );
        assert!(left.unwrap());
        assert!(right.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_tag_fails() {
        let (a, b) = tokio::io::duplex(64);
        let (mut a_read, mut a_write) = tokio::io::split(a);
        let (_b_read, mut b_write) = tokio::io::split(b);

        b_write.write_all(b"COMMUNICAS").await.unwrap();
        assert!(!exchange(&mut a_read, &mut a_write, TIMEOUT).await.unwrap());
    }

    #[tokio::test]
    async fn test_eof_and_silence_fail() {
        let (a, b) = tokio::io::duplex(64);
        let (mut a_read, mut a_write) = tokio::io::split(a);
        drop(b);
        assert!(!read_magic(&mut a_read, TIMEOUT).await.unwrap());
        assert!(exchange(&mut a_read, &mut a_write, TIMEOUT).await.is_err());

        let (a, _b) = tokio::io::duplex(64);
        let (mut a_read, _) = tokio::io::split(a);
        assert!(!read_magic(&mut a_read, Duration::from_millis(50)).await.unwrap());
    }
}
