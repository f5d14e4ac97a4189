use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload sent as a single datagram; anything bigger falls back to
/// the connection-oriented channel for that one message. Sized to stay under
/// common path-MTU limits.
pub const MAX_DATAGRAM_BYTES: usize = 575;

/// Upper bound on an inbound frame, guarding the length-prefix allocation
/// against garbage input.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Writes one length-prefixed frame: a 4-byte big-endian payload length
/// followed by the payload bytes.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame, buffering until the declared length has
/// fully arrived. Returns `None` on a clean end of stream before a header.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error.into()),
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_BYTES {
        bail!("frame length {} exceeds limit", len);
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
