//! Length-prefixed message framing.
//!
//! Every framed message is a 4-byte big-endian length followed by that
//! many payload bytes. Encryption happens above this layer.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use lattice_shared::constants::MAX_FRAME_SIZE;
use lattice_shared::error::WireError;

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_frame(&mut a, b"hello mesh").await.unwrap();
        let payload = read_frame(&mut b).await.unwrap();
        assert_eq!(payload, b"hello mesh");
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);

        write_frame(&mut a, b"").await.unwrap();
        let payload = read_frame(&mut b).await.unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_multiple_frames_in_order() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"second").await.unwrap();

        assert_eq!(read_frame(&mut b).await.unwrap(), b"first");
        assert_eq!(read_frame(&mut b).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let bogus = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &bogus)
            .await
            .unwrap();

        assert!(matches!(
            read_frame(&mut b).await,
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_payload_refused_on_write() {
        let (mut a, _b) = tokio::io::duplex(64);
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            write_frame(&mut a, &payload).await,
            Err(WireError::FrameTooLarge { .. })
        ));
    }
}
