//! Frame codec
//!
//! Every message on either channel is a 4-byte big-endian length followed
//! by that many bytes of JSON.

use crate::error::IpcError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Size of the length header
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encode a message with its length prefix
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, IpcError> {
    let json = serde_json::to_vec(msg)?;
    if json.len() > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(json.len()));
    }
    let len = json.len() as u32;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Write one framed message and flush
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message
///
/// Returns `Ok(None)` when the peer closed the stream on a frame boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, IpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(IpcError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => IpcError::Closed,
        _ => IpcError::Io(e),
    })?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Notification;

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(&Notification::TunnelsChanged).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - LENGTH_PREFIX_SIZE);
    }

    #[tokio::test]
    async fn test_read_sequence_then_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Notification::TunnelChanged("a".into())).await.unwrap();
        write_frame(&mut buf, &Notification::TunnelsChanged).await.unwrap();

        let mut reader = buf.as_slice();
        let first: Option<Notification> = read_frame(&mut reader).await.unwrap();
        let second: Option<Notification> = read_frame(&mut reader).await.unwrap();
        let end: Option<Notification> = read_frame(&mut reader).await.unwrap();
        assert_eq!(first, Some(Notification::TunnelChanged("a".into())));
        assert_eq!(second, Some(Notification::TunnelsChanged));
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_frames_cross_a_socket() {
        let (mut left, mut right) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            for _ in 0..3 {
                write_frame(&mut left, &Notification::TunnelChanged("office".into()))
                    .await
                    .unwrap();
            }
        });

        for _ in 0..3 {
            let event: Option<Notification> = read_frame(&mut right).await.unwrap();
            assert_eq!(event, Some(Notification::TunnelChanged("office".into())));
        }
        writer.await.unwrap();
        let end: Option<Notification> = read_frame(&mut right).await.unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let result: Result<Option<Notification>, _> = read_frame(&mut buf.as_slice()).await;
        assert!(matches!(result, Err(IpcError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_truncated_body_is_closed() {
        let mut buf = encode_frame(&Notification::TunnelsChanged).unwrap();
        buf.truncate(buf.len() - 2);
        let result: Result<Option<Notification>, _> = read_frame(&mut buf.as_slice()).await;
        assert!(matches!(result, Err(IpcError::Closed)));
    }

    #[tokio::test]
    async fn test_garbage_body_is_decode_error() {
        let mut buf = 3u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"???");
        let result: Result<Option<Notification>, _> = read_frame(&mut buf.as_slice()).await;
        assert!(matches!(result, Err(IpcError::Decode(_))));
    }
}
