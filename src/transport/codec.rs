//! Length-prefixed frame codec.
//!
//! Used on QUIC streams and the storage-driver unix socket, where the
//! transport gives a byte stream rather than discrete messages.
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ u32 BE length│ JSON body (length bytes)     │
//! └──────────────┴──────────────────────────────┘
//! ```
//!
//! A length above the configured maximum is a malformed frame; the caller
//! closes the connection rather than trying to resynchronize.

use crate::error::{HubError, Result};
use crate::message::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const LENGTH_PREFIX: usize = 4;

/// Encode any serializable value as one frame.
pub fn encode_value<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(value)?;
    if body.len() > max_frame_bytes {
        return Err(HubError::Frame(format!(
            "outbound frame of {} bytes exceeds limit {}",
            body.len(),
            max_frame_bytes
        )));
    }
    let len = u32::try_from(body.len()).map_err(|_| HubError::Frame("frame length overflows u32".into()))?;
    let mut buf = Vec::with_capacity(LENGTH_PREFIX + body.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

pub fn encode_frame(message: &Message, max_frame_bytes: usize) -> Result<Vec<u8>> {
    encode_value(message, max_frame_bytes)
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet hold a complete frame, otherwise
/// the message and the number of bytes consumed.
pub fn decode_frame(buf: &[u8], max_frame_bytes: usize) -> Result<Option<(Message, usize)>> {
    let Some(prefix) = buf.get(..LENGTH_PREFIX) else {
        return Ok(None);
    };
    let len = frame_len(prefix, max_frame_bytes)?;
    let Some(body) = buf.get(LENGTH_PREFIX..LENGTH_PREFIX + len) else {
        return Ok(None);
    };
    Ok(Some((Message::from_slice(body)?, LENGTH_PREFIX + len)))
}

fn frame_len(prefix: &[u8], max_frame_bytes: usize) -> Result<usize> {
    let mut raw = [0u8; LENGTH_PREFIX];
    raw.copy_from_slice(prefix);
    let len = u32::from_be_bytes(raw) as usize;
    if len > max_frame_bytes {
        return Err(HubError::Frame(format!(
            "frame length {} exceeds limit {}",
            len, max_frame_bytes
        )));
    }
    Ok(len)
}

/// Read one raw frame body. `Ok(None)` on clean EOF at a frame boundary.
pub async fn read_raw<R: AsyncRead + Unpin>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; LENGTH_PREFIX];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = frame_len(&prefix, max_frame_bytes)?;
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| HubError::Frame(format!("truncated frame body: {}", e)))?;
    Ok(Some(body))
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Message>> {
    match read_raw(reader, max_frame_bytes).await? {
        Some(body) => Ok(Some(Message::from_slice(&body)?)),
        None => Ok(None),
    }
}

/// Read one frame as an arbitrary JSON document.
pub async fn read_value<R, T>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_raw(reader, max_frame_bytes).await? {
        Some(body) => serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| HubError::Frame(e.to_string())),
        None => Ok(None),
    }
}

pub async fn write_value<W, T>(writer: &mut W, value: &T, max_frame_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = encode_value(value, max_frame_bytes)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message, max_frame_bytes: usize) -> Result<()> {
    write_value(writer, message, max_frame_bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NodeIdentity;

    const MAX: usize = 64 * 1024;

    fn sample() -> Message {
        Message::update(
            NodeIdentity::new("edge-1").unwrap(),
            "default/device/d1",
            3,
            serde_json::json!({"desired": {"power": "on"}}),
        )
    }

    #[test]
    fn test_decode_partial_returns_none() {
        let frame = encode_frame(&sample(), MAX).unwrap();
        assert!(decode_frame(&frame[..2], MAX).unwrap().is_none());
        assert!(decode_frame(&frame[..frame.len() - 1], MAX).unwrap().is_none());
        let (msg, used) = decode_frame(&frame, MAX).unwrap().unwrap();
        assert_eq!(used, frame.len());
        assert_eq!(msg, sample());
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let mut buf = encode_frame(&sample(), MAX).unwrap();
        let first_len = buf.len();
        buf.extend(encode_frame(&Message::keepalive(NodeIdentity::new("edge-1").unwrap()), MAX).unwrap());
        let (_, used) = decode_frame(&buf, MAX).unwrap().unwrap();
        assert_eq!(used, first_len);
        let (second, _) = decode_frame(&buf[used..], MAX).unwrap().unwrap();
        assert_eq!(second.operation, crate::message::Operation::Keepalive);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = (MAX as u32 + 1).to_be_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        assert!(matches!(decode_frame(&buf, MAX), Err(HubError::Frame(_))));
    }

    #[test]
    fn test_oversized_outbound_rejected() {
        let big = Message::update(
            NodeIdentity::new("edge-1").unwrap(),
            "r",
            1,
            serde_json::json!("x".repeat(256)),
        );
        assert!(encode_frame(&big, 64).is_err());
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, &sample(), MAX).await.unwrap();
        drop(a);
        let got = read_frame(&mut b, MAX).await.unwrap().unwrap();
        assert_eq!(got, sample());
        assert!(read_frame(&mut b, MAX).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_body_is_frame_error() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = encode_frame(&sample(), MAX).unwrap();
        a.write_all(&frame[..frame.len() - 3]).await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b, MAX).await, Err(HubError::Frame(_))));
    }

    #[tokio::test]
    async fn test_garbage_body_is_frame_error() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(&5u32.to_be_bytes()).await.unwrap();
        a.write_all(b"nope!").await.unwrap();
        assert!(matches!(read_frame(&mut b, MAX).await, Err(HubError::Frame(_))));
    }
}
