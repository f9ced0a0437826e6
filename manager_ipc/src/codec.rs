//! Wire Codec
//!
//! Frames are a little-endian `u32` length prefix followed by a bincode
//! payload. Payloads use fixed-width integers, so enum tags are four bytes
//! and fields follow in declaration order.

use crate::transport::{IpcError, IpcResult};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted in either direction
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const LEN_PREFIX: usize = 4;

fn bincode_config() -> impl Options {
    bincode::options()
        .with_limit(MAX_FRAME_LEN as u64)
        .with_fixint_encoding()
}

/// Serialize a value into a frame payload (no length prefix)
pub fn encode<T: Serialize>(value: &T) -> IpcResult<Vec<u8>> {
    bincode_config()
        .serialize(value)
        .map_err(IpcError::Serialization)
}

/// Deserialize a frame payload. Unknown tags, short payloads and trailing
/// bytes are all errors.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> IpcResult<T> {
    bincode_config()
        .deserialize(payload)
        .map_err(IpcError::Serialization)
}

/// Serialize a value into a complete length-prefixed frame
pub fn encode_frame<T: Serialize>(value: &T) -> IpcResult<Vec<u8>> {
    let payload = encode(value)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(IpcError::Protocol(format!(
            "Frame too large: {} bytes",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one frame and flush it
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> IpcResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let frame = encode_frame(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary. A
/// stream that ends inside a frame is a protocol error.
pub async fn read_frame<R, T>(reader: &mut R) -> IpcResult<Option<T>>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; LEN_PREFIX];
    let mut filled = 0;
    while filled < LEN_PREFIX {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(IpcError::Protocol(format!(
                "Truncated frame header ({} of {} bytes)",
                filled, LEN_PREFIX
            )));
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(IpcError::Protocol(format!(
            "Message too large: {} bytes",
            len
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            IpcError::Protocol(format!("Truncated frame body (expected {} bytes)", len))
        } else {
            IpcError::Io(e)
        }
    })?;

    decode(&payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MethodCall, NotificationEvent, QuitResponse, TunnelState};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frames_preserve_order() {
        let (mut client, mut server) = duplex(1024);

        write_frame(&mut client, &MethodCall::QueryUpdateState)
            .await
            .unwrap();
        write_frame(
            &mut client,
            &MethodCall::Quit {
                stop_tunnels_on_quit: true,
            },
        )
        .await
        .unwrap();
        drop(client);

        let first: Option<MethodCall> = read_frame(&mut server).await.unwrap();
        let second: Option<MethodCall> = read_frame(&mut server).await.unwrap();
        let end: Option<MethodCall> = read_frame(&mut server).await.unwrap();

        assert_eq!(first, Some(MethodCall::QueryUpdateState));
        assert_eq!(
            second,
            Some(MethodCall::Quit {
                stop_tunnels_on_quit: true
            })
        );
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_response_with_and_without_error() {
        let (mut client, mut server) = duplex(1024);
        let ok = QuitResponse {
            already_quit: false,
            error: None,
        };
        let denied = QuitResponse {
            already_quit: false,
            error: Some("Access is denied".to_string()),
        };

        write_frame(&mut server, &ok).await.unwrap();
        write_frame(&mut server, &denied).await.unwrap();

        let got: QuitResponse = read_frame(&mut client).await.unwrap().unwrap();
        assert_eq!(got, ok);
        let got: QuitResponse = read_frame(&mut client).await.unwrap().unwrap();
        assert_eq!(got, denied);
    }

    #[tokio::test]
    async fn test_unit_response_is_empty_frame() {
        let frame = encode_frame(&()).unwrap();
        assert_eq!(frame, vec![0, 0, 0, 0]);

        let mut reader: &[u8] = &frame;
        let got: Option<()> = read_frame(&mut reader).await.unwrap();
        assert_eq!(got, Some(()));
    }

    #[tokio::test]
    async fn test_truncated_header_is_protocol_error() {
        let mut reader: &[u8] = &[3, 0];
        let result: IpcResult<Option<MethodCall>> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(IpcError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_body_is_protocol_error() {
        let frame = encode_frame(&NotificationEvent::TunnelStateChanged(TunnelState::Running))
            .unwrap();
        let mut reader: &[u8] = &frame[..frame.len() - 1];
        let result: IpcResult<Option<NotificationEvent>> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(IpcError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let len = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        let mut reader: &[u8] = &len;
        let result: IpcResult<Option<MethodCall>> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(IpcError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_unknown_tag_in_frame_is_error() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&4u32.to_le_bytes());
        frame.extend_from_slice(&99u32.to_le_bytes());
        let mut reader: &[u8] = &frame;
        let result: IpcResult<Option<MethodCall>> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(IpcError::Serialization(_))));
    }
}
