//! Length-prefixed framing and the connection handshake.
//!
//! Every frame is a 4-byte big-endian length followed by the payload. The
//! first frame a client sends names the channel it wants:
//!
//! - `control`: JSON `ClientFrame`/`ServerFrame` traffic (see `protocol.rs`)
//! - `notebook_sync`: raw Automerge sync messages for one notebook
//!
//! The host replies with a `HandshakeReply` before any channel traffic.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for any frame (notebooks with large outputs).
const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Handshake frames are tiny; anything larger is not a client of ours.
const MAX_HANDSHAKE_FRAME_SIZE: usize = 64 * 1024;

/// First frame on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum Handshake {
    Control {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    NotebookSync {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
}

impl Handshake {
    pub fn token(&self) -> Option<&str> {
        match self {
            Handshake::Control { token } | Handshake::NotebookSync { token, .. } => {
                token.as_deref()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandshakeReply {
    Ok,
    Unauthorized,
    NotFound { what: String },
}

/// Send a length-prefixed frame.
pub async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame exceeds u32 length")
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

async fn recv_frame_with_limit<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, max_size),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Receive a frame. Returns `None` on a clean EOF.
pub async fn recv_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    recv_frame_with_limit(reader, MAX_FRAME_SIZE).await
}

pub async fn send_json_frame<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
) -> anyhow::Result<()> {
    let data = serde_json::to_vec(value)?;
    send_frame(writer, &data).await?;
    Ok(())
}

pub async fn recv_json_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> anyhow::Result<Option<T>> {
    match recv_frame(reader).await? {
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}

/// Read the handshake frame with the small-frame limit applied.
pub async fn recv_handshake<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> anyhow::Result<Option<Handshake>> {
    match recv_frame_with_limit(reader, MAX_HANDSHAKE_FRAME_SIZE).await? {
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let data = b"hello world";

        let mut buf = Vec::new();
        send_frame(&mut buf, data).await.unwrap();
        assert_eq!(buf.len(), 4 + data.len());
        assert_eq!(&buf[..4], &(data.len() as u32).to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_frame_eof() {
        let buf: &[u8] = &[];
        let mut cursor = std::io::Cursor::new(buf);
        assert!(recv_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"short");
        let mut cursor = std::io::Cursor::new(buf);
        assert!(recv_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let len_bytes = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        let mut cursor = std::io::Cursor::new(len_bytes.to_vec());
        assert!(recv_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_rejects_oversized() {
        let oversized_len = (MAX_HANDSHAKE_FRAME_SIZE as u32 + 1).to_be_bytes();
        let mut cursor = std::io::Cursor::new(oversized_len.to_vec());
        assert!(recv_handshake(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_roundtrip() {
        let handshake = Handshake::NotebookSync {
            path: "work/analysis.ipynb".into(),
            token: Some("secret".into()),
        };

        let mut buf = Vec::new();
        send_json_frame(&mut buf, &handshake).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_handshake(&mut cursor).await.unwrap().unwrap();
        assert_eq!(received, handshake);
        assert_eq!(received.token(), Some("secret"));
    }

    #[test]
    fn test_handshake_serialization() {
        let json = serde_json::to_string(&Handshake::Control { token: None }).unwrap();
        assert_eq!(json, r#"{"channel":"control"}"#);

        let json = serde_json::to_string(&Handshake::NotebookSync {
            path: "a.ipynb".into(),
            token: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"channel":"notebook_sync","path":"a.ipynb"}"#);

        let json = serde_json::to_string(&HandshakeReply::Unauthorized).unwrap();
        assert_eq!(json, r#"{"status":"unauthorized"}"#);
    }

    #[tokio::test]
    async fn test_multiple_json_frames_on_same_stream() {
        let mut buf = Vec::new();
        send_json_frame(&mut buf, &HandshakeReply::Ok).await.unwrap();
        send_json_frame(&mut buf, &HandshakeReply::Unauthorized)
            .await
            .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let first: HandshakeReply = recv_json_frame(&mut cursor).await.unwrap().unwrap();
        let second: HandshakeReply = recv_json_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(first, HandshakeReply::Ok);
        assert_eq!(second, HandshakeReply::Unauthorized);
        let third: Option<HandshakeReply> = recv_json_frame(&mut cursor).await.unwrap();
        assert!(third.is_none());
    }
}
