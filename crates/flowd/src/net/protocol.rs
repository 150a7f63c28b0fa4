//! Wire protocol: length-prefixed JSON envelopes over TCP.
//!
//! The reference originally used ZeroMQ; the contract is only "reliable
//! message boundaries and authentication", so framing here is a plain
//! 4-byte big-endian length prefix followed by a JSON payload.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Request {
    Query { name: String, args: serde_json::Value },
    Mutate { name: String, args: serde_json::Value },
    Subscribe { topic: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Response {
    QueryResult { value: serde_json::Value },
    MutateResult { ack: bool, diff: serde_json::Value },
    SubscribeEvent { topic: String, value: serde_json::Value },
    Error { message: String },
}

/// Every message on the wire declares the protocol version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub protocol_version: u32,
    pub auth_token: String,
    pub body: T,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")]
    FrameTooLarge,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed JSON frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("connection closed")]
    Closed,
}

pub async fn write_frame<W: AsyncWriteExt + Unpin, T: Serialize>(
    writer: &mut W,
    value: &Envelope<T>,
) -> Result<(), ProtocolError> {
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() as u32 > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge);
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncReadExt + Unpin, T: for<'de> Deserialize<'de>>(
    reader: &mut R,
) -> Result<Envelope<T>, ProtocolError> {
    let len = match reader.read_u32().await {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(ProtocolError::Closed),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge);
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_over_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let envelope = Envelope {
            protocol_version: 1,
            auth_token: "secret".to_string(),
            body: Request::Query { name: "show".to_string(), args: serde_json::json!({}) },
        };
        write_frame(&mut client, &envelope).await.unwrap();
        let received: Envelope<Request> = read_frame(&mut server).await.unwrap();
        assert_eq!(received.protocol_version, 1);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, _server) = tokio::io::duplex(64);
        let huge = Envelope {
            protocol_version: 1,
            auth_token: String::new(),
            body: Request::Query { name: "x".repeat((MAX_FRAME_BYTES + 1) as usize), args: serde_json::json!({}) },
        };
        let result = write_frame(&mut client, &huge).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge)));
    }
}
