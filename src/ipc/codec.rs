// Length-prefixed JSON framing.
//
// Every message is a 4-byte big-endian length followed by that many bytes of
// JSON. One frame is one request or one response.

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{IpcError, IpcResult};
use crate::config::DEFAULT_MAX_FRAME_BYTES;

const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> IpcResult<BytesMut> {
        let body = serde_json::to_vec(value)
            .map_err(|e| IpcError::Protocol(format!("Failed to encode message: {}", e)))?;
        if body.len() > self.max_frame_bytes {
            return Err(IpcError::Protocol(format!(
                "Outgoing frame of {} bytes exceeds limit of {}",
                body.len(),
                self.max_frame_bytes
            )));
        }

        let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);
        Ok(frame)
    }

    pub fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> IpcResult<T> {
        serde_json::from_slice(body)
            .map_err(|e| IpcError::Protocol(format!("Malformed message: {}", e)))
    }

    pub async fn write<W, T>(&self, writer: &mut W, value: &T) -> IpcResult<()>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let frame = self.encode(value)?;
        writer.write_all(&frame).await.map_err(map_write_error)?;
        writer.flush().await.map_err(map_write_error)?;
        Ok(())
    }

    /// Read one frame. A clean end of stream before the header is `Closed`;
    /// an end of stream inside a frame is a protocol error.
    pub async fn read<R, T>(&self, reader: &mut R) -> IpcResult<T>
    where
        R: AsyncRead + Unpin,
        T: DeserializeOwned,
    {
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(IpcError::Closed),
            Err(e) => return Err(map_read_error(e)),
        };
        if len > self.max_frame_bytes {
            return Err(IpcError::Protocol(format!(
                "Incoming frame of {} bytes exceeds limit of {}",
                len, self.max_frame_bytes
            )));
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                IpcError::Protocol(format!("Truncated frame: expected {} bytes", len))
            } else {
                map_read_error(e)
            }
        })?;

        self.decode(&body)
    }
}

fn map_read_error(err: std::io::Error) -> IpcError {
    match err.kind() {
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            IpcError::Closed
        }
        _ => IpcError::Io(err),
    }
}

fn map_write_error(err: std::io::Error) -> IpcError {
    map_read_error(err)
}
