//! Link framing: a big-endian `u32` length prefix followed by a bincode
//! encoded [`LinkFrame`].

use bytes::{BufMut, BytesMut};
use murmur_shared::constants::MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFrame {
    /// Opaque payload; the receiver answers with `Ack { id }`.
    Data { id: u64, payload: Vec<u8> },
    Ack { id: u64 },
    Ping,
    Pong,
}

/// Read one frame. Returns `Ok(None)` when the peer closed the link.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<LinkFrame>, NetError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    bincode::deserialize(&body)
        .map(Some)
        .map_err(|e| NetError::Codec(e.to_string()))
}

/// Write one frame and flush it.
///
/// Oversized frames are rejected before anything is written, so the link
/// stays usable.
pub async fn write_frame<W>(writer: &mut W, frame: &LinkFrame) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(frame).map_err(|e| NetError::Codec(e.to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge(body.len()));
    }

    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
