//! Framing: length-prefix (4 bytes BE) + bincode `DataPacket`.
//!
//! Oversized and undecodable frames are reported to the caller instead of
//! failing the read, so one bad frame never tears down a peer stream. Only an
//! I/O error (including a clean close) ends the read side.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::ProtocolError;
use crate::protocol::DataPacket;

const LEN_SIZE: usize = 4;

/// Outcome of reading one frame from a stream.
#[derive(Debug)]
pub enum FrameRead {
    /// A well-formed packet.
    Packet(DataPacket),
    /// Declared length exceeded the cap; that many bytes were skipped.
    Oversized(usize),
    /// The frame body did not decode into a known packet.
    Malformed(bincode::Error),
}

/// Encode a packet into a single frame: 4 bytes BE length + bincode payload.
pub fn encode_frame(packet: &DataPacket) -> Result<Vec<u8>, ProtocolError> {
    let payload = packet.to_bytes()?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Write an already encoded frame and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Read the next frame.
///
/// Oversized frames are drained without buffering them.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<FrameRead>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;

    if len > MAX_FRAME_SIZE {
        let skipped = tokio::io::copy(&mut (&mut *reader).take(len as u64), &mut tokio::io::sink()).await?;
        if skipped < len as u64 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        return Ok(FrameRead::Oversized(len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    Ok(match DataPacket::from_bytes(&buf) {
        Ok(packet) => FrameRead::Packet(packet),
        Err(e) => FrameRead::Malformed(e),
    })
}
