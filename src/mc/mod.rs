//! Minecraft Java Edition wire codec.
//!
//! Packets on the wire are `VarInt(length) || VarInt(packetID) || payload`.
//! This module provides the framing layer: VarInt encoding, bounded packet
//! reads with an I/O deadline, and the raw [`Packet`] type. The concrete
//! packet shapes live in [`packets`].

pub mod packets;

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Upper bound on a single inbound frame. A handshake plus login start fits
/// in well under this; anything larger is refused before allocation.
pub const MAX_PACKET_SIZE: usize = 32 * 1024;

/// A VarInt encoding a 32-bit value never exceeds five bytes.
const MAX_VARINT_BYTES: usize = 5;

/// Wire protocol errors. All of these degrade to a silent socket close at
/// the frontend; none carry client-controlled text into logs.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("varint exceeds {MAX_VARINT_BYTES} bytes")]
    VarIntTooLarge,

    #[error("packet length {0} outside accepted bounds")]
    InvalidPacketLength(i32),

    #[error("unexpected packet id {actual:#04x}, wanted {expected:#04x}")]
    UnexpectedPacketId { expected: i32, actual: i32 },

    #[error("truncated packet payload")]
    Truncated,

    #[error("malformed string payload")]
    MalformedString,

    #[error("io deadline expired")]
    Deadline,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A decoded frame: packet id plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub id: i32,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(id: i32, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    /// Encode the full frame: length prefix, id, payload.
    pub fn marshal(&self) -> Vec<u8> {
        let mut id_buf = Vec::with_capacity(MAX_VARINT_BYTES);
        write_varint(&mut id_buf, self.id);

        let mut frame = Vec::with_capacity(MAX_VARINT_BYTES + id_buf.len() + self.data.len());
        write_varint(&mut frame, (id_buf.len() + self.data.len()) as i32);
        frame.extend_from_slice(&id_buf);
        frame.extend_from_slice(&self.data);
        frame
    }

    /// Decode one frame from a byte slice. Used by tests and by the inbound
    /// PROXY-header path where bytes are already buffered.
    pub fn unmarshal(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = PacketReader::new(buf);
        let len = r.read_varint()?;
        if len < 1 || len as usize > MAX_PACKET_SIZE {
            return Err(ProtocolError::InvalidPacketLength(len));
        }
        let body = r.take(len as usize)?;
        let mut br = PacketReader::new(body);
        let id = br.read_varint()?;
        Ok(Packet::new(id, br.rest().to_vec()))
    }
}

/// Append a VarInt (little-endian 7-bit groups) to `buf`.
pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if v == 0 {
            break;
        }
    }
}

/// Append a length-prefixed UTF-8 string to `buf`.
pub fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_varint(buf, value.len() as i32);
    buf.extend_from_slice(value.as_bytes());
}

/// Cursor over a packet payload.
pub(crate) struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        let b = *self.buf.get(self.pos).ok_or(ProtocolError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    pub fn read_varint(&mut self) -> Result<i32, ProtocolError> {
        let mut result: u32 = 0;
        for i in 0..MAX_VARINT_BYTES {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7f) as u32) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result as i32);
            }
        }
        Err(ProtocolError::VarIntTooLarge)
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_varint()?;
        if len < 0 {
            return Err(ProtocolError::MalformedString);
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::MalformedString)
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() - self.pos < n {
            return Err(ProtocolError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// A stream wrapped with the packet codec and a per-operation I/O deadline.
///
/// Generic over the stream so tests can drive it with in-memory duplex
/// pipes; production use is `McConn<TcpStream>`.
pub struct McConn<S> {
    stream: S,
    deadline: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> McConn<S> {
    pub fn new(stream: S, deadline: Duration) -> Self {
        Self { stream, deadline }
    }

    /// Read one frame, bounded by the deadline and [`MAX_PACKET_SIZE`].
    pub async fn read_packet(&mut self) -> Result<Packet, ProtocolError> {
        timeout(self.deadline, Self::read_packet_inner(&mut self.stream))
            .await
            .map_err(|_| ProtocolError::Deadline)?
    }

    async fn read_packet_inner(stream: &mut S) -> Result<Packet, ProtocolError> {
        let len = read_varint_async(stream).await?;
        if len < 1 || len as usize > MAX_PACKET_SIZE {
            return Err(ProtocolError::InvalidPacketLength(len));
        }
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await?;

        let mut r = PacketReader::new(&body);
        let id = r.read_varint()?;
        Ok(Packet::new(id, r.rest().to_vec()))
    }

    /// Write one frame, bounded by the deadline.
    pub async fn write_packet(&mut self, pk: &Packet) -> Result<(), ProtocolError> {
        let frame = pk.marshal();
        timeout(self.deadline, async {
            self.stream.write_all(&frame).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| ProtocolError::Deadline)?
        .map_err(ProtocolError::Io)
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

async fn read_varint_async<S: AsyncRead + Unpin>(stream: &mut S) -> Result<i32, ProtocolError> {
    let mut result: u32 = 0;
    for i in 0..MAX_VARINT_BYTES {
        let byte = stream.read_u8().await?;
        result |= ((byte & 0x7f) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(result as i32);
        }
    }
    Err(ProtocolError::VarIntTooLarge)
}
