//! Frame and packet codec for the pre-login Minecraft protocol states.
//!
//! Frames are varint-length-prefixed; the payload starts with a varint packet
//! id. Only the uncompressed, unencrypted handshake/status/login-start subset
//! is implemented, which is all a routing proxy needs before splicing bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::varint;

/// Largest frame a well-behaved peer sends in the pre-login states.
pub const MAX_FRAME_LEN: usize = 2_097_151;

/// Longest string payload accepted (the status JSON with an embedded favicon).
pub const MAX_STRING_LEN: usize = 262_144;

/// Longest server address a handshake may carry.
pub const MAX_ADDRESS_LEN: usize = 255;

pub const HANDSHAKE_ID: i32 = 0x00;
pub const STATUS_REQUEST_ID: i32 = 0x00;
pub const STATUS_RESPONSE_ID: i32 = 0x00;
pub const STATUS_PING_ID: i32 = 0x01;
pub const LOGIN_START_ID: i32 = 0x00;
pub const LOGIN_DISCONNECT_ID: i32 = 0x00;

pub const STATUS_NEXT_STATE: i32 = 1;
pub const LOGIN_NEXT_STATE: i32 = 2;

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Appends a length-prefixed UTF-8 string.
pub fn put_string(buf: &mut BytesMut, value: &str) {
    varint::put_varint(buf, value.len() as i32);
    buf.put_slice(value.as_bytes());
}

/// Reads a length-prefixed UTF-8 string, bounded by `max_len` bytes.
pub fn get_string(buf: &mut Bytes, max_len: usize) -> io::Result<String> {
    let len = varint::get_varint(buf)?;
    if len < 0 || len as usize > max_len {
        return Err(invalid("string length out of bounds"));
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated string",
        ));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| invalid("string is not valid UTF-8"))
}

/// Reads one frame, returning the packet id and the remaining payload.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(i32, Bytes)> {
    let len = varint::read_varint(reader).await?;
    if len < 1 || len as usize > MAX_FRAME_LEN {
        return Err(invalid("frame length out of bounds"));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    let mut payload = Bytes::from(payload);
    let id = varint::get_varint(&mut payload)?;
    Ok((id, payload))
}

/// Encodes a complete frame: length prefix, packet id, body.
pub fn encode_frame(id: i32, body: &[u8]) -> BytesMut {
    let mut inner = BytesMut::with_capacity(varint::MAX_VARINT_LEN + body.len());
    varint::put_varint(&mut inner, id);
    inner.put_slice(body);
    let mut frame = BytesMut::with_capacity(varint::MAX_VARINT_LEN + inner.len());
    varint::put_varint(&mut frame, inner.len() as i32);
    frame.put_slice(&inner);
    frame
}

/// Writes and flushes one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    id: i32,
    body: &[u8],
) -> io::Result<()> {
    let frame = encode_frame(id, body);
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// The first frame a client sends, announcing protocol, virtual host and the
/// state it wants to enter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol: i32,
    pub server_address: String,
    pub port: u16,
    pub next_state: i32,
}

impl Handshake {
    pub fn decode(body: &mut Bytes) -> io::Result<Self> {
        let protocol = varint::get_varint(body)?;
        let server_address = get_string(body, MAX_ADDRESS_LEN)?;
        if body.remaining() < 2 {
            return Err(invalid("handshake missing port"));
        }
        let port = body.get_u16();
        let next_state = varint::get_varint(body)?;
        Ok(Self {
            protocol,
            server_address,
            port,
            next_state,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        varint::put_varint(&mut body, self.protocol);
        put_string(&mut body, &self.server_address);
        body.put_u16(self.port);
        varint::put_varint(&mut body, self.next_state);
        body
    }
}

/// A server's answer to a status request: the raw status JSON document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn decode(body: &mut Bytes) -> io::Result<Self> {
        let status = get_string(body, MAX_STRING_LEN)?;
        Ok(Self { status })
    }

    pub fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_string(&mut body, &self.status);
        body
    }
}

/// The first login-state frame, carrying the player name. Trailing fields
/// (UUID, signature data) vary by protocol version and are ignored here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    pub username: String,
}

impl LoginStart {
    pub fn decode(body: &mut Bytes) -> io::Result<Self> {
        let username = get_string(body, 16)?;
        Ok(Self { username })
    }
}

/// Encodes a login-state disconnect with a chat-component reason.
pub fn encode_login_disconnect(reason: &serde_json::Value) -> BytesMut {
    let mut body = BytesMut::new();
    put_string(&mut body, &reason.to_string());
    body
}

/// Reads the 64-bit payload of a status ping.
pub fn get_ping_payload(body: &mut Bytes) -> io::Result<i64> {
    if body.remaining() < 8 {
        return Err(invalid("ping payload too short"));
    }
    Ok(body.get_i64())
}

/// Encodes a status pong echoing the client's payload.
pub fn encode_ping_payload(payload: i64) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i64(payload);
    body
}
