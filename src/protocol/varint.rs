use bytes::{Buf, BufMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

const SEGMENT_BITS: u32 = 0x7F;
const CONTINUE_BIT: u32 = 0x80;

/// A varint never spans more than five bytes.
pub const MAX_VARINT_LEN: usize = 5;

/// Appends a Minecraft varint to the buffer.
pub fn put_varint(buf: &mut impl BufMut, value: i32) {
    let mut remaining = value as u32;
    loop {
        if remaining & !SEGMENT_BITS == 0 {
            buf.put_u8(remaining as u8);
            return;
        }
        buf.put_u8(((remaining & SEGMENT_BITS) | CONTINUE_BIT) as u8);
        remaining >>= 7;
    }
}

/// Reads a varint from an in-memory buffer.
pub fn get_varint(buf: &mut impl Buf) -> io::Result<i32> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated varint",
            ));
        }
        let byte = buf.get_u8() as u32;
        value |= (byte & SEGMENT_BITS) << (7 * i as u32);
        if byte & CONTINUE_BIT == 0 {
            return Ok(value as i32);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "varint exceeds five bytes",
    ))
}

/// Reads a varint from an async stream, one byte at a time.
pub async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<i32> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = reader.read_u8().await? as u32;
        value |= (byte & SEGMENT_BITS) << (7 * i as u32);
        if byte & CONTINUE_BIT == 0 {
            return Ok(value as i32);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "varint exceeds five bytes",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode(value: i32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, value);
        buf.to_vec()
    }

    #[test]
    fn known_encodings() {
        assert_eq!(encode(0), vec![0x00]);
        assert_eq!(encode(1), vec![0x01]);
        assert_eq!(encode(127), vec![0x7f]);
        assert_eq!(encode(128), vec![0x80, 0x01]);
        assert_eq!(encode(255), vec![0xff, 0x01]);
        assert_eq!(encode(25565), vec![0xdd, 0xc7, 0x01]);
        assert_eq!(encode(-1), vec![0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    #[test]
    fn round_trip() {
        for value in [0, 1, 2, 127, 128, 300, 25565, 763, i32::MAX, -1, i32::MIN] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            assert_eq!(get_varint(&mut buf).unwrap(), value);
            assert!(!buf.has_remaining());
        }
    }

    #[test]
    fn truncated_input_is_an_error() {
        let mut buf = &[0x80u8][..];
        let err = get_varint(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn overlong_input_is_an_error() {
        let mut buf = &[0xff, 0xff, 0xff, 0xff, 0xff, 0x01][..];
        let err = get_varint(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn async_read_matches_sync() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 1_234_567);
        let mut reader = &buf[..];
        assert_eq!(read_varint(&mut reader).await.unwrap(), 1_234_567);
    }
}
