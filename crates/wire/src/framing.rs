//! Varint-delimited frames
//!
//! Wire format: `[len: unsigned varint][payload: len bytes]`, the framing
//! both bitswap and the Kademlia RPC use on their streams.

use std::io;

use futures::prelude::*;

/// Upper bound on a single frame. Bitswap caps its messages at 4 MiB;
/// DHT messages are far smaller.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Write one varint-delimited frame and flush.
pub async fn write_frame<T: AsyncWrite + Unpin>(io: &mut T, payload: &[u8]) -> io::Result<()> {
    let mut len_buf = unsigned_varint::encode::usize_buffer();
    io.write_all(unsigned_varint::encode::usize(payload.len(), &mut len_buf))
        .await?;
    io.write_all(payload).await?;
    io.flush().await
}

/// Read one varint-delimited frame.
///
/// Fails with `InvalidData` on oversized or malformed length prefixes and
/// with `UnexpectedEof` if the stream closes mid-frame.
pub async fn read_frame<T: AsyncRead + Unpin>(io: &mut T) -> io::Result<Vec<u8>> {
    let len = read_varint(io).await?;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds {} byte limit", len, MAX_FRAME_SIZE),
        ));
    }
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn read_varint<T: AsyncRead + Unpin>(io: &mut T) -> io::Result<usize> {
    // 10 bytes is enough for any 64-bit varint.
    let mut buf = [0u8; 10];
    for i in 0..buf.len() {
        io.read_exact(&mut buf[i..i + 1]).await?;
        if buf[i] & 0x80 == 0 {
            return unsigned_varint::decode::usize(&buf[..=i])
                .map(|(len, _)| len)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "varint length prefix too long",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::io::Cursor;

    #[test]
    fn test_frame_roundtrip() {
        block_on(async {
            let mut buf = Cursor::new(Vec::new());
            write_frame(&mut buf, b"hello frame").await.unwrap();
            buf.set_position(0);
            let payload = read_frame(&mut buf).await.unwrap();
            assert_eq!(payload, b"hello frame");
        });
    }

    #[test]
    fn test_empty_frame() {
        block_on(async {
            let mut buf = Cursor::new(Vec::new());
            write_frame(&mut buf, b"").await.unwrap();
            buf.set_position(0);
            assert!(read_frame(&mut buf).await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_oversized_frame_rejected() {
        block_on(async {
            let mut prefix = unsigned_varint::encode::usize_buffer();
            let bytes = unsigned_varint::encode::usize(MAX_FRAME_SIZE + 1, &mut prefix).to_vec();
            let mut buf = Cursor::new(bytes);
            let err = read_frame(&mut buf).await.unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        });
    }

    #[test]
    fn test_truncated_frame() {
        block_on(async {
            let mut full = Cursor::new(Vec::new());
            write_frame(&mut full, &[0xaa; 64]).await.unwrap();
            let bytes = full.into_inner();
            let mut truncated = Cursor::new(bytes[..bytes.len() - 10].to_vec());
            let err = read_frame(&mut truncated).await.unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        });
    }
}
