//! Length-exact reads off an async byte stream.
//!
//! The wire protocol is length-delimited: a header declares how many payload
//! bytes follow, and the reader must consume exactly that many, no matter how
//! the transport fragments them.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::FrameError;
use crate::protocol::{Header, HEADER_SIZE};

/// Read exactly `len` bytes, concatenating arrivals until satisfied.
///
/// Never consumes more than `len` bytes. Fails with
/// [`FrameError::UnexpectedEof`] if the stream ends early.
pub async fn read_exact_frame<R>(reader: &mut R, len: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(FrameError::UnexpectedEof {
                expected: len,
                read: filled,
            });
        }
        filled += n;
    }
    Ok(buf)
}

/// Read and decode one 12-byte header.
pub async fn read_header<R>(reader: &mut R) -> Result<Header, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let buf = read_exact_frame(reader, HEADER_SIZE).await?;
    Ok(Header::from_bytes(&buf)?)
}

/// Read the payload a header declares. The header's `length` is
/// authoritative and was already bounds-checked when it was decoded.
pub async fn read_payload<R>(reader: &mut R, header: &Header) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_exact_frame(reader, header.length as usize).await
}
