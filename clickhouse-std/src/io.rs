use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::constants::READ_CHUNK_SIZE;
use crate::native::protocol::MAX_STRING_SIZE;
use crate::{Error, Result};

/// An extension trait on [`bytes::Buf`] providing `ClickHouse` specific, non-panicking reads.
///
/// Every method reports [`Error::UnexpectedEof`] when the buffer runs dry, which callers
/// reading off a socket treat as "read more and try again".
pub(crate) trait ClickHouseBytesRead: Buf {
    fn ensure(&self, len: usize) -> Result<()> {
        if self.remaining() < len { Err(Error::UnexpectedEof) } else { Ok(()) }
    }

    fn try_get_var_uint(&mut self) -> Result<u64>;

    fn try_get_var_int(&mut self) -> Result<i64> {
        let raw = self.try_get_var_uint()?;
        #[expect(clippy::cast_possible_wrap)]
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    fn try_get_string(&mut self) -> Result<Bytes>;

    fn try_get_utf8_string(&mut self) -> Result<String> {
        Ok(String::from_utf8(self.try_get_string()?.to_vec())?)
    }

    fn try_get_bytes(&mut self, len: usize) -> Result<Bytes> {
        self.ensure(len)?;
        Ok(self.copy_to_bytes(len))
    }

    fn try_read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.get_u8())
    }

    fn try_read_i32_le(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.get_i32_le())
    }

    fn try_read_i64_le(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.get_i64_le())
    }

    fn try_read_u64_le(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.get_u64_le())
    }

    fn try_read_f64_le(&mut self) -> Result<f64> {
        self.ensure(8)?;
        Ok(self.get_f64_le())
    }
}

impl<T: Buf + ?Sized> ClickHouseBytesRead for T {
    #[inline]
    fn try_get_var_uint(&mut self) -> Result<u64> {
        // Unrolled for speed
        self.ensure(1)?;
        let b = self.get_u8();
        let mut out = u64::from(b & 0x7F);
        if (b & 0x80) == 0 {
            return Ok(out);
        }

        for i in 1..10 {
            self.ensure(1)?;
            let b = self.get_u8();
            out |= u64::from(b & 0x7F) << (7 * i);
            if (b & 0x80) == 0 {
                return Ok(out);
            }
        }

        Ok(out)
    }

    #[inline]
    fn try_get_string(&mut self) -> Result<Bytes> {
        #[expect(clippy::cast_possible_truncation)]
        let len = self.try_get_var_uint()? as usize;

        if len > MAX_STRING_SIZE {
            return Err(Error::Protocol(format!("string too large: {len}")));
        }

        if len == 0 {
            return Ok(Bytes::new());
        }

        self.try_get_bytes(len)
    }
}

/// An extension trait on [`bytes::BufMut`] providing `ClickHouse` specific writes.
pub(crate) trait ClickHouseBytesWrite: BufMut {
    fn put_var_uint(&mut self, value: u64);

    fn put_var_int(&mut self, value: i64) {
        #[expect(clippy::cast_sign_loss)]
        self.put_var_uint(((value << 1) ^ (value >> 63)) as u64);
    }

    fn put_string<V: AsRef<[u8]>>(&mut self, value: V);
}

impl<T: BufMut + ?Sized> ClickHouseBytesWrite for T {
    fn put_var_uint(&mut self, mut value: u64) {
        let mut buf = [0u8; 10]; // Max 10 bytes for u64
        let mut pos = 0;

        #[expect(clippy::cast_possible_truncation)]
        while pos < 10 {
            let mut byte = value & 0x7F;
            value >>= 7;
            if value > 0 {
                byte |= 0x80;
            }
            buf[pos] = byte as u8;
            pos += 1;
            if value == 0 {
                break;
            }
        }

        self.put_slice(&buf[..pos]);
    }

    fn put_string<V: AsRef<[u8]>>(&mut self, value: V) {
        let value = value.as_ref();
        // Write length as varint
        self.put_var_uint(value.len() as u64);
        self.put_slice(value);
    }
}

/// Reads one frame off `reader`, growing `buffer` until `decode` stops reporting
/// [`Error::UnexpectedEof`].
///
/// `decode` always sees the frame from its first byte; bytes are only consumed from `buffer` once
/// a frame decodes completely.
pub(crate) async fn read_frame<R, T, F>(
    reader: &mut R,
    buffer: &mut BytesMut,
    mut decode: F,
) -> Result<T>
where
    R: AsyncRead + Unpin + ?Sized,
    F: FnMut(&mut &[u8]) -> Result<T>,
{
    loop {
        if !buffer.is_empty() {
            let mut view = &buffer[..];
            match decode(&mut view) {
                Ok(frame) => {
                    let consumed = buffer.len() - view.len();
                    buffer.advance(consumed);
                    return Ok(frame);
                }
                Err(Error::UnexpectedEof) => {}
                Err(error) => return Err(error),
            }
        }

        buffer.reserve(READ_CHUNK_SIZE);
        if reader.read_buf(buffer).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}
