//! Fixed-width primitive reads and writes.
//!
//! All multi-byte values are little-endian. Strings are `[len:u64][utf-8]`.
//! Durations are a signed nanosecond count so negative sentinel values
//! survive a round trip. Both sides track a running offset so framing code
//! can detect reads past a record boundary.

use crate::{CodecError, Result};
use std::io::{Read, Write};
use std::time::Duration;

/// Primitive writer over any byte sink, tracking the number of bytes
/// emitted since construction.
pub struct ByteWriter<W: Write> {
    inner: W,
    offset: u64,
}

impl<W: Write> ByteWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, offset: 0 }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.put(&[v])
    }

    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(u8::from(v))
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    /// Signed nanosecond count. `None` is written as `i64::MIN`.
    pub fn write_duration(&mut self, v: Option<Duration>) -> Result<()> {
        let nanos = match v {
            Some(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
            None => i64::MIN,
        };
        self.write_i64(nanos)
    }

    pub fn write_string(&mut self, v: &str) -> Result<()> {
        self.write_u64(v.len() as u64)?;
        self.put(v.as_bytes())
    }

    pub fn write_bytes(&mut self, v: &[u8]) -> Result<()> {
        self.put(v)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

/// Primitive reader over any byte source, tracking consumed bytes.
pub struct ByteReader<R: Read> {
    inner: R,
    offset: u64,
}

impl<R: Read> ByteReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn take(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner
            .read_exact(buf)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => CodecError::UnexpectedEof {
                    wanted: buf.len(),
                    offset: self.offset,
                },
                _ => CodecError::Io(e),
            })?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.take(&mut b)?;
        Ok(b[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.take(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.take(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.take(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.take(&mut b)?;
        Ok(i64::from_le_bytes(b))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let mut b = [0u8; 8];
        self.take(&mut b)?;
        Ok(f64::from_le_bytes(b))
    }

    pub fn read_duration(&mut self) -> Result<Option<Duration>> {
        let nanos = self.read_i64()?;
        if nanos == i64::MIN {
            return Ok(None);
        }
        Ok(Some(Duration::from_nanos(nanos.max(0) as u64)))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u64()? as usize;
        let mut buf = vec![0u8; len];
        self.take(&mut buf)?;
        String::from_utf8(buf).map_err(|_| CodecError::InvalidUtf8 {
            offset: self.offset,
        })
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.take(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut w = ByteWriter::new(Vec::new());
        w.write_u8(0xAB).unwrap();
        w.write_bool(true).unwrap();
        w.write_i32(-7).unwrap();
        w.write_u64(u64::MAX - 1).unwrap();
        w.write_i64(i64::MIN + 1).unwrap();
        w.write_f64(3.5).unwrap();
        w.write_duration(Some(Duration::from_millis(1500))).unwrap();
        w.write_duration(None).unwrap();
        w.write_string("hello \u{2764}").unwrap();
        let bytes = w.into_inner();

        let mut r = ByteReader::new(bytes.as_slice());
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_i32().unwrap(), -7);
        assert_eq!(r.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(r.read_i64().unwrap(), i64::MIN + 1);
        assert_eq!(r.read_f64().unwrap(), 3.5);
        assert_eq!(
            r.read_duration().unwrap(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(r.read_duration().unwrap(), None);
        assert_eq!(r.read_string().unwrap(), "hello \u{2764}");
        assert_eq!(r.offset(), bytes.len() as u64);
    }

    #[test]
    fn short_read_reports_offset() {
        let mut w = ByteWriter::new(Vec::new());
        w.write_u32(42).unwrap();
        let bytes = w.into_inner();

        let mut r = ByteReader::new(bytes.as_slice());
        r.read_u32().unwrap();
        match r.read_u64() {
            Err(CodecError::UnexpectedEof { wanted: 8, offset: 4 }) => {}
            other => panic!("expected eof error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut w = ByteWriter::new(Vec::new());
        w.write_u64(2).unwrap();
        w.write_bytes(&[0xFF, 0xFE]).unwrap();
        let bytes = w.into_inner();

        let mut r = ByteReader::new(bytes.as_slice());
        assert!(matches!(
            r.read_string(),
            Err(CodecError::InvalidUtf8 { .. })
        ));
    }
}
