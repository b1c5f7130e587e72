//! LZMA stream adapter.
//!
//! Wraps the save stream in an xz encoder/decoder once the plain-text header
//! has been written. Level -1 bypasses compression entirely; levels 0..=9
//! map to liblzma presets, optionally with the "extreme" preset bit. The
//! decoder streams through a fixed 2 MiB buffer so load never materializes
//! the whole decompressed image.

use crate::Result;
use std::io::{BufReader, Read, Write};
use xz2::read::XzDecoder;
use xz2::stream::{Check, MtStreamBuilder, Stream};
use xz2::write::XzEncoder;

/// Decoder-side read buffer.
const DECODE_BUFFER_BYTES: usize = 2 * 1024 * 1024;

/// liblzma extreme preset flag.
const PRESET_EXTREME: u32 = 1 << 31;

/// Compression settings persisted in the save-file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionSettings {
    /// -1 disables the adapter; 0..=9 are xz presets.
    pub level: i32,
    pub extreme: bool,
    /// Worker threads for the encoder; <= 1 selects the single-threaded
    /// stream encoder.
    pub threads: u32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            level: 6,
            extreme: false,
            threads: 1,
        }
    }
}

impl CompressionSettings {
    pub fn disabled() -> Self {
        Self {
            level: -1,
            extreme: false,
            threads: 1,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.level >= 0
    }

    fn preset(&self) -> u32 {
        let base = self.level.clamp(0, 9) as u32;
        if self.extreme { base | PRESET_EXTREME } else { base }
    }
}

/// Write side of the adapter: either a transparent pass-through or an xz
/// encoder. `finish` must be called to flush the encoder trailer.
pub enum StreamWriter<W: Write> {
    Plain(W),
    Compressed(XzEncoder<W>),
}

impl<W: Write> StreamWriter<W> {
    pub fn new(inner: W, settings: CompressionSettings) -> Result<Self> {
        if !settings.is_enabled() {
            return Ok(StreamWriter::Plain(inner));
        }
        let stream = if settings.threads > 1 {
            MtStreamBuilder::new()
                .preset(settings.preset())
                .threads(settings.threads)
                .check(Check::Crc64)
                .encoder()?
        } else {
            Stream::new_easy_encoder(settings.preset(), Check::Crc64)?
        };
        Ok(StreamWriter::Compressed(XzEncoder::new_stream(
            inner, stream,
        )))
    }

    /// Flushes and returns the underlying sink.
    pub fn finish(self) -> Result<W> {
        match self {
            StreamWriter::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            StreamWriter::Compressed(enc) => Ok(enc.finish()?),
        }
    }
}

impl<W: Write> Write for StreamWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            StreamWriter::Plain(w) => w.write(buf),
            StreamWriter::Compressed(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            StreamWriter::Plain(w) => w.flush(),
            StreamWriter::Compressed(w) => w.flush(),
        }
    }
}

/// Read side of the adapter. Always buffered; the xz path additionally runs
/// the decoder with the default stream memory limit disabled.
pub enum StreamReader<R: Read> {
    Plain(BufReader<R>),
    Compressed(BufReader<XzDecoder<R>>),
}

impl<R: Read> StreamReader<R> {
    pub fn new(inner: R, settings: CompressionSettings) -> Result<Self> {
        if !settings.is_enabled() {
            return Ok(StreamReader::Plain(BufReader::with_capacity(
                DECODE_BUFFER_BYTES,
                inner,
            )));
        }
        let stream = Stream::new_stream_decoder(u64::MAX, 0)?;
        Ok(StreamReader::Compressed(BufReader::with_capacity(
            DECODE_BUFFER_BYTES,
            XzDecoder::new_stream(inner, stream),
        )))
    }
}

impl<R: Read> Read for StreamReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            StreamReader::Plain(r) => r.read(buf),
            StreamReader::Compressed(r) => r.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn round_trip(settings: CompressionSettings, payload: &[u8]) -> Vec<u8> {
        let mut writer = StreamWriter::new(Vec::new(), settings).unwrap();
        writer.write_all(payload).unwrap();
        let encoded = writer.finish().unwrap();

        let mut reader = StreamReader::new(encoded.as_slice(), settings).unwrap();
        let mut decoded = Vec::new();
        reader.read_to_end(&mut decoded).unwrap();
        decoded
    }

    #[test]
    fn bypass_level_is_identity() {
        let payload = b"abc def ghi".repeat(100);
        let mut writer = StreamWriter::new(Vec::new(), CompressionSettings::disabled()).unwrap();
        writer.write_all(&payload).unwrap();
        let encoded = writer.finish().unwrap();
        assert_eq!(encoded, payload, "level -1 must not transform the stream");
    }

    #[test]
    fn compressed_round_trip() {
        let payload = b"token token token token ".repeat(500);
        let settings = CompressionSettings {
            level: 6,
            extreme: false,
            threads: 1,
        };
        assert_eq!(round_trip(settings, &payload), payload);
    }

    #[test]
    fn extreme_round_trip() {
        let payload = b"the quick brown fox ".repeat(200);
        let settings = CompressionSettings {
            level: 3,
            extreme: true,
            threads: 1,
        };
        assert_eq!(round_trip(settings, &payload), payload);
    }

    #[test]
    fn multithreaded_encoder_is_readable_by_streaming_decoder() {
        let payload = b"0123456789".repeat(10_000);
        let settings = CompressionSettings {
            level: 4,
            extreme: false,
            threads: 2,
        };
        assert_eq!(round_trip(settings, &payload), payload);
    }

    #[test]
    fn compression_shrinks_repetitive_payload() {
        let payload = b"aaaaaaaaaaaaaaaa".repeat(4096);
        let settings = CompressionSettings {
            level: 6,
            extreme: false,
            threads: 1,
        };
        let mut writer = StreamWriter::new(Vec::new(), settings).unwrap();
        writer.write_all(&payload).unwrap();
        let encoded = writer.finish().unwrap();
        assert!(encoded.len() < payload.len() / 10);
    }
}
