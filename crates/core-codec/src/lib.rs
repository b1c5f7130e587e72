//! Binary save-stream codec.
//!
//! Everything a save file is made of passes through here: fixed-width
//! primitive reads and writes (`buffer`), the length-prefixed record framing
//! with its string intern table (`record`), and the optional LZMA layer that
//! wraps the byte stream after the plain-text header (`lzma`).
//!
//! Layering contract: the file header up to and including the compression
//! settings is always uncompressed; every byte after it goes through
//! [`lzma::StreamWriter`] / [`lzma::StreamReader`], which degrade to a plain
//! pass-through when the configured level is -1. Records never straddle the
//! boundary.

pub mod buffer;
pub mod lzma;
pub mod record;

pub use buffer::{ByteReader, ByteWriter};
pub use lzma::{CompressionSettings, StreamReader, StreamWriter};
pub use record::{RecordHeader, StringTable, TYPE_STRING_TABLE};

use thiserror::Error;

/// Errors produced while encoding or decoding the save stream.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o failure in save stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected end of stream: wanted {wanted} bytes at offset {offset}")]
    UnexpectedEof { wanted: usize, offset: u64 },
    #[error("string payload is not valid utf-8 at offset {offset}")]
    InvalidUtf8 { offset: u64 },
    #[error("record type {type_tag:#x} read past its framed size ({size} bytes)")]
    RecordOverrun { type_tag: i32, size: u64 },
    #[error("unknown record type {0:#x}")]
    UnsupportedRecord(i32),
    #[error("record version {version} of type {type_tag:#x} is not supported")]
    UnsupportedVersion { type_tag: i32, version: i32 },
    #[error("string table has no entry for id {0}")]
    UnknownStringId(u64),
    #[error("lzma stream error: {0}")]
    Lzma(String),
}

impl From<xz2::stream::Error> for CodecError {
    fn from(err: xz2::stream::Error) -> Self {
        CodecError::Lzma(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
