//! Record framing and the string intern table.
//!
//! Every persisted object is one record: `[size:u64][type:i32]` followed by
//! `size` bytes of body, of which the first word is `[version:i32]`. Readers
//! parse the body out of a bounded slice, so a form whose reader walks past
//! its framed size surfaces as an error instead of consuming the next
//! record.
//!
//! Token sequences inside records are written as ids into a single string
//! intern table, itself persisted as the first record of the form stream
//! under the `STRH` tag.

use crate::buffer::{ByteReader, ByteWriter};
use crate::{CodecError, Result};
use std::collections::HashMap;
use std::io::{Read, Write};

/// Type tag of the string intern table record.
pub const TYPE_STRING_TABLE: i32 = i32::from_be_bytes(*b"STRH");

/// Current version of the string table record.
pub const STRING_TABLE_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Body size in bytes, version word included.
    pub size: u64,
    pub type_tag: i32,
}

/// A fully-read record body, parsed out of its bounded byte range.
pub struct RecordBody {
    pub type_tag: i32,
    pub version: i32,
    payload: Vec<u8>,
}

impl RecordBody {
    /// Reader over the payload that follows the version word.
    pub fn reader(&self) -> ByteReader<&[u8]> {
        ByteReader::new(self.payload.as_slice())
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Serializes one record: the body closure writes the payload that follows
/// the version word.
pub fn write_record<W, F>(
    out: &mut ByteWriter<W>,
    type_tag: i32,
    version: i32,
    body: F,
) -> Result<()>
where
    W: Write,
    F: FnOnce(&mut ByteWriter<Vec<u8>>) -> Result<()>,
{
    let mut payload = ByteWriter::new(Vec::new());
    body(&mut payload)?;
    let payload = payload.into_inner();

    out.write_u64(payload.len() as u64 + 4)?;
    out.write_i32(type_tag)?;
    out.write_i32(version)?;
    out.write_bytes(&payload)?;
    Ok(())
}

pub fn read_record_header<R: Read>(input: &mut ByteReader<R>) -> Result<RecordHeader> {
    let size = input.read_u64()?;
    let type_tag = input.read_i32()?;
    Ok(RecordHeader { size, type_tag })
}

/// Reads one record body. The bytes are consumed from the stream in full
/// even if the caller later fails to parse them, keeping the stream aligned
/// on record boundaries.
pub fn read_record<R: Read>(input: &mut ByteReader<R>) -> Result<RecordBody> {
    let header = read_record_header(input)?;
    if header.size < 4 {
        return Err(CodecError::RecordOverrun {
            type_tag: header.type_tag,
            size: header.size,
        });
    }
    let body = input.read_bytes(header.size as usize)?;
    let mut reader = ByteReader::new(body.as_slice());
    let version = reader.read_i32()?;
    Ok(RecordBody {
        type_tag: header.type_tag,
        version,
        payload: body[4..].to_vec(),
    })
}

/// Process-wide token intern table for one save stream.
///
/// Ids are dense and start at 0; id assignment order is the interning order,
/// which makes two saves of the same quiescent state byte-identical.
#[derive(Debug, Default)]
pub struct StringTable {
    ids: HashMap<String, u64>,
    strings: Vec<String>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn intern(&mut self, token: &str) -> u64 {
        if let Some(id) = self.ids.get(token) {
            return *id;
        }
        let id = self.strings.len() as u64;
        self.strings.push(token.to_owned());
        self.ids.insert(token.to_owned(), id);
        id
    }

    pub fn resolve(&self, id: u64) -> Result<&str> {
        self.strings
            .get(id as usize)
            .map(String::as_str)
            .ok_or(CodecError::UnknownStringId(id))
    }

    /// Writes an interned token reference.
    pub fn write_token<W: Write>(&mut self, out: &mut ByteWriter<W>, token: &str) -> Result<()> {
        let id = self.intern(token);
        out.write_u64(id)
    }

    pub fn read_token<R: Read>(&self, input: &mut ByteReader<R>) -> Result<String> {
        let id = input.read_u64()?;
        Ok(self.resolve(id)?.to_owned())
    }

    /// Writes a `[count:u64]{id}` token sequence.
    pub fn write_sequence<W: Write>(
        &mut self,
        out: &mut ByteWriter<W>,
        tokens: &[String],
    ) -> Result<()> {
        out.write_u64(tokens.len() as u64)?;
        for token in tokens {
            self.write_token(out, token)?;
        }
        Ok(())
    }

    pub fn read_sequence<R: Read>(&self, input: &mut ByteReader<R>) -> Result<Vec<String>> {
        let count = input.read_u64()? as usize;
        let mut tokens = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            tokens.push(self.read_token(input)?);
        }
        Ok(tokens)
    }

    /// Emits the table as the `STRH` record.
    pub fn write_record<W: Write>(&self, out: &mut ByteWriter<W>) -> Result<()> {
        write_record(out, TYPE_STRING_TABLE, STRING_TABLE_VERSION, |body| {
            body.write_u64(self.strings.len() as u64)?;
            for (id, token) in self.strings.iter().enumerate() {
                body.write_u64(id as u64)?;
                body.write_string(token)?;
            }
            Ok(())
        })
    }

    /// Parses a previously-read `STRH` record body.
    pub fn from_record(body: &RecordBody) -> Result<Self> {
        if body.type_tag != TYPE_STRING_TABLE {
            return Err(CodecError::UnsupportedRecord(body.type_tag));
        }
        if body.version != STRING_TABLE_VERSION {
            return Err(CodecError::UnsupportedVersion {
                type_tag: body.type_tag,
                version: body.version,
            });
        }
        let mut reader = body.reader();
        let count = reader.read_u64()? as usize;
        let mut table = StringTable::new();
        for _ in 0..count {
            let id = reader.read_u64()?;
            let token = reader.read_string()?;
            if id != table.strings.len() as u64 {
                return Err(CodecError::UnknownStringId(id));
            }
            table.ids.insert(token.clone(), id);
            table.strings.push(token);
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let mut out = ByteWriter::new(Vec::new());
        write_record(&mut out, 0x1234, 2, |body| {
            body.write_u64(99)?;
            body.write_string("payload")?;
            Ok(())
        })
        .unwrap();
        let bytes = out.into_inner();

        let mut input = ByteReader::new(bytes.as_slice());
        let record = read_record(&mut input).unwrap();
        assert_eq!(record.type_tag, 0x1234);
        assert_eq!(record.version, 2);
        let mut r = record.reader();
        assert_eq!(r.read_u64().unwrap(), 99);
        assert_eq!(r.read_string().unwrap(), "payload");
    }

    #[test]
    fn record_reader_cannot_escape_frame() {
        let mut out = ByteWriter::new(Vec::new());
        write_record(&mut out, 7, 2, |body| body.write_u32(5)).unwrap();
        write_record(&mut out, 8, 2, |body| body.write_u32(6)).unwrap();
        let bytes = out.into_inner();

        let mut input = ByteReader::new(bytes.as_slice());
        let first = read_record(&mut input).unwrap();
        let mut r = first.reader();
        r.read_u32().unwrap();
        // Reading past the first record's payload fails instead of bleeding
        // into the second record.
        assert!(matches!(
            r.read_u32(),
            Err(CodecError::UnexpectedEof { .. })
        ));

        let second = read_record(&mut input).unwrap();
        assert_eq!(second.type_tag, 8);
    }

    #[test]
    fn string_table_round_trip() {
        let mut table = StringTable::new();
        let tokens: Vec<String> = ["alpha", "beta", "alpha", "gamma", "beta"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mut seq = ByteWriter::new(Vec::new());
        table.write_sequence(&mut seq, &tokens).unwrap();
        let seq_bytes = seq.into_inner();
        assert_eq!(table.len(), 3, "duplicates must share one entry");

        let mut out = ByteWriter::new(Vec::new());
        table.write_record(&mut out).unwrap();
        let table_bytes = out.into_inner();

        let mut input = ByteReader::new(table_bytes.as_slice());
        let record = read_record(&mut input).unwrap();
        let loaded = StringTable::from_record(&record).unwrap();

        let mut seq_in = ByteReader::new(seq_bytes.as_slice());
        let decoded = loaded.read_sequence(&mut seq_in).unwrap();
        assert_eq!(decoded, tokens);
    }

    #[test]
    fn string_table_rejects_wrong_version() {
        let mut out = ByteWriter::new(Vec::new());
        write_record(&mut out, TYPE_STRING_TABLE, 9, |body| body.write_u64(0)).unwrap();
        let bytes = out.into_inner();
        let mut input = ByteReader::new(bytes.as_slice());
        let record = read_record(&mut input).unwrap();
        assert!(matches!(
            StringTable::from_record(&record),
            Err(CodecError::UnsupportedVersion { version: 9, .. })
        ));
    }

    #[test]
    fn unknown_string_id_is_an_error() {
        let table = StringTable::new();
        assert!(matches!(
            table.resolve(3),
            Err(CodecError::UnknownStringId(3))
        ));
    }
}
