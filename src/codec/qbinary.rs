//! Versioned Binary Codec
//!
//! A record is serialized as a list of up to 255 byte-array chunks, one per
//! schema version. A writer emits chunk 1 with the fields known at the first
//! schema, chunk 2 appending the fields added later, and so on. A reader
//! decodes every chunk it knows and ignores the rest, so old readers accept
//! new writers and new readers accept old writers. Removing a field from a
//! published chunk is forbidden.
//!
//! All numerics are big-endian. Strings are UTF-8 byte arrays, byte arrays
//! are `[u32 length][bytes]`, sequences are `[u32 count][items]` and an
//! optional nested record is `[bool empty][record]`.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use uuid::Uuid;

/// Maximum number of versioned chunks a record may carry.
pub const MAX_RECORD_VERSIONS: usize = 255;

/// The chunk list a record serializes to, one byte array per schema version.
pub type RawVector = Vec<Vec<u8>>;

/// Versioned binary serialization of a record.
///
/// `to_raw` returns one chunk per schema version; `from_raw` decodes every
/// chunk it knows, leaving fields of unknown versions default-initialized.
pub trait QBinary {
    fn to_raw(&self) -> Result<RawVector>;
    fn from_raw(&mut self, raw: &RawVector) -> Result<()>;
}

/// Binary chunk writer with the codec's field encodings.
#[derive(Default)]
pub struct BWriter {
    buf: Vec<u8>,
}

impl BWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.write_u16::<BigEndian>(v).expect("vec write");
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.write_i32::<BigEndian>(v).expect("vec write");
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.write_u32::<BigEndian>(v).expect("vec write");
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.write_i64::<BigEndian>(v).expect("vec write");
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.write_u64::<BigEndian>(v).expect("vec write");
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.write_f64::<BigEndian>(v).expect("vec write");
    }

    /// UUIDs travel as their 16 raw bytes in RFC 4122 order.
    pub fn write_uuid(&mut self, v: &Uuid) {
        self.buf.extend_from_slice(v.as_bytes());
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.write_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    /// Strings travel as explicit UTF-8 byte arrays.
    pub fn write_str(&mut self, v: &str) {
        self.write_bytes(v.as_bytes());
    }

    /// Header of a `[u32 count][items]` sequence.
    pub fn write_seq_len(&mut self, len: usize) {
        self.write_u32(len as u32);
    }
}

/// Binary chunk reader mirroring [`BWriter`].
pub struct BReader<'a> {
    cur: Cursor<&'a [u8]>,
}

impl<'a> BReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { cur: Cursor::new(data) }
    }

    pub fn at_end(&self) -> bool {
        self.cur.position() >= self.cur.get_ref().len() as u64
    }

    fn eof(what: &str) -> Error {
        Error::serialize(format!("Unexpected end of chunk while reading {what}"))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.cur.read_u8().map_err(|_| Self::eof("bool"))? != 0)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.cur.read_u8().map_err(|_| Self::eof("u8"))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.cur.read_u16::<BigEndian>().map_err(|_| Self::eof("u16"))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.cur.read_i32::<BigEndian>().map_err(|_| Self::eof("i32"))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.cur.read_u32::<BigEndian>().map_err(|_| Self::eof("u32"))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.cur.read_i64::<BigEndian>().map_err(|_| Self::eof("i64"))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.cur.read_u64::<BigEndian>().map_err(|_| Self::eof("u64"))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.cur.read_f64::<BigEndian>().map_err(|_| Self::eof("f64"))
    }

    pub fn read_uuid(&mut self) -> Result<Uuid> {
        let mut bytes = [0u8; 16];
        std::io::Read::read_exact(&mut self.cur, &mut bytes).map_err(|_| Self::eof("uuid"))?;
        Ok(Uuid::from_bytes(bytes))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        let remaining = self.cur.get_ref().len() as u64 - self.cur.position();
        if len as u64 > remaining {
            return Err(Error::serialize(format!(
                "Byte array length {len} exceeds remaining chunk size {remaining}"
            )));
        }
        let mut bytes = vec![0u8; len];
        std::io::Read::read_exact(&mut self.cur, &mut bytes).map_err(|_| Self::eof("bytes"))?;
        Ok(bytes)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| Error::serialize(format!("Invalid UTF-8 string: {e}")))
    }

    pub fn read_seq_len(&mut self) -> Result<usize> {
        Ok(self.read_u32()? as usize)
    }
}

/// Serializes a record into its on-wire form: `[u8 version count]` followed
/// by one length-prefixed byte array per version chunk.
pub fn encode_record<T: QBinary + ?Sized>(record: &T) -> Result<Vec<u8>> {
    let raw = record.to_raw()?;
    let mut w = BWriter::new();
    write_raw(&mut w, &raw)?;
    Ok(w.into_inner())
}

/// Decodes a record from its on-wire form.
pub fn decode_record<T: QBinary + Default>(data: &[u8]) -> Result<T> {
    let mut r = BReader::new(data);
    let mut record = T::default();
    read_raw_into(&mut r, &mut record)?;
    Ok(record)
}

/// Writes a record embedded in an enclosing chunk.
pub fn write_record<T: QBinary + ?Sized>(w: &mut BWriter, record: &T) -> Result<()> {
    write_raw(w, &record.to_raw()?)
}

/// Reads a record embedded in an enclosing chunk.
pub fn read_record<T: QBinary + Default>(r: &mut BReader<'_>) -> Result<T> {
    let mut record = T::default();
    read_raw_into(r, &mut record)?;
    Ok(record)
}

/// Writes an optional record as `[bool empty][record]`.
pub fn write_opt_record<T: QBinary>(w: &mut BWriter, record: Option<&T>) -> Result<()> {
    w.write_bool(record.is_none());
    if let Some(record) = record {
        write_record(w, record)?;
    }
    Ok(())
}

/// Reads an optional record written by [`write_opt_record`].
pub fn read_opt_record<T: QBinary + Default>(r: &mut BReader<'_>) -> Result<Option<T>> {
    if r.read_bool()? {
        return Ok(None);
    }
    Ok(Some(read_record(r)?))
}

fn write_raw(w: &mut BWriter, raw: &RawVector) -> Result<()> {
    if raw.len() > MAX_RECORD_VERSIONS {
        return Err(Error::serialize(format!(
            "The limit of record versions is exceeded: {}/{MAX_RECORD_VERSIONS}",
            raw.len()
        )));
    }
    w.write_u8(raw.len() as u8);
    for chunk in raw {
        w.write_bytes(chunk);
    }
    Ok(())
}

fn read_raw_into<T: QBinary + ?Sized>(r: &mut BReader<'_>, record: &mut T) -> Result<()> {
    let count = r.read_u8()? as usize;
    let mut raw = RawVector::with_capacity(count);
    for _ in 0..count {
        raw.push(r.read_bytes()?);
    }
    record.from_raw(&raw)
}
