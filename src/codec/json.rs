//! JSON Codec
//!
//! Mirrored serialization visitors over JSON documents: [`Writer`] streams a
//! record into a string buffer, [`Reader`] walks a parsed document with a
//! navigation stack. Both implement [`Packer`], so a record describes its
//! schema once:
//!
//! ```ignore
//! fn pack<P: Packer>(&mut self, p: &mut P) -> Result<()> {
//!     p.start_object();
//!     p.member("group").value_i32(&mut self.group);
//!     p.member("code").value_uuid(&mut self.code);
//!     p.member("description").value_string(&mut self.description);
//!     p.end_object();
//!     Ok(())
//! }
//! ```
//!
//! Reading rules: a missing mandatory member fails the reader and stops
//! further decoding; a missing optional member leaves the target
//! default-initialized; `null` is accepted for any type and produces the
//! type's default. UUIDs are canonical 36-character strings, dates are
//! `yyyy-MM-dd`, times are `hh:mm:ss.zzz` and timestamps are milliseconds
//! since the UNIX epoch. Byte arrays that already look like a JSON value are
//! embedded raw to avoid double encoding of pre-serialized content.

use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

/// One serialization pass over a record, either writing or reading.
///
/// Returned `&mut Self` from the navigation calls allows the
/// `p.member("name").value_*(..)` chaining the record schemas are written in.
pub trait Packer {
    fn is_reader(&self) -> bool;

    /// Selects a mandatory object member for the next value operation.
    fn member(&mut self, name: &str) -> &mut Self;

    /// Selects an optional object member for the next value operation.
    fn member_opt(&mut self, name: &str) -> &mut Self;

    fn start_object(&mut self) -> &mut Self;
    fn end_object(&mut self) -> &mut Self;

    /// Opens an array; on the read side `size` receives the element count,
    /// on the write side it is ignored.
    fn start_array(&mut self, size: &mut u32) -> &mut Self;
    fn end_array(&mut self) -> &mut Self;

    /// Writes an explicit `null` / skips the selected member.
    fn set_null(&mut self) -> &mut Self;

    fn value_bool(&mut self, v: &mut bool);
    fn value_i32(&mut self, v: &mut i32);
    fn value_u16(&mut self, v: &mut u16);
    fn value_u32(&mut self, v: &mut u32);
    fn value_i64(&mut self, v: &mut i64);
    fn value_u64(&mut self, v: &mut u64);
    fn value_f64(&mut self, v: &mut f64);
    fn value_string(&mut self, v: &mut String);
    fn value_uuid(&mut self, v: &mut Uuid);
    fn value_bytes(&mut self, v: &mut Vec<u8>);
    fn value_date(&mut self, v: &mut NaiveDate);
    fn value_time(&mut self, v: &mut NaiveTime);
    fn value_datetime(&mut self, v: &mut DateTime<Utc>);
    fn value_u64_seq(&mut self, v: &mut Vec<u64>);
}

/// A record serializable to and from JSON through a [`Packer`].
pub trait JsonRecord: Default + Clone {
    fn pack<P: Packer>(&mut self, p: &mut P) -> Result<()>;

    fn to_json(&self) -> Result<Vec<u8>> {
        let mut writer = Writer::new();
        let mut copy = self.clone();
        copy.pack(&mut writer)?;
        Ok(writer.into_bytes())
    }

    fn from_json(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::parse(data)?;
        let mut record = Self::default();
        record.pack(&mut reader)?;
        reader.finish()?;
        Ok(record)
    }
}

/// Heuristic for pre-serialized content: a byte array whose first significant
/// byte opens a JSON object, array, bool or number is embedded raw.
pub(crate) fn looks_like_json(data: &[u8]) -> bool {
    for &b in data {
        if b.is_ascii_whitespace() {
            continue;
        }
        return matches!(b, b'{' | b'[' | b't' | b'f' | b'-' | b'0'..=b'9');
    }
    false
}

// ---------------------------------- Writer ----------------------------------

#[derive(Clone, Copy, PartialEq)]
enum FrameKind {
    Object,
    Array,
}

struct WriteFrame {
    kind: FrameKind,
    count: usize,
}

/// Streaming JSON writer over a string buffer.
pub struct Writer {
    out: String,
    stack: Vec<WriteFrame>,
    pending_key: Option<String>,
}

impl Writer {
    pub fn new() -> Self {
        Self {
            out: String::with_capacity(256),
            stack: Vec::new(),
            pending_key: None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.out
    }

    pub fn into_string(self) -> String {
        self.out
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.out.into_bytes()
    }

    fn begin_value(&mut self) {
        if let Some(frame) = self.stack.last_mut() {
            if frame.count > 0 {
                self.out.push(',');
            }
            frame.count += 1;
        }
        if let Some(key) = self.pending_key.take() {
            self.out.push_str(&escape_str(&key));
            self.out.push(':');
        }
    }

    fn raw_value(&mut self, raw: &str) {
        self.begin_value();
        self.out.push_str(raw);
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

fn escape_str(s: &str) -> String {
    serde_json::to_string(s).expect("string serialization is infallible")
}

impl Packer for Writer {
    fn is_reader(&self) -> bool {
        false
    }

    fn member(&mut self, name: &str) -> &mut Self {
        self.pending_key = Some(name.to_string());
        self
    }

    fn member_opt(&mut self, name: &str) -> &mut Self {
        self.member(name)
    }

    fn start_object(&mut self) -> &mut Self {
        self.begin_value();
        self.out.push('{');
        self.stack.push(WriteFrame { kind: FrameKind::Object, count: 0 });
        self
    }

    fn end_object(&mut self) -> &mut Self {
        debug_assert!(matches!(self.stack.last(), Some(f) if f.kind == FrameKind::Object));
        self.stack.pop();
        self.out.push('}');
        self
    }

    fn start_array(&mut self, _size: &mut u32) -> &mut Self {
        self.begin_value();
        self.out.push('[');
        self.stack.push(WriteFrame { kind: FrameKind::Array, count: 0 });
        self
    }

    fn end_array(&mut self) -> &mut Self {
        debug_assert!(matches!(self.stack.last(), Some(f) if f.kind == FrameKind::Array));
        self.stack.pop();
        self.out.push(']');
        self
    }

    fn set_null(&mut self) -> &mut Self {
        self.raw_value("null");
        self
    }

    fn value_bool(&mut self, v: &mut bool) {
        self.raw_value(if *v { "true" } else { "false" });
    }

    fn value_i32(&mut self, v: &mut i32) {
        self.raw_value(&v.to_string());
    }

    fn value_u16(&mut self, v: &mut u16) {
        self.raw_value(&v.to_string());
    }

    fn value_u32(&mut self, v: &mut u32) {
        self.raw_value(&v.to_string());
    }

    fn value_i64(&mut self, v: &mut i64) {
        self.raw_value(&v.to_string());
    }

    fn value_u64(&mut self, v: &mut u64) {
        self.raw_value(&v.to_string());
    }

    fn value_f64(&mut self, v: &mut f64) {
        if v.is_finite() {
            self.raw_value(&v.to_string());
        } else {
            self.raw_value("null");
        }
    }

    fn value_string(&mut self, v: &mut String) {
        let escaped = escape_str(v);
        self.raw_value(&escaped);
    }

    fn value_uuid(&mut self, v: &mut Uuid) {
        let s = format!("\"{v}\"");
        self.raw_value(&s);
    }

    fn value_bytes(&mut self, v: &mut Vec<u8>) {
        if looks_like_json(v) {
            if let Ok(raw) = std::str::from_utf8(v) {
                let raw = raw.to_string();
                self.raw_value(&raw);
                return;
            }
        }
        let text = String::from_utf8_lossy(v).into_owned();
        let escaped = escape_str(&text);
        self.raw_value(&escaped);
    }

    fn value_date(&mut self, v: &mut NaiveDate) {
        let s = format!("\"{}\"", v.format("%Y-%m-%d"));
        self.raw_value(&s);
    }

    fn value_time(&mut self, v: &mut NaiveTime) {
        let s = format!("\"{}\"", v.format("%H:%M:%S%.3f"));
        self.raw_value(&s);
    }

    fn value_datetime(&mut self, v: &mut DateTime<Utc>) {
        self.raw_value(&v.timestamp_millis().to_string());
    }

    fn value_u64_seq(&mut self, v: &mut Vec<u64>) {
        let mut size = v.len() as u32;
        self.start_array(&mut size);
        for item in v.iter_mut() {
            let mut val = *item;
            self.value_u64(&mut val);
        }
        self.end_array();
    }
}

// ---------------------------------- Reader ----------------------------------

enum ItemState {
    /// A value taken from the document, not yet consumed.
    Plain,
    /// An array opened by `start_array`, iterated element by element.
    ArrayStarted,
    /// A member absent from the document; reads produce defaults when the
    /// member was optional.
    Missing { optional: bool },
}

struct ReadItem {
    value: Value,
    state: ItemState,
    index: usize,
}

/// JSON reader over a parsed document.
///
/// Values are moved out of the document as members are visited, so a reader
/// is single-use.
pub struct Reader {
    stack: Vec<ReadItem>,
    fatal: bool,
}

impl Reader {
    /// Parses a JSON document; a malformed document is a codec error.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(data).map_err(|e| {
            let preview = String::from_utf8_lossy(&data[..data.len().min(40)]);
            Error::serialize(format!("Failed to parse json near '{preview}': {e}"))
        })?;
        Ok(Self {
            stack: vec![ReadItem { value, state: ItemState::Plain, index: 0 }],
            fatal: false,
        })
    }

    /// Completes the pass: a reader that hit a mandatory-member failure or a
    /// type mismatch reports it here.
    pub fn finish(&self) -> Result<()> {
        if self.fatal {
            return Err(Error::serialize("Json record decoding failed"));
        }
        Ok(())
    }

    pub fn failed(&self) -> bool {
        self.fatal
    }

    /// Whether the object on top of the navigation stack still has a member
    /// with this name. Lets callers distinguish an absent key from a default
    /// value when the key itself is the sentinel.
    pub fn contains(&self, name: &str) -> bool {
        self.stack
            .last()
            .and_then(|item| item.value.as_object())
            .map(|map| map.contains_key(name))
            .unwrap_or(false)
    }

    fn fail(&mut self, detail: &str) {
        if !self.fatal {
            error!("Json decode error: {detail}");
            self.fatal = true;
        }
    }

    fn push_member(&mut self, name: &str, optional: bool) {
        if self.fatal {
            return;
        }
        let parent = match self.stack.last_mut() {
            Some(item) => item,
            None => {
                self.fail("navigation below the document root");
                return;
            }
        };
        // Inside a missing optional object every member is missing too.
        if let ItemState::Missing { .. } = parent.state {
            self.stack.push(ReadItem {
                value: Value::Null,
                state: ItemState::Missing { optional: true },
                index: 0,
            });
            return;
        }
        let taken = parent.value.as_object_mut().and_then(|map| map.remove(name));
        match taken {
            Some(value) => self.stack.push(ReadItem { value, state: ItemState::Plain, index: 0 }),
            None => {
                if !optional {
                    // Failing stops all pushes, so no marker here either
                    self.fail(&format!("mandatory member '{name}' not found"));
                    return;
                }
                self.stack.push(ReadItem {
                    value: Value::Null,
                    state: ItemState::Missing { optional },
                    index: 0,
                });
            }
        }
    }

    /// Takes the value the next read applies to: the current array element
    /// when iterating an array, otherwise the top of the stack.
    fn take_value(&mut self) -> Option<Value> {
        // After a fatal error member() stops pushing, so reads must stop
        // popping to keep the navigation balanced.
        if self.fatal {
            return None;
        }
        let top = self.stack.last_mut()?;
        match top.state {
            ItemState::ArrayStarted => {
                let element = top.value.as_array_mut().and_then(|arr| {
                    let i = top.index;
                    arr.get_mut(i).map(Value::take)
                });
                top.index += 1;
                element
            }
            ItemState::Missing { .. } => {
                self.stack.pop();
                None
            }
            ItemState::Plain => self.stack.pop().map(|item| item.value),
        }
    }

    fn read_with<T>(&mut self, v: &mut T, what: &str, convert: impl FnOnce(&Value) -> Option<T>)
    where
        T: Default,
    {
        let value = match self.take_value() {
            Some(value) => value,
            None => {
                *v = T::default();
                return;
            }
        };
        if value.is_null() {
            *v = T::default();
            return;
        }
        match convert(&value) {
            Some(parsed) => *v = parsed,
            None => self.fail(&format!("expected {what}, got '{value}'")),
        }
    }
}

impl Packer for Reader {
    fn is_reader(&self) -> bool {
        true
    }

    fn member(&mut self, name: &str) -> &mut Self {
        self.push_member(name, false);
        self
    }

    fn member_opt(&mut self, name: &str) -> &mut Self {
        self.push_member(name, true);
        self
    }

    fn start_object(&mut self) -> &mut Self {
        if self.fatal {
            return self;
        }
        match self.stack.last() {
            Some(item) => match item.state {
                ItemState::Missing { .. } => {}
                _ => {
                    if !item.value.is_object() {
                        self.fail("expected an object");
                    }
                }
            },
            None => self.fail("start_object below the document root"),
        }
        self
    }

    fn end_object(&mut self) -> &mut Self {
        self.stack.pop();
        self
    }

    fn start_array(&mut self, size: &mut u32) -> &mut Self {
        *size = 0;
        if self.fatal {
            return self;
        }
        match self.stack.last_mut() {
            Some(item) => match item.state {
                ItemState::Missing { .. } => {}
                _ => {
                    if item.value.is_null() {
                        item.state = ItemState::Missing { optional: true };
                    } else if let Some(arr) = item.value.as_array() {
                        *size = arr.len() as u32;
                        item.state = ItemState::ArrayStarted;
                        item.index = 0;
                    } else {
                        self.fail("expected an array");
                    }
                }
            },
            None => self.fail("start_array below the document root"),
        }
        self
    }

    fn end_array(&mut self) -> &mut Self {
        self.stack.pop();
        self
    }

    fn set_null(&mut self) -> &mut Self {
        self.take_value();
        self
    }

    fn value_bool(&mut self, v: &mut bool) {
        self.read_with(v, "bool", |value| value.as_bool());
    }

    fn value_i32(&mut self, v: &mut i32) {
        self.read_with(v, "i32", |value| value.as_i64().and_then(|n| i32::try_from(n).ok()));
    }

    fn value_u16(&mut self, v: &mut u16) {
        self.read_with(v, "u16", |value| value.as_u64().and_then(|n| u16::try_from(n).ok()));
    }

    fn value_u32(&mut self, v: &mut u32) {
        self.read_with(v, "u32", |value| value.as_u64().and_then(|n| u32::try_from(n).ok()));
    }

    fn value_i64(&mut self, v: &mut i64) {
        self.read_with(v, "i64", |value| value.as_i64());
    }

    fn value_u64(&mut self, v: &mut u64) {
        self.read_with(v, "u64", |value| value.as_u64());
    }

    fn value_f64(&mut self, v: &mut f64) {
        self.read_with(v, "f64", |value| value.as_f64());
    }

    fn value_string(&mut self, v: &mut String) {
        self.read_with(v, "string", |value| value.as_str().map(str::to_string));
    }

    fn value_uuid(&mut self, v: &mut Uuid) {
        self.read_with(v, "uuid", |value| value.as_str().and_then(|s| Uuid::parse_str(s).ok()));
    }

    fn value_bytes(&mut self, v: &mut Vec<u8>) {
        self.read_with(v, "bytes", |value| match value {
            Value::String(s) => Some(s.clone().into_bytes()),
            // Pre-serialized content embedded raw: re-emit it compactly.
            Value::Object(_) | Value::Array(_) | Value::Bool(_) | Value::Number(_) => {
                serde_json::to_vec(value).ok()
            }
            _ => None,
        });
    }

    fn value_date(&mut self, v: &mut NaiveDate) {
        self.read_with(v, "date", |value| {
            value.as_str().and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        });
    }

    fn value_time(&mut self, v: &mut NaiveTime) {
        self.read_with(v, "time", |value| {
            value.as_str().and_then(|s| NaiveTime::parse_from_str(s, "%H:%M:%S%.3f").ok())
        });
    }

    fn value_datetime(&mut self, v: &mut DateTime<Utc>) {
        self.read_with(v, "timestamp", |value| {
            value.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        });
    }

    fn value_u64_seq(&mut self, v: &mut Vec<u64>) {
        let mut size = 0u32;
        self.start_array(&mut size);
        v.clear();
        for _ in 0..size {
            let mut item = 0u64;
            self.value_u64(&mut item);
            v.push(item);
        }
        self.end_array();
    }
}
