//! Decoding binary logger records.
//!
//! Each record is a logger entry header followed by its payload:
//!
//! ```text
//! u16 len | u16 hdr_size | i32 pid | u32 tid | u32 sec | u32 nsec | u32 lid | u32 uid | payload[len]
//! ```
//!
//! All fields are little-endian. Older headers stop after `nsec` (20 bytes)
//! or after `lid` (24 bytes). Event payloads start with a `u32` tag followed
//! by one typed value; text payloads are `u8 priority`, a NUL-terminated tag
//! and a NUL-terminated message.

use std::io::{ErrorKind, Read};

use veil_common::error::{Result, VeilError};

/// Log buffer a record was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogBuffer {
    /// Application and framework text logs.
    Main,
    /// Telephony text logs.
    Radio,
    /// Binary system events.
    Events,
    /// System text logs.
    System,
    /// Crash reports.
    Crash,
    /// Any other buffer id.
    Other(u32),
}

impl From<u32> for LogBuffer {
    fn from(id: u32) -> Self {
        match id {
            0 => Self::Main,
            1 => Self::Radio,
            2 => Self::Events,
            3 => Self::System,
            4 => Self::Crash,
            other => Self::Other(other),
        }
    }
}

/// One decoded logger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Buffer the entry came from.
    pub buffer: LogBuffer,
    /// Writer pid.
    pub pid: i32,
    /// Writer thread id.
    pub tid: u32,
    /// Writer uid, `None` for headers that predate the field.
    pub uid: Option<u32>,
    /// Raw payload.
    pub payload: Vec<u8>,
}

const MIN_HEADER: usize = 20;
const LID_HEADER: usize = 24;
const UID_HEADER: usize = 28;

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn truncated(what: &str) -> VeilError {
    VeilError::Protocol {
        message: format!("truncated log {what}"),
    }
}

/// Reads the next record. Returns `Ok(None)` at a clean end of stream.
///
/// # Errors
///
/// Returns [`VeilError::Protocol`] for a truncated or malformed record and
/// [`VeilError::Io`] if reading fails.
pub fn read_record(reader: &mut impl Read) -> Result<Option<LogRecord>> {
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(io_error(e)),
    }
    let len = usize::from(u16_at(&prefix, 0));
    let hdr_size = match usize::from(u16_at(&prefix, 2)) {
        // v1 headers carry padding where hdr_size now lives.
        0 => MIN_HEADER,
        size if size < MIN_HEADER => {
            return Err(VeilError::Protocol {
                message: format!("log header size {size} too small"),
            });
        }
        size => size,
    };

    let mut header = vec![0u8; hdr_size];
    header[..4].copy_from_slice(&prefix);
    reader
        .read_exact(&mut header[4..])
        .map_err(|e| eof_as(e, "header"))?;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| eof_as(e, "payload"))?;

    let buffer = if hdr_size >= LID_HEADER {
        LogBuffer::from(u32_at(&header, 20))
    } else {
        LogBuffer::Main
    };
    let uid = (hdr_size >= UID_HEADER).then(|| u32_at(&header, 24));
    Ok(Some(LogRecord {
        buffer,
        pid: i32::from_le_bytes([header[4], header[5], header[6], header[7]]),
        tid: u32_at(&header, 8),
        uid,
        payload,
    }))
}

fn io_error(e: std::io::Error) -> VeilError {
    VeilError::Io {
        path: "logcat".into(),
        source: e,
    }
}

fn eof_as(e: std::io::Error, what: &str) -> VeilError {
    if e.kind() == ErrorKind::UnexpectedEof {
        truncated(what)
    } else {
        io_error(e)
    }
}

/// A typed value from a binary event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// 32-bit float.
    Float(f32),
    /// Length-prefixed string.
    Str(String),
    /// Nested list.
    List(Vec<EventValue>),
}

impl EventValue {
    /// Returns the value as an integer, widening `Int`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(i64::from(*v)),
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as a string slice.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// A decoded binary event.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    /// Event tag number.
    pub tag: u32,
    /// Event value, usually a list.
    pub value: EventValue,
}

impl LogEvent {
    /// Returns the `index`-th element of a list value.
    #[must_use]
    pub fn field(&self, index: usize) -> Option<&EventValue> {
        match &self.value {
            EventValue::List(items) => items.get(index),
            _ => None,
        }
    }
}

const TYPE_INT: u8 = 0;
const TYPE_LONG: u8 = 1;
const TYPE_STRING: u8 = 2;
const TYPE_LIST: u8 = 3;
const TYPE_FLOAT: u8 = 4;

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Some(head)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    fn value(&mut self, depth: usize) -> Option<EventValue> {
        match self.take(1)?[0] {
            TYPE_INT => Some(EventValue::Int(i32::from_le_bytes(self.array()?))),
            TYPE_LONG => Some(EventValue::Long(i64::from_le_bytes(self.array()?))),
            TYPE_FLOAT => Some(EventValue::Float(f32::from_le_bytes(self.array()?))),
            TYPE_STRING => {
                let len = usize::try_from(u32::from_le_bytes(self.array()?)).ok()?;
                let bytes = self.take(len)?;
                Some(EventValue::Str(String::from_utf8_lossy(bytes).into_owned()))
            }
            TYPE_LIST if depth < 8 => {
                let count = self.take(1)?[0];
                (0..count)
                    .map(|_| self.value(depth + 1))
                    .collect::<Option<Vec<_>>>()
                    .map(EventValue::List)
            }
            _ => None,
        }
    }
}

/// Decodes a binary event payload.
#[must_use]
pub fn parse_event(payload: &[u8]) -> Option<LogEvent> {
    let mut cursor = Cursor { buf: payload };
    let tag = u32::from_le_bytes(cursor.array()?);
    let value = cursor.value(0)?;
    Some(LogEvent { tag, value })
}

/// A decoded text log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextLine {
    /// Log priority.
    pub priority: u8,
    /// Log tag.
    pub tag: String,
    /// Message body.
    pub message: String,
}

/// Decodes a text payload.
#[must_use]
pub fn parse_text(payload: &[u8]) -> Option<TextLine> {
    let (&priority, rest) = payload.split_first()?;
    let tag_end = rest.iter().position(|b| *b == 0)?;
    let tag = String::from_utf8_lossy(&rest[..tag_end]).into_owned();
    let body = &rest[tag_end + 1..];
    let body_end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
    let message = String::from_utf8_lossy(&body[..body_end]).into_owned();
    Some(TextLine {
        priority,
        tag,
        message,
    })
}
