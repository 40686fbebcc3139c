//! Control protocol framing.
//!
//! Integers are 32-bit little-endian; strings are an integer byte length
//! followed by UTF-8 bytes. A request is one integer code followed by its
//! fields, and every request is answered with one integer code.

use std::io::{Read, Write};

use veil_common::error::{Result, VeilError};

/// Longest string accepted from a peer.
pub const MAX_STRING_LEN: usize = 4096;

/// Control requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Request {
    /// Turn enforcement on.
    Enforce = 0,
    /// Turn enforcement off.
    Disable = 1,
    /// Add a (package, process) pair.
    Add = 2,
    /// Remove a pair or a whole package.
    Remove = 3,
    /// List every pair.
    List = 4,
    /// Query enforcement.
    Status = 5,
}

impl TryFrom<i32> for Request {
    type Error = VeilError;

    fn try_from(code: i32) -> Result<Self> {
        Ok(match code {
            0 => Self::Enforce,
            1 => Self::Disable,
            2 => Self::Add,
            3 => Self::Remove,
            4 => Self::List,
            5 => Self::Status,
            other => {
                return Err(VeilError::Protocol {
                    message: format!("unknown request code {other}"),
                });
            }
        })
    }
}

/// Response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Response {
    /// Success.
    Ok = 0,
    /// Enforcement is on.
    Enforced = 1,
    /// Enforcement is off.
    NotEnforced = 2,
    /// The pair is already listed.
    ItemExist = 3,
    /// Nothing matched the removal.
    ItemNotExist = 4,
    /// Malformed or uninstalled package.
    InvalidPkg = 5,
    /// Mount namespaces are unsupported.
    NoNs = 6,
    /// Anything else went wrong.
    Error = 7,
}

impl Response {
    /// Returns the wire code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Parses a wire code; unknown codes read as [`Response::Error`].
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Enforced,
            2 => Self::NotEnforced,
            3 => Self::ItemExist,
            4 => Self::ItemNotExist,
            5 => Self::InvalidPkg,
            6 => Self::NoNs,
            _ => Self::Error,
        }
    }
}

impl From<&VeilError> for Response {
    fn from(error: &VeilError) -> Self {
        match error {
            VeilError::InvalidTarget { .. } => Self::InvalidPkg,
            VeilError::AlreadyExists { .. } => Self::ItemExist,
            VeilError::NotFound { .. } => Self::ItemNotExist,
            VeilError::NamespaceUnsupported => Self::NoNs,
            _ => Self::Error,
        }
    }
}

impl<T> From<&Result<T>> for Response {
    fn from(result: &Result<T>) -> Self {
        result.as_ref().map_or_else(Self::from, |_| Self::Ok)
    }
}

fn io_error(e: std::io::Error) -> VeilError {
    VeilError::Io {
        path: "control socket".into(),
        source: e,
    }
}

/// Reads one integer.
///
/// # Errors
///
/// Returns [`VeilError::Io`] if the peer hung up or reading failed.
pub fn read_int(reader: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(io_error)?;
    Ok(i32::from_le_bytes(buf))
}

/// Writes one integer.
///
/// # Errors
///
/// Returns [`VeilError::Io`] if writing failed.
pub fn write_int(writer: &mut impl Write, value: i32) -> Result<()> {
    writer.write_all(&value.to_le_bytes()).map_err(io_error)
}

/// Reads one length-prefixed string.
///
/// # Errors
///
/// Returns [`VeilError::Protocol`] for a negative or oversized length or
/// invalid UTF-8, and [`VeilError::Io`] if reading failed.
pub fn read_string(reader: &mut impl Read) -> Result<String> {
    let len = read_int(reader)?;
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_STRING_LEN)
        .ok_or_else(|| VeilError::Protocol {
            message: format!("bad string length {len}"),
        })?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).map_err(io_error)?;
    String::from_utf8(buf).map_err(|_| VeilError::Protocol {
        message: "string is not UTF-8".to_owned(),
    })
}

/// Writes one length-prefixed string.
///
/// # Errors
///
/// Returns [`VeilError::Protocol`] if the string is too long to frame and
/// [`VeilError::Io`] if writing failed.
pub fn write_string(writer: &mut impl Write, value: &str) -> Result<()> {
    let len = i32::try_from(value.len()).map_err(|_| VeilError::Protocol {
        message: "string too long".to_owned(),
    })?;
    write_int(writer, len)?;
    writer.write_all(value.as_bytes()).map_err(io_error)
}
