//! KMIP tag-type-length-value encoding.
//!
//! Every item is an 8-byte header `[tag:3][type:1][length:4]` (big endian)
//! followed by the value, padded with zeros to a multiple of 8 bytes.
//! Structures hold a sequence of items and are never padded.

use thiserror::Error;

/// Largest message accepted from a server.
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

const HEADER_LEN: usize = 8;

/// Tags used by the provider.
pub mod tag {
    #![allow(missing_docs)]
    pub const ATTRIBUTE: u32 = 0x42_0008;
    pub const ATTRIBUTE_NAME: u32 = 0x42_000A;
    pub const ATTRIBUTE_VALUE: u32 = 0x42_000B;
    pub const BATCH_COUNT: u32 = 0x42_000D;
    pub const BATCH_ITEM: u32 = 0x42_000F;
    pub const CRYPTOGRAPHIC_ALGORITHM: u32 = 0x42_0028;
    pub const CRYPTOGRAPHIC_LENGTH: u32 = 0x42_002A;
    pub const KEY_BLOCK: u32 = 0x42_0040;
    pub const KEY_FORMAT_TYPE: u32 = 0x42_0042;
    pub const KEY_MATERIAL: u32 = 0x42_0043;
    pub const KEY_VALUE: u32 = 0x42_0045;
    pub const NAME: u32 = 0x42_0053;
    pub const NAME_TYPE: u32 = 0x42_0054;
    pub const NAME_VALUE: u32 = 0x42_0055;
    pub const OBJECT_TYPE: u32 = 0x42_0057;
    pub const OPERATION: u32 = 0x42_005C;
    pub const PROTOCOL_VERSION: u32 = 0x42_0069;
    pub const PROTOCOL_VERSION_MAJOR: u32 = 0x42_006A;
    pub const PROTOCOL_VERSION_MINOR: u32 = 0x42_006B;
    pub const REQUEST_HEADER: u32 = 0x42_0077;
    pub const REQUEST_MESSAGE: u32 = 0x42_0078;
    pub const REQUEST_PAYLOAD: u32 = 0x42_0079;
    pub const RESPONSE_HEADER: u32 = 0x42_007A;
    pub const RESPONSE_MESSAGE: u32 = 0x42_007B;
    pub const RESPONSE_PAYLOAD: u32 = 0x42_007C;
    pub const RESULT_MESSAGE: u32 = 0x42_007D;
    pub const RESULT_REASON: u32 = 0x42_007E;
    pub const RESULT_STATUS: u32 = 0x42_007F;
    pub const SYMMETRIC_KEY: u32 = 0x42_008F;
    pub const TEMPLATE_ATTRIBUTE: u32 = 0x42_0091;
    pub const UNIQUE_IDENTIFIER: u32 = 0x42_0094;
    pub const CRYPTOGRAPHIC_USAGE_MASK: u32 = 0x42_002C;
}

/// Decoding failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TtlvError {
    /// Input ended inside an item
    #[error("truncated TTLV item")]
    Truncated,

    /// A fixed-size value has the wrong length
    #[error("TTLV item {tag:#08X} has invalid length {len}")]
    BadLength {
        /// Item tag
        tag: u32,
        /// Declared length
        len: usize,
    },

    /// Unsupported item type
    #[error("unknown TTLV type {0:#04X}")]
    UnknownType(u8),

    /// Text string is not UTF-8
    #[error("TTLV text string is not UTF-8")]
    Utf8,

    /// Message exceeds [`MAX_MESSAGE_SIZE`]
    #[error("TTLV message of {0} bytes is too large")]
    TooLarge(usize),
}

/// An item value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Ordered child items.
    Structure(Vec<Item>),
    /// Signed 32-bit integer.
    Integer(i32),
    /// Signed 64-bit integer.
    LongInteger(i64),
    /// Big-endian two's complement integer.
    BigInteger(Vec<u8>),
    /// 32-bit enumeration.
    Enumeration(u32),
    /// Boolean.
    Boolean(bool),
    /// UTF-8 text.
    TextString(String),
    /// Raw bytes.
    ByteString(Vec<u8>),
    /// Seconds since the Unix epoch.
    DateTime(i64),
    /// Duration in seconds.
    Interval(u32),
}

impl Value {
    const fn type_code(&self) -> u8 {
        match self {
            Self::Structure(_) => 0x01,
            Self::Integer(_) => 0x02,
            Self::LongInteger(_) => 0x03,
            Self::BigInteger(_) => 0x04,
            Self::Enumeration(_) => 0x05,
            Self::Boolean(_) => 0x06,
            Self::TextString(_) => 0x07,
            Self::ByteString(_) => 0x08,
            Self::DateTime(_) => 0x09,
            Self::Interval(_) => 0x0A,
        }
    }
}

/// A tagged TTLV item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Three-byte tag.
    pub tag: u32,
    /// Value.
    pub value: Value,
}

impl Item {
    /// Creates a structure.
    #[must_use]
    pub const fn structure(tag: u32, items: Vec<Self>) -> Self {
        Self { tag, value: Value::Structure(items) }
    }

    /// Creates an integer.
    #[must_use]
    pub const fn integer(tag: u32, value: i32) -> Self {
        Self { tag, value: Value::Integer(value) }
    }

    /// Creates an enumeration.
    #[must_use]
    pub const fn enumeration(tag: u32, value: u32) -> Self {
        Self { tag, value: Value::Enumeration(value) }
    }

    /// Creates a text string.
    #[must_use]
    pub fn text(tag: u32, value: impl Into<String>) -> Self {
        Self { tag, value: Value::TextString(value.into()) }
    }

    /// Creates a byte string.
    #[must_use]
    pub fn bytes(tag: u32, value: impl Into<Vec<u8>>) -> Self {
        Self { tag, value: Value::ByteString(value.into()) }
    }

    /// Returns the first child with `tag`.
    #[must_use]
    pub fn child(&self, tag: u32) -> Option<&Self> {
        self.children(tag).next()
    }

    /// Returns every child with `tag`.
    pub fn children(&self, tag: u32) -> impl Iterator<Item = &Self> {
        let items: &[Self] = match &self.value {
            Value::Structure(items) => items,
            _ => &[],
        };
        items.iter().filter(move |item| item.tag == tag)
    }

    /// Returns the value as text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match &self.value {
            Value::TextString(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the value as bytes.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.value {
            Value::ByteString(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the value as an enumeration.
    #[must_use]
    pub const fn as_enum(&self) -> Option<u32> {
        match self.value {
            Value::Enumeration(value) => Some(value),
            _ => None,
        }
    }

    /// Appends the encoding of this item to `out`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.tag.to_be_bytes()[1..]);
        out.push(self.value.type_code());

        // Lengths are bounded well below u32::MAX by MAX_MESSAGE_SIZE.
        match &self.value {
            Value::Structure(items) => {
                let mut body = Vec::new();
                for item in items {
                    item.encode(&mut body);
                }
                out.extend_from_slice(&(body.len() as u32).to_be_bytes());
                out.extend_from_slice(&body);
            }
            Value::Integer(v) => put_padded(out, &v.to_be_bytes()),
            Value::LongInteger(v) | Value::DateTime(v) => put_padded(out, &v.to_be_bytes()),
            Value::Enumeration(v) | Value::Interval(v) => put_padded(out, &v.to_be_bytes()),
            Value::Boolean(v) => put_padded(out, &u64::from(*v).to_be_bytes()),
            Value::TextString(text) => put_padded(out, text.as_bytes()),
            Value::BigInteger(bytes) | Value::ByteString(bytes) => put_padded(out, bytes),
        }
    }

    /// Encodes this item into a new buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Decodes one item from the front of `buf` and returns it with the
    /// number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns a [`TtlvError`] for truncated or malformed input.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), TtlvError> {
        if buf.len() < HEADER_LEN {
            return Err(TtlvError::Truncated);
        }
        let tag = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        let type_code = buf[3];
        let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let padded = if type_code == 0x01 { len } else { len.div_ceil(8) * 8 };
        if buf.len() - HEADER_LEN < padded {
            return Err(TtlvError::Truncated);
        }
        let body = &buf[HEADER_LEN..HEADER_LEN + len];
        let fixed = |want: usize| {
            if len == want {
                Ok(())
            } else {
                Err(TtlvError::BadLength { tag, len })
            }
        };

        let value = match type_code {
            0x01 => {
                let mut items = Vec::new();
                let mut pos = 0;
                while pos < body.len() {
                    let (item, used) = Self::decode(&body[pos..])?;
                    items.push(item);
                    pos += used;
                }
                Value::Structure(items)
            }
            0x02 => {
                fixed(4)?;
                Value::Integer(i32::from_be_bytes([body[0], body[1], body[2], body[3]]))
            }
            0x03 => {
                fixed(8)?;
                Value::LongInteger(i64::from_be_bytes(array8(body)))
            }
            0x04 => Value::BigInteger(body.to_vec()),
            0x05 => {
                fixed(4)?;
                Value::Enumeration(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
            }
            0x06 => {
                fixed(8)?;
                Value::Boolean(u64::from_be_bytes(array8(body)) != 0)
            }
            0x07 => Value::TextString(String::from_utf8(body.to_vec()).map_err(|_| TtlvError::Utf8)?),
            0x08 => Value::ByteString(body.to_vec()),
            0x09 => {
                fixed(8)?;
                Value::DateTime(i64::from_be_bytes(array8(body)))
            }
            0x0A => {
                fixed(4)?;
                Value::Interval(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
            }
            other => return Err(TtlvError::UnknownType(other)),
        };

        Ok((Self { tag, value }, HEADER_LEN + padded))
    }
}

#[allow(clippy::cast_possible_truncation)]
fn put_padded(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
    let padding = value.len().div_ceil(8) * 8 - value.len();
    out.extend(std::iter::repeat(0).take(padding));
}

fn array8(body: &[u8]) -> [u8; 8] {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&body[..8]);
    raw
}

/// Length of the message whose 8-byte header is `header`, header included.
///
/// # Errors
///
/// Returns `TtlvError::TooLarge` above [`MAX_MESSAGE_SIZE`].
pub fn message_len(header: &[u8; HEADER_LEN]) -> Result<usize, TtlvError> {
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let total = HEADER_LEN + len;
    if total > MAX_MESSAGE_SIZE {
        return Err(TtlvError::TooLarge(total));
    }
    Ok(total)
}
