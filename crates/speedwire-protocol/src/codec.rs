//! Value representations ("reprs"): how each kind of value becomes bytes.
//!
//! Every repr offers the same three operations:
//!
//! - `write`: append the encoding of a value to a buffer (synchronous;
//!   segments are assembled in memory and written in one go),
//! - `read`: pull exactly the bytes of one value off a [`Readable`],
//! - `find_error`: run the repr's validators, returning a message that
//!   names the failing validator.
//!
//! [`Repr`] is a closed enum rather than a trait object: descriptor
//! tables are plain data and are matched on, never dispatched through.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::{BufMut, BytesMut};
use futures_util::future::BoxFuture;
use num_bigint::BigUint;
use regex::Regex;
use serde::{Deserialize, Serialize};
use speedwire_transport::Readable;

use crate::list::ListRepr;
use crate::{entity, ProtocolError, SpecSpace, Value};

// ---------------------------------------------------------------------------
// Raw helpers
// ---------------------------------------------------------------------------

/// Reads a big-endian unsigned integer of `size` bytes (0–4).
pub(crate) async fn read_uint<R: Readable>(
    r: &mut R,
    size: usize,
) -> Result<u32, ProtocolError> {
    let data = r.read(size).await?;
    Ok(data.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

pub(crate) async fn read_u8<R: Readable>(r: &mut R) -> Result<u8, ProtocolError> {
    let data = r.read(1).await?;
    Ok(data[0])
}

/// Writes `value` as a big-endian unsigned integer of `size` bytes,
/// failing if it does not fit.
pub(crate) fn write_uint(
    buf: &mut BytesMut,
    value: u32,
    size: usize,
) -> Result<(), ProtocolError> {
    if size < 4 && u64::from(value) >= 1u64 << (8 * size) {
        return Err(ProtocolError::Encode(format!(
            "value {value} does not fit in {size} byte(s)"
        )));
    }
    buf.put_uint(u64::from(value), size);
    Ok(())
}

fn mismatch(expected: &'static str, found: &Value) -> ProtocolError {
    ProtocolError::TypeMismatch {
        expected,
        found: found.kind_name(),
    }
}

// ---------------------------------------------------------------------------
// Repr
// ---------------------------------------------------------------------------

/// A value representation.
#[derive(Debug, Clone)]
pub enum Repr {
    Int(IntRepr),
    BigInt(BigIntRepr),
    Bool,
    Enum(EnumRepr),
    Str(StrRepr),
    Bin(BinRepr),
    List(Box<ListRepr>),
    /// A dynamically-typed entity, resolved through the bound [`SpecSpace`].
    Entity,
}

impl Repr {
    /// `Int(size)` with no validators.
    pub fn int(size: u8) -> Result<Self, ProtocolError> {
        IntRepr::new(size).map(Self::Int)
    }

    /// `Str` with no validators.
    pub fn str() -> Self {
        Self::Str(StrRepr::default())
    }

    /// `Bin` with no validators.
    pub fn bin() -> Self {
        Self::Bin(BinRepr::default())
    }

    /// A list of `item` with a `count_size`-byte count field.
    pub fn list(item: Repr, count_size: u8) -> Result<Self, ProtocolError> {
        ListRepr::new(item, count_size).map(|l| Self::List(Box::new(l)))
    }

    pub fn write(&self, buf: &mut BytesMut, value: &Value) -> Result<(), ProtocolError> {
        match (self, value) {
            (Self::Int(repr), Value::Int(v)) => repr.write(buf, *v),
            (Self::BigInt(repr), Value::BigInt(v)) => repr.write(buf, v),
            (Self::Bool, Value::Bool(v)) => write_uint(buf, u32::from(*v), 1),
            (Self::Enum(repr), Value::Enum(v) | Value::Int(v)) => repr.write(buf, *v),
            (Self::Str(repr), Value::Str(v)) => repr.write(buf, v),
            (Self::Bin(repr), Value::Bin(v)) => repr.write(buf, v),
            (Self::List(repr), Value::List(v)) => repr.write(buf, v),
            (Self::Entity, Value::Entity(v)) => entity::write_entity(buf, v),
            (repr, value) => Err(mismatch(repr.kind_name(), value)),
        }
    }

    pub fn read<'a, R: Readable>(
        &'a self,
        r: &'a mut R,
        space: Option<&'a SpecSpace>,
    ) -> BoxFuture<'a, Result<Value, ProtocolError>> {
        Box::pin(async move {
            match self {
                Self::Int(repr) => Ok(Value::Int(read_uint(r, repr.size()).await?)),
                Self::BigInt(repr) => Ok(Value::BigInt(repr.read(r).await?)),
                Self::Bool => Ok(Value::Bool(read_u8(r).await? != 0)),
                Self::Enum(repr) => Ok(Value::Enum(read_uint(r, repr.size()).await?)),
                Self::Str(repr) => Ok(Value::Str(repr.read(r).await?)),
                Self::Bin(repr) => Ok(Value::Bin(repr.read(r).await?)),
                Self::List(repr) => Ok(Value::List(repr.read(r, space).await?)),
                Self::Entity => Ok(Value::Entity(entity::read_entity(r, space).await?)),
            }
        })
    }

    /// Runs the validators. `None` means the value is acceptable.
    pub fn find_error(&self, value: &Value) -> Option<String> {
        match (self, value) {
            (Self::Int(repr), Value::Int(v)) => repr.find_error(*v),
            (Self::BigInt(repr), Value::BigInt(v)) => repr.find_error(v),
            (Self::Bool, Value::Bool(_)) => None,
            (Self::Enum(repr), Value::Enum(v) | Value::Int(v)) => repr.find_error(*v),
            (Self::Str(repr), Value::Str(v)) => repr.find_error(v),
            (Self::Bin(repr), Value::Bin(v)) => repr.find_error(v),
            (Self::List(repr), Value::List(v)) => repr.find_error(v),
            (Self::Entity, Value::Entity(v)) => v.spec().fields.find_error(v.value()),
            (repr, value) => Some(format!(
                "expected {}, got {}",
                repr.kind_name(),
                value.kind_name()
            )),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "Int",
            Self::BigInt(_) => "BigInt",
            Self::Bool => "Bool",
            Self::Enum(_) => "Enum",
            Self::Str(_) => "Str",
            Self::Bin(_) => "Bin",
            Self::List(_) => "List",
            Self::Entity => "Entity",
        }
    }
}

// ---------------------------------------------------------------------------
// Int
// ---------------------------------------------------------------------------

/// Big-endian unsigned integer of 1–4 bytes.
///
/// Wider integers must use [`BigIntRepr`].
#[derive(Debug, Clone)]
pub struct IntRepr {
    size: u8,
    range: Option<RangeInclusive<u32>>,
}

impl IntRepr {
    pub fn new(size: u8) -> Result<Self, ProtocolError> {
        if !(1..=4).contains(&size) {
            return Err(ProtocolError::InvalidDescriptor(format!(
                "Int size must be 1..=4 bytes, got {size}; use BigInteger for wider values"
            )));
        }
        Ok(Self { size, range: None })
    }

    pub fn with_range(mut self, range: RangeInclusive<u32>) -> Self {
        self.range = Some(range);
        self
    }

    pub fn size(&self) -> usize {
        usize::from(self.size)
    }

    fn write(&self, buf: &mut BytesMut, value: u32) -> Result<(), ProtocolError> {
        write_uint(buf, value, self.size())
    }

    fn find_error(&self, value: u32) -> Option<String> {
        let range = self.range.as_ref()?;
        if range.contains(&value) {
            return None;
        }
        Some(format!(
            "Int[val]: \"{value}\" is out of range {}..{}",
            range.start(),
            range.end()
        ))
    }
}

impl From<IntRepr> for Repr {
    fn from(r: IntRepr) -> Self {
        Self::Int(r)
    }
}

// ---------------------------------------------------------------------------
// BigInteger
// ---------------------------------------------------------------------------

/// How [`BigIntRepr`] converts between integers and bytes.
///
/// Every mode produces the same wire bytes; the polyfill modes go through
/// a hex text form instead of raw byte arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BigIntMode {
    #[default]
    Native,
    /// Hex text parsed with a `0x` prefix.
    HexPrefixed,
    /// Bare hex text parsed with an explicit radix.
    HexRadix,
}

static BIG_INT_MODE: AtomicU8 = AtomicU8::new(0);

/// Sets the process-wide [`BigIntMode`].
pub fn set_big_int_mode(mode: BigIntMode) {
    let raw = match mode {
        BigIntMode::Native => 0,
        BigIntMode::HexPrefixed => 1,
        BigIntMode::HexRadix => 2,
    };
    BIG_INT_MODE.store(raw, Ordering::Relaxed);
}

/// Returns the process-wide [`BigIntMode`].
pub fn big_int_mode() -> BigIntMode {
    match BIG_INT_MODE.load(Ordering::Relaxed) {
        1 => BigIntMode::HexPrefixed,
        2 => BigIntMode::HexRadix,
        _ => BigIntMode::Native,
    }
}

/// Arbitrary-width big-endian unsigned integer.
#[derive(Debug, Clone)]
pub struct BigIntRepr {
    size: usize,
    range: Option<RangeInclusive<BigUint>>,
}

impl BigIntRepr {
    pub fn new(size: usize) -> Self {
        Self { size, range: None }
    }

    pub fn with_range(mut self, range: RangeInclusive<BigUint>) -> Self {
        self.range = Some(range);
        self
    }

    fn write(&self, buf: &mut BytesMut, value: &BigUint) -> Result<(), ProtocolError> {
        self.write_with(big_int_mode(), buf, value)
    }

    fn write_with(
        &self,
        mode: BigIntMode,
        buf: &mut BytesMut,
        value: &BigUint,
    ) -> Result<(), ProtocolError> {
        let too_wide = || {
            ProtocolError::Encode(format!(
                "BigInteger {value} does not fit in {} byte(s)",
                self.size
            ))
        };

        match mode {
            BigIntMode::Native => {
                let bytes = value.to_bytes_be();
                // `to_bytes_be` of zero is `[0]`, not empty.
                let significant = if bytes == [0] { &[][..] } else { &bytes[..] };
                if significant.len() > self.size {
                    return Err(too_wide());
                }
                buf.put_bytes(0, self.size - significant.len());
                buf.put_slice(significant);
            }
            BigIntMode::HexPrefixed | BigIntMode::HexRadix => {
                let hex = format!("{:0>width$}", value.to_str_radix(16), width = self.size * 2);
                if hex.len() > self.size * 2 {
                    return Err(too_wide());
                }
                for pair in hex.as_bytes().chunks(2) {
                    let text = std::str::from_utf8(pair)
                        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
                    let byte = u8::from_str_radix(text, 16)
                        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
                    buf.put_u8(byte);
                }
            }
        }
        Ok(())
    }

    async fn read<R: Readable>(&self, r: &mut R) -> Result<BigUint, ProtocolError> {
        self.read_with(big_int_mode(), r).await
    }

    async fn read_with<R: Readable>(
        &self,
        mode: BigIntMode,
        r: &mut R,
    ) -> Result<BigUint, ProtocolError> {
        let data = r.read(self.size).await?;
        if mode == BigIntMode::Native {
            return Ok(BigUint::from_bytes_be(&data));
        }

        let mut text = String::with_capacity(self.size * 2 + 2);
        if mode == BigIntMode::HexPrefixed {
            text.push_str("0x");
        }
        for byte in data.iter() {
            text.push_str(&format!("{byte:02x}"));
        }

        let digits = match mode {
            BigIntMode::HexPrefixed => text.trim_start_matches("0x"),
            _ => text.as_str(),
        };
        if digits.is_empty() {
            return Ok(BigUint::default());
        }
        BigUint::parse_bytes(digits.as_bytes(), 16)
            .ok_or_else(|| ProtocolError::Decode(format!("bad BigInteger hex text {text:?}")))
    }

    fn find_error(&self, value: &BigUint) -> Option<String> {
        let range = self.range.as_ref()?;
        if range.contains(value) {
            return None;
        }
        Some(format!(
            "BigInt[val]: \"{value}\" is out of range {}..{}",
            range.start(),
            range.end()
        ))
    }
}

impl From<BigIntRepr> for Repr {
    fn from(r: BigIntRepr) -> Self {
        Self::BigInt(r)
    }
}

// ---------------------------------------------------------------------------
// Enum / bitfield
// ---------------------------------------------------------------------------

/// An enum member or bitfield, stored as an unsigned integer.
#[derive(Debug, Clone)]
pub struct EnumRepr {
    size: u8,
}

impl EnumRepr {
    pub fn new(size: u8) -> Result<Self, ProtocolError> {
        IntRepr::new(size).map(|_| Self { size })
    }

    pub fn size(&self) -> usize {
        usize::from(self.size)
    }

    fn write(&self, buf: &mut BytesMut, value: u32) -> Result<(), ProtocolError> {
        write_uint(buf, value, self.size())
    }

    fn find_error(&self, value: u32) -> Option<String> {
        let fits = self.size >= 4 || u64::from(value) < 1u64 << (8 * self.size());
        if fits {
            None
        } else {
            Some("Enum or Bitfield: value out of range".to_string())
        }
    }
}

impl From<EnumRepr> for Repr {
    fn from(r: EnumRepr) -> Self {
        Self::Enum(r)
    }
}

// ---------------------------------------------------------------------------
// Str
// ---------------------------------------------------------------------------

/// UTF-8 string with a 2-byte byte-length prefix.
#[derive(Debug, Clone, Default)]
pub struct StrRepr {
    len: Option<RangeInclusive<usize>>,
    pattern: Option<Regex>,
}

impl StrRepr {
    /// Length validator, counted in characters.
    pub fn with_len(mut self, len: RangeInclusive<usize>) -> Self {
        self.len = Some(len);
        self
    }

    pub fn with_pattern(mut self, pattern: &str) -> Result<Self, ProtocolError> {
        let regex = Regex::new(pattern)
            .map_err(|e| ProtocolError::InvalidDescriptor(format!("bad Str pattern: {e}")))?;
        self.pattern = Some(regex);
        Ok(self)
    }

    fn write(&self, buf: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
        let data = value.as_bytes();
        let len = u32::try_from(data.len())
            .map_err(|_| ProtocolError::Encode("string too long".into()))?;
        write_uint(buf, len, 2)?;
        buf.put_slice(data);
        Ok(())
    }

    async fn read<R: Readable>(&self, r: &mut R) -> Result<String, ProtocolError> {
        let len = read_uint(r, 2).await?;
        let data = r.read(len as usize).await?;
        Ok(String::from_utf8(data.to_vec())?)
    }

    fn find_error(&self, value: &str) -> Option<String> {
        if let Some(len) = &self.len {
            let count = value.chars().count();
            if !len.contains(&count) {
                return Some(format!(
                    "Str[len]: \"{count}\" is out of range {}..{}",
                    len.start(),
                    len.end()
                ));
            }
        }
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(value) {
                return Some(format!(
                    "Str[match]: \"{value}\" does not match /{}/",
                    pattern.as_str()
                ));
            }
        }
        None
    }
}

impl From<StrRepr> for Repr {
    fn from(r: StrRepr) -> Self {
        Self::Str(r)
    }
}

// ---------------------------------------------------------------------------
// Bin
// ---------------------------------------------------------------------------

/// Raw bytes with a 2-byte length prefix.
#[derive(Debug, Clone, Default)]
pub struct BinRepr {
    len: Option<RangeInclusive<usize>>,
}

impl BinRepr {
    pub fn with_len(mut self, len: RangeInclusive<usize>) -> Self {
        self.len = Some(len);
        self
    }

    fn write(&self, buf: &mut BytesMut, value: &[u8]) -> Result<(), ProtocolError> {
        let len = u32::try_from(value.len())
            .map_err(|_| ProtocolError::Encode("binary blob too long".into()))?;
        write_uint(buf, len, 2)?;
        buf.put_slice(value);
        Ok(())
    }

    async fn read<R: Readable>(&self, r: &mut R) -> Result<Vec<u8>, ProtocolError> {
        let len = read_uint(r, 2).await?;
        Ok(r.read(len as usize).await?.to_vec())
    }

    fn find_error(&self, value: &[u8]) -> Option<String> {
        let len = self.len.as_ref()?;
        if len.contains(&value.len()) {
            return None;
        }
        Some(format!(
            "Bin[len]: \"{}\" is out of range {}..{}",
            value.len(),
            len.start(),
            len.end()
        ))
    }
}

impl From<BinRepr> for Repr {
    fn from(r: BinRepr) -> Self {
        Self::Bin(r)
    }
}
