use std::fmt;

use super::sketch::DDSketch;
use crate::{Error, Result};

/// A single cell, as produced by a column's `row` and accepted by its `append_row`.
///
/// The set of shapes is closed: every column documents which variants it accepts and rejects the
/// rest with [`Error::UnexpectedType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    /// Raw bytes. `ClickHouse` strings are not required to be valid UTF-8.
    String(Vec<u8>),
    Decimal(Decimal),
    /// An opaque aggregate function state.
    Sketch(Box<DDSketch>),
}

impl Value {
    /// Short name of the variant, used in conversion errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int8(_) => "Int8",
            Value::Int16(_) => "Int16",
            Value::Int32(_) => "Int32",
            Value::Int64(_) => "Int64",
            Value::UInt8(_) => "UInt8",
            Value::UInt16(_) => "UInt16",
            Value::UInt32(_) => "UInt32",
            Value::UInt64(_) => "UInt64",
            Value::Float32(_) => "Float32",
            Value::Float64(_) => "Float64",
            Value::String(_) => "String",
            Value::Decimal(_) => "Decimal",
            Value::Sketch(_) => "DDSketch",
        }
    }

    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }

    /// Widens any integer variant to `i128`.
    pub(crate) fn as_i128(&self) -> Option<i128> {
        Some(match *self {
            Value::Int8(v) => v.into(),
            Value::Int16(v) => v.into(),
            Value::Int32(v) => v.into(),
            Value::Int64(v) => v.into(),
            Value::UInt8(v) => v.into(),
            Value::UInt16(v) => v.into(),
            Value::UInt32(v) => v.into(),
            Value::UInt64(v) => v.into(),
            _ => return None,
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt8(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Float32(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{}", String::from_utf8_lossy(v)),
            Value::Decimal(v) => write!(f, "{v}"),
            Value::Sketch(v) => write!(f, "{v:?}"),
        }
    }
}

/// A fixed-point number: `mantissa * 10^-scale`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Decimal {
    mantissa: i128,
    scale:    u8,
}

/// Largest precision a `Decimal128` can carry.
pub(crate) const MAX_DECIMAL_PRECISION: u8 = 38;

impl Decimal {
    pub const fn new(mantissa: i128, scale: u8) -> Self { Self { mantissa, scale } }

    pub const fn mantissa(&self) -> i128 { self.mantissa }

    pub const fn scale(&self) -> u8 { self.scale }

    /// Re-expresses the value with `scale` fractional digits.
    ///
    /// Fails when digits would be lost or the mantissa would overflow.
    pub fn rescale(self, scale: u8) -> Result<Self> {
        let lossy = || Error::Bind(format!("cannot represent {self} with scale {scale}"));
        if scale == self.scale {
            return Ok(self);
        }
        if scale > self.scale {
            let factor = 10i128.checked_pow(u32::from(scale - self.scale)).ok_or_else(lossy)?;
            let mantissa = self.mantissa.checked_mul(factor).ok_or_else(lossy)?;
            return Ok(Self { mantissa, scale });
        }
        let factor = 10i128.checked_pow(u32::from(self.scale - scale)).ok_or_else(lossy)?;
        if self.mantissa % factor != 0 {
            return Err(lossy());
        }
        Ok(Self { mantissa: self.mantissa / factor, scale })
    }

    /// Number of significant decimal digits in the mantissa.
    pub fn digits(&self) -> u8 {
        let mut m = self.mantissa.unsigned_abs();
        let mut digits = 1;
        while m >= 10 {
            m /= 10;
            digits += 1;
        }
        digits
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let digits = self.mantissa.unsigned_abs().to_string();
        let scale = usize::from(self.scale);
        let padded = format!("{digits:0>width$}", width = scale + 1);
        let (int, frac) = padded.split_at(padded.len() - scale);
        write!(f, "{sign}{int}.{frac}")
    }
}

impl std::str::FromStr for Decimal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Bind(format!("invalid decimal literal: {s}"));
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int, frac) = body.split_once('.').unwrap_or((body, ""));
        if int.is_empty() && frac.is_empty() {
            return Err(invalid());
        }
        if !int.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let scale = u8::try_from(frac.len()).map_err(|_| invalid())?;
        let mantissa = format!("{int}{frac}").parse::<i128>().map_err(|_| invalid())?;
        Ok(Self { mantissa: if negative { -mantissa } else { mantissa }, scale })
    }
}
