use std::fmt::Debug;

use bytemuck::Pod;
use bytes::{Buf, BufMut, BytesMut};

use super::{Column, ScanType, out_of_bounds};
use crate::errors::unexpected_type;
use crate::io::ClickHouseBytesRead;
use crate::native::values::Value;
use crate::Result;

/// A fixed-width scalar stored on the wire as its little-endian representation.
pub trait Primitive: Copy + Debug + Default + Send + Sync + 'static {
    /// In-memory and on-wire representation.
    type Repr: Pod + Default + Debug + Send + Sync;

    fn to_repr(self) -> Self::Repr;

    fn from_repr(repr: Self::Repr) -> Self;

    fn into_value(self) -> Value;

    /// Accepts the value when it converts without loss.
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! integer {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Primitive for $ty {
                type Repr = $ty;

                fn to_repr(self) -> Self::Repr { self }

                fn from_repr(repr: Self::Repr) -> Self { repr }

                fn into_value(self) -> Value { Value::$variant(self) }

                fn from_value(value: &Value) -> Option<Self> {
                    value.as_i128().and_then(|v| Self::try_from(v).ok())
                }
            }
        )*
    };
}

integer!(
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
);

impl Primitive for f32 {
    type Repr = f32;

    fn to_repr(self) -> Self::Repr { self }

    fn from_repr(repr: Self::Repr) -> Self { repr }

    fn into_value(self) -> Value { Value::Float32(self) }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float32(v) => Some(*v),
            _ => None,
        }
    }
}

impl Primitive for f64 {
    type Repr = f64;

    fn to_repr(self) -> Self::Repr { self }

    fn from_repr(repr: Self::Repr) -> Self { repr }

    fn into_value(self) -> Value { Value::Float64(self) }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float64(v) => Some(*v),
            Value::Float32(v) => Some(f64::from(*v)),
            _ => None,
        }
    }
}

impl Primitive for bool {
    type Repr = u8;

    fn to_repr(self) -> Self::Repr { u8::from(self) }

    fn from_repr(repr: Self::Repr) -> Self { repr != 0 }

    fn into_value(self) -> Value { Value::Bool(self) }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(v) => Some(*v),
            Value::UInt8(0) => Some(false),
            Value::UInt8(1) => Some(true),
            _ => None,
        }
    }
}

/// Fixed-width numeric column. Also backs `Bool`, `Date`, `DateTime` and `Enum8/16`, whose
/// cells are their underlying integers.
#[derive(Debug, Clone)]
pub struct Numeric<T: Primitive> {
    name:      String,
    type_name: String,
    data:      Vec<T::Repr>,
}

impl<T: Primitive> Numeric<T> {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self { name: name.to_string(), type_name: type_name.to_string(), data: Vec::new() }
    }

    pub fn get(&self, row: usize) -> Option<T> { self.data.get(row).copied().map(T::from_repr) }

    fn accept(&self, value: &Value) -> Result<T> {
        T::from_value(value).ok_or_else(|| unexpected_type(value.kind(), &self.type_name))
    }
}

impl<T: Primitive> Column for Numeric<T> {
    fn name(&self) -> &str { &self.name }

    fn declared_type(&self) -> &str { &self.type_name }

    fn rows(&self) -> usize { self.data.len() }

    fn reset(&mut self) { self.data.clear(); }

    fn scan_type(&self) -> ScanType { ScanType::of::<T>() }

    fn row(&self, row: usize, _indirect: bool) -> Result<Value> {
        self.get(row).map(T::into_value).ok_or_else(|| out_of_bounds(row, self.data.len()))
    }

    fn check_value(&self, value: &Value) -> Result<()> { self.accept(value).map(|_| ()) }

    fn append_row(&mut self, value: Value) -> Result<()> {
        let value = self.accept(&value)?;
        self.data.push(value.to_repr());
        Ok(())
    }

    fn append_default(&mut self) { self.data.push(T::Repr::default()); }

    fn append(&mut self, values: Vec<Value>) -> Result<()> {
        let values = values.iter().map(|v| self.accept(v)).collect::<Result<Vec<_>>>()?;
        self.data.extend(values.into_iter().map(T::to_repr));
        Ok(())
    }

    fn decode(&mut self, reader: &mut dyn Buf, rows: usize) -> Result<()> {
        let width = size_of::<T::Repr>();
        let bytes = reader.try_get_bytes(rows * width)?;
        // Native column layout is little-endian
        self.data.extend(bytes.chunks_exact(width).map(bytemuck::pod_read_unaligned::<T::Repr>));
        Ok(())
    }

    fn encode(&self, writer: &mut BytesMut) {
        writer.put_slice(bytemuck::cast_slice(&self.data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_numeric_wire_layout() {
        let mut column = Numeric::<i32>::new("x", "Int32");
        column.append(vec![Value::Int32(1), Value::Int32(-2)]).unwrap();
        let mut buf = BytesMut::new();
        column.encode(&mut buf);
        assert_eq!(&buf[..], &[1, 0, 0, 0, 0xFE, 0xFF, 0xFF, 0xFF]);

        let mut decoded = Numeric::<i32>::new("x", "Int32");
        decoded.decode(&mut &buf[..], 2).unwrap();
        assert_eq!(decoded.get(1), Some(-2));
    }

    #[test]
    fn test_lossless_integer_widening() {
        let mut column = Numeric::<u8>::new("x", "UInt8");
        column.append_row(Value::Int64(200)).unwrap();
        assert!(matches!(column.append_row(Value::Int64(-1)), Err(Error::UnexpectedType { .. })));
        assert!(column.append_row(Value::Float64(1.0)).is_err());
        assert_eq!(column.row(0, false).unwrap(), Value::UInt8(200));
        assert_eq!(column.rows(), 1);
    }

    #[test]
    fn test_bool_column() {
        let mut column = Numeric::<bool>::new("b", "Bool");
        column.append(vec![Value::Bool(true), Value::UInt8(0)]).unwrap();
        let mut buf = BytesMut::new();
        column.encode(&mut buf);
        assert_eq!(&buf[..], &[1, 0]);
        assert_eq!(column.row(1, false).unwrap(), Value::Bool(false));
        assert_eq!(column.scan_type(), ScanType::of::<bool>());
    }

    #[test]
    fn test_decode_short_input() {
        let mut column = Numeric::<u64>::new("x", "UInt64");
        assert!(matches!(column.decode(&mut &[0u8; 12][..], 2), Err(Error::UnexpectedEof)));
        assert!(matches!(column.row(0, false), Err(Error::OutOfBounds { index: 0, len: 0 })));
    }
}
