//! Conversions between Rust types and [`Value`] cells.
//!
//! Conversions are strict: a column of `Int32` only scans into `i32`, `Option<i32>` or
//! `Box<i32>`. This mirrors the closed set of shapes each column accepts on append.
use super::sketch::DDSketch;
use super::values::{Decimal, Value};
use crate::errors::unexpected_type;
use crate::Result;

/// A type that can be converted into a cell.
pub trait ToSql {
    /// # Errors
    fn to_sql(self) -> Result<Value>;
}

/// A type that can be converted from a cell of the column type named `type_name`.
pub trait FromSql: Sized {
    /// # Errors
    /// [`crate::Error::UnexpectedType`] when the cell's shape does not match `Self`.
    fn from_sql(type_name: &str, value: Value) -> Result<Self>;

    /// Whether the type can hold `NULL`. Used to pick the indirection when scanning.
    fn accepts_null() -> bool { false }
}

impl ToSql for Value {
    fn to_sql(self) -> Result<Value> { Ok(self) }
}

impl FromSql for Value {
    fn from_sql(_type_name: &str, value: Value) -> Result<Self> { Ok(value) }

    fn accepts_null() -> bool { true }
}

macro_rules! scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl ToSql for $ty {
                fn to_sql(self) -> Result<Value> { Ok(Value::$variant(self)) }
            }

            impl FromSql for $ty {
                fn from_sql(type_name: &str, value: Value) -> Result<Self> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        _ => Err(unexpected_type(type_name, stringify!($ty))),
                    }
                }
            }
        )*
    };
}

scalar!(
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
    Decimal => Decimal,
);

impl ToSql for String {
    fn to_sql(self) -> Result<Value> { Ok(Value::String(self.into_bytes())) }
}

impl ToSql for &str {
    fn to_sql(self) -> Result<Value> { Ok(Value::String(self.as_bytes().to_vec())) }
}

impl ToSql for Vec<u8> {
    fn to_sql(self) -> Result<Value> { Ok(Value::String(self)) }
}

impl ToSql for &[u8] {
    fn to_sql(self) -> Result<Value> { Ok(Value::String(self.to_vec())) }
}

impl FromSql for String {
    fn from_sql(type_name: &str, value: Value) -> Result<Self> {
        match value {
            Value::String(bytes) => {
                String::from_utf8(bytes).map_err(|_| unexpected_type(type_name, "String (utf-8)"))
            }
            _ => Err(unexpected_type(type_name, "String")),
        }
    }
}

impl FromSql for Vec<u8> {
    fn from_sql(type_name: &str, value: Value) -> Result<Self> {
        match value {
            Value::String(bytes) => Ok(bytes),
            _ => Err(unexpected_type(type_name, "Vec<u8>")),
        }
    }
}

impl ToSql for DDSketch {
    fn to_sql(self) -> Result<Value> { Ok(Value::Sketch(Box::new(self))) }
}

impl ToSql for &DDSketch {
    fn to_sql(self) -> Result<Value> { Ok(Value::Sketch(Box::new(self.clone()))) }
}

impl FromSql for DDSketch {
    fn from_sql(type_name: &str, value: Value) -> Result<Self> {
        match value {
            Value::Sketch(sketch) => Ok(*sketch),
            _ => Err(unexpected_type(type_name, "DDSketch")),
        }
    }
}

impl<T: ToSql> ToSql for Option<T> {
    fn to_sql(self) -> Result<Value> {
        match self {
            Some(value) => value.to_sql(),
            None => Ok(Value::Null),
        }
    }
}

impl<T: FromSql> FromSql for Option<T> {
    fn from_sql(type_name: &str, value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            value => T::from_sql(type_name, value).map(Some),
        }
    }

    fn accepts_null() -> bool { true }
}

impl<T: ToSql> ToSql for Box<T> {
    fn to_sql(self) -> Result<Value> { (*self).to_sql() }
}

impl<T: FromSql> FromSql for Box<T> {
    fn from_sql(type_name: &str, value: Value) -> Result<Self> {
        T::from_sql(type_name, value).map(Box::new)
    }

    fn accepts_null() -> bool { T::accepts_null() }
}

/// A row of cells destined for a batch.
pub trait ToRow {
    /// # Errors
    fn to_row(self) -> Result<Vec<Value>>;
}

impl ToRow for Vec<Value> {
    fn to_row(self) -> Result<Vec<Value>> { Ok(self) }
}

macro_rules! tuple_row {
    ($($name:ident),+) => {
        impl<$($name: ToSql),+> ToRow for ($($name,)+) {
            #[allow(non_snake_case)]
            fn to_row(self) -> Result<Vec<Value>> {
                let ($($name,)+) = self;
                Ok(vec![$($name.to_sql()?),+])
            }
        }
    };
}

tuple_row!(A);
tuple_row!(A, B);
tuple_row!(A, B, C);
tuple_row!(A, B, C, D);
tuple_row!(A, B, C, D, E);
tuple_row!(A, B, C, D, E, F);
tuple_row!(A, B, C, D, E, F, G);
tuple_row!(A, B, C, D, E, F, G, H);
