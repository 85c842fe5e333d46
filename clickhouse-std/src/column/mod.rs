//! Typed in-memory columns and their native wire codecs.
//!
//! A [`Column`] owns the cells of one result or insert column. Columns are created from the
//! server's type names with [`from_type_name`] and expose a uniform cell contract built on
//! [`Value`], so the row-oriented layers never need to know the concrete codec.
mod aggregate;
mod decimal;
mod low_cardinality;
mod nullable;
mod numeric;
mod string;

use std::any::TypeId;
use std::fmt;

use bytes::{Buf, BytesMut};

pub use self::aggregate::{AggregateFunction, AggregateFunctionDD, AggregateState};
pub use self::decimal::DecimalColumn;
pub use self::low_cardinality::LowCardinality;
pub use self::nullable::Nullable;
pub use self::numeric::{Numeric, Primitive};
pub use self::string::{FixedString, StringColumn};
use crate::native::convert::{FromSql, ToSql};
use crate::native::values::Value;
use crate::{Error, Result};

/// The Rust type a column's cells naturally scan into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanType {
    name:     &'static str,
    id:       TypeId,
    nullable: bool,
}

impl ScanType {
    pub fn of<T: 'static>() -> Self {
        Self { name: std::any::type_name::<T>(), id: TypeId::of::<T>(), nullable: false }
    }

    /// The same type behind an optional indirection.
    #[must_use]
    pub fn into_nullable(self) -> Self { Self { nullable: true, ..self } }

    pub fn name(&self) -> &'static str { self.name }

    pub fn id(&self) -> TypeId { self.id }

    pub fn is_nullable(&self) -> bool { self.nullable }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable { write!(f, "Option<{}>", self.name) } else { write!(f, "{}", self.name) }
    }
}

/// The codec contract every column type implements.
///
/// Appends are all-or-nothing: a rejected value leaves the column untouched.
pub trait Column: fmt::Debug + Send + Sync {
    /// Column name as reported by the server.
    fn name(&self) -> &str;

    /// The server's type name, verbatim.
    fn declared_type(&self) -> &str;

    fn rows(&self) -> usize;

    /// Drops all cells, keeping the column's name and type.
    fn reset(&mut self);

    fn scan_type(&self) -> ScanType;

    /// The cell at `row`.
    ///
    /// `indirect` asks for the cell as seen through an optional indirection: nullable columns
    /// report `NULL` as [`Value::Null`] only when it is set, and a base placeholder otherwise.
    ///
    /// # Errors
    /// [`Error::OutOfBounds`] when `row >= self.rows()`.
    fn row(&self, row: usize, indirect: bool) -> Result<Value>;

    /// Checks that `value` would be accepted by [`Column::append_row`].
    ///
    /// # Errors
    /// [`Error::UnexpectedType`] for shapes outside the column's accepted set.
    fn check_value(&self, value: &Value) -> Result<()>;

    /// Appends one cell.
    ///
    /// # Errors
    /// See [`Column::check_value`].
    fn append_row(&mut self, value: Value) -> Result<()>;

    /// Appends the type's zero value.
    fn append_default(&mut self);

    /// Appends every value or none of them.
    ///
    /// # Errors
    /// The first rejected value's error.
    fn append(&mut self, values: Vec<Value>) -> Result<()> {
        values.iter().try_for_each(|value| self.check_value(value))?;
        for value in values {
            self.append_row(value)?;
        }
        Ok(())
    }

    /// Reads `rows` cells in the native layout, appending them.
    ///
    /// # Errors
    /// [`Error::UnexpectedEof`] on short input, [`Error::Protocol`] on malformed input.
    fn decode(&mut self, reader: &mut dyn Buf, rows: usize) -> Result<()>;

    /// Writes all cells in the native layout.
    fn encode(&self, writer: &mut BytesMut);

    fn nullable(&self) -> bool { false }

    /// `(precision, scale)` for fixed-point columns.
    fn precision_scale(&self) -> Option<(u8, u8)> { None }

    /// The wrapped column of a wrapper type such as `Nullable`.
    fn base(&self) -> Option<&dyn Column> { None }
}

impl dyn Column + '_ {
    /// Converts the cell at `row` into `dest`.
    ///
    /// Destinations that can hold `NULL` (`Option<T>`, [`Value`]) receive the cell through its
    /// indirection.
    ///
    /// # Errors
    /// [`Error::UnexpectedType`] when the cell cannot be scanned into `T`.
    pub fn scan_row<T: FromSql>(&self, dest: &mut T, row: usize) -> Result<()> {
        let value = self.row(row, T::accepts_null())?;
        *dest = T::from_sql(self.declared_type(), value)?;
        Ok(())
    }

    /// Converts and appends a homogeneous array of values, all or nothing.
    ///
    /// # Errors
    /// The first value that fails conversion or is rejected by the column.
    pub fn append_typed<T: ToSql>(&mut self, values: impl IntoIterator<Item = T>) -> Result<()> {
        let values = values.into_iter().map(ToSql::to_sql).collect::<Result<Vec<_>>>()?;
        self.append(values)
    }
}

pub(crate) fn out_of_bounds(index: usize, len: usize) -> Error { Error::OutOfBounds { index, len } }

/// Returns the arguments of `prefix(...)`, or `None` when `type_name` is not of that form.
pub(crate) fn type_args<'a>(type_name: &'a str, prefix: &str) -> Option<&'a str> {
    type_name.strip_prefix(prefix)?.strip_prefix('(')?.strip_suffix(')').map(str::trim)
}

/// Splits comma separated arguments at the top level, ignoring commas nested in parentheses or
/// quotes.
pub(crate) fn split_args(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let (mut depth, mut quoted, mut start) = (0usize, false, 0);
    let mut chars = args.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' if quoted => {
                let _ = chars.next();
            }
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                parts.push(args[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = args[start..].trim();
    if !last.is_empty() || !parts.is_empty() {
        parts.push(last);
    }
    parts
}

fn unsupported(type_name: &str) -> Error { Error::UnsupportedType(type_name.to_string()) }

/// Creates an empty column for the server type `type_name`.
///
/// # Errors
/// [`Error::UnsupportedType`] for types without a codec.
pub fn from_type_name(name: &str, type_name: &str) -> Result<Box<dyn Column>> {
    let type_name = type_name.trim();
    Ok(match type_name {
        "Int8" => Box::new(Numeric::<i8>::new(name, type_name)),
        "Int16" => Box::new(Numeric::<i16>::new(name, type_name)),
        "Int32" => Box::new(Numeric::<i32>::new(name, type_name)),
        "Int64" => Box::new(Numeric::<i64>::new(name, type_name)),
        "UInt8" => Box::new(Numeric::<u8>::new(name, type_name)),
        "UInt16" | "Date" => Box::new(Numeric::<u16>::new(name, type_name)),
        "UInt32" => Box::new(Numeric::<u32>::new(name, type_name)),
        "UInt64" => Box::new(Numeric::<u64>::new(name, type_name)),
        "Float32" => Box::new(Numeric::<f32>::new(name, type_name)),
        "Float64" => Box::new(Numeric::<f64>::new(name, type_name)),
        "Bool" => Box::new(Numeric::<bool>::new(name, type_name)),
        "String" => Box::new(StringColumn::new(name, type_name)),
        t if t == "DateTime" || t.starts_with("DateTime(") => {
            Box::new(Numeric::<u32>::new(name, type_name))
        }
        t if t.starts_with("Enum8(") => Box::new(Numeric::<i8>::new(name, type_name)),
        t if t.starts_with("Enum16(") => Box::new(Numeric::<i16>::new(name, type_name)),
        t => {
            if let Some(inner) = type_args(t, "Nullable") {
                Box::new(Nullable::new(type_name, from_type_name(name, inner)?))
            } else if let Some(inner) = type_args(t, "LowCardinality") {
                Box::new(LowCardinality::new(name, type_name, inner)?)
            } else if let Some(n) = type_args(t, "FixedString") {
                let n = n.parse::<usize>().map_err(|_| unsupported(type_name))?;
                Box::new(FixedString::new(name, type_name, n))
            } else if t.starts_with("Decimal") {
                Box::new(DecimalColumn::from_type_name(name, type_name)?)
            } else if let Some(args) = type_args(t, "AggregateFunction") {
                aggregate::from_type_args(name, type_name, args)?
            } else {
                return Err(unsupported(type_name));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::values::Decimal;

    #[test]
    fn test_split_args() {
        assert_eq!(split_args("quantileDD(0.01, 0.5), Float64"), vec![
            "quantileDD(0.01, 0.5)",
            "Float64"
        ]);
        assert_eq!(split_args("'a,b' = 1, 'c' = 2"), vec!["'a,b' = 1", "'c' = 2"]);
        assert_eq!(split_args(""), Vec::<&str>::new());
        assert_eq!(type_args("Nullable(Int8)", "Nullable"), Some("Int8"));
        assert_eq!(type_args("NullableX(Int8)", "Nullable"), None);
    }

    #[test]
    fn test_factory_preserves_type_names() {
        for type_name in [
            "Int8",
            "UInt64",
            "Float32",
            "Bool",
            "Date",
            "DateTime('Europe/Amsterdam')",
            "Enum8('a' = 1, 'b' = 2)",
            "String",
            "FixedString(4)",
            "Decimal(18, 4)",
            "Decimal32(2)",
            "Nullable(Decimal(9, 2))",
            "LowCardinality(Nullable(String))",
            "AggregateFunction(quantileDD(0.01, 0.5), Float64)",
        ] {
            let column = from_type_name("c", type_name).unwrap();
            assert_eq!(column.declared_type(), type_name);
            assert_eq!(column.name(), "c");
            assert_eq!(column.rows(), 0);
        }
    }

    #[test]
    fn test_unsupported_types() {
        for type_name in ["Array(Int8)", "Map(String, UInt8)", "UUID", "AggregateFunction(sum, Int8)"] {
            assert!(matches!(from_type_name("c", type_name), Err(Error::UnsupportedType(_))));
        }
    }

    #[test]
    fn test_scan_row_through_indirection() {
        let mut column = from_type_name("n", "Nullable(Int32)").unwrap();
        column.append_typed([Some(5), None]).unwrap();

        let mut plain = 0i32;
        column.scan_row(&mut plain, 0).unwrap();
        assert_eq!(plain, 5);

        let mut optional = Some(1i32);
        column.scan_row(&mut optional, 1).unwrap();
        assert_eq!(optional, None);

        let mut wrong = String::new();
        assert!(matches!(column.scan_row(&mut wrong, 0), Err(Error::UnexpectedType { .. })));
        assert!(matches!(column.scan_row(&mut plain, 2), Err(Error::OutOfBounds { .. })));
    }

    #[test]
    fn test_append_is_all_or_nothing() {
        let mut column = from_type_name("d", "Decimal(5, 2)").unwrap();
        let err = column.append(vec![
            Value::Decimal(Decimal::new(1, 0)),
            Value::Decimal(Decimal::new(1_000_000, 0)),
        ]);
        assert!(err.is_err());
        assert_eq!(column.rows(), 0);
        assert_eq!(column.precision_scale(), Some((5, 2)));
    }
}
