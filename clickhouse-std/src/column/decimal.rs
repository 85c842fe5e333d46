use bytes::{Buf, BufMut, BytesMut};

use super::{Column, ScanType, out_of_bounds, split_args, type_args};
use crate::errors::unexpected_type;
use crate::io::ClickHouseBytesRead;
use crate::native::values::{Decimal, MAX_DECIMAL_PRECISION, Value};
use crate::{Error, Result};

/// `Decimal(P, S)` and its `Decimal32/64/128(S)` aliases.
///
/// Cells are mantissas stored as 4, 8 or 16 byte little-endian integers depending on `P`.
#[derive(Debug, Clone)]
pub struct DecimalColumn {
    name:      String,
    type_name: String,
    precision: u8,
    scale:     u8,
    data:      Vec<i128>,
}

impl DecimalColumn {
    /// # Errors
    /// [`Error::UnsupportedType`] when the type name does not describe a valid decimal.
    pub fn from_type_name(name: &str, type_name: &str) -> Result<Self> {
        let unsupported = || Error::UnsupportedType(type_name.to_string());
        let parse = |s: &str| s.trim().parse::<u8>().map_err(|_| unsupported());

        let (precision, scale) = if let Some(args) = type_args(type_name, "Decimal") {
            match split_args(args).as_slice() {
                [p, s] => (parse(*p)?, parse(*s)?),
                [p] => (parse(*p)?, 0),
                _ => return Err(unsupported()),
            }
        } else if let Some(s) = type_args(type_name, "Decimal32") {
            (9, parse(s)?)
        } else if let Some(s) = type_args(type_name, "Decimal64") {
            (18, parse(s)?)
        } else if let Some(s) = type_args(type_name, "Decimal128") {
            (MAX_DECIMAL_PRECISION, parse(s)?)
        } else {
            return Err(unsupported());
        };

        if precision == 0 || precision > MAX_DECIMAL_PRECISION || scale > precision {
            return Err(unsupported());
        }

        Ok(Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            precision,
            scale,
            data: Vec::new(),
        })
    }

    fn width(&self) -> usize {
        match self.precision {
            0..=9 => 4,
            10..=18 => 8,
            _ => 16,
        }
    }

    /// Rescales the value to the column's scale and checks it fits the precision.
    fn accept(&self, value: &Value) -> Result<i128> {
        let decimal = match value {
            Value::Decimal(d) => *d,
            v => match v.as_i128() {
                Some(i) => Decimal::new(i, 0),
                None => return Err(unexpected_type(v.kind(), &self.type_name)),
            },
        };
        let rescaled = decimal
            .rescale(self.scale)
            .map_err(|_| unexpected_type(decimal.to_string(), &self.type_name))?;
        if rescaled.digits() > self.precision {
            return Err(unexpected_type(decimal.to_string(), &self.type_name));
        }
        Ok(rescaled.mantissa())
    }
}

impl Column for DecimalColumn {
    fn name(&self) -> &str { &self.name }

    fn declared_type(&self) -> &str { &self.type_name }

    fn rows(&self) -> usize { self.data.len() }

    fn reset(&mut self) { self.data.clear(); }

    fn scan_type(&self) -> ScanType { ScanType::of::<Decimal>() }

    fn row(&self, row: usize, _indirect: bool) -> Result<Value> {
        self.data
            .get(row)
            .map(|m| Value::Decimal(Decimal::new(*m, self.scale)))
            .ok_or_else(|| out_of_bounds(row, self.data.len()))
    }

    fn check_value(&self, value: &Value) -> Result<()> { self.accept(value).map(|_| ()) }

    fn append_row(&mut self, value: Value) -> Result<()> {
        let mantissa = self.accept(&value)?;
        self.data.push(mantissa);
        Ok(())
    }

    fn append_default(&mut self) { self.data.push(0); }

    fn decode(&mut self, reader: &mut dyn Buf, rows: usize) -> Result<()> {
        let width = self.width();
        reader.ensure(rows * width)?;
        self.data.reserve(rows);
        for _ in 0..rows {
            let mantissa = match width {
                4 => i128::from(reader.get_i32_le()),
                8 => i128::from(reader.get_i64_le()),
                _ => reader.get_i128_le(),
            };
            self.data.push(mantissa);
        }
        Ok(())
    }

    #[expect(clippy::cast_possible_truncation)]
    fn encode(&self, writer: &mut BytesMut) {
        let width = self.width();
        for mantissa in &self.data {
            match width {
                4 => writer.put_i32_le(*mantissa as i32),
                8 => writer.put_i64_le(*mantissa as i64),
                _ => writer.put_i128_le(*mantissa),
            }
        }
    }

    fn precision_scale(&self) -> Option<(u8, u8)> { Some((self.precision, self.scale)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases() {
        let d32 = DecimalColumn::from_type_name("d", "Decimal32(3)").unwrap();
        assert_eq!((d32.precision_scale(), d32.width()), (Some((9, 3)), 4));
        let d64 = DecimalColumn::from_type_name("d", "Decimal(18, 6)").unwrap();
        assert_eq!(d64.width(), 8);
        let d128 = DecimalColumn::from_type_name("d", "Decimal128(10)").unwrap();
        assert_eq!(d128.width(), 16);
        assert!(DecimalColumn::from_type_name("d", "Decimal(3, 5)").is_err());
        assert!(DecimalColumn::from_type_name("d", "Decimal(77, 5)").is_err());
    }

    #[test]
    fn test_decimal_wire_layout() {
        let mut column = DecimalColumn::from_type_name("d", "Decimal(9, 2)").unwrap();
        column.append_row(Value::Decimal(Decimal::new(-125, 2))).unwrap();
        column.append_row(Value::Int32(3)).unwrap();
        let mut buf = BytesMut::new();
        column.encode(&mut buf);
        assert_eq!(buf.len(), 8);

        let mut decoded = DecimalColumn::from_type_name("d", "Decimal(9, 2)").unwrap();
        decoded.decode(&mut &buf[..], 2).unwrap();
        assert_eq!(decoded.row(0, false).unwrap(), Value::Decimal(Decimal::new(-125, 2)));
        assert_eq!(decoded.row(1, false).unwrap().to_string(), "3.00");
    }

    #[test]
    fn test_rejects_lossy_values() {
        let mut column = DecimalColumn::from_type_name("d", "Decimal(9, 2)").unwrap();
        assert!(column.append_row(Value::Decimal(Decimal::new(1, 3))).is_err());
        assert!(column.append_row(Value::Float64(1.0)).is_err());
        assert_eq!(column.rows(), 0);
    }
}
