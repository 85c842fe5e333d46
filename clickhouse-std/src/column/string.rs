use bytes::{Buf, BufMut, BytesMut};

use super::{Column, ScanType, out_of_bounds};
use crate::errors::unexpected_type;
use crate::io::{ClickHouseBytesRead, ClickHouseBytesWrite};
use crate::native::values::Value;
use crate::{Error, Result};

/// Variable length `String`: each cell is a var_uint length followed by raw bytes.
#[derive(Debug, Clone, Default)]
pub struct StringColumn {
    name:      String,
    type_name: String,
    data:      Vec<Vec<u8>>,
}

impl StringColumn {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self { name: name.to_string(), type_name: type_name.to_string(), data: Vec::new() }
    }

    pub fn get(&self, row: usize) -> Option<&[u8]> { self.data.get(row).map(Vec::as_slice) }
}

fn string_bytes<'a>(value: &'a Value, type_name: &str) -> Result<&'a [u8]> {
    match value {
        Value::String(bytes) => Ok(bytes),
        _ => Err(unexpected_type(value.kind(), type_name)),
    }
}

impl Column for StringColumn {
    fn name(&self) -> &str { &self.name }

    fn declared_type(&self) -> &str { &self.type_name }

    fn rows(&self) -> usize { self.data.len() }

    fn reset(&mut self) { self.data.clear(); }

    fn scan_type(&self) -> ScanType { ScanType::of::<String>() }

    fn row(&self, row: usize, _indirect: bool) -> Result<Value> {
        self.data
            .get(row)
            .map(|bytes| Value::String(bytes.clone()))
            .ok_or_else(|| out_of_bounds(row, self.data.len()))
    }

    fn check_value(&self, value: &Value) -> Result<()> {
        string_bytes(value, &self.type_name).map(|_| ())
    }

    fn append_row(&mut self, value: Value) -> Result<()> {
        match value {
            Value::String(bytes) => {
                self.data.push(bytes);
                Ok(())
            }
            value => Err(unexpected_type(value.kind(), &self.type_name)),
        }
    }

    fn append_default(&mut self) { self.data.push(Vec::new()); }

    fn decode(&mut self, reader: &mut dyn Buf, rows: usize) -> Result<()> {
        self.data.reserve(rows);
        for _ in 0..rows {
            self.data.push(reader.try_get_string()?.to_vec());
        }
        Ok(())
    }

    fn encode(&self, writer: &mut BytesMut) {
        for value in &self.data {
            writer.put_string(value);
        }
    }
}

/// `FixedString(N)`: every cell is exactly `N` bytes, zero padded on append.
#[derive(Debug, Clone, Default)]
pub struct FixedString {
    name:      String,
    type_name: String,
    n:         usize,
    data:      Vec<u8>,
}

impl FixedString {
    pub fn new(name: &str, type_name: &str, n: usize) -> Self {
        Self { name: name.to_string(), type_name: type_name.to_string(), n, data: Vec::new() }
    }

    pub fn get(&self, row: usize) -> Option<&[u8]> {
        let start = row.checked_mul(self.n)?;
        self.data.get(start..start + self.n)
    }

    fn accept<'a>(&self, value: &'a Value) -> Result<&'a [u8]> {
        let bytes = string_bytes(value, &self.type_name)?;
        if bytes.len() > self.n {
            return Err(Error::UnexpectedType {
                from: format!("String of length {}", bytes.len()),
                to:   self.type_name.clone(),
            });
        }
        Ok(bytes)
    }
}

impl Column for FixedString {
    fn name(&self) -> &str { &self.name }

    fn declared_type(&self) -> &str { &self.type_name }

    fn rows(&self) -> usize { if self.n == 0 { 0 } else { self.data.len() / self.n } }

    fn reset(&mut self) { self.data.clear(); }

    fn scan_type(&self) -> ScanType { ScanType::of::<Vec<u8>>() }

    fn row(&self, row: usize, _indirect: bool) -> Result<Value> {
        self.get(row)
            .map(|bytes| Value::String(bytes.to_vec()))
            .ok_or_else(|| out_of_bounds(row, self.rows()))
    }

    fn check_value(&self, value: &Value) -> Result<()> { self.accept(value).map(|_| ()) }

    fn append_row(&mut self, value: Value) -> Result<()> {
        let bytes = self.accept(&value)?;
        self.data.extend_from_slice(bytes);
        self.data.resize(self.data.len() + self.n - bytes.len(), 0);
        Ok(())
    }

    fn append_default(&mut self) { self.data.resize(self.data.len() + self.n, 0); }

    fn decode(&mut self, reader: &mut dyn Buf, rows: usize) -> Result<()> {
        let bytes = reader.try_get_bytes(rows * self.n)?;
        self.data.extend_from_slice(&bytes);
        Ok(())
    }

    fn encode(&self, writer: &mut BytesMut) { writer.put_slice(&self.data); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_column_wire_layout() {
        let mut column = StringColumn::new("s", "String");
        column.append(vec![Value::String(b"ab".to_vec()), Value::String(vec![0xFF])]).unwrap();
        let mut buf = BytesMut::new();
        column.encode(&mut buf);
        assert_eq!(&buf[..], &[2, b'a', b'b', 1, 0xFF]);

        let mut decoded = StringColumn::new("s", "String");
        decoded.decode(&mut &buf[..], 2).unwrap();
        assert_eq!(decoded.get(1), Some(&[0xFF][..]));
        assert!(decoded.append_row(Value::Int8(1)).is_err());
    }

    #[test]
    fn test_fixed_string_pads_and_rejects_overflow() {
        let mut column = FixedString::new("f", "FixedString(3)", 3);
        column.append_row(Value::String(b"a".to_vec())).unwrap();
        assert!(column.append_row(Value::String(b"abcd".to_vec())).is_err());
        assert_eq!(column.rows(), 1);
        assert_eq!(column.row(0, false).unwrap(), Value::String(vec![b'a', 0, 0]));

        let mut buf = BytesMut::new();
        column.encode(&mut buf);
        let mut decoded = FixedString::new("f", "FixedString(3)", 3);
        decoded.decode(&mut &buf[..], 1).unwrap();
        assert_eq!(decoded.get(0), column.get(0));
    }
}
