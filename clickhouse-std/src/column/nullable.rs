use bytes::{Buf, BufMut, BytesMut};

use super::{Column, ScanType, out_of_bounds};
use crate::io::ClickHouseBytesRead;
use crate::native::values::Value;
use crate::Result;

/// `Nullable(T)`: a null map of one byte per row followed by the base column.
///
/// Null rows hold the base type's zero value so the base column stays aligned.
#[derive(Debug)]
pub struct Nullable {
    type_name: String,
    nulls:     Vec<u8>,
    base:      Box<dyn Column>,
}

impl Nullable {
    pub fn new(type_name: &str, base: Box<dyn Column>) -> Self {
        Self { type_name: type_name.to_string(), nulls: Vec::new(), base }
    }

    pub fn is_null(&self, row: usize) -> Option<bool> { self.nulls.get(row).map(|n| *n != 0) }
}

impl Column for Nullable {
    fn name(&self) -> &str { self.base.name() }

    fn declared_type(&self) -> &str { &self.type_name }

    fn rows(&self) -> usize { self.nulls.len() }

    fn reset(&mut self) {
        self.nulls.clear();
        self.base.reset();
    }

    fn scan_type(&self) -> ScanType { self.base.scan_type().into_nullable() }

    fn row(&self, row: usize, indirect: bool) -> Result<Value> {
        match self.is_null(row) {
            None => Err(out_of_bounds(row, self.nulls.len())),
            Some(true) if indirect => Ok(Value::Null),
            Some(_) => self.base.row(row, false),
        }
    }

    fn check_value(&self, value: &Value) -> Result<()> {
        if value.is_null() { Ok(()) } else { self.base.check_value(value) }
    }

    fn append_row(&mut self, value: Value) -> Result<()> {
        if value.is_null() {
            self.append_default();
            return Ok(());
        }
        self.base.append_row(value)?;
        self.nulls.push(0);
        Ok(())
    }

    fn append_default(&mut self) {
        self.base.append_default();
        self.nulls.push(1);
    }

    fn decode(&mut self, reader: &mut dyn Buf, rows: usize) -> Result<()> {
        let nulls = reader.try_get_bytes(rows)?;
        self.base.decode(reader, rows)?;
        self.nulls.extend_from_slice(&nulls);
        Ok(())
    }

    fn encode(&self, writer: &mut BytesMut) {
        writer.put_slice(&self.nulls);
        self.base.encode(writer);
    }

    fn nullable(&self) -> bool { true }

    fn precision_scale(&self) -> Option<(u8, u8)> { self.base.precision_scale() }

    fn base(&self) -> Option<&dyn Column> { Some(self.base.as_ref()) }
}
