use bytes::{Buf, BufMut, BytesMut};

use super::{Column, ScanType, from_type_name, type_args};
use crate::io::ClickHouseBytesRead;
use crate::native::values::Value;
use crate::{Error, Result};

const SHARED_DICTIONARIES_WITH_ADDITIONAL_KEYS: u64 = 1;

const KEY_TYPE_MASK: u64 = 0xFF;
const NEED_GLOBAL_DICTIONARY: u64 = 1 << 8;
const HAS_ADDITIONAL_KEYS: u64 = 1 << 9;
const NEED_UPDATE_DICTIONARY: u64 = 1 << 10;

const KEY_UINT8: u64 = 0;
const KEY_UINT16: u64 = 1;
const KEY_UINT32: u64 = 2;
const KEY_UINT64: u64 = 3;

/// `LowCardinality(T)`: dictionary encoded on the wire, materialized in memory.
///
/// Cells are held in a plain column of `T`, so reads and appends behave exactly as for `T`. On
/// encode every row becomes its own dictionary entry. For `LowCardinality(Nullable(T))` the
/// dictionary holds the non-nullable `T` and key `0` stands for `NULL`.
#[derive(Debug)]
pub struct LowCardinality {
    type_name: String,
    inner:     Box<dyn Column>,
    /// One default cell of the dictionary type, present for nullable dictionaries.
    null_slot: Option<Box<dyn Column>>,
}

impl LowCardinality {
    /// # Errors
    /// [`Error::UnsupportedType`] when `inner` has no codec.
    pub fn new(name: &str, type_name: &str, inner: &str) -> Result<Self> {
        let null_slot = match type_args(inner, "Nullable") {
            Some(base) => {
                let mut slot = from_type_name(name, base)?;
                slot.append_default();
                Some(slot)
            }
            None => None,
        };
        Ok(Self { type_name: type_name.to_string(), inner: from_type_name(name, inner)?, null_slot })
    }

    fn dictionary_type(&self) -> &str {
        let inner = self.inner.declared_type();
        type_args(inner, "Nullable").unwrap_or(inner)
    }

    fn is_nullable(&self) -> bool { self.null_slot.is_some() }

    fn read_keys(reader: &mut dyn Buf, key_type: u64, rows: usize) -> Result<Vec<u64>> {
        let width = match key_type {
            KEY_UINT8 => 1,
            KEY_UINT16 => 2,
            KEY_UINT32 => 4,
            KEY_UINT64 => 8,
            other => {
                return Err(Error::Protocol(format!("invalid low cardinality key type {other}")));
            }
        };
        reader.ensure(rows * width)?;
        Ok((0..rows).map(|_| reader.get_uint_le(width)).collect())
    }
}

impl Column for LowCardinality {
    fn name(&self) -> &str { self.inner.name() }

    fn declared_type(&self) -> &str { &self.type_name }

    fn rows(&self) -> usize { self.inner.rows() }

    fn reset(&mut self) { self.inner.reset(); }

    fn scan_type(&self) -> ScanType { self.inner.scan_type() }

    fn row(&self, row: usize, indirect: bool) -> Result<Value> { self.inner.row(row, indirect) }

    fn check_value(&self, value: &Value) -> Result<()> { self.inner.check_value(value) }

    fn append_row(&mut self, value: Value) -> Result<()> { self.inner.append_row(value) }

    fn append_default(&mut self) { self.inner.append_default(); }

    fn decode(&mut self, reader: &mut dyn Buf, rows: usize) -> Result<()> {
        let version = reader.try_read_u64_le()?;
        if version != SHARED_DICTIONARIES_WITH_ADDITIONAL_KEYS {
            return Err(Error::Protocol(format!("unsupported low cardinality version {version}")));
        }

        let mut dictionary = from_type_name(self.name(), self.dictionary_type())?;
        let mut read = 0;
        while read < rows {
            let flags = reader.try_read_u64_le()?;
            if flags & NEED_GLOBAL_DICTIONARY != 0 {
                return Err(Error::Protocol("global low cardinality dictionaries".into()));
            }
            if flags & HAS_ADDITIONAL_KEYS != 0 {
                if flags & NEED_UPDATE_DICTIONARY != 0 {
                    dictionary.reset();
                }
                let size = usize::try_from(reader.try_read_u64_le()?)
                    .map_err(|_| Error::Protocol("dictionary too large".into()))?;
                dictionary.decode(reader, size)?;
            }

            let count = usize::try_from(reader.try_read_u64_le()?)
                .map_err(|_| Error::Protocol("too many low cardinality keys".into()))?;
            if count > rows - read {
                return Err(Error::Protocol(format!("{count} keys exceed {rows} rows")));
            }
            for key in Self::read_keys(reader, flags & KEY_TYPE_MASK, count)? {
                #[expect(clippy::cast_possible_truncation)]
                let key = key as usize;
                if self.is_nullable() && key == 0 {
                    self.inner.append_default();
                } else {
                    self.inner.append_row(dictionary.row(key, false)?)?;
                }
            }
            read += count;
        }
        Ok(())
    }

    fn encode(&self, writer: &mut BytesMut) {
        let rows = self.inner.rows();
        let dictionary_size = rows as u64 + u64::from(self.null_slot.is_some());
        let (key_type, width) = match dictionary_size {
            0..=0xFF => (KEY_UINT8, 1),
            0x100..=0xFFFF => (KEY_UINT16, 2),
            0x1_0000..=0xFFFF_FFFF => (KEY_UINT32, 4),
            _ => (KEY_UINT64, 8),
        };

        writer.put_u64_le(SHARED_DICTIONARIES_WITH_ADDITIONAL_KEYS);
        writer.put_u64_le(key_type | HAS_ADDITIONAL_KEYS | NEED_UPDATE_DICTIONARY);
        writer.put_u64_le(dictionary_size);
        match (&self.null_slot, self.inner.base()) {
            (Some(slot), Some(base)) => {
                slot.encode(writer);
                base.encode(writer);
            }
            _ => self.inner.encode(writer),
        }

        writer.put_u64_le(rows as u64);
        for row in 0..rows {
            let key = match &self.null_slot {
                Some(_) if matches!(self.inner.row(row, true), Ok(Value::Null)) => 0,
                Some(_) => row as u64 + 1,
                None => row as u64,
            };
            writer.put_uint_le(key, width);
        }
    }

    fn nullable(&self) -> bool { self.is_nullable() }

    fn precision_scale(&self) -> Option<(u8, u8)> { self.inner.precision_scale() }

    fn base(&self) -> Option<&dyn Column> { self.inner.base() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::from_type_name;

    #[test]
    fn test_low_cardinality_round_trip() {
        let mut column = from_type_name("lc", "LowCardinality(String)").unwrap();
        column
            .append(vec![Value::String(b"x".to_vec()), Value::String(b"y".to_vec())])
            .unwrap();
        let mut buf = BytesMut::new();
        column.encode(&mut buf);

        let mut decoded = from_type_name("lc", "LowCardinality(String)").unwrap();
        decoded.decode(&mut &buf[..], 2).unwrap();
        assert_eq!(decoded.row(1, false).unwrap(), Value::String(b"y".to_vec()));
        assert!(!decoded.nullable());
    }

    #[test]
    fn test_nullable_dictionary_reserves_key_zero() {
        let mut column = from_type_name("lc", "LowCardinality(Nullable(String))").unwrap();
        column.append(vec![Value::Null, Value::String(b"a".to_vec())]).unwrap();
        let mut buf = BytesMut::new();
        column.encode(&mut buf);

        let mut decoded = from_type_name("lc", "LowCardinality(Nullable(String))").unwrap();
        decoded.decode(&mut &buf[..], 2).unwrap();
        assert_eq!(decoded.row(0, true).unwrap(), Value::Null);
        assert_eq!(decoded.row(1, true).unwrap(), Value::String(b"a".to_vec()));
        assert!(decoded.nullable());
    }

    #[test]
    fn test_shared_dictionary_across_granules() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(SHARED_DICTIONARIES_WITH_ADDITIONAL_KEYS);
        buf.put_u64_le(KEY_UINT8 | HAS_ADDITIONAL_KEYS);
        buf.put_u64_le(2);
        buf.put_u8(1);
        buf.put_u8(b'a');
        buf.put_u8(1);
        buf.put_u8(b'b');
        buf.put_u64_le(2);
        buf.put_slice(&[1, 0]);
        // Second granule reuses the dictionary
        buf.put_u64_le(KEY_UINT8);
        buf.put_u64_le(1);
        buf.put_u8(1);

        let mut column = from_type_name("lc", "LowCardinality(String)").unwrap();
        column.decode(&mut &buf[..], 3).unwrap();
        let values: Vec<_> = (0..3).map(|r| column.row(r, false).unwrap()).collect();
        assert_eq!(values, vec![
            Value::String(b"b".to_vec()),
            Value::String(b"a".to_vec()),
            Value::String(b"b".to_vec()),
        ]);
    }
}
