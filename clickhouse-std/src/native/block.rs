use bytes::{Buf, BufMut, BytesMut};

use super::protocol::{ClientPacketId, DBMS_MIN_PROTOCOL_VERSION_WITH_CUSTOM_SERIALIZATION};
use super::values::Value;
use crate::column::{self, Column};
use crate::io::{ClickHouseBytesRead, ClickHouseBytesWrite};
use crate::{Error, Result};

/// Guards against hostile headers while decoding.
const MAX_BLOCK_COLUMNS: u64 = 1 << 16;
const MAX_BLOCK_ROWS: u64 = 1 << 32;

/// Metadata about a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub is_overflows: bool,
    pub bucket_num:   i32,
}

impl Default for BlockInfo {
    fn default() -> Self { BlockInfo { is_overflows: false, bucket_num: -1 } }
}

impl BlockInfo {
    pub(crate) fn decode(reader: &mut dyn Buf) -> Result<Self> {
        let mut new = Self::default();
        loop {
            match reader.try_get_var_uint()? {
                0 => break,
                1 => new.is_overflows = reader.try_read_u8()? != 0,
                2 => new.bucket_num = reader.try_read_i32_le()?,
                field_num => {
                    return Err(Error::Protocol(format!(
                        "unknown block info field number: {field_num}"
                    )));
                }
            }
        }
        Ok(new)
    }

    pub(crate) fn encode(&self, writer: &mut BytesMut) {
        writer.put_var_uint(1);
        writer.put_u8(u8::from(self.is_overflows));
        writer.put_var_uint(2);
        writer.put_i32_le(self.bucket_num);
        writer.put_var_uint(0); // End field
    }
}

/// An ordered set of equal-length columns, the unit of transfer on the wire.
#[derive(Debug, Default)]
pub struct Block {
    pub(crate) info:    BlockInfo,
    pub(crate) columns: Vec<Box<dyn Column>>,
}

impl Block {
    /// # Errors
    /// Fails when the columns differ in length.
    pub fn new(columns: Vec<Box<dyn Column>>) -> Result<Self> {
        let block = Block { info: BlockInfo::default(), columns };
        block.validate()?;
        Ok(block)
    }

    /// Builds a block from `(name, type, cells)` triples.
    ///
    /// # Errors
    /// Fails on unknown type names, cells the column rejects, or columns of unequal length.
    pub fn try_from_values<N, T>(columns: impl IntoIterator<Item = (N, T, Vec<Value>)>) -> Result<Self>
    where
        N: AsRef<str>,
        T: AsRef<str>,
    {
        let columns = columns
            .into_iter()
            .map(|(name, type_name, values)| {
                let mut column = column::from_type_name(name.as_ref(), type_name.as_ref())?;
                column.append(values)?;
                Ok(column)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(columns)
    }

    pub fn info(&self) -> BlockInfo { self.info }

    pub fn rows(&self) -> usize { self.columns.first().map_or(0, |c| c.rows()) }

    pub fn is_empty(&self) -> bool { self.rows() == 0 }

    pub fn columns(&self) -> &[Box<dyn Column>] { &self.columns }

    pub fn column(&self, index: usize) -> Option<&dyn Column> {
        self.columns.get(index).map(AsRef::as_ref)
    }

    pub(crate) fn column_mut(&mut self, index: usize) -> Option<&mut Box<dyn Column>> {
        self.columns.get_mut(index)
    }

    pub fn column_names(&self) -> Vec<&str> { self.columns.iter().map(|c| c.name()).collect() }

    /// A block with the same columns and no rows.
    pub(crate) fn empty_like(&self) -> Result<Self> {
        let columns = self
            .columns
            .iter()
            .map(|c| column::from_type_name(c.name(), c.declared_type()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Block { info: BlockInfo::default(), columns })
    }

    pub(crate) fn reset(&mut self) { self.columns.iter_mut().for_each(|c| c.reset()); }

    pub(crate) fn validate(&self) -> Result<()> {
        let rows = self.rows();
        for column in &self.columns {
            if column.rows() != rows {
                return Err(Error::Protocol(format!(
                    "column {} has {} rows, expected {rows}",
                    column.name(),
                    column.rows()
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn decode(reader: &mut dyn Buf, revision: u64) -> Result<Self> {
        let info = BlockInfo::decode(reader)?;
        let num_columns = reader.try_get_var_uint()?;
        let num_rows = reader.try_get_var_uint()?;
        if num_columns > MAX_BLOCK_COLUMNS || num_rows > MAX_BLOCK_ROWS {
            return Err(Error::Protocol(format!(
                "block too large: {num_columns} columns, {num_rows} rows"
            )));
        }

        #[expect(clippy::cast_possible_truncation)]
        let (num_columns, num_rows) = (num_columns as usize, num_rows as usize);
        let mut columns = Vec::with_capacity(num_columns);
        for _ in 0..num_columns {
            let name = reader.try_get_utf8_string()?;
            let type_name = reader.try_get_utf8_string()?;
            if revision >= DBMS_MIN_PROTOCOL_VERSION_WITH_CUSTOM_SERIALIZATION
                && reader.try_read_u8()? != 0
            {
                return Err(Error::Protocol(format!(
                    "custom serialization for column {name} is not supported"
                )));
            }
            let mut column = column::from_type_name(&name, &type_name)?;
            if num_rows > 0 {
                column.decode(reader, num_rows)?;
            }
            columns.push(column);
        }

        Ok(Block { info, columns })
    }

    pub(crate) fn encode(&self, writer: &mut BytesMut, revision: u64) {
        let rows = self.rows();
        self.info.encode(writer);
        writer.put_var_uint(self.columns.len() as u64);
        writer.put_var_uint(rows as u64);
        for column in &self.columns {
            writer.put_string(column.name());
            writer.put_string(column.declared_type());
            if revision >= DBMS_MIN_PROTOCOL_VERSION_WITH_CUSTOM_SERIALIZATION {
                writer.put_u8(0);
            }
            if rows > 0 {
                column.encode(writer);
            }
        }
    }

    /// Writes a client data packet carrying this block.
    pub(crate) fn encode_data_packet(&self, writer: &mut BytesMut, revision: u64) {
        writer.put_var_uint(ClientPacketId::Data as u64);
        writer.put_string(""); // Temporary table name
        self.encode(writer, revision);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::protocol::DBMS_TCP_PROTOCOL_VERSION;
    use crate::native::values::Decimal;

    fn sample() -> Block {
        Block::try_from_values([
            ("id", "UInt64", vec![Value::UInt64(1), Value::UInt64(2)]),
            ("name", "Nullable(String)", vec![Value::String(b"a".to_vec()), Value::Null]),
            ("price", "Decimal(9, 2)", vec![
                Value::Decimal(Decimal::new(150, 2)),
                Value::Decimal(Decimal::new(-1, 0)),
            ]),
        ])
        .unwrap()
    }

    #[test]
    fn test_block_wire_layout() {
        let block = sample();
        let mut buf = BytesMut::new();
        block.encode(&mut buf, DBMS_TCP_PROTOCOL_VERSION);

        let decoded = Block::decode(&mut &buf[..], DBMS_TCP_PROTOCOL_VERSION).unwrap();
        assert_eq!(decoded.rows(), 2);
        assert_eq!(decoded.column_names(), vec!["id", "name", "price"]);
        assert_eq!(decoded.column(1).unwrap().declared_type(), "Nullable(String)");
        assert_eq!(decoded.column(2).unwrap().row(1, false).unwrap(), Value::Decimal(Decimal::new(-100, 2)));
        assert_eq!(decoded.column(1).unwrap().row(1, true).unwrap(), Value::Null);
    }

    #[test]
    fn test_unequal_columns_rejected() {
        let a = column::from_type_name("a", "Int8").unwrap();
        let mut b = column::from_type_name("b", "Int8").unwrap();
        b.append_row(Value::Int8(1)).unwrap();
        assert!(matches!(Block::new(vec![a, b]), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_custom_serialization_rejected() {
        let mut buf = BytesMut::new();
        BlockInfo::default().encode(&mut buf);
        buf.put_var_uint(1);
        buf.put_var_uint(0);
        buf.put_string("x");
        buf.put_string("UInt8");
        buf.put_u8(1);
        assert!(matches!(
            Block::decode(&mut &buf[..], DBMS_TCP_PROTOCOL_VERSION),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_empty_like_keeps_header() {
        let block = sample();
        let empty = block.empty_like().unwrap();
        assert_eq!(empty.rows(), 0);
        assert_eq!(empty.column_names(), block.column_names());
    }
}
