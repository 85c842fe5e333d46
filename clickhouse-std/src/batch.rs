//! Row-at-a-time inserts accumulated into one columnar block.
//!
//! The native protocol has no transactions. A prepared insert emulates one: rows appended through
//! a [`Statement`] collect in a [`Batch`], committing sends the block exactly once, and rolling
//! back discards it and closes the connection since a half-sent insert cannot be undone.
use crate::column::out_of_bounds;
use crate::connection::Connection;
use crate::native::block::Block;
use crate::prelude::*;

const READ_IN_BATCH: &str = "only append/send is supported in batch mode";

/// Rows waiting to be sent for one insert statement.
#[derive(Debug)]
pub struct Batch {
    query: String,
    block: Block,
    sent:  bool,
}

impl Batch {
    /// A batch shaped like the insert `header` the server returned.
    pub(crate) fn new(query: impl Into<String>, header: &Block) -> Result<Self> {
        Ok(Batch { query: query.into(), block: header.empty_like()?, sent: false })
    }

    pub fn query(&self) -> &str { &self.query }

    pub fn rows(&self) -> usize { self.block.rows() }

    pub fn column_names(&self) -> Vec<&str> { self.block.column_names() }

    pub fn is_sent(&self) -> bool { self.sent }

    /// Appends one row, checking every cell before any column changes.
    ///
    /// # Errors
    /// - [`Error::ColumnCountMismatch`] when the row has the wrong number of cells
    /// - [`Error::UnexpectedType`] when a cell does not fit its column
    /// - [`Error::Usage`] once the batch was sent
    pub fn append(&mut self, row: impl ToRow) -> Result<()> {
        self.writable()?;
        let values = row.to_row()?;
        self.check_row(&values)?;
        for (index, value) in values.into_iter().enumerate() {
            self.column_mut(index)?.append_row(value)?;
        }
        Ok(())
    }

    /// Appends many rows at once, splitting them into per-column arrays. Nothing is appended
    /// unless every row is accepted.
    ///
    /// # Errors
    /// See [`Batch::append`].
    pub fn append_rows<R: ToRow>(&mut self, rows: impl IntoIterator<Item = R>) -> Result<()> {
        self.writable()?;
        let width = self.block.columns().len();
        let mut columns = vec![Vec::new(); width];
        for row in rows {
            let values = row.to_row()?;
            self.check_row(&values)?;
            for (column, value) in columns.iter_mut().zip(values) {
                column.push(value);
            }
        }
        for (index, values) in columns.into_iter().enumerate() {
            self.column_mut(index)?.append(values)?;
        }
        Ok(())
    }

    /// Appends a homogeneous array to a single column.
    ///
    /// Columns filled this way must end up the same length before the batch is sent.
    ///
    /// # Errors
    /// [`Error::OutOfBounds`] for an unknown column, or the first value the column rejects.
    pub fn append_column<T: ToSql>(
        &mut self,
        index: usize,
        values: impl IntoIterator<Item = T>,
    ) -> Result<()> {
        self.writable()?;
        self.column_mut(index)?.as_mut().append_typed(values)
    }

    /// Sends the accumulated rows. Only the first call reaches the server.
    pub(crate) async fn send(&mut self, conn: &mut Connection, ctx: &Context) -> Result<()> {
        if self.sent {
            return Ok(());
        }
        self.sent = true;
        if self.block.validate().is_err() {
            // The server is still waiting for insert data that will never arrive
            conn.mark_bad();
            return Err(Error::Usage("batch columns differ in length"));
        }
        debug!({ ATT_CID } = conn.id(), rows = self.block.rows(), "sending batch");
        conn.send_batch(ctx, &self.block).await
    }

    fn writable(&self) -> Result<()> {
        if self.sent { Err(Error::Usage("batch has already been sent")) } else { Ok(()) }
    }

    fn check_row(&self, values: &[Value]) -> Result<()> {
        let expected = self.block.columns().len();
        if values.len() != expected {
            return Err(Error::ColumnCountMismatch { expected, actual: values.len() });
        }
        self.block.columns().iter().zip(values).try_for_each(|(column, value)| column.check_value(value))
    }

    fn column_mut(&mut self, index: usize) -> Result<&mut Box<dyn Column>> {
        let len = self.block.columns().len();
        self.block.column_mut(index).ok_or_else(|| out_of_bounds(index, len))
    }
}

/// A prepared insert. Every [`Statement::exec`] appends one row to the pending batch.
#[derive(Debug)]
pub struct Statement<'a> {
    batch: &'a mut Batch,
    conn:  &'a mut Connection,
}

impl<'a> Statement<'a> {
    pub(crate) fn new(batch: &'a mut Batch, conn: &'a mut Connection) -> Self {
        Statement { batch, conn }
    }

    /// Statements accept any number of inputs.
    pub fn num_input(&self) -> Option<usize> { None }

    pub fn batch(&self) -> &Batch { &*self.batch }

    /// # Errors
    /// See [`Batch::append`].
    pub fn exec(&mut self, row: impl ToRow) -> Result<()> { self.batch.append(row) }

    /// # Errors
    /// See [`Batch::append_rows`].
    pub fn exec_many<R: ToRow>(&mut self, rows: impl IntoIterator<Item = R>) -> Result<()> {
        self.batch.append_rows(rows)
    }

    /// # Errors
    /// See [`Batch::append_column`].
    pub fn append_column<T: ToSql>(
        &mut self,
        index: usize,
        values: impl IntoIterator<Item = T>,
    ) -> Result<()> {
        self.batch.append_column(index, values)
    }

    /// Reads are not possible through a prepared insert.
    ///
    /// # Errors
    /// Always [`Error::Usage`].
    pub fn query(&mut self, _row: impl ToRow) -> Result<Rows<'static>> { Err(Error::Usage(READ_IN_BATCH)) }

    /// Sends the batch now instead of at commit. Committing afterwards is a no-op.
    ///
    /// # Errors
    /// Any error raised while sending.
    pub async fn send(&mut self, ctx: &Context) -> Result<()> { self.batch.send(self.conn, ctx).await }

    /// Releases the statement, leaving the batch for commit or rollback.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> Batch {
        let header = Block::try_from_values([
            ("id", "UInt64", vec![]),
            ("name", "String", vec![]),
            ("score", "Nullable(Decimal(9, 2))", vec![]),
        ])
        .unwrap();
        Batch::new("INSERT INTO scores", &header).unwrap()
    }

    #[test]
    fn test_append_checks_shape() {
        let mut batch = batch();
        batch.append((1u64, "a", Some(Decimal::new(125, 2)))).unwrap();
        batch.append(vec![Value::UInt64(2), Value::String(b"b".to_vec()), Value::Null]).unwrap();
        assert_eq!(batch.rows(), 2);

        let err = batch.append((3u64, "c")).unwrap_err();
        assert!(matches!(err, Error::ColumnCountMismatch { expected: 3, actual: 2 }));

        // Rejected rows leave every column untouched
        let err = batch.append((3u64, 7i8, None::<Decimal>)).unwrap_err();
        assert!(matches!(err, Error::UnexpectedType { .. }));
        assert_eq!(batch.rows(), 2);
        assert!(batch.block.validate().is_ok());
    }

    #[test]
    fn test_append_rows_is_all_or_nothing() {
        let mut batch = batch();
        batch
            .append_rows(vec![(1u64, "a", None::<Decimal>), (2u64, "b", Some(Decimal::new(1, 0)))])
            .unwrap();
        assert_eq!(batch.rows(), 2);

        let bad = vec![
            vec![Value::UInt64(3), Value::String(b"c".to_vec()), Value::Null],
            vec![Value::UInt64(4), Value::Int8(1), Value::Null],
        ];
        assert!(batch.append_rows(bad).is_err());
        assert_eq!(batch.rows(), 2);
    }

    #[test]
    fn test_append_column() {
        let mut batch = batch();
        batch.append_column(0, [1u64, 2, 3]).unwrap();
        batch.append_column(1, ["a", "b", "c"]).unwrap();
        batch.append_column(2, [None, Some(Decimal::new(5, 1)), None]).unwrap();
        assert_eq!(batch.rows(), 3);
        assert!(matches!(batch.append_column(3, [1u8]), Err(Error::OutOfBounds { index: 3, len: 3 })));
        assert!(batch.append_column(0, ["x"]).is_err());
        assert_eq!(batch.block.column(0).unwrap().rows(), 3);
    }
}
