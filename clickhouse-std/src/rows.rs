//! Forward-only row iteration over columnar result blocks.
//!
//! [`Rows`] walks the cells of the current [`Block`] row by row. When the block is exhausted it
//! pulls the next block off the connection that produced it, so a query result is never fully
//! buffered. A totals block reported by the server is held back and can be read once, after the
//! primary rows, through [`Rows::next_result_set`].
//!
//! While a `Rows` is alive it borrows its connection mutably: no other operation can run on the
//! same handle until the rows are exhausted, closed, or dropped.
use crate::column::out_of_bounds;
use crate::connection::{Connection, StreamEvent};
use crate::native::block::Block;
use crate::prelude::*;

/// The rows of one query result.
#[derive(Debug)]
pub struct Rows<'a> {
    conn:   Option<&'a mut Connection>,
    ctx:    Context,
    block:  Block,
    totals: Option<Block>,
    row:    usize,
    /// Stream failure surfaced once the buffered rows run out.
    err:    Option<Error>,
    done:   bool,
    closed: bool,
}

impl Rows<'static> {
    /// Rows over blocks already in memory, with an optional totals block.
    pub fn new(block: Block, totals: Option<Block>) -> Self {
        Rows {
            conn: None,
            ctx: Context::default(),
            block,
            totals,
            row: 0,
            err: None,
            done: true,
            closed: false,
        }
    }
}

impl<'a> Rows<'a> {
    /// Rows fed by a running query on `conn`. `header` describes the columns, `done` is set when
    /// the server already ended the stream.
    pub(crate) fn streaming(
        conn: &'a mut Connection,
        ctx: Context,
        header: Block,
        done: bool,
    ) -> Self {
        Rows { conn: Some(conn), ctx, block: header, totals: None, row: 0, err: None, done, closed: false }
    }

    /// Reads the next row into `dest`, one slot per column.
    ///
    /// Returns `Ok(false)` at the end of the result set, after any error raised while streaming
    /// has been returned.
    ///
    /// # Errors
    /// - [`Error::ColumnCountMismatch`] when `dest.len()` differs from the column count
    /// - any error the connection reported while fetching the next block
    pub async fn next(&mut self, dest: &mut [Value]) -> Result<bool> {
        let expected = self.block.columns().len();
        if dest.len() != expected {
            return Err(Error::ColumnCountMismatch { expected, actual: dest.len() });
        }
        if self.closed {
            return Ok(false);
        }

        while self.row >= self.block.rows() {
            if !self.fetch().await {
                return match self.err.take() {
                    Some(error) => Err(error),
                    None => Ok(false),
                };
            }
        }

        for (slot, column) in dest.iter_mut().zip(self.block.columns()) {
            *slot = column.row(self.row, column.nullable())?;
        }
        self.row += 1;
        Ok(true)
    }

    /// Converts the cell of column `index` in the row last returned by [`Rows::next`].
    ///
    /// # Errors
    /// - [`Error::Usage`] before the first row was read
    /// - [`Error::OutOfBounds`] for an unknown column
    /// - [`Error::UnexpectedType`] when the cell does not convert into `T`
    pub fn scan<T: FromSql>(&self, index: usize) -> Result<T> {
        let row = self.row.checked_sub(1).ok_or(Error::Usage("scan called before next"))?;
        let column = self.column(index)?;
        T::from_sql(column.declared_type(), column.row(row, T::accepts_null())?)
    }

    pub fn columns(&self) -> usize { self.block.columns().len() }

    pub fn column_names(&self) -> Vec<&str> { self.block.column_names() }

    /// # Errors
    /// [`Error::OutOfBounds`] for an unknown column.
    pub fn column_scan_type(&self, index: usize) -> Result<ScanType> {
        Ok(self.column(index)?.scan_type())
    }

    /// The type name exactly as declared by the server.
    ///
    /// # Errors
    /// [`Error::OutOfBounds`] for an unknown column.
    pub fn column_type_name(&self, index: usize) -> Result<&str> {
        Ok(self.column(index)?.declared_type())
    }

    /// `(nullable, ok)`. Nullability is always known for native columns, so `ok` is `true`.
    ///
    /// # Errors
    /// [`Error::OutOfBounds`] for an unknown column.
    pub fn column_nullable(&self, index: usize) -> Result<(bool, bool)> {
        Ok((self.column(index)?.nullable(), true))
    }

    /// `(precision, scale, ok)` of a fixed-point column, looking through one wrapper such as
    /// `Nullable`. `ok` is `false` for every other type.
    ///
    /// # Errors
    /// [`Error::OutOfBounds`] for an unknown column.
    pub fn column_precision_scale(&self, index: usize) -> Result<(i64, i64, bool)> {
        let column = self.column(index)?;
        let target = column.base().unwrap_or(column);
        Ok(match target.precision_scale() {
            Some((precision, scale)) => (i64::from(precision), i64::from(scale), true),
            None => (0, 0, false),
        })
    }

    /// Whether a totals block is waiting to be read.
    pub fn has_next_result_set(&self) -> bool { self.totals.is_some() }

    /// Switches to the totals block. Succeeds at most once, `false` means there is nothing more.
    pub fn next_result_set(&mut self) -> bool {
        match self.totals.take() {
            Some(totals) => {
                trace!(rows = totals.rows(), "switching to totals");
                self.block = totals;
                self.row = 0;
                true
            }
            None => false,
        }
    }

    /// Releases the buffered blocks and reads whatever is left of the stream so the connection
    /// can run the next operation. Closing twice is a no-op.
    ///
    /// # Errors
    /// Any error raised while draining. The connection is marked bad when it cannot be drained.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.block.reset();
        self.totals = None;
        if !self.done {
            self.done = true;
            if let Some(conn) = self.conn.as_deref_mut() {
                conn.drain(&self.ctx).await?;
            }
        }
        Ok(())
    }

    fn column(&self, index: usize) -> Result<&dyn Column> {
        self.block.column(index).ok_or_else(|| out_of_bounds(index, self.block.columns().len()))
    }

    /// Pulls the next event off the connection. Returns `false` once nothing more will arrive.
    async fn fetch(&mut self) -> bool {
        if self.done {
            return false;
        }
        let Some(conn) = self.conn.as_deref_mut() else {
            self.done = true;
            return false;
        };
        match conn.next_event(&self.ctx).await {
            Ok(StreamEvent::Data(block)) => {
                if block.columns().len() != self.block.columns().len() {
                    self.err = Some(Error::Protocol(format!(
                        "data block has {} columns, header has {}",
                        block.columns().len(),
                        self.block.columns().len()
                    )));
                    conn.mark_bad();
                    self.done = true;
                    return false;
                }
                self.block = block;
                self.row = 0;
                true
            }
            Ok(StreamEvent::Totals(block)) => {
                self.totals = Some(block);
                true
            }
            Ok(StreamEvent::End) => {
                self.done = true;
                false
            }
            Err(error) => {
                self.err = Some(error);
                self.done = true;
                false
            }
        }
    }
}

impl Drop for Rows<'_> {
    fn drop(&mut self) {
        if self.closed || self.done {
            return;
        }
        if let Some(conn) = self.conn.as_deref_mut() {
            warn!({ ATT_CID } = conn.id(), "rows dropped before the stream ended");
            conn.mark_bad();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Block {
        Block::try_from_values([
            ("id", "UInt32", vec![Value::UInt32(1), Value::UInt32(2), Value::UInt32(3)]),
            ("name", "Nullable(String)", vec![
                Value::String(b"a".to_vec()),
                Value::Null,
                Value::String(b"c".to_vec()),
            ]),
            ("price", "Nullable(Decimal(10, 2))", vec![
                Value::Decimal(Decimal::new(150, 2)),
                Value::Null,
                Value::Null,
            ]),
        ])
        .unwrap()
    }

    fn totals() -> Block {
        Block::try_from_values([
            ("id", "UInt32", vec![Value::UInt32(6)]),
            ("name", "Nullable(String)", vec![Value::Null]),
            ("price", "Nullable(Decimal(10, 2))", vec![Value::Null]),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_rows_in_order_then_end() {
        let mut rows = Rows::new(block(), None);
        let mut dest = vec![Value::Null; 3];
        let mut ids = Vec::new();
        while rows.next(&mut dest).await.unwrap() {
            ids.push(dest[0].clone());
            if dest[0] == Value::UInt32(2) {
                assert_eq!(dest[1], Value::Null);
                assert_eq!(rows.scan::<Option<String>>(1).unwrap(), None);
            }
        }
        assert_eq!(ids, vec![Value::UInt32(1), Value::UInt32(2), Value::UInt32(3)]);
        assert!(!rows.next(&mut dest).await.unwrap());
    }

    #[tokio::test]
    async fn test_arity_mismatch_reports_counts() {
        for size in [0, 2, 4] {
            let mut rows = Rows::new(block(), None);
            let mut dest = vec![Value::Null; size];
            let err = rows.next(&mut dest).await.unwrap_err();
            assert!(matches!(err, Error::ColumnCountMismatch { expected: 3, actual } if actual == size));
        }
    }

    #[test]
    fn test_introspection() {
        let rows = Rows::new(block(), None);
        assert_eq!(rows.column_names(), vec!["id", "name", "price"]);
        assert_eq!(rows.column_type_name(2).unwrap(), "Nullable(Decimal(10, 2))");
        assert_eq!(rows.column_nullable(0).unwrap(), (false, true));
        assert_eq!(rows.column_nullable(1).unwrap(), (true, true));
        assert_eq!(rows.column_precision_scale(2).unwrap(), (10, 2, true));
        assert_eq!(rows.column_precision_scale(0).unwrap(), (0, 0, false));
        assert!(rows.column_scan_type(1).unwrap().is_nullable());
        assert!(matches!(rows.column_type_name(3), Err(Error::OutOfBounds { index: 3, len: 3 })));
        assert!(matches!(rows.scan::<u32>(0), Err(Error::Usage(_))));
    }

    #[tokio::test]
    async fn test_totals_consumed_once() {
        let mut rows = Rows::new(block(), Some(totals()));
        let mut dest = vec![Value::Null; 3];
        while rows.next(&mut dest).await.unwrap() {}
        assert!(rows.has_next_result_set());
        assert!(rows.next_result_set());
        assert!(!rows.has_next_result_set());
        assert!(rows.next(&mut dest).await.unwrap());
        assert_eq!(dest[0], Value::UInt32(6));
        assert!(!rows.next(&mut dest).await.unwrap());
        assert!(!rows.next_result_set());

        let mut without = Rows::new(block(), None);
        assert!(!without.next_result_set());
        assert!(!without.next_result_set());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut rows = Rows::new(block(), Some(totals()));
        rows.close().await.unwrap();
        rows.close().await.unwrap();
        assert!(!rows.has_next_result_set());
        let mut dest = vec![Value::Null; 3];
        assert!(!rows.next(&mut dest).await.unwrap());
    }
}
