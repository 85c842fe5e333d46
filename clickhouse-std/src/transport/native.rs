use std::sync::Arc;

use super::Transport;
use crate::connection::Connection;
use crate::prelude::*;
use crate::query::is_insert;

/// The native binary protocol, with batches standing in for transactions.
#[derive(Debug)]
pub struct NativeTransport {
    conn:    Connection,
    pending: Option<Batch>,
}

impl NativeTransport {
    /// Dials `addr` and completes the handshake.
    ///
    /// # Errors
    /// Dial, TLS, or handshake failures.
    pub async fn connect(id: u64, addr: &str, options: Arc<Options>, ctx: &Context) -> Result<Self> {
        let conn = Connection::connect(id, addr, options, ctx).await?;
        Ok(Self::new(conn))
    }

    pub(crate) fn new(conn: Connection) -> Self { NativeTransport { conn, pending: None } }

    pub fn addr(&self) -> &str { self.conn.addr() }

    /// `major.minor.patch` reported by the server.
    pub fn server_version(&self) -> String { self.conn.server_version() }

    pub fn server_timezone(&self) -> Option<&str> { self.conn.server_timezone() }

    /// Whether a prepared batch waits for commit or rollback.
    pub fn has_pending_batch(&self) -> bool { self.pending.as_ref().is_some_and(|b| !b.is_sent()) }

    /// Refuses new work while an unsent batch holds the wire, forgetting batches already sent.
    fn idle(&mut self) -> Result<()> {
        if self.has_pending_batch() {
            return Err(Error::Usage("a batch is pending, commit or roll back first"));
        }
        self.pending = None;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for NativeTransport {
    fn id(&self) -> u64 { self.conn.id() }

    async fn ping(&mut self, ctx: &Context) -> Result<()> {
        self.idle()?;
        self.conn.ping(ctx).await
    }

    fn begin_tx(&mut self) -> Result<()> {
        if self.conn.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    async fn commit_tx(&mut self, ctx: &Context) -> Result<()> {
        let Some(mut batch) = self.pending.take() else {
            return Ok(());
        };
        batch.send(&mut self.conn, ctx).await
    }

    async fn rollback_tx(&mut self) -> Result<()> {
        let result = self.conn.close().await;
        if let Some(batch) = self.pending.take() {
            debug!({ ATT_CID } = self.conn.id(), rows = batch.rows(), "discarded batch");
        }
        result
    }

    fn reset_session(&self) -> Result<()> {
        if self.conn.is_bad() {
            return Err(Error::BadConnection);
        }
        Ok(())
    }

    fn check_bindable(&self, _value: &Value) -> Result<()> { Ok(()) }

    async fn exec(&mut self, ctx: &Context, query: &str, params: Params) -> Result<()> {
        if let Some(async_insert) = ctx.async_insert() {
            if !params.is_empty() {
                return Err(Error::Usage("you can't use parameters in an asynchronous insert"));
            }
            self.idle()?;
            return self.conn.async_insert(ctx, query, async_insert.wait).await;
        }
        self.idle()?;
        let query = params.bind(query)?;
        self.conn.exec(ctx, &query).await
    }

    async fn query(&mut self, ctx: &Context, query: &str, params: Params) -> Result<Rows<'_>> {
        self.idle()?;
        let query = params.bind(query)?;
        let (header, done) = self.conn.query(ctx, &query).await?;
        Ok(Rows::streaming(&mut self.conn, ctx.clone(), header, done))
    }

    async fn prepare_for_batch(&mut self, ctx: &Context, query: &str) -> Result<Statement<'_>> {
        self.idle()?;
        if !is_insert(query) {
            return Err(Error::Usage("only INSERT statements can be prepared"));
        }
        let header = self.conn.prepare_insert(ctx, query).await?;
        let batch = self.pending.insert(Batch::new(query, &header)?);
        Ok(Statement::new(batch, &mut self.conn))
    }

    async fn close(&mut self) -> Result<()> {
        self.pending = None;
        self.conn.close().await
    }

    fn is_bad(&self) -> bool { self.conn.is_bad() }
}
