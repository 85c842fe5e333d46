//! The row-oriented client surface: connections, transactions, and the driver registry.
use std::sync::LazyLock;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::prelude::*;
use crate::transport::Transport;

static REGISTRY: LazyLock<RwLock<FxHashMap<String, Driver>>> = LazyLock::new(Default::default);

/// A live connection. Every operation is forwarded to the transport it was opened with.
#[derive(Debug)]
pub struct Conn {
    transport: Box<dyn Transport>,
}

impl Conn {
    pub fn new(transport: Box<dyn Transport>) -> Self { Conn { transport } }

    pub fn id(&self) -> u64 { self.transport.id() }

    pub fn transport(&self) -> &dyn Transport { self.transport.as_ref() }

    /// # Errors
    /// Network or server errors.
    pub async fn ping(&mut self, ctx: &Context) -> Result<()> { self.transport.ping(ctx).await }

    /// Starts a transaction. Prepared inserts run inside it are sent on commit.
    ///
    /// # Errors
    /// [`Error::NotSupported`] over HTTP, [`Error::ConnectionClosed`] on a closed connection.
    pub fn begin(&mut self) -> Result<Tx<'_>> {
        self.transport.begin_tx()?;
        Ok(Tx { conn: self, finished: false })
    }

    /// Returns [`Error::BadConnection`] when the connection must not be reused.
    ///
    /// # Errors
    /// See above.
    pub fn reset_session(&self) -> Result<()> { self.transport.reset_session() }

    /// # Errors
    /// When the transport refuses `value` as a parameter.
    pub fn check_bindable(&self, value: &Value) -> Result<()> { self.transport.check_bindable(value) }

    /// Runs a statement, binding `params` client side.
    ///
    /// # Errors
    /// Binding, network or server errors.
    pub async fn exec(&mut self, ctx: &Context, query: &str, params: impl Into<Params>) -> Result<()> {
        let params = params.into();
        params.iter().try_for_each(|p| self.transport.check_bindable(p.value()))?;
        self.transport.exec(ctx, query, params).await
    }

    /// Runs a query and returns its rows. The connection stays borrowed until the rows are
    /// dropped.
    ///
    /// # Errors
    /// Binding, network or server errors.
    pub async fn query(
        &mut self,
        ctx: &Context,
        query: &str,
        params: impl Into<Params>,
    ) -> Result<Rows<'_>> {
        let params = params.into();
        params.iter().try_for_each(|p| self.transport.check_bindable(p.value()))?;
        self.transport.query(ctx, query, params).await
    }

    /// Prepares an insert. Rows passed to [`Statement::exec`] are sent by [`Statement::send`] or
    /// by committing the surrounding transaction.
    ///
    /// # Errors
    /// Network or server errors.
    pub async fn prepare(&mut self, ctx: &Context, query: &str) -> Result<Statement<'_>> {
        self.transport.prepare_for_batch(ctx, query).await
    }

    /// # Errors
    /// Errors raised while shutting down.
    pub async fn close(&mut self) -> Result<()> { self.transport.close().await }

    pub fn is_bad(&self) -> bool { self.transport.is_bad() }
}

/// A transaction over a [`Conn`]. Committing sends the pending batch, rolling back drops it and
/// closes the connection.
#[derive(Debug)]
pub struct Tx<'a> {
    conn:     &'a mut Conn,
    finished: bool,
}

impl Tx<'_> {
    /// # Errors
    /// See [`Conn::prepare`].
    pub async fn prepare(&mut self, ctx: &Context, query: &str) -> Result<Statement<'_>> {
        self.conn.prepare(ctx, query).await
    }

    /// # Errors
    /// Errors raised while sending the batch.
    pub async fn commit(mut self, ctx: &Context) -> Result<()> {
        self.finished = true;
        self.conn.transport.commit_tx(ctx).await
    }

    /// # Errors
    /// Errors raised while closing the connection.
    pub async fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.conn.transport.rollback_tx().await
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!({ ATT_CID } = self.conn.id(), "transaction dropped without commit or rollback");
        }
    }
}

/// Opens connections from DSN strings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Driver;

impl Driver {
    /// # Errors
    /// DSN, configuration or dial errors.
    pub async fn open(&self, dsn: &str, ctx: &Context) -> Result<Conn> {
        Connector::from_dsn(dsn)?.connect(ctx).await
    }

    /// A connector for already parsed options.
    ///
    /// # Errors
    /// [`Error::InvalidSettings`] when pool sizing options are set.
    pub fn connector(&self, options: Options) -> Result<Connector> { Connector::try_new(options) }
}

/// Registers the driver under `name`. Call once at startup.
///
/// # Errors
/// [`Error::Usage`] when `name` is already taken.
pub fn register(name: impl Into<String>) -> Result<()> {
    let name = name.into();
    let mut registry = REGISTRY.write();
    if registry.contains_key(&name) {
        return Err(Error::Usage("driver already registered under this name"));
    }
    debug!(name, "registered driver");
    let _ = registry.insert(name, Driver);
    Ok(())
}

pub fn lookup(name: &str) -> Option<Driver> { REGISTRY.read().get(name).copied() }

/// Opens a connection through the driver registered under `name`.
///
/// # Errors
/// [`Error::Usage`] for an unknown driver name, otherwise see [`Driver::open`].
pub async fn open(name: &str, dsn: &str, ctx: &Context) -> Result<Conn> {
    let driver = lookup(name).ok_or(Error::Usage("no driver registered under this name"))?;
    driver.open(dsn, ctx).await
}
