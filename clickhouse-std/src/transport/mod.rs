//! The operation set every wire protocol implements.
mod http;
mod native;

pub use http::HttpTransport;
pub use native::NativeTransport;

use crate::prelude::*;

/// One connection speaking one wire protocol.
///
/// Implementations are used by a single caller at a time. Capabilities a protocol lacks are
/// reported with [`Error::NotSupported`] without touching the network.
#[async_trait::async_trait]
pub trait Transport: Send + std::fmt::Debug {
    /// The id assigned when the connection was opened.
    fn id(&self) -> u64;

    /// # Errors
    /// Network or server errors.
    async fn ping(&mut self, ctx: &Context) -> Result<()>;

    /// Starts a transaction. The native protocol has no explicit begin.
    ///
    /// # Errors
    /// [`Error::NotSupported`] for transports without batches.
    fn begin_tx(&mut self) -> Result<()>;

    /// Sends the pending batch, if any. Committing again is a no-op.
    ///
    /// # Errors
    /// Errors raised while sending.
    async fn commit_tx(&mut self, ctx: &Context) -> Result<()>;

    /// Discards the pending batch and closes the connection.
    ///
    /// # Errors
    /// [`Error::NotSupported`] for transports without batches.
    async fn rollback_tx(&mut self) -> Result<()>;

    /// Checked before a pooled connection is reused.
    ///
    /// # Errors
    /// [`Error::BadConnection`] when the connection must be discarded.
    fn reset_session(&self) -> Result<()>;

    /// Pre-validates a value before it is bound into a query.
    ///
    /// # Errors
    /// Transport specific.
    fn check_bindable(&self, value: &Value) -> Result<()>;

    /// # Errors
    /// Binding, network or server errors, and [`Error::Usage`] for parameters bound to an
    /// async insert.
    async fn exec(&mut self, ctx: &Context, query: &str, params: Params) -> Result<()>;

    /// # Errors
    /// Binding, network or server errors.
    async fn query(&mut self, ctx: &Context, query: &str, params: Params) -> Result<Rows<'_>>;

    /// Prepares an insert whose rows are collected into a batch.
    ///
    /// # Errors
    /// Network or server errors, [`Error::Usage`] when a batch is already pending.
    async fn prepare_for_batch(&mut self, ctx: &Context, query: &str) -> Result<Statement<'_>>;

    /// # Errors
    /// Errors raised while shutting the connection down.
    async fn close(&mut self) -> Result<()>;

    /// Whether the connection failed in a way that makes it unusable.
    fn is_bad(&self) -> bool;
}
