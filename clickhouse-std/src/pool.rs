//! A `bb8` connection manager.
//!
//! Pool sizing and lifetimes are configured on the [`bb8::Builder`], never on [`Options`]: the
//! [`Connector`] refuses options that carry them.
use crate::prelude::*;

/// Hands out [`Conn`]s and discards the ones that report the bad-connection signal.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    connector: Connector,
}

impl ConnectionManager {
    /// # Errors
    /// [`Error::InvalidSettings`] when pool sizing options are set.
    pub fn try_new(options: Options) -> Result<Self> {
        Ok(ConnectionManager { connector: Connector::try_new(options)? })
    }

    pub fn from_connector(connector: Connector) -> Self { ConnectionManager { connector } }

    pub fn connector(&self) -> &Connector { &self.connector }

    fn context(&self) -> Context {
        let timeout = self.connector.options().dial_timeout;
        if timeout.is_zero() { Context::new() } else { Context::new().with_timeout(timeout) }
    }
}

impl bb8::ManageConnection for ConnectionManager {
    type Connection = Conn;
    type Error = Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.connector.connect(&self.context()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        match conn.reset_session() {
            // Transports without session state are probed instead
            Err(Error::NotSupported) => conn.ping(&self.context()).await,
            result => result,
        }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool { conn.is_bad() }
}
