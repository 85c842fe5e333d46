//! Span and event field names shared by the connection, transport, and opener layers.

/// Connection id assigned by the [`crate::Connector`].
pub const ATT_CID: &str = "clickhouse.connection.id";
/// Query id sent with every query packet.
pub const ATT_QID: &str = "clickhouse.query.id";
/// Address a connection was dialed against.
pub const ATT_ADDR: &str = "server.address";
