//! Opening connections across a list of addresses.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use crate::prelude::*;
use crate::transport::{HttpTransport, NativeTransport, Transport};

static GLOBAL_IDS: LazyLock<Arc<ConnectionIds>> = LazyLock::new(|| Arc::new(ConnectionIds::new()));

/// Monotonic source of connection ids. Round-robin opening derives the first address to try from
/// the id, so connectors sharing one counter spread their connections across addresses even when
/// opening concurrently.
#[derive(Debug, Default)]
pub struct ConnectionIds(AtomicU64);

impl ConnectionIds {
    pub const fn new() -> Self { Self(AtomicU64::new(0)) }

    /// The process-wide counter used by [`Connector::try_new`].
    pub fn global() -> Arc<ConnectionIds> { Arc::clone(&GLOBAL_IDS) }

    /// Hands out the next id. The first id is 1.
    pub fn next_id(&self) -> u64 { self.0.fetch_add(1, Ordering::Relaxed) + 1 }
}

/// The order in which the `n` configured addresses are tried for connection `id`.
pub fn dial_order(strategy: ConnOpenStrategy, id: u64, n: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    #[expect(clippy::cast_possible_truncation)]
    let start = match strategy {
        ConnOpenStrategy::InOrder => 0,
        ConnOpenStrategy::RoundRobin => (id % n as u64) as usize,
    };
    (0..n).map(|i| (start + i) % n).collect()
}

/// Opens [`Conn`]s from validated [`Options`].
#[derive(Debug, Clone)]
pub struct Connector {
    options: Arc<Options>,
    ids:     Arc<ConnectionIds>,
}

impl Connector {
    /// Validates `options`, fills defaults, and draws ids from the process-wide counter.
    ///
    /// # Errors
    /// [`Error::InvalidSettings`] when pool sizing options are set.
    pub fn try_new(options: Options) -> Result<Self> { Self::with_ids(options, ConnectionIds::global()) }

    /// Like [`Connector::try_new`] with an explicit id counter.
    ///
    /// # Errors
    /// [`Error::InvalidSettings`] when pool sizing options are set.
    pub fn with_ids(mut options: Options, ids: Arc<ConnectionIds>) -> Result<Self> {
        options.validate()?;
        options.apply_defaults();
        Ok(Connector { options: Arc::new(options), ids })
    }

    /// # Errors
    /// See [`Options::from_dsn`] and [`Connector::try_new`].
    pub fn from_dsn(dsn: &str) -> Result<Self> { Self::try_new(Options::from_dsn(dsn)?) }

    pub fn options(&self) -> &Options { &self.options }

    /// Opens a connection, trying each address once in strategy order.
    ///
    /// # Errors
    /// The error of the last address tried when none could be opened. Cancellation stops the
    /// fan-out immediately.
    #[instrument(
        level = "debug",
        name = "clickhouse.connect",
        skip_all,
        fields(clickhouse.connection.id, strategy = self.options.conn_open_strategy.as_ref())
    )]
    pub async fn connect(&self, ctx: &Context) -> Result<Conn> {
        let id = self.ids.next_id();
        let _ = Span::current().record(ATT_CID, id);

        let addrs = &self.options.addrs;
        let mut last_error = None;
        for index in dial_order(self.options.conn_open_strategy, id, addrs.len()) {
            let addr = &addrs[index];
            match self.dial(id, addr, ctx).await {
                Ok(transport) => {
                    debug!({ ATT_CID } = id, { ATT_ADDR } = %addr, "connection opened");
                    return Ok(Conn::new(transport));
                }
                Err(error) if error.is_interrupt() => return Err(error),
                Err(error) => {
                    warn!(?error, { ATT_CID } = id, { ATT_ADDR } = %addr, "dial failed");
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or(Error::MissingConnectionInformation))
    }

    async fn dial(&self, id: u64, addr: &str, ctx: &Context) -> Result<Box<dyn Transport>> {
        let options = Arc::clone(&self.options);
        let transport: Box<dyn Transport> = match self.options.protocol {
            Protocol::Native => Box::new(NativeTransport::connect(id, addr, options, ctx).await?),
            Protocol::Http => Box::new(HttpTransport::connect(id, addr, options, ctx).await?),
        };
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_round_robin_order() {
        for n in [1usize, 3, 5] {
            for k in [0u64, 1, 2, 4, 5, 7, 11, 1_000_003] {
                let expected: Vec<usize> =
                    (0..n).map(|i| usize::try_from((k + i as u64) % n as u64).unwrap()).collect();
                assert_eq!(dial_order(ConnOpenStrategy::RoundRobin, k, n), expected, "n={n} k={k}");
            }
        }
        assert_eq!(dial_order(ConnOpenStrategy::RoundRobin, 4, 3), vec![1, 2, 0]);
        assert!(dial_order(ConnOpenStrategy::RoundRobin, 4, 0).is_empty());
    }

    #[test]
    fn test_in_order_ignores_id() {
        assert_eq!(dial_order(ConnOpenStrategy::InOrder, 9, 3), vec![0, 1, 2]);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let ids = ConnectionIds::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn test_conflicting_pool_options_fail_fast() {
        let mut options = Options::default();
        options.max_idle_conns = 4;
        options.conn_max_lifetime = Duration::from_secs(60);
        let err = Connector::try_new(options).unwrap_err();
        assert!(matches!(&err, Error::InvalidSettings(names) if names == &["max_idle_conns", "conn_max_lifetime"]));
        assert!(err.to_string().contains("max_idle_conns, conn_max_lifetime"));
    }

    #[test]
    fn test_defaults_applied() {
        let connector = Connector::try_new(Options::default()).unwrap();
        assert_eq!(connector.options().addrs, vec!["localhost:9000".to_string()]);
        assert_eq!(connector.options().auth.username, "default");
    }
}
