//! Test support: tracing setup, an in-process mock of the native server, and a `ClickHouse`
//! container for end-to-end runs.
use std::collections::VecDeque;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::connection::Connection;
use crate::io::{ClickHouseBytesRead, ClickHouseBytesWrite, read_frame};
use crate::native::block::Block;
use crate::native::protocol::{
    ClientPacketId, DBMS_MIN_PROTOCOL_VERSION_WITH_ADDENDUM, DBMS_TCP_PROTOCOL_VERSION,
    ReceivedQuery, ServerHello, ServerPacketId,
};
use crate::native::{Progress, ServerError};
use crate::prelude::*;
use crate::transport::NativeTransport;

/// Initialize tracing in a test setup
pub fn init_tracing(directives: Option<&[(&str, &str)]>) {
    let rust_log = env::var("RUST_LOG").unwrap_or_default();

    let stdio_logger = tracing_subscriber::fmt::Layer::default()
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .with_test_writer()
        .with_filter(get_filter(&rust_log, directives));

    // Initialize only if not already set (avoids multiple subscribers in tests)
    if tracing::subscriber::set_global_default(tracing_subscriber::registry().with(stdio_logger))
        .is_ok()
    {
        debug!("Tracing initialized with RUST_LOG={rust_log}");
    }
}

/// Common tracing filters. Directives that fail to parse are skipped.
pub fn get_filter(rust_log: &str, directives: Option<&[(&str, &str)]>) -> EnvFilter {
    let mut env_dirs = vec![];
    let level = if rust_log.is_empty() {
        LevelFilter::WARN.to_string()
    } else if let Ok(level) = LevelFilter::from_str(rust_log) {
        level.to_string()
    } else {
        let mut parts = rust_log.split(',');
        let level = parts.next().and_then(|p| LevelFilter::from_str(p).ok());
        env_dirs = parts
            .map(|s| s.split('=').collect::<VecDeque<_>>())
            .filter_map(|mut s| Some((s.pop_front()?.to_string(), s.pop_front()?.to_string())))
            .collect::<Vec<_>>();
        level.unwrap_or(LevelFilter::WARN).to_string()
    };

    let extra = ["tokio=info", "runtime=error", "hyper_util=info", "rustls=info"]
        .into_iter()
        .map(ToString::to_string)
        .chain(directives.unwrap_or_default().iter().map(|(k, v)| format!("{k}={v}")))
        .chain(env_dirs.into_iter().map(|(k, v)| format!("{k}={v}")));

    extra.fold(EnvFilter::new(level), |filter, directive| match directive.parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    })
}

/// A query as the mock server decoded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockQuery {
    pub id:       String,
    pub text:     String,
    /// Settings in the order they were sent, values in their string form.
    pub settings: Vec<(String, String)>,
}

impl MockQuery {
    pub fn setting(&self, name: &str) -> Option<&str> {
        self.settings.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

/// Something the mock server received, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    Hello { database: String, username: String },
    Query(MockQuery),
    /// A non-empty data block sent by the client, as rows of cells.
    Data(Vec<Vec<Value>>),
    Ping,
    Cancel,
}

/// One step of the server's answer to a query.
#[derive(Debug)]
pub enum MockPacket {
    Data(Block),
    Totals(Block),
    Exception(ServerError),
    Progress(Progress),
    EndOfStream,
    /// Reads client data blocks up to and including the terminating empty block.
    ReadData,
    /// Stops answering.
    Hang,
}

impl MockPacket {
    /// A result set: the empty header block, `blocks`, then end of stream.
    ///
    /// # Errors
    /// When `blocks` is empty or its first block has an unsupported column type.
    pub fn select(blocks: Vec<Block>) -> Result<Vec<MockPacket>> {
        let header = blocks.first().ok_or(Error::Usage("select needs at least one block"))?.empty_like()?;
        let mut packets = vec![MockPacket::Data(header)];
        packets.extend(blocks.into_iter().map(MockPacket::Data));
        packets.push(MockPacket::EndOfStream);
        Ok(packets)
    }

    /// A prepared insert: the column header, the client's rows, then end of stream.
    pub fn insert(header: Block) -> Vec<MockPacket> {
        vec![MockPacket::Data(header), MockPacket::ReadData, MockPacket::EndOfStream]
    }

    pub fn error(code: i32, message: impl Into<String>) -> Vec<MockPacket> {
        vec![MockPacket::Exception(ServerError {
            code,
            name: "DB::Exception".into(),
            message: message.into(),
            stack_trace: String::new(),
            nested: None,
        })]
    }
}

type Handler = Arc<dyn Fn(&MockQuery) -> Vec<MockPacket> + Send + Sync>;

/// An in-process native protocol server answering queries through a handler.
#[derive(Clone)]
pub struct MockServer {
    handler: Handler,
    events:  Arc<Mutex<Vec<MockEvent>>>,
    hello:   ServerHello,
}

impl std::fmt::Debug for MockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServer").field("events", &self.events.lock().len()).finish_non_exhaustive()
    }
}

enum Incoming {
    Hello { database: String, username: String, revision: u64 },
    Query(ReceivedQuery),
    Data(Block),
    Ping,
    Cancel,
}

impl MockServer {
    pub fn new(handler: impl Fn(&MockQuery) -> Vec<MockPacket> + Send + Sync + 'static) -> Self {
        MockServer {
            handler: Arc::new(handler),
            events:  Arc::default(),
            hello:   ServerHello {
                server_name:      "ClickHouse".into(),
                major_version:    24,
                minor_version:    8,
                patch_version:    1,
                revision_version: DBMS_TCP_PROTOCOL_VERSION,
                timezone:         Some("UTC".into()),
                display_name:     Some("mock".into()),
            },
        }
    }

    /// Everything received so far.
    pub fn events(&self) -> Vec<MockEvent> { self.events.lock().clone() }

    pub fn queries(&self) -> Vec<MockQuery> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MockEvent::Query(q) => Some(q),
                _ => None,
            })
            .collect()
    }

    /// Data blocks received from the client.
    pub fn data_blocks(&self) -> Vec<Vec<Vec<Value>>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MockEvent::Data(rows) => Some(rows),
                _ => None,
            })
            .collect()
    }

    /// Opens a native connection to this server over an in-memory pipe.
    ///
    /// # Errors
    /// Handshake failures.
    pub async fn connect(&self, id: u64, options: Options) -> Result<Conn> {
        let (client, server) = tokio::io::duplex(1 << 20);
        let this = self.clone();
        drop(tokio::spawn(async move { this.serve(server).await }));

        let mut options = options;
        options.apply_defaults();
        let conn = Connection::handshake(id, "mock:9000", Box::new(client), Arc::new(options)).await?;
        Ok(Conn::new(Box::new(NativeTransport::new(conn))))
    }

    /// Serves every connection accepted on a fresh local port.
    ///
    /// # Errors
    /// When the port cannot be bound.
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let this = self.clone();
        drop(tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let server = this.clone();
                drop(tokio::spawn(async move { server.serve(stream).await }));
            }
        }));
        Ok(addr)
    }

    async fn serve<S: AsyncRead + AsyncWrite + Unpin>(&self, mut stream: S) {
        if let Err(error) = self.run(&mut stream).await {
            if !matches!(error, Error::ConnectionClosed) {
                debug!(?error, "mock server stopped");
            }
        }
    }

    async fn run<S: AsyncRead + AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<()> {
        let mut buffer = BytesMut::new();
        let mut out = BytesMut::new();

        let Incoming::Hello { database, username, revision } =
            read_frame(stream, &mut buffer, |r| decode_incoming(r, 0)).await?
        else {
            return Err(Error::Protocol("expected client hello".into()));
        };
        self.record(MockEvent::Hello { database, username });
        let revision = revision.min(self.hello.revision_version);

        self.hello.encode(&mut out);
        flush(stream, &mut out).await?;
        if revision >= DBMS_MIN_PROTOCOL_VERSION_WITH_ADDENDUM {
            let _quota_key = read_frame(stream, &mut buffer, |r| r.try_get_string()).await?;
        }

        loop {
            match read_frame(stream, &mut buffer, |r| decode_incoming(r, revision)).await? {
                Incoming::Ping => {
                    self.record(MockEvent::Ping);
                    out.put_var_uint(ServerPacketId::Pong as u64);
                    flush(stream, &mut out).await?;
                }
                Incoming::Cancel => self.record(MockEvent::Cancel),
                Incoming::Data(block) => self.record_block(&block)?,
                Incoming::Hello { .. } => return Err(Error::Protocol("repeated hello".into())),
                Incoming::Query(query) => {
                    // The query packet is always followed by an empty data block
                    let _ = read_frame(stream, &mut buffer, |r| decode_incoming(r, revision)).await?;
                    let query = MockQuery { id: query.id, text: query.text, settings: query.settings };
                    self.record(MockEvent::Query(query.clone()));

                    for packet in (self.handler)(&query) {
                        match packet {
                            MockPacket::Data(block) => write_block(&mut out, ServerPacketId::Data, &block, revision),
                            MockPacket::Totals(block) => {
                                write_block(&mut out, ServerPacketId::Totals, &block, revision);
                            }
                            MockPacket::Exception(error) => {
                                out.put_var_uint(ServerPacketId::Exception as u64);
                                error.encode(&mut out);
                            }
                            MockPacket::Progress(progress) => progress.encode(&mut out),
                            MockPacket::EndOfStream => out.put_var_uint(ServerPacketId::EndOfStream as u64),
                            MockPacket::ReadData => {
                                flush(stream, &mut out).await?;
                                loop {
                                    match read_frame(stream, &mut buffer, |r| decode_incoming(r, revision)).await? {
                                        Incoming::Data(block) if block.is_empty() => break,
                                        Incoming::Data(block) => self.record_block(&block)?,
                                        _ => return Err(Error::Protocol("expected client data".into())),
                                    }
                                }
                            }
                            MockPacket::Hang => {
                                flush(stream, &mut out).await?;
                                std::future::pending::<()>().await;
                            }
                        }
                    }
                    flush(stream, &mut out).await?;
                }
            }
        }
    }

    fn record(&self, event: MockEvent) {
        trace!(?event, "mock server received");
        self.events.lock().push(event);
    }

    fn record_block(&self, block: &Block) -> Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        let rows = (0..block.rows())
            .map(|row| block.columns().iter().map(|c| c.row(row, true)).collect::<Result<Vec<_>>>())
            .collect::<Result<Vec<_>>>()?;
        self.record(MockEvent::Data(rows));
        Ok(())
    }
}

fn decode_incoming(reader: &mut &[u8], revision: u64) -> Result<Incoming> {
    Ok(match ClientPacketId::from_u64(reader.try_get_var_uint()?)? {
        ClientPacketId::Hello => {
            let _client_name = reader.try_get_string()?;
            let _major = reader.try_get_var_uint()?;
            let _minor = reader.try_get_var_uint()?;
            let revision = reader.try_get_var_uint()?;
            let database = reader.try_get_utf8_string()?;
            let username = reader.try_get_utf8_string()?;
            let _password = reader.try_get_string()?;
            Incoming::Hello { database, username, revision }
        }
        ClientPacketId::Query => Incoming::Query(ReceivedQuery::decode(reader, revision)?),
        ClientPacketId::Data => {
            let _table = reader.try_get_string()?;
            Incoming::Data(Block::decode(reader, revision)?)
        }
        ClientPacketId::Cancel => Incoming::Cancel,
        ClientPacketId::Ping => Incoming::Ping,
    })
}

fn write_block(out: &mut BytesMut, id: ServerPacketId, block: &Block, revision: u64) {
    out.put_var_uint(id as u64);
    out.put_string(""); // Temporary table name
    block.encode(out, revision);
}

async fn flush<S: AsyncWrite + Unpin>(stream: &mut S, out: &mut BytesMut) -> Result<()> {
    if !out.is_empty() {
        stream.write_all(out).await?;
        stream.flush().await?;
        out.clear();
    }
    Ok(())
}

#[cfg(feature = "test-utils")]
pub use container::*;

#[cfg(feature = "test-utils")]
mod container {
    use std::env;
    use std::time::Duration;

    use testcontainers::core::IntoContainerPort;
    use testcontainers::runners::AsyncRunner;
    use testcontainers::{ContainerAsync, GenericImage, ImageExt, TestcontainersError};
    use tokio::sync::RwLock;
    use tokio::time::sleep;

    use crate::prelude::*;

    pub const ENDPOINT_ENV: &str = "CLICKHOUSE_ENDPOINT";
    pub const VERSION_ENV: &str = "CLICKHOUSE_VERSION";
    pub const NATIVE_PORT_ENV: &str = "CLICKHOUSE_NATIVE_PORT";
    pub const HTTP_PORT_ENV: &str = "CLICKHOUSE_HTTP_PORT";
    pub const USER_ENV: &str = "CLICKHOUSE_USER";
    pub const PASSWORD_ENV: &str = "CLICKHOUSE_PASSWORD";

    // Env defaults
    const CLICKHOUSE_USER: &str = "clickhouse";
    const CLICKHOUSE_PASSWORD: &str = "clickhouse";
    const CLICKHOUSE_VERSION: &str = "latest";
    const CLICKHOUSE_NATIVE_PORT: u16 = 9000;
    const CLICKHOUSE_HTTP_PORT: u16 = 8123;
    const CLICKHOUSE_ENDPOINT: &str = "localhost";

    /// A `ClickHouse` server in a container.
    pub struct ClickHouseContainer {
        pub endpoint:    String,
        pub native_port: u16,
        pub http_port:   u16,
        pub user:        String,
        pub password:    String,
        container:       RwLock<Option<ContainerAsync<GenericImage>>>,
    }

    impl ClickHouseContainer {
        /// # Errors
        pub async fn try_new() -> Result<Self, TestcontainersError> {
            // Env vars
            let version = env::var(VERSION_ENV).unwrap_or(CLICKHOUSE_VERSION.to_string());
            let native_port = env::var(NATIVE_PORT_ENV)
                .ok()
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(CLICKHOUSE_NATIVE_PORT);
            let http_port = env::var(HTTP_PORT_ENV)
                .ok()
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(CLICKHOUSE_HTTP_PORT);
            let user = env::var(USER_ENV).ok().unwrap_or(CLICKHOUSE_USER.into());
            let password = env::var(PASSWORD_ENV).ok().unwrap_or(CLICKHOUSE_PASSWORD.into());

            let image = GenericImage::new("clickhouse/clickhouse-server", &version)
                .with_exposed_port(native_port.tcp())
                .with_exposed_port(http_port.tcp())
                .with_wait_for(testcontainers::core::WaitFor::message_on_stderr(
                    "Ready for connections",
                ))
                .with_env_var(USER_ENV, &user)
                .with_env_var(PASSWORD_ENV, &password);

            let container = image.start().await?;
            let native_port = container.get_host_port_ipv4(native_port).await?;
            let http_port = container.get_host_port_ipv4(http_port).await?;
            let endpoint = env::var(ENDPOINT_ENV).unwrap_or(CLICKHOUSE_ENDPOINT.to_string());

            // Pause
            sleep(Duration::from_secs(2)).await;

            let container = RwLock::new(Some(container));
            Ok(ClickHouseContainer { endpoint, native_port, http_port, user, password, container })
        }

        pub fn native_addr(&self) -> String { format!("{}:{}", self.endpoint, self.native_port) }

        pub fn http_addr(&self) -> String { format!("{}:{}", self.endpoint, self.http_port) }

        /// Options pointing at the container's native port.
        pub fn options(&self) -> Options {
            Options::default()
                .with_addrs([self.native_addr()])
                .with_username(&self.user)
                .with_password(self.password.as_str())
        }

        /// # Errors
        pub async fn shutdown(&self) -> Result<(), TestcontainersError> {
            let mut container = self.container.write().await;
            if let Some(container) = container.take() {
                let _ = container
                    .stop_with_timeout(Some(0))
                    .await
                    .inspect_err(|error| {
                        error!(?error, "Failed to stop container, will attempt to remove");
                    })
                    .ok();
                let _ = container
                    .rm()
                    .await
                    .inspect_err(|error| {
                        error!(?error, "Failed to rm container, cleanup manually");
                    })
                    .ok();
            }
            Ok(())
        }
    }
}
