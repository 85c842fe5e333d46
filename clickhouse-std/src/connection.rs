//! A single native protocol channel.
//!
//! A [`Connection`] runs one operation at a time. Any failure that leaves the protocol state
//! unknown (io errors, malformed packets, cancellation mid-operation) marks the connection bad;
//! a bad connection refuses further work with [`Error::BadConnection`] and is never repaired.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use opentelemetry_semantic_conventions::attribute;
use tokio::io::AsyncWriteExt;

use crate::constants::READ_CHUNK_SIZE;
use crate::context::Context;
use crate::io::{ClickHouseBytesRead, ClickHouseBytesWrite, read_frame};
use crate::native::block::Block;
use crate::native::protocol::{
    ClientHello, ClientPacketId, Query, ServerError, ServerHello, ServerPacket, ServerPacketId,
};
use crate::options::Options;
use crate::prelude::*;
use crate::query::{insert_statement, is_insert};
use crate::settings::Settings;
use crate::tcp::{self, Io};

/// What a running query produced next.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Block),
    Totals(Block),
    End,
}

#[derive(Debug)]
pub(crate) struct Connection {
    id:       u64,
    addr:     String,
    stream:   Box<dyn Io>,
    buffer:   BytesMut,
    server:   ServerHello,
    options:  Arc<Options>,
    os_user:  String,
    hostname: String,
    bad:      bool,
    closed:   bool,
}

impl Connection {
    /// Dials `addr` and performs the handshake.
    #[instrument(
        level = "trace",
        name = "clickhouse.connection.create",
        skip_all,
        fields(
            clickhouse.connection.id = id,
            server.address = addr,
            db.system = "clickhouse",
            network.transport = if options.tls { "tls" } else { "tcp" },
        ),
        err
    )]
    pub(crate) async fn connect(
        id: u64,
        addr: &str,
        options: Arc<Options>,
        ctx: &Context,
    ) -> Result<Self> {
        ctx.run(async {
            let stream = with_timeout(options.dial_timeout, tcp::dial(addr, &options)).await?;
            Self::handshake(id, addr, stream, Arc::clone(&options)).await
        })
        .await
    }

    /// Performs the handshake over an already established stream.
    pub(crate) async fn handshake(
        id: u64,
        addr: &str,
        stream: Box<dyn Io>,
        options: Arc<Options>,
    ) -> Result<Self> {
        let mut conn = Connection {
            id,
            addr: addr.to_string(),
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            server: ServerHello::default(),
            os_user: std::env::var("USER").or_else(|_| std::env::var("USERNAME")).unwrap_or_default(),
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            options,
            bad: false,
            closed: false,
        };

        let mut buf = BytesMut::new();
        ClientHello {
            client_name: &conn.options.client_name,
            database:    &conn.options.auth.database,
            username:    &conn.options.auth.username,
            password:    conn.options.auth.password.get(),
        }
        .encode(&mut buf);
        conn.write(&buf)
            .await
            .inspect_err(|error| error!(?error, { ATT_CID } = id, "Failed to send hello"))?;

        let timeout = conn.options.dial_timeout;
        let hello = with_timeout(
            timeout,
            read_frame(&mut conn.stream, &mut conn.buffer, |reader| {
                match ServerPacketId::from_u64(reader.try_get_var_uint()?)? {
                    ServerPacketId::Hello => Ok(Ok(ServerHello::decode(reader)?)),
                    ServerPacketId::Exception => Ok(Err(ServerError::decode(reader)?)),
                    packet => Err(Error::Protocol(format!(
                        "unexpected packet {}, expected server hello",
                        packet.as_ref()
                    ))),
                }
            }),
        )
        .await
        .inspect_err(|error| error!(?error, { ATT_CID } = id, "Failed to receive hello"))??;
        conn.server = hello;

        // No-op if revision doesn't match
        buf.clear();
        ClientHello::encode_addendum(&mut buf, conn.server.revision_version);
        if !buf.is_empty() {
            conn.write(&buf).await?;
        }

        debug!(
            { ATT_CID } = id,
            server = %conn.server.server_name,
            revision = conn.server.revision_version,
            "Finished handshake"
        );
        Ok(conn)
    }

    pub(crate) fn id(&self) -> u64 { self.id }

    pub(crate) fn addr(&self) -> &str { &self.addr }

    pub(crate) fn is_bad(&self) -> bool { self.bad }

    pub(crate) fn is_closed(&self) -> bool { self.closed }

    /// `major.minor.patch` of the server.
    pub(crate) fn server_version(&self) -> String {
        let ServerHello { major_version, minor_version, patch_version, .. } = &self.server;
        format!("{major_version}.{minor_version}.{patch_version}")
    }

    pub(crate) fn server_timezone(&self) -> Option<&str> { self.server.timezone.as_deref() }

    #[instrument(level = "trace", name = "clickhouse.ping", skip_all, fields(clickhouse.connection.id = self.id))]
    pub(crate) async fn ping(&mut self, ctx: &Context) -> Result<()> {
        self.usable()?;
        let result = ctx
            .run(async {
                let mut buf = BytesMut::new();
                buf.put_var_uint(ClientPacketId::Ping as u64);
                self.write(&buf).await?;
                match self.next_packet().await? {
                    ServerPacket::Pong => Ok(()),
                    packet => Err(unexpected(&packet, "pong")),
                }
            })
            .await;
        self.observe(result)
    }

    /// Runs a statement, discarding any result blocks.
    #[instrument(
        level = "trace",
        name = "clickhouse.exec",
        skip_all,
        fields(clickhouse.connection.id = self.id, clickhouse.query.id)
    )]
    pub(crate) async fn exec(&mut self, ctx: &Context, query: &str) -> Result<()> {
        self.usable()?;
        let result = ctx.run(self.exec_inner(ctx, query, None)).await;
        self.observe(result)
    }

    /// Hands an insert to the server's async insert queue.
    #[instrument(
        level = "trace",
        name = "clickhouse.async_insert",
        skip_all,
        fields(clickhouse.connection.id = self.id, clickhouse.query.id, wait = wait)
    )]
    pub(crate) async fn async_insert(&mut self, ctx: &Context, query: &str, wait: bool) -> Result<()> {
        self.usable()?;
        let settings = Settings::default()
            .with_setting("async_insert", 1)
            .with_setting("wait_for_async_insert", u8::from(wait));
        let result = ctx.run(self.exec_inner(ctx, query, Some(&settings))).await;
        self.observe(result)
    }

    /// Starts a query, returning its header block and whether the stream already ended.
    #[instrument(
        level = "trace",
        name = "clickhouse.query",
        skip_all,
        fields(clickhouse.connection.id = self.id, clickhouse.query.id)
    )]
    pub(crate) async fn query(&mut self, ctx: &Context, query: &str) -> Result<(Block, bool)> {
        self.usable()?;
        let result = ctx
            .run(async {
                self.send_query(ctx, query, None).await?;
                loop {
                    match self.next_packet().await? {
                        ServerPacket::Data(block) => return Ok((block, false)),
                        ServerPacket::EndOfStream => return Ok((Block::default(), true)),
                        ServerPacket::Extremes(_) => {}
                        packet => return Err(unexpected(&packet, "header block")),
                    }
                }
            })
            .await;
        self.observe(result)
    }

    /// The next event of a running query.
    pub(crate) async fn next_event(&mut self, ctx: &Context) -> Result<StreamEvent> {
        self.usable()?;
        let result = ctx
            .run(async {
                loop {
                    match self.next_packet().await? {
                        ServerPacket::Data(block) => return Ok(StreamEvent::Data(block)),
                        ServerPacket::Totals(block) => return Ok(StreamEvent::Totals(block)),
                        ServerPacket::EndOfStream => return Ok(StreamEvent::End),
                        ServerPacket::Extremes(_) => {}
                        packet => return Err(unexpected(&packet, "data block")),
                    }
                }
            })
            .await;
        self.observe(result)
    }

    /// Reads a running query to its end.
    pub(crate) async fn drain(&mut self, ctx: &Context) -> Result<()> {
        while !matches!(self.next_event(ctx).await?, StreamEvent::End) {}
        Ok(())
    }

    /// Sends an insert statement and waits for the header block describing the columns the server
    /// expects.
    #[instrument(
        level = "trace",
        name = "clickhouse.prepare_insert",
        skip_all,
        fields(clickhouse.connection.id = self.id, clickhouse.query.id)
    )]
    pub(crate) async fn prepare_insert(&mut self, ctx: &Context, query: &str) -> Result<Block> {
        self.usable()?;
        let query = insert_statement(query);
        let result = ctx
            .run(async {
                self.send_query(ctx, &query, None).await?;
                match self.next_packet().await? {
                    ServerPacket::Data(header) => Ok(header),
                    packet => Err(unexpected(&packet, "insert header block")),
                }
            })
            .await;
        self.observe(result)
    }

    /// Sends the rows of a prepared insert followed by the terminating empty block, then waits for
    /// the server to acknowledge.
    #[instrument(
        level = "trace",
        name = "clickhouse.send_batch",
        skip_all,
        fields(clickhouse.connection.id = self.id, rows = block.rows())
    )]
    pub(crate) async fn send_batch(&mut self, ctx: &Context, block: &Block) -> Result<()> {
        self.usable()?;
        let result = ctx
            .run(async {
                let revision = self.server.revision_version;
                let mut buf = BytesMut::new();
                if !block.is_empty() {
                    block.encode_data_packet(&mut buf, revision);
                }
                Block::default().encode_data_packet(&mut buf, revision);
                self.write(&buf).await?;
                self.finish().await
            })
            .await;
        self.observe(result)
    }

    /// Shuts the stream down. Closing twice is a no-op.
    pub(crate) async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(error) = self.stream.shutdown().await {
            trace!(?error, { ATT_CID } = self.id, "shutdown failed");
        }
        debug!({ ATT_CID } = self.id, "connection closed");
        Ok(())
    }

    /// Marks the connection unusable.
    pub(crate) fn mark_bad(&mut self) {
        if !self.bad {
            error!({ ATT_CID } = self.id, addr = %self.addr, "marking connection bad");
        }
        self.bad = true;
    }

    fn usable(&self) -> Result<()> {
        if self.closed {
            Err(Error::ConnectionClosed)
        } else if self.bad {
            Err(Error::BadConnection)
        } else {
            Ok(())
        }
    }

    fn observe<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            if error.breaks_connection() {
                error!(?error, { ATT_CID } = self.id, "operation failed mid-protocol");
                self.mark_bad();
            }
        }
        result
    }

    async fn exec_inner(
        &mut self,
        ctx: &Context,
        query: &str,
        extra: Option<&Settings>,
    ) -> Result<()> {
        self.send_query(ctx, query, extra).await?;
        let mut terminated = false;
        loop {
            match self.next_packet().await? {
                ServerPacket::EndOfStream => return Ok(()),
                // An insert without inline data waits for blocks, send none
                ServerPacket::Data(_) if is_insert(query) && !terminated => {
                    let mut buf = BytesMut::new();
                    Block::default().encode_data_packet(&mut buf, self.server.revision_version);
                    self.write(&buf).await?;
                    terminated = true;
                }
                ServerPacket::Data(_) | ServerPacket::Totals(_) | ServerPacket::Extremes(_) => {}
                packet => return Err(unexpected(&packet, "end of stream")),
            }
        }
    }

    async fn send_query(&mut self, ctx: &Context, text: &str, extra: Option<&Settings>) -> Result<()> {
        let qid = ctx.query_id();
        let _ = Span::current().record(ATT_QID, tracing::field::display(qid));

        let mut settings = self.options.settings.merged(ctx.settings());
        if let Some(extra) = extra {
            settings = settings.merged(extra);
        }

        let mut buf = BytesMut::new();
        Query {
            qid,
            text,
            settings: &settings,
            client_name: &self.options.client_name,
            os_user: &self.os_user,
            hostname: &self.hostname,
        }
        .encode(&mut buf, self.server.revision_version);

        let cid = self.id;
        self.write(&buf)
            .instrument(trace_span!(
                "flush_query",
                { ATT_CID } = cid,
                { ATT_QID } = %qid,
                { attribute::DB_QUERY_TEXT } = text,
            ))
            .await?;
        trace!({ ATT_QID } = %qid, { ATT_CID } = cid, "query sent");
        Ok(())
    }

    /// Reads packets up to the end of the stream, ignoring result blocks.
    async fn finish(&mut self) -> Result<()> {
        loop {
            match self.next_packet().await? {
                ServerPacket::EndOfStream => return Ok(()),
                ServerPacket::Data(_) | ServerPacket::Totals(_) | ServerPacket::Extremes(_) => {}
                packet => return Err(unexpected(&packet, "end of stream")),
            }
        }
    }

    /// Reads packets until one that drives the current operation arrives. Informational packets
    /// are logged and skipped, exceptions are returned as errors.
    async fn next_packet(&mut self) -> Result<ServerPacket> {
        loop {
            match self.read_packet().await? {
                ServerPacket::Exception(exception) => {
                    debug!({ ATT_CID } = self.id, %exception, "server exception");
                    return Err(exception.into());
                }
                ServerPacket::Progress(progress) => {
                    trace!({ ATT_CID } = self.id, ?progress, "progress");
                }
                ServerPacket::ProfileInfo(info) => {
                    trace!(
                        { ATT_CID } = self.id,
                        rows = info.rows,
                        blocks = info.blocks,
                        bytes = info.bytes,
                        applied_limit = info.applied_limit,
                        rows_before_limit = info.rows_before_limit,
                        calculated_rows_before_limit = info.calculated_rows_before_limit,
                        "profile info"
                    );
                }
                ServerPacket::ProfileEvents(_)
                | ServerPacket::Log(_)
                | ServerPacket::TableColumns { .. } => {}
                packet => return Ok(packet),
            }
        }
    }

    async fn read_packet(&mut self) -> Result<ServerPacket> {
        let revision = self.server.revision_version;
        let read = read_frame(&mut self.stream, &mut self.buffer, |reader| {
            ServerPacket::decode(reader, revision)
        });
        let packet = with_timeout(self.options.read_timeout, read).await?;
        trace!({ ATT_CID } = self.id, packet = packet.as_ref(), "received packet");
        Ok(packet)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

fn unexpected(packet: &ServerPacket, expected: &str) -> Error {
    Error::Protocol(format!("unexpected packet {}, expected {expected}", packet.as_ref()))
}

/// Bounds `fut` by `timeout`. A zero timeout means no bound.
pub(crate) async fn with_timeout<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    if timeout.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(timeout, fut).await.map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("timed out after {timeout:?}"),
        ))
    })?
}
