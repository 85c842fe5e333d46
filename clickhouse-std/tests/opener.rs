#![allow(unused_crate_dependencies)]

pub mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clickhouse_std::prelude::*;
use clickhouse_std::test_utils::{MockEvent, MockPacket, MockServer};
use clickhouse_std::{CancellationToken, ConnectionManager, bb8};
use common::*;
use futures_util::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// A local address nothing listens on.
async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn hellos(server: &MockServer) -> usize {
    server.events().iter().filter(|e| matches!(e, MockEvent::Hello { .. })).count()
}

fn options(addrs: &[SocketAddr]) -> Options {
    Options::default()
        .with_addrs(addrs.iter().map(ToString::to_string))
        .with_dial_timeout(Duration::from_secs(2))
}

#[tokio::test]
async fn test_round_robin_spreads_connections() {
    let servers = (0..3).map(|_| init(|_| vec![MockPacket::EndOfStream])).collect::<Vec<_>>();
    let mut addrs = vec![];
    for server in &servers {
        addrs.push(server.listen().await.unwrap());
    }

    let connector = Connector::with_ids(
        options(&addrs).with_conn_open_strategy(ConnOpenStrategy::RoundRobin),
        Arc::new(ConnectionIds::new()),
    )
    .unwrap();

    header("round robin over three servers");
    let ctx = Context::new();
    let mut conns = vec![];
    for expected_id in 1..=3 {
        let conn = connector.connect(&ctx).await.unwrap();
        assert_eq!(conn.id(), expected_id);
        conns.push(conn);
    }
    // Ids 1, 2, 3 start at addresses 1, 2, 0
    assert_eq!(servers.iter().map(hellos).collect::<Vec<_>>(), vec![1, 1, 1]);

    let mut conn = connector.connect(&ctx).await.unwrap();
    assert_eq!(conn.id(), 4);
    conn.ping(&ctx).await.unwrap();
    assert_eq!(hellos(&servers[1]), 2);
}

#[tokio::test]
async fn test_concurrent_opens_draw_distinct_ids() {
    let server = init(|_| vec![MockPacket::EndOfStream]);
    let addr = server.listen().await.unwrap();
    let connector = Connector::with_ids(options(&[addr]), Arc::new(ConnectionIds::new())).unwrap();

    let ctx = Context::new();
    let conns = join_all((0..8).map(|_| connector.connect(&ctx))).await;
    let mut ids = conns.into_iter().map(|c| c.unwrap().id()).collect::<Vec<_>>();
    ids.sort_unstable();
    assert_eq!(ids, (1..=8).collect::<Vec<_>>());
    assert_eq!(hellos(&server), 8);
}

#[tokio::test]
async fn test_in_order_skips_dead_addresses() {
    let server = init(|_| vec![MockPacket::EndOfStream]);
    let live = server.listen().await.unwrap();
    let dead = dead_addr().await;

    let connector = Connector::with_ids(
        options(&[dead, live]).with_database("analytics"),
        Arc::new(ConnectionIds::new()),
    )
    .unwrap();
    let mut conn = connector.connect(&Context::new()).await.unwrap();
    conn.ping(&Context::new()).await.unwrap();
    assert_eq!(server.events()[0], MockEvent::Hello {
        database: "analytics".into(),
        username: "default".into(),
    });
}

#[tokio::test]
async fn test_all_addresses_dead_returns_last_error() {
    init_tracing_only();
    let addrs = [dead_addr().await, dead_addr().await];
    let connector = Connector::with_ids(options(&addrs), Arc::new(ConnectionIds::new())).unwrap();
    let result = connector.connect(&Context::new()).await;
    assert!(matches!(result, Err(Error::Io(_))), "{result:?}");
}

#[tokio::test]
async fn test_cancelled_context_stops_fan_out() {
    init_tracing_only();
    let addrs = [dead_addr().await, dead_addr().await];
    let connector = Connector::with_ids(options(&addrs), Arc::new(ConnectionIds::new())).unwrap();
    let token = CancellationToken::new();
    token.cancel();
    let result = connector.connect(&Context::new().with_cancellation(token)).await;
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[tokio::test]
async fn test_registry_open_from_dsn() {
    let server = init(|_| vec![MockPacket::EndOfStream]);
    let addr = server.listen().await.unwrap();

    clickhouse_std::register("clickhouse-mock").unwrap();
    let dsn = format!("clickhouse://reader:secret@{addr}/logs?max_threads=4");
    let mut conn = clickhouse_std::open("clickhouse-mock", &dsn, &Context::new()).await.unwrap();

    conn.exec(&Context::new(), "SYSTEM FLUSH LOGS", Params::default()).await.unwrap();
    let queries = server.queries();
    assert_eq!(queries[0].setting("max_threads"), Some("4"));
    assert_eq!(server.events()[0], MockEvent::Hello {
        database: "logs".into(),
        username: "reader".into(),
    });
}

#[tokio::test]
async fn test_pool_discards_bad_connections() {
    let server = init(|query| match query {
        "SELECT sleep(3)" => vec![MockPacket::Hang],
        _ => vec![MockPacket::EndOfStream],
    });
    let addr = server.listen().await.unwrap();

    let manager = ConnectionManager::try_new(options(&[addr])).unwrap();
    let pool = bb8::Pool::builder().max_size(2).build(manager).await.unwrap();

    {
        let mut conn = pool.get().await.unwrap();
        conn.exec(&Context::new(), "SELECT 1", Params::default()).await.unwrap();
    }
    assert_eq!(pool.state().idle_connections, 1);

    {
        let mut conn = pool.get().await.unwrap();
        let ctx = Context::new().with_timeout(Duration::from_millis(100));
        let result = conn.exec(&ctx, "SELECT sleep(3)", Params::default()).await;
        assert!(matches!(result, Err(Error::DeadlineExceeded)));
        assert!(conn.is_bad());
    }
    // The broken connection was not returned to the pool
    assert_eq!(pool.state().idle_connections, 0);

    let mut conn = pool.get().await.unwrap();
    conn.ping(&Context::new()).await.unwrap();
}

#[tokio::test]
async fn test_pool_options_rejected() {
    let mut options = options(&[dead_addr().await]);
    options.max_open_conns = 10;
    assert!(matches!(
        ConnectionManager::try_new(options),
        Err(Error::InvalidSettings(names)) if names == ["max_open_conns"]
    ));
}

/// Answers every HTTP request on a fresh port with `body`.
async fn http_responder(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            drop(tokio::spawn(async move {
                let mut buf = vec![0; 4096];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }));
        }
    }));
    addr
}

#[tokio::test]
async fn test_http_transport_ping_only() {
    init_tracing_only();
    let addr = http_responder("Ok.\n").await;
    let connector = Connector::with_ids(
        options(&[addr]).with_protocol(Protocol::Http),
        Arc::new(ConnectionIds::new()),
    )
    .unwrap();

    let ctx = Context::new();
    let mut conn = connector.connect(&ctx).await.unwrap();
    conn.ping(&ctx).await.unwrap();
    assert!(matches!(conn.begin(), Err(Error::NotSupported)));
    assert!(matches!(conn.exec(&ctx, "SELECT 1", Params::default()).await, Err(Error::NotSupported)));
    assert!(matches!(conn.reset_session(), Err(Error::NotSupported)));
    assert!(!conn.is_bad());
    conn.close().await.unwrap();
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_http_unexpected_ping_body() {
    init_tracing_only();
    let addr = http_responder("nope").await;
    let connector = Connector::with_ids(
        options(&[addr]).with_protocol(Protocol::Http),
        Arc::new(ConnectionIds::new()),
    )
    .unwrap();
    assert!(matches!(connector.connect(&Context::new()).await, Err(Error::Http(_))));
}

fn init_tracing_only() { clickhouse_std::test_utils::init_tracing(Some(TRACING_DIRECTIVES)); }
