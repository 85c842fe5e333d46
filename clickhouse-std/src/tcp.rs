use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};

use crate::constants::*;
use crate::options::Options;
use crate::prelude::*;

/// A bidirectional byte stream a connection runs over: plain TCP, TLS, or an in-memory pipe in
/// tests.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug> Io for T {}

/// Resolves `addr` and connects to the first address that accepts, wrapping the socket in TLS
/// when requested.
#[instrument(level = "trace", name = "clickhouse.dial", skip_all, fields(server.address = addr))]
pub(crate) async fn dial(addr: &str, options: &Options) -> Result<Box<dyn Io>> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| Error::MalformedConnectionInformation(format!("{addr}: {e}")))?
        .collect();
    if resolved.is_empty() {
        return Err(Error::MalformedConnectionInformation(format!("{addr}: no addresses")));
    }

    let mut last_error = None;
    for socket_addr in resolved {
        match connect_socket(socket_addr, options.dial_timeout).await {
            Ok(stream) => {
                trace!("Connected socket for {socket_addr}");
                if !options.tls {
                    return Ok(Box::new(stream));
                }
                let domain = options.domain.clone().unwrap_or_else(|| host_of(addr).to_string());
                return Ok(Box::new(tls_stream(domain, stream).await?));
            }
            Err(error) => {
                debug!(?error, %socket_addr, "socket connect failed");
                last_error = Some(error);
            }
        }
    }
    Err(last_error.unwrap_or(Error::MissingConnectionInformation))
}

/// Connects to clickhouse's native server port and configures common socket options.
async fn connect_socket(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let domain = if addr.is_ipv4() { socket2::Domain::IPV4 } else { socket2::Domain::IPV6 };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    // Increase buffer sizes for high-throughput data transfer
    socket.set_recv_buffer_size(TCP_READ_BUFFER_SIZE)?;
    socket.set_send_buffer_size(TCP_WRITE_BUFFER_SIZE)?;
    // Configure TCP keepalive
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEP_ALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEP_ALIVE_INTERVAL))
        .with_retries(TCP_KEEP_ALIVE_RETRIES);
    socket.set_tcp_keepalive(&keepalive)?;
    socket.set_tcp_nodelay(true)?;

    let socket = TcpSocket::from_std_stream(std::net::TcpStream::from(socket));
    tokio::time::timeout(timeout, socket.connect(addr)).await.map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("dial {addr} timed out after {timeout:?}"),
        ))
    })?
    .map_err(Error::from)
}

// Helper function to facilitate TLS connection setup
async fn tls_stream(
    domain: String,
    stream: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    debug!(%domain, "Initiating TLS connection");

    // Install rustls provider
    drop(rustls::crypto::aws_lc_rs::default_provider().install_default());
    let root_store = RootCertStore { roots: webpki_roots::TLS_SERVER_ROOTS.into() };

    let mut tls_config =
        ClientConfig::builder().with_root_certificates(root_store).with_no_client_auth();

    // Enable session resumption by default
    tls_config.resumption = rustls::client::Resumption::in_memory_sessions(256);

    let connector = TlsConnector::from(Arc::new(tls_config));
    let dnsname =
        ServerName::try_from(domain).map_err(|e| Error::InvalidDnsName(e.to_string()))?;
    Ok(connector.connect(dnsname, stream).await?)
}

/// The host part of a `host:port` address, without ipv6 brackets.
pub(crate) fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    addr.rsplit_once(':').map_or(addr, |(host, _)| host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("db.example.com:9440"), "db.example.com");
        assert_eq!(host_of("[::1]:9000"), "::1");
        assert_eq!(host_of("localhost"), "localhost");
    }

    #[tokio::test]
    async fn test_dial_refused_is_io_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let options = Options::default().with_dial_timeout(Duration::from_secs(2));
        assert!(matches!(dial(&addr, &options).await, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_dial_plain() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let options = Options::default().with_dial_timeout(Duration::from_secs(2));
        let (dialed, accepted) = tokio::join!(dial(&addr, &options), listener.accept());
        assert!(dialed.is_ok());
        assert!(accepted.is_ok());
    }
}
