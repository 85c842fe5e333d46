use std::env::consts::OS;
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::USER_AGENT;
use hyper::{Method, Request};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio_rustls::rustls;
use url::Url;

use super::Transport;
use crate::connection::with_timeout;
use crate::constants::TCP_KEEP_ALIVE_SECS;
use crate::prelude::*;

static LIB_USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}/{} (lv:rust/{} {OS})",
        option_env!("CARGO_PKG_NAME").unwrap_or("unknown"),
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    )
});

const X_CLICKHOUSE_USER: &str = "X-ClickHouse-User";
const X_CLICKHOUSE_KEY: &str = "X-ClickHouse-Key";
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(2); // Based on ClickHouse's 3s
const PING_RESPONSE: &[u8] = b"Ok.";

type Client = HyperClient<HttpsConnector<HttpConnector>, Empty<Bytes>>;

/// The HTTP interface. Only `ping` and `close` are implemented, every other operation fails
/// with [`Error::NotSupported`].
pub struct HttpTransport {
    id:       u64,
    client:   Client,
    endpoint: String,
    options:  Arc<Options>,
    closed:   bool,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Builds a client for `addr` and checks the server answers a ping.
    ///
    /// # Errors
    /// An invalid address, or a failed ping.
    #[instrument(
        level = "trace",
        name = "clickhouse.http.connect",
        skip_all,
        fields(clickhouse.connection.id = id, server.address = addr),
        err
    )]
    pub async fn connect(id: u64, addr: &str, options: Arc<Options>, ctx: &Context) -> Result<Self> {
        let mut transport = Self::try_new(id, addr, options)?;
        transport.ping(ctx).await?;
        Ok(transport)
    }

    /// # Errors
    /// Returns an error if `addr` does not form a valid endpoint.
    pub fn try_new(id: u64, addr: &str, options: Arc<Options>) -> Result<Self> {
        let mut connector = HttpConnector::new();
        connector.set_keepalive(Some(Duration::from_secs(TCP_KEEP_ALIVE_SECS)));
        connector.set_nodelay(true);
        if !options.dial_timeout.is_zero() {
            connector.set_connect_timeout(Some(options.dial_timeout));
        }
        connector.enforce_http(false);

        drop(rustls::crypto::aws_lc_rs::default_provider().install_default());
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);

        let mut client_builder = HyperClient::builder(TokioExecutor::new());
        let _ = client_builder.pool_idle_timeout(POOL_IDLE_TIMEOUT);
        let client = client_builder.build(https);

        let scheme = if options.tls { "https" } else { "http" };
        let endpoint = format!("{scheme}://{addr}");

        // Parse to ensure endpoint is valid
        drop(Url::parse(&endpoint).map_err(|e| {
            Error::MalformedConnectionInformation(format!("invalid endpoint {endpoint}: {e}"))
        })?);
        debug!(endpoint, { ATT_CID } = id, "Built http client");

        Ok(HttpTransport { id, client, endpoint, options, closed: false })
    }

    pub fn endpoint(&self) -> &str { &self.endpoint }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    fn id(&self) -> u64 { self.id }

    #[instrument(level = "trace", name = "clickhouse.http.ping", skip_all, fields(clickhouse.connection.id = self.id))]
    async fn ping(&mut self, ctx: &Context) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("{}/ping", self.endpoint))
            .header(USER_AGENT, LIB_USER_AGENT.as_str())
            .header(X_CLICKHOUSE_USER, &self.options.auth.username)
            .header(X_CLICKHOUSE_KEY, self.options.auth.password.get())
            .body(Empty::new())
            .map_err(|e| Error::Http(format!("Failed to build request: {e}")))?;

        let client = &self.client;
        ctx.run(with_timeout(self.options.read_timeout, async move {
            let response = client
                .request(request)
                .await
                .map_err(|e| Error::Http(format!("HTTP request failed: {e}")))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| Error::Http(format!("Failed to read response: {e}")))?
                .to_bytes();
            if !status.is_success() {
                return Err(Error::Http(format!(
                    "HTTP error: {status}: {}",
                    String::from_utf8_lossy(&body).trim()
                )));
            }
            if body.trim_ascii() != PING_RESPONSE {
                return Err(Error::Http(format!(
                    "unexpected ping response: {}",
                    String::from_utf8_lossy(&body).trim()
                )));
            }
            Ok(())
        }))
        .await
    }

    fn begin_tx(&mut self) -> Result<()> { Err(Error::NotSupported) }

    async fn commit_tx(&mut self, _ctx: &Context) -> Result<()> { Err(Error::NotSupported) }

    async fn rollback_tx(&mut self) -> Result<()> { Err(Error::NotSupported) }

    fn reset_session(&self) -> Result<()> { Err(Error::NotSupported) }

    fn check_bindable(&self, _value: &Value) -> Result<()> { Err(Error::NotSupported) }

    async fn exec(&mut self, _ctx: &Context, _query: &str, _params: Params) -> Result<()> {
        Err(Error::NotSupported)
    }

    async fn query(&mut self, _ctx: &Context, _query: &str, _params: Params) -> Result<Rows<'_>> {
        Err(Error::NotSupported)
    }

    async fn prepare_for_batch(&mut self, _ctx: &Context, _query: &str) -> Result<Statement<'_>> {
        Err(Error::NotSupported)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            debug!({ ATT_CID } = self.id, endpoint = %self.endpoint, "http transport closed");
        }
        Ok(())
    }

    fn is_bad(&self) -> bool { false }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> HttpTransport {
        HttpTransport::try_new(7, "localhost:8123", Arc::new(Options::default())).unwrap()
    }

    #[tokio::test]
    async fn test_unsupported_operations() {
        let mut transport = transport();
        let ctx = Context::new();
        assert!(matches!(transport.begin_tx(), Err(Error::NotSupported)));
        assert!(matches!(transport.commit_tx(&ctx).await, Err(Error::NotSupported)));
        assert!(matches!(transport.rollback_tx().await, Err(Error::NotSupported)));
        assert!(matches!(transport.reset_session(), Err(Error::NotSupported)));
        assert!(matches!(transport.check_bindable(&Value::Null), Err(Error::NotSupported)));
        assert!(matches!(
            transport.exec(&ctx, "SELECT 1", Params::default()).await,
            Err(Error::NotSupported)
        ));
        assert!(matches!(
            transport.query(&ctx, "SELECT 1", Params::default()).await,
            Err(Error::NotSupported)
        ));
        assert!(matches!(
            transport.prepare_for_batch(&ctx, "INSERT INTO t").await,
            Err(Error::NotSupported)
        ));
        assert_eq!(Error::NotSupported.to_string(), "HTTP: not supported");
    }

    #[tokio::test]
    async fn test_close_then_ping() {
        let mut transport = transport();
        assert_eq!(transport.endpoint(), "http://localhost:8123");
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(matches!(transport.ping(&Context::new()).await, Err(Error::ConnectionClosed)));
    }
}
