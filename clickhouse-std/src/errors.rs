use crate::native::protocol::ServerError;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure this crate can surface.
///
/// End of a result set is never an error: [`crate::Rows::next`] reports it with `Ok(false)`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Options that conflict with the native driver were supplied together.
    #[error("cannot connect. invalid settings. use {} on the pool instead", .0.join(", "))]
    InvalidSettings(Vec<&'static str>),
    #[error("invalid dsn: {0}")]
    InvalidDsn(String),
    #[error("missing connection information")]
    MissingConnectionInformation,
    #[error("malformed connection information: {0}")]
    MalformedConnectionInformation(String),
    #[error("invalid dns name: {0}")]
    InvalidDnsName(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(String),
    /// The handle is unusable and must be discarded by whoever owns it.
    #[error("driver: bad connection")]
    BadConnection,
    /// Returned verbatim by transports for capabilities they do not implement.
    #[error("HTTP: not supported")]
    NotSupported,
    #[error("unexpected type: cannot convert {from} into {to}")]
    UnexpectedType { from: String, to: String },
    #[error("unsupported column type: {0}")]
    UnsupportedType(String),
    #[error("expected {expected} columns, got {actual}")]
    ColumnCountMismatch { expected: usize, actual: usize },
    #[error("index {index} out of bounds for length {len}")]
    OutOfBounds { index: usize, len: usize },
    #[error("clickhouse: {0}")]
    Usage(&'static str),
    #[error("bind: {0}")]
    Bind(String),
    #[error("server exception: {0}")]
    Server(ServerError),
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The buffer ended before a complete value could be read.
    #[error("unexpected end of buffer")]
    UnexpectedEof,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl Error {
    /// Whether the error was raised by a cancellation token or an expired deadline.
    pub fn is_interrupt(&self) -> bool { matches!(self, Error::Cancelled | Error::DeadlineExceeded) }

    /// Whether the error leaves the connection in an unknown protocol state.
    pub(crate) fn breaks_connection(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Protocol(_)
                | Error::UnexpectedEof
                | Error::UnsupportedType(_)
                | Error::ConnectionClosed
                | Error::Cancelled
                | Error::DeadlineExceeded
        )
    }
}

impl From<ServerError> for Error {
    fn from(error: ServerError) -> Self { Error::Server(error) }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(error: std::string::FromUtf8Error) -> Self { Error::Protocol(error.to_string()) }
}

pub(crate) fn unexpected_type(from: impl Into<String>, to: impl Into<String>) -> Error {
    Error::UnexpectedType { from: from.into(), to: to.into() }
}
