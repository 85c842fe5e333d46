use std::time::Duration;

pub(crate) const CLIENT_NAME: &str = "clickhouse-std";
pub(crate) const VERSION_MAJOR: u64 = 0;
pub(crate) const VERSION_MINOR: u64 = 1;
pub(crate) const VERSION_PATCH: u64 = 0;

pub(crate) const DEFAULT_NATIVE_ADDR: &str = "localhost:9000";
pub(crate) const DEFAULT_HTTP_ADDR: &str = "localhost:8123";
pub(crate) const DEFAULT_USER: &str = "default";
pub(crate) const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);

// Socket tuning
pub(crate) const TCP_KEEP_ALIVE_SECS: u64 = 60;
pub(crate) const TCP_KEEP_ALIVE_INTERVAL: u64 = 10;
pub(crate) const TCP_KEEP_ALIVE_RETRIES: u32 = 6;
pub(crate) const TCP_READ_BUFFER_SIZE: usize = 1024 * 1024;
pub(crate) const TCP_WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// Bytes reserved in the connection read buffer before each socket read.
pub(crate) const READ_CHUNK_SIZE: usize = 64 * 1024;
