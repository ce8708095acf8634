use std::num::NonZeroUsize;
use std::time::Duration;


/// The minimum size of a connection's input buffer. It must hold at least
/// a record header followed by a fixed-size record body.
const MIN_BUF_SIZE: usize = 64;
const DEFAULT_BUF_SIZE: usize = 8192 + 16;


/// Configuration for the server side of a FastCGI connection.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// The maximum number of connections handled at the same time. It is
    /// also reported as `FCGI_MAX_CONNS` and `FCGI_MAX_REQS`.
    pub max_conns: NonZeroUsize,
    /// The size of each connection's input buffer in bytes.
    pub buffer_size: usize,
    /// Request parameters with longer names are dropped.
    pub max_name_len: usize,
    /// Request parameters with longer values are dropped.
    pub max_value_len: usize,
}

impl Config {
    /// Creates a default [`Config`] accepting up to `max_conns` connections.
    #[must_use]
    pub fn with_conns(max_conns: NonZeroUsize) -> Self {
        Self {
            max_conns,
            buffer_size: DEFAULT_BUF_SIZE,
            max_name_len: 256,
            max_value_len: 4096,
        }
    }

    /// Returns the configured buffer size, raised to the supported minimum
    /// and rounded up to a multiple of 8.
    #[must_use]
    pub fn aligned_bufsize(&self) -> usize {
        aligned_bufsize(self.buffer_size)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_conns(NonZeroUsize::new(128).unwrap_or(NonZeroUsize::MIN))
    }
}

pub(crate) fn aligned_bufsize(size: usize) -> usize {
    size.max(MIN_BUF_SIZE).next_multiple_of(8)
}


/// Configuration for a pool of client connections.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// The maximum number of connections in use at the same time, across
    /// all destinations. Callers beyond this limit wait in line.
    pub max_conns: usize,
    /// How long establishing a new connection may take.
    pub connect_timeout: Duration,
    /// How long a single request may hold a connection.
    pub request_timeout: Duration,
    /// How long an idle connection is kept for reuse.
    pub keep_alive_timeout: Duration,
    /// How many requests a connection carries before it is closed.
    /// [`None`] means unlimited.
    pub keep_alive_max: Option<u32>,
    /// The period of the background task closing expired connections.
    pub sweep_interval: Duration,
    /// Request IDs of a connection wrap around after this value.
    pub request_id_bound: u16,
    /// The size of each connection's input buffer in bytes.
    pub buffer_size: usize,
    /// The maximum size of a response's header block.
    pub max_head_len: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conns: 128,
            connect_timeout: Duration::from_secs(4),
            request_timeout: Duration::from_secs(60),
            keep_alive_timeout: Duration::from_secs(10),
            keep_alive_max: None,
            sweep_interval: Duration::from_secs(1),
            request_id_bound: 1024,
            buffer_size: DEFAULT_BUF_SIZE,
            max_head_len: 64 * 1024,
        }
    }
}
