use std::io;

use futures_util::future::BoxFuture;
use futures_util::io::{AsyncRead, AsyncWrite};
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};


/// The reading half of a connection.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
/// The writing half of a connection.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;


/// Splits a tokio byte stream into boxed `futures-io` halves.
pub fn split_tokio<S>(stream: S) -> (BoxReader, BoxWriter)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (r, w) = tokio::io::split(stream);
    (Box::new(r.compat()), Box::new(w.compat_write()))
}


/// A source of incoming FastCGI connections.
pub trait Listener: Send + Sync + 'static {
    /// Waits for the next connection.
    fn accept(&self) -> BoxFuture<'_, io::Result<(BoxReader, BoxWriter)>>;

    /// Returns the normalized local address, which identifies this listener.
    ///
    /// # Errors
    /// Forwards errors from querying the underlying socket.
    fn local_addr(&self) -> io::Result<String>;
}

impl Listener for tokio::net::TcpListener {
    fn accept(&self) -> BoxFuture<'_, io::Result<(BoxReader, BoxWriter)>> {
        Box::pin(async move {
            let (stream, peer) = tokio::net::TcpListener::accept(self).await?;
            tracing::debug!(%peer, "TCP connection accepted");
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "TCP_NODELAY unavailable");
            }
            let (r, w) = stream.into_split();
            Ok((Box::new(r.compat()) as BoxReader, Box::new(w.compat_write()) as BoxWriter))
        })
    }

    fn local_addr(&self) -> io::Result<String> {
        tokio::net::TcpListener::local_addr(self).map(|a| a.to_string())
    }
}

#[cfg(unix)]
impl Listener for tokio::net::UnixListener {
    fn accept(&self) -> BoxFuture<'_, io::Result<(BoxReader, BoxWriter)>> {
        Box::pin(async move {
            let (stream, _) = tokio::net::UnixListener::accept(self).await?;
            tracing::debug!("Unix connection accepted");
            let (r, w) = stream.into_split();
            Ok((Box::new(r.compat()) as BoxReader, Box::new(w.compat_write()) as BoxWriter))
        })
    }

    fn local_addr(&self) -> io::Result<String> {
        let addr = tokio::net::UnixListener::local_addr(self)?;
        Ok(match addr.as_pathname() {
            Some(path) => format!("unix:{}", path.display()),
            None => "unix:".into(),
        })
    }
}


/// A factory for outgoing FastCGI connections.
pub trait Connector: Send + Sync + 'static {
    /// Opens a new connection to `dest`.
    fn connect<'a>(&'a self, dest: &'a str) -> BoxFuture<'a, io::Result<(BoxReader, BoxWriter)>>;
}

/// The default [`Connector`] for TCP and Unix sockets.
///
/// Destinations starting with `/` or `unix:` name a Unix socket path. All
/// others are resolved as `host:port`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketConnector;

impl Connector for SocketConnector {
    fn connect<'a>(&'a self, dest: &'a str) -> BoxFuture<'a, io::Result<(BoxReader, BoxWriter)>> {
        Box::pin(async move {
            if let Some(path) = unix_path(dest) {
                return connect_unix(path).await;
            }
            let stream = tokio::net::TcpStream::connect(dest).await?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "TCP_NODELAY unavailable");
            }
            let (r, w) = stream.into_split();
            Ok((Box::new(r.compat()) as BoxReader, Box::new(w.compat_write()) as BoxWriter))
        })
    }
}

fn unix_path(dest: &str) -> Option<&str> {
    dest.strip_prefix("unix:").or_else(|| dest.starts_with('/').then_some(dest))
}

#[cfg(unix)]
async fn connect_unix(path: &str) -> io::Result<(BoxReader, BoxWriter)> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    let (r, w) = stream.into_split();
    Ok((Box::new(r.compat()), Box::new(w.compat_write())))
}

#[cfg(not(unix))]
async fn connect_unix(_: &str) -> io::Result<(BoxReader, BoxWriter)> {
    Err(io::ErrorKind::Unsupported.into())
}
