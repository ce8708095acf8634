use std::io;

use crate::parser;


/// Errors surfaced to users of a [`Request`](crate::server::Request) or
/// a FastCGI [`Client`](crate::client::Client).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The FastCGI client aborted the request.
    ///
    /// This only affects the request itself. Its connection stays usable.
    #[error("FastCGI request was aborted by the client")]
    Aborted,

    /// The request was already completed, so no further operations are
    /// possible.
    #[error("FastCGI request is already terminated")]
    Terminated,

    /// Response headers cannot be changed after the header block was sent.
    #[error("response headers were already sent")]
    HeadersSent,

    /// The record stream was malformed or ended unexpectedly. The connection
    /// is unusable afterwards.
    #[error(transparent)]
    Protocol(#[from] parser::Error),

    /// A new connection could not be established in time.
    #[error("timed out while connecting to the FastCGI application")]
    ConnectTimeout,

    /// The request held its connection for longer than allowed.
    #[error("FastCGI request timed out")]
    RequestTimeout,

    /// The FastCGI application does not implement the responder role.
    #[error("FastCGI application rejected the role")]
    UnknownRole,

    /// The FastCGI application rejected a request multiplexed onto a busy
    /// connection.
    #[error("FastCGI application cannot multiplex connections")]
    CantMultiplex,

    /// The FastCGI application is handling its maximum number of requests.
    #[error("FastCGI application is overloaded")]
    Overloaded,

    /// An I/O error occurred on the underlying transport.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Maps an [`Error`] to the [`io::ErrorKind`] that describes it best.
    #[must_use]
    pub fn kind(&self) -> io::ErrorKind {
        use io::ErrorKind as K;
        match self {
            Self::Aborted => K::ConnectionAborted,
            Self::Terminated => K::NotConnected,
            Self::HeadersSent => K::InvalidInput,
            Self::Protocol(parser::Error::UnexpectedEof) => K::UnexpectedEof,
            Self::Protocol(_) => K::InvalidData,
            Self::ConnectTimeout | Self::RequestTimeout => K::TimedOut,
            Self::UnknownRole | Self::CantMultiplex | Self::Overloaded => K::ConnectionRefused,
            Self::Io(e) => e.kind(),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            e => io::Error::new(e.kind(), e),
        }
    }
}

impl From<crate::protocol::Error> for Error {
    #[inline]
    fn from(e: crate::protocol::Error) -> Self {
        Self::Protocol(e.into())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kinds() {
        let e: io::Error = Error::Aborted.into();
        assert_eq!(e.kind(), io::ErrorKind::ConnectionAborted);
        let inner = e.into_inner().unwrap().downcast::<Error>().unwrap();
        assert!(matches!(*inner, Error::Aborted));

        let e: io::Error = Error::Protocol(parser::Error::UnexpectedEof).into();
        assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);

        let orig = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        let e: io::Error = Error::Io(orig).into();
        assert_eq!(e.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(e.to_string(), "gone");
    }
}
