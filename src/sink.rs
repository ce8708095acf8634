use std::fmt::Debug;

use crate::Error;


/// A destination for errors that cannot be returned to a caller.
///
/// Connection-level errors in the [`Acceptor`](crate::server::Acceptor)
/// happen before any request reaches the application, and a FastCGI
/// application's Stderr output is not part of the response body. Both are
/// reported to an [`ErrorSink`] instead.
pub trait ErrorSink: Debug + Send + Sync {
    /// Reports an error that ended a connection.
    fn error(&self, error: &Error);

    /// Reports Stderr output of a FastCGI request.
    fn log_error(&self, request_id: u16, message: &[u8]);
}


/// The default [`ErrorSink`], which emits events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn error(&self, error: &Error) {
        tracing::warn!(%error, "FastCGI connection failed");
    }

    fn log_error(&self, request_id: u16, message: &[u8]) {
        let message = String::from_utf8_lossy(message);
        tracing::warn!(request_id, message = %message.trim_end(), "FastCGI application error output");
    }
}
