use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{Connection, Handoff, Request};
use crate::parser::RequestHead;
use crate::sink::{ErrorSink, TracingSink};
use crate::transport::{BoxReader, BoxWriter, Listener};
use crate::{Config, Error};


/// The listener a connection was accepted from.
#[derive(Debug, Clone)]
pub(crate) struct Origin {
    addr: Arc<str>,
    token: CancellationToken,
    span: tracing::Span,
}

#[derive(Debug)]
enum Command {
    RemoveListener(String),
    Shutdown,
}

/// Issues commands to an [`Acceptor`] from other tasks.
///
/// Commands take effect while the [`Acceptor`] is being polled through
/// `Acceptor::accept`.
#[derive(Debug, Clone)]
pub struct AcceptorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl AcceptorHandle {
    /// Closes the listener with the given normalized address. See
    /// `Acceptor::remove_listener`.
    ///
    /// Returns `false` if the [`Acceptor`] is gone.
    pub fn remove_listener(&self, addr: &str) -> bool {
        self.tx.send(Command::RemoveListener(addr.into())).is_ok()
    }

    /// Closes all listeners. `Acceptor::accept` returns [`None`] once all
    /// connections are finished.
    ///
    /// Returns `false` if the [`Acceptor`] is gone.
    pub fn shutdown(&self) -> bool {
        self.tx.send(Command::Shutdown).is_ok()
    }
}


struct Entry {
    listener: Arc<dyn Listener>,
    token: CancellationToken,
    accepting: bool,
}

type HeadResult = Result<Option<Box<RequestHead>>, Error>;

enum Step {
    Accepted { addr: Arc<str>, result: Option<io::Result<(BoxReader, BoxWriter)>> },
    Parsed { conn: Connection, result: Option<HeadResult> },
    Finished(Result<Handoff, oneshot::error::RecvError>),
    Closed,
}


/// Accepts FastCGI connections from multiple listeners and yields their
/// requests one at a time.
///
/// All work happens while `Acceptor::accept` is awaited: accepting new
/// connections, parsing requests and recycling connections of completed
/// requests. A [`Request`] may be processed on any task, though. Its
/// connection returns to the [`Acceptor`] when the request completes.
///
/// At most `Config::max_conns` connections are open at a time. Connection
/// errors before a request is complete are reported to the [`ErrorSink`].
pub struct Acceptor {
    config: Arc<Config>,
    sink: Arc<dyn ErrorSink>,
    listeners: HashMap<Arc<str>, Entry>,
    root: CancellationToken,
    tasks: FuturesUnordered<BoxFuture<'static, Step>>,
    /// The number of listeners with a pending accept.
    accepting: usize,
    /// The number of open connections.
    live: usize,
    next_conn: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    handle: AcceptorHandle,
}

impl Acceptor {
    /// Creates an [`Acceptor`] reporting errors through `tracing`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    /// Creates an [`Acceptor`] reporting errors to `sink`.
    #[must_use]
    pub fn with_sink(config: Config, sink: Arc<dyn ErrorSink>) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        Self {
            config: Arc::new(config), sink,
            listeners: HashMap::new(), root: CancellationToken::new(),
            tasks: FuturesUnordered::new(), accepting: 0, live: 0, next_conn: 0,
            commands, handle: AcceptorHandle { tx },
        }
    }

    /// Returns a handle to issue commands from other tasks.
    #[must_use]
    pub fn handle(&self) -> AcceptorHandle {
        self.handle.clone()
    }

    /// Returns the number of open connections.
    #[inline]
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.live
    }

    /// Adds a listener and returns its normalized address.
    ///
    /// # Errors
    /// Fails if a listener with the same address exists already, if the
    /// [`Acceptor`] was shut down or if the address is unavailable.
    pub fn add_listener(&mut self, listener: impl Listener) -> io::Result<String> {
        if self.root.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "acceptor was shut down"));
        }
        let addr = listener.local_addr()?;
        if self.listeners.contains_key(addr.as_str()) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, format!("listener {addr} exists already")));
        }

        tracing::info!(listener = addr, "listener added");
        let entry = Entry { listener: Arc::new(listener), token: self.root.child_token(), accepting: false };
        self.listeners.insert(addr.as_str().into(), entry);
        Ok(addr)
    }

    /// Closes the listener with the given normalized address.
    ///
    /// Pending connections from this listener are closed. Connections whose
    /// request parameters were still being read are answered with status 503
    /// first. Requests yielded already complete normally, but their
    /// connections are closed afterwards.
    ///
    /// Returns `false` if there is no such listener.
    pub fn remove_listener(&mut self, addr: &str) -> bool {
        let Some(entry) = self.listeners.remove(addr) else { return false };
        entry.token.cancel();
        tracing::info!(listener = addr, "listener removed");
        true
    }

    fn begin_shutdown(&mut self) {
        if !self.root.is_cancelled() {
            tracing::info!(listeners = self.listeners.len(), live = self.live, "acceptor shutting down");
        }
        self.root.cancel();
        self.listeners.clear();
    }

    /// Removes all listeners and waits until all connections are finished,
    /// including those of requests being processed.
    pub async fn shutdown(&mut self) {
        self.begin_shutdown();
        while let Some(step) = self.tasks.next().await {
            if let Some(request) = self.handle_step(step) {
                drop(request);
            }
        }
    }

    /// Waits for the next complete request from any listener.
    ///
    /// Returns [`None`] once there are no listeners and no open connections
    /// left, such as after a shutdown.
    pub async fn accept(&mut self) -> Option<Request> {
        loop {
            self.start_accepts();
            if self.tasks.is_empty() {
                return None;
            }

            tokio::select! {
                Some(cmd) = self.commands.recv() => match cmd {
                    Command::RemoveListener(addr) => {
                        self.remove_listener(&addr);
                    },
                    Command::Shutdown => self.begin_shutdown(),
                },
                Some(step) = self.tasks.next() => {
                    if let Some(request) = self.handle_step(step) {
                        return Some(request);
                    }
                },
                else => return None,
            }
        }
    }

    /// Starts accepting on idle listeners while connections are available.
    fn start_accepts(&mut self) {
        let free = self.config.max_conns.get().saturating_sub(self.live + self.accepting);
        if free == 0 {
            return;
        }

        let mut idle: Vec<Arc<str>> = self.listeners.iter()
            .filter(|(_, e)| !e.accepting)
            .map(|(addr, _)| addr.clone())
            .collect();
        if idle.len() > free {
            // Not every listener can be serviced, so pick fairly
            fastrand::shuffle(&mut idle);
            idle.truncate(free);
        }

        for addr in idle {
            let Some(entry) = self.listeners.get_mut(&addr) else { continue };
            entry.accepting = true;
            self.accepting += 1;

            let listener = entry.listener.clone();
            let token = entry.token.clone();
            self.tasks.push(Box::pin(async move {
                let result = tokio::select! {
                    r = listener.accept() => Some(r),
                    () = token.cancelled() => None,
                };
                Step::Accepted { addr, result }
            }));
        }
    }

    fn handle_step(&mut self, step: Step) -> Option<Request> {
        match step {
            Step::Accepted { addr, result } => {
                self.accepting -= 1;
                let entry = self.listeners.get_mut(&addr)?;
                entry.accepting = false;
                let token = entry.token.clone();
                match result? {
                    Ok((reader, writer)) => {
                        self.live += 1;
                        self.next_conn += 1;
                        let span = tracing::debug_span!("fcgi_conn", listener = %addr, conn = self.next_conn);
                        span.in_scope(|| tracing::debug!("connection accepted"));

                        let mut conn = Connection::new(self.config.clone(), reader, writer);
                        conn.origin = Some(Origin { addr, token, span });
                        self.parse(conn);
                    },
                    Err(e) => {
                        let _span = tracing::debug_span!("fcgi_accept", listener = %addr).entered();
                        self.sink.error(&e.into());
                    },
                }
                None
            },

            Step::Parsed { conn, result } => {
                let _span = conn.origin.as_ref().map(|o| o.span.clone().entered());
                match result {
                    Some(Ok(Some(head))) if !is_cancelled(&conn) => {
                        tracing::debug!(request_id = head.request_id.get(), "request yielded");
                        let (tx, rx) = oneshot::channel();
                        self.tasks.push(Box::pin(async move { Step::Finished(rx.await) }));
                        return Some(Request::new(head, conn, Some(tx)));
                    },
                    Some(Ok(Some(head))) => {
                        self.close(conn, Some((head.request_id.get(), false)));
                    },
                    Some(Ok(None)) => {
                        tracing::debug!("connection closed by client");
                        self.live -= 1;
                    },
                    Some(Err(e)) => {
                        self.sink.error(&e);
                        self.live -= 1;
                    },
                    None => {
                        let reject = conn.active_request().map(|id| (id, false));
                        self.close(conn, reject);
                    },
                }
                None
            },

            Step::Finished(Ok(Handoff::Recycle(conn))) => {
                if is_cancelled(&conn) {
                    self.close(conn, None);
                } else {
                    self.parse(conn);
                }
                None
            },
            Step::Finished(Ok(Handoff::Close(conn))) => {
                self.close(conn, None);
                None
            },
            Step::Finished(Ok(Handoff::Abandoned { conn, request_id, headers_sent })) => {
                self.close(conn, Some((request_id, headers_sent)));
                None
            },
            Step::Finished(Err(_)) | Step::Closed => {
                // The connection was closed already
                self.live -= 1;
                None
            },
        }
    }

    /// Parses the next request on `conn` in the background.
    fn parse(&mut self, mut conn: Connection) {
        let (token, span) = match &conn.origin {
            Some(o) => (o.token.clone(), o.span.clone()),
            None => (self.root.child_token(), tracing::Span::none()),
        };
        self.tasks.push(Box::pin(async move {
            let result = tokio::select! {
                r = conn.read_head() => Some(r),
                () = token.cancelled() => None,
            };
            Step::Parsed { conn, result }
        }.instrument(span)));
    }

    /// Closes `conn` in the background, answering an unfinished request with
    /// status 503 first.
    fn close(&mut self, mut conn: Connection, reject: Option<(u16, bool)>) {
        let span = conn.origin.as_ref().map_or_else(tracing::Span::none, |o| o.span.clone());
        self.tasks.push(Box::pin(async move {
            if let Some((request_id, headers_sent)) = reject {
                tracing::debug!(request_id, "request rejected as unavailable");
                if let Err(e) = conn.reject_unavailable(request_id, headers_sent).await {
                    tracing::debug!(error = %e, "sending 503 response failed");
                }
            } else if let Err(e) = conn.flush_output().await {
                tracing::debug!(error = %e, "flushing FastCGI connection failed");
            }
            conn.close().await;
            Step::Closed
        }.instrument(span)));
    }
}

fn is_cancelled(conn: &Connection) -> bool {
    conn.origin.as_ref().is_some_and(|o| o.token.is_cancelled())
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("listeners", &self.listeners.keys().collect::<Vec<_>>())
            .field("accepting", &self.accepting)
            .field("live", &self.live)
            .field("tasks", &self.tasks.len())
            .field("shutdown", &self.root.is_cancelled())
            .finish_non_exhaustive()
    }
}
