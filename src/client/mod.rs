use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use compact_str::CompactString;
use event_listener::Event as Notify;
use futures_util::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::parser::headers::{Cookie, ResponseHead};
use crate::parser::response::{Event, Parser};
use crate::parser;
use crate::protocol::{self as fcgi, body, nv, record};
use crate::sink::{ErrorSink, TracingSink};
use crate::transport::{BoxReader, BoxWriter, Connector, SocketConnector};
use crate::{Error, PoolConfig};

/// A pool of client connections with admission control.
pub mod pool;

pub use pool::{AcquireOptions, Lease, Pool};


/// Fails a busy connection's I/O from outside once its request timed out.
#[derive(Debug, Default)]
pub(crate) struct KillSwitch {
    killed: AtomicBool,
    event: Notify,
}

impl KillSwitch {
    pub(crate) fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.event.notify(usize::MAX);
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Resolves once `KillSwitch::kill` was called.
    pub(crate) async fn killed(&self) {
        loop {
            if self.is_killed() {
                return;
            }
            let listener = self.event.listen();
            if self.is_killed() {
                return;
            }
            listener.await;
        }
    }
}


fn check_status(end: body::EndRequest) -> Result<(), Error> {
    match end.protocol_status {
        fcgi::ProtocolStatus::RequestComplete => Ok(()),
        fcgi::ProtocolStatus::CantMpxConn => Err(Error::CantMultiplex),
        fcgi::ProtocolStatus::Overloaded => Err(Error::Overloaded),
        fcgi::ProtocolStatus::UnknownRole => Err(Error::UnknownRole),
    }
}


/// The client side of a single FastCGI connection.
///
/// A [`Connection`] carries one request at a time: `Connection::write_request`
/// sends it completely, then `Connection::read_head` and
/// `Connection::read_body` stream the response. Stderr output of the
/// application is reported to the [`ErrorSink`].
pub struct Connection {
    parser: Parser,
    reader: BoxReader,
    writer: BoxWriter,
    sink: Arc<dyn ErrorSink>,
    pub(crate) kill: Arc<KillSwitch>,
    next_id: u16,
    id_bound: u16,
    /// The number of requests written so far.
    uses: u32,
    keep_conn: bool,
    end: Option<body::EndRequest>,
    broken: bool,
}

impl Connection {
    /// Wraps both halves of a transport into a [`Connection`].
    #[must_use]
    pub fn new(config: &PoolConfig, reader: BoxReader, writer: BoxWriter, sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            parser: Parser::new(config.buffer_size, config.max_head_len),
            reader, writer, sink,
            kill: Arc::default(),
            next_id: 1,
            id_bound: config.request_id_bound.max(1),
            uses: 0, keep_conn: false, end: None, broken: false,
        }
    }

    fn next_request_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = if id >= self.id_bound { 1 } else { id + 1 };
        id
    }

    /// Returns the number of requests sent on this connection.
    #[inline]
    #[must_use]
    pub fn uses(&self) -> u32 {
        self.uses
    }

    /// Returns the EndRequest body of the current response once it ended.
    #[inline]
    #[must_use]
    pub fn end(&self) -> Option<body::EndRequest> {
        self.end
    }

    /// Tests whether the connection may carry another request.
    #[must_use]
    pub fn is_reusable(&self) -> bool {
        self.keep_conn && !self.broken && !self.kill.is_killed()
            && self.parser.is_done() && self.parser.is_idle()
    }

    /// Sends a complete responder request and returns its ID.
    ///
    /// The request consists of `params` and `body`, which is read to its
    /// end and streamed as Stdin records. With `keep_conn`, the application
    /// keeps the connection open after the response.
    ///
    /// # Errors
    /// Fails if a parameter is too long to be encoded, or if reading `body`
    /// or writing failed. A failed read or write leaves the connection
    /// unusable.
    pub async fn write_request<N, V, B>(
        &mut self, params: impl IntoIterator<Item = (N, V)>, mut body: B, keep_conn: bool,
    ) -> Result<u16, Error>
    where
        N: AsRef<[u8]>,
        V: AsRef<[u8]>,
        B: AsyncRead + Unpin,
    {
        if self.broken {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        }
        let request_id = self.next_request_id();
        let flags = if keep_conn { fcgi::RequestFlags::KeepConn } else { fcgi::RequestFlags::empty() };

        let mut out = Vec::with_capacity(512);
        out.extend(body::BeginRequest { role: fcgi::Role::Responder, flags }.to_record(request_id));
        record::pack_nvp(&mut out, fcgi::RecordType::Params, request_id, params)?;
        record::encode_record(&mut out, fcgi::RecordType::Params, request_id, &[]);

        self.parser.reset(request_id);
        self.keep_conn = keep_conn;
        self.end = None;
        self.uses += 1;
        self.send(&out).await?;

        let mut chunk = vec![0; fcgi::STREAM_CHUNK_LEN];
        let mut body_len = 0;
        loop {
            let n = match body.read(&mut chunk).await {
                Ok(n) => n,
                Err(e) => {
                    self.broken = true;
                    return Err(e.into());
                },
            };
            // The empty record terminates Stdin
            out.clear();
            record::encode_record(&mut out, fcgi::RecordType::Stdin, request_id, &chunk[..n]);
            self.send(&out).await?;
            if n == 0 {
                break;
            }
            body_len += n;
        }
        tracing::debug!(request_id, keep_conn, body_len, "request sent");
        Ok(request_id)
    }

    /// Waits for the header block of the response.
    ///
    /// # Errors
    /// Fails with [`Error::CantMultiplex`], [`Error::Overloaded`] or
    /// [`Error::UnknownRole`] if the application rejected the request.
    /// I/O and protocol errors leave the connection unusable.
    pub async fn read_head(&mut self) -> Result<ResponseHead, Error> {
        loop {
            match self.next_event(&mut []).await? {
                Event::Head(head) => return Ok(*head),
                Event::End(end) => {
                    self.end = Some(end);
                    check_status(end)?;
                    return Ok(ResponseHead::default());
                },
                Event::Stderr(data) => self.sink.log_error(self.parser.request_id(), &data),
                Event::NeedInput | Event::Stdout(_) | Event::Values(_) => {},
            }
        }
    }

    /// Reads response body data into `buf`.
    ///
    /// Returns 0 once the response ended.
    ///
    /// # Errors
    /// See `Connection::read_head`.
    pub async fn read_body(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.end.is_some() || buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.next_event(buf).await? {
                Event::Stdout(n) if n > 0 => return Ok(n),
                Event::End(end) => {
                    self.end = Some(end);
                    check_status(end)?;
                    return Ok(0);
                },
                Event::Stderr(data) => self.sink.log_error(self.parser.request_id(), &data),
                _ => {},
            }
        }
    }

    /// Queries protocol variables such as `FCGI_MAX_CONNS` from the
    /// application.
    ///
    /// Must not be called while a response is being read.
    ///
    /// # Errors
    /// Fails if writing or reading failed.
    pub async fn get_values(&mut self, names: &[&str]) -> Result<HashMap<CompactString, CompactString>, Error> {
        let mut block = Vec::with_capacity(64);
        for name in names {
            nv::write((name.as_bytes(), b""), &mut block)?;
        }
        let mut out = Vec::with_capacity(block.len() + 16);
        record::encode_record(&mut out, fcgi::RecordType::GetValues, fcgi::FCGI_NULL_REQUEST_ID, &block);
        self.send(&out).await?;

        loop {
            if let Event::Values(values) = self.next_event(&mut []).await? {
                return Ok(values);
            }
        }
    }

    /// Parses until an event other than [`Event::NeedInput`] occurs.
    async fn next_event(&mut self, dest: &mut [u8]) -> Result<Event, Error> {
        let mut new_input = 0;
        loop {
            match self.parser.parse(new_input, dest) {
                Ok(Event::NeedInput) => {},
                Ok(event) => return Ok(event),
                Err(e) => {
                    self.broken = true;
                    return Err(e.into());
                },
            }
            new_input = self.read_input().await?;
        }
    }

    async fn read_input(&mut self) -> Result<usize, Error> {
        let Self { parser, reader, kill, .. } = self;
        let result = tokio::select! {
            biased;
            () = kill.killed() => Err(Error::RequestTimeout),
            r = reader.read(parser.input_buffer()) => match r {
                Ok(0) => Err(parser::Error::UnexpectedEof.into()),
                Ok(n) => Ok(n),
                Err(e) => Err(e.into()),
            },
        };
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        let Self { writer, kill, .. } = self;
        let result = tokio::select! {
            biased;
            () = kill.killed() => Err(Error::RequestTimeout),
            r = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => r.map_err(Error::from),
        };
        if result.is_err() {
            self.broken = true;
        }
        result
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("parser", &self.parser)
            .field("uses", &self.uses)
            .field("keep_conn", &self.keep_conn)
            .field("broken", &self.broken)
            .field("killed", &self.kill.is_killed())
            .finish_non_exhaustive()
    }
}


/// A response streamed from a pooled connection.
///
/// The connection returns to its [`Pool`] when the [`Response`] is dropped.
/// It is only reused if the body was read to its end.
#[derive(Debug)]
pub struct Response {
    head: ResponseHead,
    lease: Lease,
}

impl Response {
    /// Returns the HTTP status code.
    #[inline]
    #[must_use]
    pub fn status(&self) -> u16 {
        self.head.status
    }

    /// Returns the reason phrase following the status code.
    #[inline]
    #[must_use]
    pub fn status_text(&self) -> Option<&str> {
        self.head.status_text.as_deref()
    }

    /// Retrieves the first value of a header by its lower-case name.
    #[inline]
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }

    /// Returns the cookies set by the response.
    #[inline]
    #[must_use]
    pub fn cookies(&self) -> &[Cookie] {
        &self.head.cookies
    }

    /// Returns the complete header block.
    #[inline]
    #[must_use]
    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    /// Returns the application's exit status once the body ended.
    #[must_use]
    pub fn app_status(&self) -> Option<i32> {
        self.lease.end().map(|e| e.app_status)
    }

    /// Reads body data into `buf`, returning 0 at its end.
    ///
    /// # Errors
    /// See `Connection::read_body`.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.lease.read_body(buf).await
    }

    /// Reads the remaining body.
    ///
    /// # Errors
    /// See `Connection::read_body`.
    pub async fn bytes(mut self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        let mut buf = vec![0; 16 * 1024];
        loop {
            match self.read(&mut buf).await? {
                0 => return Ok(out),
                n => out.extend_from_slice(&buf[..n]),
            }
        }
    }

    /// Reads the remaining body, replacing invalid UTF-8 sequences.
    ///
    /// # Errors
    /// See `Connection::read_body`.
    pub async fn text(self) -> Result<String, Error> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8(bytes)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
    }
}


/// A FastCGI client sending requests over pooled connections.
///
/// Destinations are `host:port` strings or Unix socket paths, as accepted by
/// the pool's [`Connector`].
pub struct Client<C: Connector = SocketConnector> {
    pool: Pool<C>,
}

impl Client {
    /// Creates a [`Client`] for TCP and Unix socket destinations, reporting
    /// Stderr output through `tracing`.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self::with_pool(Pool::new(config, SocketConnector, Arc::new(TracingSink)))
    }
}

impl<C: Connector> Client<C> {
    /// Creates a [`Client`] sending requests through `pool`.
    #[must_use]
    pub fn with_pool(pool: Pool<C>) -> Self {
        Self { pool }
    }

    /// Returns the underlying connection pool.
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    /// Sends a request to `dest` and waits for the response's header block.
    ///
    /// A write that fails on a reused connection because the application
    /// closed it meanwhile is retried once on a new connection.
    ///
    /// # Errors
    /// Forwards errors from acquiring a connection, writing the request and
    /// reading the header block.
    pub async fn fetch<N, V>(&self, dest: &str, params: &[(N, V)], body: &[u8]) -> Result<Response, Error>
    where
        N: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut retried = false;
        loop {
            let mut lease = self.pool.acquire(dest, AcquireOptions::default()).await?;
            let pairs = params.iter().map(|(n, v)| (n.as_ref(), v.as_ref()));
            match lease.write_request(pairs, body, true).await {
                Ok(_) => {},
                Err(Error::Io(e)) if !retried && lease.is_reused() && is_disconnect(&e) => {
                    tracing::debug!(dest, error = %e, "reused connection was closed, retrying");
                    retried = true;
                    continue;
                },
                Err(e) => return Err(e),
            }

            let head = lease.read_head().await?;
            return Ok(Response { head, lease });
        }
    }

    /// Queries protocol variables from the application at `dest`.
    ///
    /// # Errors
    /// Forwards errors from acquiring a connection and the query itself.
    pub async fn get_values(&self, dest: &str, names: &[&str]) -> Result<HashMap<CompactString, CompactString>, Error> {
        let mut lease = self.pool.acquire(dest, AcquireOptions::default()).await?;
        let values = lease.get_values(names).await;
        if values.is_err() {
            lease.close();
        }
        values
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset)
}

impl<C: Connector> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self { pool: self.pool.clone() }
    }
}

impl<C: Connector> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client")
            .field("pool", &self.pool)
            .finish()
    }
}


#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    use futures_util::future::BoxFuture;
    use tokio::io::DuplexStream;
    use tokio::sync::{mpsc, oneshot};

    use super::*;
    use crate::server;
    use crate::transport::split_tokio;
    use crate::Config;

    /// Connects to in-memory pipes, whose server ends are sent to `rx`.
    pub(crate) struct PipeConnector {
        pub(crate) connects: AtomicUsize,
        tx: mpsc::UnboundedSender<DuplexStream>,
    }

    impl PipeConnector {
        pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Self { connects: AtomicUsize::new(0), tx }, rx)
        }
    }

    impl Connector for PipeConnector {
        fn connect<'a>(&'a self, _: &'a str) -> BoxFuture<'a, io::Result<(BoxReader, BoxWriter)>> {
            Box::pin(async move {
                self.connects.fetch_add(1, Ordering::Relaxed);
                let (client, server) = tokio::io::duplex(1 << 16);
                self.tx.send(server).map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;
                Ok(split_tokio(client))
            })
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct CollectSink(pub(crate) Mutex<Vec<(u16, Vec<u8>)>>);

    impl ErrorSink for CollectSink {
        fn error(&self, _: &Error) {}
        fn log_error(&self, request_id: u16, message: &[u8]) {
            self.0.lock().unwrap().push((request_id, message.to_vec()));
        }
    }

    /// Answers requests with their `SCRIPT_NAME` and body. The connection is
    /// dropped after `max_requests`, which is reported through `closed`.
    async fn serve(stream: DuplexStream, max_requests: usize, closed: Option<oneshot::Sender<()>>) {
        let (r, w) = split_tokio(stream);
        let mut conn = server::Connection::new(Arc::new(Config::default()), r, w);
        for _ in 0..max_requests {
            let Ok(Some(mut req)) = conn.next_request().await else { break };
            let mut stdin = Vec::new();
            req.read_to_end(&mut stdin).await.unwrap();
            let script = req.head().param_str("SCRIPT_NAME").unwrap_or("-").to_owned();
            req.set_header("X-Script", &script).unwrap();
            req.set_cookie(Cookie::new("seen", "1")).unwrap();
            if stdin == b"warn" {
                req.write_stderr(b"careful").await.unwrap();
            }
            req.write(&stdin).await.unwrap();
            req.set_app_status(7).unwrap();
            req.respond().await.unwrap();
            match req.into_connection() {
                Some(c) => conn = c,
                None => break,
            }
        }
        if let Some(closed) = closed {
            let _ = closed.send(());
        }
    }

    fn client(config: PoolConfig, sink: Arc<dyn ErrorSink>) -> (Client<PipeConnector>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (connector, rx) = PipeConnector::new();
        (Client::with_pool(Pool::new(config, connector, sink)), rx)
    }

    #[test]
    fn trait_check() {
        fn ok<T: Send + Sync>() {}
        ok::<Client>();
        fn send<T: Send>() {}
        send::<Connection>();
        send::<Response>();
    }

    #[test]
    fn request_ids_wrap() {
        let mut config = PoolConfig::default();
        config.request_id_bound = 3;
        let (r, w) = split_tokio(tokio::io::duplex(64).0);
        let mut conn = Connection::new(&config, r, w, Arc::new(TracingSink));
        let ids: Vec<_> = std::iter::repeat_with(|| conn.next_request_id()).take(7).collect();
        assert_eq!(ids, [1, 2, 3, 1, 2, 3, 1]);
    }

    /// Hands out `data` in reads of at most `chunk` bytes.
    struct ChunkedReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl AsyncRead for ChunkedReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>, _: &mut std::task::Context<'_>, buf: &mut [u8],
        ) -> std::task::Poll<io::Result<usize>> {
            let end = self.data.len().min(self.pos + self.chunk.min(buf.len()));
            let n = end - self.pos;
            buf[..n].copy_from_slice(&self.data[self.pos..end]);
            self.pos = end;
            std::task::Poll::Ready(Ok(n))
        }
    }

    #[tokio::test]
    async fn wire_round_trip_any_chunking() -> Result<(), Error> {
        use tokio::io::AsyncReadExt as _;
        let long_value = "v".repeat(300);
        let mut params = vec![
            ("SCRIPT_NAME".to_owned(), "/upload.php".to_owned()),
            ("REQUEST_METHOD".to_owned(), "PUT".to_owned()),
            ("HTTP_X_LONG".to_owned(), long_value.clone()),
            ("QUERY_STRING".to_owned(), String::new()),
        ];
        params.extend((0..200).map(|i| (format!("HTTP_X_{i}"), format!("value {i}"))));
        let body = crate::parser::test_support::random_bytes(150_000);

        let (stream, mut server) = tokio::io::duplex(1 << 20);
        let (r, w) = split_tokio(stream);
        let mut conn = Connection::new(&PoolConfig::default(), r, w, Arc::new(TracingSink));
        let request_id = conn.write_request(params.iter().map(|(n, v)| (n, v)), &body[..], false).await?;
        drop(conn);
        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await?;

        for chunk in [1, 7, 8, 4096, 65535, 100_000] {
            let reader = ChunkedReader { data: wire.clone(), pos: 0, chunk };
            let conn = server::Connection::new(
                Arc::new(Config::default()), Box::new(reader), Box::new(futures_util::io::sink()),
            );
            let mut req = conn.next_request().await?.unwrap();
            assert_eq!(req.request_id(), request_id);
            assert_eq!(req.head().params_len(), params.len());
            for (name, value) in &params {
                assert_eq!(req.head().param(name), Some(value.as_bytes()), "chunk {chunk}, {name}");
            }
            assert_eq!(req.head().header("x-long"), Some(long_value.as_str()));

            let mut received = Vec::new();
            req.read_to_end(&mut received).await?;
            assert!(received == body, "chunk {chunk}");
            req.respond().await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn round_trip() -> Result<(), Error> {
        let sink = Arc::new(CollectSink::default());
        let (client, mut rx) = client(PoolConfig::default(), sink.clone());
        tokio::spawn(async move {
            while let Some(stream) = rx.recv().await {
                tokio::spawn(serve(stream, usize::MAX, None));
            }
        });

        let body = crate::parser::test_support::random_bytes(200_000);
        let params = [("SCRIPT_NAME", "/index.php"), ("REQUEST_METHOD", "POST")];
        let resp = client.fetch("pipe", &params, &body).await?;
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.header("x-script"), Some("/index.php"));
        assert_eq!(resp.cookies()[0].name, "seen");
        assert_eq!(resp.bytes().await?, body);

        // The connection is reused without cross-contamination
        let mut resp = client.fetch("pipe", &params, b"warn").await?;
        let mut buf = [0; 64];
        let n = resp.read(&mut buf).await?;
        assert_eq!(&buf[..n], b"warn");
        assert_eq!(resp.read(&mut buf).await?, 0);
        assert_eq!(resp.app_status(), Some(7));
        drop(resp);

        assert_eq!(client.pool().connector().connects.load(Ordering::Relaxed), 1);
        assert_eq!(*sink.0.lock().unwrap(), [(2, b"careful".to_vec())]);

        let values = client.get_values("pipe", &["FCGI_MAX_CONNS", "FCGI_MPXS_CONNS"]).await?;
        assert_eq!(values.get("FCGI_MAX_CONNS").map(CompactString::as_str), Some("128"));
        assert_eq!(values.get("FCGI_MPXS_CONNS").map(CompactString::as_str), Some("0"));
        Ok(())
    }

    #[tokio::test]
    async fn retry_once() -> Result<(), Error> {
        let (client, mut rx) = client(PoolConfig::default(), Arc::new(TracingSink));
        let (closed_tx, closed_rx) = oneshot::channel();
        let first = rx.recv();
        let resp = tokio::join!(
            client.fetch("pipe", &[("SCRIPT_NAME", "/a")], b"one"),
            async { serve(first.await.unwrap(), 1, Some(closed_tx)).await },
        ).0?;
        assert_eq!(resp.text().await?, "one");
        assert_eq!(client.pool().idle_connections(), 1);
        closed_rx.await.unwrap();

        // The idle connection is closed by now, so the second attempt
        // uses a new connection
        tokio::spawn(async move {
            while let Some(stream) = rx.recv().await {
                tokio::spawn(serve(stream, usize::MAX, None));
            }
        });
        let resp = client.fetch("pipe", &[("SCRIPT_NAME", "/b")], b"two").await?;
        assert_eq!(resp.header("x-script"), Some("/b"));
        assert_eq!(resp.text().await?, "two");
        assert_eq!(client.pool().connector().connects.load(Ordering::Relaxed), 2);
        Ok(())
    }

    #[tokio::test]
    async fn rejected_role() -> Result<(), Error> {
        use tokio::io::AsyncWriteExt as _;
        let (client, mut rx) = client(PoolConfig::default(), Arc::new(TracingSink));
        tokio::spawn(async move {
            let mut stream = rx.recv().await.unwrap();
            let end = body::EndRequest::reject(fcgi::ProtocolStatus::Overloaded).to_record(1);
            stream.write_all(&end).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let err = client.fetch("pipe", &[("A", "b")], b"").await.unwrap_err();
        assert!(matches!(err, Error::Overloaded));
        assert_eq!(client.pool().busy_connections(), 0);
        Ok(())
    }
}
