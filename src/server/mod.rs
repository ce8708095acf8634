use std::fmt;
use std::io;
use std::sync::Arc;

use futures_util::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::parser::headers::{Cookie, ResponseHead};
use crate::parser::server::{Event, Parser};
use crate::parser::{self, RequestHead};
use crate::protocol::{self as fcgi, body, record};
use crate::transport::{BoxReader, BoxWriter};
use crate::{Config, Error};

/// Accepting connections from multiple listeners and yielding their requests.
pub mod acceptor;

pub use acceptor::{Acceptor, AcceptorHandle};


/// The server side of a single FastCGI connection.
///
/// A [`Connection`] yields one [`Request`] at a time. Requests of clients
/// that keep the connection open are read from the same input buffer, so
/// pipelined requests are never lost.
pub struct Connection {
    parser: Parser,
    reader: BoxReader,
    writer: BoxWriter,
    pub(crate) origin: Option<acceptor::Origin>,
}

impl Connection {
    /// Wraps both halves of a transport into a [`Connection`].
    #[must_use]
    pub fn new(config: Arc<Config>, reader: BoxReader, writer: BoxWriter) -> Self {
        Self { parser: Parser::new(config), reader, writer, origin: None }
    }

    /// Waits for the next request on this connection.
    ///
    /// Returns [`None`] if the client closed the connection between requests.
    ///
    /// # Errors
    /// Returns an [`Error`] if reading failed or the record stream was
    /// malformed. The connection is unusable afterwards.
    pub async fn next_request(mut self) -> Result<Option<Request>, Error> {
        Ok(self.read_head().await?.map(|head| Request::new(head, self, None)))
    }

    pub(crate) async fn read_head(&mut self) -> Result<Option<Box<RequestHead>>, Error> {
        loop {
            match self.next_event(None).await? {
                Some(Event::Request(head)) => {
                    self.flush_output().await?;
                    return Ok(Some(head));
                },
                Some(Event::Pipelined) => self.parser.finish(),
                Some(_) => {},
                None if self.parser.is_idle() => return Ok(None),
                None => return Err(parser::Error::UnexpectedEof.into()),
            }
        }
    }

    pub(crate) fn active_request(&self) -> Option<u16> {
        self.parser.active_request().map(std::num::NonZeroU16::get)
    }

    /// Parses until an event other than [`Event::NeedInput`] occurs. Returns
    /// [`None`] on EOF.
    async fn next_event(&mut self, mut dest: Option<&mut [u8]>) -> Result<Option<Event>, Error> {
        let mut new_input = 0;
        loop {
            match self.parser.parse(new_input, dest.as_deref_mut())? {
                Event::NeedInput => {},
                event => return Ok(Some(event)),
            }
            // Answers to management records go out before we block on input
            self.flush_output().await?;
            new_input = self.reader.read(self.parser.input_buffer()).await?;
            if new_input == 0 {
                return Ok(None);
            }
        }
    }

    /// Observes events from buffered input without reading or consuming
    /// Stdin data.
    fn poll_buffered(&mut self) -> bool {
        loop {
            match self.parser.parse(0, Some(&mut [][..])) {
                Ok(Event::Aborted) => return true,
                Ok(Event::StdinEnd) => {},
                _ => return false,
            }
        }
    }

    /// Discards the active request's remaining Stdin stream. Returns whether
    /// the request was aborted meanwhile.
    async fn drain_stdin(&mut self) -> Result<bool, Error> {
        while !self.parser.stdin_complete() && !self.parser.is_aborted() {
            match self.next_event(None).await? {
                Some(Event::Aborted) => return Ok(true),
                Some(Event::StdinEnd | Event::Pipelined) => break,
                Some(_) => {},
                None => return Err(parser::Error::UnexpectedEof.into()),
            }
        }
        Ok(self.parser.is_aborted())
    }

    async fn flush_output(&mut self) -> io::Result<()> {
        let out = self.parser.output_buffer();
        if out.is_empty() {
            return Ok(());
        }
        let len = out.len();
        self.writer.write_all(out).await?;
        self.parser.consume_output(len);
        self.writer.flush().await
    }

    /// Writes `data` after any pending parser output.
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let out = self.parser.output_buffer();
        let len = out.len();
        self.writer.write_all(out).await?;
        self.parser.consume_output(len);
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }

    pub(crate) async fn close(&mut self) {
        if let Err(e) = self.writer.close().await {
            tracing::debug!(error = %e, "closing FastCGI connection failed");
        }
    }

    /// Completes a request with a `503` response that the application never
    /// provided.
    pub(crate) async fn reject_unavailable(&mut self, request_id: u16, headers_sent: bool) -> io::Result<()> {
        let mut out = Vec::with_capacity(96);
        if !headers_sent {
            let mut head = ResponseHead::default();
            head.status = 503;
            head.status_text = Some("Service Unavailable".into());
            let mut block = Vec::with_capacity(48);
            head.write_block(&mut block);
            record::encode_stream(&mut out, fcgi::RecordType::Stdout, request_id, &block);
        }
        record::encode_record(&mut out, fcgi::RecordType::Stdout, request_id, &[]);
        out.extend(body::EndRequest::reject(fcgi::ProtocolStatus::RequestComplete).to_record(request_id));
        self.parser.finish();
        self.send(&out).await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("parser", &self.parser)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}


/// How a request hands its connection back to the [`Acceptor`].
#[derive(Debug)]
pub(crate) enum Handoff {
    /// The response is complete and the connection may carry another request.
    Recycle(Connection),
    /// The request was aborted and the connection must not be reused.
    Close(Connection),
    /// The request was dropped without a response.
    Abandoned { conn: Connection, request_id: u16, headers_sent: bool },
}


/// A FastCGI request whose parameters are complete.
///
/// The request body is read with `Request::read`. The response consists of
/// a header block, which is sent before the first body byte, and the body
/// itself. `Request::respond` completes the request. Dropping a [`Request`]
/// without responding makes the [`Acceptor`] answer it with status 503,
/// unless the client aborted it.
///
/// If the FastCGI client aborts the request, reads fail with
/// [`Error::Aborted`] and writes are silently dropped. `Request::respond`
/// reports the abort once, every later call fails with
/// [`Error::Terminated`].
#[derive(Debug)]
pub struct Request {
    head: Box<RequestHead>,
    conn: Option<Connection>,
    done: Option<oneshot::Sender<Handoff>>,
    response: ResponseHead,
    /// Stdout data that is not framed yet, starting with the header block.
    body: Vec<u8>,
    app_status: i32,
    headers_sent: bool,
    stderr_written: bool,
    aborted: bool,
    abort_reported: bool,
    terminated: bool,
    /// Set when the connection must not carry another request.
    poisoned: bool,
}

impl Request {
    pub(crate) fn new(head: Box<RequestHead>, conn: Connection, done: Option<oneshot::Sender<Handoff>>) -> Self {
        Self {
            head, conn: Some(conn), done,
            response: ResponseHead::default(), body: Vec::new(), app_status: 0,
            headers_sent: false, stderr_written: false,
            aborted: false, abort_reported: false, terminated: false, poisoned: false,
        }
    }

    /// Returns the parameters and derived fields of this request.
    #[inline]
    #[must_use]
    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    /// Returns the FastCGI ID of this request.
    #[inline]
    #[must_use]
    pub fn request_id(&self) -> u16 {
        self.head.request_id.get()
    }

    /// Tests whether the FastCGI client aborted this request.
    #[inline]
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Tests whether the request was completed.
    #[inline]
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Tests whether the header block was committed to the response.
    #[inline]
    #[must_use]
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Tests whether the request body was read to its end.
    #[must_use]
    pub fn stdin_complete(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.parser.stdin_complete())
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.aborted {
            Err(Error::Aborted)
        } else if self.terminated {
            Err(Error::Terminated)
        } else {
            Ok(())
        }
    }

    fn check_headers(&self) -> Result<(), Error> {
        if self.terminated {
            Err(Error::Terminated)
        } else if self.headers_sent {
            Err(Error::HeadersSent)
        } else {
            Ok(())
        }
    }

    fn observe_abort(&mut self) {
        if let Some(conn) = &mut self.conn {
            if !self.aborted && conn.poll_buffered() {
                tracing::debug!(request_id = self.head.request_id.get(), "request aborted");
                self.aborted = true;
            }
        }
    }

    /// Reads request body data into `buf`.
    ///
    /// Returns 0 once the body reached its end.
    ///
    /// # Errors
    /// Fails with [`Error::Aborted`] after the client aborted the request and
    /// with [`Error::Terminated`] after `Request::respond`. I/O and protocol
    /// errors are forwarded and leave the connection unusable.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.check_open()?;
        let Some(conn) = &mut self.conn else { return Err(Error::Terminated) };
        if buf.is_empty() || conn.parser.stdin_complete() {
            return Ok(0);
        }

        match conn.next_event(Some(buf)).await {
            Ok(Some(Event::Stdin(n))) => Ok(n),
            Ok(Some(Event::Aborted)) => {
                tracing::debug!(request_id = self.head.request_id.get(), "request aborted");
                self.aborted = true;
                Err(Error::Aborted)
            },
            Ok(Some(_)) => Ok(0),
            Ok(None) => {
                self.poisoned = true;
                Err(parser::Error::UnexpectedEof.into())
            },
            Err(e) => {
                self.poisoned = true;
                Err(e)
            },
        }
    }

    /// Reads the remaining request body into `out`, returning the number of
    /// bytes read.
    ///
    /// # Errors
    /// See `Request::read`.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize, Error> {
        let start = out.len();
        let mut buf = [0; 4096];
        loop {
            match self.read(&mut buf).await? {
                0 => return Ok(out.len() - start),
                n => out.extend_from_slice(&buf[..n]),
            }
        }
    }

    /// Sets the response status and an optional reason phrase.
    ///
    /// # Errors
    /// Fails with [`Error::HeadersSent`] once the header block was committed.
    pub fn set_status(&mut self, status: u16, text: Option<&str>) -> Result<(), Error> {
        self.check_headers()?;
        self.response.status = status;
        self.response.status_text = text.map(Into::into);
        Ok(())
    }

    /// Sets a response header, replacing previous values.
    ///
    /// # Errors
    /// Fails with [`Error::HeadersSent`] once the header block was committed.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), Error> {
        self.check_headers()?;
        self.response.set_header(name, value);
        Ok(())
    }

    /// Adds a value for a response header.
    ///
    /// # Errors
    /// Fails with [`Error::HeadersSent`] once the header block was committed.
    pub fn add_header(&mut self, name: &str, value: &str) -> Result<(), Error> {
        self.check_headers()?;
        self.response.add_header(name, value);
        Ok(())
    }

    /// Adds a `set-cookie` line to the response.
    ///
    /// # Errors
    /// Fails with [`Error::HeadersSent`] once the header block was committed.
    pub fn set_cookie(&mut self, cookie: Cookie) -> Result<(), Error> {
        self.check_headers()?;
        self.response.cookies.push(cookie);
        Ok(())
    }

    /// Sets the application status reported in the EndRequest record.
    ///
    /// # Errors
    /// Fails with [`Error::Terminated`] after `Request::respond`.
    pub fn set_app_status(&mut self, status: i32) -> Result<(), Error> {
        if self.terminated {
            return Err(Error::Terminated);
        }
        self.app_status = status;
        Ok(())
    }

    /// Commits the header block as the start of the response body.
    fn commit_headers(&mut self) {
        if !self.headers_sent {
            let mut block = Vec::with_capacity(128 + self.body.len());
            self.response.write_block(&mut block);
            block.append(&mut self.body);
            self.body = block;
            self.headers_sent = true;
        }
    }

    /// Appends data to the response body.
    ///
    /// The header block is committed with the first byte. Data is buffered
    /// and sent in records of up to 64 KB.
    ///
    /// # Errors
    /// Fails with [`Error::Terminated`] after `Request::respond`. Data written
    /// after an abort is discarded without error.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.observe_abort();
        if self.aborted {
            return Ok(data.len());
        } else if self.terminated {
            return Err(Error::Terminated);
        }

        self.commit_headers();
        self.body.extend_from_slice(data);
        if self.body.len() >= fcgi::STREAM_CHUNK_LEN {
            self.send_body(false).await?;
        }
        Ok(data.len())
    }

    /// Sends data on the Stderr stream immediately.
    ///
    /// # Errors
    /// Same as `Request::write`.
    pub async fn write_stderr(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.observe_abort();
        if self.aborted || data.is_empty() {
            return Ok(data.len());
        } else if self.terminated {
            return Err(Error::Terminated);
        }

        let mut out = Vec::with_capacity(data.len() + 16);
        record::encode_stream(&mut out, fcgi::RecordType::Stderr, self.request_id(), data);
        self.stderr_written = true;
        self.send(&out).await?;
        Ok(data.len())
    }

    /// Sends the buffered response data, committing the header block.
    ///
    /// # Errors
    /// Same as `Request::write`.
    pub async fn flush(&mut self) -> Result<(), Error> {
        self.observe_abort();
        if self.aborted {
            return Ok(());
        } else if self.terminated {
            return Err(Error::Terminated);
        }
        self.commit_headers();
        self.send_body(false).await
    }

    /// Frames and sends the buffered body, optionally followed by the end of
    /// the request.
    async fn send_body(&mut self, end: bool) -> Result<(), Error> {
        let request_id = self.request_id();
        let mut out = Vec::with_capacity(self.body.len() + 64);
        record::encode_stream(&mut out, fcgi::RecordType::Stdout, request_id, &self.body);
        self.body.clear();

        if end {
            record::encode_record(&mut out, fcgi::RecordType::Stdout, request_id, &[]);
            if self.stderr_written {
                record::encode_record(&mut out, fcgi::RecordType::Stderr, request_id, &[]);
            }
            let end = body::EndRequest {
                app_status: self.app_status,
                protocol_status: fcgi::ProtocolStatus::RequestComplete,
            };
            out.extend(end.to_record(request_id));
        }
        self.send(&out).await
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        let Some(conn) = &mut self.conn else { return Err(Error::Terminated) };
        if let Err(e) = conn.send(data).await {
            // The transport's state is unknown, so it cannot carry another request
            self.poisoned = true;
            return Err(e.into());
        }
        Ok(())
    }

    /// Completes the request.
    ///
    /// Unread request body data is discarded first. Then the header block
    /// (if not sent yet), the buffered body and the end of the request are
    /// sent. Afterwards, the connection carries the client's next request or
    /// is closed.
    ///
    /// # Errors
    /// The first call after the client aborted the request fails with
    /// [`Error::Aborted`]. Calls after the request was completed fail with
    /// [`Error::Terminated`]. I/O and protocol errors are forwarded.
    pub async fn respond(&mut self) -> Result<(), Error> {
        if self.terminated {
            if self.aborted && !self.abort_reported {
                self.abort_reported = true;
                return Err(Error::Aborted);
            }
            return Err(Error::Terminated);
        }
        self.observe_abort();
        self.terminated = true;

        let mut result = Ok(());
        if !self.aborted && !self.poisoned {
            if let Some(conn) = &mut self.conn {
                match conn.drain_stdin().await {
                    Ok(aborted) => self.aborted = aborted,
                    Err(e) => {
                        self.poisoned = true;
                        result = Err(e);
                    },
                }
            }
        }

        if self.aborted {
            // The parser already queued the EndRequest record
            self.abort_reported = true;
            result = Err(Error::Aborted);
            if let Some(conn) = &mut self.conn {
                if conn.flush_output().await.is_err() {
                    self.poisoned = true;
                }
            }
        } else if result.is_ok() {
            self.commit_headers();
            result = self.send_body(true).await;
        }

        self.release().await;
        result
    }

    /// Hands the connection back after the request was completed.
    async fn release(&mut self) {
        let done = self.done.take();
        let Some(mut conn) = self.conn.take() else { return };
        conn.parser.finish();
        if self.head.keep_conn && !self.poisoned {
            match done {
                Some(done) => {
                    if let Err(Handoff::Recycle(mut conn)) = done.send(Handoff::Recycle(conn)) {
                        conn.close().await;
                    }
                },
                None => self.conn = Some(conn),
            }
        } else {
            conn.close().await;
            // Tells the acceptor the connection is gone
            drop(done);
        }
    }

    /// Returns the connection after a completed request, if it may carry
    /// the client's next request.
    ///
    /// Requests from an [`Acceptor`] return their connection automatically,
    /// so this is only useful for a [`Connection`] used on its own.
    #[must_use]
    pub fn into_connection(mut self) -> Option<Connection> {
        if self.terminated { self.conn.take() } else { None }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        self.observe_abort();
        let request_id = self.request_id();
        let Some(mut conn) = self.conn.take() else { return };
        let handoff = if self.aborted {
            // The parser queued the EndRequest echo already
            tracing::debug!(request_id, "aborted request dropped");
            conn.parser.finish();
            if self.head.keep_conn && !self.poisoned { Handoff::Recycle(conn) } else { Handoff::Close(conn) }
        } else {
            tracing::warn!(request_id, "request dropped without response");
            Handoff::Abandoned { conn, request_id, headers_sent: self.headers_sent }
        };
        if let Some(done) = self.done.take() {
            if done.send(handoff).is_err() {
                tracing::debug!(request_id, "acceptor is gone");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::test_support;
    use crate::transport::split_tokio;

    #[test]
    fn trait_check() {
        fn ok<T: Send>() {}
        ok::<Connection>();
        ok::<Request>();
    }

    /// Starts a server connection over an in-memory pipe. Returns the client
    /// end of the pipe.
    fn pipe(config: Config) -> (Connection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (r, w) = split_tokio(server);
        (Connection::new(Arc::new(config), r, w), client)
    }

    fn hello_request(id: u16, keep_conn: bool, stdin: &[u8]) -> Vec<u8> {
        let mut inp = Vec::new();
        test_support::add_begin(&mut inp, id, keep_conn);
        test_support::add_params(&mut inp, id, [(&b"HELLO"[..], &b"all"[..])].into_iter(), &[]);
        test_support::add_stream(&mut inp, id, fcgi::RecordType::Stdin, stdin, &[]);
        inp
    }

    /// Splits a response into the contents of its Stdout stream and its
    /// EndRequest body.
    fn split_response(mut out: &[u8]) -> (Vec<u8>, Vec<u8>, Option<body::EndRequest>) {
        let (mut stdout, mut stderr, mut end) = (Vec::new(), Vec::new(), None);
        while out.len() >= 8 {
            let mut raw = [0; 8];
            raw.copy_from_slice(&out[..8]);
            let head = fcgi::RecordHeader::from_bytes(raw).unwrap();
            let payload = &out[8..(8 + usize::from(head.content_length))];
            match head.rtype {
                fcgi::RecordType::Stdout => stdout.extend(payload),
                fcgi::RecordType::Stderr => stderr.extend(payload),
                fcgi::RecordType::EndRequest => {
                    end = Some(body::EndRequest::from_bytes(payload.try_into().unwrap()).unwrap());
                },
                _ => {},
            }
            out = &out[(8 + usize::from(head.content_length) + usize::from(head.padding_length))..];
        }
        (stdout, stderr, end)
    }

    #[tokio::test]
    async fn hello_wire() -> Result<(), Error> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let (conn, mut client) = pipe(Config::default());
        client.write_all(&hello_request(1, false, b"Body")).await?;

        let mut req = conn.next_request().await?.unwrap();
        assert_eq!(req.request_id(), 1);
        assert!(!req.head().keep_conn);
        assert_eq!(req.head().param_str("HELLO"), Some("all"));
        let mut stdin = Vec::new();
        req.read_to_end(&mut stdin).await?;
        assert_eq!(stdin, b"Body");
        assert!(req.stdin_complete());

        req.set_header("X-Hello", "all")?;
        req.write(b"Response body").await?;
        req.respond().await?;
        assert!(req.into_connection().is_none());

        let mut out = Vec::new();
        client.read_to_end(&mut out).await?;
        const STDOUT: &[u8] = b"status: 200\r\nx-hello: all\r\n\r\nResponse body";
        let mut expected = Vec::new();
        record::encode_stream(&mut expected, fcgi::RecordType::Stdout, 1, STDOUT);
        record::encode_record(&mut expected, fcgi::RecordType::Stdout, 1, &[]);
        expected.extend(body::EndRequest::reject(fcgi::ProtocolStatus::RequestComplete).to_record(1));
        assert_eq!(out, expected);
        Ok(())
    }

    #[tokio::test]
    async fn terminated_and_headers() -> Result<(), Error> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let (conn, mut client) = pipe(Config::default());
        client.write_all(&hello_request(7, false, &test_support::random_bytes(100_000))).await?;

        let mut req = conn.next_request().await?.unwrap();
        req.set_status(404, Some("Not Found"))?;
        req.set_cookie(Cookie::new("a", "b"))?;
        req.set_app_status(3)?;
        req.write_stderr(b"warning").await?;
        req.flush().await?;
        assert!(req.headers_sent());
        assert!(matches!(req.set_header("x-late", "1"), Err(Error::HeadersSent)));

        // The unread body is discarded
        req.respond().await?;
        assert!(matches!(req.respond().await, Err(Error::Terminated)));
        assert!(matches!(req.write(b"late").await, Err(Error::Terminated)));
        assert!(matches!(req.read(&mut [0; 4]).await, Err(Error::Terminated)));
        assert!(matches!(req.set_app_status(1), Err(Error::Terminated)));

        let mut out = Vec::new();
        client.read_to_end(&mut out).await?;
        let (stdout, stderr, end) = split_response(&out);
        assert_eq!(stdout, b"status: 404 Not Found\r\nset-cookie: a=b\r\n\r\n");
        assert_eq!(stderr, b"warning");
        let end = end.unwrap();
        assert_eq!(end.app_status, 3);
        assert_eq!(end.protocol_status, fcgi::ProtocolStatus::RequestComplete);
        Ok(())
    }

    #[tokio::test]
    async fn aborted_once() -> Result<(), Error> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        const REQ_ID: u16 = 0x2a;
        let (conn, mut client) = pipe(Config::default());
        let mut inp = Vec::new();
        test_support::add_begin(&mut inp, REQ_ID, true);
        test_support::add_params(&mut inp, REQ_ID, test_support::PARAMS.iter().copied(), &[]);
        client.write_all(&inp).await?;

        let mut req = conn.next_request().await?.unwrap();
        inp.clear();
        test_support::add_abort(&mut inp, REQ_ID);
        client.write_all(&inp).await?;

        assert!(matches!(req.read(&mut [0; 16]).await, Err(Error::Aborted)));
        assert!(req.is_aborted());
        assert_eq!(req.write(b"dropped").await?, 7);
        assert!(matches!(req.respond().await, Err(Error::Aborted)));
        assert!(matches!(req.respond().await, Err(Error::Terminated)));

        // The connection stays usable for the next request
        let conn = req.into_connection().unwrap();
        client.write_all(&hello_request(REQ_ID + 1, false, b"")).await?;
        let mut req = conn.next_request().await?.unwrap();
        assert_eq!(req.request_id(), REQ_ID + 1);
        req.respond().await?;

        let mut out = Vec::new();
        client.read_to_end(&mut out).await?;
        let abort_end = body::EndRequest::reject(fcgi::ProtocolStatus::RequestComplete).to_record(REQ_ID);
        assert_eq!(&out[..16], abort_end);
        assert!(!out.windows(7).any(|w| w == b"dropped"));
        Ok(())
    }

    #[tokio::test]
    async fn pipelined_keep_conn() -> Result<(), Error> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let (mut conn, mut client) = pipe(Config::default());
        let mut inp = hello_request(1, true, b"first body");
        inp.extend(hello_request(2, true, b"second body"));
        client.write_all(&inp).await?;

        for (id, expected) in [(1, &b"first body"[..]), (2, &b"second body"[..])] {
            let mut req = conn.next_request().await?.unwrap();
            assert_eq!(req.request_id(), id);
            let mut stdin = Vec::new();
            req.read_to_end(&mut stdin).await?;
            assert_eq!(stdin, expected);
            req.write(&stdin).await?;
            req.respond().await?;
            conn = req.into_connection().unwrap();
        }

        // Closing the client ends the connection cleanly
        client.shutdown().await?;
        let mut out = vec![0; 1024];
        let n = client.read(&mut out).await?;
        let (stdout, _, _) = split_response(&out[..n]);
        assert!(stdout.ends_with(b"second body"));
        assert!(conn.next_request().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn eof_mid_request() -> Result<(), Error> {
        use tokio::io::AsyncWriteExt;
        let (conn, mut client) = pipe(Config::default());
        let inp = hello_request(5, false, b"");
        client.write_all(&inp[..20]).await?;
        drop(client);
        assert!(matches!(
            conn.next_request().await,
            Err(Error::Protocol(parser::Error::UnexpectedEof)),
        ));
        Ok(())
    }
}
