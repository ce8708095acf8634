use std::collections::HashMap;
use std::fmt::Debug;
use std::iter::FusedIterator;
use std::num::NonZeroU16;

use compact_str::CompactString;
use smallvec::SmallVec;

use crate::protocol as fcgi;

/// Parsing and formatting of the header block at the start of a response.
pub mod headers;
/// A parser for the response side of a FastCGI connection.
pub mod response;
/// A parser for the request side of a FastCGI connection.
pub mod server;


/// Unrecoverable error types shared between the `Parser` types from submodules.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A panic inside the parser code left the parser in an inconsistent state.
    ///
    /// Parser instances cannot be reused after a panic. The connection should
    /// be closed instead.
    #[error("FastCGI parser state was lost due to an unexpected panic")]
    Paniced,

    /// The header of a BeginRequest FastCGI record specified a length that is
    /// different from its fixed-size body.
    #[error(
        "BeginRequest FastCGI record has invalid length {0}, expected {exp}",
        exp = fcgi::body::BeginRequest::LEN
    )]
    InvalidRequestLen(u16),

    /// The header of an EndRequest FastCGI record specified a length that is
    /// different from its fixed-size body.
    #[error(
        "EndRequest FastCGI record has invalid length {0}, expected {exp}",
        exp = fcgi::body::EndRequest::LEN
    )]
    InvalidEndLen(u16),

    /// The header of a BeginRequest FastCGI record specified request ID 0,
    /// which the protocol reserves for management records.
    #[error("BeginRequest FastCGI record has reserved ID 0, expected nonzero")]
    NullRequest,

    /// The peer closed the connection in the middle of a record or request.
    #[error("FastCGI connection closed unexpectedly")]
    UnexpectedEof,

    /// The response header block did not end within the configured limit.
    #[error("FastCGI response header block exceeds {0} bytes")]
    HeadTooLarge(usize),

    /// A function from the [`protocol`](crate::protocol) module returned an
    /// unexpected error type.
    #[error("unexpected protocol error: {0}")]
    Protocol(#[from] fcgi::Error),
}


const SMALLVEC_BASE_SIZE: usize = std::mem::size_of::<SmallVec<[u8; 0]>>();
// Maximum number of inline bytes before SmallVec exceeds SMALLVEC_BASE_SIZE.
// This derives from SmallVec's layout, which uses 1 usize as discriminant.
const INLINE_BYTES: usize = SMALLVEC_BASE_SIZE - std::mem::size_of::<usize>();
pub(crate) type SmallBytes = SmallVec<[u8; INLINE_BYTES]>;


/// A fixed-size input buffer shared between parsing steps.
///
/// Layout: [consumed] | <available> | <free>
#[derive(Debug)]
pub(crate) struct Buffer {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl Buffer {
    pub(crate) fn new(size: usize) -> Self {
        Self { data: vec![0; size].into_boxed_slice(), start: 0, end: 0 }
    }

    /// Returns the slice into which new input must be written.
    ///
    /// The number of bytes written is later passed to `Buffer::fill`.
    pub(crate) fn input_buffer(&mut self) -> &mut [u8] {
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        } else if self.data.len() - self.end < self.data.len() / 4 {
            self.compress();
        }
        &mut self.data[self.end..]
    }

    pub(crate) fn fill(&mut self, amt: usize) {
        assert!(amt <= self.data.len() - self.end, "input exceeds the input buffer");
        self.end += amt;
    }

    #[inline]
    pub(crate) fn available(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    #[inline]
    pub(crate) fn consume(&mut self, amt: usize) {
        self.start = (self.start + amt).min(self.end);
    }

    /// Moves the available bytes to the front of the buffer.
    fn compress(&mut self) {
        if self.start > 0 {
            self.data.copy_within(self.start..self.end, 0);
            crate::macros::trace!(freed = self.start, "buffer compressed");
            self.end -= self.start;
            self.start = 0;
        }
    }
}


/// The environment of a FastCGI request whose Params stream is complete.
///
/// Besides the raw parameters, commonly needed values are derived once the
/// stream ends: HTTP headers from `HTTP_*` parameters, the request line and
/// the body's framing.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// The ID of this request, to be matched against future records.
    pub request_id: NonZeroU16,
    /// Whether the FastCGI client asked to keep the connection open.
    pub keep_conn: bool,
    params: HashMap<CompactString, SmallBytes>,
    headers: HashMap<CompactString, CompactString>,
    cookie: Option<CompactString>,
    url: CompactString,
    method: CompactString,
    protocol: (u8, u8),
    content_type: Option<CompactString>,
    boundary: Option<CompactString>,
    content_length: Option<u64>,
}

impl RequestHead {
    #[must_use]
    pub(crate) fn new(request_id: NonZeroU16, keep_conn: bool) -> Self {
        Self {
            request_id, keep_conn,
            // HashMap overallocates by 1/7th and rounds up to a power of 2,
            // so this gives us 64 buckets.
            params: HashMap::with_capacity(40),
            headers: HashMap::new(),
            cookie: None,
            url: CompactString::default(),
            method: CompactString::default(),
            protocol: (1, 0),
            content_type: None,
            boundary: None,
            content_length: None,
        }
    }

    /// Lossily converts raw bytes into a UTF-8 based parameter name.
    ///
    /// Valid CGI/1.1 variable names are ASCII-only, but we support invalid
    /// ones as much as possible by replacing non-UTF-8 codepoints.
    #[must_use]
    fn make_name(name: &[u8]) -> CompactString {
        let conv = CompactString::from_utf8_lossy(name);
        if tracing::event_enabled!(tracing::Level::DEBUG) && name != conv.as_bytes() {
            tracing::debug!(
                original = %name.escape_ascii(), converted = %conv.escape_default(),
                "lossy parameter name conversion",
            );
        }
        conv
    }

    pub(crate) fn insert_param(&mut self, name: &[u8], value: &[u8]) {
        let name = Self::make_name(name);
        if let Some(header) = name.strip_prefix("HTTP_") {
            let header: CompactString = header.chars()
                .map(|c| if c == '_' { '-' } else { c.to_ascii_lowercase() })
                .collect();
            let value = CompactString::from_utf8_lossy(value);
            if header == "cookie" {
                self.cookie = Some(value.clone());
            }
            self.headers.insert(header, value);
        }
        self.params.insert(name, SmallBytes::from_slice(value));
    }

    /// Derives the request line and body framing from the parameters.
    pub(crate) fn finish(&mut self) {
        self.url = self.param_str("REQUEST_URI").unwrap_or_default().into();
        self.method = self.param_str("REQUEST_METHOD").unwrap_or_default().into();
        if let Some(proto) = self.param_str("SERVER_PROTOCOL").and_then(parse_protocol) {
            self.protocol = proto;
        }

        if let Some(ctype) = self.param_str("CONTENT_TYPE").filter(|s| !s.is_empty()) {
            let (media, boundary) = parse_content_type(ctype);
            let boundary = boundary.map(CompactString::from);
            let media = CompactString::from(media);
            self.boundary = boundary;
            self.content_type = Some(media);
        }
        self.content_length = self.param_str("CONTENT_LENGTH")
            .and_then(|s| s.trim().parse().ok());
    }

    /// Returns the number of parameters of this request.
    #[inline]
    #[must_use]
    pub fn params_len(&self) -> usize {
        self.params.len()
    }

    /// Retrieves the raw value of a parameter, if there is one.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&[u8]> {
        self.params.get(name).map(AsRef::as_ref)
    }

    /// Attempts to retrieve the string value of a parameter.
    ///
    /// Returns [`None`] if there is no corresponding value *or if the value
    /// is not valid UTF-8*. Use `RequestHead::param` to decode the raw bytes
    /// manually.
    #[must_use]
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Returns an iterator over all parameters of this request.
    #[inline]
    #[must_use]
    pub fn params_iter(&self) -> impl ExactSizeIterator<Item = (&str, &[u8])>
            + FusedIterator + Clone + Debug + '_
    {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// Retrieves a request header by its lower-case name, such as
    /// `"content-type"`.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(CompactString::as_str)
    }

    /// Returns an iterator over all request headers.
    #[inline]
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the raw `Cookie` request header.
    #[inline]
    #[must_use]
    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    /// Returns the request URL, taken from `REQUEST_URI`.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the request method, taken from `REQUEST_METHOD`.
    #[inline]
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Converts the request method into an [`http::Method`].
    #[cfg(feature = "http")]
    #[must_use]
    pub fn http_method(&self) -> Option<http::Method> {
        http::Method::from_bytes(self.method.as_bytes()).ok()
    }

    /// Returns the major and minor HTTP version from `SERVER_PROTOCOL`,
    /// defaulting to `(1, 0)`.
    #[inline]
    #[must_use]
    pub fn protocol(&self) -> (u8, u8) {
        self.protocol
    }

    /// Returns the media type of the request body, without parameters.
    #[inline]
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Returns the `boundary` parameter of a multipart request body.
    #[inline]
    #[must_use]
    pub fn boundary(&self) -> Option<&str> {
        self.boundary.as_deref()
    }

    /// Returns the declared length of the request body.
    #[inline]
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }
}

fn parse_protocol(proto: &str) -> Option<(u8, u8)> {
    let (major, minor) = proto.strip_prefix("HTTP/")?.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn parse_content_type(ctype: &str) -> (&str, Option<&str>) {
    let mut parts = ctype.split(';');
    let media = parts.next().unwrap_or_default().trim();
    let boundary = parts.find_map(|p| {
        let (key, value) = p.split_once('=')?;
        key.trim().eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"'))
    });
    (media, boundary)
}


#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_env() {
        let mut head = RequestHead::new(NonZeroU16::MIN, true);
        for &(n, v) in test_support::PARAMS {
            head.insert_param(n, v);
        }
        head.finish();

        assert_eq!(head.params_len(), test_support::PARAMS.len());
        assert!(matches!(head.param("CONTENT_LENGTH"), Some(b"67828")));
        assert!(matches!(head.param("HTTP_X_NOT_UTF8"), Some(test_support::BYTES)));
        assert!(head.param("").is_none());
        assert!(head.param_str("HTTP_X_NOT_UTF8").is_none());
        assert_eq!(head.param_str("HTTP_X_FORWARDED_PROTO"), Some("https"));
        assert_eq!(head.param_str("HTTP_x_INVAL\u{FFFD}\u{FFFD}_head"), Some("az%baqw&W2bAbwA"));

        let mut it = head.params_iter();
        assert_eq!(it.len(), head.params_len());
        for (n, v) in &mut it {
            assert!(test_support::PARAMS.iter().any(
                |&(rn, rv)| CompactString::from_utf8_lossy(rn) == n && rv == v
            ));
        }
        assert!(it.next().is_none());
    }

    #[test]
    fn head_derived() {
        let mut head = RequestHead::new(NonZeroU16::MIN, false);
        for &(n, v) in test_support::PARAMS {
            head.insert_param(n, v);
        }
        head.finish();

        assert_eq!(head.method(), "HEAD");
        assert_eq!(head.url(), "/search?q=fcgi");
        assert_eq!(head.protocol(), (1, 1));
        assert_eq!(head.content_length(), Some(67828));
        assert_eq!(head.content_type(), Some("multipart/form-data"));
        assert_eq!(head.boundary(), Some("----7MA4YWxk"));
        assert_eq!(head.cookie(), Some("session=abc; theme=dark"));
        assert_eq!(head.header("cookie"), head.cookie());
        assert_eq!(head.header("x-forwarded-proto"), Some("https"));
        assert_eq!(head.header("authorization").map(|s| s.starts_with("Bearer ")), Some(true));
        assert_eq!(head.header("x-unknown-test"), Some("Z+5ED\\SHGMN76&T}+fc%DE40@.jG"));
        assert!(head.header("HTTP_DATE").is_none());
        assert!(head.headers().all(|(n, _)| !n.contains('_')));
    }

    #[test]
    fn head_defaults() {
        let mut head = RequestHead::new(NonZeroU16::MIN, false);
        head.insert_param(b"SERVER_PROTOCOL", b"INCLUDED");
        head.insert_param(b"CONTENT_LENGTH", b"-12");
        head.finish();

        assert_eq!(head.method(), "");
        assert_eq!(head.url(), "");
        assert_eq!(head.protocol(), (1, 0));
        assert!(head.content_length().is_none());
        assert!(head.content_type().is_none());
        assert!(head.boundary().is_none());
        assert!(head.cookie().is_none());
    }

    #[test]
    fn content_types() {
        assert_eq!(parse_content_type("text/plain"), ("text/plain", None));
        assert_eq!(
            parse_content_type("multipart/mixed; charset=utf-8; BOUNDARY=\"a b\""),
            ("multipart/mixed", Some("a b")),
        );
        assert_eq!(parse_protocol("HTTP/2.0"), Some((2, 0)));
        assert_eq!(parse_protocol("HTTP/x"), None);
    }

    #[test]
    fn buffer_reuse() {
        let mut buf = Buffer::new(16);
        let inp = buf.input_buffer();
        assert_eq!(inp.len(), 16);
        inp[..14].copy_from_slice(b"0123456789abcd");
        buf.fill(14);
        buf.consume(12);
        assert_eq!(buf.available(), b"cd");

        // Less than a quarter free, so the remainder moves to the front
        let inp = buf.input_buffer();
        assert_eq!(inp.len(), 14);
        inp[..3].copy_from_slice(b"efg");
        buf.fill(3);
        assert_eq!(buf.available(), b"cdefg");

        buf.consume(100);
        assert!(buf.available().is_empty());
        assert_eq!(buf.input_buffer().len(), 16);
    }
}
