use std::fmt;

use compact_str::CompactString;


/// The `SameSite` attribute of a [`Cookie`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumString, strum::Display)]
#[strum(ascii_case_insensitive)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}


/// A cookie set by a response, as carried in a `Set-Cookie` header.
///
/// Attribute values are kept as sent. In particular, `expires` is not parsed
/// into a timestamp.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: CompactString,
    pub value: CompactString,
    pub expires: Option<CompactString>,
    pub max_age: Option<i64>,
    pub domain: Option<CompactString>,
    pub path: Option<CompactString>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

impl Cookie {
    /// Creates a new [`Cookie`] without any attributes.
    #[must_use]
    pub fn new(name: impl Into<CompactString>, value: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(), value: value.into(),
            expires: None, max_age: None, domain: None, path: None,
            secure: false, http_only: false, same_site: None,
        }
    }

    /// Parses the value of a `Set-Cookie` header.
    ///
    /// Unknown or malformed attributes are ignored. Returns [`None`] if the
    /// cookie has no name.
    #[must_use]
    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let mut cookie = Self::new(name, value.trim().trim_matches('"'));

        for attr in parts {
            let (key, value) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "expires" => cookie.expires = Some(value.into()),
                "max-age" => cookie.max_age = value.parse().ok(),
                "domain" => cookie.domain = Some(value.trim_start_matches('.').into()),
                "path" => cookie.path = Some(value.into()),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                "samesite" => cookie.same_site = value.parse().ok(),
                _ => tracing::debug!(attribute = key, "unknown cookie attribute ignored"),
            }
        }
        Some(cookie)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(expires) = &self.expires {
            write!(f, "; Expires={expires}")?;
        }
        if let Some(max_age) = self.max_age {
            write!(f, "; Max-Age={max_age}")?;
        }
        if let Some(domain) = &self.domain {
            write!(f, "; Domain={domain}")?;
        }
        if let Some(path) = &self.path {
            write!(f, "; Path={path}")?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        if let Some(same_site) = self.same_site {
            write!(f, "; SameSite={same_site}")?;
        }
        Ok(())
    }
}


/// The header block at the start of a response's Stdout stream.
///
/// On the wire, the block consists of a `status` pseudo-header followed by
/// the response headers and one `set-cookie` line per cookie, terminated by
/// an empty line. Header names are always lower-case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// The HTTP status code, 200 unless specified otherwise.
    pub status: u16,
    /// The reason phrase following the status code.
    pub status_text: Option<CompactString>,
    headers: Vec<(CompactString, CompactString)>,
    /// Cookies from `set-cookie` lines, in order.
    pub cookies: Vec<Cookie>,
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self { status: 200, status_text: None, headers: Vec::new(), cookies: Vec::new() }
    }
}

impl ResponseHead {
    /// Parses a header block, without its terminating empty line.
    ///
    /// Lines may end in CRLF or a bare LF. Lines without a colon are ignored.
    #[must_use]
    pub fn parse(block: &[u8]) -> Self {
        let mut head = Self::default();
        for line in block.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            let line = String::from_utf8_lossy(line);
            let Some((name, value)) = line.split_once(':') else {
                tracing::debug!(line = %line.escape_default(), "malformed response header ignored");
                continue;
            };
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim_start_matches([' ', '\t']).trim_end();

            match name.as_str() {
                "status" => head.parse_status(value),
                "set-cookie" => match Cookie::parse(value) {
                    Some(cookie) => head.cookies.push(cookie),
                    None => tracing::debug!(value, "malformed cookie ignored"),
                },
                _ => head.headers.push((name.into(), value.into())),
            }
        }
        head
    }

    fn parse_status(&mut self, value: &str) {
        let (code, text) = match value.split_once(' ') {
            Some((c, t)) => (c, Some(t.trim()).filter(|t| !t.is_empty())),
            None => (value, None),
        };
        match code.parse() {
            Ok(code) => {
                self.status = code;
                self.status_text = text.map(CompactString::from);
            },
            Err(_) => tracing::debug!(value, "invalid status header ignored"),
        }
    }

    /// Converts the status code into an [`http::StatusCode`]. Returns [`None`]
    /// for codes outside of 100..=999.
    #[cfg(feature = "http")]
    #[must_use]
    pub fn status_code(&self) -> Option<http::StatusCode> {
        http::StatusCode::from_u16(self.status).ok()
    }

    /// Builds a head from the status and headers of an [`http::response::Parts`].
    /// Headers that are not valid UTF-8 are skipped.
    #[cfg(feature = "http")]
    #[must_use]
    pub fn from_http(parts: &http::response::Parts) -> Self {
        let mut head = Self {
            status: parts.status.as_u16(),
            status_text: parts.status.canonical_reason().map(CompactString::from),
            ..Self::default()
        };
        for (name, value) in &parts.headers {
            let Ok(value) = value.to_str() else { continue };
            if *name == http::header::SET_COOKIE {
                if let Some(cookie) = Cookie::parse(value) {
                    head.cookies.push(cookie);
                }
            } else {
                head.add_header(name.as_str(), value);
            }
        }
        head
    }

    /// Retrieves the first value of a header by its lower-case name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns an iterator over all headers in order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Replaces all values of a header with `value`.
    pub fn set_header(&mut self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        self.headers.retain(|(n, _)| *n != name);
        self.headers.push((name.into(), value.into()));
    }

    /// Adds another value for a header.
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_ascii_lowercase().into(), value.into()));
    }

    /// Appends the wire format of this header block to `out`, including the
    /// terminating empty line.
    pub fn write_block(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.to_string().as_bytes());
    }
}

impl fmt::Display for ResponseHead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "status: {}", self.status)?;
        if let Some(text) = &self.status_text {
            write!(f, " {text}")?;
        }
        f.write_str("\r\n")?;
        for (name, value) in &self.headers {
            write!(f, "{name}: {value}\r\n")?;
        }
        for cookie in &self.cookies {
            write!(f, "set-cookie: {cookie}\r\n")?;
        }
        f.write_str("\r\n")
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_block() {
        const BLOCK: &[u8] = b"Status: 404 Not Found\r\nContent-Type:\ttext/html\r\n\
            X-Multi: a\nx-multi: b\r\nSet-Cookie: id=a3fWa; Max-Age=2592000; Secure\r\n\
            no colon here\r\nset-cookie: =nameless\r\n";
        let head = ResponseHead::parse(BLOCK);
        assert_eq!(head.status, 404);
        assert_eq!(head.status_text.as_deref(), Some("Not Found"));
        assert_eq!(head.header("content-type"), Some("text/html"));
        assert_eq!(head.header("x-multi"), Some("a"));
        assert_eq!(head.headers().filter(|(n, _)| *n == "x-multi").count(), 2);
        assert!(head.header("set-cookie").is_none());
        assert_eq!(head.headers().count(), 3);

        assert_eq!(head.cookies.len(), 1);
        let cookie = &head.cookies[0];
        assert_eq!((cookie.name.as_str(), cookie.value.as_str()), ("id", "a3fWa"));
        assert_eq!(cookie.max_age, Some(2_592_000));
        assert!(cookie.secure);
        assert!(!cookie.http_only);
    }

    #[test]
    fn parse_defaults() {
        let head = ResponseHead::parse(b"x-hello: all");
        assert_eq!(head.status, 200);
        assert!(head.status_text.is_none());
        assert_eq!(head.header("x-hello"), Some("all"));

        let head = ResponseHead::parse(b"status: abc\r\nstatus: 302");
        assert_eq!(head.status, 302);
        assert!(head.status_text.is_none());
    }

    #[test]
    fn write_block() {
        let mut head = ResponseHead::default();
        head.set_header("X-Hello", "all");
        let mut out = Vec::new();
        head.write_block(&mut out);
        assert_eq!(out, b"status: 200\r\nx-hello: all\r\n\r\n");

        head.status = 503;
        head.status_text = Some("Service Unavailable".into());
        head.add_header("vary", "a");
        head.set_header("x-hello", "again");
        let mut cookie = Cookie::new("theme", "dark");
        cookie.path = Some("/".into());
        cookie.same_site = Some(SameSite::Lax);
        head.cookies.push(cookie);

        out.clear();
        head.write_block(&mut out);
        assert_eq!(
            out,
            b"status: 503 Service Unavailable\r\nvary: a\r\nx-hello: again\r\n\
            set-cookie: theme=dark; Path=/; SameSite=Lax\r\n\r\n",
        );
        assert_eq!(ResponseHead::parse(&out[..out.len() - 2]), head);
    }

    #[test]
    fn cookie_attributes() {
        let cookie = Cookie::parse(
            "sid=\"x1\"; expires=Wed, 21 Oct 2015 07:28:00 GMT; DOMAIN=.example.org; \
            path=/app; HttpOnly; samesite=STRICT; Priority=High; Max-Age=soon",
        ).unwrap();
        assert_eq!(cookie.value, "x1");
        assert_eq!(cookie.expires.as_deref(), Some("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(cookie.domain.as_deref(), Some("example.org"));
        assert_eq!(cookie.path.as_deref(), Some("/app"));
        assert!(cookie.http_only);
        assert_eq!(cookie.same_site, Some(SameSite::Strict));
        assert!(cookie.max_age.is_none());

        assert_eq!(
            cookie.to_string(),
            "sid=x1; Expires=Wed, 21 Oct 2015 07:28:00 GMT; Domain=example.org; \
            Path=/app; HttpOnly; SameSite=Strict",
        );
        assert!(Cookie::parse("novalue").is_none());
        assert_eq!(Cookie::parse("empty=").map(|c| c.value), Some("".into()));
    }

    #[cfg(feature = "http")]
    #[test]
    fn http_parts() {
        let (parts, ()) = http::Response::builder()
            .status(http::StatusCode::NOT_FOUND)
            .header("X-Trace", "abc")
            .header(http::header::SET_COOKIE, "a=1; Path=/")
            .body(())
            .unwrap()
            .into_parts();
        let head = ResponseHead::from_http(&parts);
        assert_eq!(head.status, 404);
        assert_eq!(head.status_text.as_deref(), Some("Not Found"));
        assert_eq!(head.status_code(), Some(http::StatusCode::NOT_FOUND));
        assert_eq!(head.header("x-trace"), Some("abc"));
        assert_eq!(head.cookies[0].path.as_deref(), Some("/"));
    }
}
