use std::collections::HashMap;
use std::mem;

use compact_str::CompactString;

use super::headers::ResponseHead;
use super::{Buffer, Error};
use crate::macros::trace;
use crate::protocol::{self as fcgi, body, nv::NvReader};


/// Limits for the names and values of a GetValuesResult record.
const VALUES_NAME_LEN: usize = 64;
const VALUES_VALUE_LEN: usize = 64;


/// An output report from `Parser::parse` that requires action from the caller.
#[derive(Debug)]
#[must_use = "events may carry response data"]
pub enum Event {
    /// All buffered input has been parsed. New input must be supplied into
    /// the slice returned by `Parser::input_buffer`.
    NeedInput,
    /// The header block at the start of the Stdout stream is complete.
    Head(Box<ResponseHead>),
    /// The given number of body bytes were written into `dest`. This is 0
    /// only if `dest` is empty.
    Stdout(usize),
    /// The application wrote to its Stderr stream.
    Stderr(Vec<u8>),
    /// The request is complete.
    End(body::EndRequest),
    /// The answer to a GetValues query.
    Values(HashMap<CompactString, CompactString>),
}


#[derive(Debug)]
enum Phase {
    /// Collecting the header block.
    Head(Vec<u8>),
    Body,
    Done,
}

/// Determines how the payload of the current record is handled.
#[derive(Debug)]
enum State {
    Skip,
    Stdout,
    Stderr,
    Values(NvReader, HashMap<CompactString, CompactString>),
    Fatal(Error),
}


/// A parser for the response side of a FastCGI connection.
///
/// Works like the request-side [`Parser`](super::server::Parser): input is
/// written into `Parser::input_buffer` and processed by `Parser::parse`.
/// The parser tracks one request at a time, set with `Parser::reset`.
/// Records of other requests are skipped.
///
/// The header block is split off the Stdout stream at the first empty line,
/// which may end in CRLF or a bare LF. Body bytes following it in the same
/// record are reported after [`Event::Head`].
#[derive(Debug)]
#[must_use = "Parser must be invoked to consume input"]
pub struct Parser {
    buffer: Buffer,
    max_head_len: usize,
    request_id: u16,

    payload_rem: u16,
    padding_rem: u8,
    state: State,
    phase: Phase,
    /// Body bytes that arrived together with the header block.
    pending: Vec<u8>,
    end: Option<body::EndRequest>,
}

impl Parser {
    /// Creates a new [`Parser`] with an input buffer of `buffer_size` bytes,
    /// rejecting header blocks longer than `max_head_len`.
    pub fn new(buffer_size: usize, max_head_len: usize) -> Self {
        Self {
            buffer: Buffer::new(crate::config::aligned_bufsize(buffer_size)),
            max_head_len, request_id: fcgi::FCGI_NULL_REQUEST_ID,
            payload_rem: 0, padding_rem: 0, state: State::Skip,
            phase: Phase::Done, pending: Vec::new(), end: None,
        }
    }

    /// Starts tracking the response to `request_id`.
    pub fn reset(&mut self, request_id: u16) {
        self.request_id = request_id;
        self.phase = Phase::Head(Vec::new());
        self.pending.clear();
        self.end = None;
    }

    /// Returns the slice of the parser's internal buffer into which new input
    /// must be written.
    #[inline]
    #[must_use]
    pub fn input_buffer(&mut self) -> &mut [u8] {
        self.buffer.input_buffer()
    }

    /// Returns the ID of the tracked request.
    #[inline]
    #[must_use]
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    /// Tests whether the header block of the tracked response was parsed.
    #[must_use]
    pub fn head_complete(&self) -> bool {
        !matches!(self.phase, Phase::Head(_))
    }

    /// Tests whether the tracked request ended and all of its events were
    /// reported.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done) && self.pending.is_empty() && self.end.is_none()
    }

    /// Tests whether the parser sits between records without buffered input.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        (self.payload_rem | u16::from(self.padding_rem)) == 0
            && self.buffer.available().is_empty()
    }

    /// Parses as much of the buffered record stream as possible.
    ///
    /// `new_input` specifies the number of bytes written into the slice from
    /// `Parser::input_buffer` since the last call to `Parser::parse`. Body
    /// bytes are copied into `dest`.
    ///
    /// # Errors
    /// Returns an [`Error`] if parsing failed irrecoverably. All future calls
    /// return the same error.
    ///
    /// # Panics
    /// `new_input` must not exceed the length of the slice returned by
    /// `Parser::input_buffer`, otherwise an assertion panics.
    pub fn parse(&mut self, new_input: usize, dest: &mut [u8]) -> Result<Event, Error> {
        self.buffer.fill(new_input);
        if let State::Fatal(e) = &self.state {
            return Err(e.clone());
        }

        self.parse_records(dest).map_err(|e| {
            tracing::debug!(error = %e, request_id = self.request_id, "fatal FastCGI protocol error");
            self.state = State::Fatal(e.clone());
            e
        })
    }

    fn parse_records(&mut self, dest: &mut [u8]) -> Result<Event, Error> {
        loop {
            if !self.pending.is_empty() {
                let amt = self.pending.len().min(dest.len());
                dest[..amt].copy_from_slice(&self.pending[..amt]);
                self.pending.drain(..amt);
                return Ok(Event::Stdout(amt));
            }
            if let Some(end) = self.end.take() {
                return Ok(Event::End(end));
            }

            if self.payload_rem > 0 {
                if let Some(event) = self.parse_payload(dest)? {
                    return Ok(event);
                }
                if self.payload_rem > 0 {
                    return Ok(Event::NeedInput);
                }
            }

            if self.padding_rem > 0 {
                let amt = self.buffer.available().len().min(self.padding_rem.into());
                self.buffer.consume(amt);
                // amt <= padding_rem (u8)
                self.padding_rem -= amt as u8;
                if self.padding_rem > 0 {
                    return Ok(Event::NeedInput);
                }
            }

            if let Some(event) = self.parse_head()? {
                return Ok(event);
            }
        }
    }

    fn parse_payload(&mut self, dest: &mut [u8]) -> Result<Option<Event>, Error> {
        let data = self.buffer.available();
        let len = data.len().min(self.payload_rem.into());
        let data = &data[..len];

        let (consumed, event) = match (&mut self.state, &mut self.phase) {
            (State::Stdout, Phase::Head(block)) => {
                // The separator may straddle the previous chunk
                let from = block.len().saturating_sub(3);
                block.extend_from_slice(data);
                match find_separator(&block[from..]) {
                    Some((at, _)) if from + at > self.max_head_len => {
                        return Err(Error::HeadTooLarge(self.max_head_len));
                    },
                    Some((at, sep)) => {
                        let at = from + at;
                        self.pending = block.split_off(at + sep);
                        block.truncate(at);
                        (len, Some(Event::Head(Box::new(ResponseHead::parse(block)))))
                    },
                    None if block.len() > self.max_head_len => {
                        return Err(Error::HeadTooLarge(self.max_head_len));
                    },
                    None => (len, None),
                }
            },

            (State::Stdout, Phase::Body) => {
                let amt = len.min(dest.len());
                dest[..amt].copy_from_slice(&data[..amt]);
                (amt, (len > 0).then_some(Event::Stdout(amt)))
            },

            (State::Stderr, _) => (len, (len > 0).then(|| Event::Stderr(data.to_vec()))),

            (State::Values(reader, values), _) => {
                let mut cur = data;
                while let Some((name, value)) = reader.feed(&mut cur) {
                    values.insert(
                        CompactString::from_utf8_lossy(&name),
                        CompactString::from_utf8_lossy(&value),
                    );
                }
                let event = (len == usize::from(self.payload_rem))
                    .then(|| Event::Values(mem::take(values)));
                (len, event)
            },

            (State::Stdout, Phase::Done) | (State::Skip | State::Fatal(_), _) => (len, None),
        };

        if matches!(event, Some(Event::Head(_))) {
            trace!(request_id = self.request_id, "response head complete");
            self.phase = Phase::Body;
        }
        self.buffer.consume(consumed);
        // consumed <= payload_rem (u16)
        self.payload_rem -= consumed as u16;
        if self.payload_rem == 0 {
            self.state = State::Skip;
        }
        Ok(event)
    }

    /// Consumes a record header and prepares to handle its payload.
    fn start_record(&mut self, head: fcgi::RecordHeader, state: State) {
        self.buffer.consume(fcgi::RecordHeader::LEN);
        self.payload_rem = head.content_length;
        self.padding_rem = head.padding_length;
        self.state = state;
    }

    fn parse_head(&mut self) -> Result<Option<Event>, Error> {
        let mut raw = [0; fcgi::RecordHeader::LEN];
        match self.buffer.available().get(..fcgi::RecordHeader::LEN) {
            Some(h) => raw.copy_from_slice(h),
            None => return Ok(Some(Event::NeedInput)),
        }

        let head = match fcgi::RecordHeader::from_bytes(raw) {
            Ok(h) => h,
            Err(fcgi::Error::UnknownRecordType(rtype)) => {
                tracing::info!(rtype, "unknown record type ignored");
                self.buffer.consume(fcgi::RecordHeader::LEN);
                self.payload_rem = u16::from_be_bytes([raw[4], raw[5]]);
                self.padding_rem = raw[6];
                self.state = State::Skip;
                return Ok(None);
            },
            Err(e) => return Err(e.into()),
        };
        trace!(header = ?head, "record received");

        if head.is_management() {
            match head.rtype {
                fcgi::RecordType::GetValuesResult if head.content_length == 0 => {
                    self.start_record(head, State::Skip);
                    return Ok(Some(Event::Values(HashMap::new())));
                },
                fcgi::RecordType::GetValuesResult => {
                    let reader = NvReader::new(VALUES_NAME_LEN, VALUES_VALUE_LEN);
                    self.start_record(head, State::Values(reader, HashMap::new()));
                },
                _ => {
                    tracing::info!(rtype = ?head.rtype, "management record ignored");
                    self.start_record(head, State::Skip);
                },
            }
            return Ok(None);
        }

        if head.request_id != self.request_id || matches!(self.phase, Phase::Done) {
            trace!(request_id = head.request_id, rtype = ?head.rtype, "record skipped");
            self.start_record(head, State::Skip);
            return Ok(None);
        }

        match head.rtype {
            fcgi::RecordType::Stdout => self.start_record(head, State::Stdout),
            fcgi::RecordType::Stderr => self.start_record(head, State::Stderr),
            fcgi::RecordType::EndRequest => return self.end_request(head),
            _ => {
                trace!(request_id = head.request_id, rtype = ?head.rtype, "record skipped");
                self.start_record(head, State::Skip);
            },
        }
        Ok(None)
    }

    fn end_request(&mut self, head: fcgi::RecordHeader) -> Result<Option<Event>, Error> {
        if usize::from(head.content_length) != body::EndRequest::LEN {
            return Err(Error::InvalidEndLen(head.content_length));
        }

        let mut raw = [0; body::EndRequest::LEN];
        let body_range = fcgi::RecordHeader::LEN..(fcgi::RecordHeader::LEN + body::EndRequest::LEN);
        match self.buffer.available().get(body_range) {
            Some(b) => raw.copy_from_slice(b),
            None => return Ok(Some(Event::NeedInput)),
        }
        self.start_record(head, State::Skip);
        self.buffer.consume(body::EndRequest::LEN);
        self.payload_rem = 0;

        let end = body::EndRequest::from_bytes(raw)?;
        tracing::debug!(
            request_id = head.request_id, app_status = end.app_status,
            protocol_status = ?end.protocol_status, "request ended",
        );
        if let Phase::Head(block) = mem::replace(&mut self.phase, Phase::Done) {
            if end.protocol_status == fcgi::ProtocolStatus::RequestComplete {
                // Stdout ended without an empty line, so all of it is headers
                self.end = Some(end);
                return Ok(Some(Event::Head(Box::new(ResponseHead::parse(&block)))));
            }
        }
        Ok(Some(Event::End(end)))
    }
}

/// Finds the first empty line, returning its offset and the separator length.
/// The separator includes the line terminator preceding the empty line.
fn find_separator(data: &[u8]) -> Option<(usize, usize)> {
    (0..data.len()).find_map(|i| {
        let rest = &data[i..];
        let len = if rest.starts_with(b"\n\n") {
            2
        } else if rest.starts_with(b"\n\r\n") {
            3
        } else {
            return None;
        };
        Some(if i > 0 && data[i - 1] == b'\r' { (i - 1, len + 1) } else { (i, len) })
    })
}
