use std::num::NonZeroU16;
use std::sync::Arc;

use super::{Buffer, Error, RequestHead};
use crate::macros::trace;
use crate::protocol::{self as fcgi, body, nv::NvReader};
use crate::Config;


/// Limits for the names and values of a GetValues query.
const VALUES_NAME_LEN: usize = 64;
const VALUES_VALUE_LEN: usize = 64;


/// An output report from `Parser::parse` that requires action from the caller.
#[derive(Debug)]
#[must_use = "events may carry request data"]
pub enum Event {
    /// All buffered input has been parsed. New input must be supplied into
    /// the slice returned by `Parser::input_buffer`.
    NeedInput,
    /// The Params stream of a new request is complete.
    Request(Box<RequestHead>),
    /// The given number of Stdin bytes were written into `dest`.
    Stdin(usize),
    /// The active request's Stdin stream reached its end.
    StdinEnd,
    /// The FastCGI client aborted the active request.
    Aborted,
    /// The next request's BeginRequest record was reached while the active
    /// request is still waiting for its response. Parsing continues after
    /// `Parser::finish`.
    Pipelined,
}


#[derive(Debug)]
struct HeadBuilder {
    reader: NvReader,
    head: RequestHead,
}

#[derive(Debug)]
enum Phase {
    Params(Box<HeadBuilder>),
    Ready,
    StdinDone,
    Aborted,
}

#[derive(Debug)]
struct Active {
    id: NonZeroU16,
    phase: Phase,
}

/// Determines how the payload of the current record is handled.
#[derive(Debug)]
enum State {
    Skip,
    Params,
    Stdin,
    Values { vars: fcgi::ProtocolVariables, reader: NvReader },
    Fatal(Error),
}


/// A parser for the request side of a FastCGI connection.
///
/// The caller must feed the record stream into the parser's internal buffer,
/// which is available via `Parser::input_buffer`. After reading `n` bytes
/// into this slice, `Parser::parse(n, dest)` processes the bytes until an
/// [`Event`] requires action from the caller.
///
/// Records which the FastCGI client expects an answer to produce output
/// bytes, which are accessible via `Parser::output_buffer` and must be
/// consumed via `Parser::consume_output` after sending them.
///
/// Only one request is active at a time. The parser keeps its input buffer
/// across requests, so pipelined requests on a kept connection are parsed
/// from leftover input once `Parser::finish` releases the active request.
#[derive(Debug)]
#[must_use = "Parser must be invoked to consume input"]
pub struct Parser {
    config: Arc<Config>,
    buffer: Buffer,
    output: Vec<u8>,
    output_start: usize,

    payload_rem: u16,
    padding_rem: u8,
    state: State,
    active: Option<Active>,
}

impl Parser {
    /// Creates a new [`Parser`] with the given configuration.
    pub fn new(config: Arc<Config>) -> Self {
        let buffer = Buffer::new(config.aligned_bufsize());
        Self {
            config, buffer, output: Vec::with_capacity(256), output_start: 0,
            payload_rem: 0, padding_rem: 0, state: State::Skip, active: None,
        }
    }

    /// Returns the slice of the parser's internal buffer into which new input
    /// must be written.
    ///
    /// The number of bytes actually written is later passed to
    /// `Parser::parse`.
    #[inline]
    #[must_use]
    pub fn input_buffer(&mut self) -> &mut [u8] {
        self.buffer.input_buffer()
    }

    /// Returns the output buffer, whose contents must be sent to the FastCGI
    /// client.
    #[inline]
    #[must_use]
    pub fn output_buffer(&self) -> &[u8] {
        &self.output[self.output_start..]
    }

    /// Removes the first `amt` bytes from `Parser::output_buffer` after the
    /// caller sent them to the FastCGI client.
    #[inline]
    pub fn consume_output(&mut self, amt: usize) {
        let output_len = self.output.len() - self.output_start;
        if amt >= output_len {
            self.output.clear();
            self.output_start = 0;
        } else {
            self.output_start += amt;
        }
    }

    /// Returns the ID of the active request, if any.
    #[inline]
    #[must_use]
    pub fn active_request(&self) -> Option<NonZeroU16> {
        self.active.as_ref().map(|a| a.id)
    }

    /// Tests whether the active request's Params stream is complete.
    #[must_use]
    pub fn has_request(&self) -> bool {
        self.active.as_ref().is_some_and(|a| !matches!(a.phase, Phase::Params(_)))
    }

    /// Tests whether the active request's Stdin stream reached its end.
    #[must_use]
    pub fn stdin_complete(&self) -> bool {
        self.active.as_ref().is_some_and(|a| matches!(a.phase, Phase::StdinDone))
    }

    /// Tests whether the active request was aborted by the FastCGI client.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.active.as_ref().is_some_and(|a| matches!(a.phase, Phase::Aborted))
    }

    /// Tests whether the parser is between requests without any partial
    /// input, such that the connection may be closed cleanly.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.active.is_none()
            && (self.payload_rem | u16::from(self.padding_rem)) == 0
            && self.buffer.available().is_empty()
    }

    /// Releases the active request, so parsing continues with the next one.
    ///
    /// Remaining records of the released request are skipped.
    pub fn finish(&mut self) {
        trace!(request_id = ?self.active_request(), "request finished");
        self.active = None;
        if matches!(self.state, State::Stdin | State::Params) {
            self.state = State::Skip;
        }
    }

    /// Parses as much of the buffered record stream as possible.
    ///
    /// `new_input` specifies the number of bytes written into the slice from
    /// `Parser::input_buffer` since the last call to `Parser::parse`.
    ///
    /// If `dest` is [`Some(buf)`], data from the active request's Stdin
    /// stream is copied into `buf` and reported as [`Event::Stdin`].
    /// Otherwise, Stdin data is discarded.
    ///
    /// # Errors
    /// Returns an [`Error`] if parsing failed irrecoverably. All future calls
    /// return the same error.
    ///
    /// # Panics
    /// `new_input` must not exceed the length of the slice returned by
    /// `Parser::input_buffer`, otherwise an assertion panics.
    pub fn parse(&mut self, new_input: usize, mut dest: Option<&mut [u8]>) -> Result<Event, Error> {
        self.buffer.fill(new_input);
        if let State::Fatal(e) = &self.state {
            return Err(e.clone());
        }

        loop {
            if self.payload_rem > 0 {
                if let Some(event) = self.parse_payload(&mut dest) {
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

            match self.parse_head() {
                Ok(Some(event)) => return Ok(event),
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "fatal FastCGI protocol error");
                    self.state = State::Fatal(e.clone());
                    return Err(e);
                },
            }
        }
    }

    fn parse_payload(&mut self, dest: &mut Option<&mut [u8]>) -> Option<Event> {
        let data = self.buffer.available();
        let len = data.len().min(self.payload_rem.into());
        let data = &data[..len];

        let (consumed, event) = match &mut self.state {
            State::Stdin => match dest {
                Some(buf) => {
                    let amt = len.min(buf.len());
                    buf[..amt].copy_from_slice(&data[..amt]);
                    (amt, (amt > 0).then_some(Event::Stdin(amt)))
                },
                None => (len, None),
            },

            State::Params => {
                if let Some(Active { phase: Phase::Params(builder), .. }) = &mut self.active {
                    let mut cur = data;
                    while let Some((name, value)) = builder.reader.feed(&mut cur) {
                        builder.head.insert_param(&name, &value);
                    }
                }
                (len, None)
            },

            State::Values { vars, reader } => {
                let mut cur = data;
                while let Some((name, _)) = reader.feed(&mut cur) {
                    if let Ok(var) = fcgi::ProtocolVariables::parse_name(&name) {
                        *vars |= var;
                    }
                }
                if len == usize::from(self.payload_rem) {
                    if !reader.is_idle() {
                        tracing::warn!("GetValues body ends with incomplete name-value pair");
                    }
                    vars.write_response(&mut self.output, self.config.max_conns.get());
                }
                (len, None)
            },

            State::Skip | State::Fatal(_) => (len, None),
        };

        self.buffer.consume(consumed);
        // consumed <= payload_rem (u16)
        self.payload_rem -= consumed as u16;
        if self.payload_rem == 0 && !matches!(self.state, State::Fatal(_)) {
            self.state = State::Skip;
        }
        event
    }

    /// Consumes a record header and prepares to handle its payload.
    fn start_record(&mut self, head: fcgi::RecordHeader, state: State) {
        self.buffer.consume(fcgi::RecordHeader::LEN);
        self.payload_rem = head.content_length;
        self.padding_rem = head.padding_length;
        self.state = state;
    }

    fn end_request(&mut self, request_id: u16, status: fcgi::ProtocolStatus) {
        self.output.extend(body::EndRequest::reject(status).to_record(request_id));
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
                let request_id = u16::from_be_bytes([raw[2], raw[3]]);
                let payload = u16::from_be_bytes([raw[4], raw[5]]);
                tracing::info!(request_id, rtype, payload, "unknown record type ignored");

                // Report unknown record type to remote
                self.output.extend(body::UnknownType { rtype }.to_record());
                self.buffer.consume(fcgi::RecordHeader::LEN);
                self.payload_rem = payload;
                self.padding_rem = raw[6];
                self.state = State::Skip;
                return Ok(None);
            },
            Err(e) => return Err(e.into()),
        };
        trace!(header = ?head, "record received");

        let active_id = self.active.as_ref().map(|a| a.id.get());
        let is_active = active_id == Some(head.request_id);
        match head.rtype {
            fcgi::RecordType::BeginRequest => return self.begin_request(head),

            fcgi::RecordType::AbortRequest if !head.is_management() => {
                self.start_record(head, State::Skip);
                self.end_request(head.request_id, fcgi::ProtocolStatus::RequestComplete);
                if !is_active {
                    tracing::debug!(request_id = head.request_id, "abort for inactive request acknowledged");
                } else if self.active.as_ref().is_some_and(|a| matches!(a.phase, Phase::Params(_))) {
                    tracing::debug!(request_id = head.request_id, "request aborted mid-Params");
                    self.active = None;
                } else if let Some(active) = self.active.as_mut()
                    .filter(|a| !matches!(a.phase, Phase::Aborted))
                {
                    tracing::debug!(request_id = head.request_id, "request aborted");
                    active.phase = Phase::Aborted;
                    return Ok(Some(Event::Aborted));
                }
            },

            fcgi::RecordType::Params if is_active => {
                let Some(active) = &mut self.active else { return Ok(None) };
                if !matches!(active.phase, Phase::Params(_)) {
                    self.start_record(head, State::Skip);
                } else if head.content_length > 0 {
                    self.start_record(head, State::Params);
                } else {
                    // Params stream is finished, now return the parsed request
                    let built = replace_with::replace_with_and_return(
                        &mut active.phase, || Phase::Aborted,
                        |phase| match phase {
                            Phase::Params(b) => (Some(b), Phase::Ready),
                            other => (None, other),
                        },
                    );
                    self.start_record(head, State::Skip);
                    if let Some(builder) = built {
                        let HeadBuilder { reader, mut head } = *builder;
                        if !reader.is_idle() {
                            tracing::warn!("Params stream ends with incomplete name-value pair");
                        }
                        head.finish();
                        return Ok(Some(Event::Request(Box::new(head))));
                    }
                }
            },

            fcgi::RecordType::Stdin if is_active => {
                let ready = self.active.as_ref().is_some_and(|a| matches!(a.phase, Phase::Ready));
                if !ready {
                    self.start_record(head, State::Skip);
                } else if head.content_length > 0 {
                    self.start_record(head, State::Stdin);
                } else {
                    self.start_record(head, State::Skip);
                    if let Some(active) = &mut self.active {
                        active.phase = Phase::StdinDone;
                    }
                    return Ok(Some(Event::StdinEnd));
                }
            },

            fcgi::RecordType::GetValues if head.is_management() => {
                let vars = fcgi::ProtocolVariables::empty();
                if head.content_length == 0 {
                    vars.write_response(&mut self.output, self.config.max_conns.get());
                    self.start_record(head, State::Skip);
                } else {
                    let reader = NvReader::new(VALUES_NAME_LEN, VALUES_VALUE_LEN);
                    self.start_record(head, State::Values { vars, reader });
                }
            },

            _ => {
                // Skip unexpected record types
                trace!(request_id = head.request_id, rtype = ?head.rtype, "record skipped");
                self.start_record(head, State::Skip);
            },
        }
        Ok(None)
    }

    fn begin_request(&mut self, head: fcgi::RecordHeader) -> Result<Option<Event>, Error> {
        if usize::from(head.content_length) != body::BeginRequest::LEN {
            return Err(Error::InvalidRequestLen(head.content_length));
        }
        let Some(req_id) = NonZeroU16::new(head.request_id) else {
            return Err(Error::NullRequest);
        };

        if let Some(active) = &self.active {
            if active.id == req_id {
                // Duplicate BeginRequest is ignored silently
                self.start_record(head, State::Skip);
                return Ok(None);
            }
            if matches!(active.phase, Phase::StdinDone | Phase::Aborted) {
                return Ok(Some(Event::Pipelined));
            }
            tracing::info!(
                request_id = head.request_id, active = active.id.get(),
                "multiplexed request rejected",
            );
            // Report lack of multiplexing to remote
            self.end_request(head.request_id, fcgi::ProtocolStatus::CantMpxConn);
            self.start_record(head, State::Skip);
            return Ok(None);
        }

        let mut raw = [0; body::BeginRequest::LEN];
        let body_range = fcgi::RecordHeader::LEN..(fcgi::RecordHeader::LEN + body::BeginRequest::LEN);
        match self.buffer.available().get(body_range) {
            Some(b) => raw.copy_from_slice(b),
            None => return Ok(Some(Event::NeedInput)),
        }
        self.start_record(head, State::Skip);
        self.buffer.consume(body::BeginRequest::LEN);
        self.payload_rem = 0;

        let role = match body::BeginRequest::from_bytes(raw) {
            Ok(b) if b.role == fcgi::Role::Responder => {
                let keep_conn = b.flags.contains(fcgi::RequestFlags::KeepConn);
                tracing::debug!(request_id = head.request_id, keep_conn, "new request received");
                let builder = HeadBuilder {
                    reader: NvReader::new(self.config.max_name_len, self.config.max_value_len),
                    head: RequestHead::new(req_id, keep_conn),
                };
                self.active = Some(Active { id: req_id, phase: Phase::Params(Box::new(builder)) });
                return Ok(None);
            },
            Ok(b) => u16::from(b.role),
            Err(fcgi::Error::UnknownRole(role)) => role,
            Err(e) => return Err(e.into()),
        };

        tracing::info!(request_id = head.request_id, role, "unsupported role rejected");
        // Report unknown role type to remote
        self.end_request(head.request_id, fcgi::ProtocolStatus::UnknownRole);
        Ok(None)
    }
}
