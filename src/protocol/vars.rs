use smallvec::SmallVec;

use super::Error as ProtocolError;
use super::{RecordHeader, RecordType, FCGI_NULL_REQUEST_ID};


bitflags::bitflags! {
    /// A set of queryable FastCGI protocol variable names.
    ///
    /// The FastCGI client (HTTP server) can send a query for any combination
    /// of these names to the FastCGI server in a [`GetValues`][GetValues]
    /// record. The server responds with the names and values in a
    /// [`GetValuesResult`][GetValuesResult] record.
    ///
    /// [GetValues]: super::RecordType::GetValues
    /// [GetValuesResult]: super::RecordType::GetValuesResult
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProtocolVariables: u8 {
        /// The maximum number of concurrent connections accepted by the application.
        const FCGI_MAX_CONNS = 0x01;
        /// The maximum number of concurrent requests accepted by the application.
        const FCGI_MAX_REQS = 0x02;
        /// Whether the application accepts multiplexed requests ("1") or not ("0").
        const FCGI_MPXS_CONNS = 0x04;
    }
}

impl ProtocolVariables {
    /// Parses the input bytes into a well-known FastCGI
    /// [`ProtocolVariables`] item.
    ///
    /// # Errors
    /// Returns an error if the variable name is unknown, which may also
    /// stem from an improper encoding.
    pub fn parse_name(name: &[u8]) -> Result<Self, ProtocolError> {
        // All well-known variable names are ASCII-only
        match std::str::from_utf8(name) {
            Ok(s) => Self::from_name(s).ok_or(ProtocolError::UnknownVariable),
            Err(_) => Err(ProtocolError::UnknownVariable),
        }
    }

    /// Appends a complete [`GetValuesResult`](RecordType::GetValuesResult)
    /// record answering every variable in this set to `out`.
    ///
    /// Both `FCGI_MAX_CONNS` and `FCGI_MAX_REQS` report `max_conns`, since
    /// each connection carries one request at a time. `FCGI_MPXS_CONNS` is
    /// always `"0"`. Returns the number of bytes appended.
    pub fn write_response(self, out: &mut Vec<u8>, max_conns: usize) -> usize {
        let conns = max_conns.to_string();
        let mut content = SmallVec::<[u8; 64]>::new();
        for (name, var) in self.iter_names() {
            let value = if var == Self::FCGI_MPXS_CONNS { "0" } else { conns.as_str() };
            // Short names and values always use the 1-byte length form
            #[allow(clippy::cast_possible_truncation)]
            content.extend_from_slice(&[name.len() as u8, value.len() as u8]);
            content.extend_from_slice(name.as_bytes());
            content.extend_from_slice(value.as_bytes());
        }

        let mut head = RecordHeader::new(RecordType::GetValuesResult, FCGI_NULL_REQUEST_ID);
        #[allow(clippy::cast_possible_truncation)]
        head.set_lengths(content.len() as u16);
        let start = out.len();
        out.extend_from_slice(&head.to_bytes());
        out.extend_from_slice(&content);
        out.extend_from_slice(head.padding_bytes());
        out.len() - start
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() -> Result<(), ProtocolError> {
        for (name, f) in ProtocolVariables::all().iter_names() {
            assert_eq!(ProtocolVariables::parse_name(name.as_bytes())?, f);
        }
        Ok(())
    }

    #[test]
    fn parse_unknown() {
        const UNK_VAR: &str = "Atä w_3tFA-Es^Ü2";
        assert!(matches!(
            ProtocolVariables::parse_name(UNK_VAR.as_bytes()),
            Err(ProtocolError::UnknownVariable),
        ));
        assert!(matches!(
            ProtocolVariables::parse_name(b"ASg w-f#32\xFE \xFF+_a+"),
            Err(ProtocolError::UnknownVariable),
        ));
    }

    #[test]
    fn response_all() {
        const EXPECTED: &[u8] = b"\x01\x0a\0\0\x00\x33\x05\0\x0e\x01FCGI_MAX_CONNS1\
            \x0d\x01FCGI_MAX_REQS1\x0f\x01FCGI_MPXS_CONNS0\0\0\0\0\0";
        let mut out = Vec::new();
        let written = ProtocolVariables::all().write_response(&mut out, 1);
        assert_eq!(written, EXPECTED.len());
        assert_eq!(out, EXPECTED);
    }

    #[test]
    fn response_subset() {
        let mut out = vec![0xaa];
        ProtocolVariables::FCGI_MPXS_CONNS.write_response(&mut out, 250);
        assert_eq!(&out[..1], &[0xaa]);
        assert_eq!(&out[1..9], b"\x01\x0a\0\0\x00\x12\x06\0");
        assert_eq!(&out[9..27], b"\x0f\x01FCGI_MPXS_CONNS0");

        out.clear();
        ProtocolVariables::empty().write_response(&mut out, 250);
        assert_eq!(out, b"\x01\x0a\0\0\0\0\0\0");
    }
}
