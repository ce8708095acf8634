use super::Error as ProtocolError;
use super::{ProtocolStatus, RecordHeader, RecordType, RequestFlags, Role};
use super::FCGI_NULL_REQUEST_ID;


/// Frames a fixed 8-byte record body with its header.
fn framed(rtype: RecordType, request_id: u16, body: [u8; 8]) -> [u8; 16] {
    let mut head = RecordHeader::new(rtype, request_id);
    head.set_lengths(8);
    let mut buf = [0; 16];
    buf[..RecordHeader::LEN].copy_from_slice(&head.to_bytes());
    buf[RecordHeader::LEN..].copy_from_slice(&body);
    buf
}


/// The body of a [`RecordType::Unknown`] FastCGI record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownType {
    /// The raw type code of the unknown record.
    pub rtype: u8,
}

impl UnknownType {
    /// The number of bytes in the wire format of an [`UnknownType`] body.
    pub const LEN: usize = 8;

    /// Parses the input bytes into a FastCGI [`UnknownType`] record body.
    #[inline]
    #[must_use]
    pub fn from_bytes(data: [u8; Self::LEN]) -> Self {
        Self { rtype: data[0] }
    }

    /// Encodes the [`UnknownType`] record body into its binary wire format.
    #[inline]
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0; Self::LEN];
        buf[0] = self.rtype;
        buf
    }

    /// Encodes a complete management record carrying this body.
    #[must_use]
    pub fn to_record(self) -> [u8; 16] {
        framed(RecordType::Unknown, FCGI_NULL_REQUEST_ID, self.to_bytes())
    }
}


/// The body of a [`RecordType::BeginRequest`] FastCGI record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    /// The role of the FastCGI application in this request.
    pub role: Role,
    /// The control flags for this request.
    pub flags: RequestFlags,
}

impl BeginRequest {
    /// The number of bytes in the wire format of a [`BeginRequest`] body.
    pub const LEN: usize = 8;

    /// Parses the input bytes into a FastCGI [`BeginRequest`] record body.
    ///
    /// Unknown flag bits are ignored.
    ///
    /// # Errors
    /// Returns [`ProtocolError::UnknownRole`] if the role is not recognized.
    pub fn from_bytes(data: [u8; Self::LEN]) -> Result<Self, ProtocolError> {
        let role = u16::from_be_bytes([data[0], data[1]]);
        Ok(Self {
            role: Role::try_from(role)?,
            flags: RequestFlags::from(data[2]),
        })
    }

    /// Encodes the [`BeginRequest`] record body into its binary wire format.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0; Self::LEN];
        buf[..2].copy_from_slice(&u16::to_be_bytes(self.role.into()));
        buf[2] = self.flags.into();
        buf
    }

    /// Encodes a complete record carrying this body for `request_id`.
    #[must_use]
    pub fn to_record(self, request_id: u16) -> [u8; 16] {
        framed(RecordType::BeginRequest, request_id, self.to_bytes())
    }
}


/// The body of a [`RecordType::EndRequest`] FastCGI record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    /// The application's exit status, as would be set via exit(3)
    /// in regular CGI.
    pub app_status: i32,
    /// The protocol status code for this response.
    pub protocol_status: ProtocolStatus,
}

impl EndRequest {
    /// The number of bytes in the wire format of an [`EndRequest`] body.
    pub const LEN: usize = 8;

    /// Creates an [`EndRequest`] body for a rejected request.
    #[inline]
    #[must_use]
    pub fn reject(protocol_status: ProtocolStatus) -> Self {
        Self { app_status: 0, protocol_status }
    }

    /// Parses the input bytes into a FastCGI [`EndRequest`] record body.
    ///
    /// # Errors
    /// Returns an error if the protocol status is unknown.
    pub fn from_bytes(data: [u8; Self::LEN]) -> Result<Self, ProtocolError> {
        Ok(Self {
            app_status: i32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            protocol_status: ProtocolStatus::try_from(data[4])?,
        })
    }

    /// Encodes the [`EndRequest`] record body into its binary wire format.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0; Self::LEN];
        buf[..4].copy_from_slice(&i32::to_be_bytes(self.app_status));
        buf[4] = self.protocol_status.into();
        buf
    }

    /// Encodes a complete record carrying this body for `request_id`.
    #[must_use]
    pub fn to_record(self, request_id: u16) -> [u8; 16] {
        framed(RecordType::EndRequest, request_id, self.to_bytes())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_wire() -> Result<(), ProtocolError> {
        let begin = BeginRequest { role: Role::Responder, flags: RequestFlags::KeepConn };
        let rec = begin.to_record(0x0102);
        assert_eq!(&rec, b"\x01\x01\x01\x02\x00\x08\x00\x00\x00\x01\x01\0\0\0\0\0");

        let mut body = [0; 8];
        body.copy_from_slice(&rec[8..]);
        assert_eq!(BeginRequest::from_bytes(body)?, begin);

        let filter = BeginRequest::from_bytes(*b"\x00\x03\xfe\0\0\0\0\0")?;
        assert_eq!(filter.role, Role::Filter);
        assert_eq!(filter.flags, RequestFlags::empty());

        let unk = BeginRequest::from_bytes(*b"\x12\x34\x01\0\0\0\0\0");
        assert!(matches!(unk, Err(ProtocolError::UnknownRole(0x1234))));
        Ok(())
    }

    #[test]
    fn end_wire() -> Result<(), ProtocolError> {
        let end = EndRequest { app_status: -2, protocol_status: ProtocolStatus::RequestComplete };
        let rec = end.to_record(7);
        assert_eq!(&rec[..8], b"\x01\x03\x00\x07\x00\x08\x00\x00");
        assert_eq!(&rec[8..], b"\xff\xff\xff\xfe\x00\0\0\0");

        let mut body = [0; 8];
        body.copy_from_slice(&rec[8..]);
        assert_eq!(EndRequest::from_bytes(body)?, end);

        let mpx = EndRequest::reject(ProtocolStatus::CantMpxConn).to_bytes();
        assert_eq!(mpx, *b"\0\0\0\0\x01\0\0\0");
        let bad = EndRequest::from_bytes(*b"\0\0\0\0\x09\0\0\0");
        assert!(matches!(bad, Err(ProtocolError::UnknownStatus(9))));
        Ok(())
    }

    #[test]
    fn unknown_wire() {
        let rec = UnknownType { rtype: 0x7a }.to_record();
        assert_eq!(&rec, b"\x01\x0b\0\0\x00\x08\x00\x00\x7a\0\0\0\0\0\0\0");
        assert_eq!(UnknownType::from_bytes([0x33; 8]).rtype, 0x33);
    }
}
