/// Types representing the bodies of fixed-size FastCGI records.
pub mod body;
mod fields;
/// An encoder and decoder for FastCGI name-value pairs.
pub mod nv;
/// Encoders for complete FastCGI records and record streams.
pub mod record;
/// An encoder and decoder for FastCGI's variable-length integers.
pub mod varint;
mod vars;

pub use fields::*;
pub use vars::*;


/// The fixed FastCGI request ID for management records.
pub const FCGI_NULL_REQUEST_ID: u16 = 0;

/// The largest payload a single FastCGI record can carry.
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize;

/// The payload size at which stream and name-value content is split into
/// multiple records. It stays 8-byte aligned so full records need no padding.
pub const STREAM_CHUNK_LEN: usize = 0xfff8;


/// Error types that may occur while processing FastCGI protocol elements.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The FastCGI record type field specifies an unknown record type.
    #[error("unknown FastCGI record type {0}")]
    UnknownRecordType(u8),
    /// The FastCGI request role field specifies an unknown role identifier.
    #[error("unknown FastCGI role {0}")]
    UnknownRole(u16),
    /// The FastCGI response protocol status specifies an unknown status.
    #[error("unknown FastCGI protocol status {0}")]
    UnknownStatus(u8),
    /// The FastCGI variable name did not match any well-known value.
    #[error("unknown FastCGI protocol variable name")]
    UnknownVariable,

    /// The input value is too large to be encoded as a FastCGI VarInt.
    #[error("input is too large to be encoded as a FastCGI VarInt")]
    InvalidVarInt,
}


/// A FastCGI record header.
///
/// The version byte is carried as-is. Records are always written with
/// [`Version::V1`], but the version of received records is not checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHeader {
    /// The raw FastCGI version byte of this record.
    pub version: u8,
    /// The type of this record, defining its payload.
    pub rtype: RecordType,
    /// The ID of the request this record belongs to.
    pub request_id: u16,
    /// The length of this record's payload.
    pub content_length: u16,
    /// The amount of padding following this record.
    pub padding_length: u8,
}

impl RecordHeader {
    /// Creates a new [`RecordHeader`] with [`Version::V1`] and all
    /// lengths set to 0.
    ///
    /// This function is intended to be used together with
    /// `RecordHeader::set_lengths` if the record should have a body.
    #[inline]
    #[must_use]
    pub fn new(rtype: RecordType, request_id: u16) -> Self {
        Self { version: Version::V1.into(), rtype, request_id, content_length: 0, padding_length: 0 }
    }

    /// Sets `content_length` and automatically calculates an
    /// appropriate `padding_length`.
    ///
    /// Up to 7 bytes of padding are used such that
    /// `content_length + padding_length` is a multiple of 8.
    #[inline]
    pub fn set_lengths(&mut self, content_length: u16) {
        self.content_length = content_length;
        self.padding_length = padding_for(content_length.into());
    }

    /// Tests whether this [`RecordHeader`] represents a management record.
    #[inline]
    #[must_use]
    pub fn is_management(self) -> bool {
        self.rtype.is_management() && self.request_id == FCGI_NULL_REQUEST_ID
    }

    /// Returns a slice of `self.padding_length` zero bytes to be used as padding.
    #[inline]
    #[must_use]
    pub fn padding_bytes(self) -> &'static [u8] {
        static PADDING: [u8; u8::MAX as usize] = [0; u8::MAX as usize];
        &PADDING[..self.padding_length.into()]
    }

    /// The number of bytes in the wire format of a [`RecordHeader`].
    pub const LEN: usize = 8;

    /// Parses the input bytes into a FastCGI [`RecordHeader`].
    ///
    /// # Errors
    /// Returns [`Error::UnknownRecordType`] if the type byte does not name a
    /// known record type. No other field is validated.
    pub fn from_bytes(data: [u8; Self::LEN]) -> Result<Self, Error> {
        Ok(Self {
            version: data[0],
            rtype: RecordType::try_from(data[1])?,
            request_id: u16::from_be_bytes([data[2], data[3]]),
            content_length: u16::from_be_bytes([data[4], data[5]]),
            padding_length: data[6],
        })
    }

    /// Encodes the [`RecordHeader`] into its binary wire format.
    #[inline]
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0; Self::LEN];
        buf[0] = self.version;
        buf[1] = self.rtype.into();
        buf[2..4].copy_from_slice(&self.request_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.content_length.to_be_bytes());
        buf[6] = self.padding_length;
        buf
    }
}

/// Returns the amount of padding required to align `len` to 8 bytes.
#[inline]
#[must_use]
pub fn padding_for(len: usize) -> u8 {
    // Always < 8, so the cast is lossless
    ((8 - len % 8) % 8) as u8
}
