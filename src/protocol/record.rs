use super::Error as ProtocolError;
use super::{nv, RecordHeader, RecordType, MAX_CONTENT_LEN, STREAM_CHUNK_LEN};


/// Appends one record with `content` to `out`. `content` must fit a record.
fn push_record(out: &mut Vec<u8>, rtype: RecordType, request_id: u16, content: &[u8]) {
    let mut head = RecordHeader::new(rtype, request_id);
    #[allow(clippy::cast_possible_truncation)]
    head.set_lengths(content.len() as u16);
    out.reserve(RecordHeader::LEN + content.len() + usize::from(head.padding_length));
    out.extend_from_slice(&head.to_bytes());
    out.extend_from_slice(content);
    out.extend_from_slice(head.padding_bytes());
}

/// Appends `payload` to `out` as one or more records of type `rtype`.
///
/// Payloads larger than 65535 bytes are split into as many records as
/// needed. An empty payload produces a single empty record.
pub fn encode_record(out: &mut Vec<u8>, rtype: RecordType, request_id: u16, payload: &[u8]) {
    if payload.is_empty() {
        push_record(out, rtype, request_id, &[]);
    }
    for chunk in payload.chunks(MAX_CONTENT_LEN) {
        push_record(out, rtype, request_id, chunk);
    }
}

/// Appends `data` to `out` as stream records of at most
/// [`STREAM_CHUNK_LEN`] content bytes.
///
/// No terminating empty record is written and empty input writes nothing.
pub fn encode_stream(out: &mut Vec<u8>, rtype: RecordType, request_id: u16, data: &[u8]) {
    for chunk in data.chunks(STREAM_CHUNK_LEN) {
        push_record(out, rtype, request_id, chunk);
    }
}

/// Serializes name-value `pairs` in iteration order and appends them to
/// `out` as stream records of type `rtype`.
///
/// Pairs may straddle record boundaries. No terminating empty record
/// is written.
///
/// # Errors
/// Returns [`ProtocolError::InvalidVarInt`] if a name or value is too long
/// to be encoded. Nothing is appended in that case.
pub fn pack_nvp<N, V>(
    out: &mut Vec<u8>, rtype: RecordType, request_id: u16,
    pairs: impl IntoIterator<Item = (N, V)>,
) -> Result<(), ProtocolError>
where
    N: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let mut block = Vec::new();
    for (name, value) in pairs {
        nv::write((name.as_ref(), value.as_ref()), &mut block)?;
    }
    encode_stream(out, rtype, request_id, &block);
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::super::nv::NVIter;
    use super::*;

    /// Splits `data` into `(header, content)` pairs, checking padding.
    fn records(mut data: &[u8]) -> Vec<(RecordHeader, &[u8])> {
        let mut recs = Vec::new();
        while !data.is_empty() {
            let mut head = [0; RecordHeader::LEN];
            head.copy_from_slice(&data[..RecordHeader::LEN]);
            let head = RecordHeader::from_bytes(head).expect("valid header");
            let clen = usize::from(head.content_length);
            let plen = usize::from(head.padding_length);
            assert_eq!((clen + plen) % 8, 0);
            let body = &data[RecordHeader::LEN..];
            recs.push((head, &body[..clen]));
            data = &body[clen + plen..];
        }
        recs
    }

    #[test]
    fn empty_record() {
        let mut out = Vec::new();
        encode_record(&mut out, RecordType::Stdout, 1, &[]);
        assert_eq!(out, b"\x01\x06\x00\x01\0\0\0\0");

        out.clear();
        encode_stream(&mut out, RecordType::Stdout, 1, &[]);
        assert!(out.is_empty());
    }

    #[test]
    fn split_raw() {
        let payload: Vec<u8> = std::iter::repeat_with(|| fastrand::u8(..))
            .take(2 * MAX_CONTENT_LEN + 10).collect();
        let mut out = Vec::new();
        encode_record(&mut out, RecordType::Data, 93, &payload);

        let recs = records(&out);
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].0.content_length, u16::MAX);
        assert_eq!(recs[2].0.content_length, 10);
        let joined: Vec<u8> = recs.iter().flat_map(|(_, c)| c.iter().copied()).collect();
        assert_eq!(joined, payload);
    }

    #[test]
    fn split_stream() {
        let data = vec![0x5a; STREAM_CHUNK_LEN + 1];
        let mut out = Vec::new();
        encode_stream(&mut out, RecordType::Stdin, 4, &data);

        let recs = records(&out);
        assert_eq!(recs.len(), 2);
        assert_eq!(usize::from(recs[0].0.content_length), STREAM_CHUNK_LEN);
        assert_eq!(recs[0].0.padding_length, 0);
        assert_eq!(recs[1].0.content_length, 1);
        assert_eq!(recs[1].0.padding_length, 7);
        assert!(recs.iter().all(|(h, _)| h.request_id == 4 && h.rtype == RecordType::Stdin));
    }

    #[test]
    fn nvp_straddles_records() -> Result<(), ProtocolError> {
        let big = vec![b'v'; STREAM_CHUNK_LEN];
        let long_name = [b'n'; 127];
        let long_value = [b'x'; 128];
        let pairs: Vec<(&[u8], &[u8])> = vec![
            (&b"SHORT"[..], &b"1"[..]),
            (&b"BIG"[..], &big[..]),
            (&long_name[..], &long_value[..]),
        ];
        let mut out = Vec::new();
        pack_nvp(&mut out, RecordType::Params, 2, pairs.iter().copied())?;

        let recs = records(&out);
        assert_eq!(recs.len(), 2);
        let joined: Vec<u8> = recs.iter().flat_map(|(_, c)| c.iter().copied()).collect();
        let decoded: Vec<_> = NVIter::new(&joined).collect();
        assert_eq!(decoded, pairs);
        Ok(())
    }
}
