use std::mem;

use super::varint::VarInt;
use super::Error as ProtocolError;


/// An iterator decoding complete name-value pairs from its input.
#[derive(Debug, Clone)]
pub struct NVIter<'a> {
    data: &'a [u8],
}

impl<'a> NVIter<'a> {
    /// Creates a new [`NVIter`] over the referenced input bytes.
    #[inline]
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Extracts the remaining input bytes from the iterator.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> &'a [u8] {
        self.data
    }
}

impl<'a> Iterator for NVIter<'a> {
    /// The name-value pair returned by the iterator.
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let mut cur = self.data;
        let name_len = VarInt::read(&mut cur).ok()?.to_usize();
        let val_len = VarInt::read(&mut cur).ok()?.to_usize();
        let total_len = name_len.checked_add(val_len)?;

        if cur.len() >= total_len {
            self.data = &cur[total_len..];
            Some((&cur[..name_len], &cur[name_len..total_len]))
        } else {
            None
        }
    }
}

impl std::iter::FusedIterator for NVIter<'_> {}


/// Appends the encoding of a name-value pair to `out` and returns its length.
///
/// # Errors
/// Returns [`ProtocolError::InvalidVarInt`] if either length cannot be
/// encoded. Nothing is appended in that case.
pub fn write((name, value): (&[u8], &[u8]), out: &mut Vec<u8>) -> Result<usize, ProtocolError> {
    let name_len = VarInt::try_from(name.len())?;
    let value_len = VarInt::try_from(value.len())?;
    let start = out.len();
    let mut buf = [0; 4];
    out.extend_from_slice(name_len.encode(&mut buf));
    out.extend_from_slice(value_len.encode(&mut buf));
    out.extend_from_slice(name);
    out.extend_from_slice(value);
    Ok(out.len() - start)
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NvState {
    NameLen,
    ValueLen,
    Name,
    Value,
}

/// A resumable decoder for a stream of name-value pairs.
///
/// Input can be fed in arbitrary pieces. Lengths, names and values may be
/// split anywhere, including across FastCGI record boundaries. Pairs whose
/// name or value exceeds the configured limits are consumed without being
/// buffered and are never returned.
#[derive(Debug)]
pub struct NvReader {
    max_name_len: usize,
    max_value_len: usize,
    state: NvState,
    len_buf: [u8; 4],
    len_have: usize,
    name_len: usize,
    value_len: usize,
    /// Bytes left in the current name or value.
    remaining: usize,
    skip: bool,
    name: Vec<u8>,
    value: Vec<u8>,
}

impl NvReader {
    /// Creates a new [`NvReader`] accepting names of up to `max_name_len`
    /// and values of up to `max_value_len` bytes.
    #[must_use]
    pub fn new(max_name_len: usize, max_value_len: usize) -> Self {
        Self {
            max_name_len, max_value_len,
            state: NvState::NameLen,
            len_buf: [0; 4],
            len_have: 0,
            name_len: 0,
            value_len: 0,
            remaining: 0,
            skip: false,
            name: Vec::new(),
            value: Vec::new(),
        }
    }

    /// Tests whether the reader sits exactly between two pairs.
    #[inline]
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == NvState::NameLen && self.len_have == 0
    }

    /// Collects the bytes of a [`VarInt`], returning it once complete.
    fn feed_len(&mut self, data: &mut &[u8]) -> Option<usize> {
        while let Some((&b, rest)) = data.split_first() {
            *data = rest;
            self.len_buf[self.len_have] = b;
            self.len_have += 1;

            if self.len_have == VarInt::len_from_first(self.len_buf[0]) {
                self.len_have = 0;
                return VarInt::from_prefix(&self.len_buf).map(|(v, _)| v.to_usize());
            }
        }
        None
    }

    /// Moves up to `self.remaining` bytes from `data` into `dest`, or drops
    /// them while skipping. Returns whether the field is complete.
    fn feed_field(remaining: &mut usize, skip: bool, dest: &mut Vec<u8>, data: &mut &[u8]) -> bool {
        let n = (*remaining).min(data.len());
        let (take, rest) = data.split_at(n);
        if !skip {
            dest.extend_from_slice(take);
        }
        *data = rest;
        *remaining -= n;
        *remaining == 0
    }

    /// Consumes input from `data` until a name-value pair completes or the
    /// input is exhausted.
    ///
    /// Any unconsumed input is left in `data` for the next call.
    pub fn feed(&mut self, data: &mut &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        loop {
            match self.state {
                NvState::NameLen => {
                    self.name_len = self.feed_len(data)?;
                    self.state = NvState::ValueLen;
                },
                NvState::ValueLen => {
                    self.value_len = self.feed_len(data)?;
                    self.skip = self.name_len > self.max_name_len
                        || self.value_len > self.max_value_len;
                    if !self.skip {
                        self.name.reserve(self.name_len);
                        self.value.reserve(self.value_len);
                    }
                    self.remaining = self.name_len;
                    self.state = NvState::Name;
                },
                NvState::Name => {
                    if !Self::feed_field(&mut self.remaining, self.skip, &mut self.name, data) {
                        return None;
                    }
                    self.remaining = self.value_len;
                    self.state = NvState::Value;
                },
                NvState::Value => {
                    if !Self::feed_field(&mut self.remaining, self.skip, &mut self.value, data) {
                        return None;
                    }
                    self.state = NvState::NameLen;
                    if self.skip {
                        tracing::debug!(
                            name_len = self.name_len, value_len = self.value_len,
                            "dropping oversized name-value pair",
                        );
                        continue;
                    }
                    return Some((mem::take(&mut self.name), mem::take(&mut self.value)));
                },
            }
        }
    }
}
