//! Indexed body parts
//!
//! A body streams through the pipeline as parts. Indices within one
//! response form a dense prefix of the naturals and exactly one part, the
//! one with the maximal index, carries `is_last`. The writer reassembles
//! parts into index order regardless of which worker produced them.

use std::fs::File;
use std::sync::Arc;

use bytes::Bytes;

/// What a body part carries.
pub enum BodyPayload {
    /// Bytes to send directly.
    Inline(Bytes),
    /// A file range to send with the zero-copy path.
    File {
        file: Arc<File>,
        offset: u64,
        len: u64,
    },
    /// A close marker: no bytes, tear the connection down after the parts
    /// before it have flushed.
    Close,
}

impl std::fmt::Debug for BodyPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodyPayload::Inline(data) => f.debug_tuple("Inline").field(&data.len()).finish(),
            BodyPayload::File { offset, len, .. } => f
                .debug_struct("File")
                .field("offset", offset)
                .field("len", len)
                .finish(),
            BodyPayload::Close => f.write_str("Close"),
        }
    }
}

/// An indexed fragment of a request or response body.
#[derive(Debug)]
pub struct BodyPart {
    pub index: u64,
    pub is_last: bool,
    pub payload: BodyPayload,
}

impl BodyPart {
    pub fn inline(index: u64, data: impl Into<Bytes>, is_last: bool) -> Self {
        Self {
            index,
            is_last,
            payload: BodyPayload::Inline(data.into()),
        }
    }

    pub fn file(index: u64, file: Arc<File>, offset: u64, len: u64, is_last: bool) -> Self {
        Self {
            index,
            is_last,
            payload: BodyPayload::File { file, offset, len },
        }
    }

    pub fn close(index: u64) -> Self {
        Self {
            index,
            is_last: true,
            payload: BodyPayload::Close,
        }
    }

    /// Payload size in bytes, used for watermark accounting.
    pub fn byte_len(&self) -> usize {
        match &self.payload {
            BodyPayload::Inline(data) => data.len(),
            BodyPayload::File { len, .. } => *len as usize,
            BodyPayload::Close => 0,
        }
    }

    /// The inline bytes, when this part carries any.
    pub fn data(&self) -> Option<&Bytes> {
        match &self.payload {
            BodyPayload::Inline(data) => Some(data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_len_by_payload() {
        assert_eq!(BodyPart::inline(0, &b"abc"[..], false).byte_len(), 3);
        assert_eq!(BodyPart::close(1).byte_len(), 0);
    }

    #[test]
    fn close_marker_is_last() {
        let part = BodyPart::close(4);
        assert!(part.is_last);
        assert!(part.data().is_none());
    }
}
