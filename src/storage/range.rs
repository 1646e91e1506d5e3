//! `Range` header handling shared by the backends that slice bytes locally.

use bytes::Bytes;

use super::backend::{StorageError, StorageResult};

/// A satisfiable byte window, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

/// What a `Range` header asks for, before the object size is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    From(u64, Option<u64>),
    Last(u64),
}

impl Request {
    /// Single `bytes=` ranges only; anything else is not a range request.
    fn parse(header: &str) -> Option<Self> {
        let spec = header.trim().strip_prefix("bytes=")?;
        if spec.contains(',') {
            return None;
        }
        let (first, last) = spec.split_once('-')?;
        match (first, last) {
            ("", n) => match n.parse::<u64>().ok()? {
                0 => None,
                n => Some(Request::Last(n)),
            },
            (start, "") => Some(Request::From(start.parse().ok()?, None)),
            (start, end) => {
                let (start, end): (u64, u64) = (start.parse().ok()?, end.parse().ok()?);
                (start <= end).then_some(Request::From(start, Some(end)))
            }
        }
    }

    fn resolve(self, total: u64) -> Option<ByteRange> {
        let last = total.checked_sub(1)?;
        match self {
            Request::From(start, _) if start > last => None,
            Request::From(start, end) => Some(ByteRange {
                start,
                end: end.map_or(last, |e| e.min(last)),
            }),
            Request::Last(n) => Some(ByteRange {
                start: total.saturating_sub(n),
                end: last,
            }),
        }
    }
}

impl ByteRange {
    /// Resolve a `Range` header against an object of `total` bytes.
    ///
    /// `Ok(None)` means the header is not a usable range request and the
    /// whole object should be served.
    pub fn from_header(header: &str, total: u64) -> StorageResult<Option<Self>> {
        let Some(request) = Request::parse(header) else {
            return Ok(None);
        };
        request
            .resolve(total)
            .map(Some)
            .ok_or_else(|| StorageError::InvalidRange {
                range: header.to_string(),
            })
    }

    /// `Content-Range` value for this window.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Apply an optional Range header to a full object body.
pub fn slice_range(data: Bytes, range: Option<&str>) -> StorageResult<(Bytes, Option<String>)> {
    let total = data.len() as u64;
    match range.map(|r| ByteRange::from_header(r, total)).transpose()?.flatten() {
        Some(window) => {
            let slice = data.slice(window.start as usize..=window.end as usize);
            Ok((slice, Some(window.content_range(total))))
        }
        None => Ok((data, None)),
    }
}
