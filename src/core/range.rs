//! Purpose: Turn a `Range` header and a resource size into a serving window.
//! Exports: `RangeSpec`, `negotiate`, `parse_start`, `DEFAULT_RANGE_BUDGET`.
//! Role: Consulted before a partial-content pipeline is built; its window bounds the source.
//! Invariants: `0 <= start <= end < total_size` for every produced `RangeSpec`.
//! Invariants: A missing header is an error, never a silent full-body response.
//! Notes: Windows are fixed-size. An explicit end in the header is validated and
//! then ignored; every response covers at most `budget + 1` bytes from `start`.

use crate::core::error::{Error, ErrorKind};

/// Default number of bytes past `start` a single partial response may cover.
pub const DEFAULT_RANGE_BUDGET: u64 = 1_000_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
    pub total_size: u64,
}

impl RangeSpec {
    pub fn content_length(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total_size)
    }

    /// `Content-Range`, `Accept-Ranges`, and `Content-Length` for a 206 response.
    pub fn response_headers(&self) -> [(&'static str, String); 3] {
        [
            ("content-range", self.content_range()),
            ("accept-ranges", "bytes".to_string()),
            ("content-length", self.content_length().to_string()),
        ]
    }
}

fn malformed(header: &str, message: &str) -> Error {
    Error::new(ErrorKind::MalformedRange)
        .with_message(format!("{message}: {header:?}"))
        .with_hint("Send a header like `Range: bytes=0-`.")
}

/// Parses `bytes=<start>-[<end>]`, returning the start offset.
pub fn parse_start(header: &str) -> Result<u64, Error> {
    let trimmed = header.trim();
    let Some((unit, spec)) = trimmed.split_once('=') else {
        return Err(malformed(header, "range header has no unit"));
    };
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return Err(malformed(header, "only byte ranges are supported"));
    }
    if spec.contains(',') {
        return Err(malformed(header, "multiple ranges are not supported"));
    }
    let Some((start, end)) = spec.split_once('-') else {
        return Err(malformed(header, "range has no '-' separator"));
    };
    let start = start.trim();
    if start.is_empty() {
        return Err(malformed(header, "suffix ranges are not supported"));
    }
    let start = parse_offset(start).ok_or_else(|| malformed(header, "invalid range start"))?;
    let end = end.trim();
    if !end.is_empty() {
        let end = parse_offset(end).ok_or_else(|| malformed(header, "invalid range end"))?;
        if end < start {
            return Err(malformed(header, "range end precedes start"));
        }
    }
    Ok(start)
}

fn parse_offset(text: &str) -> Option<u64> {
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Computes the window served for `header` against a resource of `total_size` bytes.
pub fn negotiate(header: Option<&str>, total_size: u64, budget: u64) -> Result<RangeSpec, Error> {
    let Some(header) = header else {
        return Err(Error::new(ErrorKind::RangeRequired)
            .with_message("requires Range header")
            .with_hint("Send a header like `Range: bytes=0-`."));
    };
    let start = parse_start(header)?;
    if start >= total_size {
        return Err(Error::new(ErrorKind::RangeNotSatisfiable)
            .with_message(format!("range start is beyond the resource size {total_size}"))
            .with_offset(start));
    }
    let end = start.saturating_add(budget).min(total_size - 1);
    Ok(RangeSpec {
        start,
        end,
        total_size,
    })
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_RANGE_BUDGET, RangeSpec, negotiate, parse_start};
    use crate::core::error::ErrorKind;

    #[test]
    fn small_resource_is_clamped_to_its_last_byte() {
        let spec = negotiate(Some("bytes=0-"), 10, DEFAULT_RANGE_BUDGET).expect("range");
        assert_eq!(
            spec,
            RangeSpec {
                start: 0,
                end: 9,
                total_size: 10
            }
        );
        assert_eq!(spec.content_range(), "bytes 0-9/10");
        assert_eq!(spec.content_length(), 10);
    }

    #[test]
    fn large_resource_gets_a_budget_sized_window() {
        let spec = negotiate(Some("bytes=500-"), 10_000_000, 1_000).expect("range");
        assert_eq!((spec.start, spec.end), (500, 1_500));
        assert_eq!(spec.content_length(), 1_001);
    }

    #[test]
    fn explicit_end_is_ignored_by_policy() {
        let spec = negotiate(Some("bytes=100-199"), 10_000, 1_000).expect("range");
        assert_eq!((spec.start, spec.end), (100, 1_100));
    }

    #[test]
    fn content_length_always_matches_window() {
        for (start, total, budget) in [(0, 1, 0), (0, 1, 5), (7, 8, 100), (3, 1_000, 10), (999, 1_000, 1)] {
            let header = format!("bytes={start}-");
            let spec = negotiate(Some(&header), total, budget).expect("range");
            let headers = spec.response_headers();
            assert_eq!(headers[2].1, (spec.end - spec.start + 1).to_string());
            assert!(spec.start <= spec.end && spec.end < total);
        }
    }

    #[test]
    fn missing_header_requires_range() {
        let err = negotiate(None, 10, DEFAULT_RANGE_BUDGET).expect_err("no header");
        assert_eq!(err.kind(), ErrorKind::RangeRequired);
    }

    #[test]
    fn malformed_headers_are_rejected() {
        for header in [
            "",
            "bytes",
            "items=0-",
            "bytes=-500",
            "bytes=abc-",
            "bytes=0-1,5-9",
            "bytes=10-2",
            "bytes=1x-",
            "bytes=99999999999999999999999-",
        ] {
            let err = parse_start(header).expect_err(header);
            assert_eq!(err.kind(), ErrorKind::MalformedRange, "{header}");
        }
    }

    #[test]
    fn whitespace_and_unit_case_are_tolerated() {
        assert_eq!(parse_start(" Bytes = 42 - ").expect("start"), 42);
    }

    #[test]
    fn start_past_end_is_unsatisfiable() {
        let err = negotiate(Some("bytes=10-"), 10, DEFAULT_RANGE_BUDGET).expect_err("past end");
        assert_eq!(err.kind(), ErrorKind::RangeNotSatisfiable);
        let err = negotiate(Some("bytes=0-"), 0, DEFAULT_RANGE_BUDGET).expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::RangeNotSatisfiable);
    }

    #[test]
    fn budget_overflow_saturates() {
        let spec = negotiate(Some("bytes=5-"), u64::MAX, u64::MAX).expect("range");
        assert_eq!(spec.end, u64::MAX - 1);
    }
}
