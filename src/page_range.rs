//! Page range strings such as `"0-23,423-447"` or `"4,4,4"`.
//!
//! Page numbers are 0-indexed and ranges are inclusive. Items keep their
//! order and may repeat; every repetition is a separate output page.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};

/// A closed interval of page numbers. A single page has `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpan {
    pub start: u32,
    pub end: u32,
}

impl PageSpan {
    pub fn single(page: u32) -> Self {
        Self {
            start: page,
            end: page,
        }
    }

    pub fn page_count(&self) -> u32 {
        (self.end - self.start).saturating_add(1)
    }

    pub fn pages(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }
}

/// Parse a page range string into its spans, in input order.
pub fn parse(input: &str) -> Result<Vec<PageSpan>, PipelineError> {
    let malformed = |reason: &str| PipelineError::MalformedRange {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    if input.trim().is_empty() {
        return Err(malformed("empty range"));
    }

    let mut spans = Vec::new();
    for item in input.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(malformed("empty item"));
        }
        let span = match item.split_once('-') {
            Some((start, end)) => {
                let start = parse_page(start.trim()).ok_or_else(|| malformed("bad range start"))?;
                let end = parse_page(end.trim()).ok_or_else(|| malformed("bad range end"))?;
                if start > end {
                    return Err(malformed(&format!("range {start}-{end} runs backwards")));
                }
                PageSpan { start, end }
            }
            None => PageSpan::single(parse_page(item).ok_or_else(|| malformed("bad page number"))?),
        };
        spans.push(span);
    }
    Ok(spans)
}

/// Only plain decimal digits are accepted; `+3` or `-3` are rejected.
fn parse_page(token: &str) -> Option<u32> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

/// Expand spans into the ordered list of page numbers.
pub fn expand(spans: &[PageSpan]) -> Vec<u32> {
    spans.iter().flat_map(|s| s.pages()).collect()
}

/// Total number of output pages the spans describe.
pub fn total_len(spans: &[PageSpan]) -> u64 {
    spans.iter().map(|s| u64::from(s.page_count())).sum()
}

/// Highest page number referenced.
pub fn max_page(spans: &[PageSpan]) -> Option<u32> {
    spans.iter().map(|s| s.end).max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ranges_and_singles() {
        let spans = parse("0-23,423-447").unwrap();
        assert_eq!(
            spans,
            vec![
                PageSpan { start: 0, end: 23 },
                PageSpan {
                    start: 423,
                    end: 447
                }
            ]
        );
        assert_eq!(total_len(&spans), 49);
        assert_eq!(max_page(&spans), Some(447));
    }

    #[test]
    fn repeats_are_kept() {
        let spans = parse("4,4,4").unwrap();
        assert_eq!(expand(&spans), vec![4, 4, 4]);
    }

    #[test]
    fn order_is_preserved() {
        let spans = parse("5, 0-1 ,3").unwrap();
        assert_eq!(expand(&spans), vec![5, 0, 1, 3]);
    }

    #[test]
    fn degenerate_range_is_single_page() {
        let spans = parse("7-7").unwrap();
        assert_eq!(expand(&spans), vec![7]);
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", " ", "1,,2", "a", "1-", "-1", "3-1", "1-2-3", "+1", "1.5"] {
            let err = parse(bad).unwrap_err();
            assert!(
                matches!(err, PipelineError::MalformedRange { .. }),
                "{bad:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn rejects_overflowing_number() {
        assert!(parse("99999999999").is_err());
    }
}
