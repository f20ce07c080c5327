//! Compact encoding of per-page dimensions ("page spec").
//!
//! Pages sharing a dimension are grouped and their page numbers run-length
//! compressed: `612.0x792.0:0-2,4;612.0x1008.0:3`.

use crate::error::PipelineError;
use crate::page_range;
use std::collections::BTreeMap;

/// Key for a page of `width` x `height` points, e.g. `612.0x792.0`.
pub fn dimension_key(width: f32, height: f32) -> String {
    format!("{:?}x{:?}", width, height)
}

/// Encode page dimension keys (indexed by page number) into a page spec.
pub fn encode(dimensions: &BTreeMap<u32, String>) -> String {
    let mut groups: Vec<(&str, Vec<u32>)> = Vec::new();
    for (&page, key) in dimensions {
        match groups.iter_mut().find(|(k, _)| *k == key.as_str()) {
            Some((_, pages)) => pages.push(page),
            None => groups.push((key.as_str(), vec![page])),
        }
    }
    groups
        .iter()
        .map(|(key, pages)| format!("{key}:{}", compress(pages)))
        .collect::<Vec<_>>()
        .join(";")
}

/// `[0,1,2,4]` → `0-2,4`. Input must be sorted.
fn compress(pages: &[u32]) -> String {
    let mut runs: Vec<String> = Vec::new();
    let mut iter = pages.iter().copied();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;
    for page in iter {
        if page == end + 1 {
            end = page;
            continue;
        }
        runs.push(run(start, end));
        start = page;
        end = page;
    }
    runs.push(run(start, end));
    runs.join(",")
}

fn run(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}

/// Decode a page spec back into one dimension key per page.
pub fn decode(spec: &str) -> Result<Vec<String>, PipelineError> {
    let mut pages: BTreeMap<u32, String> = BTreeMap::new();
    for group in spec.split(';').filter(|g| !g.is_empty()) {
        let (key, ranges) = group.split_once(':').ok_or_else(|| {
            PipelineError::Internal(format!("page spec group '{group}' has no ':'"))
        })?;
        for page in page_range::expand(&page_range::parse(ranges)?) {
            pages.insert(page, key.to_string());
        }
    }
    let expected = pages.len() as u32;
    if pages.keys().copied().ne(0..expected) {
        return Err(PipelineError::Internal(format!(
            "page spec '{spec}' does not cover pages 0..{expected}"
        )));
    }
    Ok(pages.into_values().collect())
}
