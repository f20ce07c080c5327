//! Redaction requests and their validation.

use crate::error::PipelineError;
use crate::model::Bounds;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A rectangle to black out, in page-relative fractions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RedactionSpec {
    pub page_number: u32,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl RedactionSpec {
    pub fn new(page_number: u32, x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            page_number,
            x1,
            y1,
            x2,
            y2,
        }
    }

    pub fn bounds(&self) -> Bounds {
        Bounds {
            x1: self.x1,
            y1: self.y1,
            x2: self.x2,
            y2: self.y2,
        }
    }

    fn check(&self, page_count: u32) -> Result<(), PipelineError> {
        let invalid = |reason: &str| PipelineError::InvalidRedaction {
            page: self.page_number,
            reason: reason.to_string(),
        };
        if self.page_number >= page_count {
            return Err(invalid(&format!(
                "document has only {page_count} pages"
            )));
        }
        let coords = [self.x1, self.y1, self.x2, self.y2];
        if coords.iter().any(|c| !c.is_finite() || !(0.0..=1.0).contains(c)) {
            return Err(invalid("coordinates must be within [0, 1]"));
        }
        if self.x1 >= self.x2 || self.y1 >= self.y2 {
            return Err(invalid("rectangle must have x1 < x2 and y1 < y2"));
        }
        Ok(())
    }
}

/// Validate a redaction request and return the set of pages it touches.
pub fn validate(
    redactions: &[RedactionSpec],
    page_count: u32,
) -> Result<BTreeSet<u32>, PipelineError> {
    if redactions.is_empty() {
        return Err(PipelineError::EmptyRedaction);
    }
    for r in redactions {
        r.check(page_count)?;
    }
    Ok(redactions.iter().map(|r| r.page_number).collect())
}
