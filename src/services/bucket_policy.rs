//! Upload policy gate: a pure predicate over a bucket's size and MIME rules,
//! consulted before anything is written to either store.

use crate::models::bucket::Bucket;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("size {size} exceeds maximum of {max} bytes")]
    SizeExceedsMaximum { size: i64, max: i64 },
    #[error("size {size} is below minimum of {min} bytes")]
    SizeBelowMinimum { size: i64, min: i64 },
    #[error("MIME type `{0}` not allowed")]
    MimeTypeNotAllowed(String),
}

/// Check a pending upload against `bucket`. Rules run in order and the first
/// violation wins: maximum size, minimum size, allowed MIME types.
pub fn check(bucket: &Bucket, size: i64, mime_type: &str) -> Result<(), PolicyViolation> {
    if let Some(max) = bucket.max_upload_size {
        if size > max {
            return Err(PolicyViolation::SizeExceedsMaximum { size, max });
        }
    }

    if let Some(min) = bucket.min_upload_size {
        if size < min {
            return Err(PolicyViolation::SizeBelowMinimum { size, min });
        }
    }

    if !bucket.allowed_mime_types.is_empty() && !mime_allowed(&bucket.allowed_mime_types, mime_type)
    {
        return Err(PolicyViolation::MimeTypeNotAllowed(mime_type.to_string()));
    }

    Ok(())
}

/// Compare on the essence (`type/subtype`), ignoring parameters and case.
/// `type/*` entries match any subtype.
fn mime_allowed(allowed: &[String], candidate: &str) -> bool {
    let essence = candidate
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    allowed.iter().any(|entry| {
        let entry = entry.trim().to_ascii_lowercase();
        match entry.strip_suffix("/*") {
            Some(top) => essence
                .split_once('/')
                .is_some_and(|(candidate_top, _)| candidate_top == top),
            None => entry == essence,
        }
    })
}
