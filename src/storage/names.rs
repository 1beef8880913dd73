//! Bucket and dataset name rules.
//!
//! Names become path segments under the storage root, so anything that could
//! escape the root or collide with staging files is rejected outright.

use crate::{Error, Result};

/// Longest accepted name, in bytes.
///
/// Leaves room under the usual 255-byte file name limit for the longest
/// derived name, the `.{bucket}.{uuid}.deleting` bucket tombstone.
pub const MAX_NAME_LEN: usize = 200;

/// What a name is used for, for error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Bucket,
    Dataset,
}

impl NameKind {
    fn as_str(&self) -> &'static str {
        match self {
            NameKind::Bucket => "bucket",
            NameKind::Dataset => "dataset",
        }
    }
}

/// Validate a bucket or dataset name.
///
/// Accepts ASCII alphanumerics plus `_`, `-` and `.`, with no leading dot.
pub fn validate_name(kind: NameKind, name: &str) -> Result<()> {
    let what = kind.as_str();
    if name.is_empty() {
        return Err(Error::MalformedRequest(format!("{what} name must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::MalformedRequest(format!(
            "{what} name exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    if name.starts_with('.') {
        return Err(Error::MalformedRequest(format!(
            "{what} name '{name}' must not start with '.'"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(Error::MalformedRequest(format!(
            "{what} name '{name}' contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

/// Whether a directory entry name could be a valid bucket or dataset.
pub(crate) fn is_valid_name(name: &str) -> bool {
    validate_name(NameKind::Dataset, name).is_ok()
}
