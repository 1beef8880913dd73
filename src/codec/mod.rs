//! Payload codecs
//!
//! Tickets, descriptors and action bodies are JSON objects. Decoding is strict:
//! unknown fields are rejected, an explicit `v` must name a known version, and
//! bucket/dataset names are validated before anything touches the filesystem.

pub mod action;
pub mod descriptor;
pub mod ticket;

pub use action::{
    DeleteBucketRequest, DeleteRequest, ListRequest, ResampleMethod, ResampleRequest,
    TokenRequest,
};
pub use descriptor::DatasetDescriptor;
pub use ticket::{DatasetTicket, Filter};

use crate::storage::{validate_name, NameKind};
use crate::{Error, Result};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Payload version understood by this build.
pub const PAYLOAD_VERSION: u32 = 1;

/// Coordinates of one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetRef {
    pub bucket: String,
    pub dataset: String,
}

impl DatasetRef {
    pub fn new(bucket: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            dataset: dataset.into(),
        }
    }

    /// Check both names against the store's rules.
    pub fn validate(&self) -> Result<()> {
        validate_name(NameKind::Bucket, &self.bucket)?;
        validate_name(NameKind::Dataset, &self.dataset)
    }

    /// Build from a Flight path descriptor `[bucket, dataset]`.
    pub fn from_path(path: &[String]) -> Result<Self> {
        match path {
            [bucket, dataset] => {
                let reference = Self::new(bucket.clone(), dataset.clone());
                reference.validate()?;
                Ok(reference)
            }
            _ => Err(Error::MalformedRequest(format!(
                "descriptor path must be [bucket, dataset], got {} segment(s)",
                path.len()
            ))),
        }
    }

    pub fn to_path(&self) -> Vec<String> {
        vec![self.bucket.clone(), self.dataset.clone()]
    }
}

impl std::fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.dataset)
    }
}

/// Decode a JSON payload, mapping every failure onto `MalformedRequest`.
pub fn decode_json<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> Result<T> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::MalformedRequest(format!("{what} payload is empty")));
    }
    serde_json::from_slice(bytes)
        .map_err(|e| Error::MalformedRequest(format!("invalid {what} payload: {e}")))
}

/// Like [`decode_json`] but an empty body decodes as `T::default()`.
pub fn decode_optional_json<T: DeserializeOwned + Default>(what: &str, bytes: &[u8]) -> Result<T> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    decode_json(what, bytes)
}

/// Encode a payload for the wire.
pub fn encode_json<T: Serialize>(value: &T) -> Result<bytes::Bytes> {
    Ok(bytes::Bytes::from(serde_json::to_vec(value)?))
}

pub(crate) fn check_version(what: &str, version: Option<u32>) -> Result<()> {
    match version {
        None | Some(PAYLOAD_VERSION) => Ok(()),
        Some(other) => Err(Error::MalformedRequest(format!(
            "unsupported {what} version {other}, expected {PAYLOAD_VERSION}"
        ))),
    }
}
