//! DoPut descriptors

use super::{check_version, decode_json, DatasetRef, PAYLOAD_VERSION};
use crate::storage::WriteMode;
use crate::{Error, Result};

use arrow_flight::flight_descriptor::DescriptorType;
use arrow_flight::FlightDescriptor;
use serde::{Deserialize, Serialize};

/// A decoded write target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDescriptor {
    pub dataset: DatasetRef,
    pub mode: WriteMode,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DescriptorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    v: Option<u32>,
    bucket: String,
    dataset: String,
    mode: WriteMode,
}

impl DatasetDescriptor {
    pub fn new(dataset: DatasetRef, mode: WriteMode) -> Self {
        Self { dataset, mode }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let payload: DescriptorPayload = decode_json("descriptor", bytes)?;
        check_version("descriptor", payload.v)?;
        let dataset = DatasetRef::new(payload.bucket, payload.dataset);
        dataset.validate()?;
        Ok(Self {
            dataset,
            mode: payload.mode,
        })
    }

    /// Decode from the `cmd` of a Flight command descriptor.
    pub fn from_flight(descriptor: &FlightDescriptor) -> Result<Self> {
        if descriptor.r#type != DescriptorType::Cmd as i32 {
            return Err(Error::MalformedRequest(
                "put descriptor must be a CMD descriptor".to_string(),
            ));
        }
        Self::decode(&descriptor.cmd)
    }

    pub fn to_bytes(&self) -> Result<bytes::Bytes> {
        super::encode_json(&DescriptorPayload {
            v: Some(PAYLOAD_VERSION),
            bucket: self.dataset.bucket.clone(),
            dataset: self.dataset.dataset.clone(),
            mode: self.mode,
        })
    }

    pub fn to_flight(&self) -> Result<FlightDescriptor> {
        Ok(FlightDescriptor::new_cmd(self.to_bytes()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_descriptor() {
        let d = DatasetDescriptor::decode(br#"{"bucket":"b","dataset":"x","mode":"append"}"#)
            .unwrap();
        assert_eq!(d.dataset, DatasetRef::new("b", "x"));
        assert_eq!(d.mode, WriteMode::Append);

        let d = DatasetDescriptor::decode(br#"{"bucket":"b","dataset":"x","mode":"replace"}"#)
            .unwrap();
        assert_eq!(d.mode, WriteMode::Overwrite);
    }

    #[test]
    fn test_mode_is_required() {
        let err = DatasetDescriptor::decode(br#"{"bucket":"b","dataset":"x"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedRequest(_)));

        let err = DatasetDescriptor::decode(br#"{"bucket":"b","dataset":"x","mode":"merge"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedRequest(_)));
    }

    #[test]
    fn test_path_descriptor_rejected() {
        let descriptor = FlightDescriptor::new_path(vec!["b".to_string(), "x".to_string()]);
        assert!(DatasetDescriptor::from_flight(&descriptor).is_err());

        let d = DatasetDescriptor::new(DatasetRef::new("b", "x"), WriteMode::Error);
        let descriptor = d.to_flight().unwrap();
        assert_eq!(DatasetDescriptor::from_flight(&descriptor).unwrap(), d);
    }
}
