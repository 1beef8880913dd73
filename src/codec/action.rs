//! DoAction payloads

use super::{check_version, DatasetRef};
use crate::resample::ResampleRule;
use crate::storage::{validate_name, DeleteMode, NameKind, WriteMode};
use crate::{Error, Result};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload for actions that take none; `{}` or an empty body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyRequest {}

/// `list`: datasets, optionally limited to one bucket and a name pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

impl ListRequest {
    pub fn bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: Some(bucket.into()),
            regex: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(bucket) = &self.bucket {
            validate_name(NameKind::Bucket, bucket)?;
        }
        self.pattern().map(|_| ())
    }

    /// Compiled dataset name pattern, if any.
    pub fn pattern(&self) -> Result<Option<regex::Regex>> {
        self.regex
            .as_deref()
            .map(|raw| {
                regex::Regex::new(raw)
                    .map_err(|e| Error::MalformedRequest(format!("invalid regex '{raw}': {e}")))
            })
            .transpose()
    }
}

/// `delete`: remove one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteRequest {
    pub bucket: String,
    pub dataset: String,
    #[serde(default)]
    pub missing_ok: bool,
}

impl DeleteRequest {
    pub fn validate(&self) -> Result<()> {
        DatasetRef::new(self.bucket.clone(), self.dataset.clone()).validate()
    }
}

/// `delete_bucket`: remove a bucket according to a deletion mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteBucketRequest {
    pub bucket: String,
    #[serde(default)]
    pub mode: DeleteMode,
}

impl DeleteBucketRequest {
    pub fn validate(&self) -> Result<()> {
        validate_name(NameKind::Bucket, &self.bucket)
    }
}

/// How a resample derives the target rows.
#[derive(Debug, Clone, PartialEq)]
pub enum ResampleMethod {
    Rule(ResampleRule),
    Sql(String),
}

/// `resample`: derive a dataset from another one.
#[derive(Debug, Clone, PartialEq)]
pub struct ResampleRequest {
    pub source: DatasetRef,
    pub target: DatasetRef,
    pub method: ResampleMethod,
    pub mode: WriteMode,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResamplePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    v: Option<u32>,
    source: DatasetRef,
    target: DatasetRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rule: Option<ResampleRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sql: Option<String>,
    #[serde(default = "default_resample_mode")]
    mode: WriteMode,
}

fn default_resample_mode() -> WriteMode {
    WriteMode::Append
}

impl ResampleRequest {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let payload: ResamplePayload = super::decode_json("resample", bytes)?;
        check_version("resample", payload.v)?;
        payload.source.validate()?;
        payload.target.validate()?;

        let method = match (payload.rule, payload.sql) {
            (Some(rule), None) => ResampleMethod::Rule(rule),
            (None, Some(sql)) if !sql.trim().is_empty() => ResampleMethod::Sql(sql),
            (None, Some(_)) => {
                return Err(Error::MalformedRequest("'sql' must not be blank".to_string()));
            }
            (Some(_), Some(_)) => {
                return Err(Error::MalformedRequest(
                    "resample takes either 'rule' or 'sql', not both".to_string(),
                ));
            }
            (None, None) => {
                return Err(Error::MalformedRequest(
                    "resample requires 'rule' or 'sql'".to_string(),
                ));
            }
        };

        Ok(Self {
            source: payload.source,
            target: payload.target,
            method,
            mode: payload.mode,
        })
    }

    pub fn to_bytes(&self) -> Result<bytes::Bytes> {
        let (rule, sql) = match &self.method {
            ResampleMethod::Rule(rule) => (Some(rule.clone()), None),
            ResampleMethod::Sql(sql) => (None, Some(sql.clone())),
        };
        super::encode_json(&ResamplePayload {
            v: Some(super::PAYLOAD_VERSION),
            source: self.source.clone(),
            target: self.target.clone(),
            rule,
            sql,
            mode: self.mode,
        })
    }
}

/// `generate_admin_token`: extra claims plus an optional lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenRequest {
    #[serde(default)]
    pub claims: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_json, decode_optional_json};
    use crate::resample::AggFunc;

    #[test]
    fn test_delete_bucket_mode_defaults() {
        let req: DeleteBucketRequest = decode_json("delete_bucket", br#"{"bucket":"b"}"#).unwrap();
        assert_eq!(req.mode, DeleteMode::Default);

        let req: DeleteBucketRequest =
            decode_json("delete_bucket", br#"{"bucket":"b","mode":"delete_all"}"#).unwrap();
        assert_eq!(req.mode, DeleteMode::DeleteAll);
    }

    #[test]
    fn test_delete_requires_dataset() {
        let err = decode_json::<DeleteRequest>("delete", br#"{"bucket":"b"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedRequest(_)));

        let req: DeleteRequest =
            decode_json("delete", br#"{"bucket":"b","dataset":"x","missing_ok":true}"#).unwrap();
        assert!(req.missing_ok);
    }

    #[test]
    fn test_list_regex_validated() {
        let req: ListRequest = decode_optional_json("list", br#"{"regex":"(unclosed"}"#).unwrap();
        assert!(matches!(req.validate().unwrap_err(), Error::MalformedRequest(_)));

        let req: ListRequest = decode_optional_json("list", br#"{"bucket":"b1"}"#).unwrap();
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_decode_rule_resample() {
        let req = ResampleRequest::decode(
            br#"{
                "source": {"bucket": "raw", "dataset": "ticks"},
                "target": {"bucket": "agg", "dataset": "ticks_1m"},
                "rule": {"time_col": "ts", "window": "1m", "agg": {"price": "mean", "qty": "sum"}}
            }"#,
        )
        .unwrap();

        assert_eq!(req.mode, WriteMode::Append);
        let ResampleMethod::Rule(rule) = &req.method else {
            panic!("expected rule");
        };
        assert_eq!(rule.time_col, "ts");
        assert_eq!(rule.window.as_nanos(), 60_000_000_000);
        assert_eq!(rule.agg.get("price"), Some(&AggFunc::Mean));

        let again = ResampleRequest::decode(&req.to_bytes().unwrap()).unwrap();
        assert_eq!(again, req);
    }

    #[test]
    fn test_resample_needs_exactly_one_method() {
        let neither = br#"{"source":{"bucket":"a","dataset":"x"},"target":{"bucket":"a","dataset":"y"}}"#;
        assert!(ResampleRequest::decode(neither).is_err());

        let both = br#"{"source":{"bucket":"a","dataset":"x"},"target":{"bucket":"a","dataset":"y"},
            "sql":"SELECT * FROM x","rule":{"time_col":"ts","window":60,"agg":{"v":"sum"}}}"#;
        assert!(ResampleRequest::decode(both).is_err());
    }
}
