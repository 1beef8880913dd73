//! DoGet tickets

use super::{check_version, decode_json, DatasetRef, PAYLOAD_VERSION};
use crate::{Error, Result};

use serde::{Deserialize, Serialize};

/// Row selection applied to a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Predicate for `SELECT * FROM <dataset> WHERE ...`
    Where(String),
    /// A full statement run against the dataset table
    Sql(String),
}

/// A decoded read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetTicket {
    pub dataset: DatasetRef,
    pub filter: Option<Filter>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TicketPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    v: Option<u32>,
    bucket: String,
    dataset: String,
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    predicate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sql: Option<String>,
}

impl DatasetTicket {
    pub fn new(dataset: DatasetRef) -> Self {
        Self {
            dataset,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let payload: TicketPayload = decode_json("ticket", bytes)?;
        check_version("ticket", payload.v)?;

        let dataset = DatasetRef::new(payload.bucket, payload.dataset);
        dataset.validate()?;

        let filter = match (payload.predicate, payload.sql) {
            (Some(_), Some(_)) => {
                return Err(Error::MalformedRequest(
                    "ticket may carry either 'where' or 'sql', not both".to_string(),
                ));
            }
            (Some(predicate), None) => Some(Filter::Where(non_blank("where", predicate)?)),
            (None, Some(sql)) => Some(Filter::Sql(non_blank("sql", sql)?)),
            (None, None) => None,
        };

        Ok(Self { dataset, filter })
    }

    pub fn to_bytes(&self) -> Result<bytes::Bytes> {
        let (predicate, sql) = match &self.filter {
            Some(Filter::Where(p)) => (Some(p.clone()), None),
            Some(Filter::Sql(s)) => (None, Some(s.clone())),
            None => (None, None),
        };
        super::encode_json(&TicketPayload {
            v: Some(PAYLOAD_VERSION),
            bucket: self.dataset.bucket.clone(),
            dataset: self.dataset.dataset.clone(),
            predicate,
            sql,
        })
    }
}

fn non_blank(field: &str, value: String) -> Result<String> {
    if value.trim().is_empty() {
        Err(Error::MalformedRequest(format!("'{field}' must not be blank")))
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_ticket() {
        let ticket = DatasetTicket::decode(br#"{"bucket":"b1","dataset":"x"}"#).unwrap();
        assert_eq!(ticket.dataset, DatasetRef::new("b1", "x"));
        assert_eq!(ticket.filter, None);
    }

    #[test]
    fn test_decode_filters() {
        let ticket =
            DatasetTicket::decode(br#"{"v":1,"bucket":"b","dataset":"x","where":"v > 1"}"#).unwrap();
        assert_eq!(ticket.filter, Some(Filter::Where("v > 1".to_string())));

        let ticket = DatasetTicket::decode(
            br#"{"bucket":"b","dataset":"x","sql":"SELECT count(*) FROM x"}"#,
        )
        .unwrap();
        assert_eq!(
            ticket.filter,
            Some(Filter::Sql("SELECT count(*) FROM x".to_string()))
        );
    }

    #[test]
    fn test_rejects_bad_tickets() {
        let cases: &[&[u8]] = &[
            br#"{"bucket":"b"}"#,
            br#"{"dataset":"x"}"#,
            br#"{"bucket":"b","dataset":"x","name":"x"}"#,
            br#"{"v":2,"bucket":"b","dataset":"x"}"#,
            br#"{"bucket":"b","dataset":"x","where":"a","sql":"b"}"#,
            br#"{"bucket":"b","dataset":"x","where":"  "}"#,
            br#"{"bucket":"../b","dataset":"x"}"#,
            b"not json",
        ];
        for case in cases {
            let err = DatasetTicket::decode(case).unwrap_err();
            assert!(
                matches!(err, Error::MalformedRequest(_)),
                "{}: {err}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn test_encoded_ticket_decodes() {
        let ticket = DatasetTicket::new(DatasetRef::new("b", "x"))
            .with_filter(Filter::Where("v = 2".to_string()));
        let bytes = ticket.to_bytes().unwrap();
        assert_eq!(DatasetTicket::decode(&bytes).unwrap(), ticket);
    }
}
