//! DoAction dispatch
//!
//! An action body is decoded into a typed [`Action`] before anything runs, so
//! a malformed payload never has side effects. Each action answers with one or
//! more result records.

use crate::auth::TokenAuthority;
use crate::codec::action::EmptyRequest;
use crate::codec::{
    decode_json, decode_optional_json, encode_json, DeleteBucketRequest, DeleteRequest,
    ListRequest, ResampleRequest, TokenRequest,
};
use crate::server::ShutdownHandle;
use crate::service::BucketService;
use crate::storage::{DatasetInfo, DeleteMode};
use crate::{Error, Result};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Reply to `ping`
pub const PONG: &[u8] = b"pong";

/// Reply to `shutdown`
pub const SHUTDOWN_ACK: &str = "shutdown command received";

/// Action types and their descriptions, as advertised by `ListActions`.
pub const ACTION_TYPES: &[(&str, &str)] = &[
    ("ping", "Convenience action for testing if the server is functional"),
    ("list", "List datasets, optionally within one bucket and matching a regex"),
    ("buckets", "List buckets"),
    ("delete", "Delete a dataset"),
    ("delete_bucket", "Delete a bucket"),
    ("resample", "Resample a time series, or derive a dataset with a SQL query"),
    ("generate_admin_token", "Issue a signed admin token"),
    ("shutdown", "Shutdown the server"),
];

/// A decoded action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Ping,
    List(ListRequest),
    Buckets,
    Delete(DeleteRequest),
    DeleteBucket(DeleteBucketRequest),
    Resample(ResampleRequest),
    GenerateAdminToken(TokenRequest),
    Shutdown,
}

impl Action {
    /// Decode and validate an action body.
    pub fn decode(action_type: &str, body: &[u8]) -> Result<Self> {
        let action = match action_type {
            "ping" => {
                decode_optional_json::<EmptyRequest>("ping", body)?;
                Action::Ping
            }
            "list" => {
                let request: ListRequest = decode_optional_json("list", body)?;
                request.validate()?;
                Action::List(request)
            }
            "buckets" => {
                decode_optional_json::<EmptyRequest>("buckets", body)?;
                Action::Buckets
            }
            "delete" => {
                let request: DeleteRequest = decode_json("delete", body)?;
                request.validate()?;
                Action::Delete(request)
            }
            "delete_bucket" => {
                let request: DeleteBucketRequest = decode_json("delete_bucket", body)?;
                request.validate()?;
                Action::DeleteBucket(request)
            }
            "resample" => Action::Resample(ResampleRequest::decode(body)?),
            "generate_admin_token" => {
                Action::GenerateAdminToken(decode_optional_json("generate_admin_token", body)?)
            }
            "shutdown" => {
                decode_optional_json::<EmptyRequest>("shutdown", body)?;
                Action::Shutdown
            }
            other => return Err(Error::UnsupportedAction(other.to_string())),
        };
        Ok(action)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Ping => "ping",
            Action::List(_) => "list",
            Action::Buckets => "buckets",
            Action::Delete(_) => "delete",
            Action::DeleteBucket(_) => "delete_bucket",
            Action::Resample(_) => "resample",
            Action::GenerateAdminToken(_) => "generate_admin_token",
            Action::Shutdown => "shutdown",
        }
    }

    /// Body bytes for this action.
    pub fn body(&self) -> Result<Bytes> {
        match self {
            Action::Ping | Action::Buckets | Action::Shutdown => Ok(Bytes::new()),
            Action::List(request) => encode_json(request),
            Action::Delete(request) => encode_json(request),
            Action::DeleteBucket(request) => encode_json(request),
            Action::Resample(request) => request.to_bytes(),
            Action::GenerateAdminToken(request) => encode_json(request),
        }
    }

    pub fn to_flight(&self) -> Result<arrow_flight::Action> {
        Ok(arrow_flight::Action::new(self.name(), self.body()?))
    }
}

/// One `list` result record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetListing {
    pub bucket: String,
    pub dataset: String,
    pub num_rows: i64,
    pub schema: Vec<ColumnListing>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnListing {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
}

impl From<&DatasetInfo> for DatasetListing {
    fn from(info: &DatasetInfo) -> Self {
        Self {
            bucket: info.bucket.clone(),
            dataset: info.dataset.clone(),
            num_rows: info.num_rows,
            schema: info
                .schema
                .fields()
                .iter()
                .map(|f| ColumnListing {
                    name: f.name().clone(),
                    data_type: f.data_type().to_string(),
                    nullable: f.is_nullable(),
                })
                .collect(),
        }
    }
}

/// `delete` result record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub success: bool,
    pub deleted: bool,
    pub message: String,
}

/// `delete_bucket` result record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteBucketOutcome {
    pub message: String,
    pub datasets_removed: usize,
    pub bucket_removed: bool,
}

/// `generate_admin_token` result record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenOutcome {
    pub token: String,
}

/// Routes decoded actions to the service.
#[derive(Debug, Clone)]
pub struct ActionDispatcher {
    service: BucketService,
    tokens: Option<TokenAuthority>,
    token_ttl: Duration,
    shutdown: ShutdownHandle,
}

impl ActionDispatcher {
    pub fn new(
        service: BucketService,
        tokens: Option<TokenAuthority>,
        token_ttl: Duration,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            service,
            tokens,
            token_ttl,
            shutdown,
        }
    }

    /// Decode and run in one step.
    pub async fn dispatch_raw(&self, action_type: &str, body: &[u8]) -> Result<Vec<Bytes>> {
        let action = Action::decode(action_type, body)?;
        self.dispatch(action).await
    }

    pub async fn dispatch(&self, action: Action) -> Result<Vec<Bytes>> {
        let name = action.name();
        debug!(action = name, "Dispatching action");

        match action {
            Action::Ping => Ok(vec![Bytes::from_static(PONG)]),
            Action::List(request) => {
                let infos = self.service.list(&request).await?;
                infos
                    .iter()
                    .map(|info| encode_json(&DatasetListing::from(info)))
                    .collect()
            }
            Action::Buckets => {
                let buckets = self.service.store().list_buckets().await?;
                Ok(vec![encode_json(&buckets)?])
            }
            Action::Delete(request) => {
                let deleted = self
                    .service
                    .store()
                    .delete_dataset(&request.bucket, &request.dataset, request.missing_ok)
                    .await?;
                let message = if deleted {
                    format!("deleted {}", request.dataset)
                } else {
                    format!("{} was not present", request.dataset)
                };
                Ok(vec![encode_json(&DeleteOutcome {
                    success: true,
                    deleted,
                    message,
                })?])
            }
            Action::DeleteBucket(request) => {
                let deletion = self
                    .service
                    .store()
                    .delete_bucket(&request.bucket, request.mode)
                    .await?;
                let message = match request.mode {
                    DeleteMode::DeleteContents => format!("bucket {} emptied", request.bucket),
                    DeleteMode::Default | DeleteMode::DeleteAll => {
                        format!("bucket {} deleted", request.bucket)
                    }
                };
                Ok(vec![encode_json(&DeleteBucketOutcome {
                    message,
                    datasets_removed: deletion.datasets_removed,
                    bucket_removed: deletion.bucket_removed,
                })?])
            }
            Action::Resample(request) => {
                let report = self.service.resample(&request).await?;
                Ok(vec![encode_json(&report)?])
            }
            Action::GenerateAdminToken(request) => {
                let tokens = self.tokens.as_ref().ok_or_else(|| {
                    Error::Config("server must be started with a secret to use tokens".to_string())
                })?;
                let ttl = request
                    .ttl_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.token_ttl);
                let token = tokens.issue(&request.claims, ttl)?;
                info!(ttl_secs = ttl.as_secs(), "Issued admin token");
                Ok(vec![encode_json(&TokenOutcome { token })?])
            }
            Action::Shutdown => {
                info!("Shutdown requested by action");
                self.shutdown.trigger();
                Ok(vec![encode_json(&[SHUTDOWN_ACK])?])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BucketStore;
    use tempfile::tempdir;

    async fn new_dispatcher(tokens: Option<TokenAuthority>) -> (tempfile::TempDir, ActionDispatcher) {
        let dir = tempdir().unwrap();
        let store = BucketStore::open(dir.path()).await.unwrap();
        let dispatcher = ActionDispatcher::new(
            BucketService::new(store),
            tokens,
            Duration::from_secs(3600),
            ShutdownHandle::new(),
        );
        (dir, dispatcher)
    }

    #[test]
    fn test_unknown_action() {
        let err = Action::decode("explode", b"").unwrap_err();
        assert!(matches!(err, Error::UnsupportedAction(_)));
    }

    #[test]
    fn test_malformed_payloads() {
        let cases: [(&str, &[u8]); 5] = [
            ("delete", b""),
            ("delete", br#"{"bucket":"b"}"#),
            ("delete_bucket", br#"{"bucket":"b","mode":"nuke"}"#),
            ("ping", br#"{"extra":1}"#),
            ("list", br#"{"bucket":"../x"}"#),
        ];
        for (action, body) in cases {
            let err = Action::decode(action, body).unwrap_err();
            assert!(matches!(err, Error::MalformedRequest(_)), "{action}: {err}");
        }
    }

    #[test]
    fn test_every_advertised_action_decodes() {
        for (name, _) in ACTION_TYPES {
            let body: &[u8] = match *name {
                "delete" => &br#"{"bucket":"b","dataset":"x"}"#[..],
                "delete_bucket" => &br#"{"bucket":"b"}"#[..],
                "resample" => &br#"{"source":{"bucket":"a","dataset":"x"},"target":{"bucket":"a","dataset":"y"},"sql":"SELECT 1"}"#[..],
                _ => &b""[..],
            };
            let action = Action::decode(name, body).unwrap();
            assert_eq!(action.name(), *name);
            assert_eq!(Action::decode(name, &action.body().unwrap()).unwrap(), action);
        }
    }

    #[tokio::test]
    async fn test_ping_and_buckets() {
        let (_dir, dispatcher) = new_dispatcher(None).await;
        let out = dispatcher.dispatch(Action::Ping).await.unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"pong")]);

        let out = dispatcher.dispatch(Action::Buckets).await.unwrap();
        assert_eq!(out, vec![Bytes::from_static(b"[]")]);
    }

    #[tokio::test]
    async fn test_token_requires_secret() {
        let (_dir, dispatcher) = new_dispatcher(None).await;
        let err = dispatcher
            .dispatch(Action::GenerateAdminToken(TokenRequest::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let tokens = TokenAuthority::new("s3cret", "test").unwrap();
        let (_dir, dispatcher) = new_dispatcher(Some(tokens.clone())).await;
        let out = dispatcher
            .dispatch(Action::GenerateAdminToken(TokenRequest::default()))
            .await
            .unwrap();
        let outcome: TokenOutcome = serde_json::from_slice(&out[0]).unwrap();
        assert!(tokens.verify(&outcome.token).is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_triggers_handle() {
        let (_dir, dispatcher) = new_dispatcher(None).await;
        let handle = dispatcher.shutdown.clone();
        assert!(!handle.is_triggered());

        let out = dispatcher.dispatch(Action::Shutdown).await.unwrap();
        let ack: Vec<String> = serde_json::from_slice(&out[0]).unwrap();
        assert_eq!(ack, vec![SHUTDOWN_ACK]);
        assert!(handle.is_triggered());
    }
}
