//! Flight client for a Shoots server
//!
//! A thin typed wrapper over `FlightServiceClient`: every action has a method
//! that encodes its payload and decodes its result record, and failed calls
//! come back as the same [`Error`] kinds the server raised.

use crate::api::grpc::flight_error;
use crate::api::{status_to_error, AUTHORIZATION_HEADER};
use crate::codec::{
    DatasetDescriptor, DatasetRef, DatasetTicket, DeleteBucketRequest, DeleteRequest, ListRequest,
    ResampleRequest, TokenRequest,
};
use crate::dispatch::{
    Action, DatasetListing, DeleteBucketOutcome, DeleteOutcome, TokenOutcome, PONG, SHUTDOWN_ACK,
};
use crate::service::{PutReport, ResampleReport};
use crate::storage::DeleteMode;
use crate::{Error, Result};

use arrow_array::RecordBatch;
use arrow_flight::decode::FlightRecordBatchStream;
use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_client::FlightServiceClient;
use arrow_flight::{Criteria, FlightData, FlightDescriptor, FlightInfo, HandshakeRequest};
use arrow_schema::{Schema, SchemaRef};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tonic::Request;

#[derive(Debug, Clone)]
pub struct ShootsClient {
    inner: FlightServiceClient<Channel>,
    token: Option<MetadataValue<Ascii>>,
}

impl ShootsClient {
    /// Connect to `grpc://host:port` (or `http://host:port`).
    pub async fn connect(location: &str) -> Result<Self> {
        let endpoint = endpoint(location)?;
        Self::from_endpoint(endpoint).await
    }

    /// Connect over TLS, trusting `ca_pem`.
    pub async fn connect_tls(location: &str, ca_pem: &[u8], domain: &str) -> Result<Self> {
        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca_pem))
            .domain_name(domain);
        let endpoint = endpoint(location)?
            .tls_config(tls)
            .map_err(|e| Error::Config(format!("invalid TLS configuration: {e}")))?;
        Self::from_endpoint(endpoint).await
    }

    async fn from_endpoint(endpoint: Endpoint) -> Result<Self> {
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| Error::Internal(format!("failed to connect: {e}")))?;
        Ok(Self {
            inner: FlightServiceClient::new(channel)
                .max_decoding_message_size(usize::MAX)
                .max_encoding_message_size(usize::MAX),
            token: None,
        })
    }

    /// Send `token` as a bearer credential on every call.
    pub fn with_token(mut self, token: &str) -> Result<Self> {
        let value = format!("Bearer {token}")
            .parse::<MetadataValue<Ascii>>()
            .map_err(|_| Error::MalformedRequest("token is not valid header text".to_string()))?;
        self.token = Some(value);
        Ok(self)
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        if let Some(token) = &self.token {
            request
                .metadata_mut()
                .insert(AUTHORIZATION_HEADER, token.clone());
        }
        request
    }

    /// Present a token through the Flight handshake.
    pub async fn handshake(&mut self, token: &str) -> Result<()> {
        let hello = HandshakeRequest {
            protocol_version: 0,
            payload: Bytes::from(token.to_string()),
        };
        let mut responses = self
            .inner
            .handshake(futures::stream::iter(vec![hello]))
            .await
            .map_err(|s| status_to_error(&s))?
            .into_inner();
        responses
            .message()
            .await
            .map_err(|s| status_to_error(&s))?
            .ok_or_else(|| Error::Internal("empty handshake response".to_string()))?;
        Ok(())
    }

    /// Upload `batches` under the descriptor's dataset and write mode.
    pub async fn put(
        &mut self,
        descriptor: &DatasetDescriptor,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<PutReport> {
        let frames: Vec<FlightData> = FlightDataEncoderBuilder::new()
            .with_schema(schema)
            .with_flight_descriptor(Some(descriptor.to_flight()?))
            .build(futures::stream::iter(batches.into_iter().map(Ok)))
            .try_collect()
            .await
            .map_err(flight_error)?;

        let request = self.request(futures::stream::iter(frames));
        let mut results = self
            .inner
            .do_put(request)
            .await
            .map_err(|s| status_to_error(&s))?
            .into_inner();
        let result = results
            .message()
            .await
            .map_err(|s| status_to_error(&s))?
            .ok_or_else(|| Error::Internal("DoPut returned no result".to_string()))?;
        decode_record("put", &result.app_metadata)
    }

    /// Fetch a dataset, or the result of a filtered ticket.
    /// Start a DoGet and hand back the batches as they arrive.
    ///
    /// Call errors surface here; errors raised mid-stream come out of the
    /// stream as `FlightError`s.
    pub async fn get_stream(&mut self, ticket: &DatasetTicket) -> Result<FlightRecordBatchStream> {
        let request = self.request(arrow_flight::Ticket::new(ticket.to_bytes()?));
        let frames = self
            .inner
            .do_get(request)
            .await
            .map_err(|s| status_to_error(&s))?
            .into_inner()
            .map_err(FlightError::from);
        Ok(FlightRecordBatchStream::new_from_flight_data(frames))
    }

    pub async fn get(&mut self, ticket: &DatasetTicket) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let mut stream = self.get_stream(ticket).await?;
        let mut batches = Vec::new();
        while let Some(batch) = stream.next().await {
            batches.push(batch.map_err(flight_error)?);
        }
        let schema = stream
            .schema()
            .cloned()
            .ok_or_else(|| Error::Internal("DoGet stream carried no schema".to_string()))?;
        Ok((schema, batches))
    }

    pub async fn list_flights(&mut self, request: &ListRequest) -> Result<Vec<FlightInfo>> {
        let criteria = Criteria {
            expression: crate::codec::encode_json(request)?,
        };
        let request = self.request(criteria);
        self.inner
            .list_flights(request)
            .await
            .map_err(|s| status_to_error(&s))?
            .into_inner()
            .try_collect()
            .await
            .map_err(|s| status_to_error(&s))
    }

    pub async fn flight_info(&mut self, dataset: &DatasetRef) -> Result<FlightInfo> {
        let request = self.request(FlightDescriptor::new_path(dataset.to_path()));
        Ok(self
            .inner
            .get_flight_info(request)
            .await
            .map_err(|s| status_to_error(&s))?
            .into_inner())
    }

    pub async fn schema(&mut self, dataset: &DatasetRef) -> Result<SchemaRef> {
        let request = self.request(FlightDescriptor::new_path(dataset.to_path()));
        let result = self
            .inner
            .get_schema(request)
            .await
            .map_err(|s| status_to_error(&s))?
            .into_inner();
        Ok(Arc::new(Schema::try_from(&result)?))
    }

    /// Run an action and return its raw result records.
    pub async fn action(&mut self, action: &Action) -> Result<Vec<Bytes>> {
        let request = self.request(action.to_flight()?);
        self.inner
            .do_action(request)
            .await
            .map_err(|s| status_to_error(&s))?
            .into_inner()
            .map_ok(|result| result.body)
            .try_collect()
            .await
            .map_err(|s| status_to_error(&s))
    }

    async fn single<T: DeserializeOwned>(&mut self, action: Action) -> Result<T> {
        let name = action.name();
        let records = self.action(&action).await?;
        match records.as_slice() {
            [record] => decode_record(name, record),
            other => Err(Error::Internal(format!(
                "{name} returned {} result records, expected 1",
                other.len()
            ))),
        }
    }

    pub async fn ping(&mut self) -> Result<()> {
        let records = self.action(&Action::Ping).await?;
        match records.as_slice() {
            [record] if record.as_ref() == PONG => Ok(()),
            _ => Err(Error::Internal("unexpected ping reply".to_string())),
        }
    }

    pub async fn list(&mut self, request: ListRequest) -> Result<Vec<DatasetListing>> {
        let records = self.action(&Action::List(request)).await?;
        records
            .iter()
            .map(|record| decode_record("list", record))
            .collect()
    }

    pub async fn buckets(&mut self) -> Result<Vec<String>> {
        self.single(Action::Buckets).await
    }

    pub async fn delete(
        &mut self,
        bucket: &str,
        dataset: &str,
        missing_ok: bool,
    ) -> Result<DeleteOutcome> {
        self.single(Action::Delete(DeleteRequest {
            bucket: bucket.to_string(),
            dataset: dataset.to_string(),
            missing_ok,
        }))
        .await
    }

    pub async fn delete_bucket(
        &mut self,
        bucket: &str,
        mode: DeleteMode,
    ) -> Result<DeleteBucketOutcome> {
        self.single(Action::DeleteBucket(DeleteBucketRequest {
            bucket: bucket.to_string(),
            mode,
        }))
        .await
    }

    pub async fn resample(&mut self, request: ResampleRequest) -> Result<ResampleReport> {
        self.single(Action::Resample(request)).await
    }

    pub async fn generate_admin_token(
        &mut self,
        claims: Map<String, Value>,
        ttl_secs: Option<u64>,
    ) -> Result<String> {
        let outcome: TokenOutcome = self
            .single(Action::GenerateAdminToken(TokenRequest { claims, ttl_secs }))
            .await?;
        Ok(outcome.token)
    }

    /// Ask the server to stop.
    pub async fn shutdown(&mut self) -> Result<()> {
        let ack: Vec<String> = self.single(Action::Shutdown).await?;
        if ack.iter().any(|line| line == SHUTDOWN_ACK) {
            Ok(())
        } else {
            Err(Error::Internal(format!("unexpected shutdown reply {ack:?}")))
        }
    }
}

fn endpoint(location: &str) -> Result<Endpoint> {
    let uri = if let Some(rest) = location.strip_prefix("grpc+tls://") {
        format!("https://{rest}")
    } else if let Some(rest) = location.strip_prefix("grpc://") {
        format!("http://{rest}")
    } else {
        location.to_string()
    };
    Endpoint::from_shared(uri)
        .map_err(|e| Error::Config(format!("invalid location '{location}': {e}")))
}

fn decode_record<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Internal(format!("invalid {what} result record: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_schemes() {
        assert_eq!(
            endpoint("grpc://127.0.0.1:8081").unwrap().uri().to_string(),
            "http://127.0.0.1:8081/"
        );
        assert_eq!(
            endpoint("grpc+tls://example.com:443").unwrap().uri().to_string(),
            "https://example.com:443/"
        );
        assert!(endpoint("not a uri").is_err());
    }
}
