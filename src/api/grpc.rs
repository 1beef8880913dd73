//! Arrow Flight gRPC service.

use crate::api::telemetry::record_grpc_request;
use crate::auth::TokenAuthority;
use crate::codec::{DatasetDescriptor, DatasetRef, DatasetTicket, ListRequest};
use crate::dispatch::{Action as ShootsAction, ActionDispatcher, ACTION_TYPES};
use crate::server::ShutdownHandle;
use crate::service::BucketService;
use crate::storage::DatasetInfo;
use crate::{Error, ErrorKind, Result};

use arrow_flight::decode::{DecodedPayload, FlightDataDecoder};
use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::flight_service_server::{FlightService, FlightServiceServer};
use arrow_flight::{
    Action, ActionType, Criteria, Empty, FlightData, FlightDescriptor, FlightEndpoint, FlightInfo,
    HandshakeRequest, HandshakeResponse, PollInfo, PutResult, SchemaAsIpc, SchemaResult, Ticket,
};
use arrow_ipc::writer::IpcWriteOptions;
use bytes::Bytes;
use futures::{Future, Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::metadata::MetadataMap;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{error, info, info_span, warn, Instrument};

type GrpcResult<T> = std::result::Result<T, Status>;
type GrpcStream<T> = Pin<Box<dyn Stream<Item = GrpcResult<T>> + Send + 'static>>;

pub const GRPC_SERVICE_FLIGHT: &str = "arrow.flight.protocol.FlightService";

/// Request header carrying `Bearer <token>`
pub const AUTHORIZATION_HEADER: &str = "authorization";
/// Binary request header carrying the raw token
pub const AUTH_TOKEN_BIN_HEADER: &str = "auth-token-bin";

/// Error details attached to every failed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

fn status_code(kind: ErrorKind) -> Code {
    match kind {
        ErrorKind::MalformedRequest | ErrorKind::Query => Code::InvalidArgument,
        ErrorKind::NotFound => Code::NotFound,
        ErrorKind::Validation | ErrorKind::Config => Code::FailedPrecondition,
        ErrorKind::UnsupportedAction => Code::Unimplemented,
        ErrorKind::Conflict => Code::AlreadyExists,
        ErrorKind::Unauthenticated => Code::Unauthenticated,
        ErrorKind::Internal => Code::Internal,
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        let kind = err.kind();
        let details = ErrorDetails {
            kind: kind.as_str().to_string(),
            message: err.message(),
        };
        let details = serde_json::to_vec(&details).unwrap_or_default();
        Status::with_details(status_code(kind), err.to_string(), Bytes::from(details))
    }
}

/// Rebuild a typed error from a status received over the wire.
pub fn status_to_error(status: &Status) -> Error {
    if let Ok(details) = serde_json::from_slice::<ErrorDetails>(status.details()) {
        if let Some(kind) = ErrorKind::parse(&details.kind) {
            return Error::from_kind(kind, details.message);
        }
    }
    let message = status.message().to_string();
    match status.code() {
        Code::InvalidArgument => Error::MalformedRequest(message),
        Code::NotFound => Error::NotFound(message),
        Code::FailedPrecondition => Error::Validation(message),
        Code::Unimplemented => Error::UnsupportedAction(message),
        Code::AlreadyExists => Error::Conflict(message),
        Code::Unauthenticated => Error::Unauthenticated(message),
        code => Error::Internal(format!("{code:?}: {message}")),
    }
}

/// Map a Flight decode/transport failure onto the taxonomy.
pub(crate) fn flight_error(err: FlightError) -> Error {
    match err {
        FlightError::Tonic(status) => status_to_error(&status),
        FlightError::Arrow(e) => Error::MalformedRequest(format!("invalid Flight data: {e}")),
        FlightError::ProtocolError(msg) | FlightError::DecodeError(msg) => {
            Error::MalformedRequest(format!("invalid Flight data: {msg}"))
        }
        other => Error::Internal(other.to_string()),
    }
}

fn record_grpc_result<T>(method: &'static str, start: Instant, result: &GrpcResult<Response<T>>) {
    let code = match result {
        Ok(_) => Code::Ok,
        Err(status) => status.code(),
    };
    record_grpc_request(
        GRPC_SERVICE_FLIGHT,
        method,
        code,
        start.elapsed().as_secs_f64(),
    );
}

/// Run one Flight call inside a request span and record its outcome.
async fn observe<T, F>(method: &'static str, call: F) -> GrpcResult<Response<T>>
where
    F: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let span = info_span!(
        "grpc.request",
        otel.kind = "server",
        rpc.system = "grpc",
        rpc.service = GRPC_SERVICE_FLIGHT,
        rpc.method = method
    );

    let result = async {
        match call.await {
            Ok(response) => Ok(Response::new(response)),
            Err(err) => {
                match err.kind() {
                    ErrorKind::Internal => error!(method, error = %err, "Flight call failed"),
                    _ => warn!(method, error = %err, "Flight call rejected"),
                }
                Err(Status::from(err))
            }
        }
    }
    .instrument(span)
    .await;

    record_grpc_result(method, start, &result);
    result
}

fn bearer_token(metadata: &MetadataMap) -> Result<String> {
    if let Some(value) = metadata.get(AUTHORIZATION_HEADER) {
        let value = value
            .to_str()
            .map_err(|_| Error::Unauthenticated("authorization header is not ASCII".to_string()))?;
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .ok_or_else(|| {
                Error::Unauthenticated("authorization header must use the Bearer scheme".to_string())
            })?;
        return Ok(token.trim().to_string());
    }
    if let Some(value) = metadata.get_bin(AUTH_TOKEN_BIN_HEADER) {
        let bytes = value
            .to_bytes()
            .map_err(|_| Error::Unauthenticated("auth-token-bin is not valid base64".to_string()))?;
        return String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Unauthenticated("auth-token-bin is not UTF-8".to_string()));
    }
    Err(Error::Unauthenticated("missing credentials".to_string()))
}

fn flight_info(info: &DatasetInfo) -> Result<FlightInfo> {
    let dataset = DatasetRef::new(info.bucket.clone(), info.dataset.clone());
    let ticket = DatasetTicket::new(dataset.clone()).to_bytes()?;
    Ok(FlightInfo::new()
        .try_with_schema(&info.schema)?
        .with_descriptor(FlightDescriptor::new_path(dataset.to_path()))
        .with_endpoint(FlightEndpoint::new().with_ticket(Ticket::new(ticket)))
        .with_total_records(info.num_rows)
        .with_total_bytes(info.size_bytes as i64))
}

fn path_descriptor(descriptor: &FlightDescriptor) -> Result<DatasetRef> {
    if descriptor.path.is_empty() {
        return Err(Error::MalformedRequest(
            "expected a PATH descriptor of [bucket, dataset]".to_string(),
        ));
    }
    DatasetRef::from_path(&descriptor.path)
}

/// Arrow Flight front end for the bucket service.
#[derive(Debug, Clone)]
pub struct ShootsFlightService {
    service: BucketService,
    dispatcher: ActionDispatcher,
    tokens: Option<TokenAuthority>,
}

impl ShootsFlightService {
    pub fn new(
        service: BucketService,
        dispatcher: ActionDispatcher,
        tokens: Option<TokenAuthority>,
    ) -> Self {
        Self {
            service,
            dispatcher,
            tokens,
        }
    }

    /// Check credentials when the server has a secret.
    fn authorize(&self, metadata: &MetadataMap) -> Result<()> {
        match &self.tokens {
            Some(tokens) => tokens.verify(&bearer_token(metadata)?).map(|_| ()),
            None => Ok(()),
        }
    }

    async fn handle_put(&self, mut frames: Streaming<FlightData>) -> Result<PutResult> {
        let first = frames
            .message()
            .await
            .map_err(|status| status_to_error(&status))?
            .ok_or_else(|| Error::MalformedRequest("empty DoPut stream".to_string()))?;
        let descriptor = first.flight_descriptor.as_ref().ok_or_else(|| {
            Error::MalformedRequest("first DoPut message carries no descriptor".to_string())
        })?;
        let descriptor = DatasetDescriptor::from_flight(descriptor)?;

        let frames = futures::stream::iter(std::iter::once(Ok::<_, Status>(first)))
            .chain(frames)
            .map_err(FlightError::from);
        let mut decoder = FlightDataDecoder::new(frames);

        let schema = loop {
            let decoded = decoder
                .next()
                .await
                .ok_or_else(|| Error::MalformedRequest("DoPut stream carries no schema".to_string()))?
                .map_err(flight_error)?;
            match decoded.payload {
                DecodedPayload::Schema(schema) => break schema,
                DecodedPayload::None => continue,
                DecodedPayload::RecordBatch(_) => {
                    return Err(Error::MalformedRequest(
                        "record batch received before schema".to_string(),
                    ));
                }
            }
        };

        let batches = decoder.filter_map(|decoded| async move {
            match decoded {
                Ok(decoded) => match decoded.payload {
                    DecodedPayload::RecordBatch(batch) => Some(Ok(batch)),
                    DecodedPayload::None => None,
                    DecodedPayload::Schema(_) => Some(Err(Error::MalformedRequest(
                        "schema changed mid-stream".to_string(),
                    ))),
                },
                Err(e) => Some(Err(flight_error(e))),
            }
        });

        let report = self
            .service
            .put(&descriptor, schema, Box::pin(batches))
            .await?;
        Ok(PutResult {
            app_metadata: Bytes::from(serde_json::to_vec(&report)?),
        })
    }
}

#[tonic::async_trait]
impl FlightService for ShootsFlightService {
    type HandshakeStream = GrpcStream<HandshakeResponse>;
    type ListFlightsStream = GrpcStream<FlightInfo>;
    type DoGetStream = GrpcStream<FlightData>;
    type DoPutStream = GrpcStream<PutResult>;
    type DoExchangeStream = GrpcStream<FlightData>;
    type DoActionStream = GrpcStream<arrow_flight::Result>;
    type ListActionsStream = GrpcStream<ActionType>;

    async fn handshake(
        &self,
        request: Request<Streaming<HandshakeRequest>>,
    ) -> GrpcResult<Response<Self::HandshakeStream>> {
        observe("Handshake", async {
            let header_token = bearer_token(request.metadata()).ok();
            let mut stream = request.into_inner();
            let hello = stream
                .message()
                .await
                .map_err(|status| status_to_error(&status))?
                .unwrap_or_default();

            if let Some(tokens) = &self.tokens {
                let token = if hello.payload.is_empty() {
                    header_token.ok_or_else(|| {
                        Error::Unauthenticated("handshake carries no token".to_string())
                    })?
                } else {
                    String::from_utf8(hello.payload.to_vec()).map_err(|_| {
                        Error::Unauthenticated("handshake token is not UTF-8".to_string())
                    })?
                };
                tokens.verify(&token)?;
            }

            let response = HandshakeResponse {
                protocol_version: hello.protocol_version,
                payload: hello.payload,
            };
            let out: Self::HandshakeStream =
                Box::pin(futures::stream::iter(vec![Ok::<_, Status>(response)]));
            Ok(out)
        })
        .await
    }

    async fn list_flights(
        &self,
        request: Request<Criteria>,
    ) -> GrpcResult<Response<Self::ListFlightsStream>> {
        observe("ListFlights", async {
            self.authorize(request.metadata())?;
            let list: ListRequest =
                crate::codec::decode_optional_json("criteria", &request.get_ref().expression)?;
            let infos = self.service.list(&list).await?;
            let flights = infos
                .iter()
                .map(flight_info)
                .collect::<Result<Vec<_>>>()?;
            let out: Self::ListFlightsStream =
                Box::pin(futures::stream::iter(flights.into_iter().map(Ok::<_, Status>)));
            Ok(out)
        })
        .await
    }

    async fn get_flight_info(
        &self,
        request: Request<FlightDescriptor>,
    ) -> GrpcResult<Response<FlightInfo>> {
        observe("GetFlightInfo", async {
            self.authorize(request.metadata())?;
            let dataset = path_descriptor(request.get_ref())?;
            flight_info(&self.service.info(&dataset).await?)
        })
        .await
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> GrpcResult<Response<PollInfo>> {
        let start = Instant::now();
        let result = Err(Status::unimplemented("PollFlightInfo is not implemented"));
        record_grpc_result("PollFlightInfo", start, &result);
        result
    }

    async fn get_schema(
        &self,
        request: Request<FlightDescriptor>,
    ) -> GrpcResult<Response<SchemaResult>> {
        observe("GetSchema", async {
            self.authorize(request.metadata())?;
            let dataset = path_descriptor(request.get_ref())?;
            let info = self.service.info(&dataset).await?;
            let options = IpcWriteOptions::default();
            let schema: SchemaResult = SchemaAsIpc::new(&info.schema, &options).try_into()?;
            Ok(schema)
        })
        .await
    }

    async fn do_get(&self, request: Request<Ticket>) -> GrpcResult<Response<Self::DoGetStream>> {
        observe("DoGet", async {
            self.authorize(request.metadata())?;
            let ticket = DatasetTicket::decode(&request.get_ref().ticket)?;
            let scan = self.service.get(&ticket).await?;
            info!(dataset = %ticket.dataset, filtered = ticket.filter.is_some(), "Serving dataset");

            let batches = scan
                .stream
                .map_err(|e| FlightError::Tonic(Status::from(e)));
            let frames = FlightDataEncoderBuilder::new()
                .with_schema(scan.schema)
                .build(batches)
                .map_err(Status::from);
            let out: Self::DoGetStream = Box::pin(frames);
            Ok(out)
        })
        .await
    }

    async fn do_put(
        &self,
        request: Request<Streaming<FlightData>>,
    ) -> GrpcResult<Response<Self::DoPutStream>> {
        observe("DoPut", async {
            self.authorize(request.metadata())?;
            let result = self.handle_put(request.into_inner()).await?;
            let out: Self::DoPutStream =
                Box::pin(futures::stream::iter(vec![Ok::<_, Status>(result)]));
            Ok(out)
        })
        .await
    }

    async fn do_exchange(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> GrpcResult<Response<Self::DoExchangeStream>> {
        let start = Instant::now();
        let result = Err(Status::unimplemented("DoExchange is not implemented"));
        record_grpc_result("DoExchange", start, &result);
        result
    }

    async fn do_action(
        &self,
        request: Request<Action>,
    ) -> GrpcResult<Response<Self::DoActionStream>> {
        observe("DoAction", async {
            self.authorize(request.metadata())?;
            let action = request.get_ref();
            let action = ShootsAction::decode(&action.r#type, &action.body)?;
            let name = action.name();
            let records = self.dispatcher.dispatch(action).await?;
            info!(action = name, records = records.len(), "Action complete");

            let out: Self::DoActionStream = Box::pin(futures::stream::iter(
                records
                    .into_iter()
                    .map(|body| Ok::<_, Status>(arrow_flight::Result { body })),
            ));
            Ok(out)
        })
        .await
    }

    async fn list_actions(
        &self,
        request: Request<Empty>,
    ) -> GrpcResult<Response<Self::ListActionsStream>> {
        observe("ListActions", async {
            self.authorize(request.metadata())?;
            let actions = ACTION_TYPES.iter().map(|(name, description)| {
                Ok::<_, Status>(ActionType {
                    r#type: name.to_string(),
                    description: description.to_string(),
                })
            });
            let out: Self::ListActionsStream =
                Box::pin(futures::stream::iter(actions.collect::<Vec<_>>()));
            Ok(out)
        })
        .await
    }
}

/// Transport settings for [`run_flight_server`].
#[derive(Debug, Clone)]
pub struct FlightServerOptions {
    pub tls: Option<Identity>,
    pub max_message_bytes: usize,
    pub shutdown_grace: Duration,
}

/// Serve Flight on `listener` until `shutdown` fires.
///
/// After the signal, new connections are refused and in-flight calls get
/// `shutdown_grace` to finish before the server future is dropped.
pub async fn run_flight_server(
    listener: TcpListener,
    service: ShootsFlightService,
    options: FlightServerOptions,
    shutdown: ShutdownHandle,
) -> Result<()> {
    let mut builder = Server::builder();
    if let Some(identity) = options.tls {
        builder = builder
            .tls_config(ServerTlsConfig::new().identity(identity))
            .map_err(|e| Error::Config(format!("invalid TLS configuration: {e}")))?;
    }

    let flight = FlightServiceServer::new(service)
        .max_decoding_message_size(options.max_message_bytes)
        .max_encoding_message_size(options.max_message_bytes);

    let signal = shutdown.clone();
    let serve = builder
        .add_service(flight)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            signal.wait().await
        });
    tokio::pin!(serve);

    let grace = options.shutdown_grace;
    let deadline = async {
        shutdown.wait().await;
        info!(grace_secs = grace.as_secs_f64(), "Shutdown signalled, draining");
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = &mut serve => {
            result.map_err(|e| Error::Internal(format!("Flight server error: {e}")))?;
        }
        _ = deadline => {
            warn!("Shutdown grace period elapsed, dropping in-flight calls");
        }
    }
    Ok(())
}
