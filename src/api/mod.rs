//! Arrow Flight API
//!
//! All dataset traffic and every administrative action go through the
//! standard `arrow.flight.protocol.FlightService`.

pub mod grpc;
mod telemetry;

pub use grpc::{
    run_flight_server, status_to_error, ErrorDetails, FlightServerOptions, ShootsFlightService,
    AUTHORIZATION_HEADER, AUTH_TOKEN_BIN_HEADER, GRPC_SERVICE_FLIGHT,
};
