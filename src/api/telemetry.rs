//! gRPC request metrics.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Unit};
use opentelemetry::KeyValue;
use std::sync::OnceLock;
use tonic::Code;

struct GrpcInstruments {
    request_count: Counter<u64>,
    request_duration_seconds: Histogram<f64>,
    request_errors: Counter<u64>,
}

fn grpc_instruments() -> &'static GrpcInstruments {
    static INSTRUMENTS: OnceLock<GrpcInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("shoots.api.grpc");
        GrpcInstruments {
            request_count: meter
                .u64_counter("rpc.server.request.count")
                .with_description("Total number of gRPC requests handled by the Shoots server")
                .init(),
            request_duration_seconds: meter
                .f64_histogram("rpc.server.duration")
                .with_description("gRPC request duration")
                .with_unit(Unit::new("s"))
                .init(),
            request_errors: meter
                .u64_counter("rpc.server.request.errors")
                .with_description("gRPC requests with non-OK status")
                .init(),
        }
    })
}

fn grpc_attributes(service: &str, method: &str, code: Code) -> Vec<KeyValue> {
    vec![
        KeyValue::new("rpc.system", "grpc"),
        KeyValue::new("rpc.service", service.to_string()),
        KeyValue::new("rpc.method", method.to_string()),
        KeyValue::new("rpc.grpc.status_code", code as i64),
    ]
}

/// Record gRPC request metrics using OTel semantic fields.
pub fn record_grpc_request(service: &str, method: &str, code: Code, duration_seconds: f64) {
    let attrs = grpc_attributes(service, method, code);
    let instruments = grpc_instruments();
    instruments.request_count.add(1, &attrs);
    instruments
        .request_duration_seconds
        .record(duration_seconds, &attrs);
    if code != Code::Ok {
        instruments.request_errors.add(1, &attrs);
    }
}
