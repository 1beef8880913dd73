//! # Shoots
//!
//! A bucket-oriented dataset store served over Arrow Flight.
//!
//! Datasets are Parquet files grouped into buckets on a local filesystem.
//! Clients upload and download them as Arrow record batches, filter or query
//! them with SQL on the way out, and manage them through Flight actions.
//!
//! ## Architecture
//!
//! - **Storage**: bucket directories, name validation, staged atomic writes
//! - **Query**: plain Parquet scans, or DataFusion for `where`/SQL tickets
//! - **Resample**: fixed-window time-series aggregation
//! - **API**: `FlightService` implementation, action dispatch, admin tokens

pub mod api;
pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod query;
pub mod resample;
pub mod server;
pub mod service;
pub mod storage;
pub mod telemetry;

mod error;

pub use error::{Error, ErrorKind, Result};

/// Commonly used types.
pub mod prelude {
    pub use crate::client::ShootsClient;
    pub use crate::codec::{DatasetDescriptor, DatasetRef, DatasetTicket, Filter, ListRequest};
    pub use crate::config::ServerConfig;
    pub use crate::resample::{AggFunc, ResampleRule};
    pub use crate::server::{ShootsServer, ShutdownHandle};
    pub use crate::storage::{BucketStore, DeleteMode, WriteMode};
    pub use crate::{Error, ErrorKind, Result};
}
