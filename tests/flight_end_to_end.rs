//! End-to-end tests against an in-process Flight server
//!
//! Each test binds an ephemeral port, serves a fresh bucket directory and
//! drives the server through `ShootsClient`.

use shoots::client::ShootsClient;
use shoots::codec::{DatasetDescriptor, DatasetRef, DatasetTicket, Filter, ListRequest};
use shoots::codec::{ResampleMethod, ResampleRequest};
use shoots::config::ServerConfig;
use shoots::resample::{AggFunc, ResampleRule, Window};
use shoots::server::{ShootsServer, ShutdownHandle};
use shoots::storage::{DeleteMode, WriteMode};
use shoots::{ErrorKind, Result};

use arrow_array::cast::AsArray;
use arrow_array::types::{Int64Type, TimestampSecondType};
use arrow_array::{Int64Array, RecordBatch, StringArray, TimestampSecondArray};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use anyhow::anyhow;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct TestServer {
    _dir: TempDir,
    location: String,
    admin_token: Option<String>,
    shutdown: ShutdownHandle,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    async fn start(secret: Option<&str>) -> anyhow::Result<Self> {
        Self::start_with_grace(secret, 1).await
    }

    async fn start_with_grace(secret: Option<&str>, grace_secs: u64) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = ServerConfig {
            port: addr.port(),
            bucket_dir: dir.path().join("buckets"),
            secret: secret.map(str::to_string),
            shutdown_grace_secs: grace_secs,
            ..ServerConfig::default()
        };
        let server = ShootsServer::new(config).await?;
        let admin_token = server.admin_token()?;
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.serve_with_listener(listener));

        Ok(Self {
            _dir: dir,
            location: format!("grpc://{addr}"),
            admin_token,
            shutdown,
            task,
        })
    }

    async fn client(&self) -> ShootsClient {
        let client = ShootsClient::connect(&self.location).await.unwrap();
        match &self.admin_token {
            Some(token) => client.with_token(token).unwrap(),
            None => client,
        }
    }

    async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .map_err(|_| anyhow!("server did not stop within timeout"))???;
        Ok(())
    }
}

fn prices(values: Vec<i64>) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("symbol", DataType::Utf8, false),
        Field::new("price", DataType::Int64, false),
    ]));
    let symbols: Vec<&str> = values.iter().map(|_| "ACME").collect();
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(symbols)),
            Arc::new(Int64Array::from(values)),
        ],
    )
    .unwrap()
}

async fn put(
    client: &mut ShootsClient,
    bucket: &str,
    dataset: &str,
    mode: WriteMode,
    batch: RecordBatch,
) -> Result<shoots::service::PutReport> {
    let descriptor = DatasetDescriptor::new(DatasetRef::new(bucket, dataset), mode);
    client.put(&descriptor, batch.schema(), vec![batch]).await
}

fn price_column(batches: &[RecordBatch]) -> Vec<i64> {
    batches
        .iter()
        .flat_map(|b| {
            b.column_by_name("price")
                .unwrap()
                .as_primitive::<Int64Type>()
                .values()
                .to_vec()
        })
        .collect()
}

#[tokio::test]
async fn test_put_get_and_write_modes() {
    let server = TestServer::start(None).await.unwrap();
    let mut client = server.client().await;
    client.ping().await.unwrap();

    let report = put(&mut client, "b1", "x", WriteMode::Error, prices(vec![1, 2, 3]))
        .await
        .unwrap();
    assert_eq!(report.rows_written, 3);

    let ticket = DatasetTicket::new(DatasetRef::new("b1", "x"));
    let (schema, batches) = client.get(&ticket).await.unwrap();
    assert_eq!(schema.fields().len(), 2);
    assert_eq!(price_column(&batches), vec![1, 2, 3]);

    let err = put(&mut client, "b1", "x", WriteMode::Error, prices(vec![4]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    put(&mut client, "b1", "x", WriteMode::Append, prices(vec![4, 5]))
        .await
        .unwrap();
    let (_, batches) = client.get(&ticket).await.unwrap();
    assert_eq!(price_column(&batches), vec![1, 2, 3, 4, 5]);

    put(&mut client, "b1", "x", WriteMode::Overwrite, prices(vec![9]))
        .await
        .unwrap();
    let (_, batches) = client.get(&ticket).await.unwrap();
    assert_eq!(price_column(&batches), vec![9]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_append_schema_mismatch_is_rejected() {
    let server = TestServer::start(None).await.unwrap();
    let mut client = server.client().await;
    put(&mut client, "b1", "x", WriteMode::Overwrite, prices(vec![1, 2]))
        .await
        .unwrap();

    let other = RecordBatch::try_new(
        Arc::new(Schema::new(vec![Field::new("volume", DataType::Int64, false)])),
        vec![Arc::new(Int64Array::from(vec![10]))],
    )
    .unwrap();
    let err = put(&mut client, "b1", "x", WriteMode::Append, other)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let (_, batches) = client
        .get(&DatasetTicket::new(DatasetRef::new("b1", "x")))
        .await
        .unwrap();
    assert_eq!(price_column(&batches), vec![1, 2]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_filtered_and_sql_tickets() {
    let server = TestServer::start(None).await.unwrap();
    let mut client = server.client().await;
    put(&mut client, "b1", "prices", WriteMode::Error, prices(vec![1, 5, 2, 8]))
        .await
        .unwrap();
    let dataset = DatasetRef::new("b1", "prices");

    let ticket = DatasetTicket::new(dataset.clone()).with_filter(Filter::Where("price > 2".to_string()));
    let (_, batches) = client.get(&ticket).await.unwrap();
    assert_eq!(price_column(&batches), vec![5, 8]);

    let ticket = DatasetTicket::new(dataset.clone()).with_filter(Filter::Sql(
        "SELECT max(price) AS price FROM prices".to_string(),
    ));
    let (_, batches) = client.get(&ticket).await.unwrap();
    assert_eq!(price_column(&batches), vec![8]);

    let ticket = DatasetTicket::new(dataset).with_filter(Filter::Where("missing_col = 1".to_string()));
    let err = client.get(&ticket).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Query);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_listing_and_deletes() {
    let server = TestServer::start(None).await.unwrap();
    let mut client = server.client().await;
    for (bucket, dataset) in [("b1", "x"), ("b1", "y"), ("b2", "z")] {
        put(&mut client, bucket, dataset, WriteMode::Error, prices(vec![1]))
            .await
            .unwrap();
    }

    assert_eq!(client.buckets().await.unwrap(), vec!["b1", "b2"]);

    let listed: Vec<String> = client
        .list(ListRequest::bucket("b1"))
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.dataset)
        .collect();
    assert_eq!(listed, vec!["x", "y"]);

    let flights = client.list_flights(&ListRequest::default()).await.unwrap();
    assert_eq!(flights.len(), 3);
    assert!(flights.iter().all(|f| f.total_records == 1));

    let info = client.flight_info(&DatasetRef::new("b2", "z")).await.unwrap();
    assert_eq!(
        info.flight_descriptor.unwrap().path,
        vec!["b2".to_string(), "z".to_string()]
    );
    let schema = client.schema(&DatasetRef::new("b2", "z")).await.unwrap();
    assert_eq!(schema.field(1).name(), "price");

    let err = client.delete("b1", "nope", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let outcome = client.delete("b1", "nope", true).await.unwrap();
    assert!(outcome.success && !outcome.deleted);

    let outcome = client.delete("b1", "x", false).await.unwrap();
    assert!(outcome.deleted);

    let err = client.delete_bucket("b1", DeleteMode::Default).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let outcome = client.delete_bucket("b1", DeleteMode::DeleteAll).await.unwrap();
    assert!(outcome.bucket_removed);
    assert_eq!(outcome.datasets_removed, 1);
    assert_eq!(client.buckets().await.unwrap(), vec!["b2"]);

    let err = client.list(ListRequest::bucket("b1")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_resample_through_action() {
    let server = TestServer::start(None).await.unwrap();
    let mut client = server.client().await;

    let schema = Arc::new(Schema::new(vec![
        Field::new("ts", DataType::Timestamp(TimeUnit::Second, None), false),
        Field::new("v", DataType::Int64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(TimestampSecondArray::from(vec![0, 30, 60, 90])),
            Arc::new(Int64Array::from(vec![1, 2, 3, 4])),
        ],
    )
    .unwrap();
    put(&mut client, "ts", "raw", WriteMode::Error, batch).await.unwrap();

    let rule = ResampleRule::new("ts", Window::from_secs(60).unwrap()).with_agg("v", AggFunc::Sum);
    let report = client
        .resample(ResampleRequest {
            source: DatasetRef::new("ts", "raw"),
            target: DatasetRef::new("ts", "minute"),
            method: ResampleMethod::Rule(rule),
            mode: WriteMode::Overwrite,
        })
        .await
        .unwrap();
    assert_eq!(report.source_rows, 4);
    assert_eq!(report.target_rows, 2);

    let (_, batches) = client
        .get(&DatasetTicket::new(DatasetRef::new("ts", "minute")))
        .await
        .unwrap();
    let batch = &batches[0];
    assert_eq!(
        batch.column(0).as_primitive::<TimestampSecondType>().values().to_vec(),
        vec![0, 60]
    );
    assert_eq!(
        batch.column(1).as_primitive::<Int64Type>().values().to_vec(),
        vec![3, 7]
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_authentication_required_with_secret() {
    let server = TestServer::start(Some("s3cret")).await.unwrap();

    let mut anonymous = ShootsClient::connect(&server.location).await.unwrap();
    let err = anonymous.ping().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthenticated);
    assert!(anonymous.handshake("not-a-token").await.is_err());

    let token = server.admin_token.clone().unwrap();
    anonymous.handshake(&token).await.unwrap();

    let mut client = server.client().await;
    client.ping().await.unwrap();
    let issued = client
        .generate_admin_token(serde_json::Map::new(), Some(60))
        .await
        .unwrap();

    let mut second = ShootsClient::connect(&server.location)
        .await
        .unwrap()
        .with_token(&issued)
        .unwrap();
    second.ping().await.unwrap();

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_token_action_without_secret() {
    let server = TestServer::start(None).await.unwrap();
    let mut client = server.client().await;
    let err = client
        .generate_admin_token(serde_json::Map::new(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_action_stops_server() {
    let server = TestServer::start(None).await.unwrap();
    let mut client = server.client().await;
    client.ping().await.unwrap();
    client.shutdown().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), server.task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
    assert!(server.shutdown.is_triggered());

    let mut late = ShootsClient::connect(&server.location).await;
    match &mut late {
        Ok(client) => assert!(client.ping().await.is_err()),
        Err(_) => {}
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overwrite_never_mixes_versions() {
    let server = TestServer::start(None).await.unwrap();
    let mut writer = server.client().await;
    put(&mut writer, "b", "x", WriteMode::Overwrite, prices(vec![1; 3_000]))
        .await
        .unwrap();

    let mut reader = server.client().await;
    let reads = tokio::spawn(async move {
        let ticket = DatasetTicket::new(DatasetRef::new("b", "x"));
        let mut seen = [0usize; 2];
        for _ in 0..40 {
            let (_, batches) = reader.get(&ticket).await?;
            let column = price_column(&batches);
            let version = column[0];
            assert!(column.iter().all(|p| *p == version), "mixed read: {version}");
            match version {
                1 => {
                    assert_eq!(column.len(), 3_000);
                    seen[0] += 1;
                }
                2 => {
                    assert_eq!(column.len(), 5_000);
                    seen[1] += 1;
                }
                other => panic!("unexpected price {other}"),
            }
        }
        Ok::<_, shoots::Error>(seen)
    });

    for i in 0..20 {
        let batch = if i % 2 == 0 {
            prices(vec![2; 5_000])
        } else {
            prices(vec![1; 3_000])
        };
        put(&mut writer, "b", "x", WriteMode::Overwrite, batch)
            .await
            .unwrap();
    }

    let seen = reads.await.unwrap().unwrap();
    assert_eq!(seen[0] + seen[1], 40);
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_drains_inflight_get() {
    let server = TestServer::start_with_grace(None, 10).await.unwrap();
    let mut client = server.client().await;
    let total = 200_000usize;
    let values: Vec<i64> = (0..total as i64).collect();
    put(&mut client, "b", "big", WriteMode::Error, prices(values))
        .await
        .unwrap();

    let ticket = DatasetTicket::new(DatasetRef::new("b", "big"));
    let mut stream = client.get_stream(&ticket).await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert!(first.num_rows() < total);
    let mut rows = first.num_rows();

    let mut admin = server.client().await;
    admin.shutdown().await.unwrap();

    let mut last = None;
    while let Some(batch) = stream.next().await {
        let batch = batch.unwrap();
        rows += batch.num_rows();
        last = Some(batch);
    }
    assert_eq!(rows, total);
    let last = last.unwrap();
    let column = last
        .column_by_name("price")
        .unwrap()
        .as_primitive::<Int64Type>();
    assert_eq!(column.value(column.len() - 1), total as i64 - 1);

    tokio::time::timeout(Duration::from_secs(5), server.task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}
