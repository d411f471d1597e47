//! C4: expands jobs popped off the produce-trigger list into batches.
use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;

use health::HealthRegistry;
use push_common::clock::SystemClock;
use push_common::db::{AppRepo, JobRepo};
use push_common::metrics::{serve, setup_metrics_router};
use push_common::object_store::S3ObjectStore;
use push_common::queue::BatchQueue;
use push_common::retry::RetryPolicy;

use push_producer::config::Config;
use push_producer::producer::ProducerWorker;

#[tokio::main]
async fn main() -> Result<(), push_producer::error::ProducerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("batch_producer".to_string(), time::Duration::seconds(60))
        .await;

    let retry_policy = RetryPolicy::new(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
        Some(config.retry_policy.maximum_interval.0),
        config.retry_policy.max_attempts,
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to postgres");

    let redis_client = redis::Client::open(config.redis_url.clone())
        .expect("invalid redis url");
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .expect("failed to connect to redis");

    let aws_config = aws_config::load_from_env().await;
    let s3_client = aws_sdk_s3::Client::new(&aws_config);

    let worker = ProducerWorker::new(
        &config.worker_name,
        JobRepo::new(pool.clone()),
        AppRepo::new(pool),
        BatchQueue::new(redis_conn),
        Arc::new(S3ObjectStore::new(s3_client)),
        config.s3_bucket.as_str(),
        SystemClock,
        config.batch_size,
        config.default_db_page_size,
        config.poll_interval.0,
        retry_policy,
        worker_liveness,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .merge(setup_metrics_router());
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    worker.run().await;

    Ok(())
}

pub async fn index() -> &'static str {
    "push producer"
}
