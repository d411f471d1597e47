//! C5: renders templates and produces envelopes for due batches.
use std::future::ready;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;

use health::HealthRegistry;
use push_common::clock::SystemClock;
use push_common::db::{JobRepo, TemplateRepo};
use push_common::kafka::{create_producer, KafkaSettings};
use push_common::metrics::{serve, setup_metrics_router};
use push_common::queue::BatchQueue;
use push_common::ratelimit::GatewayRateLimiter;
use push_common::retry::RetryPolicy;
use push_common::template_cache::TemplateCache;

use push_processor::config::Config;
use push_processor::error::ProcessorError;
use push_processor::processor::ProcessorWorker;

#[tokio::main]
async fn main() -> Result<(), ProcessorError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("batch_processor".to_string(), time::Duration::seconds(60))
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

    let redis_client = redis::Client::open(config.redis_url.clone()).expect("invalid redis url");
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .expect("failed to connect to redis");

    let kafka_settings = KafkaSettings {
        hosts: config.kafka_hosts.clone(),
        tls: config.kafka_tls,
        ..Default::default()
    };
    let producer = create_producer(&kafka_settings).expect("failed to construct kafka producer");

    let templates = TemplateCache::new(
        TemplateRepo::new(pool.clone()),
        config.template_cache_ttl.0,
    );

    let default_rate = std::num::NonZeroU32::new(config.default_rate_per_second)
        .unwrap_or(push_common::ratelimit::default_quota());

    let worker = ProcessorWorker::new(
        &config.worker_name,
        JobRepo::new(pool),
        templates,
        BatchQueue::new(redis_conn),
        producer,
        GatewayRateLimiter::new(),
        default_rate,
        SystemClock,
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
    "push processor"
}
