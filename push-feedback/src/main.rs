//! C6: consumes gateway delivery results and updates job progress/failure counters.
use std::future::ready;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;

use health::HealthRegistry;
use push_common::db::{AppRepo, JobRepo};
use push_common::kafka::{create_feedback_consumer, KafkaSettings};
use push_common::metrics::{serve, setup_metrics_router};

use push_feedback::config::Config;
use push_feedback::consumer::FeedbackConsumer;
use push_feedback::error::FeedbackError;

#[tokio::main]
async fn main() -> Result<(), FeedbackError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("feedback_consumer".to_string(), time::Duration::seconds(60))
        .await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to postgres");

    let kafka_settings = KafkaSettings {
        hosts: config.kafka_hosts.clone(),
        tls: config.kafka_tls,
        ..Default::default()
    };
    let consumer = create_feedback_consumer(&kafka_settings, &config.consumer_group, &config.topics())
        .expect("failed to construct kafka feedback consumer");

    let worker = FeedbackConsumer::new(
        &config.worker_name,
        consumer,
        JobRepo::new(pool.clone()),
        AppRepo::new(pool),
        config.buffer_capacity,
        Duration::from_secs(config.shutdown_drain_secs),
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

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    worker.run(shutdown).await;

    Ok(())
}

pub async fn index() -> &'static str {
    "push feedback consumer"
}
