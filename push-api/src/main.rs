//! C7: HTTP transport for the lifecycle-action subset of the admin API
//! (`pauseJob`/`resumeJob`/`stopJob`/`getJob`).
use axum::Router;
use envconfig::Envconfig;

use push_common::db::JobRepo;
use push_common::metrics::{serve, setup_metrics_router};
use push_common::queue::BatchQueue;

use push_api::config::Config;
use push_api::handlers;
use push_api::handlers::job::JobState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to postgres");

    let redis_client = redis::Client::open(config.redis_url.clone()).expect("invalid redis url");
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .expect("failed to connect to redis");

    let state = JobState {
        job_repo: JobRepo::new(pool),
        batch_queue: BatchQueue::new(redis_conn),
    };

    let app = handlers::add_routes(Router::new(), state).merge(setup_metrics_router());

    match serve(app, &config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start push-api http server, {}", e),
    }
}
