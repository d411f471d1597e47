use axum::{routing, Router};

use crate::handlers::job::{self, JobState};

pub fn add_routes(router: Router, state: JobState) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index))
        .route("/jobs/:id", routing::get(job::get_job))
        .route("/jobs/:id/pause", routing::post(job::pause_job))
        .route("/jobs/:id/resume", routing::post(job::resume_job))
        .route("/jobs/:id/stop", routing::post(job::stop_job))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "push api"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use push_common::db::JobRepo;
    use push_common::queue::BatchQueue;
    use sqlx::PgPool;
    use tower::ServiceExt;

    #[sqlx::test(migrations = "../migrations")]
    async fn index_responds_ok(pool: PgPool) {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let conn = redis::aio::ConnectionManager::new(client).await.unwrap();
        let state = JobState {
            job_repo: JobRepo::new(pool),
            batch_queue: BatchQueue::new(conn),
        };
        let app = add_routes(Router::new(), state);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
