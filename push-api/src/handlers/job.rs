//! §4.7 C7: the lifecycle-action subset of the admin API this crate implements —
//! `pauseJob`/`resumeJob`/`stopJob`/`getJob`. `createJob` and app/template CRUD stay external.

use axum::extract::{Path, State};
use axum::Json;
use push_common::db::JobRepo;
use push_common::model::{Job, JobStatus};
use push_common::queue::BatchQueue;
use uuid::Uuid;

use crate::error::ApiError;

#[derive(Clone)]
pub struct JobState {
    pub job_repo: JobRepo,
    pub batch_queue: BatchQueue,
}

pub async fn get_job(
    State(state): State<JobState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = state.job_repo.fetch(job_id).await?;
    Ok(Json(job))
}

pub async fn pause_job(
    State(state): State<JobState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    state.job_repo.transition(job_id, JobStatus::Paused).await?;
    Ok(Json(state.job_repo.fetch(job_id).await?))
}

/// Drains the paused list back onto the batch queue, then flips the job back to `inProgress`.
/// A batch whose scheduled dispatch time has already passed is re-enqueued immediately rather
/// than lost.
pub async fn resume_job(
    State(state): State<JobState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let drained = state.batch_queue.drain_paused(job_id).await?;
    let now_nanos = push_common::db::utc_now_nanos();
    for entry in &drained {
        if entry.at <= now_nanos {
            state.batch_queue.push_immediate(entry).await?;
        } else {
            state.batch_queue.push_delayed(entry, entry.at).await?;
        }
    }
    state.job_repo.transition(job_id, JobStatus::InProgress).await?;
    Ok(Json(state.job_repo.fetch(job_id).await?))
}

pub async fn stop_job(
    State(state): State<JobState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    state.job_repo.transition(job_id, JobStatus::Stopped).await?;
    Ok(Json(state.job_repo.fetch(job_id).await?))
}
