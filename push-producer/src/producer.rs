//! §4.4: expands a job into batches and enqueues them for the processor (C5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time;

use health::HealthHandle;
use push_common::clock::Clock;
use push_common::db::{AppRepo, JobRepo};
use push_common::error::PushError;
use push_common::model::{Job, JobStatus, JobTarget, TargetUser};
use push_common::object_store::ObjectStore;
use push_common::queue::{BatchQueue, QueueEntry};
use push_common::retry::RetryPolicy;
use push_common::users_source::{CsvUsersSource, FilterUsersSource, UsersSource};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub struct ProducerWorker<C: Clock> {
    name: String,
    job_repo: JobRepo,
    app_repo: AppRepo,
    batch_queue: BatchQueue,
    object_store: Arc<dyn ObjectStore>,
    bucket: String,
    clock: C,
    batch_size: usize,
    default_db_page_size: i32,
    poll_interval: time::Duration,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
}

/// One recipient bucket awaiting a flush: the immediate bucket `"immediate"`, or a timezone name
/// when the job is localized (§4.4 step 3).
struct Bucket {
    users: Vec<TargetUser>,
}

impl<C: Clock + Clone + Send + Sync + 'static> ProducerWorker<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        job_repo: JobRepo,
        app_repo: AppRepo,
        batch_queue: BatchQueue,
        object_store: Arc<dyn ObjectStore>,
        bucket: &str,
        clock: C,
        batch_size: usize,
        default_db_page_size: i32,
        poll_interval: time::Duration,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            job_repo,
            app_repo,
            batch_queue,
            object_store,
            bucket: bucket.to_owned(),
            clock,
            batch_size,
            default_db_page_size,
            poll_interval,
            retry_policy,
            liveness,
        }
    }

    /// Blocking-pops the produce-trigger list and runs [`Self::produce_batches`] for each job id,
    /// with capped-backoff retry on transient failures. Unhandled errors are logged and the loop
    /// continues (§7: "one batch's failure never halts the pool").
    pub async fn run(&self) {
        info!(worker = self.name, "starting batch producer loop");
        let timeout_secs = self.poll_interval.as_secs_f64().max(0.1);
        loop {
            self.liveness.report_healthy().await;

            match self.batch_queue.pop_produce_trigger(timeout_secs).await {
                Ok(Some(job_id)) => self.run_with_retry(job_id).await,
                Ok(None) => {}
                Err(err) => {
                    error!(error = %err, "failed polling for produce triggers");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn run_with_retry(&self, job_id: Uuid) {
        let mut attempt = 0u32;
        loop {
            match self.produce_batches(job_id).await {
                Ok(()) => return,
                Err(err) if err.is_retryable() && attempt + 1 < self.retry_policy.max_attempts() => {
                    warn!(job_id = %job_id, attempt, error = %err, "retrying batch production");
                    tokio::time::sleep(self.retry_policy.time_until_next_retry(attempt, None)).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(job_id = %job_id, error = %err, "batch production failed, marking job failed");
                    if let Err(mark_err) = self.job_repo.transition(job_id, JobStatus::Failed).await {
                        error!(job_id = %job_id, error = %mark_err, "failed to mark job failed");
                    }
                    return;
                }
            }
        }
    }

    /// §4.4 the full algorithm.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn produce_batches(&self, job_id: Uuid) -> Result<(), PushError> {
        let job = self.job_repo.fetch(job_id).await?;

        // Step 1.
        if job.status == JobStatus::Stopped {
            info!("job is stopped, returning without side effects");
            return Ok(());
        }

        // Step 2.
        let page_size = self
            .job_repo
            .set_db_page_size_if_unset(job_id, self.default_db_page_size)
            .await? as usize;

        let app = self.app_repo.fetch(job.app_id).await?;

        let mut source: Box<dyn UsersSource> = match &job.target {
            JobTarget::Csv { csv_path } => Box::new(
                CsvUsersSource::open(
                    self.job_repo.pool().clone(),
                    self.object_store.as_ref(),
                    &self.bucket,
                    csv_path,
                    &app.name,
                    page_size,
                )
                .await?,
            ),
            JobTarget::Filters { filters } => Box::new(FilterUsersSource::new(
                self.job_repo.pool().clone(),
                &app.name,
                filters.clone(),
                page_size as i64,
            )?),
        };

        let mut buckets: HashMap<String, Bucket> = HashMap::new();
        let mut next_batch_index: i64 = 0;
        // §3 Lifecycle: "transitions it to inProgress on first enqueue" — not before, so a
        // source that yields zero users leaves a fresh job in `created` rather than stuck
        // `inProgress` forever (I4 would otherwise be vacuously satisfied with no batches ever
        // completed).
        let mut started = false;

        loop {
            let page = source.next_page().await?;
            if page.is_empty() {
                break;
            }

            for user in page {
                let key = if job.localized {
                    user.tz.clone()
                } else {
                    "immediate".to_owned()
                };
                let bucket = buckets.entry(key).or_insert_with(|| Bucket { users: Vec::new() });
                bucket.users.push(user);

                if bucket.users.len() >= self.batch_size {
                    let flushed = std::mem::take(&mut bucket.users);
                    self.flush(&job, &app.name, flushed, &mut next_batch_index, &mut started)
                        .await?;
                }
            }
        }

        // End of stream: flush whatever remains.
        for (_, bucket) in buckets {
            if !bucket.users.is_empty() {
                self.flush(&job, &app.name, bucket.users, &mut next_batch_index, &mut started)
                    .await?;
            }
        }

        Ok(())
    }

    /// Steps 5-6: computes `dispatchAt` for one flushed bucket, enqueues it, and atomically
    /// bumps the job's counters. Transitions the job to `inProgress` on the first batch this
    /// call actually enqueues (`started` tracks that across calls within one run).
    async fn flush(
        &self,
        job: &Job,
        app_name: &str,
        users: Vec<TargetUser>,
        next_batch_index: &mut i64,
        started: &mut bool,
    ) -> Result<(), PushError> {
        if users.is_empty() {
            return Ok(());
        }

        let now_nanos = self.clock.now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let count = users.len() as i64;
        let batch_index = *next_batch_index;
        *next_batch_index += 1;

        let entry = QueueEntry::new(job.id, app_name, users.clone(), now_nanos);

        let dispatch = self.resolve_dispatch(job, &users, now_nanos);
        match dispatch {
            Dispatch::Skip => {
                info!(batch_index, "dropping batch per pastTimeStrategy=skip");
                return Ok(());
            }
            Dispatch::Immediate => self.batch_queue.push_immediate(&entry).await?,
            Dispatch::Delayed(at) => self.batch_queue.push_delayed(&entry, at).await?,
        }

        if !*started {
            self.job_repo.transition(job.id, JobStatus::InProgress).await?;
            *started = true;
        }

        self.job_repo
            .increment_batch_counters(job.id, 1, count)
            .await?;

        Ok(())
    }

    /// Step 5: `localized=false` buckets dispatch uniformly; `localized=true` buckets are
    /// per-timezone and use the first user's `tz` (all users in a bucket share one by
    /// construction, since buckets are keyed by timezone).
    fn resolve_dispatch(&self, job: &Job, users: &[TargetUser], now_nanos: i64) -> Dispatch {
        if !job.localized {
            return if job.starts_at == 0 {
                Dispatch::Immediate
            } else {
                Dispatch::Delayed(job.starts_at)
            };
        }

        let tz_name = users.first().map(|u| u.tz.as_str()).unwrap_or("UTC");
        let tz: chrono_tz::Tz = tz_name.parse().unwrap_or(chrono_tz::UTC);

        let starts_at_utc = chrono::DateTime::from_timestamp_nanos(job.starts_at);
        let local_dispatch = starts_at_utc.with_timezone(&tz);
        let local_dispatch_nanos = local_dispatch.timestamp_nanos_opt().unwrap_or(job.starts_at);

        if local_dispatch_nanos < now_nanos {
            match job.past_time_strategy {
                push_common::model::PastTimeStrategy::Skip => Dispatch::Skip,
                push_common::model::PastTimeStrategy::NextDay => {
                    Dispatch::Delayed(local_dispatch_nanos + time::Duration::from_secs(24 * 3600).as_nanos() as i64)
                }
            }
        } else {
            Dispatch::Delayed(local_dispatch_nanos)
        }
    }
}

enum Dispatch {
    Immediate,
    Delayed(i64),
    Skip,
}
