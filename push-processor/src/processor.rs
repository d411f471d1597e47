//! §4.5: renders and produces one batch's envelopes to the gateway-bound Kafka topic.

use std::num::NonZeroU32;
use std::time;

use health::HealthHandle;
use push_common::clock::Clock;
use push_common::db::JobRepo;
use push_common::envelope::Envelope;
use push_common::error::PushError;
use push_common::kafka::KafkaContext;
use push_common::model::{Job, JobStatus};
use push_common::queue::{BatchQueue, QueueEntry};
use push_common::ratelimit::GatewayRateLimiter;
use push_common::render::{merge_params, render_body};
use push_common::retry::RetryPolicy;
use push_common::template_cache::TemplateCache;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::{error, info, instrument, warn};

pub struct ProcessorWorker<C: Clock> {
    name: String,
    job_repo: JobRepo,
    templates: TemplateCache,
    batch_queue: BatchQueue,
    producer: FutureProducer<KafkaContext>,
    rate_limiter: GatewayRateLimiter,
    default_rate_per_second: NonZeroU32,
    clock: C,
    poll_interval: time::Duration,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
}

impl<C: Clock + Send + Sync + 'static> ProcessorWorker<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        job_repo: JobRepo,
        templates: TemplateCache,
        batch_queue: BatchQueue,
        producer: FutureProducer<KafkaContext>,
        rate_limiter: GatewayRateLimiter,
        default_rate_per_second: NonZeroU32,
        clock: C,
        poll_interval: time::Duration,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            job_repo,
            templates,
            batch_queue,
            producer,
            rate_limiter,
            default_rate_per_second,
            clock,
            poll_interval,
            retry_policy,
            liveness,
        }
    }

    pub async fn run(&self) {
        info!(worker = self.name, "starting batch processor loop");
        loop {
            self.liveness.report_healthy().await;

            let now_nanos = self.clock.now().timestamp_nanos_opt().unwrap_or(i64::MAX);
            match self.batch_queue.pop_due(now_nanos, 16).await {
                Ok(entries) if !entries.is_empty() => {
                    for entry in entries {
                        self.process_with_retry(entry).await;
                    }
                }
                Ok(_) => tokio::time::sleep(self.poll_interval).await,
                Err(err) => {
                    error!(error = %err, "failed popping due batches");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn process_with_retry(&self, entry: QueueEntry) {
        let mut attempt = 0u32;
        loop {
            match self.process_batch(&entry).await {
                Ok(()) => return,
                Err(err) if err.is_retryable() && attempt + 1 < self.retry_policy.max_attempts() => {
                    warn!(jid = entry.jid, attempt, error = %err, "retrying batch");
                    tokio::time::sleep(self.retry_policy.time_until_next_retry(attempt, None)).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(jid = entry.jid, error = %err, "batch processing failed permanently");
                    return;
                }
            }
        }
    }

    /// §4.5 steps 1-7.
    #[instrument(skip(self, entry), fields(jid = %entry.jid))]
    pub async fn process_batch(&self, entry: &QueueEntry) -> Result<(), PushError> {
        let (job_id, app_name, users) = &entry.args;
        let job = self.job_repo.fetch(*job_id).await?;

        // Step 1.
        match job.status {
            JobStatus::Stopped => return Ok(()),
            JobStatus::Paused => {
                self.batch_queue.push_paused(*job_id, entry).await?;
                return Ok(());
            }
            _ => {}
        }

        // Step 2.
        let now_nanos = self.clock.now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        if job.expires_at != 0 && now_nanos > job.expires_at {
            self.job_repo.increment_completed_batches(*job_id, 1).await?;
            return Ok(());
        }

        let topic = format!("push-{app_name}-{service}", service = job.service);
        let mut skipped = 0i64;

        for user in users {
            let Some(template) = self.resolve_template(&job, &user.locale).await? else {
                skipped += 1;
                continue;
            };

            let merged = merge_params(&template.defaults, &job.context);
            let rendered_body = render_body(&template.body, &merged);
            let envelope = Envelope::build(
                job.service,
                &user.token,
                job.expires_at,
                rendered_body,
                job.metadata.clone(),
            );

            self.rate_limiter
                .acquire(job.app_id, job.service, self.default_rate_per_second)
                .await;

            let payload = serde_json::to_string(&envelope).map_err(|e| PushError::fatal(e))?;
            let record = FutureRecord::to(&topic).key(&user.token).payload(&payload);
            self.producer
                .send(record, time::Duration::from_secs(10))
                .await
                .map_err(|(err, _)| PushError::transient(err))?;
        }

        if skipped > 0 {
            // No gateway will ever report on users skipped here, so they're marked failed now
            // rather than waiting on feedback that will never arrive (§4.5 step 3).
            self.job_repo.apply_feedback(*job_id, 0, skipped).await?;
        }

        self.job_repo.increment_completed_batches(*job_id, 1).await?;
        Ok(())
    }

    /// Step 3: exact `(locale)` hit, else the job's default locale, else `None` (skip, counted
    /// as failed by the caller).
    async fn resolve_template(
        &self,
        job: &Job,
        locale: &str,
    ) -> Result<Option<std::sync::Arc<push_common::model::Template>>, PushError> {
        if let Some(template) = self
            .templates
            .get(job.app_id, &job.template_name, locale, job.service)
            .await?
        {
            return Ok(Some(template));
        }
        if locale != job.default_locale {
            if let Some(template) = self
                .templates
                .get(job.app_id, &job.template_name, &job.default_locale, job.service)
                .await?
            {
                return Ok(Some(template));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use push_common::clock::FixedClock;
    use push_common::kafka::{create_producer, KafkaSettings};
    use push_common::model::TargetUser;
    use push_common::template_cache::TemplateCache;
    use sqlx::PgPool;
    use uuid::Uuid;

    async fn seed_job_with_no_template(pool: &PgPool) -> (Uuid, Uuid) {
        let app_id = Uuid::now_v7();
        sqlx::query("INSERT INTO apps (id, name) VALUES ($1, 'acme')")
            .bind(app_id)
            .execute(pool)
            .await
            .unwrap();

        let job_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, app_id, template_name, service, csv_path, context, metadata, expires_at,
                starts_at, localized, past_time_strategy, default_locale, status, created_by,
                total_users, total_batches
            ) VALUES ($1, $2, 'welcome', 'apns', 's3://bucket/key.csv', '{}', '{}', 0, 0, false,
                      'skip', 'en-US', 'in_progress', 'person@example.com', 1, 1)
            "#,
        )
        .bind(job_id)
        .bind(app_id)
        .execute(pool)
        .await
        .unwrap();

        (app_id, job_id)
    }

    async fn worker(pool: PgPool) -> ProcessorWorker<FixedClock> {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let conn = redis::aio::ConnectionManager::new(client).await.unwrap();
        let producer = create_producer(&KafkaSettings::default()).unwrap();
        let liveness = health::HealthRegistry::new("test")
            .register("processor".to_string(), time::Duration::from_secs(60))
            .await;

        ProcessorWorker::new(
            "test",
            JobRepo::new(pool.clone()),
            TemplateCache::with_default_ttl(push_common::db::TemplateRepo::new(pool)),
            BatchQueue::new(conn),
            producer,
            GatewayRateLimiter::new(),
            std::num::NonZeroU32::new(50).unwrap(),
            FixedClock(chrono::Utc::now()),
            time::Duration::from_millis(10),
            RetryPolicy::new(2, time::Duration::from_millis(10), None, 1),
            liveness,
        )
    }

    /// P3: a user whose locale matches no template (and no default-locale fallback either) is
    /// skipped from the gateway-bound envelope count and instead counted as a failed token,
    /// without ever touching the Kafka producer.
    #[sqlx::test(migrations = "../migrations")]
    async fn user_with_no_matching_template_is_skipped_and_marked_failed(pool: PgPool) {
        let (app_id, job_id) = seed_job_with_no_template(&pool).await;
        let w = worker(pool.clone()).await;

        let user = TargetUser {
            user_id: "user-0".to_owned(),
            token: "tok-0".to_owned(),
            locale: "fr-FR".to_owned(),
            tz: "UTC".to_owned(),
        };
        let entry = QueueEntry::new(job_id, "acme", vec![user], 0);

        w.process_batch(&entry).await.unwrap();

        let job = JobRepo::new(pool).fetch(job_id).await.unwrap();
        assert_eq!(job.failed_tokens, 1);
        assert_eq!(job.completed_tokens, 0);
        assert_eq!(job.completed_batches, 1);
        let _ = app_id;
    }

    /// A batch for a stopped job is dropped without touching counters.
    #[sqlx::test(migrations = "../migrations")]
    async fn stopped_job_batch_is_dropped(pool: PgPool) {
        let (_, job_id) = seed_job_with_no_template(&pool).await;
        JobRepo::new(pool.clone())
            .transition(job_id, JobStatus::Stopped)
            .await
            .unwrap();
        let w = worker(pool.clone()).await;

        let user = TargetUser {
            user_id: "user-0".to_owned(),
            token: "tok-0".to_owned(),
            locale: "fr-FR".to_owned(),
            tz: "UTC".to_owned(),
        };
        let entry = QueueEntry::new(job_id, "acme", vec![user], 0);
        w.process_batch(&entry).await.unwrap();

        let job = JobRepo::new(pool).fetch(job_id).await.unwrap();
        assert_eq!(job.completed_batches, 0);
    }
}
