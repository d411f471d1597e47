//! Postgres-backed repository for jobs and templates.
//!
//! Counter and status mutations are expressed as arithmetic/conditional SQL (`SET x = x + k`,
//! `WHERE status IN (...)`) rather than read-modify-write in the application, so concurrent
//! writers from the producer, processor and feedback consumer cannot race (§5 Shared-resource
//! policy).

use chrono::Utc;
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::error::PushError;
use crate::model::{App, Job, JobStatus, JobTarget, Params, Service, Template};

#[derive(Clone)]
pub struct AppRepo {
    pool: PgPool,
}

impl AppRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn fetch(&self, app_id: Uuid) -> Result<App, PushError> {
        let row = sqlx::query("SELECT id, name FROM apps WHERE id = $1")
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PushError::NotFound(format!("app {app_id}")))?;
        Ok(App {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        })
    }
}

#[derive(Clone)]
pub struct JobRepo {
    pool: PgPool,
}

impl JobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn fetch(&self, job_id: Uuid) -> Result<Job, PushError> {
        let row = sqlx::query(
            r#"
            SELECT id, app_id, template_name, service, csv_path, filters, context, metadata,
                   expires_at, starts_at, localized, past_time_strategy, default_locale,
                   total_users, total_batches, completed_batches, completed_users,
                   completed_tokens, failed_tokens, db_page_size, status, created_by,
                   created_at, updated_at, started_at, completed_at
            FROM jobs WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| PushError::NotFound(format!("job {job_id}")))?;

        row_to_job(&row)
    }

    /// Conditional status transition: succeeds only if the current status is one of
    /// `new_status.allowed_predecessors()` (I3). Returns `Ok(false)` if nothing matched, which
    /// callers treat as "already transitioned" rather than an error, keeping the operation
    /// idempotent.
    pub async fn transition(&self, job_id: Uuid, new_status: JobStatus) -> Result<bool, PushError> {
        let predecessors: Vec<&'static str> = new_status
            .allowed_predecessors()
            .iter()
            .map(JobStatus::as_db_str)
            .collect();

        if predecessors.is_empty() {
            return Err(PushError::Fatal(anyhow::anyhow!(
                "{new_status:?} has no legal predecessor, cannot be reached via transition()"
            )));
        }

        let mut extra = String::new();
        if new_status == JobStatus::InProgress {
            extra.push_str(", started_at = COALESCE(started_at, now())");
        }
        if new_status == JobStatus::Completed {
            extra.push_str(", completed_at = now()");
        }

        let query = format!(
            "UPDATE jobs SET status = $1, updated_at = now() {extra} \
             WHERE id = $2 AND status = ANY($3)"
        );

        let result = sqlx::query(&query)
            .bind(new_status.as_db_str())
            .bind(job_id)
            .bind(&predecessors)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// §4.4 step 6: one atomic update per flushed batch.
    pub async fn increment_batch_counters(
        &self,
        job_id: Uuid,
        batches: i64,
        users: i64,
    ) -> Result<(), PushError> {
        sqlx::query(
            "UPDATE jobs SET total_batches = total_batches + $1, total_users = total_users + $2, \
             updated_at = now() WHERE id = $3",
        )
        .bind(batches)
        .bind(users)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// §4.4 step 2: only written if unset, so re-execution reuses the original page size.
    pub async fn set_db_page_size_if_unset(
        &self,
        job_id: Uuid,
        default_page_size: i32,
    ) -> Result<i32, PushError> {
        let row = sqlx::query(
            "UPDATE jobs SET db_page_size = COALESCE(db_page_size, $1) \
             WHERE id = $2 RETURNING db_page_size",
        )
        .bind(default_page_size)
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        let page_size: i32 = row.try_get("db_page_size")?;
        Ok(page_size)
    }

    /// §4.5 step 7.
    pub async fn increment_completed_batches(&self, job_id: Uuid, by: i64) -> Result<(), PushError> {
        sqlx::query(
            "UPDATE jobs SET completed_batches = completed_batches + $1, updated_at = now() \
             WHERE id = $2",
        )
        .bind(by)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// §4.6: feedback-driven counters, applied atomically so re-ordered/duplicated events are
    /// tolerated (they simply add twice; completion is checked from the resulting totals).
    pub async fn apply_feedback(
        &self,
        job_id: Uuid,
        completed_tokens: i64,
        failed_tokens: i64,
    ) -> Result<Job, PushError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs SET
                completed_tokens = completed_tokens + $1,
                failed_tokens = failed_tokens + $2,
                completed_users = completed_users + $1 + $2,
                updated_at = now()
            WHERE id = $3
            RETURNING id, app_id, template_name, service, csv_path, filters, context, metadata,
                      expires_at, starts_at, localized, past_time_strategy, default_locale,
                      total_users, total_batches, completed_batches, completed_users,
                      completed_tokens, failed_tokens, db_page_size, status, created_by,
                      created_at, updated_at, started_at, completed_at
            "#,
        )
        .bind(completed_tokens)
        .bind(failed_tokens)
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        row_to_job(&row)
    }

    /// I4/C6: only transitions when truly done; a concurrent duplicate call is a no-op via the
    /// conditional `WHERE`.
    pub async fn complete_if_fully_delivered(&self, job_id: Uuid) -> Result<bool, PushError> {
        let job = self.fetch(job_id).await?;
        if job.status.is_terminal() || !job.is_fully_delivered() {
            return Ok(false);
        }
        self.transition(job_id, JobStatus::Completed).await
    }
}

fn row_to_job(row: &PgRow) -> Result<Job, PushError> {
    let status_str: String = row.try_get("status")?;
    let service_str: String = row.try_get("service")?;
    let strategy_str: String = row.try_get("past_time_strategy")?;
    let csv_path: Option<String> = row.try_get("csv_path")?;
    let filters_json: Option<Value> = row.try_get("filters")?;

    let target = match (csv_path, filters_json) {
        (Some(path), None) => JobTarget::Csv { csv_path: path },
        (None, Some(filters)) => JobTarget::Filters {
            filters: serde_json::from_value(filters)
                .map_err(|e| PushError::Fatal(e.into()))?,
        },
        _ => {
            return Err(PushError::Fatal(anyhow::anyhow!(
                "job row violates I1: exactly one of csv_path/filters must be set"
            )))
        }
    };

    let context: Value = row.try_get("context")?;
    let metadata: Value = row.try_get("metadata")?;

    Ok(Job {
        id: row.try_get("id")?,
        app_id: row.try_get("app_id")?,
        template_name: row.try_get("template_name")?,
        service: service_str.parse::<Service>()?,
        target,
        context: json_to_params(context)?,
        metadata: json_to_params(metadata)?,
        expires_at: row.try_get("expires_at")?,
        starts_at: row.try_get("starts_at")?,
        localized: row.try_get("localized")?,
        past_time_strategy: strategy_str.parse()?,
        default_locale: row.try_get("default_locale")?,
        total_users: row.try_get("total_users")?,
        total_batches: row.try_get("total_batches")?,
        completed_batches: row.try_get("completed_batches")?,
        completed_users: row.try_get("completed_users")?,
        completed_tokens: row.try_get("completed_tokens")?,
        failed_tokens: row.try_get("failed_tokens")?,
        db_page_size: row.try_get("db_page_size")?,
        status: status_str.parse()?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn json_to_params(value: Value) -> Result<Params, PushError> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        Value::Null => Ok(Params::new()),
        other => Err(PushError::Fatal(anyhow::anyhow!(
            "expected a JSON object, got {other}"
        ))),
    }
}

#[derive(Clone)]
pub struct TemplateRepo {
    pool: PgPool,
}

impl TemplateRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The single database read behind a template cache miss (C1).
    pub async fn lookup(
        &self,
        app_id: Uuid,
        name: &str,
        locale: &str,
        service: Service,
    ) -> Result<Option<Template>, PushError> {
        let row = sqlx::query(
            "SELECT app_id, name, locale, service, body, defaults FROM templates \
             WHERE app_id = $1 AND name = $2 AND locale = $3 AND service = $4",
        )
        .bind(app_id)
        .bind(name)
        .bind(locale)
        .bind(service.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let body: Value = row.try_get("body")?;
        let defaults: Value = row.try_get("defaults")?;

        Ok(Some(Template {
            app_id: row.try_get("app_id")?,
            name: row.try_get("name")?,
            locale: row.try_get("locale")?,
            service,
            body: json_to_params(body)?,
            defaults: json_to_params(defaults)?,
        }))
    }
}

/// Marks a token invalid in the app's users table, used by C6 when a feedback `reason`
/// indicates the device token is permanently unreachable (e.g. unregistered).
pub async fn mark_token_invalid(
    pool: &PgPool,
    app_name: &str,
    token: &str,
) -> Result<(), PushError> {
    let table = format!("{app_name}_users");
    // Table name is derived from the app's own name, never from request-controlled input; it is
    // not parameterizable via a bind, so it is interpolated directly.
    let query = format!("UPDATE \"{table}\" SET invalid = true WHERE token = $1");
    sqlx::query(&query).bind(token).execute(pool).await?;
    Ok(())
}

pub fn utc_now_nanos() -> i64 {
    Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_job(pool: &PgPool, status: JobStatus) -> Uuid {
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
                      'skip', 'en-US', $3, 'person@example.com', 10, 2)
            "#,
        )
        .bind(job_id)
        .bind(app_id)
        .bind(status.as_db_str())
        .execute(pool)
        .await
        .unwrap();

        job_id
    }

    /// I3: only a legal predecessor admits the transition (S2-adjacent).
    #[sqlx::test(migrations = "../migrations")]
    async fn transition_rejects_illegal_predecessor(pool: PgPool) {
        let repo = JobRepo::new(pool.clone());
        let job_id = seed_job(&pool, JobStatus::Completed).await;

        let moved = repo.transition(job_id, JobStatus::Paused).await.unwrap();
        assert!(!moved);
        assert_eq!(repo.fetch(job_id).await.unwrap().status, JobStatus::Completed);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn transition_accepts_legal_predecessor(pool: PgPool) {
        let repo = JobRepo::new(pool.clone());
        let job_id = seed_job(&pool, JobStatus::InProgress).await;

        let moved = repo.transition(job_id, JobStatus::Paused).await.unwrap();
        assert!(moved);
        assert_eq!(repo.fetch(job_id).await.unwrap().status, JobStatus::Paused);
    }

    /// R1: re-applying feedback is additive, never overwriting (duplicate-tolerant, §5).
    #[sqlx::test(migrations = "../migrations")]
    async fn apply_feedback_accumulates_across_calls(pool: PgPool) {
        let repo = JobRepo::new(pool.clone());
        let job_id = seed_job(&pool, JobStatus::InProgress).await;

        repo.apply_feedback(job_id, 3, 1).await.unwrap();
        let job = repo.apply_feedback(job_id, 2, 0).await.unwrap();

        assert_eq!(job.completed_tokens, 5);
        assert_eq!(job.failed_tokens, 1);
        assert_eq!(job.completed_users, 6);
    }

    /// S6: exactly the feedback that brings the job to `totalUsers`/`totalBatches` completes it.
    #[sqlx::test(migrations = "../migrations")]
    async fn completes_only_once_fully_delivered(pool: PgPool) {
        let repo = JobRepo::new(pool.clone());
        let job_id = seed_job(&pool, JobStatus::InProgress).await;
        repo.increment_completed_batches(job_id, 2).await.unwrap();

        repo.apply_feedback(job_id, 9, 0).await.unwrap();
        assert!(!repo.complete_if_fully_delivered(job_id).await.unwrap());
        assert_eq!(repo.fetch(job_id).await.unwrap().status, JobStatus::InProgress);

        repo.apply_feedback(job_id, 1, 0).await.unwrap();
        assert!(repo.complete_if_fully_delivered(job_id).await.unwrap());
        let job = repo.fetch(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());

        // A duplicate completion check after the job is already terminal is a no-op.
        assert!(!repo.complete_if_fully_delivered(job_id).await.unwrap());
    }

    /// I2: batch counters accumulate across re-invocations of the producer for the same job.
    #[sqlx::test(migrations = "../migrations")]
    async fn batch_counters_are_additive(pool: PgPool) {
        let repo = JobRepo::new(pool.clone());
        let job_id = seed_job(&pool, JobStatus::InProgress).await;

        repo.increment_batch_counters(job_id, 1, 5).await.unwrap();
        repo.increment_batch_counters(job_id, 1, 5).await.unwrap();

        let job = repo.fetch(job_id).await.unwrap();
        assert_eq!(job.total_batches, 4);
        assert_eq!(job.total_users, 20);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn set_db_page_size_is_fixed_on_first_write(pool: PgPool) {
        let repo = JobRepo::new(pool.clone());
        let job_id = seed_job(&pool, JobStatus::Created).await;

        let first = repo.set_db_page_size_if_unset(job_id, 2000).await.unwrap();
        let second = repo.set_db_page_size_if_unset(job_id, 9999).await.unwrap();

        assert_eq!(first, 2000);
        assert_eq!(second, 2000);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn app_repo_fetch_not_found(pool: PgPool) {
        let repo = AppRepo::new(pool);
        let err = repo.fetch(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, PushError::NotFound(_)));
    }
}
