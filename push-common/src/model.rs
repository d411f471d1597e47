use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::PushError;

/// `context`, `metadata`, `defaults` and per-user `params` are dynamic, caller-shaped maps.
/// We keep them as `serde_json::Value` rather than `HashMap<String, String>` so a renderer can
/// tell a nested object or number apart from a string without guessing.
pub type Params = HashMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Apns,
    Gcm,
}

impl FromStr for Service {
    type Err = PushError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "apns" => Ok(Service::Apns),
            "gcm" => Ok(Service::Gcm),
            other => Err(PushError::Validation(format!(
                "service must be one of apns, gcm, got {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Service::Apns => write!(f, "apns"),
            Service::Gcm => write!(f, "gcm"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "camelCase")]
pub enum PastTimeStrategy {
    Skip,
    NextDay,
}

impl FromStr for PastTimeStrategy {
    type Err = PushError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(PastTimeStrategy::Skip),
            "nextDay" | "next_day" => Ok(PastTimeStrategy::NextDay),
            other => Err(PushError::Validation(format!(
                "pastTimeStrategy must be one of skip, nextDay, got {other}"
            ))),
        }
    }
}

/// Status machine per the job controller (C7). Only the edges drawn in the graph are legal;
/// enforcement lives in `db::JobRepo::transition`, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Created,
    InProgress,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::InProgress => "in_progress",
            JobStatus::Paused => "paused",
            JobStatus::Stopped => "stopped",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Stopped | JobStatus::Failed
        )
    }

    /// Predecessors from which `self` may legally be reached, used to build the
    /// `WHERE status IN (...)` clause of a conditional transition.
    pub fn allowed_predecessors(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Created => &[],
            JobStatus::InProgress => &[JobStatus::Created, JobStatus::Paused],
            JobStatus::Paused => &[JobStatus::InProgress],
            JobStatus::Stopped => &[JobStatus::Created, JobStatus::InProgress, JobStatus::Paused],
            JobStatus::Completed => &[JobStatus::InProgress],
            JobStatus::Failed => &[
                JobStatus::Created,
                JobStatus::InProgress,
                JobStatus::Paused,
            ],
        }
    }
}

impl FromStr for JobStatus {
    type Err = PushError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobStatus::Created),
            "in_progress" | "inProgress" => Ok(JobStatus::InProgress),
            "paused" => Ok(JobStatus::Paused),
            "stopped" => Ok(JobStatus::Stopped),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(PushError::Fatal(anyhow::anyhow!(
                "{other} is not a valid job status"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub app_id: Uuid,
    pub name: String,
    pub locale: String,
    pub service: Service,
    pub body: Params,
    pub defaults: Params,
}

/// Either `filters` or `csv_path` is set, never both (I1); enforced by `JobTarget`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobTarget {
    Csv { csv_path: String },
    Filters { filters: HashMap<String, String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub app_id: Uuid,
    pub template_name: String,
    pub service: Service,
    pub target: JobTarget,
    pub context: Params,
    pub metadata: Params,
    pub expires_at: i64,
    pub starts_at: i64,
    pub localized: bool,
    pub past_time_strategy: PastTimeStrategy,
    pub default_locale: String,

    pub total_users: i64,
    pub total_batches: i64,
    pub completed_batches: i64,
    pub completed_users: i64,
    pub completed_tokens: i64,
    pub failed_tokens: i64,

    pub db_page_size: Option<i32>,
    pub status: JobStatus,
    pub created_by: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// I4: all batches accounted for and nothing left pending.
    pub fn is_fully_delivered(&self) -> bool {
        self.completed_tokens + self.failed_tokens >= self.total_users
            && self.completed_batches >= self.total_batches
    }
}

/// A single recipient, as paged out of either CSV+DB lookup or a filtered query (C3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetUser {
    pub user_id: String,
    pub token: String,
    pub locale: String,
    pub tz: String,
}

static EMAIL_RE_SRC: &str = r"^[^@\s]+@[^@\s]+\.[^@\s]+$";

pub fn validate_email(value: &str) -> Result<(), PushError> {
    let re = regex::Regex::new(EMAIL_RE_SRC).expect("static email regex is valid");
    if re.is_match(value) {
        Ok(())
    } else {
        Err(PushError::Validation(format!(
            "createdBy {value:?} does not look like an email address"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation() {
        assert!(validate_email("person@example.com").is_ok());
        assert!(validate_email("not-an-email").is_err());
        assert!(validate_email("a b@example.com").is_err());
    }

    #[test]
    fn status_predecessors_match_state_machine() {
        assert!(JobStatus::InProgress
            .allowed_predecessors()
            .contains(&JobStatus::Created));
        assert!(JobStatus::InProgress
            .allowed_predecessors()
            .contains(&JobStatus::Paused));
        assert!(!JobStatus::Paused
            .allowed_predecessors()
            .contains(&JobStatus::Completed));
        assert!(JobStatus::Stopped.allowed_predecessors().contains(&JobStatus::Created));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
    }
}
