use thiserror::Error;

/// The taxonomy every worker loop in this workspace converts its failures into. Matching on
/// this enum, rather than bubbling up `sqlx::Error`/`rdkafka::error::KafkaError` directly,
/// keeps the decision of "retry, fail the job, or drop the message" in one place.
#[derive(Error, Debug)]
pub enum PushError {
    /// Malformed input at a boundary (job creation, admin request). Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A job, app or template could not be found where one was expected.
    #[error("not found: {0}")]
    NotFound(String),

    /// DB, Kafka, object-store or queue I/O failed in a way that is expected to be transient.
    #[error("transient infrastructure error: {0}")]
    Transient(#[source] anyhow::Error),

    /// Unrecoverable: the job is marked `failed` and the work item is relinquished.
    #[error("fatal error: {0}")]
    Fatal(#[source] anyhow::Error),

    /// A queue entry that cannot be parsed; after exhausting retries it is dead-lettered.
    #[error("poison message: {0}")]
    Poison(String),
}

impl PushError {
    pub fn transient<E: Into<anyhow::Error>>(err: E) -> Self {
        PushError::Transient(err.into())
    }

    pub fn fatal<E: Into<anyhow::Error>>(err: E) -> Self {
        PushError::Fatal(err.into())
    }

    /// Whether a worker loop should retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PushError::Transient(_))
    }
}

impl From<sqlx::Error> for PushError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => PushError::NotFound(err.to_string()),
            other => PushError::Transient(other.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PushError>;
