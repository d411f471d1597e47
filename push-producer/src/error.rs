use thiserror::Error;

/// Top-level error for a single producer run. Mirrors the §7 taxonomy; `push_common::error`
/// already carries most of it, this wraps the bits specific to wiring a binary's main loop.
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error(transparent)]
    Push(#[from] push_common::error::PushError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
