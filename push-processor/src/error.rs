use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error(transparent)]
    Push(#[from] push_common::error::PushError),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}
