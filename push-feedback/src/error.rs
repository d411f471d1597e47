use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error(transparent)]
    Push(#[from] push_common::error::PushError),
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}
