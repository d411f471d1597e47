//! §4.5 step 6 / §4.6: Kafka producer construction for the processor (C5, produces rendered
//! envelopes to the gateway-bound topic) and consumer construction for the feedback consumer
//! (C6). The consumer runs cooperative-sticky partition assignment with auto-commit, matching
//! the original dispatcher's rebalance and commit behavior.

use rdkafka::consumer::StreamConsumer;
use rdkafka::error::KafkaError;
use rdkafka::producer::FutureProducer;
use rdkafka::ClientConfig;
use tracing::debug;

pub struct KafkaContext {}

impl rdkafka::ClientContext for KafkaContext {}
impl rdkafka::consumer::ConsumerContext for KafkaContext {}

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub hosts: String,
    pub tls: bool,
    pub producer_linger_ms: u32,
    pub message_timeout_ms: u32,
    pub compression_codec: String,
    pub producer_queue_mib: u32,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            hosts: "localhost:9092".to_owned(),
            tls: false,
            producer_linger_ms: 20,
            message_timeout_ms: 10_000,
            compression_codec: "none".to_owned(),
            producer_queue_mib: 50,
        }
    }
}

pub fn create_producer(
    settings: &KafkaSettings,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &settings.hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", settings.producer_linger_ms.to_string())
        .set("message.timeout.ms", settings.message_timeout_ms.to_string())
        .set("compression.codec", settings.compression_codec.to_owned())
        .set(
            "queue.buffering.max.kbytes",
            (settings.producer_queue_mib * 1024).to_string(),
        );

    if settings.tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }

    debug!("rdkafka producer configuration: {:?}", client_config);
    client_config.create_with_context(KafkaContext {})
}

/// §4.6: consumer group reading the feedback topic, cooperative-sticky so a consumer restart
/// during a rolling deploy doesn't stop-the-world the whole group's assignment.
pub fn create_feedback_consumer(
    settings: &KafkaSettings,
    group_id: &str,
    topics: &[String],
) -> Result<StreamConsumer<KafkaContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &settings.hosts)
        .set("group.id", group_id)
        .set("enable.auto.commit", "true")
        .set("auto.commit.interval.ms", "5000")
        .set("partition.assignment.strategy", "cooperative-sticky")
        .set("auto.offset.reset", "earliest");

    if settings.tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }

    debug!("rdkafka consumer configuration: {:?}", client_config);
    let consumer: StreamConsumer<KafkaContext> = client_config.create_with_context(KafkaContext {})?;
    let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
    rdkafka::consumer::Consumer::subscribe(&consumer, &topic_refs)?;
    Ok(consumer)
}
