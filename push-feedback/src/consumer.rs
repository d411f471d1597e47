//! §4.6: consumes gateway delivery results and updates job progress/failure counters.
//!
//! Split into a fetcher task (reads Kafka, deserializes, pushes onto a bounded channel) and a
//! writer task (drains the channel, applies DB writes). The channel's bound is the backpressure
//! point: when the writer falls behind, the fetcher's `send` blocks and it stops polling Kafka,
//! exactly as §4.6 specifies. An `AtomicI64` pending counter tracks messages handed to the
//! fetcher but not yet durably applied, so shutdown can wait for it to reach zero instead of
//! dropping in-flight feedback.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use push_common::db::{mark_token_invalid, AppRepo, JobRepo};
use push_common::error::PushError;
use push_common::feedback::FeedbackEvent;
use push_common::kafka::KafkaContext;
use rdkafka::consumer::StreamConsumer;
use rdkafka::Message;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub struct FeedbackConsumer {
    name: String,
    consumer: StreamConsumer<KafkaContext>,
    job_repo: JobRepo,
    app_repo: AppRepo,
    buffer_capacity: usize,
    shutdown_drain: Duration,
    liveness: HealthHandle,
    pending: Arc<AtomicI64>,
}

impl FeedbackConsumer {
    pub fn new(
        name: &str,
        consumer: StreamConsumer<KafkaContext>,
        job_repo: JobRepo,
        app_repo: AppRepo,
        buffer_capacity: usize,
        shutdown_drain: Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            consumer,
            job_repo,
            app_repo,
            buffer_capacity,
            shutdown_drain,
            liveness,
            pending: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Runs until `shutdown` resolves, then drains the buffer for up to `shutdown_drain` before
    /// returning.
    pub async fn run(&self, shutdown: impl std::future::Future<Output = ()>) {
        info!(worker = self.name, "starting feedback consumer loop");
        let (tx, mut rx) = mpsc::channel::<FeedbackEvent>(self.buffer_capacity);

        let fetcher = self.fetch_loop(tx);
        tokio::pin!(fetcher);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut fetcher => break,
                _ = &mut shutdown => {
                    info!(worker = self.name, "shutdown requested, draining feedback buffer");
                    break;
                }
                Some(event) = rx.recv() => {
                    self.handle_checked(event).await;
                }
            }
        }

        self.drain(&mut rx).await;
    }

    async fn fetch_loop(&self, tx: mpsc::Sender<FeedbackEvent>) {
        loop {
            self.liveness.report_healthy().await;
            match self.consumer.recv().await {
                Ok(message) => {
                    let Some(payload) = message.payload() else {
                        warn!("feedback message with empty payload, skipping");
                        continue;
                    };
                    match serde_json::from_slice::<FeedbackEvent>(payload) {
                        Ok(event) => {
                            self.pending.fetch_add(1, Ordering::SeqCst);
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "dropping unparseable feedback message");
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "feedback consumer recv error");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    async fn drain(&self, rx: &mut mpsc::Receiver<FeedbackEvent>) {
        let deadline = tokio::time::Instant::now() + self.shutdown_drain;
        loop {
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!(
                    worker = self.name,
                    pending = self.pending.load(Ordering::SeqCst),
                    "shutdown deadline reached with feedback still pending"
                );
                return;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(event)) => self.handle_checked(event).await,
                Ok(None) | Err(_) => return,
            }
        }
    }

    async fn handle_checked(&self, event: FeedbackEvent) {
        let token = event.token.clone();
        if let Err(err) = self.handle_event(event).await {
            error!(token, error = %err, "failed applying feedback event");
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// §4.6 per-event processing plus completion check.
    async fn handle_event(&self, event: FeedbackEvent) -> Result<(), PushError> {
        let (completed, failed) = if event.ok { (1, 0) } else { (0, 1) };
        let updated = self
            .job_repo
            .apply_feedback(event.job_id, completed, failed)
            .await?;

        if !event.ok {
            if event.reason.map(|r| r.invalidates_token()).unwrap_or(false) {
                let app = self.app_repo.fetch(updated.app_id).await?;
                mark_token_invalid(self.job_repo.pool(), &app.name, &event.token).await?;
            }
        }

        if updated.is_fully_delivered() {
            self.job_repo
                .complete_if_fully_delivered(event.job_id)
                .await?;
        }

        Ok(())
    }
}
