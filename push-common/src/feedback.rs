//! §4.6 / §6: the wire schema read by the feedback consumer (C6) off the feedback topic(s).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEvent {
    pub job_id: Uuid,
    pub token: String,
    pub ok: bool,
    pub reason: Option<FeedbackReason>,
    pub timestamp: DateTime<Utc>,
}

/// Classes of delivery failure a gateway can report. `InvalidToken` is the one class C6 acts
/// on beyond counters (§4.6: "possibly mark the token invalid in the users table").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackReason {
    InvalidToken,
    Timeout,
    GatewayError,
    Throttled,
    Other,
}

impl FeedbackReason {
    pub fn invalidates_token(&self) -> bool {
        matches!(self, FeedbackReason::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let event = FeedbackEvent {
            job_id: Uuid::now_v7(),
            token: "dev-token".into(),
            ok: false,
            reason: Some(FeedbackReason::InvalidToken),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: FeedbackEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.token, event.token);
        assert!(parsed.reason.unwrap().invalidates_token());
    }
}
