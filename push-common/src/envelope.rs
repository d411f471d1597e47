//! §4.5 step 5: the service-specific wire envelope produced to Kafka.

use serde::Serialize;
use serde_json::Value;

use crate::model::{Params, Service};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApnsPayload {
    pub aps: Value,
    pub m: Params,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApnsEnvelope {
    pub device_token: String,
    pub push_expiry: i64,
    pub payload: ApnsPayload,
    pub metadata: Params,
}

#[derive(Debug, Clone, Serialize)]
pub struct GcmEnvelope {
    pub to: String,
    pub notification: Params,
    pub data: Params,
    pub metadata: Params,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Apns(ApnsEnvelope),
    Gcm(GcmEnvelope),
}

impl Envelope {
    pub fn device_token(&self) -> &str {
        match self {
            Envelope::Apns(e) => &e.device_token,
            Envelope::Gcm(e) => &e.to,
        }
    }

    /// `rendered_body` is the output of [`crate::render::render_body`]; `push_expiry` is the
    /// job's `expiresAt` (already validated as "0 = no expiry" by the caller).
    pub fn build(
        service: Service,
        device_token: &str,
        push_expiry: i64,
        rendered_body: Params,
        metadata: Params,
    ) -> Envelope {
        match service {
            Service::Apns => {
                let alert = rendered_body
                    .get("alert")
                    .cloned()
                    .unwrap_or(Value::Null);
                Envelope::Apns(ApnsEnvelope {
                    device_token: device_token.to_owned(),
                    push_expiry,
                    payload: ApnsPayload {
                        aps: serde_json::json!({ "alert": alert }),
                        m: rendered_body,
                    },
                    metadata,
                })
            }
            Service::Gcm => Envelope::Gcm(GcmEnvelope {
                to: device_token.to_owned(),
                notification: rendered_body,
                data: metadata.clone(),
                metadata,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apns_envelope_lifts_alert_into_aps() {
        let mut body = Params::new();
        body.insert("alert".into(), json!("hello"));
        let envelope = Envelope::build(Service::Apns, "tok-1", 0, body, Params::new());
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["deviceToken"], json!("tok-1"));
        assert_eq!(value["payload"]["aps"]["alert"], json!("hello"));
    }

    #[test]
    fn gcm_envelope_uses_to_as_device_token() {
        let envelope = Envelope::build(Service::Gcm, "tok-2", 0, Params::new(), Params::new());
        assert_eq!(envelope.device_token(), "tok-2");
    }
}
