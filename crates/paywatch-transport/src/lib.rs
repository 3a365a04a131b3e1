// Transports that learn a payment's status from the checkout server: the
// polled HTTP status endpoint, the WebSocket and SSE push channels, and the
// best-effort notification posts.

pub mod notify;
pub mod poll;
pub mod sse;
pub mod ws;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use paywatch_core::protocol::{PushEvent, TransportKind};
use paywatch_core::status::{CheckoutRequestId, StatusError, StatusReport};

pub use notify::{CheckoutNotifier, HttpNotifier};
pub use poll::HttpStatusQuery;
pub use sse::SseChannel;
pub use ws::WebSocketChannel;

/// Why a single status query produced no usable report.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("network error: {0}")]
    Transport(String),

    #[error("status endpoint returned HTTP {0}")]
    Status(u16),

    #[error(transparent)]
    Malformed(#[from] StatusError),
}

/// One-shot status lookup for a checkout request.
#[async_trait]
pub trait StatusQuery: Send + Sync {
    async fn fetch_status(&self, id: &CheckoutRequestId) -> Result<StatusReport, QueryError>;
}

/// A push subscription delivering the same report shape as the status
/// endpoint.
#[async_trait]
pub trait PushChannel: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Connect and forward events through `tx` until the channel ends or the
    /// receiver is dropped. Unless the receiver is gone, the last event sent
    /// is always [`PushEvent::Closed`].
    async fn subscribe(&self, id: CheckoutRequestId, generation: u64, tx: mpsc::Sender<PushEvent>);
}

/// Classify a push payload: a report, or the raw text when it is not one.
pub(crate) fn classify_payload(raw: &str, generation: u64) -> PushEvent {
    match StatusReport::from_json(raw) {
        Ok(report) => PushEvent::Report { report, generation },
        Err(_) => PushEvent::Malformed {
            raw: raw.to_string(),
            generation,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paywatch_core::status::PaymentStatus;

    #[test]
    fn classify_valid_payload() {
        let ev = classify_payload(r#"{"status":"failed","error_message":"Declined"}"#, 3);
        match ev {
            PushEvent::Report { report, generation } => {
                assert_eq!(generation, 3);
                assert_eq!(report.status, PaymentStatus::Failed);
                assert_eq!(report.error_message.as_deref(), Some("Declined"));
            }
            other => panic!("expected Report, got {other:?}"),
        }
    }

    #[test]
    fn classify_garbage_payload() {
        let ev = classify_payload("ping", 1);
        assert_eq!(
            ev,
            PushEvent::Malformed {
                raw: "ping".into(),
                generation: 1
            }
        );
    }

    #[test]
    fn query_error_messages() {
        assert_eq!(
            QueryError::Status(502).to_string(),
            "status endpoint returned HTTP 502"
        );
        let malformed: QueryError = StatusError::Malformed {
            reason: "missing string field `status`".into(),
        }
        .into();
        assert!(malformed.to_string().contains("malformed status report"));
    }
}
