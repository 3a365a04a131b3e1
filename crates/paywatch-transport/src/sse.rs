// Server-Sent Events push channel using reqwest-eventsource.
//
// The checkout server streams one `data:` line per status change, each
// carrying the same JSON object as the polled status endpoint.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest_eventsource::{Event, RequestBuilderExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use paywatch_core::config::render_url;
use paywatch_core::protocol::{PushEvent, TransportKind};
use paywatch_core::status::CheckoutRequestId;

use crate::{classify_payload, PushChannel};

pub struct SseChannel {
    http: reqwest::Client,
    url_template: String,
}

impl SseChannel {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url_template: url_template.into(),
        }
    }
}

#[async_trait]
impl PushChannel for SseChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::ServerSentEvents
    }

    async fn subscribe(&self, id: CheckoutRequestId, generation: u64, tx: mpsc::Sender<PushEvent>) {
        let url = render_url(&self.url_template, &id);
        let request = self
            .http
            .get(&url)
            .header("Accept", "text/event-stream");

        let mut es = match request.eventsource() {
            Ok(es) => es,
            Err(e) => {
                let _ = tx
                    .send(closed(false, format!("failed to create event source: {e}"), generation))
                    .await;
                return;
            }
        };

        let mut opened = false;
        while let Some(event) = es.next().await {
            match event {
                Ok(Event::Open) => {
                    info!(%url, "SSE connected");
                    opened = true;
                    let kind = TransportKind::ServerSentEvents;
                    if tx.send(PushEvent::Opened { kind, generation }).await.is_err() {
                        es.close();
                        return;
                    }
                }
                Ok(Event::Message(msg)) => {
                    debug!(event_type = msg.event.as_str(), "SSE message");
                    if tx.send(classify_payload(&msg.data, generation)).await.is_err() {
                        // Receiver dropped: the watcher has moved on.
                        es.close();
                        return;
                    }
                }
                Err(err) => {
                    // reqwest-eventsource would reconnect on its own; the
                    // ladder owns retries, so stop here.
                    warn!(?err, "SSE stream error");
                    es.close();
                    let _ = tx.send(closed(opened, extract_error_message(&err), generation)).await;
                    return;
                }
            }
        }

        let _ = tx
            .send(closed(opened, "stream ended".to_string(), generation))
            .await;
    }
}

fn closed(opened: bool, reason: String, generation: u64) -> PushEvent {
    PushEvent::Closed {
        kind: TransportKind::ServerSentEvents,
        opened,
        reason,
        generation,
    }
}

/// Extract a human-readable message from an SSE error.
fn extract_error_message(err: &reqwest_eventsource::Error) -> String {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, _response) => {
            format!("server returned status {status}")
        }
        reqwest_eventsource::Error::InvalidContentType(content_type, _response) => {
            format!("unexpected content type {content_type:?}")
        }
        reqwest_eventsource::Error::Transport(e) => format!("network error: {e}"),
        reqwest_eventsource::Error::StreamEnded => "stream ended".to_string(),
        other => format!("stream error: {other}"),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
