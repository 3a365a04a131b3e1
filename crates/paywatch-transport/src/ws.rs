// WebSocket push channel: subscribes to `ws://.../ws/payment/{id}/` and
// forwards each text frame as a status report.

use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use paywatch_core::config::render_url;
use paywatch_core::protocol::{PushEvent, TransportKind};
use paywatch_core::status::CheckoutRequestId;

use crate::{classify_payload, PushChannel};

pub struct WebSocketChannel {
    url_template: String,
}

impl WebSocketChannel {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
        }
    }
}

#[async_trait]
impl PushChannel for WebSocketChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn subscribe(&self, id: CheckoutRequestId, generation: u64, tx: mpsc::Sender<PushEvent>) {
        let url = render_url(&self.url_template, &id);

        let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                warn!(%url, "WebSocket connect failed: {e}");
                let _ = tx
                    .send(closed(false, format!("connect failed: {e}"), generation))
                    .await;
                return;
            }
        };

        info!(%url, "WebSocket connected");
        let kind = TransportKind::WebSocket;
        if tx.send(PushEvent::Opened { kind, generation }).await.is_err() {
            return;
        }

        // Updates only flow server -> client; the write half is held so the
        // connection stays open.
        let (_write, read) = ws_stream.split();
        if let Ok(end) = process_message_stream(read, &tx, generation).await {
            let _ = tx.send(closed(true, end, generation)).await;
        }
    }
}

fn closed(opened: bool, reason: String, generation: u64) -> PushEvent {
    PushEvent::Closed {
        kind: TransportKind::WebSocket,
        opened,
        reason,
        generation,
    }
}

/// Forward text frames from any WebSocket message stream through `tx`.
///
/// Returns `Ok(reason)` describing how the stream ended, or `Err(())` if the
/// receiver was dropped. Generic over the stream so it can be driven by
/// in-memory streams in tests.
pub async fn process_message_stream<St>(
    mut stream: St,
    tx: &mpsc::Sender<PushEvent>,
    generation: u64,
) -> Result<String, ()>
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if tx.send(classify_payload(&text, generation)).await.is_err() {
                    return Err(());
                }
            }
            Ok(Message::Close(frame)) => {
                info!("Server sent close frame");
                let reason = match frame {
                    Some(f) if !f.reason.is_empty() => {
                        format!("closed by server: {}", f.reason.as_str())
                    }
                    _ => "closed by server".to_string(),
                };
                return Ok(reason);
            }
            Err(e) => {
                warn!("WebSocket error: {e}");
                return Ok(format!("websocket error: {e}"));
            }
            _ => {
                // Binary, Ping, Pong and raw frames carry no status.
            }
        }
    }
    Ok("stream ended".to_string())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use futures_util::SinkExt;
    use paywatch_core::status::PaymentStatus;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Error as WsError;

    fn mock_stream(
        messages: Vec<Result<Message, WsError>>,
    ) -> impl Stream<Item = Result<Message, WsError>> + Unpin {
        stream::iter(messages)
    }

    #[tokio::test]
    async fn text_frames_become_reports() {
        let (tx, mut rx) = mpsc::channel(16);
        let messages = vec![
            Ok(Message::Text(r#"{"status":"pending"}"#.into())),
            Ok(Message::Text(r#"{"status":"cancelled"}"#.into())),
        ];

        let end = process_message_stream(mock_stream(messages), &tx, 2)
            .await
            .unwrap();
        assert_eq!(end, "stream ended");

        for expected in [PaymentStatus::Pending, PaymentStatus::Cancelled] {
            match rx.recv().await.unwrap() {
                PushEvent::Report { report, generation } => {
                    assert_eq!(report.status, expected);
                    assert_eq!(generation, 2);
                }
                other => panic!("expected Report, got {other:?}"),
            }
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_report_text_is_malformed() {
        let (tx, mut rx) = mpsc::channel(16);
        let messages = vec![Ok(Message::Text("hello".into()))];

        process_message_stream(mock_stream(messages), &tx, 1)
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            PushEvent::Malformed { raw, .. } if raw == "hello"
        ));
    }

    #[tokio::test]
    async fn close_frame_stops_processing() {
        let (tx, mut rx) = mpsc::channel(16);
        let messages = vec![
            Ok(Message::Text(r#"{"status":"pending"}"#.into())),
            Ok(Message::Close(None)),
            Ok(Message::Text(r#"{"status":"success"}"#.into())),
        ];

        let end = process_message_stream(mock_stream(messages), &tx, 1)
            .await
            .unwrap();
        assert_eq!(end, "closed by server");

        assert!(matches!(rx.recv().await.unwrap(), PushEvent::Report { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn error_stops_processing() {
        let (tx, mut rx) = mpsc::channel(16);
        let messages = vec![
            Err(WsError::ConnectionClosed),
            Ok(Message::Text(r#"{"status":"success"}"#.into())),
        ];

        let end = process_message_stream(mock_stream(messages), &tx, 1)
            .await
            .unwrap();
        assert!(end.starts_with("websocket error"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn binary_and_ping_are_ignored() {
        let (tx, mut rx) = mpsc::channel(16);
        let messages = vec![
            Ok(Message::Binary(vec![1, 2, 3].into())),
            Ok(Message::Ping(vec![].into())),
            Ok(Message::Pong(vec![].into())),
            Ok(Message::Text(r#"{"status":"failed"}"#.into())),
        ];

        process_message_stream(mock_stream(messages), &tx, 1)
            .await
            .unwrap();

        assert!(matches!(rx.recv().await.unwrap(), PushEvent::Report { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn returns_err_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let messages = vec![Ok(Message::Text(r#"{"status":"pending"}"#.into()))];

        let result = process_message_stream(mock_stream(messages), &tx, 1).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn subscribe_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"{"status":"success","transaction_id":"QGH7ABC123"}"#.into(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
        });

        let channel = WebSocketChannel::new(format!(
            "ws://{addr}/ws/payment/{{checkout_request_id}}/"
        ));
        let (tx, mut rx) = mpsc::channel(16);
        let id = CheckoutRequestId::new("ws_CO_ws").unwrap();
        channel.subscribe(id, 7, tx).await;
        let _ = server.await;

        assert_eq!(
            rx.recv().await.unwrap(),
            PushEvent::Opened {
                kind: TransportKind::WebSocket,
                generation: 7
            }
        );
        match rx.recv().await.unwrap() {
            PushEvent::Report { report, .. } => {
                assert_eq!(report.status, PaymentStatus::Success)
            }
            other => panic!("expected Report, got {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            PushEvent::Closed { opened: true, .. }
        ));
    }

    #[tokio::test]
    async fn connect_failure_reports_unopened_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let channel = WebSocketChannel::new(format!("ws://{addr}/ws/payment/x/"));
        let (tx, mut rx) = mpsc::channel(4);
        channel
            .subscribe(CheckoutRequestId::new("x").unwrap(), 1, tx)
            .await;

        assert!(matches!(
            rx.recv().await.unwrap(),
            PushEvent::Closed { opened: false, kind: TransportKind::WebSocket, .. }
        ));
    }
}
