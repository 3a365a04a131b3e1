// Best-effort notifications to the checkout server: the payment-prompt event
// sent when watching starts and the success ping sent once a payment settles.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use paywatch_core::status::CheckoutRequestId;

/// Fire-and-forget notifications. Implementations log failures and never
/// surface them; the reconciliation must not depend on these calls.
#[async_trait]
pub trait CheckoutNotifier: Send + Sync {
    async fn payment_prompt(&self, id: &CheckoutRequestId, amount: Option<&str>);
    async fn payment_success(&self, id: &CheckoutRequestId);
}

pub struct HttpNotifier {
    http: reqwest::Client,
    prompt_url: String,
    success_url: String,
}

impl HttpNotifier {
    pub fn new(prompt_url: impl Into<String>, success_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            prompt_url: prompt_url.into(),
            success_url: success_url.into(),
        }
    }

    async fn post(&self, url: &str, body: serde_json::Value, what: &str) {
        if url.trim().is_empty() {
            debug!(what, "notification endpoint not configured");
            return;
        }
        match self.http.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => debug!(what, "notification delivered"),
            Ok(resp) => warn!(what, status = %resp.status(), "notification rejected"),
            Err(e) => warn!(what, "notification failed: {e}"),
        }
    }
}

/// JSON body announcing that an STK push prompt is on the customer's phone.
pub fn prompt_body(id: &CheckoutRequestId, amount: Option<&str>) -> serde_json::Value {
    json!({
        "type": "payment_prompt",
        "checkoutRequestId": id.as_str(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "amount": amount.unwrap_or("N/A"),
    })
}

#[async_trait]
impl CheckoutNotifier for HttpNotifier {
    async fn payment_prompt(&self, id: &CheckoutRequestId, amount: Option<&str>) {
        self.post(&self.prompt_url, prompt_body(id, amount), "payment_prompt")
            .await;
    }

    async fn payment_success(&self, id: &CheckoutRequestId) {
        let body = json!({ "checkoutRequestId": id.as_str() });
        self.post(&self.success_url, body, "payment_success").await;
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn prompt_body_shape() {
        let id = CheckoutRequestId::new("ws_CO_9").unwrap();
        let body = prompt_body(&id, Some("1500"));
        assert_eq!(body["type"], "payment_prompt");
        assert_eq!(body["checkoutRequestId"], "ws_CO_9");
        assert_eq!(body["amount"], "1500");
        assert!(body["timestamp"].as_str().is_some());
    }

    #[test]
    fn prompt_body_without_amount() {
        let id = CheckoutRequestId::new("ws_CO_9").unwrap();
        assert_eq!(prompt_body(&id, None)["amount"], "N/A");
    }

    #[tokio::test]
    async fn prompt_is_posted_as_json() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Headers and body may arrive in separate segments.
            let mut request = String::new();
            let mut buf = vec![0u8; 8192];
            while !request.contains("ws_CO_9") {
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                request.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}")
                .await
                .unwrap();
            request
        });

        let notifier = HttpNotifier::new(format!("http://{addr}/api/payment-prompt/"), "");
        let id = CheckoutRequestId::new("ws_CO_9").unwrap();
        notifier.payment_prompt(&id, Some("99")).await;

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/payment-prompt/ "));
        assert!(request.contains("\"payment_prompt\""));
        assert!(request.contains("ws_CO_9"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_swallowed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let notifier = HttpNotifier::new("", format!("http://{addr}/api/send-payment-success/"));
        let id = CheckoutRequestId::new("ws_CO_9").unwrap();
        // Neither call may panic or block.
        notifier.payment_prompt(&id, None).await;
        notifier.payment_success(&id).await;
    }
}
