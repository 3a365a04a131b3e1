// Payment status model: checkout request IDs, the status enumeration, and the
// JSON status report shared by the HTTP endpoint and the push channels.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Prefix the checkout server uses for simulated (no-money) payments.
pub const TEST_MODE_PREFIX: &str = "test_";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum StatusError {
    #[error("checkout request id must not be blank")]
    BlankCheckoutId,

    #[error("malformed status report: {reason}")]
    Malformed { reason: String },
}

// ---------------------------------------------------------------------------
// CheckoutRequestId
// ---------------------------------------------------------------------------

/// Opaque token identifying one payment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckoutRequestId(String);

impl CheckoutRequestId {
    pub fn new(id: impl Into<String>) -> Result<Self, StatusError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(StatusError::BlankCheckoutId);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Test-mode attempts are simulated server-side and settle within
    /// seconds, so they are polled faster and get their own progress text.
    pub fn is_test_mode(&self) -> bool {
        self.0.starts_with(TEST_MODE_PREFIX)
    }
}

impl std::fmt::Display for CheckoutRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// PaymentStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
    Timeout,
}

impl PaymentStatus {
    /// Parse a wire status string. Anything unrecognised is still in flight
    /// as far as the client is concerned.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => PaymentStatus::Success,
            "failed" => PaymentStatus::Failed,
            "cancelled" => PaymentStatus::Cancelled,
            "timeout" => PaymentStatus::Timeout,
            _ => PaymentStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StatusReport
// ---------------------------------------------------------------------------

/// One status observation as delivered by the status endpoint or a push
/// channel.
///
/// Wire shape: `{ "status": "...", "message"?, "transaction_id"?, "amount"?,
/// "error_message"? }`. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: PaymentStatus,
    pub message: Option<String>,
    pub transaction_id: Option<String>,
    pub amount: Option<String>,
    pub error_message: Option<String>,
}

impl StatusReport {
    pub fn new(status: PaymentStatus) -> Self {
        Self {
            status,
            message: None,
            transaction_id: None,
            amount: None,
            error_message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_transaction_id(mut self, id: impl Into<String>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Parse a raw JSON body.
    pub fn from_json(body: &str) -> Result<Self, StatusError> {
        let value: Value = serde_json::from_str(body).map_err(|e| StatusError::Malformed {
            reason: e.to_string(),
        })?;
        Self::from_value(&value)
    }

    /// Build a report from an already-decoded JSON value. The object must
    /// carry a string `status`; the optional fields accept strings or numbers
    /// (the server serialises `amount` either way) and treat empty strings
    /// as absent.
    pub fn from_value(value: &Value) -> Result<Self, StatusError> {
        let obj = value.as_object().ok_or_else(|| StatusError::Malformed {
            reason: "expected a JSON object".to_string(),
        })?;
        let status = obj
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| StatusError::Malformed {
                reason: "missing string field `status`".to_string(),
            })?;

        Ok(Self {
            status: PaymentStatus::parse(status),
            message: optional_text(value, "message"),
            transaction_id: optional_text(value, "transaction_id"),
            amount: optional_text(value, "amount"),
            error_message: optional_text(value, "error_message"),
        })
    }
}

fn optional_text(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_statuses() {
        assert_eq!(PaymentStatus::parse("success"), PaymentStatus::Success);
        assert_eq!(PaymentStatus::parse("failed"), PaymentStatus::Failed);
        assert_eq!(PaymentStatus::parse("cancelled"), PaymentStatus::Cancelled);
        assert_eq!(PaymentStatus::parse("timeout"), PaymentStatus::Timeout);
        assert_eq!(PaymentStatus::parse("pending"), PaymentStatus::Pending);
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(PaymentStatus::parse("SUCCESS"), PaymentStatus::Success);
        assert_eq!(PaymentStatus::parse(" Cancelled "), PaymentStatus::Cancelled);
    }

    #[test]
    fn unknown_status_is_pending() {
        assert_eq!(PaymentStatus::parse("processing"), PaymentStatus::Pending);
        assert_eq!(PaymentStatus::parse(""), PaymentStatus::Pending);
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!PaymentStatus::Pending.is_terminal());
        for s in [
            PaymentStatus::Success,
            PaymentStatus::Failed,
            PaymentStatus::Cancelled,
            PaymentStatus::Timeout,
        ] {
            assert!(s.is_terminal(), "{s} should be terminal");
        }
    }

    #[test]
    fn blank_checkout_id_rejected() {
        assert_eq!(
            CheckoutRequestId::new("   "),
            Err(StatusError::BlankCheckoutId)
        );
    }

    #[test]
    fn checkout_id_is_trimmed() {
        let id = CheckoutRequestId::new("  ws_CO_123 ").unwrap();
        assert_eq!(id.as_str(), "ws_CO_123");
        assert!(!id.is_test_mode());
    }

    #[test]
    fn test_prefix_enables_test_mode() {
        let id = CheckoutRequestId::new("test_abc").unwrap();
        assert!(id.is_test_mode());
    }

    #[test]
    fn report_from_full_server_body() {
        let body = r#"{
            "status": "success",
            "message": "Payment completed successfully! Your order is confirmed.",
            "transaction_id": "QGH7ABC123",
            "amount": "1500.00"
        }"#;
        let report = StatusReport::from_json(body).unwrap();
        assert_eq!(report.status, PaymentStatus::Success);
        assert_eq!(report.transaction_id.as_deref(), Some("QGH7ABC123"));
        assert_eq!(report.amount.as_deref(), Some("1500.00"));
        assert!(report.error_message.is_none());
    }

    #[test]
    fn empty_transaction_id_is_absent() {
        let report =
            StatusReport::from_json(r#"{"status":"pending","transaction_id":""}"#).unwrap();
        assert!(report.transaction_id.is_none());
    }

    #[test]
    fn numeric_amount_accepted() {
        let report = StatusReport::from_json(r#"{"status":"pending","amount":250}"#).unwrap();
        assert_eq!(report.amount.as_deref(), Some("250"));
    }

    #[test]
    fn missing_status_is_malformed() {
        let err = StatusReport::from_json(r#"{"error":"Transaction not found"}"#).unwrap_err();
        assert!(matches!(err, StatusError::Malformed { .. }));
    }

    #[test]
    fn non_string_status_is_malformed() {
        let err = StatusReport::from_json(r#"{"status":1}"#).unwrap_err();
        assert!(matches!(err, StatusError::Malformed { .. }));
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(StatusReport::from_json("<html>502</html>").is_err());
        assert!(StatusReport::from_json("[]").is_err());
    }
}
