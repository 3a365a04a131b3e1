// Message types passed between the transports, the watcher loop, and the UI.

use crate::status::{PaymentStatus, StatusReport};

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

/// How status updates are currently reaching the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSocket,
    ServerSentEvents,
    Polling,
}

impl TransportKind {
    /// Banner text shown in the connection-status line.
    pub fn banner(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "Connected via WebSocket",
            TransportKind::ServerSentEvents => "Connected via Server-Sent Events",
            TransportKind::Polling => "Connected via Polling",
        }
    }

    pub fn is_push(&self) -> bool {
        !matches!(self, TransportKind::Polling)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::ServerSentEvents => "sse",
            TransportKind::Polling => "polling",
        };
        f.write_str(name)
    }
}

/// Events produced by a push subscription task.
///
/// Every event carries the `generation` of the task that produced it so the
/// watcher can discard events from a subscription it has already replaced.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// The channel finished its handshake and is delivering updates.
    Opened {
        kind: TransportKind,
        generation: u64,
    },
    /// A well-formed status report arrived.
    Report {
        report: StatusReport,
        generation: u64,
    },
    /// A message arrived that was not a status report.
    Malformed { raw: String, generation: u64 },
    /// The channel ended. `opened` is false when the connection never got
    /// past the handshake.
    Closed {
        kind: TransportKind,
        opened: bool,
        reason: String,
        generation: u64,
    },
}

impl PushEvent {
    pub fn generation(&self) -> u64 {
        match self {
            PushEvent::Opened { generation, .. }
            | PushEvent::Report { generation, .. }
            | PushEvent::Malformed { generation, .. }
            | PushEvent::Closed { generation, .. } => *generation,
        }
    }
}

// ---------------------------------------------------------------------------
// UI protocol
// ---------------------------------------------------------------------------

/// Final presentation of a settled payment.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: PaymentStatus,
    pub title: String,
    pub detail: String,
    pub status_message: String,
    pub transaction_id: Option<String>,
    /// Whether the page should offer a "try again" action.
    pub retry_allowed: bool,
}

impl Outcome {
    /// Build the outcome for a terminal `status`. `report` is the observation
    /// that settled the payment, if any (a client-side timeout has none).
    pub fn for_status(
        status: PaymentStatus,
        report: Option<&StatusReport>,
        test_mode: bool,
    ) -> Self {
        let transaction_id = report.and_then(|r| r.transaction_id.clone());
        let test_note = if test_mode {
            " This was a test transaction."
        } else {
            ""
        };

        match status {
            PaymentStatus::Success => Outcome {
                status,
                title: "Payment Successful!".to_string(),
                detail: format!(
                    "Your {}M-Pesa payment has been processed successfully! Transaction ID: {}",
                    if test_mode { "test " } else { "" },
                    transaction_id.as_deref().unwrap_or("N/A"),
                ),
                status_message: "Payment confirmed! Redirecting...".to_string(),
                transaction_id,
                retry_allowed: false,
            },
            PaymentStatus::Failed => {
                let error = report
                    .and_then(|r| r.error_message.as_deref().or(r.message.as_deref()))
                    // Gateway messages often end in a period of their own.
                    .map(|e| e.trim_end().trim_end_matches('.'))
                    .filter(|e| !e.is_empty())
                    .unwrap_or("Unknown error");
                Outcome {
                    status,
                    title: "Payment Failed".to_string(),
                    detail: format!(
                        "Error: {error}. Please try again or use a different payment method.{test_note}"
                    ),
                    status_message:
                        "Please try again or contact support if the problem persists.".to_string(),
                    transaction_id,
                    retry_allowed: true,
                }
            }
            PaymentStatus::Cancelled => Outcome {
                status,
                title: "Payment Cancelled".to_string(),
                detail: format!(
                    "You cancelled the M-Pesa payment request. You can try again or use a different payment method.{test_note}"
                ),
                status_message: "Payment was cancelled by user.".to_string(),
                transaction_id,
                retry_allowed: true,
            },
            PaymentStatus::Timeout | PaymentStatus::Pending => Outcome {
                status: PaymentStatus::Timeout,
                title: "Payment Timeout".to_string(),
                detail: format!(
                    "The payment request has timed out. Please check your M-Pesa messages or try again.{test_note}"
                ),
                status_message: "Payment request timed out. Please try again.".to_string(),
                transaction_id,
                retry_allowed: true,
            },
        }
    }
}

/// Updates pushed from the watcher loop to whatever renders the page.
#[derive(Debug, Clone, PartialEq)]
pub enum UiUpdate {
    /// The attempt is a simulated test-mode payment.
    TestMode,
    /// The active transport changed.
    Transport(TransportKind),
    /// Raw observation, forwarded for external listeners.
    StatusReceived(StatusReport),
    /// Non-terminal progress text for the status line.
    Progress(String),
    /// Status checks keep failing; the loop is still retrying.
    ConnectionIssue(String),
    /// Seconds left in the payment window.
    Countdown { remaining_secs: u64 },
    /// The payment settled. Sent exactly once per reconciliation.
    Terminal(Outcome),
    /// Navigate away.
    Redirect { target: String },
}

/// Commands sent from the UI to the watcher loop.
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    /// Query the status endpoint immediately.
    CheckNow,
    /// Go back to checkout (only honoured after a non-success outcome).
    Retry,
    /// The view was hidden or shown again.
    Visibility { visible: bool },
    Quit,
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
