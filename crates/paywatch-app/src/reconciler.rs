// Payment-status reconciliation state machine.
//
// Pure and time-free: the watcher loop decides when a check happens and
// feeds the results in; the reconciler decides what they mean. Once a
// terminal status is reached every further input is ignored.

use std::time::Duration;

use paywatch_core::protocol::Outcome;
use paywatch_core::status::{PaymentStatus, StatusReport};

pub const WAITING_MESSAGE: &str = "Waiting for payment confirmation...";
pub const CONNECTION_ISSUE_MESSAGE: &str = "Connection issues detected. Still checking...";

/// Limits and cadence for one reconciliation.
#[derive(Debug, Clone)]
pub struct CheckPolicy {
    pub max_checks: u32,
    /// A failed check above this count surfaces the connectivity notice.
    pub connection_issue_after: u32,
    /// Visible-page polling cadence; used to estimate elapsed time.
    pub interval: Duration,
    pub test_mode: bool,
}

/// A settled payment: the terminal status, the report that settled it (none
/// for a client-side timeout), and its presentation.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub status: PaymentStatus,
    pub report: Option<StatusReport>,
    pub outcome: Outcome,
}

/// Result of asking whether another check may run.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckGate {
    /// Run the query; `check` is the 1-based number of this check.
    Proceed { check: u32 },
    /// The check budget is spent; the payment timed out.
    Exhausted(Settlement),
    /// Already terminal; do nothing.
    Settled,
}

/// What an observation means for the page.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Progress(String),
    ConnectionIssue(String),
    /// Nothing to show; keep checking.
    Continue,
    Settled(Settlement),
    /// Input arrived after a terminal status.
    Ignored,
}

#[derive(Debug)]
pub struct Reconciler {
    policy: CheckPolicy,
    checks: u32,
    settled: Option<PaymentStatus>,
}

impl Reconciler {
    pub fn new(policy: CheckPolicy) -> Self {
        Self {
            policy,
            checks: 0,
            settled: None,
        }
    }

    /// Number of status checks started so far.
    pub fn checks(&self) -> u32 {
        self.checks
    }

    pub fn settled(&self) -> Option<PaymentStatus> {
        self.settled
    }

    pub fn is_settled(&self) -> bool {
        self.settled.is_some()
    }

    /// Gate a status check. The count increments before the query so that
    /// failed and malformed responses still consume budget.
    pub fn begin_check(&mut self) -> CheckGate {
        if self.is_settled() {
            return CheckGate::Settled;
        }
        if self.checks >= self.policy.max_checks {
            return CheckGate::Exhausted(self.settle(PaymentStatus::Timeout, None));
        }
        self.checks += 1;
        CheckGate::Proceed { check: self.checks }
    }

    /// Apply a well-formed report from the status endpoint or a push channel.
    pub fn apply_report(&mut self, report: StatusReport) -> Verdict {
        if self.is_settled() {
            return Verdict::Ignored;
        }
        if report.status.is_terminal() {
            let status = report.status;
            return Verdict::Settled(self.settle(status, Some(report)));
        }
        Verdict::Progress(self.progress_message(report.message.as_deref()))
    }

    /// A check produced no usable report (network error, HTTP error, or a
    /// malformed body). Checking continues.
    pub fn query_failed(&mut self) -> Verdict {
        if self.is_settled() {
            return Verdict::Ignored;
        }
        if self.checks > self.policy.connection_issue_after {
            Verdict::ConnectionIssue(CONNECTION_ISSUE_MESSAGE.to_string())
        } else {
            Verdict::Continue
        }
    }

    /// The payment window elapsed.
    pub fn expire(&mut self) -> Verdict {
        if self.is_settled() {
            return Verdict::Ignored;
        }
        Verdict::Settled(self.settle(PaymentStatus::Timeout, None))
    }

    /// Status-line text for a pending payment.
    pub fn progress_message(&self, server_message: Option<&str>) -> String {
        let elapsed_secs = self.elapsed().as_secs();

        if self.policy.test_mode {
            return if elapsed_secs > 15 {
                "Finalizing transaction...".to_string()
            } else if elapsed_secs > 8 {
                "Processing payment (this may take a moment)...".to_string()
            } else {
                "Simulating M-Pesa payment...".to_string()
            };
        }

        let minutes = elapsed_secs / 60;
        if minutes > 1 {
            return format!("Still waiting... ({minutes} minutes)");
        }
        server_message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(WAITING_MESSAGE)
            .to_string()
    }

    /// Estimated time spent polling, from the check count.
    fn elapsed(&self) -> Duration {
        self.policy.interval * self.checks
    }

    fn settle(&mut self, status: PaymentStatus, report: Option<StatusReport>) -> Settlement {
        self.settled = Some(status);
        let outcome = Outcome::for_status(status, report.as_ref(), self.policy.test_mode);
        Settlement {
            status,
            report,
            outcome,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
