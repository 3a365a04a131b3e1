// Watcher event loop: owns one reconciliation from start to redirect.
//
// Drives the transport ladder (push channels first, polling last), the
// polling timer, the payment-window countdown, and user commands, feeding
// every observation through the `Reconciler`. UI updates go out over an
// mpsc channel; the caller decides how to render them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use paywatch_core::config::Config;
use paywatch_core::db::Database;
use paywatch_core::protocol::{PushEvent, TransportKind, UiUpdate, UserCommand};
use paywatch_core::status::{CheckoutRequestId, PaymentStatus, StatusReport};
use paywatch_transport::{
    CheckoutNotifier, HttpNotifier, HttpStatusQuery, PushChannel, SseChannel, StatusQuery,
    WebSocketChannel,
};

use crate::ladder::TransportLadder;
use crate::reconciler::{CheckGate, CheckPolicy, Reconciler, Settlement, Verdict};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Pause before reconnecting the same push transport.
pub const PUSH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Countdown update cadence while a payment window is configured.
pub const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// Stand-in for "never" when a delay does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + delay`, clamped instead of overflowing.
fn instant_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

// ---------------------------------------------------------------------------
// Settings and context
// ---------------------------------------------------------------------------

/// Timing and targets for one reconciliation, resolved for a specific
/// checkout request (test mode and URL templates already applied).
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub hidden_interval: Duration,
    pub max_checks: u32,
    pub connection_issue_after: u32,
    pub max_push_attempts: u32,
    pub push_retry_delay: Duration,
    pub success_redirect_delay: Duration,
    pub failure_redirect_delay: Option<Duration>,
    pub payment_window: Option<Duration>,
    pub complete_url: String,
    pub checkout_url: String,
}

impl WatchSettings {
    pub fn from_config(config: &Config, id: &CheckoutRequestId) -> Self {
        let test_mode = id.is_test_mode();
        WatchSettings {
            initial_delay: config.polling.initial_delay(),
            interval: config.polling.interval_for(test_mode),
            hidden_interval: config.polling.hidden_interval(),
            max_checks: config.polling.max_checks,
            connection_issue_after: config.polling.connection_issue_after,
            max_push_attempts: config.push.max_attempts,
            push_retry_delay: PUSH_RETRY_DELAY,
            success_redirect_delay: config.timing.success_redirect_delay(),
            failure_redirect_delay: config.timing.failure_redirect_delay(),
            payment_window: config.timing.payment_window(),
            complete_url: config.endpoints.complete_url(id),
            checkout_url: config.endpoints.checkout_url(id),
        }
    }
}

/// Everything the watcher needs: the attempt, its settings, and the
/// collaborators it talks to.
pub struct WatchContext {
    pub id: CheckoutRequestId,
    pub amount: Option<String>,
    pub settings: WatchSettings,
    pub query: Arc<dyn StatusQuery>,
    /// Push transports in preference order.
    pub push: Vec<Arc<dyn PushChannel>>,
    pub notifier: Arc<dyn CheckoutNotifier>,
    pub db: Arc<Database>,
}

impl WatchContext {
    /// Wire up the HTTP implementations described by `config`.
    pub fn from_config(
        config: &Config,
        id: CheckoutRequestId,
        amount: Option<String>,
        db: Arc<Database>,
    ) -> anyhow::Result<Self> {
        let query = HttpStatusQuery::new(
            config.endpoints.status.clone(),
            config.polling.request_timeout(),
        )?;

        let mut push: Vec<Arc<dyn PushChannel>> = Vec::new();
        if config.push.websocket {
            push.push(Arc::new(WebSocketChannel::new(
                config.endpoints.websocket.clone(),
            )));
        }
        if config.push.sse {
            push.push(Arc::new(SseChannel::new(config.endpoints.stream.clone())));
        }

        let notifier = HttpNotifier::new(
            config.endpoints.prompt.clone(),
            config.endpoints.success.clone(),
        );

        Ok(WatchContext {
            settings: WatchSettings::from_config(config, &id),
            id,
            amount,
            query: Arc::new(query),
            push,
            notifier: Arc::new(notifier),
            db,
        })
    }
}

/// How a reconciliation ended.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchSummary {
    /// `Pending` if the user quit before the payment settled.
    pub status: PaymentStatus,
    pub checks: u32,
    pub transport: TransportKind,
    pub redirect: Option<String>,
}

// ---------------------------------------------------------------------------
// Loop state
// ---------------------------------------------------------------------------

struct Watch {
    ctx: WatchContext,
    reconciler: Reconciler,
    ladder: TransportLadder,
    ui_tx: mpsc::Sender<UiUpdate>,
    push_tx: mpsc::Sender<PushEvent>,
    push_task: Option<JoinHandle<()>>,
    /// Identifies the live push task. Incremented on every transport start;
    /// events tagged with an older generation are dropped.
    generation: u64,
    visible: bool,
    next_poll: Option<Instant>,
}

impl Watch {
    fn new(ctx: WatchContext, ui_tx: mpsc::Sender<UiUpdate>, push_tx: mpsc::Sender<PushEvent>) -> Self {
        let policy = CheckPolicy {
            max_checks: ctx.settings.max_checks,
            connection_issue_after: ctx.settings.connection_issue_after,
            interval: ctx.settings.interval,
            test_mode: ctx.id.is_test_mode(),
        };
        let kinds: Vec<TransportKind> = ctx.push.iter().map(|c| c.kind()).collect();
        let ladder = TransportLadder::new(&kinds, ctx.settings.max_push_attempts);

        Watch {
            reconciler: Reconciler::new(policy),
            ladder,
            ctx,
            ui_tx,
            push_tx,
            push_task: None,
            generation: 0,
            visible: true,
            next_poll: None,
        }
    }

    async fn emit(&self, update: UiUpdate) {
        let _ = self.ui_tx.send(update).await;
    }

    fn poll_interval(&self) -> Duration {
        if self.visible {
            self.ctx.settings.interval
        } else {
            self.ctx.settings.hidden_interval
        }
    }

    /// Announce the attempt: test-mode banner, ledger row, prompt event.
    async fn announce(&self) {
        if self.ctx.id.is_test_mode() {
            self.emit(UiUpdate::TestMode).await;
        }
        if let Err(e) = self
            .ctx
            .db
            .record_attempt(&self.ctx.id, self.ctx.amount.as_deref())
        {
            error!("failed to record payment attempt: {e:#}");
        }

        let notifier = Arc::clone(&self.ctx.notifier);
        let id = self.ctx.id.clone();
        let amount = self.ctx.amount.clone();
        tokio::spawn(async move {
            notifier.payment_prompt(&id, amount.as_deref()).await;
        });
    }

    fn stop_push(&mut self) {
        if let Some(handle) = self.push_task.take() {
            handle.abort();
        }
    }

    /// Switch to `kind`, tearing down whatever ran before. Push transports
    /// connect after `delay`; polling schedules its first check after the
    /// initial delay.
    async fn start_transport(&mut self, kind: TransportKind, delay: Duration) {
        self.stop_push();
        self.generation += 1;

        let channel = if kind.is_push() {
            self.ctx.push.iter().find(|c| c.kind() == kind).cloned()
        } else {
            None
        };

        match channel {
            Some(channel) => {
                info!(transport = %kind, generation = self.generation, "connecting push transport");
                self.next_poll = None;
                let id = self.ctx.id.clone();
                let tx = self.push_tx.clone();
                let generation = self.generation;
                self.push_task = Some(tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    channel.subscribe(id, generation, tx).await;
                }));
            }
            None => {
                info!("using polling fallback");
                self.next_poll = Some(instant_after(self.ctx.settings.initial_delay));
                self.emit(UiUpdate::Transport(TransportKind::Polling)).await;
            }
        }
    }

    async fn handle_push(&mut self, event: PushEvent) -> Option<Settlement> {
        if event.generation() != self.generation {
            debug!(
                event_generation = event.generation(),
                current = self.generation,
                "discarding stale push event"
            );
            return None;
        }

        match event {
            PushEvent::Opened { kind, .. } => {
                info!(transport = %kind, "push transport connected");
                self.emit(UiUpdate::Transport(kind)).await;
                None
            }
            PushEvent::Report { report, .. } => self.apply_report(report).await,
            PushEvent::Malformed { raw, .. } => {
                warn!(len = raw.len(), "ignoring malformed push message");
                None
            }
            PushEvent::Closed {
                kind,
                opened,
                reason,
                ..
            } => {
                info!(transport = %kind, opened, %reason, "push transport closed");
                let next = self.ladder.on_closed();
                let delay = if next == kind {
                    self.ctx.settings.push_retry_delay
                } else {
                    info!(from = %kind, to = %next, "falling back to next transport");
                    Duration::ZERO
                };
                self.start_transport(next, delay).await;
                None
            }
        }
    }

    /// Run one counted status check against the status endpoint.
    async fn check_now(&mut self) -> Option<Settlement> {
        match self.reconciler.begin_check() {
            CheckGate::Settled => None,
            CheckGate::Exhausted(settlement) => {
                info!(checks = self.reconciler.checks(), "maximum status checks reached");
                Some(settlement)
            }
            CheckGate::Proceed { check } => {
                debug!(check, "checking payment status");
                match self.ctx.query.fetch_status(&self.ctx.id).await {
                    Ok(report) => self.apply_report(report).await,
                    Err(e) => {
                        warn!(check, "status check failed: {e}");
                        let verdict = self.reconciler.query_failed();
                        self.handle_verdict(verdict).await
                    }
                }
            }
        }
    }

    async fn apply_report(&mut self, report: StatusReport) -> Option<Settlement> {
        debug!(status = %report.status, "status report");
        self.emit(UiUpdate::StatusReceived(report.clone())).await;
        if !report.status.is_terminal() {
            self.record(PaymentStatus::Pending, Some(&report));
        }
        let verdict = self.reconciler.apply_report(report);
        self.handle_verdict(verdict).await
    }

    async fn handle_verdict(&mut self, verdict: Verdict) -> Option<Settlement> {
        match verdict {
            Verdict::Progress(message) => {
                self.emit(UiUpdate::Progress(message)).await;
                None
            }
            Verdict::ConnectionIssue(message) => {
                self.emit(UiUpdate::ConnectionIssue(message)).await;
                None
            }
            Verdict::Continue | Verdict::Ignored => None,
            Verdict::Settled(settlement) => Some(settlement),
        }
    }

    async fn set_visible(&mut self, visible: bool) {
        if self.visible == visible {
            return;
        }
        self.visible = visible;
        debug!(visible, "visibility changed");

        if self.next_poll.is_some() {
            self.next_poll = Some(instant_after(self.poll_interval()));
        }

        if visible && self.ladder.current() == TransportKind::Polling && self.ladder.has_push() {
            info!("view visible again, retrying push transports");
            self.ladder.reset();
            let kind = self.ladder.current();
            self.start_transport(kind, Duration::ZERO).await;
        }
    }

    fn record(&self, status: PaymentStatus, report: Option<&StatusReport>) {
        let result = self.ctx.db.record_status(
            &self.ctx.id,
            status,
            report.and_then(|r| r.transaction_id.as_deref()),
            report.and_then(|r| r.message.as_deref()),
            self.reconciler.checks(),
        );
        match result {
            Ok(true) => {}
            Ok(false) => warn!(%status, "ledger already holds a terminal status"),
            Err(e) => error!("failed to record payment status: {e:#}"),
        }
    }

    fn summary(&self, status: PaymentStatus, redirect: Option<String>) -> WatchSummary {
        WatchSummary {
            status,
            checks: self.reconciler.checks(),
            transport: self.ladder.current(),
            redirect,
        }
    }

    /// Terminal phase: stop transports, persist, tell the UI, then redirect.
    async fn finish(
        mut self,
        settlement: Settlement,
        cmd_rx: &mut mpsc::Receiver<UserCommand>,
    ) -> WatchSummary {
        self.stop_push();
        self.next_poll = None;

        info!(
            status = %settlement.status,
            checks = self.reconciler.checks(),
            "payment settled"
        );
        self.record(settlement.status, settlement.report.as_ref());
        self.emit(UiUpdate::Terminal(settlement.outcome)).await;

        let settings = &self.ctx.settings;
        let target = if settlement.status == PaymentStatus::Success {
            let notifier = Arc::clone(&self.ctx.notifier);
            let id = self.ctx.id.clone();
            tokio::spawn(async move { notifier.payment_success(&id).await });

            wait_for_redirect(Some(settings.success_redirect_delay), false, cmd_rx)
                .await
                .then(|| settings.complete_url.clone())
        } else {
            wait_for_redirect(settings.failure_redirect_delay, true, cmd_rx)
                .await
                .then(|| settings.checkout_url.clone())
        };

        if let Some(target) = &target {
            info!(%target, "redirecting");
            self.emit(UiUpdate::Redirect {
                target: target.clone(),
            })
            .await;
        }

        self.summary(settlement.status, target)
    }
}

/// Wait until the redirect should happen. Returns `false` if the user quit
/// (or can no longer send a retry) first.
async fn wait_for_redirect(
    delay: Option<Duration>,
    accept_retry: bool,
    cmd_rx: &mut mpsc::Receiver<UserCommand>,
) -> bool {
    let mut cmd_open = true;
    let sleep = tokio::time::sleep(delay.unwrap_or(Duration::ZERO));
    tokio::pin!(sleep);

    loop {
        if delay.is_none() && !cmd_open {
            return false;
        }
        tokio::select! {
            _ = &mut sleep, if delay.is_some() => return true,
            cmd = cmd_rx.recv(), if cmd_open => match cmd {
                Some(UserCommand::Quit) => return false,
                Some(UserCommand::Retry) if accept_retry => return true,
                Some(other) => debug!(?other, "command ignored after settlement"),
                None => cmd_open = false,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Watch one payment until it settles and the redirect (if any) is emitted,
/// or until the user quits.
pub async fn run(
    ctx: WatchContext,
    mut cmd_rx: mpsc::Receiver<UserCommand>,
    ui_tx: mpsc::Sender<UiUpdate>,
) -> anyhow::Result<WatchSummary> {
    let (push_tx, mut push_rx) = mpsc::channel(64);
    let mut watch = Watch::new(ctx, ui_tx, push_tx);
    info!(
        checkout_request_id = %watch.ctx.id,
        test_mode = watch.ctx.id.is_test_mode(),
        "watching payment"
    );

    watch.announce().await;
    let first = watch.ladder.current();
    watch.start_transport(first, Duration::ZERO).await;

    let deadline = watch.ctx.settings.payment_window.and_then(|window| {
        let deadline = Instant::now().checked_add(window);
        if deadline.is_none() {
            warn!(?window, "payment window out of range, running without a deadline");
        }
        deadline
    });
    let mut countdown = tokio::time::interval(COUNTDOWN_TICK);
    countdown.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let settlement = loop {
        let poll_at = watch.next_poll;

        tokio::select! {
            Some(event) = push_rx.recv() => {
                if let Some(settlement) = watch.handle_push(event).await {
                    break settlement;
                }
            }

            _ = tokio::time::sleep_until(poll_at.unwrap_or_else(Instant::now)), if poll_at.is_some() => {
                watch.next_poll = Some(instant_after(watch.poll_interval()));
                if let Some(settlement) = watch.check_now().await {
                    break settlement;
                }
            }

            _ = countdown.tick(), if deadline.is_some() => {
                if let Some(deadline) = deadline {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    watch.emit(UiUpdate::Countdown { remaining_secs: remaining.as_secs() }).await;
                    if remaining.is_zero() {
                        info!("payment window elapsed");
                        let verdict = watch.reconciler.expire();
                        if let Some(settlement) = watch.handle_verdict(verdict).await {
                            break settlement;
                        }
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                let closed = cmd.is_none();
                match cmd {
                    Some(UserCommand::CheckNow) => {
                        if let Some(settlement) = watch.check_now().await {
                            break settlement;
                        }
                    }
                    Some(UserCommand::Visibility { visible }) => watch.set_visible(visible).await,
                    Some(UserCommand::Retry) => debug!("retry ignored while payment is pending"),
                    // A closed command channel means the UI is gone: nobody is
                    // left to show the outcome to.
                    Some(UserCommand::Quit) | None => {
                        info!(closed, "watch abandoned before payment settled");
                        watch.stop_push();
                        return Ok(watch.summary(PaymentStatus::Pending, None));
                    }
                }
            }
        }
    };

    Ok(watch.finish(settlement, &mut cmd_rx).await)
}
