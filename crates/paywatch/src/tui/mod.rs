// Terminal waiting page.
//
// The TUI owns a `ViewState` built from the watcher's `UiUpdate` stream and
// re-renders it on a fixed tick. Key presses and terminal focus changes are
// translated into `UserCommand`s for the watcher.

pub mod input;

use std::io::stdout;
use std::time::Duration;

use crossterm::event::{DisableFocusChange, EnableFocusChange, Event, EventStream};
use crossterm::execute;
use futures_util::StreamExt;
use ratatui::layout::{Alignment, Constraint, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::Frame;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use paywatch_app::reconciler::WAITING_MESSAGE;
use paywatch_core::protocol::{Outcome, TransportKind, UiUpdate, UserCommand};
use paywatch_core::status::PaymentStatus;

/// Alert shown while the customer still has to act on their phone.
pub const PENDING_ALERT: &str =
    "Check your phone and enter your M-Pesa PIN to complete the payment.";

/// How long the final frame stays up before the TUI exits after a redirect.
const REDIRECT_LINGER: Duration = Duration::from_millis(300);

// ---------------------------------------------------------------------------
// ViewState
// ---------------------------------------------------------------------------

/// Everything the waiting page shows, mirrored from `UiUpdate`s.
#[derive(Debug, Clone)]
pub struct ViewState {
    pub test_mode: bool,
    /// Active transport; `None` until the first one connects.
    pub transport: Option<TransportKind>,
    pub status_message: String,
    /// Set while status checks keep failing; cleared by the next report.
    pub connection_issue: Option<String>,
    pub remaining_secs: Option<u64>,
    pub last_status: Option<PaymentStatus>,
    pub reports_seen: u32,
    pub outcome: Option<Outcome>,
    pub redirect: Option<String>,
}

impl Default for ViewState {
    fn default() -> Self {
        ViewState {
            test_mode: false,
            transport: None,
            status_message: WAITING_MESSAGE.to_string(),
            connection_issue: None,
            remaining_secs: None,
            last_status: None,
            reports_seen: 0,
            outcome: None,
            redirect: None,
        }
    }
}

impl ViewState {
    pub fn title(&self) -> String {
        match (&self.outcome, self.test_mode) {
            (Some(outcome), _) => outcome.title.clone(),
            (None, true) => "Test Payment in Progress".to_string(),
            (None, false) => "Waiting for M-Pesa Payment".to_string(),
        }
    }

    pub fn alert(&self) -> &str {
        self.outcome
            .as_ref()
            .map(|o| o.detail.as_str())
            .unwrap_or(PENDING_ALERT)
    }

    /// Connection line: the connectivity notice wins over the banner.
    pub fn connection_line(&self) -> Option<&str> {
        if self.outcome.is_some() {
            return None;
        }
        self.connection_issue
            .as_deref()
            .or_else(|| self.transport.map(|t| t.banner()))
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn retry_allowed(&self) -> bool {
        self.outcome.as_ref().is_some_and(|o| o.retry_allowed)
    }
}

/// Fold one watcher update into the view.
pub fn apply_ui_update(state: &mut ViewState, update: UiUpdate) {
    match update {
        UiUpdate::TestMode => state.test_mode = true,
        UiUpdate::Transport(kind) => state.transport = Some(kind),
        UiUpdate::StatusReceived(report) => {
            state.last_status = Some(report.status);
            state.reports_seen += 1;
            state.connection_issue = None;
        }
        UiUpdate::Progress(message) => {
            if !state.is_settled() {
                state.status_message = message;
            }
        }
        UiUpdate::ConnectionIssue(message) => {
            if !state.is_settled() {
                state.connection_issue = Some(message);
            }
        }
        UiUpdate::Countdown { remaining_secs } => state.remaining_secs = Some(remaining_secs),
        UiUpdate::Terminal(outcome) => {
            state.status_message = outcome.status_message.clone();
            state.connection_issue = None;
            state.outcome = Some(outcome);
        }
        UiUpdate::Redirect { target } => state.redirect = Some(target),
    }
}

/// `MM:SS`, as on the checkout page's countdown.
pub fn format_countdown(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn outcome_color(state: &ViewState) -> Color {
    match state.outcome.as_ref().map(|o| o.status) {
        Some(PaymentStatus::Success) => Color::Green,
        Some(PaymentStatus::Cancelled) | Some(PaymentStatus::Timeout) => Color::Yellow,
        Some(_) => Color::Red,
        None => Color::Cyan,
    }
}

fn render_frame(frame: &mut Frame, state: &ViewState) {
    let [title_area, alert_area, status_area, conn_area, countdown_area, help_area] =
        Layout::vertical([
            Constraint::Length(3),
            Constraint::Min(4),
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Length(1),
        ])
        .areas(frame.area());

    let color = outcome_color(state);

    let mut title_spans = vec![Span::styled(
        state.title(),
        Style::default().fg(color).add_modifier(Modifier::BOLD),
    )];
    if state.test_mode {
        title_spans.push(Span::styled(
            "  [TEST MODE]",
            Style::default().fg(Color::Magenta),
        ));
    }
    let title = Paragraph::new(Line::from(title_spans))
        .alignment(Alignment::Center)
        .block(Block::default().borders(Borders::ALL));
    frame.render_widget(title, title_area);

    let alert = Paragraph::new(state.alert())
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title(" M-Pesa "));
    frame.render_widget(alert, alert_area);

    frame.render_widget(
        Paragraph::new(state.status_message.as_str()).alignment(Alignment::Center),
        status_area,
    );

    if let Some(line) = state.connection_line() {
        let style = if state.connection_issue.is_some() {
            Style::default().fg(Color::Yellow)
        } else {
            Style::default().fg(Color::DarkGray)
        };
        frame.render_widget(
            Paragraph::new(Span::styled(line, style)).alignment(Alignment::Center),
            conn_area,
        );
    }

    if let (Some(secs), false) = (state.remaining_secs, state.is_settled()) {
        frame.render_widget(
            Paragraph::new(format!("Time remaining: {}", format_countdown(secs)))
                .alignment(Alignment::Center),
            countdown_area,
        );
    }

    frame.render_widget(
        Paragraph::new(input::help_text(state)).style(Style::default().fg(Color::DarkGray)),
        help_area,
    );
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Run the waiting page until the watcher redirects, the watcher goes away,
/// or the user quits. Returns the redirect target, if one was issued.
pub async fn run(
    mut ui_rx: mpsc::Receiver<UiUpdate>,
    cmd_tx: mpsc::Sender<UserCommand>,
) -> anyhow::Result<Option<String>> {
    let mut terminal = ratatui::init();
    if let Err(e) = execute!(stdout(), EnableFocusChange) {
        warn!("terminal does not support focus events: {e}");
    }

    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let _ = execute!(stdout(), DisableFocusChange);
        ratatui::restore();
        original_hook(panic_info);
    }));

    let mut view_state = ViewState::default();
    let mut event_stream = EventStream::new();

    let mut render_tick = tokio::time::interval(Duration::from_millis(100));
    render_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let result = loop {
        tokio::select! {
            update = ui_rx.recv() => {
                match update {
                    Some(update) => {
                        let redirected = matches!(update, UiUpdate::Redirect { .. });
                        apply_ui_update(&mut view_state, update);
                        if redirected {
                            terminal.draw(|frame| render_frame(frame, &view_state))?;
                            tokio::time::sleep(REDIRECT_LINGER).await;
                            break Ok(view_state.redirect.clone());
                        }
                    }
                    // Watcher finished without a redirect.
                    None => break Ok(view_state.redirect.clone()),
                }
            }

            maybe_event = event_stream.next() => {
                let command = match maybe_event {
                    Some(Ok(Event::Key(key_event))) => input::handle_key(key_event, &view_state),
                    Some(Ok(Event::FocusGained)) => Some(input::handle_focus(true)),
                    Some(Ok(Event::FocusLost)) => Some(input::handle_focus(false)),
                    Some(Ok(_)) => None,
                    Some(Err(e)) => break Err(anyhow::Error::from(e).context("terminal input error")),
                    None => break Ok(None),
                };
                if let Some(command) = command {
                    debug!(?command, "user command");
                    let quit = command == UserCommand::Quit;
                    let _ = cmd_tx.send(command).await;
                    if quit {
                        break Ok(None);
                    }
                }
            }

            _ = render_tick.tick() => {
                terminal.draw(|frame| render_frame(frame, &view_state))?;
            }
        }
    };

    let _ = execute!(stdout(), DisableFocusChange);
    ratatui::restore();

    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
