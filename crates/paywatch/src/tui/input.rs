// Keyboard and focus handling.
//
// Translates crossterm events into `UserCommand`s for the watcher. Keys that
// make no sense in the current state (retry while pending, check now after
// settlement) are dropped here rather than sent.

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use paywatch_core::protocol::UserCommand;

use super::ViewState;

/// Map a key press to a command, if any.
pub fn handle_key(key_event: KeyEvent, view_state: &ViewState) -> Option<UserCommand> {
    // Windows reports both press and release.
    if key_event.kind != KeyEventKind::Press {
        return None;
    }

    if key_event.modifiers.contains(KeyModifiers::CONTROL) {
        return match key_event.code {
            KeyCode::Char('c') => Some(UserCommand::Quit),
            _ => None,
        };
    }

    match key_event.code {
        KeyCode::Char('q') | KeyCode::Esc => Some(UserCommand::Quit),
        KeyCode::Char('c') if !view_state.is_settled() => Some(UserCommand::CheckNow),
        KeyCode::Char('r') | KeyCode::Enter if view_state.retry_allowed() => {
            Some(UserCommand::Retry)
        }
        _ => None,
    }
}

/// Terminal focus stands in for page visibility.
pub fn handle_focus(gained: bool) -> UserCommand {
    UserCommand::Visibility { visible: gained }
}

/// Key hints for the current state.
pub fn help_text(view_state: &ViewState) -> &'static str {
    if !view_state.is_settled() {
        " c: check now   q: quit"
    } else if view_state.retry_allowed() {
        " r: try again   q: quit"
    } else {
        " q: quit"
    }
}
