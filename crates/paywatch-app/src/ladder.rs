// Transport fallback ladder: enabled push transports in order, then polling.
//
// Each push rung gets a fixed number of connection attempts. Any close,
// before or after a successful open, consumes one. Polling is the last rung
// and never fails over.

use paywatch_core::protocol::TransportKind;

#[derive(Debug, Clone)]
pub struct TransportLadder {
    rungs: Vec<TransportKind>,
    index: usize,
    attempts: u32,
    max_attempts: u32,
}

impl TransportLadder {
    /// `push` lists the available push transports in preference order.
    /// Polling is appended automatically.
    pub fn new(push: &[TransportKind], max_attempts: u32) -> Self {
        let mut rungs: Vec<TransportKind> = push.iter().copied().filter(|k| k.is_push()).collect();
        rungs.push(TransportKind::Polling);
        Self {
            rungs,
            index: 0,
            attempts: 1,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn current(&self) -> TransportKind {
        self.rungs[self.index]
    }

    /// Attempts made on the current rung, including the one in progress.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn has_push(&self) -> bool {
        self.rungs.len() > 1
    }

    /// Record that the current push transport closed and pick the transport
    /// to use next: the same one while attempts remain, otherwise the next
    /// rung.
    pub fn on_closed(&mut self) -> TransportKind {
        if !self.current().is_push() {
            return self.current();
        }
        if self.attempts < self.max_attempts {
            self.attempts += 1;
        } else {
            self.index += 1;
            self.attempts = 1;
        }
        self.current()
    }

    /// Start over from the preferred transport.
    pub fn reset(&mut self) {
        self.index = 0;
        self.attempts = 1;
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
