//! Circuit breaker over consecutive server errors.

use std::time::Duration;
use tokio::time::Instant;

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

/// Per-client breaker. Not persisted: a new process starts closed.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive: u32,
    state: State,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            consecutive: 0,
            state: State::Closed,
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.state {
            State::Closed => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    /// Ask permission to send a request.
    ///
    /// An open breaker refuses until the cooldown has elapsed, then lets a
    /// single trial call through.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            State::Closed => true,
            State::Open { until } if now >= until => {
                self.state = State::HalfOpen {
                    trial_in_flight: true,
                };
                true
            }
            State::Open { .. } => false,
            State::HalfOpen {
                trial_in_flight: true,
            } => false,
            State::HalfOpen {
                trial_in_flight: false,
            } => {
                self.state = State::HalfOpen {
                    trial_in_flight: true,
                };
                true
            }
        }
    }

    /// A server error response was received.
    pub fn record_server_error(&mut self, now: Instant) {
        self.consecutive = self.consecutive.saturating_add(1);
        match self.state {
            State::HalfOpen { .. } => self.open(now),
            State::Closed if self.consecutive >= self.threshold => self.open(now),
            _ => {}
        }
    }

    /// Any other response was received; the upstream is answering.
    pub fn record_response(&mut self) {
        self.consecutive = 0;
        self.state = State::Closed;
    }

    /// The request failed without a response.
    pub fn record_no_response(&mut self, now: Instant) {
        if let State::HalfOpen { .. } = self.state {
            self.open(now);
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = State::Open {
            until: now + self.cooldown,
        };
    }
}
