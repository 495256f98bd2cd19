//! Subscription lifecycle.
//!
//! ```text
//! Connecting ──▶ Active ◀──▶ Idle
//!     │            │          │
//!     └────────────┴──▶ Closing ──▶ Closed
//! ```
//!
//! There is no reconnect state; a client that reconnects gets a fresh
//! subscription.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Connecting,
    Active,
    Idle,
    Closing,
    Closed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionState::Connecting => "connecting",
            SubscriptionState::Active => "active",
            SubscriptionState::Idle => "idle",
            SubscriptionState::Closing => "closing",
            SubscriptionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ClientDisconnect,
    Unsubscribe,
    Shutdown,
    /// The transport failed while sending.
    SendFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid subscription transition {from} -> {to}")]
pub struct TransitionError {
    pub from: SubscriptionState,
    pub to: SubscriptionState,
}

#[derive(Debug, Clone)]
pub struct SubscriptionLifecycle {
    state: SubscriptionState,
    close_reason: Option<CloseReason>,
}

impl Default for SubscriptionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionLifecycle {
    pub fn new() -> Self {
        Self {
            state: SubscriptionState::Connecting,
            close_reason: None,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Handshake done.
    pub fn activate(&mut self) -> Result<(), TransitionError> {
        self.transition(SubscriptionState::Active)
    }

    /// No broadcast traffic for a while.
    pub fn mark_idle(&mut self) -> Result<(), TransitionError> {
        self.transition(SubscriptionState::Idle)
    }

    /// Traffic resumed after an idle period. A no-op when already active.
    pub fn resume(&mut self) -> Result<(), TransitionError> {
        match self.state {
            SubscriptionState::Active => Ok(()),
            _ => self.transition(SubscriptionState::Active),
        }
    }

    /// Start closing. The first reason wins; later calls are no-ops.
    pub fn begin_close(&mut self, reason: CloseReason) -> Result<(), TransitionError> {
        if self.is_closing() {
            return Ok(());
        }
        self.transition(SubscriptionState::Closing)?;
        self.close_reason = Some(reason);
        Ok(())
    }

    /// Outbound queue drained or the close timeout elapsed.
    pub fn finish_close(&mut self) -> Result<(), TransitionError> {
        self.transition(SubscriptionState::Closed)
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state, SubscriptionState::Closing | SubscriptionState::Closed)
    }

    fn transition(&mut self, to: SubscriptionState) -> Result<(), TransitionError> {
        use SubscriptionState::*;
        let allowed = matches!(
            (self.state, to),
            (Connecting, Active)
                | (Active, Idle)
                | (Idle, Active)
                | (Connecting | Active | Idle, Closing)
                | (Closing, Closed)
        );
        if !allowed {
            return Err(TransitionError { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut lc = SubscriptionLifecycle::new();
        assert_eq!(lc.state(), SubscriptionState::Connecting);
        lc.activate().unwrap();
        lc.mark_idle().unwrap();
        lc.resume().unwrap();
        lc.begin_close(CloseReason::ClientDisconnect).unwrap();
        lc.finish_close().unwrap();
        assert_eq!(lc.state(), SubscriptionState::Closed);
        assert_eq!(lc.close_reason(), Some(CloseReason::ClientDisconnect));
    }

    #[test]
    fn idle_subscription_can_close() {
        let mut lc = SubscriptionLifecycle::new();
        lc.activate().unwrap();
        lc.mark_idle().unwrap();
        lc.begin_close(CloseReason::Shutdown).unwrap();
        assert_eq!(lc.state(), SubscriptionState::Closing);
    }

    #[test]
    fn first_close_reason_wins() {
        let mut lc = SubscriptionLifecycle::new();
        lc.activate().unwrap();
        lc.begin_close(CloseReason::Unsubscribe).unwrap();
        lc.begin_close(CloseReason::Shutdown).unwrap();
        assert_eq!(lc.close_reason(), Some(CloseReason::Unsubscribe));
    }

    #[test]
    fn closed_is_terminal() {
        let mut lc = SubscriptionLifecycle::new();
        lc.begin_close(CloseReason::ClientDisconnect).unwrap();
        lc.finish_close().unwrap();
        let err = lc.activate().unwrap_err();
        assert_eq!(err.from, SubscriptionState::Closed);
        assert_eq!(err.to, SubscriptionState::Active);
    }

    #[test]
    fn invalid_transitions_rejected() {
        let mut lc = SubscriptionLifecycle::new();
        assert!(lc.mark_idle().is_err());
        assert!(lc.finish_close().is_err());
        lc.activate().unwrap();
        assert!(lc.activate().is_err());
        assert_eq!(
            lc.finish_close().unwrap_err().to_string(),
            "invalid subscription transition active -> closed"
        );
    }
}
