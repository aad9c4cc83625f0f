//! Single-flight diagnostic command correlation.
//!
//! The transport gives no sequencing guarantee: telemetry frames keep
//! arriving while a command is in flight, and the response is identified
//! purely by content. This module is the state machine that owns that
//! correlation — `Idle → AwaitingResponse → Resolved → Idle` — while the
//! monitor's pump task drives it with frames and the timeout clock.

use crate::error::{Error, Result};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

/// What to send and how to recognise the answer.
#[derive(Debug, Clone)]
pub struct DiagnosticRequest {
    /// Address-select command issued before the payload.
    pub select_command: String,
    /// The diagnostic payload, sent as one line.
    pub payload: String,
    /// Response content meaning success.
    pub positive_pattern: String,
    /// Response content meaning the device refused.
    pub negative_pattern: String,
    /// How long to wait for either pattern.
    pub timeout: Duration,
}

struct Pending {
    positive: String,
    negative: String,
    deadline: Instant,
    reply: oneshot::Sender<Result<String>>,
}

/// At most one command awaits its response at any time.
#[derive(Default)]
pub struct CommandSession {
    pending: Option<Pending>,
}

impl CommandSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    /// When to fire [`CommandSession::on_timeout`], if anything is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// Register the single outstanding command. A request arriving while
    /// another is pending is refused with [`Error::Busy`] — the prior
    /// exchange is never superseded.
    pub fn arm(&mut self, request: &DiagnosticRequest, reply: oneshot::Sender<Result<String>>) {
        if self.pending.is_some() {
            let _ = reply.send(Err(Error::Busy));
            return;
        }
        self.pending = Some(Pending {
            positive: normalize(&request.positive_pattern),
            negative: normalize(&request.negative_pattern),
            deadline: Instant::now() + request.timeout,
            reply,
        });
    }

    /// Offer a non-telemetry frame to the pending command. Returns true if
    /// the frame resolved it. Unmatched frames are ignored and do not
    /// touch the timeout.
    pub fn on_frame(&mut self, raw: &str) -> bool {
        let Some(pending) = self.pending.as_ref() else {
            return false;
        };
        let norm = normalize(raw);
        if norm.contains(&pending.positive) {
            debug!(response = raw.trim(), "diagnostic command accepted");
            self.resolve(Ok(raw.trim().to_string()));
            true
        } else if norm.contains(&pending.negative) {
            debug!(response = raw.trim(), "diagnostic command rejected by device");
            self.resolve(Err(Error::DeviceRejected(raw.trim().to_string())));
            true
        } else {
            trace!(frame = raw.trim(), "frame ignored while awaiting response");
            false
        }
    }

    /// The deadline passed with no matching response. The caller may retry
    /// by issuing the command again; nothing is retried implicitly.
    pub fn on_timeout(&mut self) {
        if self.pending.is_some() {
            debug!("diagnostic command timed out");
            self.resolve(Err(Error::Timeout));
        }
    }

    /// Abandon the pending command, releasing its reply channel so no
    /// later frame can resolve a command that belonged to a dead link.
    pub fn cancel(&mut self) {
        if self.pending.is_some() {
            debug!("pending diagnostic command cancelled");
            self.resolve(Err(Error::Cancelled));
        }
    }

    fn resolve(&mut self, outcome: Result<String>) {
        if let Some(pending) = self.pending.take() {
            // The caller may have given up waiting; that is fine.
            let _ = pending.reply.send(outcome);
        }
    }
}

/// Case- and whitespace-insensitive form used for pattern matching.
fn normalize(raw: &str) -> String {
    raw.trim_matches(|c: char| c.is_whitespace() || c == '>')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DiagnosticRequest {
        DiagnosticRequest {
            select_command: "ATSH7E4".into(),
            payload: "03 14 FF 00 55 55 55 55".into(),
            positive_pattern: "7EC 03 54 FF 00".into(),
            negative_pattern: "7F 14".into(),
            timeout: Duration::from_millis(5000),
        }
    }

    #[tokio::test]
    async fn positive_response_resolves_success() {
        let mut session = CommandSession::new();
        let (tx, rx) = oneshot::channel();
        session.arm(&request(), tx);

        assert!(session.on_frame("7EC 03 54 FF 00 55 55 55"));
        assert!(!session.is_busy());
        let raw = rx.await.unwrap().unwrap();
        assert_eq!(raw, "7EC 03 54 FF 00 55 55 55");
    }

    #[tokio::test]
    async fn negative_response_resolves_rejection() {
        let mut session = CommandSession::new();
        let (tx, rx) = oneshot::channel();
        session.arm(&request(), tx);

        assert!(session.on_frame("7EC 03 7F 14 11"));
        match rx.await.unwrap() {
            Err(Error::DeviceRejected(payload)) => assert_eq!(payload, "7EC 03 7F 14 11"),
            other => panic!("expected DeviceRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn matching_is_case_and_whitespace_insensitive() {
        let mut session = CommandSession::new();
        let (tx, rx) = oneshot::channel();
        session.arm(&request(), tx);

        assert!(session.on_frame(">  7ec  03 54 ff 00"));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unrelated_frames_neither_resolve_nor_reset_the_timer() {
        let mut session = CommandSession::new();
        let (tx, mut rx) = oneshot::channel();
        session.arm(&request(), tx);
        let deadline = session.deadline().unwrap();

        assert!(!session.on_frame("OK"));
        assert!(!session.on_frame("SEARCHING..."));
        assert!(session.is_busy());
        assert_eq!(session.deadline().unwrap(), deadline);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn second_command_while_pending_is_busy() {
        let mut session = CommandSession::new();
        let (tx1, _rx1) = oneshot::channel();
        session.arm(&request(), tx1);

        let (tx2, rx2) = oneshot::channel();
        session.arm(&request(), tx2);
        assert!(matches!(rx2.await.unwrap(), Err(Error::Busy)));
        // The first command is still the outstanding one.
        assert!(session.is_busy());
    }

    #[tokio::test]
    async fn timeout_resolves_and_allows_retry() {
        let mut session = CommandSession::new();
        let (tx, rx) = oneshot::channel();
        session.arm(&request(), tx);

        session.on_timeout();
        assert!(matches!(rx.await.unwrap(), Err(Error::Timeout)));
        assert!(!session.is_busy());

        // Explicit retry succeeds.
        let (tx, rx) = oneshot::channel();
        session.arm(&request(), tx);
        assert!(session.on_frame("7EC 03 54 FF 00"));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn cancelled_command_cannot_be_resolved_later() {
        let mut session = CommandSession::new();
        let (tx, rx) = oneshot::channel();
        session.arm(&request(), tx);

        session.cancel();
        assert!(matches!(rx.await.unwrap(), Err(Error::Cancelled)));

        // A matching frame arriving afterwards finds no listener.
        assert!(!session.on_frame("7EC 03 54 FF 00"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_request_timeout_from_arming() {
        let mut session = CommandSession::new();
        let (tx, _rx) = oneshot::channel();
        let before = Instant::now();
        session.arm(&request(), tx);
        assert_eq!(session.deadline().unwrap(), before + Duration::from_millis(5000));
    }
}
