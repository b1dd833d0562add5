//! Continuous-scan session controller.
//!
//! ```text
//!            face present, nothing in flight
//!   WAITING ─────────────────────────────────▶ EVALUATING
//!      ▲                                           │ response for the
//!      │ face gone / cooldown elapsed              │ current token
//!      │ failure delay elapsed                     ▼
//!      └─────────────────────────────────────── SETTLED
//! ```
//!
//! The controller is a plain value with one owner. Frames and responses are
//! fed to it in order; every decision is a function of its state and the
//! `Instant` passed in. A request token is issued before a recognition call is
//! dispatched and is cleared by the matching response or by the request
//! timeout, so at most one call is ever outstanding.

use crate::ledger::RegisterOutcome;
use crate::types::AttendanceRecord;
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_SETTLE_COOLDOWN: Duration = Duration::from_secs(3);
pub const DEFAULT_FAILURE_RESET: Duration = Duration::from_millis(1500);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScanError {
    #[error("response for request {0} is stale")]
    StaleResponse(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct ScanTiming {
    /// Fallback reset from SETTLED when face absence is never reported.
    pub settle_cooldown: Duration,
    /// Delay before returning to WAITING after a hard failure.
    pub failure_reset: Duration,
    /// Longest a recognition request may stay outstanding.
    pub request_timeout: Duration,
}

impl Default for ScanTiming {
    fn default() -> Self {
        Self {
            settle_cooldown: DEFAULT_SETTLE_COOLDOWN,
            failure_reset: DEFAULT_FAILURE_RESET,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Identifies one dispatched recognition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(u64);

impl RequestToken {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Answer of the recognition pipeline for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Recognition {
    Matched {
        identity_id: String,
        display_name: String,
        confidence: u8,
        evidence_ref: String,
    },
    Unknown {
        evidence_ref: String,
    },
    NoFace,
    Failed(String),
}

/// What the operator is shown once a request settles.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ScanOutcome {
    Registered { record: AttendanceRecord },
    AlreadyRegistered { record: AttendanceRecord },
    /// No enrolled identity matched; the caller may register a visitor.
    Unknown { evidence_ref: String },
    Failed { message: String },
}

impl ScanOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ScanOutcome::Failed { .. })
    }
}

impl From<RegisterOutcome> for ScanOutcome {
    fn from(outcome: RegisterOutcome) -> Self {
        match outcome {
            RegisterOutcome::Registered(record) => ScanOutcome::Registered { record },
            RegisterOutcome::AlreadyRegistered(record) => ScanOutcome::AlreadyRegistered { record },
        }
    }
}

/// Externally visible controller state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEvent {
    Waiting,
    Evaluating,
    Settled(ScanOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Nothing to do for this frame.
    Idle,
    /// Dispatch a recognition request for this frame under `token`.
    Dispatch(RequestToken),
    /// A request is already in flight; the frame is dropped.
    Busy,
}

#[derive(Debug, Clone)]
enum ScanState {
    Waiting,
    Evaluating {
        token: RequestToken,
        since: Instant,
    },
    Settled {
        outcome: ScanOutcome,
        since: Instant,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub frames: u64,
    pub dispatched: u64,
    pub dropped_busy: u64,
    pub timeouts: u64,
}

pub struct ScanController {
    state: ScanState,
    timing: ScanTiming,
    next_token: u64,
    stats: ScanStats,
}

impl ScanController {
    pub fn new(timing: ScanTiming) -> Self {
        Self {
            state: ScanState::Waiting,
            timing,
            next_token: 0,
            stats: ScanStats::default(),
        }
    }

    pub fn event(&self) -> SessionEvent {
        match &self.state {
            ScanState::Waiting => SessionEvent::Waiting,
            ScanState::Evaluating { .. } => SessionEvent::Evaluating,
            ScanState::Settled { outcome, .. } => SessionEvent::Settled(outcome.clone()),
        }
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    pub fn in_flight(&self) -> Option<RequestToken> {
        match self.state {
            ScanState::Evaluating { token, .. } => Some(token),
            _ => None,
        }
    }

    /// Instant at which `tick` will next change the state, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.state {
            ScanState::Waiting => None,
            ScanState::Evaluating { since, .. } => Some(*since + self.timing.request_timeout),
            ScanState::Settled { outcome, since } => Some(*since + self.settle_hold(outcome)),
        }
    }

    fn settle_hold(&self, outcome: &ScanOutcome) -> Duration {
        if outcome.is_failure() {
            self.timing.failure_reset
        } else {
            self.timing.settle_cooldown
        }
    }

    /// Apply time-based transitions. Returns the new event when the state
    /// changed.
    pub fn tick(&mut self, now: Instant) -> Option<SessionEvent> {
        match &self.state {
            ScanState::Evaluating { token, since } if now >= *since + self.timing.request_timeout => {
                tracing::warn!(request = token.id(), "recognition request timed out");
                self.stats.timeouts += 1;
                self.state = ScanState::Settled {
                    outcome: ScanOutcome::Failed {
                        message: "recognition timed out".to_string(),
                    },
                    since: now,
                };
                Some(self.event())
            }
            ScanState::Settled { outcome, since } if now >= *since + self.settle_hold(outcome) => {
                tracing::debug!("scan reset after hold");
                self.state = ScanState::Waiting;
                Some(SessionEvent::Waiting)
            }
            _ => None,
        }
    }

    /// Feed one frame's face-presence signal.
    pub fn on_frame(&mut self, face_present: bool, now: Instant) -> FrameDecision {
        self.stats.frames += 1;
        self.tick(now);

        match &self.state {
            ScanState::Waiting if face_present => {
                let token = RequestToken(self.next_token);
                self.next_token += 1;
                self.stats.dispatched += 1;
                self.state = ScanState::Evaluating { token, since: now };
                tracing::debug!(request = token.id(), "face present, dispatching recognition");
                FrameDecision::Dispatch(token)
            }
            ScanState::Waiting => FrameDecision::Idle,
            ScanState::Evaluating { .. } => {
                self.stats.dropped_busy += 1;
                FrameDecision::Busy
            }
            ScanState::Settled { outcome, .. } if !face_present && !outcome.is_failure() => {
                tracing::debug!("face left, scan reset");
                self.state = ScanState::Waiting;
                FrameDecision::Idle
            }
            ScanState::Settled { .. } => FrameDecision::Idle,
        }
    }

    /// Settle the outstanding request.
    ///
    /// A match runs `register` before the state changes, so the ledger write
    /// is part of settling. An extractor "no face" answer goes straight back
    /// to WAITING.
    pub fn on_response<F>(
        &mut self,
        token: RequestToken,
        recognition: Recognition,
        now: Instant,
        register: F,
    ) -> Result<SessionEvent, ScanError>
    where
        F: FnOnce(&str, &str, u8, &str) -> ScanOutcome,
    {
        if self.in_flight() != Some(token) {
            tracing::debug!(request = token.id(), "discarding stale recognition response");
            return Err(ScanError::StaleResponse(token.id()));
        }

        let outcome = match recognition {
            Recognition::Matched {
                identity_id,
                display_name,
                confidence,
                evidence_ref,
            } => register(&identity_id, &display_name, confidence, &evidence_ref),
            Recognition::Unknown { evidence_ref } => ScanOutcome::Unknown { evidence_ref },
            Recognition::NoFace => {
                tracing::debug!(request = token.id(), "no face in capture");
                self.state = ScanState::Waiting;
                return Ok(SessionEvent::Waiting);
            }
            Recognition::Failed(message) => {
                tracing::warn!(request = token.id(), error = %message, "recognition failed");
                ScanOutcome::Failed { message }
            }
        };

        self.state = ScanState::Settled { outcome, since: now };
        Ok(self.event())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecognitionMode;

    fn record(identity: &str) -> AttendanceRecord {
        AttendanceRecord {
            id: "r".into(),
            sequence: 1,
            timestamp: chrono::Utc::now(),
            identity_id: Some(identity.into()),
            display_name: identity.into(),
            mode: RecognitionMode::Facial,
            confidence: Some(90),
            is_visitor: false,
            evidence_ref: "ev".into(),
            edit_history: Vec::new(),
        }
    }

    fn matched(id: &str) -> Recognition {
        Recognition::Matched {
            identity_id: id.into(),
            display_name: id.into(),
            confidence: 90,
            evidence_ref: "ev".into(),
        }
    }

    fn register_ok(id: &str, _: &str, _: u8, _: &str) -> ScanOutcome {
        ScanOutcome::Registered { record: record(id) }
    }

    fn dispatch(c: &mut ScanController, now: Instant) -> RequestToken {
        match c.on_frame(true, now) {
            FrameDecision::Dispatch(t) => t,
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[test]
    fn test_idle_without_face() {
        let mut c = ScanController::new(ScanTiming::default());
        assert_eq!(c.on_frame(false, Instant::now()), FrameDecision::Idle);
        assert_eq!(c.event(), SessionEvent::Waiting);
    }

    #[test]
    fn test_single_in_flight_under_frame_burst() {
        let mut c = ScanController::new(ScanTiming::default());
        let t0 = Instant::now();
        let token = dispatch(&mut c, t0);

        // One second of frames at 30 fps while the request is outstanding.
        for i in 1..30u64 {
            let decision = c.on_frame(true, t0 + Duration::from_millis(i * 33));
            assert_eq!(decision, FrameDecision::Busy);
        }
        assert_eq!(c.in_flight(), Some(token));
        assert_eq!(c.stats().dispatched, 1);
        assert_eq!(c.stats().dropped_busy, 29);
    }

    #[test]
    fn test_match_registers_and_settles() {
        let mut c = ScanController::new(ScanTiming::default());
        let t0 = Instant::now();
        let token = dispatch(&mut c, t0);

        let mut calls = 0;
        let event = c
            .on_response(token, matched("a"), t0, |id, name, confidence, ev| {
                calls += 1;
                register_ok(id, name, confidence, ev)
            })
            .unwrap();
        assert_eq!(calls, 1);
        assert!(matches!(event, SessionEvent::Settled(ScanOutcome::Registered { .. })));
        assert_eq!(c.in_flight(), None);

        // Suspended while the face stays in view.
        assert_eq!(c.on_frame(true, t0 + Duration::from_millis(100)), FrameDecision::Idle);
    }

    #[test]
    fn test_face_leaving_resets_settled() {
        let mut c = ScanController::new(ScanTiming::default());
        let t0 = Instant::now();
        let token = dispatch(&mut c, t0);
        c.on_response(token, Recognition::Unknown { evidence_ref: "e".into() }, t0, register_ok)
            .unwrap();

        assert_eq!(c.on_frame(false, t0 + Duration::from_millis(200)), FrameDecision::Idle);
        assert_eq!(c.event(), SessionEvent::Waiting);
        assert!(matches!(
            c.on_frame(true, t0 + Duration::from_millis(300)),
            FrameDecision::Dispatch(_)
        ));
    }

    #[test]
    fn test_cooldown_fallback_reset() {
        let timing = ScanTiming::default();
        let mut c = ScanController::new(timing);
        let t0 = Instant::now();
        let token = dispatch(&mut c, t0);
        c.on_response(token, matched("a"), t0, register_ok).unwrap();

        assert_eq!(c.next_deadline(), Some(t0 + timing.settle_cooldown));
        assert_eq!(c.tick(t0 + timing.settle_cooldown), Some(SessionEvent::Waiting));
    }

    #[test]
    fn test_failure_holds_until_delay() {
        let timing = ScanTiming::default();
        let mut c = ScanController::new(timing);
        let t0 = Instant::now();
        let token = dispatch(&mut c, t0);
        let event = c
            .on_response(token, Recognition::Failed("network".into()), t0, register_ok)
            .unwrap();
        assert!(matches!(event, SessionEvent::Settled(ScanOutcome::Failed { .. })));

        // Face absence does not short-circuit the failure delay.
        c.on_frame(false, t0 + Duration::from_millis(10));
        assert!(matches!(c.event(), SessionEvent::Settled(_)));

        let after = t0 + timing.failure_reset;
        assert!(matches!(c.on_frame(true, after), FrameDecision::Dispatch(_)));
    }

    #[test]
    fn test_request_timeout_clears_token() {
        let timing = ScanTiming::default();
        let mut c = ScanController::new(timing);
        let t0 = Instant::now();
        let token = dispatch(&mut c, t0);

        let expired = t0 + timing.request_timeout;
        let event = c.tick(expired).unwrap();
        assert!(matches!(event, SessionEvent::Settled(ScanOutcome::Failed { .. })));
        assert_eq!(c.in_flight(), None);
        assert_eq!(c.stats().timeouts, 1);

        // The late answer is refused and never registers.
        let err = c
            .on_response(token, matched("a"), expired, |_, _, _, _| panic!("must not register"))
            .unwrap_err();
        assert_eq!(err, ScanError::StaleResponse(token.id()));
    }

    #[test]
    fn test_no_face_response_returns_to_waiting() {
        let mut c = ScanController::new(ScanTiming::default());
        let t0 = Instant::now();
        let token = dispatch(&mut c, t0);
        let event = c.on_response(token, Recognition::NoFace, t0, register_ok).unwrap();
        assert_eq!(event, SessionEvent::Waiting);
        assert!(matches!(
            c.on_frame(true, t0 + Duration::from_millis(33)),
            FrameDecision::Dispatch(_)
        ));
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(SessionEvent::Settled(ScanOutcome::Unknown {
            evidence_ref: "abc".into(),
        }))
        .unwrap();
        assert_eq!(json["state"], "SETTLED");
        assert_eq!(json["outcome"]["result"], "unknown");
        assert_eq!(
            serde_json::to_value(SessionEvent::Waiting).unwrap()["state"],
            "WAITING"
        );
    }
}
