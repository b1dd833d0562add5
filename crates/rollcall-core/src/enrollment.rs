//! Pose-guided enrollment.
//!
//! A session walks the stage list one sample per stage. Each frame goes
//! through two steps: [`EnrollmentSession::begin_capture`] gates the pose and
//! the cool-down and hands out a [`CaptureTicket`]; the caller then runs the
//! descriptor extractor and reports back with
//! [`EnrollmentSession::complete_capture`]. Only one ticket is outstanding per
//! session, so overlapping frame callbacks cannot issue duplicate extractions.
//!
//! When the last stage is filled the session holds its samples until the
//! identity store accepts them as the new reference set. A failed commit keeps
//! the samples for [`EnrollmentOrchestrator::retry_finalize`].

use crate::pose::{Pose, PoseStage, PoseThresholds, StageCursor};
use crate::store::{IdentityStore, StoreError};
use crate::types::Descriptor;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Minimum spacing between two accepted captures.
pub const DEFAULT_CAPTURE_COOLDOWN: Duration = Duration::from_millis(800);

/// Ticket ids are unique across every session in the process, so an
/// extraction started by a cancelled session never matches its successor.
static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("enrollment already in progress for {0}")]
    AlreadyActive(String),
    #[error("no enrollment in progress for {0}")]
    NoSession(String),
    #[error("capture ticket does not match the outstanding capture")]
    StaleTicket,
    #[error("session is not capturing (phase {0:?})")]
    NotCapturing(EnrollmentPhase),
    #[error("samples complete but not yet saved for {0}; retry finalize")]
    FinalizePending(String),
    #[error("reference set for {0} is being saved")]
    CommitInProgress(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentPhase {
    Capturing,
    /// Every stage captured; the reference set is not saved yet.
    AwaitingCommit,
    Committed,
    Cancelled,
}

/// Permission to run one extraction for the given stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTicket {
    id: u64,
    pub stage: PoseStage,
}

/// What `begin_capture` decided about a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameVerdict {
    /// Extract a descriptor from this frame and report back with the ticket.
    Capture(CaptureTicket),
    NoFace,
    WrongPose { expected: PoseStage },
    CoolingDown { remaining: Duration },
    /// A capture for this session is already being extracted.
    Busy,
    /// No further samples are needed.
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub identity_id: String,
    pub captured: usize,
    pub required: usize,
    pub next_stage: Option<PoseStage>,
    pub phase: EnrollmentPhase,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Accepted(Progress),
    /// The extractor found no face; the stage stays where it was.
    NoFace(Progress),
}

impl CaptureOutcome {
    pub fn progress(&self) -> &Progress {
        match self {
            CaptureOutcome::Accepted(p) | CaptureOutcome::NoFace(p) => p,
        }
    }
}

/// Enrollment timing and pose settings.
#[derive(Debug, Clone, Copy)]
pub struct EnrollmentSettings {
    pub cooldown: Duration,
    pub thresholds: PoseThresholds,
}

impl Default for EnrollmentSettings {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_CAPTURE_COOLDOWN,
            thresholds: PoseThresholds::default(),
        }
    }
}

pub struct EnrollmentSession {
    identity_id: String,
    cursor: StageCursor,
    samples: Vec<Descriptor>,
    last_capture: Option<Instant>,
    outstanding: Option<u64>,
    phase: EnrollmentPhase,
    /// Set while the sample set is handed to the store outside the lock.
    committing: bool,
    settings: EnrollmentSettings,
}

impl EnrollmentSession {
    pub fn new(identity_id: impl Into<String>, settings: EnrollmentSettings) -> Self {
        Self {
            identity_id: identity_id.into(),
            cursor: StageCursor::default(),
            samples: Vec::new(),
            last_capture: None,
            outstanding: None,
            phase: EnrollmentPhase::Capturing,
            committing: false,
            settings,
        }
    }

    pub fn identity_id(&self) -> &str {
        &self.identity_id
    }

    pub fn phase(&self) -> EnrollmentPhase {
        self.phase
    }

    pub fn samples(&self) -> &[Descriptor] {
        &self.samples
    }

    pub fn progress(&self) -> Progress {
        Progress {
            identity_id: self.identity_id.clone(),
            captured: self.samples.len(),
            required: self.cursor.total(),
            next_stage: self.cursor.current(),
            phase: self.phase,
        }
    }

    /// Gate a frame. `pose` is `None` when the frame has no face, in which
    /// case nothing is evaluated and no timer moves.
    pub fn begin_capture(&mut self, pose: Option<Pose>, now: Instant) -> FrameVerdict {
        if self.phase != EnrollmentPhase::Capturing {
            return FrameVerdict::Complete;
        }
        let Some(pose) = pose else {
            return FrameVerdict::NoFace;
        };
        if self.outstanding.is_some() {
            return FrameVerdict::Busy;
        }
        let Some(stage) = self.cursor.current() else {
            return FrameVerdict::Complete;
        };
        if !stage.accepts(pose, &self.settings.thresholds) {
            return FrameVerdict::WrongPose { expected: stage };
        }
        if let Some(last) = self.last_capture {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.settings.cooldown {
                return FrameVerdict::CoolingDown {
                    remaining: self.settings.cooldown - elapsed,
                };
            }
        }

        let id = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);
        self.outstanding = Some(id);
        tracing::debug!(identity = %self.identity_id, ?stage, ticket = id, "pose accepted, extracting");
        FrameVerdict::Capture(CaptureTicket { id, stage })
    }

    /// Report the extractor's answer for `ticket`. `None` means the
    /// extractor saw no face, which releases the ticket without advancing.
    pub fn complete_capture(
        &mut self,
        ticket: CaptureTicket,
        descriptor: Option<Descriptor>,
        now: Instant,
    ) -> Result<CaptureOutcome, EnrollmentError> {
        if self.phase != EnrollmentPhase::Capturing {
            return Err(EnrollmentError::NotCapturing(self.phase));
        }
        if self.outstanding != Some(ticket.id) {
            return Err(EnrollmentError::StaleTicket);
        }
        self.outstanding = None;

        let Some(descriptor) = descriptor.filter(|d| !d.is_empty()) else {
            tracing::debug!(identity = %self.identity_id, stage = ?ticket.stage, "no face in capture");
            return Ok(CaptureOutcome::NoFace(self.progress()));
        };

        self.samples.push(descriptor);
        self.last_capture = Some(now);
        self.cursor.advance();
        if self.cursor.is_done() {
            self.phase = EnrollmentPhase::AwaitingCommit;
        }

        tracing::info!(
            identity = %self.identity_id,
            stage = ?ticket.stage,
            captured = self.samples.len(),
            required = self.cursor.total(),
            "enrollment sample captured"
        );
        Ok(CaptureOutcome::Accepted(self.progress()))
    }

    /// Release an outstanding ticket whose extraction failed. The stage and
    /// the cool-down are left untouched.
    pub fn abandon_capture(&mut self, ticket: CaptureTicket) {
        if self.outstanding == Some(ticket.id) {
            self.outstanding = None;
        }
    }
}

/// Result of feeding a completed capture to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameReport {
    pub progress: Progress,
    pub accepted: bool,
    /// `Some(false)` when every sample is in but the store rejected the commit.
    pub saved: Option<bool>,
}

/// Owns the active enrollment sessions, one per identity.
pub struct EnrollmentOrchestrator<S> {
    store: S,
    settings: EnrollmentSettings,
    sessions: Mutex<HashMap<String, EnrollmentSession>>,
}

impl<S: IdentityStore> EnrollmentOrchestrator<S> {
    pub fn new(store: S, settings: EnrollmentSettings) -> Self {
        Self {
            store,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn sessions(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, EnrollmentSession>>, EnrollmentError> {
        self.sessions
            .lock()
            .map_err(|_| StoreError::Unavailable("enrollment lock poisoned".to_string()).into())
    }

    /// Start a session. Fails if the identity is unknown or already has one.
    pub fn begin(&self, identity_id: &str) -> Result<Progress, EnrollmentError> {
        self.store.get_identity(identity_id)?;

        let mut sessions = self.sessions()?;
        if sessions.contains_key(identity_id) {
            return Err(EnrollmentError::AlreadyActive(identity_id.to_string()));
        }
        let session = EnrollmentSession::new(identity_id, self.settings);
        let progress = session.progress();
        sessions.insert(identity_id.to_string(), session);
        tracing::info!(identity = identity_id, "enrollment started");
        Ok(progress)
    }

    pub fn begin_capture(
        &self,
        identity_id: &str,
        pose: Option<Pose>,
        now: Instant,
    ) -> Result<FrameVerdict, EnrollmentError> {
        let mut sessions = self.sessions()?;
        let session = sessions
            .get_mut(identity_id)
            .ok_or_else(|| EnrollmentError::NoSession(identity_id.to_string()))?;
        Ok(session.begin_capture(pose, now))
    }

    /// Record an extraction result. When it fills the last stage the sample
    /// set is committed right away.
    pub fn complete_capture(
        &self,
        identity_id: &str,
        ticket: CaptureTicket,
        descriptor: Option<Descriptor>,
        now: Instant,
    ) -> Result<FrameReport, EnrollmentError> {
        let accepted = {
            let mut sessions = self.sessions()?;
            let session = sessions
                .get_mut(identity_id)
                .ok_or_else(|| EnrollmentError::NoSession(identity_id.to_string()))?;

            let outcome = session.complete_capture(ticket, descriptor, now)?;
            let accepted = matches!(outcome, CaptureOutcome::Accepted(_));
            if session.phase() != EnrollmentPhase::AwaitingCommit {
                return Ok(FrameReport {
                    progress: outcome.progress().clone(),
                    accepted,
                    saved: None,
                });
            }
            accepted
        };

        let (progress, saved) = self.commit(identity_id)?;
        Ok(FrameReport {
            progress,
            accepted,
            saved: Some(saved),
        })
    }

    /// Release a ticket after an extraction error.
    pub fn abandon_capture(&self, identity_id: &str, ticket: CaptureTicket) -> Result<(), EnrollmentError> {
        let mut sessions = self.sessions()?;
        if let Some(session) = sessions.get_mut(identity_id) {
            session.abandon_capture(ticket);
        }
        Ok(())
    }

    /// Resubmit the captured samples of a session whose commit failed.
    pub fn retry_finalize(&self, identity_id: &str) -> Result<Progress, EnrollmentError> {
        {
            let sessions = self.sessions()?;
            let phase = sessions
                .get(identity_id)
                .map(|s| s.phase())
                .ok_or_else(|| EnrollmentError::NoSession(identity_id.to_string()))?;
            if phase != EnrollmentPhase::AwaitingCommit {
                return Err(EnrollmentError::NotCapturing(phase));
            }
        }
        match self.commit(identity_id)? {
            (progress, true) => Ok(progress),
            (_, false) => Err(EnrollmentError::FinalizePending(identity_id.to_string())),
        }
    }

    /// Hand the sample set to the store. The session is marked as committing
    /// so the lock can be released during the store call; a second commit
    /// for the same identity is refused until the first one returns.
    fn commit(&self, identity_id: &str) -> Result<(Progress, bool), EnrollmentError> {
        let samples = {
            let mut sessions = self.sessions()?;
            let session = sessions
                .get_mut(identity_id)
                .ok_or_else(|| EnrollmentError::NoSession(identity_id.to_string()))?;
            if session.committing {
                return Err(EnrollmentError::CommitInProgress(identity_id.to_string()));
            }
            session.committing = true;
            session.samples.clone()
        };

        let result = self.store.replace_descriptors(identity_id, &samples);

        let mut sessions = self.sessions()?;
        let session = sessions
            .get_mut(identity_id)
            .ok_or_else(|| EnrollmentError::NoSession(identity_id.to_string()))?;
        session.committing = false;
        match result {
            Ok(()) => {
                session.phase = EnrollmentPhase::Committed;
                let progress = session.progress();
                sessions.remove(identity_id);
                tracing::info!(
                    identity = identity_id,
                    samples = progress.captured,
                    "enrollment committed"
                );
                Ok((progress, true))
            }
            Err(e) => {
                tracing::warn!(
                    identity = identity_id,
                    error = %e,
                    "enrollment complete but not yet saved; samples kept for retry"
                );
                Ok((session.progress(), false))
            }
        }
    }

    /// Cancel a session that is still capturing. Its samples are dropped and
    /// the identity's existing references are not touched.
    pub fn cancel(&self, identity_id: &str) -> Result<Progress, EnrollmentError> {
        let mut sessions = self.sessions()?;
        let phase = sessions
            .get(identity_id)
            .map(|s| s.phase())
            .ok_or_else(|| EnrollmentError::NoSession(identity_id.to_string()))?;
        if phase == EnrollmentPhase::AwaitingCommit {
            return Err(EnrollmentError::FinalizePending(identity_id.to_string()));
        }

        let mut session = sessions
            .remove(identity_id)
            .ok_or_else(|| EnrollmentError::NoSession(identity_id.to_string()))?;
        let discarded = session.samples.len();
        session.samples.clear();
        session.phase = EnrollmentPhase::Cancelled;
        tracing::info!(identity = identity_id, discarded, "enrollment cancelled");
        Ok(session.progress())
    }

    pub fn progress(&self, identity_id: &str) -> Result<Progress, EnrollmentError> {
        let sessions = self.sessions()?;
        sessions
            .get(identity_id)
            .map(|s| s.progress())
            .ok_or_else(|| EnrollmentError::NoSession(identity_id.to_string()))
    }

    pub fn active_count(&self) -> usize {
        self.sessions().map(|s| s.len()).unwrap_or(0)
    }

    /// Make a single descriptor the identity's whole reference set, for
    /// enrollment from a still photo. Refused while a guided session is open.
    pub fn enroll_single(&self, identity_id: &str, descriptor: Descriptor) -> Result<(), EnrollmentError> {
        if self.sessions()?.contains_key(identity_id) {
            return Err(EnrollmentError::AlreadyActive(identity_id.to_string()));
        }
        self.store.get_identity(identity_id)?;
        self.store.replace_descriptors(identity_id, &[descriptor])?;
        tracing::info!(identity = identity_id, "enrolled from single photo");
        Ok(())
    }
}
