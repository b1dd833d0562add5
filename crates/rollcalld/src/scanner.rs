//! Scan actor: owns the [`ScanController`] and feeds it frames, recognition
//! responses and timer ticks in arrival order.

use crate::extractor::DescriptorExtractor;
use crate::recognizer::Recognizer;
use chrono::Utc;
use rollcall_core::ledger::{Ledger, Registration};
use rollcall_core::scan::{
    FrameDecision, Recognition, RequestToken, ScanController, ScanOutcome, ScanStats, SessionEvent,
};
use rollcall_core::store::{AttendanceStore, IdentityStore};
use rollcall_core::RecognitionMode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

#[derive(Error, Debug)]
pub enum ScannerError {
    #[error("scanner task exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the scan actor.
enum ScanRequest {
    Frame {
        face_present: bool,
        image: Vec<u8>,
        reply: oneshot::Sender<SessionEvent>,
    },
    Snapshot {
        reply: oneshot::Sender<(SessionEvent, ScanStats)>,
    },
}

/// Clone-safe handle to the scan actor.
#[derive(Clone)]
pub struct ScannerHandle {
    tx: mpsc::Sender<ScanRequest>,
}

impl ScannerHandle {
    /// Feed one frame. Returns the controller state after the frame was
    /// applied; recognition itself completes in the background.
    pub async fn feed_frame(
        &self,
        face_present: bool,
        image: Vec<u8>,
    ) -> Result<SessionEvent, ScannerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ScanRequest::Frame {
                face_present,
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ScannerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ScannerError::ChannelClosed)
    }

    pub async fn snapshot(&self) -> Result<(SessionEvent, ScanStats), ScannerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ScanRequest::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| ScannerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ScannerError::ChannelClosed)
    }
}

/// Spawn the scan actor on the current tokio runtime.
///
/// Frames arrive through a bounded channel. Recognition runs in its own task
/// and reports back on a second channel, so frame delivery never waits on the
/// extractor.
pub fn spawn_scanner<E, I, A>(
    controller: ScanController,
    recognizer: Arc<Recognizer<E, I>>,
    ledger: Arc<Ledger<A>>,
) -> ScannerHandle
where
    E: DescriptorExtractor,
    I: IdentityStore + Clone + 'static,
    A: AttendanceStore + 'static,
{
    let (tx, rx) = mpsc::channel::<ScanRequest>(8);
    tokio::spawn(run(controller, rx, recognizer, ledger));
    ScannerHandle { tx }
}

async fn run<E, I, A>(
    mut controller: ScanController,
    mut rx: mpsc::Receiver<ScanRequest>,
    recognizer: Arc<Recognizer<E, I>>,
    ledger: Arc<Ledger<A>>,
) where
    E: DescriptorExtractor,
    I: IdentityStore + Clone + 'static,
    A: AttendanceStore + 'static,
{
    let (done_tx, mut done_rx) = mpsc::channel::<(RequestToken, Recognition)>(4);
    let mut task: Option<InFlight> = None;
    tracing::info!("scanner started");

    loop {
        let deadline = controller.next_deadline();
        let wake = deadline
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            req = rx.recv() => {
                let Some(req) = req else { break };
                match req {
                    ScanRequest::Frame { face_present, image, reply } => {
                        let decision = controller.on_frame(face_present, Instant::now());
                        abort_if_released(&controller, &mut task);
                        if let FrameDecision::Dispatch(token) = decision {
                            let recognizer = Arc::clone(&recognizer);
                            let done_tx = done_tx.clone();
                            let handle = tokio::spawn(async move {
                                let recognition = recognizer.recognize(image).await;
                                let _ = done_tx.send((token, recognition)).await;
                            });
                            task = Some(InFlight {
                                token,
                                abort: handle.abort_handle(),
                            });
                        }
                        let _ = reply.send(controller.event());
                    }
                    ScanRequest::Snapshot { reply } => {
                        controller.tick(Instant::now());
                        abort_if_released(&controller, &mut task);
                        let _ = reply.send((controller.event(), controller.stats()));
                    }
                }
            }
            Some((token, recognition)) = done_rx.recv() => {
                if task.as_ref().is_some_and(|t| t.token == token) {
                    task = None;
                }
                // The ledger write runs before settling, and only for the
                // request the controller is still waiting on.
                let registered = match &recognition {
                    Recognition::Matched { identity_id, display_name, confidence, evidence_ref }
                        if controller.in_flight() == Some(token) =>
                    {
                        Some(register_match(Arc::clone(&ledger), identity_id, display_name, *confidence, evidence_ref).await)
                    }
                    _ => None,
                };
                let settled = controller.on_response(token, recognition, Instant::now(), |_, _, _, _| {
                    registered.unwrap_or_else(|| ScanOutcome::Failed {
                        message: "match was not registered".to_string(),
                    })
                });
                match settled {
                    Ok(event) => tracing::debug!(request = token.id(), ?event, "scan settled"),
                    Err(e) => tracing::debug!(error = %e, "late recognition response dropped"),
                }
            }
            _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                if let Some(event) = controller.tick(Instant::now()) {
                    tracing::debug!(?event, "scan state changed on timer");
                }
                abort_if_released(&controller, &mut task);
            }
        }
    }

    if let Some(t) = task {
        t.abort.abort();
    }
    tracing::info!("scanner exiting");
}

/// The recognition task behind the controller's outstanding request.
struct InFlight {
    token: RequestToken,
    abort: AbortHandle,
}

/// Cancel the recognition task once the controller stops waiting for it,
/// so a timed-out extraction never overlaps the next one.
fn abort_if_released(controller: &ScanController, task: &mut Option<InFlight>) {
    let released = task
        .as_ref()
        .is_some_and(|t| controller.in_flight() != Some(t.token));
    if released {
        if let Some(t) = task.take() {
            tracing::debug!(request = t.token.id(), "aborting abandoned recognition");
            t.abort.abort();
        }
    }
}

async fn register_match<A: AttendanceStore + 'static>(
    ledger: Arc<Ledger<A>>,
    identity_id: &str,
    display_name: &str,
    confidence: u8,
    evidence_ref: &str,
) -> ScanOutcome {
    let registration = Registration {
        identity_id: Some(identity_id.to_string()),
        display_name: display_name.to_string(),
        mode: RecognitionMode::Facial,
        confidence: Some(confidence),
        evidence_ref: evidence_ref.to_string(),
    };
    let result = tokio::task::spawn_blocking(move || ledger.register(registration, Utc::now())).await;
    match result {
        Ok(Ok(outcome)) => outcome.into(),
        Ok(Err(e)) => {
            tracing::warn!(identity = identity_id, error = %e, "attendance registration failed");
            ScanOutcome::Failed {
                message: e.to_string(),
            }
        }
        Err(e) => {
            tracing::error!(identity = identity_id, error = %e, "attendance registration task failed");
            ScanOutcome::Failed {
                message: e.to_string(),
            }
        }
    }
}
