//! Drives guided enrollment: pose gating in the orchestrator, extraction
//! through the extractor, then the capture result back to the orchestrator.

use crate::extractor::{DescriptorExtractor, ExtractError};
use rollcall_core::enrollment::{
    EnrollmentError, EnrollmentOrchestrator, FrameReport, FrameVerdict, Progress,
};
use rollcall_core::store::IdentityStore;
use rollcall_core::{Pose, PoseStage};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollerError {
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),
    #[error("no face found in photo")]
    NoFace,
    #[error("enrollment task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What happened to one enrollment frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum FrameFeedback {
    /// The frame passed the gates and went to the extractor.
    Extracted { report: FrameReport },
    NoFace { progress: Progress },
    WrongPose { expected: PoseStage, prompt: String, progress: Progress },
    CoolingDown { remaining_ms: u64, progress: Progress },
    Busy { progress: Progress },
    Complete { progress: Progress },
}

pub struct Enroller<E, S> {
    orchestrator: Arc<EnrollmentOrchestrator<S>>,
    extractor: Arc<E>,
}

impl<E: DescriptorExtractor, S: IdentityStore + 'static> Enroller<E, S> {
    pub fn new(orchestrator: Arc<EnrollmentOrchestrator<S>>, extractor: Arc<E>) -> Self {
        Self {
            orchestrator,
            extractor,
        }
    }

    pub fn orchestrator(&self) -> &EnrollmentOrchestrator<S> {
        &self.orchestrator
    }

    /// Run an orchestrator call that may reach the store on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, EnrollerError>
    where
        F: FnOnce(&EnrollmentOrchestrator<S>) -> Result<T, EnrollmentError> + Send + 'static,
        T: Send + 'static,
    {
        let orchestrator = Arc::clone(&self.orchestrator);
        Ok(tokio::task::spawn_blocking(move || f(&orchestrator)).await??)
    }

    pub async fn begin(&self, identity_id: &str) -> Result<Progress, EnrollerError> {
        let id = identity_id.to_string();
        self.blocking(move |o| o.begin(&id)).await
    }

    pub async fn cancel(&self, identity_id: &str) -> Result<Progress, EnrollerError> {
        let id = identity_id.to_string();
        self.blocking(move |o| o.cancel(&id)).await
    }

    pub async fn retry_finalize(&self, identity_id: &str) -> Result<Progress, EnrollerError> {
        let id = identity_id.to_string();
        self.blocking(move |o| o.retry_finalize(&id)).await
    }

    /// Feed one frame of a guided session. `pose` is `None` when the frame
    /// holds no face.
    pub async fn feed_frame(
        &self,
        identity_id: &str,
        pose: Option<Pose>,
        image: Vec<u8>,
    ) -> Result<FrameFeedback, EnrollerError> {
        let verdict = self
            .orchestrator
            .begin_capture(identity_id, pose, Instant::now())?;

        let ticket = match verdict {
            FrameVerdict::Capture(ticket) => ticket,
            other => return self.feedback_for(identity_id, other),
        };

        match self.extractor.extract(image).await {
            Ok(descriptor) => {
                let id = identity_id.to_string();
                let report = self
                    .blocking(move |o| o.complete_capture(&id, ticket, descriptor, Instant::now()))
                    .await?;
                Ok(FrameFeedback::Extracted { report })
            }
            Err(e) => {
                tracing::warn!(identity = identity_id, stage = ?ticket.stage, error = %e, "enrollment extraction failed");
                self.orchestrator.abandon_capture(identity_id, ticket)?;
                Err(e.into())
            }
        }
    }

    fn feedback_for(&self, identity_id: &str, verdict: FrameVerdict) -> Result<FrameFeedback, EnrollerError> {
        let progress = self.orchestrator.progress(identity_id)?;
        Ok(match verdict {
            FrameVerdict::NoFace => FrameFeedback::NoFace { progress },
            FrameVerdict::WrongPose { expected } => FrameFeedback::WrongPose {
                expected,
                prompt: expected.prompt().to_string(),
                progress,
            },
            FrameVerdict::CoolingDown { remaining } => FrameFeedback::CoolingDown {
                remaining_ms: remaining.as_millis() as u64,
                progress,
            },
            FrameVerdict::Busy => FrameFeedback::Busy { progress },
            FrameVerdict::Complete | FrameVerdict::Capture(_) => FrameFeedback::Complete { progress },
        })
    }

    /// Enroll from a single still photo, replacing the reference set.
    pub async fn enroll_from_photo(&self, identity_id: &str, image: Vec<u8>) -> Result<(), EnrollerError> {
        let descriptor = self
            .extractor
            .extract(image)
            .await?
            .ok_or(EnrollerError::NoFace)?;
        let id = identity_id.to_string();
        self.blocking(move |o| o.enroll_single(&id, descriptor)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExtractor;
    use rollcall_core::enrollment::{EnrollmentPhase, EnrollmentSettings};
    use rollcall_core::memory::MemoryIdentityStore;
    use rollcall_core::pose::STAGE_ORDER;
    use rollcall_core::Descriptor;
    use std::time::Duration;

    fn pose_for(stage: PoseStage) -> Pose {
        match stage {
            PoseStage::Center => Pose::new(0.0, 0.0),
            PoseStage::Left => Pose::new(0.0, 25.0),
            PoseStage::Right => Pose::new(0.0, -25.0),
            PoseStage::Up => Pose::new(20.0, 0.0),
            PoseStage::Down => Pose::new(-20.0, 0.0),
        }
    }

    fn enroller(
        extractor: FakeExtractor,
        cooldown: Duration,
    ) -> (Enroller<FakeExtractor, Arc<MemoryIdentityStore>>, Arc<MemoryIdentityStore>, String) {
        let store = Arc::new(MemoryIdentityStore::new());
        let ana = store.create_identity("Ana", "X1").unwrap();
        let orchestrator = Arc::new(EnrollmentOrchestrator::new(
            Arc::clone(&store),
            EnrollmentSettings {
                cooldown,
                ..EnrollmentSettings::default()
            },
        ));
        (Enroller::new(orchestrator, Arc::new(extractor)), store, ana.id)
    }

    #[tokio::test]
    async fn test_guided_session_commits_five_samples() {
        let (e, store, id) = enroller(FakeExtractor::always(vec![0.1, 0.2]), Duration::ZERO);
        e.orchestrator().begin(&id).unwrap();

        let mut last = None;
        for stage in STAGE_ORDER {
            last = Some(e.feed_frame(&id, Some(pose_for(stage)), b"img".to_vec()).await.unwrap());
        }

        match last.unwrap() {
            FrameFeedback::Extracted { report } => {
                assert_eq!(report.saved, Some(true));
                assert_eq!(report.progress.phase, EnrollmentPhase::Committed);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.get_identity(&id).unwrap().descriptors.len(), 5);
        assert_eq!(e.orchestrator().active_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_pose_and_no_face_feedback() {
        let (e, _, id) = enroller(FakeExtractor::always(vec![0.1]), Duration::ZERO);
        e.orchestrator().begin(&id).unwrap();

        match e.feed_frame(&id, Some(pose_for(PoseStage::Left)), Vec::new()).await.unwrap() {
            FrameFeedback::WrongPose { expected, .. } => assert_eq!(expected, PoseStage::Center),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            e.feed_frame(&id, None, Vec::new()).await.unwrap(),
            FrameFeedback::NoFace { .. }
        ));
    }

    #[tokio::test]
    async fn test_cooldown_reported() {
        let (e, _, id) = enroller(FakeExtractor::always(vec![0.1]), Duration::from_secs(5));
        e.orchestrator().begin(&id).unwrap();
        e.feed_frame(&id, Some(pose_for(PoseStage::Center)), b"a".to_vec()).await.unwrap();

        match e.feed_frame(&id, Some(pose_for(PoseStage::Left)), b"b".to_vec()).await.unwrap() {
            FrameFeedback::CoolingDown { remaining_ms, progress } => {
                assert!(remaining_ms > 0);
                assert_eq!(progress.captured, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_extractor_error_releases_ticket() {
        let (e, _, id) = enroller(
            FakeExtractor::scripted(vec![
                Err(ExtractError::Network("down".into())),
                Ok(Some(Descriptor::new(vec![0.5]))),
            ]),
            Duration::ZERO,
        );
        e.orchestrator().begin(&id).unwrap();

        let center = Some(pose_for(PoseStage::Center));
        assert!(matches!(
            e.feed_frame(&id, center, b"a".to_vec()).await,
            Err(EnrollerError::Extract(_))
        ));
        match e.feed_frame(&id, center, b"a".to_vec()).await.unwrap() {
            FrameFeedback::Extracted { report } => {
                assert!(report.accepted);
                assert_eq!(report.progress.captured, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_extractor_no_face_keeps_stage() {
        let (e, _, id) = enroller(FakeExtractor::scripted(vec![Ok(None)]), Duration::ZERO);
        e.orchestrator().begin(&id).unwrap();

        match e.feed_frame(&id, Some(pose_for(PoseStage::Center)), b"a".to_vec()).await.unwrap() {
            FrameFeedback::Extracted { report } => {
                assert!(!report.accepted);
                assert_eq!(report.progress.captured, 0);
                assert_eq!(report.progress.next_stage, Some(PoseStage::Center));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_photo_enrollment() {
        let (e, store, id) = enroller(FakeExtractor::always(vec![0.4, 0.4]), Duration::ZERO);
        e.enroll_from_photo(&id, b"photo".to_vec()).await.unwrap();
        assert_eq!(store.get_identity(&id).unwrap().descriptors.len(), 1);
    }

    #[tokio::test]
    async fn test_photo_without_face() {
        let (e, store, id) = enroller(FakeExtractor::scripted(vec![Ok(None)]), Duration::ZERO);
        assert!(matches!(
            e.enroll_from_photo(&id, b"photo".to_vec()).await,
            Err(EnrollerError::NoFace)
        ));
        assert!(store.get_identity(&id).unwrap().descriptors.is_empty());
    }

    #[tokio::test]
    async fn test_async_begin_cancel_restart() {
        let (e, _, id) = enroller(FakeExtractor::always(vec![0.1]), Duration::ZERO);
        e.begin(&id).await.unwrap();
        assert!(matches!(
            e.begin(&id).await,
            Err(EnrollerError::Enrollment(EnrollmentError::AlreadyActive(_)))
        ));
        e.feed_frame(&id, Some(pose_for(PoseStage::Center)), b"a".to_vec()).await.unwrap();

        let cancelled = e.cancel(&id).await.unwrap();
        assert_eq!(cancelled.phase, EnrollmentPhase::Cancelled);
        let restarted = e.begin(&id).await.unwrap();
        assert_eq!(restarted.captured, 0);
        assert!(matches!(
            e.retry_finalize(&id).await,
            Err(EnrollerError::Enrollment(EnrollmentError::NotCapturing(_)))
        ));
    }

    #[tokio::test]
    async fn test_frame_without_session() {
        let (e, _, id) = enroller(FakeExtractor::always(vec![0.1]), Duration::ZERO);
        assert!(matches!(
            e.feed_frame(&id, None, Vec::new()).await,
            Err(EnrollerError::Enrollment(EnrollmentError::NoSession(_)))
        ));
    }
}
