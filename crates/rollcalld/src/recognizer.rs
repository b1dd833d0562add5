use crate::evidence::EvidenceStore;
use crate::extractor::DescriptorExtractor;
use rollcall_core::scan::Recognition;
use rollcall_core::store::IdentityStore;
use rollcall_core::{EuclideanMatcher, MatchResult, Matcher};
use std::sync::Arc;

/// One recognition pass: extract, keep the evidence, match against every
/// enrolled identity.
pub struct Recognizer<E, S> {
    extractor: Arc<E>,
    identities: S,
    evidence: Arc<EvidenceStore>,
    matcher: EuclideanMatcher,
}

impl<E: DescriptorExtractor, S: IdentityStore + Clone + 'static> Recognizer<E, S> {
    pub fn new(
        extractor: Arc<E>,
        identities: S,
        evidence: Arc<EvidenceStore>,
        matcher: EuclideanMatcher,
    ) -> Self {
        Self {
            extractor,
            identities,
            evidence,
            matcher,
        }
    }

    pub async fn recognize(&self, image: Vec<u8>) -> Recognition {
        let evidence_image = image.clone();
        let probe = match self.extractor.extract(image).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => return Recognition::NoFace,
            Err(e) => return Recognition::Failed(e.to_string()),
        };

        let identities = self.identities.clone();
        let candidates = match tokio::task::spawn_blocking(move || identities.candidates()).await {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => return Recognition::Failed(e.to_string()),
            Err(e) => return Recognition::Failed(e.to_string()),
        };

        // A record without its image is still a valid record.
        let evidence_ref = match self.evidence.put(&evidence_image).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, dir = %self.evidence.dir().display(), "evidence not stored");
                String::new()
            }
        };

        match self.matcher.compare(&probe, &candidates) {
            MatchResult::Matched {
                identity_id,
                display_name,
                distance,
                confidence,
            } => {
                tracing::info!(identity = %identity_id, distance, confidence, "face matched");
                Recognition::Matched {
                    identity_id,
                    display_name,
                    confidence,
                    evidence_ref,
                }
            }
            MatchResult::Unknown => {
                tracing::info!(candidates = candidates.len(), "face not recognized");
                Recognition::Unknown { evidence_ref }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{scratch_dir, FakeExtractor};
    use rollcall_core::memory::MemoryIdentityStore;
    use rollcall_core::Descriptor;

    fn setup(extractor: FakeExtractor) -> (Recognizer<FakeExtractor, Arc<MemoryIdentityStore>>, Arc<MemoryIdentityStore>, String) {
        let store = Arc::new(MemoryIdentityStore::new());
        let ana = store.create_identity("Ana", "X1").unwrap();
        store
            .replace_descriptors(&ana.id, &[Descriptor::new(vec![0.0, 0.0])])
            .unwrap();
        let recognizer = Recognizer::new(
            Arc::new(extractor),
            Arc::clone(&store),
            Arc::new(EvidenceStore::new(scratch_dir())),
            EuclideanMatcher::default(),
        );
        (recognizer, store, ana.id)
    }

    #[tokio::test]
    async fn test_match_carries_confidence_and_evidence() {
        let (r, _, ana) = setup(FakeExtractor::always(vec![0.3, 0.4]));
        match r.recognize(b"img".to_vec()).await {
            Recognition::Matched {
                identity_id,
                confidence,
                evidence_ref,
                ..
            } => {
                assert_eq!(identity_id, ana);
                assert_eq!(confidence, 50);
                assert_eq!(evidence_ref.len(), 64);
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_far_probe_is_unknown() {
        let (r, _, _) = setup(FakeExtractor::always(vec![3.0, 4.0]));
        assert!(matches!(
            r.recognize(b"img".to_vec()).await,
            Recognition::Unknown { .. }
        ));
    }

    #[tokio::test]
    async fn test_no_face_passes_through() {
        let (r, _, _) = setup(FakeExtractor::scripted(vec![Ok(None)]));
        assert_eq!(r.recognize(b"img".to_vec()).await, Recognition::NoFace);
    }

    #[tokio::test]
    async fn test_store_outage_is_failure() {
        let (r, store, _) = setup(FakeExtractor::always(vec![0.0, 0.0]));
        store.set_offline(true);
        assert!(matches!(r.recognize(b"img".to_vec()).await, Recognition::Failed(_)));
    }
}
