use crate::enroller::{Enroller, EnrollerError};
use crate::evidence::EvidenceStore;
use crate::extractor::HttpExtractor;
use crate::scanner::{ScannerError, ScannerHandle};
use chrono::{DateTime, NaiveDate, Utc};
use rollcall_core::enrollment::EnrollmentError;
use rollcall_core::ledger::{Ledger, LedgerError, Registration};
use rollcall_core::store::{IdentityStore, StoreError};
use rollcall_core::{Identity, Pose, RecognitionMode};
use rollcall_store::SqliteStore;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use zbus::interface;

pub const BUS_NAME: &str = "io.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/io/rollcall/Rollcall1";

type Store = Arc<SqliteStore>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Enroll(#[from] EnrollerError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scanner(#[from] ScannerError),
    #[error("evidence: {0}")]
    Evidence(#[from] std::io::Error),
    #[error("encode reply: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid date {0:?}, expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("unknown identity {0:?}")]
    UnknownIdentity(String),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<EnrollmentError> for ServiceError {
    fn from(e: EnrollmentError) -> Self {
        ServiceError::Enroll(e.into())
    }
}

impl From<ServiceError> for zbus::fdo::Error {
    fn from(e: ServiceError) -> Self {
        let message = e.to_string();
        match e {
            ServiceError::InvalidDate(_)
            | ServiceError::UnknownIdentity(_)
            | ServiceError::Ledger(
                LedgerError::EmptyName | LedgerError::NotAVisitor(_) | LedgerError::InvalidConfidence(_),
            )
            | ServiceError::Enroll(EnrollerError::NoFace) => zbus::fdo::Error::InvalidArgs(message),
            _ => zbus::fdo::Error::Failed(message),
        }
    }
}

/// Identity as listed over the bus; descriptors are reduced to a count.
#[derive(Debug, Serialize)]
struct IdentitySummary {
    id: String,
    display_name: String,
    external_ref: String,
    references: usize,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rank: Option<String>,
}

impl From<Identity> for IdentitySummary {
    fn from(i: Identity) -> Self {
        Self {
            references: i.descriptors.len(),
            id: i.id,
            display_name: i.display_name,
            external_ref: i.external_ref,
            created_at: i.created_at,
            category: i.category,
            rank: i.rank,
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, ServiceError> {
    Ok(serde_json::to_string(value)?)
}

/// D-Bus interface for the attendance daemon.
///
/// Bus name: io.rollcall.Rollcall1
/// Object path: /io/rollcall/Rollcall1
///
/// Structured replies are JSON strings.
pub struct RollcallService {
    scanner: ScannerHandle,
    enroller: Arc<Enroller<HttpExtractor, Store>>,
    ledger: Arc<Ledger<Store>>,
    identities: Store,
    evidence: Arc<EvidenceStore>,
}

impl RollcallService {
    pub fn new(
        scanner: ScannerHandle,
        enroller: Arc<Enroller<HttpExtractor, Store>>,
        ledger: Arc<Ledger<Store>>,
        identities: Store,
        evidence: Arc<EvidenceStore>,
    ) -> Self {
        Self {
            scanner,
            enroller,
            ledger,
            identities,
            evidence,
        }
    }

    fn date_or_today(&self, date: &str) -> Result<NaiveDate, ServiceError> {
        let date = date.trim();
        if date.is_empty() {
            return Ok(self.ledger.date_of(Utc::now()));
        }
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|_| ServiceError::InvalidDate(date.to_string()))
    }

    async fn register_manual_inner(
        &self,
        identity_id: &str,
        display_name: &str,
        image: Vec<u8>,
    ) -> Result<String, ServiceError> {
        // A record tied to an identity always carries that identity's name.
        let identity_id = Some(identity_id.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let display_name = match identity_id.clone() {
            Some(id) => {
                let identities = Arc::clone(&self.identities);
                blocking(move || match identities.get_identity(&id) {
                    Ok(identity) => Ok(identity.display_name),
                    Err(StoreError::IdentityNotFound(_)) => Err(ServiceError::UnknownIdentity(id)),
                    Err(e) => Err(e.into()),
                })
                .await?
            }
            None => display_name.to_string(),
        };
        let evidence_ref = self.evidence.put(&image).await?;

        let ledger = Arc::clone(&self.ledger);
        let outcome = blocking(move || {
            Ok(ledger.register(
                Registration {
                    identity_id,
                    display_name,
                    mode: RecognitionMode::Manual,
                    confidence: None,
                    evidence_ref,
                },
                Utc::now(),
            )?)
        })
        .await?;
        to_json(&outcome)
    }

    async fn set_attributes_inner(
        &self,
        identity_id: &str,
        category: &str,
        rank: &str,
    ) -> Result<String, ServiceError> {
        let store = Arc::clone(&self.identities);
        let id = identity_id.to_string();
        let category = Some(category.trim().to_string()).filter(|s| !s.is_empty());
        let rank = Some(rank.trim().to_string()).filter(|s| !s.is_empty());
        let identity = blocking(move || {
            Ok(store.set_attributes(&id, category.as_deref(), rank.as_deref())?)
        })
        .await?;
        to_json(&IdentitySummary::from(identity))
    }

    async fn status_inner(&self) -> Result<String, ServiceError> {
        let (scan, stats) = self.scanner.snapshot().await?;
        let store = Arc::clone(&self.identities);
        let identities = blocking(move || Ok(store.list_identities()?)).await?;
        let enrolled = identities.iter().filter(|i| i.is_enrolled()).count();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "scan": scan,
            "scan_stats": stats,
            "active_enrollments": self.enroller.orchestrator().active_count(),
            "identities": identities.len(),
            "enrolled": enrolled,
        })
        .to_string())
    }
}

/// Run a store call on the blocking pool, off the bus executor.
async fn blocking<T, F>(f: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

#[interface(name = "io.rollcall.Rollcall1")]
impl RollcallService {
    /// Register a person. `external_ref` must be unique.
    async fn create_identity(&self, display_name: &str, external_ref: &str) -> zbus::fdo::Result<String> {
        tracing::info!(external_ref, "create_identity requested");
        let store = Arc::clone(&self.identities);
        let (name, external_ref) = (display_name.trim().to_string(), external_ref.trim().to_string());
        let identity = blocking(move || Ok(store.create_identity(&name, &external_ref)?)).await?;
        Ok(to_json(&IdentitySummary::from(identity))?)
    }

    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let store = Arc::clone(&self.identities);
        let identities: Vec<IdentitySummary> = blocking(move || Ok(store.list_identities()?))
            .await?
            .into_iter()
            .map(IdentitySummary::from)
            .collect();
        Ok(to_json(&identities)?)
    }

    async fn rename_identity(&self, identity_id: &str, display_name: &str) -> zbus::fdo::Result<String> {
        let store = Arc::clone(&self.identities);
        let (id, name) = (identity_id.to_string(), display_name.trim().to_string());
        let identity = blocking(move || Ok(store.rename_identity(&id, &name)?)).await?;
        Ok(to_json(&IdentitySummary::from(identity))?)
    }

    /// Set an identity's category and rank. An empty string clears a field.
    async fn set_identity_attributes(
        &self,
        identity_id: &str,
        category: &str,
        rank: &str,
    ) -> zbus::fdo::Result<String> {
        Ok(self.set_attributes_inner(identity_id, category, rank).await?)
    }

    /// Open a guided enrollment session. Returns progress JSON.
    async fn begin_enrollment(&self, identity_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(identity_id, "begin_enrollment requested");
        let progress = self
            .enroller
            .begin(identity_id)
            .await
            .map_err(ServiceError::from)?;
        Ok(to_json(&progress)?)
    }

    /// Feed one frame of a guided enrollment. `has_face = false` ignores the
    /// pose. Returns frame feedback JSON.
    async fn feed_enrollment_frame(
        &self,
        identity_id: &str,
        has_face: bool,
        pitch: f64,
        yaw: f64,
        image: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        let pose = has_face.then(|| Pose::new(pitch as f32, yaw as f32));
        let feedback = self
            .enroller
            .feed_frame(identity_id, pose, image)
            .await
            .map_err(ServiceError::from)?;
        Ok(to_json(&feedback)?)
    }

    async fn cancel_enrollment(&self, identity_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(identity_id, "cancel_enrollment requested");
        let progress = self
            .enroller
            .cancel(identity_id)
            .await
            .map_err(ServiceError::from)?;
        Ok(to_json(&progress)?)
    }

    /// Resubmit the samples of a completed but unsaved enrollment.
    async fn retry_finalize(&self, identity_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(identity_id, "retry_finalize requested");
        let progress = self
            .enroller
            .retry_finalize(identity_id)
            .await
            .map_err(ServiceError::from)?;
        Ok(to_json(&progress)?)
    }

    async fn enrollment_progress(&self, identity_id: &str) -> zbus::fdo::Result<String> {
        let progress = self
            .enroller
            .orchestrator()
            .progress(identity_id)
            .map_err(ServiceError::from)?;
        Ok(to_json(&progress)?)
    }

    /// Replace an identity's references with one descriptor from a photo.
    async fn enroll_from_photo(&self, identity_id: &str, image: Vec<u8>) -> zbus::fdo::Result<()> {
        tracing::info!(identity_id, bytes = image.len(), "enroll_from_photo requested");
        self.enroller
            .enroll_from_photo(identity_id, image)
            .await
            .map_err(ServiceError::from)?;
        Ok(())
    }

    /// Feed one scan frame. Returns the session event JSON after the frame.
    async fn feed_scan_frame(&self, face_present: bool, image: Vec<u8>) -> zbus::fdo::Result<String> {
        let event = self
            .scanner
            .feed_frame(face_present, image)
            .await
            .map_err(ServiceError::from)?;
        Ok(to_json(&event)?)
    }

    /// Operator registration. An empty `identity_id` registers a visitor
    /// under `display_name`; otherwise the identity's own name is used.
    async fn register_manual(
        &self,
        identity_id: &str,
        display_name: &str,
        image: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(identity_id, "register_manual requested");
        Ok(self.register_manual_inner(identity_id, display_name, image).await?)
    }

    async fn edit_display_name(&self, record_id: &str, new_name: &str, editor: &str) -> zbus::fdo::Result<String> {
        let ledger = Arc::clone(&self.ledger);
        let (id, name, editor) = (record_id.to_string(), new_name.to_string(), editor.to_string());
        let record = blocking(move || Ok(ledger.edit_display_name(&id, &name, &editor, Utc::now())?)).await?;
        Ok(to_json(&record)?)
    }

    /// Records of `date` (YYYY-MM-DD, empty for today) ordered by sequence.
    async fn list_records(&self, date: &str) -> zbus::fdo::Result<String> {
        let date = self.date_or_today(date)?;
        let ledger = Arc::clone(&self.ledger);
        let records = blocking(move || Ok(ledger.records_for_date(date)?)).await?;
        Ok(to_json(&records)?)
    }

    async fn summary(&self, date: &str) -> zbus::fdo::Result<String> {
        let date = self.date_or_today(date)?;
        let ledger = Arc::clone(&self.ledger);
        let summary = blocking(move || Ok(ledger.summary_for_date(date)?)).await?;
        Ok(to_json(&summary)?)
    }

    /// Delete a record. Returns whether anything was removed.
    async fn delete_record(&self, record_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(record_id, "delete_record requested");
        let ledger = Arc::clone(&self.ledger);
        let id = record_id.to_string();
        Ok(blocking(move || Ok(ledger.delete(&id)?)).await?)
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_inner().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::Recognizer;
    use crate::scanner::spawn_scanner;
    use crate::testing::scratch_dir;
    use chrono::FixedOffset;
    use rollcall_core::enrollment::{EnrollmentOrchestrator, EnrollmentSettings};
    use rollcall_core::scan::{ScanController, ScanTiming};
    use rollcall_core::EuclideanMatcher;
    use std::time::Duration;

    /// A service over an in-memory database. The extractor points at a port
    /// nothing listens on; these tests never reach it.
    fn service() -> (RollcallService, Store) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ledger = Arc::new(Ledger::new(Arc::clone(&store), FixedOffset::east_opt(0).unwrap()));
        let evidence = Arc::new(EvidenceStore::new(scratch_dir()));
        let extractor = Arc::new(HttpExtractor::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap());
        let recognizer = Arc::new(Recognizer::new(
            Arc::clone(&extractor),
            Arc::clone(&store),
            Arc::clone(&evidence),
            EuclideanMatcher::default(),
        ));
        let scanner = spawn_scanner(
            ScanController::new(ScanTiming::default()),
            recognizer,
            Arc::clone(&ledger),
        );
        let orchestrator = Arc::new(EnrollmentOrchestrator::new(
            Arc::clone(&store),
            EnrollmentSettings::default(),
        ));
        let enroller = Arc::new(Enroller::new(orchestrator, extractor));
        let service = RollcallService::new(scanner, enroller, ledger, Arc::clone(&store), evidence);
        (service, store)
    }

    fn today(service: &RollcallService) -> Vec<rollcall_core::AttendanceRecord> {
        let date = service.ledger.date_of(Utc::now());
        service.ledger.records_for_date(date).unwrap()
    }

    #[tokio::test]
    async fn test_manual_registration_takes_identity_name() {
        let (service, store) = service();
        let ana = store.create_identity("Ana", "X1").unwrap();

        service
            .register_manual_inner(&ana.id, "Somebody Else", b"photo".to_vec())
            .await
            .unwrap();

        let records = today(&service);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].display_name, "Ana");
        assert_eq!(records[0].identity_id.as_deref(), Some(ana.id.as_str()));
        assert_eq!(records[0].mode, RecognitionMode::Manual);
        assert!(!records[0].is_visitor);
        assert_eq!(records[0].evidence_ref.len(), 64);
    }

    #[tokio::test]
    async fn test_manual_registration_rejects_unknown_identity() {
        let (service, _store) = service();

        let err = service
            .register_manual_inner("no-such-identity", "Mallory", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::UnknownIdentity(_)));
        let e: zbus::fdo::Error = err.into();
        assert!(matches!(e, zbus::fdo::Error::InvalidArgs(_)));
        assert!(today(&service).is_empty());
    }

    #[tokio::test]
    async fn test_attributes_blank_clears() {
        let (service, store) = service();
        let ana = store.create_identity("Ana", "X1").unwrap();

        let reply = service.set_attributes_inner(&ana.id, " -57kg ", "blue").await.unwrap();
        let summary: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(summary["category"], "-57kg");
        assert_eq!(summary["rank"], "blue");

        service.set_attributes_inner(&ana.id, "", "blue").await.unwrap();
        let stored = store.get_identity(&ana.id).unwrap();
        assert_eq!(stored.category, None);
        assert_eq!(stored.rank.as_deref(), Some("blue"));
    }

    #[tokio::test]
    async fn test_manual_visitor_keeps_typed_name() {
        let (service, _store) = service();

        service.register_manual_inner("  ", "Guest", Vec::new()).await.unwrap();
        service.register_manual_inner("", "  ", Vec::new()).await.unwrap();

        let records = today(&service);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.is_visitor && r.identity_id.is_none()));
        assert_eq!(records[0].display_name, "Guest");
        assert_eq!(records[1].display_name, rollcall_core::ledger::VISITOR_NAME);
    }

    #[test]
    fn test_validation_errors_map_to_invalid_args() {
        let e: zbus::fdo::Error = ServiceError::Ledger(LedgerError::EmptyName).into();
        assert!(matches!(e, zbus::fdo::Error::InvalidArgs(_)));

        let e: zbus::fdo::Error = ServiceError::InvalidDate("31/12".into()).into();
        assert!(matches!(e, zbus::fdo::Error::InvalidArgs(_)));
    }

    #[test]
    fn test_store_errors_map_to_failed() {
        let e: zbus::fdo::Error =
            ServiceError::Store(StoreError::Unavailable("disk".into())).into();
        match e {
            zbus::fdo::Error::Failed(msg) => assert!(msg.contains("disk")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_identity_summary_counts_references() {
        let identity = Identity {
            id: "i".into(),
            display_name: "Ana".into(),
            external_ref: "X1".into(),
            descriptors: vec![rollcall_core::Descriptor::new(vec![0.1]); 3],
            created_at: Utc::now(),
            category: None,
            rank: None,
        };
        let summary = IdentitySummary::from(identity);
        assert_eq!(summary.references, 3);
    }
}
