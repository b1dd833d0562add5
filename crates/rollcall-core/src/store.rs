//! Persistence seams consumed by the enrollment orchestrator and the ledger.

use crate::types::{AttendanceRecord, Candidate, Descriptor, Identity};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("identity not found: {0}")]
    IdentityNotFound(String),
    #[error("attendance record not found: {0}")]
    RecordNotFound(String),
    #[error("external reference already registered: {0}")]
    DuplicateExternalRef(String),
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Half-open UTC interval `[start, end)` covering one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DayWindow {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }
}

/// Keyed collection of registered identities.
pub trait IdentityStore: Send + Sync {
    fn create_identity(&self, display_name: &str, external_ref: &str) -> Result<Identity, StoreError>;

    fn get_identity(&self, id: &str) -> Result<Identity, StoreError>;

    fn list_identities(&self) -> Result<Vec<Identity>, StoreError>;

    fn rename_identity(&self, id: &str, display_name: &str) -> Result<Identity, StoreError>;

    /// Set or clear the optional category and rank.
    fn set_attributes(
        &self,
        id: &str,
        category: Option<&str>,
        rank: Option<&str>,
    ) -> Result<Identity, StoreError>;

    /// Replace the identity's whole reference set in one step.
    fn replace_descriptors(&self, id: &str, descriptors: &[Descriptor]) -> Result<(), StoreError>;

    /// Identities holding at least one reference descriptor, in a stable order.
    fn candidates(&self) -> Result<Vec<Candidate>, StoreError>;
}

/// Operations available inside one serialized ledger write.
pub trait LedgerTx {
    fn find_for_identity(
        &mut self,
        identity_id: &str,
        day: &DayWindow,
    ) -> Result<Option<AttendanceRecord>, StoreError>;

    /// Highest sequence number assigned in `day`, 0 when the day is empty.
    fn max_sequence(&mut self, day: &DayWindow) -> Result<u32, StoreError>;

    fn insert(&mut self, record: &AttendanceRecord, day: &DayWindow) -> Result<(), StoreError>;
}

/// Attendance record persistence.
pub trait AttendanceStore: Send + Sync {
    /// Run `f` as one atomic unit. No other ledger write interleaves with it;
    /// nothing it inserted survives if it returns an error.
    fn write<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<R, StoreError>;

    fn get_record(&self, id: &str) -> Result<AttendanceRecord, StoreError>;

    /// Set a new display name and append a history entry whose
    /// `previous_name` is the name current at the time of the write.
    fn rename_with_history(
        &self,
        id: &str,
        new_name: &str,
        edited_by: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<AttendanceRecord, StoreError>;

    /// Records in `day`, ordered by sequence.
    fn list_window(&self, day: &DayWindow) -> Result<Vec<AttendanceRecord>, StoreError>;

    /// Returns `false` when the record was already gone.
    fn delete_record(&self, id: &str) -> Result<bool, StoreError>;
}

impl<T: IdentityStore + ?Sized> IdentityStore for std::sync::Arc<T> {
    fn create_identity(&self, display_name: &str, external_ref: &str) -> Result<Identity, StoreError> {
        (**self).create_identity(display_name, external_ref)
    }

    fn get_identity(&self, id: &str) -> Result<Identity, StoreError> {
        (**self).get_identity(id)
    }

    fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        (**self).list_identities()
    }

    fn rename_identity(&self, id: &str, display_name: &str) -> Result<Identity, StoreError> {
        (**self).rename_identity(id, display_name)
    }

    fn set_attributes(
        &self,
        id: &str,
        category: Option<&str>,
        rank: Option<&str>,
    ) -> Result<Identity, StoreError> {
        (**self).set_attributes(id, category, rank)
    }

    fn replace_descriptors(&self, id: &str, descriptors: &[Descriptor]) -> Result<(), StoreError> {
        (**self).replace_descriptors(id, descriptors)
    }

    fn candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        (**self).candidates()
    }
}

impl<T: AttendanceStore> AttendanceStore for std::sync::Arc<T> {
    fn write<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<R, StoreError>,
    {
        (**self).write(f)
    }

    fn get_record(&self, id: &str) -> Result<AttendanceRecord, StoreError> {
        (**self).get_record(id)
    }

    fn rename_with_history(
        &self,
        id: &str,
        new_name: &str,
        edited_by: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<AttendanceRecord, StoreError> {
        (**self).rename_with_history(id, new_name, edited_by, edited_at)
    }

    fn list_window(&self, day: &DayWindow) -> Result<Vec<AttendanceRecord>, StoreError> {
        (**self).list_window(day)
    }

    fn delete_record(&self, id: &str) -> Result<bool, StoreError> {
        (**self).delete_record(id)
    }
}
