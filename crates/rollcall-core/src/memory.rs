//! In-process stores, for tests and for embedding without a database.

use crate::store::{AttendanceStore, DayWindow, IdentityStore, LedgerTx, StoreError};
use crate::types::{AttendanceRecord, Candidate, Descriptor, EditEntry, Identity};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    m.lock()
        .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
}

/// Identity store kept in a `Vec`, insertion ordered.
#[derive(Default)]
pub struct MemoryIdentityStore {
    identities: Mutex<Vec<Identity>>,
    offline: AtomicBool,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `Unavailable` while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("identity store offline".to_string()));
        }
        Ok(())
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn create_identity(&self, display_name: &str, external_ref: &str) -> Result<Identity, StoreError> {
        self.check_online()?;
        let mut identities = lock(&self.identities)?;
        if identities.iter().any(|i| i.external_ref == external_ref) {
            return Err(StoreError::DuplicateExternalRef(external_ref.to_string()));
        }
        let identity = Identity {
            id: uuid::Uuid::new_v4().to_string(),
            display_name: display_name.to_string(),
            external_ref: external_ref.to_string(),
            descriptors: Vec::new(),
            created_at: Utc::now(),
            category: None,
            rank: None,
        };
        identities.push(identity.clone());
        Ok(identity)
    }

    fn get_identity(&self, id: &str) -> Result<Identity, StoreError> {
        self.check_online()?;
        lock(&self.identities)?
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| StoreError::IdentityNotFound(id.to_string()))
    }

    fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        self.check_online()?;
        Ok(lock(&self.identities)?.clone())
    }

    fn rename_identity(&self, id: &str, display_name: &str) -> Result<Identity, StoreError> {
        self.check_online()?;
        let mut identities = lock(&self.identities)?;
        let identity = identities
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| StoreError::IdentityNotFound(id.to_string()))?;
        identity.display_name = display_name.to_string();
        Ok(identity.clone())
    }

    fn set_attributes(
        &self,
        id: &str,
        category: Option<&str>,
        rank: Option<&str>,
    ) -> Result<Identity, StoreError> {
        self.check_online()?;
        let mut identities = lock(&self.identities)?;
        let identity = identities
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| StoreError::IdentityNotFound(id.to_string()))?;
        identity.category = category.map(str::to_string);
        identity.rank = rank.map(str::to_string);
        Ok(identity.clone())
    }

    fn replace_descriptors(&self, id: &str, descriptors: &[Descriptor]) -> Result<(), StoreError> {
        self.check_online()?;
        let mut identities = lock(&self.identities)?;
        let identity = identities
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| StoreError::IdentityNotFound(id.to_string()))?;
        identity.descriptors = descriptors.to_vec();
        Ok(())
    }

    fn candidates(&self) -> Result<Vec<Candidate>, StoreError> {
        self.check_online()?;
        Ok(lock(&self.identities)?
            .iter()
            .filter(|i| i.is_enrolled())
            .map(|i| Candidate {
                identity_id: i.id.clone(),
                display_name: i.display_name.clone(),
                references: i.descriptors.clone(),
            })
            .collect())
    }
}

/// Attendance store kept in a `Vec`. One mutex serializes every write.
#[derive(Default)]
pub struct MemoryAttendanceStore {
    records: Mutex<Vec<AttendanceRecord>>,
}

impl MemoryAttendanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Working copy of the records; swapped in only when the write succeeds.
struct MemoryTx {
    records: Vec<AttendanceRecord>,
}

impl LedgerTx for MemoryTx {
    fn find_for_identity(
        &mut self,
        identity_id: &str,
        day: &DayWindow,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        Ok(self
            .records
            .iter()
            .find(|r| r.identity_id.as_deref() == Some(identity_id) && day.contains(r.timestamp))
            .cloned())
    }

    fn max_sequence(&mut self, day: &DayWindow) -> Result<u32, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|r| day.contains(r.timestamp))
            .map(|r| r.sequence)
            .max()
            .unwrap_or(0))
    }

    fn insert(&mut self, record: &AttendanceRecord, day: &DayWindow) -> Result<(), StoreError> {
        let clash = self.records.iter().any(|r| {
            day.contains(r.timestamp)
                && (r.sequence == record.sequence
                    || (record.identity_id.is_some() && r.identity_id == record.identity_id))
        });
        if clash {
            return Err(StoreError::Conflict(format!(
                "sequence {} or identity already used today",
                record.sequence
            )));
        }
        self.records.push(record.clone());
        Ok(())
    }
}

impl AttendanceStore for MemoryAttendanceStore {
    fn write<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<R, StoreError>,
    {
        let mut records = lock(&self.records)?;
        let mut tx = MemoryTx {
            records: records.clone(),
        };
        let result = f(&mut tx)?;
        *records = tx.records;
        Ok(result)
    }

    fn get_record(&self, id: &str) -> Result<AttendanceRecord, StoreError> {
        lock(&self.records)?
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StoreError::RecordNotFound(id.to_string()))
    }

    fn rename_with_history(
        &self,
        id: &str,
        new_name: &str,
        edited_by: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<AttendanceRecord, StoreError> {
        let mut records = lock(&self.records)?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::RecordNotFound(id.to_string()))?;
        let previous_name = std::mem::replace(&mut record.display_name, new_name.to_string());
        record.edit_history.push(EditEntry {
            previous_name,
            edited_by: edited_by.to_string(),
            edited_at,
        });
        Ok(record.clone())
    }

    fn list_window(&self, day: &DayWindow) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut out: Vec<AttendanceRecord> = lock(&self.records)?
            .iter()
            .filter(|r| day.contains(r.timestamp))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.sequence);
        Ok(out)
    }

    fn delete_record(&self, id: &str) -> Result<bool, StoreError> {
        let mut records = lock(&self.records)?;
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }
}
