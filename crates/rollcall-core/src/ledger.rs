//! Attendance ledger: per-day sequence numbers, same-day duplicate
//! detection, visitor fallbacks and visitor name corrections.

use crate::store::{AttendanceStore, DayWindow, StoreError};
use crate::types::{AttendanceRecord, RecognitionMode};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Display name used for visitors registered without one.
pub const VISITOR_NAME: &str = "Visitor";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("record {0} is not a visitor record")]
    NotAVisitor(String),
    #[error("display name must not be empty")]
    EmptyName,
    #[error("confidence {0} outside 0..=100")]
    InvalidConfidence(u8),
}

/// A registration attempt.
#[derive(Debug, Clone)]
pub struct Registration {
    /// `None` registers a visitor.
    pub identity_id: Option<String>,
    pub display_name: String,
    pub mode: RecognitionMode,
    pub confidence: Option<u8>,
    pub evidence_ref: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "record", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegisterOutcome {
    Registered(AttendanceRecord),
    /// The identity already has a record today; it is returned unchanged.
    AlreadyRegistered(AttendanceRecord),
}

impl RegisterOutcome {
    pub fn record(&self) -> &AttendanceRecord {
        match self {
            RegisterOutcome::Registered(r) | RegisterOutcome::AlreadyRegistered(r) => r,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, RegisterOutcome::AlreadyRegistered(_))
    }
}

/// Per-day totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaySummary {
    pub date: NaiveDate,
    pub total: usize,
    pub facial: usize,
    pub manual: usize,
    pub visitors: usize,
}

pub struct Ledger<S> {
    store: S,
    /// Offset whose midnight starts each attendance day.
    offset: FixedOffset,
}

impl<S: AttendanceStore> Ledger<S> {
    pub fn new(store: S, offset: FixedOffset) -> Self {
        Self { store, offset }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Calendar date of `now` in the ledger's offset.
    pub fn date_of(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    pub fn window_for_date(&self, date: NaiveDate) -> DayWindow {
        let local_midnight = date.and_time(NaiveTime::MIN);
        let start = local_midnight.and_utc() - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        DayWindow {
            start,
            end: start + Duration::hours(24),
        }
    }

    pub fn day_window(&self, now: DateTime<Utc>) -> DayWindow {
        self.window_for_date(self.date_of(now))
    }

    /// Register attendance at `now`.
    ///
    /// The duplicate check and sequence assignment run in one store write,
    /// so two concurrent registrations cannot both claim a sequence number
    /// or both succeed for the same identity and day.
    pub fn register(&self, reg: Registration, now: DateTime<Utc>) -> Result<RegisterOutcome, LedgerError> {
        if let Some(c) = reg.confidence {
            if c > 100 {
                return Err(LedgerError::InvalidConfidence(c));
            }
        }

        let day = self.day_window(now);
        let is_visitor = reg.identity_id.is_none();
        let display_name = match reg.display_name.trim() {
            "" if is_visitor => VISITOR_NAME.to_string(),
            "" => return Err(LedgerError::EmptyName),
            name => name.to_string(),
        };
        let confidence = match reg.mode {
            RecognitionMode::Facial => reg.confidence,
            RecognitionMode::Manual => None,
        };

        let outcome = self.store.write(|tx| {
            if let Some(identity_id) = reg.identity_id.as_deref() {
                if let Some(existing) = tx.find_for_identity(identity_id, &day)? {
                    return Ok(RegisterOutcome::AlreadyRegistered(existing));
                }
            }

            let sequence = tx.max_sequence(&day)? + 1;
            let record = AttendanceRecord {
                id: uuid::Uuid::new_v4().to_string(),
                sequence,
                timestamp: now,
                identity_id: reg.identity_id,
                display_name,
                mode: reg.mode,
                confidence,
                is_visitor,
                evidence_ref: reg.evidence_ref,
                edit_history: Vec::new(),
            };
            tx.insert(&record, &day)?;
            Ok(RegisterOutcome::Registered(record))
        })?;

        let record = outcome.record();
        if outcome.is_duplicate() {
            tracing::info!(
                record = %record.id,
                identity = ?record.identity_id,
                sequence = record.sequence,
                "already registered today"
            );
        } else {
            tracing::info!(
                record = %record.id,
                sequence = record.sequence,
                name = %record.display_name,
                mode = record.mode.as_str(),
                visitor = record.is_visitor,
                "attendance registered"
            );
        }

        Ok(outcome)
    }

    /// Correct the display name of a visitor record.
    pub fn edit_display_name(
        &self,
        record_id: &str,
        new_name: &str,
        editor: &str,
        now: DateTime<Utc>,
    ) -> Result<AttendanceRecord, LedgerError> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(LedgerError::EmptyName);
        }

        let record = self.store.get_record(record_id)?;
        if !record.is_visitor {
            return Err(LedgerError::NotAVisitor(record_id.to_string()));
        }

        let updated = self
            .store
            .rename_with_history(record_id, new_name, editor, now)?;
        tracing::info!(
            record = record_id,
            editor,
            edits = updated.edit_history.len(),
            "visitor name corrected"
        );
        Ok(updated)
    }

    /// Delete a record. Deleting a missing record succeeds and returns `false`.
    /// Sibling sequence numbers are left as they are.
    pub fn delete(&self, record_id: &str) -> Result<bool, LedgerError> {
        let removed = self.store.delete_record(record_id)?;
        tracing::info!(record = record_id, removed, "attendance record deleted");
        Ok(removed)
    }

    pub fn records_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        Ok(self.store.list_window(&self.window_for_date(date))?)
    }

    pub fn summary_for_date(&self, date: NaiveDate) -> Result<DaySummary, LedgerError> {
        let records = self.records_for_date(date)?;
        let mut summary = DaySummary {
            date,
            total: records.len(),
            facial: 0,
            manual: 0,
            visitors: 0,
        };
        for r in &records {
            match r.mode {
                RecognitionMode::Facial => summary.facial += 1,
                RecognitionMode::Manual => summary.manual += 1,
            }
            if r.is_visitor {
                summary.visitors += 1;
            }
        }
        Ok(summary)
    }
}
