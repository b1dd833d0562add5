use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Face descriptor vector (typically 128-dimensional).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Compute Euclidean distance between two descriptors.
    ///
    /// Callers must check that both sides have the same dimensionality;
    /// extra trailing values on either side are ignored.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// A registered person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    /// External reference (e.g. national ID card number). Unique.
    pub external_ref: String,
    /// Reference set from the last completed enrollment. Empty until enrolled.
    pub descriptors: Vec<Descriptor>,
    pub created_at: DateTime<Utc>,
    /// Free-form grouping, e.g. a weight class or belt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<String>,
}

impl Identity {
    pub fn is_enrolled(&self) -> bool {
        !self.descriptors.is_empty()
    }
}

/// Matching view of an identity: its id, name, and reference descriptors.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub identity_id: String,
    pub display_name: String,
    pub references: Vec<Descriptor>,
}

/// Result of matching a probe descriptor against the enrolled candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchResult {
    Matched {
        identity_id: String,
        display_name: String,
        /// Euclidean distance of the closest reference.
        distance: f32,
        /// `round((1 - distance) * 100)`, clamped to 0..=100.
        confidence: u8,
    },
    Unknown,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }
}

/// How an attendance record was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionMode {
    Facial,
    Manual,
}

impl RecognitionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionMode::Facial => "facial",
            RecognitionMode::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "facial" => Some(RecognitionMode::Facial),
            "manual" => Some(RecognitionMode::Manual),
            _ => None,
        }
    }
}

/// One correction of a visitor record's display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditEntry {
    /// Name that was current before this edit.
    pub previous_name: String,
    pub edited_by: String,
    pub edited_at: DateTime<Utc>,
}

/// A persisted attendance registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    /// Per-day sequence number, starting at 1.
    pub sequence: u32,
    pub timestamp: DateTime<Utc>,
    pub identity_id: Option<String>,
    pub display_name: String,
    pub mode: RecognitionMode,
    /// Match confidence 0..=100, facial registrations only.
    pub confidence: Option<u8>,
    pub is_visitor: bool,
    /// Content reference of the evidence image.
    pub evidence_ref: String,
    pub edit_history: Vec<EditEntry>,
}
