//! rollcall-core — attendance by face recognition.
//!
//! Descriptor matching, pose-guided enrollment, the continuous-scan session
//! controller and the attendance ledger. Extraction and persistence are
//! reached through the traits in [`store`] and the callers' own extractor.

pub mod enrollment;
pub mod ledger;
pub mod matcher;
pub mod memory;
pub mod pose;
pub mod scan;
pub mod store;
pub mod types;

pub use matcher::{EuclideanMatcher, Matcher};
pub use pose::{Pose, PoseStage};
pub use types::{AttendanceRecord, Candidate, Descriptor, EditEntry, Identity, MatchResult, RecognitionMode};
