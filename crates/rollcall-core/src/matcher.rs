//! Identity matching by Euclidean distance.

use crate::types::{Candidate, Descriptor, MatchResult};

/// Distance at or above which a probe is reported as unknown.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Strategy for comparing a probe descriptor against the enrolled candidates.
pub trait Matcher {
    fn compare(&self, probe: &Descriptor, candidates: &[Candidate]) -> MatchResult;
}

/// Nearest-reference matcher.
///
/// Each candidate scores its closest reference; the candidate with the
/// smallest score wins. Ties keep the candidate seen first.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Descriptor, candidates: &[Candidate]) -> MatchResult {
        if probe.is_empty() {
            return MatchResult::Unknown;
        }

        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, candidate) in candidates.iter().enumerate() {
            let closest = candidate
                .references
                .iter()
                .filter(|r| r.len() == probe.len())
                .map(|r| probe.euclidean_distance(r))
                .fold(f32::INFINITY, f32::min);

            // Strict comparison: on ties the earlier candidate stays.
            if closest < best_distance {
                best_distance = closest;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_distance < self.threshold => {
                let candidate = &candidates[idx];
                MatchResult::Matched {
                    identity_id: candidate.identity_id.clone(),
                    display_name: candidate.display_name.clone(),
                    distance: best_distance,
                    confidence: confidence_for(best_distance),
                }
            }
            _ => MatchResult::Unknown,
        }
    }
}

/// Map a distance to a 0..=100 confidence figure.
pub fn confidence_for(distance: f32) -> u8 {
    ((1.0 - distance) * 100.0).round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, refs: Vec<Vec<f32>>) -> Candidate {
        Candidate {
            identity_id: id.into(),
            display_name: format!("name-{id}"),
            references: refs.into_iter().map(Descriptor::new).collect(),
        }
    }

    #[test]
    fn test_match_below_threshold() {
        let probe = Descriptor::new(vec![0.0, 0.0]);
        let gallery = vec![candidate("a", vec![vec![0.59, 0.0]])];

        let result = EuclideanMatcher::default().compare(&probe, &gallery);
        match result {
            MatchResult::Matched {
                identity_id,
                confidence,
                distance,
                ..
            } => {
                assert_eq!(identity_id, "a");
                assert_eq!(confidence, 41);
                assert!((distance - 0.59).abs() < 1e-5);
            }
            MatchResult::Unknown => panic!("expected a match"),
        }
    }

    #[test]
    fn test_unknown_above_threshold() {
        let probe = Descriptor::new(vec![0.0, 0.0]);
        let gallery = vec![candidate("a", vec![vec![0.61, 0.0]])];
        assert_eq!(
            EuclideanMatcher::default().compare(&probe, &gallery),
            MatchResult::Unknown
        );
    }

    #[test]
    fn test_unknown_at_exact_threshold() {
        let probe = Descriptor::new(vec![0.0, 0.0]);
        let reference = Descriptor::new(vec![0.3, 0.4]);
        let distance = probe.euclidean_distance(&reference);
        let gallery = vec![Candidate {
            identity_id: "a".into(),
            display_name: "A".into(),
            references: vec![reference],
        }];

        let result = EuclideanMatcher::new(distance).compare(&probe, &gallery);
        assert_eq!(result, MatchResult::Unknown);
    }

    #[test]
    fn test_closest_reference_wins_per_identity() {
        let probe = Descriptor::new(vec![0.0, 0.0]);
        // "a" has one far and one near reference; "b" sits in between.
        let gallery = vec![
            candidate("a", vec![vec![0.9, 0.0], vec![0.1, 0.0]]),
            candidate("b", vec![vec![0.3, 0.0]]),
        ];

        let result = EuclideanMatcher::default().compare(&probe, &gallery);
        match result {
            MatchResult::Matched {
                identity_id,
                confidence,
                ..
            } => {
                assert_eq!(identity_id, "a");
                assert_eq!(confidence, 90);
            }
            MatchResult::Unknown => panic!("expected a match"),
        }
    }

    #[test]
    fn test_tie_keeps_first_candidate() {
        let probe = Descriptor::new(vec![0.0, 0.0]);
        let gallery = vec![
            candidate("first", vec![vec![0.2, 0.0]]),
            candidate("second", vec![vec![0.0, 0.2]]),
        ];

        let result = EuclideanMatcher::default().compare(&probe, &gallery);
        assert!(matches!(
            result,
            MatchResult::Matched { ref identity_id, .. } if identity_id == "first"
        ));
    }

    #[test]
    fn test_candidates_without_references_never_match() {
        let probe = Descriptor::new(vec![0.0, 0.0]);
        let gallery = vec![candidate("empty", vec![])];
        assert_eq!(
            EuclideanMatcher::default().compare(&probe, &gallery),
            MatchResult::Unknown
        );
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let probe = Descriptor::new(vec![0.0, 0.0]);
        assert_eq!(
            EuclideanMatcher::default().compare(&probe, &[]),
            MatchResult::Unknown
        );
    }

    #[test]
    fn test_empty_probe_is_unknown() {
        let gallery = vec![candidate("a", vec![vec![0.0, 0.0]])];
        assert_eq!(
            EuclideanMatcher::default().compare(&Descriptor::new(vec![]), &gallery),
            MatchResult::Unknown
        );
    }

    #[test]
    fn test_dimension_mismatch_skipped() {
        let probe = Descriptor::new(vec![0.0, 0.0]);
        // A 1-dim reference would otherwise zip to distance 0.
        let gallery = vec![candidate("short", vec![vec![0.0]])];
        assert_eq!(
            EuclideanMatcher::default().compare(&probe, &gallery),
            MatchResult::Unknown
        );
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(confidence_for(0.0), 100);
        assert_eq!(confidence_for(1.5), 0);
        assert_eq!(confidence_for(0.25), 75);
    }
}
