//! Head pose stages for guided enrollment.
//!
//! The enrollment prompts visit a fixed, explicit list of stages. Each stage
//! owns an angular test over (pitch, yaw) in degrees: positive yaw is a turn
//! to the subject's left, positive pitch is looking up.

use serde::{Deserialize, Serialize};

/// |pitch| and |yaw| must both stay within this for the CENTER stage.
pub const CENTER_TOLERANCE_DEG: f32 = 14.0;
/// Minimum |yaw| for LEFT/RIGHT and minimum |pitch| for UP/DOWN.
pub const TURN_THRESHOLD_DEG: f32 = 12.0;

/// Head orientation of a detected face, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub pitch: f32,
    pub yaw: f32,
}

impl Pose {
    pub fn new(pitch: f32, yaw: f32) -> Self {
        Self { pitch, yaw }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoseStage {
    Center,
    Left,
    Right,
    Up,
    Down,
}

/// Stage visiting order. Each stage contributes exactly one sample.
pub const STAGE_ORDER: [PoseStage; 5] = [
    PoseStage::Center,
    PoseStage::Left,
    PoseStage::Right,
    PoseStage::Up,
    PoseStage::Down,
];

/// Angular acceptance thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseThresholds {
    pub center_tolerance: f32,
    pub turn_threshold: f32,
}

impl Default for PoseThresholds {
    fn default() -> Self {
        Self {
            center_tolerance: CENTER_TOLERANCE_DEG,
            turn_threshold: TURN_THRESHOLD_DEG,
        }
    }
}

impl PoseStage {
    /// Whether `pose` satisfies this stage.
    pub fn accepts(&self, pose: Pose, t: &PoseThresholds) -> bool {
        match self {
            PoseStage::Center => {
                pose.pitch.abs() <= t.center_tolerance && pose.yaw.abs() <= t.center_tolerance
            }
            PoseStage::Left => pose.yaw > t.turn_threshold,
            PoseStage::Right => pose.yaw < -t.turn_threshold,
            PoseStage::Up => pose.pitch > t.turn_threshold,
            PoseStage::Down => pose.pitch < -t.turn_threshold,
        }
    }

    /// Operator prompt for this stage.
    pub fn prompt(&self) -> &'static str {
        match self {
            PoseStage::Center => "look straight at the camera",
            PoseStage::Left => "turn your head to the left",
            PoseStage::Right => "turn your head to the right",
            PoseStage::Up => "tilt your head up",
            PoseStage::Down => "tilt your head down",
        }
    }
}

/// Cursor over an ordered stage list.
#[derive(Debug, Clone)]
pub struct StageCursor {
    stages: Vec<PoseStage>,
    position: usize,
}

impl Default for StageCursor {
    fn default() -> Self {
        Self::new(STAGE_ORDER.to_vec())
    }
}

impl StageCursor {
    pub fn new(stages: Vec<PoseStage>) -> Self {
        Self {
            stages,
            position: 0,
        }
    }

    /// The stage awaiting a sample, or `None` once every stage is done.
    pub fn current(&self) -> Option<PoseStage> {
        self.stages.get(self.position).copied()
    }

    pub fn advance(&mut self) {
        if self.position < self.stages.len() {
            self.position += 1;
        }
    }

    pub fn is_done(&self) -> bool {
        self.position >= self.stages.len()
    }

    /// Number of stages already completed.
    pub fn completed(&self) -> usize {
        self.position
    }

    pub fn total(&self) -> usize {
        self.stages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_accepts_within_tolerance() {
        let t = PoseThresholds::default();
        assert!(PoseStage::Center.accepts(Pose::new(0.0, 0.0), &t));
        assert!(PoseStage::Center.accepts(Pose::new(14.0, -14.0), &t));
        assert!(!PoseStage::Center.accepts(Pose::new(0.0, 14.5), &t));
        assert!(!PoseStage::Center.accepts(Pose::new(-20.0, 0.0), &t));
    }

    #[test]
    fn test_turn_stages_are_strict() {
        let t = PoseThresholds::default();
        assert!(!PoseStage::Left.accepts(Pose::new(0.0, 12.0), &t));
        assert!(PoseStage::Left.accepts(Pose::new(0.0, 12.5), &t));
        assert!(PoseStage::Right.accepts(Pose::new(0.0, -20.0), &t));
        assert!(!PoseStage::Right.accepts(Pose::new(0.0, 20.0), &t));
        assert!(PoseStage::Up.accepts(Pose::new(15.0, 0.0), &t));
        assert!(PoseStage::Down.accepts(Pose::new(-15.0, 0.0), &t));
        assert!(!PoseStage::Down.accepts(Pose::new(-12.0, 0.0), &t));
    }

    #[test]
    fn test_cursor_walks_stage_order() {
        let mut cursor = StageCursor::default();
        let mut seen = Vec::new();
        while let Some(stage) = cursor.current() {
            seen.push(stage);
            cursor.advance();
        }
        assert_eq!(seen, STAGE_ORDER.to_vec());
        assert!(cursor.is_done());
        assert_eq!(cursor.completed(), 5);

        // Advancing past the end is a no-op.
        cursor.advance();
        assert_eq!(cursor.completed(), 5);
    }

    #[test]
    fn test_stage_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&PoseStage::Left).unwrap(), "\"LEFT\"");
    }
}
