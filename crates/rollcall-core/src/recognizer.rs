//! Recognition classifier and the two-tier confidence policy.
//!
//! The classifier reports a nearest-neighbour distance (lower = closer).
//! [`ThresholdPolicy`] is the only place distances are compared against the
//! display and attendance thresholds.

use crate::artifact::{ArtifactError, ModelArtifact};
use image::GrayImage;
use std::path::Path;
use thiserror::Error;

/// At or above this distance the model has no confident opinion.
pub const DEFAULT_DISPLAY_THRESHOLD: f64 = 100.0;
/// Below this distance a match may mark attendance.
pub const DEFAULT_ATTENDANCE_THRESHOLD: f64 = 55.0;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("no trained model at {0}; run training first")]
    NotTrained(String),
    #[error("artifact: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("invalid threshold policy: {0}")]
    InvalidPolicy(String),
}

/// What a classification allows the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not confident enough to name anyone.
    Unknown,
    /// Confident enough to show a name, not to mark attendance.
    DisplayOnly,
    /// Confident enough to mark attendance.
    MarkEligible,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdPolicy {
    display: f64,
    attendance: f64,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            display: DEFAULT_DISPLAY_THRESHOLD,
            attendance: DEFAULT_ATTENDANCE_THRESHOLD,
        }
    }
}

impl ThresholdPolicy {
    /// Both thresholds must be positive and the attendance bar may not be
    /// looser than the display bar.
    pub fn new(display: f64, attendance: f64) -> Result<Self, RecognizerError> {
        if !(display.is_finite() && display > 0.0) {
            return Err(RecognizerError::InvalidPolicy(format!(
                "display threshold must be a positive number, got {display}"
            )));
        }
        if !(attendance.is_finite() && attendance > 0.0) {
            return Err(RecognizerError::InvalidPolicy(format!(
                "attendance threshold must be a positive number, got {attendance}"
            )));
        }
        if attendance > display {
            return Err(RecognizerError::InvalidPolicy(format!(
                "attendance threshold {attendance} exceeds display threshold {display}"
            )));
        }
        Ok(Self { display, attendance })
    }

    pub fn display(&self) -> f64 {
        self.display
    }

    pub fn attendance(&self) -> f64 {
        self.attendance
    }

    pub fn verdict(&self, distance: f64) -> Verdict {
        if distance.is_nan() || distance >= self.display {
            Verdict::Unknown
        } else if distance >= self.attendance {
            Verdict::DisplayOnly
        } else {
            Verdict::MarkEligible
        }
    }
}

/// Raw classifier output.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub id: String,
    pub distance: f64,
}

/// Classifier output with the policy applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub candidate: Prediction,
    pub verdict: Verdict,
    /// Display name; `None` when the verdict is `Unknown`.
    pub name: Option<String>,
}

impl Recognition {
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }

    /// `(id, name)` when this recognition may mark attendance.
    pub fn attendance_identity(&self) -> Option<(&str, &str)> {
        match (self.verdict, self.name.as_deref()) {
            (Verdict::MarkEligible, Some(name)) => Some((self.candidate.id.as_str(), name)),
            _ => None,
        }
    }
}

/// A loaded, read-only trained model.
pub struct Recognizer {
    artifact: ModelArtifact,
}

impl Recognizer {
    /// Load the trained artifact.
    pub fn load(artifact_path: &Path) -> Result<Self, RecognizerError> {
        let artifact = ModelArtifact::load(artifact_path)?
            .ok_or_else(|| RecognizerError::NotTrained(artifact_path.display().to_string()))?;

        tracing::info!(
            path = %artifact_path.display(),
            revision = artifact.revision,
            identities = artifact.names.len(),
            samples = artifact.model.len(),
            trained_at = %artifact.trained_at,
            "loaded recognition model"
        );
        Ok(Self { artifact })
    }

    pub fn from_artifact(artifact: ModelArtifact) -> Self {
        Self { artifact }
    }

    /// Store revision the model was trained from.
    pub fn revision(&self) -> u64 {
        self.artifact.revision
    }

    /// True when the identity store has changed since training.
    pub fn is_stale(&self, store_revision: u64) -> bool {
        store_revision != self.artifact.revision
    }

    pub fn name_of(&self, id: &str) -> Option<&str> {
        self.artifact.names.get(id).map(String::as_str)
    }

    /// Nearest training sample to a cropped face. `None` only for a model
    /// with no samples, which loading rejects.
    pub fn classify(&self, face: &GrayImage) -> Option<Prediction> {
        self.artifact
            .model
            .predict(face)
            .map(|(id, distance)| Prediction {
                id: id.to_string(),
                distance,
            })
    }

    /// Classify and apply the threshold policy.
    pub fn recognize(&self, face: &GrayImage, policy: &ThresholdPolicy) -> Option<Recognition> {
        let candidate = self.classify(face)?;
        let verdict = match self.name_of(&candidate.id) {
            Some(_) => policy.verdict(candidate.distance),
            None => Verdict::Unknown,
        };
        let name = match verdict {
            Verdict::Unknown => None,
            _ => self.name_of(&candidate.id).map(str::to_string),
        };
        Some(Recognition {
            candidate,
            verdict,
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lbph::{LbphModel, LbphParams};
    use std::collections::BTreeMap;

    fn stripes(period: u32) -> GrayImage {
        GrayImage::from_fn(100, 100, |x, _| {
            image::Luma([if (x / period) % 2 == 0 { 20 } else { 230 }])
        })
    }

    fn recognizer() -> Recognizer {
        let mut model = LbphModel::new(LbphParams::default());
        model.add("1", &stripes(4));
        model.add("2", &stripes(9));
        let names = BTreeMap::from([
            ("1".to_string(), "Alice".to_string()),
            ("2".to_string(), "Bob".to_string()),
        ]);
        Recognizer::from_artifact(ModelArtifact::new(3, names, model))
    }

    #[test]
    fn test_verdict_boundaries() {
        let policy = ThresholdPolicy::default();
        assert_eq!(policy.verdict(150.0), Verdict::Unknown);
        assert_eq!(policy.verdict(100.0), Verdict::Unknown);
        assert_eq!(policy.verdict(99.9), Verdict::DisplayOnly);
        assert_eq!(policy.verdict(55.0), Verdict::DisplayOnly);
        assert_eq!(policy.verdict(54.9), Verdict::MarkEligible);
        assert_eq!(policy.verdict(30.0), Verdict::MarkEligible);
        assert_eq!(policy.verdict(0.0), Verdict::MarkEligible);
        assert_eq!(policy.verdict(f64::NAN), Verdict::Unknown);
    }

    #[test]
    fn test_policy_validation() {
        assert!(ThresholdPolicy::new(100.0, 55.0).is_ok());
        assert!(ThresholdPolicy::new(80.0, 80.0).is_ok());
        assert!(matches!(ThresholdPolicy::new(50.0, 60.0), Err(RecognizerError::InvalidPolicy(_))));
        assert!(matches!(ThresholdPolicy::new(0.0, 0.0), Err(RecognizerError::InvalidPolicy(_))));
        assert!(matches!(
            ThresholdPolicy::new(f64::INFINITY, 10.0),
            Err(RecognizerError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_load_missing_is_not_trained() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = Recognizer::load(&dir.path().join("model.json"));
        assert!(matches!(result, Err(RecognizerError::NotTrained(_))));
    }

    #[test]
    fn test_recognize_exact_sample_is_mark_eligible() {
        let rec = recognizer();
        let result = rec.recognize(&stripes(9), &ThresholdPolicy::default()).unwrap();
        assert_eq!(result.candidate.id, "2");
        assert_eq!(result.candidate.distance, 0.0);
        assert_eq!(result.verdict, Verdict::MarkEligible);
        assert_eq!(result.attendance_identity(), Some(("2", "Bob")));
    }

    #[test]
    fn test_unknown_hides_name() {
        let rec = recognizer();
        // A policy so strict that nothing but an exact match is recognized.
        let strict = ThresholdPolicy::new(1e-9, 1e-9).unwrap();
        let noisy = GrayImage::from_fn(100, 100, |x, y| image::Luma([((x * 7 + y * 13) % 256) as u8]));
        let result = rec.recognize(&noisy, &strict).unwrap();
        assert_eq!(result.verdict, Verdict::Unknown);
        assert_eq!(result.label(), "Unknown");
        assert!(result.attendance_identity().is_none());
    }

    #[test]
    fn test_display_only_not_attendance() {
        let rec = recognizer();
        let probe = stripes(5);
        let distance = rec.classify(&probe).unwrap().distance;
        assert!(distance > 0.0);

        // Thresholds straddling the observed distance.
        let policy = ThresholdPolicy::new(distance + 1.0, distance / 2.0).unwrap();
        let result = rec.recognize(&probe, &policy).unwrap();
        assert_eq!(result.verdict, Verdict::DisplayOnly);
        assert!(result.name.is_some());
        assert!(result.attendance_identity().is_none());
    }

    #[test]
    fn test_staleness_by_revision() {
        let rec = recognizer();
        assert_eq!(rec.revision(), 3);
        assert!(!rec.is_stale(3));
        assert!(rec.is_stale(4));
    }
}
