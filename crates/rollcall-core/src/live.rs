//! Live recognition loop: detect, classify, mark attendance.

use crate::attendance::{AttendanceError, AttendanceSession, MarkOutcome};
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{Recognition, Recognizer, ThresholdPolicy};
use crate::source::{CancelToken, CaptureSource};
use crate::types::FaceRegion;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LiveError {
    #[error("capture device error: {0}")]
    Device(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("detector: {0}")]
    Detector(DetectorError),
    #[error("attendance: {0}")]
    Attendance(#[from] AttendanceError),
}

impl From<DetectorError> for LiveError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::ModelNotFound(path) => {
                LiveError::Configuration(format!("detector model not found: {path}"))
            }
            other => LiveError::Detector(other),
        }
    }
}

/// One classified face, for the control surface to render.
#[derive(Debug, Clone)]
pub struct RecognitionEvent {
    pub frame: usize,
    pub region: FaceRegion,
    pub recognition: Recognition,
    /// This sighting added the identity to the attendance record.
    pub newly_marked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveStop {
    Cancelled,
    SourceEnded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveReport {
    pub frames: usize,
    pub faces: usize,
    pub marked: usize,
    pub stop: LiveStop,
}

/// Run until `cancel` fires or the source ends, marking every
/// attendance-eligible recognition in `attendance`.
pub fn run_recognition<S, D, F>(
    source: &mut S,
    detector: &mut D,
    recognizer: &Recognizer,
    policy: &ThresholdPolicy,
    attendance: &mut AttendanceSession,
    cancel: &CancelToken,
    mut on_event: F,
) -> Result<LiveReport, LiveError>
where
    S: CaptureSource + ?Sized,
    D: FaceDetector + ?Sized,
    F: FnMut(&RecognitionEvent),
{
    tracing::info!(
        display = policy.display(),
        attendance = policy.attendance(),
        revision = recognizer.revision(),
        "recognition started"
    );

    let mut report = LiveReport {
        frames: 0,
        faces: 0,
        marked: 0,
        stop: LiveStop::SourceEnded,
    };

    report.stop = loop {
        if cancel.is_cancelled() {
            break LiveStop::Cancelled;
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break LiveStop::SourceEnded,
            Err(e) if report.frames == 0 => return Err(LiveError::Device(e.to_string())),
            Err(e) => {
                tracing::warn!(error = %e, frames = report.frames, "capture failed, ending recognition");
                break LiveStop::SourceEnded;
            }
        };
        report.frames += 1;

        let regions = match detector.detect(&frame) {
            Ok(regions) => regions,
            Err(e @ DetectorError::ModelNotFound(_)) => return Err(e.into()),
            Err(e) => {
                tracing::warn!(error = %e, frame = report.frames, "detection failed, skipping frame");
                continue;
            }
        };

        for region in regions {
            let Some(face) = region.crop(&frame) else {
                continue;
            };
            let Some(recognition) = recognizer.recognize(&face, policy) else {
                continue;
            };
            report.faces += 1;

            let newly_marked = match recognition.attendance_identity() {
                Some((id, name)) => attendance.mark_seen(id, name)? == MarkOutcome::Recorded,
                None => false,
            };
            if newly_marked {
                report.marked += 1;
            }

            tracing::debug!(
                frame = report.frames,
                id = %recognition.candidate.id,
                distance = recognition.candidate.distance,
                verdict = ?recognition.verdict,
                newly_marked,
                "face classified"
            );
            on_event(&RecognitionEvent {
                frame: report.frames,
                region,
                recognition,
                newly_marked,
            });
        }
    };

    tracing::info!(?report, "recognition finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ModelArtifact;
    use crate::lbph::{LbphModel, LbphParams};
    use crate::recognizer::Verdict;
    use crate::source::{CaptureError, Replay};
    use image::GrayImage;
    use std::collections::BTreeMap;

    /// Treats the whole frame as one face.
    struct WholeFrame;

    impl FaceDetector for WholeFrame {
        fn detect(&mut self, frame: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
            Ok(vec![FaceRegion {
                x: 0.0,
                y: 0.0,
                width: frame.width() as f32,
                height: frame.height() as f32,
                confidence: 1.0,
            }])
        }
    }

    /// Fails inference on the first call only.
    struct FlakyOnce {
        failed: bool,
    }

    impl FaceDetector for FlakyOnce {
        fn detect(&mut self, frame: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
            if !self.failed {
                self.failed = true;
                return Err(DetectorError::InferenceFailed("bad output tensor".into()));
            }
            WholeFrame.detect(frame)
        }
    }

    struct FailsAfter {
        frames: Vec<GrayImage>,
    }

    impl CaptureSource for FailsAfter {
        fn next_frame(&mut self) -> Result<Option<GrayImage>, CaptureError> {
            self.frames
                .pop()
                .map(Some)
                .ok_or_else(|| CaptureError::Failed("stream stalled".into()))
        }
    }

    fn stripes(period: u32) -> GrayImage {
        GrayImage::from_fn(100, 100, |x, _| {
            image::Luma([if (x / period) % 2 == 0 { 25 } else { 225 }])
        })
    }

    fn noise() -> GrayImage {
        GrayImage::from_fn(100, 100, |x, y| image::Luma([((x * 31 + y * 17 + x * y) % 256) as u8]))
    }

    fn recognizer() -> Recognizer {
        let mut model = LbphModel::new(LbphParams::default());
        model.add("1", &stripes(4));
        let names = BTreeMap::from([("1".to_string(), "Alice".to_string())]);
        Recognizer::from_artifact(ModelArtifact::new(1, names, model))
    }

    #[test]
    fn test_same_face_twice_marks_once() {
        let mut attendance = AttendanceSession::in_memory().unwrap();
        let mut events = Vec::new();

        let report = run_recognition(
            &mut Replay::new(vec![stripes(4), stripes(4)]),
            &mut WholeFrame,
            &recognizer(),
            &ThresholdPolicy::default(),
            &mut attendance,
            &CancelToken::new(),
            |e| events.push((e.recognition.verdict, e.newly_marked)),
        )
        .unwrap();

        assert_eq!(report.frames, 2);
        assert_eq!(report.marked, 1);
        assert_eq!(report.stop, LiveStop::SourceEnded);
        assert_eq!(
            events,
            vec![(Verdict::MarkEligible, true), (Verdict::MarkEligible, false)]
        );
        assert_eq!(attendance.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_unconfident_face_is_not_marked() {
        let mut attendance = AttendanceSession::in_memory().unwrap();
        let strict = ThresholdPolicy::new(1e-6, 1e-6).unwrap();
        let mut labels = Vec::new();

        run_recognition(
            &mut Replay::new(vec![noise()]),
            &mut WholeFrame,
            &recognizer(),
            &strict,
            &mut attendance,
            &CancelToken::new(),
            |e| labels.push(e.recognition.label().to_string()),
        )
        .unwrap();

        assert_eq!(labels, vec!["Unknown"]);
        assert!(attendance.entries().unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_before_first_frame() {
        let mut attendance = AttendanceSession::in_memory().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = run_recognition(
            &mut Replay::new(vec![stripes(4)]),
            &mut WholeFrame,
            &recognizer(),
            &ThresholdPolicy::default(),
            &mut attendance,
            &cancel,
            |_| {},
        )
        .unwrap();

        assert_eq!(report.stop, LiveStop::Cancelled);
        assert_eq!(report.frames, 0);
    }

    #[test]
    fn test_capture_failure_mid_stream_ends_loop() {
        let mut attendance = AttendanceSession::in_memory().unwrap();
        let report = run_recognition(
            &mut FailsAfter { frames: vec![stripes(4)] },
            &mut WholeFrame,
            &recognizer(),
            &ThresholdPolicy::default(),
            &mut attendance,
            &CancelToken::new(),
            |_| {},
        )
        .unwrap();
        assert_eq!(report.frames, 1);
        assert_eq!(report.stop, LiveStop::SourceEnded);

        let result = run_recognition(
            &mut FailsAfter { frames: vec![] },
            &mut WholeFrame,
            &recognizer(),
            &ThresholdPolicy::default(),
            &mut attendance,
            &CancelToken::new(),
            |_| {},
        );
        assert!(matches!(result, Err(LiveError::Device(_))));
    }

    #[test]
    fn test_inference_error_skips_frame() {
        let mut attendance = AttendanceSession::in_memory().unwrap();
        let report = run_recognition(
            &mut Replay::new(vec![stripes(4), stripes(4)]),
            &mut FlakyOnce { failed: false },
            &recognizer(),
            &ThresholdPolicy::default(),
            &mut attendance,
            &CancelToken::new(),
            |_| {},
        )
        .unwrap();

        assert_eq!(report.frames, 2);
        assert_eq!(report.faces, 1);
        assert_eq!(report.marked, 1);
        assert_eq!(report.stop, LiveStop::SourceEnded);
    }

    struct MissingModel;

    impl FaceDetector for MissingModel {
        fn detect(&mut self, _frame: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
            Err(DetectorError::ModelNotFound("scrfd.onnx".into()))
        }
    }

    #[test]
    fn test_missing_model_is_configuration_error() {
        let mut attendance = AttendanceSession::in_memory().unwrap();
        let result = run_recognition(
            &mut Replay::new(vec![stripes(4)]),
            &mut MissingModel,
            &recognizer(),
            &ThresholdPolicy::default(),
            &mut attendance,
            &CancelToken::new(),
            |_| {},
        );
        assert!(matches!(result, Err(LiveError::Configuration(_))));
    }
}
