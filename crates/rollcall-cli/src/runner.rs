//! Wires the camera and detector into the core's blocking loops.

use crate::config::Config;
use anyhow::{Context, Result};
use image::GrayImage;
use rollcall_core::attendance::AttendanceSession;
use rollcall_core::detector::{DetectorError, ScrfdDetector};
use rollcall_core::enroll::{self, EnrollError, EnrollReport};
use rollcall_core::live::{self, LiveError, LiveReport, RecognitionEvent};
use rollcall_core::recognizer::{Recognizer, Verdict};
use rollcall_core::source::{CancelToken, CaptureError, CaptureSource};
use rollcall_core::store::IdentityStore;
use rollcall_hw::{Camera, CameraError, FrameStream};

/// Consecutive dark frames tolerated before the stream counts as failed.
const MAX_DARK_RUN: usize = 30;

/// [`CaptureSource`] over a live camera stream, skipping dark frames.
pub struct CameraSource<'a> {
    stream: FrameStream<'a>,
    dark_skipped: usize,
}

impl<'a> CameraSource<'a> {
    pub fn start(camera: &'a Camera, warmup_frames: usize) -> Result<Self, CameraError> {
        let mut stream = camera.stream()?;
        stream.warm_up(warmup_frames)?;
        Ok(Self {
            stream,
            dark_skipped: 0,
        })
    }
}

impl CaptureSource for CameraSource<'_> {
    fn next_frame(&mut self) -> Result<Option<GrayImage>, CaptureError> {
        let mut dark_run = 0usize;
        loop {
            let frame = self
                .stream
                .next_frame()
                .map_err(|e| CaptureError::Failed(e.to_string()))?;
            if !frame.is_dark {
                return frame
                    .into_gray_image()
                    .map(Some)
                    .map_err(|e| CaptureError::Failed(e.to_string()));
            }

            self.dark_skipped += 1;
            dark_run += 1;
            tracing::debug!(seq = frame.sequence, skipped = self.dark_skipped, "skipping dark frame");
            if dark_run >= MAX_DARK_RUN {
                return Err(CaptureError::Failed(format!(
                    "{dark_run} consecutive dark frames"
                )));
            }
        }
    }
}

fn open_store(config: &Config) -> Result<IdentityStore> {
    IdentityStore::open(&config.db_path(), &config.samples_dir()).context("opening identity store")
}

fn load_detector(config: &Config) -> Result<ScrfdDetector, DetectorError> {
    let detector = ScrfdDetector::load(&config.detector_model, config.detection_policy())?;
    tracing::info!(path = %config.detector_model.display(), "SCRFD detector loaded");
    Ok(detector)
}

fn open_camera(config: &Config) -> Result<Camera, CameraError> {
    let camera = Camera::open(&config.camera_device, config.camera_width, config.camera_height)?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        "camera opened"
    );
    Ok(camera)
}

/// Capture samples for `(id, name)` from the configured camera.
pub fn enroll(
    config: &Config,
    id: &str,
    name: &str,
    target_count: Option<usize>,
    cancel: &CancelToken,
) -> Result<EnrollReport> {
    let mut store = open_store(config)?;
    // Fail fast: detector, then camera, before any capture.
    let mut detector = load_detector(config).map_err(EnrollError::from)?;
    let camera = open_camera(config).map_err(|e| EnrollError::Device(e.to_string()))?;
    let mut source = CameraSource::start(&camera, config.warmup_frames)
        .map_err(|e| EnrollError::Device(e.to_string()))?;

    let options = config.enroll_options(target_count);
    let report = enroll::enroll(
        &mut store,
        &mut source,
        &mut detector,
        id,
        name,
        &options,
        cancel,
        |stored, target| {
            if stored % 10 == 0 || stored == target {
                println!("  {stored}/{target} samples");
            }
        },
    )?;
    Ok(report)
}

/// Recognize faces from the configured camera until cancelled.
pub fn attend(config: &Config, cancel: &CancelToken) -> Result<LiveReport> {
    let policy = config.threshold_policy()?;
    let recognizer = Recognizer::load(&config.artifact_path())?;

    let store = open_store(config)?;
    let revision = store.revision()?;
    if recognizer.is_stale(revision) {
        tracing::warn!(
            store_revision = revision,
            model_revision = recognizer.revision(),
            "identities changed since training; run `rollcall train`"
        );
    }
    drop(store);

    let mut attendance = AttendanceSession::open(&config.attendance_path())?;
    let mut detector = load_detector(config).map_err(LiveError::from)?;
    let camera = open_camera(config).map_err(|e| LiveError::Device(e.to_string()))?;
    let mut source = CameraSource::start(&camera, config.warmup_frames)
        .map_err(|e| LiveError::Device(e.to_string()))?;

    println!("Recognizing; press Ctrl-C to stop.");
    let report = live::run_recognition(
        &mut source,
        &mut detector,
        &recognizer,
        &policy,
        &mut attendance,
        cancel,
        print_event,
    )?;
    Ok(report)
}

fn print_event(event: &RecognitionEvent) {
    let rec = &event.recognition;
    match rec.verdict {
        Verdict::MarkEligible if event.newly_marked => {
            println!("  {} ({}) marked present", rec.label(), rec.candidate.id);
        }
        Verdict::Unknown => {
            tracing::debug!(distance = rec.candidate.distance, "unknown face");
        }
        _ => {
            tracing::debug!(
                name = rec.label(),
                distance = rec.candidate.distance,
                verdict = ?rec.verdict,
                "face recognized"
            );
        }
    }
}
