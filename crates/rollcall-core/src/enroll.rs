//! Sample enrollment: capture frames, detect faces, store every crop.

use crate::detector::{DetectorError, FaceDetector};
use crate::source::{CancelToken, CaptureSource};
use crate::store::{validate_identity, IdentityStore, StoreError};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TARGET_COUNT: usize = 100;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("identity conflict: {0}")]
    Conflict(String),
    #[error("capture device error: {0}")]
    Device(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("detector: {0}")]
    Detector(DetectorError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl From<DetectorError> for EnrollError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::ModelNotFound(path) => {
                EnrollError::Configuration(format!("detector model not found: {path}"))
            }
            other => EnrollError::Detector(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrollOptions {
    /// Samples to store in this run.
    pub target_count: usize,
    /// Pause after each stored sample so consecutive crops differ in pose.
    pub sample_interval: Duration,
}

impl Default for EnrollOptions {
    fn default() -> Self {
        Self {
            target_count: DEFAULT_TARGET_COUNT,
            sample_interval: Duration::ZERO,
        }
    }
}

/// Why the capture loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollStop {
    Completed,
    Cancelled,
    SourceEnded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollReport {
    pub id: String,
    pub stored: usize,
    pub frames: usize,
    pub stop: EnrollStop,
}

/// Capture samples for `(id, name)` until `options.target_count` have been
/// stored, the source ends, or `cancel` fires.
///
/// The identity is created on the first frame if it does not exist yet.
/// Samples stored before a cancel or source failure stay in place, so a later
/// run simply adds to them. `on_progress` receives `(stored, target)` after
/// every stored sample.
#[allow(clippy::too_many_arguments)]
pub fn enroll<S, D, F>(
    store: &mut IdentityStore,
    source: &mut S,
    detector: &mut D,
    id: &str,
    name: &str,
    options: &EnrollOptions,
    cancel: &CancelToken,
    mut on_progress: F,
) -> Result<EnrollReport, EnrollError>
where
    S: CaptureSource + ?Sized,
    D: FaceDetector + ?Sized,
    F: FnMut(usize, usize),
{
    validate_identity(id, name).map_err(|e| EnrollError::InvalidInput(e.to_string()))?;
    let target = options.target_count;
    if target == 0 {
        return Err(EnrollError::InvalidInput("target count must be at least 1".into()));
    }
    if let Some(existing) = store.get(id)? {
        if existing.name != name {
            return Err(EnrollError::Conflict(format!(
                "{id} is enrolled as {:?}, not {name:?}",
                existing.name
            )));
        }
    }

    tracing::info!(id, name, target, "enrollment started");

    let mut stored = 0usize;
    let mut frames = 0usize;
    let stop = loop {
        if cancel.is_cancelled() {
            break EnrollStop::Cancelled;
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break EnrollStop::SourceEnded,
            Err(e) if frames == 0 => return Err(EnrollError::Device(e.to_string())),
            Err(e) => {
                tracing::warn!(error = %e, frames, "capture failed, ending enrollment");
                break EnrollStop::SourceEnded;
            }
        };
        if frames == 0 {
            store.ensure_identity(id, name)?;
        }
        frames += 1;

        let regions = detector.detect(&frame)?;
        tracing::debug!(frame = frames, faces = regions.len(), "frame processed");

        for region in regions {
            let Some(face) = region.crop(&frame) else {
                continue;
            };
            store.add_sample(id, &face)?;
            stored += 1;
            on_progress(stored, target);

            if stored == target {
                break;
            }
            if !options.sample_interval.is_zero() {
                std::thread::sleep(options.sample_interval);
            }
        }

        if stored == target {
            break EnrollStop::Completed;
        }
    };

    tracing::info!(id, stored, frames, ?stop, "enrollment finished");
    Ok(EnrollReport {
        id: id.to_string(),
        stored,
        frames,
        stop,
    })
}
