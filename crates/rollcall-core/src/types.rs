use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// An enrolled identity as listed by the store: stable id plus display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    pub name: String,
}

impl IdentityRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// An identity together with its samples in capture order.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub samples: Vec<SampleRef>,
}

impl Identity {
    /// An identity with no samples is valid but contributes nothing to training.
    pub fn is_trainable(&self) -> bool {
        !self.samples.is_empty()
    }
}

/// Reference to one stored face sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRef {
    /// Capture sequence number within the owning identity.
    pub seq: u32,
    pub path: PathBuf,
}

/// Physical storage handle for an identity's sample directory.
///
/// Independent of the display name, so a rename never touches the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for StorageKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A detected face rectangle in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl FaceRegion {
    /// Clamp the region to a `frame_width` × `frame_height` frame and round to
    /// whole pixels. Returns `(x, y, width, height)`, or `None` if nothing of
    /// the region lies inside the frame.
    pub fn pixel_rect(&self, frame_width: u32, frame_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor();
        let y0 = self.y.max(0.0).floor();
        let x1 = (self.x + self.width).min(frame_width as f32).ceil();
        let y1 = (self.y + self.height).min(frame_height as f32).ceil();

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }

    /// Crop this region out of a grayscale frame.
    pub fn crop(&self, frame: &image::GrayImage) -> Option<image::GrayImage> {
        let (x, y, w, h) = self.pixel_rect(frame.width(), frame.height())?;
        Some(image::imageops::crop_imm(frame, x, y, w, h).to_image())
    }
}
