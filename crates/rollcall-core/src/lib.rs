//! rollcall-core — Face enrollment, recognition and attendance engine.
//!
//! Faces are found with SCRFD (ONNX Runtime) and recognized with a pooled
//! LBPH nearest-neighbour model. Identities live in a SQLite-backed store;
//! attendance and identity edits are explicit session objects.

pub mod artifact;
pub mod attendance;
pub mod detector;
pub mod edit;
pub mod enroll;
pub mod lbph;
pub mod live;
pub mod recognizer;
pub mod source;
pub mod store;
pub mod trainer;
pub mod types;

pub use attendance::{AttendanceSession, AttendanceSnapshot};
pub use detector::{DetectionPolicy, FaceDetector, ScrfdDetector};
pub use edit::{CommitReport, EditSession};
pub use enroll::{enroll, EnrollOptions, EnrollReport};
pub use live::{run_recognition, LiveReport, RecognitionEvent};
pub use recognizer::{Recognizer, ThresholdPolicy, Verdict};
pub use source::{CancelToken, CaptureSource};
pub use store::IdentityStore;
pub use trainer::{train, TrainReport};
pub use types::{FaceRegion, IdentityRecord};
