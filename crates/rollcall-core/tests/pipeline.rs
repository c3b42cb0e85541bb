//! End-to-end: enroll → train → recognize → attendance → edit.

use image::{GrayImage, Luma};
use rollcall_core::artifact::ModelArtifact;
use rollcall_core::attendance::AttendanceSession;
use rollcall_core::detector::{DetectorError, FaceDetector};
use rollcall_core::edit::EditSession;
use rollcall_core::enroll::{enroll, EnrollOptions, EnrollStop};
use rollcall_core::lbph::LbphParams;
use rollcall_core::live::run_recognition;
use rollcall_core::recognizer::{Recognizer, ThresholdPolicy, Verdict};
use rollcall_core::source::{CancelToken, Replay};
use rollcall_core::store::IdentityStore;
use rollcall_core::trainer::{train, TrainOutcome};
use rollcall_core::types::{FaceRegion, IdentityRecord};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tempfile::TempDir;

const FRAME_W: u32 = 160;
const FRAME_H: u32 = 120;
const FACE_X: u32 = 30;
const FACE_Y: u32 = 10;
const FACE: u32 = 100;

/// Always finds one face at the same place.
struct CentreDetector;

impl FaceDetector for CentreDetector {
    fn detect(&mut self, _frame: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
        Ok(vec![FaceRegion {
            x: FACE_X as f32,
            y: FACE_Y as f32,
            width: FACE as f32,
            height: FACE as f32,
            confidence: 0.95,
        }])
    }
}

fn alice(x: u32, y: u32) -> u8 {
    (((x / 10 + y / 10) % 3) * 80 + 20) as u8
}

fn bob(x: u32, y: u32) -> u8 {
    let (dx, dy) = (x as f32 - 50.0, y as f32 - 50.0);
    if ((dx * dx + dy * dy).sqrt() / 8.0) as u32 % 2 == 0 {
        40
    } else {
        200
    }
}

/// A frame with `face` in the detector's region over a frame-dependent background.
fn frame(face: fn(u32, u32) -> u8, seq: u32) -> GrayImage {
    GrayImage::from_fn(FRAME_W, FRAME_H, |x, y| {
        let inside = (FACE_X..FACE_X + FACE).contains(&x) && (FACE_Y..FACE_Y + FACE).contains(&y);
        if inside {
            Luma([face(x - FACE_X, y - FACE_Y)])
        } else {
            Luma([((x * 3 + y * 5 + seq * 11) % 97) as u8 + 60])
        }
    })
}

/// Same face under dimmer, flatter lighting: a strictly increasing intensity map.
fn held_out(face: fn(u32, u32) -> u8) -> GrayImage {
    let bright = frame(face, 999);
    GrayImage::from_fn(FRAME_W, FRAME_H, |x, y| Luma([bright.get_pixel(x, y).0[0] / 2 + 40]))
}

fn frames(face: fn(u32, u32) -> u8, n: u32) -> Replay<std::vec::IntoIter<GrayImage>> {
    Replay::new((0..n).map(|seq| frame(face, seq)).collect::<Vec<_>>())
}

struct Env {
    dir: TempDir,
    store: IdentityStore,
}

impl Env {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store =
            IdentityStore::open(&dir.path().join("identities.db"), &dir.path().join("samples"))
                .unwrap();
        Self { dir, store }
    }

    fn artifact(&self) -> PathBuf {
        self.dir.path().join("trainer").join("model.json")
    }

    fn enroll(&mut self, id: &str, name: &str, face: fn(u32, u32) -> u8, count: usize) {
        let report = enroll(
            &mut self.store,
            &mut frames(face, count as u32 + 5),
            &mut CentreDetector,
            id,
            name,
            &EnrollOptions {
                target_count: count,
                ..EnrollOptions::default()
            },
            &CancelToken::new(),
            |_, _| {},
        )
        .unwrap();
        assert_eq!(report.stop, EnrollStop::Completed);
    }

    fn train(&self) -> TrainOutcome {
        train(&self.store, &self.artifact(), LbphParams::default())
            .unwrap()
            .outcome
    }
}

#[test]
fn test_enroll_default_target_stores_hundred_samples() {
    let mut env = Env::new();
    let report = enroll(
        &mut env.store,
        &mut frames(alice, 120),
        &mut CentreDetector,
        "1",
        "Alice",
        &EnrollOptions::default(),
        &CancelToken::new(),
        |_, _| {},
    )
    .unwrap();

    assert_eq!(report.stored, 100);
    assert_eq!(env.store.list().unwrap(), vec![IdentityRecord::new("1", "Alice")]);
    assert_eq!(env.store.samples("1").unwrap().len(), 100);
}

#[test]
fn test_train_single_identity_names_table() {
    let mut env = Env::new();
    env.enroll("1", "Alice", alice, 10);

    assert!(matches!(env.train(), TrainOutcome::Trained { identities: 1, samples: 10, .. }));
    let artifact = ModelArtifact::load(&env.artifact()).unwrap().unwrap();
    assert_eq!(
        artifact.names,
        BTreeMap::from([("1".to_string(), "Alice".to_string())])
    );
}

#[test]
fn test_held_out_face_marks_attendance() {
    let mut env = Env::new();
    env.enroll("1", "Alice", alice, 10);
    env.train();

    let recognizer = Recognizer::load(&env.artifact()).unwrap();
    let probe = held_out(alice);
    let face = CentreDetector.detect(&probe).unwrap()[0].crop(&probe).unwrap();
    let result = recognizer.recognize(&face, &ThresholdPolicy::default()).unwrap();
    assert_eq!(result.verdict, Verdict::MarkEligible);

    let mut session = AttendanceSession::in_memory().unwrap();
    let (id, name) = result.attendance_identity().unwrap();
    session.mark_seen(id, name).unwrap();

    let snapshot = session.snapshot(&env.store).unwrap();
    assert_eq!(snapshot.present, vec![IdentityRecord::new("1", "Alice")]);
    assert!(snapshot.absent.is_empty());
}

#[test]
fn test_two_identities_classified_apart() {
    let mut env = Env::new();
    env.enroll("1", "Alice", alice, 6);
    env.enroll("2", "Bob", bob, 6);
    env.train();

    let recognizer = Recognizer::load(&env.artifact()).unwrap();
    for (face, id) in [(alice as fn(u32, u32) -> u8, "1"), (bob, "2")] {
        let probe = held_out(face);
        let crop = CentreDetector.detect(&probe).unwrap()[0].crop(&probe).unwrap();
        assert_eq!(recognizer.classify(&crop).unwrap().id, id);
    }
}

#[test]
fn test_repeated_sightings_one_attendance_row() {
    let mut env = Env::new();
    env.enroll("1", "Alice", alice, 8);
    env.enroll("2", "Bob", bob, 8);
    env.train();
    let recognizer = Recognizer::load(&env.artifact()).unwrap();
    let mut session = AttendanceSession::open(&env.dir.path().join("attendance.db")).unwrap();

    let report = run_recognition(
        &mut Replay::new(vec![held_out(alice), frame(alice, 3), held_out(alice)]),
        &mut CentreDetector,
        &recognizer,
        &ThresholdPolicy::default(),
        &mut session,
        &CancelToken::new(),
        |_| {},
    )
    .unwrap();

    assert_eq!(report.faces, 3);
    assert_eq!(report.marked, 1);
    let entries = session.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, "1");

    let snapshot = session.snapshot(&env.store).unwrap();
    assert_eq!(snapshot.present, vec![IdentityRecord::new("1", "Alice")]);
    assert_eq!(snapshot.absent, vec![IdentityRecord::new("2", "Bob")]);
}

#[test]
fn test_edit_undo_then_commit_makes_model_stale() {
    let mut env = Env::new();
    env.enroll("1", "Alice", alice, 4);
    env.enroll("2", "Bob", bob, 4);
    env.train();
    let recognizer = Recognizer::load(&env.artifact()).unwrap();
    assert!(!recognizer.is_stale(env.store.revision().unwrap()));

    let mut edit = EditSession::begin(&env.store).unwrap();
    edit.toggle_delete("1").unwrap();
    edit.rename("1", "Alicia").unwrap();
    edit.undo();
    assert!(edit.pending_renames().is_empty());
    assert!(edit.pending_deletions().contains("1"));
    edit.undo();
    assert!(edit.is_clean());

    edit.toggle_delete("1").unwrap();
    edit.rename("2", "Robert").unwrap();
    let report = edit.commit(&mut env.store);

    assert!(report.failures.is_empty());
    assert!(report.retrain_required);
    assert!(recognizer.is_stale(env.store.revision().unwrap()));
    assert_eq!(env.store.list().unwrap(), vec![IdentityRecord::new("2", "Robert")]);

    // Retraining picks up the new name and drops the deleted identity.
    env.train();
    let artifact = ModelArtifact::load(&env.artifact()).unwrap().unwrap();
    assert_eq!(
        artifact.names,
        BTreeMap::from([("2".to_string(), "Robert".to_string())])
    );
    assert_eq!(artifact.revision, env.store.revision().unwrap());
}
