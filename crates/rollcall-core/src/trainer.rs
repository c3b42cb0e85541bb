//! Model training: pool every sample of every identity into one LBPH model.

use crate::artifact::{ArtifactError, ModelArtifact};
use crate::lbph::{LbphModel, LbphParams};
use crate::store::{IdentityStore, StoreError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("artifact: {0}")]
    Artifact(#[from] ArtifactError),
}

/// A sample that could not be read and was left out of training.
#[derive(Debug, Clone)]
pub struct SkippedSample {
    pub id: String,
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainOutcome {
    /// A new artifact was written.
    Trained {
        identities: usize,
        samples: usize,
        revision: u64,
    },
    /// Nothing trainable; any previous artifact was left untouched.
    NoSamples,
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub outcome: TrainOutcome,
    pub skipped: Vec<SkippedSample>,
}

impl TrainReport {
    pub fn is_noop(&self) -> bool {
        self.outcome == TrainOutcome::NoSamples
    }
}

/// Train one model over every readable sample in the store and replace the
/// artifact at `artifact_path`.
///
/// The store is read through a single snapshot, so the artifact reflects
/// exactly one store revision. Identities whose samples are all unreadable
/// (or who have none) are left out of the names table.
pub fn train(
    store: &IdentityStore,
    artifact_path: &Path,
    params: LbphParams,
) -> Result<TrainReport, TrainError> {
    let snapshot = store.snapshot()?;
    tracing::info!(
        revision = snapshot.revision,
        identities = snapshot.identities.len(),
        samples = snapshot.sample_count(),
        "training started"
    );

    let mut model = LbphModel::new(params);
    let mut names = BTreeMap::new();
    let mut skipped = Vec::new();

    for identity in &snapshot.identities {
        let mut used = 0usize;
        for sample in &identity.samples {
            match image::open(&sample.path) {
                Ok(img) => {
                    model.add(&identity.id, &img.to_luma8());
                    used += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        id = %identity.id,
                        path = %sample.path.display(),
                        error = %e,
                        "skipping unreadable sample"
                    );
                    skipped.push(SkippedSample {
                        id: identity.id.clone(),
                        path: sample.path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        if used > 0 {
            names.insert(identity.id.clone(), identity.name.clone());
        }
    }

    if model.is_empty() {
        tracing::info!(skipped = skipped.len(), "no trainable samples; artifact left untouched");
        return Ok(TrainReport {
            outcome: TrainOutcome::NoSamples,
            skipped,
        });
    }

    let outcome = TrainOutcome::Trained {
        identities: names.len(),
        samples: model.len(),
        revision: snapshot.revision,
    };
    ModelArtifact::new(snapshot.revision, names, model).write_atomic(artifact_path)?;

    tracing::info!(
        ?outcome,
        skipped = skipped.len(),
        path = %artifact_path.display(),
        "training finished"
    );
    Ok(TrainReport { outcome, skipped })
}
