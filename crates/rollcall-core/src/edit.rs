//! Identity edit session with strict LIFO undo.
//!
//! An [`EditSession`] only exists while editing: [`EditSession::begin`] enters
//! the editing state, and [`EditSession::commit`] or [`EditSession::cancel`]
//! consume the session and return to idle. Nothing touches the store until
//! commit.

use crate::store::{validate_identity, IdentityStore, StoreError};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EditError {
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// One reversible history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    /// `id` was marked for deletion.
    Mark(String),
    /// `id` was unmarked.
    Unmark(String),
    /// `id` was renamed; `previous` is the display value it had just before.
    Rename { id: String, previous: String },
}

/// Per-identity view for rendering the edit list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRow {
    pub id: String,
    pub display: String,
    pub pending_delete: bool,
    pub renamed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    Delete,
    Rename,
}

/// A pending edit that could not be applied. Collected, never raised.
#[derive(Debug, Clone)]
pub struct CommitFailure {
    pub id: String,
    pub action: CommitAction,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct CommitReport {
    pub deleted: Vec<String>,
    pub renamed: Vec<(String, String)>,
    pub failures: Vec<CommitFailure>,
    /// The store changed, so the trained artifact no longer matches it.
    pub retrain_required: bool,
}

pub struct EditSession {
    stored: BTreeMap<String, String>,
    order: Vec<String>,
    pending_deletions: BTreeSet<String>,
    pending_renames: BTreeMap<String, String>,
    history: Vec<EditOp>,
}

impl EditSession {
    /// Start editing against the store's current identities.
    pub fn begin(store: &IdentityStore) -> Result<Self, EditError> {
        let records = store.list()?;
        let order = records.iter().map(|r| r.id.clone()).collect();
        let stored = records.into_iter().map(|r| (r.id, r.name)).collect();
        Ok(Self {
            stored,
            order,
            pending_deletions: BTreeSet::new(),
            pending_renames: BTreeMap::new(),
            history: Vec::new(),
        })
    }

    fn require(&self, id: &str) -> Result<(), EditError> {
        if self.stored.contains_key(id) {
            Ok(())
        } else {
            Err(EditError::NotFound(id.to_string()))
        }
    }

    /// Flip the deletion mark on `id`. Returns whether it is now marked.
    pub fn toggle_delete(&mut self, id: &str) -> Result<bool, EditError> {
        self.require(id)?;
        if self.pending_deletions.remove(id) {
            self.history.push(EditOp::Unmark(id.to_string()));
            Ok(false)
        } else {
            self.pending_deletions.insert(id.to_string());
            self.history.push(EditOp::Mark(id.to_string()));
            Ok(true)
        }
    }

    /// Set a pending display name for `id`. Returns `false` when the name
    /// already matches the current display value and nothing was recorded.
    pub fn rename(&mut self, id: &str, new_name: &str) -> Result<bool, EditError> {
        self.require(id)?;
        validate_identity(id, new_name).map_err(|e| EditError::InvalidInput(e.to_string()))?;

        let previous = self.display_name(id).unwrap_or_default().to_string();
        if previous == new_name {
            return Ok(false);
        }

        self.set_pending_name(id, new_name.to_string());
        self.history.push(EditOp::Rename {
            id: id.to_string(),
            previous,
        });
        Ok(true)
    }

    /// Revert the most recent operation. `None` when there is nothing to undo.
    pub fn undo(&mut self) -> Option<EditOp> {
        let op = self.history.pop()?;
        match &op {
            EditOp::Mark(id) => {
                self.pending_deletions.remove(id);
            }
            EditOp::Unmark(id) => {
                self.pending_deletions.insert(id.clone());
            }
            EditOp::Rename { id, previous } => {
                self.set_pending_name(id, previous.clone());
            }
        }
        Some(op)
    }

    // A pending name equal to the stored one is "unchanged", not a rename.
    fn set_pending_name(&mut self, id: &str, name: String) {
        if self.stored.get(id) == Some(&name) {
            self.pending_renames.remove(id);
        } else {
            self.pending_renames.insert(id.to_string(), name);
        }
    }

    /// Pending name if any, otherwise the stored name.
    pub fn display_name(&self, id: &str) -> Option<&str> {
        self.pending_renames
            .get(id)
            .or_else(|| self.stored.get(id))
            .map(String::as_str)
    }

    pub fn rows(&self) -> Vec<EditRow> {
        self.order
            .iter()
            .map(|id| EditRow {
                id: id.clone(),
                display: self.display_name(id).unwrap_or_default().to_string(),
                pending_delete: self.pending_deletions.contains(id),
                renamed: self.pending_renames.contains_key(id),
            })
            .collect()
    }

    pub fn pending_deletions(&self) -> &BTreeSet<String> {
        &self.pending_deletions
    }

    pub fn pending_renames(&self) -> &BTreeMap<String, String> {
        &self.pending_renames
    }

    pub fn history(&self) -> &[EditOp] {
        &self.history
    }

    /// No pending deletions or renames.
    pub fn is_clean(&self) -> bool {
        self.pending_deletions.is_empty() && self.pending_renames.is_empty()
    }

    /// Discard every pending edit.
    pub fn cancel(self) {
        tracing::info!(
            deletions = self.pending_deletions.len(),
            renames = self.pending_renames.len(),
            "edit session cancelled"
        );
    }

    /// Apply pending edits best-effort, one identity at a time.
    ///
    /// Deletions run first and win over any rename of the same id. A failure
    /// on one id is recorded and the rest are still applied.
    pub fn commit(self, store: &mut IdentityStore) -> CommitReport {
        let mut report = CommitReport::default();

        for id in &self.pending_deletions {
            match store.delete_identity(id) {
                Ok(()) => report.deleted.push(id.clone()),
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "pending deletion failed");
                    report.failures.push(CommitFailure {
                        id: id.clone(),
                        action: CommitAction::Delete,
                        reason: e.to_string(),
                    });
                }
            }
        }

        for (id, name) in &self.pending_renames {
            if self.pending_deletions.contains(id) {
                continue;
            }
            match store.rename_identity(id, name) {
                Ok(()) => report.renamed.push((id.clone(), name.clone())),
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "pending rename failed");
                    report.failures.push(CommitFailure {
                        id: id.clone(),
                        action: CommitAction::Rename,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.retrain_required = !report.deleted.is_empty() || !report.renamed.is_empty();
        tracing::info!(
            deleted = report.deleted.len(),
            renamed = report.renamed.len(),
            failures = report.failures.len(),
            retrain_required = report.retrain_required,
            "edit session committed"
        );
        report
    }
}
