//! Precommit constraint evaluation.
//!
//! Every `CommitObject` / `CommitInlineObject` call first asks: given what
//! already exists at this (project, bucket, key), what happens to it? The
//! four policies below are pure decisions over a small summary of the
//! existing rows at a location; adapters are responsible for fetching that
//! summary (inside the same transaction as the eventual write) and for
//! applying whatever deletions this evaluator decides on.
//!
//! Keeping this logic adapter-independent mirrors the teacher's query
//! planner pulling cost decisions out of the executor (`query/planner.rs`):
//! the policy is decided once, here, and both the SQL-relational and
//! distributed-transactional adapters apply the same decision.

use crate::error::{MetabaseError, Result};
use crate::model::{ObjectStatus, Retention, Version};
use chrono::{DateTime, Utc};

/// Minimal view of an existing object row at a location, as seen by the
/// precommit evaluator. Adapters fetch this inside the commit transaction.
#[derive(Debug, Clone)]
pub struct ExistingObjectSummary {
    /// The object's version.
    pub version: Version,
    /// The object's current status.
    pub status: ObjectStatus,
    /// Number of segments already committed under this version (0 for
    /// pending or delete-marker rows).
    pub segment_count: i32,
    /// Retention configuration.
    pub retention: Retention,
    /// Legal hold flag.
    pub legal_hold: bool,
    /// Deadline past which a pending row is a zombie, `None` for
    /// already-committed/delete-marker rows.
    pub zombie_deletion_deadline: Option<DateTime<Utc>>,
}

impl ExistingObjectSummary {
    /// True for a pending row whose zombie deadline has already passed
    /// (spec §4.3 step 3, "expired pending objects ... are removed
    /// silently"): such a row must not block a new commit, occupy a
    /// version slot, or be picked as an unversioned victim.
    fn is_expired_zombie(&self, now: DateTime<Utc>) -> bool {
        self.status == ObjectStatus::Pending
            && self
                .zombie_deletion_deadline
                .map(|deadline| deadline <= now)
                .unwrap_or(false)
    }
}

impl ExistingObjectSummary {
    fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.legal_hold || self.retention.is_active(now)
    }
}

/// Overwrite policy requested by the caller committing a new version
/// (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecommitMode {
    /// Fail if any committed object already exists at this location.
    CheckExistence,
    /// Keep every existing version; never delete anything.
    Versioned,
    /// Replace whatever unversioned row (committed or delete-marker)
    /// currently occupies this location.
    Unversioned,
    /// Behave like `Unversioned` but fail instead of deleting if doing so
    /// would remove existing rows.
    DisallowDelete,
}

/// Outcome of evaluating a [`PrecommitMode`] against the rows that exist at
/// a location.
#[derive(Debug, Clone, Default)]
pub struct PrecommitConstraintResult {
    /// Highest version number seen among existing rows, or `0` if none
    /// exist. Callers assigning the next version use `highest_version + 1`.
    pub highest_version: Version,
    /// Versions that the caller must delete (object and segment rows) as
    /// part of this commit.
    pub deleted_versions: Vec<Version>,
    /// Total segment rows removed across `deleted_versions`, for metrics.
    pub deleted_segment_count: usize,
}

/// Evaluates precommit policy over the existing rows at an object location.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrecommitConstraintEvaluator;

impl PrecommitConstraintEvaluator {
    /// Creates an evaluator. Stateless; a unit struct so call sites read the
    /// same way whether or not the evaluator later grows configuration.
    pub fn new() -> Self {
        Self
    }

    /// Decides what a commit under `mode` must do given the rows currently
    /// at the target location, as of `now`.
    pub fn evaluate(
        &self,
        now: DateTime<Utc>,
        mode: PrecommitMode,
        existing: &[ExistingObjectSummary],
    ) -> Result<PrecommitConstraintResult> {
        let live: Vec<&ExistingObjectSummary> = existing
            .iter()
            .filter(|o| !o.is_expired_zombie(now))
            .collect();
        let highest_version = live.iter().map(|o| o.version).max().unwrap_or(0);

        match mode {
            PrecommitMode::CheckExistence => {
                if live.iter().any(|o| o.status.is_committed()) {
                    return Err(MetabaseError::Conflict);
                }
                Ok(PrecommitConstraintResult {
                    highest_version,
                    ..Default::default()
                })
            }

            PrecommitMode::Versioned => Ok(PrecommitConstraintResult {
                highest_version,
                ..Default::default()
            }),

            PrecommitMode::Unversioned => {
                let to_delete = self.unversioned_victim(now, &live)?;
                let deleted_segment_count =
                    to_delete.as_ref().map(|o| o.segment_count as usize).unwrap_or(0);
                Ok(PrecommitConstraintResult {
                    highest_version,
                    deleted_versions: to_delete.map(|o| o.version).into_iter().collect(),
                    deleted_segment_count,
                })
            }

            PrecommitMode::DisallowDelete => {
                let to_delete = self.unversioned_victim(now, &live)?;
                if let Some(victim) = to_delete {
                    return Err(MetabaseError::PreconditionFailed {
                        would_delete: 1 + victim.segment_count.max(0) as usize,
                    });
                }
                Ok(PrecommitConstraintResult {
                    highest_version,
                    ..Default::default()
                })
            }
        }
    }

    /// Finds the single unversioned row (if any) that an `Unversioned`-mode
    /// commit would replace, failing if it is locked.
    fn unversioned_victim<'a>(
        &self,
        now: DateTime<Utc>,
        existing: &[&'a ExistingObjectSummary],
    ) -> Result<Option<&'a ExistingObjectSummary>> {
        let victim = existing.iter().find(|o| o.status.is_unversioned()).copied();
        if let Some(victim) = victim {
            if victim.is_locked(now) {
                return Err(MetabaseError::ObjectLock(
                    "existing unversioned object is under retention or legal hold".into(),
                ));
            }
        }
        Ok(victim)
    }
}
