//! Storage adapters.
//!
//! An [`Adapter`] is the only thing in this crate that knows how to talk to
//! a concrete backend. Everything operation-shaped — precommit policy,
//! multipart validation, listing pagination, zombie sweeps — is written
//! once against the trait in `crate::objects`, `crate::segments`,
//! `crate::listing` and `crate::zombie`, the same way the teacher keeps
//! `GraphDB` (`db/core/graphdb.rs`) as the single place that touches pages
//! while query planning (`query/planner.rs`) stays backend-agnostic above
//! it.
//!
//! Three adapters are provided:
//! - [`postgres::PostgresAdapter`]: the SQL-relational backend, using
//!   ordinary interactive `sqlx` transactions.
//! - [`cockroach::CockroachAdapter`]: the distributed-transactional
//!   backend. CockroachDB speaks the Postgres wire protocol, so this reuses
//!   `sqlx::PgPool` as well; it differs from `PostgresAdapter` in its
//!   closure-scoped retry loop around serialization failures and in using
//!   delete-then-insert rather than in-place update to finalize a commit
//!   (spec §4.2, §9).
//! - [`memory::MemoryAdapter`]: an in-process test double with no backend
//!   dependency at all, used by this crate's own test suite.

pub mod cockroach;
pub mod memory;
pub mod postgres;
pub mod sql_common;

use crate::alias::AliasCache;
use crate::error::Result;
use crate::health::HealthCheck;
use crate::model::{Object, ObjectLocation, Retention, Segment, StreamId, Version};
use crate::precommit::{ExistingObjectSummary, PrecommitMode};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A freshly-begun pending object, as returned by `begin_object_next_version`
/// / `testing_begin_object_exact_version`.
#[derive(Debug, Clone)]
pub struct InsertPendingObjectRequest {
    /// Location the object is being created at.
    pub location: ObjectLocation,
    /// `None` asks the adapter to assign `highest_existing_version + 1`
    /// inside the same transaction as the existence check; `Some` pins an
    /// exact version (`TestingBeginObjectExactVersion`).
    pub exact_version: Option<Version>,
    /// Physical stream identity for the new object.
    pub stream_id: StreamId,
    /// Expiration timestamp, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Zombie-deletion deadline for this pending row.
    pub zombie_deletion_deadline: DateTime<Utc>,
    /// Requested retention, if any (rejected later if combined with
    /// `expires_at`; see `crate::objects::validate_expiration_and_lock`).
    pub retention: Retention,
    /// Legal hold flag.
    pub legal_hold: bool,
}

/// Decision from the precommit evaluator, handed to
/// [`Adapter::finalize_commit`] so the adapter applies exactly what was
/// decided without re-deriving it.
#[derive(Debug, Clone, Default)]
pub struct CommitDecision {
    /// Versions to delete as part of this commit (empty unless the commit
    /// is replacing an unversioned slot).
    pub deleted_versions: Vec<Version>,
}

/// Fields finalized on an object at commit time (spec §4.4 step 7).
#[derive(Debug, Clone)]
pub struct FinalizeCommitRequest {
    /// Location of the object being committed.
    pub location: ObjectLocation,
    /// Version of the pending row being committed.
    pub version: Version,
    /// Stream whose segments are being attached.
    pub stream_id: StreamId,
    /// Status to transition into (`CommittedUnversioned` or
    /// `CommittedVersioned`).
    pub new_status: crate::model::ObjectStatus,
    /// Segment count computed from the attached segments.
    pub segment_count: i32,
    /// Sum of segment plain sizes.
    pub total_plain_size: i64,
    /// Sum of segment encrypted sizes.
    pub total_encrypted_size: i64,
    /// Common plain size of all but the last segment, or -1 if variable.
    pub fixed_segment_size: i32,
    /// Encrypted user metadata supplied at commit time.
    pub encrypted_metadata: crate::model::EncryptedMetadata,
    /// Encryption parameters, if not already set on the pending row.
    pub encryption: Option<crate::model::EncryptionParameters>,
    /// What to delete alongside the in-place update, from precommit.
    pub decision: CommitDecision,
}

/// One ordered row as seen by the listing engine (spec §4.6). Deliberately
/// narrower than [`Object`]: listing only ever needs identity, status, and
/// the fields that feed `IsLatest`/delimiter collapsing.
#[derive(Debug, Clone)]
pub struct ListRow {
    /// Object key.
    pub object_key: crate::model::ObjectKey,
    /// Object version.
    pub version: Version,
    /// Object status.
    pub status: crate::model::ObjectStatus,
    /// Stream id, for callers that need to resolve full object metadata.
    pub stream_id: StreamId,
    /// Creation timestamp, used as a tiebreaker when `all_versions` is set.
    pub created_at: DateTime<Utc>,
}

/// Bounds and ordering for one raw page fetch used by the listing engine.
#[derive(Debug, Clone)]
pub struct ListPageRequest {
    /// Project being listed.
    pub project_id: crate::model::ProjectId,
    /// Bucket being listed.
    pub bucket_name: crate::model::BucketName,
    /// Restrict to keys with this prefix.
    pub prefix: Bytes,
    /// Exclusive lower bound on (key, version), descending within a key.
    pub cursor_key: Bytes,
    /// Exclusive lower bound on version, used only when resuming mid-key.
    pub cursor_version: Version,
    /// Maximum rows to fetch in this page.
    pub batch_size: usize,
    /// Whether to include every version or just the latest per key.
    pub all_versions: bool,
    /// Whether to include pending (uncommitted) objects.
    pub include_pending: bool,
}

/// Summary of a zombie-deletion sweep batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZombieSweepRequest {
    /// Only rows with `zombie_deletion_deadline <= as_of` are eligible.
    pub as_of: Option<DateTime<Utc>>,
    /// Maximum rows to delete in this call.
    pub batch_size: usize,
}

/// Storage backend used by [`crate::facade::Metabase`] for one project.
///
/// All methods are transactional: either a method's effects are fully
/// visible afterward or not visible at all, even under concurrent callers
/// (spec §5).
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Fetches every existing row at `location`, for precommit evaluation.
    async fn fetch_existing_at_location(
        &self,
        location: &ObjectLocation,
    ) -> Result<Vec<ExistingObjectSummary>>;

    /// Applies a precommit decision (if any rows must be deleted) and
    /// inserts a new pending object, in one transaction.
    async fn insert_pending_object(
        &self,
        req: InsertPendingObjectRequest,
        mode: PrecommitMode,
    ) -> Result<Object>;

    /// Fetches a pending object by stream id, if one exists.
    async fn fetch_pending_object(&self, stream_id: StreamId) -> Result<Option<Object>>;

    /// Inserts a single segment row.
    async fn insert_segment(&self, segment: Segment) -> Result<()>;

    /// Fetches one segment by (stream, position).
    async fn fetch_segment(
        &self,
        stream_id: StreamId,
        position: crate::model::Position,
    ) -> Result<Option<Segment>>;

    /// Fetches every segment belonging to a stream, ordered by position.
    async fn fetch_segments(&self, stream_id: StreamId) -> Result<Vec<Segment>>;

    /// Conditionally replaces a segment's piece-set, failing with
    /// `ValueChanged` if `expected` does not match the current contents.
    async fn update_segment_pieces(
        &self,
        stream_id: StreamId,
        position: crate::model::Position,
        expected: &crate::model::SegmentContents,
        new: crate::model::SegmentContents,
    ) -> Result<()>;

    /// Rewrites a single segment's `plain_offset`, used by `CommitObject` to
    /// renumber offsets as the running sum across the final segment order
    /// (spec §4.4 step 3).
    async fn rewrite_segment_offset(
        &self,
        stream_id: StreamId,
        position: crate::model::Position,
        plain_offset: i64,
    ) -> Result<()>;

    /// Transitions a pending object to committed, applying whatever
    /// precommit decided. Adapters differ here: the relational adapter
    /// updates the pending row in place; the distributed adapter deletes
    /// and re-inserts (spec §4.2, §9).
    async fn finalize_commit(&self, req: FinalizeCommitRequest) -> Result<Object>;

    /// Updates retention/legal-hold on a specific version.
    async fn set_retention(
        &self,
        location: &ObjectLocation,
        version: Version,
        retention: Retention,
        legal_hold: Option<bool>,
    ) -> Result<Object>;

    /// Fetches a single object, either the exact version or (if `version`
    /// is `None`) the current unversioned/last-committed row.
    async fn get_object(
        &self,
        location: &ObjectLocation,
        version: Option<Version>,
    ) -> Result<Option<Object>>;

    /// Fetches one ordered page of rows for the listing engine.
    async fn list_page(&self, req: ListPageRequest) -> Result<Vec<ListRow>>;

    /// Deletes up to `req.batch_size` expired pending objects (and their
    /// segments), returning how many were removed.
    async fn zombie_sweep(&self, req: ZombieSweepRequest) -> Result<usize>;

    /// Backend health snapshot.
    async fn health(&self) -> Result<HealthCheck>;

    /// This adapter's node-id alias cache.
    fn alias_cache(&self) -> &AliasCache;
}
