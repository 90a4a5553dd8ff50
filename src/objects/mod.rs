//! Object lifecycle operations (spec §4.4).
//!
//! Functions here are generic over `&dyn Adapter`: all backend-specific
//! work happens inside the adapter, everything else — multipart
//! validation, fixed-segment-size inference, precommit wiring — is written
//! once. This mirrors how the teacher keeps traversal algorithms
//! (`db/core/traversal.rs`) generic over `GraphDB` rather than duplicating
//! them per storage engine.

pub mod retention;

use crate::adapter::{
    Adapter, CommitDecision, FinalizeCommitRequest, InsertPendingObjectRequest,
};
use crate::config::Config;
use crate::error::{MetabaseError, Result};
use crate::model::{
    EncryptedMetadata, EncryptionParameters, Object, ObjectLocation, ObjectStatus, Retention,
    Segment, SegmentContents, StreamId, Version,
};
use crate::precommit::PrecommitMode;
use chrono::{DateTime, Utc};
use tracing::instrument;

/// Request to begin a new object at the next available version.
#[derive(Debug, Clone)]
pub struct BeginObjectNextVersionRequest {
    /// Location to create the object at.
    pub location: ObjectLocation,
    /// Expiration timestamp, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Requested retention. Rejected if combined with `expires_at`.
    pub retention: Retention,
    /// Legal hold flag. Rejected if combined with `expires_at`.
    pub legal_hold: bool,
}

fn validate_expiration_and_lock(
    expires_at: Option<DateTime<Utc>>,
    retention: Retention,
    legal_hold: bool,
) -> Result<()> {
    let locked = legal_hold || !matches!(retention.mode, crate::model::RetentionMode::None);
    if expires_at.is_some() && locked {
        return Err(MetabaseError::ObjectExpiration);
    }
    Ok(())
}

/// Creates a pending object, assigning it `stream_id` and the next version
/// at this location (spec §4.4, "BeginObjectNextVersion").
#[instrument(skip(adapter, config))]
pub async fn begin_object_next_version(
    adapter: &dyn Adapter,
    config: &Config,
    req: BeginObjectNextVersionRequest,
) -> Result<Object> {
    validate_expiration_and_lock(req.expires_at, req.retention, req.legal_hold)?;

    let insert = InsertPendingObjectRequest {
        location: req.location,
        exact_version: None,
        stream_id: StreamId::new_random(),
        expires_at: req.expires_at,
        zombie_deletion_deadline: Utc::now()
            + chrono::Duration::from_std(config.default_zombie_deadline)
                .map_err(|e| MetabaseError::Internal(e.to_string()))?,
        retention: req.retention,
        legal_hold: req.legal_hold,
    };

    adapter
        .insert_pending_object(insert, PrecommitMode::Versioned)
        .await
}

/// Request to begin a pending object at a caller-chosen exact version.
///
/// Test-only entry point (spec §10): production callers always go through
/// `begin_object_next_version`, which is the only way version assignment
/// stays race-free under concurrent writers. This exists so test fixtures
/// can set up specific version layouts without racing real traffic.
#[derive(Debug, Clone)]
pub struct TestingBeginObjectExactVersionRequest {
    /// Location to create the object at.
    pub location: ObjectLocation,
    /// Exact version to assign. Fails with `ObjectAlreadyExists` if taken.
    pub version: Version,
    /// Expiration timestamp, if any.
    pub expires_at: Option<DateTime<Utc>>,
}

/// See [`TestingBeginObjectExactVersionRequest`].
#[instrument(skip(adapter, config))]
pub async fn testing_begin_object_exact_version(
    adapter: &dyn Adapter,
    config: &Config,
    req: TestingBeginObjectExactVersionRequest,
) -> Result<Object> {
    let insert = InsertPendingObjectRequest {
        location: req.location,
        exact_version: Some(req.version),
        stream_id: StreamId::new_random(),
        expires_at: req.expires_at,
        zombie_deletion_deadline: Utc::now()
            + chrono::Duration::from_std(config.default_zombie_deadline)
                .map_err(|e| MetabaseError::Internal(e.to_string()))?,
        retention: Retention::none(),
        legal_hold: false,
    };

    adapter
        .insert_pending_object(insert, PrecommitMode::Versioned)
        .await
}

/// How a commit should treat whatever else currently occupies this
/// location (spec §4.3/§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOverwrite {
    /// Fail with `Conflict` if any committed row already exists here
    /// (`IfNoneMatch: *`).
    CheckExistence,
    /// Keep every other version untouched.
    Versioned,
    /// Replace the current unversioned row, if any.
    Unversioned,
    /// Like `Unversioned`, but fail rather than delete.
    DisallowDelete,
}

impl From<CommitOverwrite> for PrecommitMode {
    fn from(value: CommitOverwrite) -> Self {
        match value {
            CommitOverwrite::CheckExistence => PrecommitMode::CheckExistence,
            CommitOverwrite::Versioned => PrecommitMode::Versioned,
            CommitOverwrite::Unversioned => PrecommitMode::Unversioned,
            CommitOverwrite::DisallowDelete => PrecommitMode::DisallowDelete,
        }
    }
}

/// Request to commit a pending object once all its segments are in place.
#[derive(Debug, Clone)]
pub struct CommitObjectRequest {
    /// Location of the pending object.
    pub location: ObjectLocation,
    /// Version of the pending object.
    pub version: Version,
    /// Overwrite policy to apply at this location.
    pub overwrite: CommitOverwrite,
    /// Encrypted user metadata to attach.
    pub encrypted_metadata: EncryptedMetadata,
    /// Encryption parameters, if not already set when the object was
    /// begun.
    pub encryption: Option<EncryptionParameters>,
}

/// A segment whose `plain_offset` must be rewritten to the renumbered
/// running sum computed by `validate_and_summarize`.
struct OffsetRewrite {
    position: crate::model::Position,
    plain_offset: i64,
}

/// Validates that a stream's segments form a contiguous, correctly-ordered
/// multipart layout, renumbers each segment's `plain_offset` to the running
/// sum across the final position order, and derives `(segment_count,
/// total_plain_size, total_encrypted_size, fixed_segment_size, rewrites)`
/// (spec §4.4 step 3 and step 6). `rewrites` holds only the segments whose
/// stored offset disagreed with the recomputed one.
fn validate_and_summarize(
    segments: &[Segment],
    max_parts: u32,
) -> Result<(i32, i64, i64, i32, Vec<OffsetRewrite>)> {
    if segments.is_empty() {
        return Err(MetabaseError::InvalidRequest(
            "cannot commit an object with no segments".into(),
        ));
    }

    let max_part = segments.iter().map(|s| s.position.part).max().unwrap_or(0);
    if max_part >= max_parts {
        return Err(MetabaseError::InvalidRequest(format!(
            "part {max_part} exceeds maximum of {max_parts} parts"
        )));
    }

    let mut ordered = segments.to_vec();
    ordered.sort_by_key(|s| s.position);

    let mut expected_offset: i64 = 0;
    let mut total_plain_size: i64 = 0;
    let mut total_encrypted_size: i64 = 0;
    let mut common_plain_size: Option<i32> = None;
    let mut fixed = true;
    let mut rewrites = Vec::new();

    for (i, segment) in ordered.iter().enumerate() {
        if segment.plain_offset != expected_offset {
            rewrites.push(OffsetRewrite {
                position: segment.position,
                plain_offset: expected_offset,
            });
        }
        expected_offset += segment.plain_size as i64;
        total_plain_size += segment.plain_size as i64;
        total_encrypted_size += segment.encrypted_size as i64;

        let is_last = i == ordered.len() - 1;
        if !is_last {
            match common_plain_size {
                None => common_plain_size = Some(segment.plain_size),
                Some(size) if size != segment.plain_size => fixed = false,
                _ => {}
            }
        }
    }

    let fixed_segment_size = if fixed {
        common_plain_size.unwrap_or(ordered[0].plain_size)
    } else {
        -1
    };

    Ok((
        ordered.len() as i32,
        total_plain_size,
        total_encrypted_size,
        fixed_segment_size,
        rewrites,
    ))
}

/// Commits a pending object: validates its segments, resolves the
/// overwrite policy against whatever else exists at this location, and
/// transitions it to a committed status (spec §4.4, "CommitObject").
#[instrument(skip(adapter, config, req), fields(version = req.version))]
pub async fn commit_object(
    adapter: &dyn Adapter,
    config: &Config,
    req: CommitObjectRequest,
) -> Result<(Object, usize)> {
    let pending = adapter
        .get_object(&req.location, Some(req.version))
        .await?
        .ok_or(MetabaseError::PendingObjectMissing)?;

    if pending.status != ObjectStatus::Pending {
        return Err(MetabaseError::ObjectStatus {
            found: format!("{:?}", pending.status),
        });
    }

    let segments = adapter.fetch_segments(pending.stream_id).await?;
    let (segment_count, total_plain_size, total_encrypted_size, fixed_segment_size, rewrites) =
        validate_and_summarize(&segments, config.max_parts)?;
    for rewrite in rewrites {
        adapter
            .rewrite_segment_offset(pending.stream_id, rewrite.position, rewrite.plain_offset)
            .await?;
    }

    let existing = adapter.fetch_existing_at_location(&req.location).await?;
    let existing_other: Vec<_> = existing
        .into_iter()
        .filter(|o| o.version != req.version)
        .collect();
    let decision = crate::precommit::PrecommitConstraintEvaluator::new().evaluate(
        Utc::now(),
        req.overwrite.into(),
        &existing_other,
    )?;
    let deleted_segment_count = decision.deleted_segment_count;

    let new_status = if req.overwrite == CommitOverwrite::Versioned {
        ObjectStatus::CommittedVersioned
    } else {
        ObjectStatus::CommittedUnversioned
    };

    let object = adapter
        .finalize_commit(FinalizeCommitRequest {
            location: req.location,
            version: req.version,
            stream_id: pending.stream_id,
            new_status,
            segment_count,
            total_plain_size,
            total_encrypted_size,
            fixed_segment_size,
            encrypted_metadata: req.encrypted_metadata,
            encryption: req.encryption,
            decision: CommitDecision {
                deleted_versions: decision.deleted_versions,
            },
        })
        .await?;

    Ok((object, deleted_segment_count))
}

/// Request to commit an object whose entire content fits in a single
/// inline segment, skipping the separate begin/commit-segment round trip
/// (spec §4.4, "CommitInlineObject").
#[derive(Debug, Clone)]
pub struct CommitInlineObjectRequest {
    /// Location to create the object at.
    pub location: ObjectLocation,
    /// Overwrite policy to apply at this location.
    pub overwrite: CommitOverwrite,
    /// Expiration timestamp, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Encrypted user metadata to attach.
    pub encrypted_metadata: EncryptedMetadata,
    /// Encryption parameters for the object and its single segment.
    pub encryption: EncryptionParameters,
    /// The inline segment's encrypted key and nonce.
    pub encrypted_key: bytes::Bytes,
    /// Nonce for `encrypted_key`.
    pub encrypted_key_nonce: bytes::Bytes,
    /// Encrypted segment contents.
    pub data: bytes::Bytes,
    /// Plaintext size of `data` before encryption padding, if different.
    pub plain_size: i32,
    /// Encrypted ETag of the segment.
    pub encrypted_etag: Option<bytes::Bytes>,
}

/// Creates and immediately commits an object with one inline segment.
#[instrument(skip(adapter, config, req))]
pub async fn commit_inline_object(
    adapter: &dyn Adapter,
    config: &Config,
    req: CommitInlineObjectRequest,
) -> Result<(Object, usize)> {
    let pending = begin_object_next_version(
        adapter,
        config,
        BeginObjectNextVersionRequest {
            location: req.location.clone(),
            expires_at: req.expires_at,
            retention: Retention::none(),
            legal_hold: false,
        },
    )
    .await?;

    let segment = Segment {
        stream_id: pending.stream_id,
        position: crate::model::Position { part: 0, index: 0 },
        expires_at: req.expires_at,
        encrypted_key: req.encrypted_key,
        encrypted_key_nonce: req.encrypted_key_nonce,
        encrypted_size: req.data.len() as i32,
        plain_size: req.plain_size,
        plain_offset: 0,
        encrypted_etag: req.encrypted_etag,
        redundancy: crate::model::RedundancyScheme {
            algorithm: 0,
            share_size: 0,
            required_shares: 0,
            repair_shares: 0,
            optimal_shares: 0,
            total_shares: 0,
        },
        contents: SegmentContents::Inline { data: req.data },
        placement: None,
        repaired_at: None,
    };
    adapter.insert_segment(segment).await?;

    commit_object(
        adapter,
        config,
        CommitObjectRequest {
            location: req.location,
            version: pending.version,
            overwrite: req.overwrite,
            encrypted_metadata: req.encrypted_metadata,
            encryption: Some(req.encryption),
        },
    )
    .await
}

/// Request to place a delete marker at a location (spec §3, "destroyed by
/// ... delete-marker placement"): a tombstone row carrying no segments,
/// assigned the next version the same way a real commit would be.
#[derive(Debug, Clone)]
pub struct DeleteObjectRequest {
    /// Location to place the delete marker at.
    pub location: ObjectLocation,
    /// Overwrite policy to apply at this location.
    pub overwrite: CommitOverwrite,
}

/// Places a delete-marker row, hiding everything beneath it from
/// non-versioned listings without removing the prior rows themselves
/// (spec §4.5, "Delete markers are consumed ... but are not emitted").
#[instrument(skip(adapter, config, req))]
pub async fn delete_object(
    adapter: &dyn Adapter,
    config: &Config,
    req: DeleteObjectRequest,
) -> Result<Object> {
    let pending = begin_object_next_version(
        adapter,
        config,
        BeginObjectNextVersionRequest {
            location: req.location.clone(),
            expires_at: None,
            retention: Retention::none(),
            legal_hold: false,
        },
    )
    .await?;

    let existing = adapter.fetch_existing_at_location(&req.location).await?;
    let existing_other: Vec<_> = existing
        .into_iter()
        .filter(|o| o.version != pending.version)
        .collect();
    let decision = crate::precommit::PrecommitConstraintEvaluator::new().evaluate(
        Utc::now(),
        req.overwrite.into(),
        &existing_other,
    )?;

    let new_status = if req.overwrite == CommitOverwrite::Versioned {
        ObjectStatus::DeleteMarkerVersioned
    } else {
        ObjectStatus::DeleteMarkerUnversioned
    };

    adapter
        .finalize_commit(FinalizeCommitRequest {
            location: req.location,
            version: pending.version,
            stream_id: pending.stream_id,
            new_status,
            segment_count: 0,
            total_plain_size: 0,
            total_encrypted_size: 0,
            fixed_segment_size: -1,
            encrypted_metadata: EncryptedMetadata::default(),
            encryption: None,
            decision: CommitDecision {
                deleted_versions: decision.deleted_versions,
            },
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::MemoryAdapter;
    use crate::model::{BucketName, ObjectKey, ProjectId};
    use uuid::Uuid;

    fn loc() -> ObjectLocation {
        ObjectLocation {
            project_id: ProjectId(Uuid::new_v4()),
            bucket_name: BucketName("bucket".into()),
            object_key: ObjectKey::from("object.bin"),
        }
    }

    #[tokio::test]
    async fn begin_rejects_expiration_with_legal_hold() {
        let adapter = MemoryAdapter::new();
        let config = Config::default();
        let req = BeginObjectNextVersionRequest {
            location: loc(),
            expires_at: Some(Utc::now()),
            retention: Retention::none(),
            legal_hold: true,
        };
        let err = begin_object_next_version(&adapter, &config, req)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ObjectExpiration);
    }

    #[tokio::test]
    async fn commit_object_computes_fixed_segment_size() {
        let adapter = MemoryAdapter::new();
        let config = Config::default();
        let location = loc();

        let pending = begin_object_next_version(
            &adapter,
            &config,
            BeginObjectNextVersionRequest {
                location: location.clone(),
                expires_at: None,
                retention: Retention::none(),
                legal_hold: false,
            },
        )
        .await
        .unwrap();

        for i in 0..3u32 {
            adapter
                .insert_segment(Segment {
                    stream_id: pending.stream_id,
                    position: crate::model::Position { part: 0, index: i },
                    expires_at: None,
                    encrypted_key: bytes::Bytes::new(),
                    encrypted_key_nonce: bytes::Bytes::new(),
                    encrypted_size: 64,
                    plain_size: 64,
                    plain_offset: (i as i64) * 64,
                    encrypted_etag: None,
                    redundancy: crate::model::RedundancyScheme {
                        algorithm: 1,
                        share_size: 32,
                        required_shares: 2,
                        repair_shares: 3,
                        optimal_shares: 4,
                        total_shares: 5,
                    },
                    contents: SegmentContents::Remote {
                        root_piece_id: Uuid::new_v4(),
                        pieces: vec![],
                    },
                    placement: None,
                    repaired_at: None,
                })
                .await
                .unwrap();
        }

        let (object, _) = commit_object(
            &adapter,
            &config,
            CommitObjectRequest {
                location,
                version: pending.version,
                overwrite: CommitOverwrite::Unversioned,
                encrypted_metadata: EncryptedMetadata::default(),
                encryption: Some(EncryptionParameters {
                    cipher_suite: 1,
                    block_size: 4096,
                }),
            },
        )
        .await
        .unwrap();

        assert_eq!(object.status, ObjectStatus::CommittedUnversioned);
        assert_eq!(object.segment_count, 3);
        assert_eq!(object.fixed_segment_size, 64);
        assert_eq!(object.total_plain_size, 192);
    }

    #[tokio::test]
    async fn commit_object_renumbers_gap_in_offsets() {
        let adapter = MemoryAdapter::new();
        let config = Config::default();
        let location = loc();
        let pending = begin_object_next_version(
            &adapter,
            &config,
            BeginObjectNextVersionRequest {
                location: location.clone(),
                expires_at: None,
                retention: Retention::none(),
                legal_hold: false,
            },
        )
        .await
        .unwrap();

        for (i, offset) in [(0u32, 10i64), (1, 999)] {
            adapter
                .insert_segment(Segment {
                    stream_id: pending.stream_id,
                    position: crate::model::Position { part: 0, index: i },
                    expires_at: None,
                    encrypted_key: bytes::Bytes::new(),
                    encrypted_key_nonce: bytes::Bytes::new(),
                    encrypted_size: 64,
                    plain_size: 64,
                    plain_offset: offset, // deliberately wrong; commit must renumber
                    encrypted_etag: None,
                    redundancy: crate::model::RedundancyScheme {
                        algorithm: 1,
                        share_size: 32,
                        required_shares: 2,
                        repair_shares: 3,
                        optimal_shares: 4,
                        total_shares: 5,
                    },
                    contents: SegmentContents::Remote {
                        root_piece_id: Uuid::new_v4(),
                        pieces: vec![],
                    },
                    placement: None,
                    repaired_at: None,
                })
                .await
                .unwrap();
        }

        let (object, _) = commit_object(
            &adapter,
            &config,
            CommitObjectRequest {
                location: location.clone(),
                version: pending.version,
                overwrite: CommitOverwrite::Unversioned,
                encrypted_metadata: EncryptedMetadata::default(),
                encryption: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(object.segment_count, 2);
        assert_eq!(object.total_plain_size, 128);

        let segments = adapter.fetch_segments(pending.stream_id).await.unwrap();
        let mut by_index: Vec<_> = segments.iter().collect();
        by_index.sort_by_key(|s| s.position);
        assert_eq!(by_index[0].plain_offset, 0);
        assert_eq!(by_index[1].plain_offset, 64);
    }

    #[tokio::test]
    async fn delete_object_places_versioned_marker_without_removing_prior_rows() {
        let adapter = MemoryAdapter::new();
        let config = Config::default();
        let location = loc();

        let pending = begin_object_next_version(
            &adapter,
            &config,
            BeginObjectNextVersionRequest {
                location: location.clone(),
                expires_at: None,
                retention: Retention::none(),
                legal_hold: false,
            },
        )
        .await
        .unwrap();

        let marker = delete_object(
            &adapter,
            &config,
            DeleteObjectRequest {
                location: location.clone(),
                overwrite: CommitOverwrite::Versioned,
            },
        )
        .await
        .unwrap();

        assert_eq!(marker.status, ObjectStatus::DeleteMarkerVersioned);
        assert_eq!(marker.segment_count, 0);
        assert!(marker.version > pending.version);

        let prior = adapter
            .get_object(&location, Some(pending.version))
            .await
            .unwrap();
        assert!(prior.is_some());
    }
}
