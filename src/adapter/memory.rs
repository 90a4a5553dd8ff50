//! In-process test double.
//!
//! `MemoryAdapter` holds every row behind a single `Mutex`, trading any
//! pretence of real concurrency for a backend this crate's own test suite
//! can run without a live database. Locking idiom follows
//! `crate::error::acquire_lock`, the same helper the teacher's WAL path
//! uses to avoid panicking on a poisoned mutex.

use crate::alias::AliasCache;
use crate::error::{acquire_lock, MetabaseError, Result};
use crate::health::{Check, HealthCheck};
use crate::model::{
    Object, ObjectLocation, ObjectStatus, Position, Retention, Segment, SegmentContents,
    StreamId, Version,
};
use crate::precommit::{
    ExistingObjectSummary, PrecommitConstraintEvaluator, PrecommitMode,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{
    Adapter, CommitDecision, FinalizeCommitRequest, InsertPendingObjectRequest, ListPageRequest,
    ListRow, ZombieSweepRequest,
};

#[derive(Default)]
struct MemoryState {
    /// All versions at a location, keyed by version.
    objects: std::collections::HashMap<ObjectLocation, BTreeMap<Version, Object>>,
    /// Segments by stream, keyed by packed position for ordering.
    segments: std::collections::HashMap<StreamId, BTreeMap<Position, Segment>>,
    open_transactions: usize,
}

impl MemoryState {
    fn existing_at(&self, location: &ObjectLocation) -> Vec<ExistingObjectSummary> {
        self.objects
            .get(location)
            .map(|versions| {
                versions
                    .values()
                    .map(|o| ExistingObjectSummary {
                        version: o.version,
                        status: o.status,
                        segment_count: o.segment_count,
                        retention: o.retention,
                        legal_hold: o.legal_hold,
                        zombie_deletion_deadline: o.zombie_deletion_deadline,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn find_by_stream(&self, stream_id: StreamId) -> Option<(&ObjectLocation, &Object)> {
        self.objects.iter().find_map(|(loc, versions)| {
            versions
                .values()
                .find(|o| o.stream_id == stream_id)
                .map(|o| (loc, o))
        })
    }

    fn find_by_stream_mut(&mut self, stream_id: StreamId) -> Option<&mut Object> {
        self.objects
            .values_mut()
            .find_map(|versions| versions.values_mut().find(|o| o.stream_id == stream_id))
    }
}

/// In-memory [`Adapter`] used by unit and integration tests.
pub struct MemoryAdapter {
    state: Mutex<MemoryState>,
    aliases: AliasCache,
    evaluator: PrecommitConstraintEvaluator,
}

impl MemoryAdapter {
    /// Creates an empty adapter.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            aliases: AliasCache::new(),
            evaluator: PrecommitConstraintEvaluator::new(),
        }
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    async fn fetch_existing_at_location(
        &self,
        location: &ObjectLocation,
    ) -> Result<Vec<ExistingObjectSummary>> {
        let state = acquire_lock(&self.state)?;
        Ok(state.existing_at(location))
    }

    async fn insert_pending_object(
        &self,
        req: InsertPendingObjectRequest,
        mode: PrecommitMode,
    ) -> Result<Object> {
        let mut state = acquire_lock(&self.state)?;
        let existing = state.existing_at(&req.location);
        let decision = self.evaluator.evaluate(Utc::now(), mode, &existing)?;

        let version = req.exact_version.unwrap_or(decision.highest_version + 1);

        let slot = state.objects.entry(req.location.clone()).or_default();
        if slot.contains_key(&version) {
            return Err(MetabaseError::ObjectAlreadyExists { version });
        }
        for deleted in &decision.deleted_versions {
            slot.remove(deleted);
        }

        let object = Object {
            location: req.location.clone(),
            version,
            stream_id: req.stream_id,
            status: ObjectStatus::Pending,
            created_at: Utc::now(),
            expires_at: req.expires_at,
            encryption: None,
            encrypted_metadata: Default::default(),
            segment_count: 0,
            total_plain_size: 0,
            total_encrypted_size: 0,
            fixed_segment_size: -1,
            zombie_deletion_deadline: Some(req.zombie_deletion_deadline),
            retention: req.retention,
            legal_hold: req.legal_hold,
        };
        slot.insert(version, object.clone());
        Ok(object)
    }

    async fn fetch_pending_object(&self, stream_id: StreamId) -> Result<Option<Object>> {
        let state = acquire_lock(&self.state)?;
        Ok(state
            .find_by_stream(stream_id)
            .map(|(_, o)| o.clone())
            .filter(|o| o.status == ObjectStatus::Pending))
    }

    async fn insert_segment(&self, segment: Segment) -> Result<()> {
        let mut state = acquire_lock(&self.state)?;
        if state.find_by_stream(segment.stream_id).is_none() {
            return Err(MetabaseError::PendingObjectMissing);
        }
        state
            .segments
            .entry(segment.stream_id)
            .or_default()
            .insert(segment.position, segment);
        Ok(())
    }

    async fn fetch_segment(
        &self,
        stream_id: StreamId,
        position: Position,
    ) -> Result<Option<Segment>> {
        let state = acquire_lock(&self.state)?;
        Ok(state
            .segments
            .get(&stream_id)
            .and_then(|m| m.get(&position))
            .cloned())
    }

    async fn fetch_segments(&self, stream_id: StreamId) -> Result<Vec<Segment>> {
        let state = acquire_lock(&self.state)?;
        Ok(state
            .segments
            .get(&stream_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_segment_pieces(
        &self,
        stream_id: StreamId,
        position: Position,
        expected: &SegmentContents,
        new: SegmentContents,
    ) -> Result<()> {
        let mut state = acquire_lock(&self.state)?;
        let segment = state
            .segments
            .get_mut(&stream_id)
            .and_then(|m| m.get_mut(&position))
            .ok_or(MetabaseError::SegmentNotFound)?;
        if &segment.contents != expected {
            return Err(MetabaseError::ValueChanged);
        }
        segment.contents = new;
        Ok(())
    }

    async fn rewrite_segment_offset(
        &self,
        stream_id: StreamId,
        position: Position,
        plain_offset: i64,
    ) -> Result<()> {
        let mut state = acquire_lock(&self.state)?;
        let segment = state
            .segments
            .get_mut(&stream_id)
            .and_then(|m| m.get_mut(&position))
            .ok_or(MetabaseError::SegmentNotFound)?;
        segment.plain_offset = plain_offset;
        Ok(())
    }

    async fn finalize_commit(&self, req: FinalizeCommitRequest) -> Result<Object> {
        let mut state = acquire_lock(&self.state)?;

        let slot = state
            .objects
            .get_mut(&req.location)
            .ok_or(MetabaseError::PendingObjectMissing)?;
        for deleted in &req.decision.deleted_versions {
            slot.remove(deleted);
        }
        let object = slot
            .get_mut(&req.version)
            .ok_or(MetabaseError::PendingObjectMissing)?;
        if object.status != ObjectStatus::Pending {
            return Err(MetabaseError::ObjectStatus {
                found: format!("{:?}", object.status),
            });
        }

        object.status = req.new_status;
        object.segment_count = req.segment_count;
        object.total_plain_size = req.total_plain_size;
        object.total_encrypted_size = req.total_encrypted_size;
        object.fixed_segment_size = req.fixed_segment_size;
        object.encrypted_metadata = req.encrypted_metadata;
        if req.encryption.is_some() {
            object.encryption = req.encryption;
        }
        object.zombie_deletion_deadline = None;
        Ok(object.clone())
    }

    async fn set_retention(
        &self,
        location: &ObjectLocation,
        version: Version,
        retention: Retention,
        legal_hold: Option<bool>,
    ) -> Result<Object> {
        let mut state = acquire_lock(&self.state)?;
        let object = state
            .objects
            .get_mut(location)
            .and_then(|versions| versions.get_mut(&version))
            .ok_or(MetabaseError::ObjectNotFound("object"))?;
        object.retention = retention;
        if let Some(legal_hold) = legal_hold {
            object.legal_hold = legal_hold;
        }
        Ok(object.clone())
    }

    async fn get_object(
        &self,
        location: &ObjectLocation,
        version: Option<Version>,
    ) -> Result<Option<Object>> {
        let state = acquire_lock(&self.state)?;
        let Some(versions) = state.objects.get(location) else {
            return Ok(None);
        };
        match version {
            Some(v) => Ok(versions.get(&v).cloned()),
            None => Ok(versions
                .values()
                .find(|o| o.status.is_unversioned())
                .or_else(|| versions.values().rev().find(|o| o.status.is_committed()))
                .cloned()),
        }
    }

    async fn list_page(&self, req: ListPageRequest) -> Result<Vec<ListRow>> {
        let state = acquire_lock(&self.state)?;
        let mut rows: Vec<ListRow> = state
            .objects
            .iter()
            .filter(|(loc, _)| {
                loc.project_id == req.project_id
                    && loc.bucket_name == req.bucket_name
                    && loc.object_key.as_bytes().starts_with(req.prefix.as_ref())
            })
            .flat_map(|(loc, versions)| {
                versions.values().filter_map(move |o| {
                    if !req.include_pending && o.status == ObjectStatus::Pending {
                        return None;
                    }
                    Some(ListRow {
                        object_key: loc.object_key.clone(),
                        version: o.version,
                        status: o.status,
                        stream_id: o.stream_id,
                        created_at: o.created_at,
                    })
                })
            })
            .filter(|row| {
                row.object_key.as_bytes() > req.cursor_key.as_ref()
                    || (row.object_key.as_bytes() == req.cursor_key.as_ref()
                        && row.version > req.cursor_version)
            })
            .collect();

        rows.sort_by(|a, b| {
            a.object_key
                .as_bytes()
                .cmp(b.object_key.as_bytes())
                .then(a.version.cmp(&b.version))
        });

        if !req.all_versions {
            let mut collapsed: Vec<ListRow> = Vec::new();
            for row in rows {
                match collapsed.last() {
                    Some(last) if last.object_key == row.object_key => {}
                    _ => collapsed.push(row),
                }
            }
            rows = collapsed;
        }

        rows.truncate(req.batch_size);
        Ok(rows)
    }

    async fn zombie_sweep(&self, req: ZombieSweepRequest) -> Result<usize> {
        let mut state = acquire_lock(&self.state)?;
        let as_of = req.as_of.unwrap_or_else(Utc::now);
        let mut removed = 0usize;

        let mut to_remove: Vec<(ObjectLocation, Version, StreamId)> = Vec::new();
        for (loc, versions) in state.objects.iter() {
            for object in versions.values() {
                if object.status != ObjectStatus::Pending {
                    continue;
                }
                if object
                    .zombie_deletion_deadline
                    .map(|d| d <= as_of)
                    .unwrap_or(false)
                {
                    to_remove.push((loc.clone(), object.version, object.stream_id));
                    if to_remove.len() >= req.batch_size {
                        break;
                    }
                }
            }
            if to_remove.len() >= req.batch_size {
                break;
            }
        }

        for (loc, version, stream_id) in to_remove {
            if let Some(versions) = state.objects.get_mut(&loc) {
                versions.remove(&version);
            }
            state.segments.remove(&stream_id);
            removed += 1;
        }

        Ok(removed)
    }

    async fn health(&self) -> Result<HealthCheck> {
        let state = acquire_lock(&self.state)?;
        let mut report = HealthCheck::new();
        report.add_check(Check::OpenTransactions {
            count: state.open_transactions,
            limit: usize::MAX,
            healthy: true,
        });
        Ok(report)
    }

    fn alias_cache(&self) -> &AliasCache {
        &self.aliases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BucketName, EncryptedMetadata, ObjectKey, ProjectId};
    use uuid::Uuid;

    fn loc(key: &str) -> ObjectLocation {
        ObjectLocation {
            project_id: ProjectId(Uuid::new_v4()),
            bucket_name: BucketName("bucket".into()),
            object_key: ObjectKey::from(key),
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_pending_object() {
        let adapter = MemoryAdapter::new();
        let location = loc("a.txt");
        let stream_id = StreamId::new_random();
        let req = InsertPendingObjectRequest {
            location: location.clone(),
            exact_version: None,
            stream_id,
            expires_at: None,
            zombie_deletion_deadline: Utc::now() + chrono::Duration::hours(24),
            retention: Retention::none(),
            legal_hold: false,
        };
        let object = adapter
            .insert_pending_object(req, PrecommitMode::Versioned)
            .await
            .unwrap();
        assert_eq!(object.version, 1);

        let fetched = adapter.fetch_pending_object(stream_id).await.unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn finalize_commit_transitions_status() {
        let adapter = MemoryAdapter::new();
        let location = loc("a.txt");
        let stream_id = StreamId::new_random();
        let req = InsertPendingObjectRequest {
            location: location.clone(),
            exact_version: None,
            stream_id,
            expires_at: None,
            zombie_deletion_deadline: Utc::now() + chrono::Duration::hours(24),
            retention: Retention::none(),
            legal_hold: false,
        };
        let pending = adapter
            .insert_pending_object(req, PrecommitMode::Versioned)
            .await
            .unwrap();

        let finalize = FinalizeCommitRequest {
            location: location.clone(),
            version: pending.version,
            stream_id,
            new_status: ObjectStatus::CommittedUnversioned,
            segment_count: 1,
            total_plain_size: 100,
            total_encrypted_size: 110,
            fixed_segment_size: 100,
            encrypted_metadata: EncryptedMetadata::default(),
            encryption: None,
            decision: CommitDecision::default(),
        };
        let committed = adapter.finalize_commit(finalize).await.unwrap();
        assert_eq!(committed.status, ObjectStatus::CommittedUnversioned);
        assert!(committed.zombie_deletion_deadline.is_none());
    }

    #[tokio::test]
    async fn zombie_sweep_removes_expired_pending_objects() {
        let adapter = MemoryAdapter::new();
        let location = loc("a.txt");
        let req = InsertPendingObjectRequest {
            location,
            exact_version: None,
            stream_id: StreamId::new_random(),
            expires_at: None,
            zombie_deletion_deadline: Utc::now() - chrono::Duration::hours(1),
            retention: Retention::none(),
            legal_hold: false,
        };
        adapter
            .insert_pending_object(req, PrecommitMode::Versioned)
            .await
            .unwrap();

        let removed = adapter
            .zombie_sweep(ZombieSweepRequest {
                as_of: None,
                batch_size: 10,
            })
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
