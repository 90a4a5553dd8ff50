//! Paginated object listing (spec §4.6).
//!
//! The naive approach — fetch `limit` rows ordered by key, return them —
//! breaks two ways: a version group for one key can straddle a page
//! boundary (so `IsLatest` can't be computed for the row at the edge), and
//! a delimiter can collapse many keys into one common-prefix entry, making
//! "how many source rows does one output entry cost" unpredictable ahead of
//! time. This engine over-fetches by `extra_entries_for_is_latest`, detects
//! a batch that ended mid-group, and requeries past the boundary instead of
//! guessing; `requery_safety_margin` bounds how many times it's willing to
//! do that for one call before giving up with an internal error rather than
//! looping forever against a pathological key layout.

use crate::adapter::{Adapter, ListPageRequest, ListRow};
use crate::config::Config;
use crate::error::{MetabaseError, Result};
use crate::model::{BucketName, ObjectKey, ObjectStatus, ProjectId, StreamId, Version};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::{instrument, trace};

/// One object version surfaced by a listing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    /// Object key.
    pub object_key: ObjectKey,
    /// Object version.
    pub version: Version,
    /// Object status.
    pub status: ObjectStatus,
    /// True if this is the highest version for its key among the rows
    /// visible to this call (spec §4.6, "IsLatest").
    pub is_latest: bool,
    /// Stream id, for callers resolving full object metadata.
    pub stream_id: StreamId,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Listing request (spec §4.6).
#[derive(Debug, Clone)]
pub struct ListObjectsRequest {
    /// Project to list within.
    pub project_id: ProjectId,
    /// Bucket to list within.
    pub bucket_name: BucketName,
    /// Restrict results to keys with this prefix.
    pub prefix: Bytes,
    /// When set, keys containing this byte after the prefix are collapsed
    /// into a single common-prefix result instead of being listed
    /// individually.
    pub delimiter: Option<u8>,
    /// Resume after this (key, version), exclusive.
    pub cursor: Option<(ObjectKey, Version)>,
    /// Maximum entries to return.
    pub limit: usize,
    /// Include every version per key rather than just the latest.
    pub all_versions: bool,
    /// Include pending (uncommitted) objects.
    pub include_pending: bool,
}

/// Listing result.
#[derive(Debug, Clone, Default)]
pub struct ListObjectsResult {
    /// Matched object versions.
    pub entries: Vec<ListEntry>,
    /// Common prefixes collapsed by `delimiter`, sorted and deduplicated.
    pub common_prefixes: Vec<Bytes>,
    /// Cursor to resume from, `None` if this was the last page.
    pub next_cursor: Option<(ObjectKey, Version)>,
}

/// One run of consecutive rows sharing an object key.
struct KeyGroup {
    rows: Vec<ListRow>,
}

fn group_by_key(rows: Vec<ListRow>) -> Vec<KeyGroup> {
    let mut groups: Vec<KeyGroup> = Vec::new();
    for row in rows {
        match groups.last_mut() {
            Some(group) if group.rows[0].object_key == row.object_key => {
                group.rows.push(row);
            }
            _ => groups.push(KeyGroup { rows: vec![row] }),
        }
    }
    groups
}

/// Returns the position just past `prefix` where `delimiter` first occurs
/// in `key`, if any — the boundary at which `key` collapses into a common
/// prefix rather than being listed as its own entry.
fn delimiter_boundary(key: &[u8], prefix: &[u8], delimiter: u8) -> Option<usize> {
    let rest = key.strip_prefix(prefix)?;
    let pos = rest.iter().position(|&b| b == delimiter)?;
    Some(prefix.len() + pos + 1)
}

/// Lists objects under a prefix, paginating transparently across adapter
/// batch boundaries (spec §4.6, "ListObjects").
#[instrument(skip(adapter, config, req), fields(limit = req.limit, all_versions = req.all_versions))]
pub async fn list_objects(
    adapter: &dyn Adapter,
    config: &Config,
    req: ListObjectsRequest,
) -> Result<ListObjectsResult> {
    if req.limit == 0 {
        return Err(MetabaseError::InvalidRequest("limit must be > 0".into()));
    }

    let (mut cursor_key, mut cursor_version) = req
        .cursor
        .clone()
        .map(|(k, v)| (k.as_bytes().to_vec(), v))
        .unwrap_or_default();

    let batch_size = (req.limit + config.extra_entries_for_is_latest).max(config.listing_batch_floor);
    let safety_limit = req.limit + config.requery_safety_margin;

    let mut entries: Vec<ListEntry> = Vec::new();
    let mut common_prefixes: BTreeSet<Vec<u8>> = BTreeSet::new();
    let mut next_cursor: Option<(ObjectKey, Version)> = None;
    let mut iterations = 0usize;
    let mut consecutive_skips = 0usize;

    'outer: loop {
        if iterations >= safety_limit {
            return Err(MetabaseError::Internal(
                "listing safety counter exceeded; key layout too pathological to page through"
                    .into(),
            ));
        }
        iterations += 1;

        let rows = adapter
            .list_page(ListPageRequest {
                project_id: req.project_id,
                bucket_name: req.bucket_name.clone(),
                prefix: req.prefix.clone(),
                cursor_key: Bytes::from(cursor_key.clone()),
                cursor_version,
                batch_size,
                all_versions: true,
                include_pending: req.include_pending,
            })
            .await?;

        if rows.is_empty() {
            break;
        }

        let reached_end = rows.len() < batch_size;
        let mut groups = group_by_key(rows);

        // The last group may have been cut off by the batch boundary: more
        // rows for that key could exist beyond what we fetched. Drop it
        // unless this batch already reached the end of the data; it gets
        // re-fetched (completely, this time) on the next iteration.
        let dropped = if reached_end { None } else { groups.pop() };

        if groups.is_empty() {
            // The whole batch was one (possibly incomplete) group: a single
            // key with more versions than fit in one batch. Advance the
            // cursor within that key and keep pulling its remaining rows.
            let only = dropped.expect("non-empty batch with no complete groups has a dropped tail");
            let last_row = only.rows.last().expect("groups are never empty");
            cursor_key = last_row.object_key.as_bytes().to_vec();
            cursor_version = last_row.version;
            consecutive_skips += 1;
            if consecutive_skips > config.version_skip_requery {
                return Err(MetabaseError::Internal(
                    "too many versions on one key to page through safely".into(),
                ));
            }
            continue;
        }
        consecutive_skips = 0;

        for group in &groups {
            let first_key = &group.rows[0].object_key;

            if let Some(delimiter) = req.delimiter {
                if let Some(boundary) =
                    delimiter_boundary(first_key.as_bytes(), req.prefix.as_ref(), delimiter)
                {
                    let prefix = first_key.as_bytes()[..boundary].to_vec();
                    common_prefixes.insert(prefix);

                    if entries.len() + common_prefixes.len() >= req.limit {
                        let last = group.rows.last().expect("groups are never empty");
                        next_cursor = Some((last.object_key.clone(), last.version));
                        break 'outer;
                    }
                    continue;
                }
            }

            // The newest non-pending row is the one IsLatest can land on
            // (spec §4.6): a row still uploading must never shadow the
            // committed version behind it.
            let latest_committed_version = group
                .rows
                .iter()
                .rev()
                .find(|r| r.status != ObjectStatus::Pending)
                .or_else(|| group.rows.last())
                .map(|r| r.version);

            if req.all_versions {
                // Rows within a group arrive version-ascending (needed for
                // cursor math above); callers expect listings newest-first.
                for row in group.rows.iter().rev() {
                    entries.push(ListEntry {
                        object_key: row.object_key.clone(),
                        version: row.version,
                        status: row.status,
                        is_latest: Some(row.version) == latest_committed_version,
                        stream_id: row.stream_id,
                        created_at: row.created_at,
                    });
                }
            } else {
                // A delete marker as the newest version hides every version
                // behind it: the key is consumed (it still advances the
                // cursor below) but nothing is emitted for it. A pending
                // row never stands in for the key's representative entry
                // unless there is no committed version to show instead.
                let representative = group
                    .rows
                    .iter()
                    .rev()
                    .find(|r| r.status != ObjectStatus::Pending)
                    .unwrap_or_else(|| group.rows.last().expect("groups are never empty"));
                if !representative.status.is_delete_marker() {
                    entries.push(ListEntry {
                        object_key: representative.object_key.clone(),
                        version: representative.version,
                        status: representative.status,
                        is_latest: true,
                        stream_id: representative.stream_id,
                        created_at: representative.created_at,
                    });
                }
            }

            if entries.len() + common_prefixes.len() >= req.limit {
                let last = group.rows.last().expect("groups are never empty");
                next_cursor = Some((last.object_key.clone(), last.version));
                break 'outer;
            }
        }

        // Advance the cursor past everything we just consumed (completed
        // groups only; the dropped tail, if any, is re-fetched next time).
        let last_consumed = groups
            .last()
            .and_then(|g| g.rows.last())
            .expect("loop only reaches here with at least one complete group");
        cursor_key = last_consumed.object_key.as_bytes().to_vec();
        cursor_version = last_consumed.version;

        if reached_end && dropped.is_none() {
            break;
        }
        trace!(iterations, entries = entries.len(), "listing requery");
    }

    // A single key's version group (all_versions=true) or a batch of
    // collapsed prefixes can overshoot `req.limit` in one step; the checks
    // above only stop the loop once a group finishes, not partway through
    // it. Trim here so a response never exceeds what was asked for,
    // preferring to keep concrete entries over common prefixes.
    let mut common_prefixes: Vec<Bytes> = common_prefixes.into_iter().map(Bytes::from).collect();
    if entries.len() > req.limit {
        entries.truncate(req.limit);
        common_prefixes.clear();
    } else {
        let remaining = req.limit - entries.len();
        common_prefixes.truncate(remaining);
    }

    Ok(ListObjectsResult {
        entries,
        common_prefixes,
        next_cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::MemoryAdapter;
    use crate::config::Config;
    use crate::model::{BucketName, ObjectLocation, Position, ProjectId, Retention, Segment};
    use crate::objects::{
        begin_object_next_version, commit_object, BeginObjectNextVersionRequest,
        CommitObjectRequest, CommitOverwrite,
    };
    use uuid::Uuid;

    async fn seed(adapter: &MemoryAdapter, project: ProjectId, bucket: &str, keys: &[&str]) {
        let config = Config::default();
        for key in keys {
            begin_object_next_version(
                adapter,
                &config,
                BeginObjectNextVersionRequest {
                    location: ObjectLocation {
                        project_id: project,
                        bucket_name: BucketName(bucket.into()),
                        object_key: ObjectKey::from(*key),
                    },
                    expires_at: None,
                    retention: Retention::none(),
                    legal_hold: false,
                },
            )
            .await
            .unwrap();
        }
    }

    /// Begins and commits a new version at `location`, leaving a single
    /// trivial segment behind it.
    async fn commit_version(adapter: &MemoryAdapter, config: &Config, location: &ObjectLocation) {
        let pending = begin_object_next_version(
            adapter,
            config,
            BeginObjectNextVersionRequest {
                location: location.clone(),
                expires_at: None,
                retention: Retention::none(),
                legal_hold: false,
            },
        )
        .await
        .unwrap();

        adapter
            .insert_segment(Segment {
                stream_id: pending.stream_id,
                position: Position { part: 0, index: 0 },
                expires_at: None,
                encrypted_key: bytes::Bytes::new(),
                encrypted_key_nonce: bytes::Bytes::new(),
                encrypted_size: 64,
                plain_size: 64,
                plain_offset: 0,
                encrypted_etag: None,
                redundancy: crate::model::RedundancyScheme {
                    algorithm: 1,
                    share_size: 32,
                    required_shares: 2,
                    repair_shares: 3,
                    optimal_shares: 4,
                    total_shares: 5,
                },
                contents: crate::model::SegmentContents::Remote {
                    root_piece_id: Uuid::new_v4(),
                    pieces: vec![],
                },
                placement: None,
                repaired_at: None,
            })
            .await
            .unwrap();

        commit_object(
            adapter,
            config,
            CommitObjectRequest {
                location: location.clone(),
                version: pending.version,
                overwrite: CommitOverwrite::Versioned,
                encrypted_metadata: Default::default(),
                encryption: None,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn lists_pending_objects_when_included() {
        let adapter = MemoryAdapter::new();
        let project = ProjectId(Uuid::new_v4());
        seed(&adapter, project, "bucket", &["a", "b", "c"]).await;

        let result = list_objects(
            &adapter,
            &Config::default(),
            ListObjectsRequest {
                project_id: project,
                bucket_name: BucketName("bucket".into()),
                prefix: Bytes::new(),
                delimiter: None,
                cursor: None,
                limit: 10,
                all_versions: false,
                include_pending: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(result.entries.len(), 3);
        assert!(result.entries.iter().all(|e| e.is_latest));
        assert!(result.next_cursor.is_none());
    }

    #[tokio::test]
    async fn respects_limit_and_sets_next_cursor() {
        let adapter = MemoryAdapter::new();
        let project = ProjectId(Uuid::new_v4());
        seed(&adapter, project, "bucket", &["a", "b", "c", "d"]).await;

        let result = list_objects(
            &adapter,
            &Config::default(),
            ListObjectsRequest {
                project_id: project,
                bucket_name: BucketName("bucket".into()),
                prefix: Bytes::new(),
                delimiter: None,
                cursor: None,
                limit: 2,
                all_versions: false,
                include_pending: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(result.entries.len(), 2);
        assert!(result.next_cursor.is_some());
    }

    #[tokio::test]
    async fn delimiter_collapses_common_prefixes() {
        let adapter = MemoryAdapter::new();
        let project = ProjectId(Uuid::new_v4());
        seed(
            &adapter,
            project,
            "bucket",
            &["photos/a.jpg", "photos/b.jpg", "readme.txt"],
        )
        .await;

        let result = list_objects(
            &adapter,
            &Config::default(),
            ListObjectsRequest {
                project_id: project,
                bucket_name: BucketName("bucket".into()),
                prefix: Bytes::new(),
                delimiter: Some(b'/'),
                cursor: None,
                limit: 10,
                all_versions: false,
                include_pending: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(result.common_prefixes.len(), 1);
        assert_eq!(result.common_prefixes[0].as_ref(), b"photos/");
        assert_eq!(result.entries.len(), 1);
        assert_eq!(result.entries[0].object_key.display(), "readme.txt");
    }

    #[tokio::test]
    async fn single_key_many_versions_truncates_to_limit() {
        let adapter = MemoryAdapter::new();
        let config = Config::default();
        let project = ProjectId(Uuid::new_v4());
        let location = ObjectLocation {
            project_id: project,
            bucket_name: BucketName("bucket".into()),
            object_key: ObjectKey::from("object.bin"),
        };
        for _ in 0..6 {
            commit_version(&adapter, &config, &location).await;
        }

        let result = list_objects(
            &adapter,
            &config,
            ListObjectsRequest {
                project_id: project,
                bucket_name: BucketName("bucket".into()),
                prefix: Bytes::new(),
                delimiter: None,
                cursor: None,
                limit: 3,
                all_versions: true,
                include_pending: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(result.entries.len(), 3);
        assert!(result.next_cursor.is_some());
    }

    #[tokio::test]
    async fn many_collapsed_prefixes_respect_limit() {
        let adapter = MemoryAdapter::new();
        let project = ProjectId(Uuid::new_v4());
        seed(
            &adapter,
            project,
            "bucket",
            &["a/1.txt", "b/1.txt", "c/1.txt", "d/1.txt", "e/1.txt"],
        )
        .await;

        let result = list_objects(
            &adapter,
            &Config::default(),
            ListObjectsRequest {
                project_id: project,
                bucket_name: BucketName("bucket".into()),
                prefix: Bytes::new(),
                delimiter: Some(b'/'),
                cursor: None,
                limit: 2,
                all_versions: false,
                include_pending: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(result.common_prefixes.len(), 2);
        assert!(result.entries.is_empty());
        assert!(result.next_cursor.is_some());
    }

    #[tokio::test]
    async fn committed_version_stays_latest_over_newer_pending() {
        let adapter = MemoryAdapter::new();
        let config = Config::default();
        let project = ProjectId(Uuid::new_v4());
        let location = ObjectLocation {
            project_id: project,
            bucket_name: BucketName("bucket".into()),
            object_key: ObjectKey::from("object.bin"),
        };
        commit_version(&adapter, &config, &location).await;

        // A second, still-uploading version with a higher version number
        // than the committed one above.
        begin_object_next_version(
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

        let result = list_objects(
            &adapter,
            &config,
            ListObjectsRequest {
                project_id: project,
                bucket_name: BucketName("bucket".into()),
                prefix: Bytes::new(),
                delimiter: None,
                cursor: None,
                limit: 10,
                all_versions: true,
                include_pending: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(result.entries.len(), 2);
        let committed = result
            .entries
            .iter()
            .find(|e| e.status != ObjectStatus::Pending)
            .unwrap();
        let pending = result
            .entries
            .iter()
            .find(|e| e.status == ObjectStatus::Pending)
            .unwrap();
        assert!(committed.is_latest);
        assert!(!pending.is_latest);
    }
}
