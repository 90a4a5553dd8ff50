//! End-to-end scenarios spanning begin/commit/list/repair, exercised
//! through the `Metabase` facade against `MemoryAdapter` the way a real
//! caller would drive the whole lifecycle rather than one operation at a
//! time.

use bytes::Bytes;
use metabase::adapter::memory::MemoryAdapter;
use metabase::error::ErrorKind;
use metabase::listing::ListObjectsRequest;
use metabase::model::{
    AliasPiece, BucketName, EncryptedMetadata, NodeId, Object, ObjectKey, ObjectLocation,
    ObjectStatus, Position, ProjectId, RedundancyScheme, Retention,
};
use metabase::objects::{
    BeginObjectNextVersionRequest, CommitInlineObjectRequest, CommitOverwrite, DeleteObjectRequest,
};
use metabase::segments::{BeginSegmentRequest, CommitSegmentRequest, UpdateSegmentPiecesRequest};
use metabase::{Config, Metabase};
use std::sync::Arc;
use uuid::Uuid;

fn metabase() -> Metabase {
    Metabase::new(Arc::new(MemoryAdapter::new()), Config::default())
}

fn location(project: ProjectId, key: &str) -> ObjectLocation {
    ObjectLocation {
        project_id: project,
        bucket_name: BucketName("b1".into()),
        object_key: ObjectKey::from(key),
    }
}

fn redundancy() -> RedundancyScheme {
    RedundancyScheme {
        algorithm: 1,
        share_size: 4096,
        required_shares: 2,
        repair_shares: 3,
        optimal_shares: 4,
        total_shares: 5,
    }
}

async fn begin(mb: &Metabase, location: &ObjectLocation) -> Object {
    mb.begin_object_next_version(BeginObjectNextVersionRequest {
        location: location.clone(),
        expires_at: None,
        retention: Retention::none(),
        legal_hold: false,
    })
    .await
    .unwrap()
}

async fn commit_remote_segment(
    mb: &Metabase,
    object: &Object,
    index: u32,
    plain_size: i32,
    plain_offset: i64,
) {
    let aliases = mb
        .begin_segment(BeginSegmentRequest {
            stream_id: object.stream_id,
            position: Position { part: 0, index },
            root_piece_id: Uuid::new_v4(),
            piece_nodes: vec![NodeId(Uuid::new_v4()), NodeId(Uuid::new_v4())],
        })
        .await
        .unwrap();

    mb.commit_segment(CommitSegmentRequest {
        stream_id: object.stream_id,
        position: Position { part: 0, index },
        expires_at: None,
        encrypted_key: Bytes::new(),
        encrypted_key_nonce: Bytes::new(),
        encrypted_size: plain_size,
        plain_size,
        plain_offset,
        encrypted_etag: None,
        redundancy: redundancy(),
        root_piece_id: Uuid::new_v4(),
        pieces: aliases
            .into_iter()
            .enumerate()
            .map(|(i, alias)| AliasPiece {
                alias,
                piece_num: i as u16,
            })
            .collect(),
        placement: None,
    })
    .await
    .unwrap();
}

// Scenario 1: unversioned commit of two remote segments lists as one entry.
#[tokio::test]
async fn two_remote_segments_commit_and_list_as_one_entry() {
    let mb = metabase();
    let project = ProjectId(Uuid::new_v4());
    let loc = location(project, "k");

    let pending = begin(&mb, &loc).await;
    assert_eq!(pending.version, 1);
    assert_eq!(pending.status, ObjectStatus::Pending);

    commit_remote_segment(&mb, &pending, 0, 100, 0).await;
    commit_remote_segment(&mb, &pending, 1, 50, 100).await;

    let committed = mb
        .commit_object(metabase::objects::CommitObjectRequest {
            location: loc.clone(),
            version: pending.version,
            overwrite: CommitOverwrite::Unversioned,
            encrypted_metadata: EncryptedMetadata::default(),
            encryption: None,
        })
        .await
        .unwrap();
    assert_eq!(committed.status, ObjectStatus::CommittedUnversioned);
    assert_eq!(committed.segment_count, 2);
    assert_eq!(committed.total_plain_size, 150);

    let listing = mb
        .list_objects(ListObjectsRequest {
            project_id: project,
            bucket_name: BucketName("b1".into()),
            prefix: Bytes::new(),
            delimiter: None,
            cursor: None,
            limit: 10,
            all_versions: false,
            include_pending: false,
        })
        .await
        .unwrap();

    assert_eq!(listing.entries.len(), 1);
    let entry = &listing.entries[0];
    assert_eq!(entry.object_key.display(), "k");
    assert_eq!(entry.version, 1);
    assert!(entry.is_latest);

    // Scenario 2: a second, versioned, inline commit at the same key lists
    // both versions newest-first with is_latest only on the newer one.
    let pending2 = begin(&mb, &loc).await;
    assert_eq!(pending2.version, 2);

    let committed2 = mb
        .commit_inline_object(CommitInlineObjectRequest {
            location: loc.clone(),
            overwrite: CommitOverwrite::Versioned,
            expires_at: None,
            encrypted_metadata: EncryptedMetadata::default(),
            encryption: metabase::model::EncryptionParameters {
                cipher_suite: 1,
                block_size: 10,
            },
            encrypted_key: Bytes::new(),
            encrypted_key_nonce: Bytes::new(),
            data: Bytes::from_static(b"0123456789"),
            plain_size: 10,
            encrypted_etag: None,
        })
        .await
        .unwrap();
    assert_eq!(committed2.status, ObjectStatus::CommittedVersioned);
    assert_eq!(committed2.version, 3);

    let all_versions = mb
        .list_objects(ListObjectsRequest {
            project_id: project,
            bucket_name: BucketName("b1".into()),
            prefix: Bytes::new(),
            delimiter: None,
            cursor: None,
            limit: 10,
            all_versions: true,
            include_pending: false,
        })
        .await
        .unwrap();

    assert_eq!(all_versions.entries.len(), 2);
    assert!(all_versions.entries[0].version > all_versions.entries[1].version);
    assert!(all_versions.entries[0].is_latest);
    assert!(!all_versions.entries[1].is_latest);

    // Scenario 3: a delete marker on top hides the key entirely from a
    // non-versioned listing but all three rows still surface when listing
    // every version.
    let marker = mb
        .delete_object(DeleteObjectRequest {
            location: loc.clone(),
            overwrite: CommitOverwrite::Versioned,
        })
        .await
        .unwrap();
    assert_eq!(marker.status, ObjectStatus::DeleteMarkerVersioned);

    let hidden = mb
        .list_objects(ListObjectsRequest {
            project_id: project,
            bucket_name: BucketName("b1".into()),
            prefix: Bytes::new(),
            delimiter: None,
            cursor: None,
            limit: 10,
            all_versions: false,
            include_pending: false,
        })
        .await
        .unwrap();
    assert_eq!(hidden.entries.len(), 0);

    let with_marker = mb
        .list_objects(ListObjectsRequest {
            project_id: project,
            bucket_name: BucketName("b1".into()),
            prefix: Bytes::new(),
            delimiter: None,
            cursor: None,
            limit: 10,
            all_versions: true,
            include_pending: false,
        })
        .await
        .unwrap();
    assert_eq!(with_marker.entries.len(), 3);
    assert_eq!(with_marker.entries[0].status, ObjectStatus::DeleteMarkerVersioned);
}

// Scenario 4: non-recursive listing with a delimiter collapses a common
// prefix and leaves unrelated keys alone.
#[tokio::test]
async fn delimiter_listing_collapses_prefix_and_excludes_unrelated_key() {
    let mb = metabase();
    let project = ProjectId(Uuid::new_v4());

    for key in ["a/x", "a/y/z", "a/y/w", "b"] {
        begin(&mb, &location(project, key)).await;
    }

    let result = mb
        .list_objects(ListObjectsRequest {
            project_id: project,
            bucket_name: BucketName("b1".into()),
            prefix: Bytes::from_static(b"a/"),
            delimiter: Some(b'/'),
            cursor: None,
            limit: 10,
            all_versions: false,
            include_pending: true,
        })
        .await
        .unwrap();

    assert_eq!(result.entries.len(), 1);
    assert_eq!(result.entries[0].object_key.display(), "a/x");
    assert_eq!(result.common_prefixes.len(), 1);
    assert_eq!(result.common_prefixes[0].as_ref(), b"a/y/");
    assert!(result
        .entries
        .iter()
        .all(|e| e.object_key.display() != "b"));
}

// Scenario 5: repair updates a segment's piece-set; a concurrent caller
// racing against the old expectation fails with value-changed.
#[tokio::test]
async fn repair_updates_pieces_and_rejects_stale_concurrent_update() {
    let mb = metabase();
    let project = ProjectId(Uuid::new_v4());
    let loc = location(project, "k");
    let pending = begin(&mb, &loc).await;

    let n1 = NodeId(Uuid::new_v4());
    let n2 = NodeId(Uuid::new_v4());
    let n3 = NodeId(Uuid::new_v4());
    let n4 = NodeId(Uuid::new_v4());

    let aliases = mb
        .begin_segment(BeginSegmentRequest {
            stream_id: pending.stream_id,
            position: Position { part: 0, index: 0 },
            root_piece_id: Uuid::new_v4(),
            piece_nodes: vec![n1, n2, n3],
        })
        .await
        .unwrap();
    let root = Uuid::new_v4();
    let old_pieces: Vec<AliasPiece> = aliases
        .iter()
        .enumerate()
        .map(|(i, &alias)| AliasPiece {
            alias,
            piece_num: i as u16,
        })
        .collect();

    mb.commit_segment(CommitSegmentRequest {
        stream_id: pending.stream_id,
        position: Position { part: 0, index: 0 },
        expires_at: None,
        encrypted_key: Bytes::new(),
        encrypted_key_nonce: Bytes::new(),
        encrypted_size: 100,
        plain_size: 100,
        plain_offset: 0,
        encrypted_etag: None,
        redundancy: redundancy(),
        root_piece_id: root,
        pieces: old_pieces.clone(),
        placement: None,
    })
    .await
    .unwrap();

    let n4_alias = mb
        .begin_segment(BeginSegmentRequest {
            stream_id: pending.stream_id,
            position: Position { part: 0, index: 1 },
            root_piece_id: root,
            piece_nodes: vec![n4],
        })
        .await
        .unwrap()[0];
    let new_pieces = vec![
        old_pieces[0].clone(),
        AliasPiece {
            alias: n4_alias,
            piece_num: 1,
        },
        old_pieces[2].clone(),
    ];

    mb.update_segment_pieces(UpdateSegmentPiecesRequest {
        stream_id: pending.stream_id,
        position: Position { part: 0, index: 0 },
        expected_pieces: old_pieces.clone(),
        root_piece_id: root,
        new_pieces: new_pieces.clone(),
    })
    .await
    .unwrap();

    // A second caller still holding the pre-repair expectation loses.
    let err = mb
        .update_segment_pieces(UpdateSegmentPiecesRequest {
            stream_id: pending.stream_id,
            position: Position { part: 0, index: 0 },
            expected_pieces: old_pieces,
            root_piece_id: root,
            new_pieces,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValueChanged);
}

// Scenario 6: IfNoneMatch=* fails with conflict when a committed row
// already exists, and leaves the pending row it was racing against intact.
#[tokio::test]
async fn check_existence_commit_conflicts_and_leaves_pending_row_intact() {
    let mb = metabase();
    let project = ProjectId(Uuid::new_v4());
    let loc = location(project, "k");

    let first = begin(&mb, &loc).await;
    commit_remote_segment(&mb, &first, 0, 10, 0).await;
    mb.commit_object(metabase::objects::CommitObjectRequest {
        location: loc.clone(),
        version: first.version,
        overwrite: CommitOverwrite::Unversioned,
        encrypted_metadata: EncryptedMetadata::default(),
        encryption: None,
    })
    .await
    .unwrap();

    let second = begin(&mb, &loc).await;
    commit_remote_segment(&mb, &second, 0, 10, 0).await;

    let err = mb
        .commit_object(metabase::objects::CommitObjectRequest {
            location: loc.clone(),
            version: second.version,
            overwrite: CommitOverwrite::CheckExistence,
            encrypted_metadata: EncryptedMetadata::default(),
            encryption: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let still_pending = mb
        .get_object(&loc, Some(second.version))
        .await
        .unwrap()
        .expect("pending row must survive a rejected commit");
    assert_eq!(still_pending.status, ObjectStatus::Pending);
}
