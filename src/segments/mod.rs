//! Segment lifecycle operations (spec §4.5).

use crate::adapter::Adapter;
use crate::error::{MetabaseError, Result};
use crate::model::{
    NodeId, Position, RedundancyScheme, Segment, SegmentContents, StreamId,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::instrument;

/// Request to begin a remote segment: validates that its stream has a
/// pending parent and resolves storage-node ids to aliases before the
/// piece-set is persisted.
#[derive(Debug, Clone)]
pub struct BeginSegmentRequest {
    /// Owning stream. Must belong to a currently-pending object.
    pub stream_id: StreamId,
    /// Position within the stream.
    pub position: Position,
    /// Root piece id for this segment's erasure code.
    pub root_piece_id: uuid::Uuid,
    /// Nodes selected to hold pieces, in piece-number order.
    pub piece_nodes: Vec<NodeId>,
}

/// Verifies the parent object is pending and resolves node ids to aliases,
/// without yet writing the segment row (spec §4.5, "BeginSegment": the
/// actual piece upload happens out of band between this call and
/// `CommitSegment`).
#[instrument(skip(adapter, req), fields(stream_id = ?req.stream_id))]
pub async fn begin_segment(
    adapter: &dyn Adapter,
    req: BeginSegmentRequest,
) -> Result<Vec<u32>> {
    adapter
        .fetch_pending_object(req.stream_id)
        .await?
        .ok_or(MetabaseError::PendingObjectMissing)?;

    Ok(adapter.alias_cache().ensure_aliases(&req.piece_nodes))
}

/// Request to commit a remote segment once its pieces have been uploaded.
#[derive(Debug, Clone)]
pub struct CommitSegmentRequest {
    /// Owning stream.
    pub stream_id: StreamId,
    /// Position within the stream.
    pub position: Position,
    /// Expiration timestamp, inherited from the parent object.
    pub expires_at: Option<DateTime<Utc>>,
    /// Per-segment content encryption key, itself encrypted.
    pub encrypted_key: Bytes,
    /// Nonce for `encrypted_key`.
    pub encrypted_key_nonce: Bytes,
    /// Ciphertext size.
    pub encrypted_size: i32,
    /// Plaintext size.
    pub plain_size: i32,
    /// Byte offset within the assembled object.
    pub plain_offset: i64,
    /// Encrypted ETag.
    pub encrypted_etag: Option<Bytes>,
    /// Erasure coding parameters.
    pub redundancy: RedundancyScheme,
    /// Root piece id, as returned by the prior `BeginSegment` call.
    pub root_piece_id: uuid::Uuid,
    /// Aliased piece-set, as returned by the prior `BeginSegment` call.
    pub pieces: Vec<crate::model::AliasPiece>,
    /// Placement constraint inherited from the bucket.
    pub placement: Option<i32>,
}

/// Persists a remote segment row (spec §4.5, "CommitSegment").
#[instrument(skip(adapter, req), fields(stream_id = ?req.stream_id, position = %req.position))]
pub async fn commit_segment(adapter: &dyn Adapter, req: CommitSegmentRequest) -> Result<()> {
    if req.pieces.len() < req.redundancy.required_shares as usize {
        return Err(MetabaseError::InvalidRequest(format!(
            "only {} of {} required pieces committed",
            req.pieces.len(),
            req.redundancy.required_shares
        )));
    }

    adapter
        .insert_segment(Segment {
            stream_id: req.stream_id,
            position: req.position,
            expires_at: req.expires_at,
            encrypted_key: req.encrypted_key,
            encrypted_key_nonce: req.encrypted_key_nonce,
            encrypted_size: req.encrypted_size,
            plain_size: req.plain_size,
            plain_offset: req.plain_offset,
            encrypted_etag: req.encrypted_etag,
            redundancy: req.redundancy,
            contents: SegmentContents::Remote {
                root_piece_id: req.root_piece_id,
                pieces: req.pieces,
            },
            placement: req.placement,
            repaired_at: None,
        })
        .await
}

/// Request to commit a segment stored inline rather than remotely.
#[derive(Debug, Clone)]
pub struct CommitInlineSegmentRequest {
    /// Owning stream.
    pub stream_id: StreamId,
    /// Position within the stream.
    pub position: Position,
    /// Expiration timestamp, inherited from the parent object.
    pub expires_at: Option<DateTime<Utc>>,
    /// Per-segment content encryption key, itself encrypted.
    pub encrypted_key: Bytes,
    /// Nonce for `encrypted_key`.
    pub encrypted_key_nonce: Bytes,
    /// Plaintext size.
    pub plain_size: i32,
    /// Encrypted ETag.
    pub encrypted_etag: Option<Bytes>,
    /// Encrypted segment contents, stored directly in the row.
    pub data: Bytes,
}

/// Persists an inline segment row (spec §4.5, "CommitInlineSegment").
#[instrument(skip(adapter, req), fields(stream_id = ?req.stream_id, position = %req.position))]
pub async fn commit_inline_segment(
    adapter: &dyn Adapter,
    req: CommitInlineSegmentRequest,
) -> Result<()> {
    adapter
        .insert_segment(Segment {
            stream_id: req.stream_id,
            position: req.position,
            expires_at: req.expires_at,
            encrypted_key: req.encrypted_key,
            encrypted_key_nonce: req.encrypted_key_nonce,
            encrypted_size: req.data.len() as i32,
            plain_size: req.plain_size,
            plain_offset: 0,
            encrypted_etag: req.encrypted_etag,
            redundancy: RedundancyScheme {
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
        })
        .await
}

/// Request to conditionally replace a segment's piece-set, e.g. after
/// repair (spec §4.5, "UpdateSegmentPieces").
#[derive(Debug, Clone)]
pub struct UpdateSegmentPiecesRequest {
    /// Owning stream.
    pub stream_id: StreamId,
    /// Position within the stream.
    pub position: Position,
    /// Piece-set the caller last observed.
    pub expected_pieces: Vec<crate::model::AliasPiece>,
    /// Root piece id, unchanged by a repair.
    pub root_piece_id: uuid::Uuid,
    /// Piece-set to install.
    pub new_pieces: Vec<crate::model::AliasPiece>,
}

/// Optimistically updates a remote segment's piece-set, failing with
/// `ValueChanged` if another writer updated it first.
#[instrument(skip(adapter, req), fields(stream_id = ?req.stream_id, position = %req.position))]
pub async fn update_segment_pieces(
    adapter: &dyn Adapter,
    req: UpdateSegmentPiecesRequest,
) -> Result<()> {
    let expected = SegmentContents::Remote {
        root_piece_id: req.root_piece_id,
        pieces: req.expected_pieces,
    };
    let new = SegmentContents::Remote {
        root_piece_id: req.root_piece_id,
        pieces: req.new_pieces,
    };
    adapter
        .update_segment_pieces(req.stream_id, req.position, &expected, new)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::MemoryAdapter;
    use crate::config::Config;
    use crate::model::{AliasPiece, BucketName, ObjectKey, ProjectId};
    use crate::objects::{begin_object_next_version, BeginObjectNextVersionRequest};
    use uuid::Uuid;

    async fn pending_stream() -> (MemoryAdapter, StreamId) {
        let adapter = MemoryAdapter::new();
        let config = Config::default();
        let location = crate::model::ObjectLocation {
            project_id: ProjectId(Uuid::new_v4()),
            bucket_name: BucketName("bucket".into()),
            object_key: ObjectKey::from("a"),
        };
        let pending = begin_object_next_version(
            &adapter,
            &config,
            BeginObjectNextVersionRequest {
                location,
                expires_at: None,
                retention: crate::model::Retention::none(),
                legal_hold: false,
            },
        )
        .await
        .unwrap();
        (adapter, pending.stream_id)
    }

    #[tokio::test]
    async fn begin_segment_resolves_aliases() {
        let (adapter, stream_id) = pending_stream().await;
        let nodes = vec![NodeId(Uuid::new_v4()), NodeId(Uuid::new_v4())];
        let aliases = begin_segment(
            &adapter,
            BeginSegmentRequest {
                stream_id,
                position: Position { part: 0, index: 0 },
                root_piece_id: Uuid::new_v4(),
                piece_nodes: nodes,
            },
        )
        .await
        .unwrap();
        assert_eq!(aliases.len(), 2);
        assert_ne!(aliases[0], aliases[1]);
    }

    #[tokio::test]
    async fn commit_segment_rejects_insufficient_pieces() {
        let (adapter, stream_id) = pending_stream().await;
        let err = commit_segment(
            &adapter,
            CommitSegmentRequest {
                stream_id,
                position: Position { part: 0, index: 0 },
                expires_at: None,
                encrypted_key: Bytes::new(),
                encrypted_key_nonce: Bytes::new(),
                encrypted_size: 10,
                plain_size: 10,
                plain_offset: 0,
                encrypted_etag: None,
                redundancy: RedundancyScheme {
                    algorithm: 1,
                    share_size: 1,
                    required_shares: 4,
                    repair_shares: 5,
                    optimal_shares: 6,
                    total_shares: 8,
                },
                root_piece_id: Uuid::new_v4(),
                pieces: vec![AliasPiece {
                    alias: 1,
                    piece_num: 0,
                }],
                placement: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn update_segment_pieces_fails_on_stale_expectation() {
        let (adapter, stream_id) = pending_stream().await;
        let root = Uuid::new_v4();
        commit_segment(
            &adapter,
            CommitSegmentRequest {
                stream_id,
                position: Position { part: 0, index: 0 },
                expires_at: None,
                encrypted_key: Bytes::new(),
                encrypted_key_nonce: Bytes::new(),
                encrypted_size: 10,
                plain_size: 10,
                plain_offset: 0,
                encrypted_etag: None,
                redundancy: RedundancyScheme {
                    algorithm: 1,
                    share_size: 1,
                    required_shares: 1,
                    repair_shares: 1,
                    optimal_shares: 1,
                    total_shares: 1,
                },
                root_piece_id: root,
                pieces: vec![AliasPiece {
                    alias: 1,
                    piece_num: 0,
                }],
                placement: None,
            },
        )
        .await
        .unwrap();

        let err = update_segment_pieces(
            &adapter,
            UpdateSegmentPiecesRequest {
                stream_id,
                position: Position { part: 0, index: 0 },
                expected_pieces: vec![AliasPiece {
                    alias: 99,
                    piece_num: 0,
                }],
                root_piece_id: root,
                new_pieces: vec![AliasPiece {
                    alias: 2,
                    piece_num: 0,
                }],
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValueChanged);
    }
}
