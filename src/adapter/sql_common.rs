//! Shared plumbing for the two SQL-backed adapters.
//!
//! `PostgresAdapter` and `CockroachAdapter` both speak to a Postgres-wire
//! backend through `sqlx::PgPool` and share row shapes, column mapping, and
//! driver-error translation; they differ only in transaction-retry policy
//! and in how a commit is finalized (spec §4.2, §9). Splitting that common
//! plumbing out here keeps each adapter file focused on what's actually
//! different about it, the way the teacher splits page-level mechanics
//! (`db/core/records.rs`) from the operations built on top of it
//! (`db/core/nodes.rs`).

use crate::error::{ErrorKind, MetabaseError, Result};
use crate::model::{
    AliasPiece, EncryptedMetadata, EncryptionParameters, Object, ObjectKey, ObjectLocation,
    ObjectStatus, Position, RedundancyScheme, Retention, Segment, SegmentContents, StreamId,
};
use crate::model::{decode_alias_pieces, encode_alias_pieces, pack_retention_mode, unpack_retention_mode};
use bytes::Bytes;
use sqlx::postgres::PgRow;
use sqlx::Row;

/// Translates a raw `sqlx::Error` into a [`MetabaseError`], matching
/// Postgres SQLSTATE codes to the spec's error kinds (spec §7).
///
/// Constraint names (`objects_pkey`, `pending_object_fk`) are expected to
/// match the schema migrations shipped alongside this crate; adapters that
/// run against a differently-named schema should wrap this with their own
/// translation for the names they use.
pub fn translate_sql_error(err: sqlx::Error) -> MetabaseError {
    let Some(db_err) = err.as_database_error() else {
        return MetabaseError::Internal(err.to_string());
    };

    let Some(code) = db_err.code() else {
        return MetabaseError::Internal(db_err.to_string());
    };

    match code.as_ref() {
        // unique_violation
        "23505" => MetabaseError::ObjectAlreadyExists { version: -1 },
        // foreign_key_violation / not_null_violation on the pending-parent lookup
        "23503" | "23502" => MetabaseError::PendingObjectMissing,
        // serialization_failure / deadlock_detected / connection loss: retry
        "40001" | "40P01" | "08006" | "08003" => {
            MetabaseError::Retriable(db_err.message().to_string())
        }
        _ => MetabaseError::Internal(db_err.message().to_string()),
    }
}

/// Classifies a kind as worth a transaction retry without going through a
/// full driver error (used after our own checks, e.g. a `ValueChanged`
/// surfaced mid-closure on the distributed adapter).
pub fn is_retriable_kind(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::Retriable)
}

/// Builds an `Object` from a row produced by any of this module's `SELECT`
/// statements against the `objects` table. Column order is fixed across all
/// call sites so this can stay a single function.
pub fn object_from_row(row: &PgRow) -> Result<Object> {
    let status_code: i16 = row.try_get("status").map_err(sqlx_err)?;
    let status = decode_status(status_code)?;

    let retention_byte: i16 = row.try_get("retention_mode").map_err(sqlx_err)?;
    let (mode, legal_hold) = unpack_retention_mode(retention_byte as u8);

    let cipher_suite: Option<i16> = row.try_get("cipher_suite").map_err(sqlx_err)?;
    let block_size: Option<i32> = row.try_get("encryption_block_size").map_err(sqlx_err)?;
    let encryption = cipher_suite.map(|cs| EncryptionParameters {
        cipher_suite: cs as u8,
        block_size: block_size.unwrap_or(0),
    });

    Ok(Object {
        location: ObjectLocation {
            project_id: crate::model::ProjectId(row.try_get("project_id").map_err(sqlx_err)?),
            bucket_name: crate::model::BucketName(row.try_get("bucket_name").map_err(sqlx_err)?),
            object_key: ObjectKey(Bytes::from(row.try_get::<Vec<u8>, _>("object_key").map_err(sqlx_err)?)),
        },
        version: row.try_get("version").map_err(sqlx_err)?,
        stream_id: StreamId(row.try_get("stream_id").map_err(sqlx_err)?),
        status,
        created_at: row.try_get("created_at").map_err(sqlx_err)?,
        expires_at: row.try_get("expires_at").map_err(sqlx_err)?,
        encryption,
        encrypted_metadata: EncryptedMetadata {
            nonce: row
                .try_get::<Option<Vec<u8>>, _>("encrypted_metadata_nonce")
                .map_err(sqlx_err)?
                .map(Bytes::from),
            encrypted_metadata: row
                .try_get::<Option<Vec<u8>>, _>("encrypted_metadata")
                .map_err(sqlx_err)?
                .map(Bytes::from),
            encrypted_key: row
                .try_get::<Option<Vec<u8>>, _>("encrypted_metadata_encrypted_key")
                .map_err(sqlx_err)?
                .map(Bytes::from),
            encrypted_etag: row
                .try_get::<Option<Vec<u8>>, _>("encrypted_etag")
                .map_err(sqlx_err)?
                .map(Bytes::from),
        },
        segment_count: row.try_get("segment_count").map_err(sqlx_err)?,
        total_plain_size: row.try_get("total_plain_size").map_err(sqlx_err)?,
        total_encrypted_size: row.try_get("total_encrypted_size").map_err(sqlx_err)?,
        fixed_segment_size: row.try_get("fixed_segment_size").map_err(sqlx_err)?,
        zombie_deletion_deadline: row.try_get("zombie_deletion_deadline").map_err(sqlx_err)?,
        retention: Retention {
            mode,
            retain_until: row.try_get("retain_until").map_err(sqlx_err)?,
        },
        legal_hold,
    })
}

/// Builds a `Segment` from a row produced by this module's `SELECT`
/// statements against the `segments` table.
pub fn segment_from_row(row: &PgRow) -> Result<Segment> {
    let position_encoded: i64 = row.try_get("position").map_err(sqlx_err)?;
    let position = Position::decode(position_encoded as u64);

    let inline_data: Option<Vec<u8>> = row.try_get("inline_data").map_err(sqlx_err)?;
    let contents = if let Some(data) = inline_data {
        SegmentContents::Inline {
            data: Bytes::from(data),
        }
    } else {
        let root_piece_id: uuid::Uuid = row.try_get("root_piece_id").map_err(sqlx_err)?;
        let pieces_encoded: Vec<u8> = row.try_get("pieces").map_err(sqlx_err)?;
        SegmentContents::Remote {
            root_piece_id,
            pieces: decode_alias_pieces(&pieces_encoded)?,
        }
    };

    Ok(Segment {
        stream_id: StreamId(row.try_get("stream_id").map_err(sqlx_err)?),
        position,
        expires_at: row.try_get("expires_at").map_err(sqlx_err)?,
        encrypted_key: Bytes::from(row.try_get::<Vec<u8>, _>("encrypted_key").map_err(sqlx_err)?),
        encrypted_key_nonce: Bytes::from(
            row.try_get::<Vec<u8>, _>("encrypted_key_nonce").map_err(sqlx_err)?,
        ),
        encrypted_size: row.try_get("encrypted_size").map_err(sqlx_err)?,
        plain_size: row.try_get("plain_size").map_err(sqlx_err)?,
        plain_offset: row.try_get("plain_offset").map_err(sqlx_err)?,
        encrypted_etag: row
            .try_get::<Option<Vec<u8>>, _>("encrypted_etag")
            .map_err(sqlx_err)?
            .map(Bytes::from),
        redundancy: RedundancyScheme {
            algorithm: row.try_get::<i16, _>("redundancy_algorithm").map_err(sqlx_err)? as u8,
            share_size: row.try_get("redundancy_share_size").map_err(sqlx_err)?,
            required_shares: row.try_get("redundancy_required_shares").map_err(sqlx_err)?,
            repair_shares: row.try_get("redundancy_repair_shares").map_err(sqlx_err)?,
            optimal_shares: row.try_get("redundancy_optimal_shares").map_err(sqlx_err)?,
            total_shares: row.try_get("redundancy_total_shares").map_err(sqlx_err)?,
        },
        contents,
        placement: row.try_get("placement").map_err(sqlx_err)?,
        repaired_at: row.try_get("repaired_at").map_err(sqlx_err)?,
    })
}

/// Encodes a segment's piece-set for storage, used by insert/update paths.
pub fn encode_contents(contents: &SegmentContents) -> (Option<uuid::Uuid>, Option<Vec<u8>>, Option<Vec<u8>>) {
    match contents {
        SegmentContents::Remote { root_piece_id, pieces } => {
            (Some(*root_piece_id), Some(encode_alias_pieces(pieces).to_vec()), None)
        }
        SegmentContents::Inline { data } => (None, None, Some(data.to_vec())),
    }
}

/// Inverse of [`encode_status`]; shared by both SQL adapters so the status
/// code mapping lives in exactly one place.
pub fn decode_status(code: i16) -> Result<ObjectStatus> {
    Ok(match code {
        0 => ObjectStatus::Pending,
        1 => ObjectStatus::CommittedUnversioned,
        2 => ObjectStatus::CommittedVersioned,
        3 => ObjectStatus::DeleteMarkerUnversioned,
        4 => ObjectStatus::DeleteMarkerVersioned,
        other => {
            return Err(MetabaseError::Internal(format!(
                "unrecognized object status code {other}"
            )))
        }
    })
}

/// Inverse of the status decode above, used by insert/update statements.
pub fn encode_status(status: ObjectStatus) -> i16 {
    match status {
        ObjectStatus::Pending => 0,
        ObjectStatus::CommittedUnversioned => 1,
        ObjectStatus::CommittedVersioned => 2,
        ObjectStatus::DeleteMarkerUnversioned => 3,
        ObjectStatus::DeleteMarkerVersioned => 4,
    }
}

/// Packs retention into its storage column value.
pub fn encode_retention(retention: Retention, legal_hold: bool) -> i16 {
    pack_retention_mode(retention.mode, legal_hold) as i16
}

fn sqlx_err(err: sqlx::Error) -> MetabaseError {
    translate_sql_error(err)
}

/// Piece list helper used when translating `AliasPiece` batches for wire
/// encoding in adapters that resolve aliases before storing (kept here so
/// both adapters share the same sort order expectations as
/// `crate::model::encode_alias_pieces`).
pub fn sorted_piece_nums(pieces: &[AliasPiece]) -> Vec<u16> {
    let mut nums: Vec<u16> = pieces.iter().map(|p| p.piece_num).collect();
    nums.sort_unstable();
    nums
}
