//! SQL-relational adapter.
//!
//! Ordinary `sqlx` interactive transactions against a single Postgres
//! primary. A commit finalizes a pending object with a plain in-place
//! `UPDATE` (spec §4.2): there is one writer per row and no contention to
//! design around beyond standard row locking.

use super::sql_common::{
    decode_status, encode_contents, encode_retention, encode_status, object_from_row,
    segment_from_row, translate_sql_error,
};
use super::{
    Adapter, FinalizeCommitRequest, InsertPendingObjectRequest, ListPageRequest, ListRow,
    ZombieSweepRequest,
};
use crate::alias::AliasCache;
use crate::error::{MetabaseError, Result};
use crate::health::{Check, HealthCheck};
use crate::model::{
    Object, ObjectLocation, Position, Retention, Segment, SegmentContents, StreamId, Version,
};
use crate::precommit::{ExistingObjectSummary, PrecommitConstraintEvaluator, PrecommitMode};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

/// Adapter backed by a single Postgres (or Postgres-compatible,
/// non-distributed) primary.
pub struct PostgresAdapter {
    pool: PgPool,
    aliases: AliasCache,
    evaluator: PrecommitConstraintEvaluator,
    max_concurrent_transactions: usize,
}

impl PostgresAdapter {
    /// Opens a connection pool against `database_url` and loads the
    /// existing node-alias table into memory.
    pub async fn connect(database_url: &str, max_concurrent_transactions: usize) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_concurrent_transactions as u32)
            .connect(database_url)
            .await
            .map_err(translate_sql_error)?;

        let rows = sqlx::query("SELECT node_id, alias FROM node_aliases")
            .fetch_all(&pool)
            .await
            .map_err(translate_sql_error)?;

        let pairs = rows
            .iter()
            .map(|row| {
                let node_id: uuid::Uuid = row.get("node_id");
                let alias: i64 = row.get("alias");
                (crate::model::NodeId(node_id), alias as u32)
            })
            .collect::<Vec<_>>();

        Ok(Self {
            pool,
            aliases: AliasCache::from_pairs(pairs),
            evaluator: PrecommitConstraintEvaluator::new(),
            max_concurrent_transactions,
        })
    }

    /// Wraps an already-open pool, skipping the alias preload. Useful for
    /// tests that seed the alias table separately.
    pub fn from_pool(pool: PgPool, max_concurrent_transactions: usize) -> Self {
        Self {
            pool,
            aliases: AliasCache::new(),
            evaluator: PrecommitConstraintEvaluator::new(),
            max_concurrent_transactions,
        }
    }
}

#[async_trait]
impl Adapter for PostgresAdapter {
    async fn fetch_existing_at_location(
        &self,
        location: &ObjectLocation,
    ) -> Result<Vec<ExistingObjectSummary>> {
        let rows = sqlx::query(
            "SELECT version, status, segment_count, retention_mode, retain_until,
                    zombie_deletion_deadline
             FROM objects WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3",
        )
        .bind(location.project_id.0)
        .bind(&location.bucket_name.0)
        .bind(location.object_key.as_bytes())
        .fetch_all(&self.pool)
        .await
        .map_err(translate_sql_error)?;

        rows.iter()
            .map(|row| {
                let status_code: i16 = row.try_get("status").map_err(translate_sql_error)?;
                let retention_byte: i16 =
                    row.try_get("retention_mode").map_err(translate_sql_error)?;
                let (mode, legal_hold) =
                    crate::model::unpack_retention_mode(retention_byte as u8);
                Ok(ExistingObjectSummary {
                    version: row.try_get("version").map_err(translate_sql_error)?,
                    status: decode_status(status_code)?,
                    segment_count: row.try_get("segment_count").map_err(translate_sql_error)?,
                    retention: Retention {
                        mode,
                        retain_until: row.try_get("retain_until").map_err(translate_sql_error)?,
                    },
                    legal_hold,
                    zombie_deletion_deadline: row
                        .try_get("zombie_deletion_deadline")
                        .map_err(translate_sql_error)?,
                })
            })
            .collect()
    }

    async fn insert_pending_object(
        &self,
        req: InsertPendingObjectRequest,
        mode: PrecommitMode,
    ) -> Result<Object> {
        let mut tx = self.pool.begin().await.map_err(translate_sql_error)?;

        let existing = self.fetch_existing_at_location(&req.location).await?;
        let decision = self.evaluator.evaluate(Utc::now(), mode, &existing)?;
        let version = req.exact_version.unwrap_or(decision.highest_version + 1);

        if !decision.deleted_versions.is_empty() {
            sqlx::query(
                "DELETE FROM segments WHERE stream_id IN (
                    SELECT stream_id FROM objects
                    WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3 AND version = ANY($4)
                 )",
            )
            .bind(req.location.project_id.0)
            .bind(&req.location.bucket_name.0)
            .bind(req.location.object_key.as_bytes())
            .bind(&decision.deleted_versions)
            .execute(&mut *tx)
            .await
            .map_err(translate_sql_error)?;

            sqlx::query(
                "DELETE FROM objects
                 WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3 AND version = ANY($4)",
            )
            .bind(req.location.project_id.0)
            .bind(&req.location.bucket_name.0)
            .bind(req.location.object_key.as_bytes())
            .bind(&decision.deleted_versions)
            .execute(&mut *tx)
            .await
            .map_err(translate_sql_error)?;
        }

        let row = sqlx::query(
            "INSERT INTO objects (
                project_id, bucket_name, object_key, version, stream_id, status,
                created_at, expires_at, segment_count, total_plain_size,
                total_encrypted_size, fixed_segment_size, zombie_deletion_deadline,
                retention_mode, retain_until
             ) VALUES ($1, $2, $3, $4, $5, 0, now(), $6, 0, 0, 0, -1, $7, $8, $9)
             RETURNING project_id, bucket_name, object_key, version, stream_id, status,
                created_at, expires_at, segment_count, total_plain_size,
                total_encrypted_size, fixed_segment_size, zombie_deletion_deadline,
                retention_mode, retain_until, cipher_suite, encryption_block_size,
                encrypted_metadata_nonce, encrypted_metadata,
                encrypted_metadata_encrypted_key, encrypted_etag",
        )
        .bind(req.location.project_id.0)
        .bind(&req.location.bucket_name.0)
        .bind(req.location.object_key.as_bytes())
        .bind(version)
        .bind(req.stream_id.0)
        .bind(req.expires_at)
        .bind(req.zombie_deletion_deadline)
        .bind(encode_retention(req.retention, req.legal_hold))
        .bind(req.retention.retain_until)
        .fetch_one(&mut *tx)
        .await
        .map_err(translate_sql_error)?;

        let object = object_from_row(&row)?;
        tx.commit().await.map_err(translate_sql_error)?;
        Ok(object)
    }

    async fn fetch_pending_object(&self, stream_id: StreamId) -> Result<Option<Object>> {
        let row = sqlx::query(
            "SELECT project_id, bucket_name, object_key, version, stream_id, status,
                created_at, expires_at, segment_count, total_plain_size,
                total_encrypted_size, fixed_segment_size, zombie_deletion_deadline,
                retention_mode, retain_until, cipher_suite, encryption_block_size,
                encrypted_metadata_nonce, encrypted_metadata,
                encrypted_metadata_encrypted_key, encrypted_etag
             FROM objects WHERE stream_id = $1 AND status = 0",
        )
        .bind(stream_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(translate_sql_error)?;

        row.map(|r| object_from_row(&r)).transpose()
    }

    async fn insert_segment(&self, segment: Segment) -> Result<()> {
        let (root_piece_id, pieces, inline_data) = encode_contents(&segment.contents);
        sqlx::query(
            "INSERT INTO segments (
                stream_id, position, expires_at, root_piece_id, pieces, inline_data,
                encrypted_key_nonce, encrypted_key, encrypted_size, plain_size,
                plain_offset, encrypted_etag, redundancy_algorithm, redundancy_share_size,
                redundancy_required_shares, redundancy_repair_shares,
                redundancy_optimal_shares, redundancy_total_shares, placement, repaired_at
             ) SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
               WHERE EXISTS (SELECT 1 FROM objects WHERE stream_id = $1)",
        )
        .bind(segment.stream_id.0)
        .bind(segment.position.encode() as i64)
        .bind(segment.expires_at)
        .bind(root_piece_id)
        .bind(pieces)
        .bind(inline_data)
        .bind(segment.encrypted_key_nonce.as_ref())
        .bind(segment.encrypted_key.as_ref())
        .bind(segment.encrypted_size)
        .bind(segment.plain_size)
        .bind(segment.plain_offset)
        .bind(segment.encrypted_etag.as_deref())
        .bind(segment.redundancy.algorithm as i16)
        .bind(segment.redundancy.share_size)
        .bind(segment.redundancy.required_shares)
        .bind(segment.redundancy.repair_shares)
        .bind(segment.redundancy.optimal_shares)
        .bind(segment.redundancy.total_shares)
        .bind(segment.placement)
        .bind(segment.repaired_at)
        .execute(&self.pool)
        .await
        .map_err(translate_sql_error)?;
        Ok(())
    }

    async fn fetch_segment(
        &self,
        stream_id: StreamId,
        position: Position,
    ) -> Result<Option<Segment>> {
        let row = sqlx::query(
            "SELECT stream_id, position, expires_at, root_piece_id, pieces, inline_data,
                encrypted_key_nonce, encrypted_key, encrypted_size, plain_size,
                plain_offset, encrypted_etag, redundancy_algorithm, redundancy_share_size,
                redundancy_required_shares, redundancy_repair_shares,
                redundancy_optimal_shares, redundancy_total_shares, placement, repaired_at
             FROM segments WHERE stream_id = $1 AND position = $2",
        )
        .bind(stream_id.0)
        .bind(position.encode() as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(translate_sql_error)?;

        row.map(|r| segment_from_row(&r)).transpose()
    }

    async fn fetch_segments(&self, stream_id: StreamId) -> Result<Vec<Segment>> {
        let rows = sqlx::query(
            "SELECT stream_id, position, expires_at, root_piece_id, pieces, inline_data,
                encrypted_key_nonce, encrypted_key, encrypted_size, plain_size,
                plain_offset, encrypted_etag, redundancy_algorithm, redundancy_share_size,
                redundancy_required_shares, redundancy_repair_shares,
                redundancy_optimal_shares, redundancy_total_shares, placement, repaired_at
             FROM segments WHERE stream_id = $1 ORDER BY position ASC",
        )
        .bind(stream_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(translate_sql_error)?;

        rows.iter().map(segment_from_row).collect()
    }

    async fn update_segment_pieces(
        &self,
        stream_id: StreamId,
        position: Position,
        expected: &SegmentContents,
        new: SegmentContents,
    ) -> Result<()> {
        let (expected_root, expected_pieces, expected_inline) = encode_contents(expected);
        let (new_root, new_pieces, new_inline) = encode_contents(&new);

        let result = sqlx::query(
            "UPDATE segments SET root_piece_id = $1, pieces = $2, inline_data = $3
             WHERE stream_id = $4 AND position = $5
               AND root_piece_id IS NOT DISTINCT FROM $6
               AND pieces IS NOT DISTINCT FROM $7
               AND inline_data IS NOT DISTINCT FROM $8",
        )
        .bind(new_root)
        .bind(new_pieces)
        .bind(new_inline)
        .bind(stream_id.0)
        .bind(position.encode() as i64)
        .bind(expected_root)
        .bind(expected_pieces)
        .bind(expected_inline)
        .execute(&self.pool)
        .await
        .map_err(translate_sql_error)?;

        if result.rows_affected() == 0 {
            let exists = self.fetch_segment(stream_id, position).await?;
            return Err(if exists.is_some() {
                MetabaseError::ValueChanged
            } else {
                MetabaseError::SegmentNotFound
            });
        }
        Ok(())
    }

    async fn rewrite_segment_offset(
        &self,
        stream_id: StreamId,
        position: Position,
        plain_offset: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE segments SET plain_offset = $1 WHERE stream_id = $2 AND position = $3",
        )
        .bind(plain_offset)
        .bind(stream_id.0)
        .bind(position.encode() as i64)
        .execute(&self.pool)
        .await
        .map_err(translate_sql_error)?;

        if result.rows_affected() == 0 {
            return Err(MetabaseError::SegmentNotFound);
        }
        Ok(())
    }

    async fn finalize_commit(&self, req: FinalizeCommitRequest) -> Result<Object> {
        let mut tx = self.pool.begin().await.map_err(translate_sql_error)?;

        if !req.decision.deleted_versions.is_empty() {
            sqlx::query(
                "DELETE FROM segments WHERE stream_id IN (
                    SELECT stream_id FROM objects
                    WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3 AND version = ANY($4)
                 )",
            )
            .bind(req.location.project_id.0)
            .bind(&req.location.bucket_name.0)
            .bind(req.location.object_key.as_bytes())
            .bind(&req.decision.deleted_versions)
            .execute(&mut *tx)
            .await
            .map_err(translate_sql_error)?;

            sqlx::query(
                "DELETE FROM objects
                 WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3 AND version = ANY($4)",
            )
            .bind(req.location.project_id.0)
            .bind(&req.location.bucket_name.0)
            .bind(req.location.object_key.as_bytes())
            .bind(&req.decision.deleted_versions)
            .execute(&mut *tx)
            .await
            .map_err(translate_sql_error)?;
        }

        let (cipher_suite, block_size) = req
            .encryption
            .map(|e| (Some(e.cipher_suite as i16), Some(e.block_size)))
            .unwrap_or((None, None));

        let row = sqlx::query(
            "UPDATE objects SET status = $1, segment_count = $2, total_plain_size = $3,
                total_encrypted_size = $4, fixed_segment_size = $5,
                encrypted_metadata_nonce = $6, encrypted_metadata = $7,
                encrypted_metadata_encrypted_key = $8, encrypted_etag = $9,
                cipher_suite = COALESCE($10, cipher_suite),
                encryption_block_size = COALESCE($11, encryption_block_size),
                zombie_deletion_deadline = NULL
             WHERE project_id = $12 AND bucket_name = $13 AND object_key = $14
               AND version = $15 AND status = 0
             RETURNING project_id, bucket_name, object_key, version, stream_id, status,
                created_at, expires_at, segment_count, total_plain_size,
                total_encrypted_size, fixed_segment_size, zombie_deletion_deadline,
                retention_mode, retain_until, cipher_suite, encryption_block_size,
                encrypted_metadata_nonce, encrypted_metadata,
                encrypted_metadata_encrypted_key, encrypted_etag",
        )
        .bind(encode_status(req.new_status))
        .bind(req.segment_count)
        .bind(req.total_plain_size)
        .bind(req.total_encrypted_size)
        .bind(req.fixed_segment_size)
        .bind(req.encrypted_metadata.nonce.as_deref())
        .bind(req.encrypted_metadata.encrypted_metadata.as_deref())
        .bind(req.encrypted_metadata.encrypted_key.as_deref())
        .bind(req.encrypted_metadata.encrypted_etag.as_deref())
        .bind(cipher_suite)
        .bind(block_size)
        .bind(req.location.project_id.0)
        .bind(&req.location.bucket_name.0)
        .bind(req.location.object_key.as_bytes())
        .bind(req.version)
        .fetch_optional(&mut *tx)
        .await
        .map_err(translate_sql_error)?
        .ok_or(MetabaseError::PendingObjectMissing)?;

        let object = object_from_row(&row)?;
        tx.commit().await.map_err(translate_sql_error)?;
        Ok(object)
    }

    async fn set_retention(
        &self,
        location: &ObjectLocation,
        version: Version,
        retention: Retention,
        legal_hold: Option<bool>,
    ) -> Result<Object> {
        let row = sqlx::query(
            "UPDATE objects SET
                retention_mode = CASE WHEN $1::smallint IS NOT NULL
                    THEN ($1::smallint & 127) | (retention_mode & 128) ELSE retention_mode END,
                retain_until = $2
             WHERE project_id = $3 AND bucket_name = $4 AND object_key = $5 AND version = $6
             RETURNING project_id, bucket_name, object_key, version, stream_id, status,
                created_at, expires_at, segment_count, total_plain_size,
                total_encrypted_size, fixed_segment_size, zombie_deletion_deadline,
                retention_mode, retain_until, cipher_suite, encryption_block_size,
                encrypted_metadata_nonce, encrypted_metadata,
                encrypted_metadata_encrypted_key, encrypted_etag",
        )
        .bind(encode_retention(retention, legal_hold.unwrap_or(false)) as i16)
        .bind(retention.retain_until)
        .bind(location.project_id.0)
        .bind(&location.bucket_name.0)
        .bind(location.object_key.as_bytes())
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(translate_sql_error)?
        .ok_or(MetabaseError::ObjectNotFound("object"))?;

        object_from_row(&row)
    }

    async fn get_object(
        &self,
        location: &ObjectLocation,
        version: Option<Version>,
    ) -> Result<Option<Object>> {
        let row = match version {
            Some(v) => sqlx::query(
                "SELECT project_id, bucket_name, object_key, version, stream_id, status,
                    created_at, expires_at, segment_count, total_plain_size,
                    total_encrypted_size, fixed_segment_size, zombie_deletion_deadline,
                    retention_mode, retain_until, cipher_suite, encryption_block_size,
                    encrypted_metadata_nonce, encrypted_metadata,
                    encrypted_metadata_encrypted_key, encrypted_etag
                 FROM objects
                 WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3 AND version = $4",
            )
            .bind(location.project_id.0)
            .bind(&location.bucket_name.0)
            .bind(location.object_key.as_bytes())
            .bind(v)
            .fetch_optional(&self.pool)
            .await
            .map_err(translate_sql_error)?,
            None => sqlx::query(
                "SELECT project_id, bucket_name, object_key, version, stream_id, status,
                    created_at, expires_at, segment_count, total_plain_size,
                    total_encrypted_size, fixed_segment_size, zombie_deletion_deadline,
                    retention_mode, retain_until, cipher_suite, encryption_block_size,
                    encrypted_metadata_nonce, encrypted_metadata,
                    encrypted_metadata_encrypted_key, encrypted_etag
                 FROM objects
                 WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3
                   AND status IN (1, 3)
                 ORDER BY version DESC LIMIT 1",
            )
            .bind(location.project_id.0)
            .bind(&location.bucket_name.0)
            .bind(location.object_key.as_bytes())
            .fetch_optional(&self.pool)
            .await
            .map_err(translate_sql_error)?,
        };

        row.map(|r| object_from_row(&r)).transpose()
    }

    async fn list_page(&self, req: ListPageRequest) -> Result<Vec<ListRow>> {
        let rows = sqlx::query(
            "SELECT object_key, version, status, stream_id, created_at
             FROM objects
             WHERE project_id = $1 AND bucket_name = $2
               AND object_key LIKE ($3 || '%')
               AND (object_key, version) > ($4, $5)
               AND ($6 OR status != 0)
             ORDER BY object_key ASC, version ASC
             LIMIT $7",
        )
        .bind(req.project_id.0)
        .bind(&req.bucket_name.0)
        .bind(req.prefix.as_ref())
        .bind(req.cursor_key.as_ref())
        .bind(req.cursor_version)
        .bind(req.include_pending)
        .bind(req.batch_size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(translate_sql_error)?;

        let mut result = Vec::with_capacity(rows.len());
        for row in &rows {
            let status_code: i16 = row.try_get("status").map_err(translate_sql_error)?;
            result.push(ListRow {
                object_key: crate::model::ObjectKey(bytes::Bytes::from(
                    row.try_get::<Vec<u8>, _>("object_key").map_err(translate_sql_error)?,
                )),
                version: row.try_get("version").map_err(translate_sql_error)?,
                status: decode_status(status_code)?,
                stream_id: StreamId(row.try_get("stream_id").map_err(translate_sql_error)?),
                created_at: row.try_get("created_at").map_err(translate_sql_error)?,
            });
        }

        if !req.all_versions {
            result.dedup_by(|a, b| a.object_key == b.object_key);
        }
        Ok(result)
    }

    async fn zombie_sweep(&self, req: ZombieSweepRequest) -> Result<usize> {
        let as_of = req.as_of.unwrap_or_else(Utc::now);
        let mut tx = self.pool.begin().await.map_err(translate_sql_error)?;

        let deleted = sqlx::query(
            "DELETE FROM objects WHERE ctid IN (
                SELECT ctid FROM objects
                WHERE status = 0 AND zombie_deletion_deadline <= $1
                LIMIT $2
             )
             RETURNING stream_id",
        )
        .bind(as_of)
        .bind(req.batch_size as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(translate_sql_error)?;

        let stream_ids: Vec<uuid::Uuid> = deleted.iter().map(|row| row.get("stream_id")).collect();
        if !stream_ids.is_empty() {
            sqlx::query("DELETE FROM segments WHERE stream_id = ANY($1)")
                .bind(&stream_ids)
                .execute(&mut *tx)
                .await
                .map_err(translate_sql_error)?;
        }

        tx.commit().await.map_err(translate_sql_error)?;
        Ok(deleted.len())
    }

    async fn health(&self) -> Result<HealthCheck> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(translate_sql_error)?;

        let mut report = HealthCheck::new();
        let size = self.pool.size() as f64;
        let idle = self.pool.num_idle() as f64;
        let saturation = if size > 0.0 { 1.0 - idle / size } else { 0.0 };
        report.add_check(Check::PoolSaturation {
            current: saturation,
            threshold: 0.9,
            healthy: saturation < 0.9,
        });
        report.add_check(Check::OpenTransactions {
            count: self.pool.size() as usize,
            limit: self.max_concurrent_transactions,
            healthy: (self.pool.size() as usize) < self.max_concurrent_transactions,
        });
        Ok(report)
    }

    fn alias_cache(&self) -> &AliasCache {
        &self.aliases
    }
}
