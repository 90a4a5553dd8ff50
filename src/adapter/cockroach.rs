//! Distributed-transactional adapter.
//!
//! CockroachDB speaks the Postgres wire protocol, so this reuses
//! `sqlx::PgPool` exactly like [`super::postgres::PostgresAdapter`]. What's
//! different is what the spec calls out in §4.2 and §9: transactions can be
//! aborted for serialization reasons that have nothing to do with the
//! caller's request and must be retried transparently, and a commit is
//! finalized by deleting the pending row and inserting a fresh committed
//! one rather than updating in place, since CockroachDB's optimizer plans
//! range-local inserts more predictably than read-modify-write updates
//! under contention.

use super::sql_common::{
    decode_status, encode_contents, encode_retention, encode_status, object_from_row,
    segment_from_row, translate_sql_error,
};
use super::{
    Adapter, FinalizeCommitRequest, InsertPendingObjectRequest, ListPageRequest, ListRow,
    ZombieSweepRequest,
};
use crate::alias::AliasCache;
use crate::config::Config;
use crate::error::{ErrorKind, MetabaseError, Result};
use crate::health::{Check, HealthCheck};
use crate::model::{
    Object, ObjectLocation, Position, Retention, Segment, SegmentContents, StreamId, Version,
};
use crate::precommit::{ExistingObjectSummary, PrecommitConstraintEvaluator, PrecommitMode};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::future::Future;
use tracing::warn;

/// Adapter backed by a CockroachDB cluster (or any Postgres-wire-compatible
/// distributed store with the same retry semantics).
pub struct CockroachAdapter {
    pool: PgPool,
    aliases: AliasCache,
    evaluator: PrecommitConstraintEvaluator,
    max_retries: u32,
}

impl CockroachAdapter {
    /// Opens a connection pool against `database_url` using `config`'s
    /// concurrency and retry settings.
    pub async fn connect(database_url: &str, config: &Config) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_concurrent_transactions as u32)
            .connect(database_url)
            .await
            .map_err(translate_sql_error)?;

        if let Some(delay) = config.max_commit_delay {
            sqlx::query("SET CLUSTER SETTING kv.transaction.max_commit_delay = $1")
                .bind(delay.as_nanos() as i64)
                .execute(&pool)
                .await
                .map_err(translate_sql_error)?;
        }

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
            max_retries: config.max_transaction_retries,
        })
    }

    /// Runs `body` up to `self.max_retries + 1` times, retrying only on
    /// [`ErrorKind::Retriable`] errors. Mirrors the client-side retry loop
    /// CockroachDB's own docs recommend around `SERIALIZABLE` transactions.
    async fn with_retries<T, F, Fut>(&self, mut body: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match body().await {
                Ok(value) => return Ok(value),
                Err(err) if err.kind() == ErrorKind::Retriable && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(attempt, "retrying transaction after serialization failure");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl Adapter for CockroachAdapter {
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
        self.with_retries(|| async {
            let mut tx = self.pool.begin().await.map_err(translate_sql_error)?;

            let existing = self.fetch_existing_at_location(&req.location).await?;
            let decision = self.evaluator.evaluate(Utc::now(), mode, &existing)?;
            let version = req.exact_version.unwrap_or(decision.highest_version + 1);

            if !decision.deleted_versions.is_empty() {
                sqlx::query(
                    "DELETE FROM segments WHERE stream_id IN (
                        SELECT stream_id FROM objects
                        WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3
                          AND version = ANY($4)
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
                     WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3
                       AND version = ANY($4)",
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
        })
        .await
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
        self.with_retries(|| async {
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
            .bind(&pieces)
            .bind(&inline_data)
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
        })
        .await
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
        self.with_retries(|| async {
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
            .bind(&new_pieces)
            .bind(&new_inline)
            .bind(stream_id.0)
            .bind(position.encode() as i64)
            .bind(expected_root)
            .bind(&expected_pieces)
            .bind(&expected_inline)
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
        })
        .await
    }

    async fn rewrite_segment_offset(
        &self,
        stream_id: StreamId,
        position: Position,
        plain_offset: i64,
    ) -> Result<()> {
        self.with_retries(|| async {
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
        })
        .await
    }

    /// Finalizes a commit by deleting the pending row (and any precommit
    /// victims) and inserting a fresh committed row, rather than updating
    /// the pending row in place (spec §4.2, §9): under Cockroach's
    /// optimistic concurrency control a blind `UPDATE` on a row that has
    /// already been touched by the segment inserts in this same
    /// transaction is more likely to hit a serialization conflict than an
    /// insert of a brand new row at the final key.
    async fn finalize_commit(&self, req: FinalizeCommitRequest) -> Result<Object> {
        self.with_retries(|| async {
            let mut tx = self.pool.begin().await.map_err(translate_sql_error)?;

            let pending = sqlx::query(
                "SELECT project_id, bucket_name, object_key, version, stream_id, status,
                    created_at, expires_at, segment_count, total_plain_size,
                    total_encrypted_size, fixed_segment_size, zombie_deletion_deadline,
                    retention_mode, retain_until, cipher_suite, encryption_block_size,
                    encrypted_metadata_nonce, encrypted_metadata,
                    encrypted_metadata_encrypted_key, encrypted_etag
                 FROM objects
                 WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3
                   AND version = $4 AND status = 0
                 FOR UPDATE",
            )
            .bind(req.location.project_id.0)
            .bind(&req.location.bucket_name.0)
            .bind(req.location.object_key.as_bytes())
            .bind(req.version)
            .fetch_optional(&mut *tx)
            .await
            .map_err(translate_sql_error)?
            .ok_or(MetabaseError::PendingObjectMissing)?;
            let pending = object_from_row(&pending)?;

            let mut delete_versions = req.decision.deleted_versions.clone();
            delete_versions.push(req.version);

            sqlx::query(
                "DELETE FROM objects
                 WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3
                   AND version = ANY($4)",
            )
            .bind(req.location.project_id.0)
            .bind(&req.location.bucket_name.0)
            .bind(req.location.object_key.as_bytes())
            .bind(&delete_versions)
            .execute(&mut *tx)
            .await
            .map_err(translate_sql_error)?;

            sqlx::query(
                "DELETE FROM segments WHERE stream_id IN (
                    SELECT stream_id FROM objects
                    WHERE project_id = $1 AND bucket_name = $2 AND object_key = $3
                      AND version = ANY($4)
                 )",
            )
            .bind(req.location.project_id.0)
            .bind(&req.location.bucket_name.0)
            .bind(req.location.object_key.as_bytes())
            .bind(&req.decision.deleted_versions)
            .execute(&mut *tx)
            .await
            .map_err(translate_sql_error)?;

            let encryption = req.encryption.or(pending.encryption);
            let (cipher_suite, block_size) = encryption
                .map(|e| (Some(e.cipher_suite as i16), Some(e.block_size)))
                .unwrap_or((None, None));

            let row = sqlx::query(
                "INSERT INTO objects (
                    project_id, bucket_name, object_key, version, stream_id, status,
                    created_at, expires_at, segment_count, total_plain_size,
                    total_encrypted_size, fixed_segment_size, zombie_deletion_deadline,
                    retention_mode, retain_until, cipher_suite, encryption_block_size,
                    encrypted_metadata_nonce, encrypted_metadata,
                    encrypted_metadata_encrypted_key, encrypted_etag
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NULL, $12, $13, $14, $15, $16, $17, $18, $19)
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
            .bind(req.version)
            .bind(req.stream_id.0)
            .bind(encode_status(req.new_status))
            .bind(pending.created_at)
            .bind(pending.expires_at)
            .bind(req.segment_count)
            .bind(req.total_plain_size)
            .bind(req.total_encrypted_size)
            .bind(req.fixed_segment_size)
            .bind(encode_retention(pending.retention, pending.legal_hold))
            .bind(pending.retention.retain_until)
            .bind(cipher_suite)
            .bind(block_size)
            .bind(req.encrypted_metadata.nonce.as_deref())
            .bind(req.encrypted_metadata.encrypted_metadata.as_deref())
            .bind(req.encrypted_metadata.encrypted_key.as_deref())
            .bind(req.encrypted_metadata.encrypted_etag.as_deref())
            .fetch_one(&mut *tx)
            .await
            .map_err(translate_sql_error)?;

            let object = object_from_row(&row)?;
            tx.commit().await.map_err(translate_sql_error)?;
            Ok(object)
        })
        .await
    }

    async fn set_retention(
        &self,
        location: &ObjectLocation,
        version: Version,
        retention: Retention,
        legal_hold: Option<bool>,
    ) -> Result<Object> {
        self.with_retries(|| async {
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
        })
        .await
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
        self.with_retries(|| async {
            let mut tx = self.pool.begin().await.map_err(translate_sql_error)?;

            let deleted = sqlx::query(
                "DELETE FROM objects WHERE (project_id, bucket_name, object_key, version) IN (
                    SELECT project_id, bucket_name, object_key, version FROM objects
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

            let stream_ids: Vec<uuid::Uuid> =
                deleted.iter().map(|row| row.get("stream_id")).collect();
            if !stream_ids.is_empty() {
                sqlx::query("DELETE FROM segments WHERE stream_id = ANY($1)")
                    .bind(&stream_ids)
                    .execute(&mut *tx)
                    .await
                    .map_err(translate_sql_error)?;
            }

            tx.commit().await.map_err(translate_sql_error)?;
            Ok(deleted.len())
        })
        .await
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
        Ok(report)
    }

    fn alias_cache(&self) -> &AliasCache {
        &self.aliases
    }
}
