//! Top-level entry point tying configuration, metrics, and an adapter
//! together into the operations named in the spec.
//!
//! `Metabase` is deliberately thin: every real decision already lives in
//! `crate::objects`, `crate::segments`, `crate::listing`, and
//! `crate::zombie`, generic over `&dyn Adapter`. This struct's job is to
//! own the adapter and the metrics counters and to be the one place that
//! increments them, the way the teacher's `GraphDB` is the single owner of
//! its `PerformanceMetrics` (`db/core/graphdb.rs`) even though the
//! operations that drive it live in sibling modules.

use crate::adapter::Adapter;
use crate::config::Config;
use crate::error::Result;
use crate::health::HealthCheck;
use crate::listing::{self, ListObjectsRequest, ListObjectsResult};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::model::{Object, ObjectLocation, Retention, Version};
use crate::objects::{
    self,
    retention::{self},
    BeginObjectNextVersionRequest, CommitInlineObjectRequest, CommitObjectRequest,
    DeleteObjectRequest, TestingBeginObjectExactVersionRequest,
};
use crate::segments::{
    self, BeginSegmentRequest, CommitInlineSegmentRequest, CommitSegmentRequest,
    UpdateSegmentPiecesRequest,
};
use crate::zombie;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// The metabase core: owns one adapter and the metrics/config shared across
/// every operation issued against it.
pub struct Metabase {
    adapter: Arc<dyn Adapter>,
    config: Config,
    metrics: Metrics,
}

impl Metabase {
    /// Wraps an adapter with the given tuning configuration.
    pub fn new(adapter: Arc<dyn Adapter>, config: Config) -> Self {
        Self {
            adapter,
            config,
            metrics: Metrics::new(),
        }
    }

    /// Current metrics snapshot (spec §6).
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Configuration this instance is running with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Backend health (spec §10, supplemented from the teacher's
    /// `db::health`).
    pub async fn health(&self) -> Result<HealthCheck> {
        self.adapter.health().await
    }

    /// See [`objects::begin_object_next_version`].
    pub async fn begin_object_next_version(
        &self,
        req: BeginObjectNextVersionRequest,
    ) -> Result<Object> {
        let object = objects::begin_object_next_version(&*self.adapter, &self.config, req).await?;
        self.metrics.object_begin.fetch_add(1, Ordering::Relaxed);
        Ok(object)
    }

    /// See [`objects::testing_begin_object_exact_version`].
    pub async fn testing_begin_object_exact_version(
        &self,
        req: TestingBeginObjectExactVersionRequest,
    ) -> Result<Object> {
        let object =
            objects::testing_begin_object_exact_version(&*self.adapter, &self.config, req).await?;
        self.metrics.object_begin.fetch_add(1, Ordering::Relaxed);
        Ok(object)
    }

    /// See [`objects::commit_object`].
    pub async fn commit_object(&self, req: CommitObjectRequest) -> Result<Object> {
        let (object, _deleted_segments) =
            objects::commit_object(&*self.adapter, &self.config, req).await?;
        self.metrics.object_commit.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .object_commit_segments
            .observe(object.segment_count as u64);
        self.metrics
            .object_commit_encrypted_size
            .observe(object.total_encrypted_size.max(0) as u64);
        Ok(object)
    }

    /// See [`objects::commit_inline_object`].
    pub async fn commit_inline_object(&self, req: CommitInlineObjectRequest) -> Result<Object> {
        let (object, _deleted_segments) =
            objects::commit_inline_object(&*self.adapter, &self.config, req).await?;
        self.metrics.object_begin.fetch_add(1, Ordering::Relaxed);
        self.metrics.object_commit.fetch_add(1, Ordering::Relaxed);
        self.metrics.segment_begin.fetch_add(1, Ordering::Relaxed);
        self.metrics.segment_commit.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .object_commit_segments
            .observe(object.segment_count as u64);
        self.metrics
            .object_commit_encrypted_size
            .observe(object.total_encrypted_size.max(0) as u64);
        Ok(object)
    }

    /// See [`segments::begin_segment`].
    pub async fn begin_segment(&self, req: BeginSegmentRequest) -> Result<Vec<u32>> {
        let aliases = segments::begin_segment(&*self.adapter, req).await?;
        self.metrics.segment_begin.fetch_add(1, Ordering::Relaxed);
        Ok(aliases)
    }

    /// See [`segments::commit_segment`].
    pub async fn commit_segment(&self, req: CommitSegmentRequest) -> Result<()> {
        segments::commit_segment(&*self.adapter, req).await?;
        self.metrics.segment_commit.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// See [`segments::commit_inline_segment`].
    pub async fn commit_inline_segment(&self, req: CommitInlineSegmentRequest) -> Result<()> {
        segments::commit_inline_segment(&*self.adapter, req).await?;
        self.metrics.segment_commit.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// See [`segments::update_segment_pieces`].
    pub async fn update_segment_pieces(&self, req: UpdateSegmentPiecesRequest) -> Result<()> {
        segments::update_segment_pieces(&*self.adapter, req).await?;
        self.metrics.segment_update.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// See [`objects::delete_object`].
    pub async fn delete_object(&self, req: DeleteObjectRequest) -> Result<Object> {
        let marker = objects::delete_object(&*self.adapter, &self.config, req).await?;
        self.metrics.object_begin.fetch_add(1, Ordering::Relaxed);
        self.metrics.object_commit.fetch_add(1, Ordering::Relaxed);
        Ok(marker)
    }

    /// See [`objects::retention::set_object_exact_version_retention`].
    pub async fn set_object_exact_version_retention(
        &self,
        location: &ObjectLocation,
        version: Version,
        retention: Retention,
    ) -> Result<Object> {
        retention::set_object_exact_version_retention(&*self.adapter, location, version, retention)
            .await
    }

    /// See [`objects::retention::set_object_last_committed_retention`].
    pub async fn set_object_last_committed_retention(
        &self,
        location: &ObjectLocation,
        retention: Retention,
    ) -> Result<Object> {
        retention::set_object_last_committed_retention(&*self.adapter, location, retention).await
    }

    /// Fetches a single object (spec §4.1, "GetObject").
    pub async fn get_object(
        &self,
        location: &ObjectLocation,
        version: Option<Version>,
    ) -> Result<Option<Object>> {
        self.adapter.get_object(location, version).await
    }

    /// See [`listing::list_objects`].
    pub async fn list_objects(&self, req: ListObjectsRequest) -> Result<ListObjectsResult> {
        listing::list_objects(&*self.adapter, &self.config, req).await
    }

    /// Runs one bounded zombie-deletion sweep.
    pub async fn sweep_zombies(&self, batch_size: usize) -> Result<usize> {
        zombie::sweep_zombies(&*self.adapter, batch_size, None).await
    }

    /// Checks a bucket's invariants, scanning every row reachable from
    /// `prefix` (spec §10, supplemented from the teacher's
    /// `admin::verify`): at most one unversioned slot per key, and every
    /// pending row carrying a zombie-deletion deadline.
    pub async fn verify_invariants(
        &self,
        location_prefix: &ObjectLocation,
    ) -> Result<InvariantReport> {
        let mut report = InvariantReport::new();
        let mut cursor = None;

        loop {
            let page = self
                .list_objects(ListObjectsRequest {
                    project_id: location_prefix.project_id,
                    bucket_name: location_prefix.bucket_name.clone(),
                    prefix: Bytes::copy_from_slice(location_prefix.object_key.as_bytes()),
                    delimiter: None,
                    cursor: cursor.clone(),
                    limit: 500,
                    all_versions: true,
                    include_pending: true,
                })
                .await?;

            let mut unversioned_seen: Option<crate::model::ObjectKey> = None;
            for entry in &page.entries {
                report.rows_checked += 1;

                if entry.status.is_unversioned() {
                    if unversioned_seen.as_ref() == Some(&entry.object_key) {
                        report.findings.push(InvariantFinding {
                            severity: InvariantSeverity::Error,
                            message: format!(
                                "multiple unversioned rows at key {}",
                                entry.object_key.display()
                            ),
                        });
                    }
                    unversioned_seen = Some(entry.object_key.clone());
                }

                if entry.status == crate::model::ObjectStatus::Pending {
                    let Some(object) = self
                        .adapter
                        .get_object(location_prefix, Some(entry.version))
                        .await?
                    else {
                        continue;
                    };
                    if object.zombie_deletion_deadline.is_none() {
                        report.findings.push(InvariantFinding {
                            severity: InvariantSeverity::Error,
                            message: format!(
                                "pending object at key {} version {} has no zombie deadline",
                                entry.object_key.display(),
                                entry.version
                            ),
                        });
                    }
                }
            }

            if page.next_cursor.is_none() {
                break;
            }
            cursor = page.next_cursor;
        }

        report.success = !report
            .findings
            .iter()
            .any(|f| matches!(f.severity, InvariantSeverity::Error));
        Ok(report)
    }
}

/// Severity of one [`InvariantFinding`].
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantSeverity {
    /// Informational; no action needed.
    Info,
    /// Data integrity violation.
    Error,
}

/// A single issue found by [`Metabase::verify_invariants`].
#[derive(Debug, Clone, Serialize)]
pub struct InvariantFinding {
    /// How serious this finding is.
    pub severity: InvariantSeverity,
    /// Human-readable description.
    pub message: String,
}

/// Report produced by [`Metabase::verify_invariants`].
#[derive(Debug, Clone, Serialize)]
pub struct InvariantReport {
    /// Whether no error-severity findings were recorded.
    pub success: bool,
    /// Issues found, if any.
    pub findings: Vec<InvariantFinding>,
    /// Total object rows examined.
    pub rows_checked: u64,
}

impl InvariantReport {
    fn new() -> Self {
        Self {
            success: true,
            findings: Vec::new(),
            rows_checked: 0,
        }
    }
}
