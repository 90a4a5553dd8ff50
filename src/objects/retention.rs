//! Retention and legal-hold mutation (spec §4.4).

use crate::adapter::Adapter;
use crate::error::{MetabaseError, Result};
use crate::model::{Object, ObjectLocation, ObjectStatus, Retention, Version};
use chrono::Utc;
use tracing::instrument;

/// Sets retention on a specific version, refusing to shorten or clear an
/// active compliance-mode hold (spec §4.4, "SetObjectExactVersionRetention").
#[instrument(skip(adapter))]
pub async fn set_object_exact_version_retention(
    adapter: &dyn Adapter,
    location: &ObjectLocation,
    version: Version,
    retention: Retention,
) -> Result<Object> {
    let current = adapter
        .get_object(location, Some(version))
        .await?
        .ok_or(MetabaseError::ObjectNotFound("object"))?;

    if current.status == ObjectStatus::Pending {
        return Err(MetabaseError::ObjectStatus {
            found: format!("{:?}", current.status),
        });
    }

    let shortens_or_removes = match retention.retain_until {
        None => current.retention.retain_until.is_some(),
        Some(new_until) => current
            .retention
            .retain_until
            .map(|current_until| new_until <= current_until)
            .unwrap_or(false),
    };
    if current.retention.is_locked(Utc::now()) && shortens_or_removes {
        return Err(MetabaseError::ObjectLock(
            "cannot shorten or remove an active compliance-mode retention".into(),
        ));
    }
    if current.expires_at.is_some() && !matches!(retention.mode, crate::model::RetentionMode::None)
    {
        return Err(MetabaseError::ObjectExpiration);
    }

    adapter
        .set_retention(location, version, retention, None)
        .await
}

/// Sets retention on whichever version is currently the last-committed one
/// at this location (spec §4.4, "SetObjectLastCommittedRetention").
#[instrument(skip(adapter))]
pub async fn set_object_last_committed_retention(
    adapter: &dyn Adapter,
    location: &ObjectLocation,
    retention: Retention,
) -> Result<Object> {
    let current = adapter
        .get_object(location, None)
        .await?
        .ok_or(MetabaseError::ObjectNotFound("object"))?;

    set_object_exact_version_retention(adapter, location, current.version, retention).await
}

/// Sets or clears the legal-hold flag on a specific version.
#[instrument(skip(adapter))]
pub async fn set_legal_hold(
    adapter: &dyn Adapter,
    location: &ObjectLocation,
    version: Version,
    legal_hold: bool,
) -> Result<Object> {
    let current = adapter
        .get_object(location, Some(version))
        .await?
        .ok_or(MetabaseError::ObjectNotFound("object"))?;

    adapter
        .set_retention(location, version, current.retention, Some(legal_hold))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::MemoryAdapter;
    use crate::config::Config;
    use crate::model::{BucketName, ObjectKey, ProjectId, RetentionMode};
    use crate::objects::{
        begin_object_next_version, commit_object, BeginObjectNextVersionRequest,
        CommitObjectRequest, CommitOverwrite,
    };
    use uuid::Uuid;

    fn loc() -> ObjectLocation {
        ObjectLocation {
            project_id: ProjectId(Uuid::new_v4()),
            bucket_name: BucketName("bucket".into()),
            object_key: ObjectKey::from("object.bin"),
        }
    }

    async fn commit_with_compliance_lock(
        adapter: &MemoryAdapter,
        config: &Config,
        location: &ObjectLocation,
        retain_until: chrono::DateTime<Utc>,
    ) -> Object {
        let pending = begin_object_next_version(
            adapter,
            config,
            BeginObjectNextVersionRequest {
                location: location.clone(),
                expires_at: None,
                retention: Retention {
                    mode: RetentionMode::Compliance,
                    retain_until: Some(retain_until),
                },
                legal_hold: false,
            },
        )
        .await
        .unwrap();

        adapter
            .insert_segment(crate::model::Segment {
                stream_id: pending.stream_id,
                position: crate::model::Position { part: 0, index: 0 },
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

        let (object, _) = commit_object(
            adapter,
            config,
            CommitObjectRequest {
                location: location.clone(),
                version: pending.version,
                overwrite: CommitOverwrite::Unversioned,
                encrypted_metadata: crate::model::EncryptedMetadata::default(),
                encryption: None,
            },
        )
        .await
        .unwrap();
        object
    }

    #[tokio::test]
    async fn set_retention_rejects_when_pending() {
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

        let err = set_object_exact_version_retention(
            &adapter,
            &location,
            pending.version,
            Retention {
                mode: RetentionMode::Governance,
                retain_until: Some(Utc::now() + chrono::Duration::hours(1)),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ObjectStatus);
    }

    #[tokio::test]
    async fn set_retention_rejects_shortening_while_locked() {
        let adapter = MemoryAdapter::new();
        let config = Config::default();
        let location = loc();
        let retain_until = Utc::now() + chrono::Duration::hours(1);

        let committed =
            commit_with_compliance_lock(&adapter, &config, &location, retain_until).await;

        let err = set_object_exact_version_retention(
            &adapter,
            &location,
            committed.version,
            Retention::none(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ObjectLock);
    }

    #[tokio::test]
    async fn set_retention_allows_extension_while_locked() {
        let adapter = MemoryAdapter::new();
        let config = Config::default();
        let location = loc();
        let retain_until = Utc::now() + chrono::Duration::hours(1);

        let committed =
            commit_with_compliance_lock(&adapter, &config, &location, retain_until).await;

        let extended_until = retain_until + chrono::Duration::hours(1);
        let updated = set_object_exact_version_retention(
            &adapter,
            &location,
            committed.version,
            Retention {
                mode: RetentionMode::Compliance,
                retain_until: Some(extended_until),
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.retention.retain_until, Some(extended_until));
    }
}
