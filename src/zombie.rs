//! Zombie deletion: bounded, idempotent cleanup of pending objects whose
//! zombie-deletion deadline has passed (spec §4.4 design notes).
//!
//! A pending object with no corresponding commit within its deadline is a
//! "zombie" — segments may have been uploaded for it, but nothing will ever
//! reference them again. Sweeping is safe to run concurrently with normal
//! traffic and safe to re-run after a partial failure: deleting a row that
//! a concurrent commit already transitioned out of `Pending` is simply a
//! no-op for that row, and deleting a row that's already gone does nothing.

use crate::adapter::{Adapter, ZombieSweepRequest};
use crate::error::Result;
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

/// Runs one bounded sweep of expired pending objects, returning how many
/// were removed. Callers needing to clear a large backlog call this
/// repeatedly until it returns `0`.
#[instrument(skip(adapter))]
pub async fn sweep_zombies(
    adapter: &dyn Adapter,
    batch_size: usize,
    as_of: Option<DateTime<Utc>>,
) -> Result<usize> {
    let removed = adapter
        .zombie_sweep(ZombieSweepRequest {
            as_of: as_of.or_else(|| Some(Utc::now())),
            batch_size,
        })
        .await?;

    if removed > 0 {
        info!(removed, "swept zombie objects");
    }
    Ok(removed)
}

/// Repeatedly sweeps in batches of `batch_size` until a sweep returns fewer
/// than `batch_size` removed rows, returning the total removed.
///
/// Bounded by `max_batches` so a pathological backlog can't turn one admin
/// call into an unbounded loop; callers that want to fully drain a large
/// backlog call this in a loop themselves, checking the return value.
pub async fn sweep_zombies_until_dry(
    adapter: &dyn Adapter,
    batch_size: usize,
    max_batches: usize,
) -> Result<usize> {
    let mut total = 0;
    for _ in 0..max_batches {
        let removed = sweep_zombies(adapter, batch_size, None).await?;
        total += removed;
        if removed < batch_size {
            break;
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::MemoryAdapter;
    use crate::config::Config;
    use crate::model::{BucketName, ObjectKey, ObjectLocation, ProjectId, Retention};
    use crate::objects::{begin_object_next_version, BeginObjectNextVersionRequest};
    use uuid::Uuid;

    #[tokio::test]
    async fn sweep_removes_only_expired_rows() {
        let adapter = MemoryAdapter::new();
        let mut config = Config::default();
        config.default_zombie_deadline = std::time::Duration::from_secs(0);

        begin_object_next_version(
            &adapter,
            &config,
            BeginObjectNextVersionRequest {
                location: ObjectLocation {
                    project_id: ProjectId(Uuid::new_v4()),
                    bucket_name: BucketName("bucket".into()),
                    object_key: ObjectKey::from("expired"),
                },
                expires_at: None,
                retention: Retention::none(),
                legal_hold: false,
            },
        )
        .await
        .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));

        let removed = sweep_zombies(&adapter, 10, None).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn sweep_until_dry_stops_below_batch_size() {
        let adapter = MemoryAdapter::new();
        let total = sweep_zombies_until_dry(&adapter, 5, 3).await.unwrap();
        assert_eq!(total, 0);
    }
}
