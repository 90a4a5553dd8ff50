//! # metabase - Metadata engine for decentralized object storage
//!
//! `metabase` is the authoritative source of truth for objects, their
//! versions, and the erasure-coded segments that make up their data, for a
//! storage satellite that never holds object bytes itself. Every piece of
//! state an object has — its key, its version history, delete markers,
//! retention and legal hold, and the segment/piece layout a downloader
//! needs to reconstruct it — lives here, backed by a SQL-family database
//! rather than in-process storage.
//!
//! ## Quick start
//!
//! ```no_run
//! use metabase::adapter::memory::MemoryAdapter;
//! use metabase::{Config, Metabase};
//! use metabase::objects::BeginObjectNextVersionRequest;
//! use metabase::model::{BucketName, ObjectKey, ObjectLocation, ProjectId, Retention};
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! # async fn run() -> metabase::Result<()> {
//! let metabase = Metabase::new(Arc::new(MemoryAdapter::new()), Config::default());
//!
//! let location = ObjectLocation {
//!     project_id: ProjectId(Uuid::new_v4()),
//!     bucket_name: BucketName("photos".into()),
//!     object_key: ObjectKey::from("vacation.jpg"),
//! };
//!
//! let pending = metabase
//!     .begin_object_next_version(BeginObjectNextVersionRequest {
//!         location,
//!         expires_at: None,
//!         retention: Retention::none(),
//!         legal_hold: false,
//!     })
//!     .await?;
//! assert_eq!(pending.version, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Adapters** (`adapter`): the only layer that speaks to a backend.
//!   Three are provided — a SQL-relational adapter, a distributed-
//!   transactional adapter (both over Postgres-wire `sqlx::PgPool`), and an
//!   in-memory test double.
//! - **Operations** (`objects`, `segments`, `listing`, `zombie`): backend-
//!   agnostic logic written once against `&dyn Adapter`.
//! - **Precommit** (`precommit`): the policy deciding what an incoming
//!   commit does to whatever already exists at its location.
//! - **Facade** (`facade`): `Metabase`, the struct applications actually
//!   hold — owns the adapter, config, and metrics.
//!
//! ## Features
//!
//! - Dual SQL backend portability without a second storage engine
//! - Strong invariants under concurrent, reentrant operations
//! - Cursor-based paginated listing with delimiter collapsing
//! - Bounded, idempotent zombie-object sweeps
//! - Structured logging and atomic operation counters

pub mod adapter;
pub mod alias;
pub mod config;
pub mod error;
pub mod facade;
pub mod health;
pub mod listing;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod objects;
pub mod precommit;
pub mod segments;
pub mod zombie;

pub use crate::config::Config;
pub use crate::error::{MetabaseError, Result};
pub use crate::facade::Metabase;
