//! # dspace-pump
//!
//! Resumable migration of a legacy DSpace 5 repository (plus its licensing
//! utilities database) into a DSpace 7 backend.
//!
//! Records are read from the legacy databases, or from JSON snapshots of
//! them, and written through the destination REST API one entity kind at a
//! time:
//!
//! - **Stages** run in a fixed dependency order, each split into sub-phases
//! - **Checkpoints** record per-stage identity maps so a crashed run resumes
//! - **Worker pool** parallelizes bulk item, bundle and bitstream writes
//! - **Resilient transport** with retry, backoff and a circuit breaker
//! - **Version histories** rebuilt from replaces / isReplacedBy metadata
//!
//! ## Example
//!
//! ```rust,no_run
//! use dspace_pump::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> dspace_pump::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let orchestrator = Orchestrator::new(config);
//!     let result = orchestrator.run(CancellationToken::new()).await?;
//!     println!("Migration {}", result.status);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod identity;
pub mod legacy;
pub mod orchestrator;
pub mod pool;
pub mod relational;
pub mod stages;
pub mod transport;
pub mod verify;
pub mod versions;

// Re-exports for convenient access
pub use checkpoint::{Checkpoint, CheckpointStore, PhaseCounters, StageProgress};
pub use config::{BackendConfig, Config, DatabaseConfig, MigrationConfig, RetryPolicy, SqlRetryPolicy};
pub use error::{MigrateError, Result};
pub use identity::{Handle, IdentityMap, MultiIdentityMap};
pub use orchestrator::{HealthCheckResult, MigrationResult, Orchestrator, StageReport, StageStatus};
pub use stages::{Phase, StageKind};
pub use transport::{TransportClient, TransportFactory};
pub use verify::{ConsistencyReport, TableCheck, TableDiff};
