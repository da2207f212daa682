//! FleetSync - Replicated Operational-Database Coordination Core
//!
//! Keeps a small fleet of paired or triplicated hosts (compute nodes,
//! dashboards, disaster-recovery hosts) safely reading and writing a shared
//! MariaDB operational database while any single host may be offline, slow
//! or partitioned.
//!
//! # Architecture
//!
//! Five tightly coupled pieces, all working through the registry's view of
//! "the readable endpoint":
//!
//! - **Endpoint registry & connection manager** - opens every configured
//!   endpoint, drops the ones that fail, selects the read route and fixes
//!   the run timestamp
//! - **Staleness detector** - compares write timestamps across endpoints
//!   and flags anything behind the fleet maximum for resync
//! - **Distributed lock manager** - fleet-wide mutual exclusion built from
//!   a single shared database row, with lease reaping
//! - **Batched writer** - fans statements out to all healthy endpoints in
//!   bounded, per-chunk transactions
//! - **Liveness probe** - bounded-time `SELECT 1` guarding every query and
//!   write against a hung connection
//!
//! The core is single-threaded per process; concurrency exists only across
//! hosts and is serialized by the lock manager. It implements no consensus
//! and no conflict resolution - writes go to all healthy endpoints and the
//! lock serializes the operations that would otherwise race.

pub mod config;
pub mod error;
pub mod executor;
pub mod identity;
pub mod lock;
pub mod logging;
pub mod probe;
pub mod registry;
pub mod schema;
pub mod staleness;
pub mod writer;

pub use config::FleetConfig;
pub use error::{Error, Result};
pub use registry::Registry;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{EndpointConfig, FleetConfig, TuningConfig};
    pub use crate::error::{ConnectFailure, Error, Result};
    pub use crate::executor::{Connector, Executor, LocalBootstrap, SqlRow, SqlValue};
    pub use crate::identity::LocalIdentity;
    pub use crate::lock::{LockRecord, LockState};
    pub use crate::registry::Registry;
    pub use crate::staleness::{StalenessRecord, StalenessScope};
}
