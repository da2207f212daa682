//! Shared Coordination Schema
//!
//! The two tables the core keeps in every fleet database: a key/value table
//! holding the lock record and per-host activity flags, and a timestamp
//! table holding per-source write markers for staleness detection. The core
//! decides when an empty database gets initialized; any application schema
//! beyond these tables comes from the caller as a list of statements.

use crate::error::Result;
use crate::executor::Executor;

/// Key/value coordination table; its presence is the "endpoint is
/// initialized" check.
pub const BASE_TABLE: &str = "fleet_meta";

/// Per-host, per-source timestamp table consumed by the staleness detector.
pub const UPDATED_TABLE: &str = "fleet_updated";

/// Key of the shared lock record inside `fleet_meta`.
pub const LOCK_KEY: &str = "lock_request";

/// Key of one host's activity flag inside `fleet_meta`.
pub fn activity_key(host_id: &str) -> String {
    format!("active::{}", host_id)
}

const CREATE_BASE_TABLE: &str = "CREATE TABLE IF NOT EXISTS fleet_meta (\
     meta_key VARCHAR(255) NOT NULL PRIMARY KEY, \
     meta_value TEXT NOT NULL, \
     modified_date BIGINT NOT NULL DEFAULT 0)";

const CREATE_UPDATED_TABLE: &str = "CREATE TABLE IF NOT EXISTS fleet_updated (\
     host_id VARCHAR(64) NOT NULL, \
     source VARCHAR(255) NOT NULL, \
     modified_date BIGINT NOT NULL DEFAULT 0, \
     PRIMARY KEY (host_id, source))";

/// Ensure the coordination tables (and the caller's schema source, if any)
/// exist on the endpoint. Idempotent: when the base table is already present
/// this is a no-op. Returns whether initialization ran.
pub async fn ensure_schema(exec: &dyn Executor, schema_source: &[String]) -> Result<bool> {
    if exec.has_table(BASE_TABLE).await? {
        return Ok(false);
    }

    exec.execute(CREATE_BASE_TABLE).await?;
    exec.execute(CREATE_UPDATED_TABLE).await?;
    for statement in schema_source {
        exec.execute(statement).await?;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::MockDatabase;
    use crate::executor::mock::MockExecutor;

    #[tokio::test]
    async fn test_ensure_schema_initializes_once() {
        let db = MockDatabase::new();
        let exec = MockExecutor::new(db.clone());

        assert!(ensure_schema(&exec, &[]).await.unwrap());
        assert!(exec.has_table(BASE_TABLE).await.unwrap());
        assert!(exec.has_table(UPDATED_TABLE).await.unwrap());

        // Second detection of the present table is a no-op.
        assert!(!ensure_schema(&exec, &[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_schema_applies_caller_source() {
        let db = MockDatabase::new();
        let exec = MockExecutor::new(db.clone());

        let source = vec!["CREATE TABLE IF NOT EXISTS servers (id INT)".to_string()];
        assert!(ensure_schema(&exec, &source).await.unwrap());
        assert!(exec.has_table("servers").await.unwrap());
    }
}
