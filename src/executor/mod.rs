//! Database Executors
//!
//! The driver seam of the coordination core. `Executor` is one live
//! connection to one endpoint; `Connector` opens them. The registry owns the
//! real MySQL implementations; tests use the shared-state mock so lock races
//! and chunk-commit semantics can be observed without a server.

mod mysql;
pub mod mock;

pub use mysql::{MySqlConnector, MySqlExecutor};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::EndpointConfig;
use crate::error::Result;

/// A single value in a query result row
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// Integer view, if this value is one
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Text view, if this value is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// One result row
pub type SqlRow = Vec<SqlValue>;

/// Leading fragment of a statement for error messages. Cuts at a char
/// boundary; a byte-offset slice would panic on multibyte text near the
/// cutoff.
pub(crate) fn statement_preview(sql: &str) -> &str {
    match sql.char_indices().nth(50) {
        Some((i, _)) => &sql[..i],
        None => sql,
    }
}

/// A live connection to one endpoint. Owned exclusively by the registry;
/// at most one per endpoint per run.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Trivial round-trip (`SELECT 1`) used by the liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Execute one statement under autocommit; returns rows affected.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Execute statements inside one explicit transaction, committing only
    /// after all succeed. A mid-list failure commits nothing.
    async fn execute_transaction(&self, statements: &[String]) -> Result<()>;

    /// Fetch all rows of a query.
    async fn fetch_rows(&self, sql: &str) -> Result<Vec<SqlRow>>;

    /// This endpoint's own clock, unix epoch seconds.
    async fn now_epoch(&self) -> Result<i64>;

    /// Read a coordination key/value row; `None` when absent.
    async fn get_meta(&self, key: &str) -> Result<Option<String>>;

    /// Upsert a coordination key/value row.
    async fn put_meta(&self, key: &str, value: &str, modified_date: i64) -> Result<()>;

    /// Most recent timestamp this endpoint has recorded for a logical
    /// source, across all hosts.
    async fn source_timestamp(&self, source: &str) -> Result<Option<i64>>;

    /// Record a source timestamp for one host.
    async fn stamp_source(&self, host_id: &str, source: &str, modified_date: i64) -> Result<()>;

    /// `MAX(modified_date)` over a watched table, optionally filtered by an
    /// owning-host column `(column, value)`.
    async fn table_timestamp(
        &self,
        table: &str,
        host_column: Option<(&str, &str)>,
    ) -> Result<Option<i64>>;

    /// Whether a table exists in the connected database.
    async fn has_table(&self, table: &str) -> Result<bool>;

    /// Close the underlying connection pool.
    async fn close(&self);
}

/// Opens connections to configured endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// TCP-level reachability check, bounded by `timeout`.
    async fn reachable(&self, host: &str, port: u16, timeout: Duration) -> bool;

    /// Open a connection to the endpoint. Failures carry a classified
    /// `ConnectFailure` and never abort the caller's connect cycle.
    async fn open(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn Executor>>;
}

/// Local-only bootstrap hook run before connecting to an endpoint that
/// resolves to this machine. Schema/user/database provisioning lives with
/// the caller; the core only gates on "ready".
#[async_trait]
pub trait LocalBootstrap: Send + Sync {
    async fn prepare(&self, endpoint: &EndpointConfig) -> Result<()>;
}
