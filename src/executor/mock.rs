//! In-Memory Mock Executor
//!
//! Test double for the driver seam. Unlike a pure no-op, the mock keeps
//! shared state: multiple executors (simulated hosts) can point at the same
//! `MockDatabase` and race over the same lock row, and tests can observe
//! exactly which statements committed. Ping delays and failing statements
//! are injectable.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::EndpointConfig;
use crate::error::{ConnectFailure, Error, Result};
use crate::executor::{statement_preview, Connector, Executor, SqlRow};

#[derive(Default)]
struct MockState {
    meta: HashMap<String, (String, i64)>,
    source_ts: HashMap<(String, String), i64>,
    table_ts: HashMap<String, i64>,
    table_host_ts: HashMap<(String, String), i64>,
    tables: HashSet<String>,
    committed: Vec<String>,
    scripted: HashMap<String, Vec<SqlRow>>,
    clock: i64,
    ping_delay: Option<Duration>,
    fail_on: Option<String>,
    tx_commits: usize,
}

/// The shared rows of one simulated endpoint database
#[derive(Default)]
pub struct MockDatabase {
    state: Mutex<MockState>,
}

impl MockDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set the endpoint's clock (unix epoch seconds)
    pub fn set_clock(&self, epoch: i64) {
        self.state.lock().unwrap().clock = epoch;
    }

    pub fn advance_clock(&self, secs: i64) {
        self.state.lock().unwrap().clock += secs;
    }

    /// Delay every ping by this much (for probe timeout tests)
    pub fn set_ping_delay(&self, delay: Duration) {
        self.state.lock().unwrap().ping_delay = Some(delay);
    }

    /// Fail any statement containing this substring
    pub fn set_fail_on(&self, needle: &str) {
        self.state.lock().unwrap().fail_on = Some(needle.to_string());
    }

    /// Statements that actually committed, in order
    pub fn committed(&self) -> Vec<String> {
        self.state.lock().unwrap().committed.clone()
    }

    /// How many explicit transactions committed
    pub fn transaction_commits(&self) -> usize {
        self.state.lock().unwrap().tx_commits
    }

    pub fn meta(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .meta
            .get(key)
            .map(|(value, _)| value.clone())
    }

    pub fn set_meta(&self, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .meta
            .insert(key.to_string(), (value.to_string(), 0));
    }

    pub fn set_source_timestamp(&self, host_id: &str, source: &str, ts: i64) {
        self.state
            .lock()
            .unwrap()
            .source_ts
            .insert((host_id.to_string(), source.to_string()), ts);
    }

    pub fn set_table_timestamp(&self, table: &str, ts: i64) {
        self.state
            .lock()
            .unwrap()
            .table_ts
            .insert(table.to_string(), ts);
    }

    pub fn set_table_host_timestamp(&self, table: &str, host: &str, ts: i64) {
        self.state
            .lock()
            .unwrap()
            .table_host_ts
            .insert((table.to_string(), host.to_string()), ts);
    }

    /// Script the rows a query returns
    pub fn script_query(&self, sql: &str, rows: Vec<SqlRow>) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .insert(sql.to_string(), rows);
    }

    pub fn create_table(&self, name: &str) {
        self.state.lock().unwrap().tables.insert(name.to_string());
    }

    fn check_fail(state: &MockState, sql: &str) -> Result<()> {
        if let Some(needle) = &state.fail_on {
            if sql.contains(needle.as_str()) {
                return Err(Error::QueryExecution(format!(
                    "forced failure on '{}'",
                    statement_preview(sql)
                )));
            }
        }
        Ok(())
    }

    fn apply(state: &mut MockState, sql: &str) {
        // CREATE TABLE is the only DDL the core itself issues.
        if let Some(rest) = sql.strip_prefix("CREATE TABLE IF NOT EXISTS ") {
            if let Some(name) = rest.split([' ', '(']).next() {
                state.tables.insert(name.to_string());
            }
        }
        state.committed.push(sql.to_string());
    }
}

/// Executor over a (possibly shared) mock database
pub struct MockExecutor {
    db: Arc<MockDatabase>,
}

impl MockExecutor {
    pub fn new(db: Arc<MockDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn ping(&self) -> Result<()> {
        let delay = self.db.state.lock().unwrap().ping_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let mut state = self.db.state.lock().unwrap();
        MockDatabase::check_fail(&state, sql)?;
        MockDatabase::apply(&mut state, sql);
        Ok(0)
    }

    async fn execute_transaction(&self, statements: &[String]) -> Result<()> {
        let mut state = self.db.state.lock().unwrap();
        // Nothing commits unless every statement passes.
        for sql in statements {
            MockDatabase::check_fail(&state, sql)?;
        }
        for sql in statements {
            MockDatabase::apply(&mut state, sql);
        }
        state.tx_commits += 1;
        Ok(())
    }

    async fn fetch_rows(&self, sql: &str) -> Result<Vec<SqlRow>> {
        let state = self.db.state.lock().unwrap();
        MockDatabase::check_fail(&state, sql)?;
        Ok(state.scripted.get(sql).cloned().unwrap_or_default())
    }

    async fn now_epoch(&self) -> Result<i64> {
        Ok(self.db.state.lock().unwrap().clock)
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self.db.meta(key))
    }

    async fn put_meta(&self, key: &str, value: &str, modified_date: i64) -> Result<()> {
        self.db
            .state
            .lock()
            .unwrap()
            .meta
            .insert(key.to_string(), (value.to_string(), modified_date));
        Ok(())
    }

    async fn source_timestamp(&self, source: &str) -> Result<Option<i64>> {
        let state = self.db.state.lock().unwrap();
        Ok(state
            .source_ts
            .iter()
            .filter(|((_, s), _)| s == source)
            .map(|(_, ts)| *ts)
            .max())
    }

    async fn stamp_source(&self, host_id: &str, source: &str, modified_date: i64) -> Result<()> {
        self.db.set_source_timestamp(host_id, source, modified_date);
        Ok(())
    }

    async fn table_timestamp(
        &self,
        table: &str,
        host_column: Option<(&str, &str)>,
    ) -> Result<Option<i64>> {
        let state = self.db.state.lock().unwrap();
        match host_column {
            Some((_, host)) => Ok(state
                .table_host_ts
                .get(&(table.to_string(), host.to_string()))
                .copied()),
            None => Ok(state.table_ts.get(table).copied()),
        }
    }

    async fn has_table(&self, table: &str) -> Result<bool> {
        Ok(self.db.state.lock().unwrap().tables.contains(table))
    }

    async fn close(&self) {}
}

/// Connector over per-endpoint mock databases
#[derive(Default)]
pub struct MockConnector {
    databases: Mutex<HashMap<String, Arc<MockDatabase>>>,
    unreachable: Mutex<HashSet<(String, u16)>>,
    refused: Mutex<HashMap<String, ConnectFailure>>,
    opened: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind an endpoint id to a database (share one across connectors to
    /// simulate hosts working against the same rows)
    pub fn register(&self, endpoint_id: &str, db: Arc<MockDatabase>) {
        self.databases
            .lock()
            .unwrap()
            .insert(endpoint_id.to_string(), db);
    }

    pub fn mark_unreachable(&self, host: &str, port: u16) {
        self.unreachable
            .lock()
            .unwrap()
            .insert((host.to_string(), port));
    }

    pub fn refuse(&self, endpoint_id: &str, failure: ConnectFailure) {
        self.refused
            .lock()
            .unwrap()
            .insert(endpoint_id.to_string(), failure);
    }

    /// How many connections have been opened, total
    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn reachable(&self, host: &str, port: u16, _timeout: Duration) -> bool {
        !self
            .unreachable
            .lock()
            .unwrap()
            .contains(&(host.to_string(), port))
    }

    async fn open(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn Executor>> {
        if let Some(failure) = self.refused.lock().unwrap().get(&endpoint.id) {
            return Err(Error::Connect {
                endpoint: endpoint.id.clone(),
                failure: *failure,
                detail: "refused by mock".to_string(),
            });
        }

        let db = self
            .databases
            .lock()
            .unwrap()
            .entry(endpoint.id.clone())
            .or_insert_with(|| MockDatabase::new())
            .clone();

        self.opened.lock().unwrap().push(endpoint.id.clone());
        Ok(Arc::new(MockExecutor::new(db)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_meta_roundtrip() {
        let db = MockDatabase::new();
        let exec = MockExecutor::new(db.clone());

        assert_eq!(exec.get_meta("lock_request").await.unwrap(), None);
        exec.put_meta("lock_request", "h1::abc::1000", 1000)
            .await
            .unwrap();
        assert_eq!(
            exec.get_meta("lock_request").await.unwrap(),
            Some("h1::abc::1000".to_string())
        );
    }

    #[tokio::test]
    async fn test_failed_transaction_commits_nothing() {
        let db = MockDatabase::new();
        let exec = MockExecutor::new(db.clone());
        db.set_fail_on("boom");

        let statements = vec![
            "INSERT INTO t VALUES (1)".to_string(),
            "INSERT INTO t VALUES (boom)".to_string(),
        ];
        assert!(exec.execute_transaction(&statements).await.is_err());
        assert!(db.committed().is_empty());
    }

    #[tokio::test]
    async fn test_failure_message_survives_multibyte_statement() {
        let db = MockDatabase::new();
        let exec = MockExecutor::new(db.clone());
        db.set_fail_on("INSERT");

        // A two-byte char straddles byte offset 50; the failure message must
        // come back as an error, not a slicing panic.
        let sql = format!("INSERT INTO t VALUES ('{}é')", "x".repeat(26));
        let err = exec.execute(&sql).await.unwrap_err();
        assert!(matches!(err, Error::QueryExecution(_)));
        assert!(db.committed().is_empty());
    }

    #[tokio::test]
    async fn test_source_timestamp_is_fleet_max() {
        let db = MockDatabase::new();
        let exec = MockExecutor::new(db.clone());

        db.set_source_timestamp("id-a", "fleetsync", 100);
        db.set_source_timestamp("id-b", "fleetsync", 250);
        db.set_source_timestamp("id-a", "other", 999);

        assert_eq!(exec.source_timestamp("fleetsync").await.unwrap(), Some(250));
        assert_eq!(exec.source_timestamp("missing").await.unwrap(), None);
    }
}
