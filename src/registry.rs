//! Endpoint Registry & Connection Manager
//!
//! Owns the set of configured endpoints and every piece of per-run
//! coordination state: live connections, the read route, the run timestamp,
//! staleness records and the lock state. All mutation flows through the
//! operations here; the detector, lock manager and writer are implemented
//! as further `impl Registry` blocks in their own modules and share this
//! state. One registry instance per thread of control: nothing here is
//! reentrant.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::config::{EndpointConfig, FleetConfig, TuningConfig};
use crate::error::{ConnectFailure, Error, Result};
use crate::executor::{Connector, Executor, LocalBootstrap, SqlRow};
use crate::identity::LocalIdentity;
use crate::lock::LockState;
use crate::probe::liveness_probe;
use crate::schema;
use crate::staleness::StalenessRecord;

/// One connected endpoint: its configuration plus the single live
/// connection bound to it.
pub(crate) struct ManagedEndpoint {
    pub(crate) config: EndpointConfig,
    pub(crate) executor: Arc<dyn Executor>,
}

/// Per-run coordination state. Explicit and owned by the registry; no
/// package-level globals.
#[derive(Default)]
pub(crate) struct CoreState {
    /// Endpoint currently trusted for reads
    pub(crate) read_route: Option<String>,
    /// Epoch seconds from the first connected endpoint's clock, reused as
    /// modified_date for every write this run performs
    pub(crate) run_timestamp: Option<i64>,
    /// Fleet-wide signal that a full data resync is warranted
    pub(crate) resync_needed: bool,
    /// Endpoints flagged behind this cycle
    pub(crate) staleness: Vec<StalenessRecord>,
    /// Lock manager state machine position
    pub(crate) lock_state: LockState,
    /// Whether this host currently advertises itself as active
    pub(crate) active: bool,
}

/// The connection manager. Single-threaded per process: one run is one
/// sequential pass over all endpoints; concurrency exists only across
/// hosts, serialized by the lock manager.
pub struct Registry {
    pub(crate) identity: LocalIdentity,
    pub(crate) tuning: TuningConfig,
    pub(crate) connector: Arc<dyn Connector>,
    bootstrap: Option<Arc<dyn LocalBootstrap>>,
    schema_source: Vec<String>,
    pub(crate) endpoints: Vec<ManagedEndpoint>,
    failed: Vec<(String, ConnectFailure)>,
    pub(crate) state: CoreState,
}

impl Registry {
    pub fn new(config: &FleetConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            identity: LocalIdentity::from_config(&config.node),
            tuning: config.tuning.clone(),
            connector,
            bootstrap: None,
            schema_source: Vec::new(),
            endpoints: Vec::new(),
            failed: Vec::new(),
            state: CoreState::default(),
        }
    }

    /// Install the hook run against local endpoints before connecting.
    pub fn with_local_bootstrap(mut self, bootstrap: Arc<dyn LocalBootstrap>) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    /// Statements applied after the coordination tables when an empty
    /// database is initialized.
    pub fn with_schema_source(mut self, statements: Vec<String>) -> Self {
        self.schema_source = statements;
        self
    }

    /// Connect to every configured endpoint in stable order. A failing
    /// endpoint is logged, dropped for the remainder of the run and never
    /// aborts the cycle. Returns the number of endpoints connected; zero
    /// means every downstream operation refuses to proceed.
    pub async fn connect(
        &mut self,
        endpoints: &[EndpointConfig],
        watched_tables: Option<&BTreeMap<String, Option<String>>>,
    ) -> Result<usize> {
        if !self.endpoints.is_empty() {
            // Already connected: a repeat call must not duplicate
            // connections or move the read route.
            return Ok(self.endpoints.len());
        }

        let mut seen = HashSet::new();
        for ep in endpoints {
            if !seen.insert(ep.address()) {
                tracing::warn!(
                    endpoint = %ep.id,
                    host = %ep.host,
                    port = ep.port,
                    "duplicate host:port in configuration; skipping"
                );
                continue;
            }

            if ep.ping_before_connect
                && !self
                    .connector
                    .reachable(&ep.host, ep.port, self.tuning.ping_timeout())
                    .await
            {
                tracing::warn!(endpoint = %ep.id, host = %ep.host, "endpoint unreachable; dropped for this run");
                self.failed
                    .push((ep.id.clone(), ConnectFailure::HostUnreachable));
                continue;
            }

            // Local-only provisioning runs before the first connection and
            // before any endpoint on this machine.
            if self.identity.is_local_host(&ep.host) || self.state.read_route.is_none() {
                if let Some(bootstrap) = &self.bootstrap {
                    if let Err(e) = bootstrap.prepare(ep).await {
                        tracing::warn!(endpoint = %ep.id, error = %e, "local bootstrap failed; dropped for this run");
                        self.failed
                            .push((ep.id.clone(), ConnectFailure::GenericConnectFailure));
                        continue;
                    }
                }
            }

            let exec = match self.connector.open(ep).await {
                Ok(exec) => exec,
                Err(e) => {
                    let failure = e
                        .connect_failure()
                        .unwrap_or(ConnectFailure::GenericConnectFailure);
                    tracing::warn!(endpoint = %ep.id, %failure, error = %e, "connect failed; dropped for this run");
                    self.failed.push((ep.id.clone(), failure));
                    continue;
                }
            };

            match schema::ensure_schema(exec.as_ref(), &self.schema_source).await {
                Ok(true) => tracing::info!(endpoint = %ep.id, "initialized coordination schema"),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(endpoint = %ep.id, error = %e, "schema initialization failed; dropped for this run");
                    self.failed
                        .push((ep.id.clone(), ConnectFailure::GenericConnectFailure));
                    continue;
                }
            }

            // First success fixes the run timestamp from that endpoint's
            // own clock; it is never reread mid-run.
            if self.state.run_timestamp.is_none() {
                match exec.now_epoch().await {
                    Ok(now) => self.state.run_timestamp = Some(now),
                    Err(e) => {
                        tracing::warn!(endpoint = %ep.id, error = %e, "could not read endpoint clock; dropped for this run");
                        self.failed
                            .push((ep.id.clone(), ConnectFailure::GenericConnectFailure));
                        continue;
                    }
                }
            }

            self.endpoints.push(ManagedEndpoint {
                config: ep.clone(),
                executor: exec,
            });
            self.select_read_route();
        }

        let connected = self.endpoints.len();
        if connected == 0 {
            tracing::error!("no configured endpoint could be connected; refusing all further work");
            self.state = CoreState::default();
            return Ok(0);
        }

        self.detect_staleness(watched_tables).await?;
        if self.state.read_route.is_some() {
            self.lock_barrier().await?;
        } else {
            // Every endpoint was flagged behind: the lock row cannot be
            // trusted either, so the barrier is skipped and the caller is
            // expected to resync and reconnect.
            tracing::warn!("no trustworthy read endpoint; skipping lock barrier");
        }
        self.set_activity(true).await;
        self.stamp_sources().await;

        tracing::info!(
            connected,
            read_route = self.state.read_route.as_deref().unwrap_or(""),
            "fleet connect complete"
        );
        Ok(connected)
    }

    /// Release the lock if held, withdraw the activity flag, close every
    /// connection and clear all per-run state. Calling twice is a no-op.
    pub async fn disconnect(&mut self) {
        if self.endpoints.is_empty() {
            return;
        }

        if self.state.lock_state == LockState::Held {
            if let Err(e) = self.lock_release().await {
                tracing::warn!(error = %e, "could not release lock on disconnect");
            }
        }
        self.set_activity(false).await;

        for ep in &self.endpoints {
            ep.executor.close().await;
        }
        tracing::info!("disconnected from all endpoints");

        self.endpoints.clear();
        self.failed.clear();
        self.state = CoreState::default();
    }

    /// Read rows through the read route, or from a named endpoint. The
    /// liveness probe guards every call.
    pub async fn query(&self, endpoint: Option<&str>, sql: &str) -> Result<Vec<SqlRow>> {
        if sql.trim().is_empty() {
            return Err(Error::NoStatement);
        }

        let (id, exec) = match endpoint {
            Some(id) => (id.to_string(), self.executor_for(id)?),
            None => self.read_endpoint()?,
        };
        liveness_probe(&id, exec.as_ref(), self.tuning.probe_timeout()).await?;
        exec.fetch_rows(sql).await
    }

    // --- accessors -------------------------------------------------------

    /// Endpoint currently trusted for reads, if any
    pub fn read_route(&self) -> Option<&str> {
        self.state.read_route.as_deref()
    }

    /// The run's fixed write timestamp (epoch seconds), once connected
    pub fn run_timestamp(&self) -> Option<i64> {
        self.state.run_timestamp
    }

    /// Whether any endpoint was flagged behind this cycle
    pub fn resync_needed(&self) -> bool {
        self.state.resync_needed
    }

    /// Endpoints flagged behind this cycle, with what was observed
    pub fn staleness_records(&self) -> &[StalenessRecord] {
        &self.state.staleness
    }

    /// Ids of currently connected endpoints, in registry order
    pub fn connected_ids(&self) -> Vec<&str> {
        self.endpoints.iter().map(|e| e.config.id.as_str()).collect()
    }

    /// Endpoints dropped during connect, with the classified reason
    pub fn failed_endpoints(&self) -> &[(String, ConnectFailure)] {
        &self.failed
    }

    /// Whether this host currently advertises itself as active
    pub fn is_active(&self) -> bool {
        self.state.active
    }

    /// Current lock manager state
    pub fn lock_state(&self) -> LockState {
        self.state.lock_state
    }

    /// This host's identity
    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    // --- crate-internal plumbing -----------------------------------------

    pub(crate) fn executor_for(&self, id: &str) -> Result<Arc<dyn Executor>> {
        if self.endpoints.is_empty() {
            return Err(Error::NoEndpoint);
        }
        self.endpoints
            .iter()
            .find(|e| e.config.id == id)
            .map(|e| e.executor.clone())
            .ok_or_else(|| Error::UnknownEndpoint(id.to_string()))
    }

    pub(crate) fn read_endpoint(&self) -> Result<(String, Arc<dyn Executor>)> {
        let id = self.state.read_route.clone().ok_or(Error::NoEndpoint)?;
        let exec = self.executor_for(&id)?;
        Ok((id, exec))
    }

    /// Read a coordination row through the read route, probe first.
    pub(crate) async fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let (id, exec) = self.read_endpoint()?;
        liveness_probe(&id, exec.as_ref(), self.tuning.probe_timeout()).await?;
        exec.get_meta(key).await
    }

    /// Upsert a coordination row on every connected endpoint. Best-effort
    /// fan-out: errors only when no endpoint accepted the write.
    pub(crate) async fn meta_put_all(&self, key: &str, value: &str) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::NoEndpoint);
        }
        let modified = self.state.run_timestamp.ok_or(Error::NoEndpoint)?;

        let mut accepted = 0;
        let mut last_err = None;
        for ep in &self.endpoints {
            match ep.executor.put_meta(key, value, modified).await {
                Ok(()) => accepted += 1,
                Err(e) => {
                    tracing::warn!(endpoint = %ep.config.id, error = %e, "metadata write failed");
                    last_err = Some(e);
                }
            }
        }
        if accepted == 0 {
            Err(last_err.unwrap_or(Error::NoEndpoint))
        } else {
            Ok(())
        }
    }

    /// Record this host's activity flag on every endpoint. Informational
    /// for peers, so failures are warnings only.
    pub(crate) async fn set_activity(&mut self, active: bool) {
        let key = schema::activity_key(&self.identity.host_id);
        let value = if active { "1" } else { "0" };
        if let Err(e) = self.meta_put_all(&key, value).await {
            tracing::warn!(error = %e, "could not record activity state");
        }
        self.state.active = active;
    }

    /// Prefer the endpoint that is this machine; otherwise keep the first
    /// successfully connected endpoint. The single place the read route is
    /// established during connect.
    fn select_read_route(&mut self) {
        for ep in &self.endpoints {
            if self.identity.is_local_host(&ep.config.host) {
                self.state.read_route = Some(ep.config.id.clone());
                return;
            }
        }
        if self.state.read_route.is_none() {
            self.state.read_route = self.endpoints.first().map(|e| e.config.id.clone());
        }
    }

    /// Stamp this host's source timestamp on every healthy endpoint so the
    /// next cycle's detector has fresh input.
    async fn stamp_sources(&self) {
        let Some(modified) = self.state.run_timestamp else {
            return;
        };
        for ep in &self.endpoints {
            if let Err(e) = ep
                .executor
                .stamp_source(&self.identity.host_id, &self.identity.source, modified)
                .await
            {
                tracing::warn!(endpoint = %ep.config.id, error = %e, "could not stamp source timestamp");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{LoggingConfig, NodeConfig};
    use crate::executor::mock::{MockConnector, MockDatabase};
    use async_trait::async_trait;
    use std::sync::Mutex;

    pub(crate) fn test_config(hostname: &str) -> FleetConfig {
        FleetConfig {
            node: NodeConfig {
                hostname: hostname.to_string(),
                host_id: Some(format!("id-{}", hostname)),
                source: "fleetsync".to_string(),
            },
            endpoints: Vec::new(),
            tuning: TuningConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub(crate) fn ep(id: &str, host: &str) -> EndpointConfig {
        EndpointConfig {
            id: id.to_string(),
            host: host.to_string(),
            port: 3306,
            database: "fleet".to_string(),
            user: "fleet".to_string(),
            password: String::new(),
            ping_before_connect: false,
        }
    }

    #[tokio::test]
    async fn test_connect_prefers_local_read_route() {
        let connector = MockConnector::new();
        let db1 = MockDatabase::new();
        db1.set_clock(1_000);
        connector.register("h1", db1.clone());

        let mut registry = Registry::new(&test_config("h2"), connector.clone());
        let endpoints = vec![ep("h1", "h1"), ep("h2", "h2"), ep("h3", "h3")];

        let connected = registry.connect(&endpoints, None).await.unwrap();
        assert_eq!(connected, 3);
        // h1 connected first, but h2 matches the local host.
        assert_eq!(registry.read_route(), Some("h2"));
        assert_eq!(registry.run_timestamp(), Some(1_000));
        assert!(registry.is_active());
        assert_eq!(db1.meta(&schema::activity_key("id-h2")), Some("1".into()));
    }

    #[tokio::test]
    async fn test_connect_skips_unreachable_endpoint() {
        let connector = MockConnector::new();
        connector.mark_unreachable("h2", 3306);

        let mut endpoints = vec![ep("h1", "h1"), ep("h2", "h2"), ep("h3", "h3")];
        endpoints[1].ping_before_connect = true;

        let mut registry = Registry::new(&test_config("h1"), connector.clone());
        let connected = registry.connect(&endpoints, None).await.unwrap();

        assert_eq!(connected, 2);
        assert_eq!(registry.connected_ids(), vec!["h1", "h3"]);
        assert_eq!(registry.read_route(), Some("h1"));
        assert_eq!(
            registry.failed_endpoints(),
            &[("h2".to_string(), ConnectFailure::HostUnreachable)]
        );
    }

    #[tokio::test]
    async fn test_fail_closed_when_nothing_connects() {
        let connector = MockConnector::new();
        connector.refuse("h1", ConnectFailure::ConnectionRefused);
        connector.refuse("h2", ConnectFailure::AuthenticationFailed);

        let mut registry = Registry::new(&test_config("h1"), connector.clone());
        let endpoints = vec![ep("h1", "h1"), ep("h2", "h2")];

        assert_eq!(registry.connect(&endpoints, None).await.unwrap(), 0);
        assert_eq!(registry.read_route(), None);
        assert_eq!(registry.run_timestamp(), None);
        assert!(matches!(
            registry.query(None, "SELECT 1").await,
            Err(Error::NoEndpoint)
        ));
        assert!(matches!(
            registry.write(None, &["SELECT 1".to_string()]).await,
            Err(Error::NoEndpoint)
        ));
        assert!(matches!(
            registry.lock_acquire().await,
            Err(Error::NoEndpoint)
        ));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let connector = MockConnector::new();
        let mut registry = Registry::new(&test_config("h1"), connector.clone());
        let endpoints = vec![ep("h1", "h1"), ep("h2", "h2")];

        assert_eq!(registry.connect(&endpoints, None).await.unwrap(), 2);
        let route = registry.read_route().map(str::to_string);
        let opened = connector.open_count();

        assert_eq!(registry.connect(&endpoints, None).await.unwrap(), 2);
        assert_eq!(registry.read_route().map(str::to_string), route);
        assert_eq!(connector.open_count(), opened);
    }

    #[tokio::test]
    async fn test_duplicate_host_port_connects_once() {
        let connector = MockConnector::new();
        let mut registry = Registry::new(&test_config("h1"), connector.clone());
        let endpoints = vec![ep("h1", "h1"), ep("h1-dup", "h1")];

        assert_eq!(registry.connect(&endpoints, None).await.unwrap(), 1);
        assert_eq!(registry.connected_ids(), vec!["h1"]);
    }

    #[tokio::test]
    async fn test_query_rejects_empty_statement() {
        let connector = MockConnector::new();
        let mut registry = Registry::new(&test_config("h1"), connector.clone());
        registry.connect(&[ep("h1", "h1")], None).await.unwrap();

        assert!(matches!(
            registry.query(None, "  ").await,
            Err(Error::NoStatement)
        ));
    }

    #[tokio::test]
    async fn test_query_unknown_endpoint() {
        let connector = MockConnector::new();
        let mut registry = Registry::new(&test_config("h1"), connector.clone());
        registry.connect(&[ep("h1", "h1")], None).await.unwrap();

        assert!(matches!(
            registry.query(Some("h9"), "SELECT 1").await,
            Err(Error::UnknownEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_query_routes_through_read_route() {
        use crate::executor::SqlValue;

        let connector = MockConnector::new();
        let db1 = MockDatabase::new();
        db1.script_query(
            "SELECT hostname FROM servers",
            vec![vec![SqlValue::Text("h1".to_string())]],
        );
        connector.register("h1", db1);

        let mut registry = Registry::new(&test_config("h1"), connector.clone());
        registry
            .connect(&[ep("h1", "h1"), ep("h2", "h2")], None)
            .await
            .unwrap();

        let rows = registry.query(None, "SELECT hostname FROM servers").await.unwrap();
        assert_eq!(rows, vec![vec![SqlValue::Text("h1".to_string())]]);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let connector = MockConnector::new();
        let db1 = MockDatabase::new();
        connector.register("h1", db1.clone());

        let mut registry = Registry::new(&test_config("h1"), connector.clone());
        registry.connect(&[ep("h1", "h1")], None).await.unwrap();
        assert!(registry.is_active());

        registry.disconnect().await;
        assert_eq!(registry.read_route(), None);
        assert_eq!(registry.run_timestamp(), None);
        assert!(!registry.is_active());
        assert_eq!(db1.meta(&schema::activity_key("id-h1")), Some("0".into()));

        // Second call is a no-op.
        registry.disconnect().await;
        assert_eq!(registry.read_route(), None);
    }

    struct RecordingBootstrap {
        prepared: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LocalBootstrap for RecordingBootstrap {
        async fn prepare(&self, endpoint: &EndpointConfig) -> Result<()> {
            self.prepared.lock().unwrap().push(endpoint.id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_local_bootstrap_runs_for_local_endpoint() {
        let connector = MockConnector::new();
        let bootstrap = Arc::new(RecordingBootstrap {
            prepared: Mutex::new(Vec::new()),
        });

        let mut registry = Registry::new(&test_config("h2"), connector.clone())
            .with_local_bootstrap(bootstrap.clone());
        registry
            .connect(&[ep("h1", "h1"), ep("h2", "h2"), ep("h3", "h3")], None)
            .await
            .unwrap();

        // h1 before any read route existed, h2 because it is local.
        assert_eq!(*bootstrap.prepared.lock().unwrap(), vec!["h1", "h2"]);
    }
}
