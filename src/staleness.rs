//! Staleness Detector / Resync Coordinator
//!
//! Runs once per connect cycle. Compares each endpoint's recorded write
//! timestamps (for the program's logical source, and optionally per watched
//! table) against the fleet-wide maximum; anything strictly behind is
//! flagged and reads are routed away from it. This only flags; resync
//! execution belongs to the caller, triggered by the resync flag.

use std::collections::{BTreeMap, HashSet};

use crate::error::Result;
use crate::registry::Registry;

/// What a staleness comparison was scoped to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StalenessScope {
    /// Per-source timestamps from the coordination tables
    Source(String),
    /// `MAX(modified_date)` over a watched application table
    Table(String),
}

impl std::fmt::Display for StalenessScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StalenessScope::Source(source) => write!(f, "source:{}", source),
            StalenessScope::Table(table) => write!(f, "table:{}", table),
        }
    }
}

/// One endpoint flagged behind the fleet maximum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalenessRecord {
    pub endpoint: String,
    pub scope: StalenessScope,
    /// What the endpoint had recorded (0 when it had nothing)
    pub observed: i64,
    /// The maximum across all connected endpoints
    pub fleet_max: i64,
}

/// Fleet maximum and the endpoints strictly below it. Equal timestamps
/// everywhere means nobody is behind; a missing timestamp reads as 0.
pub(crate) fn find_behind(observations: &[(String, i64)]) -> (i64, Vec<String>) {
    let fleet_max = observations.iter().map(|(_, ts)| *ts).max().unwrap_or(0);
    let behind = observations
        .iter()
        .filter(|(_, ts)| *ts < fleet_max)
        .map(|(id, _)| id.clone())
        .collect();
    (fleet_max, behind)
}

impl Registry {
    /// Compare timestamps across all connected endpoints and flag the ones
    /// that are behind. Reassigns the read route if it pointed at a flagged
    /// endpoint.
    pub(crate) async fn detect_staleness(
        &mut self,
        watched_tables: Option<&BTreeMap<String, Option<String>>>,
    ) -> Result<()> {
        self.state.staleness.clear();
        self.state.resync_needed = false;

        let mut behind_union: HashSet<String> = HashSet::new();

        // Source-level pass.
        let mut observations = Vec::with_capacity(self.endpoints.len());
        for ep in &self.endpoints {
            let observed = match ep.executor.source_timestamp(&self.identity.source).await {
                Ok(ts) => ts.unwrap_or(0),
                Err(e) => {
                    // Unreadable counts as never-written: the conservative
                    // direction, it flags a resync instead of trusting it.
                    tracing::warn!(endpoint = %ep.config.id, error = %e, "could not read source timestamp");
                    0
                }
            };
            observations.push((ep.config.id.clone(), observed));
        }

        let (fleet_max, behind) = find_behind(&observations);
        for (id, observed) in &observations {
            if behind.contains(id) {
                tracing::warn!(
                    endpoint = %id,
                    observed,
                    fleet_max,
                    "endpoint behind on source timestamps"
                );
                behind_union.insert(id.clone());
                self.state.staleness.push(StalenessRecord {
                    endpoint: id.clone(),
                    scope: StalenessScope::Source(self.identity.source.clone()),
                    observed: *observed,
                    fleet_max,
                });
            }
        }

        // Per-table pass, independent of the source-level outcome.
        if let Some(tables) = watched_tables {
            for (table, host_column) in tables {
                let mut table_obs = Vec::with_capacity(self.endpoints.len());
                for ep in &self.endpoints {
                    let filter = host_column
                        .as_deref()
                        .map(|column| (column, self.identity.hostname.as_str()));
                    let observed = match ep.executor.table_timestamp(table, filter).await {
                        Ok(ts) => ts.unwrap_or(0),
                        Err(e) => {
                            tracing::warn!(endpoint = %ep.config.id, table = %table, error = %e, "could not read table timestamp");
                            0
                        }
                    };
                    table_obs.push((ep.config.id.clone(), observed));
                }

                let (table_max, table_behind) = find_behind(&table_obs);
                for (id, observed) in &table_obs {
                    if table_behind.contains(id) {
                        tracing::warn!(
                            endpoint = %id,
                            table = %table,
                            observed,
                            fleet_max = table_max,
                            "endpoint behind on watched table"
                        );
                        behind_union.insert(id.clone());
                        self.state.staleness.push(StalenessRecord {
                            endpoint: id.clone(),
                            scope: StalenessScope::Table(table.clone()),
                            observed: *observed,
                            fleet_max: table_max,
                        });
                    }
                }
            }
        }

        self.state.resync_needed = !self.state.staleness.is_empty();

        // Reads must not come from a flagged endpoint: move to the next
        // clean endpoint in registry order, or go empty.
        if let Some(route) = self.state.read_route.clone() {
            if behind_union.contains(&route) {
                let next = self
                    .endpoints
                    .iter()
                    .map(|e| e.config.id.clone())
                    .find(|id| !behind_union.contains(id));
                match &next {
                    Some(id) => {
                        tracing::warn!(from = %route, to = %id, "read route reassigned away from stale endpoint")
                    }
                    None => tracing::warn!(from = %route, "no non-stale endpoint left; read route cleared"),
                }
                self.state.read_route = next;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::{MockConnector, MockDatabase};
    use crate::registry::tests::{ep, test_config};

    #[test]
    fn test_find_behind() {
        let obs = vec![
            ("h1".to_string(), 100),
            ("h2".to_string(), 50),
            ("h3".to_string(), 100),
        ];
        let (max, behind) = find_behind(&obs);
        assert_eq!(max, 100);
        assert_eq!(behind, vec!["h2".to_string()]);
    }

    #[test]
    fn test_find_behind_all_equal() {
        let obs = vec![("h1".to_string(), 100), ("h3".to_string(), 100)];
        let (max, behind) = find_behind(&obs);
        assert_eq!(max, 100);
        assert!(behind.is_empty());
    }

    #[test]
    fn test_find_behind_empty() {
        let (max, behind) = find_behind(&[]);
        assert_eq!(max, 0);
        assert!(behind.is_empty());
    }

    #[tokio::test]
    async fn test_behind_endpoint_is_flagged() {
        let connector = MockConnector::new();
        for (id, ts) in [("h1", 100), ("h2", 50), ("h3", 100)] {
            let db = MockDatabase::new();
            db.set_source_timestamp("peer", "fleetsync", ts);
            connector.register(id, db);
        }

        let mut registry = Registry::new(&test_config("h1"), connector.clone());
        registry
            .connect(&[ep("h1", "h1"), ep("h2", "h2"), ep("h3", "h3")], None)
            .await
            .unwrap();

        assert!(registry.resync_needed());
        let records = registry.staleness_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].endpoint, "h2");
        assert_eq!(records[0].observed, 50);
        assert_eq!(records[0].fleet_max, 100);
        assert_eq!(
            records[0].scope,
            StalenessScope::Source("fleetsync".to_string())
        );
        // The read route was clean and stays put.
        assert_eq!(registry.read_route(), Some("h1"));
    }

    #[tokio::test]
    async fn test_agreeing_endpoints_need_no_resync() {
        let connector = MockConnector::new();
        for id in ["h1", "h3"] {
            let db = MockDatabase::new();
            db.set_source_timestamp("peer", "fleetsync", 100);
            connector.register(id, db);
        }

        let mut registry = Registry::new(&test_config("h1"), connector.clone());
        registry
            .connect(&[ep("h1", "h1"), ep("h3", "h3")], None)
            .await
            .unwrap();

        assert!(!registry.resync_needed());
        assert!(registry.staleness_records().is_empty());
    }

    #[tokio::test]
    async fn test_never_written_endpoint_reads_as_zero() {
        let connector = MockConnector::new();
        let db2 = MockDatabase::new();
        db2.set_source_timestamp("peer", "fleetsync", 100);
        connector.register("h2", db2);
        // h1 has no timestamp at all.

        let mut registry = Registry::new(&test_config("hx"), connector.clone());
        registry
            .connect(&[ep("h1", "h1"), ep("h2", "h2")], None)
            .await
            .unwrap();

        assert!(registry.resync_needed());
        let records = registry.staleness_records();
        assert_eq!(records[0].endpoint, "h1");
        assert_eq!(records[0].observed, 0);
    }

    #[tokio::test]
    async fn test_read_route_reassigned_away_from_stale_endpoint() {
        let connector = MockConnector::new();
        let db1 = MockDatabase::new();
        db1.set_source_timestamp("peer", "fleetsync", 50);
        let db2 = MockDatabase::new();
        db2.set_source_timestamp("peer", "fleetsync", 100);
        connector.register("h1", db1);
        connector.register("h2", db2);

        // Local host matches neither endpoint: the first connected would be
        // the read route until the detector moves it.
        let mut registry = Registry::new(&test_config("hx"), connector.clone());
        registry
            .connect(&[ep("h1", "h1"), ep("h2", "h2")], None)
            .await
            .unwrap();

        assert!(registry.resync_needed());
        assert_eq!(registry.read_route(), Some("h2"));
    }

    #[tokio::test]
    async fn test_read_route_cleared_when_every_endpoint_flagged() {
        let connector = MockConnector::new();
        let db1 = MockDatabase::new();
        db1.set_source_timestamp("peer", "fleetsync", 50);
        db1.set_table_timestamp("servers", 200);
        let db2 = MockDatabase::new();
        db2.set_source_timestamp("peer", "fleetsync", 100);
        db2.set_table_timestamp("servers", 100);
        connector.register("h1", db1);
        connector.register("h2", db2);

        let watched = BTreeMap::from([("servers".to_string(), None)]);
        let mut registry = Registry::new(&test_config("hx"), connector.clone());
        registry
            .connect(&[ep("h1", "h1"), ep("h2", "h2")], Some(&watched))
            .await
            .unwrap();

        // h1 behind on source, h2 behind on the watched table: no endpoint
        // qualifies for reads.
        assert!(registry.resync_needed());
        assert_eq!(registry.read_route(), None);
        assert_eq!(registry.staleness_records().len(), 2);
    }

    #[tokio::test]
    async fn test_watched_table_with_host_column() {
        let connector = MockConnector::new();
        let db1 = MockDatabase::new();
        db1.set_table_host_timestamp("servers", "h1", 300);
        let db2 = MockDatabase::new();
        db2.set_table_host_timestamp("servers", "h1", 100);
        connector.register("h1", db1);
        connector.register("h2", db2);

        let watched = BTreeMap::from([(
            "servers".to_string(),
            Some("server_host".to_string()),
        )]);
        let mut registry = Registry::new(&test_config("h1"), connector.clone());
        registry
            .connect(&[ep("h1", "h1"), ep("h2", "h2")], Some(&watched))
            .await
            .unwrap();

        assert!(registry.resync_needed());
        let records = registry.staleness_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].endpoint, "h2");
        assert_eq!(records[0].scope, StalenessScope::Table("servers".to_string()));
    }
}
