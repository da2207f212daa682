//! Liveness Probe
//!
//! A half-dead network connection can hang a query forever; every
//! externally visible query or write is preceded by this bounded-time
//! round-trip. Expiry is not retryable: it returns the distinguished
//! `LivenessTimeout` error (`Error::is_fatal()`), and the process-level
//! supervisor is expected to terminate the run rather than unwind a query
//! already in flight.

use std::time::Duration;

use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::executor::Executor;

/// Run a trivial query against the endpoint under a hard wall-clock
/// deadline. Success cancels the deadline.
pub async fn liveness_probe(
    endpoint_id: &str,
    exec: &dyn Executor,
    deadline: Duration,
) -> Result<()> {
    match timeout(deadline, exec.ping()).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(
                endpoint = endpoint_id,
                deadline_secs = deadline.as_secs(),
                "liveness probe deadline elapsed; connection presumed hung"
            );
            Err(Error::LivenessTimeout {
                endpoint: endpoint_id.to_string(),
                timeout: deadline,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::{MockDatabase, MockExecutor};

    #[tokio::test(start_paused = true)]
    async fn test_probe_passes_responsive_endpoint() {
        let db = MockDatabase::new();
        let exec = MockExecutor::new(db);
        liveness_probe("h1", &exec, Duration::from_secs(10))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_times_out_on_hung_endpoint() {
        let db = MockDatabase::new();
        db.set_ping_delay(Duration::from_secs(60));
        let exec = MockExecutor::new(db);

        let err = liveness_probe("h1", &exec, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::LivenessTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_within_deadline_succeeds() {
        let db = MockDatabase::new();
        db.set_ping_delay(Duration::from_secs(3));
        let exec = MockExecutor::new(db);

        liveness_probe("h1", &exec, Duration::from_secs(10))
            .await
            .unwrap();
    }
}
