//! Batched Multi-Endpoint Writer
//!
//! Applies one or many statements to one endpoint or to all connected
//! endpoints. Long lists are split into chunks to bound peak memory and
//! transaction log size; each chunk is its own explicit transaction and the
//! unit of atomicity: a mid-chunk failure commits nothing from that chunk
//! but leaves earlier chunks committed. Writes fan out endpoint-by-endpoint
//! in registry order; one endpoint failing never cancels the others
//! (best-effort replication, not atomic distributed commit).

use crate::error::{Error, Result};
use crate::probe::liveness_probe;
use crate::registry::Registry;

/// Split an ordered statement list at the batch limit.
pub(crate) fn chunk_statements(statements: &[String], max_batch_size: usize) -> Vec<&[String]> {
    statements.chunks(max_batch_size.max(1)).collect()
}

impl Registry {
    /// Apply statements to the named endpoint, or fan out to every
    /// connected endpoint when none is given. Returns how many endpoints
    /// applied the full list. With a named endpoint, its failure is the
    /// caller's error; on fan-out, per-endpoint failures are logged and the
    /// remaining endpoints still get the write.
    pub async fn write(&self, endpoint: Option<&str>, statements: &[String]) -> Result<usize> {
        if statements.is_empty() || statements.iter().all(|s| s.trim().is_empty()) {
            return Err(Error::NoStatement);
        }

        match endpoint {
            Some(id) => {
                // Resolves before any work; fails closed when nothing is
                // connected.
                self.executor_for(id)?;
                self.write_endpoint(id, statements).await?;
                Ok(1)
            }
            None => {
                if self.endpoints.is_empty() {
                    return Err(Error::NoEndpoint);
                }
                let targets: Vec<String> = self
                    .endpoints
                    .iter()
                    .map(|e| e.config.id.clone())
                    .collect();

                let mut applied = 0;
                for id in &targets {
                    match self.write_endpoint(id, statements).await {
                        Ok(()) => applied += 1,
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            tracing::warn!(
                                endpoint = %id,
                                error = %e,
                                "write failed; continuing with remaining endpoints"
                            );
                        }
                    }
                }
                Ok(applied)
            }
        }
    }

    /// Convenience for a single statement.
    pub async fn write_one(&self, endpoint: Option<&str>, sql: &str) -> Result<usize> {
        let statements = [sql.to_string()];
        self.write(endpoint, &statements).await
    }

    async fn write_endpoint(&self, id: &str, statements: &[String]) -> Result<()> {
        let exec = self.executor_for(id)?;
        liveness_probe(id, exec.as_ref(), self.tuning.probe_timeout()).await?;

        for chunk in chunk_statements(statements, self.tuning.max_batch_size) {
            if let [single] = chunk {
                // A lone statement rides on autocommit.
                exec.execute(single).await?;
            } else {
                exec.execute_transaction(chunk).await?;
            }
        }
        Ok(())
    }
}
