//! Distributed Lock Manager
//!
//! Cooperative mutual exclusion across hosts, built from a single shared
//! key/value row rather than native database locks: peers may be working
//! against different endpoints of the same replicated database, so the row
//! itself is the only common ground. A holder that stops renewing is reaped
//! after `reap_age`, which is why acquisition never deadlocks on an
//! abandoned lock.
//!
//! Ownership is decided by the unique host id inside the record, never the
//! hostname: two hosts can share a hostname prefix under degraded DNS.

use std::fmt;

use crate::error::Result;
use crate::identity::LocalIdentity;
use crate::registry::Registry;
use crate::schema;

/// Lock manager state machine position:
/// `Idle → Waiting → Held → Idle`, with `Renewing` as a self-transition
/// from `Held`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
    #[default]
    Idle,
    Waiting,
    Held,
    Renewing,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Idle => write!(f, "IDLE"),
            LockState::Waiting => write!(f, "WAITING"),
            LockState::Held => write!(f, "HELD"),
            LockState::Renewing => write!(f, "RENEWING"),
        }
    }
}

/// Parsed contents of the shared lock row:
/// `<hostname>::<host-id>::<epoch-seconds>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub hostname: String,
    pub host_id: String,
    pub requested_at: i64,
}

impl LockRecord {
    pub fn new(identity: &LocalIdentity, requested_at: i64) -> Self {
        Self {
            hostname: identity.hostname.clone(),
            host_id: identity.host_id.clone(),
            requested_at,
        }
    }

    /// Parse a raw lock value; `None` for anything that does not have all
    /// three fields.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split("::");
        let hostname = parts.next()?;
        let host_id = parts.next()?;
        let requested_at = parts.next()?.parse().ok()?;
        if parts.next().is_some() || hostname.is_empty() || host_id.is_empty() {
            return None;
        }
        Some(Self {
            hostname: hostname.to_string(),
            host_id: host_id.to_string(),
            requested_at,
        })
    }

    /// Seconds since the lock was requested, floored at zero for skewed
    /// clocks.
    pub fn age(&self, now: i64) -> i64 {
        (now - self.requested_at).max(0)
    }

    /// Ownership comparison, by unique host id only.
    pub fn is_owned_by(&self, identity: &LocalIdentity) -> bool {
        self.host_id == identity.host_id
    }
}

impl fmt::Display for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.hostname, self.host_id, self.requested_at)
    }
}

impl Registry {
    /// Read the raw lock value verbatim; empty string means unlocked. No
    /// side effects.
    pub async fn lock_check(&self) -> Result<String> {
        Ok(self.meta_get(schema::LOCK_KEY).await?.unwrap_or_default())
    }

    /// Block until this host holds the lock. An abandoned lock (older than
    /// `reap_age`) is cleared and retried immediately; a live peer's lock
    /// is waited out in fixed intervals with no bound on total wait time.
    /// Never errors once connected.
    pub async fn lock_acquire(&mut self) -> Result<()> {
        loop {
            let raw = self.lock_check().await?;
            if raw.is_empty() {
                return self.lock_take().await;
            }

            let Some(record) = LockRecord::parse(&raw) else {
                // Garbage in the lock row would block the fleet forever;
                // treat it as abandoned.
                tracing::warn!(value = %raw, "malformed lock record; clearing");
                self.meta_put_all(schema::LOCK_KEY, "").await?;
                continue;
            };

            if record.is_owned_by(&self.identity) {
                // Already ours from an earlier pass; the timestamp is left
                // untouched.
                // TODO: decide whether re-entry should renew the timestamp.
                // As is, a long-stuck holder looks perpetually fresh to
                // itself while looking reapable to peers.
                self.state.lock_state = LockState::Held;
                return Ok(());
            }

            let now = self.clock_now().await?;
            if record.age(now) > self.tuning.reap_age_secs as i64 {
                tracing::warn!(
                    holder = %record.hostname,
                    holder_id = %record.host_id,
                    age_secs = record.age(now),
                    "reaping abandoned lock"
                );
                self.meta_put_all(schema::LOCK_KEY, "").await?;
                continue;
            }

            if self.state.lock_state != LockState::Waiting {
                tracing::info!(holder = %record.hostname, "lock busy; waiting");
                self.state.lock_state = LockState::Waiting;
            }
            self.set_activity(false).await;
            tokio::time::sleep(self.tuning.lock_retry()).await;
        }
    }

    /// Unconditionally overwrite the lock with a fresh timestamp for this
    /// host, keeping a long-running holder from being reaped by peers.
    pub async fn lock_renew(&mut self) -> Result<()> {
        self.state.lock_state = LockState::Renewing;
        let now = self.clock_now().await?;
        let record = LockRecord::new(&self.identity, now);
        self.meta_put_all(schema::LOCK_KEY, &record.to_string()).await?;
        self.state.lock_state = LockState::Held;
        tracing::info!(value = %record, "lock renewed");
        Ok(())
    }

    /// Clear the lock if it shows a non-empty value; releasing an
    /// already-clear lock is a silent no-op.
    pub async fn lock_release(&mut self) -> Result<()> {
        let raw = self.lock_check().await?;
        if raw.is_empty() {
            self.state.lock_state = LockState::Idle;
            return Ok(());
        }

        self.meta_put_all(schema::LOCK_KEY, "").await?;
        self.set_activity(false).await;
        self.state.lock_state = LockState::Idle;
        tracing::info!("lock released");
        Ok(())
    }

    /// Wait until the lock is free, ours, or reaped, without taking it.
    /// Run by `connect` before the host declares itself active.
    pub(crate) async fn lock_barrier(&mut self) -> Result<()> {
        loop {
            let raw = self.lock_check().await?;
            if raw.is_empty() {
                return Ok(());
            }

            let Some(record) = LockRecord::parse(&raw) else {
                tracing::warn!(value = %raw, "malformed lock record; clearing");
                self.meta_put_all(schema::LOCK_KEY, "").await?;
                return Ok(());
            };

            if record.is_owned_by(&self.identity) {
                return Ok(());
            }

            let now = self.clock_now().await?;
            if record.age(now) > self.tuning.reap_age_secs as i64 {
                tracing::warn!(
                    holder = %record.hostname,
                    age_secs = record.age(now),
                    "reaping abandoned lock left from a previous run"
                );
                self.meta_put_all(schema::LOCK_KEY, "").await?;
                return Ok(());
            }

            tracing::info!(holder = %record.hostname, "waiting for peer lock before going active");
            tokio::time::sleep(self.tuning.lock_retry()).await;
        }
    }

    async fn lock_take(&mut self) -> Result<()> {
        let now = self.clock_now().await?;
        let record = LockRecord::new(&self.identity, now);
        self.meta_put_all(schema::LOCK_KEY, &record.to_string()).await?;
        self.state.lock_state = LockState::Held;
        self.set_activity(true).await;
        tracing::info!(value = %record, "lock acquired");
        Ok(())
    }

    /// "Now" for lease-age decisions comes from the read endpoint's clock,
    /// keeping every host's view of lock age comparable.
    async fn clock_now(&self) -> Result<i64> {
        let (_, exec) = self.read_endpoint()?;
        exec.now_epoch().await
    }
}
