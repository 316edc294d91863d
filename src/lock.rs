//! Durable, lease-based mutual exclusion for scheduled jobs.
//!
//! The lock lives in the database rather than in process memory, so two
//! processes (or two nodes sharing the database) never run the same job at
//! once. A lease that outlives its TTL, e.g. after a crash, can be taken over
//! by the next run. A live run keeps its lease fresh with
//! [`RunLockGuard::keep_alive`].

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::Database;

pub struct RunLock {
    db: Database,
    name: String,
    ttl: Duration,
}

impl RunLock {
    pub fn new(db: Database, name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            db,
            name: name.into(),
            ttl,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Try to take the lock at `now`. `Ok(None)` means a live lease is held
    /// elsewhere.
    pub fn try_acquire(&self, now: DateTime<Utc>) -> Result<Option<RunLockGuard>> {
        let holder = format!("pid-{}-{}", std::process::id(), Uuid::new_v4());
        let expires_at = now + chrono::Duration::from_std(self.ttl)?;

        if !self
            .db
            .try_acquire_lock(&self.name, &holder, now, expires_at)?
        {
            return Ok(None);
        }

        tracing::debug!(lock = %self.name, %holder, %expires_at, "run-lock acquired");
        Ok(Some(RunLockGuard {
            db: self.db.clone(),
            name: self.name.clone(),
            holder,
            ttl: self.ttl,
            released: false,
        }))
    }
}

/// Held lease. Dropping the guard releases it, so every exit path
/// (including a panic unwinding through the job) frees the lock.
pub struct RunLockGuard {
    db: Database,
    name: String,
    holder: String,
    ttl: Duration,
    released: bool,
}

impl RunLockGuard {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Extend the lease to `now + ttl`. `Ok(false)` means the lease was
    /// taken over and this guard no longer holds the lock.
    pub fn renew(&self, now: DateTime<Utc>) -> Result<bool> {
        let expires_at = now + chrono::Duration::from_std(self.ttl)?;
        self.db.renew_lock(&self.name, &self.holder, expires_at)
    }

    /// Renew the lease every third of its TTL. Returns only when the lease
    /// is lost or cannot be renewed, after cancelling `lost`.
    pub async fn keep_alive(&self, lost: &CancellationToken) {
        let every = (self.ttl / 3).max(Duration::from_millis(10));
        loop {
            tokio::time::sleep(every).await;
            match self.renew(Utc::now()) {
                Ok(true) => tracing::trace!(lock = %self.name, "run-lock renewed"),
                Ok(false) => {
                    tracing::error!(lock = %self.name, holder = %self.holder, "run-lock lease lost");
                    lost.cancel();
                    return;
                }
                Err(e) => {
                    tracing::error!(lock = %self.name, error = %e, "failed to renew run-lock");
                    lost.cancel();
                    return;
                }
            }
        }
    }

    /// Release explicitly and surface any store error.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.db.release_lock(&self.name, &self.holder)?;
        tracing::debug!(lock = %self.name, "run-lock released");
        Ok(())
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.db.release_lock(&self.name, &self.holder) {
            Ok(_) => tracing::debug!(lock = %self.name, "run-lock released"),
            Err(e) => tracing::error!(lock = %self.name, error = %e, "failed to release run-lock"),
        }
    }
}
