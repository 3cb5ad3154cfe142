use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::ControlDecision;
use crate::repo::pg::PgRepo;

#[derive(Default)]
struct Inner {
    decisions: Vec<ControlDecision>,
    executed: Option<ControlDecision>,
}

/// Latest optimal trajectory, in memory and (when a store is wired) in the
/// `mpc_decisions` table, plus the executed marker the executor uses to
/// suppress redundant re-applies.
pub struct DecisionStore {
    inner: Mutex<Inner>,
    db: Option<Arc<PgRepo>>,
}

impl DecisionStore {
    pub fn new(db: Option<Arc<PgRepo>>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            db,
        }
    }

    /// Replace the trajectory. The durable write happens first, in one
    /// transaction; a failed write leaves both the table and the in-memory
    /// state untouched so the owning task can retry. On success the executed
    /// marker is cleared.
    pub async fn save(&self, mut decisions: Vec<ControlDecision>) -> Result<()> {
        decisions.sort_by_key(|d| d.timestamp);
        if let Some(db) = &self.db {
            db.decisions().replace_from(&decisions).await?;
        }
        let mut inner = self.inner.lock().await;
        inner.decisions = decisions;
        inner.executed = None;
        Ok(())
    }

    /// Load the persisted trajectory covering `now` (one slot of slack so the
    /// active hour survives a restart). The executed marker starts cleared.
    pub async fn load_latest(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let cutoff = now - Duration::hours(1);
        let decisions = db.decisions().load_from(cutoff).await?;
        let count = decisions.len();
        if count > 0 {
            info!(count, "resumed persisted trajectory");
        } else {
            debug!("no persisted trajectory to resume");
        }
        let mut inner = self.inner.lock().await;
        inner.decisions = decisions;
        inner.executed = None;
        Ok(count)
    }

    /// The decision whose `[timestamp, timestamp + 1h)` window contains `now`.
    pub async fn current_for(&self, now: DateTime<Utc>) -> Option<ControlDecision> {
        let inner = self.inner.lock().await;
        inner.decisions.iter().find(|d| d.covers(now)).cloned()
    }

    pub async fn first(&self) -> Option<ControlDecision> {
        self.inner.lock().await.decisions.first().cloned()
    }

    pub async fn trajectory(&self) -> Vec<ControlDecision> {
        self.inner.lock().await.decisions.clone()
    }

    pub async fn executed(&self) -> Option<ControlDecision> {
        self.inner.lock().await.executed.clone()
    }

    /// True when the executed marker covers the same slot as `decision`.
    pub async fn is_executed(&self, decision: &ControlDecision) -> bool {
        self.inner
            .lock()
            .await
            .executed
            .as_ref()
            .is_some_and(|e| e.timestamp == decision.timestamp)
    }

    pub async fn mark_executed(&self, decision: ControlDecision) {
        self.inner.lock().await.executed = Some(decision);
    }

    pub async fn clear_executed(&self) {
        self.inner.lock().await.executed = None;
    }
}
