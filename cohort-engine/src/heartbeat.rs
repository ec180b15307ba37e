//! Heartbeat monitor: liveness pings and the stale-lock sweep.
//!
//! Death is never announced. An instance is alive while its heartbeat record
//! is younger than the liveness timeout; a missing or stale record means the
//! instance is gone and its locks may be released by anyone.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use serde_json::json;

use cohort_core::{
    AuditAction, AuditEvent, Clock, CoordConfig, Heartbeat, HeartbeatStatus, InstanceId,
    LockRecord,
};
use cohort_store::LockStore;

use crate::error::CoordError;
use crate::record_audit;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What a sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    /// Locks whose holder was presumed dead.
    pub released: Vec<LockRecord>,
    /// Expired locks of live holders.
    pub purged: Vec<LockRecord>,
    /// Instances whose stale heartbeat was removed.
    pub dead_instances: Vec<InstanceId>,
    /// Expired mailbox messages deleted.
    pub messages_purged: usize,
}

impl SweepReport {
    /// Number of lock records removed.
    pub fn count(&self) -> usize {
        self.released.len() + self.purged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0 && self.dead_instances.is_empty() && self.messages_purged == 0
    }
}

/// A heartbeat record together with its liveness verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceLiveness {
    #[serde(flatten)]
    pub heartbeat: Heartbeat,
    pub alive: bool,
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HeartbeatMonitor {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    config: CoordConfig,
}

impl HeartbeatMonitor {
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>, config: CoordConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(3)
    }

    /// Overwrite the heartbeat of `instance_id` with the current time.
    pub fn ping(&self, instance_id: &InstanceId, pid: u32) -> Result<Heartbeat, CoordError> {
        let previous = self.store.get_heartbeat(instance_id)?;
        let heartbeat = Heartbeat {
            instance_id: instance_id.clone(),
            pid,
            last_ping: self.now(),
            ping_count: previous.map(|h| h.ping_count + 1).unwrap_or(1),
            status: HeartbeatStatus::Active,
        };
        self.store.put_heartbeat(&heartbeat)?;
        tracing::trace!(instance = %instance_id, count = heartbeat.ping_count, "ping");
        Ok(heartbeat)
    }

    /// Record a status change without counting it as a ping.
    pub fn set_status(
        &self,
        instance_id: &InstanceId,
        pid: u32,
        status: HeartbeatStatus,
    ) -> Result<Heartbeat, CoordError> {
        let mut heartbeat = self.store.get_heartbeat(instance_id)?.unwrap_or(Heartbeat {
            instance_id: instance_id.clone(),
            pid,
            last_ping: self.now(),
            ping_count: 0,
            status,
        });
        heartbeat.status = status;
        heartbeat.last_ping = self.now();
        self.store.put_heartbeat(&heartbeat)?;
        Ok(heartbeat)
    }

    pub fn remove(&self, instance_id: &InstanceId) -> Result<bool, CoordError> {
        Ok(self.store.remove_heartbeat(instance_id)?)
    }

    /// `now - last_ping <= liveness_timeout`. No heartbeat means dead.
    pub fn is_alive(&self, instance_id: &InstanceId) -> Result<bool, CoordError> {
        let now = self.now();
        let timeout = self.config.liveness_timeout();
        Ok(self
            .store
            .get_heartbeat(instance_id)?
            .is_some_and(|h| h.is_alive(now, timeout)))
    }

    /// Every heartbeat record with its liveness, sorted by instance id.
    pub fn instances(&self) -> Result<Vec<InstanceLiveness>, CoordError> {
        let now = self.now();
        let timeout = self.config.liveness_timeout();
        let mut out: Vec<InstanceLiveness> = self
            .store
            .list_heartbeats()?
            .into_iter()
            .map(|heartbeat| InstanceLiveness {
                alive: heartbeat.is_alive(now, timeout),
                heartbeat,
            })
            .collect();
        out.sort_by(|a, b| a.heartbeat.instance_id.cmp(&b.heartbeat.instance_id));
        Ok(out)
    }

    /// Release locks of dead holders, purge expired locks, drop stale
    /// heartbeats and expired mail. Removes at most `limit` lock records;
    /// live locks of live holders never count against it.
    ///
    /// Repeating a sweep over already-clean state changes nothing.
    pub fn sweep_stale(&self, limit: Option<usize>) -> Result<SweepReport, CoordError> {
        let now = self.now();
        let timeout = self.config.liveness_timeout();
        let heartbeats: HashMap<InstanceId, Heartbeat> = self
            .store
            .list_heartbeats()?
            .into_iter()
            .map(|h| (h.instance_id.clone(), h))
            .collect();
        let alive = |id: &InstanceId| heartbeats.get(id).is_some_and(|h| h.is_alive(now, timeout));

        let mut report = SweepReport::default();
        let records = self.store.list()?;
        let budget = limit.unwrap_or(usize::MAX);
        let stale = records
            .into_iter()
            .filter(|record| !(alive(record.holder()) && record.is_live(now)))
            .take(budget);
        for record in stale {
            let holder_alive = alive(record.holder());
            if !self.store.force_delete(&record)? {
                // Replaced or released since we listed it.
                continue;
            }
            if holder_alive {
                record_audit(
                    self.store.as_ref(),
                    AuditEvent::for_lock(
                        record.holder().clone(),
                        AuditAction::Purged,
                        &record.file_path,
                        json!({
                            "lock_type": record.lock_type,
                            "expired_at": record.expires_at,
                            "reason": "expired",
                        }),
                        now,
                    ),
                );
                report.purged.push(record);
            } else {
                let last_ping = heartbeats.get(record.holder()).map(|h| h.last_ping);
                tracing::info!(
                    path = %record.file_path.display(),
                    holder = %record.holder(),
                    "released lock of dead instance"
                );
                record_audit(
                    self.store.as_ref(),
                    AuditEvent::for_lock(
                        record.holder().clone(),
                        AuditAction::Swept,
                        &record.file_path,
                        json!({
                            "lock_type": record.lock_type,
                            "pid": record.locked_by.pid,
                            "last_ping": last_ping,
                            "reason": "holder not alive",
                        }),
                        now,
                    ),
                );
                report.released.push(record);
            }
        }

        for heartbeat in heartbeats.values().filter(|h| !h.is_alive(now, timeout)) {
            if self.store.remove_heartbeat(&heartbeat.instance_id)? {
                record_audit(
                    self.store.as_ref(),
                    AuditEvent::for_instance(
                        heartbeat.instance_id.clone(),
                        AuditAction::Swept,
                        json!({ "pid": heartbeat.pid, "last_ping": heartbeat.last_ping }),
                        now,
                    ),
                );
                report.dead_instances.push(heartbeat.instance_id.clone());
            }
        }
        report.dead_instances.sort();

        if let Some(mailbox) = self.store.mailbox() {
            report.messages_purged = mailbox.purge_expired(now)?;
        }

        if !report.is_empty() {
            tracing::info!(
                released = report.released.len(),
                purged = report.purged.len(),
                dead = report.dead_instances.len(),
                messages = report.messages_purged,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Run a bounded sweep if no one swept within the sweep interval.
    pub fn maybe_sweep(&self) -> Result<Option<SweepReport>, CoordError> {
        if !self
            .store
            .claim_sweep(self.now(), self.config.sweep_interval())?
        {
            return Ok(None);
        }
        self.sweep_stale(Some(self.config.sweep_batch_limit)).map(Some)
    }
}
