//! The adapter-facing call surface.
//!
//! A [`Coordinator`] binds one working context (session name or owner pid)
//! to a store and a clock. Each call re-reads persisted state; the struct
//! itself holds configuration only.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde_json::json;

use cohort_core::{
    AuditAction, AuditEvent, Clock, CoordConfig, Heartbeat, HeartbeatStatus, Instance,
    InstanceId, InstanceStatus, LockHolder, LockRecord, LockType, Message, Priority, SystemClock,
};
use cohort_store::{open_store, LockStore};

use crate::error::CoordError;
use crate::heartbeat::{HeartbeatMonitor, InstanceLiveness, SweepReport};
use crate::identity::{context_key, Identity, Registration};
use crate::manager::{AcquireOutcome, DenyReason, LockManager, LockStatus, ReleaseOutcome};
use crate::record_audit;

pub struct Coordinator {
    config: CoordConfig,
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    identity: Identity,
    monitor: HeartbeatMonitor,
    manager: LockManager,
    context: String,
    owner_pid: u32,
}

impl Coordinator {
    /// Validate `config`, open its store and bind to a context.
    pub fn open(
        config: CoordConfig,
        session: Option<&str>,
        owner_pid: u32,
    ) -> Result<Self, CoordError> {
        config.validate()?;
        let store = open_store(&config)?;
        Ok(Self::with_parts(
            config,
            store,
            Arc::new(SystemClock),
            session,
            owner_pid,
        ))
    }

    /// Assemble from explicit parts. Tests pass a manual clock here.
    pub fn with_parts(
        config: CoordConfig,
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        session: Option<&str>,
        owner_pid: u32,
    ) -> Self {
        let monitor = HeartbeatMonitor::new(store.clone(), clock.clone(), config.clone());
        let manager = LockManager::new(store.clone(), clock.clone(), config.clone(), monitor.clone());
        let identity = Identity::new(&config.coordination_dir, &config.root);
        Self {
            context: context_key(session, owner_pid),
            config,
            store,
            clock,
            identity,
            monitor,
            manager,
            owner_pid,
        }
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    /// Current time on this coordinator's clock, at stored precision.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(3)
    }

    pub fn manager(&self) -> &LockManager {
        &self.manager
    }

    pub fn monitor(&self) -> &HeartbeatMonitor {
        &self.monitor
    }

    // Instances -----------------------------------------------------------

    /// Return the live identity of this context or mint one, and ping.
    pub fn register_instance(&self) -> Result<Registration, CoordError> {
        let now = self.now();
        let registration = self.identity.register(&self.context, self.owner_pid, now)?;
        let instance = &registration.instance;
        self.monitor.ping(&instance.instance_id, instance.pid)?;
        if !registration.reused {
            record_audit(
                self.store.as_ref(),
                AuditEvent::for_instance(
                    instance.instance_id.clone(),
                    AuditAction::Registered,
                    json!({
                        "context": self.context,
                        "pid": instance.pid,
                        "capabilities": instance.capabilities,
                    }),
                    now,
                ),
            );
        }
        Ok(registration)
    }

    /// The registered identity of this context, without registering.
    pub fn current_instance(&self) -> Result<Option<Instance>, CoordError> {
        Ok(self
            .identity
            .load(&self.context)?
            .filter(|i| i.status != InstanceStatus::Stopped))
    }

    fn require_instance(&self) -> Result<Instance, CoordError> {
        self.current_instance()?
            .ok_or_else(|| CoordError::UnknownInstance {
                context: self.context.clone(),
            })
    }

    fn holder(instance: &Instance) -> LockHolder {
        LockHolder {
            instance_id: instance.instance_id.clone(),
            pid: instance.pid,
        }
    }

    /// Ping on behalf of the registered instance.
    pub fn heartbeat(&self) -> Result<Heartbeat, CoordError> {
        let instance = self.require_instance()?;
        self.monitor.ping(&instance.instance_id, instance.pid)
    }

    /// Stop this context's instance: release its locks, drop its heartbeat
    /// and identity file. `Ok(None)` when nothing was registered.
    pub fn deregister_instance(&self) -> Result<Option<InstanceId>, CoordError> {
        let Some(instance) = self.current_instance()? else {
            return Ok(None);
        };
        let id = &instance.instance_id;
        self.monitor
            .set_status(id, instance.pid, HeartbeatStatus::Stopping)?;
        let released = self.manager.release_all(id)?;
        self.monitor.remove(id)?;
        self.identity.retire(&self.context)?;
        record_audit(
            self.store.as_ref(),
            AuditEvent::for_instance(
                id.clone(),
                AuditAction::Deregistered,
                json!({ "context": self.context, "released": released.len() }),
                self.clock.now().trunc_subsecs(3),
            ),
        );
        tracing::info!(instance = %id, released = released.len(), "deregistered instance");
        Ok(Some(instance.instance_id))
    }

    pub fn instances(&self) -> Result<Vec<InstanceLiveness>, CoordError> {
        self.monitor.instances()
    }

    // Locks ---------------------------------------------------------------

    /// Acquire on behalf of this context, registering it first if needed.
    pub fn acquire_file_lock(
        &self,
        path: &Path,
        lock_type: LockType,
        ttl: Option<Duration>,
        intent: &str,
    ) -> Result<AcquireOutcome, CoordError> {
        let registration = match self.register_instance() {
            Ok(registration) => registration,
            // Unusable paths still error; a failing store is a denial.
            Err(CoordError::Store(e)) => {
                let path = self.manager.canonical(path)?;
                return Ok(self.manager.denied_by_store(&path, &e));
            }
            Err(e @ (CoordError::Io { .. } | CoordError::Json(_))) => {
                let path = self.manager.canonical(path)?;
                tracing::error!(path = %path.display(), error = %e, "cannot register before acquire");
                return Ok(AcquireOutcome::Denied {
                    path,
                    reason: DenyReason::StoreUnavailable,
                    holder: None,
                });
            }
            Err(e) => return Err(e),
        };
        self.manager.acquire(
            &Self::holder(&registration.instance),
            path,
            lock_type,
            ttl,
            intent,
        )
    }

    /// Release this context's locks on `path`. Without a registered
    /// instance there is nothing to release.
    pub fn release_file_lock(&self, path: &Path) -> Result<ReleaseOutcome, CoordError> {
        match self.current_instance()? {
            Some(instance) => self.manager.release(&instance.instance_id, path),
            None => Ok(ReleaseOutcome::NotHeld),
        }
    }

    pub fn extend_file_lock(
        &self,
        path: &Path,
        ttl: Option<Duration>,
    ) -> Result<LockRecord, CoordError> {
        let instance = self.require_instance()?;
        self.manager.extend(&instance.instance_id, path, ttl)
    }

    pub fn is_file_locked(&self, path: &Path) -> Result<LockStatus, CoordError> {
        self.manager.is_locked(path)
    }

    pub fn get_lock_info(&self, path: &Path) -> Result<Option<LockRecord>, CoordError> {
        self.manager.inspect(path)
    }

    pub fn list_locks(&self, include_expired: bool) -> Result<Vec<LockRecord>, CoordError> {
        self.manager.list_locks(include_expired)
    }

    /// Full sweep, regardless of when the last one ran.
    pub fn cleanup_stale(&self) -> Result<SweepReport, CoordError> {
        self.monitor.sweep_stale(None)
    }

    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>, CoordError> {
        Ok(self.store.recent_audit(limit)?)
    }

    // Mailbox ---------------------------------------------------------------

    fn mailbox(&self) -> Result<&dyn cohort_store::Mailbox, CoordError> {
        self.store
            .mailbox()
            .ok_or(CoordError::MailboxUnsupported {
                backend: self.store.backend(),
            })
    }

    /// Send from this context's instance to `to` (an instance id or `*`).
    pub fn send_message(
        &self,
        to: &str,
        message_type: &str,
        payload: serde_json::Value,
        priority: Priority,
        ttl: Option<Duration>,
    ) -> Result<Message, CoordError> {
        let mailbox = self.mailbox()?;
        let instance = self.register_instance()?.instance;
        let ttl = match ttl {
            Some(t) if t <= Duration::zero() => {
                return Err(CoordError::InvalidTtl {
                    secs: t.num_seconds(),
                })
            }
            Some(t) => t,
            None => self.config.message_ttl(),
        };
        let now = self.clock.now().trunc_subsecs(3);
        let message = Message {
            message_id: uuid::Uuid::new_v4().to_string(),
            from_instance: instance.instance_id,
            to_instance: to.to_string(),
            message_type: message_type.to_string(),
            payload,
            priority,
            expires_at: now + ttl,
            created_at: now,
        };
        mailbox.send(&message)?;
        tracing::debug!(to, message_type, "message sent");
        Ok(message)
    }

    /// Undelivered mail waiting for this context's instance. `None` when the
    /// backend has no mailbox.
    pub fn pending_message_count(&self) -> Result<Option<usize>, CoordError> {
        let Some(mailbox) = self.store.mailbox() else {
            return Ok(None);
        };
        let Some(instance) = self.current_instance()? else {
            return Ok(Some(0));
        };
        let now = self.clock.now().trunc_subsecs(3);
        Ok(Some(mailbox.pending_count(&instance.instance_id, now)?))
    }

    /// Undelivered messages for this context's instance.
    pub fn drain_messages(&self) -> Result<Vec<Message>, CoordError> {
        let mailbox = self.mailbox()?;
        let instance = self.require_instance()?;
        Ok(mailbox.drain(&instance.instance_id, self.clock.now().trunc_subsecs(3))?)
    }
}
