//! Decision log: design decisions recorded by instances, pending propagation
//! by an external sync process.
//!
//! A decision is appended once. Marking it synced appends a marker line;
//! the decision line itself is never touched.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cohort_core::paths::decisions_log_path;
use cohort_core::InstanceId;
use cohort_engine::Coordinator;

use crate::error::SyncError;
use crate::journal::Journal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Synced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub id: String,
    pub instance_id: InstanceId,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub status: DecisionStatus,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum DecisionLine {
    Decision(DecisionEntry),
    Synced {
        ids: Vec<String>,
        instance_id: InstanceId,
        timestamp: DateTime<Utc>,
    },
}

pub struct DecisionLog<'a> {
    coord: &'a Coordinator,
    journal: Journal,
}

impl<'a> DecisionLog<'a> {
    pub fn new(coord: &'a Coordinator) -> Self {
        let path = decisions_log_path(&coord.config().coordination_dir);
        Self {
            coord,
            journal: Journal::new(path),
        }
    }

    pub fn with_journal(coord: &'a Coordinator, journal: Journal) -> Self {
        Self { coord, journal }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Append `payload` as a pending decision of this context's instance.
    pub fn record_decision(&self, payload: serde_json::Value) -> Result<DecisionEntry, SyncError> {
        let instance = self.coord.register_instance()?.instance;
        let entry = DecisionEntry {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance.instance_id,
            timestamp: self.coord.now(),
            payload,
            status: DecisionStatus::Pending,
        };
        self.journal
            .append(self.coord, &DecisionLine::Decision(entry.clone()))?;
        tracing::debug!(id = %entry.id, instance = %entry.instance_id, "decision recorded");
        Ok(entry)
    }

    /// Every decision in record order, with its current status.
    pub fn entries(&self) -> Result<Vec<DecisionEntry>, SyncError> {
        let mut entries = Vec::new();
        let mut synced: HashSet<String> = HashSet::new();
        for line in self.journal.read::<DecisionLine>()? {
            match line {
                DecisionLine::Decision(entry) => entries.push(entry),
                DecisionLine::Synced { ids, .. } => synced.extend(ids),
            }
        }
        for entry in &mut entries {
            if synced.contains(&entry.id) {
                entry.status = DecisionStatus::Synced;
            }
        }
        Ok(entries)
    }

    pub fn pending(&self) -> Result<Vec<DecisionEntry>, SyncError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.status == DecisionStatus::Pending)
            .collect())
    }

    /// Mark `ids` synced. Unknown or already-synced ids are ignored; returns
    /// how many decisions changed state.
    pub fn mark_synced(&self, ids: &[String]) -> Result<usize, SyncError> {
        let pending: HashSet<String> = self.pending()?.into_iter().map(|e| e.id).collect();
        let mut fresh: Vec<String> = Vec::new();
        for id in ids {
            if pending.contains(id) && !fresh.contains(id) {
                fresh.push(id.clone());
            }
        }
        if fresh.is_empty() {
            return Ok(0);
        }
        let instance = self.coord.register_instance()?.instance;
        let count = fresh.len();
        self.journal.append(
            self.coord,
            &DecisionLine::Synced {
                ids: fresh,
                instance_id: instance.instance_id,
                timestamp: self.coord.now(),
            },
        )?;
        tracing::info!(count, "decisions marked synced");
        Ok(count)
    }
}
