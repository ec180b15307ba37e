//! Work registry: the task each instance currently claims.
//!
//! A new claim supersedes the instance's previous active claim. Completion
//! is an appended marker. Current state is a fold over the journal.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cohort_core::paths::work_log_path;
use cohort_core::InstanceId;
use cohort_engine::Coordinator;

use crate::error::SyncError;
use crate::journal::Journal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Active,
    Superseded,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkClaim {
    pub claim_id: String,
    pub instance_id: InstanceId,
    pub timestamp: DateTime<Utc>,
    pub task: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    pub status: WorkStatus,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WorkLine {
    Claim(WorkClaim),
    Complete {
        claim_id: String,
        instance_id: InstanceId,
        timestamp: DateTime<Utc>,
    },
}

pub struct WorkRegistry<'a> {
    coord: &'a Coordinator,
    journal: Journal,
}

impl<'a> WorkRegistry<'a> {
    pub fn new(coord: &'a Coordinator) -> Self {
        let path = work_log_path(&coord.config().coordination_dir);
        Self {
            coord,
            journal: Journal::new(path),
        }
    }

    pub fn with_journal(coord: &'a Coordinator, journal: Journal) -> Self {
        Self { coord, journal }
    }

    /// Claim `task` for this context's instance.
    pub fn claim(
        &self,
        task: &str,
        description: &str,
        files: Vec<PathBuf>,
    ) -> Result<WorkClaim, SyncError> {
        let instance = self.coord.register_instance()?.instance;
        let claim = WorkClaim {
            claim_id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance.instance_id,
            timestamp: self.coord.now(),
            task: task.to_string(),
            description: description.to_string(),
            files,
            status: WorkStatus::Active,
        };
        self.journal
            .append(self.coord, &WorkLine::Claim(claim.clone()))?;
        tracing::debug!(instance = %claim.instance_id, task, "work claimed");
        Ok(claim)
    }

    /// Complete this instance's active claim. `Ok(None)` when it has none.
    pub fn complete(&self) -> Result<Option<WorkClaim>, SyncError> {
        let Some(instance) = self.coord.current_instance()? else {
            return Ok(None);
        };
        let Some(mut claim) = self
            .active_claims()?
            .into_iter()
            .find(|c| c.instance_id == instance.instance_id)
        else {
            return Ok(None);
        };
        self.journal.append(
            self.coord,
            &WorkLine::Complete {
                claim_id: claim.claim_id.clone(),
                instance_id: instance.instance_id,
                timestamp: self.coord.now(),
            },
        )?;
        claim.status = WorkStatus::Completed;
        Ok(Some(claim))
    }

    /// Every claim in order, with its folded status.
    pub fn history(&self) -> Result<Vec<WorkClaim>, SyncError> {
        let mut claims: Vec<WorkClaim> = Vec::new();
        for line in self.journal.read::<WorkLine>()? {
            match line {
                WorkLine::Claim(claim) => {
                    for earlier in claims.iter_mut().filter(|c| {
                        c.instance_id == claim.instance_id && c.status == WorkStatus::Active
                    }) {
                        earlier.status = WorkStatus::Superseded;
                    }
                    claims.push(claim);
                }
                WorkLine::Complete { claim_id, .. } => {
                    if let Some(done) = claims.iter_mut().find(|c| c.claim_id == claim_id) {
                        done.status = WorkStatus::Completed;
                    }
                }
            }
        }
        Ok(claims)
    }

    pub fn active_claims(&self) -> Result<Vec<WorkClaim>, SyncError> {
        Ok(self
            .history()?
            .into_iter()
            .filter(|c| c.status == WorkStatus::Active)
            .collect())
    }
}
