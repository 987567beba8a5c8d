//! Task lifecycle.
//!
//! ```text
//! INBOX --start--> ACTIVE --close--> COMPLETED --reopen--> ACTIVE
//!                  ACTIVE --halt---> HALTED    --resume--> ACTIVE
//!                  ACTIVE --dump---> DUMPED (terminal)
//! ```
//!
//! Entering ACTIVE declares the task's partitions and may lock them. Leaving
//! ACTIVE releases the owner's locks and its partition entry. Closing needs a
//! passing verification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

use crate::{
    events::{EventLog, EventType},
    ids,
    lock::{Acquisition, Holder, HolderInfo, LockKind, LockManager},
    partition::{normalize_prefixes, Conflict, Partitions},
    registry::ErrorRegistry,
    store::StateStore,
    Error, Result,
};

/// Directory of task documents.
pub const TASKS_DIR: &str = "tasks";
const SEQUENCE_GUARD: &str = "tasks/_sequence";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum TaskState {
    /// Created, not yet started
    Inbox,
    /// Being worked on by its owner
    Active,
    /// Verified and closed
    Completed,
    /// Paused, waiting on a resume condition
    Halted,
    /// Abandoned for good
    Dumped,
}

impl TaskState {
    /// Returns true if this state allows transition to next state
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Inbox | Self::Halted | Self::Completed, Self::Active)
                | (Self::Active, Self::Completed | Self::Halted | Self::Dumped)
        )
    }

    /// Returns all valid next states from current state
    #[must_use]
    pub fn valid_next_states(self) -> Vec<Self> {
        Self::iter().filter(|next| self.can_transition_to(*next)).collect()
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Dumped)
    }
}

/// Result reported by the external verification step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub passed: bool,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
    pub recorded_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: TaskState,
    pub to: TaskState,
    pub at: DateTime<Utc>,
    pub by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltInfo {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub state: TaskState,
    /// Agent working the task while it is ACTIVE.
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub partitions: Vec<String>,
    /// Resources locked on entry to ACTIVE.
    #[serde(default)]
    pub locks: Vec<String>,
    #[serde(default)]
    pub verification: Option<Verification>,
    #[serde(default)]
    pub history: Vec<Transition>,
    #[serde(default)]
    pub reopen_count: u32,
    #[serde(default)]
    pub halt: Option<HaltInfo>,
    #[serde(default)]
    pub dump_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    fn ensure_can_enter(&self, to: TaskState) -> Result<()> {
        if self.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                task: self.id.clone(),
                from: self.state.to_string(),
                to: to.to_string(),
            })
        }
    }

    fn verification_status(&self) -> &'static str {
        match &self.verification {
            None => "absent",
            Some(v) if v.passed => "passed",
            Some(_) => "failed",
        }
    }
}

/// Outcome of a transition into ACTIVE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activation {
    pub task: Task,
    /// Partitions locked for the task.
    pub locked: Vec<String>,
    /// Partitions someone else had locked. Advisory only.
    pub lock_conflicts: Vec<HolderInfo>,
    /// Other agents' partitions overlapping this task's.
    pub partition_conflicts: Vec<Conflict>,
}

fn task_doc(id: &str) -> Result<String> {
    let well_formed = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !id.starts_with('_');
    if well_formed {
        Ok(format!("{TASKS_DIR}/{id}.json"))
    } else {
        Err(Error::InvalidInput(format!("malformed task id '{id}'")))
    }
}

fn required(value: &str, what: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(Error::InvalidInput(format!("{what} cannot be empty")))
    } else {
        Ok(trimmed.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct TaskBoard {
    store: StateStore,
    locks: LockManager,
    partitions: Partitions,
    registry: ErrorRegistry,
    events: EventLog,
}

impl TaskBoard {
    #[must_use]
    pub const fn new(
        store: StateStore,
        locks: LockManager,
        partitions: Partitions,
        registry: ErrorRegistry,
        events: EventLog,
    ) -> Self {
        Self {
            store,
            locks,
            partitions,
            registry,
            events,
        }
    }

    /// Create a task in INBOX with the next free `TASK-YYYYMMDD-NNN` id.
    pub fn create(&self, title: &str, partitions: &[String]) -> Result<Task> {
        let title = required(title, "task title")?;
        let partitions = normalize_prefixes(partitions)?;

        let guard = self.store.guard(SEQUENCE_GUARD)?;
        let now = Utc::now();
        let id = ids::next_id("TASK", now, self.store.list(TASKS_DIR)?);
        let task = Task {
            id,
            title,
            state: TaskState::Inbox,
            owner: None,
            partitions,
            locks: Vec::new(),
            verification: None,
            history: Vec::new(),
            reopen_count: 0,
            halt: None,
            dump_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.store.write(&task_doc(&task.id)?, &task)?;
        guard.release()?;

        tracing::info!(task = %task.id, "task created");
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Result<Task> {
        let name = task_doc(id)?;
        self.store
            .read::<Option<Task>>(&name)?
            .ok_or_else(|| Error::not_found("task", id))
    }

    /// All tasks, optionally only those in `state`, ordered by id.
    pub fn list(&self, state: Option<TaskState>) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for id in self.store.list(TASKS_DIR)? {
            match self.get(&id) {
                Ok(task) if state.map_or(true, |s| task.state == s) => tasks.push(task),
                Ok(_) => {}
                Err(Error::NotFound { .. } | Error::InvalidInput(_)) => {
                    tracing::debug!(task = %id, "skipping unreadable task document");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(tasks)
    }

    /// Store the verification result for an ACTIVE task.
    pub fn record_verification(&self, id: &str, passed: bool, detail: &str, by: &str) -> Result<Task> {
        self.mutate(id, |task| {
            if task.state != TaskState::Active {
                return Err(Error::InvalidInput(format!(
                    "task {} is {}; verification applies to ACTIVE tasks",
                    task.id, task.state
                )));
            }
            task.verification = Some(Verification {
                passed,
                detail: detail.to_string(),
                recorded_at: Utc::now(),
                recorded_by: by.to_string(),
            });
            tracing::info!(task = %task.id, passed, "verification recorded");
            Ok(task.clone())
        })
    }

    /// INBOX to ACTIVE. `partitions` replaces the declared partitions when
    /// non-empty.
    pub fn start(
        &self,
        id: &str,
        agent: &Holder,
        partitions: &[String],
        lock_partitions: bool,
    ) -> Result<Activation> {
        let partitions = normalize_prefixes(partitions)?;
        self.mutate(id, |task| {
            if task.state != TaskState::Inbox {
                return Err(Error::InvalidTransition {
                    task: task.id.clone(),
                    from: task.state.to_string(),
                    to: TaskState::Active.to_string(),
                });
            }
            if !partitions.is_empty() {
                task.partitions.clone_from(&partitions);
            }
            self.enter_active(task, agent, lock_partitions, None)
        })
    }

    /// HALTED to ACTIVE.
    pub fn resume(&self, id: &str, agent: &Holder, lock_partitions: bool) -> Result<Activation> {
        self.mutate(id, |task| {
            if task.state != TaskState::Halted {
                return Err(Error::InvalidTransition {
                    task: task.id.clone(),
                    from: task.state.to_string(),
                    to: TaskState::Active.to_string(),
                });
            }
            task.halt = None;
            self.enter_active(task, agent, lock_partitions, None)
        })
    }

    /// COMPLETED to ACTIVE. The earlier verification no longer counts.
    pub fn reopen(
        &self,
        id: &str,
        agent: &Holder,
        reason: &str,
        lock_partitions: bool,
    ) -> Result<Activation> {
        let reason = required(reason, "reopen reason")?;
        self.mutate(id, |task| {
            if task.state != TaskState::Completed {
                return Err(Error::InvalidTransition {
                    task: task.id.clone(),
                    from: task.state.to_string(),
                    to: TaskState::Active.to_string(),
                });
            }
            task.reopen_count = task.reopen_count.saturating_add(1);
            task.verification = None;
            self.enter_active(task, agent, lock_partitions, Some(reason))
        })
    }

    /// ACTIVE to COMPLETED; needs a passing verification.
    pub fn close(&self, id: &str, by: &str) -> Result<Task> {
        let task = self.mutate(id, |task| {
            task.ensure_can_enter(TaskState::Completed)?;
            if !task.verification.as_ref().is_some_and(|v| v.passed) {
                return Err(Error::VerificationRequired {
                    task: task.id.clone(),
                    status: task.verification_status().to_string(),
                });
            }
            self.leave_active(task, TaskState::Completed, by, None)?;
            Ok(task.clone())
        })?;

        if let Err(e) = self.registry.regenerate_summary() {
            tracing::warn!(task = %task.id, error = %e, "failed to regenerate findings after close");
        }
        Ok(task)
    }

    /// ACTIVE to HALTED.
    pub fn halt(&self, id: &str, by: &str, reason: &str, resume_condition: Option<&str>) -> Result<Task> {
        let reason = required(reason, "halt reason")?;
        self.mutate(id, |task| {
            task.ensure_can_enter(TaskState::Halted)?;
            task.halt = Some(HaltInfo {
                reason: reason.clone(),
                resume_condition: resume_condition
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(String::from),
            });
            self.leave_active(task, TaskState::Halted, by, Some(reason))?;
            Ok(task.clone())
        })
    }

    /// ACTIVE to DUMPED, which is final.
    pub fn dump(&self, id: &str, by: &str, reason: &str) -> Result<Task> {
        let reason = required(reason, "dump reason")?;
        self.mutate(id, |task| {
            task.ensure_can_enter(TaskState::Dumped)?;
            task.dump_reason = Some(reason.clone());
            self.leave_active(task, TaskState::Dumped, by, Some(reason))?;
            Ok(task.clone())
        })
    }

    /// Apply `f` to a stored task under its guard; nothing is written if `f`
    /// fails.
    fn mutate<R>(&self, id: &str, f: impl FnOnce(&mut Task) -> Result<R>) -> Result<R> {
        let name = task_doc(id)?;
        let guard = self.store.guard(&name)?;
        let mut task = self
            .store
            .read::<Option<Task>>(&name)?
            .ok_or_else(|| Error::not_found("task", id))?;
        let outcome = f(&mut task)?;
        self.store.write(&name, &task)?;
        guard.release()?;
        Ok(outcome)
    }

    fn enter_active(
        &self,
        task: &mut Task,
        agent: &Holder,
        lock_partitions: bool,
        reason: Option<String>,
    ) -> Result<Activation> {
        task.ensure_can_enter(TaskState::Active)?;

        let partition_conflicts = if task.partitions.is_empty() {
            Vec::new()
        } else {
            let conflicts = self
                .partitions
                .check_targets(&agent.agent_id, &task.partitions)?;
            self.partitions
                .declare(&agent.agent_id, &task.id, &task.partitions)?;
            conflicts
        };

        let mut locked = Vec::new();
        let mut lock_conflicts = Vec::new();
        if lock_partitions {
            for prefix in &task.partitions {
                match self.locks.try_acquire(prefix, agent, None, LockKind::Exclusive)? {
                    Acquisition::Acquired(grant) => locked.push(grant.record.resource),
                    Acquisition::Held(info) => {
                        tracing::warn!(
                            task = %task.id,
                            resource = %prefix,
                            holder = %info.record.agent_id,
                            "partition lock held by another agent"
                        );
                        lock_conflicts.push(info);
                    }
                }
            }
        }

        task.locks.clone_from(&locked);
        task.owner = Some(agent.agent_id.clone());
        self.transition(task, TaskState::Active, &agent.agent_id, reason);

        Ok(Activation {
            task: task.clone(),
            locked,
            lock_conflicts,
            partition_conflicts,
        })
    }

    fn leave_active(&self, task: &mut Task, to: TaskState, by: &str, reason: Option<String>) -> Result<()> {
        if let Some(owner) = task.owner.clone() {
            let holder = Holder::new(owner.as_str());
            for resource in &task.locks {
                if let Err(e) = self.locks.release(resource, &holder) {
                    tracing::warn!(task = %task.id, resource = %resource, error = %e, "could not release task lock");
                }
            }
            let released = self.locks.release_all(&owner)?;
            self.partitions.clear(&owner, Some(&task.id))?;
            tracing::debug!(task = %task.id, owner = %owner, released, "task resources released");
        }
        task.locks.clear();
        task.owner = None;
        self.transition(task, to, by, reason);
        Ok(())
    }

    fn transition(&self, task: &mut Task, to: TaskState, by: &str, reason: Option<String>) {
        let from = task.state;
        let now = Utc::now();
        task.state = to;
        task.updated_at = now;
        task.history.push(Transition {
            from,
            to,
            at: now,
            by: by.to_string(),
            reason: reason.clone(),
        });
        tracing::info!(task = %task.id, %from, %to, by, "task transition");
        self.events.record(
            EventType::TaskTransition,
            json!({
                "task": task.id,
                "from": from,
                "to": to,
                "by": by,
                "reason": reason,
            }),
        );
    }
}
