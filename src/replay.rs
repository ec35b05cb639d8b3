//! Deterministic run-state reconstruction from the event log
//!
//! A run view is a pure left fold of the event sequence; replaying from seq 1
//! and resuming from a checkpoint produce the same view. Used for recovery
//! after a restart and for read-only UI timelines.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::event_log::EventLog;
use crate::models::{
    AgentRunEvent, ApprovalDecision, Capability, EventPayload, RunStatus, TaskOutcome,
};

/// Per-subtask projection folded out of the event sequence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubtaskView {
    pub specialist_id: String,
    pub task: Option<String>,
    pub delegated: bool,
    pub outcome: Option<TaskOutcome>,
    pub output: Option<String>,
    pub request_id: Option<Uuid>,
    pub requested_capability: Option<Capability>,
    pub decision: Option<ApprovalDecision>,
}

impl SubtaskView {
    fn new(specialist_id: impl Into<String>) -> Self {
        Self {
            specialist_id: specialist_id.into(),
            task: None,
            delegated: false,
            outcome: None,
            output: None,
            request_id: None,
            requested_capability: None,
            decision: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Reconstructed run state at some seq
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunView {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub goal: Option<String>,
    pub actor_id: Option<String>,
    pub last_seq: i64,
    pub summary: Option<String>,
    pub failure_reason: Option<String>,
    pub subtasks: BTreeMap<i64, SubtaskView>,
}

impl RunView {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            status: RunStatus::Pending,
            goal: None,
            actor_id: None,
            last_seq: 0,
            summary: None,
            failure_reason: None,
            subtasks: BTreeMap::new(),
        }
    }

    /// Fold one event into the view. Events must arrive in seq order.
    pub fn apply(&mut self, event: &AgentRunEvent) -> Result<()> {
        if event.run_id != self.run_id {
            return Err(AppError::Internal(format!(
                "event for run {} folded into view of run {}",
                event.run_id, self.run_id
            )));
        }
        if event.seq != self.last_seq + 1 {
            return Err(AppError::Internal(format!(
                "non-contiguous event sequence: expected {}, got {}",
                self.last_seq + 1,
                event.seq
            )));
        }

        self.status = self
            .status
            .transition(&event.payload)
            .map_err(AppError::InvalidTransition)?;

        match &event.payload {
            EventPayload::RunStarted { goal, actor_id } => {
                self.goal = Some(goal.clone());
                self.actor_id = Some(actor_id.clone());
            }
            EventPayload::TaskDelegated {
                subtask,
                specialist_id,
                task,
            } => {
                let entry = self
                    .subtasks
                    .entry(*subtask)
                    .or_insert_with(|| SubtaskView::new(specialist_id.clone()));
                entry.specialist_id = specialist_id.clone();
                entry.delegated = true;
                entry.task = Some(task.clone());
            }
            EventPayload::TaskCompleted {
                subtask,
                specialist_id,
                outcome,
                output,
            } => {
                let entry = self
                    .subtasks
                    .entry(*subtask)
                    .or_insert_with(|| SubtaskView::new(specialist_id.clone()));
                entry.specialist_id = specialist_id.clone();
                entry.outcome = Some(*outcome);
                entry.output = Some(output.clone());
            }
            EventPayload::ApprovalRequested {
                request_id,
                subtask,
                capability,
            } => {
                let entry = self
                    .subtasks
                    .entry(*subtask)
                    .or_insert_with(|| SubtaskView::new(""));
                entry.request_id = Some(*request_id);
                entry.requested_capability = Some(*capability);
            }
            EventPayload::ApprovalDecided {
                request_id,
                decision,
                ..
            } => {
                for entry in self.subtasks.values_mut() {
                    if entry.request_id == Some(*request_id) {
                        entry.decision = Some(*decision);
                    }
                }
            }
            EventPayload::RunCompleted { summary } => {
                self.summary = Some(summary.clone());
            }
            EventPayload::RunFailed { reason } => {
                self.failure_reason = Some(reason.clone());
            }
        }

        self.last_seq = event.seq;
        Ok(())
    }

    pub fn subtask(&self, index: i64) -> Option<&SubtaskView> {
        self.subtasks.get(&index)
    }

    /// Request id of an approval still parked on this subtask, if any.
    pub fn pending_request(&self, index: i64) -> Option<Uuid> {
        self.subtasks.get(&index).and_then(|s| {
            if s.decision.is_none() && !s.is_completed() {
                s.request_id
            } else {
                None
            }
        })
    }
}

/// Rebuilds run views from the event log, independent of scheduler liveness
#[derive(Clone)]
pub struct ReplayCoordinator {
    events: EventLog,
}

impl ReplayCoordinator {
    pub fn new(events: EventLog) -> Self {
        Self { events }
    }

    /// Reconstruct the run view from seq 1.
    pub async fn replay(&self, run_id: Uuid) -> Result<RunView> {
        let events = self.events.read(run_id, 1).await?;
        let mut view = RunView::new(run_id);
        for event in &events {
            view.apply(event)?;
        }
        Ok(view)
    }

    /// Continue a checkpointed view over the suffix of the log.
    /// Produces the same view as a full replay.
    pub async fn resume(&self, mut checkpoint: RunView) -> Result<RunView> {
        let events = self
            .events
            .read(checkpoint.run_id, checkpoint.last_seq + 1)
            .await?;
        for event in &events {
            checkpoint.apply(event)?;
        }
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(run_id: Uuid, seq: i64, payload: EventPayload) -> AgentRunEvent {
        AgentRunEvent {
            run_id,
            seq,
            event_type: payload.event_type(),
            payload,
            created_at: Utc::now(),
        }
    }

    fn sample_events(run_id: Uuid) -> Vec<AgentRunEvent> {
        let request_id = Uuid::new_v4();
        vec![
            event(
                run_id,
                1,
                EventPayload::RunStarted {
                    goal: "sample".to_string(),
                    actor_id: "user-1".to_string(),
                },
            ),
            event(
                run_id,
                2,
                EventPayload::TaskDelegated {
                    subtask: 0,
                    specialist_id: "spec-research".to_string(),
                    task: "Subtask 1: contribute to goal 'sample'".to_string(),
                },
            ),
            event(
                run_id,
                3,
                EventPayload::ApprovalRequested {
                    request_id,
                    subtask: 1,
                    capability: Capability::RunTool,
                },
            ),
            event(
                run_id,
                4,
                EventPayload::TaskCompleted {
                    subtask: 0,
                    specialist_id: "spec-research".to_string(),
                    outcome: TaskOutcome::Success,
                    output: "research done".to_string(),
                },
            ),
            event(
                run_id,
                5,
                EventPayload::ApprovalDecided {
                    request_id,
                    decision: ApprovalDecision::Approved,
                    decided_by: "owner-1".to_string(),
                    fatal: false,
                },
            ),
            event(
                run_id,
                6,
                EventPayload::TaskCompleted {
                    subtask: 1,
                    specialist_id: "spec-tools".to_string(),
                    outcome: TaskOutcome::Success,
                    output: "tool done".to_string(),
                },
            ),
            event(
                run_id,
                7,
                EventPayload::RunCompleted {
                    summary: "Completed goal with 2 delegated specialist contribution(s).".to_string(),
                },
            ),
        ]
    }

    #[test]
    fn test_fold_reconstructs_run() {
        let run_id = Uuid::new_v4();
        let mut view = RunView::new(run_id);
        for event in sample_events(run_id) {
            view.apply(&event).unwrap();
        }

        assert_eq!(view.status, RunStatus::Completed);
        assert_eq!(view.goal.as_deref(), Some("sample"));
        assert_eq!(view.last_seq, 7);
        assert_eq!(view.subtasks.len(), 2);
        assert!(view.subtask(0).unwrap().is_completed());
        assert_eq!(
            view.subtask(1).unwrap().decision,
            Some(ApprovalDecision::Approved)
        );
        assert!(view
            .summary
            .as_deref()
            .unwrap()
            .contains("2 delegated specialist contribution(s)"));
    }

    #[test]
    fn test_replay_from_checkpoint_matches_full_replay() {
        let run_id = Uuid::new_v4();
        let events = sample_events(run_id);

        let mut full = RunView::new(run_id);
        for event in &events {
            full.apply(event).unwrap();
        }

        // Checkpoint at every k, then fold the suffix; results must agree.
        for k in 0..events.len() {
            let mut partial = RunView::new(run_id);
            for event in &events[..k] {
                partial.apply(event).unwrap();
            }
            for event in &events[k..] {
                partial.apply(event).unwrap();
            }
            assert_eq!(partial, full);
        }
    }

    #[test]
    fn test_apply_rejects_sequence_gap() {
        let run_id = Uuid::new_v4();
        let mut view = RunView::new(run_id);
        let skipped = event(
            run_id,
            2,
            EventPayload::RunStarted {
                goal: "sample".to_string(),
                actor_id: "user-1".to_string(),
            },
        );
        assert!(view.apply(&skipped).is_err());
    }

    #[test]
    fn test_apply_rejects_foreign_run() {
        let mut view = RunView::new(Uuid::new_v4());
        let foreign = event(
            Uuid::new_v4(),
            1,
            EventPayload::RunStarted {
                goal: "sample".to_string(),
                actor_id: "user-1".to_string(),
            },
        );
        assert!(view.apply(&foreign).is_err());
    }

    #[test]
    fn test_pending_request_cleared_by_decision() {
        let run_id = Uuid::new_v4();
        let request_id = Uuid::new_v4();
        let mut view = RunView::new(run_id);
        view.apply(&event(
            run_id,
            1,
            EventPayload::RunStarted {
                goal: "g".to_string(),
                actor_id: "u".to_string(),
            },
        ))
        .unwrap();
        view.apply(&event(
            run_id,
            2,
            EventPayload::ApprovalRequested {
                request_id,
                subtask: 0,
                capability: Capability::ExternalAction,
            },
        ))
        .unwrap();

        assert_eq!(view.pending_request(0), Some(request_id));
        assert_eq!(view.status, RunStatus::AwaitingApproval);

        view.apply(&event(
            run_id,
            3,
            EventPayload::ApprovalDecided {
                request_id,
                decision: ApprovalDecision::Denied,
                decided_by: "owner-1".to_string(),
                fatal: false,
            },
        ))
        .unwrap();

        assert_eq!(view.pending_request(0), None);
        assert_eq!(view.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_coordinator_replay_equals_resume() {
        use sqlx::sqlite::SqlitePoolOptions;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let log = EventLog::new(pool);
        let coordinator = ReplayCoordinator::new(log.clone());

        let run = log
            .create_run("ws-1", "user-1", "sample", false)
            .await
            .unwrap();
        log.append(
            run.id,
            EventPayload::RunStarted {
                goal: "sample".to_string(),
                actor_id: "user-1".to_string(),
            },
        )
        .await
        .unwrap();
        log.append(
            run.id,
            EventPayload::TaskDelegated {
                subtask: 0,
                specialist_id: "spec-1".to_string(),
                task: "Subtask 1".to_string(),
            },
        )
        .await
        .unwrap();

        let checkpoint = coordinator.replay(run.id).await.unwrap();

        log.append(
            run.id,
            EventPayload::TaskCompleted {
                subtask: 0,
                specialist_id: "spec-1".to_string(),
                outcome: TaskOutcome::Success,
                output: "ok".to_string(),
            },
        )
        .await
        .unwrap();
        log.append(
            run.id,
            EventPayload::RunCompleted {
                summary: "done".to_string(),
            },
        )
        .await
        .unwrap();

        let full = coordinator.replay(run.id).await.unwrap();
        let resumed = coordinator.resume(checkpoint).await.unwrap();
        assert_eq!(full, resumed);
        assert_eq!(full.status, RunStatus::Completed);
    }
}
