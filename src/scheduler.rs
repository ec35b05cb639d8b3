//! Delegation scheduler
//!
//! Decomposes a goal into one subtask per eligible specialist and runs the
//! branches concurrently. Branches whose capability profile is high-impact
//! park behind an approval request without blocking siblings; resubmitting
//! the goal resumes the run idempotently, keyed by subtask index, so decided
//! branches continue and completed ones are never re-executed.

use serde::Serialize;
use uuid::Uuid;

use crate::approvals::{ApprovalGate, RunOrigin};
use crate::audit::AuditChain;
use crate::completion::CompletionClient;
use crate::error::{AppError, Result};
use crate::event_log::EventLog;
use crate::models::{
    ActorContext, AgentRun, ApprovalStatus, EventPayload, RunStatus, SpecialistAgent, TaskOutcome,
};
use crate::policy::PolicyEngine;
use crate::replay::{ReplayCoordinator, RunView};
use crate::specialists::SpecialistRegistry;

const APPROVAL_REASON: &str = "high-impact delegation requires explicit approval";

/// One specialist's contribution to a goal
#[derive(Debug, Clone, Serialize)]
pub struct DelegatedResult {
    pub specialist_id: String,
    pub specialist_name: String,
    pub task: String,
    pub output: String,
    pub outcome: TaskOutcome,
}

/// Result of a goal submission or resumption
#[derive(Debug)]
pub struct GoalOutcome {
    pub run: AgentRun,
    pub summary: String,
    pub delegated_results: Vec<DelegatedResult>,
    pub requires_approval: bool,
}

enum BranchOutcome {
    Completed(DelegatedResult),
    Parked,
    /// The run reached a terminal state while the branch was in flight; its
    /// late work is discarded.
    Aborted,
}

/// Scheduler over the engine components
#[derive(Clone)]
pub struct DelegationScheduler {
    events: EventLog,
    gate: ApprovalGate,
    audit: AuditChain,
    specialists: SpecialistRegistry,
    replay: ReplayCoordinator,
    completion: CompletionClient,
    policy: PolicyEngine,
    max_attempts: u32,
}

impl DelegationScheduler {
    pub fn new(
        events: EventLog,
        gate: ApprovalGate,
        audit: AuditChain,
        specialists: SpecialistRegistry,
        replay: ReplayCoordinator,
        completion: CompletionClient,
    ) -> Self {
        Self {
            events,
            gate,
            audit,
            specialists,
            replay,
            completion,
            policy: PolicyEngine::new(),
            max_attempts: 3,
        }
    }

    /// Submit a goal, or resume the active run for it.
    ///
    /// `approved_request_ids` are client-supplied hints; every id is verified
    /// field by field against the persisted request and the persisted state
    /// wins either way. A declared fail-fast policy is only honored on run
    /// creation; resumption keeps the run's recorded policy.
    pub async fn submit_goal(
        &self,
        workspace_id: &str,
        actor: &ActorContext,
        goal: &str,
        approved_request_ids: &[Uuid],
        fail_fast: bool,
    ) -> Result<GoalOutcome> {
        let all = self.specialists.list(workspace_id).await?;
        let eligible: Vec<SpecialistAgent> = all
            .into_iter()
            .filter(|s| self.policy.can_delegate(actor, &s.capabilities).allowed)
            .collect();

        if eligible.is_empty() {
            self.audit
                .record(
                    workspace_id,
                    &actor.user_id,
                    "goal.execute",
                    "rejected",
                    serde_json::json!({"reason": "no eligible specialists", "goal": goal}),
                )
                .await?;
            return Err(AppError::BadRequest(
                "no specialist agents are eligible for delegation".to_string(),
            ));
        }

        let run = match self.events.find_active(workspace_id, goal).await? {
            Some(run) => {
                // A run that never got past creation (e.g. a crash between
                // create and the first append) is started now.
                if run.status == RunStatus::Pending {
                    self.events
                        .append(
                            run.id,
                            EventPayload::RunStarted {
                                goal: goal.to_string(),
                                actor_id: run.actor_id.clone(),
                            },
                        )
                        .await?;
                    self.events.get_run(run.id).await?
                } else {
                    run
                }
            }
            None => {
                let run = self
                    .events
                    .create_run(workspace_id, &actor.user_id, goal, fail_fast)
                    .await?;
                self.events
                    .append(
                        run.id,
                        EventPayload::RunStarted {
                            goal: goal.to_string(),
                            actor_id: actor.user_id.clone(),
                        },
                    )
                    .await?;
                self.audit
                    .record(
                        workspace_id,
                        &actor.user_id,
                        "goal.execute",
                        "started",
                        serde_json::json!({"agent_run_id": run.id, "goal": goal}),
                    )
                    .await?;
                self.events.get_run(run.id).await?
            }
        };

        let view = self.replay.replay(run.id).await?;

        let branches: Vec<_> = eligible
            .iter()
            .enumerate()
            .map(|(index, specialist)| {
                self.run_branch(&run, index as i64, specialist, approved_request_ids, &view)
            })
            .collect();
        let outcomes = futures::future::join_all(branches).await;

        let mut delegated_results = Vec::new();
        let mut requires_approval = false;
        for outcome in outcomes {
            match outcome? {
                BranchOutcome::Completed(result) => delegated_results.push(result),
                BranchOutcome::Parked => requires_approval = true,
                BranchOutcome::Aborted => {}
            }
        }

        let refreshed = self.events.get_run(run.id).await?;
        if !requires_approval && !refreshed.status.is_terminal() {
            let successes = delegated_results
                .iter()
                .filter(|r| r.outcome == TaskOutcome::Success)
                .count();
            let summary = format!(
                "Completed goal with {} delegated specialist contribution(s).",
                successes
            );
            self.events
                .append(
                    run.id,
                    EventPayload::RunCompleted {
                        summary: summary.clone(),
                    },
                )
                .await?;
            self.audit
                .record(
                    workspace_id,
                    &actor.user_id,
                    "goal.execute",
                    "completed",
                    serde_json::json!({"agent_run_id": run.id, "summary": summary}),
                )
                .await?;
        }

        let run = self.events.get_run(run.id).await?;
        let view = self.replay.replay(run.id).await?;
        let summary = goal_summary(&view, requires_approval);

        Ok(GoalOutcome {
            run,
            summary,
            delegated_results,
            requires_approval,
        })
    }

    async fn run_branch(
        &self,
        run: &AgentRun,
        subtask: i64,
        specialist: &SpecialistAgent,
        approved_request_ids: &[Uuid],
        view: &RunView,
    ) -> Result<BranchOutcome> {
        // Idempotent resume: a completed subtask is reported, not re-executed.
        if let Some(existing) = view.subtask(subtask) {
            if let Some(outcome) = existing.outcome {
                return Ok(BranchOutcome::Completed(DelegatedResult {
                    specialist_id: specialist.id.clone(),
                    specialist_name: specialist.name.clone(),
                    task: existing
                        .task
                        .clone()
                        .unwrap_or_else(|| subtask_description(subtask, &run.goal)),
                    output: existing.output.clone().unwrap_or_default(),
                    outcome,
                }));
            }
        }

        let capability = match self.policy.approval_capability(&specialist.capabilities) {
            None => return self.execute_subtask(run, subtask, specialist).await,
            Some(capability) => capability,
        };
        let action = delegation_action(&specialist.id, &run.goal);

        let mut approved = false;
        for id in approved_request_ids {
            if self
                .gate
                .is_approved(*id, &run.workspace_id, &run.actor_id, capability, &action)
                .await?
            {
                approved = true;
                break;
            }
        }

        if !approved {
            match self
                .gate
                .find_for_action(&run.workspace_id, &run.actor_id, &action)
                .await?
            {
                Some(request) if request.status == ApprovalStatus::Approved => {}
                Some(request) if request.status == ApprovalStatus::Denied => {
                    return self
                        .fail_denied_subtask(run, subtask, specialist, request.id)
                        .await;
                }
                Some(request) => {
                    // Still pending. Make sure this run's branch is parked on
                    // it; a request carried over from an earlier run has no
                    // event in this one yet.
                    let already_parked = view
                        .subtask(subtask)
                        .map(|s| s.request_id == Some(request.id))
                        .unwrap_or(false);
                    if !already_parked {
                        match self
                            .events
                            .append(
                                run.id,
                                EventPayload::ApprovalRequested {
                                    request_id: request.id,
                                    subtask,
                                    capability,
                                },
                            )
                            .await
                        {
                            Ok(_) => {}
                            Err(AppError::RunTerminated(_)) => return Ok(BranchOutcome::Aborted),
                            Err(e) => return Err(e),
                        }
                    }
                    return Ok(BranchOutcome::Parked);
                }
                None => {
                    self.gate
                        .request_approval(
                            &run.workspace_id,
                            &run.actor_id,
                            capability,
                            &action,
                            APPROVAL_REASON,
                            Some(RunOrigin {
                                run_id: run.id,
                                subtask,
                            }),
                        )
                        .await?;
                    return Ok(BranchOutcome::Parked);
                }
            }
        }

        self.execute_subtask(run, subtask, specialist).await
    }

    async fn execute_subtask(
        &self,
        run: &AgentRun,
        subtask: i64,
        specialist: &SpecialistAgent,
    ) -> Result<BranchOutcome> {
        let task = subtask_description(subtask, &run.goal);
        match self
            .events
            .append(
                run.id,
                EventPayload::TaskDelegated {
                    subtask,
                    specialist_id: specialist.id.clone(),
                    task: task.clone(),
                },
            )
            .await
        {
            Ok(_) => {}
            Err(AppError::RunTerminated(_)) => return Ok(BranchOutcome::Aborted),
            Err(e) => return Err(e),
        }

        let system_prompt = format!("{} | soul={}", specialist.prompt, specialist.soul);
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.completion.complete(&system_prompt, &task).await {
                Ok(output) => {
                    return self
                        .complete_subtask(run, subtask, specialist, task, output, TaskOutcome::Success)
                        .await;
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        run_id = %run.id,
                        specialist_id = %specialist.id,
                        attempt,
                        "specialist call failed: {}",
                        last_error
                    );
                }
            }
        }

        self.complete_subtask(run, subtask, specialist, task, last_error, TaskOutcome::Failure)
            .await
    }

    async fn complete_subtask(
        &self,
        run: &AgentRun,
        subtask: i64,
        specialist: &SpecialistAgent,
        task: String,
        output: String,
        outcome: TaskOutcome,
    ) -> Result<BranchOutcome> {
        match self
            .events
            .append(
                run.id,
                EventPayload::TaskCompleted {
                    subtask,
                    specialist_id: specialist.id.clone(),
                    outcome,
                    output: output.clone(),
                },
            )
            .await
        {
            Ok(_) => {}
            Err(AppError::RunTerminated(_)) => return Ok(BranchOutcome::Aborted),
            Err(e) => return Err(e),
        }

        let audit_outcome = match outcome {
            TaskOutcome::Success => "completed",
            TaskOutcome::Failure => "failed",
        };
        self.audit
            .record(
                &run.workspace_id,
                &run.actor_id,
                "task.delegated",
                audit_outcome,
                serde_json::json!({
                    "agent_run_id": run.id,
                    "specialist_id": specialist.id,
                    "task": task,
                }),
            )
            .await?;

        if outcome == TaskOutcome::Failure && run.fail_fast {
            match self
                .events
                .append(
                    run.id,
                    EventPayload::RunFailed {
                        reason: format!("subtask {} failed under fail-fast policy", subtask + 1),
                    },
                )
                .await
            {
                Ok(_) | Err(AppError::RunTerminated(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(BranchOutcome::Completed(DelegatedResult {
            specialist_id: specialist.id.clone(),
            specialist_name: specialist.name.clone(),
            task,
            output,
            outcome,
        }))
    }

    /// A denied request permanently blocks the branch: the subtask completes
    /// with a failure outcome and siblings continue, unless the run declared
    /// fail-fast.
    async fn fail_denied_subtask(
        &self,
        run: &AgentRun,
        subtask: i64,
        specialist: &SpecialistAgent,
        request_id: Uuid,
    ) -> Result<BranchOutcome> {
        let task = subtask_description(subtask, &run.goal);
        let output = AppError::CapabilityDenied(request_id).to_string();
        self.complete_subtask(run, subtask, specialist, task, output, TaskOutcome::Failure)
            .await
    }

    /// Cancel a run that is `running` or `awaiting_approval`. In-flight
    /// specialist calls are abandoned; their late completions surface as
    /// `RunTerminated` and are discarded.
    pub async fn cancel_run(&self, run_id: Uuid, actor: &ActorContext) -> Result<AgentRun> {
        let run = self.events.get_run(run_id).await?;
        if !matches!(run.status, RunStatus::Running | RunStatus::AwaitingApproval) {
            return Err(AppError::BadRequest(format!(
                "run in status {} cannot be cancelled",
                run.status.as_str()
            )));
        }

        self.events
            .append(
                run_id,
                EventPayload::RunFailed {
                    reason: format!("cancelled by {}", actor.user_id),
                },
            )
            .await?;
        self.audit
            .record(
                &run.workspace_id,
                &actor.user_id,
                "run.cancelled",
                "failed",
                serde_json::json!({"agent_run_id": run_id}),
            )
            .await?;

        self.events.get_run(run_id).await
    }
}

fn subtask_description(subtask: i64, goal: &str) -> String {
    format!("Subtask {}: contribute to goal '{}'", subtask + 1, goal)
}

fn delegation_action(specialist_id: &str, goal: &str) -> String {
    format!("delegate:{}:{}", specialist_id, goal)
}

fn goal_summary(view: &RunView, requires_approval: bool) -> String {
    if let Some(summary) = &view.summary {
        return summary.clone();
    }
    if let Some(reason) = &view.failure_reason {
        return format!("Goal failed: {}", reason);
    }
    if requires_approval {
        let parked = view
            .subtasks
            .values()
            .filter(|s| !s.is_completed() && s.request_id.is_some() && s.decision.is_none())
            .count();
        return format!("Awaiting approval for {} subtask(s).", parked.max(1));
    }
    "Goal execution in progress.".to_string()
}
