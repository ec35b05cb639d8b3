//! Domain model: runs, events, approvals, audit entries, specialists

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Capabilities a specialist agent can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ReadMemory,
    WriteMemory,
    RunTool,
    Delegate,
    ExternalAction,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ReadMemory => "read_memory",
            Capability::WriteMemory => "write_memory",
            Capability::RunTool => "run_tool",
            Capability::Delegate => "delegate",
            Capability::ExternalAction => "external_action",
        }
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read_memory" => Ok(Capability::ReadMemory),
            "write_memory" => Ok(Capability::WriteMemory),
            "run_tool" => Ok(Capability::RunTool),
            "delegate" => Ok(Capability::Delegate),
            "external_action" => Ok(Capability::ExternalAction),
            _ => Err(format!("Invalid capability: {}", s)),
        }
    }
}

/// Workspace role of an actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Member => "member",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Role::Owner),
            "member" => Ok(Role::Member),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// The caller identity every operation runs under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorContext {
    pub user_id: String,
    pub role: Role,
}

impl ActorContext {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}

/// Lifecycle status of an agent run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::AwaitingApproval => "awaiting_approval",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Pure state-machine step shared by the append path and replay.
    ///
    /// Task events are accepted while a sibling branch holds the run in
    /// `awaiting_approval`; independent branches keep progressing and the
    /// status is unchanged by them.
    pub fn transition(self, event: &EventPayload) -> Result<RunStatus, String> {
        use RunStatus::*;

        let next = match (self, event) {
            (Pending, EventPayload::RunStarted { .. }) => Running,
            (Running | AwaitingApproval, EventPayload::TaskDelegated { .. }) => self,
            (Running | AwaitingApproval, EventPayload::TaskCompleted { .. }) => self,
            (Running | AwaitingApproval, EventPayload::ApprovalRequested { .. }) => {
                AwaitingApproval
            }
            (
                Running | AwaitingApproval,
                EventPayload::ApprovalDecided {
                    decision, fatal, ..
                },
            ) => {
                if *decision == ApprovalDecision::Denied && *fatal {
                    Failed
                } else {
                    Running
                }
            }
            (Running, EventPayload::RunCompleted { .. }) => Completed,
            (Pending | Running | AwaitingApproval, EventPayload::RunFailed { .. }) => Failed,
            _ => {
                return Err(format!(
                    "event {} is not valid in status {}",
                    event.event_type().as_str(),
                    self.as_str()
                ))
            }
        };
        Ok(next)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "awaiting_approval" => Ok(RunStatus::AwaitingApproval),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// The closed set of run event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "task.delegated")]
    TaskDelegated,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "approval.requested")]
    ApprovalRequested,
    #[serde(rename = "approval.decided")]
    ApprovalDecided,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RunStarted => "run.started",
            EventType::TaskDelegated => "task.delegated",
            EventType::TaskCompleted => "task.completed",
            EventType::ApprovalRequested => "approval.requested",
            EventType::ApprovalDecided => "approval.decided",
            EventType::RunCompleted => "run.completed",
            EventType::RunFailed => "run.failed",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run.started" => Ok(EventType::RunStarted),
            "task.delegated" => Ok(EventType::TaskDelegated),
            "task.completed" => Ok(EventType::TaskCompleted),
            "approval.requested" => Ok(EventType::ApprovalRequested),
            "approval.decided" => Ok(EventType::ApprovalDecided),
            "run.completed" => Ok(EventType::RunCompleted),
            "run.failed" => Ok(EventType::RunFailed),
            _ => Err(format!("Invalid event type: {}", s)),
        }
    }
}

/// Per-subtask outcome recorded in `task.completed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failure,
}

/// Typed event payload, one variant per event type.
///
/// The tag mirrors the stored `event_type` column so the serialized payload
/// is self-describing and replay folding is exhaustive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    #[serde(rename = "run.started")]
    RunStarted { goal: String, actor_id: String },
    #[serde(rename = "task.delegated")]
    TaskDelegated {
        subtask: i64,
        specialist_id: String,
        task: String,
    },
    #[serde(rename = "task.completed")]
    TaskCompleted {
        subtask: i64,
        specialist_id: String,
        outcome: TaskOutcome,
        output: String,
    },
    #[serde(rename = "approval.requested")]
    ApprovalRequested {
        request_id: Uuid,
        subtask: i64,
        capability: Capability,
    },
    #[serde(rename = "approval.decided")]
    ApprovalDecided {
        request_id: Uuid,
        decision: ApprovalDecision,
        decided_by: String,
        fatal: bool,
    },
    #[serde(rename = "run.completed")]
    RunCompleted { summary: String },
    #[serde(rename = "run.failed")]
    RunFailed { reason: String },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::RunStarted { .. } => EventType::RunStarted,
            EventPayload::TaskDelegated { .. } => EventType::TaskDelegated,
            EventPayload::TaskCompleted { .. } => EventType::TaskCompleted,
            EventPayload::ApprovalRequested { .. } => EventType::ApprovalRequested,
            EventPayload::ApprovalDecided { .. } => EventType::ApprovalDecided,
            EventPayload::RunCompleted { .. } => EventType::RunCompleted,
            EventPayload::RunFailed { .. } => EventType::RunFailed,
        }
    }
}

/// One execution of a submitted goal
#[derive(Debug, Clone, Serialize)]
pub struct AgentRun {
    pub id: Uuid,
    pub workspace_id: String,
    pub actor_id: String,
    pub goal: String,
    pub status: RunStatus,
    pub fail_fast: bool,
    pub next_seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One immutable fact about a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRunEvent {
    pub run_id: Uuid,
    pub seq: i64,
    pub event_type: EventType,
    pub payload: EventPayload,
    pub created_at: DateTime<Utc>,
}

/// Resolution status of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
        }
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "denied" => Ok(ApprovalStatus::Denied),
            _ => Err(format!("Invalid approval status: {}", s)),
        }
    }
}

/// A decision an owner can take on a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Denied,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Denied => "denied",
        }
    }

    pub fn as_status(&self) -> ApprovalStatus {
        match self {
            ApprovalDecision::Approved => ApprovalStatus::Approved,
            ApprovalDecision::Denied => ApprovalStatus::Denied,
        }
    }
}

/// A pending gate on a capability-constrained action
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub workspace_id: String,
    pub actor_id: String,
    pub capability: Capability,
    pub action: String,
    pub reason: String,
    pub status: ApprovalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtask: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
}

/// Immutable hash-chained ledger entry.
///
/// `created_at` is kept as the exact RFC 3339 string that went into the hash
/// so verification is byte-stable across storage round-trips.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub workspace_id: String,
    pub position: i64,
    pub actor_id: String,
    pub action: String,
    pub outcome: String,
    pub metadata: serde_json::Value,
    pub previous_hash: String,
    pub event_hash: String,
    pub created_at: String,
}

/// A delegation target registered in a workspace
#[derive(Debug, Clone, Serialize)]
pub struct SpecialistAgent {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub prompt: String,
    pub soul: String,
    pub capabilities: Vec<Capability>,
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Tenant boundary owning runs, specialists, approvals and the audit chain
#[derive(Debug, Clone, Serialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
}

/// A member row in the workspace directory
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceMember {
    pub workspace_id: String,
    pub user_id: String,
    pub role: Role,
    pub added_at: DateTime<Utc>,
}
