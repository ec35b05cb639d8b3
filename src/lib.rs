//! Arbiter server - agent execution run and audit engine

pub mod api;
pub mod approvals;
pub mod audit;
pub mod completion;
pub mod error;
pub mod event_log;
pub mod memberships;
pub mod memory;
pub mod models;
pub mod policy;
pub mod replay;
pub mod scheduler;
pub mod specialists;

use sqlx::SqlitePool;
use std::sync::Arc;

use approvals::ApprovalGate;
use audit::AuditChain;
use completion::CompletionClient;
use event_log::EventLog;
use memberships::WorkspaceDirectory;
use memory::MemoryStore;
use policy::PolicyEngine;
use replay::ReplayCoordinator;
use scheduler::DelegationScheduler;
use specialists::SpecialistRegistry;

/// Application state shared across handlers
pub struct AppState {
    pub events: EventLog,
    pub gate: ApprovalGate,
    pub audit: AuditChain,
    pub specialists: SpecialistRegistry,
    pub directory: WorkspaceDirectory,
    pub memory: MemoryStore,
    pub completion: CompletionClient,
    pub replay: ReplayCoordinator,
    pub scheduler: DelegationScheduler,
    pub policy: PolicyEngine,
}

impl AppState {
    pub fn new(pool: SqlitePool, completion: CompletionClient) -> Arc<Self> {
        let events = EventLog::new(pool.clone());
        let audit = AuditChain::new(pool.clone());
        let gate = ApprovalGate::new(pool.clone(), events.clone(), audit.clone());
        let specialists = SpecialistRegistry::new(pool.clone());
        let directory = WorkspaceDirectory::new(pool.clone());
        let memory = MemoryStore::new(pool);
        let replay = ReplayCoordinator::new(events.clone());
        let scheduler = DelegationScheduler::new(
            events.clone(),
            gate.clone(),
            audit.clone(),
            specialists.clone(),
            replay.clone(),
            completion.clone(),
        );

        Arc::new(Self {
            events,
            gate,
            audit,
            specialists,
            directory,
            memory,
            completion,
            replay,
            scheduler,
            policy: PolicyEngine::new(),
        })
    }
}
