//! Capability gating and role policy
//!
//! Default-deny decisions for delegation and specialist configuration.

use crate::models::{ActorContext, Capability, Role};

/// Outcome of a policy check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub requires_approval: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    fn allow(requires_approval: bool) -> Self {
        Self {
            allowed: true,
            requires_approval,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            requires_approval: false,
            reason: Some(reason.into()),
        }
    }
}

/// Policy engine for capability gating and owner-only surfaces
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyEngine;

impl PolicyEngine {
    pub fn new() -> Self {
        Self
    }

    /// Whether an invocation of `capability` must pause for explicit approval.
    ///
    /// `run_tool` and `external_action` gate every invocation. `delegate` and
    /// `write_memory` gate only when the invoking actor is a specialist, not
    /// the primary executor. `read_memory` never gates.
    pub fn is_high_impact(&self, capability: Capability, by_specialist: bool) -> bool {
        match capability {
            Capability::RunTool | Capability::ExternalAction => true,
            Capability::Delegate | Capability::WriteMemory => by_specialist,
            Capability::ReadMemory => false,
        }
    }

    /// The capability a delegated subtask must be approved for, if any.
    ///
    /// Delegation itself is exercised by the primary executor and does not
    /// gate; everything else in the specialist's profile is exercised by the
    /// specialist during the subtask. The most impactful gated capability
    /// wins.
    pub fn approval_capability(&self, capabilities: &[Capability]) -> Option<Capability> {
        for candidate in [
            Capability::ExternalAction,
            Capability::RunTool,
            Capability::WriteMemory,
        ] {
            if capabilities.contains(&candidate) && self.is_high_impact(candidate, true) {
                return Some(candidate);
            }
        }
        None
    }

    /// Only workspace owners may create or edit specialist agents.
    pub fn can_edit_specialists(&self, actor: &ActorContext) -> PolicyDecision {
        if actor.role != Role::Owner {
            return PolicyDecision::deny("only owners can create or edit specialist agents");
        }
        PolicyDecision::allow(false)
    }

    /// Whether a goal may be delegated to a specialist with this profile.
    pub fn can_delegate(
        &self,
        _actor: &ActorContext,
        capabilities: &[Capability],
    ) -> PolicyDecision {
        if !capabilities.contains(&Capability::Delegate) {
            return PolicyDecision::deny("specialist missing delegate capability");
        }
        PolicyDecision::allow(self.approval_capability(capabilities).is_some())
    }
}
