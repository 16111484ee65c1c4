//! Tuning knobs for one run of the loop.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentLoopConfig {
    /// Default for UI-triggered sessions; server-triggered sessions may
    /// pass their own cap.
    pub max_steps: u32,
    pub wait_after_click_ms: u64,
    /// Consecutive no-navigation clicks before injecting an escalation
    /// error for the policy.
    pub no_nav_click_threshold: u32,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_steps: core_types::DEFAULT_MAX_STEPS,
            wait_after_click_ms: 500,
            no_nav_click_threshold: 3,
        }
    }
}
