// Plan Progress Estimation
// Maps observed tool activity onto plan-step completion states.

use tether_types::{StepStatus, TaskPlan};

/// Heuristic estimator of plan progress from tool-call counts.
///
/// This is approximate by construction: there is no exact step-to-tool
/// correspondence, so the estimate must never be treated as authoritative
/// completion state for the external store. The denominator is floored at
/// `steps * 2` so that steps are not marked complete before most tool
/// activity has been observed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanProgressEstimator {
    /// tool_use records observed (upper bound of work)
    total: u64,
    /// tool_result records observed (completed work)
    completed: u64,
}

impl PlanProgressEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tool_use(&mut self) {
        self.total += 1;
    }

    pub fn record_tool_result(&mut self) {
        self.completed += 1;
    }

    /// Recompute step statuses on the given plan.
    ///
    /// Steps before `floor(ratio * N)` become completed, the step at that
    /// index in_progress, the rest pending, with
    /// `ratio = completed / max(total, N * 2)`.
    pub fn apply(&self, plan: &mut TaskPlan) {
        let n = plan.steps.len();
        if n == 0 {
            return;
        }
        let denominator = self.total.max(n as u64 * 2).max(1);
        let ratio = self.completed as f64 / denominator as f64;
        let cursor = ((ratio * n as f64).floor() as usize).min(n);

        for (index, step) in plan.steps.iter_mut().enumerate() {
            step.status = if index < cursor {
                StepStatus::Completed
            } else if index == cursor {
                StepStatus::InProgress
            } else {
                StepStatus::Pending
            };
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
