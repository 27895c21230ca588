//! Approval gate evaluation.
//!
//! Decides at submit time whether human review is required, and how many
//! approvals close the review. Reviewer identity and escalation timers are
//! external concerns; `escalate_after_ms` is recorded on the gate but no
//! timer runs here.

use crate::model::IntakeDefinition;

/// Stateless evaluator over an intake's declared gates.
#[derive(Debug, Default, Clone)]
pub struct GateEvaluator;

impl GateEvaluator {
    /// Whether a passing submission must enter `needs_review`.
    pub fn review_required(intake: &IntakeDefinition) -> bool {
        intake.gates.iter().any(|g| g.required_approvals > 0)
    }

    /// Total approvals needed across all declared gates.
    pub fn required_approvals(intake: &IntakeDefinition) -> u32 {
        intake.gates.iter().map(|g| g.required_approvals).sum()
    }

    /// Whether `approvals_recorded` approvals close the review.
    pub fn review_complete(intake: &IntakeDefinition, approvals_recorded: u32) -> bool {
        approvals_recorded >= Self::required_approvals(intake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ApprovalGate;

    fn gate(name: &str, required: u32) -> ApprovalGate {
        ApprovalGate {
            name: name.to_string(),
            required_approvals: required,
            escalate_after_ms: None,
        }
    }

    #[test]
    fn test_no_gates_no_review() {
        let intake = IntakeDefinition::new("direct");
        assert!(!GateEvaluator::review_required(&intake));
        assert_eq!(GateEvaluator::required_approvals(&intake), 0);
    }

    #[test]
    fn test_single_gate_default_policy() {
        let intake = IntakeDefinition::new("reviewed").with_gate(gate("compliance", 1));
        assert!(GateEvaluator::review_required(&intake));
        assert!(!GateEvaluator::review_complete(&intake, 0));
        assert!(GateEvaluator::review_complete(&intake, 1));
    }

    #[test]
    fn test_multiple_gates_sum_approvals() {
        let intake = IntakeDefinition::new("strict")
            .with_gate(gate("finance", 1))
            .with_gate(gate("legal", 2));
        assert_eq!(GateEvaluator::required_approvals(&intake), 3);
        assert!(!GateEvaluator::review_complete(&intake, 2));
        assert!(GateEvaluator::review_complete(&intake, 3));
    }
}
