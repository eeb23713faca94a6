use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::expense::{ApprovalHistoryEntry, Expense, ExpenseStatus, HistoryAction};
use crate::domain::rule::ApprovalRule;
use crate::domain::user::{CompanyId, User, UserId};
use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Approved,
    Rejected,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approved" | "approve" => Some(Self::Approved),
            "rejected" | "reject" => Some(Self::Rejected),
            _ => None,
        }
    }

    fn history_action(self) -> HistoryAction {
        match self {
            Self::Approved => HistoryAction::Approved,
            Self::Rejected => HistoryAction::Rejected,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionPlan {
    /// Approval at a non-final level. `next_approver_id` is `None` when the next level lists
    /// nobody, which leaves the expense unrouted.
    Advance { next_level: u32, next_approver_id: Option<UserId> },
    Finalize { status: ExpenseStatus },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ApprovalStateMachine;

impl ApprovalStateMachine {
    /// Only the current approver may decide, and only while the expense is awaiting a decision.
    pub fn authorize(&self, expense: &Expense, decider: &User) -> Result<(), DomainError> {
        if !expense.is_awaiting_decision() {
            return Err(DomainError::StaleDecision {
                expense_id: expense.id.0.clone(),
                reason: format!("expense is already {}", expense.status.as_str()),
            });
        }

        match &expense.current_approver_id {
            None => Err(DomainError::StaleDecision {
                expense_id: expense.id.0.clone(),
                reason: "expense is awaiting approver assignment".to_string(),
            }),
            Some(current) if current != &decider.id => Err(DomainError::StaleDecision {
                expense_id: expense.id.0.clone(),
                reason: format!("user `{}` is not the current approver", decider.id.0),
            }),
            Some(_) => Ok(()),
        }
    }

    pub fn plan(
        &self,
        rule: Option<&ApprovalRule>,
        decider_id: &UserId,
        action: DecisionAction,
    ) -> TransitionPlan {
        if action == DecisionAction::Rejected {
            return TransitionPlan::Finalize { status: ExpenseStatus::Rejected };
        }

        let approved = TransitionPlan::Finalize { status: ExpenseStatus::Approved };
        let Some(rule) = rule.filter(|rule| rule.is_multi_level()) else {
            return approved;
        };
        let Some(index) = rule.level_index_of(decider_id) else {
            return approved;
        };

        match rule.levels.get(index + 1) {
            Some(next) => TransitionPlan::Advance {
                next_level: next.level,
                next_approver_id: next.first_approver().map(|approver| approver.user_id.clone()),
            },
            None => approved,
        }
    }

    /// Produces the updated record. `next_approver_name` is only read for `Advance`.
    pub fn apply(
        &self,
        expense: &Expense,
        plan: &TransitionPlan,
        decider: &User,
        next_approver_name: &str,
        comment: Option<String>,
        at: DateTime<Utc>,
    ) -> Expense {
        let mut next = expense.clone();

        match plan {
            TransitionPlan::Advance { next_approver_id, .. } => {
                next.approval_history.push(decision_entry(
                    decider,
                    DecisionAction::Approved,
                    comment,
                    at,
                ));
                if let Some(approver_id) = next_approver_id {
                    next.approval_history.push(ApprovalHistoryEntry::pending(
                        approver_id.clone(),
                        next_approver_name,
                        at,
                    ));
                }
                next.status = ExpenseStatus::Pending;
                next.current_approver_id = next_approver_id.clone();
            }
            TransitionPlan::Finalize { status } => {
                let action = match status {
                    ExpenseStatus::Rejected => DecisionAction::Rejected,
                    _ => DecisionAction::Approved,
                };
                next.approval_history.push(decision_entry(decider, action, comment, at));
                next.status = *status;
                next.current_approver_id = None;
            }
        }

        next
    }

    /// Admin status change that bypasses level progression. Allowed from any state.
    pub fn override_status(
        &self,
        expense: &Expense,
        admin: &User,
        expense_company: &CompanyId,
        status: ExpenseStatus,
        comment: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Expense, DomainError> {
        if !admin.administers(expense_company) {
            return Err(DomainError::NotAuthorized {
                actor_id: admin.id.0.clone(),
                action: "override expense status".to_string(),
            });
        }

        let action = match status {
            ExpenseStatus::Approved => HistoryAction::Approved,
            ExpenseStatus::Rejected => HistoryAction::Rejected,
            other => {
                return Err(DomainError::InvalidOverride(format!(
                    "override target must be approved or rejected, got `{}`",
                    other.as_str()
                )))
            }
        };

        let comment = comment
            .filter(|comment| !comment.trim().is_empty())
            .unwrap_or_else(|| format!("Admin override: {}", status.as_str()));

        let mut next = expense.clone();
        next.approval_history.push(ApprovalHistoryEntry {
            approver_id: admin.id.clone(),
            approver_name: admin.name.clone(),
            action,
            comment: Some(comment),
            timestamp: at,
            is_override: true,
        });
        next.status = status;
        next.current_approver_id = None;
        Ok(next)
    }

    /// Admin recovery for an expense that routing left without an approver.
    pub fn assign_approver(
        &self,
        expense: &Expense,
        admin: &User,
        expense_company: &CompanyId,
        approver: &User,
        at: DateTime<Utc>,
    ) -> Result<Expense, DomainError> {
        if !admin.administers(expense_company) {
            return Err(DomainError::NotAuthorized {
                actor_id: admin.id.0.clone(),
                action: "assign an approver".to_string(),
            });
        }

        if !expense.is_unrouted() {
            return Err(DomainError::InvalidOverride(format!(
                "expense `{}` is not awaiting approver assignment",
                expense.id
            )));
        }

        if &approver.company_id != expense_company {
            return Err(DomainError::InvalidOverride(format!(
                "approver `{}` belongs to a different company",
                approver.id.0
            )));
        }

        let mut next = expense.clone();
        next.approval_history.push(ApprovalHistoryEntry::pending(
            approver.id.clone(),
            approver.name.clone(),
            at,
        ));
        next.status = ExpenseStatus::Pending;
        next.current_approver_id = Some(approver.id.clone());
        Ok(next)
    }
}

fn decision_entry(
    decider: &User,
    action: DecisionAction,
    comment: Option<String>,
    at: DateTime<Utc>,
) -> ApprovalHistoryEntry {
    ApprovalHistoryEntry {
        approver_id: decider.id.clone(),
        approver_name: decider.name.clone(),
        action: action.history_action(),
        comment: comment.filter(|comment| !comment.trim().is_empty()),
        timestamp: at,
        is_override: false,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};
    use rust_decimal::Decimal;

    use super::{ApprovalStateMachine, DecisionAction, TransitionPlan};
    use crate::approvals::{match_rule, plan_initial_route};
    use crate::domain::expense::{
        ApprovalHistoryEntry, Expense, ExpenseCategory, ExpenseId, ExpenseStatus, HistoryAction,
    };
    use crate::domain::rule::{
        ApprovalCondition, ApprovalLevel, ApprovalRule, ApproverRef, ConditionField,
        ConditionOperator, RuleId,
    };
    use crate::domain::user::{CompanyId, User, UserId, UserRole};
    use crate::errors::DomainError;
    use crate::ledger;

    fn user(id: &str, role: UserRole) -> User {
        User {
            id: UserId(id.to_string()),
            email: format!("{id}@acme.test"),
            name: format!("User {id}"),
            role,
            company_id: CompanyId("company-1".to_string()),
            manager_id: None,
            created_at: Utc::now(),
        }
    }

    fn approver(id: &str) -> ApproverRef {
        ApproverRef { user_id: UserId(id.to_string()), user_name: format!("User {id}") }
    }

    fn leveled_rule(ids: &[&str]) -> ApprovalRule {
        ApprovalRule {
            id: RuleId("rule-levels".to_string()),
            company_id: CompanyId("company-1".to_string()),
            name: "Leveled".to_string(),
            conditions: vec![ApprovalCondition {
                field: ConditionField::Amount,
                operator: ConditionOperator::GreaterThan,
                value: "1000".to_string(),
            }],
            is_manager_approver: false,
            approvers: Vec::new(),
            levels: ids
                .iter()
                .enumerate()
                .map(|(index, id)| ApprovalLevel {
                    level: index as u32 + 1,
                    approvers: vec![approver(id)],
                })
                .collect(),
            created_at: Utc::now(),
        }
    }

    fn pending_expense(approver: &str) -> Expense {
        Expense {
            id: ExpenseId("expense-1".to_string()),
            employee_id: UserId("user-3".to_string()),
            employee_name: "User user-3".to_string(),
            amount: Decimal::new(1200, 0),
            currency: "USD".to_string(),
            amount_in_company_currency: Decimal::new(1200, 0),
            category: ExpenseCategory::Travel,
            description: "Conference".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 5, 1).expect("valid date"),
            receipt_url: None,
            status: ExpenseStatus::Pending,
            current_approver_id: Some(UserId(approver.to_string())),
            approval_history: vec![ApprovalHistoryEntry::pending(
                UserId(approver.to_string()),
                format!("User {approver}"),
                Utc::now(),
            )],
            created_at: Utc::now(),
            version: 1,
        }
    }

    fn decide(
        machine: &ApprovalStateMachine,
        expense: &Expense,
        rule: Option<&ApprovalRule>,
        decider: &User,
        action: DecisionAction,
    ) -> Expense {
        machine.authorize(expense, decider).expect("decider is current approver");
        let plan = machine.plan(rule, &decider.id, action);
        let next_name = match &plan {
            TransitionPlan::Advance { next_approver_id: Some(id), .. } => format!("User {}", id.0),
            _ => String::new(),
        };
        let next = machine.apply(expense, &plan, decider, &next_name, None, Utc::now());
        ledger::ensure_append_only(expense, &next).expect("history only grows");
        ledger::verify(&next).expect("record stays consistent");
        next
    }

    #[test]
    fn first_level_approval_advances_with_two_entries() {
        let machine = ApprovalStateMachine;
        let rule = leveled_rule(&["a", "b", "c"]);
        let expense = pending_expense("a");

        let next = decide(&machine, &expense, Some(&rule), &user("a", UserRole::Manager), DecisionAction::Approved);

        assert_eq!(next.status, ExpenseStatus::Pending);
        assert_eq!(next.current_approver_id, Some(UserId("b".to_string())));
        assert_eq!(next.approval_history.len(), expense.approval_history.len() + 2);
        assert_eq!(next.approval_history[1].action, HistoryAction::Approved);
        assert_eq!(next.approval_history[2].action, HistoryAction::Pending);
        assert_eq!(next.approval_history[2].approver_id, UserId("b".to_string()));
    }

    #[test]
    fn final_level_approval_finalizes_with_one_entry() {
        let machine = ApprovalStateMachine;
        let rule = leveled_rule(&["a", "b", "c"]);
        let expense = pending_expense("c");

        let next = decide(&machine, &expense, Some(&rule), &user("c", UserRole::Admin), DecisionAction::Approved);

        assert_eq!(next.status, ExpenseStatus::Approved);
        assert_eq!(next.current_approver_id, None);
        assert_eq!(next.approval_history.len(), expense.approval_history.len() + 1);
    }

    #[test]
    fn single_level_or_missing_rule_approves_immediately() {
        let machine = ApprovalStateMachine;
        let decider = user("a", UserRole::Manager);

        for rule in [None, Some(leveled_rule(&["a"]))] {
            let expense = pending_expense("a");
            let next = decide(&machine, &expense, rule.as_ref(), &decider, DecisionAction::Approved);
            assert_eq!(next.status, ExpenseStatus::Approved);
            assert_eq!(next.approval_history.len(), 2);
        }
    }

    #[test]
    fn decider_missing_from_levels_finalizes_as_approved() {
        let machine = ApprovalStateMachine;
        let plan = machine.plan(
            Some(&leveled_rule(&["a", "b"])),
            &UserId("z".to_string()),
            DecisionAction::Approved,
        );
        assert_eq!(plan, TransitionPlan::Finalize { status: ExpenseStatus::Approved });
    }

    #[test]
    fn rejection_is_terminal_at_any_level() {
        let machine = ApprovalStateMachine;
        let rule = leveled_rule(&["a", "b", "c"]);

        for level_approver in ["a", "b", "c"] {
            let expense = pending_expense(level_approver);
            let next = decide(
                &machine,
                &expense,
                Some(&rule),
                &user(level_approver, UserRole::Manager),
                DecisionAction::Rejected,
            );
            assert_eq!(next.status, ExpenseStatus::Rejected);
            assert_eq!(next.current_approver_id, None);
            assert_eq!(next.approval_history.len(), expense.approval_history.len() + 1);
            assert_eq!(
                next.approval_history.last().map(|entry| entry.action),
                Some(HistoryAction::Rejected)
            );
        }
    }

    #[test]
    fn two_level_scenario_runs_to_approval() {
        let machine = ApprovalStateMachine;
        let rules = vec![leveled_rule(&["a", "b"])];
        let employee = user("user-3", UserRole::Employee);

        let rule = match_rule(&rules, Decimal::new(1200, 0), ExpenseCategory::Travel);
        let route = plan_initial_route(rule, &employee, None);
        assert_eq!(route.approver_id, Some(UserId("a".to_string())));

        let expense = pending_expense("a");
        let after_a = decide(&machine, &expense, rule, &user("a", UserRole::Manager), DecisionAction::Approved);
        assert_eq!(after_a.current_approver_id, Some(UserId("b".to_string())));
        assert_eq!(after_a.approval_history.len(), 3);

        let after_b = decide(&machine, &after_a, rule, &user("b", UserRole::Manager), DecisionAction::Approved);
        assert_eq!(after_b.status, ExpenseStatus::Approved);
        assert_eq!(after_b.current_approver_id, None);
        let actions: Vec<_> = after_b
            .approval_history
            .iter()
            .map(|entry| (entry.approver_id.0.as_str(), entry.action))
            .collect();
        assert_eq!(
            actions,
            vec![
                ("a", HistoryAction::Pending),
                ("a", HistoryAction::Approved),
                ("b", HistoryAction::Pending),
                ("b", HistoryAction::Approved),
            ]
        );
    }

    #[test]
    fn empty_next_level_leaves_expense_unrouted() {
        let machine = ApprovalStateMachine;
        let mut rule = leveled_rule(&["a", "b"]);
        rule.levels[1].approvers.clear();
        let expense = pending_expense("a");

        let next = decide(&machine, &expense, Some(&rule), &user("a", UserRole::Manager), DecisionAction::Approved);

        assert!(next.is_unrouted());
        assert_eq!(next.approval_history.len(), 2);
    }

    #[test]
    fn stale_decisions_are_rejected() {
        let machine = ApprovalStateMachine;
        let expense = pending_expense("a");

        let wrong_user = machine.authorize(&expense, &user("b", UserRole::Admin));
        assert!(matches!(wrong_user, Err(DomainError::StaleDecision { .. })));

        let mut finished = expense.clone();
        finished.status = ExpenseStatus::Approved;
        finished.current_approver_id = None;
        let terminal = machine.authorize(&finished, &user("a", UserRole::Manager));
        assert!(matches!(terminal, Err(DomainError::StaleDecision { ref reason, .. }) if reason.contains("approved")));

        let mut unrouted = expense;
        unrouted.current_approver_id = None;
        assert!(machine.authorize(&unrouted, &user("a", UserRole::Manager)).is_err());
    }

    #[test]
    fn override_appends_flagged_entry_and_clears_approver() {
        let machine = ApprovalStateMachine;
        let expense = pending_expense("a");
        let admin = user("admin", UserRole::Admin);
        let company = CompanyId("company-1".to_string());

        let next = machine
            .override_status(&expense, &admin, &company, ExpenseStatus::Rejected, None, Utc::now())
            .expect("admin override");

        assert_eq!(next.status, ExpenseStatus::Rejected);
        assert_eq!(next.current_approver_id, None);
        let entry = next.approval_history.last().expect("override entry");
        assert!(entry.is_override);
        assert_eq!(entry.comment.as_deref(), Some("Admin override: rejected"));
        ledger::verify(&next).expect("consistent");
    }

    #[test]
    fn override_requires_admin_of_the_same_company() {
        let machine = ApprovalStateMachine;
        let expense = pending_expense("a");
        let company = CompanyId("company-1".to_string());

        let manager = machine.override_status(
            &expense,
            &user("a", UserRole::Manager),
            &company,
            ExpenseStatus::Approved,
            None,
            Utc::now(),
        );
        assert!(matches!(manager, Err(DomainError::NotAuthorized { .. })));

        let foreign = machine.override_status(
            &expense,
            &user("admin", UserRole::Admin),
            &CompanyId("company-2".to_string()),
            ExpenseStatus::Approved,
            None,
            Utc::now(),
        );
        assert!(foreign.is_err());

        let to_pending = machine.override_status(
            &expense,
            &user("admin", UserRole::Admin),
            &company,
            ExpenseStatus::Pending,
            None,
            Utc::now(),
        );
        assert!(matches!(to_pending, Err(DomainError::InvalidOverride(_))));
    }

    #[test]
    fn assign_approver_routes_an_unrouted_expense() {
        let machine = ApprovalStateMachine;
        let mut expense = pending_expense("a");
        expense.current_approver_id = None;
        expense.approval_history.clear();
        let company = CompanyId("company-1".to_string());

        let next = machine
            .assign_approver(
                &expense,
                &user("admin", UserRole::Admin),
                &company,
                &user("user-2", UserRole::Manager),
                Utc::now(),
            )
            .expect("assignment");

        assert_eq!(next.current_approver_id, Some(UserId("user-2".to_string())));
        assert_eq!(next.approval_history.len(), 1);
        ledger::verify(&next).expect("consistent");

        let again = machine.assign_approver(
            &next,
            &user("admin", UserRole::Admin),
            &company,
            &user("user-4", UserRole::Manager),
            Utc::now(),
        );
        assert!(again.is_err());
    }

    #[test]
    fn decision_action_parses_verbs_and_past_tense() {
        assert_eq!(DecisionAction::parse("Approve"), Some(DecisionAction::Approved));
        assert_eq!(DecisionAction::parse("rejected"), Some(DecisionAction::Rejected));
        assert_eq!(DecisionAction::parse("escalate"), None);
    }
}
