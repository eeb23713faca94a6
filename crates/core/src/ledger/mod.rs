use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::expense::{Expense, ExpenseCategory, ExpenseStatus, HistoryAction};
use crate::errors::DomainError;
use crate::store::RepositoryError;

/// Checks the status/approver consistency of a single record.
pub fn verify(expense: &Expense) -> Result<(), DomainError> {
    if expense.version == 0 {
        return Err(DomainError::InvariantViolation(format!(
            "expense `{}` has version 0; versions start at 1",
            expense.id
        )));
    }

    if expense.is_terminal() && expense.current_approver_id.is_some() {
        return Err(DomainError::InvariantViolation(format!(
            "expense `{}` is {} but still names a current approver",
            expense.id,
            expense.status.as_str()
        )));
    }

    if expense.is_awaiting_decision() {
        if let Some(last) = expense.approval_history.last() {
            if last.action == HistoryAction::Pending
                && expense.current_approver_id.as_ref() != Some(&last.approver_id)
            {
                return Err(DomainError::InvariantViolation(format!(
                    "expense `{}` opened a turn for `{}` but the current approver differs",
                    expense.id, last.approver_id.0
                )));
            }
        }
    }

    Ok(())
}

/// `after` must extend `before` without rewriting history or identity fields.
pub fn ensure_append_only(before: &Expense, after: &Expense) -> Result<(), DomainError> {
    let prior = &before.approval_history;
    let next = &after.approval_history;

    if next.len() < prior.len() || next[..prior.len()] != prior[..] {
        return Err(DomainError::InvariantViolation(format!(
            "approval history of expense `{}` may only be appended to",
            before.id
        )));
    }

    let identity_unchanged = before.id == after.id
        && before.employee_id == after.employee_id
        && before.amount == after.amount
        && before.currency == after.currency
        && before.amount_in_company_currency == after.amount_in_company_currency
        && before.category == after.category
        && before.created_at == after.created_at;
    if !identity_unchanged {
        return Err(DomainError::InvariantViolation(format!(
            "expense `{}` identity and amount fields are immutable after submission",
            before.id
        )));
    }

    Ok(())
}

/// Shared guard for every repository `replace` implementation.
pub fn check_replacement(stored: &Expense, candidate: &Expense) -> Result<(), RepositoryError> {
    if stored.version != candidate.version {
        return Err(RepositoryError::VersionConflict {
            id: stored.id.0.clone(),
            expected: candidate.version,
            found: stored.version,
        });
    }

    ensure_append_only(stored, candidate).map_err(RepositoryError::Invariant)?;
    verify(candidate).map_err(RepositoryError::Invariant)
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTotal {
    pub count: usize,
    pub total: Decimal,
}

/// Status counts and company-currency totals over a set of expenses. Totals saturate at
/// `Decimal::MAX`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub total: usize,
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub unrouted: usize,
    pub approved_amount: Decimal,
    pub pending_amount: Decimal,
    pub by_category: BTreeMap<ExpenseCategory, CategoryTotal>,
}

impl LedgerSummary {
    pub fn from_expenses<'a>(expenses: impl IntoIterator<Item = &'a Expense>) -> Self {
        let mut summary = Self::default();

        for expense in expenses {
            let amount = expense.amount_in_company_currency;
            summary.total += 1;

            match expense.status {
                ExpenseStatus::Approved => {
                    summary.approved += 1;
                    summary.approved_amount = summary.approved_amount.saturating_add(amount);
                }
                ExpenseStatus::Rejected => summary.rejected += 1,
                ExpenseStatus::Pending | ExpenseStatus::InProgress => {
                    summary.pending += 1;
                    summary.pending_amount = summary.pending_amount.saturating_add(amount);
                }
            }

            if expense.is_unrouted() {
                summary.unrouted += 1;
            }

            let category = summary.by_category.entry(expense.category).or_default();
            category.count += 1;
            category.total = category.total.saturating_add(amount);
        }

        summary
    }
}
