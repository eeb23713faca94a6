use std::str::FromStr;

use rust_decimal::Decimal;

use crate::domain::expense::ExpenseCategory;
use crate::domain::rule::{ApprovalCondition, ApprovalRule, ConditionField, ConditionOperator};

/// Returns the first rule, in stored order, whose conditions all hold.
///
/// Conditions are conjunctive and a rule with no conditions always matches, so a
/// catch-all placed early shadows every rule after it.
pub fn match_rule(
    rules: &[ApprovalRule],
    amount: Decimal,
    category: ExpenseCategory,
) -> Option<&ApprovalRule> {
    rules.iter().find(|rule| {
        rule.conditions.iter().all(|condition| condition_holds(condition, amount, category))
    })
}

pub fn condition_holds(
    condition: &ApprovalCondition,
    amount: Decimal,
    category: ExpenseCategory,
) -> bool {
    match condition.field {
        ConditionField::Amount => {
            let Some(threshold) = parse_threshold(&condition.value) else {
                return false;
            };
            match condition.operator {
                ConditionOperator::GreaterThan => amount > threshold,
                ConditionOperator::LessThan => amount < threshold,
                ConditionOperator::GreaterOrEqual => amount >= threshold,
                ConditionOperator::LessOrEqual => amount <= threshold,
                ConditionOperator::Equal => amount == threshold,
            }
        }
        // Category comparisons are equality regardless of the stored operator.
        ConditionField::Category => condition.value.trim() == category.as_str(),
    }
}

fn parse_threshold(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    Decimal::from_str(raw).ok().or_else(|| Decimal::from_scientific(raw).ok())
}
