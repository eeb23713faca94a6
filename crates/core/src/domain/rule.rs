use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::user::{CompanyId, UserId};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    Amount,
    Category,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOperator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "=")]
    Equal,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::LessThan => "<",
            Self::GreaterOrEqual => ">=",
            Self::LessOrEqual => "<=",
            Self::Equal => "=",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalCondition {
    pub field: ConditionField,
    pub operator: ConditionOperator,
    /// Kept as entered; amount thresholds are parsed at evaluation time.
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverRef {
    pub user_id: UserId,
    pub user_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalLevel {
    pub level: u32,
    pub approvers: Vec<ApproverRef>,
}

impl ApprovalLevel {
    pub fn first_approver(&self) -> Option<&ApproverRef> {
        self.approvers.first()
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.approvers.iter().any(|approver| &approver.user_id == user_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: RuleId,
    pub company_id: CompanyId,
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<ApprovalCondition>,
    pub is_manager_approver: bool,
    #[serde(default)]
    pub approvers: Vec<ApproverRef>,
    #[serde(default)]
    pub levels: Vec<ApprovalLevel>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRule {
    pub fn is_multi_level(&self) -> bool {
        self.levels.len() > 1
    }

    /// Index of the first level listing `user_id` among its approvers.
    pub fn level_index_of(&self, user_id: &UserId) -> Option<usize> {
        self.levels.iter().position(|level| level.contains(user_id))
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::InvalidRule("rule name must not be empty".to_string()));
        }

        // A decider is placed by the first level listing them, so each approver may appear
        // in only one level.
        let mut seen = HashSet::new();
        for level in &self.levels {
            if level.level == 0 {
                return Err(DomainError::InvalidRule(format!(
                    "rule `{}` has a level numbered 0; levels start at 1",
                    self.name
                )));
            }

            for approver in &level.approvers {
                if !seen.insert(&approver.user_id) {
                    return Err(DomainError::InvalidRule(format!(
                        "rule `{}` lists approver `{}` more than once (again in level {})",
                        self.name, approver.user_id.0, level.level
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Admin-supplied rule definition before an id is assigned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDraft {
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<ApprovalCondition>,
    #[serde(default = "default_manager_approver")]
    pub is_manager_approver: bool,
    #[serde(default)]
    pub approvers: Vec<ApproverRef>,
    #[serde(default)]
    pub levels: Vec<ApprovalLevel>,
}

fn default_manager_approver() -> bool {
    true
}

impl RuleDraft {
    pub fn into_rule(self, id: RuleId, company_id: CompanyId, created_at: DateTime<Utc>) -> ApprovalRule {
        ApprovalRule {
            id,
            company_id,
            name: self.name,
            conditions: self.conditions,
            is_manager_approver: self.is_manager_approver,
            approvers: self.approvers,
            levels: self.levels,
            created_at,
        }
    }
}
