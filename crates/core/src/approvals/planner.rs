use serde::{Deserialize, Serialize};

use crate::domain::rule::ApprovalRule;
use crate::domain::user::{User, UserId};

/// Which branch of the routing decision produced the first approver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    /// No rule matched; the employee's direct manager is used.
    DefaultManager,
    Levels,
    RuleManager,
    CustomApprover,
}

impl RouteSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DefaultManager => "default_manager",
            Self::Levels => "levels",
            Self::RuleManager => "rule_manager",
            Self::CustomApprover => "custom_approver",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedRoute {
    pub approver_id: Option<UserId>,
    pub approver_name: String,
    pub source: RouteSource,
}

impl PlannedRoute {
    pub fn is_unrouted(&self) -> bool {
        self.approver_id.is_none()
    }
}

/// Computes the first approver for a new expense.
///
/// `manager` is the already-resolved record for `employee.manager_id`; callers pass `None`
/// when the employee has no manager or the reference is dangling.
pub fn plan_initial_route(
    rule: Option<&ApprovalRule>,
    employee: &User,
    manager: Option<&User>,
) -> PlannedRoute {
    let manager_route = |source| {
        let manager = manager.filter(|manager| Some(&manager.id) == employee.manager_id.as_ref());
        PlannedRoute {
            approver_id: manager.map(|manager| manager.id.clone()),
            approver_name: manager.map(|manager| manager.name.clone()).unwrap_or_default(),
            source,
        }
    };

    let Some(rule) = rule else {
        return manager_route(RouteSource::DefaultManager);
    };

    if let Some(first_level) = rule.levels.first() {
        let approver = first_level.first_approver();
        return PlannedRoute {
            approver_id: approver.map(|approver| approver.user_id.clone()),
            approver_name: approver.map(|approver| approver.user_name.clone()).unwrap_or_default(),
            source: RouteSource::Levels,
        };
    }

    if rule.is_manager_approver {
        return manager_route(RouteSource::RuleManager);
    }

    let approver = rule.approvers.first();
    PlannedRoute {
        approver_id: approver.map(|approver| approver.user_id.clone()),
        approver_name: approver.map(|approver| approver.user_name.clone()).unwrap_or_default(),
        source: RouteSource::CustomApprover,
    }
}
