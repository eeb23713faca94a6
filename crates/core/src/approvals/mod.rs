//! Approval routing: rule matching, initial route planning and decision transitions.

pub mod decision;
pub mod matcher;
pub mod planner;

pub use decision::{ApprovalStateMachine, DecisionAction, TransitionPlan};
pub use matcher::{condition_holds, match_rule};
pub use planner::{plan_initial_route, PlannedRoute, RouteSource};
