pub mod approvals;
pub mod audit;
pub mod config;
pub mod currency;
pub mod domain;
pub mod errors;
pub mod ledger;
pub mod store;
pub mod workflow;

pub use approvals::{
    match_rule, plan_initial_route, ApprovalStateMachine, DecisionAction, PlannedRoute,
    RouteSource, TransitionPlan,
};
pub use currency::{
    apply_rate, convert_or_fallback, ConversionError, CurrencyConverter, StaticRateConverter,
};
pub use domain::expense::{
    ApprovalHistoryEntry, Expense, ExpenseCategory, ExpenseId, ExpensePatch, ExpenseStatus,
    HistoryAction, NewExpense, RoutingState,
};
pub use domain::rule::{
    ApprovalCondition, ApprovalLevel, ApprovalRule, ApproverRef, ConditionField,
    ConditionOperator, RuleDraft, RuleId,
};
pub use domain::user::{Company, CompanyId, CompanySettings, User, UserDraft, UserId, UserRole};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use ledger::{CategoryTotal, LedgerSummary};
pub use store::RepositoryError;
pub use workflow::{ExpenseWorkflow, RequestContext};
