use async_trait::async_trait;
use thiserror::Error;

use crate::domain::expense::{Expense, ExpenseId, ExpensePatch};
use crate::domain::rule::{ApprovalRule, RuleId};
use crate::domain::user::{Company, CompanyId, User, UserId};
use crate::errors::DomainError;

pub mod memory;

pub use memory::{
    InMemoryApprovalRuleRepository, InMemoryCompanyRepository, InMemoryExpenseRepository,
    InMemoryUserRepository,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("version conflict on `{id}`: expected version {expected}, found {found}")]
    VersionConflict { id: String, expected: u32, found: u32 },
    #[error("{entity} `{id}` was not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} `{id}` already exists")]
    Duplicate { entity: &'static str, id: String },
    #[error(transparent)]
    Invariant(DomainError),
}

impl RepositoryError {
    pub fn backend(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(error))
    }
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError>;
    async fn list_by_company(&self, company_id: &CompanyId) -> Result<Vec<User>, RepositoryError>;
    async fn list_by_manager(&self, manager_id: &UserId) -> Result<Vec<User>, RepositoryError>;
    async fn save(&self, user: User) -> Result<(), RepositoryError>;
    async fn delete(&self, id: &UserId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait CompanyRepository: Send + Sync {
    async fn find_by_id(&self, id: &CompanyId) -> Result<Option<Company>, RepositoryError>;
    async fn save(&self, company: Company) -> Result<(), RepositoryError>;
}

/// Rule order is significant: `list_by_company` returns rules in insertion order and
/// `update` keeps a rule's position.
#[async_trait]
pub trait ApprovalRuleRepository: Send + Sync {
    async fn list_by_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError>;
    async fn find_by_id(&self, id: &RuleId) -> Result<Option<ApprovalRule>, RepositoryError>;
    async fn insert(&self, rule: ApprovalRule) -> Result<(), RepositoryError>;
    async fn update(&self, rule: ApprovalRule) -> Result<(), RepositoryError>;
    async fn delete(&self, id: &RuleId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait ExpenseRepository: Send + Sync {
    async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<Expense>, RepositoryError>;

    async fn insert(&self, expense: Expense) -> Result<(), RepositoryError>;

    /// Full-record replace. Succeeds only when `expense.version` equals the stored version and
    /// the ledger invariants hold; returns the stored record with its version bumped.
    async fn replace(&self, expense: Expense) -> Result<Expense, RepositoryError>;

    /// Edits descriptive fields only; status, approver and history are untouched.
    async fn patch(&self, id: &ExpenseId, patch: &ExpensePatch)
        -> Result<Expense, RepositoryError>;

    async fn delete(&self, id: &ExpenseId) -> Result<bool, RepositoryError>;

    async fn list_by_employee(&self, employee_id: &UserId) -> Result<Vec<Expense>, RepositoryError>;

    async fn list_by_employees(
        &self,
        employee_ids: &[UserId],
    ) -> Result<Vec<Expense>, RepositoryError>;

    async fn list_pending_for_approver(
        &self,
        approver_id: &UserId,
    ) -> Result<Vec<Expense>, RepositoryError>;
}
