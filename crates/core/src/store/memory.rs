use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::domain::expense::{Expense, ExpenseId, ExpensePatch};
use crate::domain::rule::{ApprovalRule, RuleId};
use crate::domain::user::{Company, CompanyId, User, UserId};
use crate::ledger;

use super::{
    ApprovalRuleRepository, CompanyRepository, ExpenseRepository, RepositoryError,
    UserRepository,
};

fn sort_expenses(mut expenses: Vec<Expense>) -> Vec<Expense> {
    expenses.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
    expenses
}

fn sort_users(mut users: Vec<User>) -> Vec<User> {
    users.sort_by(|a, b| a.id.cmp(&b.id));
    users
}

#[derive(Default)]
pub struct InMemoryUserRepository {
    users: RwLock<HashMap<String, User>>,
}

#[async_trait::async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError> {
        let users = self.users.read().await;
        Ok(users.get(&id.0).cloned())
    }

    async fn list_by_company(&self, company_id: &CompanyId) -> Result<Vec<User>, RepositoryError> {
        let users = self.users.read().await;
        Ok(sort_users(users.values().filter(|user| &user.company_id == company_id).cloned().collect()))
    }

    async fn list_by_manager(&self, manager_id: &UserId) -> Result<Vec<User>, RepositoryError> {
        let users = self.users.read().await;
        Ok(sort_users(
            users
                .values()
                .filter(|user| user.manager_id.as_ref() == Some(manager_id))
                .cloned()
                .collect(),
        ))
    }

    async fn save(&self, user: User) -> Result<(), RepositoryError> {
        let mut users = self.users.write().await;
        users.insert(user.id.0.clone(), user);
        Ok(())
    }

    async fn delete(&self, id: &UserId) -> Result<bool, RepositoryError> {
        let mut users = self.users.write().await;
        Ok(users.remove(&id.0).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryCompanyRepository {
    companies: RwLock<HashMap<String, Company>>,
}

#[async_trait::async_trait]
impl CompanyRepository for InMemoryCompanyRepository {
    async fn find_by_id(&self, id: &CompanyId) -> Result<Option<Company>, RepositoryError> {
        let companies = self.companies.read().await;
        Ok(companies.get(&id.0).cloned())
    }

    async fn save(&self, company: Company) -> Result<(), RepositoryError> {
        let mut companies = self.companies.write().await;
        companies.insert(company.id.0.clone(), company);
        Ok(())
    }
}

/// Rules live in a `Vec` so evaluation order is insertion order.
#[derive(Default)]
pub struct InMemoryApprovalRuleRepository {
    rules: RwLock<Vec<ApprovalRule>>,
}

#[async_trait::async_trait]
impl ApprovalRuleRepository for InMemoryApprovalRuleRepository {
    async fn list_by_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError> {
        let rules = self.rules.read().await;
        Ok(rules.iter().filter(|rule| &rule.company_id == company_id).cloned().collect())
    }

    async fn find_by_id(&self, id: &RuleId) -> Result<Option<ApprovalRule>, RepositoryError> {
        let rules = self.rules.read().await;
        Ok(rules.iter().find(|rule| &rule.id == id).cloned())
    }

    async fn insert(&self, rule: ApprovalRule) -> Result<(), RepositoryError> {
        let mut rules = self.rules.write().await;
        if rules.iter().any(|existing| existing.id == rule.id) {
            return Err(RepositoryError::Duplicate { entity: "approval rule", id: rule.id.0 });
        }
        rules.push(rule);
        Ok(())
    }

    async fn update(&self, rule: ApprovalRule) -> Result<(), RepositoryError> {
        let mut rules = self.rules.write().await;
        match rules.iter_mut().find(|existing| existing.id == rule.id) {
            Some(existing) => {
                *existing = rule;
                Ok(())
            }
            None => Err(RepositoryError::NotFound { entity: "approval rule", id: rule.id.0 }),
        }
    }

    async fn delete(&self, id: &RuleId) -> Result<bool, RepositoryError> {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|rule| &rule.id != id);
        Ok(rules.len() != before)
    }
}

#[derive(Default)]
pub struct InMemoryExpenseRepository {
    expenses: RwLock<HashMap<String, Expense>>,
}

#[async_trait::async_trait]
impl ExpenseRepository for InMemoryExpenseRepository {
    async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<Expense>, RepositoryError> {
        let expenses = self.expenses.read().await;
        Ok(expenses.get(&id.0).cloned())
    }

    async fn insert(&self, expense: Expense) -> Result<(), RepositoryError> {
        ledger::verify(&expense).map_err(RepositoryError::Invariant)?;

        let mut expenses = self.expenses.write().await;
        if expenses.contains_key(&expense.id.0) {
            return Err(RepositoryError::Duplicate { entity: "expense", id: expense.id.0 });
        }
        expenses.insert(expense.id.0.clone(), expense);
        Ok(())
    }

    async fn replace(&self, expense: Expense) -> Result<Expense, RepositoryError> {
        let mut expenses = self.expenses.write().await;
        let stored = expenses.get(&expense.id.0).ok_or_else(|| RepositoryError::NotFound {
            entity: "expense",
            id: expense.id.0.clone(),
        })?;

        ledger::check_replacement(stored, &expense)?;

        let mut next = expense;
        next.version += 1;
        expenses.insert(next.id.0.clone(), next.clone());
        Ok(next)
    }

    async fn patch(
        &self,
        id: &ExpenseId,
        patch: &ExpensePatch,
    ) -> Result<Expense, RepositoryError> {
        let mut expenses = self.expenses.write().await;
        let stored = expenses
            .get_mut(&id.0)
            .ok_or_else(|| RepositoryError::NotFound { entity: "expense", id: id.0.clone() })?;

        let mut next = stored.clone();
        patch.apply_to(&mut next).map_err(RepositoryError::Invariant)?;
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn delete(&self, id: &ExpenseId) -> Result<bool, RepositoryError> {
        let mut expenses = self.expenses.write().await;
        Ok(expenses.remove(&id.0).is_some())
    }

    async fn list_by_employee(&self, employee_id: &UserId) -> Result<Vec<Expense>, RepositoryError> {
        let expenses = self.expenses.read().await;
        Ok(sort_expenses(
            expenses.values().filter(|expense| &expense.employee_id == employee_id).cloned().collect(),
        ))
    }

    async fn list_by_employees(
        &self,
        employee_ids: &[UserId],
    ) -> Result<Vec<Expense>, RepositoryError> {
        let expenses = self.expenses.read().await;
        Ok(sort_expenses(
            expenses
                .values()
                .filter(|expense| employee_ids.contains(&expense.employee_id))
                .cloned()
                .collect(),
        ))
    }

    async fn list_pending_for_approver(
        &self,
        approver_id: &UserId,
    ) -> Result<Vec<Expense>, RepositoryError> {
        let expenses = self.expenses.read().await;
        Ok(sort_expenses(
            expenses.values().filter(|expense| expense.is_pending_for(approver_id)).cloned().collect(),
        ))
    }
}
