use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approvals::{
    match_rule, plan_initial_route, ApprovalStateMachine, DecisionAction, TransitionPlan,
};
use crate::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use crate::currency::{convert_or_fallback, CurrencyConverter};
use crate::domain::expense::{
    ApprovalHistoryEntry, Expense, ExpenseId, ExpensePatch, ExpenseStatus, NewExpense,
};
use crate::domain::rule::{ApprovalRule, RuleDraft, RuleId};
use crate::domain::user::{
    Company, CompanyId, CompanySettings, User, UserDraft, UserId, UserRole,
};
use crate::errors::{ApplicationError, DomainError};
use crate::ledger::LedgerSummary;
use crate::store::{
    ApprovalRuleRepository, CompanyRepository, ExpenseRepository, UserRepository,
};

/// Caller identity for a single request. The actor is assumed to be authenticated upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestContext {
    pub actor_id: UserId,
    pub correlation_id: String,
}

impl RequestContext {
    pub fn new(actor_id: UserId, correlation_id: impl Into<String>) -> Self {
        Self { actor_id, correlation_id: correlation_id.into() }
    }

    fn audit(&self) -> AuditContext {
        AuditContext::new(None, self.correlation_id.clone(), self.actor_id.0.clone())
    }
}

#[derive(Clone)]
pub struct ExpenseWorkflow {
    users: Arc<dyn UserRepository>,
    companies: Arc<dyn CompanyRepository>,
    rules: Arc<dyn ApprovalRuleRepository>,
    expenses: Arc<dyn ExpenseRepository>,
    converter: Arc<dyn CurrencyConverter>,
    audit: Arc<dyn AuditSink>,
    machine: ApprovalStateMachine,
}

impl ExpenseWorkflow {
    pub fn new(
        users: Arc<dyn UserRepository>,
        companies: Arc<dyn CompanyRepository>,
        rules: Arc<dyn ApprovalRuleRepository>,
        expenses: Arc<dyn ExpenseRepository>,
        converter: Arc<dyn CurrencyConverter>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            users,
            companies,
            rules,
            expenses,
            converter,
            audit,
            machine: ApprovalStateMachine,
        }
    }

    pub async fn submit_expense(
        &self,
        ctx: &RequestContext,
        submission: NewExpense,
    ) -> Result<Expense, ApplicationError> {
        submission.validate()?;

        let employee = self.load_user(&submission.employee_id).await?;
        if ctx.actor_id != employee.id {
            let actor = self.load_user(&ctx.actor_id).await?;
            if !actor.administers(&employee.company_id) {
                return Err(DomainError::NotAuthorized {
                    actor_id: actor.id.0,
                    action: "submit an expense for another employee".to_string(),
                }
                .into());
            }
        }

        let company = self.load_company(&employee.company_id).await?;
        let amount_in_company_currency = convert_or_fallback(
            self.converter.as_ref(),
            submission.amount,
            &submission.currency,
            &company.currency,
        )
        .await;

        let rules = self.rules.list_by_company(&company.id).await?;
        let rule = match_rule(&rules, amount_in_company_currency, submission.category);
        let manager = match &employee.manager_id {
            Some(manager_id) => self.users.find_by_id(manager_id).await?,
            None => None,
        };
        let route = plan_initial_route(rule, &employee, manager.as_ref());

        let now = Utc::now();
        let approval_history = route
            .approver_id
            .clone()
            .map(|approver_id| {
                vec![ApprovalHistoryEntry::pending(approver_id, route.approver_name.clone(), now)]
            })
            .unwrap_or_default();

        let expense = Expense {
            id: ExpenseId(Uuid::new_v4().to_string()),
            employee_id: employee.id.clone(),
            employee_name: employee.name.clone(),
            amount: submission.amount,
            currency: submission.currency.trim().to_ascii_uppercase(),
            amount_in_company_currency,
            category: submission.category,
            description: submission.description,
            date: submission.date,
            receipt_url: submission.receipt_url,
            status: ExpenseStatus::Pending,
            current_approver_id: route.approver_id.clone(),
            approval_history,
            created_at: now,
            version: 1,
        };
        self.expenses.insert(expense.clone()).await?;

        let audit = ctx.audit().for_expense(&expense.id);
        self.audit.emit(
            audit
                .event("expense.submitted", AuditCategory::Submission, AuditOutcome::Success)
                .with_metadata("rule_id", rule.map(|rule| rule.id.0.clone()).unwrap_or_default())
                .with_metadata("route_source", route.source.as_str())
                .with_metadata("amount_in_company_currency", amount_in_company_currency.to_string()),
        );
        info!(
            event_name = "expense.submitted",
            correlation_id = %ctx.correlation_id,
            expense_id = %expense.id,
            employee_id = %employee.id.0,
            rule_id = rule.map(|rule| rule.id.0.as_str()).unwrap_or(""),
            route_source = route.source.as_str(),
            "expense submitted"
        );

        if route.is_unrouted() {
            self.report_unrouted(&audit, &expense, "no approver could be determined at submission");
        }

        Ok(expense)
    }

    pub async fn decide(
        &self,
        ctx: &RequestContext,
        expense_id: &ExpenseId,
        action: DecisionAction,
        comment: Option<String>,
    ) -> Result<Expense, ApplicationError> {
        let expense = self.load_expense(expense_id).await?;
        let decider = self.load_user(&ctx.actor_id).await?;
        let audit = ctx.audit().for_expense(expense_id);

        if let Err(error) = self.machine.authorize(&expense, &decider) {
            self.audit.emit(
                audit
                    .event("expense.decision_rejected", AuditCategory::Decision, AuditOutcome::Rejected)
                    .with_metadata("action", action.as_str())
                    .with_metadata("error", error.to_string()),
            );
            warn!(
                event_name = "expense.decision_rejected",
                correlation_id = %ctx.correlation_id,
                expense_id = %expense_id,
                actor_id = %decider.id.0,
                error = %error,
                "decision refused before any mutation"
            );
            return Err(error.into());
        }

        // Rules are re-matched against the current rule set, not the one seen at submission.
        let company_id = self.company_of(&expense).await?;
        let rules = self.rules.list_by_company(&company_id).await?;
        let rule = match_rule(&rules, expense.amount_in_company_currency, expense.category);
        let plan = self.machine.plan(rule, &decider.id, action);

        let next_approver_name = match &plan {
            TransitionPlan::Advance { next_approver_id: Some(next_id), .. } => self
                .users
                .find_by_id(next_id)
                .await?
                .map(|user| user.name)
                .unwrap_or_default(),
            _ => String::new(),
        };

        let updated =
            self.machine.apply(&expense, &plan, &decider, &next_approver_name, comment, Utc::now());
        let stored = self.expenses.replace(updated).await?;

        self.audit.emit(
            audit
                .event("expense.decision_applied", AuditCategory::Decision, AuditOutcome::Success)
                .with_metadata("action", action.as_str())
                .with_metadata("from", expense.status.as_str())
                .with_metadata("to", stored.status.as_str())
                .with_metadata(
                    "next_approver_id",
                    stored.current_approver_id.as_ref().map(|id| id.0.clone()).unwrap_or_default(),
                ),
        );
        info!(
            event_name = "expense.decision_applied",
            correlation_id = %ctx.correlation_id,
            expense_id = %stored.id,
            action = action.as_str(),
            status = stored.status.as_str(),
            "approval decision applied"
        );

        if stored.is_unrouted() {
            self.report_unrouted(&audit, &stored, "next approval level has no approver");
        }

        Ok(stored)
    }

    pub async fn override_status(
        &self,
        ctx: &RequestContext,
        expense_id: &ExpenseId,
        status: ExpenseStatus,
        comment: Option<String>,
    ) -> Result<Expense, ApplicationError> {
        let expense = self.load_expense(expense_id).await?;
        let admin = self.load_user(&ctx.actor_id).await?;
        let company_id = self.company_of(&expense).await?;
        let audit = ctx.audit().for_expense(expense_id);

        let updated = match self.machine.override_status(
            &expense,
            &admin,
            &company_id,
            status,
            comment,
            Utc::now(),
        ) {
            Ok(updated) => updated,
            Err(error) => {
                self.audit.emit(
                    audit
                        .event("expense.override_rejected", AuditCategory::Override, AuditOutcome::Rejected)
                        .with_metadata("error", error.to_string()),
                );
                return Err(error.into());
            }
        };
        let stored = self.expenses.replace(updated).await?;

        self.audit.emit(
            audit
                .event("expense.override_applied", AuditCategory::Override, AuditOutcome::Success)
                .with_metadata("from", expense.status.as_str())
                .with_metadata("to", stored.status.as_str()),
        );
        info!(
            event_name = "expense.override_applied",
            correlation_id = %ctx.correlation_id,
            expense_id = %stored.id,
            status = stored.status.as_str(),
            "admin override applied"
        );

        Ok(stored)
    }

    pub async fn assign_approver(
        &self,
        ctx: &RequestContext,
        expense_id: &ExpenseId,
        approver_id: &UserId,
    ) -> Result<Expense, ApplicationError> {
        let expense = self.load_expense(expense_id).await?;
        let admin = self.load_user(&ctx.actor_id).await?;
        let approver = self.load_user(approver_id).await?;
        let company_id = self.company_of(&expense).await?;

        let updated =
            self.machine.assign_approver(&expense, &admin, &company_id, &approver, Utc::now())?;
        let stored = self.expenses.replace(updated).await?;

        self.audit.emit(
            ctx.audit()
                .for_expense(expense_id)
                .event("routing.approver_assigned", AuditCategory::Routing, AuditOutcome::Success)
                .with_metadata("approver_id", approver.id.0.clone()),
        );
        info!(
            event_name = "routing.approver_assigned",
            correlation_id = %ctx.correlation_id,
            expense_id = %stored.id,
            approver_id = %approver.id.0,
            "approver assigned to unrouted expense"
        );

        Ok(stored)
    }

    pub async fn delete_expense(
        &self,
        ctx: &RequestContext,
        expense_id: &ExpenseId,
    ) -> Result<(), ApplicationError> {
        let expense = self.load_expense(expense_id).await?;
        let actor = self.load_user(&ctx.actor_id).await?;
        let company_id = self.company_of(&expense).await?;

        if !actor.administers(&company_id) {
            return Err(DomainError::NotAuthorized {
                actor_id: actor.id.0,
                action: "delete an expense".to_string(),
            }
            .into());
        }

        if !self.expenses.delete(expense_id).await? {
            return Err(ApplicationError::not_found("expense", expense_id.0.clone()));
        }

        self.audit.emit(
            ctx.audit()
                .for_expense(expense_id)
                .event("expense.deleted", AuditCategory::Override, AuditOutcome::Success),
        );
        info!(
            event_name = "expense.deleted",
            correlation_id = %ctx.correlation_id,
            expense_id = %expense_id,
            "expense deleted"
        );
        Ok(())
    }

    /// Owner or company admin may edit descriptive fields.
    pub async fn patch_expense(
        &self,
        ctx: &RequestContext,
        expense_id: &ExpenseId,
        patch: ExpensePatch,
    ) -> Result<Expense, ApplicationError> {
        if patch.is_empty() {
            return Err(DomainError::InvalidExpense("patch does not change any field".to_string())
                .into());
        }

        let expense = self.load_expense(expense_id).await?;
        if ctx.actor_id != expense.employee_id {
            let actor = self.load_user(&ctx.actor_id).await?;
            let company_id = self.company_of(&expense).await?;
            if !actor.administers(&company_id) {
                return Err(DomainError::NotAuthorized {
                    actor_id: actor.id.0,
                    action: "edit this expense".to_string(),
                }
                .into());
            }
        }

        let patched = self.expenses.patch(expense_id, &patch).await?;
        info!(
            event_name = "expense.patched",
            correlation_id = %ctx.correlation_id,
            expense_id = %expense_id,
            "expense fields updated"
        );
        Ok(patched)
    }

    pub async fn list_rules(&self, company_id: &CompanyId) -> Result<Vec<ApprovalRule>, ApplicationError> {
        Ok(self.rules.list_by_company(company_id).await?)
    }

    pub async fn create_rule(
        &self,
        ctx: &RequestContext,
        company_id: &CompanyId,
        draft: RuleDraft,
    ) -> Result<ApprovalRule, ApplicationError> {
        self.require_admin(ctx, company_id, "create approval rules").await?;
        self.load_company(company_id).await?;

        let rule = draft.into_rule(RuleId(Uuid::new_v4().to_string()), company_id.clone(), Utc::now());
        rule.validate()?;
        self.rules.insert(rule.clone()).await?;

        self.emit_rule_event(ctx, "rules.created", &rule);
        Ok(rule)
    }

    /// Replaces a rule's definition in place; its evaluation position is kept.
    pub async fn update_rule(
        &self,
        ctx: &RequestContext,
        rule_id: &RuleId,
        draft: RuleDraft,
    ) -> Result<ApprovalRule, ApplicationError> {
        let existing = self.load_rule(rule_id).await?;
        self.require_admin(ctx, &existing.company_id, "edit approval rules").await?;

        let rule = draft.into_rule(existing.id, existing.company_id, existing.created_at);
        rule.validate()?;
        self.rules.update(rule.clone()).await?;

        self.emit_rule_event(ctx, "rules.updated", &rule);
        Ok(rule)
    }

    pub async fn delete_rule(&self, ctx: &RequestContext, rule_id: &RuleId) -> Result<(), ApplicationError> {
        let existing = self.load_rule(rule_id).await?;
        self.require_admin(ctx, &existing.company_id, "delete approval rules").await?;

        if !self.rules.delete(rule_id).await? {
            return Err(ApplicationError::not_found("approval rule", rule_id.0.clone()));
        }

        self.emit_rule_event(ctx, "rules.deleted", &existing);
        Ok(())
    }

    pub async fn list_users(&self, company_id: &CompanyId) -> Result<Vec<User>, ApplicationError> {
        Ok(self.users.list_by_company(company_id).await?)
    }

    pub async fn create_user(
        &self,
        ctx: &RequestContext,
        company_id: &CompanyId,
        draft: UserDraft,
    ) -> Result<User, ApplicationError> {
        self.require_admin(ctx, company_id, "create users").await?;
        self.load_company(company_id).await?;
        draft.validate()?;

        let user = draft.into_user(UserId(Uuid::new_v4().to_string()), company_id.clone(), Utc::now());
        self.check_directory_entry(&user).await?;
        self.users.save(user.clone()).await?;

        self.emit_directory_event(ctx, "users.created", company_id, &user.id);
        Ok(user)
    }

    /// Rewrites name, email, role and manager. Company and creation time are kept.
    pub async fn update_user(
        &self,
        ctx: &RequestContext,
        user_id: &UserId,
        draft: UserDraft,
    ) -> Result<User, ApplicationError> {
        let existing = self.load_user(user_id).await?;
        let admin = self.require_admin(ctx, &existing.company_id, "edit users").await?;
        draft.validate()?;

        if admin.id == existing.id && draft.role != UserRole::Admin {
            return Err(DomainError::InvalidUser("admins cannot remove their own admin role".to_string())
                .into());
        }

        let user = draft.into_user(existing.id, existing.company_id, existing.created_at);
        self.check_directory_entry(&user).await?;
        self.users.save(user.clone()).await?;

        self.emit_directory_event(ctx, "users.updated", &user.company_id, &user.id);
        Ok(user)
    }

    /// Refused while the user owns expenses or holds pending approvals; reports are detached.
    pub async fn delete_user(&self, ctx: &RequestContext, user_id: &UserId) -> Result<(), ApplicationError> {
        let existing = self.load_user(user_id).await?;
        let admin = self.require_admin(ctx, &existing.company_id, "delete users").await?;

        if admin.id == existing.id {
            return Err(DomainError::InvalidUser("admins cannot delete themselves".to_string()).into());
        }
        if !self.expenses.list_by_employee(user_id).await?.is_empty() {
            return Err(DomainError::InvalidUser(format!(
                "user `{}` has submitted expenses and cannot be deleted",
                user_id.0
            ))
            .into());
        }
        if !self.expenses.list_pending_for_approver(user_id).await?.is_empty() {
            return Err(DomainError::InvalidUser(format!(
                "user `{}` still has expenses awaiting their decision",
                user_id.0
            ))
            .into());
        }

        for mut report in self.users.list_by_manager(user_id).await? {
            report.manager_id = None;
            self.users.save(report).await?;
        }
        if !self.users.delete(user_id).await? {
            return Err(ApplicationError::not_found("user", user_id.0.clone()));
        }

        self.emit_directory_event(ctx, "users.deleted", &existing.company_id, user_id);
        Ok(())
    }

    /// Later submissions convert into the new currency; stored expenses are left as they are.
    pub async fn update_company(
        &self,
        ctx: &RequestContext,
        company_id: &CompanyId,
        settings: CompanySettings,
    ) -> Result<Company, ApplicationError> {
        self.require_admin(ctx, company_id, "edit company settings").await?;
        if settings.is_empty() {
            return Err(DomainError::InvalidCompany("settings do not change any field".to_string())
                .into());
        }

        let mut company = self.load_company(company_id).await?;
        settings.apply_to(&mut company)?;
        self.companies.save(company.clone()).await?;

        self.audit.emit(
            ctx.audit()
                .event("company.updated", AuditCategory::Directory, AuditOutcome::Success)
                .with_metadata("company_id", company.id.0.clone())
                .with_metadata("currency", company.currency.clone()),
        );
        info!(
            event_name = "company.updated",
            correlation_id = %ctx.correlation_id,
            company_id = %company.id.0,
            currency = %company.currency,
            "company settings updated"
        );
        Ok(company)
    }

    pub async fn expenses_for_employee(&self, employee_id: &UserId) -> Result<Vec<Expense>, ApplicationError> {
        Ok(self.expenses.list_by_employee(employee_id).await?)
    }

    pub async fn pending_for_approver(&self, approver_id: &UserId) -> Result<Vec<Expense>, ApplicationError> {
        Ok(self.expenses.list_pending_for_approver(approver_id).await?)
    }

    /// All expenses whose employee belongs to the company.
    pub async fn expenses_for_company(&self, company_id: &CompanyId) -> Result<Vec<Expense>, ApplicationError> {
        let employee_ids: Vec<UserId> = self
            .users
            .list_by_company(company_id)
            .await?
            .into_iter()
            .map(|user| user.id)
            .collect();
        if employee_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.expenses.list_by_employees(&employee_ids).await?)
    }

    /// Expenses of the manager's direct reports.
    pub async fn team_expenses(&self, manager_id: &UserId) -> Result<Vec<Expense>, ApplicationError> {
        let report_ids: Vec<UserId> = self
            .users
            .list_by_manager(manager_id)
            .await?
            .into_iter()
            .map(|user| user.id)
            .collect();
        if report_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.expenses.list_by_employees(&report_ids).await?)
    }

    pub async fn unrouted_expenses(&self, company_id: &CompanyId) -> Result<Vec<Expense>, ApplicationError> {
        let mut expenses = self.expenses_for_company(company_id).await?;
        expenses.retain(Expense::is_unrouted);
        Ok(expenses)
    }

    pub async fn company_summary(&self, company_id: &CompanyId) -> Result<LedgerSummary, ApplicationError> {
        let expenses = self.expenses_for_company(company_id).await?;
        Ok(LedgerSummary::from_expenses(&expenses))
    }

    fn report_unrouted(&self, audit: &AuditContext, expense: &Expense, reason: &str) {
        self.audit.emit(
            audit
                .event("routing.unrouted", AuditCategory::Routing, AuditOutcome::Failed)
                .with_metadata("reason", reason),
        );
        warn!(
            event_name = "routing.unrouted",
            correlation_id = %audit.correlation_id,
            expense_id = %expense.id,
            reason = reason,
            "expense is awaiting approver assignment"
        );
    }

    fn emit_rule_event(&self, ctx: &RequestContext, event_type: &str, rule: &ApprovalRule) {
        self.audit.emit(
            ctx.audit()
                .event(event_type, AuditCategory::Rules, AuditOutcome::Success)
                .with_metadata("rule_id", rule.id.0.clone())
                .with_metadata("company_id", rule.company_id.0.clone()),
        );
        info!(
            event_name = event_type,
            correlation_id = %ctx.correlation_id,
            rule_id = %rule.id.0,
            "approval rule set changed"
        );
    }

    fn emit_directory_event(
        &self,
        ctx: &RequestContext,
        event_type: &str,
        company_id: &CompanyId,
        user_id: &UserId,
    ) {
        self.audit.emit(
            ctx.audit()
                .event(event_type, AuditCategory::Directory, AuditOutcome::Success)
                .with_metadata("user_id", user_id.0.clone())
                .with_metadata("company_id", company_id.0.clone()),
        );
        info!(
            event_name = event_type,
            correlation_id = %ctx.correlation_id,
            user_id = %user_id.0,
            "company directory changed"
        );
    }

    /// Email is unique per company; a manager must be a manager or admin of the same company.
    async fn check_directory_entry(&self, user: &User) -> Result<(), ApplicationError> {
        let colleagues = self.users.list_by_company(&user.company_id).await?;
        if colleagues
            .iter()
            .any(|other| other.id != user.id && other.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(DomainError::InvalidUser(format!("email `{}` is already in use", user.email))
                .into());
        }

        let Some(manager_id) = &user.manager_id else {
            return Ok(());
        };
        if *manager_id == user.id {
            return Err(DomainError::InvalidUser("a user cannot manage themselves".to_string()).into());
        }
        match colleagues.iter().find(|other| other.id == *manager_id) {
            Some(manager) if matches!(manager.role, UserRole::Manager | UserRole::Admin) => Ok(()),
            Some(_) => Err(DomainError::InvalidUser(format!(
                "user `{}` is not a manager or admin",
                manager_id.0
            ))
            .into()),
            None => Err(DomainError::InvalidUser(format!(
                "manager `{}` is not part of this company",
                manager_id.0
            ))
            .into()),
        }
    }

    async fn require_admin(
        &self,
        ctx: &RequestContext,
        company_id: &CompanyId,
        action: &str,
    ) -> Result<User, ApplicationError> {
        let actor = self.load_user(&ctx.actor_id).await?;
        if !actor.administers(company_id) {
            return Err(DomainError::NotAuthorized {
                actor_id: actor.id.0,
                action: action.to_string(),
            }
            .into());
        }
        Ok(actor)
    }

    async fn company_of(&self, expense: &Expense) -> Result<CompanyId, ApplicationError> {
        Ok(self.load_user(&expense.employee_id).await?.company_id)
    }

    async fn load_user(&self, id: &UserId) -> Result<User, ApplicationError> {
        self.users.find_by_id(id).await?.ok_or_else(|| ApplicationError::not_found("user", id.0.clone()))
    }

    async fn load_company(&self, id: &CompanyId) -> Result<Company, ApplicationError> {
        self.companies
            .find_by_id(id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("company", id.0.clone()))
    }

    async fn load_expense(&self, id: &ExpenseId) -> Result<Expense, ApplicationError> {
        self.expenses
            .find_by_id(id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("expense", id.0.clone()))
    }

    async fn load_rule(&self, id: &RuleId) -> Result<ApprovalRule, ApplicationError> {
        self.rules
            .find_by_id(id)
            .await?
            .ok_or_else(|| ApplicationError::not_found("approval rule", id.0.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{NaiveDate, Utc};
    use rust_decimal::Decimal;

    use super::{ExpenseWorkflow, RequestContext};
    use crate::approvals::DecisionAction;
    use crate::audit::InMemoryAuditSink;
    use crate::currency::StaticRateConverter;
    use crate::domain::expense::{
        ExpenseCategory, ExpenseId, ExpensePatch, ExpenseStatus, HistoryAction, NewExpense,
        RoutingState,
    };
    use crate::domain::rule::{
        ApprovalCondition, ApprovalLevel, ApproverRef, ConditionField, ConditionOperator,
        RuleDraft,
    };
    use crate::domain::user::{Company, CompanyId, CompanySettings, User, UserDraft, UserId, UserRole};
    use crate::errors::{ApplicationError, DomainError};
    use crate::store::{
        CompanyRepository, ExpenseRepository, InMemoryApprovalRuleRepository,
        InMemoryCompanyRepository, InMemoryExpenseRepository, InMemoryUserRepository,
        UserRepository,
    };

    struct Harness {
        workflow: ExpenseWorkflow,
        expenses: Arc<InMemoryExpenseRepository>,
        users: Arc<InMemoryUserRepository>,
        audit: InMemoryAuditSink,
    }

    fn user(id: &str, name: &str, role: UserRole, manager: Option<&str>) -> User {
        User {
            id: UserId(id.to_string()),
            email: format!("{id}@acme.test"),
            name: name.to_string(),
            role,
            company_id: CompanyId("company-1".to_string()),
            manager_id: manager.map(|id| UserId(id.to_string())),
            created_at: Utc::now(),
        }
    }

    async fn harness() -> Harness {
        let users = Arc::new(InMemoryUserRepository::default());
        let companies = Arc::new(InMemoryCompanyRepository::default());
        let rules = Arc::new(InMemoryApprovalRuleRepository::default());
        let expenses = Arc::new(InMemoryExpenseRepository::default());
        let audit = InMemoryAuditSink::default();

        companies
            .save(Company {
                id: CompanyId("company-1".to_string()),
                name: "Acme Corporation".to_string(),
                currency: "USD".to_string(),
                country_code: "US".to_string(),
                created_at: Utc::now(),
            })
            .await
            .expect("company");
        for record in [
            user("user-1", "John Admin", UserRole::Admin, None),
            user("user-2", "Sarah Manager", UserRole::Manager, Some("user-1")),
            user("user-3", "Mike Employee", UserRole::Employee, Some("user-2")),
            user("user-4", "Lisa Worker", UserRole::Employee, None),
            user("user-5", "Dana Director", UserRole::Manager, None),
        ] {
            users.save(record).await.expect("user");
        }

        let workflow = ExpenseWorkflow::new(
            users.clone(),
            companies,
            rules,
            expenses.clone(),
            Arc::new(StaticRateConverter::usd_fallback()),
            Arc::new(audit.clone()),
        );

        Harness { workflow, expenses, users, audit }
    }

    fn ctx(actor: &str) -> RequestContext {
        RequestContext::new(UserId(actor.to_string()), format!("req-{actor}"))
    }

    fn submission(employee: &str, amount: i64, currency: &str, category: ExpenseCategory) -> NewExpense {
        NewExpense {
            employee_id: UserId(employee.to_string()),
            amount: Decimal::new(amount, 0),
            currency: currency.to_string(),
            category,
            description: "Trip to client site".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 4, 2).expect("valid date"),
            receipt_url: None,
        }
    }

    fn approver(id: &str, name: &str) -> ApproverRef {
        ApproverRef { user_id: UserId(id.to_string()), user_name: name.to_string() }
    }

    fn large_spend_rule() -> RuleDraft {
        RuleDraft {
            name: "Large spend".to_string(),
            conditions: vec![ApprovalCondition {
                field: ConditionField::Amount,
                operator: ConditionOperator::GreaterThan,
                value: "1000".to_string(),
            }],
            is_manager_approver: false,
            approvers: Vec::new(),
            levels: vec![
                ApprovalLevel { level: 1, approvers: vec![approver("user-2", "Sarah Manager")] },
                ApprovalLevel { level: 2, approvers: vec![approver("user-5", "Dana Director")] },
            ],
        }
    }

    fn default_manager_rule() -> RuleDraft {
        RuleDraft {
            name: "Default".to_string(),
            conditions: Vec::new(),
            is_manager_approver: true,
            approvers: Vec::new(),
            levels: Vec::new(),
        }
    }

    #[tokio::test]
    async fn two_level_rule_routes_through_both_levels() {
        let h = harness().await;
        h.workflow
            .create_rule(&ctx("user-1"), &CompanyId("company-1".to_string()), large_spend_rule())
            .await
            .expect("rule");

        let expense = h
            .workflow
            .submit_expense(&ctx("user-3"), submission("user-3", 1200, "USD", ExpenseCategory::Travel))
            .await
            .expect("submit");
        assert_eq!(expense.current_approver_id, Some(UserId("user-2".to_string())));
        assert_eq!(expense.approval_history.len(), 1);

        let after_first = h
            .workflow
            .decide(&ctx("user-2"), &expense.id, DecisionAction::Approved, None)
            .await
            .expect("level 1");
        assert_eq!(after_first.status, ExpenseStatus::Pending);
        assert_eq!(after_first.current_approver_id, Some(UserId("user-5".to_string())));
        assert_eq!(after_first.approval_history[2].approver_name, "Dana Director");

        let done = h
            .workflow
            .decide(&ctx("user-5"), &expense.id, DecisionAction::Approved, Some("ok".to_string()))
            .await
            .expect("level 2");
        assert_eq!(done.status, ExpenseStatus::Approved);
        assert_eq!(done.current_approver_id, None);
        assert_eq!(done.approval_history.len(), 4);
        assert_eq!(done.approval_history[3].comment.as_deref(), Some("ok"));
        assert_eq!(done.version, 3);
    }

    #[tokio::test]
    async fn custom_approver_rule_routes_to_named_approver_and_finalizes() {
        let h = harness().await;
        let custom = RuleDraft {
            name: "Director sign-off".to_string(),
            conditions: Vec::new(),
            is_manager_approver: false,
            approvers: vec![approver("user-5", "Dana Director")],
            levels: Vec::new(),
        };
        h.workflow
            .create_rule(&ctx("user-1"), &CompanyId("company-1".to_string()), custom)
            .await
            .expect("rule");

        let expense = h
            .workflow
            .submit_expense(&ctx("user-3"), submission("user-3", 75, "USD", ExpenseCategory::Food))
            .await
            .expect("submit");
        assert_eq!(expense.current_approver_id, Some(UserId("user-5".to_string())));
        assert_eq!(expense.approval_history[0].approver_name, "Dana Director");

        let submitted = h
            .audit
            .events()
            .into_iter()
            .find(|event| event.event_type == "expense.submitted")
            .expect("submission event");
        assert_eq!(submitted.metadata.get("route_source").map(String::as_str), Some("custom_approver"));

        let done = h
            .workflow
            .decide(&ctx("user-5"), &expense.id, DecisionAction::Approved, None)
            .await
            .expect("approve");
        assert_eq!(done.status, ExpenseStatus::Approved);
        assert_eq!(done.current_approver_id, None);
        assert_eq!(done.approval_history.len(), 2);
        assert_eq!(done.approval_history[1].action, HistoryAction::Approved);
    }

    #[tokio::test]
    async fn default_rule_routes_to_manager_or_leaves_unrouted() {
        let h = harness().await;
        h.workflow
            .create_rule(&ctx("user-1"), &CompanyId("company-1".to_string()), default_manager_rule())
            .await
            .expect("rule");

        let routed = h
            .workflow
            .submit_expense(&ctx("user-3"), submission("user-3", 50, "USD", ExpenseCategory::Food))
            .await
            .expect("submit");
        assert_eq!(routed.current_approver_id, Some(UserId("user-2".to_string())));

        let unrouted = h
            .workflow
            .submit_expense(&ctx("user-4"), submission("user-4", 50, "USD", ExpenseCategory::Food))
            .await
            .expect("submit without manager");
        assert_eq!(unrouted.routing_state(), RoutingState::AwaitingAssignment);
        assert!(unrouted.approval_history.is_empty());
        assert!(h.audit.event_types().contains(&"routing.unrouted".to_string()));

        let listed = h
            .workflow
            .unrouted_expenses(&CompanyId("company-1".to_string()))
            .await
            .expect("unrouted view");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, unrouted.id);
    }

    #[tokio::test]
    async fn foreign_currency_is_converted_to_company_currency() {
        let h = harness().await;
        let expense = h
            .workflow
            .submit_expense(&ctx("user-3"), submission("user-3", 85, "eur", ExpenseCategory::Transportation))
            .await
            .expect("submit");

        assert_eq!(expense.currency, "EUR");
        assert_eq!(expense.amount, Decimal::new(85, 0));
        assert_eq!(expense.amount_in_company_currency, Decimal::new(100, 0));
    }

    #[tokio::test]
    async fn unknown_currency_falls_back_to_submitted_amount() {
        let h = harness().await;
        let expense = h
            .workflow
            .submit_expense(&ctx("user-3"), submission("user-3", 40, "XYZ", ExpenseCategory::Other))
            .await
            .expect("submit");

        assert_eq!(expense.amount_in_company_currency, Decimal::new(40, 0));
    }

    #[tokio::test]
    async fn wrong_approver_and_repeat_decisions_are_refused_without_mutation() {
        let h = harness().await;
        let expense = h
            .workflow
            .submit_expense(&ctx("user-3"), submission("user-3", 50, "USD", ExpenseCategory::Food))
            .await
            .expect("submit");

        let wrong = h
            .workflow
            .decide(&ctx("user-5"), &expense.id, DecisionAction::Approved, None)
            .await
            .expect_err("not the current approver");
        assert!(matches!(wrong, ApplicationError::Domain(DomainError::StaleDecision { .. })));

        h.workflow
            .decide(&ctx("user-2"), &expense.id, DecisionAction::Rejected, None)
            .await
            .expect("reject");
        let repeat = h
            .workflow
            .decide(&ctx("user-2"), &expense.id, DecisionAction::Approved, None)
            .await
            .expect_err("already terminal");
        assert!(matches!(repeat, ApplicationError::Domain(DomainError::StaleDecision { .. })));

        let stored = h
            .expenses
            .find_by_id(&expense.id)
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(stored.status, ExpenseStatus::Rejected);
        assert_eq!(stored.approval_history.len(), 2);
        assert!(h.audit.event_types().contains(&"expense.decision_rejected".to_string()));
    }

    #[tokio::test]
    async fn rule_changes_between_decisions_take_effect_mid_flight() {
        let h = harness().await;
        let company = CompanyId("company-1".to_string());
        let rule = h
            .workflow
            .create_rule(&ctx("user-1"), &company, large_spend_rule())
            .await
            .expect("rule");

        let expense = h
            .workflow
            .submit_expense(&ctx("user-3"), submission("user-3", 1500, "USD", ExpenseCategory::Travel))
            .await
            .expect("submit");

        h.workflow.delete_rule(&ctx("user-1"), &rule.id).await.expect("delete rule");

        let decided = h
            .workflow
            .decide(&ctx("user-2"), &expense.id, DecisionAction::Approved, None)
            .await
            .expect("decide");
        assert_eq!(decided.status, ExpenseStatus::Approved);
    }

    #[tokio::test]
    async fn admin_override_and_assignment_recover_unrouted_expenses() {
        let h = harness().await;
        let expense = h
            .workflow
            .submit_expense(&ctx("user-4"), submission("user-4", 30, "USD", ExpenseCategory::Food))
            .await
            .expect("submit");
        assert!(expense.is_unrouted());

        let denied = h
            .workflow
            .assign_approver(&ctx("user-2"), &expense.id, &UserId("user-5".to_string()))
            .await
            .expect_err("managers cannot assign");
        assert!(matches!(denied, ApplicationError::Domain(DomainError::NotAuthorized { .. })));

        let assigned = h
            .workflow
            .assign_approver(&ctx("user-1"), &expense.id, &UserId("user-5".to_string()))
            .await
            .expect("assign");
        assert_eq!(assigned.current_approver_id, Some(UserId("user-5".to_string())));
        assert_eq!(h.workflow.pending_for_approver(&UserId("user-5".to_string())).await.expect("view").len(), 1);

        let overridden = h
            .workflow
            .override_status(&ctx("user-1"), &expense.id, ExpenseStatus::Approved, None)
            .await
            .expect("override");
        assert_eq!(overridden.status, ExpenseStatus::Approved);
        let last = overridden.approval_history.last().expect("entry");
        assert!(last.is_override);
        assert_eq!(last.action, HistoryAction::Approved);
        assert!(h.workflow.pending_for_approver(&UserId("user-5".to_string())).await.expect("view").is_empty());
    }

    #[tokio::test]
    async fn rule_management_is_admin_only_and_validated() {
        let h = harness().await;
        let company = CompanyId("company-1".to_string());

        let denied = h
            .workflow
            .create_rule(&ctx("user-2"), &company, default_manager_rule())
            .await
            .expect_err("manager cannot create rules");
        assert!(matches!(denied, ApplicationError::Domain(DomainError::NotAuthorized { .. })));

        let mut duplicate = large_spend_rule();
        duplicate.levels[0].approvers.push(approver("user-2", "Sarah Manager"));
        let invalid = h
            .workflow
            .create_rule(&ctx("user-1"), &company, duplicate)
            .await
            .expect_err("duplicate approver in level");
        assert!(matches!(invalid, ApplicationError::Domain(DomainError::InvalidRule(_))));

        let first = h.workflow.create_rule(&ctx("user-1"), &company, large_spend_rule()).await.expect("first");
        let second = h.workflow.create_rule(&ctx("user-1"), &company, default_manager_rule()).await.expect("second");

        let mut renamed = large_spend_rule();
        renamed.name = "Very large spend".to_string();
        let updated = h.workflow.update_rule(&ctx("user-1"), &first.id, renamed).await.expect("update");
        assert_eq!(updated.id, first.id);
        assert_eq!(updated.created_at, first.created_at);

        let listed = h.workflow.list_rules(&company).await.expect("list");
        let names: Vec<_> = listed.iter().map(|rule| rule.name.as_str()).collect();
        assert_eq!(names, vec!["Very large spend", "Default"]);
        assert_eq!(listed[1].id, second.id);
    }

    #[tokio::test]
    async fn patch_is_limited_to_owner_or_admin() {
        let h = harness().await;
        let expense = h
            .workflow
            .submit_expense(&ctx("user-3"), submission("user-3", 50, "USD", ExpenseCategory::Food))
            .await
            .expect("submit");
        let patch = ExpensePatch { description: Some("Team lunch".to_string()), ..ExpensePatch::default() };

        let denied = h
            .workflow
            .patch_expense(&ctx("user-4"), &expense.id, patch.clone())
            .await
            .expect_err("other employee");
        assert!(matches!(denied, ApplicationError::Domain(DomainError::NotAuthorized { .. })));

        let patched = h.workflow.patch_expense(&ctx("user-3"), &expense.id, patch).await.expect("owner");
        assert_eq!(patched.description, "Team lunch");
        assert_eq!(patched.current_approver_id, expense.current_approver_id);

        let empty = h
            .workflow
            .patch_expense(&ctx("user-1"), &expense.id, ExpensePatch::default())
            .await
            .expect_err("empty patch");
        assert!(matches!(empty, ApplicationError::Domain(DomainError::InvalidExpense(_))));
    }

    #[tokio::test]
    async fn delete_requires_admin_and_unknown_ids_are_not_found() {
        let h = harness().await;
        let expense = h
            .workflow
            .submit_expense(&ctx("user-3"), submission("user-3", 50, "USD", ExpenseCategory::Food))
            .await
            .expect("submit");

        assert!(h.workflow.delete_expense(&ctx("user-3"), &expense.id).await.is_err());
        h.workflow.delete_expense(&ctx("user-1"), &expense.id).await.expect("admin delete");

        let missing = h
            .workflow
            .delete_expense(&ctx("user-1"), &ExpenseId("missing".to_string()))
            .await
            .expect_err("missing");
        assert!(matches!(missing, ApplicationError::NotFound { entity: "expense", .. }));
    }

    #[tokio::test]
    async fn views_and_summary_cover_company_and_team() {
        let h = harness().await;
        let first = h
            .workflow
            .submit_expense(&ctx("user-3"), submission("user-3", 100, "USD", ExpenseCategory::Food))
            .await
            .expect("submit");
        h.workflow
            .submit_expense(&ctx("user-3"), submission("user-3", 40, "USD", ExpenseCategory::Travel))
            .await
            .expect("submit");
        h.workflow
            .submit_expense(&ctx("user-4"), submission("user-4", 60, "USD", ExpenseCategory::Food))
            .await
            .expect("submit");
        h.workflow
            .decide(&ctx("user-2"), &first.id, DecisionAction::Approved, None)
            .await
            .expect("approve");

        let company = CompanyId("company-1".to_string());
        assert_eq!(h.workflow.expenses_for_company(&company).await.expect("company").len(), 3);
        assert_eq!(h.workflow.team_expenses(&UserId("user-2".to_string())).await.expect("team").len(), 2);
        assert_eq!(
            h.workflow.expenses_for_employee(&UserId("user-4".to_string())).await.expect("mine").len(),
            1
        );

        let summary = h.workflow.company_summary(&company).await.expect("summary");
        assert_eq!(summary.total, 3);
        assert_eq!(summary.approved, 1);
        assert_eq!(summary.pending, 2);
        assert_eq!(summary.unrouted, 1);
        assert_eq!(summary.approved_amount, Decimal::new(100, 0));
        assert_eq!(summary.pending_amount, Decimal::new(100, 0));
    }

    fn draft(name: &str, email: &str, role: UserRole, manager: Option<&str>) -> UserDraft {
        UserDraft {
            name: name.to_string(),
            email: email.to_string(),
            role,
            manager_id: manager.map(|id| UserId(id.to_string())),
        }
    }

    #[tokio::test]
    async fn admins_create_and_update_directory_entries() {
        let h = harness().await;
        let company = CompanyId("company-1".to_string());

        let denied = h
            .workflow
            .create_user(&ctx("user-2"), &company, draft("Nina New", "nina@acme.test", UserRole::Employee, None))
            .await
            .expect_err("managers cannot create users");
        assert!(matches!(denied, ApplicationError::Domain(DomainError::NotAuthorized { .. })));

        let created = h
            .workflow
            .create_user(
                &ctx("user-1"),
                &company,
                draft(" Nina New ", "nina@acme.test", UserRole::Employee, Some("user-5")),
            )
            .await
            .expect("create");
        assert_eq!(created.name, "Nina New");
        assert_eq!(created.company_id, company);
        assert_eq!(h.workflow.list_users(&company).await.expect("list").len(), 6);

        let routed = h
            .workflow
            .submit_expense(&ctx(&created.id.0), submission(&created.id.0, 20, "USD", ExpenseCategory::Food))
            .await
            .expect("new user submits");
        assert_eq!(routed.current_approver_id, Some(UserId("user-5".to_string())));

        let updated = h
            .workflow
            .update_user(
                &ctx("user-1"),
                &created.id,
                draft("Nina New", "nina@acme.test", UserRole::Manager, Some("user-2")),
            )
            .await
            .expect("update");
        assert_eq!(updated.role, UserRole::Manager);
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(updated.manager_id, Some(UserId("user-2".to_string())));

        let events = h.audit.event_types();
        assert!(events.contains(&"users.created".to_string()));
        assert!(events.contains(&"users.updated".to_string()));
    }

    #[tokio::test]
    async fn directory_entries_are_checked_against_the_company() {
        let h = harness().await;
        let company = CompanyId("company-1".to_string());
        let admin = ctx("user-1");

        let cases = [
            draft("", "blank@acme.test", UserRole::Employee, None),
            draft("No Domain", "nobody@", UserRole::Employee, None),
            draft("Copy Cat", "USER-3@acme.test", UserRole::Employee, None),
            draft("Wrong Boss", "boss@acme.test", UserRole::Employee, Some("user-4")),
            draft("Ghost Boss", "ghost@acme.test", UserRole::Employee, Some("user-99")),
        ];
        for bad in cases {
            let error = h.workflow.create_user(&admin, &company, bad).await.expect_err("invalid entry");
            assert!(matches!(error, ApplicationError::Domain(DomainError::InvalidUser(_))));
        }

        let own_manager = h
            .workflow
            .update_user(
                &admin,
                &UserId("user-2".to_string()),
                draft("Sarah Manager", "user-2@acme.test", UserRole::Manager, Some("user-2")),
            )
            .await
            .expect_err("self managed");
        assert!(matches!(own_manager, ApplicationError::Domain(DomainError::InvalidUser(_))));

        let demoted = h
            .workflow
            .update_user(
                &admin,
                &UserId("user-1".to_string()),
                draft("John Admin", "user-1@acme.test", UserRole::Employee, None),
            )
            .await
            .expect_err("admin demoting themselves");
        assert!(matches!(demoted, ApplicationError::Domain(DomainError::InvalidUser(_))));
    }

    #[tokio::test]
    async fn delete_user_keeps_expense_history_intact() {
        let h = harness().await;
        let admin = ctx("user-1");
        h.workflow
            .submit_expense(&ctx("user-3"), submission("user-3", 50, "USD", ExpenseCategory::Food))
            .await
            .expect("submit");

        let owner = h
            .workflow
            .delete_user(&admin, &UserId("user-3".to_string()))
            .await
            .expect_err("user with expenses");
        assert!(matches!(owner, ApplicationError::Domain(DomainError::InvalidUser(_))));

        let approver = h
            .workflow
            .delete_user(&admin, &UserId("user-2".to_string()))
            .await
            .expect_err("approver with pending work");
        assert!(matches!(approver, ApplicationError::Domain(DomainError::InvalidUser(_))));

        let own = h.workflow.delete_user(&admin, &UserId("user-1".to_string())).await.expect_err("self delete");
        assert!(matches!(own, ApplicationError::Domain(DomainError::InvalidUser(_))));

        let report = h
            .workflow
            .create_user(
                &admin,
                &CompanyId("company-1".to_string()),
                draft("Rae Report", "rae@acme.test", UserRole::Employee, Some("user-5")),
            )
            .await
            .expect("report");
        h.workflow.delete_user(&admin, &UserId("user-5".to_string())).await.expect("delete director");

        assert!(h.users.find_by_id(&UserId("user-5".to_string())).await.expect("find").is_none());
        let detached = h.users.find_by_id(&report.id).await.expect("find").expect("report kept");
        assert_eq!(detached.manager_id, None);
        assert!(h.audit.event_types().contains(&"users.deleted".to_string()));

        let missing = h
            .workflow
            .delete_user(&admin, &UserId("user-5".to_string()))
            .await
            .expect_err("already gone");
        assert!(matches!(missing, ApplicationError::NotFound { entity: "user", .. }));
    }

    #[tokio::test]
    async fn company_currency_change_applies_to_later_submissions() {
        let h = harness().await;
        let company = CompanyId("company-1".to_string());
        let before = h
            .workflow
            .submit_expense(&ctx("user-3"), submission("user-3", 100, "USD", ExpenseCategory::Food))
            .await
            .expect("submit in USD");

        let denied = h
            .workflow
            .update_company(
                &ctx("user-2"),
                &company,
                CompanySettings { currency: Some("EUR".to_string()), ..CompanySettings::default() },
            )
            .await
            .expect_err("manager");
        assert!(matches!(denied, ApplicationError::Domain(DomainError::NotAuthorized { .. })));

        let empty = h
            .workflow
            .update_company(&ctx("user-1"), &company, CompanySettings::default())
            .await
            .expect_err("no change");
        assert!(matches!(empty, ApplicationError::Domain(DomainError::InvalidCompany(_))));

        let updated = h
            .workflow
            .update_company(
                &ctx("user-1"),
                &company,
                CompanySettings { currency: Some("eur".to_string()), ..CompanySettings::default() },
            )
            .await
            .expect("update");
        assert_eq!(updated.currency, "EUR");
        assert_eq!(updated.name, "Acme Corporation");

        let after = h
            .workflow
            .submit_expense(&ctx("user-3"), submission("user-3", 100, "USD", ExpenseCategory::Food))
            .await
            .expect("submit after change");
        assert_eq!(after.amount_in_company_currency, Decimal::new(8500, 2));

        let stored = h.expenses.find_by_id(&before.id).await.expect("find").expect("exists");
        assert_eq!(stored.amount_in_company_currency, Decimal::new(100, 0));
    }

    #[tokio::test]
    async fn missing_required_fields_are_rejected_before_lookup() {
        let h = harness().await;
        let mut bad = submission("nobody", 0, "USD", ExpenseCategory::Food);
        bad.description = String::new();

        let error = h.workflow.submit_expense(&ctx("nobody"), bad).await.expect_err("invalid");
        assert!(matches!(error, ApplicationError::Domain(DomainError::InvalidExpense(_))));
        assert!(h.users.find_by_id(&UserId("nobody".to_string())).await.expect("find").is_none());
    }
}
