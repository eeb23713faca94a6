//! Read-only ledger queries for operators.

use std::sync::Arc;

use reimburse_core::audit::TracingAuditSink;
use reimburse_core::{CompanyId, ExpenseWorkflow, StaticRateConverter, UserId};
use reimburse_db::{
    DbPool, SqlApprovalRuleRepository, SqlCompanyRepository, SqlExpenseRepository,
    SqlUserRepository,
};
use serde_json::Value;

use crate::commands::{load_config, open_pool, runtime, CommandResult, StepFailure};

pub fn pending(approver_id: &str) -> CommandResult {
    let approver_id = UserId(approver_id.to_string());
    run_query("pending", |workflow| async move {
        let expenses = workflow
            .pending_for_approver(&approver_id)
            .await
            .map_err(|error| ("query", error.to_string(), 7u8))?;
        let message = format!("{} expense(s) awaiting `{}`", expenses.len(), approver_id.0);
        Ok((message, to_value(&expenses)?))
    })
}

pub fn unrouted(company_id: &str) -> CommandResult {
    let company_id = CompanyId(company_id.to_string());
    run_query("unrouted", |workflow| async move {
        let expenses = workflow
            .unrouted_expenses(&company_id)
            .await
            .map_err(|error| ("query", error.to_string(), 7u8))?;
        let message = format!(
            "{} expense(s) awaiting approver assignment in `{}`",
            expenses.len(),
            company_id.0
        );
        Ok((message, to_value(&expenses)?))
    })
}

pub fn summary(company_id: &str) -> CommandResult {
    let company_id = CompanyId(company_id.to_string());
    run_query("summary", |workflow| async move {
        let summary = workflow
            .company_summary(&company_id)
            .await
            .map_err(|error| ("query", error.to_string(), 7u8))?;
        let message = format!(
            "{} expense(s): {} pending, {} approved, {} rejected",
            summary.total, summary.pending, summary.approved, summary.rejected
        );
        Ok((message, to_value(&summary)?))
    })
}

fn run_query<F, Fut>(command: &'static str, query: F) -> CommandResult
where
    F: FnOnce(ExpenseWorkflow) -> Fut,
    Fut: std::future::Future<Output = Result<(String, Value), StepFailure>>,
{
    let config = match load_config(command) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime(command) {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let outcome = query(workflow(&pool)).await;
        pool.close().await;
        outcome
    });

    match result {
        Ok((message, data)) => CommandResult::success_with_data(command, message, Some(data)),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure(command, error_class, message, exit_code)
        }
    }
}

// Read paths only: the converter and audit sink are never reached.
fn workflow(pool: &DbPool) -> ExpenseWorkflow {
    ExpenseWorkflow::new(
        Arc::new(SqlUserRepository::new(pool.clone())),
        Arc::new(SqlCompanyRepository::new(pool.clone())),
        Arc::new(SqlApprovalRuleRepository::new(pool.clone())),
        Arc::new(SqlExpenseRepository::new(pool.clone())),
        Arc::new(StaticRateConverter::usd_fallback()),
        Arc::new(TracingAuditSink),
    )
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, StepFailure> {
    serde_json::to_value(value).map_err(|error| ("serialization", error.to_string(), 8u8))
}
