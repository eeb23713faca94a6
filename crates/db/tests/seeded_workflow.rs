use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use reimburse_core::audit::InMemoryAuditSink;
use reimburse_core::{
    ApplicationError, CompanyId, DecisionAction, DomainError, ExpenseCategory, ExpenseId,
    ExpenseStatus, ExpenseWorkflow, HistoryAction, NewExpense, RequestContext,
    StaticRateConverter, UserId,
};
use reimburse_db::{
    connect_with_settings, migrations, DbPool, DemoSeedDataset, SqlApprovalRuleRepository,
    SqlCompanyRepository, SqlExpenseRepository, SqlUserRepository,
};

async fn seeded_pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("run migrations");
    DemoSeedDataset::load(&pool).await.expect("load seed");
    pool
}

fn workflow(pool: &DbPool, audit: InMemoryAuditSink) -> ExpenseWorkflow {
    ExpenseWorkflow::new(
        Arc::new(SqlUserRepository::new(pool.clone())),
        Arc::new(SqlCompanyRepository::new(pool.clone())),
        Arc::new(SqlApprovalRuleRepository::new(pool.clone())),
        Arc::new(SqlExpenseRepository::new(pool.clone())),
        Arc::new(StaticRateConverter::usd_fallback()),
        Arc::new(audit),
    )
}

fn ctx(actor: &str) -> RequestContext {
    RequestContext::new(UserId(actor.to_string()), format!("req-{actor}"))
}

#[tokio::test]
async fn manager_approval_finalizes_seeded_expense() {
    let pool = seeded_pool().await;
    let audit = InMemoryAuditSink::default();
    let workflow = workflow(&pool, audit.clone());
    let expense_id = ExpenseId("expense-1".to_string());

    let approved = workflow
        .decide(&ctx("user-2"), &expense_id, DecisionAction::Approved, Some("ok".to_string()))
        .await
        .expect("manager approves");

    assert_eq!(approved.status, ExpenseStatus::Approved);
    assert_eq!(approved.current_approver_id, None);
    assert_eq!(approved.version, 2);
    assert_eq!(approved.approval_history.len(), 2);
    assert_eq!(approved.approval_history[1].action, HistoryAction::Approved);
    assert!(audit.event_types().contains(&"expense.decision_applied".to_string()));

    let second = workflow
        .decide(&ctx("user-2"), &expense_id, DecisionAction::Rejected, None)
        .await
        .expect_err("already decided");
    assert!(matches!(second, ApplicationError::Domain(DomainError::StaleDecision { .. })));

    let pending = workflow
        .pending_for_approver(&UserId("user-2".to_string()))
        .await
        .expect("pending list");
    let ids: Vec<&str> = pending.iter().map(|expense| expense.id.0.as_str()).collect();
    assert_eq!(ids, vec!["expense-3"]);
}

#[tokio::test]
async fn submission_converts_and_routes_to_manager() {
    let pool = seeded_pool().await;
    let workflow = workflow(&pool, InMemoryAuditSink::default());

    let submitted = workflow
        .submit_expense(
            &ctx("user-3"),
            NewExpense {
                employee_id: UserId("user-3".to_string()),
                amount: Decimal::new(100, 0),
                currency: "eur".to_string(),
                category: ExpenseCategory::Accommodation,
                description: "Hotel night".to_string(),
                date: NaiveDate::from_ymd_opt(2026, 1, 20).expect("valid date"),
                receipt_url: None,
            },
        )
        .await
        .expect("submit");

    assert_eq!(submitted.currency, "EUR");
    assert_eq!(submitted.amount_in_company_currency, Decimal::new(11_765, 2));
    assert_eq!(submitted.current_approver_id, Some(UserId("user-2".to_string())));

    let reloaded = workflow
        .expenses_for_employee(&UserId("user-3".to_string()))
        .await
        .expect("employee expenses");
    assert_eq!(reloaded.len(), 3);
    assert!(reloaded.iter().any(|expense| expense.id == submitted.id));
}

#[tokio::test]
async fn company_summary_reflects_seeded_ledger() {
    let pool = seeded_pool().await;
    let workflow = workflow(&pool, InMemoryAuditSink::default());

    let summary = workflow
        .company_summary(&CompanyId("company-1".to_string()))
        .await
        .expect("summary");

    assert_eq!(summary.total, 4);
    assert_eq!(summary.pending, 2);
    assert_eq!(summary.approved, 1);
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.unrouted, 0);
    assert_eq!(summary.approved_amount, Decimal::new(9_250, 2));
    assert_eq!(summary.pending_amount, Decimal::new(135_050, 2));
}

#[tokio::test]
async fn admin_override_is_recorded_in_history() {
    let pool = seeded_pool().await;
    let workflow = workflow(&pool, InMemoryAuditSink::default());

    let overridden = workflow
        .override_status(
            &ctx("user-1"),
            &ExpenseId("expense-3".to_string()),
            ExpenseStatus::Approved,
            None,
        )
        .await
        .expect("override");

    let last = overridden.approval_history.last().expect("history entry");
    assert!(last.is_override);
    assert_eq!(last.comment.as_deref(), Some("Admin override: approved"));
    assert_eq!(overridden.current_approver_id, None);

    let refused = workflow
        .override_status(
            &ctx("user-2"),
            &ExpenseId("expense-1".to_string()),
            ExpenseStatus::Rejected,
            None,
        )
        .await
        .expect_err("managers cannot override");
    assert!(matches!(refused, ApplicationError::Domain(DomainError::NotAuthorized { .. })));
}
