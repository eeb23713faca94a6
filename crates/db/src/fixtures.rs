use sqlx::Executor;

use crate::connection::DbPool;
use crate::repositories::{backend, RepositoryError};

/// Expected state of each seeded expense after a load.
const SEED_EXPENSES: &[SeedExpenseContract] = &[
    SeedExpenseContract {
        expense_id: "expense-1",
        employee_id: "user-3",
        status: "pending",
        current_approver_id: Some("user-2"),
        history_len: 1,
        description: "Client dinner at Italian restaurant",
    },
    SeedExpenseContract {
        expense_id: "expense-2",
        employee_id: "user-3",
        status: "approved",
        current_approver_id: None,
        history_len: 2,
        description: "Taxi to airport",
    },
    SeedExpenseContract {
        expense_id: "expense-3",
        employee_id: "user-4",
        status: "pending",
        current_approver_id: Some("user-2"),
        history_len: 1,
        description: "Flight tickets for conference",
    },
    SeedExpenseContract {
        expense_id: "expense-4",
        employee_id: "user-4",
        status: "rejected",
        current_approver_id: None,
        history_len: 2,
        description: "Notebooks and pens",
    },
];

const SEED_COMPANY_ID: &str = "company-1";
const SEED_USER_IDS: &[&str] = &["user-1", "user-2", "user-3", "user-4"];
const SEED_RULE_IDS: &[&str] = &["rule-1"];

/// Demo company with one admin, one manager, two employees, a default rule and four
/// expenses covering every settled and open status.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_seed.sql");

    /// Loads the dataset. Existing rows with the same ids are left alone.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await.map_err(backend)?;
        tx.execute(sqlx::query(Self::SQL)).await.map_err(backend)?;
        tx.commit().await.map_err(backend)?;

        let expenses_seeded = SEED_EXPENSES
            .iter()
            .map(|expense| ExpenseSeedInfo {
                expense_id: expense.expense_id,
                status: expense.status,
                description: expense.description,
            })
            .collect::<Vec<_>>();

        Ok(SeedResult {
            company_id: SEED_COMPANY_ID,
            users_seeded: SEED_USER_IDS.len(),
            rules_seeded: SEED_RULE_IDS.len(),
            expenses_seeded,
        })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let company_exists: i64 =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM companies WHERE id = ?1)")
                .bind(SEED_COMPANY_ID)
                .fetch_one(pool)
                .await
                .map_err(backend)?;
        checks.push(("company", company_exists == 1));

        let user_count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM users WHERE id IN {}",
            sql_array_from_ids(SEED_USER_IDS)
        ))
        .fetch_one(pool)
        .await
        .map_err(backend)?;
        checks.push(("users", user_count == SEED_USER_IDS.len() as i64));

        let rule_count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM approval_rules WHERE id IN {}",
            sql_array_from_ids(SEED_RULE_IDS)
        ))
        .fetch_one(pool)
        .await
        .map_err(backend)?;
        checks.push(("rules", rule_count == SEED_RULE_IDS.len() as i64));

        for expense in SEED_EXPENSES {
            let state_ok: i64 = sqlx::query_scalar(
                "SELECT EXISTS(
                    SELECT 1 FROM expenses
                    WHERE id = ?1 AND employee_id = ?2 AND status = ?3
                      AND current_approver_id IS ?4
                 )",
            )
            .bind(expense.expense_id)
            .bind(expense.employee_id)
            .bind(expense.status)
            .bind(expense.current_approver_id)
            .fetch_one(pool)
            .await
            .map_err(backend)?;
            checks.push((expense.expense_id, state_ok == 1));

            let history_len: i64 =
                sqlx::query_scalar("SELECT COUNT(1) FROM expense_history WHERE expense_id = ?1")
                    .bind(expense.expense_id)
                    .fetch_one(pool)
                    .await
                    .map_err(backend)?;
            checks.push((expense.history_label(), history_len == expense.history_len));
        }

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }

    /// Removes the seeded company; users, rules, expenses and history cascade with it.
    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM companies WHERE id = ?1")
            .bind(SEED_COMPANY_ID)
            .execute(pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct SeedExpenseContract {
    expense_id: &'static str,
    employee_id: &'static str,
    status: &'static str,
    current_approver_id: Option<&'static str>,
    history_len: i64,
    description: &'static str,
}

impl SeedExpenseContract {
    fn history_label(&self) -> &'static str {
        match self.expense_id {
            "expense-1" => "expense-1-history",
            "expense-2" => "expense-2-history",
            "expense-3" => "expense-3-history",
            _ => "expense-4-history",
        }
    }
}

fn sql_array_from_ids(ids: &[&str]) -> String {
    let quoted = ids.iter().map(|id| format!("'{id}'")).collect::<Vec<_>>().join(",");
    format!("({quoted})")
}

#[derive(Debug)]
pub struct SeedResult {
    pub company_id: &'static str,
    pub users_seeded: usize,
    pub rules_seeded: usize,
    pub expenses_seeded: Vec<ExpenseSeedInfo>,
}

#[derive(Debug)]
pub struct ExpenseSeedInfo {
    pub expense_id: &'static str,
    pub status: &'static str,
    pub description: &'static str,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
