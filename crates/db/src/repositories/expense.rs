use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use reimburse_core::domain::expense::{
    ApprovalHistoryEntry, Expense, ExpenseCategory, ExpenseId, ExpensePatch, ExpenseStatus,
    HistoryAction,
};
use reimburse_core::domain::user::UserId;
use reimburse_core::ledger;

use super::{
    backend, decode_column, format_timestamp, is_unique_violation, parse_date, parse_decimal,
    parse_timestamp, parse_u32, ExpenseRepository, RepositoryError,
};
use crate::DbPool;

const EXPENSE_COLUMNS: &str = "id, employee_id, employee_name, amount, currency, \
                               amount_in_company_currency, category, description, expense_date, \
                               receipt_url, status, current_approver_id, version, created_at";

/// Expense rows plus their append-only history in `expense_history`.
///
/// Writes are guarded by the stored `version`: a replace only lands when the caller saw the
/// latest record, so concurrent decisions on one expense serialize.
pub struct SqlExpenseRepository {
    pool: DbPool,
}

impl SqlExpenseRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn list_where(
        &self,
        predicate: &str,
        binds: &[&str],
    ) -> Result<Vec<Expense>, RepositoryError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        let sql = format!(
            "SELECT {EXPENSE_COLUMNS} FROM expenses WHERE {predicate} ORDER BY created_at, id"
        );

        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&mut *conn).await.map_err(backend)?;

        let mut expenses = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut expense = expense_from_row(row)?;
            expense.approval_history = load_history(&mut conn, &expense.id).await?;
            expenses.push(expense);
        }
        Ok(expenses)
    }
}

#[async_trait]
impl ExpenseRepository for SqlExpenseRepository {
    async fn find_by_id(&self, id: &ExpenseId) -> Result<Option<Expense>, RepositoryError> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        load_expense(&mut conn, id).await
    }

    async fn insert(&self, expense: Expense) -> Result<(), RepositoryError> {
        ledger::verify(&expense).map_err(RepositoryError::Invariant)?;

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let now = format_timestamp(&Utc::now());

        let inserted = sqlx::query(
            "INSERT INTO expenses
                (id, employee_id, employee_name, amount, currency, amount_in_company_currency,
                 category, description, expense_date, receipt_url, status, current_approver_id,
                 version, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&expense.id.0)
        .bind(&expense.employee_id.0)
        .bind(&expense.employee_name)
        .bind(expense.amount.to_string())
        .bind(&expense.currency)
        .bind(expense.amount_in_company_currency.to_string())
        .bind(expense.category.as_str())
        .bind(&expense.description)
        .bind(expense.date.format("%Y-%m-%d").to_string())
        .bind(expense.receipt_url.as_deref())
        .bind(expense.status.as_str())
        .bind(expense.current_approver_id.as_ref().map(|id| id.0.as_str()))
        .bind(i64::from(expense.version))
        .bind(format_timestamp(&expense.created_at))
        .bind(&now)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(error) if is_unique_violation(&error) => {
                return Err(RepositoryError::Duplicate { entity: "expense", id: expense.id.0 });
            }
            Err(error) => return Err(backend(error)),
        }

        insert_history(&mut tx, &expense.id, &expense.approval_history, 0).await?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn replace(&self, expense: Expense) -> Result<Expense, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let stored = load_expense(&mut tx, &expense.id).await?.ok_or_else(|| {
            RepositoryError::NotFound { entity: "expense", id: expense.id.0.clone() }
        })?;
        ledger::check_replacement(&stored, &expense)?;

        let updated = sqlx::query(
            "UPDATE expenses
             SET employee_name = ?, description = ?, expense_date = ?, receipt_url = ?,
                 status = ?, current_approver_id = ?, version = version + 1, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(&expense.employee_name)
        .bind(&expense.description)
        .bind(expense.date.format("%Y-%m-%d").to_string())
        .bind(expense.receipt_url.as_deref())
        .bind(expense.status.as_str())
        .bind(expense.current_approver_id.as_ref().map(|id| id.0.as_str()))
        .bind(format_timestamp(&Utc::now()))
        .bind(&expense.id.0)
        .bind(i64::from(expense.version))
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        ensure_versioned_write(updated.rows_affected(), &expense.id, expense.version, stored.version)?;

        let appended = &expense.approval_history[stored.approval_history.len()..];
        insert_history(&mut tx, &expense.id, appended, stored.approval_history.len()).await?;
        tx.commit().await.map_err(backend)?;

        let mut saved = expense;
        saved.version += 1;
        Ok(saved)
    }

    async fn patch(
        &self,
        id: &ExpenseId,
        patch: &ExpensePatch,
    ) -> Result<Expense, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let mut expense = load_expense(&mut tx, id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound { entity: "expense", id: id.0.clone() })?;
        patch.apply_to(&mut expense).map_err(RepositoryError::Invariant)?;

        let loaded_version = expense.version;
        let updated = sqlx::query(
            "UPDATE expenses
             SET description = ?, expense_date = ?, receipt_url = ?,
                 version = version + 1, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(&expense.description)
        .bind(expense.date.format("%Y-%m-%d").to_string())
        .bind(expense.receipt_url.as_deref())
        .bind(format_timestamp(&Utc::now()))
        .bind(&id.0)
        .bind(i64::from(loaded_version))
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if updated.rows_affected() == 0 {
            let found = current_version(&mut tx, id).await?;
            ensure_versioned_write(0, id, loaded_version, found)?;
        }

        tx.commit().await.map_err(backend)?;
        expense.version += 1;
        Ok(expense)
    }

    async fn delete(&self, id: &ExpenseId) -> Result<bool, RepositoryError> {
        let deleted = sqlx::query("DELETE FROM expenses WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(deleted.rows_affected() > 0)
    }

    async fn list_by_employee(&self, employee_id: &UserId) -> Result<Vec<Expense>, RepositoryError> {
        self.list_where("employee_id = ?", &[employee_id.0.as_str()]).await
    }

    async fn list_by_employees(
        &self,
        employee_ids: &[UserId],
    ) -> Result<Vec<Expense>, RepositoryError> {
        if employee_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; employee_ids.len()].join(", ");
        let binds: Vec<&str> = employee_ids.iter().map(|id| id.0.as_str()).collect();
        self.list_where(&format!("employee_id IN ({placeholders})"), &binds).await
    }

    async fn list_pending_for_approver(
        &self,
        approver_id: &UserId,
    ) -> Result<Vec<Expense>, RepositoryError> {
        self.list_where("status = 'pending' AND current_approver_id = ?", &[approver_id.0.as_str()])
            .await
    }
}

async fn load_expense(
    conn: &mut SqliteConnection,
    id: &ExpenseId,
) -> Result<Option<Expense>, RepositoryError> {
    let row = sqlx::query(&format!("SELECT {EXPENSE_COLUMNS} FROM expenses WHERE id = ?"))
        .bind(&id.0)
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?;

    let Some(row) = row else {
        return Ok(None);
    };

    let mut expense = expense_from_row(&row)?;
    expense.approval_history = load_history(conn, &expense.id).await?;
    Ok(Some(expense))
}

/// A guarded `UPDATE ... WHERE version = ?` that touched no row lost a race.
fn ensure_versioned_write(
    rows_affected: u64,
    id: &ExpenseId,
    expected: u32,
    found: u32,
) -> Result<(), RepositoryError> {
    if rows_affected == 0 {
        return Err(RepositoryError::VersionConflict { id: id.0.clone(), expected, found });
    }
    Ok(())
}

async fn current_version(conn: &mut SqliteConnection, id: &ExpenseId) -> Result<u32, RepositoryError> {
    let row = sqlx::query("SELECT version FROM expenses WHERE id = ?")
        .bind(&id.0)
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?
        .ok_or_else(|| RepositoryError::NotFound { entity: "expense", id: id.0.clone() })?;
    parse_u32("version", row.try_get("version").map_err(decode_column)?)
}

async fn load_history(
    conn: &mut SqliteConnection,
    expense_id: &ExpenseId,
) -> Result<Vec<ApprovalHistoryEntry>, RepositoryError> {
    let rows = sqlx::query(
        "SELECT approver_id, approver_name, action, comment, is_override, occurred_at
         FROM expense_history
         WHERE expense_id = ?
         ORDER BY seq",
    )
    .bind(&expense_id.0)
    .fetch_all(&mut *conn)
    .await
    .map_err(backend)?;

    rows.iter().map(history_from_row).collect()
}

async fn insert_history(
    conn: &mut SqliteConnection,
    expense_id: &ExpenseId,
    entries: &[ApprovalHistoryEntry],
    first_seq: usize,
) -> Result<(), RepositoryError> {
    for (offset, entry) in entries.iter().enumerate() {
        let seq = i64::try_from(first_seq + offset).map_err(|_| {
            RepositoryError::Decode(format!("history sequence overflow for `{expense_id}`"))
        })?;

        sqlx::query(
            "INSERT INTO expense_history
                (expense_id, seq, approver_id, approver_name, action, comment, is_override,
                 occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&expense_id.0)
        .bind(seq)
        .bind(&entry.approver_id.0)
        .bind(&entry.approver_name)
        .bind(entry.action.as_str())
        .bind(entry.comment.as_deref())
        .bind(entry.is_override)
        .bind(format_timestamp(&entry.timestamp))
        .execute(&mut *conn)
        .await
        .map_err(backend)?;
    }
    Ok(())
}

fn expense_from_row(row: &SqliteRow) -> Result<Expense, RepositoryError> {
    let category_raw: String = row.try_get("category").map_err(decode_column)?;
    let category = ExpenseCategory::parse(&category_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown category `{category_raw}`")))?;

    let status_raw: String = row.try_get("status").map_err(decode_column)?;
    let status = ExpenseStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown expense status `{status_raw}`")))?;

    Ok(Expense {
        id: ExpenseId(row.try_get("id").map_err(decode_column)?),
        employee_id: UserId(row.try_get("employee_id").map_err(decode_column)?),
        employee_name: row.try_get("employee_name").map_err(decode_column)?,
        amount: parse_decimal("amount", row.try_get("amount").map_err(decode_column)?)?,
        currency: row.try_get("currency").map_err(decode_column)?,
        amount_in_company_currency: parse_decimal(
            "amount_in_company_currency",
            row.try_get("amount_in_company_currency").map_err(decode_column)?,
        )?,
        category,
        description: row.try_get("description").map_err(decode_column)?,
        date: parse_date("expense_date", row.try_get("expense_date").map_err(decode_column)?)?,
        receipt_url: row.try_get("receipt_url").map_err(decode_column)?,
        status,
        current_approver_id: row
            .try_get::<Option<String>, _>("current_approver_id")
            .map_err(decode_column)?
            .map(UserId),
        approval_history: Vec::new(),
        created_at: parse_timestamp("created_at", row.try_get("created_at").map_err(decode_column)?)?,
        version: parse_u32("version", row.try_get("version").map_err(decode_column)?)?,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<ApprovalHistoryEntry, RepositoryError> {
    let action_raw: String = row.try_get("action").map_err(decode_column)?;
    let action = HistoryAction::parse(&action_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown history action `{action_raw}`")))?;

    Ok(ApprovalHistoryEntry {
        approver_id: UserId(row.try_get("approver_id").map_err(decode_column)?),
        approver_name: row.try_get("approver_name").map_err(decode_column)?,
        action,
        comment: row.try_get("comment").map_err(decode_column)?,
        timestamp: parse_timestamp("occurred_at", row.try_get("occurred_at").map_err(decode_column)?)?,
        is_override: row.try_get("is_override").map_err(decode_column)?,
    })
}
