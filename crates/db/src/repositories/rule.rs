use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::{sqlite::SqliteRow, Row};

use reimburse_core::domain::rule::{ApprovalRule, RuleId};
use reimburse_core::domain::user::CompanyId;

use super::{
    backend, decode_column, format_timestamp, is_unique_violation, parse_timestamp,
    ApprovalRuleRepository, RepositoryError,
};
use crate::DbPool;

const RULE_COLUMNS: &str = "id, company_id, name, conditions_json, is_manager_approver, \
                            approvers_json, levels_json, created_at";

/// Rules are evaluated in `position` order; inserts append and updates keep the slot.
pub struct SqlApprovalRuleRepository {
    pool: DbPool,
}

impl SqlApprovalRuleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApprovalRuleRepository for SqlApprovalRuleRepository {
    async fn list_by_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RULE_COLUMNS} FROM approval_rules WHERE company_id = ? ORDER BY position, id"
        ))
        .bind(&company_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(rule_from_row).collect()
    }

    async fn find_by_id(&self, id: &RuleId) -> Result<Option<ApprovalRule>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RULE_COLUMNS} FROM approval_rules WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.as_ref().map(rule_from_row).transpose()
    }

    async fn insert(&self, rule: ApprovalRule) -> Result<(), RepositoryError> {
        let encoded = EncodedRule::new(&rule)?;

        let result = sqlx::query(
            "INSERT INTO approval_rules
                (id, company_id, position, name, conditions_json, is_manager_approver,
                 approvers_json, levels_json, created_at)
             VALUES (
                ?, ?,
                (SELECT IFNULL(MAX(position), 0) + 1 FROM approval_rules WHERE company_id = ?),
                ?, ?, ?, ?, ?, ?
             )",
        )
        .bind(&rule.id.0)
        .bind(&rule.company_id.0)
        .bind(&rule.company_id.0)
        .bind(&rule.name)
        .bind(&encoded.conditions)
        .bind(rule.is_manager_approver)
        .bind(&encoded.approvers)
        .bind(&encoded.levels)
        .bind(format_timestamp(&rule.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if is_unique_violation(&error) => {
                Err(RepositoryError::Duplicate { entity: "approval rule", id: rule.id.0 })
            }
            Err(error) => Err(backend(error)),
        }
    }

    async fn update(&self, rule: ApprovalRule) -> Result<(), RepositoryError> {
        let encoded = EncodedRule::new(&rule)?;

        let updated = sqlx::query(
            "UPDATE approval_rules
             SET name = ?, conditions_json = ?, is_manager_approver = ?,
                 approvers_json = ?, levels_json = ?
             WHERE id = ?",
        )
        .bind(&rule.name)
        .bind(&encoded.conditions)
        .bind(rule.is_manager_approver)
        .bind(&encoded.approvers)
        .bind(&encoded.levels)
        .bind(&rule.id.0)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::NotFound { entity: "approval rule", id: rule.id.0 });
        }
        Ok(())
    }

    async fn delete(&self, id: &RuleId) -> Result<bool, RepositoryError> {
        let deleted = sqlx::query("DELETE FROM approval_rules WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(deleted.rows_affected() > 0)
    }
}

struct EncodedRule {
    conditions: String,
    approvers: String,
    levels: String,
}

impl EncodedRule {
    fn new(rule: &ApprovalRule) -> Result<Self, RepositoryError> {
        let encode = |column: &str, value: Result<String, serde_json::Error>| {
            value.map_err(|error| {
                RepositoryError::Decode(format!("could not encode `{column}`: {error}"))
            })
        };

        Ok(Self {
            conditions: encode("conditions_json", serde_json::to_string(&rule.conditions))?,
            approvers: encode("approvers_json", serde_json::to_string(&rule.approvers))?,
            levels: encode("levels_json", serde_json::to_string(&rule.levels))?,
        })
    }
}

fn parse_json<T: DeserializeOwned>(column: &str, raw: String) -> Result<T, RepositoryError> {
    serde_json::from_str(&raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid JSON in `{column}`: {error}")))
}

fn rule_from_row(row: &SqliteRow) -> Result<ApprovalRule, RepositoryError> {
    Ok(ApprovalRule {
        id: RuleId(row.try_get("id").map_err(decode_column)?),
        company_id: CompanyId(row.try_get("company_id").map_err(decode_column)?),
        name: row.try_get("name").map_err(decode_column)?,
        conditions: parse_json(
            "conditions_json",
            row.try_get("conditions_json").map_err(decode_column)?,
        )?,
        is_manager_approver: row.try_get("is_manager_approver").map_err(decode_column)?,
        approvers: parse_json(
            "approvers_json",
            row.try_get("approvers_json").map_err(decode_column)?,
        )?,
        levels: parse_json("levels_json", row.try_get("levels_json").map_err(decode_column)?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at").map_err(decode_column)?)?,
    })
}
