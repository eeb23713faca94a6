use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row};

use reimburse_core::domain::user::{Company, CompanyId};

use super::{backend, decode_column, format_timestamp, parse_timestamp, CompanyRepository, RepositoryError};
use crate::DbPool;

pub struct SqlCompanyRepository {
    pool: DbPool,
}

impl SqlCompanyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CompanyRepository for SqlCompanyRepository {
    async fn find_by_id(&self, id: &CompanyId) -> Result<Option<Company>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, name, currency, country_code, created_at FROM companies WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(company_from_row).transpose()
    }

    async fn save(&self, company: Company) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO companies (id, name, currency, country_code, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                currency = excluded.currency,
                country_code = excluded.country_code",
        )
        .bind(&company.id.0)
        .bind(&company.name)
        .bind(&company.currency)
        .bind(&company.country_code)
        .bind(format_timestamp(&company.created_at))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }
}

fn company_from_row(row: &SqliteRow) -> Result<Company, RepositoryError> {
    Ok(Company {
        id: CompanyId(row.try_get("id").map_err(decode_column)?),
        name: row.try_get("name").map_err(decode_column)?,
        currency: row.try_get("currency").map_err(decode_column)?,
        country_code: row.try_get("country_code").map_err(decode_column)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at").map_err(decode_column)?)?,
    })
}
