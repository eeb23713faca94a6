use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row};

use reimburse_core::domain::user::{CompanyId, User, UserId, UserRole};

use super::{backend, decode_column, format_timestamp, parse_timestamp, RepositoryError, UserRepository};
use crate::DbPool;

const USER_COLUMNS: &str = "id, email, name, role, company_id, manager_id, created_at";

pub struct SqlUserRepository {
    pool: DbPool,
}

impl SqlUserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for SqlUserRepository {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn list_by_company(&self, company_id: &CompanyId) -> Result<Vec<User>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE company_id = ? ORDER BY id"
        ))
        .bind(&company_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(user_from_row).collect()
    }

    async fn list_by_manager(&self, manager_id: &UserId) -> Result<Vec<User>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE manager_id = ? ORDER BY id"
        ))
        .bind(&manager_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(user_from_row).collect()
    }

    async fn save(&self, user: User) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO users (id, email, name, role, company_id, manager_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                name = excluded.name,
                role = excluded.role,
                company_id = excluded.company_id,
                manager_id = excluded.manager_id",
        )
        .bind(&user.id.0)
        .bind(&user.email)
        .bind(&user.name)
        .bind(user.role.as_str())
        .bind(&user.company_id.0)
        .bind(user.manager_id.as_ref().map(|id| id.0.as_str()))
        .bind(format_timestamp(&user.created_at))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn delete(&self, id: &UserId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(result.rows_affected() > 0)
    }
}

fn user_from_row(row: &SqliteRow) -> Result<User, RepositoryError> {
    let role_raw: String = row.try_get("role").map_err(decode_column)?;
    let role = UserRole::parse(&role_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown user role `{role_raw}`")))?;

    Ok(User {
        id: UserId(row.try_get("id").map_err(decode_column)?),
        email: row.try_get("email").map_err(decode_column)?,
        name: row.try_get("name").map_err(decode_column)?,
        role,
        company_id: CompanyId(row.try_get("company_id").map_err(decode_column)?),
        manager_id: row
            .try_get::<Option<String>, _>("manager_id")
            .map_err(decode_column)?
            .map(UserId),
        created_at: parse_timestamp("created_at", row.try_get("created_at").map_err(decode_column)?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use reimburse_core::domain::user::{Company, CompanyId, User, UserId, UserRole};

    use super::SqlUserRepository;
    use crate::repositories::{CompanyRepository, SqlCompanyRepository, UserRepository};
    use crate::{connect_with_settings, migrations};

    fn user(id: &str, role: UserRole, manager: Option<&str>) -> User {
        User {
            id: UserId(id.to_string()),
            email: format!("{id}@acme.test"),
            name: format!("Person {id}"),
            role,
            company_id: CompanyId("company-1".to_string()),
            manager_id: manager.map(|id| UserId(id.to_string())),
            created_at: Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).single().expect("timestamp"),
        }
    }

    async fn repo() -> SqlUserRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlCompanyRepository::new(pool.clone())
            .save(Company {
                id: CompanyId("company-1".to_string()),
                name: "Acme".to_string(),
                currency: "USD".to_string(),
                country_code: "US".to_string(),
                created_at: Utc::now(),
            })
            .await
            .expect("save company");
        SqlUserRepository::new(pool)
    }

    #[tokio::test]
    async fn save_upserts_and_delete_reports_whether_a_row_went() {
        let repo = repo().await;
        repo.save(user("user-2", UserRole::Manager, None)).await.expect("manager");
        repo.save(user("user-3", UserRole::Employee, Some("user-2"))).await.expect("employee");

        let mut promoted = user("user-3", UserRole::Manager, None);
        promoted.name = "Mike Lead".to_string();
        repo.save(promoted.clone()).await.expect("upsert");
        let loaded = repo.find_by_id(&promoted.id).await.expect("find").expect("row");
        assert_eq!(loaded, promoted);
        assert!(repo.list_by_manager(&UserId("user-2".to_string())).await.expect("reports").is_empty());

        assert!(repo.delete(&UserId("user-2".to_string())).await.expect("delete"));
        assert!(!repo.delete(&UserId("user-2".to_string())).await.expect("delete again"));
        let remaining = repo.list_by_company(&CompanyId("company-1".to_string())).await.expect("list");
        assert_eq!(remaining.len(), 1);
    }
}
