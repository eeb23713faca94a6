use std::sync::Arc;

use reimburse_core::audit::TracingAuditSink;
use reimburse_core::config::{AppConfig, ConfigError, CurrencyProvider};
use reimburse_core::{CurrencyConverter, ExpenseWorkflow, StaticRateConverter};
use reimburse_db::{
    connect_with_settings, migrations, DbPool, SqlApprovalRuleRepository, SqlCompanyRepository,
    SqlExpenseRepository, SqlUserRepository,
};
use thiserror::Error;
use tracing::info;

use crate::currency::HttpRateConverter;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub workflow: ExpenseWorkflow,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("currency client could not be built: {0}")]
    CurrencyClient(#[source] reqwest::Error),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let converter = currency_converter(&config)?;
    let workflow = ExpenseWorkflow::new(
        Arc::new(SqlUserRepository::new(db_pool.clone())),
        Arc::new(SqlCompanyRepository::new(db_pool.clone())),
        Arc::new(SqlApprovalRuleRepository::new(db_pool.clone())),
        Arc::new(SqlExpenseRepository::new(db_pool.clone())),
        converter,
        Arc::new(TracingAuditSink),
    );

    Ok(Application { config, db_pool, workflow })
}

fn currency_converter(config: &AppConfig) -> Result<Arc<dyn CurrencyConverter>, BootstrapError> {
    let converter: Arc<dyn CurrencyConverter> = match config.currency.provider {
        CurrencyProvider::Static => Arc::new(StaticRateConverter::usd_fallback()),
        CurrencyProvider::Http => Arc::new(
            HttpRateConverter::from_config(&config.currency)
                .map_err(BootstrapError::CurrencyClient)?,
        ),
    };
    info!(
        event_name = "system.bootstrap.currency_provider",
        correlation_id = "bootstrap",
        provider = ?config.currency.provider,
        "currency converter selected"
    );
    Ok(converter)
}

#[cfg(test)]
mod tests {
    use reimburse_core::config::{AppConfig, ConfigOverrides, LoadOptions};

    use crate::bootstrap::{bootstrap_with_config, Application, BootstrapError};

    async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
        bootstrap_with_config(AppConfig::load(options)?).await
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_invalid_database_url() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("postgres://localhost/reimburse".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("database.url"));
    }

    #[tokio::test]
    async fn bootstrap_migrates_and_exposes_expense_tables() {
        let app = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap should succeed against an in-memory database");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('companies', 'users', 'approval_rules', 'expenses', 'expense_history')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema query");
        assert_eq!(table_count, 5);

        let summary = app
            .workflow
            .company_summary(&reimburse_core::CompanyId("company-1".to_string()))
            .await
            .expect("empty summary");
        assert_eq!(summary.total, 0);
    }
}
