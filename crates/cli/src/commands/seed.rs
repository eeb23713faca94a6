use crate::commands::{load_config, open_pool, runtime, CommandResult, StepFailure};
use reimburse_db::{migrations, DemoSeedDataset, ExpenseSeedInfo};

pub fn run() -> CommandResult {
    let config = match load_config("seed") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("seed") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;

        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let seed_result = DemoSeedDataset::load(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;

        let verification = DemoSeedDataset::verify(&pool)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

        let run_result: Result<Vec<ExpenseSeedInfo>, StepFailure> = if verification.all_present
        {
            Ok(seed_result.expenses_seeded)
        } else {
            let failed_checks = failed_checks(&verification.checks);
            Err(("seed_verification", verification_message(&failed_checks), 6u8))
        };

        pool.close().await;
        run_result
    });

    match result {
        Ok(expenses) => {
            let lines: Vec<String> = expenses
                .iter()
                .map(|expense| {
                    format!("  - {} [{}]: {}", expense.expense_id, expense.status, expense.description)
                })
                .collect();
            let message = format!(
                "demo company seeded with {} expenses:\n{}",
                expenses.len(),
                lines.join("\n")
            );
            CommandResult::success("seed", message)
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

fn failed_checks(checks: &[(&'static str, bool)]) -> Vec<&'static str> {
    checks.iter().filter_map(|(check, passed)| (!passed).then_some(*check)).collect()
}

fn verification_message(failed_checks: &[&str]) -> String {
    if failed_checks.is_empty() {
        "Some seed data failed to load".to_string()
    } else {
        format!("Seed verification failed for checks: {}", failed_checks.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::{failed_checks, verification_message};

    #[test]
    fn verification_error_message_targets_failed_checks() {
        let checks = [("company", true), ("expense-2", false), ("expense-4-history", false)];

        let message = verification_message(&failed_checks(&checks));

        assert_eq!(message, "Seed verification failed for checks: expense-2, expense-4-history");
    }

    #[test]
    fn verification_error_message_falls_back_to_generic_when_no_labels() {
        let checks = [("company", true), ("users", true)];

        assert_eq!(
            verification_message(&failed_checks(&checks)),
            "Some seed data failed to load"
        );
    }
}
