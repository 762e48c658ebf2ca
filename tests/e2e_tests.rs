//! End-to-end replay tests
//!
//! Each fixture under tests/fixtures/{name}/ holds:
//! - balances.csv - ledger seed
//! - transfers.csv - actions replayed through the payment service
//! - expected.csv - final balances
//!
//! Every fixture runs twice: once with transfers executed inline and once on
//! the worker pool.

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use rust_transfer_engine::replay::{run, ReplayOptions};
    use rust_transfer_engine::settings::Settings;
    use std::fs;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use tempfile::NamedTempFile;
    use tokio_util::sync::CancellationToken;

    fn settings(async_operations: bool) -> Settings {
        let mut settings = Settings::default();
        settings.engine.async_operations = async_operations;
        settings.cooldown.enabled = false;
        settings.logging.console = false;
        settings
    }

    async fn run_fixture(fixture_name: &str, async_operations: bool) {
        let fixture_dir = PathBuf::from(format!("tests/fixtures/{}", fixture_name));
        let expected_path = fixture_dir.join("expected.csv");
        assert!(
            expected_path.exists(),
            "Expected file not found: {}",
            expected_path.display()
        );

        let options = ReplayOptions {
            transfers: fixture_dir.join("transfers.csv"),
            balances: Some(fixture_dir.join("balances.csv")),
            history: None,
        };
        let mut temp_output = NamedTempFile::new().expect("Failed to create temp file");

        run(
            settings(async_operations),
            &options,
            &mut temp_output,
            CancellationToken::new(),
        )
        .await
        .unwrap_or_else(|e| panic!("Replay failed: {}", e));
        temp_output.flush().expect("Failed to flush temp file");

        let actual_output = fs::read_to_string(temp_output.path()).unwrap();
        let expected_output = fs::read_to_string(&expected_path).unwrap();

        assert_eq!(
            actual_output, expected_output,
            "\n\nOutput mismatch for fixture: {} (pooled: {})\n\nActual output:\n{}\n\nExpected output:\n{}\n",
            fixture_name, async_operations, actual_output, expected_output
        );
    }

    #[rstest]
    #[case("happy_path")]
    #[case("confirmation_flow")]
    #[case("rejected_rows")]
    #[case("pay_all")]
    #[tokio::test]
    async fn test_fixtures(#[case] fixture: &str, #[values(false, true)] pooled: bool) {
        run_fixture(fixture, pooled).await;
    }

    #[tokio::test]
    async fn test_rejected_rows_summary() {
        let dir = Path::new("tests/fixtures/rejected_rows");
        let options = ReplayOptions {
            transfers: dir.join("transfers.csv"),
            balances: Some(dir.join("balances.csv")),
            history: None,
        };

        let summary = run(settings(true), &options, &mut Vec::<u8>::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.rejected, 5);
        assert_eq!(summary.invalid_rows, 2);
    }

    #[tokio::test]
    async fn test_history_file_holds_every_completed_transfer() {
        let dir = Path::new("tests/fixtures/happy_path");
        let history = NamedTempFile::new().unwrap();
        let options = ReplayOptions {
            transfers: dir.join("transfers.csv"),
            balances: Some(dir.join("balances.csv")),
            history: Some(history.path().to_path_buf()),
        };

        run(settings(true), &options, &mut Vec::<u8>::new(), CancellationToken::new())
            .await
            .unwrap();

        let text = fs::read_to_string(history.path()).unwrap();
        let rows: Vec<&str> = text.lines().skip(1).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.iter().filter(|row| row.contains(",system,")).count(), 1);
    }

    #[tokio::test]
    async fn test_missing_transfer_file_is_fatal() {
        let options = ReplayOptions {
            transfers: PathBuf::from("tests/fixtures/does_not_exist.csv"),
            ..ReplayOptions::default()
        };

        let result = run(settings(true), &options, &mut Vec::<u8>::new(), CancellationToken::new()).await;

        assert!(result.unwrap_err().to_string().contains("Failed to open file"));
    }
}
