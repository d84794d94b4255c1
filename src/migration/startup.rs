//! In-process migration execution helpers

use crate::config::MigrationConfig;
use crate::executor::MigrationExecutor;
use crate::migration::outcome::RunReport;
use crate::migration::{parse_file, MigrationError, Migrator};

/// Run migrations on application startup
///
/// Reads the changelog named by `config`, applies pending changesets under the
/// migration lock and returns the report. The executor is owned for the
/// duration of the run and dropped on every exit path, so the connection is
/// closed before the application continues.
///
/// In multi-instance deployments the first process to start takes the lock and
/// migrates; the others wait (up to `lock_timeout_seconds`) and then find
/// nothing pending.
///
/// # Errors
///
/// Returns the changelog or configuration error, or the most severe error of
/// a failed run. The application should not start in that case.
///
/// # Example
///
/// ```rust,no_run
/// use changeguard::{connect, migration::startup_migrations, MigrationConfig};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = MigrationConfig::load(None)?;
///     let executor = connect(&config.target_connection_string)?;
///
///     startup_migrations(executor, &config)?;
///
///     // Continue with application startup...
///     Ok(())
/// }
/// ```
pub fn startup_migrations(
    executor: Box<dyn MigrationExecutor>,
    config: &MigrationConfig,
) -> Result<RunReport, MigrationError> {
    config.validate()?;
    let changelog = parse_file(&config.changelog_path)?;
    let migrator = Migrator::new(changelog, config.settings());

    let report = migrator.migrate(executor.as_ref()).into_result()?;

    if report.applied.is_empty() {
        log::debug!("No pending changesets to apply");
    } else {
        log::info!("Applied {} changeset(s) on startup", report.applied.len());
    }
    Ok(report)
}
