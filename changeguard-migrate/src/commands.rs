//! Command handlers

use crate::cli::{Cli, Commands};
use anyhow::{bail, Context};
use changeguard::diff::diff_databases;
use changeguard::migration::{parse_file, LockManager, MigrationStatus, RunFailure, RunReport};
use changeguard::{connect, MigrationConfig, MigrationExecutor, Migrator, RunOutcome};
use colored::Colorize;

/// Process exit status of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Success,
    /// The run failed; any rollback completed
    Failed,
    /// The run failed and rollback reached an irreversible changeset
    Irreversible,
}

impl Exit {
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Exit::Success => 0,
            Exit::Failed => 1,
            Exit::Irreversible => 2,
        }
    }
}

/// Configuration file and environment, overridden by command-line flags
///
/// # Errors
///
/// Returns the configuration error if the file or environment is invalid.
pub fn resolve_config(cli: &Cli) -> anyhow::Result<MigrationConfig> {
    let mut config = MigrationConfig::load(cli.config.as_deref())?;

    if let Some(url) = &cli.target_url {
        config.target_connection_string = url.clone();
    } else if config.target_connection_string.is_empty() {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.target_connection_string = url;
        }
    }
    if let Some(url) = &cli.reference_url {
        config.reference_connection_string = Some(url.clone());
    }
    if let Some(path) = &cli.changelog {
        config.changelog_path = path.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Execute the parsed command line
///
/// # Errors
///
/// Returns configuration, connection and changelog errors, and errors of the
/// read-only commands. A failed migration or rollback run is not an error:
/// it is reported and mapped to [`Exit::Failed`] or [`Exit::Irreversible`].
pub fn run(cli: &Cli) -> anyhow::Result<Exit> {
    let config = resolve_config(cli)?;
    if config.target_connection_string.is_empty() {
        bail!(
            "Target database not provided. Use --target-url or set \
             CHANGEGUARD__MIGRATION__TARGET_CONNECTION_STRING or DATABASE_URL"
        );
    }

    let target = connect(&config.target_connection_string)
        .with_context(|| "failed to connect to the target database")?;
    let target = target.as_ref();

    match &cli.command {
        Commands::Migrate { dry_run: true } => handle_dry_run(&migrator(&config)?, target),
        Commands::Migrate { dry_run: false } => {
            println!("Applying changesets...");
            Ok(report_outcome(migrator(&config)?.migrate(target)))
        }
        Commands::Rollback { count } => {
            println!("Rolling back {count} changeset(s)...");
            Ok(report_outcome(migrator(&config)?.rollback_last(target, *count)))
        }
        Commands::Status => handle_status(&migrator(&config)?, target),
        Commands::Validate => handle_validate(&migrator(&config)?, target),
        Commands::ReleaseLocks => handle_release_locks(&config, target),
        Commands::Diff => handle_diff(&config, target),
    }
}

fn migrator(config: &MigrationConfig) -> anyhow::Result<Migrator> {
    let changelog = parse_file(&config.changelog_path)
        .with_context(|| format!("failed to read changelog {}", config.changelog_path.display()))?;
    Ok(Migrator::new(changelog, config.settings()))
}

fn report_outcome(outcome: RunOutcome) -> Exit {
    match outcome {
        RunOutcome::Done(report) => {
            print_report(&report);
            Exit::Success
        }
        RunOutcome::Failed(failure) => {
            print_failure(&failure);
            if failure.irreversible {
                Exit::Irreversible
            } else {
                Exit::Failed
            }
        }
    }
}

fn print_report(report: &RunReport) {
    for drift in &report.checksum_warnings {
        println!("{} {} changed since it was applied", "⚠".yellow(), drift.key);
    }
    for key in &report.applied {
        println!("  {} {key}", "✓".green());
    }
    for skipped in &report.skipped {
        let note = if skipped.recorded { "marked ran" } else { "skipped" };
        println!("  - {} ({note}: {})", skipped.key, skipped.reason);
    }
    for key in &report.rolled_back {
        println!("  ↩ {key}");
    }

    if !report.rolled_back.is_empty() {
        println!("✅ Rolled back {} changeset(s)", report.rolled_back.len());
    } else if report.applied.is_empty() {
        println!("✅ No changesets to apply");
    } else {
        println!("✅ Applied {} changeset(s)", report.applied.len());
    }
}

fn print_failure(failure: &RunFailure) {
    eprintln!("{} {}", "❌".red(), failure.error);
    if let Some(key) = &failure.failed_entry {
        eprintln!("   failed changeset: {key}");
    }
    for key in &failure.rolled_back {
        eprintln!("   ↩ rolled back {key}");
    }
    if let Some(error) = &failure.rollback_error {
        eprintln!("{} rollback stopped: {error}", "❌".red());
    }
    if failure.irreversible {
        let message = "The database was left partially migrated; manual intervention is required";
        eprintln!("{}", message.red().bold());
    }
}

fn handle_dry_run(migrator: &Migrator, executor: &dyn MigrationExecutor) -> anyhow::Result<Exit> {
    let status = migrator.status(executor)?;
    if status.pending.is_empty() {
        println!("No pending changesets to apply");
        return Ok(Exit::Success);
    }

    println!("Would apply {} changeset(s):", status.pending.len());
    for (i, pending) in status.pending.iter().enumerate() {
        println!("  {}. {}", i + 1, pending.key);
    }
    Ok(Exit::Success)
}

fn handle_status(migrator: &Migrator, executor: &dyn MigrationExecutor) -> anyhow::Result<Exit> {
    let status = migrator.status(executor)?;
    print_status(&status);
    Ok(Exit::Success)
}

fn print_status(status: &MigrationStatus) {
    println!("\n📊 Migration Status\n");

    if status.applied.is_empty() {
        println!("✅ Applied Changesets: None");
    } else {
        println!("✅ Applied Changesets ({}):", status.applied.len());
        for record in &status.applied {
            println!(
                "  {} {:>4}  {} ({}, {})",
                "✓".green(),
                record.execution_order,
                record.key,
                record.exec_type,
                record.applied_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    println!();

    if status.pending.is_empty() {
        println!("⏳ Pending Changesets: None");
    } else {
        println!("⏳ Pending Changesets ({}):", status.pending.len());
        for pending in &status.pending {
            println!("  ⏳ {} (pending)", pending.key);
        }
    }

    if !status.drifted.is_empty() {
        println!("\n{} Changed Since Applied ({}):", "⚠".yellow(), status.drifted.len());
        for drift in &status.drifted {
            println!(
                "  {} (stored {}, now {})",
                drift.key,
                short(&drift.stored),
                short(&drift.current)
            );
        }
    }

    if !status.unknown.is_empty() {
        println!("\n❓ Not In Changelog ({}):", status.unknown.len());
        for record in &status.unknown {
            println!("  {}", record.key);
        }
    }

    match &status.lock {
        Some(lock) => println!(
            "\n🔒 Locked by {} since {}",
            lock.locked_by,
            lock.locked_at.format("%Y-%m-%d %H:%M:%S")
        ),
        None => println!("\n🔓 Not locked"),
    }

    println!(
        "\n📈 Summary: {} applied, {} pending",
        status.applied.len(),
        status.pending.len()
    );
}

fn short(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}

fn handle_validate(migrator: &Migrator, executor: &dyn MigrationExecutor) -> anyhow::Result<Exit> {
    println!("Validating checksums...");
    let drifted = migrator.validate(executor)?;
    if drifted.is_empty() {
        println!("✅ All checksums valid");
        return Ok(Exit::Success);
    }

    for drift in &drifted {
        eprintln!(
            "{} {} changed since it was applied (stored {}, now {})",
            "❌".red(),
            drift.key,
            short(&drift.stored),
            short(&drift.current)
        );
    }
    Ok(Exit::Failed)
}

fn handle_release_locks(
    config: &MigrationConfig,
    executor: &dyn MigrationExecutor,
) -> anyhow::Result<Exit> {
    let locks = LockManager::new(executor, config.lock_table.clone());
    locks.ensure_table()?;

    if let Some(holder) = locks.current()? {
        log::warn!("Releasing migration lock held by {}", holder.locked_by);
    }
    if locks.force_release()? {
        println!("✅ Migration lock released");
    } else {
        println!("✅ No migration lock was held");
    }
    Ok(Exit::Success)
}

fn handle_diff(config: &MigrationConfig, target: &dyn MigrationExecutor) -> anyhow::Result<Exit> {
    let Some(reference_url) = &config.reference_connection_string else {
        bail!(
            "Reference database not provided. Use --reference-url or set \
             CHANGEGUARD__MIGRATION__REFERENCE_CONNECTION_STRING"
        );
    };
    let reference = connect(reference_url)
        .with_context(|| "failed to connect to the reference database")?;

    let exclude = [config.history_table.as_str(), config.lock_table.as_str()];
    let result = diff_databases(reference.as_ref(), target, &exclude)?;
    print!("{result}");
    Ok(Exit::Success)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(Exit::Success.code(), 0);
        assert_eq!(Exit::Failed.code(), 1);
        assert_eq!(Exit::Irreversible.code(), 2);
    }

    #[test]
    fn test_short_checksum() {
        assert_eq!(short("0123456789abcdef"), "0123456789ab");
        assert_eq!(short("abc"), "abc");
    }
}
