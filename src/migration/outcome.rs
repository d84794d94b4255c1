//! Run states and run outcomes

use crate::migration::status::ChecksumDrift;
use crate::migration::{ChangeKey, MigrationError};
use std::fmt;

/// States a migration run passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Locking,
    Planning,
    Applying,
    Committing,
    RollingBack,
    Releasing,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "IDLE",
            RunState::Locking => "LOCKING",
            RunState::Planning => "PLANNING",
            RunState::Applying => "APPLYING",
            RunState::Committing => "COMMITTING",
            RunState::RollingBack => "ROLLING_BACK",
            RunState::Releasing => "RELEASING",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// A changeset whose preconditions asked for a skip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedChange {
    pub key: ChangeKey,
    pub reason: String,
    /// Whether a `MARK_RAN` record was written
    pub recorded: bool,
}

/// What a successful run did
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Executed in this run, in order
    pub applied: Vec<ChangeKey>,
    pub skipped: Vec<SkippedChange>,
    /// Reverted by an operator rollback, newest first
    pub rolled_back: Vec<ChangeKey>,
    /// Drift tolerated under the `WARN` policy
    pub checksum_warnings: Vec<ChecksumDrift>,
    pub trace: Vec<RunState>,
}

/// Why a run failed and how far rollback got
#[derive(Debug)]
pub struct RunFailure {
    /// The error that stopped the run
    pub error: MigrationError,
    pub failed_entry: Option<ChangeKey>,
    /// Entries of this run reverted, newest first
    pub rolled_back: Vec<ChangeKey>,
    /// `false` if rollback stopped early for any reason
    pub rollback_succeeded: bool,
    /// Rollback reached an entry without a rollback body
    pub irreversible: bool,
    /// `IrreversibleFailure` or the rollback statement error, when rollback stopped early
    pub rollback_error: Option<MigrationError>,
    pub trace: Vec<RunState>,
}

impl RunFailure {
    pub(crate) fn new(error: MigrationError, failed_entry: Option<ChangeKey>) -> Self {
        Self {
            error,
            failed_entry,
            rolled_back: Vec::new(),
            rollback_succeeded: true,
            irreversible: false,
            rollback_error: None,
            trace: Vec::new(),
        }
    }

    /// The most severe error: an irreversible rollback outranks the cause
    #[must_use]
    pub fn into_error(self) -> MigrationError {
        match self.rollback_error {
            Some(error) if self.irreversible => error,
            _ => self.error,
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if !self.rolled_back.is_empty() {
            write!(f, "; rolled back {} changeset(s)", self.rolled_back.len())?;
        }
        if let Some(error) = &self.rollback_error {
            write!(f, "; rollback stopped: {error}")?;
        }
        Ok(())
    }
}

/// Terminal result of a run
#[derive(Debug)]
pub enum RunOutcome {
    Done(RunReport),
    Failed(RunFailure),
}

impl RunOutcome {
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, RunOutcome::Done(_))
    }

    /// States visited, ending in `Done` or `Failed`
    #[must_use]
    pub fn trace(&self) -> &[RunState] {
        match self {
            RunOutcome::Done(report) => &report.trace,
            RunOutcome::Failed(failure) => &failure.trace,
        }
    }

    /// # Errors
    ///
    /// Returns the most severe error of a failed run (see [`RunFailure::into_error`]).
    pub fn into_result(self) -> Result<RunReport, MigrationError> {
        match self {
            RunOutcome::Done(report) => Ok(report),
            RunOutcome::Failed(failure) => Err(failure.into_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irreversible_outranks_cause() {
        let mut failure = RunFailure::new(
            MigrationError::PreconditionHalt {
                key: ChangeKey::new("b", "x"),
                reason: "no".to_string(),
            },
            Some(ChangeKey::new("b", "x")),
        );
        failure.irreversible = true;
        failure.rollback_succeeded = false;
        failure.rollback_error = Some(MigrationError::IrreversibleFailure {
            key: ChangeKey::new("a", "x"),
        });
        assert!(failure.to_string().contains("rollback stopped"));
        let error = RunOutcome::Failed(failure).into_result().unwrap_err();
        assert_eq!(error.kind(), "IrreversibleFailure");
    }

    #[test]
    fn test_rollback_error_does_not_replace_cause() {
        let cause = MigrationError::LockTimeout("1 seconds".to_string());
        let mut failure = RunFailure::new(cause, None);
        failure.rollback_succeeded = false;
        failure.rollback_error = Some(MigrationError::ExecutionFailed {
            key: ChangeKey::new("a", "x"),
            error: "boom".to_string(),
        });
        assert_eq!(failure.into_error().kind(), "LockTimeout");
    }

    #[test]
    fn test_state_names() {
        assert_eq!(RunState::RollingBack.to_string(), "ROLLING_BACK");
        let outcome = RunOutcome::Done(RunReport {
            trace: vec![RunState::Idle, RunState::Done],
            ..RunReport::default()
        });
        assert!(outcome.is_done());
        assert_eq!(outcome.trace().last(), Some(&RunState::Done));
    }
}
