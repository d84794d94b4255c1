//! changeguard migration CLI
//!
//! Command-line interface for applying, rolling back and inspecting
//! changelog-driven migrations. Usable by hand and from CI/CD pipelines:
//! the process exit code is 0 on success, 1 when a run failed (after any
//! rollback) and 2 when rollback reached an irreversible changeset.

pub mod cli;
pub mod commands;

pub use cli::{Cli, Commands};
pub use commands::{resolve_config, run, Exit};
