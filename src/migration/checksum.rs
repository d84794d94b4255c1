//! Checksum calculation for changesets

use crate::migration::{ChangeEntry, ChangeKey, MigrationError};
use sha2::{Digest, Sha256};

/// Options affecting what the checksum covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChecksumOptions {
    /// Collapse whitespace runs to one space and trim the body before hashing
    pub normalize_whitespace: bool,
}

/// Calculate the SHA-256 checksum of a changeset
///
/// The digest covers the id, the author and the forward body. It is used to
/// detect changesets edited after being applied.
///
/// # Returns
///
/// The 64-character lowercase hexadecimal hash
#[must_use]
pub fn compute_checksum(entry: &ChangeEntry, options: ChecksumOptions) -> String {
    let body = if options.normalize_whitespace {
        normalize(entry.forward_body())
    } else {
        entry.forward_body().to_string()
    };

    let mut hasher = Sha256::new();
    hasher.update(entry.id().as_bytes());
    hasher.update([0u8]);
    hasher.update(entry.author().as_bytes());
    hasher.update([0u8]);
    hasher.update(body.as_bytes());
    let hash = hasher.finalize();

    format!("{:x}", hash)
}

fn normalize(body: &str) -> String {
    body.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Validate checksum against stored value
///
/// # Errors
///
/// Returns `MigrationError::ChecksumMismatch` if the checksums differ.
pub fn validate_checksum(
    key: &ChangeKey,
    stored: &str,
    current: &str,
) -> Result<(), MigrationError> {
    if stored == current {
        Ok(())
    } else {
        Err(MigrationError::ChecksumMismatch {
            key: key.clone(),
            stored: stored.to_string(),
            current: current.to_string(),
        })
    }
}
