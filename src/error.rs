// Error taxonomy shared by all engine jobs
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::warn;

/// Input format or threshold violation. Never recovered; the message names
/// the offending column/value and the limit vs observed ratio.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Failed {check_name} threshold check, limit is: {threshold:.2} and imported data has: {observed:.2}")]
    ThresholdExceeded {
        check_name: String,
        threshold: f64,
        observed: f64,
        metric_key: String,
    },
    #[error("{0}")]
    FilenameCheck(String),
    #[error("Invalid {column} value '{value}' on line {line}")]
    MalformedField {
        column: &'static str,
        value: String,
        line: u64,
    },
    #[error("{0}")]
    PrevalidationCheck(String),
}

/// Database schema mismatch, missing partition or role deficiency. Fatal;
/// the operator must run the corresponding admin subcommand.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("schema metadata missing or corrupt: {0}. Run 'db install' first")]
    NotInstalled(String),
    #[error("schema version {found} does not match required version {required}. Run 'db upgrade'")]
    VersionMismatch { found: u32, required: u32 },
    #[error("partition {0} does not exist")]
    MissingPartition(String),
    #[error("partition {0} already exists")]
    PartitionCollision(String),
    #[error("role {role} may not write to {table_family}")]
    RoleViolation {
        role: &'static str,
        table_family: &'static str,
    },
}

/// Invalid or conflicting configuration, detected at parse time.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct ConfigError(pub String);

/// Unique-constraint violation during a merge. Retried once after
/// re-reading the conflicting row, then surfaced.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("conflict on {table} key {key}")]
pub struct ConflictError {
    pub table: String,
    pub key: String,
}

/// Connection loss or timeout. Workers retry these with exponential
/// backoff up to a bounded number of attempts.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("transient storage failure: {0}")]
pub struct TransientError(pub String);

/// Maximum retry attempts for transient failures within one job.
pub const MAX_TRANSIENT_RETRIES: u32 = 5;

/// Run an operation, retrying only `TransientError` with exponential
/// backoff plus jitter. All other errors propagate immediately.
pub fn retry_transient<T, F>(what: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> anyhow::Result<T>,
{
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(err) => {
                let transient = err.downcast_ref::<TransientError>().is_some();
                if !transient || attempt >= MAX_TRANSIENT_RETRIES {
                    return Err(err);
                }
                let base_ms = 100u64 << attempt;
                let jitter_ms = rand::thread_rng().gen_range(0..base_ms / 2 + 1);
                let delay = Duration::from_millis(base_ms + jitter_ms);
                warn!(
                    "{}: transient failure ({}), retrying in {:?} [attempt {} of {}]",
                    what,
                    err,
                    delay,
                    attempt + 1,
                    MAX_TRANSIENT_RETRIES
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}
