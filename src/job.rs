// Durable record of every job run: inputs, outputs, status, timing
use anyhow::Result;
use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableError};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::{put_value, str_table, Store, TableFamily};

pub const JOB_METADATA_TABLE: &str = "job_metadata";
const JOB_SEQ_TABLE: &str = "job_metadata_seq";
const JOB_SEQ_KEY: &str = "next_run_id";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub run_id: u64,
    pub command: String,
    pub subcommand: Option<String>,
    pub db_user: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub extra_metadata: serde_json::Value,
}

fn job_key(run_id: u64) -> String {
    format!("{:012}", run_id)
}

/// Tracks one job run from start to completion.
pub struct JobRecorder {
    pub run_id: u64,
}

impl JobRecorder {
    /// Allocate the next monotonic run_id and write the running record.
    pub fn start(store: &Store, command: &str, subcommand: Option<&str>) -> Result<JobRecorder> {
        let txn = store.begin_write(TableFamily::JobMetadata)?;
        let run_id = {
            let mut seq = txn.open_table(str_table(JOB_SEQ_TABLE))?;
            let next: u64 = match seq.get(JOB_SEQ_KEY)? {
                Some(guard) => bincode::deserialize(guard.value())?,
                None => 1,
            };
            let bytes = bincode::serialize(&(next + 1))?;
            seq.insert(JOB_SEQ_KEY, bytes.as_slice())?;
            next
        };
        let record = JobRecord {
            run_id,
            command: command.to_string(),
            subcommand: subcommand.map(String::from),
            db_user: store.role().name().to_string(),
            start_time: Utc::now(),
            end_time: None,
            status: JobStatus::Running,
            extra_metadata: serde_json::json!({}),
        };
        put_value(&txn, JOB_METADATA_TABLE, &job_key(run_id), &record)?;
        store.commit(txn)?;
        info!(
            "Starting DIRBS job {} (run_id {})",
            record.command, record.run_id
        );
        Ok(JobRecorder { run_id })
    }

    fn update(&self, store: &Store, f: impl FnOnce(&mut JobRecord)) -> Result<()> {
        let txn = store.begin_write(TableFamily::JobMetadata)?;
        {
            let key = job_key(self.run_id);
            let mut record: JobRecord = {
                let table = txn.open_table(str_table(JOB_METADATA_TABLE))?;
                let guard = table
                    .get(key.as_str())?
                    .ok_or_else(|| anyhow::anyhow!("job record {} vanished", self.run_id))?;
                bincode::deserialize(guard.value())?
            };
            f(&mut record);
            put_value(&txn, JOB_METADATA_TABLE, &key, &record)?;
        }
        store.commit(txn)?;
        Ok(())
    }

    /// Merge keys into extra_metadata, accreting across the run.
    pub fn add_metadata(&self, store: &Store, key: &str, value: serde_json::Value) -> Result<()> {
        self.update(store, |record| {
            if let serde_json::Value::Object(map) = &mut record.extra_metadata {
                map.insert(key.to_string(), value);
            }
        })
    }

    pub fn finish_success(&self, store: &Store) -> Result<()> {
        self.update(store, |record| {
            record.status = JobStatus::Success;
            record.end_time = Some(Utc::now());
        })
    }

    pub fn finish_error(&self, store: &Store, message: &str) -> Result<()> {
        let message = message.to_string();
        self.update(store, move |record| {
            record.status = JobStatus::Error;
            record.end_time = Some(Utc::now());
            if let serde_json::Value::Object(map) = &mut record.extra_metadata {
                map.insert(
                    "error".to_string(),
                    serde_json::Value::String(message.clone()),
                );
            }
        })
    }
}

/// All job records, run_id ascending.
pub fn scan_jobs(txn: &redb::ReadTransaction) -> Result<Vec<JobRecord>> {
    let table = match txn.open_table(str_table(JOB_METADATA_TABLE)) {
        Ok(t) => t,
        Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (_, v) = entry?;
        out.push(bincode::deserialize(v.value())?);
    }
    Ok(out)
}

pub fn job_record(txn: &redb::ReadTransaction, run_id: u64) -> Result<Option<JobRecord>> {
    crate::store::get_value(txn, JOB_METADATA_TABLE, &job_key(run_id))
}

/// Most recent job for a command, optionally restricted to successes.
pub fn latest_job(
    txn: &redb::ReadTransaction,
    command: &str,
    successful_only: bool,
) -> Result<Option<JobRecord>> {
    Ok(scan_jobs(txn)?
        .into_iter()
        .filter(|j| j.command == command)
        .filter(|j| !successful_only || j.status == JobStatus::Success)
        .max_by_key(|j| j.run_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_run_ids_monotonic() -> Result<()> {
        let dir = tempdir()?;
        let store = Store::install(&dir.path().join("core.redb"), 4)?;
        let a = JobRecorder::start(&store, "dirbs-import", Some("operator"))?;
        let b = JobRecorder::start(&store, "dirbs-classify", None)?;
        let c = JobRecorder::start(&store, "dirbs-import", Some("gsma"))?;
        assert!(a.run_id < b.run_id);
        assert!(b.run_id < c.run_id);
        Ok(())
    }

    #[test]
    fn test_lifecycle_and_error_metadata() -> Result<()> {
        let dir = tempdir()?;
        let store = Store::install(&dir.path().join("core.redb"), 4)?;

        let job = JobRecorder::start(&store, "dirbs-import", Some("operator"))?;
        job.add_metadata(
            &store,
            "input_stats",
            serde_json::json!({"num_records": 6}),
        )?;
        job.finish_error(&store, "Failed NULL IMEI data threshold check")?;

        let txn = store.begin_read()?;
        let record = job_record(&txn, job.run_id)?.unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert!(record.end_time.is_some());
        assert_eq!(
            record.extra_metadata["error"],
            serde_json::json!("Failed NULL IMEI data threshold check")
        );
        assert_eq!(record.extra_metadata["input_stats"]["num_records"], 6);
        Ok(())
    }

    #[test]
    fn test_latest_job_filters_by_status() -> Result<()> {
        let dir = tempdir()?;
        let store = Store::install(&dir.path().join("core.redb"), 4)?;

        let a = JobRecorder::start(&store, "dirbs-classify", None)?;
        a.finish_success(&store)?;
        let b = JobRecorder::start(&store, "dirbs-classify", None)?;
        b.finish_error(&store, "boom")?;

        let txn = store.begin_read()?;
        let latest = latest_job(&txn, "dirbs-classify", false)?.unwrap();
        assert_eq!(latest.run_id, b.run_id);
        let latest_ok = latest_job(&txn, "dirbs-classify", true)?.unwrap();
        assert_eq!(latest_ok.run_id, a.run_id);
        Ok(())
    }
}
