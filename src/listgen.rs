// List generation: blacklist, per-operator notifications and exceptions,
// versioned by (start_run_id, end_run_id)
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::classify;
use crate::config::AppConfig;
use crate::job::JobRecorder;
use crate::partition;
use crate::reference::{self, PairingRecord};
use crate::store::{put_value, scan_table, Store, TableFamily};
use crate::triplets::scan_triplets;

pub const BLACKLIST_TABLE: &str = "blacklist";

fn notifications_table(operator_id: &str) -> String {
    format!("notifications_lists_{}", operator_id)
}

fn exceptions_table(operator_id: &str) -> String {
    format!("exceptions_lists_{}", operator_id)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlacklistRow {
    pub imei_norm: String,
    pub block_date: NaiveDate,
    pub reasons: Vec<String>,
    pub start_run_id: u64,
    pub end_run_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationRow {
    pub imei_norm: String,
    pub imsi: String,
    pub msisdn: Option<String>,
    pub block_date: NaiveDate,
    pub reasons: Vec<String>,
    pub start_run_id: u64,
    pub end_run_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExceptionsRow {
    pub imei_norm: String,
    pub imsi: String,
    pub start_run_id: u64,
    pub end_run_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ListgenOutcome {
    pub run_id: u64,
    pub blacklist_size: u64,
    pub notifications_per_operator: HashMap<String, u64>,
    pub exceptions_per_operator: HashMap<String, u64>,
}

/// Generate the current blacklist, notifications and exceptions lists,
/// version them against the stored copies and write CSVs to `output_dir`.
pub fn generate_lists(
    store: &Store,
    config: &AppConfig,
    output_dir: &Path,
    curr_date: Option<NaiveDate>,
) -> Result<ListgenOutcome> {
    let job = JobRecorder::start(store, "dirbs-listgen", None)?;
    let result = run_listgen(store, config, output_dir, curr_date, &job);
    match &result {
        Ok(outcome) => {
            job.add_metadata(
                store,
                "output_stats",
                serde_json::json!({
                    "blacklist_size": outcome.blacklist_size,
                    "notifications": outcome.notifications_per_operator,
                    "exceptions": outcome.exceptions_per_operator,
                }),
            )?;
            job.finish_success(store)?;
        }
        Err(err) => {
            job.finish_error(store, &err.to_string())?;
        }
    }
    result
}

fn run_listgen(
    store: &Store,
    config: &AppConfig,
    output_dir: &Path,
    curr_date: Option<NaiveDate>,
    job: &JobRecorder,
) -> Result<ListgenOutcome> {
    let curr_date = curr_date.unwrap_or_else(|| Utc::now().date_naive());
    let run_id = job.run_id;
    std::fs::create_dir_all(output_dir)?;

    let state = classify::scan_all_classification_state(store)?;
    let reasons_by_label: HashMap<&str, &str> = config
        .conditions
        .iter()
        .map(|c| {
            (
                c.label.as_str(),
                if c.reason.is_empty() {
                    c.label.as_str()
                } else {
                    c.reason.as_str()
                },
            )
        })
        .collect();
    let blocking_labels: HashSet<&str> = config
        .conditions
        .iter()
        .filter(|c| c.blocking)
        .map(|c| c.label.as_str())
        .collect();

    // Blocked and pending IMEIs from the active classification state
    let mut blacklist: BTreeMap<String, BlacklistRow> = BTreeMap::new();
    let mut pending: HashMap<String, (NaiveDate, Vec<String>)> = HashMap::new();
    for (imei, records) in &state {
        let mut block_date: Option<NaiveDate> = None;
        let mut reasons: Vec<String> = Vec::new();
        let mut pending_date: Option<NaiveDate> = None;
        let mut pending_reasons: Vec<String> = Vec::new();
        for record in records {
            if record.end_date.is_some() || !blocking_labels.contains(record.cond_name.as_str()) {
                continue;
            }
            let reason = reasons_by_label
                .get(record.cond_name.as_str())
                .copied()
                .unwrap_or(record.cond_name.as_str())
                .to_string();
            match record.block_date {
                Some(d) if d <= curr_date => {
                    block_date = Some(block_date.map_or(d, |b| b.min(d)));
                    reasons.push(reason);
                }
                Some(d) => {
                    pending_date = Some(pending_date.map_or(d, |b: NaiveDate| b.min(d)));
                    pending_reasons.push(reason);
                }
                None => {}
            }
        }
        reasons.sort();
        reasons.dedup();
        pending_reasons.sort();
        pending_reasons.dedup();
        if let Some(d) = block_date {
            blacklist.insert(
                imei.clone(),
                BlacklistRow {
                    imei_norm: imei.clone(),
                    block_date: d,
                    reasons,
                    start_run_id: run_id,
                    end_run_id: None,
                },
            );
        } else if let Some(d) = pending_date {
            pending.insert(imei.clone(), (d, pending_reasons));
        }
    }

    version_blacklist(store, &blacklist, run_id)?;
    write_blacklist_csv(output_dir, &blacklist)?;

    // Subscribers seen with each pending IMEI, per operator
    let mut notifications: HashMap<String, BTreeMap<String, NotificationRow>> = HashMap::new();
    if !pending.is_empty() {
        let txn = store.begin_read()?;
        for (leaf, meta) in
            partition::family_partitions(store, "monthly_network_triplets_per_mno")?
        {
            let operator = match &meta.operator_id {
                Some(op) => op.clone(),
                None => continue,
            };
            for record in scan_triplets(&txn, &leaf)? {
                let imei = match &record.imei_norm {
                    Some(v) => v,
                    None => continue,
                };
                let (block_date, reasons) = match pending.get(imei) {
                    Some(v) => v,
                    None => continue,
                };
                let imsi = match &record.imsi {
                    Some(v) => v.clone(),
                    None => continue,
                };
                let key = format!(
                    "{}|{}|{}",
                    imei,
                    imsi,
                    record.msisdn.as_deref().unwrap_or("")
                );
                notifications.entry(operator.clone()).or_default().insert(
                    key,
                    NotificationRow {
                        imei_norm: imei.clone(),
                        imsi,
                        msisdn: record.msisdn.clone(),
                        block_date: *block_date,
                        reasons: reasons.clone(),
                        start_run_id: run_id,
                        end_run_id: None,
                    },
                );
            }
        }
    }

    // Exceptions: active pairings, attributed to operators by IMSI prefix
    let mut exceptions: HashMap<String, BTreeMap<String, ExceptionsRow>> = HashMap::new();
    {
        let txn = store.begin_read()?;
        let pairings: HashMap<String, Vec<PairingRecord>> =
            reference::active_entries(&txn, reference::PAIRING_TABLE)?;
        for (imei, records) in pairings {
            for pairing in records {
                for operator in &config.region.operators {
                    let is_home = operator
                        .mcc_mnc_prefixes()
                        .iter()
                        .any(|p| pairing.imsi.starts_with(p.as_str()));
                    if !is_home {
                        continue;
                    }
                    let key = format!("{}|{}", imei, pairing.imsi);
                    exceptions.entry(operator.id.clone()).or_default().insert(
                        key,
                        ExceptionsRow {
                            imei_norm: imei.clone(),
                            imsi: pairing.imsi.clone(),
                            start_run_id: run_id,
                            end_run_id: None,
                        },
                    );
                }
            }
        }
    }

    let mut notifications_per_operator = HashMap::new();
    let mut exceptions_per_operator = HashMap::new();
    for operator in &config.region.operators {
        let op_notifications = notifications.remove(&operator.id).unwrap_or_default();
        version_keyed_list(
            store,
            &notifications_table(&operator.id),
            &op_notifications,
            run_id,
            |row: &mut NotificationRow, end| row.end_run_id = end,
            |row| row.end_run_id,
        )?;
        write_notifications_csv(output_dir, &operator.id, &op_notifications)?;
        notifications_per_operator.insert(operator.id.clone(), op_notifications.len() as u64);

        let op_exceptions = exceptions.remove(&operator.id).unwrap_or_default();
        version_keyed_list(
            store,
            &exceptions_table(&operator.id),
            &op_exceptions,
            run_id,
            |row: &mut ExceptionsRow, end| row.end_run_id = end,
            |row| row.end_run_id,
        )?;
        write_exceptions_csv(output_dir, &operator.id, &op_exceptions)?;
        exceptions_per_operator.insert(operator.id.clone(), op_exceptions.len() as u64);
    }

    info!(
        "Generated lists: {} blacklisted IMEIs, {} operators",
        blacklist.len(),
        config.region.operators.len()
    );

    Ok(ListgenOutcome {
        run_id,
        blacklist_size: blacklist.len() as u64,
        notifications_per_operator,
        exceptions_per_operator,
    })
}

/// Close stored blacklist rows absent from the new list and append new
/// ones. The active view is end_run_id IS NULL.
fn version_blacklist(
    store: &Store,
    new_rows: &BTreeMap<String, BlacklistRow>,
    run_id: u64,
) -> Result<()> {
    let existing: Vec<(String, Vec<BlacklistRow>)> = {
        let txn = store.begin_read()?;
        scan_table(&txn, BLACKLIST_TABLE)?
    };
    let mut by_imei: HashMap<String, Vec<BlacklistRow>> = existing.into_iter().collect();

    let mut all_keys: HashSet<String> = by_imei.keys().cloned().collect();
    all_keys.extend(new_rows.keys().cloned());

    let txn = store.begin_write(TableFamily::Lists)?;
    {
        for key in &all_keys {
            let rows = by_imei.entry(key.clone()).or_default();
            let incoming = new_rows.get(key);
            let mut changed = false;

            for row in rows.iter_mut() {
                if row.end_run_id.is_none() {
                    let still_current = incoming.map_or(false, |n| {
                        n.block_date == row.block_date && n.reasons == row.reasons
                    });
                    if !still_current {
                        row.end_run_id = Some(run_id);
                        changed = true;
                    }
                }
            }
            if let Some(incoming) = incoming {
                let has_active = rows.iter().any(|r| r.end_run_id.is_none());
                if !has_active {
                    rows.push(incoming.clone());
                    changed = true;
                }
            }
            if changed {
                put_value(&txn, BLACKLIST_TABLE, key, rows)?;
            }
        }
    }
    store.commit(txn)?;
    Ok(())
}

/// Generic run-id versioning for the per-operator keyed lists.
fn version_keyed_list<T: Clone + Serialize + serde::de::DeserializeOwned + PartialEq>(
    store: &Store,
    table_name: &str,
    new_rows: &BTreeMap<String, T>,
    run_id: u64,
    set_end: impl Fn(&mut T, Option<u64>),
    get_end: impl Fn(&T) -> Option<u64>,
) -> Result<()> {
    let existing: Vec<(String, Vec<T>)> = {
        let txn = store.begin_read()?;
        scan_table(&txn, table_name)?
    };
    let mut by_key: HashMap<String, Vec<T>> = existing.into_iter().collect();
    let mut all_keys: HashSet<String> = by_key.keys().cloned().collect();
    all_keys.extend(new_rows.keys().cloned());

    let txn = store.begin_write(TableFamily::Lists)?;
    {
        for key in &all_keys {
            let rows = by_key.entry(key.clone()).or_default();
            let incoming = new_rows.get(key);
            let mut changed = false;

            for row in rows.iter_mut() {
                if get_end(row).is_none() && incoming.is_none() {
                    set_end(row, Some(run_id));
                    changed = true;
                }
            }
            if let Some(incoming) = incoming {
                if !rows.iter().any(|r| get_end(r).is_none()) {
                    rows.push(incoming.clone());
                    changed = true;
                }
            }
            if changed {
                put_value(&txn, table_name, key, rows)?;
            }
        }
    }
    store.commit(txn)?;
    Ok(())
}

fn format_date(d: NaiveDate) -> String {
    d.format("%Y%m%d").to_string()
}

fn write_blacklist_csv(
    output_dir: &Path,
    blacklist: &BTreeMap<String, BlacklistRow>,
) -> Result<()> {
    let mut writer = csv::Writer::from_path(output_dir.join("blacklist.csv"))?;
    writer.write_record(["imei", "block_date", "reasons"])?;
    for row in blacklist.values() {
        writer.write_record([
            row.imei_norm.as_str(),
            &format_date(row.block_date),
            &row.reasons.join("|"),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_notifications_csv(
    output_dir: &Path,
    operator_id: &str,
    rows: &BTreeMap<String, NotificationRow>,
) -> Result<()> {
    let path = output_dir.join(format!("notifications_{}.csv", operator_id));
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["imei", "imsi", "msisdn", "block_date", "reasons"])?;
    for row in rows.values() {
        writer.write_record([
            row.imei_norm.as_str(),
            row.imsi.as_str(),
            row.msisdn.as_deref().unwrap_or(""),
            &format_date(row.block_date),
            &row.reasons.join("|"),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_exceptions_csv(
    output_dir: &Path,
    operator_id: &str,
    rows: &BTreeMap<String, ExceptionsRow>,
) -> Result<()> {
    let path = output_dir.join(format!("exceptions_{}.csv", operator_id));
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["imei", "imsi"])?;
    for row in rows.values() {
        writer.write_record([row.imei_norm.as_str(), row.imsi.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}
