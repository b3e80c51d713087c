// Classification engine: parallel per-shard dimension evaluation and
// temporally versioned per-(IMEI, condition) state
use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{compute_amnesty_flags, AppConfig, ConditionConfig};
use crate::dimensions::{dimension_from_config, DimensionContext, DimensionSpec};
use crate::error::ValidationError;
use crate::importer::compute_analysis_end_date;
use crate::job::JobRecorder;
use crate::partition;
use crate::reference::{self, shard_leaf_for_imei};
use crate::store::{put_value, Store, TableFamily};

pub const CLASSIFICATION_STATE_BASE: &str = "classification_state";

/// One historical row of classification state. For each (imei, cond_name)
/// at most one row has end_date = NULL; that row is the active match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassificationRecord {
    pub cond_name: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub block_date: Option<NaiveDate>,
    pub amnesty_granted: bool,
    pub virt_imei_shard: u32,
}

/// A configured condition with its parsed dimensions.
pub struct Condition {
    pub config: ConditionConfig,
    pub dimensions: Vec<DimensionSpec>,
}

impl Condition {
    pub fn from_config(config: &ConditionConfig) -> Result<Condition> {
        let dimensions = config
            .dimensions
            .iter()
            .map(|d| dimension_from_config(d, &config.label))
            .collect::<Result<Vec<_>>>()?;
        Ok(Condition {
            config: config.clone(),
            dimensions,
        })
    }
}

/// Conditions in evaluation order: blocking first, then label ascending.
pub fn sorted_conditions(config: &AppConfig) -> Result<Vec<Condition>> {
    let mut conditions = config
        .conditions
        .iter()
        .map(Condition::from_config)
        .collect::<Result<Vec<_>>>()?;
    conditions.sort_by(|a, b| {
        b.config
            .blocking
            .cmp(&a.config.blocking)
            .then_with(|| a.config.label.cmp(&b.config.label))
    });
    Ok(conditions)
}

#[derive(Debug, Clone)]
pub struct ClassifyOutcome {
    pub run_id: u64,
    pub curr_date: NaiveDate,
    pub matched_imei_counts: HashMap<String, u64>,
    pub failed_conditions: HashMap<String, String>,
}

/// Run classification for every configured condition. Per-condition
/// failures are localized: the job reports partial success with
/// matched_imei_counts populated only for conditions that completed.
pub fn classify(
    store: &Store,
    config: &AppConfig,
    curr_date: Option<NaiveDate>,
    no_safety_check: bool,
) -> Result<ClassifyOutcome> {
    let job = JobRecorder::start(store, "dirbs-classify", None)?;
    let result = run_classify(store, config, curr_date, no_safety_check, &job);
    match &result {
        Ok(outcome) => {
            job.add_metadata(
                store,
                "matched_imei_counts",
                serde_json::to_value(&outcome.matched_imei_counts)?,
            )?;
            job.add_metadata(
                store,
                "conditions",
                serde_json::to_value(&config.conditions)?,
            )?;
            if outcome.failed_conditions.is_empty() {
                job.finish_success(store)?;
            } else {
                job.add_metadata(
                    store,
                    "failed_conditions",
                    serde_json::to_value(&outcome.failed_conditions)?,
                )?;
                job.finish_error(store, "one or more conditions failed to classify")?;
            }
        }
        Err(err) => {
            job.finish_error(store, &err.to_string())?;
        }
    }
    result
}

fn run_classify(
    store: &Store,
    config: &AppConfig,
    curr_date: Option<NaiveDate>,
    no_safety_check: bool,
    job: &JobRecorder,
) -> Result<ClassifyOutcome> {
    let curr_date = curr_date.unwrap_or_else(|| Utc::now().date_naive());
    let analysis_end_date = compute_analysis_end_date(store, Some(curr_date))?;
    let conditions = sorted_conditions(config)?;
    let (in_eval_period, in_amnesty_period) = compute_amnesty_flags(&config.amnesty, curr_date);

    let gsma = {
        let txn = store.begin_read()?;
        reference::scan_gsma(&txn)?
    };
    let shards = partition::physical_imei_shards(store, "network_imeis")?;
    let total_network_imeis = {
        let txn = store.begin_read()?;
        let mut total = 0u64;
        for (leaf, _, _) in &shards {
            total += crate::triplets::scan_network_imeis(&txn, leaf)?.len() as u64;
        }
        total
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.multiprocessing.max_db_connections)
        .build()
        .context("Failed to build classification worker pool")?;

    let mut matched_imei_counts: HashMap<String, u64> = HashMap::new();
    let mut failed_conditions: HashMap<String, String> = HashMap::new();

    for condition in &conditions {
        let label = condition.config.label.clone();
        info!("Classifying condition {}...", label);

        let per_shard: Result<Vec<(usize, HashSet<String>)>> = pool.install(|| {
            shards
                .par_iter()
                .enumerate()
                .map(|(idx, (_, lo, hi))| {
                    let ctx = DimensionContext {
                        store,
                        config,
                        range_start: *lo,
                        range_end: *hi,
                        analysis_end_date,
                        gsma: &gsma,
                    };
                    // AND across dimensions within the condition
                    let mut matched: Option<HashSet<String>> = None;
                    for dim in &condition.dimensions {
                        let set = dim.matching_imeis(&ctx)?;
                        matched = Some(match matched {
                            None => set,
                            Some(prev) => prev.intersection(&set).cloned().collect(),
                        });
                    }
                    Ok((idx, matched.unwrap_or_default()))
                })
                .collect()
        });

        let per_shard = match per_shard {
            Ok(v) => v,
            Err(err) => {
                error!("Condition {} failed to classify: {}", label, err);
                failed_conditions.insert(label, err.to_string());
                continue;
            }
        };

        let total_matched: u64 = per_shard.iter().map(|(_, s)| s.len() as u64).sum();

        // Safety check: refuse to newly classify an implausibly large share
        // of all ever-seen IMEIs
        if !no_safety_check && total_network_imeis > 0 {
            let ratio = total_matched as f64 / total_network_imeis as f64;
            if ratio > condition.config.max_allowed_matching_ratio {
                return Err(ValidationError::PrevalidationCheck(format!(
                    "Refusing to classify using condition '{}': {} matched IMEIs \
                     ({:.2}% of seen IMEIs) exceeds the maximum allowed matching ratio of \
                     {:.2}%. Use --no-safety-check to override.",
                    label,
                    total_matched,
                    ratio * 100.0,
                    condition.config.max_allowed_matching_ratio * 100.0
                ))
                .into());
            }
        }

        for (idx, matched) in &per_shard {
            let (_, lo, hi) = shards[*idx];
            apply_condition_state(
                store,
                condition,
                matched,
                lo,
                hi,
                curr_date,
                in_eval_period,
                in_amnesty_period,
                config,
            )?;
        }
        info!("Condition {} matched {} IMEIs", label, total_matched);
        matched_imei_counts.insert(label, total_matched);
    }

    if !failed_conditions.is_empty() {
        warn!(
            "{} condition(s) failed to classify; their state was left untouched",
            failed_conditions.len()
        );
    }

    Ok(ClassifyOutcome {
        run_id: job.run_id,
        curr_date,
        matched_imei_counts,
        failed_conditions,
    })
}

/// Diff one condition's matched set against the stored state of one shard.
/// Writes are partitioned by (imei, cond_name), so no two workers touch the
/// same key.
#[allow(clippy::too_many_arguments)]
fn apply_condition_state(
    store: &Store,
    condition: &Condition,
    matched: &HashSet<String>,
    range_start: u32,
    range_end: u32,
    curr_date: NaiveDate,
    in_eval_period: bool,
    in_amnesty_period: bool,
    config: &AppConfig,
) -> Result<()> {
    let leaf = crate::shard::imei_shard_name(CLASSIFICATION_STATE_BASE, range_start, range_end);
    let cond = &condition.config;

    let existing: Vec<(String, Vec<ClassificationRecord>)> = {
        let txn = store.begin_read()?;
        crate::store::scan_table(&txn, &leaf)?
    };
    let mut by_imei: HashMap<String, Vec<ClassificationRecord>> = existing.into_iter().collect();

    let mut dirty: HashSet<String> = HashSet::new();

    // Retire active rows that no longer match, unless the condition is
    // sticky
    if !cond.sticky {
        for (imei, records) in by_imei.iter_mut() {
            if matched.contains(imei) {
                continue;
            }
            for record in records.iter_mut() {
                if record.cond_name == cond.label && record.end_date.is_none() {
                    record.end_date = Some(curr_date);
                    dirty.insert(imei.clone());
                }
            }
        }
    }

    let amnesty_block_date = config.amnesty.amnesty_period_end_date;
    for imei in matched {
        let records = by_imei.entry(imei.clone()).or_default();
        let active = records
            .iter_mut()
            .find(|r| r.cond_name == cond.label && r.end_date.is_none());
        match active {
            Some(record) => {
                // Sticky existing match; in the amnesty period, previously
                // granted rows have their block date deferred
                if in_amnesty_period
                    && cond.blocking
                    && cond.amnesty_eligible
                    && record.amnesty_granted
                {
                    if let Some(deferred) = amnesty_block_date {
                        if record.block_date != Some(deferred) {
                            record.block_date = Some(deferred);
                            dirty.insert(imei.clone());
                        }
                    }
                }
            }
            None => {
                let grant_amnesty = cond.blocking && cond.amnesty_eligible && in_eval_period;
                let block_date = if !cond.blocking {
                    None
                } else if grant_amnesty {
                    amnesty_block_date
                } else {
                    Some(curr_date + Duration::days(cond.grace_period_days as i64))
                };
                records.push(ClassificationRecord {
                    cond_name: cond.label.clone(),
                    start_date: curr_date,
                    end_date: None,
                    block_date,
                    amnesty_granted: grant_amnesty,
                    virt_imei_shard: crate::shard::calc_virt_imei_shard(Some(imei)),
                });
                dirty.insert(imei.clone());
            }
        }
    }

    if dirty.is_empty() {
        return Ok(());
    }
    let txn = store.begin_write(TableFamily::ClassificationState)?;
    {
        for imei in &dirty {
            put_value(&txn, &leaf, imei, &by_imei[imei])?;
        }
    }
    store.commit(txn)?;
    Ok(())
}

/// All classification rows for one IMEI.
pub fn classification_records_for_imei(
    store: &Store,
    imei_norm: &str,
) -> Result<Vec<ClassificationRecord>> {
    let leaf = shard_leaf_for_imei(store, CLASSIFICATION_STATE_BASE, imei_norm)?;
    let txn = store.begin_read()?;
    Ok(crate::store::get_value(&txn, &leaf, imei_norm)?.unwrap_or_default())
}

/// Active rows only.
pub fn active_records_for_imei(
    store: &Store,
    imei_norm: &str,
) -> Result<Vec<ClassificationRecord>> {
    Ok(classification_records_for_imei(store, imei_norm)?
        .into_iter()
        .filter(|r| r.end_date.is_none())
        .collect())
}

/// Scan one classification shard: (imei_norm, rows).
pub fn scan_classification_shard(
    txn: &redb::ReadTransaction,
    range_start: u32,
    range_end: u32,
) -> Result<Vec<(String, Vec<ClassificationRecord>)>> {
    let leaf = crate::shard::imei_shard_name(CLASSIFICATION_STATE_BASE, range_start, range_end);
    crate::store::scan_table(txn, &leaf)
}

/// The full classification state across shards, keyed by IMEI.
pub fn scan_all_classification_state(
    store: &Store,
) -> Result<HashMap<String, Vec<ClassificationRecord>>> {
    let txn = store.begin_read()?;
    let mut out = HashMap::new();
    for (_, lo, hi) in partition::physical_imei_shards(store, CLASSIFICATION_STATE_BASE)? {
        for (imei, records) in scan_classification_shard(&txn, lo, hi)? {
            out.insert(imei, records);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(label: &str, blocking: bool) -> ConditionConfig {
        ConditionConfig {
            label: label.to_string(),
            dimensions: vec![crate::config::DimensionConfig {
                module: "is_test_tac".to_string(),
                parameters: serde_yaml::Value::Null,
                invert: false,
            }],
            grace_period_days: 30,
            blocking,
            sticky: false,
            reason: String::new(),
            max_allowed_matching_ratio: 1.0,
            amnesty_eligible: true,
        }
    }

    #[test]
    fn test_condition_ordering() {
        let mut config = AppConfig::default();
        config.conditions = vec![
            cond("zeta_info", false),
            cond("beta_blocking", true),
            cond("alpha_info", false),
            cond("alpha_blocking", true),
        ];
        let sorted = sorted_conditions(&config).unwrap();
        let labels: Vec<&str> = sorted.iter().map(|c| c.config.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["alpha_blocking", "beta_blocking", "alpha_info", "zeta_info"]
        );
    }
}
