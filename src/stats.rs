// Monthly report stats generator: exact counts combined with HLL sketches
// under fixed condition ordering and error-bound guarantees
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::classify;
use crate::config::{AppConfig, COUNTRY_OPERATOR_NAME};
use crate::hll::{hll_error_bound, hll_union_agg};
use crate::job::JobRecorder;
use crate::partition::{
    monthly_network_triplets_country_partition, monthly_network_triplets_per_mno_partition,
    physical_imei_shards,
};
use crate::reference::{self, GsmaRecord};
use crate::sketches::sketches_for_month;
use crate::store::Store;
use crate::triplets::{
    bitcount, date_range_for_month_year, gsma_rat_bitmask_generations, scan_network_imeis,
    scan_triplets, TripletRecord,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonthlyStats {
    pub num_records: u64,
    pub num_imeis: u64,
    pub num_imsis: u64,
    pub num_msisdns: u64,
    pub num_triplets: u64,
    pub num_imei_imsis: u64,
    pub num_imei_msisdns: u64,
    pub num_imsi_msisdns: u64,
    pub num_null_imei_records: u64,
    pub num_null_imsi_records: u64,
    pub num_null_msisdn_records: u64,
    pub num_invalid_imei_imsis: u64,
    pub num_invalid_imei_msisdns: u64,
    pub num_invalid_triplets: u64,
    pub num_gross_adds: u64,
    pub num_compliant_imeis: u64,
    pub num_noncompliant_imeis: u64,
    pub num_noncompliant_imeis_blocking: u64,
    pub num_noncompliant_imeis_info_only: u64,
    pub num_compliant_triplets: u64,
    pub num_noncompliant_triplets: u64,
    pub num_noncompliant_triplets_blocking: u64,
    pub num_noncompliant_triplets_info_only: u64,
    pub num_compliant_imei_imsis: u64,
    pub num_noncompliant_imei_imsis: u64,
    pub num_noncompliant_imei_imsis_blocking: u64,
    pub num_noncompliant_imei_imsis_info_only: u64,
    pub num_compliant_imei_msisdns: u64,
    pub num_noncompliant_imei_msisdns: u64,
    pub num_noncompliant_imei_msisdns_blocking: u64,
    pub num_noncompliant_imei_msisdns_info_only: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStats {
    pub data_date: NaiveDate,
    pub num_triplets: u64,
    pub num_imeis: u64,
    pub num_imsis: u64,
    pub num_msisdns: u64,
    pub num_imei_imsis: u64,
    pub num_imei_msisdns: u64,
    pub num_imsi_msisdns: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopModel {
    pub manufacturer: String,
    pub model: String,
    pub tech_generations: String,
    pub imei_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionCount {
    pub num_imeis: u64,
    pub num_imei_gross_adds: u64,
    pub num_triplets: u64,
    pub num_imei_imsis: u64,
    pub num_imei_msisdns: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TacComplianceStats {
    pub num_imeis: u64,
    pub num_imei_gross_adds: u64,
    pub num_imei_imsis: u64,
    pub num_imei_msisdns: u64,
    pub num_subscriber_triplets: u64,
    pub compliance_level: u8,
}

/// TAC -> condition-status vector -> rolled-up stats. The vector's order
/// matches the report's sorted condition list.
pub type PerTacCompliance = BTreeMap<String, BTreeMap<Vec<bool>, TacComplianceStats>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverloadingBucket {
    pub seen_with: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyOverloadingBin {
    pub bin_start: f64,
    pub bin_end: f64,
    pub num_imeis: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperatorStats {
    pub monthly: MonthlyStats,
    pub daily: Vec<DailyStats>,
    pub top_models_imei: Vec<TopModel>,
    pub top_models_gross_adds: Vec<TopModel>,
    pub condition_counts: BTreeMap<String, ConditionCount>,
    pub per_tac_compliance: PerTacCompliance,
    pub imei_imsi_overloading: Vec<OverloadingBucket>,
    pub imsi_imei_overloading: Vec<OverloadingBucket>,
    pub daily_imei_imsi_overloading: Vec<DailyOverloadingBin>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportStats {
    pub year: i32,
    pub month: u32,
    /// (label, blocking), blocking first then label ascending
    pub conditions: Vec<(String, bool)>,
    pub per_operator: BTreeMap<String, OperatorStats>,
}

/// Duration bookkeeping for every per-stat job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatDuration {
    pub stat_name: String,
    pub operator_id: String,
    pub duration_secs: f64,
    pub normalized_per_million_triplets: Option<f64>,
}

fn sort_condition_tuples(config: &AppConfig) -> Vec<(String, bool)> {
    let mut tuples: Vec<(String, bool)> = config
        .conditions
        .iter()
        .map(|c| (c.label.clone(), c.blocking))
        .collect();
    tuples.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    tuples
}

/// Rows of one monthly partition (country level when `operator` is None).
fn monthly_partition_records(
    store: &Store,
    operator: Option<&str>,
    year: i32,
    month: u32,
) -> Result<Vec<TripletRecord>> {
    let base = match operator {
        Some(op) => monthly_network_triplets_per_mno_partition(op, year, month, ""),
        None => monthly_network_triplets_country_partition(year, month, ""),
    };
    let txn = store.begin_read()?;
    let mut out = Vec::new();
    for (leaf, _, _) in physical_imei_shards(store, &base)? {
        out.extend(scan_triplets(&txn, &leaf)?);
    }
    Ok(out)
}

fn network_first_seen_map(store: &Store) -> Result<HashMap<String, NaiveDate>> {
    let txn = store.begin_read()?;
    let mut out = HashMap::new();
    for (leaf, _, _) in physical_imei_shards(store, "network_imeis")? {
        for record in scan_network_imeis(&txn, &leaf)? {
            out.insert(record.imei_norm, record.first_seen);
        }
    }
    Ok(out)
}

struct StatInputs<'a> {
    store: &'a Store,
    config: &'a AppConfig,
    year: i32,
    month: u32,
    conditions: &'a [(String, bool)],
    gsma: &'a HashMap<String, GsmaRecord>,
    first_seen: &'a HashMap<String, NaiveDate>,
    classification: &'a HashMap<String, Vec<classify::ClassificationRecord>>,
}

/// Generate the full stats block for one reporting month. Each stat runs
/// as a separate job on a pool bounded by max_db_connections; durations
/// (raw and normalized per million triplets) are recorded in job metadata.
pub fn generate_monthly_report_stats(
    store: &Store,
    config: &AppConfig,
    month: u32,
    year: i32,
) -> Result<(ReportStats, Vec<StatDuration>)> {
    let job = JobRecorder::start(store, "dirbs-report", Some("stats"))?;
    let result = run_stats(store, config, month, year);
    match &result {
        Ok((stats, durations)) => {
            // Stats are attributed to the classification run they reflect
            let class_run_id = {
                let txn = store.begin_read()?;
                crate::job::latest_job(&txn, "dirbs-classify", true)?.map(|j| j.run_id)
            };
            job.add_metadata(store, "durations", serde_json::to_value(durations)?)?;
            job.add_metadata(
                store,
                "summary",
                serde_json::json!({
                    "report_month": month,
                    "report_year": year,
                    "num_operators": stats.per_operator.len(),
                    "class_run_id": class_run_id,
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

fn run_stats(
    store: &Store,
    config: &AppConfig,
    month: u32,
    year: i32,
) -> Result<(ReportStats, Vec<StatDuration>)> {
    let conditions = sort_condition_tuples(config);
    if conditions.is_empty() {
        warn!("No conditions defined in config: no classification stats will be generated");
    }
    let gsma = {
        let txn = store.begin_read()?;
        reference::scan_gsma(&txn)?
    };
    let first_seen = network_first_seen_map(store)?;
    let classification = classify::scan_all_classification_state(store)?;

    let mut operator_slots: Vec<Option<String>> = config
        .region
        .operators
        .iter()
        .map(|o| Some(o.id.clone()))
        .collect();
    operator_slots.push(None); // country rollup

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.multiprocessing.max_db_connections)
        .build()
        .context("Failed to build stats worker pool")?;

    info!(
        "Simultaneously calculating report data using {} workers...",
        config.multiprocessing.max_db_connections
    );

    let results: Result<Vec<(String, OperatorStats, Vec<StatDuration>)>> = pool.install(|| {
        operator_slots
            .par_iter()
            .map(|operator| {
                let inputs = StatInputs {
                    store,
                    config,
                    year,
                    month,
                    conditions: &conditions,
                    gsma: &gsma,
                    first_seen: &first_seen,
                    classification: &classification,
                };
                let name = operator
                    .clone()
                    .unwrap_or_else(|| COUNTRY_OPERATOR_NAME.to_string());
                let (stats, durations) = operator_stats(&inputs, operator.as_deref(), &name)?;
                Ok((name, stats, durations))
            })
            .collect()
    });
    let results = results?;

    let mut per_operator = BTreeMap::new();
    let mut durations = Vec::new();
    for (name, stats, mut ds) in results {
        per_operator.insert(name, stats);
        durations.append(&mut ds);
    }

    // HLL cross-check: the sketch-derived monthly IMEI count must agree
    // with the exact compliance counts within the theoretical error bound.
    // Rewrite num_imeis so downstream consumers stay internally consistent.
    let theoretical_error = hll_error_bound() * 100.0;
    for (operator, stats) in per_operator.iter_mut() {
        let monthly = &mut stats.monthly;
        let total = monthly.num_imeis;
        let exact = monthly.num_compliant_imeis + monthly.num_noncompliant_imeis;
        let percentage_error = if total > 0 {
            (exact as f64 - total as f64).abs() / total as f64 * 100.0
        } else {
            0.0
        };
        if percentage_error > theoretical_error {
            warn!(
                "Percentage error in monthly IMEI count (HLL vs. exact) for operator {}: \
                 {:.3}% (theoretical max error {:.3}%)",
                operator, percentage_error, theoretical_error
            );
        } else {
            info!(
                "Percentage error in monthly IMEI count (HLL vs. exact) for operator {}: \
                 {:.3}% (theoretical max error {:.3}%)",
                operator, percentage_error, theoretical_error
            );
        }
        monthly.num_imeis = exact;
    }

    Ok((
        ReportStats {
            year,
            month,
            conditions,
            per_operator,
        },
        durations,
    ))
}

fn operator_stats(
    inputs: &StatInputs<'_>,
    operator: Option<&str>,
    operator_name: &str,
) -> Result<(OperatorStats, Vec<StatDuration>)> {
    let records = monthly_partition_records(inputs.store, operator, inputs.year, inputs.month)?;
    let mut stats = OperatorStats::default();
    let mut durations = Vec::new();
    let num_triplets = records.len().max(1) as f64;

    let mut time_stat = |name: &str, durations: &mut Vec<StatDuration>, f: &mut dyn FnMut() -> Result<()>| {
        let started = Instant::now();
        let result = f();
        let elapsed = started.elapsed().as_secs_f64();
        durations.push(StatDuration {
            stat_name: name.to_string(),
            operator_id: operator_name.to_string(),
            duration_secs: elapsed,
            normalized_per_million_triplets: Some(elapsed * 1_000_000.0 / num_triplets),
        });
        result
    };

    time_stat("record_count", &mut durations, &mut || {
        stats.monthly.num_records = records.len() as u64;
        Ok(())
    })?;

    time_stat("distinct_id_counts", &mut durations, &mut || {
        distinct_id_counts(inputs, operator, &mut stats)
    })?;

    time_stat("monthly_invalid_counts", &mut durations, &mut || {
        invalid_counts(&records, &mut stats.monthly);
        Ok(())
    })?;

    time_stat("imei_gross_adds", &mut durations, &mut || {
        stats.monthly.num_gross_adds = gross_adds(inputs, &records).len() as u64;
        Ok(())
    })?;

    time_stat("top_models_imei", &mut durations, &mut || {
        stats.top_models_imei = top_models_by_imei(inputs, &records);
        Ok(())
    })?;

    time_stat("top_models_gross_adds", &mut durations, &mut || {
        let ga = gross_adds(inputs, &records);
        stats.top_models_gross_adds = top_models_from_set(inputs, &ga);
        Ok(())
    })?;

    time_stat("compliance_data", &mut durations, &mut || {
        compliance_data(inputs, &records, &mut stats);
        Ok(())
    })?;

    time_stat("imei_imsi_overloading", &mut durations, &mut || {
        stats.imei_imsi_overloading = imei_imsi_overloading(&records);
        Ok(())
    })?;

    time_stat("imsi_imei_overloading", &mut durations, &mut || {
        stats.imsi_imei_overloading = imsi_imei_overloading(&records);
        Ok(())
    })?;

    time_stat("daily_imei_imsi_overloading", &mut durations, &mut || {
        stats.daily_imei_imsi_overloading = daily_imei_imsi_overloading(&records, 0.1, 5);
        Ok(())
    })?;

    Ok((stats, durations))
}

/// Daily and monthly distinct ID counts from the HLL sketch store. The
/// country rollup unions every operator's sketches.
fn distinct_id_counts(
    inputs: &StatInputs<'_>,
    operator: Option<&str>,
    stats: &mut OperatorStats,
) -> Result<()> {
    let txn = inputs.store.begin_read()?;
    let sketches = sketches_for_month(&txn, operator, inputs.year, inputs.month)?;

    // Group by day: one sketch row per operator per day
    let mut by_day: BTreeMap<NaiveDate, Vec<&crate::sketches::DailySketches>> = BTreeMap::new();
    for sketch in &sketches {
        by_day.entry(sketch.data_date).or_default().push(sketch);
    }

    stats.daily = by_day
        .iter()
        .map(|(date, day_sketches)| DailyStats {
            data_date: *date,
            num_triplets: hll_union_agg(day_sketches.iter().map(|s| &s.triplet_hll))
                .cardinality()
                .round() as u64,
            num_imeis: hll_union_agg(day_sketches.iter().map(|s| &s.imei_hll))
                .cardinality()
                .round() as u64,
            num_imsis: hll_union_agg(day_sketches.iter().map(|s| &s.imsi_hll))
                .cardinality()
                .round() as u64,
            num_msisdns: hll_union_agg(day_sketches.iter().map(|s| &s.msisdn_hll))
                .cardinality()
                .round() as u64,
            num_imei_imsis: hll_union_agg(day_sketches.iter().map(|s| &s.imei_imsis_hll))
                .cardinality()
                .round() as u64,
            num_imei_msisdns: hll_union_agg(day_sketches.iter().map(|s| &s.imei_msisdns_hll))
                .cardinality()
                .round() as u64,
            num_imsi_msisdns: hll_union_agg(day_sketches.iter().map(|s| &s.imsi_msisdns_hll))
                .cardinality()
                .round() as u64,
        })
        .collect();

    let monthly = &mut stats.monthly;
    monthly.num_triplets = hll_union_agg(sketches.iter().map(|s| &s.triplet_hll))
        .cardinality()
        .round() as u64;
    monthly.num_imeis = hll_union_agg(sketches.iter().map(|s| &s.imei_hll))
        .cardinality()
        .round() as u64;
    monthly.num_imsis = hll_union_agg(sketches.iter().map(|s| &s.imsi_hll))
        .cardinality()
        .round() as u64;
    monthly.num_msisdns = hll_union_agg(sketches.iter().map(|s| &s.msisdn_hll))
        .cardinality()
        .round() as u64;
    monthly.num_imei_imsis = hll_union_agg(sketches.iter().map(|s| &s.imei_imsis_hll))
        .cardinality()
        .round() as u64;
    monthly.num_imei_msisdns = hll_union_agg(sketches.iter().map(|s| &s.imei_msisdns_hll))
        .cardinality()
        .round() as u64;
    monthly.num_imsi_msisdns = hll_union_agg(sketches.iter().map(|s| &s.imsi_msisdns_hll))
        .cardinality()
        .round() as u64;
    Ok(())
}

/// Exact monthly counts of rows/pairs/triplets with NULL members.
fn invalid_counts(records: &[TripletRecord], monthly: &mut MonthlyStats) {
    monthly.num_null_imei_records =
        records.iter().filter(|r| r.imei_norm.is_none()).count() as u64;
    monthly.num_null_imsi_records = records.iter().filter(|r| r.imsi.is_none()).count() as u64;
    monthly.num_null_msisdn_records =
        records.iter().filter(|r| r.msisdn.is_none()).count() as u64;

    let mut invalid_imei_imsis: HashSet<(Option<&str>, Option<&str>)> = HashSet::new();
    let mut invalid_imei_msisdns: HashSet<(Option<&str>, Option<&str>)> = HashSet::new();
    let mut invalid_triplets: HashSet<(Option<&str>, Option<&str>, Option<&str>)> = HashSet::new();
    for r in records {
        let imei = r.imei_norm.as_deref();
        let imsi = r.imsi.as_deref();
        let msisdn = r.msisdn.as_deref();
        if imei.is_none() || imsi.is_none() {
            invalid_imei_imsis.insert((imei, imsi));
        }
        if imei.is_none() || msisdn.is_none() {
            invalid_imei_msisdns.insert((imei, msisdn));
        }
        if imei.is_none() || imsi.is_none() || msisdn.is_none() {
            invalid_triplets.insert((imei, imsi, msisdn));
        }
    }
    monthly.num_invalid_imei_imsis = invalid_imei_imsis.len() as u64;
    monthly.num_invalid_imei_msisdns = invalid_imei_msisdns.len() as u64;
    monthly.num_invalid_triplets = invalid_triplets.len() as u64;
}

/// IMEIs first seen network-wide inside the reporting month that also
/// appear in this partition.
fn gross_adds(inputs: &StatInputs<'_>, records: &[TripletRecord]) -> HashSet<String> {
    let (month_start, month_end) = date_range_for_month_year(inputs.year, inputs.month);
    let partition_imeis: HashSet<&str> = records
        .iter()
        .filter_map(|r| r.imei_norm.as_deref())
        .collect();
    partition_imeis
        .into_iter()
        .filter(|imei| {
            inputs
                .first_seen
                .get(*imei)
                .map_or(false, |d| *d >= month_start && *d < month_end)
        })
        .map(String::from)
        .collect()
}

fn top_models_by_imei(inputs: &StatInputs<'_>, records: &[TripletRecord]) -> Vec<TopModel> {
    let mut imeis_by_tac: HashMap<&str, HashSet<&str>> = HashMap::new();
    for r in records {
        if let Some(imei) = r.imei_norm.as_deref() {
            if imei.len() >= 8 {
                imeis_by_tac.entry(&imei[..8]).or_default().insert(imei);
            }
        }
    }
    let tac_counts: HashMap<&str, u64> = imeis_by_tac
        .into_iter()
        .map(|(tac, imeis)| (tac, imeis.len() as u64))
        .collect();
    top_models_from_tac_counts(inputs, &tac_counts)
}

fn top_models_from_set(inputs: &StatInputs<'_>, imeis: &HashSet<String>) -> Vec<TopModel> {
    let mut tac_counts: HashMap<&str, u64> = HashMap::new();
    let mut keys: Vec<&str> = Vec::new();
    for imei in imeis {
        if imei.len() >= 8 {
            keys.push(&imei[..8]);
        }
    }
    for tac in keys {
        *tac_counts.entry(tac).or_default() += 1;
    }
    top_models_from_tac_counts(inputs, &tac_counts)
}

/// Group TAC counts by (manufacturer, model) through the GSMA db, keep the
/// ten largest and tag them with their technology generations.
fn top_models_from_tac_counts(
    inputs: &StatInputs<'_>,
    tac_counts: &HashMap<&str, u64>,
) -> Vec<TopModel> {
    let mut models: HashMap<(String, String), (u64, u32)> = HashMap::new();
    for (tac, count) in tac_counts {
        if let Some(record) = inputs.gsma.get(*tac) {
            if let (Some(manufacturer), Some(model)) =
                (record.manufacturer.clone(), record.model_name.clone())
            {
                let entry = models.entry((manufacturer, model)).or_insert((0, 0));
                entry.0 += count;
                entry.1 |= record.rat_bitmask;
            }
        }
    }
    let mut out: Vec<TopModel> = models
        .into_iter()
        .map(|((manufacturer, model), (imei_count, rat_mask))| TopModel {
            manufacturer,
            model,
            tech_generations: gsma_rat_bitmask_generations(rat_mask).join("/"),
            imei_count,
        })
        .collect();
    out.sort_by(|a, b| {
        b.imei_count
            .cmp(&a.imei_count)
            .then_with(|| a.manufacturer.cmp(&b.manufacturer))
            .then_with(|| a.model.cmp(&b.model))
    });
    out.truncate(10);
    out
}

/// The per-IMEI condition roll-up: per-condition counts, the per-TAC
/// compliance table and the compliance breakdown totals.
fn compliance_data(inputs: &StatInputs<'_>, records: &[TripletRecord], stats: &mut OperatorStats) {
    // Per-IMEI identifier counts within the partition
    struct PerImei {
        imsis: HashSet<String>,
        msisdns: HashSet<String>,
        triplets: u64,
    }
    let mut per_imei: HashMap<String, PerImei> = HashMap::new();
    for r in records {
        let imei = match &r.imei_norm {
            Some(v) => v.clone(),
            None => continue,
        };
        let entry = per_imei.entry(imei).or_insert_with(|| PerImei {
            imsis: HashSet::new(),
            msisdns: HashSet::new(),
            triplets: 0,
        });
        if let Some(imsi) = &r.imsi {
            entry.imsis.insert(imsi.clone());
        }
        if let Some(msisdn) = &r.msisdn {
            entry.msisdns.insert(msisdn.clone());
        }
        if r.imsi.is_some() && r.msisdn.is_some() {
            entry.triplets += 1;
        }
    }

    let gross = gross_adds(inputs, records);
    for (label, _) in inputs.conditions.iter() {
        stats
            .condition_counts
            .insert(label.clone(), ConditionCount::default());
    }

    for (imei, counts) in &per_imei {
        // Active condition vector in sorted condition order
        let active: HashSet<&str> = inputs
            .classification
            .get(imei)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.end_date.is_none())
                    .map(|r| r.cond_name.as_str())
                    .collect()
            })
            .unwrap_or_default();
        let condition_status: Vec<bool> = inputs
            .conditions
            .iter()
            .map(|(label, _)| active.contains(label.as_str()))
            .collect();
        let meets_blocking = inputs
            .conditions
            .iter()
            .zip(&condition_status)
            .any(|((_, blocking), status)| *status && *blocking);
        let meets_any = condition_status.iter().any(|s| *s);
        let compliance_level = if meets_blocking {
            0
        } else if meets_any {
            1
        } else {
            2
        };
        let is_gross_add = gross.contains(imei);

        for (label, _) in inputs.conditions.iter() {
            if active.contains(label.as_str()) {
                let cc = stats.condition_counts.get_mut(label).expect("prepopulated");
                cc.num_imeis += 1;
                cc.num_triplets += counts.triplets;
                cc.num_imei_imsis += counts.imsis.len() as u64;
                cc.num_imei_msisdns += counts.msisdns.len() as u64;
                if is_gross_add {
                    cc.num_imei_gross_adds += 1;
                }
            }
        }

        if imei.len() >= 8 {
            let tac = imei[..8].to_string();
            let entry = stats
                .per_tac_compliance
                .entry(tac)
                .or_default()
                .entry(condition_status.clone())
                .or_default();
            entry.num_imeis += 1;
            entry.num_imei_imsis += counts.imsis.len() as u64;
            entry.num_imei_msisdns += counts.msisdns.len() as u64;
            entry.num_subscriber_triplets += counts.triplets;
            entry.compliance_level = compliance_level;
            if is_gross_add {
                entry.num_imei_gross_adds += 1;
            }
        }

        let monthly = &mut stats.monthly;
        match compliance_level {
            0 => {
                monthly.num_noncompliant_imeis += 1;
                monthly.num_noncompliant_imeis_blocking += 1;
                monthly.num_noncompliant_triplets += counts.triplets;
                monthly.num_noncompliant_triplets_blocking += counts.triplets;
                monthly.num_noncompliant_imei_imsis += counts.imsis.len() as u64;
                monthly.num_noncompliant_imei_imsis_blocking += counts.imsis.len() as u64;
                monthly.num_noncompliant_imei_msisdns += counts.msisdns.len() as u64;
                monthly.num_noncompliant_imei_msisdns_blocking += counts.msisdns.len() as u64;
            }
            1 => {
                monthly.num_noncompliant_imeis += 1;
                monthly.num_noncompliant_imeis_info_only += 1;
                monthly.num_noncompliant_triplets += counts.triplets;
                monthly.num_noncompliant_triplets_info_only += counts.triplets;
                monthly.num_noncompliant_imei_imsis += counts.imsis.len() as u64;
                monthly.num_noncompliant_imei_imsis_info_only += counts.imsis.len() as u64;
                monthly.num_noncompliant_imei_msisdns += counts.msisdns.len() as u64;
                monthly.num_noncompliant_imei_msisdns_info_only += counts.msisdns.len() as u64;
            }
            _ => {
                monthly.num_compliant_imeis += 1;
                monthly.num_compliant_triplets += counts.triplets;
                monthly.num_compliant_imei_imsis += counts.imsis.len() as u64;
                monthly.num_compliant_imei_msisdns += counts.msisdns.len() as u64;
            }
        }
    }
}

/// Histogram of IMEIs by how many distinct IMSIs they were seen with.
fn imei_imsi_overloading(records: &[TripletRecord]) -> Vec<OverloadingBucket> {
    let mut imsis_per_imei: HashMap<&str, HashSet<&str>> = HashMap::new();
    for r in records {
        if let (Some(imei), Some(imsi)) = (r.imei_norm.as_deref(), r.imsi.as_deref()) {
            imsis_per_imei.entry(imei).or_default().insert(imsi);
        }
    }
    bucketize(imsis_per_imei.values().map(|s| s.len() as u64))
}

/// Histogram of IMSIs by how many distinct IMEIs they were seen with.
fn imsi_imei_overloading(records: &[TripletRecord]) -> Vec<OverloadingBucket> {
    let mut imeis_per_imsi: HashMap<&str, HashSet<&str>> = HashMap::new();
    for r in records {
        if let (Some(imei), Some(imsi)) = (r.imei_norm.as_deref(), r.imsi.as_deref()) {
            imeis_per_imsi.entry(imsi).or_default().insert(imei);
        }
    }
    bucketize(imeis_per_imsi.values().map(|s| s.len() as u64))
}

fn bucketize(counts: impl Iterator<Item = u64>) -> Vec<OverloadingBucket> {
    let mut histogram: BTreeMap<u64, u64> = BTreeMap::new();
    for c in counts {
        *histogram.entry(c).or_default() += 1;
    }
    histogram
        .into_iter()
        .map(|(seen_with, count)| OverloadingBucket { seen_with, count })
        .collect()
}

/// Average daily IMEI-IMSI overloading: sum of per-pair day counts divided
/// by the days the IMEI was seen at all, bucketed into `bin_width`-wide
/// bins. IMEIs seen on fewer than `min_seen_days` days are skipped.
fn daily_imei_imsi_overloading(
    records: &[TripletRecord],
    bin_width: f64,
    min_seen_days: u32,
) -> Vec<DailyOverloadingBin> {
    let mut pair_masks: HashMap<(&str, &str), u32> = HashMap::new();
    for r in records {
        if let (Some(imei), Some(imsi)) = (r.imei_norm.as_deref(), r.imsi.as_deref()) {
            if crate::dimensions::is_valid_imsi(imsi) {
                *pair_masks.entry((imei, imsi)).or_default() |= r.date_bitmask;
            }
        }
    }
    let mut per_imei: HashMap<&str, (u32, u64)> = HashMap::new();
    for ((imei, _), mask) in pair_masks {
        let entry = per_imei.entry(imei).or_insert((0u32, 0u64));
        entry.0 |= mask;
        entry.1 += bitcount(mask) as u64;
    }

    let mut bins: BTreeMap<i64, u64> = BTreeMap::new();
    for (_, (seen_mask, pair_days)) in per_imei {
        let days_seen = bitcount(seen_mask);
        if days_seen < min_seen_days {
            continue;
        }
        let ratio = pair_days as f64 / days_seen as f64;
        let bin_id = (ratio / bin_width).floor() as i64;
        *bins.entry(bin_id).or_default() += 1;
    }
    bins.into_iter()
        .map(|(bin_id, num_imeis)| DailyOverloadingBin {
            bin_start: bin_id as f64 * bin_width,
            bin_end: (bin_id + 1) as f64 * bin_width,
            num_imeis,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(imei: Option<&str>, imsi: Option<&str>, msisdn: Option<&str>, mask: u32) -> TripletRecord {
        TripletRecord {
            triplet_year: 2016,
            triplet_month: 7,
            first_seen: NaiveDate::from_ymd_opt(2016, 7, 1).unwrap(),
            last_seen: NaiveDate::from_ymd_opt(2016, 7, 2).unwrap(),
            date_bitmask: mask,
            triplet_hash: crate::shard::hash_triplet(imei, imsi, msisdn),
            imei_norm: imei.map(String::from),
            imsi: imsi.map(String::from),
            msisdn: msisdn.map(String::from),
            operator_id: None,
            virt_imei_shard: crate::shard::calc_virt_imei_shard(imei),
        }
    }

    #[test]
    fn test_invalid_counts() {
        let records = vec![
            record(None, Some("11101511322222"), Some("22200001"), 1),
            record(None, Some("11101511322222"), Some("22200001"), 1),
            record(Some("01234567890123"), None, Some("22200002"), 1),
            record(Some("01234567890123"), Some("11101511322222"), Some("22200003"), 1),
        ];
        let mut monthly = MonthlyStats::default();
        invalid_counts(&records, &mut monthly);
        assert_eq!(monthly.num_null_imei_records, 2);
        assert_eq!(monthly.num_null_imsi_records, 1);
        assert_eq!(monthly.num_null_msisdn_records, 0);
        // Distinct pairs with a NULL member
        assert_eq!(monthly.num_invalid_imei_imsis, 2);
        assert_eq!(monthly.num_invalid_triplets, 2);
    }

    #[test]
    fn test_overloading_histograms() {
        let records = vec![
            record(Some("01234567890123"), Some("11101511322221"), None, 1),
            record(Some("01234567890123"), Some("11101511322222"), None, 1),
            record(Some("99999999999999"), Some("11101511322221"), None, 1),
        ];
        let imei_buckets = imei_imsi_overloading(&records);
        // One IMEI seen with 2 IMSIs, one with 1
        assert_eq!(imei_buckets.len(), 2);
        assert_eq!(imei_buckets[0].seen_with, 1);
        assert_eq!(imei_buckets[0].count, 1);
        assert_eq!(imei_buckets[1].seen_with, 2);
        assert_eq!(imei_buckets[1].count, 1);

        let imsi_buckets = imsi_imei_overloading(&records);
        // One IMSI seen with 2 IMEIs, one with 1
        assert_eq!(imsi_buckets.len(), 2);
    }

    #[test]
    fn test_daily_overloading_bins() {
        // IMEI seen with two IMSIs: pair days 5 + 5, days seen 5 -> ratio 2.0
        let records = vec![
            record(Some("01234567890123"), Some("11101511322221"), None, 0b11111),
            record(Some("01234567890123"), Some("11101511322222"), None, 0b11111),
        ];
        let bins = daily_imei_imsi_overloading(&records, 0.1, 5);
        assert_eq!(bins.len(), 1);
        assert!((bins[0].bin_start - 2.0).abs() < 1e-9);
        assert_eq!(bins[0].num_imeis, 1);

        // Below min_seen_days, nothing is reported
        let sparse = vec![record(
            Some("01234567890123"),
            Some("11101511322221"),
            None,
            0b1,
        )];
        assert!(daily_imei_imsi_overloading(&sparse, 0.1, 5).is_empty());
    }

    #[test]
    fn test_bucketize_orders_ascending() {
        let buckets = bucketize([3u64, 1, 1, 2].into_iter());
        let seen: Vec<u64> = buckets.iter().map(|b| b.seen_with).collect();
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
