// CSV report outputs: per-TAC compliance tables, country-wide lists and
// per-operator violation reports (UTF-8, RFC 4180)
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use tracing::info;

use crate::classify::{self, ClassificationRecord};
use crate::config::{AppConfig, COUNTRY_OPERATOR_NAME};
use crate::dimensions::{AnalysisWindow, DimensionContext, GsmaNotFound};
use crate::importer::compute_analysis_end_date;
use crate::partition::{
    self, monthly_network_triplets_country_partition, physical_imei_shards,
};
use crate::reference::{self, PairingRecord, StolenRecord, SubscriberRecord};
use crate::stats::ReportStats;
use crate::store::Store;
use crate::triplets::scan_triplets;

/// Column headers shared by the per-TAC compliance table and the condition
/// counts table (after the condition labels).
const COMPLIANCE_VALUE_HEADERS: [&str; 6] = [
    "IMEI count",
    "IMEI gross adds count",
    "IMEI-IMSI count",
    "IMEI-MSISDN count",
    "Subscriber triplet count",
    "Compliance Level",
];

fn fmt_count(value: u64) -> String {
    let mut buf = itoa::Buffer::new();
    buf.format(value).to_string()
}

/// Write the standard country report CSVs: the per-TAC compliance table
/// and the condition-combination counts table.
pub fn write_standard_report(
    stats: &ReportStats,
    country_name: &str,
    output_dir: &Path,
) -> Result<Vec<String>> {
    let mut generated = Vec::new();
    let country = match stats.per_operator.get(COUNTRY_OPERATOR_NAME) {
        Some(c) => c,
        None => return Ok(generated),
    };
    let condition_labels: Vec<&str> = stats.conditions.iter().map(|(l, _)| l.as_str()).collect();

    let per_tac_filename = format!("{}_{}_{}.csv", country_name, stats.month, stats.year);
    {
        let mut writer = csv::Writer::from_path(output_dir.join(&per_tac_filename))?;
        let mut header: Vec<&str> = vec!["TAC"];
        header.extend(&condition_labels);
        header.extend(COMPLIANCE_VALUE_HEADERS);
        writer.write_record(&header)?;
        for (tac, combinations) in &country.per_tac_compliance {
            for (combination, row) in combinations {
                let mut record: Vec<String> = vec![tac.clone()];
                record.extend(combination.iter().map(|b| b.to_string()));
                record.push(fmt_count(row.num_imeis));
                record.push(fmt_count(row.num_imei_gross_adds));
                record.push(fmt_count(row.num_imei_imsis));
                record.push(fmt_count(row.num_imei_msisdns));
                record.push(fmt_count(row.num_subscriber_triplets));
                record.push(row.compliance_level.to_string());
                writer.write_record(&record)?;
            }
        }
        writer.flush()?;
    }
    generated.push(per_tac_filename);

    let counts_filename = format!(
        "{}_{}_{}_condition_counts.csv",
        country_name, stats.month, stats.year
    );
    {
        // Roll the per-TAC table up to condition combinations
        let mut combos: BTreeMap<Vec<bool>, crate::stats::TacComplianceStats> = BTreeMap::new();
        for combinations in country.per_tac_compliance.values() {
            for (combination, row) in combinations {
                let entry = combos.entry(combination.clone()).or_default();
                entry.num_imeis += row.num_imeis;
                entry.num_imei_gross_adds += row.num_imei_gross_adds;
                entry.num_imei_imsis += row.num_imei_imsis;
                entry.num_imei_msisdns += row.num_imei_msisdns;
                entry.num_subscriber_triplets += row.num_subscriber_triplets;
                entry.compliance_level = row.compliance_level;
            }
        }
        let mut writer = csv::Writer::from_path(output_dir.join(&counts_filename))?;
        let mut header: Vec<&str> = Vec::new();
        header.extend(&condition_labels);
        header.extend(COMPLIANCE_VALUE_HEADERS);
        writer.write_record(&header)?;
        for (combination, row) in combos {
            let mut record: Vec<String> =
                combination.iter().map(|b| b.to_string()).collect();
            record.push(fmt_count(row.num_imeis));
            record.push(fmt_count(row.num_imei_gross_adds));
            record.push(fmt_count(row.num_imei_imsis));
            record.push(fmt_count(row.num_imei_msisdns));
            record.push(fmt_count(row.num_subscriber_triplets));
            record.push(row.compliance_level.to_string());
            writer.write_record(&record)?;
        }
        writer.flush()?;
    }
    generated.push(counts_filename);
    Ok(generated)
}

/// Country-wide GSMA-not-found report: one IMEI per row, evaluated across
/// every physical shard with default RBI delays.
pub fn write_country_gsma_not_found_report(
    store: &Store,
    config: &AppConfig,
    month: u32,
    year: i32,
    country_name: &str,
    output_dir: &Path,
) -> Result<Vec<String>> {
    let filename = format!("{}_{}_{}_gsma_not_found.csv", country_name, month, year);
    let gsma = {
        let txn = store.begin_read()?;
        reference::scan_gsma(&txn)?
    };
    let analysis_end_date = compute_analysis_end_date(store, None)?;
    let dimension = GsmaNotFound::new(Default::default())?;

    let mut matching: Vec<String> = Vec::new();
    for (_, lo, hi) in physical_imei_shards(store, "network_imeis")? {
        let ctx = DimensionContext {
            store,
            config,
            range_start: lo,
            range_end: hi,
            analysis_end_date,
            gsma: &gsma,
        };
        matching.extend(dimension.matching_imeis(&ctx)?);
    }
    matching.sort();

    let mut writer = csv::Writer::from_path(output_dir.join(&filename))?;
    writer.write_record(["IMEI"])?;
    for imei in matching {
        writer.write_record([imei.as_str()])?;
    }
    writer.flush()?;
    Ok(vec![filename])
}

/// Country-wide duplicates report: IMEIs seen with at least
/// `imsi_min_limit` distinct valid IMSIs in the month, largest first.
pub fn write_country_duplicates_report(
    store: &Store,
    month: u32,
    year: i32,
    country_name: &str,
    output_dir: &Path,
    imsi_min_limit: u64,
) -> Result<Vec<String>> {
    let filename = format!("{}_{}_{}_duplicates.csv", country_name, month, year);
    let txn = store.begin_read()?;
    let base = monthly_network_triplets_country_partition(year, month, "");

    let mut pairs: HashSet<(String, String)> = HashSet::new();
    for (leaf, _, _) in physical_imei_shards(store, &base)? {
        for record in scan_triplets(&txn, &leaf)? {
            if let (Some(imei), Some(imsi)) = (&record.imei_norm, record.imsi.as_deref()) {
                if crate::dimensions::is_valid_imsi(imsi) {
                    pairs.insert((imei.clone(), imsi.to_string()));
                }
            }
        }
    }
    let mut counts: HashMap<String, u64> = HashMap::new();
    for (imei, _) in pairs {
        *counts.entry(imei).or_default() += 1;
    }
    let mut rows: Vec<(String, u64)> = counts
        .into_iter()
        .filter(|(_, c)| *c >= imsi_min_limit)
        .collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut writer = csv::Writer::from_path(output_dir.join(&filename))?;
    writer.write_record(["IMEI", "IMSI count"])?;
    for (imei, count) in rows {
        writer.write_record([imei.as_str(), &fmt_count(count)])?;
    }
    writer.flush()?;
    Ok(vec![filename])
}

/// Per-condition reports of classified IMEIs seen on more than one
/// operator during the month, with the operator list pipe-delimited.
pub fn write_condition_imei_overlaps(
    store: &Store,
    config: &AppConfig,
    month: u32,
    year: i32,
    country_name: &str,
    output_dir: &Path,
) -> Result<Vec<String>> {
    let state = classify::scan_all_classification_state(store)?;
    let txn = store.begin_read()?;

    // IMEI -> operators that saw it this month
    let mut operators_by_imei: HashMap<String, HashSet<String>> = HashMap::new();
    for (leaf, meta) in partition::family_partitions(store, "monthly_network_triplets_per_mno")? {
        let operator = match (&meta.operator_id, meta.year, meta.month) {
            (Some(op), Some(y), Some(m)) if y == year && m == month => op.clone(),
            _ => continue,
        };
        for record in scan_triplets(&txn, &leaf)? {
            if let Some(imei) = &record.imei_norm {
                operators_by_imei
                    .entry(imei.clone())
                    .or_default()
                    .insert(operator.clone());
            }
        }
    }

    let mut filenames = Vec::new();
    for cond in &config.conditions {
        let filename = format!(
            "{}_{}_{}_condition_imei_overlap_{}.csv",
            country_name, month, year, cond.label
        );
        let mut writer = csv::Writer::from_path(output_dir.join(&filename))?;
        writer.write_record(["IMEI", "Operators"])?;

        let mut rows: Vec<(String, String)> = Vec::new();
        for (imei, operators) in &operators_by_imei {
            if operators.len() < 2 {
                continue;
            }
            let active = state
                .get(imei)
                .map(|records| {
                    records
                        .iter()
                        .any(|r| r.cond_name == cond.label && r.end_date.is_none())
                })
                .unwrap_or(false);
            if active {
                let mut ops: Vec<&str> = operators.iter().map(String::as_str).collect();
                ops.sort();
                rows.push((imei.clone(), ops.join("|")));
            }
        }
        rows.sort();
        for (imei, ops) in rows {
            writer.write_record([imei.as_str(), ops.as_str()])?;
        }
        writer.flush()?;
        filenames.push(filename);
    }
    Ok(filenames)
}

/// Per-operator rows keyed by the operator id, in stable order.
fn per_operator_writer<'a>(
    config: &'a AppConfig,
    output_dir: &Path,
    filename_for: impl Fn(&str) -> String,
    header: &[&str],
) -> Result<HashMap<&'a str, csv::Writer<std::fs::File>>> {
    let mut writers = HashMap::new();
    for op in &config.region.operators {
        let mut writer = csv::Writer::from_path(output_dir.join(filename_for(&op.id)))?;
        writer.write_record(header)?;
        writers.insert(op.id.as_str(), writer);
    }
    Ok(writers)
}

/// Stolen list violations: IMEIs observed on the network later than their
/// reporting date plus the configured grace period.
pub fn write_stolen_violations(
    store: &Store,
    config: &AppConfig,
    report_dir: &Path,
    filter_by_conditions: &[String],
    newer_than: Option<NaiveDate>,
) -> Result<Vec<String>> {
    info!("Generating per-MNO stolen list violations reports...");
    let grace_days = config.report.blacklist_violations_grace_period_days as i64;

    let txn = store.begin_read()?;
    let stolen: HashMap<String, Vec<StolenRecord>> =
        reference::active_entries(&txn, reference::STOLEN_TABLE)?;
    let min_reporting: HashMap<&str, NaiveDate> = stolen
        .iter()
        .filter_map(|(imei, rows)| {
            rows.iter()
                .filter_map(|r| r.reporting_date)
                .min()
                .map(|d| (imei.as_str(), d))
        })
        .collect();

    let state = classify::scan_all_classification_state(store)?;

    // (imei, operator) -> max last_seen across all months
    let mut last_seen: HashMap<(String, String), NaiveDate> = HashMap::new();
    for (leaf, meta) in partition::family_partitions(store, "monthly_network_triplets_per_mno")? {
        let operator = match &meta.operator_id {
            Some(op) => op.clone(),
            None => continue,
        };
        for record in scan_triplets(&txn, &leaf)? {
            if let Some(imei) = &record.imei_norm {
                if !min_reporting.contains_key(imei.as_str()) {
                    continue;
                }
                let entry = last_seen
                    .entry((imei.clone(), operator.clone()))
                    .or_insert(record.last_seen);
                *entry = (*entry).max(record.last_seen);
            }
        }
    }

    let mut writers = per_operator_writer(
        config,
        report_dir,
        |op| format!("stolen_violations_{}.csv", op),
        &["imei_norm", "last_seen", "reporting_date"],
    )?;

    let mut rows: Vec<(String, String, NaiveDate, NaiveDate)> = Vec::new();
    for ((imei, operator), seen) in last_seen {
        let reporting_date = min_reporting[imei.as_str()];
        if seen <= reporting_date + Duration::days(grace_days) {
            continue;
        }
        if let Some(cutoff) = newer_than {
            if seen <= cutoff {
                continue;
            }
        }
        if !filter_by_conditions.is_empty() {
            let matches = state
                .get(&imei)
                .map(|records| {
                    records.iter().any(|r| {
                        r.end_date.is_none() && filter_by_conditions.contains(&r.cond_name)
                    })
                })
                .unwrap_or(false);
            if !matches {
                continue;
            }
        }
        rows.push((imei, operator, seen, reporting_date));
    }
    rows.sort();
    for (imei, operator, seen, reporting_date) in rows {
        if let Some(writer) = writers.get_mut(operator.as_str()) {
            writer.write_record([
                imei.as_str(),
                &seen.format("%Y%m%d").to_string(),
                &reporting_date.format("%Y%m%d").to_string(),
            ])?;
        }
    }
    let mut filenames = Vec::new();
    for op in &config.region.operators {
        writers.remove(op.id.as_str()).unwrap().flush()?;
        filenames.push(format!("stolen_violations_{}.csv", op.id));
    }
    Ok(filenames)
}

/// Blacklist violations: blocked IMEIs seen on the network after their
/// block date during the reporting month.
pub fn write_blacklist_violations(
    store: &Store,
    config: &AppConfig,
    report_dir: &Path,
    month: u32,
    year: i32,
) -> Result<Vec<String>> {
    info!("Generating per-MNO blacklist violations...");
    let state = classify::scan_all_classification_state(store)?;
    let blocked: HashMap<&str, NaiveDate> = state
        .iter()
        .filter_map(|(imei, records)| {
            records
                .iter()
                .filter(|r| r.end_date.is_none())
                .filter_map(|r| r.block_date)
                .min()
                .map(|d| (imei.as_str(), d))
        })
        .collect();

    let txn = store.begin_read()?;
    let mut writers = per_operator_writer(
        config,
        report_dir,
        |op| format!("blacklist_violations_{}.csv", op),
        &["imei", "last_seen"],
    )?;

    for (leaf, meta) in partition::family_partitions(store, "monthly_network_triplets_per_mno")? {
        let operator = match (&meta.operator_id, meta.year, meta.month) {
            (Some(op), Some(y), Some(m)) if y == year && m == month => op.clone(),
            _ => continue,
        };
        for record in scan_triplets(&txn, &leaf)? {
            let imei = match &record.imei_norm {
                Some(v) => v,
                None => continue,
            };
            if let Some(block_date) = blocked.get(imei.as_str()) {
                if record.last_seen > *block_date {
                    if let Some(writer) = writers.get_mut(operator.as_str()) {
                        writer.write_record([imei.as_str(), &record.last_seen.to_string()])?;
                    }
                }
            }
        }
    }
    let mut filenames = Vec::new();
    for op in &config.region.operators {
        writers.remove(op.id.as_str()).unwrap().flush()?;
        filenames.push(format!("blacklist_violations_{}.csv", op.id));
    }
    Ok(filenames)
}

/// Association list violations: month observations whose (IMEI, IMSI) has
/// no backing device association joined through registered subscribers.
pub fn write_association_violations(
    store: &Store,
    config: &AppConfig,
    report_dir: &Path,
    month: u32,
    year: i32,
) -> Result<Vec<String>> {
    info!("Generating per-MNO association list violations...");
    let txn = store.begin_read()?;

    // uid -> imsis of registered subscribers
    let subscribers: HashMap<String, Vec<SubscriberRecord>> =
        reference::active_entries(&txn, reference::SUBSCRIBERS_TABLE)?;
    let mut imsis_by_uid: HashMap<&str, HashSet<&str>> = HashMap::new();
    for (imsi, records) in &subscribers {
        for record in records {
            imsis_by_uid
                .entry(record.uid.as_str())
                .or_default()
                .insert(imsi.as_str());
        }
    }

    // Allowed (imei, imsi) pairs via the association list
    let mut allowed: HashSet<(String, String)> = HashSet::new();
    for (leaf, _, _) in physical_imei_shards(store, reference::ASSOCIATION_BASE)? {
        let associations: HashMap<String, Vec<reference::AssociationRecord>> =
            reference::active_entries(&txn, &leaf)?;
        for (imei, records) in associations {
            for record in records {
                if let Some(imsis) = imsis_by_uid.get(record.uid.as_str()) {
                    for imsi in imsis {
                        allowed.insert((imei.clone(), imsi.to_string()));
                    }
                }
            }
        }
    }

    let mut writers = per_operator_writer(
        config,
        report_dir,
        |op| format!("association_violations_{}.csv", op),
        &["imei", "imsi", "msisdn", "first_seen", "last_seen"],
    )?;

    for (leaf, meta) in partition::family_partitions(store, "monthly_network_triplets_per_mno")? {
        let operator = match (&meta.operator_id, meta.year, meta.month) {
            (Some(op), Some(y), Some(m)) if y == year && m == month => op.clone(),
            _ => continue,
        };
        for record in scan_triplets(&txn, &leaf)? {
            let (imei, imsi) = match (&record.imei_norm, &record.imsi) {
                (Some(imei), Some(imsi)) => (imei.clone(), imsi.clone()),
                _ => continue,
            };
            if allowed.contains(&(imei.clone(), imsi.clone())) {
                continue;
            }
            if let Some(writer) = writers.get_mut(operator.as_str()) {
                writer.write_record([
                    imei.as_str(),
                    imsi.as_str(),
                    record.msisdn.as_deref().unwrap_or(""),
                    &record.first_seen.to_string(),
                    &record.last_seen.to_string(),
                ])?;
            }
        }
    }
    let mut filenames = Vec::new();
    for op in &config.region.operators {
        writers.remove(op.id.as_str()).unwrap().flush()?;
        filenames.push(format!("association_violations_{}.csv", op.id));
    }
    Ok(filenames)
}

/// Paired (IMEI, IMSI) combinations not seen on the network since the
/// given date.
pub fn write_non_active_pairs(
    store: &Store,
    report_dir: &Path,
    last_seen_date: NaiveDate,
) -> Result<Vec<String>> {
    info!("Generating Non-Active Pairs report...");
    let filename = format!("non_active_pairs_{}.csv", last_seen_date);
    let txn = store.begin_read()?;
    let pairings: HashMap<String, Vec<PairingRecord>> =
        reference::active_entries(&txn, reference::PAIRING_TABLE)?;

    // (imei, imsi) -> max last_seen over all country months
    let mut network_last_seen: HashMap<(String, String), NaiveDate> = HashMap::new();
    for (leaf, _) in partition::family_partitions(store, "monthly_network_triplets_country")? {
        for record in scan_triplets(&txn, &leaf)? {
            if let (Some(imei), Some(imsi)) = (&record.imei_norm, &record.imsi) {
                let key = (imei.clone(), imsi.clone());
                let entry = network_last_seen.entry(key).or_insert(record.last_seen);
                *entry = (*entry).max(record.last_seen);
            }
        }
    }

    let mut writer = csv::Writer::from_path(report_dir.join(&filename))?;
    writer.write_record(["imei_norm", "imsi", "last_seen"])?;
    let mut rows: Vec<(String, String, NaiveDate)> = Vec::new();
    for (imei, records) in &pairings {
        for pairing in records {
            if let Some(seen) = network_last_seen.get(&(imei.clone(), pairing.imsi.clone())) {
                if *seen < last_seen_date {
                    rows.push((imei.clone(), pairing.imsi.clone(), *seen));
                }
            }
        }
    }
    rows.sort();
    for (imei, imsi, seen) in rows {
        writer.write_record([imei.as_str(), imsi.as_str(), &seen.to_string()])?;
    }
    writer.flush()?;
    Ok(vec![filename])
}

/// Per-operator IMSIs observed on the network with no subscriber
/// registration.
pub fn write_unregistered_subscribers(
    store: &Store,
    config: &AppConfig,
    report_dir: &Path,
    newer_than: Option<NaiveDate>,
) -> Result<Vec<String>> {
    info!("Generating per-MNO unregistered subscribers list...");
    let txn = store.begin_read()?;
    let subscribers: HashMap<String, Vec<SubscriberRecord>> =
        reference::active_entries(&txn, reference::SUBSCRIBERS_TABLE)?;

    let mut writers = per_operator_writer(
        config,
        report_dir,
        |op| format!("unregistered_subscribers_{}.csv", op),
        &["imsi", "first_seen", "last_seen"],
    )?;

    for (leaf, meta) in partition::family_partitions(store, "monthly_network_triplets_per_mno")? {
        let operator = match &meta.operator_id {
            Some(op) => op.clone(),
            None => continue,
        };
        for record in scan_triplets(&txn, &leaf)? {
            if record.imei_norm.is_none() {
                continue;
            }
            let imsi = match &record.imsi {
                Some(v) => v,
                None => continue,
            };
            if subscribers.contains_key(imsi) {
                continue;
            }
            if let Some(cutoff) = newer_than {
                if record.last_seen <= cutoff {
                    continue;
                }
            }
            if let Some(writer) = writers.get_mut(operator.as_str()) {
                writer.write_record([
                    imsi.as_str(),
                    &record.first_seen.format("%Y%m%d").to_string(),
                    &record.last_seen.format("%Y%m%d").to_string(),
                ])?;
            }
        }
    }
    let mut filenames = Vec::new();
    for op in &config.region.operators {
        writers.remove(op.id.as_str()).unwrap().flush()?;
        filenames.push(format!("unregistered_subscribers_{}.csv", op.id));
    }
    Ok(filenames)
}

/// Per-condition triplets whose IMEI is currently classified.
pub fn write_classified_triplets(
    store: &Store,
    conditions: &[String],
    report_dir: &Path,
) -> Result<Vec<String>> {
    info!("Generating per-condition classified triplets list...");
    let state = classify::scan_all_classification_state(store)?;
    let txn = store.begin_read()?;

    let mut writers: HashMap<&str, csv::Writer<std::fs::File>> = HashMap::new();
    for cond in conditions {
        let mut writer =
            csv::Writer::from_path(report_dir.join(format!("classified_triplets_{}.csv", cond)))?;
        writer.write_record(["imei", "imsi", "msisdn", "operator"])?;
        writers.insert(cond.as_str(), writer);
    }

    for (leaf, meta) in partition::family_partitions(store, "monthly_network_triplets_per_mno")? {
        let operator = match &meta.operator_id {
            Some(op) => op.clone(),
            None => continue,
        };
        for record in scan_triplets(&txn, &leaf)? {
            let imei = match &record.imei_norm {
                Some(v) => v,
                None => continue,
            };
            let active: Vec<&ClassificationRecord> = match state.get(imei) {
                Some(records) => records
                    .iter()
                    .filter(|r| r.end_date.is_none() && conditions.contains(&r.cond_name))
                    .collect(),
                None => continue,
            };
            for row in active {
                if let Some(writer) = writers.get_mut(row.cond_name.as_str()) {
                    writer.write_record([
                        imei.as_str(),
                        record.imsi.as_deref().unwrap_or(""),
                        record.msisdn.as_deref().unwrap_or(""),
                        operator.as_str(),
                    ])?;
                }
            }
        }
    }
    let mut filenames = Vec::new();
    for cond in conditions {
        writers.remove(cond.as_str()).unwrap().flush()?;
        filenames.push(format!("classified_triplets_{}.csv", cond));
    }
    Ok(filenames)
}

/// True when the sorted values are consecutive integers.
pub fn have_consecutive_numbers(values: &[u64]) -> bool {
    if values.len() < 2 {
        return false;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let total_diff: u64 = sorted.windows(2).map(|w| w[1] - w[0]).sum();
    total_diff == (values.len() - 1) as u64
}

/// True when all pairwise differences equal the first difference.
pub fn is_arithmetic_series(values: &[u64]) -> bool {
    if values.len() < 2 {
        return false;
    }
    let step = values[1].wrapping_sub(values[0]);
    values.windows(2).all(|w| w[1].wrapping_sub(w[0]) == step)
}

/// Possible transient MSISDNs: seen with many IMEIs per day on average,
/// where the IMEI or TAC sequences look fabricated (identical, consecutive
/// or arithmetic).
pub fn write_transient_msisdns(
    store: &Store,
    config: &AppConfig,
    report_dir: &Path,
    period_days: i64,
    num_of_imeis: u64,
    curr_date: Option<NaiveDate>,
) -> Result<Vec<String>> {
    info!("Generating per-operator possible transient MSISDNs list...");
    let analysis_end_date = compute_analysis_end_date(store, curr_date)?;
    let window = AnalysisWindow::from_period(analysis_end_date, Some(period_days), None);

    let txn = store.begin_read()?;

    // Per (msisdn, operator): observation-day totals; per msisdn: IMEIs
    let mut day_counts: HashMap<(String, String), u64> = HashMap::new();
    let mut imeis_per_msisdn: HashMap<String, HashSet<String>> = HashMap::new();
    for (leaf, meta) in partition::family_partitions(store, "monthly_network_triplets_per_mno")? {
        let operator = match &meta.operator_id {
            Some(op) => op.clone(),
            None => continue,
        };
        for record in scan_triplets(&txn, &leaf)? {
            let msisdn = match record.msisdn.as_deref() {
                Some(v) if crate::dimensions::is_valid_msisdn(v) => v.to_string(),
                _ => continue,
            };
            if record.last_seen < window.start || record.first_seen >= window.end {
                continue;
            }
            let mask = crate::triplets::bitmask_within_window(
                record.date_bitmask,
                record.triplet_year,
                record.triplet_month,
                window.start,
                window.end,
            );
            if mask == 0 {
                continue;
            }
            *day_counts
                .entry((msisdn.clone(), operator.clone()))
                .or_default() += crate::triplets::bitcount(mask) as u64;
            if let Some(imei) = &record.imei_norm {
                imeis_per_msisdn
                    .entry(msisdn)
                    .or_default()
                    .insert(imei.clone());
            }
        }
    }

    let mut writers = per_operator_writer(
        config,
        report_dir,
        |op| format!("transient_msisdns_{}.csv", op),
        &["msisdn"],
    )?;

    let mut candidates: Vec<(String, String)> = day_counts
        .into_iter()
        .filter(|(_, count)| count / period_days as u64 >= num_of_imeis)
        .map(|((msisdn, operator), _)| (msisdn, operator))
        .collect();
    candidates.sort();

    for (msisdn, operator) in candidates {
        let imei_list: Vec<u64> = imeis_per_msisdn
            .get(&msisdn)
            .map(|imeis| {
                let mut numeric: Vec<u64> = imeis
                    .iter()
                    .filter_map(|imei| imei.parse::<u64>().ok())
                    .collect();
                numeric.sort_unstable();
                numeric
            })
            .unwrap_or_default();
        if imei_list.is_empty() {
            continue;
        }
        let tac_list: Vec<u64> = imei_list.iter().map(|imei| imei / 1_000_000).collect();

        let identical_tac = tac_list.iter().collect::<HashSet<_>>().len() == 1;
        let suspicious = identical_tac
            || have_consecutive_numbers(&tac_list)
            || is_arithmetic_series(&tac_list)
            || have_consecutive_numbers(&imei_list)
            || is_arithmetic_series(&imei_list);
        if suspicious {
            if let Some(writer) = writers.get_mut(operator.as_str()) {
                writer.write_record([msisdn.as_str()])?;
            }
        }
    }
    let mut filenames = Vec::new();
    for op in &config.region.operators {
        writers.remove(op.id.as_str()).unwrap().flush()?;
        filenames.push(format!("transient_msisdns_{}.csv", op.id));
    }
    Ok(filenames)
}
