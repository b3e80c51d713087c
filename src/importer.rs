// Operator data importer: filename checks, staging validation, thresholded
// quality gates and the copy stage into the sharded triplet store
use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, Utc};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::{AppConfig, ImportThresholds, OperatorConfig};
use crate::error::{retry_transient, ValidationError};
use crate::job::JobRecorder;
use crate::partition::{
    self, monthly_network_triplets_country_partition, monthly_network_triplets_per_mno_partition,
    FILLFACTOR_WRITABLE,
};
use crate::reference;
use crate::shard::{calc_virt_imei_shard, imei_shard_name, normalize_imei};
use crate::sketches::{build_daily_sketches, merge_daily_sketches};
use crate::store::Store;
use crate::triplets::{
    aggregate_network_imeis, aggregate_staging_rows, merge_network_imeis, merge_triplets,
    triplet_partition_len, MergeOutcome, StagingRow,
};

/// Which gates and columns an operator import runs with. Every check can be
/// disabled individually, with a warning.
#[derive(Debug, Clone)]
pub struct OperatorImportOptions {
    pub thresholds: ImportThresholds,
    pub perform_msisdn_import: bool,
    pub perform_rat_import: bool,
    pub perform_file_daterange_check: bool,
    pub perform_leading_zero_check: bool,
    pub perform_null_checks: bool,
    pub perform_unclean_checks: bool,
    pub perform_region_checks: bool,
    pub perform_home_network_check: bool,
    pub perform_historic_checks: bool,
}

impl Default for OperatorImportOptions {
    fn default() -> Self {
        OperatorImportOptions {
            thresholds: ImportThresholds::default(),
            perform_msisdn_import: true,
            perform_rat_import: true,
            perform_file_daterange_check: true,
            perform_leading_zero_check: true,
            perform_null_checks: true,
            perform_unclean_checks: true,
            perform_region_checks: true,
            perform_home_network_check: true,
            perform_historic_checks: true,
        }
    }
}

/// Outcome of one validation gate.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub observed: f64,
    pub threshold: f64,
    pub metric_key: &'static str,
}

#[derive(Debug, Clone)]
pub struct OperatorImportOutcome {
    pub run_id: u64,
    pub rows_in_file: u64,
    pub invalid_rows_imported: u64,
    pub distinct_triplets: u64,
    pub triplets_inserted: u64,
    pub triplets_updated: u64,
    pub checks: Vec<CheckOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorFilenameInfo {
    pub operator_id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Parse and validate `<operator>_<YYYYMMDD>_<YYYYMMDD>` out of an operator
/// data dump filename. The payload may be a bare or gzipped CSV (archive
/// unpacking happens upstream of the engine).
pub fn perform_operator_filename_checks(
    filename: &str,
    expected_operator: &str,
) -> Result<OperatorFilenameInfo> {
    let mut stem = filename;
    for ext in [".gz", ".csv", ".zip"] {
        if let Some(s) = stem.strip_suffix(ext) {
            stem = s;
        }
    }
    let mut parts = stem.rsplitn(3, '_');
    let (end_str, start_str, operator_part) =
        match (parts.next(), parts.next(), parts.next()) {
            (Some(e), Some(s), Some(op)) if !op.is_empty() => (e, s, op),
            _ => {
                return Err(ValidationError::FilenameCheck(format!(
                    "Operator data filename {} does not match expected pattern \
                     <operator>_<YYYYMMDD>_<YYYYMMDD>",
                    filename
                ))
                .into())
            }
        };

    let parse = |s: &str, which: &str| -> Result<NaiveDate> {
        NaiveDate::parse_from_str(s, "%Y%m%d").map_err(|_| {
            ValidationError::FilenameCheck(format!(
                "Invalid {} date '{}' in operator data filename {}",
                which, s, filename
            ))
            .into()
        })
    };
    let start_date = parse(start_str, "start")?;
    let end_date = parse(end_str, "end")?;
    if start_date > end_date {
        return Err(ValidationError::FilenameCheck(format!(
            "Start date is later than end date in operator data filename {}",
            filename
        ))
        .into());
    }

    if !operator_part.eq_ignore_ascii_case(expected_operator) {
        return Err(ValidationError::FilenameCheck(format!(
            "Operator ID {} in filename does not match expected operator ID {}",
            operator_part, expected_operator
        ))
        .into());
    }
    if operator_part != expected_operator {
        warn!(
            "Operator ID {} in filename only matches {} after case normalization",
            operator_part, expected_operator
        );
    }

    Ok(OperatorFilenameInfo {
        operator_id: expected_operator.to_string(),
        start_date,
        end_date,
    })
}

fn is_valid_raw_imei(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 16
        && value
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '*' || c == '#')
}

fn is_valid_imsi(value: &str) -> bool {
    !value.is_empty() && value.len() <= 15 && value.chars().all(|c| c.is_ascii_digit())
}

fn is_valid_msisdn(value: &str) -> bool {
    is_valid_imsi(value)
}

fn is_valid_rat(value: &str) -> bool {
    !value.is_empty()
        && value.split('|').all(|code| {
            code.len() == 3
                && (code.starts_with("00") || code.starts_with("10"))
                && crate::triplets::rat_code_operator_rank(code).is_some()
        })
}

/// Strict integrity rules, tighter than the ingest regexes: a clean IMEI is
/// exactly 14 digits after normalization.
pub fn is_unclean_imei(imei_norm: &str) -> bool {
    imei_norm.len() != 14 || !imei_norm.chars().all(|c| c.is_ascii_digit())
}

/// A clean IMSI is 14 or 15 digits.
pub fn is_unclean_imsi(imsi: &str) -> bool {
    imsi.len() < 14 || imsi.len() > 15 || !imsi.chars().all(|c| c.is_ascii_digit())
}

fn starts_with_any(value: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| value.starts_with(p.as_str()))
}

/// Read and validate the dump CSV into staging rows. Malformed fields abort
/// the import, naming the column, line and value. Also reports whether the
/// optional msisdn/rat columns were present at all.
fn load_staging_rows(
    path: &Path,
    options: &OperatorImportOptions,
) -> Result<(Vec<StagingRow>, bool, bool)> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open operator data dump {:?}", path))?;
    let reader: Box<dyn std::io::Read> =
        if path.extension().and_then(|e| e.to_str()) == Some("gz") {
            Box::new(flate2::read::GzDecoder::new(file))
        } else {
            Box::new(file)
        };
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = reference::HeaderMap::new(&csv_reader.headers()?.clone());
    headers.require(&["date", "imei"])?;
    for header in csv_reader.headers()?.iter() {
        let known = ["date", "imei", "imsi", "msisdn", "rat"]
            .contains(&header.trim().to_lowercase().as_str());
        if !known {
            return Err(ValidationError::PrevalidationCheck(format!(
                "Unexpected CSV header '{}' in operator data dump",
                header
            ))
            .into());
        }
    }
    let has_msisdn = headers.contains("msisdn");
    let has_rat = headers.contains("rat");

    let mut rows = Vec::new();
    for (idx, record) in csv_reader.records().enumerate() {
        let record = record?;
        let line = (idx + 2) as u64; // header is line 1

        let date_str = headers.get(&record, "date").ok_or_else(|| {
            ValidationError::MalformedField {
                column: "date",
                value: String::new(),
                line,
            }
        })?;
        let connection_date = NaiveDate::parse_from_str(date_str, "%Y%m%d").map_err(|_| {
            ValidationError::MalformedField {
                column: "date",
                value: date_str.to_string(),
                line,
            }
        })?;

        let imei = headers.get(&record, "imei").map(str::to_string);
        if let Some(v) = &imei {
            if !is_valid_raw_imei(v) {
                return Err(ValidationError::MalformedField {
                    column: "imei",
                    value: v.clone(),
                    line,
                }
                .into());
            }
        }
        let imsi = headers.get(&record, "imsi").map(str::to_string);
        if let Some(v) = &imsi {
            if !is_valid_imsi(v) {
                return Err(ValidationError::MalformedField {
                    column: "imsi",
                    value: v.clone(),
                    line,
                }
                .into());
            }
        }
        let msisdn = headers.get(&record, "msisdn").map(str::to_string);
        if let Some(v) = &msisdn {
            if !is_valid_msisdn(v) {
                return Err(ValidationError::MalformedField {
                    column: "msisdn",
                    value: v.clone(),
                    line,
                }
                .into());
            }
        }
        let rat = if options.perform_rat_import {
            let value = headers.get(&record, "rat").map(str::to_string);
            if let Some(v) = &value {
                if !is_valid_rat(v) {
                    return Err(ValidationError::MalformedField {
                        column: "rat",
                        value: v.clone(),
                        line,
                    }
                    .into());
                }
            }
            value
        } else {
            None
        };

        let imei_norm = imei.as_deref().map(normalize_imei);
        let virt_imei_shard = calc_virt_imei_shard(imei_norm.as_deref());
        rows.push(StagingRow {
            imei,
            imei_norm,
            imsi,
            msisdn: if options.perform_msisdn_import {
                msisdn
            } else {
                None
            },
            rat,
            connection_date,
            virt_imei_shard,
        });
    }
    Ok((rows, has_msisdn, has_rat))
}

struct CheckContext<'a> {
    rows: &'a [StagingRow],
    options: &'a OperatorImportOptions,
    operator: &'a OperatorConfig,
    region_mccs: Vec<String>,
    country_codes: Vec<String>,
}

fn ratio_check(
    name: &str,
    metric_key: &'static str,
    failing: u64,
    total: u64,
    threshold: f64,
) -> CheckOutcome {
    let observed = failing as f64 / total as f64;
    CheckOutcome {
        name: name.to_string(),
        passed: observed <= threshold,
        observed,
        threshold,
        metric_key,
    }
}

/// The binary pre-checks: data date range and leading-zero detection.
/// These fail with a message rather than a ratio.
fn binary_validation_checks(
    ctx: &CheckContext<'_>,
    store: &Store,
    filename_info: &OperatorFilenameInfo,
    today: NaiveDate,
) -> Result<()> {
    if ctx.options.perform_file_daterange_check {
        if filename_info.end_date > today {
            return Err(ValidationError::PrevalidationCheck(
                "End date on operator data dump file is in the future (later than current \
                 system date)"
                    .to_string(),
            )
            .into());
        }
        let out_of_range = ctx
            .rows
            .iter()
            .filter(|r| {
                r.connection_date < filename_info.start_date
                    || r.connection_date > filename_info.end_date
            })
            .count();
        if out_of_range > 0 {
            return Err(ValidationError::PrevalidationCheck(format!(
                "{} records are outside the date range supplied by the filename",
                out_of_range
            ))
            .into());
        }
        info!("Data date range check passed");
    } else {
        warn!("Skipped file date range check due to command-line option");
    }

    if ctx.options.perform_leading_zero_check {
        let leading_zero_count = ctx
            .rows
            .iter()
            .filter(|r| r.imei.as_deref().map_or(false, |v| v.starts_with('0')))
            .count() as u64;
        let leading_one_count = ctx
            .rows
            .iter()
            .filter(|r| r.imei.as_deref().map_or(false, |v| v.starts_with('1')))
            .count() as u64;
        if leading_one_count > leading_zero_count {
            return Err(ValidationError::PrevalidationCheck(
                "Failed leading zero check - suspect leading 0s have been removed from IMEIs. \
                 Import aborted - no rows have been imported."
                    .to_string(),
            )
            .into());
        }

        // IMEIs starting with 1 whose 7-digit prefix matches a GSMA TAC
        // with a stripped leading zero
        let txn = store.begin_read()?;
        let gsma = reference::scan_gsma(&txn)?;
        let suspect_count = ctx
            .rows
            .iter()
            .filter(|r| {
                r.imei.as_deref().map_or(false, |v| {
                    v.starts_with('1') && v.len() >= 7 && {
                        let candidate = format!("0{}", &v[..7]);
                        gsma.contains_key(candidate.as_str())
                    }
                })
            })
            .count() as u64;
        let limit = ctx.options.thresholds.leading_zero_suspect_limit;
        if leading_one_count > 1 && suspect_count as f64 / leading_one_count as f64 > limit {
            return Err(ValidationError::PrevalidationCheck(
                "Too many IMEIs that start with 1 match the TAC DB when prepended with 0"
                    .to_string(),
            )
            .into());
        }
        info!("Leading zero check passed");
    } else {
        warn!("Skipped leading zero check due to command-line option");
    }
    Ok(())
}

/// All ratio-thresholded gates. Returns every outcome; the first failure
/// aborts the import afterwards.
fn threshold_validation_checks(ctx: &CheckContext<'_>) -> Vec<CheckOutcome> {
    let mut checks = Vec::new();
    let total = ctx.rows.len() as u64;
    if total == 0 {
        warn!("Skipped threshold checks due to zero rows in input data");
        return checks;
    }
    let t = &ctx.options.thresholds;

    if ctx.options.perform_null_checks {
        let null_imei = ctx.rows.iter().filter(|r| r.imei_norm.is_none()).count() as u64;
        checks.push(ratio_check(
            "NULL IMEI data",
            "null_imei_norm",
            null_imei,
            total,
            t.null_imei_threshold,
        ));
        let null_imsi = ctx.rows.iter().filter(|r| r.imsi.is_none()).count() as u64;
        checks.push(ratio_check(
            "NULL IMSI data",
            "null_imsi",
            null_imsi,
            total,
            t.null_imsi_threshold,
        ));
        if ctx.options.perform_msisdn_import {
            let null_msisdn = ctx.rows.iter().filter(|r| r.msisdn.is_none()).count() as u64;
            checks.push(ratio_check(
                "NULL MSISDN data",
                "null_msisdn",
                null_msisdn,
                total,
                t.null_msisdn_threshold,
            ));
        } else {
            warn!("Skipped NULL MSISDN data threshold check due to disabled MSISDN import");
        }
        if ctx.options.perform_rat_import {
            let null_rat = ctx.rows.iter().filter(|r| r.rat.is_none()).count() as u64;
            checks.push(ratio_check(
                "NULL RAT data",
                "null_rat",
                null_rat,
                total,
                t.null_rat_threshold,
            ));
        } else {
            warn!("Skipped NULL RAT data threshold check due to disabled RAT import");
        }
        let null_any = ctx
            .rows
            .iter()
            .filter(|r| {
                r.imei_norm.is_none()
                    || r.imsi.is_none()
                    || (ctx.options.perform_msisdn_import && r.msisdn.is_none())
                    || (ctx.options.perform_rat_import && r.rat.is_none())
            })
            .count() as u64;
        checks.push(ratio_check(
            "NULL data (combined)",
            "null",
            null_any,
            total,
            t.null_threshold,
        ));
    } else {
        warn!("Skipped NULL data threshold checks due to command-line option");
    }

    if ctx.options.perform_unclean_checks {
        let unclean_imei = ctx
            .rows
            .iter()
            .filter(|r| r.imei_norm.as_deref().map_or(false, is_unclean_imei))
            .count() as u64;
        checks.push(ratio_check(
            "unclean IMEI data",
            "unclean_imei",
            unclean_imei,
            total,
            t.unclean_imei_threshold,
        ));
        let unclean_imsi = ctx
            .rows
            .iter()
            .filter(|r| r.imsi.as_deref().map_or(false, is_unclean_imsi))
            .count() as u64;
        checks.push(ratio_check(
            "unclean IMSI data",
            "unclean_imsi",
            unclean_imsi,
            total,
            t.unclean_imsi_threshold,
        ));
        let unclean_any = ctx
            .rows
            .iter()
            .filter(|r| {
                r.imei_norm.as_deref().map_or(false, is_unclean_imei)
                    || r.imsi.as_deref().map_or(false, is_unclean_imsi)
            })
            .count() as u64;
        checks.push(ratio_check(
            "unclean data (combined)",
            "unclean",
            unclean_any,
            total,
            t.unclean_threshold,
        ));
    } else {
        warn!("Skipped unclean data threshold checks due to command-line option");
    }

    if ctx.options.perform_region_checks {
        let oor_imsi = ctx
            .rows
            .iter()
            .filter(|r| {
                r.imsi
                    .as_deref()
                    .map_or(false, |v| !starts_with_any(v, &ctx.region_mccs))
            })
            .count() as u64;
        checks.push(ratio_check(
            "out-of-region IMSI data",
            "out_of_region_imsi",
            oor_imsi,
            total,
            t.out_of_region_imsi_threshold,
        ));
        if ctx.options.perform_msisdn_import {
            let oor_msisdn = ctx
                .rows
                .iter()
                .filter(|r| {
                    r.msisdn
                        .as_deref()
                        .map_or(false, |v| !starts_with_any(v, &ctx.country_codes))
                })
                .count() as u64;
            checks.push(ratio_check(
                "out-of-region MSISDN data",
                "out_of_region_msisdn",
                oor_msisdn,
                total,
                t.out_of_region_msisdn_threshold,
            ));
            let oor_any = ctx
                .rows
                .iter()
                .filter(|r| {
                    r.imsi
                        .as_deref()
                        .map_or(false, |v| !starts_with_any(v, &ctx.region_mccs))
                        || r.msisdn
                            .as_deref()
                            .map_or(false, |v| !starts_with_any(v, &ctx.country_codes))
                })
                .count() as u64;
            checks.push(ratio_check(
                "out-of-region data (combined)",
                "out_of_region",
                oor_any,
                total,
                t.out_of_region_threshold,
            ));
        } else {
            warn!("Skipped out-of-region MSISDN data threshold check due to disabled MSISDN import");
        }
    } else {
        warn!("Skipped out-of-region data threshold checks due to command-line option");
    }

    if ctx.options.perform_home_network_check {
        let home_prefixes = ctx.operator.mcc_mnc_prefixes();
        let non_home = ctx
            .rows
            .iter()
            .filter(|r| {
                r.imsi
                    .as_deref()
                    .map_or(false, |v| !starts_with_any(v, &home_prefixes))
            })
            .count() as u64;
        checks.push(ratio_check(
            "non-home network IMSI data",
            "non_home_imsi",
            non_home,
            total,
            t.non_home_network_threshold,
        ));
    } else {
        warn!("Skipped home network data threshold check due to command-line option");
    }

    checks
}

/// Historic checks: this dump's average daily unique counts must not fall
/// below the configured fraction of the trailing 30-day HLL averages.
fn historical_validation_checks(
    ctx: &CheckContext<'_>,
    store: &Store,
    operator_id: &str,
) -> Result<Vec<CheckOutcome>> {
    let mut checks = Vec::new();
    if !ctx.options.perform_historic_checks {
        warn!("Skipped historic IMEI/IMSI/MSISDN checks due to command-line option");
        return Ok(checks);
    }
    let txn = store.begin_read()?;
    let historic = crate::sketches::historic_daily_averages(&txn, operator_id)?;

    let daily = build_daily_sketches(ctx.rows, operator_id, Utc::now().date_naive());
    let days = daily.len().max(1) as f64;
    let imei_avg = daily.values().map(|s| s.imei_hll.cardinality()).sum::<f64>() / days;
    let imsi_avg = daily.values().map(|s| s.imsi_hll.cardinality()).sum::<f64>() / days;
    let msisdn_avg = daily
        .values()
        .map(|s| s.msisdn_hll.cardinality())
        .sum::<f64>()
        / days;

    match historic {
        Some((hist_imei, hist_imsi, hist_msisdn)) => {
            let t = &ctx.options.thresholds;
            for (name, metric_key, observed, minimum) in [
                (
                    "IMEI per day",
                    "historic_imei",
                    imei_avg,
                    t.historic_imei_threshold * hist_imei,
                ),
                (
                    "IMSI per day",
                    "historic_imsi",
                    imsi_avg,
                    t.historic_imsi_threshold * hist_imsi,
                ),
                (
                    "MSISDN per day",
                    "historic_msisdn",
                    msisdn_avg,
                    t.historic_msisdn_threshold * hist_msisdn,
                ),
            ] {
                checks.push(CheckOutcome {
                    name: name.to_string(),
                    passed: observed >= minimum,
                    observed,
                    threshold: minimum,
                    metric_key,
                });
            }
        }
        None => {
            warn!("Skipped historic IMEI/IMSI/MSISDN per day checks due to lack of historic data");
        }
    }
    Ok(checks)
}

fn first_failed_check(checks: &[CheckOutcome]) -> Option<&CheckOutcome> {
    checks.iter().find(|c| !c.passed)
}

/// Distinct (year, month) tuples spanned by the staging data.
fn month_year_tuples_for_import(rows: &[StagingRow]) -> Vec<(i32, u32)> {
    let mut tuples: Vec<(i32, u32)> = rows
        .iter()
        .map(|r| (r.connection_date.year(), r.connection_date.month()))
        .collect();
    tuples.sort_unstable();
    tuples.dedup();
    tuples
}

/// Import one operator data dump end to end. Any failed check aborts with a
/// typed validation failure; nothing is merged in that case.
pub fn import_operator_data(
    store: &Store,
    config: &AppConfig,
    operator_id: &str,
    path: &Path,
    options: &OperatorImportOptions,
) -> Result<OperatorImportOutcome> {
    let operator = config
        .region
        .operator(operator_id)
        .ok_or_else(|| {
            ValidationError::FilenameCheck(format!(
                "Operator ID {} is not a configured operator",
                operator_id
            ))
        })?
        .clone();

    let _lock = store.acquire_import_lock("operator", operator_id)?;
    let job = JobRecorder::start(store, "dirbs-import", Some(operator_id))?;

    let result = run_operator_import(store, config, &operator, path, options, &job);
    match &result {
        Ok(outcome) => {
            job.add_metadata(
                store,
                "output_stats",
                serde_json::json!({
                    "num_distinct_triplets": outcome.triplets_inserted + outcome.triplets_updated,
                    "num_distinct_triplets_inserted": outcome.triplets_inserted,
                    "num_distinct_triplets_updated": outcome.triplets_updated,
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

fn run_operator_import(
    store: &Store,
    config: &AppConfig,
    operator: &OperatorConfig,
    path: &Path,
    options: &OperatorImportOptions,
    job: &JobRecorder,
) -> Result<OperatorImportOutcome> {
    let filename = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or_default();
    let filename_info = perform_operator_filename_checks(filename, &operator.id)?;

    let (rows, has_msisdn, has_rat) = load_staging_rows(path, options)?;
    // Optional columns absent from the dump disable the matching import and
    // its gates rather than tripping the NULL checks
    let mut options = options.clone();
    if options.perform_msisdn_import && !has_msisdn {
        warn!("MSISDN column not present in input file; disabling MSISDN import");
        options.perform_msisdn_import = false;
    }
    if options.perform_rat_import && !has_rat {
        warn!("RAT column not present in input file; disabling RAT import");
        options.perform_rat_import = false;
    }
    let options = &options;
    info!(
        "Uploaded {} rows from {} to staging",
        rows.len(),
        filename
    );
    job.add_metadata(
        store,
        "input_file",
        serde_json::json!({
            "filename": filename,
            "num_records": rows.len(),
        }),
    )?;

    let ctx = CheckContext {
        rows: &rows,
        options,
        operator,
        region_mccs: config.region.all_mcc_prefixes(),
        country_codes: config.region.country_codes.clone(),
    };

    binary_validation_checks(&ctx, store, &filename_info, Utc::now().date_naive())?;

    let mut checks = threshold_validation_checks(&ctx);
    checks.extend(historical_validation_checks(&ctx, store, &operator.id)?);
    for check in &checks {
        if check.passed {
            info!(
                "Passed {} threshold check [threshold: {:.2}, observed: {:.2}]",
                check.name, check.threshold, check.observed
            );
        }
    }
    if let Some(failed) = first_failed_check(&checks) {
        return Err(ValidationError::ThresholdExceeded {
            check_name: failed.name.clone(),
            threshold: failed.threshold,
            observed: failed.observed,
            metric_key: failed.metric_key.to_string(),
        }
        .into());
    }

    let copy_outcome = copy_staging_data(store, config, &operator.id, &rows, options)?;

    let invalid_rows_imported = rows
        .iter()
        .filter(|r| {
            r.imei_norm.is_none()
                || r.imsi.is_none()
                || (options.perform_msisdn_import && r.msisdn.is_none())
                || (options.perform_rat_import && r.rat.is_none())
                || r.imei_norm.as_deref().map_or(false, is_unclean_imei)
                || r.imsi.as_deref().map_or(false, is_unclean_imsi)
        })
        .count() as u64;

    info!("Rows supplied in input file: {}", rows.len());
    info!(
        "\t[including {} row(s) with NULL or unclean values imported as under tolerated thresholds]",
        invalid_rows_imported
    );
    info!(
        "Distinct triplets updated or inserted into monthly partitions: {} ({} new, {} updated)",
        copy_outcome.merge.inserted_or_updated(),
        copy_outcome.merge.inserted,
        copy_outcome.merge.updated
    );

    job.add_metadata(
        store,
        "input_stats",
        serde_json::json!({
            "num_records": rows.len(),
            "num_records_invalid": invalid_rows_imported,
            "num_records_valid": rows.len() as u64 - invalid_rows_imported,
            "num_distinct_triplets": copy_outcome.distinct_triplets,
        }),
    )?;

    Ok(OperatorImportOutcome {
        run_id: job.run_id,
        rows_in_file: rows.len() as u64,
        invalid_rows_imported,
        distinct_triplets: copy_outcome.distinct_triplets,
        triplets_inserted: copy_outcome.merge.inserted,
        triplets_updated: copy_outcome.merge.updated,
        checks,
    })
}

struct CopyOutcome {
    distinct_triplets: u64,
    merge: MergeOutcome,
}

/// The copy stage: create missing monthly partitions, then merge the
/// aggregated staging data per (month, shard) in parallel. HLL sketch
/// merges happen afterwards on this thread so no two transactions update
/// the same (data_date, operator_id) key.
fn copy_staging_data(
    store: &Store,
    config: &AppConfig,
    operator_id: &str,
    rows: &[StagingRow],
    options: &OperatorImportOptions,
) -> Result<CopyOutcome> {
    let tuples = month_year_tuples_for_import(rows);
    if tuples.is_empty() {
        return Ok(CopyOutcome {
            distinct_triplets: 0,
            merge: MergeOutcome::default(),
        });
    }

    for (year, month) in &tuples {
        let country_base = monthly_network_triplets_country_partition(*year, *month, "");
        if !partition::partition_exists_any_leaf(store, &country_base)? {
            partition::create_monthly_network_triplets_country_partition(
                store,
                *year,
                *month,
                "",
                None,
                FILLFACTOR_WRITABLE,
            )?;
        }
        let mno_base = monthly_network_triplets_per_mno_partition(operator_id, *year, *month, "");
        if !partition::partition_exists_any_leaf(store, &mno_base)? {
            partition::create_monthly_network_triplets_per_mno_partition(
                store,
                operator_id,
                *year,
                *month,
                "",
                None,
                FILLFACTOR_WRITABLE,
            )?;
        }
    }

    let shards = partition::physical_imei_shards(store, "network_imeis")?;
    let rows_before = count_mno_rows(store, operator_id, &tuples)?;

    // Bucket staging rows by physical shard once
    let mut rows_by_shard: Vec<Vec<&StagingRow>> = vec![Vec::new(); shards.len()];
    for row in rows {
        let idx = shards
            .iter()
            .position(|(_, lo, hi)| row.virt_imei_shard >= *lo && row.virt_imei_shard < *hi)
            .expect("shard bounds cover [0, 100)");
        rows_by_shard[idx].push(row);
    }

    let max_workers = config.multiprocessing.max_db_connections;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(max_workers)
        .build()
        .context("Failed to build import worker pool")?;
    info!(
        "Simultaneously updating monthly_network_triplets and network_imeis using up to {} workers...",
        max_workers
    );

    // One job per (month, shard) pair plus one network_imeis job per shard;
    // all write targets are disjoint so ordering does not matter.
    let month_shard_jobs: Vec<((i32, u32), usize)> = tuples
        .iter()
        .flat_map(|t| (0..shards.len()).map(move |s| (*t, s)))
        .collect();

    let perform_msisdn = options.perform_msisdn_import;
    let triplet_results: Vec<(u64, MergeOutcome)> = pool.install(|| {
        month_shard_jobs
            .par_iter()
            .map(|((year, month), shard_idx)| {
                let (_, lo, hi) = shards[*shard_idx];
                let shard_rows = &rows_by_shard[*shard_idx];
                let aggregated = aggregate_staging_rows(
                    shard_rows.iter().copied(),
                    *year,
                    *month,
                    operator_id,
                    perform_msisdn,
                );
                let distinct = aggregated.len() as u64;

                let country_base =
                    monthly_network_triplets_country_partition(*year, *month, "");
                let country_leaf = imei_shard_name(&country_base, lo, hi);
                retry_transient("monthly_network_triplets_country merge", || {
                    merge_triplets(store, &country_leaf, &aggregated, true)
                })?;

                let mno_base =
                    monthly_network_triplets_per_mno_partition(operator_id, *year, *month, "");
                let mno_leaf = imei_shard_name(&mno_base, lo, hi);
                let outcome = retry_transient("monthly_network_triplets_per_mno merge", || {
                    merge_triplets(store, &mno_leaf, &aggregated, false)
                })?;
                Ok::<(u64, MergeOutcome), anyhow::Error>((distinct, outcome))
            })
            .collect::<Result<Vec<_>>>()
    })?;

    pool.install(|| {
        shards
            .par_iter()
            .enumerate()
            .map(|(idx, (_, lo, hi))| {
                let batch = aggregate_network_imeis(rows_by_shard[idx].iter().copied());
                let leaf = imei_shard_name("network_imeis", *lo, *hi);
                retry_transient("network_imeis merge", || {
                    merge_network_imeis(store, &leaf, &batch)
                })?;
                Ok::<(), anyhow::Error>(())
            })
            .collect::<Result<Vec<_>>>()
    })?;

    // Daily sketches, single-threaded
    let daily = build_daily_sketches(rows, operator_id, Utc::now().date_naive());
    merge_daily_sketches(store, daily.values())?;

    let rows_after = count_mno_rows(store, operator_id, &tuples)?;
    let distinct_triplets: u64 = triplet_results.iter().map(|(d, _)| d).sum();
    let inserted_or_updated: u64 = triplet_results
        .iter()
        .map(|(_, o)| o.inserted_or_updated())
        .sum();
    let inserted = rows_after - rows_before;
    let updated = inserted_or_updated - inserted;

    Ok(CopyOutcome {
        distinct_triplets,
        merge: MergeOutcome { inserted, updated },
    })
}

fn count_mno_rows(store: &Store, operator_id: &str, tuples: &[(i32, u32)]) -> Result<u64> {
    let shards = partition::physical_imei_shards(store, "network_imeis")?;
    let mut total = 0;
    for (year, month) in tuples {
        let base = monthly_network_triplets_per_mno_partition(operator_id, *year, *month, "");
        for (_, lo, hi) in &shards {
            total += triplet_partition_len(store, &imei_shard_name(&base, *lo, *hi))?;
        }
    }
    Ok(total)
}

/// End of the half-open analysis window: one day past the latest last_seen
/// in the latest country month, else one day past today.
pub fn compute_analysis_end_date(store: &Store, curr_date: Option<NaiveDate>) -> Result<NaiveDate> {
    if let Some(d) = curr_date {
        return Ok(d + chrono::Duration::days(1));
    }
    let tuples = partition::month_year_tuples(store, "monthly_network_triplets_country")?;
    if let Some((year, month)) = tuples.first() {
        let txn = store.begin_read()?;
        let base = monthly_network_triplets_country_partition(*year, *month, "");
        let mut max_last_seen: Option<NaiveDate> = None;
        for (leaf, _, _) in partition::physical_imei_shards(store, &base)? {
            for record in crate::triplets::scan_triplets(&txn, &leaf)? {
                max_last_seen = Some(match max_last_seen {
                    Some(d) => d.max(record.last_seen),
                    None => record.last_seen,
                });
            }
        }
        if let Some(d) = max_last_seen {
            return Ok(d + chrono::Duration::days(1));
        }
    }
    Ok(Utc::now().date_naive() + chrono::Duration::days(1))
}
