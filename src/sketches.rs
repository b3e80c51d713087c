// Daily per-operator HLL sketch store, built during ingest
use std::collections::HashMap;

use anyhow::Result;
use chrono::{Datelike, NaiveDate};
use redb::{ReadableTable, TableError};
use serde::{Deserialize, Serialize};

use crate::hll::Hll;
use crate::store::{str_table, Store, TableFamily};
use crate::triplets::StagingRow;

pub const DAILY_SKETCHES_TABLE: &str = "daily_per_mno_hll_sketches";

/// Seven sketches per (data_date, operator_id): the distinct triplets,
/// single identifiers and identifier pairs observed that day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySketches {
    pub data_date: NaiveDate,
    pub operator_id: String,
    pub creation_date: NaiveDate,
    pub triplet_hll: Hll,
    pub imei_hll: Hll,
    pub imsi_hll: Hll,
    pub msisdn_hll: Hll,
    pub imei_imsis_hll: Hll,
    pub imei_msisdns_hll: Hll,
    pub imsi_msisdns_hll: Hll,
}

impl DailySketches {
    pub fn new(data_date: NaiveDate, operator_id: &str, creation_date: NaiveDate) -> Self {
        DailySketches {
            data_date,
            operator_id: operator_id.to_string(),
            creation_date,
            triplet_hll: Hll::new(),
            imei_hll: Hll::new(),
            imsi_hll: Hll::new(),
            msisdn_hll: Hll::new(),
            imei_imsis_hll: Hll::new(),
            imei_msisdns_hll: Hll::new(),
            imsi_msisdns_hll: Hll::new(),
        }
    }

    pub fn add_row(&mut self, row: &StagingRow) {
        let imei = row.imei_norm.as_deref();
        let imsi = row.imsi.as_deref();
        let msisdn = row.msisdn.as_deref();
        if let (Some(imei), Some(imsi), Some(msisdn)) = (imei, imsi, msisdn) {
            self.triplet_hll
                .add(&format!("{}${}${}", imei, imsi, msisdn));
        }
        if let Some(imei) = imei {
            self.imei_hll.add(imei);
        }
        if let Some(imsi) = imsi {
            self.imsi_hll.add(imsi);
        }
        if let Some(msisdn) = msisdn {
            self.msisdn_hll.add(msisdn);
        }
        if let (Some(imei), Some(imsi)) = (imei, imsi) {
            self.imei_imsis_hll.add(&format!("{}${}", imei, imsi));
        }
        if let (Some(imei), Some(msisdn)) = (imei, msisdn) {
            self.imei_msisdns_hll.add(&format!("{}${}", imei, msisdn));
        }
        if let (Some(imsi), Some(msisdn)) = (imsi, msisdn) {
            self.imsi_msisdns_hll.add(&format!("{}${}", imsi, msisdn));
        }
    }

    /// Register-wise union with sketches for the same key.
    pub fn union(&mut self, other: &DailySketches) {
        self.triplet_hll.union(&other.triplet_hll);
        self.imei_hll.union(&other.imei_hll);
        self.imsi_hll.union(&other.imsi_hll);
        self.msisdn_hll.union(&other.msisdn_hll);
        self.imei_imsis_hll.union(&other.imei_imsis_hll);
        self.imei_msisdns_hll.union(&other.imei_msisdns_hll);
        self.imsi_msisdns_hll.union(&other.imsi_msisdns_hll);
        self.creation_date = other.creation_date;
    }
}

fn sketch_key(data_date: NaiveDate, operator_id: &str) -> String {
    format!("{}|{}", data_date.format("%Y-%m-%d"), operator_id)
}

/// Build per-day sketches from validated staging rows.
pub fn build_daily_sketches(
    rows: &[StagingRow],
    operator_id: &str,
    creation_date: NaiveDate,
) -> HashMap<NaiveDate, DailySketches> {
    let mut out: HashMap<NaiveDate, DailySketches> = HashMap::new();
    for row in rows {
        let entry = out
            .entry(row.connection_date)
            .or_insert_with(|| DailySketches::new(row.connection_date, operator_id, creation_date));
        entry.add_row(row);
    }
    out
}

/// Merge day sketches into the durable store by HLL union on conflict.
/// Applied on a single thread so no two transactions touch the same
/// (data_date, operator_id) key.
pub fn merge_daily_sketches<'a, I>(store: &Store, sketches: I) -> Result<()>
where
    I: IntoIterator<Item = &'a DailySketches>,
{
    let txn = store.begin_write(TableFamily::Sketches)?;
    {
        let mut table = txn.open_table(str_table(DAILY_SKETCHES_TABLE))?;
        for incoming in sketches {
            let key = sketch_key(incoming.data_date, &incoming.operator_id);
            let merged = match table.get(key.as_str())? {
                Some(guard) => {
                    let mut current: DailySketches = bincode::deserialize(guard.value())?;
                    current.union(incoming);
                    current
                }
                None => incoming.clone(),
            };
            let bytes = bincode::serialize(&merged)?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
    }
    store.commit(txn)?;
    Ok(())
}

/// All stored sketches, optionally restricted to one operator.
pub fn scan_daily_sketches(
    txn: &redb::ReadTransaction,
    operator_id: Option<&str>,
) -> Result<Vec<DailySketches>> {
    let table = match txn.open_table(str_table(DAILY_SKETCHES_TABLE)) {
        Ok(t) => t,
        Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (_, v) = entry?;
        let sketches: DailySketches = bincode::deserialize(v.value())?;
        if operator_id.map_or(true, |op| sketches.operator_id == op) {
            out.push(sketches);
        }
    }
    Ok(out)
}

/// Sketches for one operator within a reporting month.
pub fn sketches_for_month(
    txn: &redb::ReadTransaction,
    operator_id: Option<&str>,
    year: i32,
    month: u32,
) -> Result<Vec<DailySketches>> {
    Ok(scan_daily_sketches(txn, operator_id)?
        .into_iter()
        .filter(|s| s.data_date.year() == year && s.data_date.month() == month)
        .collect())
}

/// Average daily unique IMEI/IMSI/MSISDN counts over the most recent 30
/// days of non-empty sketches for an operator. None when no history exists.
pub fn historic_daily_averages(
    txn: &redb::ReadTransaction,
    operator_id: &str,
) -> Result<Option<(f64, f64, f64)>> {
    let mut sketches = scan_daily_sketches(txn, Some(operator_id))?;
    sketches.retain(|s| s.triplet_hll.cardinality() > 0.0);
    if sketches.is_empty() {
        return Ok(None);
    }
    sketches.sort_by_key(|s| std::cmp::Reverse(s.data_date));
    sketches.truncate(30);

    let n = sketches.len() as f64;
    let imei_avg = sketches.iter().map(|s| s.imei_hll.cardinality()).sum::<f64>() / n;
    let imsi_avg = sketches.iter().map(|s| s.imsi_hll.cardinality()).sum::<f64>() / n;
    let msisdn_avg = sketches
        .iter()
        .map(|s| s.msisdn_hll.cardinality())
        .sum::<f64>()
        / n;
    Ok(Some((imei_avg, imsi_avg, msisdn_avg)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::calc_virt_imei_shard;
    use tempfile::tempdir;

    fn row(imei: Option<&str>, imsi: Option<&str>, msisdn: Option<&str>, day: u32) -> StagingRow {
        StagingRow {
            imei: imei.map(String::from),
            imei_norm: imei.map(String::from),
            imsi: imsi.map(String::from),
            msisdn: msisdn.map(String::from),
            rat: None,
            connection_date: NaiveDate::from_ymd_opt(2016, 7, day).unwrap(),
            virt_imei_shard: calc_virt_imei_shard(imei),
        }
    }

    #[test]
    fn test_null_fields_skip_sketches() {
        let creation = NaiveDate::from_ymd_opt(2016, 8, 1).unwrap();
        let rows = vec![row(Some("01234567890123"), None, Some("222000049781840"), 15)];
        let sketches = build_daily_sketches(&rows, "operator1", creation);
        let day = &sketches[&NaiveDate::from_ymd_opt(2016, 7, 15).unwrap()];
        assert!(!day.imei_hll.is_empty());
        assert!(day.imsi_hll.is_empty());
        // Triplet sketch requires all three identifiers
        assert!(day.triplet_hll.is_empty());
        assert!(!day.imei_msisdns_hll.is_empty());
        assert!(day.imei_imsis_hll.is_empty());
    }

    #[test]
    fn test_merge_unions_on_conflict() -> Result<()> {
        let dir = tempdir()?;
        let store = Store::install(&dir.path().join("core.redb"), 1)?;
        let creation = NaiveDate::from_ymd_opt(2016, 8, 1).unwrap();

        let rows_a = vec![row(Some("01234567890123"), Some("111015113222222"), None, 15)];
        let rows_b = vec![row(Some("99999999999999"), Some("111015113222223"), None, 15)];
        let a = build_daily_sketches(&rows_a, "operator1", creation);
        let b = build_daily_sketches(&rows_b, "operator1", creation);
        merge_daily_sketches(&store, a.values())?;
        merge_daily_sketches(&store, b.values())?;

        let txn = store.begin_read()?;
        let all = scan_daily_sketches(&txn, Some("operator1"))?;
        assert_eq!(all.len(), 1);
        let est = all[0].imei_hll.cardinality();
        assert!((est - 2.0).abs() < 0.5, "estimate was {}", est);
        Ok(())
    }

    #[test]
    fn test_historic_averages_skip_when_no_history() -> Result<()> {
        let dir = tempdir()?;
        let store = Store::install(&dir.path().join("core.redb"), 1)?;
        let txn = store.begin_read()?;
        assert!(historic_daily_averages(&txn, "operator1")?.is_none());
        Ok(())
    }

    #[test]
    fn test_historic_averages() -> Result<()> {
        let dir = tempdir()?;
        let store = Store::install(&dir.path().join("core.redb"), 1)?;
        let creation = NaiveDate::from_ymd_opt(2016, 8, 1).unwrap();

        // Two days with 2 and 4 distinct IMEIs (full triplets so the
        // non-empty filter keeps them)
        let mut rows = Vec::new();
        for i in 0..2 {
            rows.push(row(
                Some(Box::leak(format!("0123456789012{}", i).into_boxed_str())),
                Some("111015113222222"),
                Some("222000049781840"),
                10,
            ));
        }
        for i in 0..4 {
            rows.push(row(
                Some(Box::leak(format!("0123456789013{}", i).into_boxed_str())),
                Some("111015113222222"),
                Some("222000049781840"),
                11,
            ));
        }
        let sketches = build_daily_sketches(&rows, "operator1", creation);
        merge_daily_sketches(&store, sketches.values())?;

        let txn = store.begin_read()?;
        let (imei_avg, _, _) = historic_daily_averages(&txn, "operator1")?.unwrap();
        assert!((imei_avg - 3.0).abs() < 0.5, "average was {}", imei_avg);
        Ok(())
    }
}
