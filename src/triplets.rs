// Monthly network triplet records, date bitmask encoding and the
// append-merge protocol into the sharded monthly partitions
use std::collections::HashMap;

use anyhow::Result;
use chrono::{Datelike, NaiveDate};
use redb::{ReadableTable, TableError};
use serde::{Deserialize, Serialize};

use crate::partition::{
    monthly_network_triplets_country_indices, monthly_network_triplets_per_mno_indices,
    IndexMetadatum,
};
use crate::shard::{calc_virt_imei_shard, hash_triplet};
use crate::store::{str_table, u64_table, Store, TableFamily};

/// One row of a monthly_network_triplets partition, keyed by triplet_hash.
/// `operator_id` is None in country-level partitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TripletRecord {
    pub triplet_year: i32,
    pub triplet_month: u32,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
    pub date_bitmask: u32,
    pub triplet_hash: u64,
    pub imei_norm: Option<String>,
    pub imsi: Option<String>,
    pub msisdn: Option<String>,
    pub operator_id: Option<String>,
    pub virt_imei_shard: u32,
}

/// One row of network_imeis, keyed by imei_norm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkImeiRecord {
    pub imei_norm: String,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
    pub seen_rat_bitmask: u32,
    pub virt_imei_shard: u32,
}

/// Radio access technology map: code -> (technology generation,
/// operator-rank bit). Generation families group the operator-rank bits:
/// 2G = bits 4-5, 3G = bits 6-9, 4G = bits 10-12.
pub const RAT_MAP: &[(&str, Option<&str>, u32)] = &[
    ("001", Some("3G"), 6),  // UTRAN
    ("002", Some("2G"), 4),  // GERAN
    ("003", None, 1),        // WLAN
    ("004", Some("3G"), 6),  // GAN
    ("005", Some("3G"), 7),  // HSPA Evolution
    ("006", Some("4G"), 10), // E-UTRAN
    ("007", None, 2),        // Virtual
    ("101", Some("4G"), 11), // IEEE 802.16e
    ("102", Some("3G"), 8),  // 3GPP2 eHRPD
    ("103", Some("3G"), 9),  // 3GPP2 HRPD
    ("104", Some("2G"), 5),  // 3GPP2 1xRTT
    ("105", Some("4G"), 12), // 3GPP2 UMB
];

/// Operator-rank bitmasks of the devices observed per generation family.
pub const DEVICE_RAT_MASK_2G: u32 = 48; // bits 4, 5
pub const DEVICE_RAT_MASK_3G: u32 = 960; // bits 6..=9
pub const DEVICE_RAT_MASK_4G: u32 = 7168; // bits 10..=12

/// GSMA-rank capability bit per generation family (gsma_data.rat_bitmask).
pub const GSMA_RAT_MASK_2G: u32 = 64; // bit 6
pub const GSMA_RAT_MASK_3G: u32 = 512; // bit 9
pub const GSMA_RAT_MASK_4G: u32 = 4096; // bit 12

pub fn rat_code_operator_rank(code: &str) -> Option<u32> {
    RAT_MAP
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, _, rank)| *rank)
}

/// Technology generations present in a GSMA-rank bitmask, ordered 2G/3G/4G.
pub fn gsma_rat_bitmask_generations(rat_bitmask: u32) -> Vec<&'static str> {
    let mut out = Vec::new();
    if rat_bitmask & GSMA_RAT_MASK_2G != 0 {
        out.push("2G");
    }
    if rat_bitmask & GSMA_RAT_MASK_3G != 0 {
        out.push("3G");
    }
    if rat_bitmask & GSMA_RAT_MASK_4G != 0 {
        out.push("4G");
    }
    out
}

/// Bit for day-of-month d (1-based): bit d-1.
pub fn day_bit(day: u32) -> u32 {
    1 << (day - 1)
}

pub fn bitcount(mask: u32) -> u32 {
    mask.count_ones()
}

/// First day of the month after (year, month).
pub fn next_month_start(year: i32, month: u32) -> NaiveDate {
    if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1).unwrap()
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1).unwrap()
    }
}

/// [start, end) date range covered by a monthly partition.
pub fn date_range_for_month_year(year: i32, month: u32) -> (NaiveDate, NaiveDate) {
    (
        NaiveDate::from_ymd_opt(year, month, 1).unwrap(),
        next_month_start(year, month),
    )
}

/// Clamp a month's date bitmask to the days that fall inside the half-open
/// analysis window [window_start, window_end).
pub fn bitmask_within_window(
    date_bitmask: u32,
    year: i32,
    month: u32,
    window_start: NaiveDate,
    window_end: NaiveDate,
) -> u32 {
    let (month_start, month_end) = date_range_for_month_year(year, month);
    if window_end <= month_start || window_start >= month_end {
        return 0;
    }
    let mut mask = 0x7fff_ffff; // all 31 day bits
    if window_start > month_start {
        // Clear days before the window start
        let first_day = window_start.day();
        mask &= !((1u32 << (first_day - 1)) - 1) & 0x7fff_ffff;
    }
    if window_end < month_end {
        // Window end is exclusive: clear that day and everything after
        let end_day = window_end.day();
        mask &= (1u32 << (end_day - 1)) - 1;
    }
    date_bitmask & mask
}

/// One validated staging row, sharded like the destination tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingRow {
    pub imei: Option<String>,
    pub imei_norm: Option<String>,
    pub imsi: Option<String>,
    pub msisdn: Option<String>,
    pub rat: Option<String>,
    pub connection_date: NaiveDate,
    pub virt_imei_shard: u32,
}

/// Aggregate staging rows of one (shard, month) into triplet records:
/// first_seen = min(date), last_seen = max(date), date_bitmask = OR of day
/// bits. `operator_id` is attached for the per-MNO table; the caller strips
/// it for the country merge.
pub fn aggregate_staging_rows<'a, I>(
    rows: I,
    year: i32,
    month: u32,
    operator_id: &str,
    perform_msisdn_import: bool,
) -> HashMap<u64, TripletRecord>
where
    I: IntoIterator<Item = &'a StagingRow>,
{
    let (month_start, month_end) = date_range_for_month_year(year, month);
    let mut out: HashMap<u64, TripletRecord> = HashMap::new();
    for row in rows {
        if row.connection_date < month_start || row.connection_date >= month_end {
            continue;
        }
        let msisdn = if perform_msisdn_import {
            row.msisdn.clone()
        } else {
            None
        };
        let hash = hash_triplet(
            row.imei_norm.as_deref(),
            row.imsi.as_deref(),
            msisdn.as_deref(),
        );
        let bit = day_bit(row.connection_date.day());
        let entry = out.entry(hash).or_insert_with(|| TripletRecord {
            triplet_year: year,
            triplet_month: month,
            first_seen: row.connection_date,
            last_seen: row.connection_date,
            date_bitmask: 0,
            triplet_hash: hash,
            imei_norm: row.imei_norm.clone(),
            imsi: row.imsi.clone(),
            msisdn,
            operator_id: Some(operator_id.to_string()),
            virt_imei_shard: calc_virt_imei_shard(row.imei_norm.as_deref()),
        });
        entry.first_seen = entry.first_seen.min(row.connection_date);
        entry.last_seen = entry.last_seen.max(row.connection_date);
        entry.date_bitmask |= bit;
    }
    out
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: u64,
    pub updated: u64,
}

impl MergeOutcome {
    pub fn inserted_or_updated(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Merge aggregated triplets into one destination partition. On conflict:
/// first_seen = min, last_seen = max, date_bitmask |= incoming, committed
/// only when the bitmask actually changes, which makes re-imports of the
/// same file no-ops.
pub fn merge_triplets(
    store: &Store,
    part_name: &str,
    batch: &HashMap<u64, TripletRecord>,
    country_level: bool,
) -> Result<MergeOutcome> {
    let mut outcome = MergeOutcome::default();
    if batch.is_empty() {
        return Ok(outcome);
    }
    let indices = if country_level {
        monthly_network_triplets_country_indices()
    } else {
        monthly_network_triplets_per_mno_indices()
    };

    let txn = store.begin_write(TableFamily::Triplets)?;
    {
        let mut table = txn.open_table(u64_table(part_name))?;
        let mut index_inserts: Vec<(String, String)> = Vec::new();
        for (hash, incoming) in batch {
            let existing: Option<TripletRecord> = match table.get(*hash)? {
                Some(guard) => Some(bincode::deserialize(guard.value())?),
                None => None,
            };
            match existing {
                None => {
                    let mut record = incoming.clone();
                    if country_level {
                        record.operator_id = None;
                    }
                    let bytes = bincode::serialize(&record)?;
                    table.insert(*hash, bytes.as_slice())?;
                    outcome.inserted += 1;
                    for idx in &indices {
                        queue_index_inserts(&mut index_inserts, idx, part_name, &record);
                    }
                }
                Some(mut current) => {
                    let merged_mask = current.date_bitmask | incoming.date_bitmask;
                    if merged_mask == current.date_bitmask {
                        continue;
                    }
                    current.first_seen = current.first_seen.min(incoming.first_seen);
                    current.last_seen = current.last_seen.max(incoming.last_seen);
                    current.date_bitmask = merged_mask;
                    let bytes = bincode::serialize(&current)?;
                    table.insert(*hash, bytes.as_slice())?;
                    outcome.updated += 1;
                }
            }
        }
        drop(table);

        for (idx_table_name, key) in index_inserts {
            let mut idx_table = txn.open_table(str_table(&idx_table_name))?;
            idx_table.insert(key.as_str(), &[][..])?;
        }
    }
    store.commit(txn)?;
    Ok(outcome)
}

fn queue_index_inserts(
    queue: &mut Vec<(String, String)>,
    idx: &IndexMetadatum,
    part_name: &str,
    record: &TripletRecord,
) {
    // triplet_hash uniqueness is the primary key itself
    if idx.idx_cols == ["triplet_hash"] {
        return;
    }
    let value = if idx.idx_cols == ["imei_norm"] {
        record.imei_norm.as_deref()
    } else if idx.idx_cols == ["msisdn"] {
        record.msisdn.as_deref()
    } else {
        None
    };
    if let Some(value) = value {
        let key = format!("{}|{:016x}", value, record.triplet_hash);
        queue.push((idx.idx_name(part_name), key));
    }
}

/// Number of rows currently in a partition.
pub fn triplet_partition_len(store: &Store, part_name: &str) -> Result<u64> {
    use redb::ReadableTableMetadata;
    let txn = store.begin_read()?;
    match txn.open_table(u64_table(part_name)) {
        Ok(table) => Ok(table.len()?),
        Err(TableError::TableDoesNotExist(_)) => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Scan every triplet record of a partition.
pub fn scan_triplets(txn: &redb::ReadTransaction, part_name: &str) -> Result<Vec<TripletRecord>> {
    let table = match txn.open_table(u64_table(part_name)) {
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

/// Aggregate staging rows of one shard into per-IMEI network_imeis updates.
/// The RAT field may carry multiple |-separated codes; each maps to an
/// operator-rank bit of seen_rat_bitmask.
pub fn aggregate_network_imeis<'a, I>(rows: I) -> HashMap<String, NetworkImeiRecord>
where
    I: IntoIterator<Item = &'a StagingRow>,
{
    let mut out: HashMap<String, NetworkImeiRecord> = HashMap::new();
    for row in rows {
        let imei_norm = match &row.imei_norm {
            Some(v) => v.clone(),
            None => continue,
        };
        let mut rat_bits = 0u32;
        if let Some(rat) = &row.rat {
            for code in rat.split('|') {
                if let Some(rank) = rat_code_operator_rank(code) {
                    rat_bits |= 1 << rank;
                }
            }
        }
        let entry = out
            .entry(imei_norm.clone())
            .or_insert_with(|| NetworkImeiRecord {
                imei_norm: imei_norm.clone(),
                first_seen: row.connection_date,
                last_seen: row.connection_date,
                seen_rat_bitmask: 0,
                virt_imei_shard: row.virt_imei_shard,
            });
        entry.first_seen = entry.first_seen.min(row.connection_date);
        entry.last_seen = entry.last_seen.max(row.connection_date);
        entry.seen_rat_bitmask |= rat_bits;
    }
    out
}

/// Merge per-IMEI updates into one network_imeis shard. The update only
/// commits when it would widen the seen dates or the RAT bitmask.
pub fn merge_network_imeis(
    store: &Store,
    part_name: &str,
    batch: &HashMap<String, NetworkImeiRecord>,
) -> Result<MergeOutcome> {
    let mut outcome = MergeOutcome::default();
    if batch.is_empty() {
        return Ok(outcome);
    }
    let txn = store.begin_write(TableFamily::NetworkImeis)?;
    {
        let mut table = txn.open_table(str_table(part_name))?;
        for (imei_norm, incoming) in batch {
            let existing: Option<NetworkImeiRecord> = match table.get(imei_norm.as_str())? {
                Some(guard) => Some(bincode::deserialize(guard.value())?),
                None => None,
            };
            match existing {
                None => {
                    let bytes = bincode::serialize(incoming)?;
                    table.insert(imei_norm.as_str(), bytes.as_slice())?;
                    outcome.inserted += 1;
                }
                Some(mut current) => {
                    let widened = incoming.first_seen < current.first_seen
                        || incoming.last_seen > current.last_seen
                        || (current.seen_rat_bitmask | incoming.seen_rat_bitmask)
                            != current.seen_rat_bitmask;
                    if !widened {
                        continue;
                    }
                    current.first_seen = current.first_seen.min(incoming.first_seen);
                    current.last_seen = current.last_seen.max(incoming.last_seen);
                    current.seen_rat_bitmask |= incoming.seen_rat_bitmask;
                    let bytes = bincode::serialize(&current)?;
                    table.insert(imei_norm.as_str(), bytes.as_slice())?;
                    outcome.updated += 1;
                }
            }
        }
    }
    store.commit(txn)?;
    Ok(outcome)
}

/// Scan every network_imeis record of one shard.
pub fn scan_network_imeis(
    txn: &redb::ReadTransaction,
    part_name: &str,
) -> Result<Vec<NetworkImeiRecord>> {
    let table = match txn.open_table(str_table(part_name)) {
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

/// Point lookup of one IMEI in network_imeis.
pub fn get_network_imei(
    txn: &redb::ReadTransaction,
    part_name: &str,
    imei_norm: &str,
) -> Result<Option<NetworkImeiRecord>> {
    crate::store::get_value(txn, part_name, imei_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::create_monthly_network_triplets_per_mno_partition;
    use crate::store::Store;
    use tempfile::tempdir;

    fn staging_row(imei: &str, imsi: &str, msisdn: &str, date: NaiveDate) -> StagingRow {
        let imei_norm = crate::shard::normalize_imei(imei);
        StagingRow {
            imei: Some(imei.to_string()),
            imei_norm: Some(imei_norm.clone()),
            imsi: Some(imsi.to_string()),
            msisdn: Some(msisdn.to_string()),
            rat: None,
            connection_date: date,
            virt_imei_shard: calc_virt_imei_shard(Some(&imei_norm)),
        }
    }

    #[test]
    fn test_day_bit() {
        assert_eq!(day_bit(1), 1);
        assert_eq!(day_bit(15), 1 << 14);
        assert_eq!(day_bit(31), 1 << 30);
    }

    #[test]
    fn test_bitmask_within_window() {
        let full = 0b1111; // days 1-4
        let start = NaiveDate::from_ymd_opt(2016, 7, 3).unwrap();
        let end = NaiveDate::from_ymd_opt(2016, 8, 1).unwrap();
        // Window starts on day 3: days 1-2 are masked off
        assert_eq!(bitmask_within_window(full, 2016, 7, start, end), 0b1100);

        let start = NaiveDate::from_ymd_opt(2016, 6, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2016, 7, 3).unwrap();
        // Window ends (exclusive) on day 3: only days 1-2 remain
        assert_eq!(bitmask_within_window(full, 2016, 7, start, end), 0b0011);

        // Month entirely outside the window
        let start = NaiveDate::from_ymd_opt(2016, 8, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2016, 9, 1).unwrap();
        assert_eq!(bitmask_within_window(full, 2016, 7, start, end), 0);

        // Month entirely inside the window
        let start = NaiveDate::from_ymd_opt(2016, 6, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2016, 9, 1).unwrap();
        assert_eq!(bitmask_within_window(full, 2016, 7, start, end), full);
    }

    #[test]
    fn test_aggregate_groups_by_triplet() {
        let d = |day| NaiveDate::from_ymd_opt(2016, 7, day).unwrap();
        let rows = vec![
            staging_row("01234567890123", "111015113222222", "222000049781840", d(15)),
            staging_row("01234567890123", "111015113222222", "222000049781840", d(17)),
            staging_row("01234567890123", "111015113222223", "222000049781840", d(15)),
        ];
        let agg = aggregate_staging_rows(rows.iter(), 2016, 7, "operator1", true);
        assert_eq!(agg.len(), 2);
        let rec = agg
            .values()
            .find(|r| r.imsi.as_deref() == Some("111015113222222"))
            .unwrap();
        assert_eq!(rec.first_seen, d(15));
        assert_eq!(rec.last_seen, d(17));
        assert_eq!(rec.date_bitmask, day_bit(15) | day_bit(17));
        assert_eq!(
            rec.virt_imei_shard,
            calc_virt_imei_shard(Some("01234567890123"))
        );
    }

    #[test]
    fn test_merge_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let store = Store::install(&dir.path().join("core.redb"), 1)?;
        create_monthly_network_triplets_per_mno_partition(&store, "operator1", 2016, 7, "", None, 45)?;
        let part = "monthly_network_triplets_per_mno_operator1_2016_07_0_99";

        let d = |day| NaiveDate::from_ymd_opt(2016, 7, day).unwrap();
        let rows = vec![staging_row(
            "01234567890123",
            "111015113222222",
            "222000049781840",
            d(15),
        )];
        let agg = aggregate_staging_rows(rows.iter(), 2016, 7, "operator1", true);

        let first = merge_triplets(&store, part, &agg, false)?;
        assert_eq!(first.inserted, 1);
        assert_eq!(first.updated, 0);

        // Re-importing the same data is a no-op
        let second = merge_triplets(&store, part, &agg, false)?;
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(triplet_partition_len(&store, part)?, 1);

        // A new day widens the row instead of inserting
        let more = vec![staging_row(
            "01234567890123",
            "111015113222222",
            "222000049781840",
            d(20),
        )];
        let agg2 = aggregate_staging_rows(more.iter(), 2016, 7, "operator1", true);
        let third = merge_triplets(&store, part, &agg2, false)?;
        assert_eq!(third.inserted, 0);
        assert_eq!(third.updated, 1);

        let txn = store.begin_read()?;
        let all = scan_triplets(&txn, part)?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].date_bitmask, day_bit(15) | day_bit(20));
        assert_eq!(all[0].first_seen, d(15));
        assert_eq!(all[0].last_seen, d(20));
        Ok(())
    }

    #[test]
    fn test_network_imeis_rat_bitmask() {
        let d = NaiveDate::from_ymd_opt(2016, 7, 15).unwrap();
        let mut row = staging_row("01234567890123", "111015113222222", "222000049781840", d);
        row.rat = Some("001|006".to_string());
        let agg = aggregate_network_imeis(std::iter::once(&row));
        let rec = &agg["01234567890123"];
        assert_eq!(rec.seen_rat_bitmask, (1 << 6) | (1 << 10));
        // 3G and 4G observations set the matching family masks
        assert!(rec.seen_rat_bitmask & DEVICE_RAT_MASK_3G != 0);
        assert!(rec.seen_rat_bitmask & DEVICE_RAT_MASK_4G != 0);
        assert!(rec.seen_rat_bitmask & DEVICE_RAT_MASK_2G == 0);
    }

    #[test]
    fn test_gsma_rat_generations() {
        assert_eq!(
            gsma_rat_bitmask_generations(GSMA_RAT_MASK_2G | GSMA_RAT_MASK_4G),
            vec!["2G", "4G"]
        );
        assert!(gsma_rat_bitmask_generations(0).is_empty());
    }
}
