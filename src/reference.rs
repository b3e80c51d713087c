// Reference data stores: GSMA TAC db, registration/stolen/pairing lists,
// barred/monitoring/association lists and registered subscribers
use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use redb::{ReadableTable, TableError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::shard::{calc_virt_imei_shard, imei_shard_name, normalize_imei, virt_imei_shard_bounds};
use crate::store::{str_table, Store, TableFamily};

pub const GSMA_TABLE: &str = "gsma_data";
pub const REGISTRATION_TABLE: &str = "historic_registration_list";
pub const STOLEN_TABLE: &str = "historic_stolen_list";
pub const PAIRING_TABLE: &str = "historic_pairing_list";
pub const MONITORING_TABLE: &str = "historic_monitoring_list";
pub const SUBSCRIBERS_TABLE: &str = "subscribers_registration_list";
pub const BARRED_BASE: &str = "historic_barred_list";
pub const ASSOCIATION_BASE: &str = "historic_device_association_list";

/// One row of the GSMA TAC reference, keyed by 8-digit TAC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GsmaRecord {
    pub tac: String,
    pub manufacturer: Option<String>,
    pub model_name: Option<String>,
    pub device_type: Option<String>,
    pub rat_bitmask: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub make: Option<String>,
    pub model: Option<String>,
    pub status: Option<String>,
    pub model_number: Option<String>,
    pub brand_name: Option<String>,
    pub device_type: Option<String>,
    pub radio_interface: Option<String>,
    pub device_id: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StolenRecord {
    pub reporting_date: Option<NaiveDate>,
    pub status: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingRecord {
    pub imsi: String,
    pub msisdn: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BarredRecord {
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitoringRecord {
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssociationRecord {
    pub uid: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriberRecord {
    pub uid: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

/// Registration entries count as approved when the status is NULL or
/// 'whitelist'; anything else is provisional or revoked.
pub fn registration_status_is_approved(status: Option<&str>) -> bool {
    match status {
        None => true,
        Some(s) => s.eq_ignore_ascii_case("whitelist"),
    }
}

/// Common behavior of historic list entries: identity plus validity dates.
pub trait HistoricEntry: Clone + Serialize + DeserializeOwned {
    fn end_date(&self) -> Option<NaiveDate>;
    fn set_end_date(&mut self, date: Option<NaiveDate>);
    /// Identity comparison, ignoring validity dates.
    fn same_entry(&self, other: &Self) -> bool;
}

macro_rules! historic_entry {
    ($ty:ty, $($field:ident),*) => {
        impl HistoricEntry for $ty {
            fn end_date(&self) -> Option<NaiveDate> {
                self.end_date
            }
            fn set_end_date(&mut self, date: Option<NaiveDate>) {
                self.end_date = date;
            }
            #[allow(unused_variables)]
            fn same_entry(&self, other: &Self) -> bool {
                true $(&& self.$field == other.$field)*
            }
        }
    };
}

historic_entry!(RegistrationRecord, status, make, model);
historic_entry!(StolenRecord, reporting_date, status);
historic_entry!(PairingRecord, imsi);
historic_entry!(BarredRecord,);
historic_entry!(MonitoringRecord,);
historic_entry!(AssociationRecord, uid);
historic_entry!(SubscriberRecord, uid);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub rows_in_file: u64,
    pub inserted: u64,
    pub removed: u64,
    pub unchanged: u64,
}

/// Full import of a historic list keyed by a string identifier. Entries in
/// the file that have no matching active row are appended as current;
/// active rows with no counterpart in the file are closed with
/// end_date = curr_date. Re-importing the same file is a no-op.
pub fn historic_full_import<T: HistoricEntry>(
    store: &Store,
    table_for_key: impl Fn(&str) -> String,
    all_tables: &[String],
    new_entries: &HashMap<String, Vec<T>>,
    curr_date: NaiveDate,
) -> Result<ImportStats> {
    let mut stats = ImportStats::default();

    // Existing state, keyed the same way
    let mut existing: HashMap<String, Vec<T>> = HashMap::new();
    {
        let txn = store.begin_read()?;
        for table_name in all_tables {
            let table = match txn.open_table(str_table(table_name)) {
                Ok(t) => t,
                Err(TableError::TableDoesNotExist(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in table.iter()? {
                let (k, v) = entry?;
                let records: Vec<T> = bincode::deserialize(v.value())?;
                existing.insert(k.value().to_string(), records);
            }
        }
    }

    let mut all_keys: HashSet<String> = existing.keys().cloned().collect();
    all_keys.extend(new_entries.keys().cloned());

    let txn = store.begin_write(TableFamily::ReferenceLists)?;
    {
        for key in &all_keys {
            let mut records = existing.remove(key).unwrap_or_default();
            let incoming = new_entries.get(key).map(Vec::as_slice).unwrap_or(&[]);
            let mut changed = false;

            // Close active rows absent from the new file
            for record in records.iter_mut() {
                if record.end_date().is_none()
                    && !incoming.iter().any(|n| n.same_entry(record))
                {
                    record.set_end_date(Some(curr_date));
                    stats.removed += 1;
                    changed = true;
                }
            }

            // Append genuinely new entries
            for entry in incoming {
                if records
                    .iter()
                    .any(|r| r.end_date().is_none() && r.same_entry(entry))
                {
                    stats.unchanged += 1;
                } else {
                    records.push(entry.clone());
                    stats.inserted += 1;
                    changed = true;
                }
            }

            if changed {
                let table_name = table_for_key(key);
                let mut table = txn.open_table(str_table(&table_name))?;
                let bytes = bincode::serialize(&records)?;
                table.insert(key.as_str(), bytes.as_slice())?;
            }
        }
    }
    store.commit(txn)?;
    Ok(stats)
}

/// Active (end_date IS NULL) entries of one historic table.
pub fn active_entries<T: HistoricEntry>(
    txn: &redb::ReadTransaction,
    table_name: &str,
) -> Result<HashMap<String, Vec<T>>> {
    let table = match txn.open_table(str_table(table_name)) {
        Ok(t) => t,
        Err(TableError::TableDoesNotExist(_)) => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = HashMap::new();
    for entry in table.iter()? {
        let (k, v) = entry?;
        let records: Vec<T> = bincode::deserialize(v.value())?;
        let active: Vec<T> = records
            .into_iter()
            .filter(|r| r.end_date().is_none())
            .collect();
        if !active.is_empty() {
            out.insert(k.value().to_string(), active);
        }
    }
    Ok(out)
}

/// All entries (historic included) for one key.
pub fn entries_for_key<T: HistoricEntry>(
    txn: &redb::ReadTransaction,
    table_name: &str,
    key: &str,
) -> Result<Vec<T>> {
    Ok(crate::store::get_value(txn, table_name, key)?.unwrap_or_default())
}

/// Leaf table of a sharded historic list for one IMEI.
pub fn shard_leaf_for_imei(store: &Store, base_name: &str, imei_norm: &str) -> Result<String> {
    let num = store.num_physical_shards()?;
    Ok(leaf_for_imei(base_name, num, imei_norm))
}

fn leaf_for_imei(base_name: &str, num_physical_shards: u32, imei_norm: &str) -> String {
    let virt = calc_virt_imei_shard(Some(imei_norm));
    let (lo, hi) = virt_imei_shard_bounds(num_physical_shards)
        .into_iter()
        .find(|(lo, hi)| virt >= *lo && virt < *hi)
        .expect("shard bounds cover [0, 100)");
    imei_shard_name(base_name, lo, hi)
}

fn all_shard_leaves(store: &Store, base_name: &str) -> Result<Vec<String>> {
    let num = store.num_physical_shards()?;
    Ok(virt_imei_shard_bounds(num)
        .into_iter()
        .map(|(lo, hi)| imei_shard_name(base_name, lo, hi))
        .collect())
}

// ---------------------------------------------------------------------------
// CSV importers
// ---------------------------------------------------------------------------

/// Case-insensitive header lookup into a CSV record.
pub struct HeaderMap {
    indices: HashMap<String, usize>,
}

impl HeaderMap {
    pub fn new(headers: &csv::StringRecord) -> Self {
        let indices = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim().to_lowercase(), i))
            .collect();
        HeaderMap { indices }
    }

    pub fn require(&self, names: &[&str]) -> Result<()> {
        for name in names {
            if !self.indices.contains_key(*name) {
                return Err(anyhow::anyhow!("missing required CSV header '{}'", name));
            }
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    /// Field value, with the empty string read as NULL.
    pub fn get<'r>(&self, record: &'r csv::StringRecord, name: &str) -> Option<&'r str> {
        self.indices
            .get(name)
            .and_then(|i| record.get(*i))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

fn csv_reader_for(path: &Path) -> Result<csv::Reader<Box<dyn std::io::Read>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open input file {:?}", path))?;
    let reader: Box<dyn std::io::Read> =
        if path.extension().and_then(|e| e.to_str()) == Some("gz") {
            Box::new(flate2::read::GzDecoder::new(file))
        } else {
            Box::new(file)
        };
    Ok(csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(reader))
}

/// Import the GSMA TAC reference. This is a plain replacement: the GSMA db
/// is versioned upstream and carries no end_date history here.
pub fn import_gsma_data(store: &Store, path: &Path) -> Result<u64> {
    let _lock = store.acquire_import_lock("gsma", "")?;
    let mut reader = csv_reader_for(path)?;
    let headers = HeaderMap::new(&reader.headers()?.clone());
    headers.require(&["tac"])?;

    let mut records: Vec<GsmaRecord> = Vec::new();
    for row in reader.records() {
        let row = row?;
        let tac = match headers.get(&row, "tac") {
            Some(t) => t.to_string(),
            None => continue,
        };
        if tac.len() != 8 || !tac.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let rat_bitmask = headers
            .get(&row, "rat_bitmask")
            .and_then(|v| parse_bitmask(v))
            .unwrap_or(0);
        records.push(GsmaRecord {
            tac,
            manufacturer: headers.get(&row, "manufacturer").map(String::from),
            model_name: headers.get(&row, "model_name").map(String::from),
            device_type: headers.get(&row, "device_type").map(String::from),
            rat_bitmask,
        });
    }

    let count = records.len() as u64;
    let txn = store.begin_write(TableFamily::ReferenceLists)?;
    {
        let _ = txn.delete_table(str_table(GSMA_TABLE))?;
        let mut table = txn.open_table(str_table(GSMA_TABLE))?;
        for record in &records {
            let bytes = bincode::serialize(record)?;
            table.insert(record.tac.as_str(), bytes.as_slice())?;
        }
    }
    store.commit(txn)?;
    info!("imported {} GSMA TAC records", count);
    Ok(count)
}

fn parse_bitmask(value: &str) -> Option<u32> {
    if let Some(hex) = value.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

pub fn gsma_record(txn: &redb::ReadTransaction, tac: &str) -> Result<Option<GsmaRecord>> {
    crate::store::get_value(txn, GSMA_TABLE, tac)
}

pub fn scan_gsma(txn: &redb::ReadTransaction) -> Result<HashMap<String, GsmaRecord>> {
    let table = match txn.open_table(str_table(GSMA_TABLE)) {
        Ok(t) => t,
        Err(TableError::TableDoesNotExist(_)) => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = HashMap::new();
    for entry in table.iter()? {
        let (k, v) = entry?;
        out.insert(k.value().to_string(), bincode::deserialize(v.value())?);
    }
    Ok(out)
}

/// Import the registration list (approved IMEIs with status).
pub fn import_registration_list(
    store: &Store,
    path: &Path,
    curr_date: NaiveDate,
) -> Result<ImportStats> {
    let _lock = store.acquire_import_lock("registration_list", "")?;
    let mut reader = csv_reader_for(path)?;
    let headers = HeaderMap::new(&reader.headers()?.clone());
    headers.require(&["approved_imei"])?;

    let mut new_entries: HashMap<String, Vec<RegistrationRecord>> = HashMap::new();
    let mut rows = 0u64;
    for row in reader.records() {
        let row = row?;
        rows += 1;
        let imei = match headers.get(&row, "approved_imei") {
            Some(v) => normalize_imei(v),
            None => continue,
        };
        new_entries
            .entry(imei)
            .or_default()
            .push(RegistrationRecord {
                make: headers.get(&row, "make").map(String::from),
                model: headers.get(&row, "model").map(String::from),
                status: headers.get(&row, "status").map(|s| s.to_lowercase()),
                model_number: headers.get(&row, "model_number").map(String::from),
                brand_name: headers.get(&row, "brand_name").map(String::from),
                device_type: headers.get(&row, "device_type").map(String::from),
                radio_interface: headers.get(&row, "radio_interface").map(String::from),
                device_id: headers.get(&row, "device_id").map(String::from),
                start_date: curr_date,
                end_date: None,
            });
    }

    let mut stats = historic_full_import(
        store,
        |_| REGISTRATION_TABLE.to_string(),
        &[REGISTRATION_TABLE.to_string()],
        &new_entries,
        curr_date,
    )?;
    stats.rows_in_file = rows;
    Ok(stats)
}

/// Import the stolen list (reporting-date-indexed).
pub fn import_stolen_list(store: &Store, path: &Path, curr_date: NaiveDate) -> Result<ImportStats> {
    let _lock = store.acquire_import_lock("stolen_list", "")?;
    let mut reader = csv_reader_for(path)?;
    let headers = HeaderMap::new(&reader.headers()?.clone());
    headers.require(&["imei"])?;

    let mut new_entries: HashMap<String, Vec<StolenRecord>> = HashMap::new();
    let mut rows = 0u64;
    for row in reader.records() {
        let row = row?;
        rows += 1;
        let imei = match headers.get(&row, "imei") {
            Some(v) => normalize_imei(v),
            None => continue,
        };
        let reporting_date = headers
            .get(&row, "reporting_date")
            .and_then(|v| crate::config::parse_flexible_date(v).ok());
        new_entries.entry(imei).or_default().push(StolenRecord {
            reporting_date,
            status: headers.get(&row, "status").map(|s| s.to_lowercase()),
            start_date: curr_date,
            end_date: None,
        });
    }

    let mut stats = historic_full_import(
        store,
        |_| STOLEN_TABLE.to_string(),
        &[STOLEN_TABLE.to_string()],
        &new_entries,
        curr_date,
    )?;
    stats.rows_in_file = rows;
    Ok(stats)
}

/// Import the pairing list (IMEI-IMSI associations).
pub fn import_pairing_list(store: &Store, path: &Path, curr_date: NaiveDate) -> Result<ImportStats> {
    let _lock = store.acquire_import_lock("pairing_list", "")?;
    let mut reader = csv_reader_for(path)?;
    let headers = HeaderMap::new(&reader.headers()?.clone());
    headers.require(&["imei", "imsi"])?;

    let mut new_entries: HashMap<String, Vec<PairingRecord>> = HashMap::new();
    let mut rows = 0u64;
    for row in reader.records() {
        let row = row?;
        rows += 1;
        let (imei, imsi) = match (headers.get(&row, "imei"), headers.get(&row, "imsi")) {
            (Some(imei), Some(imsi)) => (normalize_imei(imei), imsi.to_string()),
            _ => continue,
        };
        new_entries.entry(imei).or_default().push(PairingRecord {
            imsi,
            msisdn: headers.get(&row, "msisdn").map(String::from),
            start_date: curr_date,
            end_date: None,
        });
    }

    let mut stats = historic_full_import(
        store,
        |_| PAIRING_TABLE.to_string(),
        &[PAIRING_TABLE.to_string()],
        &new_entries,
        curr_date,
    )?;
    stats.rows_in_file = rows;
    Ok(stats)
}

/// Import the barred list, sharded by IMEI.
pub fn import_barred_list(store: &Store, path: &Path, curr_date: NaiveDate) -> Result<ImportStats> {
    let _lock = store.acquire_import_lock("barred_list", "")?;
    let mut reader = csv_reader_for(path)?;
    let headers = HeaderMap::new(&reader.headers()?.clone());
    headers.require(&["imei"])?;

    let mut new_entries: HashMap<String, Vec<BarredRecord>> = HashMap::new();
    let mut rows = 0u64;
    for row in reader.records() {
        let row = row?;
        rows += 1;
        if let Some(imei) = headers.get(&row, "imei") {
            new_entries
                .entry(normalize_imei(imei))
                .or_default()
                .push(BarredRecord {
                    start_date: curr_date,
                    end_date: None,
                });
        }
    }

    let num_shards = store.num_physical_shards()?;
    let leaves = all_shard_leaves(store, BARRED_BASE)?;
    let mut stats = historic_full_import(
        store,
        |imei| leaf_for_imei(BARRED_BASE, num_shards, imei),
        &leaves,
        &new_entries,
        curr_date,
    )?;
    stats.rows_in_file = rows;
    Ok(stats)
}

/// Import the monitoring list.
pub fn import_monitoring_list(
    store: &Store,
    path: &Path,
    curr_date: NaiveDate,
) -> Result<ImportStats> {
    let _lock = store.acquire_import_lock("monitoring_list", "")?;
    let mut reader = csv_reader_for(path)?;
    let headers = HeaderMap::new(&reader.headers()?.clone());
    headers.require(&["imei"])?;

    let mut new_entries: HashMap<String, Vec<MonitoringRecord>> = HashMap::new();
    let mut rows = 0u64;
    for row in reader.records() {
        let row = row?;
        rows += 1;
        if let Some(imei) = headers.get(&row, "imei") {
            new_entries
                .entry(normalize_imei(imei))
                .or_default()
                .push(MonitoringRecord {
                    start_date: curr_date,
                    end_date: None,
                });
        }
    }

    let mut stats = historic_full_import(
        store,
        |_| MONITORING_TABLE.to_string(),
        &[MONITORING_TABLE.to_string()],
        &new_entries,
        curr_date,
    )?;
    stats.rows_in_file = rows;
    Ok(stats)
}

/// Import the device association list (IMEI-UID), sharded by IMEI.
pub fn import_association_list(
    store: &Store,
    path: &Path,
    curr_date: NaiveDate,
) -> Result<ImportStats> {
    let _lock = store.acquire_import_lock("association_list", "")?;
    let mut reader = csv_reader_for(path)?;
    let headers = HeaderMap::new(&reader.headers()?.clone());
    headers.require(&["imei", "uid"])?;

    let mut new_entries: HashMap<String, Vec<AssociationRecord>> = HashMap::new();
    let mut rows = 0u64;
    for row in reader.records() {
        let row = row?;
        rows += 1;
        if let (Some(imei), Some(uid)) = (headers.get(&row, "imei"), headers.get(&row, "uid")) {
            new_entries
                .entry(normalize_imei(imei))
                .or_default()
                .push(AssociationRecord {
                    uid: uid.to_string(),
                    start_date: curr_date,
                    end_date: None,
                });
        }
    }

    let num_shards = store.num_physical_shards()?;
    let leaves = all_shard_leaves(store, ASSOCIATION_BASE)?;
    let mut stats = historic_full_import(
        store,
        |imei| leaf_for_imei(ASSOCIATION_BASE, num_shards, imei),
        &leaves,
        &new_entries,
        curr_date,
    )?;
    stats.rows_in_file = rows;
    Ok(stats)
}

/// Import the subscriber registration list (UID-IMSI), keyed by IMSI.
pub fn import_subscribers_list(
    store: &Store,
    path: &Path,
    curr_date: NaiveDate,
) -> Result<ImportStats> {
    let _lock = store.acquire_import_lock("subscribers_registration_list", "")?;
    let mut reader = csv_reader_for(path)?;
    let headers = HeaderMap::new(&reader.headers()?.clone());
    headers.require(&["uid", "imsi"])?;

    let mut new_entries: HashMap<String, Vec<SubscriberRecord>> = HashMap::new();
    let mut rows = 0u64;
    for row in reader.records() {
        let row = row?;
        rows += 1;
        if let (Some(uid), Some(imsi)) = (headers.get(&row, "uid"), headers.get(&row, "imsi")) {
            new_entries
                .entry(imsi.to_string())
                .or_default()
                .push(SubscriberRecord {
                    uid: uid.to_string(),
                    start_date: curr_date,
                    end_date: None,
                });
        }
    }

    let mut stats = historic_full_import(
        store,
        |_| SUBSCRIBERS_TABLE.to_string(),
        &[SUBSCRIBERS_TABLE.to_string()],
        &new_entries,
        curr_date,
    )?;
    stats.rows_in_file = rows;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::create_core_shard_partitions;
    use crate::store::Store;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_csv(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_gsma_import_and_lookup() -> Result<()> {
        let dir = tempdir()?;
        let store = Store::install(&dir.path().join("core.redb"), 4)?;
        let path = write_csv(
            dir.path(),
            "gsma.csv",
            "TAC,manufacturer,model_name,device_type,rat_bitmask\n\
             01234567,AcmePhones,X100,Smartphone,4672\n\
             21154034,AcmePhones,Y200,Feature phone,64\n\
             bad_tac,Nope,Z,Tablet,0\n",
        );
        let count = import_gsma_data(&store, &path)?;
        assert_eq!(count, 2);

        let txn = store.begin_read()?;
        let rec = gsma_record(&txn, "01234567")?.unwrap();
        assert_eq!(rec.model_name.as_deref(), Some("X100"));
        assert_eq!(rec.rat_bitmask, 4672);
        assert!(gsma_record(&txn, "99999999")?.is_none());
        Ok(())
    }

    #[test]
    fn test_registration_import_closes_absent_rows() -> Result<()> {
        let dir = tempdir()?;
        let store = Store::install(&dir.path().join("core.redb"), 4)?;
        let header = "approved_imei,make,model,status,model_number,brand_name,device_type,radio_interface,device_id\n";

        let v1 = write_csv(
            dir.path(),
            "reg1.csv",
            &format!(
                "{}38847733370026,Acme,A1,whitelist,,,Smartphone,,\n10000000000000,Acme,A2,pending,,,Smartphone,,\n",
                header
            ),
        );
        let stats = import_registration_list(&store, &v1, d(2017, 1, 1))?;
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.removed, 0);

        // Second import drops one IMEI: its row closes
        let v2 = write_csv(
            dir.path(),
            "reg2.csv",
            &format!("{}38847733370026,Acme,A1,whitelist,,,Smartphone,,\n", header),
        );
        let stats = import_registration_list(&store, &v2, d(2017, 2, 1))?;
        assert_eq!(stats.inserted, 0);
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.removed, 1);

        let txn = store.begin_read()?;
        let active: HashMap<String, Vec<RegistrationRecord>> =
            active_entries(&txn, REGISTRATION_TABLE)?;
        assert!(active.contains_key("38847733370026"));
        assert!(!active.contains_key("10000000000000"));
        let all: Vec<RegistrationRecord> =
            entries_for_key(&txn, REGISTRATION_TABLE, "10000000000000")?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].end_date, Some(d(2017, 2, 1)));
        Ok(())
    }

    #[test]
    fn test_reimport_is_noop() -> Result<()> {
        let dir = tempdir()?;
        let store = Store::install(&dir.path().join("core.redb"), 4)?;
        let path = write_csv(
            dir.path(),
            "stolen.csv",
            "imei,reporting_date,status\n3884773337002633,20160701,\n",
        );
        let first = import_stolen_list(&store, &path, d(2016, 8, 1))?;
        assert_eq!(first.inserted, 1);
        let second = import_stolen_list(&store, &path, d(2016, 8, 2))?;
        assert_eq!(second.inserted, 0);
        assert_eq!(second.removed, 0);
        assert_eq!(second.unchanged, 1);

        let txn = store.begin_read()?;
        let all: Vec<StolenRecord> = entries_for_key(&txn, STOLEN_TABLE, "38847733370026")?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].reporting_date, Some(d(2016, 7, 1)));
        Ok(())
    }

    #[test]
    fn test_barred_import_is_sharded() -> Result<()> {
        let dir = tempdir()?;
        let store = Store::install(&dir.path().join("core.redb"), 4)?;
        create_core_shard_partitions(&store)?;
        let path = write_csv(dir.path(), "barred.csv", "imei\n38847733370026\n");
        let stats = import_barred_list(&store, &path, d(2017, 1, 1))?;
        assert_eq!(stats.inserted, 1);

        let leaf = shard_leaf_for_imei(&store, BARRED_BASE, "38847733370026")?;
        let txn = store.begin_read()?;
        let active: HashMap<String, Vec<BarredRecord>> = active_entries(&txn, &leaf)?;
        assert!(active.contains_key("38847733370026"));
        Ok(())
    }

    #[test]
    fn test_registration_status_filter() {
        assert!(registration_status_is_approved(None));
        assert!(registration_status_is_approved(Some("whitelist")));
        assert!(registration_status_is_approved(Some("Whitelist")));
        assert!(!registration_status_is_approved(Some("pending")));
        assert!(!registration_status_is_approved(Some("revoked")));
    }
}
