// Admin operations: schema install/check/upgrade, repartitioning to a new
// physical shard count and pruning of aged data
use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Result;
use chrono::{Datelike, NaiveDate, Utc};
use tracing::{info, warn};

use crate::classify::{ClassificationRecord, CLASSIFICATION_STATE_BASE};
use crate::config::AppConfig;
use crate::error::SchemaError;
use crate::job::JobRecorder;
use crate::partition::{
    self, fillfactor_for_month, monthly_network_triplets_country_partition,
    monthly_network_triplets_per_mno_partition, PartitionMeta,
};
use crate::reference::{ASSOCIATION_BASE, BARRED_BASE};
use crate::shard::{calc_virt_imei_shard, imei_shard_name, virt_imei_shard_bounds};
use crate::store::{put_value, str_table, u64_table, Store, TableFamily, SCHEMA_VERSION};
use crate::triplets::TripletRecord;

/// Create a fresh store with its schema metadata and the core sharded
/// partitions.
pub fn db_install(path: &Path, num_physical_shards: u32) -> Result<()> {
    if !(1..=100).contains(&num_physical_shards) {
        return Err(crate::error::ConfigError(
            "num_physical_shards must be between 1 and 100".to_string(),
        )
        .into());
    }
    let store = Store::install(path, num_physical_shards)?;
    partition::create_core_shard_partitions(&store)?;
    info!(
        "Installed schema version {} with {} physical shards",
        SCHEMA_VERSION, num_physical_shards
    );
    Ok(())
}

/// Verify that the schema is installed, versioned correctly and that every
/// core shard partition exists.
pub fn db_check(store: &Store) -> Result<()> {
    let schema = store.schema()?;
    if schema.schema_version != SCHEMA_VERSION {
        return Err(SchemaError::VersionMismatch {
            found: schema.schema_version,
            required: SCHEMA_VERSION,
        }
        .into());
    }
    for base in [
        "network_imeis",
        CLASSIFICATION_STATE_BASE,
        BARRED_BASE,
        ASSOCIATION_BASE,
    ] {
        for (lo, hi) in virt_imei_shard_bounds(schema.phys_shards) {
            let leaf = imei_shard_name(base, lo, hi);
            if !partition::partition_exists(store, &leaf)? {
                return Err(SchemaError::MissingPartition(leaf).into());
            }
        }
    }
    info!("Schema check passed (version {})", schema.schema_version);
    Ok(())
}

/// Migrate the store to the current schema version. With no older released
/// layouts in the field this only stamps the version.
pub fn db_upgrade(store: &Store) -> Result<()> {
    let schema = store.schema()?;
    if schema.schema_version == SCHEMA_VERSION {
        info!("Schema already at version {}", SCHEMA_VERSION);
        return Ok(());
    }
    if schema.schema_version > SCHEMA_VERSION {
        return Err(SchemaError::VersionMismatch {
            found: schema.schema_version,
            required: SCHEMA_VERSION,
        }
        .into());
    }
    store.set_schema_version(SCHEMA_VERSION)?;
    info!(
        "Upgraded schema from version {} to {}",
        schema.schema_version, SCHEMA_VERSION
    );
    Ok(())
}

/// Repartition every sharded table family to a new physical shard count:
/// build `_new` shadow partitions, copy the data re-bucketed, drop the old
/// leaves, rename the shadows into place, then update the shard count.
pub fn repartition(store: &Store, num_physical_shards: u32) -> Result<()> {
    if !(1..=100).contains(&num_physical_shards) {
        return Err(crate::error::ConfigError(
            "num_physical_shards must be between 1 and 100".to_string(),
        )
        .into());
    }
    let job = JobRecorder::start(store, "dirbs-db", Some("repartition"))?;
    let result = run_repartition(store, num_physical_shards);
    match &result {
        Ok(()) => job.finish_success(store)?,
        Err(err) => job.finish_error(store, &err.to_string())?,
    }
    result
}

fn run_repartition(store: &Store, new_shards: u32) -> Result<()> {
    info!("Repartitioning to {} physical shards...", new_shards);
    repartition_monthly_network_triplets(store, new_shards)?;
    for base in [
        "network_imeis",
        CLASSIFICATION_STATE_BASE,
        BARRED_BASE,
        ASSOCIATION_BASE,
    ] {
        repartition_str_keyed(store, base, new_shards)?;
    }
    store.set_num_physical_shards(new_shards)?;
    info!("Repartitioned to {} physical shards", new_shards);
    Ok(())
}

fn repartition_monthly_network_triplets(store: &Store, new_shards: u32) -> Result<()> {
    let bounds = virt_imei_shard_bounds(new_shards);

    for family in [
        "monthly_network_triplets_country",
        "monthly_network_triplets_per_mno",
    ] {
        let leaves = partition::family_partitions(store, family)?;
        let country = family == "monthly_network_triplets_country";

        // (operator, year, month) tuples present, plus the newest month for
        // the fillfactor policy
        let mut tuples: Vec<(Option<String>, i32, u32)> = leaves
            .iter()
            .filter_map(|(_, meta)| match (meta.year, meta.month) {
                (Some(y), Some(m)) => Some((meta.operator_id.clone(), y, m)),
                _ => None,
            })
            .collect();
        tuples.sort();
        tuples.dedup();
        let latest = tuples.iter().map(|(_, y, m)| (*y, *m)).max();

        // Shadow partitions at the new shard count
        for (operator, year, month) in &tuples {
            let fillfactor = fillfactor_for_month(*year, *month, latest);
            match operator {
                Some(op) => partition::create_monthly_network_triplets_per_mno_partition(
                    store,
                    op,
                    *year,
                    *month,
                    "_new",
                    Some(new_shards),
                    fillfactor,
                )?,
                None => partition::create_monthly_network_triplets_country_partition(
                    store,
                    *year,
                    *month,
                    "_new",
                    Some(new_shards),
                    fillfactor,
                )?,
            }
        }

        // Copy data into the new leaves, re-bucketed by virtual shard
        let txn = store.begin_write(TableFamily::Triplets)?;
        {
            for (leaf, meta) in &leaves {
                let records: Vec<TripletRecord> = {
                    let table = match txn.open_table(u64_table(leaf)) {
                        Ok(t) => t,
                        Err(redb::TableError::TableDoesNotExist(_)) => continue,
                        Err(e) => return Err(e.into()),
                    };
                    let mut out = Vec::new();
                    for entry in redb::ReadableTable::iter(&table)? {
                        let (_, v) = entry?;
                        out.push(bincode::deserialize(v.value())?);
                    }
                    out
                };
                let (year, month) = (meta.year.unwrap(), meta.month.unwrap());
                let new_base = match &meta.operator_id {
                    Some(op) => {
                        monthly_network_triplets_per_mno_partition(op, year, month, "_new")
                    }
                    None => monthly_network_triplets_country_partition(year, month, "_new"),
                };
                for record in records {
                    let (lo, hi) = bounds
                        .iter()
                        .find(|(lo, hi)| record.virt_imei_shard >= *lo && record.virt_imei_shard < *hi)
                        .copied()
                        .expect("shard bounds cover [0, 100)");
                    let new_leaf = imei_shard_name(&new_base, lo, hi);
                    let mut table = txn.open_table(u64_table(&new_leaf))?;
                    let bytes = bincode::serialize(&record)?;
                    table.insert(record.triplet_hash, bytes.as_slice())?;
                }
            }
        }
        store.commit(txn)?;

        // Backfill the secondary indices on the shadow leaves
        let indices = if country {
            partition::monthly_network_triplets_country_indices()
        } else {
            partition::monthly_network_triplets_per_mno_indices()
        };
        let shadow_family = format!("{}_new", family);
        for (leaf, _) in partition::family_partitions(store, &shadow_family)? {
            partition::add_indices(store, &leaf, &indices, |_, bytes| {
                match bincode::deserialize::<TripletRecord>(bytes) {
                    Ok(record) => vec![
                        ("imei_norm".to_string(), record.imei_norm),
                        ("msisdn".to_string(), record.msisdn),
                    ],
                    Err(_) => Vec::new(),
                }
            })?;
        }

        partition::drop_family(store, family)?;
        partition::rename_table_and_indices(store, &shadow_family, family, &indices)?;
    }
    Ok(())
}

/// Repartition an imei-keyed table family (network_imeis,
/// classification_state, historic lists): the key itself determines the
/// destination shard.
fn repartition_str_keyed(store: &Store, base: &str, new_shards: u32) -> Result<()> {
    let bounds = virt_imei_shard_bounds(new_shards);
    let new_base = format!("{}_new", base);
    let meta_template = PartitionMeta {
        base_name: new_base.clone(),
        operator_id: None,
        year: None,
        month: None,
        shard_start: 0,
        shard_end: 0,
        fillfactor: partition::FILLFACTOR_PACKED,
        hash_keyed: false,
    };
    partition::create_imei_shard_partitions(store, &new_base, &meta_template, &[], Some(new_shards))?;

    let leaves = partition::family_partitions(store, base)?;
    let txn = store.begin_write(TableFamily::Catalog)?;
    {
        for (leaf, _) in &leaves {
            let rows: Vec<(String, Vec<u8>)> = {
                let table = match txn.open_table(str_table(leaf)) {
                    Ok(t) => t,
                    Err(redb::TableError::TableDoesNotExist(_)) => continue,
                    Err(e) => return Err(e.into()),
                };
                let mut out = Vec::new();
                for entry in redb::ReadableTable::iter(&table)? {
                    let (k, v) = entry?;
                    out.push((k.value().to_string(), v.value().to_vec()));
                }
                out
            };
            for (imei, bytes) in rows {
                let virt = calc_virt_imei_shard(Some(&imei));
                let (lo, hi) = bounds
                    .iter()
                    .find(|(lo, hi)| virt >= *lo && virt < *hi)
                    .copied()
                    .expect("shard bounds cover [0, 100)");
                let new_leaf = imei_shard_name(&new_base, lo, hi);
                let mut table = txn.open_table(str_table(&new_leaf))?;
                table.insert(imei.as_str(), bytes.as_slice())?;
            }
        }
    }
    store.commit(txn)?;

    partition::drop_family(store, base)?;
    partition::rename_table_and_indices(store, &new_base, base, &[])?;
    Ok(())
}

/// Drop monthly triplet partitions older than the retention window.
pub fn prune_triplets(
    store: &Store,
    config: &AppConfig,
    curr_date: Option<NaiveDate>,
) -> Result<Vec<String>> {
    let job = JobRecorder::start(store, "dirbs-prune", Some("triplets"))?;
    let result = run_prune_triplets(store, config, curr_date);
    match &result {
        Ok(dropped) => {
            job.add_metadata(store, "dropped_partitions", serde_json::to_value(dropped)?)?;
            job.finish_success(store)?;
        }
        Err(err) => job.finish_error(store, &err.to_string())?,
    }
    result
}

fn run_prune_triplets(
    store: &Store,
    config: &AppConfig,
    curr_date: Option<NaiveDate>,
) -> Result<Vec<String>> {
    let curr_date = curr_date.unwrap_or_else(|| Utc::now().date_naive());
    let cutoff = retention_cutoff(curr_date, config.retention.months_retention);
    info!(
        "Pruning monthly_network_triplets data older than {}...",
        cutoff
    );

    let mut dropped = Vec::new();
    for family in [
        "monthly_network_triplets_country",
        "monthly_network_triplets_per_mno",
    ] {
        let mut bases: HashSet<String> = HashSet::new();
        for (_, meta) in partition::family_partitions(store, family)? {
            if let (Some(year), Some(month)) = (meta.year, meta.month) {
                let month_start = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
                if month_start < cutoff {
                    let base = match &meta.operator_id {
                        Some(op) => {
                            monthly_network_triplets_per_mno_partition(op, year, month, "")
                        }
                        None => monthly_network_triplets_country_partition(year, month, ""),
                    };
                    bases.insert(base);
                }
            }
        }
        for base in bases {
            partition::drop_partitions(store, &base)?;
            dropped.push(base);
        }
    }
    if dropped.is_empty() {
        info!("No partitions older than the retention window");
    }
    dropped.sort();
    Ok(dropped)
}

/// First day of the oldest retained month.
pub fn retention_cutoff(curr_date: NaiveDate, months_retention: u32) -> NaiveDate {
    let first_of_month =
        NaiveDate::from_ymd_opt(curr_date.year(), curr_date.month(), 1).unwrap();
    first_of_month
        .checked_sub_months(chrono::Months::new(months_retention))
        .unwrap_or(NaiveDate::MIN)
}

/// Hard-delete classification rows for conditions no longer configured
/// whose matches ended before the retention horizon.
pub fn prune_classification_state(
    store: &Store,
    config: &AppConfig,
    curr_date: Option<NaiveDate>,
) -> Result<u64> {
    let job = JobRecorder::start(store, "dirbs-prune", Some("classification_state"))?;
    let result = run_prune_classification(store, config, curr_date);
    match &result {
        Ok(removed) => {
            job.add_metadata(store, "rows_removed", serde_json::json!(removed))?;
            job.finish_success(store)?;
        }
        Err(err) => job.finish_error(store, &err.to_string())?,
    }
    result
}

fn run_prune_classification(
    store: &Store,
    config: &AppConfig,
    curr_date: Option<NaiveDate>,
) -> Result<u64> {
    let curr_date = curr_date.unwrap_or_else(|| Utc::now().date_naive());
    let cutoff = retention_cutoff(curr_date, config.retention.months_retention);
    let configured: HashSet<&str> = config.conditions.iter().map(|c| c.label.as_str()).collect();

    let mut removed = 0u64;
    for (leaf, _) in partition::family_partitions(store, CLASSIFICATION_STATE_BASE)? {
        let rows: Vec<(String, Vec<ClassificationRecord>)> = {
            let txn = store.begin_read()?;
            crate::store::scan_table(&txn, &leaf)?
        };
        let mut updates: HashMap<String, Vec<ClassificationRecord>> = HashMap::new();
        for (imei, records) in rows {
            let kept: Vec<ClassificationRecord> = records
                .iter()
                .filter(|r| {
                    configured.contains(r.cond_name.as_str())
                        || r.end_date.map_or(true, |d| d >= cutoff)
                })
                .cloned()
                .collect();
            if kept.len() != records.len() {
                removed += (records.len() - kept.len()) as u64;
                updates.insert(imei, kept);
            }
        }
        if updates.is_empty() {
            continue;
        }
        let txn = store.begin_write(TableFamily::ClassificationState)?;
        {
            for (imei, kept) in &updates {
                if kept.is_empty() {
                    let mut table = txn.open_table(str_table(&leaf))?;
                    table.remove(imei.as_str())?;
                } else {
                    put_value(&txn, &leaf, imei, kept)?;
                }
            }
        }
        store.commit(txn)?;
    }
    if removed > 0 {
        warn!(
            "Pruned {} classification rows for retired conditions",
            removed
        );
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_retention_cutoff() {
        let curr = NaiveDate::from_ymd_opt(2017, 3, 15).unwrap();
        assert_eq!(
            retention_cutoff(curr, 6),
            NaiveDate::from_ymd_opt(2016, 9, 1).unwrap()
        );
        assert_eq!(
            retention_cutoff(curr, 0),
            NaiveDate::from_ymd_opt(2017, 3, 1).unwrap()
        );
    }

    #[test]
    fn test_install_and_check() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("core.redb");
        db_install(&path, 4)?;
        let store = Store::open(&path, crate::store::Role::Admin)?;
        db_check(&store)?;
        Ok(())
    }

    #[test]
    fn test_install_rejects_bad_shard_count() {
        let dir = tempdir().unwrap();
        assert!(db_install(&dir.path().join("a.redb"), 0).is_err());
        assert!(db_install(&dir.path().join("b.redb"), 101).is_err());
    }
}
