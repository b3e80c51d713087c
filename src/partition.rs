// Partition manager: time-and-shard partitioned table hierarchy over redb
use anyhow::Result;
use redb::{ReadableTable, TableError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::SchemaError;
use crate::shard::{hash_string_64bit, imei_shard_name, virt_imei_shard_bounds};
use crate::store::{get_value, put_value, scan_table, str_table, u64_table, Store, TableFamily};

pub const PARTITION_CATALOG_TABLE: &str = "partition_catalog";
pub const INDEX_CATALOG_TABLE: &str = "index_catalog";

/// Fillfactor applied to the most recent month's partitions, which still
/// receive merges.
pub const FILLFACTOR_WRITABLE: u32 = 45;
/// Fillfactor for older months, packed tight for scan performance.
pub const FILLFACTOR_PACKED: u32 = 100;

/// Catalog record for one leaf partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartitionMeta {
    pub base_name: String,
    pub operator_id: Option<String>,
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub shard_start: u32,
    pub shard_end: u32,
    pub fillfactor: u32,
    /// Key shape of the leaf table: triplet partitions are hash-keyed,
    /// everything else is keyed by imei_norm (or another string key).
    pub hash_keyed: bool,
}

/// Metadata about one secondary index on a leaf partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexMeta {
    pub table_name: String,
    pub idx_cols: Vec<String>,
    pub is_unique: bool,
    pub partial: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IndexMetadatum {
    pub idx_cols: &'static [&'static str],
    pub is_unique: bool,
    pub partial: Option<&'static str>,
}

impl IndexMetadatum {
    pub fn new(idx_cols: &'static [&'static str]) -> Self {
        IndexMetadatum {
            idx_cols,
            is_unique: false,
            partial: None,
        }
    }

    pub fn unique(idx_cols: &'static [&'static str]) -> Self {
        IndexMetadatum {
            idx_cols,
            is_unique: true,
            partial: None,
        }
    }

    /// Deterministic index name: stable hash of the table name plus the
    /// column list. Stays under the 63-character identifier bound even for
    /// the longest partition names.
    pub fn idx_name(&self, tbl_name: &str) -> String {
        let name = format!(
            "{:016x}_{}_idx",
            hash_string_64bit(tbl_name),
            self.idx_cols.join("_")
        );
        assert!(name.len() < 64);
        name
    }
}

/// Index metadata for monthly_network_triplets_country partitions.
pub fn monthly_network_triplets_country_indices() -> Vec<IndexMetadatum> {
    vec![
        IndexMetadatum::unique(&["triplet_hash"]),
        IndexMetadatum::new(&["imei_norm"]),
        IndexMetadatum::new(&["msisdn"]),
    ]
}

/// Index metadata for monthly_network_triplets_per_mno partitions.
pub fn monthly_network_triplets_per_mno_indices() -> Vec<IndexMetadatum> {
    vec![
        IndexMetadatum::unique(&["triplet_hash"]),
        IndexMetadatum::new(&["imei_norm"]),
    ]
}

pub fn monthly_network_triplets_country_partition(year: i32, month: u32, suffix: &str) -> String {
    format!(
        "monthly_network_triplets_country{}_{}_{:02}",
        suffix, year, month
    )
}

pub fn monthly_network_triplets_per_mno_partition(
    operator_id: &str,
    year: i32,
    month: u32,
    suffix: &str,
) -> String {
    format!(
        "monthly_network_triplets_per_mno{}_{}_{}_{:02}",
        suffix, operator_id, year, month
    )
}

/// Look up the physical shard leaves for a base table from the current
/// shard count: (leaf_name, range_start, range_end).
pub fn physical_imei_shards(store: &Store, base_name: &str) -> Result<Vec<(String, u32, u32)>> {
    let num = store.num_physical_shards()?;
    Ok(virt_imei_shard_bounds(num)
        .into_iter()
        .map(|(lo, hi)| (imei_shard_name(base_name, lo, hi), lo, hi))
        .collect())
}

pub fn partition_exists(store: &Store, part_name: &str) -> Result<bool> {
    let txn = store.begin_read()?;
    let meta: Option<PartitionMeta> = get_value(&txn, PARTITION_CATALOG_TABLE, part_name)?;
    Ok(meta.is_some())
}

/// Whether any shard leaf of a base partition exists in the catalog.
pub fn partition_exists_any_leaf(store: &Store, base_name: &str) -> Result<bool> {
    Ok(!child_partitions(store, base_name)?.is_empty())
}

/// Create the per-shard leaves of one partition. Idempotence is the
/// caller's business (check `partition_exists` first); a catalog collision
/// here is an error and rolls the whole transaction back.
pub fn create_imei_shard_partitions(
    store: &Store,
    base_name: &str,
    meta_template: &PartitionMeta,
    idx_metadata: &[IndexMetadatum],
    num_physical_shards: Option<u32>,
) -> Result<()> {
    let num = match num_physical_shards {
        Some(n) => n,
        None => store.num_physical_shards()?,
    };
    let txn = store.begin_write(TableFamily::Catalog)?;
    {
        for (lo, hi) in virt_imei_shard_bounds(num) {
            let part_name = imei_shard_name(base_name, lo, hi);
            let catalog = txn.open_table(str_table(PARTITION_CATALOG_TABLE))?;
            if catalog.get(part_name.as_str())?.is_some() {
                return Err(SchemaError::PartitionCollision(part_name).into());
            }
            drop(catalog);

            let meta = PartitionMeta {
                shard_start: lo,
                shard_end: hi,
                ..meta_template.clone()
            };
            put_value(&txn, PARTITION_CATALOG_TABLE, &part_name, &meta)?;

            // Materialize the leaf table and its indices so later read
            // transactions see them even before the first merge.
            if meta.hash_keyed {
                txn.open_table(u64_table(&part_name))?;
            } else {
                txn.open_table(str_table(&part_name))?;
            }
            for idx in idx_metadata {
                let idx_name = idx.idx_name(&part_name);
                txn.open_table(str_table(&idx_name))?;
                let idx_meta = IndexMeta {
                    table_name: part_name.clone(),
                    idx_cols: idx.idx_cols.iter().map(|c| c.to_string()).collect(),
                    is_unique: idx.is_unique,
                    partial: idx.partial.map(|p| p.to_string()),
                };
                put_value(&txn, INDEX_CATALOG_TABLE, &idx_name, &idx_meta)?;
            }
            debug!("created partition {} [{}, {})", part_name, lo, hi);
        }
    }
    store.commit(txn)?;
    Ok(())
}

/// Create a month/year partition of monthly_network_triplets_country.
pub fn create_monthly_network_triplets_country_partition(
    store: &Store,
    year: i32,
    month: u32,
    suffix: &str,
    num_physical_shards: Option<u32>,
    fillfactor: u32,
) -> Result<()> {
    let base = monthly_network_triplets_country_partition(year, month, suffix);
    let meta = PartitionMeta {
        base_name: format!("monthly_network_triplets_country{}", suffix),
        operator_id: None,
        year: Some(year),
        month: Some(month),
        shard_start: 0,
        shard_end: 0,
        fillfactor,
        hash_keyed: true,
    };
    create_imei_shard_partitions(
        store,
        &base,
        &meta,
        &monthly_network_triplets_country_indices(),
        num_physical_shards,
    )
}

/// Create a month/year partition of monthly_network_triplets_per_mno for
/// one operator.
pub fn create_monthly_network_triplets_per_mno_partition(
    store: &Store,
    operator_id: &str,
    year: i32,
    month: u32,
    suffix: &str,
    num_physical_shards: Option<u32>,
    fillfactor: u32,
) -> Result<()> {
    let base = monthly_network_triplets_per_mno_partition(operator_id, year, month, suffix);
    let meta = PartitionMeta {
        base_name: format!("monthly_network_triplets_per_mno{}", suffix),
        operator_id: Some(operator_id.to_string()),
        year: Some(year),
        month: Some(month),
        shard_start: 0,
        shard_end: 0,
        fillfactor,
        hash_keyed: true,
    };
    create_imei_shard_partitions(
        store,
        &base,
        &meta,
        &monthly_network_triplets_per_mno_indices(),
        num_physical_shards,
    )
}

/// Create the sharded singleton tables installed with the schema:
/// network_imeis, classification_state and the historic lists whose
/// dimensions read shard-scoped.
pub fn create_core_shard_partitions(store: &Store) -> Result<()> {
    for base in [
        "network_imeis",
        "classification_state",
        "historic_barred_list",
        "historic_device_association_list",
    ] {
        let meta = PartitionMeta {
            base_name: base.to_string(),
            operator_id: None,
            year: None,
            month: None,
            shard_start: 0,
            shard_end: 0,
            fillfactor: FILLFACTOR_PACKED,
            hash_keyed: false,
        };
        create_imei_shard_partitions(store, base, &meta, &[], None)?;
    }
    Ok(())
}

/// All catalog entries whose name starts with `base_name` followed by a
/// shard or month suffix. Use for month-level bases; for a whole table
/// family prefer `family_partitions`, which will not leak into `_new`
/// shadow families.
pub fn child_partitions(store: &Store, base_name: &str) -> Result<Vec<(String, PartitionMeta)>> {
    let txn = store.begin_read()?;
    let all: Vec<(String, PartitionMeta)> = scan_table(&txn, PARTITION_CATALOG_TABLE)?;
    Ok(all
        .into_iter()
        .filter(|(name, _)| {
            name.strip_prefix(base_name)
                .map(|rest| rest.starts_with('_'))
                .unwrap_or(false)
        })
        .collect())
}

/// Leaves registered under exactly this family base name.
pub fn family_partitions(store: &Store, family_base: &str) -> Result<Vec<(String, PartitionMeta)>> {
    let txn = store.begin_read()?;
    let all: Vec<(String, PartitionMeta)> = scan_table(&txn, PARTITION_CATALOG_TABLE)?;
    Ok(all
        .into_iter()
        .filter(|(_, meta)| meta.base_name == family_base)
        .collect())
}

/// Distinct (year, month) tuples present for a partitioned base table,
/// newest first.
pub fn month_year_tuples(store: &Store, base_name: &str) -> Result<Vec<(i32, u32)>> {
    let mut tuples: Vec<(i32, u32)> = child_partitions(store, base_name)?
        .into_iter()
        .filter_map(|(_, meta)| match (meta.year, meta.month) {
            (Some(y), Some(m)) => Some((y, m)),
            _ => None,
        })
        .collect();
    tuples.sort_unstable();
    tuples.dedup();
    tuples.reverse();
    Ok(tuples)
}

/// Backfill the registered indices of one leaf partition by scanning it.
/// Values are keyed `"{column_value}|{primary_key}"` so one indexed value
/// maps to many rows; NULL column values are never indexed.
pub fn add_indices(
    store: &Store,
    part_name: &str,
    idx_metadata: &[IndexMetadatum],
    extract: impl Fn(&str, &[u8]) -> Vec<(String, Option<String>)>,
) -> Result<()> {
    let meta: PartitionMeta = {
        let txn = store.begin_read()?;
        get_value(&txn, PARTITION_CATALOG_TABLE, part_name)?
            .ok_or_else(|| SchemaError::MissingPartition(part_name.to_string()))?
    };

    let txn = store.begin_write(TableFamily::Catalog)?;
    {
        // Snapshot rows first: (primary key string, per-column values)
        let mut rows: Vec<(String, Vec<(String, Option<String>)>)> = Vec::new();
        if meta.hash_keyed {
            let table = txn.open_table(u64_table(part_name))?;
            for entry in table.iter()? {
                let (k, v) = entry?;
                let key = format!("{:016x}", k.value());
                rows.push((key.clone(), extract(&key, v.value())));
            }
        } else {
            let table = txn.open_table(str_table(part_name))?;
            for entry in table.iter()? {
                let (k, v) = entry?;
                let key = k.value().to_string();
                rows.push((key.clone(), extract(&key, v.value())));
            }
        }

        for idx in idx_metadata {
            let idx_name = idx.idx_name(part_name);
            let mut idx_table = txn.open_table(str_table(&idx_name))?;
            for (primary, cols) in &rows {
                for (col, value) in cols {
                    if idx.idx_cols.contains(&col.as_str()) {
                        if let Some(value) = value {
                            let key = format!("{}|{}", value, primary);
                            idx_table.insert(key.as_str(), &[][..])?;
                        }
                    }
                }
            }
            drop(idx_table);
            let idx_meta = IndexMeta {
                table_name: part_name.to_string(),
                idx_cols: idx.idx_cols.iter().map(|c| c.to_string()).collect(),
                is_unique: idx.is_unique,
                partial: idx.partial.map(|p| p.to_string()),
            };
            put_value(&txn, INDEX_CATALOG_TABLE, &idx_name, &idx_meta)?;
        }
    }
    store.commit(txn)?;
    Ok(())
}

/// Range-scan an index table for one value: returns the primary-key parts.
pub fn index_lookup(
    txn: &redb::ReadTransaction,
    idx_name: &str,
    value: &str,
) -> Result<Vec<String>> {
    let def = str_table(idx_name);
    let table = match txn.open_table(def) {
        Ok(t) => t,
        Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let lower = format!("{}|", value);
    let upper = format!("{}}}", value); // '}' sorts just above '|'
    let mut out = Vec::new();
    for entry in table.range(lower.as_str()..upper.as_str())? {
        let (k, _) = entry?;
        if let Some((_, primary)) = k.value().split_once('|') {
            out.push(primary.to_string());
        }
    }
    Ok(out)
}

/// Rename a table and all of its descendant leaves and indices, atomically
/// within one write transaction. Any collision with an existing partition
/// aborts the entire operation.
pub fn rename_table_and_indices(
    store: &Store,
    old_base: &str,
    new_base: &str,
    idx_metadata: &[IndexMetadatum],
) -> Result<()> {
    let leaves = child_partitions(store, old_base)?;
    let txn = store.begin_write(TableFamily::Catalog)?;
    {
        for (old_name, meta) in &leaves {
            // Leaves carry the base name as prefix by construction
            let suffix = &old_name[old_base.len()..];
            let new_name = format!("{}{}", new_base, suffix);

            let catalog = txn.open_table(str_table(PARTITION_CATALOG_TABLE))?;
            if catalog.get(new_name.as_str())?.is_some() {
                return Err(SchemaError::PartitionCollision(new_name).into());
            }
            drop(catalog);

            if meta.hash_keyed {
                copy_u64_table(&txn, old_name, &new_name)?;
            } else {
                copy_str_table(&txn, old_name, &new_name)?;
            }

            for idx in idx_metadata {
                let old_idx = idx.idx_name(old_name);
                let new_idx = idx.idx_name(&new_name);
                copy_str_table(&txn, &old_idx, &new_idx)?;
                let idx_meta = IndexMeta {
                    table_name: new_name.clone(),
                    idx_cols: idx.idx_cols.iter().map(|c| c.to_string()).collect(),
                    is_unique: idx.is_unique,
                    partial: idx.partial.map(|p| p.to_string()),
                };
                put_value(&txn, INDEX_CATALOG_TABLE, &new_idx, &idx_meta)?;
                let mut idx_catalog = txn.open_table(str_table(INDEX_CATALOG_TABLE))?;
                idx_catalog.remove(old_idx.as_str())?;
            }

            let mut new_meta = meta.clone();
            new_meta.base_name = new_base.to_string();
            put_value(&txn, PARTITION_CATALOG_TABLE, &new_name, &new_meta)?;
            let mut catalog = txn.open_table(str_table(PARTITION_CATALOG_TABLE))?;
            catalog.remove(old_name.as_str())?;
        }
    }
    store.commit(txn)?;
    info!("renamed {} -> {} ({} leaves)", old_base, new_base, leaves.len());
    Ok(())
}

/// Drop a partition subtree by name prefix: leaves, indices and catalog
/// entries.
pub fn drop_partitions(store: &Store, base_name: &str) -> Result<()> {
    let leaves = child_partitions(store, base_name)?;
    drop_leaves(store, base_name, leaves)
}

/// Drop every leaf registered under exactly this family base.
pub fn drop_family(store: &Store, family_base: &str) -> Result<()> {
    let leaves = family_partitions(store, family_base)?;
    drop_leaves(store, family_base, leaves)
}

fn drop_leaves(
    store: &Store,
    base_name: &str,
    leaves: Vec<(String, PartitionMeta)>,
) -> Result<()> {
    let txn = store.begin_write(TableFamily::Catalog)?;
    {
        let idx_entries: Vec<(String, IndexMeta)> = {
            let all = txn.open_table(str_table(INDEX_CATALOG_TABLE));
            match all {
                Ok(table) => {
                    let mut out = Vec::new();
                    for entry in table.iter()? {
                        let (k, v) = entry?;
                        let meta: IndexMeta = bincode::deserialize(v.value())?;
                        out.push((k.value().to_string(), meta));
                    }
                    out
                }
                Err(TableError::TableDoesNotExist(_)) => Vec::new(),
                Err(e) => return Err(e.into()),
            }
        };

        for (name, meta) in &leaves {
            if meta.hash_keyed {
                txn.delete_table(u64_table(name))?;
            } else {
                txn.delete_table(str_table(name))?;
            }
            let mut catalog = txn.open_table(str_table(PARTITION_CATALOG_TABLE))?;
            catalog.remove(name.as_str())?;
            drop(catalog);

            for (idx_name, idx_meta) in &idx_entries {
                if idx_meta.table_name == *name {
                    txn.delete_table(str_table(idx_name))?;
                    let mut idx_catalog = txn.open_table(str_table(INDEX_CATALOG_TABLE))?;
                    idx_catalog.remove(idx_name.as_str())?;
                }
            }
        }
    }
    store.commit(txn)?;
    info!("dropped {} partitions under {}", leaves.len(), base_name);
    Ok(())
}

fn copy_str_table(txn: &redb::WriteTransaction, from: &str, to: &str) -> Result<()> {
    let rows: Vec<(String, Vec<u8>)> = {
        let src = match txn.open_table(str_table(from)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in src.iter()? {
            let (k, v) = entry?;
            out.push((k.value().to_string(), v.value().to_vec()));
        }
        out
    };
    let mut dst = txn.open_table(str_table(to))?;
    for (k, v) in rows {
        dst.insert(k.as_str(), v.as_slice())?;
    }
    drop(dst);
    txn.delete_table(str_table(from))?;
    Ok(())
}

fn copy_u64_table(txn: &redb::WriteTransaction, from: &str, to: &str) -> Result<()> {
    let rows: Vec<(u64, Vec<u8>)> = {
        let src = match txn.open_table(u64_table(from)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in src.iter()? {
            let (k, v) = entry?;
            out.push((k.value(), v.value().to_vec()));
        }
        out
    };
    let mut dst = txn.open_table(u64_table(to))?;
    for (k, v) in rows {
        dst.insert(k, v.as_slice())?;
    }
    drop(dst);
    txn.delete_table(u64_table(from))?;
    Ok(())
}

/// Fillfactor for a month given the newest month present: the writable
/// month stays loose, everything older is packed.
pub fn fillfactor_for_month(year: i32, month: u32, latest: Option<(i32, u32)>) -> u32 {
    match latest {
        Some((ly, lm)) if (year, month) == (ly, lm) => FILLFACTOR_WRITABLE,
        None => FILLFACTOR_WRITABLE,
        _ => FILLFACTOR_PACKED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Role;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::install(&dir.path().join("core.redb"), 4).unwrap();
        (dir, store)
    }

    #[test]
    fn test_partition_names() {
        assert_eq!(
            monthly_network_triplets_country_partition(2016, 7, ""),
            "monthly_network_triplets_country_2016_07"
        );
        assert_eq!(
            monthly_network_triplets_per_mno_partition("operator1", 2016, 7, "_new"),
            "monthly_network_triplets_per_mno_new_operator1_2016_07"
        );
    }

    #[test]
    fn test_idx_name_deterministic_and_bounded() {
        let idx = IndexMetadatum::new(&["imei_norm"]);
        let a = idx.idx_name("monthly_network_triplets_country_2016_07_80_99");
        let b = idx.idx_name("monthly_network_triplets_country_2016_07_80_99");
        assert_eq!(a, b);
        assert!(a.len() < 64);
        assert!(a.ends_with("_imei_norm_idx"));
    }

    #[test]
    fn test_create_and_collision() {
        let (_dir, store) = test_store();
        create_monthly_network_triplets_country_partition(&store, 2016, 7, "", None, 45).unwrap();
        assert!(partition_exists(&store, "monthly_network_triplets_country_2016_07_0_24").unwrap());

        let err = create_monthly_network_triplets_country_partition(&store, 2016, 7, "", None, 45)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SchemaError>(),
            Some(SchemaError::PartitionCollision(_))
        ));
    }

    #[test]
    fn test_month_year_tuples_sorted_newest_first() {
        let (_dir, store) = test_store();
        for (y, m) in [(2016, 7), (2016, 6), (2016, 8)] {
            create_monthly_network_triplets_country_partition(&store, y, m, "", None, 45).unwrap();
        }
        let tuples = month_year_tuples(&store, "monthly_network_triplets_country").unwrap();
        assert_eq!(tuples, vec![(2016, 8), (2016, 7), (2016, 6)]);
    }

    #[test]
    fn test_rename_with_collision_aborts() {
        let (_dir, store) = test_store();
        create_monthly_network_triplets_country_partition(&store, 2016, 7, "_new", None, 45)
            .unwrap();
        create_monthly_network_triplets_country_partition(&store, 2016, 7, "", None, 45).unwrap();
        let err = rename_table_and_indices(
            &store,
            "monthly_network_triplets_country_new",
            "monthly_network_triplets_country",
            &monthly_network_triplets_country_indices(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SchemaError>(),
            Some(SchemaError::PartitionCollision(_))
        ));
        // Old partition still present: nothing was half-renamed
        assert!(partition_exists(
            &store,
            "monthly_network_triplets_country_new_2016_07_0_24"
        )
        .unwrap());
    }

    #[test]
    fn test_rename_moves_all_leaves() {
        let (_dir, store) = test_store();
        create_monthly_network_triplets_country_partition(&store, 2016, 7, "_new", None, 45)
            .unwrap();
        rename_table_and_indices(
            &store,
            "monthly_network_triplets_country_new",
            "monthly_network_triplets_country",
            &monthly_network_triplets_country_indices(),
        )
        .unwrap();
        assert!(
            partition_exists(&store, "monthly_network_triplets_country_2016_07_0_24").unwrap()
        );
        assert!(!partition_exists(
            &store,
            "monthly_network_triplets_country_new_2016_07_0_24"
        )
        .unwrap());
    }

    #[test]
    fn test_drop_partitions() {
        let (_dir, store) = test_store();
        create_monthly_network_triplets_country_partition(&store, 2016, 7, "", None, 45).unwrap();
        drop_partitions(&store, "monthly_network_triplets_country_2016_07").unwrap();
        assert!(
            !partition_exists(&store, "monthly_network_triplets_country_2016_07_0_24").unwrap()
        );
    }

    #[test]
    fn test_fillfactor_policy() {
        assert_eq!(fillfactor_for_month(2016, 7, Some((2016, 7))), 45);
        assert_eq!(fillfactor_for_month(2016, 6, Some((2016, 7))), 100);
        assert_eq!(fillfactor_for_month(2016, 7, None), 45);
    }

    #[test]
    fn test_role_gate_on_partition_creation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("core.redb");
        Store::install(&path, 4).unwrap();
        let report_store = Store::open(&path, Role::Report).unwrap();
        let err = create_monthly_network_triplets_country_partition(
            &report_store,
            2016,
            7,
            "",
            None,
            45,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SchemaError>(),
            Some(SchemaError::RoleViolation { .. })
        ));
    }
}
