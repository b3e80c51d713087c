// redb-backed store: schema metadata, role capabilities, advisory locks
use std::path::Path;

use anyhow::{Context, Result};
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, TableError, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SchemaError, TransientError};
use crate::shard::hash_string_64bit;

/// Version of the on-disk layout. Bumped on incompatible changes;
/// `db upgrade` migrates between versions.
pub const SCHEMA_VERSION: u32 = 9;

const SCHEMA_METADATA_TABLE: &str = "schema_metadata";
const ADVISORY_LOCKS_TABLE: &str = "advisory_locks";
const SCHEMA_KEY: &str = "schema";

/// Capability under which a store handle was opened. The role boundary is a
/// correctness property: classification must not be able to mutate the
/// triplet store, ingest must not touch classification state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    ImportOperator,
    ImportReference,
    Classify,
    Listgen,
    Report,
    Query,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Admin => "dirbs_core_power_user",
            Role::ImportOperator => "dirbs_core_import_operator",
            Role::ImportReference => "dirbs_core_import_reference",
            Role::Classify => "dirbs_core_classify",
            Role::Listgen => "dirbs_core_listgen",
            Role::Report => "dirbs_core_report",
            Role::Query => "dirbs_core_api",
        }
    }
}

/// Families of tables with a common write capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFamily {
    Triplets,
    NetworkImeis,
    Sketches,
    ClassificationState,
    ReferenceLists,
    Lists,
    JobMetadata,
    Catalog,
}

impl TableFamily {
    pub fn name(&self) -> &'static str {
        match self {
            TableFamily::Triplets => "monthly_network_triplets",
            TableFamily::NetworkImeis => "network_imeis",
            TableFamily::Sketches => "daily_per_mno_hll_sketches",
            TableFamily::ClassificationState => "classification_state",
            TableFamily::ReferenceLists => "reference_lists",
            TableFamily::Lists => "generated_lists",
            TableFamily::JobMetadata => "job_metadata",
            TableFamily::Catalog => "partition_catalog",
        }
    }
}

fn role_may_write(role: Role, family: TableFamily) -> bool {
    use TableFamily::*;
    match role {
        Role::Admin => true,
        Role::ImportOperator => {
            matches!(family, Triplets | NetworkImeis | Sketches | Catalog | JobMetadata)
        }
        Role::ImportReference => matches!(family, ReferenceLists | Catalog | JobMetadata),
        Role::Classify => matches!(family, ClassificationState | JobMetadata),
        Role::Listgen => matches!(family, Lists | JobMetadata),
        Role::Report => matches!(family, JobMetadata),
        Role::Query => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaMetadata {
    pub phys_shards: u32,
    pub schema_version: u32,
}

/// Table shape used by string-keyed stores.
pub fn str_table(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// Table shape used by hash-keyed stores (triplet partitions, locks).
pub fn u64_table(name: &str) -> TableDefinition<'_, u64, &'static [u8]> {
    TableDefinition::new(name)
}

#[derive(Debug)]
pub struct Store {
    db: std::sync::Arc<Database>,
    role: Role,
}

impl Store {
    /// Create a new store file and write the initial schema metadata.
    /// Fails if the store was already installed.
    pub fn install(path: &Path, num_physical_shards: u32) -> Result<Store> {
        let db = Database::create(path)
            .with_context(|| format!("Failed to create store at {:?}", path))?;
        let store = Store {
            db: std::sync::Arc::new(db),
            role: Role::Admin,
        };
        if store.read_schema()?.is_some() {
            return Err(SchemaError::PartitionCollision(SCHEMA_METADATA_TABLE.to_string()).into());
        }
        store.write_schema(&SchemaMetadata {
            phys_shards: num_physical_shards,
            schema_version: SCHEMA_VERSION,
        })?;
        debug!(
            "installed store at {:?} with {} physical shards",
            path, num_physical_shards
        );
        Ok(store)
    }

    /// Open an existing store under the given role, verifying the schema.
    pub fn open(path: &Path, role: Role) -> Result<Store> {
        let db =
            Database::create(path).with_context(|| format!("Failed to open store at {:?}", path))?;
        let store = Store {
            db: std::sync::Arc::new(db),
            role,
        };
        let schema = store
            .read_schema()?
            .ok_or_else(|| SchemaError::NotInstalled("no schema metadata".to_string()))?;
        if schema.schema_version != SCHEMA_VERSION {
            return Err(SchemaError::VersionMismatch {
                found: schema.schema_version,
                required: SCHEMA_VERSION,
            }
            .into());
        }
        Ok(store)
    }

    /// Derive a handle with a different capability over the same database.
    /// The embedded database permits one open handle per file, so the
    /// role-scoped handles of one process share it the way role-scoped
    /// sessions share a connection pool.
    pub fn with_role(&self, role: Role) -> Store {
        Store {
            db: self.db.clone(),
            role,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// One independent read session per worker.
    pub fn begin_read(&self) -> Result<ReadTransaction> {
        self.db
            .begin_read()
            .map_err(|e| TransientError(e.to_string()).into())
    }

    /// Begin a write transaction after checking the role capability for the
    /// table family being mutated.
    pub fn begin_write(&self, family: TableFamily) -> Result<WriteTransaction> {
        if !role_may_write(self.role, family) {
            return Err(SchemaError::RoleViolation {
                role: self.role.name(),
                table_family: family.name(),
            }
            .into());
        }
        self.db
            .begin_write()
            .map_err(|e| TransientError(e.to_string()).into())
    }

    pub fn commit(&self, txn: WriteTransaction) -> Result<()> {
        txn.commit().map_err(|e| TransientError(e.to_string()).into())
    }

    fn read_schema(&self) -> Result<Option<SchemaMetadata>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| TransientError(e.to_string()))?;
        get_value(&txn, SCHEMA_METADATA_TABLE, SCHEMA_KEY)
    }

    fn write_schema(&self, schema: &SchemaMetadata) -> Result<()> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| TransientError(e.to_string()))?;
        put_value(&txn, SCHEMA_METADATA_TABLE, SCHEMA_KEY, schema)?;
        txn.commit().map_err(|e| TransientError(e.to_string()))?;
        Ok(())
    }

    pub fn schema(&self) -> Result<SchemaMetadata> {
        self.read_schema()?
            .ok_or_else(|| SchemaError::NotInstalled("no schema metadata".to_string()).into())
    }

    pub fn num_physical_shards(&self) -> Result<u32> {
        Ok(self.schema()?.phys_shards)
    }

    pub fn set_num_physical_shards(&self, num: u32) -> Result<()> {
        let mut schema = self.schema()?;
        schema.phys_shards = num;
        self.write_schema(&schema)
    }

    pub fn set_schema_version(&self, version: u32) -> Result<()> {
        let mut schema = self.schema()?;
        schema.schema_version = version;
        self.write_schema(&schema)
    }

    /// Acquire the per-importer advisory lock. Concurrent imports for the
    /// same (import type, operator) pair are refused; different operators
    /// may import concurrently.
    pub fn acquire_import_lock(
        &self,
        import_type: &str,
        operator_id: &str,
    ) -> Result<AdvisoryLock<'_>> {
        let key = hash_string_64bit(&format!("{}{}", import_type, operator_id));
        let holder = format!("{}:{}", import_type, operator_id);
        let txn = self
            .db
            .begin_write()
            .map_err(|e| TransientError(e.to_string()))?;
        {
            let def = u64_table(ADVISORY_LOCKS_TABLE);
            let mut table = txn.open_table(def)?;
            if table.get(key)?.is_some() {
                return Err(anyhow::anyhow!(
                    "Could not acquire advisory lock for {}. Are there any other \
                     concurrent imports running for this operator?",
                    holder
                ));
            }
            table.insert(key, holder.as_bytes())?;
        }
        txn.commit().map_err(|e| TransientError(e.to_string()))?;
        Ok(AdvisoryLock { store: self, key })
    }

    fn release_lock(&self, key: u64) {
        let release = || -> Result<()> {
            let txn = self
                .db
                .begin_write()
                .map_err(|e| TransientError(e.to_string()))?;
            {
                let def = u64_table(ADVISORY_LOCKS_TABLE);
                let mut table = txn.open_table(def)?;
                table.remove(key)?;
            }
            txn.commit().map_err(|e| TransientError(e.to_string()))?;
            Ok(())
        };
        if let Err(err) = release() {
            tracing::warn!("failed to release advisory lock {}: {}", key, err);
        }
    }
}

/// Held for the duration of an import; released on drop.
pub struct AdvisoryLock<'a> {
    store: &'a Store,
    key: u64,
}

impl Drop for AdvisoryLock<'_> {
    fn drop(&mut self) {
        self.store.release_lock(self.key);
    }
}

/// Read one bincode value from a string-keyed table. A missing table reads
/// as a missing value.
pub fn get_value<T: DeserializeOwned>(
    txn: &ReadTransaction,
    table_name: &str,
    key: &str,
) -> Result<Option<T>> {
    let def = str_table(table_name);
    let table = match txn.open_table(def) {
        Ok(t) => t,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match table.get(key)? {
        Some(guard) => {
            let value = bincode::deserialize(guard.value())
                .with_context(|| format!("corrupt record in {} at {}", table_name, key))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Write one bincode value into a string-keyed table within an open
/// transaction.
pub fn put_value<T: Serialize>(
    txn: &WriteTransaction,
    table_name: &str,
    key: &str,
    value: &T,
) -> Result<()> {
    let def = str_table(table_name);
    let mut table = txn.open_table(def)?;
    let bytes = bincode::serialize(value)?;
    table.insert(key, bytes.as_slice())?;
    Ok(())
}

/// Collect every (key, value) pair of a string-keyed table. A missing table
/// reads as empty.
pub fn scan_table<T: DeserializeOwned>(
    txn: &ReadTransaction,
    table_name: &str,
) -> Result<Vec<(String, T)>> {
    let def = str_table(table_name);
    let table = match txn.open_table(def) {
        Ok(t) => t,
        Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (k, v) = entry?;
        let value = bincode::deserialize(v.value())
            .with_context(|| format!("corrupt record in {} at {}", table_name, k.value()))?;
        out.push((k.value().to_string(), value));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_install_and_open() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("core.redb");
        {
            let store = Store::install(&path, 4)?;
            assert_eq!(store.num_physical_shards()?, 4);
        }
        let store = Store::open(&path, Role::Query)?;
        assert_eq!(store.schema()?.schema_version, SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn test_open_uninstalled_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.redb");
        let err = Store::open(&path, Role::Query).unwrap_err();
        assert!(err.downcast_ref::<SchemaError>().is_some());
    }

    #[test]
    fn test_role_capability_enforced() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("core.redb");
        Store::install(&path, 4)?;

        let classify = Store::open(&path, Role::Classify)?;
        // Classification must not be able to mutate the triplet store
        let result = classify.begin_write(TableFamily::Triplets);
        let err = match result {
            Ok(_) => panic!("expected begin_write to fail for Classify role"),
            Err(e) => e,
        };
        assert!(matches!(
            err.downcast_ref::<SchemaError>(),
            Some(SchemaError::RoleViolation { .. })
        ));
        let txn = classify.begin_write(TableFamily::ClassificationState)?;
        classify.commit(txn)?;

        let importer = classify.with_role(Role::ImportOperator);
        assert!(importer
            .begin_write(TableFamily::ClassificationState)
            .is_err());
        assert!(importer.begin_write(TableFamily::Triplets).is_ok());
        Ok(())
    }

    #[test]
    fn test_advisory_lock_exclusion() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("core.redb");
        let store = Store::install(&path, 4)?;

        let lock = store.acquire_import_lock("operator", "operator1")?;
        assert!(store.acquire_import_lock("operator", "operator1").is_err());
        // A different operator may import concurrently
        let _other = store.acquire_import_lock("operator", "operator2")?;
        drop(lock);
        let _reacquired = store.acquire_import_lock("operator", "operator1")?;
        Ok(())
    }

    #[test]
    fn test_value_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("core.redb");
        let store = Store::install(&path, 4)?;

        let txn = store.begin_write(TableFamily::Catalog)?;
        put_value(&txn, "test_table", "key1", &vec![1u32, 2, 3])?;
        store.commit(txn)?;

        let txn = store.begin_read()?;
        let value: Option<Vec<u32>> = get_value(&txn, "test_table", "key1")?;
        assert_eq!(value, Some(vec![1, 2, 3]));
        let missing: Option<Vec<u32>> = get_value(&txn, "test_table", "absent")?;
        assert_eq!(missing, None);
        let empty: Option<Vec<u32>> = get_value(&txn, "never_created", "k")?;
        assert_eq!(empty, None);
        Ok(())
    }
}
