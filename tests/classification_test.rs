// End-to-end tests for the classification engine and dimensions
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};
use tempfile::TempDir;

use rs_dirbs_engine::classify::{classify, ClassificationRecord};
use rs_dirbs_engine::config::{parse_config, AppConfig};
use rs_dirbs_engine::importer::{import_operator_data, OperatorImportOptions};
use rs_dirbs_engine::maintenance::db_install;
use rs_dirbs_engine::shard::calc_virt_imei_shard;
use rs_dirbs_engine::store::{Role, Store};
use rs_dirbs_engine::triplets::{merge_network_imeis, NetworkImeiRecord};
use rs_dirbs_engine::{classify as classify_mod, reference};

fn base_config(conditions_yaml: &str) -> AppConfig {
    parse_config(&format!(
        "region:\n\
         \x20 name: Country1\n\
         \x20 country_codes: ['22']\n\
         \x20 operators:\n\
         \x20   - id: operator1\n\
         \x20     mcc_mnc_pairs: [{{mcc: '111', mnc: '01'}}]\n\
         conditions:\n{}",
        conditions_yaml
    ))
    .unwrap()
}

fn setup(dir: &Path) -> PathBuf {
    let db = dir.join("core.redb");
    db_install(&db, 4).unwrap();
    db
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn import_dump(db: &Path, config: &AppConfig, filename: &str, contents: &str, dir: &Path) {
    let store = Store::open(db, Role::ImportOperator).unwrap();
    let path = dir.join(filename);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    drop(f);
    import_operator_data(
        &store,
        config,
        "operator1",
        &path,
        &OperatorImportOptions::default(),
    )
    .unwrap();
}

fn seed_network_imei(db: &Path, imei: &str, first_seen: NaiveDate, last_seen: NaiveDate) {
    let store = Store::open(db, Role::ImportOperator).unwrap();
    let leaf = reference::shard_leaf_for_imei(&store, "network_imeis", imei).unwrap();
    let mut batch = std::collections::HashMap::new();
    batch.insert(
        imei.to_string(),
        NetworkImeiRecord {
            imei_norm: imei.to_string(),
            first_seen,
            last_seen,
            seen_rat_bitmask: 0,
            virt_imei_shard: calc_virt_imei_shard(Some(imei)),
        },
    );
    merge_network_imeis(&store, &leaf, &batch).unwrap();
}

#[test]
fn test_duplicate_threshold_classification() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());
    let config = base_config(
        "  - label: duplicate_threshold\n\
         \x20   blocking: true\n\
         \x20   grace_period_days: 30\n\
         \x20   max_allowed_matching_ratio: 1.0\n\
         \x20   dimensions:\n\
         \x20     - module: duplicate_threshold\n\
         \x20       parameters: {threshold: 3, period_days: 30}\n",
    );

    // Three IMSIs on the same IMEI within the period
    import_dump(
        &db,
        &config,
        "operator1_20160701_20160731.csv",
        "date,imei,imsi,msisdn\n\
         20160710,35000000000000,111015113222221,222000049781840\n\
         20160711,35000000000000,111015113222222,222000049781841\n\
         20160712,35000000000000,111015113222223,222000049781842\n\
         20160712,35999999999999,111015113222224,222000049781843\n",
        tmp.path(),
    );

    let store = Store::open(&db, Role::Classify).unwrap();
    let curr_date = d(2016, 8, 1);
    let outcome = classify(&store, &config, Some(curr_date), false).unwrap();
    assert!(outcome.failed_conditions.is_empty());
    assert_eq!(outcome.matched_imei_counts["duplicate_threshold"], 1);

    let records = classify_mod::active_records_for_imei(&store, "35000000000000").unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.cond_name, "duplicate_threshold");
    assert_eq!(record.start_date, curr_date);
    assert_eq!(record.end_date, None);
    assert_eq!(record.block_date, Some(curr_date + Duration::days(30)));

    // The IMEI below the threshold has no state
    assert!(classify_mod::active_records_for_imei(&store, "35999999999999")
        .unwrap()
        .is_empty());
}

#[test]
fn test_reclassification_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());
    let config = base_config(
        "  - label: duplicate_threshold\n\
         \x20   blocking: true\n\
         \x20   grace_period_days: 30\n\
         \x20   max_allowed_matching_ratio: 1.0\n\
         \x20   dimensions:\n\
         \x20     - module: duplicate_threshold\n\
         \x20       parameters: {threshold: 3, period_days: 30}\n",
    );
    import_dump(
        &db,
        &config,
        "operator1_20160701_20160731.csv",
        "date,imei,imsi,msisdn\n\
         20160710,35000000000000,111015113222221,222000049781840\n\
         20160711,35000000000000,111015113222222,222000049781841\n\
         20160712,35000000000000,111015113222223,222000049781842\n",
        tmp.path(),
    );

    let store = Store::open(&db, Role::Classify).unwrap();
    let first_date = d(2016, 8, 1);
    classify(&store, &config, Some(first_date), false).unwrap();
    let before = classify_mod::classification_records_for_imei(&store, "35000000000000").unwrap();

    // Same config and same data: no new rows, no end_date changes
    classify(&store, &config, Some(d(2016, 8, 2)), false).unwrap();
    let after = classify_mod::classification_records_for_imei(&store, "35000000000000").unwrap();
    assert_eq!(before, after);
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].start_date, first_date);
}

#[test]
fn test_condition_retirement_sets_end_date() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());
    let config = base_config(
        "  - label: gsma_not_found\n\
         \x20   blocking: true\n\
         \x20   grace_period_days: 30\n\
         \x20   max_allowed_matching_ratio: 1.0\n\
         \x20   dimensions:\n\
         \x20     - module: gsma_not_found\n",
    );
    let curr_date = d(2016, 8, 1);
    seed_network_imei(&db, "99123456789012", curr_date - Duration::days(100), curr_date);

    let store = Store::open(&db, Role::Classify).unwrap();
    classify(&store, &config, Some(curr_date), false).unwrap();
    assert_eq!(
        classify_mod::active_records_for_imei(&store, "99123456789012")
            .unwrap()
            .len(),
        1
    );

    // The TAC appears in the GSMA db: the active row is retired
    {
        let ref_store = store.with_role(Role::ImportReference);
        let gsma_csv = tmp.path().join("gsma.csv");
        std::fs::write(
            &gsma_csv,
            "tac,manufacturer,model_name,device_type,rat_bitmask\n99123456,Acme,Z1,Smartphone,64\n",
        )
        .unwrap();
        reference::import_gsma_data(&ref_store, &gsma_csv).unwrap();
    }
    let retire_date = d(2016, 8, 5);
    classify(&store, &config, Some(retire_date), false).unwrap();

    let records =
        classify_mod::classification_records_for_imei(&store, "99123456789012").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].end_date, Some(retire_date));
}

#[test]
fn test_sticky_condition_skips_retirement() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());
    let config = base_config(
        "  - label: sticky_gsma\n\
         \x20   blocking: true\n\
         \x20   sticky: true\n\
         \x20   grace_period_days: 30\n\
         \x20   max_allowed_matching_ratio: 1.0\n\
         \x20   dimensions:\n\
         \x20     - module: gsma_not_found\n",
    );
    let curr_date = d(2016, 8, 1);
    seed_network_imei(&db, "99123456789012", curr_date - Duration::days(100), curr_date);

    let store = Store::open(&db, Role::Classify).unwrap();
    classify(&store, &config, Some(curr_date), false).unwrap();

    {
        let ref_store = store.with_role(Role::ImportReference);
        let gsma_csv = tmp.path().join("gsma.csv");
        std::fs::write(
            &gsma_csv,
            "tac,manufacturer,model_name,device_type,rat_bitmask\n99123456,Acme,Z1,Smartphone,64\n",
        )
        .unwrap();
        reference::import_gsma_data(&ref_store, &gsma_csv).unwrap();
    }
    classify(&store, &config, Some(d(2016, 8, 5)), false).unwrap();

    let records: Vec<ClassificationRecord> =
        classify_mod::active_records_for_imei(&store, "99123456789012").unwrap();
    assert_eq!(records.len(), 1, "sticky condition must keep its active row");
}

#[test]
fn test_gsma_not_found_respects_rbi_delay() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());
    let config = base_config(
        "  - label: gsma_not_found\n\
         \x20   blocking: true\n\
         \x20   grace_period_days: 0\n\
         \x20   max_allowed_matching_ratio: 1.0\n\
         \x20   dimensions:\n\
         \x20     - module: gsma_not_found\n",
    );
    let curr_date = d(2016, 8, 1);

    // RBI '01' carries a 40-day allocation delay: an IMEI first seen 40
    // days ago matches, one first seen 30 days ago does not
    seed_network_imei(
        &db,
        "01123456789012",
        curr_date - Duration::days(40),
        curr_date,
    );
    seed_network_imei(
        &db,
        "01999999999999",
        curr_date - Duration::days(30),
        curr_date,
    );

    let store = Store::open(&db, Role::Classify).unwrap();
    let outcome = classify(&store, &config, Some(curr_date), false).unwrap();
    assert_eq!(outcome.matched_imei_counts["gsma_not_found"], 1);
    assert_eq!(
        classify_mod::active_records_for_imei(&store, "01123456789012")
            .unwrap()
            .len(),
        1
    );
    assert!(classify_mod::active_records_for_imei(&store, "01999999999999")
        .unwrap()
        .is_empty());
}

#[test]
fn test_safety_check_aborts_mass_classification() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());
    let config = base_config(
        "  - label: gsma_not_found\n\
         \x20   blocking: true\n\
         \x20   grace_period_days: 0\n\
         \x20   max_allowed_matching_ratio: 0.1\n\
         \x20   dimensions:\n\
         \x20     - module: gsma_not_found\n",
    );
    let curr_date = d(2016, 8, 1);
    // Every seen IMEI would match: 100% > 10% allowed
    seed_network_imei(
        &db,
        "99123456789012",
        curr_date - Duration::days(100),
        curr_date,
    );

    let store = Store::open(&db, Role::Classify).unwrap();
    let err = classify(&store, &config, Some(curr_date), false).unwrap_err();
    assert!(err.to_string().contains("safety-check"), "got: {}", err);

    // With the safety check disabled the same run succeeds
    let outcome = classify(&store, &config, Some(curr_date), true).unwrap();
    assert_eq!(outcome.matched_imei_counts["gsma_not_found"], 1);
}

#[test]
fn test_amnesty_defers_block_date() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());
    let mut config = base_config(
        "  - label: gsma_not_found\n\
         \x20   blocking: true\n\
         \x20   grace_period_days: 30\n\
         \x20   max_allowed_matching_ratio: 1.0\n\
         \x20   dimensions:\n\
         \x20     - module: gsma_not_found\n",
    );
    config.amnesty.amnesty_enabled = true;
    config.amnesty.evaluation_period_end_date = Some(d(2016, 8, 31));
    config.amnesty.amnesty_period_end_date = Some(d(2016, 10, 31));

    let curr_date = d(2016, 8, 1); // inside the evaluation period
    seed_network_imei(
        &db,
        "99123456789012",
        curr_date - Duration::days(100),
        curr_date,
    );

    let store = Store::open(&db, Role::Classify).unwrap();
    classify(&store, &config, Some(curr_date), false).unwrap();
    let records = classify_mod::active_records_for_imei(&store, "99123456789012").unwrap();
    assert_eq!(records[0].block_date, Some(d(2016, 10, 31)));
    assert!(records[0].amnesty_granted);
}
