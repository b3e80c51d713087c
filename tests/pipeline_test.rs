// Full pipeline tests: ingest -> classify -> listgen -> stats -> reports,
// plus repartitioning and pruning
use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDate;
use tempfile::TempDir;

use rs_dirbs_engine::classify::classify;
use rs_dirbs_engine::config::{parse_config, AppConfig, COUNTRY_OPERATOR_NAME};
use rs_dirbs_engine::hll::hll_error_bound;
use rs_dirbs_engine::importer::{import_operator_data, OperatorImportOptions};
use rs_dirbs_engine::job::{latest_job, scan_jobs, JobStatus};
use rs_dirbs_engine::listgen::generate_lists;
use rs_dirbs_engine::maintenance::{db_install, prune_triplets, repartition};
use rs_dirbs_engine::stats::generate_monthly_report_stats;
use rs_dirbs_engine::store::{Role, Store};
use rs_dirbs_engine::triplets::scan_triplets;
use rs_dirbs_engine::{partition, reports};

fn test_config() -> AppConfig {
    parse_config(
        "region:\n\
         \x20 name: Country1\n\
         \x20 country_codes: ['22']\n\
         \x20 operators:\n\
         \x20   - id: operator1\n\
         \x20     mcc_mnc_pairs: [{mcc: '111', mnc: '01'}]\n\
         \x20   - id: operator2\n\
         \x20     mcc_mnc_pairs: [{mcc: '111', mnc: '02'}]\n\
         conditions:\n\
         \x20 - label: duplicate_threshold\n\
         \x20   blocking: true\n\
         \x20   grace_period_days: 0\n\
         \x20   reason: Duplicate IMEI detected\n\
         \x20   max_allowed_matching_ratio: 1.0\n\
         \x20   dimensions:\n\
         \x20     - module: duplicate_threshold\n\
         \x20       parameters: {threshold: 3, period_days: 30}\n\
         retention:\n\
         \x20 months_retention: 6\n",
    )
    .unwrap()
}

fn setup(dir: &Path) -> std::path::PathBuf {
    let db = dir.join("core.redb");
    db_install(&db, 4).unwrap();
    db
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn import_july_data(db: &Path, config: &AppConfig, dir: &Path) {
    let store = Store::open(db, Role::ImportOperator).unwrap();
    // operator1 sees one duplicate-heavy IMEI and a handful of normal ones
    let mut contents = String::from("date,imei,imsi,msisdn\n");
    for i in 1..=3 {
        contents.push_str(&format!(
            "2016071{},35000000000000,11101511322222{},22200004978184{}\n",
            i, i, i
        ));
    }
    for i in 0..5 {
        contents.push_str(&format!(
            "20160715,3511111111111{},11101511322233{},22200004978190{}\n",
            i, i, i
        ));
    }
    let dump = dir.join("operator1_20160701_20160731.csv");
    std::fs::write(&dump, &contents).unwrap();
    import_operator_data(
        &store,
        config,
        "operator1",
        &dump,
        &OperatorImportOptions::default(),
    )
    .unwrap();

    // operator2 sees the duplicate IMEI too
    let dump = dir.join("operator2_20160701_20160731.csv");
    std::fs::write(
        &dump,
        "date,imei,imsi,msisdn\n20160714,35000000000000,111025113222221,222000049781850\n",
    )
    .unwrap();
    import_operator_data(
        &store,
        config,
        "operator2",
        &dump,
        &OperatorImportOptions::default(),
    )
    .unwrap();
}

#[test]
fn test_full_pipeline_to_lists_and_reports() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());
    let config = test_config();
    import_july_data(&db, &config, tmp.path());

    // Classify with a zero grace period: the duplicate IMEI blocks today
    let classify_store = Store::open(&db, Role::Classify).unwrap();
    let curr_date = d(2016, 8, 1);
    let outcome = classify(&classify_store, &config, Some(curr_date), false).unwrap();
    assert_eq!(outcome.matched_imei_counts["duplicate_threshold"], 1);

    // Listgen produces a blacklist containing the blocked IMEI
    let listgen_store = classify_store.with_role(Role::Listgen);
    let list_dir = tmp.path().join("lists");
    let lists = generate_lists(&listgen_store, &config, &list_dir, Some(curr_date)).unwrap();
    assert_eq!(lists.blacklist_size, 1);
    let blacklist = std::fs::read_to_string(list_dir.join("blacklist.csv")).unwrap();
    assert!(blacklist.contains("35000000000000"));
    assert!(blacklist.contains("Duplicate IMEI detected"));

    // Stats cross-check: HLL-derived and exact IMEI counts agree within
    // the error bound, and num_imeis is rewritten to the exact total
    let report_store = classify_store.with_role(Role::Report);
    let (stats, durations) =
        generate_monthly_report_stats(&report_store, &config, 7, 2016).unwrap();
    assert!(!durations.is_empty());
    let country = &stats.per_operator[COUNTRY_OPERATOR_NAME];
    let exact = country.monthly.num_compliant_imeis + country.monthly.num_noncompliant_imeis;
    assert_eq!(country.monthly.num_imeis, exact);
    assert_eq!(exact, 6); // 1 duplicate + 5 normal IMEIs
    assert_eq!(country.monthly.num_noncompliant_imeis_blocking, 1);
    assert_eq!(country.monthly.num_gross_adds, 6);

    // The HLL bound held for the per-day sketch counts as well
    let bound = hll_error_bound();
    for day in &country.daily {
        assert!(day.num_imeis as f64 <= 6.0 * (1.0 + 3.0 * bound) + 1.0);
    }

    // Standard report CSVs
    let report_dir = tmp.path().join("reports");
    std::fs::create_dir_all(&report_dir).unwrap();
    let files = reports::write_standard_report(&stats, "Country1", &report_dir).unwrap();
    assert_eq!(
        files,
        vec![
            "Country1_7_2016.csv".to_string(),
            "Country1_7_2016_condition_counts.csv".to_string()
        ]
    );
    let per_tac = std::fs::read_to_string(report_dir.join("Country1_7_2016.csv")).unwrap();
    let header = per_tac.lines().next().unwrap();
    assert_eq!(
        header,
        "TAC,duplicate_threshold,IMEI count,IMEI gross adds count,IMEI-IMSI count,\
         IMEI-MSISDN count,Subscriber triplet count,Compliance Level"
    );
    assert!(per_tac.contains("35000000"));

    // Overlap report: the duplicate IMEI was seen on both operators
    let files =
        reports::write_condition_imei_overlaps(&report_store, &config, 7, 2016, "Country1", &report_dir)
            .unwrap();
    assert_eq!(files.len(), 1);
    let overlaps = std::fs::read_to_string(
        report_dir.join("Country1_7_2016_condition_imei_overlap_duplicate_threshold.csv"),
    )
    .unwrap();
    assert!(overlaps.contains("35000000000000,operator1|operator2"));

    // Duplicates report honors the IMSI minimum
    let files = reports::write_country_duplicates_report(
        &report_store,
        7,
        2016,
        "Country1",
        &report_dir,
        4,
    )
    .unwrap();
    assert_eq!(files.len(), 1);
    let duplicates =
        std::fs::read_to_string(report_dir.join("Country1_7_2016_duplicates.csv")).unwrap();
    assert!(duplicates.contains("35000000000000,4"));

    // Job metadata recorded every stage
    let txn = report_store.begin_read().unwrap();
    let jobs = scan_jobs(&txn).unwrap();
    let commands: Vec<&str> = jobs.iter().map(|j| j.command.as_str()).collect();
    assert!(commands.contains(&"dirbs-import"));
    assert!(commands.contains(&"dirbs-classify"));
    assert!(commands.contains(&"dirbs-listgen"));
    assert!(commands.contains(&"dirbs-report"));
    let classify_job = latest_job(&txn, "dirbs-classify", true).unwrap().unwrap();
    assert_eq!(classify_job.status, JobStatus::Success);
    assert_eq!(
        classify_job.extra_metadata["matched_imei_counts"]["duplicate_threshold"],
        1
    );
}

#[test]
fn test_repartition_preserves_data() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());
    let config = test_config();
    import_july_data(&db, &config, tmp.path());

    let collect_all = |store: &Store| -> HashMap<u64, u32> {
        let txn = store.begin_read().unwrap();
        let mut out = HashMap::new();
        for (leaf, _) in
            partition::family_partitions(store, "monthly_network_triplets_country").unwrap()
        {
            for record in scan_triplets(&txn, &leaf).unwrap() {
                out.insert(record.triplet_hash, record.date_bitmask);
            }
        }
        out
    };

    let admin = Store::open(&db, Role::Admin).unwrap();
    let before = collect_all(&admin);
    assert!(!before.is_empty());

    repartition(&admin, 7).unwrap();
    assert_eq!(admin.num_physical_shards().unwrap(), 7);
    let after = collect_all(&admin);
    assert_eq!(before, after);

    // Shard invariant still holds in the new layout
    let txn = admin.begin_read().unwrap();
    for (leaf, meta) in
        partition::family_partitions(&admin, "monthly_network_triplets_country").unwrap()
    {
        for record in scan_triplets(&txn, &leaf).unwrap() {
            assert!(record.virt_imei_shard >= meta.shard_start);
            assert!(record.virt_imei_shard < meta.shard_end);
        }
    }
}

#[test]
fn test_prune_drops_only_aged_partitions() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());
    let config = test_config();
    import_july_data(&db, &config, tmp.path());

    let admin = Store::open(&db, Role::Admin).unwrap();

    // Inside the retention window: nothing is dropped
    let dropped = prune_triplets(&admin, &config, Some(d(2016, 9, 1))).unwrap();
    assert!(dropped.is_empty());

    // Seven months later the July partitions age out
    let dropped = prune_triplets(&admin, &config, Some(d(2017, 2, 1))).unwrap();
    assert!(!dropped.is_empty());
    assert!(!partition::partition_exists_any_leaf(
        &admin,
        "monthly_network_triplets_country_2016_07"
    )
    .unwrap());
}
