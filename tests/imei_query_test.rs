// End-to-end tests for the consolidated IMEI query resolver
use std::io::Write;
use std::path::Path;

use chrono::NaiveDate;
use tempfile::TempDir;

use rs_dirbs_engine::config::{parse_config, AppConfig};
use rs_dirbs_engine::importer::{import_operator_data, OperatorImportOptions};
use rs_dirbs_engine::maintenance::db_install;
use rs_dirbs_engine::query::{
    imei_pairings, imei_seen_with, resolve_imei, resolve_imei_batch, Pagination, SortOrder,
    MAX_BATCH_IMEIS,
};
use rs_dirbs_engine::reference;
use rs_dirbs_engine::store::{Role, Store};

fn test_config() -> AppConfig {
    parse_config(
        "region:\n\
         \x20 name: Country1\n\
         \x20 country_codes: ['22']\n\
         \x20 exempted_device_types: ['Module']\n\
         \x20 operators:\n\
         \x20   - id: operator1\n\
         \x20     mcc_mnc_pairs: [{mcc: '111', mnc: '01'}]\n\
         conditions:\n\
         \x20 - label: gsma_not_found\n\
         \x20   blocking: true\n\
         \x20   dimensions: [{module: gsma_not_found}]\n\
         \x20 - label: is_test_tac\n\
         \x20   blocking: false\n\
         \x20   dimensions: [{module: is_test_tac}]\n",
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

#[test]
fn test_resolve_normalizes_and_reports_pairing() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());
    let config = test_config();

    // Pair 38847733370026 with an IMSI
    {
        let store = Store::open(&db, Role::ImportReference).unwrap();
        let pairing_csv = tmp.path().join("pairing.csv");
        let mut f = std::fs::File::create(&pairing_csv).unwrap();
        f.write_all(b"imei,imsi,msisdn\n38847733370026,111018001111111,22200111\n")
            .unwrap();
        drop(f);
        reference::import_pairing_list(&store, &pairing_csv, d(2016, 7, 1)).unwrap();
    }

    let store = Store::open(&db, Role::Query).unwrap();
    let info = resolve_imei(&store, &config, "3884773337002633", false, false).unwrap();
    assert_eq!(info.imei_norm, "38847733370026");
    assert!(info.realtime_checks.is_paired);
    assert!(!info.realtime_checks.ever_observed_on_network);
    assert!(!info.realtime_checks.invalid_imei);
    assert!(info.realtime_checks.gsma_not_found);
    assert!(info.registration_status.is_none());
    assert!(info.stolen_status.is_none());

    // Condition arrays cover every configured condition
    assert_eq!(info.classification_state.blocking_conditions.len(), 1);
    assert_eq!(info.classification_state.informative_conditions.len(), 1);
    assert!(!info.classification_state.blocking_conditions[0].condition_met);
}

#[test]
fn test_resolve_rejects_malformed_imeis() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());
    let config = test_config();
    let store = Store::open(&db, Role::Query).unwrap();

    // 17 characters
    assert!(resolve_imei(&store, &config, "12345678901234567", false, false).is_err());
    assert!(resolve_imei(&store, &config, "123-456", false, false).is_err());
    // 16 characters is accepted
    assert!(resolve_imei(&store, &config, "1234567890123456", false, false).is_ok());
}

#[test]
fn test_registration_and_stolen_statuses() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());
    let config = test_config();

    {
        let store = Store::open(&db, Role::ImportReference).unwrap();
        let reg_csv = tmp.path().join("reg.csv");
        std::fs::write(
            &reg_csv,
            "approved_imei,make,model,status,model_number,brand_name,device_type,radio_interface,device_id\n\
             38847733370026,Acme,A1,whitelist,,,Smartphone,,\n\
             10000000000000,Acme,A2,pending,,,Smartphone,,\n",
        )
        .unwrap();
        reference::import_registration_list(&store, &reg_csv, d(2016, 7, 1)).unwrap();

        let stolen_csv = tmp.path().join("stolen.csv");
        std::fs::write(&stolen_csv, "imei,reporting_date,status\n38847733370026,20160615,\n")
            .unwrap();
        reference::import_stolen_list(&store, &stolen_csv, d(2016, 7, 1)).unwrap();
    }

    let store = Store::open(&db, Role::Query).unwrap();
    let info = resolve_imei(&store, &config, "38847733370026", true, true).unwrap();
    assert!(info.realtime_checks.in_registration_list);
    let registration = info.registration_status.unwrap();
    assert_eq!(registration.status.as_deref(), Some("whitelist"));
    assert_eq!(registration.provisional_only, Some(false));
    let stolen = info.stolen_status.unwrap();
    assert!(stolen.status.is_some());

    // A pending-only registration is provisional
    let info = resolve_imei(&store, &config, "10000000000000", true, false).unwrap();
    assert!(!info.realtime_checks.in_registration_list);
    let registration = info.registration_status.unwrap();
    assert_eq!(registration.status.as_deref(), Some("pending"));
    assert_eq!(registration.provisional_only, Some(true));
}

#[test]
fn test_subscriber_history_via_index() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());
    let config = test_config();

    {
        let store = Store::open(&db, Role::ImportOperator).unwrap();
        let dump = tmp.path().join("operator1_20160701_20160731.csv");
        std::fs::write(
            &dump,
            "date,imei,imsi,msisdn\n\
             20160710,38847733370026,111015113222221,222000049781840\n\
             20160712,38847733370026,111015113222222,222000049781841\n\
             20160713,99999999999990,111015113222223,222000049781842\n",
        )
        .unwrap();
        import_operator_data(
            &store,
            &config,
            "operator1",
            &dump,
            &OperatorImportOptions::default(),
        )
        .unwrap();
    }

    let store = Store::open(&db, Role::Query).unwrap();
    let seen = imei_seen_with(&store, "38847733370026").unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].imsi.as_deref(), Some("111015113222221"));
    assert_eq!(seen[0].last_seen, d(2016, 7, 10));
    assert_eq!(seen[1].imsi.as_deref(), Some("111015113222222"));

    let info = resolve_imei(&store, &config, "38847733370026", false, false).unwrap();
    assert!(info.realtime_checks.ever_observed_on_network);
}

#[test]
fn test_pairing_pagination() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());

    {
        let store = Store::open(&db, Role::ImportReference).unwrap();
        let pairing_csv = tmp.path().join("pairing.csv");
        let mut contents = String::from("imei,imsi,msisdn\n");
        for i in 0..25 {
            contents.push_str(&format!("38847733370026,1110180011111{:02},\n", i));
        }
        std::fs::write(&pairing_csv, contents).unwrap();
        reference::import_pairing_list(&store, &pairing_csv, d(2016, 7, 1)).unwrap();
    }

    let store = Store::open(&db, Role::Query).unwrap();
    let page = imei_pairings(&store, "38847733370026", Pagination::default()).unwrap();
    assert_eq!(page.result_size, 25);
    assert_eq!(page.results.len(), 10);
    assert_eq!(page.current_key, 0);
    assert_eq!(page.next_key, Some(10));

    let last_page = imei_pairings(
        &store,
        "38847733370026",
        Pagination {
            offset: 20,
            limit: 10,
            order: SortOrder::Asc,
        },
    )
    .unwrap();
    assert_eq!(last_page.results.len(), 5);
    assert_eq!(last_page.next_key, None);

    // Descending order flips the first result
    let desc = imei_pairings(
        &store,
        "38847733370026",
        Pagination {
            offset: 0,
            limit: 1,
            order: SortOrder::Desc,
        },
    )
    .unwrap();
    assert_eq!(desc.results[0].imsi, "111018001111124");
}

#[test]
fn test_batch_query_limit() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());
    let config = test_config();
    let store = Store::open(&db, Role::Query).unwrap();

    let ok_batch: Vec<String> = (0..10).map(|i| format!("0123456789012{}", i)).collect();
    assert_eq!(
        resolve_imei_batch(&store, &config, &ok_batch, false, false)
            .unwrap()
            .len(),
        10
    );

    let oversized: Vec<String> = (0..MAX_BATCH_IMEIS + 1)
        .map(|_| "01234567890123".to_string())
        .collect();
    assert!(resolve_imei_batch(&store, &config, &oversized, false, false).is_err());
}

#[test]
fn test_exempted_device_type_check() {
    let tmp = TempDir::new().unwrap();
    let db = setup(tmp.path());
    let config = test_config();

    {
        let store = Store::open(&db, Role::ImportReference).unwrap();
        let gsma_csv = tmp.path().join("gsma.csv");
        std::fs::write(
            &gsma_csv,
            "tac,manufacturer,model_name,device_type,rat_bitmask\n\
             38847733,Acme,Connect1,Module,64\n\
             01234567,Acme,P1,Smartphone,64\n",
        )
        .unwrap();
        reference::import_gsma_data(&store, &gsma_csv).unwrap();
    }

    let store = Store::open(&db, Role::Query).unwrap();
    let info = resolve_imei(&store, &config, "38847733370026", false, false).unwrap();
    assert!(info.realtime_checks.is_exempted_device);
    assert!(!info.realtime_checks.gsma_not_found);

    let info = resolve_imei(&store, &config, "01234567890123", false, false).unwrap();
    assert!(!info.realtime_checks.is_exempted_device);
}
