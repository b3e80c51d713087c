// DIRBS core engine command-line front end.
//
// Subcommands mirror the processing pipeline: operator and reference data
// imports, classification, list generation, reports, schema admin and
// pruning. The engine state lives in a single embedded store file; every
// subcommand opens it under its own role capability.

use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rs_dirbs_engine::config::{load_config, parse_flexible_date, AppConfig};
use rs_dirbs_engine::importer::{import_operator_data, OperatorImportOptions};
use rs_dirbs_engine::store::{Role, Store};
use rs_dirbs_engine::{classify, listgen, maintenance, query, reference, reports, stats};

#[derive(Parser, Debug)]
#[command(name = "rs_dirbs_engine")]
#[command(about = "Device Identifier Registration and Blocking System core engine", long_about = None)]
struct Args {
    /// Path to the engine store file (env: DIRBS_DB)
    #[arg(long)]
    db: Option<PathBuf>,

    /// YAML config on top of defaults (env: DIRBS_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import operator data dumps or reference lists
    Import {
        #[command(subcommand)]
        what: ImportCommand,
    },
    /// Evaluate all configured conditions and update classification state
    Classify {
        /// Current date for analysis, YYYYMMDD
        #[arg(long)]
        curr_date: Option<String>,
        /// Skip the per-condition matched-ratio safety check
        #[arg(long, default_value = "false")]
        no_safety_check: bool,
    },
    /// Generate blacklist, notifications and exceptions lists
    Listgen {
        output_dir: PathBuf,
        #[arg(long)]
        curr_date: Option<String>,
    },
    /// Generate CSV reports
    Report {
        #[command(subcommand)]
        what: ReportCommand,
    },
    /// Schema administration
    Db {
        #[command(subcommand)]
        what: DbCommand,
    },
    /// Prune aged data
    Prune {
        #[command(subcommand)]
        what: PruneCommand,
    },
    /// Resolve the consolidated view of one IMEI
    Query {
        imei: String,
        #[arg(long, default_value = "false")]
        include_registration_status: bool,
        #[arg(long, default_value = "false")]
        include_stolen_status: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ImportCommand {
    /// Operator data dump: <operator>_<YYYYMMDD>_<YYYYMMDD>.csv[.gz]
    Operator {
        operator_id: String,
        path: PathBuf,
        #[command(flatten)]
        options: ImportFlags,
    },
    Gsma {
        path: PathBuf,
    },
    RegistrationList {
        path: PathBuf,
    },
    StolenList {
        path: PathBuf,
    },
    PairingList {
        path: PathBuf,
    },
    BarredList {
        path: PathBuf,
    },
    MonitoringList {
        path: PathBuf,
    },
    AssociationList {
        path: PathBuf,
    },
    SubscribersRegistrationList {
        path: PathBuf,
    },
}

/// Per-import overrides of the configured thresholds and gates.
#[derive(clap::Args, Debug)]
struct ImportFlags {
    #[arg(long)]
    null_imei_threshold: Option<f64>,
    #[arg(long)]
    null_imsi_threshold: Option<f64>,
    #[arg(long)]
    null_msisdn_threshold: Option<f64>,
    #[arg(long)]
    null_rat_threshold: Option<f64>,
    #[arg(long)]
    null_threshold: Option<f64>,
    #[arg(long)]
    unclean_imei_threshold: Option<f64>,
    #[arg(long)]
    unclean_imsi_threshold: Option<f64>,
    #[arg(long)]
    unclean_threshold: Option<f64>,
    #[arg(long)]
    out_of_region_imsi_threshold: Option<f64>,
    #[arg(long)]
    out_of_region_msisdn_threshold: Option<f64>,
    #[arg(long)]
    out_of_region_threshold: Option<f64>,
    #[arg(long)]
    non_home_network_threshold: Option<f64>,
    #[arg(long)]
    historic_imei_threshold: Option<f64>,
    #[arg(long)]
    historic_imsi_threshold: Option<f64>,
    #[arg(long)]
    historic_msisdn_threshold: Option<f64>,
    #[arg(long)]
    leading_zero_suspect_limit: Option<f64>,
    #[arg(long, default_value = "false")]
    disable_msisdn_import: bool,
    #[arg(long, default_value = "false")]
    disable_rat_import: bool,
    #[arg(long, default_value = "false")]
    disable_file_daterange_check: bool,
    #[arg(long, default_value = "false")]
    disable_leading_zero_check: bool,
    #[arg(long, default_value = "false")]
    disable_null_check: bool,
    #[arg(long, default_value = "false")]
    disable_unclean_check: bool,
    #[arg(long, default_value = "false")]
    disable_region_check: bool,
    #[arg(long, default_value = "false")]
    disable_home_network_check: bool,
    #[arg(long, default_value = "false")]
    disable_historic_check: bool,
}

impl ImportFlags {
    fn into_options(self, config: &AppConfig) -> OperatorImportOptions {
        let mut thresholds = config.import_thresholds.clone();
        macro_rules! apply {
            ($($field:ident),*) => {
                $(if let Some(v) = self.$field { thresholds.$field = v; })*
            };
        }
        apply!(
            null_imei_threshold,
            null_imsi_threshold,
            null_msisdn_threshold,
            null_rat_threshold,
            null_threshold,
            unclean_imei_threshold,
            unclean_imsi_threshold,
            unclean_threshold,
            out_of_region_imsi_threshold,
            out_of_region_msisdn_threshold,
            out_of_region_threshold,
            non_home_network_threshold,
            historic_imei_threshold,
            historic_imsi_threshold,
            historic_msisdn_threshold,
            leading_zero_suspect_limit
        );
        OperatorImportOptions {
            thresholds,
            perform_msisdn_import: !self.disable_msisdn_import,
            perform_rat_import: !self.disable_rat_import,
            perform_file_daterange_check: !self.disable_file_daterange_check,
            perform_leading_zero_check: !self.disable_leading_zero_check,
            perform_null_checks: !self.disable_null_check,
            perform_unclean_checks: !self.disable_unclean_check,
            perform_region_checks: !self.disable_region_check,
            perform_home_network_check: !self.disable_home_network_check,
            perform_historic_checks: !self.disable_historic_check,
        }
    }
}

#[derive(Subcommand, Debug)]
enum ReportCommand {
    /// Per-TAC compliance table and condition counts
    Standard {
        month: u32,
        year: i32,
        output_dir: PathBuf,
    },
    GsmaNotFound {
        month: u32,
        year: i32,
        output_dir: PathBuf,
    },
    TopDuplicates {
        month: u32,
        year: i32,
        output_dir: PathBuf,
        #[arg(long, default_value = "5")]
        imsi_min_limit: u64,
    },
    ConditionImeiOverlaps {
        month: u32,
        year: i32,
        output_dir: PathBuf,
    },
    StolenViolations {
        output_dir: PathBuf,
        #[arg(long)]
        filter_by_condition: Vec<String>,
        #[arg(long)]
        newer_than: Option<String>,
    },
    BlacklistViolations {
        month: u32,
        year: i32,
        output_dir: PathBuf,
    },
    AssociationViolations {
        month: u32,
        year: i32,
        output_dir: PathBuf,
    },
    NonActivePairs {
        last_seen_date: String,
        output_dir: PathBuf,
    },
    UnregisteredSubscribers {
        output_dir: PathBuf,
        #[arg(long)]
        newer_than: Option<String>,
    },
    ClassifiedTriplets {
        output_dir: PathBuf,
        #[arg(long)]
        conditions: Vec<String>,
    },
    TransientMsisdns {
        output_dir: PathBuf,
        #[arg(long, default_value = "30")]
        period: i64,
        #[arg(long, default_value = "4")]
        num_of_imeis: u64,
        #[arg(long)]
        current_date: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommand {
    Install {
        #[arg(long, default_value = "4")]
        num_physical_shards: u32,
    },
    Upgrade,
    Check,
    Repartition {
        #[arg(long)]
        num_physical_shards: u32,
    },
}

#[derive(Subcommand, Debug)]
enum PruneCommand {
    Triplets {
        #[arg(long)]
        curr_date: Option<String>,
    },
    ClassificationState {
        #[arg(long)]
        curr_date: Option<String>,
    },
}

fn parse_date_arg(value: &Option<String>) -> Result<Option<NaiveDate>> {
    match value {
        Some(s) => Ok(Some(
            parse_flexible_date(s).map_err(|e| anyhow::anyhow!(e))?,
        )),
        None => Ok(None),
    }
}

fn db_path(args: &Args) -> PathBuf {
    args.db
        .clone()
        .or_else(|| std::env::var("DIRBS_DB").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("dirbs_core.redb"))
}

fn config_path(args: &Args) -> Option<PathBuf> {
    args.config
        .clone()
        .or_else(|| std::env::var("DIRBS_CONFIG").ok().map(PathBuf::from))
}

fn run(args: Args) -> Result<()> {
    let config = load_config(config_path(&args).as_deref())?;
    let db = db_path(&args);

    match args.command {
        Command::Import { what } => match what {
            ImportCommand::Operator {
                operator_id,
                path,
                options,
            } => {
                let store = Store::open(&db, Role::ImportOperator)?;
                let options = options.into_options(&config);
                let outcome =
                    import_operator_data(&store, &config, &operator_id, &path, &options)?;
                println!(
                    "Import successful: {} rows, {} distinct triplets ({} new, {} updated)",
                    outcome.rows_in_file,
                    outcome.distinct_triplets,
                    outcome.triplets_inserted,
                    outcome.triplets_updated
                );
            }
            ImportCommand::Gsma { path } => {
                let store = Store::open(&db, Role::ImportReference)?;
                let count = reference::import_gsma_data(&store, &path)?;
                println!("Imported {} GSMA TAC records", count);
            }
            ImportCommand::RegistrationList { path } => {
                run_reference_import(&db, &path, reference::import_registration_list)?;
            }
            ImportCommand::StolenList { path } => {
                run_reference_import(&db, &path, reference::import_stolen_list)?;
            }
            ImportCommand::PairingList { path } => {
                run_reference_import(&db, &path, reference::import_pairing_list)?;
            }
            ImportCommand::BarredList { path } => {
                run_reference_import(&db, &path, reference::import_barred_list)?;
            }
            ImportCommand::MonitoringList { path } => {
                run_reference_import(&db, &path, reference::import_monitoring_list)?;
            }
            ImportCommand::AssociationList { path } => {
                run_reference_import(&db, &path, reference::import_association_list)?;
            }
            ImportCommand::SubscribersRegistrationList { path } => {
                run_reference_import(&db, &path, reference::import_subscribers_list)?;
            }
        },
        Command::Classify {
            curr_date,
            no_safety_check,
        } => {
            let store = Store::open(&db, Role::Classify)?;
            let curr_date = parse_date_arg(&curr_date)?;
            let outcome = classify::classify(&store, &config, curr_date, no_safety_check)?;
            for (label, count) in &outcome.matched_imei_counts {
                println!("{}: {} matched IMEIs", label, count);
            }
            for (label, error) in &outcome.failed_conditions {
                eprintln!("{}: failed ({})", label, error);
            }
            if !outcome.failed_conditions.is_empty() {
                anyhow::bail!("one or more conditions failed to classify");
            }
        }
        Command::Listgen {
            output_dir,
            curr_date,
        } => {
            let store = Store::open(&db, Role::Listgen)?;
            let curr_date = parse_date_arg(&curr_date)?;
            let outcome = listgen::generate_lists(&store, &config, &output_dir, curr_date)?;
            println!(
                "Generated lists (run {}): {} blacklisted IMEIs",
                outcome.run_id, outcome.blacklist_size
            );
        }
        Command::Report { what } => run_report(&db, &config, what)?,
        Command::Db { what } => match what {
            DbCommand::Install {
                num_physical_shards,
            } => {
                maintenance::db_install(&db, num_physical_shards)?;
                println!("Installed store at {:?}", db);
            }
            DbCommand::Upgrade => {
                let store = Store::open(&db, Role::Admin)?;
                maintenance::db_upgrade(&store)?;
            }
            DbCommand::Check => {
                let store = Store::open(&db, Role::Admin)?;
                maintenance::db_check(&store)?;
                println!("Schema check passed");
            }
            DbCommand::Repartition {
                num_physical_shards,
            } => {
                let store = Store::open(&db, Role::Admin)?;
                maintenance::repartition(&store, num_physical_shards)?;
                println!("Repartitioned to {} physical shards", num_physical_shards);
            }
        },
        Command::Prune { what } => match what {
            PruneCommand::Triplets { curr_date } => {
                let store = Store::open(&db, Role::Admin)?;
                let curr_date = parse_date_arg(&curr_date)?;
                let dropped = maintenance::prune_triplets(&store, &config, curr_date)?;
                println!("Dropped {} partitions", dropped.len());
            }
            PruneCommand::ClassificationState { curr_date } => {
                let store = Store::open(&db, Role::Admin)?;
                let curr_date = parse_date_arg(&curr_date)?;
                let removed = maintenance::prune_classification_state(&store, &config, curr_date)?;
                println!("Removed {} classification rows", removed);
            }
        },
        Command::Query {
            imei,
            include_registration_status,
            include_stolen_status,
        } => {
            let store = Store::open(&db, Role::Query)?;
            let info = query::resolve_imei(
                &store,
                &config,
                &imei,
                include_registration_status,
                include_stolen_status,
            )?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }
    Ok(())
}

fn run_reference_import(
    db: &std::path::Path,
    path: &std::path::Path,
    import: impl Fn(&Store, &std::path::Path, NaiveDate) -> Result<reference::ImportStats>,
) -> Result<()> {
    let store = Store::open(db, Role::ImportReference)?;
    let curr_date = chrono::Utc::now().date_naive();
    let stats = import(&store, path, curr_date)?;
    println!(
        "Import successful: {} rows in file, {} inserted, {} removed, {} unchanged",
        stats.rows_in_file, stats.inserted, stats.removed, stats.unchanged
    );
    Ok(())
}

fn run_report(db: &std::path::Path, config: &AppConfig, command: ReportCommand) -> Result<()> {
    let store = Store::open(db, Role::Report)?;
    let country = config.region.name.clone();
    let filenames = match command {
        ReportCommand::Standard {
            month,
            year,
            output_dir,
        } => {
            std::fs::create_dir_all(&output_dir)?;
            let (report_stats, _durations) =
                stats::generate_monthly_report_stats(&store, config, month, year)?;
            reports::write_standard_report(&report_stats, &country, &output_dir)?
        }
        ReportCommand::GsmaNotFound {
            month,
            year,
            output_dir,
        } => {
            std::fs::create_dir_all(&output_dir)?;
            reports::write_country_gsma_not_found_report(
                &store,
                config,
                month,
                year,
                &country,
                &output_dir,
            )?
        }
        ReportCommand::TopDuplicates {
            month,
            year,
            output_dir,
            imsi_min_limit,
        } => {
            std::fs::create_dir_all(&output_dir)?;
            reports::write_country_duplicates_report(
                &store,
                month,
                year,
                &country,
                &output_dir,
                imsi_min_limit,
            )?
        }
        ReportCommand::ConditionImeiOverlaps {
            month,
            year,
            output_dir,
        } => {
            std::fs::create_dir_all(&output_dir)?;
            reports::write_condition_imei_overlaps(
                &store,
                config,
                month,
                year,
                &country,
                &output_dir,
            )?
        }
        ReportCommand::StolenViolations {
            output_dir,
            filter_by_condition,
            newer_than,
        } => {
            std::fs::create_dir_all(&output_dir)?;
            let newer_than = parse_date_arg(&newer_than)?;
            reports::write_stolen_violations(
                &store,
                config,
                &output_dir,
                &filter_by_condition,
                newer_than,
            )?
        }
        ReportCommand::BlacklistViolations {
            month,
            year,
            output_dir,
        } => {
            std::fs::create_dir_all(&output_dir)?;
            reports::write_blacklist_violations(&store, config, &output_dir, month, year)?
        }
        ReportCommand::AssociationViolations {
            month,
            year,
            output_dir,
        } => {
            std::fs::create_dir_all(&output_dir)?;
            reports::write_association_violations(&store, config, &output_dir, month, year)?
        }
        ReportCommand::NonActivePairs {
            last_seen_date,
            output_dir,
        } => {
            std::fs::create_dir_all(&output_dir)?;
            let date =
                parse_flexible_date(&last_seen_date).map_err(|e| anyhow::anyhow!(e))?;
            reports::write_non_active_pairs(&store, &output_dir, date)?
        }
        ReportCommand::UnregisteredSubscribers {
            output_dir,
            newer_than,
        } => {
            std::fs::create_dir_all(&output_dir)?;
            let newer_than = parse_date_arg(&newer_than)?;
            reports::write_unregistered_subscribers(&store, config, &output_dir, newer_than)?
        }
        ReportCommand::ClassifiedTriplets {
            output_dir,
            conditions,
        } => {
            std::fs::create_dir_all(&output_dir)?;
            let conditions = if conditions.is_empty() {
                config.conditions.iter().map(|c| c.label.clone()).collect()
            } else {
                conditions
            };
            reports::write_classified_triplets(&store, &conditions, &output_dir)?
        }
        ReportCommand::TransientMsisdns {
            output_dir,
            period,
            num_of_imeis,
            current_date,
        } => {
            std::fs::create_dir_all(&output_dir)?;
            let current_date = parse_date_arg(&current_date)?;
            reports::write_transient_msisdns(
                &store,
                config,
                &output_dir,
                period,
                num_of_imeis,
                current_date,
            )?
        }
    };
    for filename in filenames {
        println!("Wrote {}", filename);
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
