// Configuration management for the DIRBS engine
use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigError;

/// Operator id reserved for country-level aggregates.
pub const COUNTRY_OPERATOR_NAME: &str = "__all__";

/// Hard cap on concurrent database sessions.
pub const MAX_DB_CONNECTIONS_CAP: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub region: RegionConfig,
    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,
    #[serde(default)]
    pub amnesty: AmnestyConfig,
    #[serde(default)]
    pub multiprocessing: MultiprocessingConfig,
    #[serde(default)]
    pub import_thresholds: ImportThresholds,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    #[serde(default)]
    pub country_codes: Vec<String>,
    #[serde(default)]
    pub operators: Vec<OperatorConfig>,
    #[serde(default)]
    pub exempted_device_types: Vec<String>,
}

impl Default for RegionConfig {
    fn default() -> Self {
        RegionConfig {
            name: "Country1".to_string(),
            country_codes: Vec::new(),
            operators: Vec::new(),
            exempted_device_types: Vec::new(),
        }
    }
}

impl RegionConfig {
    pub fn operator_ids(&self) -> Vec<String> {
        self.operators.iter().map(|o| o.id.clone()).collect()
    }

    pub fn operator(&self, id: &str) -> Option<&OperatorConfig> {
        self.operators.iter().find(|o| o.id == id)
    }

    /// All configured MCC||MNC prefixes across operators.
    pub fn all_mcc_mnc_prefixes(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .operators
            .iter()
            .flat_map(|o| o.mcc_mnc_prefixes())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// All configured MCC prefixes across operators.
    pub fn all_mcc_prefixes(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .operators
            .iter()
            .flat_map(|o| o.mcc_prefixes())
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub mcc_mnc_pairs: Vec<MccMncPair>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MccMncPair {
    pub mcc: String,
    pub mnc: String,
}

impl OperatorConfig {
    /// MCC||MNC prefixes for home-network and subscriber checks.
    pub fn mcc_mnc_prefixes(&self) -> Vec<String> {
        self.mcc_mnc_pairs
            .iter()
            .map(|p| format!("{}{}", p.mcc, p.mnc))
            .collect()
    }

    pub fn mcc_prefixes(&self) -> Vec<String> {
        self.mcc_mnc_pairs.iter().map(|p| p.mcc.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub label: String,
    pub dimensions: Vec<DimensionConfig>,
    #[serde(default)]
    pub grace_period_days: u32,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default)]
    pub sticky: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_max_allowed_matching_ratio")]
    pub max_allowed_matching_ratio: f64,
    #[serde(default = "default_true")]
    pub amnesty_eligible: bool,
}

fn default_max_allowed_matching_ratio() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionConfig {
    pub module: String,
    #[serde(default)]
    pub parameters: serde_yaml::Value,
    #[serde(default)]
    pub invert: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AmnestyConfig {
    #[serde(default)]
    pub amnesty_enabled: bool,
    #[serde(default, deserialize_with = "deserialize_opt_compact_date")]
    pub evaluation_period_end_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "deserialize_opt_compact_date")]
    pub amnesty_period_end_date: Option<NaiveDate>,
}

/// Whether `curr_date` falls in the amnesty evaluation period and/or the
/// amnesty period proper.
pub fn compute_amnesty_flags(amnesty: &AmnestyConfig, curr_date: NaiveDate) -> (bool, bool) {
    match (
        amnesty.amnesty_enabled,
        amnesty.evaluation_period_end_date,
        amnesty.amnesty_period_end_date,
    ) {
        (true, Some(eval_end), Some(amnesty_end)) => {
            let in_eval = curr_date <= eval_end;
            let in_amnesty = curr_date > eval_end && curr_date <= amnesty_end;
            (in_eval, in_amnesty)
        }
        _ => (false, false),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiprocessingConfig {
    #[serde(default = "default_max_db_connections")]
    pub max_db_connections: usize,
    #[serde(default)]
    pub max_local_cpus: usize,
}

fn default_max_db_connections() -> usize {
    4
}

impl Default for MultiprocessingConfig {
    fn default() -> Self {
        MultiprocessingConfig {
            max_db_connections: default_max_db_connections(),
            max_local_cpus: 0,
        }
    }
}

impl MultiprocessingConfig {
    /// Worker count for CPU-bound pools: configured value or all-but-one core.
    pub fn effective_local_cpus(&self) -> usize {
        if self.max_local_cpus > 0 {
            self.max_local_cpus
        } else {
            num_cpus::get().saturating_sub(1).max(1)
        }
    }
}

/// Thresholded quality gates applied during operator data import. Each
/// ratio threshold lies in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportThresholds {
    pub null_imei_threshold: f64,
    pub null_imsi_threshold: f64,
    pub null_msisdn_threshold: f64,
    pub null_rat_threshold: f64,
    pub null_threshold: f64,
    pub unclean_imei_threshold: f64,
    pub unclean_imsi_threshold: f64,
    pub unclean_threshold: f64,
    pub out_of_region_imsi_threshold: f64,
    pub out_of_region_msisdn_threshold: f64,
    pub out_of_region_threshold: f64,
    pub non_home_network_threshold: f64,
    pub historic_imei_threshold: f64,
    pub historic_imsi_threshold: f64,
    pub historic_msisdn_threshold: f64,
    pub leading_zero_suspect_limit: f64,
}

impl Default for ImportThresholds {
    fn default() -> Self {
        ImportThresholds {
            null_imei_threshold: 0.05,
            null_imsi_threshold: 0.05,
            null_msisdn_threshold: 0.05,
            null_rat_threshold: 0.05,
            null_threshold: 0.05,
            unclean_imei_threshold: 0.05,
            unclean_imsi_threshold: 0.05,
            unclean_threshold: 0.05,
            out_of_region_imsi_threshold: 0.1,
            out_of_region_msisdn_threshold: 0.1,
            out_of_region_threshold: 0.1,
            non_home_network_threshold: 0.2,
            historic_imei_threshold: 0.9,
            historic_imsi_threshold: 0.9,
            historic_msisdn_threshold: 0.9,
            leading_zero_suspect_limit: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_months")]
    pub months_retention: u32,
}

fn default_retention_months() -> u32 {
    6
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            months_retention: default_retention_months(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_blacklist_violations_grace_period_days")]
    pub blacklist_violations_grace_period_days: u32,
}

fn default_blacklist_violations_grace_period_days() -> u32 {
    2
}

impl Default for ReportConfig {
    fn default() -> Self {
        ReportConfig {
            blacklist_violations_grace_period_days: default_blacklist_violations_grace_period_days(
            ),
        }
    }
}

/// Load configuration from a YAML file and merge with defaults.
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig> {
    let config = if let Some(path) = config_path {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        parse_config(&contents)?
    } else {
        AppConfig::default()
    };
    Ok(config)
}

/// Parse and validate a YAML configuration document.
pub fn parse_config(contents: &str) -> Result<AppConfig> {
    let config: AppConfig = serde_yaml::from_str(contents)
        .map_err(|e| ConfigError(format!("malformed config: {}", e)))?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &AppConfig) -> Result<()> {
    validate_region(&config.region)?;
    validate_conditions(&config.conditions)?;
    validate_amnesty(&config.amnesty)?;
    validate_multiprocessing(&config.multiprocessing)?;
    validate_thresholds(&config.import_thresholds)?;
    Ok(())
}

fn validate_region(region: &RegionConfig) -> Result<()> {
    for cc in &region.country_codes {
        if cc.is_empty() || !cc.chars().all(|c| c.is_ascii_digit()) {
            return Err(
                ConfigError(format!("RegionConfig: invalid country code '{}'", cc)).into(),
            );
        }
    }

    let mut seen_ids = HashSet::new();
    let mut all_prefixes: Vec<(String, String)> = Vec::new();
    for op in &region.operators {
        if op.id == COUNTRY_OPERATOR_NAME {
            return Err(ConfigError(format!(
                "RegionConfig: operator ID {} is reserved",
                COUNTRY_OPERATOR_NAME
            ))
            .into());
        }
        if op.id.is_empty()
            || !op
                .id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(ConfigError(format!(
                "RegionConfig: operator ID {} must be non-empty lowercase [a-z0-9_]",
                op.id
            ))
            .into());
        }
        if !seen_ids.insert(op.id.clone()) {
            return Err(
                ConfigError(format!("RegionConfig: duplicate operator ID {}", op.id)).into(),
            );
        }
        if op.mcc_mnc_pairs.is_empty() {
            return Err(ConfigError(format!(
                "Missing (or non-list) mcc_mnc_pairs in config for operator ID {}",
                op.id
            ))
            .into());
        }
        for pair in &op.mcc_mnc_pairs {
            for (field, value) in [("mcc", &pair.mcc), ("mnc", &pair.mnc)] {
                if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
                    return Err(ConfigError(format!(
                        "RegionConfig: non-numeric {} '{}' for operator ID {}",
                        field, value, op.id
                    ))
                    .into());
                }
            }
            all_prefixes.push((op.id.clone(), format!("{}{}", pair.mcc, pair.mnc)));
        }
    }

    // No pair may duplicate or be a prefix of another pair, across all
    // operators: ambiguous prefixes would make IMSI attribution unstable.
    for (i, (id_a, a)) in all_prefixes.iter().enumerate() {
        for (id_b, b) in all_prefixes.iter().skip(i + 1) {
            if a.starts_with(b.as_str()) || b.starts_with(a.as_str()) {
                return Err(ConfigError(format!(
                    "RegionConfig: overlapping MCC-MNC pair {} (operator {}) and {} (operator {})",
                    a, id_a, b, id_b
                ))
                .into());
            }
        }
    }
    Ok(())
}

fn validate_conditions(conditions: &[ConditionConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for cond in conditions {
        if cond.label.is_empty()
            || cond.label.len() > 64
            || !cond
                .label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError(format!(
                "ConditionConfig: invalid condition label '{}'",
                cond.label
            ))
            .into());
        }
        if !seen.insert(cond.label.to_lowercase()) {
            return Err(ConfigError(format!(
                "ConditionConfig: duplicate condition label '{}'",
                cond.label
            ))
            .into());
        }
        if cond.dimensions.is_empty() {
            return Err(ConfigError(format!(
                "ConditionConfig: condition '{}' has no dimensions",
                cond.label
            ))
            .into());
        }
        if !(0.0..=1.0).contains(&cond.max_allowed_matching_ratio) {
            return Err(ConfigError(format!(
                "ConditionConfig: max_allowed_matching_ratio for '{}' must be within [0, 1]",
                cond.label
            ))
            .into());
        }
    }
    Ok(())
}

fn validate_amnesty(amnesty: &AmnestyConfig) -> Result<()> {
    if amnesty.amnesty_enabled {
        match (
            amnesty.evaluation_period_end_date,
            amnesty.amnesty_period_end_date,
        ) {
            (Some(eval_end), Some(amnesty_end)) => {
                if amnesty_end <= eval_end {
                    return Err(ConfigError(
                        "The 'amnesty_period_end_date' must be greater than the \
                         'evaluation_period_end_date'!"
                            .to_string(),
                    )
                    .into());
                }
            }
            _ => {
                return Err(ConfigError(
                    "Amnesty enabled but evaluation_period_end_date or amnesty_period_end_date \
                     missing"
                        .to_string(),
                )
                .into());
            }
        }
    }
    Ok(())
}

fn validate_multiprocessing(mp: &MultiprocessingConfig) -> Result<()> {
    if mp.max_db_connections < 1 || mp.max_db_connections > MAX_DB_CONNECTIONS_CAP {
        return Err(ConfigError(format!(
            "max_db_connections must be at least 1 and can not be set higher than {}!",
            MAX_DB_CONNECTIONS_CAP
        ))
        .into());
    }
    if mp.max_local_cpus > 0 && mp.max_local_cpus >= num_cpus::get() {
        return Err(ConfigError(
            "max_local_cpus must be at least 1 and can not be set higher than CPUs present in \
             the system minus one!"
                .to_string(),
        )
        .into());
    }
    Ok(())
}

fn validate_thresholds(t: &ImportThresholds) -> Result<()> {
    let ratios = [
        ("null_imei_threshold", t.null_imei_threshold),
        ("null_imsi_threshold", t.null_imsi_threshold),
        ("null_msisdn_threshold", t.null_msisdn_threshold),
        ("null_rat_threshold", t.null_rat_threshold),
        ("null_threshold", t.null_threshold),
        ("unclean_imei_threshold", t.unclean_imei_threshold),
        ("unclean_imsi_threshold", t.unclean_imsi_threshold),
        ("unclean_threshold", t.unclean_threshold),
        (
            "out_of_region_imsi_threshold",
            t.out_of_region_imsi_threshold,
        ),
        (
            "out_of_region_msisdn_threshold",
            t.out_of_region_msisdn_threshold,
        ),
        ("out_of_region_threshold", t.out_of_region_threshold),
        ("non_home_network_threshold", t.non_home_network_threshold),
        ("leading_zero_suspect_limit", t.leading_zero_suspect_limit),
    ];
    for (name, value) in ratios {
        if !(0.0..=1.0).contains(&value) {
            return Err(ConfigError(format!("{} must be within [0, 1]", name)).into());
        }
    }
    Ok(())
}

/// Dates are accepted either as ISO strings ("2018-01-01") or compact
/// YYYYMMDD values ("20180101" or 20180101).
fn deserialize_opt_compact_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<serde_yaml::Value> = Option::deserialize(deserializer)?;
    match raw {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => parse_flexible_date(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(serde_yaml::Value::Number(n)) => {
            let s = n.to_string();
            parse_flexible_date(&s)
                .map(Some)
                .map_err(serde::de::Error::custom)
        }
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected date, got {:?}",
            other
        ))),
    }
}

pub fn parse_flexible_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y%m%d"))
        .map_err(|_| format!("invalid date '{}'", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_yaml(operators: &str) -> String {
        format!(
            "region:\n  name: Country1\n  country_codes: ['22']\n  operators:\n{}",
            operators
        )
    }

    #[test]
    fn test_reserved_operator_id_rejected() {
        let yaml =
            region_yaml("    - id: __all__\n      mcc_mnc_pairs: [{mcc: '111', mnc: '01'}]\n");
        let err = parse_config(&yaml).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_duplicate_mcc_mnc_rejected() {
        let yaml = region_yaml(
            "    - id: operator1\n      mcc_mnc_pairs: [{mcc: '01', mnc: '01'}, {mcc: '01', mnc: '01'}]\n",
        );
        assert!(parse_config(&yaml).is_err());
    }

    #[test]
    fn test_prefix_overlap_across_operators_rejected() {
        let yaml = region_yaml(
            "    - id: operator1\n      mcc_mnc_pairs: [{mcc: '01', mnc: '0'}]\n    - id: operator2\n      mcc_mnc_pairs: [{mcc: '01', mnc: '01'}]\n",
        );
        assert!(parse_config(&yaml).is_err());
    }

    #[test]
    fn test_valid_config_parses() {
        let yaml = region_yaml(
            "    - id: operator1\n      mcc_mnc_pairs: [{mcc: '111', mnc: '01'}]\n    - id: operator2\n      mcc_mnc_pairs: [{mcc: '111', mnc: '02'}]\n",
        );
        let cfg = parse_config(&yaml).unwrap();
        assert_eq!(cfg.region.operators.len(), 2);
        assert_eq!(cfg.region.operators[0].mcc_mnc_prefixes(), vec!["11101"]);
        assert_eq!(cfg.multiprocessing.max_db_connections, 4);
    }

    #[test]
    fn test_max_db_connections_cap() {
        let yaml = "multiprocessing:\n  max_db_connections: 1000\n";
        let err = parse_config(yaml).unwrap_err();
        assert!(err.to_string().contains("can not be set higher than 32"));
    }

    #[test]
    fn test_amnesty_date_ordering() {
        let yaml = "amnesty:\n  amnesty_enabled: true\n  evaluation_period_end_date: 20180101\n  amnesty_period_end_date: 20180101\n";
        let err = parse_config(yaml).unwrap_err();
        assert!(err.to_string().contains("must be greater than"));

        let yaml = "amnesty:\n  amnesty_enabled: true\n  evaluation_period_end_date: 20180101\n  amnesty_period_end_date: 20180202\n";
        let cfg = parse_config(yaml).unwrap();
        assert_eq!(
            cfg.amnesty.evaluation_period_end_date,
            Some(NaiveDate::from_ymd_opt(2018, 1, 1).unwrap())
        );
        assert_eq!(
            cfg.amnesty.amnesty_period_end_date,
            Some(NaiveDate::from_ymd_opt(2018, 2, 2).unwrap())
        );
    }

    #[test]
    fn test_amnesty_flags() {
        let amnesty = AmnestyConfig {
            amnesty_enabled: true,
            evaluation_period_end_date: Some(NaiveDate::from_ymd_opt(2018, 1, 31).unwrap()),
            amnesty_period_end_date: Some(NaiveDate::from_ymd_opt(2018, 3, 31).unwrap()),
        };
        let d = |y, m, dd| NaiveDate::from_ymd_opt(y, m, dd).unwrap();
        assert_eq!(
            compute_amnesty_flags(&amnesty, d(2018, 1, 15)),
            (true, false)
        );
        assert_eq!(
            compute_amnesty_flags(&amnesty, d(2018, 2, 15)),
            (false, true)
        );
        assert_eq!(
            compute_amnesty_flags(&amnesty, d(2018, 4, 15)),
            (false, false)
        );
        let disabled = AmnestyConfig::default();
        assert_eq!(
            compute_amnesty_flags(&disabled, d(2018, 1, 15)),
            (false, false)
        );
    }

    #[test]
    fn test_condition_defaults() {
        let yaml = "conditions:\n  - label: gsma_not_found\n    blocking: true\n    dimensions:\n      - module: gsma_not_found\n";
        let cfg = parse_config(yaml).unwrap();
        let cond = &cfg.conditions[0];
        assert!(cond.blocking);
        assert!(!cond.sticky);
        assert_eq!(cond.grace_period_days, 0);
        assert!((cond.max_allowed_matching_ratio - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_duplicate_condition_labels_rejected() {
        let yaml = "conditions:\n  - label: dup\n    dimensions: [{module: is_test_tac}]\n  - label: DUP\n    dimensions: [{module: is_test_tac}]\n";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn test_threshold_range_validation() {
        let yaml = "import_thresholds:\n  null_imei_threshold: 1.5\n";
        assert!(parse_config(yaml).is_err());
    }
}
