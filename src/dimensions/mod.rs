// Classification dimension framework: set-valued predicates over the
// sharded triplet store, composed per condition by intersection
pub mod duplicates;
pub mod gsma_not_found;
pub mod network_lists;
pub mod transient;

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{Months, NaiveDate};
use serde::Deserialize;
use tracing::debug;

use crate::config::{AppConfig, DimensionConfig};
use crate::error::ConfigError;
use crate::partition;
use crate::reference::GsmaRecord;
use crate::shard::imei_shard_name;
use crate::store::Store;
use crate::triplets::{
    date_range_for_month_year, scan_network_imeis, scan_triplets, NetworkImeiRecord, TripletRecord,
};

pub use duplicates::{DailyAvgUid, DuplicateDailyAvg, DuplicateThreshold};
pub use gsma_not_found::GsmaNotFound;
pub use network_lists::{ExistsInBarredList, InconsistentRat, IsTestTac, NotOnAssociationList};
pub use transient::{TransientImei, UsedByDirbsSubscriber};

/// Half-open [start, end) analysis window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl AnalysisWindow {
    pub fn from_period(end: NaiveDate, period_days: Option<i64>, period_months: Option<u32>) -> Self {
        let start = match (period_days, period_months) {
            (Some(days), _) => end - chrono::Duration::days(days),
            (None, Some(months)) => end
                .checked_sub_months(Months::new(months))
                .unwrap_or(NaiveDate::MIN),
            (None, None) => end,
        };
        AnalysisWindow { start, end }
    }
}

/// Everything a dimension needs to evaluate one shard range.
pub struct DimensionContext<'a> {
    pub store: &'a Store,
    pub config: &'a AppConfig,
    pub range_start: u32,
    pub range_end: u32,
    pub analysis_end_date: NaiveDate,
    pub gsma: &'a HashMap<String, GsmaRecord>,
}

impl DimensionContext<'_> {
    pub fn in_shard_range(&self, virt_imei_shard: u32) -> bool {
        virt_imei_shard >= self.range_start && virt_imei_shard < self.range_end
    }

    /// network_imeis rows for this shard range.
    pub fn network_imeis(&self) -> Result<Vec<NetworkImeiRecord>> {
        let txn = self.store.begin_read()?;
        let leaf = imei_shard_name("network_imeis", self.range_start, self.range_end);
        scan_network_imeis(&txn, &leaf)
    }

    /// Country-level triplets overlapping the window, restricted to this
    /// shard range and to rows whose seen dates intersect [start, end).
    pub fn country_triplets_in_window(&self, window: AnalysisWindow) -> Result<Vec<TripletRecord>> {
        self.triplets_in_window("monthly_network_triplets_country", window, true)
    }

    /// Per-MNO triplets overlapping the window. `restrict_shard` false scans
    /// every shard, for dimensions that follow cross-IMEI associations.
    pub fn mno_triplets_in_window(
        &self,
        window: AnalysisWindow,
        restrict_shard: bool,
    ) -> Result<Vec<TripletRecord>> {
        self.triplets_in_window("monthly_network_triplets_per_mno", window, restrict_shard)
    }

    fn triplets_in_window(
        &self,
        base: &str,
        window: AnalysisWindow,
        restrict_shard: bool,
    ) -> Result<Vec<TripletRecord>> {
        let txn = self.store.begin_read()?;
        let mut out = Vec::new();
        for (leaf, meta) in partition::family_partitions(self.store, base)? {
            let (year, month) = match (meta.year, meta.month) {
                (Some(y), Some(m)) => (y, m),
                _ => continue,
            };
            let (month_start, month_end) = date_range_for_month_year(year, month);
            if month_end <= window.start || month_start >= window.end {
                continue;
            }
            if restrict_shard
                && (meta.shard_end <= self.range_start || meta.shard_start >= self.range_end)
            {
                continue;
            }
            for record in scan_triplets(&txn, &leaf)? {
                if restrict_shard && !self.in_shard_range(record.virt_imei_shard) {
                    continue;
                }
                if record.last_seen >= window.start && record.first_seen < window.end {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

}

/// Strict IMSI shape shared by the duplicate analyses: 14 or 15 digits.
pub fn is_valid_imsi(imsi: &str) -> bool {
    (imsi.len() == 14 || imsi.len() == 15) && imsi.chars().all(|c| c.is_ascii_digit())
}

/// MSISDNs only need to be numeric and non-empty for analysis purposes.
pub fn is_valid_msisdn(msisdn: &str) -> bool {
    !msisdn.is_empty() && msisdn.chars().all(|c| c.is_ascii_digit())
}

/// Closed registry of classification dimensions. Constructors validate
/// their parameters at config-parse time.
#[derive(Debug, Clone)]
pub enum Dimension {
    GsmaNotFound(GsmaNotFound),
    DuplicateThreshold(DuplicateThreshold),
    DuplicateDailyAvg(DuplicateDailyAvg),
    DailyAvgUid(DailyAvgUid),
    ExistsInBarredList(ExistsInBarredList),
    NotOnAssociationList(NotOnAssociationList),
    InconsistentRat(InconsistentRat),
    IsTestTac(IsTestTac),
    TransientImei(TransientImei),
    UsedByDirbsSubscriber(UsedByDirbsSubscriber),
}

impl Dimension {
    pub fn algorithm_name(&self) -> &'static str {
        match self {
            Dimension::GsmaNotFound(_) => "GSMA not found",
            Dimension::DuplicateThreshold(_) => "Duplicate threshold",
            Dimension::DuplicateDailyAvg(_) => "Duplicate daily average",
            Dimension::DailyAvgUid(_) => "Daily average uid",
            Dimension::ExistsInBarredList(_) => "Exists in barred list",
            Dimension::NotOnAssociationList(_) => "Not on association list",
            Dimension::InconsistentRat(_) => "Inconsistent RAT",
            Dimension::IsTestTac(_) => "Is test TAC",
            Dimension::TransientImei(_) => "Transient IMEI",
            Dimension::UsedByDirbsSubscriber(_) => "Used by DIRBS subscriber",
        }
    }

    fn matching_imeis(&self, ctx: &DimensionContext<'_>) -> Result<HashSet<String>> {
        match self {
            Dimension::GsmaNotFound(d) => d.matching_imeis(ctx),
            Dimension::DuplicateThreshold(d) => d.matching_imeis(ctx),
            Dimension::DuplicateDailyAvg(d) => d.matching_imeis(ctx),
            Dimension::DailyAvgUid(d) => d.matching_imeis(ctx),
            Dimension::ExistsInBarredList(d) => d.matching_imeis(ctx),
            Dimension::NotOnAssociationList(d) => d.matching_imeis(ctx),
            Dimension::InconsistentRat(d) => d.matching_imeis(ctx),
            Dimension::IsTestTac(d) => d.matching_imeis(ctx),
            Dimension::TransientImei(d) => d.matching_imeis(ctx),
            Dimension::UsedByDirbsSubscriber(d) => d.matching_imeis(ctx),
        }
    }
}

/// A dimension plus its composition modifiers.
#[derive(Debug, Clone)]
pub struct DimensionSpec {
    pub dimension: Dimension,
    pub invert: bool,
    pub condition_label: Option<String>,
}

impl DimensionSpec {
    /// Matching IMEI set for the context's shard range. With `invert`, the
    /// complement is taken against the network_imeis shard.
    pub fn matching_imeis(&self, ctx: &DimensionContext<'_>) -> Result<HashSet<String>> {
        let base = self.dimension.matching_imeis(ctx)?;
        let result = if self.invert {
            ctx.network_imeis()?
                .into_iter()
                .map(|r| r.imei_norm)
                .filter(|imei| !base.contains(imei))
                .collect()
        } else {
            base
        };
        if let Some(label) = &self.condition_label {
            debug!(
                "{} dimension in condition \"{}\" matched {} IMEIs in shard [{}, {})",
                self.dimension.algorithm_name(),
                label,
                result.len(),
                ctx.range_start,
                ctx.range_end
            );
        }
        Ok(result)
    }
}

fn parse_params<T>(module: &str, parameters: &serde_yaml::Value) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if parameters.is_null() {
        return Ok(T::default());
    }
    serde_yaml::from_value(parameters.clone()).map_err(|e| {
        ConfigError(format!(
            "Invalid parameters for dimension '{}': {}",
            module, e
        ))
        .into()
    })
}

/// Build a dimension from its config entry, validating parameters.
pub fn dimension_from_config(
    cfg: &DimensionConfig,
    condition_label: &str,
) -> Result<DimensionSpec> {
    let dimension = match cfg.module.as_str() {
        "gsma_not_found" => Dimension::GsmaNotFound(GsmaNotFound::new(parse_params(
            &cfg.module,
            &cfg.parameters,
        )?)?),
        "duplicate_threshold" => Dimension::DuplicateThreshold(DuplicateThreshold::new(
            parse_params(&cfg.module, &cfg.parameters)?,
        )?),
        "duplicate_daily_avg" => Dimension::DuplicateDailyAvg(DuplicateDailyAvg::new(
            parse_params(&cfg.module, &cfg.parameters)?,
        )?),
        "daily_avg_uid" => {
            Dimension::DailyAvgUid(DailyAvgUid::new(parse_params(&cfg.module, &cfg.parameters)?)?)
        }
        "exists_in_barred_list" => Dimension::ExistsInBarredList(ExistsInBarredList),
        "not_on_association_list" => Dimension::NotOnAssociationList(NotOnAssociationList),
        "inconsistent_rat" => Dimension::InconsistentRat(InconsistentRat),
        "is_test_tac" => Dimension::IsTestTac(IsTestTac),
        "transient_imei" => Dimension::TransientImei(TransientImei::new(parse_params(
            &cfg.module,
            &cfg.parameters,
        )?)?),
        "used_by_dirbs_subscriber" => Dimension::UsedByDirbsSubscriber(
            UsedByDirbsSubscriber::new(parse_params(&cfg.module, &cfg.parameters)?)?,
        ),
        other => {
            return Err(ConfigError(format!("Unknown dimension module '{}'", other)).into());
        }
    };
    Ok(DimensionSpec {
        dimension,
        invert: cfg.invert,
        condition_label: Some(condition_label.to_string()),
    })
}
