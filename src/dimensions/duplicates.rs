// Duplicate-IMEI dimensions: absolute identifier counts, daily averages
// and registered-subscriber UID averages over a lookback window
use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::reference::{self, SubscriberRecord};
use crate::triplets::{bitcount, bitmask_within_window};

use super::{is_valid_imsi, is_valid_msisdn, AnalysisWindow, DimensionContext};

/// Period settings shared by the duplicate dimensions: exactly one of
/// period_days / period_months must be set, non-negative.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeriodParams {
    #[serde(default)]
    pub period_days: Option<i64>,
    #[serde(default)]
    pub period_months: Option<u32>,
}

impl PeriodParams {
    fn validate(&self, dimension: &str) -> Result<()> {
        match (self.period_days, self.period_months) {
            (Some(_), Some(_)) => Err(ConfigError(format!(
                "Both period_days and period_months in {} dimension are non-NULL. Check config...",
                dimension
            ))
            .into()),
            (None, None) => Err(ConfigError(format!(
                "Both period_days and period_months in {} dimension are NULL. Check config...",
                dimension
            ))
            .into()),
            (Some(days), None) if days < 0 => Err(ConfigError(format!(
                "Negative value for period_days passed to {} dimension. Check config...",
                dimension
            ))
            .into()),
            _ => Ok(()),
        }
    }

    fn window(&self, ctx: &DimensionContext<'_>) -> AnalysisWindow {
        AnalysisWindow::from_period(ctx.analysis_end_date, self.period_days, self.period_months)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DuplicateThresholdParams {
    pub threshold: u64,
    #[serde(flatten)]
    pub period: PeriodParams,
    #[serde(default)]
    pub use_msisdn: bool,
}

/// Matches IMEIs seen with at least `threshold` distinct IMSIs (or
/// MSISDNs) within the window.
#[derive(Debug, Clone)]
pub struct DuplicateThreshold {
    threshold: u64,
    period: PeriodParams,
    use_msisdn: bool,
}

impl DuplicateThreshold {
    pub fn new(params: DuplicateThresholdParams) -> Result<DuplicateThreshold> {
        params.period.validate("duplicate_threshold")?;
        if params.threshold < 1 {
            return Err(ConfigError(
                "'threshold' parameter must be a positive integer in duplicate_threshold \
                 dimension. Check config..."
                    .to_string(),
            )
            .into());
        }
        Ok(DuplicateThreshold {
            threshold: params.threshold,
            period: params.period,
            use_msisdn: params.use_msisdn,
        })
    }

    pub fn matching_imeis(&self, ctx: &DimensionContext<'_>) -> Result<HashSet<String>> {
        let window = self.period.window(ctx);
        let mut pairs: HashSet<(String, String)> = HashSet::new();
        for record in ctx.country_triplets_in_window(window)? {
            let imei = match &record.imei_norm {
                Some(v) => v,
                None => continue,
            };
            let other = if self.use_msisdn {
                match record.msisdn.as_deref() {
                    Some(v) if is_valid_msisdn(v) => v,
                    _ => continue,
                }
            } else {
                match record.imsi.as_deref() {
                    Some(v) if is_valid_imsi(v) => v,
                    _ => continue,
                }
            };
            pairs.insert((imei.clone(), other.to_string()));
        }

        let mut counts: HashMap<String, u64> = HashMap::new();
        for (imei, _) in pairs {
            *counts.entry(imei).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .filter(|(_, count)| *count >= self.threshold)
            .map(|(imei, _)| imei)
            .collect())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DuplicateDailyAvgParams {
    pub threshold: f64,
    #[serde(flatten)]
    pub period: PeriodParams,
    pub min_seen_days: u32,
    #[serde(default)]
    pub use_msisdn: bool,
}

/// Matches IMEIs whose average daily count of distinct IMSIs (or MSISDNs)
/// over the window is at least `threshold`, provided the IMEI was observed
/// on at least `min_seen_days` days. A pair seen across several operators
/// on one day counts once, via the OR of the date bitmasks.
#[derive(Debug, Clone)]
pub struct DuplicateDailyAvg {
    threshold: f64,
    period: PeriodParams,
    min_seen_days: u32,
    use_msisdn: bool,
}

impl DuplicateDailyAvg {
    pub fn new(params: DuplicateDailyAvgParams) -> Result<DuplicateDailyAvg> {
        params.period.validate("duplicate_daily_avg")?;
        if let Some(days) = params.period.period_days {
            if (params.min_seen_days as i64) > days {
                return Err(ConfigError(
                    "min_seen_days is greater than period_days in duplicate_daily_avg_config"
                        .to_string(),
                )
                .into());
            }
        }
        Ok(DuplicateDailyAvg {
            threshold: params.threshold,
            period: params.period,
            min_seen_days: params.min_seen_days,
            use_msisdn: params.use_msisdn,
        })
    }

    pub fn matching_imeis(&self, ctx: &DimensionContext<'_>) -> Result<HashSet<String>> {
        let window = self.period.window(ctx);

        // (imei, other, year, month) -> OR of windowed date bitmasks
        let mut pair_masks: HashMap<(String, String, i32, u32), u32> = HashMap::new();
        for record in ctx.country_triplets_in_window(window)? {
            let imei = match &record.imei_norm {
                Some(v) => v.clone(),
                None => continue,
            };
            let other = if self.use_msisdn {
                match record.msisdn.as_deref() {
                    Some(v) if is_valid_msisdn(v) => v.to_string(),
                    _ => continue,
                }
            } else {
                match record.imsi.as_deref() {
                    Some(v) if is_valid_imsi(v) => v.to_string(),
                    _ => continue,
                }
            };
            let mask = bitmask_within_window(
                record.date_bitmask,
                record.triplet_year,
                record.triplet_month,
                window.start,
                window.end,
            );
            *pair_masks
                .entry((imei, other, record.triplet_year, record.triplet_month))
                .or_default() |= mask;
        }

        // Roll up to (imei, month): days the IMEI was seen and the sum of
        // per-pair day counts
        let mut monthly: HashMap<(String, i32, u32), (u32, u64)> = HashMap::new();
        for ((imei, _, year, month), mask) in pair_masks {
            let entry = monthly.entry((imei, year, month)).or_insert((0u32, 0u64));
            entry.0 |= mask;
            entry.1 += bitcount(mask) as u64;
        }

        let mut per_imei: HashMap<String, (u64, u64)> = HashMap::new();
        for ((imei, _, _), (seen_mask, pair_days)) in monthly {
            let entry = per_imei.entry(imei).or_insert((0u64, 0u64));
            entry.0 += bitcount(seen_mask) as u64;
            entry.1 += pair_days;
        }

        Ok(per_imei
            .into_iter()
            .filter(|(_, (days_seen, pair_days))| {
                *days_seen >= self.min_seen_days as u64
                    && (*pair_days as f64 / *days_seen as f64) >= self.threshold
            })
            .map(|(imei, _)| imei)
            .collect())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DailyAvgUidParams {
    pub threshold: f64,
    #[serde(flatten)]
    pub period: PeriodParams,
    pub min_seen_days: u32,
}

/// Like the daily average, but counting distinct registered-subscriber
/// UIDs joined through the IMSI instead of raw identifiers.
#[derive(Debug, Clone)]
pub struct DailyAvgUid {
    threshold: f64,
    period: PeriodParams,
    min_seen_days: u32,
}

impl DailyAvgUid {
    pub fn new(params: DailyAvgUidParams) -> Result<DailyAvgUid> {
        params.period.validate("daily_avg_uid")?;
        if let Some(days) = params.period.period_days {
            if (params.min_seen_days as i64) > days {
                return Err(ConfigError(
                    "min_seen_days is greater than period_days in duplicate_daily_uid_config"
                        .to_string(),
                )
                .into());
            }
        }
        Ok(DailyAvgUid {
            threshold: params.threshold,
            period: params.period,
            min_seen_days: params.min_seen_days,
        })
    }

    pub fn matching_imeis(&self, ctx: &DimensionContext<'_>) -> Result<HashSet<String>> {
        let window = self.period.window(ctx);

        let txn = ctx.store.begin_read()?;
        let subscribers: HashMap<String, Vec<SubscriberRecord>> =
            reference::active_entries(&txn, reference::SUBSCRIBERS_TABLE)?;
        drop(txn);

        // (imei, uid) -> OR of windowed bitmasks
        let mut uid_masks: HashMap<(String, String), u32> = HashMap::new();
        for record in ctx.country_triplets_in_window(window)? {
            let imei = match &record.imei_norm {
                Some(v) => v.clone(),
                None => continue,
            };
            let imsi = match record.imsi.as_deref() {
                Some(v) if is_valid_imsi(v) => v,
                _ => continue,
            };
            let uids = match subscribers.get(imsi) {
                Some(v) => v,
                None => continue,
            };
            let mask = bitmask_within_window(
                record.date_bitmask,
                record.triplet_year,
                record.triplet_month,
                window.start,
                window.end,
            );
            for sub in uids {
                *uid_masks.entry((imei.clone(), sub.uid.clone())).or_default() |= mask;
            }
        }

        let mut per_imei: HashMap<String, (u32, u64)> = HashMap::new();
        for ((imei, _), mask) in uid_masks {
            let entry = per_imei.entry(imei).or_insert((0u32, 0u64));
            entry.0 |= mask;
            entry.1 += bitcount(mask) as u64;
        }

        Ok(per_imei
            .into_iter()
            .filter(|(_, (seen_mask, uid_days))| {
                let days_seen = bitcount(*seen_mask) as u64;
                days_seen >= self.min_seen_days as u64
                    && (*uid_days as f64 / days_seen as f64) >= self.threshold
            })
            .map(|(imei, _)| imei)
            .collect())
    }
}
