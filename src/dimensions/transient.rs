// Dimensions over per-MNO observations: transient IMEIs cycling through
// MSISDNs, and IMEIs used by configured-network subscribers
use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::triplets::{bitcount, bitmask_within_window};

use super::{is_valid_msisdn, AnalysisWindow, DimensionContext};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransientImeiParams {
    pub period: Option<i64>,
    pub num_msisdns: Option<u64>,
}

/// Matches IMEIs averaging at least `num_msisdns` distinct MSISDNs per day
/// over `period` days, where the IMEIs sharing those MSISDNs form an
/// arithmetic progression and all observations belong to one operator.
#[derive(Debug, Clone)]
pub struct TransientImei {
    period: i64,
    num_msisdns: u64,
}

impl TransientImei {
    pub fn new(params: TransientImeiParams) -> Result<TransientImei> {
        let period = params.period.ok_or_else(|| {
            ConfigError(
                "period value can not be NULL in transient imei dimension. Check config..."
                    .to_string(),
            )
        })?;
        let num_msisdns = params.num_msisdns.ok_or_else(|| {
            ConfigError(
                "num_msisdns value can not be NULL in transient imei dimension. Check config..."
                    .to_string(),
            )
        })?;
        if period <= 0 {
            return Err(ConfigError(
                "'period' in transient imei dimension requires positive value. Check config..."
                    .to_string(),
            )
            .into());
        }
        if num_msisdns == 0 {
            return Err(ConfigError(
                "'num_msisdn' parameter in transient imei dimension requires positive value. \
                 Check config..."
                    .to_string(),
            )
            .into());
        }
        Ok(TransientImei {
            period,
            num_msisdns,
        })
    }

    pub fn matching_imeis(&self, ctx: &DimensionContext<'_>) -> Result<HashSet<String>> {
        let window = AnalysisWindow::from_period(ctx.analysis_end_date, Some(self.period), None);

        // Every per-MNO observation in the window, across all shards: the
        // neighbor analysis follows MSISDNs into other IMEIs' shards.
        let all_rows = ctx.mno_triplets_in_window(window, false)?;

        // Per (imei, msisdn, operator) observation-day counts within the
        // candidate shard range
        let mut msisdn_days: HashMap<String, u64> = HashMap::new();
        let mut operators_per_imei: HashMap<String, HashSet<String>> = HashMap::new();
        // MSISDN -> distinct numeric IMEIs seen with it, window-wide
        let mut imeis_per_msisdn: HashMap<String, HashSet<u64>> = HashMap::new();
        // IMEI -> MSISDNs it was seen with
        let mut msisdns_per_imei: HashMap<String, HashSet<String>> = HashMap::new();

        for record in &all_rows {
            let imei = match &record.imei_norm {
                Some(v) => v,
                None => continue,
            };
            let msisdn = match record.msisdn.as_deref() {
                Some(v) if is_valid_msisdn(v) => v,
                _ => continue,
            };
            let mask = bitmask_within_window(
                record.date_bitmask,
                record.triplet_year,
                record.triplet_month,
                window.start,
                window.end,
            );
            if mask == 0 {
                continue;
            }

            if let Ok(numeric) = imei.parse::<u64>() {
                imeis_per_msisdn
                    .entry(msisdn.to_string())
                    .or_default()
                    .insert(numeric);
            }

            if ctx.in_shard_range(record.virt_imei_shard) {
                *msisdn_days.entry(imei.clone()).or_default() += bitcount(mask) as u64;
                msisdns_per_imei
                    .entry(imei.clone())
                    .or_default()
                    .insert(msisdn.to_string());
                if let Some(op) = &record.operator_id {
                    operators_per_imei
                        .entry(imei.clone())
                        .or_default()
                        .insert(op.clone());
                }
            }
        }

        let mut out = HashSet::new();
        for (imei, day_count) in msisdn_days {
            // Average distinct MSISDN-days per day over the period
            if day_count / (self.period as u64) < self.num_msisdns {
                continue;
            }
            // All observations of the IMEI must belong to one operator
            if operators_per_imei.get(&imei).map_or(0, |s| s.len()) != 1 {
                continue;
            }
            // The IMEIs sharing its MSISDNs must form an arithmetic
            // progression when sorted numerically
            let mut neighbors: HashSet<u64> = HashSet::new();
            if let Some(msisdns) = msisdns_per_imei.get(&imei) {
                for msisdn in msisdns {
                    if let Some(imeis) = imeis_per_msisdn.get(msisdn) {
                        neighbors.extend(imeis.iter().copied());
                    }
                }
            }
            let neighbor_list: Vec<u64> = neighbors.into_iter().collect();
            if !is_arithmetic_progression(&neighbor_list) {
                continue;
            }
            out.insert(imei);
        }
        Ok(out)
    }
}

/// All pairwise differences in the sorted list equal the first difference,
/// and the sequence has at least 3 members.
pub fn is_arithmetic_progression(values: &[u64]) -> bool {
    if values.len() < 3 {
        return false;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let step = sorted[1] - sorted[0];
    sorted.windows(2).all(|w| w[1] - w[0] == step)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsedByDirbsSubscriberParams {
    pub lookback_days: Option<i64>,
}

/// Matches IMEIs seen with an IMSI whose prefix matches a configured
/// operator's MCC||MNC within the lookback window.
#[derive(Debug, Clone)]
pub struct UsedByDirbsSubscriber {
    lookback_days: i64,
}

impl UsedByDirbsSubscriber {
    pub fn new(params: UsedByDirbsSubscriberParams) -> Result<UsedByDirbsSubscriber> {
        let lookback_days = params.lookback_days.ok_or_else(|| {
            ConfigError("'lookback_days' parameter must be an integer...".to_string())
        })?;
        Ok(UsedByDirbsSubscriber { lookback_days })
    }

    pub fn matching_imeis(&self, ctx: &DimensionContext<'_>) -> Result<HashSet<String>> {
        let window =
            AnalysisWindow::from_period(ctx.analysis_end_date, Some(self.lookback_days), None);
        let prefixes = ctx.config.region.all_mcc_mnc_prefixes();

        let mut out = HashSet::new();
        for record in ctx.country_triplets_in_window(window)? {
            let imei = match &record.imei_norm {
                Some(v) => v,
                None => continue,
            };
            let imsi = match record.imsi.as_deref() {
                Some(v) => v,
                None => continue,
            };
            if prefixes.iter().any(|p| imsi.starts_with(p.as_str())) {
                out.insert(imei.clone());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic_progression() {
        assert!(is_arithmetic_progression(&[10, 20, 30]));
        assert!(is_arithmetic_progression(&[30, 10, 20]));
        assert!(is_arithmetic_progression(&[5, 5, 5]));
        assert!(!is_arithmetic_progression(&[10, 20]));
        assert!(!is_arithmetic_progression(&[10, 20, 31]));
        assert!(is_arithmetic_progression(&[1, 2, 3, 4, 5]));
        assert!(!is_arithmetic_progression(&[1, 2, 3, 4, 6]));
    }

    #[test]
    fn test_transient_param_validation() {
        assert!(TransientImei::new(TransientImeiParams {
            period: None,
            num_msisdns: Some(4),
        })
        .is_err());
        assert!(TransientImei::new(TransientImeiParams {
            period: Some(0),
            num_msisdns: Some(4),
        })
        .is_err());
        assert!(TransientImei::new(TransientImeiParams {
            period: Some(30),
            num_msisdns: Some(0),
        })
        .is_err());
        assert!(TransientImei::new(TransientImeiParams {
            period: Some(30),
            num_msisdns: Some(4),
        })
        .is_ok());
    }
}
