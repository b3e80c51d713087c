// Dimension matching IMEIs whose TAC is absent from the GSMA reference,
// subject to per-RBI allocation delays
use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::Duration;
use serde::Deserialize;

use crate::error::ConfigError;

use super::DimensionContext;

/// Default RBI delays based on GSMA db allocation-appearance lag analysis.
const DEFAULT_RBI_DELAYS: &[(&str, i64)] = &[
    ("00", 32),
    ("01", 40),
    ("35", 20),
    ("86", 19),
    ("91", 20),
    ("99", 69),
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GsmaNotFoundParams {
    #[serde(default)]
    pub per_rbi_delays: Option<HashMap<String, i64>>,
    #[serde(default)]
    pub ignore_rbi_delays: bool,
}

#[derive(Debug, Clone)]
pub struct GsmaNotFound {
    final_rbi_delays: HashMap<String, i64>,
}

impl GsmaNotFound {
    pub fn new(params: GsmaNotFoundParams) -> Result<GsmaNotFound> {
        if params.ignore_rbi_delays && params.per_rbi_delays.is_some() {
            return Err(ConfigError(
                "'ignore_rbi_delays' parameter cannot be set to True when 'per_rbi_delays' \
                 parameter is also defined!"
                    .to_string(),
            )
            .into());
        }
        let overrides = params.per_rbi_delays.unwrap_or_default();
        for key in overrides.keys() {
            if key.len() != 2 || !key.chars().all(|c| c.is_ascii_digit()) {
                return Err(ConfigError(
                    "Invalid entry in 'per_rbi_delays' parameter. RBI value must be a 2-digit \
                     string."
                        .to_string(),
                )
                .into());
            }
        }
        for value in overrides.values() {
            if *value < 0 {
                return Err(ConfigError(
                    "Invalid entry in 'per_rbi_delays' parameter. RBI delay value must be a \
                     non-negative integer."
                        .to_string(),
                )
                .into());
            }
        }

        let final_rbi_delays = if params.ignore_rbi_delays {
            HashMap::new()
        } else {
            let mut delays: HashMap<String, i64> = DEFAULT_RBI_DELAYS
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect();
            delays.extend(overrides);
            delays
        };
        Ok(GsmaNotFound { final_rbi_delays })
    }

    pub fn rbi_delay(&self, rbi: &str) -> i64 {
        self.final_rbi_delays.get(rbi).copied().unwrap_or(0)
    }

    /// An IMEI matches when its TAC is absent from the GSMA db and it first
    /// appeared on the network longer ago than its RBI's allocation delay:
    /// even granting the lag, the TAC should have been allocated by now.
    /// The delay applies per IMEI rather than per TAC, since someone may
    /// have squatted on an unallocated TAC in the past.
    pub fn matching_imeis(&self, ctx: &DimensionContext<'_>) -> Result<HashSet<String>> {
        let mut out = HashSet::new();
        for record in ctx.network_imeis()? {
            let imei = &record.imei_norm;
            if imei.len() < 8 {
                continue;
            }
            let tac = &imei[..8];
            if ctx.gsma.contains_key(tac) {
                continue;
            }
            let rbi = &imei[..2];
            let delay = self.rbi_delay(rbi);
            if record.first_seen + Duration::days(delay) < ctx.analysis_end_date {
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
    fn test_default_delays() {
        let dim = GsmaNotFound::new(GsmaNotFoundParams::default()).unwrap();
        assert_eq!(dim.rbi_delay("01"), 40);
        assert_eq!(dim.rbi_delay("99"), 69);
        assert_eq!(dim.rbi_delay("77"), 0);
    }

    #[test]
    fn test_override_merges_over_defaults() {
        let mut overrides = HashMap::new();
        overrides.insert("01".to_string(), 10);
        overrides.insert("77".to_string(), 5);
        let dim = GsmaNotFound::new(GsmaNotFoundParams {
            per_rbi_delays: Some(overrides),
            ignore_rbi_delays: false,
        })
        .unwrap();
        assert_eq!(dim.rbi_delay("01"), 10);
        assert_eq!(dim.rbi_delay("77"), 5);
        assert_eq!(dim.rbi_delay("00"), 32);
    }

    #[test]
    fn test_ignore_delays_conflicts_with_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("01".to_string(), 10);
        assert!(GsmaNotFound::new(GsmaNotFoundParams {
            per_rbi_delays: Some(overrides),
            ignore_rbi_delays: true,
        })
        .is_err());
    }

    #[test]
    fn test_invalid_rbi_keys_and_values() {
        let mut bad_key = HashMap::new();
        bad_key.insert("1".to_string(), 10);
        assert!(GsmaNotFound::new(GsmaNotFoundParams {
            per_rbi_delays: Some(bad_key),
            ignore_rbi_delays: false,
        })
        .is_err());

        let mut bad_value = HashMap::new();
        bad_value.insert("01".to_string(), -3);
        assert!(GsmaNotFound::new(GsmaNotFoundParams {
            per_rbi_delays: Some(bad_value),
            ignore_rbi_delays: false,
        })
        .is_err());
    }

    #[test]
    fn test_ignore_delays_empties_map() {
        let dim = GsmaNotFound::new(GsmaNotFoundParams {
            per_rbi_delays: None,
            ignore_rbi_delays: true,
        })
        .unwrap();
        assert_eq!(dim.rbi_delay("01"), 0);
    }
}
