// Consolidated per-IMEI query resolver: classification state, realtime
// checks, pairings and subscriber history with keyed pagination
use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::classify;
use crate::config::AppConfig;
use crate::error::ValidationError;
use crate::importer::is_unclean_imei;
use crate::partition::{self, IndexMetadatum};
use crate::reference::{
    self, registration_status_is_approved, PairingRecord, RegistrationRecord, StolenRecord,
};
use crate::shard::{calc_virt_imei_shard, normalize_imei};
use crate::store::Store;
use crate::triplets::TripletRecord;

/// Maximum number of IMEIs accepted in one batch query.
pub const MAX_BATCH_IMEIS: usize = 1000;

/// Default page size for pairings/subscribers.
pub const DEFAULT_PAGE_LIMIT: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: u64,
    pub limit: u64,
    pub order: SortOrder,
}

impl Default for Pagination {
    fn default() -> Self {
        Pagination {
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
            order: SortOrder::Asc,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub current_key: u64,
    pub next_key: Option<u64>,
    pub result_size: u64,
    pub results: Vec<T>,
}

fn paginate<T>(mut items: Vec<T>, page: Pagination) -> Paginated<T> {
    let result_size = items.len() as u64;
    let start = page.offset.min(result_size) as usize;
    let end = (page.offset + page.limit).min(result_size) as usize;
    let results: Vec<T> = items.drain(start..end).collect();
    let next_key = if (end as u64) < result_size {
        Some(end as u64)
    } else {
        None
    };
    Paginated {
        current_key: page.offset,
        next_key,
        result_size,
        results,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionResult {
    pub condition_name: String,
    pub condition_met: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationStateResult {
    pub blocking_conditions: Vec<ConditionResult>,
    pub informative_conditions: Vec<ConditionResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeChecks {
    pub ever_observed_on_network: bool,
    pub invalid_imei: bool,
    pub is_paired: bool,
    pub is_exempted_device: bool,
    pub in_registration_list: bool,
    pub gsma_not_found: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub status: Option<String>,
    pub provisional_only: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImeiInfo {
    pub imei_norm: String,
    pub classification_state: ClassificationStateResult,
    pub realtime_checks: RealtimeChecks,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_status: Option<StatusResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stolen_status: Option<StatusResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingInfo {
    pub imsi: String,
    pub msisdn: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub imsi: Option<String>,
    pub msisdn: Option<String>,
    pub last_seen: NaiveDate,
}

/// Validate and normalize a queried IMEI: at most 16 characters from the
/// IMEI alphabet.
pub fn validate_imei(imei: &str) -> Result<String> {
    if imei.is_empty()
        || imei.chars().count() > 16
        || !imei
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '*' || c == '#')
    {
        return Err(ValidationError::MalformedField {
            column: "imei",
            value: imei.to_string(),
            line: 0,
        }
        .into());
    }
    Ok(normalize_imei(imei))
}

/// Resolve the consolidated view of one IMEI.
pub fn resolve_imei(
    store: &Store,
    config: &AppConfig,
    imei: &str,
    include_registration_status: bool,
    include_stolen_status: bool,
) -> Result<ImeiInfo> {
    let imei_norm = validate_imei(imei)?;
    let txn = store.begin_read()?;

    // Classification state from active rows, in sorted condition order
    let active: BTreeSet<String> = classify::active_records_for_imei(store, &imei_norm)?
        .into_iter()
        .map(|r| r.cond_name)
        .collect();
    let mut blocking_conditions = Vec::new();
    let mut informative_conditions = Vec::new();
    let mut sorted_conditions: Vec<(&String, bool)> = config
        .conditions
        .iter()
        .map(|c| (&c.label, c.blocking))
        .collect();
    sorted_conditions.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    for (label, blocking) in sorted_conditions {
        let result = ConditionResult {
            condition_name: label.clone(),
            condition_met: active.contains(label),
        };
        if blocking {
            blocking_conditions.push(result);
        } else {
            informative_conditions.push(result);
        }
    }

    let network_leaf = reference::shard_leaf_for_imei(store, "network_imeis", &imei_norm)?;
    let ever_observed =
        crate::triplets::get_network_imei(&txn, &network_leaf, &imei_norm)?.is_some();

    let registration_rows: Vec<RegistrationRecord> =
        reference::entries_for_key(&txn, reference::REGISTRATION_TABLE, &imei_norm)?;
    let active_registrations: Vec<&RegistrationRecord> = registration_rows
        .iter()
        .filter(|r| r.end_date.is_none())
        .collect();
    let in_registration_list = active_registrations
        .iter()
        .any(|r| registration_status_is_approved(r.status.as_deref()));

    let pairings: Vec<PairingRecord> =
        reference::entries_for_key(&txn, reference::PAIRING_TABLE, &imei_norm)?;
    let is_paired = pairings.iter().any(|p| p.end_date.is_none());

    let gsma_record = if imei_norm.len() >= 8 {
        reference::gsma_record(&txn, &imei_norm[..8])?
    } else {
        None
    };
    let is_exempted_device = gsma_record
        .as_ref()
        .and_then(|r| r.device_type.as_ref())
        .map_or(false, |dt| {
            config.region.exempted_device_types.contains(dt)
        });

    let realtime_checks = RealtimeChecks {
        ever_observed_on_network: ever_observed,
        invalid_imei: is_unclean_imei(&imei_norm),
        is_paired,
        is_exempted_device,
        in_registration_list,
        gsma_not_found: gsma_record.is_none(),
    };

    let registration_status = if include_registration_status {
        Some(StatusResult {
            status: active_registrations
                .first()
                .map(|r| r.status.clone().unwrap_or_else(|| "whitelist".to_string())),
            provisional_only: if active_registrations.is_empty() {
                None
            } else {
                Some(!in_registration_list)
            },
        })
    } else {
        None
    };

    let stolen_status = if include_stolen_status {
        let stolen_rows: Vec<StolenRecord> =
            reference::entries_for_key(&txn, reference::STOLEN_TABLE, &imei_norm)?;
        let active_stolen: Vec<&StolenRecord> =
            stolen_rows.iter().filter(|r| r.end_date.is_none()).collect();
        Some(StatusResult {
            status: active_stolen
                .first()
                .map(|r| r.status.clone().unwrap_or_else(|| "stolen".to_string())),
            provisional_only: if active_stolen.is_empty() {
                None
            } else {
                Some(active_stolen.iter().all(|r| r.status.is_some()))
            },
        })
    } else {
        None
    };

    Ok(ImeiInfo {
        imei_norm,
        classification_state: ClassificationStateResult {
            blocking_conditions,
            informative_conditions,
        },
        realtime_checks,
        registration_status,
        stolen_status,
    })
}

/// Resolve a batch of IMEIs (at most MAX_BATCH_IMEIS).
pub fn resolve_imei_batch(
    store: &Store,
    config: &AppConfig,
    imeis: &[String],
    include_registration_status: bool,
    include_stolen_status: bool,
) -> Result<Vec<ImeiInfo>> {
    if imeis.len() > MAX_BATCH_IMEIS {
        return Err(ValidationError::PrevalidationCheck(format!(
            "Batch query accepts at most {} IMEIs, got {}",
            MAX_BATCH_IMEIS,
            imeis.len()
        ))
        .into());
    }
    imeis
        .iter()
        .map(|imei| {
            resolve_imei(
                store,
                config,
                imei,
                include_registration_status,
                include_stolen_status,
            )
        })
        .collect()
}

/// Active pairings for one IMEI, paginated by IMSI order.
pub fn imei_pairings(
    store: &Store,
    imei: &str,
    page: Pagination,
) -> Result<Paginated<PairingInfo>> {
    let imei_norm = validate_imei(imei)?;
    let txn = store.begin_read()?;
    let rows: Vec<PairingRecord> =
        reference::entries_for_key(&txn, reference::PAIRING_TABLE, &imei_norm)?;
    let mut results: Vec<PairingInfo> = rows
        .into_iter()
        .filter(|p| p.end_date.is_none())
        .map(|p| PairingInfo {
            imsi: p.imsi,
            msisdn: p.msisdn,
        })
        .collect();
    results.sort_by(|a, b| a.imsi.cmp(&b.imsi));
    if page.order == SortOrder::Desc {
        results.reverse();
    }
    Ok(paginate(results, page))
}

/// Triplet observations of an IMEI from the country-level monthly
/// partitions, resolved through the imei_norm index tables.
fn observations_for_imei(store: &Store, imei_norm: &str) -> Result<Vec<TripletRecord>> {
    let txn = store.begin_read()?;
    let virt = calc_virt_imei_shard(Some(imei_norm));
    let idx_meta = IndexMetadatum::new(&["imei_norm"]);
    let mut out = Vec::new();
    for (leaf, meta) in
        partition::family_partitions(store, "monthly_network_triplets_country")?
    {
        if virt < meta.shard_start || virt >= meta.shard_end {
            continue;
        }
        let idx_name = idx_meta.idx_name(&leaf);
        for primary in partition::index_lookup(&txn, &idx_name, imei_norm)? {
            if let Ok(hash) = u64::from_str_radix(&primary, 16) {
                let def = crate::store::u64_table(&leaf);
                if let Ok(table) = txn.open_table(def) {
                    if let Some(guard) = redb::ReadableTable::get(&table, hash)? {
                        let record: TripletRecord = bincode::deserialize(guard.value())?;
                        out.push(record);
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Subscribers seen with an IMEI, paginated.
pub fn imei_subscribers(
    store: &Store,
    imei: &str,
    page: Pagination,
) -> Result<Paginated<SubscriberInfo>> {
    let imei_norm = validate_imei(imei)?;
    let mut seen: HashMap<(Option<String>, Option<String>), NaiveDate> = HashMap::new();
    for record in observations_for_imei(store, &imei_norm)? {
        let key = (record.imsi.clone(), record.msisdn.clone());
        let entry = seen.entry(key).or_insert(record.last_seen);
        *entry = (*entry).max(record.last_seen);
    }
    let mut results: Vec<SubscriberInfo> = seen
        .into_iter()
        .map(|((imsi, msisdn), last_seen)| SubscriberInfo {
            imsi,
            msisdn,
            last_seen,
        })
        .collect();
    results.sort_by(|a, b| a.imsi.cmp(&b.imsi).then_with(|| a.msisdn.cmp(&b.msisdn)));
    if page.order == SortOrder::Desc {
        results.reverse();
    }
    Ok(paginate(results, page))
}

/// Full IMSI/MSISDN association history for an IMEI.
pub fn imei_seen_with(store: &Store, imei: &str) -> Result<Vec<SubscriberInfo>> {
    let imei_norm = validate_imei(imei)?;
    let mut seen: HashMap<(Option<String>, Option<String>), NaiveDate> = HashMap::new();
    for record in observations_for_imei(store, &imei_norm)? {
        let key = (record.imsi.clone(), record.msisdn.clone());
        let entry = seen.entry(key).or_insert(record.last_seen);
        *entry = (*entry).max(record.last_seen);
    }
    let mut results: Vec<SubscriberInfo> = seen
        .into_iter()
        .map(|((imsi, msisdn), last_seen)| SubscriberInfo {
            imsi,
            msisdn,
            last_seen,
        })
        .collect();
    results.sort_by(|a, b| a.imsi.cmp(&b.imsi).then_with(|| a.msisdn.cmp(&b.msisdn)));
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_imei() {
        assert_eq!(validate_imei("3884773337002633").unwrap(), "38847733370026");
        assert_eq!(validate_imei("12345").unwrap(), "12345");
        assert_eq!(validate_imei("abcDEF12*#").unwrap(), "ABCDEF12*#");
        // 17 characters is too long
        assert!(validate_imei("12345678901234567").is_err());
        assert!(validate_imei("").is_err());
        assert!(validate_imei("123-456").is_err());
    }

    #[test]
    fn test_pagination_windows() {
        let items: Vec<u32> = (0..25).collect();
        let page = paginate(
            items.clone(),
            Pagination {
                offset: 0,
                limit: 10,
                order: SortOrder::Asc,
            },
        );
        assert_eq!(page.result_size, 25);
        assert_eq!(page.results.len(), 10);
        assert_eq!(page.current_key, 0);
        assert_eq!(page.next_key, Some(10));

        let page = paginate(
            items.clone(),
            Pagination {
                offset: 20,
                limit: 10,
                order: SortOrder::Asc,
            },
        );
        assert_eq!(page.results.len(), 5);
        assert_eq!(page.next_key, None);

        let page = paginate(
            items,
            Pagination {
                offset: 100,
                limit: 10,
                order: SortOrder::Asc,
            },
        );
        assert!(page.results.is_empty());
        assert_eq!(page.next_key, None);
    }
}
