// List-membership and device-property dimensions: barred list,
// association list, test TACs and RAT consistency
use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::reference::{
    self, AssociationRecord, BarredRecord, ASSOCIATION_BASE, BARRED_BASE,
};
use crate::shard::imei_shard_name;
use crate::triplets::{
    DEVICE_RAT_MASK_2G, DEVICE_RAT_MASK_3G, DEVICE_RAT_MASK_4G, GSMA_RAT_MASK_2G,
    GSMA_RAT_MASK_3G, GSMA_RAT_MASK_4G,
};

use super::DimensionContext;

/// Matches IMEIs with an active entry on the barred list.
#[derive(Debug, Clone)]
pub struct ExistsInBarredList;

impl ExistsInBarredList {
    pub fn matching_imeis(&self, ctx: &DimensionContext<'_>) -> Result<HashSet<String>> {
        let txn = ctx.store.begin_read()?;
        let leaf = imei_shard_name(BARRED_BASE, ctx.range_start, ctx.range_end);
        let active: HashMap<String, Vec<BarredRecord>> = reference::active_entries(&txn, &leaf)?;
        Ok(active.into_keys().collect())
    }
}

/// Matches ever-observed IMEIs with no active device association, with the
/// configured exempted device types filtered out via their GSMA TAC.
#[derive(Debug, Clone)]
pub struct NotOnAssociationList;

impl NotOnAssociationList {
    pub fn matching_imeis(&self, ctx: &DimensionContext<'_>) -> Result<HashSet<String>> {
        let txn = ctx.store.begin_read()?;
        let leaf = imei_shard_name(ASSOCIATION_BASE, ctx.range_start, ctx.range_end);
        let associated: HashMap<String, Vec<AssociationRecord>> =
            reference::active_entries(&txn, &leaf)?;
        drop(txn);

        let mut matching: HashSet<String> = ctx
            .network_imeis()?
            .into_iter()
            .map(|r| r.imei_norm)
            .filter(|imei| !associated.contains_key(imei))
            .collect();

        let exempted = &ctx.config.region.exempted_device_types;
        if !exempted.is_empty() {
            // Keep only IMEIs whose GSMA device type is known and not
            // exempted; unknown TACs drop out of the match set entirely
            matching.retain(|imei| {
                imei.len() >= 8
                    && ctx
                        .gsma
                        .get(&imei[..8])
                        .and_then(|rec| rec.device_type.as_ref())
                        .map_or(false, |dt| !exempted.contains(dt))
            });
        }
        Ok(matching)
    }
}

/// Matches IMEIs observed on a radio access technology generation that the
/// GSMA db says their model is not capable of. The model capability is the
/// OR of rat_bitmask over every TAC with the same (manufacturer, model);
/// TACs with a NULL manufacturer or model are excluded.
#[derive(Debug, Clone)]
pub struct InconsistentRat;

impl InconsistentRat {
    pub fn matching_imeis(&self, ctx: &DimensionContext<'_>) -> Result<HashSet<String>> {
        // Per-model capability mask
        let mut model_masks: HashMap<(&str, &str), u32> = HashMap::new();
        for record in ctx.gsma.values() {
            if let (Some(manufacturer), Some(model)) =
                (record.manufacturer.as_deref(), record.model_name.as_deref())
            {
                *model_masks.entry((manufacturer, model)).or_default() |= record.rat_bitmask;
            }
        }

        let mut out = HashSet::new();
        for record in ctx.network_imeis()? {
            if record.seen_rat_bitmask == 0 || record.imei_norm.len() < 8 {
                continue;
            }
            let gsma_record = match ctx.gsma.get(&record.imei_norm[..8]) {
                Some(r) => r,
                None => continue,
            };
            let model_mask = match (
                gsma_record.manufacturer.as_deref(),
                gsma_record.model_name.as_deref(),
            ) {
                (Some(manufacturer), Some(model)) => model_masks[&(manufacturer, model)],
                _ => continue,
            };

            let device = record.seen_rat_bitmask;
            let mismatch = (device & DEVICE_RAT_MASK_2G > 0 && model_mask & GSMA_RAT_MASK_2G == 0)
                || (device & DEVICE_RAT_MASK_3G > 0 && model_mask & GSMA_RAT_MASK_3G == 0)
                || (device & DEVICE_RAT_MASK_4G > 0 && model_mask & GSMA_RAT_MASK_4G == 0);
            if mismatch {
                out.insert(record.imei_norm);
            }
        }
        Ok(out)
    }
}

/// Matches IMEIs carrying a GSMA test TAC: RBI '00' with reporting-body
/// digits '44', '86', '91', or '10' followed by a two-digit value 1-17.
#[derive(Debug, Clone)]
pub struct IsTestTac;

impl IsTestTac {
    pub fn is_test_tac(imei_norm: &str) -> bool {
        if imei_norm.len() < 8 || !imei_norm[..8].chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        if &imei_norm[..2] != "00" {
            return false;
        }
        let body = &imei_norm[2..4];
        if body == "10" {
            imei_norm[4..6]
                .parse::<u32>()
                .map_or(false, |v| (1..=17).contains(&v))
        } else {
            matches!(body, "44" | "86" | "91")
        }
    }

    pub fn matching_imeis(&self, ctx: &DimensionContext<'_>) -> Result<HashSet<String>> {
        Ok(ctx
            .network_imeis()?
            .into_iter()
            .map(|r| r.imei_norm)
            .filter(|imei| Self::is_test_tac(imei))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_test_tac() {
        // '00' + '44'/'86'/'91'
        assert!(IsTestTac::is_test_tac("00441234567890"));
        assert!(IsTestTac::is_test_tac("00861234567890"));
        assert!(IsTestTac::is_test_tac("00911234567890"));
        // '00' + '10' + 01..17
        assert!(IsTestTac::is_test_tac("00100112345678"));
        assert!(IsTestTac::is_test_tac("00101712345678"));
        assert!(!IsTestTac::is_test_tac("00101812345678"));
        assert!(!IsTestTac::is_test_tac("00100012345678"));
        // Wrong RBI or non-digit TAC
        assert!(!IsTestTac::is_test_tac("01441234567890"));
        assert!(!IsTestTac::is_test_tac("00451234567890"));
        assert!(!IsTestTac::is_test_tac("0044A234567890"));
    }
}
