//! Enrichment of one address object from its resolved parent

use crate::types::{AddressObject, Tier, TierInfo};
use crate::util::join_nonempty;

/// Level whose parent string loses its leading segment
const CITY_LEVEL: u32 = 4;

/// Tiers inherited unchanged from the parent
const INHERITED_TIERS: [Tier; 4] = [Tier::Region, Tier::Area, Tier::City, Tier::Settlement];

/// "<short name> <formal name>"
pub fn own_full_name(record: &AddressObject) -> String {
    format!("{} {}", record.short_name, record.formal_name)
        .trim()
        .to_string()
}

/// Lowercase "<formal name> <short name>"
pub fn own_suggest(record: &AddressObject) -> String {
    format!("{} {}", record.formal_name, record.short_name)
        .trim()
        .to_lowercase()
}

/// Drop everything up to and including the first ", "
fn strip_leading_segment(full: &str) -> &str {
    match full.split_once(", ") {
        Some((_, rest)) => rest,
        None => "",
    }
}

/// Recompute the denormalized fields of `record`.
///
/// `parent` must already be denormalized. Without a parent the record only
/// carries its own name. Previously computed hierarchy fields are discarded.
pub fn denormalize(record: &mut AddressObject, parent: Option<&AddressObject>) {
    let full_name = own_full_name(record);
    let suggest = own_suggest(record);

    record.hierarchy = Default::default();
    let (parent_full, parent_suggest) = match parent {
        Some(parent) => {
            for tier in INHERITED_TIERS {
                let inherited = parent.hierarchy.tier(tier);
                if !inherited.is_empty() {
                    *record.hierarchy.tier_mut(tier) = inherited.clone();
                }
            }
            if record.ao_level == CITY_LEVEL {
                (
                    strip_leading_segment(&parent.full_address),
                    strip_leading_segment(&parent.address_suggest),
                )
            } else {
                (parent.full_address.as_str(), parent.address_suggest.as_str())
            }
        }
        None => ("", ""),
    };

    record.full_address = join_nonempty([parent_full, full_name.as_str()]);
    record.address_suggest = join_nonempty([parent_suggest, suggest.as_str()]);

    if let Some(tier) = Tier::for_level(record.ao_level) {
        let parent_tier_full = parent
            .map(|p| p.hierarchy.tier(tier).full.as_str())
            .unwrap_or("");
        let own = TierInfo {
            guid: record.ao_guid.clone(),
            code: record.tier_code(tier).to_string(),
            name: record.formal_name.clone(),
            kind: record.short_name.clone(),
            full: join_nonempty([parent_tier_full, full_name.as_str()]),
        };
        *record.hierarchy.tier_mut(tier) = own;
    }

    record.full_name = full_name;
}
