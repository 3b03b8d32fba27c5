//! Core record types for the address registry

use chrono::{NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::store::Collection;

/// Stable address-object identifier (AOGUID)
pub type AoGuid = String;

/// Stable house identifier (HOUSEGUID)
pub type HouseGuid = String;

/// Upstream date format used by every date attribute of the dump
pub const FIAS_DATE_FORMAT: &str = "%Y-%m-%d";

/// Address object level of a street; the deepest level that gets denormalized
pub const STREET_LEVEL: u32 = 7;

/// Current milliseconds since the epoch, the unit of `bazis_update_date`
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// Document trait
// ============================================================================

/// A record that can be persisted by the batch writer.
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection the record lives in
    const COLLECTION: Collection;

    /// Store id of the record
    fn doc_id(&self) -> &str;

    /// Upstream row id. One GUID has several rows over its history.
    fn row_id(&self) -> &str;

    /// Whether the record should be kept in the index (upsert) or removed (delete)
    fn is_active(&self) -> bool;

    /// Carry fields computed by earlier cycles from the stored copy into an
    /// incoming raw record. Only empty fields are filled.
    fn merge_stored(&mut self, stored: &Self);

    /// Record the time the record was written
    fn stamp(&mut self, now_ms: i64);

    /// GUID of the owning address object, if the record has one
    fn owner_guid(&self) -> Option<&str> {
        None
    }
}

// ============================================================================
// Hierarchy
// ============================================================================

/// Administrative tier an address level belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Region,
    Area,
    City,
    Settlement,
    Street,
}

impl Tier {
    /// Map a numeric address level onto its tier
    pub fn for_level(level: u32) -> Option<Self> {
        match level {
            1 | 2 => Some(Tier::Region),
            3 => Some(Tier::Area),
            4 => Some(Tier::City),
            5 | 6 => Some(Tier::Settlement),
            7 => Some(Tier::Street),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Region => "region",
            Tier::Area => "area",
            Tier::City => "city",
            Tier::Settlement => "settlement",
            Tier::Street => "street",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one administrative tier copied onto descendants
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierInfo {
    pub guid: String,
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub full: String,
}

impl TierInfo {
    pub fn is_empty(&self) -> bool {
        self.guid.is_empty() && self.name.is_empty() && self.full.is_empty()
    }
}

/// Denormalized ancestor attributes, populated only by the indexer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressHierarchy {
    pub region: TierInfo,
    pub area: TierInfo,
    pub city: TierInfo,
    pub settlement: TierInfo,
    pub street: TierInfo,
}

impl AddressHierarchy {
    pub fn tier(&self, tier: Tier) -> &TierInfo {
        match tier {
            Tier::Region => &self.region,
            Tier::Area => &self.area,
            Tier::City => &self.city,
            Tier::Settlement => &self.settlement,
            Tier::Street => &self.street,
        }
    }

    pub fn tier_mut(&mut self, tier: Tier) -> &mut TierInfo {
        match tier {
            Tier::Region => &mut self.region,
            Tier::Area => &mut self.area,
            Tier::City => &mut self.city,
            Tier::Settlement => &mut self.settlement,
            Tier::Street => &mut self.street,
        }
    }

    pub fn is_empty(&self) -> bool {
        ALL_TIERS.iter().all(|t| self.tier(*t).is_empty())
    }
}

/// Tiers in ascending depth
pub const ALL_TIERS: [Tier; 5] = [
    Tier::Region,
    Tier::Area,
    Tier::City,
    Tier::Settlement,
    Tier::Street,
];

/// Geographic coordinate (WGS84)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

// ============================================================================
// Address object
// ============================================================================

/// An administrative unit, from region down to street
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressObject {
    pub ao_id: String,
    pub ao_guid: AoGuid,
    pub parent_guid: AoGuid,
    pub formal_name: String,
    pub off_name: String,
    pub short_name: String,
    pub ao_level: u32,
    pub act_status: i32,
    pub live_status: i32,
    pub curr_status: i32,
    pub oper_status: i32,
    pub center_status: i32,
    pub region_code: String,
    pub area_code: String,
    pub city_code: String,
    pub place_code: String,
    pub street_code: String,
    pub code: String,
    pub plain_code: String,
    pub postal_code: String,
    pub okato: String,
    pub oktmo: String,
    pub ifns_fl: String,
    pub ifns_ul: String,
    pub start_date: String,
    pub end_date: String,
    pub update_date: String,
    pub next_id: String,
    pub prev_id: String,
    pub location: Option<GeoPoint>,

    /// "<short name> <formal name>" of this object alone
    pub full_name: String,
    pub full_address: String,
    pub address_suggest: String,
    #[serde(flatten)]
    pub hierarchy: AddressHierarchy,
    /// Milliseconds timestamp of the last write, drives incremental reindexing
    pub bazis_update_date: i64,
}

impl AddressObject {
    /// `curr_status == 0 && act_status == 1 && live_status == 1`
    pub fn is_active(&self) -> bool {
        is_active_status(self.curr_status, self.act_status, self.live_status)
    }

    /// Registry code of the tier this object belongs to
    pub fn tier_code(&self, tier: Tier) -> &str {
        match tier {
            Tier::Region => &self.region_code,
            Tier::Area => &self.area_code,
            Tier::City => &self.city_code,
            Tier::Settlement => &self.place_code,
            Tier::Street => &self.street_code,
        }
    }
}

/// Lifecycle predicate shared by every status-carrying record
pub fn is_active_status(curr_status: i32, act_status: i32, live_status: i32) -> bool {
    curr_status == 0 && act_status == 1 && live_status == 1
}

impl Document for AddressObject {
    const COLLECTION: Collection = Collection::Addresses;

    fn doc_id(&self) -> &str {
        &self.ao_guid
    }

    fn row_id(&self) -> &str {
        &self.ao_id
    }

    fn is_active(&self) -> bool {
        AddressObject::is_active(self)
    }

    fn merge_stored(&mut self, stored: &Self) {
        if self.full_name.is_empty() {
            self.full_name = stored.full_name.clone();
        }
        if self.full_address.is_empty() {
            self.full_address = stored.full_address.clone();
        }
        if self.address_suggest.is_empty() {
            self.address_suggest = stored.address_suggest.clone();
        }
        for tier in ALL_TIERS {
            if self.hierarchy.tier(tier).is_empty() {
                *self.hierarchy.tier_mut(tier) = stored.hierarchy.tier(tier).clone();
            }
        }
        if self.location.is_none() {
            self.location = stored.location;
        }
    }

    fn stamp(&mut self, now_ms: i64) {
        self.bazis_update_date = now_ms;
    }
}

// ============================================================================
// House object
// ============================================================================

/// A building owned by one address object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HouseObject {
    pub house_id: String,
    pub house_guid: HouseGuid,
    pub ao_guid: AoGuid,
    pub house_num: String,
    pub build_num: String,
    pub struc_num: String,
    pub str_status: String,
    pub est_status: String,
    pub postal_code: String,
    pub okato: String,
    pub oktmo: String,
    pub ifns_fl: String,
    pub ifns_ul: String,
    pub cad_num: String,
    pub div_type: String,
    pub start_date: String,
    pub end_date: String,
    pub update_date: String,

    /// Street full address plus the house designation, set by the house stage
    pub full_address: String,
    pub address_suggest: String,
    pub bazis_update_date: i64,
}

impl HouseObject {
    /// A house is current while its validity window has not ended
    pub fn is_active_on(&self, today: NaiveDate) -> bool {
        if self.end_date.is_empty() {
            return true;
        }
        match NaiveDate::parse_from_str(&self.end_date, FIAS_DATE_FORMAT) {
            Ok(end) => end >= today,
            Err(_) => true,
        }
    }

    /// "д 5 корп 1 стр 2", skipping empty parts
    pub fn designation(&self) -> String {
        let mut parts = Vec::with_capacity(3);
        if !self.house_num.is_empty() {
            parts.push(format!("д {}", self.house_num));
        }
        if !self.build_num.is_empty() {
            parts.push(format!("корп {}", self.build_num));
        }
        if !self.struc_num.is_empty() {
            parts.push(format!("стр {}", self.struc_num));
        }
        parts.join(" ")
    }
}

impl Document for HouseObject {
    const COLLECTION: Collection = Collection::Houses;

    fn doc_id(&self) -> &str {
        &self.house_guid
    }

    fn row_id(&self) -> &str {
        &self.house_id
    }

    fn is_active(&self) -> bool {
        self.is_active_on(Utc::now().date_naive())
    }

    fn merge_stored(&mut self, stored: &Self) {
        if self.full_address.is_empty() {
            self.full_address = stored.full_address.clone();
        }
        if self.address_suggest.is_empty() {
            self.address_suggest = stored.address_suggest.clone();
        }
    }

    fn stamp(&mut self, now_ms: i64) {
        self.bazis_update_date = now_ms;
    }

    fn owner_guid(&self) -> Option<&str> {
        if self.ao_guid.is_empty() {
            None
        } else {
            Some(&self.ao_guid)
        }
    }
}

// ============================================================================
// Version
// ============================================================================

/// Bookkeeping row written once per successful import cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version_id: u32,
    pub text_version: String,
    /// Upstream publication date of the version
    #[serde(default)]
    pub update_date: String,
    #[serde(default)]
    pub address_count: u64,
    #[serde(default)]
    pub house_count: u64,
    /// Milliseconds timestamp of when the row was written
    #[serde(default)]
    pub created_at: i64,
}

impl Version {
    /// Store id; zero padded so that id order matches version order
    pub fn doc_id(&self) -> String {
        Self::id_for(self.version_id)
    }

    pub fn id_for(version_id: u32) -> String {
        format!("{:010}", version_id)
    }
}

// ============================================================================
// Handoff and query types
// ============================================================================

/// Street handed from the address indexer to the house stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexObject {
    pub ao_guid: AoGuid,
    pub full_address: String,
    pub address_suggest: String,
}

/// Level constraint of a [`FilterObject`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelFilter {
    /// Inclusive range of levels
    Range { min: u32, max: u32 },
    /// Explicit set of levels
    Set(Vec<u32>),
}

/// Composite filter accepted by the query façade
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterObject {
    pub level: Option<LevelFilter>,
    pub parent_guids: Vec<AoGuid>,
    pub codes: Vec<String>,
}

impl FilterObject {
    pub fn is_empty(&self) -> bool {
        self.level.is_none() && self.parent_guids.is_empty() && self.codes.is_empty()
    }
}
