//! Core types and traits for decoding dump records

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{BulkFailure, Collection, StoreError};
use crate::types::{AddressObject, HouseObject};

/// Setter applying one decoded attribute value to a record
pub type AttributeSetter<T> = fn(&mut T, String);

/// A record decoded from the attributes of one XML element
pub trait XmlRecord: Default + Send + 'static {
    /// Element tag carrying one record
    const TAG: &'static str;

    /// Fixed upstream attribute name table
    fn attributes() -> &'static [(&'static str, AttributeSetter<Self>)];

    /// Identifier attribute that must be present for the element to be usable
    fn key(&self) -> &str;

    /// Apply one attribute; unknown attributes are ignored
    fn set_attribute(&mut self, name: &str, value: String) {
        if let Some((_, set)) = Self::attributes().iter().find(|(attr, _)| *attr == name) {
            set(self, value);
        }
    }
}

fn number<T: std::str::FromStr + Default>(value: &str) -> T {
    value.trim().parse().unwrap_or_default()
}

static ADDRESS_ATTRIBUTES: &[(&str, AttributeSetter<AddressObject>)] = &[
    ("AOID", |r, v| r.ao_id = v),
    ("AOGUID", |r, v| r.ao_guid = v),
    ("PARENTGUID", |r, v| r.parent_guid = v),
    ("FORMALNAME", |r, v| r.formal_name = v),
    ("OFFNAME", |r, v| r.off_name = v),
    ("SHORTNAME", |r, v| r.short_name = v),
    ("AOLEVEL", |r, v| r.ao_level = number(&v)),
    ("ACTSTATUS", |r, v| r.act_status = number(&v)),
    ("LIVESTATUS", |r, v| r.live_status = number(&v)),
    ("CURRSTATUS", |r, v| r.curr_status = number(&v)),
    ("OPERSTATUS", |r, v| r.oper_status = number(&v)),
    ("CENTSTATUS", |r, v| r.center_status = number(&v)),
    ("REGIONCODE", |r, v| r.region_code = v),
    ("AREACODE", |r, v| r.area_code = v),
    ("CITYCODE", |r, v| r.city_code = v),
    ("PLACECODE", |r, v| r.place_code = v),
    ("STREETCODE", |r, v| r.street_code = v),
    ("CODE", |r, v| r.code = v),
    ("PLAINCODE", |r, v| r.plain_code = v),
    ("POSTALCODE", |r, v| r.postal_code = v),
    ("OKATO", |r, v| r.okato = v),
    ("OKTMO", |r, v| r.oktmo = v),
    ("IFNSFL", |r, v| r.ifns_fl = v),
    ("IFNSUL", |r, v| r.ifns_ul = v),
    ("STARTDATE", |r, v| r.start_date = v),
    ("ENDDATE", |r, v| r.end_date = v),
    ("UPDATEDATE", |r, v| r.update_date = v),
    ("NEXTID", |r, v| r.next_id = v),
    ("PREVID", |r, v| r.prev_id = v),
];

static HOUSE_ATTRIBUTES: &[(&str, AttributeSetter<HouseObject>)] = &[
    ("HOUSEID", |r, v| r.house_id = v),
    ("HOUSEGUID", |r, v| r.house_guid = v),
    ("AOGUID", |r, v| r.ao_guid = v),
    ("HOUSENUM", |r, v| r.house_num = v),
    ("BUILDNUM", |r, v| r.build_num = v),
    ("STRUCNUM", |r, v| r.struc_num = v),
    ("STRSTATUS", |r, v| r.str_status = v),
    ("ESTSTATUS", |r, v| r.est_status = v),
    ("POSTALCODE", |r, v| r.postal_code = v),
    ("OKATO", |r, v| r.okato = v),
    ("OKTMO", |r, v| r.oktmo = v),
    ("IFNSFL", |r, v| r.ifns_fl = v),
    ("IFNSUL", |r, v| r.ifns_ul = v),
    ("CADNUM", |r, v| r.cad_num = v),
    ("DIVTYPE", |r, v| r.div_type = v),
    ("STARTDATE", |r, v| r.start_date = v),
    ("ENDDATE", |r, v| r.end_date = v),
    ("UPDATEDATE", |r, v| r.update_date = v),
];

impl XmlRecord for AddressObject {
    const TAG: &'static str = "Object";

    fn attributes() -> &'static [(&'static str, AttributeSetter<Self>)] {
        ADDRESS_ATTRIBUTES
    }

    fn key(&self) -> &str {
        &self.ao_guid
    }
}

impl XmlRecord for HouseObject {
    const TAG: &'static str = "House";

    fn attributes() -> &'static [(&'static str, AttributeSetter<Self>)] {
        HOUSE_ATTRIBUTES
    }

    fn key(&self) -> &str {
        &self.house_guid
    }
}

/// Counters for one streamed file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    /// Records decoded and handed to the writer
    pub records: u64,
    /// Elements skipped because they could not be decoded
    pub skipped: u64,
}

impl IngestStats {
    pub fn merge(&mut self, other: &IngestStats) {
        self.records += other.records;
        self.skipped += other.skipped;
    }
}

/// Errors that can occur during import
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Store error: {0}")]
    Backend(#[from] StoreError),

    #[error("Bulk commit to {collection} failed for {} document(s)", .failures.len())]
    BulkCommit {
        collection: Collection,
        failures: Vec<BulkFailure>,
    },

    #[error("Version catalog error: {0}")]
    VersionCatalog(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Pipeline channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl From<quick_xml::Error> for ImportError {
    fn from(e: quick_xml::Error) -> Self {
        ImportError::XmlParse(e.to_string())
    }
}

impl From<reqwest::Error> for ImportError {
    fn from(e: reqwest::Error) -> Self {
        ImportError::VersionCatalog(e.to_string())
    }
}
