//! Address Query Façade
//!
//! Read-only lookups against the denormalized index. Backend failures are
//! logged and reported as "no result"; callers never see store errors.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::filter::with_filter;
use crate::store::{Collection, DocumentStore, Query, SearchRequest, Sort};
use crate::types::{AddressObject, FilterObject, GeoPoint, HouseObject, STREET_LEVEL};

/// Largest page a search returns
pub const MAX_PAGE_SIZE: usize = 100;

/// Short name marking a city
const CITY_SHORT_NAME: &str = "г";

/// Query façade over the address and house collections
#[derive(Clone)]
pub struct AddressQuery {
    store: Arc<dyn DocumentStore>,
}

impl AddressQuery {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn get_by_guid(&self, guid: &str) -> Option<AddressObject> {
        self.fetch(Collection::Addresses, guid)
    }

    /// Objects with exactly this formal name
    pub fn get_by_formal_name(&self, name: &str, filter: Option<&FilterObject>) -> Vec<AddressObject> {
        let query = with_filter(Query::term("formal_name", name), filter);
        self.find(
            Collection::Addresses,
            SearchRequest::new(query)
                .with_sort(level_order())
                .with_page(0, MAX_PAGE_SIZE),
        )
    }

    /// Cities at the region or city level, by name
    pub fn get_cities(&self, from: usize, size: usize) -> Vec<AddressObject> {
        self.find(
            Collection::Addresses,
            SearchRequest::new(cities())
                .with_sort(Sort::Field {
                    field: "formal_name".to_string(),
                    ascending: true,
                })
                .with_page(from, clamp(size)),
        )
    }

    /// Free-text search over the suggest string, shallow levels first
    pub fn search(
        &self,
        term: &str,
        filter: Option<&FilterObject>,
        from: usize,
        size: usize,
    ) -> Vec<AddressObject> {
        if term.trim().is_empty() {
            debug!("Empty search term");
            return Vec::new();
        }
        let query = with_filter(Query::matches_text("address_suggest", term), filter);
        self.find(
            Collection::Addresses,
            SearchRequest::new(query)
                .with_sort(level_order())
                .with_page(from, clamp(size)),
        )
    }

    pub fn search_by_postal_code(&self, postal_code: &str, from: usize, size: usize) -> Vec<AddressObject> {
        self.find(
            Collection::Addresses,
            SearchRequest::new(Query::term("postal_code", postal_code))
                .with_sort(level_order())
                .with_page(from, clamp(size)),
        )
    }

    /// Closest city with a known location
    pub fn nearest_city(&self, point: GeoPoint) -> Option<AddressObject> {
        let query = Query::and(vec![cities(), Query::exists("location")]);
        self.nearest(query, point)
    }

    /// Closest street with a known location
    pub fn nearest_address(&self, point: GeoPoint) -> Option<AddressObject> {
        let query = Query::and(vec![
            Query::term("ao_level", STREET_LEVEL),
            Query::exists("location"),
        ]);
        self.nearest(query, point)
    }

    /// Houses of one street, ordered by house number
    pub fn get_houses(&self, street_guid: &str, from: usize, size: usize) -> Vec<HouseObject> {
        let owned = match self.store.owned_by(Collection::Houses, street_guid) {
            Ok(docs) => docs,
            Err(e) => {
                error!("Lookup of houses of {} failed: {}", street_guid, e);
                return Vec::new();
            }
        };
        SearchRequest::new(Query::MatchAll)
            .with_sort(Sort::Field {
                field: "house_num".to_string(),
                ascending: true,
            })
            .with_page(from, clamp(size))
            .apply(owned)
            .into_iter()
            .filter_map(|doc| decode(Collection::Houses, doc))
            .collect()
    }

    pub fn get_house(&self, house_guid: &str) -> Option<HouseObject> {
        self.fetch(Collection::Houses, house_guid)
    }

    fn nearest(&self, query: Query, point: GeoPoint) -> Option<AddressObject> {
        let request = SearchRequest::new(query)
            .with_sort(Sort::GeoDistance {
                field: "location".to_string(),
                origin: point,
            })
            .with_page(0, 1);
        self.find(Collection::Addresses, request).into_iter().next()
    }

    fn fetch<T: DeserializeOwned>(&self, collection: Collection, id: &str) -> Option<T> {
        match self.store.get(collection, id) {
            Ok(doc) => doc.and_then(|doc| decode(collection, doc)),
            Err(e) => {
                error!("Lookup of {} {} failed: {}", collection, id, e);
                None
            }
        }
    }

    fn find<T: DeserializeOwned>(&self, collection: Collection, request: SearchRequest) -> Vec<T> {
        match self.store.search(collection, &request) {
            Ok(docs) => docs.into_iter().filter_map(|doc| decode(collection, doc)).collect(),
            Err(e) => {
                error!("Search in {} failed: {}", collection, e);
                Vec::new()
            }
        }
    }
}

fn decode<T: DeserializeOwned>(collection: Collection, doc: Value) -> Option<T> {
    match serde_json::from_value(doc) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Skipping undecodable {} document: {}", collection, e);
            None
        }
    }
}

fn cities() -> Query {
    Query::and(vec![
        Query::terms("ao_level", [1u32, 4]),
        Query::term("short_name", CITY_SHORT_NAME),
    ])
}

fn level_order() -> Sort {
    Sort::Field {
        field: "ao_level".to_string(),
        ascending: true,
    }
}

fn clamp(size: usize) -> usize {
    size.clamp(1, MAX_PAGE_SIZE)
}
