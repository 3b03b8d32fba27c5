//! Translation of [`FilterObject`] into store queries

use crate::store::Query;
use crate::types::{FilterObject, LevelFilter};

/// Clauses of a filter, to be ANDed with the caller's own constraint
pub fn filter_clauses(filter: &FilterObject) -> Vec<Query> {
    let mut clauses = Vec::new();
    match &filter.level {
        Some(LevelFilter::Range { min, max }) => {
            clauses.push(Query::between("ao_level", *min as f64, *max as f64));
        }
        Some(LevelFilter::Set(levels)) if !levels.is_empty() => {
            clauses.push(Query::terms("ao_level", levels.iter().copied()));
        }
        _ => {}
    }
    if !filter.parent_guids.is_empty() {
        clauses.push(Query::terms("parent_guid", filter.parent_guids.iter().cloned()));
    }
    if !filter.codes.is_empty() {
        clauses.push(Query::terms("code", filter.codes.iter().cloned()));
    }
    clauses
}

/// `constraint AND filter`
pub fn with_filter(constraint: Query, filter: Option<&FilterObject>) -> Query {
    let mut clauses = vec![constraint];
    if let Some(filter) = filter {
        clauses.extend(filter_clauses(filter));
    }
    Query::and(clauses)
}
