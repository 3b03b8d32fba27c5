//! Query DSL evaluated against stored JSON documents

use serde_json::Value;
use std::cmp::Ordering;

use crate::types::GeoPoint;
use crate::util::haversine_km;

/// Filter over JSON documents. Field names may address nested objects with
/// dots, e.g. `region.guid`.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    MatchAll,
    /// Exact value equality
    Term { field: String, value: Value },
    /// Equality with any of the values
    Terms { field: String, values: Vec<Value> },
    /// Numeric bounds; unset bounds are open
    Range {
        field: String,
        gt: Option<f64>,
        gte: Option<f64>,
        lt: Option<f64>,
        lte: Option<f64>,
    },
    /// Every token of `text` is a prefix of some token of the field
    Match { field: String, text: String },
    /// String field starts with the prefix
    Prefix { field: String, prefix: String },
    /// Field is present and not null or empty
    Exists { field: String },
    /// Point field within `max_km` of the origin
    GeoDistance {
        field: String,
        origin: GeoPoint,
        max_km: f64,
    },
    Bool { must: Vec<Query>, must_not: Vec<Query> },
}

impl Query {
    pub fn term(field: &str, value: impl Into<Value>) -> Self {
        Query::Term {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn terms<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Query::Terms {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn gt(field: &str, value: f64) -> Self {
        Query::Range {
            field: field.to_string(),
            gt: Some(value),
            gte: None,
            lt: None,
            lte: None,
        }
    }

    pub fn gte(field: &str, value: f64) -> Self {
        Query::Range {
            field: field.to_string(),
            gt: None,
            gte: Some(value),
            lt: None,
            lte: None,
        }
    }

    /// Inclusive range
    pub fn between(field: &str, min: f64, max: f64) -> Self {
        Query::Range {
            field: field.to_string(),
            gt: None,
            gte: Some(min),
            lt: None,
            lte: Some(max),
        }
    }

    pub fn matches_text(field: &str, text: &str) -> Self {
        Query::Match {
            field: field.to_string(),
            text: text.to_string(),
        }
    }

    pub fn prefix(field: &str, prefix: &str) -> Self {
        Query::Prefix {
            field: field.to_string(),
            prefix: prefix.to_string(),
        }
    }

    pub fn exists(field: &str) -> Self {
        Query::Exists {
            field: field.to_string(),
        }
    }

    /// Conjunction; collapses trivial cases
    pub fn and(mut queries: Vec<Query>) -> Self {
        queries.retain(|q| *q != Query::MatchAll);
        match queries.len() {
            0 => Query::MatchAll,
            1 => queries.remove(0),
            _ => Query::Bool {
                must: queries,
                must_not: Vec::new(),
            },
        }
    }

    pub fn not(query: Query) -> Self {
        Query::Bool {
            must: Vec::new(),
            must_not: vec![query],
        }
    }

    /// Evaluate the query against one document
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Query::MatchAll => true,
            Query::Term { field, value } => {
                lookup(doc, field).is_some_and(|v| values_equal(v, value))
            }
            Query::Terms { field, values } => lookup(doc, field)
                .is_some_and(|v| values.iter().any(|candidate| values_equal(v, candidate))),
            Query::Range {
                field,
                gt,
                gte,
                lt,
                lte,
            } => {
                let Some(n) = lookup(doc, field).and_then(as_number) else {
                    return false;
                };
                gt.is_none_or(|b| n > b)
                    && gte.is_none_or(|b| n >= b)
                    && lt.is_none_or(|b| n < b)
                    && lte.is_none_or(|b| n <= b)
            }
            Query::Match { field, text } => {
                let Some(haystack) = lookup(doc, field).and_then(Value::as_str) else {
                    return false;
                };
                let field_tokens = tokenize(haystack);
                let query_tokens = tokenize(text);
                !query_tokens.is_empty()
                    && query_tokens
                        .iter()
                        .all(|q| field_tokens.iter().any(|t| t.starts_with(q.as_str())))
            }
            Query::Prefix { field, prefix } => lookup(doc, field)
                .and_then(Value::as_str)
                .is_some_and(|s| s.starts_with(prefix.as_str())),
            Query::Exists { field } => match lookup(doc, field) {
                None | Some(Value::Null) => false,
                Some(Value::String(s)) => !s.is_empty(),
                Some(_) => true,
            },
            Query::GeoDistance {
                field,
                origin,
                max_km,
            } => point_of(doc, field).is_some_and(|p| haversine_km(*origin, p) <= *max_km),
            Query::Bool { must, must_not } => {
                must.iter().all(|q| q.matches(doc)) && !must_not.iter().any(|q| q.matches(doc))
            }
        }
    }
}

/// Result ordering of a search
#[derive(Debug, Clone, PartialEq)]
pub enum Sort {
    Field { field: String, ascending: bool },
    /// Nearest first; documents without the point field sort last
    GeoDistance { field: String, origin: GeoPoint },
}

/// Filter, ordering and pagination of a search
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: Query,
    pub sort: Option<Sort>,
    pub from: usize,
    pub size: usize,
}

impl SearchRequest {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            sort: None,
            from: 0,
            size: 10,
        }
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_page(mut self, from: usize, size: usize) -> Self {
        self.from = from;
        self.size = size;
        self
    }

    /// Run the request over candidate documents. Unsorted requests stop
    /// reading as soon as the page is filled.
    pub fn apply<I>(&self, docs: I) -> Vec<Value>
    where
        I: IntoIterator<Item = Value>,
    {
        let matching = docs.into_iter().filter(|d| self.query.matches(d));
        let Some(sort) = &self.sort else {
            return matching.skip(self.from).take(self.size).collect();
        };

        let mut all: Vec<Value> = matching.collect();
        match sort {
            Sort::Field { field, ascending } => {
                all.sort_by(|a, b| {
                    let ord = compare_fields(lookup(a, field), lookup(b, field));
                    if *ascending {
                        ord
                    } else {
                        ord.reverse()
                    }
                });
            }
            Sort::GeoDistance { field, origin } => {
                let distance = |doc: &Value| {
                    point_of(doc, field)
                        .map(|p| haversine_km(*origin, p))
                        .unwrap_or(f64::INFINITY)
                };
                all.sort_by(|a, b| distance(a).total_cmp(&distance(b)));
            }
        }
        all.into_iter().skip(self.from).take(self.size).collect()
    }
}

/// Resolve a dotted field path
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, key| current.get(key))
}

fn point_of(doc: &Value, field: &str) -> Option<GeoPoint> {
    let value = lookup(doc, field)?;
    let lat = value.get("lat").and_then(Value::as_f64)?;
    let lon = value.get("lon").and_then(Value::as_f64)?;
    Some(GeoPoint::new(lat, lon))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .unwrap_or(0.0)
            .total_cmp(&y.as_f64().unwrap_or(0.0)),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Lowercase alphanumeric tokens
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "ao_guid": "g1",
            "ao_level": 7,
            "short_name": "ул",
            "address_suggest": "москва г, ленина ул",
            "region": { "guid": "r1", "name": "Москва" },
            "location": { "lat": 55.75, "lon": 37.61 }
        })
    }

    #[test]
    fn test_term_and_nested_term() {
        assert!(Query::term("ao_guid", "g1").matches(&doc()));
        assert!(Query::term("region.guid", "r1").matches(&doc()));
        assert!(!Query::term("region.guid", "r2").matches(&doc()));
        assert!(Query::term("ao_level", 7u32).matches(&doc()));
    }

    #[test]
    fn test_range_and_terms() {
        assert!(Query::between("ao_level", 5.0, 7.0).matches(&doc()));
        assert!(!Query::gt("ao_level", 7.0).matches(&doc()));
        assert!(Query::terms("ao_level", [1u32, 7]).matches(&doc()));
        assert!(!Query::terms("ao_level", [1u32, 4]).matches(&doc()));
    }

    #[test]
    fn test_match_uses_token_prefixes() {
        assert!(Query::matches_text("address_suggest", "моск лен").matches(&doc()));
        assert!(Query::matches_text("address_suggest", "Ленина").matches(&doc()));
        assert!(!Query::matches_text("address_suggest", "тверская").matches(&doc()));
        assert!(!Query::matches_text("address_suggest", "  ").matches(&doc()));
    }

    #[test]
    fn test_bool_and_exists() {
        let q = Query::and(vec![
            Query::exists("location"),
            Query::not(Query::term("short_name", "г")),
        ]);
        assert!(q.matches(&doc()));
        assert!(!Query::exists("missing").matches(&doc()));
        assert_eq!(Query::and(vec![Query::MatchAll]), Query::MatchAll);
    }

    #[test]
    fn test_geo_sort_orders_by_distance() {
        let near = json!({ "id": "near", "location": { "lat": 55.76, "lon": 37.62 } });
        let far = json!({ "id": "far", "location": { "lat": 59.93, "lon": 30.31 } });
        let none = json!({ "id": "none" });
        let request = SearchRequest::new(Query::MatchAll).with_sort(Sort::GeoDistance {
            field: "location".to_string(),
            origin: GeoPoint::new(55.75, 37.61),
        });
        let out = request.apply(vec![far, none, near]);
        let ids: Vec<_> = out.iter().map(|d| d["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["near", "far", "none"]);
    }

    #[test]
    fn test_pagination_without_sort() {
        let docs = (0..10).map(|i| json!({ "n": i }));
        let out = SearchRequest::new(Query::MatchAll).with_page(3, 2).apply(docs);
        assert_eq!(out, vec![json!({ "n": 3 }), json!({ "n": 4 })]);
    }
}
