//! In-process record filtering for `RecordStore::search`.
//!
//! Criteria are a JSON object of dotted field paths to conditions:
//!
//! ```json
//! {
//!   "name": "doe",
//!   "patientInfo.age": {"$gte": 18, "$lte": 65},
//!   "patientInfo.gender": {"$regex": "^f"}
//! }
//! ```
//!
//! A bare string is a case-insensitive substring match against string
//! fields; any other bare value is an exact match. Array-valued fields match
//! when any element does.

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::Value;

use crate::error::{ErrorKind, StoreError};
use crate::models::PatientRecord;

#[derive(Debug, Clone)]
pub enum Condition {
    Contains(String),
    Equals(Value),
    Range { gte: Option<Value>, lte: Option<Value> },
    Matches(Regex),
}

#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    conditions: Vec<(String, Condition)>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub offset: usize,
    /// Dotted path to sort on; records missing the field sort last.
    pub sort_by: Option<String>,
    pub descending: bool,
}

/// One page of search results.
#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub items: Vec<PatientRecord>,
    /// Matches before pagination.
    pub total: usize,
    pub offset: usize,
    pub limit: Option<usize>,
    pub has_more: bool,
}

impl SearchPage {
    pub fn next_offset(&self) -> Option<usize> {
        self.has_more.then(|| self.offset + self.items.len())
    }
}

fn invalid(msg: impl Into<String>) -> StoreError {
    ErrorKind::InvalidQuery(msg.into()).into()
}

impl SearchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, path: &str, condition: Condition) -> Self {
        self.conditions.push((path.to_string(), condition));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Parse the JSON criteria form shown in the module docs.
    pub fn from_json(value: &Value) -> Result<Self, StoreError> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid("criteria must be a JSON object"))?;

        let mut criteria = Self::new();
        for (path, spec) in object {
            let condition = match spec {
                Value::String(s) => Condition::Contains(s.to_lowercase()),
                Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    parse_operators(path, ops)?
                }
                other => Condition::Equals(other.clone()),
            };
            criteria.conditions.push((path.clone(), condition));
        }
        Ok(criteria)
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.conditions.iter().all(|(path, condition)| {
            match lookup(record, path) {
                Some(Value::Array(items)) if !matches!(condition, Condition::Equals(Value::Array(_))) => {
                    items.iter().any(|item| condition.test(item))
                }
                Some(value) => condition.test(value),
                None => false,
            }
        })
    }
}

fn parse_operators(path: &str, ops: &serde_json::Map<String, Value>) -> Result<Condition, StoreError> {
    let mut gte = None;
    let mut lte = None;
    for (op, operand) in ops {
        match op.as_str() {
            "$eq" => return Ok(Condition::Equals(operand.clone())),
            "$regex" => {
                let pattern = operand
                    .as_str()
                    .ok_or_else(|| invalid(format!("{path}: $regex needs a string")))?;
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .size_limit(1 << 20)
                    .build()
                    .map_err(|e| invalid(format!("{path}: {e}")))?;
                return Ok(Condition::Matches(regex));
            }
            "$gte" => gte = Some(operand.clone()),
            "$lte" => lte = Some(operand.clone()),
            other => return Err(invalid(format!("{path}: unsupported operator {other}"))),
        }
    }
    Ok(Condition::Range { gte, lte })
}

impl Condition {
    fn test(&self, value: &Value) -> bool {
        match self {
            Self::Contains(needle) => value
                .as_str()
                .is_some_and(|s| s.to_lowercase().contains(needle.as_str())),
            Self::Equals(expected) => values_equal(value, expected),
            Self::Range { gte, lte } => {
                let above = gte
                    .as_ref()
                    .map_or(true, |low| matches!(compare(value, low), Some(Ordering::Greater | Ordering::Equal)));
                let below = lte
                    .as_ref()
                    .map_or(true, |high| matches!(compare(value, high), Some(Ordering::Less | Ordering::Equal)));
                above && below
            }
            Self::Matches(regex) => match value {
                Value::String(s) => regex.is_match(s),
                Value::Number(n) => regex.is_match(&n.to_string()),
                Value::Bool(b) => regex.is_match(&b.to_string()),
                _ => false,
            },
        }
    }
}

/// Numbers compare numerically (so 30 == 30.0); everything else structurally.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Numbers numerically, strings lexically (ISO dates order correctly);
/// mixed kinds are incomparable.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Resolve a dotted path like `patientInfo.age`.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.as_object()?.get(segment))
}

/// Filter, sort, then paginate. Pagination is applied after the full filter.
pub fn run(records: Vec<PatientRecord>, criteria: &SearchCriteria, options: &SearchOptions) -> Result<SearchPage, StoreError> {
    let mut matched: Vec<(Value, PatientRecord)> = Vec::new();
    for record in records {
        let value = serde_json::to_value(&record)?;
        if criteria.matches(&value) {
            matched.push((value, record));
        }
    }

    if let Some(path) = &options.sort_by {
        matched.sort_by(|(a, _), (b, _)| {
            let ordering = match (lookup(a, path), lookup(b, path)) {
                (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
                (Some(_), None) => return Ordering::Less,
                (None, Some(_)) => return Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if options.descending { ordering.reverse() } else { ordering }
        });
    }

    let total = matched.len();
    let items: Vec<PatientRecord> = matched
        .into_iter()
        .skip(options.offset)
        .take(options.limit.unwrap_or(usize::MAX))
        .map(|(_, record)| record)
        .collect();
    let has_more = options.offset + items.len() < total;

    Ok(SearchPage {
        items,
        total,
        offset: options.offset,
        limit: options.limit,
        has_more,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Vec<PatientRecord> {
        vec![
            PatientRecord::new("p1", "Jane Doe")
                .with_info("age", 34)
                .with_info("gender", "female")
                .with_info("symptoms", json!(["Cough", "fever"])),
            PatientRecord::new("p2", "John Doe")
                .with_info("age", 61)
                .with_info("gender", "male"),
            PatientRecord::new("p3", "Ana Lima")
                .with_info("age", 17)
                .with_info("gender", "female")
                .with_info("visit", "2024-03-10"),
        ]
    }

    fn ids(page: &SearchPage) -> Vec<&str> {
        page.items.iter().map(|r| r.id.as_str()).collect()
    }

    fn search(criteria: Value, options: SearchOptions) -> SearchPage {
        let criteria = SearchCriteria::from_json(&criteria).unwrap();
        run(sample(), &criteria, &options).unwrap()
    }

    #[test]
    fn substring_is_case_insensitive() {
        let page = search(json!({"name": "DOE"}), SearchOptions::default());
        assert_eq!(ids(&page), vec!["p1", "p2"]);
    }

    #[test]
    fn exact_match_for_non_strings() {
        let page = search(json!({"patientInfo.age": 61}), SearchOptions::default());
        assert_eq!(ids(&page), vec!["p2"]);
        let page = search(json!({"patientInfo.age": 61.0}), SearchOptions::default());
        assert_eq!(ids(&page), vec!["p2"]);
    }

    #[test]
    fn numeric_range() {
        let page = search(json!({"patientInfo.age": {"$gte": 18, "$lte": 60}}), SearchOptions::default());
        assert_eq!(ids(&page), vec!["p1"]);
    }

    #[test]
    fn string_range_orders_iso_dates() {
        let page = search(json!({"patientInfo.visit": {"$gte": "2024-03-01"}}), SearchOptions::default());
        assert_eq!(ids(&page), vec!["p3"]);
    }

    #[test]
    fn regex_operator() {
        let page = search(json!({"patientInfo.gender": {"$regex": "^f"}}), SearchOptions::default());
        assert_eq!(ids(&page), vec!["p1", "p3"]);
    }

    #[test]
    fn array_fields_match_any_element() {
        let page = search(json!({"patientInfo.symptoms": "cough"}), SearchOptions::default());
        assert_eq!(ids(&page), vec!["p1"]);
    }

    #[test]
    fn missing_field_never_matches() {
        let page = search(json!({"patientInfo.weight": {"$gte": 0}}), SearchOptions::default());
        assert_eq!(page.total, 0);
    }

    #[test]
    fn paginates_after_filtering() {
        let options = SearchOptions { limit: Some(1), offset: 1, ..Default::default() };
        let page = search(json!({"patientInfo.gender": "female"}), options);
        assert_eq!(ids(&page), vec!["p3"]);
        assert_eq!(page.total, 2);
        assert!(!page.has_more);

        let first = search(
            json!({"patientInfo.gender": "female"}),
            SearchOptions { limit: Some(1), ..Default::default() },
        );
        assert!(first.has_more);
        assert_eq!(first.next_offset(), Some(1));
    }

    #[test]
    fn sorts_descending() {
        let options = SearchOptions {
            sort_by: Some("patientInfo.age".into()),
            descending: true,
            ..Default::default()
        };
        let page = search(json!({}), options);
        assert_eq!(ids(&page), vec!["p2", "p1", "p3"]);
    }

    #[test]
    fn rejects_bad_criteria() {
        let err = SearchCriteria::from_json(&json!(["name"])).unwrap_err();
        assert_eq!(err.code(), "INVALID_QUERY");
        let err = SearchCriteria::from_json(&json!({"name": {"$regex": "("}})).unwrap_err();
        assert_eq!(err.code(), "INVALID_QUERY");
        let err = SearchCriteria::from_json(&json!({"name": {"$near": 1}})).unwrap_err();
        assert_eq!(err.code(), "INVALID_QUERY");
    }

    #[test]
    fn builder_matches_json_form() {
        let criteria = SearchCriteria::new().field("name", Condition::Contains("lima".into()));
        let page = run(sample(), &criteria, &SearchOptions::default()).unwrap();
        assert_eq!(ids(&page), vec!["p3"]);
    }

    #[test]
    fn lookup_walks_nested_objects() {
        let value = json!({"a": {"b": {"c": 1}}});
        assert_eq!(lookup(&value, "a.b.c"), Some(&json!(1)));
        assert_eq!(lookup(&value, "a.x"), None);
    }
}
