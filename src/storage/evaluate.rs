//! In-process filter evaluation, sorting and pagination
//!
//! The memory and file backends run every candidate record through
//! [`matches`], then [`sort_records`] and [`paginate`]. The SQL backend
//! compiles the same tree into SQL but reuses [`compare_generic`] (as the
//! `kb_compare` SQL function) and the sort/paginate stage for list fields.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::storage::filter::{
    ComparisonOperator, Condition, Field, FieldValue, Filter, FilterGroup, FilterValue,
    LogicalOperator, SortDirection,
};
use crate::types::Record;

/// Whether a record satisfies a filter group
pub fn matches(record: &Record, group: &FilterGroup) -> bool {
    if group.is_empty() {
        return true;
    }

    let mut children = group
        .conditions
        .iter()
        .map(|c| matches_condition(record, c))
        .chain(group.groups.iter().map(|g| matches(record, g)));

    match group.operator {
        LogicalOperator::And => children.all(|m| m),
        LogicalOperator::Or => children.any(|m| m),
        LogicalOperator::Not => !children.any(|m| m),
    }
}

/// Whether a record satisfies a single condition
pub fn matches_condition(record: &Record, condition: &Condition) -> bool {
    let op = condition.operator();
    let value = condition.value();

    match condition.field().value_of(record) {
        FieldValue::Text(text) => match value.to_text() {
            Some(rhs) => compare_scalar(text, op, &rhs),
            None => false,
        },
        FieldValue::Int(n) => match value.to_text() {
            Some(rhs) => compare_scalar(&n.to_string(), op, &rhs),
            None => false,
        },
        FieldValue::Time(at) => match value {
            FilterValue::Time(t) => compare_time(at, op, *t),
            _ => false,
        },
        FieldValue::Bytes(content) => {
            let needle: &[u8] = match value {
                FilterValue::Bytes(b) => b,
                FilterValue::String(s) => s.as_bytes(),
                _ => return false,
            };
            match op {
                ComparisonOperator::Eq => content == needle,
                ComparisonOperator::Ne => content != needle,
                ComparisonOperator::Contains => contains_bytes(content, needle),
                _ => false,
            }
        }
        FieldValue::List(items) => match (op, value.to_text()) {
            (ComparisonOperator::Contains, Some(wanted)) => items.iter().any(|i| *i == wanted),
            _ => false,
        },
        FieldValue::References(refs) => match (op, value) {
            (ComparisonOperator::Contains, FilterValue::String(id)) => {
                refs.iter().any(|r| r.id == *id)
            }
            _ => false,
        },
        FieldValue::Map(metadata) => match_metadata(metadata, op, value),
    }
}

fn compare_scalar(lhs: &str, op: ComparisonOperator, rhs: &str) -> bool {
    match op {
        ComparisonOperator::Eq => lhs == rhs,
        ComparisonOperator::Ne => lhs != rhs,
        ComparisonOperator::Contains => lhs.contains(rhs),
        ComparisonOperator::Gt => compare_generic(lhs, rhs) == Ordering::Greater,
        ComparisonOperator::Lt => compare_generic(lhs, rhs) == Ordering::Less,
        ComparisonOperator::Ge => compare_generic(lhs, rhs) != Ordering::Less,
        ComparisonOperator::Le => compare_generic(lhs, rhs) != Ordering::Greater,
    }
}

/// Generic ordering of two string-coerced values: numeric when both parse
/// as numbers, lexicographic otherwise.
pub fn compare_generic(lhs: &str, rhs: &str) -> Ordering {
    match (lhs.trim().parse::<f64>(), rhs.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) if !a.is_nan() && !b.is_nan() => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => lhs.cmp(rhs),
    }
}

// None sorts before every set time
fn compare_time(
    at: Option<chrono::DateTime<chrono::Utc>>,
    op: ComparisonOperator,
    wanted: chrono::DateTime<chrono::Utc>,
) -> bool {
    let wanted = Some(wanted);
    match op {
        ComparisonOperator::Eq => at == wanted,
        ComparisonOperator::Ne => at != wanted,
        ComparisonOperator::Gt => at > wanted,
        ComparisonOperator::Lt => at < wanted,
        ComparisonOperator::Ge => at >= wanted,
        ComparisonOperator::Le => at <= wanted,
        ComparisonOperator::Contains => false,
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

fn match_metadata(
    metadata: &HashMap<String, String>,
    op: ComparisonOperator,
    value: &FilterValue,
) -> bool {
    let has_pair = |(k, v): (&String, &String)| metadata.get(k) == Some(v);

    match (op, value) {
        (ComparisonOperator::Eq, FilterValue::Map(wanted)) => metadata_equals(metadata, wanted),
        (ComparisonOperator::Ne, FilterValue::Map(wanted)) => !metadata_equals(metadata, wanted),
        (ComparisonOperator::Contains, FilterValue::Map(wanted)) => wanted.iter().any(has_pair),
        (ComparisonOperator::Contains, FilterValue::String(key)) => metadata.contains_key(key),
        _ => false,
    }
}

// Every wanted pair present; an empty map only matches empty metadata
fn metadata_equals(
    metadata: &HashMap<String, String>,
    wanted: &std::collections::BTreeMap<String, String>,
) -> bool {
    if wanted.is_empty() {
        return metadata.is_empty();
    }
    wanted.iter().all(|(k, v)| metadata.get(k) == Some(v))
}

/// Stable sort by one field. Unknown fields leave the order unchanged.
pub fn sort_records(records: &mut [Record], order_by: Option<&str>, dir: SortDirection) {
    let Some(field) = order_by.and_then(Field::lookup) else {
        return;
    };

    records.sort_by(|a, b| {
        let ord = compare_field(field.value_of(a), field.value_of(b));
        match dir {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        }
    });
}

fn compare_field(a: FieldValue<'_>, b: FieldValue<'_>) -> Ordering {
    match (a, b) {
        (FieldValue::Text(x), FieldValue::Text(y)) => x.cmp(y),
        (FieldValue::Int(x), FieldValue::Int(y)) => x.cmp(&y),
        (FieldValue::Time(x), FieldValue::Time(y)) => x.cmp(&y),
        (FieldValue::Bytes(x), FieldValue::Bytes(y)) => x.cmp(y),
        (FieldValue::List(x), FieldValue::List(y)) => x.cmp(y),
        (FieldValue::References(x), FieldValue::References(y)) => x
            .iter()
            .map(|r| r.id.as_str())
            .cmp(y.iter().map(|r| r.id.as_str())),
        _ => Ordering::Equal,
    }
}

/// Apply offset then limit (0 = unlimited)
pub fn paginate(records: Vec<Record>, offset: usize, limit: usize) -> Vec<Record> {
    let iter = records.into_iter().skip(offset);
    if limit == 0 {
        iter.collect()
    } else {
        iter.take(limit).collect()
    }
}

/// Filter, sort and paginate a set of candidate records
pub fn run_query<'a, I>(candidates: I, filter: &Filter) -> Vec<Record>
where
    I: IntoIterator<Item = &'a Record>,
{
    let mut hits: Vec<Record> = candidates
        .into_iter()
        .filter(|r| matches(r, &filter.root_group))
        .cloned()
        .collect();

    sort_records(&mut hits, filter.order_by.as_deref(), filter.order_dir);
    paginate(hits, filter.offset, filter.limit)
}
