//! Property-based tests for kstore
//!
//! These tests verify invariants that must hold for all inputs:
//! - Single-condition AND and OR groups agree
//! - NOT is "none of the children match"
//! - Pagination never returns more than asked for
//! - Loading the same batch twice changes nothing
//! - Parsers never panic
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

use kstore::storage::evaluate::{compare_generic, matches, paginate, run_query};
use kstore::storage::{Condition, Filter, FilterGroup, Partitions};
use kstore::types::{Category, Record};

fn arb_category() -> impl Strategy<Value = Category> {
    prop_oneof![
        Just(Category::Fact),
        Just(Category::Message),
        Just(Category::Decision),
        Just(Category::Action),
    ]
}

prop_compose! {
    fn arb_record()(
        id in "[a-z]{1,8}",
        category in arb_category(),
        importance in 0i32..=100,
        tags in prop::collection::vec("[a-c]{1,2}", 0..4),
        owner in "[a-z]{0,4}",
    ) -> Record {
        Record::new(id, category)
            .with_importance(importance)
            .with_tags(tags)
            .with_owner("agent", &owner)
    }
}

fn arb_condition() -> impl Strategy<Value = Condition> {
    prop_oneof![
        arb_category().prop_map(|c| Condition::eq("Category", c.as_str()).unwrap()),
        (0i32..=100).prop_map(|n| Condition::gt("Importance", n).unwrap()),
        (0i32..=100).prop_map(|n| Condition::le("Importance", n).unwrap()),
        "[a-c]{1,2}".prop_map(|t| Condition::contains("Tags", t).unwrap()),
        "[a-z]{0,2}".prop_map(|o| Condition::contains("OwnerID", o).unwrap()),
    ]
}

// ============================================================================
// FILTER LAWS
// ============================================================================

mod filter_laws {
    use super::*;

    proptest! {
        /// Invariant: AND[C] and OR[C] select the same records
        #[test]
        fn single_condition_and_equals_or(record in arb_record(), cond in arb_condition()) {
            let and = FilterGroup::and(vec![cond.clone()]);
            let or = FilterGroup::or(vec![cond]);
            prop_assert_eq!(matches(&record, &and), matches(&record, &or));
        }

        /// Invariant: NOT[C] inverts a single condition
        #[test]
        fn not_inverts_single_condition(record in arb_record(), cond in arb_condition()) {
            let plain = FilterGroup::and(vec![cond.clone()]);
            let not = FilterGroup::not(vec![cond]);
            prop_assert_eq!(matches(&record, &plain), !matches(&record, &not));
        }

        /// Invariant: NOT[a, b] == !(a OR b)
        #[test]
        fn not_is_none_match(
            record in arb_record(),
            a in arb_condition(),
            b in arb_condition(),
        ) {
            let not = FilterGroup::not(vec![a.clone(), b.clone()]);
            let or = FilterGroup::or(vec![a, b]);
            prop_assert_eq!(matches(&record, &not), !matches(&record, &or));
        }

        /// Invariant: an empty group matches everything
        #[test]
        fn empty_group_matches(record in arb_record()) {
            prop_assert!(matches(&record, &FilterGroup::default()));
            prop_assert!(matches(&record, &FilterGroup::not(vec![])));
        }

        /// Invariant: the generic comparator is antisymmetric
        #[test]
        fn compare_generic_antisymmetric(a in "[0-9a-c.]{0,4}", b in "[0-9a-c.]{0,4}") {
            prop_assert_eq!(compare_generic(&a, &b), compare_generic(&b, &a).reverse());
        }
    }
}

// ============================================================================
// PAGINATION TESTS
// ============================================================================

mod pagination_tests {
    use super::*;

    proptest! {
        /// Invariant: a page never exceeds the limit or the remaining records
        #[test]
        fn bounded_pages(count in 0usize..30, offset in 0usize..40, limit in 0usize..10) {
            let records: Vec<Record> = (0..count)
                .map(|i| Record::new(format!("r{}", i), Category::Fact))
                .collect();
            let page = paginate(records, offset, limit);

            let remaining = count.saturating_sub(offset);
            let expected = if limit == 0 { remaining } else { remaining.min(limit) };
            prop_assert_eq!(page.len(), expected);
        }

        /// Invariant: sorted query output is ordered by the sort key
        #[test]
        fn sorted_output(records in prop::collection::vec(arb_record(), 0..20)) {
            let filter = Filter::all().order_by("Importance", kstore::storage::SortDirection::Desc);
            let hits = run_query(&records, &filter);
            prop_assert!(hits.windows(2).all(|w| w[0].importance >= w[1].importance));
        }
    }
}

// ============================================================================
// LOAD TESTS
// ============================================================================

mod load_tests {
    use super::*;
    use std::collections::BTreeMap;

    fn unique(records: Vec<Record>) -> Vec<Record> {
        let by_id: BTreeMap<String, Record> =
            records.into_iter().map(|r| (r.id.clone(), r)).collect();
        by_id.into_values().collect()
    }

    proptest! {
        /// Invariant: loading the same batch twice leaves the state unchanged
        #[test]
        fn load_idempotent(records in prop::collection::vec(arb_record(), 0..15)) {
            let batch = unique(records);
            let now = chrono::Utc::now();
            let mut parts = Partitions::new();

            let first = parts.load(batch.clone(), now).unwrap();
            prop_assert_eq!(first.inserted, batch.len());
            let snapshot = parts.live().clone();

            let second = parts.load(batch.clone(), now + chrono::Duration::seconds(1)).unwrap();
            prop_assert_eq!(second.unchanged, batch.len());
            prop_assert_eq!(parts.live(), &snapshot);
        }
    }
}

// ============================================================================
// PARSER TESTS
// ============================================================================

mod parser_tests {
    use super::*;
    use kstore::storage::{parse_filter, ComparisonOperator, Field};

    proptest! {
        /// Invariant: field parsing never panics
        #[test]
        fn field_parse_never_panics(s in "\\PC{0,40}") {
            let _ = Field::parse(&s);
        }

        /// Invariant: operator parsing never panics
        #[test]
        fn operator_parse_never_panics(s in "\\PC{0,10}") {
            let _ = s.parse::<ComparisonOperator>();
        }

        /// Invariant: filter parsing never panics on arbitrary field/value pairs
        #[test]
        fn filter_parse_never_panics(field in "[A-Za-z_]{0,12}", op in "[=<>!a-zA-Z]{0,8}", value in "\\PC{0,20}") {
            let json = serde_json::json!({
                "root_group": {"conditions": [{"field": field, "operator": op, "value": value}]}
            });
            let _ = parse_filter(&json);
        }
    }
}
