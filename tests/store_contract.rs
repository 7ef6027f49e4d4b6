//! Behaviour every knowledge store must share
//!
//! Each check runs against the memory, file and SQLite backends.
//!
//! Run with: cargo test --test store_contract

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use kstore::error::ErrorKind;
use kstore::events::{EventType, MemorySink};
use kstore::storage::{Condition, FileStore, Filter, FilterGroup, FilterValue, SortDirection};
use kstore::types::{importance, Category, Record, Reference};
use kstore::{KnowledgeStore, MemoryStore, SqlConfig, SqliteStore};

const ACCOUNT: &str = "3a2b1c0d-9e8f-4a7b-8c6d-5e4f3a2b1c0d";

/// A store plus the directory keeping its files alive
struct Harness {
    store: Arc<dyn KnowledgeStore>,
    _dir: TempDir,
}

fn backends() -> Vec<Harness> {
    backends_with_sink(None)
}

fn backends_with_sink(sink: Option<Arc<MemorySink>>) -> Vec<Harness> {
    let mut out = Vec::new();

    let dir = TempDir::new().unwrap();
    let mut memory = MemoryStore::new();
    if let Some(sink) = &sink {
        memory = memory.with_event_sink(sink.clone());
    }
    out.push(Harness {
        store: Arc::new(memory),
        _dir: dir,
    });

    let dir = TempDir::new().unwrap();
    let mut file = FileStore::new(dir.path().join("kb.json")).unwrap();
    if let Some(sink) = &sink {
        file = file.with_event_sink(sink.clone());
    }
    out.push(Harness {
        store: Arc::new(file),
        _dir: dir,
    });

    let dir = TempDir::new().unwrap();
    let mut config = SqlConfig::new(dir.path().join("kb.db").to_string_lossy(), ACCOUNT);
    config.pool_size = 4;
    let mut sql = SqliteStore::new(config).unwrap();
    if let Some(sink) = &sink {
        sql = sql.with_event_sink(sink.clone());
    }
    out.push(Harness {
        store: Arc::new(sql),
        _dir: dir,
    });

    for h in &out {
        h.store.open().unwrap();
    }
    out
}

fn ids(records: &[Record]) -> Vec<String> {
    records.iter().map(|r| r.id.clone()).collect()
}

fn id_set(records: &[Record]) -> BTreeSet<String> {
    records.iter().map(|r| r.id.clone()).collect()
}

fn where_all(conditions: Vec<Condition>) -> Filter {
    Filter::new(FilterGroup::and(conditions))
}

#[test]
fn add_then_get_round_trips() {
    for h in backends() {
        let store = &h.store;
        let record = Record::new("r1", Category::Decision)
            .with_text("use postgres")
            .with_importance(importance::HIGH)
            .with_tags(["db", "billing"])
            .with_subjects("service", ["svc-billing"])
            .with_source("chat", "conv-1")
            .with_owner("agent", "agent-7")
            .with_reference(Reference::new("r0", "supersedes"))
            .with_metadata("team", "payments");

        let stored = store.add_record(record.clone()).unwrap();
        assert!(stored.created_at.is_some(), "{}", store.backend_name());
        assert!(stored.updated_at.is_some());
        assert!(record.same_payload(&stored));

        let fetched = store.get_record("r1").unwrap();
        assert_eq!(fetched, stored, "{}", store.backend_name());
    }
}

#[test]
fn add_rejects_empty_and_duplicate_ids() {
    for h in backends() {
        let store = &h.store;
        let err = store.add_record(Record::new("", Category::Fact)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{}", store.backend_name());

        store.add_record(Record::new("a", Category::Fact)).unwrap();
        let err = store.add_record(Record::new("a", Category::Fact)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        store.delete_record("a").unwrap();
        let err = store.add_record(Record::new("a", Category::Fact)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists, "{}", store.backend_name());
    }
}

#[test]
fn update_refreshes_updated_at_and_keeps_created_at() {
    for h in backends() {
        let store = &h.store;
        let original = store
            .add_record(Record::new("a", Category::Fact).with_text("v1"))
            .unwrap();

        let updated = store
            .update_record(Record::new("a", Category::Fact).with_text("v2"))
            .unwrap();
        assert_eq!(updated.created_at, original.created_at, "{}", store.backend_name());
        assert!(updated.updated_at >= original.updated_at);
        assert_eq!(store.get_record("a").unwrap().content_text(), "v2");

        let err = store
            .update_record(Record::new("missing", Category::Fact))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}

#[test]
fn soft_delete_restore_purge_lifecycle() {
    for h in backends() {
        let store = &h.store;
        let name = store.backend_name();
        store
            .add_record(Record::new("a", Category::Fact).with_text("keep me"))
            .unwrap();

        let err = store.restore_record("a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition, "{}", name);

        store.delete_record("a").unwrap();
        assert!(store.get_record("a").unwrap_err().is_not_found(), "{}", name);
        let err = store.delete_record("a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition, "{}", name);
        let err = store
            .update_record(Record::new("a", Category::Fact))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound, "{}", name);

        store.restore_record("a").unwrap();
        assert_eq!(store.get_record("a").unwrap().content_text(), "keep me");

        store.delete_record("a").unwrap();
        store.purge_record("a").unwrap();
        assert!(store.restore_record("a").unwrap_err().is_not_found(), "{}", name);
        assert!(store.purge_record("a").unwrap_err().is_not_found());
        assert!(store.delete_record("a").unwrap_err().is_not_found());

        // purge works on live records too
        store.add_record(Record::new("b", Category::Fact)).unwrap();
        store.purge_record("b").unwrap();
        assert!(store.get_record("b").unwrap_err().is_not_found());
    }
}

#[test]
fn delete_and_restore_refresh_updated_at() {
    for h in backends() {
        let store = &h.store;
        let added = store.add_record(Record::new("a", Category::Fact)).unwrap();
        store.delete_record("a").unwrap();
        store.restore_record("a").unwrap();
        let restored = store.get_record("a").unwrap();
        assert!(restored.updated_at >= added.updated_at, "{}", store.backend_name());
        assert_eq!(restored.created_at, added.created_at);
    }
}

#[test]
fn load_is_idempotent_and_upserts() {
    for h in backends() {
        let store = &h.store;
        let name = store.backend_name();
        store.add_record(Record::new("existing", Category::Fact)).unwrap();
        store.add_record(Record::new("gone", Category::Fact)).unwrap();
        store.delete_record("gone").unwrap();

        let batch = vec![
            Record::new("new-1", Category::Message).with_text("hello"),
            Record::new("existing", Category::Fact).with_importance(50),
            Record::new("gone", Category::Fact).with_importance(99),
        ];

        let first = store.load_records(batch.clone()).unwrap();
        assert_eq!((first.inserted, first.updated, first.unchanged), (1, 2, 0), "{}", name);
        let snapshot = store.search_records(&Filter::all().include_deleted()).unwrap();

        let second = store.load_records(batch).unwrap();
        assert_eq!(second.unchanged, 3, "{}", name);
        let again = store.search_records(&Filter::all().include_deleted()).unwrap();
        assert_eq!(id_set(&again), id_set(&snapshot));
        for record in &again {
            let before = snapshot.iter().find(|r| r.id == record.id).unwrap();
            assert_eq!(record, before, "{}", name);
        }

        // a deleted record stays deleted after load
        assert!(store.get_record("gone").unwrap_err().is_not_found());
        let deleted = store.search_records(&Filter::all().only_deleted()).unwrap();
        assert_eq!(ids(&deleted), vec!["gone"]);
        assert_eq!(deleted[0].importance, 99);
    }
}

#[test]
fn load_validates_whole_batch_first() {
    for h in backends() {
        let store = &h.store;
        let err = store
            .load_records(vec![
                Record::new("a", Category::Fact),
                Record::new("b", Category::Fact),
                Record::new("a", Category::Fact),
            ])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("Batch record 2"), "{}", err);
        assert_eq!(store.info().unwrap().record_count, 0, "{}", store.backend_name());
    }
}

#[test]
fn empty_filter_returns_all_live_records() {
    for h in backends() {
        let store = &h.store;
        for id in ["a", "b", "c"] {
            store.add_record(Record::new(id, Category::Fact)).unwrap();
        }
        store.delete_record("b").unwrap();

        let all = store.search_records(&Filter::all()).unwrap();
        assert_eq!(id_set(&all), ["a", "c"].iter().map(|s| s.to_string()).collect());
    }
}

#[test]
fn single_condition_and_equals_or() {
    for h in backends() {
        let store = &h.store;
        for (id, imp) in [("a", 10), ("b", 60), ("c", 90)] {
            store
                .add_record(Record::new(id, Category::Fact).with_importance(imp))
                .unwrap();
        }
        let cond = Condition::ge("Importance", 60).unwrap();
        let and = store
            .search_records(&Filter::new(FilterGroup::and(vec![cond.clone()])))
            .unwrap();
        let or = store
            .search_records(&Filter::new(FilterGroup::or(vec![cond])))
            .unwrap();
        assert_eq!(id_set(&and), id_set(&or), "{}", store.backend_name());
        assert_eq!(and.len(), 2);
    }
}

#[test]
fn pagination_bounds() {
    for h in backends() {
        let store = &h.store;
        for i in 0..5 {
            store
                .add_record(Record::new(format!("r{}", i), Category::Fact).with_importance(i))
                .unwrap();
        }
        let sorted = Filter::all().order_by("Importance", SortDirection::Asc);

        let page = store.search_records(&sorted.clone().offset(5)).unwrap();
        assert!(page.is_empty(), "{}", store.backend_name());
        let page = store.search_records(&sorted.clone().offset(50).limit(3)).unwrap();
        assert!(page.is_empty());

        let page = store.search_records(&sorted.clone().offset(2)).unwrap();
        assert_eq!(ids(&page), vec!["r2", "r3", "r4"], "{}", store.backend_name());

        let page = store.search_records(&sorted.clone().offset(1).limit(2)).unwrap();
        assert_eq!(ids(&page), vec!["r1", "r2"]);

        assert_eq!(store.search_records(&sorted.clone().limit(0)).unwrap().len(), 5);

        let page = store.search_records(&sorted.clone().offset(usize::MAX)).unwrap();
        assert!(page.is_empty(), "{}", store.backend_name());
        let page = store
            .search_records(&sorted.offset(usize::MAX).limit(2))
            .unwrap();
        assert!(page.is_empty(), "{}", store.backend_name());
    }
}

#[test]
fn unsorted_pages_follow_id_order() {
    for h in backends() {
        let store = &h.store;
        for id in ["d", "b", "e", "a", "c"] {
            store.add_record(Record::new(id, Category::Fact)).unwrap();
        }
        let name = store.backend_name();

        let page = store.search_records(&Filter::all().offset(1).limit(2)).unwrap();
        assert_eq!(ids(&page), vec!["b", "c"], "{}", name);

        let by_metadata = Filter::all()
            .order_by("Metadata", SortDirection::Desc)
            .limit(3);
        let page = store.search_records(&by_metadata).unwrap();
        assert_eq!(ids(&page), vec!["a", "b", "c"], "{}", name);
    }
}

#[test]
fn importance_filter_sorted_desc() {
    for h in backends() {
        let store = &h.store;
        for imp in [importance::LOW, importance::MEDIUM, importance::HIGH] {
            store
                .add_record(Record::new(format!("imp-{}", imp), Category::Fact).with_importance(imp))
                .unwrap();
        }
        let filter = where_all(vec![Condition::gt("Importance", 25).unwrap()])
            .order_by("Importance", SortDirection::Desc);
        let hits = store.search_records(&filter).unwrap();
        let order: Vec<i32> = hits.iter().map(|r| r.importance).collect();
        assert_eq!(order, vec![75, 50], "{}", store.backend_name());
    }
}

#[test]
fn tags_contains() {
    for h in backends() {
        let store = &h.store;
        store
            .add_record(Record::new("a", Category::Fact).with_tags(["billing", "q3"]))
            .unwrap();
        store
            .add_record(Record::new("b", Category::Fact).with_tags(["billingx"]))
            .unwrap();

        let hits = store
            .search_records(&where_all(vec![Condition::contains("Tags", "billing").unwrap()]))
            .unwrap();
        assert_eq!(ids(&hits), vec!["a"], "{}", store.backend_name());

        let hits = store
            .search_records(&where_all(vec![Condition::contains("Tags", "refund").unwrap()]))
            .unwrap();
        assert!(hits.is_empty());
    }
}

#[test]
fn deleted_partition_selection() {
    for h in backends() {
        let store = &h.store;
        store.add_record(Record::new("live", Category::Fact)).unwrap();
        store.add_record(Record::new("dead", Category::Fact)).unwrap();
        store.delete_record("dead").unwrap();

        let name = store.backend_name();
        assert_eq!(ids(&store.search_records(&Filter::all()).unwrap()), vec!["live"], "{}", name);
        assert_eq!(
            ids(&store.search_records(&Filter::all().only_deleted()).unwrap()),
            vec!["dead"],
            "{}",
            name
        );
        let both = store.search_records(&Filter::all().include_deleted()).unwrap();
        assert_eq!(both.len(), 2, "{}", name);
    }
}

#[test]
fn not_semantics_match_across_backends() {
    for h in backends() {
        let store = &h.store;
        store.add_record(Record::new("f", Category::Fact)).unwrap();
        store.add_record(Record::new("d", Category::Decision)).unwrap();
        store.add_record(Record::new("a", Category::Action)).unwrap();

        let not_one = Filter::new(FilterGroup::not(vec![
            Condition::eq("Category", "fact").unwrap()
        ]));
        let hits = store.search_records(&not_one).unwrap();
        assert_eq!(id_set(&hits), ["a", "d"].iter().map(|s| s.to_string()).collect());

        let not_two = Filter::new(FilterGroup::not(vec![
            Condition::eq("Category", "fact").unwrap(),
            Condition::eq("Category", "action").unwrap(),
        ]));
        let hits = store.search_records(&not_two).unwrap();
        assert_eq!(ids(&hits), vec!["d"], "{}", store.backend_name());
    }
}

#[test]
fn field_kinds_agree_across_backends() {
    use chrono::{Duration, Utc};

    for h in backends() {
        let store = &h.store;
        let name = store.backend_name();
        let soon = Utc::now() + Duration::days(1);
        store
            .add_record(
                Record::new("a", Category::Fact)
                    .with_text("quarterly billing report")
                    .with_owner("agent", "agent-7")
                    .with_subjects("customer", ["cust-1"])
                    .with_reference(Reference::new("r0", "cites"))
                    .with_metadata("team", "payments")
                    .with_metadata("region", "eu")
                    .with_expires_at(soon),
            )
            .unwrap();
        store
            .add_record(Record::new("b", Category::Fact).with_text("misc").with_importance(9))
            .unwrap();

        let hit_ids = |conds: Vec<Condition>| ids(&store.search_records(&where_all(conds)).unwrap());

        assert_eq!(hit_ids(vec![Condition::contains("Content", "billing").unwrap()]), vec!["a"], "{}", name);
        assert_eq!(hit_ids(vec![Condition::eq("Content", "misc").unwrap()]), vec!["b"], "{}", name);
        assert_eq!(hit_ids(vec![Condition::contains("OwnerID", "agent").unwrap()]), vec!["a"], "{}", name);
        assert_eq!(hit_ids(vec![Condition::contains("SubjectIDs", "cust-1").unwrap()]), vec!["a"], "{}", name);
        assert_eq!(hit_ids(vec![Condition::contains("References", "r0").unwrap()]), vec!["a"], "{}", name);
        assert_eq!(
            hit_ids(vec![Condition::eq("Metadata", [("team", "payments")]).unwrap()]),
            vec!["a"],
            "{}",
            name
        );
        assert_eq!(
            hit_ids(vec![Condition::eq("Metadata", [("team", "payments"), ("region", "us")]).unwrap()]),
            Vec::<String>::new(),
            "{}",
            name
        );
        assert_eq!(
            hit_ids(vec![Condition::ne("Metadata", [("team", "payments")]).unwrap()]),
            vec!["b"],
            "{}",
            name
        );
        assert_eq!(
            hit_ids(vec![Condition::contains("Metadata", [("team", "x"), ("region", "eu")]).unwrap()]),
            vec!["a"],
            "{}",
            name
        );
        assert_eq!(
            hit_ids(vec![Condition::eq("Metadata", FilterValue::Map(Default::default())).unwrap()]),
            vec!["b"],
            "{}",
            name
        );
        assert_eq!(hit_ids(vec![Condition::contains("Metadata", "region").unwrap()]), vec!["a"], "{}", name);

        // numeric comparison, not lexicographic: 9 < 10
        let mut hits = hit_ids(vec![Condition::lt("Importance", 10).unwrap()]);
        hits.sort();
        assert_eq!(hits, vec!["a", "b"], "{}", name);
        assert_eq!(hit_ids(vec![Condition::gt("Importance", 5).unwrap()]), vec!["b"], "{}", name);

        // unset expiry is earlier than any set time
        let mut hits = hit_ids(vec![Condition::lt("ExpiresAt", soon + Duration::seconds(1)).unwrap()]);
        hits.sort();
        assert_eq!(hits, vec!["a", "b"], "{}", name);
        assert_eq!(hit_ids(vec![Condition::eq("ExpiresAt", soon).unwrap()]), vec!["a"], "{}", name);
        assert_eq!(hit_ids(vec![Condition::gt("ExpiresAt", Utc::now()).unwrap()]), vec!["a"], "{}", name);
    }
}

#[test]
fn list_field_sort() {
    for h in backends() {
        let store = &h.store;
        store.add_record(Record::new("x", Category::Fact).with_tags(["c"])).unwrap();
        store.add_record(Record::new("y", Category::Fact).with_tags(["a", "z"])).unwrap();
        store.add_record(Record::new("z", Category::Fact).with_tags(["b"])).unwrap();

        let filter = Filter::all().order_by("Tags", SortDirection::Asc).limit(2);
        let hits = store.search_records(&filter).unwrap();
        assert_eq!(ids(&hits), vec!["y", "z"], "{}", store.backend_name());
    }
}

#[test]
fn concurrent_adds_are_all_visible() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 25;

    for h in backends() {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let store = Arc::clone(&h.store);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        store
                            .add_record(Record::new(format!("t{}-{}", t, i), Category::Message))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let all = h.store.search_records(&Filter::all()).unwrap();
        assert_eq!(all.len(), THREADS * PER_THREAD, "{}", h.store.backend_name());
        assert_eq!(h.store.count_records(&Filter::all()).unwrap(), THREADS * PER_THREAD);
    }
}

#[test]
fn closed_store_rejects_operations() {
    for h in backends() {
        let store = &h.store;
        store.close().unwrap();

        let name = store.backend_name();
        let err = store.get_record("a").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageIo, "{}", name);
        assert!(store.add_record(Record::new("a", Category::Fact)).is_err());
        assert!(store.search_records(&Filter::all()).is_err());
        assert!(store.load_records(vec![]).is_err());
        assert!(!store.info().unwrap().open, "{}", name);

        store.open().unwrap();
        store.open().unwrap();
        assert!(store.info().unwrap().open);
    }
}

#[test]
fn events_are_reported() {
    let sink = MemorySink::new();
    for h in backends_with_sink(Some(sink.clone())) {
        sink.clear();
        let store = &h.store;
        store.add_record(Record::new("a", Category::Fact)).unwrap();
        store.update_record(Record::new("a", Category::Fact)).unwrap();
        store.delete_record("a").unwrap();
        store.restore_record("a").unwrap();
        store.purge_record("a").unwrap();
        store.load_records(vec![Record::new("b", Category::Fact)]).unwrap();
        store.search_records(&Filter::all()).unwrap();

        assert_eq!(
            sink.event_types(),
            vec![
                EventType::RecordCreated,
                EventType::RecordUpdated,
                EventType::RecordDeleted,
                EventType::RecordRestored,
                EventType::RecordPurged,
                EventType::RecordsLoaded,
                EventType::SearchExecuted,
            ],
            "{}",
            store.backend_name()
        );
        assert!(sink.events().iter().all(|e| e.backend == store.backend_name()));
    }
}
