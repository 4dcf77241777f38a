//! End-to-end: fetch two overlapping playlists, reconcile, write back.

mod common;

use common::{entries, entry, FakeApi, Harness};
use unison_core::model::CollectionId;
use unison_core::schema::ProjectionFilter;
use unison_etl::reconcile::Scope;
use unison_etl::writeback::DEFAULT_MAX_PER_TARGET;
use unison_etl::{FetchOptions, Fetcher, Reconciler, SummaryOptions, WriteBack, WriteOptions};

fn p(id: &str) -> CollectionId {
    CollectionId::new(id).unwrap()
}

/// `p1` holds 150 distinct tracks with the first 20 added three times;
/// `p2` holds the last 50 of them plus 30 of its own.
fn fixture() -> FakeApi {
    let base = entries("x", 150);
    let mut p1 = base.clone();
    for _ in 0..2 {
        p1.extend(base[..20].iter().cloned());
    }
    let mut p2: Vec<_> = base[100..].to_vec();
    p2.extend(entries("y", 30));

    FakeApi::new()
        .with_collection("p1", p1)
        .with_collection("p2", p2)
}

async fn fetch_all(h: &Harness) {
    let fetcher = Fetcher::new(&h.client, &h.checkpoints, &h.db, FetchOptions::default());
    for id in ["p1", "p2"] {
        fetcher.fetch(&p(id)).await.unwrap();
    }
    h.db.rebuild_projection().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_then_merge() {
    let h = Harness::new(fixture());
    fetch_all(&h).await;
    let engine = Reconciler::load(&h.db).unwrap();

    let summary = engine.dry_run_summary(&SummaryOptions {
        weighted_scope: Scope::Collection(p("p1")),
        overlap_pair: None,
    });
    assert_eq!(summary.before.entries_by_collection[&p("p1")], 190);
    assert_eq!(summary.before.entries_by_collection[&p("p2")], 80);
    assert_eq!(summary.before.total_entries, 270);
    assert_eq!(summary.after.unique_tracks, 180);
    assert_eq!(summary.impact.duplicates_removed, 90);

    let overlap = summary.overlap.as_ref().unwrap();
    assert_eq!(overlap.only_a, 100);
    assert_eq!(overlap.only_b, 30);
    assert_eq!(overlap.in_both, 50);

    assert_eq!(summary.weight_stats.highest, 3);
    assert_eq!(summary.weight_stats.with_duplicates, 20);

    let ids = engine.deduplicated_ids();
    let writer = WriteBack::new(&h.client, &h.checkpoints, WriteOptions::default());
    h.api().clear_requests();

    let unconfirmed = writer
        .execute(&ids, "Master Library", DEFAULT_MAX_PER_TARGET, false)
        .await
        .unwrap();
    assert!(!unconfirmed.confirmed);
    assert!(h.api().requests().is_empty());

    let report = writer
        .execute(&ids, "Master Library", DEFAULT_MAX_PER_TARGET, true)
        .await
        .unwrap();
    assert_eq!(report.total_written(), 180);

    let written = &h.api().created()[0].ids;
    let expected: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
    assert_eq!(written, &expected);
}

#[tokio::test(start_paused = true)]
async fn test_weights_sum_to_rows_in_scope() {
    let h = Harness::new(fixture());
    fetch_all(&h).await;
    let engine = Reconciler::load(&h.db).unwrap();

    for scope in [Scope::All, Scope::Collection(p("p1")), Scope::Collection(p("p2"))] {
        let filter = match &scope {
            Scope::All => ProjectionFilter::all(),
            Scope::Collection(id) => ProjectionFilter::collection(id.clone()),
        };
        let rows = h.db.query_projection(&filter).unwrap().len() as u64;
        let weights: u64 = engine.weight_report(&scope).iter().map(|r| r.weight).sum();
        assert_eq!(weights, rows, "scope {scope:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_overlap_counts_match_collection_sizes() {
    let h = Harness::new(fixture());
    fetch_all(&h).await;
    let engine = Reconciler::load(&h.db).unwrap();

    for (a, b) in [("p1", "p2"), ("p2", "p1"), ("p1", "p1")] {
        let overlap = engine.overlap_report(&p(a), &p(b));
        let distinct = |id: &str| {
            engine
                .weight_report(&Scope::Collection(p(id)))
                .len() as u64
        };
        assert_eq!(overlap.only_a + overlap.in_both, distinct(a));
        assert_eq!(overlap.only_b + overlap.in_both, distinct(b));
    }
}

#[tokio::test(start_paused = true)]
async fn test_deduplicate_is_byte_identical_across_runs() {
    let h = Harness::new(fixture());
    fetch_all(&h).await;

    let first = serde_json::to_string(&Reconciler::load(&h.db).unwrap().deduplicate()).unwrap();
    h.db.rebuild_projection().unwrap();
    let second = serde_json::to_string(&Reconciler::load(&h.db).unwrap().deduplicate()).unwrap();
    assert_eq!(first, second);

    let options = SummaryOptions::default();
    let summary_a =
        serde_json::to_string(&Reconciler::load(&h.db).unwrap().dry_run_summary(&options)).unwrap();
    let summary_b =
        serde_json::to_string(&Reconciler::load(&h.db).unwrap().dry_run_summary(&options)).unwrap();
    assert_eq!(summary_a, summary_b);
}

#[tokio::test(start_paused = true)]
async fn test_dedup_orders_by_earliest_add_across_collections() {
    let api = FakeApi::new()
        .with_collection(
            "p1",
            vec![
                entry("A", "2021-03-01T00:00:00Z"),
                entry("B", "2020-05-01T00:00:00Z"),
            ],
        )
        .with_collection(
            "p2",
            vec![
                entry("A", "2019-01-01T00:00:00Z"),
                serde_json::json!({"track": {"id": "C"}}),
            ],
        );
    let h = Harness::new(api);
    fetch_all(&h).await;

    let deduped = Reconciler::load(&h.db).unwrap().deduplicate();
    let ids: Vec<&str> = deduped.iter().map(|r| r.record_id.as_str()).collect();
    assert_eq!(ids, vec!["A", "B", "C"]);
    assert_eq!(deduped[0].first_added.as_deref(), Some("2019-01-01T00:00:00Z"));
    assert_eq!(deduped[0].total_occurrences, 2);
    assert!(deduped[2].first_added.is_none());
}
