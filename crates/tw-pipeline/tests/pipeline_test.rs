//! End-to-end behavior of the pipeline through its public handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tw_core::{ListingBatch, ListingId, ListingItem, SortDirection, SortKeySpec};
use tw_pipeline::{PipelineBuilder, PipelineConfig, PipelineError, PipelineHandle, Projection, SourceKind};
use tw_view::QuickFilterMatcher;

#[derive(Debug)]
struct Offer {
    name: &'static str,
    price: u32,
    ts: i64,
}

fn id(key: &str) -> ListingId {
    ListingId::new(key).unwrap()
}

fn offer(name: &'static str, price: u32, ts: i64) -> Offer {
    Offer { name, price, ts }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        debounce_ms: 0,
        max_debounce_ms: 0,
        ..PipelineConfig::default()
    }
}

fn builder(config: PipelineConfig) -> PipelineBuilder<Offer> {
    let mut builder = PipelineBuilder::new(config);
    builder
        .register_sort_key_both("price", |i: &ListingItem<Offer>| i.payload.price)
        .unwrap()
        .register_sort_key_both("ts", |i: &ListingItem<Offer>| i.payload.ts)
        .unwrap();
    let matcher: Arc<dyn QuickFilterMatcher<Offer>> =
        Arc::new(|text: &str, item: &ListingItem<Offer>| item.payload.name.contains(text));
    builder.quick_filter(matcher);
    builder
}

fn spawn(config: PipelineConfig) -> PipelineHandle<Offer> {
    let (handle, _join) = builder(config).spawn().unwrap();
    handle
}

fn names(projection: &Projection<Offer>) -> Vec<String> {
    projection.page.iter().map(|i| i.id.to_string()).collect()
}

async fn wait_for(
    rx: &mut watch::Receiver<Projection<Offer>>,
    condition: impl FnMut(&Projection<Offer>) -> bool,
) -> Projection<Offer> {
    timeout(Duration::from_secs(2), rx.wait_for(condition))
        .await
        .expect("projection condition not reached")
        .expect("pipeline stopped")
        .clone()
}

#[tokio::test]
async fn test_registry_grows_by_new_and_retains_removed() {
    let handle = spawn(config());
    let feed = handle.add_query(None, "tab").await.unwrap();

    let mut batch = ListingBatch::new();
    batch
        .push_new(id("a"), offer("orb", 1, 1))
        .push_new(id("b"), offer("orb", 2, 2))
        .push_new(id("c"), offer("orb", 3, 3));
    feed.publish_batch(batch).await.unwrap();

    let mut batch = ListingBatch::new();
    batch
        .push_new(id("d"), offer("orb", 4, 4))
        .push_removed(id("a"), offer("orb", 1, 1));
    let summary = feed.publish_batch(batch).await.unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(summary.removed, 1);

    handle.flush().await.unwrap();
    let projection = handle.projection();
    assert_eq!(projection.counters.total(), 4);
    assert_eq!(projection.counters.removed_count, 1);
    assert_eq!(names(&projection), vec!["b", "c", "d"]);
}

#[tokio::test]
async fn test_removed_twice_is_noop() {
    let handle = spawn(config());
    let feed = handle.add_query(None, "tab").await.unwrap();

    let mut batch = ListingBatch::new();
    batch.push_new(id("a"), offer("orb", 1, 1));
    feed.publish_batch(batch).await.unwrap();
    for _ in 0..2 {
        let mut batch = ListingBatch::new();
        batch.push_removed(id("a"), offer("orb", 1, 1));
        feed.publish_batch(batch).await.unwrap();
    }

    handle.flush().await.unwrap();
    let projection = handle.projection();
    assert_eq!(projection.counters.removed_count, 1);
    assert_eq!(projection.counters.total(), 1);
}

#[tokio::test]
async fn test_sort_determinism() {
    let handle = spawn(config());
    let feed = handle.add_query(None, "tab").await.unwrap();

    let mut batch = ListingBatch::new();
    batch
        .push_new(id("A"), offer("orb", 5, 1))
        .push_new(id("B"), offer("orb", 5, 2))
        .push_new(id("C"), offer("orb", 3, 5));
    feed.publish_batch(batch).await.unwrap();

    handle
        .set_sort_keys(vec![SortKeySpec::ascending("price")])
        .await
        .unwrap();
    handle.flush().await.unwrap();
    assert_eq!(names(&handle.projection()), vec!["C", "A", "B"]);

    handle
        .set_sort_keys(vec![
            SortKeySpec::ascending("price"),
            SortKeySpec::new("ts", SortDirection::Descending),
        ])
        .await
        .unwrap();
    handle.flush().await.unwrap();
    assert_eq!(names(&handle.projection()), vec!["C", "B", "A"]);
}

#[tokio::test]
async fn test_visibility_flags() {
    let handle = spawn(config());
    let feed = handle.add_query(None, "tab").await.unwrap();

    let mut batch = ListingBatch::new();
    batch
        .push_new(id("a"), offer("orb", 1, 1))
        .push_new(id("b"), offer("orb", 2, 2));
    feed.publish_batch(batch).await.unwrap();
    let mut batch = ListingBatch::new();
    batch.push_removed(id("b"), offer("orb", 2, 2));
    feed.publish_batch(batch).await.unwrap();

    handle.flush().await.unwrap();
    assert_eq!(names(&handle.projection()), vec!["a"]);

    handle.set_show_removed(true).await.unwrap();
    handle.set_show_new(false).await.unwrap();
    handle.flush().await.unwrap();
    assert_eq!(names(&handle.projection()), vec!["b"]);
}

#[tokio::test]
async fn test_pagination_clamps() {
    let handle = spawn(config());
    let feed = handle.add_query(None, "tab").await.unwrap();

    let mut batch = ListingBatch::new();
    for n in 0..23 {
        batch.push_new(id(&format!("item{n:02}")), offer("orb", n, n as i64));
    }
    feed.publish_batch(batch).await.unwrap();
    handle.flush().await.unwrap();

    let preview = handle.request_page(5, 10).await.unwrap();
    assert_eq!(preview.total_pages, 3);
    assert_eq!(preview.index, 2);

    handle.flush().await.unwrap();
    let projection = handle.projection();
    assert_eq!(projection.page_info.index, 2);
    assert_eq!(projection.page_info.total_items, 23);
    assert_eq!(projection.page.len(), 3);
}

#[tokio::test]
async fn test_mark_all_read_empties_default_view() {
    let handle = spawn(config());
    let feed = handle.add_query(None, "tab").await.unwrap();

    let mut batch = ListingBatch::new();
    batch
        .push_new(id("a"), offer("orb", 1, 1))
        .push_new(id("b"), offer("orb", 2, 2));
    feed.publish_batch(batch).await.unwrap();
    let mut batch = ListingBatch::new();
    batch.push_removed(id("b"), offer("orb", 2, 2));
    feed.publish_batch(batch).await.unwrap();

    handle.mark_all_read().await.unwrap();
    handle.flush().await.unwrap();
    let projection = handle.projection();
    assert!(projection.page.is_empty());
    assert_eq!(projection.counters.normal_count, 2);
    assert_eq!(projection.counters.new_count, 0);
    assert_eq!(projection.counters.removed_count, 0);
}

#[tokio::test]
async fn test_shared_identity_survives_source_removal() {
    let handle = spawn(config());
    let first = handle.add_query(None, "tab 1").await.unwrap();
    let second = handle.add_query(None, "tab 2").await.unwrap();

    let mut batch = ListingBatch::new();
    batch.push_new(id("x"), offer("orb", 1, 1));
    first.publish_batch(batch).await.unwrap();
    let mut batch = ListingBatch::new();
    batch.push_new(id("x"), offer("orb", 1, 1));
    second.publish_batch(batch).await.unwrap();

    handle.flush().await.unwrap();
    assert_eq!(names(&handle.projection()), vec!["x"]);

    handle.remove_source(first.token()).await.unwrap();
    handle.flush().await.unwrap();
    assert_eq!(names(&handle.projection()), vec!["x"]);

    handle.remove_source(second.token()).await.unwrap();
    handle.flush().await.unwrap();
    assert!(handle.projection().page.is_empty());
}

#[tokio::test]
async fn test_violation_applies_nothing() {
    let handle = spawn(config());
    let feed = handle.add_query(None, "tab").await.unwrap();

    let mut batch = ListingBatch::new();
    batch
        .push_new(id("a"), offer("orb", 1, 1))
        .push_removed(id("ghost"), offer("orb", 0, 0));
    let err = feed.publish_batch(batch).await.unwrap_err();
    assert!(err.is_protocol_violation());

    handle.flush().await.unwrap();
    assert_eq!(handle.projection().counters.total(), 0);
    assert!(handle.errors()[0].message.contains("ghost"));
}

#[tokio::test]
async fn test_group_removal_takes_subtree() {
    let handle = spawn(config());
    let group = handle.add_group(None, "league").await.unwrap();
    let q1 = handle.add_query(Some(group), "q1").await.unwrap();
    let q2 = handle.add_query(Some(group), "q2").await.unwrap();

    let mut batch = ListingBatch::new();
    batch.push_new(id("a"), offer("orb", 1, 1));
    q1.publish_batch(batch).await.unwrap();
    let mut batch = ListingBatch::new();
    batch.push_new(id("b"), offer("orb", 2, 2));
    q2.publish_batch(batch).await.unwrap();
    handle.flush().await.unwrap();
    assert_eq!(handle.projection().counters.new_count, 2);
    assert_eq!(handle.source_status(q1.token()).unwrap().parent, Some(group));
    assert_eq!(handle.source_status(group).unwrap().kind, SourceKind::Group);

    let removed = handle.remove_source(group).await.unwrap();
    assert_eq!(removed.len(), 3);
    assert!(q1.is_cancelled() && q2.is_cancelled());
    handle.flush().await.unwrap();
    assert_eq!(handle.projection().counters.total(), 0);
    assert!(handle.sources().is_empty());
}

#[tokio::test]
async fn test_rehome_tears_down_old_contribution() {
    let handle = spawn(config());
    let feed = handle.add_query(None, "tab").await.unwrap();
    let mut batch = ListingBatch::new();
    batch.push_new(id("a"), offer("orb", 1, 1));
    feed.publish_batch(batch).await.unwrap();

    let replacement = handle.rehome_source(feed.token()).await.unwrap();
    assert!(feed.is_cancelled());
    assert_ne!(replacement.token(), feed.token());
    assert_eq!(handle.source_status(replacement.token()).unwrap().label, "tab");

    handle.flush().await.unwrap();
    assert_eq!(handle.projection().counters.total(), 0);

    let mut batch = ListingBatch::new();
    batch.push_new(id("b"), offer("orb", 2, 2));
    replacement.publish_batch(batch).await.unwrap();
    handle.flush().await.unwrap();
    assert_eq!(names(&handle.projection()), vec!["b"]);
}

#[tokio::test]
async fn test_verification_signal_forwarded() {
    let handle = spawn(config());
    let feed = handle.add_query(None, "tab").await.unwrap();
    let mut signals = handle.subscribe_verification();

    feed.require_verification("https://market.example/verify")
        .await
        .unwrap();
    let signal = timeout(Duration::from_secs(1), signals.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(signal.token, feed.token());
    assert_eq!(signal.uri, "https://market.example/verify");
}

#[tokio::test]
async fn test_source_errors_are_bounded() {
    let handle = spawn(PipelineConfig {
        error_log_capacity: 3,
        ..config()
    });
    let feed = handle.add_query(None, "tab").await.unwrap();
    for n in 0..5 {
        feed.report_error(format!("timeout {n}")).await.unwrap();
    }
    handle.flush().await.unwrap();

    let errors = handle.errors();
    assert_eq!(errors.len(), 3);
    assert_eq!(errors[0].message, "timeout 2");
    assert_eq!(errors[2].source, Some(feed.token()));
}

#[tokio::test]
async fn test_debounced_rebuilds_coalesce() {
    let handle = spawn(PipelineConfig {
        debounce_ms: 300,
        max_debounce_ms: 1200,
        ..PipelineConfig::default()
    });
    let mut rx = handle.subscribe();
    let feed = handle.add_query(None, "tab").await.unwrap();

    let mut batch = ListingBatch::new();
    batch
        .push_new(id("a"), offer("chaos orb", 1, 1))
        .push_new(id("b"), offer("divine orb", 2, 2))
        .push_new(id("c"), offer("mirror", 3, 3));
    feed.publish_batch(batch).await.unwrap();

    let counted = wait_for(&mut rx, |p| p.counters.new_count == 3).await;
    assert!(counted.page.is_empty());
    wait_for(&mut rx, |p| p.page.len() == 3).await;

    for text in ["c", "ch", "cha", "chao", "chaos"] {
        handle.set_quick_filter(text).await.unwrap();
    }
    let filtered = wait_for(&mut rx, |p| p.page.len() == 1).await;
    assert_eq!(names(&filtered), vec!["a"]);

    let text = handle.metrics().gather_text().unwrap();
    assert!(text.contains(r#"tradewatch_stage_rebuilds_total{stage="filter"} 2"#));
}

#[tokio::test]
async fn test_fault_is_isolated_per_source() {
    let handle = spawn(config());
    let broken = handle.add_query(None, "broken").await.unwrap();
    let healthy = handle.add_query(None, "healthy").await.unwrap();

    let mut batch = ListingBatch::new();
    batch.push_removed(id("ghost"), offer("orb", 0, 0));
    assert!(broken.publish_batch(batch).await.is_err());

    let mut batch = ListingBatch::new();
    batch.push_new(id("a"), offer("orb", 1, 1));
    let err = broken.publish_batch(batch).await.unwrap_err();
    assert!(matches!(err, PipelineError::SourceFaulted { .. }));

    let mut batch = ListingBatch::new();
    batch.push_new(id("a"), offer("orb", 1, 1));
    assert_eq!(healthy.publish_batch(batch).await.unwrap().created, 1);
    assert!(handle.source_status(healthy.token()).unwrap().faulted.is_none());
}
