//! Catalog Integration Tests
//!
//! End-to-end tests through the public facades against the in-memory store.

use std::collections::HashSet;
use std::time::Duration;

use bson::doc;
use chrono::{DateTime, TimeZone, Utc};
use satcat::storage::{MemoryConnector, RetryPolicy};
use satcat::{
    CatalogRecord, FilterError, FilterSpec, Operator, PaginationSpec, Polygon, Projection,
    RecordPatch, SortDirection, StorageBuilder, StorageError, StorageHandles,
};

// =============================================================================
// Test Helpers
// =============================================================================

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        jitter: false,
    }
}

fn setup() -> (MemoryConnector, StorageHandles<MemoryConnector>) {
    let connector = MemoryConnector::new();
    let handles = StorageBuilder::new(connector.clone())
        .retry_policy(fast_retry())
        .build();
    (connector, handles)
}

fn record(uid: &str, platform: &str, created: i64) -> CatalogRecord {
    CatalogRecord::new(uid, "l1b", "hrpt", platform, format!("s3://bucket/{uid}"))
        .with_creation_time(ts(created))
}

async fn seed_records(handles: &StorageHandles<MemoryConnector>, records: Vec<CatalogRecord>) {
    for r in records {
        handles.writer.create(r).await.unwrap();
    }
}

fn uids(records: &[CatalogRecord]) -> Vec<&str> {
    records.iter().map(|r| r.uid.as_str()).collect()
}

// =============================================================================
// Query Tests
// =============================================================================

#[tokio::test]
async fn test_filtered_first_page_in_creation_order() {
    let (_connector, handles) = setup();
    seed_records(
        &handles,
        vec![
            record("a1", "NOAA-19", 4).with_time_range(ts(100), ts(200)),
            record("a2", "NOAA-19", 1).with_time_range(ts(300), ts(400)),
            record("a3", "NOAA-19", 2).with_time_range(ts(50), ts(60)),
            record("a4", "NOAA-19", 3).with_time_range(ts(500), ts(600)),
            record("b1", "Metop-B", 0).with_time_range(ts(500), ts(600)),
        ],
    )
    .await;

    let filter = FilterSpec::all_of(vec![
        FilterSpec::eq("platform_name", "NOAA-19"),
        FilterSpec::condition("start_time", Operator::Gte, ts(100).to_rfc3339()),
    ]);
    let page = handles
        .reader
        .search(&filter, &PaginationSpec::default().with_page_size(2))
        .await
        .unwrap();

    assert_eq!(uids(&page.records), vec!["a2", "a4"]);
    assert_eq!(page.page_size, 2);
    assert!(page.next_cursor.is_some());

    let next = handles
        .reader
        .search(
            &filter,
            &PaginationSpec::default()
                .with_page_size(2)
                .with_cursor(page.next_cursor.unwrap()),
        )
        .await
        .unwrap();
    assert_eq!(uids(&next.records), vec!["a1"]);
    assert!(next.next_cursor.is_none());
}

#[tokio::test]
async fn test_unknown_field_is_rejected() {
    let (connector, handles) = setup();
    let err = handles
        .reader
        .search(&FilterSpec::eq("foo", "bar"), &PaginationSpec::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::Filter(FilterError::UnknownField { ref field }) if field == "foo"
    ));
    // Rejected before touching the store.
    assert_eq!(connector.connect_count(), 0);
}

#[tokio::test]
async fn test_cursor_traversal_visits_every_record_once() {
    let (_connector, handles) = setup();
    // Shared creation times force the uid tiebreak.
    let records = (0..7)
        .map(|i| record(&format!("r{i}"), "NOAA-19", i / 3))
        .collect();
    seed_records(&handles, records).await;

    let mut seen = Vec::new();
    let mut spec = PaginationSpec::default()
        .with_page_size(3)
        .sorted_by("creation_time", SortDirection::Desc);
    loop {
        let page = handles.reader.search(&FilterSpec::all(), &spec).await.unwrap();
        seen.extend(page.records.iter().map(|r| r.uid.clone()));
        match page.next_cursor {
            Some(cursor) => spec = spec.with_cursor(cursor),
            None => break,
        }
    }

    assert_eq!(seen.len(), 7);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 7);
    assert_eq!(seen, vec!["r6", "r3", "r4", "r5", "r0", "r1", "r2"]);
}

#[tokio::test]
async fn test_oversized_page_is_clamped() {
    let connector = MemoryConnector::new();
    let handles = StorageBuilder::new(connector)
        .page_limits(satcat::storage::PageLimits {
            default_page_size: 2,
            max_page_size: 3,
        })
        .build();
    let records = (0..5)
        .map(|i| record(&format!("r{i}"), "NOAA-19", i))
        .collect();
    seed_records(&handles, records).await;

    let clamped = handles
        .reader
        .search(&FilterSpec::all(), &PaginationSpec::default().with_page_size(500))
        .await
        .unwrap();
    let at_max = handles
        .reader
        .search(&FilterSpec::all(), &PaginationSpec::default().with_page_size(3))
        .await
        .unwrap();
    assert_eq!(clamped.page_size, 3);
    assert_eq!(clamped, at_max);

    let defaulted = handles
        .reader
        .search(&FilterSpec::all(), &PaginationSpec::default())
        .await
        .unwrap();
    assert_eq!(defaulted.records.len(), 2);
}

#[tokio::test]
async fn test_total_and_offset() {
    let (_connector, handles) = setup();
    let records = (0..4)
        .map(|i| record(&format!("r{i}"), "NOAA-19", i))
        .collect();
    seed_records(&handles, records).await;

    let page = handles
        .reader
        .search(
            &FilterSpec::all(),
            &PaginationSpec::default()
                .with_page_size(2)
                .with_offset(2)
                .with_total(),
        )
        .await
        .unwrap();
    assert_eq!(uids(&page.records), vec!["r2", "r3"]);
    assert_eq!(page.total, Some(4));
    assert!(page.next_cursor.is_none());
}

#[tokio::test]
async fn test_query_with_projection() {
    let (_connector, handles) = setup();
    seed_records(
        &handles,
        vec![record("a1", "NOAA-19", 0).with_tag("night").with_sensor("avhrr")],
    )
    .await;

    let projection = handles.reader.projection(["platform_name", "tags"]).unwrap();
    let payload = handles
        .reader
        .query(&FilterSpec::all(), &PaginationSpec::default(), &projection)
        .await
        .unwrap();

    assert_eq!(payload.page.returned, 1);
    let rendered = payload.records[0].as_object().unwrap();
    let mut keys: Vec<_> = rendered.keys().cloned().collect();
    keys.sort();
    assert_eq!(keys, vec!["platform_name", "tags", "uid"]);
    assert_eq!(rendered["tags"], serde_json::json!(["night"]));

    assert!(handles.reader.projection(["nope"]).is_err());
}

#[tokio::test]
async fn test_within_boundary_query() {
    let (_connector, handles) = setup();
    let inside = Polygon::new(vec![[1.0, 1.0], [2.0, 1.0], [2.0, 2.0]]).unwrap();
    let outside = Polygon::new(vec![[20.0, 20.0], [21.0, 20.0], [21.0, 21.0]]).unwrap();
    seed_records(
        &handles,
        vec![
            record("in", "NOAA-19", 0).with_boundary(inside),
            record("out", "NOAA-19", 1).with_boundary(outside),
            record("none", "NOAA-19", 2),
        ],
    )
    .await;

    let region = serde_json::json!({
        "type": "Polygon",
        "coordinates": [[[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [0.0, 0.0]]],
    });
    let page = handles
        .reader
        .search(
            &FilterSpec::condition("boundary", Operator::WithinBoundary, region),
            &PaginationSpec::default(),
        )
        .await
        .unwrap();
    assert_eq!(uids(&page.records), vec!["in"]);
}

#[tokio::test]
async fn test_out_of_range_coordinates_are_rejected() {
    let (connector, handles) = setup();
    assert!(Polygon::new(vec![[0.0, 0.0], [500.0, 0.0], [500.0, 120.0]]).is_none());

    let raw = doc! {
        "uid": "far-away",
        "file_type": "l1b",
        "file_format": "hrpt",
        "platform_name": "NOAA-19",
        "uris": ["s3://bucket/far-away"],
        "creation_time": "2024-01-02T00:00:00Z",
        "boundary": {
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [500.0, 0.0], [500.0, 120.0], [0.0, 0.0]]],
        },
    };
    let err = handles.writer.create_from_document(&raw).await.unwrap_err();
    assert!(matches!(err, StorageError::Validation(_)));
    assert!(connector.is_empty());

    let region = serde_json::json!([[0.0, 0.0], [200.0, 0.0], [200.0, 10.0]]);
    let err = handles
        .reader
        .search(
            &FilterSpec::condition("boundary", Operator::WithinBoundary, region),
            &PaginationSpec::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::Filter(FilterError::InvalidValue { .. })
    ));
}

#[tokio::test]
async fn test_distinct_and_time_extent() {
    let (_connector, handles) = setup();
    seed_records(
        &handles,
        vec![
            record("a1", "NOAA-19", 0).with_time_range(ts(100), ts(150)),
            record("a2", "NOAA-18", 1).with_time_range(ts(50), ts(400)),
            record("a3", "NOAA-19", 2),
            record("b1", "Metop-B", 3).with_time_range(ts(10), ts(20)),
        ],
    )
    .await;

    let platforms = handles
        .reader
        .distinct("platform_name", &FilterSpec::all())
        .await
        .unwrap();
    assert_eq!(platforms, vec!["Metop-B", "NOAA-18", "NOAA-19"]);

    let err = handles
        .reader
        .distinct("start_time", &FilterSpec::all())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::Filter(FilterError::IncompatibleOperator { .. })
    ));

    let noaa = FilterSpec::condition(
        "platform_name",
        Operator::In,
        serde_json::json!(["NOAA-18", "NOAA-19"]),
    );
    let extent = handles.reader.time_extent(&noaa).await.unwrap();
    let earliest = extent.earliest_start.unwrap();
    assert_eq!((earliest.uid.as_str(), earliest.time), ("a2", ts(50)));
    assert_eq!(extent.latest_start.unwrap().uid, "a1");
    assert_eq!(extent.earliest_end.unwrap().uid, "a1");
    assert_eq!(extent.latest_end.unwrap().time, ts(400));

    let empty = handles
        .reader
        .time_extent(&FilterSpec::eq("platform_name", "GOES-16"))
        .await
        .unwrap();
    assert_eq!(empty, satcat::TimeExtent::default());
}

// =============================================================================
// Write Tests
// =============================================================================

#[tokio::test]
async fn test_create_then_read_round_trip() {
    let (_connector, handles) = setup();
    let original = record("a1", "NOAA-19", 0)
        .with_sensor("avhrr")
        .with_time_range(ts(10), ts(20))
        .with_uri("file:///archive/a1")
        .with_tag("night");
    handles.writer.create(original.clone()).await.unwrap();

    let stored = handles.reader.record("a1").await.unwrap();
    assert_eq!(stored, original);

    let rendered = handles.reader.get("a1", &Projection::all()).await.unwrap();
    assert_eq!(rendered["start_time"], "2023-11-14T22:13:30.000Z");
    assert_eq!(rendered["boundary"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_duplicate_create_keeps_existing_record() {
    let (_connector, handles) = setup();
    handles
        .writer
        .create(record("a1", "NOAA-19", 0))
        .await
        .unwrap();

    let err = handles
        .writer
        .create(record("a1", "Metop-B", 5))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::DuplicateKey { ref uid } if uid == "a1"));

    let stored = handles.reader.record("a1").await.unwrap();
    assert_eq!(stored.platform_name, "NOAA-19");
}

#[tokio::test]
async fn test_create_from_document() {
    let (_connector, handles) = setup();
    let raw = doc! {
        "uid": "doc-1",
        "file_type": "l1b",
        "file_format": "hrpt",
        "platform_name": "NOAA-19",
        "start_time": "2024-01-01T00:00:00Z",
        "end_time": "2024-01-01T00:10:00Z",
        "uris": ["s3://bucket/doc-1"],
        "creation_time": "2024-01-02T00:00:00Z",
    };
    let created = handles.writer.create_from_document(&raw).await.unwrap();
    assert_eq!(handles.reader.record("doc-1").await.unwrap(), created);

    let invalid = doc! { "uid": "doc-2", "file_type": "l1b" };
    let err = handles.writer.create_from_document(&invalid).await.unwrap_err();
    assert!(matches!(err, StorageError::Validation(_)));
}

#[tokio::test]
async fn test_archive_is_idempotent() {
    let (_connector, handles) = setup();
    handles
        .writer
        .create(record("a1", "NOAA-19", 0))
        .await
        .unwrap();

    let first = handles
        .writer
        .update("a1", &RecordPatch::archive(true))
        .await
        .unwrap();
    let second = handles
        .writer
        .update("a1", &RecordPatch::archive(true))
        .await
        .unwrap();
    assert!(first.is_archived);
    assert_eq!(first, second);
    assert!(handles.reader.record("a1").await.unwrap().is_archived);
}

#[tokio::test]
async fn test_update_rejects_removing_last_uri() {
    let (_connector, handles) = setup();
    handles
        .writer
        .create(record("a1", "NOAA-19", 0))
        .await
        .unwrap();

    let patch = RecordPatch {
        remove_uris: vec!["s3://bucket/a1".to_string()],
        ..Default::default()
    };
    let err = handles.writer.update("a1", &patch).await.unwrap_err();
    assert!(matches!(err, StorageError::Validation(_)));
    assert_eq!(handles.reader.record("a1").await.unwrap().uris.len(), 1);
}

#[tokio::test]
async fn test_delete_then_lookup_is_not_found() {
    let (_connector, handles) = setup();
    handles
        .writer
        .create(record("a1", "NOAA-19", 0).with_tag("night"))
        .await
        .unwrap();

    handles.writer.delete("a1").await.unwrap();
    assert!(matches!(
        handles.reader.record("a1").await,
        Err(StorageError::NotFound { .. })
    ));
    assert!(matches!(
        handles.writer.delete("a1").await,
        Err(StorageError::NotFound { .. })
    ));
    assert!(matches!(
        handles.writer.update("a1", &RecordPatch::archive(true)).await,
        Err(StorageError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_corrupt_stored_record_is_reported() {
    let (connector, handles) = setup();
    connector
        .seed(doc! { "uid": "bad", "file_type": 42, "creation_time": "yesterday" })
        .unwrap();

    assert!(matches!(
        handles.reader.record("bad").await,
        Err(StorageError::CorruptRecord { ref uid, .. }) if uid == "bad"
    ));
}

// =============================================================================
// Connection Tests
// =============================================================================

#[tokio::test]
async fn test_unavailable_store_leaves_no_partial_state() {
    let (connector, handles) = setup();
    connector.set_available(false);

    let err = handles
        .writer
        .create(record("a1", "NOAA-19", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Connection { attempts: 3, .. }));
    assert!(connector.is_empty());

    let err = handles
        .reader
        .search(&FilterSpec::all(), &PaginationSpec::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Connection { .. }));

    connector.set_available(true);
    assert!(matches!(
        handles.reader.record("a1").await,
        Err(StorageError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_outage_after_connect_recovers() {
    let (connector, handles) = setup();
    handles
        .writer
        .create(record("a1", "NOAA-19", 0))
        .await
        .unwrap();
    assert!(handles.admin.is_connected().await);

    connector.set_available(false);
    assert!(!handles.admin.health_check().await);
    assert!(!handles.admin.is_connected().await);
    assert!(handles.reader.record("a1").await.is_err());

    connector.set_available(true);
    assert!(handles.admin.health_check().await);
    assert_eq!(handles.reader.record("a1").await.unwrap().uid, "a1");
}

#[tokio::test]
async fn test_reconnect_and_shutdown() {
    let (connector, handles) = setup();
    handles.admin.reconnect().await.unwrap();
    handles.admin.reconnect().await.unwrap();
    assert_eq!(connector.connect_count(), 2);

    handles.admin.close().await;
    assert!(!handles.admin.is_connected().await);

    // Lazily reconnects on the next call.
    handles.reader.record("missing").await.unwrap_err();
    assert!(handles.admin.is_connected().await);

    handles.shutdown().await;
}
