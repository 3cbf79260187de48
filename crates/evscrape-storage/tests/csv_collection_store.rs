use evscrape_core::{Event, EventFields, FlagMarker};
use evscrape_storage::{export_events_csv, read_column_values, CollectionStore, CsvCollectionStore, StoreError};
use tempfile::tempdir;

fn cells(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[tokio::test]
async fn missing_file_reads_as_empty_collection() {
    let dir = tempdir().expect("tempdir");
    let store = CsvCollectionStore::new(dir.path().join("combined.csv"));
    let collection = store.read_all().await.expect("read");
    assert!(!collection.has_header());
    assert!(collection.rows.is_empty());
    assert_eq!(store.name(), "combined");
}

#[tokio::test]
async fn header_insert_and_delete_follow_snapshot_positions() {
    let dir = tempdir().expect("tempdir");
    let store = CsvCollectionStore::new(dir.path().join("events.csv"));

    store.write_header(&cells(&["title", "start_date"])).await.expect("header");
    store
        .insert_rows_at_top(&[cells(&["c", "3"]), cells(&["d", "4"])])
        .await
        .expect("insert");
    store
        .insert_rows_at_top(&[cells(&["a", "1"]), cells(&["b", "2"])])
        .await
        .expect("insert");

    let titles = |c: &evscrape_core::Collection| c.rows.iter().map(|r| r.cell(0).to_string()).collect::<Vec<_>>();
    let collection = store.read_all().await.expect("read");
    assert_eq!(titles(&collection), vec!["a", "b", "c", "d"]);

    store.delete_rows(&[4, 1]).await.expect("delete");
    let collection = store.read_all().await.expect("read");
    assert_eq!(collection.header, cells(&["title", "start_date"]));
    assert_eq!(titles(&collection), vec!["b", "c"]);
}

#[tokio::test]
async fn initialize_writes_header_and_rows_together() {
    let dir = tempdir().expect("tempdir");
    let store = CsvCollectionStore::new(dir.path().join("events.csv"));

    store
        .initialize(&cells(&["title", "start_date"]), &[cells(&["a", "1"]), cells(&["b", "2"])])
        .await
        .expect("initialize");

    let collection = store.read_all().await.expect("read");
    assert_eq!(collection.header, cells(&["title", "start_date"]));
    let rows = collection.rows.iter().map(|r| r.cells.clone()).collect::<Vec<_>>();
    assert_eq!(rows, vec![cells(&["a", "1"]), cells(&["b", "2"])]);
}

#[tokio::test]
async fn insert_into_headerless_file_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let store = CsvCollectionStore::new(dir.path().join("events.csv"));
    let err = store.insert_rows_at_top(&[cells(&["a"])]).await.unwrap_err();
    assert!(matches!(err, StoreError::Malformed(_)));
}

#[tokio::test]
async fn flag_marker_column_round_trips() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("events.csv");
    std::fs::write(&path, "flag,title\nok,A\n,B\n,C\n").expect("seed");
    let store = CsvCollectionStore::new(path.clone());

    let collection = store.read_all().await.expect("read");
    assert!(collection.rows.iter().all(|r| r.marker == FlagMarker::Unset));

    store.set_flagged(&[3]).await.expect("flag");
    let collection = store.read_all().await.expect("read");
    assert_eq!(collection.header, cells(&["flag", "title", "highlight"]));
    assert_eq!(collection.rows[2].marker, FlagMarker::Set);
    assert_eq!(collection.rows[0].marker, FlagMarker::Unset);
    assert_eq!(collection.rows[0].cell(0), "ok");
}

#[tokio::test]
async fn unreadable_path_is_backend_unavailable_not_empty() {
    let dir = tempdir().expect("tempdir");
    // A directory where the file should be cannot be read as a collection.
    let store = CsvCollectionStore::new(dir.path());
    let err = store.read_all().await.unwrap_err();
    assert!(matches!(err, StoreError::BackendUnavailable(_)));
}

#[tokio::test]
async fn export_writes_canonical_header_and_reads_back_columns() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("out").join("events.csv");
    let event = Event::new(EventFields {
        title: Some("Ladies' Night, Pearl".into()),
        start_date: Some("1 Jan".into()),
        source: Some("iloveqatar".into()),
        ..Default::default()
    })
    .expect("event");

    let written = export_events_csv(&path, &[event]).await.expect("export");
    assert_eq!(written, 1);

    let text = std::fs::read_to_string(&path).expect("read");
    assert!(text.starts_with("title,start_date,source,end_date,"));
    let titles = read_column_values(&path, "title").await.expect("titles");
    assert_eq!(titles, vec!["Ladies' Night, Pearl".to_string()]);
}
