// Damaged records must surface as errors naming the column, cluster and page.
use std::sync::Arc;

use colpage::api::{
    validate_dataset, Column, ConnectColumns, DatasetKeys, ErrorKind, MemStore, PageSink,
    PageSource, RecordStore, SinkOptions, SourceOptions, ValidationStatus,
};

const RECORD_BODY_LEN_AT: usize = 16;
const PAYLOAD_LEN_AT: usize = 32;
const CONTENT_AT: usize = 48;

/// Two clusters of `Int32` values, four per page.
fn write_ints(store: &Arc<MemStore>) {
    let mut sink = PageSink::new(
        store.clone(),
        "ints",
        SinkOptions::new().with_elements_per_page(4),
    )
    .expect("sink");
    let mut column = Column::<i32>::new("x", true);
    sink.create(Vec::new(), &mut [&mut column]).expect("create");
    column
        .append_v(&mut sink, &[1, 2, 3, 4, 5, 6])
        .expect("append");
    column.flush(&mut sink).expect("flush");
    sink.commit_cluster(6).expect("cluster");
    column.append_v(&mut sink, &[7, 8]).expect("append");
    column.flush(&mut sink).expect("flush");
    sink.commit_cluster(8).expect("cluster");
    sink.commit_dataset().expect("dataset");
}

/// Rewrites a page record so it carries `content_len` content bytes with consistent lengths.
fn resize_page(store: &MemStore, key: &str, content_len: usize) {
    let record = store.get(key).expect("get").expect("page record");
    let mut buf = record.to_vec();
    buf.resize(CONTENT_AT + content_len, 0xEE);
    let body_len = (buf.len() - 32) as u64;
    buf[RECORD_BODY_LEN_AT..RECORD_BODY_LEN_AT + 8].copy_from_slice(&body_len.to_le_bytes());
    buf[PAYLOAD_LEN_AT..PAYLOAD_LEN_AT + 8].copy_from_slice(&(content_len as u64).to_le_bytes());
    store.put(key, &buf).expect("put");
}

fn attach(store: &Arc<MemStore>) -> PageSource {
    PageSource::attach(store.clone(), "ints", SourceOptions::default()).expect("attach")
}

fn reader(source: &PageSource) -> Column<i32> {
    let mut column = Column::<i32>::new("x", true);
    column.connect_source(source).expect("connect");
    column
}

#[test]
fn page_length_not_divisible_by_count_is_corrupt() {
    let store = Arc::new(MemStore::new());
    write_ints(&store);
    let keys = DatasetKeys::new("ints");
    resize_page(&store, &keys.page(0, 0, 1), 7);

    let source = attach(&store);
    let mut column = reader(&source);
    assert_eq!(column.read(&source, 3).expect("intact page"), 4);
    let err = column.read(&source, 4).expect_err("corrupt page");
    assert_eq!(err.kind(), ErrorKind::Corrupt);
    assert_eq!(err.column(), Some(0));
    assert_eq!(err.cluster(), Some(0));
    assert_eq!(err.page(), Some(1));
}

#[test]
fn element_size_mismatch_is_corrupt() {
    let store = Arc::new(MemStore::new());
    write_ints(&store);
    let keys = DatasetKeys::new("ints");
    // Two elements at two bytes each divides evenly but is not an int32 page.
    resize_page(&store, &keys.page(1, 0, 0), 4);

    let source = attach(&store);
    let mut column = reader(&source);
    let err = column.read(&source, 7).expect_err("corrupt page");
    assert_eq!(err.kind(), ErrorKind::Corrupt);
    assert_eq!(err.cluster(), Some(1));
    assert_eq!(err.page(), Some(0));
}

#[test]
fn truncated_envelope_is_corrupt() {
    let store = Arc::new(MemStore::new());
    write_ints(&store);
    let key = DatasetKeys::new("ints").page(0, 0, 0);
    let record = store.get(&key).expect("get").expect("record");
    store.put(&key, &record[..record.len() - 3]).expect("put");

    let source = attach(&store);
    let mut column = reader(&source);
    let err = column.read(&source, 0).expect_err("truncated");
    assert_eq!(err.kind(), ErrorKind::Corrupt);
    assert_eq!(err.key(), Some(key.as_str()));
}

#[test]
fn missing_page_record_is_not_found() {
    let store = Arc::new(MemStore::new());
    write_ints(&store);
    let key = DatasetKeys::new("ints").page(1, 0, 0);
    store.remove(&key).expect("present");

    let source = attach(&store);
    let mut column = reader(&source);
    let err = column.read(&source, 6).expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.key(), Some(key.as_str()));
}

#[test]
fn cluster_footer_damage_fails_attach() {
    let store = Arc::new(MemStore::new());
    write_ints(&store);
    let key = DatasetKeys::new("ints").cluster_footer(1);
    let record = store.get(&key).expect("get").expect("record");
    let mut buf = record.to_vec();
    buf[0] = b'X';
    store.put(&key, &buf).expect("put");

    let err = PageSource::attach(store.clone(), "ints", SourceOptions::default())
        .expect_err("bad footer");
    assert_eq!(err.kind(), ErrorKind::Corrupt);
    assert_eq!(err.cluster(), Some(1));
}

#[test]
fn validation_reports_every_damaged_page() {
    let store = Arc::new(MemStore::new());
    write_ints(&store);
    let keys = DatasetKeys::new("ints");
    resize_page(&store, &keys.page(0, 0, 1), 3);
    resize_page(&store, &keys.page(1, 0, 0), 4);

    let source = attach(&store);
    let report = validate_dataset(&source);
    assert_eq!(report.status, ValidationStatus::Corrupt);
    assert_eq!(report.issue_count, 2);
    assert_eq!(report.pages_checked, 1);
    let pages: Vec<(Option<u64>, Option<u64>)> = report
        .issues
        .iter()
        .map(|issue| (issue.cluster, issue.page))
        .collect();
    assert_eq!(pages, vec![(Some(0), Some(1)), (Some(1), Some(0))]);
}
