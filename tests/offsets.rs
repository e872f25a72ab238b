// Offset-column collection arithmetic across pages and clusters.
use std::sync::Arc;

use colpage::api::{
    validate_dataset, ClusterSize, CollectionInfo, Column, ConnectColumns, ErrorKind,
    FieldDescriptor, MemStore, PageSink, PageSource, SinkOptions, SourceOptions,
    ValidationStatus,
};

/// One cluster per entry list; each entry is one collection of `f32` values.
fn write_collections(store: &Arc<MemStore>, clusters: &[Vec<Vec<f32>>], per_page: usize) {
    let mut sink = PageSink::new(
        store.clone(),
        "tracks",
        SinkOptions::new().with_elements_per_page(per_page),
    )
    .expect("sink");
    let mut offsets = Column::<ClusterSize>::new("tracks", false);
    let mut values = Column::<f32>::new("tracks._0", false).with_offset_column("tracks");
    let fields = vec![
        FieldDescriptor::new("tracks", "std::vector<float>"),
        FieldDescriptor::new("_0", "float").with_parent("tracks"),
    ];
    sink.create(fields, &mut [&mut offsets, &mut values])
        .expect("create");

    let mut entries = 0u64;
    for cluster in clusters {
        let mut cumulative = 0u32;
        for collection in cluster {
            values.append_v(&mut sink, collection).expect("values");
            cumulative += collection.len() as u32;
            offsets
                .append(&mut sink, &ClusterSize(cumulative))
                .expect("offset");
        }
        offsets.flush(&mut sink).expect("flush");
        values.flush(&mut sink).expect("flush");
        entries += cluster.len() as u64;
        sink.commit_cluster(entries).expect("cluster");
    }
    sink.commit_dataset().expect("dataset");
}

fn open_offsets(store: &Arc<MemStore>) -> (PageSource, Column<ClusterSize>) {
    let source =
        PageSource::attach(store.clone(), "tracks", SourceOptions::default()).expect("attach");
    let mut offsets = Column::<ClusterSize>::new("tracks", false);
    offsets.connect_source(&source).expect("connect");
    (source, offsets)
}

fn info(start: u64, size: u64) -> CollectionInfo {
    CollectionInfo { start, size }
}

#[test]
fn offsets_two_two_five_yield_expected_collections() {
    let store = Arc::new(MemStore::new());
    write_collections(
        &store,
        &[vec![vec![1.0, 2.0], vec![], vec![3.0, 4.0, 5.0]]],
        2,
    );
    let (source, mut offsets) = open_offsets(&store);
    let stored: Vec<u32> = offsets
        .read_v(&source, 0, 3)
        .expect("read_v")
        .into_iter()
        .map(|size| size.0)
        .collect();
    assert_eq!(stored, vec![2, 2, 5]);

    assert_eq!(offsets.collection_info(&source, 0).expect("0"), info(0, 2));
    assert_eq!(offsets.collection_info(&source, 1).expect("1"), info(2, 0));
    assert_eq!(offsets.collection_info(&source, 2).expect("2"), info(2, 3));
}

#[test]
fn cluster_boundaries_reset_collection_starts() {
    let store = Arc::new(MemStore::new());
    write_collections(
        &store,
        &[
            vec![vec![1.0, 2.0], vec![], vec![3.0, 4.0, 5.0]],
            vec![vec![6.0], vec![7.0, 8.0]],
        ],
        2,
    );
    let (source, mut offsets) = open_offsets(&store);
    let mut values = Column::<f32>::new("tracks._0", false);
    values.connect_source(&source).expect("connect");

    assert_eq!(offsets.collection_info(&source, 3).expect("3"), info(5, 1));
    assert_eq!(offsets.collection_info(&source, 4).expect("4"), info(6, 2));
    let second = offsets.collection_info(&source, 4).expect("4");
    assert_eq!(
        values
            .read_v(&source, second.start, second.size)
            .expect("values"),
        vec![7.0, 8.0]
    );
    assert_eq!(offsets.model().offset_column(), None);
    assert_eq!(values.model().offset_column(), Some("tracks"));
}

#[test]
fn empty_pointee_cluster_yields_empty_collections() {
    let store = Arc::new(MemStore::new());
    write_collections(
        &store,
        &[vec![vec![1.0], vec![2.0]], vec![vec![], vec![]], vec![vec![3.0]]],
        4,
    );
    let (source, mut offsets) = open_offsets(&store);
    assert_eq!(offsets.collection_info(&source, 2).expect("2"), info(0, 0));
    assert_eq!(offsets.collection_info(&source, 3).expect("3"), info(0, 0));
    assert_eq!(offsets.collection_info(&source, 4).expect("4"), info(2, 1));

    let report = validate_dataset(&source);
    assert_eq!(report.status, ValidationStatus::Ok, "{:?}", report.issues);
    assert_eq!(report.columns_checked, 2);
}

#[test]
fn collection_outside_range_is_a_usage_error() {
    let store = Arc::new(MemStore::new());
    write_collections(&store, &[vec![vec![1.0]]], 4);
    let (source, mut offsets) = open_offsets(&store);
    let err = offsets.collection_info(&source, 1).expect_err("past end");
    assert_eq!(err.kind(), ErrorKind::Usage);
}

#[test]
fn validation_flags_offsets_that_miscount_the_pointee() {
    let store = Arc::new(MemStore::new());
    let mut sink = PageSink::new(store.clone(), "tracks", SinkOptions::new())
        .expect("sink");
    let mut offsets = Column::<ClusterSize>::new("tracks", false);
    let mut values = Column::<f32>::new("tracks._0", false).with_offset_column("tracks");
    sink.create(Vec::new(), &mut [&mut offsets, &mut values])
        .expect("create");
    offsets.append(&mut sink, &ClusterSize(3)).expect("offset");
    offsets.append(&mut sink, &ClusterSize(1)).expect("offset");
    values.append_v(&mut sink, &[1.0, 2.0]).expect("values");
    offsets.flush(&mut sink).expect("flush");
    values.flush(&mut sink).expect("flush");
    sink.commit_cluster(2).expect("cluster");
    sink.commit_dataset().expect("dataset");

    let (source, mut offsets) = open_offsets(&store);
    let report = validate_dataset(&source);
    assert_eq!(report.status, ValidationStatus::Corrupt);
    let codes: Vec<&str> = report.issues.iter().map(|issue| issue.code.as_str()).collect();
    assert!(codes.contains(&"offset_order"), "{codes:?}");
    assert!(codes.contains(&"offset_total"), "{codes:?}");

    let err = offsets.collection_info(&source, 1).expect_err("decreasing");
    assert_eq!(err.kind(), ErrorKind::Corrupt);
}
