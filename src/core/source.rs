//! Purpose: Read side of page storage: attach to a committed dataset and page columns in on demand.
//! Exports: `PageSource`, `SourceOptions`, `PageLocator`, `ClusterRange`.
//! Role: Derives the per-column page index at attach time; fetches and pools page records.
//! Invariants: Locators of a column are sorted by `range_start` and tile `[0, n_elements)`.
//! Invariants: A populated page's element size equals its column type's size, or the read fails.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::core::allocator::PageAllocator;
use crate::core::descriptor::{
    page_payload_decode, ClusterFooter, ColumnId, ColumnModel, DatasetFooter, DatasetHeader,
    FieldDescriptor,
};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::format::DatasetKeys;
use crate::core::page::{ClusterInfo, Page};
use crate::core::page_pool::{PageDeleter, PagePool};
use crate::core::sink::{validate_dataset_name, ColumnHandle};
use crate::core::store::RecordStore;

pub const DEFAULT_POOL_IDLE_PAGES: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SourceOptions {
    pub pool_idle_pages: usize,
}

impl SourceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool_idle_pages(mut self, pool_idle_pages: usize) -> Self {
        self.pool_idle_pages = pool_idle_pages;
        self
    }
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            pool_idle_pages: DEFAULT_POOL_IDLE_PAGES,
        }
    }
}

/// Where one stored page lives and which global indices it covers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageLocator {
    pub range_start: u64,
    pub n_elements: u64,
    pub cluster_id: u64,
    pub page_in_cluster: u64,
    pub self_offset: u64,
    pub pointee_offset: Option<u64>,
}

impl PageLocator {
    pub fn range_end(&self) -> u64 {
        self.range_start + self.n_elements
    }

    fn cluster_info(&self) -> ClusterInfo {
        ClusterInfo {
            cluster_id: self.cluster_id,
            self_offset: self.self_offset,
            pointee_offset: self.pointee_offset,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClusterRange {
    pub cluster_id: u64,
    pub entry_range_start: u64,
    pub n_entries: u64,
}

#[derive(Debug)]
struct ColumnIndex {
    model: ColumnModel,
    pointee: Option<ColumnId>,
    n_elements: u64,
    locators: Vec<PageLocator>,
}

pub struct PageSource {
    store: Arc<dyn RecordStore>,
    dataset: String,
    keys: DatasetKeys,
    options: SourceOptions,
    fields: Vec<FieldDescriptor>,
    columns: Vec<ColumnIndex>,
    ids: HashMap<String, ColumnId>,
    clusters: Vec<ClusterRange>,
    n_entries: u64,
    pool: PagePool,
    page_fetches: AtomicU64,
}

impl PageSource {
    /// Reads header, cluster footers and footer of `dataset` and builds the page index.
    pub fn attach(
        store: Arc<dyn RecordStore>,
        dataset: &str,
        options: SourceOptions,
    ) -> Result<Self> {
        validate_dataset_name(dataset)?;
        let keys = DatasetKeys::new(dataset);

        let header = DatasetHeader::decode(&fetch_record(store.as_ref(), &keys.header())?)
            .map_err(|err| err.with_key(keys.header()))?;
        let footer = DatasetFooter::decode(&fetch_record(store.as_ref(), &keys.footer())?)
            .map_err(|err| err.with_key(keys.footer()))?;
        let n_columns = header.columns.len();
        if footer.n_elements_per_column.len() != n_columns {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!(
                    "footer lists {} columns, header {n_columns}",
                    footer.n_elements_per_column.len()
                ))
                .with_key(keys.footer()));
        }

        let mut ids = HashMap::with_capacity(n_columns);
        for (id, model) in header.columns.iter().enumerate() {
            if ids.insert(model.name().to_string(), id as ColumnId).is_some() {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!("duplicate column name '{}'", model.name()))
                    .with_column(id as ColumnId));
            }
        }
        let mut columns: Vec<ColumnIndex> = header
            .columns
            .iter()
            .zip(&footer.n_elements_per_column)
            .map(|(model, n_elements)| ColumnIndex {
                model: model.clone(),
                pointee: None,
                n_elements: *n_elements,
                locators: Vec::new(),
            })
            .collect();
        for (id, model) in header.columns.iter().enumerate() {
            let Some(parent) = model.offset_column() else {
                continue;
            };
            let Some(&parent_id) = ids.get(parent) else {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!("unknown offset column '{parent}'"))
                    .with_column(id as ColumnId));
            };
            let parent = &mut columns[parent_id as usize];
            if parent.pointee.is_none() {
                parent.pointee = Some(id as ColumnId);
            }
        }

        let mut clusters = Vec::new();
        let mut entries = 0u64;
        for cluster_id in 0..footer.n_clusters {
            let key = keys.cluster_footer(cluster_id);
            let cluster = ClusterFooter::decode(&fetch_record(store.as_ref(), &key)?)
                .map_err(|err| err.with_key(key.clone()).with_cluster(cluster_id))?;
            if cluster.pages_per_column.len() != n_columns {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!(
                        "cluster footer lists {} columns, header {n_columns}",
                        cluster.pages_per_column.len()
                    ))
                    .with_key(key)
                    .with_cluster(cluster_id));
            }
            if cluster.entry_range_start != entries {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!(
                        "cluster starts at entry {} but {entries} precede it",
                        cluster.entry_range_start
                    ))
                    .with_key(key)
                    .with_cluster(cluster_id));
            }
            index_cluster(&mut columns, cluster_id, &cluster);
            clusters.push(ClusterRange {
                cluster_id,
                entry_range_start: cluster.entry_range_start,
                n_entries: cluster.n_entries,
            });
            entries += cluster.n_entries;
        }
        if entries != footer.n_entries {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!(
                    "clusters hold {entries} entries, footer {}",
                    footer.n_entries
                ))
                .with_key(keys.footer()));
        }
        for (id, column) in columns.iter_mut().enumerate() {
            size_locators(id as ColumnId, column)?;
        }

        tracing::debug!(
            dataset,
            columns = n_columns,
            clusters = clusters.len(),
            entries,
            "dataset attached"
        );
        Ok(Self {
            store,
            dataset: dataset.to_string(),
            keys,
            options,
            fields: header.fields,
            columns,
            ids,
            clusters,
            n_entries: entries,
            pool: PagePool::new(options.pool_idle_pages),
            page_fetches: AtomicU64::new(0),
        })
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn options(&self) -> SourceOptions {
        self.options
    }

    /// Looks up a stored column; the stored model must match `model`.
    pub fn add_column(&self, model: &ColumnModel) -> Result<ColumnHandle> {
        let Some(&id) = self.ids.get(model.name()) else {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message(format!("no column named '{}'", model.name()))
                .with_hint("Use `colpage info` to list the stored columns."));
        };
        let stored = &self.columns[id as usize].model;
        if !stored.same_storage(model) {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!(
                    "column '{}' is stored as {} (sorted: {}), requested {} (sorted: {})",
                    model.name(),
                    stored.column_type().name(),
                    stored.is_sorted(),
                    model.column_type().name(),
                    model.is_sorted()
                ))
                .with_column(id));
        }
        Ok(ColumnHandle {
            id,
            column_type: stored.column_type(),
        })
    }

    /// Handle of the stored column `name`, whatever its type.
    pub fn column_handle(&self, name: &str) -> Result<ColumnHandle> {
        let Some(&id) = self.ids.get(name) else {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message(format!("no column named '{name}'")));
        };
        Ok(ColumnHandle {
            id,
            column_type: self.columns[id as usize].model.column_type(),
        })
    }

    /// Page of `handle` covering `index`, from the pool or freshly fetched.
    pub fn populate_page(&self, handle: ColumnHandle, index: u64) -> Result<Arc<Page>> {
        let column = self.column(handle)?;
        if index >= column.n_elements {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "index {index} out of range for column '{}' ({} elements)",
                    column.model.name(),
                    column.n_elements
                ))
                .with_column(handle.id));
        }
        let locator = find_locator(&column.locators, index).ok_or_else(|| {
            Error::new(ErrorKind::Internal)
                .with_message(format!("no page covers index {index}"))
                .with_column(handle.id)
        })?;
        let page_context = |err: Error| {
            err.with_column(handle.id)
                .with_cluster(locator.cluster_id)
                .with_page(locator.page_in_cluster)
        };

        self.pool
            .get_or_populate(handle.id, index, locator.range_start, || {
                let key = self
                    .keys
                    .page(locator.cluster_id, handle.id, locator.page_in_cluster);
                let record = fetch_record(self.store.as_ref(), &key).map_err(page_context)?;
                self.page_fetches.fetch_add(1, Ordering::Relaxed);
                let content = page_payload_decode(&record)
                    .map_err(|err| page_context(err.with_key(key.clone())))?;

                let n_elements = usize::try_from(locator.n_elements).map_err(|_| {
                    page_context(
                        Error::new(ErrorKind::Corrupt).with_message("page element count overflow"),
                    )
                })?;
                let size = content.len();
                if size % n_elements != 0 {
                    return Err(page_context(
                        Error::new(ErrorKind::Corrupt)
                            .with_message(format!(
                                "page holds {size} bytes, not a multiple of {n_elements} elements"
                            ))
                            .with_key(key),
                    ));
                }
                let element_size = size / n_elements;
                if element_size != column.model.element_size() {
                    return Err(page_context(
                        Error::new(ErrorKind::Corrupt)
                            .with_message(format!(
                                "page element size {element_size} does not match {} ({} bytes)",
                                column.model.column_type().name(),
                                column.model.element_size()
                            ))
                            .with_key(key),
                    ));
                }

                let mut page = PageAllocator::new_record_page(
                    handle.id,
                    record.slice(content),
                    element_size,
                    n_elements,
                );
                page.set_window(locator.range_start, locator.cluster_info());
                tracing::trace!(
                    column = handle.id,
                    cluster = locator.cluster_id,
                    page = locator.page_in_cluster,
                    index,
                    "page pool miss"
                );
                Ok((page, record_deleter(record)))
            })
    }

    pub fn release_page(&self, page: Arc<Page>) {
        self.pool.return_page(page);
    }

    pub fn n_entries(&self) -> u64 {
        self.n_entries
    }

    pub fn n_elements(&self, handle: ColumnHandle) -> Result<u64> {
        Ok(self.column(handle)?.n_elements)
    }

    pub fn column_id(&self, handle: ColumnHandle) -> Result<ColumnId> {
        self.column(handle).map(|_| handle.id)
    }

    pub fn column_model(&self, handle: ColumnHandle) -> Result<&ColumnModel> {
        Ok(&self.column(handle)?.model)
    }

    /// Column whose elements the offsets of `handle` count, if any column links to it.
    pub fn pointee(&self, handle: ColumnHandle) -> Result<Option<ColumnId>> {
        Ok(self.column(handle)?.pointee)
    }

    pub fn page_locators(&self, handle: ColumnHandle) -> Result<&[PageLocator]> {
        Ok(&self.column(handle)?.locators)
    }

    /// Fields without a parent, in header order.
    pub fn root_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|field| field.is_root())
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnModel> {
        self.columns.iter().map(|column| &column.model)
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn clusters(&self) -> &[ClusterRange] {
        &self.clusters
    }

    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    /// Page payload records fetched from the store so far.
    pub fn page_fetches(&self) -> u64 {
        self.page_fetches.load(Ordering::Relaxed)
    }

    fn column(&self, handle: ColumnHandle) -> Result<&ColumnIndex> {
        match self.columns.get(handle.id as usize) {
            Some(column) if column.model.column_type() == handle.column_type => Ok(column),
            _ => Err(Error::new(ErrorKind::Usage)
                .with_message("unknown column handle")
                .with_column(handle.id)),
        }
    }
}

impl std::fmt::Debug for PageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSource")
            .field("dataset", &self.dataset)
            .field("columns", &self.columns.len())
            .field("clusters", &self.clusters.len())
            .field("n_entries", &self.n_entries)
            .field("pool", &self.pool)
            .finish()
    }
}

fn fetch_record(store: &dyn RecordStore, key: &str) -> Result<Bytes> {
    store
        .get(key)
        .map_err(|err| err.with_key(key))?
        .ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message("record not found")
                .with_key(key)
        })
}

fn record_deleter(record: Bytes) -> PageDeleter {
    PageDeleter::new(move |page| {
        tracing::trace!(
            column = page.column_id(),
            range_first = page.range_first(),
            bytes = record.len(),
            "page record released"
        );
        drop(record);
    })
}

/// Rightmost locator whose range starts at or before `index`.
fn find_locator(locators: &[PageLocator], index: u64) -> Option<PageLocator> {
    let pos = locators.partition_point(|locator| locator.range_start <= index);
    let locator = *locators.get(pos.checked_sub(1)?)?;
    (index < locator.range_end()).then_some(locator)
}

fn index_cluster(columns: &mut [ColumnIndex], cluster_id: u64, cluster: &ClusterFooter) {
    let first_starts: Vec<Option<u64>> = cluster
        .pages_per_column
        .iter()
        .map(|pages| pages.range_starts.first().copied())
        .collect();
    for (id, column) in columns.iter_mut().enumerate() {
        let starts = &cluster.pages_per_column[id].range_starts;
        let Some(self_offset) = first_starts[id] else {
            continue;
        };
        let pointee_offset = column
            .pointee
            .and_then(|pointee| first_starts[pointee as usize]);
        column
            .locators
            .extend(starts.iter().enumerate().map(|(page, start)| PageLocator {
                range_start: *start,
                n_elements: 0,
                cluster_id,
                page_in_cluster: page as u64,
                self_offset,
                pointee_offset,
            }));
    }
}

/// Fills element counts from the gaps between range starts and checks the pages tile the column.
fn size_locators(id: ColumnId, column: &mut ColumnIndex) -> Result<()> {
    let corrupt = |locator: Option<&PageLocator>, message: String| {
        let err = Error::new(ErrorKind::Corrupt)
            .with_message(message)
            .with_column(id);
        match locator {
            Some(locator) => err
                .with_cluster(locator.cluster_id)
                .with_page(locator.page_in_cluster),
            None => err,
        }
    };
    let Some(first) = column.locators.first() else {
        if column.n_elements != 0 {
            return Err(corrupt(
                None,
                format!("{} elements but no pages", column.n_elements),
            ));
        }
        return Ok(());
    };
    if first.range_start != 0 {
        return Err(corrupt(
            Some(first),
            format!("first page starts at {}", first.range_start),
        ));
    }
    let ends: Vec<u64> = column
        .locators
        .iter()
        .skip(1)
        .map(|locator| locator.range_start)
        .chain(std::iter::once(column.n_elements))
        .collect();
    for (locator, end) in column.locators.iter_mut().zip(ends) {
        if end <= locator.range_start {
            return Err(corrupt(
                Some(locator),
                format!(
                    "page starting at {} ends at {end}; pages must be non-empty and ordered",
                    locator.range_start
                ),
            ));
        }
        locator.n_elements = end - locator.range_start;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{find_locator, PageLocator, PageSource, SourceOptions};
    use crate::core::descriptor::{ColumnModel, ColumnType, FieldDescriptor};
    use crate::core::error::ErrorKind;
    use crate::core::sink::{PageSink, SinkOptions};
    use crate::core::store::MemStore;
    use std::sync::Arc;

    fn locators(starts: &[u64], total: u64) -> Vec<PageLocator> {
        let mut out: Vec<PageLocator> = starts
            .iter()
            .enumerate()
            .map(|(page, start)| PageLocator {
                range_start: *start,
                n_elements: 0,
                cluster_id: 0,
                page_in_cluster: page as u64,
                self_offset: 0,
                pointee_offset: None,
            })
            .collect();
        let mut ends: Vec<u64> = starts[1..].to_vec();
        ends.push(total);
        for (locator, end) in out.iter_mut().zip(ends) {
            locator.n_elements = end - locator.range_start;
        }
        out
    }

    #[test]
    fn binary_search_prefers_the_page_starting_at_index() {
        let pages = locators(&[0, 4, 8, 9], 12);
        for (index, expected) in [(0, 0), (3, 0), (4, 1), (7, 1), (8, 2), (9, 3), (11, 3)] {
            let found = find_locator(&pages, index).expect("covered");
            assert_eq!(found.page_in_cluster, expected, "index {index}");
        }
        assert!(find_locator(&pages, 12).is_none());
        assert!(find_locator(&[], 0).is_none());
    }

    fn write_bytes(store: &Arc<MemStore>, values: &[u8]) {
        let mut sink = PageSink::new(
            store.clone(),
            "d",
            SinkOptions::new().with_elements_per_page(3),
        )
        .expect("sink");
        let handle = sink
            .add_column(&ColumnModel::new("b", ColumnType::Byte, false))
            .expect("add");
        sink.create(vec![FieldDescriptor::new("b", "std::uint8_t")], &mut [])
            .expect("create");
        for (chunk_index, chunk) in values.chunks(3).enumerate() {
            let mut page = sink.reserve_page(handle, 0).expect("reserve");
            page.reset((chunk_index * 3) as u64);
            page.try_grow(chunk.len()).expect("grow").copy_from_slice(chunk);
            sink.commit_page(handle, &page).expect("commit");
        }
        sink.commit_cluster(values.len() as u64).expect("cluster");
        sink.commit_dataset().expect("dataset");
    }

    #[test]
    fn populated_pages_cover_every_index_and_are_pooled() {
        let store = Arc::new(MemStore::new());
        let values: Vec<u8> = (0..10).collect();
        write_bytes(&store, &values);

        let source = PageSource::attach(store.clone(), "d", SourceOptions::default())
            .expect("attach");
        let handle = source
            .add_column(&ColumnModel::new("b", ColumnType::Byte, false))
            .expect("column");
        assert_eq!(source.page_locators(handle).expect("locators").len(), 4);
        for index in 0..10u64 {
            let page = source.populate_page(handle, index).expect("page");
            assert!(page.contains(index));
            assert_eq!(page.element(index), Some(&[index as u8][..]));
            source.release_page(page);
        }
        assert_eq!(source.page_fetches(), 4);
        let err = source.populate_page(handle, 10).expect_err("out of range");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn column_lookup_checks_name_and_type() {
        let store = Arc::new(MemStore::new());
        write_bytes(&store, &[1, 2]);
        let source = PageSource::attach(store.clone(), "d", SourceOptions::default())
            .expect("attach");
        let err = source
            .add_column(&ColumnModel::new("missing", ColumnType::Byte, false))
            .expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = source
            .add_column(&ColumnModel::new("b", ColumnType::Int16, false))
            .expect_err("type");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(source.root_fields().count(), 1);
    }

    #[test]
    fn missing_dataset_is_not_found() {
        let store = Arc::new(MemStore::new());
        let err = PageSource::attach(store, "nothing", SourceOptions::default())
            .expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.key(), Some("nothing/NTH"));
    }
}
