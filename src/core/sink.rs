//! Purpose: Write side of page storage: header, page payloads, cluster footers, dataset footer.
//! Exports: `PageSink`, `SinkOptions`, `ColumnHandle`.
//! Role: Persists what columns flush; owns per-cluster page trackers.
//! Invariants: Pages committed after the last `commit_cluster` are never referenced by a footer.
//! Invariants: Each column's committed pages tile `[0, n_elements)` in order.
use std::collections::HashSet;
use std::sync::Arc;

use crate::core::allocator::PageAllocator;
use crate::core::column::ConnectColumns;
use crate::core::descriptor::{
    page_payload_encode, ClusterFooter, ColumnId, ColumnModel, ColumnType, DatasetFooter,
    DatasetHeader, FieldDescriptor,
};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::format::DatasetKeys;
use crate::core::page::Page;
use crate::core::store::RecordStore;

pub const DEFAULT_ELEMENTS_PER_PAGE: usize = 10_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SinkOptions {
    pub elements_per_page: usize,
}

impl SinkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_elements_per_page(mut self, elements_per_page: usize) -> Self {
        self.elements_per_page = elements_per_page;
        self
    }
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            elements_per_page: DEFAULT_ELEMENTS_PER_PAGE,
        }
    }
}

/// Stable per-dataset column id handed out by a sink or source.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ColumnHandle {
    pub(crate) id: ColumnId,
    pub(crate) column_type: ColumnType,
}

impl ColumnHandle {
    pub fn id(&self) -> ColumnId {
        self.id
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SinkState {
    Open,
    Created,
    Finished,
}

pub struct PageSink {
    store: Arc<dyn RecordStore>,
    dataset: String,
    keys: DatasetKeys,
    options: SinkOptions,
    state: SinkState,
    columns: Vec<ColumnModel>,
    cluster: ClusterFooter,
    n_clusters: u64,
    n_entries: u64,
    n_elements: Vec<u64>,
    sealed_elements: Vec<u64>,
}

impl PageSink {
    pub fn new(store: Arc<dyn RecordStore>, dataset: &str, options: SinkOptions) -> Result<Self> {
        validate_dataset_name(dataset)?;
        if options.elements_per_page == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("elements per page must be positive"));
        }
        Ok(Self {
            store,
            dataset: dataset.to_string(),
            keys: DatasetKeys::new(dataset),
            options,
            state: SinkState::Open,
            columns: Vec::new(),
            cluster: ClusterFooter::default(),
            n_clusters: 0,
            n_entries: 0,
            n_elements: Vec::new(),
            sealed_elements: Vec::new(),
        })
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn options(&self) -> SinkOptions {
        self.options
    }

    /// Registers a column; only allowed before `create` persists the header.
    pub fn add_column(&mut self, model: &ColumnModel) -> Result<ColumnHandle> {
        if self.state != SinkState::Open {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("cannot add column '{}' after create", model.name())));
        }
        if model.name().is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("column name is empty"));
        }
        if self.columns.iter().any(|column| column.name() == model.name()) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("duplicate column name '{}'", model.name())));
        }
        let id = ColumnId::try_from(self.columns.len())
            .map_err(|_| Error::new(ErrorKind::Capacity).with_message("too many columns"))?;
        self.columns.push(model.clone());
        Ok(ColumnHandle {
            id,
            column_type: model.column_type(),
        })
    }

    /// Connects `columns`, then persists the header once.
    pub fn create(
        &mut self,
        fields: Vec<FieldDescriptor>,
        columns: &mut [&mut dyn ConnectColumns],
    ) -> Result<()> {
        if self.state != SinkState::Open {
            return Err(Error::new(ErrorKind::Usage).with_message("dataset already created"));
        }
        for column in columns.iter_mut() {
            column.connect_sink(self)?;
        }
        self.check_offset_links()?;
        self.check_fields(&fields)?;

        let header = DatasetHeader {
            fields,
            columns: self.columns.clone(),
        };
        let key = self.keys.header();
        self.store
            .put(&key, &header.encode())
            .map_err(|err| err.with_key(key))?;

        self.cluster = ClusterFooter::with_columns(self.columns.len());
        self.n_elements = vec![0; self.columns.len()];
        self.sealed_elements = vec![0; self.columns.len()];
        self.state = SinkState::Created;
        tracing::debug!(
            dataset = %self.dataset,
            columns = self.columns.len(),
            "dataset header written"
        );
        Ok(())
    }

    /// Persists a full or flushed head page as the next page of its column.
    pub fn commit_page(&mut self, handle: ColumnHandle, page: &Page) -> Result<()> {
        self.require_state(SinkState::Created, "commit a page")?;
        let column = self.column_index(handle)?;
        if page.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("refusing to commit an empty page")
                .with_column(handle.id));
        }
        if page.element_size() != self.columns[column].element_size() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("page element size does not match column type")
                .with_column(handle.id));
        }
        if page.range_first() != self.n_elements[column] {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "page starts at {} but column has {} committed elements",
                    page.range_first(),
                    self.n_elements[column]
                ))
                .with_column(handle.id));
        }

        let ranges = &mut self.cluster.pages_per_column[column];
        let page_in_cluster = ranges.range_starts.len() as u64;
        let key = self.keys.page(self.n_clusters, handle.id, page_in_cluster);
        self.store
            .put(&key, &page_payload_encode(page.bytes()))
            .map_err(|err| {
                err.with_key(key)
                    .with_column(handle.id)
                    .with_cluster(self.n_clusters)
                    .with_page(page_in_cluster)
            })?;
        ranges.range_starts.push(page.range_first());
        self.n_elements[column] += page.n_elements() as u64;
        tracing::trace!(
            column = handle.id,
            cluster = self.n_clusters,
            page = page_in_cluster,
            elements = page.n_elements(),
            "page committed"
        );
        Ok(())
    }

    /// Seals the pages committed since the previous cluster; `total_entries` is cumulative.
    pub fn commit_cluster(&mut self, total_entries: u64) -> Result<()> {
        self.require_state(SinkState::Created, "commit a cluster")?;
        if total_entries < self.n_entries {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "entry count went backwards: {total_entries} < {}",
                    self.n_entries
                ))
                .with_cluster(self.n_clusters));
        }
        let mut footer = std::mem::replace(
            &mut self.cluster,
            ClusterFooter::with_columns(self.columns.len()),
        );
        footer.entry_range_start = self.n_entries;
        footer.n_entries = total_entries - self.n_entries;
        let key = self.keys.cluster_footer(self.n_clusters);
        if let Err(err) = self.store.put(&key, &footer.encode()) {
            self.cluster = footer;
            return Err(err.with_key(key).with_cluster(self.n_clusters));
        }
        tracing::debug!(
            dataset = %self.dataset,
            cluster = self.n_clusters,
            entries = footer.n_entries,
            "cluster committed"
        );
        self.n_clusters += 1;
        self.n_entries = total_entries;
        self.sealed_elements.copy_from_slice(&self.n_elements);
        Ok(())
    }

    /// Persists the dataset footer; the dataset is readable afterwards.
    pub fn commit_dataset(&mut self) -> Result<()> {
        self.require_state(SinkState::Created, "commit the dataset")?;
        let unsealed: usize = self
            .cluster
            .pages_per_column
            .iter()
            .map(|ranges| ranges.range_starts.len())
            .sum();
        if unsealed > 0 {
            tracing::warn!(
                dataset = %self.dataset,
                pages = unsealed,
                "pages committed after the last cluster are dropped"
            );
        }
        let footer = DatasetFooter {
            n_clusters: self.n_clusters,
            n_entries: self.n_entries,
            n_elements_per_column: self.sealed_elements.clone(),
        };
        let key = self.keys.footer();
        self.store
            .put(&key, &footer.encode())
            .map_err(|err| err.with_key(key))?;
        self.state = SinkState::Finished;
        tracing::debug!(
            dataset = %self.dataset,
            clusters = self.n_clusters,
            entries = self.n_entries,
            "dataset committed"
        );
        Ok(())
    }

    /// New write page for `handle`; `n_elements == 0` uses the configured page size.
    pub fn reserve_page(&self, handle: ColumnHandle, n_elements: usize) -> Result<Page> {
        self.column_index(handle)?;
        let n_elements = if n_elements == 0 {
            self.options.elements_per_page
        } else {
            n_elements
        };
        Ok(PageAllocator::new_heap_page(
            handle.id,
            handle.column_type.element_size(),
            n_elements,
        ))
    }

    pub fn release_page(&self, page: Page) {
        PageAllocator::strategy_of(&page).delete_page(page);
    }

    pub fn n_clusters(&self) -> u64 {
        self.n_clusters
    }

    pub fn n_entries(&self) -> u64 {
        self.n_entries
    }

    /// Committed elements of a column, sealed or not.
    pub fn n_elements(&self, handle: ColumnHandle) -> Result<u64> {
        let column = self.column_index(handle)?;
        Ok(self.n_elements.get(column).copied().unwrap_or(0))
    }

    pub fn columns(&self) -> &[ColumnModel] {
        &self.columns
    }

    fn require_state(&self, expected: SinkState, action: &str) -> Result<()> {
        if self.state == expected {
            return Ok(());
        }
        let message = match self.state {
            SinkState::Open => format!("cannot {action} before create"),
            SinkState::Finished => format!("cannot {action} after the dataset was committed"),
            SinkState::Created => format!("cannot {action} while the dataset is open"),
        };
        Err(Error::new(ErrorKind::Usage).with_message(message))
    }

    fn column_index(&self, handle: ColumnHandle) -> Result<usize> {
        let index = handle.id as usize;
        match self.columns.get(index) {
            Some(model) if model.column_type() == handle.column_type => Ok(index),
            _ => Err(Error::new(ErrorKind::Usage)
                .with_message("unknown column handle")
                .with_column(handle.id)),
        }
    }

    fn check_offset_links(&self) -> Result<()> {
        for (id, model) in self.columns.iter().enumerate() {
            let Some(parent) = model.offset_column() else {
                continue;
            };
            let mut seen = HashSet::from([id]);
            let mut next = Some(parent);
            while let Some(name) = next {
                let Some(pos) = self.columns.iter().position(|column| column.name() == name)
                else {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message(format!(
                            "column '{}' links to unknown offset column '{name}'",
                            model.name()
                        ))
                        .with_column(id as ColumnId));
                };
                if self.columns[pos].column_type() != ColumnType::Index {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message(format!("offset column '{name}' is not an index column"))
                        .with_column(pos as ColumnId));
                }
                if !seen.insert(pos) {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message(format!("offset links of '{}' form a cycle", model.name()))
                        .with_column(id as ColumnId));
                }
                next = self.columns[pos].offset_column();
            }
        }
        Ok(())
    }

    fn check_fields(&self, fields: &[FieldDescriptor]) -> Result<()> {
        let mut names = HashSet::new();
        for field in fields {
            if !names.insert(field.name.as_str()) {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("duplicate field name '{}'", field.name)));
            }
        }
        for field in fields {
            if let Some(parent) = &field.parent {
                if !names.contains(parent.as_str()) {
                    return Err(Error::new(ErrorKind::Usage).with_message(format!(
                        "field '{}' has unknown parent '{parent}'",
                        field.name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PageSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSink")
            .field("dataset", &self.dataset)
            .field("state", &self.state)
            .field("columns", &self.columns.len())
            .field("n_clusters", &self.n_clusters)
            .field("n_entries", &self.n_entries)
            .finish()
    }
}

pub(crate) fn validate_dataset_name(dataset: &str) -> Result<()> {
    if dataset.is_empty() || dataset.contains('/') {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid dataset name '{dataset}'"))
            .with_hint("Dataset names are non-empty and contain no '/'."));
    }
    Ok(())
}
