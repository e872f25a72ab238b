//! Purpose: Storage-backed typed array with one write page and one cached read page.
//! Exports: `Column`, `ConnectColumns`, `CollectionInfo`.
//! Role: The element-level API; turns appends into page commits and reads into page lookups.
//! Invariants: Appends are monotonic; the head page always starts at the committed element count.
//! Invariants: Reads beyond `n_elements` fail with `Usage` instead of touching storage.
use std::borrow::Cow;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::core::descriptor::{ColumnId, ColumnModel};
use crate::core::element::{ClusterSize, Element};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::page::Page;
use crate::core::sink::{ColumnHandle, PageSink};
use crate::core::source::PageSource;

/// Participant in `PageSink::create` and source attachment.
pub trait ConnectColumns {
    fn connect_sink(&mut self, sink: &mut PageSink) -> Result<()>;

    fn connect_source(&mut self, source: &PageSource) -> Result<()>;
}

/// Start (pointee index) and length of one variable-length collection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CollectionInfo {
    pub start: u64,
    pub size: u64,
}

#[derive(Debug)]
pub struct Column<T: Element> {
    model: ColumnModel,
    head_page: Option<Page>,
    current_page: Option<Arc<Page>>,
    n_elements: u64,
    handle_sink: Option<ColumnHandle>,
    handle_source: Option<ColumnHandle>,
    _element: PhantomData<T>,
}

impl<T: Element> Column<T> {
    pub fn new(name: impl Into<String>, is_sorted: bool) -> Self {
        Self::from_model(ColumnModel::new(name, T::COLUMN_TYPE, is_sorted))
    }

    /// `model`'s column type is replaced by `T`'s.
    pub fn from_model(model: ColumnModel) -> Self {
        let mut typed = ColumnModel::new(model.name(), T::COLUMN_TYPE, model.is_sorted());
        typed.set_offset_column(model.offset_column().map(str::to_string));
        Self {
            model: typed,
            head_page: None,
            current_page: None,
            n_elements: 0,
            handle_sink: None,
            handle_source: None,
            _element: PhantomData,
        }
    }

    pub fn with_offset_column(mut self, offset_column: impl Into<String>) -> Self {
        self.set_offset_column(offset_column);
        self
    }

    pub fn set_offset_column(&mut self, offset_column: impl Into<String>) {
        self.model.set_offset_column(Some(offset_column.into()));
    }

    pub fn model(&self) -> &ColumnModel {
        &self.model
    }

    pub fn n_elements(&self) -> u64 {
        self.n_elements
    }

    pub fn column_id_source(&self) -> Option<ColumnId> {
        self.handle_source.map(|handle| handle.id())
    }

    pub fn head_page(&self) -> Option<&Page> {
        self.head_page.as_ref()
    }

    pub fn current_page(&self) -> Option<&Arc<Page>> {
        self.current_page.as_ref()
    }

    pub fn append(&mut self, sink: &mut PageSink, element: &T) -> Result<()> {
        if self.try_append(element)? {
            self.n_elements += 1;
            return Ok(());
        }
        self.flush(sink)?;
        if !self.try_append(element)? {
            return Err(Error::new(ErrorKind::Capacity)
                .with_message(format!(
                    "page of column '{}' cannot hold a single element",
                    self.model.name()
                ))
                .with_hint("Use a positive elements-per-page setting."));
        }
        self.n_elements += 1;
        Ok(())
    }

    /// Appends `elements` in order, in one page when they fit.
    pub fn append_v(&mut self, sink: &mut PageSink, elements: &[T]) -> Result<()> {
        if elements.is_empty() {
            return Ok(());
        }
        let head = self.head_mut()?;
        if let Some(dst) = head.try_grow(elements.len()) {
            for (element, chunk) in elements.iter().zip(dst.chunks_exact_mut(T::SIZE)) {
                element.serialize(chunk);
            }
            self.n_elements += elements.len() as u64;
            return Ok(());
        }
        for element in elements {
            self.append(sink, element)?;
        }
        Ok(())
    }

    /// Commits a non-empty head page and starts a fresh one at `n_elements`.
    pub fn flush(&mut self, sink: &mut PageSink) -> Result<()> {
        let handle = self.sink_handle()?;
        let n_elements = self.n_elements;
        let head = self.head_mut()?;
        if head.is_empty() {
            return Ok(());
        }
        sink.commit_page(handle, head)?;
        head.reset(n_elements);
        Ok(())
    }

    pub fn read(&mut self, source: &PageSource, index: u64) -> Result<T> {
        let page = self.map_page(source, index)?;
        let bytes = element_bytes(page, index)?;
        Ok(T::deserialize(bytes))
    }

    /// `count` elements starting at `index`, crossing page boundaries as needed.
    pub fn read_v(&mut self, source: &PageSource, index: u64, count: u64) -> Result<Vec<T>> {
        self.check_range(index, count)?;
        let mut out = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
        let mut next = index;
        let end = index + count;
        while next < end {
            let page = self.map_page(source, next)?;
            let take = (page.range_end() - next).min(end - next);
            let bytes = page.slice(next, take as usize).ok_or_else(|| {
                Error::new(ErrorKind::Internal)
                    .with_message("page window does not cover mapped range")
                    .with_column(page.column_id())
            })?;
            out.extend(bytes.chunks_exact(T::SIZE).map(T::deserialize));
            next += take;
        }
        Ok(out)
    }

    /// Borrows the element in place when its bytes can be viewed as `T`, else reads a copy.
    pub fn map(&mut self, source: &PageSource, index: u64) -> Result<Cow<'_, T>> {
        let page = self.map_page(source, index)?;
        let bytes = element_bytes(page, index)?;
        Ok(match T::try_map(bytes) {
            Some(element) => Cow::Borrowed(element),
            None => Cow::Owned(T::deserialize(bytes)),
        })
    }

    /// Zero-copy view of `count` elements, or `None` when they span pages or cannot be mapped.
    pub fn map_v(&mut self, source: &PageSource, index: u64, count: u64) -> Result<Option<&[T]>> {
        self.check_range(index, count)?;
        if count == 0 {
            return Ok(Some(&[]));
        }
        if !T::MAPPABLE {
            return Ok(None);
        }
        let Ok(count) = usize::try_from(count) else {
            return Ok(None);
        };
        let page = self.map_page(source, index)?;
        Ok(page.slice(index, count).and_then(T::try_map_slice))
    }

    /// Makes the current page the one covering `index`.
    fn map_page(&mut self, source: &PageSource, index: u64) -> Result<&Page> {
        let covered = self
            .current_page
            .as_ref()
            .is_some_and(|page| page.contains(index));
        if !covered {
            self.check_range(index, 1)?;
            let handle = self.source_handle()?;
            let page = source.populate_page(handle, index)?;
            if let Some(previous) = self.current_page.replace(page) {
                source.release_page(previous);
            }
        }
        self.current_page.as_deref().ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("current page missing after mapping")
        })
    }

    fn try_append(&mut self, element: &T) -> Result<bool> {
        match self.head_mut()?.try_grow(1) {
            Some(dst) => {
                element.serialize(dst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn head_mut(&mut self) -> Result<&mut Page> {
        let model = &self.model;
        self.head_page.as_mut().ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("column '{}' is not connected to a sink", model.name()))
        })
    }

    fn sink_handle(&self) -> Result<ColumnHandle> {
        self.handle_sink.ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message(format!(
                "column '{}' is not connected to a sink",
                self.model.name()
            ))
        })
    }

    fn source_handle(&self) -> Result<ColumnHandle> {
        self.handle_source.ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message(format!(
                "column '{}' is not connected to a source",
                self.model.name()
            ))
        })
    }

    fn check_range(&self, index: u64, count: u64) -> Result<()> {
        let in_range = index
            .checked_add(count)
            .is_some_and(|end| end <= self.n_elements);
        if in_range {
            return Ok(());
        }
        let err = Error::new(ErrorKind::Usage).with_message(format!(
            "range {index}+{count} out of bounds for column '{}' ({} elements)",
            self.model.name(),
            self.n_elements
        ));
        Err(match self.handle_source {
            Some(handle) => err.with_column(handle.id()),
            None => err,
        })
    }
}

impl Column<ClusterSize> {
    /// Collection of entry `index` in the pointee column of this offset column.
    pub fn collection_info(&mut self, source: &PageSource, index: u64) -> Result<CollectionInfo> {
        let handle = self.source_handle()?;
        if source.pointee(handle)?.is_none() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "no column uses '{}' as its offset column",
                    self.model.name()
                ))
                .with_column(handle.id()));
        }
        let page = self.map_page(source, index)?;
        let cluster = page.cluster_info();
        let idx_end = u64::from(ClusterSize::deserialize(element_bytes(page, index)?));
        let idx_start = if index == 0 || index == cluster.self_offset {
            0
        } else {
            u64::from(self.read(source, index - 1)?)
        };
        let corrupt = |message: String| {
            Error::new(ErrorKind::Corrupt)
                .with_message(message)
                .with_column(handle.id())
                .with_cluster(cluster.cluster_id)
        };
        let size = idx_end.checked_sub(idx_start).ok_or_else(|| {
            corrupt(format!(
                "offsets decrease at index {index}: {idx_start} then {idx_end}"
            ))
        })?;
        let start = match cluster.pointee_offset {
            Some(pointee_offset) => pointee_offset + idx_start,
            None if size == 0 => idx_start,
            None => {
                return Err(corrupt(format!(
                    "collection {index} has {size} elements but the pointee has none in this cluster"
                )));
            }
        };
        Ok(CollectionInfo { start, size })
    }
}

impl<T: Element> ConnectColumns for Column<T> {
    fn connect_sink(&mut self, sink: &mut PageSink) -> Result<()> {
        let handle = sink.add_column(&self.model)?;
        let head = sink.reserve_page(handle, 0)?;
        if let Some(previous) = self.head_page.replace(head) {
            sink.release_page(previous);
        }
        self.handle_sink = Some(handle);
        self.n_elements = 0;
        Ok(())
    }

    fn connect_source(&mut self, source: &PageSource) -> Result<()> {
        let handle = source.add_column(&self.model)?;
        let stored = source.column_model(handle)?;
        self.model
            .set_offset_column(stored.offset_column().map(str::to_string));
        self.n_elements = source.n_elements(handle)?;
        if let Some(previous) = self.current_page.take() {
            source.release_page(previous);
        }
        self.handle_source = Some(handle);
        Ok(())
    }
}

fn element_bytes(page: &Page, index: u64) -> Result<&[u8]> {
    page.element(index).ok_or_else(|| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("index {index} outside the mapped page"))
            .with_column(page.column_id())
    })
}

#[cfg(test)]
mod tests {
    use super::{Column, ConnectColumns};
    use crate::core::element::ClusterSize;
    use crate::core::error::ErrorKind;
    use crate::core::sink::{PageSink, SinkOptions};
    use crate::core::source::{PageSource, SourceOptions};
    use crate::core::store::MemStore;
    use std::borrow::Cow;
    use std::sync::Arc;

    fn sink(store: &Arc<MemStore>, per_page: usize) -> PageSink {
        PageSink::new(
            store.clone(),
            "t",
            SinkOptions::new().with_elements_per_page(per_page),
        )
        .expect("sink")
    }

    #[test]
    fn appends_roll_over_full_pages() {
        let store = Arc::new(MemStore::new());
        let mut sink = sink(&store, 4);
        let mut column = Column::<i32>::new("x", false);
        sink.create(Vec::new(), &mut [&mut column]).expect("create");
        for value in 0..10 {
            column.append(&mut sink, &value).expect("append");
        }
        assert_eq!(column.n_elements(), 10);
        assert_eq!(sink.n_elements(sink_handle(&sink)).expect("count"), 8);
        column.flush(&mut sink).expect("flush");
        column.flush(&mut sink).expect("second flush is a no-op");
        assert_eq!(column.head_page().expect("head").range_first(), 10);
        assert!(column.head_page().expect("head").is_empty());
    }

    fn sink_handle(sink: &PageSink) -> crate::core::sink::ColumnHandle {
        crate::core::sink::ColumnHandle {
            id: 0,
            column_type: sink.columns()[0].column_type(),
        }
    }

    #[test]
    fn unconnected_columns_report_usage_errors() {
        let store = Arc::new(MemStore::new());
        let mut sink = sink(&store, 4);
        let mut column = Column::<f32>::new("x", false);
        let err = column.append(&mut sink, &1.0).expect_err("no sink");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn map_borrows_and_reads_agree() {
        let store = Arc::new(MemStore::new());
        let mut sink = sink(&store, 3);
        let mut column = Column::<f64>::new("pt", false);
        let mut flags = Column::<bool>::new("ok", false);
        sink.create(Vec::new(), &mut [&mut column, &mut flags])
            .expect("create");
        column
            .append_v(&mut sink, &[0.5, 1.5, 2.5, 3.5, 4.5])
            .expect("append_v");
        for i in 0..5 {
            flags.append(&mut sink, &(i % 2 == 0)).expect("append");
        }
        column.flush(&mut sink).expect("flush");
        flags.flush(&mut sink).expect("flush");
        sink.commit_cluster(5).expect("cluster");
        sink.commit_dataset().expect("dataset");

        let source = PageSource::attach(store.clone(), "t", SourceOptions::default())
            .expect("attach");
        let mut column = Column::<f64>::new("pt", false);
        column.connect_source(&source).expect("connect");
        let mut flags = Column::<bool>::new("ok", false);
        flags.connect_source(&source).expect("connect");

        assert_eq!(column.read(&source, 4).expect("read"), 4.5);
        let mapped = column.map(&source, 1).expect("map");
        if cfg!(target_endian = "little") {
            assert!(matches!(mapped, Cow::Borrowed(_)));
        }
        assert_eq!(*mapped, 1.5);
        assert!(matches!(flags.map(&source, 2).expect("map"), Cow::Owned(true)));
        assert_eq!(flags.map_v(&source, 0, 2).expect("map_v"), None);
        assert_eq!(
            column.read_v(&source, 1, 4).expect("read_v"),
            vec![1.5, 2.5, 3.5, 4.5]
        );

        let err = column.read(&source, 5).expect_err("past end");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn collection_info_requires_a_pointee() {
        let store = Arc::new(MemStore::new());
        let mut sink = sink(&store, 8);
        let mut offsets = Column::<ClusterSize>::new("n", false);
        sink.create(Vec::new(), &mut [&mut offsets]).expect("create");
        offsets.append(&mut sink, &ClusterSize(0)).expect("append");
        offsets.flush(&mut sink).expect("flush");
        sink.commit_cluster(1).expect("cluster");
        sink.commit_dataset().expect("dataset");

        let source = PageSource::attach(store.clone(), "t", SourceOptions::default())
            .expect("attach");
        let mut offsets = Column::<ClusterSize>::new("n", false);
        offsets.connect_source(&source).expect("connect");
        let err = offsets.collection_info(&source, 0).expect_err("no pointee");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
