//! Purpose: Fixed-capacity element buffers for one column and their index windows.
//! Exports: `Page`, `PageMemory`, `ClusterInfo`.
//! Role: Write buffers for the sink path, immutable record views for the source path.
//! Invariants: `n_elements <= capacity`; views never expose bytes outside the occupied window.
//! Invariants: Pages never reallocate; a failed `try_grow` leaves the page untouched.
use bytes::Bytes;

use crate::core::descriptor::ColumnId;

/// Where a page's bytes live and how they are released.
#[derive(Debug)]
pub enum PageMemory {
    /// Owned write buffer, freed with the page.
    Heap(Vec<u8>),
    /// Content slice of a fetched record; the record is released with the last view.
    Record(Bytes),
}

impl PageMemory {
    fn as_slice(&self) -> &[u8] {
        match self {
            PageMemory::Heap(buf) => buf,
            PageMemory::Record(bytes) => bytes,
        }
    }
}

/// Cluster relation of a populated read page.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ClusterInfo {
    pub cluster_id: u64,
    /// Global index of this column's first element in the cluster.
    pub self_offset: u64,
    /// Global index of the pointee column's first element in the cluster, if it has any.
    pub pointee_offset: Option<u64>,
}

#[derive(Debug)]
pub struct Page {
    column_id: ColumnId,
    memory: PageMemory,
    element_size: usize,
    capacity: usize,
    n_elements: usize,
    range_first: u64,
    cluster_info: ClusterInfo,
}

impl Page {
    pub(crate) fn new(
        column_id: ColumnId,
        memory: PageMemory,
        element_size: usize,
        capacity: usize,
    ) -> Self {
        debug_assert!(element_size > 0);
        debug_assert!(memory.as_slice().len() >= element_size * capacity);
        Self {
            column_id,
            memory,
            element_size,
            capacity,
            n_elements: 0,
            range_first: 0,
            cluster_info: ClusterInfo::default(),
        }
    }

    pub fn column_id(&self) -> ColumnId {
        self.column_id
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn n_elements(&self) -> usize {
        self.n_elements
    }

    pub fn is_empty(&self) -> bool {
        self.n_elements == 0
    }

    pub fn range_first(&self) -> u64 {
        self.range_first
    }

    /// One past the last global index held by this page.
    pub fn range_end(&self) -> u64 {
        self.range_first + self.n_elements as u64
    }

    pub fn cluster_info(&self) -> ClusterInfo {
        self.cluster_info
    }

    pub fn is_record_backed(&self) -> bool {
        matches!(self.memory, PageMemory::Record(_))
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.range_first && index < self.range_end()
    }

    /// Reserves room for `n` more elements and returns their bytes.
    pub fn try_grow(&mut self, n: usize) -> Option<&mut [u8]> {
        let PageMemory::Heap(buf) = &mut self.memory else {
            return None;
        };
        let new_len = self.n_elements.checked_add(n)?;
        if new_len > self.capacity {
            return None;
        }
        let start = self.n_elements * self.element_size;
        let end = new_len * self.element_size;
        self.n_elements = new_len;
        Some(&mut buf[start..end])
    }

    /// Marks a freshly populated page as fully occupied.
    pub(crate) fn fill(&mut self) {
        self.n_elements = self.capacity;
    }

    pub fn set_window(&mut self, range_first: u64, cluster_info: ClusterInfo) {
        self.range_first = range_first;
        self.cluster_info = cluster_info;
    }

    /// Empties a write page and moves its window to `range_first`.
    pub fn reset(&mut self, range_first: u64) {
        self.n_elements = 0;
        self.range_first = range_first;
    }

    /// Occupied bytes in element order.
    pub fn bytes(&self) -> &[u8] {
        &self.memory.as_slice()[..self.n_elements * self.element_size]
    }

    /// Bytes of `count` elements starting at global `index`, if all are inside the page.
    pub fn slice(&self, index: u64, count: usize) -> Option<&[u8]> {
        if count == 0 || !self.contains(index) {
            return None;
        }
        let first = (index - self.range_first) as usize;
        let last = first.checked_add(count)?;
        if last > self.n_elements {
            return None;
        }
        Some(&self.bytes()[first * self.element_size..last * self.element_size])
    }

    pub fn element(&self, index: u64) -> Option<&[u8]> {
        self.slice(index, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::{ClusterInfo, Page, PageMemory};
    use bytes::Bytes;

    fn heap_page(capacity: usize) -> Page {
        Page::new(7, PageMemory::Heap(vec![0u8; capacity * 4]), 4, capacity)
    }

    #[test]
    fn try_grow_is_all_or_nothing() {
        let mut page = heap_page(4);
        page.try_grow(3).expect("fits").fill(0xAA);
        assert_eq!(page.n_elements(), 3);
        assert!(page.try_grow(2).is_none());
        assert_eq!(page.n_elements(), 3);
        assert!(page.try_grow(1).is_some());
        assert!(page.try_grow(1).is_none());
        assert_eq!(&page.bytes()[..12], &[0xAA; 12]);
    }

    #[test]
    fn contains_tracks_occupied_window_only() {
        let mut page = heap_page(8);
        page.reset(100);
        assert!(!page.contains(100));
        page.try_grow(2).expect("fits");
        assert!(!page.contains(99));
        assert!(page.contains(100));
        assert!(page.contains(101));
        assert!(!page.contains(102));
        assert!(page.element(102).is_none());
        assert_eq!(page.slice(100, 2).map(<[u8]>::len), Some(8));
        assert!(page.slice(101, 2).is_none());
    }

    #[test]
    fn record_pages_never_grow() {
        let mut page = Page::new(1, PageMemory::Record(Bytes::from(vec![1u8; 16])), 8, 2);
        page.fill();
        page.set_window(
            40,
            ClusterInfo {
                cluster_id: 2,
                self_offset: 40,
                pointee_offset: None,
            },
        );
        assert!(page.is_record_backed());
        assert!(page.try_grow(1).is_none());
        assert!(page.contains(41));
        assert_eq!(page.cluster_info().cluster_id, 2);
        assert_eq!(page.range_end(), 42);
    }
}
